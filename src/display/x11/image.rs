//! Chunked `PutImage` upload shared by the display adapter and the
//! software driver.

use x11rb::connection::Connection;
use x11rb::protocol::xproto::{ConnectionExt as _, Drawable, Gcontext, ImageFormat};

use crate::display::DisplayError;
use crate::geometry::Rect;

/// Fixed part of a `PutImage` request.
const PUT_IMAGE_HEADER: usize = 24;

const BYTES_PER_PIXEL: usize = 4;

/// Source pixels for an upload: 32-bit rows of `stride` bytes starting at
/// the top-left of the image.
pub struct RowSource<'a> {
    pub data: &'a [u8],
    pub stride: usize,
}

/// Upload the `src` rectangle of `source` to `(dst_x, dst_y)` on
/// `drawable`, splitting into as many requests as the server's maximum
/// request length demands.
///
/// `src` must already be clipped to the source image.
#[allow(clippy::too_many_arguments)]
pub fn put_rows<C: Connection>(
    conn: &C,
    drawable: Drawable,
    gc: Gcontext,
    depth: u8,
    source: &RowSource<'_>,
    src: Rect,
    dst_x: i32,
    dst_y: i32,
) -> Result<(), DisplayError> {
    if src.width == 0 || src.height == 0 {
        return Ok(());
    }

    if src.x < 0 || src.y < 0 {
        return Err(DisplayError::Unsupported(format!(
            "image region {src} starts outside the source"
        )));
    }

    let width = to_u16(src.width)?;
    let dst_x = to_i16(dst_x)?;
    let row_bytes = src.width as usize * BYTES_PER_PIXEL;
    let first = src.y as usize * source.stride + src.x as usize * BYTES_PER_PIXEL;
    let rows = src.height as usize;

    let last_end = first + (rows - 1) * source.stride + row_bytes;
    if last_end > source.data.len() {
        return Err(DisplayError::Unsupported(format!(
            "image region {src} exceeds source buffer of {} bytes",
            source.data.len()
        )));
    }

    let budget = conn.maximum_request_bytes().saturating_sub(PUT_IMAGE_HEADER);
    let rows_per_request = (budget / row_bytes).clamp(1, usize::from(u16::MAX));
    let contiguous = source.stride == row_bytes;

    let mut packed = Vec::new();
    let mut row = 0;
    while row < rows {
        let count = rows_per_request.min(rows - row);
        let start = first + row * source.stride;

        let chunk: &[u8] = if contiguous {
            &source.data[start..start + count * row_bytes]
        } else {
            packed.clear();
            for r in 0..count {
                let at = start + r * source.stride;
                packed.extend_from_slice(&source.data[at..at + row_bytes]);
            }
            &packed
        };

        let y = to_i16(dst_y + row as i32)?;
        conn.put_image(
            ImageFormat::Z_PIXMAP,
            drawable,
            gc,
            width,
            count as u16,
            dst_x,
            y,
            0,
            depth,
            chunk,
        )?;

        row += count;
    }

    Ok(())
}

pub fn to_u16(value: u32) -> Result<u16, DisplayError> {
    u16::try_from(value)
        .map_err(|_| DisplayError::Unsupported(format!("dimension {value} exceeds 16 bits")))
}

pub fn to_i16(value: i32) -> Result<i16, DisplayError> {
    i16::try_from(value)
        .map_err(|_| DisplayError::Unsupported(format!("coordinate {value} exceeds 16 bits")))
}
