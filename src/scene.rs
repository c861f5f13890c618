//! Scene renderer seam and the built-in animated demo scene.
//!
//! A [`Scene`] draws into a [`Canvas`] (the driver's framebuffer) once per
//! viewport per frame. The output layer never looks at scene content.

use std::time::Duration;

use crate::geometry::{Rect, Size};

const BYTES_PER_PIXEL: usize = 4;

/// Mutable view of a top-left-origin BGRA framebuffer with a stride of
/// `size.width * 4`.
pub struct Canvas<'a> {
    pixels: &'a mut [u8],
    size: Size,
}

impl<'a> Canvas<'a> {
    /// `pixels` must hold at least `size.bgra_len()` bytes; extra bytes are
    /// ignored.
    pub fn new(pixels: &'a mut [u8], size: Size) -> Self {
        let len = size.bgra_len().min(pixels.len());
        let height = if size.width == 0 {
            0
        } else {
            u32::try_from(len / (size.width as usize * BYTES_PER_PIXEL)).unwrap_or(u32::MAX)
        };
        Self {
            pixels: &mut pixels[..len],
            size: Size::new(size.width, height.min(size.height)),
        }
    }

    #[cfg(test)]
    pub fn size(&self) -> Size {
        self.size
    }

    /// `rect` clipped to the canvas, or `None` if nothing is left.
    pub fn clip(&self, rect: &Rect) -> Option<Rect> {
        let left = i64::from(rect.x).max(0);
        let top = i64::from(rect.y).max(0);
        let right = rect.right().min(i64::from(self.size.width));
        let bottom = rect.bottom().min(i64::from(self.size.height));
        if right <= left || bottom <= top {
            return None;
        }
        Some(Rect::new(
            i32::try_from(left).ok()?,
            i32::try_from(top).ok()?,
            u32::try_from(right - left).ok()?,
            u32::try_from(bottom - top).ok()?,
        ))
    }

    /// One row of pixels inside `rect`, which must already be clipped.
    pub fn row_mut(&mut self, rect: &Rect, row: u32) -> &mut [u8] {
        let stride = self.size.width as usize * BYTES_PER_PIXEL;
        let start = (rect.y as usize + row as usize) * stride + rect.x as usize * BYTES_PER_PIXEL;
        &mut self.pixels[start..start + rect.width as usize * BYTES_PER_PIXEL]
    }

    #[cfg(test)]
    pub fn fill(&mut self, rect: &Rect, bgra: [u8; 4]) {
        let Some(rect) = self.clip(rect) else {
            return;
        };
        for row in 0..rect.height {
            for pixel in self.row_mut(&rect, row).chunks_exact_mut(BYTES_PER_PIXEL) {
                pixel.copy_from_slice(&bgra);
            }
        }
    }
}

/// Per-frame scene update, called once for every viewport.
pub trait Scene {
    /// Draw the scene into `viewport` (framebuffer coordinates). `time` is
    /// the driver's render clock.
    fn render(&mut self, canvas: &mut Canvas<'_>, viewport: &Rect, time: Duration);
}

/// Slowly drifting diagonal gradient. Each viewport gets its own copy of
/// the pattern, so monitor edges are visible.
#[derive(Debug, Clone)]
pub struct GradientScene {
    /// Full colour cycle length.
    period: Duration,
}

impl GradientScene {
    pub fn new(period: Duration) -> Self {
        Self { period }
    }

    fn phase(&self, time: Duration) -> f32 {
        let period = self.period.as_secs_f32();
        if period <= f32::EPSILON {
            return 0.0;
        }
        (time.as_secs_f32() % period) / period
    }
}

impl Default for GradientScene {
    fn default() -> Self {
        Self::new(Duration::from_secs(20))
    }
}

fn channel(value: f32) -> u8 {
    (value.clamp(0.0, 1.0) * 255.0) as u8
}

impl Scene for GradientScene {
    fn render(&mut self, canvas: &mut Canvas<'_>, viewport: &Rect, time: Duration) {
        let Some(area) = canvas.clip(viewport) else {
            return;
        };
        let phase = self.phase(time) * std::f32::consts::TAU;
        let span = (viewport.width + viewport.height).max(1) as f32;
        let x_origin = area.x - viewport.x;
        let y_origin = area.y - viewport.y;

        for row in 0..area.height {
            let y = (y_origin as f32) + row as f32;
            let line = canvas.row_mut(&area, row);
            for (col, pixel) in line.chunks_exact_mut(BYTES_PER_PIXEL).enumerate() {
                let t = (x_origin as f32 + col as f32 + y) / span;
                let angle = t * std::f32::consts::TAU + phase;
                let r = 0.5 + 0.5 * angle.sin();
                let g = 0.5 + 0.5 * (angle + 2.1).sin();
                let b = 0.5 + 0.5 * (angle + 4.2).sin();
                pixel.copy_from_slice(&[channel(b * 0.6), channel(g * 0.4), channel(r * 0.5), 0xff]);
            }
        }
    }
}
