//! Presentation surface — the server pixmap, its graphics context and the
//! in-process BGRA image mirrored into it every frame.
//!
//! The three are allocated together by [`PresentationSurface::allocate`]
//! and only ever released together, so the image can never outlive or
//! disagree in size with the drawable it feeds.

use crate::display::{DisplayError, DisplayServer, RootProperty, Xid};
use crate::geometry::{Rect, Size};

use super::topology::BoundingBox;

/// Depth of the background pixmap.
pub const PIXMAP_DEPTH: u8 = 24;

const BYTES_PER_PIXEL: usize = 4;

/// A top-left-origin BGRA image with a stride of exactly `width * 4`.
#[derive(Debug, Clone)]
pub struct PixelImage {
    size: Size,
    data: Vec<u8>,
}

/// Sizes involved in one readback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadbackRegion {
    pub framebuffer: Size,
    pub full: Size,
    pub read: Size,
}

impl ReadbackRegion {
    pub fn is_partial(&self) -> bool {
        self.read != self.full
    }
}

impl PixelImage {
    pub fn new(size: Size) -> Self {
        Self {
            size,
            data: vec![0; size.bgra_len()],
        }
    }

    pub fn size(&self) -> Size {
        self.size
    }

    pub fn stride(&self) -> usize {
        self.size.width as usize * BYTES_PER_PIXEL
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn rect(&self) -> Rect {
        Rect::new(0, 0, self.size.width, self.size.height)
    }

    /// Fill the image from a framebuffer of size `framebuffer`.
    ///
    /// `read` receives the region to transfer (the framebuffer clipped to
    /// the image), the destination row length in pixels and the whole
    /// buffer. When the region is smaller than the image the buffer is
    /// zeroed first so nothing from an earlier, larger frame survives in
    /// the margins.
    pub fn readback<E>(
        &mut self,
        framebuffer: Size,
        read: impl FnOnce(Size, usize, &mut [u8]) -> Result<(), E>,
    ) -> Result<ReadbackRegion, E> {
        let region = ReadbackRegion {
            framebuffer,
            full: self.size,
            read: framebuffer.min(self.size),
        };

        if region.read.is_empty() {
            return Ok(region);
        }

        if region.is_partial() {
            self.data.fill(0);
        }

        read(region.read, self.size.width as usize, &mut self.data)?;
        Ok(region)
    }
}

/// How to seed a freshly created background pixmap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Seed {
    /// No usable previous background.
    Black,
    /// Copy the previous background's top-left `size`. `fill_first` is set
    /// when the copy does not cover the whole pixmap.
    Preserve {
        source: Xid,
        size: Size,
        fill_first: bool,
    },
}

/// Server pixmap + GC + pixel image, owned as one unit.
#[derive(Debug)]
pub struct PresentationSurface {
    pixmap: Option<Xid>,
    gc: Option<Xid>,
    image: Option<PixelImage>,
    bounds: BoundingBox,
    root: Size,
}

impl PresentationSurface {
    /// Allocate the pixmap (root sized, so unrequested monitors keep their
    /// wallpaper), its GC and the bounding-box sized image, then seed the
    /// pixmap from the previous background.
    ///
    /// On failure everything created so far is released again.
    pub fn allocate<S: DisplayServer>(
        server: &mut S,
        bounds: BoundingBox,
        root: Size,
    ) -> Result<Self, DisplayError> {
        let mut surface = Self {
            pixmap: None,
            gc: None,
            image: None,
            bounds,
            root,
        };

        if let Err(e) = surface.acquire(server) {
            surface.release(Some(server));
            return Err(e);
        }

        tracing::info!(
            pixmap = ?surface.pixmap,
            image = %bounds.size(),
            root = %root,
            "presentation surface allocated"
        );
        Ok(surface)
    }

    fn acquire<S: DisplayServer>(&mut self, server: &mut S) -> Result<(), DisplayError> {
        let pixmap = server.create_pixmap(self.root, PIXMAP_DEPTH)?;
        self.pixmap = Some(pixmap);

        let gc = server.create_gc(pixmap)?;
        self.gc = Some(gc);

        self.image = Some(PixelImage::new(self.bounds.size()));

        let seed = plan_seed(server, self.root)?;
        self.apply_seed(server, seed, pixmap, gc)
    }

    fn apply_seed<S: DisplayServer>(
        &self,
        server: &mut S,
        seed: Seed,
        pixmap: Xid,
        gc: Xid,
    ) -> Result<(), DisplayError> {
        let whole = Rect::new(0, 0, self.root.width, self.root.height);
        match seed {
            Seed::Black => {
                server.fill_rectangle(pixmap, gc, whole)?;
                tracing::info!("previous root pixmap missing or incompatible, filled black");
            }
            Seed::Preserve {
                source,
                size,
                fill_first,
            } => {
                if fill_first {
                    server.fill_rectangle(pixmap, gc, whole)?;
                }
                server.copy_area(source, pixmap, gc, size)?;
                tracing::info!(source, copied = %size, "preserved previous root pixmap");
            }
        }
        Ok(())
    }

    /// Upload the image into the pixmap at the bounding-box offset.
    pub fn present<S: DisplayServer>(&self, server: &mut S) -> Result<(), DisplayError> {
        let (Some(pixmap), Some(gc), Some(image)) = (self.pixmap, self.gc, self.image.as_ref())
        else {
            return Ok(());
        };

        server.put_image(
            pixmap,
            gc,
            PIXMAP_DEPTH,
            image,
            image.rect(),
            self.bounds.offset_x,
            self.bounds.offset_y,
        )
    }

    /// Release image → GC → pixmap. Safe on a partially allocated or
    /// already released surface; pass `None` when the connection is gone
    /// (the server reclaims the resources itself).
    pub fn release<S: DisplayServer>(&mut self, mut server: Option<&mut S>) {
        self.image = None;

        if let Some(gc) = self.gc.take()
            && let Some(server) = server.as_deref_mut()
            && let Err(e) = server.free_gc(gc)
        {
            tracing::debug!(gc, error = %e, "FreeGC failed");
        }

        if let Some(pixmap) = self.pixmap.take()
            && let Some(server) = server.as_deref_mut()
            && let Err(e) = server.free_pixmap(pixmap)
        {
            tracing::debug!(pixmap, error = %e, "FreePixmap failed");
        }
    }

    pub fn pixmap(&self) -> Option<Xid> {
        self.pixmap
    }

    pub fn image(&self) -> Option<&PixelImage> {
        self.image.as_ref()
    }

    pub fn image_mut(&mut self) -> Option<&mut PixelImage> {
        self.image.as_mut()
    }

    pub fn bounds(&self) -> BoundingBox {
        self.bounds
    }

    #[cfg(test)]
    pub fn is_released(&self) -> bool {
        self.pixmap.is_none() && self.gc.is_none() && self.image.is_none()
    }
}

/// Decide how to seed a `target`-sized pixmap from whatever the root
/// properties currently advertise.
fn plan_seed<S: DisplayServer>(server: &mut S, target: Size) -> Result<Seed, DisplayError> {
    let mut previous = None;
    for property in RootProperty::ALL {
        if let Some(pixmap) = server.root_pixmap(property)? {
            previous = Some(pixmap);
            break;
        }
    }

    let Some(source) = previous else {
        return Ok(Seed::Black);
    };

    let info = server.drawable_info(source)?;
    Ok(seed_for(source, info.map(|i| (i.size, i.depth)), server.root_depth(), target))
}

/// Pure part of [`plan_seed`]: `previous` is the old pixmap's size and
/// depth, `None` if the server no longer knows it.
pub fn seed_for(source: Xid, previous: Option<(Size, u8)>, root_depth: u8, target: Size) -> Seed {
    match previous {
        Some((size, depth)) if depth == root_depth && !size.is_empty() => {
            let copy = size.min(target);
            Seed::Preserve {
                source,
                size: copy,
                fill_first: copy != target,
            }
        }
        _ => Seed::Black,
    }
}
