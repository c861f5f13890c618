//! Root background publisher — makes the surface's pixmap the desktop
//! background and advertises it through the root-pixmap properties.
//!
//! Publishing happens once per surface. Frames after that only change the
//! pixmap's contents and ask the server to repaint the bounding box.

use crate::display::{DisplayError, DisplayServer, RootProperty, Xid};

use super::surface::PresentationSurface;

#[derive(Debug, Default)]
pub struct RootBackgroundPublisher {
    published: Option<Xid>,
}

impl RootBackgroundPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the root background to the surface's pixmap and store its id
    /// in `_XROOTPMAP_ID` and `ESETROOT_PMAP_ID`. A repeat call for the
    /// same pixmap does nothing.
    pub fn publish<S: DisplayServer>(
        &mut self,
        server: &mut S,
        surface: &PresentationSurface,
    ) -> Result<(), DisplayError> {
        let Some(pixmap) = surface.pixmap() else {
            return Ok(());
        };

        if self.published == Some(pixmap) {
            return Ok(());
        }

        server.set_root_background(pixmap)?;
        for property in RootProperty::ALL {
            server.set_root_pixmap(property, pixmap)?;
        }
        server.clear_root_area(surface.bounds().root_rect())?;
        server.flush()?;

        self.published = Some(pixmap);
        tracing::info!(pixmap, "published root background");
        Ok(())
    }

    /// Per-frame redraw hint covering only the bounding box.
    pub fn damage<S: DisplayServer>(
        &self,
        server: &mut S,
        surface: &PresentationSurface,
    ) -> Result<(), DisplayError> {
        if self.published.is_none() {
            return Ok(());
        }
        server.clear_root_area(surface.bounds().root_rect())
    }

    #[cfg(test)]
    pub fn published(&self) -> Option<Xid> {
        self.published
    }
}
