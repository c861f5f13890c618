//! Per-output window layer — one desktop-layer window per requested
//! output, each fed from its slice of the shared pixel image.
//!
//! Used only when the server's region-shaping extension is new enough to
//! make the windows input-transparent; otherwise the shared root pixmap
//! is the only presentation path.

use std::collections::BTreeMap;

use crate::display::{DisplayError, DisplayServer, Xid};
use crate::geometry::Rect;

use super::surface::PixelImage;
use super::topology::Topology;

/// Minimum XFixes major version providing window shape regions.
pub const MIN_REGION_SHAPE_MAJOR: u32 = 2;

/// Presentation strategy, picked once per session from server
/// capabilities.
#[derive(Debug)]
pub enum Presentation {
    /// Root pixmap only.
    SharedDrawable,
    /// Root pixmap plus one window per output.
    PerOutputWindows(PerOutputWindowLayer),
}

impl Presentation {
    /// Pick the strategy for `topology`. Global mode has no named outputs
    /// and always uses the shared drawable.
    pub fn select<S: DisplayServer>(
        server: &mut S,
        topology: &Topology,
    ) -> Result<Presentation, DisplayError> {
        if topology.global {
            return Ok(Presentation::SharedDrawable);
        }

        match server.region_shape_version() {
            Some((major, _)) if major >= MIN_REGION_SHAPE_MAJOR => {}
            version => {
                tracing::info!(
                    version = ?version,
                    "region shaping unavailable, per-output windows disabled"
                );
                return Ok(Presentation::SharedDrawable);
            }
        }

        match PerOutputWindowLayer::activate(server, topology) {
            Ok(layer) => Ok(Presentation::PerOutputWindows(layer)),
            Err(e) if !e.is_fatal() => {
                tracing::warn!(error = %e, "per-output windows failed, using root pixmap only");
                Ok(Presentation::SharedDrawable)
            }
            Err(e) => Err(e),
        }
    }

    pub fn present<S: DisplayServer>(
        &self,
        server: &mut S,
        image: &PixelImage,
    ) -> Result<(), DisplayError> {
        match self {
            Presentation::SharedDrawable => Ok(()),
            Presentation::PerOutputWindows(layer) => layer.present(server, image),
        }
    }

    pub fn teardown<S: DisplayServer>(&mut self, server: Option<&mut S>) {
        if let Presentation::PerOutputWindows(layer) = self {
            layer.teardown(server);
        }
        *self = Presentation::SharedDrawable;
    }
}

/// A window and the GC drawing into it. Created and destroyed together.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputWindow {
    pub window: Xid,
    pub gc: Xid,
    /// Source rectangle in the shared image (box-relative).
    pub source: Rect,
}

#[derive(Debug, Default)]
pub struct PerOutputWindowLayer {
    windows: BTreeMap<String, OutputWindow>,
    depth: u8,
}

impl PerOutputWindowLayer {
    /// Create one window per active viewport at its root position.
    pub fn activate<S: DisplayServer>(
        server: &mut S,
        topology: &Topology,
    ) -> Result<Self, DisplayError> {
        let mut layer = Self {
            windows: BTreeMap::new(),
            depth: server.root_depth(),
        };

        for viewport in &topology.viewports {
            let rect = topology.bounds.to_root(&viewport.rect);
            if let Err(e) = layer.add(server, &viewport.name, rect, viewport.rect) {
                layer.teardown(Some(server));
                return Err(e);
            }
        }

        server.flush()?;
        tracing::info!(windows = layer.windows.len(), "per-output windows active");
        Ok(layer)
    }

    fn add<S: DisplayServer>(
        &mut self,
        server: &mut S,
        name: &str,
        rect: Rect,
        source: Rect,
    ) -> Result<(), DisplayError> {
        let window = server.create_output_window(rect, name)?;
        let gc = match server.create_gc(window) {
            Ok(gc) => gc,
            Err(e) => {
                if let Err(destroy) = server.destroy_window(window) {
                    tracing::debug!(window, error = %destroy, "DestroyWindow failed");
                }
                return Err(e);
            }
        };

        tracing::debug!(name, window, geometry = %rect, "output window created");
        self.windows.insert(
            name.to_string(),
            OutputWindow { window, gc, source },
        );
        Ok(())
    }

    /// Copy each window's slice of `image` into it.
    pub fn present<S: DisplayServer>(
        &self,
        server: &mut S,
        image: &PixelImage,
    ) -> Result<(), DisplayError> {
        for entry in self.windows.values() {
            server.put_image(entry.window, entry.gc, self.depth, image, entry.source, 0, 0)?;
        }
        Ok(())
    }

    /// Destroy every window/GC pair.
    pub fn teardown<S: DisplayServer>(&mut self, mut server: Option<&mut S>) {
        for (name, entry) in std::mem::take(&mut self.windows) {
            let Some(server) = server.as_deref_mut() else {
                continue;
            };
            if let Err(e) = server.free_gc(entry.gc) {
                tracing::debug!(name = %name, error = %e, "FreeGC failed");
            }
            if let Err(e) = server.destroy_window(entry.window) {
                tracing::debug!(name = %name, error = %e, "DestroyWindow failed");
            }
        }
    }

    #[cfg(test)]
    pub fn windows(&self) -> &BTreeMap<String, OutputWindow> {
        &self.windows
    }
}
