//! Display server abstraction — the seam between output bookkeeping and
//! the X protocol.
//!
//! Everything the output layer needs from the server (output inventory,
//! pixmaps, graphics contexts, image upload, root-window properties,
//! per-output windows) goes through [`DisplayServer`]. The x11rb adapter
//! lives in [`x11`]; tests drive the same code through an in-memory fake.
//!
//! A server value owns its connection. Dropping it closes the connection,
//! which is how the output layer ties connection lifetime to its
//! load/free cycle instead of to the process.

#[cfg(test)]
pub mod fake;
pub mod x11;

use crate::geometry::{Rect, Size};
use crate::output::surface::PixelImage;
use crate::output::topology::Viewport;

/// Server-side resource id (pixmap, window, graphics context).
pub type Xid = u32;

/// Errors returned by display adapters.
///
/// The variants double as the fault classes the recovery layer acts on:
/// a `Connection` error means the session is gone and must be rebuilt,
/// everything else leaves the connection usable.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DisplayError {
    /// The connection to the server broke (I/O error, server exit).
    #[error("connection: {0}")]
    Connection(String),

    /// The server rejected a request (BadDrawable, BadMatch, ...).
    #[error("protocol: {0}")]
    Protocol(String),

    /// A required extension is not present on the server.
    #[error("extension {0} is not available")]
    MissingExtension(&'static str),

    /// The request cannot be expressed on the wire (e.g. size overflow).
    #[error("unsupported: {0}")]
    Unsupported(String),
}

impl DisplayError {
    /// Whether the connection that produced this error is unusable.
    pub fn is_fatal(&self) -> bool {
        matches!(self, DisplayError::Connection(_))
    }
}

/// The two conventional root-window properties advertising the current
/// background pixmap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RootProperty {
    XRootPmapId,
    EsetrootPmapId,
}

impl RootProperty {
    /// Lookup order when resolving an existing background.
    pub const ALL: [RootProperty; 2] = [RootProperty::XRootPmapId, RootProperty::EsetrootPmapId];

    pub fn atom_name(self) -> &'static str {
        match self {
            RootProperty::XRootPmapId => "_XROOTPMAP_ID",
            RootProperty::EsetrootPmapId => "ESETROOT_PMAP_ID",
        }
    }
}

/// Geometry of an existing drawable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrawableInfo {
    pub size: Size,
    pub depth: u8,
}

/// A connected display server session.
///
/// Request methods are fire-and-forget where the protocol allows it;
/// asynchronous protocol errors surface later through
/// [`dispatch_errors`](DisplayServer::dispatch_errors).
pub trait DisplayServer {
    /// Size of the default screen's root window.
    fn root_size(&self) -> Size;

    /// Depth of the default screen's root window.
    fn root_depth(&self) -> u8;

    /// Connected outputs with an active CRTC, in server order.
    ///
    /// Fails with [`DisplayError::MissingExtension`] when RandR is
    /// unavailable.
    fn outputs(&mut self) -> Result<Vec<Viewport>, DisplayError>;

    /// Version of the region-shaping extension (XFixes), if present.
    fn region_shape_version(&self) -> Option<(u32, u32)>;

    fn create_pixmap(&mut self, size: Size, depth: u8) -> Result<Xid, DisplayError>;
    fn free_pixmap(&mut self, pixmap: Xid) -> Result<(), DisplayError>;

    /// Create a graphics context for `drawable` with a black foreground.
    fn create_gc(&mut self, drawable: Xid) -> Result<Xid, DisplayError>;
    fn free_gc(&mut self, gc: Xid) -> Result<(), DisplayError>;

    /// Pixmap id currently stored in `property` on the root window.
    fn root_pixmap(&mut self, property: RootProperty) -> Result<Option<Xid>, DisplayError>;

    /// Geometry of `drawable`, or `None` if the server no longer knows it.
    fn drawable_info(&mut self, drawable: Xid) -> Result<Option<DrawableInfo>, DisplayError>;

    /// Fill `rect` of `drawable` with the GC's foreground.
    fn fill_rectangle(&mut self, drawable: Xid, gc: Xid, rect: Rect) -> Result<(), DisplayError>;

    /// Copy the top-left `size` region of `src` to the origin of `dst`.
    fn copy_area(&mut self, src: Xid, dst: Xid, gc: Xid, size: Size) -> Result<(), DisplayError>;

    /// Upload the `src` sub-rectangle of `image` to `(dst_x, dst_y)` of
    /// `drawable`. Adapters split the upload to respect request limits.
    #[allow(clippy::too_many_arguments)]
    fn put_image(
        &mut self,
        drawable: Xid,
        gc: Xid,
        depth: u8,
        image: &PixelImage,
        src: Rect,
        dst_x: i32,
        dst_y: i32,
    ) -> Result<(), DisplayError>;

    /// Make `pixmap` the root window's background.
    fn set_root_background(&mut self, pixmap: Xid) -> Result<(), DisplayError>;

    /// Store `pixmap` in a root-pixmap property.
    fn set_root_pixmap(&mut self, property: RootProperty, pixmap: Xid) -> Result<(), DisplayError>;

    /// Ask the server to repaint `rect` of the root window from its
    /// background.
    fn clear_root_area(&mut self, rect: Rect) -> Result<(), DisplayError>;

    /// Create, tag, input-shape and map a desktop-layer window covering
    /// `rect` (absolute root coordinates).
    fn create_output_window(&mut self, rect: Rect, name: &str) -> Result<Xid, DisplayError>;
    fn destroy_window(&mut self, window: Xid) -> Result<(), DisplayError>;

    fn flush(&mut self) -> Result<(), DisplayError>;

    /// Drain pending events, logging protocol errors.
    ///
    /// Returns the number of protocol errors seen; a broken connection is
    /// reported as `Err(DisplayError::Connection)`.
    fn dispatch_errors(&mut self) -> Result<usize, DisplayError>;
}

/// Opens display server sessions. Called on every (re)load.
pub trait Connector {
    type Server: DisplayServer;

    fn connect(&self) -> Result<Self::Server, DisplayError>;
}
