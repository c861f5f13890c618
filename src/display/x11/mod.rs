//! X11 display adapter — x11rb implementation of [`DisplayServer`].
//!
//! One [`X11Display`] wraps one `RustConnection`. Output discovery uses
//! RandR (screen resources → output info → CRTC info), the per-output
//! window layer uses XFixes regions to empty each window's input shape,
//! and the background path uses plain core requests.
//!
//! x11rb never terminates the process on a protocol error: replies carry
//! the error, unchecked requests deliver it as an event. Both are mapped
//! to [`DisplayError::Protocol`], while any I/O failure on the socket
//! becomes [`DisplayError::Connection`].

pub mod image;

use x11rb::connection::{Connection, RequestConnection};
use x11rb::errors::{ConnectError, ConnectionError, ReplyError, ReplyOrIdError};
use x11rb::protocol::Event;
use x11rb::protocol::randr::{self, ConnectionExt as _};
use x11rb::protocol::shape;
use x11rb::protocol::xfixes::{self, ConnectionExt as _};
use x11rb::protocol::xproto::{
    self, Atom, AtomEnum, ChangeWindowAttributesAux, ConfigureWindowAux, ConnectionExt as _,
    CreateGCAux, CreateWindowAux, EventMask, PropMode, Rectangle, StackMode, Window, WindowClass,
};
use x11rb::rust_connection::RustConnection;
use x11rb::wrapper::ConnectionExt as _;

use crate::display::{Connector, DisplayError, DisplayServer, DrawableInfo, RootProperty, Xid};
use crate::geometry::{Rect, Size};
use crate::output::surface::PixelImage;
use crate::output::topology::Viewport;

use image::{RowSource, to_i16, to_u16};

impl From<ConnectError> for DisplayError {
    fn from(e: ConnectError) -> Self {
        DisplayError::Connection(format!("connect failed: {e}"))
    }
}

impl From<ConnectionError> for DisplayError {
    fn from(e: ConnectionError) -> Self {
        DisplayError::Connection(e.to_string())
    }
}

impl From<ReplyError> for DisplayError {
    fn from(e: ReplyError) -> Self {
        match e {
            ReplyError::ConnectionError(e) => e.into(),
            ReplyError::X11Error(e) => DisplayError::Protocol(format!("{e:?}")),
        }
    }
}

impl From<ReplyOrIdError> for DisplayError {
    fn from(e: ReplyOrIdError) -> Self {
        match e {
            ReplyOrIdError::ConnectionError(e) => e.into(),
            ReplyOrIdError::X11Error(e) => DisplayError::Protocol(format!("{e:?}")),
            ReplyOrIdError::IdsExhausted => DisplayError::Protocol("resource ids exhausted".into()),
        }
    }
}

/// Pre-interned atoms for root-pixmap publishing and EWMH window tagging.
struct Atoms {
    xrootpmap_id: Atom,
    esetroot_pmap_id: Atom,
    net_wm_window_type: Atom,
    net_wm_window_type_desktop: Atom,
    net_wm_state: Atom,
    net_wm_state_below: Atom,
    net_wm_state_sticky: Atom,
    net_wm_state_skip_taskbar: Atom,
    net_wm_state_skip_pager: Atom,
    net_wm_name: Atom,
    utf8_string: Atom,
}

impl Atoms {
    fn intern(conn: &RustConnection) -> Result<Self, DisplayError> {
        Ok(Self {
            xrootpmap_id: intern_atom(conn, RootProperty::XRootPmapId.atom_name())?,
            esetroot_pmap_id: intern_atom(conn, RootProperty::EsetrootPmapId.atom_name())?,
            net_wm_window_type: intern_atom(conn, "_NET_WM_WINDOW_TYPE")?,
            net_wm_window_type_desktop: intern_atom(conn, "_NET_WM_WINDOW_TYPE_DESKTOP")?,
            net_wm_state: intern_atom(conn, "_NET_WM_STATE")?,
            net_wm_state_below: intern_atom(conn, "_NET_WM_STATE_BELOW")?,
            net_wm_state_sticky: intern_atom(conn, "_NET_WM_STATE_STICKY")?,
            net_wm_state_skip_taskbar: intern_atom(conn, "_NET_WM_STATE_SKIP_TASKBAR")?,
            net_wm_state_skip_pager: intern_atom(conn, "_NET_WM_STATE_SKIP_PAGER")?,
            net_wm_name: intern_atom(conn, "_NET_WM_NAME")?,
            utf8_string: intern_atom(conn, "UTF8_STRING")?,
        })
    }

    fn root_property(&self, property: RootProperty) -> Atom {
        match property {
            RootProperty::XRootPmapId => self.xrootpmap_id,
            RootProperty::EsetrootPmapId => self.esetroot_pmap_id,
        }
    }
}

pub(crate) fn intern_atom(conn: &RustConnection, name: &str) -> Result<Atom, DisplayError> {
    Ok(xproto::intern_atom(conn, false, name.as_bytes())?
        .reply()?
        .atom)
}

/// Opens [`X11Display`] sessions on a fixed display name (`None` uses
/// `$DISPLAY`).
#[derive(Debug, Clone, Default)]
pub struct X11Connector {
    display: Option<String>,
}

impl X11Connector {
    pub fn new(display: Option<String>) -> Self {
        Self { display }
    }
}

impl Connector for X11Connector {
    type Server = X11Display;

    fn connect(&self) -> Result<X11Display, DisplayError> {
        X11Display::connect(self.display.as_deref())
    }
}

/// A live X11 session on the default screen.
pub struct X11Display {
    conn: RustConnection,
    root: Window,
    root_size: Size,
    root_depth: u8,
    black_pixel: u32,
    atoms: Atoms,
    /// RandR is usable (present and at least 1.2).
    randr: bool,
    xfixes: Option<(u32, u32)>,
}

impl X11Display {
    /// Connect to the display and probe the extensions the output layer
    /// cares about.
    pub fn connect(display: Option<&str>) -> Result<Self, DisplayError> {
        let (conn, screen_num) = RustConnection::connect(display)?;

        let screen = &conn.setup().roots[screen_num];
        let root = screen.root;
        let root_size = Size::new(
            u32::from(screen.width_in_pixels),
            u32::from(screen.height_in_pixels),
        );
        let root_depth = screen.root_depth;
        let black_pixel = screen.black_pixel;

        let atoms = Atoms::intern(&conn)?;
        let randr = probe_randr(&conn)?;
        let xfixes = probe_xfixes(&conn)?;

        tracing::info!(
            screen = screen_num,
            root = %root_size,
            depth = root_depth,
            randr,
            xfixes = ?xfixes,
            "connected to X11 display"
        );

        Ok(Self {
            conn,
            root,
            root_size,
            root_depth,
            black_pixel,
            atoms,
            randr,
            xfixes,
        })
    }

    fn set_window_name(&self, window: Window, name: &str) -> Result<(), DisplayError> {
        let title = format!("backdropd {name}");
        self.conn.change_property8(
            PropMode::REPLACE,
            window,
            AtomEnum::WM_NAME,
            AtomEnum::STRING,
            title.as_bytes(),
        )?;
        self.conn.change_property8(
            PropMode::REPLACE,
            window,
            self.atoms.net_wm_name,
            self.atoms.utf8_string,
            title.as_bytes(),
        )?;
        Ok(())
    }

    /// Tag `window` so window managers keep it on the desktop layer and
    /// out of taskbars and pagers.
    fn tag_desktop_window(&self, window: Window) -> Result<(), DisplayError> {
        self.conn.change_property32(
            PropMode::REPLACE,
            window,
            self.atoms.net_wm_window_type,
            AtomEnum::ATOM,
            &[self.atoms.net_wm_window_type_desktop],
        )?;
        self.conn.change_property32(
            PropMode::REPLACE,
            window,
            self.atoms.net_wm_state,
            AtomEnum::ATOM,
            &[
                self.atoms.net_wm_state_below,
                self.atoms.net_wm_state_sticky,
                self.atoms.net_wm_state_skip_taskbar,
                self.atoms.net_wm_state_skip_pager,
            ],
        )?;
        Ok(())
    }

    /// Replace the input shape of `window` with an empty region so
    /// pointer and keyboard events fall through to whatever is below.
    fn clear_input_shape(&self, window: Window) -> Result<(), DisplayError> {
        let region = self.conn.generate_id()?;
        self.conn.xfixes_create_region(region, &[])?;
        self.conn
            .xfixes_set_window_shape_region(window, shape::SK::INPUT, 0, 0, region)?;
        self.conn.xfixes_destroy_region(region)?;
        Ok(())
    }
}

fn probe_randr(conn: &RustConnection) -> Result<bool, DisplayError> {
    if conn.extension_information(randr::X11_EXTENSION_NAME)?.is_none() {
        return Ok(false);
    }

    let version = conn.randr_query_version(1, 2)?.reply()?;
    let usable = version.major_version > 1 || version.minor_version >= 2;
    if !usable {
        tracing::warn!(
            major = version.major_version,
            minor = version.minor_version,
            "RandR older than 1.2, output geometry unavailable"
        );
    }
    Ok(usable)
}

fn probe_xfixes(conn: &RustConnection) -> Result<Option<(u32, u32)>, DisplayError> {
    if conn.extension_information(xfixes::X11_EXTENSION_NAME)?.is_none() {
        return Ok(None);
    }

    // XFixes requires the version handshake before any other request.
    let version = conn.xfixes_query_version(5, 0)?.reply()?;
    Ok(Some((version.major_version, version.minor_version)))
}

impl DisplayServer for X11Display {
    fn root_size(&self) -> Size {
        self.root_size
    }

    fn root_depth(&self) -> u8 {
        self.root_depth
    }

    fn outputs(&mut self) -> Result<Vec<Viewport>, DisplayError> {
        if !self.randr {
            return Err(DisplayError::MissingExtension("RANDR"));
        }

        let resources = self
            .conn
            .randr_get_screen_resources_current(self.root)?
            .reply()?;
        let timestamp = resources.config_timestamp;

        let mut outputs = Vec::new();
        for &output in &resources.outputs {
            let info = self.conn.randr_get_output_info(output, timestamp)?.reply()?;

            if info.connection != randr::Connection::CONNECTED || info.crtc == x11rb::NONE {
                continue;
            }

            let crtc = match self.conn.randr_get_crtc_info(info.crtc, timestamp)?.reply() {
                Ok(crtc) => crtc,
                Err(ReplyError::X11Error(e)) => {
                    tracing::debug!(output, error = ?e, "CRTC vanished while enumerating");
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            if crtc.width == 0 || crtc.height == 0 {
                continue;
            }

            outputs.push(Viewport::new(
                String::from_utf8_lossy(&info.name).into_owned(),
                Rect::new(
                    i32::from(crtc.x),
                    i32::from(crtc.y),
                    u32::from(crtc.width),
                    u32::from(crtc.height),
                ),
            ));
        }

        Ok(outputs)
    }

    fn region_shape_version(&self) -> Option<(u32, u32)> {
        self.xfixes
    }

    fn create_pixmap(&mut self, size: Size, depth: u8) -> Result<Xid, DisplayError> {
        let pixmap = self.conn.generate_id()?;
        self.conn.create_pixmap(
            depth,
            pixmap,
            self.root,
            to_u16(size.width)?,
            to_u16(size.height)?,
        )?;
        Ok(pixmap)
    }

    fn free_pixmap(&mut self, pixmap: Xid) -> Result<(), DisplayError> {
        self.conn.free_pixmap(pixmap)?;
        Ok(())
    }

    fn create_gc(&mut self, drawable: Xid) -> Result<Xid, DisplayError> {
        let gc = self.conn.generate_id()?;
        let aux = CreateGCAux::new()
            .foreground(self.black_pixel)
            .graphics_exposures(0);
        self.conn.create_gc(gc, drawable, &aux)?;
        Ok(gc)
    }

    fn free_gc(&mut self, gc: Xid) -> Result<(), DisplayError> {
        self.conn.free_gc(gc)?;
        Ok(())
    }

    fn root_pixmap(&mut self, property: RootProperty) -> Result<Option<Xid>, DisplayError> {
        let reply = self
            .conn
            .get_property(
                false,
                self.root,
                self.atoms.root_property(property),
                AtomEnum::PIXMAP,
                0,
                1,
            )?
            .reply()?;

        if reply.type_ != u32::from(AtomEnum::PIXMAP) || reply.format != 32 {
            return Ok(None);
        }

        Ok(reply
            .value32()
            .and_then(|mut values| values.next())
            .filter(|&pixmap| pixmap != x11rb::NONE))
    }

    fn drawable_info(&mut self, drawable: Xid) -> Result<Option<DrawableInfo>, DisplayError> {
        match self.conn.get_geometry(drawable)?.reply() {
            Ok(geometry) => Ok(Some(DrawableInfo {
                size: Size::new(u32::from(geometry.width), u32::from(geometry.height)),
                depth: geometry.depth,
            })),
            // A stale id left behind by a previous owner.
            Err(ReplyError::X11Error(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn fill_rectangle(&mut self, drawable: Xid, gc: Xid, rect: Rect) -> Result<(), DisplayError> {
        let rectangle = Rectangle {
            x: to_i16(rect.x)?,
            y: to_i16(rect.y)?,
            width: to_u16(rect.width)?,
            height: to_u16(rect.height)?,
        };
        self.conn.poly_fill_rectangle(drawable, gc, &[rectangle])?;
        Ok(())
    }

    fn copy_area(&mut self, src: Xid, dst: Xid, gc: Xid, size: Size) -> Result<(), DisplayError> {
        self.conn.copy_area(
            src,
            dst,
            gc,
            0,
            0,
            0,
            0,
            to_u16(size.width)?,
            to_u16(size.height)?,
        )?;
        Ok(())
    }

    fn put_image(
        &mut self,
        drawable: Xid,
        gc: Xid,
        depth: u8,
        image: &PixelImage,
        src: Rect,
        dst_x: i32,
        dst_y: i32,
    ) -> Result<(), DisplayError> {
        let source = RowSource {
            data: image.data(),
            stride: image.stride(),
        };
        image::put_rows(&self.conn, drawable, gc, depth, &source, src, dst_x, dst_y)
    }

    fn set_root_background(&mut self, pixmap: Xid) -> Result<(), DisplayError> {
        let aux = ChangeWindowAttributesAux::new().background_pixmap(pixmap);
        self.conn.change_window_attributes(self.root, &aux)?;
        Ok(())
    }

    fn set_root_pixmap(&mut self, property: RootProperty, pixmap: Xid) -> Result<(), DisplayError> {
        self.conn.change_property32(
            PropMode::REPLACE,
            self.root,
            self.atoms.root_property(property),
            AtomEnum::PIXMAP,
            &[pixmap],
        )?;
        Ok(())
    }

    fn clear_root_area(&mut self, rect: Rect) -> Result<(), DisplayError> {
        self.conn.clear_area(
            false,
            self.root,
            to_i16(rect.x)?,
            to_i16(rect.y)?,
            to_u16(rect.width)?,
            to_u16(rect.height)?,
        )?;
        Ok(())
    }

    fn create_output_window(&mut self, rect: Rect, name: &str) -> Result<Xid, DisplayError> {
        let window = self.conn.generate_id()?;
        let aux = CreateWindowAux::new()
            .override_redirect(1)
            .background_pixel(self.black_pixel)
            .event_mask(EventMask::NO_EVENT);

        self.conn.create_window(
            x11rb::COPY_DEPTH_FROM_PARENT,
            window,
            self.root,
            to_i16(rect.x)?,
            to_i16(rect.y)?,
            to_u16(rect.width)?,
            to_u16(rect.height)?,
            0,
            WindowClass::INPUT_OUTPUT,
            x11rb::COPY_FROM_PARENT,
            &aux,
        )?;

        self.set_window_name(window, name)?;
        self.tag_desktop_window(window)?;
        self.clear_input_shape(window)?;

        self.conn.map_window(window)?;
        self.conn.configure_window(
            window,
            &ConfigureWindowAux::new().stack_mode(StackMode::BELOW),
        )?;

        Ok(window)
    }

    fn destroy_window(&mut self, window: Xid) -> Result<(), DisplayError> {
        self.conn.destroy_window(window)?;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), DisplayError> {
        self.conn.flush()?;
        Ok(())
    }

    fn dispatch_errors(&mut self) -> Result<usize, DisplayError> {
        let mut errors = 0;
        while let Some(event) = self.conn.poll_for_event()? {
            if let Event::Error(e) = event {
                tracing::warn!(
                    error_kind = ?e.error_kind,
                    major_opcode = e.major_opcode,
                    minor_opcode = e.minor_opcode,
                    bad_value = e.bad_value,
                    "X11 protocol error"
                );
                errors += 1;
            }
        }
        Ok(errors)
    }
}
