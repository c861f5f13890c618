//! Software window driver — an x11rb window backed by a CPU framebuffer.
//!
//! The framebuffer always has the size the server last reported for the
//! window (via `ConfigureNotify`), which is what makes the reconciler's
//! polling meaningful: a resize only "lands" once the server confirms it.
//! In the window modes `swap_buffers` uploads the framebuffer into the
//! window; in background mode the window stays unmapped and the output
//! layer pulls pixels through `read_pixels`.

use std::time::{Duration, Instant};

use x11rb::connection::Connection;
use x11rb::protocol::Event;
use x11rb::protocol::xproto::{
    Atom, AtomEnum, ConfigureWindowAux, ConnectionExt as _, CreateGCAux, CreateWindowAux,
    EventMask, Gcontext, PropMode, Window, WindowClass,
};
use x11rb::rust_connection::RustConnection;
use x11rb::wrapper::ConnectionExt as _;

use crate::display::DisplayError;
use crate::display::x11::image::{RowSource, put_rows, to_i16, to_u16};
use crate::display::x11::intern_atom;
use crate::geometry::{Rect, Size};
use crate::scene::Canvas;

use super::{DriverError, WindowDriver, copy_rows};

const WINDOW_TITLE: &str = "backdropd";

/// How the driver's own window behaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowRole {
    /// Never shown except during reconciliation; frames are read back.
    Hidden,
    /// Unmanaged window at a fixed position.
    Explicit,
    /// Ordinary managed window.
    Normal,
}

impl WindowRole {
    fn override_redirect(self) -> bool {
        !matches!(self, WindowRole::Normal)
    }

    fn presents(self) -> bool {
        !matches!(self, WindowRole::Hidden)
    }
}

pub struct SoftwareDriver {
    conn: RustConnection,
    display: Option<String>,
    geometry: Rect,
    window: Window,
    gc: Gcontext,
    depth: u8,
    wm_protocols: Atom,
    wm_delete_window: Atom,
    role: WindowRole,
    window_size: Size,
    framebuffer_size: Size,
    framebuffer: Vec<u8>,
    visible: bool,
    close_requested: bool,
    started: Instant,
}

impl SoftwareDriver {
    /// Connect to `display` and create the driver window at `geometry`.
    pub fn open(
        display: Option<&str>,
        role: WindowRole,
        geometry: Rect,
    ) -> Result<Self, DriverError> {
        Ok(Self::create(display, role, geometry)?)
    }

    fn create(display: Option<&str>, role: WindowRole, geometry: Rect) -> Result<Self, DisplayError> {
        let (conn, screen_num) = RustConnection::connect(display)?;
        let screen = &conn.setup().roots[screen_num];
        let root = screen.root;
        let depth = screen.root_depth;
        let black_pixel = screen.black_pixel;

        let wm_protocols = intern_atom(&conn, "WM_PROTOCOLS")?;
        let wm_delete_window = intern_atom(&conn, "WM_DELETE_WINDOW")?;

        let window = conn.generate_id()?;
        let aux = CreateWindowAux::new()
            .background_pixel(black_pixel)
            .event_mask(EventMask::STRUCTURE_NOTIFY | EventMask::EXPOSURE)
            .override_redirect(u32::from(role.override_redirect()));
        conn.create_window(
            x11rb::COPY_DEPTH_FROM_PARENT,
            window,
            root,
            to_i16(geometry.x)?,
            to_i16(geometry.y)?,
            to_u16(geometry.width.max(1))?,
            to_u16(geometry.height.max(1))?,
            0,
            WindowClass::INPUT_OUTPUT,
            x11rb::COPY_FROM_PARENT,
            &aux,
        )?;

        conn.change_property8(
            PropMode::REPLACE,
            window,
            AtomEnum::WM_NAME,
            AtomEnum::STRING,
            WINDOW_TITLE.as_bytes(),
        )?;
        conn.change_property32(
            PropMode::REPLACE,
            window,
            wm_protocols,
            AtomEnum::ATOM,
            &[wm_delete_window],
        )?;

        let gc = conn.generate_id()?;
        conn.create_gc(gc, window, &CreateGCAux::new().graphics_exposures(0))?;

        let visible = role.presents();
        if visible {
            conn.map_window(window)?;
        }
        conn.flush()?;

        let size = geometry.size();
        tracing::info!(window, role = ?role, geometry = %geometry, "driver window created");

        Ok(Self {
            conn,
            display: display.map(str::to_owned),
            geometry,
            window,
            gc,
            depth,
            wm_protocols,
            wm_delete_window,
            role,
            window_size: size,
            framebuffer_size: size,
            framebuffer: vec![0; size.bgra_len()],
            visible,
            close_requested: false,
            started: Instant::now(),
        })
    }

    fn configure(&self, aux: &ConfigureWindowAux) -> Result<(), DisplayError> {
        self.conn.configure_window(self.window, aux)?;
        self.conn.flush()?;
        Ok(())
    }

    fn set_mapped(&mut self, mapped: bool) -> Result<(), DisplayError> {
        if mapped {
            self.conn.map_window(self.window)?;
        } else {
            self.conn.unmap_window(self.window)?;
        }
        self.conn.flush()?;
        self.visible = mapped;
        Ok(())
    }

    /// The server confirmed a new window size; the framebuffer follows.
    fn window_resized(&mut self, size: Size) {
        if size == self.window_size {
            return;
        }
        tracing::debug!(from = %self.window_size, to = %size, "driver window resized");
        self.window_size = size;
        self.framebuffer_size = size;
        self.framebuffer = vec![0; size.bgra_len()];
    }

    fn drain_events(&mut self) -> Result<(), DisplayError> {
        while let Some(event) = self.conn.poll_for_event()? {
            match event {
                Event::ConfigureNotify(e) if e.window == self.window => {
                    self.window_resized(Size::new(u32::from(e.width), u32::from(e.height)));
                }
                Event::ClientMessage(e)
                    if e.window == self.window
                        && e.type_ == self.wm_protocols
                        && e.format == 32
                        && e.data.as_data32()[0] == self.wm_delete_window =>
                {
                    tracing::info!("close requested by window manager");
                    self.close_requested = true;
                }
                Event::Error(e) => {
                    tracing::warn!(
                        error_kind = ?e.error_kind,
                        major_opcode = e.major_opcode,
                        "X11 error on driver window"
                    );
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn upload(&self) -> Result<(), DisplayError> {
        let source = RowSource {
            data: &self.framebuffer,
            stride: self.framebuffer_size.width as usize * 4,
        };
        let rect = Rect::new(
            0,
            0,
            self.framebuffer_size.width,
            self.framebuffer_size.height,
        );
        put_rows(&self.conn, self.window, self.gc, self.depth, &source, rect, 0, 0)?;
        self.conn.flush()?;
        Ok(())
    }

    /// Round-trip to the server so every request sent so far is processed.
    fn sync(&self) -> Result<(), DisplayError> {
        self.conn.get_input_focus()?.reply()?;
        Ok(())
    }
}

impl WindowDriver for SoftwareDriver {
    fn resize_window(&mut self, size: Size) -> Result<(), DriverError> {
        let aux = ConfigureWindowAux::new()
            .width(u32::from(to_u16(size.width.max(1))?))
            .height(u32::from(to_u16(size.height.max(1))?));
        Ok(self.configure(&aux)?)
    }

    fn move_window(&mut self, x: i32, y: i32) -> Result<(), DriverError> {
        Ok(self.configure(&ConfigureWindowAux::new().x(x).y(y))?)
    }

    fn framebuffer_size(&self) -> Size {
        self.framebuffer_size
    }

    fn window_size(&self) -> Size {
        self.window_size
    }

    fn is_visible(&self) -> bool {
        self.visible
    }

    fn show_window(&mut self) -> Result<(), DriverError> {
        Ok(self.set_mapped(true)?)
    }

    fn hide_window(&mut self) -> Result<(), DriverError> {
        Ok(self.set_mapped(false)?)
    }

    fn poll_events(&mut self) -> Result<(), DriverError> {
        Ok(self.drain_events()?)
    }

    fn swap_buffers(&mut self) -> Result<(), DriverError> {
        if !self.role.presents() || !self.visible {
            return Ok(());
        }
        Ok(self.upload()?)
    }

    fn render_time(&self) -> Duration {
        self.started.elapsed()
    }

    fn close_requested(&self) -> bool {
        self.close_requested
    }

    fn reconnect(&mut self) -> Result<(), DriverError> {
        let fresh = Self::create(self.display.as_deref(), self.role, self.geometry)?;
        let started = self.started;
        // Dropping the old driver only attempts best-effort cleanup on the
        // dead connection.
        *self = fresh;
        self.started = started;
        Ok(())
    }

    /// Resize the X window directly and wait for the server to process it.
    fn resize_drawable(&mut self, size: Size) -> Result<bool, DriverError> {
        self.resize_window(size)?;
        self.sync()?;
        Ok(true)
    }

    fn clear(&mut self) {
        self.framebuffer.fill(0);
    }

    fn canvas(&mut self) -> Canvas<'_> {
        Canvas::new(&mut self.framebuffer, self.framebuffer_size)
    }

    fn read_pixels(
        &mut self,
        region: Size,
        row_length: usize,
        dst: &mut [u8],
    ) -> Result<(), DriverError> {
        copy_rows(&self.framebuffer, self.framebuffer_size, region, row_length, dst)
    }
}

impl Drop for SoftwareDriver {
    fn drop(&mut self) {
        // Best effort: the connection closes right after and the server
        // reclaims whatever is left.
        if let Err(e) = self.conn.free_gc(self.gc) {
            tracing::debug!(error = %e, "FreeGC on driver window failed");
        }
        if let Err(e) = self.conn.destroy_window(self.window) {
            tracing::debug!(error = %e, "DestroyWindow on driver window failed");
        }
        if let Err(e) = self.conn.flush() {
            tracing::debug!(error = %e, "flush on driver shutdown failed");
        }
    }
}
