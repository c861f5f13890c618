//! Scripted window driver for tests: resizes apply after a configurable
//! number of polls, on map, through the direct path, or never. The
//! connection can be broken and refused to exercise reconnects.

use std::time::Duration;

use crate::geometry::Size;
use crate::scene::Canvas;

use crate::display::DisplayError;

use super::{DriverError, WindowDriver};

pub struct ScriptedDriver {
    created: Size,
    pub framebuffer: Size,
    pub window: Size,
    pending: Option<Size>,
    polls_since_request: u32,

    /// A pending resize applies once this many polls have run.
    pub apply_after_polls: Option<u32>,
    /// A pending resize applies when the window is mapped.
    pub apply_on_show: bool,
    /// `resize_drawable` is supported and applies immediately.
    pub direct_resize: bool,

    pub visible: bool,
    pub position: (i32, i32),
    pub pixels: Vec<u8>,
    pub fail_read: bool,
    /// `close_requested` turns true after this many swaps.
    pub close_after_swaps: Option<u64>,
    /// Every server call fails with a connection error.
    pub disconnected: bool,
    /// `reconnect` succeeds.
    pub reachable: bool,

    pub resizes: u32,
    pub polls: u32,
    pub shows: u32,
    pub direct_resizes: u32,
    pub clears: u64,
    pub swaps: u64,
    pub reads: Vec<(Size, usize)>,
    pub reconnects: u32,
}

impl ScriptedDriver {
    pub fn new(size: Size) -> Self {
        Self {
            created: size,
            framebuffer: size,
            window: size,
            pending: None,
            polls_since_request: 0,
            apply_after_polls: None,
            apply_on_show: false,
            direct_resize: false,
            visible: false,
            position: (0, 0),
            pixels: vec![0; size.bgra_len()],
            fail_read: false,
            close_after_swaps: None,
            disconnected: false,
            reachable: true,
            resizes: 0,
            polls: 0,
            shows: 0,
            direct_resizes: 0,
            clears: 0,
            swaps: 0,
            reads: Vec::new(),
            reconnects: 0,
        }
    }

    fn connected(&self) -> Result<(), DriverError> {
        if self.disconnected {
            return Err(DisplayError::Connection("broken pipe".into()).into());
        }
        Ok(())
    }

    fn apply(&mut self, size: Size) {
        self.framebuffer = size;
        self.window = size;
        self.pixels = vec![0; size.bgra_len()];
        self.pending = None;
    }
}

impl WindowDriver for ScriptedDriver {
    fn resize_window(&mut self, size: Size) -> Result<(), DriverError> {
        self.connected()?;
        self.resizes += 1;
        self.pending = Some(size);
        self.polls_since_request = 0;
        Ok(())
    }

    fn move_window(&mut self, x: i32, y: i32) -> Result<(), DriverError> {
        self.connected()?;
        self.position = (x, y);
        Ok(())
    }

    fn framebuffer_size(&self) -> Size {
        self.framebuffer
    }

    fn window_size(&self) -> Size {
        self.window
    }

    fn is_visible(&self) -> bool {
        self.visible
    }

    fn show_window(&mut self) -> Result<(), DriverError> {
        self.connected()?;
        self.visible = true;
        self.shows += 1;
        if self.apply_on_show
            && let Some(size) = self.pending
        {
            self.apply(size);
        }
        Ok(())
    }

    fn hide_window(&mut self) -> Result<(), DriverError> {
        self.connected()?;
        self.visible = false;
        Ok(())
    }

    fn poll_events(&mut self) -> Result<(), DriverError> {
        self.connected()?;
        self.polls += 1;
        self.polls_since_request += 1;
        if let Some(size) = self.pending
            && self
                .apply_after_polls
                .is_some_and(|n| self.polls_since_request >= n)
        {
            self.apply(size);
        }
        Ok(())
    }

    fn swap_buffers(&mut self) -> Result<(), DriverError> {
        self.connected()?;
        self.swaps += 1;
        Ok(())
    }

    fn render_time(&self) -> Duration {
        Duration::from_millis(self.swaps * 33)
    }

    fn close_requested(&self) -> bool {
        self.close_after_swaps.is_some_and(|n| self.swaps >= n)
    }

    fn reconnect(&mut self) -> Result<(), DriverError> {
        if !self.reachable {
            return Err(DisplayError::Connection("connection refused".into()).into());
        }
        self.disconnected = false;
        self.reconnects += 1;
        self.visible = false;
        self.apply(self.created);
        Ok(())
    }

    fn resize_drawable(&mut self, size: Size) -> Result<bool, DriverError> {
        self.connected()?;
        if !self.direct_resize {
            return Ok(false);
        }
        self.direct_resizes += 1;
        self.apply(size);
        Ok(true)
    }

    fn clear(&mut self) {
        self.clears += 1;
        self.pixels.fill(0);
    }

    fn canvas(&mut self) -> Canvas<'_> {
        Canvas::new(&mut self.pixels, self.framebuffer)
    }

    fn read_pixels(
        &mut self,
        region: Size,
        row_length: usize,
        dst: &mut [u8],
    ) -> Result<(), DriverError> {
        self.reads.push((region, row_length));
        if self.fail_read {
            return Err(DriverError::Transfer("GL_INVALID_OPERATION".into()));
        }
        super::copy_rows(&self.pixels, self.framebuffer, region, row_length, dst)
    }
}
