//! Render configuration handed from the command line to the render
//! thread.

use std::collections::BTreeSet;

use crate::driver::reconcile::RetryBudget;
use crate::geometry::{Rect, Size};

/// Where frames are presented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum RenderMode {
    /// Desktop background on the requested outputs.
    Background,
    /// Ordinary managed window.
    Window,
    /// Undecorated window at a fixed position.
    Explicit,
}

/// Default window geometry for the window modes.
pub const DEFAULT_WINDOW: Rect = Rect::new(0, 0, 1280, 720);

pub const DEFAULT_MAX_FPS: u32 = 30;

#[derive(Debug, Clone)]
pub struct RenderConfig {
    pub mode: RenderMode,
    /// Requested output names. Empty means the whole root window.
    pub screen_roots: BTreeSet<String>,
    pub max_fps: u32,
    pub window: Rect,
    pub retry: RetryBudget,
    /// X display name; `None` uses `$DISPLAY`.
    pub display: Option<String>,
}

impl RenderConfig {
    pub fn window_size(&self) -> Size {
        self.window.size()
    }

    /// Same configuration in plain window mode.
    pub fn windowed(&self) -> RenderConfig {
        RenderConfig {
            mode: RenderMode::Window,
            ..self.clone()
        }
    }
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            mode: RenderMode::Background,
            screen_roots: BTreeSet::new(),
            max_fps: DEFAULT_MAX_FPS,
            window: DEFAULT_WINDOW,
            retry: RetryBudget::default(),
            display: None,
        }
    }
}
