use clap::{Args, Parser, Subcommand};

use crate::config::{DEFAULT_MAX_FPS, DEFAULT_WINDOW, RenderConfig, RenderMode};
use crate::driver::reconcile::RetryBudget;
use crate::geometry::Rect;

#[derive(Parser)]
#[command(name = "backdropd", about = "Animated desktop background for X11")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Render the animated scene
    Run(RunArgs),

    /// List connected outputs and their geometry
    Outputs {
        /// X display to connect to (defaults to $DISPLAY)
        #[arg(long)]
        display: Option<String>,
    },
}

#[derive(Args)]
pub struct RunArgs {
    /// Where frames are presented
    #[arg(long, value_enum, default_value_t = RenderMode::Background)]
    mode: RenderMode,

    /// Output to cover in background mode (repeatable; none = whole screen)
    #[arg(long = "screen-root", value_name = "NAME")]
    screen_roots: Vec<String>,

    /// Maximum frame rate
    #[arg(long, default_value_t = DEFAULT_MAX_FPS, value_parser = clap::value_parser!(u32).range(1..))]
    fps: u32,

    /// Window geometry as X,Y,WxH (or WxH)
    #[arg(long, value_parser = parse_geometry)]
    window: Option<Rect>,

    /// Resize poll rounds before remapping the window
    #[arg(long, default_value_t = 4)]
    resize_rounds: u32,

    /// Resize poll rounds while remapped
    #[arg(long, default_value_t = 4)]
    remap_rounds: u32,

    /// X display to connect to (defaults to $DISPLAY)
    #[arg(long)]
    display: Option<String>,
}

impl RunArgs {
    pub fn into_config(self) -> RenderConfig {
        RenderConfig {
            mode: self.mode,
            screen_roots: self.screen_roots.into_iter().collect(),
            max_fps: self.fps,
            window: self.window.unwrap_or(DEFAULT_WINDOW),
            retry: RetryBudget {
                initial_rounds: self.resize_rounds,
                remap_rounds: self.remap_rounds,
            },
            display: self.display,
        }
    }
}

/// Parse `X,Y,WxH` or `WxH`. Offsets may be negative.
pub fn parse_geometry(value: &str) -> Result<Rect, String> {
    let parts: Vec<&str> = value.split(',').map(str::trim).collect();
    let (x, y, size) = match parts.as_slice() {
        [size] => (0, 0, *size),
        [x, y, size] => (
            x.parse::<i32>().map_err(|e| format!("invalid x offset {x:?}: {e}"))?,
            y.parse::<i32>().map_err(|e| format!("invalid y offset {y:?}: {e}"))?,
            *size,
        ),
        _ => return Err(format!("expected X,Y,WxH or WxH, got {value:?}")),
    };

    let Some((width, height)) = size.split_once(['x', 'X']) else {
        return Err(format!("expected WxH, got {size:?}"));
    };
    let width: u32 = width
        .parse()
        .map_err(|e| format!("invalid width {width:?}: {e}"))?;
    let height: u32 = height
        .parse()
        .map_err(|e| format!("invalid height {height:?}: {e}"))?;
    if width == 0 || height == 0 {
        return Err(format!("window size must be non-zero, got {width}x{height}"));
    }

    Ok(Rect::new(x, y, width, height))
}
