//! Plain window output: the driver presents its own window, so there is no
//! image to fill and nothing to push.

use crate::geometry::{Rect, Size};

use super::surface::PixelImage;
use super::topology::Viewport;
use super::{Output, OutputError};

pub const WINDOW_VIEWPORT: &str = "window";

#[derive(Debug)]
pub struct WindowOutput {
    viewports: [Viewport; 1],
    size: Size,
}

impl WindowOutput {
    pub fn new(size: Size) -> Self {
        Self {
            viewports: [Viewport::new(
                WINDOW_VIEWPORT,
                Rect::new(0, 0, size.width, size.height),
            )],
            size,
        }
    }
}

impl Output for WindowOutput {
    fn viewports(&self) -> &[Viewport] {
        &self.viewports
    }

    fn full_size(&self) -> Option<Size> {
        Some(self.size)
    }

    fn image_buffer(&mut self) -> Option<&mut PixelImage> {
        None
    }

    fn present(&mut self) -> Result<(), OutputError> {
        Ok(())
    }

    fn generation(&self) -> u64 {
        1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_viewport_covering_window() {
        let mut output = WindowOutput::new(Size::new(1280, 720));
        assert_eq!(output.viewports().len(), 1);
        assert_eq!(output.viewports()[0].rect, Rect::new(0, 0, 1280, 720));
        assert!(!output.render_multiple());
        assert!(output.image_buffer().is_none());
        assert!(output.present().is_ok());
    }
}
