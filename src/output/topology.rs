//! Screen topology — output inventory, requested subset and the bounding
//! box the presentation surface is addressed in.
//!
//! [`Topology::compute`] is a pure function over the detected outputs so
//! the geometry rules can be checked without a server;
//! [`discover`] feeds it from a live [`DisplayServer`].

use std::collections::BTreeSet;

use crate::display::{DisplayError, DisplayServer};
use crate::geometry::{Rect, Size};

use super::OutputError;

/// Name given to the single viewport of global background mode.
pub const ROOT_VIEWPORT: &str = "root";

/// One monitor's rectangle.
///
/// Detected outputs carry global root coordinates; active viewports are
/// rebased into bounding-box coordinates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Viewport {
    pub name: String,
    pub rect: Rect,
}

impl Viewport {
    pub fn new(name: impl Into<String>, rect: Rect) -> Self {
        Self {
            name: name.into(),
            rect,
        }
    }
}

/// Minimal rectangle covering every active viewport, in root coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundingBox {
    pub offset_x: i32,
    pub offset_y: i32,
    pub width: u32,
    pub height: u32,
}

impl BoundingBox {
    pub fn size(&self) -> Size {
        Size::new(self.width, self.height)
    }

    /// The box itself as a rectangle in root coordinates.
    pub fn root_rect(&self) -> Rect {
        Rect::new(self.offset_x, self.offset_y, self.width, self.height)
    }

    /// Map a box-relative rectangle back to root coordinates.
    pub fn to_root(&self, rect: &Rect) -> Rect {
        rect.translate(self.offset_x, self.offset_y)
    }

    /// Union of `rects`, or `None` for an empty input.
    fn union<'a>(rects: impl IntoIterator<Item = &'a Rect>) -> Option<BoundingBox> {
        let mut bounds: Option<(i64, i64, i64, i64)> = None;
        for rect in rects {
            let (x, y) = (i64::from(rect.x), i64::from(rect.y));
            bounds = Some(match bounds {
                None => (x, y, rect.right(), rect.bottom()),
                Some((min_x, min_y, max_x, max_y)) => (
                    min_x.min(x),
                    min_y.min(y),
                    max_x.max(rect.right()),
                    max_y.max(rect.bottom()),
                ),
            });
        }

        bounds.map(|(min_x, min_y, max_x, max_y)| BoundingBox {
            offset_x: min_x as i32,
            offset_y: min_y as i32,
            width: (max_x - min_x) as u32,
            height: (max_y - min_y) as u32,
        })
    }
}

/// Result of topology discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    /// Every connected, active output (root coordinates). Diagnostics only.
    pub outputs: Vec<Viewport>,
    /// Viewports actually rendered to, box-relative, sorted by name.
    pub viewports: Vec<Viewport>,
    pub bounds: BoundingBox,
    pub root: Size,
    /// No outputs were requested: the whole root is one viewport.
    pub global: bool,
}

impl Topology {
    /// Select the requested outputs and compute the bounding box.
    ///
    /// An empty `requested` set selects global mode. A non-empty set
    /// matching no detected output is [`OutputError::NoMatchingOutputs`].
    pub fn compute(
        outputs: Vec<Viewport>,
        requested: &BTreeSet<String>,
        root: Size,
    ) -> Result<Topology, OutputError> {
        if requested.is_empty() {
            let bounds = BoundingBox {
                offset_x: 0,
                offset_y: 0,
                width: root.width,
                height: root.height,
            };
            return Ok(Topology {
                outputs,
                viewports: vec![Viewport::new(
                    ROOT_VIEWPORT,
                    Rect::new(0, 0, root.width, root.height),
                )],
                bounds,
                root,
                global: true,
            });
        }

        let mut active: Vec<Viewport> = Vec::new();
        for output in &outputs {
            if !requested.contains(&output.name) {
                continue;
            }
            // Mirrored outputs can report the same name twice; first wins.
            if active.iter().any(|v| v.name == output.name) {
                continue;
            }
            tracing::info!(name = %output.name, geometry = %output.rect, "found requested output");
            active.push(output.clone());
        }

        let Some(bounds) = BoundingBox::union(active.iter().map(|v| &v.rect)) else {
            return Err(OutputError::NoMatchingOutputs {
                detected: outputs.iter().map(|o| o.name.clone()).collect(),
                requested: requested.iter().cloned().collect(),
            });
        };

        let missing: Vec<&str> = requested
            .iter()
            .filter(|name| !active.iter().any(|v| &v.name == *name))
            .map(String::as_str)
            .collect();
        if !missing.is_empty() {
            tracing::warn!(missing = ?missing, "some requested outputs were not detected");
        }

        for viewport in &mut active {
            viewport.rect = viewport.rect.translate(-bounds.offset_x, -bounds.offset_y);
        }
        active.sort_by(|a, b| a.name.cmp(&b.name));

        tracing::info!(
            width = bounds.width,
            height = bounds.height,
            offset_x = bounds.offset_x,
            offset_y = bounds.offset_y,
            "render bounds"
        );

        Ok(Topology {
            outputs,
            viewports: active,
            bounds,
            root,
            global: false,
        })
    }

    #[cfg(test)]
    pub fn viewport(&self, name: &str) -> Option<&Viewport> {
        self.viewports.iter().find(|v| v.name == name)
    }
}

/// Query the server's outputs and compute the topology for `requested`.
pub fn discover<S: DisplayServer>(
    server: &mut S,
    requested: &BTreeSet<String>,
) -> Result<Topology, OutputError> {
    let root = server.root_size();
    tracing::info!(root = %root, "X11 root size");

    let outputs = server.outputs().map_err(|e| match e {
        DisplayError::MissingExtension(name) => {
            tracing::error!(extension = name, "cannot detect requested outputs");
            OutputError::RandrUnavailable
        }
        e => e.into(),
    })?;

    Topology::compute(outputs, requested, root)
}
