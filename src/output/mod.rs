//! Output reconciliation — where rendered frames end up on the desktop.
//!
//! [`BackgroundOutput`] owns one display session at a time: topology,
//! presentation surface, root publisher and the optional per-output
//! windows, all created by a load and destroyed by a free. A broken
//! connection tears the session down and loads a new one; the render loop
//! keeps running through the gap.
//!
//! [`WindowOutput`] is the plain-window counterpart used by the window
//! modes and as the fallback when RandR is missing.

pub mod publisher;
pub mod recovery;
pub mod surface;
pub mod topology;
pub mod windowed;
pub mod windows;

use std::collections::BTreeSet;
use std::time::Instant;

use crate::display::{Connector, DisplayError, DisplayServer};
use crate::geometry::Size;

use publisher::RootBackgroundPublisher;
use recovery::{FailureRecovery, Fault};
use surface::{PixelImage, PresentationSurface};
use topology::{Topology, Viewport};
use windows::Presentation;

pub use windowed::WindowOutput;

/// Output layer errors.
#[derive(Debug, thiserror::Error)]
pub enum OutputError {
    #[error("display: {0}")]
    Display(#[from] DisplayError),

    /// Degraded: the caller falls back to window mode.
    #[error("RandR is not available, cannot detect outputs")]
    RandrUnavailable,

    /// Fatal configuration error.
    #[error(
        "none of the requested outputs were detected (requested: {}; detected: {})",
        .requested.join(", "),
        .detected.join(", ")
    )]
    NoMatchingOutputs {
        detected: Vec<String>,
        requested: Vec<String>,
    },
}

/// A presentation target driven by the frame loop.
pub trait Output {
    /// Viewports to render this frame, in framebuffer coordinates.
    fn viewports(&self) -> &[Viewport];

    /// Size the framebuffer has to match, if any.
    fn full_size(&self) -> Option<Size>;

    /// CPU image the framebuffer is read back into, for outputs that
    /// push pixels to the server themselves.
    fn image_buffer(&mut self) -> Option<&mut PixelImage>;

    /// Push the current image to the display.
    fn present(&mut self) -> Result<(), OutputError>;

    /// Bumped whenever the output was (re)built; the frame loop
    /// re-reconciles the framebuffer size when it changes.
    fn generation(&self) -> u64;

    fn render_multiple(&self) -> bool {
        self.viewports().len() > 1
    }
}

/// Everything tied to one display connection.
struct Session<S: DisplayServer> {
    server: S,
    topology: Topology,
    surface: PresentationSurface,
    publisher: RootBackgroundPublisher,
    presentation: Presentation,
}

impl<S: DisplayServer> Session<S> {
    fn open(mut server: S, requested: &BTreeSet<String>) -> Result<Self, OutputError> {
        let topology = topology::discover(&mut server, requested)?;
        let surface = PresentationSurface::allocate(&mut server, topology.bounds, topology.root)?;

        let mut session = Session {
            server,
            topology,
            surface,
            publisher: RootBackgroundPublisher::new(),
            presentation: Presentation::SharedDrawable,
        };

        if let Err(e) = session.activate() {
            let connected = !e.is_fatal();
            session.close(connected);
            return Err(e.into());
        }
        Ok(session)
    }

    fn activate(&mut self) -> Result<(), DisplayError> {
        self.presentation = Presentation::select(&mut self.server, &self.topology)?;
        self.publisher.publish(&mut self.server, &self.surface)
    }

    fn present(&mut self, recovery: &mut FailureRecovery) -> Result<(), DisplayError> {
        let errors = self.server.dispatch_errors()?;
        recovery.record_protocol_errors(errors);

        self.surface.present(&mut self.server)?;
        if let Some(image) = self.surface.image() {
            self.presentation.present(&mut self.server, image)?;
        }
        self.publisher.damage(&mut self.server, &self.surface)?;
        self.server.flush()
    }

    /// Windows/GCs → image → GC → pixmap → connection.
    fn close(mut self, connected: bool) {
        let mut server = connected.then_some(&mut self.server);
        self.presentation.teardown(server.as_deref_mut());
        self.surface.release(server.as_deref_mut());
        if let Some(server) = server
            && let Err(e) = server.flush()
        {
            tracing::debug!(error = %e, "flush during teardown failed");
        }
    }
}

/// Desktop-background output.
pub struct BackgroundOutput<C: Connector> {
    connector: C,
    requested: BTreeSet<String>,
    session: Option<Session<C::Server>>,
    recovery: FailureRecovery,
    generation: u64,
}

impl<C: Connector> BackgroundOutput<C> {
    /// Connect, discover outputs and allocate the surface.
    pub fn new(
        connector: C,
        requested: BTreeSet<String>,
        recovery: FailureRecovery,
    ) -> Result<Self, OutputError> {
        let mut output = Self {
            connector,
            requested,
            session: None,
            recovery,
            generation: 0,
        };
        output.load()?;
        Ok(output)
    }

    fn load(&mut self) -> Result<(), OutputError> {
        let server = self.connector.connect()?;
        self.session = Some(Session::open(server, &self.requested)?);
        self.generation += 1;
        Ok(())
    }

    fn free(&mut self, connected: bool) {
        if let Some(session) = self.session.take() {
            session.close(connected);
        }
    }

    /// Tear everything down and load again with the same requested
    /// outputs. A session already dropped by [`Self::free`] is not touched
    /// again.
    pub fn reset(&mut self) -> Result<(), OutputError> {
        self.free(true);
        self.load()
    }

    /// Reset after the session was lost, spaced by the recovery policy.
    /// Display errors leave the output idle until the next attempt;
    /// configuration errors propagate.
    fn recover(&mut self) -> Result<(), OutputError> {
        if !self.recovery.should_attempt(Instant::now()) {
            return Ok(());
        }

        match self.reset() {
            Ok(()) => {
                self.recovery.reset_succeeded();
                Ok(())
            }
            Err(OutputError::Display(e)) => {
                self.recovery.reset_failed(&e);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    #[cfg(test)]
    fn published_pixmap(&self) -> Option<crate::display::Xid> {
        self.session.as_ref().and_then(|s| s.publisher.published())
    }

    #[cfg(test)]
    fn per_output_windows(&self) -> bool {
        matches!(
            self.session.as_ref().map(|s| &s.presentation),
            Some(Presentation::PerOutputWindows(_))
        )
    }

    #[cfg(test)]
    fn recovery(&self) -> &FailureRecovery {
        &self.recovery
    }
}

impl<C: Connector> Output for BackgroundOutput<C> {
    fn viewports(&self) -> &[Viewport] {
        self.session
            .as_ref()
            .map(|s| s.topology.viewports.as_slice())
            .unwrap_or(&[])
    }

    fn full_size(&self) -> Option<Size> {
        self.session.as_ref().map(|s| s.topology.bounds.size())
    }

    fn image_buffer(&mut self) -> Option<&mut PixelImage> {
        self.session.as_mut().and_then(|s| s.surface.image_mut())
    }

    fn present(&mut self) -> Result<(), OutputError> {
        let Some(session) = self.session.as_mut() else {
            return self.recover();
        };

        let Err(e) = session.present(&mut self.recovery) else {
            return Ok(());
        };

        match Fault::classify(&e) {
            Fault::Protocol => {
                self.recovery.protocol_error(&e);
                Ok(())
            }
            Fault::Fatal => {
                tracing::error!(error = %e, "critical X server error detected, recovering");
                self.free(false);
                self.recover()
            }
        }
    }

    fn generation(&self) -> u64 {
        self.generation
    }
}

impl<C: Connector> Drop for BackgroundOutput<C> {
    fn drop(&mut self) {
        self.free(true);
    }
}

/// Detected output inventory, for diagnostics.
pub fn list_outputs<C: Connector>(connector: &C) -> Result<Vec<Viewport>, OutputError> {
    let mut server = connector.connect()?;
    server.outputs().map_err(|e| match e {
        DisplayError::MissingExtension(_) => OutputError::RandrUnavailable,
        e => e.into(),
    })
}
