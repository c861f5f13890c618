//! Render driver — the toolkit window seam and the per-frame loop.
//!
//! One render thread owns the [`WindowDriver`], the [`Output`] and the
//! [`Scene`]; nothing here is shared across threads except the stop
//! flag. Each frame runs clear → scene per viewport → readback into the
//! output's image → present → swap → event poll → counter → sleep, and
//! re-runs framebuffer reconciliation whenever the output was rebuilt.
//! The driver has its own X connection; when that one breaks the window is
//! re-created on the same schedule the output uses for its resets.

pub mod reconcile;
#[cfg(test)]
pub mod scripted;
pub mod software;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tokio::signal::unix::{SignalKind, signal as tokio_signal};

use crate::config::{RenderConfig, RenderMode};
use crate::display::DisplayError;
use crate::display::x11::X11Connector;
use crate::geometry::{Rect, Size};
use crate::output::recovery::FailureRecovery;
use crate::output::surface::ReadbackRegion;
use crate::output::{BackgroundOutput, Output, OutputError, WindowOutput};
use crate::scene::{Canvas, GradientScene, Scene};

use reconcile::{FramebufferReconciler, RetryBudget};
use software::{SoftwareDriver, WindowRole};

/// Driver errors.
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("X11: {0}")]
    Display(#[from] DisplayError),

    #[error("pixel transfer: {0}")]
    Transfer(String),

    /// A failed pixel transfer after readback leaves the framebuffer in an
    /// unknown state; the render loop stops on it.
    #[error(
        "pixel transfer failed (framebuffer {framebuffer}, image {full}, read {read}): {reason}"
    )]
    Readback {
        framebuffer: Size,
        full: Size,
        read: Size,
        reason: String,
    },
}

/// Window toolkit operations the render loop and the reconciler need.
pub trait WindowDriver {
    fn resize_window(&mut self, size: Size) -> Result<(), DriverError>;
    fn move_window(&mut self, x: i32, y: i32) -> Result<(), DriverError>;

    fn framebuffer_size(&self) -> Size;
    fn window_size(&self) -> Size;
    fn is_visible(&self) -> bool;

    fn show_window(&mut self) -> Result<(), DriverError>;
    fn hide_window(&mut self) -> Result<(), DriverError>;

    /// Process pending window system events without blocking.
    fn poll_events(&mut self) -> Result<(), DriverError>;
    fn swap_buffers(&mut self) -> Result<(), DriverError>;

    /// Time since the driver started, used as the scene clock.
    fn render_time(&self) -> Duration;

    fn close_requested(&self) -> bool;

    /// Re-create the window on a fresh connection after the previous one
    /// broke. Window size and visibility start over from creation.
    fn reconnect(&mut self) -> Result<(), DriverError>;

    /// Resize the underlying drawable directly on the server, bypassing
    /// the toolkit. Returns `Ok(false)` when the driver has no such path.
    fn resize_drawable(&mut self, _size: Size) -> Result<bool, DriverError> {
        Ok(false)
    }

    fn clear(&mut self);
    fn canvas(&mut self) -> Canvas<'_>;

    /// Copy the top-left `region` of the framebuffer into `dst` as BGRA
    /// rows `row_length` pixels apart.
    fn read_pixels(
        &mut self,
        region: Size,
        row_length: usize,
        dst: &mut [u8],
    ) -> Result<(), DriverError>;
}

/// Row copy behind CPU framebuffer readbacks.
pub(crate) fn copy_rows(
    src: &[u8],
    framebuffer: Size,
    region: Size,
    row_length: usize,
    dst: &mut [u8],
) -> Result<(), DriverError> {
    if region.is_empty() {
        return Ok(());
    }
    if region.min(framebuffer) != region || row_length < region.width as usize {
        return Err(DriverError::Transfer(format!(
            "region {region} does not fit framebuffer {framebuffer} / row length {row_length}"
        )));
    }

    let src_stride = framebuffer.width as usize * 4;
    let dst_stride = row_length * 4;
    let row_bytes = region.width as usize * 4;
    let rows = region.height as usize;
    if src.len() < (rows - 1) * src_stride + row_bytes
        || dst.len() < (rows - 1) * dst_stride + row_bytes
    {
        return Err(DriverError::Transfer("pixel buffer too small".into()));
    }

    for row in 0..rows {
        let from = row * src_stride;
        let to = row * dst_stride;
        dst[to..to + row_bytes].copy_from_slice(&src[from..from + row_bytes]);
    }
    Ok(())
}

/// What [`ReadbackLog::observe`] reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadbackNotice {
    Mismatch,
    Resolved,
}

/// De-duplicates readback size diagnostics: a mismatch is logged when it
/// first appears or its sizes change, and once more when it clears.
#[derive(Debug, Default)]
pub struct ReadbackLog {
    last_mismatch: Option<(Size, Size)>,
}

impl ReadbackLog {
    pub fn observe(&mut self, region: &ReadbackRegion) -> Option<ReadbackNotice> {
        if region.is_partial() {
            let key = (region.framebuffer, region.full);
            if self.last_mismatch == Some(key) {
                return None;
            }
            self.last_mismatch = Some(key);
            tracing::warn!(
                framebuffer = %region.framebuffer,
                image = %region.full,
                read = %region.read,
                "framebuffer smaller than output image, reading partial region"
            );
            return Some(ReadbackNotice::Mismatch);
        }

        self.last_mismatch.take().map(|_| {
            tracing::info!(size = %region.full, "framebuffer and output image sizes match");
            ReadbackNotice::Resolved
        })
    }
}

/// Time left to pad a frame out to `min_frame`.
pub fn frame_sleep(min_frame: Duration, elapsed: Duration) -> Duration {
    min_frame.saturating_sub(elapsed)
}

fn min_frame_time(max_fps: u32) -> Duration {
    Duration::from_secs(1) / max_fps.max(1)
}

/// The per-frame sequence over one driver, output and scene.
pub struct FrameLoop<D: WindowDriver, O: Output, S: Scene> {
    driver: D,
    output: O,
    scene: S,
    reconciler: FramebufferReconciler,
    readback: ReadbackLog,
    min_frame: Duration,
    frames: u64,
    /// Output generation the framebuffer was last reconciled against.
    reconciled: u64,
    /// The driver's connection broke and the window is being re-created.
    driver_lost: bool,
    driver_recovery: FailureRecovery,
}

impl<D: WindowDriver, O: Output, S: Scene> FrameLoop<D, O, S> {
    pub fn new(
        driver: D,
        output: O,
        scene: S,
        budget: RetryBudget,
        max_fps: u32,
        driver_recovery: FailureRecovery,
    ) -> Self {
        Self {
            driver,
            output,
            scene,
            reconciler: FramebufferReconciler::new(budget),
            readback: ReadbackLog::default(),
            min_frame: min_frame_time(max_fps),
            frames: 0,
            reconciled: 0,
            driver_lost: false,
            driver_recovery,
        }
    }

    fn reconcile(&mut self) -> Result<(), DriverError> {
        let generation = self.output.generation();
        if generation == self.reconciled {
            return Ok(());
        }
        if let Some(size) = self.output.full_size() {
            let outcome = self.reconciler.ensure_size(&mut self.driver, size)?;
            if !outcome.converged() {
                tracing::debug!(
                    warnings = self.reconciler.mismatch_warnings(),
                    "rendering into an unreconciled framebuffer"
                );
            }
        }
        self.reconciled = generation;
        Ok(())
    }

    /// Re-create the driver window, spaced like output resets. `true` once
    /// the driver is usable again.
    fn reconnect_driver(&mut self) -> Result<bool, DriverError> {
        if !self.driver_recovery.should_attempt(Instant::now()) {
            return Ok(false);
        }
        match self.driver.reconnect() {
            Ok(()) => {
                self.driver_recovery.reset_succeeded();
                self.driver_lost = false;
                // The new window has its creation size again.
                self.reconciled = 0;
                Ok(true)
            }
            Err(DriverError::Display(e)) if e.is_fatal() => {
                self.driver_recovery.reset_failed(&e);
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    fn render(&mut self) {
        self.driver.clear();
        let time = self.driver.render_time();
        let mut canvas = self.driver.canvas();
        for viewport in self.output.viewports() {
            self.scene.render(&mut canvas, &viewport.rect, time);
        }
    }

    fn read_back(&mut self) -> Result<(), DriverError> {
        let framebuffer = self.driver.framebuffer_size();
        let Some(image) = self.output.image_buffer() else {
            return Ok(());
        };

        let full = image.size();
        let driver = &mut self.driver;
        let region = image
            .readback(framebuffer, |region, row_length, buffer| {
                driver.read_pixels(region, row_length, buffer)
            })
            .map_err(|e| DriverError::Readback {
                framebuffer,
                full,
                read: framebuffer.min(full),
                reason: e.to_string(),
            })?;

        self.readback.observe(&region);
        Ok(())
    }

    fn draw(&mut self) -> Result<(), RunError> {
        self.reconcile()?;
        self.render();
        self.read_back()?;
        self.output.present()?;
        self.driver.swap_buffers()?;
        self.driver.poll_events()?;
        Ok(())
    }

    /// Run one frame and return how long to sleep before the next one.
    ///
    /// A broken driver connection skips drawing until the window has been
    /// re-created; the output keeps presenting (and recovering) meanwhile.
    pub fn frame(&mut self) -> Result<Duration, RunError> {
        let started = Instant::now();

        if self.driver_lost && !self.reconnect_driver()? {
            self.output.present()?;
            return Ok(frame_sleep(self.min_frame, started.elapsed()));
        }

        match self.draw() {
            Ok(()) => self.frames += 1,
            Err(RunError::Driver(DriverError::Display(e))) if e.is_fatal() => {
                tracing::error!(error = %e, "driver lost its X connection, recreating window");
                self.driver_lost = true;
            }
            Err(e) => return Err(e),
        }

        let elapsed = started.elapsed();
        tracing::trace!(frame = self.frames, elapsed = ?elapsed, "frame done");
        Ok(frame_sleep(self.min_frame, elapsed))
    }

    /// Render until `stop` is set or the window is closed.
    pub fn run(&mut self, stop: &AtomicBool) -> Result<(), RunError> {
        while !stop.load(Ordering::Relaxed) {
            if self.driver.close_requested() {
                tracing::info!("window closed");
                break;
            }
            let sleep = self.frame()?;
            if !sleep.is_zero() {
                std::thread::sleep(sleep);
            }
        }
        tracing::info!(frames = self.frames, "render loop stopped");
        Ok(())
    }

    #[cfg(test)]
    fn frames(&self) -> u64 {
        self.frames
    }

    #[cfg(test)]
    fn driver(&self) -> &D {
        &self.driver
    }

    #[cfg(test)]
    fn driver_mut(&mut self) -> &mut D {
        &mut self.driver
    }

    #[cfg(test)]
    fn output(&self) -> &O {
        &self.output
    }

    #[cfg(test)]
    fn output_mut(&mut self) -> &mut O {
        &mut self.output
    }
}

/// Top-level render errors.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("output: {0}")]
    Output(#[from] OutputError),
    #[error("driver: {0}")]
    Driver(#[from] DriverError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("render thread panicked")]
    Panicked,
}

/// Run the renderer until SIGTERM/SIGINT, a closed window or a fatal
/// error.
///
/// The frame loop runs on its own thread, which owns every X resource;
/// this task only waits for signals and tells it to stop.
pub async fn run(config: RenderConfig) -> Result<(), RunError> {
    let mut sig_term = tokio_signal(SignalKind::terminate())?;
    let mut sig_int = tokio_signal(SignalKind::interrupt())?;

    let stop = Arc::new(AtomicBool::new(false));
    let (done_tx, done_rx) = tokio::sync::oneshot::channel::<()>();

    let thread_stop = Arc::clone(&stop);
    let render = std::thread::Builder::new()
        .name("render".into())
        .spawn(move || {
            let result = render_thread(&config, &thread_stop);
            let _ = done_tx.send(());
            result
        })?;

    tokio::select! {
        _ = done_rx => {}
        _ = sig_term.recv() => {
            tracing::info!("received SIGTERM, shutting down");
        }
        _ = sig_int.recv() => {
            tracing::info!("received SIGINT, shutting down");
        }
    }

    stop.store(true, Ordering::Relaxed);
    render.join().map_err(|_| RunError::Panicked)?
}

fn render_thread(config: &RenderConfig, stop: &AtomicBool) -> Result<(), RunError> {
    if config.mode != RenderMode::Background {
        return render_window(config, stop);
    }

    let connector = X11Connector::new(config.display.clone());
    let output = match BackgroundOutput::new(
        connector,
        config.screen_roots.clone(),
        FailureRecovery::default(),
    ) {
        Ok(output) => output,
        Err(OutputError::RandrUnavailable) => {
            tracing::warn!("RandR unavailable, falling back to window mode");
            return render_window(&config.windowed(), stop);
        }
        Err(e) => return Err(e.into()),
    };

    let size = output.full_size().unwrap_or_else(|| config.window_size());
    let driver = SoftwareDriver::open(
        config.display.as_deref(),
        WindowRole::Hidden,
        Rect::new(0, 0, size.width, size.height),
    )?;
    drive(driver, output, config, stop)
}

fn render_window(config: &RenderConfig, stop: &AtomicBool) -> Result<(), RunError> {
    let role = match config.mode {
        RenderMode::Explicit => WindowRole::Explicit,
        _ => WindowRole::Normal,
    };
    let driver = SoftwareDriver::open(config.display.as_deref(), role, config.window)?;
    let output = WindowOutput::new(config.window_size());
    drive(driver, output, config, stop)
}

fn drive<D: WindowDriver, O: Output>(
    driver: D,
    output: O,
    config: &RenderConfig,
    stop: &AtomicBool,
) -> Result<(), RunError> {
    tracing::info!(
        mode = ?config.mode,
        max_fps = config.max_fps,
        viewports = output.viewports().len(),
        render_multiple = output.render_multiple(),
        "render loop starting"
    );
    let mut frames = FrameLoop::new(
        driver,
        output,
        GradientScene::default(),
        config.retry,
        config.max_fps,
        FailureRecovery::default(),
    );
    frames.run(stop)
}
