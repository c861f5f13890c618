//! Framebuffer reconciliation after a resize request.
//!
//! The framebuffer, the toolkit window and the X drawable report their
//! sizes independently, and a window manager may apply a resize late or
//! not at all. [`FramebufferReconciler::ensure_size`] polls for agreement
//! within a fixed budget, remaps a hidden window to force late drawable
//! updates, tries a direct server-side resize if the driver offers one,
//! and otherwise warns and carries on with whatever size it got.

use crate::geometry::Size;

use super::{DriverError, WindowDriver};

/// Where a hidden window is parked while it is mapped for the remap
/// rounds.
const OFFSCREEN: i32 = -10000;

/// Number of poll rounds spent before and after remapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryBudget {
    pub initial_rounds: u32,
    pub remap_rounds: u32,
}

impl Default for RetryBudget {
    fn default() -> Self {
        Self {
            initial_rounds: 4,
            remap_rounds: 4,
        }
    }
}

/// Outcome of one [`FramebufferReconciler::ensure_size`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Convergence {
    /// Both sizes matched after `rounds` initial polls.
    Settled { rounds: u32 },
    /// Matched after `rounds` polls with the window mapped off-screen.
    AfterRemap { rounds: u32 },
    /// Matched only after the driver resized the drawable directly.
    Forced,
    /// Gave up. Rendering continues on the sizes observed here.
    Mismatch { framebuffer: Size, window: Size },
}

impl Convergence {
    pub fn converged(&self) -> bool {
        !matches!(self, Convergence::Mismatch { .. })
    }
}

#[derive(Debug)]
pub struct FramebufferReconciler {
    budget: RetryBudget,
    mismatch_warnings: u64,
}

impl FramebufferReconciler {
    pub fn new(budget: RetryBudget) -> Self {
        Self {
            budget,
            mismatch_warnings: 0,
        }
    }

    /// Resize the driver's window to `requested` and wait, within the
    /// retry budget, for framebuffer and window to both report it.
    ///
    /// Never loops past the budget. Non-convergence is logged once per
    /// call and is not an error.
    pub fn ensure_size<D: WindowDriver + ?Sized>(
        &mut self,
        driver: &mut D,
        requested: Size,
    ) -> Result<Convergence, DriverError> {
        tracing::info!(
            requested = %requested,
            framebuffer = %driver.framebuffer_size(),
            window = %driver.window_size(),
            "resizing framebuffer"
        );

        driver.resize_window(requested)?;
        if let Some(rounds) = poll_until(driver, requested, self.budget.initial_rounds)? {
            tracing::info!(rounds, size = %requested, "framebuffer size settled");
            return Ok(Convergence::Settled { rounds });
        }

        // Some drivers only commit the drawable size when the window is
        // mapped. A visible window is already mapped.
        if !driver.is_visible() && self.budget.remap_rounds > 0 {
            tracing::debug!("framebuffer size not applied yet, remapping window off-screen");
            driver.move_window(OFFSCREEN, OFFSCREEN)?;
            driver.show_window()?;
            let settled = poll_until(driver, requested, self.budget.remap_rounds)?;
            driver.hide_window()?;

            if let Some(rounds) = settled {
                tracing::info!(rounds, size = %requested, "framebuffer size settled after remap");
                return Ok(Convergence::AfterRemap { rounds });
            }
        }

        if driver.resize_drawable(requested)? {
            driver.poll_events()?;
        }

        if matches_size(driver, requested) {
            tracing::info!(size = %requested, "framebuffer size forced on the drawable");
            return Ok(Convergence::Forced);
        }

        let framebuffer = driver.framebuffer_size();
        let window = driver.window_size();
        self.mismatch_warnings += 1;
        tracing::warn!(
            requested = %requested,
            framebuffer = %framebuffer,
            window = %window,
            "framebuffer size mismatch, continuing with best-effort surface"
        );
        Ok(Convergence::Mismatch {
            framebuffer,
            window,
        })
    }

    /// Number of mismatch warnings logged so far.
    pub fn mismatch_warnings(&self) -> u64 {
        self.mismatch_warnings
    }
}

fn matches_size<D: WindowDriver + ?Sized>(driver: &D, requested: Size) -> bool {
    driver.framebuffer_size() == requested && driver.window_size() == requested
}

/// Poll up to `rounds` times; the round on which both sizes matched.
fn poll_until<D: WindowDriver + ?Sized>(
    driver: &mut D,
    requested: Size,
    rounds: u32,
) -> Result<Option<u32>, DriverError> {
    for round in 1..=rounds {
        driver.poll_events()?;
        if matches_size(driver, requested) {
            return Ok(Some(round));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::scripted::ScriptedDriver;

    const TARGET: Size = Size::new(3200, 1080);

    fn reconciler() -> FramebufferReconciler {
        FramebufferReconciler::new(RetryBudget::default())
    }

    #[test]
    fn converges_on_second_poll() {
        let mut driver = ScriptedDriver::new(Size::new(640, 480));
        driver.apply_after_polls = Some(2);
        let mut reconciler = reconciler();

        let outcome = reconciler.ensure_size(&mut driver, TARGET).unwrap();

        assert_eq!(outcome, Convergence::Settled { rounds: 2 });
        assert_eq!(reconciler.mismatch_warnings(), 0);
        assert_eq!(driver.polls, 2);
        assert_eq!(driver.shows, 0);
    }

    #[test]
    fn converges_after_remap_and_hides_again() {
        let mut driver = ScriptedDriver::new(Size::new(640, 480));
        driver.apply_on_show = true;
        let mut reconciler = reconciler();

        let outcome = reconciler.ensure_size(&mut driver, TARGET).unwrap();

        assert_eq!(outcome, Convergence::AfterRemap { rounds: 1 });
        assert_eq!(reconciler.mismatch_warnings(), 0);
        assert_eq!(driver.position, (OFFSCREEN, OFFSCREEN));
        assert_eq!(driver.shows, 1);
        assert!(!driver.is_visible());
    }

    #[test]
    fn never_converges_warns_once() {
        let mut driver = ScriptedDriver::new(Size::new(640, 480));
        let mut reconciler = reconciler();

        let outcome = reconciler.ensure_size(&mut driver, TARGET).unwrap();

        assert_eq!(
            outcome,
            Convergence::Mismatch {
                framebuffer: Size::new(640, 480),
                window: Size::new(640, 480),
            }
        );
        assert!(!outcome.converged());
        assert_eq!(reconciler.mismatch_warnings(), 1);
        // Bounded: 4 initial + 4 remap rounds, nothing more.
        assert_eq!(driver.polls, 8);
    }

    #[test]
    fn direct_drawable_resize_is_last_resort() {
        let mut driver = ScriptedDriver::new(Size::new(640, 480));
        driver.direct_resize = true;
        let mut reconciler = reconciler();

        let outcome = reconciler.ensure_size(&mut driver, TARGET).unwrap();

        assert_eq!(outcome, Convergence::Forced);
        assert_eq!(driver.direct_resizes, 1);
        assert_eq!(reconciler.mismatch_warnings(), 0);
    }

    #[test]
    fn visible_window_is_not_remapped() {
        let mut driver = ScriptedDriver::new(Size::new(640, 480));
        driver.visible = true;
        driver.apply_on_show = true;
        let mut reconciler = reconciler();

        let outcome = reconciler.ensure_size(&mut driver, TARGET).unwrap();

        assert!(matches!(outcome, Convergence::Mismatch { .. }));
        assert_eq!(driver.shows, 0);
        assert_eq!(driver.polls, 4);
    }

    #[test]
    fn budget_is_configurable() {
        let mut driver = ScriptedDriver::new(Size::new(640, 480));
        driver.apply_after_polls = Some(6);
        let mut reconciler = FramebufferReconciler::new(RetryBudget {
            initial_rounds: 8,
            remap_rounds: 0,
        });

        let outcome = reconciler.ensure_size(&mut driver, TARGET).unwrap();
        assert_eq!(outcome, Convergence::Settled { rounds: 6 });
    }

    #[test]
    fn mismatch_warnings_accumulate_per_call() {
        let mut driver = ScriptedDriver::new(Size::new(640, 480));
        let mut reconciler = FramebufferReconciler::new(RetryBudget {
            initial_rounds: 1,
            remap_rounds: 1,
        });

        reconciler.ensure_size(&mut driver, TARGET).unwrap();
        reconciler.ensure_size(&mut driver, TARGET).unwrap();
        assert_eq!(reconciler.mismatch_warnings(), 2);
    }
}
