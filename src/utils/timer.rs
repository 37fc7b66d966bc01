//! Timer/timeout utility implemented using `tokio::time::Sleep`.

use std::pin::Pin;

use crate::utils::CopilotError;

use tokio::time::{self, Duration, Instant, Sleep};

/// Timer utility for signalling after a given timeout. A timer that is not
/// kicked off (or has been cancelled) never fires.
///
/// Must be used within the context of a tokio runtime.
#[derive(Debug)]
pub struct Timer {
    /// Inner `tokio::time::Sleep` future, wrapped in a pinned box to support
    /// await multiple times.
    sleep: Pin<Box<Sleep>>,

    /// Whether a deadline is currently armed.
    armed: bool,
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

impl Timer {
    /// Creates a new timer utility that is not armed.
    pub fn new() -> Self {
        Timer {
            sleep: Box::pin(time::sleep(Duration::ZERO)),
            armed: false,
        }
    }

    /// Arms the timer with the given duration, replacing any deadline that
    /// was previously set.
    pub fn kickoff(&mut self, dur: Duration) -> Result<(), CopilotError> {
        if dur.is_zero() {
            return Err(CopilotError::msg(format!(
                "invalid timeout duration {} ns",
                dur.as_nanos()
            )));
        }

        self.armed = true;
        self.sleep.as_mut().reset(Instant::now() + dur);
        Ok(())
    }

    /// Disarms the current deadline.
    pub fn cancel(&mut self) {
        self.armed = false;
    }

    /// Waits for the timer to timeout. Pends forever if not armed, so it is
    /// safe to use as a branch of a `tokio::select!` unconditionally.
    pub async fn timeout(&mut self) {
        if !self.armed {
            std::future::pending::<()>().await;
        }
        self.sleep.as_mut().await;
        self.armed = false;
    }
}
