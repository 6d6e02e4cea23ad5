use std::time::Duration;
use tokio::time::Instant;

/// Coarse 1 Hz clock shared by all engines.
///
/// Readings are whole seconds since the clock was created, taken from the
/// monotonic timebase, so deadlines survive wall-clock adjustments. Reading
/// is cheap enough to do per packet. A process that was suspended resumes
/// with deadlines in the past; [`Clock::reschedule`] detects that and clamps.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    epoch: Instant,
}

impl Clock {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }

    /// Current coarse time, in whole seconds.
    pub fn now(&self) -> u64 {
        self.epoch.elapsed().as_secs()
    }

    /// Sub-second reading on the same timebase.
    pub fn now_precise(&self) -> Duration {
        self.epoch.elapsed()
    }

    /// The [`Instant`] corresponding to an absolute coarse deadline.
    pub fn instant_at(&self, deadline: u64) -> Instant {
        self.epoch + Duration::from_secs(deadline)
    }

    /// Suspends until the absolute coarse deadline has passed.
    pub async fn sleep_until(&self, deadline: u64) {
        tokio::time::sleep_until(self.instant_at(deadline)).await;
    }

    /// Suspends for a relative duration, on the same timebase as the
    /// deadlines.
    pub async fn sleep(&self, duration: Duration) {
        tokio::time::sleep_until(Instant::now() + duration).await;
    }

    /// Makes sure `deadline` lies in the future, clamping it to the current
    /// time otherwise. Returns `false` if the deadline had to be adjusted.
    pub fn reschedule(&self, deadline: &mut u64) -> bool {
        let now = self.now();

        if *deadline < now {
            tracing::warn!("Too much time drift, resynchronizing");
            *deadline = now;
            return false;
        }

        true
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}
