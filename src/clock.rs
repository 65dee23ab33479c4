use std::fmt::Debug;
use std::time::Duration;
use tokio::time::Instant;

/// Monotonic time source for the connection worker and deadline computation. Implementations
///  return `tokio::time::Instant` so that paused time in tests applies to timers and to the
///  clock alike.
#[cfg_attr(test, mockall::automock)]
pub trait Clock: Debug + Send + Sync + 'static {
    fn now(&self) -> Instant;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TokioClock;
impl Clock for TokioClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// A countdown bound to a fixed point in time. It holds no timer resources: expiry is checked by
///  whoever polls it.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct Deadline {
    at: Instant,
}
impl Deadline {
    pub fn after(now: Instant, timeout: Duration) -> Deadline {
        Deadline { at: now + timeout }
    }

    pub fn at(&self) -> Instant {
        self.at
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.at
    }

    pub fn remaining(&self, now: Instant) -> Duration {
        self.at.saturating_duration_since(now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::fresh(0, 500, false, 500)]
    #[case::halfway(250, 500, false, 250)]
    #[case::one_short(499, 500, false, 1)]
    #[case::exact(500, 500, true, 0)]
    #[case::overshoot(800, 500, true, 0)]
    #[case::zero_timeout(0, 0, true, 0)]
    fn test_deadline(#[case] elapsed_millis: u64, #[case] timeout_millis: u64, #[case] expired: bool, #[case] remaining_millis: u64) {
        let start = Instant::now();
        let deadline = Deadline::after(start, Duration::from_millis(timeout_millis));

        let now = start + Duration::from_millis(elapsed_millis);
        assert_eq!(deadline.is_expired(now), expired);
        assert_eq!(deadline.remaining(now), Duration::from_millis(remaining_millis));
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokio_clock_follows_paused_time() {
        let clock = TokioClock;
        let before = clock.now();
        tokio::time::advance(Duration::from_millis(1234)).await;
        assert_eq!(clock.now() - before, Duration::from_millis(1234));
    }
}
