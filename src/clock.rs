//! Clock abstraction for heartbeats and lease expiry
//!
//! Heartbeats are driven by a shared clock so tests can advance time
//! deterministically instead of sleeping.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

/// A clock that provides the current time and can wait on it
#[async_trait]
pub trait Clock: Send + Sync {
    /// Current wall-clock time
    fn now(&self) -> DateTime<Utc>;

    /// Wait until `duration` has elapsed on this clock
    async fn sleep(&self, duration: Duration);
}

/// Real system clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

#[cfg(any(test, feature = "test-support"))]
mod fake {
    use super::Clock;
    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone, Utc};
    use std::time::Duration;
    use tokio::sync::watch;

    /// Fake clock for testing with controllable time
    ///
    /// `sleep` resolves once `advance` has moved the clock past the deadline.
    pub struct FakeClock {
        current: watch::Sender<DateTime<Utc>>,
    }

    impl FakeClock {
        pub fn new() -> Self {
            let start = Utc
                .with_ymd_and_hms(2024, 1, 15, 10, 0, 0)
                .single()
                .unwrap_or_else(Utc::now);
            let (current, _) = watch::channel(start);
            Self { current }
        }

        /// Advance the clock by the given duration
        pub fn advance(&self, duration: Duration) {
            let step = chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::zero());
            self.current.send_modify(|now| *now += step);
        }

        /// Number of tasks currently sleeping on this clock
        pub fn sleepers(&self) -> usize {
            self.current.receiver_count()
        }
    }

    impl Default for FakeClock {
        fn default() -> Self {
            Self::new()
        }
    }

    #[async_trait]
    impl Clock for FakeClock {
        fn now(&self) -> DateTime<Utc> {
            *self.current.borrow()
        }

        async fn sleep(&self, duration: Duration) {
            let step = chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::zero());
            let deadline = self.now() + step;
            let mut rx = self.current.subscribe();
            // The sender lives as long as the clock, so this only errors on drop.
            let _ = rx.wait_for(|now| *now >= deadline).await;
        }
    }
}

#[cfg(any(test, feature = "test-support"))]
pub use fake::FakeClock;
