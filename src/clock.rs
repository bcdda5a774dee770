//! Injectable clock source.
//!
//! Every component that aggregates over time windows (breaker, guard,
//! user budgets, cache TTL) takes its notion of "now" from a [`ClockFn`]
//! so tests can pin time instead of sleeping.

use chrono::{DateTime, Utc};
use std::sync::Arc;

/// A shared closure returning the current time.
pub type ClockFn = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// The default wall-clock source.
pub fn system_clock() -> ClockFn {
    Arc::new(Utc::now)
}

#[cfg(test)]
pub(crate) mod test_clock {
    use super::*;
    use chrono::Duration;
    use std::sync::Mutex;

    /// A manually-advanced clock for window and TTL tests.
    #[derive(Clone)]
    pub struct ManualClock {
        now: Arc<Mutex<DateTime<Utc>>>,
    }

    impl ManualClock {
        pub fn new() -> Self {
            Self {
                now: Arc::new(Mutex::new(Utc::now())),
            }
        }

        pub fn clock_fn(&self) -> ClockFn {
            let now = Arc::clone(&self.now);
            Arc::new(move || *now.lock().unwrap())
        }

        pub fn advance(&self, by: Duration) {
            let mut now = self.now.lock().unwrap();
            *now += by;
        }
    }
}
