use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};

/// Time source for the placement loop. Workers only observe time through
/// this trait, so tests can drive the whole state machine with a manually
/// advanced clock instead of real sleeps.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> DateTime<Utc>;
    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + Send;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + Send {
        tokio::time::sleep(duration)
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Clock whose sleeps complete immediately and advance the reported
    /// time. Clones share the same underlying instant, so a test can hold
    /// one handle while the worker under test holds another.
    #[derive(Debug, Clone)]
    pub struct ManualClock {
        now: Arc<Mutex<DateTime<Utc>>>,
    }

    impl ManualClock {
        pub fn starting_at(now: DateTime<Utc>) -> Self {
            ManualClock {
                now: Arc::new(Mutex::new(now)),
            }
        }

        pub fn advance(&self, duration: Duration) {
            let mut now = self.now.lock().unwrap();
            *now += chrono::Duration::from_std(duration).unwrap();
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.now.lock().unwrap()
        }

        fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + Send {
            self.advance(duration);
            std::future::ready(())
        }
    }
}
