//! Clock abstraction. All "now" readings go through a [`TimeService`].

use std::sync::atomic::{AtomicI64, Ordering};

pub trait TimeService: Send + Sync {
    /// Current time in milliseconds
    fn current_time(&self) -> i64;
}

/// Wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemTimeService;

impl TimeService for SystemTimeService {
    fn current_time(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// Settable clock for tests and simulations
#[derive(Debug, Default)]
pub struct ManualTimeService {
    now: AtomicI64,
}

impl ManualTimeService {
    pub fn new(now: i64) -> Self {
        ManualTimeService {
            now: AtomicI64::new(now),
        }
    }

    pub fn set(&self, now: i64) {
        self.now.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, millis: i64) -> i64 {
        self.now.fetch_add(millis, Ordering::SeqCst) + millis
    }
}

impl TimeService for ManualTimeService {
    fn current_time(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}
