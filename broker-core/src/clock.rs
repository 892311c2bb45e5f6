//! An injectable source of the current instant.
//!
//! Every rotation and expiry check in this crate reads the time through a
//! `Clock` rather than calling `SystemTime::now()` directly, so tests can
//! drive rotation and expiry deterministically instead of depending on a
//! process-global clock.

use std::{
    sync::{Arc, Mutex},
    time::SystemTime,
};

/// A source of the current wall-clock instant.
pub trait Clock: Send + Sync {
    fn now(&self) -> SystemTime;
}

/// The real clock, backed by `SystemTime::now()`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// A settable clock for tests. Cloning shares the same underlying instant.
#[derive(Debug, Clone)]
pub struct MockClock {
    inner: Arc<Mutex<SystemTime>>,
}

impl MockClock {
    pub fn new(now: SystemTime) -> Self {
        Self {
            inner: Arc::new(Mutex::new(now)),
        }
    }

    pub fn set(&self, now: SystemTime) {
        *self.inner.lock().expect("MockClock mutex poisoned") = now;
    }

    pub fn advance(&self, delta: std::time::Duration) {
        let mut guard = self.inner.lock().expect("MockClock mutex poisoned");
        *guard += delta;
    }
}

impl Clock for MockClock {
    fn now(&self) -> SystemTime {
        *self.inner.lock().expect("MockClock mutex poisoned")
    }
}

/// A type-erased, cheaply-cloneable handle to a [`Clock`].
pub type DynClock = Arc<dyn Clock>;
