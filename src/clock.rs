//! Time source injected into the sync engine.

use chrono::{DateTime, Utc};

/// Wall-clock time used for cache expiry, recency windows and handoff age.
pub trait Clock: Send + Sync {
  fn now(&self) -> DateTime<Utc>;
}

/// Clock backed by the system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
  fn now(&self) -> DateTime<Utc> {
    Utc::now()
  }
}

#[cfg(test)]
pub use manual::ManualClock;
