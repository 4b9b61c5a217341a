//! Stale-result guard for overlapping reconciliation passes.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

/// Hands out increasing pass numbers and remembers the newest one applied.
#[derive(Debug, Default)]
pub struct SequenceGuard {
  issued: AtomicU64,
  applied: Mutex<u64>,
}

impl SequenceGuard {
  pub fn new() -> Self {
    Self::default()
  }

  /// Number for a pass that is about to start.
  pub fn begin(&self) -> u64 {
    self.issued.fetch_add(1, Ordering::SeqCst) + 1
  }

  /// Mark pass `seq` as applied unless a newer pass already was.
  ///
  /// Returns `false` when the pass is stale and its result must be dropped.
  pub fn try_commit(&self, seq: u64) -> bool {
    let mut applied = self.applied.lock().unwrap_or_else(PoisonError::into_inner);
    if seq < *applied {
      return false;
    }
    *applied = seq;
    true
  }

  /// Newest pass applied so far (0 before the first).
  pub fn latest(&self) -> u64 {
    *self.applied.lock().unwrap_or_else(PoisonError::into_inner)
  }
}
