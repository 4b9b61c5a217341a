//! Keyed debounce scheduler for refresh triggers.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::debug;

struct Scheduled {
  id: u64,
  handle: JoinHandle<()>,
}

#[derive(Default)]
struct Inner {
  scheduled: Mutex<HashMap<String, Scheduled>>,
  next_id: Mutex<u64>,
  running: AtomicUsize,
  idle: Notify,
}

/// Coalesces bursts of calls under one key into a single delayed run.
///
/// Scheduling under a key cancels whatever is still waiting under that key,
/// so only the action from the last call of a burst executes.
#[derive(Clone, Default)]
pub struct Debouncer {
  inner: Arc<Inner>,
}

impl Debouncer {
  pub fn new() -> Self {
    Self::default()
  }

  /// Run `action` once after `delay`, replacing any pending action under `key`.
  pub fn schedule<F, Fut>(&self, key: &str, delay: Duration, action: F)
  where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
  {
    let id = {
      let mut next = lock(&self.inner.next_id);
      *next += 1;
      *next
    };

    let mut scheduled = lock(&self.inner.scheduled);

    let inner = Arc::clone(&self.inner);
    let task_key = key.to_string();
    let handle = tokio::spawn(async move {
      tokio::time::sleep(delay).await;

      {
        let mut scheduled = lock(&inner.scheduled);
        match scheduled.get(&task_key) {
          Some(s) if s.id == id => {
            scheduled.remove(&task_key);
          }
          _ => return,
        }
        // Counted as running before leaving the map so wait_idle never sees a gap
        inner.running.fetch_add(1, Ordering::SeqCst);
      }

      action().await;

      inner.running.fetch_sub(1, Ordering::SeqCst);
      inner.idle.notify_waiters();
    });

    if let Some(previous) = scheduled.insert(key.to_string(), Scheduled { id, handle }) {
      debug!("debounce: superseding pending action for {}", key);
      previous.handle.abort();
    }
  }

  /// Drop the pending action under `key`, if any.
  pub fn cancel(&self, key: &str) -> bool {
    let removed = lock(&self.inner.scheduled).remove(key);
    match removed {
      Some(s) => {
        s.handle.abort();
        self.inner.idle.notify_waiters();
        true
      }
      None => false,
    }
  }

  fn is_idle(&self) -> bool {
    lock(&self.inner.scheduled).is_empty() && self.inner.running.load(Ordering::SeqCst) == 0
  }

  /// Wait until nothing is scheduled and no action is running.
  pub async fn wait_idle(&self) {
    loop {
      let notified = self.inner.idle.notified();
      tokio::pin!(notified);
      notified.as_mut().enable();
      if self.is_idle() {
        return;
      }
      notified.await;
    }
  }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
  m.lock().unwrap_or_else(PoisonError::into_inner)
}
