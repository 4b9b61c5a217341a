use tokio::sync::mpsc;

use crate::billing::types::{Dashboard, PendingSiteEntry};

/// Render events produced by the sync engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
  /// The pending list changed after a local edit
  PendingChanged(Vec<PendingSiteEntry>),
  /// A reconciliation pass produced a new dashboard
  Rendered(Box<Dashboard>),
  /// Sites shown as "processing" while a payment settles
  Processing(Vec<PendingSiteEntry>),
  /// The processing placeholder was removed
  ProcessingCleared,
  /// A failure with no foreground caller to report it to
  Error(String),
}

/// Receiving end of the engine's event channel
pub struct EventStream {
  rx: mpsc::UnboundedReceiver<SyncEvent>,
}

impl EventStream {
  pub(crate) fn channel() -> (mpsc::UnboundedSender<SyncEvent>, Self) {
    let (tx, rx) = mpsc::unbounded_channel();
    (tx, Self { rx })
  }

  /// Next event if one is already queued
  pub fn try_next(&mut self) -> Option<SyncEvent> {
    self.rx.try_recv().ok()
  }

  /// Every event queued so far
  pub fn drain(&mut self) -> Vec<SyncEvent> {
    std::iter::from_fn(|| self.try_next()).collect()
  }
}
