//! Durable local storage for pending edits and payment handoffs.
//!
//! Survives restarts of the client. Per user, the pending entries and their
//! last-modified timestamp live under two keys that are always written and
//! cleared together.

mod sqlite;

use color_eyre::Result;
use sha2::{Digest, Sha256};

use crate::billing::types::{PaymentHandoff, PendingEditRecord};

pub use sqlite::SqliteStore;

/// Trait for durable pending-edit storage backends.
pub trait PendingStore: Send + Sync {
  /// Load the pending record for a user namespace.
  fn load_pending(&self, namespace: &str) -> Result<Option<PendingEditRecord>>;

  /// Replace the pending record (entries and timestamp in one write).
  fn save_pending(&self, namespace: &str, record: &PendingEditRecord) -> Result<()>;

  /// Remove the pending record (entries and timestamp in one write).
  fn clear_pending(&self, namespace: &str) -> Result<()>;

  /// Store the handoff written right before a checkout redirect.
  fn save_handoff(&self, namespace: &str, handoff: &PaymentHandoff) -> Result<()>;

  /// Read the handoff without consuming it.
  fn load_handoff(&self, namespace: &str) -> Result<Option<PaymentHandoff>>;

  /// Remove the handoff.
  fn clear_handoff(&self, namespace: &str) -> Result<()>;
}

/// Storage namespace for a user: a stable prefix of the email's SHA-256.
pub fn namespace_for(email: &str) -> String {
  let mut hasher = Sha256::new();
  hasher.update(email.trim().to_lowercase().as_bytes());
  let digest = hex::encode(hasher.finalize());
  digest[..16].to_string()
}
