//! SQLite implementation of the pending-edit store.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;

use super::PendingStore;
use crate::billing::types::{PaymentHandoff, PendingEditRecord, PendingSiteEntry};

/// SQLite-based durable store.
pub struct SqliteStore {
  conn: Mutex<Connection>,
}

/// Schema for the key-value table.
const STORE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS kv_store (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    written_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

impl SqliteStore {
  /// Open the store at the default location.
  pub fn open() -> Result<Self> {
    let path = Self::default_path()?;
    Self::open_at(&path)
  }

  /// Open the store at an explicit path.
  pub fn open_at(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create data directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open state database at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  /// Store that lives only as long as the process.
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory database: {}", e))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    let store = Self {
      conn: Mutex::new(conn),
    };
    store.run_migrations()?;
    Ok(store)
  }

  /// Get the default database path.
  pub fn default_path() -> Result<std::path::PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("billsync").join("state.db"))
  }

  fn run_migrations(&self) -> Result<()> {
    let conn = self.lock()?;
    conn
      .execute_batch(STORE_SCHEMA)
      .map_err(|e| eyre!("Failed to run store migrations: {}", e))?;
    Ok(())
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  fn get(conn: &Connection, key: &str) -> Result<Option<String>> {
    conn
      .query_row(
        "SELECT value FROM kv_store WHERE key = ?",
        params![key],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read {}: {}", key, e))
  }
}

fn pending_key(namespace: &str) -> String {
  format!("pending:{}", namespace)
}

fn modified_key(namespace: &str) -> String {
  format!("pending:{}:modified", namespace)
}

fn handoff_key(namespace: &str) -> String {
  format!("handoff:{}", namespace)
}

impl PendingStore for SqliteStore {
  fn load_pending(&self, namespace: &str) -> Result<Option<PendingEditRecord>> {
    let conn = self.lock()?;
    let entries = Self::get(&conn, &pending_key(namespace))?;
    let modified = Self::get(&conn, &modified_key(namespace))?;

    let (entries, modified) = match (entries, modified) {
      (Some(e), Some(m)) => (e, m),
      _ => return Ok(None),
    };

    let entries: Vec<PendingSiteEntry> = serde_json::from_str(&entries)
      .map_err(|e| eyre!("Failed to deserialize pending entries: {}", e))?;
    let last_modified_at = DateTime::parse_from_rfc3339(&modified)
      .map(|dt| dt.with_timezone(&Utc))
      .map_err(|e| eyre!("Failed to parse timestamp '{}': {}", modified, e))?;

    Ok(Some(PendingEditRecord {
      entries,
      last_modified_at,
    }))
  }

  fn save_pending(&self, namespace: &str, record: &PendingEditRecord) -> Result<()> {
    let mut conn = self.lock()?;
    let data = serde_json::to_string(&record.entries)
      .map_err(|e| eyre!("Failed to serialize pending entries: {}", e))?;
    let modified = record.last_modified_at.to_rfc3339();

    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;
    for (key, value) in [(pending_key(namespace), data), (modified_key(namespace), modified)] {
      tx.execute(
        "INSERT OR REPLACE INTO kv_store (key, value, written_at) VALUES (?, ?, datetime('now'))",
        params![key, value],
      )
      .map_err(|e| eyre!("Failed to write {}: {}", key, e))?;
    }
    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn clear_pending(&self, namespace: &str) -> Result<()> {
    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;
    tx.execute(
      "DELETE FROM kv_store WHERE key IN (?, ?)",
      params![pending_key(namespace), modified_key(namespace)],
    )
    .map_err(|e| eyre!("Failed to clear pending record: {}", e))?;
    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;
    Ok(())
  }

  fn save_handoff(&self, namespace: &str, handoff: &PaymentHandoff) -> Result<()> {
    let conn = self.lock()?;
    let data = serde_json::to_string(handoff)
      .map_err(|e| eyre!("Failed to serialize handoff: {}", e))?;
    conn
      .execute(
        "INSERT OR REPLACE INTO kv_store (key, value, written_at) VALUES (?, ?, datetime('now'))",
        params![handoff_key(namespace), data],
      )
      .map_err(|e| eyre!("Failed to write handoff: {}", e))?;
    Ok(())
  }

  fn load_handoff(&self, namespace: &str) -> Result<Option<PaymentHandoff>> {
    let conn = self.lock()?;
    match Self::get(&conn, &handoff_key(namespace))? {
      Some(data) => {
        let handoff = serde_json::from_str(&data)
          .map_err(|e| eyre!("Failed to deserialize handoff: {}", e))?;
        Ok(Some(handoff))
      }
      None => Ok(None),
    }
  }

  fn clear_handoff(&self, namespace: &str) -> Result<()> {
    let conn = self.lock()?;
    conn
      .execute(
        "DELETE FROM kv_store WHERE key = ?",
        params![handoff_key(namespace)],
      )
      .map_err(|e| eyre!("Failed to clear handoff: {}", e))?;
    Ok(())
  }
}
