//! Core traits and types for the request cache.

use chrono::{DateTime, Utc};

/// Trait for request descriptors that can be cached.
///
/// Two requests with the same `cache_key` are considered identical: they
/// share cache entries and in-flight calls.
pub trait QueryKey {
  /// Canonical key: endpoint plus normalized parameters.
  fn cache_key(&self) -> String;

  /// Human-readable description for logs.
  fn description(&self) -> String;
}

impl QueryKey for str {
  fn cache_key(&self) -> String {
    self.to_string()
  }

  fn description(&self) -> String {
    self.to_string()
  }
}

/// Result from a cache operation, including data and metadata about the source.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was fetched (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  /// Create a new cache result from a call this caller issued.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  /// Create a new cache result from a stored entry.
  pub fn from_cache(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Cache,
      cached_at: Some(cached_at),
    }
  }

  /// Create a new cache result from a call another caller issued.
  pub fn shared(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Shared,
      cached_at: None,
    }
  }
}

/// Indicates where returned data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// This caller issued the network call
  Network,
  /// Served from a fresh cache entry
  Cache,
  /// Attached to a call that was already in flight
  Shared,
}
