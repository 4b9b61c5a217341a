//! Pending-edit reconciliation.
//!
//! Decides which of three candidate pending sets is authoritative on a load:
//! the set held by the running session, the durable local copy, or the
//! backend's snapshot. Pure with respect to its inputs.

use chrono::{DateTime, Duration, Utc};

use crate::billing::types::{BillingPeriod, PendingEditRecord, PendingSiteEntry};
use crate::error::PendingEditError;

/// Which source won a reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingSource {
  /// Backend reported no pending sites: payment completed or cleared elsewhere
  BackendCleared,
  /// Edits made during this session
  Session,
  /// Durable copy edited within the recency window
  RecentLocalEdit,
  /// Durable copy is a subset of the backend (removals not yet mirrored)
  LocalSubset,
  /// Backend snapshot, including every case no other rule resolves
  Backend,
}

/// The three candidate pending sets.
#[derive(Debug, Clone, Copy)]
pub struct PendingInputs<'a> {
  pub in_memory: &'a [PendingSiteEntry],
  pub durable: Option<&'a PendingEditRecord>,
  pub backend: &'a [PendingSiteEntry],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciliation {
  pub entries: Vec<PendingSiteEntry>,
  pub source: PendingSource,
}

impl Reconciliation {
  /// Whether the backend should be sent the reconciled set.
  pub fn needs_echo(&self, backend: &[PendingSiteEntry]) -> bool {
    !same_sites(&self.entries, backend)
  }
}

/// Apply the precedence rules in order; the first that matches wins.
pub fn reconcile(
  inputs: PendingInputs<'_>,
  now: DateTime<Utc>,
  recency_window: Duration,
) -> Reconciliation {
  let backend = dedupe(inputs.backend);

  if backend.is_empty() {
    return Reconciliation {
      entries: Vec::new(),
      source: PendingSource::BackendCleared,
    };
  }

  if !inputs.in_memory.is_empty() {
    return Reconciliation {
      entries: dedupe(inputs.in_memory),
      source: PendingSource::Session,
    };
  }

  if let Some(durable) = inputs.durable.filter(|d| !d.entries.is_empty()) {
    let durable_entries = dedupe(&durable.entries);

    if is_recent(durable.last_modified_at, now, recency_window) {
      return Reconciliation {
        entries: durable_entries,
        source: PendingSource::RecentLocalEdit,
      };
    }

    if durable_entries.len() <= backend.len() && is_subset(&durable_entries, &backend) {
      return Reconciliation {
        entries: durable_entries,
        source: PendingSource::LocalSubset,
      };
    }

    tracing::debug!(
      "pending sets disagree (local {}, backend {}); trusting backend",
      durable_entries.len(),
      backend.len()
    );
  }

  Reconciliation {
    entries: backend,
    source: PendingSource::Backend,
  }
}

/// An edit timestamped in the future (clock skew) counts as recent.
fn is_recent(modified: DateTime<Utc>, now: DateTime<Utc>, window: Duration) -> bool {
  now - modified <= window
}

/// Every site of `small` appears in `large`, ignoring case.
pub fn is_subset(small: &[PendingSiteEntry], large: &[PendingSiteEntry]) -> bool {
  small
    .iter()
    .all(|s| large.iter().any(|l| l.same_site(&s.site)))
}

/// Both lists name the same sites, ignoring case and order.
pub fn same_sites(a: &[PendingSiteEntry], b: &[PendingSiteEntry]) -> bool {
  let (a, b) = (dedupe(a), dedupe(b));
  a.len() == b.len() && is_subset(&a, &b)
}

/// Drop case-insensitive duplicates, keeping the first occurrence.
pub fn dedupe(entries: &[PendingSiteEntry]) -> Vec<PendingSiteEntry> {
  let mut out: Vec<PendingSiteEntry> = Vec::with_capacity(entries.len());
  for entry in entries {
    if !out.iter().any(|e| e.same_site(&entry.site)) {
      out.push(entry.clone());
    }
  }
  out
}

/// Canonical form of a user-entered site: bare lower-case host and path.
pub fn normalize_site(raw: &str) -> Result<String, PendingEditError> {
  let trimmed = raw.trim();
  let without_scheme = trimmed
    .strip_prefix("https://")
    .or_else(|| trimmed.strip_prefix("http://"))
    .unwrap_or(trimmed);
  let site = without_scheme.trim_end_matches('/').to_lowercase();
  if site.is_empty() {
    return Err(PendingEditError::EmptySite);
  }
  Ok(site)
}

/// Pending set with one site appended.
pub fn with_added(
  entries: &[PendingSiteEntry],
  site: &str,
  billing_period: BillingPeriod,
) -> Result<Vec<PendingSiteEntry>, PendingEditError> {
  let site = normalize_site(site)?;
  if entries.iter().any(|e| e.same_site(&site)) {
    return Err(PendingEditError::DuplicateSite(site));
  }
  let mut next = entries.to_vec();
  next.push(PendingSiteEntry::new(site, billing_period));
  Ok(next)
}

/// Pending set with the entry at `index` removed, plus the removed entry.
pub fn with_removed(
  entries: &[PendingSiteEntry],
  index: usize,
) -> Result<(Vec<PendingSiteEntry>, PendingSiteEntry), PendingEditError> {
  if index >= entries.len() {
    return Err(PendingEditError::IndexOutOfRange {
      index,
      len: entries.len(),
    });
  }
  let mut next = entries.to_vec();
  let removed = next.remove(index);
  Ok((next, removed))
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::TimeZone;

  fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
  }

  fn window() -> Duration {
    Duration::seconds(5)
  }

  fn sites(names: &[&str]) -> Vec<PendingSiteEntry> {
    names
      .iter()
      .map(|n| PendingSiteEntry::new(*n, BillingPeriod::Monthly))
      .collect()
  }

  fn names(entries: &[PendingSiteEntry]) -> Vec<&str> {
    entries.iter().map(|e| e.site.as_str()).collect()
  }

  fn durable(names: &[&str], age_secs: i64) -> PendingEditRecord {
    PendingEditRecord {
      entries: sites(names),
      last_modified_at: now() - Duration::seconds(age_secs),
    }
  }

  fn run(in_memory: &[&str], durable: Option<&PendingEditRecord>, backend: &[&str]) -> Reconciliation {
    let in_memory = sites(in_memory);
    let backend = sites(backend);
    reconcile(
      PendingInputs {
        in_memory: &in_memory,
        durable,
        backend: &backend,
      },
      now(),
      window(),
    )
  }

  #[test]
  fn test_empty_backend_clears_everything() {
    let local = durable(&["a.com"], 10);
    let r = run(&["x.com", "y.com"], Some(&local), &[]);
    assert_eq!(r.source, PendingSource::BackendCleared);
    assert!(r.entries.is_empty());

    let recent = durable(&["a.com"], 0);
    let r = run(&[], Some(&recent), &[]);
    assert_eq!(r.source, PendingSource::BackendCleared);
  }

  #[test]
  fn test_session_set_beats_backend() {
    let local = durable(&["c.com"], 0);
    let r = run(&["a.com", "b.com"], Some(&local), &["z.com"]);
    assert_eq!(r.source, PendingSource::Session);
    assert_eq!(names(&r.entries), ["a.com", "b.com"]);
  }

  #[test]
  fn test_recent_local_edit_wins() {
    let local = durable(&["a.com", "new.com"], 3);
    let r = run(&[], Some(&local), &["a.com"]);
    assert_eq!(r.source, PendingSource::RecentLocalEdit);
    assert_eq!(names(&r.entries), ["a.com", "new.com"]);
  }

  #[test]
  fn test_recency_window_boundary() {
    let at_edge = durable(&["a.com", "b.com"], 5);
    assert_eq!(
      run(&[], Some(&at_edge), &["c.com"]).source,
      PendingSource::RecentLocalEdit
    );

    let past_edge = durable(&["a.com", "b.com"], 6);
    assert_eq!(run(&[], Some(&past_edge), &["c.com"]).source, PendingSource::Backend);
  }

  #[test]
  fn test_local_subset_wins_over_larger_backend() {
    let local = durable(&["A.com"], 60);
    let r = run(&[], Some(&local), &["a.com", "b.com"]);
    assert_eq!(r.source, PendingSource::LocalSubset);
    assert_eq!(names(&r.entries), ["A.com"]);
  }

  #[test]
  fn test_non_subset_falls_through_to_backend() {
    let local = durable(&["a.com", "c.com"], 60);
    let r = run(&[], Some(&local), &["a.com", "b.com"]);
    assert_eq!(r.source, PendingSource::Backend);
    assert_eq!(names(&r.entries), ["a.com", "b.com"]);
  }

  #[test]
  fn test_missing_or_empty_durable_uses_backend() {
    let r = run(&[], None, &["a.com"]);
    assert_eq!(r.source, PendingSource::Backend);

    let empty = durable(&[], 0);
    let r = run(&[], Some(&empty), &["a.com"]);
    assert_eq!(r.source, PendingSource::Backend);
    assert_eq!(names(&r.entries), ["a.com"]);
  }

  #[test]
  fn test_precedence_over_all_small_triples() {
    let sets: [&[&str]; 4] = [&[], &["a.com"], &["a.com", "b.com"], &["c.com"]];
    for in_memory in sets {
      for durable_set in sets {
        for age in [0, 60] {
          for backend in sets {
            let local = durable(durable_set, age);
            let r = run(in_memory, Some(&local), backend);

            let expected = if backend.is_empty() {
              PendingSource::BackendCleared
            } else if !in_memory.is_empty() {
              PendingSource::Session
            } else if !durable_set.is_empty() && age <= 5 {
              PendingSource::RecentLocalEdit
            } else if !durable_set.is_empty()
              && durable_set.len() <= backend.len()
              && durable_set.iter().all(|d| backend.contains(d))
            {
              PendingSource::LocalSubset
            } else {
              PendingSource::Backend
            };
            assert_eq!(
              r.source, expected,
              "in_memory={:?} durable={:?} age={} backend={:?}",
              in_memory, durable_set, age, backend
            );
          }
        }
      }
    }
  }

  #[test]
  fn test_reconcile_is_idempotent() {
    let local = durable(&["a.com"], 60);
    let first = run(&[], Some(&local), &["a.com", "b.com"]);
    let persisted = PendingEditRecord {
      entries: first.entries.clone(),
      last_modified_at: local.last_modified_at,
    };
    let second = run(&[], Some(&persisted), &["a.com", "b.com"]);
    assert_eq!(first, second);
  }

  #[test]
  fn test_needs_echo_ignores_case_and_order() {
    let r = Reconciliation {
      entries: sites(&["B.com", "a.com"]),
      source: PendingSource::Session,
    };
    assert!(!r.needs_echo(&sites(&["a.com", "b.com"])));
    assert!(r.needs_echo(&sites(&["a.com"])));
  }

  #[test]
  fn test_add_and_remove() {
    let entries = with_added(&[], " https://Shop.Example.com/ ", BillingPeriod::Yearly).unwrap();
    assert_eq!(entries[0].site, "shop.example.com");
    assert_eq!(entries[0].billing_period, BillingPeriod::Yearly);

    assert_eq!(
      with_added(&entries, "SHOP.example.com", BillingPeriod::Monthly),
      Err(PendingEditError::DuplicateSite("shop.example.com".into()))
    );
    assert_eq!(
      with_added(&entries, "   ", BillingPeriod::Monthly),
      Err(PendingEditError::EmptySite)
    );

    let (rest, removed) = with_removed(&entries, 0).unwrap();
    assert!(rest.is_empty());
    assert_eq!(removed.site, "shop.example.com");
    assert_eq!(
      with_removed(&rest, 0),
      Err(PendingEditError::IndexOutOfRange { index: 0, len: 0 })
    );
  }
}
