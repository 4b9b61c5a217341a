//! Convergence polling after a redirect back from the payment processor.
//!
//! The payment webhook updates the backend some seconds after the user comes
//! back. Until then the paid sites are shown as processing, and the backend
//! is re-read on a fixed schedule until its pending list empties.

use color_eyre::Result;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use url::form_urlencoded;

use super::engine::SyncEngine;
use crate::billing::types::PendingSiteEntry;
use crate::store::namespace_for;

/// Marker found in the return URL of a checkout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentReturn {
  pub session_id: Option<String>,
}

impl PaymentReturn {
  /// Parse a return URL or bare query string.
  ///
  /// Recognizes `payment=success` and a non-empty `session_id`.
  pub fn from_query(input: &str) -> Option<Self> {
    let query = input.split_once('?').map_or(input, |(_, q)| q);
    let query = query.split('#').next().unwrap_or_default();

    let mut success = false;
    let mut session_id = None;
    for (key, value) in form_urlencoded::parse(query.as_bytes()) {
      match key.as_ref() {
        "payment" if value.eq_ignore_ascii_case("success") => success = true,
        "session_id" if !value.trim().is_empty() => session_id = Some(value.trim().to_string()),
        _ => {}
      }
    }

    (success || session_id.is_some()).then_some(PaymentReturn { session_id })
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvergenceOutcome {
  /// Pass number (1-based) that saw the backend's pending list empty
  Converged { pass: usize },
  /// No pass converged; the placeholder stays until the next load
  Unconverged,
}

/// Run the scheduled passes until one observes an empty backend pending list.
pub(super) async fn converge(engine: &SyncEngine) -> Result<ConvergenceOutcome> {
  let started = Instant::now();
  let principal = engine.principal()?;
  let namespace = namespace_for(&principal.email);

  engine.show_processing(placeholder_entries(engine, &namespace)?);
  engine.client().invalidate_snapshots();

  let delays = engine.settings().poll_delays.clone();
  for (i, delay) in delays.iter().enumerate() {
    let pass = i + 1;
    tokio::time::sleep_until(started + *delay).await;

    let converged = match engine.run_pass(false).await {
      Ok(Some(report)) => report.backend_empty,
      // The newer pass that won may already have seen the payment land
      Ok(None) => {
        debug!("Pass {}: superseded by a newer load", pass);
        engine.backend_was_empty()
      }
      Err(e) => {
        warn!("Convergence pass {} failed: {}", pass, e);
        false
      }
    };

    if converged {
      if let Err(e) = engine.store().clear_handoff(&namespace) {
        warn!("Failed to clear payment handoff: {}", e);
      }
      engine.clear_processing();
      info!("Payment converged on pass {} of {}", pass, delays.len());
      return Ok(ConvergenceOutcome::Converged { pass });
    }
    debug!("Pass {}: backend still lists pending sites", pass);
  }

  info!(
    "Payment not converged after {} passes; keeping processing placeholder",
    delays.len()
  );
  Ok(ConvergenceOutcome::Unconverged)
}

/// Sites to show as processing: the handoff if still fresh, else the durable copy.
fn placeholder_entries(engine: &SyncEngine, namespace: &str) -> Result<Vec<PendingSiteEntry>> {
  let store = engine.store();
  if let Some(handoff) = store.load_handoff(namespace)? {
    let age = engine.clock().now() - handoff.written_at;
    if age <= engine.settings().handoff_ttl {
      return Ok(handoff.entries);
    }
    debug!("Ignoring payment handoff written {}s ago", age.num_seconds());
    store.clear_handoff(namespace)?;
  }

  Ok(
    store
      .load_pending(namespace)?
      .map(|r| r.entries)
      .unwrap_or_default(),
  )
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::billing::fake::FakeApi;
  use crate::billing::types::{BillingPeriod, PaymentHandoff};
  use crate::clock::Clock;
  use crate::error::FetchError;
  use crate::event::SyncEvent;
  use crate::store::PendingStore;
  use crate::sync::engine::tests::{harness, sites};
  use std::time::Duration;

  #[test]
  fn test_payment_return_markers() {
    assert_eq!(
      PaymentReturn::from_query("https://app.example.com/billing?payment=success"),
      Some(PaymentReturn { session_id: None })
    );
    assert_eq!(
      PaymentReturn::from_query("?session_id=cs_123&x=1#top"),
      Some(PaymentReturn {
        session_id: Some("cs_123".into())
      })
    );
    assert_eq!(PaymentReturn::from_query("payment=cancelled"), None);
    assert_eq!(PaymentReturn::from_query("session_id="), None);
    assert_eq!(PaymentReturn::from_query(""), None);
  }

  #[tokio::test(start_paused = true)]
  async fn test_converges_on_first_empty_pass() {
    let mut h = harness(FakeApi::new());
    h.api.set_pending(&["a.com"]);
    h.engine.load_dashboard().await.unwrap();
    h.engine.begin_checkout().await.unwrap();
    h.events.drain();

    // Webhook lands between the first and second pass
    let api = h.api.clone();
    tokio::spawn(async move {
      tokio::time::sleep(Duration::from_secs(4)).await;
      api.set_pending(&[]);
    });

    let outcome = h
      .engine
      .handle_payment_return("?payment=success")
      .await
      .unwrap();
    assert_eq!(outcome, Some(ConvergenceOutcome::Converged { pass: 2 }));

    assert_eq!(h.store.load_handoff(&h.namespace()).unwrap(), None);
    assert_eq!(h.durable_sites(), None);
    assert!(h.engine.processing().is_empty());

    let events = h.events.drain();
    assert!(matches!(events.first(), Some(SyncEvent::Processing(p)) if sites(p) == ["a.com"]));
    assert_eq!(events.last(), Some(&SyncEvent::ProcessingCleared));
    // One initial read plus the two polling passes
    assert_eq!(h.api.billing_calls(), 3);
  }

  #[tokio::test(start_paused = true)]
  async fn test_unconverged_keeps_placeholder() {
    let h = harness(FakeApi::new());
    h.api.set_pending(&["a.com"]);
    h.engine.load_dashboard().await.unwrap();
    h.engine.begin_checkout().await.unwrap();

    let outcome = h
      .engine
      .handle_payment_return("session_id=cs_test_1")
      .await
      .unwrap();
    assert_eq!(outcome, Some(ConvergenceOutcome::Unconverged));
    assert_eq!(sites(&h.engine.processing()), ["a.com"]);
    assert_eq!(h.api.billing_calls(), 4);

    // The next natural load removes it
    h.engine.load_dashboard().await.unwrap();
    assert!(h.engine.processing().is_empty());
  }

  #[tokio::test(start_paused = true)]
  async fn test_failed_pass_does_not_stop_polling() {
    let h = harness(FakeApi::new());
    h.seed_durable(&["a.com"], 60);
    // First pass exhausts its retries
    h.api.fail_billing(FetchError::from_status(502, b"bad gateway"), 3);

    let outcome = h
      .engine
      .handle_payment_return("payment=success")
      .await
      .unwrap();
    assert_eq!(outcome, Some(ConvergenceOutcome::Converged { pass: 2 }));
    assert_eq!(h.durable_sites(), None);
  }

  #[tokio::test(start_paused = true)]
  async fn test_expired_handoff_falls_back_to_durable_copy() {
    let mut h = harness(FakeApi::new());
    h.api.set_pending(&["a.com"]);
    h.seed_durable(&["durable.com"], 60);
    let handoff = PaymentHandoff {
      entries: vec![PendingSiteEntry::new("handoff.com", BillingPeriod::Monthly)],
      written_at: h.clock.now() - chrono::Duration::minutes(16),
    };
    h.store.save_handoff(&h.namespace(), &handoff).unwrap();

    h.engine.handle_payment_return("payment=success").await.unwrap();

    let events = h.events.drain();
    assert!(matches!(events.first(), Some(SyncEvent::Processing(p)) if sites(p) == ["durable.com"]));
    assert_eq!(h.store.load_handoff(&h.namespace()).unwrap(), None);
  }

  #[tokio::test(start_paused = true)]
  async fn test_superseded_pass_still_sees_convergence() {
    let h = harness(FakeApi::new());
    h.api.set_pending(&["a.com"]);
    h.engine.load_dashboard().await.unwrap();
    h.engine.begin_checkout().await.unwrap();
    h.api.set_pending(&[]);
    h.api.set_delay(Duration::from_secs(1));

    let converge = tokio::spawn({
      let engine = h.engine.clone();
      async move { engine.handle_payment_return("payment=success").await }
    });

    // A load at t=1s caches the paid-up state once its reads finish at t=2s
    tokio::time::sleep(Duration::from_secs(1)).await;
    h.engine.load_dashboard().await.unwrap();

    // Pass 1 starts at t=3s and reads until t=4s; a cache hit applies first
    tokio::time::sleep(Duration::from_millis(1500)).await;
    let newer = h.engine.load_dashboard().await.unwrap().unwrap();
    assert!(newer.pending.is_empty());

    let outcome = converge.await.unwrap().unwrap();
    assert_eq!(outcome, Some(ConvergenceOutcome::Converged { pass: 1 }));
    assert_eq!(h.store.load_handoff(&h.namespace()).unwrap(), None);
    assert!(h.engine.processing().is_empty());
  }

  #[tokio::test]
  async fn test_empty_backend_on_natural_load_clears_handoff() {
    let h = harness(FakeApi::new());
    h.api.set_pending(&["a.com"]);
    h.engine.load_dashboard().await.unwrap();
    h.engine.begin_checkout().await.unwrap();

    h.api.set_pending(&[]);
    h.engine.refresh_fresh().await.unwrap();
    assert_eq!(h.store.load_handoff(&h.namespace()).unwrap(), None);
  }

  #[tokio::test]
  async fn test_no_marker_no_polling() {
    let h = harness(FakeApi::new());
    let outcome = h.engine.handle_payment_return("?tab=billing").await.unwrap();
    assert_eq!(outcome, None);
    assert_eq!(h.api.billing_calls(), 0);
  }
}
