//! Session-scoped sync engine.
//!
//! Owns the in-memory pending set, the request cache and the background
//! writes of one signed-in session. Every load runs one reconciliation pass:
//! fetch both snapshots, reconcile the pending sets, persist and echo the
//! outcome, rebuild the catalogue and emit a render event.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use color_eyre::{eyre::eyre, Result};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::poller::{self, ConvergenceOutcome, PaymentReturn};
use super::reconcile::{reconcile, with_added, with_removed, PendingInputs, PendingSource, Reconciliation};
use super::sequence::SequenceGuard;
use super::unify::{Catalogue, CatalogueView};
use crate::billing::api_types::ApiPendingEcho;
use crate::billing::types::{
  BillingPeriod, CheckoutSession, Dashboard, PaymentHandoff, PendingEditRecord, PendingSiteEntry,
};
use crate::billing::{BillingApi, CachedBillingClient};
use crate::cache::CacheLayer;
use crate::clock::Clock;
use crate::config::{Config, SyncConfig};
use crate::debounce::Debouncer;
use crate::error::{FetchError, PendingEditError};
use crate::event::{EventStream, SyncEvent};
use crate::identity::{IdentityProvider, Principal};
use crate::store::{namespace_for, PendingStore};

const REFRESH_KEY: &str = "dashboard";

/// Timing knobs of the engine, converted from [`SyncConfig`].
#[derive(Debug, Clone)]
pub struct SyncSettings {
  pub recency_window: ChronoDuration,
  pub debounce: Duration,
  pub poll_delays: Vec<Duration>,
  pub handoff_ttl: ChronoDuration,
}

impl From<&SyncConfig> for SyncSettings {
  fn from(config: &SyncConfig) -> Self {
    Self {
      recency_window: config.recency_window(),
      debounce: Duration::from_millis(config.debounce_ms),
      poll_delays: config
        .poll_delays_secs
        .iter()
        .map(|s| Duration::from_secs(*s))
        .collect(),
      handoff_ttl: config.handoff_ttl(),
    }
  }
}

#[derive(Default)]
struct EngineState {
  /// Pending set held by the running session
  pending: Vec<PendingSiteEntry>,
  /// Sites shown as processing while a payment settles
  processing: Vec<PendingSiteEntry>,
  /// The last applied pass saw no pending sites on the backend
  backend_empty: bool,
  background: Vec<JoinHandle<()>>,
}

struct EngineInner {
  client: CachedBillingClient,
  store: Arc<dyn PendingStore>,
  clock: Arc<dyn Clock>,
  identity: Arc<dyn IdentityProvider>,
  settings: SyncSettings,
  state: Mutex<EngineState>,
  /// Serializes the apply step of concurrent passes
  apply: Mutex<()>,
  sequence: SequenceGuard,
  debouncer: Debouncer,
  events: mpsc::UnboundedSender<SyncEvent>,
}

/// Result of one reconciliation pass that was applied.
#[derive(Debug, Clone)]
pub(super) struct PassReport {
  pub dashboard: Dashboard,
  /// The backend reported no pending sites
  pub backend_empty: bool,
}

/// Reconciliation and caching engine for one signed-in session.
#[derive(Clone)]
pub struct SyncEngine {
  inner: Arc<EngineInner>,
}

impl SyncEngine {
  /// Build the engine and the stream its render events arrive on.
  pub fn new(
    config: &Config,
    api: Arc<dyn BillingApi>,
    store: Arc<dyn PendingStore>,
    clock: Arc<dyn Clock>,
    identity: Arc<dyn IdentityProvider>,
  ) -> (Self, EventStream) {
    let cache = CacheLayer::new(Arc::clone(&clock))
      .with_ttl(config.cache.ttl())
      .with_backoff(Duration::from_millis(config.cache.backoff_ms));
    let client = CachedBillingClient::new(
      api,
      cache,
      config.sync.page_size,
      config.cache.retry_policy(),
    );
    let (events, stream) = EventStream::channel();

    let engine = Self {
      inner: Arc::new(EngineInner {
        client,
        store,
        clock,
        identity,
        settings: SyncSettings::from(&config.sync),
        state: Mutex::new(EngineState::default()),
        apply: Mutex::new(()),
        sequence: SequenceGuard::new(),
        debouncer: Debouncer::new(),
        events,
      }),
    };
    (engine, stream)
  }

  /// Current in-memory pending set.
  pub fn pending(&self) -> Vec<PendingSiteEntry> {
    self.state().pending.clone()
  }

  /// Sites currently shown as processing.
  pub fn processing(&self) -> Vec<PendingSiteEntry> {
    self.state().processing.clone()
  }

  /// Load the dashboard, serving reads from cache when fresh.
  ///
  /// Returns `None` when a newer pass applied first.
  pub async fn load_dashboard(&self) -> Result<Option<Dashboard>> {
    self.natural_load(true).await
  }

  /// Load the dashboard with every read going to the network.
  ///
  /// Drops every cached page first, so later cached loads never serve data
  /// older than what this pass renders. A scheduled refresh still waiting
  /// is cancelled.
  pub async fn refresh_fresh(&self) -> Result<Option<Dashboard>> {
    if self.inner.debouncer.cancel(REFRESH_KEY) {
      debug!("Fresh refresh supersedes the scheduled one");
    }
    self.inner.client.invalidate_all();
    self.natural_load(false).await
  }

  async fn natural_load(&self, use_cache: bool) -> Result<Option<Dashboard>> {
    let report = self.run_pass(use_cache).await?;
    if report.is_some() {
      self.clear_processing();
    }
    Ok(report.map(|r| r.dashboard))
  }

  /// Debounced cached reload; a burst of calls loads once.
  pub fn schedule_refresh(&self) {
    let engine = self.clone();
    self
      .inner
      .debouncer
      .schedule(REFRESH_KEY, self.inner.settings.debounce, move || async move {
        if let Err(e) = engine.load_dashboard().await {
          warn!("Scheduled refresh failed: {}", e);
          engine.emit(SyncEvent::Error(e.to_string()));
        }
      });
  }

  /// Queue a site for purchase.
  ///
  /// Applied locally right away; the backend write happens in the background.
  pub fn add_pending_site(
    &self,
    site: &str,
    billing_period: BillingPeriod,
  ) -> Result<Vec<PendingSiteEntry>> {
    let principal = self.principal()?;
    let namespace = namespace_for(&principal.email);

    let next = with_added(&self.edit_base(&namespace)?, site, billing_period)?;
    self.commit_edit(&namespace, &next)?;

    let batch: Vec<PendingSiteEntry> = next.last().cloned().into_iter().collect();
    let client = self.inner.client.clone();
    let email = principal.email;
    self.spawn_background("add pending site", async move {
      client.add_pending_sites(&email, &batch).await
    });
    Ok(next)
  }

  /// Drop the pending site at `index`.
  pub fn remove_pending_site(&self, index: usize) -> Result<PendingSiteEntry> {
    let principal = self.principal()?;
    let namespace = namespace_for(&principal.email);

    let (next, removed) = with_removed(&self.edit_base(&namespace)?, index)?;
    self.commit_edit(&namespace, &next)?;

    let client = self.inner.client.clone();
    let email = principal.email;
    let site = removed.site.clone();
    self.spawn_background("remove pending site", async move {
      client.remove_pending_site(&email, &site).await
    });
    Ok(removed)
  }

  /// Record the handoff and open a checkout session for the pending set.
  pub async fn begin_checkout(&self) -> Result<CheckoutSession> {
    let principal = self.principal()?;
    let namespace = namespace_for(&principal.email);

    let entries = self.edit_base(&namespace)?;
    if entries.is_empty() {
      return Err(PendingEditError::NothingPending.into());
    }

    let handoff = PaymentHandoff {
      entries: entries.clone(),
      written_at: self.inner.clock.now(),
    };
    self.inner.store.save_handoff(&namespace, &handoff)?;

    match self.inner.client.create_checkout(&principal.email, &entries).await {
      Ok(session) => {
        info!(
          "Checkout session {} created for {} sites",
          session.session_id.as_deref().unwrap_or("-"),
          entries.len()
        );
        Ok(session)
      }
      Err(e) => {
        if let Err(clear) = self.inner.store.clear_handoff(&namespace) {
          warn!("Failed to clear handoff after checkout failure: {}", clear);
        }
        Err(eyre!("Failed to create checkout session: {}", e))
      }
    }
  }

  /// React to the query string of a redirect back from the payment processor.
  ///
  /// Returns `None` when the query carries no payment-return marker.
  pub async fn handle_payment_return(&self, query: &str) -> Result<Option<ConvergenceOutcome>> {
    let Some(marker) = PaymentReturn::from_query(query) else {
      return Ok(None);
    };
    info!(
      "Payment return detected (session {})",
      marker.session_id.as_deref().unwrap_or("-")
    );
    poller::converge(self).await.map(Some)
  }

  /// Wait for background writes and scheduled refreshes to finish.
  pub async fn settle(&self) {
    loop {
      self.inner.debouncer.wait_idle().await;
      let handles = std::mem::take(&mut self.state().background);
      if handles.is_empty() {
        return;
      }
      for handle in handles {
        if let Err(e) = handle.await {
          debug!("Background task ended abnormally: {}", e);
        }
      }
    }
  }

  /// One full reconciliation pass.
  pub(super) async fn run_pass(&self, use_cache: bool) -> Result<Option<PassReport>> {
    let principal = self.principal()?;
    let seq = self.inner.sequence.begin();

    let client = &self.inner.client;
    let (billing, licenses) = tokio::try_join!(
      client.billing_snapshot(&principal.email, use_cache),
      client.license_snapshot(&principal.email, use_cache),
    )
    .map_err(|e| eyre!("Failed to load billing data: {}", e))?;

    let _apply = lock(&self.inner.apply);
    if !self.inner.sequence.try_commit(seq) {
      debug!(
        "Dropping stale pass {} (pass {} already applied)",
        seq,
        self.inner.sequence.latest()
      );
      return Ok(None);
    }

    let namespace = namespace_for(&principal.email);
    let durable = self.inner.store.load_pending(&namespace)?;
    let in_memory = self.pending();
    let outcome = reconcile(
      PendingInputs {
        in_memory: &in_memory,
        durable: durable.as_ref(),
        backend: &billing.pending_sites,
      },
      self.inner.clock.now(),
      self.inner.settings.recency_window,
    );
    info!(
      "Pass {} for {}: {} pending sites from {:?}",
      seq,
      principal.id,
      outcome.entries.len(),
      outcome.source
    );

    self.persist_outcome(&namespace, &outcome, durable.as_ref())?;
    let backend_empty = billing.pending_sites.is_empty();
    {
      let mut state = self.state();
      state.pending = outcome.entries.clone();
      state.backend_empty = backend_empty;
    }

    if outcome.source != PendingSource::BackendCleared && outcome.needs_echo(&billing.pending_sites) {
      let client = client.clone();
      let email = principal.email.clone();
      let entries = outcome.entries.clone();
      self.spawn_background("pending echo", async move {
        client.replace_pending_sites(&email, &entries).await
      });
    }

    let catalogue = Catalogue::build(&billing, &licenses);
    debug!("Pass {}: catalogue holds {} entities", seq, catalogue.entities().len());
    let dashboard = Dashboard {
      sequence: seq,
      pending: outcome.entries,
      purchased_domains: catalogue.view(CatalogueView::PurchasedDomains),
      license_keys: catalogue.view(CatalogueView::LicenseKeys),
    };
    self.emit(SyncEvent::Rendered(Box::new(dashboard.clone())));

    Ok(Some(PassReport {
      dashboard,
      backend_empty,
    }))
  }

  /// Write the reconciled set, keeping the last local-edit timestamp.
  fn persist_outcome(
    &self,
    namespace: &str,
    outcome: &Reconciliation,
    durable: Option<&PendingEditRecord>,
  ) -> Result<()> {
    let store = &self.inner.store;
    if outcome.source == PendingSource::BackendCleared {
      if durable.is_some() {
        store.clear_pending(namespace)?;
      }
      // Nothing left to pay for; a handoff from an earlier checkout is settled
      store.clear_handoff(namespace)?;
      return Ok(());
    }

    if durable.is_some_and(|d| d.entries == outcome.entries) {
      return Ok(());
    }
    let record = PendingEditRecord {
      entries: outcome.entries.clone(),
      last_modified_at: durable
        .map(|d| d.last_modified_at)
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH),
    };
    store.save_pending(namespace, &record)
  }

  /// Pending set a local edit starts from.
  fn edit_base(&self, namespace: &str) -> Result<Vec<PendingSiteEntry>> {
    let pending = self.pending();
    if !pending.is_empty() {
      return Ok(pending);
    }
    Ok(
      self
        .inner
        .store
        .load_pending(namespace)?
        .map(|r| r.entries)
        .unwrap_or_default(),
    )
  }

  /// Apply a local edit: durable copy first, then memory, then notify.
  fn commit_edit(&self, namespace: &str, entries: &[PendingSiteEntry]) -> Result<()> {
    let record = PendingEditRecord {
      entries: entries.to_vec(),
      last_modified_at: self.inner.clock.now(),
    };
    self.inner.store.save_pending(namespace, &record)?;
    self.state().pending = entries.to_vec();
    self.emit(SyncEvent::PendingChanged(entries.to_vec()));
    Ok(())
  }

  fn spawn_background<F>(&self, what: &'static str, write: F)
  where
    F: Future<Output = Result<ApiPendingEcho, FetchError>> + Send + 'static,
  {
    let handle = tokio::spawn(async move {
      match write.await {
        Ok(echo) => debug!("{} acknowledged, backend holds [{}]", what, echo.describe()),
        Err(e) => warn!("{} failed, keeping local state: {}", what, e),
      }
    });
    let mut state = self.state();
    state.background.retain(|h| !h.is_finished());
    state.background.push(handle);
  }

  pub(super) fn principal(&self) -> Result<Principal> {
    self
      .inner
      .identity
      .current_principal()
      .ok_or_else(|| eyre!("No signed-in user: the identity session is missing or has no email"))
  }

  pub(super) fn client(&self) -> &CachedBillingClient {
    &self.inner.client
  }

  pub(super) fn store(&self) -> &dyn PendingStore {
    self.inner.store.as_ref()
  }

  pub(super) fn clock(&self) -> &dyn Clock {
    self.inner.clock.as_ref()
  }

  pub(super) fn settings(&self) -> &SyncSettings {
    &self.inner.settings
  }

  /// Whether the last applied pass saw an empty backend pending list.
  pub(super) fn backend_was_empty(&self) -> bool {
    self.state().backend_empty
  }

  pub(super) fn show_processing(&self, entries: Vec<PendingSiteEntry>) {
    self.state().processing = entries.clone();
    self.emit(SyncEvent::Processing(entries));
  }

  pub(super) fn clear_processing(&self) {
    let had = !std::mem::take(&mut self.state().processing).is_empty();
    if had {
      self.emit(SyncEvent::ProcessingCleared);
    }
  }

  fn emit(&self, event: SyncEvent) {
    // The receiver going away just means nobody renders any more
    let _ = self.inner.events.send(event);
  }

  fn state(&self) -> MutexGuard<'_, EngineState> {
    lock(&self.inner.state)
  }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
  m.lock().unwrap_or_else(PoisonError::into_inner)
}
