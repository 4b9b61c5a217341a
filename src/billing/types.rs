use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Billing cadence of a pending or purchased site
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BillingPeriod {
  #[default]
  Monthly,
  Yearly,
}

impl fmt::Display for BillingPeriod {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      BillingPeriod::Monthly => write!(f, "monthly"),
      BillingPeriod::Yearly => write!(f, "yearly"),
    }
  }
}

/// A site queued for purchase but not yet paid for
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingSiteEntry {
  pub site: String,
  #[serde(default)]
  pub billing_period: BillingPeriod,
}

impl PendingSiteEntry {
  pub fn new(site: impl Into<String>, billing_period: BillingPeriod) -> Self {
    Self {
      site: site.into(),
      billing_period,
    }
  }

  /// Case-insensitive site comparison used for pending-set uniqueness.
  pub fn same_site(&self, other: &str) -> bool {
    self.site.trim().eq_ignore_ascii_case(other.trim())
  }
}

/// Durable copy of the user's pending edits
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingEditRecord {
  pub entries: Vec<PendingSiteEntry>,
  /// Time of the last local edit. Reconciliation never advances it.
  pub last_modified_at: DateTime<Utc>,
}

/// Pending entries captured right before redirecting to checkout
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentHandoff {
  pub entries: Vec<PendingSiteEntry>,
  pub written_at: DateTime<Utc>,
}

/// Purchase flow named by the backend's type fields
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PurchaseType {
  Site,
  Quantity,
  #[serde(other)]
  Other,
}

/// Which purchase flow produced a billing entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Provenance {
  Direct,
  SiteSubscription,
  QuantityLicense,
}

impl Provenance {
  pub fn from_purchase_type(purchase_type: Option<PurchaseType>) -> Self {
    match purchase_type {
      Some(PurchaseType::Quantity) => Provenance::QuantityLicense,
      Some(PurchaseType::Site) => Provenance::SiteSubscription,
      Some(PurchaseType::Other) | None => Provenance::Direct,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityStatus {
  Active,
  Trialing,
  Cancelling,
  Cancelled,
  Inactive,
}

impl fmt::Display for EntityStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      EntityStatus::Active => "active",
      EntityStatus::Trialing => "trialing",
      EntityStatus::Cancelling => "cancelling",
      EntityStatus::Cancelled => "cancelled",
      EntityStatus::Inactive => "inactive",
    };
    f.pad(s)
  }
}

/// Unified site / license / subscription record ready for rendering
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BillingEntity {
  /// Site domain, or `license:<key>` for an unassigned license
  pub identity: String,
  pub subscription_id: Option<String>,
  pub license_key: Option<String>,
  pub status: EntityStatus,
  pub provenance: Provenance,
  pub billing_period: Option<BillingPeriod>,
  pub period_end: Option<DateTime<Utc>>,
  pub created_at: Option<DateTime<Utc>>,
}

/// Subscription as reported by the billing snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Subscription {
  pub id: String,
  /// Payment processor status (active, trialing, canceled, past_due, ...)
  pub status: String,
  pub purchase_type: Option<PurchaseType>,
  pub cancel_at_period_end: bool,
  pub canceled_at: Option<DateTime<Utc>>,
  pub current_period_end: Option<DateTime<Utc>>,
  pub created_at: Option<DateTime<Utc>>,
  pub billing_period: Option<BillingPeriod>,
  pub items: Vec<SubscriptionItem>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionItem {
  pub site: String,
  pub purchase_type: Option<PurchaseType>,
  pub billing_period: Option<BillingPeriod>,
  pub created_at: Option<DateTime<Utc>>,
}

/// Everything the billing endpoint reports for one user
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BillingSnapshot {
  pub subscriptions: BTreeMap<String, Subscription>,
  pub pending_sites: Vec<PendingSiteEntry>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LicenseRecord {
  pub license_key: String,
  pub subscription_id: Option<String>,
  /// Site the license was activated on, empty when unassigned
  pub assigned_site: String,
  pub purchase_type: Option<PurchaseType>,
  pub status: String,
  pub billing_period: Option<BillingPeriod>,
  pub created_at: Option<DateTime<Utc>>,
}

/// Flat list of license records for one user
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LicenseSnapshot {
  pub licenses: Vec<LicenseRecord>,
}

/// Checkout session created for the pending set
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CheckoutSession {
  pub url: String,
  #[serde(default)]
  pub session_id: Option<String>,
}

/// Render-ready output of one reconciliation pass
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Dashboard {
  /// Sequence number of the pass that produced it
  pub sequence: u64,
  pub pending: Vec<PendingSiteEntry>,
  pub purchased_domains: Vec<BillingEntity>,
  pub license_keys: Vec<BillingEntity>,
}
