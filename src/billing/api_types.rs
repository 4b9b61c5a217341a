//! Serde-deserializable types matching billing API responses.
//!
//! These types are separate from domain types to allow clean deserialization
//! while keeping domain types focused on application needs.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::BTreeMap;

use super::types::{
  BillingPeriod, BillingSnapshot, LicenseRecord, LicenseSnapshot, PendingSiteEntry, PurchaseType,
  Subscription, SubscriptionItem,
};

/// Decode a captured response body into a typed response.
pub fn decode<T: DeserializeOwned>(value: serde_json::Value) -> serde_json::Result<T> {
  serde_json::from_value(value)
}

// ============================================================================
// Billing snapshot endpoint response
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ApiSubscriptionItem {
  #[serde(default, alias = "domain")]
  pub site: Option<String>,
  pub purchase_type: Option<PurchaseType>,
  pub billing_period: Option<BillingPeriod>,
  #[serde(default, with = "chrono::serde::ts_seconds_option")]
  pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
pub struct ApiSubscription {
  #[serde(default)]
  pub status: String,
  pub purchase_type: Option<PurchaseType>,
  #[serde(default)]
  pub cancel_at_period_end: bool,
  #[serde(default, with = "chrono::serde::ts_seconds_option")]
  pub canceled_at: Option<DateTime<Utc>>,
  #[serde(default, with = "chrono::serde::ts_seconds_option")]
  pub current_period_end: Option<DateTime<Utc>>,
  #[serde(default, with = "chrono::serde::ts_seconds_option")]
  pub created_at: Option<DateTime<Utc>>,
  pub billing_period: Option<BillingPeriod>,
  #[serde(default)]
  pub items: Vec<ApiSubscriptionItem>,
}

#[derive(Debug, Deserialize)]
pub struct ApiBillingPage {
  #[serde(default)]
  pub subscriptions: BTreeMap<String, ApiSubscription>,
  #[serde(rename = "pendingSites", default)]
  pub pending_sites: Vec<PendingSiteEntry>,
  #[serde(default)]
  pub total: u64,
  #[serde(rename = "hasMore", default)]
  pub has_more: bool,
}

// ============================================================================
// License snapshot endpoint response
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ApiLicense {
  pub license_key: String,
  pub subscription_id: Option<String>,
  #[serde(default, alias = "site_domain")]
  pub used_site_domain: Option<String>,
  pub purchase_type: Option<PurchaseType>,
  #[serde(default)]
  pub status: String,
  pub billing_period: Option<BillingPeriod>,
  #[serde(default, with = "chrono::serde::ts_seconds_option")]
  pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
pub struct ApiLicensePage {
  #[serde(default)]
  pub licenses: Vec<ApiLicense>,
  #[serde(default)]
  pub total: u64,
  #[serde(rename = "hasMore", default)]
  pub has_more: bool,
}

// ============================================================================
// Write endpoints
// ============================================================================

#[derive(Debug, Serialize)]
pub struct ApiPendingSitesRequest<'a> {
  pub email: &'a str,
  pub sites: &'a [PendingSiteEntry],
}

#[derive(Debug, Serialize)]
pub struct ApiRemovePendingRequest<'a> {
  pub email: &'a str,
  pub site: &'a str,
}

#[derive(Debug, Deserialize)]
pub struct ApiPendingEchoSite {
  pub site: String,
  pub subscription_id: Option<String>,
}

/// Backend's view of the pending set after a write
#[derive(Debug, Deserialize)]
pub struct ApiPendingEcho {
  #[serde(default)]
  pub sites: Vec<ApiPendingEchoSite>,
}

impl ApiPendingEcho {
  /// Compact listing for logs, e.g. `a.com, b.com (sub_1)`.
  pub fn describe(&self) -> String {
    self
      .sites
      .iter()
      .map(|s| match &s.subscription_id {
        Some(id) => format!("{} ({})", s.site, id),
        None => s.site.clone(),
      })
      .collect::<Vec<_>>()
      .join(", ")
  }
}

// ============================================================================
// Conversions to domain types
// ============================================================================

impl From<ApiSubscriptionItem> for SubscriptionItem {
  fn from(item: ApiSubscriptionItem) -> Self {
    SubscriptionItem {
      site: item.site.map(|s| s.trim().to_string()).unwrap_or_default(),
      purchase_type: item.purchase_type,
      billing_period: item.billing_period,
      created_at: item.created_at,
    }
  }
}

impl ApiSubscription {
  pub fn into_domain(self, id: String) -> Subscription {
    Subscription {
      id,
      status: self.status.to_lowercase(),
      purchase_type: self.purchase_type,
      cancel_at_period_end: self.cancel_at_period_end,
      canceled_at: self.canceled_at,
      current_period_end: self.current_period_end,
      created_at: self.created_at,
      billing_period: self.billing_period,
      items: self.items.into_iter().map(SubscriptionItem::from).collect(),
    }
  }
}

impl From<ApiLicense> for LicenseRecord {
  fn from(l: ApiLicense) -> Self {
    LicenseRecord {
      license_key: l.license_key,
      subscription_id: l.subscription_id.filter(|s| !s.is_empty()),
      assigned_site: l
        .used_site_domain
        .map(|s| s.trim().to_string())
        .unwrap_or_default(),
      purchase_type: l.purchase_type,
      status: l.status.to_lowercase(),
      billing_period: l.billing_period,
      created_at: l.created_at,
    }
  }
}

impl BillingSnapshot {
  /// Merge one page of the billing endpoint into the snapshot.
  ///
  /// The pending list is the same on every page; the first non-empty one is kept.
  pub fn absorb(&mut self, page: ApiBillingPage) {
    for (id, sub) in page.subscriptions {
      let sub = sub.into_domain(id.clone());
      self.subscriptions.insert(id, sub);
    }
    if self.pending_sites.is_empty() {
      self.pending_sites = page.pending_sites;
    }
  }
}

impl LicenseSnapshot {
  pub fn absorb(&mut self, page: ApiLicensePage) {
    self
      .licenses
      .extend(page.licenses.into_iter().map(LicenseRecord::from));
  }
}
