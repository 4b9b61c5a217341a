//! Entity unification across the three purchase flows.
//!
//! Sites arrive as items of direct multi-site subscriptions, as items of
//! per-site subscriptions, and as activations of quantity licenses. The
//! catalogue folds them into one entity per identity, rebuilt from scratch
//! on every pass.

use std::cmp::Reverse;
use std::collections::BTreeMap;

use crate::billing::types::{
  BillingEntity, BillingSnapshot, EntityStatus, LicenseRecord, LicenseSnapshot, Provenance,
  PurchaseType, Subscription,
};

/// Domains starting with these are placeholders written by the backend
const PLACEHOLDER_PREFIXES: [&str; 2] = ["license_", "quantity_"];

/// Identity prefix for quantity licenses not yet activated on a site
pub const LICENSE_IDENTITY_PREFIX: &str = "license:";

/// Filtered projection of the catalogue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatalogueView {
  /// Sites bought directly or through per-site subscriptions
  PurchasedDomains,
  /// Quantity licenses not yet activated on a site
  LicenseKeys,
}

/// Deduplicated, ordered set of billing entities.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Catalogue {
  entities: Vec<BillingEntity>,
}

impl Catalogue {
  /// Build the catalogue from the two backend snapshots.
  pub fn build(billing: &BillingSnapshot, licenses: &LicenseSnapshot) -> Self {
    let mut builder = Builder {
      billing,
      licenses: &licenses.licenses,
      entities: BTreeMap::new(),
    };

    let classified: Vec<(&Subscription, Provenance)> = billing
      .subscriptions
      .values()
      .map(|sub| (sub, classify(sub, &licenses.licenses)))
      .collect();

    for (sub, _) in classified.iter().filter(|(_, p)| *p == Provenance::Direct) {
      builder.add_subscription_items(sub, Provenance::Direct, false);
    }
    for (sub, _) in classified
      .iter()
      .filter(|(_, p)| *p == Provenance::SiteSubscription)
    {
      builder.add_subscription_items(sub, Provenance::SiteSubscription, true);
    }
    builder.recover_licensed_sites();
    builder.add_quantity_licenses();

    let mut entities: Vec<BillingEntity> = builder.entities.into_values().collect();
    entities.sort_by(|a, b| {
      (Reverse(a.created_at), &a.identity).cmp(&(Reverse(b.created_at), &b.identity))
    });
    Catalogue { entities }
  }

  pub fn entities(&self) -> &[BillingEntity] {
    &self.entities
  }

  pub fn view(&self, view: CatalogueView) -> Vec<BillingEntity> {
    self
      .entities
      .iter()
      .filter(|e| match view {
        CatalogueView::PurchasedDomains => matches!(
          e.provenance,
          Provenance::Direct | Provenance::SiteSubscription
        ),
        CatalogueView::LicenseKeys => {
          e.provenance == Provenance::QuantityLicense
            && e.identity.starts_with(LICENSE_IDENTITY_PREFIX)
        }
      })
      .cloned()
      .collect()
  }
}

struct Builder<'a> {
  billing: &'a BillingSnapshot,
  licenses: &'a [LicenseRecord],
  entities: BTreeMap<String, BillingEntity>,
}

impl<'a> Builder<'a> {
  fn owner(&self, license: &LicenseRecord) -> Option<&'a Subscription> {
    license
      .subscription_id
      .as_deref()
      .and_then(|id| self.billing.subscriptions.get(id))
  }

  fn license_for(&self, subscription_id: &str, site: &str) -> Option<&'a LicenseRecord> {
    self.licenses.iter().find(|l| {
      l.subscription_id.as_deref() == Some(subscription_id)
        && l.assigned_site.eq_ignore_ascii_case(site)
    })
  }

  /// One entity per valid item. Site subscriptions overwrite, direct ones
  /// keep the first entity seen.
  fn add_subscription_items(&mut self, sub: &Subscription, provenance: Provenance, supersede: bool) {
    for item in &sub.items {
      let Some(identity) = site_identity(&item.site) else {
        continue;
      };
      if !supersede && self.entities.contains_key(&identity) {
        continue;
      }
      let entity = BillingEntity {
        license_key: self
          .license_for(&sub.id, &identity)
          .map(|l| l.license_key.clone()),
        identity: identity.clone(),
        subscription_id: Some(sub.id.clone()),
        status: subscription_status(sub),
        provenance,
        billing_period: item.billing_period.or(sub.billing_period),
        period_end: sub.current_period_end,
        created_at: item.created_at.or(sub.created_at),
      };
      self.entities.insert(identity, entity);
    }
  }

  /// Activated non-quantity licenses whose site no subscription item named.
  fn recover_licensed_sites(&mut self) {
    for license in self.licenses {
      if license.purchase_type == Some(PurchaseType::Quantity) {
        continue;
      }
      let owner = self.owner(license);
      let owner_provenance = owner.map(|sub| classify(sub, self.licenses));
      if owner_provenance == Some(Provenance::QuantityLicense) {
        continue;
      }
      let Some(identity) = site_identity(&license.assigned_site) else {
        continue;
      };
      if self.entities.contains_key(&identity) {
        continue;
      }
      let entity = BillingEntity {
        identity: identity.clone(),
        subscription_id: license.subscription_id.clone(),
        license_key: Some(license.license_key.clone()),
        status: owner
          .map(subscription_status)
          .unwrap_or_else(|| license_status(&license.status)),
        provenance: owner_provenance
          .unwrap_or_else(|| Provenance::from_purchase_type(license.purchase_type)),
        billing_period: license
          .billing_period
          .or_else(|| owner.and_then(|s| s.billing_period)),
        period_end: owner.and_then(|s| s.current_period_end),
        created_at: license.created_at.or_else(|| owner.and_then(|s| s.created_at)),
      };
      self.entities.insert(identity, entity);
    }
  }

  /// Quantity licenses: activations supersede, unassigned keys get a
  /// synthetic identity.
  fn add_quantity_licenses(&mut self) {
    for license in self.licenses {
      let owner = self.owner(license);
      let is_quantity = license.purchase_type == Some(PurchaseType::Quantity)
        || owner.is_some_and(|sub| classify(sub, self.licenses) == Provenance::QuantityLicense);
      if !is_quantity || license.license_key.trim().is_empty() {
        continue;
      }

      let identity = if license.assigned_site.trim().is_empty() {
        format!("{}{}", LICENSE_IDENTITY_PREFIX, license.license_key.trim())
      } else {
        match site_identity(&license.assigned_site) {
          Some(site) => site,
          None => continue,
        }
      };

      let entity = BillingEntity {
        identity: identity.clone(),
        subscription_id: license.subscription_id.clone(),
        license_key: Some(license.license_key.clone()),
        status: owner
          .map(subscription_status)
          .unwrap_or_else(|| license_status(&license.status)),
        provenance: Provenance::QuantityLicense,
        billing_period: license
          .billing_period
          .or_else(|| owner.and_then(|s| s.billing_period)),
        period_end: owner.and_then(|s| s.current_period_end),
        created_at: license.created_at.or_else(|| owner.and_then(|s| s.created_at)),
      };
      self.entities.insert(identity, entity);
    }
  }
}

/// Purchase flow of a subscription, from authoritative type fields only.
pub fn classify(sub: &Subscription, licenses: &[LicenseRecord]) -> Provenance {
  let has = |t: PurchaseType| {
    sub.purchase_type == Some(t) || sub.items.iter().any(|i| i.purchase_type == Some(t))
  };

  let quantity_license = licenses.iter().any(|l| {
    l.subscription_id.as_deref() == Some(sub.id.as_str())
      && l.purchase_type == Some(PurchaseType::Quantity)
  });

  if has(PurchaseType::Quantity) || quantity_license {
    Provenance::QuantityLicense
  } else if has(PurchaseType::Site) {
    Provenance::SiteSubscription
  } else {
    Provenance::Direct
  }
}

/// Display status derived from the owning subscription.
pub fn subscription_status(sub: &Subscription) -> EntityStatus {
  let processor_cancelled = matches!(sub.status.as_str(), "canceled" | "cancelled");
  if processor_cancelled || (sub.canceled_at.is_some() && !sub.cancel_at_period_end) {
    EntityStatus::Cancelled
  } else if sub.cancel_at_period_end {
    EntityStatus::Cancelling
  } else {
    match sub.status.as_str() {
      "trialing" => EntityStatus::Trialing,
      "active" => EntityStatus::Active,
      _ => EntityStatus::Inactive,
    }
  }
}

/// Display status for a license with no known owning subscription.
pub fn license_status(status: &str) -> EntityStatus {
  match status {
    "active" => EntityStatus::Active,
    "trialing" => EntityStatus::Trialing,
    "cancelling" => EntityStatus::Cancelling,
    "canceled" | "cancelled" => EntityStatus::Cancelled,
    _ => EntityStatus::Inactive,
  }
}

/// Canonical identity for a site, or `None` for empty and placeholder domains.
fn site_identity(site: &str) -> Option<String> {
  let site = site.trim().to_lowercase();
  if site.is_empty() || PLACEHOLDER_PREFIXES.iter().any(|p| site.starts_with(p)) {
    return None;
  }
  Some(site)
}
