//! Premium gating
//!
//! Callers outside the billing core ask here whether a customer may use a
//! premium action. Validity is the full conjunction: premium tier, active,
//! and an end date still in the future.

use std::sync::Arc;

use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::plan::PlanCatalog;
use crate::store::BillingStore;
use crate::subscription::SubscriptionRecord;

pub struct EntitlementService {
    store: Arc<dyn BillingStore>,
    catalog: PlanCatalog,
}

impl EntitlementService {
    pub fn new(store: Arc<dyn BillingStore>, catalog: PlanCatalog) -> Self {
        Self { store, catalog }
    }

    /// The customer's subscription if it is a valid premium one
    pub async fn require_premium(&self, customer_id: Uuid, now: OffsetDateTime) -> BillingResult<SubscriptionRecord> {
        match self.store.find_subscription_by_customer(customer_id).await? {
            Some(subscription) if subscription.is_valid_premium(now) => Ok(subscription),
            _ => {
                tracing::debug!(customer_id = %customer_id, "Premium action refused");
                Err(BillingError::PremiumRequired)
            }
        }
    }

    pub async fn is_premium(&self, customer_id: Uuid, now: OffsetDateTime) -> BillingResult<bool> {
        match self.require_premium(customer_id, now).await {
            Ok(_) => Ok(true),
            Err(BillingError::PremiumRequired) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Per-period quota of premium actions the customer currently gets
    pub async fn charge_limit(&self, customer_id: Uuid, now: OffsetDateTime) -> BillingResult<i32> {
        Ok(match self.require_premium(customer_id, now).await {
            Ok(subscription) => subscription.charge_limit,
            Err(BillingError::PremiumRequired) => self.catalog.base_charge_limit,
            Err(e) => return Err(e),
        })
    }
}
