//! Persistence for the payment ledger and subscription table
//!
//! Records live in independent keyed tables and reference each other by
//! id. All mutation goes through the orchestrator; this layer only
//! guarantees uniqueness, atomic multi-row writes and per-subscription
//! serialization. Work done under a [`SubscriptionLock`] goes through the
//! lock itself.

mod memory;
mod postgres;

use async_trait::async_trait;
use time::Date;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::ledger::{PaymentRecord, PaymentStats};
use crate::subscription::SubscriptionRecord;

pub use memory::MemoryStore;
pub use postgres::PgStore;

#[async_trait]
pub trait BillingStore: Send + Sync {
    // Subscriptions

    async fn get_subscription(&self, id: Uuid) -> BillingResult<Option<SubscriptionRecord>>;

    async fn find_subscription_by_customer(
        &self,
        customer_id: Uuid,
    ) -> BillingResult<Option<SubscriptionRecord>>;

    async fn find_subscription_by_customer_key(
        &self,
        customer_key: &str,
    ) -> BillingResult<Option<SubscriptionRecord>>;

    /// Insert `record` unless the customer already has one. Returns whichever
    /// record is stored afterwards.
    async fn insert_subscription_if_absent(
        &self,
        record: &SubscriptionRecord,
    ) -> BillingResult<SubscriptionRecord>;

    /// Overwrite mutable fields. `customer_key` and `customer_id` never change.
    async fn save_subscription(&self, record: &SubscriptionRecord) -> BillingResult<()>;

    async fn list_subscriptions(&self) -> BillingResult<Vec<SubscriptionRecord>>;

    /// Active, credentialed, unsuspended subscriptions whose next charge
    /// falls on or before `today`, oldest due date first
    async fn list_due_subscriptions(&self, today: Date) -> BillingResult<Vec<SubscriptionRecord>>;

    // Payments

    async fn find_payment_by_order_id(&self, order_id: &str) -> BillingResult<Option<PaymentRecord>>;

    async fn find_payment_by_charge_key(
        &self,
        charge_key: &str,
    ) -> BillingResult<Option<PaymentRecord>>;

    /// Create a ledger row. Returns `false` without writing when the
    /// `order_id` is already taken.
    async fn insert_payment(&self, record: &PaymentRecord) -> BillingResult<bool>;

    async fn update_payment(&self, record: &PaymentRecord) -> BillingResult<()>;

    /// All rows, newest approval first
    async fn list_payments(&self) -> BillingResult<Vec<PaymentRecord>>;

    async fn payment_stats(&self) -> BillingResult<PaymentStats>;

    /// Write a charge outcome and the subscription it bills against in one
    /// atomic unit. Neither write is visible without the other.
    async fn record_charge_outcome(
        &self,
        payment: &PaymentRecord,
        subscription: &SubscriptionRecord,
    ) -> BillingResult<()>;

    /// Serialize every orchestrator action on one subscription. The lock is
    /// released when the returned guard is dropped.
    ///
    /// While the lock is held, reads and writes on that subscription go
    /// through the guard, never through the store itself.
    async fn lock_subscription(&self, subscription_id: Uuid) -> BillingResult<SubscriptionLock>;
}

/// Store operations bound to one held subscription lock
#[async_trait]
pub(crate) trait LockSession: Send {
    async fn get_subscription(&mut self, id: Uuid) -> BillingResult<Option<SubscriptionRecord>>;

    async fn save_subscription(&mut self, record: &SubscriptionRecord) -> BillingResult<()>;

    async fn find_payment_by_order_id(&mut self, order_id: &str) -> BillingResult<Option<PaymentRecord>>;

    async fn find_unsettled_recurring(&mut self, subscription_id: Uuid) -> BillingResult<Option<PaymentRecord>>;

    async fn insert_payment(&mut self, record: &PaymentRecord) -> BillingResult<bool>;

    async fn update_payment(&mut self, record: &PaymentRecord) -> BillingResult<()>;

    async fn record_charge_outcome(
        &mut self,
        payment: &PaymentRecord,
        subscription: &SubscriptionRecord,
    ) -> BillingResult<()>;
}

/// Exclusive hold on one subscription.
///
/// The guard carries its own storage session: on Postgres that is the
/// connection holding the advisory lock, so a holder never waits on the
/// pool for its own reads and writes. Each write is durable as soon as the
/// call returns.
pub struct SubscriptionLock {
    subscription_id: Uuid,
    session: Box<dyn LockSession>,
}

impl SubscriptionLock {
    pub(crate) fn new(subscription_id: Uuid, session: Box<dyn LockSession>) -> Self {
        Self {
            subscription_id,
            session,
        }
    }

    pub fn subscription_id(&self) -> Uuid {
        self.subscription_id
    }

    /// Current state of the locked subscription
    pub async fn subscription(&mut self) -> BillingResult<SubscriptionRecord> {
        let id = self.subscription_id;
        self.session
            .get_subscription(id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("subscription {}", id)))
    }

    pub async fn save_subscription(&mut self, record: &SubscriptionRecord) -> BillingResult<()> {
        self.covers(record.id)?;
        self.session.save_subscription(record).await
    }

    pub async fn find_payment_by_order_id(&mut self, order_id: &str) -> BillingResult<Option<PaymentRecord>> {
        self.session.find_payment_by_order_id(order_id).await
    }

    /// The oldest recurring row for this subscription still awaiting an
    /// outcome, if any
    pub async fn find_unsettled_recurring(&mut self) -> BillingResult<Option<PaymentRecord>> {
        let id = self.subscription_id;
        self.session.find_unsettled_recurring(id).await
    }

    /// Same contract as [`BillingStore::insert_payment`]
    pub async fn insert_payment(&mut self, record: &PaymentRecord) -> BillingResult<bool> {
        self.covers(record.subscription_id)?;
        self.session.insert_payment(record).await
    }

    pub async fn update_payment(&mut self, record: &PaymentRecord) -> BillingResult<()> {
        self.covers(record.subscription_id)?;
        self.session.update_payment(record).await
    }

    /// Same contract as [`BillingStore::record_charge_outcome`]
    pub async fn record_charge_outcome(
        &mut self,
        payment: &PaymentRecord,
        subscription: &SubscriptionRecord,
    ) -> BillingResult<()> {
        self.covers(subscription.id)?;
        self.covers(payment.subscription_id)?;
        self.session.record_charge_outcome(payment, subscription).await
    }

    fn covers(&self, subscription_id: Uuid) -> BillingResult<()> {
        if subscription_id != self.subscription_id {
            return Err(BillingError::Validation(format!(
                "lock on subscription {} does not cover subscription {}",
                self.subscription_id, subscription_id
            )));
        }
        Ok(())
    }
}
