//! In-process store
//!
//! Backs tests and single-process deployments. Uniqueness rules mirror the
//! Postgres schema's unique indexes.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use time::Date;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use super::{BillingStore, LockSession, SubscriptionLock};
use crate::error::{BillingError, BillingResult};
use crate::ledger::{sort_newest_approved_first, ChargeKind, PaymentRecord, PaymentStats};
use crate::subscription::SubscriptionRecord;

#[derive(Default)]
struct Tables {
    subscriptions: HashMap<Uuid, SubscriptionRecord>,
    payments: HashMap<Uuid, PaymentRecord>,
    payments_by_order: HashMap<String, Uuid>,
}

impl Tables {
    fn charge_key_taken(&self, record: &PaymentRecord) -> bool {
        match &record.charge_key {
            Some(key) => self
                .payments
                .values()
                .any(|p| p.id != record.id && p.charge_key.as_deref() == Some(key.as_str())),
            None => false,
        }
    }

    fn payment_by_order_id(&self, order_id: &str) -> Option<PaymentRecord> {
        self.payments_by_order
            .get(order_id)
            .and_then(|id| self.payments.get(id))
            .cloned()
    }

    fn unsettled_recurring(&self, subscription_id: Uuid) -> Option<PaymentRecord> {
        self.payments
            .values()
            .filter(|p| p.subscription_id == subscription_id && p.kind == ChargeKind::Recurring)
            .filter(|p| p.status.is_pending())
            .min_by_key(|p| p.created_at)
            .cloned()
    }

    fn insert_payment(&mut self, record: &PaymentRecord) -> BillingResult<bool> {
        if self.payments_by_order.contains_key(&record.order_id) {
            return Ok(false);
        }
        if !self.subscriptions.contains_key(&record.subscription_id) {
            return Err(BillingError::NotFound(format!(
                "subscription {}",
                record.subscription_id
            )));
        }
        self.payments_by_order
            .insert(record.order_id.clone(), record.id);
        self.payments.insert(record.id, record.clone());
        Ok(true)
    }

    fn write_payment(&mut self, record: &PaymentRecord) -> BillingResult<()> {
        if !self.payments.contains_key(&record.id) {
            return Err(BillingError::NotFound(format!("payment {}", record.order_id)));
        }
        if self.charge_key_taken(record) {
            return Err(BillingError::OrderConflict(format!(
                "charge key already recorded for another order than {}",
                record.order_id
            )));
        }
        self.payments.insert(record.id, record.clone());
        Ok(())
    }

    fn write_subscription(&mut self, record: &SubscriptionRecord) -> BillingResult<()> {
        let existing = self
            .subscriptions
            .get(&record.id)
            .ok_or_else(|| BillingError::NotFound(format!("subscription {}", record.id)))?;

        let mut updated = record.clone();
        updated.customer_id = existing.customer_id;
        updated.customer_key = existing.customer_key.clone();
        updated.created_at = existing.created_at;
        self.subscriptions.insert(record.id, updated);
        Ok(())
    }

    fn write_charge_outcome(
        &mut self,
        payment: &PaymentRecord,
        subscription: &SubscriptionRecord,
    ) -> BillingResult<()> {
        // Validate both writes before applying either
        if !self.payments.contains_key(&payment.id) {
            return Err(BillingError::NotFound(format!("payment {}", payment.order_id)));
        }
        if !self.subscriptions.contains_key(&subscription.id) {
            return Err(BillingError::NotFound(format!("subscription {}", subscription.id)));
        }
        if self.charge_key_taken(payment) {
            return Err(BillingError::OrderConflict(format!(
                "charge key already recorded for another order than {}",
                payment.order_id
            )));
        }

        self.write_payment(payment)?;
        self.write_subscription(subscription)
    }
}

#[derive(Default)]
pub struct MemoryStore {
    tables: Arc<Mutex<Tables>>,
    locks: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BillingStore for MemoryStore {
    async fn get_subscription(&self, id: Uuid) -> BillingResult<Option<SubscriptionRecord>> {
        Ok(self.tables.lock().await.subscriptions.get(&id).cloned())
    }

    async fn find_subscription_by_customer(
        &self,
        customer_id: Uuid,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        Ok(self
            .tables
            .lock()
            .await
            .subscriptions
            .values()
            .find(|s| s.customer_id == customer_id)
            .cloned())
    }

    async fn find_subscription_by_customer_key(
        &self,
        customer_key: &str,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        Ok(self
            .tables
            .lock()
            .await
            .subscriptions
            .values()
            .find(|s| s.customer_key == customer_key)
            .cloned())
    }

    async fn insert_subscription_if_absent(
        &self,
        record: &SubscriptionRecord,
    ) -> BillingResult<SubscriptionRecord> {
        let mut tables = self.tables.lock().await;
        if let Some(existing) = tables
            .subscriptions
            .values()
            .find(|s| s.customer_id == record.customer_id)
        {
            return Ok(existing.clone());
        }
        tables.subscriptions.insert(record.id, record.clone());
        Ok(record.clone())
    }

    async fn save_subscription(&self, record: &SubscriptionRecord) -> BillingResult<()> {
        self.tables.lock().await.write_subscription(record)
    }

    async fn list_subscriptions(&self) -> BillingResult<Vec<SubscriptionRecord>> {
        let mut subs: Vec<_> = self
            .tables
            .lock()
            .await
            .subscriptions
            .values()
            .cloned()
            .collect();
        subs.sort_by_key(|s| s.created_at);
        Ok(subs)
    }

    async fn list_due_subscriptions(&self, today: Date) -> BillingResult<Vec<SubscriptionRecord>> {
        let mut due: Vec<_> = self
            .tables
            .lock()
            .await
            .subscriptions
            .values()
            .filter(|s| s.is_due_by(today))
            .cloned()
            .collect();
        due.sort_by_key(|s| (s.next_billing_date, s.created_at));
        Ok(due)
    }

    async fn find_payment_by_order_id(&self, order_id: &str) -> BillingResult<Option<PaymentRecord>> {
        Ok(self.tables.lock().await.payment_by_order_id(order_id))
    }

    async fn find_payment_by_charge_key(
        &self,
        charge_key: &str,
    ) -> BillingResult<Option<PaymentRecord>> {
        Ok(self
            .tables
            .lock()
            .await
            .payments
            .values()
            .find(|p| p.charge_key.as_deref() == Some(charge_key))
            .cloned())
    }

    async fn insert_payment(&self, record: &PaymentRecord) -> BillingResult<bool> {
        self.tables.lock().await.insert_payment(record)
    }

    async fn update_payment(&self, record: &PaymentRecord) -> BillingResult<()> {
        self.tables.lock().await.write_payment(record)
    }

    async fn list_payments(&self) -> BillingResult<Vec<PaymentRecord>> {
        let mut payments: Vec<_> = self.tables.lock().await.payments.values().cloned().collect();
        sort_newest_approved_first(&mut payments);
        Ok(payments)
    }

    async fn payment_stats(&self) -> BillingResult<PaymentStats> {
        Ok(PaymentStats::from_records(
            self.tables.lock().await.payments.values(),
        ))
    }

    async fn record_charge_outcome(
        &self,
        payment: &PaymentRecord,
        subscription: &SubscriptionRecord,
    ) -> BillingResult<()> {
        self.tables
            .lock()
            .await
            .write_charge_outcome(payment, subscription)
    }

    async fn lock_subscription(&self, subscription_id: Uuid) -> BillingResult<SubscriptionLock> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks
                .entry(subscription_id)
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let session = MemorySession {
            tables: self.tables.clone(),
            _guard: lock.lock_owned().await,
        };
        Ok(SubscriptionLock::new(subscription_id, Box::new(session)))
    }
}

/// Table access for the holder of one subscription's mutex
struct MemorySession {
    tables: Arc<Mutex<Tables>>,
    _guard: OwnedMutexGuard<()>,
}

#[async_trait]
impl LockSession for MemorySession {
    async fn get_subscription(&mut self, id: Uuid) -> BillingResult<Option<SubscriptionRecord>> {
        Ok(self.tables.lock().await.subscriptions.get(&id).cloned())
    }

    async fn save_subscription(&mut self, record: &SubscriptionRecord) -> BillingResult<()> {
        self.tables.lock().await.write_subscription(record)
    }

    async fn find_payment_by_order_id(&mut self, order_id: &str) -> BillingResult<Option<PaymentRecord>> {
        Ok(self.tables.lock().await.payment_by_order_id(order_id))
    }

    async fn find_unsettled_recurring(&mut self, subscription_id: Uuid) -> BillingResult<Option<PaymentRecord>> {
        Ok(self.tables.lock().await.unsettled_recurring(subscription_id))
    }

    async fn insert_payment(&mut self, record: &PaymentRecord) -> BillingResult<bool> {
        self.tables.lock().await.insert_payment(record)
    }

    async fn update_payment(&mut self, record: &PaymentRecord) -> BillingResult<()> {
        self.tables.lock().await.write_payment(record)
    }

    async fn record_charge_outcome(
        &mut self,
        payment: &PaymentRecord,
        subscription: &SubscriptionRecord,
    ) -> BillingResult<()> {
        self.tables
            .lock()
            .await
            .write_charge_outcome(payment, subscription)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{ChargeKind, PaymentStatus};
    use crate::plan::PlanCatalog;
    use std::time::Duration;
    use time::OffsetDateTime;

    async fn seeded() -> (MemoryStore, SubscriptionRecord) {
        let store = MemoryStore::new();
        let sub = SubscriptionRecord::new_base(
            Uuid::new_v4(),
            &PlanCatalog::default(),
            OffsetDateTime::now_utc(),
        );
        store.insert_subscription_if_absent(&sub).await.unwrap();
        (store, sub)
    }

    fn payment(order_id: &str, sub: &SubscriptionRecord) -> PaymentRecord {
        PaymentRecord::requested(
            order_id,
            "Premium",
            9900,
            ChargeKind::OneOff,
            sub.customer_id,
            sub.id,
            OffsetDateTime::now_utc(),
        )
    }

    #[tokio::test]
    async fn test_one_subscription_per_customer() {
        let (store, sub) = seeded().await;
        let mut second = SubscriptionRecord::new_base(
            sub.customer_id,
            &PlanCatalog::default(),
            OffsetDateTime::now_utc(),
        );
        second.price = 1;

        let stored = store.insert_subscription_if_absent(&second).await.unwrap();
        assert_eq!(stored.id, sub.id);
        assert_eq!(store.list_subscriptions().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_customer_key_survives_save() {
        let (store, sub) = seeded().await;
        let mut changed = sub.clone();
        changed.customer_key = "cust_other".into();
        changed.is_active = true;
        store.save_subscription(&changed).await.unwrap();

        let reloaded = store.get_subscription(sub.id).await.unwrap().unwrap();
        assert_eq!(reloaded.customer_key, sub.customer_key);
        assert!(reloaded.is_active);
    }

    #[tokio::test]
    async fn test_duplicate_order_id_not_inserted() {
        let (store, sub) = seeded().await;
        assert!(store.insert_payment(&payment("X", &sub)).await.unwrap());
        assert!(!store.insert_payment(&payment("X", &sub)).await.unwrap());
        assert_eq!(store.list_payments().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_charge_key_unique_once_populated() {
        let (store, sub) = seeded().await;
        let mut first = payment("A", &sub);
        let mut second = payment("B", &sub);
        store.insert_payment(&first).await.unwrap();
        store.insert_payment(&second).await.unwrap();

        first.status = PaymentStatus::Done;
        first.charge_key = Some("ck".into());
        store.update_payment(&first).await.unwrap();

        second.status = PaymentStatus::Done;
        second.charge_key = Some("ck".into());
        let err = store.update_payment(&second).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_outcome_write_is_all_or_nothing() {
        let (store, sub) = seeded().await;
        let mut orphan = payment("never-inserted", &sub);
        orphan.status = PaymentStatus::Done;
        let mut advanced = sub.clone();
        advanced.next_billing_date = Some(time::macros::date!(2030 - 01 - 01));

        assert!(store.record_charge_outcome(&orphan, &advanced).await.is_err());
        let reloaded = store.get_subscription(sub.id).await.unwrap().unwrap();
        assert_eq!(reloaded.next_billing_date, None);
    }

    #[tokio::test]
    async fn test_lock_holder_reads_and_writes_through_guard() {
        let (store, sub) = seeded().await;
        let mut lock = store.lock_subscription(sub.id).await.unwrap();

        let mut record = payment("A", &sub);
        assert!(lock.insert_payment(&record).await.unwrap());
        record.status = PaymentStatus::InProgress;
        lock.update_payment(&record).await.unwrap();
        assert_eq!(
            lock.find_payment_by_order_id("A").await.unwrap().unwrap().status,
            PaymentStatus::InProgress
        );

        let mut current = lock.subscription().await.unwrap();
        current.is_active = true;
        record.status = PaymentStatus::Done;
        record.charge_key = Some("ck_a".into());
        lock.record_charge_outcome(&record, &current).await.unwrap();

        // Writes are visible outside the lock before it is released
        assert!(store.get_subscription(sub.id).await.unwrap().unwrap().is_active);
        drop(lock);
        let stored = store.find_payment_by_order_id("A").await.unwrap().unwrap();
        assert_eq!(stored.status, PaymentStatus::Done);
    }

    #[tokio::test]
    async fn test_lock_refuses_writes_for_other_subscriptions() {
        let (store, sub) = seeded().await;
        let other = SubscriptionRecord::new_base(
            Uuid::new_v4(),
            &PlanCatalog::default(),
            OffsetDateTime::now_utc(),
        );
        store.insert_subscription_if_absent(&other).await.unwrap();

        let mut lock = store.lock_subscription(sub.id).await.unwrap();
        assert!(matches!(
            lock.save_subscription(&other).await,
            Err(BillingError::Validation(_))
        ));
        assert!(matches!(
            lock.insert_payment(&payment("B", &other)).await,
            Err(BillingError::Validation(_))
        ));
        assert!(store.find_payment_by_order_id("B").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unsettled_recurring_ignores_one_off_and_settled_rows() {
        let (store, sub) = seeded().await;
        let mut lock = store.lock_subscription(sub.id).await.unwrap();

        let one_off = payment("one-off", &sub);
        lock.insert_payment(&one_off).await.unwrap();
        let mut settled = payment("REC-settled", &sub);
        settled.kind = ChargeKind::Recurring;
        settled.status = PaymentStatus::Failed;
        lock.insert_payment(&settled).await.unwrap();
        assert!(lock.find_unsettled_recurring().await.unwrap().is_none());

        let mut pending = payment("REC-pending", &sub);
        pending.kind = ChargeKind::Recurring;
        lock.insert_payment(&pending).await.unwrap();
        let found = lock.find_unsettled_recurring().await.unwrap().unwrap();
        assert_eq!(found.order_id, "REC-pending");
    }

    #[tokio::test]
    async fn test_due_listing_catches_up_and_skips_suspended() {
        let store = MemoryStore::new();
        let now = OffsetDateTime::now_utc();
        let catalog = PlanCatalog::default();
        let today = time::macros::date!(2025 - 11 - 22);

        let mut due_dates = Vec::new();
        for (due, suspended) in [
            (time::macros::date!(2025 - 11 - 20), false),
            (time::macros::date!(2025 - 11 - 22), false),
            (time::macros::date!(2025 - 11 - 23), false),
            (time::macros::date!(2025 - 11 - 21), true),
        ] {
            let mut sub = SubscriptionRecord::new_base(Uuid::new_v4(), &catalog, now);
            sub.activate_premium("bk".into(), &catalog, now, time::UtcOffset::UTC);
            sub.next_billing_date = Some(due);
            if suspended {
                sub.suspend_billing(now);
            }
            store.insert_subscription_if_absent(&sub).await.unwrap();
            due_dates.push(due);
        }

        let listed: Vec<_> = store
            .list_due_subscriptions(today)
            .await
            .unwrap()
            .into_iter()
            .filter_map(|s| s.next_billing_date)
            .collect();
        assert_eq!(listed, vec![due_dates[0], due_dates[1]]);
    }

    #[tokio::test]
    async fn test_subscription_lock_serializes_holders() {
        let store = Arc::new(MemoryStore::new());
        let id = Uuid::new_v4();

        let guard = store.lock_subscription(id).await.unwrap();
        let contender = {
            let store = store.clone();
            tokio::spawn(async move { store.lock_subscription(id).await.map(|_| ()) })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        drop(guard);
        contender.await.unwrap().unwrap();
    }
}
