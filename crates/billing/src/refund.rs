//! Refund recording for admin-initiated refunds
//!
//! The money movement itself happens at the gateway out of band; this
//! service records it against the ledger. A settled charge moves to
//! `PARTIAL_CANCELED` while a balance remains and to `CANCELED` once the
//! cumulative refunded amount reaches the charged amount.

use std::sync::Arc;

use serde::Serialize;
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};
use crate::events::{BillingEvent, EventSink};
use crate::ledger::PaymentStatus;
use crate::store::BillingStore;

/// Result of a refund operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RefundResult {
    pub order_id: String,
    /// Amount refunded by this call
    pub refunded: i64,
    /// Cumulative refunded amount on the charge
    pub canceled_amount: i64,
    /// Still refundable after this call
    pub remaining: i64,
    pub status: PaymentStatus,
}

pub struct RefundService {
    store: Arc<dyn BillingStore>,
    events: Arc<dyn EventSink>,
}

impl RefundService {
    pub fn new(store: Arc<dyn BillingStore>, events: Arc<dyn EventSink>) -> Self {
        Self { store, events }
    }

    /// Record a refund of `amount` against a settled charge
    pub async fn record_refund(&self, order_id: &str, amount: i64, reason: &str) -> BillingResult<RefundResult> {
        if amount <= 0 {
            return Err(BillingError::Validation(format!(
                "refund amount must be positive, got {}",
                amount
            )));
        }

        let payment = self
            .store
            .find_payment_by_order_id(order_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("order {}", order_id)))?;

        // Serialize with charges and other refunds on the same subscription
        let mut lock = self.store.lock_subscription(payment.subscription_id).await?;
        let mut payment = lock
            .find_payment_by_order_id(order_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("order {}", order_id)))?;

        if !matches!(payment.status, PaymentStatus::Done | PaymentStatus::PartialCanceled) {
            return Err(BillingError::InvalidTransition {
                from: payment.status,
                to: PaymentStatus::Canceled,
            });
        }

        let refundable = payment.refundable_amount();
        if amount > refundable {
            return Err(BillingError::Validation(format!(
                "refund of {} exceeds refundable balance {}",
                amount, refundable
            )));
        }

        let canceled_amount = payment.canceled_amount + amount;
        let next = if canceled_amount == payment.amount {
            PaymentStatus::Canceled
        } else {
            PaymentStatus::PartialCanceled
        };

        payment.transition(next, OffsetDateTime::now_utc())?;
        payment.canceled_amount = canceled_amount;
        lock.update_payment(&payment).await?;

        tracing::info!(
            order_id = %payment.order_id,
            customer_id = %payment.customer_id,
            refunded = amount,
            canceled_amount,
            status = %payment.status,
            reason,
            "Recorded refund"
        );
        self.events.emit(BillingEvent::PaymentRefunded {
            customer_id: payment.customer_id,
            order_id: payment.order_id.clone(),
            refunded: amount,
            fully_refunded: next == PaymentStatus::Canceled,
        });

        Ok(RefundResult {
            order_id: payment.order_id.clone(),
            refunded: amount,
            canceled_amount,
            remaining: payment.refundable_amount(),
            status: payment.status,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::TracingEventSink;
    use crate::ledger::{ChargeKind, PaymentRecord};
    use crate::plan::PlanCatalog;
    use crate::store::MemoryStore;
    use crate::subscription::SubscriptionRecord;

    async fn settled(status: PaymentStatus) -> (RefundService, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let now = OffsetDateTime::now_utc();
        let sub = SubscriptionRecord::new_base(uuid::Uuid::new_v4(), &PlanCatalog::default(), now);
        store.insert_subscription_if_absent(&sub).await.unwrap();

        let mut payment = PaymentRecord::requested("order-1", "Premium", 9900, ChargeKind::OneOff, sub.customer_id, sub.id, now);
        payment.status = status;
        if status.was_approved() {
            payment.charge_key = Some("ck_1".into());
            payment.approved_at = Some(now);
        }
        store.insert_payment(&payment).await.unwrap();

        (RefundService::new(store.clone(), Arc::new(TracingEventSink)), store)
    }

    #[tokio::test]
    async fn test_partial_then_full_refund() {
        let (refunds, store) = settled(PaymentStatus::Done).await;

        let first = refunds.record_refund("order-1", 4000, "goodwill").await.unwrap();
        assert_eq!(first.status, PaymentStatus::PartialCanceled);
        assert_eq!(first.remaining, 5900);

        let second = refunds.record_refund("order-1", 5900, "closed account").await.unwrap();
        assert_eq!(second.status, PaymentStatus::Canceled);
        assert_eq!(second.canceled_amount, 9900);
        assert_eq!(second.remaining, 0);

        let stored = store.find_payment_by_order_id("order-1").await.unwrap().unwrap();
        assert_eq!(stored.status, PaymentStatus::Canceled);
        assert!(stored.approved_at.is_some());
    }

    #[tokio::test]
    async fn test_refund_exceeding_balance_rejected() {
        let (refunds, store) = settled(PaymentStatus::Done).await;
        let err = refunds.record_refund("order-1", 10_000, "typo").await.unwrap_err();
        assert!(matches!(err, BillingError::Validation(_)));

        let stored = store.find_payment_by_order_id("order-1").await.unwrap().unwrap();
        assert_eq!(stored.status, PaymentStatus::Done);
        assert_eq!(stored.canceled_amount, 0);
    }

    #[tokio::test]
    async fn test_failed_charge_cannot_be_refunded() {
        let (refunds, _) = settled(PaymentStatus::Failed).await;
        let err = refunds.record_refund("order-1", 100, "n/a").await.unwrap_err();
        assert!(matches!(err, BillingError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_unknown_order_not_found() {
        let (refunds, _) = settled(PaymentStatus::Done).await;
        assert!(refunds
            .record_refund("missing", 100, "n/a")
            .await
            .unwrap_err()
            .is_not_found());
    }
}
