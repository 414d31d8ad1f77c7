//! Billing orchestrator
//!
//! The single place where the payment ledger and subscription table are
//! mutated. Every operation that touches a subscription runs under that
//! subscription's lock, so a cancellation racing a scheduled charge is
//! either fully before or fully after it. Reads and writes inside the
//! critical section go through the lock guard.
//!
//! ## Idempotency
//!
//! `order_id` is the idempotency key for one-off charges. A replay of a
//! settled order with the same amount returns the recorded result; any other
//! replay is a conflict and leaves the ledger untouched. Recurring charges
//! mint a fresh order id per attempt and are never retried under it.

use std::sync::Arc;

use recurbill_shared::SubscriptionTier;
use serde::{Deserialize, Serialize};
use time::{Date, OffsetDateTime, UtcOffset};
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::events::{BillingEvent, EventSink};
use crate::gateway::{ChargeRequest, ChargeSource, GatewayClient, GatewayError};
use crate::ledger::{ChargeKind, PaymentRecord, PaymentStats, PaymentStatus, PaymentSummary};
use crate::plan::PlanCatalog;
use crate::store::BillingStore;
use crate::subscription::{CredentialSummary, SubscriptionRecord, SubscriptionSummary};

/// Label written on scheduler-initiated ledger rows
pub const RECURRING_ORDER_LABEL: &str = "Premium subscription renewal";

/// A user-initiated checkout confirmation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OneOffCharge {
    pub customer_id: Uuid,
    pub order_id: String,
    pub order_label: String,
    pub amount: i64,
    /// Produced by the client-side checkout widget
    pub payment_key: String,
}

/// Outcome of one scheduled charge attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecurringChargeResult {
    /// Gateway approved; the due date moved one period out
    Charged(PaymentSummary),
    /// Gateway declined or the outcome is unknown; the due date is unchanged
    /// and automatic charging is suspended
    Declined(PaymentSummary),
    /// No longer eligible once the lock was held (canceled, rescheduled,
    /// already charged), or suspended because an earlier attempt never settled
    Skipped,
}

pub struct BillingOrchestrator {
    store: Arc<dyn BillingStore>,
    gateway: GatewayClient,
    catalog: PlanCatalog,
    /// Offset of the billing calendar; periods are counted in its dates
    utc_offset: UtcOffset,
    events: Arc<dyn EventSink>,
}

impl BillingOrchestrator {
    pub fn new(
        store: Arc<dyn BillingStore>,
        gateway: GatewayClient,
        catalog: PlanCatalog,
        utc_offset: UtcOffset,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            store,
            gateway,
            catalog,
            utc_offset,
            events,
        }
    }

    pub fn utc_offset(&self) -> UtcOffset {
        self.utc_offset
    }

    /// Calendar date in the billing zone
    pub fn today(&self) -> Date {
        OffsetDateTime::now_utc().to_offset(self.utc_offset).date()
    }

    pub fn store(&self) -> &Arc<dyn BillingStore> {
        &self.store
    }

    pub fn catalog(&self) -> &PlanCatalog {
        &self.catalog
    }

    // =========================================================================
    // Subscriptions
    // =========================================================================

    /// Load the customer's subscription, creating the base record on first touch
    pub async fn ensure_subscription(&self, customer_id: Uuid) -> BillingResult<SubscriptionRecord> {
        if let Some(existing) = self.store.find_subscription_by_customer(customer_id).await? {
            return Ok(existing);
        }

        let fresh = SubscriptionRecord::new_base(customer_id, &self.catalog, OffsetDateTime::now_utc());
        let stored = self.store.insert_subscription_if_absent(&fresh).await?;
        if stored.id == fresh.id {
            tracing::info!(
                customer_id = %customer_id,
                subscription_id = %stored.id,
                "Created base subscription"
            );
        }
        Ok(stored)
    }

    /// Current terms; a customer seen for the first time gets the base record
    pub async fn get_subscription(&self, customer_id: Uuid) -> BillingResult<SubscriptionSummary> {
        let subscription = self.ensure_subscription(customer_id).await?;
        Ok(subscription.summary(OffsetDateTime::now_utc()))
    }

    /// Exchange a checkout authorization for a recurring credential and
    /// start premium terms.
    ///
    /// Re-issuing the credential the customer already holds is a no-op.
    /// A different credential while a mandate is active is rejected.
    pub async fn issue_billing_credential(
        &self,
        customer_id: Uuid,
        auth_key: &str,
    ) -> BillingResult<CredentialSummary> {
        if auth_key.trim().is_empty() {
            return Err(BillingError::Validation("auth_key is required".into()));
        }

        let subscription = self.ensure_subscription(customer_id).await?;
        let mut lock = self.store.lock_subscription(subscription.id).await?;
        let mut subscription = lock.subscription().await?;

        let issued = self
            .gateway
            .issue_credential(&subscription.customer_key, auth_key)
            .await
            .map_err(|e| {
                tracing::warn!(
                    customer_id = %customer_id,
                    error = %e,
                    "Gateway refused to issue billing credential"
                );
                BillingError::from(e)
            })?;

        let now = OffsetDateTime::now_utc();

        if subscription.has_mandate() && subscription.tier == SubscriptionTier::Premium {
            if subscription.billing_credential.as_deref() == Some(issued.credential.as_str()) {
                return Ok(CredentialSummary {
                    customer_key: subscription.customer_key.clone(),
                    method: issued.method,
                    card_last4: issued.card_last4,
                    subscription: subscription.summary(now),
                });
            }
            tracing::warn!(
                customer_id = %customer_id,
                subscription_id = %subscription.id,
                "Rejected second billing credential for active premium subscription"
            );
            return Err(BillingError::AlreadySubscribed);
        }

        subscription.activate_premium(issued.credential, &self.catalog, now, self.utc_offset);
        lock.save_subscription(&subscription).await?;

        tracing::info!(
            customer_id = %customer_id,
            subscription_id = %subscription.id,
            next_billing_date = ?subscription.next_billing_date,
            "Activated premium subscription"
        );
        self.events.emit(BillingEvent::SubscriptionActivated {
            customer_id,
            customer_key: subscription.customer_key.clone(),
            next_billing_date: subscription.next_billing_date,
        });

        Ok(CredentialSummary {
            customer_key: subscription.customer_key.clone(),
            method: issued.method,
            card_last4: issued.card_last4,
            subscription: subscription.summary(now),
        })
    }

    /// Detach the credential and drop to the base tier, effective now.
    /// Canceling an inactive subscription returns its current state.
    pub async fn cancel_subscription(&self, customer_key: &str) -> BillingResult<SubscriptionSummary> {
        let subscription = self
            .store
            .find_subscription_by_customer_key(customer_key)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("customer key {}", customer_key)))?;

        let mut lock = self.store.lock_subscription(subscription.id).await?;
        let mut subscription = lock.subscription().await?;
        let now = OffsetDateTime::now_utc();

        if !subscription.is_active && subscription.billing_credential.is_none() {
            tracing::debug!(
                subscription_id = %subscription.id,
                "Cancel requested for inactive subscription, nothing to do"
            );
            return Ok(subscription.summary(now));
        }

        subscription.deactivate_premium(&self.catalog, now);
        lock.save_subscription(&subscription).await?;

        tracing::info!(
            customer_id = %subscription.customer_id,
            subscription_id = %subscription.id,
            "Canceled subscription"
        );
        self.events.emit(BillingEvent::SubscriptionCanceled {
            customer_id: subscription.customer_id,
            customer_key: subscription.customer_key.clone(),
            canceled_at: now,
        });

        Ok(subscription.summary(now))
    }

    /// Put a mandate-holding subscription back into the due set on `date`.
    /// This is the recovery path after a declined renewal: it also lifts the
    /// suspension the failure placed on automatic charging.
    pub async fn reschedule_billing(
        &self,
        customer_key: &str,
        date: Date,
        today: Date,
    ) -> BillingResult<SubscriptionSummary> {
        if date < today {
            return Err(BillingError::Validation(format!(
                "billing date {} is in the past",
                date
            )));
        }

        let subscription = self
            .store
            .find_subscription_by_customer_key(customer_key)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("customer key {}", customer_key)))?;

        let mut lock = self.store.lock_subscription(subscription.id).await?;
        let mut subscription = lock.subscription().await?;

        if !subscription.has_mandate() {
            return Err(BillingError::Validation(
                "subscription has no active billing credential".into(),
            ));
        }

        let now = OffsetDateTime::now_utc();

        // The operator has reconciled anything still open against the gateway
        while let Some(mut stale) = lock.find_unsettled_recurring().await? {
            stale.fail("closed by manual reschedule", now)?;
            lock.update_payment(&stale).await?;
            tracing::warn!(
                subscription_id = %subscription.id,
                order_id = %stale.order_id,
                "Closed unsettled renewal on reschedule"
            );
        }

        let previous = subscription.next_billing_date;
        let was_suspended = subscription.billing_suspended_at.is_some();
        subscription.reschedule(date, now);
        lock.save_subscription(&subscription).await?;

        tracing::info!(
            subscription_id = %subscription.id,
            previous = ?previous,
            next_billing_date = %date,
            was_suspended,
            "Rescheduled billing date"
        );

        Ok(subscription.summary(now))
    }

    // =========================================================================
    // Charges
    // =========================================================================

    /// Confirm a user-initiated checkout. Gateway failures are recorded as
    /// `FAILED` and surfaced; nothing is retried beyond the boundary policy.
    pub async fn confirm_one_off_charge(&self, charge: OneOffCharge) -> BillingResult<PaymentSummary> {
        validate_one_off(&charge)?;

        if let Some(existing) = self.store.find_payment_by_order_id(&charge.order_id).await? {
            return resolve_replay(&existing, &charge);
        }

        let subscription = self.ensure_subscription(charge.customer_id).await?;
        let expected = self.expected_amount(&subscription);
        if charge.amount != expected {
            tracing::warn!(
                order_id = %charge.order_id,
                customer_id = %charge.customer_id,
                expected,
                actual = charge.amount,
                "Rejected charge with tampered amount"
            );
            return Err(BillingError::AmountTampered {
                expected,
                actual: charge.amount,
            });
        }

        let mut lock = self.store.lock_subscription(subscription.id).await?;

        let now = OffsetDateTime::now_utc();
        let mut record = PaymentRecord::requested(
            charge.order_id.clone(),
            charge.order_label.clone(),
            charge.amount,
            ChargeKind::OneOff,
            charge.customer_id,
            subscription.id,
            now,
        );

        if !lock.insert_payment(&record).await? {
            // Lost a race with a concurrent confirm of the same order
            let existing = lock
                .find_payment_by_order_id(&charge.order_id)
                .await?
                .ok_or_else(|| BillingError::NotFound(format!("order {}", charge.order_id)))?;
            return resolve_replay(&existing, &charge);
        }

        record.transition(PaymentStatus::InProgress, now)?;
        lock.update_payment(&record).await?;

        let request = ChargeRequest {
            source: ChargeSource::PaymentKey(charge.payment_key.clone()),
            order_id: charge.order_id.clone(),
            order_label: charge.order_label.clone(),
            amount: charge.amount,
        };

        match self.confirm_with_gateway(&request).await {
            Ok(receipt) => {
                record.approve(&receipt, OffsetDateTime::now_utc())?;
                lock.update_payment(&record).await?;

                tracing::info!(
                    order_id = %record.order_id,
                    customer_id = %record.customer_id,
                    amount = record.amount,
                    "Payment approved"
                );
                self.events.emit(BillingEvent::PaymentApproved {
                    customer_id: record.customer_id,
                    order_id: record.order_id.clone(),
                    amount: record.amount,
                });
                Ok(record.summary())
            }
            Err(e) => {
                // FAILED is durable before the error goes anywhere else
                record.fail(e.to_string(), OffsetDateTime::now_utc())?;
                lock.update_payment(&record).await?;
                self.report_failure(&record, &e);
                Err(e.into())
            }
        }
    }

    /// Charge one subscription's stored credential for its current cycle.
    /// Only the scheduler calls this.
    ///
    /// The cycle is the subscription's due date, which may be earlier than
    /// `today` when a run was missed. On success the ledger row and the
    /// advanced due date are written together. On failure the row is
    /// `FAILED`, the due date stays put and automatic charging is suspended
    /// until the subscription is rescheduled.
    pub async fn confirm_recurring_charge(
        &self,
        subscription_id: Uuid,
        today: Date,
    ) -> BillingResult<RecurringChargeResult> {
        let mut lock = self.store.lock_subscription(subscription_id).await?;
        let mut subscription = lock.subscription().await?;

        let due = (
            subscription.next_billing_date,
            subscription.billing_credential.clone(),
        );
        let (cycle, credential) = match due {
            (Some(cycle), Some(credential)) if subscription.is_due_by(today) => (cycle, credential),
            _ => {
                tracing::warn!(
                    subscription_id = %subscription_id,
                    is_active = subscription.is_active,
                    next_billing_date = ?subscription.next_billing_date,
                    suspended = subscription.billing_suspended_at.is_some(),
                    "Subscription no longer due, skipping"
                );
                return Ok(RecurringChargeResult::Skipped);
            }
        };

        if let Some(unsettled) = lock.find_unsettled_recurring().await? {
            // A previous attempt may have reached the gateway; charging again
            // could bill the cycle twice
            let now = OffsetDateTime::now_utc();
            subscription.suspend_billing(now);
            lock.save_subscription(&subscription).await?;
            tracing::error!(
                subscription_id = %subscription_id,
                order_id = %unsettled.order_id,
                status = %unsettled.status,
                "Earlier renewal never settled, billing suspended pending reconciliation"
            );
            return Ok(RecurringChargeResult::Skipped);
        }

        let now = OffsetDateTime::now_utc();
        let mut record = PaymentRecord::requested(
            recurring_order_id(cycle),
            RECURRING_ORDER_LABEL,
            subscription.price,
            ChargeKind::Recurring,
            subscription.customer_id,
            subscription.id,
            now,
        );
        if !lock.insert_payment(&record).await? {
            return Err(BillingError::OrderConflict(format!(
                "generated order id {} already exists",
                record.order_id
            )));
        }
        record.transition(PaymentStatus::InProgress, now)?;
        lock.update_payment(&record).await?;

        let request = ChargeRequest {
            source: ChargeSource::Credential {
                credential,
                customer_key: subscription.customer_key.clone(),
            },
            order_id: record.order_id.clone(),
            order_label: record.order_label.clone(),
            amount: record.amount,
        };

        match self.confirm_with_gateway(&request).await {
            Ok(receipt) => {
                let now = OffsetDateTime::now_utc();
                record.approve(&receipt, now)?;
                subscription.advance_billing_date(cycle, now);
                lock.record_charge_outcome(&record, &subscription).await?;

                tracing::info!(
                    order_id = %record.order_id,
                    subscription_id = %subscription.id,
                    amount = record.amount,
                    cycle = %cycle,
                    next_billing_date = ?subscription.next_billing_date,
                    "Recurring charge succeeded"
                );
                self.events.emit(BillingEvent::RecurringChargeSucceeded {
                    customer_id: subscription.customer_id,
                    order_id: record.order_id.clone(),
                    amount: record.amount,
                    next_billing_date: subscription.next_billing_date,
                });
                Ok(RecurringChargeResult::Charged(record.summary()))
            }
            Err(e) => {
                let now = OffsetDateTime::now_utc();
                record.fail(e.to_string(), now)?;
                subscription.suspend_billing(now);
                lock.record_charge_outcome(&record, &subscription).await?;
                self.report_failure(&record, &e);
                Ok(RecurringChargeResult::Declined(record.summary()))
            }
        }
    }

    // =========================================================================
    // Ledger reads
    // =========================================================================

    pub async fn get_payment_by_order_id(&self, order_id: &str) -> BillingResult<PaymentSummary> {
        self.store
            .find_payment_by_order_id(order_id)
            .await?
            .map(|p| p.summary())
            .ok_or_else(|| BillingError::NotFound(format!("order {}", order_id)))
    }

    pub async fn get_payment_by_charge_key(&self, charge_key: &str) -> BillingResult<PaymentSummary> {
        self.store
            .find_payment_by_charge_key(charge_key)
            .await?
            .map(|p| p.summary())
            .ok_or_else(|| BillingError::NotFound(format!("charge key {}", charge_key)))
    }

    /// Every ledger row, newest approval first
    pub async fn list_payments(&self) -> BillingResult<Vec<PaymentSummary>> {
        Ok(self
            .store
            .list_payments()
            .await?
            .iter()
            .map(PaymentSummary::from)
            .collect())
    }

    pub async fn payment_stats(&self) -> BillingResult<PaymentStats> {
        self.store.payment_stats().await
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    /// Premium subscribers pay their locked-in price; everyone else pays list
    fn expected_amount(&self, subscription: &SubscriptionRecord) -> i64 {
        if subscription.tier == SubscriptionTier::Premium {
            subscription.price
        } else {
            self.catalog.price_of(SubscriptionTier::Premium)
        }
    }

    /// Gateway call plus a sanity check that it captured what we asked for
    async fn confirm_with_gateway(
        &self,
        request: &ChargeRequest,
    ) -> Result<crate::gateway::ChargeReceipt, GatewayError> {
        let receipt = self.gateway.confirm_charge(request).await?;
        if receipt.amount != request.amount || receipt.order_id != request.order_id {
            return Err(GatewayError::InvalidResponse(format!(
                "gateway confirmed order {} for {} but {} for {} was requested",
                receipt.order_id, receipt.amount, request.order_id, request.amount
            )));
        }
        Ok(receipt)
    }

    /// Log and announce a failure already written to the ledger
    fn report_failure(&self, record: &PaymentRecord, error: &GatewayError) {
        let recurring = record.kind == ChargeKind::Recurring;
        if error.is_indeterminate() {
            tracing::error!(
                order_id = %record.order_id,
                customer_id = %record.customer_id,
                amount = record.amount,
                recurring,
                error = %error,
                "Gateway outcome unknown, recorded FAILED pending reconciliation"
            );
        } else {
            tracing::warn!(
                order_id = %record.order_id,
                customer_id = %record.customer_id,
                amount = record.amount,
                recurring,
                error = %error,
                "Charge declined"
            );
        }

        self.events.emit(BillingEvent::ChargeFailed {
            customer_id: record.customer_id,
            order_id: record.order_id.clone(),
            amount: record.amount,
            reason: error.to_string(),
            recurring,
        });
    }
}

fn validate_one_off(charge: &OneOffCharge) -> BillingResult<()> {
    if charge.order_id.trim().is_empty() {
        return Err(BillingError::Validation("order_id is required".into()));
    }
    if charge.payment_key.trim().is_empty() {
        return Err(BillingError::Validation("payment_key is required".into()));
    }
    if charge.amount <= 0 {
        return Err(BillingError::Validation(format!(
            "amount must be positive, got {}",
            charge.amount
        )));
    }
    Ok(())
}

/// Decide what a repeated confirm of a known order returns
fn resolve_replay(existing: &PaymentRecord, charge: &OneOffCharge) -> BillingResult<PaymentSummary> {
    if existing.customer_id != charge.customer_id {
        return Err(BillingError::OrderConflict(format!(
            "order {} belongs to another customer",
            existing.order_id
        )));
    }
    if existing.amount != charge.amount {
        tracing::warn!(
            order_id = %existing.order_id,
            expected = existing.amount,
            actual = charge.amount,
            "Replay with different amount rejected"
        );
        return Err(BillingError::AmountMismatch {
            expected: existing.amount,
            actual: charge.amount,
        });
    }

    match existing.status {
        status if status.was_approved() => {
            tracing::debug!(order_id = %existing.order_id, "Idempotent replay of settled order");
            Ok(existing.summary())
        }
        PaymentStatus::Failed => Err(BillingError::GatewayRejected {
            code: "ORDER_FAILED".into(),
            message: existing
                .failure_reason
                .clone()
                .unwrap_or_else(|| "payment previously failed".into()),
        }),
        _ => Err(BillingError::PaymentInProgress(existing.order_id.clone())),
    }
}

/// Fresh per attempt; the date prefix keeps ledger rows greppable by cycle
fn recurring_order_id(cycle: Date) -> String {
    format!("REC-{}-{}", cycle, Uuid::new_v4().simple())
}
