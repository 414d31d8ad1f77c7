//! Payment ledger
//!
//! Every charge attempt, one-off or recurring, is backed by exactly one
//! [`PaymentRecord`] keyed by its `order_id`. Rows move forward through
//! [`PaymentStatus`] and are never deleted.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::gateway::ChargeReceipt;

/// Lifecycle state of a payment record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    Requested,
    Ready,
    InProgress,
    Done,
    Failed,
    Canceled,
    PartialCanceled,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Requested => "REQUESTED",
            PaymentStatus::Ready => "READY",
            PaymentStatus::InProgress => "IN_PROGRESS",
            PaymentStatus::Done => "DONE",
            PaymentStatus::Failed => "FAILED",
            PaymentStatus::Canceled => "CANCELED",
            PaymentStatus::PartialCanceled => "PARTIAL_CANCELED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "REQUESTED" => Some(PaymentStatus::Requested),
            "READY" => Some(PaymentStatus::Ready),
            "IN_PROGRESS" => Some(PaymentStatus::InProgress),
            "DONE" => Some(PaymentStatus::Done),
            "FAILED" => Some(PaymentStatus::Failed),
            "CANCELED" => Some(PaymentStatus::Canceled),
            "PARTIAL_CANCELED" => Some(PaymentStatus::PartialCanceled),
            _ => None,
        }
    }

    /// Forward-only transition table.
    ///
    /// `PARTIAL_CANCELED` may repeat or close out to `CANCELED` as further
    /// refunds are recorded against the same charge.
    pub fn can_transition_to(&self, next: PaymentStatus) -> bool {
        use PaymentStatus::*;
        matches!(
            (self, next),
            (Requested, Ready)
                | (Requested, InProgress)
                | (Requested, Done)
                | (Requested, Failed)
                | (Ready, InProgress)
                | (Ready, Done)
                | (Ready, Failed)
                | (InProgress, Done)
                | (InProgress, Failed)
                | (Done, Canceled)
                | (Done, PartialCanceled)
                | (PartialCanceled, PartialCanceled)
                | (PartialCanceled, Canceled)
        )
    }

    /// No further automatic action is taken on these rows
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PaymentStatus::Done | PaymentStatus::Failed | PaymentStatus::Canceled
        )
    }

    /// Still waiting on a gateway outcome
    pub fn is_pending(&self) -> bool {
        matches!(
            self,
            PaymentStatus::Requested | PaymentStatus::Ready | PaymentStatus::InProgress
        )
    }

    /// Money was captured at some point (refunds keep the approval stamp)
    pub fn was_approved(&self) -> bool {
        matches!(
            self,
            PaymentStatus::Done | PaymentStatus::Canceled | PaymentStatus::PartialCanceled
        )
    }
}

impl std::fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Who started the charge attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChargeKind {
    /// User-initiated checkout confirmation
    OneOff,
    /// Scheduler-initiated renewal against the stored credential
    Recurring,
}

impl ChargeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChargeKind::OneOff => "one_off",
            ChargeKind::Recurring => "recurring",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "one_off" => Some(ChargeKind::OneOff),
            "recurring" => Some(ChargeKind::Recurring),
            _ => None,
        }
    }
}

/// One row of the payment ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentRecord {
    pub id: Uuid,
    /// Client-generated idempotency key, unique across all time
    pub order_id: String,
    /// Gateway-assigned key, present only after a successful confirmation
    pub charge_key: Option<String>,
    pub order_label: String,
    /// Minor currency units
    pub amount: i64,
    pub method: Option<String>,
    pub status: PaymentStatus,
    pub kind: ChargeKind,
    pub approved_at: Option<OffsetDateTime>,
    pub failure_reason: Option<String>,
    pub canceled_amount: i64,
    pub customer_id: Uuid,
    pub subscription_id: Uuid,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl PaymentRecord {
    /// Start a new charge attempt in `REQUESTED`
    pub fn requested(
        order_id: impl Into<String>,
        order_label: impl Into<String>,
        amount: i64,
        kind: ChargeKind,
        customer_id: Uuid,
        subscription_id: Uuid,
        now: OffsetDateTime,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            order_id: order_id.into(),
            charge_key: None,
            order_label: order_label.into(),
            amount,
            method: None,
            status: PaymentStatus::Requested,
            kind,
            approved_at: None,
            failure_reason: None,
            canceled_amount: 0,
            customer_id,
            subscription_id,
            created_at: now,
            updated_at: now,
        }
    }

    /// Move to `next`, rejecting anything the state machine forbids
    pub fn transition(&mut self, next: PaymentStatus, now: OffsetDateTime) -> BillingResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(BillingError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.updated_at = now;
        Ok(())
    }

    /// Record a gateway approval: `DONE`, stamped with charge key and time
    pub fn approve(&mut self, receipt: &ChargeReceipt, now: OffsetDateTime) -> BillingResult<()> {
        self.transition(PaymentStatus::Done, now)?;
        self.charge_key = Some(receipt.charge_key.clone());
        self.method = receipt.method.clone();
        self.approved_at = Some(receipt.approved_at.unwrap_or(now));
        self.failure_reason = None;
        Ok(())
    }

    /// Record a gateway failure or an indeterminate outcome
    pub fn fail(&mut self, reason: impl Into<String>, now: OffsetDateTime) -> BillingResult<()> {
        self.transition(PaymentStatus::Failed, now)?;
        self.failure_reason = Some(reason.into());
        Ok(())
    }

    /// Amount still refundable
    pub fn refundable_amount(&self) -> i64 {
        if self.status.was_approved() {
            self.amount - self.canceled_amount
        } else {
            0
        }
    }

    pub fn summary(&self) -> PaymentSummary {
        PaymentSummary::from(self)
    }
}

/// Caller-facing view of a payment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentSummary {
    pub order_id: String,
    pub charge_key: Option<String>,
    pub order_label: String,
    pub amount: i64,
    pub method: Option<String>,
    pub status: PaymentStatus,
    pub kind: ChargeKind,
    #[serde(with = "time::serde::rfc3339::option")]
    pub approved_at: Option<OffsetDateTime>,
    pub failure_reason: Option<String>,
    pub canceled_amount: i64,
    pub customer_id: Uuid,
}

impl From<&PaymentRecord> for PaymentSummary {
    fn from(record: &PaymentRecord) -> Self {
        Self {
            order_id: record.order_id.clone(),
            charge_key: record.charge_key.clone(),
            order_label: record.order_label.clone(),
            amount: record.amount,
            method: record.method.clone(),
            status: record.status,
            kind: record.kind,
            approved_at: record.approved_at,
            failure_reason: record.failure_reason.clone(),
            canceled_amount: record.canceled_amount,
            customer_id: record.customer_id,
        }
    }
}

/// Aggregated ledger statistics for the admin dashboard.
///
/// A charge the gateway approved stays a success after it is refunded;
/// refunds only reduce revenue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentStats {
    pub total_count: i64,
    /// Rows the gateway approved: `DONE`, `PARTIAL_CANCELED` or `CANCELED`
    pub success_count: i64,
    /// Approved amounts net of refunded amounts
    pub total_revenue: i64,
}

impl PaymentStats {
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a PaymentRecord>) -> Self {
        records.into_iter().fold(Self::default(), |mut stats, record| {
            stats.total_count += 1;
            if record.status.was_approved() {
                stats.success_count += 1;
                stats.total_revenue += record.amount - record.canceled_amount;
            }
            stats
        })
    }
}

/// Newest approval first; never-approved rows last, newest created first
pub fn sort_newest_approved_first(records: &mut [PaymentRecord]) {
    records.sort_by(|a, b| match (a.approved_at, b.approved_at) {
        (Some(x), Some(y)) => y.cmp(&x).then(b.created_at.cmp(&a.created_at)),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => b.created_at.cmp(&a.created_at),
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(status: PaymentStatus) -> PaymentRecord {
        let mut record = PaymentRecord::requested(
            "order-1",
            "Premium",
            9900,
            ChargeKind::OneOff,
            Uuid::new_v4(),
            Uuid::new_v4(),
            OffsetDateTime::now_utc(),
        );
        record.status = status;
        record
    }

    fn receipt() -> ChargeReceipt {
        ChargeReceipt {
            charge_key: "ck_1".to_string(),
            order_id: "order-1".to_string(),
            amount: 9900,
            method: Some("card".to_string()),
            approved_at: None,
        }
    }

    #[test]
    fn test_requested_is_the_only_initial_state() {
        let record = record(PaymentStatus::Requested);
        assert_eq!(record.status, PaymentStatus::Requested);
        assert!(record.charge_key.is_none());
        assert!(record.approved_at.is_none());
    }

    #[test]
    fn test_done_cannot_move_backwards() {
        let now = OffsetDateTime::now_utc();
        for next in [
            PaymentStatus::Requested,
            PaymentStatus::Ready,
            PaymentStatus::InProgress,
            PaymentStatus::Failed,
        ] {
            let mut done = record(PaymentStatus::Done);
            let err = done.transition(next, now).unwrap_err();
            assert!(matches!(err, BillingError::InvalidTransition { .. }));
            assert_eq!(done.status, PaymentStatus::Done);
        }
    }

    #[test]
    fn test_failed_and_canceled_are_dead_ends() {
        let now = OffsetDateTime::now_utc();
        let mut failed = record(PaymentStatus::Failed);
        assert!(failed.transition(PaymentStatus::Done, now).is_err());

        let mut canceled = record(PaymentStatus::Canceled);
        assert!(canceled.transition(PaymentStatus::Done, now).is_err());
        assert!(canceled
            .transition(PaymentStatus::PartialCanceled, now)
            .is_err());
    }

    #[test]
    fn test_approve_stamps_charge_key_and_time() {
        let now = OffsetDateTime::now_utc();
        let mut record = record(PaymentStatus::InProgress);
        record.approve(&receipt(), now).unwrap();

        assert_eq!(record.status, PaymentStatus::Done);
        assert_eq!(record.charge_key.as_deref(), Some("ck_1"));
        assert_eq!(record.approved_at, Some(now));
        assert_eq!(record.method.as_deref(), Some("card"));
    }

    #[test]
    fn test_fail_keeps_charge_key_empty() {
        let now = OffsetDateTime::now_utc();
        let mut record = record(PaymentStatus::InProgress);
        record.fail("card declined", now).unwrap();

        assert_eq!(record.status, PaymentStatus::Failed);
        assert!(record.charge_key.is_none());
        assert!(record.approved_at.is_none());
        assert_eq!(record.failure_reason.as_deref(), Some("card declined"));
    }

    #[test]
    fn test_status_strings_parse_back() {
        for status in [
            PaymentStatus::Requested,
            PaymentStatus::Ready,
            PaymentStatus::InProgress,
            PaymentStatus::Done,
            PaymentStatus::Failed,
            PaymentStatus::Canceled,
            PaymentStatus::PartialCanceled,
        ] {
            assert_eq!(PaymentStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(PaymentStatus::parse("WAITING"), None);
    }

    #[test]
    fn test_stats_keep_refunded_charges_as_successes() {
        let mut fully_refunded = record(PaymentStatus::Canceled);
        fully_refunded.canceled_amount = 9900;
        let mut partly_refunded = record(PaymentStatus::PartialCanceled);
        partly_refunded.canceled_amount = 3000;

        let records = vec![
            record(PaymentStatus::Done),
            record(PaymentStatus::Done),
            record(PaymentStatus::Failed),
            record(PaymentStatus::InProgress),
            fully_refunded,
            partly_refunded,
        ];
        let stats = PaymentStats::from_records(&records);
        assert_eq!(stats.total_count, 6);
        assert_eq!(stats.success_count, 4);
        assert_eq!(stats.total_revenue, 9900 + 9900 + 6900);
    }

    #[test]
    fn test_sort_puts_latest_approval_first() {
        let base = OffsetDateTime::now_utc();
        let mut older = record(PaymentStatus::Done);
        older.order_id = "older".into();
        older.approved_at = Some(base - time::Duration::days(2));
        let mut newer = record(PaymentStatus::Done);
        newer.order_id = "newer".into();
        newer.approved_at = Some(base);
        let mut failed = record(PaymentStatus::Failed);
        failed.order_id = "failed".into();

        let mut records = vec![failed, older, newer];
        sort_newest_approved_first(&mut records);

        let order: Vec<&str> = records.iter().map(|r| r.order_id.as_str()).collect();
        assert_eq!(order, vec!["newer", "older", "failed"]);
    }
}
