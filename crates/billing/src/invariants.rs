//! Billing Invariants Module
//!
//! Runnable consistency checks over the payment ledger and subscription
//! table. They only read, so they are safe to run at any time; the worker
//! runs them daily after the recurring charge pass and the admin API
//! exposes them on demand.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use recurbill_shared::SubscriptionTier;
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::error::BillingResult;
use crate::ledger::{PaymentRecord, PaymentStatus};
use crate::store::BillingStore;
use crate::subscription::SubscriptionRecord;

/// Pending rows older than this were abandoned mid-charge
const STALE_PENDING_AFTER: Duration = Duration::hours(1);

/// Result of running a single invariant check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated
    pub invariant: String,
    /// Customer(s) affected
    pub customer_ids: Vec<Uuid>,
    /// Human-readable description of the violation
    pub description: String,
    /// Additional context for debugging
    pub context: serde_json::Value,
    pub severity: ViolationSeverity,
}

/// Severity of an invariant violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Money may have been lost or duplicated
    Critical,
    /// Data inconsistency that needs attention
    High,
    /// Potential issue, should investigate
    Medium,
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

/// Summary of all invariant checks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    #[serde(with = "time::serde::rfc3339")]
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

type Check = fn(&Snapshot) -> Vec<InvariantViolation>;

const CHECKS: &[(&str, Check)] = &[
    ("settled_has_approval", check_settled_has_approval),
    ("unsettled_has_no_charge_key", check_unsettled_has_no_charge_key),
    ("charge_key_unique", check_charge_key_unique),
    ("refund_within_amount", check_refund_within_amount),
    ("active_premium_has_mandate", check_active_premium_has_mandate),
    ("inactive_has_no_credential", check_inactive_has_no_credential),
    ("no_stale_pending", check_no_stale_pending),
];

/// Point-in-time copy of both tables
struct Snapshot {
    now: OffsetDateTime,
    payments: Vec<PaymentRecord>,
    subscriptions: Vec<SubscriptionRecord>,
}

/// Service for running billing invariant checks
pub struct InvariantChecker {
    store: Arc<dyn BillingStore>,
}

impl InvariantChecker {
    pub fn new(store: Arc<dyn BillingStore>) -> Self {
        Self { store }
    }

    /// Run all invariant checks and return summary
    pub async fn run_all_checks(&self) -> BillingResult<InvariantCheckSummary> {
        let snapshot = self.snapshot(OffsetDateTime::now_utc()).await?;

        let violations: Vec<InvariantViolation> =
            CHECKS.iter().flat_map(|(_, check)| check(&snapshot)).collect();

        let checks_run = CHECKS.len();
        let checks_failed = violations
            .iter()
            .map(|v| &v.invariant)
            .collect::<HashSet<_>>()
            .len();

        for violation in &violations {
            tracing::warn!(
                invariant = %violation.invariant,
                severity = %violation.severity,
                description = %violation.description,
                "Billing invariant violated"
            );
        }

        Ok(InvariantCheckSummary {
            checked_at: snapshot.now,
            checks_run,
            checks_passed: checks_run - checks_failed,
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        })
    }

    /// Run a single invariant check by name
    pub async fn run_check(&self, name: &str) -> BillingResult<Vec<InvariantViolation>> {
        let Some((_, check)) = CHECKS.iter().find(|(n, _)| *n == name) else {
            return Ok(vec![]);
        };
        let snapshot = self.snapshot(OffsetDateTime::now_utc()).await?;
        Ok(check(&snapshot))
    }

    pub fn available_checks() -> Vec<&'static str> {
        CHECKS.iter().map(|(name, _)| *name).collect()
    }

    async fn snapshot(&self, now: OffsetDateTime) -> BillingResult<Snapshot> {
        Ok(Snapshot {
            now,
            payments: self.store.list_payments().await?,
            subscriptions: self.store.list_subscriptions().await?,
        })
    }
}

fn payment_violation(
    invariant: &str,
    payment: &PaymentRecord,
    description: String,
    severity: ViolationSeverity,
) -> InvariantViolation {
    InvariantViolation {
        invariant: invariant.to_string(),
        customer_ids: vec![payment.customer_id],
        description,
        context: serde_json::json!({
            "order_id": payment.order_id,
            "status": payment.status,
            "amount": payment.amount,
            "charge_key": payment.charge_key,
        }),
        severity,
    }
}

fn subscription_violation(
    invariant: &str,
    subscription: &SubscriptionRecord,
    description: String,
) -> InvariantViolation {
    InvariantViolation {
        invariant: invariant.to_string(),
        customer_ids: vec![subscription.customer_id],
        description,
        context: serde_json::json!({
            "subscription_id": subscription.id,
            "tier": subscription.tier,
            "is_active": subscription.is_active,
            "has_credential": subscription.billing_credential.is_some(),
            "next_billing_date": subscription.next_billing_date.map(|d| d.to_string()),
        }),
        severity: ViolationSeverity::High,
    }
}

/// Approved rows carry the gateway's charge key and approval time
fn check_settled_has_approval(snapshot: &Snapshot) -> Vec<InvariantViolation> {
    snapshot
        .payments
        .iter()
        .filter(|p| p.status.was_approved() && (p.charge_key.is_none() || p.approved_at.is_none()))
        .map(|p| {
            payment_violation(
                "settled_has_approval",
                p,
                format!("Order {} is {} without charge key or approval time", p.order_id, p.status),
                ViolationSeverity::Critical,
            )
        })
        .collect()
}

/// Unapproved rows must not look captured
fn check_unsettled_has_no_charge_key(snapshot: &Snapshot) -> Vec<InvariantViolation> {
    snapshot
        .payments
        .iter()
        .filter(|p| !p.status.was_approved() && (p.charge_key.is_some() || p.approved_at.is_some()))
        .map(|p| {
            payment_violation(
                "unsettled_has_no_charge_key",
                p,
                format!("Order {} is {} but carries approval data", p.order_id, p.status),
                ViolationSeverity::High,
            )
        })
        .collect()
}

fn check_charge_key_unique(snapshot: &Snapshot) -> Vec<InvariantViolation> {
    let mut by_key: HashMap<&str, Vec<&PaymentRecord>> = HashMap::new();
    for payment in &snapshot.payments {
        if let Some(key) = payment.charge_key.as_deref() {
            by_key.entry(key).or_default().push(payment);
        }
    }

    by_key
        .into_iter()
        .filter(|(_, rows)| rows.len() > 1)
        .map(|(key, rows)| InvariantViolation {
            invariant: "charge_key_unique".to_string(),
            customer_ids: rows.iter().map(|p| p.customer_id).collect(),
            description: format!("Charge key {} is recorded on {} orders", key, rows.len()),
            context: serde_json::json!({
                "charge_key": key,
                "order_ids": rows.iter().map(|p| p.order_id.as_str()).collect::<Vec<_>>(),
            }),
            severity: ViolationSeverity::Critical,
        })
        .collect()
}

fn check_refund_within_amount(snapshot: &Snapshot) -> Vec<InvariantViolation> {
    snapshot
        .payments
        .iter()
        .filter(|p| p.canceled_amount < 0 || p.canceled_amount > p.amount)
        .map(|p| {
            payment_violation(
                "refund_within_amount",
                p,
                format!(
                    "Order {} refunded {} of a {} charge",
                    p.order_id, p.canceled_amount, p.amount
                ),
                ViolationSeverity::Critical,
            )
        })
        .collect()
}

/// Active premium without a credential or due date would never renew
fn check_active_premium_has_mandate(snapshot: &Snapshot) -> Vec<InvariantViolation> {
    snapshot
        .subscriptions
        .iter()
        .filter(|s| s.is_active && s.tier == SubscriptionTier::Premium)
        .filter(|s| s.billing_credential.is_none() || s.next_billing_date.is_none())
        .map(|s| {
            subscription_violation(
                "active_premium_has_mandate",
                s,
                "Active premium subscription is missing its credential or next billing date".into(),
            )
        })
        .collect()
}

/// A canceled subscription must not be chargeable
fn check_inactive_has_no_credential(snapshot: &Snapshot) -> Vec<InvariantViolation> {
    snapshot
        .subscriptions
        .iter()
        .filter(|s| !s.is_active && s.billing_credential.is_some())
        .map(|s| {
            subscription_violation(
                "inactive_has_no_credential",
                s,
                "Inactive subscription still holds a billing credential".into(),
            )
        })
        .collect()
}

fn check_no_stale_pending(snapshot: &Snapshot) -> Vec<InvariantViolation> {
    snapshot
        .payments
        .iter()
        .filter(|p| p.status.is_pending() && snapshot.now - p.updated_at > STALE_PENDING_AFTER)
        .map(|p| {
            payment_violation(
                "no_stale_pending",
                p,
                format!(
                    "Order {} stuck in {} since {}",
                    p.order_id, p.status, p.updated_at
                ),
                ViolationSeverity::Medium,
            )
        })
        .collect()
}
