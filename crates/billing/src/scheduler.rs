//! Recurring charge scheduler
//!
//! Driven once per day by the worker's cron trigger. Each due subscription
//! is charged independently: one failure never stops the others.
//!
//! The due set is everything whose due date is on or before the run date,
//! so a cycle missed by a skipped or interrupted run is charged by the next
//! one. A stop request is permanent for the scheduler instance: nothing new
//! starts after it, and whatever was not started stays due.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use time::Date;
use uuid::Uuid;

use crate::error::BillingResult;
use crate::orchestrator::{BillingOrchestrator, RecurringChargeResult};

/// Tally of one scheduler pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecurringRunSummary {
    /// Size of the due set when the run started
    pub due: usize,
    pub charged: usize,
    pub declined: usize,
    /// Ineligible under the lock, or never started because of a stop request
    pub skipped: usize,
    /// Storage failures; the gateway may or may not have been reached
    pub errors: usize,
}

pub struct RecurringChargeScheduler {
    orchestrator: Arc<BillingOrchestrator>,
    concurrency: usize,
    stop: Arc<AtomicBool>,
}

impl RecurringChargeScheduler {
    pub fn new(orchestrator: Arc<BillingOrchestrator>, concurrency: usize) -> Self {
        Self {
            orchestrator,
            concurrency: concurrency.max(1),
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Calendar date in the billing zone
    pub fn today(&self) -> Date {
        self.orchestrator.today()
    }

    /// Stop starting new subscriptions, in this run and any later one
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    pub async fn run_today(&self) -> BillingResult<RecurringRunSummary> {
        self.run_for_date(self.today()).await
    }

    /// Charge every subscription due on or before `today`
    pub async fn run_for_date(&self, today: Date) -> BillingResult<RecurringRunSummary> {
        if self.stop_requested() {
            tracing::warn!(date = %today, "Stop requested, recurring charge run not started");
            return Ok(RecurringRunSummary::default());
        }

        let due = self.orchestrator.store().list_due_subscriptions(today).await?;
        let mut summary = RecurringRunSummary {
            due: due.len(),
            ..Default::default()
        };

        tracing::info!(date = %today, due = summary.due, "Starting recurring charge run");

        let stop = self.stop.clone();
        let orchestrator = self.orchestrator.clone();
        let outcomes: Vec<(Uuid, BillingResult<RecurringChargeResult>)> = stream::iter(due)
            .take_while(|_| futures::future::ready(!stop.load(Ordering::SeqCst)))
            .map(|subscription| {
                let orchestrator = orchestrator.clone();
                async move {
                    let outcome = orchestrator
                        .confirm_recurring_charge(subscription.id, today)
                        .await;
                    (subscription.id, outcome)
                }
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let started = outcomes.len();
        for (subscription_id, outcome) in outcomes {
            match outcome {
                Ok(RecurringChargeResult::Charged(_)) => summary.charged += 1,
                Ok(RecurringChargeResult::Declined(payment)) => {
                    summary.declined += 1;
                    tracing::warn!(
                        subscription_id = %subscription_id,
                        order_id = %payment.order_id,
                        reason = payment.failure_reason.as_deref().unwrap_or("unknown"),
                        "Recurring charge declined, billing suspended until rescheduled"
                    );
                }
                Ok(RecurringChargeResult::Skipped) => summary.skipped += 1,
                Err(e) => {
                    summary.errors += 1;
                    tracing::error!(
                        subscription_id = %subscription_id,
                        error = %e,
                        "Recurring charge attempt failed"
                    );
                }
            }
        }

        let not_started = summary.due - started;
        if not_started > 0 {
            tracing::warn!(not_started, "Run stopped early, remaining subscriptions stay due");
            summary.skipped += not_started;
        }

        tracing::info!(
            date = %today,
            due = summary.due,
            charged = summary.charged,
            declined = summary.declined,
            skipped = summary.skipped,
            errors = summary.errors,
            "Recurring charge run finished"
        );

        Ok(summary)
    }
}
