//! Recurbill Background Worker
//!
//! Handles scheduled jobs including:
//! - Recurring charge run (daily, wall-clock time in the billing zone)
//! - Billing invariant checks (after every recurring run)
//! - Heartbeat (every 5 minutes)
//!
//! Billing events are consumed here and handed to the notification
//! collaborator; delivery failures never reach the billing core.

use std::sync::Arc;

use anyhow::Context;
use chrono::FixedOffset;
use recurbill_billing::{
    BillingConfig, BillingEvent, BillingService, ChannelEventSink, InvariantCheckSummary,
    RecurringRunSummary,
};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

/// Log results of a recurring charge run
fn log_run_summary(summary: &RecurringRunSummary) {
    if summary.errors > 0 {
        error!(
            errors = summary.errors,
            "Recurring run finished with storage errors, affected subscriptions need reconciliation"
        );
    }
    if summary.declined > 0 {
        warn!(
            declined = summary.declined,
            "Declined subscriptions are suspended until rescheduled"
        );
    }
    info!(
        due = summary.due,
        charged = summary.charged,
        declined = summary.declined,
        skipped = summary.skipped,
        errors = summary.errors,
        "Recurring charge cycle complete"
    );
}

fn log_invariants(summary: &InvariantCheckSummary) {
    if summary.healthy {
        info!(checks_run = summary.checks_run, "Billing invariants healthy");
    } else {
        error!(
            checks_failed = summary.checks_failed,
            violations = summary.violations.len(),
            "Billing invariants violated"
        );
    }
}

/// Hand each billing fact to the notification collaborator
async fn consume_events(mut events: UnboundedReceiver<BillingEvent>) {
    while let Some(event) = events.recv().await {
        info!(
            event = event.name(),
            customer_id = %event.customer_id(),
            payload = ?event,
            "Notification queued for delivery"
        );
    }
    warn!("Billing event channel closed");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    init_tracing();

    info!("Starting Recurbill Worker v{}", env!("CARGO_PKG_VERSION"));

    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
    let config = BillingConfig::from_env()?;
    let pool = recurbill_shared::create_pool(&database_url, config.db_max_connections).await?;

    let (sink, events) = ChannelEventSink::new();
    tokio::spawn(consume_events(events));

    let billing = Arc::new(BillingService::from_config(pool, &config, Arc::new(sink))?);

    let timezone = FixedOffset::east_opt(i32::from(config.utc_offset_hours) * 3600)
        .context("BILLING_UTC_OFFSET_HOURS out of range")?;

    let mut scheduler = JobScheduler::new().await?;

    // Job 1: Recurring charges, once per day in the billing zone
    let run_billing = billing.clone();
    scheduler
        .add(Job::new_async_tz(
            config.billing_cron.as_str(),
            timezone,
            move |_uuid, _l| {
                let billing = run_billing.clone();
                Box::pin(async move {
                    info!("Running scheduled recurring charge run");
                    match billing.scheduler.run_today().await {
                        Ok(summary) => log_run_summary(&summary),
                        Err(e) => error!(error = %e, "Recurring charge run could not start"),
                    }

                    match billing.invariants.run_all_checks().await {
                        Ok(summary) => log_invariants(&summary),
                        Err(e) => error!(error = %e, "Invariant check failed to run"),
                    }
                })
            },
        )?)
        .await?;
    info!(cron = %config.billing_cron, utc_offset_hours = config.utc_offset_hours, "Scheduled: Recurring charge run");

    // Job 2: Heartbeat (every 5 minutes)
    scheduler
        .add(Job::new_async("0 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat - all systems operational");
            })
        })?)
        .await?;
    info!("Scheduled: Heartbeat (every 5 minutes)");

    info!("Starting job scheduler");
    scheduler.start().await?;

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested, finishing in-flight charges");

    // Subscriptions not yet started keep their due date and are caught up
    // by the first run after restart
    billing.scheduler.request_stop();
    scheduler.shutdown().await?;

    info!("Worker stopped");
    Ok(())
}
