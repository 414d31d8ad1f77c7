//! Administrative billing routes
//!
//! Mounted behind `require_admin`.

use axum::{
    extract::{Extension, Path, State},
    Json,
};
use recurbill_billing::{
    InvariantCheckSummary, PaymentStats, PaymentSummary, RefundResult, SubscriptionSummary,
};
use serde::{Deserialize, Serialize};
use time::Date;

use crate::{auth::AuthUser, error::ApiResult, state::AppState};

#[derive(Debug, Serialize)]
pub struct PaymentListResponse {
    pub payments: Vec<PaymentSummary>,
    pub total: usize,
}

#[derive(Debug, Deserialize)]
pub struct RefundRequest {
    pub amount: i64,
    pub reason: String,
}

#[derive(Debug, Deserialize)]
pub struct RescheduleRequest {
    /// Calendar date in the billing zone, `YYYY-MM-DD`
    pub next_billing_date: Date,
}

/// Every ledger row, newest approval first
pub async fn list_payments(State(state): State<AppState>) -> ApiResult<Json<PaymentListResponse>> {
    let payments = state.billing.orchestrator.list_payments().await?;
    Ok(Json(PaymentListResponse {
        total: payments.len(),
        payments,
    }))
}

pub async fn payment_stats(State(state): State<AppState>) -> ApiResult<Json<PaymentStats>> {
    Ok(Json(state.billing.orchestrator.payment_stats().await?))
}

pub async fn refund_payment(
    State(state): State<AppState>,
    Extension(admin): Extension<AuthUser>,
    Path(order_id): Path<String>,
    Json(req): Json<RefundRequest>,
) -> ApiResult<Json<RefundResult>> {
    tracing::info!(admin_id = %admin.customer_id, order_id = %order_id, amount = req.amount, "Admin refund requested");
    let result = state
        .billing
        .refunds
        .record_refund(&order_id, req.amount, &req.reason)
        .await?;
    Ok(Json(result))
}

pub async fn cancel_subscription(
    State(state): State<AppState>,
    Extension(admin): Extension<AuthUser>,
    Path(customer_key): Path<String>,
) -> ApiResult<Json<SubscriptionSummary>> {
    tracing::info!(admin_id = %admin.customer_id, customer_key = %customer_key, "Admin cancellation requested");
    let summary = state
        .billing
        .orchestrator
        .cancel_subscription(&customer_key)
        .await?;
    Ok(Json(summary))
}

/// Put a declined subscription back into the due set
pub async fn reschedule_billing(
    State(state): State<AppState>,
    Extension(admin): Extension<AuthUser>,
    Path(customer_key): Path<String>,
    Json(req): Json<RescheduleRequest>,
) -> ApiResult<Json<SubscriptionSummary>> {
    tracing::info!(
        admin_id = %admin.customer_id,
        customer_key = %customer_key,
        next_billing_date = %req.next_billing_date,
        "Admin reschedule requested"
    );
    let today = state.billing.scheduler.today();
    let summary = state
        .billing
        .orchestrator
        .reschedule_billing(&customer_key, req.next_billing_date, today)
        .await?;
    Ok(Json(summary))
}

pub async fn run_invariants(State(state): State<AppState>) -> ApiResult<Json<InvariantCheckSummary>> {
    Ok(Json(state.billing.invariants.run_all_checks().await?))
}
