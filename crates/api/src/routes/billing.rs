//! Customer billing routes

use axum::{
    extract::{Extension, Path, State},
    Json,
};
use recurbill_billing::{CredentialSummary, OneOffCharge, PaymentSummary, SubscriptionSummary};
use serde::Deserialize;

use crate::{
    auth::AuthUser,
    error::{ApiError, ApiResult},
    state::AppState,
};

#[derive(Debug, Deserialize)]
pub struct IssueCredentialRequest {
    pub auth_key: String,
}

#[derive(Debug, Deserialize)]
pub struct ConfirmPaymentRequest {
    pub payment_key: String,
    pub order_id: String,
    pub order_label: String,
    pub amount: i64,
}

/// Exchange the checkout widget's auth key for a recurring credential
pub async fn issue_credential(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Json(req): Json<IssueCredentialRequest>,
) -> ApiResult<Json<CredentialSummary>> {
    let summary = state
        .billing
        .orchestrator
        .issue_billing_credential(user.customer_id, &req.auth_key)
        .await?;
    Ok(Json(summary))
}

pub async fn confirm_payment(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Json(req): Json<ConfirmPaymentRequest>,
) -> ApiResult<Json<PaymentSummary>> {
    let payment = state
        .billing
        .orchestrator
        .confirm_one_off_charge(OneOffCharge {
            customer_id: user.customer_id,
            order_id: req.order_id,
            order_label: req.order_label,
            amount: req.amount,
            payment_key: req.payment_key,
        })
        .await?;
    Ok(Json(payment))
}

pub async fn get_payment_by_order(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(order_id): Path<String>,
) -> ApiResult<Json<PaymentSummary>> {
    let payment = state
        .billing
        .orchestrator
        .get_payment_by_order_id(&order_id)
        .await?;
    visible_to(user, payment, &order_id).map(Json)
}

pub async fn get_payment_by_charge_key(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(charge_key): Path<String>,
) -> ApiResult<Json<PaymentSummary>> {
    let payment = state
        .billing
        .orchestrator
        .get_payment_by_charge_key(&charge_key)
        .await?;
    visible_to(user, payment, &charge_key).map(Json)
}

pub async fn get_subscription(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> ApiResult<Json<SubscriptionSummary>> {
    let summary = state
        .billing
        .orchestrator
        .get_subscription(user.customer_id)
        .await?;
    Ok(Json(summary))
}

/// Cancel the caller's own subscription
pub async fn cancel_subscription(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> ApiResult<Json<SubscriptionSummary>> {
    let current = state
        .billing
        .orchestrator
        .get_subscription(user.customer_id)
        .await?;
    let summary = state
        .billing
        .orchestrator
        .cancel_subscription(&current.customer_key)
        .await?;
    Ok(Json(summary))
}

// Another customer's payment looks exactly like a missing one
fn visible_to(user: AuthUser, payment: PaymentSummary, lookup: &str) -> ApiResult<PaymentSummary> {
    if payment.customer_id == user.customer_id || user.is_admin() {
        Ok(payment)
    } else {
        Err(ApiError::NotFound(format!("Not found: payment {}", lookup)))
    }
}
