//! HTTP routes

pub mod admin;
pub mod billing;

use axum::{
    middleware,
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};

use crate::auth::{require_admin, require_auth};
use crate::state::AppState;

pub fn create_router(state: AppState) -> Router {
    let customer_routes = Router::new()
        .route("/credential", post(billing::issue_credential))
        .route("/payments/confirm", post(billing::confirm_payment))
        .route("/payments/order/{order_id}", get(billing::get_payment_by_order))
        .route("/payments/charge/{charge_key}", get(billing::get_payment_by_charge_key))
        .route("/subscription", get(billing::get_subscription))
        .route("/subscription/cancel", post(billing::cancel_subscription))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));

    // Layers run outermost-last: authenticate, then check the role
    let admin_routes = Router::new()
        .route("/payments", get(admin::list_payments))
        .route("/payments/stats", get(admin::payment_stats))
        .route("/payments/{order_id}/refund", post(admin::refund_payment))
        .route("/subscriptions/{customer_key}/cancel", post(admin::cancel_subscription))
        .route("/subscriptions/{customer_key}/reschedule", post(admin::reschedule_billing))
        .route("/invariants", get(admin::run_invariants))
        .route_layer(middleware::from_fn(require_admin))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));

    Router::new()
        .route("/health", get(health))
        .nest("/v1/billing", customer_routes)
        .nest("/v1/admin", admin_routes)
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
