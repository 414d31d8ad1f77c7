// Router tests for the billing HTTP surface
//
// Exercise the full Axum router with tower::ServiceExt::oneshot over an
// in-memory store and a scripted gateway; no database or network.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use time::Duration;
use tower::ServiceExt;
use uuid::Uuid;

use recurbill_api::{create_router, AppState, JwtManager, Role};
use recurbill_billing::testing::ScriptedGateway;
use recurbill_billing::{BillingConfig, BillingService, GatewayError, MemoryStore, TracingEventSink};

const JWT_SECRET: &str = "router-test-secret";

struct TestApp {
    router: Router,
    gateway: Arc<ScriptedGateway>,
    jwt: JwtManager,
}

impl TestApp {
    fn new() -> Self {
        let settings: HashMap<&str, &str> = [
            ("GATEWAY_BASE_URL", "https://gateway.test"),
            ("GATEWAY_SECRET_KEY", "sk_test"),
            ("GATEWAY_RETRY_DELAY_MS", "1"),
        ]
        .into_iter()
        .collect();
        let config = BillingConfig::from_lookup(|key| settings.get(key).map(|v| v.to_string())).unwrap();

        let gateway = Arc::new(ScriptedGateway::approving());
        let billing = BillingService::new(
            Arc::new(MemoryStore::new()),
            gateway.clone(),
            &config,
            Arc::new(TracingEventSink),
        )
        .unwrap();

        let jwt = JwtManager::new(JWT_SECRET);
        let router = create_router(AppState::new(Arc::new(billing), jwt.clone()));
        Self { router, gateway, jwt }
    }

    fn token(&self, customer_id: Uuid, role: Role) -> String {
        self.jwt.issue(customer_id, role, Duration::hours(1)).unwrap()
    }

    async fn call(&self, method: &str, uri: &str, token: Option<&str>, body: Option<Value>) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }
        let request = match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }
}

fn confirm_body(order_id: &str, amount: i64) -> Value {
    json!({
        "payment_key": format!("pk_{}", order_id),
        "order_id": order_id,
        "order_label": "Premium monthly",
        "amount": amount,
    })
}

#[tokio::test]
async fn test_health_needs_no_auth() {
    let app = TestApp::new();
    let (status, body) = app.call("GET", "/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn test_missing_token_is_unauthorized() {
    let app = TestApp::new();
    let (status, body) = app.call("GET", "/v1/billing/subscription", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "UNAUTHORIZED");
}

#[tokio::test]
async fn test_foreign_token_is_unauthorized() {
    let app = TestApp::new();
    let token = JwtManager::new("someone-else")
        .issue(Uuid::new_v4(), Role::Admin, Duration::hours(1))
        .unwrap();
    let (status, _) = app.call("GET", "/v1/admin/payments", Some(&token), None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_customer_cannot_reach_admin_routes() {
    let app = TestApp::new();
    let token = app.token(Uuid::new_v4(), Role::Customer);
    let (status, body) = app.call("GET", "/v1/admin/payments/stats", Some(&token), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"], "FORBIDDEN");
}

#[tokio::test]
async fn test_confirm_replay_and_amount_conflict() {
    let app = TestApp::new();
    let token = app.token(Uuid::new_v4(), Role::Customer);

    let (status, first) = app
        .call("POST", "/v1/billing/payments/confirm", Some(&token), Some(confirm_body("X", 9900)))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(first["status"], "DONE");
    assert_eq!(first["amount"], 9900);

    let (status, replay) = app
        .call("POST", "/v1/billing/payments/confirm", Some(&token), Some(confirm_body("X", 9900)))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(replay, first);
    assert_eq!(app.gateway.confirm_calls().await.len(), 1);

    let (status, body) = app
        .call("POST", "/v1/billing/payments/confirm", Some(&token), Some(confirm_body("X", 5000)))
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "AMOUNT_MISMATCH");
}

#[tokio::test]
async fn test_tampered_amount_is_bad_request() {
    let app = TestApp::new();
    let token = app.token(Uuid::new_v4(), Role::Customer);

    let (status, body) = app
        .call("POST", "/v1/billing/payments/confirm", Some(&token), Some(confirm_body("cheap", 100)))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "AMOUNT_TAMPERED");
    assert!(app.gateway.confirm_calls().await.is_empty());
}

#[tokio::test]
async fn test_gateway_decline_surfaces_gateway_code() {
    let app = TestApp::new();
    let token = app.token(Uuid::new_v4(), Role::Customer);
    app.gateway
        .fail_next_confirm(GatewayError::rejected("REJECT_CARD_COMPANY", "card declined"))
        .await;

    let (status, body) = app
        .call("POST", "/v1/billing/payments/confirm", Some(&token), Some(confirm_body("D-1", 9900)))
        .await;
    assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
    assert_eq!(body["error"], "REJECT_CARD_COMPANY");

    let (status, payment) = app
        .call("GET", "/v1/billing/payments/order/D-1", Some(&token), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(payment["status"], "FAILED");
}

#[tokio::test]
async fn test_other_customers_payment_is_not_found() {
    let app = TestApp::new();
    let owner = app.token(Uuid::new_v4(), Role::Customer);
    let stranger = app.token(Uuid::new_v4(), Role::Customer);

    let (_, payment) = app
        .call("POST", "/v1/billing/payments/confirm", Some(&owner), Some(confirm_body("mine", 9900)))
        .await;
    let charge_key = payment["charge_key"].as_str().unwrap().to_string();

    let (status, _) = app
        .call("GET", "/v1/billing/payments/order/mine", Some(&stranger), None)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, by_key) = app
        .call("GET", &format!("/v1/billing/payments/charge/{}", charge_key), Some(&owner), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(by_key["order_id"], "mine");

    let (status, body) = app
        .call("GET", "/v1/billing/payments/order/unknown", Some(&owner), None)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "NOT_FOUND");
}

#[tokio::test]
async fn test_issue_credential_then_cancel() {
    let app = TestApp::new();
    let token = app.token(Uuid::new_v4(), Role::Customer);

    let (status, issued) = app
        .call("POST", "/v1/billing/credential", Some(&token), Some(json!({ "auth_key": "auth_1" })))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(issued["subscription"]["tier"], "premium");
    assert_eq!(issued["subscription"]["is_valid"], true);
    assert!(issued.get("billing_credential").is_none());

    let (status, subscription) = app.call("GET", "/v1/billing/subscription", Some(&token), None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(subscription["next_billing_date"].is_string());

    let (status, canceled) = app
        .call("POST", "/v1/billing/subscription/cancel", Some(&token), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(canceled["is_active"], false);
    assert_eq!(canceled["has_credential"], false);
    assert_eq!(canceled["tier"], "base");

    // Cancel is idempotent
    let (status, again) = app
        .call("POST", "/v1/billing/subscription/cancel", Some(&token), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(again, canceled);
}

#[tokio::test]
async fn test_first_subscription_read_returns_base_terms() {
    let app = TestApp::new();
    let token = app.token(Uuid::new_v4(), Role::Customer);
    let (status, body) = app.call("GET", "/v1/billing/subscription", Some(&token), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["tier"], "base");
    assert_eq!(body["is_active"], false);
    assert_eq!(body["billing_suspended"], false);

    // Same customer key on every later read
    let (_, again) = app.call("GET", "/v1/billing/subscription", Some(&token), None).await;
    assert_eq!(again["customer_key"], body["customer_key"]);
}

#[tokio::test]
async fn test_admin_ledger_views() {
    let app = TestApp::new();
    let customer = app.token(Uuid::new_v4(), Role::Customer);
    let admin = app.token(Uuid::new_v4(), Role::Admin);

    app.call("POST", "/v1/billing/payments/confirm", Some(&customer), Some(confirm_body("A-1", 9900)))
        .await;
    app.gateway
        .fail_next_confirm(GatewayError::rejected("INVALID_CARD", "bad card"))
        .await;
    app.call("POST", "/v1/billing/payments/confirm", Some(&customer), Some(confirm_body("A-2", 9900)))
        .await;

    let (status, list) = app.call("GET", "/v1/admin/payments", Some(&admin), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(list["total"], 2);
    assert_eq!(list["payments"][0]["order_id"], "A-1");

    let (status, stats) = app.call("GET", "/v1/admin/payments/stats", Some(&admin), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stats["total_count"], 2);
    assert_eq!(stats["success_count"], 1);
    assert_eq!(stats["total_revenue"], 9900);

    // Admins may read any customer's payment
    let (status, _) = app.call("GET", "/v1/billing/payments/order/A-1", Some(&admin), None).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_admin_refund() {
    let app = TestApp::new();
    let customer = app.token(Uuid::new_v4(), Role::Customer);
    let admin = app.token(Uuid::new_v4(), Role::Admin);

    app.call("POST", "/v1/billing/payments/confirm", Some(&customer), Some(confirm_body("R-1", 9900)))
        .await;

    let (status, refund) = app
        .call(
            "POST",
            "/v1/admin/payments/R-1/refund",
            Some(&admin),
            Some(json!({ "amount": 4000, "reason": "partial goodwill" })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(refund["remaining"], 5900);
    assert_eq!(refund["status"], "PARTIAL_CANCELED");

    let (status, body) = app
        .call(
            "POST",
            "/v1/admin/payments/R-1/refund",
            Some(&admin),
            Some(json!({ "amount": 10000, "reason": "too much" })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "VALIDATION_ERROR");
}

#[tokio::test]
async fn test_admin_cancel_and_reschedule() {
    let app = TestApp::new();
    let customer = app.token(Uuid::new_v4(), Role::Customer);
    let admin = app.token(Uuid::new_v4(), Role::Admin);

    let (_, issued) = app
        .call("POST", "/v1/billing/credential", Some(&customer), Some(json!({ "auth_key": "auth_2" })))
        .await;
    let customer_key = issued["customer_key"].as_str().unwrap().to_string();

    let (status, body) = app
        .call(
            "POST",
            &format!("/v1/admin/subscriptions/{}/reschedule", customer_key),
            Some(&admin),
            Some(json!({ "next_billing_date": "2000-01-01" })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "VALIDATION_ERROR");

    let (status, rescheduled) = app
        .call(
            "POST",
            &format!("/v1/admin/subscriptions/{}/reschedule", customer_key),
            Some(&admin),
            Some(json!({ "next_billing_date": "2099-01-15" })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(rescheduled["next_billing_date"], "2099-01-15");

    let (status, canceled) = app
        .call(
            "POST",
            &format!("/v1/admin/subscriptions/{}/cancel", customer_key),
            Some(&admin),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(canceled["is_active"], false);

    let (status, _) = app
        .call("POST", "/v1/admin/subscriptions/cust_missing/cancel", Some(&admin), None)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_admin_invariants_healthy_on_fresh_ledger() {
    let app = TestApp::new();
    let admin = app.token(Uuid::new_v4(), Role::Admin);

    let (status, summary) = app.call("GET", "/v1/admin/invariants", Some(&admin), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(summary["healthy"], true);
}
