//! Test doubles for the billing core
//!
//! Compiled for this crate's tests and, behind the `test-utils` feature,
//! for dependant crates that need a working orchestrator without a database
//! or a network.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use time::{Date, OffsetDateTime, UtcOffset};
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use crate::events::{BillingEvent, ChannelEventSink};
use crate::gateway::{
    ChargeReceipt, ChargeRequest, ChargeSource, GatewayClient, GatewayError, GatewayPolicy,
    IssuedCredential, PaymentGateway,
};
use crate::orchestrator::BillingOrchestrator;
use crate::plan::PlanCatalog;
use crate::store::{BillingStore, MemoryStore};
use crate::subscription::SubscriptionRecord;

#[derive(Default)]
struct Script {
    issue_failures: VecDeque<GatewayError>,
    confirm_failures: VecDeque<GatewayError>,
    declined_credentials: HashMap<String, GatewayError>,
    issued_credential: Option<String>,
    confirm_calls: Vec<ChargeRequest>,
    issue_calls: Vec<String>,
    receipts: HashMap<String, ChargeReceipt>,
}

/// In-process gateway that approves everything unless told otherwise.
///
/// Confirmations are idempotent per order id like the real gateway: a
/// repeated approved order returns the original receipt.
#[derive(Default)]
pub struct ScriptedGateway {
    script: Mutex<Script>,
}

impl ScriptedGateway {
    pub fn approving() -> Self {
        Self::default()
    }

    /// Fail the next credential issue with `error`
    pub async fn fail_next_issue(&self, error: GatewayError) {
        self.script.lock().await.issue_failures.push_back(error);
    }

    /// Fail the next charge confirmation with `error`
    pub async fn fail_next_confirm(&self, error: GatewayError) {
        self.script.lock().await.confirm_failures.push_back(error);
    }

    /// Decline every charge against `credential`
    pub async fn decline_credential(&self, credential: &str, error: GatewayError) {
        self.script
            .lock()
            .await
            .declined_credentials
            .insert(credential.to_string(), error);
    }

    /// Issue this credential instead of one derived from the customer key
    pub async fn issue_as(&self, credential: impl Into<String>) {
        self.script.lock().await.issued_credential = Some(credential.into());
    }

    pub async fn confirm_calls(&self) -> Vec<ChargeRequest> {
        self.script.lock().await.confirm_calls.clone()
    }

    pub async fn issue_calls(&self) -> Vec<String> {
        self.script.lock().await.issue_calls.clone()
    }
}

#[async_trait]
impl PaymentGateway for ScriptedGateway {
    async fn issue_credential(
        &self,
        customer_key: &str,
        _auth_key: &str,
    ) -> Result<IssuedCredential, GatewayError> {
        let mut script = self.script.lock().await;
        script.issue_calls.push(customer_key.to_string());
        if let Some(error) = script.issue_failures.pop_front() {
            return Err(error);
        }
        let credential = script
            .issued_credential
            .clone()
            .unwrap_or_else(|| format!("bk_{}", customer_key));
        Ok(IssuedCredential {
            credential,
            customer_key: customer_key.to_string(),
            method: Some("card".into()),
            card_last4: Some("4242".into()),
        })
    }

    async fn confirm_charge(&self, request: &ChargeRequest) -> Result<ChargeReceipt, GatewayError> {
        let mut script = self.script.lock().await;
        script.confirm_calls.push(request.clone());

        if let Some(receipt) = script.receipts.get(&request.order_id) {
            return Ok(receipt.clone());
        }
        if let Some(error) = script.confirm_failures.pop_front() {
            return Err(error);
        }
        if let ChargeSource::Credential { credential, .. } = &request.source {
            if let Some(error) = script.declined_credentials.get(credential) {
                return Err(error.clone());
            }
        }

        let receipt = ChargeReceipt {
            charge_key: format!("ck_{}", Uuid::new_v4().simple()),
            order_id: request.order_id.clone(),
            amount: request.amount,
            method: Some("card".into()),
            approved_at: Some(OffsetDateTime::now_utc()),
        };
        script
            .receipts
            .insert(request.order_id.clone(), receipt.clone());
        Ok(receipt)
    }
}

/// Boundary policy that keeps retry tests fast
pub fn fast_policy() -> GatewayPolicy {
    GatewayPolicy {
        timeout: Duration::from_millis(200),
        retry_delay: Duration::from_millis(1),
    }
}

/// A wired orchestrator over an in-memory store
pub struct Fixture {
    pub store: Arc<MemoryStore>,
    pub orchestrator: Arc<BillingOrchestrator>,
    pub events: mpsc::UnboundedReceiver<BillingEvent>,
}

pub fn fixture(gateway: Arc<dyn PaymentGateway>) -> Fixture {
    fixture_with_catalog(gateway, PlanCatalog::default())
}

pub fn fixture_with_catalog(gateway: Arc<dyn PaymentGateway>, catalog: PlanCatalog) -> Fixture {
    fixture_with(gateway, catalog, UtcOffset::UTC)
}

/// Orchestrator whose billing calendar runs at `zone`
pub fn fixture_in_zone(gateway: Arc<dyn PaymentGateway>, zone: UtcOffset) -> Fixture {
    fixture_with(gateway, PlanCatalog::default(), zone)
}

fn fixture_with(gateway: Arc<dyn PaymentGateway>, catalog: PlanCatalog, zone: UtcOffset) -> Fixture {
    let store = Arc::new(MemoryStore::new());
    let (sink, events) = ChannelEventSink::new();
    let orchestrator = BillingOrchestrator::new(
        store.clone(),
        GatewayClient::new(gateway, fast_policy()),
        catalog,
        zone,
        Arc::new(sink),
    );
    Fixture {
        store,
        orchestrator: Arc::new(orchestrator),
        events,
    }
}

/// Store a premium subscription with a mandate, due on `due`
pub async fn premium_subscription_due(store: &Arc<MemoryStore>, due: Date) -> SubscriptionRecord {
    let now = OffsetDateTime::now_utc();
    let catalog = PlanCatalog::default();
    let mut subscription = SubscriptionRecord::new_base(Uuid::new_v4(), &catalog, now);
    let credential = format!("bk_{}", subscription.customer_key);
    subscription.activate_premium(credential, &catalog, now, UtcOffset::UTC);
    subscription.next_billing_date = Some(due);

    // Fixtures are only ever inserted into a fresh in-memory store
    match store.insert_subscription_if_absent(&subscription).await {
        Ok(stored) => stored,
        Err(_) => subscription,
    }
}

/// Drain everything emitted so far
pub fn drain_events(events: &mut mpsc::UnboundedReceiver<BillingEvent>) -> Vec<BillingEvent> {
    let mut drained = Vec::new();
    while let Ok(event) = events.try_recv() {
        drained.push(event);
    }
    drained
}
