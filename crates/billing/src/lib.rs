// Billing crate clippy configuration
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Recurbill Billing Module
//!
//! Recurring billing and payment reconciliation against an external
//! payment gateway.
//!
//! ## Features
//!
//! - **Billing credentials**: Exchange a checkout authorization for a reusable mandate
//! - **One-off charges**: Idempotent confirmation keyed by client order id
//! - **Recurring charges**: Daily scheduler charging every due subscription
//! - **Payment ledger**: Forward-only state machine, one row per attempt
//! - **Refunds**: Partial and full refund recording
//! - **Entitlements**: Premium gating on subscription validity
//! - **Invariants**: Runnable ledger and subscription consistency checks
//! - **Events**: Notification-worthy facts for out-of-band delivery

pub mod config;
pub mod entitlement;
pub mod error;
pub mod events;
pub mod gateway;
pub mod invariants;
pub mod ledger;
pub mod orchestrator;
pub mod plan;
pub mod refund;
pub mod scheduler;
pub mod store;
pub mod subscription;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;


// Config
pub use config::BillingConfig;

// Entitlement
pub use entitlement::EntitlementService;

// Error
pub use error::{BillingError, BillingResult};

// Events
pub use events::{BillingEvent, ChannelEventSink, EventSink, TracingEventSink};

// Gateway
pub use gateway::{
    ChargeReceipt, ChargeRequest, ChargeSource, GatewayClient, GatewayError, GatewayPolicy,
    HttpGateway, IssuedCredential, PaymentGateway,
};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Ledger
pub use ledger::{ChargeKind, PaymentRecord, PaymentStats, PaymentStatus, PaymentSummary};

// Orchestrator
pub use orchestrator::{BillingOrchestrator, OneOffCharge, RecurringChargeResult};

// Plans
pub use plan::PlanCatalog;

// Refund
pub use refund::{RefundResult, RefundService};

// Scheduler
pub use scheduler::{RecurringChargeScheduler, RecurringRunSummary};

// Storage
pub use store::{BillingStore, MemoryStore, PgStore, SubscriptionLock};

// Subscriptions
pub use subscription::{CredentialSummary, SubscriptionRecord, SubscriptionSummary};

use std::sync::Arc;

use sqlx::PgPool;

/// Main billing service that combines all billing functionality
pub struct BillingService {
    pub orchestrator: Arc<BillingOrchestrator>,
    pub scheduler: Arc<RecurringChargeScheduler>,
    pub refunds: RefundService,
    pub entitlements: EntitlementService,
    pub invariants: InvariantChecker,
}

impl BillingService {
    /// Postgres store and HTTP gateway built from `config`
    pub fn from_config(
        pool: PgPool,
        config: &BillingConfig,
        events: Arc<dyn EventSink>,
    ) -> BillingResult<Self> {
        let gateway = HttpGateway::new(&config.gateway_base_url, &config.gateway_secret_key)
            .map_err(|e| BillingError::Config(format!("gateway client: {}", e)))?;
        Self::new(Arc::new(PgStore::new(pool)), Arc::new(gateway), config, events)
    }

    /// Wire the billing core over any store and gateway
    pub fn new(
        store: Arc<dyn BillingStore>,
        gateway: Arc<dyn PaymentGateway>,
        config: &BillingConfig,
        events: Arc<dyn EventSink>,
    ) -> BillingResult<Self> {
        let orchestrator = Arc::new(BillingOrchestrator::new(
            store.clone(),
            GatewayClient::new(gateway, config.gateway_policy),
            config.catalog,
            config.utc_offset()?,
            events.clone(),
        ));
        let scheduler = Arc::new(RecurringChargeScheduler::new(
            orchestrator.clone(),
            config.scheduler_concurrency,
        ));

        Ok(Self {
            orchestrator,
            scheduler,
            refunds: RefundService::new(store.clone(), events),
            entitlements: EntitlementService::new(store.clone(), config.catalog),
            invariants: InvariantChecker::new(store),
        })
    }
}
