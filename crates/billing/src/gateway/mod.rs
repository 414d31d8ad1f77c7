//! Payment gateway boundary
//!
//! The external processor exposes two operations: exchange a checkout
//! authorization for a reusable billing credential, and confirm a charge.
//! Both are network calls whose failure may be ambiguous; a timeout does
//! not prove the charge did not happen.

pub mod client;
pub mod http;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

pub use client::{GatewayClient, GatewayPolicy};
pub use http::HttpGateway;

/// What the gateway is asked to charge against
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChargeSource {
    /// One-off checkout: the payment key produced by the client-side widget
    PaymentKey(String),
    /// Recurring: the stored credential plus the customer key it was issued to
    Credential {
        credential: String,
        customer_key: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChargeRequest {
    pub source: ChargeSource,
    pub order_id: String,
    pub order_label: String,
    pub amount: i64,
}

/// Gateway confirmation of a captured charge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChargeReceipt {
    pub charge_key: String,
    pub order_id: String,
    pub amount: i64,
    pub method: Option<String>,
    pub approved_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuedCredential {
    pub credential: String,
    pub customer_key: String,
    pub method: Option<String>,
    pub card_last4: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GatewayError {
    /// Definite answer: the gateway declined. Never retried.
    #[error("rejected ({code}): {message}")]
    Rejected {
        status: u16,
        code: String,
        message: String,
    },

    /// Network failure, 5xx or timeout. The charge may or may not exist.
    #[error("transient gateway failure: {0}")]
    Transient(String),

    /// The gateway answered but the body could not be understood
    #[error("invalid gateway response: {0}")]
    InvalidResponse(String),
}

impl GatewayError {
    pub fn rejected(code: impl Into<String>, message: impl Into<String>) -> Self {
        GatewayError::Rejected {
            status: 400,
            code: code.into(),
            message: message.into(),
        }
    }

    /// Only transient failures qualify for the single bounded retry
    pub fn is_transient(&self) -> bool {
        matches!(self, GatewayError::Transient(_))
    }

    /// The outcome of the call is unknown and needs reconciliation
    pub fn is_indeterminate(&self) -> bool {
        !matches!(self, GatewayError::Rejected { .. })
    }
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn issue_credential(
        &self,
        customer_key: &str,
        auth_key: &str,
    ) -> Result<IssuedCredential, GatewayError>;

    /// Must be safe to repeat under the same `order_id`
    async fn confirm_charge(&self, request: &ChargeRequest) -> Result<ChargeReceipt, GatewayError>;
}
