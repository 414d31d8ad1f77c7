//! Billing error types

use thiserror::Error;

use crate::gateway::GatewayError;
use crate::ledger::PaymentStatus;

pub type BillingResult<T> = Result<T, BillingError>;

#[derive(Debug, Error)]
pub enum BillingError {
    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Amount {actual} does not match the recorded amount {expected} for this order")]
    AmountMismatch { expected: i64, actual: i64 },

    #[error("Amount {actual} does not match the plan price {expected}")]
    AmountTampered { expected: i64, actual: i64 },

    #[error("Order conflict: {0}")]
    OrderConflict(String),

    #[error("Payment for order {0} is still being processed")]
    PaymentInProgress(String),

    #[error("Customer already holds an active premium billing credential")]
    AlreadySubscribed,

    #[error("Gateway rejected the request ({code}): {message}")]
    GatewayRejected { code: String, message: String },

    #[error("Gateway outcome unknown: {0}")]
    GatewayUnavailable(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("An active premium subscription is required")]
    PremiumRequired,

    #[error("Illegal payment transition from {from} to {to}")]
    InvalidTransition {
        from: PaymentStatus,
        to: PaymentStatus,
    },

    #[error("Database error: {0}")]
    Database(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl BillingError {
    /// Conflicts leave the ledger untouched beyond the existing record
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            BillingError::AmountMismatch { .. }
                | BillingError::OrderConflict(_)
                | BillingError::PaymentInProgress(_)
                | BillingError::AlreadySubscribed
                | BillingError::InvalidTransition { .. }
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, BillingError::NotFound(_))
    }

    pub fn is_gateway(&self) -> bool {
        matches!(
            self,
            BillingError::GatewayRejected { .. } | BillingError::GatewayUnavailable(_)
        )
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(e: sqlx::Error) -> Self {
        BillingError::Database(e.to_string())
    }
}

impl From<GatewayError> for BillingError {
    fn from(e: GatewayError) -> Self {
        match e {
            GatewayError::Rejected { code, message, .. } => {
                BillingError::GatewayRejected { code, message }
            }
            other => BillingError::GatewayUnavailable(other.to_string()),
        }
    }
}
