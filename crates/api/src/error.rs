//! API error type and its HTTP mapping

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use recurbill_billing::BillingError;
use serde_json::json;
use thiserror::Error;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    Unauthorized(String),

    #[error("Insufficient permissions")]
    Forbidden,

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error(transparent)]
    Billing(#[from] BillingError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ApiError {
    fn status_and_code(&self) -> (StatusCode, String) {
        let (status, code) = match self {
            ApiError::Unauthorized(_) => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED"),
            ApiError::Forbidden => (StatusCode::FORBIDDEN, "FORBIDDEN"),
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "BAD_REQUEST"),
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            ApiError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
            ApiError::Billing(e) => match e {
                BillingError::Validation(_) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR"),
                BillingError::AmountTampered { .. } => (StatusCode::BAD_REQUEST, "AMOUNT_TAMPERED"),
                BillingError::AmountMismatch { .. } => (StatusCode::CONFLICT, "AMOUNT_MISMATCH"),
                BillingError::OrderConflict(_) => (StatusCode::CONFLICT, "ORDER_CONFLICT"),
                BillingError::PaymentInProgress(_) => (StatusCode::CONFLICT, "PAYMENT_IN_PROGRESS"),
                BillingError::AlreadySubscribed => (StatusCode::CONFLICT, "ALREADY_SUBSCRIBED"),
                BillingError::InvalidTransition { .. } => {
                    (StatusCode::CONFLICT, "INVALID_TRANSITION")
                }
                // The gateway's own code tells the client why the card was refused
                BillingError::GatewayRejected { code, .. } => {
                    return (StatusCode::PAYMENT_REQUIRED, code.clone())
                }
                BillingError::GatewayUnavailable(_) => {
                    (StatusCode::BAD_GATEWAY, "GATEWAY_UNAVAILABLE")
                }
                BillingError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
                BillingError::PremiumRequired => (StatusCode::FORBIDDEN, "PREMIUM_REQUIRED"),
                BillingError::Database(_) | BillingError::Config(_) => {
                    (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR")
                }
            },
        };
        (status, code.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();

        let message = match status {
            StatusCode::INTERNAL_SERVER_ERROR => {
                tracing::error!(error = %self, "Request failed with internal error");
                "Internal server error".to_string()
            }
            StatusCode::BAD_GATEWAY => {
                tracing::error!(error = %self, "Gateway outcome unknown, order needs reconciliation");
                self.to_string()
            }
            _ => self.to_string(),
        };

        let body = Json(json!({
            "error": code,
            "message": message,
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(err: ApiError) -> StatusCode {
        err.into_response().status()
    }

    #[test]
    fn test_billing_errors_map_to_distinct_statuses() {
        assert_eq!(
            status(BillingError::Validation("amount".into()).into()),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status(BillingError::AmountMismatch { expected: 3000, actual: 5000 }.into()),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status(BillingError::NotFound("order X".into()).into()),
            StatusCode::NOT_FOUND
        );
        assert_eq!(status(BillingError::PremiumRequired.into()), StatusCode::FORBIDDEN);
        assert_eq!(
            status(
                BillingError::GatewayRejected {
                    code: "REJECT_CARD_COMPANY".into(),
                    message: "declined".into()
                }
                .into()
            ),
            StatusCode::PAYMENT_REQUIRED
        );
        assert_eq!(
            status(BillingError::GatewayUnavailable("timeout".into()).into()),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            status(BillingError::Database("pool closed".into()).into()),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_gateway_code_is_passed_through() {
        let err: ApiError = BillingError::GatewayRejected {
            code: "INVALID_CARD".into(),
            message: "bad card".into(),
        }
        .into();
        assert_eq!(err.status_and_code().1, "INVALID_CARD");
    }
}
