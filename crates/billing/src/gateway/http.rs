//! REST adapter for the payment gateway
//!
//! Authentication is HTTP Basic with the secret key as username and an
//! empty password. Charge confirmations carry the order id as the
//! `Idempotency-Key` so a retried call cannot capture twice.

use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use super::{ChargeReceipt, ChargeRequest, ChargeSource, GatewayError, IssuedCredential, PaymentGateway};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct IssueCredentialBody<'a> {
    customer_key: &'a str,
    auth_key: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CredentialChargeBody<'a> {
    customer_key: &'a str,
    amount: i64,
    order_id: &'a str,
    order_name: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ConfirmPaymentBody<'a> {
    payment_key: &'a str,
    order_id: &'a str,
    amount: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CardInfo {
    number: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CredentialResponse {
    billing_key: String,
    customer_key: String,
    method: Option<String>,
    card: Option<CardInfo>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PaymentResponse {
    payment_key: String,
    order_id: String,
    status: String,
    method: Option<String>,
    total_amount: i64,
    #[serde(default, with = "time::serde::rfc3339::option")]
    approved_at: Option<OffsetDateTime>,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    code: String,
    message: String,
}

/// Gateway client over HTTPS
#[derive(Clone)]
pub struct HttpGateway {
    http: reqwest::Client,
    base_url: String,
    authorization: String,
}

impl HttpGateway {
    pub fn new(base_url: &str, secret_key: &str) -> Result<Self, GatewayError> {
        let http = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(5))
            .build()
            .map_err(|e| GatewayError::Transient(format!("client setup failed: {}", e)))?;

        let credentials =
            base64::engine::general_purpose::STANDARD.encode(format!("{}:", secret_key));

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            authorization: format!("Basic {}", credentials),
        })
    }

    async fn post<B: Serialize>(
        &self,
        path: &str,
        body: &B,
        idempotency_key: Option<&str>,
    ) -> Result<String, GatewayError> {
        let mut request = self
            .http
            .post(format!("{}{}", self.base_url, path))
            .header(reqwest::header::AUTHORIZATION, &self.authorization)
            .json(body);
        if let Some(key) = idempotency_key {
            request = request.header("Idempotency-Key", key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| GatewayError::Transient(e.to_string()))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| GatewayError::Transient(format!("reading body: {}", e)))?;

        if status.is_server_error() || status.as_u16() == 429 {
            return Err(GatewayError::Transient(format!(
                "gateway returned {}: {}",
                status.as_u16(),
                text
            )));
        }

        if !status.is_success() {
            let (code, message) = match serde_json::from_str::<ErrorResponse>(&text) {
                Ok(err) => (err.code, err.message),
                Err(_) => ("UNKNOWN_ERROR".to_string(), text),
            };
            return Err(GatewayError::Rejected {
                status: status.as_u16(),
                code,
                message,
            });
        }

        Ok(text)
    }

    fn parse_payment(text: &str) -> Result<ChargeReceipt, GatewayError> {
        let payment: PaymentResponse = serde_json::from_str(text)
            .map_err(|e| GatewayError::InvalidResponse(format!("{}; body={}", e, text)))?;

        if payment.status != "DONE" {
            return Err(GatewayError::Rejected {
                status: 200,
                code: format!("STATUS_{}", payment.status),
                message: format!("payment ended in status {}", payment.status),
            });
        }

        Ok(ChargeReceipt {
            charge_key: payment.payment_key,
            order_id: payment.order_id,
            amount: payment.total_amount,
            method: payment.method,
            approved_at: payment.approved_at,
        })
    }
}

#[async_trait]
impl PaymentGateway for HttpGateway {
    async fn issue_credential(
        &self,
        customer_key: &str,
        auth_key: &str,
    ) -> Result<IssuedCredential, GatewayError> {
        let text = self
            .post(
                "/v1/billing/authorizations/issue",
                &IssueCredentialBody {
                    customer_key,
                    auth_key,
                },
                None,
            )
            .await?;

        let issued: CredentialResponse = serde_json::from_str(&text)
            .map_err(|e| GatewayError::InvalidResponse(format!("{}; body={}", e, text)))?;

        let card_last4 = issued
            .card
            .and_then(|c| c.number)
            .map(|n| {
                let skip = n.chars().count().saturating_sub(4);
                n.chars().skip(skip).collect::<String>()
            });

        Ok(IssuedCredential {
            credential: issued.billing_key,
            customer_key: issued.customer_key,
            method: issued.method,
            card_last4,
        })
    }

    async fn confirm_charge(&self, request: &ChargeRequest) -> Result<ChargeReceipt, GatewayError> {
        let text = match &request.source {
            ChargeSource::PaymentKey(payment_key) => {
                self.post(
                    "/v1/payments/confirm",
                    &ConfirmPaymentBody {
                        payment_key,
                        order_id: &request.order_id,
                        amount: request.amount,
                    },
                    Some(&request.order_id),
                )
                .await?
            }
            ChargeSource::Credential {
                credential,
                customer_key,
            } => {
                self.post(
                    &format!("/v1/billing/{}", credential),
                    &CredentialChargeBody {
                        customer_key,
                        amount: request.amount,
                        order_id: &request.order_id,
                        order_name: &request.order_label,
                    },
                    Some(&request.order_id),
                )
                .await?
            }
        };

        Self::parse_payment(&text)
    }
}
