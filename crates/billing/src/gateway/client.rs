//! Boundary policy around a [`PaymentGateway`]
//!
//! Every call is bounded by a timeout. Transient failures (network errors,
//! 5xx, timeouts) get exactly one retry after a fixed delay; a definite
//! rejection is returned immediately. Retries reuse the same order id, so
//! the gateway's idempotency covers a first attempt that did land.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio_retry::strategy::FixedInterval;
use tokio_retry::RetryIf;

use super::{ChargeReceipt, ChargeRequest, GatewayError, IssuedCredential, PaymentGateway};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GatewayPolicy {
    /// Upper bound on a single gateway round-trip
    pub timeout: Duration,
    /// Pause before the one retry of a transient failure
    pub retry_delay: Duration,
}

impl Default for GatewayPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            retry_delay: Duration::from_millis(500),
        }
    }
}

/// The only component that talks to the gateway
#[derive(Clone)]
pub struct GatewayClient {
    inner: Arc<dyn PaymentGateway>,
    policy: GatewayPolicy,
}

impl GatewayClient {
    pub fn new(inner: Arc<dyn PaymentGateway>, policy: GatewayPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn policy(&self) -> GatewayPolicy {
        self.policy
    }

    pub async fn issue_credential(
        &self,
        customer_key: &str,
        auth_key: &str,
    ) -> Result<IssuedCredential, GatewayError> {
        self.call("issue_credential", || {
            self.inner.issue_credential(customer_key, auth_key)
        })
        .await
    }

    pub async fn confirm_charge(&self, request: &ChargeRequest) -> Result<ChargeReceipt, GatewayError> {
        self.call("confirm_charge", || self.inner.confirm_charge(request))
            .await
    }

    async fn call<T, F, Fut>(&self, operation: &'static str, mut attempt: F) -> Result<T, GatewayError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, GatewayError>>,
    {
        let timeout = self.policy.timeout;
        let strategy = FixedInterval::new(self.policy.retry_delay).take(1);

        RetryIf::spawn(
            strategy,
            || {
                let pending = attempt();
                async move {
                    match tokio::time::timeout(timeout, pending).await {
                        Ok(result) => result,
                        Err(_) => Err(GatewayError::Transient(format!(
                            "{} timed out after {}ms",
                            operation,
                            timeout.as_millis()
                        ))),
                    }
                }
            },
            |e: &GatewayError| {
                let retry = e.is_transient();
                if retry {
                    tracing::warn!(operation, error = %e, "Transient gateway failure, retrying once");
                }
                retry
            },
        )
        .await
    }
}
