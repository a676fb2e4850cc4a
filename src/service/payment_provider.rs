// service/payment_provider.rs
use std::{
    collections::VecDeque,
    future::Future,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use sqlx::types::BigDecimal;
use uuid::Uuid;

use crate::utils::currency::to_minor_units;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("HTTP request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Processor returned HTTP {status}: {message}")]
    Rejected { status: u16, message: String },

    #[error("Processor unavailable: {0}")]
    Unavailable(String),

    #[error("Amount {0} cannot be expressed in minor units")]
    InvalidAmount(String),
}

impl GatewayError {
    /// Timeouts, connection failures, 5xx and 429 are worth another attempt.
    /// 4xx and malformed bodies are not.
    pub fn is_transient(&self) -> bool {
        match self {
            GatewayError::Transport(e) => !e.is_decode() && !e.is_builder(),
            GatewayError::Rejected { status, .. } => *status >= 500 || *status == 429,
            GatewayError::Unavailable(_) => true,
            GatewayError::InvalidAmount(_) => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatewayOperation {
    Deposit,
    Transfer,
    Payout,
    Refund,
}

impl GatewayOperation {
    fn path(&self) -> &'static str {
        match self {
            GatewayOperation::Deposit => "v1/deposits",
            GatewayOperation::Transfer => "v1/transfers",
            GatewayOperation::Payout => "v1/payouts",
            GatewayOperation::Refund => "v1/refunds",
        }
    }

    fn reference_prefix(&self) -> &'static str {
        match self {
            GatewayOperation::Deposit => "dep",
            GatewayOperation::Transfer => "trf",
            GatewayOperation::Payout => "po",
            GatewayOperation::Refund => "rfd",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GatewayRequest {
    /// The escrow transaction id. The processor de-duplicates on it.
    pub idempotency_key: Uuid,
    pub amount: BigDecimal,
    pub currency: String,
    pub project_id: Uuid,
    pub milestone_id: Option<Uuid>,
    /// Payer for deposits, payee for transfers, payouts and refunds.
    pub counterparty: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayReceipt {
    pub external_reference: String,
    pub status: String,
}

/// Outbound calls to the payment processor. A receipt only means the
/// processor accepted the request; settlement arrives by webhook.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_deposit(&self, request: &GatewayRequest) -> Result<GatewayReceipt, GatewayError>;
    async fn create_transfer(&self, request: &GatewayRequest) -> Result<GatewayReceipt, GatewayError>;
    async fn create_payout(&self, request: &GatewayRequest) -> Result<GatewayReceipt, GatewayError>;
    async fn create_refund(&self, request: &GatewayRequest) -> Result<GatewayReceipt, GatewayError>;
}

// ---------------------------------------------------------------------------
// Retry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(200),
        }
    }
}

impl RetryPolicy {
    /// Exponential backoff (base, 2x base, 4x base...) plus up to half a
    /// base delay of jitter.
    fn delay_for(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as u64;
        let backoff = base_ms.saturating_mul(2u64.saturating_pow(attempt));
        let jitter = rand::rng().random_range(0..=base_ms / 2);
        Duration::from_millis(backoff + jitter)
    }
}

/// Calls `f` until it succeeds, fails permanently, or runs out of attempts.
/// Without an idempotency key a retry could duplicate the side effect, so
/// `idempotent = false` means exactly one attempt.
pub async fn send_with_retry<T, F, Fut>(policy: RetryPolicy, idempotent: bool, f: F) -> Result<T, GatewayError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, GatewayError>>,
{
    let max_attempts = if idempotent { policy.max_attempts.max(1) } else { 1 };
    let mut attempt = 0;
    loop {
        attempt += 1;
        match f().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < max_attempts && e.is_transient() => {
                let delay = policy.delay_for(attempt - 1);
                tracing::warn!(
                    attempt,
                    max_attempts,
                    error = %e,
                    "Payment processor call failed, retrying in {delay:?}"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

// ---------------------------------------------------------------------------
// HTTP adapter
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ProcessorResponse {
    id: String,
    #[serde(default)]
    status: String,
}

pub struct PaymentProviderService {
    client: reqwest::Client,
    base_url: String,
    secret_key: String,
    retry: RetryPolicy,
}

impl PaymentProviderService {
    pub fn new(base_url: String, secret_key: String, timeout: Duration) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url,
            secret_key,
            retry: RetryPolicy::default(),
        })
    }

    async fn post(&self, operation: GatewayOperation, request: &GatewayRequest) -> Result<GatewayReceipt, GatewayError> {
        let amount = to_minor_units(&request.amount)
            .ok_or_else(|| GatewayError::InvalidAmount(request.amount.to_string()))?;

        let payload = serde_json::json!({
            "amount": amount,
            "currency": request.currency,
            "counterparty": request.counterparty,
            "metadata": {
                "escrow_transaction_id": request.idempotency_key,
                "project_id": request.project_id,
                "milestone_id": request.milestone_id,
            }
        });
        let url = format!("{}/{}", self.base_url.trim_end_matches('/'), operation.path());

        let receipt = send_with_retry(self.retry, true, || {
            self.send_once(&url, request.idempotency_key, &payload)
        })
        .await?;

        tracing::info!(
            operation = ?operation,
            escrow_transaction_id = %request.idempotency_key,
            external_reference = %receipt.external_reference,
            "Payment processor accepted request"
        );
        Ok(receipt)
    }

    async fn send_once(
        &self,
        url: &str,
        idempotency_key: Uuid,
        payload: &serde_json::Value,
    ) -> Result<GatewayReceipt, GatewayError> {
        let response = self
            .client
            .post(url)
            .bearer_auth(&self.secret_key)
            .header("Idempotency-Key", idempotency_key.to_string())
            .json(payload)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(GatewayError::Rejected {
                status: status.as_u16(),
                message,
            });
        }

        let body: ProcessorResponse = response.json().await?;
        Ok(GatewayReceipt {
            external_reference: body.id,
            status: body.status,
        })
    }
}

#[async_trait]
impl PaymentGateway for PaymentProviderService {
    async fn create_deposit(&self, request: &GatewayRequest) -> Result<GatewayReceipt, GatewayError> {
        self.post(GatewayOperation::Deposit, request).await
    }

    async fn create_transfer(&self, request: &GatewayRequest) -> Result<GatewayReceipt, GatewayError> {
        self.post(GatewayOperation::Transfer, request).await
    }

    async fn create_payout(&self, request: &GatewayRequest) -> Result<GatewayReceipt, GatewayError> {
        self.post(GatewayOperation::Payout, request).await
    }

    async fn create_refund(&self, request: &GatewayRequest) -> Result<GatewayReceipt, GatewayError> {
        self.post(GatewayOperation::Refund, request).await
    }
}

// ---------------------------------------------------------------------------
// Stub adapter
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StubFailure {
    Unavailable,
    Declined,
}

/// In-process processor for tests and local runs. References are derived from
/// the idempotency key, so repeating a call yields the same reference.
#[derive(Debug, Clone, Default)]
pub struct StubPaymentGateway {
    calls: Arc<Mutex<Vec<(GatewayOperation, GatewayRequest)>>>,
    failures: Arc<Mutex<VecDeque<StubFailure>>>,
}

impl StubPaymentGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a failure for the next call.
    pub fn fail_next(&self, failure: StubFailure) {
        self.failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(failure);
    }

    pub fn calls(&self) -> Vec<(GatewayOperation, GatewayRequest)> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn calls_for(&self, operation: GatewayOperation) -> Vec<GatewayRequest> {
        self.calls()
            .into_iter()
            .filter(|(op, _)| *op == operation)
            .map(|(_, request)| request)
            .collect()
    }

    pub fn reference_for(operation: GatewayOperation, idempotency_key: Uuid) -> String {
        format!("{}_{}", operation.reference_prefix(), idempotency_key.simple())
    }

    fn handle(&self, operation: GatewayOperation, request: &GatewayRequest) -> Result<GatewayReceipt, GatewayError> {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((operation, request.clone()));

        let failure = self.failures.lock().unwrap_or_else(|e| e.into_inner()).pop_front();
        match failure {
            Some(StubFailure::Unavailable) => Err(GatewayError::Unavailable("stub outage".to_string())),
            Some(StubFailure::Declined) => Err(GatewayError::Rejected {
                status: 402,
                message: "card declined".to_string(),
            }),
            None => Ok(GatewayReceipt {
                external_reference: Self::reference_for(operation, request.idempotency_key),
                status: "pending".to_string(),
            }),
        }
    }
}

#[async_trait]
impl PaymentGateway for StubPaymentGateway {
    async fn create_deposit(&self, request: &GatewayRequest) -> Result<GatewayReceipt, GatewayError> {
        self.handle(GatewayOperation::Deposit, request)
    }

    async fn create_transfer(&self, request: &GatewayRequest) -> Result<GatewayReceipt, GatewayError> {
        self.handle(GatewayOperation::Transfer, request)
    }

    async fn create_payout(&self, request: &GatewayRequest) -> Result<GatewayReceipt, GatewayError> {
        self.handle(GatewayOperation::Payout, request)
    }

    async fn create_refund(&self, request: &GatewayRequest) -> Result<GatewayReceipt, GatewayError> {
        self.handle(GatewayOperation::Refund, request)
    }
}
