// models/webhookmodel.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "webhook_event_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum WebhookEventStatus {
    Received,
    Processing,
    Success,
    Failed,
}

impl WebhookEventStatus {
    pub fn to_str(&self) -> &'static str {
        match self {
            WebhookEventStatus::Received => "received",
            WebhookEventStatus::Processing => "processing",
            WebhookEventStatus::Success => "success",
            WebhookEventStatus::Failed => "failed",
        }
    }
}

/// One delivery from the payment processor, keyed by the processor's event id.
#[derive(Debug, Serialize, Deserialize, sqlx::FromRow, Clone)]
pub struct WebhookEvent {
    pub external_id: String,
    pub event_type: String,
    pub status: WebhookEventStatus,
    pub retry_count: i32,
    pub payload_hash: String,
    pub raw_payload: String,
    pub last_error: Option<String>,
    pub received_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub escalated_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl WebhookEvent {
    pub fn new(
        external_id: String,
        event_type: String,
        status: WebhookEventStatus,
        payload_hash: String,
        raw_payload: String,
    ) -> Self {
        let now = Utc::now();
        Self {
            external_id,
            event_type,
            status,
            retry_count: 0,
            payload_hash,
            raw_payload,
            last_error: None,
            received_at: now,
            processed_at: None,
            escalated_at: None,
            updated_at: now,
        }
    }

    pub fn is_escalated(&self) -> bool {
        self.escalated_at.is_some()
    }
}

/// Envelope sent by the processor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PaymentEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub data: PaymentEventData,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PaymentEventData {
    #[serde(default)]
    pub reference: Option<String>,
    /// The escrow transaction id sent as the idempotency key on the
    /// outbound call.
    #[serde(default)]
    pub idempotency_key: Option<Uuid>,
    /// Minor units.
    #[serde(default)]
    pub amount: Option<i64>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub project_id: Option<Uuid>,
    #[serde(default)]
    pub failure_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaymentEventKind {
    DepositSucceeded,
    TransferSucceeded,
    PayoutSucceeded,
    RefundSucceeded,
    PaymentFailed,
    Unsupported(String),
}

impl PaymentEvent {
    pub fn kind(&self) -> PaymentEventKind {
        match self.event_type.as_str() {
            "deposit.succeeded" => PaymentEventKind::DepositSucceeded,
            "transfer.succeeded" => PaymentEventKind::TransferSucceeded,
            "payout.succeeded" => PaymentEventKind::PayoutSucceeded,
            "refund.succeeded" => PaymentEventKind::RefundSucceeded,
            "payment.failed" => PaymentEventKind::PaymentFailed,
            other => PaymentEventKind::Unsupported(other.to_string()),
        }
    }
}

/// Result of handing one delivery to the processor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "reason", rename_all = "snake_case")]
pub enum WebhookOutcome {
    Applied,
    Duplicate,
    Rejected(RejectReason),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    InvalidSignature,
    Unparseable,
    UnsupportedEventType(String),
    HandlerFailed(String),
    RetriesExhausted,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_envelope_with_optional_fields() {
        let raw = r#"{
            "id": "evt_1",
            "type": "deposit.succeeded",
            "created_at": "2026-01-05T10:00:00Z",
            "data": { "reference": "ch_123", "amount": 100000 }
        }"#;
        let event: PaymentEvent = serde_json::from_str(raw).unwrap();
        assert_eq!(event.kind(), PaymentEventKind::DepositSucceeded);
        assert_eq!(event.data.reference.as_deref(), Some("ch_123"));
        assert_eq!(event.data.amount, Some(100000));
        assert!(event.data.idempotency_key.is_none());
    }

    #[test]
    fn unknown_types_are_unsupported() {
        let event: PaymentEvent =
            serde_json::from_str(r#"{"id":"evt_2","type":"customer.updated"}"#).unwrap();
        assert_eq!(
            event.kind(),
            PaymentEventKind::Unsupported("customer.updated".to_string())
        );
    }

    #[test]
    fn outcome_serializes_tagged() {
        let value = serde_json::to_value(WebhookOutcome::Rejected(RejectReason::Unparseable)).unwrap();
        assert_eq!(value["outcome"], "rejected");
        assert_eq!(value["reason"], "unparseable");
    }
}
