// models/escrowmodel.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::types::BigDecimal;
use uuid::Uuid;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, sqlx::Type, PartialEq, Eq, Hash)]
#[sqlx(type_name = "escrow_transaction_type", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    Deposit,
    Release,
    Refund,
    Fee,
}

impl TransactionType {
    pub fn to_str(&self) -> &'static str {
        match self {
            TransactionType::Deposit => "deposit",
            TransactionType::Release => "release",
            TransactionType::Refund => "refund",
            TransactionType::Fee => "fee",
        }
    }

    /// Money leaving escrow towards a party.
    pub fn is_outbound(&self) -> bool {
        matches!(self, TransactionType::Release | TransactionType::Refund)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "escrow_transaction_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Pending,
    Completed,
    Failed,
}

impl TransactionStatus {
    pub fn to_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "pending",
            TransactionStatus::Completed => "completed",
            TransactionStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Serialize, Deserialize, sqlx::FromRow, Clone)]
pub struct EscrowTransaction {
    pub id: Uuid,
    pub project_id: Uuid,
    pub milestone_id: Option<Uuid>,
    pub amount: BigDecimal,
    #[serde(rename = "type")]
    pub kind: TransactionType,
    pub status: TransactionStatus,
    pub external_reference: Option<String>,
    pub operation_id: Option<String>,
    pub replaces_id: Option<Uuid>,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl EscrowTransaction {
    pub fn pending(
        project_id: Uuid,
        milestone_id: Option<Uuid>,
        kind: TransactionType,
        amount: BigDecimal,
        operation_id: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            project_id,
            milestone_id,
            amount,
            kind,
            status: TransactionStatus::Pending,
            external_reference: None,
            operation_id,
            replaces_id: None,
            failure_reason: None,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    /// A fresh pending row that re-attempts a failed one. The failed row is
    /// never reused.
    pub fn replacement_for(failed: &EscrowTransaction) -> Self {
        let mut row = Self::pending(
            failed.project_id,
            failed.milestone_id,
            failed.kind,
            failed.amount.clone(),
            None,
        );
        row.replaces_id = Some(failed.id);
        row
    }

    pub fn is_pending(&self) -> bool {
        self.status == TransactionStatus::Pending
    }

    pub fn audit_snapshot(&self) -> serde_json::Value {
        json!({
            "type": self.kind,
            "status": self.status,
            "amount": self.amount,
            "external_reference": self.external_reference,
            "operation_id": self.operation_id,
            "replaces_id": self.replaces_id,
            "failure_reason": self.failure_reason,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn replacement_keeps_amount_and_links_failed_row() {
        let mut failed = EscrowTransaction::pending(
            Uuid::new_v4(),
            Some(Uuid::new_v4()),
            TransactionType::Release,
            BigDecimal::from_str("300.00").unwrap(),
            Some("op-1".to_string()),
        );
        failed.status = TransactionStatus::Failed;

        let retry = EscrowTransaction::replacement_for(&failed);
        assert_ne!(retry.id, failed.id);
        assert_eq!(retry.replaces_id, Some(failed.id));
        assert_eq!(retry.amount, failed.amount);
        assert_eq!(retry.kind, TransactionType::Release);
        assert!(retry.is_pending());
        // operation ids stay unique to the original call
        assert!(retry.operation_id.is_none());
    }

    #[test]
    fn serializes_kind_as_type() {
        let row = EscrowTransaction::pending(
            Uuid::new_v4(),
            None,
            TransactionType::Deposit,
            BigDecimal::from(10),
            None,
        );
        let value = serde_json::to_value(&row).unwrap();
        assert_eq!(value["type"], "deposit");
        assert_eq!(value["status"], "pending");
    }
}
