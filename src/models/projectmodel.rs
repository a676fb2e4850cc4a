// models/projectmodel.rs
use chrono::{DateTime, Utc};
use num_traits::Zero;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::types::BigDecimal;
use uuid::Uuid;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "project_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    Draft,
    PendingAcceptance,
    AwaitingDeposit,
    Active,
    OnHold,
    Completed,
    Cancelled,
    Disputed,
}

impl ProjectStatus {
    pub fn to_str(&self) -> &'static str {
        match self {
            ProjectStatus::Draft => "draft",
            ProjectStatus::PendingAcceptance => "pending_acceptance",
            ProjectStatus::AwaitingDeposit => "awaiting_deposit",
            ProjectStatus::Active => "active",
            ProjectStatus::OnHold => "on_hold",
            ProjectStatus::Completed => "completed",
            ProjectStatus::Cancelled => "cancelled",
            ProjectStatus::Disputed => "disputed",
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, ProjectStatus::Completed | ProjectStatus::Cancelled)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "escrow_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum EscrowStatus {
    Unfunded,
    Held,
    PartiallyReleased,
    Released,
    Refunded,
}

impl EscrowStatus {
    pub fn to_str(&self) -> &'static str {
        match self {
            EscrowStatus::Unfunded => "unfunded",
            EscrowStatus::Held => "held",
            EscrowStatus::PartiallyReleased => "partially_released",
            EscrowStatus::Released => "released",
            EscrowStatus::Refunded => "refunded",
        }
    }
}

#[derive(Debug, Serialize, Deserialize, sqlx::FromRow, Clone)]
pub struct Project {
    pub id: Uuid,
    pub client_id: Uuid,
    pub freelancer_id: Option<Uuid>,
    pub title: String,
    pub total_budget: BigDecimal,
    pub currency: String,
    pub status: ProjectStatus,
    pub sequential: bool,
    pub escrow_status: EscrowStatus,
    pub total_held: BigDecimal,
    pub total_released: BigDecimal,
    pub total_refunded: BigDecimal,
    pub remaining: BigDecimal,
    pub version: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Read-only view of the fund accounting for one project.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct EscrowSummary {
    pub status: EscrowStatus,
    pub total_held: BigDecimal,
    pub total_released: BigDecimal,
    pub total_refunded: BigDecimal,
    pub remaining: BigDecimal,
}

impl Project {
    pub fn new(
        client_id: Uuid,
        freelancer_id: Option<Uuid>,
        title: String,
        total_budget: BigDecimal,
        currency: String,
        sequential: bool,
    ) -> Self {
        let now = Utc::now();
        let status = if freelancer_id.is_some() {
            ProjectStatus::PendingAcceptance
        } else {
            ProjectStatus::Draft
        };

        Self {
            id: Uuid::new_v4(),
            client_id,
            freelancer_id,
            title,
            total_budget,
            currency,
            status,
            sequential,
            escrow_status: EscrowStatus::Unfunded,
            total_held: BigDecimal::zero(),
            total_released: BigDecimal::zero(),
            total_refunded: BigDecimal::zero(),
            remaining: BigDecimal::zero(),
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn escrow(&self) -> EscrowSummary {
        EscrowSummary {
            status: self.escrow_status,
            total_held: self.total_held.clone(),
            total_released: self.total_released.clone(),
            total_refunded: self.total_refunded.clone(),
            remaining: self.remaining.clone(),
        }
    }

    pub fn is_client(&self, user_id: Uuid) -> bool {
        self.client_id == user_id
    }

    pub fn is_freelancer(&self, user_id: Uuid) -> bool {
        self.freelancer_id == Some(user_id)
    }

    pub fn is_party(&self, user_id: Uuid) -> bool {
        self.is_client(user_id) || self.is_freelancer(user_id)
    }

    /// Recomputes `remaining` and the escrow status from the three totals.
    pub fn refresh_escrow(&mut self) {
        self.remaining = &self.total_held - &self.total_released - &self.total_refunded;
        self.escrow_status = if self.total_held.is_zero() {
            EscrowStatus::Unfunded
        } else if self.remaining == self.total_held {
            EscrowStatus::Held
        } else if !self.remaining.is_zero() {
            EscrowStatus::PartiallyReleased
        } else if self.total_released.is_zero() {
            EscrowStatus::Refunded
        } else {
            EscrowStatus::Released
        };
    }

    /// `remaining = held - released - refunded >= 0`
    pub fn ledger_balanced(&self) -> bool {
        let expected = &self.total_held - &self.total_released - &self.total_refunded;
        expected == self.remaining && self.remaining >= BigDecimal::zero()
    }

    pub fn audit_snapshot(&self) -> serde_json::Value {
        json!({
            "status": self.status,
            "escrow_status": self.escrow_status,
            "total_held": self.total_held,
            "total_released": self.total_released,
            "total_refunded": self.total_refunded,
            "remaining": self.remaining,
            "version": self.version,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn dec(value: &str) -> BigDecimal {
        BigDecimal::from_str(value).unwrap()
    }

    fn funded(held: &str) -> Project {
        let mut project = Project::new(
            Uuid::new_v4(),
            Some(Uuid::new_v4()),
            "Landing page".to_string(),
            dec(held),
            "USD".to_string(),
            true,
        );
        project.total_held = dec(held);
        project.refresh_escrow();
        project
    }

    #[test]
    fn new_project_waits_for_acceptance_when_freelancer_known() {
        let project = funded("100");
        assert_eq!(project.status, ProjectStatus::PendingAcceptance);

        let draft = Project::new(Uuid::new_v4(), None, "x".into(), dec("1"), "USD".into(), true);
        assert_eq!(draft.status, ProjectStatus::Draft);
        assert_eq!(draft.escrow_status, EscrowStatus::Unfunded);
    }

    #[test]
    fn escrow_status_follows_totals() {
        let mut project = funded("1000");
        assert_eq!(project.escrow_status, EscrowStatus::Held);
        assert_eq!(project.remaining, dec("1000"));

        project.total_released = dec("500");
        project.refresh_escrow();
        assert_eq!(project.escrow_status, EscrowStatus::PartiallyReleased);
        assert_eq!(project.remaining, dec("500"));

        project.total_refunded = dec("500");
        project.refresh_escrow();
        assert_eq!(project.escrow_status, EscrowStatus::Released);
        assert!(project.remaining.is_zero());
        assert!(project.ledger_balanced());
    }

    #[test]
    fn fully_refunded_escrow_is_refunded() {
        let mut project = funded("250.50");
        project.total_refunded = dec("250.50");
        project.refresh_escrow();
        assert_eq!(project.escrow_status, EscrowStatus::Refunded);
    }

    #[test]
    fn tampered_remaining_is_unbalanced() {
        let mut project = funded("10");
        project.remaining = dec("11");
        assert!(!project.ledger_balanced());
    }
}
