// models/milestonemodel.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::types::BigDecimal;
use uuid::Uuid;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "milestone_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum MilestoneStatus {
    Pending,
    InProgress,
    Submitted,
    Approved,
    RevisionRequested,
    Disputed,
    Paid,
    Refunded,
}

impl MilestoneStatus {
    pub fn to_str(&self) -> &'static str {
        match self {
            MilestoneStatus::Pending => "pending",
            MilestoneStatus::InProgress => "in_progress",
            MilestoneStatus::Submitted => "submitted",
            MilestoneStatus::Approved => "approved",
            MilestoneStatus::RevisionRequested => "revision_requested",
            MilestoneStatus::Disputed => "disputed",
            MilestoneStatus::Paid => "paid",
            MilestoneStatus::Refunded => "refunded",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, MilestoneStatus::Paid | MilestoneStatus::Refunded)
    }

    /// Statuses that let the next milestone in a sequential project start.
    pub fn clears_sequence(&self) -> bool {
        matches!(
            self,
            MilestoneStatus::Approved | MilestoneStatus::Paid | MilestoneStatus::Refunded
        )
    }

    /// Transitions reachable through the normal (non-dispute) flow.
    /// Nothing leaves `disputed` here; only dispute resolution may do that.
    pub fn can_transition_to(&self, next: MilestoneStatus) -> bool {
        use MilestoneStatus::*;
        matches!(
            (self, next),
            (Pending, InProgress)
                | (InProgress, Submitted)
                | (Submitted, Approved)
                | (Submitted, RevisionRequested)
                | (RevisionRequested, InProgress)
                | (Submitted, Disputed)
                | (Approved, Disputed)
                | (Approved, Paid)
        )
    }

    /// Exits from `disputed` available to a resolution decision.
    pub fn can_resolve_to(&self, next: MilestoneStatus) -> bool {
        use MilestoneStatus::*;
        matches!(
            (self, next),
            (Disputed, Paid) | (Disputed, Refunded) | (Disputed, RevisionRequested)
        )
    }
}

impl std::fmt::Display for MilestoneStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.to_str())
    }
}

#[derive(Debug, Serialize, Deserialize, sqlx::FromRow, Clone)]
pub struct Milestone {
    pub id: Uuid,
    pub project_id: Uuid,
    pub title: String,
    pub order_index: i32,
    pub amount: BigDecimal,
    pub status: MilestoneStatus,
    pub revision_count: i32,
    pub deadline: Option<DateTime<Utc>>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub approved_at: Option<DateTime<Utc>>,
    pub paid_at: Option<DateTime<Utc>>,
    pub version: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Milestone {
    pub fn new(
        project_id: Uuid,
        title: String,
        order_index: i32,
        amount: BigDecimal,
        deadline: Option<DateTime<Utc>>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            project_id,
            title,
            order_index,
            amount,
            status: MilestoneStatus::Pending,
            revision_count: 0,
            deadline,
            submitted_at: None,
            approved_at: None,
            paid_at: None,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn audit_snapshot(&self) -> serde_json::Value {
        json!({
            "status": self.status,
            "revision_count": self.revision_count,
            "amount": self.amount,
            "version": self.version,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::MilestoneStatus::*;

    #[test]
    fn normal_flow_transitions() {
        assert!(Pending.can_transition_to(InProgress));
        assert!(InProgress.can_transition_to(Submitted));
        assert!(Submitted.can_transition_to(Approved));
        assert!(Submitted.can_transition_to(RevisionRequested));
        assert!(RevisionRequested.can_transition_to(InProgress));
        assert!(Approved.can_transition_to(Paid));

        assert!(!Pending.can_transition_to(Submitted));
        assert!(!InProgress.can_transition_to(Approved));
        assert!(!Paid.can_transition_to(Approved));
    }

    #[test]
    fn disputed_is_final_for_normal_flow() {
        for next in [Pending, InProgress, Submitted, Approved, RevisionRequested, Paid, Refunded] {
            assert!(!Disputed.can_transition_to(next), "disputed -> {next}");
        }
        assert!(Disputed.can_resolve_to(Paid));
        assert!(Disputed.can_resolve_to(Refunded));
        assert!(Disputed.can_resolve_to(RevisionRequested));
        assert!(!Submitted.can_resolve_to(Paid));
    }

    #[test]
    fn only_submitted_or_approved_can_be_disputed() {
        assert!(Submitted.can_transition_to(Disputed));
        assert!(Approved.can_transition_to(Disputed));
        assert!(!InProgress.can_transition_to(Disputed));
        assert!(!Paid.can_transition_to(Disputed));
    }
}
