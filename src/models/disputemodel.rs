// models/disputemodel.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "dispute_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum DisputeStatus {
    Raised,
    PendingReview,
    Mediation,
    Arbitration,
    Resolved,
    Escalated,
}

impl DisputeStatus {
    pub fn to_str(&self) -> &'static str {
        match self {
            DisputeStatus::Raised => "raised",
            DisputeStatus::PendingReview => "pending_review",
            DisputeStatus::Mediation => "mediation",
            DisputeStatus::Arbitration => "arbitration",
            DisputeStatus::Resolved => "resolved",
            DisputeStatus::Escalated => "escalated",
        }
    }

    pub fn is_open(&self) -> bool {
        *self != DisputeStatus::Resolved
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "resolution_decision", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum DecisionKind {
    FullPayment,
    PartialSplit,
    FullRefund,
    RevisionRequired,
}

/// Outcome of mediation or arbitration. `freelancer_share_pct` is the
/// percentage of the milestone amount released to the freelancer.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResolutionDecision {
    FullPayment,
    PartialSplit { freelancer_share_pct: u8 },
    FullRefund,
    RevisionRequired,
}

impl ResolutionDecision {
    pub fn validate(&self) -> Result<(), String> {
        match self {
            ResolutionDecision::PartialSplit { freelancer_share_pct } if *freelancer_share_pct > 100 => {
                Err(format!(
                    "freelancer share must be between 0 and 100, got {}",
                    freelancer_share_pct
                ))
            }
            _ => Ok(()),
        }
    }

    /// Splits at the edges collapse to the equivalent full decision.
    pub fn normalized(self) -> Self {
        match self {
            ResolutionDecision::PartialSplit { freelancer_share_pct: 0 } => ResolutionDecision::FullRefund,
            ResolutionDecision::PartialSplit { freelancer_share_pct: 100 } => ResolutionDecision::FullPayment,
            other => other,
        }
    }

    pub fn to_columns(&self) -> (DecisionKind, Option<i16>) {
        match self {
            ResolutionDecision::FullPayment => (DecisionKind::FullPayment, None),
            ResolutionDecision::PartialSplit { freelancer_share_pct } => {
                (DecisionKind::PartialSplit, Some(i16::from(*freelancer_share_pct)))
            }
            ResolutionDecision::FullRefund => (DecisionKind::FullRefund, None),
            ResolutionDecision::RevisionRequired => (DecisionKind::RevisionRequired, None),
        }
    }

    pub fn from_columns(kind: Option<DecisionKind>, share: Option<i16>) -> Option<Self> {
        match kind? {
            DecisionKind::FullPayment => Some(ResolutionDecision::FullPayment),
            DecisionKind::PartialSplit => {
                let pct = u8::try_from(share?).ok()?;
                Some(ResolutionDecision::PartialSplit { freelancer_share_pct: pct })
            }
            DecisionKind::FullRefund => Some(ResolutionDecision::FullRefund),
            DecisionKind::RevisionRequired => Some(ResolutionDecision::RevisionRequired),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, sqlx::FromRow, Clone)]
pub struct Dispute {
    pub id: Uuid,
    pub project_id: Uuid,
    pub milestone_id: Uuid,
    pub raised_by: Uuid,
    pub reason: String,
    pub status: DisputeStatus,
    pub fee_transaction_id: Option<Uuid>,
    pub client_proposal: Option<DecisionKind>,
    pub client_proposal_share: Option<i16>,
    pub freelancer_proposal: Option<DecisionKind>,
    pub freelancer_proposal_share: Option<i16>,
    pub decision: Option<DecisionKind>,
    pub decision_share: Option<i16>,
    pub resolution_summary: Option<String>,
    pub resolved_by: Option<Uuid>,
    pub mediation_started_at: Option<DateTime<Utc>>,
    pub arbitration_started_at: Option<DateTime<Utc>>,
    pub escalated_at: Option<DateTime<Utc>>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub version: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Dispute {
    pub fn new(project_id: Uuid, milestone_id: Uuid, raised_by: Uuid, reason: String) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            project_id,
            milestone_id,
            raised_by,
            reason,
            status: DisputeStatus::Raised,
            fee_transaction_id: None,
            client_proposal: None,
            client_proposal_share: None,
            freelancer_proposal: None,
            freelancer_proposal_share: None,
            decision: None,
            decision_share: None,
            resolution_summary: None,
            resolved_by: None,
            mediation_started_at: None,
            arbitration_started_at: None,
            escalated_at: None,
            resolved_at: None,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn decision(&self) -> Option<ResolutionDecision> {
        ResolutionDecision::from_columns(self.decision, self.decision_share)
    }

    pub fn set_decision(&mut self, decision: ResolutionDecision) {
        let (kind, share) = decision.to_columns();
        self.decision = Some(kind);
        self.decision_share = share;
    }

    pub fn client_proposal(&self) -> Option<ResolutionDecision> {
        ResolutionDecision::from_columns(self.client_proposal, self.client_proposal_share)
    }

    pub fn set_client_proposal(&mut self, decision: ResolutionDecision) {
        let (kind, share) = decision.to_columns();
        self.client_proposal = Some(kind);
        self.client_proposal_share = share;
    }

    pub fn freelancer_proposal(&self) -> Option<ResolutionDecision> {
        ResolutionDecision::from_columns(self.freelancer_proposal, self.freelancer_proposal_share)
    }

    pub fn set_freelancer_proposal(&mut self, decision: ResolutionDecision) {
        let (kind, share) = decision.to_columns();
        self.freelancer_proposal = Some(kind);
        self.freelancer_proposal_share = share;
    }

    /// Both parties proposed the same outcome.
    pub fn agreed_decision(&self) -> Option<ResolutionDecision> {
        let client = self.client_proposal()?.normalized();
        let freelancer = self.freelancer_proposal()?.normalized();
        (client == freelancer).then_some(client)
    }

    pub fn audit_snapshot(&self) -> serde_json::Value {
        json!({
            "status": self.status,
            "decision": self.decision(),
            "resolved_by": self.resolved_by,
            "version": self.version,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_edges_normalize() {
        assert_eq!(
            ResolutionDecision::PartialSplit { freelancer_share_pct: 0 }.normalized(),
            ResolutionDecision::FullRefund
        );
        assert_eq!(
            ResolutionDecision::PartialSplit { freelancer_share_pct: 100 }.normalized(),
            ResolutionDecision::FullPayment
        );
        assert_eq!(
            ResolutionDecision::PartialSplit { freelancer_share_pct: 60 }.normalized(),
            ResolutionDecision::PartialSplit { freelancer_share_pct: 60 }
        );
    }

    #[test]
    fn share_above_hundred_is_invalid() {
        assert!(ResolutionDecision::PartialSplit { freelancer_share_pct: 101 }
            .validate()
            .is_err());
        assert!(ResolutionDecision::FullRefund.validate().is_ok());
    }

    #[test]
    fn decision_survives_column_mapping() {
        let mut dispute = Dispute::new(Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4(), "late".into());
        assert!(dispute.decision().is_none());

        dispute.set_decision(ResolutionDecision::PartialSplit { freelancer_share_pct: 60 });
        assert_eq!(dispute.decision, Some(DecisionKind::PartialSplit));
        assert_eq!(dispute.decision_share, Some(60));
        assert_eq!(
            dispute.decision(),
            Some(ResolutionDecision::PartialSplit { freelancer_share_pct: 60 })
        );
    }

    #[test]
    fn agreement_requires_matching_proposals() {
        let mut dispute = Dispute::new(Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4(), "scope".into());
        dispute.set_client_proposal(ResolutionDecision::PartialSplit { freelancer_share_pct: 50 });
        assert!(dispute.agreed_decision().is_none());

        dispute.set_freelancer_proposal(ResolutionDecision::PartialSplit { freelancer_share_pct: 70 });
        assert!(dispute.agreed_decision().is_none());

        dispute.set_freelancer_proposal(ResolutionDecision::PartialSplit { freelancer_share_pct: 50 });
        assert_eq!(
            dispute.agreed_decision(),
            Some(ResolutionDecision::PartialSplit { freelancer_share_pct: 50 })
        );
    }

    #[test]
    fn decision_json_shape() {
        let decision: ResolutionDecision =
            serde_json::from_str(r#"{"kind":"partial_split","freelancer_share_pct":60}"#).unwrap();
        assert_eq!(decision, ResolutionDecision::PartialSplit { freelancer_share_pct: 60 });
        let full: ResolutionDecision = serde_json::from_str(r#"{"kind":"full_refund"}"#).unwrap();
        assert_eq!(full, ResolutionDecision::FullRefund);
    }
}
