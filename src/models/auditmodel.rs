// models/auditmodel.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Serialize, Deserialize, sqlx::FromRow, Clone)]
pub struct AuditEntry {
    pub id: Uuid,
    pub action: String,
    pub entity_type: String,
    pub entity_id: String,
    pub actor_id: Option<Uuid>,
    pub old_values: Option<serde_json::Value>,
    pub new_values: Option<serde_json::Value>,
    pub correlation_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

/// Filters for reading the trail. Every field narrows the result.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuditQuery {
    pub entity_type: Option<String>,
    pub entity_id: Option<String>,
    pub actor_id: Option<Uuid>,
    pub action: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub limit: i64,
    pub offset: i64,
}

impl AuditQuery {
    pub fn matches(&self, entry: &AuditEntry) -> bool {
        self.entity_type.as_ref().map_or(true, |t| *t == entry.entity_type)
            && self.entity_id.as_ref().map_or(true, |id| *id == entry.entity_id)
            && self.actor_id.map_or(true, |actor| entry.actor_id == Some(actor))
            && self.action.as_ref().map_or(true, |a| *a == entry.action)
            && self.from.map_or(true, |from| entry.created_at >= from)
            && self.to.map_or(true, |to| entry.created_at < to)
    }
}

pub mod entity_types {
    pub const PROJECT: &str = "project";
    pub const MILESTONE: &str = "milestone";
    pub const ESCROW_TRANSACTION: &str = "escrow_transaction";
    pub const DISPUTE: &str = "dispute";
    pub const WEBHOOK_EVENT: &str = "webhook_event";
}

pub mod actions {
    pub const PROJECT_CREATED: &str = "project.created";
    pub const FREELANCER_INVITED: &str = "project.freelancer_invited";
    pub const PROJECT_ACCEPTED: &str = "project.accepted";
    pub const PROJECT_ON_HOLD: &str = "project.on_hold";
    pub const PROJECT_RESUMED: &str = "project.resumed";
    pub const PROJECT_CANCELLED: &str = "project.cancelled";
    pub const PROJECT_COMPLETED: &str = "project.completed";

    pub const DEPOSIT_INITIATED: &str = "escrow.deposit_initiated";
    pub const ESCROW_HELD: &str = "escrow.held";
    pub const ESCROW_RELEASED: &str = "escrow.released";
    pub const ESCROW_REFUNDED: &str = "escrow.refunded";
    pub const DEPOSIT_RETURNED: &str = "escrow.deposit_returned";
    pub const FEE_CHARGED: &str = "escrow.fee_charged";
    pub const TRANSACTION_DISPATCHED: &str = "escrow.transaction_dispatched";
    pub const TRANSACTION_SETTLED: &str = "escrow.transaction_settled";
    pub const PAYMENT_FAILED: &str = "escrow.payment_failed";
    pub const PAYMENT_RETRY_SCHEDULED: &str = "escrow.payment_retry_scheduled";

    pub const MILESTONE_STARTED: &str = "milestone.started";
    pub const MILESTONE_SUBMITTED: &str = "milestone.submitted";
    pub const MILESTONE_APPROVED: &str = "milestone.approved";
    pub const MILESTONE_AUTO_APPROVED: &str = "milestone.auto_approved";
    pub const REVISION_REQUESTED: &str = "milestone.revision_requested";
    pub const MILESTONE_RESUBMITTED: &str = "milestone.resubmitted";
    pub const MILESTONE_PAID: &str = "milestone.paid";

    pub const DISPUTE_RAISED: &str = "dispute.raised";
    pub const DISPUTE_FEE_CONFIRMED: &str = "dispute.fee_confirmed";
    pub const MEDIATION_STARTED: &str = "dispute.mediation_started";
    pub const SETTLEMENT_PROPOSED: &str = "dispute.settlement_proposed";
    pub const ARBITRATION_STARTED: &str = "dispute.arbitration_started";
    pub const DISPUTE_ESCALATED: &str = "dispute.escalated";
    pub const DISPUTE_RESOLVED: &str = "dispute.resolved";

    pub const WEBHOOK_ESCALATED: &str = "webhook.escalated";
}
