// db/store.rs
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::{
    models::{
        auditmodel::{AuditEntry, AuditQuery},
        disputemodel::Dispute,
        escrowmodel::{EscrowTransaction, TransactionStatus},
        milestonemodel::Milestone,
        projectmodel::Project,
        webhookmodel::{WebhookEvent, WebhookEventStatus},
    },
    service::notification_service::TransitionNotice,
};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("{entity} {id} was modified concurrently")]
    VersionConflict { entity: &'static str, id: String },

    #[error("Unique constraint {0} violated")]
    UniqueViolation(String),

    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

pub mod constraints {
    pub const TRANSACTION_REFERENCE: &str = "uq_escrow_transactions_external_reference";
    pub const TRANSACTION_OPERATION: &str = "uq_escrow_transactions_operation_id";
    pub const MILESTONE_ORDER: &str = "uq_milestones_project_order";
    pub const OPEN_DISPUTE: &str = "uq_disputes_open_milestone";
    pub const WEBHOOK_EVENT_ID: &str = "webhook_events_pkey";
}

/// One row-level write. Updates carry the version (or status) the caller read,
/// so a concurrent writer turns the whole unit into a `VersionConflict`.
#[derive(Debug, Clone)]
pub enum Write {
    InsertProject(Project),
    UpdateProject { row: Project, expected_version: i32 },
    InsertMilestone(Milestone),
    UpdateMilestone { row: Milestone, expected_version: i32 },
    InsertTransaction(EscrowTransaction),
    UpdateTransaction { row: EscrowTransaction, expected_status: TransactionStatus },
    InsertDispute(Dispute),
    UpdateDispute { row: Dispute, expected_version: i32 },
    InsertWebhookEvent(WebhookEvent),
    UpdateWebhookEvent { row: WebhookEvent, expected_status: WebhookEventStatus },
    InsertAudit(AuditEntry),
}

/// Everything one operation changes. Committed atomically by the store;
/// notices are only dispatched after the commit succeeds.
#[derive(Default)]
pub struct UnitOfWork {
    writes: Vec<Write>,
    notices: Vec<TransitionNotice>,
}

impl fmt::Debug for UnitOfWork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnitOfWork")
            .field("writes", &self.writes.len())
            .field("notices", &self.notices.len())
            .finish()
    }
}

impl UnitOfWork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, write: Write) {
        self.writes.push(write);
    }

    pub fn insert_project(&mut self, project: &Project) {
        self.writes.push(Write::InsertProject(project.clone()));
    }

    /// Bumps the version in place and queues the update against the version
    /// that was read.
    pub fn save_project(&mut self, project: &mut Project) {
        let expected_version = project.version;
        project.version += 1;
        project.updated_at = Utc::now();
        self.writes.push(Write::UpdateProject {
            row: project.clone(),
            expected_version,
        });
    }

    pub fn insert_milestone(&mut self, milestone: &Milestone) {
        self.writes.push(Write::InsertMilestone(milestone.clone()));
    }

    pub fn save_milestone(&mut self, milestone: &mut Milestone) {
        let expected_version = milestone.version;
        milestone.version += 1;
        milestone.updated_at = Utc::now();
        self.writes.push(Write::UpdateMilestone {
            row: milestone.clone(),
            expected_version,
        });
    }

    pub fn insert_transaction(&mut self, transaction: &EscrowTransaction) {
        self.writes.push(Write::InsertTransaction(transaction.clone()));
    }

    pub fn save_transaction(&mut self, transaction: &EscrowTransaction, expected_status: TransactionStatus) {
        self.writes.push(Write::UpdateTransaction {
            row: transaction.clone(),
            expected_status,
        });
    }

    pub fn insert_dispute(&mut self, dispute: &Dispute) {
        self.writes.push(Write::InsertDispute(dispute.clone()));
    }

    pub fn save_dispute(&mut self, dispute: &mut Dispute) {
        let expected_version = dispute.version;
        dispute.version += 1;
        dispute.updated_at = Utc::now();
        self.writes.push(Write::UpdateDispute {
            row: dispute.clone(),
            expected_version,
        });
    }

    pub fn insert_webhook_event(&mut self, event: &WebhookEvent) {
        self.writes.push(Write::InsertWebhookEvent(event.clone()));
    }

    pub fn save_webhook_event(&mut self, event: &mut WebhookEvent, expected_status: WebhookEventStatus) {
        event.updated_at = Utc::now();
        self.writes.push(Write::UpdateWebhookEvent {
            row: event.clone(),
            expected_status,
        });
    }

    pub fn insert_audit(&mut self, entry: AuditEntry) {
        self.writes.push(Write::InsertAudit(entry));
    }

    pub fn notify(&mut self, notice: TransitionNotice) {
        self.notices.push(notice);
    }

    pub fn writes(&self) -> &[Write] {
        &self.writes
    }

    pub fn notices(&self) -> &[TransitionNotice] {
        &self.notices
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    pub fn into_parts(self) -> (Vec<Write>, Vec<TransitionNotice>) {
        (self.writes, self.notices)
    }
}

#[async_trait]
pub trait EscrowStore: Send + Sync {
    async fn project(&self, id: Uuid) -> Result<Option<Project>, StoreError>;

    async fn milestone(&self, id: Uuid) -> Result<Option<Milestone>, StoreError>;

    /// Ordered by `order_index`.
    async fn project_milestones(&self, project_id: Uuid) -> Result<Vec<Milestone>, StoreError>;

    async fn submitted_milestones_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<Milestone>, StoreError>;

    async fn transaction(&self, id: Uuid) -> Result<Option<EscrowTransaction>, StoreError>;

    async fn transaction_by_reference(&self, reference: &str) -> Result<Option<EscrowTransaction>, StoreError>;

    async fn transaction_by_operation(&self, operation_id: &str) -> Result<Option<EscrowTransaction>, StoreError>;

    /// Newest first.
    async fn project_transactions(&self, project_id: Uuid) -> Result<Vec<EscrowTransaction>, StoreError>;

    /// Pending release, refund and fee rows that still need their gateway
    /// call. Deposits are started by the client and never re-sent.
    async fn undispatched_transactions(&self) -> Result<Vec<EscrowTransaction>, StoreError>;

    async fn dispute(&self, id: Uuid) -> Result<Option<Dispute>, StoreError>;

    async fn open_dispute_for_milestone(&self, milestone_id: Uuid) -> Result<Option<Dispute>, StoreError>;

    async fn project_open_disputes(&self, project_id: Uuid) -> Result<Vec<Dispute>, StoreError>;

    async fn mediations_started_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<Dispute>, StoreError>;

    async fn webhook_event(&self, external_id: &str) -> Result<Option<WebhookEvent>, StoreError>;

    /// Failed rows still under the retry limit, plus `processing` rows whose
    /// lease ran out before `stale_before`.
    async fn retryable_webhook_events(
        &self,
        max_retries: i32,
        stale_before: DateTime<Utc>,
    ) -> Result<Vec<WebhookEvent>, StoreError>;

    /// Newest first.
    async fn audit_entries(&self, query: &AuditQuery) -> Result<Vec<AuditEntry>, StoreError>;

    async fn purge_audit_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;

    /// Applies every write in order inside one transaction.
    async fn commit(&self, writes: Vec<Write>) -> Result<(), StoreError>;
}
