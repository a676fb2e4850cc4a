// db/memorydb.rs
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::store::{constraints, EscrowStore, StoreError, Write};
use crate::models::{
    auditmodel::{AuditEntry, AuditQuery},
    disputemodel::{Dispute, DisputeStatus},
    escrowmodel::{EscrowTransaction, TransactionStatus, TransactionType},
    milestonemodel::{Milestone, MilestoneStatus},
    projectmodel::Project,
    webhookmodel::{WebhookEvent, WebhookEventStatus},
};

#[derive(Debug, Clone, Default)]
struct Tables {
    projects: HashMap<Uuid, Project>,
    milestones: HashMap<Uuid, Milestone>,
    transactions: HashMap<Uuid, EscrowTransaction>,
    disputes: HashMap<Uuid, Dispute>,
    webhook_events: HashMap<String, WebhookEvent>,
    audit: Vec<AuditEntry>,
}

/// In-process store with the same constraints as the Postgres schema. Used by
/// tests and `STORE=memory` runs.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    tables: Arc<RwLock<Tables>>,
    reject_audit_writes: Arc<AtomicBool>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every unit containing an audit write fail, to exercise rollback.
    pub fn set_audit_write_failure(&self, fail: bool) {
        self.reject_audit_writes.store(fail, Ordering::SeqCst);
    }

    pub async fn all_transactions(&self) -> Vec<EscrowTransaction> {
        let tables = self.tables.read().await;
        let mut rows: Vec<_> = tables.transactions.values().cloned().collect();
        rows.sort_by_key(|row| row.created_at);
        rows
    }

    pub async fn audit_len(&self) -> usize {
        self.tables.read().await.audit.len()
    }
}

fn version_conflict(entity: &'static str, id: impl ToString) -> StoreError {
    StoreError::VersionConflict {
        entity,
        id: id.to_string(),
    }
}

fn not_found(entity: &'static str, id: impl ToString) -> StoreError {
    StoreError::NotFound {
        entity,
        id: id.to_string(),
    }
}

impl Tables {
    fn apply(&mut self, write: Write, reject_audit: bool) -> Result<(), StoreError> {
        match write {
            Write::InsertProject(project) => {
                if self.projects.contains_key(&project.id) {
                    return Err(StoreError::UniqueViolation("projects_pkey".to_string()));
                }
                self.projects.insert(project.id, project);
            }
            Write::UpdateProject { row, expected_version } => {
                let current = self
                    .projects
                    .get_mut(&row.id)
                    .ok_or_else(|| not_found("project", row.id))?;
                if current.version != expected_version {
                    return Err(version_conflict("project", row.id));
                }
                *current = row;
            }
            Write::InsertMilestone(milestone) => {
                if !self.projects.contains_key(&milestone.project_id) {
                    return Err(not_found("project", milestone.project_id));
                }
                let taken = self.milestones.values().any(|m| {
                    m.project_id == milestone.project_id && m.order_index == milestone.order_index
                });
                if taken || self.milestones.contains_key(&milestone.id) {
                    return Err(StoreError::UniqueViolation(constraints::MILESTONE_ORDER.to_string()));
                }
                self.milestones.insert(milestone.id, milestone);
            }
            Write::UpdateMilestone { row, expected_version } => {
                let current = self
                    .milestones
                    .get_mut(&row.id)
                    .ok_or_else(|| not_found("milestone", row.id))?;
                if current.version != expected_version {
                    return Err(version_conflict("milestone", row.id));
                }
                *current = row;
            }
            Write::InsertTransaction(transaction) => {
                if !self.projects.contains_key(&transaction.project_id) {
                    return Err(not_found("project", transaction.project_id));
                }
                self.check_transaction_unique(&transaction)?;
                self.transactions.insert(transaction.id, transaction);
            }
            Write::UpdateTransaction { row, expected_status } => {
                self.check_transaction_unique(&row)?;
                let current = self
                    .transactions
                    .get_mut(&row.id)
                    .ok_or_else(|| not_found("escrow transaction", row.id))?;
                if current.status == TransactionStatus::Completed || current.status != expected_status {
                    return Err(version_conflict("escrow transaction", row.id));
                }
                *current = row;
            }
            Write::InsertDispute(dispute) => {
                if dispute.status.is_open() && self.has_open_dispute(dispute.milestone_id, dispute.id) {
                    return Err(StoreError::UniqueViolation(constraints::OPEN_DISPUTE.to_string()));
                }
                self.disputes.insert(dispute.id, dispute);
            }
            Write::UpdateDispute { row, expected_version } => {
                if row.status.is_open() && self.has_open_dispute(row.milestone_id, row.id) {
                    return Err(StoreError::UniqueViolation(constraints::OPEN_DISPUTE.to_string()));
                }
                let current = self
                    .disputes
                    .get_mut(&row.id)
                    .ok_or_else(|| not_found("dispute", row.id))?;
                if current.version != expected_version {
                    return Err(version_conflict("dispute", row.id));
                }
                *current = row;
            }
            Write::InsertWebhookEvent(event) => {
                if self.webhook_events.contains_key(&event.external_id) {
                    return Err(StoreError::UniqueViolation(constraints::WEBHOOK_EVENT_ID.to_string()));
                }
                self.webhook_events.insert(event.external_id.clone(), event);
            }
            Write::UpdateWebhookEvent { row, expected_status } => {
                let current = self
                    .webhook_events
                    .get_mut(&row.external_id)
                    .ok_or_else(|| not_found("webhook event", &row.external_id))?;
                if current.status != expected_status {
                    return Err(version_conflict("webhook event", &row.external_id));
                }
                *current = row;
            }
            Write::InsertAudit(entry) => {
                if reject_audit {
                    return Err(StoreError::Unavailable("audit_entries rejected the write".to_string()));
                }
                self.audit.push(entry);
            }
        }
        Ok(())
    }

    fn check_transaction_unique(&self, row: &EscrowTransaction) -> Result<(), StoreError> {
        for other in self.transactions.values().filter(|other| other.id != row.id) {
            if row.external_reference.is_some() && other.external_reference == row.external_reference {
                return Err(StoreError::UniqueViolation(
                    constraints::TRANSACTION_REFERENCE.to_string(),
                ));
            }
            if row.operation_id.is_some() && other.operation_id == row.operation_id {
                return Err(StoreError::UniqueViolation(
                    constraints::TRANSACTION_OPERATION.to_string(),
                ));
            }
        }
        Ok(())
    }

    fn has_open_dispute(&self, milestone_id: Uuid, except: Uuid) -> bool {
        self.disputes
            .values()
            .any(|d| d.milestone_id == milestone_id && d.id != except && d.status.is_open())
    }
}

#[async_trait]
impl EscrowStore for MemoryStore {
    async fn project(&self, id: Uuid) -> Result<Option<Project>, StoreError> {
        Ok(self.tables.read().await.projects.get(&id).cloned())
    }

    async fn milestone(&self, id: Uuid) -> Result<Option<Milestone>, StoreError> {
        Ok(self.tables.read().await.milestones.get(&id).cloned())
    }

    async fn project_milestones(&self, project_id: Uuid) -> Result<Vec<Milestone>, StoreError> {
        let tables = self.tables.read().await;
        let mut rows: Vec<_> = tables
            .milestones
            .values()
            .filter(|m| m.project_id == project_id)
            .cloned()
            .collect();
        rows.sort_by_key(|m| m.order_index);
        Ok(rows)
    }

    async fn submitted_milestones_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<Milestone>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables
            .milestones
            .values()
            .filter(|m| {
                m.status == MilestoneStatus::Submitted && m.submitted_at.map_or(false, |at| at <= cutoff)
            })
            .cloned()
            .collect())
    }

    async fn transaction(&self, id: Uuid) -> Result<Option<EscrowTransaction>, StoreError> {
        Ok(self.tables.read().await.transactions.get(&id).cloned())
    }

    async fn transaction_by_reference(&self, reference: &str) -> Result<Option<EscrowTransaction>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables
            .transactions
            .values()
            .find(|t| t.external_reference.as_deref() == Some(reference))
            .cloned())
    }

    async fn transaction_by_operation(&self, operation_id: &str) -> Result<Option<EscrowTransaction>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables
            .transactions
            .values()
            .find(|t| t.operation_id.as_deref() == Some(operation_id))
            .cloned())
    }

    async fn project_transactions(&self, project_id: Uuid) -> Result<Vec<EscrowTransaction>, StoreError> {
        let tables = self.tables.read().await;
        let mut rows: Vec<_> = tables
            .transactions
            .values()
            .filter(|t| t.project_id == project_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(rows)
    }

    async fn undispatched_transactions(&self) -> Result<Vec<EscrowTransaction>, StoreError> {
        let tables = self.tables.read().await;
        let mut rows: Vec<_> = tables
            .transactions
            .values()
            .filter(|t| t.is_pending() && t.external_reference.is_none() && t.kind != TransactionType::Deposit)
            .cloned()
            .collect();
        rows.sort_by_key(|t| t.created_at);
        Ok(rows)
    }

    async fn dispute(&self, id: Uuid) -> Result<Option<Dispute>, StoreError> {
        Ok(self.tables.read().await.disputes.get(&id).cloned())
    }

    async fn open_dispute_for_milestone(&self, milestone_id: Uuid) -> Result<Option<Dispute>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables
            .disputes
            .values()
            .find(|d| d.milestone_id == milestone_id && d.status.is_open())
            .cloned())
    }

    async fn project_open_disputes(&self, project_id: Uuid) -> Result<Vec<Dispute>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables
            .disputes
            .values()
            .filter(|d| d.project_id == project_id && d.status.is_open())
            .cloned()
            .collect())
    }

    async fn mediations_started_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<Dispute>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables
            .disputes
            .values()
            .filter(|d| {
                d.status == DisputeStatus::Mediation
                    && d.mediation_started_at.map_or(false, |at| at <= cutoff)
            })
            .cloned()
            .collect())
    }

    async fn webhook_event(&self, external_id: &str) -> Result<Option<WebhookEvent>, StoreError> {
        Ok(self.tables.read().await.webhook_events.get(external_id).cloned())
    }

    async fn retryable_webhook_events(
        &self,
        max_retries: i32,
        stale_before: DateTime<Utc>,
    ) -> Result<Vec<WebhookEvent>, StoreError> {
        let tables = self.tables.read().await;
        let mut rows: Vec<_> = tables
            .webhook_events
            .values()
            .filter(|e| match e.status {
                WebhookEventStatus::Failed => e.retry_count < max_retries && e.escalated_at.is_none(),
                WebhookEventStatus::Processing | WebhookEventStatus::Received => e.updated_at < stale_before,
                WebhookEventStatus::Success => false,
            })
            .cloned()
            .collect();
        rows.sort_by_key(|e| e.received_at);
        Ok(rows)
    }

    async fn audit_entries(&self, query: &AuditQuery) -> Result<Vec<AuditEntry>, StoreError> {
        let tables = self.tables.read().await;
        let mut rows: Vec<_> = tables.audit.iter().filter(|e| query.matches(e)).cloned().collect();
        // audit is append-only, so reverse insertion order is newest first
        rows.reverse();
        Ok(rows
            .into_iter()
            .skip(query.offset.max(0) as usize)
            .take(query.limit.max(0) as usize)
            .collect())
    }

    async fn purge_audit_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut tables = self.tables.write().await;
        let before = tables.audit.len();
        tables.audit.retain(|e| e.created_at >= cutoff);
        Ok((before - tables.audit.len()) as u64)
    }

    async fn commit(&self, writes: Vec<Write>) -> Result<(), StoreError> {
        let reject_audit = self.reject_audit_writes.load(Ordering::SeqCst);
        let mut tables = self.tables.write().await;
        let mut staged = tables.clone();
        for write in writes {
            staged.apply(write, reject_audit)?;
        }
        *tables = staged;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::store::UnitOfWork;
    use assert_matches::assert_matches;
    use sqlx::types::BigDecimal;

    fn project() -> Project {
        Project::new(
            Uuid::new_v4(),
            Some(Uuid::new_v4()),
            "Store test".to_string(),
            BigDecimal::from(100),
            "USD".to_string(),
            true,
        )
    }

    #[tokio::test]
    async fn stale_version_rejects_whole_unit() {
        let store = MemoryStore::new();
        let mut p = project();
        let mut uow = UnitOfWork::new();
        uow.insert_project(&p);
        store.commit(uow.into_parts().0).await.unwrap();

        let mut first = p.clone();
        let mut uow = UnitOfWork::new();
        uow.save_project(&mut first);
        store.commit(uow.into_parts().0).await.unwrap();

        // second writer still holds version 0
        let tx = EscrowTransaction::pending(p.id, None, TransactionType::Deposit, BigDecimal::from(100), None);
        let mut uow = UnitOfWork::new();
        uow.insert_transaction(&tx);
        uow.save_project(&mut p);
        let err = store.commit(uow.into_parts().0).await.unwrap_err();
        assert_matches!(err, StoreError::VersionConflict { entity: "project", .. });

        // the transaction insert that preceded the conflict was rolled back
        assert!(store.transaction(tx.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn external_reference_is_unique() {
        let store = MemoryStore::new();
        let p = project();
        let mut a = EscrowTransaction::pending(p.id, None, TransactionType::Deposit, BigDecimal::from(1), None);
        a.external_reference = Some("ch_1".to_string());
        let mut b = a.clone();
        b.id = Uuid::new_v4();

        let mut uow = UnitOfWork::new();
        uow.insert_project(&p);
        uow.insert_transaction(&a);
        store.commit(uow.into_parts().0).await.unwrap();

        let mut uow = UnitOfWork::new();
        uow.insert_transaction(&b);
        let err = store.commit(uow.into_parts().0).await.unwrap_err();
        assert_matches!(err, StoreError::UniqueViolation(c) if c == constraints::TRANSACTION_REFERENCE);
    }

    #[tokio::test]
    async fn completed_transactions_are_immutable() {
        let store = MemoryStore::new();
        let p = project();
        let mut tx = EscrowTransaction::pending(p.id, None, TransactionType::Deposit, BigDecimal::from(1), None);
        tx.status = TransactionStatus::Completed;

        let mut uow = UnitOfWork::new();
        uow.insert_project(&p);
        uow.insert_transaction(&tx);
        store.commit(uow.into_parts().0).await.unwrap();

        let mut changed = tx.clone();
        changed.status = TransactionStatus::Failed;
        let mut uow = UnitOfWork::new();
        uow.save_transaction(&changed, TransactionStatus::Completed);
        assert!(store.commit(uow.into_parts().0).await.is_err());
    }
}
