// service/audit_service.rs
use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::{
    db::store::{EscrowStore, UnitOfWork},
    models::{
        actor::OperationContext,
        auditmodel::{entity_types, AuditEntry, AuditQuery},
        disputemodel::Dispute,
        escrowmodel::EscrowTransaction,
        milestonemodel::Milestone,
        projectmodel::Project,
    },
    service::error::ServiceError,
};

pub const DEFAULT_PAGE_SIZE: i64 = 50;
pub const MAX_PAGE_SIZE: i64 = 500;

/// Records audit entries into the caller's unit of work, so an entry exists
/// exactly when the change it describes was committed.
#[derive(Clone)]
pub struct AuditService {
    store: Arc<dyn EscrowStore>,
}

impl AuditService {
    pub fn new(store: Arc<dyn EscrowStore>) -> Self {
        Self { store }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn record(
        &self,
        uow: &mut UnitOfWork,
        ctx: &OperationContext,
        action: &str,
        entity_type: &str,
        entity_id: impl ToString,
        old_values: Option<serde_json::Value>,
        new_values: Option<serde_json::Value>,
    ) -> AuditEntry {
        let entry = AuditEntry {
            id: Uuid::new_v4(),
            action: action.to_string(),
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            actor_id: ctx.actor.id(),
            old_values,
            new_values,
            correlation_id: Some(ctx.correlation_id),
            created_at: Utc::now(),
        };
        uow.insert_audit(entry.clone());
        entry
    }

    pub fn log_project_change(
        &self,
        uow: &mut UnitOfWork,
        ctx: &OperationContext,
        action: &str,
        before: Option<&Project>,
        after: &Project,
    ) -> AuditEntry {
        self.record(
            uow,
            ctx,
            action,
            entity_types::PROJECT,
            after.id,
            before.map(Project::audit_snapshot),
            Some(after.audit_snapshot()),
        )
    }

    pub fn log_milestone_change(
        &self,
        uow: &mut UnitOfWork,
        ctx: &OperationContext,
        action: &str,
        before: Option<&Milestone>,
        after: &Milestone,
    ) -> AuditEntry {
        self.record(
            uow,
            ctx,
            action,
            entity_types::MILESTONE,
            after.id,
            before.map(Milestone::audit_snapshot),
            Some(after.audit_snapshot()),
        )
    }

    pub fn log_transaction(
        &self,
        uow: &mut UnitOfWork,
        ctx: &OperationContext,
        action: &str,
        before: Option<&EscrowTransaction>,
        after: &EscrowTransaction,
    ) -> AuditEntry {
        self.record(
            uow,
            ctx,
            action,
            entity_types::ESCROW_TRANSACTION,
            after.id,
            before.map(EscrowTransaction::audit_snapshot),
            Some(after.audit_snapshot()),
        )
    }

    pub fn log_dispute_change(
        &self,
        uow: &mut UnitOfWork,
        ctx: &OperationContext,
        action: &str,
        before: Option<&Dispute>,
        after: &Dispute,
    ) -> AuditEntry {
        self.record(
            uow,
            ctx,
            action,
            entity_types::DISPUTE,
            after.id,
            before.map(Dispute::audit_snapshot),
            Some(after.audit_snapshot()),
        )
    }

    pub async fn query(&self, mut query: AuditQuery) -> Result<Vec<AuditEntry>, ServiceError> {
        if let (Some(from), Some(to)) = (query.from, query.to) {
            if from >= to {
                return Err(ServiceError::Validation("`from` must be before `to`".to_string()));
            }
        }
        query.limit = match query.limit {
            l if l <= 0 => DEFAULT_PAGE_SIZE,
            l => l.min(MAX_PAGE_SIZE),
        };
        query.offset = query.offset.max(0);
        Ok(self.store.audit_entries(&query).await?)
    }

    pub async fn entries_for_entity(
        &self,
        entity_type: &str,
        entity_id: impl ToString,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<AuditEntry>, ServiceError> {
        self.query(AuditQuery {
            entity_type: Some(entity_type.to_string()),
            entity_id: Some(entity_id.to_string()),
            limit,
            offset,
            ..Default::default()
        })
        .await
    }

    pub async fn entries_for_actor(&self, actor_id: Uuid, limit: i64, offset: i64) -> Result<Vec<AuditEntry>, ServiceError> {
        self.query(AuditQuery {
            actor_id: Some(actor_id),
            limit,
            offset,
            ..Default::default()
        })
        .await
    }

    pub async fn entries_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        action: Option<String>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<AuditEntry>, ServiceError> {
        self.query(AuditQuery {
            from: Some(from),
            to: Some(to),
            action,
            limit,
            offset,
            ..Default::default()
        })
        .await
    }

    /// Retention sweep. The only path that removes entries.
    pub async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, ServiceError> {
        let removed = self.store.purge_audit_before(cutoff).await?;
        if removed > 0 {
            tracing::info!(removed, cutoff = %cutoff, "Purged expired audit entries");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        db::memorydb::MemoryStore,
        models::{actor::Actor, auditmodel::actions},
    };
    use chrono::Duration;

    #[tokio::test]
    async fn recorded_entries_are_queryable_newest_first() {
        let store = Arc::new(MemoryStore::new());
        let audit = AuditService::new(store.clone());
        let user = Uuid::new_v4();
        let ctx = OperationContext::new(Actor::User(user));
        let entity = Uuid::new_v4();

        let mut uow = UnitOfWork::new();
        audit.record(&mut uow, &ctx, actions::MILESTONE_STARTED, entity_types::MILESTONE, entity, None, None);
        audit.record(&mut uow, &ctx, actions::MILESTONE_SUBMITTED, entity_types::MILESTONE, entity, None, None);
        store.commit(uow.into_parts().0).await.unwrap();

        let entries = audit.entries_for_entity(entity_types::MILESTONE, entity, 10, 0).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].action, actions::MILESTONE_SUBMITTED);
        assert_eq!(entries[0].actor_id, Some(user));
        assert_eq!(entries[0].correlation_id, Some(ctx.correlation_id));

        let page = audit.entries_for_actor(user, 1, 1).await.unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].action, actions::MILESTONE_STARTED);
    }

    #[tokio::test]
    async fn retention_removes_only_old_entries() {
        let store = Arc::new(MemoryStore::new());
        let audit = AuditService::new(store.clone());
        let ctx = OperationContext::system();

        let mut uow = UnitOfWork::new();
        let mut old = audit.record(&mut uow, &ctx, actions::PROJECT_CREATED, entity_types::PROJECT, "p", None, None);
        // replace the queued entry with a back-dated copy
        let mut uow = UnitOfWork::new();
        old.created_at = Utc::now() - Duration::days(400);
        uow.insert_audit(old);
        audit.record(&mut uow, &ctx, actions::PROJECT_ACCEPTED, entity_types::PROJECT, "p", None, None);
        store.commit(uow.into_parts().0).await.unwrap();

        let removed = audit.purge_older_than(Utc::now() - Duration::days(365)).await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.audit_len().await, 1);
    }

    #[tokio::test]
    async fn inverted_range_is_rejected() {
        let audit = AuditService::new(Arc::new(MemoryStore::new()));
        let now = Utc::now();
        let err = audit.entries_between(now, now - Duration::hours(1), None, 10, 0).await.unwrap_err();
        assert!(matches!(err, ServiceError::Validation(_)));
    }
}
