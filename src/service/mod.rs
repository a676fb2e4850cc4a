pub mod advisory_service;
pub mod audit_service;
pub mod background_jobs;
pub mod concurrency;
pub mod dispute_service;
pub mod error;
pub mod escrow_service;
pub mod milestone_service;
pub mod notification_service;
pub mod payment_provider;
pub mod project_service;
pub mod webhook_service;

use uuid::Uuid;

use crate::{
    db::store::{EscrowStore, UnitOfWork},
    models::{
        actor::OperationContext,
        auditmodel::entity_types,
        disputemodel::Dispute,
        escrowmodel::EscrowTransaction,
        milestonemodel::Milestone,
        projectmodel::Project,
    },
};
use audit_service::AuditService;
use error::ServiceError;
use notification_service::{NotificationDispatcher, TransitionNotice};

/// Commits the unit, then hands its notices to the dispatcher.
pub(crate) async fn commit_unit(
    store: &dyn EscrowStore,
    notifier: &dyn NotificationDispatcher,
    uow: UnitOfWork,
) -> Result<(), ServiceError> {
    let (writes, notices) = uow.into_parts();
    store.commit(writes).await?;
    for notice in notices {
        notifier.dispatch(notice);
    }
    Ok(())
}

pub(crate) async fn load_project(store: &dyn EscrowStore, id: Uuid) -> Result<Project, ServiceError> {
    store
        .project(id)
        .await?
        .ok_or_else(|| ServiceError::not_found("project", id))
}

pub(crate) async fn load_milestone(store: &dyn EscrowStore, id: Uuid) -> Result<Milestone, ServiceError> {
    store
        .milestone(id)
        .await?
        .ok_or_else(|| ServiceError::not_found("milestone", id))
}

pub(crate) async fn load_dispute(store: &dyn EscrowStore, id: Uuid) -> Result<Dispute, ServiceError> {
    store
        .dispute(id)
        .await?
        .ok_or_else(|| ServiceError::not_found("dispute", id))
}

pub(crate) async fn load_transaction(store: &dyn EscrowStore, id: Uuid) -> Result<EscrowTransaction, ServiceError> {
    store
        .transaction(id)
        .await?
        .ok_or_else(|| ServiceError::not_found("escrow transaction", id))
}

/// Queues the project update with its audit entry and, on a status change,
/// its transition notice.
pub(crate) fn stage_project(
    uow: &mut UnitOfWork,
    audit: &AuditService,
    ctx: &OperationContext,
    action: &str,
    before: &Project,
    project: &mut Project,
) {
    uow.save_project(project);
    audit.log_project_change(uow, ctx, action, Some(before), project);
    if before.status != project.status {
        uow.notify(TransitionNotice::new(
            entity_types::PROJECT,
            project.id,
            Some(before.status.to_str()),
            project.status.to_str(),
        ));
    }
}

pub(crate) fn stage_milestone(
    uow: &mut UnitOfWork,
    audit: &AuditService,
    ctx: &OperationContext,
    action: &str,
    before: &Milestone,
    milestone: &mut Milestone,
) {
    uow.save_milestone(milestone);
    audit.log_milestone_change(uow, ctx, action, Some(before), milestone);
    if before.status != milestone.status {
        uow.notify(TransitionNotice::new(
            entity_types::MILESTONE,
            milestone.id,
            Some(before.status.to_str()),
            milestone.status.to_str(),
        ));
    }
}

pub(crate) fn stage_dispute(
    uow: &mut UnitOfWork,
    audit: &AuditService,
    ctx: &OperationContext,
    action: &str,
    before: &Dispute,
    dispute: &mut Dispute,
) {
    uow.save_dispute(dispute);
    audit.log_dispute_change(uow, ctx, action, Some(before), dispute);
    if before.status != dispute.status {
        uow.notify(TransitionNotice::new(
            entity_types::DISPUTE,
            dispute.id,
            Some(before.status.to_str()),
            dispute.status.to_str(),
        ));
    }
}
