// service/milestone_service.rs
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use uuid::Uuid;

use super::{
    audit_service::AuditService,
    commit_unit,
    concurrency::{retry_on_conflict, AggregateGuard, AggregateKey, AggregateLocks},
    dispute_service::DisputeService,
    error::ServiceError,
    escrow_service::{EscrowService, LedgerReceipt, ReleaseRequest},
    load_milestone, load_project,
    notification_service::NotificationDispatcher,
    stage_milestone, stage_project,
};
use crate::{
    db::store::{EscrowStore, UnitOfWork},
    models::{
        actor::{Actor, OperationContext},
        auditmodel::actions,
        disputemodel::Dispute,
        milestonemodel::{Milestone, MilestoneStatus},
        projectmodel::{Project, ProjectStatus},
    },
};

pub const REVISION_LIMIT_REASON: &str = "revision limit exceeded";

#[derive(Debug, Clone)]
pub struct MilestonePolicy {
    pub auto_approval_period: Duration,
    pub max_revisions: i32,
    pub auto_release: bool,
}

impl Default for MilestonePolicy {
    fn default() -> Self {
        Self {
            auto_approval_period: Duration::days(7),
            max_revisions: 3,
            auto_release: true,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ApprovalOutcome {
    pub milestone: Milestone,
    /// Present when auto-release paid the milestone out.
    pub release: Option<LedgerReceipt>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RevisionOutcome {
    pub milestone: Milestone,
    /// Opened when the request went over the revision cap.
    pub dispute: Option<Dispute>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub approved: usize,
    pub skipped: usize,
}

#[derive(Clone)]
pub struct MilestoneService {
    store: Arc<dyn EscrowStore>,
    audit: AuditService,
    notifier: Arc<dyn NotificationDispatcher>,
    locks: AggregateLocks,
    escrow: EscrowService,
    disputes: DisputeService,
    policy: MilestonePolicy,
}

impl MilestoneService {
    pub fn new(
        store: Arc<dyn EscrowStore>,
        audit: AuditService,
        notifier: Arc<dyn NotificationDispatcher>,
        locks: AggregateLocks,
        escrow: EscrowService,
        disputes: DisputeService,
        policy: MilestonePolicy,
    ) -> Self {
        Self {
            store,
            audit,
            notifier,
            locks,
            escrow,
            disputes,
            policy,
        }
    }

    pub async fn get(&self, milestone_id: Uuid) -> Result<Milestone, ServiceError> {
        load_milestone(&*self.store, milestone_id).await
    }

    pub async fn list(&self, project_id: Uuid) -> Result<Vec<Milestone>, ServiceError> {
        load_project(&*self.store, project_id).await?;
        Ok(self.store.project_milestones(project_id).await?)
    }

    async fn lock(&self, milestone_id: Uuid) -> Result<(AggregateGuard, Project, Milestone), ServiceError> {
        let located = load_milestone(&*self.store, milestone_id).await?;
        let guard = self
            .locks
            .acquire(&[
                AggregateKey::Project(located.project_id),
                AggregateKey::Milestone(located.id),
            ])
            .await;
        let project = load_project(&*self.store, located.project_id).await?;
        let milestone = load_milestone(&*self.store, located.id).await?;
        Ok((guard, project, milestone))
    }

    fn require_freelancer(project: &Project, ctx: &OperationContext, action: &'static str) -> Result<(), ServiceError> {
        match ctx.actor {
            Actor::User(id) if project.is_freelancer(id) => Ok(()),
            _ => Err(ServiceError::Forbidden {
                actor: ctx.actor.describe(),
                action,
            }),
        }
    }

    fn require_client(project: &Project, ctx: &OperationContext, action: &'static str) -> Result<(), ServiceError> {
        match ctx.actor {
            Actor::User(id) if project.is_client(id) => Ok(()),
            _ => Err(ServiceError::Forbidden {
                actor: ctx.actor.describe(),
                action,
            }),
        }
    }

    fn ensure_transition(milestone: &Milestone, next: MilestoneStatus) -> Result<(), ServiceError> {
        if milestone.status.can_transition_to(next) {
            Ok(())
        } else {
            Err(ServiceError::conflict(format!(
                "milestone {} cannot move from {} to {}",
                milestone.id, milestone.status, next
            )))
        }
    }

    /// Saves a single-milestone transition and its audit entry.
    async fn commit_transition(
        &self,
        ctx: &OperationContext,
        action: &str,
        before: &Milestone,
        milestone: &mut Milestone,
    ) -> Result<(), ServiceError> {
        let mut uow = UnitOfWork::new();
        stage_milestone(&mut uow, &self.audit, ctx, action, before, milestone);
        commit_unit(&*self.store, &*self.notifier, uow).await
    }

    // -----------------------------------------------------------------------
    // Freelancer actions
    // -----------------------------------------------------------------------

    /// `pending -> in_progress`, subject to the sequencing policy.
    pub async fn start(&self, milestone_id: Uuid, ctx: &OperationContext) -> Result<Milestone, ServiceError> {
        retry_on_conflict(|| async move {
            let (_guard, project, mut milestone) = self.lock(milestone_id).await?;
            Self::require_freelancer(&project, ctx, "start this milestone")?;
            let open_for_work = match project.status {
                ProjectStatus::Active => true,
                // a dispute freezes only the milestone it is about
                ProjectStatus::Disputed => self.store.open_dispute_for_milestone(milestone.id).await?.is_none(),
                _ => false,
            };
            if !open_for_work {
                return Err(ServiceError::conflict(format!(
                    "project {} is {}; work cannot start",
                    project.id,
                    project.status.to_str()
                )));
            }
            Self::ensure_transition(&milestone, MilestoneStatus::InProgress)?;

            if project.sequential {
                let siblings = self.store.project_milestones(project.id).await?;
                if let Some(blocker) = siblings
                    .iter()
                    .filter(|m| m.order_index < milestone.order_index)
                    .find(|m| !m.status.clears_sequence())
                {
                    return Err(ServiceError::conflict(format!(
                        "milestone {} ({}) must be approved before milestone {} can start",
                        blocker.order_index, blocker.status, milestone.order_index
                    )));
                }
            }

            let before = milestone.clone();
            milestone.status = MilestoneStatus::InProgress;
            self.commit_transition(ctx, actions::MILESTONE_STARTED, &before, &mut milestone)
                .await?;
            tracing::info!(milestone_id = %milestone.id, project_id = %project.id, "Milestone started");
            Ok(milestone)
        })
        .await
    }

    /// `in_progress -> submitted`.
    pub async fn submit(&self, milestone_id: Uuid, ctx: &OperationContext) -> Result<Milestone, ServiceError> {
        retry_on_conflict(|| async move {
            let (_guard, project, mut milestone) = self.lock(milestone_id).await?;
            Self::require_freelancer(&project, ctx, "submit this milestone")?;
            Self::ensure_transition(&milestone, MilestoneStatus::Submitted)?;

            let before = milestone.clone();
            milestone.status = MilestoneStatus::Submitted;
            milestone.submitted_at = Some(Utc::now());
            self.commit_transition(ctx, actions::MILESTONE_SUBMITTED, &before, &mut milestone)
                .await?;
            tracing::info!(milestone_id = %milestone.id, "Milestone submitted for review");
            Ok(milestone)
        })
        .await
    }

    /// `revision_requested -> in_progress`.
    pub async fn resubmit(&self, milestone_id: Uuid, ctx: &OperationContext) -> Result<Milestone, ServiceError> {
        retry_on_conflict(|| async move {
            let (_guard, project, mut milestone) = self.lock(milestone_id).await?;
            Self::require_freelancer(&project, ctx, "resume this milestone")?;
            Self::ensure_transition(&milestone, MilestoneStatus::InProgress)?;
            if milestone.status != MilestoneStatus::RevisionRequested {
                return Err(ServiceError::conflict(format!(
                    "milestone {} is {}, not revision_requested",
                    milestone.id, milestone.status
                )));
            }

            let before = milestone.clone();
            milestone.status = MilestoneStatus::InProgress;
            self.commit_transition(ctx, actions::MILESTONE_RESUBMITTED, &before, &mut milestone)
                .await?;
            Ok(milestone)
        })
        .await
    }

    // -----------------------------------------------------------------------
    // Client actions
    // -----------------------------------------------------------------------

    /// `submitted -> approved`, followed by auto-release when enabled.
    pub async fn approve(&self, milestone_id: Uuid, ctx: &OperationContext) -> Result<ApprovalOutcome, ServiceError> {
        let milestone = retry_on_conflict(|| async move {
            let (_guard, project, mut milestone) = self.lock(milestone_id).await?;
            Self::require_client(&project, ctx, "approve this milestone")?;
            Self::ensure_transition(&milestone, MilestoneStatus::Approved)?;

            let before = milestone.clone();
            milestone.status = MilestoneStatus::Approved;
            milestone.approved_at = Some(Utc::now());
            self.commit_transition(ctx, actions::MILESTONE_APPROVED, &before, &mut milestone)
                .await?;
            tracing::info!(milestone_id = %milestone.id, "Milestone approved");
            Ok(milestone)
        })
        .await?;

        let release = self.auto_release(&milestone, ctx).await;
        let milestone = match release {
            Some(_) => load_milestone(&*self.store, milestone.id).await?,
            None => milestone,
        };
        Ok(ApprovalOutcome { milestone, release })
    }

    /// Releases an approved milestone as a separate operation. A dispute
    /// raised in between wins; the failure is logged, not retried.
    async fn auto_release(&self, milestone: &Milestone, ctx: &OperationContext) -> Option<LedgerReceipt> {
        if !self.policy.auto_release {
            return None;
        }
        let request = ReleaseRequest {
            milestone_id: milestone.id,
            amount: milestone.amount.clone(),
            operation_id: Some(format!("auto-release:{}", milestone.id)),
        };
        match self.escrow.release(request, ctx).await {
            Ok(receipt) => Some(receipt),
            Err(e) => {
                tracing::warn!(milestone_id = %milestone.id, error = %e, "Auto-release skipped");
                None
            }
        }
    }

    /// `submitted -> revision_requested`. Going over the cap opens a dispute
    /// in the same unit instead.
    pub async fn request_revision(
        &self,
        milestone_id: Uuid,
        note: Option<String>,
        ctx: &OperationContext,
    ) -> Result<RevisionOutcome, ServiceError> {
        let note = &note;
        let (outcome, fee) = retry_on_conflict(|| async move {
            let (_guard, mut project, mut milestone) = self.lock(milestone_id).await?;
            Self::require_client(&project, ctx, "request a revision")?;
            Self::ensure_transition(&milestone, MilestoneStatus::RevisionRequested)?;

            let before_milestone = milestone.clone();
            let mut uow = UnitOfWork::new();

            if milestone.revision_count >= self.policy.max_revisions {
                let before_project = project.clone();
                let client_id = project.client_id;
                let (dispute, fee) = self
                    .disputes
                    .plan_raise(
                        &mut uow,
                        ctx,
                        &mut project,
                        &mut milestone,
                        client_id,
                        REVISION_LIMIT_REASON,
                    )
                    .await?;
                stage_milestone(&mut uow, &self.audit, ctx, actions::DISPUTE_RAISED, &before_milestone, &mut milestone);
                stage_project(&mut uow, &self.audit, ctx, actions::DISPUTE_RAISED, &before_project, &mut project);
                commit_unit(&*self.store, &*self.notifier, uow).await?;
                tracing::warn!(
                    milestone_id = %milestone.id,
                    dispute_id = %dispute.id,
                    revisions = milestone.revision_count,
                    "Revision cap reached, dispute opened"
                );
                return Ok((
                    RevisionOutcome {
                        milestone,
                        dispute: Some(dispute),
                    },
                    fee,
                ));
            }

            milestone.status = MilestoneStatus::RevisionRequested;
            milestone.revision_count += 1;
            stage_milestone(&mut uow, &self.audit, ctx, actions::REVISION_REQUESTED, &before_milestone, &mut milestone);
            if let Some(note) = note {
                tracing::debug!(milestone_id = %milestone.id, note = %note, "Revision note");
            }
            commit_unit(&*self.store, &*self.notifier, uow).await?;
            Ok((
                RevisionOutcome {
                    milestone,
                    dispute: None,
                },
                None,
            ))
        })
        .await?;

        if let Some(dispute) = &outcome.dispute {
            self.disputes.after_raise(dispute, fee.as_ref(), &outcome.milestone).await?;
        }
        Ok(outcome)
    }

    // -----------------------------------------------------------------------
    // Auto-approval
    // -----------------------------------------------------------------------

    /// Approves milestones left in `submitted` past the auto-approval period.
    /// A milestone whose lock is held by a human action is skipped this round
    /// and re-read next round, so a concurrent dispute always wins.
    pub async fn run_auto_approval_sweep(&self, now: DateTime<Utc>) -> Result<SweepReport, ServiceError> {
        let cutoff = now - self.policy.auto_approval_period;
        let ctx = OperationContext::system();
        let mut report = SweepReport::default();

        for candidate in self.store.submitted_milestones_before(cutoff).await? {
            let Some(guard) = self
                .locks
                .try_acquire(&[
                    AggregateKey::Project(candidate.project_id),
                    AggregateKey::Milestone(candidate.id),
                ])
                .await
            else {
                report.skipped += 1;
                continue;
            };

            let mut milestone = load_milestone(&*self.store, candidate.id).await?;
            let still_due = milestone.status == MilestoneStatus::Submitted
                && milestone.submitted_at.is_some_and(|at| at < cutoff)
                && self.store.open_dispute_for_milestone(milestone.id).await?.is_none();
            if !still_due {
                report.skipped += 1;
                continue;
            }

            let before = milestone.clone();
            milestone.status = MilestoneStatus::Approved;
            milestone.approved_at = Some(now);
            match self
                .commit_transition(&ctx, actions::MILESTONE_AUTO_APPROVED, &before, &mut milestone)
                .await
            {
                Ok(()) => {
                    report.approved += 1;
                    tracing::info!(milestone_id = %milestone.id, "Milestone auto-approved");
                }
                Err(ServiceError::ConcurrentModification(_)) => {
                    report.skipped += 1;
                    continue;
                }
                Err(e) => return Err(e),
            }

            drop(guard);
            self.auto_release(&milestone, &ctx).await;
        }

        Ok(report)
    }
}
