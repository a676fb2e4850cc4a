// service/dispute_service.rs
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use num_traits::Zero;
use serde::Serialize;
use sqlx::types::BigDecimal;
use uuid::Uuid;

use super::{
    advisory_service::{Advice, AdvisoryContext, AdvisoryService},
    audit_service::AuditService,
    commit_unit,
    concurrency::{retry_on_conflict, AggregateGuard, AggregateKey, AggregateLocks},
    error::ServiceError,
    escrow_service::{EscrowService, ReleaseSource},
    load_dispute, load_milestone, load_project,
    notification_service::{NotificationDispatcher, TransitionNotice},
    stage_dispute, stage_milestone, stage_project,
};
use crate::{
    db::store::{EscrowStore, UnitOfWork},
    models::{
        actor::{Actor, OperationContext},
        auditmodel::{actions, entity_types},
        disputemodel::{Dispute, DisputeStatus, ResolutionDecision},
        escrowmodel::{EscrowTransaction, TransactionType},
        milestonemodel::{Milestone, MilestoneStatus},
        projectmodel::{Project, ProjectStatus},
    },
    utils::currency::split_by_percentage,
};

#[derive(Debug, Clone)]
pub struct DisputePolicy {
    /// Zero disables the fee and disputes start in `pending_review`.
    pub fee: BigDecimal,
    pub mediation_timeout: Duration,
    /// Milestones at or above this amount need an operator to confirm the
    /// arbitration decision.
    pub high_value_threshold: BigDecimal,
}

impl Default for DisputePolicy {
    fn default() -> Self {
        Self {
            fee: BigDecimal::zero(),
            mediation_timeout: Duration::hours(72),
            high_value_threshold: BigDecimal::from(100_000),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DisputeOutcome {
    pub dispute: Dispute,
    /// Ledger rows created by applying a decision.
    pub transactions: Vec<EscrowTransaction>,
}

struct Locked {
    _guard: AggregateGuard,
    project: Project,
    milestone: Milestone,
    dispute: Dispute,
}

#[derive(Clone)]
pub struct DisputeService {
    store: Arc<dyn EscrowStore>,
    audit: AuditService,
    notifier: Arc<dyn NotificationDispatcher>,
    locks: AggregateLocks,
    escrow: EscrowService,
    advisory: AdvisoryService,
    policy: DisputePolicy,
}

impl DisputeService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn EscrowStore>,
        audit: AuditService,
        notifier: Arc<dyn NotificationDispatcher>,
        locks: AggregateLocks,
        escrow: EscrowService,
        advisory: AdvisoryService,
        policy: DisputePolicy,
    ) -> Self {
        Self {
            store,
            audit,
            notifier,
            locks,
            escrow,
            advisory,
            policy,
        }
    }

    pub async fn get(&self, dispute_id: Uuid) -> Result<Dispute, ServiceError> {
        load_dispute(&*self.store, dispute_id).await
    }

    /// The cached advisory suggestion, if the background request finished.
    pub async fn advice(&self, dispute_id: Uuid) -> Result<Option<Advice>, ServiceError> {
        load_dispute(&*self.store, dispute_id).await?;
        Ok(self.advisory.advice(dispute_id).await)
    }

    async fn lock(&self, dispute_id: Uuid) -> Result<Locked, ServiceError> {
        let located = load_dispute(&*self.store, dispute_id).await?;
        let guard = self
            .locks
            .acquire(&[
                AggregateKey::Project(located.project_id),
                AggregateKey::Milestone(located.milestone_id),
                AggregateKey::Dispute(located.id),
            ])
            .await;
        Ok(Locked {
            _guard: guard,
            project: load_project(&*self.store, located.project_id).await?,
            milestone: load_milestone(&*self.store, located.milestone_id).await?,
            dispute: load_dispute(&*self.store, located.id).await?,
        })
    }

    fn require_operator(ctx: &OperationContext, action: &'static str) -> Result<(), ServiceError> {
        if matches!(ctx.actor, Actor::Operator(_) | Actor::System) {
            Ok(())
        } else {
            Err(ServiceError::Forbidden {
                actor: ctx.actor.describe(),
                action,
            })
        }
    }

    fn require_status(dispute: &Dispute, expected: DisputeStatus) -> Result<(), ServiceError> {
        if dispute.status == expected {
            Ok(())
        } else {
            Err(ServiceError::conflict(format!(
                "dispute {} is {}, not {}",
                dispute.id,
                dispute.status.to_str(),
                expected.to_str()
            )))
        }
    }

    // -----------------------------------------------------------------------
    // Raise
    // -----------------------------------------------------------------------

    pub async fn raise(&self, milestone_id: Uuid, reason: String, ctx: &OperationContext) -> Result<Dispute, ServiceError> {
        if reason.trim().is_empty() {
            return Err(ServiceError::Validation("a dispute needs a reason".to_string()));
        }
        let (dispute, fee, milestone) = retry_on_conflict(|| self.raise_once(milestone_id, &reason, ctx)).await?;
        self.after_raise(&dispute, fee.as_ref(), &milestone).await?;
        Ok(dispute)
    }

    /// Post-commit work for a dispute opened by `plan_raise`: sends the fee
    /// row to the processor and asks for an advisory.
    pub(crate) async fn after_raise(
        &self,
        dispute: &Dispute,
        fee: Option<&EscrowTransaction>,
        milestone: &Milestone,
    ) -> Result<(), ServiceError> {
        if let Some(fee) = fee {
            self.escrow.dispatch_logged(fee).await;
        }
        let project = load_project(&*self.store, dispute.project_id).await?;
        self.advisory.request(AdvisoryContext {
            dispute_id: dispute.id,
            milestone_title: milestone.title.clone(),
            milestone_amount: milestone.amount.clone(),
            revision_count: milestone.revision_count,
            reason: dispute.reason.clone(),
            raised_by_client: project.is_client(dispute.raised_by),
        });
        Ok(())
    }

    async fn raise_once(
        &self,
        milestone_id: Uuid,
        reason: &str,
        ctx: &OperationContext,
    ) -> Result<(Dispute, Option<EscrowTransaction>, Milestone), ServiceError> {
        let located = load_milestone(&*self.store, milestone_id).await?;
        let _guard = self
            .locks
            .acquire(&[
                AggregateKey::Project(located.project_id),
                AggregateKey::Milestone(located.id),
            ])
            .await;
        let mut project = load_project(&*self.store, located.project_id).await?;
        let mut milestone = load_milestone(&*self.store, located.id).await?;

        let raised_by = match ctx.actor {
            Actor::User(id) if project.is_party(id) => id,
            _ => {
                return Err(ServiceError::Forbidden {
                    actor: ctx.actor.describe(),
                    action: "raise a dispute on this milestone",
                })
            }
        };

        let before_project = project.clone();
        let before_milestone = milestone.clone();
        let mut uow = UnitOfWork::new();
        let (dispute, fee) = self.plan_raise(&mut uow, ctx, &mut project, &mut milestone, raised_by, reason).await?;
        stage_milestone(&mut uow, &self.audit, ctx, actions::DISPUTE_RAISED, &before_milestone, &mut milestone);
        stage_project(&mut uow, &self.audit, ctx, actions::DISPUTE_RAISED, &before_project, &mut project);
        commit_unit(&*self.store, &*self.notifier, uow).await?;

        tracing::info!(
            dispute_id = %dispute.id,
            milestone_id = %milestone.id,
            raised_by = %raised_by,
            status = dispute.status.to_str(),
            "Dispute raised"
        );
        Ok((dispute, fee, milestone))
    }

    /// Opens a dispute and freezes the milestone. The caller persists the
    /// project and milestone and holds their locks.
    pub async fn plan_raise(
        &self,
        uow: &mut UnitOfWork,
        ctx: &OperationContext,
        project: &mut Project,
        milestone: &mut Milestone,
        raised_by: Uuid,
        reason: &str,
    ) -> Result<(Dispute, Option<EscrowTransaction>), ServiceError> {
        if !milestone.status.can_transition_to(MilestoneStatus::Disputed) {
            return Err(ServiceError::conflict(format!(
                "milestone {} is {} and cannot be disputed",
                milestone.id, milestone.status
            )));
        }
        if !matches!(project.status, ProjectStatus::Active | ProjectStatus::Disputed) {
            return Err(ServiceError::conflict(format!(
                "project {} is {}; disputes cannot be raised",
                project.id,
                project.status.to_str()
            )));
        }
        if let Some(open) = self.store.open_dispute_for_milestone(milestone.id).await? {
            return Err(ServiceError::conflict(format!(
                "milestone {} already has open dispute {}",
                milestone.id, open.id
            )));
        }

        let mut dispute = Dispute::new(project.id, milestone.id, raised_by, reason.to_string());
        let fee = if self.policy.fee > BigDecimal::zero() {
            let fee = EscrowTransaction::pending(
                project.id,
                Some(milestone.id),
                TransactionType::Fee,
                self.policy.fee.clone(),
                None,
            );
            uow.insert_transaction(&fee);
            self.audit.log_transaction(uow, ctx, actions::FEE_CHARGED, None, &fee);
            dispute.fee_transaction_id = Some(fee.id);
            Some(fee)
        } else {
            dispute.status = DisputeStatus::PendingReview;
            None
        };

        uow.insert_dispute(&dispute);
        self.audit
            .log_dispute_change(uow, ctx, actions::DISPUTE_RAISED, None, &dispute);
        uow.notify(TransitionNotice::new(
            entity_types::DISPUTE,
            dispute.id,
            None,
            dispute.status.to_str(),
        ));

        milestone.status = MilestoneStatus::Disputed;
        project.status = ProjectStatus::Disputed;
        Ok((dispute, fee))
    }

    // -----------------------------------------------------------------------
    // Fee
    // -----------------------------------------------------------------------

    /// Manual confirmation of the dispute fee.
    pub async fn confirm_fee(
        &self,
        dispute_id: Uuid,
        external_reference: Option<String>,
        ctx: &OperationContext,
    ) -> Result<Dispute, ServiceError> {
        Self::require_operator(ctx, "confirm a dispute fee")?;
        let external_reference = &external_reference;
        retry_on_conflict(|| async move {
            let Locked { _guard, mut dispute, .. } = self.lock(dispute_id).await?;
            let fee = match dispute.fee_transaction_id {
                Some(id) => self.store.transaction(id).await?,
                None => None,
            };

            let mut uow = UnitOfWork::new();
            if let Some(fee) = fee.filter(|fee| fee.is_pending()) {
                let reference = external_reference
                    .clone()
                    .unwrap_or_else(|| format!("manual:{}", fee.id));
                self.escrow.plan_settlement(&mut uow, ctx, &fee, &reference);
            }
            self.plan_fee_confirmed(&mut uow, ctx, &mut dispute)?;
            commit_unit(&*self.store, &*self.notifier, uow).await?;
            Ok(dispute)
        })
        .await
    }

    /// `raised -> pending_review`.
    pub fn plan_fee_confirmed(
        &self,
        uow: &mut UnitOfWork,
        ctx: &OperationContext,
        dispute: &mut Dispute,
    ) -> Result<(), ServiceError> {
        Self::require_status(dispute, DisputeStatus::Raised)?;
        let before = dispute.clone();
        dispute.status = DisputeStatus::PendingReview;
        stage_dispute(uow, &self.audit, ctx, actions::DISPUTE_FEE_CONFIRMED, &before, dispute);
        Ok(())
    }

    /// Webhook path: a settled fee row confirms the open dispute on its
    /// milestone. Returns false when there is nothing left to confirm.
    pub async fn plan_fee_payment(
        &self,
        uow: &mut UnitOfWork,
        ctx: &OperationContext,
        fee: &EscrowTransaction,
    ) -> Result<bool, ServiceError> {
        let Some(milestone_id) = fee.milestone_id else {
            return Ok(false);
        };
        match self.store.open_dispute_for_milestone(milestone_id).await? {
            Some(mut dispute) if dispute.status == DisputeStatus::Raised => {
                self.plan_fee_confirmed(uow, ctx, &mut dispute)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    // -----------------------------------------------------------------------
    // Mediation
    // -----------------------------------------------------------------------

    pub async fn begin_mediation(&self, dispute_id: Uuid, ctx: &OperationContext) -> Result<Dispute, ServiceError> {
        Self::require_operator(ctx, "start mediation")?;
        retry_on_conflict(|| async move {
            let Locked { _guard, mut dispute, .. } = self.lock(dispute_id).await?;
            Self::require_status(&dispute, DisputeStatus::PendingReview)?;

            let before = dispute.clone();
            dispute.status = DisputeStatus::Mediation;
            dispute.mediation_started_at = Some(Utc::now());

            let mut uow = UnitOfWork::new();
            stage_dispute(&mut uow, &self.audit, ctx, actions::MEDIATION_STARTED, &before, &mut dispute);
            commit_unit(&*self.store, &*self.notifier, uow).await?;
            tracing::info!(dispute_id = %dispute.id, "Mediation started");
            Ok(dispute)
        })
        .await
    }

    /// Records one party's proposal. Matching proposals settle the dispute.
    pub async fn propose_settlement(
        &self,
        dispute_id: Uuid,
        decision: ResolutionDecision,
        ctx: &OperationContext,
    ) -> Result<DisputeOutcome, ServiceError> {
        decision.validate().map_err(ServiceError::Validation)?;
        let outcome = retry_on_conflict(|| async move {
            let Locked {
                _guard,
                mut project,
                mut milestone,
                mut dispute,
                ..
            } = self.lock(dispute_id).await?;
            Self::require_status(&dispute, DisputeStatus::Mediation)?;

            let before = dispute.clone();
            match ctx.actor {
                Actor::User(id) if project.is_client(id) => dispute.set_client_proposal(decision),
                Actor::User(id) if project.is_freelancer(id) => dispute.set_freelancer_proposal(decision),
                _ => {
                    return Err(ServiceError::Forbidden {
                        actor: ctx.actor.describe(),
                        action: "propose a settlement",
                    })
                }
            }

            let mut uow = UnitOfWork::new();
            self.audit
                .log_dispute_change(&mut uow, ctx, actions::SETTLEMENT_PROPOSED, Some(&before), &dispute);

            let transactions = match dispute.agreed_decision() {
                Some(agreed) => {
                    self.resolve(&mut uow, ctx, &mut project, &mut milestone, &before, &mut dispute, agreed, None)
                        .await?
                }
                None => {
                    uow.save_dispute(&mut dispute);
                    Vec::new()
                }
            };
            commit_unit(&*self.store, &*self.notifier, uow).await?;
            Ok(DisputeOutcome { dispute, transactions })
        })
        .await?;

        self.dispatch_all(&outcome.transactions).await;
        Ok(outcome)
    }

    /// Moves mediations older than the timeout into arbitration. Disputes a
    /// human is acting on right now are left for the next round.
    pub async fn escalate_stale_mediations(&self, now: DateTime<Utc>) -> Result<usize, ServiceError> {
        let cutoff = now - self.policy.mediation_timeout;
        let ctx = OperationContext::system();
        let mut escalated = 0;

        for candidate in self.store.mediations_started_before(cutoff).await? {
            let Some(_guard) = self
                .locks
                .try_acquire(&[
                    AggregateKey::Project(candidate.project_id),
                    AggregateKey::Milestone(candidate.milestone_id),
                    AggregateKey::Dispute(candidate.id),
                ])
                .await
            else {
                tracing::debug!(dispute_id = %candidate.id, "Dispute busy, skipping this round");
                continue;
            };

            let mut dispute = load_dispute(&*self.store, candidate.id).await?;
            let expired = dispute.status == DisputeStatus::Mediation
                && dispute.mediation_started_at.is_some_and(|at| at < cutoff);
            if !expired {
                continue;
            }

            let before = dispute.clone();
            dispute.status = DisputeStatus::Arbitration;
            dispute.arbitration_started_at = Some(now);
            let mut uow = UnitOfWork::new();
            stage_dispute(&mut uow, &self.audit, &ctx, actions::ARBITRATION_STARTED, &before, &mut dispute);

            match commit_unit(&*self.store, &*self.notifier, uow).await {
                Ok(()) => {
                    escalated += 1;
                    tracing::info!(dispute_id = %dispute.id, "Mediation timed out, moved to arbitration");
                }
                Err(ServiceError::ConcurrentModification(_)) => {
                    tracing::debug!(dispute_id = %dispute.id, "Dispute changed under the sweep, skipping");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(escalated)
    }

    // -----------------------------------------------------------------------
    // Arbitration
    // -----------------------------------------------------------------------

    pub async fn arbitrate(
        &self,
        dispute_id: Uuid,
        decision: ResolutionDecision,
        summary: String,
        ctx: &OperationContext,
    ) -> Result<DisputeOutcome, ServiceError> {
        Self::require_operator(ctx, "arbitrate a dispute")?;
        decision.validate().map_err(ServiceError::Validation)?;
        let summary = &summary;

        let outcome = retry_on_conflict(|| async move {
            let Locked {
                _guard,
                mut project,
                mut milestone,
                mut dispute,
                ..
            } = self.lock(dispute_id).await?;
            Self::require_status(&dispute, DisputeStatus::Arbitration)?;

            let before = dispute.clone();
            let mut uow = UnitOfWork::new();

            if milestone.amount >= self.policy.high_value_threshold {
                dispute.set_decision(decision.normalized());
                dispute.resolution_summary = Some(summary.clone());
                dispute.status = DisputeStatus::Escalated;
                dispute.escalated_at = Some(Utc::now());
                stage_dispute(&mut uow, &self.audit, ctx, actions::DISPUTE_ESCALATED, &before, &mut dispute);
                commit_unit(&*self.store, &*self.notifier, uow).await?;
                tracing::warn!(
                    dispute_id = %dispute.id,
                    amount = %milestone.amount,
                    "High-value decision escalated for operator confirmation"
                );
                return Ok(DisputeOutcome {
                    dispute,
                    transactions: Vec::new(),
                });
            }

            dispute.resolution_summary = Some(summary.clone());
            let transactions = self
                .resolve(
                    &mut uow,
                    ctx,
                    &mut project,
                    &mut milestone,
                    &before,
                    &mut dispute,
                    decision,
                    ctx.actor.id(),
                )
                .await?;
            commit_unit(&*self.store, &*self.notifier, uow).await?;
            Ok(DisputeOutcome { dispute, transactions })
        })
        .await?;

        self.dispatch_all(&outcome.transactions).await;
        Ok(outcome)
    }

    /// Applies the decision recorded on an escalated dispute.
    pub async fn confirm_escalated(&self, dispute_id: Uuid, ctx: &OperationContext) -> Result<DisputeOutcome, ServiceError> {
        Self::require_operator(ctx, "confirm an escalated decision")?;

        let outcome = retry_on_conflict(|| async move {
            let Locked {
                _guard,
                mut project,
                mut milestone,
                mut dispute,
                ..
            } = self.lock(dispute_id).await?;
            Self::require_status(&dispute, DisputeStatus::Escalated)?;
            let decision = dispute
                .decision()
                .ok_or_else(|| ServiceError::Internal(format!("escalated dispute {} has no decision", dispute.id)))?;

            let before = dispute.clone();
            let mut uow = UnitOfWork::new();
            let transactions = self
                .resolve(
                    &mut uow,
                    ctx,
                    &mut project,
                    &mut milestone,
                    &before,
                    &mut dispute,
                    decision,
                    ctx.actor.id(),
                )
                .await?;
            commit_unit(&*self.store, &*self.notifier, uow).await?;
            Ok(DisputeOutcome { dispute, transactions })
        })
        .await?;

        self.dispatch_all(&outcome.transactions).await;
        Ok(outcome)
    }

    // -----------------------------------------------------------------------
    // Resolution
    // -----------------------------------------------------------------------

    /// Applies `decision` and stages the project, milestone and dispute.
    /// Funds and the milestone move in the same unit as the dispute closing.
    #[allow(clippy::too_many_arguments)]
    async fn resolve(
        &self,
        uow: &mut UnitOfWork,
        ctx: &OperationContext,
        project: &mut Project,
        milestone: &mut Milestone,
        before_dispute: &Dispute,
        dispute: &mut Dispute,
        decision: ResolutionDecision,
        resolved_by: Option<Uuid>,
    ) -> Result<Vec<EscrowTransaction>, ServiceError> {
        let before_project = project.clone();
        let before_milestone = milestone.clone();

        let transactions = self.plan_apply_decision(uow, ctx, project, milestone, dispute, decision, resolved_by)?;

        let others_open = self
            .store
            .project_open_disputes(project.id)
            .await?
            .into_iter()
            .any(|other| other.id != dispute.id);
        if !others_open && project.status == ProjectStatus::Disputed {
            project.status = ProjectStatus::Active;
        }
        let milestones = self.escrow.milestones_with(project.id, milestone).await?;
        self.escrow.plan_completion(uow, ctx, project, &milestones);

        stage_dispute(uow, &self.audit, ctx, actions::DISPUTE_RESOLVED, before_dispute, dispute);
        stage_milestone(uow, &self.audit, ctx, actions::DISPUTE_RESOLVED, &before_milestone, milestone);
        stage_project(uow, &self.audit, ctx, actions::DISPUTE_RESOLVED, &before_project, project);

        tracing::info!(
            dispute_id = %dispute.id,
            milestone_id = %milestone.id,
            decision = ?decision,
            milestone_status = milestone.status.to_str(),
            "Dispute resolved"
        );
        Ok(transactions)
    }

    /// Ledger and milestone effects of a decision. Operation ids are derived
    /// from the dispute id, so a decision can only ever move funds once.
    #[allow(clippy::too_many_arguments)]
    pub fn plan_apply_decision(
        &self,
        uow: &mut UnitOfWork,
        ctx: &OperationContext,
        project: &mut Project,
        milestone: &mut Milestone,
        dispute: &mut Dispute,
        decision: ResolutionDecision,
        resolved_by: Option<Uuid>,
    ) -> Result<Vec<EscrowTransaction>, ServiceError> {
        if milestone.status != MilestoneStatus::Disputed {
            return Err(ServiceError::conflict(format!(
                "milestone {} is {}, not disputed",
                milestone.id, milestone.status
            )));
        }

        let decision = decision.normalized();
        let amount = milestone.amount.clone();
        let operation = |leg: &str| Some(format!("dispute:{}:{}", dispute.id, leg));
        let release_op = operation("release");
        let refund_op = operation("refund");
        let mut transactions = Vec::new();

        let next = match decision {
            ResolutionDecision::FullPayment => {
                transactions.push(self.escrow.plan_release(
                    uow,
                    ctx,
                    project,
                    milestone,
                    &amount,
                    release_op,
                    ReleaseSource::DisputeDecision,
                )?);
                MilestoneStatus::Paid
            }
            ResolutionDecision::PartialSplit { freelancer_share_pct } => {
                let (released, refunded) = split_by_percentage(&amount, freelancer_share_pct);
                if released > BigDecimal::zero() {
                    transactions.push(self.escrow.plan_release(
                        uow,
                        ctx,
                        project,
                        milestone,
                        &released,
                        release_op,
                        ReleaseSource::DisputeDecision,
                    )?);
                }
                if refunded > BigDecimal::zero() {
                    transactions.push(self.escrow.plan_refund(
                        uow,
                        ctx,
                        project,
                        Some(milestone.id),
                        &refunded,
                        "dispute split",
                        refund_op,
                    )?);
                }
                MilestoneStatus::Paid
            }
            ResolutionDecision::FullRefund => {
                transactions.push(self.escrow.plan_refund(
                    uow,
                    ctx,
                    project,
                    Some(milestone.id),
                    &amount,
                    "dispute refund",
                    refund_op,
                )?);
                MilestoneStatus::Refunded
            }
            ResolutionDecision::RevisionRequired => {
                milestone.revision_count = 0;
                MilestoneStatus::RevisionRequested
            }
        };

        if !milestone.status.can_resolve_to(next) {
            return Err(ServiceError::Internal(format!(
                "decision {:?} maps to an illegal exit {} -> {}",
                decision, milestone.status, next
            )));
        }
        milestone.status = next;
        if next == MilestoneStatus::Paid {
            milestone.paid_at = Some(Utc::now());
        }

        let now = Utc::now();
        dispute.set_decision(decision);
        dispute.status = DisputeStatus::Resolved;
        dispute.resolved_at = Some(now);
        dispute.resolved_by = resolved_by;
        Ok(transactions)
    }

    async fn dispatch_all(&self, transactions: &[EscrowTransaction]) {
        for transaction in transactions {
            self.escrow.dispatch_logged(transaction).await;
        }
    }
}
