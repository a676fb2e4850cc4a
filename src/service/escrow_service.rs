// service/escrow_service.rs
use std::sync::Arc;

use chrono::Utc;
use num_traits::Zero;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::types::BigDecimal;
use uuid::Uuid;

use super::{
    audit_service::AuditService,
    commit_unit,
    concurrency::{retry_on_conflict, AggregateKey, AggregateLocks},
    error::ServiceError,
    load_milestone, load_project, load_transaction,
    notification_service::NotificationDispatcher,
    payment_provider::{GatewayError, GatewayReceipt, GatewayRequest, PaymentGateway},
    stage_milestone, stage_project,
};
use crate::{
    db::store::{EscrowStore, UnitOfWork},
    models::{
        actor::{Actor, OperationContext},
        auditmodel::{actions, entity_types},
        escrowmodel::{EscrowTransaction, TransactionStatus, TransactionType},
        milestonemodel::{Milestone, MilestoneStatus},
        projectmodel::{EscrowSummary, Project, ProjectStatus},
    },
    utils::currency::is_valid_amount,
};

/// Which processor call moves released funds to the freelancer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PayoutMode {
    #[default]
    Transfer,
    Payout,
}

impl std::str::FromStr for PayoutMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "transfer" => Ok(PayoutMode::Transfer),
            "payout" => Ok(PayoutMode::Payout),
            other => Err(format!("unknown payout mode `{}`", other)),
        }
    }
}

/// Why a release is happening. Approval releases move the milestone to
/// `paid`; dispute releases leave the milestone to the dispute workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseSource {
    Approval,
    DisputeDecision,
}

#[derive(Debug, Clone, Serialize)]
pub struct LedgerReceipt {
    pub transaction: EscrowTransaction,
    pub escrow: EscrowSummary,
    /// The operation id had already been applied; nothing was mutated.
    pub replayed: bool,
}

#[derive(Debug, Clone)]
pub struct HoldRequest {
    pub project_id: Uuid,
    pub amount: BigDecimal,
    pub external_reference: String,
    pub operation_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ReleaseRequest {
    pub milestone_id: Uuid,
    pub amount: BigDecimal,
    pub operation_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RefundRequest {
    pub project_id: Uuid,
    pub milestone_id: Option<Uuid>,
    pub amount: BigDecimal,
    pub reason: String,
    pub operation_id: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    pub dispatched: usize,
    pub failed: usize,
}

#[derive(Clone)]
pub struct EscrowService {
    store: Arc<dyn EscrowStore>,
    gateway: Arc<dyn PaymentGateway>,
    audit: AuditService,
    notifier: Arc<dyn NotificationDispatcher>,
    locks: AggregateLocks,
    payout_mode: PayoutMode,
}

impl EscrowService {
    pub fn new(
        store: Arc<dyn EscrowStore>,
        gateway: Arc<dyn PaymentGateway>,
        audit: AuditService,
        notifier: Arc<dyn NotificationDispatcher>,
        locks: AggregateLocks,
        payout_mode: PayoutMode,
    ) -> Self {
        Self {
            store,
            gateway,
            audit,
            notifier,
            locks,
            payout_mode,
        }
    }

    pub async fn escrow_summary(&self, project_id: Uuid) -> Result<EscrowSummary, ServiceError> {
        Ok(load_project(&*self.store, project_id).await?.escrow())
    }

    pub async fn project_transactions(&self, project_id: Uuid) -> Result<Vec<EscrowTransaction>, ServiceError> {
        load_project(&*self.store, project_id).await?;
        Ok(self.store.project_transactions(project_id).await?)
    }

    // -----------------------------------------------------------------------
    // Deposit
    // -----------------------------------------------------------------------

    /// Creates the pending deposit row for the full budget and asks the
    /// processor to collect it. The funds count as held only once `hold`
    /// runs for the processor's confirmation.
    pub async fn initiate_deposit(
        &self,
        project_id: Uuid,
        operation_id: Option<String>,
        ctx: &OperationContext,
    ) -> Result<LedgerReceipt, ServiceError> {
        if let Some(receipt) = self.replay(operation_id.as_deref(), TransactionType::Deposit).await? {
            if receipt.transaction.status == TransactionStatus::Failed {
                return Err(ServiceError::PaymentFailed(
                    receipt
                        .transaction
                        .failure_reason
                        .unwrap_or_else(|| "deposit failed".to_string()),
                ));
            }
            return Ok(receipt);
        }

        let (transaction, project) = retry_on_conflict(|| self.open_deposit(project_id, operation_id.clone(), ctx)).await?;

        if transaction.external_reference.is_some() {
            return Ok(LedgerReceipt {
                escrow: project.escrow(),
                transaction,
                replayed: false,
            });
        }

        let request = GatewayRequest {
            idempotency_key: transaction.id,
            amount: transaction.amount.clone(),
            currency: project.currency.clone(),
            project_id,
            milestone_id: None,
            counterparty: Some(project.client_id),
        };

        match self.gateway.create_deposit(&request).await {
            Ok(receipt) => {
                let transaction = self.record_reference(&transaction, receipt, ctx).await?;
                tracing::info!(
                    project_id = %project_id,
                    transaction_id = %transaction.id,
                    amount = %transaction.amount,
                    "Deposit initiated"
                );
                Ok(LedgerReceipt {
                    escrow: project.escrow(),
                    transaction,
                    replayed: false,
                })
            }
            Err(e) => {
                tracing::error!(
                    project_id = %project_id,
                    transaction_id = %transaction.id,
                    error = %e,
                    "Deposit request was rejected by the payment processor"
                );
                self.mark_failed(&transaction, &e, ctx).await?;
                Err(ServiceError::PaymentFailed(e.to_string()))
            }
        }
    }

    async fn open_deposit(
        &self,
        project_id: Uuid,
        operation_id: Option<String>,
        ctx: &OperationContext,
    ) -> Result<(EscrowTransaction, Project), ServiceError> {
        let _guard = self.locks.acquire(&[AggregateKey::Project(project_id)]).await;
        let project = load_project(&*self.store, project_id).await?;

        if !ctx.actor.is_user(project.client_id) {
            return Err(ServiceError::Forbidden {
                actor: ctx.actor.describe(),
                action: "fund this project",
            });
        }
        if project.status != ProjectStatus::AwaitingDeposit {
            return Err(ServiceError::conflict(format!(
                "project {} is {}, not awaiting_deposit",
                project.id,
                project.status.to_str()
            )));
        }

        let in_flight = self
            .store
            .project_transactions(project_id)
            .await?
            .into_iter()
            .find(|tx| tx.kind == TransactionType::Deposit && tx.is_pending());
        if let Some(transaction) = in_flight {
            return Ok((transaction, project));
        }

        let transaction = EscrowTransaction::pending(
            project.id,
            None,
            TransactionType::Deposit,
            project.total_budget.clone(),
            operation_id,
        );
        let mut uow = UnitOfWork::new();
        uow.insert_transaction(&transaction);
        self.audit
            .log_transaction(&mut uow, ctx, actions::DEPOSIT_INITIATED, None, &transaction);
        commit_unit(&*self.store, &*self.notifier, uow).await?;

        Ok((transaction, project))
    }

    // -----------------------------------------------------------------------
    // Hold
    // -----------------------------------------------------------------------

    pub async fn hold(&self, request: HoldRequest, ctx: &OperationContext) -> Result<LedgerReceipt, ServiceError> {
        retry_on_conflict(|| self.hold_once(&request, ctx)).await
    }

    async fn hold_once(&self, request: &HoldRequest, ctx: &OperationContext) -> Result<LedgerReceipt, ServiceError> {
        if let Some(receipt) = self.replay(request.operation_id.as_deref(), TransactionType::Deposit).await? {
            return Ok(receipt);
        }

        let _guard = self.locks.acquire(&[AggregateKey::Project(request.project_id)]).await;
        let mut project = load_project(&*self.store, request.project_id).await?;

        let pending = match self.store.transaction_by_reference(&request.external_reference).await? {
            Some(tx) if tx.project_id == project.id && tx.kind == TransactionType::Deposit && tx.is_pending() => Some(tx),
            Some(_) => return Err(ServiceError::DuplicateReference(request.external_reference.clone())),
            None => None,
        };

        let before = project.clone();
        let mut uow = UnitOfWork::new();
        let transaction = self.plan_hold(
            &mut uow,
            ctx,
            &mut project,
            pending,
            &request.amount,
            &request.external_reference,
            request.operation_id.clone(),
        )?;
        stage_project(&mut uow, &self.audit, ctx, actions::ESCROW_HELD, &before, &mut project);
        commit_unit(&*self.store, &*self.notifier, uow).await?;

        tracing::info!(
            project_id = %project.id,
            transaction_id = %transaction.id,
            amount = %transaction.amount,
            "Escrow funded"
        );

        Ok(LedgerReceipt {
            escrow: project.escrow(),
            transaction,
            replayed: false,
        })
    }

    /// Credits a deposit to the project. `pending` is the row created by
    /// `initiate_deposit`, if the caller found one; it is completed in place.
    /// The caller persists the project.
    #[allow(clippy::too_many_arguments)]
    pub fn plan_hold(
        &self,
        uow: &mut UnitOfWork,
        ctx: &OperationContext,
        project: &mut Project,
        pending: Option<EscrowTransaction>,
        amount: &BigDecimal,
        reference: &str,
        operation_id: Option<String>,
    ) -> Result<EscrowTransaction, ServiceError> {
        if project.status != ProjectStatus::AwaitingDeposit {
            return Err(ServiceError::conflict(format!(
                "project {} is {}, not awaiting_deposit",
                project.id,
                project.status.to_str()
            )));
        }
        if !is_valid_amount(amount) {
            return Err(ServiceError::Validation(format!("invalid deposit amount {}", amount)));
        }
        if *amount != project.total_budget {
            return Err(ServiceError::Validation(format!(
                "deposit of {} does not fund the budget of {}",
                amount, project.total_budget
            )));
        }

        let now = Utc::now();
        let transaction = match pending {
            Some(row) => {
                if row.external_reference.as_deref().is_some_and(|r| r != reference) {
                    return Err(ServiceError::conflict(format!(
                        "deposit {} was issued under a different reference",
                        row.id
                    )));
                }
                let mut completed = row.clone();
                completed.status = TransactionStatus::Completed;
                completed.amount = amount.clone();
                completed.external_reference = Some(reference.to_string());
                completed.completed_at = Some(now);
                if completed.operation_id.is_none() {
                    completed.operation_id = operation_id;
                }
                uow.save_transaction(&completed, TransactionStatus::Pending);
                self.audit
                    .log_transaction(uow, ctx, actions::TRANSACTION_SETTLED, Some(&row), &completed);
                completed
            }
            None => {
                let mut row = EscrowTransaction::pending(
                    project.id,
                    None,
                    TransactionType::Deposit,
                    amount.clone(),
                    operation_id,
                );
                row.status = TransactionStatus::Completed;
                row.external_reference = Some(reference.to_string());
                row.completed_at = Some(now);
                uow.insert_transaction(&row);
                self.audit.log_transaction(uow, ctx, actions::ESCROW_HELD, None, &row);
                row
            }
        };

        project.total_held = &project.total_held + amount;
        project.refresh_escrow();
        project.status = ProjectStatus::Active;
        Ok(transaction)
    }

    /// Books a deposit the processor captured after the project stopped
    /// awaiting one and queues a refund of the same amount to the client.
    /// `remaining` is unchanged. Returns the refund row for dispatch.
    pub fn plan_returned_deposit(
        &self,
        uow: &mut UnitOfWork,
        ctx: &OperationContext,
        project: &mut Project,
        located: Option<EscrowTransaction>,
        amount: &BigDecimal,
        reference: &str,
    ) -> Result<EscrowTransaction, ServiceError> {
        if !is_valid_amount(amount) {
            return Err(ServiceError::Validation(format!("invalid deposit amount {}", amount)));
        }

        let now = Utc::now();
        match located {
            Some(row) if row.status == TransactionStatus::Completed => {
                return Err(ServiceError::conflict(format!("deposit {} is already held", row.id)));
            }
            // pending, or failed when the project was cancelled first
            Some(row) => {
                let mut completed = row.clone();
                completed.status = TransactionStatus::Completed;
                completed.amount = amount.clone();
                completed.external_reference = Some(reference.to_string());
                completed.failure_reason = None;
                completed.completed_at = Some(now);
                uow.save_transaction(&completed, row.status);
                self.audit
                    .log_transaction(uow, ctx, actions::TRANSACTION_SETTLED, Some(&row), &completed);
            }
            None => {
                let mut row =
                    EscrowTransaction::pending(project.id, None, TransactionType::Deposit, amount.clone(), None);
                row.status = TransactionStatus::Completed;
                row.external_reference = Some(reference.to_string());
                row.completed_at = Some(now);
                uow.insert_transaction(&row);
                self.audit.log_transaction(uow, ctx, actions::ESCROW_HELD, None, &row);
            }
        }

        project.total_held = &project.total_held + amount;
        project.refresh_escrow();
        let reason = format!("deposit arrived while the project was {}", project.status.to_str());
        self.plan_refund(uow, ctx, project, None, amount, &reason, None)
    }

    // -----------------------------------------------------------------------
    // Release
    // -----------------------------------------------------------------------

    pub async fn release(&self, request: ReleaseRequest, ctx: &OperationContext) -> Result<LedgerReceipt, ServiceError> {
        let receipt = retry_on_conflict(|| self.release_once(&request, ctx)).await?;
        if !receipt.replayed {
            self.dispatch_logged(&receipt.transaction).await;
        }
        Ok(receipt)
    }

    async fn release_once(&self, request: &ReleaseRequest, ctx: &OperationContext) -> Result<LedgerReceipt, ServiceError> {
        if let Some(receipt) = self.replay(request.operation_id.as_deref(), TransactionType::Release).await? {
            return Ok(receipt);
        }

        let located = load_milestone(&*self.store, request.milestone_id).await?;
        let _guard = self
            .locks
            .acquire(&[
                AggregateKey::Project(located.project_id),
                AggregateKey::Milestone(located.id),
            ])
            .await;
        let mut project = load_project(&*self.store, located.project_id).await?;
        let mut milestone = load_milestone(&*self.store, located.id).await?;

        let allowed = match ctx.actor {
            Actor::User(id) => project.is_client(id),
            Actor::Operator(_) | Actor::System => true,
        };
        if !allowed {
            return Err(ServiceError::Forbidden {
                actor: ctx.actor.describe(),
                action: "release milestone funds",
            });
        }

        let before_project = project.clone();
        let before_milestone = milestone.clone();
        let mut uow = UnitOfWork::new();
        let transaction = self.plan_release(
            &mut uow,
            ctx,
            &mut project,
            &mut milestone,
            &request.amount,
            request.operation_id.clone(),
            ReleaseSource::Approval,
        )?;
        stage_milestone(&mut uow, &self.audit, ctx, actions::MILESTONE_PAID, &before_milestone, &mut milestone);

        let milestones = self.milestones_with(project.id, &milestone).await?;
        self.plan_completion(&mut uow, ctx, &mut project, &milestones);
        stage_project(&mut uow, &self.audit, ctx, actions::ESCROW_RELEASED, &before_project, &mut project);
        commit_unit(&*self.store, &*self.notifier, uow).await?;

        tracing::info!(
            project_id = %project.id,
            milestone_id = %milestone.id,
            transaction_id = %transaction.id,
            amount = %transaction.amount,
            remaining = %project.remaining,
            "Milestone funds released"
        );

        Ok(LedgerReceipt {
            escrow: project.escrow(),
            transaction,
            replayed: false,
        })
    }

    /// Moves `amount` out of escrow towards the freelancer as a pending
    /// release row. The caller persists the project and milestone.
    #[allow(clippy::too_many_arguments)]
    pub fn plan_release(
        &self,
        uow: &mut UnitOfWork,
        ctx: &OperationContext,
        project: &mut Project,
        milestone: &mut Milestone,
        amount: &BigDecimal,
        operation_id: Option<String>,
        source: ReleaseSource,
    ) -> Result<EscrowTransaction, ServiceError> {
        if milestone.project_id != project.id {
            return Err(ServiceError::Internal(format!(
                "milestone {} does not belong to project {}",
                milestone.id, project.id
            )));
        }
        let expected = match source {
            ReleaseSource::Approval => MilestoneStatus::Approved,
            ReleaseSource::DisputeDecision => MilestoneStatus::Disputed,
        };
        if milestone.status != expected {
            return Err(ServiceError::conflict(format!(
                "milestone {} is {}, not {}",
                milestone.id, milestone.status, expected
            )));
        }
        if !matches!(project.status, ProjectStatus::Active | ProjectStatus::Disputed) {
            return Err(ServiceError::conflict(format!(
                "project {} is {}; funds cannot be released",
                project.id,
                project.status.to_str()
            )));
        }
        if !is_valid_amount(amount) {
            return Err(ServiceError::Validation(format!("invalid release amount {}", amount)));
        }
        if *amount > milestone.amount {
            return Err(ServiceError::Validation(format!(
                "release of {} exceeds the milestone amount {}",
                amount, milestone.amount
            )));
        }
        // an approved milestone is paid in one go; partial amounts only come
        // out of a dispute decision
        if source == ReleaseSource::Approval && *amount != milestone.amount {
            return Err(ServiceError::Validation(format!(
                "release of {} does not match the milestone amount {}",
                amount, milestone.amount
            )));
        }
        if *amount > project.remaining {
            return Err(ServiceError::InsufficientFunds {
                required: amount.clone(),
                available: project.remaining.clone(),
            });
        }

        project.total_released = &project.total_released + amount;
        project.refresh_escrow();

        let transaction = EscrowTransaction::pending(
            project.id,
            Some(milestone.id),
            TransactionType::Release,
            amount.clone(),
            operation_id,
        );
        uow.insert_transaction(&transaction);
        self.audit
            .log_transaction(uow, ctx, actions::ESCROW_RELEASED, None, &transaction);

        if source == ReleaseSource::Approval {
            milestone.status = MilestoneStatus::Paid;
            milestone.paid_at = Some(Utc::now());
        }
        Ok(transaction)
    }

    // -----------------------------------------------------------------------
    // Refund
    // -----------------------------------------------------------------------

    pub async fn refund(&self, request: RefundRequest, ctx: &OperationContext) -> Result<LedgerReceipt, ServiceError> {
        let receipt = retry_on_conflict(|| self.refund_once(&request, ctx)).await?;
        if !receipt.replayed {
            self.dispatch_logged(&receipt.transaction).await;
        }
        Ok(receipt)
    }

    async fn refund_once(&self, request: &RefundRequest, ctx: &OperationContext) -> Result<LedgerReceipt, ServiceError> {
        if let Some(receipt) = self.replay(request.operation_id.as_deref(), TransactionType::Refund).await? {
            return Ok(receipt);
        }
        if !matches!(ctx.actor, Actor::Operator(_) | Actor::System) {
            return Err(ServiceError::Forbidden {
                actor: ctx.actor.describe(),
                action: "refund escrow",
            });
        }

        let mut keys = vec![AggregateKey::Project(request.project_id)];
        if let Some(milestone_id) = request.milestone_id {
            keys.push(AggregateKey::Milestone(milestone_id));
        }
        let _guard = self.locks.acquire(&keys).await;
        let mut project = load_project(&*self.store, request.project_id).await?;

        let before = project.clone();
        let mut uow = UnitOfWork::new();
        let transaction = self.plan_refund(
            &mut uow,
            ctx,
            &mut project,
            request.milestone_id,
            &request.amount,
            &request.reason,
            request.operation_id.clone(),
        )?;
        let milestones = self.store.project_milestones(project.id).await?;
        self.plan_completion(&mut uow, ctx, &mut project, &milestones);
        stage_project(&mut uow, &self.audit, ctx, actions::ESCROW_REFUNDED, &before, &mut project);
        commit_unit(&*self.store, &*self.notifier, uow).await?;

        tracing::info!(
            project_id = %project.id,
            transaction_id = %transaction.id,
            amount = %transaction.amount,
            reason = %request.reason,
            "Escrow refunded"
        );

        Ok(LedgerReceipt {
            escrow: project.escrow(),
            transaction,
            replayed: false,
        })
    }

    /// Moves `amount` out of escrow back to the client as a pending refund
    /// row. The caller persists the project.
    #[allow(clippy::too_many_arguments)]
    pub fn plan_refund(
        &self,
        uow: &mut UnitOfWork,
        ctx: &OperationContext,
        project: &mut Project,
        milestone_id: Option<Uuid>,
        amount: &BigDecimal,
        reason: &str,
        operation_id: Option<String>,
    ) -> Result<EscrowTransaction, ServiceError> {
        if project.total_held.is_zero() {
            return Err(ServiceError::conflict(format!("project {} holds no funds", project.id)));
        }
        if !is_valid_amount(amount) {
            return Err(ServiceError::Validation(format!("invalid refund amount {}", amount)));
        }
        if *amount > project.remaining {
            return Err(ServiceError::InsufficientFunds {
                required: amount.clone(),
                available: project.remaining.clone(),
            });
        }

        project.total_refunded = &project.total_refunded + amount;
        project.refresh_escrow();

        let transaction = EscrowTransaction::pending(
            project.id,
            milestone_id,
            TransactionType::Refund,
            amount.clone(),
            operation_id,
        );
        uow.insert_transaction(&transaction);
        let mut snapshot = transaction.audit_snapshot();
        snapshot["reason"] = json!(reason);
        self.audit.record(
            uow,
            ctx,
            actions::ESCROW_REFUNDED,
            entity_types::ESCROW_TRANSACTION,
            transaction.id,
            None,
            Some(snapshot),
        );
        Ok(transaction)
    }

    // -----------------------------------------------------------------------
    // Settlement
    // -----------------------------------------------------------------------

    /// Marks an outbound row as settled by the processor.
    pub fn plan_settlement(
        &self,
        uow: &mut UnitOfWork,
        ctx: &OperationContext,
        transaction: &EscrowTransaction,
        reference: &str,
    ) -> EscrowTransaction {
        let mut settled = transaction.clone();
        settled.status = TransactionStatus::Completed;
        settled.completed_at = Some(Utc::now());
        if settled.external_reference.is_none() {
            settled.external_reference = Some(reference.to_string());
        }
        uow.save_transaction(&settled, TransactionStatus::Pending);
        self.audit
            .log_transaction(uow, ctx, actions::TRANSACTION_SETTLED, Some(transaction), &settled);
        settled
    }

    /// Marks a row failed. Release, refund and fee rows get a pending
    /// replacement so the ledger totals stay put and the payment is retried;
    /// a failed deposit is simply dead and the client deposits again.
    pub fn plan_payment_failure(
        &self,
        uow: &mut UnitOfWork,
        ctx: &OperationContext,
        transaction: &EscrowTransaction,
        reason: &str,
    ) -> Option<EscrowTransaction> {
        let mut failed = transaction.clone();
        failed.status = TransactionStatus::Failed;
        failed.failure_reason = Some(reason.to_string());
        uow.save_transaction(&failed, TransactionStatus::Pending);
        self.audit
            .log_transaction(uow, ctx, actions::PAYMENT_FAILED, Some(transaction), &failed);

        if transaction.kind == TransactionType::Deposit {
            return None;
        }
        let replacement = EscrowTransaction::replacement_for(&failed);
        uow.insert_transaction(&replacement);
        self.audit
            .log_transaction(uow, ctx, actions::PAYMENT_RETRY_SCHEDULED, None, &replacement);
        Some(replacement)
    }

    /// Completes the project once every coin is out of escrow and every
    /// milestone is settled. Returns whether it did.
    pub fn plan_completion(
        &self,
        uow: &mut UnitOfWork,
        ctx: &OperationContext,
        project: &mut Project,
        milestones: &[Milestone],
    ) -> bool {
        let settled = project.remaining.is_zero()
            && !project.total_held.is_zero()
            && !milestones.is_empty()
            && milestones.iter().all(|m| m.status.is_terminal());
        if !settled || !matches!(project.status, ProjectStatus::Active | ProjectStatus::Disputed) {
            return false;
        }

        let from = project.status;
        project.status = ProjectStatus::Completed;
        self.audit.record(
            uow,
            ctx,
            actions::PROJECT_COMPLETED,
            entity_types::PROJECT,
            project.id,
            Some(json!({ "status": from })),
            Some(json!({ "status": project.status })),
        );
        true
    }

    /// The project's milestones as they will be after this unit commits.
    pub(crate) async fn milestones_with(&self, project_id: Uuid, updated: &Milestone) -> Result<Vec<Milestone>, ServiceError> {
        let mut milestones = self.store.project_milestones(project_id).await?;
        for milestone in milestones.iter_mut().filter(|m| m.id == updated.id) {
            *milestone = updated.clone();
        }
        Ok(milestones)
    }

    // -----------------------------------------------------------------------
    // Processor calls
    // -----------------------------------------------------------------------

    /// Issues the processor call for a committed pending row and records the
    /// reference it returns. A gateway error leaves the row pending for the
    /// dispatch sweep.
    pub async fn dispatch(&self, transaction_id: Uuid) -> Result<EscrowTransaction, ServiceError> {
        let transaction = load_transaction(&*self.store, transaction_id).await?;
        if !transaction.is_pending() || transaction.external_reference.is_some() {
            return Ok(transaction);
        }
        let project = load_project(&*self.store, transaction.project_id).await?;
        let ctx = OperationContext::system();

        match self.call_gateway(&transaction, &project).await {
            Ok(receipt) => self.record_reference(&transaction, receipt, &ctx).await,
            Err(e) => {
                tracing::error!(
                    transaction_id = %transaction.id,
                    kind = transaction.kind.to_str(),
                    error = %e,
                    "Payment processor call failed; row stays pending"
                );
                let mut uow = UnitOfWork::new();
                self.audit.record(
                    &mut uow,
                    &ctx,
                    actions::PAYMENT_FAILED,
                    entity_types::ESCROW_TRANSACTION,
                    transaction.id,
                    None,
                    Some(json!({ "error": e.to_string(), "status": transaction.status })),
                );
                commit_unit(&*self.store, &*self.notifier, uow).await?;
                Err(ServiceError::ExternalGateway(e))
            }
        }
    }

    /// Post-commit dispatch. Errors are logged; the sweep picks the row up.
    pub(crate) async fn dispatch_logged(&self, transaction: &EscrowTransaction) {
        if let Err(e) = self.dispatch(transaction.id).await {
            tracing::warn!(
                transaction_id = %transaction.id,
                error = %e,
                "Dispatch deferred to the next sweep"
            );
        }
    }

    /// Re-issues processor calls for pending rows that never got a reference.
    pub async fn dispatch_pending(&self) -> Result<DispatchReport, ServiceError> {
        let mut report = DispatchReport::default();
        for transaction in self.store.undispatched_transactions().await? {
            match self.dispatch(transaction.id).await {
                Ok(_) => report.dispatched += 1,
                Err(_) => report.failed += 1,
            }
        }
        if report.dispatched + report.failed > 0 {
            tracing::info!(
                dispatched = report.dispatched,
                failed = report.failed,
                "Dispatch sweep finished"
            );
        }
        Ok(report)
    }

    async fn call_gateway(&self, transaction: &EscrowTransaction, project: &Project) -> Result<GatewayReceipt, GatewayError> {
        let counterparty = match transaction.kind {
            TransactionType::Release => project.freelancer_id,
            TransactionType::Deposit | TransactionType::Refund => Some(project.client_id),
            TransactionType::Fee => None,
        };
        let request = GatewayRequest {
            idempotency_key: transaction.id,
            amount: transaction.amount.clone(),
            currency: project.currency.clone(),
            project_id: project.id,
            milestone_id: transaction.milestone_id,
            counterparty,
        };

        match transaction.kind {
            TransactionType::Deposit | TransactionType::Fee => self.gateway.create_deposit(&request).await,
            TransactionType::Release => match self.payout_mode {
                PayoutMode::Transfer => self.gateway.create_transfer(&request).await,
                PayoutMode::Payout => self.gateway.create_payout(&request).await,
            },
            TransactionType::Refund => self.gateway.create_refund(&request).await,
        }
    }

    async fn record_reference(
        &self,
        transaction: &EscrowTransaction,
        receipt: GatewayReceipt,
        ctx: &OperationContext,
    ) -> Result<EscrowTransaction, ServiceError> {
        let mut dispatched = transaction.clone();
        dispatched.external_reference = Some(receipt.external_reference);

        let mut uow = UnitOfWork::new();
        uow.save_transaction(&dispatched, TransactionStatus::Pending);
        self.audit
            .log_transaction(&mut uow, ctx, actions::TRANSACTION_DISPATCHED, Some(transaction), &dispatched);

        match commit_unit(&*self.store, &*self.notifier, uow).await {
            Ok(()) => Ok(dispatched),
            // the webhook settled the row before we got here
            Err(ServiceError::ConcurrentModification(_)) => load_transaction(&*self.store, transaction.id).await,
            Err(e) => Err(e),
        }
    }

    async fn mark_failed(
        &self,
        transaction: &EscrowTransaction,
        error: &GatewayError,
        ctx: &OperationContext,
    ) -> Result<(), ServiceError> {
        let mut uow = UnitOfWork::new();
        self.plan_payment_failure(&mut uow, ctx, transaction, &error.to_string());
        match commit_unit(&*self.store, &*self.notifier, uow).await {
            Ok(()) | Err(ServiceError::ConcurrentModification(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Looks up an already-applied operation id.
    async fn replay(
        &self,
        operation_id: Option<&str>,
        kind: TransactionType,
    ) -> Result<Option<LedgerReceipt>, ServiceError> {
        let Some(operation_id) = operation_id else {
            return Ok(None);
        };
        let Some(transaction) = self.store.transaction_by_operation(operation_id).await? else {
            return Ok(None);
        };
        if transaction.kind != kind {
            return Err(ServiceError::Validation(format!(
                "operation id {} was already used for a {} transaction",
                operation_id,
                transaction.kind.to_str()
            )));
        }
        let project = load_project(&*self.store, transaction.project_id).await?;
        tracing::debug!(operation_id, transaction_id = %transaction.id, "Replaying applied operation");
        Ok(Some(LedgerReceipt {
            escrow: project.escrow(),
            transaction,
            replayed: true,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        db::memorydb::MemoryStore,
        models::projectmodel::EscrowStatus,
        service::{
            notification_service::ChannelDispatcher,
            payment_provider::{GatewayOperation, StubFailure, StubPaymentGateway},
        },
    };
    use assert_matches::assert_matches;
    use std::str::FromStr;

    fn dec(value: &str) -> BigDecimal {
        BigDecimal::from_str(value).unwrap()
    }

    struct Fixture {
        store: Arc<MemoryStore>,
        gateway: Arc<StubPaymentGateway>,
        escrow: EscrowService,
        project: Project,
        milestones: Vec<Milestone>,
    }

    async fn fixture(status: ProjectStatus) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let gateway = Arc::new(StubPaymentGateway::new());
        let (notifier, _rx) = ChannelDispatcher::new(64);
        let escrow = EscrowService::new(
            store.clone(),
            gateway.clone(),
            AuditService::new(store.clone()),
            Arc::new(notifier),
            AggregateLocks::new(),
            PayoutMode::Transfer,
        );

        let mut project = Project::new(
            Uuid::new_v4(),
            Some(Uuid::new_v4()),
            "Site rebuild".to_string(),
            dec("1000.00"),
            "USD".to_string(),
            true,
        );
        project.status = status;
        let milestones = vec![
            Milestone::new(project.id, "Design".to_string(), 0, dec("500.00"), None),
            Milestone::new(project.id, "Build".to_string(), 1, dec("500.00"), None),
        ];
        let mut uow = UnitOfWork::new();
        uow.insert_project(&project);
        for milestone in &milestones {
            uow.insert_milestone(milestone);
        }
        store.commit(uow.into_parts().0).await.unwrap();

        Fixture {
            store,
            gateway,
            escrow,
            project,
            milestones,
        }
    }

    fn hold_request(project: &Project, reference: &str) -> HoldRequest {
        HoldRequest {
            project_id: project.id,
            amount: project.total_budget.clone(),
            external_reference: reference.to_string(),
            operation_id: None,
        }
    }

    async fn set_milestone_status(store: &MemoryStore, milestone_id: Uuid, status: MilestoneStatus) {
        let mut milestone = store.milestone(milestone_id).await.unwrap().unwrap();
        milestone.status = status;
        let mut uow = UnitOfWork::new();
        uow.save_milestone(&mut milestone);
        store.commit(uow.into_parts().0).await.unwrap();
    }

    async fn approve(store: &MemoryStore, milestone_id: Uuid) {
        set_milestone_status(store, milestone_id, MilestoneStatus::Approved).await;
    }

    fn refund_request(project: &Project, amount: &str) -> RefundRequest {
        RefundRequest {
            project_id: project.id,
            milestone_id: None,
            amount: dec(amount),
            reason: "client request".to_string(),
            operation_id: None,
        }
    }

    #[tokio::test]
    async fn hold_funds_the_project() {
        let fx = fixture(ProjectStatus::AwaitingDeposit).await;
        let receipt = fx
            .escrow
            .hold(hold_request(&fx.project, "dep_1"), &OperationContext::system())
            .await
            .unwrap();

        assert_eq!(receipt.escrow.status, EscrowStatus::Held);
        assert_eq!(receipt.escrow.remaining, dec("1000.00"));
        assert_eq!(receipt.transaction.status, TransactionStatus::Completed);

        let project = fx.store.project(fx.project.id).await.unwrap().unwrap();
        assert_eq!(project.status, ProjectStatus::Active);
        assert!(project.ledger_balanced());
    }

    #[tokio::test]
    async fn hold_rejects_a_recorded_reference() {
        let fx = fixture(ProjectStatus::AwaitingDeposit).await;
        let ctx = OperationContext::system();
        fx.escrow.hold(hold_request(&fx.project, "dep_1"), &ctx).await.unwrap();

        let err = fx.escrow.hold(hold_request(&fx.project, "dep_1"), &ctx).await.unwrap_err();
        assert_matches!(err, ServiceError::DuplicateReference(_));
        assert_eq!(fx.store.all_transactions().await.len(), 1);
    }

    #[tokio::test]
    async fn hold_requires_awaiting_deposit() {
        let fx = fixture(ProjectStatus::Draft).await;
        let err = fx
            .escrow
            .hold(hold_request(&fx.project, "dep_1"), &OperationContext::system())
            .await
            .unwrap_err();
        assert_matches!(err, ServiceError::StateConflict(_));
        assert!(fx.store.all_transactions().await.is_empty());
    }

    #[tokio::test]
    async fn release_replays_the_same_operation_id() {
        let fx = fixture(ProjectStatus::AwaitingDeposit).await;
        let ctx = OperationContext::system();
        fx.escrow.hold(hold_request(&fx.project, "dep_1"), &ctx).await.unwrap();
        approve(&fx.store, fx.milestones[0].id).await;

        let request = ReleaseRequest {
            milestone_id: fx.milestones[0].id,
            amount: dec("500.00"),
            operation_id: Some("op-release-1".to_string()),
        };
        let first = fx.escrow.release(request.clone(), &ctx).await.unwrap();
        let second = fx.escrow.release(request, &ctx).await.unwrap();

        assert!(!first.replayed);
        assert!(second.replayed);
        assert_eq!(first.transaction.id, second.transaction.id);
        assert_eq!(second.escrow.remaining, dec("500.00"));
        assert_eq!(fx.gateway.calls_for(GatewayOperation::Transfer).len(), 1);
    }

    #[tokio::test]
    async fn release_of_unapproved_milestone_moves_nothing() {
        let fx = fixture(ProjectStatus::AwaitingDeposit).await;
        let ctx = OperationContext::system();
        fx.escrow.hold(hold_request(&fx.project, "dep_1"), &ctx).await.unwrap();

        let err = fx
            .escrow
            .release(
                ReleaseRequest {
                    milestone_id: fx.milestones[0].id,
                    amount: dec("500.00"),
                    operation_id: None,
                },
                &ctx,
            )
            .await
            .unwrap_err();

        assert_matches!(err, ServiceError::StateConflict(_));
        assert_eq!(fx.store.all_transactions().await.len(), 1);
    }

    #[tokio::test]
    async fn partial_release_of_an_approved_milestone_is_rejected() {
        let fx = fixture(ProjectStatus::AwaitingDeposit).await;
        let ctx = OperationContext::system();
        fx.escrow.hold(hold_request(&fx.project, "dep_1"), &ctx).await.unwrap();
        approve(&fx.store, fx.milestones[0].id).await;

        let err = fx
            .escrow
            .release(
                ReleaseRequest {
                    milestone_id: fx.milestones[0].id,
                    amount: dec("300.00"),
                    operation_id: None,
                },
                &ctx,
            )
            .await
            .unwrap_err();
        assert_matches!(err, ServiceError::Validation(_));

        let milestone = fx.store.milestone(fx.milestones[0].id).await.unwrap().unwrap();
        assert_eq!(milestone.status, MilestoneStatus::Approved);
        let project = fx.store.project(fx.project.id).await.unwrap().unwrap();
        assert_eq!(project.remaining, dec("1000.00"));
        assert_eq!(fx.store.all_transactions().await.len(), 1);
        assert!(fx.gateway.calls_for(GatewayOperation::Transfer).is_empty());
    }

    #[tokio::test]
    async fn release_beyond_remaining_is_insufficient_and_moves_nothing() {
        let fx = fixture(ProjectStatus::AwaitingDeposit).await;
        let ctx = OperationContext::system();
        fx.escrow.hold(hold_request(&fx.project, "dep_1"), &ctx).await.unwrap();
        fx.escrow.refund(refund_request(&fx.project, "600.00"), &ctx).await.unwrap();
        approve(&fx.store, fx.milestones[0].id).await;
        let rows_before = fx.store.all_transactions().await.len();

        let err = fx
            .escrow
            .release(
                ReleaseRequest {
                    milestone_id: fx.milestones[0].id,
                    amount: dec("500.00"),
                    operation_id: Some("op-short".to_string()),
                },
                &ctx,
            )
            .await
            .unwrap_err();
        assert_matches!(
            err,
            ServiceError::InsufficientFunds { required, available }
                if required == dec("500.00") && available == dec("400.00")
        );

        assert_eq!(fx.store.all_transactions().await.len(), rows_before);
        assert!(fx.store.transaction_by_operation("op-short").await.unwrap().is_none());
        let milestone = fx.store.milestone(fx.milestones[0].id).await.unwrap().unwrap();
        assert_eq!(milestone.status, MilestoneStatus::Approved);
        let project = fx.store.project(fx.project.id).await.unwrap().unwrap();
        assert_eq!(project.remaining, dec("400.00"));
        assert_eq!(project.total_released, dec("0.00"));
        assert!(project.ledger_balanced());
        assert!(fx.gateway.calls_for(GatewayOperation::Transfer).is_empty());
    }

    #[tokio::test]
    async fn refunding_the_last_funds_completes_a_settled_project() {
        let fx = fixture(ProjectStatus::AwaitingDeposit).await;
        let ctx = OperationContext::system();
        fx.escrow.hold(hold_request(&fx.project, "dep_1"), &ctx).await.unwrap();
        approve(&fx.store, fx.milestones[0].id).await;
        fx.escrow
            .release(
                ReleaseRequest {
                    milestone_id: fx.milestones[0].id,
                    amount: dec("500.00"),
                    operation_id: None,
                },
                &ctx,
            )
            .await
            .unwrap();
        set_milestone_status(&fx.store, fx.milestones[1].id, MilestoneStatus::Refunded).await;

        let receipt = fx.escrow.refund(refund_request(&fx.project, "500.00"), &ctx).await.unwrap();
        assert_eq!(receipt.escrow.remaining, dec("0.00"));

        let project = fx.store.project(fx.project.id).await.unwrap().unwrap();
        assert_eq!(project.status, ProjectStatus::Completed);
        assert_eq!(project.escrow_status, EscrowStatus::Released);
        assert!(project.ledger_balanced());
    }

    #[tokio::test]
    async fn refund_leaves_a_project_with_open_milestones_active() {
        let fx = fixture(ProjectStatus::AwaitingDeposit).await;
        let ctx = OperationContext::system();
        fx.escrow.hold(hold_request(&fx.project, "dep_1"), &ctx).await.unwrap();

        fx.escrow.refund(refund_request(&fx.project, "1000.00"), &ctx).await.unwrap();
        let project = fx.store.project(fx.project.id).await.unwrap().unwrap();
        assert_eq!(project.status, ProjectStatus::Active);
        assert_eq!(project.escrow_status, EscrowStatus::Refunded);
    }

    #[tokio::test]
    async fn refund_beyond_remaining_is_insufficient() {
        let fx = fixture(ProjectStatus::AwaitingDeposit).await;
        let ctx = OperationContext::system();
        fx.escrow.hold(hold_request(&fx.project, "dep_1"), &ctx).await.unwrap();

        let err = fx
            .escrow
            .refund(
                RefundRequest {
                    project_id: fx.project.id,
                    milestone_id: None,
                    amount: dec("1000.01"),
                    reason: "cancelled".to_string(),
                    operation_id: None,
                },
                &ctx,
            )
            .await
            .unwrap_err();
        assert_matches!(err, ServiceError::InsufficientFunds { .. });
    }

    #[tokio::test]
    async fn refund_is_operator_only() {
        let fx = fixture(ProjectStatus::AwaitingDeposit).await;
        fx.escrow
            .hold(hold_request(&fx.project, "dep_1"), &OperationContext::system())
            .await
            .unwrap();

        let client = OperationContext::new(Actor::User(fx.project.client_id));
        let err = fx
            .escrow
            .refund(
                RefundRequest {
                    project_id: fx.project.id,
                    milestone_id: None,
                    amount: dec("10.00"),
                    reason: "changed mind".to_string(),
                    operation_id: None,
                },
                &client,
            )
            .await
            .unwrap_err();
        assert_matches!(err, ServiceError::Forbidden { .. });
    }

    #[tokio::test]
    async fn failed_deposit_request_marks_the_row_failed() {
        let fx = fixture(ProjectStatus::AwaitingDeposit).await;
        fx.gateway.fail_next(StubFailure::Declined);
        let client = OperationContext::new(Actor::User(fx.project.client_id));

        let err = fx
            .escrow
            .initiate_deposit(fx.project.id, None, &client)
            .await
            .unwrap_err();
        assert_matches!(err, ServiceError::PaymentFailed(_));

        let rows = fx.store.all_transactions().await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, TransactionStatus::Failed);
    }

    #[tokio::test]
    async fn initiated_deposit_is_completed_by_hold() {
        let fx = fixture(ProjectStatus::AwaitingDeposit).await;
        let client = OperationContext::new(Actor::User(fx.project.client_id));
        let started = fx
            .escrow
            .initiate_deposit(fx.project.id, Some("dep-op".to_string()), &client)
            .await
            .unwrap();
        let reference = started.transaction.external_reference.clone().unwrap();
        assert_eq!(
            reference,
            StubPaymentGateway::reference_for(GatewayOperation::Deposit, started.transaction.id)
        );

        let held = fx
            .escrow
            .hold(hold_request(&fx.project, &reference), &OperationContext::system())
            .await
            .unwrap();
        assert_eq!(held.transaction.id, started.transaction.id);
        assert_eq!(fx.store.all_transactions().await.len(), 1);
    }

    #[tokio::test]
    async fn gateway_outage_leaves_release_pending_for_the_sweep() {
        let fx = fixture(ProjectStatus::AwaitingDeposit).await;
        let ctx = OperationContext::system();
        fx.escrow.hold(hold_request(&fx.project, "dep_1"), &ctx).await.unwrap();
        approve(&fx.store, fx.milestones[0].id).await;

        fx.gateway.fail_next(StubFailure::Unavailable);
        let receipt = fx
            .escrow
            .release(
                ReleaseRequest {
                    milestone_id: fx.milestones[0].id,
                    amount: dec("500.00"),
                    operation_id: None,
                },
                &ctx,
            )
            .await
            .unwrap();
        let row = fx.store.transaction(receipt.transaction.id).await.unwrap().unwrap();
        assert!(row.is_pending());
        assert!(row.external_reference.is_none());

        let report = fx.escrow.dispatch_pending().await.unwrap();
        assert_eq!(report, DispatchReport { dispatched: 1, failed: 0 });
        let row = fx.store.transaction(receipt.transaction.id).await.unwrap().unwrap();
        assert!(row.external_reference.is_some());
    }
}
