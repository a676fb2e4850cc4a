// service/project_service.rs
use std::sync::Arc;

use chrono::{DateTime, Utc};
use num_traits::Zero;
use serde::Serialize;
use sqlx::types::BigDecimal;
use uuid::Uuid;

use super::{
    audit_service::AuditService,
    commit_unit,
    concurrency::{retry_on_conflict, AggregateKey, AggregateLocks},
    error::ServiceError,
    escrow_service::EscrowService,
    load_project,
    notification_service::{NotificationDispatcher, TransitionNotice},
    stage_project,
};
use crate::{
    db::store::{EscrowStore, UnitOfWork},
    models::{
        actor::{Actor, OperationContext},
        auditmodel::{actions, entity_types},
        escrowmodel::{EscrowTransaction, TransactionType},
        milestonemodel::Milestone,
        projectmodel::{EscrowSummary, Project, ProjectStatus},
    },
    utils::currency::{is_valid_amount, is_valid_currency},
};

#[derive(Debug, Clone)]
pub struct NewMilestone {
    pub title: String,
    pub amount: BigDecimal,
    pub deadline: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct NewProject {
    pub freelancer_id: Option<Uuid>,
    pub title: String,
    pub currency: String,
    pub total_budget: BigDecimal,
    pub sequential: bool,
    pub milestones: Vec<NewMilestone>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProjectView {
    pub project: Project,
    pub escrow: EscrowSummary,
    pub milestones: Vec<Milestone>,
    pub transactions: Vec<EscrowTransaction>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CancellationOutcome {
    pub project: Project,
    pub refund: Option<EscrowTransaction>,
}

#[derive(Clone)]
pub struct ProjectService {
    store: Arc<dyn EscrowStore>,
    audit: AuditService,
    notifier: Arc<dyn NotificationDispatcher>,
    locks: AggregateLocks,
    escrow: EscrowService,
}

impl ProjectService {
    pub fn new(
        store: Arc<dyn EscrowStore>,
        audit: AuditService,
        notifier: Arc<dyn NotificationDispatcher>,
        locks: AggregateLocks,
        escrow: EscrowService,
    ) -> Self {
        Self {
            store,
            audit,
            notifier,
            locks,
            escrow,
        }
    }

    pub async fn view(&self, project_id: Uuid) -> Result<ProjectView, ServiceError> {
        let project = load_project(&*self.store, project_id).await?;
        let milestones = self.store.project_milestones(project_id).await?;
        let transactions = self.store.project_transactions(project_id).await?;
        Ok(ProjectView {
            escrow: project.escrow(),
            project,
            milestones,
            transactions,
        })
    }

    fn validate(new: &NewProject) -> Result<(), ServiceError> {
        if new.title.trim().is_empty() {
            return Err(ServiceError::Validation("title is required".to_string()));
        }
        if !is_valid_currency(&new.currency) {
            return Err(ServiceError::Validation(format!("invalid currency code `{}`", new.currency)));
        }
        if !is_valid_amount(&new.total_budget) {
            return Err(ServiceError::Validation(format!("invalid budget {}", new.total_budget)));
        }
        if new.milestones.is_empty() {
            return Err(ServiceError::Validation("a project needs at least one milestone".to_string()));
        }
        for (index, milestone) in new.milestones.iter().enumerate() {
            if milestone.title.trim().is_empty() {
                return Err(ServiceError::Validation(format!("milestone {} has no title", index)));
            }
            if !is_valid_amount(&milestone.amount) {
                return Err(ServiceError::Validation(format!(
                    "milestone {} has an invalid amount {}",
                    index, milestone.amount
                )));
            }
        }

        let total = new
            .milestones
            .iter()
            .fold(BigDecimal::zero(), |sum, m| sum + &m.amount);
        if total != new.total_budget {
            return Err(ServiceError::Validation(format!(
                "milestone amounts sum to {} but the budget is {}",
                total, new.total_budget
            )));
        }
        Ok(())
    }

    /// Creates the project and its milestones, ordered as given.
    pub async fn create(&self, new: NewProject, ctx: &OperationContext) -> Result<ProjectView, ServiceError> {
        let Actor::User(client_id) = ctx.actor else {
            return Err(ServiceError::Forbidden {
                actor: ctx.actor.describe(),
                action: "create a project",
            });
        };
        Self::validate(&new)?;
        if new.freelancer_id == Some(client_id) {
            return Err(ServiceError::Validation("a client cannot hire themselves".to_string()));
        }

        let project = Project::new(
            client_id,
            new.freelancer_id,
            new.title.trim().to_string(),
            new.total_budget.with_scale(2),
            new.currency.clone(),
            new.sequential,
        );
        let milestones: Vec<Milestone> = new
            .milestones
            .into_iter()
            .enumerate()
            .map(|(index, m)| Milestone::new(project.id, m.title.trim().to_string(), index as i32, m.amount.with_scale(2), m.deadline))
            .collect();

        let mut uow = UnitOfWork::new();
        uow.insert_project(&project);
        self.audit
            .log_project_change(&mut uow, ctx, actions::PROJECT_CREATED, None, &project);
        for milestone in &milestones {
            uow.insert_milestone(milestone);
        }
        uow.notify(TransitionNotice::new(
            entity_types::PROJECT,
            project.id,
            None,
            project.status.to_str(),
        ));
        commit_unit(&*self.store, &*self.notifier, uow).await?;

        tracing::info!(
            project_id = %project.id,
            client_id = %client_id,
            budget = %project.total_budget,
            milestones = milestones.len(),
            "Project created"
        );

        Ok(ProjectView {
            escrow: project.escrow(),
            project,
            milestones,
            transactions: Vec::new(),
        })
    }

    /// Runs a status-only transition under the project lock.
    async fn transition<F>(
        &self,
        project_id: Uuid,
        ctx: &OperationContext,
        action: &'static str,
        apply: F,
    ) -> Result<Project, ServiceError>
    where
        F: Fn(&mut Project, &OperationContext) -> Result<(), ServiceError>,
    {
        let apply = &apply;
        retry_on_conflict(|| async move {
            let _guard = self.locks.acquire(&[AggregateKey::Project(project_id)]).await;
            let mut project = load_project(&*self.store, project_id).await?;
            let before = project.clone();
            apply(&mut project, ctx)?;

            let mut uow = UnitOfWork::new();
            stage_project(&mut uow, &self.audit, ctx, action, &before, &mut project);
            commit_unit(&*self.store, &*self.notifier, uow).await?;
            tracing::info!(project_id = %project.id, action, status = project.status.to_str(), "Project updated");
            Ok(project)
        })
        .await
    }

    fn expect_status(project: &Project, expected: ProjectStatus) -> Result<(), ServiceError> {
        if project.status == expected {
            Ok(())
        } else {
            Err(ServiceError::conflict(format!(
                "project {} is {}, not {}",
                project.id,
                project.status.to_str(),
                expected.to_str()
            )))
        }
    }

    fn forbidden(ctx: &OperationContext, action: &'static str) -> ServiceError {
        ServiceError::Forbidden {
            actor: ctx.actor.describe(),
            action,
        }
    }

    /// Names the freelancer on a draft project.
    pub async fn invite_freelancer(
        &self,
        project_id: Uuid,
        freelancer_id: Uuid,
        ctx: &OperationContext,
    ) -> Result<Project, ServiceError> {
        self.transition(project_id, ctx, actions::FREELANCER_INVITED, |project, ctx| {
            if !ctx.actor.is_user(project.client_id) {
                return Err(Self::forbidden(ctx, "invite a freelancer"));
            }
            Self::expect_status(project, ProjectStatus::Draft)?;
            if project.client_id == freelancer_id {
                return Err(ServiceError::Validation("a client cannot hire themselves".to_string()));
            }
            project.freelancer_id = Some(freelancer_id);
            project.status = ProjectStatus::PendingAcceptance;
            Ok(())
        })
        .await
    }

    /// `pending_acceptance -> awaiting_deposit`.
    pub async fn accept(&self, project_id: Uuid, ctx: &OperationContext) -> Result<Project, ServiceError> {
        self.transition(project_id, ctx, actions::PROJECT_ACCEPTED, |project, ctx| {
            match ctx.actor {
                Actor::User(id) if project.is_freelancer(id) => {}
                _ => return Err(Self::forbidden(ctx, "accept this project")),
            }
            Self::expect_status(project, ProjectStatus::PendingAcceptance)?;
            project.status = ProjectStatus::AwaitingDeposit;
            Ok(())
        })
        .await
    }

    /// Operator pause. Milestones cannot start while the project is on hold.
    pub async fn set_on_hold(&self, project_id: Uuid, ctx: &OperationContext) -> Result<Project, ServiceError> {
        self.transition(project_id, ctx, actions::PROJECT_ON_HOLD, |project, ctx| {
            if !ctx.actor.is_operator() {
                return Err(Self::forbidden(ctx, "put a project on hold"));
            }
            Self::expect_status(project, ProjectStatus::Active)?;
            project.status = ProjectStatus::OnHold;
            Ok(())
        })
        .await
    }

    pub async fn resume(&self, project_id: Uuid, ctx: &OperationContext) -> Result<Project, ServiceError> {
        self.transition(project_id, ctx, actions::PROJECT_RESUMED, |project, ctx| {
            if !ctx.actor.is_operator() {
                return Err(Self::forbidden(ctx, "resume a project"));
            }
            Self::expect_status(project, ProjectStatus::OnHold)?;
            project.status = ProjectStatus::Active;
            Ok(())
        })
        .await
    }

    /// Cancels the project and refunds whatever is still held. Not allowed
    /// while a dispute is open or once the project is closed.
    pub async fn cancel(
        &self,
        project_id: Uuid,
        reason: String,
        operation_id: Option<String>,
        ctx: &OperationContext,
    ) -> Result<CancellationOutcome, ServiceError> {
        let reason = &reason;
        let operation_id = &operation_id;
        let outcome = retry_on_conflict(|| async move {
            let _guard = self.locks.acquire(&[AggregateKey::Project(project_id)]).await;
            let mut project = load_project(&*self.store, project_id).await?;

            let allowed = match ctx.actor {
                Actor::User(id) => project.is_client(id),
                Actor::Operator(_) | Actor::System => true,
            };
            if !allowed {
                return Err(Self::forbidden(ctx, "cancel this project"));
            }
            if project.status.is_closed() || project.status == ProjectStatus::Disputed {
                return Err(ServiceError::conflict(format!(
                    "project {} is {} and cannot be cancelled",
                    project.id,
                    project.status.to_str()
                )));
            }

            let before = project.clone();
            let mut uow = UnitOfWork::new();
            let refund = if project.remaining > BigDecimal::zero() {
                let amount = project.remaining.clone();
                Some(self.escrow.plan_refund(
                    &mut uow,
                    ctx,
                    &mut project,
                    None,
                    &amount,
                    reason,
                    operation_id.clone(),
                )?)
            } else {
                None
            };
            // a deposit still in flight can no longer fund the project; if the
            // processor captures it anyway the webhook hands it back
            let in_flight = self.store.project_transactions(project.id).await?;
            for deposit in in_flight
                .iter()
                .filter(|tx| tx.kind == TransactionType::Deposit && tx.is_pending())
            {
                self.escrow
                    .plan_payment_failure(&mut uow, ctx, deposit, "project cancelled before the deposit settled");
            }
            project.status = ProjectStatus::Cancelled;
            stage_project(&mut uow, &self.audit, ctx, actions::PROJECT_CANCELLED, &before, &mut project);
            commit_unit(&*self.store, &*self.notifier, uow).await?;

            tracing::info!(
                project_id = %project.id,
                refunded = %project.total_refunded,
                reason = %reason,
                "Project cancelled"
            );
            Ok(CancellationOutcome { project, refund })
        })
        .await?;

        if let Some(refund) = &outcome.refund {
            self.escrow.dispatch_logged(refund).await;
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn dec(value: &str) -> BigDecimal {
        BigDecimal::from_str(value).unwrap()
    }

    fn new_project(budget: &str, amounts: &[&str]) -> NewProject {
        NewProject {
            freelancer_id: Some(Uuid::new_v4()),
            title: "Brand refresh".to_string(),
            currency: "USD".to_string(),
            total_budget: dec(budget),
            sequential: true,
            milestones: amounts
                .iter()
                .enumerate()
                .map(|(i, amount)| NewMilestone {
                    title: format!("Phase {}", i + 1),
                    amount: dec(amount),
                    deadline: None,
                })
                .collect(),
        }
    }

    #[test]
    fn milestones_must_sum_to_budget() {
        assert!(ProjectService::validate(&new_project("1000", &["500", "500"])).is_ok());
        assert!(matches!(
            ProjectService::validate(&new_project("1000", &["500", "400"])),
            Err(ServiceError::Validation(_))
        ));
    }

    #[test]
    fn rejects_bad_currency_and_amounts() {
        let mut project = new_project("10", &["10"]);
        project.currency = "usd".to_string();
        assert!(ProjectService::validate(&project).is_err());

        let project = new_project("10.001", &["10.001"]);
        assert!(ProjectService::validate(&project).is_err());

        let project = new_project("10", &[]);
        assert!(ProjectService::validate(&project).is_err());
    }
}
