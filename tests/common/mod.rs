#![allow(dead_code)]

use std::{str::FromStr, sync::Arc};

use escrowline::{
    config::Config,
    db::{memorydb::MemoryStore, store::EscrowStore},
    models::{
        actor::{Actor, OperationContext},
        milestonemodel::Milestone,
        projectmodel::{Project, ProjectStatus},
        webhookmodel::WebhookOutcome,
    },
    service::{
        advisory_service::DisabledAdvisory,
        notification_service::{ChannelDispatcher, TransitionNotice},
        payment_provider::StubPaymentGateway,
        project_service::{NewMilestone, NewProject, ProjectView},
        webhook_service::sign_payload,
    },
    utils::currency::to_minor_units,
    AppState,
};
use serde_json::json;
use sqlx::types::BigDecimal;
use tokio::sync::mpsc::Receiver;
use uuid::Uuid;

pub const SECRET: &str = "whsec_test_secret";

pub fn dec(value: &str) -> BigDecimal {
    BigDecimal::from_str(value).unwrap()
}

pub struct Harness {
    pub state: Arc<AppState>,
    pub store: Arc<MemoryStore>,
    pub gateway: Arc<StubPaymentGateway>,
    pub notices: Receiver<TransitionNotice>,
    pub client: Uuid,
    pub freelancer: Uuid,
    pub operator: Uuid,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(Config::for_memory(SECRET))
    }

    pub fn with_config(config: Config) -> Self {
        let store = Arc::new(MemoryStore::new());
        let gateway = Arc::new(StubPaymentGateway::new());
        let (dispatcher, notices) = ChannelDispatcher::new(config.notification_queue_capacity);
        let state = Arc::new(AppState::new(
            config,
            store.clone(),
            gateway.clone(),
            Arc::new(dispatcher),
            Arc::new(DisabledAdvisory),
        ));

        Self {
            state,
            store,
            gateway,
            notices,
            client: Uuid::new_v4(),
            freelancer: Uuid::new_v4(),
            operator: Uuid::new_v4(),
        }
    }

    pub fn client_ctx(&self) -> OperationContext {
        OperationContext::new(Actor::User(self.client))
    }

    pub fn freelancer_ctx(&self) -> OperationContext {
        OperationContext::new(Actor::User(self.freelancer))
    }

    pub fn operator_ctx(&self) -> OperationContext {
        OperationContext::new(Actor::Operator(self.operator))
    }

    /// A project the freelancer has already accepted.
    pub async fn accepted_project(&self, amounts: &[&str], sequential: bool) -> ProjectView {
        let total = amounts.iter().fold(dec("0"), |sum, a| sum + dec(a));
        let new = NewProject {
            freelancer_id: Some(self.freelancer),
            title: "Storefront rebuild".to_string(),
            currency: "USD".to_string(),
            total_budget: total,
            sequential,
            milestones: amounts
                .iter()
                .enumerate()
                .map(|(i, amount)| NewMilestone {
                    title: format!("Milestone {}", i + 1),
                    amount: dec(amount),
                    deadline: None,
                })
                .collect(),
        };
        let view = self
            .state
            .project_service
            .create(new, &self.client_ctx())
            .await
            .unwrap();
        self.state
            .project_service
            .accept(view.project.id, &self.freelancer_ctx())
            .await
            .unwrap();
        self.state.project_service.view(view.project.id).await.unwrap()
    }

    /// Funds the project through a signed deposit webhook.
    pub async fn fund(&self, project: &Project) -> WebhookOutcome {
        let minor = to_minor_units(&project.total_budget).unwrap();
        let event = deposit_event(
            &format!("evt_dep_{}", project.id.simple()),
            project.id,
            &format!("ch_{}", project.id.simple()),
            minor,
        );
        self.deliver(&event).await
    }

    /// A funded, active project.
    pub async fn funded_project(&self, amounts: &[&str], sequential: bool) -> ProjectView {
        let view = self.accepted_project(amounts, sequential).await;
        assert_eq!(self.fund(&view.project).await, WebhookOutcome::Applied);
        self.state.project_service.view(view.project.id).await.unwrap()
    }

    pub async fn deliver(&self, event: &serde_json::Value) -> WebhookOutcome {
        let raw = serde_json::to_vec(event).unwrap();
        let signature = sign_payload(&raw, SECRET).unwrap();
        self.state
            .webhook_service
            .process(&raw, Some(&signature))
            .await
            .unwrap()
    }

    /// Drives a milestone from pending to submitted.
    pub async fn submit(&self, milestone_id: Uuid) -> Milestone {
        let ctx = self.freelancer_ctx();
        self.state.milestone_service.start(milestone_id, &ctx).await.unwrap();
        self.state.milestone_service.submit(milestone_id, &ctx).await.unwrap()
    }

    pub async fn project(&self, id: Uuid) -> Project {
        self.store.project(id).await.unwrap().unwrap()
    }

    pub async fn milestone(&self, id: Uuid) -> Milestone {
        self.store.milestone(id).await.unwrap().unwrap()
    }

    pub fn drain_notices(&mut self) -> Vec<TransitionNotice> {
        let mut drained = Vec::new();
        while let Ok(notice) = self.notices.try_recv() {
            drained.push(notice);
        }
        drained
    }
}

pub fn deposit_event(id: &str, project_id: Uuid, reference: &str, amount_minor: i64) -> serde_json::Value {
    json!({
        "id": id,
        "type": "deposit.succeeded",
        "data": {
            "reference": reference,
            "amount": amount_minor,
            "currency": "USD",
            "project_id": project_id,
        }
    })
}

pub fn settled_event(id: &str, event_type: &str, reference: &str) -> serde_json::Value {
    json!({
        "id": id,
        "type": event_type,
        "data": { "reference": reference }
    })
}

pub fn failed_event(id: &str, reference: &str, reason: &str) -> serde_json::Value {
    json!({
        "id": id,
        "type": "payment.failed",
        "data": { "reference": reference, "failure_reason": reason }
    })
}

pub fn assert_ledger_balanced(project: &Project) {
    assert!(
        project.ledger_balanced(),
        "held {} - released {} - refunded {} != remaining {}",
        project.total_held,
        project.total_released,
        project.total_refunded,
        project.remaining
    );
    assert!(project.remaining >= dec("0"));
}

pub fn assert_status(project: &Project, status: ProjectStatus) {
    assert_eq!(project.status, status, "project {} status", project.id);
}
