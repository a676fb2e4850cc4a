pub mod config;
pub mod db;
pub mod dtos;
pub mod error;
pub mod handler;
pub mod models;
pub mod routes;
pub mod service;
pub mod utils;

use std::{sync::Arc, time::Duration};

use config::Config;
use db::store::EscrowStore;
use service::{
    advisory_service::{AdvisoryClient, AdvisoryService},
    audit_service::AuditService,
    concurrency::AggregateLocks,
    dispute_service::{DisputePolicy, DisputeService},
    escrow_service::EscrowService,
    milestone_service::{MilestonePolicy, MilestoneService},
    notification_service::NotificationDispatcher,
    payment_provider::PaymentGateway,
    project_service::ProjectService,
    webhook_service::{WebhookPolicy, WebhookService},
};

/// Shared by every handler and background worker.
#[derive(Clone)]
pub struct AppState {
    pub env: Config,
    pub store: Arc<dyn EscrowStore>,
    pub locks: AggregateLocks,
    pub audit_service: AuditService,
    pub escrow_service: EscrowService,
    pub project_service: ProjectService,
    pub milestone_service: MilestoneService,
    pub dispute_service: DisputeService,
    pub webhook_service: WebhookService,
    pub advisory_service: AdvisoryService,
}

impl AppState {
    pub fn new(
        config: Config,
        store: Arc<dyn EscrowStore>,
        gateway: Arc<dyn PaymentGateway>,
        notifier: Arc<dyn NotificationDispatcher>,
        advisory_client: Arc<dyn AdvisoryClient>,
    ) -> Self {
        let locks = AggregateLocks::new();
        let audit_service = AuditService::new(store.clone());
        let advisory_service = AdvisoryService::new(
            advisory_client,
            Duration::from_millis(config.advisory_timeout_ms),
        );

        let escrow_service = EscrowService::new(
            store.clone(),
            gateway,
            audit_service.clone(),
            notifier.clone(),
            locks.clone(),
            config.payout_mode,
        );

        let dispute_service = DisputeService::new(
            store.clone(),
            audit_service.clone(),
            notifier.clone(),
            locks.clone(),
            escrow_service.clone(),
            advisory_service.clone(),
            DisputePolicy {
                fee: config.dispute_fee.clone(),
                mediation_timeout: chrono::Duration::hours(config.mediation_timeout_hours),
                high_value_threshold: config.high_value_dispute_threshold.clone(),
            },
        );

        let milestone_service = MilestoneService::new(
            store.clone(),
            audit_service.clone(),
            notifier.clone(),
            locks.clone(),
            escrow_service.clone(),
            dispute_service.clone(),
            MilestonePolicy {
                auto_approval_period: chrono::Duration::days(config.auto_approval_days),
                max_revisions: config.max_revisions_per_milestone,
                auto_release: config.auto_release_on_approval,
            },
        );

        let project_service = ProjectService::new(
            store.clone(),
            audit_service.clone(),
            notifier.clone(),
            locks.clone(),
            escrow_service.clone(),
        );

        let webhook_service = WebhookService::new(
            store.clone(),
            audit_service.clone(),
            notifier,
            locks.clone(),
            escrow_service.clone(),
            dispute_service.clone(),
            WebhookPolicy {
                secret: config.webhook_secret.clone(),
                max_retries: config.webhook_max_retries,
                processing_lease: chrono::Duration::seconds(config.webhook_processing_lease_secs),
            },
        );

        Self {
            env: config,
            store,
            locks,
            audit_service,
            escrow_service,
            project_service,
            milestone_service,
            dispute_service,
            webhook_service,
            advisory_service,
        }
    }
}
