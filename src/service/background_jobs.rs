// service/background_jobs.rs
use std::{future::Future, sync::Arc};

use chrono::Utc;
use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::{interval, Duration, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

use crate::{
    service::notification_service::{run_delivery, NotificationSink, TransitionNotice},
    AppState,
};

/// Background tasks owned by the application. Constructed explicitly in
/// `main`, stopped with [`WorkerRegistry::shutdown`].
pub struct WorkerRegistry {
    cancel: CancellationToken,
    workers: Vec<(&'static str, JoinHandle<()>)>,
}

impl Default for WorkerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
            workers: Vec::new(),
        }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.workers.iter().map(|(name, _)| *name).collect()
    }

    pub fn spawn<F>(&mut self, name: &'static str, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        tracing::info!(worker = name, "Starting background worker");
        self.workers.push((name, tokio::spawn(task)));
    }

    /// Spawns the sweeps and the notification delivery loop.
    pub fn start(
        &mut self,
        app_state: Arc<AppState>,
        notices: mpsc::Receiver<TransitionNotice>,
        sink: Arc<dyn NotificationSink>,
    ) {
        let every = Duration::from_secs(app_state.env.sweep_interval_secs.max(1));

        self.spawn(
            "notification_delivery",
            run_delivery(notices, sink, self.cancel_token()),
        );

        let state = app_state.clone();
        self.spawn(
            "auto_approval",
            run_every("auto_approval", every, self.cancel_token(), move || {
                let state = state.clone();
                async move { run_auto_approval(&state).await }
            }),
        );

        let state = app_state.clone();
        self.spawn(
            "mediation_timeout",
            run_every("mediation_timeout", every, self.cancel_token(), move || {
                let state = state.clone();
                async move { run_mediation_timeout(&state).await }
            }),
        );

        let state = app_state.clone();
        self.spawn(
            "webhook_retry",
            run_every("webhook_retry", every, self.cancel_token(), move || {
                let state = state.clone();
                async move { run_webhook_retry(&state).await }
            }),
        );

        let state = app_state.clone();
        self.spawn(
            "payment_dispatch",
            run_every("payment_dispatch", every, self.cancel_token(), move || {
                let state = state.clone();
                async move { run_payment_dispatch(&state).await }
            }),
        );

        if app_state.env.audit_retention_days.is_some() {
            let state = app_state.clone();
            self.spawn(
                "audit_retention",
                run_every(
                    "audit_retention",
                    Duration::from_secs(6 * 3600),
                    self.cancel_token(),
                    move || {
                        let state = state.clone();
                        async move { run_audit_retention(&state).await }
                    },
                ),
            );
        }

        let state = app_state;
        self.spawn(
            "lock_prune",
            run_every("lock_prune", Duration::from_secs(600), self.cancel_token(), move || {
                let state = state.clone();
                async move {
                    let pruned = state.locks.prune().await;
                    if pruned > 0 {
                        tracing::debug!(pruned, "Pruned idle aggregate locks");
                    }
                }
            }),
        );
    }

    /// Cancels every worker and waits for them to stop.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        let (names, handles): (Vec<_>, Vec<_>) = self.workers.into_iter().unzip();
        let results = futures::future::join_all(handles).await;
        for (name, result) in names.into_iter().zip(results) {
            match result {
                Ok(()) => tracing::info!(worker = name, "Background worker stopped"),
                Err(e) => tracing::error!(worker = name, error = %e, "Background worker panicked"),
            }
        }
    }
}

/// Runs `job` on a fixed interval until `cancel` fires.
pub async fn run_every<F, Fut>(name: &'static str, period: Duration, cancel: CancellationToken, mut job: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tracing::info!(job = name, interval_secs = period.as_secs(), "Job scheduled");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!(job = name, "Job stopping");
                break;
            }
            _ = ticker.tick() => job().await,
        }
    }
}

pub async fn run_auto_approval(app_state: &AppState) {
    match app_state.milestone_service.run_auto_approval_sweep(Utc::now()).await {
        Ok(report) if report.approved + report.skipped > 0 => tracing::info!(
            approved = report.approved,
            skipped = report.skipped,
            "Auto-approval sweep completed"
        ),
        Ok(_) => tracing::debug!("Auto-approval sweep found nothing due"),
        Err(e) => tracing::error!(error = %e, "Auto-approval sweep failed"),
    }
}

pub async fn run_mediation_timeout(app_state: &AppState) {
    match app_state.dispute_service.escalate_stale_mediations(Utc::now()).await {
        Ok(0) => tracing::debug!("No stale mediations"),
        Ok(escalated) => tracing::info!(escalated, "Moved stale mediations to arbitration"),
        Err(e) => tracing::error!(error = %e, "Mediation timeout sweep failed"),
    }
}

pub async fn run_webhook_retry(app_state: &AppState) {
    if let Err(e) = app_state.webhook_service.retry_failed_events(Utc::now()).await {
        tracing::error!(error = %e, "Webhook retry sweep failed");
    }
}

pub async fn run_payment_dispatch(app_state: &AppState) {
    if let Err(e) = app_state.escrow_service.dispatch_pending().await {
        tracing::error!(error = %e, "Payment dispatch sweep failed");
    }
}

pub async fn run_audit_retention(app_state: &AppState) {
    let Some(days) = app_state.env.audit_retention_days else {
        return;
    };
    let cutoff = Utc::now() - chrono::Duration::days(days);
    match app_state.audit_service.purge_older_than(cutoff).await {
        Ok(0) => tracing::debug!("Audit retention: no entries to purge"),
        Ok(deleted) => tracing::info!(deleted, retention_days = days, "Audit retention: purged old entries"),
        Err(e) => tracing::error!(error = %e, "Audit retention failed"),
    }
}
