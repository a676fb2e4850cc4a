// service/webhook_service.rs
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use serde::Serialize;
use serde_json::json;
use sha2::{Digest, Sha256, Sha512};
use subtle::ConstantTimeEq;

use super::{
    audit_service::AuditService,
    commit_unit,
    concurrency::{retry_on_conflict, AggregateKey, AggregateLocks},
    dispute_service::DisputeService,
    error::ServiceError,
    escrow_service::EscrowService,
    load_project,
    notification_service::{NotificationDispatcher, TransitionNotice},
    stage_project,
};
use crate::{
    db::store::{constraints, EscrowStore, StoreError, UnitOfWork},
    models::{
        actor::OperationContext,
        auditmodel::{actions, entity_types},
        escrowmodel::{EscrowTransaction, TransactionStatus, TransactionType},
        projectmodel::ProjectStatus,
        webhookmodel::{
            PaymentEvent, PaymentEventKind, RejectReason, WebhookEvent, WebhookEventStatus, WebhookOutcome,
        },
    },
    utils::currency::from_minor_units,
};

type HmacSha512 = Hmac<Sha512>;

/// Lowercase hex HMAC-SHA512 of the raw body.
pub fn sign_payload(raw: &[u8], secret: &str) -> Result<String, ServiceError> {
    let mut mac = HmacSha512::new_from_slice(secret.as_bytes())
        .map_err(|e| ServiceError::Internal(format!("invalid webhook secret: {}", e)))?;
    mac.update(raw);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Checks the signature against the raw bytes, before anything is parsed.
pub fn verify_signature(raw: &[u8], signature: &str, secret: &str) -> Result<(), ServiceError> {
    let expected = sign_payload(raw, secret)?;
    let provided = signature.trim().to_ascii_lowercase();
    if bool::from(provided.as_bytes().ct_eq(expected.as_bytes())) {
        Ok(())
    } else {
        Err(ServiceError::SignatureVerification)
    }
}

pub fn payload_hash(raw: &[u8]) -> String {
    hex::encode(Sha256::digest(raw))
}

#[derive(Debug, Clone)]
pub struct WebhookPolicy {
    pub secret: String,
    pub max_retries: i32,
    /// How long a `processing` row may sit before the retry sweep reclaims it.
    pub processing_lease: Duration,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RetryReport {
    pub attempted: usize,
    pub applied: usize,
    pub failed: usize,
    pub escalated: usize,
}

/// What a handler did with a parsed event.
enum Handled {
    Changed(Vec<EscrowTransaction>),
    NoOp(&'static str),
    Unsupported(String),
}

#[derive(Clone)]
pub struct WebhookService {
    store: Arc<dyn EscrowStore>,
    audit: AuditService,
    notifier: Arc<dyn NotificationDispatcher>,
    locks: AggregateLocks,
    escrow: EscrowService,
    disputes: DisputeService,
    policy: WebhookPolicy,
}

impl WebhookService {
    pub fn new(
        store: Arc<dyn EscrowStore>,
        audit: AuditService,
        notifier: Arc<dyn NotificationDispatcher>,
        locks: AggregateLocks,
        escrow: EscrowService,
        disputes: DisputeService,
        policy: WebhookPolicy,
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

    /// Verifies, records and applies one delivery. Only storage failures
    /// are errors; everything else is an outcome.
    pub async fn process(&self, raw: &[u8], signature: Option<&str>) -> Result<WebhookOutcome, ServiceError> {
        let verified = match signature {
            Some(signature) => verify_signature(raw, signature, &self.policy.secret),
            None => Err(ServiceError::SignatureVerification),
        };
        if let Err(e) = verified {
            if !matches!(e, ServiceError::SignatureVerification) {
                return Err(e);
            }
            tracing::warn!(bytes = raw.len(), "Rejected webhook with an invalid signature");
            return Ok(WebhookOutcome::Rejected(RejectReason::InvalidSignature));
        }

        let hash = payload_hash(raw);
        let body = String::from_utf8_lossy(raw).into_owned();
        match serde_json::from_slice::<PaymentEvent>(raw) {
            Ok(event) => self.ingest(event, hash, body).await,
            Err(e) => self.store_unparseable(hash, body, e.to_string()).await,
        }
    }

    async fn ingest(&self, event: PaymentEvent, hash: String, body: String) -> Result<WebhookOutcome, ServiceError> {
        if let Some(existing) = self.store.webhook_event(&event.id).await? {
            return self.redeliver(existing, event).await;
        }

        let row = WebhookEvent::new(
            event.id.clone(),
            event.event_type.clone(),
            WebhookEventStatus::Processing,
            hash,
            body,
        );
        let mut uow = UnitOfWork::new();
        uow.insert_webhook_event(&row);
        match self.store.commit(uow.into_parts().0).await {
            Ok(()) => {}
            // a concurrent delivery of the same event got there first
            Err(StoreError::UniqueViolation(c)) if c == constraints::WEBHOOK_EVENT_ID => {
                return Ok(WebhookOutcome::Duplicate);
            }
            Err(e) => return Err(e.into()),
        }

        tracing::info!(event_id = %row.external_id, event_type = %row.event_type, "Webhook received");
        self.run(row, event).await
    }

    async fn redeliver(&self, existing: WebhookEvent, event: PaymentEvent) -> Result<WebhookOutcome, ServiceError> {
        match existing.status {
            WebhookEventStatus::Success | WebhookEventStatus::Processing | WebhookEventStatus::Received => {
                tracing::debug!(event_id = %existing.external_id, status = existing.status.to_str(), "Duplicate webhook");
                Ok(WebhookOutcome::Duplicate)
            }
            WebhookEventStatus::Failed if existing.is_escalated() || existing.retry_count >= self.policy.max_retries => {
                Ok(WebhookOutcome::Rejected(RejectReason::RetriesExhausted))
            }
            WebhookEventStatus::Failed => match self.claim(existing, WebhookEventStatus::Failed).await? {
                Some(row) => self.run(row, event).await,
                None => Ok(WebhookOutcome::Duplicate),
            },
        }
    }

    /// Moves a row to `processing`. `None` when someone else claimed it.
    async fn claim(&self, mut row: WebhookEvent, expected: WebhookEventStatus) -> Result<Option<WebhookEvent>, ServiceError> {
        row.status = WebhookEventStatus::Processing;
        let mut uow = UnitOfWork::new();
        uow.save_webhook_event(&mut row, expected);
        match self.store.commit(uow.into_parts().0).await {
            Ok(()) => Ok(Some(row)),
            Err(StoreError::VersionConflict { .. }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn store_unparseable(&self, hash: String, body: String, error: String) -> Result<WebhookOutcome, ServiceError> {
        let external_id = format!("unparsed:{}", hash);
        if self.store.webhook_event(&external_id).await?.is_some() {
            return Ok(WebhookOutcome::Rejected(RejectReason::Unparseable));
        }

        let mut row = WebhookEvent::new(
            external_id,
            "unknown".to_string(),
            WebhookEventStatus::Failed,
            hash,
            body,
        );
        row.retry_count = 1;
        row.last_error = Some(error.clone());
        let mut uow = UnitOfWork::new();
        uow.insert_webhook_event(&row);
        match self.store.commit(uow.into_parts().0).await {
            Ok(()) | Err(StoreError::UniqueViolation(_)) => {}
            Err(e) => return Err(e.into()),
        }

        tracing::warn!(event_id = %row.external_id, error = %error, "Stored unparseable webhook for retry");
        Ok(WebhookOutcome::Rejected(RejectReason::Unparseable))
    }

    /// Runs the handler for a claimed row and settles the row's status.
    async fn run(&self, row: WebhookEvent, event: PaymentEvent) -> Result<WebhookOutcome, ServiceError> {
        let ctx = OperationContext::system();
        let handled = retry_on_conflict(|| self.handle(&event, &row, &ctx)).await;

        match handled {
            Ok(Handled::Changed(to_dispatch)) => {
                for transaction in &to_dispatch {
                    self.escrow.dispatch_logged(transaction).await;
                }
                tracing::info!(event_id = %row.external_id, event_type = %row.event_type, "Webhook applied");
                Ok(WebhookOutcome::Applied)
            }
            Ok(Handled::NoOp(why)) => {
                tracing::info!(event_id = %row.external_id, why, "Webhook had nothing left to apply");
                Ok(WebhookOutcome::Duplicate)
            }
            Ok(Handled::Unsupported(event_type)) => {
                tracing::info!(event_id = %row.external_id, event_type = %event_type, "Ignoring unsupported webhook type");
                Ok(WebhookOutcome::Rejected(RejectReason::UnsupportedEventType(event_type)))
            }
            Err(e) => self.record_failure(row, &e.to_string()).await,
        }
    }

    async fn record_failure(&self, row: WebhookEvent, error: &str) -> Result<WebhookOutcome, ServiceError> {
        let mut failed = row.clone();
        failed.status = WebhookEventStatus::Failed;
        failed.retry_count += 1;
        failed.last_error = Some(error.to_string());

        let ctx = OperationContext::system();
        let mut uow = UnitOfWork::new();
        let escalate = failed.retry_count >= self.policy.max_retries;
        if escalate {
            failed.escalated_at = Some(Utc::now());
            self.audit.record(
                &mut uow,
                &ctx,
                actions::WEBHOOK_ESCALATED,
                entity_types::WEBHOOK_EVENT,
                &failed.external_id,
                None,
                Some(json!({
                    "event_type": failed.event_type,
                    "retry_count": failed.retry_count,
                    "last_error": failed.last_error,
                })),
            );
            uow.notify(TransitionNotice::new(
                entity_types::WEBHOOK_EVENT,
                &failed.external_id,
                Some(WebhookEventStatus::Failed.to_str()),
                "escalated",
            ));
        }
        uow.save_webhook_event(&mut failed, WebhookEventStatus::Processing);
        match commit_unit(&*self.store, &*self.notifier, uow).await {
            Ok(()) | Err(ServiceError::ConcurrentModification(_)) => {}
            Err(e) => return Err(e),
        }

        if escalate {
            tracing::error!(
                event_id = %failed.external_id,
                retries = failed.retry_count,
                error,
                "Webhook escalated for operator review"
            );
            Ok(WebhookOutcome::Rejected(RejectReason::RetriesExhausted))
        } else {
            tracing::warn!(event_id = %failed.external_id, retries = failed.retry_count, error, "Webhook handler failed");
            Ok(WebhookOutcome::Rejected(RejectReason::HandlerFailed(error.to_string())))
        }
    }

    /// Re-attempts failed rows under the retry limit and reclaims rows whose
    /// processing lease expired.
    pub async fn retry_failed_events(&self, now: DateTime<Utc>) -> Result<RetryReport, ServiceError> {
        let stale_before = now - self.policy.processing_lease;
        let mut report = RetryReport::default();

        for row in self
            .store
            .retryable_webhook_events(self.policy.max_retries, stale_before)
            .await?
        {
            let expected = row.status;
            let Some(row) = self.claim(row, expected).await? else {
                continue;
            };
            report.attempted += 1;

            let outcome = match serde_json::from_str::<PaymentEvent>(&row.raw_payload) {
                Ok(event) => self.run(row, event).await?,
                Err(e) => self.record_failure(row, &format!("unparseable payload: {}", e)).await?,
            };
            match outcome {
                WebhookOutcome::Applied | WebhookOutcome::Duplicate => report.applied += 1,
                WebhookOutcome::Rejected(RejectReason::UnsupportedEventType(_)) => report.applied += 1,
                WebhookOutcome::Rejected(RejectReason::RetriesExhausted) => report.escalated += 1,
                WebhookOutcome::Rejected(_) => report.failed += 1,
            }
        }

        if report.attempted > 0 {
            tracing::info!(
                attempted = report.attempted,
                applied = report.applied,
                failed = report.failed,
                escalated = report.escalated,
                "Webhook retry sweep finished"
            );
        }
        Ok(report)
    }

    // -----------------------------------------------------------------------
    // Handlers
    // -----------------------------------------------------------------------

    fn mark_success(uow: &mut UnitOfWork, row: &WebhookEvent) {
        let mut done = row.clone();
        done.status = WebhookEventStatus::Success;
        done.processed_at = Some(Utc::now());
        done.last_error = None;
        uow.save_webhook_event(&mut done, WebhookEventStatus::Processing);
    }

    /// Commits a unit that only marks the row handled.
    async fn finish_without_change(&self, row: &WebhookEvent) -> Result<(), ServiceError> {
        let mut uow = UnitOfWork::new();
        Self::mark_success(&mut uow, row);
        commit_unit(&*self.store, &*self.notifier, uow).await
    }

    /// The row an event refers to: by processor reference, else by the
    /// idempotency key we sent.
    async fn locate(&self, event: &PaymentEvent) -> Result<Option<EscrowTransaction>, ServiceError> {
        if let Some(reference) = event.data.reference.as_deref() {
            if let Some(found) = self.store.transaction_by_reference(reference).await? {
                return Ok(Some(found));
            }
        }
        match event.data.idempotency_key {
            Some(id) => Ok(self.store.transaction(id).await?),
            None => Ok(None),
        }
    }

    fn lock_keys(transaction: &EscrowTransaction) -> Vec<AggregateKey> {
        let mut keys = vec![AggregateKey::Project(transaction.project_id)];
        if let Some(milestone_id) = transaction.milestone_id {
            keys.push(AggregateKey::Milestone(milestone_id));
        }
        keys
    }

    async fn handle(&self, event: &PaymentEvent, row: &WebhookEvent, ctx: &OperationContext) -> Result<Handled, ServiceError> {
        match event.kind() {
            PaymentEventKind::DepositSucceeded => self.on_deposit(event, row, ctx).await,
            PaymentEventKind::TransferSucceeded | PaymentEventKind::PayoutSucceeded => {
                self.on_settled(event, row, ctx, TransactionType::Release).await
            }
            PaymentEventKind::RefundSucceeded => self.on_settled(event, row, ctx, TransactionType::Refund).await,
            PaymentEventKind::PaymentFailed => self.on_failed(event, row, ctx).await,
            PaymentEventKind::Unsupported(event_type) => {
                self.finish_without_change(row).await?;
                Ok(Handled::Unsupported(event_type))
            }
        }
    }

    async fn on_deposit(&self, event: &PaymentEvent, row: &WebhookEvent, ctx: &OperationContext) -> Result<Handled, ServiceError> {
        let reference = event
            .data
            .reference
            .clone()
            .ok_or_else(|| ServiceError::Validation("deposit event carries no reference".to_string()))?;

        let located = self.locate(event).await?;
        if let Some(fee) = located.as_ref().filter(|tx| tx.kind == TransactionType::Fee) {
            return self.on_fee_paid(fee, &reference, row, ctx).await;
        }
        if let Some(other) = located.as_ref().filter(|tx| tx.kind != TransactionType::Deposit) {
            return Err(ServiceError::Validation(format!(
                "deposit event matched {} transaction {}",
                other.kind.to_str(),
                other.id
            )));
        }

        let project_id = match (&located, event.data.project_id) {
            (Some(tx), _) => tx.project_id,
            (None, Some(project_id)) => project_id,
            (None, None) => {
                return Err(ServiceError::Validation(format!(
                    "no deposit matches reference {}",
                    reference
                )))
            }
        };

        let _guard = self.locks.acquire(&[AggregateKey::Project(project_id)]).await;
        let mut project = load_project(&*self.store, project_id).await?;
        let current = match &located {
            Some(tx) => self.store.transaction(tx.id).await?,
            None => None,
        };

        if current.as_ref().is_some_and(|tx| tx.status == TransactionStatus::Completed) {
            self.finish_without_change(row).await?;
            return Ok(Handled::NoOp("deposit already held"));
        }

        let amount = match event.data.amount {
            Some(minor) => from_minor_units(minor),
            None => current
                .as_ref()
                .map(|tx| tx.amount.clone())
                .unwrap_or_else(|| project.total_budget.clone()),
        };

        let before = project.clone();
        let mut uow = UnitOfWork::new();
        if project.status != ProjectStatus::AwaitingDeposit {
            // the money was captured anyway; hand it back
            let refund = self
                .escrow
                .plan_returned_deposit(&mut uow, ctx, &mut project, current, &amount, &reference)?;
            stage_project(&mut uow, &self.audit, ctx, actions::DEPOSIT_RETURNED, &before, &mut project);
            Self::mark_success(&mut uow, row);
            commit_unit(&*self.store, &*self.notifier, uow).await?;

            tracing::warn!(
                project_id = %project.id,
                reference = %reference,
                status = project.status.to_str(),
                refund_id = %refund.id,
                amount = %amount,
                "Deposit confirmed for a project that is no longer awaiting one; refunding it"
            );
            return Ok(Handled::Changed(vec![refund]));
        }

        let pending = current.filter(|tx| tx.is_pending());
        self.escrow
            .plan_hold(&mut uow, ctx, &mut project, pending, &amount, &reference, None)?;
        stage_project(&mut uow, &self.audit, ctx, actions::ESCROW_HELD, &before, &mut project);
        Self::mark_success(&mut uow, row);
        commit_unit(&*self.store, &*self.notifier, uow).await?;
        Ok(Handled::Changed(Vec::new()))
    }

    async fn on_fee_paid(
        &self,
        fee: &EscrowTransaction,
        reference: &str,
        row: &WebhookEvent,
        ctx: &OperationContext,
    ) -> Result<Handled, ServiceError> {
        let _guard = self.locks.acquire(&Self::lock_keys(fee)).await;
        let Some(fee) = self.store.transaction(fee.id).await?.filter(|tx| tx.is_pending()) else {
            self.finish_without_change(row).await?;
            return Ok(Handled::NoOp("fee already settled"));
        };

        let mut uow = UnitOfWork::new();
        self.escrow.plan_settlement(&mut uow, ctx, &fee, reference);
        self.disputes.plan_fee_payment(&mut uow, ctx, &fee).await?;
        Self::mark_success(&mut uow, row);
        commit_unit(&*self.store, &*self.notifier, uow).await?;
        Ok(Handled::Changed(Vec::new()))
    }

    async fn on_settled(
        &self,
        event: &PaymentEvent,
        row: &WebhookEvent,
        ctx: &OperationContext,
        expected: TransactionType,
    ) -> Result<Handled, ServiceError> {
        let located = self
            .locate(event)
            .await?
            .ok_or_else(|| ServiceError::Validation(format!("no transaction matches event {}", event.id)))?;
        if located.kind != expected {
            return Err(ServiceError::Validation(format!(
                "{} event matched {} transaction {}",
                event.event_type,
                located.kind.to_str(),
                located.id
            )));
        }

        let _guard = self.locks.acquire(&Self::lock_keys(&located)).await;
        let Some(transaction) = self.store.transaction(located.id).await?.filter(|tx| tx.is_pending()) else {
            self.finish_without_change(row).await?;
            return Ok(Handled::NoOp("transaction already settled"));
        };

        let reference = event
            .data
            .reference
            .clone()
            .or_else(|| transaction.external_reference.clone())
            .unwrap_or_else(|| format!("event:{}", event.id));
        let mut uow = UnitOfWork::new();
        self.escrow.plan_settlement(&mut uow, ctx, &transaction, &reference);
        Self::mark_success(&mut uow, row);
        commit_unit(&*self.store, &*self.notifier, uow).await?;
        Ok(Handled::Changed(Vec::new()))
    }

    async fn on_failed(&self, event: &PaymentEvent, row: &WebhookEvent, ctx: &OperationContext) -> Result<Handled, ServiceError> {
        let located = self
            .locate(event)
            .await?
            .ok_or_else(|| ServiceError::Validation(format!("no transaction matches event {}", event.id)))?;

        let _guard = self.locks.acquire(&Self::lock_keys(&located)).await;
        let Some(transaction) = self.store.transaction(located.id).await?.filter(|tx| tx.is_pending()) else {
            self.finish_without_change(row).await?;
            return Ok(Handled::NoOp("transaction is no longer pending"));
        };

        let reason = event
            .data
            .failure_reason
            .clone()
            .unwrap_or_else(|| "payment failed".to_string());
        let mut uow = UnitOfWork::new();
        let replacement = self.escrow.plan_payment_failure(&mut uow, ctx, &transaction, &reason);
        Self::mark_success(&mut uow, row);
        commit_unit(&*self.store, &*self.notifier, uow).await?;

        tracing::warn!(
            transaction_id = %transaction.id,
            kind = transaction.kind.to_str(),
            reason = %reason,
            replacement = ?replacement.as_ref().map(|r| r.id),
            "Payment failed at the processor"
        );
        Ok(Handled::Changed(replacement.into_iter().collect()))
    }
}
