mod common;

use assert_matches::assert_matches;
use chrono::{Duration, Utc};
use common::*;
use escrowline::{
    config::Config,
    db::store::EscrowStore,
    models::{
        auditmodel::{actions, AuditQuery},
        escrowmodel::{TransactionStatus, TransactionType},
        projectmodel::ProjectStatus,
        webhookmodel::{RejectReason, WebhookEventStatus, WebhookOutcome},
    },
    service::{
        payment_provider::{GatewayOperation, StubFailure, StubPaymentGateway},
        webhook_service::{payload_hash, sign_payload},
    },
};
use serde_json::json;

#[tokio::test]
async fn forged_signature_is_rejected_and_not_stored() {
    let h = Harness::new();
    let view = h.accepted_project(&["500.00"], false).await;
    let raw = serde_json::to_vec(&deposit_event("evt_forged", view.project.id, "ch_x", 50_000)).unwrap();
    let forged = sign_payload(&raw, "not-the-secret").unwrap();

    let outcome = h.state.webhook_service.process(&raw, Some(&forged)).await.unwrap();
    assert_eq!(outcome, WebhookOutcome::Rejected(RejectReason::InvalidSignature));

    let missing = h.state.webhook_service.process(&raw, None).await.unwrap();
    assert_eq!(missing, WebhookOutcome::Rejected(RejectReason::InvalidSignature));

    assert!(h.store.webhook_event("evt_forged").await.unwrap().is_none());
    assert_status(&h.project(view.project.id).await, ProjectStatus::AwaitingDeposit);
}

#[tokio::test]
async fn unparseable_body_is_kept_for_inspection() {
    let h = Harness::new();
    let raw = b"{\"id\": \"evt_broken\", \"type\": ";
    let signature = sign_payload(raw, SECRET).unwrap();

    let outcome = h.state.webhook_service.process(raw, Some(&signature)).await.unwrap();
    assert_eq!(outcome, WebhookOutcome::Rejected(RejectReason::Unparseable));

    let stored = h
        .store
        .webhook_event(&format!("unparsed:{}", payload_hash(raw)))
        .await
        .unwrap()
        .expect("stored row");
    assert_eq!(stored.status, WebhookEventStatus::Failed);
    assert_eq!(stored.retry_count, 1);
    assert!(stored.last_error.is_some());

    // a second identical delivery does not add another row
    let again = h.state.webhook_service.process(raw, Some(&signature)).await.unwrap();
    assert_eq!(again, WebhookOutcome::Rejected(RejectReason::Unparseable));
}

#[tokio::test]
async fn unsupported_event_types_are_acknowledged() {
    let h = Harness::new();
    let event = json!({ "id": "evt_misc", "type": "customer.updated", "data": {} });

    let outcome = h.deliver(&event).await;
    assert_matches!(outcome, WebhookOutcome::Rejected(RejectReason::UnsupportedEventType(t)) if t == "customer.updated");

    let row = h.store.webhook_event("evt_misc").await.unwrap().unwrap();
    assert_eq!(row.status, WebhookEventStatus::Success);
}

#[tokio::test]
async fn second_deposit_for_a_funded_project_is_refunded() {
    let h = Harness::new();
    let view = h.funded_project(&["500.00"], false).await;

    let late = deposit_event("evt_late", view.project.id, "ch_late", 50_000);
    assert_eq!(h.deliver(&late).await, WebhookOutcome::Applied);

    let project = h.project(view.project.id).await;
    assert_status(&project, ProjectStatus::Active);
    assert_eq!(project.total_held, dec("1000.00"));
    assert_eq!(project.total_refunded, dec("500.00"));
    assert_eq!(project.remaining, dec("500.00"));
    assert_ledger_balanced(&project);

    let rows = h.store.project_transactions(view.project.id).await.unwrap();
    let refund = rows
        .iter()
        .find(|tx| tx.kind == TransactionType::Refund)
        .expect("refund row");
    assert_eq!(refund.amount, dec("500.00"));
    assert!(refund.external_reference.is_some());
    assert_eq!(h.gateway.calls_for(GatewayOperation::Refund).len(), 1);

    // the same capture delivered again changes nothing
    let again = deposit_event("evt_late_again", view.project.id, "ch_late", 50_000);
    assert_eq!(h.deliver(&again).await, WebhookOutcome::Duplicate);
    assert_eq!(h.gateway.calls_for(GatewayOperation::Refund).len(), 1);
}

#[tokio::test]
async fn deposit_confirmed_after_cancellation_is_refunded() {
    let h = Harness::new();
    let view = h.accepted_project(&["500.00"], false).await;
    let started = h
        .state
        .escrow_service
        .initiate_deposit(view.project.id, None, &h.client_ctx())
        .await
        .unwrap();
    let reference = started.transaction.external_reference.clone().unwrap();

    h.state
        .project_service
        .cancel(view.project.id, "changed plans".to_string(), None, &h.client_ctx())
        .await
        .unwrap();
    let deposit = h.store.transaction(started.transaction.id).await.unwrap().unwrap();
    assert_eq!(deposit.status, TransactionStatus::Failed);

    let event = deposit_event("evt_after_cancel", view.project.id, &reference, 50_000);
    assert_eq!(h.deliver(&event).await, WebhookOutcome::Applied);

    let project = h.project(view.project.id).await;
    assert_status(&project, ProjectStatus::Cancelled);
    assert_eq!(project.total_held, dec("500.00"));
    assert_eq!(project.total_refunded, dec("500.00"));
    assert_eq!(project.remaining, dec("0.00"));
    assert_ledger_balanced(&project);

    let rows = h.store.project_transactions(view.project.id).await.unwrap();
    assert_eq!(rows.len(), 2);
    let deposit = rows.iter().find(|tx| tx.id == started.transaction.id).unwrap();
    assert_eq!(deposit.status, TransactionStatus::Completed);
    let refund = rows
        .iter()
        .find(|tx| tx.kind == TransactionType::Refund)
        .expect("refund row");
    assert_eq!(refund.amount, dec("500.00"));
    assert!(refund.is_pending());
    let refund_calls = h.gateway.calls_for(GatewayOperation::Refund);
    assert_eq!(refund_calls.len(), 1);
    assert_eq!(refund_calls[0].counterparty, Some(h.client));

    let returned = h
        .state
        .audit_service
        .query(AuditQuery {
            action: Some(actions::DEPOSIT_RETURNED.to_string()),
            limit: 10,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(returned.len(), 1);
}

#[tokio::test]
async fn repeated_handler_failures_escalate() {
    let mut config = Config::for_memory(SECRET);
    config.webhook_max_retries = 3;
    let mut h = Harness::with_config(config);
    let event = settled_event("evt_orphan", "transfer.succeeded", "trf_unknown");

    assert_matches!(
        h.deliver(&event).await,
        WebhookOutcome::Rejected(RejectReason::HandlerFailed(_))
    );
    assert_matches!(
        h.deliver(&event).await,
        WebhookOutcome::Rejected(RejectReason::HandlerFailed(_))
    );
    h.drain_notices();
    assert_eq!(
        h.deliver(&event).await,
        WebhookOutcome::Rejected(RejectReason::RetriesExhausted)
    );

    let row = h.store.webhook_event("evt_orphan").await.unwrap().unwrap();
    assert_eq!(row.status, WebhookEventStatus::Failed);
    assert_eq!(row.retry_count, 3);
    assert!(row.escalated_at.is_some());

    let escalations = h
        .state
        .audit_service
        .query(AuditQuery {
            action: Some(actions::WEBHOOK_ESCALATED.to_string()),
            limit: 10,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(escalations.len(), 1);
    assert_eq!(escalations[0].entity_id, "evt_orphan");

    let notices = h.drain_notices();
    assert!(notices.iter().any(|n| n.entity_id == "evt_orphan" && n.to_state == "escalated"));

    // once escalated, further deliveries are not attempted
    assert_eq!(
        h.deliver(&event).await,
        WebhookOutcome::Rejected(RejectReason::RetriesExhausted)
    );
    let swept = h.state.webhook_service.retry_failed_events(Utc::now()).await.unwrap();
    assert_eq!(swept.attempted, 0);
}

#[tokio::test]
async fn retry_sweep_applies_an_event_that_arrived_early() {
    let h = Harness::new();
    let view = h.funded_project(&["500.00"], false).await;
    let m1 = view.milestones[0].id;
    h.submit(m1).await;

    // the processor call times out, so the row has no reference yet
    h.gateway.fail_next(StubFailure::Unavailable);
    let release = h
        .state
        .milestone_service
        .approve(m1, &h.client_ctx())
        .await
        .unwrap()
        .release
        .unwrap()
        .transaction;
    let reference = StubPaymentGateway::reference_for(GatewayOperation::Transfer, release.id);

    let event = settled_event("evt_early", "transfer.succeeded", &reference);
    assert_matches!(
        h.deliver(&event).await,
        WebhookOutcome::Rejected(RejectReason::HandlerFailed(_))
    );

    h.state.escrow_service.dispatch_pending().await.unwrap();
    let report = h.state.webhook_service.retry_failed_events(Utc::now()).await.unwrap();
    assert_eq!(report.attempted, 1);
    assert_eq!(report.applied, 1);

    let row = h.store.webhook_event("evt_early").await.unwrap().unwrap();
    assert_eq!(row.status, WebhookEventStatus::Success);
    let transaction = h.store.transaction(release.id).await.unwrap().unwrap();
    assert_eq!(transaction.status, TransactionStatus::Completed);
}

#[tokio::test]
async fn retry_sweep_ignores_fresh_rows_in_processing() {
    let h = Harness::new();
    let view = h.funded_project(&["500.00"], false).await;

    let report = h.state.webhook_service.retry_failed_events(Utc::now()).await.unwrap();
    assert_eq!(report.attempted, 0);

    // well past the lease, a handled event is still not picked up again
    let later = h
        .state
        .webhook_service
        .retry_failed_events(Utc::now() + Duration::hours(1))
        .await
        .unwrap();
    assert_eq!(later.attempted, 0);
    assert_eq!(h.project(view.project.id).await.total_held, dec("500.00"));
}

#[tokio::test]
async fn refund_webhook_settles_by_idempotency_key() {
    let h = Harness::new();
    let view = h.funded_project(&["500.00"], false).await;
    let receipt = h
        .state
        .escrow_service
        .refund(
            escrowline::service::escrow_service::RefundRequest {
                project_id: view.project.id,
                milestone_id: None,
                amount: dec("100.00"),
                reason: "Duplicate charge".to_string(),
                operation_id: None,
            },
            &h.operator_ctx(),
        )
        .await
        .unwrap();

    let event = json!({
        "id": "evt_rfd",
        "type": "refund.succeeded",
        "data": { "idempotency_key": receipt.transaction.id }
    });
    assert_eq!(h.deliver(&event).await, WebhookOutcome::Applied);

    let row = h.store.transaction(receipt.transaction.id).await.unwrap().unwrap();
    assert_eq!(row.status, TransactionStatus::Completed);
}
