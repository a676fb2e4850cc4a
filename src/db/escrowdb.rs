// db/escrowdb.rs
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgQueryResult, Postgres, QueryBuilder, Transaction};
use uuid::Uuid;

use super::{
    db::DBClient,
    store::{EscrowStore, StoreError, Write},
};
use crate::models::{
    auditmodel::{AuditEntry, AuditQuery},
    disputemodel::Dispute,
    escrowmodel::EscrowTransaction,
    milestonemodel::Milestone,
    projectmodel::Project,
    webhookmodel::WebhookEvent,
};

const PROJECT_COLUMNS: &str = "id, client_id, freelancer_id, title, total_budget, currency, status, \
    sequential, escrow_status, total_held, total_released, total_refunded, remaining, version, \
    created_at, updated_at";

const MILESTONE_COLUMNS: &str = "id, project_id, title, order_index, amount, status, revision_count, \
    deadline, submitted_at, approved_at, paid_at, version, created_at, updated_at";

const TRANSACTION_COLUMNS: &str = "id, project_id, milestone_id, amount, kind, status, \
    external_reference, operation_id, replaces_id, failure_reason, created_at, completed_at";

const DISPUTE_COLUMNS: &str = "id, project_id, milestone_id, raised_by, reason, status, \
    fee_transaction_id, client_proposal, client_proposal_share, freelancer_proposal, \
    freelancer_proposal_share, decision, decision_share, resolution_summary, resolved_by, \
    mediation_started_at, arbitration_started_at, escalated_at, resolved_at, version, \
    created_at, updated_at";

const WEBHOOK_COLUMNS: &str = "external_id, event_type, status, retry_count, payload_hash, \
    raw_payload, last_error, received_at, processed_at, escalated_at, updated_at";

const AUDIT_COLUMNS: &str = "id, action, entity_type, entity_id, actor_id, old_values, new_values, \
    correlation_id, created_at";

fn map_write_error(err: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db_err) = &err {
        if db_err.code().as_deref() == Some("23505") {
            return StoreError::UniqueViolation(db_err.constraint().unwrap_or("unknown").to_string());
        }
    }
    StoreError::Database(err)
}

fn expect_one(result: PgQueryResult, entity: &'static str, id: impl ToString) -> Result<(), StoreError> {
    if result.rows_affected() == 1 {
        Ok(())
    } else {
        Err(StoreError::VersionConflict {
            entity,
            id: id.to_string(),
        })
    }
}

impl DBClient {
    async fn apply(&self, tx: &mut Transaction<'_, Postgres>, write: Write) -> Result<(), StoreError> {
        match write {
            Write::InsertProject(p) => {
                sqlx::query(
                    r#"
                    INSERT INTO projects
                    (id, client_id, freelancer_id, title, total_budget, currency, status, sequential,
                     escrow_status, total_held, total_released, total_refunded, remaining, version,
                     created_at, updated_at)
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
                    "#,
                )
                .bind(p.id)
                .bind(p.client_id)
                .bind(p.freelancer_id)
                .bind(&p.title)
                .bind(&p.total_budget)
                .bind(&p.currency)
                .bind(p.status)
                .bind(p.sequential)
                .bind(p.escrow_status)
                .bind(&p.total_held)
                .bind(&p.total_released)
                .bind(&p.total_refunded)
                .bind(&p.remaining)
                .bind(p.version)
                .bind(p.created_at)
                .bind(p.updated_at)
                .execute(&mut **tx)
                .await
                .map_err(map_write_error)?;
            }
            Write::UpdateProject { row: p, expected_version } => {
                let result = sqlx::query(
                    r#"
                    UPDATE projects
                    SET freelancer_id = $2, status = $3, escrow_status = $4, total_held = $5,
                        total_released = $6, total_refunded = $7, remaining = $8, version = $9,
                        updated_at = $10
                    WHERE id = $1 AND version = $11
                    "#,
                )
                .bind(p.id)
                .bind(p.freelancer_id)
                .bind(p.status)
                .bind(p.escrow_status)
                .bind(&p.total_held)
                .bind(&p.total_released)
                .bind(&p.total_refunded)
                .bind(&p.remaining)
                .bind(p.version)
                .bind(p.updated_at)
                .bind(expected_version)
                .execute(&mut **tx)
                .await
                .map_err(map_write_error)?;
                expect_one(result, "project", p.id)?;
            }
            Write::InsertMilestone(m) => {
                sqlx::query(
                    r#"
                    INSERT INTO milestones
                    (id, project_id, title, order_index, amount, status, revision_count, deadline,
                     submitted_at, approved_at, paid_at, version, created_at, updated_at)
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
                    "#,
                )
                .bind(m.id)
                .bind(m.project_id)
                .bind(&m.title)
                .bind(m.order_index)
                .bind(&m.amount)
                .bind(m.status)
                .bind(m.revision_count)
                .bind(m.deadline)
                .bind(m.submitted_at)
                .bind(m.approved_at)
                .bind(m.paid_at)
                .bind(m.version)
                .bind(m.created_at)
                .bind(m.updated_at)
                .execute(&mut **tx)
                .await
                .map_err(map_write_error)?;
            }
            Write::UpdateMilestone { row: m, expected_version } => {
                let result = sqlx::query(
                    r#"
                    UPDATE milestones
                    SET status = $2, revision_count = $3, submitted_at = $4, approved_at = $5,
                        paid_at = $6, version = $7, updated_at = $8
                    WHERE id = $1 AND version = $9
                    "#,
                )
                .bind(m.id)
                .bind(m.status)
                .bind(m.revision_count)
                .bind(m.submitted_at)
                .bind(m.approved_at)
                .bind(m.paid_at)
                .bind(m.version)
                .bind(m.updated_at)
                .bind(expected_version)
                .execute(&mut **tx)
                .await
                .map_err(map_write_error)?;
                expect_one(result, "milestone", m.id)?;
            }
            Write::InsertTransaction(t) => {
                sqlx::query(
                    r#"
                    INSERT INTO escrow_transactions
                    (id, project_id, milestone_id, amount, kind, status, external_reference,
                     operation_id, replaces_id, failure_reason, created_at, completed_at)
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
                    "#,
                )
                .bind(t.id)
                .bind(t.project_id)
                .bind(t.milestone_id)
                .bind(&t.amount)
                .bind(t.kind)
                .bind(t.status)
                .bind(&t.external_reference)
                .bind(&t.operation_id)
                .bind(t.replaces_id)
                .bind(&t.failure_reason)
                .bind(t.created_at)
                .bind(t.completed_at)
                .execute(&mut **tx)
                .await
                .map_err(map_write_error)?;
            }
            Write::UpdateTransaction { row: t, expected_status } => {
                let result = sqlx::query(
                    r#"
                    UPDATE escrow_transactions
                    SET status = $2, external_reference = $3, operation_id = $4,
                        failure_reason = $5, completed_at = $6
                    WHERE id = $1 AND status = $7 AND status <> 'completed'
                    "#,
                )
                .bind(t.id)
                .bind(t.status)
                .bind(&t.external_reference)
                .bind(&t.operation_id)
                .bind(&t.failure_reason)
                .bind(t.completed_at)
                .bind(expected_status)
                .execute(&mut **tx)
                .await
                .map_err(map_write_error)?;
                expect_one(result, "escrow transaction", t.id)?;
            }
            Write::InsertDispute(d) => {
                sqlx::query(
                    r#"
                    INSERT INTO disputes
                    (id, project_id, milestone_id, raised_by, reason, status, fee_transaction_id,
                     client_proposal, client_proposal_share, freelancer_proposal,
                     freelancer_proposal_share, decision, decision_share, resolution_summary,
                     resolved_by, mediation_started_at, arbitration_started_at, escalated_at,
                     resolved_at, version, created_at, updated_at)
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16,
                            $17, $18, $19, $20, $21, $22)
                    "#,
                )
                .bind(d.id)
                .bind(d.project_id)
                .bind(d.milestone_id)
                .bind(d.raised_by)
                .bind(&d.reason)
                .bind(d.status)
                .bind(d.fee_transaction_id)
                .bind(d.client_proposal)
                .bind(d.client_proposal_share)
                .bind(d.freelancer_proposal)
                .bind(d.freelancer_proposal_share)
                .bind(d.decision)
                .bind(d.decision_share)
                .bind(&d.resolution_summary)
                .bind(d.resolved_by)
                .bind(d.mediation_started_at)
                .bind(d.arbitration_started_at)
                .bind(d.escalated_at)
                .bind(d.resolved_at)
                .bind(d.version)
                .bind(d.created_at)
                .bind(d.updated_at)
                .execute(&mut **tx)
                .await
                .map_err(map_write_error)?;
            }
            Write::UpdateDispute { row: d, expected_version } => {
                let result = sqlx::query(
                    r#"
                    UPDATE disputes
                    SET status = $2, fee_transaction_id = $3, client_proposal = $4,
                        client_proposal_share = $5, freelancer_proposal = $6,
                        freelancer_proposal_share = $7, decision = $8, decision_share = $9,
                        resolution_summary = $10, resolved_by = $11, mediation_started_at = $12,
                        arbitration_started_at = $13, escalated_at = $14, resolved_at = $15,
                        version = $16, updated_at = $17
                    WHERE id = $1 AND version = $18
                    "#,
                )
                .bind(d.id)
                .bind(d.status)
                .bind(d.fee_transaction_id)
                .bind(d.client_proposal)
                .bind(d.client_proposal_share)
                .bind(d.freelancer_proposal)
                .bind(d.freelancer_proposal_share)
                .bind(d.decision)
                .bind(d.decision_share)
                .bind(&d.resolution_summary)
                .bind(d.resolved_by)
                .bind(d.mediation_started_at)
                .bind(d.arbitration_started_at)
                .bind(d.escalated_at)
                .bind(d.resolved_at)
                .bind(d.version)
                .bind(d.updated_at)
                .bind(expected_version)
                .execute(&mut **tx)
                .await
                .map_err(map_write_error)?;
                expect_one(result, "dispute", d.id)?;
            }
            Write::InsertWebhookEvent(e) => {
                sqlx::query(
                    r#"
                    INSERT INTO webhook_events
                    (external_id, event_type, status, retry_count, payload_hash, raw_payload,
                     last_error, received_at, processed_at, escalated_at, updated_at)
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                    "#,
                )
                .bind(&e.external_id)
                .bind(&e.event_type)
                .bind(e.status)
                .bind(e.retry_count)
                .bind(&e.payload_hash)
                .bind(&e.raw_payload)
                .bind(&e.last_error)
                .bind(e.received_at)
                .bind(e.processed_at)
                .bind(e.escalated_at)
                .bind(e.updated_at)
                .execute(&mut **tx)
                .await
                .map_err(map_write_error)?;
            }
            Write::UpdateWebhookEvent { row: e, expected_status } => {
                let result = sqlx::query(
                    r#"
                    UPDATE webhook_events
                    SET event_type = $2, status = $3, retry_count = $4, last_error = $5,
                        processed_at = $6, escalated_at = $7, updated_at = $8
                    WHERE external_id = $1 AND status = $9
                    "#,
                )
                .bind(&e.external_id)
                .bind(&e.event_type)
                .bind(e.status)
                .bind(e.retry_count)
                .bind(&e.last_error)
                .bind(e.processed_at)
                .bind(e.escalated_at)
                .bind(e.updated_at)
                .bind(expected_status)
                .execute(&mut **tx)
                .await
                .map_err(map_write_error)?;
                expect_one(result, "webhook event", &e.external_id)?;
            }
            Write::InsertAudit(a) => {
                sqlx::query(
                    r#"
                    INSERT INTO audit_entries
                    (id, action, entity_type, entity_id, actor_id, old_values, new_values,
                     correlation_id, created_at)
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                    "#,
                )
                .bind(a.id)
                .bind(&a.action)
                .bind(&a.entity_type)
                .bind(&a.entity_id)
                .bind(a.actor_id)
                .bind(&a.old_values)
                .bind(&a.new_values)
                .bind(a.correlation_id)
                .bind(a.created_at)
                .execute(&mut **tx)
                .await
                .map_err(map_write_error)?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl EscrowStore for DBClient {
    async fn project(&self, id: Uuid) -> Result<Option<Project>, StoreError> {
        let project = sqlx::query_as::<_, Project>(&format!(
            "SELECT {} FROM projects WHERE id = $1",
            PROJECT_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(project)
    }

    async fn milestone(&self, id: Uuid) -> Result<Option<Milestone>, StoreError> {
        let milestone = sqlx::query_as::<_, Milestone>(&format!(
            "SELECT {} FROM milestones WHERE id = $1",
            MILESTONE_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(milestone)
    }

    async fn project_milestones(&self, project_id: Uuid) -> Result<Vec<Milestone>, StoreError> {
        let milestones = sqlx::query_as::<_, Milestone>(&format!(
            "SELECT {} FROM milestones WHERE project_id = $1 ORDER BY order_index ASC",
            MILESTONE_COLUMNS
        ))
        .bind(project_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(milestones)
    }

    async fn submitted_milestones_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<Milestone>, StoreError> {
        let milestones = sqlx::query_as::<_, Milestone>(&format!(
            "SELECT {} FROM milestones WHERE status = 'submitted' AND submitted_at <= $1 \
             ORDER BY submitted_at ASC",
            MILESTONE_COLUMNS
        ))
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        Ok(milestones)
    }

    async fn transaction(&self, id: Uuid) -> Result<Option<EscrowTransaction>, StoreError> {
        let transaction = sqlx::query_as::<_, EscrowTransaction>(&format!(
            "SELECT {} FROM escrow_transactions WHERE id = $1",
            TRANSACTION_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(transaction)
    }

    async fn transaction_by_reference(&self, reference: &str) -> Result<Option<EscrowTransaction>, StoreError> {
        let transaction = sqlx::query_as::<_, EscrowTransaction>(&format!(
            "SELECT {} FROM escrow_transactions WHERE external_reference = $1",
            TRANSACTION_COLUMNS
        ))
        .bind(reference)
        .fetch_optional(&self.pool)
        .await?;
        Ok(transaction)
    }

    async fn transaction_by_operation(&self, operation_id: &str) -> Result<Option<EscrowTransaction>, StoreError> {
        let transaction = sqlx::query_as::<_, EscrowTransaction>(&format!(
            "SELECT {} FROM escrow_transactions WHERE operation_id = $1",
            TRANSACTION_COLUMNS
        ))
        .bind(operation_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(transaction)
    }

    async fn project_transactions(&self, project_id: Uuid) -> Result<Vec<EscrowTransaction>, StoreError> {
        let transactions = sqlx::query_as::<_, EscrowTransaction>(&format!(
            "SELECT {} FROM escrow_transactions WHERE project_id = $1 ORDER BY created_at DESC",
            TRANSACTION_COLUMNS
        ))
        .bind(project_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(transactions)
    }

    async fn undispatched_transactions(&self) -> Result<Vec<EscrowTransaction>, StoreError> {
        let transactions = sqlx::query_as::<_, EscrowTransaction>(&format!(
            "SELECT {} FROM escrow_transactions \
             WHERE status = 'pending' AND external_reference IS NULL \
             AND kind <> 'deposit' \
             ORDER BY created_at ASC",
            TRANSACTION_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(transactions)
    }

    async fn dispute(&self, id: Uuid) -> Result<Option<Dispute>, StoreError> {
        let dispute = sqlx::query_as::<_, Dispute>(&format!(
            "SELECT {} FROM disputes WHERE id = $1",
            DISPUTE_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(dispute)
    }

    async fn open_dispute_for_milestone(&self, milestone_id: Uuid) -> Result<Option<Dispute>, StoreError> {
        let dispute = sqlx::query_as::<_, Dispute>(&format!(
            "SELECT {} FROM disputes WHERE milestone_id = $1 AND status <> 'resolved'",
            DISPUTE_COLUMNS
        ))
        .bind(milestone_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(dispute)
    }

    async fn project_open_disputes(&self, project_id: Uuid) -> Result<Vec<Dispute>, StoreError> {
        let disputes = sqlx::query_as::<_, Dispute>(&format!(
            "SELECT {} FROM disputes WHERE project_id = $1 AND status <> 'resolved'",
            DISPUTE_COLUMNS
        ))
        .bind(project_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(disputes)
    }

    async fn mediations_started_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<Dispute>, StoreError> {
        let disputes = sqlx::query_as::<_, Dispute>(&format!(
            "SELECT {} FROM disputes WHERE status = 'mediation' AND mediation_started_at <= $1",
            DISPUTE_COLUMNS
        ))
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        Ok(disputes)
    }

    async fn webhook_event(&self, external_id: &str) -> Result<Option<WebhookEvent>, StoreError> {
        let event = sqlx::query_as::<_, WebhookEvent>(&format!(
            "SELECT {} FROM webhook_events WHERE external_id = $1",
            WEBHOOK_COLUMNS
        ))
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(event)
    }

    async fn retryable_webhook_events(
        &self,
        max_retries: i32,
        stale_before: DateTime<Utc>,
    ) -> Result<Vec<WebhookEvent>, StoreError> {
        let events = sqlx::query_as::<_, WebhookEvent>(&format!(
            "SELECT {} FROM webhook_events \
             WHERE (status = 'failed' AND retry_count < $1 AND escalated_at IS NULL) \
                OR (status IN ('processing', 'received') AND updated_at < $2) \
             ORDER BY received_at ASC",
            WEBHOOK_COLUMNS
        ))
        .bind(max_retries)
        .bind(stale_before)
        .fetch_all(&self.pool)
        .await?;
        Ok(events)
    }

    async fn audit_entries(&self, query: &AuditQuery) -> Result<Vec<AuditEntry>, StoreError> {
        let mut builder: QueryBuilder<Postgres> =
            QueryBuilder::new(format!("SELECT {} FROM audit_entries WHERE TRUE", AUDIT_COLUMNS));

        if let Some(entity_type) = &query.entity_type {
            builder.push(" AND entity_type = ").push_bind(entity_type.clone());
        }
        if let Some(entity_id) = &query.entity_id {
            builder.push(" AND entity_id = ").push_bind(entity_id.clone());
        }
        if let Some(actor_id) = query.actor_id {
            builder.push(" AND actor_id = ").push_bind(actor_id);
        }
        if let Some(action) = &query.action {
            builder.push(" AND action = ").push_bind(action.clone());
        }
        if let Some(from) = query.from {
            builder.push(" AND created_at >= ").push_bind(from);
        }
        if let Some(to) = query.to {
            builder.push(" AND created_at < ").push_bind(to);
        }
        builder
            .push(" ORDER BY created_at DESC LIMIT ")
            .push_bind(query.limit)
            .push(" OFFSET ")
            .push_bind(query.offset);

        let entries = builder
            .build_query_as::<AuditEntry>()
            .fetch_all(&self.pool)
            .await?;
        Ok(entries)
    }

    async fn purge_audit_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM audit_entries WHERE created_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn commit(&self, writes: Vec<Write>) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for write in writes {
            self.apply(&mut tx, write).await?;
        }
        tx.commit().await?;
        Ok(())
    }
}
