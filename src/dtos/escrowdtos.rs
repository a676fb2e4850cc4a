// dtos/escrowdtos.rs
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::BigDecimal;
use uuid::Uuid;
use validator::{Validate, ValidationError};

use crate::{
    models::{
        actor::Actor,
        auditmodel::AuditQuery,
        disputemodel::ResolutionDecision,
    },
    service::{
        audit_service::DEFAULT_PAGE_SIZE,
        project_service::{NewMilestone, NewProject},
    },
    utils::currency::{is_valid_amount, is_valid_currency},
};

fn validate_amount(amount: &BigDecimal) -> Result<(), ValidationError> {
    if is_valid_amount(amount) {
        return Ok(());
    }
    let mut error = ValidationError::new("invalid_amount");
    error.message = Some("Amount must be positive with at most two decimal places".into());
    Err(error)
}

fn validate_currency(code: &str) -> Result<(), ValidationError> {
    if is_valid_currency(&code.to_ascii_uppercase()) {
        return Ok(());
    }
    let mut error = ValidationError::new("invalid_currency");
    error.message = Some("Currency must be a three-letter ISO code".into());
    Err(error)
}

fn validate_decision(decision: &ResolutionDecision) -> Result<(), ValidationError> {
    decision.validate().map_err(|message| {
        let mut error = ValidationError::new("invalid_decision");
        error.message = Some(message.into());
        error
    })
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorRole {
    #[default]
    User,
    Operator,
}

/// Who is calling. Carried in every mutating request body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActorDto {
    pub actor_id: Uuid,
    #[serde(default)]
    pub actor_role: ActorRole,
}

impl ActorDto {
    pub fn actor(&self) -> Actor {
        match self.actor_role {
            ActorRole::User => Actor::User(self.actor_id),
            ActorRole::Operator => Actor::Operator(self.actor_id),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CreateMilestoneDto {
    #[validate(length(min = 1, max = 200, message = "Milestone title must be between 1 and 200 characters"))]
    pub title: String,

    #[validate(custom = "validate_amount")]
    pub amount: BigDecimal,

    pub deadline: Option<NaiveDate>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CreateProjectDto {
    #[serde(flatten)]
    pub actor: ActorDto,

    pub freelancer_id: Option<Uuid>,

    #[validate(length(min = 1, max = 200, message = "Title must be between 1 and 200 characters"))]
    pub title: String,

    #[validate(custom = "validate_currency")]
    pub currency: String,

    #[validate(custom = "validate_amount")]
    pub total_budget: BigDecimal,

    #[serde(default)]
    pub sequential: bool,

    #[validate(length(min = 1, max = 50, message = "A project needs between 1 and 50 milestones"))]
    pub milestones: Vec<CreateMilestoneDto>,
}

impl CreateProjectDto {
    /// Runs the derived checks plus the per-milestone ones.
    pub fn validate_all(&self) -> Result<(), validator::ValidationErrors> {
        self.validate()?;
        for milestone in &self.milestones {
            milestone.validate()?;
        }
        Ok(())
    }

    pub fn into_new_project(self) -> NewProject {
        NewProject {
            freelancer_id: self.freelancer_id,
            title: self.title,
            currency: self.currency.to_ascii_uppercase(),
            total_budget: self.total_budget,
            sequential: self.sequential,
            milestones: self
                .milestones
                .into_iter()
                .map(|m| NewMilestone {
                    title: m.title,
                    amount: m.amount,
                    deadline: m
                        .deadline
                        .and_then(|d| d.and_hms_opt(23, 59, 59))
                        .map(|d| d.and_utc()),
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InviteFreelancerDto {
    #[serde(flatten)]
    pub actor: ActorDto,
    pub freelancer_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CancelProjectDto {
    #[serde(flatten)]
    pub actor: ActorDto,

    #[validate(length(min = 1, max = 500, message = "Reason must be between 1 and 500 characters"))]
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct RefundDto {
    #[serde(flatten)]
    pub actor: ActorDto,

    pub milestone_id: Option<Uuid>,

    #[validate(custom = "validate_amount")]
    pub amount: BigDecimal,

    #[validate(length(min = 1, max = 500, message = "Reason must be between 1 and 500 characters"))]
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ReleaseDto {
    #[serde(flatten)]
    pub actor: ActorDto,

    /// Defaults to the full milestone amount; any other amount is rejected.
    #[validate(custom = "validate_amount")]
    pub amount: Option<BigDecimal>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct RevisionDto {
    #[serde(flatten)]
    pub actor: ActorDto,

    #[validate(length(max = 2000, message = "Note must be at most 2000 characters"))]
    pub note: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct RaiseDisputeDto {
    #[serde(flatten)]
    pub actor: ActorDto,

    #[validate(length(min = 10, max = 2000, message = "Reason must be between 10 and 2000 characters"))]
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ConfirmFeeDto {
    #[serde(flatten)]
    pub actor: ActorDto,

    #[validate(length(min = 1, max = 200, message = "Reference must be between 1 and 200 characters"))]
    pub external_reference: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct SettlementDto {
    #[serde(flatten)]
    pub actor: ActorDto,

    #[validate(custom = "validate_decision")]
    pub decision: ResolutionDecision,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ArbitrationDto {
    #[serde(flatten)]
    pub actor: ActorDto,

    #[validate(custom = "validate_decision")]
    pub decision: ResolutionDecision,

    #[validate(length(min = 1, max = 5000, message = "Summary must be between 1 and 5000 characters"))]
    pub summary: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct AuditQueryDto {
    pub entity_type: Option<String>,
    pub entity_id: Option<String>,
    pub actor_id: Option<Uuid>,
    pub action: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,

    #[validate(range(min = 1, max = 500, message = "Limit must be between 1 and 500"))]
    pub limit: Option<i64>,

    #[validate(range(min = 0, message = "Offset must not be negative"))]
    pub offset: Option<i64>,
}

impl From<AuditQueryDto> for AuditQuery {
    fn from(dto: AuditQueryDto) -> Self {
        AuditQuery {
            entity_type: dto.entity_type,
            entity_id: dto.entity_id,
            actor_id: dto.actor_id,
            action: dto.action,
            from: dto.from,
            to: dto.to,
            limit: dto.limit.unwrap_or(DEFAULT_PAGE_SIZE),
            offset: dto.offset.unwrap_or(0),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub status: String,
    pub message: String,
    pub data: Option<T>,
}

impl<T> ApiResponse<T> {
    pub fn success(message: &str, data: T) -> Self {
        Self {
            status: "success".to_string(),
            message: message.to_string(),
            data: Some(data),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn actor_role_defaults_to_user() {
        let dto: ActorDto = serde_json::from_str(r#"{"actor_id":"6f1c1f1e-7f4b-4e8e-9a43-0d2f7c1b2a10"}"#).unwrap();
        assert!(matches!(dto.actor(), Actor::User(_)));
    }

    #[test]
    fn rejects_bad_amounts_and_currency() {
        let dto = CreateProjectDto {
            actor: ActorDto {
                actor_id: Uuid::new_v4(),
                actor_role: ActorRole::User,
            },
            freelancer_id: None,
            title: "Site".into(),
            currency: "usdollars".into(),
            total_budget: BigDecimal::from_str("10.001").unwrap(),
            sequential: false,
            milestones: vec![],
        };
        let errors = dto.validate_all().unwrap_err();
        let fields = errors.field_errors();
        assert!(fields.contains_key("currency"));
        assert!(fields.contains_key("total_budget"));
        assert!(fields.contains_key("milestones"));
    }

    #[test]
    fn split_share_above_hundred_is_rejected() {
        let dto = SettlementDto {
            actor: ActorDto {
                actor_id: Uuid::new_v4(),
                actor_role: ActorRole::User,
            },
            decision: ResolutionDecision::PartialSplit { freelancer_share_pct: 120 },
        };
        assert!(dto.validate().is_err());
    }
}
