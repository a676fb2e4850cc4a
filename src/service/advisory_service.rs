// service/advisory_service.rs
use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::BigDecimal;
use tokio::{sync::RwLock, task::JoinHandle};
use uuid::Uuid;

use crate::models::disputemodel::ResolutionDecision;

/// Facts sent to the advisory model. Read-only copies, never live handles.
#[derive(Debug, Clone, Serialize)]
pub struct AdvisoryContext {
    pub dispute_id: Uuid,
    pub milestone_title: String,
    pub milestone_amount: BigDecimal,
    pub revision_count: i32,
    pub reason: String,
    pub raised_by_client: bool,
}

/// A non-binding suggestion shown to mediators.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Advice {
    pub dispute_id: Uuid,
    pub suggestion: Option<ResolutionDecision>,
    pub rationale: String,
    pub available: bool,
    pub generated_at: DateTime<Utc>,
}

impl Advice {
    pub fn fallback(dispute_id: Uuid, why: &str) -> Self {
        Self {
            dispute_id,
            suggestion: None,
            rationale: format!("No advisory suggestion available ({})", why),
            available: false,
            generated_at: Utc::now(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AdvisoryError {
    #[error("Advisory service is disabled")]
    Disabled,

    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Advisory service returned HTTP {0}")]
    HttpStatus(u16),
}

#[async_trait]
pub trait AdvisoryClient: Send + Sync {
    async fn suggest(&self, context: &AdvisoryContext) -> Result<Advice, AdvisoryError>;
}

#[derive(Debug, Default)]
pub struct DisabledAdvisory;

#[async_trait]
impl AdvisoryClient for DisabledAdvisory {
    async fn suggest(&self, _context: &AdvisoryContext) -> Result<Advice, AdvisoryError> {
        Err(AdvisoryError::Disabled)
    }
}

#[derive(Debug, Deserialize)]
struct AdvisoryResponse {
    suggestion: Option<ResolutionDecision>,
    #[serde(default)]
    rationale: String,
}

pub struct HttpAdvisoryClient {
    client: reqwest::Client,
    url: String,
}

impl HttpAdvisoryClient {
    pub fn new(url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
        }
    }
}

#[async_trait]
impl AdvisoryClient for HttpAdvisoryClient {
    async fn suggest(&self, context: &AdvisoryContext) -> Result<Advice, AdvisoryError> {
        let response = self.client.post(&self.url).json(context).send().await?;
        if !response.status().is_success() {
            return Err(AdvisoryError::HttpStatus(response.status().as_u16()));
        }
        let body: AdvisoryResponse = response.json().await?;
        Ok(Advice {
            dispute_id: context.dispute_id,
            suggestion: body.suggestion,
            rationale: body.rationale,
            available: true,
            generated_at: Utc::now(),
        })
    }
}

/// Runs advisory requests off the request path. Holds no store or ledger
/// handle, so a suggestion can only ever be read back, never applied.
#[derive(Clone)]
pub struct AdvisoryService {
    client: Arc<dyn AdvisoryClient>,
    timeout: Duration,
    cache: Arc<RwLock<HashMap<Uuid, Advice>>>,
}

impl AdvisoryService {
    pub fn new(client: Arc<dyn AdvisoryClient>, timeout: Duration) -> Self {
        Self {
            client,
            timeout,
            cache: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Fire-and-forget. The returned handle is only useful to tests.
    pub fn request(&self, context: AdvisoryContext) -> JoinHandle<()> {
        let client = self.client.clone();
        let cache = self.cache.clone();
        let timeout = self.timeout;

        tokio::spawn(async move {
            let dispute_id = context.dispute_id;
            let advice = match tokio::time::timeout(timeout, client.suggest(&context)).await {
                Ok(Ok(advice)) => advice,
                Ok(Err(AdvisoryError::Disabled)) => Advice::fallback(dispute_id, "disabled"),
                Ok(Err(e)) => {
                    tracing::warn!(dispute_id = %dispute_id, error = %e, "Advisory request failed");
                    Advice::fallback(dispute_id, "unavailable")
                }
                Err(_) => {
                    tracing::warn!(dispute_id = %dispute_id, timeout_ms = timeout.as_millis() as u64, "Advisory request timed out");
                    Advice::fallback(dispute_id, "timed out")
                }
            };
            cache.write().await.insert(dispute_id, advice);
        })
    }

    pub async fn advice(&self, dispute_id: Uuid) -> Option<Advice> {
        self.cache.read().await.get(&dispute_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Slow;

    #[async_trait]
    impl AdvisoryClient for Slow {
        async fn suggest(&self, context: &AdvisoryContext) -> Result<Advice, AdvisoryError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(Advice::fallback(context.dispute_id, "never"))
        }
    }

    struct Fixed;

    #[async_trait]
    impl AdvisoryClient for Fixed {
        async fn suggest(&self, context: &AdvisoryContext) -> Result<Advice, AdvisoryError> {
            Ok(Advice {
                dispute_id: context.dispute_id,
                suggestion: Some(ResolutionDecision::PartialSplit { freelancer_share_pct: 60 }),
                rationale: "most deliverables accepted".to_string(),
                available: true,
                generated_at: Utc::now(),
            })
        }
    }

    fn context() -> AdvisoryContext {
        AdvisoryContext {
            dispute_id: Uuid::new_v4(),
            milestone_title: "Design".to_string(),
            milestone_amount: BigDecimal::from(500),
            revision_count: 2,
            reason: "incomplete".to_string(),
            raised_by_client: true,
        }
    }

    #[tokio::test]
    async fn timeout_falls_back() {
        let service = AdvisoryService::new(Arc::new(Slow), Duration::from_millis(20));
        let ctx = context();
        let id = ctx.dispute_id;
        service.request(ctx).await.unwrap();

        let advice = service.advice(id).await.unwrap();
        assert!(!advice.available);
        assert!(advice.suggestion.is_none());
    }

    #[tokio::test]
    async fn suggestion_is_cached() {
        let service = AdvisoryService::new(Arc::new(Fixed), Duration::from_secs(1));
        let ctx = context();
        let id = ctx.dispute_id;
        service.request(ctx).await.unwrap();

        let advice = service.advice(id).await.unwrap();
        assert!(advice.available);
        assert_eq!(
            advice.suggestion,
            Some(ResolutionDecision::PartialSplit { freelancer_share_pct: 60 })
        );
    }

    #[tokio::test]
    async fn disabled_client_yields_fallback() {
        let service = AdvisoryService::new(Arc::new(DisabledAdvisory), Duration::from_secs(1));
        let ctx = context();
        let id = ctx.dispute_id;
        service.request(ctx).await.unwrap();
        assert!(!service.advice(id).await.unwrap().available);
    }
}
