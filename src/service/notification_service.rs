// service/notification_service.rs
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;

/// Emitted after every committed state transition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransitionNotice {
    pub entity_type: String,
    pub entity_id: String,
    pub from_state: Option<String>,
    pub to_state: String,
    pub timestamp: DateTime<Utc>,
}

impl TransitionNotice {
    pub fn new(
        entity_type: &str,
        entity_id: impl ToString,
        from_state: Option<&str>,
        to_state: &str,
    ) -> Self {
        Self {
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            from_state: from_state.map(str::to_string),
            to_state: to_state.to_string(),
            timestamp: Utc::now(),
        }
    }
}

/// Hands notices to whatever delivers them. Must not block the caller.
pub trait NotificationDispatcher: Send + Sync {
    fn dispatch(&self, notice: TransitionNotice);
}

/// Queues notices on a bounded channel drained by [`run_delivery`]. When
/// the queue is full the notice is dropped and logged; the audit log still
/// holds the transition.
#[derive(Debug, Clone)]
pub struct ChannelDispatcher {
    sender: mpsc::Sender<TransitionNotice>,
}

impl ChannelDispatcher {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<TransitionNotice>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender }, receiver)
    }
}

impl NotificationDispatcher for ChannelDispatcher {
    fn dispatch(&self, notice: TransitionNotice) {
        match self.sender.try_send(notice) {
            Ok(()) => {}
            Err(TrySendError::Full(notice)) => {
                tracing::warn!(
                    entity_type = %notice.entity_type,
                    entity_id = %notice.entity_id,
                    to = %notice.to_state,
                    "Notification queue full, dropping notice"
                );
            }
            Err(TrySendError::Closed(notice)) => {
                tracing::warn!(
                    entity_type = %notice.entity_type,
                    entity_id = %notice.entity_id,
                    "Notification channel closed, dropping notice"
                );
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum NotificationError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Notification endpoint returned HTTP {0}")]
    HttpStatus(u16),
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn deliver(&self, notice: &TransitionNotice) -> Result<(), NotificationError>;
}

/// Writes notices to the log. Used when no endpoint is configured.
#[derive(Debug, Default)]
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    async fn deliver(&self, notice: &TransitionNotice) -> Result<(), NotificationError> {
        tracing::info!(
            entity_type = %notice.entity_type,
            entity_id = %notice.entity_id,
            from = notice.from_state.as_deref().unwrap_or("-"),
            to = %notice.to_state,
            "State transition"
        );
        Ok(())
    }
}

/// Forwards each notice as a JSON POST. Retries are the receiver's concern.
pub struct HttpSink {
    client: reqwest::Client,
    url: String,
}

impl HttpSink {
    pub fn new(url: String, timeout: Duration) -> Result<Self, NotificationError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, url })
    }
}

#[async_trait]
impl NotificationSink for HttpSink {
    async fn deliver(&self, notice: &TransitionNotice) -> Result<(), NotificationError> {
        let response = self.client.post(&self.url).json(notice).send().await?;
        if !response.status().is_success() {
            return Err(NotificationError::HttpStatus(response.status().as_u16()));
        }
        Ok(())
    }
}

/// Drains the dispatcher channel into `sink` until cancelled or the channel
/// closes.
pub async fn run_delivery(
    mut receiver: mpsc::Receiver<TransitionNotice>,
    sink: std::sync::Arc<dyn NotificationSink>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("Notification delivery shutting down");
                break;
            }
            next = receiver.recv() => {
                let Some(notice) = next else {
                    tracing::info!("Notification channel closed");
                    break;
                };
                if let Err(e) = sink.deliver(&notice).await {
                    tracing::error!(
                        entity_type = %notice.entity_type,
                        entity_id = %notice.entity_id,
                        error = %e,
                        "Failed to deliver transition notice"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Recording(Mutex<Vec<TransitionNotice>>);

    #[async_trait]
    impl NotificationSink for Recording {
        async fn deliver(&self, notice: &TransitionNotice) -> Result<(), NotificationError> {
            self.0.lock().unwrap().push(notice.clone());
            Ok(())
        }
    }

    #[tokio::test]
    async fn delivers_dispatched_notices_in_order() {
        let (dispatcher, receiver) = ChannelDispatcher::new(8);
        let sink = Arc::new(Recording::default());
        let cancel = CancellationToken::new();

        dispatcher.dispatch(TransitionNotice::new("milestone", "m1", Some("submitted"), "approved"));
        dispatcher.dispatch(TransitionNotice::new("milestone", "m1", Some("approved"), "paid"));
        drop(dispatcher);

        run_delivery(receiver, sink.clone(), cancel).await;

        let delivered = sink.0.lock().unwrap();
        assert_eq!(delivered.len(), 2);
        assert_eq!(delivered[0].to_state, "approved");
        assert_eq!(delivered[1].from_state.as_deref(), Some("approved"));
    }

    #[tokio::test]
    async fn full_queue_drops_without_blocking() {
        let (dispatcher, mut receiver) = ChannelDispatcher::new(2);
        for to in ["in_progress", "submitted", "approved"] {
            dispatcher.dispatch(TransitionNotice::new("milestone", "m1", None, to));
        }

        assert_eq!(receiver.try_recv().unwrap().to_state, "in_progress");
        assert_eq!(receiver.try_recv().unwrap().to_state, "submitted");
        assert!(receiver.try_recv().is_err());

        // room again once the consumer catches up
        dispatcher.dispatch(TransitionNotice::new("milestone", "m1", None, "paid"));
        assert_eq!(receiver.try_recv().unwrap().to_state, "paid");
    }

    #[tokio::test]
    async fn delivery_stops_on_cancel() {
        let (_dispatcher, receiver) = ChannelDispatcher::new(8);
        let cancel = CancellationToken::new();
        cancel.cancel();
        run_delivery(receiver, Arc::new(LogSink), cancel).await;
    }
}
