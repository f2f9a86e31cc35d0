use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::{
    error::AppError,
    events::{
        mark_event_dead_lettered, mark_event_delivered, reserve_event, EventBusError, Reservation,
    },
    extract::{ExtractError, PdfEngine},
    models::Event,
    search::SearchError,
    state::AppState,
};

pub mod index;
pub mod ocr;

pub const STAGE_OCR: &str = "ocr";
pub const STAGE_INDEX: &str = "index";

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("{0}")]
    Database(#[from] AppError),
    #[error("event bus: {0}")]
    Events(#[from] EventBusError),
    #[error("storage: {0:#}")]
    Storage(anyhow::Error),
    #[error("extraction: {0}")]
    Extract(#[from] ExtractError),
    #[error("search: {0}")]
    Search(#[from] SearchError),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("task failed: {0}")]
    Task(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventOutcome {
    Handled,
    Skipped { reason: String },
    DeadLetter { error: String },
}

/// Payload shape shared by every pipeline topic.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionMessage {
    pub version_id: Uuid,
}

impl VersionMessage {
    pub fn from_event(event: &Event) -> Result<Self, String> {
        serde_json::from_value(event.payload.clone())
            .map_err(|err| format!("invalid payload: {err}"))
    }
}

/// One subscriber of the topic log. Each stage owns a consumer group and a
/// dead-letter topic.
#[async_trait]
pub trait EventHandler: Send + Sync {
    fn stage(&self) -> &'static str;
    fn topics(&self) -> Vec<String>;
    fn consumer_group(&self) -> String;
    fn dlq_topic(&self) -> String;
    async fn handle(&self, state: Arc<AppState>, event: Event) -> EventOutcome;
}

pub struct Worker {
    state: Arc<AppState>,
    handlers: Vec<Arc<dyn EventHandler>>,
    poll_interval: Duration,
}

impl Worker {
    pub fn new(
        state: Arc<AppState>,
        handlers: Vec<Arc<dyn EventHandler>>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            state,
            handlers,
            poll_interval,
        }
    }

    pub async fn run(&self) {
        let stages: Vec<&str> = self.handlers.iter().map(|handler| handler.stage()).collect();
        info!(stages = ?stages, "worker started");
        loop {
            match self.tick().await {
                Ok(true) => {}
                Ok(false) => sleep(self.poll_interval).await,
                Err(err) => {
                    error!(error = %err, "worker tick failed");
                    sleep(self.poll_interval).await;
                }
            }
        }
    }

    /// Delivers at most one event per handler. Returns whether any work was done.
    pub async fn tick(&self) -> Result<bool, PipelineError> {
        let mut worked = false;
        for handler in &self.handlers {
            if self.deliver_next(handler.as_ref()).await? {
                worked = true;
            }
        }
        Ok(worked)
    }

    async fn deliver_next(&self, handler: &dyn EventHandler) -> Result<bool, PipelineError> {
        let topics = handler.topics();
        let group = handler.consumer_group();
        let lease = self.state.config.event_lease();
        let reserve_group = group.clone();
        let reserved = self
            .state
            .with_conn(move |conn| {
                let topic_refs: Vec<&str> = topics.iter().map(String::as_str).collect();
                reserve_event(conn, &topic_refs, &reserve_group, lease).map_err(AppError::internal)
            })
            .await?;

        let Some(Reservation { event, delivery }) = reserved else {
            return Ok(false);
        };
        if delivery.attempts > 1 {
            warn!(
                stage = handler.stage(),
                event_id = %event.id,
                attempts = delivery.attempts,
                "redelivering event after an expired lease"
            );
        }

        let event_id = event.id;
        let topic = event.topic.clone();
        let payload = event.payload.clone();
        let outcome = handler.handle(self.state.clone(), event).await;

        match outcome {
            EventOutcome::Handled => {
                info!(stage = handler.stage(), %event_id, %topic, "event handled");
                self.mark_delivered(event_id, group).await?;
            }
            EventOutcome::Skipped { reason } => {
                info!(stage = handler.stage(), %event_id, %topic, %reason, "event skipped");
                self.mark_delivered(event_id, group).await?;
            }
            EventOutcome::DeadLetter { error } => {
                error!(stage = handler.stage(), %event_id, %topic, %error, "event dead-lettered");
                let dlq_payload = json!({
                    "versionId": payload.get("versionId").cloned().unwrap_or_default(),
                    "error": error,
                    "sourceTopic": topic,
                    "eventId": event_id,
                });
                let key = payload
                    .get("versionId")
                    .and_then(|value| value.as_str())
                    .map(str::to_string);
                self.state
                    .events
                    .publish(&handler.dlq_topic(), key.as_deref(), dlq_payload)
                    .await?;
                self.state
                    .with_conn(move |conn| {
                        mark_event_dead_lettered(conn, event_id, &group, &error)
                            .map_err(AppError::internal)
                    })
                    .await?;
            }
        }

        Ok(true)
    }

    async fn mark_delivered(&self, event_id: Uuid, group: String) -> Result<(), PipelineError> {
        self.state
            .with_conn(move |conn| {
                mark_event_delivered(conn, event_id, &group).map_err(AppError::internal)
            })
            .await?;
        Ok(())
    }
}

/// Resolves a comma-separated stage list. Blank input selects every stage.
pub fn parse_stages(raw: Option<&str>) -> Result<Vec<&'static str>, String> {
    let Some(raw) = raw.filter(|raw| !raw.trim().is_empty()) else {
        return Ok(vec![STAGE_OCR, STAGE_INDEX]);
    };
    let mut stages = Vec::new();
    for part in raw.split(',').map(str::trim).filter(|part| !part.is_empty()) {
        let stage = match part.to_ascii_lowercase().as_str() {
            STAGE_OCR => STAGE_OCR,
            STAGE_INDEX => STAGE_INDEX,
            other => return Err(format!("unknown worker stage: {other}")),
        };
        if !stages.contains(&stage) {
            stages.push(stage);
        }
    }
    Ok(stages)
}

pub fn handlers_for(
    state: &AppState,
    stages: &[&str],
    engine: Arc<dyn PdfEngine>,
) -> Vec<Arc<dyn EventHandler>> {
    let mut handlers: Vec<Arc<dyn EventHandler>> = Vec::new();
    if stages.contains(&STAGE_OCR) {
        handlers.push(Arc::new(ocr::OcrStage::new(&state.config, engine)));
    }
    if stages.contains(&STAGE_INDEX) {
        handlers.push(Arc::new(index::IndexStage::new(&state.config)));
    }
    handlers
}
