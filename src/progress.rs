//! Progress propagation to the platform's completion engine.

use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use uuid::Uuid;

use crate::models::AttemptStatus;

/// Where the terminal content object sits in the platform.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct LessonContext {
    pub tenant_id: Uuid,
    pub course_id: Option<Uuid>,
    pub package_id: Uuid,
    pub content_object_id: Uuid,
    pub attempt_number: i32,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct Outcome {
    pub status: AttemptStatus,
    pub score: Option<f64>,
}

#[derive(Debug, thiserror::Error)]
pub enum ProgressError {
    #[error("progress webhook request failed: {0}")]
    Http(#[from] reqwest::Error),
}

#[async_trait]
pub trait ProgressSink: Send + Sync {
    /// Fire-and-forget; retries belong to the receiving engine.
    async fn on_content_object_terminal(
        &self,
        learner_id: &str,
        lesson: &LessonContext,
        outcome: &Outcome,
    ) -> Result<(), ProgressError>;
}

/// Records terminal transitions in the log only.
pub struct LogProgress;

#[async_trait]
impl ProgressSink for LogProgress {
    async fn on_content_object_terminal(
        &self,
        learner_id: &str,
        lesson: &LessonContext,
        outcome: &Outcome,
    ) -> Result<(), ProgressError> {
        tracing::info!(
            learner_id,
            content_object_id = %lesson.content_object_id,
            attempt = lesson.attempt_number,
            status = %outcome.status,
            score = ?outcome.score,
            "content object reached terminal status"
        );
        Ok(())
    }
}

#[derive(Serialize)]
struct WebhookBody<'a> {
    learner_id: &'a str,
    lesson: &'a LessonContext,
    outcome: &'a Outcome,
}

/// POSTs terminal transitions as JSON to the completion engine.
pub struct WebhookProgress {
    client: reqwest::Client,
    url: String,
}

impl WebhookProgress {
    pub fn new(url: impl Into<String>) -> Result<Self, ProgressError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl ProgressSink for WebhookProgress {
    async fn on_content_object_terminal(
        &self,
        learner_id: &str,
        lesson: &LessonContext,
        outcome: &Outcome,
    ) -> Result<(), ProgressError> {
        self.client
            .post(&self.url)
            .json(&WebhookBody {
                learner_id,
                lesson,
                outcome,
            })
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}
