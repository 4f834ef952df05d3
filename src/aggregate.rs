//! Attempt & Summary Aggregator.
//!
//! Read-only views over committed attempts. Works on soft-deleted packages
//! too, since attempts outlive them for audit.

use serde::Serialize;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::auth::Caller;
use crate::error::{ScormError, ScormResult};
use crate::models::{Attempt, Package};
use crate::repo::Repository;

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct Summary {
    pub content_object_id: Uuid,
    pub tenant_id: Uuid,
    /// Distinct learners with at least one attempt.
    pub learners_attempted: usize,
    /// Learners with at least one attempt that reached a terminal status.
    pub learners_terminal: usize,
    /// Mean of each learner's best-attempt score, over learners that have one.
    pub mean_score: Option<f64>,
    /// `learners_terminal / learners_attempted`, 0 when nobody attempted.
    pub completion_ratio: f64,
    pub total_attempts: usize,
}

/// Terminal now, or terminal at some point (a failed attempt may resume).
fn reached_terminal(a: &Attempt) -> bool {
    a.is_terminal() || a.terminal_at.is_some()
}

/// Higher score wins, any score beats none, ties go to the later attempt.
fn better(a: &Attempt, b: &Attempt) -> Ordering {
    a.score_raw
        .is_some()
        .cmp(&b.score_raw.is_some())
        .then_with(|| {
            a.score_raw
                .unwrap_or_default()
                .total_cmp(&b.score_raw.unwrap_or_default())
        })
        .then_with(|| a.attempt_number.cmp(&b.attempt_number))
}

/// Best of one learner's attempts, among those that reached a terminal status.
pub fn best_of<'a>(attempts: impl IntoIterator<Item = &'a Attempt>) -> Option<&'a Attempt> {
    attempts
        .into_iter()
        .filter(|a| reached_terminal(a))
        .max_by(|a, b| better(a, b))
}

pub fn summarize(content_object_id: Uuid, tenant_id: Uuid, attempts: &[Attempt]) -> Summary {
    let mut by_learner: BTreeMap<&str, Vec<&Attempt>> = BTreeMap::new();
    for a in attempts {
        by_learner.entry(a.learner_id.as_str()).or_default().push(a);
    }

    let mut learners_terminal = 0;
    let mut scores = Vec::new();
    for learner_attempts in by_learner.values() {
        if let Some(best) = best_of(learner_attempts.iter().copied()) {
            learners_terminal += 1;
            scores.extend(best.score_raw);
        }
    }

    let learners_attempted = by_learner.len();
    let mean_score = (!scores.is_empty()).then(|| scores.iter().sum::<f64>() / scores.len() as f64);
    let completion_ratio = if learners_attempted == 0 {
        0.0
    } else {
        learners_terminal as f64 / learners_attempted as f64
    };

    Summary {
        content_object_id,
        tenant_id,
        learners_attempted,
        learners_terminal,
        mean_score,
        completion_ratio,
        total_attempts: attempts.len(),
    }
}

pub struct Aggregator {
    repo: Arc<dyn Repository>,
}

impl Aggregator {
    pub fn new(repo: Arc<dyn Repository>) -> Self {
        Self { repo }
    }

    async fn owning_package(
        &self,
        caller: &Caller,
        content_object_id: Uuid,
    ) -> ScormResult<Package> {
        let (_, package) = self
            .repo
            .content_object_with_package(content_object_id)
            .await?
            .ok_or(ScormError::ContentObjectNotFound(content_object_id))?;
        caller.require_tenant(package.tenant_id)?;
        Ok(package)
    }

    /// All of a learner's attempts, ascending attempt number.
    pub async fn list_attempts(
        &self,
        caller: &Caller,
        learner_id: &str,
        content_object_id: Uuid,
    ) -> ScormResult<Vec<Attempt>> {
        caller.require_self_or_staff(learner_id)?;
        let package = self.owning_package(caller, content_object_id).await?;
        Ok(self
            .repo
            .list_attempts(learner_id, package.tenant_id, content_object_id)
            .await?)
    }

    pub async fn best_attempt(
        &self,
        caller: &Caller,
        learner_id: &str,
        content_object_id: Uuid,
    ) -> ScormResult<Option<Attempt>> {
        let attempts = self.list_attempts(caller, learner_id, content_object_id).await?;
        Ok(best_of(&attempts).cloned())
    }

    #[tracing::instrument(skip(self, caller), fields(learner_id = %caller.learner_id))]
    pub async fn summary(&self, caller: &Caller, content_object_id: Uuid) -> ScormResult<Summary> {
        caller.require_staff()?;
        let package = self.owning_package(caller, content_object_id).await?;
        let attempts = self
            .repo
            .attempts_for_content_object(package.tenant_id, content_object_id)
            .await?;
        Ok(summarize(content_object_id, package.tenant_id, &attempts))
    }
}
