//! Runtime Commit Processor.
//!
//! A running SCO posts its data-model cache as a flat JSON object keyed by
//! CMI element names. Recognized elements are lifted into a typed [`Commit`]
//! and merged into the stored attempt under a per-attempt lock.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::Utc;
use dashmap::DashMap;
use serde::Serialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::auth::Caller;
use crate::error::{ScormError, ScormResult};
use crate::models::{Attempt, AttemptKey, AttemptStatus, ContentObject, Package};
use crate::progress::{LessonContext, Outcome, ProgressSink};
use crate::repo::Repository;

const MAX_LOCATION_LEN: usize = 1000;
const MAX_EXIT_LEN: usize = 255;

// ------------- data model elements -------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Element {
    LessonStatus,
    CompletionStatus,
    SuccessStatus,
    ScoreRaw,
    ScoreMin,
    ScoreMax,
    SessionTime,
    SuspendData,
    Location,
    Exit,
}

/// Allow-list of SCORM 1.2 / 2004 elements (plus plain aliases) a commit may carry.
fn element(key: &str) -> Option<Element> {
    let el = match key {
        "cmi.core.lesson_status" | "status" => Element::LessonStatus,
        "cmi.completion_status" => Element::CompletionStatus,
        "cmi.success_status" => Element::SuccessStatus,
        "cmi.core.score.raw" | "cmi.score.raw" | "score" | "score_raw" => Element::ScoreRaw,
        "cmi.core.score.min" | "cmi.score.min" | "score_min" => Element::ScoreMin,
        "cmi.core.score.max" | "cmi.score.max" | "score_max" => Element::ScoreMax,
        "cmi.core.session_time" | "cmi.session_time" | "session_time" | "sessionTime" => {
            Element::SessionTime
        }
        "cmi.suspend_data" | "suspend_data" => Element::SuspendData,
        "cmi.core.lesson_location" | "cmi.location" | "location" => Element::Location,
        "cmi.core.exit" | "cmi.exit" | "exit" => Element::Exit,
        _ => return None,
    };
    Some(el)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Score {
    pub raw: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
}

/// The recognized, typed part of one runtime commit. `None` means "not sent".
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Commit {
    pub status: Option<AttemptStatus>,
    /// Replaces the stored score triple as a whole.
    pub score: Option<Score>,
    pub session_time_ms: Option<i64>,
    pub suspend_data: Option<String>,
    pub location: Option<String>,
    pub exit: Option<String>,
}

impl Commit {
    /// Builds a commit from a player's element map. Unknown keys are ignored;
    /// malformed values of known keys are dropped with a warning.
    pub fn from_elements(map: &Map<String, Value>) -> Commit {
        let mut commit = Commit::default();
        let mut lesson = None;
        let mut completion = None;
        let mut success = None;
        let mut score = Score::default();
        let mut has_score = false;

        for (key, val) in map {
            let Some(el) = element(key) else {
                continue;
            };
            if val.is_null() {
                continue;
            }
            // Make an owned String so we never borrow a temporary.
            let text: String = val
                .as_str()
                .map(|s| s.to_owned())
                .unwrap_or_else(|| val.to_string());

            match el {
                Element::LessonStatus => lesson = status_value(key, &text),
                Element::CompletionStatus => completion = status_value(key, &text),
                Element::SuccessStatus => success = status_value(key, &text),
                Element::ScoreRaw | Element::ScoreMin | Element::ScoreMax => {
                    if text.trim().is_empty() {
                        continue;
                    }
                    let Some(v) = text.trim().parse::<f64>().ok().filter(|v| v.is_finite()) else {
                        tracing::warn!(element = %key, value = %text, "ignoring non-numeric score");
                        continue;
                    };
                    has_score = true;
                    match el {
                        Element::ScoreRaw => score.raw = Some(v),
                        Element::ScoreMin => score.min = Some(v),
                        _ => score.max = Some(v),
                    }
                }
                Element::SessionTime => {
                    let parsed = match val {
                        Value::Number(n) => n.as_f64().and_then(seconds_to_ms),
                        _ => parse_session_time(&text),
                    };
                    match parsed {
                        Some(ms) => commit.session_time_ms = Some(ms),
                        None => tracing::warn!(
                            element = %key,
                            value = %text,
                            "ignoring malformed session time"
                        ),
                    }
                }
                Element::SuspendData => commit.suspend_data = Some(text),
                Element::Location => commit.location = bounded(key, text, MAX_LOCATION_LEN),
                Element::Exit => commit.exit = bounded(key, text, MAX_EXIT_LEN),
            }
        }

        // a decided 2004 success_status outranks completion
        commit.status = match success {
            Some(s @ (AttemptStatus::Passed | AttemptStatus::Failed)) => Some(s),
            _ => lesson.or(completion),
        };
        if has_score {
            commit.score = Some(score);
        }
        commit
    }

    /// Stable fingerprint of the commit's recognized content.
    pub fn digest(&self) -> String {
        let canonical = serde_json::to_vec(self).unwrap_or_default();
        URL_SAFE_NO_PAD.encode(Sha256::digest(&canonical))
    }
}

fn status_value(key: &str, text: &str) -> Option<AttemptStatus> {
    let status = AttemptStatus::normalize(text);
    if status.is_none() {
        tracing::warn!(element = %key, value = %text, "ignoring unknown status");
    }
    status
}

fn bounded(key: &str, text: String, max: usize) -> Option<String> {
    if text.len() > max {
        tracing::warn!(element = %key, len = text.len(), max, "ignoring oversized value");
        return None;
    }
    Some(text)
}

// ------------- session time -------------

/// Parses a session time in SCORM 1.2 (`HHHH:MM:SS.SS`), SCORM 2004
/// (ISO 8601 `PnYnMnDTnHnMnS`) or plain-seconds form into milliseconds.
pub fn parse_session_time(s: &str) -> Option<i64> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    if let Some(rest) = s.strip_prefix('P') {
        return parse_iso8601(rest);
    }
    if s.contains(':') {
        return parse_clock(s);
    }
    seconds_to_ms(s.parse().ok()?)
}

fn seconds_to_ms(secs: f64) -> Option<i64> {
    (secs.is_finite() && secs >= 0.0).then(|| (secs * 1000.0).round() as i64)
}

fn parse_clock(s: &str) -> Option<i64> {
    let mut parts = s.split(':');
    let (h, m, sec) = (parts.next()?, parts.next()?, parts.next()?);
    if parts.next().is_some() {
        return None;
    }
    let h: u32 = h.parse().ok()?;
    let m: u32 = m.parse().ok()?;
    let sec: f64 = sec.parse().ok()?;
    if m >= 60 || !(0.0..60.0).contains(&sec) {
        return None;
    }
    seconds_to_ms(f64::from(h) * 3600.0 + f64::from(m) * 60.0 + sec)
}

fn parse_iso8601(rest: &str) -> Option<i64> {
    const DAY: f64 = 86_400.0;
    let (date, time) = match rest.split_once('T') {
        Some((d, t)) => (d, Some(t)),
        None => (rest, None),
    };
    if date.is_empty() && time.is_none() {
        return None;
    }
    let mut secs = designators(
        date,
        &[('Y', 365.0 * DAY), ('M', 30.0 * DAY), ('W', 7.0 * DAY), ('D', DAY)],
    )?;
    if let Some(t) = time {
        if t.is_empty() {
            return None;
        }
        secs += designators(t, &[('H', 3600.0), ('M', 60.0), ('S', 1.0)])?;
    }
    seconds_to_ms(secs)
}

/// Sums `<number><unit>` pairs; units must appear in the given order.
fn designators(s: &str, units: &[(char, f64)]) -> Option<f64> {
    let mut total = 0.0;
    let mut num = String::new();
    let mut next = 0;
    for ch in s.chars() {
        if ch.is_ascii_digit() || ch == '.' {
            num.push(ch);
            continue;
        }
        let idx = next + units[next..].iter().position(|(u, _)| *u == ch)?;
        let value: f64 = num.parse().ok()?;
        num.clear();
        total += value * units[idx].1;
        next = idx + 1;
    }
    num.is_empty().then_some(total)
}

// ------------- state machine -------------

/// Merges a reported status into the stored one.
///
/// A report is taken when it ranks at or above the stored status; the only
/// step down allowed is `failed -> incomplete` (retrying inside an attempt).
pub fn merge_status(current: AttemptStatus, reported: AttemptStatus) -> AttemptStatus {
    if reported.rank() >= current.rank() {
        return reported;
    }
    if current == AttemptStatus::Failed && reported == AttemptStatus::Incomplete {
        return reported;
    }
    current
}

/// Applies a commit in place. Returns the suspend-data length when it was
/// over `max_suspend` and therefore not applied.
fn apply(attempt: &mut Attempt, commit: &Commit, max_suspend: usize) -> Option<usize> {
    if let Some(status) = commit.status {
        attempt.status = merge_status(attempt.status, status);
    }
    if let Some(score) = commit.score {
        attempt.score_raw = score.raw;
        attempt.score_min = score.min;
        attempt.score_max = score.max;
    }
    if let Some(ms) = commit.session_time_ms {
        attempt.total_time_ms = attempt.total_time_ms.saturating_add(ms);
        attempt.last_session_ms = Some(ms);
    }
    if let Some(location) = &commit.location {
        attempt.location = Some(location.clone());
    }
    if let Some(exit) = &commit.exit {
        attempt.exit = Some(exit.clone());
    }
    match &commit.suspend_data {
        Some(data) if data.len() > max_suspend => Some(data.len()),
        Some(data) => {
            attempt.suspend_data = Some(data.clone());
            None
        }
        None => None,
    }
}

// ------------- per-attempt locks -------------

/// Mutual exclusion keyed by attempt identity. Entries are dropped once no
/// holder or waiter remains.
///
/// Locks live in this process only; replicas sharing one database do not
/// see each other's holders.
#[derive(Default)]
pub struct AttemptLocks {
    inner: DashMap<AttemptKey, Arc<Mutex<()>>>,
}

pub struct AttemptGuard<'a> {
    locks: &'a AttemptLocks,
    key: AttemptKey,
    guard: Option<OwnedMutexGuard<()>>,
}

impl AttemptLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, key: AttemptKey) -> AttemptGuard<'_> {
        let mutex = self.inner.entry(key.clone()).or_default().clone();
        let guard = mutex.lock_owned().await;
        AttemptGuard {
            locks: self,
            key,
            guard: Some(guard),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl Drop for AttemptGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        self.locks
            .inner
            .remove_if(&self.key, |_, m| Arc::strong_count(m) == 1);
    }
}

// ------------- processor -------------

#[derive(Debug, Clone, Serialize)]
pub struct CommitOutcome {
    pub attempt: Attempt,
    /// This commit moved the attempt into a terminal status for the first time.
    pub first_terminal: bool,
}

pub struct CommitProcessor {
    repo: Arc<dyn Repository>,
    progress: Arc<dyn ProgressSink>,
    locks: AttemptLocks,
    max_suspend_data_bytes: usize,
}

impl CommitProcessor {
    pub fn new(
        repo: Arc<dyn Repository>,
        progress: Arc<dyn ProgressSink>,
        max_suspend_data_bytes: usize,
    ) -> Self {
        Self {
            repo,
            progress,
            locks: AttemptLocks::new(),
            max_suspend_data_bytes,
        }
    }

    pub fn locks(&self) -> &AttemptLocks {
        &self.locks
    }

    /// Merges one commit into the caller's attempt.
    ///
    /// Oversized suspend data fails the call with `SuspendDataTooLarge` after
    /// the rest of the commit has been stored.
    #[tracing::instrument(skip(self, caller, commit), fields(learner_id = %caller.learner_id))]
    pub async fn commit(
        &self,
        caller: &Caller,
        content_object_id: Uuid,
        attempt_number: i32,
        commit: Commit,
    ) -> ScormResult<CommitOutcome> {
        if attempt_number < 1 {
            return Err(ScormError::BadRequest(format!(
                "attempt number must be positive, got {attempt_number}"
            )));
        }
        let (co, package) = self
            .repo
            .content_object_with_package(content_object_id)
            .await?
            .ok_or(ScormError::ContentObjectNotFound(content_object_id))?;
        caller.require_tenant(package.tenant_id)?;

        let key = AttemptKey {
            learner_id: caller.learner_id.clone(),
            tenant_id: caller.tenant_id,
            content_object_id,
            attempt_number,
        };
        let oversized = commit
            .suspend_data
            .as_ref()
            .map(|d| d.len())
            .filter(|len| *len > self.max_suspend_data_bytes);
        let digest = commit.digest();

        let outcome = {
            let _guard = self.locks.acquire(key.clone()).await;

            let stored = self.repo.get_attempt(&key).await?;
            let is_new = stored.is_none();
            if is_new {
                self.check_new_attempt(&key, &package).await?;
            }
            let current = stored.unwrap_or_else(|| Attempt::new(key.clone()));

            if !is_new && current.last_commit_digest.as_deref() == Some(digest.as_str()) {
                tracing::debug!("duplicate commit, nothing to apply");
                return self.finish(CommitOutcome::unchanged(current), oversized);
            }

            let mut next = current.clone();
            apply(&mut next, &commit, self.max_suspend_data_bytes);
            if !is_new && next == current {
                return self.finish(CommitOutcome::unchanged(current), oversized);
            }

            let now = Utc::now();
            next.last_commit_digest = Some(digest);
            if next.first_commit_at.is_none() {
                next.first_commit_at = Some(now);
            }
            next.last_commit_at = Some(now);
            let first_terminal = next.status.is_terminal() && current.terminal_at.is_none();
            if first_terminal {
                next.terminal_at = Some(now);
            }

            self.repo.save_attempt(&next).await?;
            CommitOutcome {
                attempt: next,
                first_terminal,
            }
        };

        if outcome.first_terminal {
            self.propagate(&co, &package, &outcome.attempt).await;
        }
        self.finish(outcome, oversized)
    }

    /// A commit may open only the next attempt number, and only on a live package.
    async fn check_new_attempt(&self, key: &AttemptKey, package: &Package) -> ScormResult<()> {
        if !package.is_active() {
            return Err(ScormError::PackageNotFound(package.id));
        }
        let latest = self
            .repo
            .list_attempts(&key.learner_id, key.tenant_id, key.content_object_id)
            .await?
            .iter()
            .map(|a| a.attempt_number)
            .max()
            .unwrap_or(0);
        if key.attempt_number > latest + 1 {
            return Err(ScormError::BadRequest(format!(
                "attempt {} is not open, next attempt is {}",
                key.attempt_number,
                latest + 1
            )));
        }
        Ok(())
    }

    fn finish(
        &self,
        outcome: CommitOutcome,
        oversized: Option<usize>,
    ) -> ScormResult<CommitOutcome> {
        match oversized {
            Some(actual) => Err(ScormError::SuspendDataTooLarge {
                limit: self.max_suspend_data_bytes,
                actual,
            }),
            None => Ok(outcome),
        }
    }

    async fn propagate(&self, co: &ContentObject, package: &Package, attempt: &Attempt) {
        let lesson = LessonContext {
            tenant_id: package.tenant_id,
            course_id: package.course_id,
            package_id: package.id,
            content_object_id: co.id,
            attempt_number: attempt.attempt_number,
        };
        let outcome = Outcome {
            status: attempt.status,
            score: attempt.score_raw,
        };
        // the attempt row is the source of truth; propagation failures are not retried here
        if let Err(e) = self
            .progress
            .on_content_object_terminal(&attempt.learner_id, &lesson, &outcome)
            .await
        {
            tracing::warn!(
                content_object_id = %co.id,
                error = %e,
                "progress propagation failed"
            );
        }
    }
}

impl CommitOutcome {
    fn unchanged(attempt: Attempt) -> Self {
        Self {
            attempt,
            first_terminal: false,
        }
    }
}
