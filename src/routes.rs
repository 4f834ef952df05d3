use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use uuid::Uuid;

use crate::aggregate::{Aggregator, Summary};
use crate::auth::Caller;
use crate::config::Config;
use crate::error::{ScormError, ScormResult};
use crate::ingest::{IngestRequest, Ingestor};
use crate::launch::{ContentScope, ContentSigner, LaunchConfig, Launcher};
use crate::models::{Attempt, Package, PackageWithObjects};
use crate::progress::ProgressSink;
use crate::repo::Repository;
use crate::runtime::{Commit, CommitOutcome, CommitProcessor};
use crate::storage::PackageStore;

/// Multipart framing allowance on top of the archive ceiling.
const MULTIPART_OVERHEAD: usize = 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub ingestor: Arc<Ingestor>,
    pub launcher: Arc<Launcher>,
    pub commits: Arc<CommitProcessor>,
    pub aggregator: Arc<Aggregator>,
}

impl AppState {
    pub fn new(
        config: &Config,
        repo: Arc<dyn Repository>,
        store: Arc<dyn PackageStore>,
        progress: Arc<dyn ProgressSink>,
    ) -> Result<Self, hmac::digest::InvalidLength> {
        let signer = ContentSigner::new(&config.launch_signing_key, config.launch_ttl)?;
        Ok(Self {
            ingestor: Arc::new(Ingestor::new(store.clone(), repo.clone(), config.ingest.clone())),
            launcher: Arc::new(Launcher::new(repo.clone(), store, signer)),
            commits: Arc::new(CommitProcessor::new(
                repo.clone(),
                progress,
                config.max_suspend_data_bytes,
            )),
            aggregator: Arc::new(Aggregator::new(repo)),
        })
    }
}

pub fn router(state: AppState) -> Router {
    let upload_limit = state.ingestor.limits().max_archive_bytes as usize + MULTIPART_OVERHEAD;
    Router::new()
        .route("/health", get(|| async { "ok" }))
        // packages
        .route(
            "/api/packages",
            post(upload_package).layer(DefaultBodyLimit::max(upload_limit)),
        )
        .route("/api/packages/:id", get(get_package).delete(delete_package))
        // launch + runtime
        .route("/api/content-objects/:id/launch", get(launch))
        .route(
            "/api/content-objects/:id/attempts",
            get(list_attempts).post(retake),
        )
        .route("/api/content-objects/:id/attempts/best", get(best_attempt))
        .route("/api/content-objects/:id/attempts/:n/commit", post(commit))
        .route("/api/content-objects/:id/summary", get(summary))
        // signed package files + player
        .route("/content/:tenant/:package/:expires/:sig/*path", get(content))
        .route("/player/:id", get(player_shell))
        .with_state(state)
}

async fn upload_package(
    State(state): State<AppState>,
    caller: Caller,
    headers: HeaderMap,
    mut mp: Multipart,
) -> ScormResult<(StatusCode, Json<PackageWithObjects>)> {
    let limit = state.ingestor.limits().max_archive_bytes;
    let too_large = |e: axum::extract::multipart::MultipartError| {
        if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
            let declared = headers
                .get(header::CONTENT_LENGTH)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok());
            ScormError::ArchiveTooLarge {
                limit,
                actual: declared.unwrap_or(limit),
            }
        } else {
            ScormError::BadRequest(e.body_text())
        }
    };

    let mut archive: Option<Bytes> = None;
    let mut course_id = None;
    let mut tenant_id = caller.tenant_id;

    while let Some(field) = mp.next_field().await.map_err(too_large)? {
        let name = field.name().unwrap_or("").to_string();
        match name.as_str() {
            "file" => archive = Some(field.bytes().await.map_err(too_large)?),
            "course_id" => {
                let text = field.text().await.map_err(too_large)?;
                course_id = Some(parse_uuid("course_id", &text)?);
            }
            // operators upload on behalf of a tenant
            "tenant_id" => {
                let text = field.text().await.map_err(too_large)?;
                tenant_id = parse_uuid("tenant_id", &text)?;
            }
            _ => {}
        }
    }
    let archive = archive.ok_or_else(|| ScormError::BadRequest("file is required".into()))?;

    let created = state
        .ingestor
        .ingest(
            &caller,
            IngestRequest {
                tenant_id,
                course_id,
                archive,
            },
        )
        .await?;
    Ok((StatusCode::CREATED, Json(created)))
}

async fn get_package(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<Uuid>,
) -> ScormResult<Json<PackageWithObjects>> {
    Ok(Json(state.ingestor.get_package(&caller, id).await?))
}

async fn delete_package(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<Uuid>,
) -> ScormResult<Json<Package>> {
    Ok(Json(state.ingestor.delete_package(&caller, id).await?))
}

async fn launch(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<Uuid>,
) -> ScormResult<Json<LaunchConfig>> {
    Ok(Json(state.launcher.resolve(&caller, id).await?))
}

async fn retake(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<Uuid>,
) -> ScormResult<(StatusCode, Json<Attempt>)> {
    let attempt = state.launcher.restart(&caller, id).await?;
    Ok((StatusCode::CREATED, Json(attempt)))
}

#[derive(Deserialize)]
struct LearnerQuery {
    learner_id: Option<String>,
}

async fn list_attempts(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<Uuid>,
    Query(q): Query<LearnerQuery>,
) -> ScormResult<Json<Vec<Attempt>>> {
    let learner = q.learner_id.unwrap_or_else(|| caller.learner_id.clone());
    Ok(Json(state.aggregator.list_attempts(&caller, &learner, id).await?))
}

async fn best_attempt(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<Uuid>,
    Query(q): Query<LearnerQuery>,
) -> ScormResult<Json<Option<Attempt>>> {
    let learner = q.learner_id.unwrap_or_else(|| caller.learner_id.clone());
    Ok(Json(state.aggregator.best_attempt(&caller, &learner, id).await?))
}

async fn commit(
    State(state): State<AppState>,
    caller: Caller,
    Path((id, n)): Path<(Uuid, i32)>,
    Json(elements): Json<Map<String, Value>>,
) -> ScormResult<Json<CommitOutcome>> {
    let commit = Commit::from_elements(&elements);
    Ok(Json(state.commits.commit(&caller, id, n, commit).await?))
}

async fn summary(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<Uuid>,
) -> ScormResult<Json<Summary>> {
    Ok(Json(state.aggregator.summary(&caller, id).await?))
}

async fn content(
    State(state): State<AppState>,
    Path((tenant_id, package_id, expires, sig, path)): Path<(Uuid, Uuid, i64, String, String)>,
) -> ScormResult<Response> {
    let scope = ContentScope {
        tenant_id,
        package_id,
        expires,
        sig,
    };
    let path = path.trim_start_matches('/');
    let body = state.launcher.read_content(&scope, path).await?;
    let mime = mime_guess::from_path(path).first_or_octet_stream();
    let content_type = HeaderValue::from_str(mime.as_ref())
        .unwrap_or(HeaderValue::from_static("application/octet-stream"));
    Ok((
        [
            (header::CONTENT_TYPE, content_type),
            (header::CACHE_CONTROL, HeaderValue::from_static("private, max-age=300")),
        ],
        body,
    )
        .into_response())
}

fn parse_uuid(field: &str, v: &str) -> ScormResult<Uuid> {
    Uuid::parse_str(v.trim())
        .map_err(|_| ScormError::BadRequest(format!("{field} is not a valid id")))
}

/// Element values the player seeds its runtime cache with.
fn seed_elements(cfg: &LaunchConfig) -> Value {
    let mut seed = json!({
        "cmi.core.entry": "ab-initio",
        "cmi.entry": "ab-initio",
        "cmi.core.lesson_status": "not attempted",
        "cmi.completion_status": "unknown",
        "cmi.success_status": "unknown",
    });
    if let Some(score) = cfg.mastery_score {
        seed["cmi.student_data.mastery_score"] = json!(score.to_string());
        seed["cmi.scaled_passing_score"] = json!((score / 100.0).to_string());
    }
    if let Some(resume) = &cfg.resume {
        seed["cmi.core.entry"] = json!("resume");
        seed["cmi.entry"] = json!("resume");
        let status = resume.status.as_str().replace('_', " ");
        seed["cmi.core.lesson_status"] = json!(status);
        seed["cmi.completion_status"] = json!(match resume.status.as_str() {
            "not_attempted" => "not attempted",
            "browsed" => "incomplete",
            "passed" | "failed" => "completed",
            other => other,
        });
        if let Some(data) = &resume.suspend_data {
            seed["cmi.suspend_data"] = json!(data);
        }
        if let Some(location) = &resume.location {
            seed["cmi.core.lesson_location"] = json!(location);
            seed["cmi.location"] = json!(location);
        }
    }
    seed
}

async fn player_shell(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<Uuid>,
) -> ScormResult<Html<String>> {
    let cfg = state.launcher.resolve(&caller, id).await?;
    let commit_url = format!(
        "/api/content-objects/{}/attempts/{}/commit",
        cfg.content_object_id, cfg.attempt_number
    );
    // keep "</script>" inside values from closing the block
    let seed = seed_elements(&cfg).to_string().replace("</", "<\\/");
    let title = html_escape(&cfg.title);
    let launch_url = html_escape(&cfg.entry_url);
    let attempt = cfg.attempt_number;

    let html = format!(
    r#"<!DOCTYPE html>
<html>
<head>
  <meta charset='utf-8'/>
  <title>{title}</title>
  <meta http-equiv="Content-Security-Policy"
        content="default-src 'self'; script-src 'self' 'unsafe-inline'; style-src 'self' 'unsafe-inline'; img-src 'self' data: blob:; media-src 'self' blob:; font-src 'self' data:; frame-src 'self'; connect-src 'self';" />
  <style>
    html,body,iframe{{height:100%;width:100%;margin:0;padding:0;border:0}}
    .bar{{position:fixed;top:0;left:0;right:0;height:36px;background:#eee;border-bottom:1px solid #ddd;display:flex;align-items:center;padding:0 8px;z-index:2}}
    iframe{{position:absolute;top:36px;left:0;right:0;bottom:0}}
  </style>
</head>
<body>
<div class='bar'>{title} &bull; attempt {attempt} <span id='status'></span></div>
<iframe id='sco' src='{launch_url}'></iframe>
<script>
(function(){{
  const cache = {seed};
  let dirty = {{}};
  let lastError = "0";
  const commitUrl = '{commit_url}';

  function flash(text){{
    const s = document.getElementById('status');
    if (s){{ s.textContent = text; setTimeout(()=> s.textContent='', 1200); }}
  }}

  // only elements set since the last accepted commit are sent
  function commit(){{
    const body = dirty;
    if (Object.keys(body).length === 0) return "true";
    dirty = {{}};
    fetch(commitUrl, {{
      method:'POST',
      headers:{{'content-type':'application/json'}},
      body: JSON.stringify(body),
      keepalive: true
    }}).then(res => {{
      if (!res.ok && res.status >= 500) {{ dirty = Object.assign(body, dirty); }}
      flash(res.ok ? 'saved' : 'not saved');
    }}).catch(() => {{ dirty = Object.assign(body, dirty); flash('offline'); }});
    return "true";
  }}

  function getValue(el){{ lastError = "0"; return (el in cache) ? String(cache[el]) : ""; }}
  function setValue(el, v){{ lastError = "0"; cache[el] = String(v); dirty[el] = String(v); return "true"; }}

  // SCORM 1.2
  window.API = {{
    LMSInitialize(arg){{ return "true"; }},
    LMSFinish(arg){{ return commit(); }},
    LMSGetValue: getValue,
    LMSSetValue: setValue,
    LMSCommit(arg){{ return commit(); }},
    LMSGetLastError(){{ return lastError; }},
    LMSGetErrorString(c){{ return "No error"; }},
    LMSGetDiagnostic(c){{ return ""; }}
  }};

  // SCORM 2004
  window.API_1484_11 = {{
    Initialize(arg){{ return "true"; }},
    Terminate(arg){{ return commit(); }},
    GetValue: getValue,
    SetValue: setValue,
    Commit(arg){{ return commit(); }},
    GetLastError(){{ return lastError; }},
    GetErrorString(c){{ return "No error"; }},
    GetDiagnostic(c){{ return ""; }}
  }};

  window.addEventListener('pagehide', commit);
}})();
</script>
</body>
</html>"#
    );

    Ok(Html(html))
}

fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('\'', "&#39;")
        .replace('"', "&quot;")
}
