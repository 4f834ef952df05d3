//! Launch Resolver.
//!
//! Turns a content object and a caller into a launch configuration: which
//! attempt the session belongs to, and a time-limited signed URL prefix under
//! which the browser may read the package's files.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use serde::Serialize;
use sha2::Sha256;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::auth::Caller;
use crate::error::{ScormError, ScormResult};
use crate::manifest;
use crate::models::{Attempt, AttemptKey, AttemptStatus, ContentObject, Package};
use crate::repo::Repository;
use crate::storage::{PackageStore, StorageError};

type HmacSha256 = Hmac<Sha256>;

/// Characters escaped inside one URL path segment.
const SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'/')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}');

/// Retakes racing for the same attempt number give up after this many tries.
const RETAKE_TRIES: usize = 3;

/// Signs `/content/{tenant}/{package}/{expires}/{sig}` prefixes.
#[derive(Clone)]
pub struct ContentSigner {
    mac: HmacSha256,
    ttl: Duration,
}

impl ContentSigner {
    pub fn new(key: &[u8], ttl: Duration) -> Result<Self, hmac::digest::InvalidLength> {
        Ok(Self {
            mac: HmacSha256::new_from_slice(key)?,
            ttl,
        })
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn keyed(&self, tenant_id: Uuid, package_id: Uuid, expires: i64) -> HmacSha256 {
        let mut mac = self.mac.clone();
        mac.update(format!("{tenant_id}/{package_id}\n{expires}").as_bytes());
        mac
    }

    pub fn sign(&self, tenant_id: Uuid, package_id: Uuid, expires: i64) -> String {
        let tag = self.keyed(tenant_id, package_id, expires).finalize().into_bytes();
        URL_SAFE_NO_PAD.encode(tag)
    }

    /// Constant-time check of the signature, then of the expiry.
    pub fn verify(&self, scope: &ContentScope, now: DateTime<Utc>) -> bool {
        let Ok(sig) = URL_SAFE_NO_PAD.decode(scope.sig.as_bytes()) else {
            return false;
        };
        self.keyed(scope.tenant_id, scope.package_id, scope.expires)
            .verify_slice(&sig)
            .is_ok()
            && scope.expires >= now.timestamp()
    }

    /// Signed content root for a package, valid for the configured ttl from `now`.
    pub fn content_root(&self, package: &Package, now: DateTime<Utc>) -> (String, DateTime<Utc>) {
        let expires_at = now + chrono::Duration::seconds(self.ttl.as_secs() as i64);
        let expires = expires_at.timestamp();
        let sig = self.sign(package.tenant_id, package.id, expires);
        (
            format!("/content/{}/{}/{expires}/{sig}", package.tenant_id, package.id),
            expires_at,
        )
    }
}

/// The signed part of a content URL.
#[derive(Debug, Clone)]
pub struct ContentScope {
    pub tenant_id: Uuid,
    pub package_id: Uuid,
    pub expires: i64,
    pub sig: String,
}

/// Runtime state handed back to the player when a session resumes.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct ResumeState {
    pub status: AttemptStatus,
    pub suspend_data: Option<String>,
    pub location: Option<String>,
    pub total_time_ms: i64,
}

impl From<&Attempt> for ResumeState {
    fn from(a: &Attempt) -> Self {
        Self {
            status: a.status,
            suspend_data: a.suspend_data.clone(),
            location: a.location.clone(),
            total_time_ms: a.total_time_ms,
        }
    }
}

#[derive(Serialize, Debug, Clone)]
pub struct LaunchConfig {
    pub entry_url: String,
    pub content_root: String,
    pub attempt_number: i32,
    pub package_id: Uuid,
    pub content_object_id: Uuid,
    pub title: String,
    pub schema_version: String,
    pub mastery_score: Option<f64>,
    pub expires_at: DateTime<Utc>,
    /// Present when the session continues a non-terminal attempt.
    pub resume: Option<ResumeState>,
}

pub struct Launcher {
    repo: Arc<dyn Repository>,
    store: Arc<dyn PackageStore>,
    signer: ContentSigner,
}

impl Launcher {
    pub fn new(
        repo: Arc<dyn Repository>,
        store: Arc<dyn PackageStore>,
        signer: ContentSigner,
    ) -> Self {
        Self {
            repo,
            store,
            signer,
        }
    }

    /// Content object and package, provided the caller may launch it.
    async fn launchable(&self, caller: &Caller, id: Uuid) -> ScormResult<(ContentObject, Package)> {
        let (co, package) = self
            .repo
            .content_object_with_package(id)
            .await?
            .ok_or(ScormError::ContentObjectNotFound(id))?;
        caller.require_tenant(package.tenant_id)?;
        if !package.is_active() {
            return Err(ScormError::PackageNotFound(package.id));
        }
        Ok((co, package))
    }

    #[tracing::instrument(skip(self, caller), fields(learner_id = %caller.learner_id))]
    pub async fn resolve(
        &self,
        caller: &Caller,
        content_object_id: Uuid,
    ) -> ScormResult<LaunchConfig> {
        let (co, package) = self.launchable(caller, content_object_id).await?;

        let attempts = self
            .repo
            .list_attempts(&caller.learner_id, caller.tenant_id, co.id)
            .await?;
        let (attempt_number, resume) = match attempts.last() {
            Some(a) if !a.is_terminal() => (a.attempt_number, Some(ResumeState::from(a))),
            Some(a) => (a.attempt_number + 1, None),
            None => (1, None),
        };

        if !self.store.exists(&package.file_path(&co.entry_path)).await? {
            tracing::warn!(
                package_id = %package.id,
                entry = %co.entry_path,
                "entry file missing from storage"
            );
            return Err(ScormError::ContentMissing(co.entry_path));
        }

        let (content_root, expires_at) = self.signer.content_root(&package, Utc::now());
        let entry_url = entry_url(&content_root, &co.entry_path, co.parameters.as_deref());
        tracing::info!(attempt = attempt_number, resuming = resume.is_some(), "launch resolved");

        Ok(LaunchConfig {
            entry_url,
            content_root,
            attempt_number,
            package_id: package.id,
            content_object_id: co.id,
            title: co.title,
            schema_version: package.schema_version,
            mastery_score: co.mastery_score,
            expires_at,
            resume,
        })
    }

    /// Opens a fresh attempt (`max + 1`) for the caller, the explicit "retake".
    #[tracing::instrument(skip(self, caller), fields(learner_id = %caller.learner_id))]
    pub async fn restart(&self, caller: &Caller, content_object_id: Uuid) -> ScormResult<Attempt> {
        let (co, _) = self.launchable(caller, content_object_id).await?;

        for _ in 0..RETAKE_TRIES {
            let latest = self
                .repo
                .list_attempts(&caller.learner_id, caller.tenant_id, co.id)
                .await?
                .last()
                .map_or(0, |a| a.attempt_number);
            let attempt = Attempt::new(AttemptKey {
                learner_id: caller.learner_id.clone(),
                tenant_id: caller.tenant_id,
                content_object_id: co.id,
                attempt_number: latest + 1,
            });
            if self.repo.insert_attempt(&attempt).await? {
                tracing::info!(attempt = attempt.attempt_number, "attempt opened");
                return Ok(attempt);
            }
        }
        Err(ScormError::BadRequest(
            "another retake is in progress for this content object".into(),
        ))
    }

    /// Reads a package file through a signed scope.
    pub async fn read_content(&self, scope: &ContentScope, path: &str) -> ScormResult<Bytes> {
        if !self.signer.verify(scope, Utc::now()) {
            tracing::warn!(
                package_id = %scope.package_id,
                "rejected content request with bad or expired signature"
            );
            return Err(ScormError::AccessDenied);
        }
        let package = self
            .repo
            .get_package(scope.package_id)
            .await?
            .filter(|p| p.tenant_id == scope.tenant_id && p.is_active())
            .ok_or(ScormError::PackageNotFound(scope.package_id))?;

        let relative = manifest::normalize_decoded_path(path)
            .map_err(|_| ScormError::BadRequest(format!("bad content path '{path}'")))?;
        match self.store.get(&package.file_path(&relative)).await {
            Ok(bytes) => Ok(bytes),
            Err(StorageError::NotFound(_)) => Err(ScormError::ContentMissing(relative)),
            Err(e) => Err(e.into()),
        }
    }
}

/// `{root}/{escaped entry path}` followed by the item's launch parameters.
fn entry_url(root: &str, entry_path: &str, parameters: Option<&str>) -> String {
    let mut url = root.to_string();
    for segment in entry_path.split('/') {
        url.push('/');
        url.extend(utf8_percent_encode(segment, SEGMENT));
    }
    match parameters.map(str::trim).filter(|p| !p.is_empty()) {
        Some(p) if p.starts_with('#') => url.push_str(p),
        Some(p) => {
            url.push('?');
            url.push_str(p.trim_start_matches(['?', '&']));
        }
        None => {}
    }
    url
}
