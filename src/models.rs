use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PackageStatus {
    Active,
    Deleted,
}

impl PackageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PackageStatus::Active => "active",
            PackageStatus::Deleted => "deleted",
        }
    }
}

impl FromStr for PackageStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(PackageStatus::Active),
            "deleted" => Ok(PackageStatus::Deleted),
            other => Err(format!("unknown package status '{other}'")),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Package {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub course_id: Option<Uuid>,
    pub uploaded_by: String,
    /// `identifier` attribute of the manifest root.
    pub identifier: String,
    pub title: String,
    pub schema_version: String,
    /// Storage prefix holding every extracted file, e.g. "tenants/<t>/packages/<p>".
    pub storage_root: String,
    pub status: PackageStatus,
    pub created_at: DateTime<Utc>,
}

impl Package {
    pub fn is_active(&self) -> bool {
        self.status == PackageStatus::Active
    }

    /// Storage path of a file addressed relative to the package root.
    pub fn file_path(&self, relative: &str) -> String {
        format!("{}/{}", self.storage_root, relative.trim_start_matches('/'))
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ContentObject {
    pub id: Uuid,
    pub package_id: Uuid,
    pub identifier: String,
    pub title: String,
    pub ordinal: i32,
    /// Relative to the package root, without query string.
    pub entry_path: String,
    /// Launch parameters appended to the entry URL.
    pub parameters: Option<String>,
    pub mastery_score: Option<f64>,
    /// Raw prerequisite expression; stored, never evaluated.
    pub prerequisites: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Runtime status of an attempt.
///
/// Ordering by [`AttemptStatus::rank`] is the priority lattice used when
/// merging commits: not_attempted < incomplete < browsed < failed < completed < passed.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    NotAttempted,
    Incomplete,
    Browsed,
    Failed,
    Completed,
    Passed,
}

impl AttemptStatus {
    pub fn rank(&self) -> u8 {
        match self {
            AttemptStatus::NotAttempted => 0,
            AttemptStatus::Incomplete => 1,
            AttemptStatus::Browsed => 2,
            AttemptStatus::Failed => 3,
            AttemptStatus::Completed => 4,
            AttemptStatus::Passed => 5,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AttemptStatus::Completed | AttemptStatus::Passed | AttemptStatus::Failed
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptStatus::NotAttempted => "not_attempted",
            AttemptStatus::Incomplete => "incomplete",
            AttemptStatus::Browsed => "browsed",
            AttemptStatus::Failed => "failed",
            AttemptStatus::Completed => "completed",
            AttemptStatus::Passed => "passed",
        }
    }

    /// Accepts the vocabulary of both SCORM 1.2 `lesson_status` and 2004
    /// `completion_status` / `success_status`.
    pub fn normalize(v: &str) -> Option<AttemptStatus> {
        match v.trim().to_ascii_lowercase().as_str() {
            "passed" => Some(AttemptStatus::Passed),
            "failed" => Some(AttemptStatus::Failed),
            "completed" => Some(AttemptStatus::Completed),
            "incomplete" => Some(AttemptStatus::Incomplete),
            "browsed" => Some(AttemptStatus::Browsed),
            "not attempted" | "not_attempted" | "unknown" => Some(AttemptStatus::NotAttempted),
            _ => None,
        }
    }
}

impl fmt::Display for AttemptStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AttemptStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AttemptStatus::normalize(s).ok_or_else(|| format!("unknown attempt status '{s}'"))
    }
}

/// Composite identity of an attempt.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct AttemptKey {
    pub learner_id: String,
    pub tenant_id: Uuid,
    pub content_object_id: Uuid,
    pub attempt_number: i32,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Attempt {
    pub learner_id: String,
    pub tenant_id: Uuid,
    pub content_object_id: Uuid,
    pub attempt_number: i32,
    pub status: AttemptStatus,
    pub score_raw: Option<f64>,
    pub score_min: Option<f64>,
    pub score_max: Option<f64>,
    pub total_time_ms: i64,
    pub last_session_ms: Option<i64>,
    pub suspend_data: Option<String>,
    pub location: Option<String>,
    pub exit: Option<String>,
    /// Digest of the last applied commit, for retry detection.
    pub last_commit_digest: Option<String>,
    pub first_commit_at: Option<DateTime<Utc>>,
    pub last_commit_at: Option<DateTime<Utc>>,
    pub terminal_at: Option<DateTime<Utc>>,
}

impl Attempt {
    pub fn new(key: AttemptKey) -> Self {
        Self {
            learner_id: key.learner_id,
            tenant_id: key.tenant_id,
            content_object_id: key.content_object_id,
            attempt_number: key.attempt_number,
            status: AttemptStatus::NotAttempted,
            score_raw: None,
            score_min: None,
            score_max: None,
            total_time_ms: 0,
            last_session_ms: None,
            suspend_data: None,
            location: None,
            exit: None,
            last_commit_digest: None,
            first_commit_at: None,
            last_commit_at: None,
            terminal_at: None,
        }
    }

    pub fn key(&self) -> AttemptKey {
        AttemptKey {
            learner_id: self.learner_id.clone(),
            tenant_id: self.tenant_id,
            content_object_id: self.content_object_id,
            attempt_number: self.attempt_number,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Package together with its content objects in ordinal order.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PackageWithObjects {
    pub package: Package,
    pub content_objects: Vec<ContentObject>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_lattice_order() {
        let ordered = [
            AttemptStatus::NotAttempted,
            AttemptStatus::Incomplete,
            AttemptStatus::Browsed,
            AttemptStatus::Failed,
            AttemptStatus::Completed,
            AttemptStatus::Passed,
        ];
        for pair in ordered.windows(2) {
            assert!(pair[0].rank() < pair[1].rank(), "{} < {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn normalizes_scorm_vocabulary() {
        assert_eq!(
            AttemptStatus::normalize("not attempted"),
            Some(AttemptStatus::NotAttempted)
        );
        assert_eq!(AttemptStatus::normalize("unknown"), Some(AttemptStatus::NotAttempted));
        assert_eq!(AttemptStatus::normalize(" Passed "), Some(AttemptStatus::Passed));
        assert_eq!(AttemptStatus::normalize("done"), None);
    }

    #[test]
    fn file_path_joins_under_root() {
        let pkg = Package {
            id: Uuid::nil(),
            tenant_id: Uuid::nil(),
            course_id: None,
            uploaded_by: "u".into(),
            identifier: "m".into(),
            title: "t".into(),
            schema_version: "1.2".into(),
            storage_root: "tenants/a/packages/b".into(),
            status: PackageStatus::Active,
            created_at: Utc::now(),
        };
        assert_eq!(pkg.file_path("/index.html"), "tenants/a/packages/b/index.html");
    }
}
