//! Persistence of packages, content objects, and attempts.
//!
//! Packages and content objects are written once at ingestion and read-only
//! afterwards. Attempts are the only rows mutated concurrently; callers
//! serialize writes per attempt key (see [`crate::runtime::AttemptLocks`]).

use async_trait::async_trait;
use uuid::Uuid;

use crate::models::{Attempt, AttemptKey, ContentObject, Package, PackageStatus};

pub mod memory;
pub mod postgres;

pub use memory::MemoryRepository;
pub use postgres::PgRepository;

#[derive(Debug, thiserror::Error)]
pub enum RepoError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("stored row is corrupt: {0}")]
    Corrupt(String),
    #[error("repository unavailable: {0}")]
    Unavailable(String),
}

pub type RepoResult<T> = Result<T, RepoError>;

#[async_trait]
pub trait Repository: Send + Sync {
    /// Persists a package and all its content objects as one unit.
    async fn create_package(&self, package: &Package, objects: &[ContentObject])
        -> RepoResult<()>;

    async fn get_package(&self, id: Uuid) -> RepoResult<Option<Package>>;

    /// Returns false when no package has this id.
    async fn set_package_status(&self, id: Uuid, status: PackageStatus) -> RepoResult<bool>;

    /// Content objects of a package ordered by ordinal.
    async fn content_objects(&self, package_id: Uuid) -> RepoResult<Vec<ContentObject>>;

    async fn get_content_object(&self, id: Uuid) -> RepoResult<Option<ContentObject>>;

    /// A content object together with its owning package.
    async fn content_object_with_package(
        &self,
        id: Uuid,
    ) -> RepoResult<Option<(ContentObject, Package)>> {
        let Some(co) = self.get_content_object(id).await? else {
            return Ok(None);
        };
        match self.get_package(co.package_id).await? {
            Some(package) => Ok(Some((co, package))),
            None => Err(RepoError::Corrupt(format!(
                "content object {id} references missing package {}",
                co.package_id
            ))),
        }
    }

    async fn get_attempt(&self, key: &AttemptKey) -> RepoResult<Option<Attempt>>;

    /// Inserts or replaces the attempt stored under its key.
    async fn save_attempt(&self, attempt: &Attempt) -> RepoResult<()>;

    /// Inserts only if the key is free. Returns false if it was taken.
    async fn insert_attempt(&self, attempt: &Attempt) -> RepoResult<bool>;

    /// One learner's attempts on a content object, ascending attempt number.
    async fn list_attempts(
        &self,
        learner_id: &str,
        tenant_id: Uuid,
        content_object_id: Uuid,
    ) -> RepoResult<Vec<Attempt>>;

    /// Every attempt on a content object within a tenant.
    async fn attempts_for_content_object(
        &self,
        tenant_id: Uuid,
        content_object_id: Uuid,
    ) -> RepoResult<Vec<Attempt>>;
}
