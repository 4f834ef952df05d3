//! Package Ingestor.
//!
//! Upload → size check → in-memory extraction (bounded) → manifest parse →
//! write-through to the store → one repository transaction. Any failure after
//! the first storage write removes the package prefix again (best effort).

use bytes::Bytes;
use chrono::Utc;
use std::collections::HashSet;
use std::io::Read;
use std::path::Component;
use std::sync::Arc;
use tokio::time::{timeout_at, Instant};
use uuid::Uuid;

use crate::auth::Caller;
use crate::config::IngestLimits;
use crate::error::{ScormError, ScormResult};
use crate::manifest::{self, MANIFEST_FILE};
use crate::models::{ContentObject, Package, PackageStatus, PackageWithObjects};
use crate::repo::Repository;
use crate::storage::PackageStore;

pub struct IngestRequest {
    pub tenant_id: Uuid,
    pub course_id: Option<Uuid>,
    pub archive: Bytes,
}

/// One extracted archive entry, path relative to the archive root.
struct ArchiveEntry {
    path: String,
    data: Bytes,
}

pub struct Ingestor {
    store: Arc<dyn PackageStore>,
    repo: Arc<dyn Repository>,
    limits: IngestLimits,
}

impl Ingestor {
    pub fn new(
        store: Arc<dyn PackageStore>,
        repo: Arc<dyn Repository>,
        limits: IngestLimits,
    ) -> Self {
        Self {
            store,
            repo,
            limits,
        }
    }

    pub fn limits(&self) -> &IngestLimits {
        &self.limits
    }

    #[tracing::instrument(
        skip(self, caller, req),
        fields(tenant_id = %req.tenant_id, size = req.archive.len())
    )]
    pub async fn ingest(
        &self,
        caller: &Caller,
        req: IngestRequest,
    ) -> ScormResult<PackageWithObjects> {
        caller.require_staff()?;
        caller.require_tenant(req.tenant_id)?;

        let size = req.archive.len() as u64;
        if size > self.limits.max_archive_bytes {
            return Err(ScormError::ArchiveTooLarge {
                limit: self.limits.max_archive_bytes,
                actual: size,
            });
        }

        let deadline = Instant::now() + self.limits.timeout;
        let timeout_secs = self.limits.timeout.as_secs();

        let max_extracted = self.limits.max_extracted_bytes;
        let archive = req.archive;
        let extraction = tokio::task::spawn_blocking(move || read_archive(archive, max_extracted));
        let entries = match timeout_at(deadline, extraction).await {
            Ok(joined) => joined.map_err(|e| {
                ScormError::ArchiveInvalid(format!("extraction task failed: {e}"))
            })??,
            Err(_) => return Err(ScormError::IngestionTimeout(timeout_secs)),
        };

        let (root_prefix, manifest_bytes) = locate_manifest(&entries)?;
        let parsed = manifest::parse_manifest(manifest_bytes)?;

        let names: HashSet<&str> = entries.iter().map(|e| e.path.as_str()).collect();
        for co in &parsed.content_objects {
            let in_archive = format!("{root_prefix}{}", co.entry_path);
            if !names.contains(in_archive.as_str()) {
                return Err(ScormError::ManifestInvalid(format!(
                    "item '{}' launches '{}', which is not in the archive",
                    co.identifier, co.entry_path
                )));
            }
        }

        let package_id = Uuid::new_v4();
        let storage_root = format!("tenants/{}/packages/{}", req.tenant_id, package_id);
        let now = Utc::now();

        let package = Package {
            id: package_id,
            tenant_id: req.tenant_id,
            course_id: req.course_id,
            uploaded_by: caller.learner_id.clone(),
            identifier: parsed.identifier,
            title: parsed.title,
            schema_version: parsed.schema_version,
            storage_root: storage_root.clone(),
            status: PackageStatus::Active,
            created_at: now,
        };
        let content_objects: Vec<ContentObject> = parsed
            .content_objects
            .into_iter()
            .map(|d| ContentObject {
                id: Uuid::new_v4(),
                package_id,
                identifier: d.identifier,
                title: d.title,
                ordinal: d.ordinal,
                entry_path: format!("{root_prefix}{}", d.entry_path),
                parameters: d.parameters,
                mastery_score: d.mastery_score,
                prerequisites: d.prerequisites,
                created_at: now,
            })
            .collect();

        match timeout_at(deadline, self.write_files(&storage_root, &entries)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                self.rollback(&storage_root).await;
                return Err(e);
            }
            Err(_) => {
                self.rollback(&storage_root).await;
                return Err(ScormError::IngestionTimeout(timeout_secs));
            }
        }

        if let Err(e) = self.repo.create_package(&package, &content_objects).await {
            self.rollback(&storage_root).await;
            return Err(e.into());
        }

        tracing::info!(
            package_id = %package.id,
            files = entries.len(),
            content_objects = content_objects.len(),
            "package ingested"
        );
        Ok(PackageWithObjects {
            package,
            content_objects,
        })
    }

    /// Package with its content objects, scoped to the caller's tenant.
    pub async fn get_package(&self, caller: &Caller, id: Uuid) -> ScormResult<PackageWithObjects> {
        let package = self
            .repo
            .get_package(id)
            .await?
            .ok_or(ScormError::PackageNotFound(id))?;
        caller.require_tenant(package.tenant_id)?;
        let content_objects = self.repo.content_objects(id).await?;
        Ok(PackageWithObjects {
            package,
            content_objects,
        })
    }

    /// Soft-deletes the package, then removes its files best-effort.
    #[tracing::instrument(skip(self, caller), fields(package_id = %id))]
    pub async fn delete_package(&self, caller: &Caller, id: Uuid) -> ScormResult<Package> {
        caller.require_staff()?;
        let mut package = self
            .repo
            .get_package(id)
            .await?
            .ok_or(ScormError::PackageNotFound(id))?;
        caller.require_tenant(package.tenant_id)?;

        if package.is_active() {
            self.repo
                .set_package_status(id, PackageStatus::Deleted)
                .await?;
            package.status = PackageStatus::Deleted;
        }
        self.rollback(&package.storage_root).await;
        Ok(package)
    }

    async fn write_files(&self, root: &str, entries: &[ArchiveEntry]) -> ScormResult<()> {
        for entry in entries {
            self.store
                .put(&format!("{root}/{}", entry.path), entry.data.clone())
                .await?;
        }
        Ok(())
    }

    async fn rollback(&self, root: &str) {
        match self.store.delete_prefix(root).await {
            Ok(removed) => tracing::debug!(root, removed, "removed package files"),
            Err(e) => tracing::warn!(root, error = %e, "failed to clean up package files"),
        }
    }
}

/// Reads every file entry into memory, enforcing the uncompressed ceiling
/// from the central directory before touching any data.
fn read_archive(archive: Bytes, max_extracted: u64) -> ScormResult<Vec<ArchiveEntry>> {
    let mut zip = zip::ZipArchive::new(std::io::Cursor::new(archive))
        .map_err(|e| ScormError::ArchiveInvalid(e.to_string()))?;

    let mut declared: u64 = 0;
    for i in 0..zip.len() {
        let file = zip
            .by_index_raw(i)
            .map_err(|e| ScormError::ArchiveInvalid(e.to_string()))?;
        declared = declared.saturating_add(file.size());
    }
    if declared > max_extracted {
        return Err(ScormError::ArchiveTooLarge {
            limit: max_extracted,
            actual: declared,
        });
    }

    let mut entries = Vec::with_capacity(zip.len());
    let mut total: u64 = 0;
    for i in 0..zip.len() {
        let file = zip
            .by_index(i)
            .map_err(|e| ScormError::ArchiveInvalid(e.to_string()))?;
        if file.is_dir() {
            continue;
        }
        let Some(path) = file.enclosed_name().and_then(|p| archive_path(p)) else {
            tracing::warn!(name = file.name(), "skipping archive entry with unsafe path");
            continue;
        };
        if path.starts_with("__MACOSX/") {
            continue;
        }

        let mut buf = Vec::new();
        // headers can lie about sizes; bound the actual read as well
        file.take((max_extracted - total).saturating_add(1))
            .read_to_end(&mut buf)
            .map_err(|e| ScormError::ArchiveInvalid(format!("failed to read '{path}': {e}")))?;
        total = total.saturating_add(buf.len() as u64);
        if total > max_extracted {
            return Err(ScormError::ArchiveTooLarge {
                limit: max_extracted,
                actual: total,
            });
        }
        entries.push(ArchiveEntry {
            path,
            data: Bytes::from(buf),
        });
    }
    Ok(entries)
}

fn archive_path(path: &std::path::Path) -> Option<String> {
    let mut parts = Vec::new();
    for c in path.components() {
        match c {
            Component::Normal(s) => parts.push(s.to_str()?.to_string()),
            _ => return None,
        }
    }
    (!parts.is_empty()).then(|| parts.join("/"))
}

/// Finds `imsmanifest.xml` at the archive root, or inside the single
/// top-level directory of a zipped folder. Returns the package root prefix.
fn locate_manifest(entries: &[ArchiveEntry]) -> ScormResult<(String, &[u8])> {
    if let Some(e) = entries.iter().find(|e| e.path == MANIFEST_FILE) {
        return Ok((String::new(), &e.data[..]));
    }

    let top_dirs: HashSet<&str> = entries
        .iter()
        .map(|e| e.path.split_once('/').map(|(d, _)| d).unwrap_or(""))
        .collect();
    if top_dirs.len() == 1 {
        if let Some(dir) = top_dirs.into_iter().next().filter(|d| !d.is_empty()) {
            let wanted = format!("{dir}/{MANIFEST_FILE}");
            if let Some(e) = entries.iter().find(|e| e.path == wanted) {
                return Ok((format!("{dir}/"), &e.data[..]));
            }
        }
    }
    Err(ScormError::ManifestMissing)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Role;
    use crate::repo::MemoryRepository;
    use crate::storage::{MemoryStore, StorageError, StorageResult};
    use crate::testutil::{grouped_manifest, zip_archive};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn setup(limits: IngestLimits) -> (Ingestor, Arc<MemoryStore>, Arc<MemoryRepository>) {
        let store = Arc::new(MemoryStore::new());
        let repo = Arc::new(MemoryRepository::new());
        (Ingestor::new(store.clone(), repo.clone(), limits), store, repo)
    }

    fn instructor(tenant: Uuid) -> Caller {
        Caller::new("ines", tenant, Role::Instructor)
    }

    fn request(tenant: Uuid, archive: Bytes) -> IngestRequest {
        IngestRequest {
            tenant_id: tenant,
            course_id: None,
            archive,
        }
    }

    fn sample_archive() -> Bytes {
        zip_archive(&[
            ("imsmanifest.xml", grouped_manifest().as_bytes()),
            ("intro.html", b"<h1>intro</h1>"),
            ("m2/a.html", b"a"),
            ("m2/b.html", b"b"),
            ("quiz.html", b"quiz"),
            ("shared/app.js", b"console.log(1)"),
        ])
    }

    #[tokio::test]
    async fn ingests_grouped_manifest_in_document_order() {
        let (ingestor, store, repo) = setup(IngestLimits::default());
        let tenant = Uuid::new_v4();

        let out = ingestor
            .ingest(&instructor(tenant), request(tenant, sample_archive()))
            .await
            .unwrap();

        let idents: Vec<_> = out
            .content_objects
            .iter()
            .map(|c| (c.ordinal, c.identifier.as_str()))
            .collect();
        assert_eq!(idents, [(0, "I1"), (1, "I2"), (2, "I3"), (3, "I4")]);
        assert_eq!(out.package.tenant_id, tenant);
        assert_eq!(out.package.uploaded_by, "ines");
        assert!(out
            .package
            .storage_root
            .starts_with(&format!("tenants/{tenant}/packages/")));

        // every archive file is readable byte-for-byte under the storage root
        let js = store
            .get(&out.package.file_path("shared/app.js"))
            .await
            .unwrap();
        assert_eq!(&js[..], b"console.log(1)");
        assert_eq!(store.len(), 6);

        let stored = repo.get_package(out.package.id).await.unwrap().unwrap();
        assert_eq!(stored, out.package);
        assert_eq!(repo.content_objects(out.package.id).await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn rejects_oversized_archive_before_reading() {
        let (ingestor, store, _) = setup(IngestLimits {
            max_archive_bytes: 16,
            ..IngestLimits::default()
        });
        let tenant = Uuid::new_v4();
        let err = ingestor
            .ingest(&instructor(tenant), request(tenant, sample_archive()))
            .await
            .unwrap_err();
        assert!(matches!(err, ScormError::ArchiveTooLarge { limit: 16, .. }));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn rejects_archives_that_inflate_past_the_ceiling() {
        let (ingestor, _, _) = setup(IngestLimits {
            max_extracted_bytes: 64,
            ..IngestLimits::default()
        });
        let tenant = Uuid::new_v4();
        let big = vec![b'x'; 4096];
        let archive = zip_archive(&[
            ("imsmanifest.xml", grouped_manifest().as_bytes()),
            ("intro.html", &big),
        ]);
        let err = ingestor
            .ingest(&instructor(tenant), request(tenant, archive))
            .await
            .unwrap_err();
        assert!(matches!(err, ScormError::ArchiveTooLarge { limit: 64, .. }));
    }

    #[tokio::test]
    async fn rejects_unreadable_archive() {
        let (ingestor, _, _) = setup(IngestLimits::default());
        let tenant = Uuid::new_v4();
        let err = ingestor
            .ingest(
                &instructor(tenant),
                request(tenant, Bytes::from_static(b"definitely not a zip")),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ScormError::ArchiveInvalid(_)));
    }

    #[tokio::test]
    async fn missing_manifest_persists_nothing() {
        let (ingestor, store, _) = setup(IngestLimits::default());
        let tenant = Uuid::new_v4();
        let archive = zip_archive(&[("a/index.html", b"x"), ("b/index.html", b"y")]);
        let err = ingestor
            .ingest(&instructor(tenant), request(tenant, archive))
            .await
            .unwrap_err();
        assert!(matches!(err, ScormError::ManifestMissing));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn invalid_manifest_persists_nothing() {
        let (ingestor, store, _) = setup(IngestLimits::default());
        let tenant = Uuid::new_v4();
        let archive = zip_archive(&[
            ("imsmanifest.xml", b"<manifest><organizations></manifest>"),
            ("index.html", b"x"),
        ]);
        let err = ingestor
            .ingest(&instructor(tenant), request(tenant, archive))
            .await
            .unwrap_err();
        assert!(matches!(err, ScormError::ManifestInvalid(_)));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn entry_missing_from_archive_is_invalid() {
        let (ingestor, _, _) = setup(IngestLimits::default());
        let tenant = Uuid::new_v4();
        let archive = zip_archive(&[
            ("imsmanifest.xml", grouped_manifest().as_bytes()),
            ("intro.html", b"only one"),
        ]);
        let err = ingestor
            .ingest(&instructor(tenant), request(tenant, archive))
            .await
            .unwrap_err();
        assert!(matches!(err, ScormError::ManifestInvalid(msg) if msg.contains("m2/a.html")));
    }

    #[tokio::test]
    async fn accepts_zipped_folder() {
        let (ingestor, store, _) = setup(IngestLimits::default());
        let tenant = Uuid::new_v4();
        let archive = zip_archive(&[
            ("course/imsmanifest.xml", grouped_manifest().as_bytes()),
            ("course/intro.html", b"i"),
            ("course/m2/a.html", b"a"),
            ("course/m2/b.html", b"b"),
            ("course/quiz.html", b"q"),
        ]);
        let out = ingestor
            .ingest(&instructor(tenant), request(tenant, archive))
            .await
            .unwrap();
        assert_eq!(out.content_objects[0].entry_path, "course/intro.html");
        assert!(store
            .exists(&out.package.file_path("course/intro.html"))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn learners_cannot_upload() {
        let (ingestor, _, _) = setup(IngestLimits::default());
        let tenant = Uuid::new_v4();
        let learner = Caller::new("lea", tenant, Role::Learner);
        let err = ingestor
            .ingest(&learner, request(tenant, sample_archive()))
            .await
            .unwrap_err();
        assert!(matches!(err, ScormError::AccessDenied));

        let other_tenant = Uuid::new_v4();
        let err = ingestor
            .ingest(&instructor(tenant), request(other_tenant, sample_archive()))
            .await
            .unwrap_err();
        assert!(matches!(err, ScormError::AccessDenied));
    }

    /// Fails the n-th put, delays every put by `delay`.
    struct FlakyStore {
        inner: MemoryStore,
        fail_at: usize,
        delay: Duration,
        puts: AtomicUsize,
    }

    #[async_trait]
    impl PackageStore for FlakyStore {
        async fn put(&self, path: &str, data: Bytes) -> StorageResult<()> {
            tokio::time::sleep(self.delay).await;
            if self.puts.fetch_add(1, Ordering::SeqCst) + 1 == self.fail_at {
                return Err(StorageError::Unavailable("disk full".into()));
            }
            self.inner.put(path, data).await
        }
        async fn get(&self, path: &str) -> StorageResult<Bytes> {
            self.inner.get(path).await
        }
        async fn exists(&self, path: &str) -> StorageResult<bool> {
            self.inner.exists(path).await
        }
        async fn delete_prefix(&self, prefix: &str) -> StorageResult<usize> {
            self.inner.delete_prefix(prefix).await
        }
    }

    fn flaky(fail_at: usize, delay: Duration) -> Arc<FlakyStore> {
        Arc::new(FlakyStore {
            inner: MemoryStore::new(),
            fail_at,
            delay,
            puts: AtomicUsize::new(0),
        })
    }

    #[tokio::test]
    async fn storage_failure_rolls_back_written_files() {
        let store = flaky(4, Duration::ZERO);
        let repo = Arc::new(MemoryRepository::new());
        let ingestor = Ingestor::new(store.clone(), repo, IngestLimits::default());
        let tenant = Uuid::new_v4();

        let err = ingestor
            .ingest(&instructor(tenant), request(tenant, sample_archive()))
            .await
            .unwrap_err();
        assert!(matches!(err, ScormError::Storage(_)));
        assert!(store.inner.is_empty());
    }

    #[tokio::test]
    async fn slow_writes_time_out_and_roll_back() {
        let store = flaky(usize::MAX, Duration::from_millis(50));
        let repo = Arc::new(MemoryRepository::new());
        let ingestor = Ingestor::new(
            store.clone(),
            repo,
            IngestLimits {
                timeout: Duration::from_millis(120),
                ..IngestLimits::default()
            },
        );
        let tenant = Uuid::new_v4();

        let err = ingestor
            .ingest(&instructor(tenant), request(tenant, sample_archive()))
            .await
            .unwrap_err();
        assert!(matches!(err, ScormError::IngestionTimeout(_)));
        assert!(store.inner.is_empty());
    }

    #[tokio::test]
    async fn delete_soft_deletes_and_removes_files() {
        let (ingestor, store, repo) = setup(IngestLimits::default());
        let tenant = Uuid::new_v4();
        let out = ingestor
            .ingest(&instructor(tenant), request(tenant, sample_archive()))
            .await
            .unwrap();

        let deleted = ingestor
            .delete_package(&instructor(tenant), out.package.id)
            .await
            .unwrap();
        assert_eq!(deleted.status, PackageStatus::Deleted);
        assert!(store.is_empty());
        let stored = repo.get_package(out.package.id).await.unwrap().unwrap();
        assert!(!stored.is_active());
        // content objects survive the soft delete
        assert_eq!(repo.content_objects(out.package.id).await.unwrap().len(), 4);
    }

    #[test]
    fn unbounded_extraction_ceiling_reads_every_byte() {
        let entries = read_archive(sample_archive(), u64::MAX).unwrap();
        let app = entries.iter().find(|e| e.path == "shared/app.js").unwrap();
        assert_eq!(&app.data[..], b"console.log(1)");
    }
}
