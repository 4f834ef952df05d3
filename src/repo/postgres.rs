use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::FromRow;
use uuid::Uuid;

use super::{RepoError, RepoResult, Repository};
use crate::db::Db;
use crate::models::{Attempt, AttemptKey, ContentObject, Package, PackageStatus};

/// Postgres-backed repository (schema in `migrations/`).
#[derive(Clone)]
pub struct PgRepository {
    pool: Db,
}

impl PgRepository {
    pub fn new(pool: Db) -> Self {
        Self { pool }
    }
}

#[derive(FromRow)]
struct PackageRow {
    id: Uuid,
    tenant_id: Uuid,
    course_id: Option<Uuid>,
    uploaded_by: String,
    identifier: String,
    title: String,
    schema_version: String,
    storage_root: String,
    status: String,
    created_at: DateTime<Utc>,
}

impl PackageRow {
    fn to_domain(self) -> RepoResult<Package> {
        let status = self.status.parse().map_err(RepoError::Corrupt)?;
        Ok(Package {
            id: self.id,
            tenant_id: self.tenant_id,
            course_id: self.course_id,
            uploaded_by: self.uploaded_by,
            identifier: self.identifier,
            title: self.title,
            schema_version: self.schema_version,
            storage_root: self.storage_root,
            status,
            created_at: self.created_at,
        })
    }
}

#[derive(FromRow)]
struct ContentObjectRow {
    id: Uuid,
    package_id: Uuid,
    identifier: String,
    title: String,
    ordinal: i32,
    entry_path: String,
    parameters: Option<String>,
    mastery_score: Option<f64>,
    prerequisites: Option<String>,
    created_at: DateTime<Utc>,
}

impl ContentObjectRow {
    fn to_domain(self) -> ContentObject {
        ContentObject {
            id: self.id,
            package_id: self.package_id,
            identifier: self.identifier,
            title: self.title,
            ordinal: self.ordinal,
            entry_path: self.entry_path,
            parameters: self.parameters,
            mastery_score: self.mastery_score,
            prerequisites: self.prerequisites,
            created_at: self.created_at,
        }
    }
}

#[derive(FromRow)]
struct AttemptRow {
    learner_id: String,
    tenant_id: Uuid,
    content_object_id: Uuid,
    attempt_number: i32,
    status: String,
    score_raw: Option<f64>,
    score_min: Option<f64>,
    score_max: Option<f64>,
    total_time_ms: i64,
    last_session_ms: Option<i64>,
    suspend_data: Option<String>,
    location: Option<String>,
    exit: Option<String>,
    last_commit_digest: Option<String>,
    first_commit_at: Option<DateTime<Utc>>,
    last_commit_at: Option<DateTime<Utc>>,
    terminal_at: Option<DateTime<Utc>>,
}

impl AttemptRow {
    fn to_domain(self) -> RepoResult<Attempt> {
        let status = self.status.parse().map_err(RepoError::Corrupt)?;
        Ok(Attempt {
            learner_id: self.learner_id,
            tenant_id: self.tenant_id,
            content_object_id: self.content_object_id,
            attempt_number: self.attempt_number,
            status,
            score_raw: self.score_raw,
            score_min: self.score_min,
            score_max: self.score_max,
            total_time_ms: self.total_time_ms,
            last_session_ms: self.last_session_ms,
            suspend_data: self.suspend_data,
            location: self.location,
            exit: self.exit,
            last_commit_digest: self.last_commit_digest,
            first_commit_at: self.first_commit_at,
            last_commit_at: self.last_commit_at,
            terminal_at: self.terminal_at,
        })
    }
}

const PACKAGE_COLUMNS: &str = "id, tenant_id, course_id, uploaded_by, identifier, title, \
     schema_version, storage_root, status, created_at";

const CONTENT_OBJECT_COLUMNS: &str = "id, package_id, identifier, title, ordinal, entry_path, \
     parameters, mastery_score, prerequisites, created_at";

const ATTEMPT_COLUMNS: &str = "learner_id, tenant_id, content_object_id, attempt_number, status, \
     score_raw, score_min, score_max, total_time_ms, last_session_ms, suspend_data, location, \
     exit, last_commit_digest, first_commit_at, last_commit_at, terminal_at";

fn bind_attempt<'q>(
    query: sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments>,
    a: &'q Attempt,
) -> sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments> {
    query
        .bind(&a.learner_id)
        .bind(a.tenant_id)
        .bind(a.content_object_id)
        .bind(a.attempt_number)
        .bind(a.status.as_str())
        .bind(a.score_raw)
        .bind(a.score_min)
        .bind(a.score_max)
        .bind(a.total_time_ms)
        .bind(a.last_session_ms)
        .bind(&a.suspend_data)
        .bind(&a.location)
        .bind(&a.exit)
        .bind(&a.last_commit_digest)
        .bind(a.first_commit_at)
        .bind(a.last_commit_at)
        .bind(a.terminal_at)
}

#[async_trait]
impl Repository for PgRepository {
    async fn create_package(
        &self,
        package: &Package,
        objects: &[ContentObject],
    ) -> RepoResult<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO packages (id, tenant_id, course_id, uploaded_by, identifier, title,
                                  schema_version, storage_root, status, created_at)
            VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10)
            "#,
        )
        .bind(package.id)
        .bind(package.tenant_id)
        .bind(package.course_id)
        .bind(&package.uploaded_by)
        .bind(&package.identifier)
        .bind(&package.title)
        .bind(&package.schema_version)
        .bind(&package.storage_root)
        .bind(package.status.as_str())
        .bind(package.created_at)
        .execute(&mut *tx)
        .await?;

        for co in objects {
            sqlx::query(
                r#"
                INSERT INTO content_objects (id, package_id, identifier, title, ordinal,
                                             entry_path, parameters, mastery_score,
                                             prerequisites, created_at)
                VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10)
                "#,
            )
            .bind(co.id)
            .bind(co.package_id)
            .bind(&co.identifier)
            .bind(&co.title)
            .bind(co.ordinal)
            .bind(&co.entry_path)
            .bind(&co.parameters)
            .bind(co.mastery_score)
            .bind(&co.prerequisites)
            .bind(co.created_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn get_package(&self, id: Uuid) -> RepoResult<Option<Package>> {
        let row = sqlx::query_as::<_, PackageRow>(&format!(
            "SELECT {PACKAGE_COLUMNS} FROM packages WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(PackageRow::to_domain).transpose()
    }

    async fn set_package_status(&self, id: Uuid, status: PackageStatus) -> RepoResult<bool> {
        let res = sqlx::query("UPDATE packages SET status = $2 WHERE id = $1")
            .bind(id)
            .bind(status.as_str())
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected() > 0)
    }

    async fn content_objects(&self, package_id: Uuid) -> RepoResult<Vec<ContentObject>> {
        let rows = sqlx::query_as::<_, ContentObjectRow>(&format!(
            "SELECT {CONTENT_OBJECT_COLUMNS} FROM content_objects WHERE package_id = $1 ORDER BY ordinal"
        ))
        .bind(package_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(ContentObjectRow::to_domain).collect())
    }

    async fn get_content_object(&self, id: Uuid) -> RepoResult<Option<ContentObject>> {
        let row = sqlx::query_as::<_, ContentObjectRow>(&format!(
            "SELECT {CONTENT_OBJECT_COLUMNS} FROM content_objects WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(ContentObjectRow::to_domain))
    }

    async fn get_attempt(&self, key: &AttemptKey) -> RepoResult<Option<Attempt>> {
        let row = sqlx::query_as::<_, AttemptRow>(&format!(
            "SELECT {ATTEMPT_COLUMNS} FROM attempts \
             WHERE learner_id = $1 AND tenant_id = $2 AND content_object_id = $3 AND attempt_number = $4"
        ))
        .bind(&key.learner_id)
        .bind(key.tenant_id)
        .bind(key.content_object_id)
        .bind(key.attempt_number)
        .fetch_optional(&self.pool)
        .await?;
        row.map(AttemptRow::to_domain).transpose()
    }

    async fn save_attempt(&self, attempt: &Attempt) -> RepoResult<()> {
        let sql = format!(
            r#"
            INSERT INTO attempts ({ATTEMPT_COLUMNS})
            VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16,$17)
            ON CONFLICT (learner_id, tenant_id, content_object_id, attempt_number)
            DO UPDATE SET status = EXCLUDED.status,
                          score_raw = EXCLUDED.score_raw,
                          score_min = EXCLUDED.score_min,
                          score_max = EXCLUDED.score_max,
                          total_time_ms = EXCLUDED.total_time_ms,
                          last_session_ms = EXCLUDED.last_session_ms,
                          suspend_data = EXCLUDED.suspend_data,
                          location = EXCLUDED.location,
                          exit = EXCLUDED.exit,
                          last_commit_digest = EXCLUDED.last_commit_digest,
                          first_commit_at = EXCLUDED.first_commit_at,
                          last_commit_at = EXCLUDED.last_commit_at,
                          terminal_at = EXCLUDED.terminal_at
            "#
        );
        bind_attempt(sqlx::query(&sql), attempt)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn insert_attempt(&self, attempt: &Attempt) -> RepoResult<bool> {
        let sql = format!(
            r#"
            INSERT INTO attempts ({ATTEMPT_COLUMNS})
            VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16,$17)
            ON CONFLICT DO NOTHING
            "#
        );
        let res = bind_attempt(sqlx::query(&sql), attempt)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected() == 1)
    }

    async fn list_attempts(
        &self,
        learner_id: &str,
        tenant_id: Uuid,
        content_object_id: Uuid,
    ) -> RepoResult<Vec<Attempt>> {
        let rows = sqlx::query_as::<_, AttemptRow>(&format!(
            "SELECT {ATTEMPT_COLUMNS} FROM attempts \
             WHERE learner_id = $1 AND tenant_id = $2 AND content_object_id = $3 \
             ORDER BY attempt_number ASC"
        ))
        .bind(learner_id)
        .bind(tenant_id)
        .bind(content_object_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(AttemptRow::to_domain).collect()
    }

    async fn attempts_for_content_object(
        &self,
        tenant_id: Uuid,
        content_object_id: Uuid,
    ) -> RepoResult<Vec<Attempt>> {
        let rows = sqlx::query_as::<_, AttemptRow>(&format!(
            "SELECT {ATTEMPT_COLUMNS} FROM attempts \
             WHERE tenant_id = $1 AND content_object_id = $2 \
             ORDER BY learner_id, attempt_number"
        ))
        .bind(tenant_id)
        .bind(content_object_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(AttemptRow::to_domain).collect()
    }
}
