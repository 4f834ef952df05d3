use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;
use uuid::Uuid;

use super::{RepoError, RepoResult, Repository};
use crate::models::{Attempt, AttemptKey, ContentObject, Package, PackageStatus};

type AttemptIndex = (String, Uuid, Uuid, i32);

#[derive(Default)]
struct Tables {
    packages: HashMap<Uuid, Package>,
    content_objects: HashMap<Uuid, ContentObject>,
    attempts: BTreeMap<AttemptIndex, Attempt>,
}

/// Process-local repository. Used in tests and when no `DATABASE_URL` is set.
#[derive(Default)]
pub struct MemoryRepository {
    tables: RwLock<Tables>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RepoResult<std::sync::RwLockReadGuard<'_, Tables>> {
        self.tables
            .read()
            .map_err(|_| RepoError::Unavailable("memory repository lock poisoned".into()))
    }

    fn write(&self) -> RepoResult<std::sync::RwLockWriteGuard<'_, Tables>> {
        self.tables
            .write()
            .map_err(|_| RepoError::Unavailable("memory repository lock poisoned".into()))
    }
}

fn index(key: &AttemptKey) -> AttemptIndex {
    (
        key.learner_id.clone(),
        key.tenant_id,
        key.content_object_id,
        key.attempt_number,
    )
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn create_package(
        &self,
        package: &Package,
        objects: &[ContentObject],
    ) -> RepoResult<()> {
        let mut t = self.write()?;
        if t.packages.contains_key(&package.id)
            || t.packages.values().any(|p| p.storage_root == package.storage_root)
        {
            return Err(RepoError::Corrupt(format!(
                "package {} or its storage root already exists",
                package.id
            )));
        }
        t.packages.insert(package.id, package.clone());
        for co in objects {
            t.content_objects.insert(co.id, co.clone());
        }
        Ok(())
    }

    async fn get_package(&self, id: Uuid) -> RepoResult<Option<Package>> {
        Ok(self.read()?.packages.get(&id).cloned())
    }

    async fn set_package_status(&self, id: Uuid, status: PackageStatus) -> RepoResult<bool> {
        let mut t = self.write()?;
        match t.packages.get_mut(&id) {
            Some(p) => {
                p.status = status;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn content_objects(&self, package_id: Uuid) -> RepoResult<Vec<ContentObject>> {
        let t = self.read()?;
        let mut out: Vec<_> = t
            .content_objects
            .values()
            .filter(|c| c.package_id == package_id)
            .cloned()
            .collect();
        out.sort_by_key(|c| c.ordinal);
        Ok(out)
    }

    async fn get_content_object(&self, id: Uuid) -> RepoResult<Option<ContentObject>> {
        Ok(self.read()?.content_objects.get(&id).cloned())
    }

    async fn get_attempt(&self, key: &AttemptKey) -> RepoResult<Option<Attempt>> {
        Ok(self.read()?.attempts.get(&index(key)).cloned())
    }

    async fn save_attempt(&self, attempt: &Attempt) -> RepoResult<()> {
        let mut t = self.write()?;
        t.attempts.insert(index(&attempt.key()), attempt.clone());
        Ok(())
    }

    async fn insert_attempt(&self, attempt: &Attempt) -> RepoResult<bool> {
        let mut t = self.write()?;
        let idx = index(&attempt.key());
        if t.attempts.contains_key(&idx) {
            return Ok(false);
        }
        t.attempts.insert(idx, attempt.clone());
        Ok(true)
    }

    async fn list_attempts(
        &self,
        learner_id: &str,
        tenant_id: Uuid,
        content_object_id: Uuid,
    ) -> RepoResult<Vec<Attempt>> {
        let t = self.read()?;
        let lo = (learner_id.to_string(), tenant_id, content_object_id, i32::MIN);
        let hi = (learner_id.to_string(), tenant_id, content_object_id, i32::MAX);
        Ok(t.attempts.range(lo..=hi).map(|(_, a)| a.clone()).collect())
    }

    async fn attempts_for_content_object(
        &self,
        tenant_id: Uuid,
        content_object_id: Uuid,
    ) -> RepoResult<Vec<Attempt>> {
        let t = self.read()?;
        Ok(t.attempts
            .values()
            .filter(|a| a.tenant_id == tenant_id && a.content_object_id == content_object_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(learner: &str, co: Uuid, n: i32) -> AttemptKey {
        AttemptKey {
            learner_id: learner.into(),
            tenant_id: Uuid::nil(),
            content_object_id: co,
            attempt_number: n,
        }
    }

    #[tokio::test]
    async fn lists_attempts_in_number_order() {
        let repo = MemoryRepository::new();
        let co = Uuid::new_v4();
        for n in [3, 1, 2] {
            repo.save_attempt(&Attempt::new(key("alice", co, n))).await.unwrap();
        }
        repo.save_attempt(&Attempt::new(key("bob", co, 1))).await.unwrap();

        let numbers: Vec<_> = repo
            .list_attempts("alice", Uuid::nil(), co)
            .await
            .unwrap()
            .iter()
            .map(|a| a.attempt_number)
            .collect();
        assert_eq!(numbers, [1, 2, 3]);
        assert_eq!(
            repo.attempts_for_content_object(Uuid::nil(), co)
                .await
                .unwrap()
                .len(),
            4
        );
    }

    #[tokio::test]
    async fn insert_attempt_refuses_taken_key() {
        let repo = MemoryRepository::new();
        let a = Attempt::new(key("alice", Uuid::new_v4(), 1));
        assert!(repo.insert_attempt(&a).await.unwrap());
        assert!(!repo.insert_attempt(&a).await.unwrap());
    }
}
