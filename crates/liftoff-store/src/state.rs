use crate::backend::StateBackend;
use crate::StoreError;
use liftoff_schema::{
    EnvName, EnvironmentRecord, LockToken, ProjectName, Record, RecordKey, ResourceRecord,
    ServiceRecord,
};
use std::sync::Arc;
use tracing::{debug, warn};

/// Typed record access over a [`StateBackend`].
///
/// Every mutation presents the token of the lock covering the record; the
/// backend rejects anything else with `LockMismatch`.
#[derive(Clone)]
pub struct StateStore {
    backend: Arc<dyn StateBackend>,
}

impl StateStore {
    pub fn new(backend: Arc<dyn StateBackend>) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &Arc<dyn StateBackend> {
        &self.backend
    }

    fn check_kind<R: Record>(key: &RecordKey) -> Result<(), StoreError> {
        if key.kind == R::KIND {
            Ok(())
        } else {
            Err(StoreError::KindMismatch {
                key: key.to_string(),
                expected: R::KIND,
            })
        }
    }

    pub async fn get<R: Record>(&self, key: &RecordKey) -> Result<Option<R>, StoreError> {
        Self::check_kind::<R>(key)?;
        match self.backend.read(key).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub async fn load<R: Record>(&self, key: &RecordKey) -> Result<R, StoreError> {
        self.get(key)
            .await?
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    /// Persist `record` with a fresh `updated_at`; returns what was written.
    pub async fn save<R: Record>(
        &self,
        key: &RecordKey,
        record: &R,
        token: &LockToken,
    ) -> Result<R, StoreError> {
        Self::check_kind::<R>(key)?;
        let mut stored = record.clone();
        stored.touch(&chrono::Utc::now().to_rfc3339());
        let data = serde_json::to_vec_pretty(&stored)?;
        self.backend.write(key, data, token).await?;
        debug!(key = %key, "record saved");
        Ok(stored)
    }

    pub async fn delete(&self, key: &RecordKey, token: &LockToken) -> Result<(), StoreError> {
        self.backend.remove(key, token).await?;
        debug!(key = %key, "record deleted");
        Ok(())
    }

    pub async fn environment(
        &self,
        project: &ProjectName,
        environment: &EnvName,
    ) -> Result<EnvironmentRecord, StoreError> {
        self.load(&RecordKey::environment(project, environment))
            .await
    }

    pub async fn list_resources(
        &self,
        project: &ProjectName,
        environment: &EnvName,
    ) -> Result<Vec<ResourceRecord>, StoreError> {
        self.list_kind(project, environment, |name| {
            RecordKey::resource(project, environment, name)
        })
        .await
    }

    pub async fn list_services(
        &self,
        project: &ProjectName,
        environment: &EnvName,
    ) -> Result<Vec<ServiceRecord>, StoreError> {
        self.list_kind(project, environment, |name| {
            RecordKey::service(project, environment, name)
        })
        .await
    }

    pub async fn list_environments(&self, project: &ProjectName) -> Result<Vec<EnvName>, StoreError> {
        Ok(self
            .backend
            .list_environments(project)
            .await?
            .into_iter()
            .map(EnvName::from)
            .collect())
    }

    async fn list_kind<R: Record>(
        &self,
        project: &ProjectName,
        environment: &EnvName,
        key_for: impl Fn(&str) -> RecordKey,
    ) -> Result<Vec<R>, StoreError> {
        let names = self.backend.list(project, environment, R::KIND).await?;
        let mut records = Vec::with_capacity(names.len());
        for name in names {
            let key = key_for(&name);
            // A record removed between list and read is simply gone.
            match self.get::<R>(&key).await {
                Ok(Some(record)) => records.push(record),
                Ok(None) => {}
                Err(StoreError::Serialization(e)) => {
                    warn!(key = %key, error = %e, "skipping unreadable record");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BucketBackend, LocalBackend, LockManager, MemoryBucket};
    use liftoff_schema::{
        EnvironmentStatus, EnvironmentType, Inputs, OperationType, Provider, ProviderConfig,
        ResourceStatus,
    };

    fn resource(name: &str) -> ResourceRecord {
        ResourceRecord {
            name: name.to_owned(),
            provider: Provider::Gcp,
            product: "gcp_bucket".to_owned(),
            status: ResourceStatus::Ready,
            declared_inputs: Inputs::new(),
            attempted_inputs: None,
            provider_id: Some(format!("id-{name}")),
            depends_on: vec![],
            created_at: "2025-01-01T00:00:00Z".to_owned(),
            updated_at: "2025-01-01T00:00:00Z".to_owned(),
        }
    }

    fn backends() -> (tempfile::TempDir, Vec<Arc<dyn StateBackend>>) {
        let dir = tempfile::tempdir().unwrap();
        let backends: Vec<Arc<dyn StateBackend>> = vec![
            Arc::new(LocalBackend::new(dir.path())),
            Arc::new(BucketBackend::new(MemoryBucket::new())),
        ];
        (dir, backends)
    }

    #[tokio::test]
    async fn save_load_list_on_every_backend() {
        let (_dir, backends) = backends();
        let p = ProjectName::new("shop");
        let e = EnvName::new("dev");
        for backend in backends {
            let store = StateStore::new(Arc::clone(&backend));
            let locks = LockManager::new(backend);
            let key = RecordKey::resource(&p, &e, "db");

            assert!(matches!(
                store.load::<ResourceRecord>(&key).await,
                Err(StoreError::NotFound(_))
            ));

            let lock = locks
                .acquire(&key.lock_key(), OperationType::CreateResource)
                .await
                .unwrap();
            let saved = store.save(&key, &resource("db"), &lock.token).await.unwrap();
            assert_ne!(saved.updated_at, "2025-01-01T00:00:00Z");
            assert_eq!(saved.created_at, "2025-01-01T00:00:00Z");
            locks.release(&lock).await.unwrap();

            let loaded: ResourceRecord = store.load(&key).await.unwrap();
            assert_eq!(loaded, saved);
            let listed = store.list_resources(&p, &e).await.unwrap();
            assert_eq!(listed, vec![saved]);
            assert!(store.list_services(&p, &e).await.unwrap().is_empty());
        }
    }

    #[tokio::test]
    async fn save_with_released_token_is_rejected() {
        let (_dir, backends) = backends();
        let p = ProjectName::new("shop");
        let e = EnvName::new("dev");
        for backend in backends {
            let store = StateStore::new(Arc::clone(&backend));
            let locks = LockManager::new(backend);
            let key = RecordKey::resource(&p, &e, "db");
            let lock = locks
                .acquire(&key.lock_key(), OperationType::CreateResource)
                .await
                .unwrap();
            locks.release(&lock).await.unwrap();
            let err = store
                .save(&key, &resource("db"), &lock.token)
                .await
                .unwrap_err();
            assert!(matches!(err, StoreError::LockMismatch { .. }));
            assert!(store.get::<ResourceRecord>(&key).await.unwrap().is_none());
        }
    }

    #[tokio::test]
    async fn kind_mismatch_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(Arc::new(LocalBackend::new(dir.path())));
        let key = RecordKey::service(&ProjectName::new("shop"), &EnvName::new("dev"), "api");
        let err = store.get::<ResourceRecord>(&key).await.unwrap_err();
        assert!(matches!(err, StoreError::KindMismatch { .. }));
    }

    #[tokio::test]
    async fn environment_round_trip_and_listing() {
        let dir = tempfile::tempdir().unwrap();
        let backend: Arc<dyn StateBackend> = Arc::new(LocalBackend::new(dir.path()));
        let store = StateStore::new(Arc::clone(&backend));
        let locks = LockManager::new(backend);
        let p = ProjectName::new("shop");
        let e = EnvName::new("prod");
        let key = RecordKey::environment(&p, &e);
        let record = EnvironmentRecord {
            env_type: EnvironmentType::Production,
            provider_config: ProviderConfig {
                provider: Provider::Aws,
                account_id: "123456789012".to_owned(),
                region: "eu-west-1".to_owned(),
                identity: "arn:aws:iam::123456789012:role/liftoff".to_owned(),
                artifact_bucket: "shop-prod-artifacts".to_owned(),
            },
            status: EnvironmentStatus::Ready,
            created_at: String::new(),
            updated_at: String::new(),
        };
        let lock = locks
            .acquire(&key.lock_key(), OperationType::CreateEnvironment)
            .await
            .unwrap();
        store.save(&key, &record, &lock.token).await.unwrap();
        locks.release(&lock).await.unwrap();

        assert_eq!(store.environment(&p, &e).await.unwrap().env_type, EnvironmentType::Production);
        assert_eq!(store.list_environments(&p).await.unwrap(), vec![EnvName::new("prod")]);
    }
}
