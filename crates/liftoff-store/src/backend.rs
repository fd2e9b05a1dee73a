use crate::tree::FileStateTree;
use crate::StoreError;
use async_trait::async_trait;
use liftoff_schema::{
    EnvName, Lock, LockKey, LockRequest, LockToken, ProjectName, RecordKey, RecordKind,
};
use std::path::PathBuf;
use std::sync::Arc;

/// Storage medium for records and locks.
///
/// Lock acquisition must be a conditional create: at most one live lock per
/// key. `write` and `remove` must reject a token that is not the live lock
/// covering the record (`RecordKey::lock_key`).
#[async_trait]
pub trait StateBackend: Send + Sync {
    fn name(&self) -> &str;

    async fn acquire_lock(&self, key: &LockKey, request: &LockRequest) -> Result<Lock, StoreError>;

    async fn release_lock(&self, key: &LockKey, token: &LockToken) -> Result<(), StoreError>;

    /// Remove whatever lock is on `key`, returning it.
    async fn force_release_lock(&self, key: &LockKey) -> Result<Option<Lock>, StoreError>;

    async fn read_lock(&self, key: &LockKey) -> Result<Option<Lock>, StoreError>;

    async fn read(&self, key: &RecordKey) -> Result<Option<Vec<u8>>, StoreError>;

    async fn write(&self, key: &RecordKey, data: Vec<u8>, token: &LockToken)
        -> Result<(), StoreError>;

    async fn remove(&self, key: &RecordKey, token: &LockToken) -> Result<(), StoreError>;

    async fn list(
        &self,
        project: &ProjectName,
        environment: &EnvName,
        kind: RecordKind,
    ) -> Result<Vec<String>, StoreError>;

    async fn list_environments(&self, project: &ProjectName) -> Result<Vec<String>, StoreError>;
}

/// [`FileStateTree`] on the local disk, driven from blocking tasks.
pub struct LocalBackend {
    tree: Arc<FileStateTree>,
}

impl LocalBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            tree: Arc::new(FileStateTree::new(root)),
        }
    }

    pub fn tree(&self) -> &FileStateTree {
        &self.tree
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&FileStateTree) -> Result<T, StoreError> + Send + 'static,
    {
        let tree = Arc::clone(&self.tree);
        tokio::task::spawn_blocking(move || f(&tree))
            .await
            .map_err(|e| StoreError::Backend(format!("state tree task failed: {e}")))?
    }
}

#[async_trait]
impl StateBackend for LocalBackend {
    fn name(&self) -> &str {
        "local"
    }

    async fn acquire_lock(&self, key: &LockKey, request: &LockRequest) -> Result<Lock, StoreError> {
        let (key, request) = (key.clone(), request.clone());
        self.blocking(move |tree| tree.acquire_lock(&key, &request))
            .await
    }

    async fn release_lock(&self, key: &LockKey, token: &LockToken) -> Result<(), StoreError> {
        let (key, token) = (key.clone(), token.clone());
        self.blocking(move |tree| tree.release_lock(&key, &token))
            .await
    }

    async fn force_release_lock(&self, key: &LockKey) -> Result<Option<Lock>, StoreError> {
        let key = key.clone();
        self.blocking(move |tree| tree.force_release_lock(&key)).await
    }

    async fn read_lock(&self, key: &LockKey) -> Result<Option<Lock>, StoreError> {
        let key = key.clone();
        self.blocking(move |tree| tree.read_lock(&key)).await
    }

    async fn read(&self, key: &RecordKey) -> Result<Option<Vec<u8>>, StoreError> {
        let key = key.clone();
        self.blocking(move |tree| tree.read(&key)).await
    }

    async fn write(
        &self,
        key: &RecordKey,
        data: Vec<u8>,
        token: &LockToken,
    ) -> Result<(), StoreError> {
        let (key, token) = (key.clone(), token.clone());
        self.blocking(move |tree| tree.write(&key, &data, &token))
            .await
    }

    async fn remove(&self, key: &RecordKey, token: &LockToken) -> Result<(), StoreError> {
        let (key, token) = (key.clone(), token.clone());
        self.blocking(move |tree| tree.remove(&key, &token)).await
    }

    async fn list(
        &self,
        project: &ProjectName,
        environment: &EnvName,
        kind: RecordKind,
    ) -> Result<Vec<String>, StoreError> {
        let (project, environment) = (project.clone(), environment.clone());
        self.blocking(move |tree| tree.list(&project, &environment, kind))
            .await
    }

    async fn list_environments(&self, project: &ProjectName) -> Result<Vec<String>, StoreError> {
        let project = project.clone();
        self.blocking(move |tree| tree.list_environments(&project))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conformance;

    #[tokio::test]
    async fn local_backend_conformance() {
        let dir = tempfile::tempdir().unwrap();
        conformance::run_all(Arc::new(LocalBackend::new(dir.path()))).await;
    }

    #[tokio::test]
    async fn local_backend_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let p = ProjectName::new("shop");
        let e = EnvName::new("dev");
        let key = LockKey::service(&p, &e, "api");
        let lock = {
            let backend = LocalBackend::new(dir.path());
            backend
                .acquire_lock(
                    &key,
                    &LockRequest::new(liftoff_schema::OperationType::DeployService),
                )
                .await
                .unwrap()
        };
        let reopened = LocalBackend::new(dir.path());
        assert_eq!(reopened.read_lock(&key).await.unwrap(), Some(lock));
    }
}
