use crate::guard::FileGuard;
use crate::{write_atomic, StoreError};
use liftoff_schema::{EnvName, Lock, LockKey, LockRequest, LockToken, ProjectName, RecordKey, RecordKind};
use std::fs;
use std::path::{Path, PathBuf};

/// JSON file tree holding records and locks.
///
/// Layout below `root`:
///
/// ```text
/// {project}/{env}/.guard
/// {project}/{env}/environment.json
/// {project}/{env}/resources/{name}.json
/// {project}/{env}/services/{name}.json
/// {project}/{env}/locks/environment.lock
/// {project}/{env}/locks/{resources|services}/{name}.lock
/// {project}/{env}/tfstate/{resources|services}/{name}.tfstate
/// ```
///
/// Every mutation runs under the environment's `.guard` file lock, so a
/// token check and the write it authorizes cannot interleave with another
/// process. This type is synchronous; [`LocalBackend`](crate::LocalBackend)
/// and the reference server wrap it.
#[derive(Debug, Clone)]
pub struct FileStateTree {
    root: PathBuf,
}

impl FileStateTree {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[inline]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn env_dir(&self, project: &ProjectName, environment: &EnvName) -> PathBuf {
        self.root.join(project.as_str()).join(environment.as_str())
    }

    fn guard(&self, project: &ProjectName, environment: &EnvName) -> Result<FileGuard, StoreError> {
        FileGuard::acquire(&self.env_dir(project, environment).join(".guard"))
    }

    fn read_lock_file(&self, key: &LockKey) -> Result<Option<Lock>, StoreError> {
        let path = self.root.join(key.path());
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Fail with `LockMismatch` unless `token` belongs to the live lock on `key`.
    fn check_token(&self, key: &LockKey, token: &LockToken) -> Result<Lock, StoreError> {
        match self.read_lock_file(key)? {
            Some(lock) if lock.token == *token && lock.is_live() => Ok(lock),
            _ => Err(StoreError::LockMismatch {
                key: key.to_string(),
            }),
        }
    }

    pub fn acquire_lock(&self, key: &LockKey, request: &LockRequest) -> Result<Lock, StoreError> {
        let _guard = self.guard(&key.project, &key.environment)?;
        if let Some(existing) = self.read_lock_file(key)? {
            if existing.is_live() {
                return Err(StoreError::LockHeld(Box::new(existing)));
            }
            tracing::info!(
                key = %key,
                previous_holder = %existing.holder,
                "taking over expired lock"
            );
        }
        let lock = request.grant(key, chrono::Utc::now());
        write_atomic(&self.root.join(key.path()), &serde_json::to_vec_pretty(&lock)?)?;
        Ok(lock)
    }

    pub fn release_lock(&self, key: &LockKey, token: &LockToken) -> Result<(), StoreError> {
        let _guard = self.guard(&key.project, &key.environment)?;
        self.check_token(key, token)?;
        fs::remove_file(self.root.join(key.path()))?;
        Ok(())
    }

    pub fn force_release_lock(&self, key: &LockKey) -> Result<Option<Lock>, StoreError> {
        let _guard = self.guard(&key.project, &key.environment)?;
        let existing = self.read_lock_file(key)?;
        if existing.is_some() {
            fs::remove_file(self.root.join(key.path()))?;
        }
        Ok(existing)
    }

    pub fn read_lock(&self, key: &LockKey) -> Result<Option<Lock>, StoreError> {
        self.read_lock_file(key)
    }

    pub fn read(&self, key: &RecordKey) -> Result<Option<Vec<u8>>, StoreError> {
        match fs::read(self.root.join(key.path())) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn write(&self, key: &RecordKey, data: &[u8], token: &LockToken) -> Result<(), StoreError> {
        let _guard = self.guard(&key.project, &key.environment)?;
        self.check_token(&key.lock_key(), token)?;
        write_atomic(&self.root.join(key.path()), data)
    }

    /// Removing an absent record succeeds once the token checks out.
    pub fn remove(&self, key: &RecordKey, token: &LockToken) -> Result<(), StoreError> {
        let _guard = self.guard(&key.project, &key.environment)?;
        self.check_token(&key.lock_key(), token)?;
        match fs::remove_file(self.root.join(key.path())) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Provisioning engine state of one unit, next to its record.
    pub fn engine_state_path(&self, key: &RecordKey) -> PathBuf {
        let dir = self.env_dir(&key.project, &key.environment).join("tfstate");
        match &key.name {
            Some(name) => dir
                .join(key.kind.collection())
                .join(format!("{name}.tfstate")),
            None => dir.join("environment.tfstate"),
        }
    }

    pub fn read_engine_state(&self, key: &RecordKey) -> Result<Option<Vec<u8>>, StoreError> {
        match fs::read(self.engine_state_path(key)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Engine state writes are gated by the same lock as the record.
    pub fn write_engine_state(
        &self,
        key: &RecordKey,
        data: &[u8],
        token: &LockToken,
    ) -> Result<(), StoreError> {
        let _guard = self.guard(&key.project, &key.environment)?;
        self.check_token(&key.lock_key(), token)?;
        write_atomic(&self.engine_state_path(key), data)
    }

    pub fn remove_engine_state(&self, key: &RecordKey, token: &LockToken) -> Result<(), StoreError> {
        let _guard = self.guard(&key.project, &key.environment)?;
        self.check_token(&key.lock_key(), token)?;
        match fs::remove_file(self.engine_state_path(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Names of the records of one kind, sorted.
    pub fn list(
        &self,
        project: &ProjectName,
        environment: &EnvName,
        kind: RecordKind,
    ) -> Result<Vec<String>, StoreError> {
        if kind == RecordKind::Environment {
            return self.list_environments(project);
        }
        let dir = self.env_dir(project, environment).join(kind.collection());
        list_stems(&dir, "json")
    }

    /// Environments of a project that have an environment record, sorted.
    pub fn list_environments(&self, project: &ProjectName) -> Result<Vec<String>, StoreError> {
        let dir = self.root.join(project.as_str());
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            if entry.path().join("environment.json").is_file() {
                if let Some(name) = entry.file_name().to_str() {
                    names.push(name.to_owned());
                }
            }
        }
        names.sort();
        Ok(names)
    }
}

fn list_stems(dir: &Path, extension: &str) -> Result<Vec<String>, StoreError> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut names = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if !entry.file_type()?.is_file() || path.extension().and_then(|e| e.to_str()) != Some(extension) {
            continue;
        }
        match path.file_stem().and_then(|s| s.to_str()) {
            Some(stem) if !stem.starts_with('.') => names.push(stem.to_owned()),
            _ => {}
        }
    }
    names.sort();
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;
    use liftoff_schema::OperationType;

    fn setup() -> (tempfile::TempDir, FileStateTree, ProjectName, EnvName) {
        let dir = tempfile::tempdir().unwrap();
        let tree = FileStateTree::new(dir.path());
        (dir, tree, ProjectName::new("shop"), EnvName::new("dev"))
    }

    #[test]
    fn second_acquire_fails_with_holder() {
        let (_dir, tree, p, e) = setup();
        let key = LockKey::resource(&p, &e, "db");
        tree.acquire_lock(
            &key,
            &LockRequest::new(OperationType::CreateResource).with_holder("first"),
        )
        .unwrap();
        let err = tree
            .acquire_lock(
                &key,
                &LockRequest::new(OperationType::CreateResource).with_holder("second"),
            )
            .unwrap_err();
        assert_eq!(err.lock_holder().map(|l| l.holder.as_str()), Some("first"));
    }

    #[test]
    fn expired_lock_is_taken_over() {
        let (_dir, tree, p, e) = setup();
        let key = LockKey::environment(&p, &e);
        let stale = tree
            .acquire_lock(&key, &LockRequest::new(OperationType::CreateEnvironment))
            .unwrap();
        let mut expired = stale.clone();
        expired.expires_at = Some("2000-01-01T00:00:00+00:00".to_owned());
        write_atomic(
            &tree.root().join(key.path()),
            &serde_json::to_vec(&expired).unwrap(),
        )
        .unwrap();

        let fresh = tree
            .acquire_lock(&key, &LockRequest::new(OperationType::CreateEnvironment))
            .unwrap();
        assert_ne!(fresh.token, stale.token);
    }

    #[test]
    fn write_requires_covering_lock() {
        let (_dir, tree, p, e) = setup();
        let record = RecordKey::resource(&p, &e, "db");
        let env_lock = tree
            .acquire_lock(
                &LockKey::environment(&p, &e),
                &LockRequest::new(OperationType::CreateEnvironment),
            )
            .unwrap();
        // The environment lock does not cover resource records.
        let err = tree.write(&record, b"{}", &env_lock.token).unwrap_err();
        assert!(matches!(err, StoreError::LockMismatch { .. }));
    }

    #[test]
    fn list_skips_foreign_files() {
        let (dir, tree, p, e) = setup();
        let res_dir = dir.path().join("shop/dev/resources");
        fs::create_dir_all(&res_dir).unwrap();
        fs::write(res_dir.join("db.json"), "{}").unwrap();
        fs::write(res_dir.join("notes.txt"), "x").unwrap();
        fs::write(res_dir.join(".hidden.json"), "{}").unwrap();
        assert_eq!(tree.list(&p, &e, RecordKind::Resource).unwrap(), vec!["db"]);
        assert!(tree.list(&p, &e, RecordKind::Service).unwrap().is_empty());
    }

    #[test]
    fn list_environments_requires_record() {
        let (dir, tree, p, _e) = setup();
        fs::create_dir_all(dir.path().join("shop/dev")).unwrap();
        fs::write(dir.path().join("shop/dev/environment.json"), "{}").unwrap();
        fs::create_dir_all(dir.path().join("shop/half-created/locks")).unwrap();
        assert_eq!(tree.list_environments(&p).unwrap(), vec!["dev"]);
        assert!(tree
            .list_environments(&ProjectName::new("other"))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn engine_state_is_token_gated() {
        let (_dir, tree, p, e) = setup();
        let record = RecordKey::resource(&p, &e, "db");
        assert!(tree.read_engine_state(&record).unwrap().is_none());
        let lock = tree
            .acquire_lock(
                &record.lock_key(),
                &LockRequest::new(OperationType::CreateResource),
            )
            .unwrap();
        tree.write_engine_state(&record, b"{\"version\":4}", &lock.token)
            .unwrap();
        assert_eq!(
            tree.read_engine_state(&record).unwrap().as_deref(),
            Some(&b"{\"version\":4}"[..])
        );
        assert!(tree
            .engine_state_path(&record)
            .ends_with("shop/dev/tfstate/resources/db.tfstate"));

        tree.release_lock(&record.lock_key(), &lock.token).unwrap();
        let err = tree
            .write_engine_state(&record, b"{}", &lock.token)
            .unwrap_err();
        assert!(matches!(err, StoreError::LockMismatch { .. }));
    }
}
