//! Versioned object storage and the state backend built on it.
//!
//! Object stores (GCS, S3) give no multi-object transactions, only
//! per-object generation preconditions. Locks therefore use a conditional
//! create (`DoesNotExist`) or a conditional replace of an expired lease
//! (`GenerationMatch`). A record write checks the lock object, writes the
//! record against the generation it read, then checks the lock again. If the
//! lock moved in between, the record is put back (unless the new holder has
//! already replaced it) and the write reports `LockMismatch`.

use crate::backend::StateBackend;
use crate::guard::FileGuard;
use crate::{write_atomic, StoreError};
use async_trait::async_trait;
use liftoff_schema::{
    EnvName, Lock, LockKey, LockRequest, LockToken, ProjectName, RecordKey, RecordKind,
};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub data: Vec<u8>,
    pub generation: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteCondition {
    Always,
    DoesNotExist,
    GenerationMatch(u64),
}

impl WriteCondition {
    fn check(self, name: &str, current: Option<u64>) -> Result<(), StoreError> {
        match (self, current) {
            (WriteCondition::Always, _) | (WriteCondition::DoesNotExist, None) => Ok(()),
            (WriteCondition::GenerationMatch(want), Some(have)) if want == have => Ok(()),
            _ => Err(StoreError::PreconditionFailed(name.to_owned())),
        }
    }
}

#[async_trait]
pub trait ObjectStorage: Send + Sync {
    async fn get(&self, name: &str) -> Result<Option<StoredObject>, StoreError>;

    /// Store `data` under `name` if `condition` holds; returns the new generation.
    async fn put(
        &self,
        name: &str,
        data: Vec<u8>,
        condition: WriteCondition,
    ) -> Result<u64, StoreError>;

    /// Deleting an absent object with [`WriteCondition::Always`] succeeds.
    async fn delete(&self, name: &str, condition: WriteCondition) -> Result<(), StoreError>;

    /// Full names of every object starting with `prefix`, sorted.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError>;
}

#[async_trait]
impl<T: ObjectStorage + ?Sized> ObjectStorage for Arc<T> {
    async fn get(&self, name: &str) -> Result<Option<StoredObject>, StoreError> {
        (**self).get(name).await
    }

    async fn put(
        &self,
        name: &str,
        data: Vec<u8>,
        condition: WriteCondition,
    ) -> Result<u64, StoreError> {
        (**self).put(name, data, condition).await
    }

    async fn delete(&self, name: &str, condition: WriteCondition) -> Result<(), StoreError> {
        (**self).delete(name, condition).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        (**self).list(prefix).await
    }
}

/// Opens the artifact bucket of an environment by name.
pub trait BucketProvider: Send + Sync {
    fn bucket(&self, name: &str) -> Arc<dyn ObjectStorage>;
}

#[derive(Default)]
struct MemoryState {
    objects: BTreeMap<String, StoredObject>,
    next_generation: u64,
}

/// In-process object storage.
#[derive(Default)]
pub struct MemoryBucket {
    state: Mutex<MemoryState>,
}

impl MemoryBucket {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ObjectStorage for MemoryBucket {
    async fn get(&self, name: &str) -> Result<Option<StoredObject>, StoreError> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(state.objects.get(name).cloned())
    }

    async fn put(
        &self,
        name: &str,
        data: Vec<u8>,
        condition: WriteCondition,
    ) -> Result<u64, StoreError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        condition.check(name, state.objects.get(name).map(|o| o.generation))?;
        state.next_generation += 1;
        let generation = state.next_generation;
        state
            .objects
            .insert(name.to_owned(), StoredObject { data, generation });
        Ok(generation)
    }

    async fn delete(&self, name: &str, condition: WriteCondition) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        condition.check(name, state.objects.get(name).map(|o| o.generation))?;
        state.objects.remove(name);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(state
            .objects
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}

/// Object storage materialized as a directory.
///
/// Object bodies live under `objects/`, their generations under
/// `generations/`; a bucket-wide `.guard` serializes conditional writes.
#[derive(Debug, Clone)]
pub struct DirectoryBucket {
    root: Arc<PathBuf>,
}

impl DirectoryBucket {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Arc::new(root.into()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Path) -> Result<T, StoreError> + Send + 'static,
    {
        let root = Arc::clone(&self.root);
        tokio::task::spawn_blocking(move || f(&root))
            .await
            .map_err(|e| StoreError::Backend(format!("bucket task failed: {e}")))?
    }
}

fn object_name_ok(name: &str) -> Result<(), StoreError> {
    if name.is_empty()
        || name.starts_with('/')
        || name.split('/').any(|seg| seg.is_empty() || seg == "." || seg == "..")
    {
        return Err(StoreError::Backend(format!("invalid object name '{name}'")));
    }
    Ok(())
}

fn read_generation(root: &Path, name: &str) -> Result<Option<u64>, StoreError> {
    match fs::read_to_string(root.join("generations").join(name)) {
        Ok(s) => s
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| StoreError::Backend(format!("corrupt generation for '{name}'"))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn next_generation(root: &Path) -> Result<u64, StoreError> {
    let counter = root.join(".generation");
    let current = match fs::read_to_string(&counter) {
        Ok(s) => s.trim().parse().unwrap_or(0),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
        Err(e) => return Err(e.into()),
    };
    let next = current + 1;
    write_atomic(&counter, next.to_string().as_bytes())?;
    Ok(next)
}

fn walk(dir: &Path, rel: &str, out: &mut Vec<String>) -> Result<(), StoreError> {
    if !dir.exists() {
        return Ok(());
    }
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
            continue;
        };
        if name.starts_with(".tmp") {
            continue;
        }
        let child = if rel.is_empty() {
            name
        } else {
            format!("{rel}/{name}")
        };
        if entry.file_type()?.is_dir() {
            walk(&entry.path(), &child, out)?;
        } else {
            out.push(child);
        }
    }
    Ok(())
}

#[async_trait]
impl ObjectStorage for DirectoryBucket {
    async fn get(&self, name: &str) -> Result<Option<StoredObject>, StoreError> {
        object_name_ok(name)?;
        let name = name.to_owned();
        self.blocking(move |root| {
            let _guard = FileGuard::acquire(&root.join(".guard"))?;
            let Some(generation) = read_generation(root, &name)? else {
                return Ok(None);
            };
            let data = fs::read(root.join("objects").join(&name))?;
            Ok(Some(StoredObject { data, generation }))
        })
        .await
    }

    async fn put(
        &self,
        name: &str,
        data: Vec<u8>,
        condition: WriteCondition,
    ) -> Result<u64, StoreError> {
        object_name_ok(name)?;
        let name = name.to_owned();
        self.blocking(move |root| {
            let _guard = FileGuard::acquire(&root.join(".guard"))?;
            condition.check(&name, read_generation(root, &name)?)?;
            let generation = next_generation(root)?;
            write_atomic(&root.join("objects").join(&name), &data)?;
            write_atomic(
                &root.join("generations").join(&name),
                generation.to_string().as_bytes(),
            )?;
            Ok(generation)
        })
        .await
    }

    async fn delete(&self, name: &str, condition: WriteCondition) -> Result<(), StoreError> {
        object_name_ok(name)?;
        let name = name.to_owned();
        self.blocking(move |root| {
            let _guard = FileGuard::acquire(&root.join(".guard"))?;
            condition.check(&name, read_generation(root, &name)?)?;
            for dir in ["generations", "objects"] {
                match fs::remove_file(root.join(dir).join(&name)) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }
            Ok(())
        })
        .await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let prefix = prefix.to_owned();
        self.blocking(move |root| {
            let mut names = Vec::new();
            walk(&root.join("generations"), "", &mut names)?;
            names.retain(|n| n.starts_with(&prefix));
            names.sort();
            Ok(names)
        })
        .await
    }
}

/// Each named bucket is a [`DirectoryBucket`] below one root.
#[derive(Debug, Clone)]
pub struct DirectoryBuckets {
    root: PathBuf,
}

impl DirectoryBuckets {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl BucketProvider for DirectoryBuckets {
    fn bucket(&self, name: &str) -> Arc<dyn ObjectStorage> {
        Arc::new(DirectoryBucket::new(self.root.join(name)))
    }
}

/// Named [`MemoryBucket`]s, created on first use.
#[derive(Default)]
pub struct MemoryBuckets {
    buckets: Mutex<HashMap<String, Arc<MemoryBucket>>>,
}

impl MemoryBuckets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Arc<MemoryBucket> {
        let mut buckets = self.buckets.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(buckets.entry(name.to_owned()).or_default())
    }
}

impl BucketProvider for MemoryBuckets {
    fn bucket(&self, name: &str) -> Arc<dyn ObjectStorage> {
        self.get(name)
    }
}

const LOCK_ACQUIRE_ATTEMPTS: usize = 3;

/// [`StateBackend`] over versioned object storage.
pub struct BucketBackend<S> {
    storage: S,
    prefix: String,
}

impl<S: ObjectStorage> BucketBackend<S> {
    pub fn new(storage: S) -> Self {
        Self {
            storage,
            prefix: String::new(),
        }
    }

    /// Keep every object below `prefix/`.
    #[must_use]
    pub fn with_prefix(mut self, prefix: &str) -> Self {
        let trimmed = prefix.trim_matches('/');
        self.prefix = if trimmed.is_empty() {
            String::new()
        } else {
            format!("{trimmed}/")
        };
        self
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    fn object(&self, path: &str) -> String {
        format!("{}{path}", self.prefix)
    }

    async fn current_lock(&self, key: &LockKey) -> Result<Option<(Lock, u64)>, StoreError> {
        match self.storage.get(&self.object(&key.path())).await? {
            Some(obj) => Ok(Some((serde_json::from_slice(&obj.data)?, obj.generation))),
            None => Ok(None),
        }
    }

    async fn live_lock_with_token(
        &self,
        key: &LockKey,
        token: &LockToken,
    ) -> Result<u64, StoreError> {
        match self.current_lock(key).await? {
            Some((lock, generation)) if lock.token == *token && lock.is_live() => Ok(generation),
            _ => Err(StoreError::LockMismatch {
                key: key.to_string(),
            }),
        }
    }

    /// Re-read the lock after a record change. If it is no longer the
    /// generation the change was made under, undo the change where the record
    /// is still ours and report the mismatch.
    async fn confirm_lock(
        &self,
        key: &LockKey,
        lock_generation: u64,
        name: &str,
        before: Option<StoredObject>,
        written: Option<u64>,
    ) -> Result<(), StoreError> {
        match self.current_lock(key).await? {
            Some((lock, generation)) if generation == lock_generation && lock.is_live() => {
                return Ok(());
            }
            _ => {}
        }
        let undo = match (before, written) {
            (Some(before), Some(generation)) => self
                .storage
                .put(name, before.data, WriteCondition::GenerationMatch(generation))
                .await
                .map(|_| ()),
            (None, Some(generation)) => {
                self.storage
                    .delete(name, WriteCondition::GenerationMatch(generation))
                    .await
            }
            (Some(before), None) => self
                .storage
                .put(name, before.data, WriteCondition::DoesNotExist)
                .await
                .map(|_| ()),
            (None, None) => Ok(()),
        };
        match undo {
            Ok(()) | Err(StoreError::PreconditionFailed(_)) => {}
            Err(e) => {
                tracing::warn!(key = %key, object = name, error = %e, "failed to undo record change");
            }
        }
        tracing::warn!(key = %key, object = name, "lock changed during record write");
        Err(StoreError::LockMismatch {
            key: key.to_string(),
        })
    }
}

/// Condition under which a record is replaced: exactly the object last read.
fn expect_unchanged(before: Option<&StoredObject>) -> WriteCondition {
    before.map_or(WriteCondition::DoesNotExist, |o| {
        WriteCondition::GenerationMatch(o.generation)
    })
}

/// Another writer touched the record between our read and write, which only a
/// holder of the lock can do.
fn mismatch_on_race(e: StoreError, key: &LockKey) -> StoreError {
    match e {
        StoreError::PreconditionFailed(_) => StoreError::LockMismatch {
            key: key.to_string(),
        },
        other => other,
    }
}

#[async_trait]
impl<S: ObjectStorage> StateBackend for BucketBackend<S> {
    fn name(&self) -> &str {
        "bucket"
    }

    async fn acquire_lock(&self, key: &LockKey, request: &LockRequest) -> Result<Lock, StoreError> {
        let name = self.object(&key.path());
        for _ in 0..LOCK_ACQUIRE_ATTEMPTS {
            let condition = match self.current_lock(key).await? {
                Some((existing, _)) if existing.is_live() => {
                    return Err(StoreError::LockHeld(Box::new(existing)));
                }
                Some((existing, generation)) => {
                    tracing::info!(
                        key = %key,
                        previous_holder = %existing.holder,
                        "taking over expired lock"
                    );
                    WriteCondition::GenerationMatch(generation)
                }
                None => WriteCondition::DoesNotExist,
            };
            let lock = request.grant(key, chrono::Utc::now());
            match self
                .storage
                .put(&name, serde_json::to_vec_pretty(&lock)?, condition)
                .await
            {
                Ok(_) => return Ok(lock),
                Err(StoreError::PreconditionFailed(_)) => {
                    tracing::debug!(key = %key, "lost lock race, re-reading");
                }
                Err(e) => return Err(e),
            }
        }
        Err(StoreError::Backend(format!(
            "lock {key} kept changing during acquisition"
        )))
    }

    async fn release_lock(&self, key: &LockKey, token: &LockToken) -> Result<(), StoreError> {
        let generation = self.live_lock_with_token(key, token).await?;
        match self
            .storage
            .delete(
                &self.object(&key.path()),
                WriteCondition::GenerationMatch(generation),
            )
            .await
        {
            Err(StoreError::PreconditionFailed(_)) => Err(StoreError::LockMismatch {
                key: key.to_string(),
            }),
            other => other,
        }
    }

    async fn force_release_lock(&self, key: &LockKey) -> Result<Option<Lock>, StoreError> {
        let existing = self.current_lock(key).await?;
        if existing.is_some() {
            self.storage
                .delete(&self.object(&key.path()), WriteCondition::Always)
                .await?;
        }
        Ok(existing.map(|(lock, _)| lock))
    }

    async fn read_lock(&self, key: &LockKey) -> Result<Option<Lock>, StoreError> {
        Ok(self.current_lock(key).await?.map(|(lock, _)| lock))
    }

    async fn read(&self, key: &RecordKey) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self
            .storage
            .get(&self.object(&key.path()))
            .await?
            .map(|obj| obj.data))
    }

    async fn write(
        &self,
        key: &RecordKey,
        data: Vec<u8>,
        token: &LockToken,
    ) -> Result<(), StoreError> {
        let lock_key = key.lock_key();
        let lock_generation = self.live_lock_with_token(&lock_key, token).await?;
        let name = self.object(&key.path());
        let before = self.storage.get(&name).await?;
        let written = self
            .storage
            .put(&name, data, expect_unchanged(before.as_ref()))
            .await
            .map_err(|e| mismatch_on_race(e, &lock_key))?;
        self.confirm_lock(&lock_key, lock_generation, &name, before, Some(written))
            .await
    }

    async fn remove(&self, key: &RecordKey, token: &LockToken) -> Result<(), StoreError> {
        let lock_key = key.lock_key();
        let lock_generation = self.live_lock_with_token(&lock_key, token).await?;
        let name = self.object(&key.path());
        let Some(before) = self.storage.get(&name).await? else {
            return Ok(());
        };
        self.storage
            .delete(&name, WriteCondition::GenerationMatch(before.generation))
            .await
            .map_err(|e| mismatch_on_race(e, &lock_key))?;
        self.confirm_lock(&lock_key, lock_generation, &name, Some(before), None)
            .await
    }

    async fn list(
        &self,
        project: &ProjectName,
        environment: &EnvName,
        kind: RecordKind,
    ) -> Result<Vec<String>, StoreError> {
        if kind == RecordKind::Environment {
            return self.list_environments(project).await;
        }
        let dir = self.object(&format!("{project}/{environment}/{}/", kind.collection()));
        let mut names: Vec<String> = self
            .storage
            .list(&dir)
            .await?
            .iter()
            .filter_map(|full| full.strip_prefix(&dir))
            .filter(|rest| !rest.contains('/'))
            .filter_map(|rest| rest.strip_suffix(".json"))
            .map(str::to_owned)
            .collect();
        names.sort();
        Ok(names)
    }

    async fn list_environments(&self, project: &ProjectName) -> Result<Vec<String>, StoreError> {
        let dir = self.object(&format!("{project}/"));
        let mut names: Vec<String> = self
            .storage
            .list(&dir)
            .await?
            .iter()
            .filter_map(|full| full.strip_prefix(&dir))
            .filter_map(|rest| rest.strip_suffix("/environment.json"))
            .filter(|env| !env.contains('/'))
            .map(str::to_owned)
            .collect();
        names.sort();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conformance;
    use liftoff_schema::OperationType;

    #[tokio::test]
    async fn memory_bucket_backend_conformance() {
        conformance::run_all(Arc::new(BucketBackend::new(MemoryBucket::new()))).await;
    }

    #[tokio::test]
    async fn directory_bucket_backend_conformance() {
        let dir = tempfile::tempdir().unwrap();
        conformance::run_all(Arc::new(
            BucketBackend::new(DirectoryBucket::new(dir.path())).with_prefix("/state/"),
        ))
        .await;
        assert!(dir
            .path()
            .join("objects/state/shop/dev/environment.json")
            .is_file());
    }

    /// Storage that hands the lock to someone else right before the next
    /// change to `record`.
    struct TakeoverBeforeWrite {
        inner: Arc<MemoryBucket>,
        record: String,
        lock: String,
        thief: Mutex<Option<Vec<u8>>>,
    }

    impl TakeoverBeforeWrite {
        async fn steal(&self, name: &str) -> Result<(), StoreError> {
            if name != self.record {
                return Ok(());
            }
            let thief = self.thief.lock().unwrap().take();
            if let Some(lock) = thief {
                self.inner.delete(&self.lock, WriteCondition::Always).await?;
                self.inner
                    .put(&self.lock, lock, WriteCondition::DoesNotExist)
                    .await?;
            }
            Ok(())
        }
    }

    #[async_trait]
    impl ObjectStorage for TakeoverBeforeWrite {
        async fn get(&self, name: &str) -> Result<Option<StoredObject>, StoreError> {
            self.inner.get(name).await
        }

        async fn put(
            &self,
            name: &str,
            data: Vec<u8>,
            condition: WriteCondition,
        ) -> Result<u64, StoreError> {
            self.steal(name).await?;
            self.inner.put(name, data, condition).await
        }

        async fn delete(&self, name: &str, condition: WriteCondition) -> Result<(), StoreError> {
            self.steal(name).await?;
            self.inner.delete(name, condition).await
        }

        async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
            self.inner.list(prefix).await
        }
    }

    fn takeover_backend(key: &RecordKey) -> BucketBackend<TakeoverBeforeWrite> {
        BucketBackend::new(TakeoverBeforeWrite {
            inner: Arc::new(MemoryBucket::new()),
            record: key.path(),
            lock: key.lock_key().path(),
            thief: Mutex::new(None),
        })
    }

    fn arm_takeover(backend: &BucketBackend<TakeoverBeforeWrite>, key: &RecordKey) {
        let lock = LockRequest::new(OperationType::CreateResource)
            .with_holder("bob@ci:7")
            .grant(&key.lock_key(), chrono::Utc::now());
        *backend.storage().thief.lock().unwrap() = Some(serde_json::to_vec(&lock).unwrap());
    }

    #[tokio::test]
    async fn write_loses_to_a_lock_taken_mid_write() {
        let key = RecordKey::resource(&ProjectName::new("shop"), &EnvName::new("dev"), "db");
        let backend = takeover_backend(&key);
        let request = LockRequest::new(OperationType::CreateResource).with_holder("alice@laptop:42");
        let lock = backend.acquire_lock(&key.lock_key(), &request).await.unwrap();
        backend.write(&key, b"v1".to_vec(), &lock.token).await.unwrap();

        arm_takeover(&backend, &key);
        let err = backend
            .write(&key, b"v2".to_vec(), &lock.token)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::LockMismatch { .. }), "{err}");
        assert_eq!(backend.read(&key).await.unwrap().as_deref(), Some(&b"v1"[..]));
        let holder = backend.read_lock(&key.lock_key()).await.unwrap().unwrap();
        assert_eq!(holder.holder, "bob@ci:7");
    }

    #[tokio::test]
    async fn first_write_loses_to_a_lock_taken_mid_write() {
        let key = RecordKey::resource(&ProjectName::new("shop"), &EnvName::new("dev"), "db");
        let backend = takeover_backend(&key);
        let request = LockRequest::new(OperationType::CreateResource);
        let lock = backend.acquire_lock(&key.lock_key(), &request).await.unwrap();

        arm_takeover(&backend, &key);
        let err = backend
            .write(&key, b"v1".to_vec(), &lock.token)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::LockMismatch { .. }), "{err}");
        assert!(backend.read(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn remove_loses_to_a_lock_taken_mid_remove() {
        let key = RecordKey::resource(&ProjectName::new("shop"), &EnvName::new("dev"), "db");
        let backend = takeover_backend(&key);
        let request = LockRequest::new(OperationType::DestroyResource);
        let lock = backend.acquire_lock(&key.lock_key(), &request).await.unwrap();
        backend.write(&key, b"v1".to_vec(), &lock.token).await.unwrap();

        arm_takeover(&backend, &key);
        let err = backend.remove(&key, &lock.token).await.unwrap_err();
        assert!(matches!(err, StoreError::LockMismatch { .. }), "{err}");
        assert_eq!(backend.read(&key).await.unwrap().as_deref(), Some(&b"v1"[..]));
    }

    #[tokio::test]
    async fn preconditions_on_memory_bucket() {
        let bucket = MemoryBucket::new();
        let g1 = bucket
            .put("a", b"1".to_vec(), WriteCondition::DoesNotExist)
            .await
            .unwrap();
        let err = bucket
            .put("a", b"2".to_vec(), WriteCondition::DoesNotExist)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::PreconditionFailed(_)));

        let g2 = bucket
            .put("a", b"2".to_vec(), WriteCondition::GenerationMatch(g1))
            .await
            .unwrap();
        assert!(g2 > g1);
        assert!(bucket
            .delete("a", WriteCondition::GenerationMatch(g1))
            .await
            .is_err());
        bucket
            .delete("a", WriteCondition::GenerationMatch(g2))
            .await
            .unwrap();
        bucket.delete("a", WriteCondition::Always).await.unwrap();
        assert!(bucket.get("a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn directory_bucket_generations_never_repeat() {
        let dir = tempfile::tempdir().unwrap();
        let bucket = DirectoryBucket::new(dir.path());
        let g1 = bucket
            .put("x/y", b"1".to_vec(), WriteCondition::Always)
            .await
            .unwrap();
        bucket.delete("x/y", WriteCondition::Always).await.unwrap();
        let g2 = bucket
            .put("x/y", b"2".to_vec(), WriteCondition::DoesNotExist)
            .await
            .unwrap();
        assert_ne!(g1, g2);
        let obj = bucket.get("x/y").await.unwrap().unwrap();
        assert_eq!(obj, StoredObject {
            data: b"2".to_vec(),
            generation: g2
        });
        assert_eq!(bucket.list("x/").await.unwrap(), vec!["x/y"]);
        assert!(bucket.list("z/").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn directory_bucket_rejects_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let bucket = DirectoryBucket::new(dir.path());
        assert!(bucket.get("../escape").await.is_err());
        assert!(bucket
            .put("a//b", vec![], WriteCondition::Always)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn memory_buckets_share_by_name() {
        let buckets = MemoryBuckets::new();
        buckets
            .bucket("artifacts")
            .put("k", b"v".to_vec(), WriteCondition::Always)
            .await
            .unwrap();
        assert!(buckets.get("artifacts").get("k").await.unwrap().is_some());
        assert!(buckets.get("other").get("k").await.unwrap().is_none());
    }
}
