//! Lock manager, state store, and storage backends for Liftoff.
//!
//! Every persisted record and every lock lives behind the [`StateBackend`]
//! trait. Two bindings live here: [`LocalBackend`] (a JSON file tree guarded
//! by `fs2` file locks) and [`BucketBackend`] (versioned object storage with
//! generation preconditions). The HTTP binding lives in `liftoff-remote`.
//!
//! [`LockManager`] and [`StateStore`] are the typed façades the orchestrators
//! use; [`OutputsCache`] keeps provider outputs per run and in the
//! environment's artifact bucket.

pub mod backend;
pub mod bucket;
pub mod guard;
pub mod locks;
pub mod outputs;
pub mod state;
pub mod tree;

#[cfg(test)]
pub(crate) mod conformance;

pub use backend::{LocalBackend, StateBackend};
pub use bucket::{
    BucketBackend, BucketProvider, DirectoryBucket, DirectoryBuckets, MemoryBucket, MemoryBuckets,
    ObjectStorage, StoredObject, WriteCondition,
};
pub use guard::FileGuard;
pub use locks::{LockGuard, LockManager};
pub use outputs::{OutputsCache, OutputsKey};
pub use state::StateStore;
pub use tree::FileStateTree;

use liftoff_schema::{Lock, RecordKind, SchemaError};
use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;
use thiserror::Error;

/// Fsync a directory so that a preceding `rename()` is durable.
pub(crate) fn fsync_dir(dir: &Path) -> Result<(), std::io::Error> {
    let f = std::fs::File::open(dir)?;
    f.sync_all()
}

/// Write `data` to `dest` via a temp file in the same directory and a rename.
pub(crate) fn write_atomic(dest: &Path, data: &[u8]) -> Result<(), StoreError> {
    let dir = dest
        .parent()
        .ok_or_else(|| StoreError::Backend(format!("no parent directory for {}", dest.display())))?;
    std::fs::create_dir_all(dir)?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(data)?;
    tmp.as_file().sync_all()?;
    tmp.persist(dest).map_err(|e| StoreError::Io(e.error))?;
    fsync_dir(dir)?;
    Ok(())
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error("not found: {0}")]
    NotFound(String),
    #[error(
        "lock {} is held by {} ({}) since {}",
        .0.key, .0.holder, .0.operation, .0.acquired_at
    )]
    LockHeld(Box<Lock>),
    #[error("lock token for {key} is not the live lock")]
    LockMismatch { key: String },
    #[error("precondition failed for object '{0}'")]
    PreconditionFailed(String),
    #[error("record {key} is not a {expected} record")]
    KindMismatch { key: String, expected: RecordKind },
    #[error("backend error: {0}")]
    Backend(String),
}

impl StoreError {
    /// The current holder, when this error reports lock contention.
    pub fn lock_holder(&self) -> Option<&Lock> {
        match self {
            StoreError::LockHeld(lock) => Some(lock),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use liftoff_schema::{EnvName, LockKey, LockRequest, OperationType, ProjectName};

    #[test]
    fn lock_held_names_holder_and_operation() {
        let key = LockKey::environment(&ProjectName::new("shop"), &EnvName::new("dev"));
        let lock = LockRequest::new(OperationType::CreateEnvironment)
            .with_holder("alice@box:7")
            .grant(&key, chrono::Utc::now());
        let e = StoreError::LockHeld(Box::new(lock));
        let msg = e.to_string();
        assert!(msg.contains("alice@box:7"));
        assert!(msg.contains("create_environment"));
        assert!(msg.contains("shop/dev"));
        assert_eq!(e.lock_holder().map(|l| l.holder.as_str()), Some("alice@box:7"));
    }

    #[test]
    fn lock_mismatch_display() {
        let e = StoreError::LockMismatch {
            key: "shop/dev/resource:db".to_owned(),
        };
        assert!(e.to_string().contains("shop/dev/resource:db"));
        assert!(e.lock_holder().is_none());
    }

    #[test]
    fn write_atomic_creates_parents_and_replaces() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("a/b/c.json");
        write_atomic(&dest, b"one").unwrap();
        write_atomic(&dest, b"two").unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"two");
    }
}
