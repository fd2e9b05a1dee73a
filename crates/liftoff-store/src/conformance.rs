use crate::{StateBackend, StoreError};
use liftoff_schema::{
    EnvName, LockKey, LockRequest, LockToken, OperationType, ProjectName, RecordKey, RecordKind,
};
use std::sync::Arc;

fn names() -> (ProjectName, EnvName) {
    (ProjectName::new("shop"), EnvName::new("dev"))
}

pub(crate) async fn run_all(backend: Arc<dyn StateBackend>) {
    single_live_lock_per_key(&*backend).await;
    independent_keys_lock_independently(&*backend).await;
    stale_tokens_are_rejected(&*backend).await;
    force_release_then_acquire(&*backend).await;
    listing_and_removal(&*backend).await;
}

async fn single_live_lock_per_key(backend: &dyn StateBackend) {
    let (p, e) = names();
    let key = LockKey::resource(&p, &e, "single");
    let first = backend
        .acquire_lock(
            &key,
            &LockRequest::new(OperationType::CreateResource).with_holder("first"),
        )
        .await
        .unwrap();
    let err = backend
        .acquire_lock(
            &key,
            &LockRequest::new(OperationType::CreateResource).with_holder("second"),
        )
        .await
        .unwrap_err();
    let holder = err.lock_holder().expect("LockHeld carries the holder");
    assert_eq!(holder.holder, "first");
    assert_eq!(holder.token, first.token);
    assert_eq!(backend.read_lock(&key).await.unwrap(), Some(first.clone()));

    backend.release_lock(&key, &first.token).await.unwrap();
    assert!(backend.read_lock(&key).await.unwrap().is_none());
}

async fn independent_keys_lock_independently(backend: &dyn StateBackend) {
    let (p, e) = names();
    let a = LockKey::resource(&p, &e, "indep-a");
    let b = LockKey::resource(&p, &e, "indep-b");
    let s = LockKey::service(&p, &e, "indep-a");
    let req = LockRequest::new(OperationType::CreateResource);
    let la = backend.acquire_lock(&a, &req).await.unwrap();
    let lb = backend.acquire_lock(&b, &req).await.unwrap();
    let ls = backend.acquire_lock(&s, &req).await.unwrap();
    backend.release_lock(&a, &la.token).await.unwrap();
    backend.release_lock(&b, &lb.token).await.unwrap();
    backend.release_lock(&s, &ls.token).await.unwrap();
}

async fn stale_tokens_are_rejected(backend: &dyn StateBackend) {
    let (p, e) = names();
    let record = RecordKey::resource(&p, &e, "stale");
    let key = record.lock_key();
    let req = LockRequest::new(OperationType::CreateResource);

    let old = backend.acquire_lock(&key, &req).await.unwrap();
    backend
        .write(&record, br#"{"v":1}"#.to_vec(), &old.token)
        .await
        .unwrap();
    backend.release_lock(&key, &old.token).await.unwrap();

    let err = backend
        .write(&record, br#"{"v":2}"#.to_vec(), &old.token)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::LockMismatch { .. }), "{err}");

    let current = backend.acquire_lock(&key, &req).await.unwrap();
    let err = backend
        .write(&record, br#"{"v":3}"#.to_vec(), &old.token)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::LockMismatch { .. }), "{err}");
    let err = backend
        .write(&record, br#"{"v":4}"#.to_vec(), &LockToken::generate())
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::LockMismatch { .. }), "{err}");
    let err = backend.release_lock(&key, &old.token).await.unwrap_err();
    assert!(matches!(err, StoreError::LockMismatch { .. }), "{err}");
    let err = backend.remove(&record, &old.token).await.unwrap_err();
    assert!(matches!(err, StoreError::LockMismatch { .. }), "{err}");

    // None of the rejected writes landed.
    assert_eq!(
        backend.read(&record).await.unwrap().as_deref(),
        Some(&br#"{"v":1}"#[..])
    );
    backend.release_lock(&key, &current.token).await.unwrap();
}

async fn force_release_then_acquire(backend: &dyn StateBackend) {
    let (p, e) = names();
    let key = LockKey::environment(&p, &e);
    let orphan = backend
        .acquire_lock(
            &key,
            &LockRequest::new(OperationType::CreateEnvironment).with_holder("crashed"),
        )
        .await
        .unwrap();
    let removed = backend.force_release_lock(&key).await.unwrap();
    assert_eq!(removed.map(|l| l.token), Some(orphan.token));
    assert!(backend.force_release_lock(&key).await.unwrap().is_none());

    let fresh = backend
        .acquire_lock(&key, &LockRequest::new(OperationType::CreateEnvironment))
        .await
        .unwrap();
    backend.release_lock(&key, &fresh.token).await.unwrap();
}

async fn listing_and_removal(backend: &dyn StateBackend) {
    let (p, e) = names();
    let env_key = RecordKey::environment(&p, &e);
    let env_lock = backend
        .acquire_lock(
            &env_key.lock_key(),
            &LockRequest::new(OperationType::CreateEnvironment),
        )
        .await
        .unwrap();
    backend
        .write(&env_key, b"{}".to_vec(), &env_lock.token)
        .await
        .unwrap();
    backend
        .release_lock(&env_key.lock_key(), &env_lock.token)
        .await
        .unwrap();

    for name in ["list-b", "list-a"] {
        let key = RecordKey::service(&p, &e, name);
        let lock = backend
            .acquire_lock(&key.lock_key(), &LockRequest::new(OperationType::DeployService))
            .await
            .unwrap();
        backend.write(&key, b"{}".to_vec(), &lock.token).await.unwrap();
        backend.release_lock(&key.lock_key(), &lock.token).await.unwrap();
    }

    assert_eq!(
        backend.list(&p, &e, RecordKind::Service).await.unwrap(),
        vec!["list-a", "list-b"]
    );
    assert!(backend
        .list_environments(&p)
        .await
        .unwrap()
        .contains(&"dev".to_owned()));

    let key = RecordKey::service(&p, &e, "list-a");
    let lock = backend
        .acquire_lock(&key.lock_key(), &LockRequest::new(OperationType::DeployService))
        .await
        .unwrap();
    backend.remove(&key, &lock.token).await.unwrap();
    // Removing twice is fine.
    backend.remove(&key, &lock.token).await.unwrap();
    backend.release_lock(&key.lock_key(), &lock.token).await.unwrap();
    assert!(backend.read(&key).await.unwrap().is_none());
    assert_eq!(
        backend.list(&p, &e, RecordKind::Service).await.unwrap(),
        vec!["list-b"]
    );
}
