//! Release pipeline: move a service's live pointer to a pinned image and
//! wait for it to become healthy.
//!
//! A failed release is left as it is. Going back to the last good version
//! is an explicit [`rollback`].

use crate::context::{EnvironmentView, Run};
use crate::provision::{resolve_inputs, stringify};
use crate::retry::{poll_until, retry, PollPolicy};
use crate::CoreError;
use liftoff_runtime::ReleaseRequest;
use liftoff_schema::{
    ArtifactRef, DeploymentId, LockToken, OperationType, RecordKey, ServiceConfig, ServiceRecord,
    ServiceStatus,
};
use liftoff_store::OutputsKey;
use std::collections::BTreeMap;
use tracing::{info, warn};

/// Point `target` at `artifact` and wait until the new revision serves.
/// Returns the service URL.
pub async fn release(
    run: &Run,
    env: &EnvironmentView,
    service: &str,
    target: &str,
    artifact: &ArtifactRef,
    deployment_id: DeploymentId,
    inputs: BTreeMap<String, String>,
) -> Result<String, CoreError> {
    let providers = run.ctx().bindings().provider(env.provider())?;
    let policy = PollPolicy::for_releases(run.ctx().settings());
    let request = ReleaseRequest {
        target: target.to_owned(),
        image: artifact.pinned(),
        deployment_id,
        region: env.record.provider_config.region.clone(),
        identity: env.record.provider_config.identity.clone(),
        inputs,
    };
    let failed = |e: CoreError| match e {
        CoreError::Runtime(source) => CoreError::ReleaseFailed {
            service: service.to_owned(),
            reason: source.to_string(),
        },
        CoreError::OperationFailed { reason, .. } => CoreError::ReleaseFailed {
            service: service.to_owned(),
            reason,
        },
        other => other,
    };

    let revision = retry(&format!("release of {service}"), &policy, run.cancel(), || {
        providers.releases.update(&request)
    })
    .await
    .map_err(failed)?;
    info!(service, revision = %revision, image = %request.image, "release pointer moved");

    let url = poll_until(&format!("readiness of {service}"), &policy, run.cancel(), || {
        providers.releases.readiness(target, &revision)
    })
    .await
    .map_err(failed)?;
    info!(service, url = %url, %deployment_id, "service ready");
    Ok(url)
}

/// Release inputs of a service: its declared inputs, resolved and
/// rendered as strings.
pub async fn release_inputs(
    run: &Run,
    env: &EnvironmentView,
    service: &ServiceConfig,
) -> Result<BTreeMap<String, String>, CoreError> {
    let values = resolve_inputs(run, env, &service.name, &service.inputs, &service.depends_on).await?;
    Ok(stringify(values))
}

/// Re-release the service's previous version under the service lock.
///
/// On success the previous and current versions swap places. On failure
/// the record is left `deploy_failed` with the previous version kept, so
/// the rollback can be retried.
pub async fn rollback(
    run: &Run,
    env: &EnvironmentView,
    service: &ServiceConfig,
) -> Result<ServiceRecord, CoreError> {
    let key = RecordKey::service(&env.project, &env.name, &service.name);
    let guard = run
        .ctx()
        .locks()
        .acquire_guard(&key.lock_key(), OperationType::RollbackService)
        .await?;
    let result = rollback_locked(run, env, service, &key, guard.token()).await;
    if let Err(e) = guard.release().await {
        warn!(service = %service.name, error = %e, "failed to release service lock");
    }
    result
}

async fn rollback_locked(
    run: &Run,
    env: &EnvironmentView,
    service: &ServiceConfig,
    key: &RecordKey,
    token: &LockToken,
) -> Result<ServiceRecord, CoreError> {
    let store = run.ctx().store();
    let mut record: ServiceRecord = store.load(key).await?;
    let previous = record
        .previous
        .clone()
        .ok_or_else(|| CoreError::NothingToRollback {
            service: service.name.clone(),
        })?;
    let infra = run
        .outputs()
        .get(
            env.bucket(),
            &OutputsKey::new(&env.project, &env.name, &record.product, &service.name),
        )
        .await?
        .unwrap_or_default();
    let target = infra
        .get("release_target")
        .ok_or_else(|| CoreError::MissingOutput {
            unit: service.name.clone(),
            resource: service.name.clone(),
            output: "release_target".to_owned(),
        })?;
    let inputs = release_inputs(run, env, service).await?;

    let current = record.live_version();
    match release(
        run,
        env,
        &service.name,
        target,
        &previous.artifact,
        previous.deployment_id,
        inputs,
    )
    .await
    {
        Ok(url) => {
            record.status = ServiceStatus::Ready;
            record.deployment_id = Some(previous.deployment_id);
            record.artifact = Some(previous.artifact);
            record.service_url = Some(url);
            record.previous = current;
            let saved = store.save(key, &record, token).await?;
            info!(service = %service.name, deployment_id = %previous.deployment_id, "rolled back");
            Ok(saved)
        }
        Err(e) => {
            record.status = ServiceStatus::DeployFailed;
            record.deployment_id = None;
            record.service_url = None;
            record.artifact = None;
            if let Err(save) = store.save(key, &record, token).await {
                warn!(service = %service.name, error = %save, "failed to record rollback failure");
            }
            Err(e)
        }
    }
}
