use crate::build::{authorize, login, BuildMode};
use crate::context::{EnvironmentView, Run};
use crate::retry::{poll_until, retry, PollPolicy};
use crate::CoreError;
use liftoff_runtime::LogSink;
use liftoff_schema::{ArtifactRef, DeploymentId, RecordKey, ServiceRecord};
use tracing::info;

/// The artifact `service` released in `from` as `from_deployment_id`.
pub async fn source_artifact(
    run: &Run,
    from: &EnvironmentView,
    service: &str,
    from_deployment_id: Option<DeploymentId>,
) -> Result<ArtifactRef, CoreError> {
    let record: Option<ServiceRecord> = run
        .ctx()
        .store()
        .get(&RecordKey::service(&from.project, &from.name, service))
        .await?;
    let live = record
        .as_ref()
        .and_then(ServiceRecord::live_version)
        .filter(|live| from_deployment_id.map_or(true, |id| id == live.deployment_id));
    live.map(|live| live.artifact)
        .ok_or_else(|| CoreError::ArtifactNotFound {
            service: service.to_owned(),
            environment: from.name.to_string(),
        })
}

/// Copy the image `service` runs in `from` (deployment `from_deployment_id`)
/// to `target_repository` in `to`, tagged `to_deployment_id`.
///
/// Credentials for both registries are checked first. The copy must keep
/// the digest; anything else is `ArtifactMismatch`.
#[allow(clippy::too_many_arguments)]
pub async fn promote(
    run: &Run,
    from: &EnvironmentView,
    to: &EnvironmentView,
    service: &str,
    from_deployment_id: Option<DeploymentId>,
    to_deployment_id: DeploymentId,
    target_repository: &str,
    mode: BuildMode,
    sink: &dyn LogSink,
) -> Result<ArtifactRef, CoreError> {
    let source = source_artifact(run, from, service, from_deployment_id).await?;
    let from_providers = run.ctx().bindings().provider(from.provider())?;
    let to_providers = run.ctx().bindings().provider(to.provider())?;
    let tag = to_deployment_id.to_string();
    info!(
        service,
        from = %from.name,
        to = %to.name,
        digest = %source.digest,
        mode = %mode,
        "promoting"
    );
    sink.line(&format!("promoting {} to {target_repository}:{tag}", source.pinned()));

    let digest = match mode {
        BuildMode::Remote => {
            from_providers
                .registry
                .credentials(&source.repository)
                .await
                .map_err(authorize)?;
            to_providers
                .registry
                .credentials(target_repository)
                .await
                .map_err(authorize)?;
            let policy = PollPolicy::for_builds(run.ctx().settings());
            let operation = retry("image copy", &policy, run.cancel(), || {
                to_providers.registry.copy(&source, target_repository, &tag)
            })
            .await
            .map_err(lift_unauthorized)?;
            poll_until(
                &format!("copy of {service}"),
                &policy,
                run.cancel(),
                || to_providers.registry.copy_status(&operation),
            )
            .await?
        }
        BuildMode::Local => {
            login(run, from_providers, &source.repository, sink).await?;
            login(run, to_providers, target_repository, sink).await?;
            let containers = &run.ctx().bindings().containers;
            let pinned = source.pinned();
            let target = format!("{target_repository}:{tag}");
            containers.pull(&pinned, sink).await?;
            containers.tag(&pinned, &target, sink).await?;
            containers.push(&target, sink).await?
        }
    };

    if digest != source.digest {
        return Err(CoreError::ArtifactMismatch {
            service: service.to_owned(),
            expected: source.digest,
            actual: digest,
        });
    }
    Ok(ArtifactRef {
        repository: target_repository.to_owned(),
        tag,
        digest,
    })
}

fn lift_unauthorized(e: CoreError) -> CoreError {
    match e {
        CoreError::Runtime(e) => authorize(e),
        other => other,
    }
}
