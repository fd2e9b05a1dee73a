use crate::context::{EnvironmentView, ProviderBindings, Run};
use crate::retry::{poll_until, retry, PollPolicy};
use crate::CoreError;
use liftoff_runtime::{package_source, BuildJob, ContainerBuild, LogSink, RuntimeError, SourcePackage};
use liftoff_schema::{ArtifactRef, DeploymentId, ServiceConfig};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{info, warn};

/// Where the image is built.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildMode {
    /// Local container CLI, pushing to the registry.
    #[default]
    Local,
    /// The provider's managed build service.
    Remote,
}

impl fmt::Display for BuildMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuildMode::Local => write!(f, "local"),
            BuildMode::Remote => write!(f, "remote"),
        }
    }
}

/// Registry host of a repository (`europe-docker.pkg.dev/p/r` -> `europe-docker.pkg.dev`).
pub fn registry_host(repository: &str) -> &str {
    repository.split('/').next().unwrap_or(repository)
}

/// Map a provider error to `Unauthorized` when the provider refused access.
pub(crate) fn authorize(e: RuntimeError) -> CoreError {
    match e {
        RuntimeError::Unauthorized(msg) => CoreError::Unauthorized(msg),
        other => CoreError::Runtime(other),
    }
}

/// Fetch registry credentials and log the container tool in.
pub(crate) async fn login(
    run: &Run,
    providers: &ProviderBindings,
    repository: &str,
    sink: &dyn LogSink,
) -> Result<(), CoreError> {
    let credentials = providers
        .registry
        .credentials(repository)
        .await
        .map_err(authorize)?;
    run.ctx()
        .bindings()
        .containers
        .login(registry_host(repository), &credentials, sink)
        .await
        .map_err(authorize)
}

async fn package(run: &Run, service: &ServiceConfig) -> Result<SourcePackage, CoreError> {
    let dir = run.ctx().root().join(&service.build_directory);
    let ignore = service.build_ignore.clone();
    let packaged = tokio::task::spawn_blocking(move || package_source(&dir, &ignore))
        .await
        .map_err(|e| CoreError::BuildFailed {
            service: service.name.clone(),
            reason: format!("packaging task failed: {e}"),
            log_ref: None,
        })?;
    packaged.map_err(|e| CoreError::BuildFailed {
        service: service.name.clone(),
        reason: e.to_string(),
        log_ref: None,
    })
}

/// Build `service` for `env` and return the pushed artifact, tagged with
/// `deployment_id`.
///
/// Whatever the build wrote to `sink` is flushed before a failure is
/// returned, and the failure carries the log's reference.
pub async fn build(
    run: &Run,
    env: &EnvironmentView,
    service: &ServiceConfig,
    repository: &str,
    deployment_id: DeploymentId,
    mode: BuildMode,
    sink: &dyn LogSink,
) -> Result<ArtifactRef, CoreError> {
    let providers = run.ctx().bindings().provider(env.provider())?;
    let result = async {
        let package = package(run, service).await?;
        info!(
            service = %service.name,
            mode = %mode,
            files = package.files,
            source = %package.digest,
            "building"
        );
        sink.line(&format!("source {} ({} files)", package.digest, package.files));
        match mode {
            BuildMode::Local => {
                build_local(run, providers, service, repository, deployment_id, package, sink).await
            }
            BuildMode::Remote => {
                build_remote(run, env, providers, service, repository, deployment_id, package).await
            }
        }
    }
    .await;

    result.map_err(|e| {
        if let Err(flush) = sink.flush() {
            warn!(service = %service.name, error = %flush, "failed to flush build log");
        }
        match e {
            CoreError::Runtime(source) => CoreError::BuildFailed {
                service: service.name.clone(),
                reason: source.to_string(),
                log_ref: sink.reference(),
            },
            CoreError::BuildFailed {
                service,
                reason,
                log_ref: None,
            } => CoreError::BuildFailed {
                service,
                reason,
                log_ref: sink.reference(),
            },
            other => other,
        }
    })
}

async fn build_local(
    run: &Run,
    providers: &ProviderBindings,
    service: &ServiceConfig,
    repository: &str,
    deployment_id: DeploymentId,
    package: SourcePackage,
    sink: &dyn LogSink,
) -> Result<ArtifactRef, CoreError> {
    login(run, providers, repository, sink).await?;
    let containers = &run.ctx().bindings().containers;
    let tagged = format!("{repository}:{deployment_id}");
    let latest = format!("{repository}:latest");
    containers
        .build(
            &ContainerBuild {
                context: package.data,
                dockerfile: service.dockerfile.clone(),
                tags: vec![tagged.clone(), latest.clone()],
                cache_from: vec![latest.clone()],
            },
            sink,
        )
        .await?;
    let digest = containers.push(&tagged, sink).await?;
    containers.push(&latest, sink).await?;
    Ok(ArtifactRef {
        repository: repository.to_owned(),
        tag: deployment_id.to_string(),
        digest,
    })
}

async fn build_remote(
    run: &Run,
    env: &EnvironmentView,
    providers: &ProviderBindings,
    service: &ServiceConfig,
    repository: &str,
    deployment_id: DeploymentId,
    package: SourcePackage,
) -> Result<ArtifactRef, CoreError> {
    let policy = PollPolicy::for_builds(run.ctx().settings());
    let object = format!("builds/{}/{deployment_id}.tar", service.name);
    let data = package.data;
    let source_uri = retry("source upload", &policy, run.cancel(), || {
        providers.staging.upload(env.bucket(), &object, data.clone())
    })
    .await?;

    let tagged = format!("{repository}:{deployment_id}");
    let latest = format!("{repository}:latest");
    let job = BuildJob {
        source_uri,
        dockerfile: service.dockerfile.clone(),
        images: vec![tagged, latest.clone()],
        cache_from: Some(latest),
        region: env.record.provider_config.region.clone(),
        identity: env.record.provider_config.identity.clone(),
    };
    let job_id = retry("build submission", &policy, run.cancel(), || {
        providers.builds.submit(&job)
    })
    .await?;
    info!(service = %service.name, job = %job_id, "remote build submitted");

    let operation = format!("build of {}", service.name);
    let digest = poll_until(&operation, &policy, run.cancel(), || {
        providers.builds.status(&job_id)
    })
    .await
    .map_err(|e| match e {
        CoreError::OperationFailed {
            reason, log_ref, ..
        } => CoreError::BuildFailed {
            service: service.name.clone(),
            reason,
            log_ref,
        },
        other => other,
    })?;
    Ok(ArtifactRef {
        repository: repository.to_owned(),
        tag: deployment_id.to_string(),
        digest,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_host_is_first_segment() {
        assert_eq!(registry_host("europe-docker.pkg.dev/shop/images/api"), "europe-docker.pkg.dev");
        assert_eq!(registry_host("localhost:5000/api"), "localhost:5000");
        assert_eq!(registry_host("api"), "api");
    }

    #[test]
    fn unauthorized_is_lifted() {
        assert!(matches!(
            authorize(RuntimeError::Unauthorized("denied".to_owned())),
            CoreError::Unauthorized(_)
        ));
        assert!(matches!(
            authorize(RuntimeError::Provider("quota".to_owned())),
            CoreError::Runtime(_)
        ));
    }

    #[test]
    fn build_mode_serde() {
        assert_eq!(serde_json::to_string(&BuildMode::Remote).unwrap(), "\"remote\"");
        assert_eq!(BuildMode::default(), BuildMode::Local);
    }
}
