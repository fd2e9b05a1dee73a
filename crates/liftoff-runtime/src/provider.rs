use crate::RuntimeError;
use async_trait::async_trait;
use liftoff_schema::{ArtifactRef, DeploymentId};
use std::collections::BTreeMap;
use std::fmt;

/// State of a long-running provider operation, as seen by one poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationStatus<T> {
    Pending { detail: Option<String> },
    Done(T),
    Failed {
        reason: String,
        log_url: Option<String>,
    },
}

impl<T> OperationStatus<T> {
    pub fn pending() -> Self {
        OperationStatus::Pending { detail: None }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, OperationStatus::Pending { .. })
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct RegistryCredentials {
    pub username: String,
    pub password: String,
}

impl RegistryCredentials {
    pub fn new(username: &str, password: &str) -> Self {
        Self {
            username: username.to_owned(),
            password: password.to_owned(),
        }
    }
}

impl fmt::Debug for RegistryCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryCredentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[async_trait]
pub trait SourceStaging: Send + Sync {
    /// Store `data` at `object` in `bucket`; returns the provider URI.
    async fn upload(&self, bucket: &str, object: &str, data: Vec<u8>) -> Result<String, RuntimeError>;
}

/// A managed container build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildJob {
    pub source_uri: String,
    pub dockerfile: String,
    /// Every `repo:tag` the job pushes.
    pub images: Vec<String>,
    pub cache_from: Option<String>,
    pub region: String,
    pub identity: String,
}

#[async_trait]
pub trait BuildService: Send + Sync {
    /// Start the job; returns its id.
    async fn submit(&self, job: &BuildJob) -> Result<String, RuntimeError>;

    /// `Done` carries the pushed image digest.
    async fn status(&self, job_id: &str) -> Result<OperationStatus<String>, RuntimeError>;
}

#[async_trait]
pub trait ArtifactRegistry: Send + Sync {
    /// Push/pull credentials for `repository`. Callers must treat a refusal
    /// as [`RuntimeError::Unauthorized`], never as "nothing to do".
    async fn credentials(&self, repository: &str) -> Result<RegistryCredentials, RuntimeError>;

    /// Digest currently behind `repository:tag`, if the tag exists.
    async fn resolve(&self, repository: &str, tag: &str) -> Result<Option<String>, RuntimeError>;

    /// Start a server-side copy of `source` to `target_repository:target_tag`;
    /// returns an operation id for [`copy_status`](Self::copy_status).
    async fn copy(
        &self,
        source: &ArtifactRef,
        target_repository: &str,
        target_tag: &str,
    ) -> Result<String, RuntimeError>;

    /// `Done` carries the digest of the copied image.
    async fn copy_status(&self, operation: &str) -> Result<OperationStatus<String>, RuntimeError>;
}

/// Moving a service's live pointer to a new image.
#[derive(Debug, Clone, PartialEq)]
pub struct ReleaseRequest {
    /// The `release_target` output of the service's infrastructure.
    pub target: String,
    /// Digest-pinned image reference.
    pub image: String,
    pub deployment_id: DeploymentId,
    pub region: String,
    pub identity: String,
    /// Resolved service inputs passed to the workload (environment, flags).
    pub inputs: BTreeMap<String, String>,
}

#[async_trait]
pub trait ReleaseTarget: Send + Sync {
    /// Update the pointer; returns the revision that now receives traffic.
    async fn update(&self, request: &ReleaseRequest) -> Result<String, RuntimeError>;

    /// `Done` carries the service URL once the revision is healthy.
    async fn readiness(&self, target: &str, revision: &str) -> Result<OperationStatus<String>, RuntimeError>;
}
