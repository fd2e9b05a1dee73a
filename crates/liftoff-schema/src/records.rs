use crate::inputs::Inputs;
use crate::lock::{LockKey, LockScope};
use crate::types::{DeploymentId, EnvName, ProjectName};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Gcp,
    Aws,
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Provider::Gcp => write!(f, "gcp"),
            Provider::Aws => write!(f, "aws"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EnvironmentType {
    Development,
    Production,
}

impl fmt::Display for EnvironmentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnvironmentType::Development => write!(f, "development"),
            EnvironmentType::Production => write!(f, "production"),
        }
    }
}

/// Cloud account binding of an environment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProviderConfig {
    pub provider: Provider,
    /// GCP project id or AWS account id.
    pub account_id: String,
    pub region: String,
    /// Service account email or role ARN that workloads run as.
    pub identity: String,
    pub artifact_bucket: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EnvironmentStatus {
    Ready,
    Creating,
    Failed,
}

impl fmt::Display for EnvironmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnvironmentStatus::Ready => write!(f, "ready"),
            EnvironmentStatus::Creating => write!(f, "creating"),
            EnvironmentStatus::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResourceStatus {
    Ready,
    Creating,
    Failed,
    Deleting,
}

impl fmt::Display for ResourceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceStatus::Ready => write!(f, "ready"),
            ResourceStatus::Creating => write!(f, "creating"),
            ResourceStatus::Failed => write!(f, "failed"),
            ResourceStatus::Deleting => write!(f, "deleting"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ServiceStatus {
    Ready,
    DeployFailed,
    PromoteFailed,
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceStatus::Ready => write!(f, "ready"),
            ServiceStatus::DeployFailed => write!(f, "deploy_failed"),
            ServiceStatus::PromoteFailed => write!(f, "promote_failed"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EnvironmentRecord {
    pub env_type: EnvironmentType,
    pub provider_config: ProviderConfig,
    pub status: EnvironmentStatus,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceRecord {
    pub name: String,
    pub provider: Provider,
    pub product: String,
    pub status: ResourceStatus,
    #[serde(default)]
    pub declared_inputs: Inputs,
    /// Inputs of the last failed attempt. `None` whenever the last attempt succeeded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempted_inputs: Option<Inputs>,
    #[serde(default)]
    pub provider_id: Option<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl ResourceRecord {
    /// `ready` is only meaningful when the last attempt left no failed inputs behind.
    pub fn is_ready(&self) -> bool {
        self.status == ResourceStatus::Ready && self.attempted_inputs.is_none()
    }
}

/// Content-addressed reference to a built container image.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ArtifactRef {
    pub repository: String,
    pub tag: String,
    /// `sha256:...` content digest.
    pub digest: String,
}

impl ArtifactRef {
    /// Immutable pull reference (`repo@sha256:...`).
    pub fn pinned(&self) -> String {
        format!("{}@{}", self.repository, self.digest)
    }

    pub fn tagged(&self) -> String {
        format!("{}:{}", self.repository, self.tag)
    }
}

/// A deployment that was live at some point, kept for explicit rollback.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReleasedVersion {
    pub deployment_id: DeploymentId,
    pub artifact: ArtifactRef,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceRecord {
    pub name: String,
    pub provider: Provider,
    pub product: String,
    pub status: ServiceStatus,
    #[serde(default)]
    pub declared_inputs: Inputs,
    #[serde(default)]
    pub service_url: Option<String>,
    #[serde(default)]
    pub deployment_id: Option<DeploymentId>,
    #[serde(default)]
    pub provider_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<ArtifactRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous: Option<ReleasedVersion>,
    pub created_at: String,
    pub updated_at: String,
}

impl ServiceRecord {
    /// The version currently serving traffic, if the last release succeeded.
    pub fn live_version(&self) -> Option<ReleasedVersion> {
        match (self.status, self.deployment_id, &self.artifact) {
            (ServiceStatus::Ready, Some(deployment_id), Some(artifact)) => Some(ReleasedVersion {
                deployment_id,
                artifact: artifact.clone(),
            }),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    Environment,
    Resource,
    Service,
}

impl RecordKind {
    /// Collection segment used in paths and URLs (`resources`, `services`).
    pub fn collection(self) -> &'static str {
        match self {
            RecordKind::Environment => "environments",
            RecordKind::Resource => "resources",
            RecordKind::Service => "services",
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordKind::Environment => write!(f, "environment"),
            RecordKind::Resource => write!(f, "resource"),
            RecordKind::Service => write!(f, "service"),
        }
    }
}

/// Address of one persisted record.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RecordKey {
    pub project: ProjectName,
    pub environment: EnvName,
    pub kind: RecordKind,
    /// `None` for the environment record itself.
    pub name: Option<String>,
}

impl RecordKey {
    pub fn environment(project: &ProjectName, environment: &EnvName) -> Self {
        Self {
            project: project.clone(),
            environment: environment.clone(),
            kind: RecordKind::Environment,
            name: None,
        }
    }

    pub fn resource(project: &ProjectName, environment: &EnvName, name: &str) -> Self {
        Self {
            project: project.clone(),
            environment: environment.clone(),
            kind: RecordKind::Resource,
            name: Some(name.to_owned()),
        }
    }

    pub fn service(project: &ProjectName, environment: &EnvName, name: &str) -> Self {
        Self {
            project: project.clone(),
            environment: environment.clone(),
            kind: RecordKind::Service,
            name: Some(name.to_owned()),
        }
    }

    /// The lock whose token must be presented to mutate this record.
    pub fn lock_key(&self) -> LockKey {
        let scope = match (self.kind, &self.name) {
            (RecordKind::Resource, Some(name)) => LockScope::Resource(name.clone()),
            (RecordKind::Service, Some(name)) => LockScope::Service(name.clone()),
            _ => LockScope::Environment,
        };
        LockKey {
            project: self.project.clone(),
            environment: self.environment.clone(),
            scope,
        }
    }

    /// Relative path of the record inside a state tree or bucket.
    pub fn path(&self) -> String {
        match &self.name {
            Some(name) if self.kind != RecordKind::Environment => format!(
                "{}/{}/{}/{name}.json",
                self.project,
                self.environment,
                self.kind.collection()
            ),
            _ => format!("{}/{}/environment.json", self.project, self.environment),
        }
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(
                f,
                "{}/{}/{}:{name}",
                self.project, self.environment, self.kind
            ),
            None => write!(f, "{}/{}", self.project, self.environment),
        }
    }
}

/// A persisted record type with a fixed [`RecordKind`].
pub trait Record: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    const KIND: RecordKind;

    /// Refresh `updated_at` before a write.
    fn touch(&mut self, now: &str);
}

impl Record for EnvironmentRecord {
    const KIND: RecordKind = RecordKind::Environment;

    fn touch(&mut self, now: &str) {
        now.clone_into(&mut self.updated_at);
    }
}

impl Record for ResourceRecord {
    const KIND: RecordKind = RecordKind::Resource;

    fn touch(&mut self, now: &str) {
        now.clone_into(&mut self.updated_at);
    }
}

impl Record for ServiceRecord {
    const KIND: RecordKind = RecordKind::Service;

    fn touch(&mut self, now: &str) {
        now.clone_into(&mut self.updated_at);
    }
}
