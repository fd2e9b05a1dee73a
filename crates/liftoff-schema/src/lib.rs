//! Records, lock keys, identifiers, and project configuration for Liftoff.
//!
//! This crate defines the schema layer shared by every other crate: the
//! persisted `EnvironmentRecord` / `ResourceRecord` / `ServiceRecord` types and
//! their addressing (`RecordKey`), lock identities (`LockKey`, `Lock`),
//! monotonic deployment ids, typed cross-resource output references, the
//! product catalog, and `liftoff.toml` parsing and validation.

pub mod catalog;
pub mod config;
pub mod inputs;
pub mod lock;
pub mod records;
pub mod types;

pub use catalog::{ProductCatalog, ProductKind, ProductSpec, SERVICE_REQUIRED_OUTPUTS};
pub use config::{
    parse_config_file, parse_config_str, BackendConfig, ConfigError, ProjectConfig,
    ResourceConfig, ServiceConfig, Settings, CONFIG_FILE_NAME,
};
pub use inputs::{referenced_resources, InputValue, Inputs, OutputHandle};
pub use lock::{default_holder, Lock, LockKey, LockRequest, LockScope, OperationType};
pub use records::{
    ArtifactRef, EnvironmentRecord, EnvironmentStatus, EnvironmentType, Provider, ProviderConfig,
    Record, RecordKey, RecordKind, ReleasedVersion, ResourceRecord, ResourceStatus, ServiceRecord,
    ServiceStatus,
};
pub use types::{validate_name, DeploymentId, EnvName, LockToken, ProjectName};

use thiserror::Error;

/// Flat string outputs returned by the provisioning engine for one unit.
pub type Outputs = std::collections::BTreeMap<String, String>;

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("invalid {what} name '{name}': {reason}")]
    InvalidName {
        what: &'static str,
        name: String,
        reason: &'static str,
    },
    #[error("invalid deployment id '{0}': expected a decimal millisecond timestamp")]
    InvalidDeploymentId(String),
}
