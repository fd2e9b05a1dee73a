//! Deployment orchestration for Liftoff.
//!
//! This crate ties the schema, store, and runtime crates together: the
//! provisioning driver that applies resources through the provisioning
//! engine, the build / promote / release pipelines for services, the
//! [`Deployer`] that sequences them per unit under locks, and the
//! environment workflows (create, delete, destroy, force-unlock). Long
//! running provider operations go through one bounded poll/retry combinator.

pub mod build;
pub mod concurrency;
pub mod context;
pub mod environment;
pub mod graph;
pub mod lifecycle;
pub mod orchestrator;
pub mod promote;
pub mod provision;
pub mod release;
pub mod report;
pub mod retry;

pub use build::BuildMode;
pub use concurrency::{install_signal_handler, shutdown_requested};
pub use context::{open_backend, Bindings, Context, EnvironmentView, ProviderBindings, Run};
pub use graph::DependencyGraph;
pub use lifecycle::{validate_transition, DeployPhase};
pub use orchestrator::{DeployOptions, Deployer, PromoteOptions};
pub use report::{RunReport, UnitKind, UnitOutcome, UnitReport};
pub use retry::PollPolicy;

use liftoff_schema::Provider;
use liftoff_store::StoreError;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("config error: {0}")]
    Config(#[from] liftoff_schema::ConfigError),
    #[error(transparent)]
    Schema(#[from] liftoff_schema::SchemaError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("runtime error: {0}")]
    Runtime(#[from] liftoff_runtime::RuntimeError),
    #[error("remote error: {0}")]
    Remote(#[from] liftoff_remote::RemoteError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("invalid phase transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },
    #[error("environment not found: {0}")]
    EnvironmentNotFound(String),
    #[error("environment {environment} is {status}, not ready")]
    EnvironmentNotReady { environment: String, status: String },
    #[error("environment already exists: {0}")]
    EnvironmentExists(String),
    #[error(
        "environment {environment} still has resources [{}] and services [{}]",
        resources.join(", "),
        services.join(", ")
    )]
    EnvironmentNotEmpty {
        environment: String,
        resources: Vec<String>,
        services: Vec<String>,
    },
    #[error("resource {resource} is still used by {}", dependents.join(", "))]
    DependentsExist {
        resource: String,
        dependents: Vec<String>,
    },
    #[error("unknown {what} '{name}'")]
    UnknownUnit { what: &'static str, name: String },
    #[error("{unit}: product '{product}' targets {actual}, environment uses {expected}")]
    ProviderMismatch {
        unit: String,
        product: String,
        expected: Provider,
        actual: Provider,
    },
    #[error("{unit}: deployed as product '{deployed}', configuration says '{configured}'")]
    ProductMismatch {
        unit: String,
        deployed: String,
        configured: String,
    },
    #[error("no provider bindings configured for {0}")]
    NoBindings(Provider),
    #[error("dependency cycle between: {}", .0.join(", "))]
    DependencyCycle(Vec<String>),
    #[error("{unit}: dependency '{dependency}' is not ready")]
    DependencyNotReady { unit: String, dependency: String },
    #[error("{unit}: resource '{resource}' has no output '{output}'")]
    MissingOutput {
        unit: String,
        resource: String,
        output: String,
    },
    #[error("{unit}: product '{product}' did not return outputs: {}", missing.join(", "))]
    InvalidOutputForResource {
        unit: String,
        product: String,
        missing: Vec<String>,
    },
    #[error("provisioning {unit} failed: {source}")]
    ProvisionFailed {
        unit: String,
        source: liftoff_runtime::RuntimeError,
        log_ref: Option<String>,
    },
    #[error("destroying {unit} failed: {source}")]
    DestroyFailed {
        unit: String,
        source: liftoff_runtime::RuntimeError,
        log_ref: Option<String>,
    },
    #[error("build of {service} failed: {reason}")]
    BuildFailed {
        service: String,
        reason: String,
        log_ref: Option<String>,
    },
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("{service}: no released artifact in {environment} to promote")]
    ArtifactNotFound { service: String, environment: String },
    #[error("{service}: promoted digest {actual} differs from source digest {expected}")]
    ArtifactMismatch {
        service: String,
        expected: String,
        actual: String,
    },
    #[error("release of {service} failed: {reason}")]
    ReleaseFailed { service: String, reason: String },
    #[error("{service}: no previous release to roll back to")]
    NothingToRollback { service: String },
    #[error("{operation} failed: {reason}")]
    OperationFailed {
        operation: String,
        reason: String,
        log_ref: Option<String>,
    },
    #[error("{operation} timed out after {}s", after.as_secs())]
    Timeout { operation: String, after: Duration },
    #[error("operation cancelled")]
    Cancelled,
}

impl CoreError {
    /// Errors detected before anything was mutated; a run reports these as
    /// a whole instead of per unit.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            CoreError::Config(_)
                | CoreError::Schema(_)
                | CoreError::EnvironmentNotFound(_)
                | CoreError::EnvironmentNotReady { .. }
                | CoreError::UnknownUnit { .. }
                | CoreError::ProviderMismatch { .. }
                | CoreError::ProductMismatch { .. }
                | CoreError::NoBindings(_)
                | CoreError::DependencyCycle(_)
        )
    }

    pub fn is_lock_contention(&self) -> bool {
        matches!(self, CoreError::Store(StoreError::LockHeld(_)))
    }

    /// Log file of the failed step, when one was written.
    pub fn log_ref(&self) -> Option<&str> {
        match self {
            CoreError::ProvisionFailed { log_ref, .. }
            | CoreError::DestroyFailed { log_ref, .. }
            | CoreError::BuildFailed { log_ref, .. }
            | CoreError::OperationFailed { log_ref, .. } => log_ref.as_deref(),
            _ => None,
        }
    }
}
