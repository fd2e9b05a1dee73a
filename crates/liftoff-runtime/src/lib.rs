//! External processes and provider seams for Liftoff.
//!
//! This crate is the execution layer the orchestrators drive: the
//! [`ProvisioningEngine`] trait with its OpenTofu CLI binding, the
//! [`ContainerTool`] trait with its Docker CLI binding, deterministic source
//! packaging, per-unit log sinks, and the narrow provider traits for source
//! staging, managed builds, artifact registries, and release targets. The
//! [`mock`] module binds every seam in memory for tests.

pub mod container;
pub mod engine;
pub mod logs;
pub mod mock;
pub mod package;
pub mod process;
pub mod provider;

pub use container::{ContainerBuild, ContainerTool, DockerCli};
pub use engine::{EngineRequest, ProvisioningEngine, StateLocation, TofuEngine};
pub use logs::{FileLogSink, LogDir, LogSink, LogSinkFactory, MemoryLogs, MemorySink};
pub use package::{package_source, SourcePackage};
pub use process::Invocation;
pub use provider::{
    ArtifactRegistry, BuildJob, BuildService, OperationStatus, RegistryCredentials, ReleaseRequest,
    ReleaseTarget, SourceStaging,
};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("runtime I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("'{0}' is not installed or not on PATH")]
    ToolUnavailable(String),
    #[error("{program} {step} exited with {}", status.map_or_else(|| "a signal".to_owned(), |c| format!("status {c}")))]
    CommandFailed {
        program: String,
        step: String,
        status: Option<i32>,
    },
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("not found: {0}")]
    NotFound(String),
    /// Network blips and 5xx answers; safe to retry.
    #[error("transient provider error: {0}")]
    Transient(String),
    #[error("provider error: {0}")]
    Provider(String),
    #[error("engine returned unusable output: {0}")]
    InvalidOutput(String),
    #[error("invalid source package: {0}")]
    Package(String),
}

impl RuntimeError {
    pub fn is_transient(&self) -> bool {
        matches!(self, RuntimeError::Transient(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_errors_are_retryable() {
        assert!(RuntimeError::Transient("503".to_owned()).is_transient());
        assert!(!RuntimeError::Unauthorized("registry".to_owned()).is_transient());
        assert!(!RuntimeError::Provider("quota".to_owned()).is_transient());
    }

    #[test]
    fn command_failed_display() {
        let e = RuntimeError::CommandFailed {
            program: "tofu".to_owned(),
            step: "apply".to_owned(),
            status: Some(1),
        };
        assert_eq!(e.to_string(), "tofu apply exited with status 1");
        let e = RuntimeError::CommandFailed {
            program: "docker".to_owned(),
            step: "push".to_owned(),
            status: None,
        };
        assert!(e.to_string().ends_with("a signal"));
    }
}
