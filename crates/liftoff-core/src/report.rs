use crate::context::Run;
use crate::lifecycle::DeployPhase;
use crate::CoreError;
use liftoff_schema::{DeploymentId, EnvName};
use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitKind {
    Resource,
    Service,
}

impl fmt::Display for UnitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnitKind::Resource => write!(f, "resource"),
            UnitKind::Service => write!(f, "service"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum UnitOutcome {
    Succeeded,
    Failed {
        /// Phase the service was in; `None` for resources.
        #[serde(skip_serializing_if = "Option::is_none")]
        phase: Option<DeployPhase>,
        error: String,
    },
    Skipped {
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnitReport {
    pub name: String,
    pub kind: UnitKind,
    pub outcome: UnitOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deployment_id: Option<DeploymentId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_ref: Option<String>,
}

impl UnitReport {
    fn new(name: &str, kind: UnitKind, outcome: UnitOutcome) -> Self {
        Self {
            name: name.to_owned(),
            kind,
            outcome,
            deployment_id: None,
            service_url: None,
            log_ref: None,
        }
    }

    pub fn succeeded(name: &str, kind: UnitKind) -> Self {
        Self::new(name, kind, UnitOutcome::Succeeded)
    }

    pub fn released(name: &str, deployment_id: DeploymentId, service_url: &str) -> Self {
        Self {
            deployment_id: Some(deployment_id),
            service_url: Some(service_url.to_owned()),
            ..Self::succeeded(name, UnitKind::Service)
        }
    }

    pub fn failed(name: &str, kind: UnitKind, phase: Option<DeployPhase>, error: &CoreError) -> Self {
        Self {
            log_ref: error.log_ref().map(str::to_owned),
            ..Self::new(
                name,
                kind,
                UnitOutcome::Failed {
                    phase,
                    error: error.to_string(),
                },
            )
        }
    }

    pub fn skipped(name: &str, kind: UnitKind, reason: &str) -> Self {
        Self::new(
            name,
            kind,
            UnitOutcome::Skipped {
                reason: reason.to_owned(),
            },
        )
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.outcome, UnitOutcome::Failed { .. })
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self.outcome, UnitOutcome::Skipped { .. })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub project: String,
    pub environment: String,
    pub operation: String,
    pub units: Vec<UnitReport>,
    pub started_at: String,
    pub finished_at: Option<String>,
}

impl RunReport {
    pub fn new(run: &Run, environment: &EnvName, operation: &str) -> Self {
        Self {
            run_id: run.id().to_owned(),
            project: run.ctx().project().to_string(),
            environment: environment.to_string(),
            operation: operation.to_owned(),
            units: Vec::new(),
            started_at: chrono::Utc::now().to_rfc3339(),
            finished_at: None,
        }
    }

    #[must_use]
    pub fn finish(mut self) -> Self {
        self.finished_at = Some(chrono::Utc::now().to_rfc3339());
        self
    }

    /// No unit failed or was skipped.
    pub fn is_success(&self) -> bool {
        self.units.iter().all(|u| u.outcome == UnitOutcome::Succeeded)
    }

    pub fn unit(&self, name: &str) -> Option<&UnitReport> {
        self.units.iter().find(|u| u.name == name)
    }

    pub fn failed(&self) -> impl Iterator<Item = &UnitReport> {
        self.units.iter().filter(|u| u.is_failed())
    }

    /// `3 succeeded, 1 failed, 0 skipped`
    pub fn summary(&self) -> String {
        let failed = self.failed().count();
        let skipped = self.units.iter().filter(|u| u.is_skipped()).count();
        let succeeded = self.units.len() - failed - skipped;
        format!("{succeeded} succeeded, {failed} failed, {skipped} skipped")
    }
}
