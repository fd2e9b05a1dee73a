use crate::CoreError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Phases of one service's deploy or promote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeployPhase {
    Pending,
    Locking,
    EnsuringResources,
    Building,
    Promoting,
    Releasing,
    Ready,
    DeployFailed,
    PromoteFailed,
}

impl DeployPhase {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            DeployPhase::Ready | DeployPhase::DeployFailed | DeployPhase::PromoteFailed
        )
    }
}

impl fmt::Display for DeployPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeployPhase::Pending => "pending",
            DeployPhase::Locking => "locking",
            DeployPhase::EnsuringResources => "ensuring_resources",
            DeployPhase::Building => "building",
            DeployPhase::Promoting => "promoting",
            DeployPhase::Releasing => "releasing",
            DeployPhase::Ready => "ready",
            DeployPhase::DeployFailed => "deploy_failed",
            DeployPhase::PromoteFailed => "promote_failed",
        };
        f.write_str(s)
    }
}

pub fn validate_transition(from: DeployPhase, to: DeployPhase) -> Result<(), CoreError> {
    let valid = matches!(
        (from, to),
        (DeployPhase::Pending, DeployPhase::Locking)
            | (DeployPhase::Locking, DeployPhase::EnsuringResources)
            | (
                DeployPhase::EnsuringResources,
                DeployPhase::Building | DeployPhase::Promoting
            )
            | (
                DeployPhase::Building | DeployPhase::Promoting,
                DeployPhase::Releasing
            )
            | (DeployPhase::Releasing, DeployPhase::Ready)
    ) || (!from.is_terminal()
        && matches!(to, DeployPhase::DeployFailed | DeployPhase::PromoteFailed));

    if valid {
        Ok(())
    } else {
        Err(CoreError::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}

/// Current phase of one unit, advanced only along valid transitions.
#[derive(Debug)]
pub struct PhaseTracker {
    phase: DeployPhase,
    failed: DeployPhase,
}

impl PhaseTracker {
    pub fn deploy() -> Self {
        Self {
            phase: DeployPhase::Pending,
            failed: DeployPhase::DeployFailed,
        }
    }

    pub fn promote() -> Self {
        Self {
            phase: DeployPhase::Pending,
            failed: DeployPhase::PromoteFailed,
        }
    }

    pub fn phase(&self) -> DeployPhase {
        self.phase
    }

    pub fn advance(&mut self, to: DeployPhase) -> Result<(), CoreError> {
        validate_transition(self.phase, to)?;
        tracing::debug!(from = %self.phase, to = %to, "phase");
        self.phase = to;
        Ok(())
    }

    /// Move to the failure state; returns the phase the failure happened in.
    pub fn fail(&mut self) -> DeployPhase {
        let at = self.phase;
        if !at.is_terminal() {
            self.phase = self.failed;
        }
        at
    }
}
