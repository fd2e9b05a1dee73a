use crate::types::{EnvName, LockToken, ProjectName};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Ten years; longer leases are clamped.
const MAX_LEASE_SECS: u64 = 315_360_000;

/// What a lock protects inside one environment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "name", rename_all = "lowercase")]
pub enum LockScope {
    Environment,
    Resource(String),
    Service(String),
}

impl LockScope {
    /// Path segment(s) below `locks/`, shared by every backend and the HTTP API.
    pub fn path(&self) -> String {
        match self {
            LockScope::Environment => "environment".to_owned(),
            LockScope::Resource(name) => format!("resources/{name}"),
            LockScope::Service(name) => format!("services/{name}"),
        }
    }

    /// Inverse of [`path`](Self::path).
    pub fn parse_path(path: &str) -> Option<Self> {
        if path == "environment" {
            return Some(LockScope::Environment);
        }
        let (collection, name) = path.split_once('/')?;
        if name.is_empty() || name.contains('/') {
            return None;
        }
        match collection {
            "resources" => Some(LockScope::Resource(name.to_owned())),
            "services" => Some(LockScope::Service(name.to_owned())),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LockKey {
    pub project: ProjectName,
    pub environment: EnvName,
    pub scope: LockScope,
}

impl LockKey {
    pub fn environment(project: &ProjectName, environment: &EnvName) -> Self {
        Self {
            project: project.clone(),
            environment: environment.clone(),
            scope: LockScope::Environment,
        }
    }

    pub fn resource(project: &ProjectName, environment: &EnvName, name: &str) -> Self {
        Self {
            project: project.clone(),
            environment: environment.clone(),
            scope: LockScope::Resource(name.to_owned()),
        }
    }

    pub fn service(project: &ProjectName, environment: &EnvName, name: &str) -> Self {
        Self {
            project: project.clone(),
            environment: environment.clone(),
            scope: LockScope::Service(name.to_owned()),
        }
    }

    /// Relative path of the lock object inside a state tree or bucket.
    pub fn path(&self) -> String {
        format!(
            "{}/{}/locks/{}.lock",
            self.project,
            self.environment,
            self.scope.path()
        )
    }
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.scope {
            LockScope::Environment => write!(f, "{}/{}", self.project, self.environment),
            LockScope::Resource(name) => {
                write!(f, "{}/{}/resource:{name}", self.project, self.environment)
            }
            LockScope::Service(name) => {
                write!(f, "{}/{}/service:{name}", self.project, self.environment)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    CreateEnvironment,
    DeleteEnvironment,
    CreateResource,
    DestroyResource,
    DeployService,
    PromoteService,
    RollbackService,
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OperationType::CreateEnvironment => "create_environment",
            OperationType::DeleteEnvironment => "delete_environment",
            OperationType::CreateResource => "create_resource",
            OperationType::DestroyResource => "destroy_resource",
            OperationType::DeployService => "deploy_service",
            OperationType::PromoteService => "promote_service",
            OperationType::RollbackService => "rollback_service",
        };
        f.write_str(s)
    }
}

/// Parameters of a lock acquisition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LockRequest {
    pub operation: OperationType,
    pub holder: String,
    /// Lease length in seconds. `None` holds the lock until released.
    #[serde(default)]
    pub lease_secs: Option<u64>,
}

impl LockRequest {
    pub fn new(operation: OperationType) -> Self {
        Self {
            operation,
            holder: default_holder(),
            lease_secs: None,
        }
    }

    #[must_use]
    pub fn with_holder(mut self, holder: impl Into<String>) -> Self {
        self.holder = holder.into();
        self
    }

    #[must_use]
    pub fn with_lease(mut self, lease: Option<Duration>) -> Self {
        self.lease_secs = lease.map(|d| d.as_secs().max(1));
        self
    }

    /// Materialize the lock this request would create at `now`.
    pub fn grant(&self, key: &LockKey, now: chrono::DateTime<chrono::Utc>) -> Lock {
        let expires_at = self.lease_secs.map(|secs| {
            (now + chrono::Duration::seconds(secs.min(MAX_LEASE_SECS) as i64)).to_rfc3339()
        });
        Lock {
            key: key.clone(),
            token: LockToken::generate(),
            holder: self.holder.clone(),
            operation: self.operation,
            acquired_at: now.to_rfc3339(),
            expires_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Lock {
    pub key: LockKey,
    pub token: LockToken,
    pub holder: String,
    pub operation: OperationType,
    pub acquired_at: String,
    #[serde(default)]
    pub expires_at: Option<String>,
}

impl Lock {
    /// A lock is live until its lease (if any) runs out.
    ///
    /// Unparseable lease timestamps count as live: an unreadable lease must
    /// never let a second writer in.
    pub fn is_live_at(&self, now: chrono::DateTime<chrono::Utc>) -> bool {
        match &self.expires_at {
            None => true,
            Some(ts) => chrono::DateTime::parse_from_rfc3339(ts)
                .map_or(true, |expires| expires.with_timezone(&chrono::Utc) > now),
        }
    }

    pub fn is_live(&self) -> bool {
        self.is_live_at(chrono::Utc::now())
    }
}

/// `user@host:pid` of the current process.
pub fn default_holder() -> String {
    let user = std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_owned());
    let host = std::env::var("HOSTNAME")
        .ok()
        .or_else(|| {
            std::fs::read_to_string("/etc/hostname")
                .ok()
                .map(|h| h.trim().to_owned())
        })
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".to_owned());
    format!("{user}@{host}:{}", std::process::id())
}
