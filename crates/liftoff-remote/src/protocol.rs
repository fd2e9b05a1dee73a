//! Wire format of the v1 state API.
//!
//! All routes live under `/v1/projects/{project}`:
//!
//! - `GET    /environments` lists environment names
//! - `GET|POST|DELETE /environments/{env}` environment record
//! - `GET    /environments/{env}/{resources|services}` lists record names
//! - `GET|POST|DELETE /environments/{env}/{resources|services}/{name}` records
//! - `GET|POST|DELETE /environments/{env}[/{resources|services}/{name}]/tfstate`
//!   engine state (the provisioning engine's `http` backend address)
//! - `POST   /environments/{env}/locks` acquires a lock ([`AcquireLock`] body)
//! - `GET    /environments/{env}/locks/{scope}` reads a lock
//! - `DELETE /environments/{env}/locks/{scope}?lock_id=` releases a lock
//! - `DELETE /environments/{env}/locks/{scope}?force=true` force-releases
//!
//! Mutations of records carry `lock_id`. Every request may carry
//! `account_id` for tenant routing. Failures return an [`ErrorBody`]; a held
//! lock is `409` with `error = "lock_held"` and the current lock, a stale
//! token is `409` with `error = "lock_mismatch"`.

use liftoff_schema::{EnvName, Lock, LockKey, LockRequest, LockScope, ProjectName, RecordKey, RecordKind};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub const PROTOCOL_HEADER: &str = "X-Liftoff-Protocol";

pub const ERR_LOCK_HELD: &str = "lock_held";
pub const ERR_LOCK_MISMATCH: &str = "lock_mismatch";
pub const ERR_NOT_FOUND: &str = "not_found";
pub const ERR_BAD_REQUEST: &str = "bad_request";
pub const ERR_UNAUTHORIZED: &str = "unauthorized";
pub const ERR_INTERNAL: &str = "internal";

/// Body of `POST .../locks`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AcquireLock {
    pub scope: LockScope,
    #[serde(flatten)]
    pub request: LockRequest,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorBody {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock: Option<Lock>,
}

impl ErrorBody {
    pub fn new(error: &str, message: impl Into<String>) -> Self {
        Self {
            error: error.to_owned(),
            message: Some(message.into()),
            lock: None,
        }
    }

    pub fn lock_held(lock: Lock) -> Self {
        Self {
            error: ERR_LOCK_HELD.to_owned(),
            message: Some(format!("held by {}", lock.holder)),
            lock: Some(lock),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Environments {
        project: ProjectName,
    },
    Environment {
        project: ProjectName,
        environment: EnvName,
    },
    Collection {
        project: ProjectName,
        environment: EnvName,
        kind: RecordKind,
    },
    Record(RecordKey),
    Locks {
        project: ProjectName,
        environment: EnvName,
    },
    Lock(LockKey),
    /// Provisioning engine state of a resource or service.
    EngineState(RecordKey),
}

impl Route {
    pub fn for_record(key: &RecordKey) -> Self {
        match key.kind {
            RecordKind::Environment => Route::Environment {
                project: key.project.clone(),
                environment: key.environment.clone(),
            },
            _ => Route::Record(key.clone()),
        }
    }

    /// Path below the server root, starting with `/v1/`.
    pub fn path(&self) -> String {
        match self {
            Route::Environments { project } => format!("/v1/projects/{project}/environments"),
            Route::Environment {
                project,
                environment,
            } => format!("/v1/projects/{project}/environments/{environment}"),
            Route::Collection {
                project,
                environment,
                kind,
            } => format!(
                "/v1/projects/{project}/environments/{environment}/{}",
                kind.collection()
            ),
            Route::Record(key) => match &key.name {
                Some(name) => format!(
                    "/v1/projects/{}/environments/{}/{}/{name}",
                    key.project,
                    key.environment,
                    key.kind.collection()
                ),
                None => format!(
                    "/v1/projects/{}/environments/{}",
                    key.project, key.environment
                ),
            },
            Route::Locks {
                project,
                environment,
            } => format!("/v1/projects/{project}/environments/{environment}/locks"),
            Route::Lock(key) => format!(
                "/v1/projects/{}/environments/{}/locks/{}",
                key.project,
                key.environment,
                key.scope.path()
            ),
            Route::EngineState(key) => format!("{}/tfstate", Route::Record(key.clone()).path()),
        }
    }

    /// Parse a request path (without query string).
    pub fn parse(path: &str) -> Option<Self> {
        let rest = path.strip_prefix("/v1/projects/")?;
        let segments: Vec<&str> = rest.split('/').collect();
        if segments.iter().any(|s| s.is_empty()) {
            return None;
        }
        let project = ProjectName::new(segments[0]);
        match segments.as_slice() {
            [_, "environments"] => Some(Route::Environments { project }),
            [_, "environments", env] => Some(Route::Environment {
                project,
                environment: EnvName::new(*env),
            }),
            [_, "environments", env, "locks"] => Some(Route::Locks {
                project,
                environment: EnvName::new(*env),
            }),
            [_, "environments", env, "tfstate"] => Some(Route::EngineState(RecordKey::environment(
                &project,
                &EnvName::new(*env),
            ))),
            [_, "environments", env, "locks", scope @ ..] => {
                let scope = LockScope::parse_path(&scope.join("/"))?;
                Some(Route::Lock(LockKey {
                    project,
                    environment: EnvName::new(*env),
                    scope,
                }))
            }
            [_, "environments", env, collection] => Some(Route::Collection {
                project,
                environment: EnvName::new(*env),
                kind: parse_collection(collection)?,
            }),
            [_, "environments", env, collection, name] => {
                let environment = EnvName::new(*env);
                match parse_collection(collection)? {
                    RecordKind::Resource => {
                        Some(Route::Record(RecordKey::resource(&project, &environment, name)))
                    }
                    RecordKind::Service => {
                        Some(Route::Record(RecordKey::service(&project, &environment, name)))
                    }
                    RecordKind::Environment => None,
                }
            }
            [_, "environments", env, collection, name, "tfstate"] => {
                let environment = EnvName::new(*env);
                match parse_collection(collection)? {
                    RecordKind::Resource => Some(Route::EngineState(RecordKey::resource(
                        &project,
                        &environment,
                        name,
                    ))),
                    RecordKind::Service => Some(Route::EngineState(RecordKey::service(
                        &project,
                        &environment,
                        name,
                    ))),
                    RecordKind::Environment => None,
                }
            }
            _ => None,
        }
    }
}

fn parse_collection(segment: &str) -> Option<RecordKind> {
    match segment {
        "resources" => Some(RecordKind::Resource),
        "services" => Some(RecordKind::Service),
        _ => None,
    }
}

/// Split `a=1&b=2` into a map. Values are taken verbatim.
pub fn parse_query(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((k, v)) => (k.to_owned(), v.to_owned()),
            None => (pair.to_owned(), String::new()),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use liftoff_schema::OperationType;

    fn names() -> (ProjectName, EnvName) {
        (ProjectName::new("shop"), EnvName::new("dev"))
    }

    #[test]
    fn routes_roundtrip_through_paths() {
        let (p, e) = names();
        let routes = vec![
            Route::Environments { project: p.clone() },
            Route::Environment {
                project: p.clone(),
                environment: e.clone(),
            },
            Route::Collection {
                project: p.clone(),
                environment: e.clone(),
                kind: RecordKind::Service,
            },
            Route::Record(RecordKey::resource(&p, &e, "db")),
            Route::Record(RecordKey::service(&p, &e, "api")),
            Route::Locks {
                project: p.clone(),
                environment: e.clone(),
            },
            Route::Lock(LockKey::environment(&p, &e)),
            Route::Lock(LockKey::resource(&p, &e, "db")),
            Route::Lock(LockKey::service(&p, &e, "api")),
            Route::EngineState(RecordKey::resource(&p, &e, "db")),
            Route::EngineState(RecordKey::service(&p, &e, "api")),
            Route::EngineState(RecordKey::environment(&p, &e)),
        ];
        for route in routes {
            assert_eq!(Route::parse(&route.path()), Some(route.clone()), "{route:?}");
        }
    }

    #[test]
    fn record_paths_match_api_shape() {
        let (p, e) = names();
        assert_eq!(
            Route::for_record(&RecordKey::resource(&p, &e, "db")).path(),
            "/v1/projects/shop/environments/dev/resources/db"
        );
        assert_eq!(
            Route::for_record(&RecordKey::environment(&p, &e)).path(),
            "/v1/projects/shop/environments/dev"
        );
        assert_eq!(
            Route::Lock(LockKey::service(&p, &e, "api")).path(),
            "/v1/projects/shop/environments/dev/locks/services/api"
        );
    }

    #[test]
    fn parse_rejects_unknown_shapes() {
        assert!(Route::parse("/v2/projects/shop/environments").is_none());
        assert!(Route::parse("/v1/projects/shop/environments/dev/queues/q").is_none());
        assert!(Route::parse("/v1/projects/shop/environments/dev/resources/").is_none());
        assert!(Route::parse("/v1/projects/shop/environments/dev/locks/widgets/x").is_none());
        assert!(Route::parse("/v1/projects//environments").is_none());
        assert!(Route::parse("/v1/projects/shop/environments/dev/queues/q/tfstate").is_none());
    }

    #[test]
    fn query_parsing() {
        let q = parse_query("lock_id=abc&force=true&flag");
        assert_eq!(q.get("lock_id").map(String::as_str), Some("abc"));
        assert_eq!(q.get("force").map(String::as_str), Some("true"));
        assert_eq!(q.get("flag").map(String::as_str), Some(""));
        assert!(parse_query("").is_empty());
    }

    #[test]
    fn acquire_body_shape() {
        let body = AcquireLock {
            scope: LockScope::Resource("db".to_owned()),
            request: LockRequest::new(OperationType::CreateResource).with_holder("ci"),
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["scope"]["kind"], "resource");
        assert_eq!(json["scope"]["name"], "db");
        assert_eq!(json["operation"], "create_resource");
        assert_eq!(json["holder"], "ci");
        let back: AcquireLock = serde_json::from_value(json).unwrap();
        assert_eq!(back, body);
    }
}
