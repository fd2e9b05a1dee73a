//! Reference HTTP server for the Liftoff v1 state API.
//!
//! Serves environment, resource and service records, their locks, and the
//! provisioning engine's state documents from one [`FileStateTree`] per
//! tenant: `{data_dir}/{account_id}/...`, or `{data_dir}/default/...` when a
//! request names no account. Token checks run under the tree's environment
//! guard, so they stay atomic with the write they authorize even when
//! several server processes share a data directory.
//!
//! The [`TestServer`] helper starts a server on a random port for integration testing.

use liftoff_remote::protocol::{
    parse_query, AcquireLock, ErrorBody, Route, ERR_BAD_REQUEST, ERR_INTERNAL, ERR_LOCK_MISMATCH,
    ERR_NOT_FOUND, ERR_UNAUTHORIZED, PROTOCOL_HEADER,
};
use liftoff_remote::PROTOCOL_VERSION;
use liftoff_schema::{
    validate_name, LockKey, LockScope, LockToken, RecordKey, RecordKind, SchemaError,
};
use liftoff_store::{FileStateTree, StoreError};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tiny_http::{Header, Method, Response, Server, StatusCode};
use tracing::{debug, error, info, warn};

/// Tenant directory used when a request carries no `account_id`.
pub const DEFAULT_ACCOUNT: &str = "default";

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {reason}")]
    Bind { addr: String, reason: String },
    #[error("server I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Data directory and access policy shared by every request handler.
#[derive(Debug, Clone)]
pub struct Store {
    data_dir: PathBuf,
    auth_token: Option<String>,
}

impl Store {
    pub fn new(data_dir: PathBuf) -> Self {
        Self {
            data_dir,
            auth_token: None,
        }
    }

    /// Require `Authorization: Bearer {token}` on every request but `/health`.
    #[must_use]
    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// The state tree of one tenant.
    pub fn tree(&self, account: Option<&str>) -> Result<FileStateTree, SchemaError> {
        let account = account.unwrap_or(DEFAULT_ACCOUNT);
        validate_name("account", account)?;
        Ok(FileStateTree::new(self.data_dir.join(account)))
    }

    fn authorized(&self, authorization: Option<&str>) -> bool {
        match &self.auth_token {
            None => true,
            Some(expected) => authorization
                .and_then(|value| value.strip_prefix("Bearer "))
                .is_some_and(|token| token == expected),
        }
    }
}

/// A request reduced to what the handlers look at.
#[derive(Debug, Clone)]
pub struct Incoming<'a> {
    pub method: Method,
    /// Path plus optional `?query`.
    pub url: &'a str,
    pub authorization: Option<&'a str>,
    pub protocol: Option<&'a str>,
    pub body: Vec<u8>,
}

/// Status, content type and body of a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub status: u16,
    pub content_type: &'static str,
    pub body: Vec<u8>,
}

impl Reply {
    fn json<T: serde::Serialize>(status: u16, value: &T) -> Self {
        match serde_json::to_vec(value) {
            Ok(body) => Self {
                status,
                content_type: "application/json",
                body,
            },
            Err(e) => Self::error(500, &ErrorBody::new(ERR_INTERNAL, e.to_string())),
        }
    }

    fn raw(body: Vec<u8>) -> Self {
        Self {
            status: 200,
            content_type: "application/json",
            body,
        }
    }

    fn empty() -> Self {
        Self {
            status: 204,
            content_type: "text/plain",
            body: Vec::new(),
        }
    }

    fn error(status: u16, body: &ErrorBody) -> Self {
        Self {
            status,
            content_type: "application/json",
            body: serde_json::to_vec(body).unwrap_or_default(),
        }
    }
}

enum Failure {
    BadRequest(String),
    NotFound(String),
    Store(StoreError),
}

impl From<StoreError> for Failure {
    fn from(e: StoreError) -> Self {
        Failure::Store(e)
    }
}

impl From<SchemaError> for Failure {
    fn from(e: SchemaError) -> Self {
        Failure::BadRequest(e.to_string())
    }
}

impl From<serde_json::Error> for Failure {
    fn from(e: serde_json::Error) -> Self {
        Failure::BadRequest(format!("invalid JSON body: {e}"))
    }
}

impl Failure {
    fn into_reply(self) -> Reply {
        match self {
            Failure::BadRequest(msg) => Reply::error(400, &ErrorBody::new(ERR_BAD_REQUEST, msg)),
            Failure::NotFound(what) => {
                Reply::error(404, &ErrorBody::new(ERR_NOT_FOUND, format!("{what} not found")))
            }
            Failure::Store(e) => store_failure(e),
        }
    }
}

fn store_failure(e: StoreError) -> Reply {
    match e {
        StoreError::LockHeld(lock) => Reply::error(409, &ErrorBody::lock_held(*lock)),
        StoreError::LockMismatch { key } => Reply::error(
            409,
            &ErrorBody::new(ERR_LOCK_MISMATCH, format!("token is not the live lock on {key}")),
        ),
        StoreError::NotFound(what) => {
            Reply::error(404, &ErrorBody::new(ERR_NOT_FOUND, format!("{what} not found")))
        }
        StoreError::Schema(e) => Reply::error(400, &ErrorBody::new(ERR_BAD_REQUEST, e.to_string())),
        other => {
            error!("state tree failure: {other}");
            Reply::error(500, &ErrorBody::new(ERR_INTERNAL, other.to_string()))
        }
    }
}

/// Route one request against the tenant's state tree.
pub fn dispatch(store: &Store, req: &Incoming<'_>) -> Reply {
    let (path, query) = req.url.split_once('?').unwrap_or((req.url, ""));
    if req.method == Method::Get && path == "/health" {
        return Reply::json(200, &serde_json::json!({"status": "ok"}));
    }
    if !store.authorized(req.authorization) {
        return Reply::error(
            401,
            &ErrorBody::new(ERR_UNAUTHORIZED, "missing or invalid bearer token"),
        );
    }
    if let Some(version) = req.protocol {
        if version.trim().parse::<u32>().ok() != Some(PROTOCOL_VERSION) {
            return Reply::error(
                400,
                &ErrorBody::new(
                    ERR_BAD_REQUEST,
                    format!("unsupported protocol version '{version}'"),
                ),
            );
        }
    }
    let Some(route) = Route::parse(path) else {
        return Failure::NotFound(path.to_owned()).into_reply();
    };
    let query = parse_query(query);
    handle_route(store, req, &route, &query).unwrap_or_else(Failure::into_reply)
}

fn handle_route(
    store: &Store,
    req: &Incoming<'_>,
    route: &Route,
    query: &HashMap<String, String>,
) -> Result<Reply, Failure> {
    check_names(route)?;
    let tree = store.tree(query.get("account_id").map(String::as_str))?;
    match (route, &req.method) {
        (Route::Environments { project }, Method::Get) => {
            Ok(Reply::json(200, &tree.list_environments(project)?))
        }
        (
            Route::Collection {
                project,
                environment,
                kind,
            },
            Method::Get,
        ) => Ok(Reply::json(200, &tree.list(project, environment, *kind)?)),
        (
            Route::Environment {
                project,
                environment,
            },
            method,
        ) => record(&tree, req, query, &RecordKey::environment(project, environment), method),
        (Route::Record(key), method) => record(&tree, req, query, key, method),
        (
            Route::Locks {
                project,
                environment,
            },
            Method::Post,
        ) => {
            let body: AcquireLock = serde_json::from_slice(&req.body)?;
            let key = LockKey {
                project: project.clone(),
                environment: environment.clone(),
                scope: body.scope,
            };
            check_scope(&key.scope)?;
            let lock = tree.acquire_lock(&key, &body.request)?;
            info!(lock = %key, holder = %lock.holder, operation = %lock.operation, "lock acquired");
            Ok(Reply::json(201, &lock))
        }
        (Route::Lock(key), Method::Get) => match tree.read_lock(key)? {
            Some(lock) => Ok(Reply::json(200, &lock)),
            None => Err(Failure::NotFound(key.to_string())),
        },
        (Route::Lock(key), Method::Delete) => {
            if query.get("force").is_some_and(|v| v == "true") {
                return match tree.force_release_lock(key)? {
                    Some(lock) => {
                        warn!(lock = %key, holder = %lock.holder, "lock force-released");
                        Ok(Reply::json(200, &lock))
                    }
                    None => Ok(Reply::empty()),
                };
            }
            let token = lock_id(query)?;
            if tree.read_lock(key)?.is_none() {
                return Err(Failure::NotFound(key.to_string()));
            }
            tree.release_lock(key, &token)?;
            debug!(lock = %key, "lock released");
            Ok(Reply::empty())
        }
        (Route::EngineState(key), method) => match method {
            Method::Get => match tree.read_engine_state(key)? {
                Some(bytes) => Ok(Reply::raw(bytes)),
                None => Err(Failure::NotFound(format!("engine state of {key}"))),
            },
            // The engine's http backend expects 200 on writes.
            Method::Post => {
                tree.write_engine_state(key, &req.body, &lock_id(query)?)?;
                Ok(Reply::json(200, &serde_json::json!({})))
            }
            Method::Delete => {
                tree.remove_engine_state(key, &lock_id(query)?)?;
                Ok(Reply::json(200, &serde_json::json!({})))
            }
            _ => Err(method_not_allowed(method)),
        },
        (_, method) => Err(method_not_allowed(method)),
    }
}

fn method_not_allowed(method: &Method) -> Failure {
    Failure::BadRequest(format!("method {method} not allowed on this route"))
}

fn record(
    tree: &FileStateTree,
    req: &Incoming<'_>,
    query: &HashMap<String, String>,
    key: &RecordKey,
    method: &Method,
) -> Result<Reply, Failure> {
    match method {
        Method::Get => match tree.read(key)? {
            Some(bytes) => Ok(Reply::raw(bytes)),
            None => Err(Failure::NotFound(key.to_string())),
        },
        Method::Post => {
            serde_json::from_slice::<serde_json::Value>(&req.body)?;
            tree.write(key, &req.body, &lock_id(query)?)?;
            debug!(record = %key, bytes = req.body.len(), "record written");
            Ok(Reply::empty())
        }
        Method::Delete => {
            tree.remove(key, &lock_id(query)?)?;
            debug!(record = %key, "record removed");
            Ok(Reply::empty())
        }
        _ => Err(method_not_allowed(method)),
    }
}

fn lock_id(query: &HashMap<String, String>) -> Result<LockToken, Failure> {
    match query.get("lock_id") {
        Some(id) if !id.is_empty() => Ok(LockToken::from(id.as_str())),
        _ => Err(Failure::BadRequest("lock_id is required".to_owned())),
    }
}

/// Path segments become directory names; only valid names get that far.
fn check_names(route: &Route) -> Result<(), Failure> {
    let (project, environment) = match route {
        Route::Environments { project } => (project, None),
        Route::Environment {
            project,
            environment,
        }
        | Route::Collection {
            project,
            environment,
            ..
        }
        | Route::Locks {
            project,
            environment,
        } => (project, Some(environment)),
        Route::Record(key) | Route::EngineState(key) => {
            if let Some(name) = &key.name {
                let what = match key.kind {
                    RecordKind::Service => "service",
                    _ => "resource",
                };
                validate_name(what, name)?;
            }
            (&key.project, Some(&key.environment))
        }
        Route::Lock(key) => {
            check_scope(&key.scope)?;
            (&key.project, Some(&key.environment))
        }
    };
    validate_name("project", project)?;
    if let Some(environment) = environment {
        validate_name("environment", environment)?;
    }
    Ok(())
}

fn check_scope(scope: &LockScope) -> Result<(), Failure> {
    match scope {
        LockScope::Environment => Ok(()),
        LockScope::Resource(name) => Ok(validate_name("resource", name)?),
        LockScope::Service(name) => Ok(validate_name("service", name)?),
    }
}

fn header_value<'r>(req: &'r tiny_http::Request, name: &'static str) -> Option<&'r str> {
    req.headers()
        .iter()
        .find(|h| h.field.equiv(name))
        .map(|h| h.value.as_str())
}

fn respond(req: tiny_http::Request, reply: Reply) {
    let mut response = Response::from_data(reply.body).with_status_code(StatusCode(reply.status));
    if let Ok(header) = Header::from_bytes("Content-Type", reply.content_type) {
        response = response.with_header(header);
    }
    let _ = req.respond(response);
}

/// Handle a single HTTP request.
pub fn handle_request(store: &Store, mut req: tiny_http::Request) {
    let mut body = Vec::new();
    if let Err(e) = req.as_reader().read_to_end(&mut body) {
        let reply = Reply::error(400, &ErrorBody::new(ERR_BAD_REQUEST, e.to_string()));
        respond(req, reply);
        return;
    }
    let reply = {
        let incoming = Incoming {
            method: req.method().clone(),
            url: req.url(),
            authorization: header_value(&req, "Authorization"),
            protocol: header_value(&req, PROTOCOL_HEADER),
            body,
        };
        let reply = dispatch(store, &incoming);
        debug!("{} {} -> {}", incoming.method, incoming.url, reply.status);
        reply
    };
    respond(req, reply);
}

/// Serve requests on `addr` until the process exits.
pub fn run_server(store: &Arc<Store>, addr: &str) -> Result<(), ServerError> {
    let server = Server::http(addr).map_err(|e| ServerError::Bind {
        addr: addr.to_owned(),
        reason: e.to_string(),
    })?;
    info!("liftoff-server listening on {addr}");
    for request in server.incoming_requests() {
        handle_request(store, request);
    }
    Ok(())
}

/// A test helper that starts a liftoff-server on a random port in a background thread.
///
/// The server listens on `127.0.0.1:{port}` and keeps its state in `data_dir`.
/// Dropping the `TestServer` stops the server.
pub struct TestServer {
    pub url: String,
    pub port: u16,
    pub data_dir: PathBuf,
    server: Arc<Server>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl TestServer {
    /// Start a test server without authentication.
    pub fn start(data_dir: PathBuf) -> Result<Self, ServerError> {
        Self::start_with(Store::new(data_dir))
    }

    /// Start a test server with a configured [`Store`].
    pub fn start_with(store: Store) -> Result<Self, ServerError> {
        fs::create_dir_all(store.data_dir())?;
        let addr = "127.0.0.1:0";
        let server = Arc::new(Server::http(addr).map_err(|e| ServerError::Bind {
            addr: addr.to_owned(),
            reason: e.to_string(),
        })?);
        let port = server
            .server_addr()
            .to_ip()
            .map(|a| a.port())
            .ok_or_else(|| ServerError::Bind {
                addr: addr.to_owned(),
                reason: "not an IP listener".to_owned(),
            })?;
        let url = format!("http://127.0.0.1:{port}");
        let data_dir = store.data_dir().to_path_buf();

        let srv = Arc::clone(&server);
        let handle = std::thread::spawn(move || {
            for request in srv.incoming_requests() {
                handle_request(&store, request);
            }
        });

        Ok(Self {
            url,
            port,
            data_dir,
            server,
            handle: Some(handle),
        })
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.server.unblock();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
