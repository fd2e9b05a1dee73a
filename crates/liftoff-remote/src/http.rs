use crate::protocol::{
    AcquireLock, ErrorBody, Route, ERR_LOCK_HELD, ERR_LOCK_MISMATCH, PROTOCOL_HEADER,
};
use crate::{RemoteConfig, RemoteError};
use async_trait::async_trait;
use liftoff_schema::{
    EnvName, Lock, LockKey, LockRequest, LockToken, ProjectName, RecordKey, RecordKind,
};
use liftoff_store::{StateBackend, StoreError};
use std::io::Read;
use std::sync::Arc;

/// Blocking client for the v1 state API.
pub struct HttpClient {
    config: RemoteConfig,
    agent: ureq::Agent,
}

struct Reply {
    status: u16,
    body: Vec<u8>,
}

impl HttpClient {
    pub fn new(config: RemoteConfig) -> Self {
        // Status codes are protocol data here (409 carries the holder).
        let agent_config = ureq::Agent::config_builder()
            .http_status_as_error(false)
            .build();
        Self {
            config,
            agent: ureq::Agent::new_with_config(agent_config),
        }
    }

    pub fn config(&self) -> &RemoteConfig {
        &self.config
    }

    fn url(&self, route: &Route) -> String {
        format!("{}{}", self.config.url, route.path())
    }

    fn prepare<B>(&self, mut req: ureq::RequestBuilder<B>) -> ureq::RequestBuilder<B> {
        req = req.header(PROTOCOL_HEADER, &crate::PROTOCOL_VERSION.to_string());
        if let Some(ref token) = self.config.auth_token {
            req = req.header("Authorization", &format!("Bearer {token}"));
        }
        if let Some(ref account) = self.config.account_id {
            req = req.query("account_id", account);
        }
        req
    }

    fn finish(
        result: Result<ureq::http::Response<ureq::Body>, ureq::Error>,
    ) -> Result<Reply, RemoteError> {
        let resp = result.map_err(|e| RemoteError::Http(e.to_string()))?;
        let status = resp.status().as_u16();
        let mut body = Vec::new();
        resp.into_body()
            .into_reader()
            .read_to_end(&mut body)
            .map_err(|e| RemoteError::Http(e.to_string()))?;
        Ok(Reply { status, body })
    }

    fn get(&self, route: &Route) -> Result<Reply, RemoteError> {
        let url = self.url(route);
        tracing::debug!("GET {url}");
        Self::finish(self.prepare(self.agent.get(&url)).call())
    }

    fn post(&self, route: &Route, query: &[(&str, &str)], body: &[u8]) -> Result<Reply, RemoteError> {
        let url = self.url(route);
        tracing::debug!("POST {url} ({} bytes)", body.len());
        let mut req = self
            .prepare(self.agent.post(&url))
            .header("Content-Type", "application/json");
        for (k, v) in query {
            req = req.query(*k, *v);
        }
        Self::finish(req.send(body))
    }

    fn delete(&self, route: &Route, query: &[(&str, &str)]) -> Result<Reply, RemoteError> {
        let url = self.url(route);
        tracing::debug!("DELETE {url}");
        let mut req = self.prepare(self.agent.delete(&url));
        for (k, v) in query {
            req = req.query(*k, *v);
        }
        Self::finish(req.call())
    }

    /// Map a non-success reply to the store's error vocabulary.
    fn failure(&self, route: &Route, reply: &Reply, lock_key: Option<&LockKey>) -> StoreError {
        let parsed: Option<ErrorBody> = serde_json::from_slice(&reply.body).ok();
        let message = parsed
            .as_ref()
            .and_then(|b| b.message.clone())
            .unwrap_or_else(|| String::from_utf8_lossy(&reply.body).into_owned());
        match (reply.status, parsed) {
            (409, Some(ErrorBody { error, lock: Some(lock), .. })) if error == ERR_LOCK_HELD => {
                StoreError::LockHeld(Box::new(lock))
            }
            (409, Some(ErrorBody { error, .. })) if error == ERR_LOCK_MISMATCH => {
                StoreError::LockMismatch {
                    key: lock_key.map_or_else(|| route.path(), ToString::to_string),
                }
            }
            (404, _) => StoreError::NotFound(route.path()),
            (status, _) => StoreError::Backend(format!(
                "HTTP {status} for {}: {message}",
                self.url(route)
            )),
        }
    }

    pub fn acquire_lock(&self, key: &LockKey, request: &LockRequest) -> Result<Lock, StoreError> {
        let route = Route::Locks {
            project: key.project.clone(),
            environment: key.environment.clone(),
        };
        let body = serde_json::to_vec(&AcquireLock {
            scope: key.scope.clone(),
            request: request.clone(),
        })?;
        let reply = self.post(&route, &[], &body)?;
        match reply.status {
            200 | 201 => Ok(serde_json::from_slice(&reply.body)?),
            _ => Err(self.failure(&route, &reply, Some(key))),
        }
    }

    pub fn release_lock(&self, key: &LockKey, token: &LockToken) -> Result<(), StoreError> {
        let route = Route::Lock(key.clone());
        let reply = self.delete(&route, &[("lock_id", token.as_str())])?;
        match reply.status {
            200 | 204 => Ok(()),
            // Nothing to release means the token is not live.
            404 => Err(StoreError::LockMismatch {
                key: key.to_string(),
            }),
            _ => Err(self.failure(&route, &reply, Some(key))),
        }
    }

    pub fn force_release_lock(&self, key: &LockKey) -> Result<Option<Lock>, StoreError> {
        let route = Route::Lock(key.clone());
        let reply = self.delete(&route, &[("force", "true")])?;
        match reply.status {
            200 => Ok(Some(serde_json::from_slice(&reply.body)?)),
            204 | 404 => Ok(None),
            _ => Err(self.failure(&route, &reply, Some(key))),
        }
    }

    pub fn read_lock(&self, key: &LockKey) -> Result<Option<Lock>, StoreError> {
        let route = Route::Lock(key.clone());
        let reply = self.get(&route)?;
        match reply.status {
            200 => Ok(Some(serde_json::from_slice(&reply.body)?)),
            404 => Ok(None),
            _ => Err(self.failure(&route, &reply, Some(key))),
        }
    }

    pub fn read(&self, key: &RecordKey) -> Result<Option<Vec<u8>>, StoreError> {
        let route = Route::for_record(key);
        let reply = self.get(&route)?;
        match reply.status {
            200 => Ok(Some(reply.body)),
            404 => Ok(None),
            _ => Err(self.failure(&route, &reply, None)),
        }
    }

    pub fn write(&self, key: &RecordKey, data: &[u8], token: &LockToken) -> Result<(), StoreError> {
        let route = Route::for_record(key);
        let reply = self.post(&route, &[("lock_id", token.as_str())], data)?;
        match reply.status {
            200 | 201 | 204 => Ok(()),
            _ => Err(self.failure(&route, &reply, Some(&key.lock_key()))),
        }
    }

    pub fn remove(&self, key: &RecordKey, token: &LockToken) -> Result<(), StoreError> {
        let route = Route::for_record(key);
        let reply = self.delete(&route, &[("lock_id", token.as_str())])?;
        match reply.status {
            200 | 204 | 404 => Ok(()),
            _ => Err(self.failure(&route, &reply, Some(&key.lock_key()))),
        }
    }

    pub fn list(&self, route: &Route) -> Result<Vec<String>, StoreError> {
        let reply = self.get(route)?;
        match reply.status {
            200 => Ok(serde_json::from_slice(&reply.body)?),
            404 => Ok(Vec::new()),
            _ => Err(self.failure(route, &reply, None)),
        }
    }
}

/// [`StateBackend`] over the remote control-plane API.
///
/// ureq is blocking, so every call runs on tokio's blocking pool.
pub struct HttpStateBackend {
    client: Arc<HttpClient>,
}

impl HttpStateBackend {
    pub fn new(config: RemoteConfig) -> Self {
        Self {
            client: Arc::new(HttpClient::new(config)),
        }
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&HttpClient) -> Result<T, StoreError> + Send + 'static,
    {
        let client = Arc::clone(&self.client);
        tokio::task::spawn_blocking(move || f(&client))
            .await
            .map_err(|e| StoreError::Backend(format!("http task failed: {e}")))?
    }
}

#[async_trait]
impl StateBackend for HttpStateBackend {
    fn name(&self) -> &str {
        "remote"
    }

    async fn acquire_lock(&self, key: &LockKey, request: &LockRequest) -> Result<Lock, StoreError> {
        let (key, request) = (key.clone(), request.clone());
        self.blocking(move |c| c.acquire_lock(&key, &request)).await
    }

    async fn release_lock(&self, key: &LockKey, token: &LockToken) -> Result<(), StoreError> {
        let (key, token) = (key.clone(), token.clone());
        self.blocking(move |c| c.release_lock(&key, &token)).await
    }

    async fn force_release_lock(&self, key: &LockKey) -> Result<Option<Lock>, StoreError> {
        let key = key.clone();
        self.blocking(move |c| c.force_release_lock(&key)).await
    }

    async fn read_lock(&self, key: &LockKey) -> Result<Option<Lock>, StoreError> {
        let key = key.clone();
        self.blocking(move |c| c.read_lock(&key)).await
    }

    async fn read(&self, key: &RecordKey) -> Result<Option<Vec<u8>>, StoreError> {
        let key = key.clone();
        self.blocking(move |c| c.read(&key)).await
    }

    async fn write(
        &self,
        key: &RecordKey,
        data: Vec<u8>,
        token: &LockToken,
    ) -> Result<(), StoreError> {
        let (key, token) = (key.clone(), token.clone());
        self.blocking(move |c| c.write(&key, &data, &token)).await
    }

    async fn remove(&self, key: &RecordKey, token: &LockToken) -> Result<(), StoreError> {
        let (key, token) = (key.clone(), token.clone());
        self.blocking(move |c| c.remove(&key, &token)).await
    }

    async fn list(
        &self,
        project: &ProjectName,
        environment: &EnvName,
        kind: RecordKind,
    ) -> Result<Vec<String>, StoreError> {
        let route = match kind {
            RecordKind::Environment => Route::Environments {
                project: project.clone(),
            },
            _ => Route::Collection {
                project: project.clone(),
                environment: environment.clone(),
                kind,
            },
        };
        self.blocking(move |c| c.list(&route)).await
    }

    async fn list_environments(&self, project: &ProjectName) -> Result<Vec<String>, StoreError> {
        let route = Route::Environments {
            project: project.clone(),
        };
        self.blocking(move |c| c.list(&route)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use liftoff_schema::OperationType;
    use std::collections::HashMap;
    use std::io::{BufRead, BufReader, Write};
    use std::net::TcpListener;
    use std::sync::Mutex;

    #[derive(Debug, Clone)]
    struct CapturedRequest {
        method: String,
        target: String,
        headers: HashMap<String, String>,
    }

    /// Answers every request with one canned response and records what it saw.
    struct CannedServer {
        url: String,
        requests: Arc<Mutex<Vec<CapturedRequest>>>,
        _handle: std::thread::JoinHandle<()>,
    }

    impl CannedServer {
        fn start(status: u16, body: &str) -> Self {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            let url = format!("http://{}", listener.local_addr().unwrap());
            let requests = Arc::new(Mutex::new(Vec::new()));
            let reqs = Arc::clone(&requests);
            let body = body.to_owned();
            let handle = std::thread::spawn(move || {
                for stream in listener.incoming() {
                    let Ok(mut stream) = stream else { break };
                    let mut reader = BufReader::new(stream.try_clone().unwrap());
                    let mut request_line = String::new();
                    if reader.read_line(&mut request_line).is_err() {
                        continue;
                    }
                    let parts: Vec<&str> = request_line.trim().splitn(3, ' ').collect();
                    let mut headers = HashMap::new();
                    let mut content_length = 0usize;
                    loop {
                        let mut line = String::new();
                        if reader.read_line(&mut line).is_err() || line.trim().is_empty() {
                            break;
                        }
                        if let Some((k, v)) = line.trim().split_once(": ") {
                            if k.eq_ignore_ascii_case("content-length") {
                                content_length = v.parse().unwrap_or(0);
                            }
                            headers.insert(k.to_lowercase(), v.to_owned());
                        }
                    }
                    let mut buf = vec![0u8; content_length];
                    let _ = std::io::Read::read_exact(&mut reader, &mut buf);
                    reqs.lock().unwrap().push(CapturedRequest {
                        method: parts.first().copied().unwrap_or_default().to_owned(),
                        target: parts.get(1).copied().unwrap_or_default().to_owned(),
                        headers,
                    });
                    let response = format!(
                        "HTTP/1.1 {status} X\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                        body.len()
                    );
                    let _ = stream.write_all(response.as_bytes());
                    let _ = stream.flush();
                }
            });
            Self {
                url,
                requests,
                _handle: handle,
            }
        }

        fn captured(&self) -> Vec<CapturedRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    fn names() -> (ProjectName, EnvName) {
        (ProjectName::new("shop"), EnvName::new("dev"))
    }

    #[test]
    fn requests_carry_protocol_auth_and_account() {
        let server = CannedServer::start(404, r#"{"error":"not_found"}"#);
        let client = HttpClient::new(
            RemoteConfig::new(&server.url)
                .with_token("secret-token-42")
                .with_account("acct-9"),
        );
        let (p, e) = names();
        assert!(client.read(&RecordKey::resource(&p, &e, "db")).unwrap().is_none());

        let reqs = server.captured();
        assert_eq!(reqs.len(), 1);
        let req = &reqs[0];
        assert_eq!(req.method, "GET");
        assert_eq!(
            req.target,
            "/v1/projects/shop/environments/dev/resources/db?account_id=acct-9"
        );
        assert_eq!(req.headers.get("x-liftoff-protocol").map(String::as_str), Some("1"));
        assert_eq!(
            req.headers.get("authorization").map(String::as_str),
            Some("Bearer secret-token-42")
        );
    }

    #[test]
    fn no_auth_header_without_token() {
        let server = CannedServer::start(200, "[]");
        let client = HttpClient::new(RemoteConfig::new(&server.url));
        let (p, _) = names();
        assert!(client
            .list(&Route::Environments { project: p })
            .unwrap()
            .is_empty());
        let reqs = server.captured();
        assert!(!reqs[0].headers.contains_key("authorization"));
        assert_eq!(reqs[0].target, "/v1/projects/shop/environments");
    }

    #[test]
    fn write_sends_lock_id() {
        let server = CannedServer::start(204, "");
        let client = HttpClient::new(RemoteConfig::new(&server.url));
        let (p, e) = names();
        let token = LockToken::new("tok123");
        client
            .write(&RecordKey::service(&p, &e, "api"), b"{}", &token)
            .unwrap();
        let reqs = server.captured();
        assert_eq!(reqs[0].method, "POST");
        assert_eq!(
            reqs[0].target,
            "/v1/projects/shop/environments/dev/services/api?lock_id=tok123"
        );
    }

    #[test]
    fn conflict_with_lock_maps_to_lock_held() {
        let (p, e) = names();
        let key = LockKey::resource(&p, &e, "db");
        let lock = LockRequest::new(OperationType::CreateResource)
            .with_holder("other@ci:1")
            .grant(&key, chrono_now());
        let body = serde_json::to_string(&ErrorBody::lock_held(lock)).unwrap();
        let server = CannedServer::start(409, &body);
        let client = HttpClient::new(RemoteConfig::new(&server.url));

        let err = client
            .acquire_lock(&key, &LockRequest::new(OperationType::CreateResource))
            .unwrap_err();
        assert_eq!(err.lock_holder().map(|l| l.holder.as_str()), Some("other@ci:1"));
    }

    #[test]
    fn conflict_without_lock_maps_to_mismatch() {
        let server = CannedServer::start(409, r#"{"error":"lock_mismatch"}"#);
        let client = HttpClient::new(RemoteConfig::new(&server.url));
        let (p, e) = names();
        let err = client
            .write(&RecordKey::resource(&p, &e, "db"), b"{}", &LockToken::new("stale"))
            .unwrap_err();
        assert!(matches!(err, StoreError::LockMismatch { ref key } if key == "shop/dev/resource:db"));
    }

    #[test]
    fn server_error_maps_to_backend() {
        let server = CannedServer::start(500, r#"{"error":"internal","message":"disk full"}"#);
        let client = HttpClient::new(RemoteConfig::new(&server.url));
        let (p, e) = names();
        let err = client.read_lock(&LockKey::environment(&p, &e)).unwrap_err();
        assert!(matches!(err, StoreError::Backend(ref m) if m.contains("disk full")));
    }

    #[test]
    fn connection_refused_returns_error() {
        let client = HttpClient::new(RemoteConfig::new("http://127.0.0.1:1"));
        let (p, e) = names();
        assert!(client.read(&RecordKey::environment(&p, &e)).is_err());
    }

    fn chrono_now() -> chrono::DateTime<chrono::Utc> {
        chrono::Utc::now()
    }
}
