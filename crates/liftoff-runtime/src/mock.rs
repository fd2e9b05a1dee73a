//! In-memory bindings for every runtime seam.
//!
//! Deterministic: digests are blake3 hashes of the inputs, revisions and job
//! ids are counters. Failure knobs can be flipped at any time.

use crate::container::{repository_of, ContainerBuild, ContainerTool};
use crate::engine::{EngineRequest, ProvisioningEngine};
use crate::logs::LogSink;
use crate::provider::{
    ArtifactRegistry, BuildJob, BuildService, OperationStatus, RegistryCredentials, ReleaseRequest,
    ReleaseTarget, SourceStaging,
};
use crate::RuntimeError;
use async_trait::async_trait;
use liftoff_schema::{ArtifactRef, Outputs};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn mock_digest(parts: &[&[u8]]) -> String {
    let mut hasher = blake3::Hasher::new();
    for part in parts {
        hasher.update(part);
    }
    format!("sha256:{}", hasher.finalize().to_hex())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineOp {
    Apply,
    Destroy,
}

#[derive(Debug, Clone)]
pub struct EngineCall {
    pub op: EngineOp,
    pub unit: String,
    pub module: String,
    pub state: String,
    pub variables: BTreeMap<String, Value>,
}

#[derive(Default)]
struct EngineState {
    outputs: HashMap<String, Outputs>,
    failing: BTreeSet<String>,
    calls: Vec<EngineCall>,
}

/// Records every call; `apply` returns the outputs configured for the
/// module with `{resource_id}` substituted, plus a default `id`.
#[derive(Default)]
pub struct MockEngine {
    state: Mutex<EngineState>,
    delay: Option<Duration>,
}

impl MockEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Outputs returned for modules whose directory is named `module`.
    #[must_use]
    pub fn with_outputs(self, module: &str, outputs: &[(&str, &str)]) -> Self {
        lock(&self.state).outputs.insert(
            module.to_owned(),
            outputs
                .iter()
                .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
                .collect(),
        );
        self
    }

    /// Every apply and destroy sleeps this long first.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn fail_unit(&self, unit: &str) {
        lock(&self.state).failing.insert(unit.to_owned());
    }

    pub fn heal_unit(&self, unit: &str) {
        lock(&self.state).failing.remove(unit);
    }

    pub fn calls(&self) -> Vec<EngineCall> {
        lock(&self.state).calls.clone()
    }

    /// Units applied, in call order.
    pub fn applied(&self) -> Vec<String> {
        lock(&self.state)
            .calls
            .iter()
            .filter(|c| c.op == EngineOp::Apply)
            .map(|c| c.unit.clone())
            .collect()
    }

    fn record(&self, op: EngineOp, request: &EngineRequest) -> (String, bool) {
        let module = request
            .module_dir
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let mut state = lock(&self.state);
        state.calls.push(EngineCall {
            op,
            unit: request.unit.clone(),
            module: module.clone(),
            state: request.state.render(),
            variables: request.variables.clone(),
        });
        let failing = state.failing.contains(&request.unit);
        (module, failing)
    }
}

#[async_trait]
impl ProvisioningEngine for MockEngine {
    fn name(&self) -> &str {
        "mock"
    }

    async fn apply(&self, request: &EngineRequest, sink: &dyn LogSink) -> Result<Outputs, RuntimeError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let (module, failing) = self.record(EngineOp::Apply, request);
        sink.line(&format!("mock apply {}", request.unit));
        if failing {
            sink.line("Error: mock failure");
            return Err(RuntimeError::CommandFailed {
                program: "mock".to_owned(),
                step: "apply".to_owned(),
                status: Some(1),
            });
        }
        let resource_id = match request.variables.get("resource_id") {
            Some(Value::String(s)) => s.clone(),
            _ => request.unit.clone(),
        };
        let mut outputs = Outputs::new();
        outputs.insert("id".to_owned(), format!("{module}/{resource_id}"));
        if let Some(configured) = lock(&self.state).outputs.get(&module) {
            for (k, v) in configured {
                outputs.insert(k.clone(), v.replace("{resource_id}", &resource_id));
            }
        }
        Ok(outputs)
    }

    async fn destroy(&self, request: &EngineRequest, sink: &dyn LogSink) -> Result<(), RuntimeError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let (_, failing) = self.record(EngineOp::Destroy, request);
        sink.line(&format!("mock destroy {}", request.unit));
        if failing {
            return Err(RuntimeError::CommandFailed {
                program: "mock".to_owned(),
                step: "destroy".to_owned(),
                status: Some(1),
            });
        }
        Ok(())
    }
}

#[derive(Default)]
struct ContainerState {
    local: HashMap<String, String>,
    remote: HashMap<String, String>,
    logins: BTreeSet<String>,
    fail_build: bool,
    deny_login: bool,
}

/// A container CLI with a local image store and one shared remote registry.
#[derive(Default)]
pub struct MockContainerTool {
    state: Mutex<ContainerState>,
}

impl MockContainerTool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_build(&self, fail: bool) {
        lock(&self.state).fail_build = fail;
    }

    pub fn set_deny_login(&self, deny: bool) {
        lock(&self.state).deny_login = deny;
    }

    /// Digest the remote registry holds for `repo:tag`.
    pub fn remote_digest(&self, image: &str) -> Option<String> {
        lock(&self.state).remote.get(image).cloned()
    }

    pub fn logins(&self) -> Vec<String> {
        lock(&self.state).logins.iter().cloned().collect()
    }
}

#[async_trait]
impl ContainerTool for MockContainerTool {
    async fn login(
        &self,
        registry: &str,
        _credentials: &RegistryCredentials,
        _sink: &dyn LogSink,
    ) -> Result<(), RuntimeError> {
        let mut state = lock(&self.state);
        if state.deny_login {
            return Err(RuntimeError::Unauthorized(format!(
                "registry login to {registry} was rejected"
            )));
        }
        state.logins.insert(registry.to_owned());
        Ok(())
    }

    async fn build(&self, build: &ContainerBuild, sink: &dyn LogSink) -> Result<(), RuntimeError> {
        sink.line("Step 1/2 : FROM scratch");
        let mut state = lock(&self.state);
        if state.fail_build {
            sink.line("Step 2/2 : RUN make");
            sink.line("make: *** [all] Error 2");
            return Err(RuntimeError::CommandFailed {
                program: "mock-docker".to_owned(),
                step: "build".to_owned(),
                status: Some(2),
            });
        }
        let digest = mock_digest(&[build.context.as_slice(), build.dockerfile.as_bytes()]);
        for tag in &build.tags {
            state.local.insert(tag.clone(), digest.clone());
        }
        sink.line("Successfully built");
        Ok(())
    }

    async fn push(&self, image: &str, sink: &dyn LogSink) -> Result<String, RuntimeError> {
        let mut state = lock(&self.state);
        if !state.logins.iter().any(|r| image.starts_with(r.as_str())) {
            return Err(RuntimeError::Unauthorized(format!("not logged in for {image}")));
        }
        let digest = state
            .local
            .get(image)
            .cloned()
            .ok_or_else(|| RuntimeError::NotFound(format!("local image {image}")))?;
        state.remote.insert(image.to_owned(), digest.clone());
        sink.line(&format!("{image}: digest: {digest}"));
        Ok(digest)
    }

    async fn pull(&self, image: &str, sink: &dyn LogSink) -> Result<(), RuntimeError> {
        let mut state = lock(&self.state);
        let digest = match image.split_once('@') {
            Some((repo, digest)) => state
                .remote
                .iter()
                .any(|(name, d)| repository_of(name) == repo && d == digest)
                .then(|| digest.to_owned()),
            None => state.remote.get(image).cloned(),
        }
        .ok_or_else(|| RuntimeError::NotFound(format!("remote image {image}")))?;
        state.local.insert(image.to_owned(), digest);
        sink.line(&format!("pulled {image}"));
        Ok(())
    }

    async fn tag(&self, source: &str, target: &str, _sink: &dyn LogSink) -> Result<(), RuntimeError> {
        let mut state = lock(&self.state);
        let digest = state
            .local
            .get(source)
            .cloned()
            .ok_or_else(|| RuntimeError::NotFound(format!("local image {source}")))?;
        state.local.insert(target.to_owned(), digest);
        Ok(())
    }
}

struct MockJob {
    job: BuildJob,
    polls: u32,
}

#[derive(Default)]
struct CloudState {
    objects: BTreeMap<String, Vec<u8>>,
    jobs: HashMap<String, MockJob>,
    images: HashMap<String, String>,
    copies: HashMap<String, (ArtifactRef, String)>,
    releases: Vec<ReleaseRequest>,
    revisions: HashMap<String, u32>,
    next_id: u64,
    build_polls: u32,
    ready_polls: u32,
    transient_failures: u32,
    deny_credentials: bool,
    fail_builds: bool,
    fail_release: bool,
    never_ready: bool,
    corrupt_copies: bool,
}

/// One provider's staging bucket, build service, registry, and release
/// targets, all in memory.
pub struct MockCloud {
    state: Mutex<CloudState>,
}

impl Default for MockCloud {
    fn default() -> Self {
        Self {
            state: Mutex::new(CloudState {
                build_polls: 1,
                ready_polls: 1,
                ..CloudState::default()
            }),
        }
    }
}

impl MockCloud {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_deny_credentials(&self, deny: bool) {
        lock(&self.state).deny_credentials = deny;
    }

    pub fn set_fail_builds(&self, fail: bool) {
        lock(&self.state).fail_builds = fail;
    }

    pub fn set_fail_release(&self, fail: bool) {
        lock(&self.state).fail_release = fail;
    }

    pub fn set_never_ready(&self, never: bool) {
        lock(&self.state).never_ready = never;
    }

    /// Report a different digest than the source from registry copies.
    pub fn set_corrupt_copies(&self, corrupt: bool) {
        lock(&self.state).corrupt_copies = corrupt;
    }

    /// The next `n` status polls fail with a transient error.
    pub fn set_transient_failures(&self, n: u32) {
        lock(&self.state).transient_failures = n;
    }

    /// Pending polls before a build job finishes.
    pub fn set_build_polls(&self, polls: u32) {
        lock(&self.state).build_polls = polls;
    }

    /// Seed the registry with `repository:tag -> digest`.
    pub fn put_image(&self, repository: &str, tag: &str, digest: &str) {
        lock(&self.state)
            .images
            .insert(format!("{repository}:{tag}"), digest.to_owned());
    }

    pub fn image(&self, repository: &str, tag: &str) -> Option<String> {
        lock(&self.state).images.get(&format!("{repository}:{tag}")).cloned()
    }

    pub fn staged(&self) -> Vec<String> {
        lock(&self.state).objects.keys().cloned().collect()
    }

    pub fn releases(&self) -> Vec<ReleaseRequest> {
        lock(&self.state).releases.clone()
    }

    fn next_id(state: &mut CloudState, prefix: &str) -> String {
        state.next_id += 1;
        format!("{prefix}-{}", state.next_id)
    }

    fn take_transient(state: &mut CloudState, what: &str) -> Result<(), RuntimeError> {
        if state.transient_failures > 0 {
            state.transient_failures -= 1;
            return Err(RuntimeError::Transient(format!("{what}: 503 Service Unavailable")));
        }
        Ok(())
    }
}

#[async_trait]
impl SourceStaging for MockCloud {
    async fn upload(&self, bucket: &str, object: &str, data: Vec<u8>) -> Result<String, RuntimeError> {
        let uri = format!("mock://{bucket}/{object}");
        lock(&self.state).objects.insert(uri.clone(), data);
        Ok(uri)
    }
}

#[async_trait]
impl BuildService for MockCloud {
    async fn submit(&self, job: &BuildJob) -> Result<String, RuntimeError> {
        let mut state = lock(&self.state);
        if !state.objects.contains_key(&job.source_uri) {
            return Err(RuntimeError::NotFound(format!("staged source {}", job.source_uri)));
        }
        let id = Self::next_id(&mut state, "build");
        state.jobs.insert(
            id.clone(),
            MockJob {
                job: job.clone(),
                polls: 0,
            },
        );
        Ok(id)
    }

    async fn status(&self, job_id: &str) -> Result<OperationStatus<String>, RuntimeError> {
        let mut state = lock(&self.state);
        Self::take_transient(&mut state, "build status")?;
        let build_polls = state.build_polls;
        let fail = state.fail_builds;
        let entry = state
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| RuntimeError::NotFound(format!("build job {job_id}")))?;
        if entry.polls < build_polls {
            entry.polls += 1;
            return Ok(OperationStatus::Pending {
                detail: Some("WORKING".to_owned()),
            });
        }
        if fail {
            return Ok(OperationStatus::Failed {
                reason: "step 1 exited with status 2".to_owned(),
                log_url: Some(format!("mock://logs/{job_id}")),
            });
        }
        let job = entry.job.clone();
        let source = state.objects.get(&job.source_uri).cloned().unwrap_or_default();
        let digest = mock_digest(&[source.as_slice(), job.dockerfile.as_bytes()]);
        for image in &job.images {
            state.images.insert(image.clone(), digest.clone());
        }
        Ok(OperationStatus::Done(digest))
    }
}

#[async_trait]
impl ArtifactRegistry for MockCloud {
    async fn credentials(&self, repository: &str) -> Result<RegistryCredentials, RuntimeError> {
        if lock(&self.state).deny_credentials {
            return Err(RuntimeError::Unauthorized(format!(
                "caller may not access {repository}"
            )));
        }
        Ok(RegistryCredentials::new("oauth2accesstoken", "mock-token"))
    }

    async fn resolve(&self, repository: &str, tag: &str) -> Result<Option<String>, RuntimeError> {
        Ok(self.image(repository, tag))
    }

    async fn copy(
        &self,
        source: &ArtifactRef,
        target_repository: &str,
        target_tag: &str,
    ) -> Result<String, RuntimeError> {
        let mut state = lock(&self.state);
        if state.deny_credentials {
            return Err(RuntimeError::Unauthorized(format!(
                "caller may not write {target_repository}"
            )));
        }
        let known = state
            .images
            .iter()
            .any(|(name, d)| repository_of(name) == source.repository && *d == source.digest);
        if !known {
            return Err(RuntimeError::NotFound(format!("image {}", source.pinned())));
        }
        let id = Self::next_id(&mut state, "copy");
        state.copies.insert(
            id.clone(),
            (source.clone(), format!("{target_repository}:{target_tag}")),
        );
        Ok(id)
    }

    async fn copy_status(&self, operation: &str) -> Result<OperationStatus<String>, RuntimeError> {
        let mut state = lock(&self.state);
        Self::take_transient(&mut state, "copy status")?;
        let (source, target) = state
            .copies
            .get(operation)
            .cloned()
            .ok_or_else(|| RuntimeError::NotFound(format!("copy operation {operation}")))?;
        let digest = if state.corrupt_copies {
            mock_digest(&[source.digest.as_bytes(), b"corrupt".as_slice()])
        } else {
            source.digest
        };
        state.images.insert(target, digest.clone());
        Ok(OperationStatus::Done(digest))
    }
}

#[async_trait]
impl ReleaseTarget for MockCloud {
    async fn update(&self, request: &ReleaseRequest) -> Result<String, RuntimeError> {
        let mut state = lock(&self.state);
        if state.fail_release {
            return Err(RuntimeError::Provider(format!(
                "release target {} rejected the update",
                request.target
            )));
        }
        state.releases.push(request.clone());
        let n = state.next_id + 1;
        state.next_id = n;
        let revision = format!("{}-{n:05}", request.target);
        state.revisions.insert(revision.clone(), 0);
        Ok(revision)
    }

    async fn readiness(&self, target: &str, revision: &str) -> Result<OperationStatus<String>, RuntimeError> {
        let mut state = lock(&self.state);
        Self::take_transient(&mut state, "readiness")?;
        let never_ready = state.never_ready;
        let ready_polls = state.ready_polls;
        let polls = state
            .revisions
            .get_mut(revision)
            .ok_or_else(|| RuntimeError::NotFound(format!("revision {revision}")))?;
        if never_ready || *polls < ready_polls {
            *polls += 1;
            return Ok(OperationStatus::Pending {
                detail: Some("rollout in progress".to_owned()),
            });
        }
        Ok(OperationStatus::Done(format!("https://{target}.mock.run")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::StateLocation;
    use crate::logs::MemorySink;
    use liftoff_schema::DeploymentId;
    use std::path::PathBuf;

    fn request(unit: &str, module: &str) -> EngineRequest {
        let mut variables = BTreeMap::new();
        variables.insert("resource_id".to_owned(), Value::String(unit.to_owned()));
        EngineRequest {
            unit: unit.to_owned(),
            module_dir: PathBuf::from("/modules").join(module),
            state: StateLocation::Local {
                path: PathBuf::from("/state").join(unit),
            },
            variables,
        }
    }

    #[tokio::test]
    async fn engine_apply_is_idempotent() {
        let engine = MockEngine::new().with_outputs("sql", &[("url", "postgres://{resource_id}")]);
        let sink = MemorySink::new();
        let a = engine.apply(&request("db", "sql"), &sink).await.unwrap();
        let b = engine.apply(&request("db", "sql"), &sink).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a["url"], "postgres://db");
        assert_eq!(a["id"], "sql/db");
        assert_eq!(engine.applied(), vec!["db", "db"]);
    }

    #[tokio::test]
    async fn engine_failure_knob() {
        let engine = MockEngine::new();
        engine.fail_unit("db");
        let sink = MemorySink::new();
        assert!(engine.apply(&request("db", "sql"), &sink).await.is_err());
        engine.heal_unit("db");
        assert!(engine.apply(&request("db", "sql"), &sink).await.is_ok());
    }

    #[tokio::test]
    async fn container_build_push_pull_retag() {
        let docker = MockContainerTool::new();
        let sink = MemorySink::new();
        let creds = RegistryCredentials::new("u", "p");
        docker.login("reg/dev/app", &creds, &sink).await.unwrap();
        docker
            .build(
                &ContainerBuild {
                    context: b"ctx".to_vec(),
                    dockerfile: "Dockerfile".to_owned(),
                    tags: vec!["reg/dev/app:1".to_owned()],
                    cache_from: vec![],
                },
                &sink,
            )
            .await
            .unwrap();
        let digest = docker.push("reg/dev/app:1", &sink).await.unwrap();
        assert_eq!(docker.remote_digest("reg/dev/app:1"), Some(digest.clone()));

        let pinned = format!("reg/dev/app@{digest}");
        docker.pull(&pinned, &sink).await.unwrap();
        docker.tag(&pinned, "reg/prod/app:2", &sink).await.unwrap();
        docker.login("reg/prod/app", &creds, &sink).await.unwrap();
        assert_eq!(docker.push("reg/prod/app:2", &sink).await.unwrap(), digest);
    }

    #[tokio::test]
    async fn push_requires_login() {
        let docker = MockContainerTool::new();
        let sink = MemorySink::new();
        assert!(matches!(
            docker.push("reg/app:1", &sink).await,
            Err(RuntimeError::Unauthorized(_))
        ));
    }

    #[tokio::test]
    async fn cloud_build_polls_then_publishes() {
        let cloud = MockCloud::new();
        let uri = cloud.upload("bucket", "builds/api/1.tar", b"src".to_vec()).await.unwrap();
        let id = cloud
            .submit(&BuildJob {
                source_uri: uri,
                dockerfile: "Dockerfile".to_owned(),
                images: vec!["reg/app:1".to_owned(), "reg/app:latest".to_owned()],
                cache_from: None,
                region: "r".to_owned(),
                identity: "i".to_owned(),
            })
            .await
            .unwrap();
        assert!(!cloud.status(&id).await.unwrap().is_terminal());
        let OperationStatus::Done(digest) = cloud.status(&id).await.unwrap() else {
            panic!("build should be done");
        };
        assert_eq!(cloud.image("reg/app", "latest"), Some(digest.clone()));
        assert_eq!(cloud.image("reg/app", "1"), Some(digest));
    }

    #[tokio::test]
    async fn cloud_release_and_readiness() {
        let cloud = MockCloud::new();
        let req = ReleaseRequest {
            target: "api-svc".to_owned(),
            image: "reg/app@sha256:1".to_owned(),
            deployment_id: DeploymentId::from_millis(1),
            region: "r".to_owned(),
            identity: "i".to_owned(),
            inputs: BTreeMap::new(),
        };
        let rev = cloud.update(&req).await.unwrap();
        assert!(!cloud.readiness("api-svc", &rev).await.unwrap().is_terminal());
        assert_eq!(
            cloud.readiness("api-svc", &rev).await.unwrap(),
            OperationStatus::Done("https://api-svc.mock.run".to_owned())
        );
        cloud.set_transient_failures(1);
        assert!(cloud.readiness("api-svc", &rev).await.unwrap_err().is_transient());
    }
}
