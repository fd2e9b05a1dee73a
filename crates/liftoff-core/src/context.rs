use crate::CoreError;
use liftoff_remote::{HttpStateBackend, RemoteConfig};
use liftoff_runtime::mock::MockCloud;
use liftoff_runtime::{
    ArtifactRegistry, BuildService, ContainerTool, DockerCli, LogDir, LogSink, LogSinkFactory,
    MemoryLogs, MemorySink, ProvisioningEngine, ReleaseTarget, SourceStaging, StateLocation,
    TofuEngine,
};
use liftoff_schema::{
    BackendConfig, EnvName, EnvironmentRecord, ProjectConfig, ProjectName, Provider, RecordKey,
    Settings,
};
use liftoff_store::{
    BucketBackend, BucketProvider, DirectoryBucket, DirectoryBuckets, FileStateTree, LocalBackend,
    LockManager, OutputsCache, StateBackend, StateStore,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Build the state backend named by the `[backend]` table.
pub fn open_backend(config: &BackendConfig) -> Result<Arc<dyn StateBackend>, CoreError> {
    let backend: Arc<dyn StateBackend> = match config {
        BackendConfig::Local { path } => Arc::new(LocalBackend::new(path)),
        BackendConfig::Bucket { path, prefix } => {
            let mut backend = BucketBackend::new(DirectoryBucket::new(path));
            if let Some(prefix) = prefix {
                backend = backend.with_prefix(prefix);
            }
            Arc::new(backend)
        }
        BackendConfig::Remote { .. } => Arc::new(HttpStateBackend::new(remote_config(config)?)),
    };
    info!(backend = backend.name(), "state backend opened");
    Ok(backend)
}

/// Remote settings from the config file, completed from
/// `~/.config/liftoff/remote.json` when that exists.
fn remote_config(config: &BackendConfig) -> Result<RemoteConfig, CoreError> {
    let BackendConfig::Remote {
        url,
        account_id,
        auth_token,
    } = config
    else {
        return Err(CoreError::Remote(liftoff_remote::RemoteError::Config(
            "not a remote backend".to_owned(),
        )));
    };
    let mut remote = RemoteConfig::new(url);
    remote.account_id.clone_from(account_id);
    remote.auth_token.clone_from(auth_token);
    let defaults = RemoteConfig::load_default().ok();
    Ok(remote.or(defaults.as_ref()))
}

/// Where the provisioning engine keeps per-unit state, following the
/// record backend.
#[derive(Debug, Clone)]
pub enum EngineStateStore {
    Local(PathBuf),
    Bucket,
    ControlPlane(RemoteConfig),
}

impl EngineStateStore {
    pub fn for_backend(config: &BackendConfig) -> Result<Self, CoreError> {
        Ok(match config {
            BackendConfig::Local { path } => EngineStateStore::Local(path.clone()),
            BackendConfig::Bucket { .. } => EngineStateStore::Bucket,
            BackendConfig::Remote { .. } => EngineStateStore::ControlPlane(remote_config(config)?),
        })
    }

    pub fn location(&self, env: &EnvironmentView, key: &RecordKey, lock_id: &str) -> StateLocation {
        match self {
            EngineStateStore::Local(root) => StateLocation::Local {
                path: FileStateTree::new(root).engine_state_path(key),
            },
            EngineStateStore::Bucket => StateLocation::Bucket {
                provider: env.provider(),
                bucket: env.bucket().to_owned(),
                prefix: match &key.name {
                    Some(name) => format!(
                        "{}/{}/{}/{name}",
                        key.project,
                        key.environment,
                        key.kind.collection()
                    ),
                    None => format!("{}/{}/environment", key.project, key.environment),
                },
                region: env.record.provider_config.region.clone(),
            },
            EngineStateStore::ControlPlane(remote) => StateLocation::ControlPlane {
                url: remote.engine_state_url(key),
                lock_id: Some(lock_id.to_owned()),
            },
        }
    }
}

/// Provider SDK bindings for one cloud.
#[derive(Clone)]
pub struct ProviderBindings {
    pub staging: Arc<dyn SourceStaging>,
    pub builds: Arc<dyn BuildService>,
    pub registry: Arc<dyn ArtifactRegistry>,
    pub releases: Arc<dyn ReleaseTarget>,
}

impl ProviderBindings {
    pub fn mock(cloud: &Arc<MockCloud>) -> Self {
        Self {
            staging: cloud.clone(),
            builds: cloud.clone(),
            registry: cloud.clone(),
            releases: cloud.clone(),
        }
    }
}

/// External tools and provider bindings.
#[derive(Clone)]
pub struct Bindings {
    pub engine: Arc<dyn ProvisioningEngine>,
    pub containers: Arc<dyn ContainerTool>,
    providers: HashMap<Provider, ProviderBindings>,
}

impl Bindings {
    pub fn new(engine: Arc<dyn ProvisioningEngine>, containers: Arc<dyn ContainerTool>) -> Self {
        Self {
            engine,
            containers,
            providers: HashMap::new(),
        }
    }

    /// The `tofu`/`terraform` CLI and `docker`, with no provider bindings.
    pub fn local_tools(settings: &Settings) -> Self {
        Self::new(
            Arc::new(TofuEngine::new(&settings.engine, &settings.work_dir)),
            Arc::new(DockerCli::default()),
        )
    }

    #[must_use]
    pub fn with_provider(mut self, provider: Provider, bindings: ProviderBindings) -> Self {
        self.providers.insert(provider, bindings);
        self
    }

    pub fn provider(&self, provider: Provider) -> Result<&ProviderBindings, CoreError> {
        self.providers
            .get(&provider)
            .ok_or(CoreError::NoBindings(provider))
    }
}

/// Log destination; file logs live under `{log_dir}/{run_id}/`.
#[derive(Clone)]
pub enum LogTarget {
    Dir(PathBuf),
    Memory(Arc<MemoryLogs>),
}

/// A loaded environment record with its names.
#[derive(Debug, Clone)]
pub struct EnvironmentView {
    pub project: ProjectName,
    pub name: EnvName,
    pub record: EnvironmentRecord,
}

impl EnvironmentView {
    pub fn provider(&self) -> Provider {
        self.record.provider_config.provider
    }

    /// The artifact bucket: outputs cache and staged sources live here.
    pub fn bucket(&self) -> &str {
        &self.record.provider_config.artifact_bucket
    }
}

pub struct Context {
    config: Arc<ProjectConfig>,
    root: PathBuf,
    store: StateStore,
    locks: LockManager,
    buckets: Arc<dyn BucketProvider>,
    bindings: Bindings,
    logs: LogTarget,
    engine_state: EngineStateStore,
    cancel: CancellationToken,
}

impl Context {
    /// `root` is the directory holding `liftoff.toml`; relative build
    /// directories resolve against it.
    pub fn new(
        config: ProjectConfig,
        root: &Path,
        backend: Arc<dyn StateBackend>,
        bindings: Bindings,
    ) -> Result<Self, CoreError> {
        let locks = LockManager::new(backend.clone()).with_lease(config.settings.lock_lease());
        let engine_state = EngineStateStore::for_backend(&config.backend)?;
        Ok(Self {
            buckets: Arc::new(DirectoryBuckets::new(&config.settings.artifacts_dir)),
            logs: LogTarget::Dir(config.settings.log_dir.clone()),
            config: Arc::new(config),
            root: root.to_path_buf(),
            store: StateStore::new(backend),
            locks,
            bindings,
            engine_state,
            cancel: CancellationToken::new(),
        })
    }

    /// Open the backend named in the configuration.
    pub fn open(config: ProjectConfig, root: &Path, bindings: Bindings) -> Result<Self, CoreError> {
        let backend = open_backend(&config.backend)?;
        Self::new(config, root, backend, bindings)
    }

    #[must_use]
    pub fn with_buckets(mut self, buckets: Arc<dyn BucketProvider>) -> Self {
        self.buckets = buckets;
        self
    }

    #[must_use]
    pub fn with_logs(mut self, logs: LogTarget) -> Self {
        self.logs = logs;
        self
    }

    #[must_use]
    pub fn with_holder(mut self, holder: &str) -> Self {
        self.locks = self.locks.with_holder(holder);
        self
    }

    #[must_use]
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    #[must_use]
    pub fn with_engine_state(mut self, engine_state: EngineStateStore) -> Self {
        self.engine_state = engine_state;
        self
    }

    pub fn config(&self) -> &ProjectConfig {
        &self.config
    }

    pub fn settings(&self) -> &Settings {
        &self.config.settings
    }

    pub fn project(&self) -> &ProjectName {
        &self.config.project
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    pub fn buckets(&self) -> &Arc<dyn BucketProvider> {
        &self.buckets
    }

    pub fn bindings(&self) -> &Bindings {
        &self.bindings
    }

    pub fn engine_state(&self) -> &EngineStateStore {
        &self.engine_state
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub async fn environment(&self, name: &EnvName) -> Result<EnvironmentView, CoreError> {
        match self
            .store
            .get::<EnvironmentRecord>(&RecordKey::environment(self.project(), name))
            .await?
        {
            Some(record) => Ok(EnvironmentView {
                project: self.project().clone(),
                name: name.clone(),
                record,
            }),
            None => Err(CoreError::EnvironmentNotFound(name.to_string())),
        }
    }

    /// Start a run: fresh outputs cache, own log directory, child
    /// cancellation token.
    pub fn begin_run(self: &Arc<Self>) -> Run {
        let id = format!(
            "{}-{}",
            chrono::Utc::now().format("%Y%m%dT%H%M%SZ"),
            &uuid::Uuid::new_v4().simple().to_string()[..8]
        );
        let logs: Arc<dyn LogSinkFactory> = match &self.logs {
            LogTarget::Dir(dir) => Arc::new(LogDir::new(dir, &id)),
            LogTarget::Memory(logs) => logs.clone(),
        };
        Run {
            ctx: Arc::clone(self),
            outputs: Arc::new(OutputsCache::new(self.buckets.clone())),
            logs,
            cancel: self.cancel.child_token(),
            id,
        }
    }
}

/// One orchestrator invocation. The outputs cache lives exactly as long as
/// the run.
#[derive(Clone)]
pub struct Run {
    ctx: Arc<Context>,
    id: String,
    outputs: Arc<OutputsCache>,
    logs: Arc<dyn LogSinkFactory>,
    cancel: CancellationToken,
}

impl Run {
    pub fn ctx(&self) -> &Context {
        &self.ctx
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn outputs(&self) -> &OutputsCache {
        &self.outputs
    }

    pub fn cancel(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Log sink for one unit. A sink that cannot be opened degrades to an
    /// in-memory one rather than failing the unit.
    pub fn open_log(&self, unit: &str) -> Arc<dyn LogSink> {
        match self.logs.open(unit) {
            Ok(sink) => sink,
            Err(e) => {
                warn!(run = %self.id, unit, error = %e, "cannot open log file, logging to memory");
                Arc::new(MemorySink::new())
            }
        }
    }
}
