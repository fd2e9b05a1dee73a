use crate::catalog::{ProductCatalog, ProductKind, SERVICE_REQUIRED_OUTPUTS};
use crate::inputs::{referenced_resources, Inputs};
use crate::types::{validate_name, ProjectName};
use crate::SchemaError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const CONFIG_FILE_NAME: &str = "liftoff.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    ParseToml(#[from] toml::de::Error),
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error("duplicate {what} name '{name}'")]
    DuplicateName { what: &'static str, name: String },
    #[error("{unit}: unknown product '{product}'")]
    UnknownProduct { unit: String, product: String },
    #[error("{unit}: product '{product}' is a {actual:?} product, expected {expected:?}")]
    ProductKindMismatch {
        unit: String,
        product: String,
        expected: ProductKind,
        actual: ProductKind,
    },
    #[error("{unit}: depends on unknown resource '{dependency}'")]
    UnknownDependency { unit: String, dependency: String },
    #[error("service product '{product}' must declare outputs: {}", missing.join(", "))]
    MissingServiceOutputs {
        product: String,
        missing: Vec<String>,
    },
    #[error("product '{0}' has an empty module path")]
    EmptyModule(String),
    #[error("settings.concurrency must be at least 1")]
    ZeroConcurrency,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ProjectConfig {
    pub project: ProjectName,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub settings: Settings,
    #[serde(default)]
    pub products: ProductCatalog,
    #[serde(default)]
    pub resources: Vec<ResourceConfig>,
    #[serde(default)]
    pub services: Vec<ServiceConfig>,
}

/// Where records and locks are persisted.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum BackendConfig {
    /// Plain file tree on the local disk.
    Local { path: PathBuf },
    /// Versioned object storage (a directory-backed bucket locally).
    Bucket {
        path: PathBuf,
        #[serde(default)]
        prefix: Option<String>,
    },
    /// Remote control-plane API.
    Remote {
        url: String,
        #[serde(default)]
        account_id: Option<String>,
        #[serde(default)]
        auth_token: Option<String>,
    },
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig::Local {
            path: PathBuf::from(".liftoff/state"),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields, default)]
pub struct Settings {
    /// Provisioning engine executable (`tofu` or `terraform`).
    pub engine: String,
    pub modules_dir: PathBuf,
    pub log_dir: PathBuf,
    /// Root under which artifact buckets are materialized as directories.
    pub artifacts_dir: PathBuf,
    /// Scratch space for engine working copies, state files, and source packages.
    pub work_dir: PathBuf,
    pub concurrency: usize,
    pub poll_interval_secs: u64,
    pub build_timeout_secs: u64,
    pub release_timeout_secs: u64,
    pub transient_retries: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lock_lease_secs: Option<u64>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            engine: "tofu".to_owned(),
            modules_dir: PathBuf::from("modules"),
            log_dir: PathBuf::from(".liftoff/logs"),
            artifacts_dir: PathBuf::from(".liftoff/artifacts"),
            work_dir: PathBuf::from(".liftoff/work"),
            concurrency: 4,
            poll_interval_secs: 5,
            build_timeout_secs: 1800,
            release_timeout_secs: 600,
            transient_retries: 3,
            lock_lease_secs: None,
        }
    }
}

impl Settings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn build_timeout(&self) -> Duration {
        Duration::from_secs(self.build_timeout_secs)
    }

    pub fn release_timeout(&self) -> Duration {
        Duration::from_secs(self.release_timeout_secs)
    }

    pub fn lock_lease(&self) -> Option<Duration> {
        self.lock_lease_secs.map(Duration::from_secs)
    }

    /// Re-root every relative path under `base` (the directory holding `liftoff.toml`).
    pub fn rebase(&mut self, base: &Path) {
        for path in [
            &mut self.modules_dir,
            &mut self.log_dir,
            &mut self.artifacts_dir,
            &mut self.work_dir,
        ] {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ResourceConfig {
    pub name: String,
    pub product: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub inputs: Inputs,
}

impl ResourceConfig {
    /// Explicit `depends_on` plus every resource referenced by an output handle.
    pub fn dependencies(&self) -> BTreeSet<String> {
        let mut deps: BTreeSet<String> = self.depends_on.iter().cloned().collect();
        deps.extend(referenced_resources(&self.inputs));
        deps
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ServiceConfig {
    pub name: String,
    pub product: String,
    #[serde(default = "default_dockerfile")]
    pub dockerfile: String,
    #[serde(default = "default_build_directory")]
    pub build_directory: PathBuf,
    #[serde(default)]
    pub build_ignore: Vec<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub inputs: Inputs,
}

impl ServiceConfig {
    pub fn dependencies(&self) -> BTreeSet<String> {
        let mut deps: BTreeSet<String> = self.depends_on.iter().cloned().collect();
        deps.extend(referenced_resources(&self.inputs));
        deps
    }
}

fn default_dockerfile() -> String {
    "Dockerfile".to_owned()
}

fn default_build_directory() -> PathBuf {
    PathBuf::from(".")
}

impl ProjectConfig {
    pub fn resource(&self, name: &str) -> Option<&ResourceConfig> {
        self.resources.iter().find(|r| r.name == name)
    }

    pub fn service(&self, name: &str) -> Option<&ServiceConfig> {
        self.services.iter().find(|s| s.name == name)
    }

    /// Structural checks that need no store access. Cycles are detected when
    /// the dependency graph is built.
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_name("project", &self.project)?;
        if self.settings.concurrency == 0 {
            return Err(ConfigError::ZeroConcurrency);
        }

        for (name, spec) in self.products.iter() {
            if spec.module.trim().is_empty() {
                return Err(ConfigError::EmptyModule(name.clone()));
            }
            if spec.kind == ProductKind::Service {
                let missing: Vec<String> = SERVICE_REQUIRED_OUTPUTS
                    .iter()
                    .filter(|field| !spec.outputs.iter().any(|o| o == *field))
                    .map(|field| (*field).to_owned())
                    .collect();
                if !missing.is_empty() {
                    return Err(ConfigError::MissingServiceOutputs {
                        product: name.clone(),
                        missing,
                    });
                }
            }
        }

        let mut resource_names = BTreeSet::new();
        for r in &self.resources {
            validate_name("resource", &r.name)?;
            if !resource_names.insert(r.name.as_str()) {
                return Err(ConfigError::DuplicateName {
                    what: "resource",
                    name: r.name.clone(),
                });
            }
            self.check_product(&r.name, &r.product, ProductKind::Resource)?;
        }

        let mut service_names = BTreeSet::new();
        for s in &self.services {
            validate_name("service", &s.name)?;
            // Services and resources share one dependency graph.
            if resource_names.contains(s.name.as_str())
                || !service_names.insert(s.name.as_str())
            {
                return Err(ConfigError::DuplicateName {
                    what: "service",
                    name: s.name.clone(),
                });
            }
            self.check_product(&s.name, &s.product, ProductKind::Service)?;
        }

        for (unit, deps) in self
            .resources
            .iter()
            .map(|r| (&r.name, r.dependencies()))
            .chain(self.services.iter().map(|s| (&s.name, s.dependencies())))
        {
            for dep in deps {
                if !resource_names.contains(dep.as_str()) {
                    return Err(ConfigError::UnknownDependency {
                        unit: unit.clone(),
                        dependency: dep,
                    });
                }
            }
        }
        Ok(())
    }

    fn check_product(
        &self,
        unit: &str,
        product: &str,
        expected: ProductKind,
    ) -> Result<(), ConfigError> {
        let spec = self
            .products
            .get(product)
            .ok_or_else(|| ConfigError::UnknownProduct {
                unit: unit.to_owned(),
                product: product.to_owned(),
            })?;
        if spec.kind != expected {
            return Err(ConfigError::ProductKindMismatch {
                unit: unit.to_owned(),
                product: product.to_owned(),
                expected,
                actual: spec.kind,
            });
        }
        Ok(())
    }
}

pub fn parse_config_str(input: &str) -> Result<ProjectConfig, ConfigError> {
    let config: ProjectConfig = toml::from_str(input)?;
    config.validate()?;
    Ok(config)
}

/// Parse and validate a config file; relative settings paths are resolved
/// against the file's directory.
pub fn parse_config_file(path: impl AsRef<Path>) -> Result<ProjectConfig, ConfigError> {
    let path = path.as_ref();
    let content = fs::read_to_string(path)?;
    let mut config = parse_config_str(&content)?;
    let base = path.parent().unwrap_or(Path::new("."));
    config.settings.rebase(base);
    match &mut config.backend {
        BackendConfig::Local { path } | BackendConfig::Bucket { path, .. } if path.is_relative() => {
            *path = base.join(&*path);
        }
        _ => {}
    }
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inputs::InputValue;

    const PRODUCTS: &str = r#"
[products.gcp_bucket]
kind = "resource"
provider = "gcp"
module = "gcp/bucket"
outputs = ["bucket_name"]

[products.gcp_sql]
kind = "resource"
provider = "gcp"
module = "gcp/sql"
outputs = ["connection_url"]

[products.gcp_cloud_run]
kind = "service"
provider = "gcp"
module = "gcp/cloud_run"
outputs = ["artifact_repository", "release_target", "service_url"]
"#;

    fn config_with(body: &str) -> String {
        format!("project = \"shop\"\n{body}\n{PRODUCTS}")
    }

    #[test]
    fn parse_minimal_config() {
        let config = parse_config_str("project = \"shop\"").unwrap();
        assert_eq!(config.project, "shop");
        assert_eq!(config.settings.engine, "tofu");
        assert_eq!(config.settings.concurrency, 4);
        assert!(matches!(config.backend, BackendConfig::Local { .. }));
    }

    #[test]
    fn parse_full_config() {
        let config = parse_config_str(&config_with(
            r#"
[backend]
kind = "remote"
url = "https://state.example.com"
account_id = "acct-1"

[settings]
engine = "terraform"
concurrency = 2
lock_lease_secs = 900

[[resources]]
name = "db"
product = "gcp_sql"
[resources.inputs]
tier = "db-f1-micro"

[[resources]]
name = "bucket"
product = "gcp_bucket"
depends_on = ["db"]

[[services]]
name = "api"
product = "gcp_cloud_run"
build_ignore = ["target"]
[services.inputs]
database_url = { output = "connection_url", of = "db" }
"#,
        ))
        .unwrap();
        assert_eq!(config.settings.engine, "terraform");
        assert_eq!(config.settings.lock_lease(), Some(Duration::from_secs(900)));
        assert!(matches!(config.backend, BackendConfig::Remote { .. }));
        assert_eq!(config.resources.len(), 2);
        let api = config.service("api").unwrap();
        assert_eq!(api.dockerfile, "Dockerfile");
        assert_eq!(
            api.inputs["database_url"],
            InputValue::output_of("db", "connection_url")
        );
        assert_eq!(
            api.dependencies().into_iter().collect::<Vec<_>>(),
            vec!["db"]
        );
    }

    #[test]
    fn unknown_product_rejected() {
        let err = parse_config_str(&config_with(
            r#"
[[resources]]
name = "db"
product = "nope"
"#,
        ))
        .unwrap_err();
        assert!(matches!(err, ConfigError::UnknownProduct { .. }));
    }

    #[test]
    fn service_product_used_as_resource_rejected() {
        let err = parse_config_str(&config_with(
            r#"
[[resources]]
name = "db"
product = "gcp_cloud_run"
"#,
        ))
        .unwrap_err();
        assert!(matches!(err, ConfigError::ProductKindMismatch { .. }));
    }

    #[test]
    fn duplicate_resource_rejected() {
        let err = parse_config_str(&config_with(
            r#"
[[resources]]
name = "db"
product = "gcp_sql"

[[resources]]
name = "db"
product = "gcp_sql"
"#,
        ))
        .unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateName { .. }));
    }

    #[test]
    fn service_named_like_resource_rejected() {
        let err = parse_config_str(&config_with(
            r#"
[[resources]]
name = "api"
product = "gcp_sql"

[[services]]
name = "api"
product = "gcp_cloud_run"
"#,
        ))
        .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::DuplicateName { what: "service", .. }
        ));
    }

    #[test]
    fn unknown_dependency_rejected() {
        let err = parse_config_str(&config_with(
            r#"
[[services]]
name = "api"
product = "gcp_cloud_run"
[services.inputs]
url = { output = "connection_url", of = "ghost" }
"#,
        ))
        .unwrap_err();
        assert!(matches!(err, ConfigError::UnknownDependency { .. }));
    }

    #[test]
    fn service_product_requires_release_outputs() {
        let err = parse_config_str(
            r#"
project = "shop"
[products.bad_service]
kind = "service"
provider = "aws"
module = "aws/ecs"
outputs = ["artifact_repository"]
"#,
        )
        .unwrap_err();
        match err {
            ConfigError::MissingServiceOutputs { missing, .. } => {
                assert_eq!(missing, vec!["release_target".to_owned()]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn invalid_names_rejected() {
        assert!(parse_config_str("project = \"Shop\"").is_err());
        let err = parse_config_str(&config_with(
            r#"
[[resources]]
name = "has space"
product = "gcp_sql"
"#,
        ))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Schema(_)));
    }

    #[test]
    fn unknown_top_level_field_rejected() {
        assert!(parse_config_str("project = \"shop\"\ncolour = 1").is_err());
    }

    #[test]
    fn zero_concurrency_rejected() {
        let err = parse_config_str("project = \"shop\"\n[settings]\nconcurrency = 0").unwrap_err();
        assert!(matches!(err, ConfigError::ZeroConcurrency));
    }

    #[test]
    fn parse_file_rebases_relative_paths() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        fs::write(&path, "project = \"shop\"\n").unwrap();
        let config = parse_config_file(&path).unwrap();
        assert_eq!(config.settings.modules_dir, dir.path().join("modules"));
        match config.backend {
            BackendConfig::Local { path } => assert_eq!(path, dir.path().join(".liftoff/state")),
            other => panic!("unexpected backend: {other:?}"),
        }
    }
}
