use crate::logs::LogSink;
use crate::process::Invocation;
use crate::RuntimeError;
use async_trait::async_trait;
use liftoff_schema::{Outputs, Provider};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub const BACKEND_FILE: &str = "liftoff_backend.tf.json";
pub const VARIABLES_FILE: &str = "liftoff.auto.tfvars.json";

/// Where the engine keeps the state of one resource in one environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateLocation {
    Local {
        path: PathBuf,
    },
    Bucket {
        provider: Provider,
        bucket: String,
        /// `{project}/{env}/resources/{name}`
        prefix: String,
        region: String,
    },
    /// Control-plane state endpoint; `lock_id` ties engine state locking to
    /// the lock Liftoff holds.
    ControlPlane {
        url: String,
        lock_id: Option<String>,
    },
}

impl StateLocation {
    /// The location as one string: a path, `gs://`/`s3://` prefix, or URL.
    pub fn render(&self) -> String {
        match self {
            StateLocation::Local { path } => path.display().to_string(),
            StateLocation::Bucket {
                provider, bucket, prefix, ..
            } => {
                let scheme = match provider {
                    Provider::Gcp => "gs",
                    Provider::Aws => "s3",
                };
                format!("{scheme}://{bucket}/{prefix}")
            }
            StateLocation::ControlPlane { url, lock_id } => match lock_id {
                Some(id) => {
                    let sep = if url.contains('?') { '&' } else { '?' };
                    format!("{url}{sep}lock_id={id}")
                }
                None => url.clone(),
            },
        }
    }

    /// `terraform { backend ... }` block in JSON configuration syntax.
    pub fn backend_config(&self) -> Value {
        let backend = match self {
            StateLocation::Local { path } => json!({ "local": { "path": path } }),
            StateLocation::Bucket {
                provider: Provider::Gcp,
                bucket,
                prefix,
                ..
            } => json!({ "gcs": { "bucket": bucket, "prefix": prefix } }),
            StateLocation::Bucket {
                provider: Provider::Aws,
                bucket,
                prefix,
                region,
            } => json!({
                "s3": {
                    "bucket": bucket,
                    "key": format!("{prefix}/terraform.tfstate"),
                    "region": region,
                }
            }),
            // No lock_address: the Liftoff lock named by lock_id already
            // serializes writers, and the server checks it on every write.
            StateLocation::ControlPlane { .. } => json!({ "http": { "address": self.render() } }),
        };
        json!({ "terraform": { "backend": backend } })
    }
}

/// Everything the engine needs for one apply or destroy.
#[derive(Debug, Clone)]
pub struct EngineRequest {
    /// Unit name, for logs and work directory naming.
    pub unit: String,
    pub module_dir: PathBuf,
    pub state: StateLocation,
    pub variables: BTreeMap<String, Value>,
}

#[async_trait]
pub trait ProvisioningEngine: Send + Sync {
    fn name(&self) -> &str;

    /// Converge the module and return its flattened outputs.
    async fn apply(&self, request: &EngineRequest, sink: &dyn LogSink) -> Result<Outputs, RuntimeError>;

    async fn destroy(&self, request: &EngineRequest, sink: &dyn LogSink) -> Result<(), RuntimeError>;
}

/// Runs the `tofu` (or `terraform`) CLI in a scratch copy of the module.
pub struct TofuEngine {
    binary: String,
    work_root: PathBuf,
}

impl TofuEngine {
    pub fn new(binary: &str, work_root: &Path) -> Self {
        Self {
            binary: binary.to_owned(),
            work_root: work_root.to_path_buf(),
        }
    }

    /// Copy the module into a fresh work directory and write the generated
    /// backend and variable files next to it.
    async fn prepare(&self, request: &EngineRequest) -> Result<tempfile::TempDir, RuntimeError> {
        let work_root = self.work_root.clone();
        let module_dir = request.module_dir.clone();
        let unit = request.unit.clone();
        let backend = serde_json::to_vec_pretty(&request.state.backend_config())?;
        let variables = serde_json::to_vec_pretty(&request.variables)?;
        tokio::task::spawn_blocking(move || {
            if !module_dir.is_dir() {
                return Err(RuntimeError::NotFound(format!(
                    "module directory {}",
                    module_dir.display()
                )));
            }
            fs::create_dir_all(&work_root)?;
            let work = tempfile::Builder::new()
                .prefix(&format!("{unit}-"))
                .tempdir_in(&work_root)?;
            copy_module(&module_dir, work.path())?;
            fs::write(work.path().join(BACKEND_FILE), backend)?;
            fs::write(work.path().join(VARIABLES_FILE), variables)?;
            Ok(work)
        })
        .await
        .map_err(|e| RuntimeError::Io(std::io::Error::other(e)))?
    }

    fn tofu(&self, dir: &Path) -> Invocation {
        Invocation::new(&self.binary)
            .current_dir(dir)
            .env("TF_IN_AUTOMATION", "1")
            .env("TF_INPUT", "0")
    }

    async fn init(&self, dir: &Path, sink: &dyn LogSink) -> Result<(), RuntimeError> {
        self.tofu(dir)
            .args(["init", "-input=false", "-no-color", "-reconfigure"])
            .run("init", sink)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ProvisioningEngine for TofuEngine {
    fn name(&self) -> &str {
        &self.binary
    }

    async fn apply(&self, request: &EngineRequest, sink: &dyn LogSink) -> Result<Outputs, RuntimeError> {
        let work = self.prepare(request).await?;
        info!(unit = %request.unit, state = %request.state.render(), "applying module");
        self.init(work.path(), sink).await?;
        self.tofu(work.path())
            .args(["apply", "-auto-approve", "-input=false", "-no-color"])
            .run("apply", sink)
            .await?;
        let raw = self
            .tofu(work.path())
            .args(["output", "-json", "-no-color"])
            .capture_stdout()
            .run("output", sink)
            .await?;
        let outputs = flatten_outputs(&raw)?;
        debug!(unit = %request.unit, fields = outputs.len(), "outputs read");
        Ok(outputs)
    }

    async fn destroy(&self, request: &EngineRequest, sink: &dyn LogSink) -> Result<(), RuntimeError> {
        let work = self.prepare(request).await?;
        info!(unit = %request.unit, state = %request.state.render(), "destroying module");
        self.init(work.path(), sink).await?;
        self.tofu(work.path())
            .args(["destroy", "-auto-approve", "-input=false", "-no-color"])
            .run("destroy", sink)
            .await?;
        Ok(())
    }
}

/// Recursive copy that leaves out `.terraform` caches and stale state files.
fn copy_module(src: &Path, dst: &Path) -> Result<(), RuntimeError> {
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let name = entry.file_name();
        let name_str = name.to_string_lossy();
        if name_str == ".terraform" || name_str.ends_with(".tfstate") || name_str == BACKEND_FILE {
            continue;
        }
        let target = dst.join(&name);
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            fs::create_dir_all(&target)?;
            copy_module(&entry.path(), &target)?;
        } else if file_type.is_file() {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// `output -json` yields `{"name": {"value": ..., "type": ..., "sensitive": ..}}`.
/// Strings are kept verbatim; other values are re-encoded as compact JSON.
pub fn flatten_outputs(raw: &str) -> Result<Outputs, RuntimeError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(Outputs::new());
    }
    let parsed: BTreeMap<String, Value> = serde_json::from_str(trimmed)
        .map_err(|e| RuntimeError::InvalidOutput(format!("output -json: {e}")))?;
    let mut outputs = Outputs::new();
    for (name, entry) in parsed {
        let value = entry
            .get("value")
            .ok_or_else(|| RuntimeError::InvalidOutput(format!("output '{name}' has no value")))?;
        let flat = match value {
            Value::String(s) => s.clone(),
            Value::Null => continue,
            other => other.to_string(),
        };
        outputs.insert(name, flat);
    }
    Ok(outputs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logs::MemorySink;

    #[test]
    fn render_state_locations() {
        let local = StateLocation::Local {
            path: PathBuf::from("/tmp/state/shop/dev/db.tfstate"),
        };
        assert_eq!(local.render(), "/tmp/state/shop/dev/db.tfstate");

        let gcs = StateLocation::Bucket {
            provider: Provider::Gcp,
            bucket: "shop-dev-artifacts".to_owned(),
            prefix: "shop/dev/resources/db".to_owned(),
            region: "europe-west1".to_owned(),
        };
        assert_eq!(gcs.render(), "gs://shop-dev-artifacts/shop/dev/resources/db");

        let cp = StateLocation::ControlPlane {
            url: "https://cp.example.com/v1/state/shop/dev/db".to_owned(),
            lock_id: Some("tok-1".to_owned()),
        };
        assert_eq!(
            cp.render(),
            "https://cp.example.com/v1/state/shop/dev/db?lock_id=tok-1"
        );
        let cp = StateLocation::ControlPlane {
            url: "https://cp.example.com/state?account_id=a".to_owned(),
            lock_id: Some("t".to_owned()),
        };
        assert!(cp.render().ends_with("?account_id=a&lock_id=t"));
    }

    #[test]
    fn backend_blocks_per_location() {
        let s3 = StateLocation::Bucket {
            provider: Provider::Aws,
            bucket: "b".to_owned(),
            prefix: "shop/dev/resources/db".to_owned(),
            region: "eu-west-1".to_owned(),
        };
        let cfg = s3.backend_config();
        assert_eq!(
            cfg["terraform"]["backend"]["s3"]["key"],
            "shop/dev/resources/db/terraform.tfstate"
        );
        assert_eq!(cfg["terraform"]["backend"]["s3"]["region"], "eu-west-1");

        let cp = StateLocation::ControlPlane {
            url: "https://cp/state".to_owned(),
            lock_id: Some("abc".to_owned()),
        };
        let cfg = cp.backend_config();
        assert_eq!(
            cfg["terraform"]["backend"]["http"]["address"],
            "https://cp/state?lock_id=abc"
        );
        assert!(cfg["terraform"]["backend"]["http"].get("lock_address").is_none());
    }

    #[test]
    fn flatten_keeps_strings_and_encodes_the_rest() {
        let raw = r#"{
            "connection_url": {"sensitive": true, "type": "string", "value": "postgres://db"},
            "port": {"sensitive": false, "type": "number", "value": 5432},
            "zones": {"sensitive": false, "type": ["list", "string"], "value": ["a", "b"]},
            "unset": {"sensitive": false, "type": "string", "value": null}
        }"#;
        let out = flatten_outputs(raw).unwrap();
        assert_eq!(out["connection_url"], "postgres://db");
        assert_eq!(out["port"], "5432");
        assert_eq!(out["zones"], r#"["a","b"]"#);
        assert!(!out.contains_key("unset"));
        assert!(flatten_outputs("  \n").unwrap().is_empty());
    }

    #[test]
    fn flatten_rejects_garbage() {
        assert!(matches!(
            flatten_outputs("not json"),
            Err(RuntimeError::InvalidOutput(_))
        ));
        assert!(matches!(
            flatten_outputs(r#"{"a": {"type": "string"}}"#),
            Err(RuntimeError::InvalidOutput(_))
        ));
    }

    #[test]
    fn copy_module_skips_engine_caches() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        fs::write(src.path().join("main.tf"), "resource {}").unwrap();
        fs::write(src.path().join("terraform.tfstate"), "{}").unwrap();
        fs::create_dir_all(src.path().join(".terraform/providers")).unwrap();
        fs::create_dir_all(src.path().join("nested")).unwrap();
        fs::write(src.path().join("nested/vars.tf"), "variable {}").unwrap();

        copy_module(src.path(), dst.path()).unwrap();
        assert!(dst.path().join("main.tf").exists());
        assert!(dst.path().join("nested/vars.tf").exists());
        assert!(!dst.path().join("terraform.tfstate").exists());
        assert!(!dst.path().join(".terraform").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn tofu_engine_drives_cli_steps() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let module = dir.path().join("module");
        fs::create_dir_all(&module).unwrap();
        fs::write(module.join("main.tf"), "").unwrap();

        // Stand-in CLI: logs each step and answers `output -json`.
        let bin = dir.path().join("fake-tofu");
        fs::write(
            &bin,
            "#!/bin/sh\n\
             test -f liftoff.auto.tfvars.json || exit 9\n\
             test -f liftoff_backend.tf.json || exit 9\n\
             case \"$1\" in\n\
               output) echo '{\"id\":{\"value\":\"db-1\"},\"port\":{\"value\":5432}}' ;;\n\
               *) echo \"step $1\" ;;\n\
             esac\n",
        )
        .unwrap();
        fs::set_permissions(&bin, fs::Permissions::from_mode(0o755)).unwrap();

        let engine = TofuEngine::new(bin.to_str().unwrap(), &dir.path().join("work"));
        let mut variables = BTreeMap::new();
        variables.insert("resource_id".to_owned(), json!("db"));
        let request = EngineRequest {
            unit: "db".to_owned(),
            module_dir: module.clone(),
            state: StateLocation::Local {
                path: dir.path().join("state/db.tfstate"),
            },
            variables,
        };
        let sink = MemorySink::new();
        let outputs = engine.apply(&request, &sink).await.unwrap();
        assert_eq!(outputs["id"], "db-1");
        assert_eq!(outputs["port"], "5432");
        assert_eq!(sink.lines(), vec!["step init", "step apply"]);

        let sink = MemorySink::new();
        engine.destroy(&request, &sink).await.unwrap();
        assert_eq!(sink.lines(), vec!["step init", "step destroy"]);
    }

    #[tokio::test]
    async fn missing_module_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let engine = TofuEngine::new("tofu", dir.path());
        let request = EngineRequest {
            unit: "db".to_owned(),
            module_dir: dir.path().join("nope"),
            state: StateLocation::Local {
                path: dir.path().join("s"),
            },
            variables: BTreeMap::new(),
        };
        let err = engine.apply(&request, &MemorySink::new()).await.unwrap_err();
        assert!(matches!(err, RuntimeError::NotFound(_)));
    }
}
