use crate::logs::LogSink;
use crate::process::Invocation;
use crate::provider::RegistryCredentials;
use crate::RuntimeError;
use async_trait::async_trait;
use tracing::info;

/// One image build from a packaged build context.
#[derive(Debug, Clone)]
pub struct ContainerBuild {
    /// Build context as a tar archive, fed on stdin.
    pub context: Vec<u8>,
    /// Dockerfile path inside the context.
    pub dockerfile: String,
    pub tags: Vec<String>,
    pub cache_from: Vec<String>,
}

#[async_trait]
pub trait ContainerTool: Send + Sync {
    async fn login(
        &self,
        registry: &str,
        credentials: &RegistryCredentials,
        sink: &dyn LogSink,
    ) -> Result<(), RuntimeError>;

    async fn build(&self, build: &ContainerBuild, sink: &dyn LogSink) -> Result<(), RuntimeError>;

    /// Push `image` (`repo:tag`) and return the registry's content digest.
    async fn push(&self, image: &str, sink: &dyn LogSink) -> Result<String, RuntimeError>;

    async fn pull(&self, image: &str, sink: &dyn LogSink) -> Result<(), RuntimeError>;

    async fn tag(&self, source: &str, target: &str, sink: &dyn LogSink) -> Result<(), RuntimeError>;
}

pub struct DockerCli {
    binary: String,
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new("docker")
    }
}

impl DockerCli {
    pub fn new(binary: &str) -> Self {
        Self {
            binary: binary.to_owned(),
        }
    }

    /// Digest of `image` as recorded by the registry it was pushed to.
    async fn repo_digest(&self, image: &str, sink: &dyn LogSink) -> Result<String, RuntimeError> {
        let raw = Invocation::new(&self.binary)
            .args(["image", "inspect", "--format", "{{json .RepoDigests}}", image])
            .capture_stdout()
            .run("inspect", sink)
            .await?;
        let digests: Vec<String> = serde_json::from_str(raw.trim())?;
        pick_repo_digest(image, &digests)
            .ok_or_else(|| RuntimeError::NotFound(format!("registry digest for {image}")))
    }
}

/// The `sha256:...` part of the entry in `RepoDigests` that belongs to
/// `image`'s repository.
fn pick_repo_digest(image: &str, digests: &[String]) -> Option<String> {
    let repository = repository_of(image);
    digests.iter().find_map(|entry| {
        let (repo, digest) = entry.split_once('@')?;
        (repo == repository).then(|| digest.to_owned())
    })
}

/// `host:5000/team/app:tag` -> `host:5000/team/app`
pub fn repository_of(image: &str) -> &str {
    let image = image.split_once('@').map_or(image, |(repo, _)| repo);
    match image.rfind(':') {
        Some(idx) if !image[idx..].contains('/') => &image[..idx],
        _ => image,
    }
}

#[async_trait]
impl ContainerTool for DockerCli {
    async fn login(
        &self,
        registry: &str,
        credentials: &RegistryCredentials,
        sink: &dyn LogSink,
    ) -> Result<(), RuntimeError> {
        let result = Invocation::new(&self.binary)
            .args([
                "login",
                "--username",
                credentials.username.as_str(),
                "--password-stdin",
                registry,
            ])
            .stdin(credentials.password.clone().into_bytes())
            .run("login", sink)
            .await;
        match result {
            Err(RuntimeError::CommandFailed { .. }) => Err(RuntimeError::Unauthorized(format!(
                "registry login to {registry} was rejected"
            ))),
            other => other.map(|_| ()),
        }
    }

    async fn build(&self, build: &ContainerBuild, sink: &dyn LogSink) -> Result<(), RuntimeError> {
        let mut cmd = Invocation::new(&self.binary).args(["build", "--file", build.dockerfile.as_str()]);
        for tag in &build.tags {
            cmd = cmd.args(["--tag", tag.as_str()]);
        }
        for cache in &build.cache_from {
            cmd = cmd.args(["--cache-from", cache.as_str()]);
        }
        info!(tags = ?build.tags, context_bytes = build.context.len(), "building image");
        cmd.arg("-").stdin(build.context.clone()).run("build", sink).await?;
        Ok(())
    }

    async fn push(&self, image: &str, sink: &dyn LogSink) -> Result<String, RuntimeError> {
        Invocation::new(&self.binary)
            .args(["push", image])
            .run("push", sink)
            .await?;
        self.repo_digest(image, sink).await
    }

    async fn pull(&self, image: &str, sink: &dyn LogSink) -> Result<(), RuntimeError> {
        Invocation::new(&self.binary)
            .args(["pull", image])
            .run("pull", sink)
            .await?;
        Ok(())
    }

    async fn tag(&self, source: &str, target: &str, sink: &dyn LogSink) -> Result<(), RuntimeError> {
        Invocation::new(&self.binary)
            .args(["tag", source, target])
            .run("tag", sink)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repository_strips_tag_and_digest() {
        assert_eq!(repository_of("registry/app:42"), "registry/app");
        assert_eq!(repository_of("host:5000/team/app:latest"), "host:5000/team/app");
        assert_eq!(repository_of("host:5000/team/app"), "host:5000/team/app");
        assert_eq!(repository_of("app@sha256:abc"), "app");
        assert_eq!(repository_of("app"), "app");
    }

    #[test]
    fn picks_digest_of_matching_repository() {
        let digests = vec![
            "other/app@sha256:111".to_owned(),
            "registry/app@sha256:222".to_owned(),
        ];
        assert_eq!(
            pick_repo_digest("registry/app:42", &digests),
            Some("sha256:222".to_owned())
        );
        assert_eq!(pick_repo_digest("missing/app:1", &digests), None);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn push_reads_back_repo_digest() {
        use crate::logs::MemorySink;
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join("fake-docker");
        std::fs::write(
            &bin,
            "#!/bin/sh\n\
             case \"$1\" in\n\
               image) echo '[\"registry/app@sha256:feed\"]' ;;\n\
               login) read pw; test \"$pw\" = hunter2 || exit 1 ;;\n\
               *) echo \"$1 ok\" ;;\n\
             esac\n",
        )
        .unwrap();
        std::fs::set_permissions(&bin, std::fs::Permissions::from_mode(0o755)).unwrap();
        let docker = DockerCli::new(bin.to_str().unwrap());
        let sink = MemorySink::new();

        let digest = docker.push("registry/app:42", &sink).await.unwrap();
        assert_eq!(digest, "sha256:feed");

        let good = RegistryCredentials::new("oauth2accesstoken", "hunter2");
        docker.login("registry", &good, &sink).await.unwrap();
        let bad = RegistryCredentials::new("oauth2accesstoken", "wrong");
        assert!(matches!(
            docker.login("registry", &bad, &sink).await,
            Err(RuntimeError::Unauthorized(_))
        ));
    }
}
