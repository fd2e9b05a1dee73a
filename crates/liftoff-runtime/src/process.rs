use crate::logs::LogSink;
use crate::RuntimeError;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::debug;

/// One command line. Output lines go to the sink as they arrive; stdout can
/// be captured instead when the caller needs to parse it.
///
/// A dropped future leaves the child running: an interrupted `apply` is
/// finished by the engine, not killed halfway.
#[derive(Debug, Clone)]
pub struct Invocation {
    program: String,
    args: Vec<String>,
    cwd: Option<PathBuf>,
    env: Vec<(String, String)>,
    stdin: Option<Vec<u8>>,
    capture_stdout: bool,
}

impl Invocation {
    pub fn new(program: &str) -> Self {
        Self {
            program: program.to_owned(),
            args: Vec::new(),
            cwd: None,
            env: Vec::new(),
            stdin: None,
            capture_stdout: false,
        }
    }

    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn current_dir(mut self, dir: &Path) -> Self {
        self.cwd = Some(dir.to_path_buf());
        self
    }

    #[must_use]
    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.env.push((key.to_owned(), value.to_owned()));
        self
    }

    #[must_use]
    pub fn stdin(mut self, data: Vec<u8>) -> Self {
        self.stdin = Some(data);
        self
    }

    #[must_use]
    pub fn capture_stdout(mut self) -> Self {
        self.capture_stdout = true;
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Run to completion. A non-zero exit becomes
    /// [`RuntimeError::CommandFailed`] with `step` naming the subcommand.
    /// Returns captured stdout (empty unless [`capture_stdout`](Self::capture_stdout)).
    pub async fn run(self, step: &str, sink: &dyn LogSink) -> Result<String, RuntimeError> {
        debug!(program = %self.program, step, args = ?self.args, "spawning");
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(if self.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            });
        if let Some(dir) = &self.cwd {
            cmd.current_dir(dir);
        }
        for (k, v) in &self.env {
            cmd.env(k, v);
        }

        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                RuntimeError::ToolUnavailable(self.program.clone())
            } else {
                RuntimeError::Io(e)
            }
        })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RuntimeError::Io(std::io::Error::other("child stdout not piped")))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| RuntimeError::Io(std::io::Error::other("child stderr not piped")))?;
        let stdin = child.stdin.take();
        let capture = self.capture_stdout;

        let feed = async {
            if let (Some(mut pipe), Some(data)) = (stdin, self.stdin.as_deref()) {
                pipe.write_all(data).await?;
                pipe.shutdown().await?;
            }
            Ok::<_, std::io::Error>(())
        };
        let out = async {
            let mut captured = String::new();
            let mut lines = BufReader::new(stdout).lines();
            while let Some(line) = lines.next_line().await? {
                if capture {
                    captured.push_str(&line);
                    captured.push('\n');
                } else {
                    sink.line(&line);
                }
            }
            Ok::<_, std::io::Error>(captured)
        };
        let err = async {
            let mut lines = BufReader::new(stderr).lines();
            while let Some(line) = lines.next_line().await? {
                sink.line(&line);
            }
            Ok::<_, std::io::Error>(())
        };
        let ((), captured, ()) = tokio::try_join!(feed, out, err)?;

        let status = child.wait().await?;
        if status.success() {
            Ok(captured)
        } else {
            Err(RuntimeError::CommandFailed {
                program: self.program,
                step: step.to_owned(),
                status: status.code(),
            })
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::logs::MemorySink;

    #[tokio::test]
    async fn streams_both_pipes_to_sink() {
        let sink = MemorySink::new();
        let out = Invocation::new("sh")
            .args(["-c", "echo out; echo err 1>&2"])
            .run("script", &sink)
            .await
            .unwrap();
        assert!(out.is_empty());
        let mut lines = sink.lines();
        lines.sort();
        assert_eq!(lines, vec!["err", "out"]);
    }

    #[tokio::test]
    async fn captures_stdout_when_asked() {
        let sink = MemorySink::new();
        let out = Invocation::new("sh")
            .args(["-c", "echo '{\"a\":1}'; echo note 1>&2"])
            .capture_stdout()
            .run("output", &sink)
            .await
            .unwrap();
        assert_eq!(out, "{\"a\":1}\n");
        assert_eq!(sink.lines(), vec!["note"]);
    }

    #[tokio::test]
    async fn feeds_stdin() {
        let sink = MemorySink::new();
        let out = Invocation::new("cat")
            .stdin(b"secret\n".to_vec())
            .capture_stdout()
            .run("cat", &sink)
            .await
            .unwrap();
        assert_eq!(out, "secret\n");
    }

    #[tokio::test]
    async fn nonzero_exit_is_command_failed() {
        let sink = MemorySink::new();
        let err = Invocation::new("sh")
            .args(["-c", "echo boom; exit 3"])
            .run("apply", &sink)
            .await
            .unwrap_err();
        match err {
            RuntimeError::CommandFailed {
                program,
                step,
                status,
            } => {
                assert_eq!(program, "sh");
                assert_eq!(step, "apply");
                assert_eq!(status, Some(3));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(sink.lines(), vec!["boom"]);
    }

    #[tokio::test]
    async fn missing_binary_is_tool_unavailable() {
        let sink = MemorySink::new();
        let err = Invocation::new("liftoff-definitely-not-a-binary")
            .run("init", &sink)
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::ToolUnavailable(ref p) if p == "liftoff-definitely-not-a-binary"));
    }
}
