//! [`ContainerEngine`] backed by the `docker` command line.

use std::process::{Output, Stdio};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;

use super::{
    ContainerEngine, ContainerInfo, ContainerState, CreateSpec, EngineError, ExecOutput,
    ExecRequest,
};

/// Drives a Docker-compatible CLI (`docker`, `podman`) with argument vectors.
///
/// Every spawned engine process is killed if its future is dropped. That
/// ends the local CLI call only: a command started with `exec` keeps running
/// inside the container, so long-running tools must carry their own limit.
#[derive(Debug, Clone)]
pub struct DockerCli {
    binary: String,
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new("docker")
    }
}

/// One line of `docker ps --format '{{json .}}'`.
#[derive(Debug, Deserialize)]
struct PsEntry {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Names")]
    names: String,
    #[serde(rename = "State")]
    state: String,
}

impl DockerCli {
    /// Use `binary` as the engine CLI.
    #[must_use]
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// The engine CLI binary.
    #[must_use]
    pub fn binary(&self) -> &str {
        &self.binary
    }

    async fn run(&self, args: &[String], stdin: Option<&[u8]>) -> Result<Output, EngineError> {
        let spawn_err = |source| EngineError::Spawn {
            program: self.binary.clone(),
            source,
        };

        let mut child = tokio::process::Command::new(&self.binary)
            .args(args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(spawn_err)?;

        // Feed stdin while draining stdout/stderr so large payloads cannot
        // deadlock on full pipes.
        let pipe = child.stdin.take();
        let feed = async move {
            if let (Some(mut pipe), Some(bytes)) = (pipe, stdin) {
                pipe.write_all(bytes).await?;
                pipe.shutdown().await?;
            }
            Ok::<(), std::io::Error>(())
        };
        let (fed, output) = tokio::join!(feed, child.wait_with_output());
        let output = output.map_err(spawn_err)?;
        if let Err(e) = fed {
            // A command that exits without reading its input closes the pipe
            // early; its exit status tells the real story.
            tracing::debug!(error = %e, "Engine process did not consume all of stdin");
        }
        Ok(output)
    }

    /// Run a control subcommand and return its trimmed stdout.
    async fn control(&self, args: Vec<String>) -> Result<String, EngineError> {
        let command = args.first().cloned().unwrap_or_default();
        let output = self.run(&args, None).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            if stderr.contains("No such container") || stderr.contains("no such container") {
                return Err(EngineError::NotFound(args.last().cloned().unwrap_or_default()));
            }
            return Err(EngineError::CommandFailed {
                command,
                status: output.status.code().unwrap_or(-1),
                stderr,
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

fn args<const N: usize>(items: [&str; N]) -> Vec<String> {
    items.iter().map(|s| (*s).to_string()).collect()
}

#[async_trait]
impl ContainerEngine for DockerCli {
    async fn find(&self, name: &str) -> Result<Option<ContainerInfo>, EngineError> {
        let filter = format!("name={name}");
        let stdout = self
            .control(args(["ps", "-a", "--no-trunc", "--filter", &filter, "--format", "{{json .}}"]))
            .await?;

        for line in stdout.lines().filter(|l| !l.trim().is_empty()) {
            let entry: PsEntry = serde_json::from_str(line)
                .map_err(|e| EngineError::UnexpectedOutput(format!("{e}: {line}")))?;
            // The filter is a substring match; only an exact name counts.
            if entry
                .names
                .split(',')
                .any(|n| n.trim().trim_start_matches('/') == name)
            {
                return Ok(Some(ContainerInfo {
                    id: entry.id,
                    name: name.to_string(),
                    state: ContainerState::from_status(&entry.state),
                }));
            }
        }
        Ok(None)
    }

    async fn create(&self, spec: &CreateSpec) -> Result<String, EngineError> {
        let mut argv = args(["create", "--name", &spec.name, "-w", &spec.workdir, "-t"]);
        if let Some((host, container)) = &spec.bind {
            argv.push("-v".to_string());
            argv.push(format!("{host}:{container}"));
        }
        argv.push(spec.image.clone());

        let id = self.control(argv).await?;
        if id.is_empty() {
            return Err(EngineError::UnexpectedOutput(
                "create returned no container id".to_string(),
            ));
        }
        Ok(id)
    }

    async fn start(&self, id: &str) -> Result<(), EngineError> {
        self.control(args(["start", id])).await.map(drop)
    }

    async fn state(&self, id: &str) -> Result<ContainerState, EngineError> {
        let status = self
            .control(args(["inspect", "--format", "{{.State.Status}}", id]))
            .await?;
        Ok(ContainerState::from_status(&status))
    }

    async fn stop(&self, id: &str) -> Result<(), EngineError> {
        self.control(args(["stop", id])).await.map(drop)
    }

    async fn remove(&self, id: &str) -> Result<(), EngineError> {
        self.control(args(["rm", id])).await.map(drop)
    }

    async fn exec(&self, id: &str, request: &ExecRequest) -> Result<ExecOutput, EngineError> {
        let mut argv = vec!["exec".to_string()];
        if request.stdin.is_some() {
            argv.push("-i".to_string());
        }
        argv.extend(["-w".to_string(), request.workdir.clone(), id.to_string()]);
        argv.extend(request.argv.iter().cloned());

        let run = self.run(&argv, request.stdin.as_deref());
        let output = match request.timeout {
            Some(timeout) => tokio::time::timeout(timeout, run)
                .await
                .map_err(|_| EngineError::TimedOut(timeout))??,
            None => run.await?,
        };

        Ok(ExecOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    async fn copy_archive(
        &self,
        id: &str,
        dest_dir: &str,
        archive: Vec<u8>,
    ) -> Result<(), EngineError> {
        let argv = args(["cp", "-", &format!("{id}:{dest_dir}")]);
        let output = self.run(&argv, Some(&archive)).await?;
        if !output.status.success() {
            return Err(EngineError::CommandFailed {
                command: "cp".to_string(),
                status: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_ps_entry_parses_docker_json() {
        let line = r#"{"Command":"\"/bin/sh\"","ID":"4f1c","Image":"iverilog-container","Names":"iverilog_abc","State":"exited","Status":"Exited (0)"}"#;
        let entry: PsEntry = serde_json::from_str(line).unwrap();
        assert_eq!(entry.id, "4f1c");
        assert_eq!(entry.names, "iverilog_abc");
        assert_eq!(ContainerState::from_status(&entry.state), ContainerState::Stopped);
    }

    #[tokio::test]
    async fn test_missing_binary_is_spawn_error() {
        let engine = DockerCli::new("verisim-no-such-engine-binary");
        let err = engine.find("anything").await.unwrap_err();
        assert!(matches!(err, EngineError::Spawn { .. }), "got {err:?}");
    }
}
