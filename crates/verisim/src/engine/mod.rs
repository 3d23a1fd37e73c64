//! Container engine boundary.
//!
//! The sandbox lifecycle manager and the transfer channel talk to the
//! container engine only through the [`ContainerEngine`] trait. The default
//! implementation, [`DockerCli`], drives the `docker` command line; tests
//! substitute an in-memory engine.
//!
//! Commands are always passed as an argument vector. Nothing in this layer
//! builds a shell string.

mod docker;

use std::time::Duration;

use async_trait::async_trait;

pub use docker::DockerCli;

/// Errors reported by a container engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The engine process could not be spawned or its pipes failed.
    #[error("failed to run {program}: {source}")]
    Spawn {
        /// Program that was being run.
        program: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// An engine control command exited unsuccessfully.
    #[error("`{command}` exited with status {status}: {stderr}")]
    CommandFailed {
        /// Engine subcommand, e.g. "create" or "start".
        command: String,
        /// Exit status, or -1 if terminated by a signal.
        status: i32,
        /// Trimmed standard error of the engine process.
        stderr: String,
    },

    /// The engine returned output that could not be interpreted.
    #[error("unexpected engine output: {0}")]
    UnexpectedOutput(String),

    /// The container is not known to the engine.
    #[error("no such container: {0}")]
    NotFound(String),

    /// The engine did not complete within the given limit.
    #[error("engine operation timed out after {0:?}")]
    TimedOut(Duration),
}

/// Lifecycle state of a container as reported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    /// Created but never started.
    Created,
    /// Running.
    Running,
    /// Stopped, exited, or paused.
    Stopped,
    /// Being removed or already gone.
    Removed,
}

impl ContainerState {
    /// Map an engine status string ("running", "exited", ...) to a state.
    #[must_use]
    pub fn from_status(status: &str) -> Self {
        match status.trim().to_ascii_lowercase().as_str() {
            "running" | "restarting" => Self::Running,
            "created" => Self::Created,
            "removing" | "dead" => Self::Removed,
            _ => Self::Stopped,
        }
    }
}

/// A container found by name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerInfo {
    /// Engine-assigned container id.
    pub id: String,
    /// Container name without the leading `/`.
    pub name: String,
    /// Current state.
    pub state: ContainerState,
}

/// Parameters for creating a container.
#[derive(Debug, Clone)]
pub struct CreateSpec {
    /// Container name.
    pub name: String,
    /// Image to create from.
    pub image: String,
    /// Working directory inside the container.
    pub workdir: String,
    /// Optional `(host_dir, container_dir)` bind mount.
    pub bind: Option<(String, String)>,
}

/// A command to execute inside a running container.
#[derive(Debug, Clone)]
pub struct ExecRequest {
    /// Program and arguments.
    pub argv: Vec<String>,
    /// Working directory for the command.
    pub workdir: String,
    /// Bytes fed to the command's standard input, if any.
    pub stdin: Option<Vec<u8>>,
    /// Give up on the command if it has not finished in time. Only the engine
    /// client is killed; bounding the process inside the container is up to
    /// the caller.
    pub timeout: Option<Duration>,
}

impl ExecRequest {
    /// Build a request from an argument vector.
    #[must_use]
    pub fn new<I, S>(argv: I, workdir: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
            workdir: workdir.into(),
            stdin: None,
            timeout: None,
        }
    }

    /// Feed `bytes` to the command's standard input.
    #[must_use]
    pub fn with_stdin(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(bytes.into());
        self
    }
}

/// Raw outcome of a command run inside a container.
#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    /// Exit code, or -1 if the process was terminated by a signal.
    pub exit_code: i32,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

/// Operations the sandbox needs from a container engine.
///
/// Implementations must be safe to share between tasks; callers serialize
/// lifecycle operations against command execution for a given container.
#[async_trait]
pub trait ContainerEngine: Send + Sync + std::fmt::Debug {
    /// Look up a container (running or not) by exact name.
    async fn find(&self, name: &str) -> Result<Option<ContainerInfo>, EngineError>;

    /// Create a container and return its id. Does not start it.
    async fn create(&self, spec: &CreateSpec) -> Result<String, EngineError>;

    /// Start a created or stopped container.
    async fn start(&self, id: &str) -> Result<(), EngineError>;

    /// Current state of a container.
    async fn state(&self, id: &str) -> Result<ContainerState, EngineError>;

    /// Stop a running container.
    async fn stop(&self, id: &str) -> Result<(), EngineError>;

    /// Remove a stopped container.
    async fn remove(&self, id: &str) -> Result<(), EngineError>;

    /// Run a command inside a running container and wait for it to exit.
    async fn exec(&self, id: &str, request: &ExecRequest) -> Result<ExecOutput, EngineError>;

    /// Extract a tar archive into `dest_dir` inside the container.
    async fn copy_archive(&self, id: &str, dest_dir: &str, archive: Vec<u8>)
    -> Result<(), EngineError>;

    /// Release client-side resources. The engine is unusable afterwards.
    async fn close(&self) -> Result<(), EngineError> {
        Ok(())
    }
}
