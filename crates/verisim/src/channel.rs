//! Command execution and file transfer into a sandbox.
//!
//! There is no shared filesystem with the container. Files are written by
//! streaming a tar archive into the container; if the engine refuses the
//! archive, the content is streamed on standard input instead (base64, then
//! raw). Content is never interpolated into a shell string.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use base64::Engine as _;

use crate::engine::{ContainerEngine, EngineError, ExecOutput, ExecRequest};
use crate::sandbox::Sandbox;

/// Outcome of a command or transfer run inside the sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResult {
    /// True if the command exited with status 0.
    pub succeeded: bool,
    /// Exit status, or -1 when no process ran.
    pub exit_code: i32,
    /// Standard output, followed by an `ERROR:` line and standard error when
    /// standard error is non-empty.
    pub output: String,
}

impl CommandResult {
    /// A failure that did not come from a process exit status.
    #[must_use]
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            succeeded: false,
            exit_code: -1,
            output: message.into(),
        }
    }

    fn success() -> Self {
        Self {
            succeeded: true,
            exit_code: 0,
            output: String::new(),
        }
    }
}

impl From<ExecOutput> for CommandResult {
    fn from(out: ExecOutput) -> Self {
        let mut output = out.stdout;
        if !out.stderr.is_empty() {
            output.push_str("\nERROR: ");
            output.push_str(&out.stderr);
        }
        Self {
            succeeded: out.exit_code == 0,
            exit_code: out.exit_code,
            output,
        }
    }
}

/// How file content is moved into the container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMethod {
    /// Tar archive copied through the engine's copy API.
    Archive,
    /// Base64 text on stdin, decoded by `base64 -d` inside the container.
    Base64,
    /// Raw text on stdin, written by `cat`.
    Inline,
}

impl TransferMethod {
    /// Methods in the order they are attempted.
    pub const FALLBACK_ORDER: [TransferMethod; 3] = [Self::Archive, Self::Base64, Self::Inline];
}

/// Anchor `path` at `workdir`, normalizing separators.
///
/// Backslashes become forward slashes and leading slashes are stripped, so
/// absolute paths are re-rooted at the working directory.
#[must_use]
pub fn resolve_path(workdir: &str, path: &str) -> String {
    let normalized = path.replace('\\', "/");
    let relative = normalized.trim_start_matches('/');
    format!("{}/{}", workdir.trim_end_matches('/'), relative)
}

/// Runs commands and moves files in and out of a sandbox.
#[derive(Debug, Clone)]
pub struct TransferChannel {
    engine: Arc<dyn ContainerEngine>,
    command_timeout: Option<Duration>,
}

impl TransferChannel {
    /// Create a channel over `engine`.
    #[must_use]
    pub fn new(engine: Arc<dyn ContainerEngine>) -> Self {
        Self {
            engine,
            command_timeout: None,
        }
    }

    /// Kill any single command that runs longer than `timeout`.
    #[must_use]
    pub const fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = Some(timeout);
        self
    }

    /// Run `command` through `sh -c` in the sandbox working directory.
    ///
    /// Only use this for trusted command text; anything carrying untrusted
    /// names or content should go through [`execute_argv`](Self::execute_argv).
    ///
    /// # Errors
    ///
    /// Returns an error if the engine could not run the command at all.
    pub async fn execute(
        &self,
        sandbox: &Sandbox,
        command: &str,
    ) -> Result<CommandResult, EngineError> {
        self.execute_argv(sandbox, &["sh", "-c", command]).await
    }

    /// Run an argument vector in the sandbox working directory, no shell.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine could not run the command at all.
    pub async fn execute_argv<S: AsRef<str>>(
        &self,
        sandbox: &Sandbox,
        argv: &[S],
    ) -> Result<CommandResult, EngineError> {
        let request = self.request(sandbox, argv);
        self.run(sandbox, request).await
    }

    fn request<S: AsRef<str>>(&self, sandbox: &Sandbox, argv: &[S]) -> ExecRequest {
        let mut request = ExecRequest::new(
            argv.iter().map(|s| AsRef::<str>::as_ref(s)),
            sandbox.workdir(),
        );
        request.timeout = self.command_timeout;
        request
    }

    async fn run(
        &self,
        sandbox: &Sandbox,
        request: ExecRequest,
    ) -> Result<CommandResult, EngineError> {
        tracing::debug!(sandbox = %sandbox.name(), argv = ?request.argv, "Executing in sandbox");
        let output = self.engine.exec(sandbox.id(), &request).await?;
        let result = CommandResult::from(output);
        tracing::debug!(
            sandbox = %sandbox.name(),
            exit_code = result.exit_code,
            output_len = result.output.len(),
            "Command finished"
        );
        Ok(result)
    }

    /// Write `content` to `path` inside the sandbox.
    ///
    /// Parent directories are created first. Transfer methods are tried in
    /// [`TransferMethod::FALLBACK_ORDER`] until one succeeds, then the file's
    /// existence is verified. Engine faults are reported as a failed result.
    pub async fn write_file(&self, sandbox: &Sandbox, path: &str, content: &str) -> CommandResult {
        self.try_write_file(sandbox, path, content)
            .await
            .unwrap_or_else(|e| CommandResult::failure(e.to_string()))
    }

    /// Like [`write_file`](Self::write_file), but a command timeout is
    /// returned as [`EngineError::TimedOut`] instead of a failed result. No
    /// further transfer method is tried after a timeout.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::TimedOut`] only; other faults are folded into
    /// the result.
    pub async fn try_write_file(
        &self,
        sandbox: &Sandbox,
        path: &str,
        content: &str,
    ) -> Result<CommandResult, EngineError> {
        let full_path = resolve_path(sandbox.workdir(), path);
        let Some((dir, file_name)) = full_path.rsplit_once('/') else {
            return Ok(CommandResult::failure(format!("invalid path: {path}")));
        };
        if file_name.is_empty() {
            return Ok(CommandResult::failure(format!("path names a directory: {path}")));
        }
        let dir = if dir.is_empty() { "/" } else { dir };

        match self.execute_argv(sandbox, &["mkdir", "-p", dir]).await {
            Ok(r) if r.succeeded => {}
            Ok(r) => {
                return Ok(CommandResult::failure(format!(
                    "Failed to create directory: {}",
                    r.output
                )));
            }
            Err(e) => return fold_fault(e, "Failed to create directory: "),
        }

        let mut transfer = CommandResult::failure("no transfer method attempted");
        for method in TransferMethod::FALLBACK_ORDER {
            transfer = match self
                .transfer(method, sandbox, dir, file_name, &full_path, content)
                .await
            {
                Ok(result) => result,
                Err(e) => fold_fault(e, "")?,
            };
            if transfer.succeeded {
                tracing::debug!(path = %full_path, ?method, bytes = content.len(), "File written");
                break;
            }
            tracing::warn!(
                path = %full_path,
                ?method,
                output = %transfer.output,
                "File transfer failed, trying next method"
            );
        }

        if !transfer.succeeded {
            return Ok(transfer);
        }

        match self
            .execute_argv(sandbox, &["test", "-f", full_path.as_str()])
            .await
        {
            Ok(check) if check.succeeded => Ok(transfer),
            Ok(_) => Ok(CommandResult::failure("File verification failed")),
            Err(e) => fold_fault(e, "File verification failed: "),
        }
    }

    async fn transfer(
        &self,
        method: TransferMethod,
        sandbox: &Sandbox,
        dir: &str,
        file_name: &str,
        full_path: &str,
        content: &str,
    ) -> Result<CommandResult, EngineError> {
        match method {
            TransferMethod::Archive => {
                let archive = build_archive(file_name, content.as_bytes())
                    .map_err(|e| EngineError::UnexpectedOutput(format!("archive: {e}")))?;
                self.engine.copy_archive(sandbox.id(), dir, archive).await?;
                Ok(CommandResult::success())
            }
            TransferMethod::Base64 => {
                let encoded = base64::engine::general_purpose::STANDARD.encode(content);
                let request = self
                    .request(sandbox, &["sh", "-c", "base64 -d > \"$1\"", "sh", full_path])
                    .with_stdin(encoded);
                self.run(sandbox, request).await
            }
            TransferMethod::Inline => {
                let request = self
                    .request(sandbox, &["sh", "-c", "cat > \"$1\"", "sh", full_path])
                    .with_stdin(content);
                self.run(sandbox, request).await
            }
        }
    }

    /// Read `path` from the sandbox.
    ///
    /// The result holds the file content followed by any error output.
    /// Engine faults are reported as a failed result.
    pub async fn read_file(&self, sandbox: &Sandbox, path: &str) -> CommandResult {
        self.try_read_file(sandbox, path)
            .await
            .unwrap_or_else(|e| CommandResult::failure(e.to_string()))
    }

    /// Like [`read_file`](Self::read_file), but a command timeout is
    /// returned as [`EngineError::TimedOut`].
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::TimedOut`] only; other faults are folded into
    /// the result.
    pub async fn try_read_file(
        &self,
        sandbox: &Sandbox,
        path: &str,
    ) -> Result<CommandResult, EngineError> {
        let full_path = resolve_path(sandbox.workdir(), path);
        match self.execute_argv(sandbox, &["cat", full_path.as_str()]).await {
            Ok(result) => Ok(result),
            Err(e) => fold_fault(e, ""),
        }
    }
}

/// Keep a timeout as an error; turn any other engine fault into a failed
/// result prefixed with `context`.
fn fold_fault(e: EngineError, context: &str) -> Result<CommandResult, EngineError> {
    match e {
        EngineError::TimedOut(_) => Err(e),
        e => Ok(CommandResult::failure(format!("{context}{e}"))),
    }
}

/// Build a single-file tar archive.
fn build_archive(file_name: &str, content: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut header = tar::Header::new_gnu();
    header.set_size(content.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(
        SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs(),
    );
    header.set_cksum();

    let mut builder = tar::Builder::new(Vec::new());
    builder.append_data(&mut header, file_name, content)?;
    builder.into_inner()
}
