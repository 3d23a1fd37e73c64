//! Compile and simulate Verilog designs inside a sandbox.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future;
use tokio::sync::Mutex;

use crate::channel::TransferChannel;
use crate::config::{SandboxConfig, SimulationConfig};
use crate::diagnostics::{self, DiagnosticScanner};
use crate::engine::{ContainerEngine, DockerCli, EngineError};
use crate::error::Error;
use crate::result::TestResult;
use crate::sandbox::{Sandbox, SandboxManager, SandboxState, TeardownReport};
use crate::waveform::WaveformData;
use crate::waveform::vcd::{self, ParseOptions};

/// Exit statuses the shell uses for a tool that could not be executed.
const TOOL_NOT_RUNNABLE: [i32; 2] = [126, 127];

/// Exit statuses from here up report a tool killed by a signal.
const KILLED_BY_SIGNAL: i32 = 128;

/// Progress of the current design through the toolchain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RunPhase {
    /// Nothing written yet.
    Idle,
    /// Source and testbench are in the sandbox but not compiled.
    FilesWritten,
    /// The design compiled; the artifact can be simulated.
    Compiled,
    /// The artifact was simulated and its dump decoded.
    Simulated,
}

struct Inner {
    sandbox: Option<Sandbox>,
    phase: RunPhase,
}

/// Owns one sandbox and runs designs through the toolchain inside it.
///
/// Operations on one simulator are serialized. Call [`dispose`](Self::dispose)
/// when done; a simulator dropped without it schedules the release on the
/// current tokio runtime.
pub struct Simulator {
    manager: SandboxManager,
    channel: TransferChannel,
    config: SimulationConfig,
    scanner: DiagnosticScanner,
    parse_options: ParseOptions,
    name: String,
    command_timeout: Option<Duration>,
    inner: Mutex<Inner>,
}

impl std::fmt::Debug for Simulator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Simulator")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("parse_options", &self.parse_options)
            .field("command_timeout", &self.command_timeout)
            .finish_non_exhaustive()
    }
}

impl Simulator {
    /// Create a simulator builder.
    #[must_use]
    pub fn builder() -> SimulatorBuilder {
        SimulatorBuilder::new()
    }

    /// Name of the owned container.
    #[must_use]
    pub fn sandbox_name(&self) -> &str {
        &self.name
    }

    /// Simulation settings in use.
    #[must_use]
    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    /// Current toolchain phase.
    pub async fn phase(&self) -> RunPhase {
        self.inner.lock().await.phase
    }

    /// Write `code` and `test_code` into the sandbox and compile them.
    ///
    /// A compile that reports HDL errors is not an error: it yields a failing
    /// [`TestResult`] with the flagged lines. Output from a clean compile is
    /// kept as [`TestResult::notes`].
    ///
    /// # Errors
    ///
    /// - [`Error::FileCreationFailed`] if either file cannot be written
    /// - [`Error::CompilationFailed`] if the compiler cannot be run or is
    ///   killed by a signal
    /// - [`Error::Timeout`] if the deadline or a command timeout passes
    /// - [`Error::SandboxUnavailable`] if the sandbox was stopped or released
    #[tracing::instrument(skip_all, fields(sandbox = %self.name, code_len = code.len(), test_len = test_code.len()))]
    pub async fn run_tests(&self, code: &str, test_code: &str) -> Result<TestResult, Error> {
        let expires = self.expiry();
        self.within_deadline(async {
            let mut guard = self.inner.lock().await;
            let inner = &mut *guard;
            let sandbox = usable(inner.sandbox.as_ref())?;

            inner.phase = RunPhase::Idle;
            future::try_join(
                self.write_source(sandbox, &self.config.source_file, code),
                self.write_source(sandbox, &self.config.testbench_file, test_code),
            )
            .await?;
            inner.phase = RunPhase::FilesWritten;

            let config = &self.config;
            self.clear_outputs(
                sandbox,
                &[config.artifact_file.as_str(), config.dump_file.as_str()],
            )
            .await?;
            let result = self.compile(sandbox, expires).await?;
            if result.passed() {
                inner.phase = RunPhase::Compiled;
            }
            tracing::info!(
                passed = result.passed(),
                code_errors = result.code_error_lines().len(),
                test_errors = result.test_error_lines().len(),
                "Compilation finished"
            );
            Ok(result)
        })
        .await
    }

    async fn write_source(&self, sandbox: &Sandbox, path: &str, content: &str) -> Result<(), Error> {
        let written = self
            .channel
            .try_write_file(sandbox, path, content)
            .await
            .map_err(|e| engine_fault(e, Error::FileCreationFailed))?;
        if written.succeeded {
            Ok(())
        } else {
            Err(Error::FileCreationFailed(format!("{path}: {}", written.output)))
        }
    }

    /// Delete toolchain outputs left by an earlier run.
    async fn clear_outputs(&self, sandbox: &Sandbox, paths: &[&str]) -> Result<(), Error> {
        let argv: Vec<&str> = ["rm", "-f"].into_iter().chain(paths.iter().copied()).collect();
        let cleared = self
            .channel
            .execute_argv(sandbox, &argv)
            .await
            .map_err(|e| engine_fault(e, Error::CompilationFailed))?;
        if cleared.succeeded {
            Ok(())
        } else {
            Err(Error::CompilationFailed(format!(
                "could not remove stale outputs: {}",
                cleared.output
            )))
        }
    }

    async fn compile(&self, sandbox: &Sandbox, expires: Option<Instant>) -> Result<TestResult, Error> {
        let config = &self.config;
        let argv = self.toolchain_argv(
            &[
                config.compiler.as_str(),
                "-o",
                config.artifact_file.as_str(),
                config.source_file.as_str(),
                config.testbench_file.as_str(),
            ],
            expires,
        );
        let outcome = self
            .channel
            .execute_argv(sandbox, &argv)
            .await
            .map_err(|e| engine_fault(e, Error::CompilationFailed))?;
        if TOOL_NOT_RUNNABLE.contains(&outcome.exit_code) {
            return Err(Error::CompilationFailed(format!(
                "{} could not be run (exit status {}): {}",
                config.compiler, outcome.exit_code, outcome.output
            )));
        }
        if outcome.exit_code < 0 || outcome.exit_code >= KILLED_BY_SIGNAL {
            return Err(Error::CompilationFailed(format!(
                "{} was terminated (exit status {}): {}",
                config.compiler, outcome.exit_code, outcome.output
            )));
        }

        let lines = diagnostics::normalize(&outcome.output);
        let flagged = self.scanner.extract(&lines);
        let builder = TestResult::builder(outcome.succeeded)
            .code_error_lines(flagged.code)
            .test_error_lines(flagged.test);
        let builder = if outcome.succeeded {
            builder.notes(lines)
        } else if lines.is_empty() {
            builder.failures([format!(
                "{} exited with status {}",
                config.compiler, outcome.exit_code
            )])
        } else {
            builder.failures(lines)
        };
        Ok(builder.build()?)
    }

    /// Run the compiled design and decode its waveform dump.
    ///
    /// Any dump left by an earlier run is deleted first, so a testbench that
    /// writes none fails with [`Error::FileReadFailed`].
    ///
    /// # Errors
    ///
    /// - [`Error::CompilationFailed`] if nothing has been compiled, or the
    ///   runtime fails
    /// - [`Error::FileReadFailed`] if the dump cannot be read back
    /// - [`Error::MalformedDump`] if the dump cannot be decoded
    /// - [`Error::Timeout`] if the deadline or a command timeout passes
    /// - [`Error::SandboxUnavailable`] if the sandbox was stopped or released
    #[tracing::instrument(skip_all, fields(sandbox = %self.name))]
    pub async fn run_simulation(&self) -> Result<WaveformData, Error> {
        let expires = self.expiry();
        self.within_deadline(async {
            let mut guard = self.inner.lock().await;
            let inner = &mut *guard;
            let sandbox = usable(inner.sandbox.as_ref())?;
            let config = &self.config;

            if inner.phase < RunPhase::Compiled {
                return Err(Error::CompilationFailed(format!(
                    "no compiled artifact '{}'; compile the design first",
                    config.artifact_file
                )));
            }

            self.clear_outputs(sandbox, &[config.dump_file.as_str()]).await?;
            let argv = self.toolchain_argv(
                &[config.runtime.as_str(), config.artifact_file.as_str()],
                expires,
            );
            let run = self
                .channel
                .execute_argv(sandbox, &argv)
                .await
                .map_err(|e| engine_fault(e, Error::CompilationFailed))?;
            if !run.succeeded {
                return Err(Error::CompilationFailed(run.output));
            }

            let dump = self
                .channel
                .try_read_file(sandbox, &config.dump_file)
                .await
                .map_err(|e| engine_fault(e, Error::FileReadFailed))?;
            if !dump.succeeded {
                return Err(Error::FileReadFailed(format!(
                    "{}: {}",
                    config.dump_file, dump.output
                )));
            }

            let report = vcd::parse_with_report(&dump.output, self.parse_options)?;
            inner.phase = RunPhase::Simulated;
            tracing::info!(
                signals = report.waveform.len(),
                ignored = report.ignored.len(),
                "Simulation finished"
            );
            Ok(report.waveform)
        })
        .await
    }

    /// Check that the sandbox answers commands.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotResponding`] if the sandbox was stopped or
    /// released, or the probe command fails.
    #[tracing::instrument(skip_all, fields(sandbox = %self.name))]
    pub async fn is_active(&self) -> Result<(), Error> {
        let inner = self.inner.lock().await;
        let sandbox = match inner.sandbox.as_ref() {
            Some(sandbox) if sandbox.state() == SandboxState::Running => sandbox,
            Some(sandbox) => {
                return Err(Error::NotResponding(format!(
                    "sandbox {} is {:?}",
                    sandbox.name(),
                    sandbox.state()
                )));
            }
            None => return Err(Error::NotResponding("sandbox has been released".to_string())),
        };

        match self.channel.execute_argv(sandbox, &["echo", "alive"]).await {
            Ok(probe) if probe.succeeded => Ok(()),
            Ok(probe) => Err(Error::NotResponding(probe.output)),
            Err(e) => Err(Error::NotResponding(e.to_string())),
        }
    }

    /// Stop the container without removing it.
    ///
    /// Does nothing if the sandbox was already stopped or released.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Sandbox`] if the engine fails to stop the container.
    #[tracing::instrument(skip_all, fields(sandbox = %self.name))]
    pub async fn stop(&self) -> Result<(), Error> {
        let mut inner = self.inner.lock().await;
        match inner.sandbox.as_mut() {
            Some(sandbox) if sandbox.state() == SandboxState::Running => {
                self.manager.stop(sandbox).await
            }
            _ => Ok(()),
        }
    }

    /// Stop and remove the container and close the engine client.
    ///
    /// Every teardown step is attempted. Calling this again does nothing and
    /// returns a clean report.
    #[tracing::instrument(skip_all, fields(sandbox = %self.name))]
    pub async fn dispose(&self) -> TeardownReport {
        let mut inner = self.inner.lock().await;
        inner.phase = RunPhase::Idle;
        match inner.sandbox.take() {
            Some(sandbox) => self.manager.release(sandbox).await,
            None => TeardownReport::default(),
        }
    }

    fn expiry(&self) -> Option<Instant> {
        self.config
            .deadline
            .and_then(|deadline| Instant::now().checked_add(deadline))
    }

    /// Prefix a toolchain command with an in-container `timeout`, so that a
    /// run abandoned at its deadline does not keep running in the sandbox.
    ///
    /// The limit is the smaller of the time left before `expires` and the
    /// per-command timeout, rounded up to whole seconds.
    fn toolchain_argv(&self, argv: &[&str], expires: Option<Instant>) -> Vec<String> {
        let remaining = expires.map(|at| at.saturating_duration_since(Instant::now()));
        let limit = match (remaining, self.command_timeout) {
            (Some(remaining), Some(timeout)) => Some(remaining.min(timeout)),
            (remaining, timeout) => remaining.or(timeout),
        };
        let mut wrapped = Vec::with_capacity(argv.len() + 4);
        if let Some(limit) = limit {
            let secs = limit.as_secs() + u64::from(limit.subsec_nanos() > 0);
            wrapped.extend(["timeout", "-s", "KILL"].map(String::from));
            wrapped.push(secs.max(1).to_string());
        }
        wrapped.extend(argv.iter().map(|s| (*s).to_string()));
        wrapped
    }

    async fn within_deadline<T>(
        &self,
        operation: impl Future<Output = Result<T, Error>>,
    ) -> Result<T, Error> {
        match self.config.deadline {
            Some(deadline) => tokio::time::timeout(deadline, operation)
                .await
                .map_err(|_| {
                    tracing::warn!(sandbox = %self.name, ?deadline, "Operation exceeded deadline");
                    Error::Timeout(deadline)
                })?,
            None => operation.await,
        }
    }
}

/// Map an engine fault: a command timeout is a [`Error::Timeout`], anything
/// else goes through `otherwise`.
fn engine_fault(e: EngineError, otherwise: fn(String) -> Error) -> Error {
    match e {
        EngineError::TimedOut(after) => Error::Timeout(after),
        e => otherwise(e.to_string()),
    }
}

fn usable(sandbox: Option<&Sandbox>) -> Result<&Sandbox, Error> {
    match sandbox {
        Some(sandbox) if sandbox.state() == SandboxState::Running => Ok(sandbox),
        Some(sandbox) => Err(Error::SandboxUnavailable(format!(
            "sandbox {} is {:?}",
            sandbox.name(),
            sandbox.state()
        ))),
        None => Err(Error::SandboxUnavailable(
            "sandbox has been released".to_string(),
        )),
    }
}

impl Drop for Simulator {
    fn drop(&mut self) {
        let Some(sandbox) = self.inner.get_mut().sandbox.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let manager = self.manager.clone();
                tracing::debug!(sandbox = %self.name, "Releasing undisposed sandbox");
                handle.spawn(async move {
                    manager.release(sandbox).await;
                });
            }
            Err(_) => {
                tracing::warn!(
                    sandbox = %self.name,
                    "Simulator dropped outside a tokio runtime; container left running"
                );
            }
        }
    }
}

/// Builder for [`Simulator`].
#[derive(Default)]
pub struct SimulatorBuilder {
    engine: Option<Arc<dyn ContainerEngine>>,
    sandbox_config: SandboxConfig,
    config: SimulationConfig,
    name: Option<String>,
    parse_options: ParseOptions,
    command_timeout: Option<Duration>,
}

impl std::fmt::Debug for SimulatorBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulatorBuilder")
            .field("has_engine", &self.engine.is_some())
            .field("sandbox_config", &self.sandbox_config)
            .field("config", &self.config)
            .field("name", &self.name)
            .field("parse_options", &self.parse_options)
            .field("command_timeout", &self.command_timeout)
            .finish()
    }
}

impl SimulatorBuilder {
    /// Create a builder with default settings and the docker CLI engine.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Use `engine` instead of the docker CLI.
    #[must_use]
    pub fn with_engine(mut self, engine: Arc<dyn ContainerEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    /// Set the sandbox settings.
    #[must_use]
    pub fn with_sandbox_config(mut self, config: SandboxConfig) -> Self {
        self.sandbox_config = config;
        self
    }

    /// Set the simulation settings.
    #[must_use]
    pub fn with_simulation_config(mut self, config: SimulationConfig) -> Self {
        self.config = config;
        self
    }

    /// Attach to (or create) the container named `name`.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set how waveform dumps are decoded.
    #[must_use]
    pub const fn with_parse_options(mut self, options: ParseOptions) -> Self {
        self.parse_options = options;
        self
    }

    /// Kill any single sandbox command that runs longer than `timeout`.
    #[must_use]
    pub const fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = Some(timeout);
        self
    }

    /// Acquire the sandbox and build the simulator.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SandboxUnavailable`] if the container cannot be
    /// created or started.
    pub async fn build(self) -> Result<Simulator, Error> {
        let engine = self.engine.unwrap_or_else(|| {
            Arc::new(DockerCli::new(self.sandbox_config.engine_binary.clone()))
        });
        let manager = SandboxManager::new(Arc::clone(&engine), self.sandbox_config);
        let sandbox = manager.acquire(self.name.as_deref()).await?;

        let mut channel = TransferChannel::new(engine);
        if let Some(timeout) = self.command_timeout {
            channel = channel.with_command_timeout(timeout);
        }

        Ok(Simulator {
            scanner: DiagnosticScanner::new(&self.config.source_file, &self.config.testbench_file),
            name: sandbox.name().to_string(),
            manager,
            channel,
            config: self.config,
            parse_options: self.parse_options,
            command_timeout: self.command_timeout,
            inner: Mutex::new(Inner {
                sandbox: Some(sandbox),
                phase: RunPhase::Idle,
            }),
        })
    }
}
