//! Sandbox lifecycle: acquire a running container, release it best-effort.

use std::sync::Arc;
use std::time::Instant;

use crate::config::SandboxConfig;
use crate::engine::{ContainerEngine, ContainerState, CreateSpec, EngineError};
use crate::error::Error;

/// Lifecycle state of a sandbox as tracked by its owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxState {
    /// Not created yet.
    Absent,
    /// Created but not started.
    Created,
    /// Running and accepting commands.
    Running,
    /// Stopped; can be started again.
    Stopped,
    /// Removed from the engine.
    Removed,
}

/// A container owned by exactly one orchestrator.
#[derive(Debug)]
pub struct Sandbox {
    id: String,
    name: String,
    workdir: String,
    state: SandboxState,
}

impl Sandbox {
    /// Engine-assigned container id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Container name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Absolute working directory inside the container.
    #[must_use]
    pub fn workdir(&self) -> &str {
        &self.workdir
    }

    /// Last known lifecycle state.
    #[must_use]
    pub fn state(&self) -> SandboxState {
        self.state
    }
}

/// A teardown step performed by [`SandboxManager::release`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownStep {
    /// Stop the container.
    Stop,
    /// Remove the container.
    Remove,
    /// Close the engine client.
    CloseClient,
}

/// Outcome of a best-effort teardown.
///
/// Every step is attempted; failures are collected instead of aborting.
#[derive(Debug, Default)]
pub struct TeardownReport {
    /// Steps that failed, in the order they ran.
    pub failures: Vec<(TeardownStep, EngineError)>,
}

impl TeardownReport {
    /// True if every step succeeded.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    fn record(&mut self, step: TeardownStep, result: Result<(), EngineError>) {
        if let Err(e) = result {
            tracing::warn!(?step, error = %e, "Sandbox teardown step failed");
            self.failures.push((step, e));
        }
    }
}

/// Creates, attaches to, and tears down sandbox containers.
#[derive(Debug, Clone)]
pub struct SandboxManager {
    engine: Arc<dyn ContainerEngine>,
    config: SandboxConfig,
}

impl SandboxManager {
    /// Create a manager using `engine` and `config`.
    #[must_use]
    pub fn new(engine: Arc<dyn ContainerEngine>, config: SandboxConfig) -> Self {
        Self { engine, config }
    }

    /// The engine this manager drives.
    #[must_use]
    pub fn engine(&self) -> &Arc<dyn ContainerEngine> {
        &self.engine
    }

    /// The sandbox configuration.
    #[must_use]
    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Generate a fresh container name from the configured prefix.
    #[must_use]
    pub fn generate_name(&self) -> String {
        format!("{}_{}", self.config.name_prefix, uuid::Uuid::new_v4().simple())
    }

    /// Acquire a running sandbox.
    ///
    /// With a `name` that matches an existing container, that container is
    /// reused and started if it is not running. Otherwise a new container is
    /// created (under `name`, or a generated one) and started.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SandboxUnavailable`] if the container cannot be
    /// found, created, or started, or does not reach the running state within
    /// the configured start timeout.
    pub async fn acquire(&self, name: Option<&str>) -> Result<Sandbox, Error> {
        let unavailable = |e: EngineError| Error::SandboxUnavailable(e.to_string());

        if let Some(name) = name
            && let Some(existing) = self.engine.find(name).await.map_err(unavailable)?
        {
            tracing::info!(
                name = %name,
                id = %existing.id,
                state = ?existing.state,
                "Reusing existing sandbox"
            );
            let mut sandbox = Sandbox {
                id: existing.id,
                name: existing.name,
                workdir: self.config.workdir.clone(),
                state: SandboxState::Stopped,
            };
            if existing.state == ContainerState::Running {
                sandbox.state = SandboxState::Running;
            } else {
                self.start(&mut sandbox).await?;
            }
            return Ok(sandbox);
        }

        let name = name.map_or_else(|| self.generate_name(), str::to_string);
        let spec = CreateSpec {
            name: name.clone(),
            image: self.config.image.clone(),
            workdir: self.config.workdir.clone(),
            bind: self.config.bind_host_dir.as_ref().map(|dir| {
                (dir.display().to_string(), self.config.workdir.clone())
            }),
        };

        let id = self.engine.create(&spec).await.map_err(unavailable)?;
        tracing::info!(name = %name, id = %id, image = %spec.image, "Created sandbox");

        let mut sandbox = Sandbox {
            id,
            name,
            workdir: self.config.workdir.clone(),
            state: SandboxState::Created,
        };
        self.start(&mut sandbox).await?;
        Ok(sandbox)
    }

    /// Start `sandbox` and block until the engine reports it running.
    async fn start(&self, sandbox: &mut Sandbox) -> Result<(), Error> {
        self.engine
            .start(&sandbox.id)
            .await
            .map_err(|e| Error::SandboxUnavailable(e.to_string()))?;
        self.wait_running(sandbox).await?;
        sandbox.state = SandboxState::Running;
        tracing::debug!(name = %sandbox.name, "Sandbox running");
        Ok(())
    }

    async fn wait_running(&self, sandbox: &Sandbox) -> Result<(), Error> {
        let deadline = Instant::now() + self.config.start_timeout;
        loop {
            match self.engine.state(&sandbox.id).await {
                Ok(ContainerState::Running) => return Ok(()),
                Ok(ContainerState::Removed) => {
                    return Err(Error::SandboxUnavailable(format!(
                        "container {} was removed while starting",
                        sandbox.name
                    )));
                }
                Ok(state) => tracing::trace!(?state, "Waiting for sandbox to run"),
                Err(e) => return Err(Error::SandboxUnavailable(e.to_string())),
            }
            if Instant::now() >= deadline {
                return Err(Error::SandboxUnavailable(format!(
                    "container {} did not reach running state within {:?}",
                    sandbox.name, self.config.start_timeout
                )));
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }

    /// Stop `sandbox` without removing it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Sandbox`] if the engine fails to stop the container.
    pub async fn stop(&self, sandbox: &mut Sandbox) -> Result<(), Error> {
        self.engine.stop(&sandbox.id).await?;
        sandbox.state = SandboxState::Stopped;
        tracing::info!(name = %sandbox.name, "Sandbox stopped");
        Ok(())
    }

    /// Stop and remove `sandbox`, then close the engine client.
    ///
    /// Every step runs even if an earlier one fails. This never returns an
    /// error; failures are collected in the returned report.
    pub async fn release(&self, mut sandbox: Sandbox) -> TeardownReport {
        let mut report = TeardownReport::default();

        if sandbox.state != SandboxState::Stopped {
            let stopped = self.engine.stop(&sandbox.id).await;
            if stopped.is_ok() {
                sandbox.state = SandboxState::Stopped;
            }
            report.record(TeardownStep::Stop, stopped);
        }

        let removed = self.engine.remove(&sandbox.id).await;
        if removed.is_ok() {
            sandbox.state = SandboxState::Removed;
        }
        report.record(TeardownStep::Remove, removed);

        report.record(TeardownStep::CloseClient, self.engine.close().await);

        tracing::info!(
            name = %sandbox.name,
            state = ?sandbox.state,
            failed_steps = report.failures.len(),
            "Sandbox released"
        );
        report
    }
}
