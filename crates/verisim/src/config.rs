//! Sandbox and simulation configuration.
//!
//! Both config types have sensible defaults for the `iverilog-container`
//! image, can be adjusted with `with_*` builder methods, deserialized from a
//! host configuration file (every field is optional), or overridden from
//! `VERISIM_*` environment variables.
//!
//! # Example
//!
//! ```rust
//! use std::time::Duration;
//! use verisim::{SandboxConfig, SimulationConfig};
//!
//! let sandbox = SandboxConfig::default()
//!     .with_image("my-registry/iverilog:12")
//!     .with_name_prefix("ci");
//!
//! let simulation = SimulationConfig::default().with_deadline(Duration::from_secs(60));
//! assert_eq!(simulation.source_file, "main.v");
//! assert_eq!(sandbox.workdir, "/workspace");
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// Default container image with the Icarus Verilog toolchain.
pub const DEFAULT_IMAGE: &str = "iverilog-container";

/// Default working directory inside the container.
pub const DEFAULT_WORKDIR: &str = "/workspace";

/// How to create and reach the sandbox container.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Container engine CLI binary (e.g. "docker", "podman").
    pub engine_binary: String,
    /// Image to create new containers from.
    pub image: String,
    /// Prefix for generated container names (`<prefix>_<uuid>`).
    pub name_prefix: String,
    /// Absolute working directory inside the container.
    pub workdir: String,
    /// Host directory bind-mounted at `workdir` for inspection, if any.
    pub bind_host_dir: Option<PathBuf>,
    /// Upper bound on waiting for a started container to report running.
    #[serde(with = "duration_millis")]
    pub start_timeout: Duration,
    /// Interval between state polls while waiting for the container.
    #[serde(with = "duration_millis")]
    pub poll_interval: Duration,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            engine_binary: "docker".to_string(),
            image: DEFAULT_IMAGE.to_string(),
            name_prefix: "iverilog".to_string(),
            workdir: DEFAULT_WORKDIR.to_string(),
            bind_host_dir: None,
            start_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(100),
        }
    }
}

impl SandboxConfig {
    /// Defaults overridden by `VERISIM_ENGINE`, `VERISIM_IMAGE`,
    /// `VERISIM_WORKDIR` and `VERISIM_NAME_PREFIX` when they are set.
    #[must_use]
    pub fn from_env() -> Self {
        Self::default().with_env_overrides(|key| std::env::var(key).ok())
    }

    fn with_env_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(engine) = lookup("VERISIM_ENGINE") {
            self.engine_binary = engine;
        }
        if let Some(image) = lookup("VERISIM_IMAGE") {
            self.image = image;
        }
        if let Some(workdir) = lookup("VERISIM_WORKDIR") {
            self.workdir = workdir;
        }
        if let Some(prefix) = lookup("VERISIM_NAME_PREFIX") {
            self.name_prefix = prefix;
        }
        self
    }

    /// Set the engine CLI binary.
    #[must_use]
    pub fn with_engine_binary(mut self, binary: impl Into<String>) -> Self {
        self.engine_binary = binary.into();
        self
    }

    /// Set the container image.
    #[must_use]
    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = image.into();
        self
    }

    /// Set the prefix used for generated container names.
    #[must_use]
    pub fn with_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.name_prefix = prefix.into();
        self
    }

    /// Set the working directory inside the container.
    #[must_use]
    pub fn with_workdir(mut self, workdir: impl Into<String>) -> Self {
        self.workdir = workdir.into();
        self
    }

    /// Bind-mount a host directory at the working directory.
    #[must_use]
    pub fn with_bind_host_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.bind_host_dir = Some(dir.into());
        self
    }

    /// Set how long to wait for a started container to report running.
    #[must_use]
    pub const fn with_start_timeout(mut self, timeout: Duration) -> Self {
        self.start_timeout = timeout;
        self
    }

    /// Set the state polling interval.
    #[must_use]
    pub const fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// Fixed file names and toolchain commands used by a simulation run.
///
/// All file names are relative to the sandbox working directory.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Design source file.
    pub source_file: String,
    /// Testbench file.
    pub testbench_file: String,
    /// Compiled executable produced by the compiler.
    pub artifact_file: String,
    /// Waveform dump written by the testbench (`$dumpfile`).
    pub dump_file: String,
    /// Compiler binary.
    pub compiler: String,
    /// Runtime binary that executes the compiled artifact.
    pub runtime: String,
    /// Deadline applied to each `run_tests` / `run_simulation` call.
    #[serde(with = "duration_secs_opt")]
    pub deadline: Option<Duration>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            source_file: "main.v".to_string(),
            testbench_file: "test.v".to_string(),
            artifact_file: "output.vvp".to_string(),
            dump_file: "waveform.vcd".to_string(),
            compiler: "iverilog".to_string(),
            runtime: "vvp".to_string(),
            deadline: None,
        }
    }
}

impl SimulationConfig {
    /// Defaults overridden by `VERISIM_DEADLINE_SECS` when set to an integer.
    #[must_use]
    pub fn from_env() -> Self {
        Self::default().with_env_overrides(|key| std::env::var(key).ok())
    }

    fn with_env_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        match lookup("VERISIM_DEADLINE_SECS").map(|v| v.trim().parse::<u64>()) {
            Some(Ok(secs)) => self.deadline = Some(Duration::from_secs(secs)),
            Some(Err(e)) => {
                tracing::warn!(error = %e, "Ignoring invalid VERISIM_DEADLINE_SECS");
            }
            None => {}
        }
        self
    }

    /// Set the per-operation deadline.
    #[must_use]
    pub const fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Set the source and testbench file names.
    #[must_use]
    pub fn with_sources(mut self, source: impl Into<String>, testbench: impl Into<String>) -> Self {
        self.source_file = source.into();
        self.testbench_file = testbench.into();
        self
    }

    /// Set the dump file name the testbench writes to.
    #[must_use]
    pub fn with_dump_file(mut self, dump_file: impl Into<String>) -> Self {
        self.dump_file = dump_file.into();
        self
    }
}

/// Serde module for durations written as integer milliseconds.
mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Serde module for optional durations written as integer seconds.
mod duration_secs_opt {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_secs))
    }
}
