//! # Verisim
//!
//! Compile and simulate untrusted Verilog inside a disposable container.
//!
//! Verisim drives an Icarus Verilog toolchain (`iverilog` + `vvp`) running in
//! a container and turns its two text outputs into structured data:
//!
//! - **Sandbox lifecycle** - create or attach to a named container, tear it
//!   down best-effort
//! - **File transfer without mounts** - tar archive copy, with stdin fallbacks
//! - **Diagnostics** - per-file line numbers extracted from compiler output
//! - **Waveforms** - value change dumps decoded into typed signal traces
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use verisim::Simulator;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), verisim::Error> {
//!     let simulator = Simulator::builder().build().await?;
//!
//!     let result = simulator
//!         .run_tests("module top; endmodule", "module tb; top t(); endmodule")
//!         .await?;
//!     if result.passed() {
//!         let waveform = simulator.run_simulation().await?;
//!         for (alias, signal) in waveform.signals() {
//!             println!("{alias} {}: {} changes", signal.name(), signal.len());
//!         }
//!     }
//!
//!     simulator.dispose().await;
//!     Ok(())
//! }
//! ```
//!
//! The container engine is abstracted behind [`ContainerEngine`]; the
//! default is [`DockerCli`], which shells out to the `docker` binary with
//! structured arguments.

#![forbid(unsafe_code)]

pub mod channel;
mod config;
pub mod diagnostics;
pub mod engine;
mod error;
mod result;
pub mod sandbox;
mod simulator;
pub mod waveform;

pub use channel::{CommandResult, TransferChannel};
pub use config::{DEFAULT_IMAGE, DEFAULT_WORKDIR, SandboxConfig, SimulationConfig};
pub use diagnostics::{DiagnosticScanner, ErrorLines, extract_error_lines};
pub use engine::{ContainerEngine, DockerCli, EngineError};
pub use error::Error;
pub use result::{TestResult, TestResultBuilder, TestResultError, Timestamp};
pub use sandbox::{Sandbox, SandboxManager, SandboxState, TeardownReport, TeardownStep};
pub use simulator::{RunPhase, Simulator, SimulatorBuilder};
pub use waveform::vcd::{Ignored, ParseOptions, ParseReport, WidthPolicy};
pub use waveform::{Signal, SignalError, TimeUnit, VerilogDataType, WaveformData, WaveformError};
