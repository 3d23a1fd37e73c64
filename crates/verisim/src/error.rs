//! Error types for sandboxed simulation.

use crate::engine::EngineError;
use crate::result::TestResultError;

/// Errors surfaced by the public simulation operations.
///
/// Every variant carries a stable machine-readable [`code`](Error::code) in
/// addition to its human-readable message.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The container could not be created or started.
    #[error("sandbox unavailable: {0}")]
    SandboxUnavailable(String),

    /// The liveness probe against the sandbox failed.
    #[error("sandbox is not responding: {0}")]
    NotResponding(String),

    /// Writing a source file into the sandbox failed after every transfer method.
    #[error("failed to create file: {0}")]
    FileCreationFailed(String),

    /// Reading a file back out of the sandbox failed.
    #[error("failed to read file content: {0}")]
    FileReadFailed(String),

    /// The toolchain itself failed (crash, missing tool, engine fault),
    /// as opposed to a clean compile that reports HDL errors.
    #[error("compilation failed: {0}")]
    CompilationFailed(String),

    /// The waveform dump could not be decoded.
    #[error("malformed waveform dump: {0}")]
    MalformedDump(String),

    /// The design compiled cleanly but the source file has errors.
    #[error("verilog syntax validation failed: {0}")]
    SyntaxCheckFailed(String),

    /// The testbench reported failures.
    #[error("test assertions failed: {0}")]
    TestAssertionsFailed(String),

    /// The operation did not finish before its deadline.
    #[error("simulation timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// A container engine operation failed outside of the cases above.
    #[error("container error: {0}")]
    Sandbox(#[from] EngineError),

    /// A result value violated its construction invariants.
    #[error("invalid result: {0}")]
    InvalidResult(#[from] TestResultError),
}

impl Error {
    /// Stable machine-readable code for this error.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Error::SandboxUnavailable(_) => "Sandbox.Unavailable",
            Error::NotResponding(_) => "Sandbox.NotResponding",
            Error::FileCreationFailed(_) => "File.CreationFailed",
            Error::FileReadFailed(_) => "File.ReadFailed",
            Error::CompilationFailed(_) => "Compilation.Failed",
            Error::MalformedDump(_) => "Parsing.MalformedDump",
            Error::SyntaxCheckFailed(_) => "Validation.SyntaxCheckFailed",
            Error::TestAssertionsFailed(_) => "Validation.TestAssertionsFailed",
            Error::Timeout(_) => "Simulation.Timeout",
            Error::Sandbox(_) => "Sandbox.OperationFailed",
            Error::InvalidResult(_) => "Validation.InvalidResult",
        }
    }
}
