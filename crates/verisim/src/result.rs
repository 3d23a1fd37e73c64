//! Outcome of compiling a design against its testbench.

use std::collections::BTreeSet;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Invariant violations when building a [`TestResult`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TestResultError {
    /// A passing result was given failure messages.
    #[error("a passing test result cannot carry failures")]
    PassedWithFailures,
    /// A failing result was given no failure messages.
    #[error("a failing test result needs at least one failure")]
    FailedWithoutFailures,
}

/// A `SystemTime` stored as seconds and nanoseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timestamp {
    /// Seconds since the Unix epoch.
    pub secs_since_epoch: u64,
    /// Nanoseconds within the second.
    pub nanos_since_epoch: u32,
}

impl From<SystemTime> for Timestamp {
    fn from(time: SystemTime) -> Self {
        let duration = time
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default();
        Self {
            secs_since_epoch: duration.as_secs(),
            nanos_since_epoch: duration.subsec_nanos(),
        }
    }
}

impl From<Timestamp> for SystemTime {
    fn from(time: Timestamp) -> Self {
        SystemTime::UNIX_EPOCH
            + std::time::Duration::new(time.secs_since_epoch, time.nanos_since_epoch)
    }
}

/// Result of a compile/test run.
///
/// `passed` is true exactly when `failures` is empty; the builder refuses any
/// other combination, and the fields cannot be changed afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TestResult {
    passed: bool,
    code_error_lines: BTreeSet<u32>,
    test_error_lines: BTreeSet<u32>,
    failures: Vec<String>,
    notes: Vec<String>,
    produced_at: Timestamp,
}

impl TestResult {
    /// Start building a result.
    #[must_use]
    pub fn builder(passed: bool) -> TestResultBuilder {
        TestResultBuilder {
            passed,
            code_error_lines: BTreeSet::new(),
            test_error_lines: BTreeSet::new(),
            failures: Vec::new(),
            notes: Vec::new(),
        }
    }

    /// Whether the run passed.
    #[must_use]
    pub fn passed(&self) -> bool {
        self.passed
    }

    /// Lines flagged in the design source.
    #[must_use]
    pub fn code_error_lines(&self) -> &BTreeSet<u32> {
        &self.code_error_lines
    }

    /// Lines flagged in the testbench.
    #[must_use]
    pub fn test_error_lines(&self) -> &BTreeSet<u32> {
        &self.test_error_lines
    }

    /// Diagnostic lines, in the order the tool printed them.
    #[must_use]
    pub fn failures(&self) -> &[String] {
        &self.failures
    }

    /// Tool output from a passing run (warnings, `$display` text).
    #[must_use]
    pub fn notes(&self) -> &[String] {
        &self.notes
    }

    /// When the result was produced.
    #[must_use]
    pub fn produced_at(&self) -> SystemTime {
        self.produced_at.into()
    }

    /// Turn a failing result into its domain error.
    ///
    /// Errors flagged in the design source are reported as
    /// [`Error::SyntaxCheckFailed`]; every other failure is reported as
    /// [`Error::TestAssertionsFailed`].
    ///
    /// # Errors
    ///
    /// Returns an error if the result did not pass.
    pub fn verdict(&self) -> Result<(), Error> {
        if self.passed {
            return Ok(());
        }
        let summary = self.failures.join("\n");
        if self.code_error_lines.is_empty() {
            Err(Error::TestAssertionsFailed(summary))
        } else {
            Err(Error::SyntaxCheckFailed(summary))
        }
    }
}

/// Builder for [`TestResult`].
#[derive(Debug, Clone)]
pub struct TestResultBuilder {
    passed: bool,
    code_error_lines: BTreeSet<u32>,
    test_error_lines: BTreeSet<u32>,
    failures: Vec<String>,
    notes: Vec<String>,
}

impl TestResultBuilder {
    /// Set the lines flagged in the design source.
    #[must_use]
    pub fn code_error_lines(mut self, lines: impl IntoIterator<Item = u32>) -> Self {
        self.code_error_lines.extend(lines);
        self
    }

    /// Set the lines flagged in the testbench.
    #[must_use]
    pub fn test_error_lines(mut self, lines: impl IntoIterator<Item = u32>) -> Self {
        self.test_error_lines.extend(lines);
        self
    }

    /// Append failure messages.
    #[must_use]
    pub fn failures<I, S>(mut self, failures: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.failures.extend(failures.into_iter().map(Into::into));
        self
    }

    /// Append informational output lines.
    #[must_use]
    pub fn notes<I, S>(mut self, notes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.notes.extend(notes.into_iter().map(Into::into));
        self
    }

    /// Validate and build the result, stamped with the current time.
    ///
    /// # Errors
    ///
    /// Returns an error if `passed` disagrees with whether failures were given.
    pub fn build(self) -> Result<TestResult, TestResultError> {
        match (self.passed, self.failures.is_empty()) {
            (true, false) => return Err(TestResultError::PassedWithFailures),
            (false, true) => return Err(TestResultError::FailedWithoutFailures),
            _ => {}
        }
        Ok(TestResult {
            passed: self.passed,
            code_error_lines: self.code_error_lines,
            test_error_lines: self.test_error_lines,
            failures: self.failures,
            notes: self.notes,
            produced_at: SystemTime::now().into(),
        })
    }
}
