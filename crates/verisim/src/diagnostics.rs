//! Error-location extraction from compiler and test output.
//!
//! Icarus Verilog reports problems as `<file>:<line>: <message>`. The scanner
//! looks for two file labels, the design source and the testbench, and
//! collects the line numbers that follow them. Anything else is ignored, so
//! scanning never fails.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;

/// Split raw tool output into non-empty lines.
///
/// Real newlines, backslash-escaped newlines and the two-character sequence
/// `\n` all split lines. Trailing carriage returns are dropped.
#[must_use]
pub fn normalize(raw: &str) -> Vec<String> {
    raw.replace("\\\n", "\n")
        .replace("\\n", "\n")
        .split('\n')
        .map(|line| line.trim_end_matches('\r'))
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

/// Line numbers flagged in the source and testbench files.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorLines {
    /// Lines flagged in the design source.
    pub code: BTreeSet<u32>,
    /// Lines flagged in the testbench.
    pub test: BTreeSet<u32>,
}

impl ErrorLines {
    /// True if no line was flagged in either file.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.code.is_empty() && self.test.is_empty()
    }
}

/// Scans diagnostic lines for `<label>:<line>:` references.
#[derive(Debug, Clone)]
pub struct DiagnosticScanner {
    code: Regex,
    test: Regex,
}

static DEFAULT_SCANNER: LazyLock<DiagnosticScanner> =
    LazyLock::new(|| DiagnosticScanner::new("main.v", "test.v"));

impl Default for DiagnosticScanner {
    fn default() -> Self {
        DEFAULT_SCANNER.clone()
    }
}

impl DiagnosticScanner {
    /// Build a scanner for the given source and testbench file labels.
    #[must_use]
    pub fn new(code_label: &str, test_label: &str) -> Self {
        Self {
            code: label_pattern(code_label),
            test: label_pattern(test_label),
        }
    }

    /// Collect every flagged line number from `lines`.
    #[must_use]
    pub fn extract<S: AsRef<str>>(&self, lines: &[S]) -> ErrorLines {
        let mut found = ErrorLines::default();
        for line in lines {
            let line = line.as_ref();
            collect(&self.code, line, &mut found.code);
            collect(&self.test, line, &mut found.test);
        }
        found
    }
}

/// Collect flagged lines using the default `main.v` / `test.v` labels.
#[must_use]
pub fn extract_error_lines<S: AsRef<str>>(lines: &[S]) -> ErrorLines {
    DEFAULT_SCANNER.extract(lines)
}

// An escaped literal followed by fixed syntax always compiles.
#[allow(clippy::expect_used)]
fn label_pattern(label: &str) -> Regex {
    // The label must start the line or follow whitespace or a path separator.
    Regex::new(&format!(r"(?:^|[\s/\\]){}:\s*(\d+)\s*:", regex::escape(label)))
        .expect("escaped label pattern is valid")
}

fn collect(pattern: &Regex, line: &str, into: &mut BTreeSet<u32>) {
    for caps in pattern.captures_iter(line) {
        if let Some(n) = caps.get(1).and_then(|m| m.as_str().parse::<u32>().ok())
            && n > 0
        {
            into.insert(n);
        }
    }
}
