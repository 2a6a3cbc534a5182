//! Detection of engine errors in stderr output.
//!
//! The engine reports an error by echoing the offending input line, then a
//! line holding a single caret under the bad token, then the diagnostic:
//!
//! ```text
//!          print undefined_name
//!                ^
//!          "line 0: undefined variable: undefined_name"
//! ```
//!
//! Recognition is a heuristic over unstructured text. Multi-line commands or
//! several carets for one command still produce a report, but the echoed
//! line is only a best guess.

use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref CARET_LINE: Regex = Regex::new(r"^\s*\^\s*$").unwrap();
}

/// Error text recovered from an error window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorReport {
    /// Line echoed by the engine just before the caret
    pub echoed: Option<String>,
    /// Non-blank lines from the echo through the end of the window
    pub message: String,
    /// Raw lines the report was built from
    pub lines: Vec<String>,
}

/// Scanner for the caret error convention.
#[derive(Debug, Clone, Copy, Default)]
pub struct ErrorDetector;

impl ErrorDetector {
    /// Create a new detector.
    pub fn new() -> Self {
        Self
    }

    /// Whether `line` is a caret marker line.
    pub fn is_caret_line(&self, line: &str) -> bool {
        CARET_LINE.is_match(line)
    }

    /// Position of the first caret line in `lines`.
    pub fn find_caret(&self, lines: &[String]) -> Option<usize> {
        lines.iter().position(|line| self.is_caret_line(line))
    }

    /// Start of the error text for a caret at `caret`: the echoed line
    /// before it, or the caret itself at the top of the window.
    pub fn report_start(&self, caret: usize) -> usize {
        caret.saturating_sub(1)
    }

    /// Build a report from lines that begin at [`ErrorDetector::report_start`].
    pub fn report(&self, lines: Vec<String>) -> ErrorReport {
        let echoed = lines
            .first()
            .filter(|line| !self.is_caret_line(line))
            .map(|line| line.trim().to_string());

        let message = lines
            .iter()
            .map(|line| line.trim_end())
            .filter(|line| !line.trim().is_empty())
            .collect::<Vec<_>>()
            .join("\n");

        ErrorReport {
            echoed,
            message,
            lines,
        }
    }

    /// Scan a window and build a report if it holds an error.
    pub fn scan(&self, window: &[String]) -> Option<ErrorReport> {
        let caret = self.find_caret(window)?;
        Some(self.report(window[self.report_start(caret)..].to_vec()))
    }
}
