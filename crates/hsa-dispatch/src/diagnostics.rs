//! Diagnostic message buffer.
//!
//! Every failure in the dispatch path is recorded here as one line, in
//! addition to being returned as an error, so a caller can print the full
//! history of a failed `run()` at once.

use crate::error::DispatchError;
use tracing::warn;

#[derive(Debug, Default, Clone)]
pub struct Diagnostics {
    lines: Vec<String>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an informational line.
    pub fn note(&mut self, line: impl Into<String>) {
        self.lines.push(line.into());
    }

    /// Record a failure and hand the error back for propagation.
    pub fn record(&mut self, err: DispatchError) -> DispatchError {
        match &err {
            DispatchError::Runtime { context, status } => {
                warn!(status = status.code(), "{context}: {}", status.description());
            }
            other => warn!("{other}"),
        }
        self.lines.push(err.to_string());
        err
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Whole buffer, one message per line.
    pub fn output(&self) -> String {
        self.lines.join("\n")
    }

    pub fn clear(&mut self) {
        self.lines.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::UsageError;
    use crate::status::HsaStatus;

    #[test]
    fn record_returns_the_error_and_keeps_a_line() {
        let mut diag = Diagnostics::new();
        let err = diag.record(UsageError::NoAgent.into());
        assert_eq!(err, DispatchError::Usage(UsageError::NoAgent));
        assert_eq!(diag.lines(), ["no agent bound"]);
    }

    #[test]
    fn runtime_lines_carry_status_description() {
        let mut diag = Diagnostics::new();
        diag.note("Using agent: sim-gpu");
        diag.record(DispatchError::runtime("Failed to create queue", HsaStatus::OutOfResources));
        let out = diag.output();
        assert!(out.starts_with("Using agent: sim-gpu\n"));
        assert!(out.contains("Failed to create queue: HSA_STATUS_ERROR_OUT_OF_RESOURCES"));
    }
}
