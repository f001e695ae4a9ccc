//! Execution engine: call protocol, observers and result types.

use std::time::Duration;

mod bridge;
pub(crate) mod frame;

pub use bridge::{ExecutionBridge, Script};

/// Outcome of a successful call.
#[derive(Debug, Clone)]
pub struct ExecutionResult<O> {
    /// Decoded value, present only when the call expected output.
    pub output: Option<O>,
    /// Wall time from spawn to exit.
    pub elapsed: Duration,
    /// Everything the child wrote to stderr.
    pub stderr: String,
    pub exit_code: i32,
}

/// Receives the child's diagnostic lines in the order they were written.
pub trait DiagnosticObserver: Send + Sync {
    fn on_diagnostic(&self, line: &str);
}

impl<F> DiagnosticObserver for F
where
    F: Fn(&str) + Send + Sync,
{
    fn on_diagnostic(&self, line: &str) {
        self(line)
    }
}
