//! Listener capability invoked by the coordinator thread. Implementations
//! must be `Send + Sync`; the coordinator serializes all calls, so a
//! listener never needs its own locking to stay per-step ordered.

use crate::model::Status;

pub trait Listener: Send + Sync {
    /// Called once per step, strictly before any `on_output`/`on_completion`
    /// for that same step.
    fn on_start(&self, _step: &str, _command: &str) {}

    /// Called once per output line, in the order the child process wrote it.
    fn on_output(&self, _step: &str, _line: &str) {}

    /// Called once per step, after all of its output has been delivered.
    fn on_completion(&self, _step: &str, _status: Status) {}

    /// Called once when the run is aborted (SIGINT/SIGTERM).
    fn on_aborted(&self) {}
}

/// A listener that forwards every event to `tracing`, used when no other
/// listener is registered (e.g. `validate`).
pub struct TracingListener;

impl Listener for TracingListener {
    fn on_start(&self, step: &str, command: &str) {
        tracing::info!(step, command, "step started");
    }

    fn on_output(&self, step: &str, line: &str) {
        tracing::debug!(step, line, "step output");
    }

    fn on_completion(&self, step: &str, status: Status) {
        tracing::info!(step, %status, "step completed");
    }

    fn on_aborted(&self) {
        tracing::warn!("run aborted");
    }
}
