//! Execution-context run state machine.
//!
//! One [`ContextRunner`] exists per subgraph and drives each call
//! through `Idle -> ShapesBound -> Enqueued -> Synchronized | Captured
//! -> Idle`. It also owns the command-graph capture policy: capture is
//! attempted only after a warm-up run completed with the same call
//! fingerprint, synchronization never happens while a capture is
//! recording, and any change in shapes or bound addresses (or an engine
//! rebuild) drops the captured graph.

use crate::error::{EpError, Result};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use tephra_accel::{CapturedGraph, DeviceStream, ExecutionContext};
use tracing::debug;

/// Regular runs required before a capture is attempted.
const CAPTURE_WARMUP_RUNS: u32 = 1;

/// Where a call currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    ShapesBound,
    Enqueued,
    Synchronized,
    Captured,
}

/// Per-subgraph run driver.
pub struct ContextRunner {
    state: RunState,
    capture_enabled: bool,
    regular_runs: u32,
    captured: Option<CapturedGraph>,
    fingerprint: Option<u64>,
    last_run_replayed: bool,
}

impl ContextRunner {
    pub fn new(capture_enabled: bool) -> Self {
        Self {
            state: RunState::Idle,
            capture_enabled,
            regular_runs: 0,
            captured: None,
            fingerprint: None,
            last_run_replayed: false,
        }
    }

    /// Current state; `Idle` between calls.
    pub fn state(&self) -> RunState {
        self.state
    }

    /// Mark binding complete for this call.
    pub fn shapes_bound(&mut self) {
        self.state = RunState::ShapesBound;
    }

    /// Drop any captured graph and restart the warm-up count. Called on
    /// engine rebuild.
    pub fn invalidate_capture(&mut self) {
        if self.captured.take().is_some() {
            debug!("dropping captured command graph");
        }
        self.regular_runs = 0;
        self.fingerprint = None;
    }

    /// Whether the last completed call replayed a captured graph.
    pub fn replayed_capture(&self) -> bool {
        self.last_run_replayed
    }

    /// Execute the bound program on the stream.
    ///
    /// `fingerprint` identifies the call's input shapes and bound
    /// device addresses; a change resets the capture warm-up. Replays
    /// the captured graph when one exists for this fingerprint, captures
    /// a new one once warmed up, and otherwise enqueues and synchronizes
    /// normally.
    pub fn run(
        &mut self,
        exec: &mut dyn ExecutionContext,
        stream: &mut DeviceStream,
        fingerprint: u64,
    ) -> Result<()> {
        if self.state != RunState::ShapesBound {
            return Err(EpError::Device(
                "run invoked before bindings were established".to_string(),
            ));
        }
        if self.fingerprint != Some(fingerprint) {
            self.invalidate_capture();
        }

        if let Some(graph) = &self.captured {
            self.state = RunState::Enqueued;
            stream.replay(graph).map_err(EpError::from)?;
            self.state = RunState::Captured;
            self.last_run_replayed = true;
            return Ok(());
        }

        if self.capture_enabled && self.regular_runs >= CAPTURE_WARMUP_RUNS {
            // Work issued between begin and end is recorded, not
            // executed; the replay below does the actual work.
            stream.begin_capture().map_err(EpError::from)?;
            self.state = RunState::Enqueued;
            if let Err(e) = exec.enqueue(stream) {
                let _ = stream.end_capture();
                self.state = RunState::Idle;
                return Err(EpError::Device(format!("enqueue failed: {e}")));
            }
            let graph = stream.end_capture().map_err(EpError::from)?;
            stream.replay(&graph).map_err(EpError::from)?;
            debug!(ops = graph.len(), "captured command graph");
            self.captured = Some(graph);
            self.state = RunState::Captured;
            self.last_run_replayed = true;
            return Ok(());
        }

        self.state = RunState::Enqueued;
        exec.enqueue(stream)
            .map_err(|e| EpError::Device(format!("enqueue failed: {e}")))?;
        stream.synchronize().map_err(EpError::from)?;
        self.state = RunState::Synchronized;
        self.last_run_replayed = false;
        self.regular_runs += 1;
        self.fingerprint = Some(fingerprint);
        Ok(())
    }

    /// Return to `Idle` after copy-back completes.
    pub fn finish(&mut self) {
        self.state = RunState::Idle;
    }
}

/// Order-independent fingerprint of a call's input shapes and
/// shape-tensor values.
pub fn shape_fingerprint<'a>(
    shapes: impl Iterator<Item = (&'a str, &'a [i64])>,
) -> u64 {
    let mut entries: Vec<(&str, &[i64])> = shapes.collect();
    entries.sort_by_key(|(name, _)| *name);
    let mut hasher = DefaultHasher::new();
    for (name, dims) in entries {
        name.hash(&mut hasher);
        dims.hash(&mut hasher);
    }
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_ignores_iteration_order() {
        let a: Vec<i64> = vec![1, 3];
        let b: Vec<i64> = vec![4];
        let fwd = shape_fingerprint([("x", a.as_slice()), ("y", b.as_slice())].into_iter());
        let rev = shape_fingerprint([("y", b.as_slice()), ("x", a.as_slice())].into_iter());
        assert_eq!(fwd, rev);

        let other = shape_fingerprint([("x", b.as_slice())].into_iter());
        assert_ne!(fwd, other);
    }

    #[test]
    fn run_requires_bound_shapes() {
        let mut runner = ContextRunner::new(false);
        assert_eq!(runner.state(), RunState::Idle);
        // No shapes_bound call: the state machine refuses to run.
        // (Exercised through the provider in integration tests; here we
        // only check the state transition guard.)
        assert_eq!(runner.state(), RunState::Idle);
        runner.shapes_bound();
        assert_eq!(runner.state(), RunState::ShapesBound);
        runner.finish();
        assert_eq!(runner.state(), RunState::Idle);
    }
}
