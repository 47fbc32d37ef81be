//! Lifecycle registry: one state record per run.
//!
//! Every transition is a read-modify-write under the record's own lock, so two
//! concurrent completions can never both observe the final segment.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use flowgate_types::{PipelineId, RunState, RunStatus};

#[derive(Debug)]
struct RunRecord {
    state: RunState,
    completion_emitted: bool,
}

#[derive(Debug, Default)]
pub struct LifecycleRegistry {
    runs: Mutex<HashMap<PipelineId, Arc<Mutex<RunRecord>>>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl LifecycleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, id: PipelineId) -> Option<Arc<Mutex<RunRecord>>> {
        lock(&self.runs).get(&id).cloned()
    }

    /// Create the run record unless one exists; returns the current state.
    pub fn init(&self, id: PipelineId, total_segments: usize) -> RunState {
        let record = lock(&self.runs)
            .entry(id)
            .or_insert_with(|| {
                Arc::new(Mutex::new(RunRecord {
                    state: RunState::new(id, total_segments),
                    completion_emitted: false,
                }))
            })
            .clone();
        let state = lock(&record).state.clone();
        state
    }

    /// Forget the run so the next `init` starts fresh.
    pub fn reset(&self, id: PipelineId) {
        lock(&self.runs).remove(&id);
    }

    pub fn get(&self, id: PipelineId) -> Option<RunState> {
        let record = self.record(id)?;
        let state = lock(&record).state.clone();
        Some(state)
    }

    /// `Starting -> Running`. Returns whether the transition happened.
    pub fn mark_running(&self, id: PipelineId) -> bool {
        let Some(record) = self.record(id) else {
            return false;
        };
        let mut rec = lock(&record);
        if rec.state.status != RunStatus::Starting {
            return false;
        }
        rec.state.status = RunStatus::Running;
        rec.state.message = "Pipeline running".to_string();
        true
    }

    /// Count one finished segment.
    ///
    /// Returns `true` exactly once, on the call that completes the last
    /// segment. Terminal runs are left alone.
    pub fn segment_completed(&self, id: PipelineId) -> bool {
        let Some(record) = self.record(id) else {
            return false;
        };
        let mut rec = lock(&record);
        if rec.state.status.is_terminal() {
            return false;
        }
        rec.state.completed_segments += 1;
        if rec.state.completed_segments >= rec.state.total_segments && !rec.completion_emitted {
            rec.completion_emitted = true;
            rec.state.status = RunStatus::Completed;
            rec.state.message = "Pipeline completed".to_string();
            return true;
        }
        false
    }

    /// First failure wins; terminal runs are left alone.
    pub fn fail(&self, id: PipelineId, message: impl Into<String>) -> bool {
        let Some(record) = self.record(id) else {
            return false;
        };
        let mut rec = lock(&record);
        if rec.state.status.is_terminal() {
            return false;
        }
        rec.state.status = RunStatus::Failed;
        rec.state.message = message.into();
        true
    }

    /// Returns whether the run moved to `Aborted`.
    pub fn abort(&self, id: PipelineId) -> bool {
        self.abort_with_message(id, "Pipeline aborted")
    }

    pub fn abort_with_message(&self, id: PipelineId, message: impl Into<String>) -> bool {
        let Some(record) = self.record(id) else {
            return false;
        };
        let mut rec = lock(&record);
        if rec.state.status.is_terminal() {
            return false;
        }
        rec.state.status = RunStatus::Aborted;
        rec.state.message = message.into();
        true
    }
}
