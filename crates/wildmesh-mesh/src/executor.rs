//! Task execution collaborator.
//!
//! Capture, classification and sensor drivers live outside the control
//! plane. The agent only starts work, polls for outcomes and aborts work
//! that outlived its deadline.

use std::collections::{BTreeMap, HashSet};
use tracing::debug;

use wildmesh_core::{Millis, Result, TaskId, TaskType};

/// Work handed to an executor.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionRequest {
    pub task_id: TaskId,
    pub task_type: TaskType,
    pub parameters: BTreeMap<String, String>,
    /// Local tick time after which the work is aborted.
    pub deadline: Millis,
}

/// How a task ended.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskOutcome {
    pub task_id: TaskId,
    pub success: bool,
    pub result: Vec<u8>,
    pub detail: Option<String>,
}

pub trait TaskExecutor {
    /// Begin work. An error is reported to the coordinator as a failure.
    fn start(&mut self, request: &ExecutionRequest, now: Millis) -> Result<()>;

    /// Outcomes of work that finished since the last poll.
    fn poll(&mut self, now: Millis) -> Vec<TaskOutcome>;

    fn abort(&mut self, task_id: TaskId);

    /// Tasks currently running.
    fn active(&self) -> usize;
}

impl<E: TaskExecutor + ?Sized> TaskExecutor for Box<E> {
    fn start(&mut self, request: &ExecutionRequest, now: Millis) -> Result<()> {
        (**self).start(request, now)
    }

    fn poll(&mut self, now: Millis) -> Vec<TaskOutcome> {
        (**self).poll(now)
    }

    fn abort(&mut self, task_id: TaskId) {
        (**self).abort(task_id)
    }

    fn active(&self) -> usize {
        (**self).active()
    }
}

/// Finishes every task a fixed time after it started.
#[derive(Debug, Clone)]
pub struct SimulatedExecutor {
    duration_ms: Millis,
    result_bytes: usize,
    failing: HashSet<TaskType>,
    running: BTreeMap<TaskId, (TaskType, Millis)>,
}

impl SimulatedExecutor {
    pub fn new(duration_ms: Millis) -> Self {
        Self {
            duration_ms,
            result_bytes: 32,
            failing: HashSet::new(),
            running: BTreeMap::new(),
        }
    }

    /// Size of the result reported on success.
    pub fn with_result_bytes(mut self, bytes: usize) -> Self {
        self.result_bytes = bytes;
        self
    }

    /// Tasks of this type finish as failures.
    pub fn with_failure(mut self, task_type: TaskType) -> Self {
        self.failing.insert(task_type);
        self
    }

    pub fn is_running(&self, task_id: TaskId) -> bool {
        self.running.contains_key(&task_id)
    }

    fn result_for(&self, task_id: TaskId, task_type: TaskType) -> Vec<u8> {
        let tag = format!("{task_type}:{task_id};");
        tag.bytes().cycle().take(self.result_bytes).collect()
    }
}

impl Default for SimulatedExecutor {
    fn default() -> Self {
        Self::new(5_000)
    }
}

impl TaskExecutor for SimulatedExecutor {
    fn start(&mut self, request: &ExecutionRequest, now: Millis) -> Result<()> {
        debug!(task_id = request.task_id, task_type = %request.task_type, "simulated task started");
        self.running.insert(
            request.task_id,
            (request.task_type, now.saturating_add(self.duration_ms)),
        );
        Ok(())
    }

    fn poll(&mut self, now: Millis) -> Vec<TaskOutcome> {
        let done: Vec<(TaskId, TaskType)> = self
            .running
            .iter()
            .filter(|(_, (_, finish))| *finish <= now)
            .map(|(id, (task_type, _))| (*id, *task_type))
            .collect();

        let mut outcomes = Vec::with_capacity(done.len());
        for (task_id, task_type) in done {
            self.running.remove(&task_id);
            let outcome = if self.failing.contains(&task_type) {
                TaskOutcome {
                    task_id,
                    success: false,
                    result: Vec::new(),
                    detail: Some(format!("{task_type} failed on device")),
                }
            } else {
                TaskOutcome {
                    task_id,
                    success: true,
                    result: self.result_for(task_id, task_type),
                    detail: None,
                }
            };
            outcomes.push(outcome);
        }
        outcomes
    }

    fn abort(&mut self, task_id: TaskId) {
        if self.running.remove(&task_id).is_some() {
            debug!(task_id, "simulated task aborted");
        }
    }

    fn active(&self) -> usize {
        self.running.len()
    }
}
