use std::fmt;

use af_core::types::TaskStatus;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// TaskEvent
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskEvent {
    /// A runner claims the task for an attempt.
    Claim,
    /// The attempt succeeded.
    Succeed,
    /// The attempt failed and attempts remain.
    ScheduleRetry,
    /// The attempt failed and no attempts remain.
    Exhaust,
    /// A claimed or backing-off task is handed back without an outcome
    /// (cancellation).
    Release,
}

impl fmt::Display for TaskEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TaskEvent::Claim => "claim",
            TaskEvent::Succeed => "succeed",
            TaskEvent::ScheduleRetry => "schedule_retry",
            TaskEvent::Exhaust => "exhaust",
            TaskEvent::Release => "release",
        };
        f.write_str(label)
    }
}

impl TaskEvent {
    /// States from which this event may fire. Used as the `expected` set of a
    /// compare-and-set write.
    pub fn sources(&self) -> &'static [TaskStatus] {
        match self {
            TaskEvent::Claim => &[TaskStatus::Open, TaskStatus::Retry],
            TaskEvent::Succeed | TaskEvent::ScheduleRetry | TaskEvent::Exhaust => {
                &[TaskStatus::Running]
            }
            TaskEvent::Release => &[TaskStatus::Running, TaskStatus::Retry],
        }
    }

    /// The state this event leads to.
    pub fn target(&self) -> TaskStatus {
        match self {
            TaskEvent::Claim => TaskStatus::Running,
            TaskEvent::Succeed => TaskStatus::Done,
            TaskEvent::ScheduleRetry => TaskStatus::Retry,
            TaskEvent::Exhaust => TaskStatus::Failed,
            TaskEvent::Release => TaskStatus::Open,
        }
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum StateMachineError {
    #[error("invalid transition: cannot apply {event} in state {state}")]
    InvalidTransition { state: TaskStatus, event: TaskEvent },
}

/// Pure transition function for the task lifecycle.
///
/// ```text
/// open  --claim--> running --succeed--> done
///                  running --exhaust--> failed
///                  running --schedule_retry--> retry --claim--> running
/// running|retry --release--> open
/// ```
pub fn transition(state: TaskStatus, event: TaskEvent) -> Result<TaskStatus, StateMachineError> {
    if event.sources().contains(&state) {
        Ok(event.target())
    } else {
        Err(StateMachineError::InvalidTransition { state, event })
    }
}

// ---------------------------------------------------------------------------
// TaskStateMachine
// ---------------------------------------------------------------------------

/// In-memory view of one task's lifecycle, with the transitions it went
/// through. The persisted status is authoritative; this mirrors it for one
/// runner's flow.
#[derive(Debug, Clone)]
pub struct TaskStateMachine {
    current: TaskStatus,
    history: Vec<(TaskStatus, TaskEvent, TaskStatus)>,
}

impl TaskStateMachine {
    pub fn new(initial: TaskStatus) -> Self {
        Self {
            current: initial,
            history: Vec::new(),
        }
    }

    pub fn state(&self) -> TaskStatus {
        self.current
    }

    pub fn history(&self) -> &[(TaskStatus, TaskEvent, TaskStatus)] {
        &self.history
    }

    pub fn apply(&mut self, event: TaskEvent) -> Result<TaskStatus, StateMachineError> {
        let from = self.current;
        let next = transition(from, event)?;
        self.current = next;
        self.history.push((from, event, next));
        tracing::debug!(from = %from, event = %event, to = %next, "task state transition");
        Ok(next)
    }

    pub fn can_apply(&self, event: TaskEvent) -> bool {
        event.sources().contains(&self.current)
    }
}

impl Default for TaskStateMachine {
    fn default() -> Self {
        Self::new(TaskStatus::Open)
    }
}
