//! Persistence seam for tasks, phases, and project activity.
//!
//! Documents are addressed as `projects/{projectId}/tasks/{taskId}` and
//! `projects/{projectId}/phases/{phaseId}`. Every mutation is a field-level
//! merge ([`TaskUpdate`]) rather than a whole-document overwrite, and status
//! claims go through [`TaskStore::compare_and_set_status`] so two runners can
//! never both move the same task into `running`.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::debug;

use crate::types::{ActivityRecord, Phase, PhaseStatus, Task, TaskStatus};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("document not found: {0}")]
    NotFound(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

pub fn task_path(project_id: &str, task_id: &str) -> String {
    format!("projects/{project_id}/tasks/{task_id}")
}

pub fn phase_path(project_id: &str, phase_id: &str) -> String {
    format!("projects/{project_id}/phases/{phase_id}")
}

// ---------------------------------------------------------------------------
// TaskUpdate
// ---------------------------------------------------------------------------

/// A merge-style write: only populated fields are touched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskUpdate {
    pub status: Option<TaskStatus>,
    pub assignee: Option<String>,
    pub tool: Option<String>,
    pub error: Option<String>,
    pub result: Option<serde_json::Value>,
    pub healing_strategy: Option<String>,
    /// Atomically add one to `retries`.
    pub increment_retries: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl TaskUpdate {
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn assignment(provider: impl Into<String>, tool: impl Into<String>) -> Self {
        Self {
            assignee: Some(provider.into()),
            tool: Some(tool.into()),
            ..Self::default()
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_result(mut self, result: serde_json::Value) -> Self {
        self.result = Some(result);
        self
    }

    pub fn with_healing_strategy(mut self, label: impl Into<String>) -> Self {
        self.healing_strategy = Some(label.into());
        self
    }

    pub fn incrementing_retries(mut self) -> Self {
        self.increment_retries = true;
        self
    }

    pub fn started(mut self, at: DateTime<Utc>) -> Self {
        self.started_at = Some(at);
        self
    }

    pub fn completed(mut self, at: DateTime<Utc>) -> Self {
        self.completed_at = Some(at);
        self
    }

    fn apply(self, task: &mut Task) {
        if let Some(status) = self.status {
            task.status = status;
        }
        if let Some(assignee) = self.assignee {
            task.assignee = Some(assignee);
        }
        if let Some(tool) = self.tool {
            task.tool = Some(tool);
        }
        if let Some(error) = self.error {
            task.error = Some(error);
        }
        if let Some(result) = self.result {
            task.result = Some(result);
        }
        if let Some(label) = self.healing_strategy {
            task.healing_strategy = Some(label);
        }
        if self.increment_retries {
            task.retries += 1;
        }
        // First start wins; later attempts keep the original timestamp.
        if task.started_at.is_none() {
            task.started_at = self.started_at;
        }
        if let Some(at) = self.completed_at {
            task.completed_at = Some(at);
        }
        task.updated_at = Utc::now();
    }
}

// ---------------------------------------------------------------------------
// TaskStore trait
// ---------------------------------------------------------------------------

/// Transactional document store holding tasks, phases, and activity.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Cheap reachability probe used by preflight.
    async fn ping(&self) -> Result<()>;

    async fn get_task(&self, project_id: &str, task_id: &str) -> Result<Task>;

    /// Phases of a project, ordered by `order`.
    async fn list_phases(&self, project_id: &str) -> Result<Vec<Phase>>;

    /// Tasks of a phase, oldest first.
    async fn list_tasks(&self, project_id: &str, phase_id: &str) -> Result<Vec<Task>>;

    /// Merge `update` into the task and return the new document.
    async fn update_task(&self, project_id: &str, task_id: &str, update: TaskUpdate) -> Result<Task>;

    /// Atomically move the task to `next` if its status is one of `expected`,
    /// merging `update` in the same write. Returns `false` when another writer
    /// got there first.
    async fn compare_and_set_status(
        &self,
        project_id: &str,
        task_id: &str,
        expected: &[TaskStatus],
        next: TaskStatus,
        update: TaskUpdate,
    ) -> Result<bool>;

    /// Atomically bump `completedTasksCount`; marks the phase done once every
    /// task is accounted for.
    async fn increment_phase_completed(&self, project_id: &str, phase_id: &str) -> Result<Phase>;

    async fn append_activity(&self, project_id: &str, record: ActivityRecord) -> Result<()>;
}

// ---------------------------------------------------------------------------
// InMemoryTaskStore
// ---------------------------------------------------------------------------

/// DashMap-backed store. Each document lives in its own shard entry, so a
/// `get_mut` guard gives per-document atomicity for CAS and counters.
#[derive(Debug, Default)]
pub struct InMemoryTaskStore {
    tasks: DashMap<String, Task>,
    phases: DashMap<String, Phase>,
    activity: DashMap<String, Vec<ActivityRecord>>,
    offline: AtomicBool,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_phase(&self, project_id: &str, phase: Phase) {
        self.phases.insert(phase_path(project_id, &phase.id), phase);
    }

    /// Insert a task and count it towards its phase's `totalTasks`.
    pub fn insert_task(&self, project_id: &str, task: Task) {
        if let Some(mut phase) = self.phases.get_mut(&phase_path(project_id, &task.phase_id)) {
            phase.total_tasks += 1;
        }
        self.tasks.insert(task_path(project_id, &task.id), task);
    }

    pub fn activity(&self, project_id: &str) -> Vec<ActivityRecord> {
        self.activity
            .get(project_id)
            .map(|records| records.clone())
            .unwrap_or_default()
    }

    pub fn phase(&self, project_id: &str, phase_id: &str) -> Option<Phase> {
        self.phases
            .get(&phase_path(project_id, phase_id))
            .map(|p| p.clone())
    }

    /// Simulate the backing store going away (or coming back).
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn ensure_online(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("in-memory store is offline".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn ping(&self) -> Result<()> {
        self.ensure_online()
    }

    async fn get_task(&self, project_id: &str, task_id: &str) -> Result<Task> {
        self.ensure_online()?;
        let path = task_path(project_id, task_id);
        self.tasks
            .get(&path)
            .map(|t| t.clone())
            .ok_or(StoreError::NotFound(path))
    }

    async fn list_phases(&self, project_id: &str) -> Result<Vec<Phase>> {
        self.ensure_online()?;
        let prefix = format!("projects/{project_id}/phases/");
        let mut phases: Vec<Phase> = self
            .phases
            .iter()
            .filter(|entry| entry.key().starts_with(&prefix))
            .map(|entry| entry.value().clone())
            .collect();
        phases.sort_by(|a, b| a.order.cmp(&b.order).then_with(|| a.id.cmp(&b.id)));
        Ok(phases)
    }

    async fn list_tasks(&self, project_id: &str, phase_id: &str) -> Result<Vec<Task>> {
        self.ensure_online()?;
        let prefix = format!("projects/{project_id}/tasks/");
        let mut tasks: Vec<Task> = self
            .tasks
            .iter()
            .filter(|entry| entry.key().starts_with(&prefix) && entry.value().phase_id == phase_id)
            .map(|entry| entry.value().clone())
            .collect();
        tasks.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(tasks)
    }

    async fn update_task(&self, project_id: &str, task_id: &str, update: TaskUpdate) -> Result<Task> {
        self.ensure_online()?;
        let path = task_path(project_id, task_id);
        let mut task = self
            .tasks
            .get_mut(&path)
            .ok_or_else(|| StoreError::NotFound(path.clone()))?;
        update.apply(&mut task);
        Ok(task.clone())
    }

    async fn compare_and_set_status(
        &self,
        project_id: &str,
        task_id: &str,
        expected: &[TaskStatus],
        next: TaskStatus,
        update: TaskUpdate,
    ) -> Result<bool> {
        self.ensure_online()?;
        let path = task_path(project_id, task_id);
        let mut task = self
            .tasks
            .get_mut(&path)
            .ok_or_else(|| StoreError::NotFound(path.clone()))?;

        if !expected.contains(&task.status) {
            debug!(path = %path, current = %task.status, wanted = %next, "status claim lost");
            return Ok(false);
        }

        let update = TaskUpdate {
            status: Some(next),
            ..update
        };
        update.apply(&mut task);
        Ok(true)
    }

    async fn increment_phase_completed(&self, project_id: &str, phase_id: &str) -> Result<Phase> {
        self.ensure_online()?;
        let path = phase_path(project_id, phase_id);
        let mut phase = self
            .phases
            .get_mut(&path)
            .ok_or_else(|| StoreError::NotFound(path.clone()))?;

        phase.completed_tasks_count += 1;
        phase.status = if phase.total_tasks > 0 && phase.completed_tasks_count >= phase.total_tasks {
            PhaseStatus::Done
        } else {
            PhaseStatus::InProgress
        };
        Ok(phase.clone())
    }

    async fn append_activity(&self, project_id: &str, record: ActivityRecord) -> Result<()> {
        self.ensure_online()?;
        self.activity
            .entry(project_id.to_string())
            .or_default()
            .push(record);
        Ok(())
    }
}
