use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// TaskStatus
// ---------------------------------------------------------------------------

/// Persisted lifecycle status of a [`Task`].
///
/// `open -> running -> {done | retry -> running | failed}`. `retry` is never a
/// resting state: a task in `retry` is waiting out its backoff and will be
/// picked straight back up by the runner that put it there.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Open,
    Running,
    Done,
    Failed,
    Retry,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 5] = [
        TaskStatus::Open,
        TaskStatus::Running,
        TaskStatus::Done,
        TaskStatus::Failed,
        TaskStatus::Retry,
    ];

    /// `done` and `failed` are terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Open => "open",
            TaskStatus::Running => "running",
            TaskStatus::Done => "done",
            TaskStatus::Failed => "failed",
            TaskStatus::Retry => "retry",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown task status: {0}")]
pub struct UnknownStatus(pub String);

impl FromStr for TaskStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| UnknownStatus(s.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// A persisted unit of work addressed by `projects/{projectId}/tasks/{taskId}`.
///
/// Tasks are never deleted; they are stamped with a terminal status instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub phase_id: String,
    pub title: String,
    pub status: TaskStatus,
    pub assignee: Option<String>,
    pub tool: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub retries: u32,
    pub error: Option<String>,
    pub result: Option<serde_json::Value>,
    /// Advisory label written after retries are exhausted.
    pub healing_strategy: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(id: impl Into<String>, phase_id: impl Into<String>, title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            phase_id: phase_id.into(),
            title: title.into(),
            status: TaskStatus::Open,
            assignee: None,
            tool: None,
            tags: Vec::new(),
            retries: 0,
            error: None,
            result: None,
            healing_strategy: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }
}

// ---------------------------------------------------------------------------
// Phase
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Open,
    InProgress,
    Done,
}

/// Ordered container of tasks. Its status and completed count are maintained
/// by the progress updater, not by a state machine of its own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Phase {
    pub id: String,
    pub title: String,
    pub order: u32,
    pub status: PhaseStatus,
    #[serde(default)]
    pub completed_tasks_count: u32,
    #[serde(default)]
    pub total_tasks: u32,
    pub created_at: DateTime<Utc>,
}

impl Phase {
    pub fn new(id: impl Into<String>, title: impl Into<String>, order: u32) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            order,
            status: PhaseStatus::Open,
            completed_tasks_count: 0,
            total_tasks: 0,
            created_at: Utc::now(),
        }
    }

    pub fn is_open(&self) -> bool {
        self.status != PhaseStatus::Done
    }
}

// ---------------------------------------------------------------------------
// ActivityRecord
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    PreflightFailed,
    TaskCompleted,
    TaskFailed,
}

/// Append-only project activity entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityRecord {
    pub id: Uuid,
    pub kind: ActivityKind,
    pub message: String,
    pub task_id: Option<String>,
    pub at: DateTime<Utc>,
}

impl ActivityRecord {
    pub fn new(kind: ActivityKind, message: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            message: message.into(),
            task_id: None,
            at: Utc::now(),
        }
    }

    pub fn for_task(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }
}

// ---------------------------------------------------------------------------
// Pipeline modes
// ---------------------------------------------------------------------------

/// How far a pipeline run goes, in increasing scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PipelineMode {
    PlanOnly,
    #[default]
    PlanAndCode,
    FullAuto,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskSelectionStrategy {
    All,
    #[default]
    HighPriorityFirst,
}

// ---------------------------------------------------------------------------
// ArchitectPlan
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Complexity {
    Low,
    #[default]
    Medium,
    High,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiSpec {
    pub name: String,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataModelSpec {
    pub name: String,
    #[serde(default)]
    pub fields: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlannedPhase {
    pub name: String,
    #[serde(default)]
    pub goals: Vec<String>,
}

/// Architecture inferred from a goal. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchitectPlan {
    pub modules: Vec<ModuleSpec>,
    #[serde(default)]
    pub apis: Vec<ApiSpec>,
    #[serde(default)]
    pub data_models: Vec<DataModelSpec>,
    #[serde(default)]
    pub phases: Vec<PlannedPhase>,
    #[serde(default)]
    pub complexity: Complexity,
    /// Set only on degraded plans built after a generation failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_reason: Option<String>,
}

impl ArchitectPlan {
    pub fn is_fallback(&self) -> bool {
        self.fallback_reason.is_some()
    }
}

// ---------------------------------------------------------------------------
// Task decomposition
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskPriority {
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecomposedTask {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub priority: TaskPriority,
    #[serde(rename = "type", default)]
    pub task_type: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub estimate_hours: f64,
    #[serde(default)]
    pub action_hints: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDecompositionPlan {
    pub tasks: Vec<DecomposedTask>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_reason: Option<String>,
}

impl TaskDecompositionPlan {
    pub fn is_fallback(&self) -> bool {
        self.fallback_reason.is_some()
    }
}

// ---------------------------------------------------------------------------
// Actions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MutationKind {
    Create,
    Update,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileAction {
    pub path: String,
    pub operation: MutationKind,
    #[serde(default)]
    pub content: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FirestoreAction {
    pub collection: String,
    #[serde(default)]
    pub document_id: Option<String>,
    pub operation: MutationKind,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GitOperation {
    Branch,
    Commit,
    Push,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitAction {
    pub operation: GitOperation,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

/// A concrete mutation, discriminated by `kind`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Action {
    File(FileAction),
    Firestore(FirestoreAction),
    Git(GitAction),
}

impl Action {
    pub fn kind_label(&self) -> &'static str {
        match self {
            Action::File(_) => "FILE",
            Action::Firestore(_) => "FIRESTORE",
            Action::Git(_) => "GIT",
        }
    }
}

// ---------------------------------------------------------------------------
// CodeGenerationPlan
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileDiff {
    pub path: String,
    pub change: MutationKind,
    #[serde(default)]
    pub summary: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodeGenerationPlan {
    #[serde(default)]
    pub task_id: String,
    pub summary: String,
    pub actions: Vec<Action>,
    #[serde(default)]
    pub diffs: Vec<FileDiff>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_reason: Option<String>,
}

impl CodeGenerationPlan {
    pub fn is_fallback(&self) -> bool {
        self.fallback_reason.is_some()
    }
}

// ---------------------------------------------------------------------------
// ActionPlan
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    Pending,
    Success,
    Failed,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub output: String,
    pub logs: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionPlanStep {
    pub index: usize,
    pub status: StepStatus,
    pub action: Action,
    pub result: Option<StepResult>,
}

/// Ordered, executable steps. Step order is execution order and is fixed
/// when the plan is built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionPlan {
    pub id: Uuid,
    pub project_id: String,
    pub task_id: String,
    pub summary: String,
    pub steps: Vec<ActionPlanStep>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
}

impl ActionPlan {
    /// Wrap every action of a code plan as a `PENDING` step, preserving order.
    pub fn from_code_plan(
        project_id: impl Into<String>,
        created_by: impl Into<String>,
        plan: &CodeGenerationPlan,
    ) -> Self {
        let steps = plan
            .actions
            .iter()
            .enumerate()
            .map(|(index, action)| ActionPlanStep {
                index,
                status: StepStatus::Pending,
                action: action.clone(),
                result: None,
            })
            .collect();

        Self {
            id: Uuid::new_v4(),
            project_id: project_id.into(),
            task_id: plan.task_id.clone(),
            summary: plan.summary.clone(),
            steps,
            created_by: created_by.into(),
            created_at: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// ExecutedPlanSummary
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Success,
    Partial,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutedPlanSummary {
    pub plan_id: Uuid,
    pub summary: String,
    pub status: ExecutionStatus,
    pub successful_steps: usize,
    pub total_steps: usize,
    pub raw_result: serde_json::Value,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
