//! Plan generation through an opaque text backend.
//!
//! The backend (an LLM, a rules engine, a recording) maps a structured
//! request to raw text. Everything that comes back is strictly decoded into
//! the expected plan type and validated; anything malformed is replaced by a
//! clearly marked fallback plan built by the same [`FallbackPlan`] policy at
//! every stage.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use af_core::types::{
    Action, ArchitectPlan, CodeGenerationPlan, Complexity, DecomposedTask, ModuleSpec,
    PlannedPhase, TaskDecompositionPlan, TaskPriority,
};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("backend not configured: {0}")]
    NotConfigured(String),
    #[error("backend call failed: {0}")]
    Failed(String),
    #[error("backend timed out")]
    Timeout,
}

#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    #[error("malformed plan: {0}")]
    Malformed(String),
    #[error("invalid plan: {0}")]
    Invalid(String),
}

// ---------------------------------------------------------------------------
// Backend seam
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationStage {
    Architect,
    Decomposer,
    CodeGenerator,
}

impl GenerationStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            GenerationStage::Architect => "architect",
            GenerationStage::Decomposer => "decomposer",
            GenerationStage::CodeGenerator => "code_generator",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub stage: GenerationStage,
    pub payload: serde_json::Value,
}

#[async_trait]
pub trait GenerationBackend: Send + Sync {
    async fn generate(&self, request: GenerationRequest) -> Result<String, BackendError>;
}

// ---------------------------------------------------------------------------
// Strict decoding
// ---------------------------------------------------------------------------

/// A plan type that can check itself after deserialisation.
pub trait PlanSchema: DeserializeOwned {
    fn validate(&self) -> Result<(), SchemaError>;
}

/// Decode raw backend text into `T` and validate it.
///
/// At most one outer code fence is unwrapped; everything else must be a
/// single JSON document matching `T`.
pub fn decode_plan<T: PlanSchema>(raw: &str) -> Result<T, SchemaError> {
    let body = unwrap_fence(raw);
    if body.is_empty() {
        return Err(SchemaError::Malformed("empty response".into()));
    }
    let plan: T = serde_json::from_str(body).map_err(|e| SchemaError::Malformed(e.to_string()))?;
    plan.validate()?;
    Ok(plan)
}

fn unwrap_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(inner) = trimmed
        .strip_prefix("```")
        .and_then(|rest| rest.strip_suffix("```"))
    else {
        return trimmed;
    };
    // Drop the info string (`json`) on the opening fence line, if any.
    match inner.find('\n') {
        Some(newline) if !inner[..newline].trim_start().starts_with(['{', '[']) => {
            inner[newline + 1..].trim()
        }
        _ => inner.trim(),
    }
}

impl PlanSchema for ArchitectPlan {
    fn validate(&self) -> Result<(), SchemaError> {
        if self.modules.is_empty() {
            return Err(SchemaError::Invalid("architecture has no modules".into()));
        }
        if let Some(module) = self.modules.iter().find(|m| m.name.trim().is_empty()) {
            return Err(SchemaError::Invalid(format!(
                "module with empty name: {:?}",
                module.description
            )));
        }
        Ok(())
    }
}

impl PlanSchema for TaskDecompositionPlan {
    fn validate(&self) -> Result<(), SchemaError> {
        if self.tasks.is_empty() {
            return Err(SchemaError::Invalid("decomposition has no tasks".into()));
        }

        let mut ids = HashSet::new();
        for task in &self.tasks {
            if task.id.trim().is_empty() {
                return Err(SchemaError::Invalid(format!(
                    "task '{}' has an empty id",
                    task.title
                )));
            }
            if !ids.insert(task.id.as_str()) {
                return Err(SchemaError::Invalid(format!("duplicate task id '{}'", task.id)));
            }
            if !task.estimate_hours.is_finite() || task.estimate_hours < 0.0 {
                return Err(SchemaError::Invalid(format!(
                    "task '{}' has invalid estimateHours {}",
                    task.id, task.estimate_hours
                )));
            }
        }

        // Dependencies are checked against the batch, never repaired.
        for task in &self.tasks {
            for dep in &task.depends_on {
                if dep == &task.id {
                    return Err(SchemaError::Invalid(format!(
                        "task '{}' depends on itself",
                        task.id
                    )));
                }
                if !ids.contains(dep.as_str()) {
                    return Err(SchemaError::Invalid(format!(
                        "task '{}' depends on unknown task '{}'",
                        task.id, dep
                    )));
                }
            }
        }
        Ok(())
    }
}

impl PlanSchema for CodeGenerationPlan {
    fn validate(&self) -> Result<(), SchemaError> {
        if self.actions.is_empty() {
            return Err(SchemaError::Invalid("code plan has no actions".into()));
        }
        for (index, action) in self.actions.iter().enumerate() {
            let target_missing = match action {
                Action::File(file) => file.path.trim().is_empty(),
                Action::Firestore(doc) => doc.collection.trim().is_empty(),
                Action::Git(_) => false,
            };
            if target_missing {
                return Err(SchemaError::Invalid(format!(
                    "action {index} ({}) has no target",
                    action.kind_label()
                )));
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Fallback plans
// ---------------------------------------------------------------------------

/// The one degraded-plan constructor every generation stage shares.
pub trait FallbackPlan {
    /// `subject` is the goal (or task title) the plan was requested for.
    fn fallback(subject: &str, reason: &str) -> Self;
}

impl FallbackPlan for ArchitectPlan {
    fn fallback(subject: &str, reason: &str) -> Self {
        Self {
            modules: vec![ModuleSpec {
                name: "core".into(),
                description: subject.to_string(),
            }],
            apis: Vec::new(),
            data_models: Vec::new(),
            phases: vec![PlannedPhase {
                name: "Implementation".into(),
                goals: vec![subject.to_string()],
            }],
            complexity: Complexity::Medium,
            fallback_reason: Some(reason.to_string()),
        }
    }
}

impl FallbackPlan for TaskDecompositionPlan {
    fn fallback(subject: &str, reason: &str) -> Self {
        Self {
            tasks: vec![DecomposedTask {
                id: "fallback-1".into(),
                title: format!("Implement: {subject}"),
                description: subject.to_string(),
                priority: TaskPriority::High,
                task_type: "implementation".into(),
                depends_on: Vec::new(),
                estimate_hours: 0.0,
                action_hints: Vec::new(),
            }],
            fallback_reason: Some(reason.to_string()),
        }
    }
}

impl FallbackPlan for CodeGenerationPlan {
    /// Carries no actions: nothing is executed on behalf of a plan we could
    /// not read.
    fn fallback(subject: &str, reason: &str) -> Self {
        Self {
            task_id: String::new(),
            summary: format!("Fallback plan for '{subject}'; generation needs to be retried"),
            actions: Vec::new(),
            diffs: Vec::new(),
            fallback_reason: Some(reason.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// PlanGenerator
// ---------------------------------------------------------------------------

/// Architect, decomposer, and code generator stages over one backend.
///
/// None of the stage methods fail: a backend error or an unreadable
/// response yields the stage's fallback plan.
#[derive(Clone)]
pub struct PlanGenerator {
    backend: Arc<dyn GenerationBackend>,
}

impl PlanGenerator {
    pub fn new(backend: Arc<dyn GenerationBackend>) -> Self {
        Self { backend }
    }

    pub async fn architect(&self, goal: &str) -> ArchitectPlan {
        self.run_stage(GenerationStage::Architect, json!({ "goal": goal }), goal)
            .await
    }

    /// Ask for up to `max_tasks` tasks. Extra tasks are dropped and the kept
    /// batch is validated again; a kept task depending on a dropped one sends
    /// the stage to its fallback plan.
    pub async fn decompose(
        &self,
        goal: &str,
        architecture: &ArchitectPlan,
        max_tasks: usize,
    ) -> TaskDecompositionPlan {
        let payload = json!({
            "goal": goal,
            "architecture": architecture,
            "maxTasks": max_tasks,
        });
        let mut plan: TaskDecompositionPlan = self
            .run_stage(GenerationStage::Decomposer, payload, goal)
            .await;
        if plan.tasks.len() > max_tasks {
            debug!(returned = plan.tasks.len(), max_tasks, "truncating decomposition");
            plan.tasks.truncate(max_tasks);
            if !plan.is_fallback() {
                if let Err(e) = plan.validate() {
                    warn!(stage = "decomposer", reason = %e, "truncated batch invalid, using fallback plan");
                    return TaskDecompositionPlan::fallback(
                        goal,
                        &format!("decomposer stage: truncated to {max_tasks} tasks: {e}"),
                    );
                }
            }
        }
        plan
    }

    pub async fn generate_code(
        &self,
        task: &DecomposedTask,
        architecture: &ArchitectPlan,
    ) -> CodeGenerationPlan {
        let payload = json!({ "task": task, "architecture": architecture });
        let mut plan: CodeGenerationPlan = self
            .run_stage(GenerationStage::CodeGenerator, payload, &task.title)
            .await;
        plan.task_id = task.id.clone();
        plan
    }

    async fn run_stage<T>(&self, stage: GenerationStage, payload: serde_json::Value, subject: &str) -> T
    where
        T: PlanSchema + FallbackPlan,
    {
        let request = GenerationRequest { stage, payload };
        let reason = match self.backend.generate(request).await {
            Ok(raw) => match decode_plan::<T>(&raw) {
                Ok(plan) => {
                    debug!(stage = stage.as_str(), "plan decoded");
                    return plan;
                }
                Err(e) => e.to_string(),
            },
            Err(e) => e.to_string(),
        };

        warn!(stage = stage.as_str(), reason = %reason, "using fallback plan");
        T::fallback(subject, &format!("{} stage: {reason}", stage.as_str()))
    }
}

// ---------------------------------------------------------------------------
// ScriptedBackend
// ---------------------------------------------------------------------------

/// A backend that replays queued responses per stage, for tests and dry runs.
///
/// When a stage's queue is empty the backend answers `NotConfigured`, which
/// drives the generator onto its fallback path.
#[derive(Default)]
pub struct ScriptedBackend {
    responses: Mutex<HashMap<GenerationStage, VecDeque<Result<String, BackendError>>>>,
    captured: Mutex<Vec<GenerationRequest>>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a raw response for a stage.
    pub fn with_response(self, stage: GenerationStage, raw: impl Into<String>) -> Self {
        self.push(stage, Ok(raw.into()));
        self
    }

    /// Queue a serialised plan for a stage.
    pub fn with_plan<T: Serialize>(self, stage: GenerationStage, plan: &T) -> Self {
        let raw = serde_json::to_string(plan).unwrap_or_default();
        self.with_response(stage, raw)
    }

    /// Queue an error for a stage.
    pub fn with_error(self, stage: GenerationStage, error: BackendError) -> Self {
        self.push(stage, Err(error));
        self
    }

    /// Every request seen so far, in call order.
    pub fn captured_requests(&self) -> Vec<GenerationRequest> {
        self.captured
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn push(&self, stage: GenerationStage, response: Result<String, BackendError>) {
        self.responses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(stage)
            .or_default()
            .push_back(response);
    }
}

#[async_trait]
impl GenerationBackend for ScriptedBackend {
    async fn generate(&self, request: GenerationRequest) -> Result<String, BackendError> {
        let stage = request.stage;
        self.captured
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request);

        self.responses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get_mut(&stage)
            .and_then(|queue| queue.pop_front())
            .unwrap_or_else(|| {
                Err(BackendError::NotConfigured(format!(
                    "no scripted response for {}",
                    stage.as_str()
                )))
            })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
