//! Goal-to-execution pipeline: architect, decompose, select, generate code,
//! build action plans, and (in `FULL_AUTO`) execute them.

use af_core::config::PipelineConfig;
use af_core::types::{
    ActionPlan, ArchitectPlan, CodeGenerationPlan, DecomposedTask, ExecutedPlanSummary,
    PipelineMode, TaskDecompositionPlan, TaskPriority, TaskSelectionStrategy,
};
use af_harness::generation::PlanGenerator;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::plan_executor::{PlanExecutor, PlanExecutorError};

// ---------------------------------------------------------------------------
// Request / result
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineRequest {
    pub project_id: String,
    pub user_id: String,
    pub user_input: String,
    #[serde(default = "default_locale")]
    pub locale: String,
    #[serde(default)]
    pub mode: PipelineMode,
    pub max_tasks: usize,
    #[serde(default)]
    pub task_selection_strategy: TaskSelectionStrategy,
}

fn default_locale() -> String {
    "en".into()
}

impl PipelineRequest {
    /// A request using the configured mode, task cap, and strategy.
    pub fn new(
        config: &PipelineConfig,
        project_id: impl Into<String>,
        user_id: impl Into<String>,
        user_input: impl Into<String>,
    ) -> Self {
        Self {
            project_id: project_id.into(),
            user_id: user_id.into(),
            user_input: user_input.into(),
            locale: default_locale(),
            mode: config.mode,
            max_tasks: config.max_tasks,
            task_selection_strategy: config.selection_strategy,
        }
    }

    pub fn with_mode(mut self, mode: PipelineMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_max_tasks(mut self, max_tasks: usize) -> Self {
        self.max_tasks = max_tasks;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImplementationPipelineResult {
    pub mode: PipelineMode,
    pub architecture: ArchitectPlan,
    pub decomposition: TaskDecompositionPlan,
    pub selected_tasks: Vec<DecomposedTask>,
    pub code_gen_plans: Vec<CodeGenerationPlan>,
    pub action_plans: Vec<ActionPlan>,
    pub executed_plans: Vec<ExecutedPlanSummary>,
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("invalid pipeline request: {0}")]
    InvalidRequest(String),
    #[error("pipeline cancelled during {stage}")]
    Cancelled { stage: &'static str },
}

pub type Result<T> = std::result::Result<T, PipelineError>;

// ---------------------------------------------------------------------------
// Task selection
// ---------------------------------------------------------------------------

/// Pick at most `max_tasks` tasks.
///
/// `ALL` keeps decomposition order. `HIGH_PRIORITY_FIRST` is a stable
/// partition into HIGH, MEDIUM, LOW before taking the prefix.
pub fn select_tasks(
    tasks: &[DecomposedTask],
    strategy: TaskSelectionStrategy,
    max_tasks: usize,
) -> Vec<DecomposedTask> {
    match strategy {
        TaskSelectionStrategy::All => tasks.iter().take(max_tasks).cloned().collect(),
        TaskSelectionStrategy::HighPriorityFirst => {
            [TaskPriority::High, TaskPriority::Medium, TaskPriority::Low]
                .into_iter()
                .flat_map(move |priority| tasks.iter().filter(move |t| t.priority == priority))
                .take(max_tasks)
                .cloned()
                .collect()
        }
    }
}

// ---------------------------------------------------------------------------
// ImplementationPipeline
// ---------------------------------------------------------------------------

/// Stages run strictly in sequence. Code generation is also sequential
/// across tasks since later tasks may read what earlier ones produced.
pub struct ImplementationPipeline {
    generator: PlanGenerator,
    executor: PlanExecutor,
    overgeneration_factor: usize,
}

impl ImplementationPipeline {
    pub fn new(generator: PlanGenerator, executor: PlanExecutor) -> Self {
        Self::from_config(generator, executor, &PipelineConfig::default())
    }

    pub fn from_config(
        generator: PlanGenerator,
        executor: PlanExecutor,
        config: &PipelineConfig,
    ) -> Self {
        Self {
            generator,
            executor,
            overgeneration_factor: config.overgeneration_factor.max(1),
        }
    }

    pub async fn run(
        &self,
        request: &PipelineRequest,
        cancel: &CancellationToken,
    ) -> Result<ImplementationPipelineResult> {
        validate_request(request)?;
        info!(
            project_id = %request.project_id,
            user_id = %request.user_id,
            locale = %request.locale,
            mode = ?request.mode,
            max_tasks = request.max_tasks,
            "pipeline started"
        );

        checkpoint(cancel, "architect")?;
        let architecture = self.generator.architect(&request.user_input).await;

        checkpoint(cancel, "decompose")?;
        let budget = request.max_tasks.saturating_mul(self.overgeneration_factor);
        let decomposition = self
            .generator
            .decompose(&request.user_input, &architecture, budget)
            .await;

        let selected_tasks = select_tasks(
            &decomposition.tasks,
            request.task_selection_strategy,
            request.max_tasks,
        );
        debug!(
            generated = decomposition.tasks.len(),
            selected = selected_tasks.len(),
            "tasks selected"
        );

        let mut result = ImplementationPipelineResult {
            mode: request.mode,
            architecture,
            decomposition,
            selected_tasks,
            code_gen_plans: Vec::new(),
            action_plans: Vec::new(),
            executed_plans: Vec::new(),
        };
        if request.mode == PipelineMode::PlanOnly {
            info!(project_id = %request.project_id, "pipeline finished (plan only)");
            return Ok(result);
        }

        for task in &result.selected_tasks {
            checkpoint(cancel, "code generation")?;
            let code_plan = self
                .generator
                .generate_code(task, &result.architecture)
                .await;
            let mut action_plan =
                ActionPlan::from_code_plan(&request.project_id, &request.user_id, &code_plan);

            if request.mode == PipelineMode::FullAuto {
                let summary = self
                    .executor
                    .execute(&mut action_plan, cancel)
                    .await
                    .map_err(|e| match e {
                        PlanExecutorError::Cancelled { .. } => PipelineError::Cancelled {
                            stage: "execution",
                        },
                    })?;
                result.executed_plans.push(summary);
            }

            result.code_gen_plans.push(code_plan);
            result.action_plans.push(action_plan);
        }

        info!(
            project_id = %request.project_id,
            code_plans = result.code_gen_plans.len(),
            executed = result.executed_plans.len(),
            "pipeline finished"
        );
        Ok(result)
    }
}

fn validate_request(request: &PipelineRequest) -> Result<()> {
    if request.project_id.trim().is_empty() {
        return Err(PipelineError::InvalidRequest("projectId is empty".into()));
    }
    if request.user_input.trim().is_empty() {
        return Err(PipelineError::InvalidRequest("userInput is empty".into()));
    }
    if request.max_tasks == 0 {
        return Err(PipelineError::InvalidRequest("maxTasks must be at least 1".into()));
    }
    Ok(())
}

fn checkpoint(cancel: &CancellationToken, stage: &'static str) -> Result<()> {
    if cancel.is_cancelled() {
        Err(PipelineError::Cancelled { stage })
    } else {
        Ok(())
    }
}
