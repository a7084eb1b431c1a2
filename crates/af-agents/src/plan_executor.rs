use std::sync::Arc;

use af_core::types::{
    Action, ActionPlan, ActionPlanStep, ExecutedPlanSummary, ExecutionStatus, StepResult,
    StepStatus,
};
use af_harness::execution::{ActionOutput, ExecutionError, FileHandler, FirestoreHandler, GitHandler};
use af_telemetry::metrics::{names, MetricsCollector};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum PlanExecutorError {
    /// Steps from `next_step` onwards were left `PENDING`.
    #[error("plan execution cancelled before step {next_step}")]
    Cancelled { next_step: usize },
}

pub type Result<T> = std::result::Result<T, PlanExecutorError>;

/// Plan-level status from per-step statuses.
///
/// `SUCCESS` when every step succeeded, `FAILED` when at least one failed and
/// none succeeded, `PARTIAL` otherwise (an empty plan is `PARTIAL`).
pub fn derive_execution_status(steps: &[ActionPlanStep]) -> ExecutionStatus {
    let succeeded = steps
        .iter()
        .filter(|s| s.status == StepStatus::Success)
        .count();
    let failed = steps
        .iter()
        .filter(|s| s.status == StepStatus::Failed)
        .count();

    if !steps.is_empty() && succeeded == steps.len() {
        ExecutionStatus::Success
    } else if failed > 0 && succeeded == 0 {
        ExecutionStatus::Failed
    } else {
        ExecutionStatus::Partial
    }
}

/// One handler per action kind.
#[derive(Clone)]
pub struct ActionHandlers {
    pub file: Arc<FileHandler>,
    pub firestore: Arc<FirestoreHandler>,
    pub git: Arc<GitHandler>,
}

/// Runs action plan steps in order, continuing past failures.
///
/// Failed steps are recorded, not thrown, and earlier successful steps are
/// never rolled back. Nothing is retried here.
#[derive(Clone)]
pub struct PlanExecutor {
    handlers: ActionHandlers,
    metrics: Arc<MetricsCollector>,
}

impl PlanExecutor {
    pub fn new(handlers: ActionHandlers) -> Self {
        Self {
            handlers,
            metrics: Arc::new(MetricsCollector::with_defaults()),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = metrics;
        self
    }

    async fn dispatch(&self, action: &Action) -> std::result::Result<ActionOutput, ExecutionError> {
        match action {
            Action::File(file) => self.handlers.file.execute(file).await,
            Action::Firestore(doc) => self.handlers.firestore.execute(doc).await,
            Action::Git(git) => self.handlers.git.execute(git).await,
        }
    }

    /// Execute every `PENDING` step of `plan` in place and summarise.
    ///
    /// Cancellation is checked between steps.
    pub async fn execute(
        &self,
        plan: &mut ActionPlan,
        cancel: &CancellationToken,
    ) -> Result<ExecutedPlanSummary> {
        info!(plan_id = %plan.id, task_id = %plan.task_id, steps = plan.steps.len(), "executing plan");

        for step in plan.steps.iter_mut() {
            if step.status != StepStatus::Pending {
                continue;
            }
            if cancel.is_cancelled() {
                warn!(plan_id = %plan.id, step = step.index, "plan execution cancelled");
                return Err(PlanExecutorError::Cancelled {
                    next_step: step.index,
                });
            }

            let kind = step.action.kind_label();
            match self.dispatch(&step.action).await {
                Ok(output) => {
                    step.status = StepStatus::Success;
                    step.result = Some(StepResult {
                        output: output.output,
                        logs: output.logs,
                    });
                    debug!(step = step.index, kind, "step succeeded");
                }
                Err(e) => {
                    step.status = StepStatus::Failed;
                    step.result = Some(StepResult {
                        output: e.to_string(),
                        logs: e.logs,
                    });
                    warn!(step = step.index, kind, error_kind = %e.kind, "step failed, continuing");
                }
            }
            let status = match step.status {
                StepStatus::Success => "SUCCESS",
                StepStatus::Failed => "FAILED",
                StepStatus::Pending => "PENDING",
            };
            self.metrics
                .increment_counter(names::PLAN_STEPS, &[("kind", kind), ("status", status)]);
        }

        let summary = summarize(plan);
        let status_label = match summary.status {
            ExecutionStatus::Success => "SUCCESS",
            ExecutionStatus::Partial => "PARTIAL",
            ExecutionStatus::Failed => "FAILED",
        };
        self.metrics
            .increment_counter(names::PLANS_EXECUTED, &[("status", status_label)]);
        info!(
            plan_id = %plan.id,
            status = status_label,
            successful = summary.successful_steps,
            total = summary.total_steps,
            "plan executed"
        );
        Ok(summary)
    }
}

/// Summary of a plan's current step statuses. `raw_result` lists every
/// step's outcome in order.
pub fn summarize(plan: &ActionPlan) -> ExecutedPlanSummary {
    let raw_steps: Vec<serde_json::Value> = plan
        .steps
        .iter()
        .map(|step| {
            json!({
                "index": step.index,
                "kind": step.action.kind_label(),
                "status": step.status,
                "result": step.result,
            })
        })
        .collect();

    ExecutedPlanSummary {
        plan_id: plan.id,
        summary: plan.summary.clone(),
        status: derive_execution_status(&plan.steps),
        successful_steps: plan
            .steps
            .iter()
            .filter(|s| s.status == StepStatus::Success)
            .count(),
        total_steps: plan.steps.len(),
        raw_result: json!({ "steps": raw_steps }),
    }
}
