use std::sync::Arc;
use std::time::Instant;

use af_core::config::RunnerConfig;
use af_core::store::{StoreError, TaskStore, TaskUpdate};
use af_core::types::{ActivityKind, ActivityRecord, Phase, Task, TaskStatus};
use af_harness::execution::TaskExecutor;
use af_harness::retry::{sleep_or_cancel, BackoffPolicy};
use af_telemetry::metrics::{names, MetricsCollector};
use chrono::Utc;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::routing::{Route, RoutingTable};
use crate::self_heal::HealingStrategy;
use crate::state_machine::{StateMachineError, TaskEvent, TaskStateMachine};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum TaskRunnerError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("project {0} has no open phase")]
    NoOpenPhase(String),
    #[error("phase {phase_id} of project {project_id} has no open task")]
    NoOpenTask { project_id: String, phase_id: String },
    #[error("task {task_id} is already {status}")]
    AlreadyTerminal { task_id: String, status: TaskStatus },
    /// Another runner moved the task first.
    #[error("task {0} was claimed by another runner")]
    ClaimLost(String),
    /// The task left `running` while this runner held it.
    #[error("task {task_id} changed status before {event} could be recorded")]
    TransitionLost { task_id: String, event: TaskEvent },
    #[error(transparent)]
    StateMachine(#[from] StateMachineError),
    #[error("task run cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, TaskRunnerError>;

/// What [`TaskRunner::start_run`] picked and how it ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub phase_id: String,
    pub task_id: String,
    pub provider: String,
    pub succeeded: bool,
}

// ---------------------------------------------------------------------------
// TaskRunner
// ---------------------------------------------------------------------------

/// Drives persisted tasks through `open -> running -> {done | retry | failed}`.
///
/// Every move into `running` is a compare-and-set on the stored status, so
/// concurrent runners never execute the same attempt twice. Backoff waits are
/// async and cancellable.
pub struct TaskRunner {
    store: Arc<dyn TaskStore>,
    executor: Arc<dyn TaskExecutor>,
    routing: RoutingTable,
    config: RunnerConfig,
    metrics: Arc<MetricsCollector>,
}

impl TaskRunner {
    pub fn new(
        store: Arc<dyn TaskStore>,
        executor: Arc<dyn TaskExecutor>,
        routing: RoutingTable,
        config: RunnerConfig,
    ) -> Self {
        Self {
            store,
            executor,
            routing,
            config,
            metrics: Arc::new(MetricsCollector::with_defaults()),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    pub fn route_task(&self, task: &Task) -> Route {
        self.routing.route_task(task)
    }

    /// Run `task` for up to `max_retries` attempts.
    ///
    /// Returns `Ok(true)` once it is `done` and `Ok(false)` once it is
    /// `failed`. Attempts already spent (the persisted `retries`) count
    /// against the budget, so a task resumed after cancellation never
    /// exceeds it. Every status write is a compare-and-set from the source
    /// states of its [`TaskEvent`].
    pub async fn execute_task(
        &self,
        project_id: &str,
        task: &Task,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        let route = match &task.assignee {
            Some(provider) => Route {
                provider: provider.clone(),
                tool: task
                    .tool
                    .clone()
                    .unwrap_or_else(|| self.route_task(task).tool),
            },
            None => self.route_task(task),
        };
        let policy = BackoffPolicy::from_config(&self.config);
        let max_attempts = self.config.max_retries;
        let started = Instant::now();
        let mut flow = TaskStateMachine::new(task.status);

        if task.retries >= max_attempts {
            warn!(task_id = %task.id, retries = task.retries, max_attempts, "no attempts left");
            self.apply_event(project_id, &task.id, &mut flow, TaskEvent::Claim, TaskUpdate::default())
                .await?;
            self.apply_event(
                project_id,
                &task.id,
                &mut flow,
                TaskEvent::Exhaust,
                TaskUpdate::default().with_error("retry budget exhausted"),
            )
            .await?;
            return Ok(false);
        }

        let mut attempt = task.retries;
        loop {
            if cancel.is_cancelled() {
                self.release(project_id, &task.id).await;
                return Err(TaskRunnerError::Cancelled);
            }

            let claim = TaskUpdate::assignment(route.provider.clone(), route.tool.clone())
                .started(Utc::now());
            self.apply_event(project_id, &task.id, &mut flow, TaskEvent::Claim, claim)
                .await?;
            debug!(task_id = %task.id, attempt, provider = %route.provider, "task running");
            self.metrics
                .increment_counter(names::TASK_ATTEMPTS, &[("provider", route.provider.as_str())]);

            let snapshot = self.store.get_task(project_id, &task.id).await?;
            let failure = match self
                .executor
                .execute(project_id, &snapshot, &route.provider)
                .await
            {
                Ok(result) => {
                    self.complete(project_id, &snapshot, result, &route, &mut flow)
                        .await?;
                    self.metrics.observe(
                        names::TASK_DURATION,
                        &[],
                        started.elapsed().as_secs_f64(),
                    );
                    return Ok(true);
                }
                Err(e) => e,
            };

            if attempt + 1 < max_attempts {
                let delay = policy.delay_for(attempt);
                warn!(
                    task_id = %task.id,
                    attempt,
                    error_kind = %failure.kind,
                    error = %failure.message,
                    ?delay,
                    "task attempt failed, retrying"
                );
                self.apply_event(
                    project_id,
                    &task.id,
                    &mut flow,
                    TaskEvent::ScheduleRetry,
                    TaskUpdate::default()
                        .with_error(failure.to_string())
                        .incrementing_retries(),
                )
                .await?;
                self.metrics.increment_counter(
                    names::TASK_RETRIES,
                    &[("error_kind", failure.kind.as_str())],
                );

                if sleep_or_cancel(delay, cancel).await.is_err() {
                    self.release(project_id, &task.id).await;
                    return Err(TaskRunnerError::Cancelled);
                }
                attempt += 1;
                continue;
            }

            let mut update = TaskUpdate::default().with_error(failure.to_string());
            let mut activity = format!("Task '{}' failed: {}", snapshot.title, failure);
            if self.config.self_healing {
                let strategy = HealingStrategy::classify(&failure);
                update = update.with_healing_strategy(strategy.as_str());
                activity.push_str(&format!(" (suggested remedy: {strategy})"));
            }
            self.apply_event(project_id, &task.id, &mut flow, TaskEvent::Exhaust, update)
                .await?;
            self.record_activity(
                project_id,
                ActivityRecord::new(ActivityKind::TaskFailed, activity).for_task(&task.id),
            )
            .await;
            self.metrics.increment_counter(
                names::TASK_OUTCOMES,
                &[("provider", route.provider.as_str()), ("outcome", "failed")],
            );
            error!(
                task_id = %task.id,
                attempts = attempt + 1,
                error_kind = %failure.kind,
                transitions = flow.history().len(),
                "task failed permanently"
            );
            return Ok(false);
        }
    }

    /// Pick the earliest open task of the earliest phase that still has one
    /// and run it.
    ///
    /// An in-progress phase whose remaining tasks all failed is still open
    /// (only `done` tasks count toward completion), so phases without an
    /// open task are passed over rather than blocking later ones. Tasks
    /// claimed by a concurrent runner between the listing and the claim are
    /// skipped in favour of the next open task.
    pub async fn start_run(&self, project_id: &str, cancel: &CancellationToken) -> Result<RunReport> {
        let phases: Vec<Phase> = self
            .store
            .list_phases(project_id)
            .await?
            .into_iter()
            .filter(|p| p.is_open())
            .collect();
        let Some(first_open) = phases.first().map(|p| p.id.clone()) else {
            return Err(TaskRunnerError::NoOpenPhase(project_id.to_string()));
        };

        for phase in phases {
            let candidates: Vec<Task> = self
                .store
                .list_tasks(project_id, &phase.id)
                .await?
                .into_iter()
                .filter(|t| t.status == TaskStatus::Open)
                .collect();
            if candidates.is_empty() {
                debug!(project_id, phase_id = %phase.id, "phase has no open task, skipping");
                continue;
            }

            for task in candidates {
                let provider = task
                    .assignee
                    .clone()
                    .unwrap_or_else(|| self.route_task(&task).provider);
                info!(project_id, phase_id = %phase.id, task_id = %task.id, %provider, "starting run");

                match self.execute_task(project_id, &task, cancel).await {
                    Ok(succeeded) => {
                        return Ok(RunReport {
                            phase_id: phase.id.clone(),
                            task_id: task.id,
                            provider,
                            succeeded,
                        })
                    }
                    Err(TaskRunnerError::ClaimLost(id)) => {
                        debug!(task_id = %id, "task taken by another runner, trying next");
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        Err(TaskRunnerError::NoOpenTask {
            project_id: project_id.to_string(),
            phase_id: first_open,
        })
    }

    /// Run one task by id, routing it first if it has no provider yet.
    pub async fn run_single_task(
        &self,
        project_id: &str,
        task_id: &str,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        let task = self.store.get_task(project_id, task_id).await?;
        if task.status.is_terminal() {
            return Err(TaskRunnerError::AlreadyTerminal {
                task_id: task.id,
                status: task.status,
            });
        }
        self.execute_task(project_id, &task, cancel).await
    }

    // -- internals -----------------------------------------------------------

    async fn complete(
        &self,
        project_id: &str,
        task: &Task,
        result: serde_json::Value,
        route: &Route,
        flow: &mut TaskStateMachine,
    ) -> Result<()> {
        self.apply_event(
            project_id,
            &task.id,
            flow,
            TaskEvent::Succeed,
            TaskUpdate::default()
                .with_result(result)
                .completed(Utc::now()),
        )
        .await?;

        match self
            .store
            .increment_phase_completed(project_id, &task.phase_id)
            .await
        {
            Ok(phase) => debug!(
                phase_id = %phase.id,
                completed = phase.completed_tasks_count,
                total = phase.total_tasks,
                "phase progress updated"
            ),
            Err(e) => warn!(phase_id = %task.phase_id, error = %e, "phase progress not updated"),
        }

        self.record_activity(
            project_id,
            ActivityRecord::new(
                ActivityKind::TaskCompleted,
                format!("Task '{}' completed by {}", task.title, route.provider),
            )
            .for_task(&task.id),
        )
        .await;
        self.metrics.increment_counter(
            names::TASK_OUTCOMES,
            &[("provider", route.provider.as_str()), ("outcome", "done")],
        );
        info!(
            task_id = %task.id,
            provider = %route.provider,
            transitions = flow.history().len(),
            "task done"
        );
        Ok(())
    }

    /// Persist `event` as a compare-and-set from its source states and mirror
    /// it in `flow`. A lost claim is [`TaskRunnerError::ClaimLost`]; any other
    /// lost write is [`TaskRunnerError::TransitionLost`].
    async fn apply_event(
        &self,
        project_id: &str,
        task_id: &str,
        flow: &mut TaskStateMachine,
        event: TaskEvent,
        update: TaskUpdate,
    ) -> Result<()> {
        let lost = || match event {
            TaskEvent::Claim => TaskRunnerError::ClaimLost(task_id.to_string()),
            _ => TaskRunnerError::TransitionLost {
                task_id: task_id.to_string(),
                event,
            },
        };
        if !flow.can_apply(event) {
            return Err(lost());
        }
        let moved = self
            .store
            .compare_and_set_status(project_id, task_id, event.sources(), event.target(), update)
            .await?;
        if !moved {
            warn!(task_id, %event, "task moved by another writer");
            return Err(lost());
        }
        flow.apply(event)?;
        Ok(())
    }

    /// Hand a claimed or backing-off task back to `open`.
    async fn release(&self, project_id: &str, task_id: &str) {
        let released = self
            .store
            .compare_and_set_status(
                project_id,
                task_id,
                TaskEvent::Release.sources(),
                TaskEvent::Release.target(),
                TaskUpdate::default(),
            )
            .await;
        match released {
            Ok(_) => info!(task_id, "task released after cancellation"),
            Err(e) => warn!(task_id, error = %e, "could not release cancelled task"),
        }
    }

    async fn record_activity(&self, project_id: &str, record: ActivityRecord) {
        if let Err(e) = self.store.append_activity(project_id, record).await {
            warn!(project_id, error = %e, "activity not recorded");
        }
    }
}
