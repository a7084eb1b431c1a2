//! Integration tests for the TaskRunner (claim -> execute -> retry/fail).

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use af_agents::routing::RoutingTable;
use af_agents::state_machine::TaskEvent;
use af_agents::task_runner::{TaskRunner, TaskRunnerError};
use af_core::config::RunnerConfig;
use af_core::store::{InMemoryTaskStore, TaskStore, TaskUpdate};
use af_core::types::{ActivityKind, Phase, PhaseStatus, Task, TaskStatus};
use af_harness::execution::{ErrorKind, ExecutionError, TaskExecutor};
use af_telemetry::metrics::{names, MetricsCollector};
use serde_json::json;
use tokio_util::sync::CancellationToken;

const PROJECT: &str = "p1";

// ---------------------------------------------------------------------------
// Mock executor
// ---------------------------------------------------------------------------

/// Replays scripted outcomes and records what each attempt saw.
struct ScriptedExecutor {
    outcomes: Mutex<VecDeque<Result<serde_json::Value, ExecutionError>>>,
    seen: Mutex<Vec<(TaskStatus, u32, String)>>,
    delay: Duration,
}

impl ScriptedExecutor {
    fn new(outcomes: Vec<Result<serde_json::Value, ExecutionError>>) -> Self {
        Self {
            outcomes: Mutex::new(outcomes.into()),
            seen: Mutex::new(Vec::new()),
            delay: Duration::ZERO,
        }
    }

    fn always_failing(kind: ErrorKind) -> Self {
        Self::new((0..10).map(|_| Err(ExecutionError::new(kind, "boom"))).collect())
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn calls(&self) -> usize {
        self.seen.lock().unwrap().len()
    }

    fn seen(&self) -> Vec<(TaskStatus, u32, String)> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl TaskExecutor for ScriptedExecutor {
    async fn execute(
        &self,
        _project_id: &str,
        task: &Task,
        provider: &str,
    ) -> Result<serde_json::Value, ExecutionError> {
        self.seen
            .lock()
            .unwrap()
            .push((task.status, task.retries, provider.to_string()));
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.outcomes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(json!({ "ok": true })))
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn config(max_retries: u32) -> RunnerConfig {
    RunnerConfig {
        max_retries,
        backoff_ms: 1_000,
        backoff_multiplier: 2.0,
        max_backoff_ms: None,
        self_healing: true,
    }
}

fn seeded_store() -> Arc<InMemoryTaskStore> {
    let store = Arc::new(InMemoryTaskStore::new());
    store.insert_phase(PROJECT, Phase::new("ph1", "Foundation", 1));
    store.insert_phase(PROJECT, Phase::new("ph2", "Features", 2));
    store.insert_task(PROJECT, Task::new("t1", "ph1", "Set up API").with_tags(["backend"]));
    store
}

fn runner(
    store: Arc<InMemoryTaskStore>,
    executor: Arc<ScriptedExecutor>,
    config: RunnerConfig,
) -> TaskRunner {
    TaskRunner::new(store, executor, RoutingTable::default(), config)
}

async fn task(store: &InMemoryTaskStore, id: &str) -> Task {
    store.get_task(PROJECT, id).await.unwrap()
}

// ---------------------------------------------------------------------------
// execute_task
// ---------------------------------------------------------------------------

#[tokio::test]
async fn success_marks_done_and_updates_phase() {
    let store = seeded_store();
    let executor = Arc::new(ScriptedExecutor::new(vec![Ok(json!({ "files": 2 }))]));
    let metrics = Arc::new(MetricsCollector::new());
    let runner = runner(store.clone(), executor.clone(), config(3)).with_metrics(metrics.clone());

    let t1 = task(&store, "t1").await;
    let ok = runner
        .execute_task(PROJECT, &t1, &CancellationToken::new())
        .await
        .unwrap();
    assert!(ok);

    let t1 = task(&store, "t1").await;
    assert_eq!(t1.status, TaskStatus::Done);
    assert_eq!(t1.result, Some(json!({ "files": 2 })));
    assert_eq!(t1.assignee.as_deref(), Some("claude"));
    assert!(t1.started_at.is_some());
    assert!(t1.completed_at.is_some());
    assert_eq!(t1.retries, 0);

    // The executor saw the task already claimed.
    assert_eq!(executor.seen()[0].0, TaskStatus::Running);

    let phase = store.phase(PROJECT, "ph1").unwrap();
    assert_eq!(phase.completed_tasks_count, 1);
    assert_eq!(phase.status, PhaseStatus::Done);

    let activity = store.activity(PROJECT);
    assert_eq!(activity.len(), 1);
    assert_eq!(activity[0].kind, ActivityKind::TaskCompleted);
    assert_eq!(activity[0].task_id.as_deref(), Some("t1"));

    assert_eq!(
        metrics.counter(names::TASK_OUTCOMES, &[("provider", "claude"), ("outcome", "done")]),
        1
    );
}

#[tokio::test(start_paused = true)]
async fn retries_wait_with_exponential_backoff() {
    let store = seeded_store();
    let executor = Arc::new(ScriptedExecutor::new(vec![
        Err(ExecutionError::new(ErrorKind::Network, "reset")),
        Err(ExecutionError::new(ErrorKind::Network, "reset")),
        Ok(json!("done")),
    ]));
    let runner = runner(store.clone(), executor.clone(), config(3));

    let start = tokio::time::Instant::now();
    let t1 = task(&store, "t1").await;
    let ok = runner
        .execute_task(PROJECT, &t1, &CancellationToken::new())
        .await
        .unwrap();
    let elapsed = start.elapsed();

    assert!(ok);
    // 1s after the first failure, 2s after the second.
    assert!(elapsed >= Duration::from_secs(3), "elapsed {elapsed:?}");
    assert!(elapsed < Duration::from_secs(4), "elapsed {elapsed:?}");

    let t1 = task(&store, "t1").await;
    assert_eq!(t1.status, TaskStatus::Done);
    assert_eq!(t1.retries, 2);
    assert_eq!(executor.calls(), 3);
}

#[tokio::test(start_paused = true)]
async fn exhaustion_marks_failed_with_healing_label() {
    let store = seeded_store();
    let executor = Arc::new(ScriptedExecutor::always_failing(ErrorKind::RateLimited));
    let metrics = Arc::new(MetricsCollector::new());
    let runner = runner(store.clone(), executor.clone(), config(3)).with_metrics(metrics.clone());

    let t1 = task(&store, "t1").await;
    let ok = runner
        .execute_task(PROJECT, &t1, &CancellationToken::new())
        .await
        .unwrap();
    assert!(!ok);
    assert_eq!(executor.calls(), 3);

    let t1 = task(&store, "t1").await;
    assert_eq!(t1.status, TaskStatus::Failed);
    assert!(t1.retries <= 3);
    assert_eq!(t1.retries, 2);
    assert_eq!(t1.healing_strategy.as_deref(), Some("backoff_and_requeue"));
    assert!(t1.error.unwrap().contains("boom"));

    let activity = store.activity(PROJECT);
    assert_eq!(activity.last().unwrap().kind, ActivityKind::TaskFailed);

    assert_eq!(metrics.counter(names::TASK_RETRIES, &[("error_kind", "rate_limited")]), 2);
    // Terminal failure does not advance the phase.
    assert_eq!(store.phase(PROJECT, "ph1").unwrap().completed_tasks_count, 0);
}

#[tokio::test(start_paused = true)]
async fn retries_stay_below_budget_while_non_terminal() {
    let store = seeded_store();
    let executor = Arc::new(ScriptedExecutor::always_failing(ErrorKind::Timeout));
    let runner = runner(store.clone(), executor.clone(), config(4));

    let t1 = task(&store, "t1").await;
    runner
        .execute_task(PROJECT, &t1, &CancellationToken::new())
        .await
        .unwrap();

    for (status, retries, _) in executor.seen() {
        assert_eq!(status, TaskStatus::Running);
        assert!(retries < 4, "retries {retries} while running");
    }
    let retries_seen: Vec<u32> = executor.seen().iter().map(|s| s.1).collect();
    assert_eq!(retries_seen, vec![0, 1, 2, 3]);
    assert_eq!(task(&store, "t1").await.status, TaskStatus::Failed);
}

#[tokio::test(start_paused = true)]
async fn self_healing_disabled_leaves_no_label() {
    let store = seeded_store();
    let executor = Arc::new(ScriptedExecutor::always_failing(ErrorKind::Authentication));
    let config = RunnerConfig {
        self_healing: false,
        ..config(1)
    };
    let runner = runner(store.clone(), executor, config);

    let t1 = task(&store, "t1").await;
    assert!(!runner
        .execute_task(PROJECT, &t1, &CancellationToken::new())
        .await
        .unwrap());
    assert!(task(&store, "t1").await.healing_strategy.is_none());
}

#[tokio::test(start_paused = true)]
async fn cancellation_during_backoff_reopens_task() {
    let store = seeded_store();
    let executor = Arc::new(ScriptedExecutor::always_failing(ErrorKind::Network));
    let runner = runner(store.clone(), executor.clone(), config(5));
    let cancel = CancellationToken::new();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(500)).await;
        trigger.cancel();
    });

    let t1 = task(&store, "t1").await;
    let err = runner.execute_task(PROJECT, &t1, &cancel).await.unwrap_err();
    assert!(matches!(err, TaskRunnerError::Cancelled));
    assert_eq!(executor.calls(), 1);

    let t1 = task(&store, "t1").await;
    assert_eq!(t1.status, TaskStatus::Open);
    assert_eq!(t1.retries, 1);
}

#[tokio::test(start_paused = true)]
async fn resumed_task_keeps_spent_attempts() {
    let store = seeded_store();
    // One attempt was spent before a cancellation reopened the task.
    store
        .update_task(PROJECT, "t1", TaskUpdate::default().incrementing_retries())
        .await
        .unwrap();
    let executor = Arc::new(ScriptedExecutor::always_failing(ErrorKind::Internal));
    let runner = runner(store.clone(), executor.clone(), config(3));

    let t1 = task(&store, "t1").await;
    assert_eq!(t1.retries, 1);
    assert!(!runner
        .execute_task(PROJECT, &t1, &CancellationToken::new())
        .await
        .unwrap());
    assert_eq!(executor.calls(), 2);
    assert_eq!(task(&store, "t1").await.retries, 2);
}

#[tokio::test(start_paused = true)]
async fn concurrent_runners_never_double_execute() {
    let store = seeded_store();
    let executor = Arc::new(
        ScriptedExecutor::new(vec![Ok(json!(1)), Ok(json!(2))]).with_delay(Duration::from_secs(1)),
    );
    let a = runner(store.clone(), executor.clone(), config(3));
    let b = runner(store.clone(), executor.clone(), config(3));
    let cancel = CancellationToken::new();

    let t1 = task(&store, "t1").await;
    let (ra, rb) = tokio::join!(
        a.execute_task(PROJECT, &t1, &cancel),
        b.execute_task(PROJECT, &t1, &cancel)
    );

    let lost = [&ra, &rb]
        .iter()
        .filter(|r| matches!(r, Err(TaskRunnerError::ClaimLost(_))))
        .count();
    assert_eq!(lost, 1);
    assert_eq!(executor.calls(), 1);
    assert_eq!(store.phase(PROJECT, "ph1").unwrap().completed_tasks_count, 1);
}

/// Resets the task to `open` behind the runner's back, as an operator edit
/// would, then reports success.
struct ResettingExecutor {
    store: Arc<InMemoryTaskStore>,
}

#[async_trait::async_trait]
impl TaskExecutor for ResettingExecutor {
    async fn execute(
        &self,
        project_id: &str,
        task: &Task,
        _provider: &str,
    ) -> Result<serde_json::Value, ExecutionError> {
        self.store
            .update_task(project_id, &task.id, TaskUpdate::status(TaskStatus::Open))
            .await
            .unwrap();
        Ok(json!({ "ok": true }))
    }
}

#[tokio::test]
async fn outcome_is_not_written_once_task_left_running() {
    let store = seeded_store();
    let executor = Arc::new(ResettingExecutor {
        store: store.clone(),
    });
    let runner = TaskRunner::new(store.clone(), executor, RoutingTable::default(), config(3));

    let t1 = task(&store, "t1").await;
    let err = runner
        .execute_task(PROJECT, &t1, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        TaskRunnerError::TransitionLost {
            event: TaskEvent::Succeed,
            ..
        }
    ));

    let t1 = task(&store, "t1").await;
    assert_eq!(t1.status, TaskStatus::Open);
    assert!(t1.result.is_none());
    assert_eq!(store.phase(PROJECT, "ph1").unwrap().completed_tasks_count, 0);
    assert!(store.activity(PROJECT).is_empty());
}

#[tokio::test]
async fn spent_budget_fails_without_executing() {
    let store = seeded_store();
    for _ in 0..3 {
        store
            .update_task(PROJECT, "t1", TaskUpdate::default().incrementing_retries())
            .await
            .unwrap();
    }
    let executor = Arc::new(ScriptedExecutor::new(vec![]));
    let runner = runner(store.clone(), executor.clone(), config(3));

    let t1 = task(&store, "t1").await;
    assert!(!runner
        .execute_task(PROJECT, &t1, &CancellationToken::new())
        .await
        .unwrap());
    assert_eq!(executor.calls(), 0);
    let t1 = task(&store, "t1").await;
    assert_eq!(t1.status, TaskStatus::Failed);
    assert_eq!(t1.error.as_deref(), Some("retry budget exhausted"));
}

#[tokio::test]
async fn stale_running_snapshot_is_not_claimed() {
    let store = seeded_store();
    let executor = Arc::new(ScriptedExecutor::new(vec![]));
    let runner = runner(store.clone(), executor.clone(), config(3));

    let mut stale = task(&store, "t1").await;
    stale.status = TaskStatus::Running;
    assert!(matches!(
        runner
            .execute_task(PROJECT, &stale, &CancellationToken::new())
            .await,
        Err(TaskRunnerError::ClaimLost(_))
    ));
    assert_eq!(executor.calls(), 0);
    assert_eq!(task(&store, "t1").await.status, TaskStatus::Open);
}

// ---------------------------------------------------------------------------
// start_run / run_single_task
// ---------------------------------------------------------------------------

#[tokio::test]
async fn start_run_picks_earliest_open_phase_and_task() {
    let store = seeded_store();
    store.insert_task(PROJECT, Task::new("t2", "ph1", "Add UI").with_tags(["ui"]));
    store.insert_task(PROJECT, Task::new("t3", "ph2", "Later"));
    let executor = Arc::new(ScriptedExecutor::new(vec![]));
    let runner = runner(store.clone(), executor.clone(), config(3));
    let cancel = CancellationToken::new();

    let first = runner.start_run(PROJECT, &cancel).await.unwrap();
    assert_eq!(first.phase_id, "ph1");
    assert_eq!(first.task_id, "t1");
    assert_eq!(first.provider, "claude");
    assert!(first.succeeded);

    let second = runner.start_run(PROJECT, &cancel).await.unwrap();
    assert_eq!(second.task_id, "t2");
    assert_eq!(second.provider, "gemini");

    // ph1 is now done, so the run moves on to ph2.
    let third = runner.start_run(PROJECT, &cancel).await.unwrap();
    assert_eq!(third.phase_id, "ph2");
    assert_eq!(third.task_id, "t3");

    let err = runner.start_run(PROJECT, &cancel).await.unwrap_err();
    assert!(matches!(err, TaskRunnerError::NoOpenPhase(_)));
}

#[tokio::test]
async fn start_run_passes_over_phase_with_only_failed_tasks() {
    let store = seeded_store();
    store.insert_task(PROJECT, Task::new("t3", "ph2", "Later"));
    store
        .update_task(PROJECT, "t1", TaskUpdate::status(TaskStatus::Failed))
        .await
        .unwrap();
    let executor = Arc::new(ScriptedExecutor::new(vec![]));
    let runner = runner(store.clone(), executor, config(3));

    // ph1 never reaches done because t1 failed, but it no longer blocks ph2.
    assert!(store.phase(PROJECT, "ph1").unwrap().is_open());
    let report = runner
        .start_run(PROJECT, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.phase_id, "ph2");
    assert_eq!(report.task_id, "t3");
}

#[tokio::test]
async fn start_run_without_open_task_is_descriptive() {
    let store = Arc::new(InMemoryTaskStore::new());
    store.insert_phase(PROJECT, Phase::new("empty", "Empty", 1));
    let runner = runner(store, Arc::new(ScriptedExecutor::new(vec![])), config(3));

    let err = runner
        .start_run(PROJECT, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, TaskRunnerError::NoOpenTask { .. }));
    assert!(err.to_string().contains("empty"));
}

#[tokio::test]
async fn run_single_task_routes_unassigned_task() {
    let store = seeded_store();
    store.insert_task(PROJECT, Task::new("docs", "ph2", "Write docs").with_tags(["docs"]));
    let executor = Arc::new(ScriptedExecutor::new(vec![]));
    let runner = runner(store.clone(), executor.clone(), config(3));

    assert!(runner
        .run_single_task(PROJECT, "docs", &CancellationToken::new())
        .await
        .unwrap());
    let docs = task(&store, "docs").await;
    assert_eq!(docs.assignee.as_deref(), Some("openai"));
    assert_eq!(docs.tool.as_deref(), Some("write"));
    assert_eq!(executor.seen()[0].2, "openai");
}

#[tokio::test]
async fn run_single_task_keeps_existing_assignee() {
    let store = seeded_store();
    store
        .update_task(PROJECT, "t1", TaskUpdate::assignment("local", "shell"))
        .await
        .unwrap();
    let executor = Arc::new(ScriptedExecutor::new(vec![]));
    let runner = runner(store.clone(), executor.clone(), config(3));

    runner
        .run_single_task(PROJECT, "t1", &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(executor.seen()[0].2, "local");
    assert_eq!(task(&store, "t1").await.tool.as_deref(), Some("shell"));
}

#[tokio::test]
async fn run_single_task_rejects_terminal_and_missing_tasks() {
    let store = seeded_store();
    store
        .update_task(PROJECT, "t1", TaskUpdate::status(TaskStatus::Done))
        .await
        .unwrap();
    let runner = runner(store, Arc::new(ScriptedExecutor::new(vec![])), config(3));
    let cancel = CancellationToken::new();

    assert!(matches!(
        runner.run_single_task(PROJECT, "t1", &cancel).await,
        Err(TaskRunnerError::AlreadyTerminal { .. })
    ));
    assert!(matches!(
        runner.run_single_task(PROJECT, "nope", &cancel).await,
        Err(TaskRunnerError::Store(_))
    ));
}
