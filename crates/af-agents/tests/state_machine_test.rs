use af_agents::routing::RoutingTable;
use af_agents::state_machine::{transition, TaskEvent, TaskStateMachine};
use af_core::types::{Task, TaskStatus};

#[test]
fn happy_path_open_to_done() {
    let mut sm = TaskStateMachine::default();
    assert_eq!(sm.state(), TaskStatus::Open);

    assert_eq!(sm.apply(TaskEvent::Claim).unwrap(), TaskStatus::Running);
    assert_eq!(sm.apply(TaskEvent::Succeed).unwrap(), TaskStatus::Done);
    assert_eq!(sm.history().len(), 2);
}

#[test]
fn retry_loops_back_into_running() {
    let mut sm = TaskStateMachine::default();
    sm.apply(TaskEvent::Claim).unwrap();
    sm.apply(TaskEvent::ScheduleRetry).unwrap(); // running -> retry
    assert_eq!(sm.state(), TaskStatus::Retry);
    sm.apply(TaskEvent::Claim).unwrap(); // retry -> running
    sm.apply(TaskEvent::Exhaust).unwrap(); // running -> failed
    assert_eq!(sm.state(), TaskStatus::Failed);
}

#[test]
fn terminal_states_accept_no_events() {
    let events = [
        TaskEvent::Claim,
        TaskEvent::Succeed,
        TaskEvent::ScheduleRetry,
        TaskEvent::Exhaust,
        TaskEvent::Release,
    ];
    for terminal in [TaskStatus::Done, TaskStatus::Failed] {
        for event in events {
            assert!(transition(terminal, event).is_err(), "{terminal} + {event}");
        }
    }
}

#[test]
fn rejected_event_leaves_state_unchanged() {
    let mut sm = TaskStateMachine::default();
    let err = sm.apply(TaskEvent::Succeed).unwrap_err();
    assert!(err.to_string().contains("succeed"));
    assert_eq!(sm.state(), TaskStatus::Open);
    assert!(sm.history().is_empty());
}

#[test]
fn release_returns_to_open() {
    let mut sm = TaskStateMachine::new(TaskStatus::Retry);
    assert!(sm.can_apply(TaskEvent::Release));
    assert_eq!(sm.apply(TaskEvent::Release).unwrap(), TaskStatus::Open);
}

#[test]
fn every_transition_targets_a_defined_status() {
    for state in TaskStatus::ALL {
        for event in [
            TaskEvent::Claim,
            TaskEvent::Succeed,
            TaskEvent::ScheduleRetry,
            TaskEvent::Exhaust,
            TaskEvent::Release,
        ] {
            if let Ok(next) = transition(state, event) {
                assert!(TaskStatus::ALL.contains(&next));
            }
        }
    }
}

#[test]
fn routing_is_pure() {
    let table = RoutingTable::default();
    let task = Task::new("t", "p", "Build dashboard").with_tags(["frontend", "api"]);
    let first = table.route_task(&task);
    for _ in 0..10 {
        assert_eq!(table.route_task(&task), first);
    }
    assert_eq!(first.provider, "gemini");
}
