// End-to-end coordination scenarios against the local file backend

use chrono::{DateTime, Duration, TimeZone, Utc};
use futures::future::join_all;
use std::sync::Arc;
use task_conductor::coordination::{
    ClaimCoordinator, ClaimOutcome, HeartbeatOutcome, LivenessMonitor, ReclaimProcessor,
    TaskMatcher,
};
use task_conductor::store::{LocalFileStore, RetryPolicy, TaskFilter, TaskStore};
use task_conductor::tasks::{AbandonReason, ClaimStatus, Effort, Priority, Task, TaskState};
use task_conductor::ManualClock;
use tempfile::TempDir;

fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap()
}

fn open(dir: &TempDir) -> Arc<LocalFileStore> {
    Arc::new(LocalFileStore::new(
        dir.path().join("workflow-state.json"),
        std::time::Duration::from_secs(5),
    ))
}

fn coordinator(store: Arc<LocalFileStore>, clock: Arc<ManualClock>) -> ClaimCoordinator {
    ClaimCoordinator::new(store, TaskMatcher::default(), clock).with_retry(RetryPolicy {
        max_attempts: 5,
        base_delay: std::time::Duration::from_millis(5),
        max_delay: std::time::Duration::from_millis(20),
        jitter: true,
    })
}

#[tokio::test]
async fn test_security_and_dev_pick_different_tasks() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir);
    store
        .put_tasks(vec![
            Task::new("A", "Update contributor guide", start())
                .with_priority(Priority::High)
                .with_effort(Effort::Small),
            Task::new("B", "Rotate signing keys", start())
                .with_skills(["security"])
                .with_priority(Priority::Critical)
                .with_effort(Effort::Large),
        ])
        .await
        .unwrap();
    let clock = Arc::new(ManualClock::new(start()));

    let ClaimOutcome::Claimed { task, .. } = coordinator(store.clone(), clock.clone())
        .claim("security", None)
        .await
        .unwrap()
    else {
        panic!("security should claim a task");
    };
    assert_eq!(task.id, "B");

    let ClaimOutcome::Claimed { task, .. } = coordinator(store.clone(), clock)
        .claim("dev", None)
        .await
        .unwrap()
    else {
        panic!("dev should claim a task");
    };
    assert_eq!(task.id, "A");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_claims_yield_exactly_one_winner() {
    let dir = TempDir::new().unwrap();
    open(&dir)
        .put_tasks(vec![Task::new("only", "The single task", start())])
        .await
        .unwrap();
    let clock = Arc::new(ManualClock::new(start()));

    // Separate store instances open separate lock descriptors, like separate processes
    let contenders: Vec<_> = (0..8)
        .map(|_| coordinator(open(&dir), clock.clone()))
        .collect();
    let outcomes = join_all(contenders.iter().map(|c| c.claim("dev", None))).await;

    let winners = outcomes
        .iter()
        .filter(|o| matches!(o, Ok(ClaimOutcome::Claimed { .. })))
        .count();
    let idle = outcomes
        .iter()
        .filter(|o| matches!(o, Ok(ClaimOutcome::Idle { .. })))
        .count();
    assert_eq!(winners, 1);
    assert_eq!(idle, 7);

    let store = open(&dir);
    assert_eq!(store.get("only").await.unwrap().state, TaskState::Claimed);
    assert_eq!(store.list_active_claims().await.unwrap().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_at_most_one_claim_per_task_under_load() {
    let dir = TempDir::new().unwrap();
    let tasks: Vec<Task> = (0..5).map(|i| Task::new(format!("t{i}"), "work", start())).collect();
    open(&dir).put_tasks(tasks).await.unwrap();
    let clock = Arc::new(ManualClock::new(start()));

    let contenders: Vec<_> = (0..12)
        .map(|_| coordinator(open(&dir), clock.clone()))
        .collect();
    let outcomes = join_all(contenders.iter().map(|c| c.claim("dev", None))).await;
    let mut won: Vec<(String, String)> = outcomes
        .iter()
        .filter_map(|o| match o {
            Ok(ClaimOutcome::Claimed { claim, task, .. }) => {
                assert_eq!(claim.task_id, task.id);
                Some((task.id.clone(), claim.agent_id.clone()))
            }
            _ => None,
        })
        .collect();
    assert!(!won.is_empty(), "nobody claimed anything");
    assert!(won.len() <= 5);

    won.sort();
    let mut won_ids: Vec<&str> = won.iter().map(|(id, _)| id.as_str()).collect();
    won_ids.dedup();
    assert_eq!(won_ids.len(), won.len(), "two contenders were told they won the same task");

    let store = open(&dir);
    for (task_id, agent_id) in &won {
        let entry = store.get(task_id).await.unwrap();
        assert_eq!(entry.state, TaskState::Claimed);
        assert_eq!(entry.claim.map(|c| c.agent_id), Some(agent_id.clone()));
    }

    let active = store.list_active_claims().await.unwrap();
    let mut task_ids: Vec<_> = active.iter().map(|r| r.claim.task_id.clone()).collect();
    task_ids.sort();
    task_ids.dedup();
    assert_eq!(task_ids.len(), active.len(), "a task is held by two claims");
    assert_eq!(active.len(), won.len());
}

#[tokio::test]
async fn test_silent_agent_is_reclaimed_after_timeout() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir);
    store
        .put_tasks(vec![Task::new("X", "Migrate billing", start())])
        .await
        .unwrap();
    let clock = Arc::new(ManualClock::new(start()));
    let coordinator = coordinator(store.clone(), clock.clone());
    let sweeper = ReclaimProcessor::new(
        store.clone(),
        clock.clone(),
        LivenessMonitor::new(Duration::minutes(30)),
    );

    let ClaimOutcome::Claimed { claim, .. } = coordinator.claim("dev", None).await.unwrap() else {
        panic!("expected a claim");
    };

    // Heart-beating every five minutes keeps the claim alive
    for _ in 0..6 {
        clock.advance(Duration::minutes(5));
        assert!(matches!(
            coordinator.heartbeat(&claim.agent_id).await.unwrap(),
            HeartbeatOutcome::Alive { .. }
        ));
        assert!(sweeper.sweep(false).await.unwrap().reclaimed.is_empty());
    }

    clock.advance(Duration::minutes(30));
    assert!(sweeper.sweep(false).await.unwrap().reclaimed.is_empty());

    clock.advance(Duration::minutes(1));
    let report = sweeper.sweep(false).await.unwrap();
    assert_eq!(report.reclaimed.len(), 1);
    assert_eq!(report.reclaimed[0].task_id, "X");

    assert_eq!(store.get("X").await.unwrap().state, TaskState::Available);
    let terminal = store.list_terminal_claims().await.unwrap();
    assert_eq!(terminal[0].claim.status, ClaimStatus::Abandoned);
    assert_eq!(terminal[0].claim.abandonment_reason, Some(AbandonReason::StaleHeartbeat));

    // The original agent learns on its next heartbeat
    assert!(matches!(
        coordinator.heartbeat(&claim.agent_id).await.unwrap(),
        HeartbeatOutcome::Lost { .. }
    ));

    // And the task can be claimed again
    let ClaimOutcome::Claimed { task, .. } = coordinator.claim("dev", None).await.unwrap() else {
        panic!("reclaimed task should be claimable");
    };
    assert_eq!(task.id, "X");
}

#[tokio::test]
async fn test_locked_resources_block_overlapping_claims() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir);
    store
        .put_tasks(vec![
            Task::new("1", "Refactor auth", start()).with_locked_resources(["src/auth.rs"]),
            Task::new("2", "Add auth tests", start()).with_locked_resources(["src/auth.rs", "tests/"]),
        ])
        .await
        .unwrap();
    let clock = Arc::new(ManualClock::new(start()));

    let first = coordinator(store.clone(), clock.clone()).claim("dev", None).await.unwrap();
    assert!(matches!(first, ClaimOutcome::Claimed { ref task, .. } if task.id == "1"));

    let second = coordinator(store.clone(), clock).claim("dev", None).await.unwrap();
    assert!(matches!(second, ClaimOutcome::Idle { .. }));
    assert_eq!(
        store.list_available(&TaskFilter::default()).await.unwrap()[0].id,
        "2"
    );
}
