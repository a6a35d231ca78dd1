use std::collections::HashSet;

use th_core::board::{BoardError, BoardFilter, TaskBoard};
use th_core::config::RoleDirectory;
use th_core::event_bus::{EventBus, EventFilter};
use th_core::store::Store;
use th_core::types::*;

fn roles() -> RoleDirectory {
    RoleDirectory::new()
        .with_role("planner", "PL", Some("FEAT"))
        .with_role("coder", "CD", None)
        .with_role("reviewer", "RV", None)
}

async fn setup() -> (TaskBoard, Group) {
    let store = Store::new_in_memory().await.unwrap();
    let board = TaskBoard::new(store, roles(), EventBus::new());
    let group = board.create_group("feature", "planner", "cli").await.unwrap();
    (board, group)
}

async fn task(board: &TaskBoard, group: &Group, title: &str, deps: &[&str]) -> Task {
    board
        .create_task(
            NewTask::new(&group.id, title, "implementation", "coder", "cli")
                .blocked_by(deps.iter().copied()),
        )
        .await
        .unwrap()
}

async fn run(board: &TaskBoard, id: &str) -> Task {
    let claimed = board.claim_task("coder", "coder-1").await.unwrap().unwrap();
    assert_eq!(claimed.id, id);
    board.complete_task(id).await.unwrap()
}

// ---------------------------------------------------------------------------
// Creation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn task_ids_are_prefixed_and_sequential() {
    let (board, group) = setup().await;
    let a = task(&board, &group, "a", &[]).await;
    let b = task(&board, &group, "b", &[]).await;
    let review = board
        .create_task(NewTask::new(&group.id, "review", "code_review", "reviewer", "cli"))
        .await
        .unwrap();

    assert_eq!(a.id, "CD-001");
    assert_eq!(b.id, "CD-002");
    assert_eq!(review.id, "RV-001");
    assert_eq!(a.status, TaskStatus::Pending);
    assert!(a.claimed_by.is_none());
}

#[tokio::test]
async fn unknown_references_persist_nothing() {
    let (board, group) = setup().await;

    let err = board
        .create_task(NewTask::new("FEAT-999", "x", "implementation", "coder", "cli"))
        .await
        .unwrap_err();
    assert!(matches!(err, BoardError::UnknownGroup(_)));

    let err = board
        .create_task(NewTask::new(&group.id, "x", "implementation", "tester", "cli"))
        .await
        .unwrap_err();
    assert!(matches!(err, BoardError::UnknownRole(_)));

    let board_view = board.get_board(BoardFilter::default()).await.unwrap();
    assert!(board_view.values().all(Vec::is_empty));
}

#[tokio::test]
async fn dependency_on_completed_task_starts_pending() {
    let (board, group) = setup().await;
    let a = task(&board, &group, "a", &[]).await;
    run(&board, &a.id).await;

    let b = task(&board, &group, "b", &[a.id.as_str()]).await;
    assert_eq!(b.status, TaskStatus::Pending);

    let deps = board.dependencies_of(&b.id).await.unwrap();
    assert_eq!(deps.len(), 1);
    assert!(deps[0].resolved);
    assert!(deps[0].resolved_at.is_some());
}

#[tokio::test]
async fn creation_events_are_persisted_and_published() {
    let (board, group) = setup().await;
    let a = task(&board, &group, "a", &[]).await;

    let durable = board
        .store()
        .list_events(Some(EventType::TaskCreated), 10)
        .await
        .unwrap();
    assert_eq!(durable.len(), 1);
    assert_eq!(durable[0].task_id.as_deref(), Some(a.id.as_str()));

    let published = board.bus().get_history(Some(EventFilter::All));
    let kinds: Vec<EventType> = published.iter().map(|e| e.event_type).collect();
    assert_eq!(kinds, vec![EventType::GroupCreated, EventType::TaskCreated]);
}

// ---------------------------------------------------------------------------
// Claiming
// ---------------------------------------------------------------------------

#[tokio::test]
async fn claim_returns_none_when_nothing_is_pending() {
    let (board, group) = setup().await;
    assert!(board.claim_task("coder", "coder-1").await.unwrap().is_none());

    let a = task(&board, &group, "a", &[]).await;
    task(&board, &group, "b", &[a.id.as_str()]).await;
    board.claim_task("coder", "coder-1").await.unwrap().unwrap();
    assert!(board.claim_task("coder", "coder-2").await.unwrap().is_none());
}

#[tokio::test]
async fn claim_respects_role() {
    let (board, group) = setup().await;
    task(&board, &group, "a", &[]).await;
    assert!(board.claim_task("reviewer", "reviewer-1").await.unwrap().is_none());
}

#[tokio::test]
async fn claim_stamps_claimant_and_start_time() {
    let (board, group) = setup().await;
    task(&board, &group, "a", &[]).await;
    let claimed = board.claim_task("coder", "coder-7").await.unwrap().unwrap();
    assert_eq!(claimed.status, TaskStatus::InProgress);
    assert_eq!(claimed.claimed_by.as_deref(), Some("coder-7"));
    assert!(claimed.started_at.is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn exactly_one_concurrent_claimer_wins() {
    let (board, group) = setup().await;
    task(&board, &group, "only", &[]).await;

    let mut handles = Vec::new();
    for i in 0..16 {
        let board = board.clone();
        handles.push(tokio::spawn(async move {
            board.claim_task("coder", &format!("coder-{i}")).await.unwrap()
        }));
    }
    let mut winners = 0;
    for handle in handles {
        if handle.await.unwrap().is_some() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn separate_connections_never_double_claim() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("board.db");
    let first = TaskBoard::new(Store::new(&path).await.unwrap(), roles(), EventBus::new());
    let second = TaskBoard::new(Store::new(&path).await.unwrap(), roles(), EventBus::new());

    let group = first.create_group("g", "planner", "cli").await.unwrap();
    for i in 0..20 {
        task(&first, &group, &format!("t{i}"), &[]).await;
    }

    let mut handles = Vec::new();
    for (n, board) in [first.clone(), second.clone(), first.clone(), second.clone()]
        .into_iter()
        .enumerate()
    {
        handles.push(tokio::spawn(async move {
            let mut mine = Vec::new();
            while let Some(task) = board.claim_task("coder", &format!("coder-{n}")).await.unwrap() {
                mine.push(task.id);
            }
            mine
        }));
    }

    let mut seen = HashSet::new();
    for handle in handles {
        for id in handle.await.unwrap() {
            assert!(seen.insert(id.clone()), "{id} claimed twice");
        }
    }
    assert_eq!(seen.len(), 20);
}

// ---------------------------------------------------------------------------
// Dependencies
// ---------------------------------------------------------------------------

#[tokio::test]
async fn completing_a_dependency_unblocks_the_dependent() {
    let (board, group) = setup().await;
    let a = task(&board, &group, "a", &[]).await;
    let b = task(&board, &group, "b", &[a.id.as_str()]).await;
    assert_eq!(b.status, TaskStatus::Blocked);

    run(&board, &a.id).await;

    let b = board.get_task(&b.id).await.unwrap();
    assert_eq!(b.status, TaskStatus::Pending);
    assert!(b.claimed_by.is_none());
}

#[tokio::test]
async fn and_join_waits_for_every_dependency() {
    let (board, group) = setup().await;
    let a = task(&board, &group, "a", &[]).await;
    let b = task(&board, &group, "b", &[]).await;
    let c = task(&board, &group, "c", &[a.id.as_str(), b.id.as_str()]).await;

    run(&board, &a.id).await;
    assert_eq!(board.get_task(&c.id).await.unwrap().status, TaskStatus::Blocked);

    run(&board, &b.id).await;
    assert_eq!(board.get_task(&c.id).await.unwrap().status, TaskStatus::Pending);
}

#[tokio::test]
async fn failure_cascades_to_every_transitive_dependent() {
    let (board, group) = setup().await;
    let a = task(&board, &group, "a", &[]).await;
    let b = task(&board, &group, "b", &[a.id.as_str()]).await;
    let c = task(&board, &group, "c", &[b.id.as_str()]).await;
    let d = task(&board, &group, "d", &[a.id.as_str(), c.id.as_str()]).await;
    let unrelated = task(&board, &group, "e", &[]).await;

    board.claim_task("coder", "coder-1").await.unwrap().unwrap();
    let failed = board
        .fail_task(&a.id, Some("compiler exploded".into()))
        .await
        .unwrap();
    assert_eq!(failed.error.as_deref(), Some("compiler exploded"));

    for id in [&b.id, &c.id, &d.id] {
        let t = board.get_task(id).await.unwrap();
        assert_eq!(t.status, TaskStatus::Failed, "{id}");
        assert_eq!(t.error.as_deref(), Some("dependency CD-001 failed"));
        assert!(t.claimed_by.is_none());
        assert!(t.is_cascaded_failure());
    }
    assert_eq!(
        board.get_task(&unrelated.id).await.unwrap().status,
        TaskStatus::Pending
    );

    let failures = board
        .bus()
        .get_history(Some(EventFilter::Only(EventType::TaskFailed)));
    assert_eq!(failures.len(), 4);
}

#[tokio::test]
async fn direct_failure_of_unclaimed_task_is_not_a_cascade() {
    let (board, group) = setup().await;
    let a = task(&board, &group, "a", &[]).await;
    let b = task(&board, &group, "b", &[a.id.as_str()]).await;

    // Failed by hand while still pending: no claimant, but it is the root.
    let failed = board.fail_task(&a.id, Some("cancelled".into())).await.unwrap();
    assert!(failed.claimed_by.is_none());
    assert!(!failed.is_cascaded_failure());
    assert_eq!(failed.cascaded_from(), None);

    let dependent = board.get_task(&b.id).await.unwrap();
    assert_eq!(dependent.cascaded_from(), Some(a.id.as_str()));
}

#[tokio::test]
async fn rejection_does_not_cascade() {
    let (board, group) = setup().await;
    let a = task(&board, &group, "a", &[]).await;
    let b = task(&board, &group, "b", &[a.id.as_str()]).await;

    board.claim_task("coder", "coder-1").await.unwrap().unwrap();
    board.reject_task(&a.id, "wrong approach").await.unwrap();

    assert_eq!(board.get_task(&b.id).await.unwrap().status, TaskStatus::Blocked);
    let stuck = board.list_stuck_blocked().await.unwrap();
    assert_eq!(stuck.len(), 1);
    assert_eq!(stuck[0].id, b.id);

    let unblocked = board.unblock_task(&b.id).await.unwrap().unwrap();
    assert_eq!(unblocked.status, TaskStatus::Pending);
    assert!(board.list_stuck_blocked().await.unwrap().is_empty());
}

#[tokio::test]
async fn unblock_refuses_tasks_with_live_dependencies() {
    let (board, group) = setup().await;
    let a = task(&board, &group, "a", &[]).await;
    let b = task(&board, &group, "b", &[a.id.as_str()]).await;
    assert!(board.unblock_task(&b.id).await.unwrap().is_none());
}

#[tokio::test]
async fn cycle_is_rejected_and_graph_unchanged() {
    let (board, group) = setup().await;
    let a = task(&board, &group, "a", &[]).await;
    let b = task(&board, &group, "b", &[a.id.as_str()]).await;
    let c = task(&board, &group, "c", &[b.id.as_str()]).await;

    assert!(board.has_cycle(&a.id, &c.id).await.unwrap());
    assert!(!board.has_cycle(&c.id, &a.id).await.unwrap());

    let err = board.add_dependency(&a.id, &c.id).await.unwrap_err();
    assert!(matches!(err, BoardError::CycleDetected { .. }));

    assert!(board.dependencies_of(&a.id).await.unwrap().is_empty());
    assert_eq!(board.get_task(&a.id).await.unwrap().status, TaskStatus::Pending);
}

#[tokio::test]
async fn self_dependency_is_rejected() {
    let (board, group) = setup().await;
    let a = task(&board, &group, "a", &[]).await;
    let err = board.add_dependency(&a.id, &a.id).await.unwrap_err();
    assert!(matches!(err, BoardError::SelfDependency(_)));
}

#[tokio::test]
async fn adding_a_dependency_reblocks_a_pending_task() {
    let (board, group) = setup().await;
    let a = task(&board, &group, "a", &[]).await;
    let b = task(&board, &group, "b", &[]).await;

    let b = board.add_dependency(&b.id, &a.id).await.unwrap();
    assert_eq!(b.status, TaskStatus::Blocked);

    run(&board, &a.id).await;
    assert_eq!(board.get_task(&b.id).await.unwrap().status, TaskStatus::Pending);
}

// ---------------------------------------------------------------------------
// Terminal states
// ---------------------------------------------------------------------------

#[tokio::test]
async fn terminal_tasks_are_never_reclaimed_or_mutated() {
    let (board, group) = setup().await;
    let a = task(&board, &group, "a", &[]).await;
    run(&board, &a.id).await;

    assert!(board.claim_task("coder", "coder-2").await.unwrap().is_none());
    assert!(matches!(
        board.fail_task(&a.id, None).await.unwrap_err(),
        BoardError::InvalidTransition { .. }
    ));
    assert!(matches!(
        board.reject_task(&a.id, "late").await.unwrap_err(),
        BoardError::InvalidTransition { .. }
    ));
    assert!(matches!(
        board.complete_task(&a.id).await.unwrap_err(),
        BoardError::InvalidTransition { .. }
    ));
    assert!(board.reset_task(&a.id).await.unwrap().is_none());

    let a = board.get_task(&a.id).await.unwrap();
    assert_eq!(a.status, TaskStatus::Completed);
    assert_eq!(a.claimed_by.as_deref(), Some("coder-1"));
}

#[tokio::test]
async fn completion_requires_in_progress() {
    let (board, group) = setup().await;
    let a = task(&board, &group, "a", &[]).await;
    let err = board.complete_task(&a.id).await.unwrap_err();
    assert!(matches!(
        err,
        BoardError::InvalidTransition {
            from: TaskStatus::Pending,
            to: TaskStatus::Completed,
            ..
        }
    ));
}

#[tokio::test]
async fn rejection_keeps_an_audit_trail() {
    let (board, group) = setup().await;
    let implementation = task(&board, &group, "add parser", &[]).await;
    assert_eq!(implementation.id, "CD-001");
    run(&board, "CD-001").await;

    let review = board
        .create_task(
            NewTask::new(&group.id, "Review CD-001", "code_review", "reviewer", "coder-1")
                .parent("CD-001"),
        )
        .await
        .unwrap();
    assert_eq!(review.id, "RV-001");

    board.claim_task("reviewer", "reviewer-1").await.unwrap().unwrap();
    let rejected = board
        .reject_task("RV-001", "missing error handling")
        .await
        .unwrap();
    assert_eq!(rejected.status, TaskStatus::Rejected);
    assert_eq!(
        rejected.rejection_reason.as_deref(),
        Some("missing error handling")
    );

    let revision = board
        .create_task(
            NewTask::new(&group.id, "Revise add parser", "implementation", "coder", "reviewer-1")
                .parent("RV-001")
                .revision_of("CD-001"),
        )
        .await
        .unwrap();
    assert_eq!(revision.id, "CD-002");
    assert_eq!(revision.status, TaskStatus::Pending);
    assert_eq!(revision.revision_of.as_deref(), Some("CD-001"));

    // A revision reopens the group the rejection had settled.
    assert_eq!(
        board.get_group(&group.id).await.unwrap().status,
        GroupStatus::Active
    );

    assert!(board.claim_task("reviewer", "reviewer-1").await.unwrap().is_none());
    let review = board.get_task("RV-001").await.unwrap();
    assert_eq!(review, rejected);
}

// ---------------------------------------------------------------------------
// Groups
// ---------------------------------------------------------------------------

#[tokio::test]
async fn group_completes_exactly_when_all_tasks_are_terminal() {
    let (board, group) = setup().await;
    let a = task(&board, &group, "a", &[]).await;
    let b = task(&board, &group, "b", &[]).await;

    run(&board, &a.id).await;
    let g = board.get_group(&group.id).await.unwrap();
    assert_eq!(g.status, GroupStatus::Active);
    assert!(g.completed_at.is_none());

    board.claim_task("coder", "coder-1").await.unwrap().unwrap();
    board.fail_task(&b.id, Some("boom".into())).await.unwrap();

    let g = board.get_group(&group.id).await.unwrap();
    assert_eq!(g.status, GroupStatus::Completed);
    assert!(g.completed_at.is_some());

    let completions = board
        .store()
        .list_events(Some(EventType::GroupCompleted), 10)
        .await
        .unwrap();
    assert_eq!(completions.len(), 1);
}

#[tokio::test]
async fn list_groups_returns_oldest_first() {
    let (board, first) = setup().await;
    let second = board.create_group("second", "planner", "cli").await.unwrap();
    let ids: Vec<String> = board
        .list_groups()
        .await
        .unwrap()
        .into_iter()
        .map(|g| g.id)
        .collect();
    assert_eq!(ids, vec![first.id, second.id]);
}

// ---------------------------------------------------------------------------
// Recovery
// ---------------------------------------------------------------------------

#[tokio::test]
async fn reset_returns_an_orphan_to_the_queue() {
    let (board, group) = setup().await;
    let a = task(&board, &group, "a", &[]).await;
    board.claim_task("coder", "coder-1").await.unwrap().unwrap();

    let reset = board.reset_task(&a.id).await.unwrap().unwrap();
    assert_eq!(reset.status, TaskStatus::Pending);
    assert!(reset.claimed_by.is_none());
    assert!(reset.started_at.is_none());

    let reclaimed = board.claim_task("coder", "coder-2").await.unwrap().unwrap();
    assert_eq!(reclaimed.id, a.id);
    assert_eq!(reclaimed.claimed_by.as_deref(), Some("coder-2"));
}

#[tokio::test]
async fn release_only_works_for_the_current_claimant() {
    let (board, group) = setup().await;
    let a = task(&board, &group, "a", &[]).await;
    board.claim_task("coder", "coder-1").await.unwrap().unwrap();

    assert!(board.release_task(&a.id, "coder-2").await.unwrap().is_none());
    let released = board.release_task(&a.id, "coder-1").await.unwrap().unwrap();
    assert_eq!(released.status, TaskStatus::Pending);

    let recovered = board
        .bus()
        .get_history(Some(EventFilter::Only(EventType::TaskRecovered)));
    assert_eq!(recovered.len(), 1);
    assert_eq!(recovered[0].payload["reason"], "released");
}

// ---------------------------------------------------------------------------
// Views
// ---------------------------------------------------------------------------

#[tokio::test]
async fn board_buckets_by_status_with_filters() {
    let (board, group) = setup().await;
    let a = task(&board, &group, "a", &[]).await;
    task(&board, &group, "b", &[a.id.as_str()]).await;
    board
        .create_task(
            NewTask::new(&group.id, "urgent", "implementation", "coder", "cli")
                .priority(Priority::High),
        )
        .await
        .unwrap();
    board
        .create_task(NewTask::new(&group.id, "review", "code_review", "reviewer", "cli"))
        .await
        .unwrap();

    let view = board.get_board(BoardFilter::default()).await.unwrap();
    assert_eq!(view.len(), TaskStatus::ALL.len());
    assert_eq!(view[&TaskStatus::Pending].len(), 3);
    assert_eq!(view[&TaskStatus::Pending][0].title, "urgent");
    assert_eq!(view[&TaskStatus::Blocked].len(), 1);

    let coder_only = board
        .get_board(BoardFilter::default().assigned_to("coder"))
        .await
        .unwrap();
    assert_eq!(coder_only[&TaskStatus::Pending].len(), 2);

    let high = board
        .get_board(BoardFilter {
            priority: Some(Priority::High),
            ..BoardFilter::default()
        })
        .await
        .unwrap();
    assert_eq!(high[&TaskStatus::Pending].len(), 1);
}

#[tokio::test]
async fn counts_track_the_backlog() {
    let (board, group) = setup().await;
    let a = task(&board, &group, "a", &[]).await;
    task(&board, &group, "b", &[]).await;
    task(&board, &group, "c", &[a.id.as_str()]).await;

    assert_eq!(board.pending_count("coder").await.unwrap(), 2);
    assert_eq!(board.pending_count("reviewer").await.unwrap(), 0);

    board.claim_task("coder", "coder-1").await.unwrap().unwrap();
    let counts = board.status_counts().await.unwrap();
    assert_eq!(counts[&TaskStatus::Pending], 1);
    assert_eq!(counts[&TaskStatus::InProgress], 1);
    assert_eq!(counts[&TaskStatus::Blocked], 1);
    assert_eq!(counts[&TaskStatus::Completed], 0);
}
