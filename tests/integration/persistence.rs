//! Trees survive a restart of the orchestrator over the snapshot store.

use std::sync::Arc;

use tempfile::TempDir;

use arbor::orchestration::{check_tree, Orchestrator, SpawnOutcome, Usage};
use arbor::store::{JsonFileStore, NodeStore};
use arbor::tree::{CompletionReport, CoordinationKind, Cost, MergeStatus, NodeStatus, Phase, Specialization};

use crate::fixtures::{report_for, TestRepo};

fn open(repo: &TestRepo, store: Arc<JsonFileStore>) -> Orchestrator {
    Orchestrator::builder()
        .store(store)
        .vcs(Arc::new(repo.git_ops().unwrap()))
        .build()
        .unwrap()
}

async fn advance(orchestrator: &Orchestrator, store: &JsonFileStore, node: arbor::NodeId, phases: &[Phase]) {
    for (i, to) in phases.iter().enumerate() {
        let from = store.read_node(node).unwrap().phase;
        orchestrator
            .advance(node, *to, report_for(from), i as u64 + 1)
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn test_tree_resumes_after_reopen() {
    let repo = TestRepo::new();
    let state_dir = TempDir::new().unwrap();
    let path = state_dir.path().join("state.json");

    let (root, first) = {
        let store = Arc::new(JsonFileStore::open(&path).unwrap());
        let orchestrator = open(&repo, store.clone());
        let root = orchestrator
            .spawn_root("persisted", "user-1", "main", Specialization::General, None)
            .await
            .unwrap();
        advance(&orchestrator, &store, root.id, &[Phase::Plan, Phase::Found, Phase::Summon]).await;

        let first = orchestrator
            .spawn_child(root.id, Specialization::Backend, "api")
            .await
            .unwrap()
            .spawned()
            .unwrap();
        repo.commit_on(&first.branch_name, "api.rs", "fn api() {}\n");
        advance(&orchestrator, &store, first.id, &[Phase::Plan, Phase::Summon, Phase::Complete]).await;
        orchestrator
            .record_usage(first.id, Usage::new(250, "0.03".parse().unwrap()), 50)
            .await
            .unwrap();
        orchestrator
            .complete(first.id, CompletionReport::new("api done"), 100)
            .await
            .unwrap();
        (root, first)
    };

    let store = Arc::new(JsonFileStore::open(&path).unwrap());
    assert!(check_tree(store.as_ref(), root.id).unwrap().is_empty());

    let restored = store.read_node(first.id).unwrap();
    assert_eq!(restored.merge_status, Some(MergeStatus::Merged));
    assert_eq!(restored.completion_result.as_ref().unwrap().summary, "api done");
    assert_eq!(store.phase_transitions(first.id).unwrap().len(), 3);
    assert!(store
        .coordination_events(first.id)
        .unwrap()
        .iter()
        .any(|e| e.kind == CoordinationKind::NodeCompleted));
    let restored_root = store.read_node(root.id).unwrap();
    assert_eq!(restored_root.cost_subtree, "0.03".parse::<Cost>().unwrap());
    assert_eq!(restored_root.completed_child_count, 1);

    // a fresh orchestrator carries on from the persisted counters
    let orchestrator = open(&repo, store.clone());
    let second = orchestrator
        .spawn_child(root.id, Specialization::Frontend, "ui")
        .await
        .unwrap()
        .spawned()
        .unwrap();
    assert_eq!(second.execution_order, 2);
    assert_eq!(repo.show(&second.branch_name, "api.rs").as_deref(), Some("fn api() {}\n"));

    // sequence numbers persist too: an old usage report is a duplicate
    let replay = orchestrator
        .record_usage(first.id, Usage::new(250, "0.03".parse().unwrap()), 50)
        .await
        .unwrap();
    assert!(replay.is_duplicate());
    orchestrator.verify_tree(root.id).await.unwrap();
}

#[tokio::test]
async fn test_queued_spawn_survives_reopen() {
    let repo = TestRepo::new();
    let state_dir = TempDir::new().unwrap();
    let path = state_dir.path().join("state.json");

    let (root, first, request_id) = {
        let store = Arc::new(JsonFileStore::open(&path).unwrap());
        let orchestrator = open(&repo, store.clone());
        let root = orchestrator
            .spawn_root("queued", "user-1", "main", Specialization::General, None)
            .await
            .unwrap();
        advance(&orchestrator, &store, root.id, &[Phase::Plan, Phase::Found, Phase::Summon]).await;
        let first = orchestrator
            .spawn_child(root.id, Specialization::Backend, "api")
            .await
            .unwrap()
            .spawned()
            .unwrap();
        let SpawnOutcome::Queued { request_id, position } = orchestrator
            .spawn_child(root.id, Specialization::Frontend, "ui")
            .await
            .unwrap()
        else {
            panic!("second spawn should wait for the first");
        };
        assert_eq!(position, 1);
        (root, first, request_id)
    };

    let store = Arc::new(JsonFileStore::open(&path).unwrap());
    let restored = store.read_node(root.id).unwrap();
    assert_eq!(restored.spawn_queue.len(), 1);
    assert_eq!(restored.spawn_queue[0].id, request_id);

    // a request made after the restart still lines up behind the old one
    let orchestrator = open(&repo, store.clone());
    let later = orchestrator
        .spawn_child(root.id, Specialization::Testing, "tests")
        .await
        .unwrap();
    assert!(matches!(later, SpawnOutcome::Queued { position: 2, .. }));

    repo.commit_on(&first.branch_name, "api.rs", "fn api() {}\n");
    advance(&orchestrator, &store, first.id, &[Phase::Plan, Phase::Summon, Phase::Complete]).await;
    let done = orchestrator
        .complete(first.id, CompletionReport::new("api done"), 100)
        .await
        .unwrap()
        .applied()
        .unwrap();
    let next = done.next_spawned.expect("queued request should be admitted");
    assert_eq!(next.specialization, Specialization::Frontend);
    assert_eq!(next.execution_order, 2);
    assert_eq!(store.read_node(root.id).unwrap().spawn_queue.len(), 1);
    orchestrator.verify_tree(root.id).await.unwrap();
}

#[tokio::test]
async fn test_fail_after_reopen_cancels_every_signal() {
    let repo = TestRepo::new();
    let state_dir = TempDir::new().unwrap();
    let path = state_dir.path().join("state.json");

    let (root, child) = {
        let store = Arc::new(JsonFileStore::open(&path).unwrap());
        let orchestrator = open(&repo, store.clone());
        let root = orchestrator
            .spawn_root("signals", "user-1", "main", Specialization::General, None)
            .await
            .unwrap();
        advance(&orchestrator, &store, root.id, &[Phase::Plan, Phase::Found, Phase::Summon]).await;
        let child = orchestrator
            .spawn_child(root.id, Specialization::Backend, "api")
            .await
            .unwrap()
            .spawned()
            .unwrap();
        advance(&orchestrator, &store, child.id, &[Phase::Plan, Phase::Summon]).await;
        (root, child)
    };

    let store = Arc::new(JsonFileStore::open(&path).unwrap());
    let orchestrator = open(&repo, store.clone());
    let child_token = orchestrator
        .cancellation_token(child.id)
        .expect("a running node has a signal after reopen");
    assert!(!child_token.is_cancelled());

    let grandchild = orchestrator
        .spawn_child(child.id, Specialization::Database, "schema")
        .await
        .unwrap()
        .spawned()
        .unwrap();
    let grandchild_token = orchestrator.cancellation_token(grandchild.id).unwrap();

    orchestrator.fail(root.id, "supervisor timeout", None).await.unwrap();
    assert!(child_token.is_cancelled());
    assert!(grandchild_token.is_cancelled());
    assert_eq!(store.read_node(grandchild.id).unwrap().status, NodeStatus::Cancelled);
    assert!(orchestrator.cancellation_token(child.id).is_none());
    assert!(orchestrator.context().signals().is_empty());
}

#[tokio::test]
async fn test_spawn_rolls_back_when_snapshot_write_fails() {
    let repo = TestRepo::new();
    let state_dir = TempDir::new().unwrap();
    let path = state_dir.path().join("state.json");
    let store = Arc::new(JsonFileStore::open(&path).unwrap());
    let orchestrator = open(&repo, store.clone());
    let root = orchestrator
        .spawn_root("disk", "user-1", "main", Specialization::General, None)
        .await
        .unwrap();
    advance(&orchestrator, &store, root.id, &[Phase::Plan, Phase::Found, Phase::Summon]).await;

    let temp_path = path.with_extension("json.tmp");
    std::fs::create_dir(&temp_path).unwrap();
    assert!(orchestrator
        .spawn_child(root.id, Specialization::Backend, "api")
        .await
        .is_err());
    assert!(store.children(root.id).unwrap().is_empty());
    assert_eq!(store.read_node(root.id).unwrap().active_child_count, 0);

    std::fs::remove_dir(&temp_path).unwrap();
    let child = orchestrator
        .spawn_child(root.id, Specialization::Backend, "api")
        .await
        .unwrap()
        .spawned()
        .unwrap();
    assert_eq!(child.execution_order, 1);
    orchestrator.verify_tree(root.id).await.unwrap();
}
