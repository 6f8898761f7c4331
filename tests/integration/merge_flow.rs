//! Merge-back against real git: conflicts, resolution and idempotence.

use std::path::Path;

use arbor::orchestration::{MergeResult, SpawnOutcome};
use arbor::store::NodeStore;
use arbor::tree::{CoordinationKind, MergeStatus, NodeId, NodeStatus, Specialization};

use crate::fixtures::TreeHarness;

fn count_events(h: &TreeHarness, node: NodeId, kind: CoordinationKind) -> usize {
    h.store
        .coordination_events(node)
        .unwrap()
        .iter()
        .filter(|e| e.kind == kind)
        .count()
}

#[tokio::test]
async fn test_conflict_blocks_queue_until_resolved() {
    let h = TreeHarness::new();
    let root = h.root_in_summon().await;
    let a = h.spawn_now(root.id, Specialization::Backend).await;

    // both branches add the same file with different content
    h.repo.commit_on(&root.branch_name, "config.toml", "port = 80\n");
    h.repo.commit_on(&a.branch_name, "config.toml", "port = 8080\n");
    let root_tip = h.repo.tip(&root.branch_name);

    let queued = h.spawn(root.id, Specialization::Frontend).await;
    assert!(matches!(queued, SpawnOutcome::Queued { position: 1, .. }));

    let done = h.finish_child(a.id).await;
    let Some(MergeResult::Conflict { files }) = done.merge else {
        panic!("expected a conflict, got {:?}", done.merge);
    };
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].path, Path::new("config.toml"));
    assert_eq!(files[0].ours, "port = 80\n");
    assert_eq!(files[0].theirs, "port = 8080\n");
    assert!(files[0].base.is_none());

    // parent branch untouched, queued sibling still parked
    assert_eq!(h.repo.tip(&root.branch_name), root_tip);
    assert!(done.next_spawned.is_none());
    assert_eq!(h.node(a.id).merge_status, Some(MergeStatus::Conflict));
    assert_eq!(h.node(root.id).active_child_count, 0);
    assert_eq!(h.store_children(root.id).len(), 1);
    assert_eq!(count_events(&h, a.id, CoordinationKind::MergeConflict), 1);

    // resolve on the child branch by merging the parent in, keeping ours
    h.repo.git(&["checkout", "-q", &a.branch_name]);
    h.repo
        .git(&["merge", "-q", "-X", "ours", "-m", "resolve config", &root.branch_name]);
    h.repo.git(&["checkout", "-q", "main"]);

    let retry = h.orchestrator.retry_merge(a.id).await.unwrap();
    assert!(retry.merge.is_merged());
    assert_eq!(h.repo.show(&root.branch_name, "config.toml").as_deref(), Some("port = 8080\n"));
    assert_eq!(h.node(a.id).merge_status, Some(MergeStatus::Merged));

    let b = retry.next_spawned.expect("queue should resume after the merge");
    assert_eq!(b.specialization, Specialization::Frontend);
    assert_eq!(b.execution_order, 2);
    assert_eq!(h.repo.show(&b.branch_name, "config.toml").as_deref(), Some("port = 8080\n"));
    h.orchestrator.verify_tree(root.id).await.unwrap();
}

#[tokio::test]
async fn test_retry_without_resolution_stays_in_conflict() {
    let h = TreeHarness::new();
    let root = h.root_in_summon().await;
    let a = h.spawn_now(root.id, Specialization::Backend).await;
    h.repo.commit_on(&root.branch_name, "lib.rs", "// parent\n");
    h.repo.commit_on(&a.branch_name, "lib.rs", "// child\n");

    h.finish_child(a.id).await;
    let retry = h.orchestrator.retry_merge(a.id).await.unwrap();
    assert!(matches!(retry.merge, MergeResult::Conflict { .. }));
    assert!(retry.next_spawned.is_none());
    assert_eq!(h.node(a.id).merge_status, Some(MergeStatus::Conflict));
    assert_eq!(count_events(&h, a.id, CoordinationKind::MergeConflict), 2);

    // the parent cannot admit another child while the conflict stands
    let queued = h.spawn(root.id, Specialization::Testing).await;
    assert!(matches!(queued, SpawnOutcome::Queued { .. }));
}

#[tokio::test]
async fn test_merge_is_idempotent() {
    let h = TreeHarness::new();
    let root = h.root_in_summon().await;
    let a = h.spawn_now(root.id, Specialization::Backend).await;
    h.repo.commit_on(&a.branch_name, "handler.rs", "fn handle() {}\n");

    let done = h.finish_child(a.id).await;
    let Some(MergeResult::Merged { commit }) = done.merge else {
        panic!("expected a merge, got {:?}", done.merge);
    };
    let tip = h.repo.tip(&root.branch_name);

    let again = h.orchestrator.retry_merge(a.id).await.unwrap();
    assert_eq!(again.merge, MergeResult::Merged { commit });
    assert_eq!(h.repo.tip(&root.branch_name), tip);
    assert_eq!(count_events(&h, a.id, CoordinationKind::Merged), 1);
}

#[tokio::test]
async fn test_failed_child_is_never_merged() {
    let h = TreeHarness::new();
    let root = h.root_in_summon().await;
    let a = h.spawn_now(root.id, Specialization::Backend).await;
    h.repo.commit_on(&a.branch_name, "broken.rs", "fn broken( {}\n");
    let root_tip = h.repo.tip(&root.branch_name);

    h.orchestrator.fail(a.id, "compile error", Some(1)).await.unwrap();
    assert_eq!(h.node(a.id).status, NodeStatus::Failed);
    assert_eq!(h.repo.tip(&root.branch_name), root_tip);
    assert!(h.orchestrator.retry_merge(a.id).await.is_err());
    assert_eq!(h.repo.tip(&root.branch_name), root_tip);
    assert!(h.repo.show(&root.branch_name, "broken.rs").is_none());
}
