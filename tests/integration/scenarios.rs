//! End-to-end tree scenarios against a real repository.

use arbor::orchestration::{MergeResult, SpawnOutcome, Usage};
use arbor::tree::{CoordinationKind, Cost, MergeStatus, NodeStatus, Phase, Specialization, TreeEvent};

use crate::fixtures::TreeHarness;

/// Root in SUMMON admits a backend child, queues a frontend request while
/// it runs, merges the backend branch on completion and then admits the
/// frontend child second.
#[tokio::test]
async fn test_sequential_children_with_merge_back() {
    let h = TreeHarness::new();
    let root = h.root_in_summon().await;
    assert!(h.repo.branch_exists(&root.branch_name));

    let a = h.spawn_now(root.id, Specialization::Backend).await;
    assert_eq!(a.execution_order, 1);
    assert_eq!(a.tree_depth, 1);
    assert_eq!(a.parent_branch_name.as_deref(), Some(root.branch_name.as_str()));
    assert_eq!(h.repo.tip(&a.branch_name), h.repo.tip(&root.branch_name));

    let queued = h.spawn(root.id, Specialization::Frontend).await;
    assert!(matches!(queued, SpawnOutcome::Queued { position: 1, .. }));
    assert_eq!(h.node(root.id).active_child_count, 1);

    h.repo.commit_on(&a.branch_name, "api.rs", "fn api() {}\n");
    let done = h.finish_child(a.id).await;
    assert!(matches!(done.merge, Some(MergeResult::Merged { .. })));
    assert_eq!(h.repo.show(&root.branch_name, "api.rs").as_deref(), Some("fn api() {}\n"));

    let b = done.next_spawned.expect("queued frontend should be admitted");
    assert_eq!(b.specialization, Specialization::Frontend);
    assert_eq!(b.execution_order, 2);
    assert_eq!(b.tree_depth, 1);
    assert_eq!(b.parent_branch_name.as_deref(), Some(root.branch_name.as_str()));
    // B starts from the merged parent
    assert_eq!(h.repo.show(&b.branch_name, "api.rs").as_deref(), Some("fn api() {}\n"));

    let root_now = h.node(root.id);
    assert_eq!(root_now.active_child_count, 1);
    assert_eq!(root_now.completed_child_count, 1);
    assert_eq!(h.node(a.id).merge_status, Some(MergeStatus::Merged));
    h.orchestrator.verify_tree(root.id).await.unwrap();
}

#[tokio::test]
async fn test_cost_rollup_scenario() {
    let h = TreeHarness::new();
    let root = h.root_in_summon().await;
    let a = h.spawn_now(root.id, Specialization::Backend).await;
    h.advance(a.id, &[Phase::Plan, Phase::Summon], 1).await;
    let grandchild = h.spawn_now(a.id, Specialization::Database).await;
    assert_eq!(grandchild.tree_depth, 2);

    h.orchestrator
        .record_usage(a.id, Usage::new(1000, "0.05".parse().unwrap()), 10)
        .await
        .unwrap();
    h.orchestrator
        .record_usage(grandchild.id, Usage::new(500, "0.02".parse().unwrap()), 1)
        .await
        .unwrap();

    let expected: Cost = "0.07".parse().unwrap();
    assert_eq!(h.orchestrator.costs().get_subtree_cost(root.id).unwrap(), expected);
    assert_eq!(h.node(a.id).cost_subtree, expected);
    assert_eq!(h.node(root.id).tokens_subtree, 1500);
    assert_eq!(h.node(root.id).cost_local, Cost::ZERO);
    h.orchestrator.verify_tree(root.id).await.unwrap();
}

#[tokio::test]
async fn test_whole_tree_to_completion() {
    let h = TreeHarness::new();
    let root = h.root_in_summon().await;

    for (i, spec) in [Specialization::Backend, Specialization::Frontend, Specialization::Testing]
        .into_iter()
        .enumerate()
    {
        let child = h.spawn_now(root.id, spec).await;
        assert_eq!(child.execution_order, i as u32 + 1);
        h.repo
            .commit_on(&child.branch_name, &format!("{}.txt", spec), &format!("{}\n", spec));
        let done = h.finish_child(child.id).await;
        assert!(done.merge.unwrap().is_merged());
    }

    h.advance(root.id, &[Phase::Complete], 10).await;
    let done = h
        .orchestrator
        .complete(root.id, arbor::tree::CompletionReport::new("all merged"), 11)
        .await
        .unwrap()
        .applied()
        .unwrap();
    assert!(done.merge.is_none());
    assert_eq!(done.node.status, NodeStatus::Completed);
    for spec in ["backend", "frontend", "testing"] {
        assert!(h.repo.show(&root.branch_name, &format!("{}.txt", spec)).is_some());
    }
    assert_eq!(h.node(root.id).completed_child_count, 3);
}

#[tokio::test]
async fn test_sink_receives_transitions_and_events() {
    let h = TreeHarness::new();
    let root = h.root_in_summon().await;
    h.spawn_now(root.id, Specialization::Backend).await;

    let events = h.drain_events();
    let transitions = events
        .iter()
        .filter(|e| matches!(e, TreeEvent::Phase(_)))
        .count();
    assert_eq!(transitions, 3);
    assert!(events.iter().any(|e| matches!(
        e,
        TreeEvent::Coordination(c) if c.kind == CoordinationKind::NodeSpawned && c.node_id != root.id
    )));
}

#[tokio::test]
async fn test_depth_ceiling_enforced() {
    let h = TreeHarness::new();
    let root = h
        .orchestrator
        .spawn_root("shallow", "user-1", "main", Specialization::General, Some(1))
        .await
        .unwrap();
    h.advance(root.id, &[Phase::Plan, Phase::Found, Phase::Summon], 1).await;
    let child = h.spawn_now(root.id, Specialization::Backend).await;
    h.advance(child.id, &[Phase::Plan, Phase::Summon], 1).await;

    let err = h
        .orchestrator
        .spawn_child(child.id, Specialization::Database, "too deep")
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        arbor::Error::Admission(arbor::AdmissionError::DepthExceeded { depth: 2, max: 1 })
    ));
}
