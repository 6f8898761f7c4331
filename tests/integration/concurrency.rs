//! Tree invariants under concurrent callers.

use std::sync::Arc;

use futures::future::join_all;

use arbor::config::{Config, SiblingPolicy};
use arbor::orchestration::{SpawnOutcome, Usage};
use arbor::tree::{Cost, NodeStatus, Specialization};
use arbor::{AdmissionError, Error};

use crate::fixtures::TreeHarness;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_spawns_admit_exactly_one() {
    let config = Config {
        sibling_policy: SiblingPolicy::Reject,
        ..Config::default()
    };
    let h = TreeHarness::with_config(config);
    let root = h.root_in_summon().await;
    let root_id = root.id;

    let attempts = Specialization::ALL.iter().map(|spec| {
        let orchestrator = Arc::clone(&h.orchestrator);
        let spec = *spec;
        tokio::spawn(async move { orchestrator.spawn_child(root_id, spec, "race").await })
    });
    let results: Vec<_> = join_all(attempts).await.into_iter().map(|r| r.unwrap()).collect();

    let admitted = results.iter().filter(|r| matches!(r, Ok(SpawnOutcome::Spawned(_)))).count();
    assert_eq!(admitted, 1);
    for result in &results {
        if let Err(e) = result {
            assert!(
                matches!(e, Error::Admission(AdmissionError::SequentialViolation { .. })),
                "unexpected error {}",
                e
            );
        }
    }

    let children = h.store_children(root.id);
    assert_eq!(children.len(), 1);
    assert_eq!(children.iter().filter(|c| c.status == NodeStatus::Running).count(), 1);
    assert_eq!(h.node(root.id).active_child_count, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_spawns_queue_in_order() {
    let h = TreeHarness::new();
    let root = h.root_in_summon().await;

    let outcomes = join_all(
        (0..5).map(|_| h.orchestrator.spawn_child(root.id, Specialization::Backend, "queued")),
    )
    .await;
    let spawned = outcomes
        .iter()
        .filter(|o| matches!(o, Ok(SpawnOutcome::Spawned(_))))
        .count();
    let mut positions: Vec<usize> = outcomes
        .iter()
        .filter_map(|o| match o {
            Ok(SpawnOutcome::Queued { position, .. }) => Some(*position),
            _ => None,
        })
        .collect();
    positions.sort_unstable();
    assert_eq!(spawned, 1);
    assert_eq!(positions, vec![1, 2, 3, 4]);

    // each completion admits exactly the next one
    let mut order = 1;
    let mut current = h.store_children(root.id).remove(0);
    loop {
        assert_eq!(current.execution_order, order);
        let done = h.finish_child(current.id).await;
        match done.next_spawned {
            Some(next) => {
                current = next;
                order += 1;
            }
            None => break,
        }
    }
    assert_eq!(order, 5);
    h.orchestrator.verify_tree(root.id).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_usage_keeps_rollup_exact() {
    let h = TreeHarness::new();
    let root = h.root_in_summon().await;
    let child = h.spawn_now(root.id, Specialization::Backend).await;
    h.advance(child.id, &[arbor::Phase::Plan, arbor::Phase::Summon], 1).await;
    let grandchild = h.spawn_now(child.id, Specialization::Database).await;

    let targets = [root.id, child.id, grandchild.id];
    let tasks = (0..60u64).map(|i| {
        let orchestrator = Arc::clone(&h.orchestrator);
        let node = targets[(i % 3) as usize];
        let seq = 100 + i;
        tokio::spawn(async move {
            orchestrator
                .record_usage(node, Usage::new(7, Cost::from_micros(1_001)), seq)
                .await
        })
    });
    let results = join_all(tasks).await;
    let applied = results
        .into_iter()
        .map(|r| r.unwrap().unwrap())
        .filter(|d| !d.is_duplicate())
        .count() as u64;

    // racing tasks land in any order; every distinct seq still applies once
    assert_eq!(applied, 60);
    let root_now = h.node(root.id);
    assert_eq!(root_now.cost_subtree, Cost::from_micros(1_001 * 60));
    assert_eq!(root_now.tokens_subtree, 7 * 60);
    assert_eq!(h.node(grandchild.id).tokens_local, 7 * 20);
    h.orchestrator.verify_tree(root.id).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_independent_trees_progress_in_parallel() {
    let h = TreeHarness::new();
    let roots = join_all((0..4).map(|_| h.root_in_summon())).await;

    let spawns = roots.iter().map(|root| {
        let orchestrator = Arc::clone(&h.orchestrator);
        let id = root.id;
        tokio::spawn(async move { orchestrator.spawn_child(id, Specialization::Backend, "api").await })
    });
    for result in join_all(spawns).await {
        assert!(matches!(result.unwrap(), Ok(SpawnOutcome::Spawned(_))));
    }
    for root in &roots {
        assert_eq!(h.node(root.id).active_child_count, 1);
        h.orchestrator.verify_tree(root.id).await.unwrap();
    }
}
