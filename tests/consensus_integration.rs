//! End-to-end consensus behavior over the in-process mesh: elections,
//! leader failover, partitions, membership changes, and leadership
//! transfer.

mod common;

use common::TestCluster;
use meshfabric::error::FabricError;
use meshfabric::types::Endpoint;
use std::time::Duration;
use tokio::time::sleep;

const ELECTION_WAIT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn three_node_cluster_elects_single_leader() {
    let cluster = TestCluster::start(&[1, 2, 3], &[]).await;

    let leader = cluster.wait_for_leader(ELECTION_WAIT).await;
    assert!([1, 2, 3].contains(&leader));

    // Everyone agrees on who leads.
    sleep(Duration::from_millis(200)).await;
    for id in [1, 2, 3] {
        let known = cluster.handle(id).leader().await.unwrap();
        assert_eq!(known, Some(leader), "node {id} disagrees on the leader");
    }

    cluster.shutdown().await;
}

#[tokio::test]
async fn proposals_replicate_and_commit() {
    let cluster = TestCluster::start(&[1, 2, 3], &[]).await;
    let leader = cluster.wait_for_leader(ELECTION_WAIT).await;

    let index = cluster
        .handle(leader)
        .propose(b"payload-1".to_vec())
        .await
        .unwrap();
    assert!(index > 0);

    // Commit index reaches the proposal on the leader.
    sleep(Duration::from_millis(300)).await;
    let (_, commit) = cluster.handle(leader).status().await.unwrap();
    assert!(commit >= index);

    cluster.shutdown().await;
}

#[tokio::test]
async fn follower_rejects_proposals_with_leader_hint() {
    let cluster = TestCluster::start(&[1, 2, 3], &[]).await;
    let leader = cluster.wait_for_leader(ELECTION_WAIT).await;
    sleep(Duration::from_millis(200)).await;

    let follower = [1, 2, 3].into_iter().find(|&id| id != leader).unwrap();
    let err = cluster
        .handle(follower)
        .propose(b"misdirected".to_vec())
        .await
        .unwrap_err();

    match err {
        FabricError::NotLeader { leader: hint } => assert_eq!(hint, Some(leader)),
        other => panic!("expected NotLeader, got {other:?}"),
    }

    cluster.shutdown().await;
}

#[tokio::test]
async fn leader_crash_triggers_failover() {
    let cluster = TestCluster::start(&[1, 2, 3, 4, 5], &[]).await;
    let old_leader = cluster.wait_for_leader(ELECTION_WAIT).await;

    cluster.mesh.kill(old_leader);

    let survivors: Vec<_> = [1, 2, 3, 4, 5]
        .into_iter()
        .filter(|&id| id != old_leader)
        .collect();
    let new_leader = cluster
        .wait_for_leader_among(&survivors, ELECTION_WAIT)
        .await;
    assert_ne!(new_leader, old_leader);

    // The new leader accepts configuration changes.
    cluster
        .handle(new_leader)
        .add_node(9, "agent-9".to_string(), vec![Endpoint::tcp("10.0.0.9", 9000)])
        .await
        .unwrap();
    for &id in &survivors {
        cluster
            .wait_for_membership(id, 9, true, Duration::from_secs(3))
            .await;
    }

    // The revived node rejoins as a follower of the new regime.
    cluster.mesh.revive(old_leader);
    sleep(Duration::from_secs(1)).await;
    assert!(!cluster.handle(old_leader).is_leader().await.unwrap());

    cluster.shutdown().await;
}

#[tokio::test]
async fn minority_leader_stops_accepting_proposals() {
    let cluster = TestCluster::start(&[1, 2, 3, 4, 5], &[]).await;
    let leader = cluster.wait_for_leader(ELECTION_WAIT).await;

    // Strand the leader with one peer; the other three form a majority.
    let mut others: Vec<_> = [1, 2, 3, 4, 5]
        .into_iter()
        .filter(|&id| id != leader)
        .collect();
    let minority_peer = others.pop().unwrap();
    cluster
        .mesh
        .partition(vec![vec![leader, minority_peer], others.clone()]);

    // Majority side elects a fresh leader.
    let new_leader = cluster.wait_for_leader_among(&others, ELECTION_WAIT).await;

    // Give the stranded leader a few heartbeat rounds to notice it lost
    // its quorum, then confirm it refuses work.
    sleep(Duration::from_millis(500)).await;
    let err = cluster
        .handle(leader)
        .propose(b"split-brain-attempt".to_vec())
        .await
        .unwrap_err();
    assert!(
        matches!(err, FabricError::Partitioned | FabricError::NotLeader { .. }),
        "stranded leader accepted a proposal: {err:?}"
    );

    // After healing, the cluster converges on one leader again.
    cluster.mesh.heal();
    sleep(Duration::from_secs(1)).await;
    let final_leader = cluster.wait_for_leader(ELECTION_WAIT).await;
    cluster
        .handle(final_leader)
        .propose(b"after-heal".to_vec())
        .await
        .unwrap();
    let _ = new_leader;

    cluster.shutdown().await;
}

#[tokio::test]
async fn membership_add_commits_on_all_nodes() {
    let cluster = TestCluster::start(&[1, 2, 3], &[]).await;
    let leader = cluster.wait_for_leader(ELECTION_WAIT).await;

    cluster
        .handle(leader)
        .add_node(9, "agent-9".to_string(), vec![Endpoint::tcp("10.0.0.9", 9000)])
        .await
        .unwrap();

    for id in [1, 2, 3] {
        cluster
            .wait_for_membership(id, 9, true, Duration::from_secs(3))
            .await;
    }

    cluster
        .handle(leader)
        .remove_node(9)
        .await
        .unwrap();
    for id in [1, 2, 3] {
        cluster
            .wait_for_membership(id, 9, false, Duration::from_secs(3))
            .await;
    }

    cluster.shutdown().await;
}

#[tokio::test]
async fn learner_replicates_then_promotes() {
    let cluster = TestCluster::start(&[1, 2, 3], &[4]).await;
    let leader = cluster.wait_for_leader(ELECTION_WAIT).await;

    cluster
        .handle(leader)
        .add_learner(4, "learner-4".to_string(), vec![])
        .await
        .unwrap();

    // The learner's own registry sees the committed change once the
    // leader starts replicating to it.
    cluster
        .wait_for_membership(4, 4, true, Duration::from_secs(3))
        .await;
    let record = cluster.registries[&4].get(4).unwrap();
    assert!(!record.is_voting());

    // Feed some traffic so the learner has real entries to catch up on.
    for i in 0..5 {
        cluster
            .handle(leader)
            .propose(format!("entry-{i}").into_bytes())
            .await
            .unwrap();
    }
    sleep(Duration::from_millis(500)).await;

    cluster.handle(leader).promote_learner(4).await.unwrap();

    // Promotion commits everywhere and flips the voting flag.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    loop {
        let voting = cluster.registries[&leader]
            .get(4)
            .map(|n| n.is_voting())
            .unwrap_or(false);
        if voting {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "learner 4 never became a voter"
        );
        sleep(Duration::from_millis(25)).await;
    }

    cluster.shutdown().await;
}

#[tokio::test]
async fn leadership_transfer_moves_leader() {
    let cluster = TestCluster::start(&[1, 2, 3], &[]).await;
    let leader = cluster.wait_for_leader(ELECTION_WAIT).await;
    sleep(Duration::from_millis(200)).await;

    let target = [1, 2, 3].into_iter().find(|&id| id != leader).unwrap();
    cluster
        .handle(leader)
        .transfer_leadership(target)
        .await
        .unwrap();

    let deadline = tokio::time::Instant::now() + ELECTION_WAIT;
    loop {
        if cluster.handle(target).is_leader().await.unwrap() {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "target {target} never took over leadership"
        );
        sleep(Duration::from_millis(25)).await;
    }

    cluster.shutdown().await;
}

#[tokio::test]
async fn read_index_served_by_leader_only() {
    let cluster = TestCluster::start(&[1, 2, 3], &[]).await;
    let leader = cluster.wait_for_leader(ELECTION_WAIT).await;
    sleep(Duration::from_millis(200)).await;

    let index = cluster.handle(leader).read_index().await.unwrap();
    let (_, commit) = cluster.handle(leader).status().await.unwrap();
    assert!(index <= commit);

    let follower = [1, 2, 3].into_iter().find(|&id| id != leader).unwrap();
    let err = cluster.handle(follower).read_index().await.unwrap_err();
    assert!(matches!(err, FabricError::NotLeader { .. }));

    cluster.shutdown().await;
}
