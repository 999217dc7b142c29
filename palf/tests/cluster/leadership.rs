//! Elections, leader transfer and failover driven by the background loops.

use std::rc::Rc;
use std::time::Duration;

use palf::{NodeId, PalfConfig, PalfError, ProposalId, Role, Scn};

use crate::harness::{blocking, eventually, Cluster, LeaderRecorder, GROUP};

// ============================================================================
// Campaigns
// ============================================================================

#[tokio::test]
async fn test_campaign_without_majority_fails() {
    let cluster = Cluster::new(3);
    cluster.network.isolate(NodeId(2));
    cluster.network.isolate(NodeId(3));

    assert_eq!(cluster.handle(1).campaign().await, Err(PalfError::NotLeader));
    let (role, proposal_id, pending) = cluster.handle(1).get_role().expect("role");
    assert_eq!(role, Role::Follower);
    assert_eq!(proposal_id, ProposalId::new(1));
    assert!(!pending);

    cluster.network.heal();
    cluster.elect(1).await;
    let (_, proposal_id, _) = cluster.handle(1).get_role().expect("role");
    assert_eq!(proposal_id, ProposalId::new(2));
}

#[tokio::test]
async fn test_higher_proposal_replaces_leader() {
    let cluster = Cluster::new(3);
    cluster.elect(1).await;
    cluster.append(1, b"a").await;

    cluster.elect(2).await;
    let result = cluster
        .handle(1)
        .append(blocking(), b"x".to_vec(), Scn::MIN)
        .await;
    assert_eq!(result, Err(PalfError::NotLeader));

    cluster.append(2, b"b").await;
    assert_eq!(cluster.handle(1).get_leader().expect("leader"), Some(NodeId(2)));
    assert_eq!(
        cluster.committed_payloads(2),
        vec![b"a".to_vec(), b"b".to_vec()]
    );
}

#[tokio::test]
async fn test_campaign_pulls_fresher_log() {
    let cluster = Cluster::new(3);
    cluster.elect(1).await;
    cluster.append(1, b"a").await;

    // Node 3 misses the next entries; node 1 and 2 commit them.
    cluster.network.isolate(NodeId(3));
    cluster.append(1, b"b").await;
    cluster.append(1, b"c").await;

    // Node 3 wins against node 1 but must not lose what node 2 holds.
    cluster.network.heal();
    cluster.network.isolate(NodeId(1));
    cluster.elect(3).await;
    cluster.append(3, b"d").await;
    assert_eq!(
        cluster.committed_payloads(3),
        vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec(), b"d".to_vec()]
    );
}

#[tokio::test]
async fn test_non_member_cannot_campaign() {
    let cluster = Cluster::with_members(2, &[1], PalfConfig::for_testing());
    assert!(matches!(
        cluster.handle(2).campaign().await,
        Err(PalfError::InvalidArgument(_))
    ));
}

// ============================================================================
// Leader transfer
// ============================================================================

#[tokio::test]
async fn test_change_leader_to() {
    let cluster = Cluster::new(3);
    cluster.elect(1).await;
    cluster.append(1, b"a").await;

    assert_eq!(
        cluster.handle(1).change_leader_to(NodeId(1)).await,
        Ok(()),
        "transfer to self is a no-op"
    );
    assert!(matches!(
        cluster.handle(1).change_leader_to(NodeId(9)).await,
        Err(PalfError::InvalidArgument(_))
    ));
    assert_eq!(
        cluster.handle(2).change_leader_to(NodeId(3)).await,
        Err(PalfError::NotMaster)
    );

    cluster
        .handle(1)
        .change_leader_to(NodeId(2))
        .await
        .expect("transfer");
    let (role, proposal_id, pending) = cluster.handle(2).get_role().expect("role");
    assert_eq!(role, Role::Leader);
    assert_eq!(proposal_id, ProposalId::new(2));
    assert!(!pending);
    assert_eq!(cluster.handle(1).get_role().expect("role").0, Role::Follower);

    cluster.append(2, b"b").await;
    assert_eq!(
        cluster.committed_payloads(2),
        vec![b"a".to_vec(), b"b".to_vec()]
    );
}

#[tokio::test]
async fn test_change_leader_to_unreachable_target_times_out() {
    let cluster = Cluster::new(3);
    cluster.elect(1).await;
    cluster.append(1, b"a").await;

    cluster.network.isolate(NodeId(3));
    cluster.append(1, b"b").await;
    assert_eq!(
        cluster.handle(1).change_leader_to(NodeId(3)).await,
        Err(PalfError::Timeout)
    );

    // The leader serves again after a failed transfer.
    cluster.append(1, b"c").await;
}

// ============================================================================
// Location cache
// ============================================================================

#[tokio::test]
async fn test_location_cache_learns_leader() {
    let cluster = Cluster::new(3);
    let on_leader = Rc::new(LeaderRecorder::default());
    let on_follower = Rc::new(LeaderRecorder::default());
    cluster
        .handle(1)
        .set_location_cache_cb(on_leader.clone())
        .expect("cb");
    cluster
        .handle(2)
        .set_location_cache_cb(on_follower.clone())
        .expect("cb");

    cluster.elect(1).await;
    assert!(on_leader
        .events
        .borrow()
        .contains(&(GROUP, Some(NodeId(1)))));
    assert!(on_follower
        .events
        .borrow()
        .contains(&(GROUP, Some(NodeId(1)))));

    cluster.handle(2).reset_location_cache_cb().expect("reset");
    let seen = on_follower.events.borrow().len();
    cluster.elect(3).await;
    assert_eq!(on_follower.events.borrow().len(), seen);
    assert_eq!(on_leader.events.borrow().last(), Some(&(GROUP, Some(NodeId(3)))));
}

// ============================================================================
// Background loops
// ============================================================================

#[tokio::test]
async fn test_background_election_and_failover() {
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let config = PalfConfig {
                background_workers: true,
                ..PalfConfig::for_testing()
            };
            let cluster = Cluster::with_members(3, &[1, 2, 3], config);

            assert!(
                eventually(Duration::from_secs(5), || cluster.leader().is_some()).await,
                "a leader emerges without manual campaigns"
            );
            let first = cluster.leader().expect("leader");
            cluster.append(first, b"a").await;

            cluster.network.isolate(NodeId(first));
            assert!(
                eventually(Duration::from_secs(5), || {
                    matches!(cluster.leader(), Some(leader) if leader != first)
                })
                .await,
                "the others elect a new leader"
            );
            let second = cluster.leader().expect("leader");
            assert_eq!(
                cluster.handle(first).get_role().expect("role").0,
                Role::Follower,
                "the isolated leader's lease ran out"
            );
            cluster.append(second, b"b").await;

            // The old leader kept campaigning while cut off, so it may force
            // one more election once back.
            cluster.network.heal();
            assert!(
                eventually(Duration::from_secs(10), || {
                    let Some(leader) = cluster.leader() else {
                        return false;
                    };
                    cluster.handle(first).get_leader().ok().flatten() == Some(NodeId(leader))
                        && cluster.committed_payloads(first)
                            == vec![b"a".to_vec(), b"b".to_vec()]
                })
                .await,
                "the old leader follows and catches up"
            );

            for node in &cluster.nodes {
                node.env.shutdown();
            }
        })
        .await;
}
