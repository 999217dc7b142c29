//! Member and learner changes, joint quorums and replica number checks.

use std::collections::HashMap;

use palf::{AppendOptions, NodeId, PalfConfig, PalfError, Role, Scn};

use crate::harness::{members, Cluster, OK_TIMEOUT, SHORT_TIMEOUT};

fn acceptor_ids(cluster: &Cluster, id: u64) -> Vec<u64> {
    let mut ids: Vec<u64> = cluster
        .handle(id)
        .get_paxos_member_list()
        .expect("member list")
        .acceptors
        .iter()
        .map(|m| m.node.0)
        .collect();
    ids.sort_unstable();
    ids
}

fn learner_ids(cluster: &Cluster, id: u64) -> Vec<u64> {
    let mut ids: Vec<u64> = cluster
        .handle(id)
        .get_paxos_member_list()
        .expect("member list")
        .learners
        .iter()
        .map(|m| m.node.0)
        .collect();
    ids.sort_unstable();
    ids
}

// ============================================================================
// Learners
// ============================================================================

#[tokio::test]
async fn test_learners_never_count_toward_quorum() {
    let cluster = Cluster::with_members(7, &[1, 2, 3, 4, 5], PalfConfig::for_testing());
    cluster.elect(1).await;
    let leader = cluster.handle(1);
    leader
        .add_learner(members(&[6])[0].clone(), OK_TIMEOUT)
        .await
        .expect("add learner 6");
    leader
        .add_learner(members(&[7])[0].clone(), OK_TIMEOUT)
        .await
        .expect("add learner 7");
    cluster.append(1, b"a").await;

    // Two acceptors and two learners acknowledge: no majority of five.
    for id in [3, 4, 5] {
        cluster.network.isolate(NodeId(id));
    }
    let committed = leader.get_committed_end_lsn().expect("committed");
    let result = leader
        .append(AppendOptions::blocking(SHORT_TIMEOUT), b"b".to_vec(), Scn::MIN)
        .await;
    assert_eq!(result, Err(PalfError::Timeout));
    assert_eq!(leader.get_committed_end_lsn().expect("committed"), committed);

    // A third acceptor makes the majority.
    cluster.network.reconnect(NodeId(3));
    cluster.append(1, b"c").await;
    assert_eq!(
        cluster.committed_payloads(1),
        vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]
    );

    for learner in [6, 7] {
        assert_eq!(
            cluster.raw_payloads(learner),
            vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]
        );
        assert_eq!(
            cluster.handle(learner).get_role().expect("role").0,
            Role::Learner
        );
    }
    assert_eq!(learner_ids(&cluster, 1), vec![6, 7]);
}

#[tokio::test]
async fn test_concurrent_changes_are_refused() {
    let cluster = Cluster::with_members(5, &[1, 2, 3], PalfConfig::for_testing());
    cluster.elect(1).await;
    let leader = cluster.handle(1);

    let (first, second) = tokio::join!(
        leader.add_learner(members(&[4])[0].clone(), OK_TIMEOUT),
        leader.add_learner(members(&[5])[0].clone(), OK_TIMEOUT)
    );
    let mut outcomes = vec![first, second];
    outcomes.sort_by_key(|r| r.is_err());
    assert_eq!(outcomes[0], Ok(()));
    assert_eq!(outcomes[1], Err(PalfError::ConfigChangeInProgress));
    assert_eq!(learner_ids(&cluster, 1).len(), 1);

    // Once the first change committed the next one goes through.
    let missing = if learner_ids(&cluster, 1) == vec![4] { 5 } else { 4 };
    leader
        .add_learner(members(&[missing])[0].clone(), OK_TIMEOUT)
        .await
        .expect("second change");
    assert_eq!(learner_ids(&cluster, 1), vec![4, 5]);
}

#[tokio::test]
async fn test_change_refused_while_another_is_pending() {
    let cluster = Cluster::with_members(4, &[1, 2, 3], PalfConfig::for_testing());
    cluster.elect(1).await;
    let leader = cluster.handle(1);

    // {1, 3} is a majority of {1, 2, 3} but not of {1, 2}: the removal is
    // logged and stays uncommitted.
    cluster.network.isolate(NodeId(2));
    assert_eq!(
        leader
            .remove_member(members(&[3])[0].clone(), 2, SHORT_TIMEOUT)
            .await,
        Err(PalfError::Timeout)
    );
    assert_eq!(
        leader
            .add_member(members(&[4])[0].clone(), 4, OK_TIMEOUT)
            .await,
        Err(PalfError::ConfigChangeInProgress)
    );
    assert_eq!(acceptor_ids(&cluster, 1), vec![1, 2, 3]);

    cluster.network.heal();
    cluster.append(1, b"a").await;
    assert_eq!(acceptor_ids(&cluster, 1), vec![1, 2]);
    leader
        .add_member(members(&[4])[0].clone(), 3, OK_TIMEOUT)
        .await
        .expect("add after the removal committed");
    assert_eq!(acceptor_ids(&cluster, 1), vec![1, 2, 4]);
}

#[tokio::test]
async fn test_change_refused_while_newcomer_catches_up() {
    let cluster = Cluster::with_members(4, &[1, 2, 3], PalfConfig::for_testing());
    cluster.elect(1).await;
    let leader = cluster.handle(1);
    cluster.network.block_link(NodeId(1), NodeId(4));

    let add = leader.add_member(members(&[4])[0].clone(), 4, SHORT_TIMEOUT);
    tokio::pin!(add);
    assert!(futures::poll!(add.as_mut()).is_pending());
    assert_eq!(
        leader
            .remove_member(members(&[3])[0].clone(), 2, OK_TIMEOUT)
            .await,
        Err(PalfError::ConfigChangeInProgress)
    );

    // Node 4 never got the log, so nothing was logged for it.
    assert_eq!(add.await, Err(PalfError::Timeout));
    assert_eq!(acceptor_ids(&cluster, 1), vec![1, 2, 3]);
    leader
        .remove_member(members(&[3])[0].clone(), 2, OK_TIMEOUT)
        .await
        .expect("remove once the add gave up");
    assert_eq!(acceptor_ids(&cluster, 1), vec![1, 2]);
}

#[tokio::test]
async fn test_follower_cannot_reconfigure() {
    let cluster = Cluster::with_members(4, &[1, 2, 3], PalfConfig::for_testing());
    cluster.elect(1).await;
    assert_eq!(
        cluster
            .handle(2)
            .add_learner(members(&[4])[0].clone(), OK_TIMEOUT)
            .await,
        Err(PalfError::NotLeader)
    );
}

// ============================================================================
// Acceptors
// ============================================================================

#[tokio::test]
async fn test_add_and_remove_member() {
    let cluster = Cluster::with_members(4, &[1, 2, 3], PalfConfig::for_testing());
    cluster.elect(1).await;
    cluster.append(1, b"a").await;
    let leader = cluster.handle(1);

    leader
        .add_member(members(&[4])[0].clone(), 4, OK_TIMEOUT)
        .await
        .expect("add member");
    assert_eq!(acceptor_ids(&cluster, 1), vec![1, 2, 3, 4]);
    assert_eq!(
        leader.get_paxos_member_list().expect("list").replica_num,
        4
    );
    cluster.append(1, b"b").await;
    assert_eq!(
        cluster.raw_payloads(4),
        vec![b"a".to_vec(), b"b".to_vec()]
    );

    assert!(matches!(
        leader
            .remove_member(members(&[1])[0].clone(), 3, OK_TIMEOUT)
            .await,
        Err(PalfError::InvalidArgument(_))
    ));
    assert!(matches!(
        leader
            .add_member(members(&[2])[0].clone(), 5, OK_TIMEOUT)
            .await,
        Err(PalfError::InvalidArgument(_))
    ));

    leader
        .remove_member(members(&[2])[0].clone(), 3, OK_TIMEOUT)
        .await
        .expect("remove member");
    assert_eq!(acceptor_ids(&cluster, 1), vec![1, 3, 4]);

    // With {1, 3, 4} the leader and node 4 are a majority; with the old
    // {1, 2, 3} they would not be.
    cluster.network.isolate(NodeId(2));
    cluster.network.isolate(NodeId(3));
    cluster.append(1, b"c").await;
    assert_eq!(
        cluster.committed_payloads(1),
        vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]
    );
}

#[tokio::test]
async fn test_newcomer_must_catch_up_before_it_votes() {
    let cluster = Cluster::with_members(5, &[1, 2, 3], PalfConfig::for_testing());
    cluster.elect(1).await;
    cluster.append(1, b"spread").await;
    let leader = cluster.handle(1);

    cluster.network.block_link(NodeId(1), NodeId(4));
    assert_eq!(
        leader
            .add_member(members(&[4])[0].clone(), 4, SHORT_TIMEOUT)
            .await,
        Err(PalfError::Timeout)
    );
    assert_eq!(acceptor_ids(&cluster, 1), vec![1, 2, 3]);

    cluster.network.heal();
    leader
        .add_member(members(&[4])[0].clone(), 4, OK_TIMEOUT)
        .await
        .expect("add 4");
    leader
        .add_member(members(&[5])[0].clone(), 5, OK_TIMEOUT)
        .await
        .expect("add 5");
    // Carries the watermark of the last change to every follower.
    cluster.append(1, b"b").await;

    // Acks from {1, 2, 4, 5}: a majority that overlaps every other one.
    cluster.network.block_link(NodeId(1), NodeId(3));
    cluster.append(1, b"d").await;

    cluster.network.isolate(NodeId(1));
    cluster.network.isolate(NodeId(2));
    cluster.elect(3).await;
    cluster.append(3, b"e").await;
    assert_eq!(
        cluster.committed_payloads(3),
        vec![
            b"spread".to_vec(),
            b"b".to_vec(),
            b"d".to_vec(),
            b"e".to_vec()
        ]
    );
}

#[tokio::test]
async fn test_replace_member_and_switch_roles() {
    let cluster = Cluster::with_members(5, &[1, 2, 3], PalfConfig::for_testing());
    cluster.elect(1).await;
    let leader = cluster.handle(1);

    leader
        .replace_member(members(&[4])[0].clone(), members(&[3])[0].clone(), OK_TIMEOUT)
        .await
        .expect("replace");
    assert_eq!(acceptor_ids(&cluster, 1), vec![1, 2, 4]);

    leader
        .add_learner(members(&[5])[0].clone(), OK_TIMEOUT)
        .await
        .expect("add learner");
    leader
        .switch_learner_to_acceptor(members(&[5])[0].clone(), 4, OK_TIMEOUT)
        .await
        .expect("promote");
    assert_eq!(acceptor_ids(&cluster, 1), vec![1, 2, 4, 5]);
    assert!(learner_ids(&cluster, 1).is_empty());

    leader
        .switch_acceptor_to_learner(members(&[2])[0].clone(), 3, OK_TIMEOUT)
        .await
        .expect("demote");
    assert_eq!(acceptor_ids(&cluster, 1), vec![1, 4, 5]);
    assert_eq!(learner_ids(&cluster, 1), vec![2]);

    leader
        .remove_learner(members(&[2])[0].clone(), OK_TIMEOUT)
        .await
        .expect("remove learner");
    assert!(learner_ids(&cluster, 1).is_empty());

    // Bootstrap, reconfirm and five changes.
    let list = leader.get_paxos_member_list().expect("list");
    assert_eq!(list.version.seq, 7);
    assert_eq!(list.replica_num, 3);

    cluster.append(1, b"after").await;
    assert_eq!(cluster.raw_payloads(5), vec![b"after".to_vec()]);
}

#[tokio::test]
async fn test_change_replica_num_checks_caller_view() {
    let cluster = Cluster::new(3);
    cluster.elect(1).await;
    let leader = cluster.handle(1);

    assert!(matches!(
        leader
            .change_replica_num(&members(&[1, 2]), 3, 4, OK_TIMEOUT)
            .await,
        Err(PalfError::InvalidArgument(_))
    ));
    assert!(matches!(
        leader
            .change_replica_num(&members(&[1, 2, 3]), 5, 4, OK_TIMEOUT)
            .await,
        Err(PalfError::InvalidArgument(_))
    ));
    assert!(matches!(
        leader
            .change_replica_num(&members(&[1, 2, 3]), 3, 7, OK_TIMEOUT)
            .await,
        Err(PalfError::InvalidArgument(_))
    ));

    leader
        .change_replica_num(&members(&[3, 2, 1]), 3, 4, OK_TIMEOUT)
        .await
        .expect("change replica num");
    assert_eq!(leader.get_paxos_member_list().expect("list").replica_num, 4);

    // Quorum of 4 is 3: every acceptor is needed now.
    cluster.network.isolate(NodeId(3));
    let result = leader
        .append(AppendOptions::blocking(SHORT_TIMEOUT), b"x".to_vec(), Scn::MIN)
        .await;
    assert_eq!(result, Err(PalfError::Timeout));
}

#[tokio::test]
async fn test_member_list_carries_regions() {
    let cluster = Cluster::new(3);
    cluster.elect(1).await;
    let leader = cluster.handle(1);

    let regions = HashMap::from([
        (NodeId(1), "hangzhou".to_string()),
        (NodeId(2), "shanghai".to_string()),
    ]);
    leader.set_paxos_member_region_map(regions).expect("regions");
    leader.set_region("hangzhou").expect("region");

    let list = leader.get_paxos_member_list().expect("list");
    let region_of = |node: u64| {
        list.acceptors
            .iter()
            .find(|m| m.node == NodeId(node))
            .and_then(|m| m.region.clone())
    };
    assert_eq!(region_of(1), Some("hangzhou".to_string()));
    assert_eq!(region_of(2), Some("shanghai".to_string()));
    assert_eq!(region_of(3), None);

    cluster.append(1, b"a").await;
}
