//! Appends, commit propagation, backpressure and stale leader fencing.

use palf::{AppendOptions, EntryKind, Lsn, NodeId, PalfConfig, PalfError, ProposalId, Role, Scn};

use crate::harness::{blocking, Cluster, GROUP, SHORT_TIMEOUT};

// ============================================================================
// Single replica
// ============================================================================

#[tokio::test]
async fn test_single_replica_append_and_read() {
    let cluster = Cluster::new(1);
    cluster.elect(1).await;
    let handle = cluster.handle(1);

    let (lsn_a, scn_a) = cluster.append(1, b"a").await;
    let (lsn_b, scn_b) = handle
        .append(blocking(), b"b".to_vec(), Scn::new(100))
        .await
        .expect("append with min scn");
    let (_, scn_c) = cluster.append(1, b"c").await;

    assert!(lsn_a > Lsn::MIN, "the reconfirm entry comes first");
    assert!(lsn_b > lsn_a);
    assert!(scn_a < Scn::new(100));
    assert_eq!(scn_b, Scn::new(100));
    assert_eq!(scn_c, Scn::new(101));

    assert_eq!(
        handle.get_committed_end_lsn().expect("committed"),
        handle.get_end_lsn().expect("end")
    );
    assert_eq!(handle.get_end_scn().expect("end scn"), Scn::new(101));
    assert_eq!(handle.get_max_scn().expect("max scn"), Scn::new(101));
    assert_eq!(
        cluster.committed_payloads(1),
        vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]
    );

    let from_b: Vec<Vec<u8>> = handle
        .seek(lsn_b)
        .expect("seek")
        .map(|entry| entry.expect("entry").data)
        .collect();
    assert_eq!(from_b, vec![b"b".to_vec(), b"c".to_vec()]);

    let mut groups = handle.seek_group_by_scn(Scn::new(100)).expect("seek by scn");
    let group = groups.next_group().expect("read").expect("group");
    assert_eq!(group.header.start_lsn, lsn_b);
    assert_eq!(group.entries[0].kind, EntryKind::Data);
    assert_eq!(group.entries[0].data, b"b");
}

#[tokio::test]
async fn test_follower_refuses_appends() {
    let cluster = Cluster::new(3);
    cluster.elect(1).await;

    let result = cluster
        .handle(2)
        .append(blocking(), b"x".to_vec(), Scn::MIN)
        .await;
    assert_eq!(result, Err(PalfError::NotLeader));
    assert_eq!(cluster.handle(2).get_leader().expect("leader"), Some(NodeId(1)));
}

// ============================================================================
// Commit propagation
// ============================================================================

#[tokio::test]
async fn test_followers_receive_log_and_learn_commit() {
    let cluster = Cluster::new(3);
    cluster.elect(1).await;

    cluster.append(1, b"a").await;
    cluster.append(1, b"b").await;

    let expected = vec![b"a".to_vec(), b"b".to_vec()];
    for follower in [2, 3] {
        assert_eq!(cluster.raw_payloads(follower), expected);
        // The watermark travels with the next push.
        assert_eq!(cluster.committed_payloads(follower), vec![b"a".to_vec()]);
    }

    cluster.append(1, b"c").await;
    for follower in [2, 3] {
        assert_eq!(cluster.committed_payloads(follower), expected);
        let (role, proposal_id, pending) = cluster.handle(follower).get_role().expect("role");
        assert_eq!(role, Role::Follower);
        assert_eq!(proposal_id, ProposalId::new(1));
        assert!(!pending);
    }
}

#[tokio::test]
async fn test_commit_needs_majority() {
    let cluster = Cluster::new(3);
    cluster.elect(1).await;
    cluster.append(1, b"a").await;

    cluster.network.isolate(NodeId(2));
    cluster.append(1, b"one follower is enough").await;

    cluster.network.isolate(NodeId(3));
    let committed = cluster.handle(1).get_committed_end_lsn().expect("committed");
    let result = cluster
        .handle(1)
        .append(AppendOptions::blocking(SHORT_TIMEOUT), b"stuck".to_vec(), Scn::MIN)
        .await;
    assert_eq!(result, Err(PalfError::Timeout));
    assert_eq!(
        cluster.handle(1).get_committed_end_lsn().expect("committed"),
        committed
    );

    cluster.network.heal();
    cluster.append(1, b"unstuck").await;
    assert_eq!(
        cluster.committed_payloads(1),
        vec![
            b"a".to_vec(),
            b"one follower is enough".to_vec(),
            b"stuck".to_vec(),
            b"unstuck".to_vec()
        ]
    );
}

// ============================================================================
// Backpressure and storage faults
// ============================================================================

#[tokio::test]
async fn test_non_blocking_backpressure() {
    let config = PalfConfig {
        max_inflight_bytes: 256,
        ..PalfConfig::for_testing()
    };
    let cluster = Cluster::with_members(1, &[1], config);
    cluster.elect(1).await;
    let handle = cluster.handle(1);
    let payload = vec![7u8; 100];

    handle
        .append(AppendOptions::NonBlocking, payload.clone(), Scn::MIN)
        .await
        .expect("first non-blocking append fits");
    let result = handle
        .append(AppendOptions::NonBlocking, payload.clone(), Scn::MIN)
        .await;
    assert_eq!(
        result,
        Err(PalfError::Backpressure {
            inflight: 264,
            limit: 256
        })
    );
    assert!(result.expect_err("backpressure").is_retryable());

    // A blocking append drives the pending bytes to commit.
    cluster.append(1, b"flush").await;
    handle
        .append(AppendOptions::NonBlocking, payload, Scn::MIN)
        .await
        .expect("room again after commit");
}

#[tokio::test]
async fn test_storage_failure_surfaces() {
    let cluster = Cluster::new(1);
    cluster.elect(1).await;

    cluster.node(1).storage.fail_next_writes(1);
    let result = cluster
        .handle(1)
        .append(blocking(), b"lost".to_vec(), Scn::MIN)
        .await;
    assert!(matches!(result, Err(PalfError::Io(_))));

    cluster.append(1, b"kept").await;
    assert_eq!(cluster.committed_payloads(1), vec![b"kept".to_vec()]);
}

// ============================================================================
// Fencing
// ============================================================================

#[tokio::test]
async fn test_stale_leader_is_fenced_and_repaired() {
    let cluster = Cluster::new(3);
    cluster.elect(1).await;
    cluster.append(1, b"a").await;

    cluster.network.isolate(NodeId(1));
    cluster.elect(2).await;

    let result = cluster
        .handle(1)
        .append(AppendOptions::blocking(SHORT_TIMEOUT), b"lost-1".to_vec(), Scn::MIN)
        .await;
    assert_eq!(result, Err(PalfError::Timeout));

    cluster.network.reconnect(NodeId(1));
    let result = cluster
        .handle(1)
        .append(blocking(), b"lost-2".to_vec(), Scn::MIN)
        .await;
    assert_eq!(result, Err(PalfError::NotLeader));
    let (role, proposal_id, _) = cluster.handle(1).get_role().expect("role");
    assert_eq!(role, Role::Follower);
    assert_eq!(proposal_id, ProposalId::new(2));

    // The new leader's pushes cut the divergent suffix.
    let mut converged = false;
    for i in 0..10 {
        cluster.append(2, format!("b{i}").as_bytes()).await;
        if cluster.raw_payloads(1) == cluster.raw_payloads(2) {
            converged = true;
            break;
        }
    }
    assert!(converged, "old leader adopts the new leader's log");
    let payloads = cluster.raw_payloads(1);
    assert!(!payloads.contains(&b"lost-1".to_vec()));
    assert!(!payloads.contains(&b"lost-2".to_vec()));
    assert_eq!(payloads[0], b"a");
    assert_eq!(cluster.handle(1).get_leader().expect("leader"), Some(NodeId(2)));
}

#[tokio::test]
async fn test_closed_handle_is_rejected() {
    let mut cluster = Cluster::new(1);
    cluster.elect(1).await;

    let node = &mut cluster.nodes[0];
    let mut extra = node.env.open(GROUP).expect("open");
    node.env.close(&mut node.handle);
    let result = node.handle.append(blocking(), b"x".to_vec(), Scn::MIN).await;
    assert!(matches!(result, Err(PalfError::InvalidArgument(_))));

    extra
        .append(blocking(), b"x".to_vec(), Scn::MIN)
        .await
        .expect("other handles keep working");
    node.env.close(&mut extra);
    assert_eq!(node.env.open_handle_count(GROUP), 0);
}
