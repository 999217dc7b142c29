//! Access mode switches and raw writes.

use palf::{AccessMode, LogEntry, PalfError, ProposalId, Scn};

use crate::harness::{blocking, Cluster, OK_TIMEOUT};

#[tokio::test]
async fn test_switch_to_raw_write_and_back() {
    let cluster = Cluster::new(3);
    cluster.elect(1).await;
    cluster.append(1, b"before").await;
    let leader = cluster.handle(1);
    let (_, proposal_id, _) = leader.get_role().expect("role");
    assert_eq!(leader.get_access_mode().expect("mode"), (0, AccessMode::Append));

    let end = leader.get_end_lsn().expect("end");
    let entry = LogEntry::data(end, Scn::new(2000), b"r".to_vec());
    assert_eq!(
        leader.raw_write(blocking(), end, vec![entry]).await,
        Err(PalfError::AccessModeMismatch {
            current: AccessMode::Append
        })
    );

    // Stale version, stale proposal id and a follower are all refused.
    assert!(matches!(
        leader
            .change_access_mode(proposal_id, 1, AccessMode::RawWrite, Scn::new(1000), OK_TIMEOUT)
            .await,
        Err(PalfError::InvalidArgument(_))
    ));
    assert_eq!(
        leader
            .change_access_mode(
                ProposalId::new(proposal_id.0 + 5),
                0,
                AccessMode::RawWrite,
                Scn::new(1000),
                OK_TIMEOUT
            )
            .await,
        Err(PalfError::NotLeader)
    );
    assert_eq!(
        cluster
            .handle(2)
            .change_access_mode(proposal_id, 0, AccessMode::RawWrite, Scn::new(1000), OK_TIMEOUT)
            .await,
        Err(PalfError::NotLeader)
    );

    leader
        .change_access_mode(proposal_id, 0, AccessMode::RawWrite, Scn::new(1000), OK_TIMEOUT)
        .await
        .expect("switch to raw write");
    assert_eq!(leader.get_access_mode().expect("mode"), (1, AccessMode::RawWrite));
    assert_eq!(
        leader.append(blocking(), b"x".to_vec(), Scn::MIN).await,
        Err(PalfError::AccessModeMismatch {
            current: AccessMode::RawWrite
        })
    );

    let start = leader.get_end_lsn().expect("end");
    let first = LogEntry::data(start, Scn::new(2000), b"r1".to_vec());
    let second = LogEntry::data(first.end_lsn(), Scn::new(2001), b"r2".to_vec());
    let raw_end = second.end_lsn();

    // Overlap, scn regression.
    let overlapping = LogEntry::data(end, Scn::new(2000), b"o".to_vec());
    assert!(matches!(
        leader.raw_write(blocking(), end, vec![overlapping]).await,
        Err(PalfError::InvalidArgument(_))
    ));
    let older = LogEntry::data(start, Scn::new(10), b"o".to_vec());
    assert!(matches!(
        leader.raw_write(blocking(), start, vec![older]).await,
        Err(PalfError::InvalidArgument(_))
    ));

    leader
        .raw_write(blocking(), start, vec![first, second])
        .await
        .expect("raw write");
    assert_eq!(leader.get_end_lsn().expect("end"), raw_end);
    assert_eq!(leader.get_committed_end_lsn().expect("committed"), raw_end);
    assert_eq!(leader.get_end_scn().expect("end scn"), Scn::new(2001));

    leader
        .change_access_mode(proposal_id, 1, AccessMode::Append, Scn::new(5000), OK_TIMEOUT)
        .await
        .expect("switch back");
    let (_, scn) = cluster.append(1, b"after").await;
    assert!(scn > Scn::new(5000));

    let expected = vec![
        b"before".to_vec(),
        b"r1".to_vec(),
        b"r2".to_vec(),
        b"after".to_vec(),
    ];
    assert_eq!(cluster.committed_payloads(1), expected);
    for follower in [2, 3] {
        assert_eq!(cluster.raw_payloads(follower), expected);
        assert_eq!(
            cluster.handle(follower).get_access_mode().expect("mode"),
            (2, AccessMode::Append)
        );
    }
}

#[tokio::test]
async fn test_concurrent_mode_switch_is_refused() {
    let cluster = Cluster::new(3);
    cluster.elect(1).await;
    let leader = cluster.handle(1);
    let (_, proposal_id, _) = leader.get_role().expect("role");

    let (first, second) = tokio::join!(
        leader.change_access_mode(proposal_id, 0, AccessMode::RawWrite, Scn::new(10), OK_TIMEOUT),
        leader.change_access_mode(proposal_id, 0, AccessMode::RawWrite, Scn::new(10), OK_TIMEOUT)
    );
    let mut outcomes = vec![first, second];
    outcomes.sort_by_key(|r| r.is_err());
    assert_eq!(outcomes[0], Ok(()));
    assert_eq!(outcomes[1], Err(PalfError::ConfigChangeInProgress));
    assert_eq!(leader.get_access_mode().expect("mode"), (1, AccessMode::RawWrite));
}
