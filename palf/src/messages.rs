//! Messages exchanged between replicas of a group.
//!
//! | Message | Direction | Raft equivalent |
//! |---|---|---|
//! | [`PushLogRequest`] / [`PushLogResponse`] | leader → replica | AppendEntries |
//! | [`PrepareRequest`] / [`PrepareResponse`] | candidate → acceptor | RequestVote |
//! | [`FetchLogRequest`] / [`FetchLogResponse`] | candidate → acceptor | *(none, Raft leaders never pull)* |
//! | [`ChangeLeaderRequest`] | leader → target | TimeoutNow |
//!
//! Every message carries the sender's proposal id. A receiver with a higher
//! proposal id refuses the message and replies with its own, which makes a
//! stale sender step down.

use serde::{Deserialize, Serialize};

use crate::types::{GroupId, LogGroup, Lsn, NodeId, ProposalId};

/// Groups pushed by the leader, also used as heartbeat when `groups` is empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushLogRequest {
    /// Target group.
    pub group_id: GroupId,
    /// Sending leader.
    pub leader: NodeId,
    /// Leader's epoch.
    pub proposal_id: ProposalId,
    /// Where the pushed groups start; the end of the log the receiver must
    /// already share with the leader.
    pub prev_lsn: Lsn,
    /// Epoch of the leader's group ending at `prev_lsn`, `None` when the
    /// leader no longer holds it.
    pub prev_proposal_id: Option<ProposalId>,
    /// Consecutive groups starting at `prev_lsn`.
    pub groups: Vec<LogGroup>,
    /// Leader's commit watermark.
    pub committed_end: Lsn,
}

/// Answer to a push.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushLogResponse {
    /// Receiver's epoch after handling the push.
    pub proposal_id: ProposalId,
    /// Whether the groups continue the receiver's log.
    pub accepted: bool,
    /// Accepted: end of the log the receiver now shares with the leader.
    /// Rejected: where the leader should resume.
    pub end_lsn: Lsn,
}

/// Request for a promise not to accept anything below `proposal_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrepareRequest {
    /// Target group.
    pub group_id: GroupId,
    /// Campaigning replica.
    pub candidate: NodeId,
    /// Proposed epoch.
    pub proposal_id: ProposalId,
}

/// Promise, or refusal, with a summary of the acceptor's log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrepareResponse {
    /// Acceptor's epoch after handling the request.
    pub proposal_id: ProposalId,
    /// Whether the promise was given.
    pub granted: bool,
    /// End of the acceptor's frozen log.
    pub end_lsn: Lsn,
    /// Epoch of the acceptor's last group.
    pub last_proposal_id: ProposalId,
}

impl PrepareResponse {
    /// Key used to pick the freshest log: last group epoch, then length.
    pub fn freshness(&self) -> (ProposalId, Lsn) {
        (self.last_proposal_id, self.end_lsn)
    }
}

/// Pull of groups from a replica with a fresher log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchLogRequest {
    /// Target group.
    pub group_id: GroupId,
    /// Pulling replica.
    pub requester: NodeId,
    /// Requester's epoch.
    pub proposal_id: ProposalId,
    /// First LSN wanted; must be a group boundary of the donor.
    pub start_lsn: Lsn,
    /// Upper bound on the answer size.
    pub max_bytes: u64,
}

/// Groups returned by a donor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchLogResponse {
    /// Donor's epoch.
    pub proposal_id: ProposalId,
    /// Epoch of the donor's group ending at `start_lsn`.
    pub prev_proposal_id: Option<ProposalId>,
    /// Consecutive groups from `start_lsn`.
    pub groups: Vec<LogGroup>,
    /// End of the donor's frozen log.
    pub end_lsn: Lsn,
}

/// Asks the target to campaign right away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeLeaderRequest {
    /// Target group.
    pub group_id: GroupId,
    /// Current leader.
    pub leader: NodeId,
    /// Current leader's epoch.
    pub proposal_id: ProposalId,
}
