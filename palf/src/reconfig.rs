//! Online membership changes.
//!
//! Every change is one config entry carrying the complete new member list.
//! Only one change may be in flight; the list becomes the group's applied
//! membership when its entry commits, and until then commits need a quorum
//! of both the applied and the pending list. A change whose caller timed out
//! stays in the log: it either commits later or is truncated by a later
//! leader, and in neither case is a partial list ever observable.
//!
//! A replica that starts voting through a change (added, replacing, promoted
//! learner) first receives the log without voting. The config entry is only
//! logged once it is within `catch_up_lag_threshold` bytes of the commit
//! watermark; until then the change counts as in flight, and if the newcomer
//! doesn't get there before the caller's timeout nothing is logged. Commit
//! and election quorums are always computed over every acceptor.
//!
//! ## Raft Comparison
//!
//! | Aspect | Raft | PALF |
//! |---|---|---|
//! | **Mechanism** | joint consensus or single-server changes | one config entry, joint quorum while pending |
//! | **New voters** | learners first, promoted manually | fed the log first, then logged as acceptor |
//! | **Concurrent changes** | serialized by the leader | refused with `ConfigChangeInProgress` |

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::PalfError;
use crate::membership::{ConfigChange, GroupMember, MemberList};
use crate::replica::{ElectionState, PalfReplica, ReplicaState};
use crate::storage::LogStorage;
use crate::types::{EntryKind, NodeId, ProposalId, Scn};

impl<S: LogStorage + 'static> PalfReplica<S> {
    /// Add `member` as an acceptor; the group then counts `replica_num`
    /// replicas.
    pub async fn add_member(
        &self,
        member: GroupMember,
        replica_num: usize,
        timeout: Duration,
    ) -> Result<(), PalfError> {
        self.change_config(
            ConfigChange::AddMember {
                member,
                replica_num,
            },
            timeout,
        )
        .await
    }

    /// Remove the acceptor `member`.
    pub async fn remove_member(
        &self,
        member: GroupMember,
        replica_num: usize,
        timeout: Duration,
    ) -> Result<(), PalfError> {
        self.change_config(
            ConfigChange::RemoveMember {
                member,
                replica_num,
            },
            timeout,
        )
        .await
    }

    /// Swap the acceptor `removed` for `added` in one change.
    pub async fn replace_member(
        &self,
        added: GroupMember,
        removed: GroupMember,
        timeout: Duration,
    ) -> Result<(), PalfError> {
        self.change_config(ConfigChange::ReplaceMember { added, removed }, timeout)
            .await
    }

    /// Change the replica number.
    ///
    /// `current_members` and `current_replica_num` are the caller's view of
    /// the group; the change is refused with [`PalfError::InvalidArgument`]
    /// when it is out of date.
    pub async fn change_replica_num(
        &self,
        current_members: &[GroupMember],
        current_replica_num: usize,
        new_replica_num: usize,
        timeout: Duration,
    ) -> Result<(), PalfError> {
        {
            let state = self.state.borrow();
            let applied = state.membership.applied()?;
            if !applied.has_same_acceptors(current_members)
                || applied.replica_num != current_replica_num
            {
                return Err(PalfError::InvalidArgument(format!(
                    "member list view is stale: group has {} acceptors and replica_num {}",
                    applied.acceptors.len(),
                    applied.replica_num
                )));
            }
        }
        self.change_config(
            ConfigChange::ChangeReplicaNum {
                replica_num: new_replica_num,
            },
            timeout,
        )
        .await
    }

    /// Add a non-voting replica.
    pub async fn add_learner(
        &self,
        learner: GroupMember,
        timeout: Duration,
    ) -> Result<(), PalfError> {
        self.change_config(ConfigChange::AddLearner { learner }, timeout)
            .await
    }

    /// Remove a learner.
    pub async fn remove_learner(
        &self,
        learner: GroupMember,
        timeout: Duration,
    ) -> Result<(), PalfError> {
        self.change_config(ConfigChange::RemoveLearner { learner }, timeout)
            .await
    }

    /// Turn a learner into an acceptor.
    pub async fn switch_learner_to_acceptor(
        &self,
        learner: GroupMember,
        replica_num: usize,
        timeout: Duration,
    ) -> Result<(), PalfError> {
        self.change_config(
            ConfigChange::SwitchLearnerToAcceptor {
                learner,
                replica_num,
            },
            timeout,
        )
        .await
    }

    /// Turn an acceptor into a learner.
    pub async fn switch_acceptor_to_learner(
        &self,
        member: GroupMember,
        replica_num: usize,
        timeout: Duration,
    ) -> Result<(), PalfError> {
        self.change_config(
            ConfigChange::SwitchAcceptorToLearner {
                member,
                replica_num,
            },
            timeout,
        )
        .await
    }

    async fn change_config(&self, change: ConfigChange, timeout: Duration) -> Result<(), PalfError> {
        let deadline = Instant::now() + timeout;
        let (proposal_id, newcomer) = {
            let mut state = self.state.borrow_mut();
            let proposal_id = state.serving_leader()?;
            if state.membership.has_pending() || state.membership.is_staging() {
                return Err(PalfError::ConfigChangeInProgress);
            }
            self.next_member_list(&state, &change)?;
            let newcomer = change.promoted();
            if let Some(node) = newcomer {
                state.membership.start_catching_up(node);
            }
            (proposal_id, newcomer)
        };

        if let Some(node) = newcomer {
            let caught_up = tokio::time::timeout_at(deadline, self.catch_up_newcomer(proposal_id, node))
                .await
                .unwrap_or(Err(PalfError::Timeout));
            self.state.borrow_mut().membership.stop_catching_up(node);
            if let Err(e) = caught_up {
                warn!(group = %self.group_id, %node, error = %e, "newcomer didn't catch up, change dropped");
                return Err(e);
            }
        }

        let end = {
            let mut state = self.state.borrow_mut();
            if state.serving_leader()? != proposal_id {
                return Err(PalfError::NotLeader);
            }
            let next = self.next_member_list(&state, &change)?;
            let mut log = self.log.borrow_mut();
            let entry =
                self.append_engine_entry(&mut state, &mut log, EntryKind::Config, &next, Scn::MIN)?;
            info!(
                group = %self.group_id,
                proposal = %proposal_id,
                change = ?change,
                version = %next.version,
                lsn = %entry.lsn,
                "member list change logged"
            );
            entry.end_lsn()
        };
        self.replicate_notify.notify_one();
        self.wait_for_commit(proposal_id, end, deadline.saturating_duration_since(Instant::now()))
            .await
    }

    /// The list `change` leads to, versioned under the current proposal id.
    fn next_member_list(
        &self,
        state: &ReplicaState,
        change: &ConfigChange,
    ) -> Result<MemberList, PalfError> {
        let applied = state.membership.applied()?;
        let mut next = applied.apply_change(change)?;
        if !next.is_acceptor(self.self_id) {
            return Err(PalfError::InvalidArgument(format!(
                "leader {} can't leave the acceptors, transfer leadership first",
                self.self_id
            )));
        }
        next.version = applied.version.bump(state.proposal_id);
        Ok(next)
    }

    /// Push to `node` until it is within `catch_up_lag_threshold` bytes of
    /// the commit watermark.
    async fn catch_up_newcomer(&self, proposal_id: ProposalId, node: NodeId) -> Result<(), PalfError> {
        loop {
            match self.replicate_pending().await {
                Ok(()) => {}
                Err(e) if e.is_retryable() && e != PalfError::NotLeader => {
                    debug!(group = %self.group_id, error = %e, "replication round failed")
                }
                Err(e) => return Err(e),
            }
            let matched = {
                let state = self.state.borrow();
                match &state.election {
                    ElectionState::Leader(leader) if state.proposal_id == proposal_id => {
                        leader.progress.get(&node).map(|p| p.match_lsn)
                    }
                    _ => return Err(PalfError::NotLeader),
                }
            };
            let committed = self.log.borrow().committed_end();
            if matched.is_some_and(|m| committed.distance_from(m) <= self.config.catch_up_lag_threshold) {
                info!(group = %self.group_id, %node, committed = %committed, "newcomer caught up");
                return Ok(());
            }
            tokio::time::sleep(self.config.retry_interval).await;
        }
    }
}
