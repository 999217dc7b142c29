//! Member lists, reconfiguration records and quorum arithmetic.
//!
//! A group's membership is a [`MemberList`]: the acceptors (voting replicas),
//! the learners (non-voting replicas that still receive the log), the
//! replica number the quorum is computed from, and a [`ConfigVersion`].
//!
//! Membership changes go through the log. The leader appends a config entry
//! carrying the complete new list; the list becomes the group's applied
//! membership only once that entry commits. While a change is pending, a
//! commit needs a majority of the applied list **and** of the pending one, so
//! no decision is ever taken by a quorum that is not a quorum of both.
//!
//! ## Raft comparison
//!
//! | PALF | Raft |
//! |---|---|
//! | acceptor | voter |
//! | learner | non-voter / learner |
//! | `replica_num` | size of the voter set |
//! | pending config entry | `C_old,new` joint configuration |
//! | reconfirm entry | no-op entry at the start of a term |

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::PalfError;
use crate::types::{Lsn, NodeId, ProposalId};

/// A replica of the group.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GroupMember {
    /// Server hosting the replica.
    pub node: NodeId,
    /// Advisory region, used for fan-out ordering.
    pub region: Option<String>,
}

impl GroupMember {
    /// A member without region information.
    pub fn new(node: NodeId) -> Self {
        Self { node, region: None }
    }

    /// A member located in `region`.
    pub fn with_region(node: NodeId, region: impl Into<String>) -> Self {
        Self {
            node,
            region: Some(region.into()),
        }
    }
}

/// Version of a member list: epoch of the leader that wrote it, then a
/// sequence number bumped on every change.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct ConfigVersion {
    /// Proposal id of the leader that logged the list.
    pub proposal_id: ProposalId,
    /// Change counter.
    pub seq: u64,
}

impl ConfigVersion {
    /// The version following `self`, written under `proposal_id`.
    pub fn bump(self, proposal_id: ProposalId) -> Self {
        Self {
            proposal_id,
            seq: self.seq + 1,
        }
    }
}

impl std::fmt::Display for ConfigVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "config({}, {})", self.proposal_id.0, self.seq)
    }
}

/// The membership of a group.
///
/// # Invariants
///
/// - no node appears twice across acceptors and learners
/// - `replica_num >= acceptors.len()` and the acceptors alone can form a
///   quorum of `replica_num`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberList {
    /// Voting replicas.
    pub acceptors: Vec<GroupMember>,
    /// Non-voting replicas.
    pub learners: Vec<GroupMember>,
    /// Number the quorum is computed from.
    pub replica_num: usize,
    /// Version of this list.
    pub version: ConfigVersion,
}

impl MemberList {
    /// A first member list, without learners.
    pub fn new(acceptors: Vec<GroupMember>, replica_num: usize) -> Result<Self, PalfError> {
        let list = Self {
            acceptors,
            learners: Vec::new(),
            replica_num,
            version: ConfigVersion {
                proposal_id: ProposalId::ZERO,
                seq: 1,
            },
        };
        list.validate()?;
        Ok(list)
    }

    /// Check the invariants.
    pub fn validate(&self) -> Result<(), PalfError> {
        if self.acceptors.is_empty() {
            return Err(PalfError::InvalidArgument(
                "member list has no acceptor".into(),
            ));
        }
        let mut seen = HashSet::new();
        for member in self.acceptors.iter().chain(self.learners.iter()) {
            if !seen.insert(member.node) {
                return Err(PalfError::InvalidArgument(format!(
                    "{} listed twice",
                    member.node
                )));
            }
        }
        if self.replica_num < self.acceptors.len() {
            return Err(PalfError::InvalidArgument(format!(
                "replica_num {} below {} acceptors",
                self.replica_num,
                self.acceptors.len()
            )));
        }
        if self.acceptors.len() < self.quorum_size() {
            return Err(PalfError::InvalidArgument(format!(
                "{} acceptors can't form a quorum of {} for replica_num {}",
                self.acceptors.len(),
                self.quorum_size(),
                self.replica_num
            )));
        }
        Ok(())
    }

    /// Acknowledgements a commit needs: `replica_num / 2 + 1`.
    pub fn quorum_size(&self) -> usize {
        self.replica_num / 2 + 1
    }

    /// Whether `node` votes in this list.
    pub fn is_acceptor(&self, node: NodeId) -> bool {
        self.acceptors.iter().any(|m| m.node == node)
    }

    /// Whether `node` is a learner in this list.
    pub fn is_learner(&self, node: NodeId) -> bool {
        self.learners.iter().any(|m| m.node == node)
    }

    /// Whether `node` is an acceptor or a learner.
    pub fn contains(&self, node: NodeId) -> bool {
        self.is_acceptor(node) || self.is_learner(node)
    }

    /// Whether `members` names exactly the acceptors of this list.
    pub fn has_same_acceptors(&self, members: &[GroupMember]) -> bool {
        members.len() == self.acceptors.len() && members.iter().all(|m| self.is_acceptor(m.node))
    }

    /// The list that results from `change`. The version is left untouched.
    pub fn apply_change(&self, change: &ConfigChange) -> Result<MemberList, PalfError> {
        let mut next = self.clone();
        match change {
            ConfigChange::AddMember {
                member,
                replica_num,
            } => {
                self.ensure_absent(member.node)?;
                next.acceptors.push(member.clone());
                next.replica_num = *replica_num;
            }
            ConfigChange::RemoveMember {
                member,
                replica_num,
            } => {
                self.ensure_acceptor(member.node)?;
                next.acceptors.retain(|m| m.node != member.node);
                next.replica_num = *replica_num;
            }
            ConfigChange::ReplaceMember { added, removed } => {
                self.ensure_absent(added.node)?;
                self.ensure_acceptor(removed.node)?;
                next.acceptors.retain(|m| m.node != removed.node);
                next.acceptors.push(added.clone());
            }
            ConfigChange::ChangeReplicaNum { replica_num } => {
                next.replica_num = *replica_num;
            }
            ConfigChange::AddLearner { learner } => {
                self.ensure_absent(learner.node)?;
                next.learners.push(learner.clone());
            }
            ConfigChange::RemoveLearner { learner } => {
                self.ensure_learner(learner.node)?;
                next.learners.retain(|m| m.node != learner.node);
            }
            ConfigChange::SwitchLearnerToAcceptor {
                learner,
                replica_num,
            } => {
                self.ensure_learner(learner.node)?;
                next.learners.retain(|m| m.node != learner.node);
                next.acceptors.push(learner.clone());
                next.replica_num = *replica_num;
            }
            ConfigChange::SwitchAcceptorToLearner {
                member,
                replica_num,
            } => {
                self.ensure_acceptor(member.node)?;
                next.acceptors.retain(|m| m.node != member.node);
                next.learners.push(member.clone());
                next.replica_num = *replica_num;
            }
            ConfigChange::Reconfirm => {}
        }
        next.validate()?;
        Ok(next)
    }

    /// Highest LSN acknowledged by a quorum of this list.
    ///
    /// `acked` maps each replica to the end of its matching log. Every
    /// acceptor counts, with the same quorum size elections use; learners
    /// never count. `None` when the acceptors can't form a quorum.
    pub fn quorum_lsn(&self, acked: &HashMap<NodeId, Lsn>) -> Option<Lsn> {
        let mut counted: Vec<Lsn> = self
            .acceptors
            .iter()
            .map(|m| acked.get(&m.node).copied().unwrap_or(Lsn::MIN))
            .collect();
        let quorum = self.quorum_size();
        if counted.len() < quorum {
            return None;
        }
        counted.sort_unstable_by(|a, b| b.cmp(a));
        Some(counted[quorum - 1])
    }

    /// Whether the acceptors among `voters` form a quorum.
    pub fn has_quorum(&self, voters: &HashSet<NodeId>) -> bool {
        let votes = self
            .acceptors
            .iter()
            .filter(|m| voters.contains(&m.node))
            .count();
        votes >= self.quorum_size()
    }

    fn ensure_absent(&self, node: NodeId) -> Result<(), PalfError> {
        if self.contains(node) {
            return Err(PalfError::InvalidArgument(format!(
                "{node} is already a member"
            )));
        }
        Ok(())
    }

    fn ensure_acceptor(&self, node: NodeId) -> Result<(), PalfError> {
        if !self.is_acceptor(node) {
            return Err(PalfError::InvalidArgument(format!(
                "{node} is not an acceptor"
            )));
        }
        Ok(())
    }

    fn ensure_learner(&self, node: NodeId) -> Result<(), PalfError> {
        if !self.is_learner(node) {
            return Err(PalfError::InvalidArgument(format!(
                "{node} is not a learner"
            )));
        }
        Ok(())
    }
}

/// A membership change, as requested by a caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigChange {
    /// Add an acceptor.
    AddMember {
        /// New acceptor.
        member: GroupMember,
        /// Replica number after the change.
        replica_num: usize,
    },
    /// Remove an acceptor.
    RemoveMember {
        /// Removed acceptor.
        member: GroupMember,
        /// Replica number after the change.
        replica_num: usize,
    },
    /// Swap one acceptor for another, keeping the replica number.
    ReplaceMember {
        /// New acceptor.
        added: GroupMember,
        /// Removed acceptor.
        removed: GroupMember,
    },
    /// Change the replica number only.
    ChangeReplicaNum {
        /// Replica number after the change.
        replica_num: usize,
    },
    /// Add a learner.
    AddLearner {
        /// New learner.
        learner: GroupMember,
    },
    /// Remove a learner.
    RemoveLearner {
        /// Removed learner.
        learner: GroupMember,
    },
    /// Promote a learner.
    SwitchLearnerToAcceptor {
        /// Promoted learner.
        learner: GroupMember,
        /// Replica number after the change.
        replica_num: usize,
    },
    /// Demote an acceptor.
    SwitchAcceptorToLearner {
        /// Demoted acceptor.
        member: GroupMember,
        /// Replica number after the change.
        replica_num: usize,
    },
    /// Re-log the current list under a new version. Written by every new
    /// leader before it serves appends.
    Reconfirm,
}

impl ConfigChange {
    /// The replica that starts voting because of this change.
    pub fn promoted(&self) -> Option<NodeId> {
        match self {
            ConfigChange::AddMember { member, .. } => Some(member.node),
            ConfigChange::ReplaceMember { added, .. } => Some(added.node),
            ConfigChange::SwitchLearnerToAcceptor { learner, .. } => Some(learner.node),
            _ => None,
        }
    }
}

/// Membership view of one replica.
#[derive(Debug, Default)]
pub(crate) struct MembershipState {
    /// Last committed list; `None` before initialization.
    applied: Option<MemberList>,
    /// Logged, not yet committed list and the LSN of its entry.
    pending: Option<(Lsn, MemberList)>,
    /// Replicas fed the log ahead of the change that makes them acceptors.
    /// They receive pushes but never vote.
    catching_up: HashSet<NodeId>,
    region_map: HashMap<NodeId, String>,
    local_region: Option<String>,
}

impl MembershipState {
    pub(crate) fn new(applied: Option<MemberList>) -> Self {
        Self {
            applied,
            ..Self::default()
        }
    }

    pub(crate) fn applied(&self) -> Result<&MemberList, PalfError> {
        self.applied
            .as_ref()
            .ok_or_else(|| PalfError::InvalidArgument("member list not initialized".into()))
    }

    pub(crate) fn applied_opt(&self) -> Option<&MemberList> {
        self.applied.as_ref()
    }

    pub(crate) fn is_initialized(&self) -> bool {
        self.applied.is_some()
    }

    pub(crate) fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Newest list this replica knows of, committed or not.
    pub(crate) fn latest(&self) -> Option<&MemberList> {
        self.pending
            .as_ref()
            .map(|(_, list)| list)
            .or(self.applied.as_ref())
    }

    /// Lists whose quorums every decision needs.
    pub(crate) fn quorum_lists(&self) -> Vec<&MemberList> {
        self.applied
            .iter()
            .chain(self.pending.as_ref().map(|(_, list)| list))
            .collect()
    }

    pub(crate) fn initialize(&mut self, list: MemberList) {
        self.applied = Some(list);
        self.pending = None;
    }

    /// A config entry was written to the local log.
    pub(crate) fn on_logged(&mut self, lsn: Lsn, list: MemberList) {
        self.pending = Some((lsn, list));
    }

    /// The local log was cut at `from`.
    pub(crate) fn on_truncated(&mut self, from: Lsn) {
        if matches!(self.pending, Some((lsn, _)) if lsn >= from) {
            self.pending = None;
        }
    }

    /// The config entry at `lsn` committed.
    pub(crate) fn on_committed(&mut self, lsn: Lsn, list: MemberList) {
        if matches!(self.pending, Some((pending_lsn, _)) if pending_lsn <= lsn) {
            self.pending = None;
        }
        let newer = self
            .applied
            .as_ref()
            .is_none_or(|applied| list.version > applied.version);
        if newer {
            self.applied = Some(list);
        }
    }

    pub(crate) fn start_catching_up(&mut self, node: NodeId) {
        self.catching_up.insert(node);
    }

    pub(crate) fn stop_catching_up(&mut self, node: NodeId) {
        self.catching_up.remove(&node);
    }

    pub(crate) fn reset_catching_up(&mut self) {
        self.catching_up.clear();
    }

    /// Whether a change is waiting for a newcomer to catch up.
    pub(crate) fn is_staging(&self) -> bool {
        !self.catching_up.is_empty()
    }

    /// Whether `node` votes in any list decisions need.
    pub(crate) fn is_voter(&self, node: NodeId) -> bool {
        self.quorum_lists().iter().any(|list| list.is_acceptor(node))
    }

    /// Highest LSN a quorum of every list acknowledged.
    pub(crate) fn quorum_lsn(&self, acked: &HashMap<NodeId, Lsn>) -> Option<Lsn> {
        let lists = self.quorum_lists();
        if lists.is_empty() {
            return None;
        }
        let mut result = Lsn::MAX;
        for list in lists {
            result = result.min(list.quorum_lsn(acked)?);
        }
        Some(result)
    }

    /// Whether `voters` hold a quorum in every list.
    pub(crate) fn has_quorum(&self, voters: &HashSet<NodeId>) -> bool {
        let lists = self.quorum_lists();
        !lists.is_empty() && lists.iter().all(|list| list.has_quorum(voters))
    }

    /// Every other replica that should receive the log, same region first.
    pub(crate) fn peers(&self, local: NodeId) -> Vec<NodeId> {
        let mut peers: Vec<NodeId> = Vec::new();
        for list in self.quorum_lists() {
            for member in list.acceptors.iter().chain(list.learners.iter()) {
                if member.node != local && !peers.contains(&member.node) {
                    peers.push(member.node);
                }
            }
        }
        for node in &self.catching_up {
            if *node != local && !peers.contains(node) {
                peers.push(*node);
            }
        }
        if let Some(region) = &self.local_region {
            peers.sort_by_key(|node| self.region_map.get(node) != Some(region));
        }
        peers
    }

    pub(crate) fn set_region_map(&mut self, map: HashMap<NodeId, String>) {
        self.region_map = map;
    }

    pub(crate) fn set_local_region(&mut self, region: String) {
        self.local_region = Some(region);
    }

    /// `list` with regions filled in from the region map.
    pub(crate) fn annotate(&self, list: &MemberList) -> MemberList {
        let mut list = list.clone();
        for member in list.acceptors.iter_mut().chain(list.learners.iter_mut()) {
            if let Some(region) = self.region_map.get(&member.node) {
                member.region = Some(region.clone());
            }
        }
        list
    }
}
