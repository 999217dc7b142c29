//! One replica of one paxos group.
//!
//! [`PalfReplica`] owns the group's [`LogStore`] and the replica state
//! (proposal id, election role, membership, access mode). The protocol is
//! spread over several modules, each adding an `impl PalfReplica` block:
//!
//! | Module | Adds |
//! |---|---|
//! | [`replication`](crate::replication) | append, raw write, push rounds, follower log matching |
//! | [`election`](crate::election) | campaign, prepare handling, leader transfer, background loops |
//! | [`reconfig`](crate::reconfig) | membership changes |
//! | [`catchup`](crate::catchup) | fetch-log pull and serving |
//! | [`access_mode`](crate::access_mode) | access mode switch |
//!
//! ## Borrowing discipline
//!
//! State lives in `RefCell`s. Every operation borrows `state` first, then
//! `log`, mutates, and drops both before any `.await`. A borrow is never held
//! across a suspension point, so concurrent operations on the same replica
//! interleave only at awaits and always see a consistent state.
//!
//! ## Raft comparison
//!
//! | Field | Raft |
//! |---|---|
//! | `proposal_id` | `currentTerm` (and implicit `votedFor`: one promise per term) |
//! | `ElectionState` | follower / candidate / leader |
//! | `PeerProgress::next_lsn` / `match_lsn` | `nextIndex[]` / `matchIndex[]` |
//! | `LogStore::committed_end` | `commitIndex` |

use std::cell::{Cell, RefCell};
use std::collections::{BTreeSet, HashMap};
use std::rc::Rc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{watch, Notify};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::access_mode::{AccessModeMeta, AccessModeState};
use crate::config::PalfConfig;
use crate::error::PalfError;
use crate::handle::LocationCacheCb;
use crate::iterator::{EntryIterator, GroupIterator, ReadMode};
use crate::lease::{election_jitter, LeaseState};
use crate::log_store::LogStore;
use crate::membership::{GroupMember, MemberList, MembershipState};
use crate::messages::{
    ChangeLeaderRequest, FetchLogRequest, FetchLogResponse, PrepareRequest, PrepareResponse,
    PushLogRequest, PushLogResponse,
};
use crate::storage::{LogMeta, LogStorage};
use crate::transport::{LogTransport, ReplicaEndpoint};
use crate::types::{EntryKind, GroupId, LogEntry, Lsn, NodeId, ProposalId, Role, Scn};

// =============================================================================
// Replica state
// =============================================================================

/// Replication progress of one peer, tracked by the leader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PeerProgress {
    /// Where the next push starts.
    pub(crate) next_lsn: Lsn,
    /// End of the log the peer is known to share with the leader.
    pub(crate) match_lsn: Lsn,
}

impl PeerProgress {
    pub(crate) fn new(next_lsn: Lsn) -> Self {
        Self {
            next_lsn,
            match_lsn: Lsn::MIN,
        }
    }
}

#[derive(Debug)]
pub(crate) struct LeaderState {
    /// End of the config entry this leader logged on election. Nothing is
    /// committed by counting acks before it.
    pub(crate) reconfirm_end: Lsn,
    pub(crate) reconfirmed: bool,
    pub(crate) transferring: bool,
    pub(crate) progress: HashMap<NodeId, PeerProgress>,
    pub(crate) lease: LeaseState,
}

#[derive(Debug)]
pub(crate) enum ElectionState {
    Follower,
    Candidate,
    Leader(LeaderState),
}

#[derive(Debug)]
pub(crate) struct ReplicaState {
    pub(crate) proposal_id: ProposalId,
    pub(crate) election: ElectionState,
    pub(crate) leader: Option<NodeId>,
    pub(crate) membership: MembershipState,
    pub(crate) access: AccessModeState,
    /// Uncommitted config and access mode entries of the local log.
    pub(crate) meta_entries: BTreeSet<Lsn>,
    pub(crate) last_leader_contact: Instant,
    pub(crate) election_jitter: Duration,
}

impl ReplicaState {
    pub(crate) fn is_leader(&self) -> bool {
        matches!(self.election, ElectionState::Leader(_))
    }

    /// Proposal id under which this replica may accept caller writes.
    pub(crate) fn serving_leader(&self) -> Result<ProposalId, PalfError> {
        match &self.election {
            ElectionState::Leader(leader) if leader.reconfirmed && !leader.transferring => {
                Ok(self.proposal_id)
            }
            _ => Err(PalfError::NotLeader),
        }
    }

    pub(crate) fn leader_mut(&mut self) -> Option<&mut LeaderState> {
        match &mut self.election {
            ElectionState::Leader(leader) => Some(leader),
            _ => None,
        }
    }

    pub(crate) fn on_truncated(&mut self, from: Lsn) {
        self.membership.on_truncated(from);
        self.access.on_truncated(from);
        self.meta_entries.split_off(&from);
    }
}

/// Commit watermark as seen by waiters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct CommitProgress {
    pub(crate) proposal_id: ProposalId,
    pub(crate) committed_end: Lsn,
}

// =============================================================================
// PalfReplica
// =============================================================================

/// A replica of one group on one node.
pub struct PalfReplica<S: LogStorage + 'static> {
    pub(crate) group_id: GroupId,
    pub(crate) self_id: NodeId,
    pub(crate) config: PalfConfig,
    pub(crate) log: Rc<RefCell<LogStore<S>>>,
    pub(crate) state: RefCell<ReplicaState>,
    pub(crate) transport: Rc<dyn LogTransport>,
    pub(crate) commit_tx: watch::Sender<CommitProgress>,
    pub(crate) replicate_notify: Notify,
    pub(crate) shutdown: Notify,
    pub(crate) stopped: Cell<bool>,
    location_cb: RefCell<Option<Rc<dyn LocationCacheCb>>>,
}

impl<S: LogStorage + 'static> PalfReplica<S> {
    /// Open the replica stored in `storage`.
    ///
    /// A fresh storage yields an uninitialized replica; see
    /// [`PalfReplica::set_initial_member_list`]. Existing storage is
    /// recovered: proposal id, applied membership and access mode come from
    /// the meta, uncommitted config and access mode entries are tracked
    /// again.
    pub fn open(
        group_id: GroupId,
        self_id: NodeId,
        config: PalfConfig,
        storage: S,
        transport: Rc<dyn LogTransport>,
    ) -> Result<Rc<Self>, PalfError> {
        config.validate()?;
        let meta = storage.load_meta()?.unwrap_or_default();
        let log = LogStore::open(storage, config.log_segment_size, config.wall_clock_scn)?;

        let mut state = ReplicaState {
            proposal_id: meta.proposal_id,
            election: ElectionState::Follower,
            leader: None,
            membership: MembershipState::new(meta.member_list.clone()),
            access: AccessModeState::new(meta.access_mode),
            meta_entries: BTreeSet::new(),
            last_leader_contact: Instant::now(),
            election_jitter: election_jitter(config.election_timeout),
        };
        for entry in log.read_entries(log.committed_end(), log.end_lsn())? {
            track_logged(&mut state, &entry)?;
        }

        let (commit_tx, _) = watch::channel(CommitProgress {
            proposal_id: meta.proposal_id,
            committed_end: log.committed_end(),
        });
        info!(
            group = %group_id,
            node = %self_id,
            proposal = %meta.proposal_id,
            end = %log.end_lsn(),
            committed = %log.committed_end(),
            "replica opened"
        );
        Ok(Rc::new(Self {
            group_id,
            self_id,
            config,
            log: Rc::new(RefCell::new(log)),
            state: RefCell::new(state),
            transport,
            commit_tx,
            replicate_notify: Notify::new(),
            shutdown: Notify::new(),
            stopped: Cell::new(false),
            location_cb: RefCell::new(None),
        }))
    }

    /// Group this replica belongs to.
    pub fn group_id(&self) -> GroupId {
        self.group_id
    }

    /// Node hosting this replica.
    pub fn node_id(&self) -> NodeId {
        self.self_id
    }

    /// Stop background loops. The replica keeps answering calls.
    pub fn stop(&self) {
        self.stopped.set(true);
        self.shutdown.notify_waiters();
    }

    // =========================================================================
    // Membership bootstrap and metadata
    // =========================================================================

    /// Install the first member list. Fails once the group has one.
    pub fn set_initial_member_list(
        &self,
        members: Vec<GroupMember>,
        replica_num: usize,
    ) -> Result<(), PalfError> {
        let mut state = self.state.borrow_mut();
        if state.membership.is_initialized() {
            return Err(PalfError::InvalidArgument(
                "member list already initialized".into(),
            ));
        }
        let list = MemberList::new(members, replica_num)?;
        state.membership.initialize(list);
        let mut log = self.log.borrow_mut();
        self.persist_meta(&state, &mut log)?;
        info!(group = %self.group_id, node = %self.self_id, replica_num, "initial member list set");
        Ok(())
    }

    /// Applied member list, regions filled from the region map.
    pub fn get_paxos_member_list(&self) -> Result<MemberList, PalfError> {
        let state = self.state.borrow();
        let applied = state.membership.applied()?;
        Ok(state.membership.annotate(applied))
    }

    /// Advisory region of every member.
    pub fn set_paxos_member_region_map(&self, regions: HashMap<NodeId, String>) {
        self.state.borrow_mut().membership.set_region_map(regions);
    }

    /// Region of this replica.
    pub fn set_region(&self, region: impl Into<String>) {
        self.state
            .borrow_mut()
            .membership
            .set_local_region(region.into());
    }

    /// Register the callback told about leader changes.
    pub fn set_location_cache_cb(&self, cb: Rc<dyn LocationCacheCb>) {
        *self.location_cb.borrow_mut() = Some(cb);
    }

    /// Remove the leader-change callback.
    pub fn reset_location_cache_cb(&self) {
        *self.location_cb.borrow_mut() = None;
    }

    pub(crate) fn notify_leader(&self, leader: Option<NodeId>) {
        let cb = self.location_cb.borrow().clone();
        if let Some(cb) = cb {
            cb.on_leader_changed(self.group_id, leader);
        }
    }

    // =========================================================================
    // Observers
    // =========================================================================

    /// `(role, proposal_id, is_pending)`. Pending while campaigning and while
    /// a fresh leader's reconfirm entry is uncommitted.
    pub fn get_role(&self) -> (Role, ProposalId, bool) {
        let state = self.state.borrow();
        let follower_role = match state.membership.applied_opt() {
            Some(list) if list.is_learner(self.self_id) => Role::Learner,
            _ => Role::Follower,
        };
        match &state.election {
            ElectionState::Leader(leader) => (Role::Leader, state.proposal_id, !leader.reconfirmed),
            ElectionState::Candidate => (follower_role, state.proposal_id, true),
            ElectionState::Follower => (follower_role, state.proposal_id, false),
        }
    }

    /// Leader this replica currently follows or is.
    pub fn get_leader(&self) -> Option<NodeId> {
        self.state.borrow().leader
    }

    /// First LSN still readable.
    pub fn get_begin_lsn(&self) -> Lsn {
        self.log.borrow().begin_lsn()
    }

    /// SCN of the first readable entry.
    pub fn get_begin_scn(&self) -> Scn {
        self.log.borrow().begin_scn()
    }

    /// End of the durable log.
    pub fn get_end_lsn(&self) -> Lsn {
        self.log.borrow().end_lsn()
    }

    /// SCN of the last entry.
    pub fn get_end_scn(&self) -> Scn {
        self.log.borrow().end_scn()
    }

    /// Largest SCN the log ever held.
    pub fn get_max_scn(&self) -> Scn {
        self.log.borrow().max_scn()
    }

    /// End of the committed prefix.
    pub fn get_committed_end_lsn(&self) -> Lsn {
        self.log.borrow().committed_end()
    }

    /// Recycling watermark.
    pub fn get_base_lsn(&self) -> Lsn {
        self.log.borrow().base_lsn()
    }

    /// Bytes held by storage.
    pub fn disk_usage(&self) -> u64 {
        self.log.borrow().used_bytes()
    }

    /// See [`LogStore::locate_by_scn_coarsely`].
    pub fn locate_by_scn_coarsely(&self, scn: Scn) -> Result<Lsn, PalfError> {
        self.log.borrow().locate_by_scn_coarsely(scn)
    }

    /// See [`LogStore::locate_by_lsn_coarsely`].
    pub fn locate_by_lsn_coarsely(&self, lsn: Lsn) -> Result<Scn, PalfError> {
        self.log.borrow().locate_by_lsn_coarsely(lsn)
    }

    // =========================================================================
    // Reading and recycling
    // =========================================================================

    /// Iterate committed data entries from `lsn`.
    pub fn seek(&self, lsn: Lsn) -> EntryIterator<S> {
        EntryIterator::new(self.log.clone(), lsn, ReadMode::Committed)
    }

    /// Iterate every durable data entry from `lsn`, committed or not.
    pub fn seek_raw(&self, lsn: Lsn) -> EntryIterator<S> {
        EntryIterator::new(self.log.clone(), lsn, ReadMode::Raw)
    }

    /// Iterate committed groups from `lsn`.
    pub fn seek_group(&self, lsn: Lsn) -> GroupIterator<S> {
        GroupIterator::new(self.log.clone(), lsn, ReadMode::Committed)
    }

    /// Iterate committed groups from the first one holding an SCN `>= scn`.
    pub fn seek_group_by_scn(&self, scn: Scn) -> Result<GroupIterator<S>, PalfError> {
        let mut iter = GroupIterator::new(self.log.clone(), Lsn::MIN, ReadMode::Committed);
        iter.seek_scn(scn)?;
        Ok(iter)
    }

    /// Declare everything below `lsn` recyclable.
    pub fn advance_base_lsn(&self, lsn: Lsn) -> Result<(), PalfError> {
        let state = self.state.borrow();
        let mut log = self.log.borrow_mut();
        log.advance_base_lsn(lsn)?;
        self.persist_meta(&state, &mut log)?;
        debug!(group = %self.group_id, base = %lsn, "base lsn advanced");
        Ok(())
    }

    /// Reclaim segments below the base LSN.
    pub fn recycle(&self) -> Result<Option<Lsn>, PalfError> {
        self.log.borrow_mut().recycle()
    }

    // =========================================================================
    // Shared internals
    // =========================================================================

    pub(crate) fn persist_meta(
        &self,
        state: &ReplicaState,
        log: &mut LogStore<S>,
    ) -> Result<(), PalfError> {
        let meta = LogMeta {
            proposal_id: state.proposal_id,
            member_list: state.membership.applied_opt().cloned(),
            access_mode: state.access.applied,
            base_lsn: log.base_lsn(),
            committed_end: log.committed_end(),
        };
        log.storage_mut().store_meta(&meta)
    }

    /// Become a follower under `proposal_id` (never lowers the proposal id).
    ///
    /// A former leader drops the entries it never froze.
    pub(crate) fn step_down(
        &self,
        state: &mut ReplicaState,
        log: &mut LogStore<S>,
        proposal_id: ProposalId,
    ) -> Result<(), PalfError> {
        if state.is_leader() {
            log.discard_unfrozen()?;
            state.on_truncated(log.end_lsn());
            info!(
                group = %self.group_id,
                node = %self.self_id,
                old = %state.proposal_id,
                new = %proposal_id,
                "leader stepping down"
            );
        }
        if proposal_id > state.proposal_id {
            debug!(group = %self.group_id, node = %self.self_id, proposal = %proposal_id, "proposal id adopted");
        }
        state.proposal_id = state.proposal_id.max(proposal_id);
        state.election = ElectionState::Follower;
        state.leader = None;
        state.last_leader_contact = Instant::now();
        self.persist_meta(state, log)
    }

    /// Publish the commit watermark and proposal id to waiters.
    pub(crate) fn publish_progress(&self) {
        let proposal_id = self.state.borrow().proposal_id;
        let committed_end = self.log.borrow().committed_end();
        self.commit_tx.send_replace(CommitProgress {
            proposal_id,
            committed_end,
        });
    }

    /// Append an engine record, freeze it into a group and track it.
    pub(crate) fn append_engine_entry<T: Serialize>(
        &self,
        state: &mut ReplicaState,
        log: &mut LogStore<S>,
        kind: EntryKind,
        record: &T,
        min_scn: Scn,
    ) -> Result<LogEntry, PalfError> {
        let data = serde_json::to_vec(record)?;
        let entry = log.append(kind, data, min_scn)?;
        log.freeze(state.proposal_id)?;
        track_logged(state, &entry)?;
        Ok(entry)
    }

    /// Apply every engine record committed in `[from, committed_end)`.
    ///
    /// Returns `true` when this call completed the leader's reconfirm.
    pub(crate) fn apply_committed(
        &self,
        state: &mut ReplicaState,
        log: &mut LogStore<S>,
        from: Lsn,
    ) -> Result<bool, PalfError> {
        let to = log.committed_end();
        let pending: Vec<Lsn> = state.meta_entries.range(from..to).copied().collect();
        for lsn in pending {
            state.meta_entries.remove(&lsn);
            let Some(entry) = log.read_entry(lsn)? else {
                continue;
            };
            match entry.kind {
                EntryKind::Config => {
                    let list: MemberList = serde_json::from_slice(&entry.data)?;
                    info!(
                        group = %self.group_id,
                        node = %self.self_id,
                        version = %list.version,
                        acceptors = list.acceptors.len(),
                        learners = list.learners.len(),
                        replica_num = list.replica_num,
                        "member list committed"
                    );
                    state.membership.on_committed(lsn, list);
                }
                EntryKind::AccessMode => {
                    let meta: AccessModeMeta = serde_json::from_slice(&entry.data)?;
                    info!(
                        group = %self.group_id,
                        node = %self.self_id,
                        mode = %meta.mode,
                        version = meta.mode_version,
                        "access mode committed"
                    );
                    log.bump_max_scn(meta.ref_scn);
                    state.access.on_committed(lsn, meta);
                }
                EntryKind::Data => {}
            }
        }

        let mut reconfirmed = false;
        let proposal_id = state.proposal_id;
        if let Some(leader) = state.leader_mut() {
            if !leader.reconfirmed && to >= leader.reconfirm_end {
                leader.reconfirmed = true;
                reconfirmed = true;
                info!(group = %self.group_id, node = %self.self_id, proposal = %proposal_id, "leader reconfirmed");
            }
        }
        self.persist_meta(state, log)?;
        Ok(reconfirmed)
    }

    /// Wait until everything below `target` committed under `proposal_id`,
    /// driving replication rounds meanwhile.
    pub(crate) async fn wait_for_commit(
        &self,
        proposal_id: ProposalId,
        target: Lsn,
        timeout: Duration,
    ) -> Result<(), PalfError> {
        let mut progress = self.commit_tx.subscribe();
        let wait = async {
            loop {
                if self.commit_reached(proposal_id, target)? {
                    return Ok(());
                }
                match self.replicate_pending().await {
                    Ok(()) => {}
                    Err(PalfError::NotLeader) => return Err(PalfError::NotLeader),
                    Err(e) if e.is_retryable() => {
                        debug!(group = %self.group_id, error = %e, "replication round failed")
                    }
                    Err(e) => return Err(e),
                }
                if self.commit_reached(proposal_id, target)? {
                    return Ok(());
                }
                tokio::select! {
                    _ = progress.changed() => {
                        if progress.borrow().proposal_id != proposal_id {
                            return Err(PalfError::NotLeader);
                        }
                    }
                    _ = tokio::time::sleep(self.config.retry_interval) => {}
                }
            }
        };
        match tokio::time::timeout(timeout, wait).await {
            Ok(result) => result,
            Err(_) => {
                warn!(group = %self.group_id, target = %target, "commit wait timed out");
                Err(PalfError::Timeout)
            }
        }
    }

    fn commit_reached(&self, proposal_id: ProposalId, target: Lsn) -> Result<bool, PalfError> {
        let state = self.state.borrow();
        if state.proposal_id != proposal_id || !state.is_leader() {
            return Err(PalfError::NotLeader);
        }
        Ok(self.log.borrow().committed_end() >= target)
    }
}

/// Record an engine entry that just reached the local log.
pub(crate) fn track_logged(state: &mut ReplicaState, entry: &LogEntry) -> Result<(), PalfError> {
    match entry.kind {
        EntryKind::Config => {
            let list: MemberList = serde_json::from_slice(&entry.data)?;
            state.membership.on_logged(entry.lsn, list);
            state.meta_entries.insert(entry.lsn);
        }
        EntryKind::AccessMode => {
            state.access.on_logged(entry.lsn);
            state.meta_entries.insert(entry.lsn);
        }
        EntryKind::Data => {}
    }
    Ok(())
}

#[async_trait(?Send)]
impl<S: LogStorage + 'static> ReplicaEndpoint for PalfReplica<S> {
    fn on_push_log(&self, request: PushLogRequest) -> Result<PushLogResponse, PalfError> {
        self.handle_push_log(request)
    }

    fn on_prepare(&self, request: PrepareRequest) -> Result<PrepareResponse, PalfError> {
        self.handle_prepare(request)
    }

    fn on_fetch_log(&self, request: FetchLogRequest) -> Result<FetchLogResponse, PalfError> {
        self.handle_fetch_log(request)
    }

    async fn on_change_leader(&self, request: ChangeLeaderRequest) -> Result<(), PalfError> {
        self.handle_change_leader(request).await
    }
}
