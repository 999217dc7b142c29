//! Per-node entry point: the environment, handles and handle guards.
//!
//! A [`PalfEnv`] hosts every group replica of one node. It builds storage
//! through a factory, registers replicas with the transport and, when
//! `background_workers` is enabled, spawns their loops on the current
//! `LocalSet`. Callers work through a move-only [`PalfHandle`] and give it
//! back with [`PalfEnv::close`] or by dropping it; [`PalfHandleGuard`] ties
//! the giving back to a scope.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap};
use std::ops::Deref;
use std::rc::{Rc, Weak};
use std::time::Duration;

use tracing::{info, warn};

use crate::config::PalfConfig;
use crate::error::PalfError;
use crate::iterator::{EntryIterator, GroupIterator};
use crate::membership::{GroupMember, MemberList};
use crate::replica::PalfReplica;
use crate::storage::LogStorage;
use crate::transport::{LogTransport, ReplicaEndpoint};
use crate::types::{AccessMode, AppendOptions, GroupId, LogEntry, Lsn, NodeId, ProposalId, Role, Scn};

/// Told about the leader of a group whenever a replica learns it.
pub trait LocationCacheCb {
    /// `leader` is `None` when the replica lost track of the leader.
    fn on_leader_changed(&self, group_id: GroupId, leader: Option<NodeId>);
}

type StorageFactory<S> = Box<dyn Fn(GroupId) -> S>;

/// Every group replica of one node.
pub struct PalfEnv<S: LogStorage + 'static> {
    self_id: NodeId,
    config: PalfConfig,
    transport: Rc<dyn LogTransport>,
    storage_factory: StorageFactory<S>,
    replicas: RefCell<BTreeMap<GroupId, Rc<PalfReplica<S>>>>,
    open_handles: RefCell<HashMap<GroupId, Rc<Cell<usize>>>>,
    closed: Cell<bool>,
}

impl<S: LogStorage + 'static> PalfEnv<S> {
    /// An environment for node `self_id`. `storage_factory` provides the
    /// storage of each group when it is created.
    pub fn new(
        self_id: NodeId,
        config: PalfConfig,
        transport: Rc<dyn LogTransport>,
        storage_factory: impl Fn(GroupId) -> S + 'static,
    ) -> Result<Rc<Self>, PalfError> {
        config.validate()?;
        Ok(Rc::new(Self {
            self_id,
            config,
            transport,
            storage_factory: Box::new(storage_factory),
            replicas: RefCell::new(BTreeMap::new()),
            open_handles: RefCell::new(HashMap::new()),
            closed: Cell::new(false),
        }))
    }

    /// Node this environment runs on.
    pub fn node_id(&self) -> NodeId {
        self.self_id
    }

    /// Start hosting `group_id` and open a handle to it.
    ///
    /// Whatever the factory's storage already holds is recovered.
    pub fn create(&self, group_id: GroupId) -> Result<PalfHandle<S>, PalfError> {
        if self.closed.get() {
            return Err(PalfError::InvalidArgument("environment is shut down".into()));
        }
        if self.replicas.borrow().contains_key(&group_id) {
            return Err(PalfError::GroupExists(group_id));
        }
        let storage = (self.storage_factory)(group_id);
        let replica = PalfReplica::open(
            group_id,
            self.self_id,
            self.config.clone(),
            storage,
            self.transport.clone(),
        )?;
        let endpoint: Rc<dyn ReplicaEndpoint> = replica.clone();
        let endpoint: Weak<dyn ReplicaEndpoint> = Rc::downgrade(&endpoint);
        self.transport.register(self.self_id, group_id, endpoint);
        if self.config.background_workers {
            tokio::task::spawn_local(replica.clone().run_background());
        }
        self.replicas.borrow_mut().insert(group_id, replica);
        info!(node = %self.self_id, group = %group_id, "group created");
        self.open(group_id)
    }

    /// Open another handle to a hosted group.
    pub fn open(&self, group_id: GroupId) -> Result<PalfHandle<S>, PalfError> {
        let replica = self
            .replicas
            .borrow()
            .get(&group_id)
            .cloned()
            .ok_or(PalfError::GroupNotExist(group_id))?;
        let open = self
            .open_handles
            .borrow_mut()
            .entry(group_id)
            .or_default()
            .clone();
        open.set(open.get() + 1);
        Ok(PalfHandle {
            replica: Some(replica),
            open,
        })
    }

    /// Give a handle back. Closing an invalid handle does nothing.
    pub fn close(&self, handle: &mut PalfHandle<S>) {
        handle.release();
    }

    /// Stop hosting `group_id`. Handles still open become useless but stay
    /// safe to use: calls keep reaching the stopped replica.
    pub fn remove(&self, group_id: GroupId) -> Result<(), PalfError> {
        let replica = self
            .replicas
            .borrow_mut()
            .remove(&group_id)
            .ok_or(PalfError::GroupNotExist(group_id))?;
        replica.stop();
        self.transport.unregister(self.self_id, group_id);
        let still_open = self
            .open_handles
            .borrow_mut()
            .remove(&group_id)
            .map_or(0, |open| open.get());
        if still_open > 0 {
            warn!(node = %self.self_id, group = %group_id, still_open, "group removed with open handles");
        }
        info!(node = %self.self_id, group = %group_id, "group removed");
        Ok(())
    }

    /// Hosted groups, in id order.
    pub fn group_ids(&self) -> Vec<GroupId> {
        self.replicas.borrow().keys().copied().collect()
    }

    /// Handles currently open on `group_id`.
    pub fn open_handle_count(&self, group_id: GroupId) -> usize {
        self.open_handles
            .borrow()
            .get(&group_id)
            .map_or(0, |open| open.get())
    }

    /// Bytes held by every hosted group.
    pub fn disk_usage(&self) -> u64 {
        self.replicas
            .borrow()
            .values()
            .map(|replica| replica.disk_usage())
            .sum()
    }

    /// Reclaim recyclable segments of every hosted group.
    pub fn recycle(&self) -> Result<(), PalfError> {
        let replicas: Vec<Rc<PalfReplica<S>>> = self.replicas.borrow().values().cloned().collect();
        for replica in replicas {
            replica.recycle()?;
        }
        Ok(())
    }

    /// Stop every group and refuse new ones.
    pub fn shutdown(&self) {
        self.closed.set(true);
        for group_id in self.group_ids() {
            if let Err(e) = self.remove(group_id) {
                warn!(node = %self.self_id, group = %group_id, error = %e, "remove on shutdown failed");
            }
        }
    }
}

/// Caller access to one group on one node.
///
/// Move-only. Every call fails with [`PalfError::InvalidArgument`] once the
/// handle was closed. Dropping an open handle closes it.
pub struct PalfHandle<S: LogStorage + 'static> {
    replica: Option<Rc<PalfReplica<S>>>,
    /// Open handle count of the group, shared with the env.
    open: Rc<Cell<usize>>,
}

impl<S: LogStorage + 'static> PalfHandle<S> {
    /// Whether the handle still refers to a group.
    pub fn is_valid(&self) -> bool {
        self.replica.is_some()
    }

    fn release(&mut self) {
        if self.replica.take().is_some() {
            self.open.set(self.open.get().saturating_sub(1));
        }
    }

    fn replica(&self) -> Result<&PalfReplica<S>, PalfError> {
        self.replica
            .as_deref()
            .ok_or_else(|| PalfError::InvalidArgument("handle is closed".into()))
    }

    /// Group the handle refers to.
    pub fn group_id(&self) -> Result<GroupId, PalfError> {
        Ok(self.replica()?.group_id())
    }

    // Writes

    /// See [`PalfReplica::append`].
    pub async fn append(
        &self,
        options: AppendOptions,
        data: Vec<u8>,
        min_scn: Scn,
    ) -> Result<(Lsn, Scn), PalfError> {
        self.replica()?.append(options, data, min_scn).await
    }

    /// See [`PalfReplica::raw_write`].
    pub async fn raw_write(
        &self,
        options: AppendOptions,
        lsn: Lsn,
        entries: Vec<LogEntry>,
    ) -> Result<(), PalfError> {
        self.replica()?.raw_write(options, lsn, entries).await
    }

    // Reads and recycling

    /// See [`PalfReplica::seek`].
    pub fn seek(&self, lsn: Lsn) -> Result<EntryIterator<S>, PalfError> {
        Ok(self.replica()?.seek(lsn))
    }

    /// See [`PalfReplica::seek_raw`].
    pub fn seek_raw(&self, lsn: Lsn) -> Result<EntryIterator<S>, PalfError> {
        Ok(self.replica()?.seek_raw(lsn))
    }

    /// See [`PalfReplica::seek_group`].
    pub fn seek_group(&self, lsn: Lsn) -> Result<GroupIterator<S>, PalfError> {
        Ok(self.replica()?.seek_group(lsn))
    }

    /// See [`PalfReplica::seek_group_by_scn`].
    pub fn seek_group_by_scn(&self, scn: Scn) -> Result<GroupIterator<S>, PalfError> {
        self.replica()?.seek_group_by_scn(scn)
    }

    /// See [`PalfReplica::advance_base_lsn`].
    pub fn advance_base_lsn(&self, lsn: Lsn) -> Result<(), PalfError> {
        self.replica()?.advance_base_lsn(lsn)
    }

    /// See [`PalfReplica::recycle`].
    pub fn recycle(&self) -> Result<Option<Lsn>, PalfError> {
        self.replica()?.recycle()
    }

    /// See [`PalfReplica::locate_by_scn_coarsely`].
    pub fn locate_by_scn_coarsely(&self, scn: Scn) -> Result<Lsn, PalfError> {
        self.replica()?.locate_by_scn_coarsely(scn)
    }

    /// See [`PalfReplica::locate_by_lsn_coarsely`].
    pub fn locate_by_lsn_coarsely(&self, lsn: Lsn) -> Result<Scn, PalfError> {
        self.replica()?.locate_by_lsn_coarsely(lsn)
    }

    // Observers

    /// See [`PalfReplica::get_begin_lsn`].
    pub fn get_begin_lsn(&self) -> Result<Lsn, PalfError> {
        Ok(self.replica()?.get_begin_lsn())
    }

    /// See [`PalfReplica::get_begin_scn`].
    pub fn get_begin_scn(&self) -> Result<Scn, PalfError> {
        Ok(self.replica()?.get_begin_scn())
    }

    /// See [`PalfReplica::get_end_lsn`].
    pub fn get_end_lsn(&self) -> Result<Lsn, PalfError> {
        Ok(self.replica()?.get_end_lsn())
    }

    /// See [`PalfReplica::get_end_scn`].
    pub fn get_end_scn(&self) -> Result<Scn, PalfError> {
        Ok(self.replica()?.get_end_scn())
    }

    /// See [`PalfReplica::get_max_scn`].
    pub fn get_max_scn(&self) -> Result<Scn, PalfError> {
        Ok(self.replica()?.get_max_scn())
    }

    /// See [`PalfReplica::get_committed_end_lsn`].
    pub fn get_committed_end_lsn(&self) -> Result<Lsn, PalfError> {
        Ok(self.replica()?.get_committed_end_lsn())
    }

    /// See [`PalfReplica::get_base_lsn`].
    pub fn get_base_lsn(&self) -> Result<Lsn, PalfError> {
        Ok(self.replica()?.get_base_lsn())
    }

    /// See [`PalfReplica::get_role`].
    pub fn get_role(&self) -> Result<(Role, ProposalId, bool), PalfError> {
        Ok(self.replica()?.get_role())
    }

    /// See [`PalfReplica::get_leader`].
    pub fn get_leader(&self) -> Result<Option<NodeId>, PalfError> {
        Ok(self.replica()?.get_leader())
    }

    /// See [`PalfReplica::get_access_mode`].
    pub fn get_access_mode(&self) -> Result<(u64, AccessMode), PalfError> {
        Ok(self.replica()?.get_access_mode())
    }

    /// See [`PalfReplica::get_paxos_member_list`].
    pub fn get_paxos_member_list(&self) -> Result<MemberList, PalfError> {
        self.replica()?.get_paxos_member_list()
    }

    // Roles and leadership

    /// See [`PalfReplica::campaign`].
    pub async fn campaign(&self) -> Result<(), PalfError> {
        self.replica()?.campaign().await
    }

    /// See [`PalfReplica::change_leader_to`].
    pub async fn change_leader_to(&self, target: NodeId) -> Result<(), PalfError> {
        self.replica()?.change_leader_to(target).await
    }

    /// See [`PalfReplica::change_access_mode`].
    pub async fn change_access_mode(
        &self,
        proposal_id: ProposalId,
        mode_version: u64,
        mode: AccessMode,
        ref_scn: Scn,
        timeout: Duration,
    ) -> Result<(), PalfError> {
        self.replica()?
            .change_access_mode(proposal_id, mode_version, mode, ref_scn, timeout)
            .await
    }

    // Membership

    /// See [`PalfReplica::set_initial_member_list`].
    pub fn set_initial_member_list(
        &self,
        members: Vec<GroupMember>,
        replica_num: usize,
    ) -> Result<(), PalfError> {
        self.replica()?.set_initial_member_list(members, replica_num)
    }

    /// See [`PalfReplica::add_member`].
    pub async fn add_member(
        &self,
        member: GroupMember,
        replica_num: usize,
        timeout: Duration,
    ) -> Result<(), PalfError> {
        self.replica()?.add_member(member, replica_num, timeout).await
    }

    /// See [`PalfReplica::remove_member`].
    pub async fn remove_member(
        &self,
        member: GroupMember,
        replica_num: usize,
        timeout: Duration,
    ) -> Result<(), PalfError> {
        self.replica()?
            .remove_member(member, replica_num, timeout)
            .await
    }

    /// See [`PalfReplica::replace_member`].
    pub async fn replace_member(
        &self,
        added: GroupMember,
        removed: GroupMember,
        timeout: Duration,
    ) -> Result<(), PalfError> {
        self.replica()?
            .replace_member(added, removed, timeout)
            .await
    }

    /// See [`PalfReplica::change_replica_num`].
    pub async fn change_replica_num(
        &self,
        current_members: &[GroupMember],
        current_replica_num: usize,
        new_replica_num: usize,
        timeout: Duration,
    ) -> Result<(), PalfError> {
        self.replica()?
            .change_replica_num(current_members, current_replica_num, new_replica_num, timeout)
            .await
    }

    /// See [`PalfReplica::add_learner`].
    pub async fn add_learner(&self, learner: GroupMember, timeout: Duration) -> Result<(), PalfError> {
        self.replica()?.add_learner(learner, timeout).await
    }

    /// See [`PalfReplica::remove_learner`].
    pub async fn remove_learner(
        &self,
        learner: GroupMember,
        timeout: Duration,
    ) -> Result<(), PalfError> {
        self.replica()?.remove_learner(learner, timeout).await
    }

    /// See [`PalfReplica::switch_learner_to_acceptor`].
    pub async fn switch_learner_to_acceptor(
        &self,
        learner: GroupMember,
        replica_num: usize,
        timeout: Duration,
    ) -> Result<(), PalfError> {
        self.replica()?
            .switch_learner_to_acceptor(learner, replica_num, timeout)
            .await
    }

    /// See [`PalfReplica::switch_acceptor_to_learner`].
    pub async fn switch_acceptor_to_learner(
        &self,
        member: GroupMember,
        replica_num: usize,
        timeout: Duration,
    ) -> Result<(), PalfError> {
        self.replica()?
            .switch_acceptor_to_learner(member, replica_num, timeout)
            .await
    }

    /// See [`PalfReplica::set_paxos_member_region_map`].
    pub fn set_paxos_member_region_map(
        &self,
        regions: HashMap<NodeId, String>,
    ) -> Result<(), PalfError> {
        self.replica()?.set_paxos_member_region_map(regions);
        Ok(())
    }

    /// See [`PalfReplica::set_region`].
    pub fn set_region(&self, region: impl Into<String>) -> Result<(), PalfError> {
        self.replica()?.set_region(region);
        Ok(())
    }

    /// See [`PalfReplica::set_location_cache_cb`].
    pub fn set_location_cache_cb(&self, cb: Rc<dyn LocationCacheCb>) -> Result<(), PalfError> {
        self.replica()?.set_location_cache_cb(cb);
        Ok(())
    }

    /// See [`PalfReplica::reset_location_cache_cb`].
    pub fn reset_location_cache_cb(&self) -> Result<(), PalfError> {
        self.replica()?.reset_location_cache_cb();
        Ok(())
    }
}

/// Owns a handle and closes it exactly once.
pub struct PalfHandleGuard<S: LogStorage + 'static> {
    env: Rc<PalfEnv<S>>,
    handle: PalfHandle<S>,
}

impl<S: LogStorage + 'static> PalfHandleGuard<S> {
    /// Take ownership of `handle`, to be closed through `env`.
    pub fn acquire(env: Rc<PalfEnv<S>>, handle: PalfHandle<S>) -> Self {
        Self { env, handle }
    }

    /// Close the handle now. Later calls do nothing.
    pub fn reset(&mut self) {
        if self.handle.is_valid() {
            self.env.close(&mut self.handle);
        }
    }

    /// Whether the guard still holds an open handle.
    pub fn is_valid(&self) -> bool {
        self.handle.is_valid()
    }
}

impl<S: LogStorage + 'static> Deref for PalfHandleGuard<S> {
    type Target = PalfHandle<S>;

    fn deref(&self) -> &Self::Target {
        &self.handle
    }
}

impl<S: LogStorage + 'static> Drop for PalfHandle<S> {
    fn drop(&mut self) {
        self.release();
    }
}

impl<S: LogStorage + 'static> Drop for PalfHandleGuard<S> {
    fn drop(&mut self) {
        self.reset();
    }
}
