//! Leader election, leadership transfer and the background loops.
//!
//! ## Campaign
//!
//! ```text
//! Candidate                                   Acceptors
//!   │ pid = own pid + 1, persisted              │
//!   │── Prepare(pid) ──────────────────────────>│ pid > own? promise, adopt pid
//!   │<── (granted, end_lsn, last group pid) ────│
//!   │ quorum of every active list?              │
//!   │ pull the freshest log (catch-up)          │
//!   │ log reconfirm config entry                │
//!   │── PushLog ... ───────────────────────────>│
//!   │ reconfirm entry committed: serve appends  │
//! ```
//!
//! The freshest log is the one with the highest last-group proposal id, then
//! the longest. It holds every committed entry: each commit was acknowledged
//! by a quorum, every later leader pulled it before leading, and the prepare
//! quorum intersects the commit quorum.
//!
//! ## Raft Comparison
//!
//! | Aspect | Raft | PALF |
//! |---|---|---|
//! | **Vote request** | RequestVote | Prepare |
//! | **Vote rule** | candidate log at least as fresh | any higher proposal id from a voter |
//! | **Stale log winner** | impossible | pulls the freshest log from a promiser |
//! | **First entry of a term** | no-op | reconfirm config entry |
//! | **Leader transfer** | TimeoutNow | ChangeLeader after the target caught up |

use std::collections::HashSet;
use std::rc::Rc;

use futures::future::join_all;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::PalfError;
use crate::lease::{election_jitter, LeaseState};
use crate::messages::{ChangeLeaderRequest, PrepareRequest, PrepareResponse};
use crate::replica::{ElectionState, LeaderState, PalfReplica};
use crate::storage::LogStorage;
use crate::types::{EntryKind, Lsn, NodeId, ProposalId, Scn};

impl<S: LogStorage + 'static> PalfReplica<S> {
    // =========================================================================
    // Campaign
    // =========================================================================

    /// Run for leader right away.
    ///
    /// Returns once this replica leads with its reconfirm entry committed.
    /// Fails with [`PalfError::NotLeader`] when no quorum promised or a
    /// higher proposal id showed up, and with [`PalfError::Timeout`] when the
    /// reconfirm entry doesn't commit within `reconfirm_timeout`.
    pub async fn campaign(&self) -> Result<(), PalfError> {
        let (proposal_id, voters) = {
            let mut state = self.state.borrow_mut();
            if !state.membership.is_voter(self.self_id) {
                return Err(PalfError::InvalidArgument(format!(
                    "{} is not an acceptor of {}",
                    self.self_id, self.group_id
                )));
            }
            match state.election {
                ElectionState::Leader(_) => return Ok(()),
                ElectionState::Candidate => return Err(PalfError::NotLeader),
                ElectionState::Follower => {}
            }
            let mut log = self.log.borrow_mut();
            let proposal_id = state.proposal_id.next();
            self.step_down(&mut state, &mut log, proposal_id)?;
            state.election = ElectionState::Candidate;

            let mut voters: Vec<NodeId> = Vec::new();
            for list in state.membership.quorum_lists() {
                for member in &list.acceptors {
                    if member.node != self.self_id && !voters.contains(&member.node) {
                        voters.push(member.node);
                    }
                }
            }
            (proposal_id, voters)
        };
        info!(group = %self.group_id, node = %self.self_id, proposal = %proposal_id, "campaign started");

        let prepares = voters.into_iter().map(|peer| async move {
            let request = PrepareRequest {
                group_id: self.group_id,
                candidate: self.self_id,
                proposal_id,
            };
            (peer, self.transport.prepare(self.self_id, peer, request).await)
        });
        let replies = join_all(prepares).await;

        let donor = self.count_promises(proposal_id, replies)?;
        let elected = async {
            if let Some(donor) = donor {
                self.catch_up_from(donor, proposal_id).await?;
            }
            self.become_leader(proposal_id)
        };
        let reconfirm_end = match elected.await {
            Ok(end) => end,
            Err(e) => {
                self.abandon_campaign(proposal_id);
                return Err(e);
            }
        };
        self.replicate_notify.notify_one();
        self.wait_for_commit(proposal_id, reconfirm_end, self.config.reconfirm_timeout)
            .await
    }

    /// Check the prepare quorum and pick the replica to pull from, if any
    /// holds a fresher log than this one.
    fn count_promises(
        &self,
        proposal_id: ProposalId,
        replies: Vec<(NodeId, Result<PrepareResponse, PalfError>)>,
    ) -> Result<Option<NodeId>, PalfError> {
        let mut state = self.state.borrow_mut();
        if state.proposal_id != proposal_id
            || !matches!(state.election, ElectionState::Candidate)
        {
            return Err(PalfError::NotLeader);
        }
        let mut log = self.log.borrow_mut();

        let mut granted = HashSet::from([self.self_id]);
        let mut freshest = (log.last_group_proposal_id(), log.frozen_end());
        let mut donor = None;
        for (peer, reply) in replies {
            let response = match reply {
                Ok(response) => response,
                Err(e) => {
                    debug!(group = %self.group_id, %peer, error = %e, "prepare failed");
                    continue;
                }
            };
            if response.proposal_id > proposal_id {
                info!(
                    group = %self.group_id,
                    %peer,
                    higher = %response.proposal_id,
                    "campaign fenced by a higher proposal id"
                );
                self.step_down(&mut state, &mut log, response.proposal_id)?;
                return Err(PalfError::NotLeader);
            }
            if !response.granted {
                continue;
            }
            granted.insert(peer);
            if response.freshness() > freshest {
                freshest = response.freshness();
                donor = Some(peer);
            }
        }

        if !state.membership.has_quorum(&granted) {
            warn!(
                group = %self.group_id,
                proposal = %proposal_id,
                promises = granted.len(),
                "campaign lost, no quorum"
            );
            state.election = ElectionState::Follower;
            return Err(PalfError::NotLeader);
        }
        Ok(donor)
    }

    fn abandon_campaign(&self, proposal_id: ProposalId) {
        let mut state = self.state.borrow_mut();
        if state.proposal_id == proposal_id && matches!(state.election, ElectionState::Candidate) {
            state.election = ElectionState::Follower;
        }
    }

    /// Take the lead under `proposal_id` and log the reconfirm entry.
    /// Returns the end of that entry.
    fn become_leader(&self, proposal_id: ProposalId) -> Result<Lsn, PalfError> {
        let mut state = self.state.borrow_mut();
        if state.proposal_id != proposal_id
            || !matches!(state.election, ElectionState::Candidate)
        {
            return Err(PalfError::NotLeader);
        }
        let mut log = self.log.borrow_mut();
        let Some(latest) = state.membership.latest() else {
            return Err(PalfError::InvalidArgument(
                "member list not initialized".into(),
            ));
        };
        let mut reconfirm = latest.clone();
        reconfirm.version = latest.version.bump(proposal_id);

        state.membership.reset_catching_up();
        let entry = self.append_engine_entry(
            &mut state,
            &mut log,
            EntryKind::Config,
            &reconfirm,
            Scn::MIN,
        )?;

        let mut lease = LeaseState::new();
        lease.renew(Instant::now(), self.config.leader_lease);
        state.election = ElectionState::Leader(LeaderState {
            reconfirm_end: entry.end_lsn(),
            reconfirmed: false,
            transferring: false,
            progress: Default::default(),
            lease,
        });
        state.leader = Some(self.self_id);
        info!(
            group = %self.group_id,
            node = %self.self_id,
            proposal = %proposal_id,
            reconfirm = %entry.lsn,
            version = %reconfirm.version,
            "leader elected, reconfirming"
        );
        Ok(entry.end_lsn())
    }

    pub(crate) fn handle_prepare(
        &self,
        request: PrepareRequest,
    ) -> Result<PrepareResponse, PalfError> {
        let (response, was_leader) = {
            let mut state = self.state.borrow_mut();
            let mut log = self.log.borrow_mut();
            let was_leader = state.is_leader();
            let known_voter = !state.membership.is_initialized()
                || state.membership.is_voter(request.candidate);
            let granted = request.proposal_id > state.proposal_id && known_voter;
            if granted {
                debug!(
                    group = %self.group_id,
                    candidate = %request.candidate,
                    proposal = %request.proposal_id,
                    "prepare granted"
                );
                self.step_down(&mut state, &mut log, request.proposal_id)?;
            } else if !known_voter {
                debug!(group = %self.group_id, candidate = %request.candidate, "prepare from a non-voter refused");
            }
            let response = PrepareResponse {
                proposal_id: state.proposal_id,
                granted,
                end_lsn: log.frozen_end(),
                last_proposal_id: log.last_group_proposal_id(),
            };
            (response, was_leader && granted)
        };
        if was_leader {
            self.publish_progress();
            self.notify_leader(None);
        }
        Ok(response)
    }

    // =========================================================================
    // Leadership transfer
    // =========================================================================

    /// Hand leadership to `target`.
    ///
    /// Appends are refused while the transfer runs. The leader pushes until
    /// `target` holds the whole log, then asks it to campaign. Fails with
    /// [`PalfError::NotMaster`] when this replica isn't a serving leader or
    /// already transfers, and with [`PalfError::Timeout`] when `target`
    /// doesn't catch up within `leader_transfer_timeout`.
    pub async fn change_leader_to(&self, target: NodeId) -> Result<(), PalfError> {
        let proposal_id = {
            let mut state = self.state.borrow_mut();
            let proposal_id = state.serving_leader().map_err(|_| PalfError::NotMaster)?;
            if target == self.self_id {
                return Ok(());
            }
            if !state.membership.applied()?.is_acceptor(target) {
                return Err(PalfError::InvalidArgument(format!(
                    "{target} is not an acceptor"
                )));
            }
            if let Some(leader) = state.leader_mut() {
                leader.transferring = true;
            }
            proposal_id
        };
        info!(group = %self.group_id, from = %self.self_id, to = %target, "leader transfer started");

        let result = self.transfer_leader(proposal_id, target).await;
        if let Err(e) = &result {
            warn!(group = %self.group_id, to = %target, error = %e, "leader transfer failed");
            let mut state = self.state.borrow_mut();
            if state.proposal_id == proposal_id {
                if let Some(leader) = state.leader_mut() {
                    leader.transferring = false;
                }
            }
        }
        result
    }

    async fn transfer_leader(&self, proposal_id: ProposalId, target: NodeId) -> Result<(), PalfError> {
        let catch_up = async {
            loop {
                self.replicate_pending().await?;
                let caught_up = {
                    let state = self.state.borrow();
                    if state.proposal_id != proposal_id {
                        return Err(PalfError::NotMaster);
                    }
                    let end = self.log.borrow().end_lsn();
                    match &state.election {
                        ElectionState::Leader(leader) => leader
                            .progress
                            .get(&target)
                            .is_some_and(|p| p.match_lsn >= end),
                        _ => return Err(PalfError::NotMaster),
                    }
                };
                if caught_up {
                    return Ok(());
                }
                tokio::time::sleep(self.config.retry_interval).await;
            }
        };
        tokio::time::timeout(self.config.leader_transfer_timeout, catch_up)
            .await
            .map_err(|_| PalfError::Timeout)??;

        let request = ChangeLeaderRequest {
            group_id: self.group_id,
            leader: self.self_id,
            proposal_id,
        };
        self.transport
            .change_leader(self.self_id, target, request)
            .await
    }

    pub(crate) async fn handle_change_leader(
        &self,
        request: ChangeLeaderRequest,
    ) -> Result<(), PalfError> {
        {
            let state = self.state.borrow();
            if request.proposal_id < state.proposal_id {
                return Err(PalfError::NotMaster);
            }
        }
        info!(group = %self.group_id, node = %self.self_id, from = %request.leader, "taking over leadership");
        self.campaign().await
    }

    // =========================================================================
    // Background loops
    // =========================================================================

    /// Drive timers and replication until [`PalfReplica::stop`].
    pub async fn run_background(self: Rc<Self>) {
        tokio::join!(self.run_election_loop(), self.run_replication_loop());
        debug!(group = %self.group_id, node = %self.self_id, "background loops stopped");
    }

    async fn run_election_loop(&self) {
        while !self.stopped.get() {
            tokio::select! {
                _ = self.shutdown.notified() => break,
                _ = tokio::time::sleep(self.config.heartbeat_interval) => {}
            }
            if self.check_leader_lease() {
                continue;
            }
            if self.election_due() {
                if let Err(e) = self.campaign().await {
                    debug!(group = %self.group_id, node = %self.self_id, error = %e, "campaign failed");
                }
            }
        }
    }

    async fn run_replication_loop(&self) {
        while !self.stopped.get() {
            tokio::select! {
                _ = self.shutdown.notified() => break,
                _ = self.replicate_notify.notified() => {}
                _ = tokio::time::sleep(self.config.heartbeat_interval) => {}
            }
            if let Err(e) = self.replicate_pending().await {
                debug!(group = %self.group_id, error = %e, "replication round failed");
            }
            if let Err(e) = self.recycle() {
                warn!(group = %self.group_id, error = %e, "recycling failed");
            }
        }
    }

    /// Step down once the lease ran out. Returns whether it did.
    fn check_leader_lease(&self) -> bool {
        {
            let mut state = self.state.borrow_mut();
            let expired = match &state.election {
                ElectionState::Leader(leader) => !leader.lease.is_valid(Instant::now()),
                _ => false,
            };
            if !expired {
                return false;
            }
            warn!(group = %self.group_id, node = %self.self_id, proposal = %state.proposal_id, "leader lease expired");
            let proposal_id = state.proposal_id;
            let mut log = self.log.borrow_mut();
            if let Err(e) = self.step_down(&mut state, &mut log, proposal_id) {
                warn!(group = %self.group_id, error = %e, "step down failed to persist");
            }
        }
        self.publish_progress();
        self.notify_leader(None);
        true
    }

    /// Whether this follower heard nothing from a leader for too long.
    fn election_due(&self) -> bool {
        let mut state = self.state.borrow_mut();
        if !matches!(state.election, ElectionState::Follower)
            || !state.membership.is_voter(self.self_id)
        {
            return false;
        }
        let silence = state.last_leader_contact.elapsed();
        if silence < self.config.election_timeout + state.election_jitter {
            return false;
        }
        state.election_jitter = election_jitter(self.config.election_timeout);
        info!(
            group = %self.group_id,
            node = %self.self_id,
            silence_ms = silence.as_millis() as u64,
            "no leader contact, campaigning"
        );
        true
    }
}
