//! Leader append pipeline and follower log matching.
//!
//! ## Push round
//!
//! ```text
//! Leader                                       Replica
//!   │ freeze tail into a group                   │
//!   │── PushLog(pid, prev_lsn, prev_pid, groups) >│ prev matches?
//!   │                                            │  yes: truncate divergent suffix,
//!   │                                            │       append groups, commit up to
//!   │                                            │       min(leader committed, matched)
//!   │<── (pid, accepted, end_lsn) ───────────────│  no:  hint where to resume
//!   │ match/next updated                         │
//!   │ commit = joint quorum of match_lsn         │
//! ```
//!
//! A push with an empty `groups` is a heartbeat: it carries the commit
//! watermark and keeps the follower's election timer quiet.
//!
//! ## Raft Comparison
//!
//! | Aspect | Raft | PALF |
//! |---|---|---|
//! | **Unit** | entry | group (entries frozen together under one proposal id) |
//! | **Consistency check** | `prevLogIndex`/`prevLogTerm` | `prev_lsn`/`prev_proposal_id` |
//! | **Commit rule** | majority, current-term entry | joint majority, covering the term's reconfirm entry |
//! | **Rejection hint** | conflict index (optimization) | follower's committed end or log end |

use std::collections::{HashMap, HashSet};

use futures::future::join_all;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::error::PalfError;
use crate::log_store::LogStore;
use crate::messages::{PushLogRequest, PushLogResponse};
use crate::replica::{track_logged, ElectionState, PalfReplica, PeerProgress, ReplicaState};
use crate::storage::LogStorage;
use crate::types::{
    AccessMode, AppendOptions, EntryKind, GroupHeader, LogEntry, LogGroup, Lsn, NodeId,
    ProposalId, Scn, LOG_ENTRY_HEADER_SIZE,
};

/// What a finished push round changed.
#[derive(Debug, Default)]
struct RoundOutcome {
    committed: bool,
    reconfirmed: bool,
    stepped_down: bool,
}

impl<S: LogStorage + 'static> PalfReplica<S> {
    // =========================================================================
    // Caller writes
    // =========================================================================

    /// Append `data` with an SCN of at least `min_scn`.
    ///
    /// Leader only, in [`AccessMode::Append`]. Returns the assigned LSN and
    /// SCN. A blocking append returns once the entry committed; a
    /// non-blocking one right after local persistence, and fails with
    /// [`PalfError::Backpressure`] when too many bytes wait for commit.
    pub async fn append(
        &self,
        options: AppendOptions,
        data: Vec<u8>,
        min_scn: Scn,
    ) -> Result<(Lsn, Scn), PalfError> {
        let (proposal_id, entry) = {
            let state = self.state.borrow();
            let proposal_id = state.serving_leader()?;
            let current = state.access.applied.mode;
            if current != AccessMode::Append {
                return Err(PalfError::AccessModeMismatch { current });
            }
            let mut log = self.log.borrow_mut();
            if options == AppendOptions::NonBlocking {
                let inflight = log.inflight_bytes() + LOG_ENTRY_HEADER_SIZE + data.len() as u64;
                if inflight > self.config.max_inflight_bytes {
                    debug!(group = %self.group_id, inflight, "append refused, too many bytes in flight");
                    return Err(PalfError::Backpressure {
                        inflight,
                        limit: self.config.max_inflight_bytes,
                    });
                }
            }
            let entry = log.append(EntryKind::Data, data, min_scn)?;
            (proposal_id, entry)
        };
        trace!(group = %self.group_id, lsn = %entry.lsn, scn = %entry.scn, "entry appended");
        self.replicate_notify.notify_one();

        if let AppendOptions::Blocking { timeout } = options {
            self.wait_for_commit(proposal_id, entry.end_lsn(), timeout)
                .await?;
        }
        Ok((entry.lsn, entry.scn))
    }

    /// Write entries that already carry their LSN and SCN.
    ///
    /// Leader only, in [`AccessMode::RawWrite`]. The entries must be data
    /// entries, contiguous, start exactly at the end of the log and have
    /// non-decreasing SCNs not below the last one logged. They form one group
    /// and commit through the normal majority rule.
    pub async fn raw_write(
        &self,
        options: AppendOptions,
        lsn: Lsn,
        entries: Vec<LogEntry>,
    ) -> Result<(), PalfError> {
        let (proposal_id, end) = {
            let state = self.state.borrow();
            let proposal_id = state.serving_leader()?;
            let current = state.access.applied.mode;
            if current != AccessMode::RawWrite {
                return Err(PalfError::AccessModeMismatch { current });
            }
            let mut log = self.log.borrow_mut();
            log.freeze(proposal_id)?;
            let header = raw_group_header(&log, proposal_id, lsn, &entries)?;
            log.append_group(&LogGroup { header, entries })?;
            debug!(
                group = %self.group_id,
                start = %header.start_lsn,
                end = %header.end_lsn,
                entries = header.entry_count,
                "raw write logged"
            );
            (proposal_id, header.end_lsn)
        };
        self.replicate_notify.notify_one();

        if let AppendOptions::Blocking { timeout } = options {
            self.wait_for_commit(proposal_id, end, timeout).await?;
        }
        Ok(())
    }

    // =========================================================================
    // Leader side
    // =========================================================================

    /// Run one push round to every peer. No-op unless leader.
    pub(crate) async fn replicate_pending(&self) -> Result<(), PalfError> {
        let Some((proposal_id, requests)) = self.prepare_push_round()? else {
            return Ok(());
        };
        let pushes = requests.into_iter().map(|(peer, request)| async move {
            let reply = self.transport.push_log(self.self_id, peer, request).await;
            (peer, reply)
        });
        let replies = join_all(pushes).await;

        let outcome = self.finish_push_round(proposal_id, replies)?;
        if outcome.committed {
            self.publish_progress();
        }
        if outcome.reconfirmed {
            self.notify_leader(Some(self.self_id));
        }
        if outcome.stepped_down {
            self.publish_progress();
            self.notify_leader(None);
            return Err(PalfError::NotLeader);
        }
        Ok(())
    }

    fn prepare_push_round(
        &self,
    ) -> Result<Option<(ProposalId, Vec<(NodeId, PushLogRequest)>)>, PalfError> {
        let mut state = self.state.borrow_mut();
        if !state.is_leader() {
            return Ok(None);
        }
        let proposal_id = state.proposal_id;
        let peers = state.membership.peers(self.self_id);
        let mut log = self.log.borrow_mut();
        log.freeze(proposal_id)?;

        let begin = log.begin_lsn();
        let frozen_end = log.frozen_end();
        let committed_end = log.committed_end();
        let Some(leader) = state.leader_mut() else {
            return Ok(None);
        };

        let mut requests = Vec::with_capacity(peers.len());
        for peer in peers {
            let progress = leader
                .progress
                .entry(peer)
                .or_insert_with(|| PeerProgress::new(frozen_end));
            let next = log.align_to_group(progress.next_lsn.max(begin));
            progress.next_lsn = next;
            let request = PushLogRequest {
                group_id: self.group_id,
                leader: self.self_id,
                proposal_id,
                prev_lsn: next,
                prev_proposal_id: log.group_ending_at(next).map(|g| g.proposal_id),
                groups: log.groups_from(next, self.config.max_push_bytes)?,
                committed_end,
            };
            requests.push((peer, request));
        }
        Ok(Some((proposal_id, requests)))
    }

    fn finish_push_round(
        &self,
        proposal_id: ProposalId,
        replies: Vec<(NodeId, Result<PushLogResponse, PalfError>)>,
    ) -> Result<RoundOutcome, PalfError> {
        let mut state = self.state.borrow_mut();
        if state.proposal_id != proposal_id || !state.is_leader() {
            return Err(PalfError::NotLeader);
        }
        let mut log = self.log.borrow_mut();
        let mut outcome = RoundOutcome::default();

        let mut responders = HashSet::from([self.self_id]);
        for (peer, reply) in replies {
            let response = match reply {
                Ok(response) => response,
                Err(e) => {
                    trace!(group = %self.group_id, %peer, error = %e, "push failed");
                    continue;
                }
            };
            if response.proposal_id > proposal_id {
                warn!(
                    group = %self.group_id,
                    %peer,
                    proposal = %proposal_id,
                    higher = %response.proposal_id,
                    "push fenced by a higher proposal id"
                );
                self.step_down(&mut state, &mut log, response.proposal_id)?;
                outcome.stepped_down = true;
                return Ok(outcome);
            }
            responders.insert(peer);
            self.on_push_response(&mut state, peer, response);
        }

        if state.membership.has_quorum(&responders) {
            let lease = self.config.leader_lease;
            if let Some(leader) = state.leader_mut() {
                leader.lease.renew(Instant::now(), lease);
            }
        }

        let from = log.committed_end();
        if self.advance_commit(&mut state, &mut log)? {
            outcome.committed = true;
            outcome.reconfirmed = self.apply_committed(&mut state, &mut log, from)?;
        }
        Ok(outcome)
    }

    fn on_push_response(&self, state: &mut ReplicaState, peer: NodeId, response: PushLogResponse) {
        let Some(leader) = state.leader_mut() else {
            return;
        };
        let progress = leader
            .progress
            .entry(peer)
            .or_insert_with(|| PeerProgress::new(response.end_lsn));
        if response.accepted {
            progress.match_lsn = progress.match_lsn.max(response.end_lsn);
            progress.next_lsn = response.end_lsn;
        } else {
            debug!(
                group = %self.group_id,
                %peer,
                resume = %response.end_lsn,
                "push rejected, rewinding"
            );
            progress.next_lsn = response.end_lsn;
        }
    }

    /// Move the commit watermark to what a quorum of every active list
    /// acknowledged. Returns whether it moved.
    fn advance_commit(
        &self,
        state: &mut ReplicaState,
        log: &mut LogStore<S>,
    ) -> Result<bool, PalfError> {
        let committed = log.committed_end();
        let (mut acked, reconfirm_end) = match &state.election {
            ElectionState::Leader(leader) => {
                let acked: HashMap<NodeId, Lsn> = leader
                    .progress
                    .iter()
                    .map(|(node, p)| (*node, p.match_lsn))
                    .collect();
                (acked, leader.reconfirm_end)
            }
            _ => return Ok(false),
        };
        acked.insert(self.self_id, log.frozen_end());

        let Some(quorum) = state.membership.quorum_lsn(&acked) else {
            return Ok(false);
        };
        if quorum < reconfirm_end || quorum <= committed {
            return Ok(false);
        }
        log.set_committed_end(quorum);
        trace!(group = %self.group_id, committed = %log.committed_end(), "commit advanced");
        Ok(log.committed_end() > committed)
    }

    // =========================================================================
    // Follower side
    // =========================================================================

    pub(crate) fn handle_push_log(
        &self,
        request: PushLogRequest,
    ) -> Result<PushLogResponse, PalfError> {
        let (response, leader_changed, committed) = {
            let mut state = self.state.borrow_mut();
            let mut log = self.log.borrow_mut();

            let stale = request.proposal_id < state.proposal_id
                || (request.proposal_id == state.proposal_id && state.is_leader());
            if stale {
                debug!(
                    group = %self.group_id,
                    leader = %request.leader,
                    proposal = %request.proposal_id,
                    own = %state.proposal_id,
                    "stale push refused"
                );
                return Ok(PushLogResponse {
                    proposal_id: state.proposal_id,
                    accepted: false,
                    end_lsn: log.frozen_end(),
                });
            }
            if request.proposal_id > state.proposal_id
                || matches!(state.election, ElectionState::Candidate)
            {
                self.step_down(&mut state, &mut log, request.proposal_id)?;
            }
            let leader_changed = state.leader != Some(request.leader);
            state.leader = Some(request.leader);
            state.last_leader_contact = Instant::now();

            let committed = log.committed_end();
            let end = log.frozen_end();
            let prev_matches = request.prev_lsn <= committed
                || (request.prev_lsn <= end
                    && request.prev_proposal_id.is_some()
                    && log.group_ending_at(request.prev_lsn).map(|g| g.proposal_id)
                        == request.prev_proposal_id);
            if !prev_matches {
                let resume = if request.prev_lsn > end { end } else { committed };
                debug!(
                    group = %self.group_id,
                    prev = %request.prev_lsn,
                    resume = %resume,
                    "push does not continue the local log"
                );
                let response = PushLogResponse {
                    proposal_id: state.proposal_id,
                    accepted: false,
                    end_lsn: resume,
                };
                (response, leader_changed, false)
            } else {
                let matched =
                    self.accept_groups(&mut state, &mut log, request.prev_lsn, &request.groups)?;
                log.set_committed_end(request.committed_end.min(matched));
                let advanced = log.committed_end() > committed;
                if advanced {
                    self.apply_committed(&mut state, &mut log, committed)?;
                }
                let response = PushLogResponse {
                    proposal_id: state.proposal_id,
                    accepted: true,
                    end_lsn: matched,
                };
                (response, leader_changed, advanced)
            }
        };

        if leader_changed {
            info!(group = %self.group_id, node = %self.self_id, leader = %request.leader, "following new leader");
            self.notify_leader(Some(request.leader));
        }
        if committed {
            self.publish_progress();
        }
        Ok(response)
    }

    /// Make `groups`, which continue the log at `prev_lsn`, part of the
    /// local log. Identical groups are kept, a divergent uncommitted suffix
    /// is cut. Returns the end of the log shared with the sender.
    pub(crate) fn accept_groups(
        &self,
        state: &mut ReplicaState,
        log: &mut LogStore<S>,
        prev_lsn: Lsn,
        groups: &[LogGroup],
    ) -> Result<Lsn, PalfError> {
        let mut matched = prev_lsn;
        for group in groups {
            let header = group.header;
            if header.start_lsn != matched {
                return Err(PalfError::InvalidArgument(format!(
                    "group at {} does not follow {matched}",
                    header.start_lsn
                )));
            }
            if header.end_lsn <= log.committed_end()
                || log.group_at(header.start_lsn) == Some(&header)
            {
                matched = header.end_lsn;
                continue;
            }
            if log.end_lsn() > header.start_lsn {
                info!(
                    group = %self.group_id,
                    from = %header.start_lsn,
                    end = %log.end_lsn(),
                    "truncating divergent suffix"
                );
                log.truncate(header.start_lsn)?;
                state.on_truncated(header.start_lsn);
            }
            log.append_group(group)?;
            for entry in &group.entries {
                track_logged(state, entry)?;
            }
            matched = header.end_lsn;
        }
        Ok(matched)
    }
}

/// Header of the group formed by a raw write at `lsn`.
fn raw_group_header<S: LogStorage>(
    log: &LogStore<S>,
    proposal_id: ProposalId,
    lsn: Lsn,
    entries: &[LogEntry],
) -> Result<GroupHeader, PalfError> {
    let end = log.end_lsn();
    if lsn < end {
        return Err(PalfError::InvalidArgument(format!(
            "raw write at {lsn} overlaps the log ending at {end}"
        )));
    }
    if lsn > end {
        return Err(PalfError::InvalidArgument(format!(
            "raw write at {lsn} leaves a gap after {end}"
        )));
    }
    if entries.is_empty() {
        return Err(PalfError::InvalidArgument("raw write without entries".into()));
    }

    let mut next = lsn;
    let mut prev_scn = log.end_scn();
    for entry in entries {
        if entry.kind != EntryKind::Data {
            return Err(PalfError::InvalidArgument(format!(
                "raw write of a non-data entry at {}",
                entry.lsn
            )));
        }
        if entry.lsn != next {
            return Err(PalfError::InvalidArgument(format!(
                "raw entry at {} breaks contiguity, expected {next}",
                entry.lsn
            )));
        }
        if entry.scn < prev_scn {
            return Err(PalfError::InvalidArgument(format!(
                "raw entry at {} goes back in scn: {} < {prev_scn}",
                entry.lsn, entry.scn
            )));
        }
        next = entry.checked_end_lsn()?;
        prev_scn = entry.scn;
    }
    Ok(GroupHeader {
        start_lsn: lsn,
        end_lsn: next,
        proposal_id,
        max_scn: prev_scn,
        entry_count: entries.len(),
    })
}
