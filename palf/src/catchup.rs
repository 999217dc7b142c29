//! Log pull used by a candidate whose log is behind a promiser's.
//!
//! During a campaign the candidate learns, from the prepare answers, which
//! promiser holds the freshest log. Before it logs anything as leader it
//! pulls the groups it misses from that replica, starting at its own commit
//! watermark (a group boundary every replica shares), and drops whatever it
//! holds past the donor's end.
//!
//! ## Raft Comparison
//!
//! | Aspect | Raft | PALF |
//! |---|---|---|
//! | **Who initiates** | Leader pushes missing entries | Candidate pulls before leading |
//! | **When** | Every AppendEntries | Once per won campaign, if behind |
//! | **Stale requester** | *(N/A)* | donor with a higher proposal id answers empty |

use tracing::{debug, info};

use crate::error::PalfError;
use crate::messages::{FetchLogRequest, FetchLogResponse};
use crate::replica::{ElectionState, PalfReplica};
use crate::storage::LogStorage;
use crate::types::{NodeId, ProposalId};

impl<S: LogStorage + 'static> PalfReplica<S> {
    /// Pull every group `donor` holds past the local commit watermark.
    pub(crate) async fn catch_up_from(
        &self,
        donor: NodeId,
        proposal_id: ProposalId,
    ) -> Result<(), PalfError> {
        let mut start = self.log.borrow().committed_end();
        info!(group = %self.group_id, node = %self.self_id, %donor, from = %start, "catching up before leading");
        loop {
            let request = FetchLogRequest {
                group_id: self.group_id,
                requester: self.self_id,
                proposal_id,
                start_lsn: start,
                max_bytes: self.config.max_push_bytes,
            };
            let response = self
                .transport
                .fetch_log(self.self_id, donor, request)
                .await?;

            let mut state = self.state.borrow_mut();
            if state.proposal_id != proposal_id
                || !matches!(state.election, ElectionState::Candidate)
            {
                return Err(PalfError::NotLeader);
            }
            let mut log = self.log.borrow_mut();
            if response.proposal_id > proposal_id {
                self.step_down(&mut state, &mut log, response.proposal_id)?;
                return Err(PalfError::NotLeader);
            }

            if response.groups.is_empty() {
                if log.end_lsn() > start {
                    info!(group = %self.group_id, from = %start, "dropping suffix past the donor's log");
                    log.truncate(start)?;
                    state.on_truncated(start);
                }
                debug!(group = %self.group_id, end = %start, "caught up");
                return Ok(());
            }
            let matched = self.accept_groups(&mut state, &mut log, start, &response.groups)?;
            if matched <= start {
                return Err(PalfError::InvalidArgument(format!(
                    "{donor} sent no progress past {start}"
                )));
            }
            start = matched;
        }
    }

    pub(crate) fn handle_fetch_log(
        &self,
        request: FetchLogRequest,
    ) -> Result<FetchLogResponse, PalfError> {
        let state = self.state.borrow();
        let log = self.log.borrow();
        let end_lsn = log.frozen_end();
        if request.proposal_id < state.proposal_id {
            debug!(
                group = %self.group_id,
                requester = %request.requester,
                proposal = %request.proposal_id,
                "stale fetch refused"
            );
            return Ok(FetchLogResponse {
                proposal_id: state.proposal_id,
                prev_proposal_id: None,
                groups: Vec::new(),
                end_lsn,
            });
        }
        let start = request.start_lsn;
        if start != end_lsn && log.group_at(start).is_none() {
            return Err(PalfError::InvalidArgument(format!(
                "{start} is not a group boundary"
            )));
        }
        Ok(FetchLogResponse {
            proposal_id: state.proposal_id,
            prev_proposal_id: log.group_ending_at(start).map(|g| g.proposal_id),
            groups: log.groups_from(start, request.max_bytes)?,
            end_lsn,
        })
    }
}
