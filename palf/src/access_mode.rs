//! Access mode of a group: who assigns LSN and SCN to new entries.
//!
//! | Mode | `append` | `raw_write` |
//! |---|---|---|
//! | `Append` | leader assigns LSN/SCN | rejected |
//! | `RawWrite` | rejected | caller supplies entries with LSN/SCN |
//!
//! A mode switch is itself a log entry. The leader logs it under its current
//! proposal id and the group adopts the new mode, with `mode_version + 1`,
//! when the entry commits. Callers pass the version they last observed so a
//! switch decided on stale information fails instead of overriding a newer
//! one.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::PalfError;
use crate::replica::PalfReplica;
use crate::storage::LogStorage;
use crate::types::{AccessMode, EntryKind, Lsn, ProposalId, Scn};

/// Applied access mode, persisted in the log meta.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessModeMeta {
    /// Bumped on every committed switch.
    pub mode_version: u64,
    /// Current mode.
    pub mode: AccessMode,
    /// Lower bound for SCNs assigned after the switch.
    pub ref_scn: Scn,
}

#[derive(Debug, Default)]
pub(crate) struct AccessModeState {
    pub(crate) applied: AccessModeMeta,
    /// LSN of a logged, uncommitted switch.
    pub(crate) pending: Option<Lsn>,
}

impl AccessModeState {
    pub(crate) fn new(applied: AccessModeMeta) -> Self {
        Self {
            applied,
            pending: None,
        }
    }

    pub(crate) fn on_logged(&mut self, lsn: Lsn) {
        self.pending = Some(lsn);
    }

    pub(crate) fn on_truncated(&mut self, from: Lsn) {
        if matches!(self.pending, Some(lsn) if lsn >= from) {
            self.pending = None;
        }
    }

    pub(crate) fn on_committed(&mut self, lsn: Lsn, meta: AccessModeMeta) {
        if matches!(self.pending, Some(pending) if pending <= lsn) {
            self.pending = None;
        }
        if meta.mode_version > self.applied.mode_version {
            self.applied = meta;
        }
    }
}

impl<S: LogStorage + 'static> PalfReplica<S> {
    /// Current `(mode_version, mode)`.
    pub fn get_access_mode(&self) -> (u64, AccessMode) {
        let state = self.state.borrow();
        (state.access.applied.mode_version, state.access.applied.mode)
    }

    /// Switch the group to `mode`.
    ///
    /// Leader only, and only under `proposal_id`; `mode_version` must be the
    /// current version. Returns once the switch committed. Every SCN assigned
    /// afterwards is at least `ref_scn`.
    pub async fn change_access_mode(
        &self,
        proposal_id: ProposalId,
        mode_version: u64,
        mode: AccessMode,
        ref_scn: Scn,
        timeout: Duration,
    ) -> Result<(), PalfError> {
        let end = {
            let mut state = self.state.borrow_mut();
            let current = state.serving_leader()?;
            if proposal_id != current {
                return Err(PalfError::NotLeader);
            }
            if state.access.pending.is_some() {
                return Err(PalfError::ConfigChangeInProgress);
            }
            let applied = state.access.applied;
            if mode_version != applied.mode_version {
                return Err(PalfError::InvalidArgument(format!(
                    "mode version {mode_version} is stale, current is {}",
                    applied.mode_version
                )));
            }
            let next = AccessModeMeta {
                mode_version: applied.mode_version + 1,
                mode,
                ref_scn,
            };
            let mut log = self.log.borrow_mut();
            let entry =
                self.append_engine_entry(&mut state, &mut log, EntryKind::AccessMode, &next, ref_scn)?;
            info!(
                group = %self.group_id,
                proposal = %current,
                from = %applied.mode,
                to = %mode,
                version = next.mode_version,
                "access mode change logged"
            );
            entry.end_lsn()
        };
        self.replicate_notify.notify_one();
        self.wait_for_commit(proposal_id, end, timeout).await
    }
}
