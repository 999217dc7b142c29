//! Addressing, grouping and recycling on top of a [`LogStorage`].
//!
//! The [`LogStore`] owns the in-memory indexes of one group's log:
//!
//! ```text
//!  begin_lsn      base_lsn        committed_end   frozen_end      end_lsn
//!     │──────────────│─────────────────│───────────────│──────────────│
//!     │ recyclable   │ committed,      │ frozen into   │ unfrozen     │
//!     │ (still       │ must be kept    │ groups, not   │ leader tail  │
//!     │  readable)   │                 │ committed     │              │
//! ```
//!
//! - `end_lsn`: next LSN to assign; everything below is durable.
//! - `frozen_end`: end of the last group. Only the leader has entries past it.
//! - `committed_end`: end of the committed prefix; never moves backwards.
//! - `base_lsn`: recycling watermark set by the caller, `<= committed_end`.
//! - `begin_lsn`: first LSN still held by storage.
//!
//! The segment index maps `lsn / log_segment_size` to the first entry that
//! starts in the segment. It backs the coarse locate operations and decides
//! what [`LogStore::recycle`] may drop.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;

use tracing::{debug, info};

use crate::error::PalfError;
use crate::storage::LogStorage;
use crate::types::{EntryKind, GroupHeader, LogEntry, LogGroup, Lsn, ProposalId, Scn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SegmentInfo {
    first_lsn: Lsn,
    min_scn: Scn,
}

/// One group's log: storage plus LSN/SCN bookkeeping.
pub struct LogStore<S: LogStorage> {
    storage: S,
    segment_size: u64,
    wall_clock_scn: bool,
    begin_lsn: Lsn,
    end_lsn: Lsn,
    frozen_end: Lsn,
    committed_end: Lsn,
    base_lsn: Lsn,
    begin_scn: Scn,
    end_scn: Scn,
    max_scn: Scn,
    groups: BTreeMap<Lsn, GroupHeader>,
    segments: BTreeMap<u64, SegmentInfo>,
    /// Segment min SCN to segment first LSN. SCNs don't decrease along the
    /// log, so on a tie the later segment wins.
    scn_index: BTreeMap<Scn, Lsn>,
}

impl<S: LogStorage> LogStore<S> {
    /// Rebuild the indexes from `storage`.
    ///
    /// Entries past the last group were never replicated; they are dropped.
    pub fn open(mut storage: S, segment_size: u64, wall_clock_scn: bool) -> Result<Self, PalfError> {
        if segment_size == 0 {
            return Err(PalfError::InvalidArgument(
                "segment size must be positive".into(),
            ));
        }
        let meta = storage.load_meta()?.unwrap_or_default();
        let groups: BTreeMap<Lsn, GroupHeader> = storage
            .load_groups()?
            .into_iter()
            .map(|g| (g.start_lsn, g))
            .collect();
        let mut entries = storage.read_entries(Lsn::MIN, Lsn::MAX)?;

        let begin_lsn = entries.first().map_or(meta.base_lsn, |e| e.lsn);
        let frozen_end = groups
            .values()
            .next_back()
            .map_or(begin_lsn, |g| g.end_lsn);
        if entries.last().is_some_and(|e| e.lsn >= frozen_end) {
            debug!(from = %frozen_end, "discarding unfrozen tail");
            storage.truncate(frozen_end)?;
            entries.retain(|e| e.lsn < frozen_end);
        }

        let mut store = Self {
            storage,
            segment_size,
            wall_clock_scn,
            begin_lsn,
            end_lsn: frozen_end,
            frozen_end,
            committed_end: meta.committed_end.min(frozen_end).max(meta.base_lsn),
            base_lsn: meta.base_lsn,
            begin_scn: entries.first().map_or(Scn::MIN, |e| e.scn),
            end_scn: Scn::MIN,
            max_scn: Scn::MIN,
            groups,
            segments: BTreeMap::new(),
            scn_index: BTreeMap::new(),
        };
        for entry in &entries {
            store.index_entry(entry);
        }
        store.end_lsn = frozen_end;
        store.bump_max_scn(meta.access_mode.ref_scn);
        Ok(store)
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Assign the next LSN and SCN to `data` and persist it.
    ///
    /// The SCN is `max(min_scn, max_scn + 1, wall clock)`, the wall clock only
    /// when enabled. On error nothing changes.
    pub fn append(&mut self, kind: EntryKind, data: Vec<u8>, min_scn: Scn) -> Result<LogEntry, PalfError> {
        let Some(after_max) = self.max_scn.checked_next() else {
            return Err(PalfError::InvalidArgument(format!(
                "scn space exhausted at {}",
                self.max_scn
            )));
        };
        let mut scn = min_scn.max(after_max);
        if self.wall_clock_scn {
            scn = scn.max(Scn::from_wall_clock());
        }
        let entry = LogEntry {
            lsn: self.end_lsn,
            scn,
            kind,
            data,
        };
        entry.checked_end_lsn()?;
        self.storage.append_entry(&entry)?;
        self.index_entry(&entry);
        Ok(entry)
    }

    /// Seal every unfrozen entry into a group written under `proposal_id`.
    pub fn freeze(&mut self, proposal_id: ProposalId) -> Result<Option<GroupHeader>, PalfError> {
        if self.end_lsn == self.frozen_end {
            return Ok(None);
        }
        let entries = self.storage.read_entries(self.frozen_end, self.end_lsn)?;
        let header = GroupHeader {
            start_lsn: self.frozen_end,
            end_lsn: self.end_lsn,
            proposal_id,
            max_scn: entries.iter().map(|e| e.scn).max().unwrap_or(Scn::MIN),
            entry_count: entries.len(),
        };
        self.storage.append_group(&header)?;
        self.groups.insert(header.start_lsn, header);
        self.frozen_end = header.end_lsn;
        Ok(Some(header))
    }

    /// Append a group built elsewhere, keeping its LSNs and SCNs.
    ///
    /// The group must start exactly at the end of the log, and its entries
    /// must be contiguous and cover the header's range. A failed write
    /// removes whatever part of the group reached storage.
    pub fn append_group(&mut self, group: &LogGroup) -> Result<(), PalfError> {
        let header = group.header;
        if header.start_lsn != self.end_lsn || self.end_lsn != self.frozen_end {
            return Err(PalfError::InvalidArgument(format!(
                "group at {} does not continue the log ending at {}",
                header.start_lsn, self.end_lsn
            )));
        }
        let mut next = header.start_lsn;
        for entry in &group.entries {
            if entry.lsn != next {
                return Err(PalfError::InvalidArgument(format!(
                    "entry at {} breaks contiguity, expected {}",
                    entry.lsn, next
                )));
            }
            next = entry.checked_end_lsn()?;
        }
        if next != header.end_lsn || group.entries.len() != header.entry_count {
            return Err(PalfError::InvalidArgument(format!(
                "group header {}..{} does not match its entries",
                header.start_lsn, header.end_lsn
            )));
        }

        let written = group
            .entries
            .iter()
            .try_for_each(|entry| self.storage.append_entry(entry))
            .and_then(|()| self.storage.append_group(&header));
        if let Err(e) = written {
            self.storage.truncate(header.start_lsn)?;
            return Err(e);
        }

        for entry in &group.entries {
            self.index_entry(entry);
        }
        self.groups.insert(header.start_lsn, header);
        self.frozen_end = header.end_lsn;
        Ok(())
    }

    /// Drop everything from `from` on. The committed prefix can't be cut.
    ///
    /// `max_scn` keeps its value.
    pub fn truncate(&mut self, from: Lsn) -> Result<(), PalfError> {
        if from < self.committed_end {
            return Err(PalfError::InvalidArgument(format!(
                "can't truncate at {from}, committed up to {}",
                self.committed_end
            )));
        }
        if from >= self.end_lsn {
            return Ok(());
        }
        self.storage.truncate(from)?;
        self.groups.split_off(&from);
        self.segments.retain(|_, s| s.first_lsn < from);
        self.rebuild_scn_index();
        self.end_lsn = from;
        self.frozen_end = self.frozen_end.min(from);
        self.end_scn = self
            .groups
            .values()
            .next_back()
            .map_or(Scn::MIN, |g| g.max_scn);
        info!(from = %from, "log truncated");
        Ok(())
    }

    /// Drop entries that were never frozen into a group.
    pub fn discard_unfrozen(&mut self) -> Result<(), PalfError> {
        self.truncate(self.frozen_end)
    }

    /// Move the commit watermark forward. Never past the frozen end and
    /// never backwards.
    pub fn set_committed_end(&mut self, lsn: Lsn) {
        let target = lsn.min(self.frozen_end);
        if target > self.committed_end {
            self.committed_end = target;
        }
    }

    /// Raise `max_scn` to at least `scn`.
    pub fn bump_max_scn(&mut self, scn: Scn) {
        self.max_scn = self.max_scn.max(scn);
    }

    /// Declare everything below `lsn` recyclable.
    pub fn advance_base_lsn(&mut self, lsn: Lsn) -> Result<(), PalfError> {
        if lsn < self.base_lsn {
            return Err(PalfError::InvalidArgument(format!(
                "base lsn can't move back from {} to {lsn}",
                self.base_lsn
            )));
        }
        if lsn > self.committed_end {
            return Err(PalfError::InvalidArgument(format!(
                "base lsn {lsn} beyond committed {}",
                self.committed_end
            )));
        }
        self.base_lsn = lsn;
        Ok(())
    }

    /// Reclaim whole segments below the segment holding the base LSN.
    ///
    /// The new begin is rounded down to a group boundary and the last group
    /// is always kept, so the log end survives a reopen. Returns the new
    /// begin LSN when something was reclaimed.
    pub fn recycle(&mut self) -> Result<Option<Lsn>, PalfError> {
        let base_segment = self.base_lsn.0 / self.segment_size;
        if self.segments.range(..base_segment).next().is_none() {
            return Ok(None);
        }
        let boundary = Lsn::new(base_segment * self.segment_size);
        let last_group_start = self
            .groups
            .values()
            .next_back()
            .map_or(self.begin_lsn, |g| g.start_lsn);
        let new_begin = self
            .groups
            .values()
            .find(|g| g.end_lsn > boundary)
            .map_or(last_group_start, |g| g.start_lsn)
            .min(last_group_start);
        if new_begin <= self.begin_lsn {
            return Ok(None);
        }

        self.storage.purge_before(new_begin)?;
        self.groups = self.groups.split_off(&new_begin);
        let first_entry = self.storage.read_entry(new_begin)?;
        let new_segment = new_begin.0 / self.segment_size;
        self.segments = self.segments.split_off(&new_segment);
        if let (Some(entry), Some(info)) = (&first_entry, self.segments.get_mut(&new_segment)) {
            info.first_lsn = entry.lsn;
            info.min_scn = entry.scn;
        }
        self.rebuild_scn_index();
        self.begin_lsn = new_begin;
        self.begin_scn = first_entry.map_or(self.max_scn, |e| e.scn);
        info!(begin = %new_begin, base = %self.base_lsn, "log recycled");
        Ok(Some(new_begin))
    }

    fn index_entry(&mut self, entry: &LogEntry) {
        let segment = entry.lsn.0 / self.segment_size;
        if let Entry::Vacant(slot) = self.segments.entry(segment) {
            slot.insert(SegmentInfo {
                first_lsn: entry.lsn,
                min_scn: entry.scn,
            });
            self.scn_index.insert(entry.scn, entry.lsn);
        }
        if self.end_lsn == self.begin_lsn && self.groups.is_empty() {
            self.begin_scn = entry.scn;
        }
        self.end_lsn = entry.end_lsn();
        self.end_scn = entry.scn;
        self.max_scn = self.max_scn.max(entry.scn);
    }

    fn rebuild_scn_index(&mut self) {
        self.scn_index = self
            .segments
            .values()
            .map(|s| (s.min_scn, s.first_lsn))
            .collect();
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// First LSN still held.
    pub fn begin_lsn(&self) -> Lsn {
        self.begin_lsn
    }

    /// SCN of the first entry held.
    pub fn begin_scn(&self) -> Scn {
        self.begin_scn
    }

    /// End of the durable log.
    pub fn end_lsn(&self) -> Lsn {
        self.end_lsn
    }

    /// SCN of the last entry.
    pub fn end_scn(&self) -> Scn {
        self.end_scn
    }

    /// Largest SCN this log ever held.
    pub fn max_scn(&self) -> Scn {
        self.max_scn
    }

    /// End of the last group.
    pub fn frozen_end(&self) -> Lsn {
        self.frozen_end
    }

    /// End of the committed prefix.
    pub fn committed_end(&self) -> Lsn {
        self.committed_end
    }

    /// Recycling watermark.
    pub fn base_lsn(&self) -> Lsn {
        self.base_lsn
    }

    /// Bytes appended but not committed.
    pub fn inflight_bytes(&self) -> u64 {
        self.end_lsn.distance_from(self.committed_end)
    }

    /// Bytes held by storage.
    pub fn used_bytes(&self) -> u64 {
        self.storage.used_bytes()
    }

    /// The persistence seam.
    pub fn storage_mut(&mut self) -> &mut S {
        &mut self.storage
    }

    /// The entry starting at `lsn`.
    pub fn read_entry(&self, lsn: Lsn) -> Result<Option<LogEntry>, PalfError> {
        self.storage.read_entry(lsn)
    }

    /// Entries starting in `[from, to)`.
    pub fn read_entries(&self, from: Lsn, to: Lsn) -> Result<Vec<LogEntry>, PalfError> {
        self.storage.read_entries(from, to)
    }

    /// The group starting at `start`.
    pub fn group_at(&self, start: Lsn) -> Option<&GroupHeader> {
        self.groups.get(&start)
    }

    /// The group whose end is `end`.
    pub fn group_ending_at(&self, end: Lsn) -> Option<&GroupHeader> {
        self.groups
            .range(..end)
            .next_back()
            .map(|(_, g)| g)
            .filter(|g| g.end_lsn == end)
    }

    /// The closest group boundary at or below `lsn`, capped at the frozen end.
    pub fn align_to_group(&self, lsn: Lsn) -> Lsn {
        let aligned = self
            .groups
            .range(..=lsn)
            .next_back()
            .map_or(self.begin_lsn, |(_, g)| {
                if g.end_lsn <= lsn {
                    g.end_lsn
                } else {
                    g.start_lsn
                }
            });
        aligned.min(self.frozen_end)
    }

    /// First group starting at or after `lsn`.
    pub fn next_group(&self, lsn: Lsn) -> Option<&GroupHeader> {
        self.groups.range(lsn..).next().map(|(_, g)| g)
    }

    /// A group with its entries.
    pub fn read_group(&self, header: &GroupHeader) -> Result<LogGroup, PalfError> {
        Ok(LogGroup {
            header: *header,
            entries: self.storage.read_entries(header.start_lsn, header.end_lsn)?,
        })
    }

    /// Groups from `lsn` on, at least one when any exists, stopping once
    /// `max_bytes` would be exceeded.
    pub fn groups_from(&self, lsn: Lsn, max_bytes: u64) -> Result<Vec<LogGroup>, PalfError> {
        let mut groups = Vec::new();
        let mut bytes = 0;
        for header in self.groups.range(lsn..).map(|(_, g)| g) {
            let size = header.end_lsn.distance_from(header.start_lsn);
            if !groups.is_empty() && bytes + size > max_bytes {
                break;
            }
            bytes += size;
            groups.push(self.read_group(header)?);
        }
        Ok(groups)
    }

    /// Proposal id of the last group, the epoch part of log freshness.
    pub fn last_group_proposal_id(&self) -> ProposalId {
        self.groups
            .values()
            .next_back()
            .map_or(ProposalId::ZERO, |g| g.proposal_id)
    }

    /// First LSN of the last segment whose smallest SCN is `<= scn`.
    pub fn locate_by_scn_coarsely(&self, scn: Scn) -> Result<Lsn, PalfError> {
        if self.scn_index.is_empty() {
            return Err(PalfError::EntryNotExist);
        }
        self.scn_index
            .range(..=scn)
            .next_back()
            .map(|(_, lsn)| *lsn)
            .ok_or(PalfError::OutOfLowerBound)
    }

    /// Smallest SCN of the segment holding `lsn`.
    pub fn locate_by_lsn_coarsely(&self, lsn: Lsn) -> Result<Scn, PalfError> {
        if self.segments.is_empty() {
            return Err(PalfError::EntryNotExist);
        }
        if lsn >= self.end_lsn {
            return Err(PalfError::InvalidArgument(format!(
                "{lsn} is beyond the log end {}",
                self.end_lsn
            )));
        }
        if lsn < self.begin_lsn {
            return Err(PalfError::OutOfLowerBound);
        }
        self.segments
            .range(..=lsn.0 / self.segment_size)
            .rev()
            .map(|(_, s)| s)
            .find(|s| s.first_lsn <= lsn)
            .map(|s| s.min_scn)
            .ok_or(PalfError::OutOfLowerBound)
    }
}
