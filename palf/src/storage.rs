//! Log storage trait and in-memory implementation.
//!
//! The [`LogStorage`] trait is the persistence seam of the engine. The engine
//! never touches files itself: segment layout, fsync policy and block
//! formats belong to the implementation. For tests and in-process clusters,
//! [`InMemoryLogStorage`] keeps everything in ordered maps and can simulate a
//! full disk or failing writes.
//!
//! ## What gets stored?
//!
//! - **entries**, keyed by LSN
//! - **group headers**, keyed by start LSN; a group is only written after all
//!   of its entries
//! - **meta** ([`LogMeta`]): the promised proposal id, the applied member
//!   list, the applied access mode, the base LSN and the last known commit
//!   watermark
//!
//! ## Raft comparison
//!
//! | Stored | Raft equivalent |
//! |---|---|
//! | `meta.proposal_id` | `currentTerm` |
//! | entries + group headers | `log[]` with per-entry terms |
//! | `meta.member_list` | latest committed configuration |
//! | `meta.base_lsn` | snapshot index |

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use serde::{Deserialize, Serialize};

use crate::access_mode::AccessModeMeta;
use crate::error::PalfError;
use crate::membership::MemberList;
use crate::types::{GroupHeader, LogEntry, Lsn, ProposalId};

/// Durable replica metadata, rewritten as a whole on every change.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogMeta {
    /// Highest proposal id this replica promised.
    pub proposal_id: ProposalId,
    /// Last applied member list; `None` until the group is initialized.
    pub member_list: Option<MemberList>,
    /// Last applied access mode.
    pub access_mode: AccessModeMeta,
    /// Recycling low-water mark.
    pub base_lsn: Lsn,
    /// Commit watermark at the time of the last meta write.
    pub committed_end: Lsn,
}

/// Durable storage of one group's log.
///
/// Writes must be durable before returning. A write that returns an error
/// must leave no trace.
pub trait LogStorage {
    /// Persist one entry.
    fn append_entry(&mut self, entry: &LogEntry) -> Result<(), PalfError>;

    /// Persist a group header. Its entries were written before.
    fn append_group(&mut self, header: &GroupHeader) -> Result<(), PalfError>;

    /// The entry starting at `lsn`.
    fn read_entry(&self, lsn: Lsn) -> Result<Option<LogEntry>, PalfError>;

    /// Entries starting in `[from, to)`.
    fn read_entries(&self, from: Lsn, to: Lsn) -> Result<Vec<LogEntry>, PalfError>;

    /// Every stored group header in LSN order.
    fn load_groups(&self) -> Result<Vec<GroupHeader>, PalfError>;

    /// Drop every entry and group starting at or after `from`.
    fn truncate(&mut self, from: Lsn) -> Result<(), PalfError>;

    /// Drop every entry and group starting before `lsn`.
    fn purge_before(&mut self, lsn: Lsn) -> Result<(), PalfError>;

    /// Load the meta, `None` for a fresh replica.
    fn load_meta(&self) -> Result<Option<LogMeta>, PalfError>;

    /// Replace the meta.
    fn store_meta(&mut self, meta: &LogMeta) -> Result<(), PalfError>;

    /// Bytes of entries currently held.
    fn used_bytes(&self) -> u64;
}

#[derive(Debug, Default)]
struct MemoryLog {
    entries: BTreeMap<Lsn, LogEntry>,
    groups: BTreeMap<Lsn, GroupHeader>,
    meta: Option<LogMeta>,
    used_bytes: u64,
    capacity: Option<u64>,
    failing_writes: usize,
}

impl MemoryLog {
    fn check_write(&mut self, needed: u64) -> Result<(), PalfError> {
        if self.failing_writes > 0 {
            self.failing_writes -= 1;
            return Err(PalfError::Io("injected write failure".into()));
        }
        if let Some(capacity) = self.capacity {
            let available = capacity.saturating_sub(self.used_bytes);
            if needed > available {
                return Err(PalfError::StorageFull { needed, available });
            }
        }
        Ok(())
    }
}

/// In-memory implementation of [`LogStorage`].
///
/// Cloning yields another handle to the same log, so a test can keep a
/// handle, drop the replica and reopen it to exercise recovery.
#[derive(Debug, Clone, Default)]
pub struct InMemoryLogStorage {
    inner: Rc<RefCell<MemoryLog>>,
}

impl InMemoryLogStorage {
    /// Create an unbounded empty storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty storage that holds at most `bytes` of entries.
    pub fn with_capacity(bytes: u64) -> Self {
        let storage = Self::default();
        storage.inner.borrow_mut().capacity = Some(bytes);
        storage
    }

    /// Make the next `count` entry or group writes fail with `Io`.
    pub fn fail_next_writes(&self, count: usize) {
        self.inner.borrow_mut().failing_writes = count;
    }

    /// Number of entries held.
    pub fn entry_count(&self) -> usize {
        self.inner.borrow().entries.len()
    }
}

impl LogStorage for InMemoryLogStorage {
    fn append_entry(&mut self, entry: &LogEntry) -> Result<(), PalfError> {
        let mut log = self.inner.borrow_mut();
        log.check_write(entry.size())?;
        log.used_bytes += entry.size();
        if let Some(replaced) = log.entries.insert(entry.lsn, entry.clone()) {
            log.used_bytes -= replaced.size();
        }
        Ok(())
    }

    fn append_group(&mut self, header: &GroupHeader) -> Result<(), PalfError> {
        let mut log = self.inner.borrow_mut();
        log.check_write(0)?;
        log.groups.insert(header.start_lsn, *header);
        Ok(())
    }

    fn read_entry(&self, lsn: Lsn) -> Result<Option<LogEntry>, PalfError> {
        Ok(self.inner.borrow().entries.get(&lsn).cloned())
    }

    fn read_entries(&self, from: Lsn, to: Lsn) -> Result<Vec<LogEntry>, PalfError> {
        if from >= to {
            return Ok(Vec::new());
        }
        Ok(self
            .inner
            .borrow()
            .entries
            .range(from..to)
            .map(|(_, entry)| entry.clone())
            .collect())
    }

    fn load_groups(&self) -> Result<Vec<GroupHeader>, PalfError> {
        Ok(self.inner.borrow().groups.values().copied().collect())
    }

    fn truncate(&mut self, from: Lsn) -> Result<(), PalfError> {
        let mut log = self.inner.borrow_mut();
        let removed = log.entries.split_off(&from);
        log.used_bytes -= removed.values().map(LogEntry::size).sum::<u64>();
        log.groups.split_off(&from);
        Ok(())
    }

    fn purge_before(&mut self, lsn: Lsn) -> Result<(), PalfError> {
        let mut log = self.inner.borrow_mut();
        let kept = log.entries.split_off(&lsn);
        let purged = std::mem::replace(&mut log.entries, kept);
        log.used_bytes -= purged.values().map(LogEntry::size).sum::<u64>();
        let kept_groups = log.groups.split_off(&lsn);
        log.groups = kept_groups;
        Ok(())
    }

    fn load_meta(&self) -> Result<Option<LogMeta>, PalfError> {
        Ok(self.inner.borrow().meta.clone())
    }

    fn store_meta(&mut self, meta: &LogMeta) -> Result<(), PalfError> {
        self.inner.borrow_mut().meta = Some(meta.clone());
        Ok(())
    }

    fn used_bytes(&self) -> u64 {
        self.inner.borrow().used_bytes
    }
}
