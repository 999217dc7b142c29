//! Forward cursors over a group's log.
//!
//! Both cursors capture an upper bound when seeked: the commit watermark in
//! [`ReadMode::Committed`], the log end in [`ReadMode::Raw`]. They stop there
//! until seeked again. Each step takes a short borrow of the log, so a cursor
//! can live across appends, truncations and recycling. A cursor whose
//! position was recycled fails with [`PalfError::StaleIterator`] instead of
//! skipping ahead.

use std::cell::RefCell;
use std::rc::Rc;

use crate::error::PalfError;
use crate::log_store::LogStore;
use crate::storage::LogStorage;
use crate::types::{EntryKind, LogEntry, LogGroup, Lsn, Scn};

/// Upper bound of a cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadMode {
    /// Up to the commit watermark.
    Committed,
    /// Up to the end of the durable log, committed or not.
    Raw,
}

fn read_bound<S: LogStorage>(log: &LogStore<S>, mode: ReadMode) -> Lsn {
    match mode {
        ReadMode::Committed => log.committed_end(),
        ReadMode::Raw => log.end_lsn(),
    }
}

fn check_not_recycled<S: LogStorage>(log: &LogStore<S>, position: Lsn) -> Result<(), PalfError> {
    if position < log.begin_lsn() {
        return Err(PalfError::StaleIterator {
            position,
            begin: log.begin_lsn(),
        });
    }
    Ok(())
}

/// Cursor over caller data entries.
///
/// Engine records (member lists, access mode switches) are skipped.
pub struct EntryIterator<S: LogStorage> {
    log: Rc<RefCell<LogStore<S>>>,
    mode: ReadMode,
    next_lsn: Lsn,
    bound: Lsn,
    failed: bool,
}

impl<S: LogStorage> EntryIterator<S> {
    pub(crate) fn new(log: Rc<RefCell<LogStore<S>>>, start: Lsn, mode: ReadMode) -> Self {
        let mut iter = Self {
            log,
            mode,
            next_lsn: start,
            bound: Lsn::MIN,
            failed: false,
        };
        iter.seek(start);
        iter
    }

    /// Restart at `lsn` and capture a new upper bound.
    pub fn seek(&mut self, lsn: Lsn) {
        self.next_lsn = lsn;
        self.bound = read_bound(&self.log.borrow(), self.mode);
        self.failed = false;
    }

    /// Where the next entry is looked for.
    pub fn position(&self) -> Lsn {
        self.next_lsn
    }

    /// The next data entry, `None` at the bound.
    pub fn next_entry(&mut self) -> Result<Option<LogEntry>, PalfError> {
        let result = self.step();
        if result.is_err() {
            self.failed = true;
        }
        result
    }

    fn step(&mut self) -> Result<Option<LogEntry>, PalfError> {
        let log = self.log.borrow();
        while self.next_lsn < self.bound {
            check_not_recycled(&log, self.next_lsn)?;
            let entry = match log.read_entry(self.next_lsn)? {
                Some(entry) => entry,
                // Seeked into the middle of an entry, or the tail was cut.
                None => match log
                    .read_entries(self.next_lsn, self.bound)?
                    .into_iter()
                    .next()
                {
                    Some(entry) => entry,
                    None => return Ok(None),
                },
            };
            if entry.lsn >= self.bound {
                return Ok(None);
            }
            self.next_lsn = entry.end_lsn();
            if entry.kind == EntryKind::Data {
                return Ok(Some(entry));
            }
        }
        Ok(None)
    }
}

impl<S: LogStorage> Iterator for EntryIterator<S> {
    type Item = Result<LogEntry, PalfError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        self.next_entry().transpose()
    }
}

/// Cursor over whole groups, engine records included.
pub struct GroupIterator<S: LogStorage> {
    log: Rc<RefCell<LogStore<S>>>,
    mode: ReadMode,
    next_lsn: Lsn,
    bound: Lsn,
    failed: bool,
}

impl<S: LogStorage> GroupIterator<S> {
    pub(crate) fn new(log: Rc<RefCell<LogStore<S>>>, start: Lsn, mode: ReadMode) -> Self {
        let mut iter = Self {
            log,
            mode,
            next_lsn: start,
            bound: Lsn::MIN,
            failed: false,
        };
        iter.seek(start);
        iter
    }

    /// Restart at the group holding `lsn` and capture a new upper bound.
    pub fn seek(&mut self, lsn: Lsn) {
        let log = self.log.borrow();
        self.next_lsn = if lsn < log.begin_lsn() {
            lsn
        } else {
            log.align_to_group(lsn)
        };
        self.bound = read_bound(&log, self.mode);
        self.failed = false;
    }

    /// Restart at the first group holding an SCN `>= scn`.
    ///
    /// The coarse segment index gives a starting point, groups are then
    /// walked up to the exact one. An `scn` below every retained segment
    /// starts at the beginning of the log.
    pub fn seek_scn(&mut self, scn: Scn) -> Result<(), PalfError> {
        let start = {
            let log = self.log.borrow();
            let coarse = match log.locate_by_scn_coarsely(scn) {
                Ok(lsn) => lsn,
                Err(PalfError::OutOfLowerBound) | Err(PalfError::EntryNotExist) => log.begin_lsn(),
                Err(e) => return Err(e),
            };
            let mut lsn = log.align_to_group(coarse);
            while let Some(group) = log.next_group(lsn) {
                if group.max_scn >= scn {
                    break;
                }
                lsn = group.end_lsn;
            }
            lsn
        };
        self.seek(start);
        Ok(())
    }

    /// Where the next group starts.
    pub fn position(&self) -> Lsn {
        self.next_lsn
    }

    /// The next group, `None` at the bound.
    pub fn next_group(&mut self) -> Result<Option<LogGroup>, PalfError> {
        let result = self.step();
        if result.is_err() {
            self.failed = true;
        }
        result
    }

    fn step(&mut self) -> Result<Option<LogGroup>, PalfError> {
        if self.next_lsn >= self.bound {
            return Ok(None);
        }
        let log = self.log.borrow();
        check_not_recycled(&log, self.next_lsn)?;
        let Some(header) = log.next_group(self.next_lsn).copied() else {
            return Ok(None);
        };
        if header.end_lsn > self.bound {
            return Ok(None);
        }
        let group = log.read_group(&header)?;
        self.next_lsn = header.end_lsn;
        Ok(Some(group))
    }
}

impl<S: LogStorage> Iterator for GroupIterator<S> {
    type Item = Result<LogGroup, PalfError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        self.next_group().transpose()
    }
}
