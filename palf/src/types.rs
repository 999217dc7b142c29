//! Core types of the log engine.
//!
//! - [`Lsn`]: byte offset of an entry in the log stream (like Raft's log index,
//!   but measured in bytes)
//! - [`Scn`]: logical timestamp attached to every entry
//! - [`ProposalId`]: leadership epoch (like Raft's term)
//! - [`LogEntry`], [`GroupHeader`], [`LogGroup`]: what the log stores and
//!   what replication ships
//! - [`Role`], [`AccessMode`], [`AppendOptions`]: small enums of the handle API

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::PalfError;

/// Bytes of framing every entry occupies in front of its payload.
///
/// An entry of `n` payload bytes advances the log by `LOG_ENTRY_HEADER_SIZE + n`.
pub const LOG_ENTRY_HEADER_SIZE: u64 = 32;

/// Log sequence number: the byte offset of an entry in the log stream.
///
/// LSNs are totally ordered and never reused for committed entries. An
/// uncommitted suffix may be truncated by a new leader, which then issues
/// the same addresses again.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Lsn(pub u64);

impl Lsn {
    /// The beginning of every log.
    pub const MIN: Self = Self(0);

    /// Upper sentinel, never assigned to an entry.
    pub const MAX: Self = Self(u64::MAX);

    /// Create a new LSN.
    pub const fn new(n: u64) -> Self {
        Self(n)
    }

    /// The LSN `bytes` further along the stream, saturating at [`Lsn::MAX`].
    pub const fn advance(self, bytes: u64) -> Self {
        Self(self.0.saturating_add(bytes))
    }

    /// The LSN `bytes` further along the stream, `None` past [`Lsn::MAX`].
    pub const fn checked_advance(self, bytes: u64) -> Option<Self> {
        match self.0.checked_add(bytes) {
            Some(n) => Some(Self(n)),
            None => None,
        }
    }

    /// Number of bytes from `earlier` to `self`, zero if `earlier` is ahead.
    pub const fn distance_from(self, earlier: Lsn) -> u64 {
        self.0.saturating_sub(earlier.0)
    }
}

impl std::fmt::Display for Lsn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "lsn({})", self.0)
    }
}

/// System change number: the logical timestamp of an entry.
///
/// SCNs are non-decreasing along the LSN order of a log. When the wall clock
/// is used as a hint the value is nanoseconds since the Unix epoch.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Scn(pub u64);

impl Scn {
    /// Lowest possible SCN; also the SCN of an empty log.
    pub const MIN: Self = Self(0);

    /// Upper sentinel.
    pub const MAX: Self = Self(u64::MAX);

    /// Create a new SCN.
    pub const fn new(n: u64) -> Self {
        Self(n)
    }

    /// The next SCN, `None` once the SCN space is exhausted.
    pub const fn checked_next(self) -> Option<Self> {
        match self.0.checked_add(1) {
            Some(n) => Some(Self(n)),
            None => None,
        }
    }

    /// Current wall clock time as an SCN.
    pub fn from_wall_clock() -> Self {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        Self(nanos)
    }
}

impl std::fmt::Display for Scn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "scn({})", self.0)
    }
}

/// Proposal id: the leadership epoch.
///
/// In Raft terms this is the **term**. It is persisted in the log meta and
/// strictly increases on every leadership change. Messages tagged with a
/// proposal id below the receiver's are rejected.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct ProposalId(pub u64);

impl ProposalId {
    /// No proposal seen yet.
    pub const ZERO: Self = Self(0);

    /// Create a new proposal id.
    pub const fn new(n: u64) -> Self {
        Self(n)
    }

    /// The next proposal id.
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl std::fmt::Display for ProposalId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "proposal({})", self.0)
    }
}

/// Identity of a server hosting replicas.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct NodeId(pub u64);

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "node({})", self.0)
    }
}

/// Identity of a paxos group (one partition's log stream).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct GroupId(pub u64);

impl std::fmt::Display for GroupId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "group({})", self.0)
    }
}

/// Role of a replica in its group.
///
/// Derived from election state and the applied member list. Callers never
/// assign it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    /// Accepts appends and drives replication.
    Leader,
    /// Acceptor that votes and acknowledges replicated groups.
    Follower,
    /// Receives the log but never counts toward a quorum.
    Learner,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Leader => f.write_str("leader"),
            Role::Follower => f.write_str("follower"),
            Role::Learner => f.write_str("learner"),
        }
    }
}

/// How the group accepts new entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum AccessMode {
    /// Normal operation: the leader assigns LSN and SCN to appended payloads.
    #[default]
    Append,
    /// Entries arrive with LSN and SCN already assigned (restore, migration).
    RawWrite,
}

impl std::fmt::Display for AccessMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AccessMode::Append => f.write_str("append"),
            AccessMode::RawWrite => f.write_str("raw_write"),
        }
    }
}

/// Per-call choice between waiting for commit and returning early.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOptions {
    /// Return once the entry is committed, or fail with `Timeout`.
    Blocking {
        /// Upper bound on the wait for commit.
        timeout: Duration,
    },
    /// Return after the leader persisted the entry locally. Commit happens
    /// in the background and is not guaranteed.
    NonBlocking,
}

impl AppendOptions {
    /// Blocking append with the given timeout.
    pub const fn blocking(timeout: Duration) -> Self {
        AppendOptions::Blocking { timeout }
    }
}

/// What an entry carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntryKind {
    /// Caller payload.
    Data,
    /// A full member list, applied when committed.
    Config,
    /// An access mode transition, applied when committed.
    AccessMode,
}

/// A single entry of the log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Where the entry starts.
    pub lsn: Lsn,
    /// Logical timestamp assigned at append.
    pub scn: Scn,
    /// Caller data or an engine record.
    pub kind: EntryKind,
    /// Opaque bytes.
    pub data: Vec<u8>,
}

impl LogEntry {
    /// A caller data entry.
    pub fn data(lsn: Lsn, scn: Scn, data: Vec<u8>) -> Self {
        Self {
            lsn,
            scn,
            kind: EntryKind::Data,
            data,
        }
    }

    /// Bytes this entry occupies in the log stream.
    pub fn size(&self) -> u64 {
        LOG_ENTRY_HEADER_SIZE + self.data.len() as u64
    }

    /// First LSN after this entry.
    pub fn end_lsn(&self) -> Lsn {
        self.lsn.advance(self.size())
    }

    /// First LSN after this entry, refusing entries that run past
    /// [`Lsn::MAX`].
    pub fn checked_end_lsn(&self) -> Result<Lsn, PalfError> {
        self.lsn.checked_advance(self.size()).ok_or_else(|| {
            PalfError::InvalidArgument(format!("entry at {} runs past the LSN space", self.lsn))
        })
    }
}

/// Metadata of a group of consecutive entries.
///
/// The leader freezes every not-yet-replicated entry into a group at the
/// start of a replication round. Groups are the unit followers accept and
/// the unit the group iterator yields. `proposal_id` is the epoch of the
/// leader that froze the group and is what log matching compares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupHeader {
    /// LSN of the first entry.
    pub start_lsn: Lsn,
    /// First LSN after the last entry.
    pub end_lsn: Lsn,
    /// Epoch of the leader that froze the group.
    pub proposal_id: ProposalId,
    /// Largest SCN in the group.
    pub max_scn: Scn,
    /// Number of entries.
    pub entry_count: usize,
}

/// A group header together with its entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogGroup {
    /// Group metadata.
    pub header: GroupHeader,
    /// Entries in LSN order.
    pub entries: Vec<LogEntry>,
}

impl LogGroup {
    /// Bytes the group covers.
    pub fn size(&self) -> u64 {
        self.header.end_lsn.distance_from(self.header.start_lsn)
    }
}
