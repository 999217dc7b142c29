//! # PALF: Paxos-replicated append-only log
//!
//! This crate implements the log engine of one partition: an append-only log
//! addressed by LSN (byte offset) and SCN (logical timestamp), replicated to
//! a member set with a single leader and majority commit, with online
//! membership changes, cursors over the committed prefix and recycling of
//! the old part of the log.
//!
//! ## PALF vs Raft: A Mental Model
//!
//! | PALF Concept | Raft Equivalent | Notes |
//! |---|---|---|
//! | **Proposal id** | Term | Persisted, strictly increases on every leadership change |
//! | **Acceptor** | Voter | Counts toward `replica_num / 2 + 1` |
//! | **Learner** | Non-voter | Receives the log, never counts |
//! | **Group** | Batch of entries | Entries frozen together under one proposal id |
//! | **Prepare** | RequestVote | Any voter with a higher proposal id gets the promise |
//! | **PushLog** | AppendEntries | Matched on `(prev_lsn, prev_proposal_id)` |
//! | **Reconfirm entry** | No-op at term start | Commit by counting only covers it and later |
//! | **Pending config entry** | `C_old,new` | Commit needs a quorum of both lists |
//!
//! ## Key Differences from Raft
//!
//! 1. **Addresses are byte offsets.** An entry at `lsn` ends at
//!    `lsn + 32 + payload.len()`; the next entry starts there. SCNs are
//!    assigned alongside, never below the caller's `min_scn` and strictly
//!    increasing on the leader.
//!
//! 2. **A candidate pulls instead of being refused.** Acceptors promise any
//!    voter asking with a higher proposal id. The candidate then pulls the
//!    freshest log among its promisers before it logs anything.
//!
//! 3. **Membership is a full list per entry.** Every change logs the whole
//!    new list. While it is uncommitted, commits need a quorum of the applied
//!    and of the pending list. Newly voting acceptors only count once they
//!    caught up.
//!
//! 4. **Access modes.** A group either assigns addresses itself (`Append`) or
//!    takes entries that already carry them (`RawWrite`, for restore and
//!    migration). The switch is a log entry applied on commit.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │          PalfEnv  ──open──>  PalfHandle / Guard          │
//! └──────────────────────┬───────────────────────────────────┘
//!                        │ append / reconfigure / seek
//!                        ▼
//! ┌──────────────────────────────────────────────────────────┐
//! │                     PalfReplica                          │
//! │  access mode ─> replication ─> membership (quorum)       │
//! │  election, lease, catch-up, background loops             │
//! └───────────┬──────────────────────────────┬───────────────┘
//!             │ LogStore                      │ LogTransport
//!             ▼                              ▼
//! ┌───────────────────┐          ┌───────────────────────────┐
//! │    LogStorage      │          │  other replicas'          │
//! │  entries, groups,  │          │  ReplicaEndpoint          │
//! │  meta              │          │                           │
//! └───────────────────┘          └───────────────────────────┘
//! ```
//!
//! ## Crate Organization
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`types`] | `Lsn`, `Scn`, `ProposalId`, `LogEntry`, groups, roles and modes |
//! | [`error`] | `PalfError` |
//! | [`config`] | `PalfConfig` |
//! | [`storage`] | `LogStorage` trait and `InMemoryLogStorage` |
//! | [`log_store`] | Addressing, groups, commit watermark, recycling |
//! | [`membership`] | Member lists, changes, quorum arithmetic |
//! | [`messages`] | Replica-to-replica messages |
//! | [`transport`] | `LogTransport` trait and `InMemoryNetwork` |
//! | [`lease`] | Leader lease and election jitter |
//! | [`replica`] | `PalfReplica`: state, recovery, commit application |
//! | [`replication`] | Append, raw write, push rounds, log matching |
//! | [`election`] | Campaign, leader transfer, background loops |
//! | [`catchup`] | Log pull before leading |
//! | [`reconfig`] | Membership changes |
//! | [`access_mode`] | Access mode switch |
//! | [`iterator`] | `EntryIterator` and `GroupIterator` |
//! | [`handle`] | `PalfEnv`, `PalfHandle`, `PalfHandleGuard` |

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

pub mod access_mode;
pub mod catchup;
pub mod config;
pub mod election;
pub mod error;
pub mod handle;
pub mod iterator;
pub mod lease;
pub mod log_store;
pub mod membership;
pub mod messages;
pub mod reconfig;
pub mod replica;
pub mod replication;
pub mod storage;
pub mod transport;
pub mod types;

// Re-export key types at crate root for convenience
pub use access_mode::AccessModeMeta;
pub use config::PalfConfig;
pub use error::PalfError;
pub use handle::{LocationCacheCb, PalfEnv, PalfHandle, PalfHandleGuard};
pub use iterator::{EntryIterator, GroupIterator, ReadMode};
pub use membership::{ConfigChange, ConfigVersion, GroupMember, MemberList};
pub use replica::PalfReplica;
pub use storage::{InMemoryLogStorage, LogMeta, LogStorage};
pub use transport::{InMemoryNetwork, LogTransport, ReplicaEndpoint};
pub use types::{
    AccessMode, AppendOptions, EntryKind, GroupHeader, GroupId, LogEntry, LogGroup, Lsn, NodeId,
    ProposalId, Role, Scn, LOG_ENTRY_HEADER_SIZE,
};
