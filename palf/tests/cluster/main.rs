//! Multi-replica scenarios over the in-memory network.
//!
//! ## Test Architecture
//!
//! ```text
//! ┌─────────┐  ┌─────────┐  ┌─────────┐
//! │ PalfEnv │  │ PalfEnv │  │ PalfEnv │   ← one env per node, one group each
//! │ node 1  │  │ node 2  │  │ node 3  │
//! └────┬────┘  └────┬────┘  └────┬────┘
//!      └────────────┼────────────┘
//!             InMemoryNetwork             ← isolate / block_link / heal
//! ```
//!
//! Most scenarios run without background loops: a test elects a leader with
//! `campaign` and every blocking call drives its own replication rounds, so
//! the outcome doesn't depend on timer races. Scenarios about timers run
//! the loops on a `LocalSet`.
//!
//! ## Test Organization
//!
//! - `replication`: appends, commit on followers, backpressure, fencing
//! - `leadership`: elections, leader transfer, background failover
//! - `membership`: member and learner changes, joint quorums
//! - `access_mode`: mode switches and raw writes
//! - `recycling`: base LSN, recycling, stale cursors, recovery

mod harness;

mod access_mode;
mod leadership;
mod membership;
mod replication;
