//! Engine configuration.
//!
//! [`PalfConfig`] is a plain struct. Every field has a production default,
//! [`PalfConfig::for_testing`] shrinks the timers so in-process clusters
//! converge quickly, and [`PalfConfig::from_json`] loads a partial override
//! on top of the defaults.
//!
//! ## Tuning Guidelines
//!
//! - `leader_lease` must be shorter than `election_timeout`: a leader that
//!   lost contact with its quorum has to stop accepting appends before a
//!   follower starts campaigning.
//! - `heartbeat_interval` should be a fraction of `election_timeout` so a
//!   few lost pushes don't trigger an election.
//! - `max_inflight_bytes` bounds how far non-blocking appends may run ahead
//!   of the commit watermark.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::PalfError;

/// Configuration shared by every group an env hosts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PalfConfig {
    /// Size of a log segment, the unit of coarse locate and of recycling.
    pub log_segment_size: u64,

    /// Uncommitted bytes beyond which non-blocking appends fail with
    /// `Backpressure`.
    pub max_inflight_bytes: u64,

    /// Upper bound on the bytes shipped to one peer in one push.
    pub max_push_bytes: u64,

    /// How far (in bytes) a newly promoted acceptor may lag behind the
    /// committed LSN before it starts counting toward the quorum.
    pub catch_up_lag_threshold: u64,

    /// Follower silence after which a voter starts campaigning.
    pub election_timeout: Duration,

    /// Interval of leader pushes when there is nothing to replicate.
    pub heartbeat_interval: Duration,

    /// How long a leader keeps leading without majority contact.
    pub leader_lease: Duration,

    /// Pause between replication rounds of a waiting caller.
    pub retry_interval: Duration,

    /// Time a fresh leader has to commit its reconfirm entry.
    pub reconfirm_timeout: Duration,

    /// Time a transfer target has to catch up before transfer fails.
    pub leader_transfer_timeout: Duration,

    /// Use the wall clock as an SCN hint.
    pub wall_clock_scn: bool,

    /// Spawn replication and election loops when a group is created.
    /// Requires a `tokio::task::LocalSet`.
    pub background_workers: bool,
}

impl Default for PalfConfig {
    fn default() -> Self {
        Self {
            log_segment_size: 64 * 1024 * 1024,
            max_inflight_bytes: 64 * 1024 * 1024,
            max_push_bytes: 2 * 1024 * 1024,
            catch_up_lag_threshold: 0,
            election_timeout: Duration::from_secs(4),
            heartbeat_interval: Duration::from_millis(500),
            leader_lease: Duration::from_secs(3),
            retry_interval: Duration::from_millis(10),
            reconfirm_timeout: Duration::from_secs(5),
            leader_transfer_timeout: Duration::from_secs(10),
            wall_clock_scn: true,
            background_workers: true,
        }
    }
}

impl PalfConfig {
    /// Small segments, fast timers, deterministic SCNs and no background
    /// loops. Tests drive replication explicitly.
    pub fn for_testing() -> Self {
        Self {
            log_segment_size: 1024,
            max_inflight_bytes: 64 * 1024,
            max_push_bytes: 16 * 1024,
            catch_up_lag_threshold: 0,
            election_timeout: Duration::from_millis(300),
            heartbeat_interval: Duration::from_millis(20),
            leader_lease: Duration::from_millis(200),
            retry_interval: Duration::from_millis(2),
            reconfirm_timeout: Duration::from_millis(500),
            leader_transfer_timeout: Duration::from_millis(500),
            wall_clock_scn: false,
            background_workers: false,
        }
    }

    /// Parse a JSON document; missing fields keep their defaults.
    pub fn from_json(json: &str) -> Result<Self, PalfError> {
        let config: PalfConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the engine can't run with.
    pub fn validate(&self) -> Result<(), PalfError> {
        if self.log_segment_size == 0 {
            return Err(PalfError::InvalidArgument(
                "log_segment_size must be positive".into(),
            ));
        }
        if self.max_push_bytes == 0 {
            return Err(PalfError::InvalidArgument(
                "max_push_bytes must be positive".into(),
            ));
        }
        if self.leader_lease >= self.election_timeout {
            return Err(PalfError::InvalidArgument(format!(
                "leader_lease {:?} must be shorter than election_timeout {:?}",
                self.leader_lease, self.election_timeout
            )));
        }
        if self.heartbeat_interval >= self.leader_lease {
            return Err(PalfError::InvalidArgument(format!(
                "heartbeat_interval {:?} must be shorter than leader_lease {:?}",
                self.heartbeat_interval, self.leader_lease
            )));
        }
        Ok(())
    }
}
