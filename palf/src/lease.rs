//! Leader lease and follower election deadline.
//!
//! A leader keeps its role only while a quorum keeps answering it: every
//! replication round that reaches a quorum of acceptors renews the lease for
//! `leader_lease`. Once the lease runs out the leader steps down on its own,
//! without waiting to hear about a higher proposal id.
//!
//! Followers run the mirror image: every push from the current leader
//! refreshes their contact time, and a voter that hears nothing for
//! `election_timeout` plus a random jitter starts a campaign.
//!
//! ## Raft Comparison
//!
//! | Aspect | Raft | PALF |
//! |---|---|---|
//! | **Lease holder** | Leader | Leader |
//! | **Renewal** | Heartbeat ACKs from a majority | Push ACKs from a quorum of every active list |
//! | **On expiry** | Leader steps down (check-quorum) | Leader steps down, keeps its proposal id |
//! | **Follower side** | Randomized election timeout | `election_timeout` + jitter |
//!
//! `leader_lease < election_timeout` is enforced by
//! [`PalfConfig::validate`](crate::config::PalfConfig::validate): the old
//! leader stops appending before any follower is allowed to campaign.

use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;

/// Time-bounded right to act as leader.
#[derive(Debug, Clone, Default)]
pub struct LeaseState {
    valid_until: Option<Instant>,
}

impl LeaseState {
    /// A lease that is not valid yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Extend the lease to `now + duration`. Never shortens it.
    pub fn renew(&mut self, now: Instant, duration: Duration) {
        let until = now + duration;
        if self.valid_until.is_none_or(|current| until > current) {
            self.valid_until = Some(until);
        }
    }

    /// Whether the lease still holds at `now`.
    pub fn is_valid(&self, now: Instant) -> bool {
        self.valid_until.is_some_and(|until| now < until)
    }

    /// Time left at `now`, zero once expired.
    pub fn remaining(&self, now: Instant) -> Duration {
        self.valid_until
            .map_or(Duration::ZERO, |until| until.saturating_duration_since(now))
    }
}

/// Random extra wait added to the election timeout so that voters which
/// lost their leader at the same moment don't all campaign together.
pub fn election_jitter(election_timeout: Duration) -> Duration {
    let max_ms = (election_timeout.as_millis() / 2).max(1) as u64;
    Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
}
