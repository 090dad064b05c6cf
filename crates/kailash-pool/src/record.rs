//! Connection records
//!
//! Every physical connection the pool owns is tracked by one
//! [`ConnectionRecord`]. Records are only touched under the pool's state lock;
//! the [`ConnectionInfo`] view is what leaves the pool through `stats()`.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::connection::Connection;

/// Pool-unique connection identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub(crate) const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw numeric id
    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Lifecycle state of a connection record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Available for checkout
    Idle,
    /// Checked out by exactly one caller
    Active,
    /// Declared unusable; about to be destroyed
    Failed,
    /// Being closed
    Recycling,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Active => write!(f, "active"),
            Self::Failed => write!(f, "failed"),
            Self::Recycling => write!(f, "recycling"),
        }
    }
}

/// Why a connection left the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecycleReason {
    /// Health score fell below the threshold
    Unhealthy,
    /// Older than `max_lifetime`
    MaxLifetime,
    /// Idle longer than `max_idle_time`
    IdleTimeout,
    /// Surplus after the adaptive target shrank
    Shrink,
    /// Pool shut down
    Shutdown,
    /// The connection was reported lost during a query
    Broken,
}

impl RecycleReason {
    /// All reasons, in exposition order
    pub const ALL: [RecycleReason; 6] = [
        Self::Unhealthy,
        Self::MaxLifetime,
        Self::IdleTimeout,
        Self::Shrink,
        Self::Shutdown,
        Self::Broken,
    ];

    /// Label value for metrics
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unhealthy => "unhealthy",
            Self::MaxLifetime => "max_lifetime",
            Self::IdleTimeout => "idle_timeout",
            Self::Shrink => "shrink",
            Self::Shutdown => "shutdown",
            Self::Broken => "broken",
        }
    }
}

impl fmt::Display for RecycleReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A pooled physical connection and its bookkeeping
pub(crate) struct ConnectionRecord {
    pub(crate) id: ConnectionId,
    pub(crate) conn: Arc<dyn Connection>,
    pub(crate) created_at: Instant,
    pub(crate) last_used: Instant,
    pub(crate) state: ConnectionState,
    pub(crate) health: f64,
    /// Bumped on every checkout; a release must present the current value
    pub(crate) lease: u64,
    /// Set when a query reported the physical connection as lost
    pub(crate) broken: bool,
    /// Taken off the idle stack by the health monitor
    pub(crate) probing: bool,
    pub(crate) uses: u64,
}

impl ConnectionRecord {
    pub(crate) fn new(id: ConnectionId, conn: Arc<dyn Connection>, now: Instant) -> Self {
        Self {
            id,
            conn,
            created_at: now,
            last_used: now,
            state: ConnectionState::Idle,
            health: 100.0,
            lease: 0,
            broken: false,
            probing: false,
            uses: 0,
        }
    }

    /// Mark active and hand out a fresh lease
    pub(crate) fn checkout(&mut self, now: Instant) -> u64 {
        self.state = ConnectionState::Active;
        self.last_used = now;
        self.lease += 1;
        self.uses += 1;
        self.lease
    }

    pub(crate) fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.created_at)
    }

    pub(crate) fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_used)
    }

    /// First reason this record must not be handed out again, if any.
    /// The idle check only applies to records that are actually idle.
    pub(crate) fn recycle_reason(
        &self,
        now: Instant,
        health_threshold: f64,
        max_lifetime: Duration,
        max_idle_time: Duration,
    ) -> Option<RecycleReason> {
        if self.broken {
            Some(RecycleReason::Broken)
        } else if self.health < health_threshold {
            Some(RecycleReason::Unhealthy)
        } else if self.age(now) > max_lifetime {
            Some(RecycleReason::MaxLifetime)
        } else if self.state == ConnectionState::Idle && self.idle_for(now) > max_idle_time {
            Some(RecycleReason::IdleTimeout)
        } else {
            None
        }
    }

    pub(crate) fn info(&self, now: Instant) -> ConnectionInfo {
        ConnectionInfo {
            id: self.id,
            state: self.state,
            health: self.health,
            age: self.age(now),
            idle_for: if self.state == ConnectionState::Active {
                Duration::ZERO
            } else {
                self.idle_for(now)
            },
            uses: self.uses,
        }
    }
}

/// Point-in-time view of one connection
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionInfo {
    /// Connection id
    pub id: ConnectionId,
    /// Lifecycle state
    pub state: ConnectionState,
    /// Health score (0-100)
    pub health: f64,
    /// Time since creation
    pub age: Duration,
    /// Time since last release (zero while active)
    pub idle_for: Duration,
    /// Number of checkouts
    pub uses: u64,
}
