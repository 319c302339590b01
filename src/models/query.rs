use std::fmt;
use std::time::Duration;

use tokio::time::Instant;

use super::address::{Address, Amount};
use crate::error::TrackerError;

/// The two values read for every tracked address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum QueryKind {
    ClaimableAmount,
    TokenBalance,
}

impl QueryKind {
    pub const ALL: [QueryKind; 2] = [QueryKind::ClaimableAmount, QueryKind::TokenBalance];

    /// Default freshness policy for this kind
    pub fn default_policy(&self) -> QueryPolicy {
        match self {
            QueryKind::ClaimableAmount => QueryPolicy {
                ttl: Duration::from_secs(60 * 60 * 24),
                refetch_on_focus: false,
            },
            QueryKind::TokenBalance => QueryPolicy {
                ttl: Duration::from_secs(5 * 60),
                refetch_on_focus: true,
            },
        }
    }
}

impl fmt::Display for QueryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryKind::ClaimableAmount => write!(f, "claimable"),
            QueryKind::TokenBalance => write!(f, "balance"),
        }
    }
}

/// Freshness rules applied to every key of one query kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryPolicy {
    /// Maximum age of a Ready value before it is refetched
    pub ttl: Duration,
    /// Refetch stale keys when the caller regains foreground focus
    pub refetch_on_focus: bool,
}

/// Identifies one cached value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    pub address: Address,
    pub kind: QueryKind,
}

impl CacheKey {
    pub fn new(address: Address, kind: QueryKind) -> Self {
        Self { address, kind }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.address, self.kind)
    }
}

/// Lifecycle of a cache entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryState {
    Idle,
    Loading,
    Ready,
    Errored,
}

/// Read-only snapshot of a cache entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub value: Option<Amount>,
    pub fetched_at: Option<Instant>,
    pub state: EntryState,
    pub error: Option<TrackerError>,
    pub generation: u64,
}

impl CacheEntry {
    /// Whether the value was fetched within `ttl` and has not been invalidated
    pub fn is_fresh(&self, ttl: Duration) -> bool {
        self.state == EntryState::Ready
            && self
                .fetched_at
                .map(|at| at.elapsed() < ttl)
                .unwrap_or(false)
    }
}

/// Per-address view published by the batch runner
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryResult {
    pub address: Address,
    pub state: EntryState,
    pub is_loading: bool,
    pub data: Option<Amount>,
    pub error: Option<TrackerError>,
}

impl QueryResult {
    /// View for an address the cache has never seen
    pub fn pending(address: Address) -> Self {
        Self {
            address,
            state: EntryState::Idle,
            is_loading: true,
            data: None,
            error: None,
        }
    }

    pub fn from_entry(address: Address, entry: &CacheEntry) -> Self {
        Self {
            address,
            state: entry.state,
            // A key with nothing to show yet counts as loading, a refetch over
            // an existing value does not.
            is_loading: entry.value.is_none()
                && matches!(entry.state, EntryState::Loading | EntryState::Idle),
            data: entry.value,
            error: entry.error.clone(),
        }
    }

    /// Value to include in totals
    pub fn ready_value(&self) -> Option<Amount> {
        match self.state {
            EntryState::Ready => self.data,
            _ => None,
        }
    }
}
