//! Per-key amount cache with TTL, request coalescing and generation-guarded
//! invalidation.
//!
//! Every `(address, kind)` pair owns one slot. A slot has at most one live
//! fetch; callers arriving while it runs subscribe to its result instead of
//! issuing another network call. `invalidate` bumps the slot's generation so
//! a result from a fetch started before the reset can never overwrite the
//! result of a fetch started after it.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::FutureExt;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{Result, TrackerError};
use crate::models::{Amount, CacheEntry, CacheKey, EntryState};

const EVENT_CAPACITY: usize = 1024;

/// Published on every entry state transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheEvent {
    pub key: CacheKey,
    pub state: EntryState,
}

/// Cache statistics for monitoring
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Reads answered from a fresh entry
    pub hits: u64,
    /// Underlying fetches started
    pub fetches: u64,
    /// Reads attached to a fetch already in flight
    pub joins: u64,
}

struct InFlight {
    generation: u64,
    done: broadcast::Sender<Result<Amount>>,
}

struct Slot {
    value: Option<Amount>,
    fetched_at: Option<Instant>,
    state: EntryState,
    error: Option<TrackerError>,
    /// When the last fetch failed; an Errored slot is not retried within its TTL
    failed_at: Option<Instant>,
    generation: u64,
    /// Generation of the most recently started fetch
    last_started: u64,
    in_flight: Option<InFlight>,
    last_access: Instant,
}

impl Slot {
    fn new() -> Self {
        Self {
            value: None,
            fetched_at: None,
            state: EntryState::Idle,
            error: None,
            failed_at: None,
            generation: 0,
            last_started: 0,
            in_flight: None,
            last_access: Instant::now(),
        }
    }

    fn snapshot(&self) -> CacheEntry {
        CacheEntry {
            value: self.value,
            fetched_at: self.fetched_at,
            state: self.state,
            error: self.error.clone(),
            generation: self.generation,
        }
    }
}

enum Plan {
    Hit(Amount),
    Failed(TrackerError),
    Join(broadcast::Receiver<Result<Amount>>),
    Start {
        generation: u64,
        done: broadcast::Sender<Result<Amount>>,
        waiter: broadcast::Receiver<Result<Amount>>,
    },
}

/// Shared amount cache. Cloning is cheap and every clone sees the same slots.
#[derive(Clone)]
pub struct QueryCache {
    entries: Arc<DashMap<CacheKey, Slot>>,
    events: broadcast::Sender<CacheEvent>,
    hits: Arc<AtomicU64>,
    fetches: Arc<AtomicU64>,
    joins: Arc<AtomicU64>,
}

impl QueryCache {
    pub fn new() -> Self {
        Self::with_event_capacity(EVENT_CAPACITY)
    }

    /// Cache whose event channel buffers `capacity` transitions per subscriber
    pub fn with_event_capacity(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity);
        Self {
            entries: Arc::new(DashMap::new()),
            events,
            hits: Arc::new(AtomicU64::new(0)),
            fetches: Arc::new(AtomicU64::new(0)),
            joins: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Read `key`, fetching it with `fetch` when absent or older than `ttl`.
    ///
    /// Concurrent callers for the same key share a single underlying fetch.
    /// The fetch runs on its own task, so dropping the calling future does
    /// not strand the other waiters.
    pub async fn get<F, Fut>(&self, key: CacheKey, ttl: Duration, fetch: F) -> Result<Amount>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Amount>> + Send + 'static,
    {
        let plan = {
            let mut slot = self.entries.entry(key).or_insert_with(Slot::new);
            slot.last_access = Instant::now();

            let fresh = slot.state == EntryState::Ready
                && slot.fetched_at.map(|at| at.elapsed() < ttl).unwrap_or(false);
            let backing_off = slot.state == EntryState::Errored
                && slot.failed_at.map(|at| at.elapsed() < ttl).unwrap_or(false);

            if let (true, Some(value)) = (fresh, slot.value) {
                Plan::Hit(value)
            } else if let Some(waiter) = slot.in_flight.as_ref().map(|f| f.done.subscribe()) {
                Plan::Join(waiter)
            } else if let (true, Some(error)) = (backing_off, slot.error.clone()) {
                Plan::Failed(error)
            } else {
                slot.generation += 1;
                slot.last_started = slot.generation;
                slot.state = EntryState::Loading;

                let (done, waiter) = broadcast::channel(1);
                slot.in_flight = Some(InFlight {
                    generation: slot.generation,
                    done: done.clone(),
                });

                Plan::Start {
                    generation: slot.generation,
                    done,
                    waiter,
                }
            }
        };

        let mut waiter = match plan {
            Plan::Hit(value) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                debug!("Cache hit for {}", key);
                return Ok(value);
            }
            Plan::Failed(error) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                debug!("{} failed recently, not retrying before its TTL", key);
                return Err(error);
            }
            Plan::Join(waiter) => {
                self.joins.fetch_add(1, Ordering::Relaxed);
                debug!("Joining in-flight fetch for {}", key);
                waiter
            }
            Plan::Start {
                generation,
                done,
                waiter,
            } => {
                self.fetches.fetch_add(1, Ordering::Relaxed);
                debug!("Fetching {} (generation {})", key, generation);
                self.emit(key, EntryState::Loading);

                let future = fetch();
                let cache = self.clone();
                tokio::spawn(async move {
                    let outcome = match AssertUnwindSafe(future).catch_unwind().await {
                        Ok(outcome) => outcome,
                        Err(_) => Err(TrackerError::TransientFetch(
                            "fetch task panicked".to_string(),
                        )),
                    };
                    cache.complete(key, generation, &outcome);
                    let _ = done.send(outcome);
                });

                waiter
            }
        };

        waiter.recv().await.unwrap_or_else(|_| {
            Err(TrackerError::TransientFetch(format!(
                "fetch for {} ended without a result",
                key
            )))
        })
    }

    /// Apply a finished fetch to its slot, honouring the generation guard
    fn complete(&self, key: CacheKey, generation: u64, outcome: &Result<Amount>) {
        let state = {
            let Some(mut slot) = self.entries.get_mut(&key) else {
                debug!("Dropping result for evicted key {}", key);
                return;
            };

            let current = slot.in_flight.as_ref().map(|f| f.generation) == Some(generation);
            if !current {
                // Invalidated while running. Keep the data only if nothing
                // newer has been started since, and leave the slot unstamped
                // so the next read still refetches.
                if slot.last_started == generation {
                    if let Ok(value) = outcome {
                        slot.value = Some(*value);
                    }
                    debug!(
                        "Stored superseded result for {} without freshness (generation {})",
                        key, generation
                    );
                } else {
                    debug!(
                        "Dropped stale result for {} (generation {}, latest {})",
                        key, generation, slot.last_started
                    );
                }
                return;
            }

            slot.in_flight = None;
            match outcome {
                Ok(value) => {
                    slot.value = Some(*value);
                    slot.fetched_at = Some(Instant::now());
                    slot.state = EntryState::Ready;
                    slot.error = None;
                    slot.failed_at = None;
                }
                Err(e) => {
                    // The previous value, if any, stays visible.
                    warn!("Fetch for {} failed: {}", key, e);
                    slot.state = EntryState::Errored;
                    slot.error = Some(e.clone());
                    slot.failed_at = Some(Instant::now());
                }
            }
            slot.state
        };

        self.emit(key, state);
    }

    /// Reset `key` to Idle so the next read starts a fresh fetch.
    ///
    /// A fetch already running keeps delivering to the callers that were
    /// waiting on it, but its result no longer refreshes the slot.
    pub fn invalidate(&self, key: &CacheKey) -> bool {
        {
            let Some(mut slot) = self.entries.get_mut(key) else {
                return false;
            };
            slot.generation += 1;
            slot.in_flight = None;
            slot.state = EntryState::Idle;
            slot.value = None;
            slot.fetched_at = None;
            slot.error = None;
            slot.failed_at = None;
        }

        debug!("Invalidated {}", key);
        self.emit(*key, EntryState::Idle);
        true
    }

    /// Create an Idle slot for `key` if none exists yet
    pub fn reference(&self, key: CacheKey) {
        self.entries
            .entry(key)
            .or_insert_with(Slot::new)
            .last_access = Instant::now();
    }

    /// Snapshot of the entry for `key`
    pub fn entry(&self, key: &CacheKey) -> Option<CacheEntry> {
        self.entries.get(key).map(|slot| slot.snapshot())
    }

    pub fn is_in_flight(&self, key: &CacheKey) -> bool {
        self.entries
            .get(key)
            .map(|slot| slot.in_flight.is_some())
            .unwrap_or(false)
    }

    /// Subscribe to entry state transitions
    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.events.subscribe()
    }

    /// Drop every entry that is not fetching
    pub fn evict_all(&self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, slot| slot.in_flight.is_some());
        before.saturating_sub(self.entries.len())
    }

    /// Drop entries that are not fetching and were not read within `retention`
    pub fn evict_idle(&self, retention: Duration) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, slot| slot.in_flight.is_some() || slot.last_access.elapsed() < retention);
        let evicted = before.saturating_sub(self.entries.len());
        if evicted > 0 {
            debug!("Evicted {} idle cache entries", evicted);
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            fetches: self.fetches.load(Ordering::Relaxed),
            joins: self.joins.load(Ordering::Relaxed),
        }
    }

    fn emit(&self, key: CacheKey, state: EntryState) {
        // No subscribers is fine.
        let _ = self.events.send(CacheEvent { key, state });
    }
}

impl Default for QueryCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Address, QueryKind};
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::oneshot;

    fn key(byte: u8) -> CacheKey {
        CacheKey::new(Address::from([byte; 20]), QueryKind::ClaimableAmount)
    }

    const TTL: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn test_concurrent_gets_share_one_fetch() {
        let cache = QueryCache::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let release_rx = Arc::new(tokio::sync::Mutex::new(Some(release_rx)));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let cache = cache.clone();
            let calls = calls.clone();
            let release_rx = release_rx.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get(key(1), TTL, move || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        if let Some(rx) = release_rx.lock().await.take() {
                            let _ = rx.await;
                        }
                        Ok(Amount::from(42u64))
                    })
                    .await
            }));
        }

        // Let every caller attach before the fetch resolves.
        tokio::time::sleep(Duration::from_millis(20)).await;
        release_tx.send(()).unwrap();

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), Amount::from(42u64));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.stats().fetches, 1);
    }

    #[tokio::test]
    async fn test_fresh_entry_is_served_from_cache() {
        let cache = QueryCache::new();
        let calls = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let calls = calls.clone();
            let value = cache
                .get(key(2), TTL, move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(Amount::from(7u64))
                })
                .await
                .unwrap();
            assert_eq!(value, Amount::from(7u64));
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.stats().hits, 2);
        assert_eq!(cache.entry(&key(2)).unwrap().state, EntryState::Ready);
    }

    #[tokio::test]
    async fn test_expired_entry_is_refetched() {
        let cache = QueryCache::new();
        let ttl = Duration::from_millis(50);

        cache
            .get(key(3), ttl, || async { Ok(Amount::from(1u64)) })
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(60)).await;

        let value = cache
            .get(key(3), ttl, || async { Ok(Amount::from(2u64)) })
            .await
            .unwrap();
        assert_eq!(value, Amount::from(2u64));
        assert_eq!(cache.stats().fetches, 2);
    }

    #[tokio::test]
    async fn test_error_keeps_previous_value() {
        let cache = QueryCache::new();

        cache
            .get(key(4), Duration::ZERO, || async { Ok(Amount::from(100u64)) })
            .await
            .unwrap();

        let err = cache
            .get(key(4), Duration::ZERO, || async {
                Err(TrackerError::TransientFetch("rpc down".to_string()))
            })
            .await
            .unwrap_err();
        assert!(err.is_transient());

        let entry = cache.entry(&key(4)).unwrap();
        assert_eq!(entry.state, EntryState::Errored);
        assert_eq!(entry.value, Some(Amount::from(100u64)));
        assert!(entry.error.is_some());
    }

    #[tokio::test]
    async fn test_errored_entry_waits_for_ttl_before_retrying() {
        let cache = QueryCache::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let failing = |calls: Arc<AtomicUsize>| move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<Amount, _>(TrackerError::TransientFetch("rpc down".to_string()))
        };
        let ttl = Duration::from_millis(30);

        assert!(cache.get(key(9), ttl, failing(calls.clone())).await.is_err());
        let err = cache.get(key(9), ttl, failing(calls.clone())).await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.entry(&key(9)).unwrap().state, EntryState::Errored);

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(cache.get(key(9), ttl, failing(calls.clone())).await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        // Invalidation retries straight away.
        cache.invalidate(&key(9));
        let value = cache
            .get(key(9), ttl, || async { Ok(Amount::from(3u64)) })
            .await
            .unwrap();
        assert_eq!(value, Amount::from(3u64));
    }

    #[tokio::test]
    async fn test_invalidate_forces_refetch() {
        let cache = QueryCache::new();

        cache
            .get(key(5), TTL, || async { Ok(Amount::from(100u64)) })
            .await
            .unwrap();
        assert!(cache.invalidate(&key(5)));

        let entry = cache.entry(&key(5)).unwrap();
        assert_eq!(entry.state, EntryState::Idle);
        assert_eq!(entry.value, None);

        let value = cache
            .get(key(5), TTL, || async { Ok(Amount::ZERO) })
            .await
            .unwrap();
        assert_eq!(value, Amount::ZERO);
        assert_eq!(cache.stats().fetches, 2);
    }

    #[tokio::test]
    async fn test_slow_superseded_fetch_cannot_overwrite_newer_result() {
        let cache = QueryCache::new();
        let (slow_tx, slow_rx) = oneshot::channel::<()>();

        let slow = {
            let cache = cache.clone();
            tokio::spawn(async move {
                cache
                    .get(key(6), TTL, move || async move {
                        let _ = slow_rx.await;
                        Ok(Amount::from(1u64))
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        cache.invalidate(&key(6));
        let fast = cache
            .get(key(6), TTL, || async { Ok(Amount::from(2u64)) })
            .await
            .unwrap();
        assert_eq!(fast, Amount::from(2u64));

        slow_tx.send(()).unwrap();
        // The first caller still receives the result it asked for.
        assert_eq!(slow.await.unwrap().unwrap(), Amount::from(1u64));

        let entry = cache.entry(&key(6)).unwrap();
        assert_eq!(entry.value, Some(Amount::from(2u64)));
        assert_eq!(entry.state, EntryState::Ready);
    }

    #[tokio::test]
    async fn test_superseded_result_without_newer_fetch_is_not_fresh() {
        let cache = QueryCache::new();
        let (slow_tx, slow_rx) = oneshot::channel::<()>();

        let slow = {
            let cache = cache.clone();
            tokio::spawn(async move {
                cache
                    .get(key(7), TTL, move || async move {
                        let _ = slow_rx.await;
                        Ok(Amount::from(9u64))
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        cache.invalidate(&key(7));
        slow_tx.send(()).unwrap();
        slow.await.unwrap().unwrap();

        let entry = cache.entry(&key(7)).unwrap();
        assert_eq!(entry.state, EntryState::Idle);
        assert_eq!(entry.value, Some(Amount::from(9u64)));
        assert!(!entry.is_fresh(TTL));

        cache
            .get(key(7), TTL, || async { Ok(Amount::from(10u64)) })
            .await
            .unwrap();
        assert_eq!(cache.stats().fetches, 2);
    }

    #[tokio::test]
    async fn test_events_follow_transitions() {
        let cache = QueryCache::new();
        let mut events = cache.subscribe();

        cache
            .get(key(8), TTL, || async { Ok(Amount::from(3u64)) })
            .await
            .unwrap();
        cache.invalidate(&key(8));

        let states: Vec<EntryState> = (0..3)
            .map(|_| events.try_recv().unwrap().state)
            .collect();
        assert_eq!(
            states,
            vec![EntryState::Loading, EntryState::Ready, EntryState::Idle]
        );
    }

    #[tokio::test]
    async fn test_evict_idle_keeps_recent_entries() {
        let cache = QueryCache::new();
        cache.reference(key(9));
        tokio::time::sleep(Duration::from_millis(30)).await;
        cache.reference(key(10));

        assert_eq!(cache.evict_idle(Duration::from_millis(20)), 1);
        assert!(cache.entry(&key(9)).is_none());
        assert!(cache.entry(&key(10)).is_some());

        assert_eq!(cache.evict_all(), 1);
        assert!(cache.is_empty());
    }
}
