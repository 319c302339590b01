use std::collections::HashSet;
use std::sync::{Arc, RwLock};

use futures::future::join_all;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::{CacheEvent, QueryCache};
use crate::error::Result;
use crate::models::{Address, Amount, CacheKey, EntryState, QueryKind, QueryPolicy, QueryResult};
use crate::traits::ledger_client::RemoteLedgerClient;
use crate::utils::helper::recover_poisoned;

struct RunnerShared {
    kind: QueryKind,
    policy: QueryPolicy,
    cache: QueryCache,
    ledger: Arc<dyn RemoteLedgerClient>,
    addresses: RwLock<Vec<Address>>,
    updates: watch::Sender<Vec<QueryResult>>,
}

impl RunnerShared {
    fn tracked(&self) -> Vec<Address> {
        self.addresses
            .read()
            .unwrap_or_else(recover_poisoned("runner addresses"))
            .clone()
    }

    fn is_tracked(&self, address: &Address) -> bool {
        self.addresses
            .read()
            .unwrap_or_else(recover_poisoned("runner addresses"))
            .contains(address)
    }

    fn results(&self) -> Vec<QueryResult> {
        self.tracked()
            .into_iter()
            .map(|address| {
                match self.cache.entry(&CacheKey::new(address, self.kind)) {
                    Some(entry) => QueryResult::from_entry(address, &entry),
                    None => QueryResult::pending(address),
                }
            })
            .collect()
    }

    fn publish(&self) {
        self.updates.send_replace(self.results());
    }

    async fn fetch(&self, address: Address) -> Result<Amount> {
        let key = CacheKey::new(address, self.kind);
        let ledger = self.ledger.clone();
        let kind = self.kind;
        self.cache
            .get(key, self.policy.ttl, move || async move {
                ledger.read(kind, &address).await
            })
            .await
    }

    fn spawn_fetch(self: &Arc<Self>, address: Address) {
        let shared = self.clone();
        tokio::spawn(async move {
            if let Err(e) = shared.fetch(address).await {
                debug!("{} read for {} failed: {}", shared.kind, address, e);
            }
        });
    }
}

/// Runs one cache-backed query per tracked address for a single query kind.
///
/// Results are always reported in the order of the tracked address list and
/// republished on every state transition of a tracked entry. Invalidated
/// entries that are still tracked are refetched straight away.
pub struct BatchQueryRunner {
    shared: Arc<RunnerShared>,
    listener: JoinHandle<()>,
}

impl BatchQueryRunner {
    /// Create a runner. Must be called from within a tokio runtime.
    pub fn new(
        kind: QueryKind,
        policy: QueryPolicy,
        cache: QueryCache,
        ledger: Arc<dyn RemoteLedgerClient>,
    ) -> Self {
        let (updates, _) = watch::channel(Vec::new());
        let events = cache.subscribe();
        let shared = Arc::new(RunnerShared {
            kind,
            policy,
            cache,
            ledger,
            addresses: RwLock::new(Vec::new()),
            updates,
        });

        let listener = tokio::spawn(Self::listen(shared.clone(), events));

        Self { shared, listener }
    }

    async fn listen(shared: Arc<RunnerShared>, mut events: broadcast::Receiver<CacheEvent>) {
        loop {
            match events.recv().await {
                Ok(CacheEvent { key, state }) => {
                    if key.kind != shared.kind || !shared.is_tracked(&key.address) {
                        continue;
                    }
                    if state == EntryState::Idle {
                        debug!("{} invalidated, refetching", key);
                        shared.spawn_fetch(key.address);
                    }
                    shared.publish();
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    // A missed Idle event would leave an invalidated key unread
                    warn!(
                        "{} runner skipped {} cache events, rereading tracked keys",
                        shared.kind, skipped
                    );
                    for address in shared.tracked() {
                        shared.spawn_fetch(address);
                    }
                    shared.publish();
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    pub fn kind(&self) -> QueryKind {
        self.shared.kind
    }

    pub fn policy(&self) -> QueryPolicy {
        self.shared.policy
    }

    /// Tracked addresses in order
    pub fn addresses(&self) -> Vec<Address> {
        self.shared.tracked()
    }

    /// Replace the tracked address list.
    ///
    /// New addresses get a fetch (answered from cache when still fresh).
    /// Removed addresses only lose their subscription; their cached values
    /// stay put so re-adding them within the TTL costs no network call.
    pub fn set_addresses(&self, addresses: Vec<Address>) {
        let mut seen = HashSet::new();
        let addresses: Vec<Address> = addresses.into_iter().filter(|a| seen.insert(*a)).collect();

        let added: Vec<Address> = {
            let mut current = self
                .shared
                .addresses
                .write()
                .unwrap_or_else(recover_poisoned("runner addresses"));
            let previous: HashSet<Address> = current.iter().copied().collect();
            let added = addresses
                .iter()
                .filter(|a| !previous.contains(a))
                .copied()
                .collect::<Vec<_>>();
            let removed = previous.iter().filter(|a| !seen.contains(a)).count();
            if !added.is_empty() || removed > 0 {
                info!(
                    "{} runner tracking {} addresses (+{} -{})",
                    self.shared.kind,
                    addresses.len(),
                    added.len(),
                    removed
                );
            }
            *current = addresses;
            added
        };

        for address in added {
            self.shared.cache.reference(CacheKey::new(address, self.shared.kind));
            self.shared.spawn_fetch(address);
        }
        self.shared.publish();
    }

    /// Read every tracked key, fetching the ones that are stale.
    ///
    /// A failing address never affects its siblings; its error is kept on
    /// its own entry.
    pub async fn refresh(&self) -> Vec<QueryResult> {
        let addresses = self.shared.tracked();
        join_all(addresses.into_iter().map(|address| self.shared.fetch(address))).await;
        self.results()
    }

    /// Read a single address through the cache
    pub async fn fetch(&self, address: Address) -> Result<Amount> {
        self.shared.fetch(address).await
    }

    /// Current per-address view, aligned with `addresses()`
    pub fn results(&self) -> Vec<QueryResult> {
        self.shared.results()
    }

    /// Receive a fresh result list whenever a tracked entry changes
    pub fn subscribe(&self) -> watch::Receiver<Vec<QueryResult>> {
        self.shared.updates.subscribe()
    }
}

impl Drop for BatchQueryRunner {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::memory_provider::InMemoryLedger;
    use std::time::Duration;

    fn addr(byte: u8) -> Address {
        Address::from([byte; 20])
    }

    fn runner(ledger: Arc<InMemoryLedger>, ttl: Duration) -> BatchQueryRunner {
        BatchQueryRunner::new(
            QueryKind::ClaimableAmount,
            QueryPolicy {
                ttl,
                refetch_on_focus: false,
            },
            QueryCache::new(),
            ledger,
        )
    }

    #[tokio::test]
    async fn test_results_follow_input_order() {
        let ledger = InMemoryLedger::new().into_shared();
        ledger.set_claimable(addr(1), Amount::from(1u64));
        ledger.set_claimable(addr(2), Amount::from(2u64));
        ledger.set_claimable(addr(3), Amount::from(3u64));
        // First address answers last.
        ledger.set_address_latency(addr(1), Duration::from_millis(40));

        let runner = runner(ledger.clone(), Duration::from_secs(60));
        runner.set_addresses(vec![addr(1), addr(2), addr(3)]);

        let results = runner.refresh().await;
        let data: Vec<Option<Amount>> = results.iter().map(|r| r.data).collect();
        assert_eq!(
            data,
            vec![
                Some(Amount::from(1u64)),
                Some(Amount::from(2u64)),
                Some(Amount::from(3u64))
            ]
        );
        assert_eq!(
            results.iter().map(|r| r.address).collect::<Vec<_>>(),
            vec![addr(1), addr(2), addr(3)]
        );
    }

    #[tokio::test]
    async fn test_one_failure_does_not_blank_the_batch() {
        let ledger = InMemoryLedger::new().into_shared();
        ledger.set_claimable(addr(1), Amount::from(5u64));
        ledger.fail_reads_for(addr(2), "provider timeout");

        let runner = runner(ledger.clone(), Duration::from_secs(60));
        runner.set_addresses(vec![addr(1), addr(2)]);
        let results = runner.refresh().await;

        assert_eq!(results[0].state, EntryState::Ready);
        assert_eq!(results[0].data, Some(Amount::from(5u64)));
        assert_eq!(results[1].state, EntryState::Errored);
        assert!(results[1].error.is_some());
    }

    #[tokio::test]
    async fn test_readding_within_ttl_uses_cache() {
        let ledger = InMemoryLedger::new().into_shared();
        ledger.set_claimable(addr(1), Amount::from(5u64));

        let runner = runner(ledger.clone(), Duration::from_secs(60));
        runner.set_addresses(vec![addr(1)]);
        runner.refresh().await;

        runner.set_addresses(vec![]);
        assert!(runner.results().is_empty());

        runner.set_addresses(vec![addr(1)]);
        let results = runner.refresh().await;

        assert_eq!(results[0].data, Some(Amount::from(5u64)));
        assert_eq!(ledger.read_count(QueryKind::ClaimableAmount, &addr(1)), 1);
    }

    #[tokio::test]
    async fn test_readding_after_ttl_fetches_once() {
        let ledger = InMemoryLedger::new().into_shared();
        let runner = runner(ledger.clone(), Duration::from_millis(30));

        runner.set_addresses(vec![addr(1)]);
        runner.refresh().await;
        runner.set_addresses(vec![]);

        tokio::time::sleep(Duration::from_millis(40)).await;

        runner.set_addresses(vec![addr(1)]);
        runner.refresh().await;
        assert_eq!(ledger.read_count(QueryKind::ClaimableAmount, &addr(1)), 2);
    }

    #[tokio::test]
    async fn test_subscribers_see_updates() {
        let ledger = InMemoryLedger::new().into_shared();
        ledger.set_claimable(addr(1), Amount::from(8u64));

        let runner = runner(ledger.clone(), Duration::from_secs(60));
        let mut updates = runner.subscribe();
        runner.set_addresses(vec![addr(1)]);

        let ready = tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                updates.changed().await.unwrap();
                let current = updates.borrow_and_update().clone();
                if current.first().and_then(|r| r.ready_value()).is_some() {
                    return current;
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(ready[0].data, Some(Amount::from(8u64)));
    }

    #[tokio::test]
    async fn test_duplicate_addresses_collapse() {
        let ledger = InMemoryLedger::new().into_shared();
        let runner = runner(ledger, Duration::from_secs(60));
        runner.set_addresses(vec![addr(1), addr(1), addr(2)]);
        assert_eq!(runner.addresses(), vec![addr(1), addr(2)]);
    }

    #[tokio::test]
    async fn test_invalidations_missed_by_a_lagging_listener_are_reread() {
        let ledger = InMemoryLedger::new().into_shared();
        let cache = QueryCache::with_event_capacity(1);
        let runner = BatchQueryRunner::new(
            QueryKind::ClaimableAmount,
            QueryPolicy {
                ttl: Duration::from_secs(60),
                refetch_on_focus: false,
            },
            cache.clone(),
            ledger.clone(),
        );
        let addresses = vec![addr(1), addr(2), addr(3)];
        runner.set_addresses(addresses.clone());
        runner.refresh().await;

        for address in &addresses {
            ledger.set_claimable(*address, Amount::from(7u64));
        }
        // No await in between, so the listener can only see the last event
        for address in &addresses {
            cache.invalidate(&CacheKey::new(*address, QueryKind::ClaimableAmount));
        }

        let results = tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                let results = runner.results();
                if results.iter().all(|r| r.ready_value() == Some(Amount::from(7u64))) {
                    return results;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(results.len(), 3);
    }
}
