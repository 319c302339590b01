//src/tracker/claim_tracker.rs
use std::collections::HashSet;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::cache::QueryCache;
use crate::config::TrackerConfig;
use crate::error::{Result, TrackerError};
use crate::models::{
    Address, CacheKey, EntryState, QueryKind, QueryResult, TrackedAccount, TrackedAccountSet,
    AMOUNT_DECIMALS,
};
use crate::notifications::NotificationQueue;
use crate::traits::ledger_client::RemoteLedgerClient;
use crate::tracker::aggregation::{summarize, AggregateTotals};
use crate::tracker::batch_runner::BatchQueryRunner;
use crate::tracker::coordinator::{ClaimTransactionCoordinator, TransactionTicket};
use crate::utils::helper::{format_units, recover_poisoned};

/// Main claim tracker.
///
/// Owns the shared cache, one batch runner per query kind and the
/// transaction coordinator, and keeps the runners in step with the
/// caller's tracked account list.
#[derive(Clone)]
pub struct ClaimTracker {
    cache: QueryCache,
    claimable: Arc<BatchQueryRunner>,
    balances: Arc<BatchQueryRunner>,
    coordinator: ClaimTransactionCoordinator,
    accounts: Arc<RwLock<TrackedAccountSet>>,
    target: Arc<RwLock<Option<Address>>>,
    notifications: Option<NotificationQueue>,
    /// Keys whose read failure has already been reported
    reported_errors: Arc<Mutex<HashSet<CacheKey>>>,
    cache_retention: Duration,
    token_symbol: String,
}

impl ClaimTracker {
    /// Create a new tracker. Must be called from within a tokio runtime.
    pub fn new(
        ledger: Arc<dyn RemoteLedgerClient>,
        config: &TrackerConfig,
        notifications: Option<NotificationQueue>,
    ) -> Self {
        let cache = QueryCache::new();
        let runner = |kind: QueryKind| {
            Arc::new(BatchQueryRunner::new(
                kind,
                config.policy(kind),
                cache.clone(),
                ledger.clone(),
            ))
        };
        let claimable = runner(QueryKind::ClaimableAmount);
        let balances = runner(QueryKind::TokenBalance);

        let coordinator = ClaimTransactionCoordinator::new(
            ledger.clone(),
            cache.clone(),
            config.coordinator_config(),
            notifications.clone(),
        );

        Self {
            cache,
            claimable,
            balances,
            coordinator,
            accounts: Arc::new(RwLock::new(TrackedAccountSet::new())),
            target: Arc::new(RwLock::new(config.target_account)),
            notifications,
            reported_errors: Arc::new(Mutex::new(HashSet::new())),
            cache_retention: config.cache_retention,
            token_symbol: config.token_symbol.clone(),
        }
    }

    fn runner(&self, kind: QueryKind) -> &BatchQueryRunner {
        match kind {
            QueryKind::ClaimableAmount => &self.claimable,
            QueryKind::TokenBalance => &self.balances,
        }
    }

    fn sync_runners(&self) {
        let addresses = self.accounts().addresses();
        for kind in QueryKind::ALL {
            self.runner(kind).set_addresses(addresses.clone());
        }
    }

    /// Replace the tracked accounts. Duplicates keep their first label.
    pub fn track(&self, accounts: Vec<TrackedAccount>) {
        *self.accounts.write().unwrap_or_else(recover_poisoned("tracked accounts")) =
            TrackedAccountSet::from_accounts(accounts);
        self.sync_runners();
    }

    /// Start tracking one more account. Returns false if already tracked.
    pub fn add_account(&self, account: TrackedAccount) -> bool {
        let added = self
            .accounts
            .write()
            .unwrap_or_else(recover_poisoned("tracked accounts"))
            .insert(account);
        if added {
            self.sync_runners();
        }
        added
    }

    /// Stop tracking `address`. Cached values are kept for a quick re-add.
    pub fn remove_account(&self, address: &Address) -> bool {
        let removed = self
            .accounts
            .write()
            .unwrap_or_else(recover_poisoned("tracked accounts"))
            .remove(address)
            .is_some();
        if removed {
            self.sync_runners();
        }
        removed
    }

    pub fn accounts(&self) -> TrackedAccountSet {
        self.accounts
            .read()
            .unwrap_or_else(recover_poisoned("tracked accounts"))
            .clone()
    }

    /// Per-address results for `kind`, in tracked order
    pub fn query_results(&self, kind: QueryKind) -> Vec<QueryResult> {
        self.runner(kind).results()
    }

    pub fn subscribe(&self, kind: QueryKind) -> watch::Receiver<Vec<QueryResult>> {
        self.runner(kind).subscribe()
    }

    /// Fetch every stale tracked key of both kinds
    pub async fn refresh(&self) {
        futures::join!(self.claimable.refresh(), self.balances.refresh());
    }

    /// Refetch stale keys of the kinds that opt into focus refetching
    pub async fn focus_regained(&self) {
        for kind in QueryKind::ALL {
            let runner = self.runner(kind);
            if runner.policy().refetch_on_focus {
                debug!("Focus regained, refreshing {}", kind);
                runner.refresh().await;
            }
        }
    }

    /// Drop both cached values of `address`; tracked ones are refetched
    pub fn invalidate(&self, address: &Address) {
        for kind in QueryKind::ALL {
            self.cache.invalidate(&CacheKey::new(*address, kind));
        }
    }

    /// Account that receives transfers
    pub fn select_target(&self, address: Address) {
        info!("Transfer target set to {}", address);
        *self.target.write().unwrap_or_else(recover_poisoned("transfer target")) = Some(address);
    }

    pub fn target(&self) -> Option<Address> {
        *self.target.read().unwrap_or_else(recover_poisoned("transfer target"))
    }

    pub fn submit_claim(&self) -> Result<TransactionTicket> {
        self.coordinator.submit_claim()
    }

    pub fn submit_transfer(&self, target: Address) -> Result<TransactionTicket> {
        self.coordinator.submit_transfer(target)
    }

    /// Transfer to the account chosen with `select_target`
    pub fn submit_transfer_to_target(&self) -> Result<TransactionTicket> {
        let target = self
            .target()
            .ok_or_else(|| TrackerError::WriteRejected("no transfer target selected".to_string()))?;
        self.submit_transfer(target)
    }

    /// Sum of the Ready values for `kind` across tracked accounts
    pub fn totals(&self, kind: QueryKind) -> AggregateTotals {
        summarize(&self.query_results(kind))
    }

    /// Send newly failed reads to the notification handlers.
    ///
    /// Each failing key is reported once until it reads successfully again
    /// or stops being tracked. Returns how many keys were reported.
    pub fn report_read_errors(&self) -> usize {
        let failing: Vec<(CacheKey, TrackerError)> = QueryKind::ALL
            .into_iter()
            .flat_map(|kind| {
                self.query_results(kind).into_iter().filter_map(move |r| match (r.state, r.error) {
                    (EntryState::Errored, Some(error)) => Some((CacheKey::new(r.address, kind), error)),
                    _ => None,
                })
            })
            .collect();

        let mut reported = self
            .reported_errors
            .lock()
            .unwrap_or_else(recover_poisoned("reported errors"));
        reported.retain(|key| failing.iter().any(|(k, _)| k == key));

        let mut fresh = 0;
        for (key, error) in failing {
            if reported.insert(key) {
                warn!("{} read for {} failed: {}", key.kind, key.address, error);
                if let Some(notifications) = &self.notifications {
                    notifications.notify_error(&error);
                }
                fresh += 1;
            }
        }
        fresh
    }

    /// Drop cache entries untouched for the configured retention
    pub fn evict_idle(&self) -> usize {
        self.cache.evict_idle(self.cache_retention)
    }

    pub fn cache(&self) -> &QueryCache {
        &self.cache
    }

    pub fn coordinator(&self) -> &ClaimTransactionCoordinator {
        &self.coordinator
    }

    /// Log the per-account table and totals
    pub fn log_summary(&self) {
        let accounts = self.accounts();
        let claimable = self.query_results(QueryKind::ClaimableAmount);
        let balances = self.query_results(QueryKind::TokenBalance);

        info!("{}", "=".repeat(80));
        info!("{:<20} {:<44} {:>14} {:>14}", "Account", "Address", "Claimable", "Balance");
        info!("{}", "-".repeat(80));

        for (i, account) in accounts.iter().enumerate() {
            let cell = |results: &[QueryResult]| {
                results
                    .iter()
                    .find(|r| r.address == account.address)
                    .map(|r| self.format_cell(r))
                    .unwrap_or_else(|| "...".to_string())
            };
            info!(
                "{:<20} {:<44} {:>14} {:>14}",
                account.display_name(i + 1),
                account.address.to_string(),
                cell(&claimable),
                cell(&balances)
            );
        }

        let claimable_total = summarize(&claimable);
        let balance_total = summarize(&balances);
        info!("{}", "-".repeat(80));
        info!(
            "➤ Total claimable: {} {}{}",
            format_units(claimable_total.total, AMOUNT_DECIMALS),
            self.token_symbol,
            if claimable_total.is_complete() { "" } else { " (partial)" }
        );
        info!(
            "➤ Total balance: {} {}{}",
            format_units(balance_total.total, AMOUNT_DECIMALS),
            self.token_symbol,
            if balance_total.is_complete() { "" } else { " (partial)" }
        );
        info!("{}", "=".repeat(80));
    }

    fn format_cell(&self, result: &QueryResult) -> String {
        match (result.data, &result.error) {
            (Some(value), _) => format_units(value, AMOUNT_DECIMALS),
            (None, Some(_)) => "error".to_string(),
            (None, None) => "...".to_string(),
        }
    }

    /// Start polling-based tracking
    pub async fn start_polling(&self, tick_interval: Duration) {
        info!("Starting polling-based tracking with interval: {}ms", tick_interval.as_millis());

        let mut timedelta = Instant::now();

        loop {
            self.refresh().await;

            for kind in QueryKind::ALL {
                let totals = self.totals(kind);
                if totals.errored > 0 {
                    warn!("{} of {} {} reads failed", totals.errored, self.accounts().len(), kind);
                }
            }
            self.report_read_errors();
            self.log_summary();
            self.evict_idle();

            let sleep = tick_interval.saturating_sub(timedelta.elapsed());
            if !sleep.is_zero() {
                tokio::time::sleep(sleep).await;
            }
            timedelta = Instant::now();
        }
    }
}
