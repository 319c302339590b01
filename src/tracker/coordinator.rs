use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::cache::QueryCache;
use crate::error::{Result, TrackerError};
use crate::models::{
    Address, Amount, CacheEntry, CacheKey, EntryState, PendingTransaction, QueryKind, Receipt,
    TransactionStatus, TxHandle, TxKind, TxPhase, CONFIRMATIONS_REQUIRED,
};
use crate::notifications::NotificationQueue;
use crate::traits::ledger_client::RemoteLedgerClient;
use crate::utils::helper::recover_poisoned;

/// Rules the coordinator checks before submitting anything
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// When the distributor starts accepting claims
    pub claim_opens_at: DateTime<Utc>,
    /// Claims are enabled this long before `claim_opens_at`
    pub claim_open_buffer: Duration,
    pub confirmations: u64,
    /// Upper bound on the confirmation wait. `None` waits forever.
    pub confirmation_timeout: Option<Duration>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            claim_opens_at: DateTime::<Utc>::MIN_UTC,
            claim_open_buffer: Duration::from_secs(5 * 60),
            confirmations: CONFIRMATIONS_REQUIRED,
            confirmation_timeout: Some(Duration::from_secs(15 * 60)),
        }
    }
}

impl CoordinatorConfig {
    /// Whether a claim submitted at `now` may go through
    pub fn claim_window_open(&self, now: DateTime<Utc>) -> bool {
        let buffer = chrono::Duration::from_std(self.claim_open_buffer)
            .unwrap_or_else(|_| chrono::Duration::zero());
        self.claim_opens_at
            .checked_sub_signed(buffer)
            .map(|opens| now >= opens)
            .unwrap_or(true)
    }
}

/// Subscription to one submitted transaction
#[derive(Debug, Clone)]
pub struct TransactionTicket {
    id: u64,
    status: watch::Receiver<TransactionStatus>,
}

impl TransactionTicket {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Latest published status
    pub fn status(&self) -> TransactionStatus {
        self.status.borrow().clone()
    }

    /// Receiver that wakes on every phase change
    pub fn subscribe(&self) -> watch::Receiver<TransactionStatus> {
        self.status.clone()
    }

    /// Wait for the transaction to reach Confirmed or Failed
    pub async fn wait(mut self) -> TransactionStatus {
        loop {
            let current = self.status.borrow_and_update().clone();
            if current.phase.is_terminal() {
                return current;
            }
            if self.status.changed().await.is_err() {
                return self.status.borrow().clone();
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct ActiveTransaction {
    id: u64,
    phase: TxPhase,
}

struct CoordinatorInner {
    ledger: Arc<dyn RemoteLedgerClient>,
    cache: QueryCache,
    config: CoordinatorConfig,
    active: Mutex<Option<ActiveTransaction>>,
    latest: watch::Sender<Option<TransactionStatus>>,
    notifications: Option<NotificationQueue>,
}

impl CoordinatorInner {
    fn set_phase(&self, id: u64, phase: TxPhase) {
        let mut active = self.active.lock().unwrap_or_else(recover_poisoned("coordinator slot"));
        if let Some(current) = active.as_mut().filter(|a| a.id == id) {
            current.phase = phase;
        }
    }

    fn release(&self, id: u64) {
        let mut active = self.active.lock().unwrap_or_else(recover_poisoned("coordinator slot"));
        if active.map(|a| a.id) == Some(id) {
            *active = None;
        }
    }

    fn publish(&self, sender: &watch::Sender<TransactionStatus>, status: TransactionStatus) {
        debug!("Transaction {} is now {:?}", status.id, status.phase);
        if let Some(queue) = &self.notifications {
            queue.notify_transaction(status.clone());
        }
        self.latest.send_replace(Some(status.clone()));
        sender.send_replace(status);
    }

    async fn submit(&self, kind: &TxKind) -> Result<TxHandle> {
        let submitted = match kind {
            TxKind::Claim { .. } => self.ledger.submit_claim().await,
            TxKind::Transfer { to, amount, .. } => self.ledger.submit_transfer(to, *amount).await,
        };

        submitted.map_err(|e| match e {
            TrackerError::WriteRejected(_) => e,
            other => TrackerError::WriteRejected(other.to_string()),
        })
    }

    async fn confirm(&self, handle: &TxHandle, confirmations: u64) -> Result<Receipt> {
        let wait = self.ledger.await_confirmations(handle, confirmations);
        let receipt = match self.config.confirmation_timeout {
            Some(limit) => tokio::time::timeout(limit, wait).await.map_err(|_| {
                TrackerError::ConfirmationFailed(format!(
                    "{} not confirmed after {}s",
                    handle.hash,
                    limit.as_secs()
                ))
            })?,
            None => wait.await,
        }
        .map_err(|e| match e {
            TrackerError::ConfirmationFailed(_) => e,
            other => TrackerError::ConfirmationFailed(other.to_string()),
        })?;

        if !receipt.success {
            return Err(TrackerError::ConfirmationFailed(format!(
                "{} reverted in block {}",
                receipt.tx_hash, receipt.block_number
            )));
        }
        Ok(receipt)
    }

    /// Drive one transaction from Submitting to a terminal phase
    async fn drive(
        self: Arc<Self>,
        mut pending: PendingTransaction,
        sender: watch::Sender<TransactionStatus>,
    ) {
        let outcome = match self.submit(&pending.kind).await {
            Err(e) => Err(e),
            Ok(handle) => {
                info!("Transaction {} submitted: {}", pending.id, handle.hash);
                pending.handle = Some(handle);
                pending.phase = TxPhase::AwaitingConfirmation;
                self.set_phase(pending.id, pending.phase);
                self.publish(&sender, TransactionStatus::from_pending(&pending, None));

                self.confirm(&handle, pending.confirmations_required).await
            }
        };

        let error = match outcome {
            Ok(receipt) => {
                for account in pending.kind.affected_accounts() {
                    for kind in QueryKind::ALL {
                        self.cache.invalidate(&CacheKey::new(account, kind));
                    }
                }
                info!(
                    "Transaction {} ({}) confirmed in block {}",
                    pending.id,
                    pending.kind.label(),
                    receipt.block_number
                );
                pending.phase = TxPhase::Confirmed;
                None
            }
            Err(e) => {
                error!("Transaction {} ({}) failed: {}", pending.id, pending.kind.label(), e);
                pending.phase = TxPhase::Failed;
                Some(e)
            }
        };

        // Free the slot before reporting so a caller reacting to the terminal
        // status can submit again immediately.
        self.release(pending.id);
        self.publish(&sender, TransactionStatus::from_pending(&pending, error));
    }
}

/// Submits claims and transfers one at a time and reconciles the cache once
/// they confirm.
///
/// `Idle → Submitting → AwaitingConfirmation → Confirmed | Failed`. A second
/// submission while one is Submitting or AwaitingConfirmation is rejected.
#[derive(Clone)]
pub struct ClaimTransactionCoordinator {
    inner: Arc<CoordinatorInner>,
    next_id: Arc<AtomicU64>,
}

impl ClaimTransactionCoordinator {
    pub fn new(
        ledger: Arc<dyn RemoteLedgerClient>,
        cache: QueryCache,
        config: CoordinatorConfig,
        notifications: Option<NotificationQueue>,
    ) -> Self {
        let (latest, _) = watch::channel(None);
        Self {
            inner: Arc::new(CoordinatorInner {
                ledger,
                cache,
                config,
                active: Mutex::new(None),
                latest,
                notifications,
            }),
            next_id: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.inner.config
    }

    /// Phase of the transaction in flight, or Idle
    pub fn phase(&self) -> TxPhase {
        self.inner
            .active
            .lock()
            .unwrap_or_else(recover_poisoned("coordinator slot"))
            .map(|a| a.phase)
            .unwrap_or(TxPhase::Idle)
    }

    /// Status of the most recent transaction across submissions
    pub fn subscribe(&self) -> watch::Receiver<Option<TransactionStatus>> {
        self.inner.latest.subscribe()
    }

    /// Account that signs claims and transfers, if any
    pub fn connected_account(&self) -> Option<Address> {
        self.inner.ledger.signer()
    }

    fn signer(&self) -> Result<Address> {
        self.inner
            .ledger
            .signer()
            .ok_or_else(|| TrackerError::WriteRejected("no wallet connected".to_string()))
    }

    /// Cached amount for `(account, kind)`, only when its entry is Ready.
    ///
    /// Errored entries keep their last value for display, but that value may
    /// no longer match the ledger, so writes never build on it.
    fn ready_amount(&self, account: Address, kind: QueryKind) -> Result<Amount> {
        match self.inner.cache.entry(&CacheKey::new(account, kind)) {
            Some(CacheEntry {
                state: EntryState::Ready,
                value: Some(amount),
                ..
            }) => Ok(amount),
            Some(entry) => Err(self.reject(format!(
                "{} of {} is {:?}, not Ready",
                kind, account, entry.state
            ))),
            None => Err(self.reject(format!("{} of {} is not known yet", kind, account))),
        }
    }

    fn reject(&self, reason: String) -> TrackerError {
        warn!("Write rejected: {}", reason);
        TrackerError::WriteRejected(reason)
    }

    /// Claim the connected account's allocation.
    ///
    /// Requires the claim window to be open and a Ready, non-zero claimable
    /// amount for the connected account.
    pub fn submit_claim(&self) -> Result<TransactionTicket> {
        let account = self.signer()?;

        let now = Utc::now();
        if !self.inner.config.claim_window_open(now) {
            return Err(self.reject(format!(
                "claims open at {}",
                self.inner.config.claim_opens_at
            )));
        }

        if self.ready_amount(account, QueryKind::ClaimableAmount)?.is_zero() {
            return Err(self.reject(format!("{} has nothing to claim", account)));
        }

        self.start(TxKind::Claim { account })
    }

    /// Send the connected account's entire Ready token balance to `target`
    pub fn submit_transfer(&self, target: Address) -> Result<TransactionTicket> {
        let from = self.signer()?;
        if from == target {
            return Err(self.reject("target account is the connected account".to_string()));
        }

        let amount = self.ready_amount(from, QueryKind::TokenBalance)?;
        if amount.is_zero() {
            return Err(self.reject(format!("{} has no tokens to send", from)));
        }

        self.start(TxKind::Transfer {
            from,
            to: target,
            amount,
        })
    }

    fn start(&self, kind: TxKind) -> Result<TransactionTicket> {
        let id = {
            let mut active = self
                .inner
                .active
                .lock()
                .unwrap_or_else(recover_poisoned("coordinator slot"));
            if let Some(current) = *active {
                warn!(
                    "Rejecting {} while transaction {} is {:?}",
                    kind.label(),
                    current.id,
                    current.phase
                );
                return Err(TrackerError::TransactionInFlight(current.id));
            }
            let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
            *active = Some(ActiveTransaction {
                id,
                phase: TxPhase::Submitting,
            });
            id
        };

        let pending = PendingTransaction {
            id,
            kind,
            submitted_at: Utc::now(),
            confirmations_required: self.inner.config.confirmations,
            handle: None,
            phase: TxPhase::Submitting,
        };
        info!("Transaction {} submitting: {}", id, pending.kind);

        let status = TransactionStatus::from_pending(&pending, None);
        let (sender, receiver) = watch::channel(status.clone());
        self.inner.publish(&sender, status);

        tokio::spawn(self.inner.clone().drive(pending, sender));

        Ok(TransactionTicket {
            id,
            status: receiver,
        })
    }
}
