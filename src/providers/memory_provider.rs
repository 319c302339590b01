use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use alloy_primitives::{keccak256, B256};
use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, info};

use crate::error::{Result, TrackerError};
use crate::models::{Address, Amount, QueryKind, Receipt, TxHandle};
use crate::traits::ledger_client::RemoteLedgerClient;
use crate::utils::helper::recover_poisoned;

#[derive(Debug, Clone, Copy)]
struct MinedWrite {
    block: u64,
    success: bool,
}

/// Process-local ledger used for demos and tests.
///
/// Claims move the signer's claimable amount into its balance, transfers move
/// balance between accounts. Every write lands in the next block and each
/// confirmation mines one more block after `block_time`.
pub struct InMemoryLedger {
    claimable: DashMap<Address, Amount>,
    balances: DashMap<Address, Amount>,
    signer: RwLock<Option<Address>>,
    read_latency: RwLock<Duration>,
    address_latency: DashMap<Address, Duration>,
    failing_reads: DashMap<Address, String>,
    read_counts: DashMap<(QueryKind, Address), usize>,
    reject_next_submit: AtomicBool,
    revert_next: AtomicBool,
    stall_confirmations: AtomicBool,
    block_time: Duration,
    block: AtomicU64,
    nonce: AtomicU64,
    mined: DashMap<B256, MinedWrite>,
}

impl InMemoryLedger {
    /// Create an empty ledger with no connected signer
    pub fn new() -> Self {
        Self::with_block_time(Duration::ZERO)
    }

    pub fn with_block_time(block_time: Duration) -> Self {
        Self {
            claimable: DashMap::new(),
            balances: DashMap::new(),
            signer: RwLock::new(None),
            read_latency: RwLock::new(Duration::ZERO),
            address_latency: DashMap::new(),
            failing_reads: DashMap::new(),
            read_counts: DashMap::new(),
            reject_next_submit: AtomicBool::new(false),
            revert_next: AtomicBool::new(false),
            stall_confirmations: AtomicBool::new(false),
            block_time,
            block: AtomicU64::new(1),
            nonce: AtomicU64::new(0),
            mined: DashMap::new(),
        }
    }

    pub fn into_shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn set_claimable(&self, account: Address, amount: Amount) {
        self.claimable.insert(account, amount);
    }

    pub fn set_balance(&self, account: Address, amount: Amount) {
        self.balances.insert(account, amount);
    }

    /// Connect (or disconnect) the account that signs writes
    pub fn connect(&self, signer: Option<Address>) {
        *self.signer.write().unwrap_or_else(recover_poisoned("signer")) = signer;
    }

    /// Delay applied to every read
    pub fn set_read_latency(&self, latency: Duration) {
        *self.read_latency.write().unwrap_or_else(recover_poisoned("read latency")) = latency;
    }

    /// Delay applied to reads of one account, overriding the global latency
    pub fn set_address_latency(&self, account: Address, latency: Duration) {
        self.address_latency.insert(account, latency);
    }

    /// Make every read of `account` fail until cleared
    pub fn fail_reads_for(&self, account: Address, reason: &str) {
        self.failing_reads.insert(account, reason.to_string());
    }

    pub fn clear_read_failures(&self) {
        self.failing_reads.clear();
    }

    /// Reject the next submitted write as if the signer declined it
    pub fn reject_next_submit(&self) {
        self.reject_next_submit.store(true, Ordering::SeqCst);
    }

    /// Mine the next write as reverted
    pub fn revert_next(&self) {
        self.revert_next.store(true, Ordering::SeqCst);
    }

    /// Stop producing blocks so confirmation waits never finish
    pub fn stall_confirmations(&self, stalled: bool) {
        self.stall_confirmations.store(stalled, Ordering::SeqCst);
    }

    /// Number of reads served for `(kind, account)`
    pub fn read_count(&self, kind: QueryKind, account: &Address) -> usize {
        self.read_counts
            .get(&(kind, *account))
            .map(|count| *count)
            .unwrap_or(0)
    }

    pub fn block_number(&self) -> u64 {
        self.block.load(Ordering::SeqCst)
    }

    async fn serve_read(&self, kind: QueryKind, account: &Address) -> Result<Amount> {
        let latency = match self.address_latency.get(account) {
            Some(latency) => *latency,
            None => *self.read_latency.read().unwrap_or_else(recover_poisoned("read latency")),
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        *self.read_counts.entry((kind, *account)).or_insert(0) += 1;

        if let Some(reason) = self.failing_reads.get(account) {
            return Err(TrackerError::TransientFetch(reason.clone()));
        }

        let book = match kind {
            QueryKind::ClaimableAmount => &self.claimable,
            QueryKind::TokenBalance => &self.balances,
        };
        let value = book.get(account).map(|v| *v).unwrap_or(Amount::ZERO);
        debug!("In-memory {} read for {}: {}", kind, account, value);
        Ok(value)
    }

    fn connected_signer(&self) -> Result<Address> {
        self.signer()
            .ok_or_else(|| TrackerError::WriteRejected("no signer connected".to_string()))
    }

    fn take_rejection(&self) -> Result<()> {
        if self.reject_next_submit.swap(false, Ordering::SeqCst) {
            return Err(TrackerError::WriteRejected(
                "user rejected the request".to_string(),
            ));
        }
        Ok(())
    }

    /// Record a write in the next block. Effects apply only when it succeeds.
    fn mine_write(&self, apply: impl FnOnce()) -> TxHandle {
        let nonce = self.nonce.fetch_add(1, Ordering::SeqCst);
        let hash = keccak256(nonce.to_be_bytes());
        let block = self.block.fetch_add(1, Ordering::SeqCst) + 1;
        let success = !self.revert_next.swap(false, Ordering::SeqCst);

        if success {
            apply();
        }

        self.mined.insert(hash, MinedWrite { block, success });
        info!("In-memory write {} mined in block {} (success: {})", hash, block, success);
        TxHandle::new(hash)
    }
}

impl Default for InMemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteLedgerClient for InMemoryLedger {
    async fn read_claimable(&self, account: &Address) -> Result<Amount> {
        self.serve_read(QueryKind::ClaimableAmount, account).await
    }

    async fn read_balance(&self, account: &Address) -> Result<Amount> {
        self.serve_read(QueryKind::TokenBalance, account).await
    }

    async fn submit_claim(&self) -> Result<TxHandle> {
        let signer = self.connected_signer()?;
        self.take_rejection()?;

        let amount = self
            .claimable
            .get(&signer)
            .map(|v| *v)
            .unwrap_or(Amount::ZERO);
        if amount.is_zero() {
            return Err(TrackerError::WriteRejected(format!(
                "{} has nothing to claim",
                signer
            )));
        }

        Ok(self.mine_write(|| {
            self.claimable.insert(signer, Amount::ZERO);
            *self.balances.entry(signer).or_insert(Amount::ZERO) += amount;
        }))
    }

    async fn submit_transfer(&self, to: &Address, amount: Amount) -> Result<TxHandle> {
        let signer = self.connected_signer()?;
        self.take_rejection()?;

        let available = self
            .balances
            .get(&signer)
            .map(|v| *v)
            .unwrap_or(Amount::ZERO);
        if available < amount {
            return Err(TrackerError::WriteRejected(format!(
                "insufficient balance: {} < {}",
                available, amount
            )));
        }

        let to = *to;
        Ok(self.mine_write(|| {
            self.balances.insert(signer, available - amount);
            *self.balances.entry(to).or_insert(Amount::ZERO) += amount;
        }))
    }

    async fn await_confirmations(&self, tx: &TxHandle, confirmations: u64) -> Result<Receipt> {
        let mined = self
            .mined
            .get(&tx.hash)
            .map(|m| *m)
            .ok_or_else(|| TrackerError::ConfirmationFailed(format!("{} was dropped", tx.hash)))?;

        loop {
            if self.stall_confirmations.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(10)).await;
                continue;
            }

            let depth = self.block_number().saturating_sub(mined.block) + 1;
            if depth >= confirmations {
                return Ok(Receipt {
                    tx_hash: tx.hash,
                    block_number: mined.block,
                    success: mined.success,
                });
            }

            if !self.block_time.is_zero() {
                tokio::time::sleep(self.block_time).await;
            }
            self.block.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn signer(&self) -> Option<Address> {
        *self.signer.read().unwrap_or_else(recover_poisoned("signer"))
    }
}
