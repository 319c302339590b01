use async_trait::async_trait;

use crate::error::Result;
use crate::models::{Address, Amount, QueryKind, Receipt, TxHandle};

/// Core trait for talking to the remote ledger
#[async_trait]
pub trait RemoteLedgerClient: Send + Sync {
    /// Amount `account` may currently claim from the distributor
    async fn read_claimable(&self, account: &Address) -> Result<Amount>;

    /// Token balance held by `account`
    async fn read_balance(&self, account: &Address) -> Result<Amount>;

    /// Submit a claim signed by the connected account
    async fn submit_claim(&self) -> Result<TxHandle>;

    /// Submit a token transfer signed by the connected account
    async fn submit_transfer(&self, to: &Address, amount: Amount) -> Result<TxHandle>;

    /// Wait until `tx` is `confirmations` blocks deep
    async fn await_confirmations(&self, tx: &TxHandle, confirmations: u64) -> Result<Receipt>;

    /// Account that signs writes, if a wallet is connected
    fn signer(&self) -> Option<Address>;

    /// Dispatch a read by query kind
    async fn read(&self, kind: QueryKind, account: &Address) -> Result<Amount> {
        match kind {
            QueryKind::ClaimableAmount => self.read_claimable(account).await,
            QueryKind::TokenBalance => self.read_balance(account).await,
        }
    }
}
