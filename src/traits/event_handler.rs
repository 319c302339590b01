use async_trait::async_trait;

use crate::error::TrackerError;
use crate::models::TransactionEvent;

/// Handler for transaction lifecycle events
#[async_trait]
pub trait TransactionEventHandler: Send + Sync {
    /// Called on every phase change of a submitted claim or transfer
    async fn handle_transaction_event(&self, event: TransactionEvent);

    /// Called for errors that are not tied to a transaction
    async fn handle_error(&self, error: &TrackerError);
}
