use async_trait::async_trait;
use tracing::{info, warn};

use crate::error::TrackerError;
use crate::models::{TransactionEvent, TxKind, TxPhase};
use crate::traits::event_handler::TransactionEventHandler;
use crate::utils::helper::{format_units, truncate_address};

/// Console logging event handler
pub struct ConsoleEventHandler {
    token_symbol: String,
}

impl ConsoleEventHandler {
    /// Create a new console event handler
    pub fn new(token_symbol: impl Into<String>) -> Self {
        Self {
            token_symbol: token_symbol.into(),
        }
    }
}

impl Default for ConsoleEventHandler {
    fn default() -> Self {
        Self::new("ARB")
    }
}

#[async_trait]
impl TransactionEventHandler for ConsoleEventHandler {
    async fn handle_transaction_event(&self, event: TransactionEvent) {
        let subject = match &event.kind {
            TxKind::Claim { account } => {
                format!("claim of {} for {}", self.token_symbol, truncate_address(account))
            }
            TxKind::Transfer { from, to, amount } => format!(
                "transfer of {} {} from {} to {}",
                format_units(*amount, crate::models::AMOUNT_DECIMALS),
                self.token_symbol,
                truncate_address(from),
                truncate_address(to)
            ),
        };

        match event.phase {
            TxPhase::Idle => {}
            TxPhase::Submitting => info!("[tx {}] Submitting {}", event.id, subject),
            TxPhase::AwaitingConfirmation => info!(
                "[tx {}] Waiting for confirmations of {} ({})",
                event.id,
                subject,
                event
                    .tx_hash
                    .map(|h| h.to_string())
                    .unwrap_or_else(|| "unknown hash".to_string())
            ),
            TxPhase::Confirmed => info!("[tx {}] {} confirmed", event.id, subject),
            TxPhase::Failed => warn!(
                "[tx {}] {} failed: {}",
                event.id,
                subject,
                event
                    .error
                    .as_ref()
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "unknown error".to_string())
            ),
        }
    }

    async fn handle_error(&self, error: &TrackerError) {
        warn!("Claim tracker error: {}", error);
    }
}
