use async_trait::async_trait;
use tracing::info;

use crate::error::TrackerError;
use crate::models::{TransactionEvent, TxKind, TxPhase, AMOUNT_DECIMALS};
use crate::telegram_notifier::TelegramNotifier;
use crate::traits::event_handler::TransactionEventHandler;
use crate::utils::helper::{format_units, truncate_address};

/// Telegram notification event handler
pub struct TelegramEventHandler {
    notifier: TelegramNotifier,
    token_symbol: String,
}

impl TelegramEventHandler {
    pub fn new(notifier: TelegramNotifier, token_symbol: impl Into<String>) -> Self {
        Self {
            notifier,
            token_symbol: token_symbol.into(),
        }
    }

    /// Check if Telegram is enabled
    pub fn is_enabled(&self) -> bool {
        self.notifier.is_enabled()
    }

    /// Build the message for a phase change. Intermediate phases other than
    /// Submitting are not worth a message.
    pub fn format_event(&self, event: &TransactionEvent) -> Option<String> {
        let symbol = &self.token_symbol;
        let message = match (&event.kind, event.phase) {
            (TxKind::Claim { account }, TxPhase::Submitting) => format!(
                "⏳ Claiming {} for <code>{}</code>",
                symbol,
                truncate_address(account)
            ),
            (TxKind::Claim { account }, TxPhase::Confirmed) => format!(
                "✅ {} claimed successfully for <code>{}</code>",
                symbol,
                truncate_address(account)
            ),
            (TxKind::Claim { account }, TxPhase::Failed) => format!(
                "❌ Error claiming {} for <code>{}</code>: {}",
                symbol,
                truncate_address(account),
                describe(event.error.as_ref())
            ),
            (TxKind::Transfer { amount, to, .. }, TxPhase::Submitting) => format!(
                "⏳ Transferring {} {} to <code>{}</code>",
                format_units(*amount, AMOUNT_DECIMALS),
                symbol,
                truncate_address(to)
            ),
            (TxKind::Transfer { .. }, TxPhase::Confirmed) => {
                format!("✅ {} transferred successfully", symbol)
            }
            (TxKind::Transfer { .. }, TxPhase::Failed) => format!(
                "❌ Error transferring {}: {}",
                symbol,
                describe(event.error.as_ref())
            ),
            _ => return None,
        };
        Some(message)
    }
}

fn describe(error: Option<&TrackerError>) -> String {
    error
        .map(|e| e.to_string())
        .unwrap_or_else(|| "unknown error".to_string())
}

#[async_trait]
impl TransactionEventHandler for TelegramEventHandler {
    async fn handle_transaction_event(&self, event: TransactionEvent) {
        if let Some(message) = self.format_event(&event) {
            self.notifier.send_notification(&message).await;
            info!("Sent Telegram notification for transaction {}", event.id);
        }
    }

    async fn handle_error(&self, error: &TrackerError) {
        let message = format!("❌ <b>Claim Tracker Error</b>\n\n⚠️ {}", error);
        self.notifier.send_notification(&message).await;
    }
}
