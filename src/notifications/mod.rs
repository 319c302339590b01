// src/notifications/mod.rs
use std::sync::Arc;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::{error, warn};

use crate::error::TrackerError;
use crate::models::TransactionEvent;
use crate::traits::event_handler::TransactionEventHandler;

/// Notification types
#[derive(Debug, Clone)]
pub enum Notification {
    Transaction(TransactionEvent),
    Error(TrackerError),
    Shutdown,
}

/// Notification queue for async processing
#[derive(Clone)]
pub struct NotificationQueue {
    sender: UnboundedSender<Notification>,
}

impl NotificationQueue {
    /// Create a new notification queue. Must be called from within a tokio runtime.
    pub fn new(handler: Arc<dyn TransactionEventHandler>) -> Self {
        let (sender, receiver) = unbounded_channel();

        // Slow sinks (Telegram) drain on their own task
        tokio::spawn(Self::process_notifications(receiver, handler));

        Self { sender }
    }

    async fn process_notifications(
        mut receiver: UnboundedReceiver<Notification>,
        handler: Arc<dyn TransactionEventHandler>,
    ) {
        while let Some(notification) = receiver.recv().await {
            match notification {
                Notification::Transaction(event) => {
                    handler.handle_transaction_event(event).await;
                }
                Notification::Error(err) => {
                    handler.handle_error(&err).await;
                }
                Notification::Shutdown => {
                    warn!("Notification processor shutting down");
                    break;
                }
            }
        }
    }

    /// Queue a transaction status change (non-blocking)
    pub fn notify_transaction(&self, event: TransactionEvent) {
        if let Err(e) = self.sender.send(Notification::Transaction(event)) {
            error!("Failed to queue transaction notification: {}", e);
        }
    }

    /// Queue an error notification (non-blocking)
    pub fn notify_error(&self, error: &TrackerError) {
        if let Err(e) = self.sender.send(Notification::Error(error.clone())) {
            error!("Failed to queue error notification: {}", e);
        }
    }

    /// Stop the processing task once queued notifications are handled
    pub fn shutdown(&self) {
        let _ = self.sender.send(Notification::Shutdown);
    }
}
