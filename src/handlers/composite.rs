use std::sync::Arc;
use async_trait::async_trait;

use crate::error::TrackerError;
use crate::models::TransactionEvent;
use crate::traits::event_handler::TransactionEventHandler;

/// Composite event handler that fans events out to several handlers
pub struct CompositeEventHandler {
    handlers: Vec<Arc<dyn TransactionEventHandler>>,
}

impl CompositeEventHandler {
    pub fn new() -> Self {
        Self { handlers: Vec::new() }
    }

    /// Add a handler to the composite
    pub fn add_handler(&mut self, handler: Arc<dyn TransactionEventHandler>) {
        self.handlers.push(handler);
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }
}

impl Default for CompositeEventHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TransactionEventHandler for CompositeEventHandler {
    async fn handle_transaction_event(&self, event: TransactionEvent) {
        for handler in &self.handlers {
            handler.handle_transaction_event(event.clone()).await;
        }
    }

    async fn handle_error(&self, error: &TrackerError) {
        for handler in &self.handlers {
            handler.handle_error(error).await;
        }
    }
}
