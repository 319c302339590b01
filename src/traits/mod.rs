//! Core traits for the claim tracker

pub mod ledger_client;
pub mod event_handler;

// Re-export for convenience
pub use ledger_client::RemoteLedgerClient;
pub use event_handler::TransactionEventHandler;
