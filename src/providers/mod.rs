//! Ledger providers for reading amounts and submitting writes

pub mod rpc_provider;
pub mod memory_provider;

// Re-export for convenience
pub use rpc_provider::JsonRpcLedgerClient;
pub use memory_provider::InMemoryLedger;
