//! Data models for the claim tracker

pub mod address;
pub mod query;
pub mod transaction;

// Re-export for convenience
pub use address::{Address, Amount, TrackedAccount, TrackedAccountSet, AMOUNT_DECIMALS};
pub use query::{CacheEntry, CacheKey, EntryState, QueryKind, QueryPolicy, QueryResult};
pub use transaction::{
    PendingTransaction, Receipt, TransactionEvent, TransactionStatus, TxHandle, TxKind, TxPhase,
    CONFIRMATIONS_REQUIRED,
};
