//! Claim Tracker Library
//!
//! Tracks the claimable amount and token balance of a list of ledger
//! accounts through a shared, coalescing query cache, and submits claims and
//! transfers that reconcile the cache once they confirm.

// Public modules - these are the API surface
pub mod cache;
pub mod config;
pub mod error;
pub mod models;
pub mod traits;
pub mod providers;
pub mod handlers;
pub mod notifications;
pub mod tracker;
pub mod utils;
pub mod telegram_notifier;

// Re-export commonly used items for easier access
pub use cache::{CacheEvent, CacheStats, QueryCache};
pub use config::{Action, TrackerConfig};
pub use error::{Result, TrackerError};
pub use models::{
    Address, Amount, CacheKey, EntryState, QueryKind, QueryPolicy, QueryResult, TrackedAccount,
    TrackedAccountSet, TransactionStatus, TxKind, TxPhase, AMOUNT_DECIMALS,
};
pub use traits::{
    ledger_client::RemoteLedgerClient,
    event_handler::TransactionEventHandler,
};
pub use providers::{
    rpc_provider::JsonRpcLedgerClient,
    memory_provider::InMemoryLedger,
};
pub use handlers::{
    console::ConsoleEventHandler,
    telegram::TelegramEventHandler,
    composite::CompositeEventHandler,
};
pub use tracker::{
    aggregation::AggregateTotals,
    batch_runner::BatchQueryRunner,
    claim_tracker::ClaimTracker,
    coordinator::{ClaimTransactionCoordinator, CoordinatorConfig, TransactionTicket},
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
