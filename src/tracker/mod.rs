//! Batch queries, aggregation, transaction coordination and the tracker facade

pub mod aggregation;
pub mod batch_runner;
pub mod claim_tracker;
pub mod coordinator;

// Re-export for convenience
pub use aggregation::{summarize, total, AggregateTotals};
pub use batch_runner::BatchQueryRunner;
pub use claim_tracker::ClaimTracker;
pub use coordinator::{ClaimTransactionCoordinator, CoordinatorConfig, TransactionTicket};
