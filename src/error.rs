use thiserror::Error;

/// Result type used across the tracker core
pub type Result<T> = std::result::Result<T, TrackerError>;

/// Errors surfaced by the query cache, the ledger providers and the
/// transaction coordinator.
///
/// Read errors stay local to the cache entry they belong to. Write errors are
/// reported once per submission through the transaction's terminal status.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TrackerError {
    /// Network or provider failure while reading. Never fatal, the entry keeps
    /// its previous value and is retried on the next refresh.
    #[error("transient fetch error: {0}")]
    TransientFetch(String),

    /// Signer declined, submission failed or a precondition did not hold.
    #[error("write rejected: {0}")]
    WriteRejected(String),

    /// The transaction was reverted, dropped or never reached the required depth.
    #[error("confirmation failed: {0}")]
    ConfirmationFailed(String),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// A claim or transfer is already submitting or awaiting confirmation.
    #[error("transaction {0} is still in flight")]
    TransactionInFlight(u64),

    #[error("configuration error: {0}")]
    Config(String),
}

impl TrackerError {
    /// Whether the error belongs to the read path
    pub fn is_transient(&self) -> bool {
        matches!(self, TrackerError::TransientFetch(_))
    }
}

impl From<reqwest::Error> for TrackerError {
    fn from(e: reqwest::Error) -> Self {
        TrackerError::TransientFetch(e.to_string())
    }
}
