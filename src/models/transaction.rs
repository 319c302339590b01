use std::fmt;

use alloy_primitives::B256;
use chrono::{DateTime, Utc};

use super::address::{Address, Amount};
use crate::error::TrackerError;

/// Block depth a write must reach before it is treated as final
pub const CONFIRMATIONS_REQUIRED: u64 = 3;

/// The write operation being submitted
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxKind {
    /// Claim the connected account's allocation from the distributor
    Claim { account: Address },
    /// Move `amount` tokens from the connected account to `to`
    Transfer {
        from: Address,
        to: Address,
        amount: Amount,
    },
}

impl TxKind {
    /// Accounts whose cached values change once the write confirms
    pub fn affected_accounts(&self) -> Vec<Address> {
        match self {
            TxKind::Claim { account } => vec![*account],
            TxKind::Transfer { from, to, .. } => vec![*from, *to],
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            TxKind::Claim { .. } => "claim",
            TxKind::Transfer { .. } => "transfer",
        }
    }
}

impl fmt::Display for TxKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TxKind::Claim { account } => write!(f, "claim for {}", account),
            TxKind::Transfer { from, to, amount } => {
                write!(f, "transfer of {} from {} to {}", amount, from, to)
            }
        }
    }
}

/// Coordinator phases
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TxPhase {
    Idle,
    Submitting,
    AwaitingConfirmation,
    Confirmed,
    Failed,
}

impl TxPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TxPhase::Confirmed | TxPhase::Failed)
    }

    pub fn is_active(&self) -> bool {
        matches!(self, TxPhase::Submitting | TxPhase::AwaitingConfirmation)
    }
}

/// Handle returned by the ledger once a write has been accepted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxHandle {
    pub hash: B256,
    pub submitted_at: DateTime<Utc>,
}

impl TxHandle {
    pub fn new(hash: B256) -> Self {
        Self {
            hash,
            submitted_at: Utc::now(),
        }
    }
}

/// Outcome of waiting for confirmations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Receipt {
    pub tx_hash: B256,
    pub block_number: u64,
    pub success: bool,
}

/// A write owned by the coordinator until it reaches a terminal phase
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingTransaction {
    pub id: u64,
    pub kind: TxKind,
    pub submitted_at: DateTime<Utc>,
    pub confirmations_required: u64,
    pub handle: Option<TxHandle>,
    pub phase: TxPhase,
}

/// Status published to subscribers on every phase change
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionStatus {
    pub id: u64,
    pub kind: TxKind,
    pub phase: TxPhase,
    pub tx_hash: Option<B256>,
    pub error: Option<TrackerError>,
    pub updated_at: DateTime<Utc>,
}

impl TransactionStatus {
    pub fn from_pending(pending: &PendingTransaction, error: Option<TrackerError>) -> Self {
        Self {
            id: pending.id,
            kind: pending.kind.clone(),
            phase: pending.phase,
            tx_hash: pending.handle.map(|h| h.hash),
            error,
            updated_at: Utc::now(),
        }
    }
}

/// Event delivered to transaction handlers
pub type TransactionEvent = TransactionStatus;
