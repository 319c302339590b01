use std::fmt;
use std::str::FromStr;

use alloy_primitives::hex;

use crate::error::{Result, TrackerError};

/// Ledger amounts: unsigned 256-bit fixed point integers
pub type Amount = alloy_primitives::U256;

/// Number of fractional digits carried by every amount
pub const AMOUNT_DECIMALS: u8 = 18;

/// A 20-byte ledger account.
///
/// Equality is byte-wise, so `0xABC..` and `0xabc..` collapse into one value.
/// Display always renders the canonical lowercase form with a `0x` prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address(alloy_primitives::Address);

impl Address {
    /// Parse a hex address with or without the `0x` prefix, in any case
    pub fn parse(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        let hex = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
            .unwrap_or(trimmed);

        if hex.len() != 40 {
            return Err(TrackerError::InvalidAddress(s.to_string()));
        }

        alloy_primitives::Address::from_str(hex)
            .map(Self)
            .map_err(|_| TrackerError::InvalidAddress(s.to_string()))
    }

    /// Raw address for ABI encoding
    pub fn as_alloy(&self) -> alloy_primitives::Address {
        self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_slice()
    }

    /// Lowercase hex without the `0x` prefix
    pub fn to_hex_without_prefix(&self) -> String {
        hex::encode(self.0.as_slice())
    }
}

impl From<alloy_primitives::Address> for Address {
    fn from(inner: alloy_primitives::Address) -> Self {
        Self(inner)
    }
}

impl From<[u8; 20]> for Address {
    fn from(bytes: [u8; 20]) -> Self {
        Self(alloy_primitives::Address::from(bytes))
    }
}

impl FromStr for Address {
    type Err = TrackerError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", self.to_hex_without_prefix())
    }
}

/// One entry of the caller's tracked list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedAccount {
    pub address: Address,
    pub label: Option<String>,
}

impl TrackedAccount {
    pub fn new(address: Address, label: Option<String>) -> Self {
        let label = label.filter(|l| !l.trim().is_empty());
        Self { address, label }
    }

    /// Label for display, falling back to the position in the list
    pub fn display_name(&self, index: usize) -> String {
        match &self.label {
            Some(label) => label.clone(),
            None => format!("Account {}", index),
        }
    }
}

/// Ordered set of tracked accounts, unique by address.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrackedAccountSet {
    accounts: Vec<TrackedAccount>,
}

impl TrackedAccountSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a set from a list, keeping the first occurrence of each address
    pub fn from_accounts(accounts: impl IntoIterator<Item = TrackedAccount>) -> Self {
        let mut set = Self::new();
        for account in accounts {
            set.insert(account);
        }
        set
    }

    /// Append an account. Returns false if the address is already tracked.
    pub fn insert(&mut self, account: TrackedAccount) -> bool {
        if self.contains(&account.address) {
            return false;
        }
        self.accounts.push(account);
        true
    }

    /// Remove an account by address. Returns the removed entry.
    pub fn remove(&mut self, address: &Address) -> Option<TrackedAccount> {
        let index = self.position(address)?;
        Some(self.accounts.remove(index))
    }

    pub fn contains(&self, address: &Address) -> bool {
        self.position(address).is_some()
    }

    pub fn position(&self, address: &Address) -> Option<usize> {
        self.accounts.iter().position(|a| &a.address == address)
    }

    pub fn get(&self, address: &Address) -> Option<&TrackedAccount> {
        self.accounts.iter().find(|a| &a.address == address)
    }

    /// Addresses in list order
    pub fn addresses(&self) -> Vec<Address> {
        self.accounts.iter().map(|a| a.address).collect()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, TrackedAccount> {
        self.accounts.iter()
    }

    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }
}
