use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};

use crate::error::{Result, TrackerError};
use crate::models::{Address, QueryKind, QueryPolicy, TrackedAccount};
use crate::tracker::coordinator::CoordinatorConfig;
use crate::utils::helper::{extract_addresses, parse_address, parse_tracked_list};

/// Distributor claims open at this unix timestamp (ms)
pub const DEFAULT_CLAIM_OPENS_AT_MS: i64 = 1_679_576_450_000;

/// What the binary does after the first refresh
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Watch,
    Claim,
    Transfer,
}

impl FromStr for Action {
    type Err = TrackerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "watch" => Ok(Action::Watch),
            "claim" => Ok(Action::Claim),
            "transfer" => Ok(Action::Transfer),
            other => Err(TrackerError::Config(format!(
                "ACTION must be watch, claim or transfer, got {}",
                other
            ))),
        }
    }
}

/// Runtime configuration, read from the environment
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// JSON-RPC endpoint. `None` runs against the in-memory demo ledger.
    pub rpc_url: Option<String>,
    pub distributor: Option<Address>,
    pub token: Option<Address>,
    pub connected_account: Option<Address>,
    pub target_account: Option<Address>,
    pub tracked: Vec<TrackedAccount>,
    pub claim_opens_at: DateTime<Utc>,
    pub claim_open_buffer: Duration,
    pub claimable_ttl: Duration,
    pub balance_ttl: Duration,
    pub tick_interval: Duration,
    pub confirmation_timeout: Option<Duration>,
    pub cache_retention: Duration,
    pub token_symbol: String,
    pub action: Action,
    pub telegram_token: Option<String>,
    pub telegram_chat_id: Option<String>,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            rpc_url: None,
            distributor: None,
            token: None,
            connected_account: None,
            target_account: None,
            tracked: Vec::new(),
            claim_opens_at: Utc
                .timestamp_millis_opt(DEFAULT_CLAIM_OPENS_AT_MS)
                .single()
                .unwrap_or(DateTime::<Utc>::MIN_UTC),
            claim_open_buffer: Duration::from_secs(300),
            claimable_ttl: Duration::from_secs(24 * 60 * 60),
            balance_ttl: Duration::from_secs(5 * 60),
            tick_interval: Duration::from_millis(5000),
            confirmation_timeout: Some(Duration::from_secs(15 * 60)),
            cache_retention: Duration::from_secs(2 * 24 * 60 * 60),
            token_symbol: "ARB".to_string(),
            action: Action::Watch,
            telegram_token: None,
            telegram_chat_id: None,
        }
    }
}

impl TrackerConfig {
    /// Load from process environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load from an arbitrary variable lookup. Blank values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        let address = |name: &str| -> Result<Option<Address>> {
            get(name)
                .map(|v| {
                    parse_address(&v)
                        .map_err(|e| TrackerError::Config(format!("{}: {}", name, e)))
                })
                .transpose()
        };
        let number = |name: &str| -> Result<Option<u64>> {
            get(name)
                .map(|v| {
                    v.trim().parse::<u64>().map_err(|e| {
                        TrackerError::Config(format!("{} must be a number: {}", name, e))
                    })
                })
                .transpose()
        };
        let secs = |name: &str, default: Duration| -> Result<Duration> {
            Ok(number(name)?.map(Duration::from_secs).unwrap_or(default))
        };

        let mut tracked = match get("TRACKED_ACCOUNTS") {
            Some(list) => parse_tracked_list(&list)
                .map_err(|e| TrackerError::Config(format!("TRACKED_ACCOUNTS: {}", e)))?,
            None => Vec::new(),
        };
        // Bulk mode: any pasted text, unlabeled, after the explicit list
        if let Some(text) = get("TRACKED_TEXT") {
            for address in extract_addresses(&text) {
                if !tracked.iter().any(|a| a.address == address) {
                    tracked.push(TrackedAccount::new(address, None));
                }
            }
        }

        let claim_opens_at = match get("CLAIM_OPENS_AT") {
            Some(v) => {
                let millis = v.trim().parse::<i64>().map_err(|e| {
                    TrackerError::Config(format!("CLAIM_OPENS_AT must be unix ms: {}", e))
                })?;
                Utc.timestamp_millis_opt(millis).single().ok_or_else(|| {
                    TrackerError::Config(format!("CLAIM_OPENS_AT out of range: {}", millis))
                })?
            }
            None => defaults.claim_opens_at,
        };

        let confirmation_timeout = match number("CONFIRMATION_TIMEOUT_SECS")? {
            Some(0) => None,
            Some(secs) => Some(Duration::from_secs(secs)),
            None => defaults.confirmation_timeout,
        };

        let action = match get("ACTION") {
            Some(v) => v.parse()?,
            None => Action::Watch,
        };

        Ok(Self {
            rpc_url: get("LEDGER_RPC_URL"),
            distributor: address("DISTRIBUTOR_ADDRESS")?,
            token: address("TOKEN_ADDRESS")?,
            connected_account: address("CONNECTED_ACCOUNT")?,
            target_account: address("TARGET_ACCOUNT")?,
            tracked,
            claim_opens_at,
            claim_open_buffer: secs("CLAIM_OPEN_BUFFER_SECS", defaults.claim_open_buffer)?,
            claimable_ttl: secs("CLAIMABLE_TTL_SECS", defaults.claimable_ttl)?,
            balance_ttl: secs("BALANCE_TTL_SECS", defaults.balance_ttl)?,
            tick_interval: number("TICK_INTERVAL_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.tick_interval),
            confirmation_timeout,
            cache_retention: secs("CACHE_RETENTION_SECS", defaults.cache_retention)?,
            token_symbol: get("TOKEN_SYMBOL").unwrap_or(defaults.token_symbol),
            action,
            telegram_token: get("TG_TOKEN"),
            telegram_chat_id: get("CHAT_ID"),
        })
    }

    /// Cache policy for `kind` with the configured TTLs
    pub fn policy(&self, kind: QueryKind) -> QueryPolicy {
        let ttl = match kind {
            QueryKind::ClaimableAmount => self.claimable_ttl,
            QueryKind::TokenBalance => self.balance_ttl,
        };
        QueryPolicy {
            ttl,
            ..kind.default_policy()
        }
    }

    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            claim_opens_at: self.claim_opens_at,
            claim_open_buffer: self.claim_open_buffer,
            confirmation_timeout: self.confirmation_timeout,
            ..CoordinatorConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<TrackerConfig> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        TrackerConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[]).unwrap();
        assert!(config.rpc_url.is_none());
        assert!(config.tracked.is_empty());
        assert_eq!(config.claim_opens_at.timestamp_millis(), DEFAULT_CLAIM_OPENS_AT_MS);
        assert_eq!(config.policy(QueryKind::ClaimableAmount).ttl, Duration::from_secs(86400));
        assert!(config.policy(QueryKind::TokenBalance).refetch_on_focus);
        assert_eq!(config.confirmation_timeout, Some(Duration::from_secs(900)));
        assert_eq!(config.action, Action::Watch);
        assert_eq!(config.token_symbol, "ARB");
    }

    #[test]
    fn test_overrides() {
        let config = load(&[
            ("TRACKED_ACCOUNTS", "a=1111111111111111111111111111111111111111:cold&2222222222222222222222222222222222222222"),
            ("CONNECTED_ACCOUNT", "0x1111111111111111111111111111111111111111"),
            ("BALANCE_TTL_SECS", "10"),
            ("CONFIRMATION_TIMEOUT_SECS", "0"),
            ("ACTION", "Transfer"),
            ("LEDGER_RPC_URL", "  "),
        ])
        .unwrap();

        assert_eq!(config.tracked.len(), 2);
        assert_eq!(config.tracked[0].label.as_deref(), Some("cold"));
        assert_eq!(config.connected_account, Some(config.tracked[0].address));
        assert_eq!(config.policy(QueryKind::TokenBalance).ttl, Duration::from_secs(10));
        assert_eq!(config.confirmation_timeout, None);
        assert_eq!(config.action, Action::Transfer);
        assert!(config.rpc_url.is_none());
    }

    #[test]
    fn test_tracked_text_appends_pasted_addresses() {
        let config = load(&[
            ("TRACKED_ACCOUNTS", "1111111111111111111111111111111111111111:cold"),
            (
                "TRACKED_TEXT",
                "send to 0x2222222222222222222222222222222222222222, not 0x1111111111111111111111111111111111111111 or 0x12",
            ),
        ])
        .unwrap();

        assert_eq!(config.tracked.len(), 2);
        assert_eq!(config.tracked[0].label.as_deref(), Some("cold"));
        assert_eq!(config.tracked[1].address, Address::from([0x22; 20]));
        assert_eq!(config.tracked[1].label, None);
    }

    #[test]
    fn test_errors_name_the_variable() {
        let err = load(&[("TICK_INTERVAL_MS", "soon")]).unwrap_err();
        assert!(matches!(&err, TrackerError::Config(msg) if msg.contains("TICK_INTERVAL_MS")));

        let err = load(&[("TARGET_ACCOUNT", "0x1234")]).unwrap_err();
        assert!(matches!(&err, TrackerError::Config(msg) if msg.contains("TARGET_ACCOUNT")));

        assert!(load(&[("ACTION", "dance")]).is_err());
    }
}
