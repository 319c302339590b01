use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use alloy_primitives::{hex, keccak256, B256};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::error::{Result, TrackerError};
use crate::models::{Address, Amount, Receipt, TxHandle};
use crate::traits::ledger_client::RemoteLedgerClient;

const CLAIMABLE_TOKENS: &str = "claimableTokens(address)";
const BALANCE_OF: &str = "balanceOf(address)";
const CLAIM: &str = "claim()";
const TRANSFER: &str = "transfer(address,uint256)";

#[derive(Debug, Deserialize)]
struct RpcResponse {
    result: Option<Value>,
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcReceipt {
    block_number: Option<String>,
    status: Option<String>,
}

/// First four bytes of the keccak hash of a function signature
fn selector(signature: &str) -> [u8; 4] {
    let hash = keccak256(signature.as_bytes());
    [hash[0], hash[1], hash[2], hash[3]]
}

/// ABI-encode a call with static word arguments
fn encode_call(signature: &str, words: &[[u8; 32]]) -> String {
    let mut data = String::from("0x");
    data.push_str(&hex::encode(&selector(signature)));
    for word in words {
        data.push_str(&hex::encode(word));
    }
    data
}

fn address_word(address: &Address) -> [u8; 32] {
    let mut word = [0u8; 32];
    word[12..].copy_from_slice(address.as_bytes());
    word
}

fn amount_word(amount: Amount) -> [u8; 32] {
    amount.to_be_bytes::<32>()
}

/// Decode a `0x`-prefixed hex quantity or 32-byte word
fn decode_amount(hex: &str) -> Result<Amount> {
    let digits = hex.trim_start_matches("0x");
    if digits.is_empty() {
        return Ok(Amount::ZERO);
    }
    Amount::from_str_radix(digits, 16)
        .map_err(|e| TrackerError::TransientFetch(format!("malformed amount {}: {}", hex, e)))
}

fn decode_quantity(hex: &str) -> Result<u64> {
    u64::from_str_radix(hex.trim_start_matches("0x"), 16)
        .map_err(|e| TrackerError::TransientFetch(format!("malformed quantity {}: {}", hex, e)))
}

/// JSON-RPC ledger client for an EVM-style chain.
///
/// Reads go through `eth_call` against the distributor and token contracts.
/// Writes are sent with `eth_sendTransaction` from the connected account, so
/// the node (or the wallet behind it) does the signing.
pub struct JsonRpcLedgerClient {
    client: Client,
    rpc_url: String,
    distributor: Address,
    token: Address,
    from: Option<Address>,
    poll_interval: Duration,
    request_id: AtomicU64,
}

impl JsonRpcLedgerClient {
    pub fn new(rpc_url: String, distributor: Address, token: Address, from: Option<Address>) -> Self {
        Self {
            client: Client::new(),
            rpc_url,
            distributor,
            token,
            from,
            poll_interval: Duration::from_secs(2),
            request_id: AtomicU64::new(1),
        }
    }

    /// Interval between receipt polls while waiting for confirmations
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    async fn rpc(&self, method: &str, params: Value) -> Result<Value> {
        let payload = json!({
            "jsonrpc": "2.0",
            "id": self.request_id.fetch_add(1, Ordering::Relaxed),
            "method": method,
            "params": params,
        });

        let response: RpcResponse = self
            .client
            .post(&self.rpc_url)
            .json(&payload)
            .send()
            .await?
            .json()
            .await?;

        if let Some(err) = response.error {
            return Err(TrackerError::TransientFetch(format!(
                "{} failed ({}): {}",
                method, err.code, err.message
            )));
        }

        Ok(response.result.unwrap_or(Value::Null))
    }

    async fn call(&self, to: &Address, data: String) -> Result<Amount> {
        let result = self
            .rpc("eth_call", json!([{ "to": to.to_string(), "data": data }, "latest"]))
            .await?;
        let hex = result
            .as_str()
            .ok_or_else(|| TrackerError::TransientFetch("eth_call returned no data".to_string()))?;
        decode_amount(hex)
    }

    async fn send(&self, to: &Address, data: String) -> Result<TxHandle> {
        let from = self
            .from
            .ok_or_else(|| TrackerError::WriteRejected("no signer connected".to_string()))?;

        let result = self
            .rpc(
                "eth_sendTransaction",
                json!([{ "from": from.to_string(), "to": to.to_string(), "data": data }]),
            )
            .await
            .map_err(|e| TrackerError::WriteRejected(e.to_string()))?;

        let hash = result
            .as_str()
            .and_then(|s| B256::from_str(s).ok())
            .ok_or_else(|| TrackerError::WriteRejected(format!("unexpected tx hash: {}", result)))?;

        info!("Submitted transaction {} from {}", hash, from);
        Ok(TxHandle::new(hash))
    }

    async fn receipt(&self, hash: &B256) -> Result<Option<RpcReceipt>> {
        let result = self
            .rpc("eth_getTransactionReceipt", json!([hash.to_string()]))
            .await?;
        if result.is_null() {
            return Ok(None);
        }
        serde_json::from_value(result)
            .map(Some)
            .map_err(|e| TrackerError::TransientFetch(format!("malformed receipt: {}", e)))
    }

    async fn block_number(&self) -> Result<u64> {
        let result = self.rpc("eth_blockNumber", json!([])).await?;
        let hex = result
            .as_str()
            .ok_or_else(|| TrackerError::TransientFetch("missing block number".to_string()))?;
        decode_quantity(hex)
    }
}

#[async_trait]
impl RemoteLedgerClient for JsonRpcLedgerClient {
    async fn read_claimable(&self, account: &Address) -> Result<Amount> {
        let data = encode_call(CLAIMABLE_TOKENS, &[address_word(account)]);
        self.call(&self.distributor, data).await
    }

    async fn read_balance(&self, account: &Address) -> Result<Amount> {
        let data = encode_call(BALANCE_OF, &[address_word(account)]);
        self.call(&self.token, data).await
    }

    async fn submit_claim(&self) -> Result<TxHandle> {
        self.send(&self.distributor, encode_call(CLAIM, &[])).await
    }

    async fn submit_transfer(&self, to: &Address, amount: Amount) -> Result<TxHandle> {
        let data = encode_call(TRANSFER, &[address_word(to), amount_word(amount)]);
        self.send(&self.token, data).await
    }

    async fn await_confirmations(&self, tx: &TxHandle, confirmations: u64) -> Result<Receipt> {
        loop {
            // Transient polling errors are retried; the caller bounds the wait.
            match self.receipt(&tx.hash).await {
                Ok(Some(RpcReceipt {
                    block_number: Some(mined_in),
                    status,
                })) => {
                    let mined_in = decode_quantity(&mined_in)?;
                    let success = status.as_deref() == Some("0x1");
                    if !success {
                        return Ok(Receipt {
                            tx_hash: tx.hash,
                            block_number: mined_in,
                            success,
                        });
                    }

                    let head = self.block_number().await.unwrap_or(mined_in);
                    let depth = head.saturating_sub(mined_in) + 1;
                    debug!("{} at depth {}/{}", tx.hash, depth, confirmations);
                    if depth >= confirmations {
                        return Ok(Receipt {
                            tx_hash: tx.hash,
                            block_number: mined_in,
                            success,
                        });
                    }
                }
                Ok(_) => debug!("{} not mined yet", tx.hash),
                Err(e) => debug!("Receipt poll for {} failed: {}", tx.hash, e),
            }

            tokio::time::sleep(self.poll_interval).await;
        }
    }

    fn signer(&self) -> Option<Address> {
        self.from
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_selectors() {
        assert_eq!(hex::encode(&selector(BALANCE_OF)), "70a08231");
        assert_eq!(hex::encode(&selector(TRANSFER)), "a9059cbb");
        assert_eq!(hex::encode(&selector(CLAIM)), "4e71d92d");
    }

    #[test]
    fn test_encode_balance_call() {
        let account = Address::from([0xab; 20]);
        let data = encode_call(BALANCE_OF, &[address_word(&account)]);

        assert_eq!(data.len(), 2 + 8 + 64);
        assert!(data.starts_with("0x70a08231000000000000000000000000abab"));
        assert!(data.ends_with(&account.to_hex_without_prefix()));
    }

    #[test]
    fn test_encode_transfer_amount_word() {
        let data = encode_call(
            TRANSFER,
            &[address_word(&Address::from([1; 20])), amount_word(Amount::from(256u64))],
        );
        assert!(data.ends_with(&format!("{}0100", "0".repeat(60))));
    }

    #[test]
    fn test_decode_amount() {
        let word = format!("0x{}{}", "0".repeat(48), "0de0b6b3a7640000");
        assert_eq!(
            decode_amount(&word).unwrap(),
            Amount::from(1_000_000_000_000_000_000u64)
        );
        assert_eq!(decode_amount("0x").unwrap(), Amount::ZERO);
        assert!(decode_amount("0xzz").is_err());
    }

    #[test]
    fn test_signer_reflects_connected_account() {
        let token = Address::from([2; 20]);
        let client = JsonRpcLedgerClient::new("http://localhost:8545".to_string(), token, token, None);
        assert_eq!(client.signer(), None);
    }
}
