//! JSON-RPC chain provider over HTTP.
//!
//! Blocks are fetched with full transactions and enriched with the block's
//! logs in a second call, so the rest of the pipeline always sees complete
//! [`Block`] values. New tips are observed by polling `eth_blockNumber`;
//! the poll interval bounds how far behind a notification can lag.

use std::time::Duration;

use futures::stream::{self, BoxStream, StreamExt};
use reqwest::Client;
use serde_json::{json, Value};
use tracing::trace;

use crate::types::{Address, Block, Hash256, Log, Receipt, Transaction, TransactionRequest};

use super::{ChainProvider, ProviderError};

#[derive(Debug, Clone)]
pub struct JsonRpcProviderConfig {
    pub url: String,
    pub chain_id: u64,
    pub request_timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for JsonRpcProviderConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:8545".to_string(),
            chain_id: 1,
            request_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_secs(2),
        }
    }
}

pub struct JsonRpcProvider {
    client: Client,
    config: JsonRpcProviderConfig,
}

impl JsonRpcProvider {
    pub fn new(config: JsonRpcProviderConfig) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| ProviderError::Transport(e.to_string()))?;
        Ok(Self { client, config })
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value, ProviderError> {
        rpc_call(&self.client, &self.config.url, method, params).await
    }

    async fn fetch_block(&self, selector: Value, by_hash: bool) -> Result<Option<Block>, ProviderError> {
        let method = if by_hash { "eth_getBlockByHash" } else { "eth_getBlockByNumber" };
        let raw = self.call(method, json!([selector, true])).await?;
        if raw.is_null() {
            return Ok(None);
        }
        let mut block = parse_block(&raw, self.config.chain_id)?;
        let logs = self.call("eth_getLogs", json!([{ "blockHash": encode_hash(&block.hash) }])).await?;
        block.logs = parse_logs(&logs)?;
        Ok(Some(block))
    }
}

#[async_trait::async_trait]
impl ChainProvider for JsonRpcProvider {
    async fn block_by_number(&self, number: u64) -> Result<Option<Block>, ProviderError> {
        self.fetch_block(Value::String(encode_u64(number)), false).await
    }

    async fn block_by_hash(&self, hash: &Hash256) -> Result<Option<Block>, ProviderError> {
        self.fetch_block(Value::String(encode_hash(hash)), true).await
    }

    async fn block_number(&self) -> Result<u64, ProviderError> {
        parse_hex_u64(&self.call("eth_blockNumber", json!([])).await?)
    }

    async fn transaction_receipt(
        &self,
        tx_hash: &Hash256,
    ) -> Result<Option<Receipt>, ProviderError> {
        let raw = self.call("eth_getTransactionReceipt", json!([encode_hash(tx_hash)])).await?;
        if raw.is_null() {
            return Ok(None);
        }
        Ok(Some(Receipt {
            transaction_hash: parse_hash(&raw["transactionHash"])?,
            block_hash: parse_hash(&raw["blockHash"])?,
            block_number: parse_hex_u64(&raw["blockNumber"])?,
            gas_used: parse_hex_u64(&raw["gasUsed"])?,
            status: parse_hex_u64(&raw["status"]).unwrap_or(0) == 1,
        }))
    }

    async fn transaction_count(&self, address: &Address) -> Result<u64, ProviderError> {
        parse_hex_u64(
            &self
                .call("eth_getTransactionCount", json!([encode_address(address), "latest"]))
                .await?,
        )
    }

    async fn balance(&self, address: &Address) -> Result<u128, ProviderError> {
        parse_hex_u128(&self.call("eth_getBalance", json!([encode_address(address), "latest"])).await?)
    }

    async fn gas_price(&self) -> Result<u128, ProviderError> {
        parse_hex_u128(&self.call("eth_gasPrice", json!([])).await?)
    }

    async fn estimate_gas(&self, tx: &TransactionRequest) -> Result<u64, ProviderError> {
        let params = json!([{
            "to": encode_address(&tx.to),
            "value": encode_u128(tx.value),
            "data": encode_bytes(&tx.data),
        }]);
        parse_hex_u64(&self.call("eth_estimateGas", params).await?)
    }

    async fn send_raw_transaction(&self, raw: Vec<u8>) -> Result<Hash256, ProviderError> {
        parse_hash(&self.call("eth_sendRawTransaction", json!([encode_bytes(&raw)])).await?)
    }

    async fn subscribe_blocks(&self) -> Result<BoxStream<'static, u64>, ProviderError> {
        let client = self.client.clone();
        let url = self.config.url.clone();
        let poll = self.config.poll_interval;

        let stream = stream::unfold(None::<u64>, move |last| {
            let client = client.clone();
            let url = url.clone();
            async move {
                loop {
                    tokio::time::sleep(poll).await;
                    match rpc_call(&client, &url, "eth_blockNumber", json!([])).await {
                        Ok(value) => match parse_hex_u64(&value) {
                            Ok(n) if Some(n) != last => {
                                trace!(block = n, "new tip observed");
                                return Some((n, Some(n)));
                            }
                            _ => {}
                        },
                        Err(err) => {
                            trace!(error = %err, "tip poll failed");
                        }
                    }
                }
            }
        });
        Ok(stream.boxed())
    }
}

async fn rpc_call(
    client: &Client,
    url: &str,
    method: &str,
    params: Value,
) -> Result<Value, ProviderError> {
    let payload = json!({ "jsonrpc": "2.0", "id": 1, "method": method, "params": params });
    let response = client.post(url).json(&payload).send().await.map_err(map_transport)?;
    let body: Value = response.json().await.map_err(map_transport)?;

    if let Some(err) = body.get("error").filter(|e| !e.is_null()) {
        let code = err["code"].as_i64().unwrap_or(0);
        let message = err["message"].as_str().unwrap_or("").to_string();
        if message.to_lowercase().contains("unknown block") {
            return Err(ProviderError::UnknownBlock);
        }
        return Err(ProviderError::Rpc { code, message });
    }
    body.get("result")
        .cloned()
        .ok_or_else(|| ProviderError::MalformedResponse("missing result".to_string()))
}

fn map_transport(err: reqwest::Error) -> ProviderError {
    if err.is_timeout() {
        ProviderError::Timeout
    } else {
        ProviderError::Transport(err.to_string())
    }
}

fn parse_block(raw: &Value, default_chain_id: u64) -> Result<Block, ProviderError> {
    let number = parse_hex_u64(&raw["number"])?;
    let transactions = raw["transactions"]
        .as_array()
        .map(|txs| {
            txs.iter()
                .map(|tx| parse_transaction(tx, number, default_chain_id))
                .collect::<Result<Vec<_>, _>>()
        })
        .transpose()?
        .unwrap_or_default();

    Ok(Block {
        hash: parse_hash(&raw["hash"])?,
        number,
        parent_hash: parse_hash(&raw["parentHash"])?,
        transactions,
        logs: Vec::new(),
    })
}

fn parse_transaction(
    raw: &Value,
    block_number: u64,
    default_chain_id: u64,
) -> Result<Transaction, ProviderError> {
    Ok(Transaction {
        hash: parse_hash(&raw["hash"])?,
        from: parse_address_value(&raw["from"])?,
        to: if raw["to"].is_null() { None } else { Some(parse_address_value(&raw["to"])?) },
        nonce: parse_hex_u64(&raw["nonce"])?,
        chain_id: parse_hex_u64(&raw["chainId"]).unwrap_or(default_chain_id),
        data: parse_bytes(&raw["input"])?,
        value: parse_hex_u128(&raw["value"])?,
        gas_limit: parse_hex_u64(&raw["gas"])?,
        gas_price: parse_hex_u128(&raw["gasPrice"]).unwrap_or(0),
        block_number,
    })
}

fn parse_logs(raw: &Value) -> Result<Vec<Log>, ProviderError> {
    let Some(entries) = raw.as_array() else { return Ok(Vec::new()) };
    entries
        .iter()
        .map(|entry| {
            let mut topics = [None; 4];
            if let Some(raw_topics) = entry["topics"].as_array() {
                for (i, topic) in raw_topics.iter().take(4).enumerate() {
                    topics[i] = Some(parse_hash(topic)?);
                }
            }
            Ok(Log {
                address: parse_address_value(&entry["address"])?,
                topics,
                data: parse_bytes(&entry["data"])?,
                transaction_hash: parse_hash(&entry["transactionHash"])?,
            })
        })
        .collect()
}

// hex plumbing: quantities are 0x-prefixed, minimal-length; data is
// 0x-prefixed, even-length

fn hex_str(value: &Value) -> Result<&str, ProviderError> {
    value
        .as_str()
        .and_then(|s| s.strip_prefix("0x"))
        .ok_or_else(|| ProviderError::MalformedResponse(format!("expected hex string, got {value}")))
}

fn parse_hex_u64(value: &Value) -> Result<u64, ProviderError> {
    let s = hex_str(value)?;
    u64::from_str_radix(s, 16)
        .map_err(|_| ProviderError::MalformedResponse(format!("bad u64 quantity: {value}")))
}

fn parse_hex_u128(value: &Value) -> Result<u128, ProviderError> {
    let s = hex_str(value)?;
    u128::from_str_radix(s, 16)
        .map_err(|_| ProviderError::MalformedResponse(format!("bad u128 quantity: {value}")))
}

fn parse_bytes(value: &Value) -> Result<Vec<u8>, ProviderError> {
    let s = hex_str(value)?;
    if s.len() % 2 != 0 {
        return Err(ProviderError::MalformedResponse(format!("odd-length data: {value}")));
    }
    (0..s.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&s[i..i + 2], 16)
                .map_err(|_| ProviderError::MalformedResponse(format!("bad hex byte in {value}")))
        })
        .collect()
}

fn parse_fixed<const N: usize>(value: &Value) -> Result<[u8; N], ProviderError> {
    let bytes = parse_bytes(value)?;
    bytes.try_into().map_err(|_| {
        ProviderError::MalformedResponse(format!("expected {N}-byte value, got {value}"))
    })
}

fn parse_hash(value: &Value) -> Result<Hash256, ProviderError> {
    parse_fixed::<32>(value)
}

fn parse_address_value(value: &Value) -> Result<Address, ProviderError> {
    parse_fixed::<20>(value)
}

fn encode_bytes(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(2 + bytes.len() * 2);
    s.push_str("0x");
    for b in bytes {
        s.push_str(&format!("{b:02x}"));
    }
    s
}

fn encode_hash(hash: &Hash256) -> String {
    encode_bytes(hash)
}

fn encode_address(address: &Address) -> String {
    encode_bytes(address)
}

fn encode_u64(n: u64) -> String {
    format!("0x{n:x}")
}

fn encode_u128(n: u128) -> String {
    format!("0x{n:x}")
}
