//! Chain event types and decoding from the JSON-RPC wire shape.
//!
//! `newHeads` / `eth_getBlockByNumber` headers and `logs` entries carry hex quantities;
//! these are turned into decimal strings so values wider than 64 bits survive intact.

use alloy::primitives::{b256, Address, B256, U256};
use anyhow::{Context, Result};
use serde_json::Value;

/// keccak256("Transfer(address,address,uint256)"), topic0 of every ERC20 Transfer.
pub const TRANSFER_TOPIC0: B256 =
    b256!("ddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef");

/// Header fields the window needs. Quantities are decimal strings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHeader {
    /// `None` for pending headers.
    pub number: Option<String>,
    /// Absent before London.
    pub base_fee_per_gas: Option<String>,
    pub gas_used: String,
    pub gas_limit: String,
}

/// Transfer log as far as the window cares: which block it landed in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferLog {
    /// Decimal block number; `None` for pending logs.
    pub block_number: Option<String>,
    /// Set by the node when the log was dropped by a reorg.
    pub removed: bool,
}

/// Decode a header object (eth_subscription `newHeads` result or eth_getBlockByNumber result).
pub fn decode_header(value: &Value) -> Result<BlockHeader> {
    if !value.is_object() {
        anyhow::bail!("header is not an object");
    }
    let number = optional_quantity(value, "number")?;
    let base_fee_per_gas = optional_quantity(value, "baseFeePerGas")?;
    let gas_used = optional_quantity(value, "gasUsed")?
        .ok_or_else(|| anyhow::anyhow!("Missing gasUsed"))?;
    let gas_limit = optional_quantity(value, "gasLimit")?
        .ok_or_else(|| anyhow::anyhow!("Missing gasLimit"))?;
    Ok(BlockHeader {
        number,
        base_fee_per_gas,
        gas_used,
        gas_limit,
    })
}

/// Decode a log object (eth_subscription `logs` result or eth_getLogs entry).
pub fn decode_transfer_log(value: &Value) -> Result<TransferLog> {
    if !value.is_object() {
        anyhow::bail!("log is not an object");
    }
    let block_number = optional_quantity(value, "blockNumber")?;
    let removed = value
        .get("removed")
        .and_then(|r| r.as_bool())
        .unwrap_or(false);
    Ok(TransferLog {
        block_number,
        removed,
    })
}

/// True if the log was emitted by `address` with `topic0` as its first topic.
///
/// Used when the node ignores or rejects the subscription's topic filter.
pub fn log_matches(log: &Value, address: &Address, topic0: &B256) -> bool {
    let emitter = log
        .get("address")
        .and_then(|a| a.as_str())
        .and_then(|s| hex::decode(s.strip_prefix("0x").unwrap_or(s)).ok());
    match emitter {
        Some(bytes) if bytes.as_slice() == address.as_slice() => {}
        _ => return false,
    }
    log.get("topics")
        .and_then(|t| t.as_array())
        .and_then(|t| t.first())
        .and_then(|t| t.as_str())
        .and_then(|s| hex::decode(s.strip_prefix("0x").unwrap_or(s)).ok())
        .map(|b| b.as_slice() == topic0.as_slice())
        .unwrap_or(false)
}

/// Hex quantity (`0x1b4`) to decimal string (`436`), arbitrary width up to 256 bits.
pub fn hex_quantity_to_decimal(s: &str) -> Result<String> {
    let digits = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .ok_or_else(|| anyhow::anyhow!("quantity {s:?} lacks 0x prefix"))?;
    if digits.is_empty() {
        anyhow::bail!("empty quantity");
    }
    let n = U256::from_str_radix(digits, 16).with_context(|| format!("parse quantity {s:?}"))?;
    Ok(n.to_string())
}

/// Hex quantity to `u64` (block numbers returned by eth_blockNumber).
pub fn hex_quantity_to_u64(s: &str) -> Result<u64> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    u64::from_str_radix(s, 16).context("parse hex u64")
}

fn optional_quantity(value: &Value, field: &str) -> Result<Option<String>> {
    match value.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => hex_quantity_to_decimal(s)
            .with_context(|| format!("field {field}"))
            .map(Some),
        Some(other) => anyhow::bail!("field {field} is not a string: {other}"),
    }
}
