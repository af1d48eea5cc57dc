//! Per-block summary kept in the window and written to the snapshot.
//!
//! Chain quantities stay decimal strings end to end; they can exceed `u64`.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

use crate::abi::BlockHeader;

/// One observed block. Field names match the snapshot JSON.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockSummary {
    /// Block height, decimal.
    pub number: String,
    /// Matching Transfer logs seen for this block so far.
    pub erc20_tx_count: u64,
    /// Base fee per gas in wei, decimal. `"0"` before London.
    pub base_fee: String,
    pub gas_used: String,
    pub gas_limit: String,
}

impl BlockSummary {
    /// Build a fresh summary (count 0) from a decoded header. `None` if the header has no number.
    pub fn from_header(header: &BlockHeader) -> Option<Self> {
        let number = header.number.clone()?;
        Some(Self {
            number,
            erc20_tx_count: 0,
            base_fee: header.base_fee_per_gas.clone().unwrap_or_else(|| "0".to_string()),
            gas_used: header.gas_used.clone(),
            gas_limit: header.gas_limit.clone(),
        })
    }

    /// Block number as `u64`, when it fits.
    pub fn number_u64(&self) -> Option<u64> {
        self.number.parse().ok()
    }
}

/// Compare two decimal strings by numeric value, exactly, at any length.
///
/// Anything that is not a plain digit string sorts after every valid number.
pub fn cmp_decimal(a: &str, b: &str) -> Ordering {
    match (significant_digits(a), significant_digits(b)) {
        (Some(a), Some(b)) => a.len().cmp(&b.len()).then_with(|| a.cmp(b)),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => a.cmp(b),
    }
}

fn significant_digits(s: &str) -> Option<&str> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let trimmed = s.trim_start_matches('0');
    Some(if trimmed.is_empty() { "0" } else { trimmed })
}

/// Sort summaries newest first (descending block number).
pub fn sort_descending(blocks: &mut [BlockSummary]) {
    blocks.sort_by(|a, b| cmp_decimal(&b.number, &a.number));
}
