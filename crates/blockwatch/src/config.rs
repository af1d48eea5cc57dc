//! Watcher configuration.

use std::path::PathBuf;
use std::time::Duration;

use alloy::primitives::{address, Address, B256};
use thiserror::Error;

use crate::abi::TRANSFER_TOPIC0;
use crate::debounce::DEFAULT_INTERVAL;
use crate::snapshot::DEFAULT_SNAPSHOT_PATH;
use crate::window::DEFAULT_CAP;

/// USDT on Ethereum mainnet.
pub const DEFAULT_ERC20_ADDRESS: Address = address!("dAC17F958D2ee523a2206206994597C13D831ec7");

pub const ENV_WS_URL: &str = "BLOCKWATCH_WS_URL";
pub const ENV_HTTP_URL: &str = "BLOCKWATCH_HTTP_URL";
pub const ENV_ERC20_ADDRESS: &str = "BLOCKWATCH_ERC20_ADDRESS";
pub const ENV_SNAPSHOT_PATH: &str = "BLOCKWATCH_SNAPSHOT_PATH";
pub const ENV_WINDOW_CAP: &str = "BLOCKWATCH_WINDOW_CAP";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} is not set")]
    Missing(&'static str),
    #[error("{var} is invalid: {reason}")]
    Invalid { var: &'static str, reason: String },
}

/// Watcher configuration.
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// WebSocket RPC URL for the newHeads and logs subscriptions. Usually carries the
    /// provider key.
    pub ws_url: String,
    /// HTTP RPC URL for backfill (eth_blockNumber, eth_getBlockByNumber).
    pub http_url: String,
    /// ERC20 contract whose Transfer logs are counted.
    pub token_address: Address,
    /// topic0 of the counted event.
    pub transfer_topic: B256,
    /// Blocks kept in the window.
    pub window_cap: usize,
    /// Snapshot file.
    pub snapshot_path: PathBuf,
    /// Quiet period before a burst of changes is persisted and published.
    pub debounce: Duration,
    /// Per-block retry policy for backfill.
    pub backfill_retry: RetryConfig,
    /// Reconnection backoff for the WebSocket subscriptions.
    pub reconnection: ReconnectionConfig,
}

impl WatcherConfig {
    /// Config for `ws_url` with every other field at its default.
    pub fn new(ws_url: impl Into<String>) -> Self {
        let ws_url = ws_url.into();
        Self {
            http_url: http_url_for(&ws_url),
            ws_url,
            token_address: DEFAULT_ERC20_ADDRESS,
            transfer_topic: TRANSFER_TOPIC0,
            window_cap: DEFAULT_CAP,
            snapshot_path: PathBuf::from(DEFAULT_SNAPSHOT_PATH),
            debounce: DEFAULT_INTERVAL,
            backfill_retry: RetryConfig::default(),
            reconnection: ReconnectionConfig::default(),
        }
    }

    /// Read `BLOCKWATCH_*` variables from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup (the environment, a map in tests).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let ws_url = get(ENV_WS_URL).ok_or(ConfigError::Missing(ENV_WS_URL))?;
        if !(ws_url.starts_with("ws://") || ws_url.starts_with("wss://")) {
            return Err(ConfigError::Invalid {
                var: ENV_WS_URL,
                reason: "expected a ws:// or wss:// URL".into(),
            });
        }
        let mut config = Self::new(ws_url);

        if let Some(http_url) = get(ENV_HTTP_URL) {
            config.http_url = http_url;
        }
        if let Some(addr) = get(ENV_ERC20_ADDRESS) {
            config.token_address = addr.trim().parse::<Address>().map_err(|e| {
                ConfigError::Invalid {
                    var: ENV_ERC20_ADDRESS,
                    reason: e.to_string(),
                }
            })?;
        }
        if let Some(path) = get(ENV_SNAPSHOT_PATH) {
            config.snapshot_path = PathBuf::from(path);
        }
        if let Some(cap) = get(ENV_WINDOW_CAP) {
            config.window_cap = match cap.trim().parse::<usize>() {
                Ok(n) if n > 0 => n,
                Ok(_) => {
                    return Err(ConfigError::Invalid {
                        var: ENV_WINDOW_CAP,
                        reason: "must be at least 1".into(),
                    })
                }
                Err(e) => {
                    return Err(ConfigError::Invalid {
                        var: ENV_WINDOW_CAP,
                        reason: e.to_string(),
                    })
                }
            };
        }
        Ok(config)
    }
}

/// `ws://` → `http://`, `wss://` → `https://`.
pub fn http_url_for(ws_url: &str) -> String {
    if let Some(rest) = ws_url.strip_prefix("wss://") {
        format!("https://{rest}")
    } else if let Some(rest) = ws_url.strip_prefix("ws://") {
        format!("http://{rest}")
    } else {
        ws_url.to_string()
    }
}

/// Bounded retry with exponential backoff.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Attempts per block before backfill gives up.
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// A single fetch still pending after this long counts as a failed attempt.
    pub attempt_timeout_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 500,
            max_backoff_ms: 8_000,
            attempt_timeout_ms: 20_000,
        }
    }
}

/// Reconnection backoff.
#[derive(Debug, Clone)]
pub struct ReconnectionConfig {
    pub initial_backoff_secs: u64,
    pub max_backoff_secs: u64,
    /// Consecutive failed sessions before giving up; `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectionConfig {
    fn default() -> Self {
        Self {
            initial_backoff_secs: 1,
            max_backoff_secs: 60,
            max_attempts: None,
        }
    }
}

/// `min(initial * 2^attempt, max)` plus up to `jitter` of random slack.
pub fn backoff_delay(initial: Duration, max: Duration, attempt: u32, jitter: Duration) -> Duration {
    use rand::Rng;

    let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
    let base = initial.saturating_mul(factor).min(max);
    let jitter_ms = jitter.as_millis() as u64;
    if jitter_ms == 0 {
        return base;
    }
    base + Duration::from_millis(rand::thread_rng().gen_range(0..jitter_ms))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn reconnection_config_default() {
        let c = ReconnectionConfig::default();
        assert_eq!(c.initial_backoff_secs, 1);
        assert_eq!(c.max_backoff_secs, 60);
        assert_eq!(c.max_attempts, None);
    }

    #[test]
    fn defaults_from_ws_url_only() {
        let c = WatcherConfig::from_lookup(lookup(&[(ENV_WS_URL, "wss://eth.example/v2/KEY")])).unwrap();
        assert_eq!(c.http_url, "https://eth.example/v2/KEY");
        assert_eq!(c.token_address, DEFAULT_ERC20_ADDRESS);
        assert_eq!(c.window_cap, 11);
        assert_eq!(c.debounce, Duration::from_secs(1));
        assert_eq!(c.snapshot_path, PathBuf::from("blocks.json"));
        assert_eq!(c.transfer_topic, TRANSFER_TOPIC0);
    }

    #[test]
    fn overrides() {
        let c = WatcherConfig::from_lookup(lookup(&[
            (ENV_WS_URL, "ws://127.0.0.1:8545"),
            (ENV_HTTP_URL, "http://10.0.0.1:8545"),
            (ENV_ERC20_ADDRESS, "0xa0b86991c6218b36c1d19d4a2e9eb0ce3606eb48"),
            (ENV_SNAPSHOT_PATH, "/var/lib/blockwatch/blocks.json"),
            (ENV_WINDOW_CAP, "3"),
        ]))
        .unwrap();
        assert_eq!(c.http_url, "http://10.0.0.1:8545");
        assert_eq!(
            c.token_address,
            address!("a0b86991c6218b36c1d19d4a2e9eb0ce3606eb48")
        );
        assert_eq!(c.window_cap, 3);
    }

    #[test]
    fn address_without_prefix_or_checksum_casing() {
        let c = WatcherConfig::from_lookup(lookup(&[
            (ENV_WS_URL, "ws://x"),
            (ENV_ERC20_ADDRESS, " DAC17F958D2EE523A2206206994597C13D831EC7 "),
        ]))
        .unwrap();
        assert_eq!(c.token_address, DEFAULT_ERC20_ADDRESS);
    }

    #[test]
    fn empty_address_falls_back_to_default() {
        let c = WatcherConfig::from_lookup(lookup(&[
            (ENV_WS_URL, "ws://localhost:8546"),
            (ENV_ERC20_ADDRESS, ""),
        ]))
        .unwrap();
        assert_eq!(c.token_address, DEFAULT_ERC20_ADDRESS);
    }

    #[test]
    fn rejects_bad_values() {
        assert!(matches!(
            WatcherConfig::from_lookup(lookup(&[])),
            Err(ConfigError::Missing(ENV_WS_URL))
        ));
        assert!(WatcherConfig::from_lookup(lookup(&[(ENV_WS_URL, "https://x")])).is_err());
        assert!(WatcherConfig::from_lookup(lookup(&[
            (ENV_WS_URL, "ws://x"),
            (ENV_ERC20_ADDRESS, "0x1234"),
        ]))
        .is_err());
        assert!(WatcherConfig::from_lookup(lookup(&[
            (ENV_WS_URL, "ws://x"),
            (ENV_WINDOW_CAP, "0"),
        ]))
        .is_err());
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let s = Duration::from_secs(1);
        let max = Duration::from_secs(60);
        assert_eq!(backoff_delay(s, max, 0, Duration::ZERO), Duration::from_secs(1));
        assert_eq!(backoff_delay(s, max, 3, Duration::ZERO), Duration::from_secs(8));
        assert_eq!(backoff_delay(s, max, 10, Duration::ZERO), max);
        assert_eq!(backoff_delay(s, max, 40, Duration::ZERO), max);
        let jittered = backoff_delay(s, max, 0, Duration::from_millis(500));
        assert!(jittered >= s && jittered < s + Duration::from_millis(500));
    }
}
