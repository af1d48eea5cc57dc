//! Chain data source seam: two live subscriptions plus point queries used by backfill.

use std::future::Future;
use std::time::Duration;

use alloy::primitives::{Address, B256};
use thiserror::Error;
use tokio::sync::{mpsc, watch};

use crate::abi::{BlockHeader, TransferLog};

/// What to subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionFilter {
    /// Every new block header.
    NewHeads,
    /// Logs emitted by `address` whose first topic is `topic0`.
    Logs { address: Address, topic0: B256 },
}

/// One pushed event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainEvent {
    Header(BlockHeader),
    TransferLog(TransferLog),
}

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("WebSocket error: {0}")]
    Ws(String),
    #[error("RPC error: {0}")]
    Rpc(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("no reply within {0:?}")]
    Timeout(Duration),
    #[error("block {0} not found")]
    BlockNotFound(u64),
    #[error("gave up after {attempts} connection attempts: {last}")]
    Exhausted { attempts: u32, last: String },
}

/// A node connection. Implementations must be cheap to share behind an `Arc`.
pub trait ChainSource: Send + Sync + 'static {
    /// Current chain head.
    fn block_number(&self) -> impl Future<Output = Result<u64, ChainError>> + Send;

    /// Header of block `number`; `Ok(None)` if the node does not have it.
    fn block_by_number(
        &self,
        number: u64,
    ) -> impl Future<Output = Result<Option<BlockHeader>, ChainError>> + Send;

    /// Push events matching `filter` into `sink` until `shutdown` flips to true (returns
    /// `Ok` after unsubscribing), `sink` is closed, or the subscription fails for good.
    fn subscribe(
        &self,
        filter: SubscriptionFilter,
        sink: mpsc::Sender<ChainEvent>,
        shutdown: watch::Receiver<bool>,
    ) -> impl Future<Output = Result<(), ChainError>> + Send;
}
