//! Common helpers for integration tests.
#![allow(dead_code)]

use std::collections::HashMap;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result};
use blockwatch::{
    BlockHeader, BlockSummary, ChainError, ChainEvent, ChainSource, SnapshotError, SnapshotStore,
    Subscription, SubscriptionFilter, TransferLog,
};
use tokio::sync::{mpsc, watch};
use tokio::time::sleep;

pub fn header(n: u64) -> BlockHeader {
    BlockHeader {
        number: Some(n.to_string()),
        base_fee_per_gas: Some((7 + n).to_string()),
        gas_used: "21000".into(),
        gas_limit: "30000000".into(),
    }
}

pub fn transfer(n: u64) -> TransferLog {
    TransferLog {
        block_number: Some(n.to_string()),
        removed: false,
    }
}

pub fn summary(n: u64, count: u64) -> BlockSummary {
    let mut s = BlockSummary::from_header(&header(n)).unwrap();
    s.erc20_tx_count = count;
    s
}

pub fn numbers(blocks: &[BlockSummary]) -> Vec<String> {
    blocks.iter().map(|b| b.number.clone()).collect()
}

/// Scripted node: fixed head, a block table, injectable per-block failures, and live
/// subscriptions the test pushes events into.
#[derive(Default)]
pub struct MockChainSource {
    head: AtomicU64,
    blocks: Mutex<HashMap<u64, BlockHeader>>,
    failures: Mutex<HashMap<u64, u32>>,
    hung: Mutex<Vec<u64>>,
    fetched: Mutex<Vec<u64>>,
    head_calls: AtomicU32,
    sinks: Mutex<Vec<(SubscriptionFilter, mpsc::Sender<ChainEvent>)>>,
    unsubscribed: AtomicUsize,
}

impl MockChainSource {
    /// Chain with blocks `0..=head`.
    pub fn with_head(head: u64) -> Self {
        let source = Self::default();
        source.head.store(head, Ordering::SeqCst);
        {
            let mut blocks = source.blocks.lock().unwrap();
            for n in 0..=head {
                blocks.insert(n, header(n));
            }
        }
        source
    }

    /// Fail the next `times` fetches of block `n`.
    pub fn fail_block(&self, n: u64, times: u32) {
        self.failures.lock().unwrap().insert(n, times);
    }

    /// Fetches of block `n` never complete.
    pub fn hang_block(&self, n: u64) {
        self.hung.lock().unwrap().push(n);
    }

    pub fn fetched(&self) -> Vec<u64> {
        self.fetched.lock().unwrap().clone()
    }

    pub fn head_calls(&self) -> u32 {
        self.head_calls.load(Ordering::SeqCst)
    }

    pub fn unsubscribed(&self) -> usize {
        self.unsubscribed.load(Ordering::SeqCst)
    }

    pub fn filters(&self) -> Vec<SubscriptionFilter> {
        self.sinks.lock().unwrap().iter().map(|(f, _)| *f).collect()
    }

    /// Wait until `n` subscriptions are live.
    pub async fn wait_subscribed(&self, n: usize) {
        for _ in 0..1_000 {
            if self.sinks.lock().unwrap().len() >= n {
                return;
            }
            sleep(Duration::from_millis(1)).await;
        }
        panic!("{n} subscriptions never became live");
    }

    pub async fn push_header(&self, n: u64) {
        self.push(ChainEvent::Header(header(n))).await;
    }

    pub async fn push_transfer(&self, n: u64) {
        self.push(ChainEvent::TransferLog(transfer(n))).await;
    }

    async fn push(&self, event: ChainEvent) {
        let want_heads = matches!(event, ChainEvent::Header(_));
        self.wait_subscribed(2).await;
        let sink = self
            .sinks
            .lock()
            .unwrap()
            .iter()
            .find(|(f, _)| matches!(f, SubscriptionFilter::NewHeads) == want_heads)
            .map(|(_, s)| s.clone())
            .unwrap();
        sink.send(event).await.unwrap();
    }
}

impl ChainSource for MockChainSource {
    async fn block_number(&self) -> Result<u64, ChainError> {
        self.head_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.head.load(Ordering::SeqCst))
    }

    async fn block_by_number(&self, number: u64) -> Result<Option<BlockHeader>, ChainError> {
        self.fetched.lock().unwrap().push(number);
        let hung = self.hung.lock().unwrap().contains(&number);
        if hung {
            std::future::pending::<()>().await;
        }
        {
            let mut failures = self.failures.lock().unwrap();
            if let Some(left) = failures.get_mut(&number) {
                if *left > 0 {
                    *left -= 1;
                    return Err(ChainError::Rpc(format!("injected failure for {number}")));
                }
            }
        }
        Ok(self.blocks.lock().unwrap().get(&number).cloned())
    }

    async fn subscribe(
        &self,
        filter: SubscriptionFilter,
        sink: mpsc::Sender<ChainEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), ChainError> {
        self.sinks.lock().unwrap().push((filter, sink.clone()));
        loop {
            if *shutdown.borrow_and_update() {
                break;
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = sink.closed() => break,
            }
        }
        self.sinks
            .lock()
            .unwrap()
            .retain(|(_, s)| !s.same_channel(&sink));
        self.unsubscribed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Snapshot store in memory; keeps every save.
#[derive(Default)]
pub struct MemoryStore {
    initial: Mutex<Option<Vec<BlockSummary>>>,
    saves: Mutex<Vec<Vec<BlockSummary>>>,
}

impl MemoryStore {
    pub fn with_snapshot(blocks: Vec<BlockSummary>) -> Self {
        Self {
            initial: Mutex::new(Some(blocks)),
            saves: Mutex::default(),
        }
    }

    pub fn saves(&self) -> Vec<Vec<BlockSummary>> {
        self.saves.lock().unwrap().clone()
    }

    pub fn save_count(&self) -> usize {
        self.saves.lock().unwrap().len()
    }

    /// Wait (in virtual or real time) until at least `n` saves landed.
    pub async fn wait_saves(&self, n: usize) -> Vec<Vec<BlockSummary>> {
        for _ in 0..1_000 {
            if self.save_count() >= n {
                return self.saves();
            }
            sleep(Duration::from_millis(10)).await;
        }
        panic!("expected {n} saves, got {}", self.save_count());
    }
}

impl SnapshotStore for MemoryStore {
    fn load(&self) -> Result<Vec<BlockSummary>, SnapshotError> {
        self.initial.lock().unwrap().clone().ok_or(SnapshotError::NotFound)
    }

    fn save(&self, blocks: &[BlockSummary]) -> Result<(), SnapshotError> {
        self.saves.lock().unwrap().push(blocks.to_vec());
        Ok(())
    }
}

/// Next published window for which `pred` holds, within `limit`.
pub async fn wait_for_change(
    sub: &mut Subscription,
    limit: Duration,
    pred: impl Fn(&[BlockSummary]) -> bool,
) -> Vec<BlockSummary> {
    tokio::time::timeout(limit, async {
        loop {
            let blocks = sub.next().await.expect("change feed closed");
            if pred(&blocks[..]) {
                return blocks.to_vec();
            }
        }
    })
    .await
    .expect("no matching change published")
}

pub fn anvil_available() -> bool {
    Command::new("anvil")
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

/// Spawn Anvil on a dynamic port and wait until ready. Returns the process and the HTTP URL;
/// the WebSocket endpoint is the same address with `ws://`.
pub async fn spawn_anvil() -> Result<(Child, String)> {
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").context("bind for port")?;
        listener.local_addr()?.port()
    };
    let rpc_url = format!("http://127.0.0.1:{}", port);
    let mut cmd = Command::new("anvil");
    cmd.arg("--port")
        .arg(port.to_string())
        .arg("--host")
        .arg("127.0.0.1");
    cmd.stdout(Stdio::null()).stderr(Stdio::null());
    let process = cmd.spawn().context("spawn anvil")?;
    wait_for_rpc(&rpc_url).await?;
    Ok((process, rpc_url))
}

async fn rpc(url: &str, method: &str, params: serde_json::Value) -> Result<serde_json::Value> {
    let client = reqwest::Client::new();
    let resp: serde_json::Value = client
        .post(url)
        .json(&serde_json::json!({"jsonrpc":"2.0","method":method,"params":params,"id":1}))
        .send()
        .await?
        .json()
        .await?;
    if let Some(err) = resp.get("error") {
        anyhow::bail!("{method} failed: {err}");
    }
    Ok(resp.get("result").cloned().unwrap_or(serde_json::Value::Null))
}

async fn wait_for_rpc(url: &str) -> Result<()> {
    for _ in 0..50 {
        if rpc(url, "eth_blockNumber", serde_json::json!([])).await.is_ok() {
            return Ok(());
        }
        sleep(Duration::from_millis(100)).await;
    }
    anyhow::bail!("RPC not ready");
}

/// Mine `blocks` empty blocks.
pub async fn evm_mine(url: &str, blocks: u64) -> Result<()> {
    for _ in 0..blocks {
        rpc(url, "evm_mine", serde_json::json!([])).await?;
    }
    Ok(())
}

pub async fn block_number(url: &str) -> Result<u64> {
    let v = rpc(url, "eth_blockNumber", serde_json::json!([])).await?;
    let s = v.as_str().context("eth_blockNumber result")?;
    Ok(u64::from_str_radix(s.trim_start_matches("0x"), 16)?)
}
