//! JSON-RPC chain source: HTTP for point queries, WebSocket for eth_subscribe.
//!
//! Subscriptions reconnect with exponential backoff after a dropped socket. A session that
//! delivered events resets the backoff. On shutdown the subscription is unregistered with
//! eth_unsubscribe before the socket is closed.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use alloy::primitives::{Address, B256};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::abi::{decode_header, decode_transfer_log, hex_quantity_to_u64, log_matches, BlockHeader};
use crate::config::{backoff_delay, ReconnectionConfig};
use crate::source::{ChainError, ChainEvent, ChainSource, SubscriptionFilter};

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

const SUBSCRIBE_TIMEOUT: Duration = Duration::from_secs(10);
const HTTP_TIMEOUT: Duration = Duration::from_secs(15);
const HTTP_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const RECONNECT_JITTER: Duration = Duration::from_millis(500);

fn build_logs_filter(address: &Address, topic0: Option<&B256>) -> Value {
    let mut filter = json!({
        "address": format!("0x{}", hex::encode(address)),
    });
    // Single-topic filter: [topic0] only (some nodes reject [topic0, null, null, null]).
    if let Some(t0) = topic0 {
        filter["topics"] = json!([format!("0x{}", hex::encode(t0))]);
    }
    filter
}

fn ws_err(e: impl std::fmt::Display) -> ChainError {
    ChainError::Ws(e.to_string())
}

/// Chain source over a node's JSON-RPC endpoints.
pub struct WsChainSource {
    ws_url: String,
    http_url: String,
    reconnection: ReconnectionConfig,
    http: reqwest::Client,
    next_id: AtomicU64,
}

impl WsChainSource {
    pub fn new(
        ws_url: impl Into<String>,
        http_url: impl Into<String>,
        reconnection: ReconnectionConfig,
    ) -> Result<Self, ChainError> {
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .connect_timeout(HTTP_CONNECT_TIMEOUT)
            .build()?;
        Ok(Self {
            ws_url: ws_url.into(),
            http_url: http_url.into(),
            reconnection,
            http,
            next_id: AtomicU64::new(1),
        })
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    async fn http_json_rpc(&self, method: &str, params: Value) -> Result<Value, ChainError> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": self.next_id(),
            "method": method,
            "params": params
        });
        let resp = self.http.post(&self.http_url).json(&body).send().await?;
        let json: Value = resp.error_for_status()?.json().await?;
        if let Some(err) = json.get("error") {
            return Err(ChainError::Rpc(err.to_string()));
        }
        json.get("result")
            .cloned()
            .ok_or_else(|| ChainError::Decode("Missing result".into()))
    }

    /// One connection's worth of subscription. Returns why it ended; `delivered` counts
    /// events handed to `sink`.
    async fn run_session(
        &self,
        filter: SubscriptionFilter,
        sink: &mpsc::Sender<ChainEvent>,
        shutdown: &mut watch::Receiver<bool>,
        delivered: &mut u64,
    ) -> Result<SessionEnd, ChainError> {
        let (mut ws, _) = timeout(SUBSCRIBE_TIMEOUT, connect_async(self.ws_url.as_str()))
            .await
            .map_err(|_| ChainError::Ws("connect timeout".into()))?
            .map_err(ws_err)?;

        let (sub_id, client_filter) = match filter {
            SubscriptionFilter::NewHeads => {
                let id = self.eth_subscribe(&mut ws, json!(["newHeads"])).await?;
                (id, None)
            }
            SubscriptionFilter::Logs { address, topic0 } => {
                let params = json!(["logs", build_logs_filter(&address, Some(&topic0))]);
                match self.eth_subscribe(&mut ws, params).await {
                    Ok(id) => (id, None),
                    Err(ChainError::Rpc(reason)) => {
                        tracing::warn!(%reason, "node rejected topic filter, filtering client-side");
                        let params = json!(["logs", build_logs_filter(&address, None)]);
                        let id = self.eth_subscribe(&mut ws, params).await?;
                        (id, Some((address, topic0)))
                    }
                    Err(e) => return Err(e),
                }
            }
        };
        tracing::info!(?filter, %sub_id, "subscribed");

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        self.eth_unsubscribe(&mut ws, &sub_id).await;
                        return Ok(SessionEnd::Shutdown);
                    }
                }
                msg = ws.next() => {
                    let text = match msg {
                        None => return Ok(SessionEnd::Closed),
                        Some(msg) => match msg.map_err(ws_err)? {
                            Message::Text(t) => t,
                            Message::Close(_) => return Ok(SessionEnd::Closed),
                            _ => continue,
                        },
                    };
                    let Some(event) = decode_notification(&text, &sub_id, filter, client_filter.as_ref())? else {
                        continue;
                    };
                    if sink.send(event).await.is_err() {
                        self.eth_unsubscribe(&mut ws, &sub_id).await;
                        return Ok(SessionEnd::SinkClosed);
                    }
                    *delivered += 1;
                }
            }
        }
    }

    async fn eth_subscribe(&self, ws: &mut WsStream, params: Value) -> Result<String, ChainError> {
        let id = self.next_id();
        let req = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": "eth_subscribe",
            "params": params
        });
        ws.send(Message::Text(req.to_string())).await.map_err(ws_err)?;

        let reply = timeout(SUBSCRIBE_TIMEOUT, read_reply(ws, id))
            .await
            .map_err(|_| ChainError::Ws("subscribe timeout".into()))??;

        if let Some(err) = reply.get("error") {
            return Err(ChainError::Rpc(err.to_string()));
        }
        reply
            .get("result")
            .and_then(|r| r.as_str())
            .map(str::to_string)
            .ok_or_else(|| ChainError::Decode("no subscription id".into()))
    }

    async fn eth_unsubscribe(&self, ws: &mut WsStream, sub_id: &str) {
        let req = json!({
            "jsonrpc": "2.0",
            "id": self.next_id(),
            "method": "eth_unsubscribe",
            "params": [sub_id]
        });
        if let Err(e) = ws.send(Message::Text(req.to_string())).await {
            tracing::debug!(reason = %e, "eth_unsubscribe not sent");
        }
        let _ = ws.close(None).await;
        tracing::info!(%sub_id, "unsubscribed");
    }
}

/// Wait for the reply to request `id`, skipping anything else on the socket.
async fn read_reply(ws: &mut WsStream, id: u64) -> Result<Value, ChainError> {
    while let Some(msg) = ws.next().await {
        if let Message::Text(text) = msg.map_err(ws_err)? {
            let v: Value = serde_json::from_str(&text)
                .map_err(|e| ChainError::Decode(format!("subscribe reply: {e}")))?;
            if v.get("id").and_then(|i| i.as_u64()) == Some(id) {
                return Ok(v);
            }
        }
    }
    Err(ChainError::Ws("ws closed".into()))
}

enum SessionEnd {
    Shutdown,
    SinkClosed,
    Closed,
}

/// Turn one WebSocket text frame into an event. `Ok(None)` for frames that are not ours or
/// do not pass the client-side filter; undecodable payloads are skipped, not fatal.
fn decode_notification(
    text: &str,
    sub_id: &str,
    filter: SubscriptionFilter,
    client_filter: Option<&(Address, B256)>,
) -> Result<Option<ChainEvent>, ChainError> {
    let v: Value = serde_json::from_str(text).map_err(|e| ChainError::Decode(format!("ws message: {e}")))?;
    if v.get("method").and_then(|m| m.as_str()) != Some("eth_subscription") {
        return Ok(None);
    }
    let Some(params) = v.get("params") else {
        return Ok(None);
    };
    if params.get("subscription").and_then(|s| s.as_str()) != Some(sub_id) {
        return Ok(None);
    }
    let Some(result) = params.get("result") else {
        return Ok(None);
    };
    let decoded = match filter {
        SubscriptionFilter::NewHeads => decode_header(result).map(ChainEvent::Header),
        SubscriptionFilter::Logs { .. } => {
            if let Some((address, topic0)) = client_filter {
                if !log_matches(result, address, topic0) {
                    return Ok(None);
                }
            }
            decode_transfer_log(result).map(ChainEvent::TransferLog)
        }
    };
    match decoded {
        Ok(event) => Ok(Some(event)),
        Err(e) => {
            tracing::debug!(reason = %e, "notification skipped");
            Ok(None)
        }
    }
}

impl ChainSource for WsChainSource {
    async fn block_number(&self) -> Result<u64, ChainError> {
        let result = self.http_json_rpc("eth_blockNumber", json!([])).await?;
        let s = result
            .as_str()
            .ok_or_else(|| ChainError::Decode("blockNumber not string".into()))?;
        hex_quantity_to_u64(s).map_err(|e| ChainError::Decode(e.to_string()))
    }

    async fn block_by_number(&self, number: u64) -> Result<Option<BlockHeader>, ChainError> {
        let result = self
            .http_json_rpc("eth_getBlockByNumber", json!([format!("0x{:x}", number), false]))
            .await?;
        if result.is_null() {
            return Ok(None);
        }
        decode_header(&result)
            .map(Some)
            .map_err(|e| ChainError::Decode(format!("block {number}: {e}")))
    }

    async fn subscribe(
        &self,
        filter: SubscriptionFilter,
        sink: mpsc::Sender<ChainEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), ChainError> {
        let initial = Duration::from_secs(self.reconnection.initial_backoff_secs);
        let max = Duration::from_secs(self.reconnection.max_backoff_secs);
        let mut failures: u32 = 0;

        loop {
            if *shutdown.borrow() {
                return Ok(());
            }
            let mut delivered = 0u64;
            let last = match self.run_session(filter, &sink, &mut shutdown, &mut delivered).await {
                Ok(SessionEnd::Shutdown) | Ok(SessionEnd::SinkClosed) => return Ok(()),
                Ok(SessionEnd::Closed) => "socket closed by node".to_string(),
                Err(e) => e.to_string(),
            };
            if delivered > 0 {
                failures = 0;
            }
            failures += 1;
            if let Some(max_attempts) = self.reconnection.max_attempts {
                if failures >= max_attempts {
                    return Err(ChainError::Exhausted {
                        attempts: failures,
                        last,
                    });
                }
            }
            let delay = backoff_delay(initial, max, failures - 1, RECONNECT_JITTER);
            tracing::warn!(?filter, reason = %last, ?delay, "subscription dropped, reconnecting...");
            tokio::select! {
                _ = sleep(delay) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return Ok(());
                    }
                }
            }
        }
    }
}
