//! BlockWatcher: owns the window and is its only writer.
//!
//! Header and log subscriptions push [ChainEvent]s into one queue, backfill pushes
//! [BackfillCommand]s into another, and a single task applies both to the window in arrival
//! order. Every change re-arms the debounce; when it fires the window is re-sorted, handed to
//! the snapshot writer, and published to observers. Readers never wait on that task.

use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};

use crate::backfill::{run_backfill, BackfillError};
use crate::config::WatcherConfig;
use crate::debounce::Debouncer;
use crate::feed::BlocksFeed;
use crate::notifier::{ChangeNotifier, Snapshot, Subscription};
use crate::rpc::WsChainSource;
use crate::snapshot::{restore, JsonFileStore, SnapshotStore, SnapshotWriter};
use crate::source::{ChainError, ChainEvent, ChainSource, SubscriptionFilter};
use crate::summary::BlockSummary;
use crate::window::Window;

/// Window shared between the watcher task (writes) and readers.
pub type SharedWindow = Arc<RwLock<Window>>;

const CHAIN_QUEUE: usize = 1024;
const BACKFILL_QUEUE: usize = 1;

pub(crate) fn read_window(window: &SharedWindow) -> RwLockReadGuard<'_, Window> {
    window.read().unwrap_or_else(PoisonError::into_inner)
}

fn write_window(window: &SharedWindow) -> RwLockWriteGuard<'_, Window> {
    window.write().unwrap_or_else(PoisonError::into_inner)
}

/// A backfilled block waiting to be appended; `ack` reports whether it was.
#[derive(Debug)]
pub struct BackfillCommand {
    pub summary: BlockSummary,
    pub ack: oneshot::Sender<bool>,
}

/// Where backfill stands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackfillStatus {
    Running,
    Complete { appended: usize },
    GaveUp { reason: String },
    /// The watcher shut down first.
    Stopped,
}

impl BackfillStatus {
    pub fn is_running(&self) -> bool {
        matches!(self, BackfillStatus::Running)
    }
}

/// Running watcher. Dropping it signals every task to stop; [BlockWatcher::shutdown] also
/// waits for them and for the last snapshot write.
pub struct BlockWatcher {
    feed: BlocksFeed,
    shutdown_tx: watch::Sender<bool>,
    backfill_status: watch::Receiver<BackfillStatus>,
    actor: Option<JoinHandle<()>>,
    subscriptions: Vec<JoinHandle<()>>,
    backfill: Option<JoinHandle<()>>,
}

impl BlockWatcher {
    /// Connect to the node in `config` and persist to `config.snapshot_path`.
    pub fn connect(config: &WatcherConfig) -> Result<Self, ChainError> {
        let source = WsChainSource::new(
            config.ws_url.clone(),
            config.http_url.clone(),
            config.reconnection.clone(),
        )?;
        let store = JsonFileStore::new(config.snapshot_path.clone());
        Ok(Self::start(config, Arc::new(source), Arc::new(store)))
    }

    /// Restore the window from `store`, then start the watcher task, both subscriptions and
    /// backfill on the current runtime.
    pub fn start<S: ChainSource>(
        config: &WatcherConfig,
        source: Arc<S>,
        store: Arc<dyn SnapshotStore>,
    ) -> Self {
        let window = Window::from_restored(restore(store.as_ref()), config.window_cap);
        let window: SharedWindow = Arc::new(RwLock::new(window));
        let notifier = Arc::new(ChangeNotifier::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (chain_tx, chain_rx) = mpsc::channel(CHAIN_QUEUE);
        let (backfill_tx, backfill_rx) = mpsc::channel(BACKFILL_QUEUE);

        let actor = tokio::spawn(
            Actor {
                window: Arc::clone(&window),
                notifier: Arc::clone(&notifier),
                writer: SnapshotWriter::spawn(store),
                debouncer: Debouncer::new(config.debounce),
            }
            .run(chain_rx, backfill_rx, shutdown_rx.clone()),
        );

        let filters = [
            SubscriptionFilter::NewHeads,
            SubscriptionFilter::Logs {
                address: config.token_address,
                topic0: config.transfer_topic,
            },
        ];
        let subscriptions = filters
            .into_iter()
            .map(|filter| {
                let source = Arc::clone(&source);
                let sink = chain_tx.clone();
                let shutdown = shutdown_rx.clone();
                tokio::spawn(async move {
                    match source.subscribe(filter, sink, shutdown).await {
                        Ok(()) => tracing::info!(?filter, "subscription ended"),
                        Err(e) => tracing::error!(?filter, reason = %e, "subscription failed"),
                    }
                })
            })
            .collect();
        drop(chain_tx);

        let (status_tx, backfill_status) = watch::channel(BackfillStatus::Running);
        let backfill = {
            let window = Arc::clone(&window);
            let retry = config.backfill_retry.clone();
            tokio::spawn(async move {
                let status = match run_backfill(source.as_ref(), &window, &backfill_tx, &retry).await {
                    Ok(appended) => {
                        tracing::info!(appended, "backfill complete");
                        BackfillStatus::Complete { appended }
                    }
                    Err(BackfillError::Stopped) => BackfillStatus::Stopped,
                    Err(e) => {
                        tracing::error!(reason = %e, "backfill gave up");
                        BackfillStatus::GaveUp {
                            reason: e.to_string(),
                        }
                    }
                };
                status_tx.send_replace(status);
            })
        };

        Self {
            feed: BlocksFeed::new(window, notifier),
            shutdown_tx,
            backfill_status,
            actor: Some(actor),
            subscriptions,
            backfill: Some(backfill),
        }
    }

    /// Confirmed window (newest entry excluded).
    pub fn get_current(&self) -> Vec<BlockSummary> {
        self.feed.get_current()
    }

    /// Change feed; see [ChangeNotifier].
    pub fn on_change(&self) -> Subscription {
        self.feed.on_change()
    }

    /// Cloneable read/subscribe handle for consumers.
    pub fn feed(&self) -> BlocksFeed {
        self.feed.clone()
    }

    pub fn backfill_status(&self) -> BackfillStatus {
        self.backfill_status.borrow().clone()
    }

    /// Wait until backfill has finished one way or another.
    pub async fn wait_backfilled(&self) -> BackfillStatus {
        let mut rx = self.backfill_status.clone();
        loop {
            let status = rx.borrow_and_update().clone();
            if !status.is_running() {
                return status;
            }
            if rx.changed().await.is_err() {
                return BackfillStatus::Stopped;
            }
        }
    }

    /// Unsubscribe both streams, stop backfill, flush a pending snapshot and wait for the
    /// final write.
    pub async fn shutdown(mut self) {
        self.shutdown_tx.send_replace(true);
        if let Some(backfill) = self.backfill.take() {
            backfill.abort();
            let _ = backfill.await;
        }
        for sub in self.subscriptions.drain(..) {
            if let Err(e) = sub.await {
                tracing::warn!(reason = %e, "subscription task failed");
            }
        }
        if let Some(actor) = self.actor.take() {
            if let Err(e) = actor.await {
                tracing::warn!(reason = %e, "watcher task failed");
            }
        }
        tracing::info!("watcher stopped");
    }
}

impl Drop for BlockWatcher {
    fn drop(&mut self) {
        self.shutdown_tx.send_replace(true);
        if let Some(backfill) = self.backfill.take() {
            backfill.abort();
        }
    }
}

struct Actor {
    window: SharedWindow,
    notifier: Arc<ChangeNotifier>,
    writer: SnapshotWriter,
    debouncer: Debouncer,
}

impl Actor {
    async fn run(
        mut self,
        mut chain_rx: mpsc::Receiver<ChainEvent>,
        mut backfill_rx: mpsc::Receiver<BackfillCommand>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            let deadline = self.debouncer.deadline();
            // Queued events are applied before a due flush or the shutdown signal.
            tokio::select! {
                biased;
                Some(event) = chain_rx.recv() => {
                    if self.apply_chain_event(&event) {
                        self.debouncer.trigger(Instant::now());
                    }
                }
                Some(BackfillCommand { summary, ack }) = backfill_rx.recv() => {
                    let appended = write_window(&self.window).append_backfilled(summary);
                    if appended {
                        self.debouncer.trigger(Instant::now());
                    }
                    let _ = ack.send(appended);
                }
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    if self.debouncer.fire_if_due(Instant::now()) {
                        self.flush();
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                else => break,
            }
        }
        if self.debouncer.take_pending() {
            self.flush();
        }
        if let Err(e) = self.writer.close().await {
            tracing::warn!(reason = %e, "final snapshot write failed");
        }
    }

    fn apply_chain_event(&self, event: &ChainEvent) -> bool {
        let mut window = write_window(&self.window);
        match event {
            ChainEvent::Header(header) => window.apply_header(header),
            ChainEvent::TransferLog(log) => window.apply_transfer_log(log),
        }
    }

    /// Re-sort the live window, then persist and publish the sorted copy.
    fn flush(&self) {
        let sorted: Snapshot = {
            let mut window = write_window(&self.window);
            window.normalize();
            window.entries().cloned().collect()
        };
        tracing::debug!(count = sorted.len(), "window flushed");
        self.writer.submit(Arc::clone(&sorted));
        self.notifier.notify(&sorted);
    }
}
