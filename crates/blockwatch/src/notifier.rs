//! Fan-out of window changes to any number of observers.
//!
//! Backed by a `watch` channel: every observer sees the latest published value, a slow
//! observer skips straight to the newest, and a new observer only sees what is published
//! after it subscribed. Unsubscribing is dropping the [Subscription].

use std::sync::Arc;

use futures_util::Stream;
use tokio::sync::watch;

use crate::summary::BlockSummary;

/// Read-only view handed to observers.
pub type Snapshot = Arc<[BlockSummary]>;

#[derive(Debug)]
pub struct ChangeNotifier {
    tx: watch::Sender<Snapshot>,
}

impl ChangeNotifier {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(Snapshot::from(Vec::new()));
        Self { tx }
    }

    /// Publish a newest-first window. Observers receive it without its newest entry.
    pub fn notify(&self, sorted: &[BlockSummary]) {
        let confirmed: Snapshot = sorted.iter().skip(1).cloned().collect();
        // send_replace never fails; zero observers is fine.
        self.tx.send_replace(confirmed);
    }

    pub fn subscribe(&self) -> Subscription {
        Subscription {
            rx: self.tx.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for ChangeNotifier {
    fn default() -> Self {
        Self::new()
    }
}

/// One observer's view of the change feed.
#[derive(Debug)]
pub struct Subscription {
    rx: watch::Receiver<Snapshot>,
}

impl Subscription {
    /// Wait for the next published window. `None` once the watcher has shut down.
    pub async fn next(&mut self) -> Option<Snapshot> {
        self.rx.changed().await.ok()?;
        Some(Arc::clone(&self.rx.borrow_and_update()))
    }

    /// Turn into a `Stream` of windows.
    pub fn into_stream(self) -> impl Stream<Item = Snapshot> + Send + Unpin {
        Box::pin(futures_util::stream::unfold(self, |mut sub| async move {
            let snapshot = sub.next().await?;
            Some((snapshot, sub))
        }))
    }
}
