//! Read side of the watcher, safe to clone into request handlers.

use std::sync::Arc;

use crate::notifier::{ChangeNotifier, Subscription};
use crate::summary::BlockSummary;
use crate::watcher::{read_window, SharedWindow};

#[derive(Debug, Clone)]
pub struct BlocksFeed {
    window: SharedWindow,
    notifier: Arc<ChangeNotifier>,
}

impl BlocksFeed {
    pub(crate) fn new(window: SharedWindow, notifier: Arc<ChangeNotifier>) -> Self {
        Self { window, notifier }
    }

    /// Window without its newest (possibly still filling) block, in the window's current
    /// order. Never waits on the watcher.
    pub fn get_current(&self) -> Vec<BlockSummary> {
        read_window(&self.window).confirmed()
    }

    /// Full window including the newest block, newest first.
    pub fn live(&self) -> Vec<BlockSummary> {
        read_window(&self.window).sorted()
    }

    pub fn on_change(&self) -> Subscription {
        self.notifier.subscribe()
    }
}
