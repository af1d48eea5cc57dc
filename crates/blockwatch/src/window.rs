//! Bounded, deduplicated window of recent block summaries.
//!
//! Live order is insertion order: headers go to the front, backfilled blocks to the back,
//! and the back is evicted past `cap`. [Window::normalize] re-sorts newest first; the
//! watcher calls it on every persistence cycle. At most one entry per block number, where
//! numbers are compared by value (`"0100"` and `"100"` are the same block).

use std::cmp::Ordering;
use std::collections::VecDeque;

use crate::abi::{BlockHeader, TransferLog};
use crate::summary::{cmp_decimal, sort_descending, BlockSummary};

/// Default number of blocks kept.
pub const DEFAULT_CAP: usize = 11;

/// In-memory window. Plain data; the watcher owns the only mutable handle.
#[derive(Debug, Clone)]
pub struct Window {
    entries: VecDeque<BlockSummary>,
    cap: usize,
}

impl Window {
    pub fn new(cap: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(cap + 1),
            cap,
        }
    }

    /// Seed from a restored snapshot: newest first, duplicates dropped (first wins),
    /// truncated to `cap`.
    pub fn from_restored(mut blocks: Vec<BlockSummary>, cap: usize) -> Self {
        sort_descending(&mut blocks);
        let mut window = Self::new(cap);
        for block in blocks {
            if window.entries.len() >= cap {
                break;
            }
            if !window.contains(&block.number) {
                window.entries.push_back(block);
            }
        }
        window
    }

    pub fn cap(&self) -> usize {
        self.cap
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.cap
    }

    pub fn contains(&self, number: &str) -> bool {
        self.position(number).is_some()
    }

    #[cfg(test)]
    fn get(&self, number: &str) -> Option<&BlockSummary> {
        self.position(number).and_then(|pos| self.entries.get(pos))
    }

    /// Entries in live order (front = most recently inserted).
    pub fn entries(&self) -> impl Iterator<Item = &BlockSummary> {
        self.entries.iter()
    }

    /// New header: insert at the front, evict from the back down to `cap`.
    ///
    /// A header without a number is ignored. A header for a number already held replaces
    /// that entry (moved to the front, header fields overwritten, transfer count kept).
    /// Returns true if the window changed.
    pub fn apply_header(&mut self, header: &BlockHeader) -> bool {
        let Some(mut summary) = BlockSummary::from_header(header) else {
            tracing::trace!("header without number ignored");
            return false;
        };
        if let Some(pos) = self.position(&summary.number) {
            if let Some(previous) = self.entries.remove(pos) {
                tracing::debug!(number = %summary.number, "header re-delivered, replacing entry");
                summary.erc20_tx_count = previous.erc20_tx_count;
            }
        }
        self.entries.push_front(summary);
        while self.entries.len() > self.cap {
            if let Some(evicted) = self.entries.pop_back() {
                tracing::trace!(number = %evicted.number, "evicted");
            }
        }
        true
    }

    /// Transfer log: bump the count of the block it landed in.
    ///
    /// Logs for blocks not in the window (too old, or header not seen yet) and removed
    /// logs are dropped. Returns true if a count changed.
    pub fn apply_transfer_log(&mut self, log: &TransferLog) -> bool {
        if log.removed {
            return false;
        }
        let Some(number) = log.block_number.as_deref() else {
            return false;
        };
        match self.entries.iter_mut().find(|b| same_number(&b.number, number)) {
            Some(block) => {
                block.erc20_tx_count += 1;
                true
            }
            None => {
                tracing::trace!(number, "transfer log for block outside window dropped");
                false
            }
        }
    }

    /// Backfilled block: append at the back. Rejected when full or already present.
    pub fn append_backfilled(&mut self, summary: BlockSummary) -> bool {
        if self.is_full() || self.contains(&summary.number) {
            return false;
        }
        self.entries.push_back(summary);
        true
    }

    /// Next block backfill should fetch: one below the oldest (lowest) block held, or one
    /// below `head` when empty. `None` when full or when that would go below genesis.
    ///
    /// Anchoring on the lowest number rather than the back entry means a rejected append
    /// (block already present) still moves the next target down.
    pub fn next_backfill_target(&self, head: u64) -> Option<u64> {
        if self.is_full() {
            return None;
        }
        let anchor = self
            .entries
            .iter()
            .filter_map(BlockSummary::number_u64)
            .min()
            .unwrap_or(head);
        anchor.checked_sub(1)
    }

    /// Everything except the newest (provisional) entry.
    pub fn confirmed(&self) -> Vec<BlockSummary> {
        self.entries.iter().skip(1).cloned().collect()
    }

    /// Re-sort live order newest first.
    pub fn normalize(&mut self) {
        sort_descending(self.entries.make_contiguous());
    }

    /// Copy of the entries, newest first.
    pub fn sorted(&self) -> Vec<BlockSummary> {
        let mut blocks: Vec<_> = self.entries.iter().cloned().collect();
        sort_descending(&mut blocks);
        blocks
    }

    fn position(&self, number: &str) -> Option<usize> {
        self.entries.iter().position(|b| same_number(&b.number, number))
    }
}

fn same_number(a: &str, b: &str) -> bool {
    cmp_decimal(a, b) == Ordering::Equal
}

impl Default for Window {
    fn default() -> Self {
        Self::new(DEFAULT_CAP)
    }
}
