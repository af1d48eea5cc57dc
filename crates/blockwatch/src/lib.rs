//! Recent-block window for an ERC20 dashboard.
//!
//! - **BlockWatcher**: follows new block headers and the token's Transfer logs over a
//!   WebSocket subscription, backfills the window from HTTP at startup, and keeps at most
//!   `window_cap` blocks with a per-block Transfer count.
//! - **Snapshots**: the window is restored from a JSON file at startup and rewritten, debounced,
//!   after bursts of changes.
//! - **BlocksFeed**: non-blocking reads of the confirmed window (newest block excluded) plus a
//!   change feed that fires on the same debounce.

pub mod abi;
pub mod backfill;
pub mod config;
pub mod debounce;
pub mod feed;
pub mod notifier;
pub mod rpc;
pub mod snapshot;
pub mod source;
pub mod summary;
pub mod watcher;
pub mod window;

pub use abi::{BlockHeader, TransferLog, TRANSFER_TOPIC0};
pub use backfill::BackfillError;
pub use config::{ConfigError, ReconnectionConfig, RetryConfig, WatcherConfig};
pub use feed::BlocksFeed;
pub use notifier::{ChangeNotifier, Snapshot, Subscription};
pub use rpc::WsChainSource;
pub use snapshot::{JsonFileStore, SnapshotError, SnapshotStore};
pub use source::{ChainError, ChainEvent, ChainSource, SubscriptionFilter};
pub use summary::BlockSummary;
pub use watcher::{BackfillStatus, BlockWatcher};
pub use window::Window;
