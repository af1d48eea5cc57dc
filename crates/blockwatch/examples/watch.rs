//! Example: follow a node and print the confirmed window on every change.
//!
//! Usage: BLOCKWATCH_WS_URL=wss://... cargo run -p blockwatch --example watch
//!
//! Optional: BLOCKWATCH_HTTP_URL, BLOCKWATCH_ERC20_ADDRESS, BLOCKWATCH_SNAPSHOT_PATH,
//! BLOCKWATCH_WINDOW_CAP. Ctrl-C flushes the snapshot and exits.

use anyhow::Context;
use blockwatch::{BlockWatcher, WatcherConfig};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("blockwatch=info")),
        )
        .init();

    let config = WatcherConfig::from_env().context("load config")?;
    tracing::info!(
        ws_url = %config.ws_url,
        token = %config.token_address,
        snapshot = %config.snapshot_path.display(),
        "starting"
    );
    let watcher = BlockWatcher::connect(&config).context("connect")?;
    let mut updates = watcher.on_change();

    loop {
        tokio::select! {
            update = updates.next() => {
                let Some(blocks) = update else { break };
                for b in blocks.iter() {
                    println!(
                        "block={} transfers={} base_fee={} gas_used={}/{}",
                        b.number, b.erc20_tx_count, b.base_fee, b.gas_used, b.gas_limit
                    );
                }
                println!("--");
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    watcher.shutdown().await;
    Ok(())
}
