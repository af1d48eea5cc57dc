//! Startup backfill: walk backwards from the chain head until the window is full.
//!
//! One block at a time. Every fetched block goes through the watcher's command queue and
//! is acknowledged before the next target is chosen, so the window only ever changes on
//! the watcher task. A block that keeps failing is retried with exponential backoff and
//! then reported as [BackfillError::Exhausted]; blocks already appended stay.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep, timeout};

use crate::config::{backoff_delay, RetryConfig};
use crate::source::{ChainError, ChainSource};
use crate::summary::BlockSummary;
use crate::watcher::{read_window, BackfillCommand, SharedWindow};

#[derive(Debug, Error)]
pub enum BackfillError {
    #[error("chain head unavailable after {attempts} attempts: {source}")]
    Head { attempts: u32, source: ChainError },
    #[error("block {number} unavailable after {attempts} attempts: {source}")]
    Exhausted {
        number: u64,
        attempts: u32,
        source: ChainError,
    },
    #[error("watcher stopped before backfill finished")]
    Stopped,
}

/// Fill `window` up to its cap. Returns how many blocks were appended.
pub async fn run_backfill<S: ChainSource>(
    source: &S,
    window: &SharedWindow,
    commands: &mpsc::Sender<BackfillCommand>,
    retry: &RetryConfig,
) -> Result<usize, BackfillError> {
    if read_window(window).is_full() {
        return Ok(0);
    }
    let head = with_retry(retry, move || source.block_number())
        .await
        .map_err(|(attempts, source)| BackfillError::Head { attempts, source })?;
    tracing::debug!(head, "backfill starting");

    let mut appended = 0;
    while let Some(number) = next_target(window, head) {
        let summary = with_retry(retry, move || fetch_summary(source, number))
            .await
            .map_err(|(attempts, source)| BackfillError::Exhausted {
                number,
                attempts,
                source,
            })?;

        let (ack, accepted) = oneshot::channel();
        commands
            .send(BackfillCommand { summary, ack })
            .await
            .map_err(|_| BackfillError::Stopped)?;
        if accepted.await.map_err(|_| BackfillError::Stopped)? {
            appended += 1;
            tracing::debug!(number, "backfilled");
        }
    }
    Ok(appended)
}

fn next_target(window: &SharedWindow, head: u64) -> Option<u64> {
    read_window(window).next_backfill_target(head)
}

async fn fetch_summary<S: ChainSource>(source: &S, number: u64) -> Result<BlockSummary, ChainError> {
    let header = source
        .block_by_number(number)
        .await?
        .ok_or(ChainError::BlockNotFound(number))?;
    BlockSummary::from_header(&header)
        .ok_or_else(|| ChainError::Decode(format!("block {number} has no number")))
}

/// Run `op` up to `max_attempts` times (at least once), sleeping with backoff in between.
/// An attempt that outlives `attempt_timeout_ms` is dropped and counted as failed.
async fn with_retry<T, F, Fut>(retry: &RetryConfig, mut op: F) -> Result<T, (u32, ChainError)>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ChainError>>,
{
    let max_attempts = retry.max_attempts.max(1);
    let initial = Duration::from_millis(retry.initial_backoff_ms);
    let max = Duration::from_millis(retry.max_backoff_ms);
    let limit = Duration::from_millis(retry.attempt_timeout_ms);
    let mut attempt = 0;
    loop {
        let outcome = timeout(limit, op())
            .await
            .unwrap_or(Err(ChainError::Timeout(limit)));
        match outcome {
            Ok(v) => return Ok(v),
            Err(e) => {
                attempt += 1;
                if attempt >= max_attempts {
                    return Err((attempt, e));
                }
                let delay = backoff_delay(initial, max, attempt - 1, initial / 4);
                tracing::warn!(reason = %e, attempt, ?delay, "backfill fetch failed, retrying");
                sleep(delay).await;
            }
        }
    }
}
