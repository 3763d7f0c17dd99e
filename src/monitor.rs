//! Daemon wiring: log tail -> ban filter -> address extraction -> scan queue.

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::extract::{extract_address, is_ban_line};
use crate::queue::{Admission, ScanQueue, ScanRunner};
use crate::state::StateStore;
use crate::tail::LogTail;

/// Feed one log line to the queue. Returns `None` when the line is not a ban event
/// or carries no address.
pub async fn ingest_line<R: ScanRunner>(queue: &ScanQueue<R>, line: &str) -> Option<Admission> {
    if !is_ban_line(line) {
        return None;
    }
    let Some(address) = extract_address(line) else {
        debug!(line, "ban line without an address");
        return None;
    };
    Some(queue.enqueue(&address).await)
}

/// Follow `config.log_file` until `shutdown` resolves, then drain in-flight scans
/// for at most the configured grace period.
pub async fn run<R, S>(config: &Config, runner: R, shutdown: S) -> Result<()>
where
    R: ScanRunner,
    S: std::future::Future<Output = ()>,
{
    let queue = ScanQueue::start(runner, StateStore::new(&config.state_file), config.queue_config()).await;
    queue.resume_interrupted().await;

    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let tail = LogTail::open(&config.log_file).await;
    let handle = tail
        .spawn(
            move |line| {
                let _ = tx.send(line);
            },
            config.poll_interval(),
        )
        .with_context(|| format!("failed to watch {}", config.log_file.display()))?;

    let ingest_queue = queue.clone();
    let ingest = tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            ingest_line(&ingest_queue, &line).await;
        }
    });

    shutdown.await;
    info!("shutdown requested, no longer reading the log");
    handle.close().await;
    // The tail owned the sender, so this only drains lines already read.
    let _ = ingest.await;
    queue.close().await;

    let grace = config.shutdown_grace();
    if tokio::time::timeout(grace, queue.wait_idle()).await.is_err() {
        warn!(grace_secs = grace.as_secs(), "scans still running after grace period, exiting anyway");
    } else {
        info!("all running scans finished");
    }
    Ok(())
}
