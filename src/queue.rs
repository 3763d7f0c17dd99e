//! Deduplicating, concurrency-bounded scan queue.
//!
//! All bookkeeping goes through one mutex-guarded [`Inner`]; every admission and
//! every completion is a single critical section followed by one state save.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

use crate::state::{QueueState, StateStore};

/// Work performed for one admitted address.
pub trait ScanRunner: Send + Sync + 'static {
    fn run(&self, address: String) -> impl Future<Output = anyhow::Result<()>> + Send;
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub concurrency: usize,
    /// Quiet period after a finished job.
    pub ttl: Duration,
    /// Quiet period after an abandoned job.
    pub failure_cooldown: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            ttl: Duration::from_secs(3600),
            failure_cooldown: Duration::from_secs(300),
        }
    }
}

pub fn default_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Result of [`ScanQueue::enqueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Queued,
    /// Already queued or running in this process.
    Duplicate,
    /// Retry-after deadline not reached yet.
    CoolingDown,
    /// Queue is shutting down.
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressState {
    Idle,
    Queued,
    Running,
    Cooldown { until: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Live {
    Queued,
    Running,
}

#[derive(Debug)]
struct Inner {
    persisted: QueueState,
    live: HashMap<String, Live>,
    pending: VecDeque<String>,
    running: usize,
    closed: bool,
}

impl Inner {
    fn outstanding(&self) -> usize {
        if self.closed {
            self.running
        } else {
            self.running + self.pending.len()
        }
    }
}

struct Shared<R> {
    runner: Arc<R>,
    store: StateStore,
    config: QueueConfig,
    inner: Mutex<Inner>,
    outstanding: watch::Sender<usize>,
}

/// Cheap to clone; all clones share one queue.
pub struct ScanQueue<R> {
    shared: Arc<Shared<R>>,
}

impl<R> Clone for ScanQueue<R> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<R: ScanRunner> ScanQueue<R> {
    /// Build a queue over the state found in `store`.
    pub async fn start(runner: R, store: StateStore, mut config: QueueConfig) -> Self {
        config.concurrency = config.concurrency.max(1);
        let mut persisted = store.load().await;
        persisted.prune_expired(epoch_now());
        info!(
            state = %store.path().display(),
            in_flight = persisted.in_flight.len(),
            cooling_down = persisted.retry_after.len(),
            concurrency = config.concurrency,
            "scan queue ready"
        );
        let (outstanding, _) = watch::channel(0);
        Self {
            shared: Arc::new(Shared {
                runner: Arc::new(runner),
                store,
                config,
                inner: Mutex::new(Inner {
                    persisted,
                    live: HashMap::new(),
                    pending: VecDeque::new(),
                    running: 0,
                    closed: false,
                }),
                outstanding,
            }),
        }
    }

    /// Admit `address` unless it is already live or still cooling down.
    pub async fn enqueue(&self, address: &str) -> Admission {
        let now = epoch_now();
        let mut inner = self.shared.inner.lock().await;
        if inner.closed {
            return Admission::Closed;
        }
        inner.persisted.prune_expired(now);
        if inner.live.contains_key(address) {
            debug!(ip = address, "already queued or running");
            return Admission::Duplicate;
        }
        let next = inner.persisted.retry_after(address);
        if next > now {
            debug!(ip = address, retry_after = next, "still cooling down");
            return Admission::CoolingDown;
        }
        // Leftover from a previous process whose cooldown is over.
        inner.persisted.clear_in_flight(address);
        inner.persisted.retry_after.remove(address);

        inner.persisted.mark_in_flight(address);
        inner.live.insert(address.to_string(), Live::Queued);
        inner.pending.push_back(address.to_string());
        self.persist(&inner).await;
        info!(ip = address, pending = inner.pending.len(), "scan queued");
        self.dispatch(&mut inner);
        Admission::Queued
    }

    /// Re-admit addresses a previous process accepted but never finished.
    pub async fn resume_interrupted(&self) -> usize {
        let leftovers: Vec<String> = {
            let inner = self.shared.inner.lock().await;
            inner
                .persisted
                .in_flight
                .iter()
                .filter(|a| !inner.live.contains_key(a.as_str()))
                .cloned()
                .collect()
        };
        let mut resumed = 0;
        for address in leftovers {
            if self.enqueue(&address).await == Admission::Queued {
                resumed += 1;
            }
        }
        if resumed > 0 {
            info!(resumed, "resumed interrupted scans");
        }
        resumed
    }

    pub async fn address_state(&self, address: &str) -> AddressState {
        let inner = self.shared.inner.lock().await;
        match inner.live.get(address) {
            Some(Live::Queued) => AddressState::Queued,
            Some(Live::Running) => AddressState::Running,
            None => {
                let until = inner.persisted.retry_after(address);
                if until > epoch_now() {
                    AddressState::Cooldown { until }
                } else {
                    AddressState::Idle
                }
            }
        }
    }

    /// Snapshot of the bookkeeping as it is persisted.
    pub async fn snapshot(&self) -> QueueState {
        self.shared.inner.lock().await.persisted.clone()
    }

    /// Stop admitting and dispatching. Pending addresses stay persisted as in flight.
    pub async fn close(&self) {
        let mut inner = self.shared.inner.lock().await;
        inner.closed = true;
        info!(
            running = inner.running,
            deferred = inner.pending.len(),
            "scan queue closed"
        );
        self.shared.outstanding.send_replace(inner.outstanding());
    }

    /// Resolve once nothing is queued or running (after `close`, once nothing is running).
    pub async fn wait_idle(&self) {
        let mut rx = self.shared.outstanding.subscribe();
        let _ = rx.wait_for(|n| *n == 0).await;
    }

    fn dispatch(&self, inner: &mut Inner) {
        while !inner.closed && inner.running < self.shared.config.concurrency {
            let Some(address) = inner.pending.pop_front() else {
                break;
            };
            inner.running += 1;
            inner.live.insert(address.clone(), Live::Running);
            let queue = self.clone();
            tokio::spawn(async move { queue.execute(address).await });
        }
        self.shared.outstanding.send_replace(inner.outstanding());
    }

    async fn execute(&self, address: String) {
        let runner = self.shared.runner.clone();
        let job = address.clone();
        let ok = match tokio::spawn(async move { runner.run(job).await }).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                error!(ip = %address, "scan abandoned: {e:#}");
                false
            }
            Err(e) => {
                error!(ip = %address, "scan task failed: {e}");
                false
            }
        };
        self.complete(&address, ok).await;
    }

    async fn complete(&self, address: &str, ok: bool) {
        let cooldown = if ok {
            self.shared.config.ttl
        } else {
            self.shared.config.failure_cooldown
        };
        let now = epoch_now();
        let until = now + cooldown.as_secs();
        let mut inner = self.shared.inner.lock().await;
        inner.persisted.prune_expired(now);
        inner
            .persisted
            .retry_after
            .insert(address.to_string(), until);
        inner.persisted.clear_in_flight(address);
        inner.live.remove(address);
        inner.running = inner.running.saturating_sub(1);
        self.persist(&inner).await;
        debug!(ip = address, retry_after = until, "scan slot released");
        self.dispatch(&mut inner);
    }

    async fn persist(&self, inner: &Inner) {
        if let Err(e) = self.shared.store.save(&inner.persisted).await {
            warn!("queue state not persisted, continuing in memory: {e}");
        }
    }
}

fn epoch_now() -> u64 {
    time::OffsetDateTime::now_utc().unix_timestamp().max(0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_concurrency_is_positive() {
        assert!(default_concurrency() >= 1);
    }

    #[test]
    fn outstanding_ignores_pending_once_closed() {
        let mut inner = Inner {
            persisted: QueueState::default(),
            live: HashMap::new(),
            pending: VecDeque::from(vec!["a".to_string(), "b".to_string()]),
            running: 1,
            closed: false,
        };
        assert_eq!(inner.outstanding(), 3);
        inner.closed = true;
        assert_eq!(inner.outstanding(), 1);
    }
}
