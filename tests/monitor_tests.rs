use std::fs::OpenOptions;
use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ban_scan_rs::config::Config;
use ban_scan_rs::monitor::{self, ingest_line};
use ban_scan_rs::queue::{Admission, QueueConfig, ScanQueue, ScanRunner};
use ban_scan_rs::state::StateStore;
use tokio::sync::oneshot;

#[derive(Clone, Default)]
struct Recorder {
    runs: Arc<Mutex<Vec<String>>>,
}

impl ScanRunner for Recorder {
    async fn run(&self, address: String) -> anyhow::Result<()> {
        self.runs.lock().unwrap().push(address);
        Ok(())
    }
}

#[tokio::test]
async fn only_ban_lines_reach_the_queue() {
    let dir = tempfile::tempdir().unwrap();
    let recorder = Recorder::default();
    let queue = ScanQueue::start(
        recorder.clone(),
        StateStore::new(dir.path().join("state.json")),
        QueueConfig {
            concurrency: 2,
            ttl: Duration::from_secs(3600),
            failure_cooldown: Duration::from_secs(60),
        },
    )
    .await;

    let found = "2025-10-12 09:59:59 fail2ban.filter [1]: INFO [sshd] Found 203.0.113.7";
    let ban = "2025-10-12 10:00:00 fail2ban.actions [1]: NOTICE [sshd] Ban 203.0.113.7";
    let again = "2025-10-12 10:00:01 fail2ban.actions [1]: NOTICE [sshd] Ban 203.0.113.7";

    assert_eq!(ingest_line(&queue, found).await, None);
    assert_eq!(ingest_line(&queue, "NOTICE Ban nobody").await, None);
    assert_eq!(ingest_line(&queue, ban).await, Some(Admission::Queued));
    let second = ingest_line(&queue, again).await;
    assert!(matches!(second, Some(Admission::Duplicate | Admission::CoolingDown)));

    tokio::time::timeout(Duration::from_secs(5), queue.wait_idle()).await.unwrap();
    assert_eq!(*recorder.runs.lock().unwrap(), vec!["203.0.113.7"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn daemon_scans_appended_ban_lines() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("fail2ban.log");
    std::fs::write(&log, "2025-10-12 09:00:00 fail2ban.actions [1]: NOTICE [sshd] Ban 192.0.2.200\n").unwrap();

    let config = Config {
        log_file: log.clone(),
        state_file: dir.path().join("state.json"),
        concurrency: Some(1),
        poll_interval_ms: 50,
        shutdown_grace_secs: 5,
        ..Config::default()
    };
    let recorder = Recorder::default();
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let daemon = {
        let recorder = recorder.clone();
        tokio::spawn(async move {
            monitor::run(&config, recorder, async {
                let _ = stop_rx.await;
            })
            .await
        })
    };

    // Give the tail a moment to take its starting offset.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let mut f = OpenOptions::new().append(true).open(&log).unwrap();
    f.write_all(b"2025-10-12 10:00:00 fail2ban.actions [1]: NOTICE [sshd] Ban 203.0.113.7\n").unwrap();

    tokio::time::timeout(Duration::from_secs(5), async {
        while recorder.runs.lock().unwrap().is_empty() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("scan dispatched");

    stop_tx.send(()).unwrap();
    daemon.await.unwrap().unwrap();
    // History present before startup is not replayed.
    assert_eq!(*recorder.runs.lock().unwrap(), vec!["203.0.113.7"]);
}
