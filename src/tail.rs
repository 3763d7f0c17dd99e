//! Follow an append-only log across rotation and truncation.
//!
//! [`LogTail::open`] positions the cursor at the current end of file, [`LogTail::pump`]
//! performs one read pass, and [`LogTail::spawn`] drives passes from filesystem
//! notifications plus a polling tick. Passes are serialized by running in a single task.

use std::fs::Metadata;
use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A partial line longer than this without a newline is dropped.
pub const MAX_PARTIAL_LINE: usize = 64 * 1024;

/// Identity of the file behind a path; changes when the path is replaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileIdentity {
    dev: u64,
    ino: u64,
}

impl FileIdentity {
    #[cfg(unix)]
    pub fn of(meta: &Metadata) -> Self {
        use std::os::unix::fs::MetadataExt;
        Self {
            dev: meta.dev(),
            ino: meta.ino(),
        }
    }

    #[cfg(not(unix))]
    pub fn of(meta: &Metadata) -> Self {
        let created = meta
            .created()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        Self { dev: 0, ino: created }
    }
}

/// How far a watched file has been consumed.
#[derive(Debug, Default)]
pub struct TailCursor {
    pub offset: u64,
    pub identity: Option<FileIdentity>,
    partial: Vec<u8>,
    /// Skipping the tail of an oversized line up to its newline.
    discarding: bool,
}

impl TailCursor {
    fn restart(&mut self, identity: Option<FileIdentity>) {
        self.offset = 0;
        self.identity = identity;
        self.partial.clear();
        self.discarding = false;
    }

    /// Number of buffered bytes not yet terminated by a newline.
    pub fn pending_bytes(&self) -> usize {
        self.partial.len()
    }
}

#[derive(Debug)]
pub struct LogTail {
    path: PathBuf,
    cursor: TailCursor,
}

impl LogTail {
    /// Start at the current end of `path`; history is not replayed.
    pub async fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let cursor = match tokio::fs::metadata(&path).await {
            Ok(meta) => TailCursor {
                offset: meta.len(),
                identity: Some(FileIdentity::of(&meta)),
                partial: Vec::new(),
                discarding: false,
            },
            Err(e) => {
                debug!(path = %path.display(), "log not present yet: {e}");
                TailCursor::default()
            }
        };
        Self { path, cursor }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn cursor(&self) -> &TailCursor {
        &self.cursor
    }

    /// Read whatever was appended since the last pass and hand each complete,
    /// non-empty, trimmed line to `on_line`. Returns the number of lines delivered.
    pub async fn pump<F>(&mut self, on_line: &mut F) -> io::Result<usize>
    where
        F: FnMut(String),
    {
        let mut file = match tokio::fs::File::open(&self.path).await {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                if self.cursor.identity.is_some() {
                    debug!(path = %self.path.display(), "log disappeared, waiting for it");
                }
                self.cursor.restart(None);
                return Ok(0);
            }
            Err(e) => return Err(e),
        };
        let meta = file.metadata().await?;
        let identity = FileIdentity::of(&meta);

        match self.cursor.identity {
            Some(known) if known != identity => {
                info!(path = %self.path.display(), "log rotated, reading new file from the start");
                self.cursor.restart(Some(identity));
            }
            None => self.cursor.restart(Some(identity)),
            Some(_) => {}
        }

        let size = meta.len();
        if size < self.cursor.offset {
            info!(
                path = %self.path.display(),
                size,
                offset = self.cursor.offset,
                "log truncated, reading from the start"
            );
            self.cursor.restart(Some(identity));
        }
        if size == self.cursor.offset {
            return Ok(0);
        }

        file.seek(SeekFrom::Start(self.cursor.offset)).await?;
        let mut chunk = Vec::new();
        (&mut file)
            .take(size - self.cursor.offset)
            .read_to_end(&mut chunk)
            .await?;
        self.cursor.offset += chunk.len() as u64;
        self.cursor.partial.extend_from_slice(&chunk);

        Ok(self.drain_lines(on_line))
    }

    fn drain_lines<F>(&mut self, on_line: &mut F) -> usize
    where
        F: FnMut(String),
    {
        let mut delivered = 0;
        if self.cursor.discarding {
            match self.cursor.partial.iter().position(|b| *b == b'\n') {
                Some(pos) => {
                    self.cursor.partial.drain(..=pos);
                    self.cursor.discarding = false;
                }
                None => {
                    self.cursor.partial.clear();
                    return 0;
                }
            }
        }
        while let Some(pos) = self.cursor.partial.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.cursor.partial.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&raw);
            let line = text.trim();
            if !line.is_empty() {
                on_line(line.to_string());
                delivered += 1;
            }
        }
        if self.cursor.partial.len() > MAX_PARTIAL_LINE {
            warn!(
                path = %self.path.display(),
                bytes = self.cursor.partial.len(),
                "dropping oversized partial line"
            );
            self.cursor.partial.clear();
            self.cursor.discarding = true;
        }
        delivered
    }

    /// Follow the file in a background task until the returned handle is closed.
    ///
    /// The parent directory is watched so that a rotated-in file is noticed.
    /// Notifications that arrive during a pass are coalesced into one more pass.
    pub fn spawn<F>(mut self, mut on_line: F, poll_interval: Duration) -> notify::Result<TailHandle>
    where
        F: FnMut(String) + Send + 'static,
    {
        let wake = Arc::new(Notify::new());
        let watch_dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let file_name = self.path.file_name().map(|n| n.to_os_string());

        let notifier = wake.clone();
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    let relevant = event.paths.is_empty()
                        || event
                            .paths
                            .iter()
                            .any(|p| p.file_name().map(|n| n.to_os_string()) == file_name);
                    if relevant {
                        notifier.notify_one();
                    }
                }
                Err(e) => debug!("watch error: {e}"),
            },
            Config::default(),
        )?;
        watcher.watch(&watch_dir, RecursiveMode::NonRecursive)?;
        info!(path = %self.path.display(), "tailing log");

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let join = tokio::spawn(async move {
            let _watcher = watcher;
            let mut ticker = tokio::time::interval(poll_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = wake.notified() => {}
                    _ = ticker.tick() => {}
                }
                if let Err(e) = self.pump(&mut on_line).await {
                    debug!(path = %self.path.display(), "read pass failed, retrying later: {e}");
                }
            }
            debug!(path = %self.path.display(), "tail stopped");
        });

        Ok(TailHandle { cancel, join })
    }
}

/// Running tail started by [`LogTail::spawn`].
#[derive(Debug)]
pub struct TailHandle {
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

impl TailHandle {
    /// Stop following the file and wait for the current pass to finish.
    pub async fn close(self) {
        self.cancel.cancel();
        let _ = self.join.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn partial_lines_wait_for_newline() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log");
        std::fs::write(&path, b"").unwrap();
        let mut tail = LogTail::open(&path).await;

        let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(b"first li").unwrap();
        let mut lines = Vec::new();
        assert_eq!(tail.pump(&mut |l| lines.push(l)).await.unwrap(), 0);
        assert_eq!(tail.cursor().pending_bytes(), 8);

        f.write_all(b"ne\n  \nsecond\n").unwrap();
        tail.pump(&mut |l| lines.push(l)).await.unwrap();
        assert_eq!(lines, vec!["first line", "second"]);
        assert_eq!(tail.cursor().pending_bytes(), 0);
    }

    #[tokio::test]
    async fn oversized_partial_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log");
        std::fs::write(&path, b"").unwrap();
        let mut tail = LogTail::open(&path).await;
        std::fs::write(&path, vec![b'x'; MAX_PARTIAL_LINE + 1]).unwrap();
        let mut lines = Vec::new();
        tail.pump(&mut |l| lines.push(l)).await.unwrap();
        assert!(lines.is_empty());
        assert_eq!(tail.cursor().pending_bytes(), 0);

        // The rest of the dropped line must not surface as a record of its own.
        let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(b"xxxx Ban 203.0.113.9").unwrap();
        tail.pump(&mut |l| lines.push(l)).await.unwrap();
        f.write_all(b" still the same line\nBan 198.51.100.4\n").unwrap();
        tail.pump(&mut |l| lines.push(l)).await.unwrap();
        assert_eq!(lines, vec!["Ban 198.51.100.4"]);
    }
}
