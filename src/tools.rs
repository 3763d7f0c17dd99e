//! External tool plumbing: lookup, privilege checks and bounded process capture.

use std::ffi::OsStr;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::Command;
use tracing::debug;

use crate::error::{Error, Result};

const CHUNK: usize = 8 * 1024;

/// Limits applied to one external invocation.
#[derive(Debug, Clone, Copy)]
pub struct CaptureLimits {
    pub max_bytes: u64,
    pub timeout: Duration,
}

impl Default for CaptureLimits {
    fn default() -> Self {
        Self {
            max_bytes: 16 * 1024 * 1024,
            timeout: Duration::from_secs(900),
        }
    }
}

/// What came back from a finished (or killed) child process.
#[derive(Debug, Default)]
pub struct ExternalRun {
    /// `None` when the child was killed on timeout.
    pub status: Option<ExitStatus>,
    pub stdout_bytes: u64,
    pub stderr: Vec<u8>,
    pub truncated: bool,
    pub timed_out: bool,
}

impl ExternalRun {
    pub fn success(&self) -> bool {
        !self.timed_out && self.status.is_some_and(|s| s.success())
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.status.and_then(|s| s.code())
    }
}

/// Run `program args...`, streaming stdout into `sink` and buffering stderr.
///
/// Both streams are capped at `limits.max_bytes`; whatever exceeds the cap is read
/// and thrown away so the child never blocks on a full pipe. The child is killed
/// once `limits.timeout` elapses.
pub async fn run_external<W>(
    program: impl AsRef<OsStr>,
    args: &[String],
    sink: &mut W,
    limits: CaptureLimits,
) -> io::Result<ExternalRun>
where
    W: AsyncWrite + Unpin,
{
    let mut child = Command::new(program.as_ref())
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;
    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| io::Error::other("child stdout not captured"))?;
    let mut stderr = child
        .stderr
        .take()
        .ok_or_else(|| io::Error::other("child stderr not captured"))?;

    let mut run = ExternalRun::default();
    let mut err_truncated = false;
    let mut err_sink = Vec::new();
    let mut err_written = 0u64;

    let finished = tokio::time::timeout(limits.timeout, async {
        let (out, err) = tokio::join!(
            copy_bounded(
                &mut stdout,
                sink,
                limits.max_bytes,
                &mut run.stdout_bytes,
                &mut run.truncated
            ),
            copy_bounded(
                &mut stderr,
                &mut err_sink,
                limits.max_bytes,
                &mut err_written,
                &mut err_truncated
            ),
        );
        out?;
        err?;
        child.wait().await
    })
    .await;

    match finished {
        Ok(status) => run.status = Some(status?),
        Err(_) => {
            debug!(program = ?program.as_ref(), "tool timed out, killing it");
            run.timed_out = true;
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
    }
    run.truncated |= err_truncated;
    run.stderr = err_sink;
    sink.flush().await?;
    Ok(run)
}

async fn copy_bounded<R, W>(
    reader: &mut R,
    writer: &mut W,
    max: u64,
    written: &mut u64,
    truncated: &mut bool,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; CHUNK];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        let room = max.saturating_sub(*written).min(n as u64) as usize;
        if room > 0 {
            writer.write_all(&buf[..room]).await?;
            *written += room as u64;
        }
        if room < n {
            *truncated = true;
        }
    }
}

/// Port-scan, reverse-DNS and registration lookup programs.
#[derive(Debug, Clone)]
pub struct RequiredTools<'a> {
    pub nmap: &'a Path,
    pub dig: &'a Path,
    pub whois: &'a Path,
}

/// Resolve every required tool, failing on the first one that cannot be found.
pub fn check_prerequisites(tools: &RequiredTools<'_>) -> Result<Vec<PathBuf>> {
    [("nmap", tools.nmap), ("dig", tools.dig), ("whois", tools.whois)]
        .into_iter()
        .map(|(tool, program)| {
            which::which(program).map_err(|_| Error::MissingTool {
                tool,
                program: program.display().to_string(),
            })
        })
        .collect()
}

#[cfg(unix)]
pub fn is_elevated() -> bool {
    // SAFETY: geteuid has no preconditions and cannot fail.
    unsafe { libc::geteuid() == 0 }
}

#[cfg(not(unix))]
pub fn is_elevated() -> bool {
    false
}

/// Swap nmap's raw SYN scan for a connect scan when raw sockets are unavailable.
pub fn effective_nmap_args(args: &[String], elevated: bool) -> Vec<String> {
    if elevated {
        return args.to_vec();
    }
    args.iter()
        .map(|a| if a == "-sS" { "-sT".to_string() } else { a.clone() })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn syn_scan_downgraded_without_privileges() {
        let args = strings(&["-Pn", "-sS", "-T4"]);
        assert_eq!(effective_nmap_args(&args, false), strings(&["-Pn", "-sT", "-T4"]));
        assert_eq!(effective_nmap_args(&args, true), args);
    }

    #[test]
    fn missing_tool_reported_by_name() {
        let bogus = Path::new("definitely-not-a-real-tool-4f1c");
        let sh = Path::new("sh");
        let err = check_prerequisites(&RequiredTools {
            nmap: bogus,
            dig: sh,
            whois: sh,
        })
        .unwrap_err();
        assert!(matches!(err, Error::MissingTool { tool: "nmap", .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stdout_capped_and_stderr_kept() {
        let mut out = Vec::new();
        let args = strings(&["-c", "printf 'abcdefghij'; printf 'oops' >&2; exit 4"]);
        let limits = CaptureLimits {
            max_bytes: 4,
            timeout: Duration::from_secs(10),
        };
        let run = run_external("/bin/sh", &args, &mut out, limits).await.unwrap();
        assert_eq!(out, b"abcd");
        assert_eq!(run.stderr, b"oops");
        assert!(run.truncated);
        assert_eq!(run.exit_code(), Some(4));
        assert!(!run.success());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn slow_tool_is_killed() {
        let mut out = Vec::new();
        let args = strings(&["-c", "sleep 5"]);
        let limits = CaptureLimits {
            max_bytes: 1024,
            timeout: Duration::from_millis(100),
        };
        let run = run_external("/bin/sh", &args, &mut out, limits).await.unwrap();
        assert!(run.timed_out);
        assert!(!run.success());
    }

    #[tokio::test]
    async fn spawn_failure_is_an_error() {
        let mut out = Vec::new();
        let res = run_external("definitely-not-a-real-tool-4f1c", &[], &mut out, CaptureLimits::default()).await;
        assert!(res.is_err());
    }
}
