use std::path::{Path, PathBuf};

use time::{format_description::well_known, macros::format_description, OffsetDateTime};
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::error::Error;
use crate::ports::read_open_ports;
use crate::queue::ScanRunner;
use crate::tools::{self, CaptureLimits, ExternalRun};
use crate::types::{ScanResult, ToolOutcome, ToolOutcomes};

pub const NMAP_FILE: &str = "nmap.txt";
pub const DIG_FILE: &str = "dig.txt";
pub const WHOIS_FILE: &str = "whois.txt";
pub const SUMMARY_FILE: &str = "summary.json";

/// A program plus the arguments placed before the target address.
#[derive(Debug, Clone)]
pub struct ToolCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl ToolCommand {
    pub fn new(program: impl Into<PathBuf>, args: &str) -> Self {
        Self {
            program: program.into(),
            args: args.split_whitespace().map(str::to_string).collect(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScanConfig {
    pub output_root: PathBuf,
    /// Used when `output_root` refuses the scan directory.
    pub fallback_root: PathBuf,
    pub nmap: ToolCommand,
    pub dig: ToolCommand,
    pub whois: ToolCommand,
    pub limits: CaptureLimits,
    /// Whether raw-socket scans are allowed.
    pub elevated: bool,
}

/// Runs nmap, dig and whois for one address and writes their captures plus a summary.
#[derive(Debug, Clone)]
pub struct Scanner {
    config: ScanConfig,
}

impl Scanner {
    pub fn new(config: ScanConfig) -> Self {
        Self { config }
    }

    /// Scan `address`. Tool failures end up in the summary; only an output
    /// directory that cannot be created anywhere is returned as an error.
    pub async fn scan(&self, address: &str) -> Result<ScanResult, Error> {
        let started = OffsetDateTime::now_utc();
        let dir = self.prepare_output_dir(address, started).await?;
        info!(ip = address, dir = %dir.display(), "scan started");

        let nmap_args = tools::effective_nmap_args(&self.config.nmap.args, self.config.elevated);
        let nmap = self
            .run_tool(&self.config.nmap.program, nmap_args, address, dir.join(NMAP_FILE))
            .await;
        let dig = self
            .run_tool(&self.config.dig.program, self.config.dig.args.clone(), address, dir.join(DIG_FILE))
            .await;
        let whois = self
            .run_tool(
                &self.config.whois.program,
                self.config.whois.args.clone(),
                address,
                dir.join(WHOIS_FILE),
            )
            .await;

        let open_ports = read_open_ports(dir.join(NMAP_FILE)).await;
        let result = ScanResult {
            ip: address.to_string(),
            timestamp: started
                .format(&well_known::Rfc3339)
                .unwrap_or_else(|_| String::from("1970-01-01T00:00:00Z")),
            tools: ToolOutcomes { nmap, dig, whois },
            open_ports,
        };

        if let Err(e) = write_summary(&dir, &result).await {
            warn!(ip = address, dir = %dir.display(), "failed to write summary: {e}");
        }
        if let Err(e) = tighten_permissions(&dir).await {
            warn!(dir = %dir.display(), "failed to restrict permissions: {e}");
        }
        info!(
            ip = address,
            nmap = result.tools.nmap.ok,
            dig = result.tools.dig.ok,
            whois = result.tools.whois.ok,
            open = result.open_ports.len(),
            "scan finished"
        );
        Ok(result)
    }

    async fn prepare_output_dir(&self, address: &str, started: OffsetDateTime) -> Result<PathBuf, Error> {
        let relative = scan_dir_name(address, started);
        let primary = self.config.output_root.join(&relative);
        match create_scan_dir(&primary).await {
            Ok(dir) => return Ok(dir),
            Err(e) => warn!(
                dir = %primary.display(),
                fallback = %self.config.fallback_root.display(),
                "cannot create scan directory, using fallback: {e}"
            ),
        }
        let fallback = self.config.fallback_root.join(&relative);
        create_scan_dir(&fallback)
            .await
            .map_err(|source| Error::OutputDir {
                primary: self.config.output_root.clone(),
                fallback: self.config.fallback_root.clone(),
                source,
            })
    }

    async fn run_tool(&self, program: &Path, mut args: Vec<String>, address: &str, path: PathBuf) -> ToolOutcome {
        let capture = path.display().to_string();
        let mut file = match File::create(&path).await {
            Ok(f) => f,
            Err(e) => {
                warn!(path = %capture, "cannot create capture file: {e}");
                return ToolOutcome::failed(capture, format!("cannot create capture file: {e}"));
            }
        };
        args.push(address.to_string());

        let outcome = match tools::run_external(program, &args, &mut file, self.config.limits).await {
            Ok(run) => {
                if let Err(e) = append_diagnostics(&mut file, &run, self.config.limits).await {
                    warn!(path = %capture, "failed to append diagnostics: {e}");
                }
                ToolOutcome {
                    ok: run.success(),
                    path: capture.clone(),
                    exit_code: run.exit_code(),
                    error: run.timed_out.then(|| "timed out".to_string()),
                    truncated: run.truncated,
                    timed_out: run.timed_out,
                }
            }
            Err(e) => {
                let msg = format!("failed to run {}: {e}", program.display());
                if let Err(e) = file.write_all(format!("{msg}\n").as_bytes()).await {
                    debug!(path = %capture, "failed to record spawn error: {e}");
                }
                ToolOutcome::failed(capture.clone(), msg)
            }
        };
        if let Err(e) = file.sync_all().await {
            debug!(path = %capture, "failed to sync capture: {e}");
        }
        if !outcome.ok {
            warn!(ip = address, tool = %program.display(), exit_code = ?outcome.exit_code, "tool failed");
        }
        outcome
    }
}

impl ScanRunner for Scanner {
    async fn run(&self, address: String) -> anyhow::Result<()> {
        self.scan(&address).await?;
        Ok(())
    }
}

/// `<YYYY-MM-DD>/<sanitized address>_<YYYYMMDDTHHMMSSZ>` for a scan started at `started`.
pub fn scan_dir_name(address: &str, started: OffsetDateTime) -> PathBuf {
    let date = started
        .format(format_description!("[year]-[month]-[day]"))
        .unwrap_or_else(|_| String::from("1970-01-01"));
    let stamp = started
        .format(format_description!("[year][month][day]T[hour][minute][second]Z"))
        .unwrap_or_else(|_| String::from("19700101T000000Z"));
    PathBuf::from(date).join(format!("{}_{}", sanitize_address(address), stamp))
}

/// Create `dir` as a fresh leaf directory. An existing directory is never reused;
/// `-1`, `-2`, ... is appended to the name until creation succeeds.
pub async fn create_scan_dir(dir: &Path) -> std::io::Result<PathBuf> {
    if let Some(parent) = dir.parent() {
        fs::create_dir_all(parent).await?;
    }
    let mut candidate = dir.to_path_buf();
    let mut suffix = 0u32;
    loop {
        match fs::create_dir(&candidate).await {
            Ok(()) => return Ok(candidate),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists && suffix < 1000 => {
                suffix += 1;
                let mut name = dir.file_name().map(|n| n.to_os_string()).unwrap_or_default();
                name.push(format!("-{suffix}"));
                candidate = dir.with_file_name(name);
            }
            Err(e) => return Err(e),
        }
    }
}

/// Replace characters that are awkward in file names with `_`.
pub fn sanitize_address(address: &str) -> String {
    address
        .chars()
        .map(|c| match c {
            ':' | '/' | '\\' | '<' | '>' | '?' | '"' | '|' | '*' | ' ' => '_',
            other => other,
        })
        .collect()
}

async fn append_diagnostics(file: &mut File, run: &ExternalRun, limits: CaptureLimits) -> std::io::Result<()> {
    if !run.stderr.is_empty() {
        file.write_all(b"\n----- stderr -----\n").await?;
        file.write_all(&run.stderr).await?;
        if !run.stderr.ends_with(b"\n") {
            file.write_all(b"\n").await?;
        }
    }
    if run.truncated {
        let note = format!("\n----- output truncated at {} bytes -----\n", limits.max_bytes);
        file.write_all(note.as_bytes()).await?;
    }
    if run.timed_out {
        let note = format!("\n----- killed after {}s -----\n", limits.timeout.as_secs());
        file.write_all(note.as_bytes()).await?;
    }
    file.flush().await
}

async fn write_summary(dir: &Path, result: &ScanResult) -> anyhow::Result<()> {
    let tmp = dir.join(format!("{SUMMARY_FILE}.tmp"));
    let data = serde_json::to_vec_pretty(result)?;
    fs::write(&tmp, data).await?;
    fs::rename(&tmp, dir.join(SUMMARY_FILE)).await?;
    Ok(())
}

#[cfg(unix)]
async fn tighten_permissions(dir: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(dir, std::fs::Permissions::from_mode(0o750)).await
}

#[cfg(not(unix))]
async fn tighten_permissions(_dir: &Path) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn sanitizes_hostile_characters() {
        assert_eq!(sanitize_address("2001:db8::1"), "2001_db8__1");
        assert_eq!(sanitize_address("a/b\\c<d>e?f\"g|h*i j"), "a_b_c_d_e_f_g_h_i_j");
        assert_eq!(sanitize_address("203.0.113.7"), "203.0.113.7");
    }

    #[test]
    fn dir_name_is_date_then_address_stamp() {
        let started = datetime!(2025-10-12 10:00:05 UTC);
        assert_eq!(
            scan_dir_name("203.0.113.7", started),
            PathBuf::from("2025-10-12").join("203.0.113.7_20251012T100005Z")
        );
    }

    #[tokio::test]
    async fn existing_scan_dir_is_not_reused() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("2025-10-12").join("203.0.113.7_20251012T100005Z");
        let first = create_scan_dir(&dir).await.unwrap();
        std::fs::write(first.join("nmap.txt"), b"first").unwrap();
        let second = create_scan_dir(&dir).await.unwrap();
        assert_eq!(first, dir);
        assert_eq!(second, root.path().join("2025-10-12").join("203.0.113.7_20251012T100005Z-1"));
        assert!(!second.join("nmap.txt").exists());
        assert_eq!(std::fs::read(first.join("nmap.txt")).unwrap(), b"first");
    }

    #[test]
    fn tool_command_splits_args() {
        let cmd = ToolCommand::new("nmap", " -Pn  -sS --top-ports 100 ");
        assert_eq!(cmd.args, vec!["-Pn", "-sS", "--top-ports", "100"]);
    }
}
