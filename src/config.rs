use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::Error;
use crate::queue::{default_concurrency, QueueConfig};
use crate::scanner::{ScanConfig, ToolCommand};
use crate::tools::{self, CaptureLimits, RequiredTools};

/// External programs and their fixed arguments.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct ToolsConfig {
    pub nmap: PathBuf,
    pub dig: PathBuf,
    pub whois: PathBuf,
    pub dig_args: String,
    pub whois_args: String,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            nmap: PathBuf::from("nmap"),
            dig: PathBuf::from("dig"),
            whois: PathBuf::from("whois"),
            dig_args: "-x".into(),
            whois_args: String::new(),
        }
    }
}

/// Daemon configuration. Every field has a default, so a config file only needs
/// the keys it changes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub log_file: PathBuf,
    pub output_root: PathBuf,
    pub fallback_root: PathBuf,
    pub state_file: PathBuf,
    /// Concurrent scans; unset means one per available CPU.
    pub concurrency: Option<usize>,
    pub ttl_secs: u64,
    pub failure_cooldown_secs: u64,
    pub nmap_args: String,
    pub tools: ToolsConfig,
    pub tool_timeout_secs: u64,
    pub max_capture_bytes: u64,
    pub shutdown_grace_secs: u64,
    pub poll_interval_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_file: PathBuf::from("/var/log/fail2ban.log"),
            output_root: PathBuf::from("/var/lib/ban-scan/results"),
            fallback_root: std::env::temp_dir().join("ban-scan"),
            state_file: PathBuf::from("/var/lib/ban-scan/state.json"),
            concurrency: None,
            ttl_secs: 3600,
            failure_cooldown_secs: 300,
            nmap_args: "-Pn -sS -T4 --top-ports 1000".into(),
            tools: ToolsConfig::default(),
            tool_timeout_secs: 900,
            max_capture_bytes: 16 * 1024 * 1024,
            shutdown_grace_secs: 30,
            poll_interval_ms: 2000,
        }
    }
}

impl Config {
    /// Parse a JSON config document.
    pub fn from_json_str(s: &str) -> Result<Self> {
        serde_json::from_str(s).context("invalid config JSON")
    }

    /// Load from `path`, or defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => {
                let content = fs::read_to_string(p)
                    .with_context(|| format!("failed to read config file: {}", p.display()))?;
                Self::from_json_str(&content)
                    .with_context(|| format!("in config file: {}", p.display()))
            }
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.concurrency == Some(0) {
            return Err(Error::Config("concurrency must be at least 1".into()));
        }
        if self.max_capture_bytes == 0 {
            return Err(Error::Config("max_capture_bytes must be positive".into()));
        }
        if self.poll_interval_ms == 0 {
            return Err(Error::Config("poll_interval_ms must be positive".into()));
        }
        if self.tools.nmap.as_os_str().is_empty() {
            return Err(Error::Config("tools.nmap must not be empty".into()));
        }
        Ok(())
    }

    pub fn effective_concurrency(&self) -> usize {
        self.concurrency.unwrap_or_else(default_concurrency)
    }

    pub fn required_tools(&self) -> RequiredTools<'_> {
        RequiredTools {
            nmap: &self.tools.nmap,
            dig: &self.tools.dig,
            whois: &self.tools.whois,
        }
    }

    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            concurrency: self.effective_concurrency(),
            ttl: Duration::from_secs(self.ttl_secs),
            failure_cooldown: Duration::from_secs(self.failure_cooldown_secs),
        }
    }

    pub fn scan_config(&self) -> ScanConfig {
        ScanConfig {
            output_root: self.output_root.clone(),
            fallback_root: self.fallback_root.clone(),
            nmap: ToolCommand::new(&self.tools.nmap, &self.nmap_args),
            dig: ToolCommand::new(&self.tools.dig, &self.tools.dig_args),
            whois: ToolCommand::new(&self.tools.whois, &self.tools.whois_args),
            limits: CaptureLimits {
                max_bytes: self.max_capture_bytes,
                timeout: Duration::from_secs(self.tool_timeout_secs),
            },
            elevated: tools::is_elevated(),
        }
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}
