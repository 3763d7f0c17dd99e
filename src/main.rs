use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use ban_scan_rs::config::Config;
use ban_scan_rs::error::EXIT_PREREQUISITE;
use ban_scan_rs::scanner::Scanner;
use ban_scan_rs::{monitor, tools};

/// ban-scan-rs — watch a ban log and scan every banned address with nmap, dig and whois.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "ban-scan-rs",
    version,
    about = "Watch a ban log and scan every banned address with nmap, dig and whois.",
    long_about = None
)]
struct Cli {
    /// JSON config file; flags below override its values.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log file to follow (e.g. /var/log/fail2ban.log).
    #[arg(long = "log-file")]
    log_file: Option<PathBuf>,

    /// Root directory for scan results.
    #[arg(long = "output-root")]
    output_root: Option<PathBuf>,

    /// Queue state file.
    #[arg(long = "state-file")]
    state_file: Option<PathBuf>,

    /// Max concurrent scans (default: available CPUs).
    #[arg(long)]
    concurrency: Option<usize>,

    /// Seconds before the same address may be scanned again.
    #[arg(long = "ttl-secs")]
    ttl_secs: Option<u64>,

    /// Arguments passed to nmap before the target.
    #[arg(long = "nmap-args", allow_hyphen_values = true)]
    nmap_args: Option<String>,

    /// Scan this single address and exit instead of following the log.
    #[arg(long)]
    target: Option<String>,

    /// Log level used when RUST_LOG is not set.
    #[arg(long = "log-level", default_value = "info")]
    log_level: String,
}

impl Cli {
    fn apply(&self, cfg: &mut Config) {
        if let Some(v) = &self.log_file {
            cfg.log_file = v.clone();
        }
        if let Some(v) = &self.output_root {
            cfg.output_root = v.clone();
        }
        if let Some(v) = &self.state_file {
            cfg.state_file = v.clone();
        }
        if let Some(v) = self.concurrency {
            cfg.concurrency = Some(v);
        }
        if let Some(v) = self.ttl_secs {
            cfg.ttl_secs = v;
        }
        if let Some(v) = &self.nmap_args {
            cfg.nmap_args = v.clone();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();

    let mut config = Config::load(cli.config.as_deref())?;
    cli.apply(&mut config);
    config.validate()?;

    info!(
        log_file = %config.log_file.display(),
        output_root = %config.output_root.display(),
        state_file = %config.state_file.display(),
        concurrency = config.effective_concurrency(),
        ttl_secs = config.ttl_secs,
        nmap_args = %config.nmap_args,
        "ban-scan-rs configuration"
    );

    if let Err(e) = tools::check_prerequisites(&config.required_tools()) {
        error!("{e}");
        std::process::exit(EXIT_PREREQUISITE);
    }

    let scanner = Scanner::new(config.scan_config());

    if let Some(target) = cli.target.as_deref() {
        let result = scanner.scan(target.trim()).await?;
        println!("{}", serde_json::to_string_pretty(&result)?);
        return Ok(());
    }

    monitor::run(&config, scanner, shutdown_signal()).await
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
