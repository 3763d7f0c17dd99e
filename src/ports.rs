use once_cell::sync::Lazy;
use regex::Regex;
use std::path::Path;

static OPEN_TCP_PORT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\d+/tcp\s+open(?:\s|$)").expect("open port pattern is valid"));

/// Collect the `<port>/tcp open ...` lines of an nmap capture, trimmed, in file order.
///
/// - leading and trailing whitespace is ignored
/// - `open|filtered` and closed ports are not reported
/// - anything else in the capture (headers, stderr block) is skipped
pub fn parse_open_ports(capture: &str) -> Vec<String> {
    capture
        .lines()
        .map(str::trim)
        .filter(|line| OPEN_TCP_PORT.is_match(line))
        .map(str::to_string)
        .collect()
}

/// Read an nmap capture from disk and extract its open ports.
/// A missing or unreadable capture yields an empty list.
pub async fn read_open_ports(path: impl AsRef<Path>) -> Vec<String> {
    match tokio::fs::read(path.as_ref()).await {
        Ok(bytes) => parse_open_ports(&String::from_utf8_lossy(&bytes)),
        Err(_) => Vec::new(),
    }
}
