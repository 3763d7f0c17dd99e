use once_cell::sync::Lazy;
use regex::Regex;

static BAN_MARKER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bban\b").expect("ban marker pattern is valid"));

static IPV4: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(?:\d{1,3}\.){3}\d{1,3}\b").expect("ipv4 pattern is valid")
});

static IPV6: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:[0-9A-Fa-f]{0,4}:){2,7}[0-9A-Fa-f]{1,4}").expect("ipv6 pattern is valid")
});

/// True when the line carries the case-insensitive word `ban`.
///
/// `Unban` and `fail2ban` do not count; the marker has to stand on its own.
pub fn is_ban_line(line: &str) -> bool {
    BAN_MARKER.is_match(line)
}

/// Return the first IPv4 or IPv6 literal found in `line`.
///
/// IPv4 always wins, even when an IPv6-looking run appears earlier in the line.
/// Matching is purely lexical: `999.999.999.999` is returned as-is and left for the
/// downstream tools to reject.
pub fn extract_address(line: &str) -> Option<String> {
    if let Some(m) = IPV4.find(line) {
        return Some(m.as_str().to_string());
    }
    IPV6
        .find_iter(line)
        .map(|m| m.as_str())
        .find(|candidate| !looks_like_clock(candidate))
        .map(str::to_string)
}

// `10:00:00` fits the loose hextet pattern but is a log timestamp.
fn looks_like_clock(candidate: &str) -> bool {
    !candidate.contains("::") && candidate.chars().all(|c| c.is_ascii_digit() || c == ':')
}
