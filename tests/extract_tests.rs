use ban_scan_rs::extract::{extract_address, is_ban_line};

#[test]
fn fail2ban_ban_line() {
    let line = "2025-10-12 10:00:00 fail2ban.actions [812]: NOTICE [sshd] Ban 203.0.113.7";
    assert!(is_ban_line(line));
    assert_eq!(extract_address(line).as_deref(), Some("203.0.113.7"));
}

#[test]
fn lines_without_marker_are_not_ban_lines() {
    for line in [
        "2025-10-12 10:00:00 fail2ban.filter [812]: INFO [sshd] Found 203.0.113.7",
        "2025-10-12 10:00:00 fail2ban.actions [812]: NOTICE [sshd] Unban 203.0.113.7",
        "banner grabbed from 203.0.113.7",
    ] {
        assert!(!is_ban_line(line), "{line}");
    }
}

#[test]
fn ipv4_preferred_when_both_present() {
    let line = "Ban fe80::1:2:3 (mapped from 192.0.2.10)";
    assert_eq!(extract_address(line).as_deref(), Some("192.0.2.10"));
}

#[test]
fn ipv6_ban() {
    let line = "2025-10-12 10:00:00 fail2ban.actions [812]: NOTICE [sshd] Ban 2001:db8:85a3::8a2e:370:7334";
    assert_eq!(extract_address(line).as_deref(), Some("2001:db8:85a3::8a2e:370:7334"));
}
