//! Target validation for probe requests.
//!
//! All predicates are pure: an unacceptable target is a `false`, never an
//! error. Hostnames are accepted heuristically and resolved later by the
//! probe tool itself.

use std::net::{Ipv4Addr, Ipv6Addr};

use protocol::ProbeCommand;

/// A syntactically valid IPv4 address outside the private and loopback
/// blocks (10/8, 127/8, 172.16/12, 192.168/16).
pub(crate) fn is_valid_v4(value: &str) -> bool {
    match value.parse::<Ipv4Addr>() {
        Ok(addr) => !is_private_v4(addr),
        Err(_) => false,
    }
}

/// A syntactically valid IPv6 address outside the unique-local block.
pub(crate) fn is_valid_v6(value: &str) -> bool {
    match value.parse::<Ipv6Addr>() {
        Ok(addr) => !is_unique_local_v6(addr),
        Err(_) => false,
    }
}

pub(crate) fn is_valid_host(value: &str) -> bool {
    if is_valid_v4(value) || is_valid_v6(value) {
        return true;
    }
    if looks_like_ip_literal(value) {
        return false;
    }
    is_plausible_hostname(value)
}

/// Applies the per-command address family constraint on top of the
/// general target checks.
pub(crate) fn is_valid_target(command: ProbeCommand, target: &str) -> bool {
    match command {
        ProbeCommand::Ping => is_valid_v4(target),
        ProbeCommand::Ping6 => is_valid_v6(target),
        ProbeCommand::Host => is_valid_host(target),
        ProbeCommand::Traceroute4 => is_valid_host(target) && !is_valid_v6(target),
        ProbeCommand::Traceroute6 => is_valid_host(target) && !is_valid_v4(target),
    }
}

fn is_private_v4(addr: Ipv4Addr) -> bool {
    let [first, second, ..] = addr.octets();
    match first {
        10 | 127 => true,
        172 => (16..=31).contains(&second),
        192 => second == 168,
        _ => false,
    }
}

fn is_unique_local_v6(addr: Ipv6Addr) -> bool {
    addr.segments()[0] & 0xfe00 == 0xfc00
}

// Anything made only of digits and dots, or containing a colon, is an address
// attempt and must pass the address checks instead of the hostname heuristic.
fn looks_like_ip_literal(value: &str) -> bool {
    value.contains(':') || value.chars().all(|ch| ch.is_ascii_digit() || ch == '.')
}

fn is_plausible_hostname(value: &str) -> bool {
    if value.starts_with('-') {
        return false;
    }
    if value
        .chars()
        .any(|ch| ch.is_whitespace() || ch.is_control())
    {
        return false;
    }
    let lowered = value.to_ascii_lowercase();
    let trimmed = lowered.trim_end_matches('.');
    value.contains('.') && !trimmed.ends_with(".local")
}
