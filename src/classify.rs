//! Host classification
//!
//! Derives the effective registrable domain of a requested host so the
//! site ledger can store one entry per organizational site instead of one
//! per sub-host. Pure string functions - no network or OS calls.

/// Second-to-last labels that are shared public suffixes. A host whose
/// second-to-last label is in this set keeps three labels, so that
/// `bbc.co.uk` and `foo.co.uk` stay distinct sites.
const SHARED_SUFFIXES: &[&str] = &["ac", "co", "org", "com", "net", "edu"];

/// Split `host:port` into host and optional port. IPv6 literals in
/// brackets keep their brackets on the host side.
pub fn split_host_port(host_port: &str) -> (&str, Option<&str>) {
    if let Some(end) = host_port.rfind(']') {
        // Bracketed IPv6: port only after the closing bracket
        match host_port[end..].find(':') {
            Some(colon) => (&host_port[..end + 1], Some(&host_port[end + colon + 1..])),
            None => (host_port, None),
        }
    } else {
        match host_port.rfind(':') {
            Some(colon) => (&host_port[..colon], Some(&host_port[colon + 1..])),
            None => (host_port, None),
        }
    }
}

/// True if `host` is a dotted-quad IPv4 literal.
pub fn host_is_ipv4(host: &str) -> bool {
    let parts: Vec<&str> = host.split('.').collect();
    if parts.len() != 4 {
        return false;
    }
    parts.iter().all(|p| {
        !p.is_empty() && p.len() <= 3 && p.bytes().all(|b| b.is_ascii_digit()) && {
            // leading zeros are fine, value must fit a byte
            p.parse::<u16>().map(|n| n <= 255).unwrap_or(false)
        }
    })
}

/// Effective registrable domain of a `host[:port]` string.
///
/// Returns an empty string for IP literals and single-label hosts -
/// those have no domain semantics and are never recorded in site lists.
/// The result is lower-case, matching how the lists are stored.
///
/// `"www.google.com"` -> `"google.com"`, `"foo.bbc.co.uk"` -> `"bbc.co.uk"`,
/// `"192.168.1.1"` -> `""`, `"localhost"` -> `""`.
pub fn effective_domain(host_port: &str) -> String {
    let (host, _) = split_host_port(host_port);
    if host_is_ipv4(host) {
        return String::new();
    }
    let host = host.strip_suffix('.').unwrap_or(host);
    let Some(last_dot) = host.rfind('.') else {
        return String::new();
    };
    let Some(dot2) = host[..last_dot].rfind('.') else {
        // Exactly two labels: the host is its own domain
        return host.to_ascii_lowercase();
    };
    let second_last = &host[dot2 + 1..last_dot];
    if SHARED_SUFFIXES
        .iter()
        .any(|s| s.eq_ignore_ascii_case(second_last))
    {
        // Shared public suffix: keep a third label from the right
        match host[..dot2].rfind('.') {
            Some(dot3) => host[dot3 + 1..].to_ascii_lowercase(),
            None => host.to_ascii_lowercase(),
        }
    } else {
        host[dot2 + 1..].to_ascii_lowercase()
    }
}
