use ipnet::Ipv4Net;
use regex::Regex;
use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::OnceLock;

/// Smallest prefix accepted; wider blocks are narrowed to this.
pub const MIN_PREFIX: u8 = 20;
/// Upper bound on addresses generated from a single block.
pub const MAX_ADDRESSES_PER_BLOCK: u32 = 2000;

/// Built-in CDN edge ranges offered when no targets are given.
pub const DEFAULT_RANGES: &[&str] = &[
    "104.16.0.0/20",
    "172.64.0.0/20",
    "108.162.192.0/20",
    "162.158.0.0/20",
    "173.245.48.0/20",
    "188.114.96.0/20",
    "190.93.240.0/20",
    "197.234.240.0/22",
    "198.41.128.0/20",
    "103.21.244.0/22",
    "103.22.200.0/22",
    "103.31.4.0/22",
];

/// Expand one `a.b.c.d/prefix` token into concrete addresses.
///
/// The prefix is clamped to `[20, 32]` and enumeration starts at the network
/// address of the block, capped at [`MAX_ADDRESSES_PER_BLOCK`]. Anything that
/// does not parse is returned unchanged as a single literal.
pub fn expand_cidr(token: &str) -> Vec<String> {
    let token = token.trim();
    match parse_block(token) {
        Some(net) => {
            let start = u32::from(net.network());
            let size = 1u64 << (32 - net.prefix_len());
            let count = size.min(MAX_ADDRESSES_PER_BLOCK as u64) as u32;
            (0..count)
                .map(|i| Ipv4Addr::from(start + i).to_string())
                .collect()
        }
        None => vec![token.to_string()],
    }
}

fn parse_block(token: &str) -> Option<Ipv4Net> {
    let (base, prefix) = token.split_once('/')?;
    let base: Ipv4Addr = base.trim().parse().ok()?;
    let prefix: i64 = prefix.trim().parse().ok()?;
    let prefix = prefix.clamp(MIN_PREFIX as i64, 32) as u8;
    Ipv4Net::new(base, prefix).ok()
}

/// Turn newline-separated addresses and CIDR blocks into a deduplicated list,
/// in order of first appearance.
pub fn expand_targets(input: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for token in input.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let addresses = if token.contains('/') {
            expand_cidr(token)
        } else {
            vec![token.to_string()]
        };
        for addr in addresses {
            if seen.insert(addr.clone()) {
                out.push(addr);
            }
        }
    }
    out
}

fn uri_host_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?:vless|trojan)://[^@\s]*@([^:/?#\s]+)").expect("static pattern compiles")
    })
}

/// Pull the host component out of every connection URI in `input`.
/// Credentials and ports are dropped; hosts are deduplicated.
pub fn extract_uri_hosts(input: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    uri_host_pattern()
        .captures_iter(input)
        .filter_map(|c| c.get(1).map(|m| m.as_str().to_string()))
        .filter(|h| seen.insert(h.clone()))
        .collect()
}

/// Accept either form of input: URI lists are mined for hosts, everything
/// else goes through address/CIDR expansion.
pub fn parse_targets(input: &str) -> Vec<String> {
    if input.contains("://") {
        extract_uri_hosts(input)
    } else {
        expand_targets(input)
    }
}

pub fn default_range_input() -> String {
    DEFAULT_RANGES.join("\n")
}
