use crate::probe::Prober;
use crate::types::ProbeTemplate;
use anyhow::{bail, Context, Result};
use std::collections::HashSet;
use std::fs;
use std::ops::RangeInclusive;
use std::path::Path;

/// TLS ports a CDN edge answers on, tried in this order.
pub const CANDIDATE_PORTS: &[u16] = &[443, 2053, 8443, 2096];

/// Ports that completed the handshake for one target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortResolution {
    /// Every successful port, in probe order.
    pub working_ports: Vec<u16>,
    pub best_port: u16,
    pub best_latency_ms: u64,
}

/// Probe each candidate port once, sequentially, and keep the fastest.
///
/// Returns `None` when no port succeeds. On equal latency the earlier port wins.
pub async fn resolve_ports<P: Prober + ?Sized>(
    prober: &P,
    address: &str,
    ports: &[u16],
    template: &ProbeTemplate,
) -> Option<PortResolution> {
    let mut working_ports = Vec::new();
    let mut best: Option<(u16, u64)> = None;
    for &port in ports {
        let Some(latency) = prober.probe(&template.at(address, port)).await else {
            continue;
        };
        working_ports.push(port);
        if best.map_or(true, |(_, ms)| latency < ms) {
            best = Some((port, latency));
        }
    }
    let (best_port, best_latency_ms) = best?;
    Some(PortResolution {
        working_ports,
        best_port,
        best_latency_ms,
    })
}

/// Parse a candidate-port list. One entry per line, either `443` or an
/// inclusive `2052-2053` range; `#` starts a comment. Order of first
/// appearance is kept and repeats are dropped.
pub fn parse_ports_str(s: &str) -> Result<Vec<u16>> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for (idx, raw) in s.lines().enumerate() {
        let entry = raw.split('#').next().unwrap_or_default().trim();
        if entry.is_empty() {
            continue;
        }
        let span = parse_entry(entry).with_context(|| format!("line {}: {entry:?}", idx + 1))?;
        out.extend(span.filter(|p| seen.insert(*p)));
    }
    Ok(out)
}

fn parse_entry(entry: &str) -> Result<RangeInclusive<u16>> {
    match entry.split_once('-') {
        Some((lo, hi)) => {
            let (lo, hi) = (parse_port_str(lo.trim())?, parse_port_str(hi.trim())?);
            if lo > hi {
                bail!("range {lo}-{hi} runs backwards");
            }
            Ok(lo..=hi)
        }
        None => {
            let port = parse_port_str(entry)?;
            Ok(port..=port)
        }
    }
}

/// Load a candidate-port list from a file.
pub fn load_ports_from_path(path: impl AsRef<Path>) -> Result<Vec<u16>> {
    let content = fs::read_to_string(path.as_ref())
        .with_context(|| format!("failed to read ports file: {}", path.as_ref().display()))?;
    let ports = parse_ports_str(&content)?;
    if ports.is_empty() {
        bail!("ports file lists no ports: {}", path.as_ref().display());
    }
    Ok(ports)
}

pub fn default_ports() -> Vec<u16> {
    CANDIDATE_PORTS.to_vec()
}

fn parse_port_str(s: &str) -> Result<u16> {
    match s.parse::<u16>().with_context(|| format!("not a port: {s:?}"))? {
        0 => bail!("port 0 is not usable"),
        port => Ok(port),
    }
}
