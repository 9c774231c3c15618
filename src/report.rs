use crate::types::ScanResult;
use ::time::{format_description::well_known, OffsetDateTime};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;

/// The address block holding the most working targets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RangeReport {
    pub prefix: String,
    pub count: usize,
}

impl fmt::Display for RangeReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Best Range: {} ({} IPs)", self.prefix, self.count)
    }
}

/// Grouping key: dotted hosts drop their last label (`1.2.3.4` -> `1.2.3.x`),
/// colon-separated hosts drop their last group. Hosts with neither group alone.
pub fn range_key(host: &str) -> String {
    if let Some((head, _)) = host.rsplit_once('.') {
        format!("{head}.x")
    } else if let Some((head, _)) = host.rsplit_once(':') {
        format!("{head}:x")
    } else {
        host.to_string()
    }
}

/// Find the most populated range among successful results. On a tie the
/// range seen first in `results` wins. `None` when nothing succeeded.
pub fn best_range(results: &[ScanResult]) -> Option<RangeReport> {
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut groups: Vec<(String, usize)> = Vec::new();
    for r in results.iter().filter(|r| r.success) {
        let key = range_key(&r.host);
        match index.get(&key) {
            Some(&i) => groups[i].1 += 1,
            None => {
                index.insert(key.clone(), groups.len());
                groups.push((key, 1));
            }
        }
    }

    let mut best: Option<(String, usize)> = None;
    for (prefix, count) in groups {
        if best.as_ref().map_or(true, |(_, c)| count > *c) {
            best = Some((prefix, count));
        }
    }
    best.map(|(prefix, count)| RangeReport { prefix, count })
}

/// Serialized form of a finished scan, as written by `--output`.
#[derive(Debug, Clone, Serialize)]
pub struct ScanReport {
    pub generated_at: String,
    pub sni: String,
    pub path: String,
    pub total: usize,
    pub cancelled: bool,
    pub best_range: Option<RangeReport>,
    pub results: Vec<ScanResult>,
}

impl ScanReport {
    pub fn new(sni: &str, path: &str, results: Vec<ScanResult>, total: usize, cancelled: bool) -> Self {
        Self {
            generated_at: now_rfc3339(),
            sni: sni.to_string(),
            path: path.to_string(),
            total,
            cancelled,
            best_range: best_range(&results),
            results,
        }
    }
}

fn now_rfc3339() -> String {
    let now = OffsetDateTime::now_utc();
    now.format(&well_known::Rfc3339)
        .unwrap_or_else(|_| String::from("1970-01-01T00:00:00Z"))
}
