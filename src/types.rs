use serde::{Deserialize, Serialize, Serializer};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

/// Exactly one handshake attempt: where to connect and what to present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeConfig {
    pub address: String,
    pub port: u16,
    pub path: String,
    pub host_name: String,
}

/// The per-scan part of a [`ProbeConfig`]; shared by every target.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProbeTemplate {
    pub path: String,
    pub host_name: String,
}

impl ProbeTemplate {
    pub fn new(path: impl Into<String>, host_name: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            host_name: host_name.into(),
        }
    }

    pub fn at(&self, address: &str, port: u16) -> ProbeConfig {
        ProbeConfig {
            address: address.to_string(),
            port,
            path: self.path.clone(),
            host_name: self.host_name.clone(),
        }
    }
}

/// Tier assigned by the initial multi-sample pass.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Stability {
    Stable,
    Moderate,
    Unstable,
    Failed,
}

impl Stability {
    pub fn as_str(self) -> &'static str {
        match self {
            Stability::Stable => "STABLE",
            Stability::Moderate => "MODERATE",
            Stability::Unstable => "UNSTABLE",
            Stability::Failed => "FAILED",
        }
    }

    /// Position in the ranked list. UNSTABLE and FAILED share the last tier.
    fn rank(self) -> u8 {
        match self {
            Stability::Stable => 0,
            Stability::Moderate => 1,
            Stability::Unstable | Stability::Failed => 2,
        }
    }
}

impl fmt::Display for Stability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tier assigned by the deep 100-sample pass.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QualityTier {
    Gaming,
    Stream,
    Average,
    Loss,
}

impl QualityTier {
    pub fn as_str(self) -> &'static str {
        match self {
            QualityTier::Gaming => "GAMING",
            QualityTier::Stream => "STREAM",
            QualityTier::Average => "AVERAGE",
            QualityTier::Loss => "LOSS",
        }
    }
}

impl fmt::Display for QualityTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The two mutable fields of a result, published as one value.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct QualityState {
    pub label: String,
    pub progress: f32,
    pub tier: Option<QualityTier>,
}

#[derive(Debug)]
struct QualityInner {
    state: watch::Sender<QualityState>,
    writer: AtomicBool,
}

/// Shared, observable quality fields of one [`ScanResult`].
///
/// Clones refer to the same cell, so a snapshot of the result list handed to a
/// consumer still observes updates made by a running assessment. Writes go
/// through a [`QualityWriter`], and at most one writer exists at a time.
#[derive(Debug, Clone)]
pub struct QualityCell {
    inner: Arc<QualityInner>,
}

impl QualityCell {
    pub fn new() -> Self {
        let (state, _) = watch::channel(QualityState::default());
        Self {
            inner: Arc::new(QualityInner {
                state,
                writer: AtomicBool::new(false),
            }),
        }
    }

    pub fn snapshot(&self) -> QualityState {
        self.inner.state.borrow().clone()
    }

    /// Receive every change of label/progress, e.g. to drive a progress bar.
    pub fn subscribe(&self) -> watch::Receiver<QualityState> {
        self.inner.state.subscribe()
    }

    /// Claim the single writer slot. Returns `None` while another writer holds it.
    pub fn try_writer(&self) -> Option<QualityWriter> {
        self.inner
            .writer
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| QualityWriter {
                inner: self.inner.clone(),
            })
    }

    pub fn is_busy(&self) -> bool {
        self.inner.writer.load(Ordering::Acquire)
    }
}

impl Default for QualityCell {
    fn default() -> Self {
        Self::new()
    }
}

impl Serialize for QualityCell {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.snapshot().serialize(serializer)
    }
}

/// Exclusive write access to a [`QualityCell`]; released on drop.
#[derive(Debug)]
pub struct QualityWriter {
    inner: Arc<QualityInner>,
}

impl QualityWriter {
    pub fn set_label(&self, label: impl Into<String>, tier: Option<QualityTier>) {
        let label = label.into();
        self.inner.state.send_modify(|s| {
            s.label = label;
            s.tier = tier;
        });
    }

    pub fn set_progress(&self, progress: f32) {
        let progress = progress.clamp(0.0, 1.0);
        self.inner.state.send_modify(|s| s.progress = progress);
    }
}

impl Drop for QualityWriter {
    fn drop(&mut self) {
        self.inner.writer.store(false, Ordering::Release);
    }
}

/// One ranked entry per distinct target.
///
/// Everything except `quality` is fixed once the orchestrator builds it.
#[derive(Serialize, Debug, Clone)]
pub struct ScanResult {
    pub host: String,
    pub latency_ms: u64,
    pub jitter_ms: u64,
    pub sample_count: usize,
    pub stability: Stability,
    pub working_ports: Vec<u16>,
    pub success: bool,
    pub quality: QualityCell,
}

impl ScanResult {
    pub fn failed(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            latency_ms: 0,
            jitter_ms: 0,
            sample_count: 0,
            stability: Stability::Failed,
            working_ports: Vec::new(),
            success: false,
            quality: QualityCell::new(),
        }
    }

    pub fn succeeded(
        host: impl Into<String>,
        working_ports: Vec<u16>,
        latency_ms: u64,
        jitter_ms: u64,
        sample_count: usize,
        stability: Stability,
    ) -> Self {
        debug_assert!(!working_ports.is_empty());
        debug_assert!(stability != Stability::Failed);
        Self {
            host: host.into(),
            latency_ms,
            jitter_ms,
            sample_count: sample_count.max(1),
            stability,
            working_ports,
            success: true,
            quality: QualityCell::new(),
        }
    }

    /// Port used for the deep assessment and for the exported URI.
    pub fn primary_port(&self) -> Option<u16> {
        self.working_ports.first().copied()
    }

    fn rank_key(&self) -> (u8, u64) {
        let latency = if self.success {
            self.latency_ms
        } else {
            u64::MAX
        };
        (self.stability.rank(), latency)
    }
}

/// Sort in presentation order: STABLE, MODERATE, then the rest; faster first
/// within a tier, failures last.
pub fn sort_ranked(results: &mut [ScanResult]) {
    results.sort_by_key(ScanResult::rank_key);
}
