use crate::probe::Prober;
use crate::types::{ProbeConfig, Stability};
use std::time::Duration;
use tokio::time;

/// Additional probes taken against the best port after port resolution.
pub const EXTRA_SAMPLES: usize = 4;
pub const SAMPLE_DELAY: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StabilitySample {
    pub latency_ms: u64,
    pub jitter_ms: u64,
    pub sample_count: usize,
    pub stability: Stability,
}

/// First matching rule wins: STABLE (>=5 samples, jitter < 150),
/// MODERATE (>=3 samples, jitter < 400), otherwise UNSTABLE.
pub fn classify_stability(sample_count: usize, jitter_ms: u64) -> Stability {
    if sample_count >= 5 && jitter_ms < 150 {
        Stability::Stable
    } else if sample_count >= 3 && jitter_ms < 400 {
        Stability::Moderate
    } else {
        Stability::Unstable
    }
}

/// Truncated mean and max-minus-min of a latency series. Empty input gives zeros.
pub fn mean_and_jitter(samples: &[u64]) -> (u64, u64) {
    let (Some(min), Some(max)) = (samples.iter().min(), samples.iter().max()) else {
        return (0, 0);
    };
    let sum: u64 = samples.iter().sum();
    (sum / samples.len() as u64, max - min)
}

/// Extend `first_ms` with up to `extra` more samples against the same endpoint,
/// each after `delay`. Failed attempts are dropped, not retried.
pub async fn sample_stability<P: Prober + ?Sized>(
    prober: &P,
    config: &ProbeConfig,
    first_ms: u64,
    extra: usize,
    delay: Duration,
) -> StabilitySample {
    let mut samples = Vec::with_capacity(extra + 1);
    samples.push(first_ms);
    for _ in 0..extra {
        time::sleep(delay).await;
        if let Some(ms) = prober.probe(config).await {
            samples.push(ms);
        }
    }
    let (latency_ms, jitter_ms) = mean_and_jitter(&samples);
    StabilitySample {
        latency_ms,
        jitter_ms,
        sample_count: samples.len(),
        stability: classify_stability(samples.len(), jitter_ms),
    }
}
