use crate::ports::{default_ports, resolve_ports};
use crate::probe::Prober;
use crate::quality::{spawn_batch, QualityOptions, QualityRun};
use crate::stability::{sample_stability, EXTRA_SAMPLES, SAMPLE_DELAY};
use crate::throttle::{ProgressGate, DEFAULT_PROGRESS_INTERVAL};
use crate::types::{sort_ranked, ProbeTemplate, ScanResult};
use anyhow::Result;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::{self, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Tunables of a scan; defaults match the behaviour users expect from the app.
#[derive(Debug, Clone)]
pub struct ScanOptions {
    pub ports: Vec<u16>,
    /// Target pipelines (port resolution + stability sampling) in flight at once.
    pub concurrency: usize,
    pub extra_samples: usize,
    pub sample_delay: Duration,
    pub progress_interval: Duration,
    /// Number of fastest successes handed to the deep quality pass afterwards; 0 disables it.
    pub auto_quality: usize,
    /// Forward progress to the external sink every this many completions.
    pub notify_every: usize,
    pub quality: QualityOptions,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            ports: default_ports(),
            concurrency: 100,
            extra_samples: EXTRA_SAMPLES,
            sample_delay: SAMPLE_DELAY,
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
            auto_quality: 10,
            notify_every: 10,
            quality: QualityOptions::default(),
        }
    }
}

/// External mirror of scan progress (e.g. a desktop notification). Delivery
/// failures are logged and never abort the scan.
pub trait ProgressSink: Send + Sync {
    fn notify(&self, current: usize, total: usize) -> Result<()>;
}

/// Ranked snapshot handed to the progress callback.
#[derive(Debug, Clone)]
pub struct ScanUpdate {
    pub results: Vec<ScanResult>,
    pub completed: usize,
    pub total: usize,
}

impl ScanUpdate {
    pub fn fraction(&self) -> f32 {
        if self.total == 0 {
            1.0
        } else {
            self.completed as f32 / self.total as f32
        }
    }
}

#[derive(Debug)]
pub struct ScanOutcome {
    /// Ranked results; one per processed target.
    pub results: Vec<ScanResult>,
    pub total: usize,
    pub cancelled: bool,
    /// Background deep-quality run over the fastest successes, if started.
    pub auto_quality: Option<QualityRun>,
}

/// Live view of a running scan for pollers that do not take callbacks.
#[derive(Clone, Debug)]
pub struct SharedProgress {
    pub completed: Arc<AtomicU64>,
    pub entries: Arc<Mutex<Vec<ScanResult>>>,
}

impl SharedProgress {
    pub fn new() -> Self {
        Self {
            completed: Arc::new(AtomicU64::new(0)),
            entries: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Ranked copy of what has been collected so far.
    pub async fn ranked(&self) -> Vec<ScanResult> {
        let mut out = self.entries.lock().await.clone();
        sort_ranked(&mut out);
        out
    }
}

impl Default for SharedProgress {
    fn default() -> Self {
        Self::new()
    }
}

/// Probe, resolve ports and sample stability for one target.
pub async fn scan_target<P: Prober + ?Sized>(
    prober: &P,
    host: &str,
    template: &ProbeTemplate,
    options: &ScanOptions,
) -> ScanResult {
    let Some(ports) = resolve_ports(prober, host, &options.ports, template).await else {
        return ScanResult::failed(host);
    };
    let sample = sample_stability(
        prober,
        &template.at(host, ports.best_port),
        ports.best_latency_ms,
        options.extra_samples,
        options.sample_delay,
    )
    .await;
    ScanResult::succeeded(
        host,
        ports.working_ports,
        sample.latency_ms,
        sample.jitter_ms,
        sample.sample_count,
        sample.stability,
    )
}

/// Scan every target with at most `options.concurrency` pipelines in flight.
///
/// `on_progress` receives a ranked snapshot at most once per progress interval
/// and always after the last target. When the scan is not cancelled, the
/// fastest successes are handed to a background quality run, which the
/// returned outcome exposes without waiting on it.
pub async fn run_scan<P, F>(
    prober: Arc<P>,
    targets: &[String],
    template: &ProbeTemplate,
    options: &ScanOptions,
    cancel: CancellationToken,
    sink: Option<Arc<dyn ProgressSink>>,
    on_progress: F,
) -> ScanOutcome
where
    P: Prober + ?Sized,
    F: FnMut(&ScanUpdate),
{
    run_scan_with_shared(
        prober,
        targets,
        template,
        options,
        cancel,
        sink,
        SharedProgress::new(),
        on_progress,
    )
    .await
}

#[allow(clippy::too_many_arguments)]
pub async fn run_scan_with_shared<P, F>(
    prober: Arc<P>,
    targets: &[String],
    template: &ProbeTemplate,
    options: &ScanOptions,
    cancel: CancellationToken,
    sink: Option<Arc<dyn ProgressSink>>,
    shared: SharedProgress,
    mut on_progress: F,
) -> ScanOutcome
where
    P: Prober + ?Sized,
    F: FnMut(&ScanUpdate),
{
    let total = targets.len();
    if total == 0 {
        return ScanOutcome {
            results: Vec::new(),
            total,
            cancelled: cancel.is_cancelled(),
            auto_quality: None,
        };
    }
    info!(targets = total, ports = ?options.ports, "starting scan");
    notify(sink.as_deref(), 0, total);

    let sem = Arc::new(Semaphore::new(options.concurrency.clamp(1, 5_000)));
    let template = Arc::new(template.clone());
    let task_options = Arc::new(options.clone());
    let mut set = JoinSet::new();
    let mut task_hosts: HashMap<task::Id, String> = HashMap::with_capacity(total);

    for host in targets {
        let sem = sem.clone();
        let prober = prober.clone();
        let template = template.clone();
        let options = task_options.clone();
        let cancel = cancel.clone();
        let task_host = host.clone();

        let handle = set.spawn(async move {
            let host = task_host;
            let _permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => return None,
                p = sem.acquire_owned() => p.ok()?,
            };
            tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                r = scan_target(prober.as_ref(), &host, &template, &options) => Some(r),
            }
        });
        task_hosts.insert(handle.id(), host.clone());
    }

    let mut gate = ProgressGate::new(options.progress_interval);
    let mut completed = 0usize;
    let mut emitted = 0usize;
    while let Some(joined) = set.join_next().await {
        let result = match joined {
            Ok(Some(result)) => result,
            Ok(None) => continue,
            Err(e) => match task_hosts.get(&e.id()) {
                Some(host) => {
                    warn!(host = %host, error = %e, "target task failed");
                    ScanResult::failed(host.as_str())
                }
                None => {
                    warn!(error = %e, "target task failed");
                    continue;
                }
            },
        };
        if cancel.is_cancelled() {
            continue;
        }

        let snapshot = {
            let mut entries = shared.entries.lock().await;
            entries.push(result);
            completed = entries.len();
            shared.completed.store(completed as u64, Ordering::Relaxed);
            let is_last = completed == total;
            gate.ready(Instant::now(), is_last).then(|| {
                let mut ranked = entries.clone();
                sort_ranked(&mut ranked);
                ranked
            })
        };
        if let Some(results) = snapshot {
            emitted = completed;
            on_progress(&ScanUpdate {
                results,
                completed,
                total,
            });
        }
        if options.notify_every > 0 && completed % options.notify_every == 0 {
            notify(sink.as_deref(), completed, total);
        }
    }

    let results = shared.ranked().await;
    let cancelled = cancel.is_cancelled() || completed < total;
    info!(completed, total, cancelled, "scan finished");

    // Entries gated out just before a stop still reach the consumer.
    if cancelled && completed > emitted {
        on_progress(&ScanUpdate {
            results: results.clone(),
            completed,
            total,
        });
    }

    let auto_quality = (!cancelled && options.auto_quality > 0)
        .then(|| fastest_successes(&results, options.auto_quality))
        .filter(|top| !top.is_empty())
        .map(|top| {
            spawn_batch(
                prober.clone(),
                top,
                template.as_ref().clone(),
                options.quality.clone(),
            )
        });

    ScanOutcome {
        results,
        total,
        cancelled,
        auto_quality,
    }
}

/// The `n` lowest-latency successful results.
pub fn fastest_successes(results: &[ScanResult], n: usize) -> Vec<ScanResult> {
    let mut ok: Vec<ScanResult> = results.iter().filter(|r| r.success).cloned().collect();
    ok.sort_by_key(|r| r.latency_ms);
    ok.truncate(n);
    ok
}

fn notify(sink: Option<&dyn ProgressSink>, current: usize, total: usize) {
    if let Some(sink) = sink {
        if let Err(e) = sink.notify(current, total) {
            warn!(error = %e, "progress notification failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ProbeConfig, Stability};

    #[test]
    fn fastest_successes_skips_failures() {
        let results = vec![
            ScanResult::failed("a"),
            ScanResult::succeeded("b", vec![443], 300, 0, 5, Stability::Stable),
            ScanResult::succeeded("c", vec![443], 100, 0, 5, Stability::Unstable),
            ScanResult::succeeded("d", vec![443], 200, 0, 5, Stability::Moderate),
        ];
        let top: Vec<_> = fastest_successes(&results, 2)
            .into_iter()
            .map(|r| r.host)
            .collect();
        assert_eq!(top, vec!["c", "d"]);
    }

    #[tokio::test(start_paused = true)]
    async fn scan_target_builds_failed_entry() {
        let prober = |_: &ProbeConfig| None::<u64>;
        let r = scan_target(
            &prober,
            "10.0.0.1",
            &ProbeTemplate::default(),
            &ScanOptions::default(),
        )
        .await;
        assert!(!r.success);
        assert!(r.working_ports.is_empty());
        assert_eq!(r.stability, Stability::Failed);
        assert_eq!(r.sample_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn scan_target_samples_best_port() {
        let prober = |c: &ProbeConfig| match c.port {
            2053 => Some(60u64),
            8443 => Some(90),
            _ => None,
        };
        let r = scan_target(
            &prober,
            "10.0.0.1",
            &ProbeTemplate::default(),
            &ScanOptions::default(),
        )
        .await;
        assert!(r.success);
        assert_eq!(r.working_ports, vec![2053, 8443]);
        assert_eq!(r.latency_ms, 60);
        assert_eq!(r.sample_count, 5);
        assert_eq!(r.stability, Stability::Stable);
    }
}
