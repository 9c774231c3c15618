//! Deep, batched sampling pass that assigns a usability tier to a working target.

use crate::probe::Prober;
use crate::stability::mean_and_jitter;
use crate::types::{ProbeTemplate, QualityTier, ScanResult};
use futures_util::future::join_all;
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub const ANALYZING_LABEL: &str = "Analyzing Quality...";

#[derive(Debug, Clone)]
pub struct QualityOptions {
    pub samples: usize,
    pub batch_size: usize,
    pub batch_pause: Duration,
    /// How long the finished progress bar stays visible before resetting.
    pub display_hold: Duration,
    /// Per-result assessments allowed at once in a batch run.
    pub max_parallel: usize,
}

impl Default for QualityOptions {
    fn default() -> Self {
        Self {
            samples: 100,
            batch_size: 10,
            batch_pause: Duration::from_millis(100),
            display_hold: Duration::from_secs(1),
            max_parallel: 20,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QualityReport {
    pub attempts: usize,
    pub successes: usize,
    pub loss_percent: u64,
    pub avg_ms: u64,
    pub jitter_ms: u64,
    pub tier: QualityTier,
}

impl QualityReport {
    /// Aggregate a finished sampling pass. With no successes the tier is
    /// LOSS at 100% and the latency statistics are left at zero.
    pub fn from_samples(attempts: usize, latencies: &[u64]) -> Self {
        if latencies.is_empty() || attempts == 0 {
            return Self {
                attempts,
                successes: 0,
                loss_percent: 100,
                avg_ms: 0,
                jitter_ms: 0,
                tier: QualityTier::Loss,
            };
        }
        let (avg_ms, jitter_ms) = mean_and_jitter(latencies);
        let loss_percent = ((attempts - latencies.len()) * 100 / attempts) as u64;
        Self {
            attempts,
            successes: latencies.len(),
            loss_percent,
            avg_ms,
            jitter_ms,
            tier: classify_quality(loss_percent, avg_ms, jitter_ms),
        }
    }

    pub fn label(&self) -> String {
        if self.successes == 0 {
            return "LOSS > 30% (100% Packet Loss)".to_string();
        }
        match self.tier {
            QualityTier::Loss => format!("LOSS > 30% ({}% Loss)", self.loss_percent),
            QualityTier::Average => format!("AVERAGE (Unstable / {}% Loss)", self.loss_percent),
            QualityTier::Gaming => {
                format!("GAMING < 180ms ({}ms / J:{})", self.avg_ms, self.jitter_ms)
            }
            QualityTier::Stream => format!("STREAM < 300ms ({}ms)", self.avg_ms),
        }
    }
}

/// First matching rule wins.
pub fn classify_quality(loss_percent: u64, avg_ms: u64, jitter_ms: u64) -> QualityTier {
    if loss_percent > 30 {
        QualityTier::Loss
    } else if loss_percent > 5 {
        QualityTier::Average
    } else if avg_ms < 180 && jitter_ms < 60 {
        QualityTier::Gaming
    } else {
        QualityTier::Stream
    }
}

/// Run the deep pass for one result and publish label/progress on its cell.
///
/// Returns `None` if the result has no working port, if another assessment
/// already holds the result's quality cell, or if `cancel` fires; in the last
/// case progress is reset and the in-progress label cleared.
pub async fn assess<P: Prober + ?Sized>(
    prober: &P,
    result: &ScanResult,
    template: &ProbeTemplate,
    options: &QualityOptions,
    cancel: &CancellationToken,
) -> Option<QualityReport> {
    let port = result.primary_port()?;
    let Some(writer) = result.quality.try_writer() else {
        debug!(host = %result.host, "quality test already running");
        return None;
    };
    writer.set_label(ANALYZING_LABEL, None);
    writer.set_progress(0.01);

    let config = template.at(&result.host, port);
    let batch_size = options.batch_size.max(1);
    let batches = options.samples.div_ceil(batch_size);
    let mut latencies = Vec::with_capacity(options.samples);
    let mut attempted = 0;

    for _ in 0..batches {
        let n = batch_size.min(options.samples - attempted);
        let batch = join_all((0..n).map(|_| prober.probe(&config)));
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            r = batch => Some(r),
        };
        let Some(outcome) = outcome else {
            writer.set_progress(0.0);
            writer.set_label("", None);
            return None;
        };
        latencies.extend(outcome.into_iter().flatten());
        attempted += n;
        writer.set_progress(attempted as f32 / options.samples as f32);
        time::sleep(options.batch_pause).await;
    }

    let report = QualityReport::from_samples(attempted, &latencies);
    writer.set_label(report.label(), Some(report.tier));
    debug!(host = %result.host, tier = %report.tier, loss = report.loss_percent, "quality test done");

    tokio::select! {
        biased;
        _ = cancel.cancelled() => {}
        _ = time::sleep(options.display_hold) => {}
    }
    writer.set_progress(0.0);
    Some(report)
}

/// Handle to a background set of quality assessments.
#[derive(Debug)]
pub struct QualityRun {
    cancel: CancellationToken,
    completed: Arc<AtomicUsize>,
    total: usize,
    handle: JoinHandle<Vec<(String, QualityReport)>>,
}

impl QualityRun {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::Relaxed)
    }

    /// Fraction of results whose assessment has finished.
    pub fn progress(&self) -> f32 {
        if self.total == 0 {
            1.0
        } else {
            self.completed() as f32 / self.total as f32
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for every assessment and collect `(host, report)` pairs.
    pub async fn wait(self) -> Vec<(String, QualityReport)> {
        self.handle.await.unwrap_or_default()
    }
}

/// Spawn assessments for `results` under a `max_parallel` limiter.
/// Failed results are skipped. The run has its own cancellation token.
pub fn spawn_batch<P: Prober + ?Sized>(
    prober: Arc<P>,
    results: Vec<ScanResult>,
    template: ProbeTemplate,
    options: QualityOptions,
) -> QualityRun {
    let results: Vec<ScanResult> = results.into_iter().filter(|r| r.success).collect();
    let cancel = CancellationToken::new();
    let completed = Arc::new(AtomicUsize::new(0));
    let total = results.len();

    let task_cancel = cancel.clone();
    let task_completed = completed.clone();
    let handle = tokio::spawn(async move {
        info!(targets = results.len(), "starting quality tests");
        let sem = Arc::new(Semaphore::new(options.max_parallel.max(1)));
        let template = Arc::new(template);
        let options = Arc::new(options);
        let mut set = JoinSet::new();

        for result in results {
            let sem = sem.clone();
            let prober = prober.clone();
            let template = template.clone();
            let options = options.clone();
            let cancel = task_cancel.clone();
            let completed = task_completed.clone();
            set.spawn(async move {
                let _permit = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return None,
                    p = sem.acquire_owned() => p.ok()?,
                };
                let report = assess(prober.as_ref(), &result, &template, &options, &cancel).await;
                completed.fetch_add(1, Ordering::Relaxed);
                report.map(|r| (result.host.clone(), r))
            });
        }

        let mut reports = Vec::new();
        while let Some(joined) = set.join_next().await {
            if let Ok(Some(pair)) = joined {
                reports.push(pair);
            }
        }
        reports
    });

    QualityRun {
        cancel,
        completed,
        total,
        handle,
    }
}
