mod common;

use common::ScriptedProber;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use ws_scan_rs::quality::{assess, spawn_batch, QualityOptions};
use ws_scan_rs::types::{ProbeTemplate, QualityTier, ScanResult, Stability};

fn working(host: &str) -> ScanResult {
    ScanResult::succeeded(host, vec![443], 60, 5, 5, Stability::Stable)
}

#[tokio::test(start_paused = true)]
async fn batch_run_caps_assessments_and_probes_in_flight() {
    let hosts: Vec<String> = (1..=25).map(|i| format!("10.1.0.{i}")).collect();
    let mut prober = ScriptedProber::new().with_delay(Duration::from_millis(10));
    for h in &hosts {
        prober = prober.with(h, 443, 60);
    }
    let prober = Arc::new(prober);
    let results: Vec<ScanResult> = hosts.iter().map(|h| working(h)).collect();

    let run = spawn_batch(
        prober.clone(),
        results,
        ProbeTemplate::new("/ws", "edge.example.com"),
        QualityOptions::default(),
    );
    assert_eq!(run.total(), 25);
    let reports = run.wait().await;

    assert_eq!(reports.len(), 25);
    assert!(reports.iter().all(|(_, r)| r.tier == QualityTier::Gaming));
    // 20 assessments at once, each with a batch of 10 probes outstanding
    assert_eq!(prober.max_in_flight(), 200);
    assert_eq!(prober.calls(), 25 * 100);
}

#[tokio::test(start_paused = true)]
async fn progress_steps_per_batch_then_resets_after_hold() {
    let prober = Arc::new(
        ScriptedProber::new()
            .with("10.1.0.1", 443, 70)
            .with_delay(Duration::from_millis(5)),
    );
    let result = working("10.1.0.1");
    let options = QualityOptions::default();
    let mut rx = result.quality.subscribe();

    let task = tokio::spawn({
        let prober = prober.clone();
        let result = result.clone();
        let options = options.clone();
        async move {
            assess(
                prober.as_ref(),
                &result,
                &ProbeTemplate::default(),
                &options,
                &CancellationToken::new(),
            )
            .await
        }
    });

    let mut progress: Vec<f32> = Vec::new();
    let mut labelled_at = None;
    let reset_at = loop {
        rx.changed().await.unwrap();
        let state = rx.borrow_and_update().clone();
        if progress.last() != Some(&state.progress) {
            progress.push(state.progress);
        }
        if state.tier.is_some() && labelled_at.is_none() {
            labelled_at = Some(Instant::now());
        }
        if state.tier.is_some() && state.progress == 0.0 {
            break Instant::now();
        }
    };

    let mut expected = vec![0.01f32];
    expected.extend((1..=10).map(|i| (i * 10) as f32 / 100.0));
    expected.push(0.0);
    assert_eq!(progress, expected);

    let labelled_at = labelled_at.expect("final label published");
    assert!(reset_at - labelled_at >= options.display_hold);
    assert_eq!(result.quality.snapshot().label, "GAMING < 180ms (70ms / J:0)");

    let report = task.await.unwrap().expect("assessment ran");
    assert_eq!(report.attempts, 100);
    assert_eq!(prober.max_in_flight(), 10);
}
