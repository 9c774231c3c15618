mod common;

use anyhow::{anyhow, Result};
use common::ScriptedProber;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use ws_scan_rs::scanner::{
    run_scan, run_scan_with_shared, ProgressSink, ScanOptions, ScanUpdate, SharedProgress,
};
use ws_scan_rs::types::{ProbeConfig, ProbeTemplate, ScanResult, Stability};

fn hosts(n: usize) -> Vec<String> {
    (1..=n).map(|i| format!("10.0.{}.{}", i / 250, i % 250)).collect()
}

fn template() -> ProbeTemplate {
    ProbeTemplate::new("/ws", "edge.example.com")
}

fn quiet_options() -> ScanOptions {
    ScanOptions {
        auto_quality: 0,
        ..Default::default()
    }
}

fn tier(r: &ScanResult) -> u8 {
    match r.stability {
        Stability::Stable => 0,
        Stability::Moderate => 1,
        _ => 2,
    }
}

fn assert_ranked(results: &[ScanResult]) {
    for pair in results.windows(2) {
        let (a, b) = (&pair[0], &pair[1]);
        assert!(tier(a) <= tier(b), "{} before {}", a.stability, b.stability);
        if tier(a) == tier(b) && b.success {
            assert!(a.success && a.latency_ms <= b.latency_ms);
        }
    }
}

#[tokio::test(start_paused = true)]
async fn every_target_produces_exactly_one_result() {
    let targets = hosts(12);
    let mut prober = ScriptedProber::new();
    for (i, h) in targets.iter().enumerate().filter(|(i, _)| i % 3 != 0) {
        prober = prober.with(h, 443, 40 + i as u64).with(h, 8443, 30 + i as u64);
    }
    let mut updates: Vec<ScanUpdate> = Vec::new();
    let outcome = run_scan(
        Arc::new(prober),
        &targets,
        &template(),
        &quiet_options(),
        CancellationToken::new(),
        None,
        |u| updates.push(u.clone()),
    )
    .await;

    assert!(!outcome.cancelled);
    assert_eq!(outcome.results.len(), targets.len());
    for r in &outcome.results {
        assert_eq!(r.success, !r.working_ports.is_empty());
        assert_eq!(r.stability == Stability::Failed, !r.success);
        if r.success {
            assert_eq!(r.working_ports, vec![443, 8443]);
            assert!(r.sample_count >= 1);
        }
    }
    assert_eq!(outcome.results.iter().filter(|r| r.success).count(), 8);
    assert_ranked(&outcome.results);

    let last = updates.last().expect("at least one update");
    assert_eq!(last.completed, targets.len());
    assert_eq!(last.results.len(), targets.len());
    for u in &updates {
        assert!(u.completed <= u.total);
        assert_ranked(&u.results);
    }
}

#[tokio::test(start_paused = true)]
async fn pipelines_respect_the_concurrency_cap() {
    let targets = hosts(30);
    let prober = Arc::new(ScriptedProber::new().with_delay(Duration::from_secs(1)));
    let options = ScanOptions {
        concurrency: 5,
        ..quiet_options()
    };
    let outcome = run_scan(
        prober.clone(),
        &targets,
        &template(),
        &options,
        CancellationToken::new(),
        None,
        |_| {},
    )
    .await;
    assert_eq!(outcome.results.len(), 30);
    assert_eq!(prober.max_in_flight(), 5);
    // every failing target probes each candidate port exactly once
    assert_eq!(prober.calls(), 30 * 4);
}

#[tokio::test(start_paused = true)]
async fn progress_is_throttled_but_final_update_always_arrives() {
    let targets = hosts(60);
    let prober = Arc::new(ScriptedProber::new().with_delay(Duration::from_millis(10)));
    let mut updates = Vec::new();
    run_scan(
        prober,
        &targets,
        &template(),
        &quiet_options(),
        CancellationToken::new(),
        None,
        |u| updates.push(u.completed),
    )
    .await;
    assert!(updates.len() < targets.len());
    assert_eq!(updates.last().copied(), Some(60));
    assert!(updates.windows(2).all(|w| w[0] < w[1]));
}

#[tokio::test(start_paused = true)]
async fn cancelled_scan_stops_growing() {
    let targets = hosts(20);
    let prober = Arc::new(ScriptedProber::new().with_delay(Duration::from_secs(1)));
    let options = ScanOptions {
        concurrency: 2,
        ..Default::default()
    };
    let cancel = CancellationToken::new();
    let shared = SharedProgress::new();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(6_500)).await;
        trigger.cancel();
    });

    let outcome = run_scan_with_shared(
        prober,
        &targets,
        &template(),
        &options,
        cancel,
        None,
        shared.clone(),
        |_| {},
    )
    .await;

    assert!(outcome.cancelled);
    assert!(outcome.auto_quality.is_none());
    assert!(outcome.results.len() < targets.len());
    let size = outcome.results.len();
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(shared.entries.lock().await.len(), size);
}

#[tokio::test(start_paused = true)]
async fn last_update_after_cancel_carries_every_collected_result() {
    let targets = hosts(20);
    let prober = Arc::new(ScriptedProber::new().with_delay(Duration::from_millis(10)));
    let options = ScanOptions {
        concurrency: 1,
        ..quiet_options()
    };
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        trigger.cancel();
    });

    let mut last: Option<ScanUpdate> = None;
    let outcome = run_scan(
        prober,
        &targets,
        &template(),
        &options,
        cancel,
        None,
        |u| last = Some(u.clone()),
    )
    .await;

    assert!(outcome.cancelled);
    assert!(outcome.results.len() > 1);
    let last = last.expect("at least one update");
    assert_eq!(last.results.len(), outcome.results.len());
    assert_eq!(last.completed, outcome.results.len());
}

#[tokio::test(start_paused = true)]
async fn panicking_target_still_yields_a_failed_entry() {
    let targets = hosts(3);
    let broken = targets[1].clone();
    let prober = Arc::new(move |c: &ProbeConfig| {
        if c.address == broken {
            panic!("handshake blew up");
        }
        (c.port == 443).then_some(50u64)
    });
    let mut updates = Vec::new();
    let outcome = run_scan(
        prober,
        &targets,
        &template(),
        &quiet_options(),
        CancellationToken::new(),
        None,
        |u| updates.push(u.completed),
    )
    .await;

    assert!(!outcome.cancelled);
    assert_eq!(outcome.results.len(), 3);
    let failed = outcome
        .results
        .iter()
        .find(|r| r.host == targets[1])
        .expect("entry for the panicking target");
    assert!(!failed.success);
    assert_eq!(failed.stability, Stability::Failed);
    assert_eq!(updates.last().copied(), Some(3));
}

#[tokio::test(start_paused = true)]
async fn cancelled_before_start_yields_nothing() {
    let cancel = CancellationToken::new();
    cancel.cancel();
    let prober = Arc::new(ScriptedProber::new().with("10.0.0.1", 443, 10));
    let outcome = run_scan(
        prober.clone(),
        &hosts(5),
        &template(),
        &ScanOptions::default(),
        cancel,
        None,
        |_| panic!("no progress expected"),
    )
    .await;
    assert!(outcome.cancelled);
    assert!(outcome.results.is_empty());
    assert_eq!(prober.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn fastest_successes_get_an_automatic_quality_test() {
    let targets = hosts(14);
    let mut prober = ScriptedProber::new();
    for (i, h) in targets.iter().enumerate().take(12) {
        prober = prober.with(h, 443, 20 + 10 * i as u64);
    }
    let outcome = run_scan(
        Arc::new(prober),
        &targets,
        &template(),
        &ScanOptions::default(),
        CancellationToken::new(),
        None,
        |_| {},
    )
    .await;

    let run = outcome.auto_quality.expect("quality run started");
    assert_eq!(run.total(), 10);
    let mut tested: Vec<String> = run.wait().await.into_iter().map(|(h, _)| h).collect();
    tested.sort();
    let mut expected: Vec<String> = targets.iter().take(10).cloned().collect();
    expected.sort();
    assert_eq!(tested, expected);

    let fastest = &outcome.results[0];
    assert_eq!(fastest.host, targets[0]);
    assert!(fastest.quality.snapshot().label.starts_with("GAMING"));
}

struct RecordingSink {
    calls: Mutex<Vec<(usize, usize)>>,
    fail: bool,
}

impl ProgressSink for RecordingSink {
    fn notify(&self, current: usize, total: usize) -> Result<()> {
        self.calls.lock().unwrap().push((current, total));
        if self.fail {
            Err(anyhow!("notification channel closed"))
        } else {
            Ok(())
        }
    }
}

#[tokio::test(start_paused = true)]
async fn sink_is_mirrored_every_ten_completions_and_failures_are_ignored() {
    for fail in [false, true] {
        let sink = Arc::new(RecordingSink {
            calls: Mutex::new(Vec::new()),
            fail,
        });
        let outcome = run_scan(
            Arc::new(ScriptedProber::new()),
            &hosts(25),
            &template(),
            &quiet_options(),
            CancellationToken::new(),
            Some(sink.clone()),
            |_| {},
        )
        .await;
        assert_eq!(outcome.results.len(), 25);
        assert_eq!(
            *sink.calls.lock().unwrap(),
            vec![(0, 25), (10, 25), (20, 25)]
        );
    }
}

#[tokio::test]
async fn empty_target_list_is_a_no_op() {
    let outcome = run_scan(
        Arc::new(ScriptedProber::new()),
        &[],
        &template(),
        &ScanOptions::default(),
        CancellationToken::new(),
        None,
        |_| panic!("no progress expected"),
    )
    .await;
    assert!(outcome.results.is_empty());
    assert!(outcome.auto_quality.is_none());
}

#[tokio::test(start_paused = true)]
async fn disabled_auto_quality_starts_no_background_run() {
    let targets = hosts(3);
    let mut prober = ScriptedProber::new();
    for h in &targets {
        prober = prober.with(h, 443, 30);
    }
    let prober = Arc::new(prober);
    let outcome = run_scan(
        prober.clone(),
        &targets,
        &template(),
        &quiet_options(),
        CancellationToken::new(),
        None,
        |_| {},
    )
    .await;
    assert_eq!(outcome.results.iter().filter(|r| r.success).count(), 3);
    assert!(outcome.auto_quality.is_none());
    // port resolution plus stability samples only, no deep pass
    assert_eq!(prober.calls(), 3 * (4 + 4));
}
