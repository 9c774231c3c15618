use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ws_scan_rs::config::{Settings, DEFAULT_SETTINGS_PATH};
use ws_scan_rs::probe::{HandshakeProber, ProbeTimeouts, Prober};
use ws_scan_rs::report::{best_range, ScanReport};
use ws_scan_rs::scanner::{self, ProgressSink, ScanOptions};
use ws_scan_rs::types::ScanResult;
use ws_scan_rs::{ports, server, targets, uri};

/// ws-scan-rs: find CDN edge addresses that complete a TLS + WebSocket upgrade
/// for your host, rank them by stability and grade their quality.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "ws-scan-rs",
    version,
    about = "Find edge addresses that complete a TLS + WebSocket upgrade and rank them.",
    long_about = None
)]
struct Cli {
    /// Addresses, CIDR blocks or vless/trojan URIs (comma or newline separated),
    /// or a path to a file holding them.
    #[arg(long)]
    targets: Option<String>,

    /// Connection URIs (inline or a file path); their hosts are scanned.
    #[arg(long, conflicts_with = "targets")]
    uris: Option<String>,

    /// Scan the built-in CDN edge ranges.
    #[arg(long = "default-ranges", default_value_t = false)]
    default_ranges: bool,

    /// TLS server name and Host header (overrides the settings file).
    #[arg(long)]
    sni: Option<String>,

    /// WebSocket request path (overrides the settings file).
    #[arg(long)]
    path: Option<String>,

    /// Identifier written into exported URIs (overrides the settings file).
    #[arg(long)]
    uuid: Option<String>,

    /// Settings file holding sni/path/uuid.
    #[arg(long, default_value = DEFAULT_SETTINGS_PATH)]
    settings: PathBuf,

    /// Persist --sni/--path/--uuid to the settings file.
    #[arg(long, default_value_t = false)]
    save: bool,

    /// Path to a candidate ports file (one port or range per line).
    #[arg(long)]
    ports: Option<PathBuf>,

    /// Max targets probed concurrently.
    #[arg(long, default_value_t = 100)]
    concurrency: usize,

    /// Connect and read timeout per probe in milliseconds.
    #[arg(long = "timeout-ms", default_value_t = 8000)]
    timeout_ms: u64,

    /// Accept certificates that do not validate for the SNI.
    #[arg(long, default_value_t = false)]
    insecure: bool,

    /// Run the deep quality test on the fastest results after the scan and wait for it.
    /// Without this flag no quality test is started.
    #[arg(long, default_value_t = false)]
    quality: bool,

    /// Print a connection URI for every working address.
    #[arg(long, default_value_t = false)]
    export: bool,

    /// Write results as pretty JSON to this path (optional).
    #[arg(long)]
    output: Option<PathBuf>,

    /// Start the embedded HTTP API.
    #[arg(long = "serve-ui", default_value_t = false)]
    serve_ui: bool,

    /// Bind address for the HTTP API.
    #[arg(long, default_value = "127.0.0.1:8080")]
    bind: String,
}

/// Mirrors scan progress into the log stream.
struct LogSink;

impl ProgressSink for LogSink {
    fn notify(&self, current: usize, total: usize) -> Result<()> {
        info!(current, total, "scan progress");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let mut settings = Settings::load(&cli.settings)?;
    if let Some(sni) = &cli.sni {
        settings.sni = sni.clone();
    }
    if let Some(path) = &cli.path {
        settings.path = path.clone();
    }
    if let Some(uuid) = &cli.uuid {
        settings.uuid = uuid.clone();
    }
    settings = settings.trimmed();
    if cli.save {
        settings.save(&cli.settings)?;
        info!("saved settings to {}", cli.settings.display());
    }

    let mut options = ScanOptions {
        concurrency: cli.concurrency,
        ..Default::default()
    };
    if let Some(path) = cli.ports.as_deref() {
        options.ports = ports::load_ports_from_path(path)?;
    }
    let timeout = Duration::from_millis(cli.timeout_ms);
    let prober = Arc::new(HandshakeProber::new(
        ProbeTimeouts {
            connect: timeout,
            read: timeout,
        },
        cli.insecure,
    )?);

    println!("ws-scan-rs configuration:");
    println!("  sni          : {}", display_or(&settings.sni, "<unset>"));
    println!("  path         : {}", display_or(&settings.path, "/"));
    println!("  ports        : {:?}", options.ports);
    println!("  concurrency  : {}", options.concurrency);
    println!("  timeout_ms   : {}", cli.timeout_ms);
    println!("  serve_ui     : {}", cli.serve_ui);

    if cli.serve_ui {
        let state = server::AppState::new(
            prober.clone() as Arc<dyn Prober>,
            options.clone(),
            settings.clone(),
            Some(cli.settings.clone()),
        );
        let bind = cli.bind.clone();
        tokio::spawn(async move {
            if let Err(e) = server::spawn_server(&bind, state).await {
                eprintln!("HTTP API server error: {e}");
            }
        });
        println!("API server starting at http://{} (Ctrl+C to stop)", cli.bind);
    }

    let hosts = match (&cli.targets, &cli.uris, cli.default_ranges) {
        (Some(t), _, _) => targets::parse_targets(&read_target_input(t)?),
        (None, Some(u), _) => targets::extract_uri_hosts(&read_uri_input(u)?),
        (None, None, true) => targets::expand_targets(&targets::default_range_input()),
        (None, None, false) if cli.serve_ui => {
            let _ = tokio::signal::ctrl_c().await;
            return Ok(());
        }
        (None, None, false) => {
            bail!("no targets: pass --targets, --uris, --default-ranges or --serve-ui")
        }
    };
    if hosts.is_empty() {
        bail!("no usable targets in input");
    }
    settings.ensure_scannable()?;
    println!("\nScanning {} targets...", hosts.len());

    let cancel = CancellationToken::new();
    let cancel_ctrlc = cancel.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        cancel_ctrlc.cancel();
    });

    let scan_options = ScanOptions {
        auto_quality: if cli.quality { options.auto_quality } else { 0 },
        ..options
    };
    let outcome = scanner::run_scan(
        prober,
        &hosts,
        &settings.template(),
        &scan_options,
        cancel,
        Some(Arc::new(LogSink)),
        |update| {
            let working = update.results.iter().filter(|r| r.success).count();
            eprint!(
                "\r  {}/{} ({:.0}%) working: {}   ",
                update.completed,
                update.total,
                update.fraction() * 100.0,
                working
            );
        },
    )
    .await;
    eprintln!();

    print_results_table(&outcome.results);
    match best_range(&outcome.results) {
        Some(r) => println!("\n{r}"),
        None => println!("\nNo working addresses."),
    }
    if outcome.cancelled {
        println!("Scan stopped after {} of {} targets.", outcome.results.len(), outcome.total);
    }

    if let Some(run) = outcome.auto_quality {
        println!("\nRunning quality tests on the {} fastest addresses...", run.total());
        let mut reports = run.wait().await;
        reports.sort_by_key(|(_, r)| (r.loss_percent, r.avg_ms));
        for (host, report) in &reports {
            println!("  {:<16} {}", host, report.label());
        }
    }

    if cli.export {
        println!("\n{}", uri::export_successes(&outcome.results, &settings));
    }

    if let Some(path) = cli.output.as_deref() {
        let report = ScanReport::new(
            &settings.sni,
            &settings.path,
            outcome.results,
            outcome.total,
            outcome.cancelled,
        );
        if let Err(e) = write_report_json(path, &report) {
            eprintln!("Failed to write JSON to {}: {}", path.display(), e);
        } else {
            println!("Wrote JSON results to {}", path.display());
        }
    }

    if cli.serve_ui {
        println!("Press Ctrl+C to stop the server...");
        let _ = tokio::signal::ctrl_c().await;
    }

    Ok(())
}

/// A path to an existing file is read; anything else is taken as inline
/// tokens with commas accepted as separators.
fn read_target_input(arg: &str) -> Result<String> {
    let path = Path::new(arg);
    if path.is_file() {
        return std::fs::read_to_string(path)
            .with_context(|| format!("failed to read targets file: {}", path.display()));
    }
    Ok(arg.replace(',', "\n"))
}

fn read_uri_input(arg: &str) -> Result<String> {
    let path = Path::new(arg);
    if path.is_file() {
        return std::fs::read_to_string(path)
            .with_context(|| format!("failed to read URI file: {}", path.display()));
    }
    Ok(arg.to_string())
}

fn display_or<'a>(value: &'a str, fallback: &'a str) -> &'a str {
    if value.is_empty() {
        fallback
    } else {
        value
    }
}

fn print_results_table(results: &[ScanResult]) {
    let mut host_w = "host".len();
    for r in results {
        host_w = host_w.max(r.host.len());
    }
    let stab_w = "stability".len();
    let lat_w = "latency_ms".len();
    let jit_w = "jitter_ms".len();

    println!(
        "\nWorking: {} of {}",
        results.iter().filter(|r| r.success).count(),
        results.len()
    );
    println!(
        "{:<host_w$}  {:<stab_w$}  {:>lat_w$}  {:>jit_w$}  {}",
        "host", "stability", "latency_ms", "jitter_ms", "ports",
    );
    println!(
        "{:-<host_w$}  {:-<stab_w$}  {:-<lat_w$}  {:-<jit_w$}  {:-<5}",
        "", "", "", "", "",
    );
    for r in results.iter().filter(|r| r.success) {
        let ports: Vec<String> = r.working_ports.iter().map(u16::to_string).collect();
        println!(
            "{:<host_w$}  {:<stab_w$}  {:>lat_w$}  {:>jit_w$}  {}",
            r.host,
            r.stability.as_str(),
            r.latency_ms,
            r.jitter_ms,
            ports.join(","),
        );
    }
}

fn write_report_json(path: &Path, report: &ScanReport) -> Result<()> {
    let file = File::create(path)?;
    serde_json::to_writer_pretty(file, report)?;
    Ok(())
}
