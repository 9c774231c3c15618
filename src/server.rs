use std::{path::PathBuf, sync::Arc};

use anyhow::Result;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::{
    config::Settings,
    probe::Prober,
    quality::{self, QualityRun},
    report,
    scanner::{self, ScanOptions, SharedProgress},
    targets,
    types::ScanResult,
    uri,
};

#[derive(Clone)]
pub struct AppState {
    inner: Arc<RwLock<ServerState>>,
    prober: Arc<dyn Prober>,
    options: Arc<ScanOptions>,
    settings_path: Option<Arc<PathBuf>>,
}

struct ServerState {
    status: Status,
    settings: Settings,
    results: Vec<ScanResult>,
    progress: Option<SharedProgress>,
    cancel: Option<CancellationToken>,
    quality: Option<QualityRun>,
    session: Session,
    scan_id: u64,
}

/// Which target the user is currently connected through, by host.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Session {
    pub connected_host: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub struct Status {
    pub total: u64,
    pub completed: u64,
    pub state: String, // "idle" | "running" | "done" | "stopped"
    pub report: Option<String>,
    pub quality_progress: Option<f32>,
}

#[derive(Debug, Deserialize, Default)]
pub struct ScanRequest {
    /// Addresses, CIDR blocks or connection URIs, newline separated.
    #[serde(default)]
    pub targets: String,
    /// Connection URIs whose hosts are scanned instead of `targets`.
    #[serde(default)]
    pub uris: String,
    #[serde(default)]
    pub default_ranges: bool,
}

#[derive(Debug, Serialize)]
pub struct ConnectResponse {
    pub connected_host: Option<String>,
    pub uri: Option<String>,
}

impl AppState {
    pub fn new(
        prober: Arc<dyn Prober>,
        options: ScanOptions,
        settings: Settings,
        settings_path: Option<PathBuf>,
    ) -> Self {
        Self {
            inner: Arc::new(RwLock::new(ServerState {
                status: Status {
                    state: "idle".into(),
                    ..Default::default()
                },
                settings,
                results: Vec::new(),
                progress: None,
                cancel: None,
                quality: None,
                session: Session::default(),
                scan_id: 0,
            })),
            prober,
            options: Arc::new(options),
            settings_path: settings_path.map(Arc::new),
        }
    }
}

pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/status", get(get_status))
        .route("/scan", post(post_scan))
        .route("/stop", post(post_stop))
        .route("/results", get(get_results))
        .route("/quality", post(post_quality_all))
        .route("/quality/{host}", post(post_quality_one))
        .route("/export", get(get_export))
        .route("/connect/{host}", post(post_connect))
        .route("/settings", get(get_settings).put(put_settings))
        .with_state(state);

    Router::new().nest("/api", api).layer(TraceLayer::new_for_http())
}

pub async fn spawn_server(bind: &str, state: AppState) -> Result<()> {
    let app = router(state);
    info!("serving API on http://{}", bind);
    axum::serve(tokio::net::TcpListener::bind(bind).await?, app).await?;
    Ok(())
}

async fn get_status(State(app): State<AppState>) -> impl IntoResponse {
    let s = app.inner.read().await;
    let mut out = s.status.clone();
    if let Some(p) = s.progress.as_ref() {
        out.completed = p.completed.load(std::sync::atomic::Ordering::Relaxed);
    }
    out.quality_progress = s.quality.as_ref().filter(|q| !q.is_finished()).map(QualityRun::progress);
    (StatusCode::OK, Json(out))
}

async fn get_results(State(app): State<AppState>) -> impl IntoResponse {
    let (progress, results) = {
        let s = app.inner.read().await;
        (s.progress.clone(), s.results.clone())
    };
    let results = match progress {
        Some(p) => p.ranked().await,
        None => results,
    };
    (StatusCode::OK, Json(results))
}

async fn post_scan(State(app): State<AppState>, Json(req): Json<ScanRequest>) -> impl IntoResponse {
    let hosts = if req.default_ranges {
        targets::expand_targets(&targets::default_range_input())
    } else if !req.uris.trim().is_empty() {
        targets::extract_uri_hosts(&req.uris)
    } else {
        targets::parse_targets(&req.targets)
    };
    if hosts.is_empty() {
        return (StatusCode::BAD_REQUEST, "no targets given").into_response();
    }

    let progress = SharedProgress::new();
    let cancel = CancellationToken::new();
    let total = hosts.len() as u64;

    let (template, scan_id) = {
        let mut s = app.inner.write().await;
        if let Err(e) = s.settings.ensure_scannable() {
            return (StatusCode::BAD_REQUEST, e.to_string()).into_response();
        }
        if let Some(c) = s.cancel.take() {
            c.cancel();
        }
        if let Some(q) = s.quality.take() {
            q.cancel();
        }
        s.status = Status {
            total,
            state: "running".into(),
            ..Default::default()
        };
        s.results.clear();
        s.progress = Some(progress.clone());
        s.cancel = Some(cancel.clone());
        s.scan_id += 1;
        (s.settings.template(), s.scan_id)
    };

    let app2 = app.clone();
    tokio::spawn(async move {
        let outcome = scanner::run_scan_with_shared(
            app2.prober.clone(),
            &hosts,
            &template,
            &app2.options,
            cancel.clone(),
            None,
            progress,
            |_| {},
        )
        .await;

        let mut s = app2.inner.write().await;
        // A newer scan replaced this one; leave its state alone.
        if s.scan_id != scan_id {
            if let Some(q) = outcome.auto_quality {
                q.cancel();
            }
            return;
        }
        s.status.completed = outcome.results.len() as u64;
        s.status.state = if outcome.cancelled { "stopped" } else { "done" }.into();
        s.status.report = report::best_range(&outcome.results).map(|r| r.to_string());
        s.results = outcome.results;
        s.progress = None;
        s.cancel = None;
        s.quality = outcome.auto_quality;
    });

    let status = Status {
        total,
        state: "running".into(),
        ..Default::default()
    };
    (StatusCode::ACCEPTED, Json(status)).into_response()
}

async fn post_stop(State(app): State<AppState>) -> impl IntoResponse {
    let s = app.inner.read().await;
    if let Some(c) = s.cancel.as_ref() {
        c.cancel();
    }
    if let Some(q) = s.quality.as_ref() {
        q.cancel();
    }
    StatusCode::NO_CONTENT
}

async fn post_quality_all(State(app): State<AppState>) -> impl IntoResponse {
    let mut s = app.inner.write().await;
    if s.progress.is_some() {
        return (StatusCode::CONFLICT, "scan still running").into_response();
    }
    if !s.results.iter().any(|r| r.success) {
        return (StatusCode::BAD_REQUEST, "no successful results").into_response();
    }
    if let Some(q) = s.quality.take() {
        q.cancel();
    }
    let run = quality::spawn_batch(
        app.prober.clone(),
        s.results.clone(),
        s.settings.template(),
        app.options.quality.clone(),
    );
    let total = run.total();
    s.quality = Some(run);
    (StatusCode::ACCEPTED, Json(serde_json::json!({ "targets": total }))).into_response()
}

async fn post_quality_one(
    State(app): State<AppState>,
    Path(host): Path<String>,
) -> impl IntoResponse {
    let (result, template) = {
        let s = app.inner.read().await;
        let Some(result) = s.results.iter().find(|r| r.host == host && r.success).cloned() else {
            return StatusCode::NOT_FOUND.into_response();
        };
        (result, s.settings.template())
    };
    if result.quality.is_busy() {
        return (StatusCode::CONFLICT, "quality test already running").into_response();
    }
    let prober = app.prober.clone();
    let options = app.options.quality.clone();
    tokio::spawn(async move {
        let cancel = CancellationToken::new();
        if quality::assess(prober.as_ref(), &result, &template, &options, &cancel)
            .await
            .is_none()
        {
            warn!(host = %result.host, "quality test did not run");
        }
    });
    StatusCode::ACCEPTED.into_response()
}

async fn get_export(State(app): State<AppState>) -> impl IntoResponse {
    let s = app.inner.read().await;
    uri::export_successes(&s.results, &s.settings)
}

async fn post_connect(
    State(app): State<AppState>,
    Path(host): Path<String>,
) -> impl IntoResponse {
    let mut s = app.inner.write().await;
    if s.session.connected_host.as_deref() == Some(host.as_str()) {
        s.session.connected_host = None;
        let body = ConnectResponse {
            connected_host: None,
            uri: None,
        };
        return (StatusCode::OK, Json(body)).into_response();
    }
    let Some(link) = s
        .results
        .iter()
        .find(|r| r.host == host)
        .and_then(|r| uri::build_uri(r, &s.settings))
    else {
        return StatusCode::NOT_FOUND.into_response();
    };
    s.session.connected_host = Some(host);
    let body = ConnectResponse {
        connected_host: s.session.connected_host.clone(),
        uri: Some(link),
    };
    (StatusCode::OK, Json(body)).into_response()
}

async fn get_settings(State(app): State<AppState>) -> impl IntoResponse {
    let s = app.inner.read().await;
    Json(s.settings.clone())
}

async fn put_settings(
    State(app): State<AppState>,
    Json(settings): Json<Settings>,
) -> impl IntoResponse {
    let settings = settings.trimmed();
    if let Some(path) = app.settings_path.as_deref() {
        if let Err(e) = settings.save(path) {
            warn!(error = %e, "failed to persist settings");
            return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
        }
    }
    app.inner.write().await.settings = settings.clone();
    (StatusCode::OK, Json(settings)).into_response()
}
