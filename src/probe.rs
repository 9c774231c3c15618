//! One TLS + WebSocket-upgrade handshake against a single endpoint.

use crate::types::ProbeConfig;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::{self, Instant};
use tracing::debug;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(8);
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(8);

/// Placeholder key; the probe only checks the status line, never the accept hash.
const WEBSOCKET_KEY: &str = "dGhlIHNhbXBsZSBub25jZQ==";
const MAX_STATUS_LINE: u64 = 1024;

/// Why a probe failed. Only logged; callers see a plain miss.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("connect timed out")]
    ConnectTimeout,

    #[error("connect failed: {0}")]
    Connect(#[source] std::io::Error),

    #[error("TLS handshake failed: {0}")]
    Tls(#[from] native_tls::Error),

    #[error("timed out waiting for {0}")]
    ReadTimeout(&'static str),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("upgrade rejected: {0:?}")]
    Rejected(String),
}

/// Something that can run a handshake probe. The network implementation is
/// [`HandshakeProber`]; tests substitute scripted ones.
#[async_trait]
pub trait Prober: Send + Sync + 'static {
    /// Elapsed milliseconds on a verified upgrade, `None` on any failure.
    async fn probe(&self, config: &ProbeConfig) -> Option<u64>;
}

/// Plain functions are probers too, which keeps offline stubs short.
#[async_trait]
impl<F> Prober for F
where
    F: Fn(&ProbeConfig) -> Option<u64> + Send + Sync + 'static,
{
    async fn probe(&self, config: &ProbeConfig) -> Option<u64> {
        self(config)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ProbeTimeouts {
    pub connect: Duration,
    pub read: Duration,
}

impl Default for ProbeTimeouts {
    fn default() -> Self {
        Self {
            connect: DEFAULT_CONNECT_TIMEOUT,
            read: DEFAULT_READ_TIMEOUT,
        }
    }
}

/// Real prober: TCP connect, TLS with SNI and `http/1.1` ALPN, then an HTTP
/// upgrade request whose first response line must contain `101`.
#[derive(Clone)]
pub struct HandshakeProber {
    connector: tokio_native_tls::TlsConnector,
    timeouts: ProbeTimeouts,
}

impl HandshakeProber {
    pub fn new(timeouts: ProbeTimeouts, accept_invalid_certs: bool) -> Result<Self> {
        let connector = native_tls::TlsConnector::builder()
            .request_alpns(&["http/1.1"])
            .danger_accept_invalid_certs(accept_invalid_certs)
            .build()
            .context("failed to build TLS connector")?;
        Ok(Self {
            connector: tokio_native_tls::TlsConnector::from(connector),
            timeouts,
        })
    }

    /// Run the handshake and report the typed outcome. The stream is owned by
    /// this function, so the socket is closed on every return path.
    pub async fn handshake(&self, config: &ProbeConfig) -> Result<u64, ProbeError> {
        let start = Instant::now();
        let tcp = time::timeout(
            self.timeouts.connect,
            TcpStream::connect((config.address.as_str(), config.port)),
        )
        .await
        .map_err(|_| ProbeError::ConnectTimeout)?
        .map_err(ProbeError::Connect)?;

        let mut tls = time::timeout(
            self.timeouts.read,
            self.connector.connect(&config.host_name, tcp),
        )
        .await
        .map_err(|_| ProbeError::ReadTimeout("TLS handshake"))??;

        let request = upgrade_request(&config.path, &config.host_name);
        time::timeout(self.timeouts.read, tls.write_all(request.as_bytes()))
            .await
            .map_err(|_| ProbeError::ReadTimeout("request write"))??;

        let mut line = String::new();
        {
            let mut reader = BufReader::new(&mut tls).take(MAX_STATUS_LINE);
            time::timeout(self.timeouts.read, reader.read_line(&mut line))
                .await
                .map_err(|_| ProbeError::ReadTimeout("status line"))??;
        }

        if !is_upgrade_status(&line) {
            return Err(ProbeError::Rejected(line.trim_end().to_string()));
        }
        let elapsed = start.elapsed().as_millis() as u64;
        close_within(&mut tls, self.timeouts.read).await;
        Ok(elapsed)
    }
}

#[async_trait]
impl Prober for HandshakeProber {
    async fn probe(&self, config: &ProbeConfig) -> Option<u64> {
        match self.handshake(config).await {
            Ok(ms) => Some(ms),
            Err(e) => {
                debug!(address = %config.address, port = config.port, error = %e, "probe failed");
                None
            }
        }
    }
}

/// Best-effort close that never outlives `limit`.
async fn close_within<S: AsyncWrite + Unpin>(stream: &mut S, limit: Duration) {
    if time::timeout(limit, stream.shutdown()).await.is_err() {
        debug!("close timed out");
    }
}

/// Minimal HTTP/1.1 request asking for a WebSocket upgrade.
pub fn upgrade_request(path: &str, host_name: &str) -> String {
    let path = if path.is_empty() { "/" } else { path };
    format!(
        "GET {path} HTTP/1.1\r\n\
         Host: {host_name}\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: {WEBSOCKET_KEY}\r\n\
         Sec-WebSocket-Version: 13\r\n\
         \r\n"
    )
}

/// Success is strictly "the first line mentions 101".
pub fn is_upgrade_status(line: &str) -> bool {
    line.contains("101")
}
