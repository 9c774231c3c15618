//! Connection URI handed to an external client for a working endpoint.

use crate::config::Settings;
use crate::types::ScanResult;
use anyhow::{anyhow, bail, Context, Result};
use url::form_urlencoded;
use url::Url;

pub const URI_SCHEME: &str = "vless";
const FALLBACK_PORT: u16 = 443;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionUri {
    pub identifier: String,
    pub host: String,
    pub port: u16,
    pub sni: String,
    pub path: String,
    pub label: String,
}

impl ConnectionUri {
    /// Build the URI fields for a successful result; `None` for failures.
    ///
    /// The label is the quality tier once assessed, the stability tier otherwise.
    pub fn for_result(result: &ScanResult, settings: &Settings) -> Option<Self> {
        if !result.success {
            return None;
        }
        let label = match result.quality.snapshot().tier {
            Some(tier) => tier.to_string(),
            None => result.stability.to_string(),
        };
        Some(Self {
            identifier: settings.uuid.clone(),
            host: result.host.clone(),
            port: result.primary_port().unwrap_or(FALLBACK_PORT),
            sni: settings.sni.clone(),
            path: settings.path.clone(),
            label,
        })
    }

    pub fn to_uri_string(&self) -> String {
        let path: String = form_urlencoded::byte_serialize(self.path.as_bytes()).collect();
        format!(
            "{scheme}://{id}@{host}:{port}?encryption=none&flow=none&type=ws&host={sni}\
             &headerType=none&path={path}&security=tls&fp=chrome&sni={sni}#{label}-{host}",
            scheme = URI_SCHEME,
            id = self.identifier,
            host = self.host,
            port = self.port,
            sni = self.sni,
            label = self.label,
        )
    }

    /// Recover the structural fields from a URI produced by [`to_uri_string`].
    ///
    /// [`to_uri_string`]: ConnectionUri::to_uri_string
    pub fn parse(input: &str) -> Result<Self> {
        let url = Url::parse(input.trim()).context("invalid connection URI")?;
        if url.scheme() != URI_SCHEME {
            bail!("unsupported scheme: {}", url.scheme());
        }
        let host = url
            .host_str()
            .ok_or_else(|| anyhow!("connection URI has no host"))?
            .to_string();
        let port = url.port().unwrap_or(FALLBACK_PORT);

        let mut sni = String::new();
        let mut path = String::new();
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "sni" => sni = value.into_owned(),
                "host" if sni.is_empty() => sni = value.into_owned(),
                "path" => path = value.into_owned(),
                _ => {}
            }
        }

        let suffix = format!("-{host}");
        let label = url
            .fragment()
            .map(|f| f.strip_suffix(&suffix).unwrap_or(f).to_string())
            .unwrap_or_default();

        Ok(Self {
            identifier: url.username().to_string(),
            host,
            port,
            sni,
            path,
            label,
        })
    }
}

pub fn build_uri(result: &ScanResult, settings: &Settings) -> Option<String> {
    ConnectionUri::for_result(result, settings).map(|u| u.to_uri_string())
}

/// One URI per successful result, newline separated.
pub fn export_successes(results: &[ScanResult], settings: &Settings) -> String {
    results
        .iter()
        .filter_map(|r| build_uri(r, settings))
        .collect::<Vec<_>>()
        .join("\n")
}
