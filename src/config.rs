use crate::types::ProbeTemplate;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

pub const DEFAULT_SETTINGS_PATH: &str = "ws-scan-settings.json";

/// Persisted user settings: SNI/host header, request path and the identifier
/// written into exported connection URIs.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(default)]
pub struct Settings {
    pub sni: String,
    pub path: String,
    pub uuid: String,
}

impl Settings {
    /// Read settings from `path`; a missing file yields empty settings.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read settings file: {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("invalid settings file: {}", path.display()))
    }

    /// Write trimmed settings to `path` as pretty JSON.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let body = serde_json::to_string_pretty(&self.trimmed())?;
        fs::write(path, body)
            .with_context(|| format!("failed to write settings file: {}", path.display()))
    }

    pub fn trimmed(&self) -> Self {
        Self {
            sni: self.sni.trim().to_string(),
            path: self.path.trim().to_string(),
            uuid: self.uuid.trim().to_string(),
        }
    }

    /// A scan needs at least the SNI; everything else may be blank.
    pub fn ensure_scannable(&self) -> Result<()> {
        if self.sni.trim().is_empty() {
            bail!("SNI is not set; pass --sni or save it in the settings file");
        }
        Ok(())
    }

    pub fn template(&self) -> ProbeTemplate {
        ProbeTemplate::new(self.path.trim(), self.sni.trim())
    }
}
