//! Driver configuration file: vCenter connection, one clone request and the
//! rollback policy. YAML or JSON, picked by file extension.

use anyhow::{bail, Context};
use serde::Deserialize;
use std::path::Path;
use vclone::types::VsphereConfig;
use vclone::CloneRequest;

/// Environment variable that overrides `connection.password`.
pub const PASSWORD_ENV: &str = "VCLONE_PASSWORD";

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriverConfig {
    pub connection: VsphereConfig,
    pub request: CloneRequest,
    /// Destroy the VM again when a create fails after cloning.
    #[serde(default)]
    pub rollback: bool,
}

impl DriverConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Reading config file {}", path.display()))?;
        let mut config = Self::parse(&text, path)?;
        if let Ok(password) = std::env::var(PASSWORD_ENV) {
            config.connection.password = password;
        }
        if config.connection.host.is_empty() {
            bail!("`connection.host` must be set in {}", path.display());
        }
        Ok(config)
    }

    fn parse(text: &str, path: &Path) -> anyhow::Result<Self> {
        let is_json = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("json"));
        let config = if is_json {
            serde_json::from_str(text).with_context(|| format!("Parsing {}", path.display()))?
        } else {
            serde_yaml::from_str(text).with_context(|| format!("Parsing {}", path.display()))?
        };
        Ok(config)
    }
}
