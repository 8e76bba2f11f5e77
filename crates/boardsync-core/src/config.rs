use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, anyhow};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::gateway::RemoteConfig;
use crate::loader::{Backoff, LoadOptions};
use crate::model::PlanLimits;
use crate::session::SessionOptions;

const CONFIG_ENV: &str = "BOARDSYNC_CONFIG";
const TOKEN_ENV: &str = "BOARDSYNC_ACCESS_TOKEN";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    pub remote: RemoteSection,
    pub loader: LoaderSection,
    pub limits: LimitsSection,
    pub storage: StorageSection,
    pub billing: BillingSection,
    #[serde(skip)]
    pub loaded_files: Vec<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct RemoteSection {
    pub url: String,
    pub api_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub verify_with_billing: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoaderSection {
    pub max_retries: u32,
    pub timeout_ms: u64,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
}

impl Default for LoaderSection {
    fn default() -> Self {
        Self {
            max_retries: 3,
            timeout_ms: 10_000,
            backoff_base_ms: 250,
            backoff_max_ms: 4_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LimitsSection {
    pub free: u32,
    /// Absent means unlimited.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pro: Option<u32>,
}

impl Default for LimitsSection {
    fn default() -> Self {
        let limits = PlanLimits::default();
        Self {
            free: limits.free,
            pro: limits.pro,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StorageSection {
    pub avatar_bucket: String,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            avatar_bucket: "avatars".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BillingSection {
    pub return_url: String,
}

impl Default for BillingSection {
    fn default() -> Self {
        Self {
            return_url: "http://localhost:8080/settings".to_string(),
        }
    }
}

impl Config {
    #[tracing::instrument(skip(config_override))]
    pub fn load(config_override: Option<&Path>) -> anyhow::Result<Self> {
        let mut cfg = match resolve_config_path(config_override)? {
            Some(path) => {
                info!(config = %path.display(), "loading config");
                Self::load_file(&path)?
            }
            None => {
                warn!("no config file found; using defaults");
                Self::default()
            }
        };

        if let Ok(token) = std::env::var(TOKEN_ENV)
            && !token.trim().is_empty()
        {
            debug!("access token taken from environment");
            cfg.remote.access_token = Some(token.trim().to_string());
        }

        Ok(cfg)
    }

    fn load_file(path: &Path) -> anyhow::Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let mut cfg: Config = toml::from_str(&text)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        cfg.loaded_files.push(path.to_path_buf());
        Ok(cfg)
    }

    /// Applies `section.key=value` overrides. Values parse as TOML scalars
    /// when they can and fall back to plain strings.
    #[tracing::instrument(skip(self, overrides))]
    pub fn apply_overrides<I>(&mut self, overrides: I) -> anyhow::Result<()>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut root = toml::Value::try_from(&*self).context("failed to snapshot config")?;

        for (key, raw) in overrides {
            let (section, field) = key
                .split_once('.')
                .ok_or_else(|| anyhow!("override key must look like section.key, got: {key}"))?;
            debug!(key = %key, value = %raw, "applying override");

            let table = root
                .as_table_mut()
                .ok_or_else(|| anyhow!("config root is not a table"))?
                .entry(section.trim())
                .or_insert_with(|| toml::Value::Table(toml::Table::new()));
            let table = table
                .as_table_mut()
                .ok_or_else(|| anyhow!("config section {section} is not a table"))?;
            let field = field.trim().to_string();
            let raw_string = toml::Value::String(raw.trim().to_string());
            let value = parse_override_value(&raw);
            if value.is_str() || table.get(&field).is_some_and(toml::Value::is_str) {
                table.insert(field, raw_string);
                continue;
            }

            let was_set = table.insert(field.clone(), value).is_some();
            // Unset optional strings are absent from the snapshot; retry as text.
            if !was_set && root.clone().try_into::<Config>().is_err() {
                if let Some(table) = root
                    .get_mut(section.trim())
                    .and_then(toml::Value::as_table_mut)
                {
                    table.insert(field, raw_string);
                }
            }
        }

        let loaded_files = std::mem::take(&mut self.loaded_files);
        *self = root
            .try_into()
            .context("config overrides produced an invalid config")?;
        self.loaded_files = loaded_files;
        Ok(())
    }

    pub fn remote_config(&self) -> RemoteConfig {
        RemoteConfig {
            url: self.remote.url.clone(),
            api_key: self.remote.api_key.clone(),
            access_token: self.remote.access_token.clone(),
        }
    }

    pub fn user_id(&self) -> anyhow::Result<Uuid> {
        let raw = self
            .remote
            .user_id
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| anyhow!("remote.user_id is not configured; sign in first"))?;
        Uuid::parse_str(raw).with_context(|| format!("remote.user_id is not a uuid: {raw}"))
    }

    pub fn load_options(&self) -> LoadOptions {
        LoadOptions {
            max_retries: self.loader.max_retries,
            timeout: Duration::from_millis(self.loader.timeout_ms),
            backoff: Backoff {
                base: Duration::from_millis(self.loader.backoff_base_ms),
                max: Duration::from_millis(self.loader.backoff_max_ms),
            },
        }
    }

    pub fn plan_limits(&self) -> PlanLimits {
        PlanLimits {
            free: self.limits.free,
            pro: self.limits.pro,
        }
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            limits: self.plan_limits(),
            verify_with_billing: self.remote.verify_with_billing,
        }
    }
}

fn parse_override_value(raw: &str) -> toml::Value {
    let trimmed = raw.trim();
    match toml::from_str::<toml::Table>(&format!("v = {trimmed}")) {
        Ok(mut table) => table
            .remove("v")
            .unwrap_or_else(|| toml::Value::String(trimmed.to_string())),
        Err(_) => toml::Value::String(trimmed.to_string()),
    }
}

#[tracing::instrument(skip(override_path))]
fn resolve_config_path(override_path: Option<&Path>) -> anyhow::Result<Option<PathBuf>> {
    if let Some(path) = override_path {
        return Ok(Some(path.to_path_buf()));
    }

    if let Ok(env_path) = std::env::var(CONFIG_ENV) {
        if env_path == "/dev/null" || env_path.trim().is_empty() {
            return Ok(None);
        }
        return Ok(Some(PathBuf::from(env_path)));
    }

    let Some(config_dir) = dirs::config_dir() else {
        warn!("cannot determine config directory");
        return Ok(None);
    };
    let candidate = config_dir.join("boardsync").join("config.toml");
    if candidate.exists() {
        return Ok(Some(candidate));
    }

    Ok(None)
}
