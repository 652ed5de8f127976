use std::env;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::dispatch::registry::ProviderEntry;
use crate::error::GustError;
use crate::mode::{ManualChoice, ModeSettings, OperatingMode, PriorityLists};

pub const DEFAULT_LISTEN: &str = "127.0.0.1:1337";
pub const DEFAULT_CONFIG_FILE: &str = "gust.toml";

/// Default wait for a candidate to open and produce its first delta.
pub const DEFAULT_FIRST_DELTA_TIMEOUT_SECS: u64 = 90;
/// Default maximum gap between two deltas of one candidate.
pub const DEFAULT_STALL_TIMEOUT_SECS: u64 = 60;

/// What the SSE path does with deltas from a candidate that has not finished yet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamPolicy {
    /// Forward each delta the moment it arrives. A candidate that fails after
    /// emitting leaves its fragments in the stream, followed by the next
    /// candidate's output.
    #[default]
    PassThrough,
    /// Hold a candidate's deltas until its sequence completes; discard them if
    /// it fails. Clients see nothing until a candidate has fully succeeded.
    BufferUntilSuccess,
}

/// Per-candidate bounds and streaming behavior for the fallback controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FallbackSettings {
    pub first_delta_timeout: Duration,
    pub stall_timeout: Duration,
    pub stream_policy: StreamPolicy,
}

impl Default for FallbackSettings {
    fn default() -> Self {
        Self {
            first_delta_timeout: Duration::from_secs(DEFAULT_FIRST_DELTA_TIMEOUT_SECS),
            stall_timeout: Duration::from_secs(DEFAULT_STALL_TIMEOUT_SECS),
            stream_policy: StreamPolicy::PassThrough,
        }
    }
}

pub struct Config {
    pub listen: SocketAddr,
    pub mode: ModeSettings,
    pub lists: PriorityLists,
    pub fallback: FallbackSettings,
    pub providers: Vec<ProviderEntry>,
}

#[derive(Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    listen: Option<String>,
    mode: Option<OperatingMode>,
    manual: Option<ManualChoice>,
    auto_models: Option<Vec<String>>,
    auto_plus_models: Option<Vec<String>>,
    #[serde(default)]
    fallback: FallbackFile,
    #[serde(default)]
    providers: Vec<ProviderFile>,
}

#[derive(Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct FallbackFile {
    first_delta_timeout_secs: Option<u64>,
    stall_timeout_secs: Option<u64>,
    stream_policy: Option<StreamPolicy>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct ProviderFile {
    name: String,
    base_url: String,
    api_key_env: Option<String>,
    #[serde(default)]
    models: Vec<String>,
}

impl Config {
    /// Load from `$GUST_CONFIG`, else `./gust.toml` if present, else defaults;
    /// then apply `GUST_*` environment overrides.
    pub fn load() -> Result<Self, GustError> {
        let path = match env::var("GUST_CONFIG") {
            Ok(p) => Some(PathBuf::from(p)),
            Err(_) => {
                let default = PathBuf::from(DEFAULT_CONFIG_FILE);
                default.exists().then_some(default)
            }
        };

        let mut config = match path {
            Some(path) => Self::from_path(&path)?,
            None => {
                tracing::info!("no config file found, using built-in defaults");
                Self::from_toml_str("", |name| env::var(name).ok())?
            }
        };
        config.apply_overrides(|name| env::var(name).ok())?;

        if config.providers.is_empty() {
            tracing::error!("no providers configured; every request will fail");
        }

        Ok(config)
    }

    pub fn from_path(path: &Path) -> Result<Self, GustError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| GustError::ConfigFile(format!("{}: {e}", path.display())))?;
        tracing::info!(path = %path.display(), "loading config");
        Self::from_toml_str(&raw, |name| env::var(name).ok())
    }

    /// Parse a TOML document. `lookup` resolves provider API key variables.
    pub fn from_toml_str(
        raw: &str,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, GustError> {
        let file: ConfigFile =
            toml::from_str(raw).map_err(|e| GustError::ConfigFile(e.to_string()))?;

        let listen = parse_listen(file.listen.as_deref().unwrap_or(DEFAULT_LISTEN))?;

        let defaults = PriorityLists::default();
        let lists = PriorityLists {
            auto: file.auto_models.unwrap_or(defaults.auto),
            auto_plus: file.auto_plus_models.unwrap_or(defaults.auto_plus),
        };

        let fallback = FallbackSettings {
            first_delta_timeout: Duration::from_secs(
                file.fallback
                    .first_delta_timeout_secs
                    .unwrap_or(DEFAULT_FIRST_DELTA_TIMEOUT_SECS),
            ),
            stall_timeout: Duration::from_secs(
                file.fallback
                    .stall_timeout_secs
                    .unwrap_or(DEFAULT_STALL_TIMEOUT_SECS),
            ),
            stream_policy: file.fallback.stream_policy.unwrap_or_default(),
        };
        if fallback.first_delta_timeout.is_zero() || fallback.stall_timeout.is_zero() {
            return Err(GustError::ConfigFile(
                "fallback timeouts must be greater than zero".to_string(),
            ));
        }

        let mut providers = Vec::with_capacity(file.providers.len());
        for p in file.providers {
            if providers.iter().any(|e: &ProviderEntry| e.name == p.name) {
                return Err(GustError::ConfigFile(format!(
                    "duplicate provider name: {}",
                    p.name
                )));
            }
            let api_key = match p.api_key_env {
                Some(var) => match lookup(&var) {
                    Some(key) => Some(key),
                    None => {
                        tracing::warn!(provider = %p.name, "{var} not set, provider unavailable");
                        continue;
                    }
                },
                None => None,
            };
            providers.push(ProviderEntry {
                name: p.name,
                base_url: p.base_url,
                api_key,
                models: p.models,
            });
        }

        Ok(Config {
            listen,
            mode: ModeSettings {
                mode: file.mode.unwrap_or_default(),
                manual: file.manual.unwrap_or_default(),
            },
            lists,
            fallback,
            providers,
        })
    }

    /// Apply `GUST_LISTEN`, `GUST_MODE`, `GUST_MANUAL_MODEL`, `GUST_MANUAL_PROVIDER`.
    pub fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), GustError> {
        if let Some(listen) = lookup("GUST_LISTEN") {
            self.listen = parse_listen(&listen)?;
        }
        if let Some(mode) = lookup("GUST_MODE") {
            self.mode.mode = mode.parse()?;
        }
        if let Some(model) = lookup("GUST_MANUAL_MODEL") {
            self.mode.manual.model = Some(model);
        }
        if let Some(provider) = lookup("GUST_MANUAL_PROVIDER") {
            self.mode.manual.provider = Some(provider);
        }
        Ok(())
    }
}

fn parse_listen(raw: &str) -> Result<SocketAddr, GustError> {
    raw.parse()
        .map_err(|e| GustError::ConfigFile(format!("invalid listen address '{raw}': {e}")))
}
