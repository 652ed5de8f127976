use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::error::GustError;

/// How the gateway picks backends for a request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperatingMode {
    /// One operator-chosen model, optionally pinned to a provider.
    #[serde(alias = "Manual")]
    Manual,
    /// General-purpose priority list.
    #[serde(alias = "Auto")]
    Auto,
    /// Higher-capability priority list.
    #[default]
    #[serde(alias = "AUTO+", alias = "auto+")]
    AutoPlus,
}

impl OperatingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Auto => "auto",
            Self::AutoPlus => "auto_plus",
        }
    }
}

impl fmt::Display for OperatingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperatingMode {
    type Err = GustError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "manual" | "Manual" => Ok(Self::Manual),
            "auto" | "Auto" => Ok(Self::Auto),
            "auto_plus" | "auto+" | "AUTO+" => Ok(Self::AutoPlus),
            other => Err(GustError::Configuration(format!(
                "unknown mode '{other}' (expected manual, auto or auto_plus)"
            ))),
        }
    }
}

/// Operator's explicit model/provider pick for Manual mode.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManualChoice {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub provider: Option<String>,
}

/// The two fixed fallback lists. Read-only once the process is up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriorityLists {
    pub auto: Vec<String>,
    pub auto_plus: Vec<String>,
}

impl Default for PriorityLists {
    fn default() -> Self {
        Self {
            auto: DEFAULT_AUTO_MODELS.iter().map(|m| m.to_string()).collect(),
            auto_plus: DEFAULT_AUTO_PLUS_MODELS
                .iter()
                .map(|m| m.to_string())
                .collect(),
        }
    }
}

pub const DEFAULT_AUTO_MODELS: &[&str] = &[
    "gpt-3.5-turbo",
    "gpt-4",
    "Llama3-8b-chat",
    "gemini",
    "mistral-7b",
];

pub const DEFAULT_AUTO_PLUS_MODELS: &[&str] = &[
    "gpt-4o",
    "gpt-4-turbo",
    "gpt-4",
    "claude-3-opus",
    "gemini-pro",
    "deepseek-v3",
    "Llama3-70b-chat",
];

/// Mode state as the operator sets it. Also the wire shape of `/v1/mode`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModeSettings {
    pub mode: OperatingMode,
    #[serde(default)]
    pub manual: ManualChoice,
}

/// Everything candidate selection needs, captured once at request entry.
/// Later operator changes never reach a request that already holds one.
#[derive(Debug, Clone)]
pub struct ModeSnapshot {
    pub mode: OperatingMode,
    pub manual: ManualChoice,
    pub lists: Arc<PriorityLists>,
}

/// Process-wide mode source. Written only by explicit operator action
/// (startup config, `PUT /v1/mode`); request handlers only take snapshots.
pub struct ModeStore {
    settings: RwLock<ModeSettings>,
    lists: Arc<PriorityLists>,
}

impl ModeStore {
    pub fn new(settings: ModeSettings, lists: PriorityLists) -> Self {
        Self {
            settings: RwLock::new(settings),
            lists: Arc::new(lists),
        }
    }

    pub fn snapshot(&self) -> ModeSnapshot {
        let settings = self.settings();
        ModeSnapshot {
            mode: settings.mode,
            manual: settings.manual,
            lists: self.lists.clone(),
        }
    }

    pub fn settings(&self) -> ModeSettings {
        // A poisoned lock still holds a fully written value; settings are
        // replaced wholesale, never partially mutated.
        match self.settings.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn replace(&self, settings: ModeSettings) {
        tracing::info!(
            mode = %settings.mode,
            manual_model = settings.manual.model.as_deref().unwrap_or("-"),
            manual_provider = settings.manual.provider.as_deref().unwrap_or("-"),
            "mode switched"
        );
        match self.settings.write() {
            Ok(mut guard) => *guard = settings,
            Err(poisoned) => *poisoned.into_inner() = settings,
        }
    }

    pub fn lists(&self) -> &PriorityLists {
        &self.lists
    }
}
