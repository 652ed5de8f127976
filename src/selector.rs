use std::collections::HashSet;
use std::fmt;

use crate::error::GustError;
use crate::mode::{ModeSnapshot, OperatingMode};

/// A (model, optional provider) pair the orchestrator may attempt.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Candidate {
    pub model: String,
    /// `None` lets the backend pick a provider itself.
    pub provider: Option<String>,
}

impl Candidate {
    pub fn new(model: impl Into<String>, provider: Option<String>) -> Self {
        Self {
            model: model.into(),
            provider,
        }
    }
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.provider {
            Some(provider) => write!(f, "{provider}/{}", self.model),
            None => f.write_str(&self.model),
        }
    }
}

/// Build the ordered attempt list for one request.
///
/// Manual mode yields exactly one candidate and never falls back to a list;
/// a missing model is a configuration error. Auto modes yield their list in
/// order with repeated (model, provider) pairs dropped.
pub fn select_candidates(snapshot: &ModeSnapshot) -> Result<Vec<Candidate>, GustError> {
    let list = match snapshot.mode {
        OperatingMode::Manual => {
            let model = snapshot
                .manual
                .model
                .as_deref()
                .map(str::trim)
                .filter(|m| !m.is_empty())
                .ok_or_else(|| {
                    GustError::Configuration("manual mode selected but no model is set".to_string())
                })?;
            let provider = snapshot
                .manual
                .provider
                .as_deref()
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(str::to_string);
            return Ok(vec![Candidate::new(model, provider)]);
        }
        OperatingMode::Auto => &snapshot.lists.auto,
        OperatingMode::AutoPlus => &snapshot.lists.auto_plus,
    };

    let mut seen = HashSet::new();
    let candidates: Vec<Candidate> = list
        .iter()
        .map(|m| m.trim())
        .filter(|m| !m.is_empty())
        .map(|m| Candidate::new(m, None))
        .filter(|c| seen.insert(c.clone()))
        .collect();

    if candidates.is_empty() {
        return Err(GustError::Configuration(format!(
            "{} priority list is empty",
            snapshot.mode
        )));
    }

    Ok(candidates)
}
