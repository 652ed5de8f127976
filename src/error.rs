use thiserror::Error;

#[derive(Debug, Error)]
pub enum GustError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("provider not found: {0}")]
    ProviderNotFound(String),

    #[error("timeout after {0}ms")]
    Timeout(u64),

    #[error("rate limited by {provider}")]
    RateLimited { provider: String },

    #[error("upstream error from {provider}: {message}")]
    Upstream {
        provider: String,
        message: String,
        status: Option<u16>,
    },

    #[error("auth failed for {provider}: {message}")]
    AuthFailed { provider: String, message: String },

    #[error("stream error: {0}")]
    Stream(String),

    #[error("{model} finished without producing output")]
    EmptyResponse { model: String },

    #[error("all {attempts} candidates failed")]
    AllCandidatesFailed { attempts: usize },

    #[error("cancelled")]
    Cancelled,

    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("config file error: {0}")]
    ConfigFile(String),

    #[error("{0}")]
    Other(String),
}

impl GustError {
    /// Upstream provider named by the failure, if any.
    pub fn provider(&self) -> Option<&str> {
        match self {
            Self::RateLimited { provider } => Some(provider),
            Self::Upstream { provider, .. } => Some(provider),
            Self::AuthFailed { provider, .. } => Some(provider),
            _ => None,
        }
    }

    /// HTTP status for errors that reach the endpoint. Only malformed client
    /// input is a 4xx; every other failure is the gateway's problem.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidRequest(_) => 400,
            _ => 500,
        }
    }

    /// Produce a sanitized error message safe for returning to HTTP clients.
    /// Does not leak internal URLs, connection details, or upstream error bodies.
    pub fn user_message(&self) -> String {
        match self {
            Self::InvalidRequest(msg) => msg.clone(),
            Self::Configuration(msg) => format!("gateway misconfigured: {msg}"),
            Self::ProviderNotFound(name) => format!("provider not found: {name}"),
            Self::Timeout(ms) => format!("request timed out after {ms}ms"),
            Self::RateLimited { provider } => format!("rate limited by {provider}"),
            Self::Upstream {
                provider, status, ..
            } => match status {
                Some(code) => format!("upstream error from {provider} (HTTP {code})"),
                None => format!("upstream error from {provider}"),
            },
            Self::AuthFailed { provider, .. } => format!("authentication failed for {provider}"),
            Self::Stream(_) => "failed to read provider stream".to_string(),
            Self::EmptyResponse { model } => format!("{model} returned no output"),
            Self::AllCandidatesFailed { .. } => {
                "Failed to generate a response from any provider.".to_string()
            }
            Self::Cancelled => "request cancelled".to_string(),
            Self::Request(_) => "request to provider failed".to_string(),
            Self::ConfigFile(msg) => format!("config file error: {msg}"),
            Self::Other(msg) => msg.clone(),
        }
    }
}
