pub mod http;
pub mod registry;

use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::error::GustError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// One conversation turn as received on the inbound endpoint and forwarded upstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

/// Token counters reported by a backend, usually on the final delta only.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

/// One incremental unit of backend output. Every field is optional: a delta
/// may carry only a model name, only usage, or nothing at all.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Delta {
    pub text: Option<String>,
    pub model: Option<String>,
    pub usage: Option<Usage>,
}

impl Delta {
    pub fn text(fragment: impl Into<String>) -> Self {
        Self {
            text: Some(fragment.into()),
            ..Self::default()
        }
    }

    pub fn usage(usage: Usage) -> Self {
        Self {
            usage: Some(usage),
            ..Self::default()
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// The text fragment, if present and non-empty.
    pub fn fragment(&self) -> Option<&str> {
        self.text.as_deref().filter(|t| !t.is_empty())
    }
}

/// Lazy, finite, non-restartable delta sequence. Ends with `None` on success;
/// an `Err` item means the backend failed mid-stream. Dropping the stream
/// releases whatever connection backs it.
pub type DeltaStream = BoxStream<'static, Result<Delta, GustError>>;

/// What the orchestrator asks a backend to run.
#[derive(Debug, Clone)]
pub struct BackendRequest {
    pub model: String,
    pub provider: Option<String>,
    pub messages: Vec<ChatMessage>,
}

/// The model-invocation capability the fallback controller drives.
///
/// `open` resolves once the backend has accepted the request; output then
/// arrives through the returned stream. Either step may fail, and both count
/// as a failure of the candidate being attempted.
pub trait ChatBackend: Send + Sync {
    fn open<'a>(
        &'a self,
        req: &'a BackendRequest,
    ) -> BoxFuture<'a, Result<DeltaStream, GustError>>;
}
