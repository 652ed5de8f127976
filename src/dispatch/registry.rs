use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::{FutureExt, Stream, StreamExt};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::dispatch::http::HttpDispatch;
use crate::dispatch::{BackendRequest, ChatBackend, Delta, DeltaStream};
use crate::error::GustError;

/// Max concurrent upstream streams per gateway instance.
const HTTP_MAX_CONCURRENT: usize = 8;

/// How long a request may queue for an upstream slot before the candidate fails.
const PERMIT_TIMEOUT: Duration = Duration::from_secs(30);

/// One OpenAI-compatible upstream.
#[derive(Clone)]
pub struct ProviderEntry {
    pub name: String,
    /// Full chat-completions URL.
    pub base_url: String,
    pub api_key: Option<String>,
    /// Models this provider serves. Empty means it accepts any model name.
    pub models: Vec<String>,
}

impl ProviderEntry {
    pub fn serves(&self, model: &str) -> bool {
        self.models.is_empty() || self.models.iter().any(|m| m == model)
    }
}

impl std::fmt::Debug for ProviderEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderEntry")
            .field("name", &self.name)
            .field("base_url", &self.base_url)
            .field(
                "api_key",
                &self.api_key.as_ref().map(|_| "[REDACTED]"),
            )
            .field("models", &self.models)
            .finish()
    }
}

/// Provider table plus the HTTP client that talks to them.
pub struct Registry {
    providers: Vec<ProviderEntry>,
    http: HttpDispatch,
    http_semaphore: Arc<Semaphore>,
}

impl Registry {
    pub fn new(providers: Vec<ProviderEntry>) -> Result<Self, GustError> {
        Ok(Self {
            providers,
            http: HttpDispatch::new()?,
            http_semaphore: Arc::new(Semaphore::new(HTTP_MAX_CONCURRENT)),
        })
    }

    /// Returns the number of free upstream slots (for testing).
    pub fn http_semaphore_permits(&self) -> usize {
        self.http_semaphore.available_permits()
    }

    pub fn providers(&self) -> &[ProviderEntry] {
        &self.providers
    }

    /// An explicit provider must exist; otherwise the first provider serving
    /// the model wins, in configuration order.
    pub fn resolve(
        &self,
        model: &str,
        provider: Option<&str>,
    ) -> Result<&ProviderEntry, GustError> {
        match provider {
            Some(name) => self
                .providers
                .iter()
                .find(|p| p.name == name)
                .ok_or_else(|| GustError::ProviderNotFound(name.to_string())),
            None => self
                .providers
                .iter()
                .find(|p| p.serves(model))
                .ok_or_else(|| GustError::ProviderNotFound(format!("no provider serves {model}"))),
        }
    }

    async fn acquire_permit(&self) -> Result<OwnedSemaphorePermit, GustError> {
        tokio::time::timeout(PERMIT_TIMEOUT, self.http_semaphore.clone().acquire_owned())
            .await
            .map_err(|_| GustError::Timeout(PERMIT_TIMEOUT.as_millis() as u64))?
            .map_err(|_| GustError::Other("semaphore closed".to_string()))
    }

    async fn open_stream(&self, req: &BackendRequest) -> Result<DeltaStream, GustError> {
        let entry = self.resolve(&req.model, req.provider.as_deref())?;
        let permit = self.acquire_permit().await?;
        let stream = self
            .http
            .open_stream(req, &entry.name, &entry.base_url, entry.api_key.as_deref())
            .await?;
        tracing::debug!(provider = %entry.name, model = %req.model, "upstream stream opened");
        Ok(Permitted {
            inner: stream,
            _permit: permit,
        }
        .boxed())
    }
}

impl ChatBackend for Registry {
    fn open<'a>(
        &'a self,
        req: &'a BackendRequest,
    ) -> BoxFuture<'a, Result<DeltaStream, GustError>> {
        self.open_stream(req).boxed()
    }
}

/// Holds an upstream slot for exactly as long as its stream is alive.
struct Permitted {
    inner: DeltaStream,
    _permit: OwnedSemaphorePermit,
}

impl Stream for Permitted {
    type Item = Result<Delta, GustError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().inner.poll_next_unpin(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str, models: &[&str]) -> ProviderEntry {
        ProviderEntry {
            name: name.to_string(),
            base_url: format!("http://127.0.0.1:1/{name}"),
            api_key: Some("secret".to_string()),
            models: models.iter().map(|m| m.to_string()).collect(),
        }
    }

    #[test]
    fn resolve_prefers_first_serving_provider() {
        let registry = Registry::new(vec![
            entry("a", &["gpt-4"]),
            entry("b", &[]),
            entry("c", &["gpt-4o"]),
        ])
        .unwrap();

        assert_eq!(registry.resolve("gpt-4", None).unwrap().name, "a");
        // "b" accepts anything and precedes "c"
        assert_eq!(registry.resolve("gpt-4o", None).unwrap().name, "b");
        assert_eq!(registry.resolve("gpt-4o", Some("c")).unwrap().name, "c");
    }

    #[test]
    fn resolve_unknown_provider_fails() {
        let registry = Registry::new(vec![entry("a", &["gpt-4"])]).unwrap();
        assert!(matches!(
            registry.resolve("gpt-4", Some("zzz")),
            Err(GustError::ProviderNotFound(_))
        ));
        assert!(matches!(
            registry.resolve("mistral-7b", None),
            Err(GustError::ProviderNotFound(_))
        ));
    }

    #[test]
    fn providers_keep_configuration_order() {
        let registry = Registry::new(vec![entry("z", &[]), entry("a", &[])]).unwrap();
        let names: Vec<&str> = registry.providers().iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["z", "a"]);
    }

    #[test]
    fn debug_redacts_api_key() {
        let rendered = format!("{:?}", entry("a", &[]));
        assert!(rendered.contains("[REDACTED]"));
        assert!(!rendered.contains("secret"));
    }
}
