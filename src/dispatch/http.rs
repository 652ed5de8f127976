use std::time::Duration;

use eventsource_stream::Eventsource;
use futures_util::future;
use futures_util::StreamExt;
use reqwest::Client;
use serde::Deserialize;

use crate::dispatch::{BackendRequest, Delta, DeltaStream, Usage};
use crate::error::GustError;

pub const MAX_RESPONSE_BYTES: usize = 2 * 1024 * 1024; // 2MB

/// Marker payload that closes an OpenAI-style event stream.
const DONE_MARKER: &str = "[DONE]";

/// OpenAI-compatible streaming chat client.
pub struct HttpDispatch {
    client: Client,
}

#[derive(Deserialize)]
struct ChunkPayload {
    model: Option<String>,
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct ChunkChoice {
    delta: Option<ChunkDelta>,
}

#[derive(Deserialize)]
struct ChunkDelta {
    content: Option<String>,
}

impl HttpDispatch {
    pub fn new() -> Result<Self, GustError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(4)
            .build()?;

        Ok(Self { client })
    }

    /// Send a streaming chat request and return its deltas.
    ///
    /// Resolves once response headers arrive with a success status. Body reads
    /// happen lazily as the caller pulls from the returned stream; dropping the
    /// stream closes the connection.
    pub async fn open_stream(
        &self,
        req: &BackendRequest,
        provider: &str,
        base_url: &str,
        api_key: Option<&str>,
    ) -> Result<DeltaStream, GustError> {
        let body = serde_json::json!({
            "model": req.model,
            "messages": req.messages,
            "stream": true,
            "stream_options": {"include_usage": true},
        });

        let mut request = self
            .client
            .post(base_url)
            .header("Content-Type", "application/json")
            .header("Accept", "text/event-stream")
            .json(&body);
        if let Some(key) = api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await?;
        let status = response.status();

        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(GustError::RateLimited {
                provider: provider.to_string(),
            });
        }

        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN
        {
            return Err(GustError::AuthFailed {
                provider: provider.to_string(),
                message: format!("{status}"),
            });
        }

        if !status.is_success() {
            let text = read_error_body(response, provider, MAX_RESPONSE_BYTES).await;
            return Err(GustError::Upstream {
                provider: provider.to_string(),
                message: format!("{status}: {text}"),
                status: Some(status.as_u16()),
            });
        }

        let provider = provider.to_string();
        let deltas = response
            .bytes_stream()
            .eventsource()
            .take_while(|event| {
                future::ready(!matches!(event, Ok(e) if e.data.trim() == DONE_MARKER))
            })
            .filter_map(move |event| {
                let item = match event {
                    Ok(e) => parse_chunk(&e.data).transpose(),
                    Err(e) => Some(Err(GustError::Stream(format!(
                        "{provider} event stream failed: {e}"
                    )))),
                };
                future::ready(item)
            });

        Ok(deltas.boxed())
    }
}

/// Read an error body chunk by chunk, stopping once `cap` bytes are held.
/// The rest of the body is never read; dropping the response closes it.
async fn read_error_body(mut response: reqwest::Response, provider: &str, cap: usize) -> String {
    let mut buf: Vec<u8> = Vec::new();
    while buf.len() < cap {
        match response.chunk().await {
            Ok(Some(chunk)) => {
                let room = cap - buf.len();
                buf.extend_from_slice(&chunk[..chunk.len().min(room)]);
            }
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(provider, "failed to read upstream error body: {e}");
                break;
            }
        }
    }
    String::from_utf8_lossy(&buf).into_owned()
}

/// Decode one `data:` payload. Blank payloads (keep-alives) yield `None`.
pub fn parse_chunk(data: &str) -> Result<Option<Delta>, GustError> {
    let data = data.trim();
    if data.is_empty() {
        return Ok(None);
    }

    let chunk: ChunkPayload = serde_json::from_str(data)
        .map_err(|e| GustError::Stream(format!("failed to parse stream chunk: {e}")))?;

    let text = chunk
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.delta)
        .and_then(|d| d.content);

    Ok(Some(Delta {
        text,
        model: chunk.model.filter(|m| !m.is_empty()),
        usage: chunk.usage,
    }))
}
