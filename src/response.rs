use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use uuid::Uuid;

use crate::aggregate::AggregatedResult;
use crate::dispatch::{Role, Usage};

/// Model label used before any delta has reported one (non-streaming).
pub const MODEL_PLACEHOLDER: &str = "gust";
/// Model label used before any delta has reported one (streaming).
pub const STREAM_MODEL_PLACEHOLDER: &str = "gust-stream";
/// Payload of the final SSE event.
pub const DONE_SENTINEL: &str = "[DONE]";

const OBJECT_COMPLETION: &str = "chat.completion";
const OBJECT_CHUNK: &str = "chat.completion.chunk";

/// Identity of one response, fixed at request entry and reused for every
/// chunk of a stream regardless of which candidate produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseMeta {
    pub id: String,
    pub created: u64,
}

impl ResponseMeta {
    pub fn new() -> Self {
        let created = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Self {
            id: format!("chatcmpl-{}", Uuid::new_v4().simple()),
            created,
        }
    }
}

impl Default for ResponseMeta {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Serialize)]
pub struct ChatCompletion {
    pub id: String,
    pub object: &'static str,
    pub created: u64,
    pub model: String,
    pub choices: Vec<CompletionChoice>,
    pub usage: Option<Usage>,
}

#[derive(Debug, Serialize)]
pub struct CompletionChoice {
    pub index: u32,
    pub message: CompletionMessage,
    pub finish_reason: &'static str,
}

#[derive(Debug, Serialize)]
pub struct CompletionMessage {
    pub role: Role,
    pub content: String,
}

#[derive(Debug, Serialize)]
pub struct ChatCompletionChunk<'a> {
    pub id: &'a str,
    pub object: &'static str,
    pub created: u64,
    pub model: &'a str,
    pub choices: [ChunkChoice<'a>; 1],
}

#[derive(Debug, Serialize)]
pub struct ChunkChoice<'a> {
    pub index: u32,
    pub delta: ChunkDelta<'a>,
    pub finish_reason: Option<&'static str>,
}

#[derive(Debug, Serialize)]
pub struct ChunkDelta<'a> {
    pub content: &'a str,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
}

impl ErrorBody {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            error: message.into(),
        }
    }
}

/// Wrap an aggregated result as a single-choice completion.
pub fn completion(meta: &ResponseMeta, result: AggregatedResult) -> ChatCompletion {
    ChatCompletion {
        id: meta.id.clone(),
        object: OBJECT_COMPLETION,
        created: meta.created,
        model: result.model,
        choices: vec![CompletionChoice {
            index: 0,
            message: CompletionMessage {
                role: Role::Assistant,
                content: result.text,
            },
            finish_reason: "stop",
        }],
        usage: result.usage,
    }
}

/// One content event of a stream.
pub fn chunk<'a>(
    meta: &'a ResponseMeta,
    model: &'a str,
    fragment: &'a str,
) -> ChatCompletionChunk<'a> {
    ChatCompletionChunk {
        id: &meta.id,
        object: OBJECT_CHUNK,
        created: meta.created,
        model,
        choices: [ChunkChoice {
            index: 0,
            delta: ChunkDelta { content: fragment },
            finish_reason: None,
        }],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meta_ids_are_unique_and_prefixed() {
        let a = ResponseMeta::new();
        let b = ResponseMeta::new();
        assert!(a.id.starts_with("chatcmpl-"));
        assert_ne!(a.id, b.id);
        assert!(a.created > 0);
    }

    #[test]
    fn completion_shape() {
        let meta = ResponseMeta {
            id: "chatcmpl-1".to_string(),
            created: 42,
        };
        let body = completion(
            &meta,
            AggregatedResult {
                text: "Hi there".to_string(),
                model: "gpt-4".to_string(),
                usage: Some(Usage {
                    prompt_tokens: 1,
                    completion_tokens: 2,
                    total_tokens: 3,
                }),
            },
        );
        let json = serde_json::to_value(&body).unwrap();

        assert_eq!(json["id"], "chatcmpl-1");
        assert_eq!(json["object"], "chat.completion");
        assert_eq!(json["created"], 42);
        assert_eq!(json["model"], "gpt-4");
        assert_eq!(json["choices"].as_array().unwrap().len(), 1);
        assert_eq!(json["choices"][0]["index"], 0);
        assert_eq!(json["choices"][0]["message"]["role"], "assistant");
        assert_eq!(json["choices"][0]["message"]["content"], "Hi there");
        assert_eq!(json["choices"][0]["finish_reason"], "stop");
        assert_eq!(json["usage"]["total_tokens"], 3);
    }

    #[test]
    fn completion_without_usage_serializes_null() {
        let meta = ResponseMeta::new();
        let body = completion(
            &meta,
            AggregatedResult {
                text: String::new(),
                model: MODEL_PLACEHOLDER.to_string(),
                usage: None,
            },
        );
        let json = serde_json::to_value(&body).unwrap();
        assert!(json["usage"].is_null());
    }

    #[test]
    fn chunk_shape() {
        let meta = ResponseMeta {
            id: "chatcmpl-2".to_string(),
            created: 7,
        };
        let json = serde_json::to_value(chunk(&meta, STREAM_MODEL_PLACEHOLDER, "Hi")).unwrap();

        assert_eq!(json["object"], "chat.completion.chunk");
        assert_eq!(json["model"], "gust-stream");
        assert_eq!(json["choices"][0]["delta"]["content"], "Hi");
        assert!(json["choices"][0]["finish_reason"].is_null());
        assert!(json.get("usage").is_none());
    }
}
