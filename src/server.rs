use std::convert::Infallible;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::aggregate;
use crate::config::FallbackSettings;
use crate::dispatch::{ChatBackend, ChatMessage};
use crate::error::GustError;
use crate::fallback::FallbackController;
use crate::mode::{ModeSettings, ModeStore};
use crate::response::{self, ErrorBody, ResponseMeta};
use crate::selector::select_candidates;

pub const CHAT_COMPLETIONS_PATH: &str = "/v1/chat/completions";

/// Shared, read-mostly state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    backend: Arc<dyn ChatBackend>,
    modes: Arc<ModeStore>,
    fallback: FallbackSettings,
    shutdown: CancellationToken,
}

impl AppState {
    pub fn new(
        backend: Arc<dyn ChatBackend>,
        modes: Arc<ModeStore>,
        fallback: FallbackSettings,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            backend,
            modes,
            fallback,
            shutdown,
        }
    }
}

#[derive(Deserialize)]
struct ChatCompletionRequest {
    #[serde(default)]
    messages: Option<Vec<ChatMessage>>,
    #[serde(default)]
    stream: Option<bool>,
}

/// A validated inbound request: non-empty conversation plus stream flag.
#[derive(Debug)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    pub stream: bool,
}

/// Validate a raw request body. Only `messages` and `stream` are read;
/// anything else a client sends (model, temperature, ...) is ignored.
pub fn parse_chat_request(body: &[u8]) -> Result<ChatRequest, GustError> {
    let raw: ChatCompletionRequest = serde_json::from_slice(body)
        .map_err(|e| GustError::InvalidRequest(format!("invalid request body: {e}")))?;

    let messages = raw
        .messages
        .filter(|m| !m.is_empty())
        .ok_or_else(|| GustError::InvalidRequest("the messages field is required".to_string()))?;

    Ok(ChatRequest {
        messages,
        stream: raw.stream.unwrap_or(false),
    })
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route(CHAT_COMPLETIONS_PATH, post(chat_completions))
        .route("/v1/mode", get(get_mode).put(put_mode))
        .route("/v1/models", get(list_models))
        .fallback(not_found)
        .with_state(state)
}

/// Serve until the state's shutdown token is cancelled. Open streams see the
/// same token and close with the terminal sentinel.
pub async fn serve(listener: TcpListener, state: AppState) -> std::io::Result<()> {
    let shutdown = state.shutdown.clone();
    let app = build_router(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

fn error_response(err: &GustError) -> Response {
    let status =
        StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(ErrorBody::new(err.user_message()))).into_response()
}

async fn index() -> &'static str {
    "gust chat gateway\nPOST /v1/chat/completions\n"
}

async fn not_found() -> Response {
    (StatusCode::NOT_FOUND, Json(ErrorBody::new("not found"))).into_response()
}

async fn chat_completions(State(state): State<AppState>, body: Bytes) -> Response {
    let meta = ResponseMeta::new();

    let req = match parse_chat_request(&body) {
        Ok(req) => req,
        Err(e) => {
            tracing::info!("rejected chat request: {e}");
            return error_response(&e);
        }
    };

    let snapshot = state.modes.snapshot();
    tracing::info!(
        id = %meta.id,
        mode = %snapshot.mode,
        stream = req.stream,
        messages = req.messages.len(),
        "chat completion request"
    );

    let candidates = match select_candidates(&snapshot) {
        Ok(candidates) => candidates,
        Err(e) => {
            tracing::error!(id = %meta.id, "{e}");
            return error_response(&e);
        }
    };

    let mut controller = FallbackController::new(
        state.backend.clone(),
        candidates,
        req.messages,
        state.fallback,
        state.shutdown.child_token(),
    );

    if req.stream {
        let events = aggregate::sse_payloads(controller, meta, state.fallback.stream_policy)
            .map(|payload| Ok::<Event, Infallible>(Event::default().data(payload)));
        return Sse::new(events).into_response();
    }

    match aggregate::collect(&mut controller).await {
        Ok(result) => Json(response::completion(&meta, result)).into_response(),
        Err(e) => {
            tracing::error!(id = %meta.id, attempts = controller.attempts(), "{e}");
            error_response(&e)
        }
    }
}

async fn get_mode(State(state): State<AppState>) -> Json<ModeSettings> {
    Json(state.modes.settings())
}

async fn put_mode(State(state): State<AppState>, body: Bytes) -> Response {
    let settings: ModeSettings = match serde_json::from_slice(&body) {
        Ok(settings) => settings,
        Err(e) => {
            return error_response(&GustError::InvalidRequest(format!(
                "invalid mode body: {e}"
            )));
        }
    };
    state.modes.replace(settings.clone());
    Json(settings).into_response()
}

#[derive(Debug, Serialize)]
struct ModelList {
    object: &'static str,
    data: Vec<ModelCard>,
}

#[derive(Debug, Serialize)]
struct ModelCard {
    id: String,
    object: &'static str,
    owned_by: &'static str,
}

async fn list_models(State(state): State<AppState>) -> Json<ModelList> {
    let lists = state.modes.lists();
    let mut data: Vec<ModelCard> = Vec::new();
    for model in lists.auto_plus.iter().chain(lists.auto.iter()) {
        if data.iter().any(|card| &card.id == model) {
            continue;
        }
        data.push(ModelCard {
            id: model.clone(),
            object: "model",
            owned_by: "gust",
        });
    }
    Json(ModelList {
        object: "list",
        data,
    })
}
