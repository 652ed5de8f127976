use std::collections::VecDeque;

use futures_util::stream::{self, Stream};

use crate::config::StreamPolicy;
use crate::dispatch::{Delta, Usage};
use crate::error::GustError;
use crate::fallback::{FallbackController, FallbackEvent};
use crate::response::{
    self, DONE_SENTINEL, MODEL_PLACEHOLDER, ResponseMeta, STREAM_MODEL_PLACEHOLDER,
};

/// Whole-response view of the winning candidate's output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregatedResult {
    /// All non-empty fragments, in arrival order.
    pub text: String,
    pub model: String,
    pub usage: Option<Usage>,
}

/// Sticky "latest reported model": set by any delta that names a model,
/// never cleared by deltas that don't.
#[derive(Debug, Clone)]
pub struct ModelTracker {
    reported: Option<String>,
    placeholder: &'static str,
}

impl ModelTracker {
    pub fn new(placeholder: &'static str) -> Self {
        Self {
            reported: None,
            placeholder,
        }
    }

    pub fn observe(&mut self, delta: &Delta) {
        if let Some(model) = delta.model.as_deref().filter(|m| !m.is_empty()) {
            self.reported = Some(model.to_string());
        }
    }

    pub fn current(&self) -> &str {
        self.reported.as_deref().unwrap_or(self.placeholder)
    }

    pub fn into_model(self) -> String {
        self.reported.unwrap_or_else(|| self.placeholder.to_string())
    }
}

/// Drain the controller into a single result.
///
/// Output of a candidate that fails part-way is discarded; only the winning
/// candidate contributes text, model and usage. Exhaustion is an error, never
/// an empty success.
pub async fn collect(controller: &mut FallbackController) -> Result<AggregatedResult, GustError> {
    let mut text = String::new();
    let mut tracker = ModelTracker::new(MODEL_PLACEHOLDER);
    let mut usage = None;

    while let Some(event) = controller.next().await {
        match event {
            FallbackEvent::Delta(delta) => {
                tracker.observe(&delta);
                if let Some(fragment) = delta.fragment() {
                    text.push_str(fragment);
                }
                if delta.usage.is_some() {
                    usage = delta.usage;
                }
            }
            FallbackEvent::CandidateFailed { .. } => {
                text.clear();
                tracker = ModelTracker::new(MODEL_PLACEHOLDER);
                usage = None;
            }
            FallbackEvent::Succeeded { .. } => {
                return Ok(AggregatedResult {
                    text,
                    model: tracker.into_model(),
                    usage,
                });
            }
            FallbackEvent::Exhausted { attempts } => {
                return Err(GustError::AllCandidatesFailed { attempts });
            }
            FallbackEvent::Cancelled => return Err(GustError::Cancelled),
        }
    }

    Err(GustError::Other("fallback ended without an outcome".to_string()))
}

struct SseState {
    controller: FallbackController,
    meta: ResponseMeta,
    policy: StreamPolicy,
    tracker: ModelTracker,
    /// Deltas of the current candidate not yet released (buffering policy only).
    held: Vec<Delta>,
    /// Content events sent for the current candidate.
    sent: usize,
    ready: VecDeque<String>,
    done: bool,
}

impl SseState {
    fn release(&mut self, delta: Delta) {
        self.tracker.observe(&delta);
        let Some(fragment) = delta.fragment() else {
            return;
        };
        let chunk = response::chunk(&self.meta, self.tracker.current(), fragment);
        match serde_json::to_string(&chunk) {
            Ok(json) => {
                self.ready.push_back(json);
                self.sent += 1;
            }
            Err(e) => tracing::error!("failed to encode stream chunk: {e}"),
        }
    }

    fn finish(&mut self) {
        self.held.clear();
        self.ready.push_back(DONE_SENTINEL.to_string());
        self.done = true;
    }

    fn apply(&mut self, event: Option<FallbackEvent>) {
        match event {
            Some(FallbackEvent::Delta(delta)) => match self.policy {
                StreamPolicy::PassThrough => self.release(delta),
                StreamPolicy::BufferUntilSuccess => self.held.push(delta),
            },
            Some(FallbackEvent::CandidateFailed { candidate, .. }) => {
                match self.policy {
                    StreamPolicy::PassThrough if self.sent > 0 => {
                        tracing::warn!(
                            candidate = %candidate,
                            sent = self.sent,
                            "candidate failed after partial output was streamed"
                        );
                    }
                    StreamPolicy::PassThrough => {}
                    StreamPolicy::BufferUntilSuccess => self.held.clear(),
                }
                self.sent = 0;
            }
            Some(FallbackEvent::Succeeded { .. }) => {
                for delta in std::mem::take(&mut self.held) {
                    self.release(delta);
                }
                self.finish();
            }
            Some(FallbackEvent::Exhausted { .. }) | Some(FallbackEvent::Cancelled) | None => {
                self.finish()
            }
        }
    }
}

/// Turn the controller into SSE `data:` payloads: one JSON chunk per
/// non-empty fragment, then exactly one `[DONE]`.
///
/// The stream pulls from the controller only when polled, so a client that
/// stops reading stops the backend too; dropping the stream drops the
/// controller and any open backend connection.
pub fn sse_payloads(
    controller: FallbackController,
    meta: ResponseMeta,
    policy: StreamPolicy,
) -> impl Stream<Item = String> + Send {
    let state = SseState {
        controller,
        meta,
        policy,
        tracker: ModelTracker::new(STREAM_MODEL_PLACEHOLDER),
        held: Vec::new(),
        sent: 0,
        ready: VecDeque::new(),
        done: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(payload) = state.ready.pop_front() {
                return Some((payload, state));
            }
            if state.done {
                return None;
            }
            let event = state.controller.next().await;
            state.apply(event);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracker_is_sticky() {
        let mut tracker = ModelTracker::new(STREAM_MODEL_PLACEHOLDER);
        assert_eq!(tracker.current(), "gust-stream");

        tracker.observe(&Delta::text("a").with_model("gpt-4"));
        tracker.observe(&Delta::text("b"));
        assert_eq!(tracker.current(), "gpt-4");

        tracker.observe(&Delta::default().with_model("gpt-4o"));
        assert_eq!(tracker.into_model(), "gpt-4o");
    }

    #[test]
    fn tracker_ignores_empty_model() {
        let mut tracker = ModelTracker::new(MODEL_PLACEHOLDER);
        tracker.observe(&Delta::text("a").with_model(""));
        assert_eq!(tracker.current(), "gust");
    }
}
