//! Sequential fallback across candidates.
//!
//! [`FallbackController`] is a pull-based state machine: each call to
//! [`FallbackController::next`] advances it by at most one observable event.
//! Backend errors never escape as `Err`; they become
//! [`FallbackEvent::CandidateFailed`] and the controller moves on.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::FallbackSettings;
use crate::dispatch::{BackendRequest, ChatBackend, ChatMessage, Delta, DeltaStream};
use crate::error::GustError;
use crate::selector::Candidate;

/// Max characters of a failure cause written to the log.
const LOG_CAUSE_CHARS: usize = 150;

#[derive(Debug)]
pub enum FallbackEvent {
    /// One delta from the candidate currently being attempted.
    Delta(Delta),
    /// The current candidate failed after forwarding `emitted` deltas. Those
    /// deltas belong to a losing candidate.
    CandidateFailed {
        candidate: Candidate,
        cause: GustError,
        emitted: usize,
    },
    /// Terminal: the current candidate's sequence completed.
    Succeeded { candidate: Candidate, deltas: usize },
    /// Terminal: every candidate failed.
    Exhausted { attempts: usize },
    /// Terminal: the request was cancelled while a candidate was in flight.
    Cancelled,
}

enum State {
    Idle,
    Trying {
        index: usize,
        stream: DeltaStream,
        emitted: usize,
        started: Instant,
    },
    Finished,
}

pub struct FallbackController {
    backend: Arc<dyn ChatBackend>,
    candidates: Vec<Candidate>,
    messages: Vec<ChatMessage>,
    settings: FallbackSettings,
    cancel: CancellationToken,
    state: State,
    next_index: usize,
}

impl FallbackController {
    pub fn new(
        backend: Arc<dyn ChatBackend>,
        candidates: Vec<Candidate>,
        messages: Vec<ChatMessage>,
        settings: FallbackSettings,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            backend,
            candidates,
            messages,
            settings,
            cancel,
            state: State::Idle,
            next_index: 0,
        }
    }

    /// Number of candidates opened so far.
    pub fn attempts(&self) -> usize {
        self.next_index
    }

    /// Pull the next event. Returns `None` once a terminal event has been
    /// returned. Dropping the controller drops any open backend stream.
    pub async fn next(&mut self) -> Option<FallbackEvent> {
        loop {
            match std::mem::replace(&mut self.state, State::Finished) {
                State::Finished => return None,
                State::Idle => {
                    if let Some(event) = self.open_next().await {
                        return Some(event);
                    }
                }
                State::Trying {
                    index,
                    mut stream,
                    emitted,
                    started,
                } => {
                    // First delta shares its budget with the open call.
                    let wait = if emitted == 0 {
                        self.settings
                            .first_delta_timeout
                            .saturating_sub(started.elapsed())
                    } else {
                        self.settings.stall_timeout
                    };

                    let pulled = tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => None,
                        r = tokio::time::timeout(wait, stream.next()) => Some(r),
                    };

                    let Some(pulled) = pulled else {
                        drop(stream);
                        return Some(self.cancelled(index));
                    };

                    match pulled {
                        Ok(Some(Ok(delta))) => {
                            self.state = State::Trying {
                                index,
                                stream,
                                emitted: emitted + 1,
                                started,
                            };
                            return Some(FallbackEvent::Delta(delta));
                        }
                        Ok(Some(Err(cause))) => return Some(self.fail(index, cause, emitted)),
                        Ok(None) if emitted == 0 => {
                            let model = self.candidates[index].model.clone();
                            return Some(self.fail(
                                index,
                                GustError::EmptyResponse { model },
                                0,
                            ));
                        }
                        Ok(None) => {
                            let candidate = self.candidates[index].clone();
                            tracing::info!(
                                candidate = %candidate,
                                deltas = emitted,
                                elapsed_ms = started.elapsed().as_millis() as u64,
                                "candidate succeeded"
                            );
                            return Some(FallbackEvent::Succeeded {
                                candidate,
                                deltas: emitted,
                            });
                        }
                        Err(_) => {
                            drop(stream);
                            return Some(self.fail(index, timeout_error(wait), emitted));
                        }
                    }
                }
            }
        }
    }

    /// Open the next candidate. Returns an event when there is something to
    /// report (failure to open, exhaustion, cancellation); `None` means the
    /// controller is now in `Trying` and the caller should keep pulling.
    async fn open_next(&mut self) -> Option<FallbackEvent> {
        let Some(candidate) = self.candidates.get(self.next_index).cloned() else {
            let attempts = self.next_index;
            tracing::warn!(attempts, "all candidates failed");
            return Some(FallbackEvent::Exhausted { attempts });
        };
        let index = self.next_index;
        self.next_index += 1;

        tracing::info!(
            candidate = %candidate,
            attempt = index + 1,
            of = self.candidates.len(),
            "attempting candidate"
        );

        let req = BackendRequest {
            model: candidate.model,
            provider: candidate.provider,
            messages: self.messages.clone(),
        };
        let started = Instant::now();
        let budget = self.settings.first_delta_timeout;

        let opened = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            r = tokio::time::timeout(budget, self.backend.open(&req)) => Some(r),
        };

        match opened {
            None => Some(self.cancelled(index)),
            Some(Ok(Ok(stream))) => {
                self.state = State::Trying {
                    index,
                    stream,
                    emitted: 0,
                    started,
                };
                None
            }
            Some(Ok(Err(cause))) => Some(self.fail(index, cause, 0)),
            Some(Err(_)) => Some(self.fail(index, timeout_error(budget), 0)),
        }
    }

    fn fail(&mut self, index: usize, cause: GustError, emitted: usize) -> FallbackEvent {
        let candidate = self.candidates[index].clone();
        tracing::warn!(
            candidate = %candidate,
            upstream = cause.provider().unwrap_or("-"),
            emitted,
            cause = %truncate_chars(&cause.to_string(), LOG_CAUSE_CHARS),
            "candidate failed"
        );
        self.state = State::Idle;
        FallbackEvent::CandidateFailed {
            candidate,
            cause,
            emitted,
        }
    }

    fn cancelled(&mut self, index: usize) -> FallbackEvent {
        tracing::info!(candidate = %self.candidates[index], "request cancelled");
        self.state = State::Finished;
        FallbackEvent::Cancelled
    }
}

fn timeout_error(wait: Duration) -> GustError {
    GustError::Timeout(wait.as_millis() as u64)
}

fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &s[..idx]),
        None => s.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_keeps_short_strings() {
        assert_eq!(truncate_chars("short", 150), "short");
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        let s = "é".repeat(200);
        let t = truncate_chars(&s, 150);
        assert_eq!(t.chars().count(), 153);
        assert!(t.ends_with("..."));
    }
}
