//! Scripted in-memory backend shared by the integration tests.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::stream;
use futures_util::{FutureExt, StreamExt};

use gust::config::{FallbackSettings, StreamPolicy};
use gust::dispatch::{BackendRequest, ChatBackend, ChatMessage, Delta, DeltaStream, Role, Usage};
use gust::error::GustError;

/// What the backend does when a model is opened.
#[derive(Clone)]
pub enum Script {
    /// `open` itself fails.
    FailOpen(String),
    /// `open` never resolves.
    HangOpen,
    /// `open` succeeds and the stream plays these steps.
    Steps(Vec<Step>),
}

#[derive(Clone)]
pub enum Step {
    Delta(Delta),
    /// Yield an error item; the controller stops pulling after it.
    Fail(String),
    /// Never yield again.
    Stall,
}

pub fn text(fragment: &str) -> Step {
    Step::Delta(Delta::text(fragment))
}

pub fn text_from(fragment: &str, model: &str) -> Step {
    Step::Delta(Delta::text(fragment).with_model(model))
}

pub fn usage(prompt: u64, completion: u64) -> Step {
    Step::Delta(Delta::usage(Usage {
        prompt_tokens: prompt,
        completion_tokens: completion,
        total_tokens: prompt + completion,
    }))
}

pub fn ok(steps: Vec<Step>) -> Script {
    Script::Steps(steps)
}

pub fn fail_open(msg: &str) -> Script {
    Script::FailOpen(msg.to_string())
}

#[derive(Default)]
pub struct ScriptedBackend {
    scripts: HashMap<String, Script>,
    calls: Arc<Mutex<Vec<(String, Option<String>)>>>,
    dropped: Arc<AtomicUsize>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(mut self, model: &str, script: Script) -> Self {
        self.scripts.insert(model.to_string(), script);
        self
    }

    /// Every (model, provider) opened, in order.
    pub fn calls(&self) -> Vec<(String, Option<String>)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn called_models(&self) -> Vec<String> {
        self.calls().into_iter().map(|(m, _)| m).collect()
    }

    /// Number of delta streams that have been dropped.
    pub fn dropped(&self) -> usize {
        self.dropped.load(Ordering::SeqCst)
    }
}

struct DropCounter(Arc<AtomicUsize>);

impl Drop for DropCounter {
    fn drop(&mut self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

impl ChatBackend for ScriptedBackend {
    fn open<'a>(
        &'a self,
        req: &'a BackendRequest,
    ) -> BoxFuture<'a, Result<DeltaStream, GustError>> {
        async move {
            self.calls
                .lock()
                .unwrap()
                .push((req.model.clone(), req.provider.clone()));

            let script = self
                .scripts
                .get(&req.model)
                .cloned()
                .unwrap_or_else(|| Script::FailOpen(format!("no script for {}", req.model)));

            match script {
                Script::FailOpen(msg) => Err(GustError::Upstream {
                    provider: "scripted".to_string(),
                    message: msg,
                    status: Some(502),
                }),
                Script::HangOpen => futures_util::future::pending().await,
                Script::Steps(steps) => {
                    let stalls = steps.iter().any(|s| matches!(s, Step::Stall));
                    let items: Vec<Result<Delta, GustError>> = steps
                        .into_iter()
                        .take_while(|s| !matches!(s, Step::Stall))
                        .map(|s| match s {
                            Step::Delta(d) => Ok(d),
                            Step::Fail(msg) => Err(GustError::Stream(msg)),
                            Step::Stall => unreachable!(),
                        })
                        .collect();

                    let guard = DropCounter(self.dropped.clone());
                    let base = stream::iter(items);
                    let stream: DeltaStream = if stalls {
                        base.chain(stream::pending()).boxed()
                    } else {
                        base.boxed()
                    };
                    // The guard lives in the unfold state, so it drops with the stream.
                    let counted = stream::unfold((stream, guard), |(mut inner, guard)| async move {
                        inner.next().await.map(|item| (item, (inner, guard)))
                    });
                    Ok(counted.boxed())
                }
            }
        }
        .boxed()
    }
}

pub fn user(content: &str) -> Vec<ChatMessage> {
    vec![ChatMessage {
        role: Role::User,
        content: content.to_string(),
    }]
}

pub fn settings(policy: StreamPolicy) -> FallbackSettings {
    FallbackSettings {
        first_delta_timeout: Duration::from_secs(5),
        stall_timeout: Duration::from_secs(5),
        stream_policy: policy,
    }
}

pub fn short_timeouts(policy: StreamPolicy) -> FallbackSettings {
    FallbackSettings {
        first_delta_timeout: Duration::from_millis(150),
        stall_timeout: Duration::from_millis(150),
        stream_policy: policy,
    }
}
