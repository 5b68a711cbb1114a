use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use super::engine::{
    BoxFuture, CompletionHandle, CompletionRequest, DeltaEvent, EngineError, EngineHandle,
    EngineResult, EngineWorker, InferenceEngine, ProgressSink, make_delta_stream,
};

pub const SCRIPTED_ENGINE_ID: &str = "scripted";
pub const SCRIPTED_MODEL_ID: &str = "scripted-echo";

/// How a scripted reply ends after its deltas are sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyEnding {
    Done,
    Fail(String),
    /// Leaves the stream open until it is cancelled or dropped.
    Hang,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptedReply {
    pub deltas: Vec<String>,
    pub ending: ReplyEnding,
}

impl ScriptedReply {
    pub fn done<I, S>(deltas: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            deltas: deltas.into_iter().map(Into::into).collect(),
            ending: ReplyEnding::Done,
        }
    }

    pub fn failing<I, S>(deltas: I, message: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            deltas: deltas.into_iter().map(Into::into).collect(),
            ending: ReplyEnding::Fail(message.into()),
        }
    }

    pub fn hanging<I, S>(deltas: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            deltas: deltas.into_iter().map(Into::into).collect(),
            ending: ReplyEnding::Hang,
        }
    }

    fn echo(request: &CompletionRequest) -> Self {
        let prompt = request.last_user_content().unwrap_or_default();
        let mut deltas = vec!["You said:".to_string()];
        deltas.extend(prompt.split_inclusive(' ').map(|word| format!(" {}", word.trim_end())));
        Self::done(deltas)
    }
}

#[derive(Debug, Default)]
struct ScriptState {
    replies: Mutex<VecDeque<ScriptedReply>>,
    initialize_calls: AtomicUsize,
    completion_calls: AtomicUsize,
}

/// Deterministic engine that plays back queued replies, or echoes the prompt when none are queued.
///
/// Clones share the same script and counters.
#[derive(Debug, Clone, Default)]
pub struct ScriptedEngine {
    state: Arc<ScriptState>,
    load_steps: Vec<String>,
    load_failure: Option<String>,
    delta_delay: Option<Duration>,
}

impl ScriptedEngine {
    pub fn new() -> Self {
        Self {
            load_steps: vec![
                "Fetching param cache[0/2]".to_string(),
                "Loading model from cache[2/2]".to_string(),
            ],
            ..Self::default()
        }
    }

    pub fn with_replies(self, replies: impl IntoIterator<Item = ScriptedReply>) -> Self {
        self.push_replies(replies);
        self
    }

    pub fn with_load_failure(mut self, message: impl Into<String>) -> Self {
        self.load_failure = Some(message.into());
        self
    }

    pub fn with_delta_delay(mut self, delay: Duration) -> Self {
        self.delta_delay = Some(delay);
        self
    }

    pub fn push_replies(&self, replies: impl IntoIterator<Item = ScriptedReply>) {
        let mut queue = self
            .state
            .replies
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        queue.extend(replies);
    }

    pub fn initialize_calls(&self) -> usize {
        self.state.initialize_calls.load(Ordering::SeqCst)
    }

    pub fn completion_calls(&self) -> usize {
        self.state.completion_calls.load(Ordering::SeqCst)
    }

    fn next_reply(&self, request: &CompletionRequest) -> ScriptedReply {
        self.state
            .replies
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop_front()
            .unwrap_or_else(|| ScriptedReply::echo(request))
    }

    async fn play(
        reply: ScriptedReply,
        delay: Option<Duration>,
        event_tx: mpsc::UnboundedSender<DeltaEvent>,
        mut cancel_rx: oneshot::Receiver<()>,
    ) {
        for delta in reply.deltas {
            if let Some(delay) = delay {
                tokio::select! {
                    _ = &mut cancel_rx => return,
                    _ = tokio::time::sleep(delay) => {}
                }
            } else {
                tokio::task::yield_now().await;
            }

            if cancel_rx.try_recv().is_ok() || event_tx.send(DeltaEvent::Delta(delta)).is_err() {
                return;
            }
        }

        match reply.ending {
            ReplyEnding::Done => {
                let _ = event_tx.send(DeltaEvent::Done);
            }
            ReplyEnding::Fail(message) => {
                let _ = event_tx.send(DeltaEvent::Error(message));
            }
            ReplyEnding::Hang => {
                let _ = cancel_rx.await;
            }
        }
    }
}

impl InferenceEngine for ScriptedEngine {
    fn id(&self) -> &str {
        SCRIPTED_ENGINE_ID
    }

    fn initialize(
        &self,
        progress: ProgressSink,
    ) -> BoxFuture<'static, EngineResult<Arc<dyn EngineHandle>>> {
        self.state.initialize_calls.fetch_add(1, Ordering::SeqCst);
        let engine = self.clone();

        Box::pin(async move {
            for step in &engine.load_steps {
                progress.report(step.clone());
                tokio::task::yield_now().await;
            }

            if let Some(details) = engine.load_failure.clone() {
                return Err(EngineError::InitFailed {
                    stage: "scripted-initialize",
                    engine_id: SCRIPTED_ENGINE_ID.to_string(),
                    details,
                });
            }

            Ok(Arc::new(engine) as Arc<dyn EngineHandle>)
        })
    }
}

impl EngineHandle for ScriptedEngine {
    fn model_id(&self) -> &str {
        SCRIPTED_MODEL_ID
    }

    fn complete(&self, request: CompletionRequest) -> EngineResult<CompletionHandle> {
        self.state.completion_calls.fetch_add(1, Ordering::SeqCst);
        let reply = self.next_reply(&request);
        let (event_tx, stream, cancel_rx) = make_delta_stream();
        let worker: EngineWorker = Box::pin(Self::play(reply, self.delta_delay, event_tx, cancel_rx));

        Ok(CompletionHandle { stream, worker })
    }
}
