use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::Stream;
use snafu::Snafu;
use tokio::sync::{mpsc, oneshot};

/// Speaker role of one turn sent to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatTurn {
    pub role: Role,
    pub content: String,
}

impl ChatTurn {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionRequest {
    pub messages: Vec<ChatTurn>,
}

impl CompletionRequest {
    pub fn new(messages: Vec<ChatTurn>) -> Self {
        Self { messages }
    }

    pub fn last_user_content(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|turn| turn.role == Role::User)
            .map(|turn| turn.content.as_str())
    }
}

/// One event of a completion stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeltaEvent {
    Delta(String),
    Done,
    Error(String),
}

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
pub type EngineWorker = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;
pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum EngineError {
    #[snafu(display("engine '{engine_id}' failed to initialize: {details}"))]
    InitFailed {
        stage: &'static str,
        engine_id: String,
        details: String,
    },
    #[snafu(display("engine configuration has no model id"))]
    MissingModel { stage: &'static str },
    #[snafu(display("completion request has no messages"))]
    EmptyMessageSet { stage: &'static str },
    #[snafu(display("http client failed on `{stage}`, {source}"))]
    HttpClient {
        stage: &'static str,
        source: rig::http_client::Error,
    },
    #[snafu(display("failed to finalize HTTP request body: {message}"))]
    BuildHttpRequestBody {
        stage: &'static str,
        message: String,
    },
    #[snafu(display("model endpoint returned status {status}: {body}"))]
    ModelFetchStatus {
        stage: &'static str,
        status: u16,
        body: String,
    },
    #[snafu(display("failed to parse model list: {details}"))]
    ModelPayloadParse {
        stage: &'static str,
        details: String,
    },
    #[snafu(display("completions failed on `{stage}`, {source}"))]
    CompletionsFailed {
        stage: &'static str,
        source: rig::completion::CompletionError,
    },
}

/// Receives human-readable status lines while an engine loads.
#[derive(Clone)]
pub struct ProgressSink(Arc<dyn Fn(String) + Send + Sync>);

impl ProgressSink {
    pub fn new(report: impl Fn(String) + Send + Sync + 'static) -> Self {
        Self(Arc::new(report))
    }

    pub fn report(&self, text: impl Into<String>) {
        (self.0)(text.into())
    }
}

impl fmt::Debug for ProgressSink {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str("ProgressSink")
    }
}

/// Finite, non-restartable sequence of completion events with a single reader.
///
/// Dropping the stream tells the worker to stop.
pub struct DeltaStream {
    events: mpsc::UnboundedReceiver<DeltaEvent>,
    cancel_tx: Option<oneshot::Sender<()>>,
}

impl DeltaStream {
    pub(crate) fn new(
        events: mpsc::UnboundedReceiver<DeltaEvent>,
        cancel_tx: oneshot::Sender<()>,
    ) -> Self {
        Self {
            events,
            cancel_tx: Some(cancel_tx),
        }
    }

    pub async fn recv(&mut self) -> Option<DeltaEvent> {
        self.events.recv().await
    }
}

impl Stream for DeltaStream {
    type Item = DeltaEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.events.poll_recv(cx)
    }
}

impl Drop for DeltaStream {
    fn drop(&mut self) {
        if let Some(cancel_tx) = self.cancel_tx.take() {
            let _ = cancel_tx.send(());
        }
    }
}

/// A started completion: the caller reads `stream` and drives `worker` on a runtime.
pub struct CompletionHandle {
    pub stream: DeltaStream,
    pub worker: EngineWorker,
}

/// Loadable inference capability.
pub trait InferenceEngine: Send + Sync {
    fn id(&self) -> &str;

    /// Loads the model, reporting progress text as it goes.
    ///
    /// The returned future owns everything it needs so it can be spawned.
    fn initialize(
        &self,
        progress: ProgressSink,
    ) -> BoxFuture<'static, EngineResult<Arc<dyn EngineHandle>>>;
}

/// A loaded model that can stream completions.
pub trait EngineHandle: Send + Sync {
    fn model_id(&self) -> &str;
    fn complete(&self, request: CompletionRequest) -> EngineResult<CompletionHandle>;
}

pub(crate) fn make_delta_stream() -> (
    mpsc::UnboundedSender<DeltaEvent>,
    DeltaStream,
    oneshot::Receiver<()>,
) {
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (cancel_tx, cancel_rx) = oneshot::channel();
    (event_tx, DeltaStream::new(event_rx, cancel_tx), cancel_rx)
}
