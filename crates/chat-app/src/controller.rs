use std::fmt;
use std::sync::Arc;

use futures::StreamExt;
use parley_llm::{
    ChatTurn, CompletionHandle, CompletionRequest, DeltaEvent, EngineHandle, InferenceEngine,
    ProgressSink, Role,
};
use parley_storage::{
    ConversationId, ConversationRecord, ConversationStore, MessageRecord, MessageRole,
    unix_timestamp_millis,
};
use snafu::{OptionExt, ResultExt, ensure};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::error::{
    BusySnafu, ChatResult, EngineNotLoadedSnafu, EngineSnafu, StoreSnafu,
    UnknownConversationSnafu, ValidationSnafu,
};
use crate::merger::{MessageStreamMerger, StreamEnd, StreamTarget};
use crate::persist::{PersistJob, PersistQueue};
use crate::registry::ConversationRegistry;

pub const STATUS_LOADING: &str = "Loading model...";
pub const STATUS_INITIALIZING: &str = "Initializing...";
pub const STATUS_READY: &str = "Model ready!";
pub const STATUS_NOT_LOADED: &str = "Model not loaded";

/// Everything a view needs to render the chat.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ChatSnapshot {
    pub messages: Vec<MessageRecord>,
    pub conversations: Vec<ConversationRecord>,
    pub current_conversation_id: Option<ConversationId>,
    /// A response is streaming.
    pub is_loading: bool,
    pub model_status: String,
    pub is_model_loaded: bool,
}

/// Work finished off the controller's thread of control.
pub enum BackgroundEvent {
    EngineProgress(String),
    EngineReady(Arc<dyn EngineHandle>),
    EngineFailed(String),
    Stream {
        target: StreamTarget,
        event: DeltaEvent,
    },
    /// The reader saw the end of the delta stream.
    StreamClosed(StreamTarget),
}

impl fmt::Debug for BackgroundEvent {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EngineProgress(text) => formatter.debug_tuple("EngineProgress").field(text).finish(),
            Self::EngineReady(handle) => formatter
                .debug_tuple("EngineReady")
                .field(&handle.model_id())
                .finish(),
            Self::EngineFailed(reason) => formatter.debug_tuple("EngineFailed").field(reason).finish(),
            Self::Stream { target, event } => formatter
                .debug_struct("Stream")
                .field("target", target)
                .field("event", event)
                .finish(),
            Self::StreamClosed(target) => formatter.debug_tuple("StreamClosed").field(target).finish(),
        }
    }
}

enum EngineSlot {
    Unloaded,
    Loading,
    Ready(Arc<dyn EngineHandle>),
    Failed,
}

struct StreamTasks {
    target: StreamTarget,
    worker: JoinHandle<()>,
    reader: JoinHandle<()>,
}

impl StreamTasks {
    fn cancel(self) {
        // Aborting the reader drops the delta stream, which signals the worker too.
        self.reader.abort();
        self.worker.abort();
    }
}

/// Facade over the registry, the merger and the engine.
///
/// All mutation happens through `&mut self`, so a single owner (see
/// [`crate::service::ChatService`]) serializes every operation.
pub struct ChatController {
    store: Arc<dyn ConversationStore>,
    queue: PersistQueue,
    registry: ConversationRegistry,
    merger: MessageStreamMerger,
    engine: Arc<dyn InferenceEngine>,
    engine_slot: EngineSlot,
    model_status: String,
    events_tx: mpsc::UnboundedSender<BackgroundEvent>,
    events_rx: mpsc::UnboundedReceiver<BackgroundEvent>,
    snapshot_tx: watch::Sender<ChatSnapshot>,
    stream_tasks: Option<StreamTasks>,
}

impl ChatController {
    /// Must be called inside a tokio runtime.
    pub fn new(store: Arc<dyn ConversationStore>, engine: Arc<dyn InferenceEngine>) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, _) = watch::channel(ChatSnapshot {
            model_status: STATUS_NOT_LOADED.to_string(),
            ..ChatSnapshot::default()
        });

        Self {
            queue: PersistQueue::new(store.clone()),
            store,
            registry: ConversationRegistry::new(),
            merger: MessageStreamMerger::new(),
            engine,
            engine_slot: EngineSlot::Unloaded,
            model_status: STATUS_NOT_LOADED.to_string(),
            events_tx,
            events_rx,
            snapshot_tx,
            stream_tasks: None,
        }
    }

    /// Prepares the store and opens the most recently updated conversation.
    pub async fn start(&mut self) -> ChatResult<()> {
        self.store.init().await.context(StoreSnafu {
            stage: "controller-start-init",
        })?;
        self.reload_registry("controller-start-list").await?;

        if let Some(latest) = self.registry.most_recent().map(|record| record.id) {
            self.activate(latest).await?;
        }

        tracing::info!(conversations = self.registry.len(), "chat controller started");
        self.publish();
        Ok(())
    }

    pub fn snapshot(&self) -> ChatSnapshot {
        ChatSnapshot {
            messages: self.merger.visible_messages().to_vec(),
            conversations: self.registry.list(),
            current_conversation_id: self.merger.bound_conversation(),
            is_loading: self.merger.is_streaming(),
            model_status: self.model_status.clone(),
            is_model_loaded: matches!(self.engine_slot, EngineSlot::Ready(_)),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<ChatSnapshot> {
        self.snapshot_tx.subscribe()
    }

    /// Starts loading the engine unless it is loaded or already loading.
    pub fn initialize_engine(&mut self) {
        match self.engine_slot {
            EngineSlot::Ready(_) | EngineSlot::Loading => {
                tracing::debug!("engine already loaded or loading");
                return;
            }
            EngineSlot::Unloaded | EngineSlot::Failed => {}
        }

        self.engine_slot = EngineSlot::Loading;
        self.model_status = STATUS_LOADING.to_string();
        self.publish();

        let progress_tx = self.events_tx.clone();
        let progress = ProgressSink::new(move |text| {
            let _ = progress_tx.send(BackgroundEvent::EngineProgress(text));
        });
        let load = self.engine.initialize(progress);
        let events_tx = self.events_tx.clone();
        let engine_id = self.engine.id().to_string();

        tracing::info!(engine_id = %engine_id, "loading engine");
        tokio::spawn(async move {
            let event = match load.await {
                Ok(handle) => BackgroundEvent::EngineReady(handle),
                Err(error) => {
                    tracing::error!(engine_id = %engine_id, error = %error, "engine failed to load");
                    BackgroundEvent::EngineFailed(error.to_string())
                }
            };
            let _ = events_tx.send(event);
        });
    }

    pub async fn send_message(&mut self, content: &str) -> ChatResult<()> {
        ensure!(
            !content.trim().is_empty(),
            ValidationSnafu {
                stage: "send-message",
                details: "message is empty".to_string(),
            }
        );
        ensure!(
            !self.merger.is_streaming(),
            BusySnafu {
                stage: "send-message",
            }
        );
        let EngineSlot::Ready(engine) = &self.engine_slot else {
            return EngineNotLoadedSnafu {
                stage: "send-message",
            }
            .fail();
        };
        let engine = engine.clone();

        let conversation_id = match self.merger.bound_conversation() {
            Some(conversation_id) => conversation_id,
            None => self.create_conversation("").await?,
        };

        let start = self.merger.begin(
            &self.queue,
            conversation_id,
            content,
            unix_timestamp_millis(),
        )?;
        self.registry
            .touch(&self.queue, conversation_id, start.started_at_unix_millis);
        self.publish();

        let request = CompletionRequest::new(to_chat_turns(&start.history));
        match engine.complete(request) {
            Ok(handle) => {
                self.spawn_stream(start.target, handle);
                Ok(())
            }
            Err(error) => {
                let reason = error.to_string();
                if let Some(end) = self.merger.abort(&self.queue, start.target, reason.clone()) {
                    self.after_stream_end(end);
                }
                self.model_status = format!("Generation failed: {reason}");
                self.publish();
                Err(error).context(EngineSnafu {
                    stage: "send-message-complete",
                })
            }
        }
    }

    /// Cancels the in-flight response. The partial reply is kept.
    pub fn stop_generation(&mut self) {
        let Some(target) = self.merger.inflight_target() else {
            return;
        };

        self.cancel_stream_tasks();
        if let Some(end) = self.merger.abort(&self.queue, target, "stopped") {
            self.after_stream_end(end);
        }
        self.publish();
    }

    pub async fn clear_messages(&mut self) -> ChatResult<()> {
        let Some(conversation_id) = self.merger.bound_conversation() else {
            return Ok(());
        };

        self.merger.clear(&self.queue).await?;
        self.registry
            .touch(&self.queue, conversation_id, unix_timestamp_millis());
        self.publish();
        Ok(())
    }

    /// Makes a conversation active, reading its messages from the store.
    ///
    /// Allowed while streaming; the stream keeps writing into its own conversation.
    pub async fn load_conversation(&mut self, conversation_id: ConversationId) -> ChatResult<()> {
        ensure!(
            self.registry.contains(conversation_id),
            UnknownConversationSnafu {
                stage: "load-conversation",
                id: conversation_id.to_string(),
            }
        );

        self.activate(conversation_id).await?;
        self.publish();
        Ok(())
    }

    pub async fn create_conversation(&mut self, title: &str) -> ChatResult<ConversationId> {
        let record = self
            .registry
            .create(&self.queue, title, unix_timestamp_millis())
            .await?;
        self.merger.bind(record.id, Vec::new());
        self.publish();
        Ok(record.id)
    }

    pub async fn delete_conversation(&mut self, conversation_id: ConversationId) -> ChatResult<()> {
        let was_active = self.merger.bound_conversation() == Some(conversation_id);
        self.registry.remove(&self.queue, conversation_id).await?;

        self.merger.forget(conversation_id);
        if self.merger.is_streaming_into(conversation_id) {
            self.stop_generation();
        }

        if was_active {
            match self.registry.most_recent().map(|record| record.id) {
                Some(next) => {
                    if let Err(error) = self.activate(next).await {
                        tracing::warn!(
                            conversation_id = %next,
                            error = %error,
                            "failed to open the next conversation after delete"
                        );
                    }
                }
                None => self.merger.unbind(),
            }
        }

        tracing::info!(conversation_id = %conversation_id, "deleted conversation");
        self.publish();
        Ok(())
    }

    pub async fn rename_conversation(
        &mut self,
        conversation_id: ConversationId,
        title: &str,
    ) -> ChatResult<()> {
        self.registry
            .rename(&self.queue, conversation_id, title, unix_timestamp_millis())
            .await?;
        self.publish();
        Ok(())
    }

    /// Wipes every conversation and message.
    pub async fn clear_all_data(&mut self) -> ChatResult<()> {
        self.queue
            .execute(PersistJob::Clear)
            .await
            .context(StoreSnafu {
                stage: "clear-all-data",
            })?;

        self.merger.reset();
        self.stop_generation();
        self.registry.reset();
        tracing::info!("cleared all chat data");
        self.publish();
        Ok(())
    }

    /// Rebuilds the caches from the store after an out-of-band change.
    pub async fn refresh(&mut self) -> ChatResult<()> {
        self.reload_registry("refresh-list").await?;

        let current = self
            .merger
            .bound_conversation()
            .filter(|conversation_id| self.registry.contains(*conversation_id))
            .or_else(|| self.registry.most_recent().map(|record| record.id));
        match current {
            Some(conversation_id) => self.activate(conversation_id).await?,
            None => self.merger.unbind(),
        }

        self.publish();
        Ok(())
    }

    /// Waits for the next background event. Never resolves to `None` while the
    /// controller is alive.
    pub async fn next_background_event(&mut self) -> Option<BackgroundEvent> {
        self.events_rx.recv().await
    }

    pub fn handle_background_event(&mut self, event: BackgroundEvent) {
        match event {
            BackgroundEvent::EngineProgress(text) => {
                if !matches!(self.engine_slot, EngineSlot::Loading) {
                    return;
                }
                self.model_status = if text.trim().is_empty() {
                    STATUS_INITIALIZING.to_string()
                } else {
                    text
                };
            }
            BackgroundEvent::EngineReady(handle) => {
                tracing::info!(model_id = %handle.model_id(), "engine ready");
                self.engine_slot = EngineSlot::Ready(handle);
                self.model_status = STATUS_READY.to_string();
            }
            BackgroundEvent::EngineFailed(reason) => {
                self.engine_slot = EngineSlot::Failed;
                self.model_status = format!("Failed to load model: {reason}");
            }
            BackgroundEvent::Stream { target, event } => {
                if !self.handle_stream_event(target, event) {
                    return;
                }
            }
            BackgroundEvent::StreamClosed(target) => {
                if self.merger.inflight_target() != Some(target) {
                    return;
                }
                self.fail_stream(target, "stream ended before a terminal event".to_string());
            }
        }

        self.publish();
    }

    /// Processes background events until nothing is loading or streaming, then
    /// waits for queued writes.
    pub async fn settle(&mut self) {
        while self.merger.is_streaming() || matches!(self.engine_slot, EngineSlot::Loading) {
            match self.events_rx.recv().await {
                Some(event) => self.handle_background_event(event),
                None => break,
            }
        }
        self.queue.flush().await;
    }

    /// Resolves once every write issued so far has reached the store.
    pub async fn flush(&self) {
        self.queue.flush().await;
    }

    pub async fn shutdown(mut self) {
        self.stop_generation();
        self.queue.shutdown().await;
    }

    fn handle_stream_event(&mut self, target: StreamTarget, event: DeltaEvent) -> bool {
        match event {
            DeltaEvent::Delta(text) => self.merger.apply_delta(&self.queue, target, &text),
            DeltaEvent::Done => match self.merger.finish(&self.queue, target) {
                Some(end) => {
                    self.drop_stream_tasks(target);
                    self.after_stream_end(end);
                    true
                }
                None => false,
            },
            DeltaEvent::Error(reason) => {
                if self.merger.inflight_target() != Some(target) {
                    return false;
                }
                self.fail_stream(target, reason);
                true
            }
        }
    }

    fn fail_stream(&mut self, target: StreamTarget, reason: String) {
        self.drop_stream_tasks(target);
        if let Some(end) = self.merger.abort(&self.queue, target, reason.clone()) {
            self.after_stream_end(end);
        }
        self.model_status = format!("Generation failed: {reason}");
    }

    fn after_stream_end(&mut self, end: StreamEnd) {
        if !end.detached {
            self.registry
                .touch(&self.queue, end.conversation_id, unix_timestamp_millis());
        }
    }

    fn spawn_stream(&mut self, target: StreamTarget, handle: CompletionHandle) {
        let CompletionHandle { mut stream, worker } = handle;
        let worker = tokio::spawn(worker);
        let events_tx = self.events_tx.clone();
        let reader = tokio::spawn(async move {
            while let Some(event) = stream.next().await {
                let terminal = !matches!(event, DeltaEvent::Delta(_));
                if events_tx.send(BackgroundEvent::Stream { target, event }).is_err() || terminal {
                    return;
                }
            }
            let _ = events_tx.send(BackgroundEvent::StreamClosed(target));
        });

        self.cancel_stream_tasks();
        self.stream_tasks = Some(StreamTasks {
            target,
            worker,
            reader,
        });
    }

    fn cancel_stream_tasks(&mut self) {
        if let Some(tasks) = self.stream_tasks.take() {
            tasks.cancel();
        }
    }

    /// Forgets finished tasks without aborting them.
    fn drop_stream_tasks(&mut self, target: StreamTarget) {
        if self
            .stream_tasks
            .as_ref()
            .is_some_and(|tasks| tasks.target == target)
        {
            self.stream_tasks = None;
        }
    }

    async fn activate(&mut self, conversation_id: ConversationId) -> ChatResult<()> {
        self.queue.flush().await;
        let messages = self
            .store
            .get_messages(conversation_id)
            .await
            .context(StoreSnafu {
                stage: "activate-conversation",
            })?;
        self.merger.bind(conversation_id, messages);
        Ok(())
    }

    async fn reload_registry(&mut self, stage: &'static str) -> ChatResult<()> {
        self.queue.flush().await;
        let records = self
            .store
            .list_conversations()
            .await
            .context(StoreSnafu { stage })?;
        self.registry.load(records);
        Ok(())
    }

    fn publish(&self) {
        self.snapshot_tx.send_replace(self.snapshot());
    }

    /// Looks up a conversation by its position in the published list.
    pub fn conversation_at(&self, index: usize) -> ChatResult<ConversationId> {
        self.registry
            .list()
            .get(index)
            .map(|record| record.id)
            .context(UnknownConversationSnafu {
                stage: "conversation-at",
                id: format!("#{}", index + 1),
            })
    }
}

fn to_chat_turns(history: &[MessageRecord]) -> Vec<ChatTurn> {
    history
        .iter()
        .filter(|message| !message.content.trim().is_empty())
        .map(|message| {
            let role = match message.role {
                MessageRole::User => Role::User,
                MessageRole::Assistant => Role::Assistant,
            };
            ChatTurn::new(role, message.content.clone())
        })
        .collect()
}
