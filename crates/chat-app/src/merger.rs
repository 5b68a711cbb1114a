use parley_storage::{ConversationId, MessageId, MessageRecord};
use snafu::{ResultExt, ensure};

use crate::error::{BusySnafu, ChatResult, StoreSnafu, ValidationSnafu};
use crate::persist::{PersistJob, PersistQueue};

/// Identifier for one generation session.
///
/// Every send gets a new one so late deltas of an older stream can be rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamSessionId(pub u64);

/// Routing key carried by every stream event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamTarget {
    pub conversation_id: ConversationId,
    pub session_id: StreamSessionId,
}

impl StreamTarget {
    pub const fn new(conversation_id: ConversationId, session_id: StreamSessionId) -> Self {
        Self {
            conversation_id,
            session_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum StreamPhase {
    #[default]
    Idle,
    AwaitingFirstDelta(StreamTarget),
    Streaming(StreamTarget),
    Finalized(StreamTarget),
    Aborted {
        target: StreamTarget,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamTransition {
    Begin(StreamTarget),
    Delta(StreamTarget),
    Finish(StreamTarget),
    Abort {
        target: StreamTarget,
        reason: String,
    },
    Settle,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamTransitionRejection {
    AlreadyStreaming {
        active: StreamTarget,
        attempted: StreamTarget,
    },
    NoActiveStream,
    SessionMismatch {
        active: StreamTarget,
        attempted: StreamTarget,
    },
    StillStreaming(StreamTarget),
}

pub type StreamTransitionResult = Result<StreamPhase, StreamTransitionRejection>;

impl StreamPhase {
    /// Target of the in-flight stream, if any.
    pub fn active_target(&self) -> Option<StreamTarget> {
        match self {
            Self::AwaitingFirstDelta(target) | Self::Streaming(target) => Some(*target),
            Self::Idle | Self::Finalized(_) | Self::Aborted { .. } => None,
        }
    }

    pub fn is_in_flight(&self) -> bool {
        self.active_target().is_some()
    }

    /// Pure reducer over the stream lifecycle.
    ///
    /// Deltas and terminal transitions must name the in-flight target exactly.
    /// `Finalized` and `Aborted` only move on through `Settle`, or a new `Begin`.
    pub fn apply(&self, transition: StreamTransition) -> StreamTransitionResult {
        match transition {
            StreamTransition::Begin(target) => self.apply_begin(target),
            StreamTransition::Delta(target) => {
                self.require_active(target).map(|_| Self::Streaming(target))
            }
            StreamTransition::Finish(target) => {
                self.require_active(target).map(|_| Self::Finalized(target))
            }
            StreamTransition::Abort { target, reason } => self
                .require_active(target)
                .map(|_| Self::Aborted { target, reason }),
            StreamTransition::Settle => match self.active_target() {
                Some(active) => Err(StreamTransitionRejection::StillStreaming(active)),
                None => Ok(Self::Idle),
            },
        }
    }

    fn apply_begin(&self, target: StreamTarget) -> StreamTransitionResult {
        match self.active_target() {
            Some(active) => Err(StreamTransitionRejection::AlreadyStreaming {
                active,
                attempted: target,
            }),
            None => Ok(Self::AwaitingFirstDelta(target)),
        }
    }

    fn require_active(&self, target: StreamTarget) -> Result<(), StreamTransitionRejection> {
        match self.active_target() {
            Some(active) if active == target => Ok(()),
            Some(active) => Err(StreamTransitionRejection::SessionMismatch {
                active,
                attempted: target,
            }),
            None => Err(StreamTransitionRejection::NoActiveStream),
        }
    }
}

/// What `begin` hands back to the caller that opens the engine stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamStart {
    pub target: StreamTarget,
    /// Conversation so far, ending with the new user message.
    pub history: Vec<MessageRecord>,
    pub started_at_unix_millis: u64,
}

/// Outcome of a terminal stream transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamEnd {
    pub conversation_id: ConversationId,
    /// The conversation was deleted while streaming.
    pub detached: bool,
}

#[derive(Debug)]
struct InflightStream {
    target: StreamTarget,
    placeholder_id: MessageId,
    messages: Vec<MessageRecord>,
    detached: bool,
}

/// Owns the visible message list and folds streamed output into it.
#[derive(Debug, Default)]
pub struct MessageStreamMerger {
    bound: Option<ConversationId>,
    messages: Vec<MessageRecord>,
    phase: StreamPhase,
    inflight: Option<InflightStream>,
    next_session: u64,
}

impl MessageStreamMerger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self) -> &StreamPhase {
        &self.phase
    }

    pub fn bound_conversation(&self) -> Option<ConversationId> {
        self.bound
    }

    pub fn inflight_target(&self) -> Option<StreamTarget> {
        self.inflight.as_ref().map(|inflight| inflight.target)
    }

    pub fn is_streaming(&self) -> bool {
        self.phase.is_in_flight()
    }

    /// True when the in-flight stream writes into `conversation_id`.
    pub fn is_streaming_into(&self, conversation_id: ConversationId) -> bool {
        self.inflight
            .as_ref()
            .is_some_and(|inflight| inflight.target.conversation_id == conversation_id)
    }

    /// Makes `conversation_id` the visible conversation.
    ///
    /// A stream already writing into it keeps its own newer buffer.
    pub fn bind(&mut self, conversation_id: ConversationId, messages: Vec<MessageRecord>) {
        self.bound = Some(conversation_id);
        self.messages = messages;
    }

    pub fn unbind(&mut self) {
        self.bound = None;
        self.messages.clear();
    }

    pub fn visible_messages(&self) -> &[MessageRecord] {
        match (&self.inflight, self.bound) {
            (Some(inflight), Some(bound)) if inflight.target.conversation_id == bound => {
                &inflight.messages
            }
            _ => &self.messages,
        }
    }

    /// Appends the user message and an empty assistant placeholder to the bound
    /// conversation and queues the full list for persistence.
    pub fn begin(
        &mut self,
        queue: &PersistQueue,
        conversation_id: ConversationId,
        content: &str,
        now_unix_millis: u64,
    ) -> ChatResult<StreamStart> {
        ensure!(
            !content.trim().is_empty(),
            ValidationSnafu {
                stage: "merger-begin",
                details: "message is empty".to_string(),
            }
        );
        ensure!(
            self.bound == Some(conversation_id),
            ValidationSnafu {
                stage: "merger-begin",
                details: format!("conversation {conversation_id} is not bound"),
            }
        );

        self.next_session += 1;
        let target = StreamTarget::new(conversation_id, StreamSessionId(self.next_session));
        self.phase = self
            .phase
            .apply(StreamTransition::Begin(target))
            .map_err(|rejection| {
                tracing::debug!(?rejection, "send rejected while streaming");
                BusySnafu {
                    stage: "merger-begin",
                }
                .build()
            })?;

        let at = self
            .messages
            .last()
            .map_or(now_unix_millis, |last| {
                now_unix_millis.max(last.created_at_unix_millis)
            });
        let mut messages = self.messages.clone();
        messages.push(MessageRecord::user(content, at));
        let history = messages.clone();
        let placeholder = MessageRecord::assistant_placeholder(at);
        let placeholder_id = placeholder.id;
        messages.push(placeholder);

        queue.submit(PersistJob::ReplaceMessages {
            conversation_id,
            messages: messages.clone(),
        });

        self.inflight = Some(InflightStream {
            target,
            placeholder_id,
            messages,
            detached: false,
        });

        Ok(StreamStart {
            target,
            history,
            started_at_unix_millis: at,
        })
    }

    /// Appends one delta to the placeholder.
    ///
    /// Returns true when the visible list changed. Stale targets are ignored.
    pub fn apply_delta(&mut self, queue: &PersistQueue, target: StreamTarget, text: &str) -> bool {
        let next = match self.phase.apply(StreamTransition::Delta(target)) {
            Ok(next) => next,
            Err(rejection) => {
                tracing::trace!(?rejection, "dropping stale delta");
                return false;
            }
        };
        self.phase = next;

        let Some(inflight) = self.inflight.as_mut() else {
            return false;
        };
        if text.is_empty() {
            return false;
        }

        let placeholder_id = inflight.placeholder_id;
        let Some(placeholder) = inflight
            .messages
            .iter_mut()
            .find(|message| message.id == placeholder_id)
        else {
            return false;
        };
        placeholder.content.push_str(text);

        if !inflight.detached {
            queue.submit(PersistJob::ReplaceMessages {
                conversation_id: target.conversation_id,
                messages: inflight.messages.clone(),
            });
        }

        self.bound == Some(target.conversation_id)
    }

    pub fn finish(&mut self, queue: &PersistQueue, target: StreamTarget) -> Option<StreamEnd> {
        self.end(queue, StreamTransition::Finish(target))
    }

    /// Ends the stream keeping whatever content already arrived.
    pub fn abort(
        &mut self,
        queue: &PersistQueue,
        target: StreamTarget,
        reason: impl Into<String>,
    ) -> Option<StreamEnd> {
        self.end(
            queue,
            StreamTransition::Abort {
                target,
                reason: reason.into(),
            },
        )
    }

    fn end(&mut self, queue: &PersistQueue, transition: StreamTransition) -> Option<StreamEnd> {
        let terminal = match self.phase.apply(transition) {
            Ok(terminal) => terminal,
            Err(rejection) => {
                tracing::trace!(?rejection, "ignoring stale stream end");
                return None;
            }
        };
        if let StreamPhase::Aborted { target, reason } = &terminal {
            tracing::warn!(
                conversation_id = %target.conversation_id,
                reason = %reason,
                "stream aborted"
            );
        }
        self.phase = terminal.apply(StreamTransition::Settle).unwrap_or_default();

        let inflight = self.inflight.take()?;
        let conversation_id = inflight.target.conversation_id;
        if !inflight.detached {
            queue.submit(PersistJob::ReplaceMessages {
                conversation_id,
                messages: inflight.messages.clone(),
            });
        }
        if self.bound == Some(conversation_id) {
            self.messages = inflight.messages;
        }

        Some(StreamEnd {
            conversation_id,
            detached: inflight.detached,
        })
    }

    /// Empties the bound conversation both durably and in memory.
    pub async fn clear(&mut self, queue: &PersistQueue) -> ChatResult<()> {
        let Some(conversation_id) = self.bound else {
            return Ok(());
        };
        ensure!(
            !self.is_streaming_into(conversation_id),
            BusySnafu {
                stage: "merger-clear",
            }
        );

        queue
            .execute(PersistJob::ReplaceMessages {
                conversation_id,
                messages: Vec::new(),
            })
            .await
            .context(StoreSnafu {
                stage: "merger-clear",
            })?;

        self.messages.clear();
        Ok(())
    }

    /// Drops every tie to a deleted conversation.
    ///
    /// A stream writing into it keeps running but stops persisting.
    pub fn forget(&mut self, conversation_id: ConversationId) {
        if let Some(inflight) = self.inflight.as_mut()
            && inflight.target.conversation_id == conversation_id
        {
            inflight.detached = true;
        }
        if self.bound == Some(conversation_id) {
            self.unbind();
        }
    }

    /// Forgets everything, used after the store was wiped.
    pub fn reset(&mut self) {
        if let Some(inflight) = self.inflight.as_mut() {
            inflight.detached = true;
        }
        self.unbind();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parley_storage::{ConversationRecord, ConversationStore, MemoryStorage, MessageRole};

    use super::*;
    use crate::error::ChatError;

    fn target(session: u64) -> StreamTarget {
        StreamTarget::new(ConversationId::new_v7(), StreamSessionId(session))
    }

    async fn setup() -> (Arc<MemoryStorage>, PersistQueue, ConversationRecord) {
        let store = Arc::new(MemoryStorage::new());
        let queue = PersistQueue::new(store.clone());
        let conversation = ConversationRecord::new("chat", 1);
        queue
            .execute(PersistJob::PutConversation(conversation.clone()))
            .await
            .unwrap();
        (store, queue, conversation)
    }

    fn contents(messages: &[MessageRecord]) -> Vec<&str> {
        messages.iter().map(|message| message.content.as_str()).collect()
    }

    #[test]
    fn reducer_walks_the_happy_path() {
        let target = target(1);
        let phase = StreamPhase::Idle
            .apply(StreamTransition::Begin(target))
            .unwrap();
        assert_eq!(phase, StreamPhase::AwaitingFirstDelta(target));

        let phase = phase.apply(StreamTransition::Delta(target)).unwrap();
        assert_eq!(phase, StreamPhase::Streaming(target));

        let phase = phase.apply(StreamTransition::Finish(target)).unwrap();
        assert_eq!(phase, StreamPhase::Finalized(target));
        assert_eq!(phase.apply(StreamTransition::Settle), Ok(StreamPhase::Idle));
    }

    #[test]
    fn reducer_rejects_stale_and_overlapping_sessions() {
        let active = target(1);
        let stale = StreamTarget::new(active.conversation_id, StreamSessionId(0));
        let phase = StreamPhase::Streaming(active);

        assert_eq!(
            phase.apply(StreamTransition::Delta(stale)),
            Err(StreamTransitionRejection::SessionMismatch {
                active,
                attempted: stale,
            })
        );
        assert!(matches!(
            phase.apply(StreamTransition::Begin(stale)),
            Err(StreamTransitionRejection::AlreadyStreaming { .. })
        ));
        assert_eq!(
            phase.apply(StreamTransition::Settle),
            Err(StreamTransitionRejection::StillStreaming(active))
        );
        assert_eq!(
            StreamPhase::Idle.apply(StreamTransition::Finish(active)),
            Err(StreamTransitionRejection::NoActiveStream)
        );
    }

    #[tokio::test]
    async fn deltas_accumulate_in_the_placeholder() {
        let (store, queue, conversation) = setup().await;
        let mut merger = MessageStreamMerger::new();
        merger.bind(conversation.id, Vec::new());

        let start = merger.begin(&queue, conversation.id, "hello", 10).unwrap();
        assert_eq!(contents(&start.history), vec!["hello"]);
        assert_eq!(merger.phase(), &StreamPhase::AwaitingFirstDelta(start.target));

        for delta in ["Hi", " there", "!"] {
            assert!(merger.apply_delta(&queue, start.target, delta));
        }
        let end = merger.finish(&queue, start.target).unwrap();
        assert!(!end.detached);
        assert_eq!(merger.phase(), &StreamPhase::Idle);
        assert_eq!(contents(merger.visible_messages()), vec!["hello", "Hi there!"]);

        queue.flush().await;
        let stored = store.get_messages(conversation.id).await.unwrap();
        assert_eq!(contents(&stored), vec!["hello", "Hi there!"]);
        assert_eq!(stored[1].role, MessageRole::Assistant);
    }

    #[tokio::test]
    async fn second_send_while_streaming_is_busy() {
        let (_store, queue, conversation) = setup().await;
        let mut merger = MessageStreamMerger::new();
        merger.bind(conversation.id, Vec::new());
        merger.begin(&queue, conversation.id, "one", 10).unwrap();

        let error = merger.begin(&queue, conversation.id, "two", 11).unwrap_err();
        assert!(matches!(error, ChatError::Busy { .. }));
        assert_eq!(merger.visible_messages().len(), 2);
    }

    #[tokio::test]
    async fn abort_keeps_partial_content() {
        let (store, queue, conversation) = setup().await;
        let mut merger = MessageStreamMerger::new();
        merger.bind(conversation.id, Vec::new());
        let start = merger.begin(&queue, conversation.id, "hello", 10).unwrap();

        merger.apply_delta(&queue, start.target, "Par");
        merger.abort(&queue, start.target, "connection reset").unwrap();
        assert!(!merger.is_streaming());

        queue.flush().await;
        let stored = store.get_messages(conversation.id).await.unwrap();
        assert_eq!(contents(&stored), vec!["hello", "Par"]);
    }

    #[tokio::test]
    async fn timestamps_never_go_backwards() {
        let (_store, queue, conversation) = setup().await;
        let mut merger = MessageStreamMerger::new();
        merger.bind(conversation.id, vec![MessageRecord::user("earlier", 50)]);

        let start = merger.begin(&queue, conversation.id, "skewed clock", 20).unwrap();
        assert_eq!(start.started_at_unix_millis, 50);
        assert!(
            merger
                .visible_messages()
                .iter()
                .all(|message| message.created_at_unix_millis == 50)
        );
    }

    #[tokio::test]
    async fn switching_away_keeps_the_stream_persisting() {
        let (store, queue, conversation) = setup().await;
        let other = ConversationRecord::new("other", 2);
        queue
            .execute(PersistJob::PutConversation(other.clone()))
            .await
            .unwrap();

        let mut merger = MessageStreamMerger::new();
        merger.bind(conversation.id, Vec::new());
        let start = merger.begin(&queue, conversation.id, "hello", 10).unwrap();
        merger.bind(other.id, Vec::new());

        assert!(!merger.apply_delta(&queue, start.target, "background"));
        assert!(merger.visible_messages().is_empty());
        merger.finish(&queue, start.target).unwrap();

        queue.flush().await;
        let stored = store.get_messages(conversation.id).await.unwrap();
        assert_eq!(contents(&stored), vec!["hello", "background"]);
    }

    #[tokio::test]
    async fn forgotten_conversations_are_not_resurrected() {
        let (store, queue, conversation) = setup().await;
        let mut merger = MessageStreamMerger::new();
        merger.bind(conversation.id, Vec::new());
        let start = merger.begin(&queue, conversation.id, "hello", 10).unwrap();

        merger.forget(conversation.id);
        queue
            .execute(PersistJob::DeleteConversation(conversation.id))
            .await
            .unwrap();
        merger.apply_delta(&queue, start.target, "late");
        let end = merger.finish(&queue, start.target).unwrap();
        assert!(end.detached);

        queue.flush().await;
        assert_eq!(store.message_row_count(), 0);
        assert_eq!(merger.bound_conversation(), None);
    }

    #[tokio::test]
    async fn clear_is_refused_while_streaming_into_the_bound_conversation() {
        let (store, queue, conversation) = setup().await;
        let mut merger = MessageStreamMerger::new();
        merger.bind(conversation.id, Vec::new());
        let start = merger.begin(&queue, conversation.id, "hello", 10).unwrap();

        assert!(matches!(
            merger.clear(&queue).await,
            Err(ChatError::Busy { .. })
        ));

        merger.finish(&queue, start.target).unwrap();
        merger.clear(&queue).await.unwrap();
        assert!(merger.visible_messages().is_empty());
        assert!(store.get_messages(conversation.id).await.unwrap().is_empty());
        assert_eq!(store.list_conversations().await.unwrap().len(), 1);
    }
}
