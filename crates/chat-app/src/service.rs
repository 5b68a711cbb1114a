use parley_storage::ConversationId;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::controller::{ChatController, ChatSnapshot};
use crate::error::{ChatResult, ServiceClosedSnafu};

const COMMAND_CHANNEL_CAPACITY: usize = 64;

type Reply<T> = oneshot::Sender<ChatResult<T>>;

enum Command {
    InitializeEngine(Reply<()>),
    SendMessage { content: String, reply: Reply<()> },
    StopGeneration(Reply<()>),
    ClearMessages(Reply<()>),
    LoadConversation { id: ConversationId, reply: Reply<()> },
    CreateConversation { title: String, reply: Reply<ConversationId> },
    DeleteConversation { id: ConversationId, reply: Reply<()> },
    RenameConversation {
        id: ConversationId,
        title: String,
        reply: Reply<()>,
    },
    ClearAllData(Reply<()>),
    Refresh(Reply<()>),
    ConversationAt { index: usize, reply: Reply<ConversationId> },
    Settle(Reply<()>),
}

/// Task that owns the controller and interleaves commands with background events.
pub struct ChatService;

impl ChatService {
    /// Spawns the actor loop. It stops once every handle is dropped.
    pub fn spawn(controller: ChatController) -> (ChatHandle, JoinHandle<()>) {
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let handle = ChatHandle {
            commands: commands_tx,
            snapshots: controller.subscribe(),
        };
        let task = tokio::spawn(Self::run(controller, commands_rx));
        (handle, task)
    }

    async fn run(mut controller: ChatController, mut commands: mpsc::Receiver<Command>) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => Self::dispatch(&mut controller, command).await,
                    None => break,
                },
                Some(event) = controller.next_background_event() => {
                    controller.handle_background_event(event);
                }
            }
        }

        tracing::debug!("chat service stopping");
        controller.shutdown().await;
    }

    async fn dispatch(controller: &mut ChatController, command: Command) {
        match command {
            Command::InitializeEngine(reply) => {
                controller.initialize_engine();
                let _ = reply.send(Ok(()));
            }
            Command::SendMessage { content, reply } => {
                let _ = reply.send(controller.send_message(&content).await);
            }
            Command::StopGeneration(reply) => {
                controller.stop_generation();
                let _ = reply.send(Ok(()));
            }
            Command::ClearMessages(reply) => {
                let _ = reply.send(controller.clear_messages().await);
            }
            Command::LoadConversation { id, reply } => {
                let _ = reply.send(controller.load_conversation(id).await);
            }
            Command::CreateConversation { title, reply } => {
                let _ = reply.send(controller.create_conversation(&title).await);
            }
            Command::DeleteConversation { id, reply } => {
                let _ = reply.send(controller.delete_conversation(id).await);
            }
            Command::RenameConversation { id, title, reply } => {
                let _ = reply.send(controller.rename_conversation(id, &title).await);
            }
            Command::ClearAllData(reply) => {
                let _ = reply.send(controller.clear_all_data().await);
            }
            Command::Refresh(reply) => {
                let _ = reply.send(controller.refresh().await);
            }
            Command::ConversationAt { index, reply } => {
                let _ = reply.send(controller.conversation_at(index));
            }
            Command::Settle(reply) => {
                controller.settle().await;
                let _ = reply.send(Ok(()));
            }
        }
    }
}

/// Cloneable front door to a running [`ChatService`].
#[derive(Clone)]
pub struct ChatHandle {
    commands: mpsc::Sender<Command>,
    snapshots: watch::Receiver<ChatSnapshot>,
}

impl ChatHandle {
    pub fn snapshot(&self) -> ChatSnapshot {
        self.snapshots.borrow().clone()
    }

    /// Change feed of published snapshots.
    pub fn subscribe(&self) -> watch::Receiver<ChatSnapshot> {
        self.snapshots.clone()
    }

    pub async fn initialize_engine(&self) -> ChatResult<()> {
        self.request("handle-initialize-engine", Command::InitializeEngine)
            .await?
    }

    pub async fn send_message(&self, content: impl Into<String>) -> ChatResult<()> {
        let content = content.into();
        self.request("handle-send-message", |reply| Command::SendMessage {
            content,
            reply,
        })
        .await?
    }

    pub async fn stop_generation(&self) -> ChatResult<()> {
        self.request("handle-stop-generation", Command::StopGeneration)
            .await?
    }

    pub async fn clear_messages(&self) -> ChatResult<()> {
        self.request("handle-clear-messages", Command::ClearMessages)
            .await?
    }

    pub async fn load_conversation(&self, id: ConversationId) -> ChatResult<()> {
        self.request("handle-load-conversation", |reply| {
            Command::LoadConversation { id, reply }
        })
        .await?
    }

    pub async fn create_conversation(&self, title: impl Into<String>) -> ChatResult<ConversationId> {
        let title = title.into();
        self.request("handle-create-conversation", |reply| {
            Command::CreateConversation { title, reply }
        })
        .await?
    }

    pub async fn delete_conversation(&self, id: ConversationId) -> ChatResult<()> {
        self.request("handle-delete-conversation", |reply| {
            Command::DeleteConversation { id, reply }
        })
        .await?
    }

    pub async fn rename_conversation(
        &self,
        id: ConversationId,
        title: impl Into<String>,
    ) -> ChatResult<()> {
        let title = title.into();
        self.request("handle-rename-conversation", |reply| {
            Command::RenameConversation { id, title, reply }
        })
        .await?
    }

    pub async fn clear_all_data(&self) -> ChatResult<()> {
        self.request("handle-clear-all-data", Command::ClearAllData)
            .await?
    }

    pub async fn refresh(&self) -> ChatResult<()> {
        self.request("handle-refresh", Command::Refresh).await?
    }

    /// Resolves a 0-based position in the conversation list.
    pub async fn conversation_at(&self, index: usize) -> ChatResult<ConversationId> {
        self.request("handle-conversation-at", |reply| Command::ConversationAt {
            index,
            reply,
        })
        .await?
    }

    /// Waits until nothing is loading or streaming and all writes landed.
    pub async fn settle(&self) -> ChatResult<()> {
        self.request("handle-settle", Command::Settle).await?
    }

    async fn request<T>(
        &self,
        stage: &'static str,
        build: impl FnOnce(Reply<T>) -> Command,
    ) -> ChatResult<ChatResult<T>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(build(reply_tx))
            .await
            .map_err(|_| ServiceClosedSnafu { stage }.build())?;
        reply_rx
            .await
            .map_err(|_| ServiceClosedSnafu { stage }.build())
    }
}
