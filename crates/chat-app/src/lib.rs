#![deny(unsafe_code)]

/// Terminal command parsing and transcript rendering.
pub mod cli;
/// Chat session facade and published snapshots.
pub mod controller;
pub mod error;
/// Folding streamed deltas into the message list.
pub mod merger;
pub mod persist;
pub mod registry;
/// Actor wrapper that owns the controller.
pub mod service;
pub mod session;
/// Settings persistence and engine construction.
pub mod settings;

pub use controller::{BackgroundEvent, ChatController, ChatSnapshot};
pub use error::{ChatError, ChatResult};
pub use merger::{MessageStreamMerger, StreamPhase, StreamSessionId, StreamTarget};
pub use persist::{PersistJob, PersistQueue};
pub use registry::ConversationRegistry;
pub use service::{ChatHandle, ChatService};
pub use session::{Session, SessionGate};
pub use settings::{ChatSettings, EngineKind, EngineSettings, SettingsStore};
