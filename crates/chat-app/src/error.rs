use parley_llm::EngineError;
use parley_storage::StorageError;
use snafu::Snafu;

pub type ChatResult<T> = Result<T, ChatError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ChatError {
    #[snafu(display("store failed on `{stage}`, {source}"))]
    Store {
        stage: &'static str,
        source: StorageError,
    },
    #[snafu(display("engine failed on `{stage}`, {source}"))]
    Engine {
        stage: &'static str,
        source: EngineError,
    },
    #[snafu(display("a response is still streaming"))]
    Busy { stage: &'static str },
    #[snafu(display("invalid input on `{stage}`: {details}"))]
    Validation {
        stage: &'static str,
        details: String,
    },
    #[snafu(display("model is not loaded"))]
    EngineNotLoaded { stage: &'static str },
    #[snafu(display("unknown conversation {id}"))]
    UnknownConversation { stage: &'static str, id: String },
    #[snafu(display("chat service has shut down"))]
    ServiceClosed { stage: &'static str },
}

impl ChatError {
    /// Rejections that leave state untouched and need no user-facing report.
    pub fn is_silent(&self) -> bool {
        matches!(self, Self::Busy { .. } | Self::Validation { .. })
    }
}
