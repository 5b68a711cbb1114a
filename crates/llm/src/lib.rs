mod engine;
mod rig_adapter;
mod scripted;

pub use engine::{
    BoxFuture, ChatTurn, CompletionHandle, CompletionRequest, DeltaEvent, DeltaStream,
    EngineError, EngineHandle, EngineResult, EngineWorker, InferenceEngine, ProgressSink, Role,
};
pub use rig_adapter::{RIG_ENGINE_ID, RigEngine, RigEngineConfig};
pub use scripted::{
    ReplyEnding, SCRIPTED_ENGINE_ID, SCRIPTED_MODEL_ID, ScriptedEngine, ScriptedReply,
};
