//! Conversation orchestration: state, turns, interruption and the engine.

pub mod cancel;
pub mod engine;
pub mod events;
pub mod interruption;
pub mod state;
pub mod transcript;
pub mod turn;

pub use cancel::CancellationToken;
pub use engine::{ConversationEngine, EngineHandle};
pub use events::{EngineEvent, EventEmitter};
pub use interruption::{
    CancellationOutcome, InterruptionController, InterruptionReport, PlaybackGate,
};
pub use state::{ConversationEvent, ConversationState, ConversationStateMachine, StateChange};
pub use transcript::{ConversationTurn, TranscriptLog, read_transcript};
pub use turn::{SentenceSplitter, TurnUpdate};
