//! parley - real-time voice conversation engine
//!
//! Captures microphone audio, detects when the user speaks, and runs each
//! utterance through transcription, response generation and speech synthesis,
//! cancelling the response the moment the user talks over it.

// Enforce error handling discipline
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

pub mod audio;
pub mod collaborators;
pub mod config;
pub mod conversation;
pub mod defaults;
pub mod error;

// Capture
pub use audio::{AudioChunk, AudioFrame, AudioFrameSource, RingBuffer, VoiceActivityDetector};

// Collaborators (source → transcribe → generate → synthesize → sink)
pub use collaborators::{
    AudioOutputSink, Collaborators, ResponseGenerator, SpeechSynthesizer, Transcriber,
};

// Orchestration
pub use conversation::{
    CancellationToken, ConversationEngine, ConversationState, ConversationStateMachine,
    ConversationTurn, EngineEvent, EngineHandle, InterruptionController,
};

// Error handling
pub use error::{Result, Stage, VoiceError};

// Config
pub use config::{Config, EngineConfig};

/// Build version string with optional git commit hash.
///
/// Returns `"0.1.0+abc1234"` when git hash is available, `"0.1.0"` otherwise.
pub fn version_string() -> String {
    let version = env!("CARGO_PKG_VERSION");
    match option_env!("GIT_HASH") {
        Some(hash) if !hash.is_empty() => format!("{}+{}", version, hash),
        _ => version.to_string(),
    }
}
