//! Error types for parley.

use std::fmt;
use thiserror::Error;

/// Pipeline stage a turn was in when something went wrong.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum Stage {
    Transcription,
    Generation,
    Synthesis,
    Playback,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Transcription => "transcription",
            Stage::Generation => "generation",
            Stage::Synthesis => "synthesis",
            Stage::Playback => "playback",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum VoiceError {
    // Configuration errors
    #[error("Failed to parse configuration: {message}")]
    ConfigParse { message: String },

    #[error("Invalid configuration value for {key}: {message}")]
    ConfigInvalidValue { key: String, message: String },

    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    // Audio capture errors
    #[error("Audio device not found: {device}")]
    AudioDeviceNotFound { device: String },

    #[error("Audio capture failed: {message}")]
    AudioCapture { message: String },

    // Audio output errors
    #[error("Audio output failed: {message}")]
    AudioOutput { message: String },

    // Collaborator errors
    #[error("Transcription error: {message}")]
    Transcription { message: String },

    #[error("Response generation error: {message}")]
    Generation { message: String },

    #[error("Speech synthesis error: {message}")]
    Synthesis { message: String },

    #[error("{stage} timed out after {after_ms}ms")]
    Timeout { stage: Stage, after_ms: u64 },

    #[error("{stage} was cancelled")]
    Cancelled { stage: Stage },

    // Orchestration errors
    #[error("Invalid transition: {event} while {from}")]
    InvalidTransition { from: String, event: String },

    #[error("No tokio runtime available to drive the conversation engine")]
    NoRuntime,

    // General I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // Generic error for cases not covered above
    #[error("{0}")]
    Other(String),
}

impl VoiceError {
    /// Capture errors end the session; everything else is recoverable per turn.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            VoiceError::AudioCapture { .. } | VoiceError::AudioDeviceNotFound { .. }
        )
    }

    /// The stage this error is attributed to, if any.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            VoiceError::Transcription { .. } => Some(Stage::Transcription),
            VoiceError::Generation { .. } => Some(Stage::Generation),
            VoiceError::Synthesis { .. } => Some(Stage::Synthesis),
            VoiceError::AudioOutput { .. } => Some(Stage::Playback),
            VoiceError::Timeout { stage, .. } | VoiceError::Cancelled { stage } => Some(*stage),
            _ => None,
        }
    }
}

// Type alias for convenience
pub type Result<T> = std::result::Result<T, VoiceError>;
