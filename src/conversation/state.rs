//! Conversation state machine.
//!
//! The state is owned by [`ConversationStateMachine`] and changes only
//! through [`ConversationStateMachine::transition`]. Every other component
//! learns about it from the returned [`StateChange`]s.

use crate::error::{Result, VoiceError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::SystemTime;

/// Where the conversation currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ConversationState {
    /// Waiting for the user to speak.
    #[default]
    Idle,
    /// Capturing an utterance.
    Listening,
    /// Transcribing the utterance and waiting for a response.
    Processing,
    /// Playing the response.
    Speaking,
    /// The user spoke over the response; cancellation is in progress.
    Interrupted,
}

impl fmt::Display for ConversationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Inputs that drive the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConversationEvent {
    /// Debounced speech start.
    SpeechStarted,
    /// Speech ended (or the utterance hit its maximum length) with enough audio.
    UtteranceCaptured,
    /// Speech ended but the utterance was too short.
    UtteranceRejected,
    /// The transcript is usable; a response is underway.
    TranscriptReady,
    /// Transcription failed or produced nothing usable.
    TranscriptUnusable,
    /// The response finished playing.
    PlaybackFinished,
    /// Generation, synthesis or playback failed.
    ResponseFailed,
    /// Speech started while the response was playing.
    BargeIn,
    /// Interruption cancellation has finished (acknowledged or timed out).
    CancellationSettled,
    /// The host is stopping the engine.
    Shutdown,
}

impl fmt::Display for ConversationEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A state change, as reported to observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateChange {
    pub from: ConversationState,
    pub to: ConversationState,
    pub at: SystemTime,
}

/// The transition table. `None` means the event is not valid in `state`.
pub fn next_state(
    state: ConversationState,
    event: ConversationEvent,
) -> Option<ConversationState> {
    use ConversationEvent as E;
    use ConversationState as S;

    match (state, event) {
        (S::Idle, E::SpeechStarted) => Some(S::Listening),
        (S::Listening, E::UtteranceCaptured) => Some(S::Processing),
        (S::Listening, E::UtteranceRejected) => Some(S::Idle),
        (S::Processing, E::TranscriptReady) => Some(S::Speaking),
        (S::Processing, E::TranscriptUnusable) => Some(S::Idle),
        (S::Speaking, E::PlaybackFinished) => Some(S::Idle),
        (S::Speaking, E::ResponseFailed) => Some(S::Idle),
        (S::Speaking, E::BargeIn) => Some(S::Interrupted),
        (S::Interrupted, E::CancellationSettled) => Some(S::Listening),
        (S::Listening | S::Processing | S::Speaking | S::Interrupted, E::Shutdown) => {
            Some(S::Idle)
        }
        _ => None,
    }
}

/// Sole owner of the conversation state.
#[derive(Debug, Default)]
pub struct ConversationStateMachine {
    state: ConversationState,
}

impl ConversationStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> ConversationState {
        self.state
    }

    /// Apply `event`, or reject it without changing state.
    pub fn transition(&mut self, event: ConversationEvent) -> Result<StateChange> {
        let Some(to) = next_state(self.state, event) else {
            return Err(VoiceError::InvalidTransition {
                from: self.state.to_string(),
                event: event.to_string(),
            });
        };

        let change = StateChange {
            from: self.state,
            to,
            at: SystemTime::now(),
        };
        self.state = to;
        tracing::debug!(from = %change.from, to = %change.to, %event, "state changed");
        Ok(change)
    }
}
