//! Observability events emitted by the engine.

use crate::conversation::interruption::InterruptionReport;
use crate::conversation::state::StateChange;
use crate::conversation::transcript::ConversationTurn;
use crate::error::Stage;
use serde::Serialize;

/// Something a host UI or logger may want to know about.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum EngineEvent {
    StateChanged(StateChange),
    /// A turn finished or was interrupted and has been added to the transcript.
    TurnCompleted(ConversationTurn),
    /// A turn was dropped without a transcript entry.
    TurnAbandoned {
        turn_id: u64,
        stage: Stage,
        reason: String,
    },
    Interrupted(InterruptionReport),
    /// Capture died; the engine is stopping.
    CaptureFailed { message: String },
    /// The capture queue overflowed and evicted this many frames.
    FramesDropped { count: u64 },
}

/// Non-blocking event fan-out. A full or closed channel drops the event.
#[derive(Debug, Clone, Default)]
pub struct EventEmitter {
    tx: Option<crossbeam_channel::Sender<EngineEvent>>,
}

impl EventEmitter {
    pub fn new(tx: Option<crossbeam_channel::Sender<EngineEvent>>) -> Self {
        Self { tx }
    }

    pub fn emit(&self, event: EngineEvent) {
        if let Some(ref tx) = self.tx
            && tx.try_send(event).is_err()
        {
            tracing::trace!("engine event dropped");
        }
    }
}
