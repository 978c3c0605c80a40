//! Barge-in handling: silencing output and cancelling the in-flight turn.

use crate::audio::frame::AudioChunk;
use crate::collaborators::{AudioOutputSink, SpeechSynthesizer};
use crate::conversation::cancel::CancellationToken;
use crate::error::Result;
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

/// Per-turn guard in front of the output sink.
///
/// Once halted, no further chunk reaches the sink: `play` and `halt` share a
/// lock, so a chunk is either played before the stop or not at all.
pub struct PlaybackGate {
    sink: Arc<dyn AudioOutputSink>,
    halted: Mutex<bool>,
}

impl PlaybackGate {
    pub fn new(sink: Arc<dyn AudioOutputSink>) -> Self {
        Self {
            sink,
            halted: Mutex::new(false),
        }
    }

    /// Forward `chunk` to the sink. Returns `Ok(false)` if the gate is halted.
    pub fn play(&self, chunk: &AudioChunk) -> Result<bool> {
        let halted = self.halted.lock().unwrap_or_else(|e| e.into_inner());
        if *halted {
            return Ok(false);
        }
        self.sink.play(chunk)?;
        Ok(true)
    }

    /// Stop the sink and refuse further chunks. Idempotent.
    pub fn halt(&self) {
        let mut halted = self.halted.lock().unwrap_or_else(|e| e.into_inner());
        if !*halted {
            *halted = true;
            self.sink.stop();
        }
    }

    pub fn is_halted(&self) -> bool {
        *self.halted.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Audio accepted by the sink but not yet heard.
    pub fn queued(&self) -> Duration {
        self.sink.queued()
    }
}

/// How a cancellation went.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CancellationOutcome {
    /// The synthesizer's `cancel()` returned within the bound.
    pub synthesizer_acknowledged: bool,
    /// The turn task (generation included) exited within the bound.
    pub generator_acknowledged: bool,
    /// From the start of cancellation to the sink being stopped.
    pub silenced_after: Duration,
    /// Total time spent in `cancel`.
    pub elapsed: Duration,
}

impl CancellationOutcome {
    pub fn fully_acknowledged(&self) -> bool {
        self.synthesizer_acknowledged && self.generator_acknowledged
    }
}

/// Reported to observers for every barge-in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct InterruptionReport {
    pub turn_id: u64,
    /// From capture of the frame that confirmed speech to the sink being stopped.
    pub latency_to_silence: Duration,
    pub outcome: CancellationOutcome,
}

/// Cancels the active turn with a bounded wait for acknowledgment.
pub struct InterruptionController {
    synthesizer: Arc<dyn SpeechSynthesizer>,
    ack_timeout: Duration,
}

impl InterruptionController {
    pub fn new(synthesizer: Arc<dyn SpeechSynthesizer>, ack_timeout: Duration) -> Self {
        Self {
            synthesizer,
            ack_timeout,
        }
    }

    pub fn ack_timeout(&self) -> Duration {
        self.ack_timeout
    }

    /// Cancel a turn.
    ///
    /// Output is silenced before anything is awaited. The synthesizer's
    /// acknowledgment and the turn task's exit are then awaited together,
    /// bounded by the ack timeout; a turn task still running at the deadline
    /// is aborted. Never takes much longer than the ack timeout.
    pub async fn cancel(
        &self,
        token: &CancellationToken,
        gate: &PlaybackGate,
        turn_task: Option<JoinHandle<()>>,
    ) -> CancellationOutcome {
        let started = Instant::now();
        token.cancel();
        gate.halt();
        let silenced_after = started.elapsed();

        let deadline = tokio::time::Instant::now() + self.ack_timeout;

        let synthesizer_ack = async {
            match tokio::time::timeout_at(deadline, self.synthesizer.cancel()).await {
                Ok(Ok(())) => true,
                Ok(Err(e)) => {
                    tracing::warn!(error = %e, "synthesizer failed to cancel");
                    false
                }
                Err(_) => false,
            }
        };

        let generator_ack = async {
            let Some(mut task) = turn_task else {
                return true;
            };
            match tokio::time::timeout_at(deadline, &mut task).await {
                Ok(Ok(())) => true,
                Ok(Err(e)) => {
                    if e.is_panic() {
                        tracing::error!("turn task panicked during cancellation");
                    }
                    true
                }
                Err(_) => {
                    task.abort();
                    false
                }
            }
        };

        let (synthesizer_acknowledged, generator_acknowledged) =
            tokio::join!(synthesizer_ack, generator_ack);

        let outcome = CancellationOutcome {
            synthesizer_acknowledged,
            generator_acknowledged,
            silenced_after,
            elapsed: started.elapsed(),
        };

        if !outcome.fully_acknowledged() {
            tracing::warn!(
                synthesizer_acknowledged,
                generator_acknowledged,
                timeout_ms = self.ack_timeout.as_millis() as u64,
                "cancellation not acknowledged in time, abandoning"
            );
        }
        outcome
    }
}
