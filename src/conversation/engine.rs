//! The orchestrator: consumes classified frames, owns the conversation state,
//! and sequences turns.
//!
//! One async task runs the engine loop. It is the only place the
//! [`ConversationStateMachine`] is touched; turn tasks and the capture
//! thread report to it through channels.

use crate::audio::capture::{
    CaptureConfig, CaptureHandle, CaptureMessage, FrameConsumer, frame_queue, spawn_capture,
};
use crate::audio::frame::ClassifiedFrame;
use crate::audio::ring_buffer::RingBuffer;
use crate::audio::source::AudioFrameSource;
use crate::audio::vad::{Debounce, EnergyClassifier, SpeechClassifier, VadEvent};
use crate::collaborators::Collaborators;
use crate::config::EngineConfig;
use crate::conversation::cancel::CancellationToken;
use crate::conversation::events::{EngineEvent, EventEmitter};
use crate::conversation::interruption::{InterruptionController, InterruptionReport, PlaybackGate};
use crate::conversation::state::{ConversationEvent, ConversationState, ConversationStateMachine};
use crate::conversation::transcript::{ConversationTurn, TranscriptLog};
use crate::conversation::turn::{TurnRequest, TurnSettings, TurnUpdate, run_turn};
use crate::error::{Result, Stage, VoiceError};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

const CAPTURE_STOP_TIMEOUT: Duration = Duration::from_secs(1);

/// A configured engine, ready to start.
pub struct ConversationEngine {
    config: EngineConfig,
    collaborators: Collaborators,
    events: EventEmitter,
    capture: CaptureConfig,
}

impl ConversationEngine {
    pub fn new(config: EngineConfig, collaborators: Collaborators) -> Self {
        Self {
            config,
            collaborators,
            events: EventEmitter::default(),
            capture: CaptureConfig::default(),
        }
    }

    /// Deliver [`EngineEvent`]s to `tx`. Events are dropped if the channel is full.
    pub fn with_events(mut self, tx: crossbeam_channel::Sender<EngineEvent>) -> Self {
        self.events = EventEmitter::new(Some(tx));
        self
    }

    pub fn with_capture_config(mut self, capture: CaptureConfig) -> Self {
        self.capture = capture;
        self
    }

    /// Start capturing from `source` with the configured energy classifier.
    pub fn start<S>(self, source: S) -> Result<EngineHandle>
    where
        S: AudioFrameSource + 'static,
    {
        let classifier = EnergyClassifier::new(self.config.classifier);
        self.start_with_classifier(source, classifier)
    }

    /// Start capturing from `source`, classifying frames with `classifier`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start_with_classifier<S, C>(self, source: S, classifier: C) -> Result<EngineHandle>
    where
        S: AudioFrameSource + 'static,
        C: SpeechClassifier + 'static,
    {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| VoiceError::NoRuntime)?;

        let transcript = match &self.config.transcript_path {
            Some(path) => TranscriptLog::with_file(path)?,
            None => TranscriptLog::new(),
        };

        let ring = Arc::new(RingBuffer::new(
            self.config.ring_capacity,
            self.config.sample_rate,
        ));
        let (producer, consumer) = frame_queue(self.config.frame_queue_capacity);
        let capture = spawn_capture(source, classifier, Arc::clone(&ring), producer, self.capture)?;

        let (state_tx, state_rx) = watch::channel(ConversationState::Idle);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let (updates_tx, updates_rx) = mpsc::unbounded_channel();

        let engine_loop = EngineLoop {
            debounce: Debounce::new(self.config.vad),
            controller: InterruptionController::new(
                Arc::clone(&self.collaborators.synthesizer),
                self.config.timeouts.cancel_ack,
            ),
            settings: TurnSettings {
                timeouts: self.config.timeouts,
                apology_message: self.config.apology_message.clone(),
            },
            config: self.config,
            collaborators: self.collaborators,
            ring,
            frames: consumer,
            machine: ConversationStateMachine::new(),
            state_tx,
            events: self.events,
            transcript,
            runs: RunTracker::default(),
            utterance: None,
            turn: None,
            next_turn_id: 1,
            updates_tx,
            updates_rx,
        };

        tracing::info!(
            sample_rate = engine_loop.config.sample_rate,
            frame_samples = engine_loop.config.frame_samples,
            "conversation engine started"
        );
        let task = runtime.spawn(engine_loop.run(shutdown_rx));

        Ok(EngineHandle {
            shutdown: Some(shutdown_tx),
            task,
            capture,
            state: state_rx,
        })
    }
}

/// Host-side handle to a running engine.
pub struct EngineHandle {
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<EngineExit>,
    capture: CaptureHandle,
    state: watch::Receiver<ConversationState>,
}

impl EngineHandle {
    /// Snapshot of the current state.
    pub fn state(&self) -> ConversationState {
        *self.state.borrow()
    }

    /// A receiver that observes every state the engine settles in.
    pub fn watch_state(&self) -> watch::Receiver<ConversationState> {
        self.state.clone()
    }

    /// True once the engine loop has exited, e.g. after a capture failure.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Cancel any turn in flight, stop capture and return the transcript.
    ///
    /// A capture failure that ended the session is returned as the error.
    pub async fn stop(mut self) -> Result<Vec<ConversationTurn>> {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }

        let exit = self.task.await;

        let capture = self.capture;
        if tokio::task::spawn_blocking(move || capture.stop(CAPTURE_STOP_TIMEOUT))
            .await
            .is_err()
        {
            tracing::error!("capture shutdown task failed");
        }

        let EngineExit {
            transcript,
            failure,
        } = exit.map_err(|e| VoiceError::Other(format!("engine task failed: {}", e)))?;

        // Waits for the transcript writer to drain.
        let turns = tokio::task::spawn_blocking(move || transcript.into_turns())
            .await
            .map_err(|e| VoiceError::Other(format!("transcript shutdown failed: {}", e)))?;
        match failure {
            Some(error) => Err(error),
            None => Ok(turns),
        }
    }
}

struct EngineExit {
    transcript: TranscriptLog,
    failure: Option<VoiceError>,
}

/// The utterance currently being captured.
#[derive(Debug, Clone, Copy)]
struct UtteranceWindow {
    start: u64,
    deadline: tokio::time::Instant,
}

/// Where the current positive and negative frame runs began.
#[derive(Debug, Default)]
struct RunTracker {
    speech_start: Option<u64>,
    silence_start: Option<u64>,
    /// Start of the speech the debounce currently considers active.
    active_start: Option<u64>,
}

impl RunTracker {
    fn observe(&mut self, frame: &ClassifiedFrame) {
        if frame.is_speech == Some(true) {
            self.speech_start.get_or_insert(frame.start_position);
            self.silence_start = None;
        } else {
            self.silence_start.get_or_insert(frame.start_position);
            self.speech_start = None;
        }
    }
}

struct ActiveTurn {
    id: u64,
    token: CancellationToken,
    gate: Arc<PlaybackGate>,
    task: Option<JoinHandle<()>>,
    started_at: SystemTime,
    user_text: Option<String>,
    response_text: Option<String>,
}

struct EngineLoop {
    config: EngineConfig,
    collaborators: Collaborators,
    settings: TurnSettings,
    ring: Arc<RingBuffer>,
    frames: FrameConsumer,
    debounce: Debounce,
    machine: ConversationStateMachine,
    state_tx: watch::Sender<ConversationState>,
    events: EventEmitter,
    controller: InterruptionController,
    transcript: TranscriptLog,
    runs: RunTracker,
    utterance: Option<UtteranceWindow>,
    turn: Option<ActiveTurn>,
    next_turn_id: u64,
    updates_tx: mpsc::UnboundedSender<TurnUpdate>,
    updates_rx: mpsc::UnboundedReceiver<TurnUpdate>,
}

impl EngineLoop {
    async fn run(mut self, mut shutdown: oneshot::Receiver<()>) -> EngineExit {
        let failure = loop {
            let deadline = self.utterance.map(|u| u.deadline);

            // Frames before turn updates: a barge-in beats a turn finishing.
            tokio::select! {
                biased;
                _ = &mut shutdown => break None,
                message = self.frames.recv() => match message {
                    Some(CaptureMessage::Frame(frame)) => self.on_frame(frame).await,
                    Some(CaptureMessage::Failed(error)) if error.is_fatal() => break Some(error),
                    Some(CaptureMessage::Failed(error)) => {
                        tracing::warn!(error = %error, "audio source reported a recoverable error");
                    }
                    None => break Some(VoiceError::AudioCapture {
                        message: "capture thread exited".to_string(),
                    }),
                },
                Some(update) = self.updates_rx.recv() => self.on_turn_update(update),
                _ = sleep_until(deadline) => self.on_listening_timeout(),
            }
        };

        if let Some(error) = &failure {
            tracing::error!(error = %error, "audio capture failed, stopping engine");
            self.events.emit(EngineEvent::CaptureFailed {
                message: error.to_string(),
            });
        }
        self.shutdown().await;

        EngineExit {
            transcript: self.transcript,
            failure,
        }
    }

    async fn on_frame(&mut self, frame: ClassifiedFrame) {
        let dropped = self.frames.take_dropped();
        if dropped > 0 {
            tracing::warn!(dropped, "frame queue overflowed");
            self.events.emit(EngineEvent::FramesDropped { count: dropped });
        }

        self.runs.observe(&frame);
        let event = self.debounce.update(frame.is_speech);
        match event {
            Some(VadEvent::SpeechStarted) => {
                self.runs.active_start = self.runs.speech_start;
            }
            Some(VadEvent::SpeechEnded) => {
                self.runs.active_start = None;
            }
            None => {}
        }

        match (self.machine.state(), event) {
            (ConversationState::Speaking, Some(VadEvent::SpeechStarted)) => {
                self.barge_in(&frame).await;
            }
            (ConversationState::Idle, Some(VadEvent::SpeechStarted)) => {
                let onset = self.runs.speech_start.unwrap_or(frame.start_position);
                if self.apply(ConversationEvent::SpeechStarted) {
                    self.begin_utterance(onset);
                }
            }
            (ConversationState::Listening, Some(VadEvent::SpeechEnded)) => {
                let end = self.runs.silence_start.unwrap_or(frame.start_position);
                self.end_utterance(end);
            }
            (ConversationState::Listening, _) => {
                if let Some(window) = self.utterance
                    && frame.end_position >= window.start + self.config.max_utterance_samples
                {
                    tracing::info!("utterance reached maximum length, forcing end");
                    self.end_utterance(frame.end_position);
                }
            }
            _ => {}
        }
    }

    fn on_listening_timeout(&mut self) {
        if self.machine.state() != ConversationState::Listening {
            self.utterance = None;
            return;
        }
        tracing::info!("listening deadline passed, forcing end of utterance");
        self.end_utterance(self.ring.position());
    }

    /// Idle/Interrupted -> Listening side effect.
    fn begin_utterance(&mut self, start: u64) {
        self.ring.clear_before(start);
        self.utterance = Some(UtteranceWindow {
            start,
            deadline: tokio::time::Instant::now() + self.config.max_utterance,
        });
    }

    fn end_utterance(&mut self, end: u64) {
        let Some(window) = self.utterance.take() else {
            return;
        };
        let end = end.min(window.start + self.config.max_utterance_samples);
        let length = end.saturating_sub(window.start);

        if length < self.config.min_utterance_samples {
            tracing::debug!(
                duration_ms = self.config.samples_to_duration(length).as_millis() as u64,
                "utterance too short, ignoring"
            );
            self.apply(ConversationEvent::UtteranceRejected);
            self.resume_if_speaking();
            return;
        }

        if !self.apply(ConversationEvent::UtteranceCaptured) {
            return;
        }
        let samples = self.ring.read_span(window.start, end);
        self.debounce.reset();
        self.runs = RunTracker::default();
        self.spawn_turn(samples);
    }

    fn spawn_turn(&mut self, utterance: Vec<i16>) {
        let turn_id = self.next_turn_id;
        self.next_turn_id += 1;

        let token = CancellationToken::new();
        let gate = Arc::new(PlaybackGate::new(Arc::clone(&self.collaborators.sink)));
        let request = TurnRequest {
            turn_id,
            utterance,
            sample_rate: self.config.sample_rate,
            context: self.transcript.recent(self.config.context_turns).to_vec(),
            token: token.clone(),
            gate: Arc::clone(&gate),
        };
        tracing::debug!(
            turn_id,
            samples = request.utterance.len(),
            "utterance captured, starting turn"
        );

        let task = tokio::spawn(run_turn(
            request,
            self.collaborators.clone(),
            self.settings.clone(),
            self.updates_tx.clone(),
        ));

        self.turn = Some(ActiveTurn {
            id: turn_id,
            token,
            gate,
            task: Some(task),
            started_at: SystemTime::now(),
            user_text: None,
            response_text: None,
        });
    }

    fn on_turn_update(&mut self, update: TurnUpdate) {
        let Some(turn) = self.turn.as_mut() else {
            tracing::trace!(turn_id = update.turn_id(), "update for finished turn ignored");
            return;
        };
        if turn.id != update.turn_id() {
            tracing::trace!(turn_id = update.turn_id(), "update for stale turn ignored");
            return;
        }

        match update {
            TurnUpdate::Transcribed { text, .. } => {
                turn.user_text = Some(text);
                if self.apply(ConversationEvent::TranscriptReady) {
                    // Speech that began during Processing must re-trigger to barge in.
                    self.debounce.reset();
                }
            }
            TurnUpdate::Generated { response_text, .. } => {
                turn.response_text = Some(response_text);
            }
            TurnUpdate::Finished { .. } => {
                if self.apply(ConversationEvent::PlaybackFinished) {
                    self.finish_turn(false);
                    self.resume_if_speaking();
                }
            }
            TurnUpdate::Failed {
                turn_id,
                stage,
                reason,
            } => {
                let event = match self.machine.state() {
                    ConversationState::Processing => ConversationEvent::TranscriptUnusable,
                    _ => ConversationEvent::ResponseFailed,
                };
                if event == ConversationEvent::ResponseFailed {
                    turn.gate.halt();
                }
                self.turn = None;
                tracing::warn!(turn_id, %stage, %reason, "turn abandoned");
                self.events.emit(EngineEvent::TurnAbandoned {
                    turn_id,
                    stage,
                    reason,
                });
                if self.apply(event) {
                    self.resume_if_speaking();
                }
            }
        }
    }

    /// Speaking -> Interrupted -> Listening.
    async fn barge_in(&mut self, frame: &ClassifiedFrame) {
        let onset = self.runs.speech_start.unwrap_or(frame.start_position);
        if !self.apply(ConversationEvent::BargeIn) {
            return;
        }

        if let Some(mut turn) = self.turn.take() {
            let cancel_started = Instant::now();
            let outcome = self
                .controller
                .cancel(&turn.token, &turn.gate, turn.task.take())
                .await;

            let report = InterruptionReport {
                turn_id: turn.id,
                latency_to_silence: cancel_started.saturating_duration_since(frame.captured_at)
                    + outcome.silenced_after,
                outcome,
            };
            tracing::info!(
                turn_id = turn.id,
                latency_ms = report.latency_to_silence.as_millis() as u64,
                synthesizer_acknowledged = outcome.synthesizer_acknowledged,
                generator_acknowledged = outcome.generator_acknowledged,
                "response interrupted"
            );
            self.events.emit(EngineEvent::Interrupted(report));
            self.record_turn(turn, true);
        }

        if self.apply(ConversationEvent::CancellationSettled) {
            self.begin_utterance(onset);
        }
    }

    fn finish_turn(&mut self, interrupted: bool) {
        if let Some(turn) = self.turn.take() {
            self.record_turn(turn, interrupted);
        }
    }

    fn record_turn(&mut self, turn: ActiveTurn, interrupted: bool) {
        let record = ConversationTurn {
            id: turn.id,
            user_text: turn.user_text.unwrap_or_default(),
            response_text: turn.response_text,
            started_at: turn.started_at,
            ended_at: SystemTime::now(),
            interrupted,
        };
        tracing::info!(turn_id = record.id, interrupted, "turn completed");
        self.events.emit(EngineEvent::TurnCompleted(record.clone()));
        self.transcript.record(record);
    }

    /// Back in Idle with the user still talking: go straight to Listening.
    fn resume_if_speaking(&mut self) {
        if self.machine.state() != ConversationState::Idle || !self.debounce.is_active() {
            return;
        }
        let onset = self.runs.active_start.unwrap_or_else(|| self.ring.position());
        if self.apply(ConversationEvent::SpeechStarted) {
            self.begin_utterance(onset);
        }
    }

    async fn shutdown(&mut self) {
        if let Some(mut turn) = self.turn.take() {
            let outcome = self
                .controller
                .cancel(&turn.token, &turn.gate, turn.task.take())
                .await;
            tracing::debug!(
                turn_id = turn.id,
                acknowledged = outcome.fully_acknowledged(),
                "in-flight turn cancelled at shutdown"
            );
            self.events.emit(EngineEvent::TurnAbandoned {
                turn_id: turn.id,
                stage: if turn.user_text.is_some() {
                    Stage::Generation
                } else {
                    Stage::Transcription
                },
                reason: "engine stopped".to_string(),
            });
        }
        self.utterance = None;
        if self.machine.state() != ConversationState::Idle {
            self.apply(ConversationEvent::Shutdown);
        }
        tracing::info!(turns = self.transcript.len(), "conversation engine stopped");
    }

    /// Run `event` through the state machine and publish the change.
    fn apply(&mut self, event: ConversationEvent) -> bool {
        match self.machine.transition(event) {
            Ok(change) => {
                self.state_tx.send_replace(change.to);
                self.events.emit(EngineEvent::StateChanged(change));
                true
            }
            Err(e) => {
                tracing::warn!(error = %e, "ignored state machine event");
                false
            }
        }
    }
}

async fn sleep_until(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::source::{ChannelFrameSource, FrameFeeder};
    use crate::collaborators::mock::{
        MockGenerator, MockSynthesizer, MockTranscriber, RecordingSink,
    };
    use crossbeam_channel::Receiver;

    const FRAME: usize = 480;

    fn speech() -> Vec<i16> {
        vec![3000; FRAME]
    }

    fn silence() -> Vec<i16> {
        vec![0; FRAME]
    }

    struct Fixture {
        handle: EngineHandle,
        feeder: FrameFeeder,
        events: Receiver<EngineEvent>,
        transcriber: Arc<MockTranscriber>,
    }

    fn start(config: EngineConfig, transcriber: MockTranscriber) -> Fixture {
        let transcriber = Arc::new(transcriber);
        let collaborators = Collaborators::new(
            transcriber.clone(),
            Arc::new(MockGenerator::new().with_response("Sure.")),
            Arc::new(MockSynthesizer::new().with_chunks(1, 160)),
            Arc::new(RecordingSink::new()),
        );
        let (source, feeder) = ChannelFrameSource::new();
        let (tx, events) = crossbeam_channel::unbounded();
        let handle = ConversationEngine::new(config, collaborators)
            .with_events(tx)
            .start(source)
            .unwrap();
        Fixture {
            handle,
            feeder,
            events,
            transcriber,
        }
    }

    /// Consume events until the engine enters `state`; returns what was seen.
    async fn wait_for_state(
        events: &Receiver<EngineEvent>,
        state: ConversationState,
    ) -> Vec<EngineEvent> {
        let deadline = Instant::now() + Duration::from_secs(2);
        let mut seen = Vec::new();
        while Instant::now() < deadline {
            while let Ok(event) = events.try_recv() {
                let done = matches!(&event, EngineEvent::StateChanged(c) if c.to == state);
                seen.push(event);
                if done {
                    return seen;
                }
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("engine never entered {}; saw {:?}", state, seen);
    }

    fn states(events: &[EngineEvent]) -> Vec<ConversationState> {
        events
            .iter()
            .filter_map(|e| match e {
                EngineEvent::StateChanged(change) => Some(change.to),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_start_requires_runtime() {
        let (source, _feeder) = ChannelFrameSource::new();
        let collaborators = Collaborators::new(
            Arc::new(MockTranscriber::new()),
            Arc::new(MockGenerator::new()),
            Arc::new(MockSynthesizer::new()),
            Arc::new(RecordingSink::new()),
        );
        let result = ConversationEngine::new(EngineConfig::default(), collaborators).start(source);
        assert!(matches!(result, Err(VoiceError::NoRuntime)));
    }

    #[tokio::test]
    async fn test_start_reports_source_failure() {
        let (source, _feeder) = ChannelFrameSource::new();
        let collaborators = Collaborators::new(
            Arc::new(MockTranscriber::new()),
            Arc::new(MockGenerator::new()),
            Arc::new(MockSynthesizer::new()),
            Arc::new(RecordingSink::new()),
        );
        let result = ConversationEngine::new(EngineConfig::default(), collaborators)
            .start(source.with_start_failure());
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_utterance_excludes_trailing_silence_and_keeps_onset() {
        let fx = start(EngineConfig::default(), MockTranscriber::new());

        fx.feeder.send_repeated(&silence(), 10);
        fx.feeder.send_repeated(&speech(), 20);
        fx.feeder.send_repeated(&silence(), 30);

        wait_for_state(&fx.events, ConversationState::Processing).await;
        let seen = wait_for_state(&fx.events, ConversationState::Idle).await;
        assert_eq!(
            states(&seen),
            vec![ConversationState::Speaking, ConversationState::Idle]
        );
        assert_eq!(fx.transcriber.sample_counts(), vec![20 * FRAME]);
        assert_eq!(fx.handle.state(), ConversationState::Idle);

        fx.handle.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_max_utterance_forces_processing() {
        let config = EngineConfig {
            max_utterance_samples: 30 * FRAME as u64,
            ..EngineConfig::default()
        };
        let fx = start(config, MockTranscriber::new());

        fx.feeder.send_repeated(&speech(), 40);
        wait_for_state(&fx.events, ConversationState::Processing).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(fx.transcriber.sample_counts(), vec![30 * FRAME]);
        fx.handle.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_capture_failure_stops_engine() {
        let (source, feeder) = ChannelFrameSource::new();
        let collaborators = Collaborators::new(
            Arc::new(MockTranscriber::new()),
            Arc::new(MockGenerator::new()),
            Arc::new(MockSynthesizer::new()),
            Arc::new(RecordingSink::new()),
        );
        let (tx, events) = crossbeam_channel::unbounded();
        let handle = ConversationEngine::new(EngineConfig::default(), collaborators)
            .with_events(tx)
            .with_capture_config(CaptureConfig {
                poll_timeout: Duration::from_millis(1),
                max_consecutive_errors: 2,
            })
            .start(source)
            .unwrap();

        feeder.send_error("device unplugged");
        feeder.send_error("device unplugged");

        let deadline = Instant::now() + Duration::from_secs(2);
        while !handle.is_finished() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(handle.is_finished());
        assert!(
            events
                .try_iter()
                .any(|e| matches!(e, EngineEvent::CaptureFailed { .. }))
        );
        assert!(matches!(
            handle.stop().await,
            Err(VoiceError::AudioCapture { .. })
        ));
    }

    #[tokio::test]
    async fn test_stop_cancels_turn_in_flight() {
        let fx = start(
            EngineConfig::default(),
            MockTranscriber::new().with_delay(Duration::from_secs(10)),
        );

        fx.feeder.send_repeated(&speech(), 20);
        fx.feeder.send_repeated(&silence(), 30);
        wait_for_state(&fx.events, ConversationState::Processing).await;

        let started = Instant::now();
        let turns = fx.handle.stop().await.unwrap();
        assert!(turns.is_empty());
        assert!(started.elapsed() < Duration::from_secs(2));

        let rest: Vec<EngineEvent> = fx.events.try_iter().collect();
        assert_eq!(states(&rest), vec![ConversationState::Idle]);
        assert!(
            rest.iter()
                .any(|e| matches!(e, EngineEvent::TurnAbandoned { .. }))
        );
    }
}
