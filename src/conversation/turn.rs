//! The work of one conversation turn: transcribe, generate, synthesize, play.
//!
//! Runs as its own task so the engine loop keeps consuming frames (and can
//! detect barge-in) while the turn waits on collaborators. Every await is
//! raced against the turn's cancellation token and bounded by a stage
//! timeout. A cancelled turn reports nothing; the engine already knows.

use crate::collaborators::{AudioStream, Collaborators, TextStream};
use crate::config::StageTimeouts;
use crate::conversation::cancel::CancellationToken;
use crate::conversation::interruption::PlaybackGate;
use crate::conversation::transcript::ConversationTurn;
use crate::error::{Result, Stage, VoiceError};
use futures_util::StreamExt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;

const DRAIN_POLL: Duration = Duration::from_millis(20);

/// Progress reports from a turn task to the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnUpdate {
    /// The utterance produced usable text; generation starts next.
    Transcribed { turn_id: u64, text: String },
    /// Generation finished; playback of the tail may still be running.
    Generated { turn_id: u64, response_text: String },
    /// Everything has been played.
    Finished { turn_id: u64 },
    Failed {
        turn_id: u64,
        stage: Stage,
        reason: String,
    },
}

impl TurnUpdate {
    pub fn turn_id(&self) -> u64 {
        match self {
            TurnUpdate::Transcribed { turn_id, .. }
            | TurnUpdate::Generated { turn_id, .. }
            | TurnUpdate::Finished { turn_id }
            | TurnUpdate::Failed { turn_id, .. } => *turn_id,
        }
    }
}

/// Inputs for one turn.
pub struct TurnRequest {
    pub turn_id: u64,
    pub utterance: Vec<i16>,
    pub sample_rate: u32,
    /// Recent turns, oldest first.
    pub context: Vec<ConversationTurn>,
    pub token: CancellationToken,
    pub gate: Arc<PlaybackGate>,
}

#[derive(Debug, Clone, Default)]
pub struct TurnSettings {
    pub timeouts: StageTimeouts,
    /// Spoken when generation fails.
    pub apology_message: Option<String>,
}

enum TurnExit {
    Cancelled,
    Failed(Stage, VoiceError),
}

impl TurnExit {
    /// Blame the stage the error names, falling back to the one that was running.
    fn failed(running: Stage, error: VoiceError) -> Self {
        TurnExit::Failed(error.stage().unwrap_or(running), error)
    }
}

type TurnResult<T> = std::result::Result<T, TurnExit>;

/// Run a turn to completion, reporting through `updates`.
pub async fn run_turn(
    request: TurnRequest,
    collaborators: Collaborators,
    settings: TurnSettings,
    updates: UnboundedSender<TurnUpdate>,
) {
    let turn_id = request.turn_id;
    let token = request.token.clone();

    match drive(&request, &collaborators, &settings, &updates).await {
        Ok(()) => {
            let _ = updates.send(TurnUpdate::Finished { turn_id });
        }
        Err(TurnExit::Cancelled) => {
            tracing::debug!(turn_id, "turn cancelled");
        }
        Err(TurnExit::Failed(_, _)) if token.is_cancelled() => {
            tracing::debug!(turn_id, "turn failed after cancellation");
        }
        Err(TurnExit::Failed(stage, error)) => {
            tracing::warn!(turn_id, %stage, error = %error, "turn failed");
            let _ = updates.send(TurnUpdate::Failed {
                turn_id,
                stage,
                reason: error.to_string(),
            });
        }
    }
}

async fn drive(
    request: &TurnRequest,
    collaborators: &Collaborators,
    settings: &TurnSettings,
    updates: &UnboundedSender<TurnUpdate>,
) -> TurnResult<()> {
    let token = &request.token;
    let timeouts = &settings.timeouts;

    let text = guarded(
        token,
        timeouts.transcription,
        Stage::Transcription,
        collaborators
            .transcriber
            .transcribe(&request.utterance, request.sample_rate, token),
    )
    .await?;

    if !is_usable_transcript(&text) {
        return Err(TurnExit::Failed(
            Stage::Transcription,
            VoiceError::Transcription {
                message: "empty transcript".to_string(),
            },
        ));
    }
    let text = text.trim().to_string();
    tracing::debug!(
        turn_id = request.turn_id,
        transcriber = collaborators.transcriber.name(),
        chars = text.len(),
        "utterance transcribed"
    );
    let _ = updates.send(TurnUpdate::Transcribed {
        turn_id: request.turn_id,
        text: text.clone(),
    });

    let response = match respond(request, collaborators, settings, &text).await {
        Err(TurnExit::Failed(Stage::Generation, error)) => {
            if let Some(apology) = settings.apology_message.as_deref() {
                speak(request, collaborators, timeouts, apology).await?;
                drain(request).await?;
            }
            return Err(TurnExit::Failed(Stage::Generation, error));
        }
        other => other?,
    };

    let _ = updates.send(TurnUpdate::Generated {
        turn_id: request.turn_id,
        response_text: response,
    });
    drain(request).await
}

/// Stream the response, speaking each sentence as soon as it is complete.
async fn respond(
    request: &TurnRequest,
    collaborators: &Collaborators,
    settings: &TurnSettings,
    user_text: &str,
) -> TurnResult<String> {
    let token = &request.token;
    let timeouts = &settings.timeouts;

    let mut stream: TextStream = guarded(
        token,
        timeouts.generation,
        Stage::Generation,
        collaborators
            .generator
            .generate_stream(user_text, &request.context, token),
    )
    .await?;

    let mut splitter = SentenceSplitter::new();
    let mut response = String::new();
    loop {
        let next = guarded(token, timeouts.generation, Stage::Generation, async {
            Ok::<_, VoiceError>(stream.next().await)
        })
        .await?;

        let increment = match next {
            None => break,
            Some(Err(e)) => return Err(TurnExit::failed(Stage::Generation, e)),
            Some(Ok(increment)) => increment,
        };
        response.push_str(&increment);

        for sentence in splitter.push(&increment) {
            speak(request, collaborators, timeouts, &sentence).await?;
        }
    }

    if let Some(rest) = splitter.finish() {
        speak(request, collaborators, timeouts, &rest).await?;
    }
    Ok(response)
}

/// Synthesize `text` and feed its chunks to the playback gate.
async fn speak(
    request: &TurnRequest,
    collaborators: &Collaborators,
    timeouts: &StageTimeouts,
    text: &str,
) -> TurnResult<()> {
    let token = &request.token;
    let mut stream: AudioStream = guarded(
        token,
        timeouts.synthesis_connect,
        Stage::Synthesis,
        collaborators.synthesizer.synthesize(text),
    )
    .await?;

    loop {
        let next = guarded(token, timeouts.synthesis_chunk, Stage::Synthesis, async {
            Ok::<_, VoiceError>(stream.next().await)
        })
        .await?;

        let chunk = match next {
            None => return Ok(()),
            Some(Err(e)) => return Err(TurnExit::failed(Stage::Synthesis, e)),
            Some(Ok(chunk)) => chunk,
        };

        match request.gate.play(&chunk) {
            Ok(true) => {}
            Ok(false) => return Err(TurnExit::Cancelled),
            Err(e) => return Err(TurnExit::failed(Stage::Playback, e)),
        }
    }
}

/// Wait until the sink has played everything queued.
async fn drain(request: &TurnRequest) -> TurnResult<()> {
    loop {
        let queued = request.gate.queued();
        if queued.is_zero() {
            return Ok(());
        }
        tokio::select! {
            biased;
            _ = request.token.cancelled() => return Err(TurnExit::Cancelled),
            _ = tokio::time::sleep(queued.min(DRAIN_POLL)) => {}
        }
    }
}

/// Race `future` against cancellation and a stage timeout.
async fn guarded<T, F>(
    token: &CancellationToken,
    limit: Duration,
    stage: Stage,
    future: F,
) -> TurnResult<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(TurnExit::Cancelled),
        result = tokio::time::timeout(limit, future) => match result {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) if token.is_cancelled() => Err(TurnExit::Cancelled),
            Ok(Err(error)) => Err(TurnExit::failed(stage, error)),
            Err(_) => Err(TurnExit::Failed(
                stage,
                VoiceError::Timeout {
                    stage,
                    after_ms: limit.as_millis() as u64,
                },
            )),
        },
    }
}

/// A transcript is usable if it has at least one alphanumeric character.
fn is_usable_transcript(text: &str) -> bool {
    text.chars().any(char::is_alphanumeric)
}

fn is_terminator(c: char) -> bool {
    matches!(c, '.' | '!' | '?' | '…' | '。' | '！' | '？')
}

fn is_closer(c: char) -> bool {
    is_terminator(c) || matches!(c, '"' | '\'' | ')' | '”' | '’')
}

/// Splits streamed text into sentences so synthesis can start early.
///
/// A sentence ends at terminal punctuation followed by whitespace, or at a
/// newline. Text without a boundary stays buffered until [`finish`](Self::finish).
#[derive(Debug, Default)]
pub struct SentenceSplitter {
    buffer: String,
}

impl SentenceSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add text and take every sentence it completes.
    pub fn push(&mut self, text: &str) -> Vec<String> {
        self.buffer.push_str(text);
        let mut sentences = Vec::new();
        while let Some(end) = find_boundary(&self.buffer) {
            let sentence = self.buffer[..end].trim().to_string();
            self.buffer.drain(..end);
            if !sentence.is_empty() {
                sentences.push(sentence);
            }
        }
        sentences
    }

    /// Take whatever is left.
    pub fn finish(&mut self) -> Option<String> {
        let rest = self.buffer.trim().to_string();
        self.buffer.clear();
        (!rest.is_empty()).then_some(rest)
    }
}

fn find_boundary(text: &str) -> Option<usize> {
    let mut chars = text.char_indices().peekable();
    while let Some((index, c)) = chars.next() {
        if c == '\n' {
            return Some(index + 1);
        }
        if !is_terminator(c) {
            continue;
        }
        let mut end = index + c.len_utf8();
        while let Some(&(next_index, next)) = chars.peek() {
            if !is_closer(next) {
                break;
            }
            end = next_index + next.len_utf8();
            chars.next();
        }
        if chars.peek().is_some_and(|&(_, next)| next.is_whitespace()) {
            return Some(end);
        }
    }
    None
}
