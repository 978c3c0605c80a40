//! Interfaces to the external services a conversation turn calls out to.
//!
//! Everything here is implemented by the host: the engine only needs "audio
//! in, text out", "text in, text out" and "text in, audio chunks out", plus
//! a speaker. Mock implementations live in [`mock`].

pub mod mock;

use crate::audio::frame::AudioChunk;
use crate::conversation::cancel::CancellationToken;
use crate::conversation::transcript::ConversationTurn;
use crate::error::Result;
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::sync::Arc;
use std::time::Duration;

/// Incremental response text.
pub type TextStream = BoxStream<'static, Result<String>>;

/// Synthesized audio, consumable before synthesis has finished.
pub type AudioStream = BoxStream<'static, Result<AudioChunk>>;

/// Speech-to-text.
#[async_trait]
pub trait Transcriber: Send + Sync {
    /// Transcribe one utterance of 16-bit mono PCM.
    ///
    /// Implementations should return promptly once `cancel` fires.
    async fn transcribe(
        &self,
        samples: &[i16],
        sample_rate: u32,
        cancel: &CancellationToken,
    ) -> Result<String>;

    /// Name for logs.
    fn name(&self) -> &str;
}

/// Response text for a user utterance.
#[async_trait]
pub trait ResponseGenerator: Send + Sync {
    /// Produce the whole response at once.
    async fn generate(
        &self,
        user_text: &str,
        context: &[ConversationTurn],
        cancel: &CancellationToken,
    ) -> Result<String>;

    /// Produce the response as text increments.
    ///
    /// The default yields the result of [`generate`](Self::generate) as a
    /// single increment. Streams should end once `cancel` fires.
    async fn generate_stream(
        &self,
        user_text: &str,
        context: &[ConversationTurn],
        cancel: &CancellationToken,
    ) -> Result<TextStream> {
        let text = self.generate(user_text, context, cancel).await?;
        Ok(Box::pin(futures_util::stream::once(async move { Ok(text) })))
    }
}

/// Text-to-speech.
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    /// Open a chunk stream for `text`.
    async fn synthesize(&self, text: &str) -> Result<AudioStream>;

    /// Stop emitting chunks for the stream in progress.
    ///
    /// Resolves once the synthesizer has acknowledged; callers bound the wait.
    async fn cancel(&self) -> Result<()>;
}

/// Speaker.
pub trait AudioOutputSink: Send + Sync {
    /// Queue a chunk for playback. Must not block for the chunk's duration.
    fn play(&self, chunk: &AudioChunk) -> Result<()>;

    /// Silence output and drop everything queued.
    fn stop(&self);

    /// Audio queued but not yet heard.
    fn queued(&self) -> Duration {
        Duration::ZERO
    }
}

/// The four collaborators one engine talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub transcriber: Arc<dyn Transcriber>,
    pub generator: Arc<dyn ResponseGenerator>,
    pub synthesizer: Arc<dyn SpeechSynthesizer>,
    pub sink: Arc<dyn AudioOutputSink>,
}

impl Collaborators {
    pub fn new(
        transcriber: Arc<dyn Transcriber>,
        generator: Arc<dyn ResponseGenerator>,
        synthesizer: Arc<dyn SpeechSynthesizer>,
        sink: Arc<dyn AudioOutputSink>,
    ) -> Self {
        Self {
            transcriber,
            generator,
            synthesizer,
            sink,
        }
    }
}
