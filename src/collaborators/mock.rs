//! Mock collaborators for tests and dry runs.

use super::{
    AudioOutputSink, AudioStream, ResponseGenerator, SpeechSynthesizer, TextStream, Transcriber,
};
use crate::audio::frame::AudioChunk;
use crate::conversation::cancel::CancellationToken;
use crate::conversation::transcript::ConversationTurn;
use crate::defaults;
use crate::error::{Result, Stage, VoiceError};
use async_trait::async_trait;
use futures_util::StreamExt;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Mock transcriber that records calls and detects overlapping ones.
#[derive(Debug)]
pub struct MockTranscriber {
    response: String,
    responses: Mutex<VecDeque<String>>,
    should_fail: bool,
    delay: Duration,
    calls: Mutex<Vec<usize>>,
    in_flight: AtomicUsize,
    overlapping_calls: AtomicUsize,
}

impl MockTranscriber {
    /// Create a new mock transcriber with default settings
    pub fn new() -> Self {
        Self {
            response: "mock transcription".to_string(),
            responses: Mutex::new(VecDeque::new()),
            should_fail: false,
            delay: Duration::ZERO,
            calls: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            overlapping_calls: AtomicUsize::new(0),
        }
    }

    /// Configure the mock to return a specific response
    pub fn with_response(mut self, response: &str) -> Self {
        self.response = response.to_string();
        self
    }

    /// Responses for successive calls; the fixed response is used once they run out.
    pub fn with_responses(self, responses: &[&str]) -> Self {
        *self.responses.lock().unwrap_or_else(|e| e.into_inner()) =
            responses.iter().map(|r| r.to_string()).collect();
        self
    }

    /// Configure the mock to fail on transcribe
    pub fn with_failure(mut self) -> Self {
        self.should_fail = true;
        self
    }

    /// Take this long per call (cancellable).
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Sample count of each utterance received, in call order.
    pub fn sample_counts(&self) -> Vec<usize> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Calls that started while another was still running.
    pub fn overlapping_calls(&self) -> usize {
        self.overlapping_calls.load(Ordering::SeqCst)
    }
}

impl Default for MockTranscriber {
    fn default() -> Self {
        Self::new()
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Transcriber for MockTranscriber {
    async fn transcribe(
        &self,
        samples: &[i16],
        _sample_rate: u32,
        cancel: &CancellationToken,
    ) -> Result<String> {
        if self.in_flight.fetch_add(1, Ordering::SeqCst) > 0 {
            self.overlapping_calls.fetch_add(1, Ordering::SeqCst);
        }
        let _guard = InFlight(&self.in_flight);
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(samples.len());

        if !self.delay.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(self.delay) => {}
                _ = cancel.cancelled() => {
                    return Err(VoiceError::Cancelled { stage: Stage::Transcription });
                }
            }
        }

        if self.should_fail {
            return Err(VoiceError::Transcription {
                message: "mock transcription failure".to_string(),
            });
        }

        let next = self
            .responses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();
        Ok(next.unwrap_or_else(|| self.response.clone()))
    }

    fn name(&self) -> &str {
        "mock"
    }
}

/// One recorded generator call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratorCall {
    pub user_text: String,
    pub context_turns: usize,
}

/// Mock response generator that streams a scripted list of increments.
#[derive(Debug)]
pub struct MockGenerator {
    increments: Vec<String>,
    increment_delay: Duration,
    fail_after: Option<usize>,
    calls: Mutex<Vec<GeneratorCall>>,
    observed_cancel: Arc<AtomicBool>,
}

impl MockGenerator {
    pub fn new() -> Self {
        Self {
            increments: vec!["mock response.".to_string()],
            increment_delay: Duration::ZERO,
            fail_after: None,
            calls: Mutex::new(Vec::new()),
            observed_cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Respond with `response` as a single increment.
    pub fn with_response(mut self, response: &str) -> Self {
        self.increments = vec![response.to_string()];
        self
    }

    /// Respond with these increments, in order.
    pub fn with_increments(mut self, increments: &[&str]) -> Self {
        self.increments = increments.iter().map(|s| s.to_string()).collect();
        self
    }

    /// Wait this long before each increment.
    pub fn with_increment_delay(mut self, delay: Duration) -> Self {
        self.increment_delay = delay;
        self
    }

    /// Fail immediately.
    pub fn with_failure(mut self) -> Self {
        self.fail_after = Some(0);
        self
    }

    /// Fail after yielding `count` increments.
    pub fn with_failure_after(mut self, count: usize) -> Self {
        self.fail_after = Some(count);
        self
    }

    pub fn calls(&self) -> Vec<GeneratorCall> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// True once a stream stopped early because its token was cancelled.
    pub fn observed_cancel(&self) -> bool {
        self.observed_cancel.load(Ordering::SeqCst)
    }

    fn record(&self, user_text: &str, context: &[ConversationTurn]) {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(GeneratorCall {
                user_text: user_text.to_string(),
                context_turns: context.len(),
            });
    }
}

fn generation_failure() -> VoiceError {
    VoiceError::Generation {
        message: "mock generation failure".to_string(),
    }
}

impl Default for MockGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ResponseGenerator for MockGenerator {
    async fn generate(
        &self,
        user_text: &str,
        context: &[ConversationTurn],
        cancel: &CancellationToken,
    ) -> Result<String> {
        let mut stream = self.generate_stream(user_text, context, cancel).await?;
        let mut text = String::new();
        while let Some(increment) = stream.next().await {
            text.push_str(&increment?);
        }
        if cancel.is_cancelled() {
            return Err(VoiceError::Cancelled {
                stage: Stage::Generation,
            });
        }
        Ok(text)
    }

    async fn generate_stream(
        &self,
        user_text: &str,
        context: &[ConversationTurn],
        cancel: &CancellationToken,
    ) -> Result<TextStream> {
        self.record(user_text, context);
        if self.fail_after == Some(0) {
            return Err(generation_failure());
        }

        let increments: VecDeque<String> = self.increments.iter().cloned().collect();
        let delay = self.increment_delay;
        let fail_after = self.fail_after;
        let cancel = cancel.clone();
        let observed_cancel = Arc::clone(&self.observed_cancel);

        let stream = futures_util::stream::unfold(
            (increments, 0usize, false),
            move |(mut pending, yielded, failed)| {
                let cancel = cancel.clone();
                let observed_cancel = Arc::clone(&observed_cancel);
                async move {
                    if failed {
                        return None;
                    }
                    if !delay.is_zero() {
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = cancel.cancelled() => {}
                        }
                    }
                    if cancel.is_cancelled() {
                        observed_cancel.store(true, Ordering::SeqCst);
                        return None;
                    }
                    if fail_after == Some(yielded) {
                        return Some((Err(generation_failure()), (pending, yielded, true)));
                    }
                    let next = pending.pop_front()?;
                    Some((Ok(next), (pending, yielded + 1, false)))
                }
            },
        );
        Ok(stream.boxed())
    }
}

/// How a [`MockSynthesizer`] responds to `cancel()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelAck {
    Immediate,
    Delayed(Duration),
    Never,
}

/// Mock synthesizer emitting fixed-size chunks at a configurable pace.
#[derive(Debug)]
pub struct MockSynthesizer {
    chunks_per_text: usize,
    chunk_samples: usize,
    chunk_delay: Duration,
    connect_delay: Duration,
    should_fail: bool,
    fail_after_chunks: Option<usize>,
    cancel_ack: CancelAck,
    current: Mutex<Option<Arc<AtomicBool>>>,
    texts: Mutex<Vec<String>>,
    chunks_emitted: Arc<AtomicUsize>,
    cancel_calls: AtomicUsize,
}

impl MockSynthesizer {
    pub fn new() -> Self {
        Self {
            chunks_per_text: 3,
            chunk_samples: 1600,
            chunk_delay: Duration::ZERO,
            connect_delay: Duration::ZERO,
            should_fail: false,
            fail_after_chunks: None,
            cancel_ack: CancelAck::Immediate,
            current: Mutex::new(None),
            texts: Mutex::new(Vec::new()),
            chunks_emitted: Arc::new(AtomicUsize::new(0)),
            cancel_calls: AtomicUsize::new(0),
        }
    }

    pub fn with_chunks(mut self, count: usize, samples: usize) -> Self {
        self.chunks_per_text = count;
        self.chunk_samples = samples;
        self
    }

    /// Wait this long before each chunk.
    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = delay;
        self
    }

    /// Wait this long before the stream opens.
    pub fn with_connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = delay;
        self
    }

    /// Fail to open any stream.
    pub fn with_failure(mut self) -> Self {
        self.should_fail = true;
        self
    }

    /// Fail mid-stream after `count` chunks.
    pub fn with_failure_after(mut self, count: usize) -> Self {
        self.fail_after_chunks = Some(count);
        self
    }

    pub fn with_cancel_ack(mut self, ack: CancelAck) -> Self {
        self.cancel_ack = ack;
        self
    }

    /// Texts passed to `synthesize`, in order.
    pub fn texts(&self) -> Vec<String> {
        self.texts.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn chunks_emitted(&self) -> usize {
        self.chunks_emitted.load(Ordering::SeqCst)
    }

    pub fn cancel_calls(&self) -> usize {
        self.cancel_calls.load(Ordering::SeqCst)
    }
}

impl Default for MockSynthesizer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SpeechSynthesizer for MockSynthesizer {
    async fn synthesize(&self, text: &str) -> Result<AudioStream> {
        self.texts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(text.to_string());

        if !self.connect_delay.is_zero() {
            tokio::time::sleep(self.connect_delay).await;
        }
        if self.should_fail {
            return Err(VoiceError::Synthesis {
                message: "mock synthesis failure".to_string(),
            });
        }

        let halted = Arc::new(AtomicBool::new(false));
        *self.current.lock().unwrap_or_else(|e| e.into_inner()) = Some(Arc::clone(&halted));

        let count = self.chunks_per_text;
        let samples = self.chunk_samples;
        let delay = self.chunk_delay;
        let fail_after = self.fail_after_chunks;
        let emitted = Arc::clone(&self.chunks_emitted);

        let stream = futures_util::stream::unfold(0usize, move |index| {
            let halted = Arc::clone(&halted);
            let emitted = Arc::clone(&emitted);
            async move {
                if index >= count || halted.load(Ordering::SeqCst) {
                    return None;
                }
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                if halted.load(Ordering::SeqCst) {
                    return None;
                }
                if fail_after == Some(index) {
                    let error = VoiceError::Synthesis {
                        message: "mock synthesis failed mid-stream".to_string(),
                    };
                    return Some((Err(error), count));
                }
                emitted.fetch_add(1, Ordering::SeqCst);
                let chunk = AudioChunk::new(vec![1000; samples], defaults::SAMPLE_RATE);
                Some((Ok(chunk), index + 1))
            }
        });
        Ok(stream.boxed())
    }

    async fn cancel(&self) -> Result<()> {
        self.cancel_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(halted) = self
            .current
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
        {
            halted.store(true, Ordering::SeqCst);
        }

        match self.cancel_ack {
            CancelAck::Immediate => Ok(()),
            CancelAck::Delayed(delay) => {
                tokio::time::sleep(delay).await;
                Ok(())
            }
            CancelAck::Never => std::future::pending().await,
        }
    }
}

/// What happened at a [`RecordingSink`], in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkEvent {
    Played { samples: usize },
    Stopped,
}

/// Output sink that records plays and stops instead of making sound.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<SinkEvent>>,
    should_fail: bool,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every `play`.
    pub fn with_failure(mut self) -> Self {
        self.should_fail = true;
        self
    }

    pub fn events(&self) -> Vec<SinkEvent> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn played_count(&self) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, SinkEvent::Played { .. }))
            .count()
    }

    pub fn stop_count(&self) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, SinkEvent::Stopped))
            .count()
    }

    /// Chunks played after the first stop.
    pub fn played_after_stop(&self) -> usize {
        self.events()
            .iter()
            .skip_while(|e| !matches!(e, SinkEvent::Stopped))
            .filter(|e| matches!(e, SinkEvent::Played { .. }))
            .count()
    }
}

impl AudioOutputSink for RecordingSink {
    fn play(&self, chunk: &AudioChunk) -> Result<()> {
        if self.should_fail {
            return Err(VoiceError::AudioOutput {
                message: "mock output failure".to_string(),
            });
        }
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(SinkEvent::Played {
                samples: chunk.samples.len(),
            });
        Ok(())
    }

    fn stop(&self) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(SinkEvent::Stopped);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_transcriber_returns_response() {
        let transcriber = MockTranscriber::new().with_response("Hello, this is a test");
        let token = CancellationToken::new();

        let result = transcriber.transcribe(&[0i16; 1000], 16000, &token).await;

        assert_eq!(result.unwrap(), "Hello, this is a test");
        assert_eq!(transcriber.sample_counts(), vec![1000]);
    }

    #[tokio::test]
    async fn test_mock_transcriber_returns_error_when_configured() {
        let transcriber = MockTranscriber::new().with_failure();
        let token = CancellationToken::new();

        match transcriber.transcribe(&[0i16; 10], 16000, &token).await {
            Err(VoiceError::Transcription { message }) => {
                assert_eq!(message, "mock transcription failure");
            }
            other => panic!("Expected Transcription error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_mock_transcriber_scripted_responses() {
        let transcriber = MockTranscriber::new()
            .with_response("fallback")
            .with_responses(&["first", "second"]);
        let token = CancellationToken::new();

        for expected in ["first", "second", "fallback"] {
            let text = transcriber.transcribe(&[], 16000, &token).await.unwrap();
            assert_eq!(text, expected);
        }
        assert_eq!(transcriber.call_count(), 3);
    }

    #[tokio::test]
    async fn test_mock_transcriber_detects_overlap() {
        let transcriber = Arc::new(MockTranscriber::new().with_delay(Duration::from_millis(50)));
        let token = CancellationToken::new();

        let a = {
            let t = Arc::clone(&transcriber);
            let token = token.clone();
            tokio::spawn(async move { t.transcribe(&[0; 4], 16000, &token).await })
        };
        let b = {
            let t = Arc::clone(&transcriber);
            let token = token.clone();
            tokio::spawn(async move { t.transcribe(&[0; 4], 16000, &token).await })
        };
        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();

        assert_eq!(transcriber.overlapping_calls(), 1);
    }

    #[tokio::test]
    async fn test_mock_transcriber_honours_cancel() {
        let transcriber = MockTranscriber::new().with_delay(Duration::from_secs(10));
        let token = CancellationToken::new();
        token.cancel();

        let result = transcriber.transcribe(&[0; 4], 16000, &token).await;
        assert!(matches!(
            result,
            Err(VoiceError::Cancelled {
                stage: Stage::Transcription
            })
        ));
    }

    #[tokio::test]
    async fn test_mock_generator_streams_increments() {
        let generator = MockGenerator::new().with_increments(&["Hello. ", "How are ", "you?"]);
        let token = CancellationToken::new();

        let stream = generator.generate_stream("hi", &[], &token).await.unwrap();
        let parts: Vec<String> = stream.map(|r| r.unwrap()).collect().await;

        assert_eq!(parts, vec!["Hello. ", "How are ", "you?"]);
        assert_eq!(
            generator.calls(),
            vec![GeneratorCall {
                user_text: "hi".to_string(),
                context_turns: 0
            }]
        );
    }

    #[tokio::test]
    async fn test_mock_generator_generate_concatenates() {
        let generator = MockGenerator::new().with_increments(&["a", "b"]);
        let token = CancellationToken::new();
        assert_eq!(generator.generate("x", &[], &token).await.unwrap(), "ab");
    }

    #[tokio::test]
    async fn test_mock_generator_failure_after_increments() {
        let generator = MockGenerator::new()
            .with_increments(&["one. ", "two. "])
            .with_failure_after(1);
        let token = CancellationToken::new();

        let mut stream = generator.generate_stream("x", &[], &token).await.unwrap();
        assert_eq!(stream.next().await.unwrap().unwrap(), "one. ");
        assert!(matches!(
            stream.next().await,
            Some(Err(VoiceError::Generation { .. }))
        ));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_mock_generator_immediate_failure() {
        let generator = MockGenerator::new().with_failure();
        let token = CancellationToken::new();
        assert!(generator.generate_stream("x", &[], &token).await.is_err());
    }

    #[tokio::test]
    async fn test_mock_generator_stops_on_cancel() {
        let generator = MockGenerator::new()
            .with_increments(&["a", "b", "c"])
            .with_increment_delay(Duration::from_secs(10));
        let token = CancellationToken::new();

        let mut stream = generator.generate_stream("x", &[], &token).await.unwrap();
        token.cancel();
        assert!(stream.next().await.is_none());
        assert!(generator.observed_cancel());
    }

    #[tokio::test]
    async fn test_mock_synthesizer_emits_chunks() {
        let synth = MockSynthesizer::new().with_chunks(4, 160);
        let stream = synth.synthesize("hello").await.unwrap();
        let chunks: Vec<AudioChunk> = stream.map(|r| r.unwrap()).collect().await;

        assert_eq!(chunks.len(), 4);
        assert!(chunks.iter().all(|c| c.samples.len() == 160));
        assert_eq!(synth.chunks_emitted(), 4);
        assert_eq!(synth.texts(), vec!["hello".to_string()]);
    }

    #[tokio::test]
    async fn test_mock_synthesizer_cancel_halts_stream() {
        let synth = MockSynthesizer::new().with_chunks(10, 16);
        let mut stream = synth.synthesize("hello").await.unwrap();

        assert!(stream.next().await.is_some());
        synth.cancel().await.unwrap();
        assert!(stream.next().await.is_none());
        assert_eq!(synth.cancel_calls(), 1);
        assert_eq!(synth.chunks_emitted(), 1);
    }

    #[tokio::test]
    async fn test_mock_synthesizer_never_acks() {
        let synth = MockSynthesizer::new().with_cancel_ack(CancelAck::Never);
        let result = tokio::time::timeout(Duration::from_millis(20), synth.cancel()).await;
        assert!(result.is_err());
        assert_eq!(synth.cancel_calls(), 1);
    }

    #[tokio::test]
    async fn test_mock_synthesizer_fails_mid_stream() {
        let synth = MockSynthesizer::new().with_chunks(3, 16).with_failure_after(1);
        let mut stream = synth.synthesize("hello").await.unwrap();

        assert!(stream.next().await.unwrap().is_ok());
        assert!(matches!(
            stream.next().await,
            Some(Err(VoiceError::Synthesis { .. }))
        ));
        assert!(stream.next().await.is_none());
    }

    #[test]
    fn test_recording_sink_tracks_order() {
        let sink = RecordingSink::new();
        let chunk = AudioChunk::new(vec![0; 8], 16000);

        sink.play(&chunk).unwrap();
        sink.stop();
        sink.play(&chunk).unwrap();

        assert_eq!(sink.played_count(), 2);
        assert_eq!(sink.stop_count(), 1);
        assert_eq!(sink.played_after_stop(), 1);
        assert_eq!(
            sink.events(),
            vec![
                SinkEvent::Played { samples: 8 },
                SinkEvent::Stopped,
                SinkEvent::Played { samples: 8 }
            ]
        );
    }

    #[test]
    fn test_recording_sink_failure() {
        let sink = RecordingSink::new().with_failure();
        let chunk = AudioChunk::new(vec![0; 8], 16000);
        assert!(matches!(
            sink.play(&chunk),
            Err(VoiceError::AudioOutput { .. })
        ));
    }
}
