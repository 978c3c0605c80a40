//! Default configuration constants for parley.
//!
//! Shared by the TOML config layer and the runtime `EngineConfig` so both
//! agree on the same values.

/// Default audio sample rate in Hz.
///
/// 16kHz is the standard input rate for speech recognition.
pub const SAMPLE_RATE: u32 = 16000;

/// Default frame duration in milliseconds (480 samples at 16kHz).
pub const FRAME_DURATION_MS: u32 = 30;

/// Seconds of audio retained by the ring buffer.
///
/// Must cover the longest utterance the engine will accept.
pub const RING_BUFFER_SECS: u32 = 30;

/// Frames the capture thread may queue ahead of the orchestrator before the
/// oldest ones are dropped.
pub const FRAME_QUEUE_CAPACITY: usize = 256;

/// Default RMS threshold (0.0 to 1.0) above which a frame counts as speech.
pub const VAD_THRESHOLD: f32 = 0.02;

/// Consecutive speech frames needed before speech is considered started.
pub const SPEECH_DEBOUNCE_FRAMES: u32 = 3;

/// Continuous silence needed after speech before the utterance ends.
pub const SILENCE_DURATION_MS: u32 = 800;

/// Utterances shorter than this are treated as noise and never transcribed.
pub const MIN_UTTERANCE_MS: u32 = 200;

/// Listening is forced to end once an utterance reaches this length.
pub const MAX_UTTERANCE_MS: u32 = 30_000;

/// Completed turns handed to the response generator as context.
pub const CONTEXT_TURNS: usize = 8;

/// Upper bound on a single transcription call.
pub const TRANSCRIPTION_TIMEOUT_MS: u64 = 15_000;

/// Upper bound on waiting for the next increment of generated text.
pub const GENERATION_TIMEOUT_MS: u64 = 30_000;

/// Upper bound on opening a synthesis stream.
pub const SYNTHESIS_CONNECT_TIMEOUT_MS: u64 = 10_000;

/// Upper bound on waiting for the next synthesized audio chunk.
pub const SYNTHESIS_CHUNK_TIMEOUT_MS: u64 = 10_000;

/// How long an interruption waits for collaborators to acknowledge cancellation.
pub const CANCEL_ACK_TIMEOUT_MS: u64 = 200;

/// Consecutive failed device reads before capture is declared dead.
pub const MAX_CONSECUTIVE_READ_ERRORS: u32 = 10;

/// How long the capture thread waits for a frame before re-checking shutdown.
pub const CAPTURE_POLL_MS: u64 = 10;
