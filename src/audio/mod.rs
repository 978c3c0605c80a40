//! Audio capture side: device sources, the ring buffer, voice activity
//! detection and the capture thread that ties them together.
//!
//! ```text
//! AudioFrameSource ──▶ capture thread ──▶ FrameQueue ──▶ engine loop
//!                        │       │                       (debounce)
//!                        ▼       ▼
//!                   RingBuffer  SpeechClassifier
//! ```

pub mod capture;
#[cfg(feature = "cpal-audio")]
pub mod cpal_input;
#[cfg(feature = "cpal-audio")]
pub mod cpal_output;
pub mod frame;
pub mod ring_buffer;
pub mod source;
pub mod vad;

pub use capture::{CaptureConfig, CaptureHandle, CaptureMessage, FrameConsumer, FrameProducer};
#[cfg(feature = "cpal-audio")]
pub use cpal_input::{CpalFrameSource, list_devices};
#[cfg(feature = "cpal-audio")]
pub use cpal_output::CpalOutputSink;
pub use frame::{AudioChunk, AudioFrame, ClassifiedFrame};
pub use ring_buffer::RingBuffer;
pub use source::{AudioFrameSource, ChannelFrameSource, FrameAssembler, FrameFeeder, WavFrameSource};
pub use vad::{
    Classification, Debounce, EnergyClassifier, EnergyClassifierConfig, SpeechClassifier,
    VadConfig, VadEvent, VoiceActivityDetector,
};
