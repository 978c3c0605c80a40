//! Data types passed between capture, detection and playback.

use std::time::{Duration, Instant};

/// A fixed-length block of mono PCM samples from the capture device.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    /// PCM samples (16-bit signed integers).
    pub samples: Vec<i16>,
    /// Sequence number for ordering and gap detection.
    pub sequence: u64,
    /// Timestamp when this frame was captured.
    pub captured_at: Instant,
}

impl AudioFrame {
    /// Creates a new audio frame.
    pub fn new(samples: Vec<i16>, sequence: u64) -> Self {
        Self {
            samples,
            sequence,
            captured_at: Instant::now(),
        }
    }
}

/// A frame after it has been written to the ring buffer and classified.
///
/// Carries no samples: the audio lives in the ring buffer between
/// `start_position` and `end_position`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClassifiedFrame {
    pub sequence: u64,
    /// Absolute ring position of the first sample of this frame.
    pub start_position: u64,
    /// Absolute ring position one past the last sample of this frame.
    pub end_position: u64,
    /// `None` when the classifier could not decide.
    pub is_speech: Option<bool>,
    /// RMS level (0.0 to 1.0).
    pub level: f32,
    pub captured_at: Instant,
}

impl ClassifiedFrame {
    pub fn len(&self) -> u64 {
        self.end_position - self.start_position
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A block of synthesized audio ready for the output sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioChunk {
    pub samples: Vec<i16>,
    pub sample_rate: u32,
}

impl AudioChunk {
    pub fn new(samples: Vec<i16>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    /// Playback length of this chunk.
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_micros(self.samples.len() as u64 * 1_000_000 / u64::from(self.sample_rate))
    }
}
