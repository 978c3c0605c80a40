//! Audio frame sources: the device abstraction the capture thread polls.

use crate::error::{Result, VoiceError};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use std::collections::VecDeque;
use std::io::Read;
use std::path::Path;
use std::time::{Duration, Instant};

/// Trait for audio input devices.
///
/// Implementations own whatever hardware callback feeds them and hand the
/// capture thread fixed-size frames of mono PCM at the engine sample rate.
pub trait AudioFrameSource: Send {
    /// Start capturing audio from the source.
    fn start(&mut self) -> Result<()>;

    /// Stop capturing audio from the source.
    fn stop(&mut self) -> Result<()>;

    /// Wait up to `timeout` for the next complete frame.
    ///
    /// `Ok(None)` means no frame was ready in time. An error counts as one
    /// failed device read.
    fn next_frame(&mut self, timeout: Duration) -> Result<Option<Vec<i16>>>;
}

impl<S: AudioFrameSource + ?Sized> AudioFrameSource for Box<S> {
    fn start(&mut self) -> Result<()> {
        (**self).start()
    }

    fn stop(&mut self) -> Result<()> {
        (**self).stop()
    }

    fn next_frame(&mut self, timeout: Duration) -> Result<Option<Vec<i16>>> {
        (**self).next_frame(timeout)
    }
}

/// Re-chunks arbitrarily sized device buffers into fixed-size frames.
#[derive(Debug)]
pub struct FrameAssembler {
    frame_samples: usize,
    pending: Vec<i16>,
    ready: VecDeque<Vec<i16>>,
}

impl FrameAssembler {
    pub fn new(frame_samples: usize) -> Self {
        Self {
            frame_samples: frame_samples.max(1),
            pending: Vec::with_capacity(frame_samples),
            ready: VecDeque::new(),
        }
    }

    /// Appends samples, completing as many frames as they fill.
    pub fn push(&mut self, mut samples: &[i16]) {
        while !samples.is_empty() {
            let needed = self.frame_samples - self.pending.len();
            let take = needed.min(samples.len());
            self.pending.extend_from_slice(&samples[..take]);
            samples = &samples[take..];

            if self.pending.len() == self.frame_samples {
                let frame = std::mem::replace(
                    &mut self.pending,
                    Vec::with_capacity(self.frame_samples),
                );
                self.ready.push_back(frame);
            }
        }
    }

    /// Takes the oldest complete frame.
    pub fn pop(&mut self) -> Option<Vec<i16>> {
        self.ready.pop_front()
    }

    /// Samples waiting for the rest of their frame.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Drops partial and complete frames.
    pub fn clear(&mut self) {
        self.pending.clear();
        self.ready.clear();
    }
}

enum FeedItem {
    Samples(Vec<i16>),
    Error(String),
}

/// Frame source fed from another thread through a channel.
///
/// Used to script capture in tests and to bridge hosts that already own an
/// audio callback. Frames are passed through unchanged.
pub struct ChannelFrameSource {
    rx: Receiver<FeedItem>,
    is_started: bool,
    should_fail_start: bool,
    error_message: String,
}

/// Sending half of a [`ChannelFrameSource`].
#[derive(Clone)]
pub struct FrameFeeder {
    tx: Sender<FeedItem>,
}

impl ChannelFrameSource {
    /// Create a source and the feeder that drives it.
    pub fn new() -> (Self, FrameFeeder) {
        let (tx, rx) = crossbeam_channel::unbounded();
        (
            Self {
                rx,
                is_started: false,
                should_fail_start: false,
                error_message: "mock audio error".to_string(),
            },
            FrameFeeder { tx },
        )
    }

    /// Configure the source to fail on start
    pub fn with_start_failure(mut self) -> Self {
        self.should_fail_start = true;
        self
    }

    /// Configure the error message for start failures
    pub fn with_error_message(mut self, message: &str) -> Self {
        self.error_message = message.to_string();
        self
    }

    pub fn is_started(&self) -> bool {
        self.is_started
    }
}

impl FrameFeeder {
    /// Queue one frame. Returns false once the source is gone.
    pub fn send(&self, samples: Vec<i16>) -> bool {
        self.tx.send(FeedItem::Samples(samples)).is_ok()
    }

    /// Queue `count` copies of `frame`.
    pub fn send_repeated(&self, frame: &[i16], count: usize) -> bool {
        (0..count).all(|_| self.send(frame.to_vec()))
    }

    /// Make the next read fail with `message`.
    pub fn send_error(&self, message: &str) -> bool {
        self.tx.send(FeedItem::Error(message.to_string())).is_ok()
    }
}

impl AudioFrameSource for ChannelFrameSource {
    fn start(&mut self) -> Result<()> {
        if self.should_fail_start {
            return Err(VoiceError::AudioCapture {
                message: self.error_message.clone(),
            });
        }
        self.is_started = true;
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.is_started = false;
        Ok(())
    }

    fn next_frame(&mut self, timeout: Duration) -> Result<Option<Vec<i16>>> {
        match self.rx.recv_timeout(timeout) {
            Ok(FeedItem::Samples(samples)) => Ok(Some(samples)),
            Ok(FeedItem::Error(message)) => Err(VoiceError::AudioCapture { message }),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => {
                // Feeder gone: behave like a silent device.
                std::thread::sleep(timeout);
                Ok(None)
            }
        }
    }
}

/// Frame source that plays back WAV data, resampled to mono at the engine rate.
pub struct WavFrameSource {
    samples: Vec<i16>,
    position: usize,
    frame_samples: usize,
    frame_duration: Duration,
    realtime: bool,
    next_due: Option<Instant>,
}

impl WavFrameSource {
    /// Create from any reader.
    pub fn from_reader(
        reader: Box<dyn Read + Send>,
        sample_rate: u32,
        frame_samples: usize,
    ) -> Result<Self> {
        let mut wav_reader =
            hound::WavReader::new(reader).map_err(|e| VoiceError::AudioCapture {
                message: format!("Failed to parse WAV file: {}", e),
            })?;

        let spec = wav_reader.spec();
        let raw_samples: Vec<i16> = wav_reader
            .samples::<i16>()
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| VoiceError::AudioCapture {
                message: format!("Failed to read WAV samples: {}", e),
            })?;

        let mono = downmix(&raw_samples, spec.channels as usize);
        let samples = resample(&mono, spec.sample_rate, sample_rate);
        let frame_samples = frame_samples.max(1);

        Ok(Self {
            samples,
            position: 0,
            frame_samples,
            frame_duration: Duration::from_micros(
                frame_samples as u64 * 1_000_000 / u64::from(sample_rate.max(1)),
            ),
            realtime: false,
            next_due: None,
        })
    }

    /// Open a WAV file on disk.
    pub fn from_path(path: &Path, sample_rate: u32, frame_samples: usize) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        Self::from_reader(
            Box::new(std::io::BufReader::new(file)),
            sample_rate,
            frame_samples,
        )
    }

    /// Deliver frames at the pace a microphone would instead of as fast as
    /// they are read.
    pub fn realtime(mut self, enabled: bool) -> Self {
        self.realtime = enabled;
        self
    }

    /// Samples not yet delivered.
    pub fn remaining(&self) -> usize {
        self.samples.len() - self.position
    }
}

impl AudioFrameSource for WavFrameSource {
    fn start(&mut self) -> Result<()> {
        self.next_due = Some(Instant::now());
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.next_due = None;
        Ok(())
    }

    fn next_frame(&mut self, timeout: Duration) -> Result<Option<Vec<i16>>> {
        if self.position >= self.samples.len() {
            std::thread::sleep(timeout);
            return Ok(None);
        }

        if self.realtime
            && let Some(due) = self.next_due
        {
            let now = Instant::now();
            if due > now {
                let wait = due - now;
                if wait > timeout {
                    std::thread::sleep(timeout);
                    return Ok(None);
                }
                std::thread::sleep(wait);
            }
            self.next_due = Some(due + self.frame_duration);
        }

        // Final partial frame is padded with silence.
        let end = (self.position + self.frame_samples).min(self.samples.len());
        let mut frame = self.samples[self.position..end].to_vec();
        frame.resize(self.frame_samples, 0);
        self.position = end;
        Ok(Some(frame))
    }
}

/// Average interleaved channels down to mono.
pub(crate) fn downmix(samples: &[i16], channels: usize) -> Vec<i16> {
    if channels <= 1 {
        return samples.to_vec();
    }
    samples
        .chunks_exact(channels)
        .map(|frame| {
            let sum: i32 = frame.iter().map(|&s| s as i32).sum();
            (sum / channels as i32) as i16
        })
        .collect()
}

/// Simple linear interpolation resampling.
pub(crate) fn resample(samples: &[i16], from_rate: u32, to_rate: u32) -> Vec<i16> {
    if from_rate == to_rate || samples.is_empty() || from_rate == 0 || to_rate == 0 {
        return samples.to_vec();
    }

    let ratio = from_rate as f64 / to_rate as f64;
    let output_len = (samples.len() as f64 / ratio).ceil() as usize;

    (0..output_len)
        .map(|i| {
            let source_pos = i as f64 * ratio;
            let source_idx = (source_pos.floor() as usize).min(samples.len() - 1);
            let fraction = source_pos - source_idx as f64;

            if source_idx + 1 >= samples.len() {
                samples[source_idx]
            } else {
                let left = samples[source_idx] as f64;
                let right = samples[source_idx + 1] as f64;
                (left + (right - left) * fraction) as i16
            }
        })
        .collect()
}
