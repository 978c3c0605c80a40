//! Voice Activity Detection (VAD) module.
//!
//! A cheap per-frame classifier feeds a debounce state machine. The two
//! halves are separate so the classifier can run on the capture thread while
//! the debounce runs wherever the frames are consumed.

use crate::defaults;
use std::collections::VecDeque;

/// Calculates the Root Mean Square (RMS) of audio samples.
///
/// # Returns
/// Normalized RMS value (0.0 to 1.0), where:
/// - 0.0 represents silence
/// - ~0.707 represents a full-scale sine wave
/// - 1.0 represents maximum amplitude
pub fn calculate_rms(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }

    let sum_squares: f64 = samples
        .iter()
        .map(|&sample| {
            let normalized = sample as f64 / i16::MAX as f64;
            normalized * normalized
        })
        .sum();

    let mean_square = sum_squares / samples.len() as f64;
    mean_square.sqrt() as f32
}

/// Result of classifying one frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Classification {
    /// `None` when the classifier could not decide; the debounce treats it as silence.
    pub is_speech: Option<bool>,
    /// RMS level (0.0 to 1.0).
    pub level: f32,
}

/// Per-frame speech/non-speech classifier.
///
/// Runs on the capture thread, so implementations must not block or do I/O.
pub trait SpeechClassifier: Send {
    fn classify(&mut self, samples: &[i16]) -> Classification;

    /// Current decision threshold, for diagnostics.
    fn threshold(&self) -> f32;
}

impl<C: SpeechClassifier + ?Sized> SpeechClassifier for Box<C> {
    fn classify(&mut self, samples: &[i16]) -> Classification {
        (**self).classify(samples)
    }

    fn threshold(&self) -> f32 {
        (**self).threshold()
    }
}

/// Configuration for the energy classifier.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EnergyClassifierConfig {
    /// RMS threshold for detecting speech (0.0 to 1.0).
    pub threshold: f32,
    /// Follow the noise floor instead of using a fixed threshold.
    pub auto_level: bool,
}

impl Default for EnergyClassifierConfig {
    fn default() -> Self {
        Self {
            threshold: defaults::VAD_THRESHOLD,
            auto_level: false,
        }
    }
}

const LEVEL_HISTORY_MAX: usize = 100;
const LEVEL_HISTORY_MIN: usize = 10;
const AUTO_THRESHOLD_MIN: f32 = 0.002;
const AUTO_THRESHOLD_MAX: f32 = 0.2;

/// RMS threshold classifier with optional noise-floor tracking.
///
/// With auto-level on, the threshold becomes twice the 25th percentile of
/// the last 100 frame levels, clamped to 0.002..=0.2.
#[derive(Debug, Clone)]
pub struct EnergyClassifier {
    threshold: f32,
    auto_level: bool,
    level_history: VecDeque<f32>,
    scratch: Vec<f32>,
}

impl EnergyClassifier {
    pub fn new(config: EnergyClassifierConfig) -> Self {
        let (history, scratch) = if config.auto_level {
            (
                VecDeque::with_capacity(LEVEL_HISTORY_MAX + 1),
                Vec::with_capacity(LEVEL_HISTORY_MAX + 1),
            )
        } else {
            (VecDeque::new(), Vec::new())
        };
        Self {
            threshold: config.threshold,
            auto_level: config.auto_level,
            level_history: history,
            scratch,
        }
    }

    fn adjust_threshold(&mut self) {
        if self.level_history.len() < LEVEL_HISTORY_MIN {
            return;
        }

        self.scratch.clear();
        self.scratch.extend(self.level_history.iter().copied());
        self.scratch
            .sort_unstable_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let noise_floor = self.scratch[self.scratch.len() / 4];

        self.threshold = (noise_floor * 2.0).clamp(AUTO_THRESHOLD_MIN, AUTO_THRESHOLD_MAX);
    }
}

impl Default for EnergyClassifier {
    fn default() -> Self {
        Self::new(EnergyClassifierConfig::default())
    }
}

impl SpeechClassifier for EnergyClassifier {
    fn classify(&mut self, samples: &[i16]) -> Classification {
        if samples.is_empty() {
            return Classification {
                is_speech: None,
                level: 0.0,
            };
        }

        let level = calculate_rms(samples);
        let is_speech = level > self.threshold;

        if self.auto_level {
            self.level_history.push_back(level);
            if self.level_history.len() > LEVEL_HISTORY_MAX {
                self.level_history.pop_front();
            }
            self.adjust_threshold();
        }

        Classification {
            is_speech: Some(is_speech),
            level,
        }
    }

    fn threshold(&self) -> f32 {
        self.threshold
    }
}

/// Debounce thresholds in frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VadConfig {
    /// Consecutive speech frames before speech counts as started.
    pub speech_debounce_frames: u32,
    /// Consecutive non-speech frames before active speech counts as ended.
    pub silence_frames: u32,
}

impl VadConfig {
    /// Derive frame counts from durations; silence rounds up to whole frames.
    pub fn from_durations(speech_debounce_frames: u32, silence_ms: u32, frame_ms: u32) -> Self {
        Self {
            speech_debounce_frames: speech_debounce_frames.max(1),
            silence_frames: silence_ms.div_ceil(frame_ms.max(1)).max(1),
        }
    }
}

impl Default for VadConfig {
    fn default() -> Self {
        Self::from_durations(
            defaults::SPEECH_DEBOUNCE_FRAMES,
            defaults::SILENCE_DURATION_MS,
            defaults::FRAME_DURATION_MS,
        )
    }
}

/// Debounced speech boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadEvent {
    SpeechStarted,
    SpeechEnded,
}

/// Two run counters and an active flag. Pure: no audio, no clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Debounce {
    config: VadConfig,
    speech_run: u32,
    silence_run: u32,
    active: bool,
}

impl Debounce {
    pub fn new(config: VadConfig) -> Self {
        Self {
            config,
            speech_run: 0,
            silence_run: 0,
            active: false,
        }
    }

    /// Feed one frame decision and return the boundary it crosses, if any.
    ///
    /// Undecided frames count as silence.
    pub fn update(&mut self, is_speech: Option<bool>) -> Option<VadEvent> {
        if is_speech == Some(true) {
            self.speech_run = self.speech_run.saturating_add(1);
            self.silence_run = 0;
            if !self.active && self.speech_run >= self.config.speech_debounce_frames {
                self.active = true;
                return Some(VadEvent::SpeechStarted);
            }
        } else {
            self.silence_run = self.silence_run.saturating_add(1);
            self.speech_run = 0;
            if self.active && self.silence_run >= self.config.silence_frames {
                self.active = false;
                self.silence_run = 0;
                return Some(VadEvent::SpeechEnded);
            }
        }
        None
    }

    /// Clears both counters and the active flag.
    pub fn reset(&mut self) {
        self.speech_run = 0;
        self.silence_run = 0;
        self.active = false;
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn speech_run(&self) -> u32 {
        self.speech_run
    }

    pub fn silence_run(&self) -> u32 {
        self.silence_run
    }

    pub fn config(&self) -> VadConfig {
        self.config
    }
}

/// Classifier and debounce combined, for callers that hold raw frames.
pub struct VoiceActivityDetector<C: SpeechClassifier = EnergyClassifier> {
    classifier: C,
    debounce: Debounce,
    last_event: Option<VadEvent>,
    last_level: f32,
}

impl<C: SpeechClassifier> VoiceActivityDetector<C> {
    pub fn with_classifier(classifier: C, config: VadConfig) -> Self {
        Self {
            classifier,
            debounce: Debounce::new(config),
            last_event: None,
            last_level: 0.0,
        }
    }

    /// Process one frame and return whether speech is active after it.
    pub fn process(&mut self, samples: &[i16]) -> bool {
        let classification = self.classifier.classify(samples);
        self.last_level = classification.level;
        self.last_event = self.debounce.update(classification.is_speech);
        self.debounce.is_active()
    }

    /// Boundary crossed by the most recent frame.
    pub fn last_event(&self) -> Option<VadEvent> {
        self.last_event
    }

    /// RMS level of the most recent frame.
    pub fn last_level(&self) -> f32 {
        self.last_level
    }

    pub fn is_active(&self) -> bool {
        self.debounce.is_active()
    }

    /// Start a fresh listening window.
    pub fn reset(&mut self) {
        self.debounce.reset();
        self.last_event = None;
    }

    pub fn threshold(&self) -> f32 {
        self.classifier.threshold()
    }
}

impl VoiceActivityDetector<EnergyClassifier> {
    pub fn new(classifier: EnergyClassifierConfig, config: VadConfig) -> Self {
        Self::with_classifier(EnergyClassifier::new(classifier), config)
    }
}
