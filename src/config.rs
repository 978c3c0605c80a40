//! Configuration: the TOML document and the runtime view derived from it.

use crate::audio::vad::{EnergyClassifierConfig, VadConfig};
use crate::defaults;
use crate::error::{Result, VoiceError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    pub audio: AudioConfig,
    pub vad: VadSettings,
    pub turn: TurnConfig,
    pub timeouts: TimeoutConfig,
    pub transcript: TranscriptConfig,
}

/// Audio capture configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AudioConfig {
    pub device: Option<String>,
    pub sample_rate: u32,
    pub frame_duration_ms: u32,
    pub ring_buffer_secs: u32,
    pub frame_queue_capacity: usize,
}

/// Voice activity detection thresholds
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct VadSettings {
    pub speech_threshold: f32,
    pub speech_debounce_frames: u32,
    pub silence_duration_ms: u32,
    /// Track the noise floor and move the threshold with it.
    pub auto_level: bool,
}

/// Utterance and turn limits
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TurnConfig {
    pub min_utterance_ms: u32,
    pub max_utterance_ms: u32,
    pub context_turns: usize,
    /// Spoken when response generation fails mid-turn.
    pub apology_message: Option<String>,
}

/// Per-stage timeouts, all in milliseconds
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TimeoutConfig {
    pub transcription_ms: u64,
    pub generation_ms: u64,
    pub synthesis_connect_ms: u64,
    pub synthesis_chunk_ms: u64,
    pub cancel_ack_ms: u64,
}

/// Transcript persistence
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct TranscriptConfig {
    /// JSON-lines file each finished turn is appended to.
    pub path: Option<PathBuf>,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            device: None,
            sample_rate: defaults::SAMPLE_RATE,
            frame_duration_ms: defaults::FRAME_DURATION_MS,
            ring_buffer_secs: defaults::RING_BUFFER_SECS,
            frame_queue_capacity: defaults::FRAME_QUEUE_CAPACITY,
        }
    }
}

impl Default for VadSettings {
    fn default() -> Self {
        Self {
            speech_threshold: defaults::VAD_THRESHOLD,
            speech_debounce_frames: defaults::SPEECH_DEBOUNCE_FRAMES,
            silence_duration_ms: defaults::SILENCE_DURATION_MS,
            auto_level: false,
        }
    }
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            min_utterance_ms: defaults::MIN_UTTERANCE_MS,
            max_utterance_ms: defaults::MAX_UTTERANCE_MS,
            context_turns: defaults::CONTEXT_TURNS,
            apology_message: None,
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            transcription_ms: defaults::TRANSCRIPTION_TIMEOUT_MS,
            generation_ms: defaults::GENERATION_TIMEOUT_MS,
            synthesis_connect_ms: defaults::SYNTHESIS_CONNECT_TIMEOUT_MS,
            synthesis_chunk_ms: defaults::SYNTHESIS_CHUNK_TIMEOUT_MS,
            cancel_ack_ms: defaults::CANCEL_ACK_TIMEOUT_MS,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Returns an error if the file contains invalid TOML.
    /// Missing fields will use default values.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Config =
            toml::from_str(&contents).map_err(|e| VoiceError::ConfigParse {
                message: format!("{}: {}", path.display(), e),
            })?;
        Ok(config)
    }

    /// Load configuration from a file, falling back to defaults only when the
    /// file does not exist. Invalid TOML is still an error.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        match Self::load(path) {
            Ok(config) => Ok(config),
            Err(e)
                if e.downcast_ref::<std::io::Error>()
                    .is_some_and(|io_err| io_err.kind() == std::io::ErrorKind::NotFound) =>
            {
                tracing::debug!(path = %path.display(), "no config file, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(e.context(format!("Failed to load config from {}", path.display()))),
        }
    }

    /// Apply environment variable overrides
    ///
    /// Supported environment variables:
    /// - PARLEY_AUDIO_DEVICE → audio.device
    /// - PARLEY_TRANSCRIPT_PATH → transcript.path
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(device) = std::env::var("PARLEY_AUDIO_DEVICE")
            && !device.is_empty()
        {
            self.audio.device = Some(device);
        }

        if let Ok(path) = std::env::var("PARLEY_TRANSCRIPT_PATH")
            && !path.is_empty()
        {
            self.transcript.path = Some(PathBuf::from(path));
        }

        self
    }

    /// Get the default configuration file path
    ///
    /// Returns ~/.config/parley/config.toml on Linux, or None when the
    /// platform has no config directory.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("parley").join("config.toml"))
    }

    /// Checks cross-field constraints the type system cannot express.
    pub fn validate(&self) -> Result<()> {
        fn invalid(key: &str, message: &str) -> Result<()> {
            Err(VoiceError::ConfigInvalidValue {
                key: key.to_string(),
                message: message.to_string(),
            })
        }

        if self.audio.sample_rate == 0 {
            return invalid("audio.sample_rate", "must be positive");
        }
        if self.audio.frame_duration_ms == 0 || self.audio.frame_duration_ms > 1000 {
            return invalid("audio.frame_duration_ms", "must be between 1 and 1000");
        }
        if u64::from(self.audio.sample_rate) * u64::from(self.audio.frame_duration_ms) < 1000 {
            return invalid("audio.frame_duration_ms", "frame holds no samples");
        }
        if self.audio.frame_queue_capacity == 0 {
            return invalid("audio.frame_queue_capacity", "must be positive");
        }
        if !(0.0..=1.0).contains(&self.vad.speech_threshold) {
            return invalid("vad.speech_threshold", "must be between 0.0 and 1.0");
        }
        if self.vad.speech_debounce_frames == 0 {
            return invalid("vad.speech_debounce_frames", "must be positive");
        }
        if self.vad.silence_duration_ms == 0 {
            return invalid("vad.silence_duration_ms", "must be positive");
        }
        if self.turn.min_utterance_ms >= self.turn.max_utterance_ms {
            return invalid(
                "turn.min_utterance_ms",
                "must be shorter than turn.max_utterance_ms",
            );
        }
        if u64::from(self.audio.ring_buffer_secs) * 1000 < u64::from(self.turn.max_utterance_ms) {
            return invalid(
                "audio.ring_buffer_secs",
                "must cover turn.max_utterance_ms",
            );
        }
        let timeouts = [
            ("timeouts.transcription_ms", self.timeouts.transcription_ms),
            ("timeouts.generation_ms", self.timeouts.generation_ms),
            ("timeouts.synthesis_connect_ms", self.timeouts.synthesis_connect_ms),
            ("timeouts.synthesis_chunk_ms", self.timeouts.synthesis_chunk_ms),
            ("timeouts.cancel_ack_ms", self.timeouts.cancel_ack_ms),
        ];
        for (key, value) in timeouts {
            if value == 0 {
                return invalid(key, "must be positive");
            }
        }
        Ok(())
    }
}

/// Timeouts applied around each collaborator call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageTimeouts {
    pub transcription: Duration,
    pub generation: Duration,
    pub synthesis_connect: Duration,
    pub synthesis_chunk: Duration,
    pub cancel_ack: Duration,
}

impl Default for StageTimeouts {
    fn default() -> Self {
        Self::from(&TimeoutConfig::default())
    }
}

impl From<&TimeoutConfig> for StageTimeouts {
    fn from(config: &TimeoutConfig) -> Self {
        Self {
            transcription: Duration::from_millis(config.transcription_ms),
            generation: Duration::from_millis(config.generation_ms),
            synthesis_connect: Duration::from_millis(config.synthesis_connect_ms),
            synthesis_chunk: Duration::from_millis(config.synthesis_chunk_ms),
            cancel_ack: Duration::from_millis(config.cancel_ack_ms),
        }
    }
}

/// Runtime configuration of the conversation engine, in sample and frame units.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub sample_rate: u32,
    pub frame_samples: usize,
    pub frame_duration: Duration,
    /// Ring buffer capacity in samples.
    pub ring_capacity: usize,
    pub frame_queue_capacity: usize,
    pub classifier: EnergyClassifierConfig,
    pub vad: VadConfig,
    pub min_utterance_samples: u64,
    pub max_utterance_samples: u64,
    pub max_utterance: Duration,
    pub context_turns: usize,
    pub apology_message: Option<String>,
    pub timeouts: StageTimeouts,
    pub transcript_path: Option<PathBuf>,
}

impl EngineConfig {
    /// Validates `config` and converts it to frame/sample units.
    pub fn from_config(config: &Config) -> Result<Self> {
        config.validate()?;
        Ok(Self::from(config))
    }

    /// Converts a sample count to wall-clock duration at the configured rate.
    pub fn samples_to_duration(&self, samples: u64) -> Duration {
        Duration::from_micros(samples * 1_000_000 / u64::from(self.sample_rate))
    }
}

/// Unit conversion only; see [`EngineConfig::from_config`] for the validated path.
impl From<&Config> for EngineConfig {
    fn from(config: &Config) -> Self {
        let sample_rate = config.audio.sample_rate;
        let ms_to_samples = |ms: u32| u64::from(sample_rate) * u64::from(ms) / 1000;

        Self {
            sample_rate,
            frame_samples: ms_to_samples(config.audio.frame_duration_ms) as usize,
            frame_duration: Duration::from_millis(u64::from(config.audio.frame_duration_ms)),
            ring_capacity: sample_rate as usize * config.audio.ring_buffer_secs as usize,
            frame_queue_capacity: config.audio.frame_queue_capacity,
            classifier: EnergyClassifierConfig {
                threshold: config.vad.speech_threshold,
                auto_level: config.vad.auto_level,
            },
            vad: VadConfig::from_durations(
                config.vad.speech_debounce_frames,
                config.vad.silence_duration_ms,
                config.audio.frame_duration_ms,
            ),
            min_utterance_samples: ms_to_samples(config.turn.min_utterance_ms),
            max_utterance_samples: ms_to_samples(config.turn.max_utterance_ms),
            max_utterance: Duration::from_millis(u64::from(config.turn.max_utterance_ms)),
            context_turns: config.turn.context_turns,
            apology_message: config.turn.apology_message.clone(),
            timeouts: StageTimeouts::from(&config.timeouts),
            transcript_path: config.transcript.path.clone(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::Mutex;
    use tempfile::NamedTempFile;

    // Mutex to serialize tests that modify environment variables
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    // SAFETY: These helpers are only used in tests with ENV_LOCK held,
    // ensuring no concurrent access to environment variables.
    fn set_env(key: &str, value: &str) {
        unsafe { std::env::set_var(key, value) }
    }

    fn remove_env(key: &str) {
        unsafe { std::env::remove_var(key) }
    }

    fn clear_parley_env() {
        remove_env("PARLEY_AUDIO_DEVICE");
        remove_env("PARLEY_TRANSCRIPT_PATH");
    }

    #[test]
    fn test_default_config_has_correct_values() {
        let config = Config::default();

        assert_eq!(config.audio.device, None);
        assert_eq!(config.audio.sample_rate, 16000);
        assert_eq!(config.audio.frame_duration_ms, 30);
        assert_eq!(config.audio.ring_buffer_secs, 30);

        assert_eq!(config.vad.speech_threshold, 0.02);
        assert_eq!(config.vad.speech_debounce_frames, 3);
        assert_eq!(config.vad.silence_duration_ms, 800);

        assert_eq!(config.turn.min_utterance_ms, 200);
        assert_eq!(config.turn.max_utterance_ms, 30_000);
        assert_eq!(config.turn.apology_message, None);

        assert_eq!(config.timeouts.generation_ms, 30_000);
        assert_eq!(config.timeouts.synthesis_connect_ms, 10_000);
        assert_eq!(config.transcript.path, None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_toml_file() {
        let toml_content = r#"
            [audio]
            device = "hw:0,0"
            sample_rate = 48000
            frame_duration_ms = 20

            [vad]
            speech_threshold = 0.05
            silence_duration_ms = 600

            [turn]
            min_utterance_ms = 300
            apology_message = "Sorry, something went wrong."

            [timeouts]
            cancel_ack_ms = 100

            [transcript]
            path = "/tmp/turns.jsonl"
        "#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(toml_content.as_bytes()).unwrap();

        let config = Config::load(temp_file.path()).unwrap();

        assert_eq!(config.audio.device, Some("hw:0,0".to_string()));
        assert_eq!(config.audio.sample_rate, 48000);
        assert_eq!(config.audio.frame_duration_ms, 20);
        assert_eq!(config.vad.speech_threshold, 0.05);
        assert_eq!(config.vad.silence_duration_ms, 600);
        assert_eq!(config.vad.speech_debounce_frames, 3);
        assert_eq!(config.turn.min_utterance_ms, 300);
        assert_eq!(
            config.turn.apology_message.as_deref(),
            Some("Sorry, something went wrong.")
        );
        assert_eq!(config.timeouts.cancel_ack_ms, 100);
        assert_eq!(config.timeouts.transcription_ms, 15_000);
        assert_eq!(
            config.transcript.path,
            Some(PathBuf::from("/tmp/turns.jsonl"))
        );
    }

    #[test]
    fn test_invalid_toml_returns_error() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file
            .write_all(b"[audio\nsample_rate = \"broken")
            .unwrap();

        let error = Config::load(temp_file.path()).unwrap_err();
        assert!(matches!(
            error.downcast_ref::<VoiceError>(),
            Some(VoiceError::ConfigParse { message })
                if message.contains(&temp_file.path().display().to_string())
        ));
        assert!(Config::load_or_default(temp_file.path()).is_err());
    }

    #[test]
    fn test_load_or_default_returns_default_for_missing_file() {
        let missing_path = Path::new("/tmp/nonexistent_parley_config_12345.toml");
        let config = Config::load_or_default(missing_path).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_env_overrides() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_parley_env();

        set_env("PARLEY_AUDIO_DEVICE", "pulse");
        set_env("PARLEY_TRANSCRIPT_PATH", "/var/tmp/parley.jsonl");
        let config = Config::default().with_env_overrides();

        assert_eq!(config.audio.device, Some("pulse".to_string()));
        assert_eq!(
            config.transcript.path,
            Some(PathBuf::from("/var/tmp/parley.jsonl"))
        );

        clear_parley_env();
    }

    #[test]
    fn test_env_override_empty_string_ignored() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_parley_env();

        set_env("PARLEY_AUDIO_DEVICE", "");
        let config = Config::default().with_env_overrides();
        assert_eq!(config.audio.device, None);

        clear_parley_env();
    }

    #[test]
    fn test_default_path_ends_with_config_toml() {
        if let Some(path) = Config::default_path() {
            let path_str = path.to_string_lossy();
            assert!(path_str.contains("parley"));
            assert!(path_str.ends_with("config.toml"));
        }
    }

    #[test]
    fn test_validate_rejects_min_not_below_max() {
        let mut config = Config::default();
        config.turn.min_utterance_ms = 5000;
        config.turn.max_utterance_ms = 5000;

        match config.validate() {
            Err(VoiceError::ConfigInvalidValue { key, .. }) => {
                assert_eq!(key, "turn.min_utterance_ms");
            }
            other => panic!("Expected ConfigInvalidValue, got {:?}", other),
        }
    }

    #[test]
    fn test_validate_rejects_ring_shorter_than_max_utterance() {
        let mut config = Config::default();
        config.audio.ring_buffer_secs = 10;

        match config.validate() {
            Err(VoiceError::ConfigInvalidValue { key, .. }) => {
                assert_eq!(key, "audio.ring_buffer_secs");
            }
            other => panic!("Expected ConfigInvalidValue, got {:?}", other),
        }
    }

    #[test]
    fn test_validate_rejects_zero_timeout() {
        let mut config = Config::default();
        config.timeouts.cancel_ack_ms = 0;

        match config.validate() {
            Err(VoiceError::ConfigInvalidValue { key, .. }) => {
                assert_eq!(key, "timeouts.cancel_ack_ms");
            }
            other => panic!("Expected ConfigInvalidValue, got {:?}", other),
        }
    }

    #[test]
    fn test_validate_rejects_zero_debounce() {
        let mut config = Config::default();
        config.vad.speech_debounce_frames = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_engine_config_units() {
        let engine = EngineConfig::from_config(&Config::default()).unwrap();

        assert_eq!(engine.frame_samples, 480);
        assert_eq!(engine.frame_duration, Duration::from_millis(30));
        assert_eq!(engine.ring_capacity, 16000 * 30);
        assert_eq!(engine.min_utterance_samples, 3200);
        assert_eq!(engine.max_utterance_samples, 480_000);
        assert_eq!(engine.vad.speech_debounce_frames, 3);
        // ceil(800 / 30) = 27
        assert_eq!(engine.vad.silence_frames, 27);
        assert_eq!(engine.timeouts.cancel_ack, Duration::from_millis(200));
    }

    #[test]
    fn test_engine_config_default_matches_default_document() {
        let from_document = EngineConfig::from_config(&Config::default()).unwrap();
        assert_eq!(EngineConfig::default(), from_document);
    }

    #[test]
    fn test_engine_config_carries_document_settings() {
        let mut config = Config::default();
        config.vad.auto_level = true;
        config.turn.apology_message = Some("Sorry.".to_string());
        config.turn.min_utterance_ms = 250;

        let engine = EngineConfig::from(&config);
        assert!(engine.classifier.auto_level);
        assert_eq!(engine.apology_message.as_deref(), Some("Sorry."));
        assert_eq!(engine.min_utterance_samples, 4000);
        assert_eq!(EngineConfig::from_config(&config).unwrap(), engine);
    }

    #[test]
    fn test_engine_config_rejects_invalid_document() {
        let mut config = Config::default();
        config.audio.sample_rate = 0;
        assert!(EngineConfig::from_config(&config).is_err());
    }

    #[test]
    fn test_samples_to_duration() {
        let engine = EngineConfig::default();
        assert_eq!(engine.samples_to_duration(16000), Duration::from_secs(1));
        assert_eq!(engine.samples_to_duration(480), Duration::from_millis(30));
    }
}
