//! Microphone capture through CPAL.

use crate::audio::capture::EvictingSender;
use crate::audio::source::{AudioFrameSource, FrameAssembler, downmix, resample};
use crate::error::{Result, VoiceError};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Device callbacks buffered between capture-thread polls. When full, the
/// oldest callback is dropped.
const CALLBACK_QUEUE_CAPACITY: usize = 256;

/// How long a started stream may go without data before reads fail.
const STALL_TIMEOUT: Duration = Duration::from_secs(2);

/// How long to wait for the first callback before trying the native config.
const STARTUP_PROBE: Duration = Duration::from_millis(200);

/// Run a closure with stderr temporarily redirected to /dev/null.
///
/// Hides the ALSA/JACK/PipeWire chatter CPAL triggers while probing backends.
///
/// # Safety
/// Uses `libc::dup`/`libc::dup2` to save and restore fd 2. Safe as long as no
/// other thread is concurrently manipulating fd 2.
fn with_suppressed_stderr<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    unsafe {
        let saved_fd = libc::dup(2);
        let devnull = libc::open(c"/dev/null".as_ptr(), libc::O_WRONLY);
        if saved_fd >= 0 && devnull >= 0 {
            libc::dup2(devnull, 2);
            libc::close(devnull);
        }

        let result = f();

        if saved_fd >= 0 {
            libc::dup2(saved_fd, 2);
            libc::close(saved_fd);
        }

        result
    }
}

/// Preferred device names for PipeWire/PulseAudio desktops.
const PREFERRED_DEVICES: &[&str] = &["pipewire", "pulse", "PulseAudio"];

/// Device name patterns that are never useful for voice input.
const FILTERED_PATTERNS: &[&str] = &[
    "surround",
    "front:",
    "rear:",
    "center:",
    "side:",
    "Digital Output",
    "HDMI",
    "S/PDIF",
];

fn should_filter_device(name: &str) -> bool {
    let lower = name.to_lowercase();
    FILTERED_PATTERNS
        .iter()
        .any(|pattern| lower.contains(&pattern.to_lowercase()))
}

fn is_preferred_device(name: &str) -> bool {
    let lower = name.to_lowercase();
    PREFERRED_DEVICES
        .iter()
        .any(|pref| lower.contains(&pref.to_lowercase()))
}

/// Usable input devices, preferred ones marked "\[recommended\]".
pub fn list_devices() -> Result<Vec<String>> {
    let (host, devices) = with_suppressed_stderr(|| {
        let host = cpal::default_host();
        let devices = host.input_devices();
        (host, devices)
    });
    let _host = host;
    let devices = devices.map_err(|e| VoiceError::AudioCapture {
        message: format!("Failed to enumerate input devices: {}", e),
    })?;

    let mut device_names = Vec::new();
    for device in devices {
        if let Ok(name) = device.name() {
            if should_filter_device(&name) {
                continue;
            }
            if is_preferred_device(&name) {
                device_names.push(format!("{} [recommended]", name));
            } else {
                device_names.push(name);
            }
        }
    }
    Ok(device_names)
}

/// PipeWire, then PulseAudio, then the system default.
fn best_default_device() -> Result<cpal::Device> {
    with_suppressed_stderr(|| {
        let host = cpal::default_host();
        if let Ok(devices) = host.input_devices() {
            for device in devices {
                if let Ok(name) = device.name()
                    && is_preferred_device(&name)
                {
                    return Ok(device);
                }
            }
        }
        host.default_input_device()
            .ok_or_else(|| VoiceError::AudioDeviceNotFound {
                device: "default".to_string(),
            })
    })
}

fn find_device(name: &str) -> Result<cpal::Device> {
    with_suppressed_stderr(|| {
        let host = cpal::default_host();
        let devices = host.input_devices().map_err(|e| VoiceError::AudioCapture {
            message: format!("Failed to enumerate devices: {}", e),
        })?;
        for device in devices {
            if device.name().is_ok_and(|n| n == name) {
                return Ok(device);
            }
        }
        Err(VoiceError::AudioDeviceNotFound {
            device: name.to_string(),
        })
    })
}

/// Wrapper making `cpal::Stream` movable into the capture thread.
///
/// SAFETY: the stream is created in `start`, owned by the source, and only
/// paused or dropped by whichever single thread owns the source.
struct SendableStream(cpal::Stream);

unsafe impl Send for SendableStream {}

/// What the device callback hands to the capture thread.
type Packet = std::result::Result<Vec<i16>, String>;

fn f32_to_i16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16
}

/// Log and return the callbacks evicted since the last call.
fn report_overruns(overruns: &AtomicU64) -> u64 {
    let lost = overruns.swap(0, Ordering::Relaxed);
    if lost > 0 {
        tracing::warn!(
            callbacks = lost,
            "input callback queue overflowed, oldest audio dropped"
        );
    }
    lost
}

fn to_mono_at_rate(samples: &[i16], channels: usize, from_rate: u32, to_rate: u32) -> Vec<i16> {
    resample(&downmix(samples, channels), from_rate, to_rate)
}

/// Microphone frame source.
///
/// Tries i16 mono at the engine rate first, then f32, then the device's
/// native config with software downmix and resampling. The device callback
/// only copies into a bounded drop-oldest channel; stream errors travel the same way and
/// surface as failed reads, so a disconnect ends capture through the
/// consecutive-error limit.
pub struct CpalFrameSource {
    device: cpal::Device,
    sample_rate: u32,
    stream: Option<SendableStream>,
    tx: EvictingSender<Packet>,
    rx: Receiver<Packet>,
    overruns: Arc<AtomicU64>,
    assembler: FrameAssembler,
    callback_count: Arc<AtomicU64>,
    last_data: Instant,
}

impl CpalFrameSource {
    /// Open `device_name`, or the best default input device.
    pub fn new(device_name: Option<&str>, sample_rate: u32, frame_samples: usize) -> Result<Self> {
        let device = match device_name {
            Some(name) => find_device(name)?,
            None => best_default_device()?,
        };
        let overruns = Arc::new(AtomicU64::new(0));
        let (tx, rx) = EvictingSender::bounded(CALLBACK_QUEUE_CAPACITY, Arc::clone(&overruns));

        Ok(Self {
            device,
            sample_rate,
            stream: None,
            tx,
            rx,
            overruns,
            assembler: FrameAssembler::new(frame_samples),
            callback_count: Arc::new(AtomicU64::new(0)),
            last_data: Instant::now(),
        })
    }

    fn error_callback(&self) -> impl FnMut(cpal::StreamError) + Send + 'static {
        let tx = self.tx.clone();
        move |err| {
            tracing::error!(error = %err, "audio input stream error");
            tx.send(Err(err.to_string()));
        }
    }

    fn build_stream(&self) -> Result<cpal::Stream> {
        let preferred = cpal::StreamConfig {
            channels: 1,
            sample_rate: cpal::SampleRate(self.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let tx = self.tx.clone();
        let counter = Arc::clone(&self.callback_count);
        if let Ok(stream) = self.device.build_input_stream(
            &preferred,
            move |data: &[i16], _: &cpal::InputCallbackInfo| {
                counter.fetch_add(1, Ordering::Relaxed);
                tx.send(Ok(data.to_vec()));
            },
            self.error_callback(),
            None,
        ) {
            return Ok(stream);
        }

        let tx = self.tx.clone();
        let counter = Arc::clone(&self.callback_count);
        if let Ok(stream) = self.device.build_input_stream(
            &preferred,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                counter.fetch_add(1, Ordering::Relaxed);
                tx.send(Ok(data.iter().copied().map(f32_to_i16).collect()));
            },
            self.error_callback(),
            None,
        ) {
            return Ok(stream);
        }

        self.build_stream_native()
    }

    /// Capture at the device's default config and convert in software.
    fn build_stream_native(&self) -> Result<cpal::Stream> {
        use cpal::SampleFormat;

        let default_config =
            self.device
                .default_input_config()
                .map_err(|e| VoiceError::AudioCapture {
                    message: format!("Failed to query default input config: {}", e),
                })?;

        let native_rate = default_config.sample_rate().0;
        let channels = default_config.channels() as usize;
        let target_rate = self.sample_rate;
        let stream_config: cpal::StreamConfig = default_config.clone().into();

        tracing::info!(
            channels,
            native_rate,
            format = ?default_config.sample_format(),
            "using native input format, converting in software"
        );

        let tx = self.tx.clone();
        let counter = Arc::clone(&self.callback_count);

        match default_config.sample_format() {
            SampleFormat::I16 => self
                .device
                .build_input_stream(
                    &stream_config,
                    move |data: &[i16], _: &cpal::InputCallbackInfo| {
                        counter.fetch_add(1, Ordering::Relaxed);
                        let converted = to_mono_at_rate(data, channels, native_rate, target_rate);
                        tx.send(Ok(converted));
                    },
                    self.error_callback(),
                    None,
                )
                .map_err(|e| VoiceError::AudioCapture {
                    message: format!("Failed to build native i16 stream: {}", e),
                }),
            SampleFormat::F32 => self
                .device
                .build_input_stream(
                    &stream_config,
                    move |data: &[f32], _: &cpal::InputCallbackInfo| {
                        counter.fetch_add(1, Ordering::Relaxed);
                        let samples: Vec<i16> = data.iter().copied().map(f32_to_i16).collect();
                        let converted =
                            to_mono_at_rate(&samples, channels, native_rate, target_rate);
                        tx.send(Ok(converted));
                    },
                    self.error_callback(),
                    None,
                )
                .map_err(|e| VoiceError::AudioCapture {
                    message: format!("Failed to build native f32 stream: {}", e),
                }),
            format => Err(VoiceError::AudioCapture {
                message: format!("Unsupported native sample format: {:?}", format),
            }),
        }
    }

    fn drain_pending(&mut self) {
        while self.rx.try_recv().is_ok() {}
        self.assembler.clear();
        self.overruns.store(0, Ordering::Relaxed);
    }
}

impl AudioFrameSource for CpalFrameSource {
    fn start(&mut self) -> Result<()> {
        if self.stream.is_some() {
            return Ok(());
        }

        let stream = self.build_stream()?;
        stream.play().map_err(|e| VoiceError::AudioCapture {
            message: format!("Failed to start audio stream: {}", e),
        })?;

        // Some PipeWire-ALSA setups accept non-native configs but never call back.
        std::thread::sleep(STARTUP_PROBE);
        let stream = if self.callback_count.load(Ordering::Relaxed) == 0 {
            drop(stream);
            self.drain_pending();
            let native = self.build_stream_native()?;
            native.play().map_err(|e| VoiceError::AudioCapture {
                message: format!("Failed to start native audio stream: {}", e),
            })?;
            native
        } else {
            stream
        };

        self.last_data = Instant::now();
        self.stream = Some(SendableStream(stream));
        tracing::debug!(sample_rate = self.sample_rate, "microphone capture started");
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        if let Some(stream) = self.stream.take() {
            stream.0.pause().map_err(|e| VoiceError::AudioCapture {
                message: format!("Failed to stop audio stream: {}", e),
            })?;
        }
        self.drain_pending();
        Ok(())
    }

    fn next_frame(&mut self, timeout: Duration) -> Result<Option<Vec<i16>>> {
        if let Some(frame) = self.assembler.pop() {
            return Ok(Some(frame));
        }

        let deadline = Instant::now() + timeout;
        loop {
            match self.rx.recv_deadline(deadline) {
                Ok(Ok(samples)) => {
                    report_overruns(&self.overruns);
                    self.last_data = Instant::now();
                    self.assembler.push(&samples);
                    if let Some(frame) = self.assembler.pop() {
                        return Ok(Some(frame));
                    }
                }
                Ok(Err(message)) => {
                    return Err(VoiceError::AudioCapture {
                        message: format!("audio stream error: {}", message),
                    });
                }
                Err(RecvTimeoutError::Timeout) => {
                    if self.stream.is_some() && self.last_data.elapsed() >= STALL_TIMEOUT {
                        return Err(VoiceError::AudioCapture {
                            message: format!(
                                "no audio from input device for {}ms",
                                self.last_data.elapsed().as_millis()
                            ),
                        });
                    }
                    return Ok(None);
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(VoiceError::AudioCapture {
                        message: "audio callback channel closed".to_string(),
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_filter_device() {
        assert!(should_filter_device("surround51"));
        assert!(should_filter_device("front:CARD=PCH"));
        assert!(should_filter_device("HDMI Output"));
        assert!(should_filter_device("Digital Output S/PDIF"));
        assert!(!should_filter_device("pipewire"));
        assert!(!should_filter_device("Built-in Audio"));
    }

    #[test]
    fn test_is_preferred_device() {
        assert!(is_preferred_device("PipeWire"));
        assert!(is_preferred_device("pulse"));
        assert!(!is_preferred_device("hw:0,0"));
        assert!(!is_preferred_device("default"));
    }

    #[test]
    fn test_f32_conversion_clamps() {
        assert_eq!(f32_to_i16(0.0), 0);
        assert_eq!(f32_to_i16(1.0), i16::MAX);
        assert_eq!(f32_to_i16(4.0), i16::MAX);
        assert_eq!(f32_to_i16(-4.0), -i16::MAX);
    }

    #[test]
    fn test_native_conversion_downmixes_and_resamples() {
        // 48kHz stereo, 30ms
        let stereo: Vec<i16> = (0..1440).flat_map(|_| [1000, 3000]).collect();
        let converted = to_mono_at_rate(&stereo, 2, 48000, 16000);
        assert_eq!(converted.len(), 480);
        assert!(converted.iter().all(|&s| s == 2000));
    }

    #[test]
    fn test_callback_overrun_drops_oldest_and_is_counted() {
        let overruns = Arc::new(AtomicU64::new(0));
        let (tx, rx) =
            EvictingSender::<Packet>::bounded(CALLBACK_QUEUE_CAPACITY, Arc::clone(&overruns));

        for i in 0..CALLBACK_QUEUE_CAPACITY + 10 {
            assert!(tx.send(Ok(vec![i as i16; 4])));
        }

        assert_eq!(report_overruns(&overruns), 10);
        assert_eq!(report_overruns(&overruns), 0);
        assert_eq!(rx.len(), CALLBACK_QUEUE_CAPACITY);
        assert_eq!(rx.try_recv().unwrap(), Ok(vec![10; 4]));
    }

    #[test]
    fn test_stream_error_survives_full_queue() {
        let overruns = Arc::new(AtomicU64::new(0));
        let (tx, rx) = EvictingSender::<Packet>::bounded(2, Arc::clone(&overruns));
        tx.send(Ok(vec![1]));
        tx.send(Ok(vec![2]));
        tx.send(Err("device disconnected".to_string()));

        let packets: Vec<Packet> = rx.try_iter().collect();
        assert_eq!(packets.last(), Some(&Err("device disconnected".to_string())));
        assert_eq!(overruns.load(Ordering::Relaxed), 1);
    }

    #[test]
    #[ignore] // Requires audio hardware
    fn test_list_devices_filters_unusable_outputs() {
        let devices = list_devices().unwrap();
        for device in &devices {
            assert!(!device.to_lowercase().contains("hdmi"), "{}", device);
        }
    }

    #[test]
    #[ignore] // Requires audio hardware
    fn test_invalid_device_name() {
        match CpalFrameSource::new(Some("NonExistentDevice12345"), 16000, 480) {
            Err(VoiceError::AudioDeviceNotFound { device }) => {
                assert_eq!(device, "NonExistentDevice12345");
            }
            Err(e) => panic!("Expected AudioDeviceNotFound, got {}", e),
            Ok(_) => panic!("Expected AudioDeviceNotFound"),
        }
    }

    #[test]
    #[ignore] // Requires audio hardware
    fn test_capture_delivers_frames() {
        let mut source = CpalFrameSource::new(None, 16000, 480).unwrap();
        source.start().unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        let mut frame = None;
        while frame.is_none() && Instant::now() < deadline {
            frame = source.next_frame(Duration::from_millis(50)).unwrap();
        }
        assert_eq!(frame.map(|f| f.len()), Some(480));
        source.stop().unwrap();
    }
}
