//! Speaker output through CPAL.

use crate::audio::frame::AudioChunk;
use crate::audio::source::resample;
use crate::collaborators::AudioOutputSink;
use crate::error::{Result, VoiceError};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

type SampleQueue = Arc<Mutex<VecDeque<f32>>>;

/// Keeps the output stream alive.
///
/// SAFETY: `cpal::Stream` is `!Send` only because some backends keep
/// thread-affine handles. It is started in `CpalOutputSink::new` and then
/// only dropped, never used from another thread. Shared access goes through
/// the `Mutex` in `CpalOutputSink`, so no `Sync` claim is made here.
struct OutputStream(cpal::Stream);

unsafe impl Send for OutputStream {}

/// Persistent output stream fed from a shared mono sample queue.
///
/// `play` enqueues and returns at once; `stop` empties the queue, so output
/// goes silent within one device callback.
pub struct CpalOutputSink {
    queue: SampleQueue,
    device_rate: u32,
    _stream: Mutex<OutputStream>,
}

impl CpalOutputSink {
    /// Open `device_name`, or the default output device.
    pub fn new(device_name: Option<&str>) -> Result<Self> {
        let host = cpal::default_host();
        let device = match device_name {
            Some(name) => host
                .output_devices()
                .map_err(|e| VoiceError::AudioOutput {
                    message: format!("Failed to enumerate output devices: {}", e),
                })?
                .find(|d| d.name().is_ok_and(|n| n == name))
                .ok_or_else(|| VoiceError::AudioDeviceNotFound {
                    device: name.to_string(),
                })?,
            None => host
                .default_output_device()
                .ok_or_else(|| VoiceError::AudioDeviceNotFound {
                    device: "default output".to_string(),
                })?,
        };

        let default_config =
            device
                .default_output_config()
                .map_err(|e| VoiceError::AudioOutput {
                    message: format!("Failed to query default output config: {}", e),
                })?;
        let device_rate = default_config.sample_rate().0;
        let channels = default_config.channels() as usize;
        let config: cpal::StreamConfig = default_config.clone().into();

        let queue: SampleQueue = Arc::new(Mutex::new(VecDeque::new()));
        let err_callback = |err: cpal::StreamError| {
            tracing::error!(error = %err, "audio output stream error");
        };

        let stream = match default_config.sample_format() {
            cpal::SampleFormat::F32 => {
                let queue = Arc::clone(&queue);
                device.build_output_stream(
                    &config,
                    move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                        fill(data, channels, &queue, |s| s);
                    },
                    err_callback,
                    None,
                )
            }
            cpal::SampleFormat::I16 => {
                let queue = Arc::clone(&queue);
                device.build_output_stream(
                    &config,
                    move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                        fill(data, channels, &queue, |s| (s * i16::MAX as f32) as i16);
                    },
                    err_callback,
                    None,
                )
            }
            format => {
                return Err(VoiceError::AudioOutput {
                    message: format!("Unsupported output sample format: {:?}", format),
                });
            }
        }
        .map_err(|e| VoiceError::AudioOutput {
            message: format!("Failed to build output stream: {}", e),
        })?;

        stream.play().map_err(|e| VoiceError::AudioOutput {
            message: format!("Failed to start output stream: {}", e),
        })?;

        tracing::debug!(
            device = device.name().unwrap_or_default(),
            sample_rate = device_rate,
            channels,
            "audio output initialized"
        );

        Ok(Self {
            queue,
            device_rate,
            _stream: Mutex::new(OutputStream(stream)),
        })
    }
}

/// Write queued mono samples to every channel; silence once the queue is empty.
fn fill<T: Copy + Default>(
    data: &mut [T],
    channels: usize,
    queue: &Mutex<VecDeque<f32>>,
    convert: impl Fn(f32) -> T,
) {
    let mut queue = queue.lock().unwrap_or_else(|e| e.into_inner());
    for frame in data.chunks_mut(channels.max(1)) {
        let value = queue.pop_front().map(&convert).unwrap_or_default();
        frame.fill(value);
    }
}

fn to_device_samples(chunk: &AudioChunk, device_rate: u32) -> Vec<f32> {
    resample(&chunk.samples, chunk.sample_rate, device_rate)
        .into_iter()
        .map(|s| f32::from(s) / 32768.0)
        .collect()
}

impl AudioOutputSink for CpalOutputSink {
    fn play(&self, chunk: &AudioChunk) -> Result<()> {
        let samples = to_device_samples(chunk, self.device_rate);
        self.queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend(samples);
        Ok(())
    }

    fn stop(&self) {
        self.queue.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    fn queued(&self) -> Duration {
        let len = self.queue.lock().unwrap_or_else(|e| e.into_inner()).len();
        Duration::from_micros(len as u64 * 1_000_000 / u64::from(self.device_rate.max(1)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fill_duplicates_mono_and_pads_with_silence() {
        let queue = Mutex::new(VecDeque::from(vec![0.5, -0.5]));
        let mut data = [1.0f32; 6];
        fill(&mut data, 2, &queue, |s| s);
        assert_eq!(data, [0.5, 0.5, -0.5, -0.5, 0.0, 0.0]);
        assert!(queue.lock().unwrap().is_empty());
    }

    #[test]
    fn test_chunk_conversion_resamples_to_device_rate() {
        let chunk = AudioChunk::new(vec![16384; 160], 16000);
        let samples = to_device_samples(&chunk, 32000);
        assert_eq!(samples.len(), 320);
        assert!(samples.iter().all(|&s| (s - 0.5).abs() < 1e-6));
    }

    #[test]
    fn test_sink_can_be_shared_across_tasks() {
        fn assert_shareable<T: Send + Sync + 'static>() {}
        assert_shareable::<CpalOutputSink>();
        assert_shareable::<Arc<dyn AudioOutputSink>>();
    }

    #[test]
    #[ignore] // Requires audio hardware
    fn test_stop_clears_queue() {
        let sink = CpalOutputSink::new(None).unwrap();
        sink.play(&AudioChunk::new(vec![0; 16000], 16000)).unwrap();
        assert!(sink.queued() > Duration::ZERO);
        sink.stop();
        assert_eq!(sink.queued(), Duration::ZERO);
    }
}
