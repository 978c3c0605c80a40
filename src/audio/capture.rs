//! Capture thread and the drop-oldest queue that carries its frames to the
//! async side.
//!
//! The capture thread does three things per frame: copy into the ring buffer,
//! classify, push a [`ClassifiedFrame`]. It never waits on the consumer.

use crate::audio::frame::{AudioFrame, ClassifiedFrame};
use crate::audio::ring_buffer::RingBuffer;
use crate::audio::source::AudioFrameSource;
use crate::audio::vad::SpeechClassifier;
use crate::defaults;
use crate::error::{Result, VoiceError};
use crossbeam_channel::{Receiver, Sender, TryRecvError, TrySendError};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tokio::sync::Notify;

/// What the capture thread reports to the orchestrator.
#[derive(Debug)]
pub enum CaptureMessage {
    Frame(ClassifiedFrame),
    /// The device failed for good; no more frames will follow.
    Failed(VoiceError),
}

/// Bounded sender that makes room by discarding the oldest queued item.
///
/// Holds a receiver of its own channel for eviction, so the channel never
/// reports disconnection to it; owners track that separately.
pub(crate) struct EvictingSender<T> {
    tx: Sender<T>,
    evict: Receiver<T>,
    dropped: Arc<AtomicU64>,
}

impl<T> Clone for EvictingSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            evict: self.evict.clone(),
            dropped: Arc::clone(&self.dropped),
        }
    }
}

impl<T> EvictingSender<T> {
    /// Items evicted so far are added to `dropped`.
    pub(crate) fn bounded(capacity: usize, dropped: Arc<AtomicU64>) -> (Self, Receiver<T>) {
        let (tx, rx) = crossbeam_channel::bounded(capacity.max(1));
        (
            Self {
                tx,
                evict: rx.clone(),
                dropped,
            },
            rx,
        )
    }

    /// Enqueue without blocking. Returns false if the channel is disconnected.
    pub(crate) fn send(&self, item: T) -> bool {
        let mut item = item;
        loop {
            match self.tx.try_send(item) {
                Ok(()) => return true,
                Err(TrySendError::Full(returned)) => {
                    if self.evict.try_recv().is_ok() {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                    }
                    item = returned;
                }
                Err(TrySendError::Disconnected(_)) => return false,
            }
        }
    }
}

/// Create a bounded queue that evicts its oldest entry when full.
pub fn frame_queue(capacity: usize) -> (FrameProducer, FrameConsumer) {
    let dropped = Arc::new(AtomicU64::new(0));
    let (tx, rx) = EvictingSender::bounded(capacity, Arc::clone(&dropped));
    let notify = Arc::new(Notify::new());
    let closed = Arc::new(AtomicBool::new(false));
    (
        FrameProducer {
            tx: Some(tx),
            notify: Arc::clone(&notify),
            closed: Arc::clone(&closed),
        },
        FrameConsumer {
            rx,
            notify,
            dropped,
            closed,
        },
    )
}

/// Sending half, owned by the capture thread.
pub struct FrameProducer {
    tx: Option<EvictingSender<CaptureMessage>>,
    notify: Arc<Notify>,
    closed: Arc<AtomicBool>,
}

impl FrameProducer {
    /// Enqueue without blocking, evicting the oldest entry if the queue is full.
    ///
    /// Returns false once the consumer is gone.
    pub fn push(&self, message: CaptureMessage) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        let Some(tx) = &self.tx else {
            return false;
        };
        if !tx.send(message) {
            return false;
        }
        self.notify.notify_one();
        true
    }
}

impl Drop for FrameProducer {
    fn drop(&mut self) {
        // Disconnect first so the woken consumer sees the end of the stream.
        self.tx.take();
        self.notify.notify_one();
    }
}

/// Receiving half, owned by the orchestrator task.
pub struct FrameConsumer {
    rx: Receiver<CaptureMessage>,
    notify: Arc<Notify>,
    dropped: Arc<AtomicU64>,
    closed: Arc<AtomicBool>,
}

impl FrameConsumer {
    /// Wait for the next message. `None` once the producer is gone and the
    /// queue is drained.
    pub async fn recv(&self) -> Option<CaptureMessage> {
        loop {
            let notified = self.notify.notified();
            match self.rx.try_recv() {
                Ok(message) => return Some(message),
                Err(TryRecvError::Disconnected) => return None,
                Err(TryRecvError::Empty) => notified.await,
            }
        }
    }

    /// Non-blocking receive.
    pub fn try_recv(&self) -> Option<CaptureMessage> {
        self.rx.try_recv().ok()
    }

    /// Frames evicted since the last call.
    pub fn take_dropped(&self) -> u64 {
        self.dropped.swap(0, Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

impl Drop for FrameConsumer {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::Release);
    }
}

/// Capture thread tuning.
#[derive(Debug, Clone, Copy)]
pub struct CaptureConfig {
    /// How long one `next_frame` call may wait before shutdown is re-checked.
    pub poll_timeout: Duration,
    /// Consecutive failed reads before capture is declared dead.
    pub max_consecutive_errors: u32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_millis(defaults::CAPTURE_POLL_MS),
            max_consecutive_errors: defaults::MAX_CONSECUTIVE_READ_ERRORS,
        }
    }
}

/// Handle to a running capture thread.
pub struct CaptureHandle {
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl CaptureHandle {
    /// Signal the thread to stop and wait up to `timeout` for it.
    ///
    /// A thread that overruns the deadline is detached.
    pub fn stop(mut self, timeout: Duration) {
        self.running.store(false, Ordering::SeqCst);
        let Some(handle) = self.thread.take() else {
            return;
        };

        let deadline = Instant::now() + timeout;
        let poll_interval = Duration::from_millis(5);
        while !handle.is_finished() {
            if Instant::now() >= deadline {
                tracing::warn!("capture thread did not stop in time, detaching");
                return;
            }
            thread::sleep(poll_interval);
        }
        if handle.join().is_err() {
            tracing::error!("capture thread panicked");
        }
    }

    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for CaptureHandle {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

/// Start the source and spawn the capture thread.
///
/// A source that fails to start is reported here, before any thread exists.
pub fn spawn_capture<S, C>(
    mut source: S,
    mut classifier: C,
    ring: Arc<RingBuffer>,
    producer: FrameProducer,
    config: CaptureConfig,
) -> Result<CaptureHandle>
where
    S: AudioFrameSource + 'static,
    C: SpeechClassifier + 'static,
{
    source.start()?;

    let running = Arc::new(AtomicBool::new(true));
    let thread_running = Arc::clone(&running);

    let thread = thread::Builder::new()
        .name("parley-capture".to_string())
        .spawn(move || {
            let mut sequence: u64 = 0;
            let mut consecutive_errors: u32 = 0;

            while thread_running.load(Ordering::SeqCst) {
                let samples = match source.next_frame(config.poll_timeout) {
                    Ok(Some(samples)) => {
                        consecutive_errors = 0;
                        samples
                    }
                    Ok(None) => continue,
                    Err(e) => {
                        consecutive_errors += 1;
                        tracing::warn!(consecutive_errors, error = %e, "audio read failed");
                        if consecutive_errors >= config.max_consecutive_errors {
                            let error = VoiceError::AudioCapture {
                                message: format!(
                                    "audio capture failed {} times in a row: {}",
                                    consecutive_errors, e
                                ),
                            };
                            tracing::error!(error = %error, "giving up on audio source");
                            producer.push(CaptureMessage::Failed(error));
                            break;
                        }
                        thread::sleep(config.poll_timeout);
                        continue;
                    }
                };

                let frame = AudioFrame::new(samples, sequence);
                sequence += 1;
                let start_position = ring.write(&frame.samples);
                let classification = classifier.classify(&frame.samples);
                let classified = ClassifiedFrame {
                    sequence: frame.sequence,
                    start_position,
                    end_position: start_position + frame.samples.len() as u64,
                    is_speech: classification.is_speech,
                    level: classification.level,
                    captured_at: frame.captured_at,
                };

                if !producer.push(CaptureMessage::Frame(classified)) {
                    break;
                }
            }

            if let Err(e) = source.stop() {
                tracing::warn!(error = %e, "failed to stop audio source");
            }
            tracing::debug!(frames = sequence, "capture thread exiting");
        })
        .map_err(|e| VoiceError::AudioCapture {
            message: format!("Failed to spawn capture thread: {}", e),
        })?;

    Ok(CaptureHandle {
        running,
        thread: Some(thread),
    })
}
