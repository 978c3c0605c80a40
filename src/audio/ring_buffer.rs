//! Fixed-capacity circular store of recent capture audio.
//!
//! Positions are absolute: sample `n` is the n-th sample ever written, so a
//! span recorded by the capture thread stays meaningful after the buffer wraps
//! (as long as it has not been overwritten).

use std::sync::Mutex;
use std::time::Duration;

struct Inner {
    samples: Box<[i16]>,
    /// Absolute position one past the newest sample.
    total_written: u64,
    /// Samples before this position are treated as absent.
    cleared_at: u64,
}

impl Inner {
    fn oldest(&self) -> u64 {
        let capacity = self.samples.len() as u64;
        self.total_written.saturating_sub(capacity).max(self.cleared_at)
    }

    /// Copy `[start, end)` out of the ring. Caller guarantees the span is retained.
    fn copy_span(&self, start: u64, end: u64, out: &mut Vec<i16>) {
        let capacity = self.samples.len();
        let len = (end - start) as usize;
        let first = (start % capacity as u64) as usize;
        let head = len.min(capacity - first);
        out.extend_from_slice(&self.samples[first..first + head]);
        out.extend_from_slice(&self.samples[..len - head]);
    }
}

/// Single-writer ring buffer shared between the capture thread and the
/// orchestrator.
///
/// The lock is held only for the memory copy. Writes never fail and never
/// wait on readers beyond that copy; once capacity is exceeded the oldest
/// samples are overwritten.
pub struct RingBuffer {
    inner: Mutex<Inner>,
    capacity: usize,
    sample_rate: u32,
}

impl RingBuffer {
    /// Create a buffer holding `capacity` samples at `sample_rate`.
    pub fn new(capacity: usize, sample_rate: u32) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Mutex::new(Inner {
                samples: vec![0i16; capacity].into_boxed_slice(),
                total_written: 0,
                cleared_at: 0,
            }),
            capacity,
            sample_rate,
        }
    }

    /// Create a buffer sized to hold `duration` of audio.
    pub fn with_duration(duration: Duration, sample_rate: u32) -> Self {
        let capacity = (duration.as_secs_f64() * f64::from(sample_rate)).ceil() as usize;
        Self::new(capacity, sample_rate)
    }

    /// Append samples and return the absolute position of the first one.
    ///
    /// If `samples` is longer than the capacity only its tail is kept, but
    /// positions still advance by the full length.
    pub fn write(&self, samples: &[i16]) -> u64 {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let start = inner.total_written;
        let len = samples.len() as u64;

        let kept = if samples.len() > self.capacity {
            &samples[samples.len() - self.capacity..]
        } else {
            samples
        };
        let kept_start = start + (len - kept.len() as u64);
        let offset = (kept_start % self.capacity as u64) as usize;
        let head = kept.len().min(self.capacity - offset);
        inner.samples[offset..offset + head].copy_from_slice(&kept[..head]);
        inner.samples[..kept.len() - head].copy_from_slice(&kept[head..]);

        inner.total_written = start + len;
        start
    }

    /// The most recent `duration` of audio.
    ///
    /// Requests longer than the capacity are truncated to it. The part of the
    /// request not covered by audio written since the last clear is
    /// zero-padded at the front, so the result length is always the
    /// (truncated) requested length.
    pub fn read_last(&self, duration: Duration) -> Vec<i16> {
        let requested = ((duration.as_secs_f64() * f64::from(self.sample_rate)).round() as usize)
            .min(self.capacity);

        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let end = inner.total_written;
        let available = (end - inner.oldest()) as usize;
        let take = requested.min(available);

        let mut out = Vec::with_capacity(requested);
        out.resize(requested - take, 0);
        inner.copy_span(end - take as u64, end, &mut out);
        out
    }

    /// Samples in the absolute span `[start, end)` that are still retained.
    ///
    /// Parts of the span that were overwritten, cleared or not yet written
    /// are omitted rather than padded.
    pub fn read_span(&self, start: u64, end: u64) -> Vec<i16> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let start = start.max(inner.oldest());
        let end = end.min(inner.total_written);
        if start >= end {
            return Vec::new();
        }

        let mut out = Vec::with_capacity((end - start) as usize);
        inner.copy_span(start, end, &mut out);
        out
    }

    /// Forget all audio written so far without reallocating.
    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.cleared_at = inner.total_written;
    }

    /// Forget audio before `position`, keeping anything written at or after it.
    pub fn clear_before(&self, position: u64) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let position = position.min(inner.total_written);
        inner.cleared_at = inner.cleared_at.max(position);
    }

    /// Absolute position one past the newest sample.
    pub fn position(&self) -> u64 {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .total_written
    }

    /// Samples currently readable (written since the last clear and not overwritten).
    pub fn available(&self) -> usize {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        (inner.total_written - inner.oldest()) as usize
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}
