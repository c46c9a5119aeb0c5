/// Audio buffer module for staging samples between feeds
///
/// Implements the fixed-capacity circular store the engine drains one
/// feature step at a time. Writes never fail: when the buffer is full the
/// oldest samples are dropped.

use ringbuf::traits::{Consumer, Observer, RingBuffer as _};
use ringbuf::HeapRb;
use tracing::{debug, trace};

/// Audio sample format (16-bit PCM)
pub type AudioSample = i16;

/// Engine sample rate (16kHz mono)
pub const SAMPLE_RATE: usize = 16000;

/// Staging duration in milliseconds (64ms)
pub const BUFFER_DURATION_MS: usize = 64;

/// Default ring buffer capacity: 64ms at 16kHz
pub const BUFFER_SIZE: usize = SAMPLE_RATE / 1000 * BUFFER_DURATION_MS; // 1,024 samples

/// Circular audio store with overwrite-oldest semantics
///
/// Single owner, single thread: the engine's feed path is the only writer
/// and the only reader, so no locking is involved.
pub struct AudioRingBuffer {
    ring: HeapRb<AudioSample>,
    sample_rate: usize,
}

impl AudioRingBuffer {
    /// Create a buffer with the default 64ms capacity
    pub fn new() -> Self {
        Self::with_capacity(BUFFER_SIZE)
    }

    /// Create a buffer with custom capacity (in samples, at least one)
    pub fn with_capacity(capacity: usize) -> Self {
        debug!("Creating audio ring buffer with capacity: {} samples", capacity);

        Self {
            ring: HeapRb::new(capacity.max(1)),
            sample_rate: SAMPLE_RATE,
        }
    }

    /// Set the rate used for duration reporting
    pub fn with_sample_rate(mut self, sample_rate: usize) -> Self {
        self.sample_rate = sample_rate.max(1);
        self
    }

    /// Write audio samples, overwriting the oldest data when full
    ///
    /// Always accepts the whole input and returns its length.
    pub fn write(&mut self, samples: &[AudioSample]) -> usize {
        let capacity = self.capacity();
        let vacant = capacity - self.ring.occupied_len();

        // Only the newest `capacity` samples can survive this write.
        let tail = &samples[samples.len().saturating_sub(capacity)..];
        self.ring.push_slice_overwrite(tail);

        if samples.len() > vacant {
            trace!(
                "Ring buffer full, dropped {} oldest samples",
                samples.len() - vacant
            );
        }

        samples.len()
    }

    /// Read up to `out.len()` samples, returning how many were copied
    pub fn read(&mut self, out: &mut [AudioSample]) -> usize {
        self.ring.pop_slice(out)
    }

    /// Number of unread samples
    pub fn available(&self) -> usize {
        self.ring.occupied_len()
    }

    /// Check if buffer is empty
    pub fn is_empty(&self) -> bool {
        self.available() == 0
    }

    /// Get buffer capacity
    pub fn capacity(&self) -> usize {
        self.ring.capacity().get()
    }

    /// Drop all unread samples, rewinding both cursors
    pub fn clear(&mut self) {
        let dropped = self.ring.clear();
        debug!("Cleared audio ring buffer ({} samples dropped)", dropped);
    }

    /// Get the sample rate
    pub fn sample_rate(&self) -> usize {
        self.sample_rate
    }

    /// Get duration of audio currently buffered (in seconds)
    pub fn duration_secs(&self) -> f32 {
        self.available() as f32 / self.sample_rate as f32
    }
}

impl Default for AudioRingBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_buffer_creation() {
        let buffer = AudioRingBuffer::new();
        assert_eq!(buffer.capacity(), BUFFER_SIZE);
        assert_eq!(buffer.available(), 0);
        assert!(buffer.is_empty());
        assert_eq!(buffer.sample_rate(), SAMPLE_RATE);
    }

    #[test]
    fn test_write_and_read() {
        let mut buffer = AudioRingBuffer::with_capacity(1000);
        let samples: Vec<i16> = (0..100).map(|i| i as i16).collect();

        let written = buffer.write(&samples);
        assert_eq!(written, 100);
        assert_eq!(buffer.available(), 100);

        let mut out = [0i16; 50];
        assert_eq!(buffer.read(&mut out), 50);
        assert_eq!(buffer.available(), 50);
        assert_eq!(out[0], 0);
        assert_eq!(out[49], 49);
    }

    #[test]
    fn test_read_more_than_available() {
        let mut buffer = AudioRingBuffer::with_capacity(100);
        buffer.write(&[7; 30]);

        let mut out = [0i16; 80];
        assert_eq!(buffer.read(&mut out), 30);
        assert!(buffer.is_empty());
        assert_eq!(&out[..30], &[7; 30]);
        assert_eq!(out[30], 0);
    }

    #[test]
    fn test_overflow_drops_oldest() {
        let mut buffer = AudioRingBuffer::with_capacity(10);
        let first: Vec<i16> = (0..8).collect();
        let second: Vec<i16> = (8..14).collect();

        buffer.write(&first);
        buffer.write(&second);
        assert_eq!(buffer.available(), 10);

        let mut out = [0i16; 10];
        assert_eq!(buffer.read(&mut out), 10);
        let expected: Vec<i16> = (4..14).collect();
        assert_eq!(out.to_vec(), expected);
    }

    #[test]
    fn test_single_write_larger_than_capacity() {
        let mut buffer = AudioRingBuffer::with_capacity(100);
        let samples: Vec<i16> = (0..150).collect();

        assert_eq!(buffer.write(&samples), 150);
        assert_eq!(buffer.available(), 100);

        let mut out = [0i16; 1];
        buffer.read(&mut out);
        assert_eq!(out[0], 50);
    }

    #[test]
    fn test_available_tracks_written_minus_read() {
        let mut buffer = AudioRingBuffer::with_capacity(64);
        let mut written = 0usize;
        let mut read = 0usize;
        let mut scratch = [0i16; 64];

        for round in 0..40usize {
            let chunk = vec![round as i16; (round * 7) % 23];
            written += buffer.write(&chunk);
            let buffered = (written - read).min(64);
            assert_eq!(buffer.available(), buffered);
            // Anything beyond capacity has been dropped for good.
            read = written - buffered;

            let wanted = (round * 5) % 19;
            let got = buffer.read(&mut scratch[..wanted]);
            assert_eq!(got, wanted.min(buffered));
            read += got;
            assert_eq!(buffer.available(), written - read);
        }
    }

    #[test]
    fn test_clear() {
        let mut buffer = AudioRingBuffer::with_capacity(1000);
        buffer.write(&vec![1; 500]);
        assert_eq!(buffer.available(), 500);

        buffer.clear();
        assert_eq!(buffer.available(), 0);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_duration_calculation() {
        let mut buffer = AudioRingBuffer::with_capacity(SAMPLE_RATE);
        buffer.write(&vec![0; SAMPLE_RATE / 2]);

        assert_relative_eq!(buffer.duration_secs(), 0.5, epsilon = 0.01);
    }
}
