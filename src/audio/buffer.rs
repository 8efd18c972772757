//! PCM frames and the buffers that move them between threads
//!
//! Frames are raw 16-bit little-endian mono PCM. A frame is immutable once
//! built and is moved (never shared) from capture to transport to playback.

use bytes::{BufMut, Bytes, BytesMut};
use crossbeam::queue::ArrayQueue;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::constants::BYTES_PER_SAMPLE;

/// One fixed-size chunk of 16-bit LE mono PCM
#[derive(Debug, PartialEq, Eq)]
pub struct AudioFrame {
    data: Bytes,
}

impl AudioFrame {
    pub fn from_bytes(data: impl Into<Bytes>) -> Self {
        Self { data: data.into() }
    }

    pub fn from_samples(samples: &[i16]) -> Self {
        let mut data = BytesMut::with_capacity(samples.len() * BYTES_PER_SAMPLE);
        for &sample in samples {
            data.put_i16_le(sample);
        }
        Self {
            data: data.freeze(),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Bytes {
        self.data
    }

    /// Length in bytes
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn sample_count(&self) -> usize {
        self.data.len() / BYTES_PER_SAMPLE
    }

    /// Decode samples; a trailing odd byte is ignored
    pub fn samples(&self) -> impl Iterator<Item = i16> + '_ {
        self.data
            .chunks_exact(BYTES_PER_SAMPLE)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
    }
}

/// Convert a normalized float sample to 16-bit PCM
#[inline]
pub fn f32_to_i16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16
}

/// Convert 16-bit PCM to a normalized float sample
#[inline]
pub fn i16_to_f32(sample: i16) -> f32 {
    sample as f32 / i16::MAX as f32
}

/// Packs a stream of samples into fixed-size frames.
///
/// Only complete frames are emitted; leftovers wait for the next push.
pub struct FrameAssembler {
    frame_size: usize,
    pending: BytesMut,
}

impl FrameAssembler {
    pub fn new(frame_size: usize) -> Self {
        Self {
            frame_size,
            pending: BytesMut::with_capacity(frame_size),
        }
    }

    pub fn push_samples<I, F>(&mut self, samples: I, mut emit: F)
    where
        I: IntoIterator<Item = i16>,
        F: FnMut(AudioFrame),
    {
        for sample in samples {
            self.pending.put_i16_le(sample);
            if self.pending.len() >= self.frame_size {
                let frame = self.pending.split_to(self.frame_size).freeze();
                emit(AudioFrame::from_bytes(frame));
                self.pending.reserve(self.frame_size);
            }
        }
    }

    /// Bytes waiting for a full frame
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

/// Lock-free bounded queue of frames
pub struct FrameQueue {
    queue: ArrayQueue<AudioFrame>,
    overflow_count: AtomicUsize,
    underrun_count: AtomicUsize,
}

impl FrameQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity),
            overflow_count: AtomicUsize::new(0),
            underrun_count: AtomicUsize::new(0),
        }
    }

    /// Push a frame, handing it back if the queue is full
    pub fn push(&self, frame: AudioFrame) -> Result<(), AudioFrame> {
        self.queue.push(frame).inspect_err(|_| {
            self.overflow_count.fetch_add(1, Ordering::Relaxed);
        })
    }

    /// Pop a frame, counting an underrun if there is none
    pub fn pop(&self) -> Option<AudioFrame> {
        let frame = self.queue.pop();
        if frame.is_none() {
            self.underrun_count.fetch_add(1, Ordering::Relaxed);
        }
        frame
    }

    pub fn clear(&self) {
        while self.queue.pop().is_some() {}
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.queue.is_full()
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    pub fn overflow_count(&self) -> usize {
        self.overflow_count.load(Ordering::Relaxed)
    }

    pub fn underrun_count(&self) -> usize {
        self.underrun_count.load(Ordering::Relaxed)
    }
}

pub type SharedFrameQueue = Arc<FrameQueue>;

/// Reads samples one at a time out of queued frames.
///
/// Lives inside the output callback; yields `None` when nothing is queued
/// so the caller can render silence.
#[derive(Default)]
pub struct FrameCursor {
    current: Option<Bytes>,
    position: usize,
}

impl FrameCursor {
    pub fn next_sample(&mut self, queue: &FrameQueue) -> Option<i16> {
        loop {
            if let Some(data) = &self.current {
                if self.position + BYTES_PER_SAMPLE <= data.len() {
                    let sample =
                        i16::from_le_bytes([data[self.position], data[self.position + 1]]);
                    self.position += BYTES_PER_SAMPLE;
                    return Some(sample);
                }
            }

            let frame = queue.pop()?;
            self.current = Some(frame.into_bytes());
            self.position = 0;
        }
    }

    pub fn reset(&mut self) {
        self.current = None;
        self.position = 0;
    }
}
