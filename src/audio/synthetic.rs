//! Hardware-free audio backend
//!
//! Capture produces a continuous sawtooth so receivers can check that
//! frames arrive whole and in order; playback records what it was given.
//! Used by the `--synthetic` mode of the binary and by tests.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::audio::buffer::{AudioFrame, FrameAssembler};
use crate::audio::capture::FrameSource;
use crate::audio::device::{AudioBackend, AudioFormat};
use crate::audio::playback::FrameSink;
use crate::error::AudioError;

#[derive(Default)]
struct SyntheticState {
    /// Frames each capture produces before going silent; unlimited if None
    frame_limit: Mutex<Option<usize>>,
    /// Delay per captured frame; real time if None
    pace: Mutex<Option<Duration>>,
    capture_unavailable: AtomicBool,
    playback_unavailable: AtomicBool,
    /// Overflow count every capture reports
    capture_overruns: AtomicU64,
    playback_stalled: AtomicBool,
    capture_starts: AtomicUsize,
    active_captures: AtomicUsize,
    max_active_captures: AtomicUsize,
    playback_starts: AtomicUsize,
    played: Mutex<Vec<AudioFrame>>,
}

/// Shared handle; clones observe the same devices
#[derive(Clone, Default)]
pub struct SyntheticBackend {
    state: Arc<SyntheticState>,
}

impl SyntheticBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stop producing audio after `frames` frames per capture
    pub fn with_frame_limit(self, frames: usize) -> Self {
        *self.state.frame_limit.lock() = Some(frames);
        self
    }

    /// Produce frames every `pace` instead of in real time
    pub fn with_pace(self, pace: Duration) -> Self {
        *self.state.pace.lock() = Some(pace);
        self
    }

    /// Make the microphone fail to open
    pub fn set_capture_unavailable(&self, unavailable: bool) {
        self.state.capture_unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Make the speaker fail to open
    pub fn set_playback_unavailable(&self, unavailable: bool) {
        self.state.playback_unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Pretend the microphone overflowed `frames` times
    pub fn set_capture_overruns(&self, frames: u64) {
        self.state.capture_overruns.store(frames, Ordering::SeqCst);
    }

    /// Make the speaker reject every frame as stale
    pub fn set_playback_stalled(&self, stalled: bool) {
        self.state.playback_stalled.store(stalled, Ordering::SeqCst);
    }

    pub fn capture_starts(&self) -> usize {
        self.state.capture_starts.load(Ordering::SeqCst)
    }

    pub fn active_captures(&self) -> usize {
        self.state.active_captures.load(Ordering::SeqCst)
    }

    /// Most captures ever open at the same time
    pub fn max_active_captures(&self) -> usize {
        self.state.max_active_captures.load(Ordering::SeqCst)
    }

    pub fn playback_starts(&self) -> usize {
        self.state.playback_starts.load(Ordering::SeqCst)
    }

    pub fn played_count(&self) -> usize {
        self.state.played.lock().len()
    }

    /// Take every frame played so far
    pub fn take_played(&self) -> Vec<AudioFrame> {
        std::mem::take(&mut *self.state.played.lock())
    }
}

impl AudioBackend for SyntheticBackend {
    fn open_capture(&self, format: AudioFormat) -> Result<Box<dyn FrameSource>, AudioError> {
        Ok(Box::new(SawtoothCapture {
            state: self.state.clone(),
            format,
            running: false,
            next_sample: 0,
            produced: 0,
        }))
    }

    fn open_playback(&self, format: AudioFormat) -> Result<Box<dyn FrameSink>, AudioError> {
        Ok(Box::new(RecordingPlayback {
            state: self.state.clone(),
            format,
            running: false,
        }))
    }
}

struct SawtoothCapture {
    state: Arc<SyntheticState>,
    format: AudioFormat,
    running: bool,
    next_sample: i16,
    produced: usize,
}

impl SawtoothCapture {
    fn frame_interval(&self) -> Duration {
        self.state.pace.lock().unwrap_or_else(|| {
            Duration::from_secs_f64(
                self.format.samples_per_frame() as f64 / self.format.sample_rate as f64,
            )
        })
    }
}

impl FrameSource for SawtoothCapture {
    fn start(&mut self) -> Result<(), AudioError> {
        if self.state.capture_unavailable.load(Ordering::SeqCst) {
            return Err(AudioError::DeviceUnavailable("synthetic microphone disabled".into()));
        }
        if !self.running {
            self.running = true;
            self.produced = 0;
            self.state.capture_starts.fetch_add(1, Ordering::SeqCst);
            let active = self.state.active_captures.fetch_add(1, Ordering::SeqCst) + 1;
            self.state.max_active_captures.fetch_max(active, Ordering::SeqCst);
        }
        Ok(())
    }

    fn read_frame(&mut self) -> Result<Option<AudioFrame>, AudioError> {
        if !self.running {
            return Err(AudioError::NotRecording);
        }
        thread::sleep(self.frame_interval());

        let limit = *self.state.frame_limit.lock();
        if limit.is_some_and(|limit| self.produced >= limit) {
            return Ok(None);
        }

        let mut assembler = FrameAssembler::new(self.format.frame_size);
        let mut frame = None;
        let start = self.next_sample;
        let samples = (0..self.format.samples_per_frame()).map(|i| start.wrapping_add(i as i16));
        assembler.push_samples(samples, |f| frame = Some(f));

        self.next_sample = start.wrapping_add(self.format.samples_per_frame() as i16);
        self.produced += 1;
        Ok(frame)
    }

    fn stop(&mut self) {
        if self.running {
            self.running = false;
            self.state.active_captures.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn frames_dropped(&self) -> u64 {
        self.state.capture_overruns.load(Ordering::SeqCst)
    }
}

impl Drop for SawtoothCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

struct RecordingPlayback {
    state: Arc<SyntheticState>,
    format: AudioFormat,
    running: bool,
}

impl FrameSink for RecordingPlayback {
    fn start(&mut self) -> Result<(), AudioError> {
        if self.state.playback_unavailable.load(Ordering::SeqCst) {
            return Err(AudioError::DeviceUnavailable("synthetic speaker disabled".into()));
        }
        if !self.running {
            self.running = true;
            self.state.playback_starts.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    fn write_frame(&mut self, frame: AudioFrame) -> Result<(), AudioError> {
        if !self.running {
            return Err(AudioError::NotPlaying);
        }
        if frame.len() != self.format.frame_size {
            return Err(AudioError::UnsupportedFormat(format!(
                "{}-byte frame, expected {}",
                frame.len(),
                self.format.frame_size
            )));
        }
        if self.state.playback_stalled.load(Ordering::SeqCst) {
            return Err(AudioError::Stalled);
        }
        self.state.played.lock().push(frame);
        Ok(())
    }

    fn stop(&mut self) {
        self.running = false;
    }
}
