//! Speaker playback
//!
//! Frames written by the receive loop land in a bounded queue that the cpal
//! output callback drains sample by sample. An empty queue renders silence;
//! that is the normal state between transmissions, not an error.

use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::{SampleFormat, SizedSample};
use crossbeam_channel::{bounded, Receiver, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::audio::buffer::{i16_to_f32, AudioFrame, FrameCursor, FrameQueue, SharedFrameQueue};
use crate::audio::device::{device_config, find_device, AudioFormat, Direction};
use crate::constants::PLAYBACK_QUEUE_FRAMES;
use crate::error::AudioError;

/// Something that renders PCM frames to a speaker
pub trait FrameSink: Send {
    /// Acquire the output device
    fn start(&mut self) -> Result<(), AudioError>;

    /// Queue one frame, blocking until the device buffer has room.
    ///
    /// Fails with [`AudioError::Stalled`] if no room appears in time; the
    /// frame is discarded and the sink stays usable.
    fn write_frame(&mut self, frame: AudioFrame) -> Result<(), AudioError>;

    /// Release the output device. Safe to call repeatedly.
    fn stop(&mut self);
}

/// Longest a writer waits for room before the frame is considered stale
const MAX_WRITE_WAIT: Duration = Duration::from_secs(1);

/// Playback through a cpal output device
pub struct CpalPlayback {
    device_name: Option<String>,
    format: AudioFormat,
    running: Arc<AtomicBool>,
    queue: SharedFrameQueue,
    thread_handle: Option<JoinHandle<()>>,
    error_rx: Option<Receiver<AudioError>>,
    max_write_wait: Duration,
}

impl CpalPlayback {
    pub fn new(device_name: Option<String>, format: AudioFormat) -> Self {
        Self {
            device_name,
            format,
            running: Arc::new(AtomicBool::new(false)),
            queue: Arc::new(FrameQueue::new(PLAYBACK_QUEUE_FRAMES)),
            thread_handle: None,
            error_rx: None,
            max_write_wait: MAX_WRITE_WAIT,
        }
    }

    fn retry_interval(&self) -> Duration {
        let frame = self.format.samples_per_frame() as f64 / self.format.sample_rate as f64;
        Duration::from_secs_f64(frame / 4.0).max(Duration::from_millis(1))
    }
}

impl FrameSink for CpalPlayback {
    fn start(&mut self) -> Result<(), AudioError> {
        if self.running.load(Ordering::SeqCst) {
            return Ok(());
        }

        let (error_tx, error_rx) = bounded::<AudioError>(16);
        let (ready_tx, ready_rx) = bounded::<Result<(), AudioError>>(1);

        let running = self.running.clone();
        let device_name = self.device_name.clone();
        let sample_rate = self.format.sample_rate;
        let queue = self.queue.clone();

        running.store(true, Ordering::SeqCst);

        let handle = thread::Builder::new()
            .name("audio-playback".to_string())
            .spawn(move || {
                let stream =
                    match open_output_stream(device_name.as_deref(), sample_rate, queue, error_tx) {
                        Ok(stream) => stream,
                        Err(e) => {
                            let _ = ready_tx.send(Err(e));
                            return;
                        }
                    };

                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(AudioError::DeviceUnavailable(e.to_string())));
                    return;
                }
                let _ = ready_tx.send(Ok(()));

                while running.load(Ordering::Relaxed) {
                    thread::sleep(Duration::from_millis(10));
                }
            })
            .map_err(|e| AudioError::StreamError(e.to_string()))?;

        let ready = ready_rx
            .recv()
            .unwrap_or_else(|_| Err(AudioError::StreamError("playback thread exited".into())));

        match ready {
            Ok(()) => {
                self.thread_handle = Some(handle);
                self.error_rx = Some(error_rx);
                tracing::info!("Playback started at {} Hz", self.format.sample_rate);
                Ok(())
            }
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                let _ = handle.join();
                Err(e)
            }
        }
    }

    fn write_frame(&mut self, frame: AudioFrame) -> Result<(), AudioError> {
        if let Some(err) = self.error_rx.as_ref().and_then(|rx| rx.try_recv().ok()) {
            tracing::warn!("Playback stream reported: {}", err);
        }

        let started = Instant::now();
        let mut frame = frame;
        loop {
            if !self.running.load(Ordering::SeqCst) {
                return Err(AudioError::NotPlaying);
            }
            match self.queue.push(frame) {
                Ok(()) => return Ok(()),
                Err(rejected) => {
                    if started.elapsed() >= self.max_write_wait {
                        return Err(AudioError::Stalled);
                    }
                    frame = rejected;
                    thread::sleep(self.retry_interval());
                }
            }
        }
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
            tracing::info!("Playback stopped");
        }
        self.queue.clear();
        self.error_rx = None;
    }
}

impl Drop for CpalPlayback {
    fn drop(&mut self) {
        self.stop();
    }
}

fn open_output_stream(
    device_name: Option<&str>,
    sample_rate: u32,
    queue: SharedFrameQueue,
    error_tx: Sender<AudioError>,
) -> Result<cpal::Stream, AudioError> {
    let device = find_device(device_name, Direction::Output)?;
    let negotiated = device_config(&device, Direction::Output, sample_rate)?;
    tracing::debug!(
        "Output config: {:?} {} ch",
        negotiated.sample_format,
        negotiated.channels()
    );

    let channels = negotiated.channels();
    let config = negotiated.config;

    match negotiated.sample_format {
        SampleFormat::I16 => build_output::<i16>(&device, &config, channels, |s| s, queue, error_tx),
        SampleFormat::F32 => build_output::<f32>(&device, &config, channels, i16_to_f32, queue, error_tx),
        other => Err(AudioError::UnsupportedFormat(format!("{other:?}"))),
    }
}

/// Fill one device buffer from the queue; mono is copied to every channel
fn render<T: Copy>(
    out: &mut [T],
    channels: usize,
    cursor: &mut FrameCursor,
    queue: &FrameQueue,
    from_i16: fn(i16) -> T,
) {
    for slot in out.chunks_mut(channels) {
        let value = from_i16(cursor.next_sample(queue).unwrap_or(0));
        slot.fill(value);
    }
}

fn build_output<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    channels: usize,
    from_i16: fn(i16) -> T,
    queue: SharedFrameQueue,
    error_tx: Sender<AudioError>,
) -> Result<cpal::Stream, AudioError>
where
    T: SizedSample + Send + 'static,
{
    let mut cursor = FrameCursor::default();
    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                render(data, channels, &mut cursor, &queue, from_i16);
            },
            move |err| {
                let _ = error_tx.try_send(AudioError::StreamError(err.to_string()));
            },
            None,
        )
        .map_err(|e| AudioError::DeviceUnavailable(e.to_string()))
}
