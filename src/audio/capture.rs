//! Microphone capture
//!
//! The cpal stream lives on its own thread for as long as capture runs;
//! its callback packs samples into fixed-size frames and hands them to the
//! reader through a bounded channel.

use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::{SampleFormat, SizedSample};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::audio::buffer::{f32_to_i16, AudioFrame, FrameAssembler};
use crate::audio::device::{device_config, find_device, AudioFormat, Direction};
use crate::constants::CAPTURE_QUEUE_FRAMES;
use crate::error::AudioError;

/// Something that produces PCM frames from a microphone
pub trait FrameSource: Send {
    /// Acquire the input device
    fn start(&mut self) -> Result<(), AudioError>;

    /// Block until one full frame is available.
    ///
    /// The wait is bounded; `Ok(None)` means no complete frame arrived in
    /// time and the caller should check whether it still wants to read.
    /// Fails with [`AudioError::NotRecording`] once stopped.
    fn read_frame(&mut self) -> Result<Option<AudioFrame>, AudioError>;

    /// Release the input device. Safe to call repeatedly.
    fn stop(&mut self);

    /// Frames discarded because the reader fell behind, since creation
    fn frames_dropped(&self) -> u64 {
        0
    }
}

/// Capture from a cpal input device
pub struct CpalCapture {
    device_name: Option<String>,
    format: AudioFormat,
    running: Arc<AtomicBool>,
    thread_handle: Option<JoinHandle<()>>,
    frames_rx: Option<Receiver<AudioFrame>>,
    error_rx: Option<Receiver<AudioError>>,
    frames_dropped: Arc<AtomicU64>,
}

impl CpalCapture {
    pub fn new(device_name: Option<String>, format: AudioFormat) -> Self {
        Self {
            device_name,
            format,
            running: Arc::new(AtomicBool::new(false)),
            thread_handle: None,
            frames_rx: None,
            error_rx: None,
            frames_dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    fn read_timeout(&self) -> Duration {
        let frame = self.format.samples_per_frame() as f64 / self.format.sample_rate as f64;
        Duration::from_secs_f64(frame * 2.0).max(Duration::from_millis(20))
    }
}

impl FrameSource for CpalCapture {
    fn start(&mut self) -> Result<(), AudioError> {
        if self.running.load(Ordering::SeqCst) {
            return Ok(());
        }

        let (frames_tx, frames_rx) = bounded::<AudioFrame>(CAPTURE_QUEUE_FRAMES);
        let (error_tx, error_rx) = bounded::<AudioError>(16);
        let (ready_tx, ready_rx) = bounded::<Result<(), AudioError>>(1);

        let running = self.running.clone();
        let device_name = self.device_name.clone();
        let format = self.format;
        let dropped = self.frames_dropped.clone();

        running.store(true, Ordering::SeqCst);

        let handle = thread::Builder::new()
            .name("audio-capture".to_string())
            .spawn(move || {
                let stream = match open_input_stream(
                    device_name.as_deref(),
                    format,
                    frames_tx,
                    error_tx,
                    dropped,
                ) {
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
                // Dropping the stream releases the microphone
            })
            .map_err(|e| AudioError::StreamError(e.to_string()))?;

        let ready = ready_rx
            .recv()
            .unwrap_or_else(|_| Err(AudioError::StreamError("capture thread exited".into())));

        match ready {
            Ok(()) => {
                self.thread_handle = Some(handle);
                self.frames_rx = Some(frames_rx);
                self.error_rx = Some(error_rx);
                tracing::info!(
                    "Capture started: {} Hz, {} bytes/frame",
                    self.format.sample_rate,
                    self.format.frame_size
                );
                Ok(())
            }
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                let _ = handle.join();
                Err(e)
            }
        }
    }

    fn read_frame(&mut self) -> Result<Option<AudioFrame>, AudioError> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(AudioError::NotRecording);
        }
        if let Some(err) = self.error_rx.as_ref().and_then(|rx| rx.try_recv().ok()) {
            tracing::warn!("Capture stream reported: {}", err);
        }

        let rx = self.frames_rx.as_ref().ok_or(AudioError::NotRecording)?;
        match rx.recv_timeout(self.read_timeout()) {
            Ok(frame) => Ok(Some(frame)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(AudioError::NotRecording),
        }
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
            tracing::info!("Capture stopped");
        }
        self.frames_rx = None;
        self.error_rx = None;
    }

    fn frames_dropped(&self) -> u64 {
        self.frames_dropped.load(Ordering::Relaxed)
    }
}

impl Drop for CpalCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

fn open_input_stream(
    device_name: Option<&str>,
    format: AudioFormat,
    frames_tx: Sender<AudioFrame>,
    error_tx: Sender<AudioError>,
    dropped: Arc<AtomicU64>,
) -> Result<cpal::Stream, AudioError> {
    let device = find_device(device_name, Direction::Input)?;
    let negotiated = device_config(&device, Direction::Input, format.sample_rate)?;
    tracing::debug!(
        "Input config: {:?} {} ch",
        negotiated.sample_format,
        negotiated.channels()
    );

    let channels = negotiated.channels();
    let config = negotiated.config;
    let sink = CaptureSink {
        assembler: FrameAssembler::new(format.frame_size),
        frames_tx,
        dropped,
    };

    match negotiated.sample_format {
        SampleFormat::I16 => build_input::<i16>(&device, &config, channels, |s| s, sink, error_tx),
        SampleFormat::F32 => build_input::<f32>(&device, &config, channels, f32_to_i16, sink, error_tx),
        other => Err(AudioError::UnsupportedFormat(format!("{other:?}"))),
    }
}

/// Callback-side state: samples in, whole frames out
struct CaptureSink {
    assembler: FrameAssembler,
    frames_tx: Sender<AudioFrame>,
    dropped: Arc<AtomicU64>,
}

impl CaptureSink {
    fn push(&mut self, samples: impl Iterator<Item = i16>) {
        let frames_tx = &self.frames_tx;
        let dropped = &self.dropped;
        self.assembler.push_samples(samples, |frame| {
            if frames_tx.try_send(frame).is_err() {
                dropped.fetch_add(1, Ordering::Relaxed);
            }
        });
    }
}

fn build_input<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    channels: usize,
    to_i16: fn(T) -> i16,
    mut sink: CaptureSink,
    error_tx: Sender<AudioError>,
) -> Result<cpal::Stream, AudioError>
where
    T: SizedSample + Send + 'static,
{
    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                // Mono on the wire: keep the first channel
                sink.push(data.iter().step_by(channels).map(|&s| to_i16(s)));
            },
            move |err| {
                let _ = error_tx.try_send(AudioError::StreamError(err.to_string()));
            },
            None,
        )
        .map_err(|e| AudioError::DeviceUnavailable(e.to_string()))
}
