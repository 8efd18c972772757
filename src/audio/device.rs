//! Audio device lookup and format negotiation

use cpal::traits::{DeviceTrait, HostTrait};
use cpal::{SampleFormat, SampleRate, StreamConfig, SupportedStreamConfigRange};
use serde::Serialize;

use crate::audio::capture::{CpalCapture, FrameSource};
use crate::audio::playback::{CpalPlayback, FrameSink};
use crate::config::SessionConfig;
use crate::constants::CHANNELS;
use crate::error::AudioError;

/// Wire-level audio format; capture and playback must agree on it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    pub sample_rate: u32,
    /// Bytes per frame
    pub frame_size: usize,
}

impl AudioFormat {
    pub fn from_config(config: &SessionConfig) -> Self {
        Self {
            sample_rate: config.sample_rate_hz,
            frame_size: config.frame_size,
        }
    }

    pub fn samples_per_frame(&self) -> usize {
        self.frame_size / crate::constants::BYTES_PER_SAMPLE
    }
}

/// Opens capture and playback devices for a session
pub trait AudioBackend: Send + Sync {
    /// An unstarted microphone source
    fn open_capture(&self, format: AudioFormat) -> Result<Box<dyn FrameSource>, AudioError>;

    /// An unstarted speaker sink
    fn open_playback(&self, format: AudioFormat) -> Result<Box<dyn FrameSink>, AudioError>;
}

/// Backend over the host's default (or named) cpal devices
#[derive(Debug, Clone, Default)]
pub struct CpalBackend {
    pub input_device: Option<String>,
    pub output_device: Option<String>,
}

impl AudioBackend for CpalBackend {
    fn open_capture(&self, format: AudioFormat) -> Result<Box<dyn FrameSource>, AudioError> {
        Ok(Box::new(CpalCapture::new(self.input_device.clone(), format)))
    }

    fn open_playback(&self, format: AudioFormat) -> Result<Box<dyn FrameSink>, AudioError> {
        Ok(Box::new(CpalPlayback::new(self.output_device.clone(), format)))
    }
}

/// Direction of a device stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Input,
    Output,
}

/// Device summary for listings
#[derive(Debug, Clone, Serialize)]
pub struct AudioDeviceInfo {
    pub name: String,
    pub is_input: bool,
    pub is_output: bool,
    pub is_default: bool,
}

/// List all available audio devices
pub fn list_devices() -> Vec<AudioDeviceInfo> {
    let host = cpal::default_host();
    let mut devices: Vec<AudioDeviceInfo> = Vec::new();

    let default_input = host.default_input_device().and_then(|d| d.name().ok());
    let default_output = host.default_output_device().and_then(|d| d.name().ok());

    if let Ok(inputs) = host.input_devices() {
        for name in inputs.filter_map(|d| d.name().ok()) {
            devices.push(AudioDeviceInfo {
                is_default: default_input.as_ref() == Some(&name),
                name,
                is_input: true,
                is_output: false,
            });
        }
    }

    if let Ok(outputs) = host.output_devices() {
        for name in outputs.filter_map(|d| d.name().ok()) {
            let is_default = default_output.as_ref() == Some(&name);
            if let Some(existing) = devices.iter_mut().find(|d| d.name == name) {
                existing.is_output = true;
                existing.is_default |= is_default;
            } else {
                devices.push(AudioDeviceInfo {
                    name,
                    is_input: false,
                    is_output: true,
                    is_default,
                });
            }
        }
    }

    devices
}

/// Find a device by name, or the host default when no name is given
pub fn find_device(name: Option<&str>, direction: Direction) -> Result<cpal::Device, AudioError> {
    let host = cpal::default_host();

    let Some(name) = name else {
        let device = match direction {
            Direction::Input => host.default_input_device(),
            Direction::Output => host.default_output_device(),
        };
        return device.ok_or_else(|| {
            AudioError::DeviceUnavailable(format!("no default {direction:?} device"))
        });
    };

    let devices = match direction {
        Direction::Input => host.input_devices(),
        Direction::Output => host.output_devices(),
    }
    .map_err(|e| AudioError::DeviceUnavailable(e.to_string()))?;

    for device in devices {
        if device.name().map(|n| n == name).unwrap_or(false) {
            return Ok(device);
        }
    }

    Err(AudioError::DeviceUnavailable(name.to_string()))
}

/// Stream settings the device accepted, and how to convert to the wire format
#[derive(Debug, Clone)]
pub struct NegotiatedConfig {
    pub config: StreamConfig,
    pub sample_format: SampleFormat,
}

impl NegotiatedConfig {
    pub fn channels(&self) -> usize {
        self.config.channels as usize
    }
}

/// Pick the device config closest to 16-bit mono at `sample_rate`.
///
/// Native i16 mono wins; otherwise f32 and/or extra channels are accepted
/// and converted in the callbacks. The sample rate is never resampled.
pub fn negotiate_config<I>(ranges: I, sample_rate: u32) -> Result<NegotiatedConfig, AudioError>
where
    I: IntoIterator<Item = SupportedStreamConfigRange>,
{
    let rate = SampleRate(sample_rate);
    let rank = |range: &SupportedStreamConfigRange| -> Option<u8> {
        let format_rank = match range.sample_format() {
            SampleFormat::I16 => 0,
            SampleFormat::F32 => 1,
            _ => return None,
        };
        let channel_rank = if range.channels() == CHANNELS { 0 } else { 2 };
        Some(format_rank + channel_rank)
    };

    ranges
        .into_iter()
        .filter(|r| r.min_sample_rate() <= rate && rate <= r.max_sample_rate())
        .filter(|r| r.channels() >= 1)
        .filter_map(|r| rank(&r).map(|score| (score, r)))
        .min_by_key(|(score, _)| *score)
        .map(|(_, range)| {
            let sample_format = range.sample_format();
            let mut config = range.with_sample_rate(rate).config();
            config.buffer_size = cpal::BufferSize::Default;
            NegotiatedConfig {
                config,
                sample_format,
            }
        })
        .ok_or_else(|| {
            AudioError::UnsupportedFormat(format!(
                "no i16/f32 config at {sample_rate} Hz"
            ))
        })
}

/// Open `device` for `direction` and negotiate its stream config
pub fn device_config(
    device: &cpal::Device,
    direction: Direction,
    sample_rate: u32,
) -> Result<NegotiatedConfig, AudioError> {
    let ranges: Vec<SupportedStreamConfigRange> = match direction {
        Direction::Input => device.supported_input_configs().map(|r| r.collect()),
        Direction::Output => device.supported_output_configs().map(|r| r.collect()),
    }
    .map_err(|e| AudioError::DeviceUnavailable(e.to_string()))?;

    negotiate_config(ranges, sample_rate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cpal::SupportedBufferSize;

    fn range(channels: u16, min: u32, max: u32, format: SampleFormat) -> SupportedStreamConfigRange {
        SupportedStreamConfigRange::new(
            channels,
            SampleRate(min),
            SampleRate(max),
            SupportedBufferSize::Unknown,
            format,
        )
    }

    #[test]
    fn test_prefers_native_i16_mono() {
        let negotiated = negotiate_config(
            vec![
                range(2, 8000, 96000, SampleFormat::F32),
                range(1, 8000, 48000, SampleFormat::I16),
            ],
            44_100,
        )
        .unwrap();

        assert_eq!(negotiated.sample_format, SampleFormat::I16);
        assert_eq!(negotiated.channels(), 1);
        assert_eq!(negotiated.config.sample_rate, SampleRate(44_100));
    }

    #[test]
    fn test_falls_back_to_f32_stereo() {
        let negotiated =
            negotiate_config(vec![range(2, 44_100, 48_000, SampleFormat::F32)], 44_100).unwrap();
        assert_eq!(negotiated.sample_format, SampleFormat::F32);
        assert_eq!(negotiated.channels(), 2);
    }

    #[test]
    fn test_rejects_unreachable_rate() {
        let result = negotiate_config(vec![range(1, 48_000, 48_000, SampleFormat::I16)], 44_100);
        assert!(matches!(result, Err(AudioError::UnsupportedFormat(_))));
    }

    #[test]
    fn test_ignores_unhandled_formats() {
        let result = negotiate_config(vec![range(1, 8000, 96000, SampleFormat::U8)], 44_100);
        assert!(result.is_err());
    }
}
