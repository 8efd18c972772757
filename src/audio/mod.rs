//! Audio subsystem module

pub mod buffer;
pub mod capture;
pub mod device;
pub mod playback;
pub mod synthetic;

pub use buffer::{AudioFrame, FrameAssembler, FrameQueue};
pub use capture::{CpalCapture, FrameSource};
pub use device::{list_devices, AudioBackend, AudioFormat, CpalBackend};
pub use playback::{CpalPlayback, FrameSink};
pub use synthetic::SyntheticBackend;
