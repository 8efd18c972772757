//! Session layer: orchestration, streaming loops and event delivery

pub mod arbiter;
pub mod completion;
pub mod manager;
pub mod observer;
pub mod streaming;

pub use arbiter::TalkArbiter;
pub use completion::Completion;
pub use manager::PeerSessionManager;
pub use observer::{spawn_observer, SessionObserver};
pub use streaming::{SessionSignal, StreamingSession};
