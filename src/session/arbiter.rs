//! Talk token for half-duplex sessions
//!
//! In full-duplex mode the arbiter grants every request and plays every
//! frame. In half-duplex mode only one side talks at a time: local
//! transmission holds the token, inbound audio is muted while it is held,
//! and the token is refused while the peer has been heard recently.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::config::DuplexMode;

pub struct TalkArbiter {
    mode: DuplexMode,
    holdoff: Duration,
    talking: AtomicBool,
    last_heard: Mutex<Option<Instant>>,
}

impl TalkArbiter {
    pub fn new(mode: DuplexMode, holdoff: Duration) -> Self {
        Self {
            mode,
            holdoff,
            talking: AtomicBool::new(false),
            last_heard: Mutex::new(None),
        }
    }

    /// Take the token for a local transmission
    pub fn try_acquire(&self) -> bool {
        match self.mode {
            DuplexMode::Full => {
                self.talking.store(true, Ordering::SeqCst);
                true
            }
            DuplexMode::Half => {
                if self.peer_recently_heard() {
                    return false;
                }
                self.talking
                    .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
            }
        }
    }

    pub fn release(&self) {
        self.talking.store(false, Ordering::SeqCst);
    }

    pub fn is_talking(&self) -> bool {
        self.talking.load(Ordering::SeqCst)
    }

    /// Record that a frame from the peer arrived
    pub fn note_peer_frame(&self) {
        *self.last_heard.lock() = Some(Instant::now());
    }

    /// Whether an inbound frame should reach the speaker
    pub fn should_play(&self) -> bool {
        match self.mode {
            DuplexMode::Full => true,
            DuplexMode::Half => !self.is_talking(),
        }
    }

    fn peer_recently_heard(&self) -> bool {
        self.last_heard
            .lock()
            .map(|at| at.elapsed() < self.holdoff)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_duplex_always_grants_and_plays() {
        let arbiter = TalkArbiter::new(DuplexMode::Full, Duration::from_secs(10));
        arbiter.note_peer_frame();
        assert!(arbiter.try_acquire());
        assert!(arbiter.should_play());
    }

    #[test]
    fn test_half_duplex_mutes_while_talking() {
        let arbiter = TalkArbiter::new(DuplexMode::Half, Duration::from_millis(10));
        assert!(arbiter.try_acquire());
        assert!(!arbiter.should_play());
        assert!(!arbiter.try_acquire());

        arbiter.release();
        assert!(arbiter.should_play());
    }

    #[test]
    fn test_half_duplex_refuses_while_peer_talks() {
        let arbiter = TalkArbiter::new(DuplexMode::Half, Duration::from_secs(10));
        arbiter.note_peer_frame();
        assert!(!arbiter.try_acquire());
    }

    #[test]
    fn test_half_duplex_holdoff_expires() {
        let arbiter = TalkArbiter::new(DuplexMode::Half, Duration::from_millis(20));
        arbiter.note_peer_frame();
        std::thread::sleep(Duration::from_millis(40));
        assert!(arbiter.try_acquire());
    }
}
