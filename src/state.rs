//! Shared runtime state - lock-free view of the controller and gesture flags
//!
//! The turn-taking session and the gesture loop each own their state and
//! publish it here; the console UI and anything else on the host only read.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};

/// Turn-taking controller modes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ControllerState {
    /// Capture active, waiting for a finalized transcript
    Listening = 0,
    /// Transcript accepted, language lookup in flight
    AwaitingLanguageDetection = 1,
    /// Language known, reply lookup in flight
    AwaitingReply = 2,
    /// Reply handed to playback
    Speaking = 3,
    /// Playback finished, waiting before capture resumes
    CooldownBeforeResume = 4,
}

impl ControllerState {
    pub fn is_listening(self) -> bool {
        self == ControllerState::Listening
    }
}

impl From<u8> for ControllerState {
    fn from(v: u8) -> Self {
        match v {
            1 => ControllerState::AwaitingLanguageDetection,
            2 => ControllerState::AwaitingReply,
            3 => ControllerState::Speaking,
            4 => ControllerState::CooldownBeforeResume,
            _ => ControllerState::Listening,
        }
    }
}

impl fmt::Display for ControllerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControllerState::Listening => write!(f, "Listening"),
            ControllerState::AwaitingLanguageDetection => write!(f, "DetectingLanguage"),
            ControllerState::AwaitingReply => write!(f, "AwaitingReply"),
            ControllerState::Speaking => write!(f, "Speaking"),
            ControllerState::CooldownBeforeResume => write!(f, "Cooldown"),
        }
    }
}

/// Shared runtime state - accessible from all components
///
/// All fields use atomic operations for thread-safe access without locks.
/// Pass `Arc<RuntimeState>` to components that need to read it.
#[derive(Default)]
pub struct RuntimeState {
    /// Current controller mode (stored as u8)
    controller: AtomicU8,
    /// Latest per-frame fist classification
    pub fist_closed: AtomicBool,
    /// Speech capture is listening
    pub capture_active: AtomicBool,
    /// Synthesized audio is playing
    pub playback_active: AtomicBool,
    /// Turns that reached the end of playback
    pub turns_completed: AtomicU64,
    /// Transcripts discarded by the in-flight or echo guard
    pub transcripts_dropped: AtomicU64,
}

impl RuntimeState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn controller(&self) -> ControllerState {
        ControllerState::from(self.controller.load(Ordering::SeqCst))
    }

    pub fn set_controller(&self, state: ControllerState) {
        self.controller.store(state as u8, Ordering::SeqCst);
    }

    pub fn is_fist_closed(&self) -> bool {
        self.fist_closed.load(Ordering::SeqCst)
    }

    pub fn set_fist_closed(&self, closed: bool) {
        self.fist_closed.store(closed, Ordering::SeqCst);
    }

    pub fn set_capture_active(&self, active: bool) {
        self.capture_active.store(active, Ordering::SeqCst);
    }

    pub fn set_playback_active(&self, active: bool) {
        self.playback_active.store(active, Ordering::SeqCst);
    }

    pub fn record_dropped(&self) {
        self.transcripts_dropped.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_completed(&self) {
        self.turns_completed.fetch_add(1, Ordering::SeqCst);
    }

    pub fn is_capture_active(&self) -> bool {
        self.capture_active.load(Ordering::SeqCst)
    }

    pub fn is_playback_active(&self) -> bool {
        self.playback_active.load(Ordering::SeqCst)
    }

    pub fn turns_completed(&self) -> u64 {
        self.turns_completed.load(Ordering::SeqCst)
    }

    pub fn transcripts_dropped(&self) -> u64 {
        self.transcripts_dropped.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for RuntimeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeState")
            .field("controller", &self.controller())
            .field("fist_closed", &self.fist_closed.load(Ordering::SeqCst))
            .field("capture_active", &self.is_capture_active())
            .field("playback_active", &self.is_playback_active())
            .field("turns_completed", &self.turns_completed())
            .field("transcripts_dropped", &self.transcripts_dropped())
            .finish()
    }
}

/// Type alias for shared state
pub type SharedState = Arc<RuntimeState>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn controller_state_round_trips_through_u8() {
        for state in [
            ControllerState::Listening,
            ControllerState::AwaitingLanguageDetection,
            ControllerState::AwaitingReply,
            ControllerState::Speaking,
            ControllerState::CooldownBeforeResume,
        ] {
            assert_eq!(ControllerState::from(state as u8), state);
        }
        assert_eq!(ControllerState::from(200), ControllerState::Listening);
    }

    #[test]
    fn runtime_state_starts_listening() {
        let state = RuntimeState::new();
        assert_eq!(state.controller(), ControllerState::Listening);
        state.set_controller(ControllerState::Speaking);
        assert_eq!(state.controller(), ControllerState::Speaking);
        assert!(!state.is_fist_closed());
    }
}
