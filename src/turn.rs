//! Turn-taking state machine
//!
//! Pure and synchronous: every input is a `TurnEvent`, every side effect the
//! controller wants is returned as an `Effect` for the session to carry out.
//! One event causes at most one state transition.
//!
//! Listening -> AwaitingLanguageDetection -> AwaitingReply -> Speaking
//!           -> CooldownBeforeResume -> Listening
//!
//! A transcript is only accepted in `Listening`; everything arriving while a
//! turn is in flight is dropped, never queued. Capture is aborted when
//! playback reports that it started and restarted once the cooldown after
//! playback has elapsed.

use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::config::{RestartConfig, TurnConfig};
use crate::error::Error;
use crate::state::ControllerState;

pub type TurnId = u64;

/// One accepted transcript and what became of it
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationTurn {
    pub id: TurnId,
    pub spoken_text: String,
    pub detected_language: String,
    pub reply: String,
}

#[derive(Debug)]
pub enum TurnEvent {
    /// Finalized transcript from speech capture
    Transcript(String),
    LanguageDetected {
        turn: TurnId,
        result: Result<String, Error>,
    },
    ReplyReady {
        turn: TurnId,
        result: Result<String, Error>,
    },
    PlaybackStarted {
        turn: TurnId,
    },
    PlaybackEnded {
        turn: TurnId,
    },
    CooldownElapsed {
        turn: TurnId,
    },
    /// The capture channel itself failed
    CaptureError(String),
    CaptureRestartDue,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    DetectLanguage {
        turn: TurnId,
        text: String,
    },
    FetchReply {
        turn: TurnId,
        text: String,
    },
    Speak {
        turn: TurnId,
        text: String,
        language: String,
    },
    AbortCapture,
    StartCapture,
    ScheduleCooldown {
        turn: TurnId,
        after: Duration,
    },
    ScheduleCaptureRestart {
        after: Duration,
    },
}

/// Why a transcript did not start a turn
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// A turn was already in flight
    Busy(ControllerState),
    /// Same text as the last reply
    Echo,
    Blank,
}

/// What handling one event produced
#[derive(Debug, Default)]
pub struct Step {
    pub effects: Vec<Effect>,
    pub dropped: Option<DropReason>,
    pub transition: Option<(ControllerState, ControllerState)>,
}

/// Delay schedule for restarting a failed capture channel
#[derive(Debug, Clone, PartialEq)]
pub struct RestartPolicy {
    pub delay: Duration,
    /// Growth per consecutive failure; 1.0 keeps the delay fixed
    pub factor: f64,
    pub max_delay: Duration,
    pub max_attempts: Option<u32>,
}

impl RestartPolicy {
    pub fn fixed(delay: Duration) -> Self {
        Self {
            delay,
            factor: 1.0,
            max_delay: delay,
            max_attempts: None,
        }
    }

    /// Delay before restart number `attempt` (0-based), `None` once exhausted
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if self.max_attempts.is_some_and(|max| attempt >= max) {
            return None;
        }
        let base = self.delay.as_secs_f64();
        let cap = self.max_delay.as_secs_f64().max(base);
        let exponent = attempt.min(64) as i32;
        let scaled = base * self.factor.max(1.0).powi(exponent);
        Some(Duration::from_secs_f64(scaled.min(cap)))
    }
}

impl From<&RestartConfig> for RestartPolicy {
    fn from(config: &RestartConfig) -> Self {
        Self {
            delay: Duration::from_millis(config.delay_ms),
            factor: config.backoff_factor,
            max_delay: Duration::from_millis(config.max_delay_ms),
            max_attempts: config.max_attempts,
        }
    }
}

pub struct TurnMachine {
    state: ControllerState,
    turn: Option<ConversationTurn>,
    last_spoken: Option<String>,
    next_turn: TurnId,
    default_language: String,
    cooldown: Duration,
    restart: RestartPolicy,
    restart_attempts: u32,
    restart_pending: bool,
    /// Capture was aborted for playback and awaits the post-cooldown resume
    capture_suspended: bool,
}

impl TurnMachine {
    pub fn new(config: &TurnConfig) -> Self {
        Self {
            state: ControllerState::Listening,
            turn: None,
            last_spoken: None,
            next_turn: 1,
            default_language: config.default_language.clone(),
            cooldown: config.cooldown(),
            restart: RestartPolicy::from(&config.capture_restart),
            restart_attempts: 0,
            restart_pending: false,
            capture_suspended: false,
        }
    }

    pub fn with_restart_policy(mut self, policy: RestartPolicy) -> Self {
        self.restart = policy;
        self
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    /// The turn in flight, if any
    pub fn turn(&self) -> Option<&ConversationTurn> {
        self.turn.as_ref()
    }

    /// Text most recently handed to playback
    pub fn last_spoken(&self) -> Option<&str> {
        self.last_spoken.as_deref()
    }

    pub fn is_capture_suspended(&self) -> bool {
        self.capture_suspended
    }

    pub fn restart_attempts(&self) -> u32 {
        self.restart_attempts
    }

    pub fn handle(&mut self, event: TurnEvent) -> Step {
        let before = self.state;
        let mut step = Step::default();

        match event {
            TurnEvent::Transcript(text) => self.on_transcript(&text, &mut step),
            TurnEvent::LanguageDetected { turn, result } => {
                self.on_language(turn, result, &mut step)
            }
            TurnEvent::ReplyReady { turn, result } => self.on_reply(turn, result, &mut step),
            TurnEvent::PlaybackStarted { turn } => self.on_playback_started(turn, &mut step),
            TurnEvent::PlaybackEnded { turn } => self.on_playback_ended(turn, &mut step),
            TurnEvent::CooldownElapsed { turn } => self.on_cooldown_elapsed(turn, &mut step),
            TurnEvent::CaptureError(message) => self.on_capture_error(&message, &mut step),
            TurnEvent::CaptureRestartDue => self.on_restart_due(&mut step),
        }

        if self.state != before {
            info!(from = %before, to = %self.state, "controller transition");
            step.transition = Some((before, self.state));
        }
        step
    }

    fn on_transcript(&mut self, text: &str, step: &mut Step) {
        let text = text.trim();
        if text.is_empty() {
            step.dropped = Some(DropReason::Blank);
            return;
        }
        if !self.state.is_listening() {
            debug!(state = %self.state, text, "turn in flight, dropping transcript");
            step.dropped = Some(DropReason::Busy(self.state));
            return;
        }
        if self.is_echo(text) {
            debug!(text, "transcript repeats last reply, dropping");
            step.dropped = Some(DropReason::Echo);
            return;
        }

        // capture is evidently working again
        self.restart_attempts = 0;

        let id = self.next_turn;
        self.next_turn += 1;
        self.turn = Some(ConversationTurn {
            id,
            spoken_text: text.to_string(),
            detected_language: String::new(),
            reply: String::new(),
        });
        self.state = ControllerState::AwaitingLanguageDetection;
        step.effects.push(Effect::DetectLanguage {
            turn: id,
            text: text.to_string(),
        });
    }

    fn is_echo(&self, text: &str) -> bool {
        self.last_spoken
            .as_deref()
            .is_some_and(|last| last.trim().to_lowercase() == text.to_lowercase())
    }

    /// The current turn if it is `turn` and the machine is in `state`
    fn current_for(&mut self, turn: TurnId, state: ControllerState) -> Option<&mut ConversationTurn> {
        if self.state != state {
            debug!(turn, state = %self.state, expected = %state, "ignoring stale event");
            return None;
        }
        match self.turn.as_mut() {
            Some(current) if current.id == turn => Some(current),
            _ => {
                debug!(turn, "ignoring event for another turn");
                None
            }
        }
    }

    fn on_language(&mut self, turn: TurnId, result: Result<String, Error>, step: &mut Step) {
        let fallback = self.default_language.clone();
        let Some(current) = self.current_for(turn, ControllerState::AwaitingLanguageDetection) else {
            return;
        };

        current.detected_language = match result {
            Ok(code) if !code.trim().is_empty() => code.trim().to_string(),
            Ok(_) => fallback,
            Err(e) => {
                warn!(error = %e, fallback = %fallback, "language detection failed");
                fallback
            }
        };
        debug!(turn, language = %current.detected_language, "language detected");

        let text = current.spoken_text.clone();
        self.state = ControllerState::AwaitingReply;
        step.effects.push(Effect::FetchReply { turn, text });
    }

    fn on_reply(&mut self, turn: TurnId, result: Result<String, Error>, step: &mut Step) {
        let Some(current) = self.current_for(turn, ControllerState::AwaitingReply) else {
            return;
        };

        match result {
            Ok(reply) if !reply.trim().is_empty() => {
                let reply = reply.trim().to_string();
                current.reply = reply.clone();
                let language = current.detected_language.clone();
                self.last_spoken = Some(reply.clone());
                self.state = ControllerState::Speaking;
                step.effects.push(Effect::Speak {
                    turn,
                    text: reply,
                    language,
                });
            }
            Ok(_) => {
                warn!(turn, "empty reply, abandoning turn");
                self.abandon();
            }
            Err(e) => {
                error!(turn, error = %e, "dialogue reply failed, abandoning turn");
                self.abandon();
            }
        }
    }

    fn abandon(&mut self) {
        self.turn = None;
        self.state = ControllerState::Listening;
    }

    fn on_playback_started(&mut self, turn: TurnId, step: &mut Step) {
        if self.current_for(turn, ControllerState::Speaking).is_none() {
            return;
        }
        if !self.capture_suspended {
            self.capture_suspended = true;
            step.effects.push(Effect::AbortCapture);
        }
    }

    fn on_playback_ended(&mut self, turn: TurnId, step: &mut Step) {
        if self.current_for(turn, ControllerState::Speaking).is_none() {
            return;
        }
        self.state = ControllerState::CooldownBeforeResume;
        step.effects.push(Effect::ScheduleCooldown {
            turn,
            after: self.cooldown,
        });
    }

    fn on_cooldown_elapsed(&mut self, turn: TurnId, step: &mut Step) {
        if self
            .current_for(turn, ControllerState::CooldownBeforeResume)
            .is_none()
        {
            return;
        }
        self.turn = None;
        self.capture_suspended = false;
        self.state = ControllerState::Listening;
        step.effects.push(Effect::StartCapture);
    }

    fn on_capture_error(&mut self, message: &str, step: &mut Step) {
        if self.capture_suspended {
            debug!(error = message, "capture error while suspended for playback, ignored");
            return;
        }
        if self.restart_pending {
            debug!(error = message, "capture restart already scheduled");
            return;
        }

        match self.restart.delay_for(self.restart_attempts) {
            Some(after) => {
                self.restart_attempts += 1;
                self.restart_pending = true;
                warn!(
                    error = message,
                    attempt = self.restart_attempts,
                    delay_ms = after.as_millis() as u64,
                    "capture error, scheduling restart"
                );
                step.effects.push(Effect::ScheduleCaptureRestart { after });
            }
            None => {
                error!(
                    error = message,
                    attempts = self.restart_attempts,
                    "capture keeps failing, no further restarts"
                );
            }
        }
    }

    fn on_restart_due(&mut self, step: &mut Step) {
        self.restart_pending = false;
        if self.capture_suspended {
            debug!("capture suspended for playback, leaving restart to resume");
            return;
        }
        step.effects.push(Effect::StartCapture);
    }
}
