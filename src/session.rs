//! Session runtime - drives the turn-taking machine
//!
//! Capture events come in on one channel; language detection, reply lookup
//! and playback run as spawned tasks that report back as `TurnEvent`s on an
//! internal channel. Timers (post-playback cooldown, capture restart) are
//! deadlines polled in the same `select!` loop, so only this task ever
//! touches the machine.

use flume::{Receiver, Sender};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::capture::{CaptureEvent, SpeechCapture};
use crate::chat::DialogueResponder;
use crate::config::TurnConfig;
use crate::error::Result;
use crate::language::LanguageDetector;
use crate::state::{ControllerState, RuntimeState, SharedState};
use crate::tts::{PlaybackNotifier, SpeechPlayback};
use crate::turn::{DropReason, Effect, TurnEvent, TurnId, TurnMachine};

/// What the session reports to whoever is watching (UI, tests)
#[derive(Clone, Debug, PartialEq)]
pub enum SessionEvent {
    State(ControllerState),
    /// Transcript accepted as a new turn
    Heard(String),
    /// Reply handed to playback
    Replied { text: String, language: String },
    Dropped(DropReason),
}

pub struct Session {
    capture: Arc<dyn SpeechCapture>,
    detector: Arc<dyn LanguageDetector>,
    responder: Arc<dyn DialogueResponder>,
    playback: Arc<dyn SpeechPlayback>,
    machine: TurnMachine,
    playback_timeout: Duration,
    state: SharedState,
    observer: Option<Sender<SessionEvent>>,
    events_tx: Sender<TurnEvent>,
    events_rx: Receiver<TurnEvent>,
    cooldown: Option<(Instant, TurnId)>,
    restart_at: Option<Instant>,
}

impl Session {
    pub fn new(
        config: &TurnConfig,
        capture: Arc<dyn SpeechCapture>,
        detector: Arc<dyn LanguageDetector>,
        responder: Arc<dyn DialogueResponder>,
        playback: Arc<dyn SpeechPlayback>,
    ) -> Self {
        let (events_tx, events_rx) = flume::unbounded();
        Self {
            capture,
            detector,
            responder,
            playback,
            machine: TurnMachine::new(config),
            playback_timeout: config.playback_timeout(),
            state: RuntimeState::new(),
            observer: None,
            events_tx,
            events_rx,
            cooldown: None,
            restart_at: None,
        }
    }

    pub fn with_state(mut self, state: SharedState) -> Self {
        self.state = state;
        self
    }

    pub fn with_observer(mut self, observer: Sender<SessionEvent>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn state(&self) -> SharedState {
        Arc::clone(&self.state)
    }

    /// Run until the capture source closes and any turn in flight has
    /// finished playing.
    pub async fn run(mut self, inputs: Receiver<CaptureEvent>) -> Result<()> {
        self.state.set_controller(self.machine.state());
        self.notify(SessionEvent::State(self.machine.state()));
        self.perform(Effect::StartCapture);

        let mut closing = false;
        loop {
            if closing && self.machine.state().is_listening() {
                break;
            }

            let cooldown_deadline = self.cooldown.map(|(at, _)| at);
            let restart_deadline = self.restart_at;

            tokio::select! {
                biased;

                Ok(event) = self.events_rx.recv_async() => self.dispatch(event),

                _ = sleep_until(cooldown_deadline) => {
                    if let Some((_, turn)) = self.cooldown.take() {
                        self.dispatch(TurnEvent::CooldownElapsed { turn });
                    }
                }

                _ = sleep_until(restart_deadline) => {
                    self.restart_at = None;
                    self.dispatch(TurnEvent::CaptureRestartDue);
                }

                input = inputs.recv_async(), if !closing => match input {
                    Ok(CaptureEvent::Transcript(text)) => {
                        self.dispatch(TurnEvent::Transcript(text));
                    }
                    Ok(CaptureEvent::Error(message)) => {
                        self.state.set_capture_active(false);
                        self.dispatch(TurnEvent::CaptureError(message));
                    }
                    Ok(CaptureEvent::Closed) | Err(_) => {
                        info!(state = %self.machine.state(), "capture closed");
                        closing = true;
                    }
                },
            }
        }

        self.capture.stop();
        self.state.set_capture_active(false);
        info!(
            turns = self.state.turns_completed(),
            dropped = self.state.transcripts_dropped(),
            "session finished"
        );
        Ok(())
    }

    fn dispatch(&mut self, event: TurnEvent) {
        let step = self.machine.handle(event);

        if let Some(reason) = step.dropped {
            if reason != DropReason::Blank {
                self.state.record_dropped();
            }
            self.notify(SessionEvent::Dropped(reason));
        }

        if let Some((from, to)) = step.transition {
            self.state.set_controller(to);
            match (from, to) {
                (ControllerState::Speaking, _) => self.state.set_playback_active(false),
                (ControllerState::CooldownBeforeResume, ControllerState::Listening) => {
                    self.state.record_completed()
                }
                _ => {}
            }
            self.notify(SessionEvent::State(to));
        }

        for effect in step.effects {
            self.perform(effect);
        }
    }

    fn perform(&mut self, effect: Effect) {
        match effect {
            Effect::DetectLanguage { turn, text } => {
                self.notify(SessionEvent::Heard(text.clone()));
                let detector = Arc::clone(&self.detector);
                let tx = self.events_tx.clone();
                tokio::spawn(async move {
                    let result = detector.detect_language(&text).await;
                    let _ = tx.send(TurnEvent::LanguageDetected { turn, result });
                });
            }
            Effect::FetchReply { turn, text } => {
                let responder = Arc::clone(&self.responder);
                let tx = self.events_tx.clone();
                tokio::spawn(async move {
                    let result = responder.reply(&text).await;
                    let _ = tx.send(TurnEvent::ReplyReady { turn, result });
                });
            }
            Effect::Speak {
                turn,
                text,
                language,
            } => {
                self.notify(SessionEvent::Replied {
                    text: text.clone(),
                    language: language.clone(),
                });
                self.state.set_playback_active(true);
                let playback = Arc::clone(&self.playback);
                let notifier = PlaybackNotifier::new(turn, self.events_tx.clone());
                let timeout = self.playback_timeout;
                tokio::spawn(async move {
                    let speaking = playback.speak(&text, &language, &notifier);
                    match tokio::time::timeout(timeout, speaking).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => warn!(turn, error = %e, "playback failed"),
                        Err(_) => warn!(turn, timeout_secs = timeout.as_secs(), "playback timed out"),
                    }
                    notifier.ended();
                });
            }
            Effect::AbortCapture => {
                self.capture.abort();
                self.state.set_capture_active(false);
            }
            Effect::StartCapture => match self.capture.start() {
                Ok(()) => self.state.set_capture_active(true),
                Err(e) => {
                    self.state.set_capture_active(false);
                    self.dispatch(TurnEvent::CaptureError(e.to_string()));
                }
            },
            Effect::ScheduleCooldown { turn, after } => {
                debug!(turn, cooldown_ms = after.as_millis() as u64, "cooldown started");
                self.cooldown = Some((Instant::now() + after, turn));
            }
            Effect::ScheduleCaptureRestart { after } => {
                self.restart_at = Some(Instant::now() + after);
            }
        }
    }

    fn notify(&self, event: SessionEvent) {
        if let Some(observer) = &self.observer {
            let _ = observer.send(event);
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
