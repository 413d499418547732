use async_trait::async_trait;
use flume::Sender;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::error::Result;
use crate::turn::{TurnEvent, TurnId};
use crate::ui;

// ============================================================================
// Playback notifications
// ============================================================================

/// Reports the start and end of one reply's playback to the session.
///
/// Each notification is delivered at most once no matter how often it is
/// called; clones share the same flags.
#[derive(Clone, Debug)]
pub struct PlaybackNotifier {
    turn: TurnId,
    tx: Sender<TurnEvent>,
    started: Arc<AtomicBool>,
    ended: Arc<AtomicBool>,
}

impl PlaybackNotifier {
    pub fn new(turn: TurnId, tx: Sender<TurnEvent>) -> Self {
        Self {
            turn,
            tx,
            started: Arc::new(AtomicBool::new(false)),
            ended: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Audio is now audible
    pub fn started(&self) {
        if !self.started.swap(true, Ordering::SeqCst) {
            let _ = self.tx.send(TurnEvent::PlaybackStarted { turn: self.turn });
        }
    }

    /// Audio finished, failed, or was cut off
    pub fn ended(&self) {
        if !self.ended.swap(true, Ordering::SeqCst) {
            let _ = self.tx.send(TurnEvent::PlaybackEnded { turn: self.turn });
        }
    }
}

/// Raised when the future that owns it is dropped.
///
/// Blocking playback threads poll the flag so audio stops when the session
/// gives up on a reply, not when the device drains.
#[derive(Debug, Default)]
pub struct StopOnDrop {
    stop: Arc<AtomicBool>,
}

impl StopOnDrop {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }
}

impl Drop for StopOnDrop {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

/// Speaks a reply aloud.
///
/// Implementations call `notifier.started()` once audio begins and should
/// call `notifier.ended()` when it stops; the session sends `ended` itself
/// if `speak` returns or times out without doing so.
#[async_trait]
pub trait SpeechPlayback: Send + Sync {
    async fn speak(&self, text: &str, language: &str, notifier: &PlaybackNotifier) -> Result<()>;
}

// ============================================================================
// Console playback
// ============================================================================

/// Prints the reply and holds for roughly the time it would take to say it
pub struct ConsolePlayback {
    words_per_minute: u32,
}

impl ConsolePlayback {
    pub fn new(words_per_minute: u32) -> Self {
        Self {
            words_per_minute: words_per_minute.max(1),
        }
    }

    pub fn speaking_time(&self, text: &str) -> Duration {
        let words = text.split_whitespace().count() as u64;
        Duration::from_millis(words * 60_000 / u64::from(self.words_per_minute))
    }
}

#[async_trait]
impl SpeechPlayback for ConsolePlayback {
    async fn speak(&self, text: &str, language: &str, notifier: &PlaybackNotifier) -> Result<()> {
        notifier.started();
        ui::show_reply(text, language);
        tokio::time::sleep(self.speaking_time(text)).await;
        notifier.ended();
        Ok(())
    }
}

// ============================================================================
// Remote synthesis played through the default output device
// ============================================================================

#[cfg(feature = "audio")]
pub use remote::{RemoteSpeech, decode_wav};

#[cfg(feature = "audio")]
mod remote {
    use async_trait::async_trait;
    use rodio::{OutputStreamBuilder, Sink};
    use serde::Serialize;
    use std::io::Cursor;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;
    use tracing::debug;

    use super::{PlaybackNotifier, SpeechPlayback, StopOnDrop};
    use crate::config::SpeechConfig;
    use crate::error::{Error, Result};
    use crate::llm::ApiClient;
    use crate::ui;

    #[derive(Serialize)]
    struct SpeechRequest<'a> {
        #[serde(skip_serializing_if = "Option::is_none")]
        model: Option<&'a str>,
        input: &'a str,
        voice: &'a str,
        response_format: &'a str,
    }

    /// Text-to-speech through the provider's `audio/speech` endpoint
    pub struct RemoteSpeech {
        client: ApiClient,
        speech: SpeechConfig,
    }

    impl RemoteSpeech {
        pub fn new(client: ApiClient, speech: &SpeechConfig) -> Self {
            Self {
                client,
                speech: speech.clone(),
            }
        }

        async fn synthesize(&self, text: &str, language: &str) -> Result<Vec<u8>> {
            let deployment = &self.speech.tts_deployment;
            let voice = self.speech.voice_for(language);
            debug!(language, voice, "synthesizing reply");

            let request = SpeechRequest {
                model: self.client.model_field(deployment),
                input: text,
                voice,
                response_format: "wav",
            };
            let response = self
                .client
                .post(deployment, "audio/speech")
                .json(&request)
                .send()
                .await?;
            let bytes = ApiClient::error_for_status(response).await?.bytes().await?;
            if bytes.is_empty() {
                return Err(Error::EmptyResponse("speech synthesis"));
            }
            Ok(bytes.to_vec())
        }
    }

    #[async_trait]
    impl SpeechPlayback for RemoteSpeech {
        async fn speak(
            &self,
            text: &str,
            language: &str,
            notifier: &PlaybackNotifier,
        ) -> Result<()> {
            let wav = self.synthesize(text, language).await?;
            ui::show_reply(text, language);

            let notifier = notifier.clone();
            let guard = StopOnDrop::new();
            let stop = guard.flag();
            let played = tokio::task::spawn_blocking(move || play_wav(&wav, &notifier, &stop)).await;
            drop(guard);
            played
                .map_err(|e| Error::Playback(e.to_string()))?
        }
    }

    /// Decode a WAV file into interleaved f32 samples, channels, sample rate
    pub fn decode_wav(bytes: &[u8]) -> Result<(Vec<f32>, u16, u32)> {
        let mut reader =
            hound::WavReader::new(Cursor::new(bytes)).map_err(|e| Error::Audio(e.to_string()))?;
        let spec = reader.spec();
        let samples: std::result::Result<Vec<f32>, hound::Error> = match spec.sample_format {
            hound::SampleFormat::Float => reader.samples::<f32>().collect(),
            hound::SampleFormat::Int => {
                let scale = (1_i64 << (spec.bits_per_sample.saturating_sub(1))) as f32;
                reader
                    .samples::<i32>()
                    .map(|s| s.map(|v| v as f32 / scale))
                    .collect()
            }
        };
        let samples = samples.map_err(|e| Error::Audio(e.to_string()))?;
        Ok((samples, spec.channels, spec.sample_rate))
    }

    const STOP_POLL: Duration = Duration::from_millis(20);

    /// Blocks until the sink drains or `stop` is raised
    fn play_wav(wav: &[u8], notifier: &PlaybackNotifier, stop: &Arc<AtomicBool>) -> Result<()> {
        let (samples, channels, sample_rate) = decode_wav(wav)?;

        let mut stream = OutputStreamBuilder::open_default_stream()
            .map_err(|e| Error::Playback(e.to_string()))?;
        stream.log_on_drop(false);
        let sink = Sink::connect_new(stream.mixer());
        sink.append(rodio::buffer::SamplesBuffer::new(
            channels,
            sample_rate,
            samples,
        ));

        notifier.started();
        while !sink.empty() {
            if stop.load(Ordering::SeqCst) {
                debug!("playback cut off");
                sink.stop();
                break;
            }
            std::thread::sleep(STOP_POLL);
        }
        notifier.ended();
        Ok(())
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notifier_delivers_each_event_once() {
        let (tx, rx) = flume::unbounded();
        let notifier = PlaybackNotifier::new(7, tx);
        let clone = notifier.clone();

        notifier.started();
        clone.started();
        notifier.ended();
        clone.ended();

        let events: Vec<_> = rx.drain().collect();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], TurnEvent::PlaybackStarted { turn: 7 }));
        assert!(matches!(events[1], TurnEvent::PlaybackEnded { turn: 7 }));
    }

    #[test]
    fn speaking_time_follows_word_rate() {
        let playback = ConsolePlayback::new(120);
        assert_eq!(
            playback.speaking_time("one two three four"),
            Duration::from_secs(2)
        );
        assert_eq!(playback.speaking_time(""), Duration::ZERO);
    }

    #[test]
    fn stop_flag_rises_on_drop() {
        let guard = StopOnDrop::new();
        let flag = guard.flag();
        assert!(!flag.load(Ordering::SeqCst));
        drop(guard);
        assert!(flag.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_playback_raises_stop() {
        let guard = StopOnDrop::new();
        let flag = guard.flag();
        let speaking = async move {
            let _guard = guard;
            std::future::pending::<()>().await
        };

        let result = tokio::time::timeout(Duration::from_secs(120), speaking).await;
        assert!(result.is_err());
        assert!(flag.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn console_playback_brackets_the_reply() {
        let (tx, rx) = flume::unbounded();
        let notifier = PlaybackNotifier::new(1, tx);
        ConsolePlayback::new(600)
            .speak("hi there", "en", &notifier)
            .await
            .unwrap();

        let events: Vec<_> = rx.drain().collect();
        assert!(matches!(events[..], [
            TurnEvent::PlaybackStarted { turn: 1 },
            TurnEvent::PlaybackEnded { turn: 1 }
        ]));
    }
}
