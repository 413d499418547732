//! Speech capture channel
//!
//! A capture source turns the user's speech into finalized transcripts and
//! reports them, along with its own failures, as `CaptureEvent`s on a flume
//! channel. The turn-taking session starts and aborts it around playback.

use flume::Sender;
use std::io::BufRead;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use tracing::{debug, warn};

use crate::error::Result;

#[derive(Debug, Clone, PartialEq)]
pub enum CaptureEvent {
    /// Finalized utterance
    Transcript(String),
    /// The channel failed; it is inactive until started again
    Error(String),
    /// The source is gone for good
    Closed,
}

/// Control surface of a speech capture source
pub trait SpeechCapture: Send + Sync {
    /// Begin or resume listening. Starting an active source is a no-op.
    fn start(&self) -> Result<()>;

    /// Stop immediately; partial speech is discarded and nothing in flight
    /// is delivered afterwards.
    fn abort(&self);

    /// Stop after finalizing whatever speech is buffered
    fn stop(&self);

    fn is_active(&self) -> bool;
}

type LineSource = Box<dyn BufRead + Send>;

/// Typed lines stand in for speech: each non-blank line is one transcript.
///
/// Lines typed while capture is inactive are discarded, the same way a
/// microphone hears nothing while it is off.
pub struct ConsoleCapture {
    active: Arc<AtomicBool>,
    tx: Sender<CaptureEvent>,
    source: Mutex<Option<LineSource>>,
}

impl ConsoleCapture {
    pub fn new(tx: Sender<CaptureEvent>) -> Self {
        Self::with_reader(std::io::BufReader::new(std::io::stdin()), tx)
    }

    pub fn with_reader<R>(reader: R, tx: Sender<CaptureEvent>) -> Self
    where
        R: BufRead + Send + 'static,
    {
        Self {
            active: Arc::new(AtomicBool::new(false)),
            tx,
            source: Mutex::new(Some(Box::new(reader))),
        }
    }

    /// Reader thread is spawned on the first start
    fn spawn_reader(&self) {
        let Some(reader) = self
            .source
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return;
        };

        let active = Arc::clone(&self.active);
        let tx = self.tx.clone();
        thread::spawn(move || {
            for line in reader.lines() {
                let line = match line {
                    Ok(line) => line,
                    Err(e) => {
                        warn!(error = %e, "console read failed");
                        break;
                    }
                };
                let text = line.trim();
                if text.is_empty() {
                    continue;
                }
                if !active.load(Ordering::SeqCst) {
                    debug!(text, "capture inactive, dropping input");
                    continue;
                }
                if tx.send(CaptureEvent::Transcript(text.to_string())).is_err() {
                    return;
                }
            }
            let _ = tx.send(CaptureEvent::Closed);
        });
    }
}

impl SpeechCapture for ConsoleCapture {
    fn start(&self) -> Result<()> {
        if !self.active.swap(true, Ordering::SeqCst) {
            debug!("console capture started");
        }
        self.spawn_reader();
        Ok(())
    }

    fn abort(&self) {
        if self.active.swap(false, Ordering::SeqCst) {
            debug!("console capture aborted");
        }
    }

    fn stop(&self) {
        // typed lines are already final
        self.abort();
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::time::Duration;

    #[test]
    fn lines_become_transcripts_then_closed() {
        let (tx, rx) = flume::unbounded();
        let capture = ConsoleCapture::with_reader(Cursor::new("hello\n\n  world \n"), tx);
        capture.start().unwrap();
        assert!(capture.is_active());

        let timeout = Duration::from_secs(5);
        assert_eq!(
            rx.recv_timeout(timeout).unwrap(),
            CaptureEvent::Transcript("hello".into())
        );
        assert_eq!(
            rx.recv_timeout(timeout).unwrap(),
            CaptureEvent::Transcript("world".into())
        );
        assert_eq!(rx.recv_timeout(timeout).unwrap(), CaptureEvent::Closed);
    }

    #[test]
    fn nothing_is_read_before_start() {
        let (tx, rx) = flume::unbounded();
        let capture = ConsoleCapture::with_reader(Cursor::new("hello\n"), tx);
        assert!(!capture.is_active());
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
    }

    #[test]
    fn abort_and_restart_toggle_activity() {
        let (tx, _rx) = flume::unbounded();
        let capture = ConsoleCapture::with_reader(Cursor::new(""), tx);
        capture.start().unwrap();
        capture.abort();
        assert!(!capture.is_active());
        capture.start().unwrap();
        capture.start().unwrap();
        assert!(capture.is_active());
        capture.stop();
        assert!(!capture.is_active());
    }
}
