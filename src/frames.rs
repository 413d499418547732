//! Keypoint frames from an external hand tracker, one JSON array per line

use flume::Sender;
use std::io::BufRead;
use std::thread::{self, JoinHandle};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::gesture::HandObservation;

/// Parse one line: `[[{"x":..,"y":..,"name":".."}, ...], ...]`
pub fn parse_frame(line: &str) -> Result<Vec<HandObservation>> {
    serde_json::from_str(line).map_err(|e| Error::Keypoints(e.to_string()))
}

/// Read frames on a dedicated thread until EOF or the receiver goes away.
/// Blank lines are skipped; unparseable lines are logged and skipped.
pub fn spawn_reader<R>(reader: R, tx: Sender<Vec<HandObservation>>) -> JoinHandle<()>
where
    R: BufRead + Send + 'static,
{
    thread::spawn(move || {
        for (index, line) in reader.lines().enumerate() {
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    warn!(error = %e, "keypoint source read failed");
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            match parse_frame(&line) {
                Ok(hands) => {
                    if tx.send(hands).is_err() {
                        break;
                    }
                }
                Err(e) => warn!(line = index + 1, error = %e, "skipping keypoint frame"),
            }
        }
        debug!("keypoint source finished");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn parses_hands_and_missing_names() {
        let hands =
            parse_frame(r#"[[{"x":1,"y":2,"name":"thumb_tip"},{"x":3,"y":4}],[]]"#).unwrap();
        assert_eq!(hands.len(), 2);
        assert_eq!(hands[0].keypoints.len(), 2);
        assert_eq!(hands[0].keypoints[0].name.as_deref(), Some("thumb_tip"));
        assert!(hands[0].keypoints[1].name.is_none());
        assert!(hands[1].keypoints.is_empty());
    }

    #[test]
    fn rejects_non_frames() {
        assert!(matches!(parse_frame("{\"x\":1}"), Err(Error::Keypoints(_))));
    }

    #[test]
    fn reader_skips_bad_lines() {
        let input = "[]\n\nnot json\n[[{\"x\":0,\"y\":0,\"name\":\"wrist\"}]]\n";
        let (tx, rx) = flume::unbounded();
        spawn_reader(Cursor::new(input.to_string()), tx).join().unwrap();

        let frames: Vec<_> = rx.drain().collect();
        assert_eq!(frames.len(), 2);
        assert!(frames[0].is_empty());
        assert_eq!(frames[1].len(), 1);
    }
}
