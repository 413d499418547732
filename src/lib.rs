//! handtalk - hands-free spoken dialogue with a fist-grab trigger
//!
//! Two independent pieces share this crate: a gesture detector that reads
//! hand keypoints and flags a closed fist, and a turn-taking controller that
//! runs one spoken exchange at a time (listen, detect language, fetch a
//! reply, speak it, cool down, listen again) while keeping the assistant
//! from hearing itself.

#[cfg(feature = "audio")]
pub mod audio;
pub mod capture;
pub mod chat;
pub mod config;
pub mod error;
pub mod frames;
pub mod gesture;
pub mod language;
pub mod llm;
pub mod segmenter;
pub mod session;
pub mod state;
#[cfg(feature = "audio")]
pub mod transcriber;
pub mod tts;
pub mod turn;
pub mod ui;
pub mod vad;

pub use error::{Error, Result};
