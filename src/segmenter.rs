//! Utterance segmentation over 16 kHz mono frames
//!
//! A few consecutive speech frames open an utterance (the frames just before
//! onset are kept so the first syllable is not clipped); a run of silence or
//! the length cap closes it.

use std::collections::VecDeque;

use crate::config::SpeechConfig;
use crate::vad::EnergyVad;

pub const TARGET_RATE: usize = 16000;
/// 30ms at 16kHz
pub const FRAME_SAMPLES: usize = 480;

const MIN_SPEECH_SAMPLES: usize = TARGET_RATE / 2;
const PREFILL_FRAMES: usize = 10;
const ONSET_FRAMES: usize = 3;

#[derive(Debug, Clone, Copy)]
pub struct SegmenterConfig {
    pub silence_ms: u32,
    pub max_segment_secs: u32,
}

impl Default for SegmenterConfig {
    fn default() -> Self {
        Self {
            silence_ms: 700,
            max_segment_secs: 15,
        }
    }
}

impl From<&SpeechConfig> for SegmenterConfig {
    fn from(config: &SpeechConfig) -> Self {
        Self {
            silence_ms: config.silence_ms,
            max_segment_secs: config.max_segment_secs,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum VadState {
    Idle,
    Onset(usize),
    /// Trailing silent frames so far
    Speaking(usize),
}

pub struct Segmenter {
    vad: EnergyVad,
    state: VadState,
    speech_buf: Vec<f32>,
    prefill: VecDeque<Vec<f32>>,
    silence_frames_to_end: usize,
    max_samples: usize,
}

impl Segmenter {
    pub fn new(vad: EnergyVad, config: SegmenterConfig) -> Self {
        let silence_frames_to_end =
            (config.silence_ms as usize * TARGET_RATE / (1000 * FRAME_SAMPLES)).max(1);
        let max_samples = (config.max_segment_secs as usize * TARGET_RATE).max(FRAME_SAMPLES);
        Self {
            vad,
            state: VadState::Idle,
            speech_buf: Vec::with_capacity(max_samples),
            prefill: VecDeque::with_capacity(PREFILL_FRAMES + 1),
            silence_frames_to_end,
            max_samples,
        }
    }

    pub fn is_speaking(&self) -> bool {
        matches!(self.state, VadState::Speaking(_))
    }

    /// Feed one frame; returns a finished utterance when one closes
    pub fn push(&mut self, frame: &[f32]) -> Option<Vec<f32>> {
        let is_speech = self.vad.is_speech(frame, self.is_speaking());

        self.state = match self.state {
            VadState::Idle => {
                self.remember(frame);
                if is_speech {
                    VadState::Onset(1)
                } else {
                    VadState::Idle
                }
            }
            VadState::Onset(count) => {
                self.remember(frame);
                if !is_speech {
                    VadState::Idle
                } else if count + 1 >= ONSET_FRAMES {
                    for buffered in self.prefill.drain(..) {
                        self.speech_buf.extend_from_slice(&buffered);
                    }
                    VadState::Speaking(0)
                } else {
                    VadState::Onset(count + 1)
                }
            }
            VadState::Speaking(silence) => {
                self.speech_buf.extend_from_slice(frame);
                VadState::Speaking(if is_speech { 0 } else { silence + 1 })
            }
        };

        match self.state {
            VadState::Speaking(silence)
                if silence >= self.silence_frames_to_end
                    || self.speech_buf.len() >= self.max_samples =>
            {
                self.finish()
            }
            _ => None,
        }
    }

    /// Close the utterance in progress, if any
    pub fn flush(&mut self) -> Option<Vec<f32>> {
        if self.is_speaking() {
            self.finish()
        } else {
            self.reset();
            None
        }
    }

    /// Drop everything buffered
    pub fn reset(&mut self) {
        self.state = VadState::Idle;
        self.speech_buf.clear();
        self.prefill.clear();
    }

    fn remember(&mut self, frame: &[f32]) {
        self.prefill.push_back(frame.to_vec());
        if self.prefill.len() > PREFILL_FRAMES {
            self.prefill.pop_front();
        }
    }

    fn finish(&mut self) -> Option<Vec<f32>> {
        let samples = std::mem::take(&mut self.speech_buf);
        self.reset();
        (samples.len() >= MIN_SPEECH_SAMPLES).then_some(samples)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOUD: [f32; FRAME_SAMPLES] = [0.1; FRAME_SAMPLES];
    const QUIET: [f32; FRAME_SAMPLES] = [0.0; FRAME_SAMPLES];

    fn segmenter(max_segment_secs: u32) -> Segmenter {
        Segmenter::new(
            EnergyVad::new(0.01),
            SegmenterConfig {
                silence_ms: 690, // 23 frames
                max_segment_secs,
            },
        )
    }

    fn feed(seg: &mut Segmenter, frame: &[f32], count: usize) -> Vec<Vec<f32>> {
        (0..count).filter_map(|_| seg.push(frame)).collect()
    }

    #[test]
    fn silence_never_emits() {
        let mut seg = segmenter(15);
        assert!(feed(&mut seg, &QUIET, 200).is_empty());
        assert!(seg.flush().is_none());
    }

    #[test]
    fn utterance_closes_after_silence_with_prefill() {
        let mut seg = segmenter(15);
        assert!(feed(&mut seg, &QUIET, 5).is_empty());
        assert!(feed(&mut seg, &LOUD, 10).is_empty());
        assert!(seg.is_speaking());

        let out = feed(&mut seg, &QUIET, 23);
        assert_eq!(out.len(), 1);
        // 5 prefill + 10 speech + 23 silence
        assert_eq!(out[0].len(), 38 * FRAME_SAMPLES);
        assert!(!seg.is_speaking());
    }

    #[test]
    fn brief_blip_does_not_open_an_utterance() {
        let mut seg = segmenter(15);
        feed(&mut seg, &LOUD, 2);
        feed(&mut seg, &QUIET, 1);
        assert!(!seg.is_speaking());
        assert!(seg.flush().is_none());
    }

    #[test]
    fn long_speech_is_cut_at_cap() {
        let mut seg = segmenter(1);
        let out = feed(&mut seg, &LOUD, 40);
        assert_eq!(out.len(), 1);
        assert!(out[0].len() >= TARGET_RATE);
        assert!(out[0].len() < TARGET_RATE + FRAME_SAMPLES);
    }

    #[test]
    fn flush_finalizes_and_reset_discards() {
        let mut seg = segmenter(15);
        feed(&mut seg, &LOUD, 20);
        let flushed = seg.flush().unwrap();
        assert_eq!(flushed.len(), 20 * FRAME_SAMPLES);

        feed(&mut seg, &LOUD, 20);
        seg.reset();
        assert!(!seg.is_speaking());
        assert!(seg.flush().is_none());
    }
}
