/// Hangover threshold as a share of the onset threshold
const END_RATIO: f32 = 0.6;

/// Energy voice activity detector with hysteresis: once speech has started
/// a quieter frame still counts as speech.
#[derive(Debug, Clone, Copy)]
pub struct EnergyVad {
    threshold: f32,
    threshold_end: f32,
}

impl EnergyVad {
    pub fn new(threshold: f32) -> Self {
        Self {
            threshold,
            threshold_end: threshold * END_RATIO,
        }
    }

    pub fn is_speech(&self, frame: &[f32], currently_speaking: bool) -> bool {
        let threshold = if currently_speaking {
            self.threshold_end
        } else {
            self.threshold
        };
        rms(frame) > threshold
    }
}

pub fn rms(frame: &[f32]) -> f32 {
    if frame.is_empty() {
        return 0.0;
    }
    (frame.iter().map(|&s| s * s).sum::<f32>() / frame.len() as f32).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rms_of_constant_signal() {
        assert!((rms(&[0.5; 16]) - 0.5).abs() < 1e-6);
        assert_eq!(rms(&[]), 0.0);
    }

    #[test]
    fn hysteresis_keeps_quiet_tail() {
        let vad = EnergyVad::new(0.01);
        let quiet = [0.008; 480];
        assert!(!vad.is_speech(&quiet, false));
        assert!(vad.is_speech(&quiet, true));
    }
}
