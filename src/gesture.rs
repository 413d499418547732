//! Fist detection from 2-D hand keypoints.
//!
//! Keypoints arrive in image coordinates (Y grows downward). A hand counts
//! as a closed fist when all five fingertips sit below the knuckle line.
//! Classification is per frame; `GestureDetector` adds the closed flag,
//! optional N-frame smoothing and grab-event dispatch on top.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::{GestureConfig, GrabMode};

// ── Input types ────────────────────────────────────────────

/// A named 2-D landmark on a tracked hand.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Keypoint {
    pub x: f32,
    pub y: f32,
    /// Anatomical role, e.g. `index_finger_tip` or `thumb_mcp`.
    #[serde(default)]
    pub name: Option<String>,
}

impl Keypoint {
    pub fn new(x: f32, y: f32, name: &str) -> Self {
        Self {
            x,
            y,
            name: Some(name.to_string()),
        }
    }
}

/// All keypoints of one hand in one frame.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HandObservation {
    pub keypoints: Vec<Keypoint>,
}

impl HandObservation {
    pub fn new(keypoints: Vec<Keypoint>) -> Self {
        Self { keypoints }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

// ── Classification ─────────────────────────────────────────

/// Name suffixes that mark fingertips and knuckles.
#[derive(Debug, Clone)]
pub struct KeypointNaming {
    pub tip_suffix: String,
    pub knuckle_suffix: String,
}

impl Default for KeypointNaming {
    fn default() -> Self {
        Self {
            tip_suffix: "_tip".into(),
            knuckle_suffix: "_mcp".into(),
        }
    }
}

/// Result of classifying one hand.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FistReading {
    pub closed: bool,
    /// Mean fingertip position, only present when closed.
    pub centroid: Option<Point>,
}

impl FistReading {
    pub const OPEN: FistReading = FistReading {
        closed: false,
        centroid: None,
    };
}

/// Running sums for one keypoint group.
#[derive(Default)]
struct Accumulator {
    count: usize,
    sum_x: f32,
    sum_y: f32,
}

impl Accumulator {
    fn push(&mut self, kp: &Keypoint) {
        self.count += 1;
        self.sum_x += kp.x;
        self.sum_y += kp.y;
    }

    fn mean(&self) -> Point {
        let n = self.count as f32;
        Point {
            x: self.sum_x / n,
            y: self.sum_y / n,
        }
    }
}

const DIGITS: usize = 5;

/// Classify a single hand as closed fist or not.
///
/// Any frame without exactly five tips and five knuckles, or with an
/// unnamed or non-finite keypoint, reads as open.
#[hotpath::measure]
pub fn classify(hand: &HandObservation, naming: &KeypointNaming) -> FistReading {
    let mut tips = Accumulator::default();
    let mut knuckles = Accumulator::default();

    for kp in &hand.keypoints {
        let Some(name) = kp.name.as_deref() else {
            debug!("keypoint without name, treating hand as open");
            return FistReading::OPEN;
        };
        if !kp.x.is_finite() || !kp.y.is_finite() {
            debug!(name, "non-finite keypoint, treating hand as open");
            return FistReading::OPEN;
        }
        if name.ends_with(&naming.tip_suffix) {
            tips.push(kp);
        } else if name.ends_with(&naming.knuckle_suffix) {
            knuckles.push(kp);
        }
    }

    if tips.count != DIGITS || knuckles.count != DIGITS {
        return FistReading::OPEN;
    }

    let tip = tips.mean();
    let knuckle = knuckles.mean();

    if tip.y > knuckle.y {
        FistReading {
            closed: true,
            centroid: Some(tip),
        }
    } else {
        FistReading::OPEN
    }
}

// ── Stateful detector ──────────────────────────────────────

/// Emitted when a frame should fire the grab callback.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GrabEvent {
    pub centroid: Point,
    /// Consecutive closed frames including this one.
    pub streak: u32,
}

/// Tracks the closed flag across frames and decides when a grab fires.
#[derive(Debug, Clone)]
pub struct GestureDetector {
    naming: KeypointNaming,
    mode: GrabMode,
    min_closed_frames: u32,
    closed: bool,
    streak: u32,
}

impl GestureDetector {
    pub fn new(config: &GestureConfig) -> Self {
        Self {
            naming: KeypointNaming {
                tip_suffix: config.tip_suffix.clone(),
                knuckle_suffix: config.knuckle_suffix.clone(),
            },
            mode: config.grab_mode,
            min_closed_frames: config.min_closed_frames.max(1),
            closed: false,
            streak: 0,
        }
    }

    /// Current debounced closed flag.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Feed one frame of hands; only the first hand is considered.
    pub fn on_results(&mut self, hands: &[HandObservation]) -> Option<GrabEvent> {
        let Some(hand) = hands.first() else {
            self.closed = false;
            self.streak = 0;
            return None;
        };

        let reading = classify(hand, &self.naming);
        let was_closed = self.closed;

        match reading.centroid {
            Some(centroid) if reading.closed => {
                self.streak = self.streak.saturating_add(1);
                self.closed = self.streak >= self.min_closed_frames;
                if !self.closed {
                    return None;
                }
                let fire = match self.mode {
                    GrabMode::RisingEdge => !was_closed,
                    GrabMode::EveryFrame => true,
                };
                fire.then_some(GrabEvent {
                    centroid,
                    streak: self.streak,
                })
            }
            _ => {
                self.closed = false;
                self.streak = 0;
                None
            }
        }
    }

    /// Feed one frame and invoke `on_grab` with the frame's hands if it fires.
    pub fn process<F>(&mut self, hands: &[HandObservation], mut on_grab: F) -> bool
    where
        F: FnMut(&GrabEvent, &[HandObservation]),
    {
        match self.on_results(hands) {
            Some(event) => {
                on_grab(&event, hands);
                true
            }
            None => false,
        }
    }
}

// ── Tests ──────────────────────────────────────────────────

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    const FINGERS: [&str; 5] = ["thumb", "index_finger", "middle_finger", "ring_finger", "pinky"];

    /// Five tips at `tip_y` and five knuckles at `knuckle_y`, x spread 10..50.
    pub(crate) fn hand(tip_y: f32, knuckle_y: f32) -> HandObservation {
        let mut keypoints = vec![Keypoint::new(30.0, 400.0, "wrist")];
        for (i, finger) in FINGERS.iter().enumerate() {
            let x = 10.0 + 10.0 * i as f32;
            keypoints.push(Keypoint::new(x, knuckle_y, &format!("{finger}_mcp")));
            keypoints.push(Keypoint::new(x, (tip_y + knuckle_y) / 2.0, &format!("{finger}_pip")));
            keypoints.push(Keypoint::new(x, tip_y, &format!("{finger}_tip")));
        }
        HandObservation::new(keypoints)
    }

    fn detector(mode: GrabMode, min_closed_frames: u32) -> GestureDetector {
        GestureDetector::new(&GestureConfig {
            grab_mode: mode,
            min_closed_frames,
            ..GestureConfig::default()
        })
    }

    #[test]
    fn tips_below_knuckles_is_closed() {
        let reading = classify(&hand(300.0, 200.0), &KeypointNaming::default());
        assert!(reading.closed);
        let centroid = reading.centroid.unwrap();
        assert_eq!(centroid.y, 300.0);
        assert_eq!(centroid.x, 30.0);
    }

    #[test]
    fn tips_above_knuckles_is_open() {
        let reading = classify(&hand(100.0, 200.0), &KeypointNaming::default());
        assert_eq!(reading, FistReading::OPEN);
    }

    #[test]
    fn level_tips_are_open() {
        assert!(!classify(&hand(200.0, 200.0), &KeypointNaming::default()).closed);
    }

    #[test]
    fn centroid_uses_uneven_tip_positions() {
        let mut h = hand(300.0, 200.0);
        for kp in &mut h.keypoints {
            if kp.name.as_deref() == Some("pinky_tip") {
                kp.x = 100.0;
                kp.y = 350.0;
            }
        }
        let centroid = classify(&h, &KeypointNaming::default()).centroid.unwrap();
        assert_eq!(centroid.x, (10.0 + 20.0 + 30.0 + 40.0 + 100.0) / 5.0);
        assert_eq!(centroid.y, (300.0 * 4.0 + 350.0) / 5.0);
    }

    #[test]
    fn missing_digit_is_open() {
        let mut h = hand(300.0, 200.0);
        h.keypoints.retain(|kp| kp.name.as_deref() != Some("ring_finger_tip"));
        assert_eq!(classify(&h, &KeypointNaming::default()), FistReading::OPEN);

        let mut h = hand(300.0, 200.0);
        h.keypoints.retain(|kp| kp.name.as_deref() != Some("thumb_mcp"));
        assert_eq!(classify(&h, &KeypointNaming::default()), FistReading::OPEN);
    }

    #[test]
    fn extra_tip_is_open() {
        let mut h = hand(300.0, 200.0);
        h.keypoints.push(Keypoint::new(0.0, 999.0, "sixth_tip"));
        assert_eq!(classify(&h, &KeypointNaming::default()), FistReading::OPEN);
    }

    #[test]
    fn unnamed_or_nan_keypoint_is_open() {
        let mut h = hand(300.0, 200.0);
        h.keypoints[3].name = None;
        assert_eq!(classify(&h, &KeypointNaming::default()), FistReading::OPEN);

        let mut h = hand(300.0, 200.0);
        h.keypoints[2].y = f32::NAN;
        assert_eq!(classify(&h, &KeypointNaming::default()), FistReading::OPEN);
    }

    #[test]
    fn empty_hand_is_open() {
        assert_eq!(
            classify(&HandObservation::default(), &KeypointNaming::default()),
            FistReading::OPEN
        );
    }

    #[test]
    fn custom_suffixes() {
        let naming = KeypointNaming {
            tip_suffix: "TIP".into(),
            knuckle_suffix: "MCP".into(),
        };
        let mut h = hand(300.0, 200.0);
        for kp in &mut h.keypoints {
            if let Some(name) = kp.name.as_mut() {
                *name = name.to_uppercase().replace('_', "");
            }
        }
        assert!(classify(&h, &naming).closed);
    }

    #[test]
    fn rising_edge_fires_once_per_close() {
        let mut d = detector(GrabMode::RisingEdge, 1);
        let open = [hand(100.0, 200.0)];
        let closed = [hand(300.0, 200.0)];

        assert!(d.on_results(&open).is_none());
        assert!(d.on_results(&closed).is_some());
        assert!(d.is_closed());
        assert!(d.on_results(&closed).is_none());
        assert!(d.on_results(&closed).is_none());
        assert!(d.on_results(&open).is_none());
        assert!(!d.is_closed());
        assert!(d.on_results(&closed).is_some());
    }

    #[test]
    fn every_frame_fires_while_closed() {
        let mut d = detector(GrabMode::EveryFrame, 1);
        let closed = [hand(300.0, 200.0)];

        let streaks: Vec<u32> = (0..3)
            .filter_map(|_| d.on_results(&closed))
            .map(|e| e.streak)
            .collect();
        assert_eq!(streaks, vec![1, 2, 3]);
    }

    #[test]
    fn min_closed_frames_debounces_jitter() {
        let mut d = detector(GrabMode::RisingEdge, 3);
        let open = [hand(100.0, 200.0)];
        let closed = [hand(300.0, 200.0)];

        assert!(d.on_results(&closed).is_none());
        assert!(d.on_results(&closed).is_none());
        assert!(d.on_results(&open).is_none());
        assert!(d.on_results(&closed).is_none());
        assert!(d.on_results(&closed).is_none());
        assert!(!d.is_closed());
        let event = d.on_results(&closed).unwrap();
        assert_eq!(event.streak, 3);
        assert!(d.is_closed());
    }

    #[test]
    fn empty_frame_clears_flag_without_event() {
        let mut d = detector(GrabMode::RisingEdge, 1);
        assert!(d.on_results(&[hand(300.0, 200.0)]).is_some());
        assert!(d.on_results(&[]).is_none());
        assert!(!d.is_closed());
        assert!(d.on_results(&[hand(300.0, 200.0)]).is_some());
    }

    #[test]
    fn only_first_hand_counts() {
        let mut d = detector(GrabMode::EveryFrame, 1);
        let frame = [hand(100.0, 200.0), hand(300.0, 200.0)];
        assert!(d.on_results(&frame).is_none());
    }

    #[test]
    fn process_passes_hands_to_callback() {
        let mut d = detector(GrabMode::RisingEdge, 1);
        let frame = [hand(300.0, 200.0)];
        let mut seen = 0;
        let fired = d.process(&frame, |event, hands| {
            assert_eq!(event.centroid.y, 300.0);
            seen = hands.len();
        });
        assert!(fired);
        assert_eq!(seen, 1);
    }
}
