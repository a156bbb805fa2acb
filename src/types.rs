use std::time::Instant;

/// Number of keypoints the handpose estimator reports per hand.
pub const NUM_LANDMARKS: usize = 21;

/// Landmark used as the trajectory sample (index fingertip).
pub const TRAJECTORY_LANDMARK: usize = 8;

pub type GestureId = usize;

#[derive(Clone, Debug)]
pub struct Frame {
    pub rgba: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub timestamp: Instant,
}

impl Frame {
    pub fn new(rgba: Vec<u8>, width: u32, height: u32) -> Self {
        Self {
            rgba,
            width,
            height,
            timestamp: Instant::now(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct LandmarkPoint {
    pub x: i32,
    pub y: i32,
}

impl LandmarkPoint {
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    /// Converts a projected pixel coordinate into an integer point inside
    /// the frame, truncating toward zero.
    pub fn from_projected(x: f32, y: f32, width: u32, height: u32) -> Self {
        let max_x = width.saturating_sub(1) as i32;
        let max_y = height.saturating_sub(1) as i32;
        let px = if x.is_finite() { x as i32 } else { 0 };
        let py = if y.is_finite() { y as i32 } else { 0 };
        Self {
            x: px.clamp(0, max_x),
            y: py.clamp(0, max_y),
        }
    }
}

/// One detected hand: every landmark in detector order, point 0 is the wrist.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LandmarkFrame {
    pub points: Vec<LandmarkPoint>,
}

impl LandmarkFrame {
    pub fn new(points: Vec<LandmarkPoint>) -> Self {
        Self { points }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// Point recorded into the trajectory history, falling back to the wrist
    /// for detectors that report fewer landmarks.
    pub fn trajectory_point(&self) -> LandmarkPoint {
        self.points
            .get(TRAJECTORY_LANDMARK)
            .or_else(|| self.points.first())
            .copied()
            .unwrap_or_default()
    }
}

/// Flattened `[x0, y0, x1, y1, ...]` translated to point 0 and scaled so the
/// largest magnitude is 1.0.
#[derive(Clone, Debug, PartialEq)]
pub struct NormalizedVector(pub Vec<f32>);

impl NormalizedVector {
    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_degenerate(&self) -> bool {
        self.0.iter().all(|v| *v == 0.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Classification {
    pub id: GestureId,
    pub label: String,
    /// False when the label table had no entry and the fallback was used.
    pub resolved: bool,
}

#[derive(Clone, Debug)]
pub struct RecognizedGesture {
    pub classification: Classification,
    /// Most frequent id in the current history window.
    pub smoothed_id: GestureId,
    /// Capture time of the frame the hand was found in.
    pub timestamp: Instant,
}

impl RecognizedGesture {
    pub fn display_text(&self) -> String {
        format!("Hand Sign: {}", self.classification.label)
    }
}
