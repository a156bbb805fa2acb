use std::path::Path;

use anyhow::{Context, Result, anyhow};
use ort::session::{Session, builder::GraphOptimizationLevel};
use ort::value::Tensor;

use super::{
    HandDetector,
    common::{self, INPUT_SIZE},
    palm::{PalmDetector, PalmDetectorConfig, PalmRegion, crop_from_palm},
};
use crate::types::{Frame, LandmarkFrame};

#[derive(Clone, Debug)]
pub struct DetectorSettings {
    /// Handpose presence score below which a crop is discarded.
    pub min_confidence: f32,
    pub max_hands: usize,
    pub palm: PalmDetectorConfig,
}

/// Two-stage MediaPipe pipeline: palms are found on the whole frame, then
/// each of the best `max_hands` palms is cropped, rotated upright and run
/// through the handpose estimator.
pub struct OrtHandDetector {
    handpose: Session,
    palm_detector: PalmDetector,
    min_confidence: f32,
    max_hands: usize,
}

impl OrtHandDetector {
    pub fn load(handpose_path: &Path, palm_path: &Path, settings: DetectorSettings) -> Result<Self> {
        let handpose = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(2)?
            .commit_from_file(handpose_path)
            .with_context(|| {
                format!("failed to load ORT session from {}", handpose_path.display())
            })?;
        let palm_detector = PalmDetector::load(palm_path, settings.palm)?;

        log::info!(
            "handpose ORT backend ready using {} and palm detector {} (up to {} hands, min confidence {:.2})",
            handpose_path.display(),
            palm_path.display(),
            settings.max_hands,
            settings.min_confidence
        );

        Ok(Self {
            handpose,
            palm_detector,
            min_confidence: settings.min_confidence,
            max_hands: settings.max_hands,
        })
    }

    fn estimate(&mut self, frame: &Frame, palm: &PalmRegion) -> Result<Option<LandmarkFrame>> {
        let (center, side, angle) = crop_from_palm(palm);
        let (input, transform) =
            common::prepare_rotated_crop(frame, center, side, angle, INPUT_SIZE)?;
        let tensor = Tensor::from_array(input)?;
        let outputs = self
            .handpose
            .run(ort::inputs![tensor])
            .context("failed to run ORT session")?;

        if outputs.len() < 1 {
            return Err(anyhow!("model returned no outputs"));
        }

        let confidence = if outputs.len() > 1 {
            outputs[1]
                .try_extract_array::<f32>()
                .ok()
                .and_then(|arr| arr.iter().next().copied())
                .unwrap_or(0.0)
        } else {
            1.0
        };
        if confidence < self.min_confidence {
            log::trace!(
                "hand confidence {confidence:.2} below threshold (palm score {:.2})",
                palm.score
            );
            return Ok(None);
        }

        let coords = outputs[0].try_extract_array::<f32>()?;
        let flattened: Vec<f32> = coords.iter().copied().collect();
        common::decode_hand(&flattened, &transform).map(Some)
    }
}

impl HandDetector for OrtHandDetector {
    fn detect(&mut self, frame: &Frame) -> Result<Vec<LandmarkFrame>> {
        let palms = self.palm_detector.detect(frame)?;
        let mut hands = Vec::new();
        for palm in strongest_palms(palms, self.max_hands) {
            if let Some(hand) = self.estimate(frame, &palm)? {
                hands.push(hand);
            }
        }
        Ok(hands)
    }
}

/// The `max_hands` highest-scoring palms, strongest first.
fn strongest_palms(mut palms: Vec<PalmRegion>, max_hands: usize) -> Vec<PalmRegion> {
    palms.sort_by(|a, b| b.score.total_cmp(&a.score));
    palms.truncate(max_hands);
    palms
}
