use std::path::Path;

use anyhow::{Context, Result, anyhow};
use ndarray::Array2;
use ort::session::{Session, builder::GraphOptimizationLevel};
use ort::value::Tensor;
use serde::{Deserialize, Serialize};

use crate::types::{GestureId, NormalizedVector};

/// Maps a normalized hand shape to a gesture id.
pub trait StaticGestureClassifier: Send + 'static {
    fn classify(&mut self, vector: &NormalizedVector) -> Result<GestureId>;
}

/// Maps a window of trajectory features (see `PointHistory::features`) to a
/// gesture id.
pub trait TemporalGestureClassifier: Send + 'static {
    fn classify(&mut self, trajectory: &[f32]) -> Result<GestureId>;
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClassifierMode {
    #[default]
    Static,
    Trajectory,
}

impl ClassifierMode {
    pub fn label(&self) -> &'static str {
        match self {
            ClassifierMode::Static => "static",
            ClassifierMode::Trajectory => "trajectory",
        }
    }
}

impl std::str::FromStr for ClassifierMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "static" | "keypoint" => Ok(ClassifierMode::Static),
            "trajectory" | "point-history" => Ok(ClassifierMode::Trajectory),
            other => Err(format!("unknown classifier mode: {other}")),
        }
    }
}

/// What a classification cycle feeds the selected classifier.
pub struct ClassifierInput<'a> {
    pub shape: &'a NormalizedVector,
    pub trajectory: &'a [f32],
}

pub enum ClassifierVariant {
    Static(Box<dyn StaticGestureClassifier>),
    Trajectory(Box<dyn TemporalGestureClassifier>),
}

impl ClassifierVariant {
    pub fn mode(&self) -> ClassifierMode {
        match self {
            ClassifierVariant::Static(_) => ClassifierMode::Static,
            ClassifierVariant::Trajectory(_) => ClassifierMode::Trajectory,
        }
    }

    pub fn classify(&mut self, input: &ClassifierInput<'_>) -> Result<GestureId> {
        match self {
            ClassifierVariant::Static(classifier) => classifier.classify(input.shape),
            ClassifierVariant::Trajectory(classifier) => classifier.classify(input.trajectory),
        }
    }
}

/// ONNX classifier taking a `(1, input_len)` float tensor and returning
/// logits; the predicted id is the argmax.
pub struct OrtGestureModel {
    session: Session,
    input_len: usize,
}

impl OrtGestureModel {
    pub fn load(model_path: &Path, input_len: usize) -> Result<Self> {
        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(1)?
            .commit_from_file(model_path)
            .with_context(|| {
                format!(
                    "failed to load gesture classifier from {}",
                    model_path.display()
                )
            })?;

        log::info!(
            "loaded gesture classifier {} (input length {input_len})",
            model_path.display()
        );

        Ok(Self { session, input_len })
    }

    fn predict(&mut self, input: &[f32]) -> Result<GestureId> {
        if input.len() != self.input_len {
            return Err(anyhow!(
                "classifier expects {} values, got {}",
                self.input_len,
                input.len()
            ));
        }

        let input_array = Array2::from_shape_vec((1, self.input_len), input.to_vec())
            .map_err(|err| anyhow!("failed to build classifier input: {err}"))?;
        let tensor = Tensor::from_array(input_array)?;

        let outputs = self
            .session
            .run(ort::inputs![tensor])
            .context("gesture classifier inference failed")?;

        let logits = outputs[0]
            .try_extract_array::<f32>()
            .context("failed to extract classifier logits")?;

        argmax(logits.iter().copied()).ok_or_else(|| anyhow!("classifier returned no logits"))
    }
}

impl StaticGestureClassifier for OrtGestureModel {
    fn classify(&mut self, vector: &NormalizedVector) -> Result<GestureId> {
        self.predict(vector.as_slice())
    }
}

impl TemporalGestureClassifier for OrtGestureModel {
    fn classify(&mut self, trajectory: &[f32]) -> Result<GestureId> {
        self.predict(trajectory)
    }
}

/// Index of the largest value; the first one wins on ties, NaN never wins.
pub fn argmax<I>(values: I) -> Option<usize>
where
    I: IntoIterator<Item = f32>,
{
    let mut best: Option<(usize, f32)> = None;
    for (idx, value) in values.into_iter().enumerate() {
        if value.is_nan() {
            continue;
        }
        match best {
            Some((_, top)) if value <= top => {}
            _ => best = Some((idx, value)),
        }
    }
    best.map(|(idx, _)| idx)
}
