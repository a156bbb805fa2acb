use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::{
    gesture::ClassifierMode,
    pipeline::{
        CaptureSettings, DetectorSettings, PalmDetectorConfig, RecognitionSettings,
        SessionSettings, history::DEFAULT_HISTORY_LEN,
    },
    stream::RetryPolicy,
};

pub const DEFAULT_CONFIG_PATH: &str = "gesture-relay.json";

const HANDPOSE_MODEL_URL: &str = "https://raw.githubusercontent.com/214zzl995/gesture-universe/refs/heads/main/models/handpose_estimation_mediapipe_2023feb.onnx";
const PALM_MODEL_URL: &str = "https://raw.githubusercontent.com/214zzl995/gesture-universe/refs/heads/main/models/palm_detection_mediapipe_2023feb.onnx";

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub camera: CameraConfig,
    pub detector: DetectorConfig,
    pub classifier: ClassifierConfig,
    pub history: HistoryConfig,
    pub throttle: ThrottleConfig,
    pub stream: StreamConfig,
    pub gloss_log: GlossLogConfig,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    pub index: u32,
    pub tick_ms: u64,
    pub jpeg_quality: u8,
    pub max_read_failures: u32,
    /// Still images to replay instead of opening a camera.
    pub replay: Vec<PathBuf>,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            index: 0,
            tick_ms: 100,
            jpeg_quality: 70,
            max_read_failures: 30,
            replay: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    pub model_path: PathBuf,
    pub model_url: Option<String>,
    pub palm_model_path: PathBuf,
    pub palm_model_url: Option<String>,
    pub min_confidence: f32,
    pub palm_score_threshold: f32,
    pub max_hands: usize,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            model_path: PathBuf::from("models").join("handpose_estimation_mediapipe_2023feb.onnx"),
            model_url: Some(HANDPOSE_MODEL_URL.to_string()),
            palm_model_path: PathBuf::from("models").join("palm_detection_mediapipe_2023feb.onnx"),
            palm_model_url: Some(PALM_MODEL_URL.to_string()),
            min_confidence: 0.7,
            palm_score_threshold: PalmDetectorConfig::default().score_threshold,
            max_hands: 2,
        }
    }
}

impl DetectorConfig {
    pub fn settings(&self) -> DetectorSettings {
        DetectorSettings {
            min_confidence: self.min_confidence,
            max_hands: self.max_hands.max(1),
            palm: PalmDetectorConfig {
                score_threshold: self.palm_score_threshold,
                ..PalmDetectorConfig::default()
            },
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    pub mode: ClassifierMode,
    pub keypoint_model: PathBuf,
    pub keypoint_model_url: Option<String>,
    pub point_history_model: PathBuf,
    pub point_history_model_url: Option<String>,
    /// `.json` object keyed by `id + 1`, or a one-column `.csv`.
    pub label_table: PathBuf,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            mode: ClassifierMode::Static,
            keypoint_model: PathBuf::from("models").join("keypoint_classifier.onnx"),
            keypoint_model_url: None,
            point_history_model: PathBuf::from("models").join("point_history_classifier.onnx"),
            point_history_model_url: None,
            label_table: PathBuf::from("hand_sign_string.json"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    pub length: usize,
    pub emit_smoothed: bool,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            length: DEFAULT_HISTORY_LEN,
            emit_smoothed: false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottleConfig {
    pub interval_ms: u64,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self { interval_ms: 1_000 }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub server: String,
    pub username: Option<String>,
    pub request_timeout_ms: u64,
    pub frame_queue: usize,
    pub gesture_queue: usize,
    pub retry_attempts: u32,
    pub retry_initial_ms: u64,
    pub retry_max_ms: u64,
    /// Pause after a failed long-poll before polling again.
    pub poll_error_backoff_ms: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            server: "http://localhost:5000".to_string(),
            username: None,
            request_timeout_ms: 5_000,
            frame_queue: 4,
            gesture_queue: 32,
            retry_attempts: 3,
            retry_initial_ms: 100,
            retry_max_ms: 2_000,
            poll_error_backoff_ms: 500,
        }
    }
}

impl StreamConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry_attempts.max(1),
            initial_backoff: Duration::from_millis(self.retry_initial_ms),
            multiplier: 2,
            max_backoff: Duration::from_millis(self.retry_max_ms),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GlossLogConfig {
    pub path: PathBuf,
}

impl Default for GlossLogConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("hand_sign.txt"),
        }
    }
}

/// Command-line values that take precedence over the file.
#[derive(Clone, Debug, Default)]
pub struct Overrides {
    pub server: Option<String>,
    pub username: Option<String>,
    pub camera_index: Option<u32>,
    pub classifier: Option<ClassifierMode>,
    pub replay: Vec<PathBuf>,
}

impl Config {
    /// Reads the settings file. A missing file yields the defaults; a file
    /// that exists but does not parse is an error.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            log::debug!("no config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse config {}", path.display()))
    }

    pub fn apply(&mut self, overrides: Overrides) {
        if let Some(server) = overrides.server {
            self.stream.server = server;
        }
        if let Some(username) = overrides.username {
            self.stream.username = Some(username);
        }
        if let Some(index) = overrides.camera_index {
            self.camera.index = index;
        }
        if let Some(mode) = overrides.classifier {
            self.classifier.mode = mode;
        }
        if !overrides.replay.is_empty() {
            self.camera.replay = overrides.replay;
        }
    }

    /// Input length of the selected classifier model.
    pub fn classifier_input_len(&self) -> usize {
        match self.classifier.mode {
            ClassifierMode::Static => crate::types::NUM_LANDMARKS * 2,
            ClassifierMode::Trajectory => self.history.length.max(1) * 2,
        }
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            capture: CaptureSettings {
                tick: Duration::from_millis(self.camera.tick_ms),
                jpeg_quality: self.camera.jpeg_quality.clamp(1, 100),
                max_read_failures: self.camera.max_read_failures,
            },
            recognition: RecognitionSettings {
                history_len: self.history.length.max(1),
                throttle_interval: Duration::from_millis(self.throttle.interval_ms),
                emit_smoothed: self.history.emit_smoothed,
            },
            frame_queue: self.stream.frame_queue,
            gesture_queue: self.stream.gesture_queue,
        }
    }
}
