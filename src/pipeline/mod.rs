pub mod camera;
pub mod dispatch;
pub mod history;
pub mod normalize;
pub mod rate_limit;
pub mod recognizer;
pub mod session;

// Re-exports for convenience
pub use camera::{CaptureSettings, FrameSource, ReplaySource, SourceOpener};
#[cfg(feature = "camera-nokhwa")]
pub use camera::NokhwaSource;
pub use dispatch::ClassificationDispatcher;
pub use recognizer::{
    DetectorSettings, HandDetector, OrtHandDetector, RecognitionSettings, palm::PalmDetectorConfig,
};
pub use session::{
    CaptureSession, RecognitionParts, RelayConnection, SessionContext, SessionSettings,
    SessionState,
};
