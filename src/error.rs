use std::{io, path::PathBuf};

use thiserror::Error;

/// Faults raised inside the recognition pipeline.
///
/// Camera faults stop the capture session. Label table and gloss log faults
/// are degraded-but-continue: the caller counts them and keeps classifying.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("camera unavailable: {0}")]
    Camera(String),

    #[error("failed to read label table {path}: {source}")]
    LabelTableRead {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("label table {path} is malformed: {reason}")]
    LabelTableFormat { path: PathBuf, reason: String },

    #[error("failed to append to gloss log {path}: {source}")]
    GlossLog {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("classifier failed: {0}")]
    Classifier(String),

    #[error("hand detector failed: {0}")]
    Detector(String),
}

pub type Result<T> = std::result::Result<T, PipelineError>;

/// Faults on the relay connection. None of them stop capture.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("relay request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("relay answered with status {0}")]
    Status(u16),

    #[error("relay protocol error: {0}")]
    Protocol(String),

    #[error("relay closed the session")]
    Closed,

    #[error("failed to encode event: {0}")]
    Encode(#[from] serde_json::Error),
}

impl StreamError {
    /// Transient faults worth another attempt with the same session.
    pub fn is_retryable(&self) -> bool {
        match self {
            StreamError::Http(_) => true,
            StreamError::Status(code) => *code >= 500 || *code == 429,
            StreamError::Protocol(_) | StreamError::Closed | StreamError::Encode(_) => false,
        }
    }
}
