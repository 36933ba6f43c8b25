//! Error taxonomy for the capture pipeline
//!
//! Connect and read errors never leave the capture thread: the reconnect
//! state machine consumes them. Only [`PipelineError`] reaches the status
//! surface, as the description carried by a terminal `Failed` event.

use std::time::Duration;

use thiserror::Error;

use crate::capture::PixelFormat;

/// Failure to open a frame source
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectError {
    #[error("source unreachable: {0}")]
    Unreachable(String),

    #[error("invalid source configuration: {0}")]
    InvalidConfig(String),

    #[error("connect cancelled")]
    Cancelled,
}

/// Failure to read the next frame from an open source
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ReadError {
    #[error("no frame within {0:?}")]
    Timeout(Duration),

    #[error("device lost: {0}")]
    DeviceLost(String),

    #[error("read cancelled")]
    Cancelled,
}

/// Non-fatal per-frame processing failure. The unprocessed frame is published instead.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProcessingError {
    #[error("transform '{stage}' failed: {reason}")]
    TransformFailed { stage: String, reason: String },
}

impl ProcessingError {
    pub fn transform(stage: impl Into<String>, reason: impl ToString) -> Self {
        Self::TransformFailed {
            stage: stage.into(),
            reason: reason.to_string(),
        }
    }
}

/// Terminal pipeline failure, reported once through the status surface
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("gave up after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to spawn capture thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Pixel format conversion failure
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConvertError {
    #[error("cannot convert {from:?} to {to:?}")]
    Unsupported { from: PixelFormat, to: PixelFormat },

    #[error("frame buffer too small: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("row stride {stride} below the minimum {min}")]
    Stride { stride: u32, min: u32 },

    #[error("jpeg decode failed: {0}")]
    Jpeg(String),
}

/// Failure inside a render sink
#[derive(Debug, Error)]
pub enum RenderError {
    #[error("frame format {0:?} is not displayable")]
    NotDisplayable(PixelFormat),

    #[error(transparent)]
    Convert(#[from] ConvertError),

    #[error("render backend: {0}")]
    Backend(String),
}
