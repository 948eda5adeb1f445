//! Typed errors for the extraction pipeline and its inbound surface.

use std::time::Duration;

use thiserror::Error;

/// Failures that abort a pipeline run.
///
/// Everything that is allowed to degrade (failed OCR job, failed entity
/// batch, per-document errors) is reported in the result instead.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("{service} unavailable: {cause:#}")]
    ServiceUnavailable {
        service: &'static str,
        cause: anyhow::Error,
    },

    #[error("OCR operation {operation_id} still {last_status} after {waited:?}")]
    PollTimeout {
        operation_id: String,
        waited: Duration,
        last_status: String,
    },

    #[error("pipeline cancelled")]
    Cancelled,
}

impl PipelineError {
    pub fn unavailable(service: &'static str, cause: impl Into<anyhow::Error>) -> Self {
        Self::ServiceUnavailable {
            service,
            cause: cause.into(),
        }
    }
}

/// Caller errors rejected before any remote call is made.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum InputError {
    #[error("either image_file or image_url must be provided")]
    Missing,

    #[error("file extension not allowed: {0}")]
    DisallowedExtension(String),

    #[error("uploaded file is not a PNG, JPEG or GIF image")]
    NotAnImage,

    #[error("uploaded file exceeds {limit} bytes")]
    TooLarge { limit: usize },

    #[error("invalid image URL: {0}")]
    InvalidUrl(String),
}
