//! OCR job abstraction.
//!
//! Defines the [`OcrService`] trait and the types shared by the poller and
//! line extractor, so the Azure Read client can be swapped for a fake in tests.

pub mod azure_read;

use serde::Serialize;

use crate::error::PipelineError;

/// Image handed to the OCR service, either raw bytes or a remote URL.
#[derive(Debug, Clone)]
pub enum ImageSource {
    Bytes { filename: String, data: Vec<u8> },
    Url { url: String },
}

impl ImageSource {
    /// Short label for logs.
    pub fn describe(&self) -> String {
        match self {
            Self::Bytes { filename, data } => format!("{} ({} bytes)", filename, data.len()),
            Self::Url { url } => url.clone(),
        }
    }
}

/// Opaque identifier of an in-flight OCR operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OcrJobHandle(String);

impl OcrJobHandle {
    pub fn new(operation_id: impl Into<String>) -> Self {
        Self(operation_id.into())
    }

    /// The operation id is the last path segment of the `Operation-Location` URL.
    pub fn from_operation_location(location: &str) -> Option<Self> {
        let path = location.split(['?', '#']).next()?;
        path.trim_end_matches('/')
            .rsplit('/')
            .next()
            .filter(|id| !id.is_empty() && !id.contains(':'))
            .map(Self::new)
    }

    pub fn operation_id(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for OcrJobHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Status of an OCR operation as reported by the service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus {
    NotStarted,
    Running,
    Succeeded,
    Failed,
    Other(String),
}

impl JobStatus {
    /// Case-insensitive parse; unknown values are kept verbatim.
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "notstarted" => Self::NotStarted,
            "running" => Self::Running,
            "succeeded" => Self::Succeeded,
            "failed" => Self::Failed,
            _ => Self::Other(s.to_string()),
        }
    }

    /// Whether the poller should keep waiting.
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::NotStarted | Self::Running)
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::NotStarted => "notStarted",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Other(s) => s,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for JobStatus {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OcrLine {
    pub text: String,
}

/// One region of recognized text (a page, for the Read API).
#[derive(Debug, Clone, Default)]
pub struct TextRegion {
    pub lines: Vec<OcrLine>,
}

/// Structured OCR output: regions in result order, lines in detection order.
#[derive(Debug, Clone, Default)]
pub struct OcrDocument {
    pub regions: Vec<TextRegion>,
}

impl OcrDocument {
    pub fn empty() -> Self {
        Self::default()
    }
}

/// One status query's answer.
#[derive(Debug, Clone)]
pub struct ReadResult {
    pub status: JobStatus,
    /// Present once the job has succeeded.
    pub document: Option<OcrDocument>,
}

/// Async submit-and-poll OCR backend.
#[async_trait::async_trait]
pub trait OcrService: Send + Sync {
    fn name(&self) -> &str;

    /// Start an OCR job. Does not wait for it to finish.
    async fn submit(&self, source: &ImageSource) -> Result<OcrJobHandle, PipelineError>;

    /// Query the job's current status once.
    async fn fetch(&self, handle: &OcrJobHandle) -> anyhow::Result<ReadResult>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_from_operation_location() {
        let location = "https://westus.api.cognitive.microsoft.com/vision/v3.2/read/analyzeResults/3a8c-41f2";
        let handle = OcrJobHandle::from_operation_location(location).unwrap();
        assert_eq!(handle.operation_id(), "3a8c-41f2");
    }

    #[test]
    fn test_handle_ignores_query_and_trailing_slash() {
        let handle =
            OcrJobHandle::from_operation_location("https://host/read/analyzeResults/abc/?x=1")
                .unwrap();
        assert_eq!(handle.operation_id(), "abc");
    }

    #[test]
    fn test_handle_rejects_bare_host() {
        assert!(OcrJobHandle::from_operation_location("https://").is_none());
        assert!(OcrJobHandle::from_operation_location("").is_none());
    }

    #[test]
    fn test_status_parse_is_case_insensitive() {
        assert_eq!(JobStatus::parse("notStarted"), JobStatus::NotStarted);
        assert_eq!(JobStatus::parse("RUNNING"), JobStatus::Running);
        assert_eq!(JobStatus::parse("Succeeded"), JobStatus::Succeeded);
        assert_eq!(JobStatus::parse("failed"), JobStatus::Failed);
        assert_eq!(
            JobStatus::parse("partiallyCompleted"),
            JobStatus::Other("partiallyCompleted".to_string())
        );
    }

    #[test]
    fn test_only_not_started_and_running_are_pending() {
        assert!(JobStatus::NotStarted.is_pending());
        assert!(JobStatus::Running.is_pending());
        assert!(!JobStatus::Succeeded.is_pending());
        assert!(!JobStatus::Failed.is_pending());
        assert!(!JobStatus::Other("weird".into()).is_pending());
    }
}
