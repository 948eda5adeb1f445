//! Output types returned to callers.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

use crate::ocr::JobStatus;

/// Generate ISO8601 timestamp for current time.
pub fn now_iso8601() -> String {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    format_unix_secs(secs)
}

/// Format seconds since the epoch as `YYYY-MM-DDTHH:MM:SSZ`.
fn format_unix_secs(secs: u64) -> String {
    let mut remaining_days = (secs / 86400) as i64;
    let time_of_day = secs % 86400;

    let mut year = 1970i64;
    loop {
        let days_in_year = if is_leap_year(year) { 366 } else { 365 };
        if remaining_days < days_in_year {
            break;
        }
        remaining_days -= days_in_year;
        year += 1;
    }

    let feb = if is_leap_year(year) { 29 } else { 28 };
    let mut month = 1;
    for days in [31, feb, 31, 30, 31, 30, 31, 31, 30, 31, 30, 31] {
        if remaining_days < days {
            break;
        }
        remaining_days -= days;
        month += 1;
    }

    format!(
        "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}Z",
        year,
        month,
        remaining_days + 1,
        time_of_day / 3600,
        (time_of_day % 3600) / 60,
        time_of_day % 60
    )
}

fn is_leap_year(year: i64) -> bool {
    (year % 4 == 0 && year % 100 != 0) || (year % 400 == 0)
}

/// One recognized entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityAnnotation {
    pub text: String,
    pub category: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subcategory: Option<String>,
    /// In `[0, 1]`.
    pub confidence_score: f64,
}

/// Entities found in one OCR line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecognitionResult {
    /// Index of the line among the recognizable lines of the image.
    pub line: usize,
    pub text: String,
    pub entities: Vec<EntityAnnotation>,
}

/// A line that produced no result, and why.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkippedItem {
    pub batch: usize,
    /// Document id as sent or as echoed back by the service.
    pub id: String,
    /// Line index, when the id maps to a line that was sent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<usize>,
    pub reason: SkipReason,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SkipReason {
    /// The whole batch call failed.
    BatchFailed { message: String },
    /// The service flagged this document as errored.
    DocumentError { code: String, message: String },
    UnparseableId,
    /// The id does not name a line sent in this batch.
    IdOutOfRange,
    DuplicateId,
    /// Sent, but the response never mentioned it.
    MissingFromResponse,
}

/// Where the image came from.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceSummary {
    Upload {
        filename: String,
        bytes: usize,
        sha256: String,
    },
    Url {
        url: String,
    },
}

/// Result of one extraction request.
#[derive(Debug, Clone, Serialize)]
pub struct ExtractionReport {
    pub id: String,
    pub extracted_at: String,
    pub source: SourceSummary,
    /// Terminal status of the OCR job; anything but `succeeded` means no lines.
    pub ocr_status: JobStatus,
    /// Recognizable (non-blank) lines found by OCR.
    pub line_count: usize,
    pub batch_count: usize,
    pub results: Vec<EntityRecognitionResult>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub skipped: Vec<SkippedItem>,
}

impl ExtractionReport {
    pub fn new(source: SourceSummary, ocr_status: JobStatus) -> Self {
        Self {
            id: format!("ex_{}", Uuid::new_v4().simple()),
            extracted_at: now_iso8601(),
            source,
            ocr_status,
            line_count: 0,
            batch_count: 0,
            results: Vec::new(),
            skipped: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_unix_secs() {
        assert_eq!(format_unix_secs(0), "1970-01-01T00:00:00Z");
        // 2024-02-29T12:34:56Z
        assert_eq!(format_unix_secs(1_709_210_096), "2024-02-29T12:34:56Z");
    }

    #[test]
    fn test_annotation_uses_camel_case_confidence() {
        let annotation = EntityAnnotation {
            text: "Seattle".to_string(),
            category: "Location".to_string(),
            subcategory: None,
            confidence_score: 0.9,
        };
        let json = serde_json::to_value(&annotation).unwrap();
        assert_eq!(json["confidenceScore"], 0.9);
        assert!(json.get("subcategory").is_none());
    }

    #[test]
    fn test_skip_reason_is_tagged() {
        let item = SkippedItem {
            batch: 1,
            id: "7".to_string(),
            line: Some(7),
            reason: SkipReason::DocumentError {
                code: "InvalidDocument".to_string(),
                message: "empty".to_string(),
            },
        };
        let json = serde_json::to_value(&item).unwrap();
        assert_eq!(json["reason"]["kind"], "document_error");
        assert_eq!(json["reason"]["code"], "InvalidDocument");
    }

    #[test]
    fn test_report_serializes_status_string() {
        let report = ExtractionReport::new(
            SourceSummary::Url {
                url: "https://example.com/a.png".to_string(),
            },
            JobStatus::Failed,
        );
        assert!(report.id.starts_with("ex_"));
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["ocr_status"], "failed");
        assert_eq!(json["source"]["kind"], "url");
        assert!(json.get("skipped").is_none());
    }
}
