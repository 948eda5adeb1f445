//! Image → OCR job → lines → batched entity recognition.

use std::sync::Arc;

use tracing::info;

use crate::cancel::CancelToken;
use crate::config::Settings;
use crate::entities::{BatchEntityRecognizer, EntityService};
use crate::error::PipelineError;
use crate::lines::{extract_lines, recognizable_texts};
use crate::ocr::{ImageSource, OcrService};
use crate::poller::JobPoller;
use crate::schema::{ExtractionReport, SourceSummary};
use crate::upload::sha256_hex;

/// Extraction pipeline orchestrator.
///
/// Stages run strictly one after another; each consumes the previous
/// stage's complete output.
pub struct Pipeline {
    ocr: Arc<dyn OcrService>,
    poller: JobPoller,
    recognizer: BatchEntityRecognizer,
}

impl Pipeline {
    pub fn new(
        ocr: Arc<dyn OcrService>,
        entities: Arc<dyn EntityService>,
        settings: &Settings,
    ) -> Self {
        Self {
            poller: JobPoller::new(Arc::clone(&ocr), settings.poll.policy()),
            recognizer: BatchEntityRecognizer::new(
                entities,
                settings.batch.max_size,
                settings.batch.concurrency,
                settings.batch.order,
            ),
            ocr,
        }
    }

    pub async fn run(
        &self,
        source: ImageSource,
        cancel: &CancelToken,
    ) -> Result<ExtractionReport, PipelineError> {
        info!(
            "Starting extraction for {} via {}",
            source.describe(),
            self.ocr.name()
        );
        let summary = summarize(&source);

        let handle = tokio::select! {
            _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
            h = self.ocr.submit(&source) => h?,
        };
        drop(source);

        let outcome = self.poller.await_result(&handle, cancel).await?;

        let lines = extract_lines(&outcome.document);
        let texts = recognizable_texts(&lines);
        info!(
            "OCR {}: {} lines, {} with text",
            outcome.status,
            lines.len(),
            texts.len()
        );

        let mut report = ExtractionReport::new(summary, outcome.status);
        report.line_count = texts.len();

        if texts.is_empty() {
            return Ok(report);
        }

        let recognition = self.recognizer.recognize(&texts, cancel).await?;
        report.batch_count = recognition.batch_count;
        report.results = recognition.results;
        report.skipped = recognition.skipped;

        info!(
            "Extraction {} complete: {} results, {} skipped",
            report.id,
            report.results.len(),
            report.skipped.len()
        );
        Ok(report)
    }
}

fn summarize(source: &ImageSource) -> SourceSummary {
    match source {
        ImageSource::Bytes { filename, data } => SourceSummary::Upload {
            filename: filename.clone(),
            bytes: data.len(),
            sha256: sha256_hex(data),
        },
        ImageSource::Url { url } => SourceSummary::Url { url: url.clone() },
    }
}
