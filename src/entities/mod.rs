//! Batched entity recognition over OCR lines.
//!
//! Lines are split into fixed-size batches, each document tagged with its
//! global line index as id. The service answers per document, keyed by id,
//! in no guaranteed order and possibly with gaps, so every answer is mapped
//! back through its batch's start offset before use. Failures degrade: a
//! failed batch or document is recorded as skipped and the rest carries on.

pub mod text_analytics;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::error::PipelineError;
use crate::lines::is_blank;
use crate::schema::{EntityAnnotation, EntityRecognitionResult, SkipReason, SkippedItem};

/// A document as sent to the entity service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextDocument {
    pub id: String,
    pub text: String,
}

/// The service's answer for one document.
#[derive(Debug, Clone, PartialEq)]
pub enum DocumentOutcome {
    Recognized {
        id: String,
        entities: Vec<EntityAnnotation>,
    },
    Failed {
        id: String,
        code: String,
        message: String,
    },
}

/// Batched entity-recognition backend.
#[async_trait::async_trait]
pub trait EntityService: Send + Sync {
    fn name(&self) -> &str;

    /// Recognize entities in up to one batch of documents with a single call.
    async fn recognize(&self, documents: &[TextDocument]) -> anyhow::Result<Vec<DocumentOutcome>>;
}

/// Ordering of results within a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultOrder {
    /// Sorted by line index.
    Input,
    /// Whatever order the service answered in.
    Response,
}

/// A consecutive run of lines submitted in one call.
#[derive(Debug, Clone)]
pub struct Batch {
    pub index: usize,
    /// Global index of the first line.
    pub start: usize,
    /// One slot per line in the batch; `None` for blank lines, which are not sent.
    texts: Vec<Option<String>>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.texts.len()
    }

    /// True when no line of the batch would be sent.
    pub fn is_empty(&self) -> bool {
        self.texts.iter().all(Option::is_none)
    }

    pub fn documents(&self) -> Vec<TextDocument> {
        self.texts
            .iter()
            .enumerate()
            .filter_map(|(offset, text)| {
                text.as_ref().map(|text| TextDocument {
                    id: (self.start + offset).to_string(),
                    text: text.clone(),
                })
            })
            .collect()
    }

    /// Text sent for global line `line`, if that line belongs to this batch and was sent.
    fn text_at(&self, line: usize) -> Option<&str> {
        let offset = line.checked_sub(self.start)?;
        self.texts.get(offset)?.as_deref()
    }

    fn line_for_id(&self, id: &str) -> Option<usize> {
        let line = id.trim().parse::<usize>().ok()?;
        self.text_at(line).map(|_| line)
    }
}

/// Split `lines` into consecutive batches of at most `max_size` lines.
///
/// Batch `k` starts at `k * max_size`. Blank lines keep their slot (and
/// index) but are not sent.
pub fn plan_batches(lines: &[String], max_size: usize) -> Vec<Batch> {
    lines
        .chunks(max_size.max(1))
        .enumerate()
        .map(|(index, chunk)| Batch {
            index,
            start: index * max_size.max(1),
            texts: chunk
                .iter()
                .map(|text| (!is_blank(text)).then(|| text.clone()))
                .collect(),
        })
        .collect()
}

/// Results and skips for one batch.
#[derive(Debug, Clone, Default)]
pub struct BatchOutput {
    pub results: Vec<EntityRecognitionResult>,
    pub skipped: Vec<SkippedItem>,
}

impl BatchOutput {
    fn failed(batch: &Batch, error: &anyhow::Error) -> Self {
        let message = format!("{:#}", error);
        let skipped = batch
            .documents()
            .into_iter()
            .map(|doc| SkippedItem {
                batch: batch.index,
                line: doc.id.parse().ok(),
                id: doc.id,
                reason: SkipReason::BatchFailed {
                    message: message.clone(),
                },
            })
            .collect();
        Self {
            results: Vec::new(),
            skipped,
        }
    }
}

/// Map the service's per-document answers back onto the lines of `batch`.
pub fn reconcile(batch: &Batch, outcomes: Vec<DocumentOutcome>, order: ResultOrder) -> BatchOutput {
    let mut output = BatchOutput::default();
    let mut answered = vec![false; batch.len()];

    let skip = |output: &mut BatchOutput, id: String, line: Option<usize>, reason: SkipReason| {
        output.skipped.push(SkippedItem {
            batch: batch.index,
            id,
            line,
            reason,
        });
    };

    for outcome in outcomes {
        match outcome {
            DocumentOutcome::Failed { id, code, message } => {
                warn!("Document {} error: {} ({})", id, message, code);
                let line = batch.line_for_id(&id);
                if let Some(line) = line {
                    let offset = line - batch.start;
                    if answered[offset] {
                        warn!("Document id {} answered more than once", line);
                        skip(&mut output, id, Some(line), SkipReason::DuplicateId);
                        continue;
                    }
                    answered[offset] = true;
                }
                skip(&mut output, id, line, SkipReason::DocumentError { code, message });
            }
            DocumentOutcome::Recognized { id, entities } => {
                let Ok(line) = id.trim().parse::<usize>() else {
                    warn!("Document id {:?} is not a line index", id);
                    skip(&mut output, id, None, SkipReason::UnparseableId);
                    continue;
                };

                let Some(text) = batch.text_at(line) else {
                    warn!(
                        "Document id {} is out of range for the batch starting at {}",
                        line, batch.start
                    );
                    skip(&mut output, id, None, SkipReason::IdOutOfRange);
                    continue;
                };

                let offset = line - batch.start;
                if answered[offset] {
                    warn!("Document id {} answered more than once", line);
                    skip(&mut output, id, Some(line), SkipReason::DuplicateId);
                    continue;
                }
                answered[offset] = true;

                output.results.push(EntityRecognitionResult {
                    line,
                    text: text.to_string(),
                    entities,
                });
            }
        }
    }

    for doc in batch.documents() {
        if let Some(line) = batch.line_for_id(&doc.id) {
            if !answered[line - batch.start] {
                warn!("Document {} missing from response", doc.id);
                skip(&mut output, doc.id, Some(line), SkipReason::MissingFromResponse);
            }
        }
    }

    if order == ResultOrder::Input {
        output.results.sort_by_key(|r| r.line);
    }

    output
}

/// Everything the recognizer produced for one sequence of lines.
#[derive(Debug, Clone, Default)]
pub struct RecognitionReport {
    pub results: Vec<EntityRecognitionResult>,
    pub skipped: Vec<SkippedItem>,
    /// Batches planned, including any skipped for having nothing to send.
    pub batch_count: usize,
}

pub struct BatchEntityRecognizer {
    service: Arc<dyn EntityService>,
    max_batch_size: usize,
    concurrency: usize,
    order: ResultOrder,
}

impl BatchEntityRecognizer {
    pub fn new(
        service: Arc<dyn EntityService>,
        max_batch_size: usize,
        concurrency: usize,
        order: ResultOrder,
    ) -> Self {
        Self {
            service,
            max_batch_size: max_batch_size.max(1),
            concurrency: concurrency.max(1),
            order,
        }
    }

    /// Recognize entities in `lines`, at most `concurrency` batch calls in flight.
    ///
    /// Batch and document failures are recorded in the report. Only
    /// cancellation returns an error.
    pub async fn recognize(
        &self,
        lines: &[String],
        cancel: &CancelToken,
    ) -> Result<RecognitionReport, PipelineError> {
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        let batches = plan_batches(lines, self.max_batch_size);
        let batch_count = batches.len();
        info!(
            "Recognizing entities in {} lines ({} batches via {})",
            lines.len(),
            batch_count,
            self.service.name()
        );

        let mut outputs: Vec<Option<BatchOutput>> = vec![None; batch_count];
        let mut pending = batches.into_iter().filter(|batch| {
            if batch.is_empty() {
                debug!("Batch {} has nothing to send, skipping", batch.index);
            }
            !batch.is_empty()
        });
        let mut in_flight = JoinSet::new();

        loop {
            while in_flight.len() < self.concurrency {
                let Some(batch) = pending.next() else { break };
                let service = Arc::clone(&self.service);
                let order = self.order;
                in_flight.spawn(async move {
                    let output = run_batch(service.as_ref(), &batch, order).await;
                    (batch.index, output)
                });
            }

            if in_flight.is_empty() {
                break;
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    in_flight.abort_all();
                    return Err(PipelineError::Cancelled);
                }
                Some(joined) = in_flight.join_next() => match joined {
                    Ok((index, output)) => outputs[index] = Some(output),
                    Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
                    Err(e) => warn!("Entity batch task ended unexpectedly: {}", e),
                }
            }
        }

        let mut report = RecognitionReport {
            batch_count,
            ..Default::default()
        };
        for output in outputs.into_iter().flatten() {
            report.results.extend(output.results);
            report.skipped.extend(output.skipped);
        }

        info!(
            "Entity recognition complete: {} results, {} skipped",
            report.results.len(),
            report.skipped.len()
        );
        Ok(report)
    }
}

async fn run_batch(service: &dyn EntityService, batch: &Batch, order: ResultOrder) -> BatchOutput {
    let documents = batch.documents();
    debug!(
        "Submitting batch {} (lines {}..{}, {} documents)",
        batch.index,
        batch.start,
        batch.start + batch.len(),
        documents.len()
    );

    match service.recognize(&documents).await {
        Ok(outcomes) => reconcile(batch, outcomes, order),
        Err(e) => {
            warn!(
                "Error in entity recognition for batch starting at index {}: {:#}",
                batch.start, e
            );
            BatchOutput::failed(batch, &e)
        }
    }
}
