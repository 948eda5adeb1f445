//! In-memory fakes of the remote services, for tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::entities::{DocumentOutcome, EntityService, TextDocument};
use crate::error::PipelineError;
use crate::ocr::{
    ImageSource, JobStatus, OcrDocument, OcrJobHandle, OcrLine, OcrService, ReadResult,
    TextRegion,
};
use crate::schema::EntityAnnotation;

pub fn document(regions: &[&[&str]]) -> OcrDocument {
    OcrDocument {
        regions: regions
            .iter()
            .map(|lines| TextRegion {
                lines: lines
                    .iter()
                    .map(|text| OcrLine {
                        text: text.to_string(),
                    })
                    .collect(),
            })
            .collect(),
    }
}

/// `n` distinct non-blank lines: "line 0", "line 1", ...
pub fn lines(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("line {}", i)).collect()
}

pub fn entity(text: &str) -> EntityAnnotation {
    EntityAnnotation {
        text: text.to_string(),
        category: "Test".to_string(),
        subcategory: None,
        confidence_score: 0.5,
    }
}

/// Scripted OCR job: answers each pending status in turn, then the terminal one forever.
pub struct FakeOcr {
    pending: Mutex<VecDeque<JobStatus>>,
    terminal: JobStatus,
    document: OcrDocument,
    fail_submit: bool,
    fail_fetch: bool,
    fetch_delay: Duration,
    submits: AtomicUsize,
    fetches: AtomicUsize,
}

impl FakeOcr {
    fn scripted(pending: Vec<JobStatus>, terminal: JobStatus, document: OcrDocument) -> Self {
        Self {
            pending: Mutex::new(pending.into()),
            terminal,
            document,
            fail_submit: false,
            fail_fetch: false,
            fetch_delay: Duration::ZERO,
            submits: AtomicUsize::new(0),
            fetches: AtomicUsize::new(0),
        }
    }

    pub fn new(pending: Vec<JobStatus>, terminal: JobStatus, document: OcrDocument) -> Arc<Self> {
        Arc::new(Self::scripted(pending, terminal, document))
    }

    pub fn succeeding(document: OcrDocument) -> Arc<Self> {
        Self::new(
            vec![JobStatus::NotStarted, JobStatus::Running],
            JobStatus::Succeeded,
            document,
        )
    }

    /// Never leaves `Running`.
    pub fn stuck() -> Arc<Self> {
        Self::new(vec![], JobStatus::Running, OcrDocument::empty())
    }

    pub fn failing_submit() -> Arc<Self> {
        Arc::new(Self {
            fail_submit: true,
            ..Self::scripted(vec![], JobStatus::Running, OcrDocument::empty())
        })
    }

    pub fn failing_fetch() -> Arc<Self> {
        Arc::new(Self {
            fail_fetch: true,
            ..Self::scripted(vec![], JobStatus::Running, OcrDocument::empty())
        })
    }

    /// Every status check hangs for `delay`.
    pub fn slow_fetch(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            fetch_delay: delay,
            ..Self::scripted(vec![], JobStatus::Running, OcrDocument::empty())
        })
    }

    pub fn submit_count(&self) -> usize {
        self.submits.load(Ordering::SeqCst)
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl OcrService for FakeOcr {
    fn name(&self) -> &str {
        "fake_ocr"
    }

    async fn submit(&self, _source: &ImageSource) -> Result<OcrJobHandle, PipelineError> {
        self.submits.fetch_add(1, Ordering::SeqCst);
        if self.fail_submit {
            return Err(PipelineError::unavailable(
                "OCR service",
                anyhow::anyhow!("connection refused"),
            ));
        }
        Ok(OcrJobHandle::new("fake-op"))
    }

    async fn fetch(&self, _handle: &OcrJobHandle) -> anyhow::Result<ReadResult> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if !self.fetch_delay.is_zero() {
            tokio::time::sleep(self.fetch_delay).await;
        }
        if self.fail_fetch {
            anyhow::bail!("connection reset");
        }
        let next = self.pending.lock().unwrap().pop_front();
        Ok(match next {
            Some(status) => ReadResult {
                status,
                document: None,
            },
            None => ReadResult {
                status: self.terminal.clone(),
                document: Some(self.document.clone()),
            },
        })
    }
}

/// How the fake entity service answers one batch.
pub enum BatchReply {
    /// The whole call fails.
    Error,
    /// Echo every document except these line indices, which come back errored.
    FailIds(Vec<usize>),
    /// Return exactly these outcomes.
    Custom(Vec<DocumentOutcome>),
}

/// Entity service that echoes one entity per document unless told otherwise.
///
/// Batches are identified by `first id / 5`.
#[derive(Default)]
pub struct FakeEntities {
    replies: HashMap<usize, BatchReply>,
    reversed: bool,
    staggered: bool,
    calls: Mutex<Vec<Vec<TextDocument>>>,
}

impl FakeEntities {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_reply(mut self, batch: usize, reply: BatchReply) -> Self {
        self.replies.insert(batch, reply);
        self
    }

    /// Answer in reverse document order.
    pub fn reversed(mut self) -> Self {
        self.reversed = true;
        self
    }

    /// Earlier batches take longer, so later ones finish first.
    pub fn with_staggered_delays(mut self) -> Self {
        self.staggered = true;
        self
    }

    pub fn build(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn calls(&self) -> Vec<Vec<TextDocument>> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl EntityService for FakeEntities {
    fn name(&self) -> &str {
        "fake_entities"
    }

    async fn recognize(&self, documents: &[TextDocument]) -> anyhow::Result<Vec<DocumentOutcome>> {
        self.calls.lock().unwrap().push(documents.to_vec());

        let batch = documents
            .first()
            .and_then(|d| d.id.parse::<usize>().ok())
            .map(|id| id / 5)
            .unwrap_or(0);

        if self.staggered {
            let delay = 10usize.saturating_sub(batch) * 3;
            tokio::time::sleep(Duration::from_millis(delay as u64)).await;
        }

        let failing: &[usize] = match self.replies.get(&batch) {
            Some(BatchReply::Error) => anyhow::bail!("transport error"),
            Some(BatchReply::Custom(outcomes)) => return Ok(outcomes.clone()),
            Some(BatchReply::FailIds(ids)) => ids,
            None => &[],
        };

        let mut outcomes: Vec<DocumentOutcome> = documents
            .iter()
            .map(|doc| {
                let failed = doc
                    .id
                    .parse::<usize>()
                    .map(|id| failing.contains(&id))
                    .unwrap_or(false);
                if failed {
                    DocumentOutcome::Failed {
                        id: doc.id.clone(),
                        code: "InvalidDocument".to_string(),
                        message: "rejected".to_string(),
                    }
                } else {
                    DocumentOutcome::Recognized {
                        id: doc.id.clone(),
                        entities: vec![entity(&doc.text)],
                    }
                }
            })
            .collect();

        if self.reversed {
            outcomes.reverse();
        }
        Ok(outcomes)
    }
}
