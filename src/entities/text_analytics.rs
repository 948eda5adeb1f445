//! Azure Text Analytics (v3.1) named entity recognition client.

use super::{DocumentOutcome, EntityService, TextDocument};
use crate::config::{ServiceCredentials, SERVICE_MAX_BATCH_SIZE};
use crate::schema::EntityAnnotation;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

const API_PATH: &str = "text/analytics/v3.1/entities/recognition/general";

#[derive(Clone)]
pub struct TextAnalyticsClient {
    client: reqwest::Client,
    endpoint: String,
    key: String,
    language: String,
}

impl TextAnalyticsClient {
    pub fn new(
        client: reqwest::Client,
        credentials: &ServiceCredentials,
        language: impl Into<String>,
    ) -> Self {
        Self {
            client,
            endpoint: credentials.endpoint.clone(),
            key: credentials.key.clone(),
            language: language.into(),
        }
    }

    fn url(&self) -> String {
        format!("{}/{}", self.endpoint, API_PATH)
    }
}

// ============================================================================
// Request/Response types
// ============================================================================

#[derive(Debug, Serialize)]
struct RecognizeRequest<'a> {
    documents: Vec<RequestDocument<'a>>,
}

#[derive(Debug, Serialize)]
struct RequestDocument<'a> {
    id: &'a str,
    text: &'a str,
    language: &'a str,
}

#[derive(Debug, Deserialize)]
struct RecognizeResponse {
    #[serde(default)]
    documents: Vec<DocumentEntities>,
    #[serde(default)]
    errors: Vec<DocumentError>,
}

#[derive(Debug, Deserialize)]
struct DocumentEntities {
    id: String,
    #[serde(default)]
    entities: Vec<ResponseEntity>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResponseEntity {
    text: String,
    category: String,
    #[serde(default)]
    subcategory: Option<String>,
    confidence_score: f64,
}

#[derive(Debug, Deserialize)]
struct DocumentError {
    id: String,
    error: ErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

impl RecognizeResponse {
    /// Successful documents first, in response order, then errored ones.
    fn into_outcomes(self) -> Vec<DocumentOutcome> {
        let recognized = self.documents.into_iter().map(|doc| DocumentOutcome::Recognized {
            id: doc.id,
            entities: doc
                .entities
                .into_iter()
                .map(|e| EntityAnnotation {
                    text: e.text,
                    category: e.category,
                    subcategory: e.subcategory,
                    confidence_score: e.confidence_score,
                })
                .collect(),
        });
        let failed = self.errors.into_iter().map(|e| DocumentOutcome::Failed {
            id: e.id,
            code: e.error.code,
            message: e.error.message,
        });
        recognized.chain(failed).collect()
    }
}

#[async_trait::async_trait]
impl EntityService for TextAnalyticsClient {
    fn name(&self) -> &str {
        "azure_text_analytics"
    }

    async fn recognize(&self, documents: &[TextDocument]) -> Result<Vec<DocumentOutcome>> {
        if documents.len() > SERVICE_MAX_BATCH_SIZE {
            anyhow::bail!(
                "{} documents exceed the service limit of {}",
                documents.len(),
                SERVICE_MAX_BATCH_SIZE
            );
        }

        let request = RecognizeRequest {
            documents: documents
                .iter()
                .map(|d| RequestDocument {
                    id: &d.id,
                    text: &d.text,
                    language: &self.language,
                })
                .collect(),
        };

        let response = self
            .client
            .post(self.url())
            .header("Ocp-Apim-Subscription-Key", &self.key)
            .json(&request)
            .send()
            .await
            .context("Failed to send request to Text Analytics")?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            anyhow::bail!("Text Analytics API error ({}): {}", status, error_text);
        }

        let raw = response.text().await?;
        debug!("Text Analytics response: {} bytes", raw.len());
        parse_response(&raw)
    }
}

fn parse_response(raw: &str) -> Result<Vec<DocumentOutcome>> {
    let response: RecognizeResponse =
        serde_json::from_str(raw).context("Failed to parse Text Analytics response")?;
    Ok(response.into_outcomes())
}
