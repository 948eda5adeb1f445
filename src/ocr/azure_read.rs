//! Azure Computer Vision Read API (v3.2) OCR client.

use super::{
    ImageSource, JobStatus, OcrDocument, OcrJobHandle, OcrLine, OcrService, ReadResult, TextRegion,
};
use crate::config::ServiceCredentials;
use crate::error::PipelineError;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

const SERVICE: &str = "OCR service";
const API_PATH: &str = "vision/v3.2/read";

pub struct AzureReadClient {
    endpoint: String,
    key: String,
    client: reqwest::Client,
}

impl AzureReadClient {
    pub fn new(client: reqwest::Client, credentials: &ServiceCredentials) -> Self {
        Self {
            endpoint: credentials.endpoint.clone(),
            key: credentials.key.clone(),
            client,
        }
    }

    fn analyze_url(&self) -> String {
        format!("{}/{}/analyze", self.endpoint, API_PATH)
    }

    fn result_url(&self, handle: &OcrJobHandle) -> String {
        format!("{}/{}/analyzeResults/{}", self.endpoint, API_PATH, handle)
    }
}

// ── Read API request/response types ─────────────────────────────────────────

#[derive(Serialize)]
struct UrlRequest<'a> {
    url: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReadOperationResponse {
    status: String,
    #[serde(default)]
    analyze_result: Option<AnalyzeResult>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnalyzeResult {
    #[serde(default)]
    read_results: Vec<ReadPage>,
}

#[derive(Debug, Deserialize)]
struct ReadPage {
    #[serde(default)]
    lines: Vec<ReadLine>,
}

#[derive(Debug, Deserialize)]
struct ReadLine {
    text: String,
}

impl ReadOperationResponse {
    fn into_read_result(self) -> ReadResult {
        let status = JobStatus::parse(&self.status);
        let document = match (&status, self.analyze_result) {
            (JobStatus::Succeeded, Some(result)) => Some(OcrDocument {
                regions: result
                    .read_results
                    .into_iter()
                    .map(|page| TextRegion {
                        lines: page
                            .lines
                            .into_iter()
                            .map(|l| OcrLine { text: l.text })
                            .collect(),
                    })
                    .collect(),
            }),
            _ => None,
        };
        ReadResult { status, document }
    }
}

// ── Service implementation ──────────────────────────────────────────────────

#[async_trait::async_trait]
impl OcrService for AzureReadClient {
    fn name(&self) -> &str {
        "azure_read"
    }

    async fn submit(&self, source: &ImageSource) -> Result<OcrJobHandle, PipelineError> {
        let request = self
            .client
            .post(self.analyze_url())
            .header("Ocp-Apim-Subscription-Key", &self.key);

        let request = match source {
            ImageSource::Url { url } => request.json(&UrlRequest { url }),
            ImageSource::Bytes { data, .. } => request
                .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
                .body(data.clone()),
        };

        info!("AzureReadClient: submitting {}", source.describe());

        let resp = request
            .send()
            .await
            .map_err(|e| PipelineError::unavailable(SERVICE, e))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(PipelineError::unavailable(
                SERVICE,
                anyhow::anyhow!("Read API error ({}): {}", status, text),
            ));
        }

        let location = resp
            .headers()
            .get("Operation-Location")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| {
                PipelineError::unavailable(
                    SERVICE,
                    anyhow::anyhow!("Read API response missing Operation-Location header"),
                )
            })?;

        let handle = OcrJobHandle::from_operation_location(location).ok_or_else(|| {
            PipelineError::unavailable(
                SERVICE,
                anyhow::anyhow!("Unrecognized Operation-Location: {}", location),
            )
        })?;

        info!("AzureReadClient: started operation {}", handle);
        Ok(handle)
    }

    async fn fetch(&self, handle: &OcrJobHandle) -> anyhow::Result<ReadResult> {
        let resp = self
            .client
            .get(self.result_url(handle))
            .header("Ocp-Apim-Subscription-Key", &self.key)
            .send()
            .await
            .context("Failed to query Read operation")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            anyhow::bail!("Read API error ({}): {}", status, text);
        }

        let raw_text = resp.text().await?;
        debug!(
            "AzureReadClient: operation {} response ({} bytes)",
            handle,
            raw_text.len()
        );
        parse_read_response(&raw_text)
    }
}

fn parse_read_response(raw: &str) -> anyhow::Result<ReadResult> {
    let response: ReadOperationResponse =
        serde_json::from_str(raw).context("Failed to parse Read operation response")?;
    Ok(response.into_read_result())
}
