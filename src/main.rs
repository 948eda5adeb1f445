//! Image Entity Extractor - OCR an image, then annotate each line with named entities.

mod cancel;
mod config;
mod entities;
mod error;
mod lines;
mod ocr;
mod pipeline;
mod poller;
mod schema;
#[cfg(test)]
mod testing;
mod upload;

use anyhow::Context;
use axum::{
    extract::{DefaultBodyLimit, Multipart, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use cancel::CancelToken;
use config::{Credentials, Settings};
use entities::text_analytics::TextAnalyticsClient;
use error::{InputError, PipelineError};
use ocr::azure_read::AzureReadClient;
use ocr::ImageSource;
use pipeline::Pipeline;
use schema::ExtractionReport;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use upload::TempUpload;

/// Application state shared across handlers.
#[derive(Clone)]
struct AppState {
    pipeline: Arc<Pipeline>,
    settings: Arc<Settings>,
    /// Cancelled on shutdown; every in-flight extraction watches it.
    shutdown: CancelToken,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "image_entity_extractor=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let settings = Settings::load()?;
    let credentials = Credentials::from_env()?;

    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(settings.http.request_timeout_secs))
        .build()
        .context("Failed to build HTTP client")?;

    let ocr = Arc::new(AzureReadClient::new(http.clone(), &credentials.vision));
    let entities = Arc::new(TextAnalyticsClient::new(
        http,
        &credentials.language,
        settings.batch.language.clone(),
    ));
    info!(
        "Clients initialized (vision: {}, language: {})",
        credentials.vision.endpoint, credentials.language.endpoint
    );

    tokio::fs::create_dir_all(&settings.upload.dir)
        .await
        .with_context(|| format!("Failed to create upload dir {}", settings.upload.dir))?;

    let state = AppState {
        pipeline: Arc::new(Pipeline::new(ocr, entities, &settings)),
        settings: Arc::new(settings.clone()),
        shutdown: CancelToken::new(),
    };
    let shutdown = state.shutdown.clone();

    let app = Router::new()
        .route("/health", get(health))
        .route("/extract", post(extract))
        // Multipart framing on top of the image itself
        .layer(DefaultBodyLimit::max(settings.upload.max_bytes + 64 * 1024))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&settings.server.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", settings.server.bind_addr))?;
    info!("Server listening on http://{}", settings.server.bind_addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown))
        .await?;

    Ok(())
}

async fn shutdown_signal(token: CancelToken) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested, cancelling in-flight extractions");
    token.cancel();
}

// ============================================================================
// Handlers
// ============================================================================

/// Health check endpoint.
async fn health() -> &'static str {
    "ok"
}

#[derive(Default)]
struct ExtractForm {
    file: Option<(String, Vec<u8>)>,
    url: Option<String>,
}

/// Read the `image_file` / `image_url` parts. Empty parts count as absent.
async fn read_form(multipart: &mut Multipart) -> Result<ExtractForm, (StatusCode, String)> {
    let mut form = ExtractForm::default();

    while let Some(field) = multipart.next_field().await.map_err(|e| {
        (StatusCode::BAD_REQUEST, format!("Multipart error: {}", e))
    })? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "image_file" => {
                let filename = field.file_name().unwrap_or_default().to_string();
                let data = field.bytes().await.map_err(|e| {
                    (StatusCode::BAD_REQUEST, format!("Failed to read file: {}", e))
                })?;
                if !data.is_empty() {
                    form.file = Some((filename, data.to_vec()));
                }
            }
            "image_url" => {
                let url = field.text().await.map_err(|e| {
                    (StatusCode::BAD_REQUEST, format!("Failed to read image_url: {}", e))
                })?;
                if !url.trim().is_empty() {
                    form.url = Some(url);
                }
            }
            other => debug!("Ignoring multipart field {:?}", other),
        }
    }

    Ok(form)
}

/// Accept an uploaded image or an image URL and return its lines with entities.
async fn extract(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<ExtractionReport>, (StatusCode, String)> {
    let form = read_form(&mut multipart).await?;
    let upload_settings = &state.settings.upload;

    // The staged file must outlive the pipeline run and is removed on drop.
    let (source, staged) = if let Some((filename, data)) = form.file {
        upload::validate_upload(&filename, &data, upload_settings).map_err(input_error)?;

        let staged = TempUpload::stage(Path::new(&upload_settings.dir), &filename, &data)
            .await
            .map_err(internal_error)?;
        let data = staged.read().await.map_err(internal_error)?;
        info!(
            "Received file: {} ({} bytes), staged at {:?}",
            filename,
            data.len(),
            staged.path()
        );

        let source = ImageSource::Bytes {
            filename: upload::secure_filename(&filename),
            data,
        };
        (source, Some(staged))
    } else if let Some(url) = form.url {
        let url = upload::validate_url(&url).map_err(input_error)?;
        info!("Received image URL: {}", url);
        (ImageSource::Url { url }, None)
    } else {
        return Err(input_error(InputError::Missing));
    };

    let result = state.pipeline.run(source, &state.shutdown).await;
    drop(staged);

    let report = result.map_err(|e| {
        error!("Extraction failed: {}", e);
        pipeline_error(e)
    })?;
    Ok(Json(report))
}

// ============================================================================
// Error mapping
// ============================================================================

fn input_error(e: InputError) -> (StatusCode, String) {
    let status = match e {
        InputError::TooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
        _ => StatusCode::BAD_REQUEST,
    };
    (status, e.to_string())
}

fn pipeline_error(e: PipelineError) -> (StatusCode, String) {
    let status = match e {
        PipelineError::ServiceUnavailable { .. } => StatusCode::BAD_GATEWAY,
        PipelineError::PollTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        PipelineError::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status, e.to_string())
}

fn internal_error(e: anyhow::Error) -> (StatusCode, String) {
    error!("Upload staging failed: {:#}", e);
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        "Failed to stage upload".to_string(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_input_errors_map_to_client_statuses() {
        assert_eq!(
            input_error(InputError::Missing).0,
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            input_error(InputError::DisallowedExtension("pdf".into())).0,
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            input_error(InputError::TooLarge { limit: 1 }).0,
            StatusCode::PAYLOAD_TOO_LARGE
        );
    }

    #[test]
    fn test_pipeline_errors_map_to_gateway_statuses() {
        let unavailable = PipelineError::unavailable("OCR service", anyhow::anyhow!("refused"));
        let (status, body) = pipeline_error(unavailable);
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert!(body.contains("refused"));

        let timeout = PipelineError::PollTimeout {
            operation_id: "op".into(),
            waited: Duration::from_secs(120),
            last_status: "running".into(),
        };
        assert_eq!(pipeline_error(timeout).0, StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(
            pipeline_error(PipelineError::Cancelled).0,
            StatusCode::SERVICE_UNAVAILABLE
        );
    }
}
