//! Service configuration.
//!
//! Credentials come from the environment (optionally via `.env`). Tuning
//! knobs come from an optional JSON file; every field has a default so an
//! absent file or a partial one is fine.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::entities::ResultOrder;
use crate::poller::PollPolicy;

/// Largest document count the entity service accepts per request.
pub const SERVICE_MAX_BATCH_SIZE: usize = 5;

const DEFAULT_SETTINGS_PATH: &str = "config/pipeline.json";

/// Endpoint plus subscription key for one Azure Cognitive Services resource.
#[derive(Clone)]
pub struct ServiceCredentials {
    pub endpoint: String,
    pub key: String,
}

impl std::fmt::Debug for ServiceCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceCredentials")
            .field("endpoint", &self.endpoint)
            .field("key", &"<redacted>")
            .finish()
    }
}

impl ServiceCredentials {
    fn from_env(endpoint_var: &str, key_var: &str) -> Result<Self> {
        let endpoint = std::env::var(endpoint_var)
            .with_context(|| format!("{} environment variable not set", endpoint_var))?;
        let key = std::env::var(key_var)
            .with_context(|| format!("{} environment variable not set", key_var))?;

        Ok(Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            key,
        })
    }
}

/// Credentials for both remote services.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub vision: ServiceCredentials,
    pub language: ServiceCredentials,
}

impl Credentials {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            vision: ServiceCredentials::from_env(
                "AZURE_COMPUTER_VISION_ENDPOINT",
                "AZURE_COMPUTER_VISION_SUBSCRIPTION_KEY",
            )?,
            language: ServiceCredentials::from_env(
                "AZURE_TEXT_ANALYTICS_ENDPOINT",
                "AZURE_TEXT_ANALYTICS_SUBSCRIPTION_KEY",
            )?,
        })
    }
}

/// All tunable settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub poll: PollSettings,
    pub batch: BatchSettings,
    pub upload: UploadSettings,
    pub http: HttpSettings,
    pub server: ServerSettings,
}

/// OCR job polling.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollSettings {
    /// First wait between status checks.
    pub initial_interval_ms: u64,
    /// Cap for the growing wait.
    pub max_interval_ms: u64,
    /// Multiplier applied to the wait after each pending status.
    pub backoff_factor: f64,
    /// Total time budget for one job.
    pub timeout_secs: u64,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            initial_interval_ms: 1_000,
            max_interval_ms: 5_000,
            backoff_factor: 1.5,
            timeout_secs: 120,
        }
    }
}

impl PollSettings {
    pub fn policy(&self) -> PollPolicy {
        PollPolicy {
            initial_interval: Duration::from_millis(self.initial_interval_ms),
            max_interval: Duration::from_millis(self.max_interval_ms),
            backoff_factor: self.backoff_factor,
            timeout: Duration::from_secs(self.timeout_secs),
        }
    }
}

/// Entity recognition batching.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchSettings {
    pub max_size: usize,
    /// Number of batch calls allowed in flight at once (1 = sequential).
    pub concurrency: usize,
    /// Language hint sent with every document.
    pub language: String,
    pub order: ResultOrder,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            max_size: SERVICE_MAX_BATCH_SIZE,
            concurrency: 1,
            language: "en".to_string(),
            order: ResultOrder::Input,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadSettings {
    pub dir: String,
    pub allowed_extensions: Vec<String>,
    pub max_bytes: usize,
}

impl Default for UploadSettings {
    fn default() -> Self {
        Self {
            dir: "uploads".to_string(),
            allowed_extensions: ["png", "jpg", "jpeg", "gif"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            max_bytes: 20 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpSettings {
    /// Timeout for each outbound request to either service.
    pub request_timeout_secs: u64,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            request_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub bind_addr: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:3000".to_string(),
        }
    }
}

impl Settings {
    /// Load settings from `PIPELINE_CONFIG`, or `config/pipeline.json` when it
    /// exists, or defaults.
    pub fn load() -> Result<Self> {
        match std::env::var("PIPELINE_CONFIG") {
            Ok(path) => Self::load_from_file(Path::new(&path)),
            Err(_) => {
                let path = Path::new(DEFAULT_SETTINGS_PATH);
                if path.exists() {
                    Self::load_from_file(path)
                } else {
                    info!("No settings file found, using defaults");
                    let settings = Self::default();
                    settings.validate()?;
                    Ok(settings)
                }
            }
        }
    }

    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings: {:?}", path))?;
        let settings = Self::from_json(&content)
            .with_context(|| format!("Invalid settings in {:?}", path))?;
        info!("Loaded settings from {:?}", path);
        Ok(settings)
    }

    pub fn from_json(content: &str) -> Result<Self> {
        let settings: Settings =
            serde_json::from_str(content).context("Failed to parse settings JSON")?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch.max_size == 0 || self.batch.max_size > SERVICE_MAX_BATCH_SIZE {
            anyhow::bail!(
                "batch.max_size must be between 1 and {}, got {}",
                SERVICE_MAX_BATCH_SIZE,
                self.batch.max_size
            );
        }
        if self.batch.concurrency == 0 {
            anyhow::bail!("batch.concurrency must be at least 1");
        }
        if self.poll.initial_interval_ms == 0 {
            anyhow::bail!("poll.initial_interval_ms must be positive");
        }
        if self.poll.max_interval_ms < self.poll.initial_interval_ms {
            anyhow::bail!("poll.max_interval_ms must be >= poll.initial_interval_ms");
        }
        if self.poll.backoff_factor.is_nan() || self.poll.backoff_factor < 1.0 {
            anyhow::bail!("poll.backoff_factor must be >= 1.0");
        }
        if self.upload.allowed_extensions.is_empty() {
            anyhow::bail!("upload.allowed_extensions must not be empty");
        }
        Ok(())
    }
}
