use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Path of the SQLite database file.
    #[serde(default = "default_database_path")]
    pub database_path: String,
    /// Root directory of the content-addressed blob store.
    #[serde(default = "default_blob_directory")]
    pub blob_directory: String,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub stages: StageTimeouts,
    #[serde(default)]
    pub webhook: WebhookConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub ocr: OcrConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            blob_directory: default_blob_directory(),
            worker: WorkerConfig::default(),
            stages: StageTimeouts::default(),
            webhook: WebhookConfig::default(),
            rate_limit: RateLimitConfig::default(),
            bus: BusConfig::default(),
            ocr: OcrConfig::default(),
        }
    }
}

fn default_database_path() -> String {
    "ivingest.db".to_string()
}

fn default_blob_directory() -> String {
    "blobs".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Number of concurrent worker tasks.
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    /// Lease duration granted on acquire. Must exceed the sum of the stage
    /// timeouts plus slack.
    #[serde(default = "default_visibility_timeout_secs")]
    pub visibility_timeout_secs: u64,
    /// Attempts allowed before a job is routed to the dead state.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Cap for the idle-poll back-off sleep.
    #[serde(default = "default_idle_backoff_cap_ms")]
    pub idle_backoff_cap_ms: u64,
    /// Minimum spacing between processing.progress events per job.
    #[serde(default = "default_progress_interval_ms")]
    pub progress_interval_ms: u64,
}

fn default_worker_count() -> usize {
    num_cpus::get()
}

fn default_visibility_timeout_secs() -> u64 {
    300
}

fn default_max_attempts() -> u32 {
    3
}

fn default_idle_backoff_cap_ms() -> u64 {
    2_000
}

fn default_progress_interval_ms() -> u64 {
    500
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_count: default_worker_count(),
            visibility_timeout_secs: default_visibility_timeout_secs(),
            max_attempts: default_max_attempts(),
            idle_backoff_cap_ms: default_idle_backoff_cap_ms(),
            progress_interval_ms: default_progress_interval_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageTimeouts {
    #[serde(default = "default_parse_timeout_secs")]
    pub parse_secs: u64,
    #[serde(default = "default_extract_timeout_secs")]
    pub extract_secs: u64,
    #[serde(default = "default_persist_timeout_secs")]
    pub persist_secs: u64,
}

fn default_parse_timeout_secs() -> u64 {
    300
}

fn default_extract_timeout_secs() -> u64 {
    60
}

fn default_persist_timeout_secs() -> u64 {
    30
}

impl Default for StageTimeouts {
    fn default() -> Self {
        Self {
            parse_secs: default_parse_timeout_secs(),
            extract_secs: default_extract_timeout_secs(),
            persist_secs: default_persist_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    /// Per-delivery request timeout.
    #[serde(default = "default_webhook_timeout_secs")]
    pub timeout_secs: u64,
    /// Maximum delivery attempts per (event, subscription) pair.
    #[serde(default = "default_webhook_max_attempts")]
    pub max_attempts: u32,
    /// Bound on concurrent in-flight deliveries.
    #[serde(default = "default_webhook_concurrency")]
    pub concurrency: usize,
    /// Delay before retry k is entry min(k-1, len-1) of this table.
    #[serde(default = "default_retry_delays")]
    pub retry_delays_secs: Vec<u64>,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

fn default_retry_delays() -> Vec<u64> {
    vec![1, 5, 15, 60, 300]
}

fn default_webhook_timeout_secs() -> u64 {
    30
}

fn default_webhook_max_attempts() -> u32 {
    5
}

fn default_webhook_concurrency() -> usize {
    8
}

fn default_user_agent() -> String {
    "ivingest-webhook/1.0".to_string()
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_webhook_timeout_secs(),
            max_attempts: default_webhook_max_attempts(),
            concurrency: default_webhook_concurrency(),
            retry_delays_secs: default_retry_delays(),
            user_agent: default_user_agent(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Admit on limiter backend failure. Operators who prefer availability
    /// loss over quota overrun can turn this off.
    #[serde(default = "default_true")]
    pub fail_open: bool,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            fail_open: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Per-subscriber event queue bound; lagging subscribers lose the oldest
    /// events first.
    #[serde(default = "default_bus_capacity")]
    pub capacity: usize,
}

fn default_bus_capacity() -> usize {
    256
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            capacity: default_bus_capacity(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcrConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_languages")]
    pub languages: Vec<String>,
    #[serde(default = "default_dpi")]
    pub dpi: u32,
    /// Extracted text shorter than this (after trimming) triggers the OCR
    /// fallback for PDFs.
    #[serde(default = "default_min_text_chars")]
    pub min_text_chars: usize,
}

fn default_true() -> bool {
    true
}

fn default_languages() -> Vec<String> {
    vec!["eng".to_string()]
}

fn default_dpi() -> u32 {
    300
}

fn default_min_text_chars() -> usize {
    50
}

impl Default for OcrConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            languages: default_languages(),
            dpi: default_dpi(),
            min_text_chars: default_min_text_chars(),
        }
    }
}
