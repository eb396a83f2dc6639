use serde::Deserialize;

/// Root application configuration. Loaded from environment variables with
/// the prefix `PIXEL_RELAY__`; the handful of flat names recognized by the
/// deployment platform (`PIPEDRIVE_API_KEY`, `ENVIRONMENT`, ...) overlay the
/// prefixed form so secrets stay in the secret store.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_environment")]
    pub environment: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub pipedrive: PipedriveConfig,
    #[serde(default)]
    pub newsletter: NewsletterConfig,
    #[serde(default)]
    pub archive: ArchiveConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    #[serde(default = "default_redis_url")]
    pub url: String,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipedriveConfig {
    /// Injected from the secret store; never committed.
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_pipedrive_base_url")]
    pub base_url: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct NewsletterConfig {
    #[serde(default)]
    pub api_url: Option<String>,
    #[serde(default)]
    pub auth_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ArchiveConfig {
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_archive_days")]
    pub days: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,
    #[serde(default = "default_sync_delay_secs")]
    pub sync_delay_secs: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_page_cap")]
    pub page_cap: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IngestConfig {
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
    #[serde(default = "default_tracking_limit")]
    pub tracking_limit_per_min: u32,
}

fn default_environment() -> String {
    "development".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_http_port() -> u16 {
    8080
}
fn default_metrics_port() -> u16 {
    9091
}
fn default_db_path() -> String {
    "pixel_relay.db".to_string()
}
fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}
fn default_connect_timeout_ms() -> u64 {
    5000
}
fn default_pipedrive_base_url() -> String {
    "https://api.pipedrive.com/v1".to_string()
}
fn default_timeout_ms() -> u64 {
    5000
}
fn default_archive_days() -> u32 {
    90
}
fn default_tick_interval_secs() -> u64 {
    300
}
fn default_sync_delay_secs() -> u64 {
    420
}
fn default_batch_size() -> usize {
    50
}
fn default_max_concurrency() -> usize {
    8
}
fn default_page_cap() -> usize {
    10
}
fn default_max_body_bytes() -> usize {
    65_536
}
fn default_tracking_limit() -> u32 {
    100
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            http_port: default_http_port(),
            metrics_port: default_metrics_port(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

impl Default for PipedriveConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: default_pipedrive_base_url(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            days: default_archive_days(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: default_tick_interval_secs(),
            sync_delay_secs: default_sync_delay_secs(),
            batch_size: default_batch_size(),
            max_concurrency: default_max_concurrency(),
            page_cap: default_page_cap(),
        }
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            max_body_bytes: default_max_body_bytes(),
            tracking_limit_per_min: default_tracking_limit(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            environment: default_environment(),
            log_level: default_log_level(),
            api: ApiConfig::default(),
            database: DatabaseConfig::default(),
            redis: RedisConfig::default(),
            pipedrive: PipedriveConfig::default(),
            newsletter: NewsletterConfig::default(),
            archive: ArchiveConfig::default(),
            scheduler: SchedulerConfig::default(),
            ingest: IngestConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn load() -> Result<Self, config::ConfigError> {
        let builder = config::Config::builder().add_source(
            config::Environment::with_prefix("PIXEL_RELAY")
                .separator("__")
                .try_parsing(true),
        );

        let mut cfg: AppConfig = builder.build()?.try_deserialize()?;
        cfg.apply_platform_env();
        Ok(cfg)
    }

    /// Overlay the flat platform-level variable names onto the nested config.
    fn apply_platform_env(&mut self) {
        if let Ok(v) = std::env::var("ENVIRONMENT") {
            self.environment = v;
        }
        if let Ok(v) = std::env::var("LOG_LEVEL") {
            self.log_level = v;
        }
        if let Ok(v) = std::env::var("PIPEDRIVE_API_KEY") {
            self.pipedrive.api_key = Some(v);
        }
        if let Ok(v) = std::env::var("NEWSLETTER_API_URL") {
            self.newsletter.api_url = Some(v);
        }
        if let Ok(v) = std::env::var("NEWSLETTER_AUTH_TOKEN") {
            self.newsletter.auth_token = Some(v);
        }
        if let Ok(v) = std::env::var("ARCHIVE_ENDPOINT") {
            self.archive.endpoint = Some(v);
        }
        if let Ok(v) = std::env::var("ARCHIVE_DAYS") {
            if let Ok(days) = v.parse() {
                self.archive.days = days;
            }
        }
    }

    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }
}
