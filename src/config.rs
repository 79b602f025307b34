//! Unified Configuration Module
//!
//! Consolidates every recognized configuration key from the embedding
//! application into a single typed record with validated defaults and a
//! builder pattern. The untyped-JSON-to-typed-record conversion is the only
//! place that touches dynamically typed configuration; everything else in
//! the crate works with [`Config`] directly.

use crate::error::{TelemetryError, TelemetryResult};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// SDK operating mode, mirroring `sdkmode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum SdkMode {
    #[default]
    Normal,
    ApplicationInsights,
    Utc,
}

/// Top-level typed configuration for a telemetry [`crate::context::Logger`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub event_collector_uri: String,
    pub primary_token: String,

    pub cache: CacheConfig,
    pub transmission: TransmissionConfig,
    pub sampling: SamplingConfig,
    pub stats: StatsConfig,
    pub utc: UtcConfig,

    pub http_compress: bool,
    pub host_mode: bool,
    pub multi_tenant_enabled: bool,
    pub minimum_trace_level: u8,
    pub trace_level_mask: u32,
    pub sdk_mode: SdkMode,

    /// Tenant tokens accepted when `multi_tenant_enabled` is false.
    pub allowed_tenants: Vec<String>,
}

/// Offline store budgets (disk + memory) and worker pool sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub cache_file_path: PathBuf,
    pub cache_file_size_limit_in_bytes: u64,
    pub cache_file_full_notification_percentage: u8,
    pub cache_memory_size_limit_in_bytes: u64,
    pub cache_memory_full_notification_percentage: u8,
    pub max_db_flush_queues: usize,
}

/// Transmitter behavior: concurrency, backoff, retries, teardown deadline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransmissionConfig {
    pub max_pending_http_requests: usize,
    pub max_teardown_upload_time_in_sec: u64,
    pub backoff_config: String,
    pub clock_skew_enabled: bool,
    pub max_blob_size: usize,
    pub max_retry_count: u32,
    /// Cadence, in milliseconds, of the dispatch scheduler's idle tick.
    pub tick_interval_ms: u64,
}

/// Deterministic per-event-name sampling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplingConfig {
    pub rate: u8,
}

/// Internal diagnostics cadence and tenant routing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsConfig {
    pub interval_seconds: u64,
    pub token_int: String,
    pub token_prod: String,
}

/// UTC-mode parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UtcConfig {
    pub provider_group_id: String,
    pub active: bool,
    pub large_payloads: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            event_collector_uri: String::new(),
            primary_token: String::new(),
            cache: CacheConfig::default(),
            transmission: TransmissionConfig::default(),
            sampling: SamplingConfig::default(),
            stats: StatsConfig::default(),
            utc: UtcConfig::default(),
            http_compress: true,
            host_mode: false,
            multi_tenant_enabled: true,
            minimum_trace_level: 0,
            trace_level_mask: u32::MAX,
            sdk_mode: SdkMode::default(),
            allowed_tenants: Vec::new(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_file_path: PathBuf::from("./telem_offline.db"),
            cache_file_size_limit_in_bytes: 24 * 1024 * 1024,
            cache_file_full_notification_percentage: 75,
            cache_memory_size_limit_in_bytes: 4 * 1024 * 1024,
            cache_memory_full_notification_percentage: 75,
            max_db_flush_queues: 3,
        }
    }
}

impl Default for TransmissionConfig {
    fn default() -> Self {
        Self {
            max_pending_http_requests: 4,
            max_teardown_upload_time_in_sec: 5,
            backoff_config: "E,3000,300000,2,1".to_string(),
            clock_skew_enabled: false,
            max_blob_size: 3 * 1024 * 1024,
            max_retry_count: 5,
            tick_interval_ms: 30_000,
        }
    }
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self { rate: 100 }
    }
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            interval_seconds: 0,
            token_int: String::new(),
            token_prod: String::new(),
        }
    }
}

impl Default for UtcConfig {
    fn default() -> Self {
        Self {
            provider_group_id: String::new(),
            active: false,
            large_payloads: false,
        }
    }
}

/// Configuration builder with validated defaults.
///
/// Every setter takes ownership and returns `Self`; `build()` runs
/// validation once at the end rather than per-setter.
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    pub fn event_collector_uri(mut self, uri: impl Into<String>) -> Self {
        self.config.event_collector_uri = uri.into();
        self
    }

    pub fn primary_token(mut self, token: impl Into<String>) -> Self {
        self.config.primary_token = token.into();
        self
    }

    pub fn cache(mut self, cache: CacheConfig) -> Self {
        self.config.cache = cache;
        self
    }

    pub fn transmission(mut self, transmission: TransmissionConfig) -> Self {
        self.config.transmission = transmission;
        self
    }

    pub fn sampling(mut self, sampling: SamplingConfig) -> Self {
        self.config.sampling = sampling;
        self
    }

    pub fn stats(mut self, stats: StatsConfig) -> Self {
        self.config.stats = stats;
        self
    }

    pub fn utc(mut self, utc: UtcConfig) -> Self {
        self.config.utc = utc;
        self
    }

    pub fn multi_tenant_enabled(mut self, enabled: bool) -> Self {
        self.config.multi_tenant_enabled = enabled;
        self
    }

    pub fn allowed_tenants(mut self, tenants: Vec<String>) -> Self {
        self.config.allowed_tenants = tenants;
        self
    }

    pub fn sdk_mode(mut self, mode: SdkMode) -> Self {
        self.config.sdk_mode = mode;
        self
    }

    pub fn build(self) -> TelemetryResult<Config> {
        validate(&self.config)?;
        Ok(self.config)
    }
}

fn validate(config: &Config) -> TelemetryResult<()> {
    if config.event_collector_uri.is_empty() {
        return Err(TelemetryError::ConfigInvalid {
            field: "eventCollectorUri".to_string(),
            reason: "must not be empty".to_string(),
        });
    }

    if config.sampling.rate > 100 {
        return Err(TelemetryError::ConfigInvalid {
            field: "sample.rate".to_string(),
            reason: format!("{} is outside 0..=100", config.sampling.rate),
        });
    }

    if config.minimum_trace_level > 6 {
        return Err(TelemetryError::ConfigInvalid {
            field: "minimumTraceLevel".to_string(),
            reason: format!("{} is outside 0..=6", config.minimum_trace_level),
        });
    }

    if config.cache.cache_file_full_notification_percentage > 100
        || config.cache.cache_memory_full_notification_percentage > 100
    {
        return Err(TelemetryError::ConfigInvalid {
            field: "cache full-notification percentage".to_string(),
            reason: "must be within 0..=100".to_string(),
        });
    }

    if config.transmission.max_blob_size == 0 {
        return Err(TelemetryError::ConfigInvalid {
            field: "tpm.maxBlobSize".to_string(),
            reason: "must be greater than 0".to_string(),
        });
    }

    if config.transmission.max_pending_http_requests == 0 {
        return Err(TelemetryError::ConfigInvalid {
            field: "maxPendingHTTPRequests".to_string(),
            reason: "must be greater than 0".to_string(),
        });
    }

    crate::transport::backoff::BackoffPolicy::parse(&config.transmission.backoff_config).map_err(
        |reason| TelemetryError::ConfigInvalid {
            field: "tpm.backoffConfig".to_string(),
            reason,
        },
    )?;

    Ok(())
}

/// Converts an untyped JSON configuration document into the typed [`Config`].
///
/// The only function in the crate permitted to look at dynamically typed
/// configuration; everything downstream works with [`Config`] directly.
pub fn load_config_json(document: &serde_json::Value) -> TelemetryResult<Config> {
    let mut builder = ConfigBuilder::new();

    if let Some(uri) = document.get("eventCollectorUri").and_then(|v| v.as_str()) {
        builder = builder.event_collector_uri(uri);
    }
    if let Some(token) = document.get("primaryToken").and_then(|v| v.as_str()) {
        builder = builder.primary_token(token);
    }

    let mut cache = CacheConfig::default();
    if let Some(path) = document.get("cacheFilePath").and_then(|v| v.as_str()) {
        cache.cache_file_path = PathBuf::from(path);
    }
    if let Some(n) = document
        .get("cacheFileSizeLimitInBytes")
        .and_then(|v| v.as_u64())
    {
        cache.cache_file_size_limit_in_bytes = n;
    }
    if let Some(n) = document
        .get("cacheFileFullNotificationPercentage")
        .and_then(|v| v.as_u64())
    {
        cache.cache_file_full_notification_percentage = n as u8;
    }
    if let Some(n) = document
        .get("cacheMemorySizeLimitInBytes")
        .and_then(|v| v.as_u64())
    {
        cache.cache_memory_size_limit_in_bytes = n;
    }
    if let Some(n) = document
        .get("cacheMemoryFullNotificationPercentage")
        .and_then(|v| v.as_u64())
    {
        cache.cache_memory_full_notification_percentage = n as u8;
    }
    if let Some(n) = document.get("maxDBFlushQueues").and_then(|v| v.as_u64()) {
        cache.max_db_flush_queues = n as usize;
    }
    builder = builder.cache(cache);

    let mut transmission = TransmissionConfig::default();
    if let Some(n) = document
        .get("maxPendingHTTPRequests")
        .and_then(|v| v.as_u64())
    {
        transmission.max_pending_http_requests = n as usize;
    }
    if let Some(n) = document
        .get("maxTeardownUploadTimeInSec")
        .and_then(|v| v.as_u64())
    {
        transmission.max_teardown_upload_time_in_sec = n;
    }
    if let Some(s) = document.get("tpm.backoffConfig").and_then(|v| v.as_str()) {
        transmission.backoff_config = s.to_string();
    }
    if let Some(b) = document.get("tpm.clockSkewEnabled").and_then(|v| v.as_bool()) {
        transmission.clock_skew_enabled = b;
    }
    if let Some(n) = document.get("tpm.maxBlobSize").and_then(|v| v.as_u64()) {
        transmission.max_blob_size = n as usize;
    }
    if let Some(n) = document.get("tpm.maxRetryCount").and_then(|v| v.as_u64()) {
        transmission.max_retry_count = n as u32;
    }
    builder = builder.transmission(transmission);

    if let Some(n) = document.get("sample.rate").and_then(|v| v.as_u64()) {
        builder = builder.sampling(SamplingConfig { rate: n as u8 });
    }

    let mut stats = StatsConfig::default();
    if let Some(n) = document.get("stats.interval").and_then(|v| v.as_u64()) {
        stats.interval_seconds = n;
    }
    if let Some(s) = document.get("stats.tokenInt").and_then(|v| v.as_str()) {
        stats.token_int = s.to_string();
    }
    if let Some(s) = document.get("stats.tokenProd").and_then(|v| v.as_str()) {
        stats.token_prod = s.to_string();
    }
    builder = builder.stats(stats);

    let mut utc = UtcConfig::default();
    if let Some(s) = document.get("utc.providerGroupId").and_then(|v| v.as_str()) {
        utc.provider_group_id = s.to_string();
    }
    if let Some(b) = document.get("utc.active").and_then(|v| v.as_bool()) {
        utc.active = b;
    }
    if let Some(b) = document.get("utc.largePayloads").and_then(|v| v.as_bool()) {
        utc.large_payloads = b;
    }
    builder = builder.utc(utc);

    if let Some(b) = document.get("multiTenantEnabled").and_then(|v| v.as_bool()) {
        builder = builder.multi_tenant_enabled(b);
    }

    if let Some(s) = document.get("sdkmode").and_then(|v| v.as_str()) {
        let mode = match s {
            "application-insights" => SdkMode::ApplicationInsights,
            "utc" => SdkMode::Utc,
            _ => SdkMode::Normal,
        };
        builder = builder.sdk_mode(mode);
    }

    let mut config = builder.build()?;

    if let Some(n) = document.get("minimumTraceLevel").and_then(|v| v.as_u64()) {
        config.minimum_trace_level = n as u8;
    }
    if let Some(n) = document.get("traceLevelMask").and_then(|v| v.as_u64()) {
        config.trace_level_mask = n as u32;
    }
    if let Some(b) = document.get("hostMode").and_then(|v| v.as_bool()) {
        config.host_mode = b;
    }
    if let Some(b) = document.get("http.compress").and_then(|v| v.as_bool()) {
        config.http_compress = b;
    }

    validate(&config)?;
    Ok(config)
}

impl CacheConfig {
    pub fn memory_full_notification_bytes(&self) -> u64 {
        self.cache_memory_size_limit_in_bytes
            * self.cache_memory_full_notification_percentage as u64
            / 100
    }

    pub fn disk_full_notification_bytes(&self) -> u64 {
        self.cache_file_size_limit_in_bytes
            * self.cache_file_full_notification_percentage as u64
            / 100
    }
}

/// Teardown deadline as a [`Duration`].
impl TransmissionConfig {
    pub fn teardown_deadline(&self) -> Duration {
        Duration::from_secs(self.max_teardown_upload_time_in_sec)
    }
}
