//! # CM600 Exporter
//!
//! Polls the DOCSIS status page served by a Netgear CM600 cable modem,
//! extracts the per-channel signal statistics from its downstream and
//! upstream tables, and republishes them as labeled Prometheus gauges.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                              CM600 EXPORTER                              │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │  SCRAPE → FETCHER → TABLE PARSER → SNAPSHOT → PUBLISHER → /metrics      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Features
//!
//! - **Bounded**: every collection cycle runs under a deadline and a body cap
//! - **Position-aware parsing**: column layouts are explicit and configurable
//! - **Never partial**: a single malformed cell aborts the whole cycle
//! - **Serialized**: concurrent scrapes never interleave their publication

// ============================================================================
// SECTION 1: IMPORTS & DEPENDENCIES
// ============================================================================

// ----------------------------------------------------------------------------
// Standard Library Imports
// ----------------------------------------------------------------------------
use std::fmt::{self, Debug, Display, Formatter};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

// ----------------------------------------------------------------------------
// Async Runtime - Tokio
// ----------------------------------------------------------------------------
use tokio::net::TcpListener as TokioTcpListener;
use tokio::signal;
use tokio::sync::Mutex as TokioMutex;
use tokio::task::JoinHandle as TokioJoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

// ----------------------------------------------------------------------------
// Concurrency Primitives
// ----------------------------------------------------------------------------
use parking_lot::RwLock;

// ----------------------------------------------------------------------------
// Serialization
// ----------------------------------------------------------------------------
use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};

// ----------------------------------------------------------------------------
// Error Handling
// ----------------------------------------------------------------------------
use anyhow::{Context as AnyhowContext, Result as AnyhowResult};
use thiserror::Error;

// ----------------------------------------------------------------------------
// Logging & Tracing
// ----------------------------------------------------------------------------
use tracing::level_filters::LevelFilter;
use tracing::{debug, error, info, trace, warn};
use tracing_subscriber::{
    fmt as tracing_fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter,
};

// ----------------------------------------------------------------------------
// Time & Timestamps
// ----------------------------------------------------------------------------
use chrono::{DateTime, Utc};

// ----------------------------------------------------------------------------
// Networking & HTTP
// ----------------------------------------------------------------------------
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{Html as HtmlResponse, IntoResponse, Response},
    routing::get,
    Json, Router,
};
use reqwest::{Client as HttpClient, Url};
use tower_http::trace::TraceLayer;

// ----------------------------------------------------------------------------
// HTML Parsing
// ----------------------------------------------------------------------------
use scraper::{ElementRef, Html, Selector};

// ----------------------------------------------------------------------------
// Configuration
// ----------------------------------------------------------------------------
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};

// ----------------------------------------------------------------------------
// CLI
// ----------------------------------------------------------------------------
use clap::{Parser, Subcommand, ValueEnum};

// ----------------------------------------------------------------------------
// Prometheus
// ----------------------------------------------------------------------------
use prometheus::{
    core::Collector as PrometheusCollector, Encoder, Gauge, GaugeVec, IntCounter,
    IntCounterVec, Opts, Registry as PrometheusRegistry, TextEncoder,
};

// ----------------------------------------------------------------------------
// Async Traits
// ----------------------------------------------------------------------------
use async_trait::async_trait;

// ============================================================================
// SECTION 2: CONSTANTS & VERSION INFORMATION
// ============================================================================

/// Exporter version - follows semantic versioning
pub const EXPORTER_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const EXPORTER_NAME: &str = "cm600-exporter";
pub const EXPORTER_FULL_NAME: &str = "Netgear CM600 Exporter";

// ----------------------------------------------------------------------------
// Modem Defaults
// ----------------------------------------------------------------------------

/// Status page served by the CM600 on its management address
pub const DEFAULT_MODEM_URL: &str = "http://192.168.100.1/DocsisStatus.asp";

/// Factory credentials of the CM600 web UI
pub const DEFAULT_MODEM_USERNAME: &str = "admin";
pub const DEFAULT_MODEM_PASSWORD: &str = "password";

/// Deadline for one fetch + parse cycle (seconds)
pub const DEFAULT_COLLECT_TIMEOUT_SECS: u64 = 5;

/// Hard cap on the status page body (bytes)
pub const MAX_MODEM_BODY_BYTES: usize = 2 * 1024 * 1024;

/// Minimum allowed background poll interval (seconds)
pub const MIN_POLL_INTERVAL_SECS: u64 = 1;

/// Cycles slower than this are logged as warnings (milliseconds)
pub const SLOW_COLLECTION_THRESHOLD_MS: u64 = 2_000;

/// Consecutive failed cycles before the scrape health reports `Failed`
pub const CONSECUTIVE_FAILURE_THRESHOLD: u32 = 3;

// ----------------------------------------------------------------------------
// Status Page Layout
// ----------------------------------------------------------------------------

pub const DEFAULT_DOWNSTREAM_TABLE_ID: &str = "dsTable";
pub const DEFAULT_UPSTREAM_TABLE_ID: &str = "usTable";

// ----------------------------------------------------------------------------
// Metrics & Exposition
// ----------------------------------------------------------------------------

/// Namespace prefixed to every exported metric
pub const METRIC_NAMESPACE: &str = "cm600";

/// Subsystem of the exporter's own health metrics
pub const EXPORTER_SUBSYSTEM: &str = "exporter";

/// Label names of the downstream families: channel index, then DCID
pub const DOWNSTREAM_LABELS: [&str; 2] = ["downstream", "dcid"];

/// Label names of the upstream families: channel index, then UCID
pub const UPSTREAM_LABELS: [&str; 2] = ["upstream", "ucid"];

/// Default exporter listen port
pub const DEFAULT_EXPORTER_PORT: u16 = 9191;

pub const DEFAULT_METRICS_PATH: &str = "/metrics";
pub const HEALTH_PATH: &str = "/healthz";

// ----------------------------------------------------------------------------
// Configuration Sources
// ----------------------------------------------------------------------------

pub const DEFAULT_CONFIG_PATH: &str = "cm600.toml";

/// Environment prefix; nested keys use `__`, e.g. `CM600_MODEM__URL`
pub const ENV_PREFIX: &str = "CM600_";

/// Keys whose environment values are never reinterpreted as numbers
pub const OPAQUE_STRING_KEYS: [&str; 3] = ["modem.url", "modem.username", "modem.password"];

// ============================================================================
// SECTION 3: SNAPSHOT MODEL
// ============================================================================
// Typed records produced by one parse pass of the status page. A snapshot is
// built fresh on every cycle and dropped once the publisher has consumed it.
// ============================================================================

/// Data direction between the modem and the provider network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Downstream,
    Upstream,
}

impl Display for Direction {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Downstream => write!(f, "downstream"),
            Direction::Upstream => write!(f, "upstream"),
        }
    }
}

/// One row of the downstream bonded-channel table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DownstreamChannel {
    /// 1-based position of the row in the table
    pub channel: usize,
    /// Device-reported downstream channel ID
    pub dcid: u32,
    /// QAM order, e.g. 256 for "256QAM"
    pub modulation: u32,
    pub frequency_hz: f64,
    pub power_dbmv: f64,
    pub snr_db: f64,
    pub correcteds: u64,
    pub uncorrectables: u64,
}

/// One row of the upstream bonded-channel table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UpstreamChannel {
    /// 1-based position of the row in the table
    pub channel: usize,
    /// Device-reported upstream channel ID
    pub ucid: u32,
    /// Raw channel type text ("ATDMA", "TDMA"); carried but not published
    pub channel_type: String,
    /// Symbol rate in kSym/s
    pub symbol_rate: u32,
    pub frequency_hz: f64,
    pub power_dbmv: f64,
}

/// Channel statistics captured from one status page.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ModemSnapshot {
    downstream: Vec<DownstreamChannel>,
    upstream: Vec<UpstreamChannel>,
}

impl ModemSnapshot {
    pub fn new(downstream: Vec<DownstreamChannel>, upstream: Vec<UpstreamChannel>) -> Self {
        Self { downstream, upstream }
    }

    /// Downstream channels in table order.
    pub fn downstream(&self) -> &[DownstreamChannel] {
        &self.downstream
    }

    /// Upstream channels in table order.
    pub fn upstream(&self) -> &[UpstreamChannel] {
        &self.upstream
    }

    pub fn is_empty(&self) -> bool {
        self.downstream.is_empty() && self.upstream.is_empty()
    }
}

// ============================================================================
// SECTION 4: ERROR HANDLING FRAMEWORK
// ============================================================================
// Collection failures are fatal to the current cycle only. Everything that
// can go wrong with modem input is a typed error, never a panic.
// ============================================================================

// ----------------------------------------------------------------------------
// 4.1 Exporter Errors
// ----------------------------------------------------------------------------

/// The main error type for the exporter.
#[derive(Error, Debug)]
pub enum ExporterError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Collection error: {0}")]
    Collect(#[from] CollectError),

    #[error("Metrics registry error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ExporterError {
    /// Get the error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            ExporterError::Config(_) => "config",
            ExporterError::Collect(e) => e.kind().as_str(),
            ExporterError::Metrics(_) => "metrics",
            ExporterError::Io(_) => "io",
            ExporterError::Internal(_) => "internal",
        }
    }
}

// ----------------------------------------------------------------------------
// 4.2 Configuration Errors
// ----------------------------------------------------------------------------

/// Errors related to configuration loading and validation
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Failed to parse configuration: {message}")]
    ParseError { message: String },

    #[error("Invalid configuration value for '{field}': {message}")]
    InvalidValue { field: String, message: String },
}

impl ConfigError {
    pub fn invalid_value(field: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field: field.into(),
            message: message.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// 4.3 Collection Errors
// ----------------------------------------------------------------------------

/// The three ways a collection cycle can fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectErrorKind {
    /// Network, timeout, cancellation, or body read failures
    Transport,
    /// The modem answered with a non-2xx status
    UpstreamUnavailable,
    /// The status page could not be converted into a snapshot
    MalformedModemData,
}

impl CollectErrorKind {
    pub const ALL: [CollectErrorKind; 3] = [
        CollectErrorKind::Transport,
        CollectErrorKind::UpstreamUnavailable,
        CollectErrorKind::MalformedModemData,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CollectErrorKind::Transport => "transport_error",
            CollectErrorKind::UpstreamUnavailable => "upstream_unavailable",
            CollectErrorKind::MalformedModemData => "malformed_modem_data",
        }
    }
}

impl Display for CollectErrorKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors from one fetch → parse cycle
#[derive(Error, Debug)]
pub enum CollectError {
    #[error("Transport error talking to '{endpoint}': {message}")]
    Transport { endpoint: String, message: String },

    #[error("Modem at '{endpoint}' returned HTTP {status}")]
    UpstreamUnavailable { endpoint: String, status: u16 },

    #[error("Malformed modem data in {direction} table, row {row}, column {column} ({field}): {reason}")]
    MalformedModemData {
        direction: Direction,
        row: usize,
        column: usize,
        field: &'static str,
        reason: String,
    },
}

impl CollectError {
    pub fn kind(&self) -> CollectErrorKind {
        match self {
            CollectError::Transport { .. } => CollectErrorKind::Transport,
            CollectError::UpstreamUnavailable { .. } => CollectErrorKind::UpstreamUnavailable,
            CollectError::MalformedModemData { .. } => CollectErrorKind::MalformedModemData,
        }
    }

    pub fn transport(endpoint: impl Into<String>, message: impl Into<String>) -> Self {
        CollectError::Transport {
            endpoint: endpoint.into(),
            message: message.into(),
        }
    }

    pub fn cancelled(endpoint: impl Into<String>) -> Self {
        Self::transport(endpoint, "collection cancelled")
    }

    pub fn deadline_exceeded(endpoint: impl Into<String>, deadline: Duration) -> Self {
        Self::transport(
            endpoint,
            format!("deadline of {}ms exceeded", deadline.as_millis()),
        )
    }

    fn from_reqwest(endpoint: &str, error: reqwest::Error) -> Self {
        let message = if error.is_timeout() {
            format!("request timed out: {}", error)
        } else if error.is_connect() {
            format!("connection failed: {}", error)
        } else {
            error.to_string()
        };
        Self::transport(endpoint, message)
    }
}

// ----------------------------------------------------------------------------
// 4.4 Result Type Aliases
// ----------------------------------------------------------------------------

/// Standard result type for exporter operations
pub type ExporterResult<T> = Result<T, ExporterError>;

/// Result type for collection cycles
pub type CollectResult<T> = Result<T, CollectError>;

// ============================================================================
// SECTION 5: CONFIGURATION SYSTEM
// ============================================================================
// Layered configuration:
// - built-in defaults
// - optional TOML file
// - environment variables (CM600_ prefix, `__` between sections)
// - command line flags
// ============================================================================

// ----------------------------------------------------------------------------
// 5.1 Main Configuration Structure
// ----------------------------------------------------------------------------

/// Root configuration for the exporter
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExporterConfig {
    /// Modem connection and parsing settings
    #[serde(default)]
    pub modem: ModemConfig,

    /// Exposition server settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl ExporterConfig {
    /// Layer the configuration sources; a missing file layer is skipped.
    pub fn figment(path: Option<&Path>) -> Figment {
        let figment = Figment::from(Serialized::defaults(ExporterConfig::default()));
        let figment = match path {
            Some(path) => figment.merge(Toml::file(path)),
            None => figment,
        };
        let figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

        // Env values are typed ("0123" reads as 123); credentials stay verbatim.
        OPAQUE_STRING_KEYS.iter().fold(figment, |figment, key| {
            match std::env::var(env_var_name(key)) {
                Ok(value) => figment.merge(Serialized::default(key, value)),
                Err(_) => figment,
            }
        })
    }

    /// Load configuration from file with environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }

        let config = Self::extract(Self::figment(Some(path)))?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus environment, plus the file when one is given.
    pub fn resolve(path: Option<&Path>) -> Result<Self, ConfigError> {
        Self::extract(Self::figment(path))
    }

    fn extract(figment: Figment) -> Result<Self, ConfigError> {
        figment.extract().map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let url = Url::parse(&self.modem.url)
            .map_err(|e| ConfigError::invalid_value("modem.url", e.to_string()))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ConfigError::invalid_value(
                "modem.url",
                format!("unsupported scheme '{}'", url.scheme()),
            ));
        }

        if self.modem.timeout.is_zero() {
            return Err(ConfigError::invalid_value(
                "modem.timeout",
                "Timeout must be greater than zero",
            ));
        }

        if self.modem.max_body_bytes == 0 {
            return Err(ConfigError::invalid_value(
                "modem.max_body_bytes",
                "Body limit must be greater than zero",
            ));
        }

        if let Some(every) = self.modem.poll_interval {
            if every < Duration::from_secs(MIN_POLL_INTERVAL_SECS) {
                return Err(ConfigError::invalid_value(
                    "modem.poll_interval",
                    format!("Poll interval must be at least {}s", MIN_POLL_INTERVAL_SECS),
                ));
            }
        }

        self.server
            .address
            .parse::<SocketAddr>()
            .map_err(|e| ConfigError::invalid_value("server.address", e.to_string()))?;

        let path = self.server.metrics_path.as_str();
        if !path.starts_with('/') || matches!(path, "/" | HEALTH_PATH) {
            return Err(ConfigError::invalid_value(
                "server.metrics_path",
                format!("'{}' must start with '/' and not collide with '/' or '{}'", path, HEALTH_PATH),
            ));
        }
        if path.contains('*') || path.split('/').any(|segment| segment.starts_with(':')) {
            return Err(ConfigError::invalid_value(
                "server.metrics_path",
                format!("'{}' must be a literal path without route parameters or wildcards", path),
            ));
        }

        StatusPageParser::new(self.modem.layout.clone())?;
        Ok(())
    }

    /// Create a default config file
    pub fn generate_default_config() -> String {
        toml::to_string_pretty(&Self::default()).unwrap_or_default()
    }
}

/// `modem.password` → `CM600_MODEM__PASSWORD`
fn env_var_name(key: &str) -> String {
    format!("{}{}", ENV_PREFIX, key.to_uppercase().replace('.', "__"))
}

impl FromStr for ExporterConfig {
    type Err = ConfigError;

    fn from_str(toml_str: &str) -> Result<Self, Self::Err> {
        let config: Self = toml::from_str(toml_str).map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }
}

// ----------------------------------------------------------------------------
// 5.2 Modem Configuration
// ----------------------------------------------------------------------------

/// What to do with series of channels that vanish between cycles.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StaleSeriesPolicy {
    /// Keep the last published value of vanished channels
    #[default]
    Retain,
    /// Clear every family before a successful publish
    Reset,
}

/// Modem connection and parsing settings
#[derive(Clone, Serialize, Deserialize)]
pub struct ModemConfig {
    /// Status page URL
    #[serde(default = "default_modem_url")]
    pub url: String,

    #[serde(default = "default_modem_username")]
    pub username: String,

    #[serde(default = "default_modem_password")]
    pub password: String,

    /// Deadline for one fetch + parse cycle
    #[serde(default = "default_collect_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    /// Maximum accepted status page size
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,

    /// Background collection interval; unset collects on scrape only
    #[serde(
        default,
        with = "humantime_serde",
        skip_serializing_if = "Option::is_none"
    )]
    pub poll_interval: Option<Duration>,

    #[serde(default)]
    pub stale_series: StaleSeriesPolicy,

    /// Column layout of the status page tables
    #[serde(default)]
    pub layout: StatusPageLayout,
}

impl Default for ModemConfig {
    fn default() -> Self {
        Self {
            url: default_modem_url(),
            username: default_modem_username(),
            password: default_modem_password(),
            timeout: default_collect_timeout(),
            max_body_bytes: default_max_body_bytes(),
            poll_interval: None,
            stale_series: StaleSeriesPolicy::default(),
            layout: StatusPageLayout::default(),
        }
    }
}

impl Debug for ModemConfig {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModemConfig")
            .field("url", &self.url)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("timeout", &self.timeout)
            .field("max_body_bytes", &self.max_body_bytes)
            .field("poll_interval", &self.poll_interval)
            .field("stale_series", &self.stale_series)
            .field("layout", &self.layout)
            .finish()
    }
}

fn default_modem_url() -> String {
    DEFAULT_MODEM_URL.into()
}

fn default_modem_username() -> String {
    DEFAULT_MODEM_USERNAME.into()
}

fn default_modem_password() -> String {
    DEFAULT_MODEM_PASSWORD.into()
}

fn default_collect_timeout() -> Duration {
    Duration::from_secs(DEFAULT_COLLECT_TIMEOUT_SECS)
}

fn default_max_body_bytes() -> usize {
    MAX_MODEM_BODY_BYTES
}

// ----------------------------------------------------------------------------
// 5.3 Status Page Layout
// ----------------------------------------------------------------------------
// Column indexes are 0-based `td` positions within a row. The defaults match
// the CM600 firmware; other firmware revisions only need a config change.
// ----------------------------------------------------------------------------

/// Table ids and column positions of both channel tables
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusPageLayout {
    #[serde(default)]
    pub downstream: DownstreamLayout,

    #[serde(default)]
    pub upstream: UpstreamLayout,
}

/// Column positions of the downstream table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DownstreamLayout {
    pub table_id: String,
    pub modulation: usize,
    pub dcid: usize,
    pub frequency: usize,
    pub power: usize,
    pub snr: usize,
    pub correcteds: usize,
    pub uncorrectables: usize,
}

impl Default for DownstreamLayout {
    fn default() -> Self {
        Self {
            table_id: DEFAULT_DOWNSTREAM_TABLE_ID.into(),
            modulation: 2,
            dcid: 3,
            frequency: 4,
            power: 5,
            snr: 6,
            correcteds: 7,
            uncorrectables: 8,
        }
    }
}

/// Column positions of the upstream table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamLayout {
    pub table_id: String,
    pub channel_type: usize,
    pub ucid: usize,
    pub symbol_rate: usize,
    pub frequency: usize,
    pub power: usize,
}

impl Default for UpstreamLayout {
    fn default() -> Self {
        Self {
            table_id: DEFAULT_UPSTREAM_TABLE_ID.into(),
            channel_type: 2,
            ucid: 3,
            symbol_rate: 4,
            frequency: 5,
            power: 6,
        }
    }
}

// ----------------------------------------------------------------------------
// 5.4 Server Configuration
// ----------------------------------------------------------------------------

/// Exposition server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address
    #[serde(default = "default_listen_address")]
    pub address: String,

    /// Metrics path
    #[serde(default = "default_metrics_path")]
    pub metrics_path: String,

    /// Run a collection cycle on every metrics request
    #[serde(default = "default_true")]
    pub collect_on_scrape: bool,

    /// Include exporter self-metrics
    #[serde(default = "default_true")]
    pub include_exporter_metrics: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: default_listen_address(),
            metrics_path: default_metrics_path(),
            collect_on_scrape: true,
            include_exporter_metrics: true,
        }
    }
}

fn default_listen_address() -> String {
    format!("0.0.0.0:{}", DEFAULT_EXPORTER_PORT)
}

fn default_metrics_path() -> String {
    DEFAULT_METRICS_PATH.into()
}

fn default_true() -> bool {
    true
}

// ----------------------------------------------------------------------------
// 5.5 Logging Configuration
// ----------------------------------------------------------------------------

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format (json, pretty, compact)
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Enable ANSI colors
    #[serde(default = "default_true")]
    pub colors: bool,

    /// Include source location
    #[serde(default)]
    pub source_location: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            colors: true,
            source_location: false,
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "pretty".into()
}

// ============================================================================
// SECTION 6: LOGGING & TRACING INFRASTRUCTURE
// ============================================================================

// ----------------------------------------------------------------------------
// 6.1 Logger Initialization
// ----------------------------------------------------------------------------

/// Initialize the logging system based on configuration.
///
/// Events go to stderr so that `scrape` output on stdout stays clean.
/// `RUST_LOG` takes precedence over the configured level.
pub fn init_logging(config: &LoggingConfig) -> ExporterResult<()> {
    let level_filter = config
        .level
        .parse::<LevelFilter>()
        .unwrap_or(LevelFilter::INFO);

    let env_filter = EnvFilter::builder()
        .with_default_directive(level_filter.into())
        .from_env_lossy();

    let subscriber = tracing_subscriber::registry().with(env_filter);

    let result = match config.format.as_str() {
        "json" => subscriber
            .with(
                tracing_fmt::layer()
                    .json()
                    .with_writer(std::io::stderr)
                    .with_target(true)
                    .with_file(config.source_location)
                    .with_line_number(config.source_location),
            )
            .try_init(),
        "compact" => subscriber
            .with(
                tracing_fmt::layer()
                    .compact()
                    .with_writer(std::io::stderr)
                    .with_ansi(config.colors)
                    .with_target(true),
            )
            .try_init(),
        _ => subscriber
            .with(
                tracing_fmt::layer()
                    .pretty()
                    .with_writer(std::io::stderr)
                    .with_ansi(config.colors)
                    .with_target(true)
                    .with_file(config.source_location)
                    .with_line_number(config.source_location),
            )
            .try_init(),
    };
    result.map_err(|e| ExporterError::Internal(format!("Failed to set logger: {}", e)))?;

    info!(
        target: "cm600::init",
        level = %config.level,
        format = %config.format,
        "Logging initialized"
    );

    Ok(())
}

// ----------------------------------------------------------------------------
// 6.2 Performance Timer
// ----------------------------------------------------------------------------

/// A simple timer for measuring operation duration
pub struct PerfTimer {
    name: &'static str,
    start: Instant,
    threshold_ms: Option<u64>,
}

impl PerfTimer {
    /// Start a new timer
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            start: Instant::now(),
            threshold_ms: None,
        }
    }

    /// Start a timer with a warning threshold
    pub fn with_threshold(name: &'static str, threshold_ms: u64) -> Self {
        Self {
            name,
            start: Instant::now(),
            threshold_ms: Some(threshold_ms),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Stop the timer and log if above threshold
    pub fn stop(self) -> u64 {
        let elapsed = self.start.elapsed().as_millis() as u64;

        if let Some(threshold) = self.threshold_ms {
            if elapsed > threshold {
                warn!(
                    target: "cm600::perf",
                    operation = self.name,
                    elapsed_ms = elapsed,
                    threshold_ms = threshold,
                    "Operation exceeded threshold"
                );
            }
        }

        trace!(
            target: "cm600::perf",
            operation = self.name,
            elapsed_ms = elapsed,
            "Operation completed"
        );

        elapsed
    }
}

// ============================================================================
// SECTION 7: STATUS PAGE FETCHER
// ============================================================================
// One authenticated GET per cycle. The body is read chunk by chunk so the
// size cap holds even when the modem omits Content-Length, and every await
// point races the cycle's cancellation token.
// ============================================================================

// ----------------------------------------------------------------------------
// 7.1 Source Trait
// ----------------------------------------------------------------------------

/// Anything that can produce the raw bytes of a status page
#[async_trait]
pub trait StatusPageSource: Send + Sync {
    /// Endpoint description used in errors and logs
    fn endpoint(&self) -> &str;

    /// Fetch one status page, aborting promptly once `cancel` fires
    async fn fetch(&self, cancel: &CancellationToken) -> CollectResult<Bytes>;
}

// ----------------------------------------------------------------------------
// 7.2 HTTP Modem Client
// ----------------------------------------------------------------------------

/// Fetches the status page over HTTP with Basic credentials
pub struct ModemClient {
    client: HttpClient,
    url: Url,
    endpoint: String,
    username: String,
    password: String,
    max_body_bytes: usize,
}

impl ModemClient {
    pub fn new(config: &ModemConfig) -> ExporterResult<Self> {
        let url = Url::parse(&config.url)
            .map_err(|e| ConfigError::invalid_value("modem.url", e.to_string()))?;

        let client = HttpClient::builder()
            .timeout(config.timeout)
            .connect_timeout(config.timeout)
            .pool_max_idle_per_host(2)
            .user_agent(format!("{}/{}", EXPORTER_NAME, EXPORTER_VERSION))
            .build()
            .map_err(|e| ExporterError::Internal(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoint: url.to_string(),
            url,
            username: config.username.clone(),
            password: config.password.clone(),
            max_body_bytes: config.max_body_bytes,
        })
    }

    fn body_too_large(&self, size: usize) -> CollectError {
        CollectError::transport(
            &self.endpoint,
            format!(
                "status page of {} bytes exceeds limit of {} bytes",
                size, self.max_body_bytes
            ),
        )
    }

    async fn read_body(
        &self,
        mut response: reqwest::Response,
        cancel: &CancellationToken,
    ) -> CollectResult<Bytes> {
        if let Some(length) = response.content_length() {
            if length > self.max_body_bytes as u64 {
                return Err(self.body_too_large(length as usize));
            }
        }

        let mut body = BytesMut::new();
        loop {
            let chunk = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(CollectError::cancelled(&self.endpoint)),
                chunk = response.chunk() => chunk.map_err(|e| CollectError::from_reqwest(&self.endpoint, e))?,
            };

            let Some(chunk) = chunk else { break };
            if body.len() + chunk.len() > self.max_body_bytes {
                return Err(self.body_too_large(body.len() + chunk.len()));
            }
            body.extend_from_slice(&chunk);
        }

        Ok(body.freeze())
    }
}

#[async_trait]
impl StatusPageSource for ModemClient {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn fetch(&self, cancel: &CancellationToken) -> CollectResult<Bytes> {
        let request = self
            .client
            .get(self.url.clone())
            .basic_auth(&self.username, Some(&self.password));

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(CollectError::cancelled(&self.endpoint)),
            result = request.send() => result.map_err(|e| CollectError::from_reqwest(&self.endpoint, e))?,
        };

        let status = response.status();
        if !status.is_success() {
            return Err(CollectError::UpstreamUnavailable {
                endpoint: self.endpoint.clone(),
                status: status.as_u16(),
            });
        }

        let body = self.read_body(response, cancel).await?;
        debug!(
            target: "cm600::fetcher",
            endpoint = %self.endpoint,
            bytes = body.len(),
            "Fetched status page"
        );
        Ok(body)
    }
}

// ============================================================================
// SECTION 8: STATUS PAGE PARSER
// ============================================================================
// Rows are located by table id, the first row of each table is a header,
// and each data row is read positionally. Cell text is the concatenation
// of the cell's direct text children, so markup nested inside a cell is
// ignored.
// ============================================================================

// ----------------------------------------------------------------------------
// 8.1 Cell Conversion
// ----------------------------------------------------------------------------

/// First whitespace-delimited token: `" 39.5 dBmV "` → `"39.5"`.
pub fn leading_token(text: &str) -> &str {
    text.split_whitespace().next().unwrap_or("")
}

/// Parse a decimal cell such as `"603000000 Hz"` or `"-3.2 dBmV"`.
pub fn cell_to_float(text: &str) -> Option<f64> {
    leading_token(text).parse().ok()
}

/// Parse an integer cell. One `QAM` marker is removed, so `"256QAM"`
/// and `"QAM256"` both read as 256.
pub fn cell_to_int<T: FromStr>(text: &str) -> Option<T> {
    leading_token(text).replacen("QAM", "", 1).parse().ok()
}

fn direct_text(cell: ElementRef<'_>) -> String {
    cell.children()
        .filter_map(|child| child.value().as_text())
        .map(|text| &**text)
        .collect()
}

/// The `td` cells of one data row
struct RowCells<'a> {
    direction: Direction,
    row: usize,
    cells: Vec<ElementRef<'a>>,
}

impl<'a> RowCells<'a> {
    fn new(direction: Direction, row: usize, element: ElementRef<'a>, cell: &Selector) -> Self {
        Self {
            direction,
            row,
            cells: element.select(cell).collect(),
        }
    }

    fn malformed(&self, column: usize, field: &'static str, reason: String) -> CollectError {
        CollectError::MalformedModemData {
            direction: self.direction,
            row: self.row,
            column,
            field,
            reason,
        }
    }

    fn text(&self, column: usize, field: &'static str) -> CollectResult<String> {
        self.cells
            .get(column)
            .map(|cell| direct_text(*cell))
            .ok_or_else(|| {
                self.malformed(column, field, format!("row has only {} cells", self.cells.len()))
            })
    }

    fn int<T: FromStr>(&self, column: usize, field: &'static str) -> CollectResult<T> {
        let text = self.text(column, field)?;
        cell_to_int(&text).ok_or_else(|| {
            self.malformed(column, field, format!("cannot read {:?} as an integer", text.trim()))
        })
    }

    fn float(&self, column: usize, field: &'static str) -> CollectResult<f64> {
        let text = self.text(column, field)?;
        cell_to_float(&text).ok_or_else(|| {
            self.malformed(column, field, format!("cannot read {:?} as a number", text.trim()))
        })
    }
}

// ----------------------------------------------------------------------------
// 8.2 Parser
// ----------------------------------------------------------------------------

/// Converts status page HTML into a [`ModemSnapshot`]
#[derive(Debug, Clone)]
pub struct StatusPageParser {
    layout: StatusPageLayout,
    downstream_table: Selector,
    upstream_table: Selector,
    row: Selector,
    cell: Selector,
}

fn table_selector(field: &str, id: &str) -> Result<Selector, ConfigError> {
    if id.is_empty() || id.contains(['"', '\\']) {
        return Err(ConfigError::invalid_value(
            field,
            format!("{:?} is not a usable table id", id),
        ));
    }
    Selector::parse(&format!("table[id=\"{}\"]", id))
        .map_err(|e| ConfigError::invalid_value(field, format!("{:?}", e)))
}

fn element_selector(tag: &str) -> Result<Selector, ConfigError> {
    Selector::parse(tag).map_err(|e| ConfigError::invalid_value(tag, format!("{:?}", e)))
}

impl StatusPageParser {
    pub fn new(layout: StatusPageLayout) -> Result<Self, ConfigError> {
        Ok(Self {
            downstream_table: table_selector(
                "modem.layout.downstream.table_id",
                &layout.downstream.table_id,
            )?,
            upstream_table: table_selector(
                "modem.layout.upstream.table_id",
                &layout.upstream.table_id,
            )?,
            row: element_selector("tr")?,
            cell: element_selector("td")?,
            layout,
        })
    }

    pub fn layout(&self) -> &StatusPageLayout {
        &self.layout
    }

    /// Parse a complete status page. A missing table yields an empty list
    /// for that direction; any bad cell fails the whole page.
    pub fn parse(&self, body: &[u8]) -> CollectResult<ModemSnapshot> {
        let html = String::from_utf8_lossy(body);
        let document = Html::parse_document(&html);

        let downstream = self.parse_downstream(&document)?;
        let upstream = self.parse_upstream(&document)?;

        trace!(
            target: "cm600::parser",
            downstream = downstream.len(),
            upstream = upstream.len(),
            "Parsed status page"
        );
        Ok(ModemSnapshot::new(downstream, upstream))
    }

    fn data_rows<'a>(
        &self,
        document: &'a Html,
        table: &Selector,
        direction: Direction,
    ) -> Vec<RowCells<'a>> {
        let Some(table) = document.select(table).next() else {
            debug!(target: "cm600::parser", %direction, "Channel table not found");
            return Vec::new();
        };

        table
            .select(&self.row)
            .skip(1)
            .enumerate()
            .map(|(index, row)| RowCells::new(direction, index + 1, row, &self.cell))
            .collect()
    }

    fn parse_downstream(&self, document: &Html) -> CollectResult<Vec<DownstreamChannel>> {
        let layout = &self.layout.downstream;
        self.data_rows(document, &self.downstream_table, Direction::Downstream)
            .iter()
            .map(|cells| {
                Ok(DownstreamChannel {
                    channel: cells.row,
                    modulation: cells.int(layout.modulation, "modulation")?,
                    dcid: cells.int(layout.dcid, "dcid")?,
                    frequency_hz: cells.float(layout.frequency, "frequency")?,
                    power_dbmv: cells.float(layout.power, "power")?,
                    snr_db: cells.float(layout.snr, "snr")?,
                    correcteds: cells.int(layout.correcteds, "correcteds")?,
                    uncorrectables: cells.int(layout.uncorrectables, "uncorrectables")?,
                })
            })
            .collect()
    }

    fn parse_upstream(&self, document: &Html) -> CollectResult<Vec<UpstreamChannel>> {
        let layout = &self.layout.upstream;
        self.data_rows(document, &self.upstream_table, Direction::Upstream)
            .iter()
            .map(|cells| {
                Ok(UpstreamChannel {
                    channel: cells.row,
                    channel_type: cells.text(layout.channel_type, "channel_type")?.trim().to_string(),
                    ucid: cells.int(layout.ucid, "ucid")?,
                    symbol_rate: cells.int(layout.symbol_rate, "symbol_rate")?,
                    frequency_hz: cells.float(layout.frequency, "frequency")?,
                    power_dbmv: cells.float(layout.power, "power")?,
                })
            })
            .collect()
    }
}

// ============================================================================
// SECTION 9: METRIC PUBLISHER
// ============================================================================
// Nine gauge families keyed by (channel index, device channel id). Families
// are registered once at construction and are described even before the
// first successful cycle.
// ============================================================================

/// Static description of one metric family
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricDescriptor {
    pub name: String,
    pub help: String,
    pub label_names: Vec<String>,
}

/// One current series value
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Observation {
    pub name: String,
    pub labels: Vec<(String, String)>,
    pub value: f64,
}

impl Observation {
    pub fn label(&self, name: &str) -> Option<&str> {
        self.labels
            .iter()
            .find(|(label, _)| label == name)
            .map(|(_, value)| value.as_str())
    }
}

/// The modem's channel gauges
pub struct ModemMetrics {
    pub downstream_frequency: GaugeVec,
    pub downstream_power: GaugeVec,
    pub downstream_snr: GaugeVec,
    pub downstream_modulation: GaugeVec,
    pub downstream_correcteds: GaugeVec,
    pub downstream_uncorrectables: GaugeVec,
    pub upstream_frequency: GaugeVec,
    pub upstream_power: GaugeVec,
    pub upstream_symbol_rate: GaugeVec,
}

fn gauge_vec(name: &str, help: &str, labels: &[&str]) -> prometheus::Result<GaugeVec> {
    GaugeVec::new(Opts::new(name, help).namespace(METRIC_NAMESPACE), labels)
}

impl ModemMetrics {
    /// Create every family and register it with `registry`
    pub fn new(registry: &PrometheusRegistry) -> prometheus::Result<Self> {
        let metrics = Self {
            downstream_frequency: gauge_vec(
                "downstream_freq_hertz",
                "Modem Downstream Frequency (Hz)",
                &DOWNSTREAM_LABELS,
            )?,
            downstream_power: gauge_vec(
                "downstream_power_dbmv",
                "Modem Downstream Power (dBmV)",
                &DOWNSTREAM_LABELS,
            )?,
            downstream_snr: gauge_vec(
                "downstream_snr_db",
                "Modem Downstream SNR (dB)",
                &DOWNSTREAM_LABELS,
            )?,
            downstream_modulation: gauge_vec(
                "downstream_modulation_qam",
                "Modem Downstream Modulation (QAM)",
                &DOWNSTREAM_LABELS,
            )?,
            downstream_correcteds: gauge_vec(
                "downstream_correcteds_total",
                "Modem Downstream Correcteds",
                &DOWNSTREAM_LABELS,
            )?,
            downstream_uncorrectables: gauge_vec(
                "downstream_uncorrectables_total",
                "Modem Downstream Uncorrectables",
                &DOWNSTREAM_LABELS,
            )?,
            upstream_frequency: gauge_vec(
                "upstream_freq_hertz",
                "Modem Upstream Frequency (Hz)",
                &UPSTREAM_LABELS,
            )?,
            upstream_power: gauge_vec(
                "upstream_power_dbmv",
                "Modem Upstream Power (dBmV)",
                &UPSTREAM_LABELS,
            )?,
            upstream_symbol_rate: gauge_vec(
                "upstream_symbol_rate",
                "Modem Upstream Symbol Rate (kSym/s)",
                &UPSTREAM_LABELS,
            )?,
        };

        for family in metrics.families() {
            registry.register(Box::new(family.clone()))?;
        }
        Ok(metrics)
    }

    fn families(&self) -> [&GaugeVec; 9] {
        [
            &self.downstream_frequency,
            &self.downstream_power,
            &self.downstream_snr,
            &self.downstream_modulation,
            &self.downstream_correcteds,
            &self.downstream_uncorrectables,
            &self.upstream_frequency,
            &self.upstream_power,
            &self.upstream_symbol_rate,
        ]
    }

    /// Write every channel of `snapshot`, returning the number of series set
    pub fn publish(&self, snapshot: &ModemSnapshot, policy: StaleSeriesPolicy) -> usize {
        if policy == StaleSeriesPolicy::Reset {
            for family in self.families() {
                family.reset();
            }
        }

        for channel in snapshot.downstream() {
            let index = channel.channel.to_string();
            let dcid = channel.dcid.to_string();
            let labels = [index.as_str(), dcid.as_str()];

            self.downstream_frequency
                .with_label_values(&labels)
                .set(channel.frequency_hz);
            self.downstream_power
                .with_label_values(&labels)
                .set(channel.power_dbmv);
            self.downstream_snr.with_label_values(&labels).set(channel.snr_db);
            self.downstream_modulation
                .with_label_values(&labels)
                .set(f64::from(channel.modulation));
            self.downstream_correcteds
                .with_label_values(&labels)
                .set(channel.correcteds as f64);
            self.downstream_uncorrectables
                .with_label_values(&labels)
                .set(channel.uncorrectables as f64);
        }

        for channel in snapshot.upstream() {
            let index = channel.channel.to_string();
            let ucid = channel.ucid.to_string();
            let labels = [index.as_str(), ucid.as_str()];

            self.upstream_frequency
                .with_label_values(&labels)
                .set(channel.frequency_hz);
            self.upstream_power
                .with_label_values(&labels)
                .set(channel.power_dbmv);
            self.upstream_symbol_rate
                .with_label_values(&labels)
                .set(f64::from(channel.symbol_rate));
        }

        snapshot.downstream().len() * 6 + snapshot.upstream().len() * 3
    }

    pub fn descriptors(&self) -> Vec<MetricDescriptor> {
        self.families()
            .into_iter()
            .flat_map(|family| family.desc())
            .map(|desc| MetricDescriptor {
                name: desc.fq_name.clone(),
                help: desc.help.clone(),
                label_names: desc.variable_labels.clone(),
            })
            .collect()
    }

    /// Current series, ordered by family name then labels
    pub fn observations(&self) -> Vec<Observation> {
        let mut observations: Vec<Observation> = self
            .families()
            .into_iter()
            .flat_map(|family| family.collect())
            .flat_map(|family| {
                let name = family.get_name().to_string();
                family
                    .get_metric()
                    .iter()
                    .map(|metric| Observation {
                        name: name.clone(),
                        labels: metric
                            .get_label()
                            .iter()
                            .map(|pair| (pair.get_name().to_string(), pair.get_value().to_string()))
                            .collect(),
                        value: metric.get_gauge().get_value(),
                    })
                    .collect::<Vec<_>>()
            })
            .collect();

        observations.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.labels.cmp(&b.labels)));
        observations
    }
}

// ============================================================================
// SECTION 10: SCRAPE HEALTH
// ============================================================================

/// Collector health status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CollectorStatus {
    /// Last cycle succeeded
    Healthy,
    /// Recent cycles failed, below the failure threshold
    Degraded,
    /// Too many consecutive failures
    Failed,
    /// No cycle has run yet
    Unknown,
}

/// Point-in-time health of the collection pipeline
#[derive(Debug, Clone, Serialize)]
pub struct CollectorHealth {
    pub status: CollectorStatus,
    pub last_success: Option<DateTime<Utc>>,
    pub last_error: Option<DateTime<Utc>>,
    pub last_error_kind: Option<CollectErrorKind>,
    pub last_error_message: Option<String>,
    pub consecutive_failures: u32,
    pub collection_cycles: u64,
    pub failed_cycles: u64,
    pub last_duration_ms: u64,
    pub downstream_channels: usize,
    pub upstream_channels: usize,
}

impl Default for CollectorHealth {
    fn default() -> Self {
        Self {
            status: CollectorStatus::Unknown,
            last_success: None,
            last_error: None,
            last_error_kind: None,
            last_error_message: None,
            consecutive_failures: 0,
            collection_cycles: 0,
            failed_cycles: 0,
            last_duration_ms: 0,
            downstream_channels: 0,
            upstream_channels: 0,
        }
    }
}

/// Tracks cycle outcomes and mirrors them into the exporter's own metrics
pub struct ScrapeHealth {
    health: RwLock<CollectorHealth>,
    scrapes_total: IntCounter,
    scrape_errors_total: IntCounterVec,
    last_scrape_success: Gauge,
    last_scrape_duration: Gauge,
}

fn exporter_opts(name: &str, help: &str) -> Opts {
    Opts::new(name, help)
        .namespace(METRIC_NAMESPACE)
        .subsystem(EXPORTER_SUBSYSTEM)
}

impl ScrapeHealth {
    pub fn new() -> prometheus::Result<Self> {
        let scrape_errors_total = IntCounterVec::new(
            exporter_opts("scrape_errors_total", "Failed collection cycles by error kind"),
            &["kind"],
        )?;
        for kind in CollectErrorKind::ALL {
            scrape_errors_total.with_label_values(&[kind.as_str()]);
        }

        Ok(Self {
            health: RwLock::new(CollectorHealth::default()),
            scrapes_total: IntCounter::with_opts(exporter_opts(
                "scrapes_total",
                "Collection cycles attempted",
            ))?,
            scrape_errors_total,
            last_scrape_success: Gauge::with_opts(exporter_opts(
                "last_scrape_success",
                "Whether the last collection cycle succeeded (1) or failed (0)",
            ))?,
            last_scrape_duration: Gauge::with_opts(exporter_opts(
                "last_scrape_duration_seconds",
                "Duration of the last collection cycle",
            ))?,
        })
    }

    pub fn register(&self, registry: &PrometheusRegistry) -> prometheus::Result<()> {
        registry.register(Box::new(self.scrapes_total.clone()))?;
        registry.register(Box::new(self.scrape_errors_total.clone()))?;
        registry.register(Box::new(self.last_scrape_success.clone()))?;
        registry.register(Box::new(self.last_scrape_duration.clone()))?;
        Ok(())
    }

    pub fn record_success(&self, summary: &CollectSummary) {
        self.scrapes_total.inc();
        self.last_scrape_success.set(1.0);
        self.last_scrape_duration.set(summary.duration.as_secs_f64());

        let mut health = self.health.write();
        health.status = CollectorStatus::Healthy;
        health.last_success = Some(Utc::now());
        health.consecutive_failures = 0;
        health.collection_cycles += 1;
        health.last_duration_ms = summary.duration.as_millis() as u64;
        health.downstream_channels = summary.downstream_channels;
        health.upstream_channels = summary.upstream_channels;
    }

    pub fn record_error(&self, error: &CollectError, duration: Duration) {
        self.scrapes_total.inc();
        self.scrape_errors_total
            .with_label_values(&[error.kind().as_str()])
            .inc();
        self.last_scrape_success.set(0.0);
        self.last_scrape_duration.set(duration.as_secs_f64());

        let mut health = self.health.write();
        health.last_error = Some(Utc::now());
        health.last_error_kind = Some(error.kind());
        health.last_error_message = Some(error.to_string());
        health.consecutive_failures += 1;
        health.collection_cycles += 1;
        health.failed_cycles += 1;
        health.last_duration_ms = duration.as_millis() as u64;

        health.status = if health.consecutive_failures >= CONSECUTIVE_FAILURE_THRESHOLD {
            CollectorStatus::Failed
        } else {
            CollectorStatus::Degraded
        };
    }

    pub fn snapshot(&self) -> CollectorHealth {
        self.health.read().clone()
    }
}

// ============================================================================
// SECTION 11: COLLECTION ORCHESTRATOR
// ============================================================================
// fetch → parse → publish, one cycle at a time. A cycle either publishes a
// whole snapshot or publishes nothing.
// ============================================================================

/// Per-cycle limits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollectOptions {
    pub deadline: Duration,
    pub stale_series: StaleSeriesPolicy,
}

impl Default for CollectOptions {
    fn default() -> Self {
        Self {
            deadline: default_collect_timeout(),
            stale_series: StaleSeriesPolicy::default(),
        }
    }
}

impl From<&ModemConfig> for CollectOptions {
    fn from(config: &ModemConfig) -> Self {
        Self {
            deadline: config.timeout,
            stale_series: config.stale_series,
        }
    }
}

/// Outcome of a successful cycle
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CollectSummary {
    pub downstream_channels: usize,
    pub upstream_channels: usize,
    pub observations: usize,
    pub duration: Duration,
}

/// Owns the fetch → parse → publish pipeline for one modem
pub struct ModemExporter {
    source: Box<dyn StatusPageSource>,
    parser: StatusPageParser,
    metrics: ModemMetrics,
    health: ScrapeHealth,
    options: CollectOptions,
    cycle_lock: TokioMutex<()>,
    shutdown: CancellationToken,
}

impl ModemExporter {
    /// Build an exporter and register its channel families with `registry`.
    /// Self-metrics are registered separately with
    /// [`ModemExporter::register_exporter_metrics`].
    pub fn new(
        source: Box<dyn StatusPageSource>,
        parser: StatusPageParser,
        registry: &PrometheusRegistry,
        options: CollectOptions,
    ) -> ExporterResult<Self> {
        Ok(Self {
            source,
            parser,
            metrics: ModemMetrics::new(registry)?,
            health: ScrapeHealth::new()?,
            options,
            cycle_lock: TokioMutex::new(()),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn from_config(config: &ExporterConfig, registry: &PrometheusRegistry) -> ExporterResult<Self> {
        let source = ModemClient::new(&config.modem)?;
        let parser = StatusPageParser::new(config.modem.layout.clone())?;
        let exporter = Self::new(
            Box::new(source),
            parser,
            registry,
            CollectOptions::from(&config.modem),
        )?;

        if config.server.include_exporter_metrics {
            exporter.register_exporter_metrics(registry)?;
        }
        Ok(exporter)
    }

    pub fn register_exporter_metrics(&self, registry: &PrometheusRegistry) -> ExporterResult<()> {
        self.health.register(registry)?;
        Ok(())
    }

    pub fn endpoint(&self) -> &str {
        self.source.endpoint()
    }

    /// Run one collection cycle and publish its snapshot.
    ///
    /// Cycles are serialized; a caller arriving mid-cycle waits for the
    /// running cycle to finish and then runs its own. On failure the
    /// previously published values are left untouched.
    pub async fn collect(&self) -> CollectResult<CollectSummary> {
        let _cycle = self.cycle_lock.lock().await;
        let timer = PerfTimer::with_threshold("modem_collect", SLOW_COLLECTION_THRESHOLD_MS);

        match self.fetch_snapshot().await {
            Ok(snapshot) => {
                let observations = self.metrics.publish(&snapshot, self.options.stale_series);
                let summary = CollectSummary {
                    downstream_channels: snapshot.downstream().len(),
                    upstream_channels: snapshot.upstream().len(),
                    observations,
                    duration: timer.elapsed(),
                };
                self.health.record_success(&summary);
                timer.stop();

                debug!(
                    target: "cm600::collector",
                    downstream = summary.downstream_channels,
                    upstream = summary.upstream_channels,
                    observations = summary.observations,
                    "Collection cycle complete"
                );
                Ok(summary)
            }
            Err(error) => {
                self.health.record_error(&error, timer.elapsed());
                timer.stop();

                warn!(
                    target: "cm600::collector",
                    kind = %error.kind(),
                    endpoint = %self.source.endpoint(),
                    error = %error,
                    "Failed to collect modem metrics"
                );
                Err(error)
            }
        }
    }

    /// Fetch and parse one status page under the cycle deadline without
    /// publishing anything.
    pub async fn fetch_snapshot(&self) -> CollectResult<ModemSnapshot> {
        let cancel = self.shutdown.child_token();
        let deadline = self.options.deadline;

        let cycle = async {
            let body = self.source.fetch(&cancel).await?;
            self.parser.parse(&body)
        };

        match timeout(deadline, cycle).await {
            Ok(result) => result,
            Err(_) => Err(CollectError::deadline_exceeded(self.source.endpoint(), deadline)),
        }
    }

    /// Families this exporter publishes, available before any cycle runs
    pub fn describe(&self) -> Vec<MetricDescriptor> {
        self.metrics.descriptors()
    }

    pub fn observations(&self) -> Vec<Observation> {
        self.metrics.observations()
    }

    pub fn health(&self) -> CollectorHealth {
        self.health.snapshot()
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Cancel in-flight cycles; later cycles fail fast as transport errors.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

/// Encode every family in `registry` in the Prometheus text format
pub fn encode_registry(registry: &PrometheusRegistry) -> ExporterResult<String> {
    let mut buffer = Vec::new();
    TextEncoder::new().encode(&registry.gather(), &mut buffer)?;
    String::from_utf8(buffer)
        .map_err(|e| ExporterError::Internal(format!("Metrics output is not UTF-8: {}", e)))
}

// ============================================================================
// SECTION 12: EXPOSITION SERVER
// ============================================================================

/// Shared state of the HTTP handlers
#[derive(Clone)]
pub struct AppState {
    pub exporter: Arc<ModemExporter>,
    pub registry: PrometheusRegistry,
    pub metrics_path: String,
    pub collect_on_scrape: bool,
}

impl AppState {
    pub fn new(config: &ServerConfig, exporter: Arc<ModemExporter>, registry: PrometheusRegistry) -> Self {
        Self {
            exporter,
            registry,
            metrics_path: config.metrics_path.clone(),
            collect_on_scrape: config.collect_on_scrape,
        }
    }
}

pub fn router(state: AppState) -> Router {
    let metrics_path = state.metrics_path.clone();
    Router::new()
        .route("/", get(landing_page))
        .route(&metrics_path, get(metrics_handler))
        .route(HEALTH_PATH, get(health_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn landing_page(State(state): State<AppState>) -> HtmlResponse<String> {
    HtmlResponse(format!(
        "<html>\n\
         <head><title>{name}</title></head>\n\
         <body>\n\
         <h1>{name}</h1>\n\
         <p><a href=\"{path}\">Metrics</a></p>\n\
         <p><a href=\"{health}\">Health</a></p>\n\
         </body>\n\
         </html>\n",
        name = EXPORTER_FULL_NAME,
        path = state.metrics_path,
        health = HEALTH_PATH,
    ))
}

async fn metrics_handler(State(state): State<AppState>) -> Response {
    if state.collect_on_scrape {
        // Failures are logged and counted by the exporter; last values are still served.
        let _ = state.exporter.collect().await;
    }

    match encode_registry(&state.registry) {
        Ok(body) => ([(header::CONTENT_TYPE, prometheus::TEXT_FORMAT)], body).into_response(),
        Err(e) => {
            error!(target: "cm600::server", error = %e, "Failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

async fn health_handler(State(state): State<AppState>) -> Json<CollectorHealth> {
    Json(state.exporter.health())
}

fn spawn_poller(exporter: Arc<ModemExporter>, every: Duration) -> TokioJoinHandle<()> {
    let shutdown = exporter.shutdown_token();
    tokio::spawn(async move {
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let _ = exporter.collect().await;
                }
                _ = shutdown.cancelled() => {
                    debug!(target: "cm600::collector", "Background poller stopped");
                    break;
                }
            }
        }
    })
}

async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(target: "cm600::server", error = %e, "Failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(target: "cm600::server", error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!(target: "cm600::server", "Received SIGINT, initiating shutdown"),
        _ = terminate => info!(target: "cm600::server", "Received SIGTERM, initiating shutdown"),
        _ = token.cancelled() => {}
    }
    token.cancel();
}

/// Serve the exporter until a shutdown signal arrives
pub async fn serve(
    config: &ExporterConfig,
    exporter: Arc<ModemExporter>,
    registry: PrometheusRegistry,
) -> ExporterResult<()> {
    let address: SocketAddr = config
        .server
        .address
        .parse()
        .map_err(|e: std::net::AddrParseError| {
            ConfigError::invalid_value("server.address", e.to_string())
        })?;
    let listener = TokioTcpListener::bind(address).await?;

    info!(
        target: "cm600::server",
        address = %address,
        metrics_path = %config.server.metrics_path,
        modem = %exporter.endpoint(),
        "Exporter listening"
    );

    let poller = config
        .modem
        .poll_interval
        .map(|every| spawn_poller(exporter.clone(), every));

    let shutdown = exporter.shutdown_token();
    let app = router(AppState::new(&config.server, exporter.clone(), registry));

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown))
        .await?;

    exporter.shutdown();
    if let Some(handle) = poller {
        if let Err(e) = handle.await {
            warn!(target: "cm600::server", error = %e, "Background poller ended abnormally");
        }
    }

    info!(target: "cm600::server", "Exporter stopped");
    Ok(())
}

/// Build the exporter from configuration and serve it
pub async fn run(config: ExporterConfig) -> ExporterResult<()> {
    info!(
        target: "cm600::init",
        version = EXPORTER_VERSION,
        modem = %config.modem.url,
        "Starting {}",
        EXPORTER_FULL_NAME
    );

    let registry = PrometheusRegistry::new();
    let exporter = Arc::new(ModemExporter::from_config(&config, &registry)?);
    serve(&config, exporter, registry).await
}

// ============================================================================
// SECTION 13: CLI
// ============================================================================

/// Netgear CM600 Prometheus exporter
#[derive(Parser, Debug)]
#[command(
    name = "cm600-exporter",
    author,
    version,
    about = "Prometheus exporter for Netgear CM600 cable modems",
    long_about = "Scrapes the DOCSIS status page of a Netgear CM600 cable modem and exposes \
                  per-channel frequency, power, SNR, modulation and codeword counters as \
                  Prometheus gauges."
)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH, env = "CM600_CONFIG")]
    pub config: PathBuf,

    /// Log level override (trace, debug, info, warn, error)
    #[arg(short, long, env = "CM600_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Status page URL
    #[arg(long, value_name = "URL", env = "CM600_MODEM_URL")]
    pub modem_url: Option<String>,

    /// Username for the modem web UI
    #[arg(long, value_name = "USER", env = "CM600_MODEM_USERNAME")]
    pub modem_username: Option<String>,

    /// Password for the modem web UI
    #[arg(long, value_name = "PASSWORD", env = "CM600_MODEM_PASSWORD", hide_env_values = true)]
    pub modem_password: Option<String>,

    /// Address to listen on for scrapes
    #[arg(long, value_name = "ADDR", env = "CM600_LISTEN_ADDRESS")]
    pub listen_address: Option<String>,

    /// Path under which to expose metrics
    #[arg(long, value_name = "PATH", env = "CM600_METRICS_PATH")]
    pub metrics_path: Option<String>,

    /// Subcommand to run
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Commands {
    /// Serve metrics (default)
    Run,

    /// Collect once and print the result
    Scrape {
        /// Output format
        #[arg(short = 'o', long, value_enum, default_value_t = ScrapeFormat::Text)]
        format: ScrapeFormat,
    },

    /// Validate configuration
    Validate {
        /// Show the resolved configuration
        #[arg(short, long)]
        verbose: bool,
    },

    /// Generate default configuration file
    GenerateConfig {
        /// Output path (stdout when omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show version information
    Version,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScrapeFormat {
    /// Prometheus text exposition
    Text,
    /// Parsed snapshot as JSON
    Json,
}

impl Cli {
    /// Command line flags win over every other configuration source.
    pub fn apply_overrides(&self, config: &mut ExporterConfig) {
        if let Some(url) = &self.modem_url {
            config.modem.url = url.clone();
        }
        if let Some(username) = &self.modem_username {
            config.modem.username = username.clone();
        }
        if let Some(password) = &self.modem_password {
            config.modem.password = password.clone();
        }
        if let Some(address) = &self.listen_address {
            config.server.address = address.clone();
        }
        if let Some(path) = &self.metrics_path {
            config.server.metrics_path = path.clone();
        }
        if let Some(level) = &self.log_level {
            config.logging.level = level.clone();
        }
    }

    /// Resolve, override and validate the effective configuration.
    pub fn load_config(&self) -> Result<ExporterConfig, ConfigError> {
        let file = self.config.exists().then_some(self.config.as_path());
        let mut config = ExporterConfig::resolve(file)?;
        self.apply_overrides(&mut config);
        config.validate()?;
        Ok(config)
    }
}

/// Handle validate command
fn handle_validate(path: &Path, config: &ExporterConfig, verbose: bool) {
    println!("✅ Configuration is valid!");
    if path.exists() {
        println!("   File: {}", path.display());
    } else {
        println!("   File: {} (not found, using defaults)", path.display());
    }

    if verbose {
        println!();
        println!("Modem:");
        println!("  URL: {}", config.modem.url);
        println!("  Username: {}", config.modem.username);
        println!("  Timeout: {:?}", config.modem.timeout);
        println!("  Max body: {} bytes", config.modem.max_body_bytes);
        match config.modem.poll_interval {
            Some(every) => println!("  Poll interval: {:?}", every),
            None => println!("  Poll interval: on scrape"),
        }
        println!("  Stale series: {:?}", config.modem.stale_series);
        println!(
            "  Tables: downstream #{}, upstream #{}",
            config.modem.layout.downstream.table_id, config.modem.layout.upstream.table_id
        );
        println!();
        println!("Server:");
        println!("  Address: {}", config.server.address);
        println!("  Metrics path: {}", config.server.metrics_path);
        println!("  Collect on scrape: {}", config.server.collect_on_scrape);
        println!("  Exporter metrics: {}", config.server.include_exporter_metrics);
    }
}

/// Handle generate-config command
fn handle_generate_config(output: Option<&Path>) -> ExporterResult<()> {
    let config = ExporterConfig::generate_default_config();

    match output {
        Some(path) => {
            fs::write(path, &config)?;
            println!("✅ Configuration written to: {}", path.display());
        }
        None => println!("{}", config),
    }

    Ok(())
}

/// Handle version command
fn handle_version() {
    println!("{} v{}", EXPORTER_FULL_NAME, EXPORTER_VERSION);
    println!("Metric namespace: {}", METRIC_NAMESPACE);
    println!("Default modem: {}", DEFAULT_MODEM_URL);
}

/// Handle scrape command
async fn handle_scrape(config: &ExporterConfig, format: ScrapeFormat) -> ExporterResult<()> {
    let registry = PrometheusRegistry::new();
    let exporter = ModemExporter::from_config(config, &registry)?;

    match format {
        ScrapeFormat::Json => {
            let snapshot = exporter.fetch_snapshot().await?;
            let json = serde_json::to_string_pretty(&snapshot)
                .map_err(|e| ExporterError::Internal(format!("Failed to encode snapshot: {}", e)))?;
            println!("{}", json);
        }
        ScrapeFormat::Text => {
            exporter.collect().await?;
            print!("{}", encode_registry(&registry)?);
        }
    }

    Ok(())
}

// ============================================================================
// SECTION 14: MAIN ENTRY POINT
// ============================================================================

#[tokio::main]
async fn main() -> AnyhowResult<()> {
    let cli = Cli::parse();
    let command = cli.command.clone().unwrap_or(Commands::Run);

    match &command {
        Commands::Version => {
            handle_version();
            return Ok(());
        }
        Commands::GenerateConfig { output } => {
            handle_generate_config(output.as_deref())?;
            return Ok(());
        }
        _ => {}
    }

    let config = cli
        .load_config()
        .with_context(|| format!("Failed to load configuration ({})", cli.config.display()))?;

    match command {
        Commands::Validate { verbose } => handle_validate(&cli.config, &config, verbose),
        Commands::Scrape { format } => {
            init_logging(&config.logging)?;
            handle_scrape(&config, format).await?;
        }
        Commands::Run => {
            init_logging(&config.logging)?;
            run(config).await.context("Exporter failed")?;
        }
        Commands::Version | Commands::GenerateConfig { .. } => {}
    }

    Ok(())
}

// ============================================================================
// SECTION 15: TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use rstest::rstest;

    const STATUS_PAGE: &str = include_str!("fixtures/docsis_status.html");

    fn ds_row(cells: [&str; 9]) -> String {
        let cells: String = cells.iter().map(|c| format!("<td>{}</td>", c)).collect();
        format!("<tr>{}</tr>", cells)
    }

    fn us_row(cells: [&str; 7]) -> String {
        let cells: String = cells.iter().map(|c| format!("<td>{}</td>", c)).collect();
        format!("<tr>{}</tr>", cells)
    }

    fn table(id: &str, rows: &[String]) -> String {
        format!(
            "<table id=\"{}\"><tr><th>Channel</th><th>Lock Status</th></tr>{}</table>",
            id,
            rows.concat()
        )
    }

    fn page(downstream: Option<&[String]>, upstream: Option<&[String]>) -> String {
        format!(
            "<html><body>{}{}</body></html>",
            downstream.map(|rows| table("dsTable", rows)).unwrap_or_default(),
            upstream.map(|rows| table("usTable", rows)).unwrap_or_default(),
        )
    }

    fn parser() -> StatusPageParser {
        StatusPageParser::new(StatusPageLayout::default()).unwrap()
    }

    fn single_channel_page() -> String {
        page(
            Some(&[ds_row([
                "1", "Locked", "256QAM", "5", "603000000 Hz", "3.5 dBmV", "39.8 dB", "1000", "2",
            ])]),
            Some(&[us_row([
                "1", "Locked", "ATDMA", "3", "5120 ksym/s", "35600000 Hz", "45.2 dBmV",
            ])]),
        )
    }

    // ------------------------------------------------------------------------
    // Cell conversion
    // ------------------------------------------------------------------------

    #[rstest]
    #[case("256QAM", 256)]
    #[case("QAM256", 256)]
    #[case("  64QAM  ", 64)]
    #[case("1000", 1000)]
    #[case("5120 Ksym/sec", 5120)]
    #[case("7\t", 7)]
    fn int_cells_read_leading_token(#[case] text: &str, #[case] expected: u32) {
        assert_eq!(cell_to_int::<u32>(text), Some(expected));
    }

    #[rstest]
    #[case("603000000 Hz", 603_000_000.0)]
    #[case(" 3.5 dBmV", 3.5)]
    #[case("-3.2 dBmV", -3.2)]
    #[case("39.8 dB", 39.8)]
    #[case("0", 0.0)]
    fn float_cells_read_leading_token(#[case] text: &str, #[case] expected: f64) {
        assert_eq!(cell_to_float(text), Some(expected));
    }

    #[rstest]
    #[case("")]
    #[case("   ")]
    #[case("Locked")]
    #[case("N/A")]
    #[case("1,000")]
    #[case("-1")]
    #[case("QAMQAM256")]
    fn unreadable_int_cells_are_rejected(#[case] text: &str) {
        assert_eq!(cell_to_int::<u64>(text), None);
    }

    #[test]
    fn unreadable_float_cells_are_rejected() {
        assert_eq!(cell_to_float(""), None);
        assert_eq!(cell_to_float("dBmV 3.5"), None);
        assert_eq!(cell_to_float("3,5"), None);
    }

    // ------------------------------------------------------------------------
    // Parser
    // ------------------------------------------------------------------------

    #[test]
    fn parses_single_channel_page() {
        let snapshot = parser().parse(single_channel_page().as_bytes()).unwrap();

        assert_eq!(
            snapshot.downstream(),
            &[DownstreamChannel {
                channel: 1,
                dcid: 5,
                modulation: 256,
                frequency_hz: 603_000_000.0,
                power_dbmv: 3.5,
                snr_db: 39.8,
                correcteds: 1000,
                uncorrectables: 2,
            }]
        );
        assert_eq!(
            snapshot.upstream(),
            &[UpstreamChannel {
                channel: 1,
                ucid: 3,
                channel_type: "ATDMA".into(),
                symbol_rate: 5120,
                frequency_hz: 35_600_000.0,
                power_dbmv: 45.2,
            }]
        );
    }

    #[test]
    fn parses_captured_status_page() {
        let snapshot = parser().parse(STATUS_PAGE.as_bytes()).unwrap();

        assert_eq!(snapshot.downstream().len(), 8);
        assert_eq!(snapshot.upstream().len(), 4);

        let channels: Vec<usize> = snapshot.downstream().iter().map(|c| c.channel).collect();
        assert_eq!(channels, (1..=8).collect::<Vec<_>>());

        let last = &snapshot.downstream()[7];
        assert_eq!(last.dcid, 8);
        assert_eq!(last.frequency_hz, 645_000_000.0);
        assert_eq!(last.power_dbmv, 1.5);
        assert_eq!(last.snr_db, 38.6);

        let slow = &snapshot.upstream()[3];
        assert_eq!(slow.ucid, 4);
        assert_eq!(slow.symbol_rate, 2560);
        assert_eq!(slow.power_dbmv, 43.9);
        assert_eq!(slow.channel_type, "ATDMA");
    }

    #[test]
    fn missing_downstream_table_yields_empty_downstream() {
        let body = page(
            None,
            Some(&[us_row(["1", "Locked", "ATDMA", "3", "5120", "35600000 Hz", "45.2 dBmV"])]),
        );
        let snapshot = parser().parse(body.as_bytes()).unwrap();

        assert!(snapshot.downstream().is_empty());
        assert_eq!(snapshot.upstream().len(), 1);
    }

    #[test]
    fn page_without_tables_is_empty() {
        let snapshot = parser().parse(b"<html><body>Login required</body></html>").unwrap();
        assert!(snapshot.is_empty());
    }

    #[test]
    fn header_only_tables_are_empty() {
        let snapshot = parser().parse(page(Some(&[]), Some(&[])).as_bytes()).unwrap();
        assert!(snapshot.is_empty());
    }

    #[test]
    fn malformed_cell_names_its_position() {
        let body = page(
            Some(&[
                ds_row(["1", "Locked", "256QAM", "5", "603000000 Hz", "3.5 dBmV", "39.8 dB", "10", "0"]),
                ds_row(["2", "Locked", "256QAM", "6", "609000000 Hz", "N/A", "39.7 dB", "10", "0"]),
            ]),
            None,
        );

        match parser().parse(body.as_bytes()) {
            Err(CollectError::MalformedModemData {
                direction,
                row,
                column,
                field,
                ..
            }) => {
                assert_eq!(direction, Direction::Downstream);
                assert_eq!(row, 2);
                assert_eq!(column, 5);
                assert_eq!(field, "power");
            }
            other => panic!("expected malformed data, got {:?}", other),
        }
    }

    #[test]
    fn short_row_is_malformed() {
        let body = page(
            None,
            Some(&["<tr><td>1</td><td>Locked</td><td>ATDMA</td><td>3</td></tr>".to_string()]),
        );

        let err = parser().parse(body.as_bytes()).unwrap_err();
        assert_eq!(err.kind(), CollectErrorKind::MalformedModemData);
        assert!(err.to_string().contains("only 4 cells"), "{}", err);
    }

    #[test]
    fn nested_markup_is_not_cell_text() {
        let trailing = page(
            Some(&[ds_row([
                "1", "Locked", "256QAM", "5", "603000000 Hz", "3.5 dBmV<sup>*</sup>", "39.8 dB", "1", "0",
            ])]),
            None,
        );
        let snapshot = parser().parse(trailing.as_bytes()).unwrap();
        assert_eq!(snapshot.downstream()[0].power_dbmv, 3.5);

        let wrapped = page(
            Some(&[ds_row([
                "1", "Locked", "256QAM", "5", "<b>603000000</b>", "3.5 dBmV", "39.8 dB", "1", "0",
            ])]),
            None,
        );
        let err = parser().parse(wrapped.as_bytes()).unwrap_err();
        assert_eq!(err.kind(), CollectErrorKind::MalformedModemData);
    }

    #[test]
    fn negative_counter_is_malformed() {
        let body = page(
            Some(&[ds_row(["1", "Locked", "256QAM", "5", "603000000 Hz", "3.5 dBmV", "39.8 dB", "-4", "0"])]),
            None,
        );
        let err = parser().parse(body.as_bytes()).unwrap_err();
        assert_eq!(err.kind(), CollectErrorKind::MalformedModemData);
    }

    #[test]
    fn custom_layout_reads_other_tables() {
        let layout = StatusPageLayout {
            downstream: DownstreamLayout {
                table_id: "downstreamChannels".into(),
                modulation: 1,
                dcid: 0,
                frequency: 2,
                power: 3,
                snr: 4,
                correcteds: 5,
                uncorrectables: 6,
            },
            upstream: UpstreamLayout {
                table_id: "upstreamChannels".into(),
                ..UpstreamLayout::default()
            },
        };
        let body = "<table id=\"downstreamChannels\"><tr><th>ID</th></tr>\
                    <tr><td>17</td><td>QAM256</td><td>555000000</td><td>-1.0</td><td>40.1</td><td>3</td><td>4</td></tr>\
                    </table>";

        let snapshot = StatusPageParser::new(layout).unwrap().parse(body.as_bytes()).unwrap();
        let channel = &snapshot.downstream()[0];
        assert_eq!(channel.dcid, 17);
        assert_eq!(channel.modulation, 256);
        assert_eq!(channel.power_dbmv, -1.0);
        assert!(snapshot.upstream().is_empty());
    }

    #[rstest]
    #[case("")]
    #[case("ds\"Table")]
    #[case("ds\\Table")]
    fn unusable_table_ids_are_config_errors(#[case] id: &str) {
        let layout = StatusPageLayout {
            downstream: DownstreamLayout {
                table_id: id.into(),
                ..DownstreamLayout::default()
            },
            ..StatusPageLayout::default()
        };
        assert!(matches!(
            StatusPageParser::new(layout),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    proptest! {
        #[test]
        fn every_data_row_is_parsed_in_order(
            downstream in prop::collection::vec((1u32..200, 0u64..10_000_000), 0..24),
            upstream in prop::collection::vec((1u32..16, 1u32..10_000), 0..8),
        ) {
            let ds_rows: Vec<String> = downstream
                .iter()
                .enumerate()
                .map(|(i, (dcid, corr))| {
                    let (index, dcid, corr) = ((i + 1).to_string(), dcid.to_string(), corr.to_string());
                    ds_row([index.as_str(), "Locked", "256QAM", dcid.as_str(), "603000000 Hz", "1.0 dBmV", "40.0 dB", corr.as_str(), "0"])
                })
                .collect();
            let us_rows: Vec<String> = upstream
                .iter()
                .enumerate()
                .map(|(i, (ucid, rate))| {
                    let (index, ucid, rate) = ((i + 1).to_string(), ucid.to_string(), rate.to_string());
                    us_row([index.as_str(), "Locked", "ATDMA", ucid.as_str(), rate.as_str(), "35600000 Hz", "45.0 dBmV"])
                })
                .collect();

            let snapshot = parser().parse(page(Some(&ds_rows), Some(&us_rows)).as_bytes()).unwrap();

            prop_assert_eq!(snapshot.downstream().len(), downstream.len());
            prop_assert_eq!(snapshot.upstream().len(), upstream.len());
            for (i, (channel, (dcid, corr))) in snapshot.downstream().iter().zip(&downstream).enumerate() {
                prop_assert_eq!(channel.channel, i + 1);
                prop_assert_eq!(channel.dcid, *dcid);
                prop_assert_eq!(channel.correcteds, *corr);
            }
            for (i, (channel, (ucid, rate))) in snapshot.upstream().iter().zip(&upstream).enumerate() {
                prop_assert_eq!(channel.channel, i + 1);
                prop_assert_eq!(channel.ucid, *ucid);
                prop_assert_eq!(channel.symbol_rate, *rate);
            }
        }
    }

    // ------------------------------------------------------------------------
    // Publisher
    // ------------------------------------------------------------------------

    fn value(metrics: &ModemMetrics, name: &str, index: &str, id: &str) -> Option<f64> {
        metrics
            .observations()
            .into_iter()
            .find(|o| {
                o.name == name
                    && (o.label("downstream") == Some(index) || o.label("upstream") == Some(index))
                    && (o.label("dcid") == Some(id) || o.label("ucid") == Some(id))
            })
            .map(|o| o.value)
    }

    #[test]
    fn families_are_described_before_publication() {
        let metrics = ModemMetrics::new(&PrometheusRegistry::new()).unwrap();
        let descriptors = metrics.descriptors();

        let names: Vec<&str> = descriptors.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "cm600_downstream_freq_hertz",
                "cm600_downstream_power_dbmv",
                "cm600_downstream_snr_db",
                "cm600_downstream_modulation_qam",
                "cm600_downstream_correcteds_total",
                "cm600_downstream_uncorrectables_total",
                "cm600_upstream_freq_hertz",
                "cm600_upstream_power_dbmv",
                "cm600_upstream_symbol_rate",
            ]
        );
        assert_eq!(descriptors[0].label_names, vec!["downstream", "dcid"]);
        assert_eq!(descriptors[8].label_names, vec!["upstream", "ucid"]);
        assert!(metrics.observations().is_empty());
    }

    #[test]
    fn publishing_writes_every_series() {
        let metrics = ModemMetrics::new(&PrometheusRegistry::new()).unwrap();
        let snapshot = parser().parse(single_channel_page().as_bytes()).unwrap();

        let written = metrics.publish(&snapshot, StaleSeriesPolicy::Retain);

        assert_eq!(written, 9);
        assert_eq!(metrics.observations().len(), 9);
        assert_eq!(value(&metrics, "cm600_downstream_freq_hertz", "1", "5"), Some(603_000_000.0));
        assert_eq!(value(&metrics, "cm600_downstream_power_dbmv", "1", "5"), Some(3.5));
        assert_eq!(value(&metrics, "cm600_downstream_snr_db", "1", "5"), Some(39.8));
        assert_eq!(value(&metrics, "cm600_downstream_modulation_qam", "1", "5"), Some(256.0));
        assert_eq!(value(&metrics, "cm600_downstream_correcteds_total", "1", "5"), Some(1000.0));
        assert_eq!(value(&metrics, "cm600_downstream_uncorrectables_total", "1", "5"), Some(2.0));
        assert_eq!(value(&metrics, "cm600_upstream_freq_hertz", "1", "3"), Some(35_600_000.0));
        assert_eq!(value(&metrics, "cm600_upstream_power_dbmv", "1", "3"), Some(45.2));
        assert_eq!(value(&metrics, "cm600_upstream_symbol_rate", "1", "3"), Some(5120.0));
    }

    #[rstest]
    #[case(StaleSeriesPolicy::Retain, 9)]
    #[case(StaleSeriesPolicy::Reset, 1)]
    fn vanished_channels_follow_stale_policy(#[case] policy: StaleSeriesPolicy, #[case] remaining: usize) {
        let metrics = ModemMetrics::new(&PrometheusRegistry::new()).unwrap();
        let full = parser().parse(STATUS_PAGE.as_bytes()).unwrap();
        let single = parser().parse(single_channel_page().as_bytes()).unwrap();

        metrics.publish(&full, policy);
        metrics.publish(&single, policy);

        let snr_series = metrics
            .observations()
            .into_iter()
            .filter(|o| o.name == "cm600_downstream_snr_db")
            .count();
        assert_eq!(snr_series, remaining);
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let registry = PrometheusRegistry::new();
        ModemMetrics::new(&registry).unwrap();
        assert!(ModemMetrics::new(&registry).is_err());
    }

    // ------------------------------------------------------------------------
    // Errors
    // ------------------------------------------------------------------------

    #[test]
    fn error_kinds_have_stable_labels() {
        let labels: Vec<&str> = CollectErrorKind::ALL.iter().map(|k| k.as_str()).collect();
        assert_eq!(
            labels,
            vec!["transport_error", "upstream_unavailable", "malformed_modem_data"]
        );

        let err = ExporterError::from(CollectError::UpstreamUnavailable {
            endpoint: "http://modem".into(),
            status: 503,
        });
        assert_eq!(err.category(), "upstream_unavailable");
        assert!(err.to_string().contains("HTTP 503"));
    }

    // ------------------------------------------------------------------------
    // Configuration
    // ------------------------------------------------------------------------

    #[test]
    fn default_config_is_valid() {
        let config = ExporterConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.modem.url, DEFAULT_MODEM_URL);
        assert_eq!(config.modem.timeout, Duration::from_secs(5));
        assert_eq!(config.modem.max_body_bytes, 2 * 1024 * 1024);
        assert_eq!(config.modem.poll_interval, None);
        assert_eq!(config.server.address, "0.0.0.0:9191");
        assert_eq!(config.server.metrics_path, "/metrics");
    }

    #[test]
    fn config_from_toml() {
        let config: ExporterConfig = r#"
            [modem]
            url = "https://10.0.0.1/DocsisStatus.htm"
            password = "hunter2"
            timeout = "1500ms"
            poll_interval = "30s"
            stale_series = "reset"

            [modem.layout.downstream]
            table_id = "downstream"

            [server]
            address = "127.0.0.1:9000"
            collect_on_scrape = false
        "#
        .parse()
        .unwrap();

        assert_eq!(config.modem.url, "https://10.0.0.1/DocsisStatus.htm");
        assert_eq!(config.modem.username, DEFAULT_MODEM_USERNAME);
        assert_eq!(config.modem.timeout, Duration::from_millis(1500));
        assert_eq!(config.modem.poll_interval, Some(Duration::from_secs(30)));
        assert_eq!(config.modem.stale_series, StaleSeriesPolicy::Reset);
        assert_eq!(config.modem.layout.downstream.table_id, "downstream");
        assert_eq!(config.modem.layout.downstream.snr, 6);
        assert_eq!(config.modem.layout.upstream, UpstreamLayout::default());
        assert!(!config.server.collect_on_scrape);
    }

    #[rstest]
    #[case("[modem]\nurl = \"not a url\"", "modem.url")]
    #[case("[modem]\nurl = \"ftp://192.168.100.1/\"", "modem.url")]
    #[case("[modem]\ntimeout = \"0s\"", "modem.timeout")]
    #[case("[modem]\nmax_body_bytes = 0", "modem.max_body_bytes")]
    #[case("[modem]\npoll_interval = \"200ms\"", "modem.poll_interval")]
    #[case("[server]\naddress = \":9191\"", "server.address")]
    #[case("[server]\nmetrics_path = \"metrics\"", "server.metrics_path")]
    #[case("[server]\nmetrics_path = \"/healthz\"", "server.metrics_path")]
    #[case("[server]\nmetrics_path = \"/metrics/*\"", "server.metrics_path")]
    #[case("[server]\nmetrics_path = \"/*rest\"", "server.metrics_path")]
    #[case("[server]\nmetrics_path = \"/scrape/:target\"", "server.metrics_path")]
    #[case("[modem.layout.upstream]\ntable_id = \"\"", "modem.layout.upstream.table_id")]
    fn invalid_values_are_rejected(#[case] toml: &str, #[case] expected: &str) {
        match toml.parse::<ExporterConfig>() {
            Err(ConfigError::InvalidValue { field, .. }) => assert_eq!(field, expected),
            other => panic!("expected invalid {}, got {:?}", expected, other),
        }
    }

    #[test]
    fn config_file_round_trips_through_generated_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cm600.toml");
        fs::write(&path, ExporterConfig::generate_default_config()).unwrap();

        let config = ExporterConfig::load(&path).unwrap();
        assert_eq!(config.modem.url, DEFAULT_MODEM_URL);
        assert_eq!(config.modem.layout, StatusPageLayout::default());
    }

    #[test]
    fn missing_config_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let err = ExporterConfig::load(dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound { .. }));
    }

    #[test]
    fn nested_literal_metrics_path_is_valid() {
        let config: ExporterConfig = "[server]\nmetrics_path = \"/modem/cm600/metrics\""
            .parse()
            .unwrap();
        assert_eq!(config.server.metrics_path, "/modem/cm600/metrics");
    }

    #[test]
    fn numeric_env_credentials_stay_strings() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("CM600_MODEM__USERNAME", "4242");
            jail.set_env("CM600_MODEM__PASSWORD", "0012345678");
            jail.set_env("CM600_MODEM__TIMEOUT", "2s");

            let config = ExporterConfig::resolve(None).map_err(|e| e.to_string())?;
            assert_eq!(config.modem.username, "4242");
            assert_eq!(config.modem.password, "0012345678");
            assert_eq!(config.modem.url, DEFAULT_MODEM_URL);
            assert_eq!(config.modem.timeout, Duration::from_secs(2));
            Ok(())
        });
    }

    #[test]
    fn credential_env_names_follow_section_separator() {
        assert_eq!(env_var_name("modem.password"), "CM600_MODEM__PASSWORD");
        assert_eq!(env_var_name("modem.url"), "CM600_MODEM__URL");
    }

    #[test]
    fn debug_output_redacts_password() {
        let mut config = ModemConfig::default();
        config.password = "s3cret-modem-pass".into();
        let rendered = format!("{:?}", config);
        assert!(!rendered.contains("s3cret-modem-pass"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn cli_flags_override_config() {
        let cli = Cli::parse_from([
            "cm600-exporter",
            "--modem-url",
            "http://10.1.1.1/DocsisStatus.asp",
            "--modem-password",
            "letmein",
            "--listen-address",
            "127.0.0.1:9292",
            "--metrics-path",
            "/modem-metrics",
            "validate",
            "--verbose",
        ]);
        let mut config = ExporterConfig::default();
        cli.apply_overrides(&mut config);

        assert_eq!(config.modem.url, "http://10.1.1.1/DocsisStatus.asp");
        assert_eq!(config.modem.password, "letmein");
        assert_eq!(config.server.address, "127.0.0.1:9292");
        assert_eq!(config.server.metrics_path, "/modem-metrics");
        assert_eq!(cli.command, Some(Commands::Validate { verbose: true }));
    }

    #[test]
    fn scrape_subcommand_parses_format() {
        let cli = Cli::parse_from(["cm600-exporter", "scrape", "--format", "json"]);
        assert_eq!(
            cli.command,
            Some(Commands::Scrape {
                format: ScrapeFormat::Json
            })
        );
    }
}

// ============================================================================
// SECTION 16: COLLECTION & SERVER TESTS
// ============================================================================
