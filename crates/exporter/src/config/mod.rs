use std::collections::HashMap;
use std::env;
use std::fmt;
use std::time::Duration;

use reqwest::header::{HeaderName, HeaderValue};
use thiserror::Error;
use url::Url;

const PREFIX: &str = "METRICS_EXPORTER_";

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Compression {
    Gzip,
    None,
}

/// Only JSON is spoken on the wire; the setting exists so configs that name
/// it explicitly keep validating.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MetricFormat {
    Json,
}

/// What `submit` does when the queue is at capacity.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OverflowPolicy {
    /// Fail fast with `SubmitError::QueueFull`.
    Reject,
    /// Wait for a free slot (backpressure on the producer).
    Block,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("METRICS_EXPORTER_ENDPOINT is required but not set")]
    EndpointMissing,

    #[error("METRICS_EXPORTER_ENDPOINT is not a valid URL: {0}")]
    EndpointInvalidUrl(String),

    #[error("{0} has invalid value: {1}")]
    InvalidNumeric(String, String),

    #[error("{0} must be greater than zero")]
    Zero(String),

    #[error("METRICS_EXPORTER_COMPRESSION has invalid value: {0} (expected \"gzip\" or \"none\")")]
    InvalidCompression(String),

    #[error("METRICS_EXPORTER_METRIC_FORMAT has unsupported value: {0} (expected \"json\")")]
    InvalidMetricFormat(String),

    #[error("METRICS_EXPORTER_QUEUE_FULL has invalid value: {0} (expected \"reject\" or \"block\")")]
    InvalidOverflowPolicy(String),

    #[error("METRICS_EXPORTER_HEADERS contains an invalid header: {0}")]
    InvalidHeader(String),

    #[error("failed to read {var} file {path}: {source}")]
    CertificateFile {
        var: &'static str,
        path: String,
        source: std::io::Error,
    },

    #[error("METRICS_EXPORTER_CLIENT_CERT and METRICS_EXPORTER_CLIENT_KEY must both be set")]
    ClientIdentityIncomplete,

    #[error("METRICS_EXPORTER_PROXY_URL is not a valid URL: {0}")]
    ProxyInvalidUrl(String),
}

/// Opaque credential; never printed.
#[derive(Clone, PartialEq)]
pub struct ApiKey(String);

impl ApiKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ApiKey(***)")
    }
}

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub enabled: bool,
    pub initial_interval: Duration,
    pub max_interval: Duration,
    /// Budget across all attempts of one batch.
    pub max_elapsed_time: Duration,
    pub multiplier: f64,
    /// Each delay is drawn from `[d * (1 - f), d * (1 + f)]`.
    pub randomization_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_interval: Duration::from_secs(5),
            max_interval: Duration::from_secs(30),
            max_elapsed_time: Duration::from_secs(300),
            multiplier: 1.5,
            randomization_factor: 0.5,
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub queue_size: usize,
    pub num_consumers: usize,
    pub overflow: OverflowPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            queue_size: 1000,
            num_consumers: 10,
            overflow: OverflowPolicy::Reject,
        }
    }
}

#[derive(Debug)]
pub struct Config {
    pub endpoint: Url,
    pub api_key: Option<ApiKey>,
    pub metric_format: MetricFormat,
    pub export_headers: Vec<(HeaderName, HeaderValue)>,
    pub compression: Compression,
    /// Per-attempt deadline for one HTTP request.
    pub export_timeout: Duration,
    pub tls_ca: Option<Vec<u8>>,
    pub tls_client_cert: Option<Vec<u8>>,
    pub tls_client_key: Option<Vec<u8>>,
    pub proxy: Option<Url>,
    pub queue: QueueConfig,
    pub retry: RetryConfig,
    pub drain_timeout: Duration,
    pub listener_port: u16,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let vars: HashMap<String, String> = env::vars()
            .filter(|(k, _)| k.starts_with(PREFIX))
            .collect();
        Self::parse(&vars)
    }

    /// Parse from an explicit set of variables instead of the process environment.
    pub fn parse(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let endpoint = parse_endpoint(vars)?;
        let api_key = vars
            .get("METRICS_EXPORTER_API_KEY")
            .filter(|s| !s.is_empty())
            .map(|s| ApiKey::new(s.as_str()));
        let metric_format = parse_metric_format(vars)?;
        let export_headers = parse_headers(vars)?;
        let compression = parse_compression(vars)?;
        let export_timeout = parse_duration_ms(vars, "METRICS_EXPORTER_TIMEOUT_MS", 30_000)?;
        let tls_ca = read_file_var(vars, "METRICS_EXPORTER_CERTIFICATE")?;
        let tls_client_cert = read_file_var(vars, "METRICS_EXPORTER_CLIENT_CERT")?;
        let tls_client_key = read_file_var(vars, "METRICS_EXPORTER_CLIENT_KEY")?;
        if tls_client_cert.is_some() != tls_client_key.is_some() {
            return Err(ConfigError::ClientIdentityIncomplete);
        }
        let proxy = parse_proxy(vars)?;
        let queue = parse_queue(vars)?;
        let retry = parse_retry(vars)?;
        let drain_timeout = parse_duration_ms(vars, "METRICS_EXPORTER_DRAIN_TIMEOUT_MS", 5_000)?;
        let listener_port = parse_port(vars, "METRICS_EXPORTER_LISTENER_PORT", 4318)?;

        Ok(Self {
            endpoint,
            api_key,
            metric_format,
            export_headers,
            compression,
            export_timeout,
            tls_ca,
            tls_client_cert,
            tls_client_key,
            proxy,
            queue,
            retry,
            drain_timeout,
            listener_port,
        })
    }
}

fn parse_endpoint(vars: &HashMap<String, String>) -> Result<Url, ConfigError> {
    let raw = vars
        .get("METRICS_EXPORTER_ENDPOINT")
        .filter(|s| !s.is_empty())
        .ok_or(ConfigError::EndpointMissing)?;

    Url::parse(raw).map_err(|_| ConfigError::EndpointInvalidUrl(raw.clone()))
}

fn parse_proxy(vars: &HashMap<String, String>) -> Result<Option<Url>, ConfigError> {
    match vars
        .get("METRICS_EXPORTER_PROXY_URL")
        .filter(|s| !s.is_empty())
    {
        Some(raw) => Url::parse(raw)
            .map(Some)
            .map_err(|_| ConfigError::ProxyInvalidUrl(raw.clone())),
        None => Ok(None),
    }
}

fn parse_port(
    vars: &HashMap<String, String>,
    name: &str,
    default: u16,
) -> Result<u16, ConfigError> {
    parse_number(vars, name, default)
}

fn parse_number<T: std::str::FromStr>(
    vars: &HashMap<String, String>,
    name: &str,
    default: T,
) -> Result<T, ConfigError> {
    match vars.get(name) {
        Some(val) => val
            .parse()
            .map_err(|_| ConfigError::InvalidNumeric(name.to_owned(), val.clone())),
        None => Ok(default),
    }
}

fn parse_nonzero(
    vars: &HashMap<String, String>,
    name: &str,
    default: usize,
) -> Result<usize, ConfigError> {
    match parse_number(vars, name, default)? {
        0 => Err(ConfigError::Zero(name.to_owned())),
        n => Ok(n),
    }
}

fn parse_duration_ms(
    vars: &HashMap<String, String>,
    name: &str,
    default_ms: u64,
) -> Result<Duration, ConfigError> {
    parse_number(vars, name, default_ms).map(Duration::from_millis)
}

fn parse_bool(
    vars: &HashMap<String, String>,
    name: &str,
    default: bool,
) -> Result<bool, ConfigError> {
    match vars.get(name).map(|s| s.as_str()) {
        None | Some("") => Ok(default),
        Some("true") | Some("1") => Ok(true),
        Some("false") | Some("0") => Ok(false),
        Some(other) => Err(ConfigError::InvalidNumeric(name.to_owned(), other.to_owned())),
    }
}

fn parse_metric_format(vars: &HashMap<String, String>) -> Result<MetricFormat, ConfigError> {
    match vars
        .get("METRICS_EXPORTER_METRIC_FORMAT")
        .map(|s| s.as_str())
    {
        Some("json") | Some("") | None => Ok(MetricFormat::Json),
        Some(other) => Err(ConfigError::InvalidMetricFormat(other.to_owned())),
    }
}

fn parse_compression(vars: &HashMap<String, String>) -> Result<Compression, ConfigError> {
    match vars
        .get("METRICS_EXPORTER_COMPRESSION")
        .map(|s| s.as_str())
    {
        Some("none") | Some("") | None => Ok(Compression::None),
        Some("gzip") => Ok(Compression::Gzip),
        Some(other) => Err(ConfigError::InvalidCompression(other.to_owned())),
    }
}

fn parse_queue(vars: &HashMap<String, String>) -> Result<QueueConfig, ConfigError> {
    let defaults = QueueConfig::default();
    let overflow = match vars.get("METRICS_EXPORTER_QUEUE_FULL").map(|s| s.as_str()) {
        Some("reject") | Some("") | None => OverflowPolicy::Reject,
        Some("block") => OverflowPolicy::Block,
        Some(other) => return Err(ConfigError::InvalidOverflowPolicy(other.to_owned())),
    };

    Ok(QueueConfig {
        queue_size: parse_nonzero(vars, "METRICS_EXPORTER_QUEUE_SIZE", defaults.queue_size)?,
        num_consumers: parse_nonzero(
            vars,
            "METRICS_EXPORTER_NUM_CONSUMERS",
            defaults.num_consumers,
        )?,
        overflow,
    })
}

fn parse_retry(vars: &HashMap<String, String>) -> Result<RetryConfig, ConfigError> {
    let defaults = RetryConfig::default();
    let ms = |d: Duration| d.as_millis() as u64;

    let multiplier: f64 = parse_number(
        vars,
        "METRICS_EXPORTER_RETRY_MULTIPLIER",
        defaults.multiplier,
    )?;
    if !multiplier.is_finite() || multiplier < 1.0 {
        return Err(ConfigError::InvalidNumeric(
            "METRICS_EXPORTER_RETRY_MULTIPLIER".to_owned(),
            multiplier.to_string(),
        ));
    }

    let randomization_factor: f64 = parse_number(
        vars,
        "METRICS_EXPORTER_RETRY_RANDOMIZATION",
        defaults.randomization_factor,
    )?;
    if !(0.0..=1.0).contains(&randomization_factor) {
        return Err(ConfigError::InvalidNumeric(
            "METRICS_EXPORTER_RETRY_RANDOMIZATION".to_owned(),
            randomization_factor.to_string(),
        ));
    }

    Ok(RetryConfig {
        enabled: parse_bool(vars, "METRICS_EXPORTER_RETRY_ENABLED", defaults.enabled)?,
        initial_interval: parse_duration_ms(
            vars,
            "METRICS_EXPORTER_RETRY_INITIAL_INTERVAL_MS",
            ms(defaults.initial_interval),
        )?,
        max_interval: parse_duration_ms(
            vars,
            "METRICS_EXPORTER_RETRY_MAX_INTERVAL_MS",
            ms(defaults.max_interval),
        )?,
        max_elapsed_time: parse_duration_ms(
            vars,
            "METRICS_EXPORTER_RETRY_MAX_ELAPSED_MS",
            ms(defaults.max_elapsed_time),
        )?,
        multiplier,
        randomization_factor,
    })
}

/// Read the file named by `var`. An unset or empty variable means "not configured".
fn read_file_var(
    vars: &HashMap<String, String>,
    var: &'static str,
) -> Result<Option<Vec<u8>>, ConfigError> {
    let Some(path) = vars.get(var).filter(|s| !s.is_empty()) else {
        return Ok(None);
    };
    std::fs::read(path)
        .map(Some)
        .map_err(|source| ConfigError::CertificateFile {
            var,
            path: path.clone(),
            source,
        })
}

fn parse_headers(
    vars: &HashMap<String, String>,
) -> Result<Vec<(HeaderName, HeaderValue)>, ConfigError> {
    let Some(raw) = vars
        .get("METRICS_EXPORTER_HEADERS")
        .filter(|s| !s.is_empty())
    else {
        return Ok(Vec::new());
    };

    raw.split(',')
        .filter_map(|pair| {
            let (k, v) = pair.split_once('=')?;
            let k = k.trim();
            let v = v.trim();
            if k.is_empty() {
                return None;
            }
            Some((k, v))
        })
        .map(|(k, v)| {
            let name = HeaderName::from_bytes(k.as_bytes())
                .map_err(|_| ConfigError::InvalidHeader(k.to_owned()))?;
            let value =
                HeaderValue::from_str(v).map_err(|_| ConfigError::InvalidHeader(k.to_owned()))?;
            Ok((name, value))
        })
        .collect()
}
