use std::future::Future;
use std::time::Duration;

use reqwest::header::{
    AUTHORIZATION, CONTENT_ENCODING, CONTENT_TYPE, HeaderMap, HeaderValue, RETRY_AFTER,
    USER_AGENT,
};
use reqwest::{Certificate, Client, Identity, Proxy, StatusCode};
use thiserror::Error;
use url::Url;

use crate::config::{Compression, Config};
use crate::record::EncodedPayload;

pub const USER_AGENT_VALUE: &str = concat!("metrics-http-exporter/", env!("CARGO_PKG_VERSION"));

/// Error bodies are kept for diagnostics, but a misbehaving collector must not
/// be able to blow up log lines.
const MAX_ERROR_BODY: usize = 1024;

/// One delivery attempt of an already-encoded payload.
pub trait Deliver: Send + Sync + 'static {
    fn send(
        &self,
        payload: &EncodedPayload,
    ) -> impl Future<Output = Result<(), DeliveryError>> + Send;
}

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("failed to send request: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("HTTP request failed with status {status}: {body}")]
    Rejected {
        status: StatusCode,
        body: String,
        retry_after: Option<Duration>,
    },

    #[error("request timed out after {0:?}")]
    Timeout(Duration),
}

impl DeliveryError {
    /// Delay the collector asked for, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            DeliveryError::Rejected { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ClientBuildError {
    #[error("invalid CA certificate: {0}")]
    CaCertificate(reqwest::Error),

    #[error("invalid client certificate or key: {0}")]
    ClientIdentity(reqwest::Error),

    #[error("invalid proxy {url}: {source}")]
    Proxy { url: Url, source: reqwest::Error },

    #[error("failed to build HTTP client: {0}")]
    Build(reqwest::Error),

    #[error("API key is not a valid header value")]
    ApiKey,
}

/// POSTs encoded payloads to the configured collector endpoint.
///
/// The underlying `reqwest::Client` (and its connection pool) is built once
/// and shared read-only by every worker.
#[derive(Debug, Clone)]
pub struct HttpSender {
    client: Client,
    endpoint: Url,
    headers: HeaderMap,
}

impl HttpSender {
    /// Build the HTTP client from the TLS/proxy settings. Must run before the
    /// pipeline accepts any batch.
    pub fn new(config: &Config) -> Result<Self, ClientBuildError> {
        let mut builder = Client::builder();

        if let Some(pem) = &config.tls_ca {
            let cert = Certificate::from_pem(pem).map_err(ClientBuildError::CaCertificate)?;
            builder = builder.add_root_certificate(cert);
        }

        if let (Some(cert), Some(key)) = (&config.tls_client_cert, &config.tls_client_key) {
            let mut pem = cert.clone();
            pem.push(b'\n');
            pem.extend_from_slice(key);
            let identity = Identity::from_pem(&pem).map_err(ClientBuildError::ClientIdentity)?;
            builder = builder.identity(identity);
        }

        builder = match &config.proxy {
            Some(url) => {
                let proxy = Proxy::all(url.as_str()).map_err(|source| ClientBuildError::Proxy {
                    url: url.clone(),
                    source,
                })?;
                builder.proxy(proxy)
            }
            None => builder.no_proxy(),
        };

        let client = builder.build().map_err(ClientBuildError::Build)?;

        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            headers: request_headers(config)?,
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

/// Built-in headers first, then custom headers, which win on collision.
fn request_headers(config: &Config) -> Result<HeaderMap, ClientBuildError> {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(USER_AGENT, HeaderValue::from_static(USER_AGENT_VALUE));

    if let Some(key) = &config.api_key {
        let mut value = HeaderValue::from_str(&format!("Bearer {}", key.expose()))
            .map_err(|_| ClientBuildError::ApiKey)?;
        value.set_sensitive(true);
        headers.insert(AUTHORIZATION, value);
    }

    if config.compression == Compression::Gzip {
        headers.insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));
    }

    for (name, value) in &config.export_headers {
        headers.insert(name.clone(), value.clone());
    }

    Ok(headers)
}

impl Deliver for HttpSender {
    async fn send(&self, payload: &EncodedPayload) -> Result<(), DeliveryError> {
        let resp = self
            .client
            .post(self.endpoint.clone())
            .headers(self.headers.clone())
            .body(payload.body.clone())
            .send()
            .await?;

        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }

        let retry_after = parse_retry_after(resp.headers());
        let body = match read_error_body(resp).await {
            Ok(text) => text,
            Err(e) => format!("<failed to read response body: {e}>"),
        };

        Err(DeliveryError::Rejected {
            status,
            body,
            retry_after,
        })
    }
}

/// Reads at most a little past `MAX_ERROR_BODY` bytes; the rest of the body
/// is never buffered.
async fn read_error_body(mut resp: reqwest::Response) -> Result<String, reqwest::Error> {
    let mut buf = Vec::new();
    while buf.len() <= MAX_ERROR_BODY {
        match resp.chunk().await? {
            Some(chunk) => buf.extend_from_slice(&chunk),
            None => break,
        }
    }
    Ok(truncate(
        String::from_utf8_lossy(&buf).into_owned(),
        MAX_ERROR_BODY,
    ))
}

/// Only the delay-seconds form; HTTP-dates are ignored.
fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

fn truncate(mut text: String, max: usize) -> String {
    if text.len() > max {
        let mut end = max;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        text.truncate(end);
        text.push_str("...");
    }
    text
}
