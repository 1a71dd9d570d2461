//! Diagnostic HTTP sink: every POSTed body is written to its own file, and
//! `GET /config` serves a fixed file back.

use std::collections::HashMap;
use std::convert::Infallible;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const PREFIX: &str = "TEST_SINK_";
const DUMP_PREFIX: &str = "request_body_";

#[derive(Debug, Error)]
pub enum SinkConfigError {
    #[error("TEST_SINK_PORT has invalid value: {0}")]
    InvalidPort(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct SinkConfig {
    pub port: u16,
    pub dump_dir: PathBuf,
    pub config_file: PathBuf,
}

impl SinkConfig {
    pub fn from_env() -> Result<Self, SinkConfigError> {
        let vars: HashMap<String, String> = std::env::vars()
            .filter(|(k, _)| k.starts_with(PREFIX))
            .collect();
        Self::parse(&vars)
    }

    pub fn parse(vars: &HashMap<String, String>) -> Result<Self, SinkConfigError> {
        let get = |name: &str| vars.get(&format!("{PREFIX}{name}")).filter(|v| !v.is_empty());

        let port = match get("PORT") {
            Some(v) => v
                .parse()
                .map_err(|_| SinkConfigError::InvalidPort(v.clone()))?,
            None => 8080,
        };

        Ok(Self {
            port,
            dump_dir: get("DUMP_DIR").map_or_else(|| "dumps".into(), PathBuf::from),
            config_file: get("CONFIG_FILE")
                .map_or_else(|| "config/config.yaml".into(), PathBuf::from),
        })
    }
}

/// Shared request state: where to write, what to serve, and a sequence
/// number that keeps file names unique within one millisecond.
#[derive(Debug)]
pub struct Sink {
    dump_dir: PathBuf,
    config_file: PathBuf,
    seq: AtomicU64,
}

impl Sink {
    pub fn new(config: &SinkConfig) -> Self {
        Self {
            dump_dir: config.dump_dir.clone(),
            config_file: config.config_file.clone(),
            seq: AtomicU64::new(0),
        }
    }

    fn next_dump_path(&self) -> PathBuf {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        self.dump_dir
            .join(format!("{DUMP_PREFIX}{millis:013}_{seq:06}.txt"))
    }

    async fn dump(&self, body: &[u8]) -> std::io::Result<PathBuf> {
        tokio::fs::create_dir_all(&self.dump_dir).await?;
        let path = self.next_dump_path();
        tokio::fs::write(&path, body).await?;
        Ok(path)
    }
}

fn response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(body.into()))
        .unwrap()
}

async fn handle<B>(req: Request<B>, sink: Arc<Sink>) -> Result<Response<Full<Bytes>>, Infallible>
where
    B: hyper::body::Body<Data = Bytes> + Send + 'static,
{
    let method = req.method().clone();
    let path = req.uri().path().to_owned();

    if method == Method::GET && path == "/config" {
        return Ok(match tokio::fs::read(&sink.config_file).await {
            Ok(contents) => response(StatusCode::OK, contents),
            Err(e) => {
                warn!(file = %sink.config_file.display(), error = %e, "config file unavailable");
                response(StatusCode::NOT_FOUND, "config not found")
            }
        });
    }

    if method != Method::POST {
        return Ok(response(StatusCode::METHOD_NOT_ALLOWED, Bytes::new()));
    }

    let headers: Vec<String> = req
        .headers()
        .iter()
        .map(|(name, value)| format!("{name}: {}", value.to_str().unwrap_or("<binary>")))
        .collect();
    info!(%method, path, headers = headers.join(", "), "received request");

    let body = match req.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(_) => return Ok(response(StatusCode::BAD_REQUEST, "failed to read body")),
    };

    match sink.dump(&body).await {
        Ok(file) => {
            debug!(file = %file.display(), bytes = body.len(), "request body saved");
            Ok(response(StatusCode::OK, "Request received and saved"))
        }
        Err(e) => {
            error!(error = %e, "failed to save request body");
            Ok(response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to save request body"))
        }
    }
}

/// Accept connections until `cancel` fires.
pub async fn serve(listener: TcpListener, sink: Arc<Sink>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            result = listener.accept() => {
                let stream = match result {
                    Ok((stream, _)) => stream,
                    Err(e) => {
                        warn!(error = %e, "failed to accept connection");
                        continue;
                    }
                };
                let sink = Arc::clone(&sink);
                tokio::spawn(async move {
                    let service = service_fn(move |req| {
                        let sink = Arc::clone(&sink);
                        handle(req, sink)
                    });
                    let _ = Builder::new(TokioExecutor::new())
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
            _ = cancel.cancelled() => {
                break;
            }
        }
    }
}

/// Dumped bodies in `dir`, oldest first. A missing directory is empty.
pub fn read_dumps(dir: &Path) -> std::io::Result<Vec<Vec<u8>>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut paths = Vec::new();
    for entry in entries {
        let path = entry?.path();
        let is_dump = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with(DUMP_PREFIX));
        if is_dump {
            paths.push(path);
        }
    }
    paths.sort();
    paths.into_iter().map(std::fs::read).collect()
}

/// Poll `dir` until at least `min_expected` dumps exist or `timeout` passes,
/// then return whatever is there.
pub async fn wait_for_dumps(
    dir: &Path,
    min_expected: usize,
    timeout: Duration,
) -> std::io::Result<Vec<Vec<u8>>> {
    let deadline = tokio::time::Instant::now() + timeout;

    loop {
        let dumps = read_dumps(dir)?;
        if dumps.len() >= min_expected || tokio::time::Instant::now() >= deadline {
            return Ok(dumps);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[cfg(test)]
mod tests;
