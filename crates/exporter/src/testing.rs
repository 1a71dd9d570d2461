use std::collections::VecDeque;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::header::HeaderMap;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder;
use tokio::net::TcpListener;

use crate::config::{Compression, Config, MetricFormat, QueueConfig, RetryConfig};
use crate::delivery::{Deliver, DeliveryError};
use crate::model::{Labels, Metric, MetricBatch, NumberDataPoint, ResourceGroup, ScopeGroup};
use crate::record::EncodedPayload;

fn rejected(status: StatusCode, body: &str) -> DeliveryError {
    DeliveryError::Rejected {
        status,
        body: body.to_owned(),
        retry_after: None,
    }
}

/// Fails the first `failures` attempts with a 503, then succeeds.
pub struct FlakySender {
    failures: usize,
    pub attempts: AtomicUsize,
    /// Body of every attempt, failed ones included.
    pub sent: Mutex<Vec<Bytes>>,
    pub delivered: Mutex<Vec<Bytes>>,
}

impl FlakySender {
    pub fn new(failures: usize) -> Self {
        Self {
            failures,
            attempts: AtomicUsize::new(0),
            sent: Mutex::new(Vec::new()),
            delivered: Mutex::new(Vec::new()),
        }
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl Deliver for FlakySender {
    async fn send(&self, payload: &EncodedPayload) -> Result<(), DeliveryError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        self.sent.lock().unwrap().push(payload.body.clone());
        if attempt < self.failures {
            return Err(rejected(StatusCode::SERVICE_UNAVAILABLE, "try later"));
        }
        self.delivered.lock().unwrap().push(payload.body.clone());
        Ok(())
    }
}

/// Every attempt fails with a 500.
pub struct FailingSender {
    pub attempts: AtomicUsize,
}

impl FailingSender {
    pub fn new() -> Self {
        Self {
            attempts: AtomicUsize::new(0),
        }
    }
}

impl Deliver for FailingSender {
    async fn send(&self, _payload: &EncodedPayload) -> Result<(), DeliveryError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(rejected(StatusCode::INTERNAL_SERVER_ERROR, "server error"))
    }
}

/// Sleeps `delay` before succeeding. Used to exercise timeouts, draining and
/// cancellation.
pub struct SlowSender {
    delay: Duration,
    pub attempts: AtomicUsize,
    pub delivered: AtomicUsize,
}

impl SlowSender {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            attempts: AtomicUsize::new(0),
            delivered: AtomicUsize::new(0),
        }
    }
}

impl Deliver for SlowSender {
    async fn send(&self, _payload: &EncodedPayload) -> Result<(), DeliveryError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.delivered.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Returns a fixed sequence of results, then succeeds.
pub struct ScriptedSender {
    script: Mutex<VecDeque<DeliveryError>>,
    pub attempts: AtomicUsize,
}

impl ScriptedSender {
    pub fn new(script: Vec<DeliveryError>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            attempts: AtomicUsize::new(0),
        }
    }
}

impl Deliver for ScriptedSender {
    async fn send(&self, _payload: &EncodedPayload) -> Result<(), DeliveryError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        match self.script.lock().unwrap().pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Retry settings with no jitter so delays are exact.
pub fn fixed_retry(initial_ms: u64, max_elapsed_ms: u64) -> RetryConfig {
    RetryConfig {
        enabled: true,
        initial_interval: Duration::from_millis(initial_ms),
        max_interval: Duration::from_millis(initial_ms * 8),
        max_elapsed_time: Duration::from_millis(max_elapsed_ms),
        multiplier: 2.0,
        randomization_factor: 0.0,
    }
}

/// One gauge metric with `points` data points.
pub fn gauge_batch(name: &str, points: usize) -> MetricBatch {
    let data_points = (0..points)
        .map(|i| NumberDataPoint {
            time_unix_nano: 1_700_000_000_000_000_000,
            labels: Labels::new(),
            value: i as f64,
        })
        .collect();
    MetricBatch::new(vec![ResourceGroup {
        labels: Labels::new(),
        scopes: vec![ScopeGroup {
            metrics: vec![Metric::gauge(name, "1", data_points)],
            ..Default::default()
        }],
    }])
}

pub fn dummy_config(endpoint: &str) -> Config {
    let _ = rustls::crypto::ring::default_provider().install_default();
    Config {
        endpoint: url::Url::parse(endpoint).unwrap(),
        api_key: None,
        metric_format: MetricFormat::Json,
        export_headers: vec![],
        compression: Compression::None,
        export_timeout: Duration::from_millis(500),
        tls_ca: None,
        tls_client_cert: None,
        tls_client_key: None,
        proxy: None,
        queue: QueueConfig::default(),
        retry: fixed_retry(10, 1_000),
        drain_timeout: Duration::from_millis(500),
        listener_port: 0,
    }
}

#[derive(Debug, Clone)]
pub struct CapturedRequest {
    pub path: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

#[derive(Clone)]
pub struct ScriptedResponse {
    pub status: StatusCode,
    pub body: &'static str,
    pub retry_after: Option<&'static str>,
}

#[derive(Default)]
pub struct CollectorState {
    pub requests: Mutex<Vec<CapturedRequest>>,
    responses: Mutex<VecDeque<ScriptedResponse>>,
}

impl CollectorState {
    pub fn requests(&self) -> Vec<CapturedRequest> {
        self.requests.lock().unwrap().clone()
    }
}

/// Local HTTP collector that records every request and answers from `script`
/// (200 once the script runs out). Returns the bound address.
pub async fn mock_collector(script: Vec<ScriptedResponse>) -> (SocketAddr, Arc<CollectorState>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let state = Arc::new(CollectorState {
        requests: Mutex::new(Vec::new()),
        responses: Mutex::new(script.into()),
    });

    let shared = Arc::clone(&state);
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let state = Arc::clone(&shared);
            tokio::spawn(async move {
                let service = service_fn(move |req| {
                    let state = Arc::clone(&state);
                    record(req, state)
                });
                let _ = Builder::new(TokioExecutor::new())
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });

    (addr, state)
}

async fn record<B>(
    req: Request<B>,
    state: Arc<CollectorState>,
) -> Result<Response<Full<Bytes>>, Infallible>
where
    B: hyper::body::Body<Data = Bytes> + Send + 'static,
{
    let path = req.uri().path().to_owned();
    let headers = req.headers().clone();
    let body = req
        .collect()
        .await
        .map(|c| c.to_bytes())
        .unwrap_or_default();
    state.requests.lock().unwrap().push(CapturedRequest {
        path,
        headers,
        body,
    });

    let scripted = state.responses.lock().unwrap().pop_front();
    let response = match scripted {
        Some(s) => {
            let mut builder = Response::builder().status(s.status);
            if let Some(secs) = s.retry_after {
                builder = builder.header("Retry-After", secs);
            }
            builder.body(Full::new(Bytes::from_static(s.body.as_bytes())))
        }
        None => Response::builder()
            .status(StatusCode::OK)
            .body(Full::default()),
    };
    Ok(response.unwrap())
}
