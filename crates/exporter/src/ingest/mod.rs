use std::convert::Infallible;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::model::MetricBatch;
use crate::pipeline::{Pipeline, SubmitError};

pub const INGEST_PATH: &str = "/v1/metrics";

fn response(status: StatusCode) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::default())
        .unwrap()
}

/// Route, method and body checks, then JSON decoding.
async fn validate<B>(req: Request<B>) -> Result<MetricBatch, (StatusCode, String)>
where
    B: hyper::body::Body<Data = Bytes> + Send + 'static,
{
    let path = req.uri().path().to_owned();
    let method = req.method().clone();

    if path != INGEST_PATH {
        return Err((StatusCode::NOT_FOUND, format!("unknown path: {path}")));
    }
    if method != Method::POST {
        return Err((StatusCode::METHOD_NOT_ALLOWED, format!("{method} {path}")));
    }

    let body = req.collect().await.map(|c| c.to_bytes()).map_err(|_| {
        (
            StatusCode::BAD_REQUEST,
            format!("POST {path}: failed to read body"),
        )
    })?;

    serde_json::from_slice(&body)
        .map_err(|e| (StatusCode::BAD_REQUEST, format!("POST {path}: invalid batch: {e}")))
}

async fn handle<B>(
    req: Request<B>,
    pipeline: Arc<Pipeline>,
) -> Result<Response<Full<Bytes>>, Infallible>
where
    B: hyper::body::Body<Data = Bytes> + Send + 'static,
{
    let batch = match validate(req).await {
        Ok(batch) => batch,
        Err((status, reason)) => {
            warn!(reason, "ingest request rejected");
            return Ok(response(status));
        }
    };
    debug!(data_points = batch.data_point_count(), "received metric batch");

    // A client that disconnects while blocked on a full queue drops this
    // future, so the batch never needs to be cancelled from here.
    let cancel = CancellationToken::new();
    match pipeline.submit(batch, &cancel).await {
        Ok(()) => Ok(response(StatusCode::OK)),
        Err(SubmitError::QueueFull | SubmitError::Cancelled) => Ok(Response::builder()
            .status(StatusCode::SERVICE_UNAVAILABLE)
            .header("Retry-After", "1")
            .body(Full::default())
            .unwrap()),
        // Shutting down; the exporter behind this endpoint is gone.
        Err(SubmitError::Closed) => Ok(response(StatusCode::BAD_GATEWAY)),
    }
}

/// Accept connections until `cancel` fires. Batches are handed to `pipeline`.
pub async fn serve(listener: TcpListener, pipeline: Arc<Pipeline>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            result = listener.accept() => {
                let stream = match result {
                    Ok((stream, _)) => stream,
                    Err(e) => {
                        warn!(error = %e, "failed to accept ingest connection");
                        continue;
                    }
                };
                let pipeline = Arc::clone(&pipeline);
                tokio::spawn(async move {
                    let service = service_fn(move |req| {
                        let pipeline = Arc::clone(&pipeline);
                        handle(req, pipeline)
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
