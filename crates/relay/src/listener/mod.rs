use std::convert::Infallible;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use hyper_util::server::conn::auto::Builder;
use timeline::{Batcher, EnqueueError, FlattenedPoint, Transport};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

const POINTS_PATH: &str = "/v1/points";

fn response(status: StatusCode) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::default())
        .unwrap()
}

/// Validate the incoming request and decode its single point.
async fn validate<B>(req: Request<B>) -> Result<FlattenedPoint, (StatusCode, String)>
where
    B: hyper::body::Body<Data = Bytes> + Send + 'static,
{
    let path = req.uri().path().to_owned();
    let method = req.method().clone();

    if path != POINTS_PATH {
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
        .map_err(|e| (StatusCode::BAD_REQUEST, format!("invalid point: {e}")))
}

async fn handle<B, T>(
    req: Request<B>,
    batcher: Arc<Batcher<T>>,
) -> Result<Response<Full<Bytes>>, Infallible>
where
    B: hyper::body::Body<Data = Bytes> + Send + 'static,
    T: Transport,
{
    let point = match validate(req).await {
        Ok(point) => point,
        Err((status, reason)) => {
            warn!(reason, "ingest request rejected");
            return Ok(response(status));
        }
    };

    let item = match batcher.transport().from_flattened_point(&point) {
        Ok(item) => item,
        Err(e) => {
            warn!(error = %e, metric = %point.metric, "point not representable by transport");
            return Ok(response(StatusCode::BAD_REQUEST));
        }
    };

    match batcher.try_enqueue(item) {
        Ok(()) => Ok(response(StatusCode::OK)),
        Err(EnqueueError::Full(_)) => {
            debug!(metric = %point.metric, "transport buffer full, point dropped");
            Ok(Response::builder()
                .status(StatusCode::SERVICE_UNAVAILABLE)
                .header("Retry-After", "1")
                .body(Full::default())
                .unwrap())
        }
    }
}

/// Accept connections until `cancel` fires. Returns once every connection
/// task has ended, so no handler can enqueue after this future completes.
pub async fn serve<T: Transport>(
    listener: TcpListener,
    batcher: Arc<Batcher<T>>,
    cancel: CancellationToken,
) {
    let tracker = TaskTracker::new();

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
                let batcher = Arc::clone(&batcher);
                let cancel = cancel.clone();
                tracker.spawn(async move {
                    let service = service_fn(move |req| handle(req, Arc::clone(&batcher)));
                    let builder = Builder::new(hyper_util::rt::TokioExecutor::new());
                    let conn = builder.serve_connection(TokioIo::new(stream), service);
                    tokio::select! {
                        _ = conn => {}
                        _ = cancel.cancelled() => {}
                    }
                });
            }
            _ = cancel.cancelled() => {
                break;
            }
        }
    }

    tracker.close();
    tracker.wait().await;
}
