//! The loopback HTTP responder (`HybridServer`, spec.md §4.D): binds a
//! single `GET /stream?url=` route, maps its per-request state machine onto
//! axum, and hands the body off to `Manager::serve_hybrid` as soon as the
//! response head is known so the header write doesn't wait on the first
//! byte of content.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use axum::{
    Router,
    body::Body,
    extract::{Query, State},
    http::{
        HeaderMap, HeaderValue, StatusCode,
        header::{ACCEPT_RANGES, CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, RANGE},
    },
    response::{IntoResponse, Response},
    routing::get,
};
use common::CacheError;
use tokio::{net::TcpListener, sync::mpsc, task::JoinHandle};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{error, info, instrument};

use crate::manager::Manager;

/// Backpressure on the response body: the hybrid loop blocks on `send`
/// once this many chunks are buffered ahead of what the player has read,
/// which is what makes a slow player slow the completer down too (§5).
const RESPONSE_CHANNEL_CAPACITY: usize = 4;

/// Binds the loopback listener and starts serving in a background task.
/// Returns the task handle so `Manager::dispose` can abort it.
pub async fn spawn_server(manager: Arc<Manager>) -> Result<JoinHandle<()>, CacheError> {
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, manager.port()));
    let router = Router::new()
        .route("/stream", get(stream))
        .with_state(manager);

    let listener = TcpListener::bind(addr).await.map_err(|source| CacheError::StorageIo {
        id: "<http-listener>".into(),
        source,
    })?;

    info!(%addr, "hybrid range server listening");
    Ok(tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router).await {
            error!(error = %e, "hybrid range server exited");
        }
    }))
}

/// Wraps `CacheError` for axum's `IntoResponse` — orphan rules forbid
/// implementing a foreign trait on a foreign type directly, so this mirrors
/// the teacher's `AppError` newtype rather than implementing `IntoResponse`
/// on `CacheError` itself.
pub struct ApiError(CacheError);

impl From<CacheError> for ApiError {
    fn from(err: CacheError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            CacheError::BadRequest(_) | CacheError::BadArgument(_) => StatusCode::BAD_REQUEST,
            CacheError::OriginUnavailable(_) => StatusCode::BAD_GATEWAY,
            CacheError::RangeNotSatisfiable => StatusCode::RANGE_NOT_SATISFIABLE,
            CacheError::NotFound => StatusCode::NOT_FOUND,
            CacheError::OriginStreamError(_)
            | CacheError::StorageIo { .. }
            | CacheError::MetaCorrupt { .. }
            | CacheError::NotComplete
            | CacheError::NotInitialized
            | CacheError::DoubleInit => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.0.to_string()).into_response()
    }
}

/// `GET /stream?url=<percent-encoded-origin>`: steps 1-7 of spec.md §4.D.
#[instrument(skip(manager, headers), fields(url))]
async fn stream(
    State(manager): State<Arc<Manager>>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let url = params
        .get("url")
        .filter(|u| !u.is_empty())
        .cloned()
        .ok_or_else(|| CacheError::BadRequest("missing url query parameter".into()))?;
    tracing::Span::current().record("url", url.as_str());

    // Step 2: ensure the Resource/OriginSource/sparse file exist, issuing
    // the first HEAD if this id hasn't been seen before.
    let resource = manager.ensure_resource(&url).await?;
    let id = resource.lock().await.id.clone();
    manager.note_first_request(&id);

    let (total_size, content_type) = manager.resource_snapshot(&id).await?;

    // Step 3: parse Range, folding missing/unparseable into bytes=0-.
    let (start, end) = parse_range(headers.get(RANGE), total_size)?;

    // Step 4: response head.
    let mut response_headers = HeaderMap::new();
    response_headers.insert(ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    response_headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_str(&content_type).unwrap_or_else(|_| HeaderValue::from_static("video/mp4")),
    );
    response_headers.insert(CONTENT_LENGTH, HeaderValue::from(end - start + 1));
    response_headers.insert(
        CONTENT_RANGE,
        HeaderValue::from_str(&format!("bytes {start}-{end}/{total_size}"))
            .expect("ascii byte-range string is always a valid header value"),
    );

    // Step 5: hand the body off to the hybrid loop, running independently
    // so this handler can return the head immediately.
    let (tx, rx) = mpsc::channel(RESPONSE_CHANNEL_CAPACITY);
    let body_manager = manager.clone();
    let body_id = id.clone();
    tokio::spawn(async move {
        body_manager.serve_hybrid(&body_id, start, end, tx).await;
    });

    let body = Body::from_stream(ReceiverStream::new(rx));
    Ok((StatusCode::PARTIAL_CONTENT, response_headers, body).into_response())
}

/// `bytes=s-e` / `bytes=s-`; anything else (missing header, other units,
/// unparseable numbers) folds into `bytes=0-` per the pinned resolution in
/// DESIGN.md. `end` is clamped to `total_size - 1`; `start > end` after
/// clamping is rejected as `RangeNotSatisfiable` (covers both an explicit
/// `s > e` like `bytes=5-4` and a `start` past the end of the file).
fn parse_range(header: Option<&HeaderValue>, total_size: u64) -> Result<(u64, u64), CacheError> {
    let (start, end) = header
        .and_then(|v| v.to_str().ok())
        .and_then(parse_bytes_range)
        .unwrap_or((0, None));

    let max_end = total_size.saturating_sub(1);
    let end = end.map(|e| e.min(max_end)).unwrap_or(max_end);

    if start > end {
        return Err(CacheError::RangeNotSatisfiable);
    }
    Ok((start, end))
}

fn parse_bytes_range(value: &str) -> Option<(u64, Option<u64>)> {
    let spec = value.strip_prefix("bytes=")?;
    let (s, e) = spec.split_once('-')?;
    let start: u64 = s.parse().ok()?;
    match e {
        "" => Some((start, None)),
        e => Some((start, Some(e.parse().ok()?))),
    }
}
