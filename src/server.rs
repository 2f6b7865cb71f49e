//! HTTP front-end for the stream engine.
//!
//! Parses the protocol surface (method + path + query + headers) into engine
//! calls and renders responses: raw bytes or JSON arrays for snapshot reads,
//! long-poll waits, SSE tails, and the JSON error bodies clients recover
//! from.

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, HeaderMap, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, head, post, put},
    Router,
};
use bytes::Bytes;
use serde::Deserialize;
use tokio::time::{timeout_at, Instant};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

use crate::config::ServerConfig;
use crate::cursor::{generate_response_cursor, parse_cursor, CursorOptions};
use crate::error::EngineError;
use crate::fence::ProducerClaims;
use crate::log::{
    content_type_is_json, content_type_is_text, read_from, ReadFrom, StreamLog,
};
use crate::notify::StreamSignal;
use crate::offset::{Offset, OffsetToken, START_SENTINEL};
use crate::registry::{Registry, StreamConfigReq};
use crate::sse;
use crate::storage::StorageBackend;
use crate::webhook::WebhookDispatcher;

/// Protocol header names
pub const HEADER_STREAM_NEXT_OFFSET: &str = "stream-next-offset";
pub const HEADER_STREAM_CURSOR: &str = "stream-cursor";
pub const HEADER_STREAM_UP_TO_DATE: &str = "stream-up-to-date";
pub const HEADER_STREAM_CONTENT_TYPE: &str = "stream-content-type";
pub const HEADER_STREAM_HEAD_OFFSET: &str = "stream-head-offset";
pub const HEADER_STREAM_COUNT: &str = "stream-count";
pub const HEADER_STREAM_TTL: &str = "stream-ttl";
pub const HEADER_STREAM_EXPIRES: &str = "stream-expires-at";
pub const HEADER_SSE_DATA_ENCODING: &str = "stream-sse-data-encoding";

/// Producer headers
pub const HEADER_PRODUCER_ID: &str = "producer-id";
pub const HEADER_PRODUCER_EPOCH: &str = "producer-epoch";
pub const HEADER_PRODUCER_SEQ: &str = "producer-seq";
pub const HEADER_PRODUCER_EXPECTED_SEQ: &str = "producer-expected-seq";

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<Registry>,
    pub webhooks: Arc<WebhookDispatcher>,
    pub config: Arc<ServerConfig>,
}

impl AppState {
    pub fn new(backend: Arc<dyn StorageBackend>, config: ServerConfig) -> Self {
        let config = Arc::new(config);
        let registry = Arc::new(Registry::new(backend.clone(), config.clone()));
        let webhooks = WebhookDispatcher::new(backend, config.clone());
        Self {
            registry,
            webhooks,
            config,
        }
    }

    fn cursor_options(&self) -> CursorOptions {
        CursorOptions {
            interval: self.config.cursor_interval,
            epoch: self.config.cursor_epoch,
        }
    }
}

/// Create the router with all stream endpoints.
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::HEAD,
            Method::OPTIONS,
        ])
        .allow_headers(Any)
        .expose_headers(Any);

    Router::new()
        .route("/{*path}", put(handle_create))
        .route("/{*path}", head(handle_head))
        .route("/{*path}", get(handle_read))
        .route("/{*path}", post(handle_append))
        .route("/{*path}", delete(handle_delete))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct ReadQuery {
    offset: Option<String>,
    live: Option<String>,
    limit: Option<usize>,
    cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CreateQuery {
    subscription: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SubscribeBody {
    webhook: String,
    #[serde(default)]
    description: Option<String>,
}

/// Render an engine error: status, recovery headers, JSON body.
fn error_response(err: &EngineError) -> Response {
    let status = StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut builder = Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json");

    match err {
        EngineError::SequenceGap { expected, .. } => {
            builder = builder.header(HEADER_PRODUCER_EXPECTED_SEQ, expected.to_string());
        }
        EngineError::StaleEpoch { current_epoch } => {
            builder = builder.header(HEADER_PRODUCER_EPOCH, current_epoch.to_string());
        }
        EngineError::Storage(e) => {
            warn!(error = %e, "storage failure surfaced to client");
        }
        _ => {}
    }

    builder
        .body(Body::from(err.body().to_string()))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// PUT - create a stream, or register a webhook subscription.
async fn handle_create(
    State(state): State<AppState>,
    Path(path): Path<String>,
    Query(query): Query<CreateQuery>,
    headers: HeaderMap,
    body: Body,
) -> Response {
    let path = format!("/{path}");

    if let Some(name) = query.subscription {
        return handle_subscribe(state, path, name, body).await;
    }

    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/octet-stream")
        .to_string();
    let ttl_seconds = headers
        .get(HEADER_STREAM_TTL)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());
    let expires_at = headers
        .get(HEADER_STREAM_EXPIRES)
        .and_then(|v| v.to_str().ok())
        .map(String::from);

    let body_bytes = match axum::body::to_bytes(body, state.config.max_batch_bytes).await {
        Ok(bytes) => bytes,
        Err(_) => return error_response(&EngineError::bad_request("unreadable body")),
    };

    let req = StreamConfigReq {
        content_type: content_type.clone(),
        ttl_seconds,
        expires_at,
    };
    let (log, created) = match state.registry.create(&path, req) {
        Ok(result) => result,
        Err(e) => return error_response(&e),
    };

    // Initial data rides along on a fresh create only; repeats of the same
    // PUT must stay idempotent.
    if created && !body_bytes.is_empty() {
        let outcome = match log.append(vec![body_bytes], None, None).await {
            Ok(outcome) => outcome,
            Err(e) => return error_response(&e),
        };
        state.webhooks.publish(&path, &outcome.appended);
    }

    let status = if created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Response::builder()
        .status(status)
        .header(HEADER_STREAM_NEXT_OFFSET, log.head_token())
        .header(header::LOCATION, &path)
        .header(header::CONTENT_TYPE, &content_type)
        .header(header::ETAG, quoted(&log.head_token()))
        .body(Body::empty())
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

async fn handle_subscribe(state: AppState, pattern: String, name: String, body: Body) -> Response {
    let body_bytes = match axum::body::to_bytes(body, state.config.max_batch_bytes).await {
        Ok(bytes) => bytes,
        Err(_) => return error_response(&EngineError::bad_request("unreadable body")),
    };
    let parsed: SubscribeBody = match serde_json::from_slice(&body_bytes) {
        Ok(parsed) => parsed,
        Err(e) => {
            return error_response(&EngineError::bad_request(format!(
                "invalid subscription body: {e}"
            )))
        }
    };

    match state
        .webhooks
        .register(&pattern, &name, &parsed.webhook, parsed.description)
    {
        Ok(secret) => {
            let body = serde_json::json!({ "webhook_secret": secret });
            Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
        }
        Err(e) => error_response(&e),
    }
}

/// HEAD - stream metadata.
async fn handle_head(
    State(state): State<AppState>,
    Path(path): Path<String>,
    Query(query): Query<ReadQuery>,
) -> Response {
    let path = format!("/{path}");
    let log = match state.registry.lookup(&path) {
        Ok(Some(log)) => log,
        Ok(None) => return error_response(&EngineError::NotFound { path }),
        Err(e) => return error_response(&e),
    };

    let meta = log.meta();
    let client_cursor = query.cursor.as_deref().and_then(parse_cursor);
    let cursor = generate_response_cursor(client_cursor, &state.cursor_options());
    let head = log.head_token();

    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header(HEADER_STREAM_NEXT_OFFSET, &head)
        .header(HEADER_STREAM_HEAD_OFFSET, &head)
        .header(HEADER_STREAM_COUNT, meta.count.to_string())
        .header(HEADER_STREAM_CONTENT_TYPE, &meta.content_type)
        .header(header::CONTENT_TYPE, &meta.content_type)
        .header(HEADER_STREAM_CURSOR, cursor.to_string())
        .header(header::ETAG, quoted(&head));
    if let Some(ttl) = meta.ttl_seconds {
        builder = builder.header(HEADER_STREAM_TTL, ttl.to_string());
    }
    if let Some(expires) = &meta.expires_at {
        builder = builder.header(HEADER_STREAM_EXPIRES, expires);
    }
    builder
        .body(Body::empty())
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// GET - read: snapshot, long-poll, or SSE.
async fn handle_read(
    State(state): State<AppState>,
    Path(path): Path<String>,
    Query(query): Query<ReadQuery>,
) -> Response {
    let path = format!("/{path}");
    let log = match state.registry.lookup(&path) {
        Ok(Some(log)) => log,
        Ok(None) => return error_response(&EngineError::NotFound { path }),
        Err(e) => return error_response(&e),
    };

    let offset = Offset::parse(query.offset.as_deref().unwrap_or(START_SENTINEL));
    let from = match read_from(&offset) {
        Ok(from) => from,
        Err(e) => return error_response(&e),
    };
    // Resolve `now` to a concrete position up front so live readers tail
    // from here instead of re-resolving against a moving head.
    let from = match from {
        ReadFrom::Head => match log.head() {
            Some(t) => ReadFrom::After(t),
            None => ReadFrom::Start,
        },
        other => other,
    };
    let limit = query.limit.unwrap_or(state.config.max_read_messages);
    if limit == 0 {
        return error_response(&EngineError::bad_request("limit must be positive"));
    }
    let client_cursor = query.cursor.as_deref().and_then(parse_cursor);
    let cursor = generate_response_cursor(client_cursor, &state.cursor_options());

    match query.live.as_deref() {
        None | Some("false") => handle_snapshot(state, log, from, limit, cursor),
        Some("long-poll") => handle_long_poll(state, log, from, limit, cursor).await,
        Some("sse") => handle_sse(state, log, from, limit, cursor),
        Some(other) => {
            error_response(&EngineError::bad_request(format!("invalid live mode: {other}")))
        }
    }
}

fn read_headers(
    builder: axum::http::response::Builder,
    log: &StreamLog,
    next_offset: &str,
    up_to_date: bool,
    cursor: u64,
) -> axum::http::response::Builder {
    builder
        .header(HEADER_STREAM_NEXT_OFFSET, next_offset)
        .header(HEADER_STREAM_UP_TO_DATE, up_to_date.to_string())
        .header(HEADER_STREAM_CURSOR, cursor.to_string())
        .header(HEADER_STREAM_CONTENT_TYPE, log.content_type())
        .header(header::ETAG, quoted(&log.head_token()))
}

/// Snapshot read: one page, immediately.
fn handle_snapshot(
    state: AppState,
    log: Arc<StreamLog>,
    from: ReadFrom,
    limit: usize,
    cursor: u64,
) -> Response {
    let page = match log.read_range(&from, limit, state.config.max_read_bytes) {
        Ok(page) => page,
        Err(e) => return error_response(&e),
    };
    let body = format_body(log.is_json(), &page.messages);

    read_headers(
        Response::builder().status(StatusCode::OK),
        &log,
        &page.next_offset,
        page.up_to_date,
        cursor,
    )
    .header(header::CONTENT_TYPE, log.content_type())
    .body(Body::from(body))
    .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Long-poll read: wait for new data up to the configured timeout.
async fn handle_long_poll(
    state: AppState,
    log: Arc<StreamLog>,
    from: ReadFrom,
    limit: usize,
    cursor: u64,
) -> Response {
    // Subscribe before the re-check read so a publish between the two is
    // never lost.
    let mut rx = log.subscribe();
    let deadline = Instant::now() + state.config.long_poll_timeout;

    loop {
        let page = match log.read_range(&from, limit, state.config.max_read_bytes) {
            Ok(page) => page,
            Err(e) => return error_response(&e),
        };
        if !page.messages.is_empty() {
            let body = format_body(log.is_json(), &page.messages);
            return read_headers(
                Response::builder().status(StatusCode::OK),
                &log,
                &page.next_offset,
                page.up_to_date,
                cursor,
            )
            .header(header::CONTENT_TYPE, log.content_type())
            .body(Body::from(body))
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response());
        }

        match timeout_at(deadline, rx.recv()).await {
            Ok(Ok(StreamSignal::Appended(_))) => continue,
            Ok(Ok(StreamSignal::Deleted)) | Ok(Err(tokio::sync::broadcast::error::RecvError::Closed)) => {
                return error_response(&EngineError::NotFound {
                    path: log.path().to_string(),
                });
            }
            // Missed intermediate signals only mean there is more to read.
            Ok(Err(tokio::sync::broadcast::error::RecvError::Lagged(_))) => continue,
            Err(_elapsed) => {
                let next = match &from {
                    ReadFrom::Start => {
                        if log.head().is_some() {
                            log.head_token()
                        } else {
                            START_SENTINEL.to_string()
                        }
                    }
                    ReadFrom::Head => log.head_token(),
                    ReadFrom::After(t) => t.encode(),
                };
                return read_headers(
                    Response::builder().status(StatusCode::NO_CONTENT),
                    &log,
                    &next,
                    true,
                    cursor,
                )
                .body(Body::empty())
                .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response());
            }
        }
    }
}

/// SSE read: replay history, then stay subscribed and flush each append.
fn handle_sse(
    state: AppState,
    log: Arc<StreamLog>,
    from: ReadFrom,
    limit: usize,
    cursor: u64,
) -> Response {
    let content_type = log.content_type();
    let binary = !content_type_is_text(&content_type) && !content_type_is_json(&content_type);
    let heartbeat = state.config.sse_heartbeat;
    let max_bytes = state.config.max_read_bytes;
    let cursor_options = state.cursor_options();

    let frames = async_stream::stream! {
        let mut rx = log.subscribe();
        let mut cursor = cursor;
        let mut from = from;

        // Catch-up: page through history, then report the resume position.
        let mut next_token;
        loop {
            let page = match log.read_range(&from, limit, max_bytes) {
                Ok(page) => page,
                Err(e) => {
                    debug!(error = %e, "sse catch-up read failed");
                    return;
                }
            };
            for (_, data) in &page.messages {
                yield Ok::<Bytes, Infallible>(Bytes::from(sse::message_frame(data, binary)));
            }
            let empty = page.messages.is_empty();
            next_token = page.next_offset;
            if page.up_to_date {
                break;
            }
            if empty {
                // A non-advancing page means the stream went away under us.
                return;
            }
            from = resume_from(&next_token);
        }
        yield Ok(Bytes::from(sse::control_frame(&next_token, Some(cursor), true)));

        // Tail: wake on appends, heartbeat control frames in between.
        loop {
            match tokio::time::timeout(heartbeat, rx.recv()).await {
                Ok(Ok(StreamSignal::Appended(_)))
                | Ok(Err(tokio::sync::broadcast::error::RecvError::Lagged(_))) => {
                    let mut from = resume_from(&next_token);
                    loop {
                        let page = match log.read_range(&from, limit, max_bytes) {
                            Ok(page) => page,
                            Err(_) => return,
                        };
                        for (_, data) in &page.messages {
                            yield Ok(Bytes::from(sse::message_frame(data, binary)));
                        }
                        let empty = page.messages.is_empty();
                        next_token = page.next_offset;
                        if page.up_to_date {
                            break;
                        }
                        if empty {
                            return;
                        }
                        from = resume_from(&next_token);
                    }
                    cursor = generate_response_cursor(Some(cursor), &cursor_options);
                    yield Ok(Bytes::from(sse::control_frame(&next_token, Some(cursor), true)));
                }
                Ok(Ok(StreamSignal::Deleted))
                | Ok(Err(tokio::sync::broadcast::error::RecvError::Closed)) => {
                    return;
                }
                Err(_elapsed) => {
                    cursor = generate_response_cursor(Some(cursor), &cursor_options);
                    let up_to_date = next_token == log.head_token()
                        || (next_token == START_SENTINEL && log.head().is_none());
                    yield Ok(Bytes::from(sse::control_frame(&next_token, Some(cursor), up_to_date)));
                }
            }
        }
    };

    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(HEADER_STREAM_CONTENT_TYPE, &content_type);
    if binary {
        builder = builder.header(HEADER_SSE_DATA_ENCODING, "base64");
    }
    builder
        .body(Body::from_stream(frames))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

fn resume_from(token: &str) -> ReadFrom {
    match OffsetToken::decode(token) {
        Some(t) => ReadFrom::After(t),
        None => ReadFrom::Start,
    }
}

/// POST - append.
async fn handle_append(
    State(state): State<AppState>,
    Path(path): Path<String>,
    headers: HeaderMap,
    body: Body,
) -> Response {
    let path = format!("/{path}");

    let body_bytes = match axum::body::to_bytes(body, state.config.max_batch_bytes).await {
        Ok(bytes) => bytes,
        Err(_) => {
            return error_response(&EngineError::bad_request(format!(
                "body exceeds limit of {} bytes",
                state.config.max_batch_bytes
            )))
        }
    };
    if body_bytes.is_empty() {
        return error_response(&EngineError::EmptyAppend);
    }

    let request_content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(String::from);

    let log = match state.registry.lookup(&path) {
        Ok(Some(log)) => log,
        Ok(None) if state.config.create_on_append => {
            let req = StreamConfigReq {
                content_type: request_content_type
                    .clone()
                    .unwrap_or_else(|| "application/octet-stream".to_string()),
                ..Default::default()
            };
            match state.registry.create(&path, req) {
                Ok((log, _)) => log,
                Err(e) => return error_response(&e),
            }
        }
        Ok(None) => return error_response(&EngineError::NotFound { path }),
        Err(e) => return error_response(&e),
    };

    // The stream's content type is fixed at creation; a conflicting request
    // type is a client bug, not a new config.
    if let Some(request_ct) = &request_content_type {
        let stream_ct = log.content_type();
        if crate::log::normalize_content_type(request_ct)
            != crate::log::normalize_content_type(&stream_ct)
        {
            return error_response(&EngineError::bad_request(format!(
                "content-type {request_ct} does not match stream content-type {stream_ct}"
            )));
        }
    }

    let producer = match parse_producer_headers(&headers) {
        Ok(producer) => producer,
        Err(e) => return error_response(&e),
    };
    let if_match = headers
        .get(header::IF_MATCH)
        .and_then(|v| v.to_str().ok())
        .map(String::from);

    let payloads = match split_payloads(&log, body_bytes.clone()) {
        Ok(payloads) => payloads,
        Err(e) => return error_response(&e),
    };

    let producer = producer.map(|claims| {
        let hash = log.hash_payload(&body_bytes);
        (claims, hash)
    });

    let outcome = match log.append(payloads, producer, if_match.as_deref()).await {
        Ok(outcome) => outcome,
        Err(e) => return error_response(&e),
    };

    if !outcome.duplicate {
        state.webhooks.publish(&path, &outcome.appended);
    }

    Response::builder()
        .status(StatusCode::NO_CONTENT)
        .header(HEADER_STREAM_NEXT_OFFSET, &outcome.last_offset)
        .header(header::ETAG, quoted(&outcome.last_offset))
        .body(Body::empty())
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// DELETE - delete a stream.
async fn handle_delete(State(state): State<AppState>, Path(path): Path<String>) -> Response {
    let path = format!("/{path}");
    match state.registry.delete(&path) {
        Ok(true) => StatusCode::NO_CONTENT.into_response(),
        Ok(false) => error_response(&EngineError::NotFound { path }),
        Err(e) => error_response(&e),
    }
}

/// All three producer headers enable idempotence; any one alone is ignored
/// (per protocol), but unparseable values are rejected.
fn parse_producer_headers(headers: &HeaderMap) -> Result<Option<ProducerClaims>, EngineError> {
    let id = headers
        .get(HEADER_PRODUCER_ID)
        .and_then(|v| v.to_str().ok());
    let epoch = headers.get(HEADER_PRODUCER_EPOCH);
    let seq = headers.get(HEADER_PRODUCER_SEQ);

    let (id, epoch, seq) = match (id, epoch, seq) {
        (Some(id), Some(epoch), Some(seq)) => (id, epoch, seq),
        _ => return Ok(None),
    };

    let epoch = epoch
        .to_str()
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .ok_or_else(|| EngineError::bad_request("invalid Producer-Epoch"))?;
    let seq = seq
        .to_str()
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .ok_or_else(|| EngineError::bad_request("invalid Producer-Seq"))?;

    Ok(Some(ProducerClaims {
        id: id.to_string(),
        epoch,
        seq,
    }))
}

/// Split an append body into message payloads.
///
/// JSON streams treat a top-level array as a batch, one message per element;
/// everything else is a single opaque message.
fn split_payloads(log: &StreamLog, body: Bytes) -> Result<Vec<Bytes>, EngineError> {
    if !log.is_json() {
        return Ok(vec![body]);
    }
    match serde_json::from_slice::<serde_json::Value>(&body) {
        Ok(serde_json::Value::Array(items)) => {
            if items.is_empty() {
                return Err(EngineError::bad_request("empty arrays are not allowed"));
            }
            let mut payloads = Vec::with_capacity(items.len());
            for item in items {
                let raw = serde_json::to_vec(&item)
                    .map_err(|e| EngineError::bad_request(e.to_string()))?;
                payloads.push(Bytes::from(raw));
            }
            Ok(payloads)
        }
        // Payload bytes are opaque; non-array JSON (valid or not) is a
        // single message.
        _ => Ok(vec![body]),
    }
}

/// Concatenate message bytes; JSON streams render as a JSON array.
fn format_body(is_json: bool, messages: &[(OffsetToken, Bytes)]) -> Vec<u8> {
    if is_json {
        let mut out = vec![b'['];
        for (i, (_, data)) in messages.iter().enumerate() {
            if i > 0 {
                out.push(b',');
            }
            out.extend_from_slice(data);
        }
        out.push(b']');
        return out;
    }
    let mut out = Vec::with_capacity(messages.iter().map(|(_, d)| d.len()).sum());
    for (_, data) in messages {
        out.extend_from_slice(data);
    }
    out
}

fn quoted(token: &str) -> String {
    format!("\"{token}\"")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryBackend;
    use axum::http::Request;
    use tower::ServiceExt;

    fn create_test_app() -> Router {
        let state = AppState::new(Arc::new(MemoryBackend::new()), ServerConfig::default());
        create_router(state)
    }

    #[tokio::test]
    async fn test_create_stream() {
        let app = create_test_app();

        let response = app
            .oneshot(
                Request::builder()
                    .method("PUT")
                    .uri("/test/stream")
                    .header("Content-Type", "text/plain")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::CREATED);
        assert!(response.headers().contains_key(HEADER_STREAM_NEXT_OFFSET));
    }

    #[tokio::test]
    async fn test_append_requires_stream() {
        let app = create_test_app();

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/missing")
                    .body(Body::from("data"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_empty_append_rejected() {
        let app = create_test_app();

        app.clone()
            .oneshot(
                Request::builder()
                    .method("PUT")
                    .uri("/s")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/s")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_partial_producer_headers_disable_idempotence() {
        let app = create_test_app();
        app.clone()
            .oneshot(
                Request::builder()
                    .method("PUT")
                    .uri("/s")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        // Only Producer-Id: treated as a plain append, twice lands twice.
        for _ in 0..2 {
            let response = app
                .clone()
                .oneshot(
                    Request::builder()
                        .method("POST")
                        .uri("/s")
                        .header("Producer-Id", "p")
                        .body(Body::from("x"))
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::NO_CONTENT);
        }

        let response = app
            .oneshot(
                Request::builder()
                    .method("HEAD")
                    .uri("/s")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.headers()[HEADER_STREAM_COUNT], "2");
    }

    #[tokio::test]
    async fn test_invalid_live_mode_rejected() {
        let app = create_test_app();
        app.clone()
            .oneshot(
                Request::builder()
                    .method("PUT")
                    .uri("/s")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        let response = app
            .oneshot(
                Request::builder()
                    .method("GET")
                    .uri("/s?live=maybe")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_invalid_offset_rejected() {
        let app = create_test_app();
        app.clone()
            .oneshot(
                Request::builder()
                    .method("PUT")
                    .uri("/s")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        let response = app
            .oneshot(
                Request::builder()
                    .method("GET")
                    .uri("/s?offset=bogus")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
