//! Edge router (spec §4.7): HTTP surface, path/CORS/auth resolution, and
//! dispatch into the sequencer tier. Stays thin — all stream semantics
//! live in `engine`/`sequencer`; this module's job is translating HTTP in
//! and out.

use crate::auth::Decision as AuthDecision;
use crate::edge::cache::{Cacheability, CachedResponse};
use crate::engine::{self, ProducerAck, ProducerHeaders};
use crate::error::{header_name, AppError, AppResult};
use crate::offset::{self, Offset, ParsedOffset};
use crate::sequencer::{self, Live, PreCacheSink, ReadReply, ReadRequest};
use crate::state::AppState;
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, head, options, post, put};
use axum::Router;
use serde::Deserialize;
use std::time::Duration;

const PROJECT_ID_PATTERN_CHARS: fn(char) -> bool =
    |c| c.is_ascii_alphanumeric() || c == '_' || c == '-';
const LEGACY_PROJECT_ID: &str = "_default";

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route(
            "/v1/stream/{project_id}/{stream_id}",
            put(put_stream)
                .post(post_stream)
                .get(get_stream)
                .head(head_stream)
                .delete(delete_stream)
                .options(options_stream),
        )
        .route(
            "/v1/stream/{stream_id}",
            put(put_stream_legacy)
                .post(post_stream_legacy)
                .get(get_stream_legacy)
                .head(head_stream_legacy)
                .delete(delete_stream_legacy)
                .options(options_stream_legacy),
        )
        .with_state(state)
}

async fn health() -> Response {
    let mut response = "ok".into_response();
    response.headers_mut().insert(axum::http::header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    response
}

fn validate_project_id(project_id: &str) -> AppResult<()> {
    if !project_id.is_empty() && project_id.chars().all(PROJECT_ID_PATTERN_CHARS) {
        Ok(())
    } else {
        Err(AppError::bad_input("projectId must match ^[A-Za-z0-9_-]+$"))
    }
}

/// Intersection of global and project CORS allow-lists against the
/// request's `Origin`. An empty list on either side is read as "this tier
/// imposes no restriction" rather than "deny everything" — a project that
/// wants to lock CORS down entirely should configure `cors_origins: []`
/// *and* rely on auth, not on CORS as the only gate (CORS is same-origin
/// enforcement for browsers, not an access control layer).
fn resolve_cors_origin(global_origins: &[String], project_origins: &[String], origin: Option<&str>) -> Option<String> {
    let origin = origin?;
    let allows = |list: &[String]| list.is_empty() || list.iter().any(|o| o == "*" || o == origin);
    if allows(global_origins) && allows(project_origins) {
        Some(origin.to_owned())
    } else {
        None
    }
}

fn apply_cors(response: &mut Response, cors_origin: Option<&str>) {
    let headers = response.headers_mut();
    headers.insert("x-content-type-options", HeaderValue::from_static("nosniff"));
    headers.insert("cross-origin-resource-policy", HeaderValue::from_static("cross-origin"));
    if let Some(origin) = cors_origin {
        if let Ok(v) = HeaderValue::from_str(origin) {
            headers.insert("access-control-allow-origin", v);
            headers.insert("vary", HeaderValue::from_static("Origin"));
        }
    }
}

fn no_store(response: &mut Response) {
    response.headers_mut().insert(axum::http::header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
}

struct RequestContext {
    cors_origin: Option<String>,
}

/// Resolves the project, CORS origin, and runs auth for the given method.
/// Returns the context to attach to the eventual response, or the auth
/// error response (with CORS already applied) on denial.
async fn prepare(
    state: &AppState,
    project_id: &str,
    method: &Method,
    headers: &HeaderMap,
    public_hint: Option<bool>,
) -> Result<RequestContext, Response> {
    if let Err(e) = validate_project_id(project_id) {
        return Err(error_response(e, None));
    }
    let project = state.registry.lookup(project_id).ok_or_else(|| {
        error_response(AppError::not_found("unknown project"), None)
    })?;

    let origin = headers.get(axum::http::header::ORIGIN).and_then(|v| v.to_str().ok());
    let cors_origin = resolve_cors_origin(&state.config.cors_origins, &project.cors_origins, origin);

    let auth_header = headers.get(axum::http::header::AUTHORIZATION).and_then(|v| v.to_str().ok());
    let is_mutation = matches!(*method, Method::PUT | Method::POST | Method::DELETE);
    let decision = if is_mutation {
        state.auth.authorize_mutation(&project.signing_secrets, auth_header)
    } else {
        let public = public_hint.unwrap_or(project.public);
        state.auth.authorize_read(public, &project.signing_secrets, auth_header)
    };

    match decision {
        AuthDecision::Allow { .. } => Ok(RequestContext { cors_origin }),
        AuthDecision::Deny(e) => Err(error_response(e, cors_origin.as_deref())),
    }
}

fn error_response(e: AppError, cors_origin: Option<&str>) -> Response {
    let mut response = e.into_response();
    apply_cors(&mut response, cors_origin);
    response
}

// ---------------------------------------------------------------------------
// PUT (create / idempotent replace)
// ---------------------------------------------------------------------------

#[derive(Deserialize, Default)]
struct PutQuery {
    #[serde(default)]
    public: bool,
}

async fn put_stream(
    State(state): State<AppState>,
    Path((project_id, stream_id)): Path<(String, String)>,
    Query(query): Query<PutQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    handle_put(state, project_id, stream_id, query, headers, body).await
}

async fn put_stream_legacy(
    State(state): State<AppState>,
    Path(stream_id): Path<String>,
    Query(query): Query<PutQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    handle_put(state, LEGACY_PROJECT_ID.to_owned(), stream_id, query, headers, body).await
}

async fn handle_put(
    state: AppState,
    project_id: String,
    stream_id: String,
    query: PutQuery,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let ctx = match prepare(&state, &project_id, &Method::PUT, &headers, None).await {
        Ok(ctx) => ctx,
        Err(resp) => return resp,
    };

    let result = async {
        let content_type = headers
            .get(axum::http::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/octet-stream")
            .to_owned();
        let ttl_secs = parse_i64_header(&headers, "Stream-TTL")?;
        let expires_at = parse_i64_header(&headers, "Stream-Expires-At")?;
        let producer = parse_producer_headers(&headers)?;
        let stream_seq = headers.get(header_name("Stream-Seq")).and_then(|v| v.to_str().ok()).map(str::to_owned);

        let handle = state.get_or_spawn(&project_id, &stream_id).await?;
        let req = engine::CreateRequest {
            content_type,
            ttl_secs,
            expires_at,
            body: body.to_vec(),
            public: query.public,
            producer,
            stream_seq,
            now: now_millis(),
            limits: state.config.engine_limits(),
        };
        let outcome = handle.create(req).await?;
        Ok::<_, AppError>(outcome)
    }
    .await;

    let mut response = match result {
        Ok(outcome) => {
            let status = if outcome.created { StatusCode::CREATED } else { StatusCode::OK };
            let mut response = status.into_response();
            apply_offset_headers(&mut response, outcome.next_offset, outcome.closed, None);
            apply_producer_ack(&mut response, outcome.producer_ack);
            response
        }
        Err(e) => e.into_response(),
    };
    apply_cors(&mut response, ctx.cors_origin.as_deref());
    response
}

// ---------------------------------------------------------------------------
// POST (append / close)
// ---------------------------------------------------------------------------

async fn post_stream(
    State(state): State<AppState>,
    Path((project_id, stream_id)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    handle_post(state, project_id, stream_id, headers, body).await
}

async fn post_stream_legacy(
    State(state): State<AppState>,
    Path(stream_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    handle_post(state, LEGACY_PROJECT_ID.to_owned(), stream_id, headers, body).await
}

async fn handle_post(state: AppState, project_id: String, stream_id: String, headers: HeaderMap, body: Bytes) -> Response {
    let ctx = match prepare(&state, &project_id, &Method::POST, &headers, None).await {
        Ok(ctx) => ctx,
        Err(resp) => return resp,
    };

    let result = async {
        let content_type = headers
            .get(axum::http::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/octet-stream")
            .to_owned();
        let producer = parse_producer_headers(&headers)?;
        let stream_seq = headers.get(header_name("Stream-Seq")).and_then(|v| v.to_str().ok()).map(str::to_owned);
        let close = headers.get(header_name("Stream-Closed")).and_then(|v| v.to_str().ok()) == Some("true");

        let handle = state.get_or_spawn(&project_id, &stream_id).await?;
        let req = engine::AppendRequest {
            content_type,
            body: body.to_vec(),
            close,
            producer,
            stream_seq,
            now: now_millis(),
            limits: state.config.engine_limits(),
        };
        handle.append(req).await
    }
    .await;

    let mut response = match result {
        Ok(outcome) => {
            // A producer-tagged append acks with 200 and the producer
            // headers (spec §4.4, §6); an anonymous append acks with a bare
            // 204. The duplicate-replay path also carries a producer and
            // must ack 200, same as a fresh append.
            let status = if outcome.producer_ack.is_some() { StatusCode::OK } else { StatusCode::NO_CONTENT };
            let mut response = status.into_response();
            apply_offset_headers(&mut response, outcome.next_offset, outcome.closed, None);
            apply_producer_ack(&mut response, outcome.producer_ack);
            response
        }
        Err(e) => e.into_response(),
    };
    apply_cors(&mut response, ctx.cors_origin.as_deref());
    response
}

// ---------------------------------------------------------------------------
// GET (read / long-poll / event-stream)
// ---------------------------------------------------------------------------

#[derive(Deserialize, Default)]
struct ReadQuery {
    offset: Option<String>,
    live: Option<String>,
    #[allow(dead_code)]
    cursor: Option<String>,
    rk: Option<String>,
}

async fn get_stream(
    State(state): State<AppState>,
    Path((project_id, stream_id)): Path<(String, String)>,
    Query(query): Query<ReadQuery>,
    headers: HeaderMap,
) -> Response {
    handle_get(state, project_id, stream_id, query, headers).await
}

async fn get_stream_legacy(
    State(state): State<AppState>,
    Path(stream_id): Path<String>,
    Query(query): Query<ReadQuery>,
    headers: HeaderMap,
) -> Response {
    handle_get(state, LEGACY_PROJECT_ID.to_owned(), stream_id, query, headers).await
}

async fn handle_get(state: AppState, project_id: String, stream_id: String, query: ReadQuery, headers: HeaderMap) -> Response {
    // Reads decide auth off the stream's own public flag, not the
    // project's default, so we look the stream up before running `prepare`.
    let handle = match state.get_or_spawn(&project_id, &stream_id).await {
        Ok(h) => h,
        Err(e) => return e.into_response(),
    };
    let meta = handle.head().await;
    let public = meta.as_ref().map(|h| h.meta.public).unwrap_or(false);

    let ctx = match prepare(&state, &project_id, &Method::GET, &headers, Some(public)).await {
        Ok(ctx) => ctx,
        Err(resp) => return resp,
    };

    let is_debug = headers.contains_key("x-debug-timing") || headers.contains_key("x-debug-action") || headers.contains_key("x-debug-coalesce");
    let live = query.live.as_deref();
    let has_rk = query.rk.is_some();

    let offset = match parse_offset(query.offset.as_deref()) {
        Ok(o) => o,
        Err(e) => {
            let mut r = e.into_response();
            apply_cors(&mut r, ctx.cors_origin.as_deref());
            return r;
        }
    };

    let content_type = meta.as_ref().map(|h| h.meta.content_type.clone()).unwrap_or_default();

    if live == Some("sse") {
        let mut response = sse_response(&state, handle, offset, content_type).await;
        apply_cors(&mut response, ctx.cors_origin.as_deref());
        no_store(&mut response);
        return response;
    }

    let cache_url = format!("/v1/stream/{project_id}/{stream_id}?offset={}&live={}&rk={}", query.offset.as_deref().unwrap_or("now"), live.unwrap_or(""), query.rk.as_deref().unwrap_or(""));
    let is_long_poll = live == Some("long-poll");

    let mut response = if !is_debug && !is_long_poll {
        if let Some(cached) = state.cache.get(&cache_url).await {
            let mut response = cached_to_response(&cached, headers.get(axum::http::header::IF_NONE_MATCH).and_then(|v| v.to_str().ok()));
            response.headers_mut().insert("x-cache", HeaderValue::from_static("HIT"));
            response
        } else {
            // Plain reads are coalesced (spec §4.9): concurrent callers for
            // the same URL share one sequencer round trip. Long-poll and SSE
            // are excluded above — each long-poll caller owns its own wait
            // clock, so sharing a future across them would let a late
            // arrival inherit an early arrival's elapsed wait.
            let fetch_handle = handle.clone();
            let fetch_url = cache_url.clone();
            let fetch_ct = content_type.clone();
            let max_chunk_bytes = state.config.max_read_chunk_bytes;
            let fetched = state
                .coalescer
                .get_or_fetch(cache_url.clone(), |_: &CachedResponse| true, move || async move {
                    match fetch_read(&fetch_handle, offset, max_chunk_bytes, None, fetch_url).await? {
                        FetchOutcome::Body(read) => Ok(read_to_cached_response(read, &fetch_ct)),
                        FetchOutcome::TimedOut { .. } => Err(AppError::internal("unexpected timeout for a non-long-poll read")),
                    }
                })
                .await;
            match fetched {
                Ok(cached) => {
                    if is_cacheable(&cached.headers, is_debug, false)
                        && !ResponseCacheGuard::blocked(&state, &project_id, has_rk).await
                    {
                        state.cache.store(&cache_url, cached.body.clone(), cached.content_type.clone(), cached.headers.clone()).await;
                    }
                    let mut response = cached_to_response(&cached, headers.get(axum::http::header::IF_NONE_MATCH).and_then(|v| v.to_str().ok()));
                    response.headers_mut().insert("x-cache", HeaderValue::from_static("MISS"));
                    response
                }
                Err(e) => e.into_response(),
            }
        }
    } else {
        match fetch_read(&handle, offset, state.config.max_read_chunk_bytes, live, cache_url.clone()).await {
            Ok(FetchOutcome::Body(read)) => {
                let cached = read_to_cached_response(read, &content_type);
                if is_cacheable(&cached.headers, is_debug, is_long_poll) && !ResponseCacheGuard::blocked(&state, &project_id, has_rk).await {
                    state.cache.store(&cache_url, cached.body.clone(), cached.content_type.clone(), cached.headers.clone()).await;
                }
                cached_to_response(&cached, headers.get(axum::http::header::IF_NONE_MATCH).and_then(|v| v.to_str().ok()))
            }
            Ok(FetchOutcome::TimedOut { token }) => {
                let mut response = StatusCode::NO_CONTENT.into_response();
                response.headers_mut().insert(header_name("Stream-Next-Offset"), HeaderValue::from_str(&token).unwrap());
                response
            }
            Err(e) => e.into_response(),
        }
    };
    apply_cors(&mut response, ctx.cors_origin.as_deref());
    no_store_if_not_cacheable(&mut response);
    response
}

fn read_to_cached_response(read: engine::ReadOutcome, content_type: &str) -> CachedResponse {
    let is_json = crate::content_type::is_json(content_type);
    let ct = if is_json { "application/json" } else { "application/octet-stream" };
    let headers = vec![
        ("Stream-Next-Offset".to_owned(), read.next_offset.encode()),
        ("Stream-Up-To-Date".to_owned(), read.up_to_date.to_string()),
        ("Stream-Closed".to_owned(), read.closed_at_tail.to_string()),
    ];
    CachedResponse::new(read.body, ct.to_owned(), headers)
}

fn is_cacheable(headers: &[(String, String)], is_debug: bool, is_long_poll: bool) -> bool {
    let up_to_date = headers.iter().any(|(k, v)| k == "Stream-Up-To-Date" && v == "true");
    Cacheability {
        is_get: true,
        is_event_stream: false,
        has_debug_header: is_debug,
        status_is_200: true,
        no_store: false,
        up_to_date,
        is_long_poll,
    }
    .cacheable()
}

fn cached_to_response(cached: &CachedResponse, if_none_match: Option<&str>) -> Response {
    if if_none_match == Some(cached.etag.as_str()) {
        return StatusCode::NOT_MODIFIED.into_response();
    }
    let mut response = (StatusCode::OK, cached.body.clone()).into_response();
    response.headers_mut().insert(
        axum::http::header::CONTENT_TYPE,
        HeaderValue::from_str(&cached.content_type).unwrap_or(HeaderValue::from_static("application/octet-stream")),
    );
    response.headers_mut().insert(axum::http::header::ETAG, HeaderValue::from_str(&cached.etag).unwrap());
    for (k, v) in &cached.headers {
        if let (Ok(name), Ok(value)) = (axum::http::HeaderName::from_bytes(k.as_bytes()), HeaderValue::from_str(v)) {
            response.headers_mut().insert(name, value);
        }
    }
    response
}

/// Thin helper so the reader-key guard (spec §4.8) can be checked without
/// threading the project registry through every branch above.
struct ResponseCacheGuard;
impl ResponseCacheGuard {
    async fn blocked(state: &AppState, project_id: &str, has_rk: bool) -> bool {
        let project = state.registry.lookup(project_id);
        let reader_key = project.and_then(|p| p.reader_key);
        crate::edge::cache::ResponseCache::guarded_by_reader_key(reader_key.as_deref(), has_rk)
    }
}

fn no_store_if_not_cacheable(response: &mut Response) {
    if !response.headers().contains_key(axum::http::header::CACHE_CONTROL) {
        response.headers_mut().insert(axum::http::header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    }
}

enum FetchOutcome {
    Body(engine::ReadOutcome),
    TimedOut { token: String },
}

async fn fetch_read(
    handle: &crate::sequencer::SequencerHandle,
    offset: ParsedOffset,
    max_chunk_bytes: usize,
    live: Option<&str>,
    cache_url: String,
) -> AppResult<FetchOutcome> {
    let live_mode = match live {
        Some("long-poll") => Live::LongPoll { request_url: cache_url },
        _ => Live::None,
    };
    let reply = handle.read(ReadRequest { offset, max_chunk_bytes, live: live_mode }).await?;
    match reply {
        ReadReply::Immediate(outcome) => Ok(FetchOutcome::Body(outcome)),
        ReadReply::LongPollPending { rx, resume_offset } => {
            match tokio::time::timeout(Duration::from_secs(4), rx).await {
                Ok(Ok(_woken)) => {
                    // Resume from the tail captured at registration, not the
                    // client's original `offset`: re-resolving `now` here
                    // would land on the post-wake tail and read nothing.
                    let retry = handle.read(ReadRequest { offset: resume_offset, max_chunk_bytes, live: Live::None }).await?;
                    match retry {
                        ReadReply::Immediate(outcome) => Ok(FetchOutcome::Body(outcome)),
                        _ => Err(AppError::internal("unexpected long-poll retry result")),
                    }
                }
                _ => Ok(FetchOutcome::TimedOut { token: encode_original_offset(offset) }),
            }
        }
        ReadReply::PushOpened { .. } => Err(AppError::internal("push channel opened for a non-sse read")),
    }
}

fn encode_original_offset(offset: ParsedOffset) -> String {
    match offset {
        ParsedOffset::Start => "-1".to_owned(),
        ParsedOffset::Now => "now".to_owned(),
        ParsedOffset::Explicit(o) => o.encode(),
    }
}

async fn sse_response(state: &AppState, handle: crate::sequencer::SequencerHandle, offset: ParsedOffset, content_type: String) -> Response {
    crate::edge::sse_bridge::stream_response(state, handle, offset, content_type).await
}

// ---------------------------------------------------------------------------
// HEAD (metadata)
// ---------------------------------------------------------------------------

async fn head_stream(
    State(state): State<AppState>,
    Path((project_id, stream_id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Response {
    handle_head(state, project_id, stream_id, headers).await
}

async fn head_stream_legacy(State(state): State<AppState>, Path(stream_id): Path<String>, headers: HeaderMap) -> Response {
    handle_head(state, LEGACY_PROJECT_ID.to_owned(), stream_id, headers).await
}

async fn handle_head(state: AppState, project_id: String, stream_id: String, headers: HeaderMap) -> Response {
    let handle = match state.get_or_spawn(&project_id, &stream_id).await {
        Ok(h) => h,
        Err(e) => return e.into_response(),
    };
    let meta = handle.head().await;
    let public = meta.as_ref().map(|h| h.meta.public).unwrap_or(false);
    let ctx = match prepare(&state, &project_id, &Method::HEAD, &headers, Some(public)).await {
        Ok(ctx) => ctx,
        Err(resp) => return resp,
    };
    let mut response = match meta {
        Ok(head) => {
            let offset = Offset::new(head.meta.read_seq as u64, (head.meta.tail_offset - head.meta.segment_start) as u64);
            let mut response = StatusCode::OK.into_response();
            apply_offset_headers(&mut response, offset, head.meta.closed, None);
            response
        }
        Err(e) => e.into_response(),
    };
    apply_cors(&mut response, ctx.cors_origin.as_deref());
    no_store(&mut response);
    response
}

// ---------------------------------------------------------------------------
// DELETE
// ---------------------------------------------------------------------------

async fn delete_stream(
    State(state): State<AppState>,
    Path((project_id, stream_id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Response {
    handle_delete(state, project_id, stream_id, headers).await
}

async fn delete_stream_legacy(State(state): State<AppState>, Path(stream_id): Path<String>, headers: HeaderMap) -> Response {
    handle_delete(state, LEGACY_PROJECT_ID.to_owned(), stream_id, headers).await
}

async fn handle_delete(state: AppState, project_id: String, stream_id: String, headers: HeaderMap) -> Response {
    let ctx = match prepare(&state, &project_id, &Method::DELETE, &headers, None).await {
        Ok(ctx) => ctx,
        Err(resp) => return resp,
    };
    let result = async {
        let handle = state.get_or_spawn(&project_id, &stream_id).await?;
        handle.delete().await?;
        state.remove_sequencer(&project_id, &stream_id);
        Ok::<_, AppError>(())
    }
    .await;
    let mut response = match result {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => e.into_response(),
    };
    apply_cors(&mut response, ctx.cors_origin.as_deref());
    no_store(&mut response);
    response
}

// ---------------------------------------------------------------------------
// OPTIONS (CORS preflight)
// ---------------------------------------------------------------------------

async fn options_stream(State(state): State<AppState>, Path((project_id, _stream_id)): Path<(String, String)>, headers: HeaderMap) -> Response {
    handle_options(state, project_id, headers).await
}

async fn options_stream_legacy(State(state): State<AppState>, Path(_stream_id): Path<String>, headers: HeaderMap) -> Response {
    handle_options(state, LEGACY_PROJECT_ID.to_owned(), headers).await
}

async fn handle_options(state: AppState, project_id: String, headers: HeaderMap) -> Response {
    let project = state.registry.lookup(&project_id).unwrap_or_default();
    let origin = headers.get(axum::http::header::ORIGIN).and_then(|v| v.to_str().ok());
    let cors_origin = resolve_cors_origin(&state.config.cors_origins, &project.cors_origins, origin);
    let mut response = StatusCode::NO_CONTENT.into_response();
    apply_cors(&mut response, cors_origin.as_deref());
    response.headers_mut().insert(
        "access-control-allow-methods",
        HeaderValue::from_static("GET, HEAD, POST, PUT, DELETE, OPTIONS"),
    );
    response.headers_mut().insert(
        "access-control-allow-headers",
        HeaderValue::from_static("Authorization, Content-Type, Stream-Seq, Stream-TTL, Stream-Expires-At, Stream-Closed, Producer-Id, Producer-Epoch, Producer-Seq, If-None-Match"),
    );
    response
}

// ---------------------------------------------------------------------------
// shared helpers
// ---------------------------------------------------------------------------

fn parse_offset(token: Option<&str>) -> AppResult<ParsedOffset> {
    match token {
        None => Ok(ParsedOffset::Now),
        Some(t) => offset::parse(t),
    }
}

fn parse_i64_header(headers: &HeaderMap, name: &str) -> AppResult<Option<i64>> {
    match headers.get(header_name(name)).and_then(|v| v.to_str().ok()) {
        None => Ok(None),
        Some(s) => s.parse().map(Some).map_err(|_| AppError::bad_input(format!("invalid {name} header"))),
    }
}

fn parse_producer_headers(headers: &HeaderMap) -> AppResult<Option<ProducerHeaders>> {
    let id = headers.get(header_name("Producer-Id")).and_then(|v| v.to_str().ok());
    let Some(id) = id else { return Ok(None) };
    let epoch = headers
        .get(header_name("Producer-Epoch"))
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| AppError::bad_input("Producer-Epoch required with Producer-Id"))?
        .parse()
        .map_err(|_| AppError::bad_input("invalid Producer-Epoch"))?;
    let seq = headers
        .get(header_name("Producer-Seq"))
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| AppError::bad_input("Producer-Seq required with Producer-Id"))?
        .parse()
        .map_err(|_| AppError::bad_input("invalid Producer-Seq"))?;
    Ok(Some(ProducerHeaders { id: id.to_owned(), epoch, seq }))
}

fn apply_offset_headers(response: &mut Response, offset: Offset, closed: bool, write_timestamp: Option<i64>) {
    let h = response.headers_mut();
    h.insert(header_name("Stream-Next-Offset"), HeaderValue::from_str(&offset.encode()).unwrap());
    h.insert(header_name("Stream-Closed"), HeaderValue::from_str(&closed.to_string()).unwrap());
    if let Some(ts) = write_timestamp {
        h.insert(header_name("Stream-Write-Timestamp"), HeaderValue::from_str(&ts.to_string()).unwrap());
    }
}

fn apply_producer_ack(response: &mut Response, ack: Option<ProducerAck>) {
    if let Some(ack) = ack {
        let h = response.headers_mut();
        h.insert(header_name("Producer-Epoch"), HeaderValue::from_str(&ack.epoch.to_string()).unwrap());
        h.insert(header_name("Producer-Seq"), HeaderValue::from_str(&ack.seq.to_string()).unwrap());
    }
}

fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
