//! Axum adapter around the [`DecisionEngine`].
//!
//! Attached per route with `from_fn_with_state`. The adapter reads the key
//! header, turns path params, query and body into fingerprint arguments,
//! maps the decision to a response and, after a cache miss, buffers the
//! handler's response so it can be stored for replay.

use std::future::poll_fn;
use std::pin::Pin;
use std::sync::Arc;

use axum::body::{to_bytes, Body, Bytes, HttpBody};
use axum::extract::{RawPathParams, Request, State};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::routing::MethodRouter;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde_json::{Map, Value};

use crate::engine::{Decision, DecisionEngine};
use crate::errors::AppError;
use crate::fingerprint::Fingerprint;
use crate::models::{BodyArgument, CachedResponse, IdempotentRequest, RouteDescriptor};
use crate::sanitize::sanitize_key;

/// Set on every replayed response.
pub const REPLAYED_HEADER: &str = "idempotent-replayed";

#[derive(Clone)]
pub struct IdempotencyState {
    pub engine: Arc<DecisionEngine>,
    pub route: Arc<RouteDescriptor>,
}

impl IdempotencyState {
    pub fn new(engine: Arc<DecisionEngine>, route: RouteDescriptor) -> Self {
        Self {
            engine,
            route: Arc::new(route),
        }
    }
}

/// Guard every method of `router` with the adapter, using `route` for its
/// per-route settings.
pub fn idempotent<S>(router: MethodRouter<S>, engine: &Arc<DecisionEngine>, route: RouteDescriptor) -> MethodRouter<S>
where
    S: Clone + Send + Sync + 'static,
{
    router.route_layer(axum::middleware::from_fn_with_state(
        IdempotencyState::new(engine.clone(), route),
        idempotency_middleware,
    ))
}

pub async fn idempotency_middleware(
    State(state): State<IdempotencyState>,
    params: Option<RawPathParams>,
    req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let engine = &state.engine;
    let options = engine.options();

    let key = match req.headers().get(options.header_name.as_str()) {
        Some(value) => value.to_str().map(str::to_owned).unwrap_or_else(|_| {
            tracing::info!(route = %state.route.name, "idempotency key is not visible ASCII, treated as missing");
            String::new()
        }),
        None => String::new(),
    };
    let method = req.method().clone();

    // Non-eligible and keyless requests never touch the body
    if engine.precheck(&method, &key).is_some() {
        let decision = engine.process(&IdempotentRequest::new(key, method)).await?;
        return match decision {
            Decision::HeaderMissing => Err(AppError::HeaderMissing(options.errors.missing_header.clone())),
            _ => Ok(next.run(req).await),
        };
    }

    let (parts, body) = req.into_parts();
    if declared_length(&parts.headers).is_some_and(|len| len > options.max_body_bytes) {
        return Err(AppError::PayloadTooLarge);
    }
    let bytes = read_body(body, options.max_body_bytes).await?;

    let mut request = IdempotentRequest::new(key.clone(), method)
        .with_headers(parts.headers.clone())
        .with_ttl(state.route.ttl);
    for argument in arguments(&state.route, params.as_ref(), parts.uri.query(), &parts.headers, &bytes) {
        request = request.with_argument(argument);
    }
    let fingerprint = engine.fingerprint(&request);

    let decision = engine.process(&request).await?;
    match decision {
        Decision::NotApplicable => Ok(next.run(Request::from_parts(parts, Body::from(bytes))).await),
        Decision::HeaderMissing => Err(AppError::HeaderMissing(options.errors.missing_header.clone())),
        Decision::Reuse => Err(AppError::Reuse(options.errors.reuse.clone())),
        Decision::Retried => Err(AppError::Retried(options.errors.retried.clone())),
        Decision::CacheHit(cached) => Ok(replay(cached)),
        Decision::CacheMiss => {
            let response = next.run(Request::from_parts(parts, Body::from(bytes))).await;
            store_outcome(engine, &state.route, &key, &fingerprint, response).await
        }
    }
}

/// Buffer the handler's response, record it unless it is a server error,
/// and hand it back to the client unchanged.
async fn store_outcome(
    engine: &DecisionEngine,
    route: &RouteDescriptor,
    key: &str,
    fingerprint: &Fingerprint,
    response: Response,
) -> Result<Response, AppError> {
    let (parts, body) = response.into_parts();
    let bytes = to_bytes(body, usize::MAX)
        .await
        .map_err(|e| AppError::Internal(anyhow::anyhow!("failed to buffer handler response: {}", e)))?;

    if parts.status.is_server_error() {
        tracing::warn!(
            route = %route.name,
            key = %sanitize_key(key),
            status = parts.status.as_u16(),
            "handler failed, idempotency record left outstanding"
        );
    } else {
        let cached = CachedResponse::capture(parts.status.as_u16(), &parts.headers, bytes.to_vec());
        if let Err(e) = engine.complete(key, fingerprint, cached).await {
            // the client still gets its result; retries will see Retried until expiry
            tracing::error!(route = %route.name, "failed to store idempotent response: {}", e);
        }
    }

    Ok(Response::from_parts(parts, Body::from(bytes)))
}

/// Buffer a request body of at most `limit` bytes. Only an oversized body
/// is a 413; a stream that fails midway is a 400.
async fn read_body(mut body: Body, limit: usize) -> Result<Bytes, AppError> {
    let mut collected = Vec::new();
    while let Some(frame) = poll_fn(|cx| Pin::new(&mut body).poll_frame(cx)).await {
        let frame = frame.map_err(AppError::BodyUnreadable)?;
        if let Ok(data) = frame.into_data() {
            if collected.len() + data.len() > limit {
                return Err(AppError::PayloadTooLarge);
            }
            collected.extend_from_slice(&data);
        }
    }
    Ok(Bytes::from(collected))
}

fn replay(cached: CachedResponse) -> Response {
    let status = StatusCode::from_u16(cached.status).unwrap_or(StatusCode::OK);
    let mut headers = HeaderMap::new();
    for (name, value) in &cached.headers {
        if let (Ok(name), Ok(value)) = (HeaderName::try_from(name.as_str()), HeaderValue::from_str(value)) {
            headers.append(name, value);
        }
    }
    headers.insert(REPLAYED_HEADER, HeaderValue::from_static("true"));
    (status, headers, cached.body).into_response()
}

fn declared_length(headers: &HeaderMap) -> Option<usize> {
    headers
        .get(header::CONTENT_LENGTH)?
        .to_str()
        .ok()?
        .parse()
        .ok()
}

/// Fingerprint arguments for one request: `path`, `query` and `body`,
/// each omitted when empty.
fn arguments(
    route: &RouteDescriptor,
    params: Option<&RawPathParams>,
    query: Option<&str>,
    headers: &HeaderMap,
    body: &[u8],
) -> Vec<BodyArgument> {
    let mut arguments = Vec::new();

    if let Some(params) = params {
        let path: Map<String, Value> = params
            .iter()
            .map(|(name, value)| (name.to_string(), Value::String(value.to_string())))
            .collect();
        if !path.is_empty() {
            arguments.push(BodyArgument::new("path", Value::Object(path)));
        }
    }

    if let Some(query) = query.filter(|q| !q.is_empty()) {
        arguments.push(BodyArgument::new("query", form_object(query.as_bytes())));
    }

    if !body.is_empty() {
        let content_type = headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        arguments.push(
            BodyArgument::new("body", body_value(content_type, body))
                .excluding(route.excludes.iter().cloned())
                .ignored(route.ignore_body),
        );
    }

    arguments
}

/// JSON bodies keep their structure so excludes can apply to top-level
/// fields. Form bodies become objects. Anything else is hashed as text or,
/// when not UTF-8, as base64.
pub(crate) fn body_value(content_type: &str, body: &[u8]) -> Value {
    let content_type = content_type.to_ascii_lowercase();
    if content_type.contains("json") {
        if let Ok(value) = serde_json::from_slice(body) {
            return value;
        }
    } else if content_type.starts_with("application/x-www-form-urlencoded") {
        return form_object(body);
    }

    match std::str::from_utf8(body) {
        Ok(text) => Value::String(text.to_string()),
        Err(_) => Value::String(STANDARD.encode(body)),
    }
}

/// Urlencoded pairs as an object; repeated names collect into an array.
fn form_object(input: &[u8]) -> Value {
    let mut object = Map::new();
    for (name, value) in url::form_urlencoded::parse(input) {
        let value = Value::String(value.into_owned());
        match object.get_mut(&*name) {
            Some(Value::Array(values)) => values.push(value),
            Some(existing) => {
                let first = existing.take();
                *existing = Value::Array(vec![first, value]);
            }
            None => {
                object.insert(name.into_owned(), value);
            }
        }
    }
    Value::Object(object)
}
