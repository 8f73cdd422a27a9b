//! Inbound relay deliveries.
//!
//! One `POST /qstash/{topic}` endpoint per routed topic, plus `GET /health`.
//! Every delivery goes through the same steps:
//!
//! 1. Verify the signature header against the raw, unparsed body (401).
//! 2. Resolve the topic; unknown topics are 404.
//! 3. Parse the verified bytes as JSON (400).
//! 4. Remove the relay's `{ "body": ... }` wrapper and decode the event.
//! 5. Dispatch through the [`TopicRouter`] and answer 200 only after the
//!    handler completed. A topic without a handler is 404, handler failure
//!    is 500 and a timeout is 503, so the relay schedules a retry.
//!
//! Unsigned callers learn nothing about which topics exist, and response
//! bodies never carry internal error detail.

use crate::bus::TransportError;
use crate::router::{DispatchOutcome, TopicRouter};
use crate::signature::SignatureVerifier;
use crate::types::{Event, Topic};
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

/// Signature header set by the relay.
pub const SIGNATURE_HEADER: &str = "upstash-signature";

/// Alternate spelling accepted for the signature header.
pub const ALT_SIGNATURE_HEADER: &str = "x-upstash-signature";

/// Shared state of the webhook endpoints.
#[derive(Debug, Clone)]
pub struct WebhookState {
    router: Arc<TopicRouter>,
    verifier: Arc<SignatureVerifier>,
    handler_timeout: Duration,
    service: String,
}

impl WebhookState {
    /// Create the state for `service`.
    pub fn new(
        service: impl Into<String>,
        router: Arc<TopicRouter>,
        verifier: SignatureVerifier,
        handler_timeout: Duration,
    ) -> Self {
        Self {
            router,
            verifier: Arc::new(verifier),
            handler_timeout,
            service: service.into(),
        }
    }
}

/// Build the webhook router.
pub fn webhook_router(state: WebhookState) -> Router {
    Router::new()
        .route("/qstash/:topic", post(receive))
        .route("/health", get(health))
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse<'a> {
    status: &'static str,
    service: &'a str,
    topics: Vec<&'static str>,
}

async fn health(State(state): State<WebhookState>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        service: &state.service,
        topics: state.router.topics().iter().map(Topic::as_str).collect(),
    })
    .into_response()
}

/// Why a delivery was not acknowledged.
#[derive(Debug)]
enum Rejection {
    NotFound,
    Unauthorized,
    BadRequest,
    HandlerFailed,
    TimedOut,
}

impl IntoResponse for Rejection {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Rejection::NotFound => (StatusCode::NOT_FOUND, "unknown topic"),
            Rejection::Unauthorized => (StatusCode::UNAUTHORIZED, "invalid signature"),
            Rejection::BadRequest => (StatusCode::BAD_REQUEST, "invalid body"),
            Rejection::HandlerFailed => (StatusCode::INTERNAL_SERVER_ERROR, "processing failed"),
            Rejection::TimedOut => (StatusCode::SERVICE_UNAVAILABLE, "processing timed out"),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

fn signature_header(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(SIGNATURE_HEADER)
        .or_else(|| headers.get(ALT_SIGNATURE_HEADER))
        .and_then(|value| value.to_str().ok())
}

/// Strip the relay's `{ "body": ... }` wrapper.
///
/// A string body holding JSON is decoded as well.
fn unwrap_relay_body(value: Value) -> Value {
    match value {
        Value::Object(mut map) if map.contains_key("body") => {
            match map.remove("body").unwrap_or(Value::Null) {
                Value::String(raw) => serde_json::from_str(&raw).unwrap_or(Value::String(raw)),
                body => body,
            }
        }
        other => other,
    }
}

async fn receive(
    State(state): State<WebhookState>,
    Path(topic): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, Rejection> {
    if !state.verifier.verify(&body, signature_header(&headers)) {
        tracing::warn!(
            topic = %topic,
            error = %TransportError::VerificationError,
            "Rejecting delivery"
        );
        return Err(Rejection::Unauthorized);
    }

    let topic: Topic = topic.parse().map_err(|_| {
        tracing::warn!(topic = %topic, "Delivery for unknown topic");
        Rejection::NotFound
    })?;

    let value: Value = serde_json::from_slice(&body).map_err(|e| {
        tracing::warn!(topic = %topic, error = %e, "Delivery body is not JSON");
        Rejection::BadRequest
    })?;
    let event = Event::from_json(topic, unwrap_relay_body(value));

    match tokio::time::timeout(state.handler_timeout, state.router.dispatch(&event)).await {
        Ok(Ok(DispatchOutcome::Handled)) => {
            tracing::debug!(topic = %topic, event_id = %event.id, "Delivery handled");
            Ok(Json(json!({ "received": true })))
        }
        Ok(Ok(DispatchOutcome::Unrouted)) => {
            tracing::warn!(topic = %topic, "Delivery for unrouted topic");
            Err(Rejection::NotFound)
        }
        Ok(Err(e)) => {
            let error = TransportError::HandlerError { topic, source: e };
            tracing::error!(topic = %topic, event_id = %event.id, error = %error, "Delivery failed");
            Err(Rejection::HandlerFailed)
        }
        Err(_) => {
            tracing::error!(
                topic = %topic,
                event_id = %event.id,
                timeout_ms = state.handler_timeout.as_millis() as u64,
                "Handler timed out"
            );
            Err(Rejection::TimedOut)
        }
    }
}
