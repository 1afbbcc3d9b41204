use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use tracing::{debug, error, warn};
use ulid::Ulid;

use crate::engine::{Engine, EngineError};
use crate::limits::MAX_WEBHOOK_BODY_BYTES;
use crate::observability::WEBHOOK_EVENTS_TOTAL;

pub const SIGNATURE_HEADER: &str = "payment-signature";
pub const CHECKOUT_COMPLETED: &str = "checkout.session.completed";

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error("InvalidEvent: {0}")]
    InvalidEvent(&'static str),
    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl IntoResponse for WebhookError {
    fn into_response(self) -> Response {
        let status = match &self {
            WebhookError::InvalidEvent(_) => StatusCode::BAD_REQUEST,
            WebhookError::Engine(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.to_string()).into_response()
    }
}

/// Checks `t=<unix seconds>,v1=<hex>` signatures: HMAC-SHA256 over
/// `"<t>.<body>"`, with `t` no further than `tolerance_secs` from now.
/// An empty secret leaves the verifier unconfigured: it rejects everything.
#[derive(Clone)]
pub struct SignatureVerifier {
    secret: Option<Arc<[u8]>>,
    tolerance_secs: u64,
}

impl SignatureVerifier {
    pub fn new(secret: &str, tolerance_secs: u64) -> Self {
        Self {
            secret: (!secret.is_empty()).then(|| Arc::from(secret.as_bytes())),
            tolerance_secs,
        }
    }

    pub fn is_configured(&self) -> bool {
        self.secret.is_some()
    }

    pub fn sign(&self, timestamp: i64, body: &[u8]) -> String {
        let Some(secret) = &self.secret else {
            return String::new();
        };
        let Ok(mut mac) = HmacSha256::new_from_slice(secret) else {
            // HMAC takes keys of any length.
            return String::new();
        };
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(body);
        mac.finalize()
            .into_bytes()
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect()
    }

    /// Header value for a body signed at `timestamp`.
    pub fn header_value(&self, timestamp: i64, body: &[u8]) -> String {
        format!("t={timestamp},v1={}", self.sign(timestamp, body))
    }

    pub fn verify(&self, header: &str, body: &[u8], now: i64) -> Result<(), WebhookError> {
        let mut timestamp = None;
        let mut candidates = Vec::new();
        for part in header.split(',') {
            match part.trim().split_once('=') {
                Some(("t", t)) => timestamp = t.parse::<i64>().ok(),
                Some(("v1", sig)) => candidates.push(sig),
                _ => {}
            }
        }
        if self.secret.is_none() {
            return Err(WebhookError::InvalidEvent("webhook secret not configured"));
        }
        let timestamp = timestamp.ok_or(WebhookError::InvalidEvent("signature has no timestamp"))?;
        if now.abs_diff(timestamp) > self.tolerance_secs {
            return Err(WebhookError::InvalidEvent("signature timestamp outside tolerance"));
        }
        let expected = self.sign(timestamp, body);
        if candidates
            .iter()
            .any(|sig| constant_time_eq::constant_time_eq(expected.as_bytes(), sig.as_bytes()))
        {
            Ok(())
        } else {
            Err(WebhookError::InvalidEvent("signature mismatch"))
        }
    }
}

#[derive(Debug, Deserialize)]
struct PaymentEvent {
    #[serde(default)]
    id: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Option<EventData>,
}

#[derive(Debug, Deserialize)]
struct EventData {
    object: EventObject,
}

#[derive(Debug, Deserialize)]
struct EventObject {
    #[serde(default)]
    metadata: HashMap<String, String>,
}

impl PaymentEvent {
    fn booking_id(&self) -> Result<Ulid, WebhookError> {
        let raw = self
            .data
            .as_ref()
            .and_then(|d| d.object.metadata.get("booking_id"))
            .ok_or(WebhookError::InvalidEvent("missing booking_id"))?;
        Ulid::from_string(raw).map_err(|_| WebhookError::InvalidEvent("malformed booking_id"))
    }
}

pub struct WebhookState {
    pub engine: Arc<Engine>,
    pub verifier: SignatureVerifier,
}

pub fn router(state: Arc<WebhookState>) -> Router {
    Router::new()
        .route("/webhooks/payment", post(payment_webhook))
        .route("/health", get(health))
        .layer(DefaultBodyLimit::max(MAX_WEBHOOK_BODY_BYTES))
        .with_state(state)
}

async fn health() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

async fn payment_webhook(
    State(state): State<Arc<WebhookState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<serde_json::Value>, WebhookError> {
    let result = handle_payment(&state, &headers, &body).await;
    let outcome = match &result {
        Ok(outcome) => *outcome,
        Err(WebhookError::InvalidEvent(reason)) => {
            warn!("payment webhook rejected: {reason}");
            "invalid"
        }
        Err(WebhookError::Engine(e)) => {
            error!("payment webhook failed: {e}");
            "error"
        }
    };
    metrics::counter!(WEBHOOK_EVENTS_TOTAL, "outcome" => outcome).increment(1);
    result.map(|outcome| Json(serde_json::json!({ "received": true, "outcome": outcome })))
}

async fn handle_payment(
    state: &WebhookState,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<&'static str, WebhookError> {
    let header = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or(WebhookError::InvalidEvent("missing signature header"))?;
    state
        .verifier
        .verify(header, body, chrono::Utc::now().timestamp())?;

    let event: PaymentEvent =
        serde_json::from_slice(body).map_err(|_| WebhookError::InvalidEvent("malformed payload"))?;
    if event.kind != CHECKOUT_COMPLETED {
        debug!(event = %event.id, kind = %event.kind, "payment event ignored");
        return Ok("ignored_type");
    }
    let booking_id = event.booking_id()?;
    let outcome = state.engine.confirm_via_payment(booking_id).await?;
    Ok(outcome.as_str())
}
