//! HTTP callback endpoint.
//!
//! The FHIR server calls `{webhook_path}/{subscription_id}` for every
//! matching resource change. GET and POST are routed; PUT and DELETE are
//! accepted and ignored.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Serialize;

use super::router::{NotificationRouter, NotifyOutcome};

/// Webhook error responses.
#[derive(Debug)]
pub enum WebhookError {
    /// The subscription no longer exists here, or routing is off.
    /// Tells the FHIR server to stop calling.
    Gone(String),
    /// The body could not be decoded.
    BadRequest(String),
}

/// Error response body.
#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: bool,
    pub code: String,
    pub message: String,
}

impl IntoResponse for WebhookError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            WebhookError::Gone(msg) => (StatusCode::GONE, "GONE", msg),
            WebhookError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg),
        };

        let body = ErrorResponse {
            error: true,
            code: code.to_string(),
            message,
        };

        (status, Json(body)).into_response()
    }
}

/// Build the callback routes under `webhook_path`.
pub fn routes(webhook_path: &str) -> Router<Arc<NotificationRouter>> {
    let path = format!("{}/:subscription_id", webhook_path.trim_end_matches('/'));
    Router::new().route(
        &path,
        get(handle_notification)
            .post(handle_notification)
            .put(ignore)
            .delete(ignore),
    )
}

#[tracing::instrument(skip(router, body), fields(bytes = body.len()))]
async fn handle_notification(
    State(router): State<Arc<NotificationRouter>>,
    Path(subscription_id): Path<String>,
    body: Bytes,
) -> Result<StatusCode, WebhookError> {
    match router.notify_bytes(&subscription_id, &body) {
        NotifyOutcome::Delivered { .. } => Ok(StatusCode::OK),
        NotifyOutcome::NotFound => Err(WebhookError::Gone(format!(
            "Unknown subscription {subscription_id}"
        ))),
        NotifyOutcome::Disabled => Err(WebhookError::Gone(
            "Notification routing is disabled".to_string(),
        )),
        NotifyOutcome::Rejected(e) if router.is_disabled() => Err(WebhookError::Gone(format!(
            "Notification routing disabled after decode failure: {e}"
        ))),
        NotifyOutcome::Rejected(e) => Err(WebhookError::BadRequest(e.to_string())),
    }
}

async fn ignore() -> StatusCode {
    StatusCode::OK
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gone_maps_to_410() {
        let response = WebhookError::Gone("x".into()).into_response();
        assert_eq!(response.status(), StatusCode::GONE);
    }

    #[test]
    fn test_bad_request_maps_to_400() {
        let response = WebhookError::BadRequest("x".into()).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
