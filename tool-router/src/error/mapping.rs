//! Error mapping for remote executor responses
//!
//! Converts non-success HTTP answers from the remote executor into the
//! normalized ServiceError taxonomy.

use reqwest::StatusCode;
use serde_json::Value;

use super::{ErrorContext, ServiceError};

/// Longest body excerpt kept in an error message
const MAX_BODY_EXCERPT: usize = 100;

/// Map a non-success HTTP answer to a ServiceError
pub fn map_http_error(status: StatusCode, body: &str, context: &mut ErrorContext) -> ServiceError {
    context.status_code = Some(status.as_u16());

    // Prefer a structured message when the remote sent JSON
    let message = match serde_json::from_str::<Value>(body) {
        Ok(json) => {
            if let Some(code) = json
                .get("error")
                .and_then(|e| e.get("code"))
                .and_then(|c| c.as_str())
            {
                context.add("remote_error_code", code);
            }

            json.get("message")
                .or_else(|| json.get("error").and_then(|e| e.get("message")))
                .or_else(|| json.get("error"))
                .and_then(|m| m.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| excerpt(status, body))
        }
        Err(_) => excerpt(status, body),
    };

    map_status(status, message)
}

/// Map a status code and message to a ServiceError
pub fn map_status(status: StatusCode, message: impl Into<String>) -> ServiceError {
    let message = message.into();
    match status {
        // The remote rejected the caller's arguments, not a sign of ill health
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
            ServiceError::validation(message)
        }
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ServiceError::auth(message),
        StatusCode::TOO_MANY_REQUESTS => ServiceError::rate_limit(message),
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => ServiceError::timeout(message),
        StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE => {
            ServiceError::transport(message)
        }
        StatusCode::NOT_FOUND => ServiceError::remote(format!("Resource not found: {}", message)),
        _ => ServiceError::remote(message),
    }
}

/// Helper function to classify HTTP errors by category
pub fn classify_http_error(status: StatusCode) -> &'static str {
    match status.as_u16() {
        400 | 422 => "validation",
        401 | 403 => "auth",
        404 => "not_found",
        408 | 504 => "timeout",
        429 => "rate_limit",
        502 | 503 => "transport",
        500..=599 => "server",
        _ => "unknown",
    }
}

fn excerpt(status: StatusCode, body: &str) -> String {
    if body.is_empty() {
        status.to_string()
    } else if body.len() > MAX_BODY_EXCERPT {
        let cut = body
            .char_indices()
            .map(|(i, _)| i)
            .take_while(|i| *i <= MAX_BODY_EXCERPT)
            .last()
            .unwrap_or(0);
        format!("{}: {}...", status, &body[..cut])
    } else {
        format!("{}: {}", status, body)
    }
}
