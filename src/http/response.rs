//! HTTP response building helpers
//!
//! Every error leaves the server as `{"error": kind, "detail": message}`.

use bytes::Bytes;
use http_body_util::Full;
use hyper::header::{self, HeaderValue};
use hyper::{Response, StatusCode};
use serde::Serialize;
use tracing::{error, warn};

use crate::error::CivicError;

pub type HttpResponse = Response<Full<Bytes>>;

/// Result type alias for handlers
pub type HandlerResult = Result<HttpResponse, CivicError>;

/// Build a JSON response with the given status code
pub fn json_response<T: Serialize>(status: StatusCode, body: &T) -> HttpResponse {
    let json = serde_json::to_string(body).unwrap_or_else(|_| "{}".to_string());
    let mut response = Response::new(Full::new(Bytes::from(json)));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

/// Build a JSON response with 200 OK status
pub fn ok<T: Serialize>(body: &T) -> HttpResponse {
    json_response(StatusCode::OK, body)
}

/// Build a JSON response with 201 Created status
pub fn created<T: Serialize>(body: &T) -> HttpResponse {
    json_response(StatusCode::CREATED, body)
}

/// Build an empty response with 204 No Content status
pub fn no_content() -> HttpResponse {
    let mut response = Response::new(Full::new(Bytes::new()));
    *response.status_mut() = StatusCode::NO_CONTENT;
    response
}

/// Build a 404 for unknown routes
pub fn route_not_found(method: &hyper::Method, path: &str) -> HttpResponse {
    json_response(
        StatusCode::NOT_FOUND,
        &serde_json::json!({ "error": "not_found", "detail": format!("No route for {} {}", method, path) }),
    )
}

/// Build a binary response. Header values that cannot be encoded are
/// dropped rather than failing the download.
pub fn binary_response(content_type: &'static str, disposition: &str, body: Vec<u8>) -> HttpResponse {
    let len = body.len();
    let mut response = Response::new(Full::new(Bytes::from(body)));
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(len));
    if let Ok(value) = HeaderValue::from_str(disposition) {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }
    response
}

pub fn status_for(err: &CivicError) -> StatusCode {
    match err {
        CivicError::MissingIdentity
        | CivicError::InvalidContribution(_)
        | CivicError::InvalidInput(_)
        | CivicError::Json(_) => StatusCode::BAD_REQUEST,
        CivicError::Auth(_) => StatusCode::UNAUTHORIZED,
        CivicError::Forbidden(_) => StatusCode::FORBIDDEN,
        CivicError::NotFound(_) => StatusCode::NOT_FOUND,
        CivicError::AlreadyContributed(_) | CivicError::Conflict(_) => StatusCode::CONFLICT,
        CivicError::LimitReached(_) => StatusCode::TOO_MANY_REQUESTS,
        CivicError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        CivicError::Config(_)
        | CivicError::Io(_)
        | CivicError::Database(_)
        | CivicError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Convert a CivicError to an appropriate HTTP response
pub fn error_response(err: CivicError) -> HttpResponse {
    let status = status_for(&err);
    if status.is_server_error() {
        error!(error = %err, kind = err.kind(), "Request failed");
    } else {
        warn!(error = %err, kind = err.kind(), "Request rejected");
    }

    // Internal details stay in the log
    let detail = match status {
        StatusCode::INTERNAL_SERVER_ERROR => "Internal server error".to_string(),
        _ => err.to_string(),
    };
    json_response(status, &serde_json::json!({ "error": err.kind(), "detail": detail }))
}
