//! CORS headers added to every response of a routed request.

use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};

pub const ALLOW_ORIGIN: &str = "*";
pub const ALLOW_METHODS: &str = "GET, POST, PUT, HEAD, OPTIONS";

/// Sets the allow-origin/methods headers and echoes the headers the client
/// asked for in `Access-Control-Request-Headers` (empty if none).
pub fn apply_cors_headers(request: &HeaderMap, response: &mut HeaderMap) {
    response.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static(ALLOW_ORIGIN),
    );
    response.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static(ALLOW_METHODS),
    );

    let requested = request
        .get_all(header::ACCESS_CONTROL_REQUEST_HEADERS)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .collect::<Vec<_>>()
        .join(", ");
    let allow_headers =
        HeaderValue::from_str(&requested).unwrap_or_else(|_| HeaderValue::from_static(""));
    response.insert(header::ACCESS_CONTROL_ALLOW_HEADERS, allow_headers);
}

/// Local answer to a CORS preflight. Never reaches the upstream.
pub fn preflight_response(request: &HeaderMap) -> Response {
    let mut response = StatusCode::NO_CONTENT.into_response();
    apply_cors_headers(request, response.headers_mut());
    response
}
