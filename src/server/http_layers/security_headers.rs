//! Hardening headers applied to every response.

use axum::body::Body;
use axum::http::header::{HeaderName, HeaderValue};
use axum::http::Request;
use axum::middleware::Next;
use axum::response::IntoResponse;

// Leaflet is vendored under /web/vendor for offline use; map tiles may still
// be fetched from OSM.
const CSP: &str = "default-src 'self'; img-src 'self' data: https://tile.openstreetmap.org; \
    style-src 'self' 'unsafe-inline'; script-src 'self'; font-src 'self' data:; \
    connect-src 'self'; media-src 'self'; frame-ancestors 'none';";

const HEADERS: &[(&str, &str)] = &[
    ("x-content-type-options", "nosniff"),
    ("x-frame-options", "DENY"),
    ("referrer-policy", "no-referrer"),
    ("cross-origin-resource-policy", "same-origin"),
    ("cross-origin-opener-policy", "same-origin"),
];

pub async fn security_headers(request: Request<Body>, next: Next) -> impl IntoResponse {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    for (name, value) in HEADERS {
        headers.insert(
            HeaderName::from_static(name),
            HeaderValue::from_static(value),
        );
    }
    headers.insert(
        HeaderName::from_static("content-security-policy"),
        HeaderValue::from_static(CSP),
    );
    response
}
