//! Request logging middleware.

use std::time::Instant;

use axum::body::Body;
use axum::http::Request;
use axum::middleware::Next;
use axum::response::IntoResponse;
use tracing::info;

pub async fn log_requests(request: Request<Body>, next: Next) -> impl IntoResponse {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let start = Instant::now();

    let response = next.run(request).await;

    info!(
        "{} {} {} {:?}",
        method,
        path,
        response.status().as_u16(),
        start.elapsed()
    );
    response
}
