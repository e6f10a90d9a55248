//! Request ID middleware for correlating logs with requests.
//!
//! Generates a UUID v4 for each incoming request and creates a tracing span
//! that wraps the entire request lifecycle, tagged with the transport the
//! request arrived on. Logs emitted while the cache engine handles the request
//! carry the request_id field, and the completion line reports whether the
//! object store answered it.

use std::time::Instant;

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use tracing::Instrument;
use uuid::Uuid;

use crate::cache::CacheStatus;
use crate::http::Transport;

/// Extension type for accessing the request ID in handlers.
#[derive(Clone, Debug)]
pub struct RequestId(pub Uuid);

/// Middleware that generates a request ID and creates a request span.
///
/// Installed as the outermost layer of every listener's router.
pub async fn request_id_layer(
    State(transport): State<Transport>,
    mut request: Request,
    next: Next,
) -> Response {
    let request_id = Uuid::new_v4();
    let method = request.method().clone();
    let path = request.uri().path().to_string();

    let span = tracing::info_span!(
        "request",
        request_id = %request_id,
        transport = %transport,
        method = %method,
        path = %path,
        duration_ms = tracing::field::Empty,
        cache = tracing::field::Empty,
    );

    let start = Instant::now();
    request.extensions_mut().insert(RequestId(request_id));

    async move {
        let response = next.run(request).await;
        let duration_ms = start.elapsed().as_millis() as u64;
        // Redirect responses never reach the engine
        let cache = response
            .extensions()
            .get::<CacheStatus>()
            .map_or("none", CacheStatus::as_str);

        let span = tracing::Span::current();
        span.record("duration_ms", duration_ms);
        span.record("cache", cache);
        tracing::info!(
            status = response.status().as_u16(),
            duration_ms,
            cache,
            "Request completed"
        );

        response
    }
    .instrument(span)
    .await
}
