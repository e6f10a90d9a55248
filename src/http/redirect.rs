//! HTTP to HTTPS redirect handler.
//!
//! Served on the plain-HTTP listener whenever HTTPS is enabled, so nothing is
//! proxied over the insecure channel.

use axum::http::{header, HeaderMap, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::Router;

/// Permanently redirects every request to the HTTPS listener's port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RedirectHandler {
    https_port: u16,
}

impl RedirectHandler {
    pub fn new(https_port: u16) -> Self {
        Self { https_port }
    }

    /// Router answering every method and path with a 301 Moved Permanently.
    ///
    /// Requests that name no host at all get a 400.
    pub fn router(self) -> Router {
        Router::new().fallback(any(move |headers: HeaderMap, uri: Uri| async move {
            match request_host(&headers, &uri) {
                Some(host) => self.redirect(host, &uri),
                None => {
                    tracing::debug!(uri = %uri, "Redirect request without a host");
                    StatusCode::BAD_REQUEST.into_response()
                }
            }
        }))
    }

    /// Build the redirect for a request to `host` with `uri`.
    pub fn redirect(&self, host: &str, uri: &Uri) -> Response {
        let https_url = self.target(host, uri);
        tracing::debug!(from = %uri, to = %https_url, "Redirecting HTTP to HTTPS");
        (StatusCode::MOVED_PERMANENTLY, [(header::LOCATION, https_url)]).into_response()
    }

    /// The HTTPS URL for a request, keeping path and query untouched.
    pub fn target(&self, host: &str, uri: &Uri) -> String {
        let path_and_query = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
        format!("https://{}:{}{}", strip_port(host), self.https_port, path_and_query)
    }
}

/// Host the client addressed: the `Host` header, else the URI authority.
/// Forwarding headers are ignored.
fn request_host<'a>(headers: &'a HeaderMap, uri: &'a Uri) -> Option<&'a str> {
    headers
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .filter(|host| !host.is_empty())
        .or_else(|| uri.authority().map(|authority| authority.as_str()))
}

/// Remove a trailing `:port` from a host, keeping IPv6 brackets.
fn strip_port(host: &str) -> &str {
    if host.starts_with('[') {
        return match host.find(']') {
            Some(end) => &host[..=end],
            None => host,
        };
    }

    match host.rsplit_once(':') {
        Some((name, _)) if !name.contains(':') => name,
        _ => host,
    }
}
