//! Caching proxy in front of the upstream LFS server.
//!
//! Every request is forwarded to the upstream with its path appended to the
//! upstream URL's path. `GET` and `HEAD` requests for `.../objects/<oid>` are
//! served from the object store when present; a `GET` miss downloads the full
//! object, verifies it and then serves it from disk.

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use axum::body::{Body, HttpBody};
use axum::extract::Request;
use axum::http::request::Parts;
use axum::http::{header, HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use reqwest::Url;
use tower::ServiceExt;
use tower_http::services::ServeFile;

use super::store::{ObjectStore, Oid, StoreError};
use super::RequestHandler;

/// Headers that describe a single connection and must not be forwarded
static HOP_BY_HOP_HEADERS: [header::HeaderName; 7] = [
    header::CONNECTION,
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

/// Conditional and range headers dropped when fetching a full object to cache
static PARTIAL_FETCH_HEADERS: [header::HeaderName; 5] = [
    header::RANGE,
    header::IF_RANGE,
    header::IF_MATCH,
    header::IF_NONE_MATCH,
    header::IF_MODIFIED_SINCE,
];

/// How the engine answered a request, attached to responses as an extension
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    /// Served from the object store without contacting the upstream
    Hit,
    /// Downloaded from the upstream, then served from the object store
    Miss,
    /// Relayed from the upstream without touching the object store
    Bypass,
}

impl CacheStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheStatus::Hit => "hit",
            CacheStatus::Miss => "miss",
            CacheStatus::Bypass => "bypass",
        }
    }
}

/// Cache engine construction error
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("cache directory {path} is unusable: {source}")]
    Directory { path: PathBuf, source: io::Error },

    #[error("failed to build upstream client: {0}")]
    Client(#[from] reqwest::Error),
}

/// Caching reverse proxy for one upstream LFS server
pub struct CacheServer {
    upstream: Url,
    client: reqwest::Client,
    store: ObjectStore,
}

impl CacheServer {
    pub fn new(upstream: Url, directory: &Path) -> Result<Self, EngineError> {
        let store = ObjectStore::open(directory).map_err(|source| EngineError::Directory {
            path: directory.to_path_buf(),
            source,
        })?;

        // Redirects are relayed to the client untouched
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()?;

        tracing::debug!(
            upstream = %upstream,
            directory = %store.root().display(),
            "Initialized cache engine"
        );

        Ok(Self {
            upstream,
            client,
            store,
        })
    }

    /// Map a request URI onto the upstream URL.
    fn upstream_url(&self, uri: &Uri) -> Url {
        let mut url = self.upstream.clone();
        let base = self.upstream.path().trim_end_matches('/');
        url.set_path(&format!("{}{}", base, uri.path()));
        url.set_query(uri.query());
        url
    }

    async fn forward(
        &self,
        parts: &Parts,
        body: Option<Body>,
        skip_headers: &[header::HeaderName],
    ) -> Result<reqwest::Response, reqwest::Error> {
        let mut headers = forwardable_headers(&parts.headers);
        headers.remove(header::HOST);
        for name in skip_headers {
            headers.remove(name);
        }

        let mut request = self
            .client
            .request(parts.method.clone(), self.upstream_url(&parts.uri))
            .headers(headers);
        if let Some(body) = body {
            request = request.body(reqwest::Body::wrap_stream(body.into_data_stream()));
        }
        request.send().await
    }

    async fn serve_object(&self, oid: &Oid, parts: Parts) -> Response {
        let request = Request::from_parts(parts, Body::empty());
        let response = match ServeFile::new(self.store.object_path(oid)).oneshot(request).await {
            Ok(response) => response,
            Err(infallible) => match infallible {},
        };
        if response.status().is_server_error() {
            tracing::error!(oid = %oid, status = %response.status(), "Failed to read cached object");
        }
        response.map(Body::new)
    }

    /// Fetch a missing object, store it and serve it from disk.
    async fn fetch_object(&self, oid: &Oid, parts: Parts) -> Response {
        let upstream = match self.forward(&parts, None, &PARTIAL_FETCH_HEADERS).await {
            Ok(response) => response,
            Err(e) => return bad_gateway(&e),
        };

        if upstream.status() != StatusCode::OK {
            return relay(upstream);
        }

        match self.store.insert(oid, upstream.bytes_stream()).await {
            Ok(_) => {
                tracing::info!(oid = %oid, "Cached object");
                self.serve_object(oid, parts).await
            }
            Err(e @ StoreError::DigestMismatch { .. }) | Err(e @ StoreError::Body(_)) => {
                tracing::warn!(oid = %oid, error = %e, "Discarded upstream object");
                StatusCode::BAD_GATEWAY.into_response()
            }
            Err(e) => {
                tracing::error!(oid = %oid, error = %e, "Failed to store object");
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            }
        }
    }
}

#[async_trait]
impl RequestHandler for CacheServer {
    async fn handle(&self, request: Request) -> Response {
        let (status, mut response) = self.dispatch(request).await;
        response.extensions_mut().insert(status);
        response
    }
}

impl CacheServer {
    async fn dispatch(&self, request: Request) -> (CacheStatus, Response) {
        let (parts, body) = request.into_parts();

        let oid = match parts.method {
            Method::GET | Method::HEAD => Oid::from_object_path(parts.uri.path()),
            _ => None,
        };

        if let Some(oid) = oid {
            if self.store.contains(&oid).await {
                tracing::debug!(oid = %oid, "Cache hit");
                return (CacheStatus::Hit, self.serve_object(&oid, parts).await);
            }
            if parts.method == Method::GET {
                tracing::debug!(oid = %oid, "Cache miss");
                return (CacheStatus::Miss, self.fetch_object(&oid, parts).await);
            }
        }

        // HTTP/2 and chunked bodies have no Content-Length, so look at the body itself
        let body = (!body.is_end_stream() && body.size_hint().exact() != Some(0)).then_some(body);

        let response = match self.forward(&parts, body, &[]).await {
            Ok(upstream) => relay(upstream),
            Err(e) => bad_gateway(&e),
        };
        (CacheStatus::Bypass, response)
    }
}

fn forwardable_headers(headers: &HeaderMap) -> HeaderMap {
    let mut headers = headers.clone();
    for name in &HOP_BY_HOP_HEADERS {
        headers.remove(name);
    }
    headers
}

/// Turn an upstream response into a streamed client response.
fn relay(upstream: reqwest::Response) -> Response {
    let status = upstream.status();
    let headers = forwardable_headers(upstream.headers());

    let mut response = Response::new(Body::from_stream(upstream.bytes_stream()));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

fn bad_gateway(error: &reqwest::Error) -> Response {
    tracing::warn!(error = %error, "Upstream request failed");
    StatusCode::BAD_GATEWAY.into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use axum::body::to_bytes;
    use axum::extract::State;
    use axum::routing::{get, post};
    use axum::Router;

    const OBJECT: &[u8] = b"lfs object body";
    const OBJECT_OID: &str = "9372134f9f1b42f39855c0f37dc0896fdc6fec64a5bdecffa64f7ec549989190";
    const WRONG_OID: &str = "0000000000000000000000000000000000000000000000000000000000000000";

    /// Spawn a fake LFS server and return its base URL and hit counter.
    async fn spawn_upstream() -> (Url, Arc<AtomicUsize>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let app = Router::new()
            .route(
                "/repo/info/lfs/objects/{oid}",
                get(|State(hits): State<Arc<AtomicUsize>>| async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    OBJECT
                }),
            )
            .route(
                "/repo/info/lfs/echo",
                get(|uri: Uri| async move { uri.to_string() })
                    .post(|body: String| async move { format!("got:{}", body) }),
            )
            .with_state(hits.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        (Url::parse(&format!("http://{}/repo/info/lfs/", addr)).unwrap(), hits)
    }

    fn get_request(path: &str) -> Request {
        Request::builder().uri(path).body(Body::empty()).unwrap()
    }

    async fn body_bytes(response: Response) -> Vec<u8> {
        to_bytes(response.into_body(), usize::MAX).await.unwrap().to_vec()
    }

    #[test]
    fn test_engine_rejects_unusable_directory() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("not-a-dir");
        std::fs::write(&file, b"").unwrap();

        let upstream = Url::parse("http://lfs.example.com").unwrap();
        let err = CacheServer::new(upstream, &file).err().unwrap();
        assert!(matches!(err, EngineError::Directory { .. }));
    }

    #[test]
    fn test_upstream_url_joins_paths() {
        let dir = tempfile::tempdir().unwrap();
        let upstream = Url::parse("https://lfs.example.com/org/repo.git/info/lfs/").unwrap();
        let server = CacheServer::new(upstream, dir.path()).unwrap();

        let uri: Uri = "/objects/batch?x=1".parse().unwrap();
        assert_eq!(
            server.upstream_url(&uri).as_str(),
            "https://lfs.example.com/org/repo.git/info/lfs/objects/batch?x=1"
        );
    }

    #[tokio::test]
    async fn test_object_is_cached_after_first_fetch() {
        let (upstream, hits) = spawn_upstream().await;
        let dir = tempfile::tempdir().unwrap();
        let server = CacheServer::new(upstream, dir.path()).unwrap();
        let path = format!("/objects/{}", OBJECT_OID);

        let first = server.handle(get_request(&path)).await;
        assert_eq!(first.status(), StatusCode::OK);
        assert_eq!(body_bytes(first).await, OBJECT);

        let second = server.handle(get_request(&path)).await;
        assert_eq!(second.status(), StatusCode::OK);
        assert_eq!(body_bytes(second).await, OBJECT);

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(server.store.contains(&Oid::parse(OBJECT_OID).unwrap()).await);
    }

    #[tokio::test]
    async fn test_responses_carry_cache_status() {
        let (upstream, _hits) = spawn_upstream().await;
        let dir = tempfile::tempdir().unwrap();
        let server = CacheServer::new(upstream, dir.path()).unwrap();
        let path = format!("/objects/{}", OBJECT_OID);

        let first = server.handle(get_request(&path)).await;
        assert_eq!(first.extensions().get::<CacheStatus>(), Some(&CacheStatus::Miss));

        let second = server.handle(get_request(&path)).await;
        assert_eq!(second.extensions().get::<CacheStatus>(), Some(&CacheStatus::Hit));

        let other = server.handle(get_request("/echo")).await;
        assert_eq!(other.extensions().get::<CacheStatus>(), Some(&CacheStatus::Bypass));
    }

    #[tokio::test]
    async fn test_object_with_wrong_digest_is_not_cached() {
        let (upstream, _hits) = spawn_upstream().await;
        let dir = tempfile::tempdir().unwrap();
        let server = CacheServer::new(upstream, dir.path()).unwrap();

        let response = server
            .handle(get_request(&format!("/objects/{}", WRONG_OID)))
            .await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert!(!server.store.contains(&Oid::parse(WRONG_OID).unwrap()).await);
    }

    #[tokio::test]
    async fn test_other_requests_pass_through() {
        let (upstream, _hits) = spawn_upstream().await;
        let dir = tempfile::tempdir().unwrap();
        let server = CacheServer::new(upstream, dir.path()).unwrap();

        let response = server.handle(get_request("/echo?x=1")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_bytes(response).await, b"/repo/info/lfs/echo?x=1");

        let missing = server.handle(get_request("/nope")).await;
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_body_without_length_header_is_forwarded() {
        let (upstream, _hits) = spawn_upstream().await;
        let dir = tempfile::tempdir().unwrap();
        let server = CacheServer::new(upstream, dir.path()).unwrap();

        // Same framing as an HTTP/2 request: no Content-Length, no Transfer-Encoding
        let request = Request::builder()
            .method(Method::POST)
            .uri("/echo")
            .body(Body::from("{\"operation\":\"download\"}"))
            .unwrap();
        assert!(request.headers().get(header::CONTENT_LENGTH).is_none());

        let response = server.handle(request).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_bytes(response).await, b"got:{\"operation\":\"download\"}");
    }

    #[tokio::test]
    async fn test_empty_body_is_not_forwarded() {
        let (upstream, _hits) = spawn_upstream().await;
        let dir = tempfile::tempdir().unwrap();
        let server = CacheServer::new(upstream, dir.path()).unwrap();

        let request = Request::builder()
            .method(Method::POST)
            .uri("/echo")
            .body(Body::empty())
            .unwrap();

        let response = server.handle(request).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_bytes(response).await, b"got:");
    }

    #[tokio::test]
    async fn test_unreachable_upstream_is_bad_gateway() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let dir = tempfile::tempdir().unwrap();
        let upstream = Url::parse(&format!("http://{}", addr)).unwrap();
        let server = CacheServer::new(upstream, dir.path()).unwrap();

        let response = server.handle(get_request("/objects/batch")).await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }
}
