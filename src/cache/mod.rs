//! Cache engine behind the listeners.
//!
//! Listeners only see the `RequestHandler` capability: something that takes a
//! request and produces a response. `CacheServer` is the engine shipped with
//! the binary; it proxies to the upstream LFS server and keeps verified copies
//! of LFS objects in an on-disk store.

mod server;
mod store;

use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::Request;
use axum::response::Response;

pub use server::{CacheServer, CacheStatus, EngineError};
pub use store::{ObjectStore, Oid, StoreError};

/// A request handler that listeners dispatch every request to.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, request: Request) -> Response;
}

/// Handler shared by all listeners of the process
pub type SharedHandler = Arc<dyn RequestHandler>;
