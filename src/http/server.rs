//! Listener supervision.
//!
//! Plans which listeners the configuration enables, runs each one as a task in
//! a single task group and joins on them. A plain-HTTP listener serves the
//! redirect handler while HTTPS is enabled and the cache engine otherwise; the
//! HTTPS listener always serves the cache engine.
//!
//! The first listener failure ends the join and the remaining listeners are
//! aborted with the task group. There is no partial-availability mode.

use std::fmt;
use std::io;
use std::sync::Arc;

use axum::extract::Request;
use axum::{middleware, Router};
use axum_server::tls_rustls::RustlsConfig;
use tokio::task::JoinSet;

use crate::cache::SharedHandler;
use crate::config::{ListenAddr, ServerConfig, TlsPaths};
use crate::middleware::request_id_layer;

use super::redirect::RedirectHandler;

/// Network access mode of a listener
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Http,
    Https,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Http => f.write_str("HTTP"),
            Transport::Https => f.write_str("HTTPS"),
        }
    }
}

/// What a listener hands its requests to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerService {
    /// Redirect to the HTTPS listener on this port
    Redirect { https_port: u16 },
    /// The cache engine
    Engine,
}

/// A listener the configuration enables
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerPlan {
    pub transport: Transport,
    pub addr: ListenAddr,
    pub service: ListenerService,
    /// Certificate and key, set for HTTPS listeners
    pub tls: Option<TlsPaths>,
}

/// Listener startup or runtime error
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("{transport} listener failed to bind {addr}: {source}")]
    Bind {
        transport: Transport,
        addr: ListenAddr,
        source: io::Error,
    },

    #[error("{transport} listener on {addr} failed to load TLS configuration: {source}")]
    TlsConfig {
        transport: Transport,
        addr: ListenAddr,
        source: io::Error,
    },

    #[error("{transport} listener on {addr} failed: {source}")]
    Serve {
        transport: Transport,
        addr: ListenAddr,
        source: io::Error,
    },

    #[error("listener task panicked: {0}")]
    TaskPanicked(#[from] tokio::task::JoinError),
}

/// Decide which listeners to run, plain HTTP first.
pub fn plan_listeners(config: &ServerConfig) -> Vec<ListenerPlan> {
    let mut plans = Vec::with_capacity(2);

    let https = match (&config.https_addr, &config.tls) {
        (Some(addr), Some(tls)) => Some((addr, tls)),
        _ => None,
    };

    if let Some(addr) = &config.http_addr {
        let service = match https {
            Some((https_addr, _)) => ListenerService::Redirect {
                https_port: https_addr.port,
            },
            None => ListenerService::Engine,
        };
        plans.push(ListenerPlan {
            transport: Transport::Http,
            addr: addr.clone(),
            service,
            tls: None,
        });
    }

    if let Some((addr, tls)) = https {
        plans.push(ListenerPlan {
            transport: Transport::Https,
            addr: addr.clone(),
            service: ListenerService::Engine,
            tls: Some(tls.clone()),
        });
    }

    plans
}

/// Build the router a planned listener serves.
pub fn listener_router(plan: &ListenerPlan, engine: SharedHandler) -> Router {
    let router = match plan.service {
        ListenerService::Redirect { https_port } => RedirectHandler::new(https_port).router(),
        ListenerService::Engine => Router::new().fallback(move |request: Request| {
            let engine = engine.clone();
            async move { engine.handle(request).await }
        }),
    };

    router.layer(middleware::from_fn_with_state(plan.transport, request_id_layer))
}

/// Run every enabled listener until all of them stop or one fails.
///
/// With no listeners enabled this returns immediately.
pub async fn run(config: Arc<ServerConfig>, engine: SharedHandler) -> Result<(), ServerError> {
    let plans = plan_listeners(&config);

    if plans.is_empty() {
        tracing::warn!("No listeners enabled, nothing to serve");
        return Ok(());
    }

    for plan in &plans {
        tracing::info!(
            event = "listening",
            proxy_endpoint = %config.upstream,
            transport = %plan.transport,
            addr = %plan.addr,
            redirect = matches!(plan.service, ListenerService::Redirect { .. }),
            "Starting listener"
        );
    }

    // More than one rustls provider is compiled in, so pick one for the process
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let mut listeners = JoinSet::new();
    for plan in plans {
        let app = listener_router(&plan, engine.clone());
        listeners.spawn(serve_listener(plan, app));
    }

    while let Some(result) = listeners.join_next().await {
        result??;
    }

    Ok(())
}

/// Bind one listener and serve until it fails.
async fn serve_listener(plan: ListenerPlan, app: Router) -> Result<(), ServerError> {
    let ListenerPlan {
        transport,
        addr,
        tls,
        ..
    } = plan;

    let tls_config = match &tls {
        Some(tls) => Some(
            RustlsConfig::from_pem_file(&tls.cert_path, &tls.key_path)
                .await
                .map_err(|source| ServerError::TlsConfig {
                    transport,
                    addr: addr.clone(),
                    source,
                })?,
        ),
        None => None,
    };

    let listener = bind(&addr).await.map_err(|source| ServerError::Bind {
        transport,
        addr: addr.clone(),
        source,
    })?;

    let local_addr = listener.local_addr().ok();
    tracing::debug!(%transport, ?local_addr, "Listener bound");

    let served = match tls_config {
        Some(tls_config) => {
            axum_server::from_tcp_rustls(listener, tls_config)
                .serve(app.into_make_service())
                .await
        }
        None => {
            axum_server::from_tcp(listener)
                .serve(app.into_make_service())
                .await
        }
    };

    served.map_err(|source| ServerError::Serve {
        transport,
        addr: addr.clone(),
        source,
    })?;

    tracing::debug!(%transport, %addr, "Listener stopped");
    Ok(())
}

async fn bind(addr: &ListenAddr) -> io::Result<std::net::TcpListener> {
    let mut last_error = None;
    for target in addr.bind_targets() {
        match tokio::net::TcpListener::bind(&target).await {
            Ok(listener) => return listener.into_std(),
            Err(e) => {
                tracing::debug!(%target, error = %e, "Bind attempt failed");
                last_error = Some(e);
            }
        }
    }
    Err(last_error
        .unwrap_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "no bind target")))
}
