//! HTTP and HTTPS listeners.
//!
//! This module starts the listeners the configuration enables:
//! - **HTTP**: serves the cache engine, or redirects to HTTPS when HTTPS is on
//! - **HTTPS**: terminates TLS with a PEM certificate and key and serves the
//!   cache engine
//!
//! Both run concurrently under one supervisor; a failure in either ends it.

mod redirect;
mod server;

pub use redirect::RedirectHandler;
pub use server::{
    listener_router, plan_listeners, run, ListenerPlan, ListenerService, ServerError, Transport,
};
