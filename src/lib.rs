//! lfscache - a caching reverse proxy for Git LFS servers
//!
//! Validates the command-line configuration, builds the cache engine and runs
//! the plain-HTTP and HTTPS listeners under a single supervisor.

pub mod cache;
pub mod config;
pub mod error;
pub mod http;
pub mod middleware;

pub use error::AppError;
