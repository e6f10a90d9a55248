//! lfscache: a caching reverse proxy for Git LFS servers.
//!
//! This is the application entry point. It parses flags, prints the version
//! when asked, initializes tracing, validates the configuration, builds the
//! cache engine and runs the HTTP/HTTPS listeners until one of them fails.

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use lfscache::cache::{CacheServer, SharedHandler};
use lfscache::config::{
    LogFormat, RawConfig, ServerConfig, DEFAULT_CACHE_DIRECTORY, DEFAULT_HTTPS_ADDR,
    DEFAULT_HTTP_ADDR, DEFAULT_LOG_FILTER, VERSION_STRING,
};
use lfscache::{http, AppError};

/// lfscache: a caching reverse proxy for Git LFS servers
#[derive(Parser, Debug)]
#[command(name = "lfscache", version = VERSION_STRING, about)]
struct Args {
    /// HTTP listen address
    #[arg(long, default_value = DEFAULT_HTTP_ADDR)]
    http_addr: String,

    /// HTTPS listen address (only enabled if key/cert options are provided)
    #[arg(long, default_value = DEFAULT_HTTPS_ADDR)]
    https_addr: String,

    /// HTTPS TLS key filepath
    #[arg(long, default_value = "")]
    tls_key: String,

    /// HTTPS TLS certificate filepath
    #[arg(long, default_value = "")]
    tls_cert: String,

    /// LFS server URL
    #[arg(long, default_value = "")]
    url: String,

    /// Cache directory
    #[arg(long, default_value = DEFAULT_CACHE_DIRECTORY)]
    directory: String,

    /// Print version
    #[arg(short = 'v')]
    print_version: bool,

    /// Log level filter (e.g., "lfscache=debug,tower_http=info")
    #[arg(long)]
    log_level: Option<String>,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

impl Args {
    fn raw_config(&self) -> RawConfig {
        RawConfig {
            http_addr: self.http_addr.clone(),
            https_addr: self.https_addr.clone(),
            tls_key: self.tls_key.clone(),
            tls_cert: self.tls_cert.clone(),
            url: self.url.clone(),
            directory: self.directory.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    if args.print_version {
        println!("{}", VERSION_STRING);
        return ExitCode::SUCCESS;
    }

    // Initialize tracing with priority: CLI > env > default
    let log_filter = args
        .log_level
        .clone()
        .or_else(|| std::env::var("RUST_LOG").ok())
        .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string());
    init_tracing(&log_filter, args.log_format);

    match serve(&args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "Exiting");
            ExitCode::from(e.exit_code())
        }
    }
}

fn init_tracing(filter: &str, format: LogFormat) {
    let registry =
        tracing_subscriber::registry().with(tracing_subscriber::EnvFilter::new(filter));

    match format {
        LogFormat::Text => registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init(),
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .init(),
    }
}

async fn serve(args: &Args) -> Result<(), AppError> {
    let config = Arc::new(ServerConfig::validate(&args.raw_config())?);

    let engine: SharedHandler = Arc::new(CacheServer::new(
        config.upstream.clone(),
        &config.cache_directory,
    )?);
    tracing::info!(
        version = VERSION_STRING,
        upstream = %config.upstream,
        directory = %config.cache_directory.display(),
        https = config.https_enabled(),
        "Initialized cache engine"
    );

    http::run(config, engine).await?;
    Ok(())
}
