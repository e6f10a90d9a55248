use crate::cache::EngineError;
use crate::config::ConfigError;
use crate::http::ServerError;

/// Exit status for invalid configuration
pub const EXIT_CONFIG: u8 = 1;

/// Exit status when the cache engine cannot start or a listener fails
pub const EXIT_FATAL: u8 = 2;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to initialize cache engine: {0}")]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Server(#[from] ServerError),
}

impl AppError {
    /// Process exit status for this error.
    pub fn exit_code(&self) -> u8 {
        match self {
            AppError::Config(_) => EXIT_CONFIG,
            AppError::Engine(_) | AppError::Server(_) => EXIT_FATAL,
        }
    }
}
