use thiserror::Error;

use crate::config::ConfigError;

/// Errors that stop the service from starting or running.
///
/// Per-fetch failures never surface here; they are reported through
/// [`FetchState`](crate::sync::FetchState) and the notifier.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("cannot build HTTP client: {0}")]
    HttpClient(#[from] reqwest::Error),

    #[error("server error: {0}")]
    Server(#[from] warp::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

pub type EngineResult<T> = Result<T, EngineError>;
