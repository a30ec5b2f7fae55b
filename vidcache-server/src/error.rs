use thiserror::Error;
use vidcache_engine::EngineError;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Settings error: {0}")]
    Settings(String),

    #[error("Initialization failed: {0}")]
    Initialization(String),
}
