use thiserror::Error;

#[derive(Error, Debug)]
pub enum GateError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to register file watch: {0}")]
    WatchRegistration(String),

    #[error("Approval UI unavailable: {0}")]
    UiUnavailable(String),

    #[error("Failed to launch privileged process: {0}")]
    Launch(String),
}

pub type Result<T> = std::result::Result<T, GateError>;

impl From<config::ConfigError> for GateError {
    fn from(err: config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}
