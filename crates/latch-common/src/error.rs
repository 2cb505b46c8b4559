//! Errors from the shared wire helpers.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Frame did not parse as JSON of the expected shape
    #[error("malformed frame: {0}")]
    Json(#[from] serde_json::Error),

    /// A field parsed but its contents are invalid
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl Error {
    pub fn protocol(msg: impl std::fmt::Display) -> Self {
        Self::Protocol(msg.to_string())
    }
}
