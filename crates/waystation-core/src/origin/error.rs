use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Origin unreachable: {0}")]
    Unreachable(String),

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Request aborted")]
    Aborted,

    #[error("Rate limited - gave up after retrying")]
    RateLimited,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl FetchError {
    /// True for errors caused by the network or by cancellation rather than
    /// by a malformed request.
    pub fn is_network_failure(&self) -> bool {
        !matches!(self, FetchError::InvalidRequest(_))
    }
}
