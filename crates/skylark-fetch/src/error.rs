use thiserror::Error;

/// Errors that can be returned by skylark-fetch operations.
#[derive(Debug, Error)]
pub enum FetchError {
    /// An HTTP request failed (network error, body read error, etc.).
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The server answered with a non-success status.
    #[error("{url} answered {status}")]
    Status {
        url: String,
        status: reqwest::StatusCode,
    },

    /// Failed to deserialize a JSON API response.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The remote application reported a failure in its response envelope.
    #[error("remote host reported an error: {message}")]
    Remote { message: String },

    /// The URL could not be parsed or has no usable host.
    #[error("invalid URL {url:?}: {message}")]
    InvalidUrl { url: String, message: String },
}
