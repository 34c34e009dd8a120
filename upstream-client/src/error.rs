//! Error types for upstream requests
use thiserror::Error;

use crate::uri::ParseUriError;

pub(crate) type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// An error occured while building, sending, or reading an upstream request.
#[derive(Debug, Error)]
pub enum Error {
    /// The request could not be constructed
    #[error("building request: {0}")]
    Build(#[from] http::Error),

    /// An error occured while sending the request
    #[error("sending request: {0}")]
    Request(#[from] hyperdriver::client::Error),

    /// An error occured while recieving the response body
    #[error("reading response body: {0}")]
    Body(#[source] BoxError),

    /// The response body was not the expected JSON document
    #[error("decoding response body: {0}")]
    Json(#[from] serde_json::Error),

    /// A URL could not be parsed or resolved
    #[error(transparent)]
    Uri(#[from] ParseUriError),
}
