//! URI utilities.

use http::Uri;
use thiserror::Error;
use url::Url;

/// The provided URL cannot be a base URL,
/// and so cannot be used to resolve a relative reference.
#[derive(Debug, Error)]
#[error("cannot be a base URL: {0}")]
pub struct CannotBeABase(url::Url);

/// Errors that can occur when parsing a URI.
#[derive(Debug, Error)]
pub enum ParseUriError {
    /// An error occurred while parsing the URI.
    #[error(transparent)]
    Url(#[from] url::ParseError),

    /// The provided URL cannot be a base URL,
    #[error(transparent)]
    CannotBeABase(#[from] CannotBeABase),

    /// The URI is invalid, but URL parsing succeded.
    #[error("invalid URI: {0}")]
    Invalid(#[from] http::uri::InvalidUri),

    /// The URI could not be reassembled from its parts.
    #[error("invalid URI parts: {0}")]
    Parts(String),
}

/// Convert a value into a URI.
pub trait IntoUri {
    /// Convert the value into a URI.
    fn into_uri(self) -> Result<Uri, ParseUriError>;
}

impl IntoUri for Url {
    fn into_uri(self) -> Result<Uri, ParseUriError> {
        if self.cannot_be_a_base() {
            return Err(CannotBeABase(self).into());
        }

        Ok(self.as_str().parse()?)
    }
}

impl IntoUri for Uri {
    fn into_uri(self) -> Result<Uri, ParseUriError> {
        Ok(self)
    }
}

impl IntoUri for &str {
    fn into_uri(self) -> Result<Uri, ParseUriError> {
        let url: Url = self.parse()?;
        url.into_uri()
    }
}

impl IntoUri for String {
    fn into_uri(self) -> Result<Uri, ParseUriError> {
        self.as_str().into_uri()
    }
}

/// Extension trait for URIs.
pub trait UriExtension {
    /// Resolve a reference (such as a `Location` header) against this URI.
    ///
    /// Absolute references replace the base entirely, relative ones are joined
    /// following RFC 3986.
    fn resolve(&self, reference: &str) -> Result<Uri, ParseUriError>;

    /// Append an already-encoded query string, keeping any parameters which are
    /// already present.
    fn append_query(&self, encoded: &str) -> Result<Uri, ParseUriError>;
}

impl UriExtension for Uri {
    fn resolve(&self, reference: &str) -> Result<Uri, ParseUriError> {
        let base = Url::parse(&self.to_string())?;
        base.join(reference)?.into_uri()
    }

    fn append_query(&self, encoded: &str) -> Result<Uri, ParseUriError> {
        if encoded.is_empty() {
            return Ok(self.clone());
        }

        let path_and_query = match self.query() {
            Some(query) if !query.is_empty() => {
                format!("{}?{}&{}", self.path(), query, encoded)
            }
            _ => format!("{}?{}", self.path(), encoded),
        };

        let mut parts = self.clone().into_parts();
        parts.path_and_query = Some(path_and_query.parse()?);
        Uri::from_parts(parts).map_err(|err| ParseUriError::Parts(err.to_string()))
    }
}
