//! Building upstream requests.

use bytes::Bytes;
use http::{header::HeaderValue, HeaderMap, HeaderName, Method, Uri};
use serde::Serialize;

use crate::error::Error;
use crate::response::Response;
use crate::uri::UriExtension as _;
use crate::UpstreamClient;

/// Headers which describe a single connection and must not be forwarded by a proxy.
pub const HOP_BY_HOP: [HeaderName; 7] = [
    http::header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    HeaderName::from_static("proxy-connection"),
    http::header::TRANSFER_ENCODING,
    http::header::UPGRADE,
    http::header::TE,
    http::header::TRAILER,
];

/// Copy every header from `src` into `dst`, except hop-by-hop headers.
///
/// Multi-valued headers keep all of their values.
pub fn copy_headers(src: &HeaderMap, dst: &mut HeaderMap) {
    for name in src.keys() {
        if HOP_BY_HOP.contains(name) {
            continue;
        }

        dst.remove(name);
        for value in src.get_all(name) {
            dst.append(name.clone(), value.clone());
        }
    }
}

/// Snapshot the request line and headers of a request.
pub(crate) trait RequestExt {
    fn parts(&self) -> http::request::Parts;
}

impl<B> RequestExt for http::Request<B> {
    fn parts(&self) -> http::request::Parts {
        let (mut parts, _) = http::Request::new(()).into_parts();
        parts.method = self.method().clone();
        parts.uri = self.uri().clone();
        parts.version = self.version();
        parts.headers = self.headers().clone();
        parts
    }
}

/// Builder for a single upstream request.
///
/// The body is held as [`Bytes`] so the same request can be rebuilt and sent again.
#[derive(Debug)]
pub struct RequestBuilder {
    client: UpstreamClient,
    method: Method,
    uri: Uri,
    query: Option<String>,
    headers: HeaderMap,
    body: Option<Bytes>,
    error: Option<Error>,
}

impl RequestBuilder {
    /// Start a request to `uri` sent through `client`.
    pub fn new(client: UpstreamClient, uri: Uri, method: Method) -> Self {
        Self {
            client,
            method,
            uri,
            query: None,
            headers: HeaderMap::new(),
            body: None,
            error: None,
        }
    }

    /// Set a header, replacing any existing values.
    pub fn header<K, V>(mut self, key: K, value: V) -> Self
    where
        HeaderName: TryFrom<K>,
        <HeaderName as TryFrom<K>>::Error: Into<http::Error>,
        HeaderValue: TryFrom<V>,
        <HeaderValue as TryFrom<V>>::Error: Into<http::Error>,
    {
        if self.error.is_some() {
            return self;
        }

        let name = match HeaderName::try_from(key) {
            Ok(name) => name,
            Err(error) => {
                self.error = Some(Error::Build(error.into()));
                return self;
            }
        };

        match HeaderValue::try_from(value) {
            Ok(value) => {
                self.headers.insert(name, value);
            }
            Err(error) => self.error = Some(Error::Build(error.into())),
        }
        self
    }

    /// Copy all headers from a map (hop-by-hop headers excluded), replacing any
    /// headers already set under the same names.
    pub fn headers(mut self, headers: &HeaderMap) -> Self {
        copy_headers(headers, &mut self.headers);
        self
    }

    /// Serialize `query` as `application/x-www-form-urlencoded` and append it to the URI.
    pub fn query<T: Serialize + ?Sized>(mut self, query: &T) -> Self {
        match serde_urlencoded::to_string(query) {
            Ok(encoded) => self.query = Some(encoded),
            Err(error) => self.error = Some(Error::Body(error.into())),
        }
        self
    }

    /// Set the request body.
    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Assemble the request without sending it.
    #[cfg(test)]
    pub(crate) fn build(self) -> Result<http::Request<hyperdriver::Body>, Error> {
        self.into_parts().1
    }

    fn into_parts(self) -> (UpstreamClient, Result<http::Request<hyperdriver::Body>, Error>) {
        let client = self.client;
        if let Some(error) = self.error {
            return (client, Err(error));
        }

        let uri = match self.query {
            Some(query) => match self.uri.append_query(&query) {
                Ok(uri) => uri,
                Err(error) => return (client, Err(error.into())),
            },
            None => self.uri,
        };

        let body = match self.body {
            Some(bytes) => hyperdriver::Body::from(bytes),
            None => hyperdriver::Body::empty(),
        };

        let mut req = match http::Request::builder()
            .method(self.method)
            .uri(uri)
            .body(body)
        {
            Ok(req) => req,
            Err(error) => return (client, Err(error.into())),
        };
        *req.headers_mut() = self.headers;

        (client, Ok(req))
    }

    /// Send the request. Errors deferred while building are reported here.
    pub async fn send(self) -> Result<Response, Error> {
        let (client, req) = self.into_parts();
        client.execute(req?).await
    }
}
