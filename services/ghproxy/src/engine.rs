//! The authenticated registry proxy.
//!
//! A request is sent upstream with any cached token for its image. An auth failure
//! triggers one challenge and one retry, a `302`/`307` is followed once, and the
//! result is either streamed to the client or, when too large, offloaded with a
//! `301` to the upstream URL.

use std::sync::Arc;

use axum::body::Body;
use axum::http::header::{AUTHORIZATION, CONTENT_LENGTH, HOST, LOCATION, USER_AGENT};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use http_body_util::BodyExt as _;
use upstream_client::uri::UriExtension as _;
use upstream_client::{UpstreamClient, copy_headers};

use crate::challenge::challenge;
use crate::error::{ProxyError, ProxyResult};
use crate::target::{Destination, ImageName};
use crate::throttle::{Bandwidth, Throttled};
use crate::token::TokenStore;

/// Default response size ceiling, in megabytes.
pub const DEFAULT_SIZE_LIMIT_MB: u64 = 125;

/// The discovery endpoint. It is never retried.
const DISCOVERY_PATH: &str = "/v2/";

/// Settings for the registry proxy.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Whether registry proxying is allowed at all.
    pub enabled: bool,

    /// Default target: `ghcr`, `dockerhub`, a literal host, or empty.
    pub target: String,

    /// Responses with a larger `Content-Length` are offloaded, in bytes.
    pub size_limit: u64,

    /// Bandwidth limit for streamed bodies.
    pub bandwidth: Option<Bandwidth>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            target: String::new(),
            size_limit: DEFAULT_SIZE_LIMIT_MB * 1024 * 1024,
            bandwidth: None,
        }
    }
}

/// A client request, ready to forward.
#[derive(Debug, Clone)]
pub struct ForwardRequest {
    /// Method sent by the client.
    pub method: Method,
    /// Where the request goes upstream.
    pub destination: Destination,
    /// Headers sent by the client.
    pub headers: HeaderMap,
    /// The buffered request body, resent as-is on retry.
    pub body: Bytes,
    /// Image identity, when the path names one.
    pub image: Option<ImageName>,
}

/// The result of forwarding a request.
#[derive(Debug)]
pub enum ProxyOutcome {
    /// Relay the upstream response. The body is owned by the caller from here on.
    Stream {
        /// Upstream status
        status: StatusCode,
        /// Upstream headers, without hop-by-hop headers
        headers: HeaderMap,
        /// Upstream body, throttled when a bandwidth limit is set
        body: Body,
    },

    /// The response was too large to proxy: send the client to the upstream URL.
    /// The upstream body has already been closed.
    Redirect {
        /// The final upstream URL
        location: Uri,
    },
}

impl IntoResponse for ProxyOutcome {
    fn into_response(self) -> Response {
        match self {
            ProxyOutcome::Stream {
                status,
                headers,
                body,
            } => {
                let mut response = Response::new(body);
                *response.status_mut() = status;
                *response.headers_mut() = headers;
                response
            }
            ProxyOutcome::Redirect { location } => (
                StatusCode::MOVED_PERMANENTLY,
                [(LOCATION, location.to_string())],
            )
                .into_response(),
        }
    }
}

/// Forwards registry requests, handling token challenges on the client's behalf.
#[derive(Debug, Clone)]
pub struct RegistryProxy {
    client: UpstreamClient,
    tokens: Arc<dyn TokenStore>,
    settings: Arc<EngineSettings>,
}

impl RegistryProxy {
    /// Create a proxy sending through `client` and caching tokens in `tokens`.
    pub fn new(
        client: UpstreamClient,
        tokens: impl TokenStore + 'static,
        settings: EngineSettings,
    ) -> Self {
        Self {
            client,
            tokens: Arc::new(tokens),
            settings: Arc::new(settings),
        }
    }

    /// Current settings.
    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Refuse everything when registry proxying is disabled.
    pub fn gate(&self) -> ProxyResult<()> {
        if self.settings.enabled {
            Ok(())
        } else {
            Err(ProxyError::Forbidden("Docker is not Allowed".into()))
        }
    }

    /// Forward a request upstream and decide how to answer the client.
    ///
    /// Only [`ProxyOutcome::Stream`] carries an upstream body out of this function.
    /// Every other path drops the upstream response it opened.
    #[tracing::instrument(
        skip_all,
        fields(method = %request.method, upstream = %request.destination.uri)
    )]
    pub async fn forward(&self, request: ForwardRequest) -> ProxyResult<ProxyOutcome> {
        self.gate()?;

        let cached = request
            .image
            .as_ref()
            .and_then(|image| self.tokens.get(image.as_str()))
            .and_then(|token| token.bearer().ok());

        let mut response = self.send(&request, cached).await?;

        if needs_challenge(&request, response.status()) {
            let Some(image) = request.image.as_ref() else {
                return Err(ProxyError::Status {
                    status: response.status(),
                    message: "Unauthorized".into(),
                });
            };

            tracing::debug!(
                status = %response.status(),
                %image,
                "upstream refused, challenging"
            );
            let host = &request.destination.host;
            if let Some(authorization) = self.refresh_token(host, image).await {
                drop(response);
                response = self.send(&request, Some(authorization)).await?;
                tracing::debug!(status = %response.status(), "retried with fresh token");
            }
        }

        if matches!(
            response.status(),
            StatusCode::FOUND | StatusCode::TEMPORARY_REDIRECT
        ) {
            response = self.follow_redirect(response, &request.headers).await?;
        }

        if response.status() == StatusCode::NOT_FOUND {
            match response.text().await {
                Ok(body) => tracing::warn!(%body, "upstream 404 response body"),
                Err(error) => tracing::warn!(%error, "failed to read upstream 404 response body"),
            }
            return Err(ProxyError::NotFound("Page Not Found (From Upstream)".into()));
        }

        if let Some(size) = content_length(response.headers()) {
            if size > self.settings.size_limit {
                let location = response.uri().clone();
                drop(response);
                tracing::warn!(
                    %location,
                    size,
                    limit = self.settings.size_limit,
                    "size limit exceeded, redirecting client"
                );
                return Ok(ProxyOutcome::Redirect { location });
            }
        }

        let (_, parts, body) = response.into_parts();
        let mut headers = HeaderMap::with_capacity(parts.headers.len());
        copy_headers(&parts.headers, &mut headers);

        let stream = body.into_data_stream();
        let body = match self.settings.bandwidth {
            Some(bandwidth) => Body::from_stream(Throttled::new(stream, bandwidth)),
            None => Body::from_stream(stream),
        };

        Ok(ProxyOutcome::Stream {
            status: parts.status,
            headers,
            body,
        })
    }

    async fn send(
        &self,
        request: &ForwardRequest,
        authorization: Option<HeaderValue>,
    ) -> ProxyResult<upstream_client::Response> {
        let mut builder = self
            .client
            .request(request.method.clone(), request.destination.uri.clone())
            .headers(&request.headers)
            .header(HOST, request.destination.host.as_str());

        if let Some(authorization) = authorization {
            builder = builder.header(AUTHORIZATION, authorization);
        }

        builder
            .body(request.body.clone())
            .send()
            .await
            .map_err(ProxyError::upstream("sending upstream request"))
    }

    /// Challenge the registry for a new token and cache it.
    ///
    /// Returns the `Authorization` value to retry with, or `None` when no token
    /// could be obtained.
    async fn refresh_token(&self, host: &str, image: &ImageName) -> Option<HeaderValue> {
        let token = match challenge(&self.client, host, image).await {
            Ok(token) => token,
            Err(error) => {
                tracing::warn!(%error, %host, %image, "failed to obtain auth token, cannot retry");
                return None;
            }
        };

        let authorization = match token.bearer() {
            Ok(value) => value,
            Err(error) => {
                tracing::warn!(%error, %host, %image, "registry issued an unusable token");
                return None;
            }
        };

        self.tokens.put(image.as_str(), token);
        Some(authorization)
    }

    /// Follow a single redirect with a plain `GET`.
    async fn follow_redirect(
        &self,
        response: upstream_client::Response,
        client_headers: &HeaderMap,
    ) -> ProxyResult<upstream_client::Response> {
        let location = response.headers().get(LOCATION).ok_or_else(|| {
            ProxyError::Protocol("Redirect response missing Location header".into())
        })?;

        let invalid = |err: &dyn std::fmt::Display| {
            ProxyError::BadRequest(format!("Failed to parse redirect location: {err}"))
        };
        let location = location
            .to_str()
            .map_err(|err| invalid(&err))
            .and_then(|location| response.uri().resolve(location).map_err(|err| invalid(&err)))?;
        drop(response);

        tracing::debug!(%location, "following upstream redirect");
        let mut builder = self.client.get(location);
        if let Some(agent) = client_headers.get(USER_AGENT) {
            builder = builder.header(USER_AGENT, agent.clone());
        }

        builder
            .send()
            .await
            .map_err(ProxyError::upstream("following upstream redirect"))
    }
}

fn needs_challenge(request: &ForwardRequest, status: StatusCode) -> bool {
    matches!(status, StatusCode::UNAUTHORIZED | StatusCode::NOT_FOUND)
        && request.destination.uri.path() != DISCOVERY_PATH
}

/// The declared body size, if present and well formed.
fn content_length(headers: &HeaderMap) -> Option<u64> {
    let value = headers.get(CONTENT_LENGTH)?;
    match value.to_str().ok().and_then(|value| value.trim().parse().ok()) {
        Some(size) => Some(size),
        None => {
            tracing::warn!(value = ?value, "Content-Length header is not a valid integer");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(RegistryProxy: Send, Sync, Clone);
    assert_impl_all!(ProxyOutcome: Send);

    #[test]
    fn content_length_parsing() {
        let mut headers = HeaderMap::new();
        assert_eq!(content_length(&headers), None);

        headers.insert(CONTENT_LENGTH, HeaderValue::from_static("1024"));
        assert_eq!(content_length(&headers), Some(1024));

        headers.insert(CONTENT_LENGTH, HeaderValue::from_static("lots"));
        assert_eq!(content_length(&headers), None);

        headers.insert(CONTENT_LENGTH, HeaderValue::from_static("-1"));
        assert_eq!(content_length(&headers), None);
    }

    #[test]
    fn default_settings() {
        let settings = EngineSettings::default();
        assert!(!settings.enabled);
        assert_eq!(settings.size_limit, 125 * 1024 * 1024);
        assert_eq!(settings.bandwidth, None);
    }

    #[test]
    fn redirect_outcome_is_permanent() {
        let response = ProxyOutcome::Redirect {
            location: "https://cdn.test/blob".parse().unwrap(),
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::MOVED_PERMANENTLY);
        assert_eq!(response.headers()[LOCATION], "https://cdn.test/blob");
    }
}
