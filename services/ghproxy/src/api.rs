//! Router for the registry proxy

use axum::Router;
use axum::extract::{Path, Request, State};
use axum::routing::{any, get};
use tower_http::trace::TraceLayer;
use upstream_client::{ClientSettings, UpstreamClient};
use weakcache::WeakCache;

use crate::engine::{EngineSettings, ForwardRequest, ProxyOutcome, RegistryProxy};
use crate::error::{ProxyError, ProxyResult};
use crate::target::{Destination, RegistryPath};
use crate::token::Token;

/// Largest client request body buffered for forwarding.
const MAX_REQUEST_BODY: usize = 16 * 1024 * 1024;

/// Builder for the proxy router
#[derive(Debug, Default)]
pub struct ProxyBuilder {
    settings: EngineSettings,
    client: Option<UpstreamClient>,
    tokens: Option<WeakCache<Token>>,
}

impl ProxyBuilder {
    /// Start a builder with the given engine settings
    pub fn new(settings: EngineSettings) -> Self {
        Self {
            settings,
            client: None,
            tokens: None,
        }
    }

    /// Set the client used for upstream requests
    pub fn client(mut self, client: UpstreamClient) -> Self {
        self.client = Some(client);
        self
    }

    /// Share a token cache with the router
    pub fn tokens(mut self, tokens: WeakCache<Token>) -> Self {
        self.tokens = Some(tokens);
        self
    }

    /// Build the proxy engine without a router
    pub fn proxy(self) -> RegistryProxy {
        let client = self
            .client
            .unwrap_or_else(|| UpstreamClient::new(&ClientSettings::default()));
        let tokens = self.tokens.unwrap_or_default();
        RegistryProxy::new(client, tokens, self.settings)
    }

    /// Build the router
    ///
    /// `/v2/` is the discovery endpoint, everything below it is an image path.
    pub fn build(self) -> Router {
        Router::new()
            .route("/v2/", get(discovery))
            .route("/v2/{*rest}", any(image))
            .with_state(self.proxy())
            .layer(TraceLayer::new_for_http())
    }
}

async fn discovery(
    State(proxy): State<RegistryProxy>,
    request: Request,
) -> ProxyResult<ProxyOutcome> {
    forward(&proxy, "", request).await
}

async fn image(
    State(proxy): State<RegistryProxy>,
    Path(rest): Path<String>,
    request: Request,
) -> ProxyResult<ProxyOutcome> {
    forward(&proxy, &rest, request).await
}

async fn forward(proxy: &RegistryProxy, rest: &str, request: Request) -> ProxyResult<ProxyOutcome> {
    proxy.gate()?;

    let path = RegistryPath::parse(rest)?;
    let destination = Destination::resolve(&path, &proxy.settings().target, request.uri())?;

    let (parts, body) = request.into_parts();
    let body = axum::body::to_bytes(body, MAX_REQUEST_BODY)
        .await
        .map_err(|err| ProxyError::BadRequest(format!("Failed to read request body: {err}")))?;

    proxy
        .forward(ForwardRequest {
            method: parts.method,
            destination,
            headers: parts.headers,
            body,
            image: path.image,
        })
        .await
}
