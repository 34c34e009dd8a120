//! Registry v2 bearer-token challenge.
//!
//! A registry answers an anonymous `GET /v2/` with `401` and a `WWW-Authenticate`
//! header naming a token realm. The realm hands out pull tokens for a scope such as
//! `repository:library/ubuntu:pull`.

use axum::http::header::{HOST, WWW_AUTHENTICATE};
use axum::http::{HeaderValue, StatusCode, Uri};
use http_auth::{ChallengeRef, parser::ChallengeParser};
use serde::{Deserialize, Serialize};
use upstream_client::UpstreamClient;
use upstream_client::uri::{IntoUri as _, ParseUriError};

use crate::target::ImageName;
use crate::token::Token;

/// Reasons a token could not be obtained.
#[derive(Debug, thiserror::Error)]
pub enum ChallengeError {
    /// The discovery or token request failed to send or read
    #[error(transparent)]
    Upstream(#[from] upstream_client::Error),

    /// The discovery endpoint did not send a `WWW-Authenticate` header
    #[error("registry did not send a WWW-Authenticate challenge")]
    MissingChallenge,

    /// The `WWW-Authenticate` header has no usable Bearer challenge
    #[error("malformed bearer challenge: {0}")]
    Malformed(String),

    /// The realm or registry host is not a valid URL
    #[error("invalid url: {0}")]
    Url(#[from] ParseUriError),

    /// The token endpoint refused to issue a token
    #[error("token endpoint returned {0}")]
    Status(StatusCode),

    /// The token endpoint answered without a token
    #[error("token response did not contain a token")]
    MissingToken,
}

/// A parsed `WWW-Authenticate: Bearer realm="..",service=".."` challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BearerChallenge {
    /// Token endpoint URL
    pub realm: String,
    /// Service name to request a token for
    pub service: Option<String>,
}

impl BearerChallenge {
    /// Find the first Bearer challenge in a header value.
    pub fn parse(value: &HeaderValue) -> Result<Self, ChallengeError> {
        let value = value
            .to_str()
            .map_err(|err| ChallengeError::Malformed(err.to_string()))?;

        ChallengeParser::new(value)
            .filter_map(Result::ok)
            .find_map(|challenge| BearerChallenge::try_from(&challenge).ok())
            .ok_or_else(|| ChallengeError::Malformed(format!("no bearer challenge in {value:?}")))
    }
}

impl TryFrom<&ChallengeRef<'_>> for BearerChallenge {
    type Error = ChallengeError;

    fn try_from(challenge: &ChallengeRef<'_>) -> Result<Self, Self::Error> {
        if !challenge.scheme.eq_ignore_ascii_case("Bearer") {
            return Err(ChallengeError::Malformed(format!(
                "unsupported scheme {:?}",
                challenge.scheme
            )));
        }

        let mut realm = None;
        let mut service = None;
        for (key, value) in &challenge.params {
            if key.eq_ignore_ascii_case("realm") {
                realm = Some(value.to_unescaped());
            } else if key.eq_ignore_ascii_case("service") {
                service = Some(value.to_unescaped());
            }
        }

        let realm = realm
            .filter(|realm| !realm.is_empty())
            .ok_or_else(|| ChallengeError::Malformed("missing realm".into()))?;

        Ok(BearerChallenge { realm, service })
    }
}

#[derive(Debug, Serialize)]
struct TokenQuery<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    service: Option<&'a str>,
    scope: &'a str,
}

/// Token endpoint response. Registries send `token`, `access_token`, or both.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
}

impl TokenResponse {
    fn into_token(self) -> Option<Token> {
        self.token
            .or(self.access_token)
            .filter(|token| !token.is_empty())
            .map(Token::from)
    }
}

/// Obtain a pull token for `image` from the registry at `host`.
///
/// Every response opened here is dropped before returning.
#[tracing::instrument(level = "debug", skip(client, image), fields(image = %image))]
pub async fn challenge(
    client: &UpstreamClient,
    host: &str,
    image: &ImageName,
) -> Result<Token, ChallengeError> {
    let discovery: Uri = format!("https://{host}/v2/").into_uri()?;

    let response = client
        .get(discovery)
        .header(HOST, host)
        .send()
        .await?;

    let header = response
        .headers()
        .get(WWW_AUTHENTICATE)
        .ok_or(ChallengeError::MissingChallenge)?;
    let bearer = BearerChallenge::parse(header)?;
    drop(response);

    let realm: Uri = bearer.realm.as_str().into_uri()?;
    let scope = image.scope();
    tracing::trace!(realm = %realm, service = ?bearer.service, %scope, "requesting token");

    let response = client
        .get(realm)
        .query(&TokenQuery {
            service: bearer.service.as_deref(),
            scope: &scope,
        })
        .send()
        .await?;

    if !response.status().is_success() {
        return Err(ChallengeError::Status(response.status()));
    }

    let body: TokenResponse = response.json().await?;
    body.into_token().ok_or(ChallengeError::MissingToken)
}
