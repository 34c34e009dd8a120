//! Registry bearer tokens and the store that shares them between requests.

use std::fmt;

use axum::http::HeaderValue;
use axum::http::header::InvalidHeaderValue;
use weakcache::WeakCache;
use zeroize::Zeroize;

/// A bearer token issued by a registry token endpoint.
///
/// The value is hidden from `Debug` and wiped from memory on drop.
#[derive(Clone, PartialEq, Eq)]
pub struct Token(String);

impl Token {
    /// Wrap a token value.
    pub fn new(value: impl Into<String>) -> Self {
        Token(value.into())
    }

    /// Expose the underlying token.
    pub fn revealed(&self) -> &str {
        &self.0
    }

    /// `Bearer <token>` as a sensitive header value.
    pub fn bearer(&self) -> Result<HeaderValue, InvalidHeaderValue> {
        let mut header = HeaderValue::try_from(format!("Bearer {}", self.0))?;
        header.set_sensitive(true);
        Ok(header)
    }
}

impl Drop for Token {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Token(****)")
    }
}

impl From<String> for Token {
    fn from(value: String) -> Self {
        Token(value)
    }
}

/// Tokens shared across requests, keyed by image name.
///
/// A miss is always acceptable: callers re-challenge the registry.
pub trait TokenStore: fmt::Debug + Send + Sync {
    /// The cached token for `image`, if any.
    fn get(&self, image: &str) -> Option<Token>;

    /// Cache a token for `image`, replacing any previous one.
    fn put(&self, image: &str, token: Token);
}

impl TokenStore for WeakCache<Token> {
    fn get(&self, image: &str) -> Option<Token> {
        WeakCache::get(self, image)
    }

    fn put(&self, image: &str, token: Token) {
        WeakCache::put(self, image, token)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn token_hidden_debug() {
        let token = Token::new("hunter2");
        assert_eq!(format!("{token:?}"), "Token(****)");
        assert_eq!(token.revealed(), "hunter2");
    }

    #[test]
    fn bearer_header_is_sensitive() {
        let header = Token::new("abc").bearer().unwrap();
        assert_eq!(header, "Bearer abc");
        assert!(header.is_sensitive());
    }

    #[test]
    fn bearer_rejects_control_characters() {
        assert!(Token::new("abc\ndef").bearer().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn cache_round_trip() {
        let cache: WeakCache<Token> = WeakCache::new(Duration::from_secs(60), 10);
        let store: &dyn TokenStore = &cache;

        assert_eq!(store.get("library/ubuntu"), None);
        store.put("library/ubuntu", Token::new("tok"));
        assert_eq!(store.get("library/ubuntu"), Some(Token::new("tok")));

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(store.get("library/ubuntu"), None);
    }
}
