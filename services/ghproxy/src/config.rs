//! Server configuration, loaded from TOML.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;
use upstream_client::ClientSettings;

use crate::engine::{DEFAULT_SIZE_LIMIT_MB, EngineSettings};
use crate::matcher::ApiAccess;
use crate::throttle::Bandwidth;

/// What went wrong while reading a configuration file.
#[derive(Debug, thiserror::Error)]
pub enum ErrorKind {
    /// The file could not be read
    #[error("IO: {0}")]
    Io(#[from] io::Error),

    /// The file is not valid configuration TOML
    #[error("TOML: {0}")]
    Toml(#[from] toml_edit::de::Error),
}

/// A configuration file could not be loaded.
#[derive(Debug, thiserror::Error)]
#[error("Reading configuration from {path:?}")]
pub struct ConfigError {
    path: Utf8PathBuf,
    source: ErrorKind,
}

/// Top-level configuration. Every section is optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Listener and response limits
    pub server: ServerConfig,
    /// Registry proxy
    pub docker: DockerConfig,
    /// Client authentication
    pub auth: AuthConfig,
    /// Throttling
    pub rate_limit: RateLimitConfig,
    /// Outbound client
    pub upstream: UpstreamConfig,
    /// Logging
    pub log: LogConfig,
}

/// `[server]`
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind
    pub host: String,
    /// Port to bind
    pub port: u16,
    /// Response size ceiling, in megabytes.
    pub size_limit: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8080,
            size_limit: DEFAULT_SIZE_LIMIT_MB,
        }
    }
}

/// `[docker]`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DockerConfig {
    /// Whether registry requests are served at all.
    pub enabled: bool,
    /// `ghcr`, `dockerhub`, a registry host, or empty.
    pub target: String,
}

/// How clients authenticate to the proxy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMethod {
    /// Credentials in a request header
    Header,
    /// Credentials in query parameters
    #[default]
    Parameters,
}

/// `[auth]`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Whether clients must authenticate.
    pub enabled: bool,
    /// Where clients put their credentials.
    pub method: AuthMethod,
    /// Allow the GitHub API through even without header authentication.
    pub force_allow_api: bool,
}

/// `[rate_limit]`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Per-response bandwidth limit
    pub bandwidth_limit: BandwidthConfig,
}

/// `[rate_limit.bandwidth_limit]`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BandwidthConfig {
    /// Whether response bodies are throttled.
    pub enabled: bool,
    /// Bytes per second.
    pub rate: u64,
    /// Bytes released without waiting.
    pub burst: u64,
}

/// `[upstream]`
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Seconds to wait for response headers.
    pub timeout: u64,
    /// Seconds to wait for a connection.
    pub connect_timeout: u64,
    /// Overrides the default `User-Agent`.
    pub user_agent: Option<String>,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        let defaults = ClientSettings::default();
        Self {
            timeout: defaults.timeout.as_secs(),
            connect_timeout: defaults.connect_timeout.as_secs(),
            user_agent: None,
        }
    }
}

/// `[log]`
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Default filter directive, overridden by `RUST_LOG`.
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Utf8Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let error = |source: ErrorKind| ConfigError {
            path: path.to_path_buf(),
            source,
        };

        let text = std::fs::read_to_string(path).map_err(|err| error(err.into()))?;
        Self::from_toml(&text).map_err(|err| error(err.into()))
    }

    /// Parse configuration from TOML text.
    pub fn from_toml(text: &str) -> Result<Self, toml_edit::de::Error> {
        toml_edit::de::from_str(text)
    }

    /// Address to listen on.
    pub fn listen(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        format!("{}:{}", self.server.host, self.server.port).parse()
    }

    /// Whether `api.github.com` URLs may be proxied.
    pub fn api_access(&self) -> ApiAccess {
        let header_auth = self.auth.enabled && self.auth.method == AuthMethod::Header;
        if self.auth.force_allow_api || header_auth {
            ApiAccess::allowed()
        } else {
            ApiAccess::denied()
        }
    }

    /// Settings for the registry proxy engine.
    pub fn engine_settings(&self) -> EngineSettings {
        let bandwidth = &self.rate_limit.bandwidth_limit;
        EngineSettings {
            enabled: self.docker.enabled,
            target: self.docker.target.clone(),
            size_limit: self.server.size_limit.saturating_mul(1024 * 1024),
            bandwidth: bandwidth
                .enabled
                .then(|| Bandwidth::new(bandwidth.rate, bandwidth.burst))
                .flatten(),
        }
    }

    /// Settings for the upstream client.
    pub fn client_settings(&self) -> ClientSettings {
        let mut settings = ClientSettings {
            connect_timeout: Duration::from_secs(self.upstream.connect_timeout),
            timeout: Duration::from_secs(self.upstream.timeout),
            ..Default::default()
        };
        if let Some(agent) = &self.upstream.user_agent {
            settings.user_agent = agent.clone();
        }
        settings
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use super::*;
    use crate::matcher::Matcher;

    #[test]
    fn empty_config_uses_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.size_limit, 125);
        assert!(!config.docker.enabled);
        assert_eq!(config.log.level, "info");
        assert_eq!(config.api_access(), ApiAccess::denied());

        let settings = config.engine_settings();
        assert_eq!(settings.size_limit, 125 * 1024 * 1024);
        assert_eq!(settings.bandwidth, None);
    }

    #[test]
    fn full_config() {
        let config = Config::from_toml(
            r#"
            [server]
            host = "127.0.0.1"
            port = 5000
            size_limit = 10

            [docker]
            enabled = true
            target = "ghcr"

            [auth]
            enabled = true
            method = "header"

            [rate_limit.bandwidth_limit]
            enabled = true
            rate = 1048576
            burst = 65536

            [upstream]
            timeout = 5
            connect_timeout = 2
            user_agent = "mirror/1.0"

            [log]
            level = "debug"
            "#,
        )
        .unwrap();

        assert_eq!(
            config.listen().unwrap(),
            "127.0.0.1:5000".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(config.api_access(), ApiAccess::allowed());

        let settings = config.engine_settings();
        assert!(settings.enabled);
        assert_eq!(settings.target, "ghcr");
        assert_eq!(settings.size_limit, 10 * 1024 * 1024);
        assert_eq!(settings.bandwidth, Bandwidth::new(1048576, 65536));

        let client = config.client_settings();
        assert_eq!(client.timeout, Duration::from_secs(5));
        assert_eq!(client.connect_timeout, Duration::from_secs(2));
        assert_eq!(client.user_agent, "mirror/1.0");
    }

    #[test]
    fn api_access_rules() {
        let mut config = Config::default();
        config.auth.enabled = true;
        assert_eq!(config.api_access(), ApiAccess::denied());

        config.auth.method = AuthMethod::Header;
        assert_eq!(config.api_access(), ApiAccess::allowed());

        config.auth.enabled = false;
        assert_eq!(config.api_access(), ApiAccess::denied());

        config.auth.force_allow_api = true;
        let matcher = Matcher::new(config.api_access());
        assert!(matcher.classify("https://api.github.com/users/a").is_ok());
    }

    #[test]
    fn disabled_bandwidth_limit_is_ignored() {
        let mut config = Config::default();
        config.rate_limit.bandwidth_limit.rate = 100;
        assert_eq!(config.engine_settings().bandwidth, None);

        config.rate_limit.bandwidth_limit.enabled = true;
        assert_eq!(config.engine_settings().bandwidth, Bandwidth::new(100, 0));

        config.rate_limit.bandwidth_limit.rate = 0;
        assert_eq!(config.engine_settings().bandwidth, None);
    }

    #[test]
    fn unknown_auth_method_is_rejected() {
        assert!(Config::from_toml("[auth]\nmethod = \"cookie\"").is_err());
    }

    #[test]
    fn from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[docker]\nenabled = true\ntarget = \"dockerhub\"").unwrap();

        let path = Utf8Path::from_path(file.path()).unwrap();
        let config = Config::from_file(path).unwrap();
        assert!(config.docker.enabled);
        assert_eq!(config.docker.target, "dockerhub");
    }

    #[test]
    fn missing_file_reports_path() {
        let err = Config::from_file("/nonexistent/ghproxy.toml").unwrap_err();
        assert!(err.to_string().contains("/nonexistent/ghproxy.toml"));
        assert!(matches!(err.source, ErrorKind::Io(_)));
    }
}
