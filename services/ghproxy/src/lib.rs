//! # ghproxy
//!
//! A pull-through accelerator for GitHub content and container registries.
//!
//! ## Features
//!
//! - Classification of GitHub, raw, gist and API URLs
//! - Registry proxying for Docker Hub, GHCR, GCR, or any registry host
//! - Transparent Registry v2 bearer-token challenges, with tokens cached per image
//! - Large responses offloaded to the client with a `301`
//! - Optional bandwidth limiting
//!
//! ## Example
//!
//! ```no_run
//! use ghproxy::{EngineSettings, ProxyBuilder};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let settings = EngineSettings {
//!     enabled: true,
//!     target: "dockerhub".into(),
//!     ..Default::default()
//! };
//! let router = ProxyBuilder::new(settings).build();
//!
//! let listener = tokio::net::TcpListener::bind("127.0.0.1:8080").await?;
//! axum::serve(listener, router).await?;
//! # Ok(())
//! # }
//! ```

mod api;
pub mod challenge;
pub mod config;
mod engine;
mod error;
pub mod matcher;
pub mod target;
pub mod throttle;
pub mod token;

pub use api::ProxyBuilder;
pub use config::Config;
pub use engine::{EngineSettings, ForwardRequest, ProxyOutcome, RegistryProxy};
pub use error::{ProxyError, ProxyResult};
pub use matcher::{ActionKind, ApiAccess, Matcher, Route};
pub use target::{Destination, ImageName, RegistryPath};
pub use token::{Token, TokenStore};
