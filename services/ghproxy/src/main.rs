//! ghproxy server
//!
//! Run with: ghproxy --config ghproxy.toml

use std::net::SocketAddr;

use camino::Utf8PathBuf;
use clap::Parser;
use eyre::WrapErr as _;
use ghproxy::{Config, ProxyBuilder};
use tracing_subscriber::EnvFilter;
use upstream_client::UpstreamClient;
use weakcache::WeakCache;

#[derive(Debug, Parser)]
#[command(version, about = "GitHub and container registry accelerator")]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long)]
    config: Option<Utf8PathBuf>,

    /// Address to listen on, overriding the configuration
    #[arg(short, long)]
    listen: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log.level))
        .wrap_err("invalid log level")?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let addr = match args.listen {
        Some(addr) => addr,
        None => config.listen().wrap_err("invalid server host or port")?,
    };

    let settings = config.engine_settings();
    if !settings.enabled {
        tracing::warn!("registry proxying is disabled, every /v2/ request will be refused");
    }

    let app = ProxyBuilder::new(settings)
        .client(UpstreamClient::new(&config.client_settings()))
        .tokens(WeakCache::default())
        .build();

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .wrap_err_with(|| format!("binding {addr}"))?;

    tracing::info!("ghproxy listening on http://{}", addr);
    axum::serve(listener, app).await?;

    Ok(())
}
