//! podnet hostd
//!
//! Host-side daemon for the pod fleet. Binds a QUIC endpoint, accepts
//! control-plane connections, and serves the pod RPC protocol against
//! the local execution runtime.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use anyhow::Result;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use podnet_hostd::{Acceptor, Config, MockRuntime};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone())),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting podnet hostd");
    info!(
        port = config.port,
        default_timeout_secs = config.default_timeout.as_secs(),
        "Configuration loaded"
    );

    // The mock runtime stands in until a container-backed handler is wired.
    let runtime = Arc::new(MockRuntime::new());

    let bind = SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.port));
    let acceptor = Acceptor::bind(bind, runtime, config.default_timeout)?;

    acceptor.run().await;
    Ok(())
}
