//! QUIC acceptor: connections in, RPC servers out.
//!
//! Every accepted connection gets its own task; every accepted stream gets
//! its own task running an RPC server loop until the stream closes or an
//! attach hands it off. A slow attach session never blocks other pods or
//! other control planes.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use podnet_quic::QuicError;
use podnet_rpc::{PodHandler, RpcError, RpcServer};
use quinn::{Connection, ConnectionError, Endpoint, VarInt};
use tracing::{debug, info, warn};

/// Accepts incoming transport connections on behalf of one host.
pub struct Acceptor {
    endpoint: Endpoint,
    handler: Arc<dyn PodHandler>,
    default_timeout: Duration,
}

impl Acceptor {
    /// Bind the server endpoint on the given address.
    pub fn bind(
        bind: SocketAddr,
        handler: Arc<dyn PodHandler>,
        default_timeout: Duration,
    ) -> Result<Self, QuicError> {
        let endpoint = podnet_quic::server_endpoint(bind)?;
        Ok(Self {
            endpoint,
            handler,
            default_timeout,
        })
    }

    /// The bound address, useful when the port was chosen by the OS.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.endpoint.local_addr()
    }

    /// Accept connections until the endpoint is closed.
    pub async fn run(&self) {
        info!(addr = ?self.endpoint.local_addr(), "hostd accepting connections");

        while let Some(incoming) = self.endpoint.accept().await {
            let handler = Arc::clone(&self.handler);
            let default_timeout = self.default_timeout;

            tokio::spawn(async move {
                match incoming.await {
                    Ok(conn) => handle_connection(conn, handler, default_timeout).await,
                    Err(e) => debug!(error = %e, "handshake failed"),
                }
            });
        }
    }

    /// Close the endpoint, resetting all connections.
    pub async fn close(&self) {
        self.endpoint.close(VarInt::from_u32(0), b"shutdown");
        self.endpoint.wait_idle().await;
    }
}

async fn handle_connection(
    conn: Connection,
    handler: Arc<dyn PodHandler>,
    default_timeout: Duration,
) {
    info!(remote = %conn.remote_address(), "accepted connection");

    loop {
        match conn.accept_bi().await {
            Ok((send, recv)) => {
                let handler = Arc::clone(&handler);
                tokio::spawn(async move {
                    let server = RpcServer::new(recv, send, handler, default_timeout);
                    match server.serve().await {
                        // Ok means the stream was handed to an attach bridge.
                        Ok(()) => debug!("stream detached to attach bridge"),
                        Err(RpcError::Eof) => debug!("stream closed"),
                        Err(e) => warn!(error = %e, "stream error"),
                    }
                });
            }
            Err(ConnectionError::ApplicationClosed(_)) | Err(ConnectionError::LocallyClosed) => {
                debug!(remote = %conn.remote_address(), "connection closed");
                return;
            }
            Err(e) => {
                debug!(remote = %conn.remote_address(), error = %e, "connection lost");
                return;
            }
        }
    }
}
