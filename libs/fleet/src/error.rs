//! Fleet-level error types.

use podnet_quic::QuicError;
use podnet_rpc::RpcError;
use thiserror::Error;

/// Errors surfaced by the fleet manager and host connections.
#[derive(Debug, Error)]
pub enum FleetError {
    /// The host address did not resolve. Fatal to host registration.
    #[error("failed to resolve address {addr}: {source}")]
    Resolve {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("host with id {0} already added")]
    DuplicateHost(String),

    #[error("no such host with id {0}")]
    NoSuchHost(String),

    #[error("pod with id {0} already added")]
    DuplicatePod(String),

    #[error("no such pod with id {0}")]
    NoSuchPod(String),

    /// The host's actor task is gone; the host was deregistered.
    #[error("host connection closed")]
    HostClosed,

    /// `connect` was asked to dial while a connection is already live.
    #[error("host already connected")]
    AlreadyConnected,

    /// Transport-level failure from the QUIC layer.
    #[error(transparent)]
    Quic(#[from] QuicError),

    /// Failure from a pod-level RPC exchange.
    #[error(transparent)]
    Rpc(#[from] RpcError),

    /// A reconnect re-established the connection but could not rebind every
    /// pod. The affected pods stay registered for the next attempt.
    #[error("rebind failed for {failed} of {total} pods: {details}")]
    PartialRebind {
        failed: usize,
        total: usize,
        details: String,
    },
}

impl FleetError {
    /// Whether the underlying cause is a dead or unusable connection.
    pub fn is_network(&self) -> bool {
        match self {
            FleetError::Rpc(e) => e.is_network(),
            FleetError::Quic(_) => true,
            _ => false,
        }
    }
}
