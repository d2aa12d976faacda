//! Error taxonomy for the pod RPC protocol.

use std::io;

use thiserror::Error;

/// Errors produced by RPC clients and servers.
///
/// The variants split into four families with different recovery semantics:
/// network errors (`Io` with a network-ish kind, `Eof`, `StreamDetached`)
/// are recoverable by reconnecting the host connection; protocol errors
/// (`Codec`, `UnknownMethod`, `MissingBody`) are fatal to the exchange but
/// leave the connection alone; `Remote` carries an application failure
/// reported in-band by the peer.
#[derive(Debug, Error)]
pub enum RpcError {
    /// The stream was handed off to an attach session and is no longer
    /// usable for RPC. This is the sentinel the host connection watches
    /// for to trigger reconnection.
    #[error("stream detached, no longer usable for rpc")]
    StreamDetached,

    /// The peer closed the stream before a full exchange completed.
    #[error("stream closed by peer")]
    Eof,

    /// I/O failure on the underlying stream.
    #[error("stream i/o error: {0}")]
    Io(#[from] io::Error),

    /// Malformed request or response payload.
    #[error("malformed rpc payload: {0}")]
    Codec(#[from] serde_json::Error),

    /// The peer asked for a method this server does not know.
    #[error("invalid method: {0}")]
    UnknownMethod(String),

    /// The response was well-formed but missing its method-specific body.
    #[error("response missing body")]
    MissingBody,

    /// Application-level failure reported by the remote handler, verbatim.
    #[error("{0}")]
    Remote(String),
}

impl RpcError {
    /// Whether this error signals a dead or unusable connection.
    ///
    /// Timeouts, end-of-stream, and the detached-stream sentinel all mean
    /// the stream is gone and the host connection should be re-established.
    /// Application and protocol errors never do.
    pub fn is_network(&self) -> bool {
        match self {
            RpcError::StreamDetached | RpcError::Eof => true,
            RpcError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::TimedOut
                    | io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::NotConnected
            ),
            _ => false,
        }
    }
}
