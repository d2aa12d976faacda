//! # podnet-hostd
//!
//! The daemon running on each execution host. It accepts QUIC connections
//! from the fleet manager and serves the pod RPC protocol: one RPC server
//! per accepted stream, all dispatching into a shared execution handler.
//!
//! The handler behind the RPC surface is pluggable; this crate ships an
//! in-memory mock runtime used in development and by the integration
//! tests. A production deployment wires a container-runtime-backed
//! handler in its place.

pub mod acceptor;
pub mod config;
pub mod runtime;

pub use acceptor::Acceptor;
pub use config::Config;
pub use runtime::MockRuntime;
