//! # podnet-fleet
//!
//! Client-side orchestration layer for a fleet of remote execution hosts.
//!
//! ## Design Principles
//!
//! - One [`HostConnection`] per registered host, holding a live QUIC
//!   connection and the pods bound to it
//! - Every connection-mutating operation runs inside the host's actor task,
//!   drained from a command mailbox in strict submission order — no shared
//!   mutation, no per-field locks
//! - Pod-scoped calls run outside the actor for concurrency; a network
//!   failure feeds back into the queued reconnect path, so recovery is
//!   still serialized with everything else touching the connection
//! - Recovery never retries the failed call itself: the caller sees the
//!   original error and retries at its own discretion
//!
//! ## Entry Point
//!
//! [`FleetManager`] owns the host map and resolves pod ids to their host
//! for dispatch.

mod error;
mod host;
mod manager;

pub use error::FleetError;
pub use host::{HostConnection, PodInstance, PodRawStream};
pub use manager::FleetManager;
