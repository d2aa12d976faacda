//! # podnet-rpc
//!
//! Request/response RPC protocol for pod control, spoken over one duplex
//! byte stream per pod.
//!
//! ## Design Principles
//!
//! - One request, one response, strictly in turn — no pipelining on a stream
//! - Requests carry a method tag plus an opaque parameter payload, decoded
//!   only after the tag is known
//! - Every response carries application success/failure in-band; transport
//!   success never implies the call succeeded
//! - `attach` is a one-way state transition: after the ack the stream is a
//!   raw byte pipe and the RPC binding is gone. Stream ownership is modeled
//!   as a tagged state, so calling RPC on a detached stream is an ordinary
//!   error, not a nil dereference
//!
//! ## Wire Format
//!
//! Newline-delimited JSON: each request and each response is a single JSON
//! value terminated by `\n`.

mod client;
mod error;
mod proto;
mod server;

pub use client::{RawStream, RpcClient};
pub use error::RpcError;
pub use proto::{
    CreateParams, IdParams, IdTimeoutParams, PodInspect, PodState, Request, Response,
};
pub use server::{Bridge, PodHandler, RawReader, RawWriter, RpcServer};
