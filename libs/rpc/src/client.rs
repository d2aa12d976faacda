//! RPC client bound to a single duplex stream.

use std::collections::HashMap;
use std::mem;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};

use crate::error::RpcError;
use crate::proto::{
    read_value, write_value, CreateParams, EmptyBody, IdBody, IdParams, IdTimeoutParams,
    InspectBody, PodInspect, Request, Response,
};

/// Raw byte pipe handed to the caller once an attach completes.
///
/// The reader half keeps its buffer: any bytes the peer sent right behind
/// the attach ack are still in there and must not be lost.
#[derive(Debug)]
pub struct RawStream<R, W> {
    pub reader: BufReader<R>,
    pub writer: W,
}

/// Ownership state of the client's stream.
///
/// The transition to `Detached` is one-way: it happens when `attach`
/// succeeds and the stream becomes a raw byte pipe owned by the attach
/// session. Every RPC method on a detached client fails with
/// [`RpcError::StreamDetached`].
enum StreamState<R, W> {
    Bound { reader: BufReader<R>, writer: W },
    Detached,
}

/// Client side of the pod RPC protocol.
///
/// Calls are strictly synchronous: one request is written, then exactly one
/// response is read before the next call may begin.
pub struct RpcClient<R, W> {
    state: StreamState<R, W>,
}

impl<R, W> RpcClient<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    /// Bind a client to the two halves of a duplex stream.
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            state: StreamState::Bound {
                reader: BufReader::new(reader),
                writer,
            },
        }
    }

    /// A client with no stream at all.
    ///
    /// Used for pods registered while their host is unreachable; every call
    /// fails with the detached sentinel until the host connection rebinds
    /// the pod to a live stream.
    pub fn detached() -> Self {
        Self {
            state: StreamState::Detached,
        }
    }

    /// Whether this client still owns a usable stream.
    pub fn is_detached(&self) -> bool {
        matches!(self.state, StreamState::Detached)
    }

    /// Create a pod and return its id.
    pub async fn create(
        &mut self,
        name: &str,
        image: &str,
        cmd: &[String],
        env: &HashMap<String, String>,
    ) -> Result<String, RpcError> {
        let params = CreateParams {
            name: name.to_string(),
            image: image.to_string(),
            cmd: cmd.to_vec(),
            env: env.clone(),
        };
        let body: IdBody = self.call("create", &params).await?;
        Ok(body.id)
    }

    /// Start a pod. `None` means the server's default timeout.
    pub async fn start(&mut self, id: &str, timeout: Option<Duration>) -> Result<(), RpcError> {
        self.call_id_timeout("start", id, timeout).await
    }

    /// Stop a pod gracefully.
    pub async fn stop(&mut self, id: &str, timeout: Option<Duration>) -> Result<(), RpcError> {
        self.call_id_timeout("stop", id, timeout).await
    }

    /// Kill a pod.
    pub async fn kill(&mut self, id: &str, timeout: Option<Duration>) -> Result<(), RpcError> {
        self.call_id_timeout("kill", id, timeout).await
    }

    /// Delete a pod.
    pub async fn delete(&mut self, id: &str) -> Result<(), RpcError> {
        let _: EmptyBody = self.call("delete", &IdParams { id: id.to_string() }).await?;
        Ok(())
    }

    /// Fetch an inspect snapshot for a pod.
    pub async fn inspect(&mut self, id: &str) -> Result<PodInspect, RpcError> {
        let body: InspectBody = self
            .call("inspect", &IdParams { id: id.to_string() })
            .await?;
        body.pod.ok_or(RpcError::MissingBody)
    }

    /// Switch the stream to raw attach mode.
    ///
    /// On success the stream halves are returned to the caller as a raw
    /// byte pipe and this client becomes permanently detached.
    pub async fn attach(&mut self, id: &str) -> Result<RawStream<R, W>, RpcError> {
        let _: EmptyBody = self.call("attach", &IdParams { id: id.to_string() }).await?;

        match mem::replace(&mut self.state, StreamState::Detached) {
            StreamState::Bound { reader, writer } => Ok(RawStream { reader, writer }),
            StreamState::Detached => Err(RpcError::StreamDetached),
        }
    }

    async fn call_id_timeout(
        &mut self,
        method: &str,
        id: &str,
        timeout: Option<Duration>,
    ) -> Result<(), RpcError> {
        let params = IdTimeoutParams {
            id: id.to_string(),
            timeout_ms: timeout.map(|t| t.as_millis() as u64).unwrap_or(0),
        };
        let _: EmptyBody = self.call(method, &params).await?;
        Ok(())
    }

    async fn call<P, B>(&mut self, method: &str, params: &P) -> Result<B, RpcError>
    where
        P: Serialize,
        B: DeserializeOwned + Default,
    {
        let StreamState::Bound { reader, writer } = &mut self.state else {
            return Err(RpcError::StreamDetached);
        };

        write_value(writer, &Request::new(method, params)?).await?;

        let res: Response<B> = read_value(reader).await?;
        if !res.err.is_empty() {
            return Err(RpcError::Remote(res.err));
        }

        Ok(res.body)
    }
}
