//! One remote execution host: its QUIC connection, its pods, and the actor
//! that serializes every mutation of either.
//!
//! The actor owns the endpoint, the connection, and structural changes to
//! the pod registry. Callers interact through [`HostConnection`], whose
//! methods submit a command to the actor's mailbox and block until the
//! actor replies — strict submission order, no shared mutation.
//!
//! Pod-scoped RPC calls deliberately bypass the mailbox: each
//! [`PodInstance`] serializes calls on its own stream with an async mutex,
//! and a network failure is fed back through the queued reconnect path.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use podnet_quic::QuicError;
use podnet_rpc::{PodInspect, RawStream, RpcClient, RpcError};
use quinn::{Connection, Endpoint, RecvStream, SendStream, VarInt};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};

use crate::error::FleetError;

/// Application close code for a connection torn down after a failure.
const CLOSE_FAILURE: u32 = 1001;
/// Application close code for a connection recycled by reconnect.
const CLOSE_RECONNECT: u32 = 1002;

/// Mailbox depth for the actor. Callers block on submission, so this only
/// smooths short bursts.
const MAILBOX_SIZE: usize = 32;

type PodRpcClient = RpcClient<RecvStream, SendStream>;

/// Raw duplex pipe to a pod, produced by a completed attach.
pub type PodRawStream = RawStream<RecvStream, SendStream>;

type PodMap = Arc<StdMutex<HashMap<String, Arc<PodInstance>>>>;

// =============================================================================
// Pod Instance
// =============================================================================

/// One remote pod bound to a stream on its host's connection.
///
/// The inner client is either live or detached; detached covers both "host
/// was unreachable at registration" and "stream handed to an attach
/// session". Either way the next call returns the detached sentinel, which
/// drives reconnection.
pub struct PodInstance {
    pod_id: String,
    client: Mutex<PodRpcClient>,
}

impl PodInstance {
    fn new(pod_id: String, client: PodRpcClient) -> Arc<Self> {
        Arc::new(Self {
            pod_id,
            client: Mutex::new(client),
        })
    }

    pub fn id(&self) -> &str {
        &self.pod_id
    }

    /// Whether the pod currently holds a live RPC stream.
    pub async fn is_bound(&self) -> bool {
        !self.client.lock().await.is_detached()
    }

    pub async fn start(&self, timeout: Option<Duration>) -> Result<(), RpcError> {
        self.client.lock().await.start(&self.pod_id, timeout).await
    }

    pub async fn stop(&self, timeout: Option<Duration>) -> Result<(), RpcError> {
        self.client.lock().await.stop(&self.pod_id, timeout).await
    }

    pub async fn kill(&self, timeout: Option<Duration>) -> Result<(), RpcError> {
        self.client.lock().await.kill(&self.pod_id, timeout).await
    }

    pub async fn delete(&self) -> Result<(), RpcError> {
        self.client.lock().await.delete(&self.pod_id).await
    }

    pub async fn inspect(&self) -> Result<PodInspect, RpcError> {
        self.client.lock().await.inspect(&self.pod_id).await
    }

    /// Switch this pod's stream to raw attach mode and hand it to the
    /// caller. The pod is left detached until the host rebinds it.
    pub async fn attach(&self) -> Result<PodRawStream, RpcError> {
        self.client.lock().await.attach(&self.pod_id).await
    }
}

// =============================================================================
// Commands
// =============================================================================

enum HostCommand {
    Connect {
        reply: oneshot::Sender<Result<(), FleetError>>,
    },
    Reconnect {
        reply: oneshot::Sender<Result<(), FleetError>>,
    },
    CreatePod {
        name: String,
        image: String,
        cmd: Vec<String>,
        env: HashMap<String, String>,
        reply: oneshot::Sender<Result<String, FleetError>>,
    },
    AddExistingPod {
        pod_id: String,
        connect: bool,
        reply: oneshot::Sender<Result<(), FleetError>>,
    },
    RebindPod {
        pod_id: String,
        reply: oneshot::Sender<Result<(), FleetError>>,
    },
    DeletePod {
        pod_id: String,
        timeout: Option<Duration>,
        reply: oneshot::Sender<Result<(), FleetError>>,
    },
    Close {
        reply: oneshot::Sender<()>,
    },
}

// =============================================================================
// Host Connection Handle
// =============================================================================

/// Handle to one remote host's connection actor.
pub struct HostConnection {
    addr: SocketAddr,
    cmd_tx: mpsc::Sender<HostCommand>,
    pods: PodMap,
}

impl HostConnection {
    /// Create the handle and spawn the actor task. The connection itself is
    /// established lazily or via an explicit [`HostConnection::reconnect`].
    pub fn spawn(addr: SocketAddr) -> Arc<Self> {
        let (cmd_tx, cmd_rx) = mpsc::channel(MAILBOX_SIZE);
        let pods: PodMap = Arc::default();

        let actor = HostActor {
            addr,
            endpoint: None,
            conn: None,
            pods: Arc::clone(&pods),
        };
        tokio::spawn(actor.run(cmd_rx));

        Arc::new(Self { addr, cmd_tx, pods })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Establish the connection; fails if already connected.
    pub async fn connect(&self) -> Result<(), FleetError> {
        self.submit(|reply| HostCommand::Connect { reply }).await?
    }

    /// Tear down whatever connection exists, dial again, and rebind every
    /// registered pod to a fresh stream.
    pub async fn reconnect(&self) -> Result<(), FleetError> {
        self.submit(|reply| HostCommand::Reconnect { reply }).await?
    }

    /// Queue a reconnect when `err` signals a dead connection. Application
    /// and protocol errors leave the connection untouched. The failed call
    /// itself is never retried.
    pub async fn reconnect_if_network_error(&self, err: &FleetError) {
        if !err.is_network() {
            return;
        }

        warn!(host = %self.addr, error = %err, "network error, recycling host connection");
        if let Err(e) = self.reconnect().await {
            warn!(host = %self.addr, error = %e, "reconnect after network error failed");
        }
    }

    /// Create a new pod on this host and register it.
    pub async fn create_pod(
        &self,
        name: &str,
        image: &str,
        cmd: Vec<String>,
        env: HashMap<String, String>,
    ) -> Result<String, FleetError> {
        let name = name.to_string();
        let image = image.to_string();
        self.submit(|reply| HostCommand::CreatePod {
            name,
            image,
            cmd,
            env,
            reply,
        })
        .await?
    }

    /// Register a pod that already exists on the host, opening a stream
    /// for it.
    pub async fn add_existing_pod(&self, pod_id: &str) -> Result<(), FleetError> {
        let pod_id = pod_id.to_string();
        self.submit(|reply| HostCommand::AddExistingPod {
            pod_id,
            connect: true,
            reply,
        })
        .await?
    }

    /// Register a pod without requiring a live connection. Used during
    /// startup reconciliation when the host may be unreachable; the pod is
    /// bound on the next successful reconnect.
    pub async fn add_existing_pod_without_connect(&self, pod_id: &str) -> Result<(), FleetError> {
        let pod_id = pod_id.to_string();
        self.submit(|reply| HostCommand::AddExistingPod {
            pod_id,
            connect: false,
            reply,
        })
        .await?
    }

    /// Open a fresh RPC stream for one pod, replacing whatever it had.
    pub async fn rebind_pod(&self, pod_id: &str) -> Result<(), FleetError> {
        let pod_id = pod_id.to_string();
        self.submit(|reply| HostCommand::RebindPod { pod_id, reply })
            .await?
    }

    /// Remove a pod from the registry, then best-effort kill and delete it
    /// on the host.
    pub async fn delete_pod(
        &self,
        pod_id: &str,
        timeout: Option<Duration>,
    ) -> Result<(), FleetError> {
        let pod_id = pod_id.to_string();
        self.submit(|reply| HostCommand::DeletePod {
            pod_id,
            timeout,
            reply,
        })
        .await?
    }

    /// Shut the actor down, closing the connection and all pod streams.
    pub async fn close(&self) {
        let (reply, done) = oneshot::channel();
        if self.cmd_tx.send(HostCommand::Close { reply }).await.is_ok() {
            let _ = done.await;
        }
    }

    /// Look up a pod registered on this host.
    pub fn pod(&self, pod_id: &str) -> Option<Arc<PodInstance>> {
        self.pods.lock().unwrap().get(pod_id).cloned()
    }

    /// Ids of all pods registered on this host.
    pub fn pod_ids(&self) -> Vec<String> {
        self.pods.lock().unwrap().keys().cloned().collect()
    }

    async fn submit<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> HostCommand,
    ) -> Result<T, FleetError> {
        let (reply, done) = oneshot::channel();
        self.cmd_tx
            .send(build(reply))
            .await
            .map_err(|_| FleetError::HostClosed)?;
        done.await.map_err(|_| FleetError::HostClosed)
    }
}

// =============================================================================
// Actor
// =============================================================================

/// State owned exclusively by the actor task. `None` for endpoint or
/// connection means "not connected".
struct HostActor {
    addr: SocketAddr,
    endpoint: Option<Endpoint>,
    conn: Option<Connection>,
    pods: PodMap,
}

impl HostActor {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<HostCommand>) {
        while let Some(cmd) = cmd_rx.recv().await {
            match cmd {
                HostCommand::Connect { reply } => {
                    let _ = reply.send(self.connect().await);
                }
                HostCommand::Reconnect { reply } => {
                    let _ = reply.send(self.reconnect().await);
                }
                HostCommand::CreatePod {
                    name,
                    image,
                    cmd,
                    env,
                    reply,
                } => {
                    let _ = reply.send(self.create_pod(&name, &image, &cmd, &env).await);
                }
                HostCommand::AddExistingPod {
                    pod_id,
                    connect,
                    reply,
                } => {
                    let _ = reply.send(self.add_existing_pod(pod_id, connect).await);
                }
                HostCommand::RebindPod { pod_id, reply } => {
                    let _ = reply.send(self.rebind_pod(&pod_id).await);
                }
                HostCommand::DeletePod {
                    pod_id,
                    timeout,
                    reply,
                } => {
                    let _ = reply.send(self.delete_pod(&pod_id, timeout).await);
                }
                HostCommand::Close { reply } => {
                    self.teardown(CLOSE_FAILURE, b"shutdown");
                    self.pods.lock().unwrap().clear();
                    let _ = reply.send(());
                    break;
                }
            }
        }

        debug!(host = %self.addr, "host actor stopped");
    }

    /// Disconnected -> Connected. Failure leaves the state untouched.
    async fn connect(&mut self) -> Result<(), FleetError> {
        if self.endpoint.is_some() || self.conn.is_some() {
            return Err(FleetError::AlreadyConnected);
        }

        let endpoint = podnet_quic::client_endpoint()?;
        let conn = podnet_quic::connect(&endpoint, self.addr).await?;

        self.endpoint = Some(endpoint);
        self.conn = Some(conn);
        info!(host = %self.addr, "connected to host");
        Ok(())
    }

    /// Tear down and dial again, then rebind every registered pod. Rebind
    /// failures are aggregated, never abort the loop, and leave the pod
    /// registered for the next attempt.
    async fn reconnect(&mut self) -> Result<(), FleetError> {
        self.teardown(CLOSE_RECONNECT, b"reconnect");
        self.connect().await?;

        let pod_ids: Vec<String> = self.pods.lock().unwrap().keys().cloned().collect();
        let total = pod_ids.len();
        let mut failures = Vec::new();

        for pod_id in pod_ids {
            if let Err(e) = self.rebind_pod(&pod_id).await {
                warn!(pod_id = %pod_id, error = %e, "failed to rebind pod after reconnect");
                failures.push(format!("{pod_id}: {e}"));
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(FleetError::PartialRebind {
                failed: failures.len(),
                total,
                details: failures.join("; "),
            })
        }
    }

    async fn create_pod(
        &mut self,
        name: &str,
        image: &str,
        cmd: &[String],
        env: &HashMap<String, String>,
    ) -> Result<String, FleetError> {
        let (send, recv) = self.open_stream().await?;
        let mut client = RpcClient::new(recv, send);

        let pod_id = match client.create(name, image, cmd, env).await {
            Ok(id) => id,
            Err(e) => {
                if e.is_network() {
                    self.reconnect_logged().await;
                }
                return Err(e.into());
            }
        };

        {
            let mut pods = self.pods.lock().unwrap();
            if pods.contains_key(&pod_id) {
                return Err(FleetError::DuplicatePod(pod_id));
            }
            pods.insert(pod_id.clone(), PodInstance::new(pod_id.clone(), client));
        }

        info!(host = %self.addr, pod_id = %pod_id, "created pod");
        Ok(pod_id)
    }

    async fn add_existing_pod(&mut self, pod_id: String, connect: bool) -> Result<(), FleetError> {
        if self.pods.lock().unwrap().contains_key(&pod_id) {
            return Err(FleetError::DuplicatePod(pod_id));
        }

        let client = if connect {
            let (send, recv) = self.open_stream().await?;
            RpcClient::new(recv, send)
        } else if self.conn.is_some() {
            // Connection happens to be up: try for a stream, but a failure
            // only means the pod starts out detached.
            match self.open_stream().await {
                Ok((send, recv)) => RpcClient::new(recv, send),
                Err(e) => {
                    warn!(pod_id = %pod_id, error = %e, "no stream for pod, registering detached");
                    RpcClient::detached()
                }
            }
        } else {
            RpcClient::detached()
        };

        debug!(host = %self.addr, pod_id = %pod_id, "registered existing pod");
        self.pods
            .lock()
            .unwrap()
            .insert(pod_id.clone(), PodInstance::new(pod_id, client));
        Ok(())
    }

    /// Open a fresh stream for one pod and swap it in. The old stream, if
    /// any, is dropped and thereby reset.
    async fn rebind_pod(&mut self, pod_id: &str) -> Result<(), FleetError> {
        let (send, recv) = self.open_stream().await?;
        let client = RpcClient::new(recv, send);

        let existing = self.pods.lock().unwrap().get(pod_id).cloned();
        match existing {
            Some(pod) => {
                *pod.client.lock().await = client;
            }
            None => {
                self.pods
                    .lock()
                    .unwrap()
                    .insert(pod_id.to_string(), PodInstance::new(pod_id.to_string(), client));
            }
        }

        debug!(host = %self.addr, pod_id = %pod_id, "pod bound to fresh rpc stream");
        Ok(())
    }

    async fn delete_pod(
        &mut self,
        pod_id: &str,
        timeout: Option<Duration>,
    ) -> Result<(), FleetError> {
        let removed = self.pods.lock().unwrap().remove(pod_id);
        let Some(pod) = removed else {
            return Err(FleetError::NoSuchPod(pod_id.to_string()));
        };

        // Best-effort teardown on the host; the pod is already gone from
        // the registry either way.
        if let Err(e) = pod.kill(timeout).await {
            warn!(pod_id = %pod_id, error = %e, "failed to kill pod during delete");
        }
        if let Err(e) = pod.delete().await {
            warn!(pod_id = %pod_id, error = %e, "failed to delete pod");
        }

        Ok(())
    }

    async fn reconnect_logged(&mut self) {
        if let Err(e) = self.reconnect().await {
            warn!(host = %self.addr, error = %e, "reconnect after network error failed");
        }
    }

    /// Lazily build the endpoint and dial if needed, then open a stream.
    /// Any failure tears the connection down so the next attempt starts
    /// clean.
    async fn open_stream(&mut self) -> Result<(SendStream, RecvStream), FleetError> {
        let conn = match self.ensure_connection().await {
            Ok(conn) => conn,
            Err(e) => {
                self.teardown(CLOSE_FAILURE, b"failure");
                return Err(e);
            }
        };

        match conn.open_bi().await {
            Ok(halves) => Ok(halves),
            Err(e) => {
                self.teardown(CLOSE_FAILURE, b"failure");
                Err(QuicError::Connection(e).into())
            }
        }
    }

    async fn ensure_connection(&mut self) -> Result<Connection, FleetError> {
        if let Some(conn) = &self.conn {
            return Ok(conn.clone());
        }

        let endpoint = match self.endpoint.take() {
            Some(endpoint) => endpoint,
            None => podnet_quic::client_endpoint()?,
        };

        let dialed = podnet_quic::connect(&endpoint, self.addr).await;
        self.endpoint = Some(endpoint);

        let conn = dialed?;
        self.conn = Some(conn.clone());
        info!(host = %self.addr, "connected to host");
        Ok(conn)
    }

    fn teardown(&mut self, code: u32, reason: &[u8]) {
        if let Some(conn) = self.conn.take() {
            conn.close(VarInt::from_u32(code), reason);
        }
        if let Some(endpoint) = self.endpoint.take() {
            endpoint.close(VarInt::from_u32(code), reason);
        }
    }
}
