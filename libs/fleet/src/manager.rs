//! Fleet manager: the host-id -> host-connection map and pod dispatch.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use podnet_rpc::PodInspect;
use tracing::info;

use crate::error::FleetError;
use crate::host::{HostConnection, PodInstance, PodRawStream};

/// Registry of all known execution hosts.
///
/// The map lock is held only for structural changes and lookups; every
/// network operation runs after the guard is released, against a cloned
/// host handle.
#[derive(Default)]
pub struct FleetManager {
    hosts: StdMutex<HashMap<String, Arc<HostConnection>>>,
}

impl FleetManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a host and attempt the initial connect.
    ///
    /// A connect failure is returned to the caller but the host stays
    /// registered, queued for reconnection on the next call that touches
    /// it. Only address resolution failure is fatal.
    pub async fn add(&self, host_id: &str, addr: &str) -> Result<(), FleetError> {
        let resolved = resolve_udp4(addr).await?;

        let host = {
            let mut hosts = self.hosts.lock().unwrap();
            if hosts.contains_key(host_id) {
                return Err(FleetError::DuplicateHost(host_id.to_string()));
            }
            let host = HostConnection::spawn(resolved);
            hosts.insert(host_id.to_string(), Arc::clone(&host));
            host
        };

        info!(host_id, addr = %resolved, "registered host");
        host.reconnect().await
    }

    /// Deregister a host, closing its connection and all pod streams.
    pub async fn remove(&self, host_id: &str) {
        let host = self.hosts.lock().unwrap().remove(host_id);
        if let Some(host) = host {
            host.close().await;
            info!(host_id, "removed host");
        }
    }

    /// Replace a host's address: remove, then add.
    pub async fn update(&self, host_id: &str, addr: &str) -> Result<(), FleetError> {
        self.remove(host_id).await;
        self.add(host_id, addr).await
    }

    /// Look up a registered host.
    pub fn host(&self, host_id: &str) -> Option<Arc<HostConnection>> {
        self.hosts.lock().unwrap().get(host_id).cloned()
    }

    // =========================================================================
    // Host-targeted pod registration
    // =========================================================================

    /// Create a new pod on the named host and return its id.
    pub async fn add_new_pod_to_host(
        &self,
        host_id: &str,
        name: &str,
        image: &str,
        cmd: Vec<String>,
        env: HashMap<String, String>,
    ) -> Result<String, FleetError> {
        self.require_host(host_id)?
            .create_pod(name, image, cmd, env)
            .await
    }

    /// Register a pod that already exists on the named host.
    pub async fn add_existing_pod_to_host(
        &self,
        host_id: &str,
        pod_id: &str,
    ) -> Result<(), FleetError> {
        self.require_host(host_id)?.add_existing_pod(pod_id).await
    }

    /// Register a pod without requiring the host to be reachable. Used for
    /// startup reconciliation against stored records.
    pub async fn add_existing_pod_to_host_without_connect(
        &self,
        host_id: &str,
        pod_id: &str,
    ) -> Result<(), FleetError> {
        self.require_host(host_id)?
            .add_existing_pod_without_connect(pod_id)
            .await
    }

    /// Delete a pod from the named host.
    pub async fn delete_pod_from_host(
        &self,
        host_id: &str,
        pod_id: &str,
        timeout: Option<Duration>,
    ) -> Result<(), FleetError> {
        self.require_host(host_id)?.delete_pod(pod_id, timeout).await
    }

    // =========================================================================
    // Pod-targeted calls
    // =========================================================================

    pub async fn start_pod_by_id(
        &self,
        pod_id: &str,
        timeout: Option<Duration>,
    ) -> Result<(), FleetError> {
        let (host, pod) = self.find_pod(pod_id)?;
        match pod.start(timeout).await {
            Ok(()) => Ok(()),
            Err(e) => Err(self.recover(&host, e.into()).await),
        }
    }

    pub async fn stop_pod_by_id(
        &self,
        pod_id: &str,
        timeout: Option<Duration>,
    ) -> Result<(), FleetError> {
        let (host, pod) = self.find_pod(pod_id)?;
        match pod.stop(timeout).await {
            Ok(()) => Ok(()),
            Err(e) => Err(self.recover(&host, e.into()).await),
        }
    }

    pub async fn kill_pod_by_id(
        &self,
        pod_id: &str,
        timeout: Option<Duration>,
    ) -> Result<(), FleetError> {
        let (host, pod) = self.find_pod(pod_id)?;
        match pod.kill(timeout).await {
            Ok(()) => Ok(()),
            Err(e) => Err(self.recover(&host, e.into()).await),
        }
    }

    pub async fn inspect_pod_by_id(&self, pod_id: &str) -> Result<PodInspect, FleetError> {
        let (host, pod) = self.find_pod(pod_id)?;
        match pod.inspect().await {
            Ok(snapshot) => Ok(snapshot),
            Err(e) => Err(self.recover(&host, e.into()).await),
        }
    }

    /// Switch the pod's stream to a raw byte pipe for an interactive
    /// session. The pod itself is immediately rebound to a fresh RPC
    /// stream so it stays controllable while attached.
    pub async fn attach_pod_by_id(&self, pod_id: &str) -> Result<PodRawStream, FleetError> {
        let (host, pod) = self.find_pod(pod_id)?;

        let raw = match pod.attach().await {
            Ok(raw) => raw,
            Err(e) => return Err(self.recover(&host, e.into()).await),
        };

        if let Err(e) = host.rebind_pod(pod.id()).await {
            return Err(self.recover(&host, e).await);
        }

        Ok(raw)
    }

    /// Delete a pod located by id across all hosts.
    pub async fn delete_pod_by_id(
        &self,
        pod_id: &str,
        timeout: Option<Duration>,
    ) -> Result<(), FleetError> {
        let (host, _) = self.find_pod(pod_id)?;
        host.delete_pod(pod_id, timeout).await
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn require_host(&self, host_id: &str) -> Result<Arc<HostConnection>, FleetError> {
        self.host(host_id)
            .ok_or_else(|| FleetError::NoSuchHost(host_id.to_string()))
    }

    /// Resolve pod-id -> (host, pod) by scanning every host's registry.
    /// Fleets are small; a reverse index would be an optimization, not a
    /// behavior change.
    fn find_pod(&self, pod_id: &str) -> Result<(Arc<HostConnection>, Arc<PodInstance>), FleetError> {
        let hosts = self.hosts.lock().unwrap();
        for host in hosts.values() {
            if let Some(pod) = host.pod(pod_id) {
                return Ok((Arc::clone(host), pod));
            }
        }
        Err(FleetError::NoSuchPod(pod_id.to_string()))
    }

    /// Feed a failed pod call into the host's serialized recovery path,
    /// then hand the original error back to the caller.
    async fn recover(&self, host: &HostConnection, err: FleetError) -> FleetError {
        host.reconnect_if_network_error(&err).await;
        err
    }
}

/// Resolve a host address to a UDP4 endpoint.
async fn resolve_udp4(addr: &str) -> Result<SocketAddr, FleetError> {
    let resolved = tokio::net::lookup_host(addr)
        .await
        .map_err(|e| FleetError::Resolve {
            addr: addr.to_string(),
            source: e,
        })?;

    resolved
        .into_iter()
        .find(SocketAddr::is_ipv4)
        .ok_or_else(|| FleetError::Resolve {
            addr: addr.to_string(),
            source: io::Error::new(io::ErrorKind::NotFound, "no ipv4 address"),
        })
}
