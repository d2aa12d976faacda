//! Execution handler implementations.
//!
//! The RPC server dispatches into a [`PodHandler`]; production deployments
//! back it with a container runtime. The mock implementation here keeps a
//! full pod lifecycle in memory (created -> running -> exited) and is used
//! by the dev binary and the integration tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::Utc;
use podnet_rpc::{Bridge, PodHandler, PodInspect, PodState, RawReader, RawWriter};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, warn};

/// One pod tracked by the mock runtime.
#[derive(Debug, Clone)]
struct MockPod {
    id: String,
    name: String,
    image: String,
    cmd: Vec<String>,
    created: String,
    running: bool,
    status: String,
    pid: i64,
    exit_code: i64,
    started_at: String,
    finished_at: String,
}

/// In-memory mock runtime for testing and development.
pub struct MockRuntime {
    pods: Mutex<HashMap<String, MockPod>>,

    /// Counter for generating pod ids.
    id_counter: AtomicU64,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self {
            pods: Mutex::new(HashMap::new()),
            id_counter: AtomicU64::new(0),
        }
    }

    fn next_pod_id(&self) -> String {
        let counter = self.id_counter.fetch_add(1, Ordering::SeqCst);
        format!("pod_{:012x}", counter)
    }

    fn with_pod<T>(&self, id: &str, f: impl FnOnce(&mut MockPod) -> Result<T>) -> Result<T> {
        let mut pods = self.pods.lock().unwrap();
        let pod = pods
            .get_mut(id)
            .ok_or_else(|| anyhow!("no such pod: {id}"))?;
        f(pod)
    }
}

impl Default for MockRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PodHandler for MockRuntime {
    async fn create(
        &self,
        name: &str,
        image: &str,
        cmd: &[String],
        _env: &HashMap<String, String>,
    ) -> Result<String> {
        let id = self.next_pod_id();
        info!(pod_id = %id, name, image, "[MOCK] creating pod");

        let pod = MockPod {
            id: id.clone(),
            name: name.to_string(),
            image: image.to_string(),
            cmd: cmd.to_vec(),
            created: Utc::now().to_rfc3339(),
            running: false,
            status: "created".to_string(),
            pid: 0,
            exit_code: 0,
            started_at: String::new(),
            finished_at: String::new(),
        };

        self.pods.lock().unwrap().insert(id.clone(), pod);
        Ok(id)
    }

    async fn start(&self, id: &str, _timeout: Duration) -> Result<()> {
        self.with_pod(id, |pod| {
            if pod.running {
                bail!("pod {id} is already running");
            }
            pod.running = true;
            pod.status = "running".to_string();
            pod.pid = 4242;
            pod.started_at = Utc::now().to_rfc3339();
            debug!(pod_id = %id, "[MOCK] pod started");
            Ok(())
        })
    }

    async fn stop(&self, id: &str, timeout: Duration) -> Result<()> {
        self.with_pod(id, |pod| {
            if !pod.running {
                bail!("pod {id} is not running");
            }
            debug!(pod_id = %id, grace_ms = timeout.as_millis() as u64, "[MOCK] pod stopped");
            pod.running = false;
            pod.status = "exited".to_string();
            pod.pid = 0;
            pod.exit_code = 0;
            pod.finished_at = Utc::now().to_rfc3339();
            Ok(())
        })
    }

    async fn kill(&self, id: &str, signal: &str, _timeout: Duration) -> Result<()> {
        self.with_pod(id, |pod| {
            if !pod.running {
                bail!("pod {id} is not running");
            }
            debug!(pod_id = %id, signal, "[MOCK] pod killed");
            pod.running = false;
            pod.status = "exited".to_string();
            pod.pid = 0;
            // Default signal is a hard kill.
            pod.exit_code = 137;
            pod.finished_at = Utc::now().to_rfc3339();
            Ok(())
        })
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let mut pods = self.pods.lock().unwrap();
        let Some(pod) = pods.get(id) else {
            bail!("no such pod: {id}");
        };
        if pod.running {
            bail!("cannot delete running pod {id}");
        }
        pods.remove(id);
        info!(pod_id = %id, "[MOCK] pod deleted");
        Ok(())
    }

    async fn inspect(&self, id: &str) -> Result<PodInspect> {
        self.with_pod(id, |pod| {
            let path = pod.cmd.first().cloned().unwrap_or_default();
            let args = pod.cmd.iter().skip(1).cloned().collect();
            Ok(PodInspect {
                id: pod.id.clone(),
                name: pod.name.clone(),
                path,
                args,
                image: pod.image.clone(),
                created: pod.created.clone(),
                size_rw: None,
                size_root_fs: None,
                state: PodState {
                    status: pod.status.clone(),
                    running: pod.running,
                    paused: false,
                    restarting: false,
                    oom_killed: false,
                    dead: false,
                    pid: pod.pid,
                    exit_code: pod.exit_code,
                    error: String::new(),
                    started_at: pod.started_at.clone(),
                    finished_at: pod.finished_at.clone(),
                },
            })
        })
    }

    async fn attach(&self, id: &str) -> Result<Box<dyn Bridge>> {
        self.with_pod(id, |pod| {
            if !pod.running {
                bail!("pod {id} is not running");
            }
            Ok(())
        })?;

        info!(pod_id = %id, "[MOCK] attaching to pod");
        Ok(Box::new(EchoBridge {
            pod_id: id.to_string(),
        }))
    }
}

/// Bridge to the mock pod's "native" I/O: the pod behaves like a shell
/// that echoes every byte of input back to its output.
struct EchoBridge {
    pod_id: String,
}

impl Bridge for EchoBridge {
    fn connect(self: Box<Self>, mut reader: RawReader, mut writer: RawWriter) {
        debug!(pod_id = %self.pod_id, "[MOCK] bridge connected");

        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            loop {
                match reader.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => {
                        if writer.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                        if writer.flush().await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(pod_id = %self.pod_id, error = %e, "bridge read failed");
                        break;
                    }
                }
            }
            let _ = writer.shutdown().await;
            debug!(pod_id = %self.pod_id, "[MOCK] bridge closed");
        });
    }

    fn close(self: Box<Self>) {
        debug!(pod_id = %self.pod_id, "[MOCK] bridge released without connecting");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[tokio::test]
    async fn lifecycle_created_running_exited() {
        let runtime = MockRuntime::new();
        let id = runtime
            .create("web", "alpine", &[], &HashMap::new())
            .await
            .unwrap();

        let snapshot = runtime.inspect(&id).await.unwrap();
        assert_eq!(snapshot.state.status, "created");
        assert!(!snapshot.state.running);

        runtime.start(&id, Duration::from_secs(1)).await.unwrap();
        let snapshot = runtime.inspect(&id).await.unwrap();
        assert!(snapshot.state.running);
        assert!(!snapshot.state.started_at.is_empty());

        runtime.kill(&id, "", Duration::from_secs(1)).await.unwrap();
        let snapshot = runtime.inspect(&id).await.unwrap();
        assert!(!snapshot.state.running);
        assert_eq!(snapshot.state.exit_code, 137);

        runtime.delete(&id).await.unwrap();
        assert!(runtime.inspect(&id).await.is_err());
    }

    #[rstest]
    #[case::graceful_stop(false, 0)]
    #[case::hard_kill(true, 137)]
    #[tokio::test]
    async fn shutdown_paths_record_exit_codes(#[case] hard: bool, #[case] exit_code: i64) {
        let runtime = MockRuntime::new();
        let id = runtime
            .create("web", "alpine", &[], &HashMap::new())
            .await
            .unwrap();
        runtime.start(&id, Duration::from_secs(1)).await.unwrap();

        if hard {
            runtime.kill(&id, "", Duration::from_secs(1)).await.unwrap();
        } else {
            runtime.stop(&id, Duration::from_secs(1)).await.unwrap();
        }

        let snapshot = runtime.inspect(&id).await.unwrap();
        assert!(!snapshot.state.running);
        assert_eq!(snapshot.state.status, "exited");
        assert_eq!(snapshot.state.exit_code, exit_code);
        assert!(!snapshot.state.finished_at.is_empty());
    }

    #[tokio::test]
    async fn delete_refuses_running_pod() {
        let runtime = MockRuntime::new();
        let id = runtime
            .create("web", "alpine", &[], &HashMap::new())
            .await
            .unwrap();
        runtime.start(&id, Duration::from_secs(1)).await.unwrap();

        let err = runtime.delete(&id).await.unwrap_err();
        assert!(err.to_string().contains("running"));
    }

    #[tokio::test]
    async fn attach_requires_running_pod() {
        let runtime = MockRuntime::new();
        let id = runtime
            .create("web", "alpine", &[], &HashMap::new())
            .await
            .unwrap();

        assert!(runtime.attach(&id).await.is_err());
        runtime.start(&id, Duration::from_secs(1)).await.unwrap();
        assert!(runtime.attach(&id).await.is_ok());
    }
}
