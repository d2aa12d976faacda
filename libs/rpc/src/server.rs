//! RPC server: decodes one request at a time, dispatches to the execution
//! handler, writes one response.
//!
//! The server owns the attach handoff: for `attach` it asks the handler for
//! a bridge, acks the request, and only then moves the stream halves into
//! the bridge. From that point the stream is a raw byte pipe and `serve`
//! returns.

use std::collections::HashMap;
use std::mem;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tracing::debug;

use crate::error::RpcError;
use crate::proto::{
    read_value, write_value, CreateParams, EmptyBody, IdBody, IdParams, IdTimeoutParams,
    InspectBody, PodInspect, Request, Response,
};

/// Boxed read half of a stream handed to an attach bridge.
pub type RawReader = Box<dyn AsyncRead + Send + Unpin>;
/// Boxed write half of a stream handed to an attach bridge.
pub type RawWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Full-duplex adapter between a pod's native I/O and a raw network stream.
///
/// Produced by the execution handler for `attach`. Exactly one of `connect`
/// or `close` is called, and exactly once.
pub trait Bridge: Send {
    /// Wire two directional copy loops between the pod's native I/O and the
    /// given raw stream. Each loop independently closes both ends when its
    /// read or write fails.
    fn connect(self: Box<Self>, reader: RawReader, writer: RawWriter);

    /// Release the native I/O handle without connecting.
    fn close(self: Box<Self>);
}

/// Execution handler behind the RPC server.
///
/// Implementations run container operations on the local host. `timeout` is
/// an advisory deadline: the server also enforces it around the call, but a
/// well-behaved handler honors it for operations with their own grace
/// periods (stop, kill).
#[async_trait]
pub trait PodHandler: Send + Sync {
    async fn create(
        &self,
        name: &str,
        image: &str,
        cmd: &[String],
        env: &HashMap<String, String>,
    ) -> Result<String>;

    async fn start(&self, id: &str, timeout: Duration) -> Result<()>;

    async fn stop(&self, id: &str, timeout: Duration) -> Result<()>;

    async fn kill(&self, id: &str, signal: &str, timeout: Duration) -> Result<()>;

    async fn delete(&self, id: &str) -> Result<()>;

    async fn inspect(&self, id: &str) -> Result<PodInspect>;

    async fn attach(&self, id: &str) -> Result<Box<dyn Bridge>>;
}

/// Ownership state of the server's stream, mirroring the client side.
enum ServerStream<R, W> {
    Open { reader: BufReader<R>, writer: W },
    Detached,
}

/// Outcome of handling one request.
enum Handled {
    Continue,
    Detached,
}

/// Server side of the pod RPC protocol, bound to one stream.
pub struct RpcServer<R, W> {
    stream: ServerStream<R, W>,
    handler: Arc<dyn PodHandler>,
    default_timeout: Duration,
}

impl<R, W> RpcServer<R, W>
where
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
{
    pub fn new(reader: R, writer: W, handler: Arc<dyn PodHandler>, default_timeout: Duration) -> Self {
        Self {
            stream: ServerStream::Open {
                reader: BufReader::new(reader),
                writer,
            },
            handler,
            default_timeout,
        }
    }

    /// Serve requests until the stream closes, a protocol error occurs, or
    /// an attach hands the stream off to a bridge.
    pub async fn serve(mut self) -> Result<(), RpcError> {
        loop {
            match self.handle_one().await? {
                Handled::Continue => {}
                Handled::Detached => return Ok(()),
            }
        }
    }

    /// Handle exactly one request/response exchange.
    async fn handle_one(&mut self) -> Result<Handled, RpcError> {
        let ServerStream::Open { reader, .. } = &mut self.stream else {
            return Err(RpcError::StreamDetached);
        };

        let req: Request = read_value(reader).await?;
        debug!(method = %req.method, "rpc request");

        match req.method.as_str() {
            "create" => self.method_create(req.params).await,
            "start" => self.method_start(req.params).await,
            "stop" => self.method_stop(req.params).await,
            "kill" => self.method_kill(req.params).await,
            "delete" => self.method_delete(req.params).await,
            "inspect" => self.method_inspect(req.params).await,
            "attach" => self.method_attach(req.params).await,
            other => Err(RpcError::UnknownMethod(other.to_string())),
        }
    }

    async fn method_create(&mut self, params: serde_json::Value) -> Result<Handled, RpcError> {
        let mut params: CreateParams = serde_json::from_value(params)?;
        if params.cmd.is_empty() {
            params.cmd = vec!["sh".to_string()];
        }

        let call = self.handler.create(&params.name, &params.image, &params.cmd, &params.env);
        match run_with_deadline(self.default_timeout, call).await {
            Ok(id) => self.send(Response::ok(IdBody { id })).await?,
            Err(e) => self.send(Response::<IdBody>::error(e)).await?,
        }
        Ok(Handled::Continue)
    }

    async fn method_start(&mut self, params: serde_json::Value) -> Result<Handled, RpcError> {
        let params: IdTimeoutParams = serde_json::from_value(params)?;
        let timeout = self.effective_timeout(params.timeout_ms);

        let call = self.handler.start(&params.id, timeout);
        self.send_empty(run_with_deadline(timeout, call).await).await?;
        Ok(Handled::Continue)
    }

    async fn method_stop(&mut self, params: serde_json::Value) -> Result<Handled, RpcError> {
        let params: IdTimeoutParams = serde_json::from_value(params)?;
        let timeout = self.effective_timeout(params.timeout_ms);

        let call = self.handler.stop(&params.id, timeout);
        self.send_empty(run_with_deadline(timeout, call).await).await?;
        Ok(Handled::Continue)
    }

    async fn method_kill(&mut self, params: serde_json::Value) -> Result<Handled, RpcError> {
        let params: IdTimeoutParams = serde_json::from_value(params)?;
        let timeout = self.effective_timeout(params.timeout_ms);

        // The wire carries no signal; the runtime's default is used.
        let call = self.handler.kill(&params.id, "", timeout);
        self.send_empty(run_with_deadline(timeout, call).await).await?;
        Ok(Handled::Continue)
    }

    async fn method_delete(&mut self, params: serde_json::Value) -> Result<Handled, RpcError> {
        let params: IdParams = serde_json::from_value(params)?;

        let call = self.handler.delete(&params.id);
        self.send_empty(run_with_deadline(self.default_timeout, call).await).await?;
        Ok(Handled::Continue)
    }

    async fn method_inspect(&mut self, params: serde_json::Value) -> Result<Handled, RpcError> {
        let params: IdParams = serde_json::from_value(params)?;

        let call = self.handler.inspect(&params.id);
        match run_with_deadline(self.default_timeout, call).await {
            Ok(pod) => self.send(Response::ok(InspectBody { pod: Some(pod) })).await?,
            Err(e) => self.send(Response::<InspectBody>::error(e)).await?,
        }
        Ok(Handled::Continue)
    }

    async fn method_attach(&mut self, params: serde_json::Value) -> Result<Handled, RpcError> {
        let params: IdParams = serde_json::from_value(params)?;

        let call = self.handler.attach(&params.id);
        let bridge = match run_with_deadline(self.default_timeout, call).await {
            Ok(bridge) => bridge,
            Err(e) => {
                // Bridge construction failed: ordinary in-band error, the
                // stream stays in RPC mode.
                self.send(Response::<EmptyBody>::error(e)).await?;
                return Ok(Handled::Continue);
            }
        };

        // Ack before the handoff so the client cannot race ahead of it.
        if let Err(e) = self.send(Response::ok(EmptyBody {})).await {
            bridge.close();
            return Err(e);
        }

        match mem::replace(&mut self.stream, ServerStream::Detached) {
            ServerStream::Open { reader, writer } => {
                bridge.connect(Box::new(reader), Box::new(writer));
                Ok(Handled::Detached)
            }
            ServerStream::Detached => {
                bridge.close();
                Err(RpcError::StreamDetached)
            }
        }
    }

    fn effective_timeout(&self, timeout_ms: u64) -> Duration {
        if timeout_ms == 0 {
            self.default_timeout
        } else {
            Duration::from_millis(timeout_ms)
        }
    }

    async fn send_empty(&mut self, result: Result<()>) -> Result<(), RpcError> {
        match result {
            Ok(()) => self.send(Response::ok(EmptyBody {})).await,
            Err(e) => self.send(Response::<EmptyBody>::error(e)).await,
        }
    }

    async fn send<B: Serialize>(&mut self, res: Response<B>) -> Result<(), RpcError> {
        let ServerStream::Open { writer, .. } = &mut self.stream else {
            return Err(RpcError::StreamDetached);
        };
        write_value(writer, &res).await
    }
}

/// Enforce the advisory deadline around a handler call. A call that outlives
/// it becomes an in-band "timed out" failure; the stream stays usable.
async fn run_with_deadline<T>(
    timeout: Duration,
    call: impl std::future::Future<Output = Result<T>>,
) -> Result<T> {
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(anyhow::anyhow!(
            "operation timed out after {}ms",
            timeout.as_millis()
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::RpcClient;
    use crate::proto::PodState;
    use anyhow::anyhow;
    use rstest::rstest;
    use std::sync::Mutex;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// Handler that records calls and serves a single scripted pod.
    struct ScriptedHandler {
        calls: Mutex<Vec<String>>,
        attach_ok: bool,
        sleep_on_start: Option<Duration>,
    }

    impl ScriptedHandler {
        fn new() -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                attach_ok: true,
                sleep_on_start: None,
            }
        }

        fn snapshot() -> PodInspect {
            PodInspect {
                id: "pod-1".into(),
                name: "web".into(),
                path: "sh".into(),
                args: vec![],
                image: "alpine".into(),
                created: "2026-01-01T00:00:00Z".into(),
                size_rw: None,
                size_root_fs: None,
                state: PodState {
                    status: "created".into(),
                    ..Default::default()
                },
            }
        }
    }

    /// Bridge that echoes everything it reads back to the stream.
    struct EchoBridge;

    impl Bridge for EchoBridge {
        fn connect(self: Box<Self>, mut reader: RawReader, mut writer: RawWriter) {
            tokio::spawn(async move {
                let mut buf = [0u8; 512];
                loop {
                    match reader.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if writer.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                            let _ = writer.flush().await;
                        }
                    }
                }
            });
        }

        fn close(self: Box<Self>) {}
    }

    #[async_trait]
    impl PodHandler for ScriptedHandler {
        async fn create(
            &self,
            name: &str,
            _image: &str,
            cmd: &[String],
            _env: &HashMap<String, String>,
        ) -> Result<String> {
            self.calls.lock().unwrap().push(format!("create:{name}:{}", cmd.join(" ")));
            Ok("pod-1".into())
        }

        async fn start(&self, id: &str, _timeout: Duration) -> Result<()> {
            if let Some(delay) = self.sleep_on_start {
                tokio::time::sleep(delay).await;
            }
            self.calls.lock().unwrap().push(format!("start:{id}"));
            Ok(())
        }

        async fn stop(&self, id: &str, _timeout: Duration) -> Result<()> {
            self.calls.lock().unwrap().push(format!("stop:{id}"));
            Err(anyhow!("pod not running"))
        }

        async fn kill(&self, id: &str, signal: &str, _timeout: Duration) -> Result<()> {
            self.calls.lock().unwrap().push(format!("kill:{id}:{signal}"));
            Ok(())
        }

        async fn delete(&self, id: &str) -> Result<()> {
            self.calls.lock().unwrap().push(format!("delete:{id}"));
            Ok(())
        }

        async fn inspect(&self, _id: &str) -> Result<PodInspect> {
            Ok(Self::snapshot())
        }

        async fn attach(&self, _id: &str) -> Result<Box<dyn Bridge>> {
            if self.attach_ok {
                Ok(Box::new(EchoBridge))
            } else {
                Err(anyhow!("pod has no tty"))
            }
        }
    }

    type DuplexClient = RpcClient<
        tokio::io::ReadHalf<tokio::io::DuplexStream>,
        tokio::io::WriteHalf<tokio::io::DuplexStream>,
    >;

    fn serve_pair(handler: Arc<ScriptedHandler>, timeout: Duration) -> DuplexClient {
        let (near, far) = tokio::io::duplex(8192);
        let (client_r, client_w) = tokio::io::split(near);
        let (server_r, server_w) = tokio::io::split(far);

        let server = RpcServer::new(server_r, server_w, handler, timeout);
        tokio::spawn(async move {
            let _ = server.serve().await;
        });

        RpcClient::new(client_r, client_w)
    }

    #[tokio::test]
    async fn full_method_set_round_trips() {
        let handler = Arc::new(ScriptedHandler::new());
        let mut client = serve_pair(Arc::clone(&handler), Duration::from_secs(5));

        let id = client
            .create("web", "alpine", &[], &HashMap::new())
            .await
            .unwrap();
        assert_eq!(id, "pod-1");

        client.start(&id, None).await.unwrap();
        client.kill(&id, Some(Duration::from_secs(1))).await.unwrap();
        client.delete(&id).await.unwrap();

        let calls = handler.calls.lock().unwrap().clone();
        // Empty cmd defaults to a shell before reaching the handler.
        assert_eq!(
            calls,
            vec!["create:web:sh", "start:pod-1", "kill:pod-1:", "delete:pod-1"]
        );
    }

    #[rstest]
    #[case::start("start", "start:pod-1")]
    #[case::kill("kill", "kill:pod-1:")]
    #[case::delete("delete", "delete:pod-1")]
    #[tokio::test]
    async fn each_id_method_reaches_the_handler(#[case] method: &str, #[case] recorded: &str) {
        let handler = Arc::new(ScriptedHandler::new());
        let mut client = serve_pair(Arc::clone(&handler), Duration::from_secs(5));

        match method {
            "start" => client.start("pod-1", None).await.unwrap(),
            "kill" => client.kill("pod-1", None).await.unwrap(),
            "delete" => client.delete("pod-1").await.unwrap(),
            other => panic!("unexpected method {other}"),
        }

        let calls = handler.calls.lock().unwrap().clone();
        assert_eq!(calls, vec![recorded.to_string()]);
    }

    #[tokio::test]
    async fn handler_failure_is_in_band_and_stream_survives() {
        let handler = Arc::new(ScriptedHandler::new());
        let mut client = serve_pair(handler, Duration::from_secs(5));

        let err = client.stop("pod-1", None).await.unwrap_err();
        assert!(matches!(err, RpcError::Remote(ref msg) if msg == "pod not running"));

        // The same stream keeps serving after an application error.
        let snapshot = client.inspect("pod-1").await.unwrap();
        assert_eq!(snapshot, ScriptedHandler::snapshot());
    }

    #[tokio::test]
    async fn inspect_round_trips_structurally() {
        let handler = Arc::new(ScriptedHandler::new());
        let mut client = serve_pair(handler, Duration::from_secs(5));

        let snapshot = client.inspect("pod-1").await.unwrap();
        assert_eq!(snapshot, ScriptedHandler::snapshot());
        assert!(!snapshot.state.running);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_handler_times_out_in_band() {
        let mut handler = ScriptedHandler::new();
        handler.sleep_on_start = Some(Duration::from_secs(60));
        let mut client = serve_pair(Arc::new(handler), Duration::from_secs(1));

        let err = client.start("pod-1", None).await.unwrap_err();
        assert!(matches!(err, RpcError::Remote(ref msg) if msg.contains("timed out")));
    }

    #[tokio::test]
    async fn attach_acks_then_bridges_raw_bytes() {
        let handler = Arc::new(ScriptedHandler::new());
        let mut client = serve_pair(handler, Duration::from_secs(5));

        let mut raw = client.attach("pod-1").await.unwrap();
        assert!(client.is_detached());

        raw.writer.write_all(b"hello pod").await.unwrap();
        raw.writer.flush().await.unwrap();

        let mut buf = [0u8; 9];
        raw.reader.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello pod");
    }

    #[tokio::test]
    async fn failed_bridge_does_not_detach() {
        let mut handler = ScriptedHandler::new();
        handler.attach_ok = false;
        let mut client = serve_pair(Arc::new(handler), Duration::from_secs(5));

        let err = client.attach("pod-1").await.unwrap_err();
        assert!(matches!(err, RpcError::Remote(ref msg) if msg == "pod has no tty"));
        assert!(!client.is_detached());

        // Still in RPC mode on both ends.
        client.inspect("pod-1").await.unwrap();
    }
}
