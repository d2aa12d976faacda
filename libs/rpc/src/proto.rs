//! Wire types and framing for the pod RPC protocol.
//!
//! Both envelopes are newline-delimited JSON values. The request keeps its
//! parameters as an untyped `serde_json::Value` so new parameter fields can
//! be added without breaking older peers; they are decoded into a concrete
//! shape only after the method tag has been matched.

use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::RpcError;

// =============================================================================
// Envelopes
// =============================================================================

/// A single RPC request: method tag plus opaque parameter payload.
#[derive(Debug, Serialize, Deserialize)]
pub struct Request {
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

impl Request {
    pub fn new<P: Serialize>(method: &str, params: &P) -> Result<Self, RpcError> {
        Ok(Self {
            method: method.to_string(),
            params: serde_json::to_value(params)?,
        })
    }
}

/// A single RPC response: error string (empty = success) plus a
/// method-specific body flattened alongside it.
#[derive(Debug, Serialize, Deserialize)]
pub struct Response<B> {
    #[serde(default)]
    pub err: String,
    #[serde(flatten)]
    pub body: B,
}

impl<B: Default> Response<B> {
    pub fn ok(body: B) -> Self {
        Self {
            err: String::new(),
            body,
        }
    }

    pub fn error(err: impl ToString) -> Self {
        Self {
            err: err.to_string(),
            body: B::default(),
        }
    }
}

// =============================================================================
// Method Parameters
// =============================================================================

/// Parameters for `create`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateParams {
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub cmd: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// Parameters for id-only methods (`delete`, `inspect`, `attach`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdParams {
    pub id: String,
}

/// Parameters for methods with a timeout override (`start`, `stop`, `kill`).
///
/// A zero timeout means "use the server's configured default".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdTimeoutParams {
    pub id: String,
    #[serde(default)]
    pub timeout_ms: u64,
}

// =============================================================================
// Method Bodies
// =============================================================================

/// Body for methods with no payload.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct EmptyBody {}

/// Body carrying a pod id (`create`).
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct IdBody {
    #[serde(default)]
    pub id: String,
}

/// Body carrying an inspect snapshot.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct InspectBody {
    #[serde(default)]
    pub pod: Option<PodInspect>,
}

// =============================================================================
// Inspect Snapshot
// =============================================================================

/// Point-in-time snapshot of one pod, as reported by the execution handler.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PodInspect {
    pub id: String,
    pub name: String,
    pub path: String,
    pub args: Vec<String>,
    pub image: String,
    pub created: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_rw: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_root_fs: Option<i64>,
    pub state: PodState,
}

/// Runtime state portion of an inspect snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PodState {
    pub status: String,
    pub running: bool,
    pub paused: bool,
    pub restarting: bool,
    pub oom_killed: bool,
    pub dead: bool,
    pub pid: i64,
    pub exit_code: i64,
    pub error: String,
    pub started_at: String,
    pub finished_at: String,
}

// =============================================================================
// Framing
// =============================================================================

/// Write one value as a JSON line and flush it.
pub(crate) async fn write_value<W, T>(writer: &mut W, value: &T) -> Result<(), RpcError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut line = serde_json::to_vec(value)?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await?;
    Ok(())
}

/// Read exactly one JSON line. A clean close before any bytes is `Eof`.
pub(crate) async fn read_value<R, T>(reader: &mut R) -> Result<T, RpcError>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    let mut line = String::new();
    let n = reader.read_line(&mut line).await?;
    if n == 0 {
        return Err(RpcError::Eof);
    }
    Ok(serde_json::from_str(line.trim_end())?)
}
