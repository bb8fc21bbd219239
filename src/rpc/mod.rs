//! RPC plumbing for talking to supervisor daemons.
//!
//! This module defines the wire shapes shared with the daemon, the
//! `Transport`/`Connector` traits that abstract the underlying connection,
//! and the [`RpcLink`] wrapper that owns one connection plus its cached
//! inventory.
//!
//! The daemon is a black-box peer: the only contract is the request/reply
//! command channel and the out-of-band stats feed. Tests substitute an
//! in-process implementation of [`Connector`].

mod link;
mod tcp;

pub use link::{RpcLink, SocketInfo, WatcherInfo};
pub use tcp::TcpConnector;

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio_stream::Stream;

/// Error raised by a remote command call or by the transport beneath it.
#[derive(Debug, Error)]
pub enum CallError {
    /// The daemon answered with `status: "error"`.
    #[error("{reason}")]
    Remote { reason: String },

    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),

    /// A frame that did not parse, or a stream that ended mid-reply.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("impossible to connect to {endpoint}: {reason}")]
    ConnectFailed { endpoint: String, reason: String },

    #[error("no active connection to {endpoint}")]
    NotConnected { endpoint: String },
}

/// One command round-trip to the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandRequest {
    pub command: String,
    #[serde(default)]
    pub args: Map<String, Value>,
}

impl CommandRequest {
    pub fn new(command: &str, args: Map<String, Value>) -> Self {
        Self {
            command: command.to_string(),
            args,
        }
    }
}

/// Reply to a [`CommandRequest`].
///
/// `status` is `"ok"` or `"error"`; `reason` is present iff the status is
/// `"error"`. Everything else is command-specific and kept as raw fields.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommandResponse {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl CommandResponse {
    pub fn is_ok(&self) -> bool {
        self.status == "ok"
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Turn an error reply into a [`CallError::Remote`].
    pub fn into_result(self) -> Result<CommandResponse, CallError> {
        if self.is_ok() {
            Ok(self)
        } else {
            Err(CallError::Remote {
                reason: self
                    .reason
                    .unwrap_or_else(|| "unknown daemon error".to_string()),
            })
        }
    }
}

/// One telemetry message from a stats feed.
///
/// `pid: None` means the message aggregates over every process of the
/// watcher. `stat` carries at least `mem`/`cpu`/`age` for process watchers,
/// and `fd`/`addresses`/`reads` for socket messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsMessage {
    pub watcher: String,
    #[serde(default)]
    pub pid: Option<u64>,
    #[serde(default)]
    pub stat: Map<String, Value>,
}

/// Stream of telemetry messages from one stats endpoint.
pub type StatsStream = Pin<Box<dyn Stream<Item = StatsMessage> + Send>>;

/// A live request/reply channel to one daemon.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Issue one command and wait for its reply.
    ///
    /// Resolves or fails, never both; a deadline is the caller's business.
    async fn call(&self, request: CommandRequest) -> Result<CommandResponse, CallError>;
}

/// Factory for daemon connections and stats feeds.
///
/// The controller is generic over this seam so tests can drive it against a
/// scripted daemon without touching the network.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a command channel to `endpoint`.
    async fn connect(&self, endpoint: &str) -> Result<Arc<dyn Transport>, CallError>;

    /// Open the fire-and-forget telemetry feed published at `endpoint`.
    async fn open_stats_feed(&self, endpoint: &str) -> Result<StatsStream, CallError>;
}

/// Strip the `tcp://` scheme off an endpoint, leaving `host:port`.
pub(crate) fn tcp_host_port(endpoint: &str) -> Result<&str, CallError> {
    endpoint
        .strip_prefix("tcp://")
        .ok_or_else(|| CallError::Protocol(format!("unsupported endpoint scheme: {endpoint}")))
}
