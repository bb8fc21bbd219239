//! One shared, refcounted connection to a daemon endpoint.

use std::sync::{Arc, RwLock};

use serde_json::{Map, Value};
use tracing::debug;

use super::{CallError, CommandRequest, CommandResponse, Transport};

/// A watcher as reported by the daemon's inventory.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct WatcherInfo {
    pub name: String,
    #[serde(default)]
    pub options: Map<String, Value>,
}

/// A socket as reported by `listsockets`.
pub type SocketInfo = Map<String, Value>;

/// One logical connection to a daemon endpoint.
///
/// The registry hands out one `Arc<RpcLink>` per endpoint; the refcount lives
/// in the registry, not here. The link owns the transport and a cached
/// snapshot of the daemon's watcher and socket inventory. Cache refresh is
/// whole-replace under the write lock: concurrent refreshes may race, last
/// write wins, a failed fetch leaves the cache untouched.
pub struct RpcLink {
    endpoint: String,
    transport: Arc<dyn Transport>,
    watchers: RwLock<Vec<WatcherInfo>>,
    sockets: RwLock<Vec<SocketInfo>>,
}

impl RpcLink {
    pub fn new(endpoint: String, transport: Arc<dyn Transport>) -> Self {
        Self {
            endpoint,
            transport,
            watchers: RwLock::new(Vec::new()),
            sockets: RwLock::new(Vec::new()),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Issue one command; an error-status reply becomes [`CallError::Remote`].
    pub async fn call(&self, command: &str, args: Map<String, Value>) -> Result<CommandResponse, CallError> {
        debug!(endpoint = %self.endpoint, command, "rpc call");
        let response = self.transport.call(CommandRequest::new(command, args)).await?;
        response.into_result()
    }

    /// Re-fetch the watcher inventory from the daemon.
    pub async fn refresh_watchers(&self) -> Result<(), CallError> {
        let res = self.call("watchers", Map::new()).await?;
        let watchers: Vec<WatcherInfo> = res
            .get("watchers")
            .cloned()
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| CallError::Protocol(format!("bad watchers reply: {e}")))?
            .unwrap_or_default();
        *self.watchers.write().expect("watcher cache lock poisoned") = watchers;
        Ok(())
    }

    pub fn watchers(&self) -> Vec<WatcherInfo> {
        self.watchers.read().expect("watcher cache lock poisoned").clone()
    }

    /// Cached socket inventory; empty until [`Self::refresh_sockets`] ran.
    pub fn sockets(&self) -> Vec<SocketInfo> {
        self.sockets.read().expect("socket cache lock poisoned").clone()
    }

    pub async fn refresh_sockets(&self) -> Result<Vec<SocketInfo>, CallError> {
        let res = self.call("listsockets", Map::new()).await?;
        let sockets: Vec<SocketInfo> = res
            .get("sockets")
            .cloned()
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| CallError::Protocol(format!("bad listsockets reply: {e}")))?
            .unwrap_or_default();
        *self.sockets.write().expect("socket cache lock poisoned") = sockets.clone();
        Ok(sockets)
    }
}
