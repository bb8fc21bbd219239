//! Endpoint registry and supervisor command surface.
//!
//! The controller is the single point of truth for which daemons are in use
//! and by how many sessions. Connections are shared: the first `connect` for
//! an endpoint opens the link and runs the initial inventory refresh, later
//! `connect`s bump a refcount, and the matching `disconnect`s tear the link
//! down when the count reaches zero.
//!
//! Stats feeds are refcounted the same way, but they are fire-and-forget
//! streams rather than request/reply channels: the first subscriber spawns a
//! reader task that forwards every telemetry message, tagged with its origin
//! endpoint, into the sink handed over by the hub.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Map, Value, json};
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

use crate::rpc::{CallError, CommandResponse, Connector, RpcLink, SocketInfo, WatcherInfo};
use crate::stats::StatEvent;

/// Progress of an in-flight connection attempt, observed by concurrent
/// `connect` callers for the same endpoint.
#[derive(Debug, Clone)]
enum ConnectProgress {
    InFlight,
    Connected,
    Failed(String),
}

enum Slot {
    /// First caller is still connecting; waiters share its outcome.
    Pending(watch::Receiver<ConnectProgress>),
    Ready { link: Arc<RpcLink>, refs: usize },
}

struct StatsFeed {
    refs: usize,
    reader: JoinHandle<()>,
}

pub struct Controller {
    connector: Arc<dyn Connector>,
    clients: Mutex<HashMap<String, Slot>>,
    stats_feeds: Mutex<HashMap<String, StatsFeed>>,
}

/// Endpoints are compared as exact strings after trimming whitespace and any
/// trailing slash.
pub fn normalize_endpoint(endpoint: &str) -> String {
    endpoint.trim().trim_end_matches('/').to_string()
}

impl Controller {
    pub fn new(connector: Arc<dyn Connector>) -> Arc<Self> {
        Arc::new(Self {
            connector,
            clients: Mutex::new(HashMap::new()),
            stats_feeds: Mutex::new(HashMap::new()),
        })
    }

    /// Connect to `endpoint`, sharing any existing link.
    ///
    /// A new link is registered only after its initial inventory refresh
    /// succeeds; on failure nothing is registered and every concurrent caller
    /// observes the same error. Exactly one underlying connection attempt is
    /// made however many callers race.
    pub async fn connect(&self, endpoint: &str) -> Result<Arc<RpcLink>, CallError> {
        let endpoint = normalize_endpoint(endpoint);
        loop {
            let mut rx = {
                let mut clients = self.clients.lock().await;
                match clients.get_mut(&endpoint) {
                    Some(Slot::Ready { link, refs }) => {
                        *refs += 1;
                        debug!(endpoint, refs = *refs, "sharing existing connection");
                        return Ok(link.clone());
                    }
                    Some(Slot::Pending(rx)) => rx.clone(),
                    None => {
                        let (tx, rx) = watch::channel(ConnectProgress::InFlight);
                        clients.insert(endpoint.clone(), Slot::Pending(rx));
                        drop(clients);
                        return self.establish(&endpoint, tx).await;
                    }
                }
            };

            // Waiter path: suspend until the first caller resolves, then
            // share its outcome. A failure is final for waiters too.
            loop {
                let progress = rx.borrow_and_update().clone();
                match progress {
                    ConnectProgress::InFlight => {
                        if rx.changed().await.is_err() {
                            break;
                        }
                    }
                    ConnectProgress::Failed(reason) => {
                        return Err(CallError::ConnectFailed {
                            endpoint: endpoint.clone(),
                            reason,
                        });
                    }
                    ConnectProgress::Connected => break,
                }
            }
            // Re-enter the registry: the slot is Ready now (or was torn down
            // in the meantime, in which case this caller starts fresh).
        }
    }

    async fn establish(
        &self,
        endpoint: &str,
        tx: watch::Sender<ConnectProgress>,
    ) -> Result<Arc<RpcLink>, CallError> {
        let attempt = async {
            let transport = self.connector.connect(endpoint).await?;
            let link = Arc::new(RpcLink::new(endpoint.to_string(), transport));
            // Initial inventory; a failure here aborts the registration.
            link.refresh_watchers().await?;
            Ok::<_, CallError>(link)
        }
        .await;

        let mut clients = self.clients.lock().await;
        match attempt {
            Ok(link) => {
                clients.insert(
                    endpoint.to_string(),
                    Slot::Ready {
                        link: link.clone(),
                        refs: 1,
                    },
                );
                let _ = tx.send(ConnectProgress::Connected);
                info!(endpoint, "connected");
                Ok(link)
            }
            Err(err) => {
                clients.remove(endpoint);
                let _ = tx.send(ConnectProgress::Failed(err.to_string()));
                warn!(endpoint, error = %err, "connection failed");
                Err(err)
            }
        }
    }

    /// Drop one reference to `endpoint`; tears the link down at zero.
    /// Unknown endpoints are a no-op.
    pub async fn disconnect(&self, endpoint: &str) {
        let endpoint = normalize_endpoint(endpoint);
        let mut clients = self.clients.lock().await;
        let remove = match clients.get_mut(&endpoint) {
            Some(Slot::Ready { refs, .. }) => {
                *refs -= 1;
                debug!(endpoint, refs = *refs, "disconnect");
                *refs == 0
            }
            _ => false,
        };
        if remove {
            // Teardown is dropping the transport: nothing here blocks on
            // network I/O.
            clients.remove(&endpoint);
            info!(endpoint, "last reference dropped, link closed");
        }
    }

    /// Non-blocking lookup of the live link for `endpoint`.
    pub async fn get_client(&self, endpoint: &str) -> Option<Arc<RpcLink>> {
        let endpoint = normalize_endpoint(endpoint);
        match self.clients.lock().await.get(&endpoint) {
            Some(Slot::Ready { link, .. }) => Some(link.clone()),
            _ => None,
        }
    }

    async fn client(&self, endpoint: &str) -> Result<Arc<RpcLink>, CallError> {
        self.get_client(endpoint)
            .await
            .ok_or_else(|| CallError::NotConnected {
                endpoint: normalize_endpoint(endpoint),
            })
    }

    // ---- remote operations -------------------------------------------------

    /// Current pids of one watcher.
    pub async fn get_pids(&self, name: &str, endpoint: &str) -> Result<Vec<u64>, CallError> {
        let client = self.client(endpoint).await?;
        let res = client.call("list", args(&[("name", json!(name))])).await?;
        let pids = res
            .get("pids")
            .and_then(Value::as_array)
            .map(|pids| pids.iter().filter_map(Value::as_u64).collect())
            .unwrap_or_default();
        Ok(pids)
    }

    /// Socket inventory, served from the link cache unless it is empty or a
    /// reload is forced.
    pub async fn get_sockets(
        &self,
        endpoint: &str,
        force_reload: bool,
    ) -> Result<Vec<SocketInfo>, CallError> {
        let client = self.client(endpoint).await?;
        let cached = client.sockets();
        if cached.is_empty() || force_reload {
            client.refresh_sockets().await
        } else {
            Ok(cached)
        }
    }

    pub async fn get_global_options(&self, endpoint: &str) -> Result<Map<String, Value>, CallError> {
        let client = self.client(endpoint).await?;
        let res = client.call("globaloptions", Map::new()).await?;
        Ok(res
            .get("options")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default())
    }

    /// Cached watcher inventory of one connected endpoint.
    pub async fn get_watchers(&self, endpoint: &str) -> Result<Vec<WatcherInfo>, CallError> {
        Ok(self.client(endpoint).await?.watchers())
    }

    pub async fn incr_proc(&self, name: &str, endpoint: &str) -> Result<CommandResponse, CallError> {
        let client = self.client(endpoint).await?;
        let res = client.call("incr", args(&[("name", json!(name))])).await?;
        client.refresh_watchers().await?;
        Ok(res)
    }

    pub async fn decr_proc(&self, name: &str, endpoint: &str) -> Result<CommandResponse, CallError> {
        let client = self.client(endpoint).await?;
        let res = client.call("decr", args(&[("name", json!(name))])).await?;
        client.refresh_watchers().await?;
        Ok(res)
    }

    /// Kill one process of a watcher (SIGKILL, whole process group), then
    /// refresh the inventory.
    pub async fn kill_process(
        &self,
        name: &str,
        pid: u64,
        endpoint: &str,
    ) -> Result<CommandResponse, CallError> {
        let client = self.client(endpoint).await?;
        let res = client
            .call(
                "signal",
                args(&[
                    ("name", json!(name)),
                    ("pid", json!(pid)),
                    ("signum", json!(9)),
                    ("recursive", json!(true)),
                ]),
            )
            .await?;
        client.refresh_watchers().await?;
        Ok(res)
    }

    /// Read the watcher status and issue the opposite transition: `stop` if
    /// active, `start` otherwise. The client is resolved once and reused for
    /// both calls.
    pub async fn switch_status(&self, name: &str, endpoint: &str) -> Result<CommandResponse, CallError> {
        let client = self.client(endpoint).await?;
        let res = client.call("status", args(&[("name", json!(name))])).await?;
        let command = match res.get("status").and_then(Value::as_str) {
            Some("active") => "stop",
            _ => "start",
        };
        client.call(command, args(&[("name", json!(name))])).await
    }

    /// Create a watcher and, only if creation succeeded, apply the normalized
    /// option set and refresh the inventory.
    pub async fn add_watcher(
        &self,
        name: &str,
        endpoint: &str,
        cmd: &str,
        options: AddWatcherOptions,
    ) -> Result<CommandResponse, CallError> {
        let client = self.client(endpoint).await?;
        client
            .call("add", args(&[("name", json!(name)), ("cmd", json!(cmd))]))
            .await?;

        let normalized = json!({
            "numprocesses": options.numprocesses(),
            "working_dir": options.working_dir,
            "shell": options.shell(),
        });
        let res = client
            .call(
                "set",
                args(&[("name", json!(name)), ("options", normalized)]),
            )
            .await?;
        client.refresh_watchers().await?;
        Ok(res)
    }

    // ---- stats feeds -------------------------------------------------------

    /// Take one reference on the telemetry feed of `endpoint`; the first
    /// reference spawns the reader task.
    ///
    /// Streaming is fire-and-forget: a feed that fails to open is logged and
    /// simply delivers nothing.
    pub async fn connect_stats_endpoint(
        &self,
        endpoint: &str,
        sink: mpsc::UnboundedSender<StatEvent>,
    ) {
        let endpoint = normalize_endpoint(endpoint);
        let mut feeds = self.stats_feeds.lock().await;
        if let Some(feed) = feeds.get_mut(&endpoint) {
            feed.refs += 1;
            debug!(endpoint, refs = feed.refs, "sharing stats feed");
            return;
        }

        let connector = self.connector.clone();
        let feed_endpoint = endpoint.clone();
        let reader = tokio::spawn(async move {
            let mut stream = match connector.open_stats_feed(&feed_endpoint).await {
                Ok(stream) => stream,
                Err(err) => {
                    warn!(endpoint = %feed_endpoint, error = %err, "stats feed failed to open");
                    return;
                }
            };
            while let Some(message) = stream.next().await {
                let event = StatEvent {
                    endpoint: feed_endpoint.clone(),
                    watcher: message.watcher,
                    pid: message.pid,
                    stat: message.stat,
                };
                if sink.send(event).is_err() {
                    break;
                }
            }
            debug!(endpoint = %feed_endpoint, "stats feed ended");
        });
        feeds.insert(endpoint.clone(), StatsFeed { refs: 1, reader });
        info!(endpoint, "stats feed opened");
    }

    /// Drop one reference on the feed; the last reference aborts the reader.
    pub async fn disconnect_stats_endpoint(&self, endpoint: &str) {
        let endpoint = normalize_endpoint(endpoint);
        let mut feeds = self.stats_feeds.lock().await;
        let remove = match feeds.get_mut(&endpoint) {
            Some(feed) => {
                feed.refs -= 1;
                feed.refs == 0
            }
            None => false,
        };
        if remove && let Some(feed) = feeds.remove(&endpoint) {
            feed.reader.abort();
            info!(endpoint, "stats feed closed");
        }
    }

    /// Number of live telemetry feeds.
    pub async fn active_stats_feeds(&self) -> usize {
        self.stats_feeds.lock().await.len()
    }
}

/// Raw form input for `add_watcher`, normalized before the `set` call.
#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct AddWatcherOptions {
    pub numprocesses: Option<String>,
    pub working_dir: Option<String>,
    /// Checkbox-style flag; only the literal `"on"` enables shell mode.
    pub shell: Option<String>,
}

impl AddWatcherOptions {
    fn numprocesses(&self) -> u64 {
        self.numprocesses
            .as_deref()
            .and_then(|n| n.parse().ok())
            .unwrap_or(5)
    }

    fn shell(&self) -> bool {
        self.shell.as_deref() == Some("on")
    }
}

fn args(pairs: &[(&str, Value)]) -> Map<String, Value> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_endpoint() {
        assert_eq!(normalize_endpoint(" tcp://h:1/ "), "tcp://h:1");
        assert_eq!(normalize_endpoint("tcp://h:1"), "tcp://h:1");
    }

    #[test]
    fn test_add_watcher_option_defaults() {
        let opts = AddWatcherOptions::default();
        assert_eq!(opts.numprocesses(), 5);
        assert!(!opts.shell());

        let opts = AddWatcherOptions {
            numprocesses: Some("3".to_string()),
            working_dir: Some("/tmp".to_string()),
            shell: Some("on".to_string()),
        };
        assert_eq!(opts.numprocesses(), 3);
        assert!(opts.shell());
    }
}
