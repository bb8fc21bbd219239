//! Shared test harness: an in-process scripted daemon behind the
//! [`Connector`] seam.
#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use ringmaster::rpc::{
    CallError, CommandRequest, CommandResponse, Connector, StatsMessage, StatsStream, Transport,
};

#[derive(Debug, Clone)]
pub struct WatcherState {
    pub active: bool,
    pub pids: Vec<u64>,
    pub options: Map<String, Value>,
}

#[derive(Debug, Default)]
pub struct DaemonState {
    pub watchers: BTreeMap<String, WatcherState>,
    pub sockets: Vec<Map<String, Value>>,
    /// Every command name received, in order.
    pub commands: Vec<String>,
    next_pid: u64,
}

/// Scripted daemon shared by a [`MockConnector`] and the transports it hands
/// out. State lives behind one mutex so tests can assert on it directly.
pub struct MockDaemon {
    state: Arc<Mutex<DaemonState>>,
    connect_attempts: AtomicUsize,
    fail_connect: Mutex<Option<String>>,
    connect_delay: Mutex<Option<Duration>>,
    stats_feeds: Mutex<Vec<mpsc::UnboundedSender<StatsMessage>>>,
}

impl MockDaemon {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Arc::new(Mutex::new(DaemonState {
                next_pid: 1000,
                ..DaemonState::default()
            })),
            connect_attempts: AtomicUsize::new(0),
            fail_connect: Mutex::new(None),
            connect_delay: Mutex::new(None),
            stats_feeds: Mutex::new(Vec::new()),
        })
    }

    pub fn with_watcher(self: Arc<Self>, name: &str, pids: &[u64]) -> Arc<Self> {
        self.state.lock().unwrap().watchers.insert(
            name.to_string(),
            WatcherState {
                active: true,
                pids: pids.to_vec(),
                options: Map::new(),
            },
        );
        self
    }

    pub fn with_socket(self: Arc<Self>, fd: u64, name: &str) -> Arc<Self> {
        let mut socket = Map::new();
        socket.insert("fd".to_string(), json!(fd));
        socket.insert("name".to_string(), json!(name));
        self.state.lock().unwrap().sockets.push(socket);
        self
    }

    /// Make every future connection attempt fail with `reason`.
    pub fn fail_connections(&self, reason: &str) {
        *self.fail_connect.lock().unwrap() = Some(reason.to_string());
    }

    /// Delay connection attempts, widening the race window for concurrent
    /// connect tests.
    pub fn set_connect_delay(&self, delay: Duration) {
        *self.connect_delay.lock().unwrap() = Some(delay);
    }

    pub fn connect_attempts(&self) -> usize {
        self.connect_attempts.load(Ordering::SeqCst)
    }

    pub fn command_log(&self) -> Vec<String> {
        self.state.lock().unwrap().commands.clone()
    }

    pub fn watcher(&self, name: &str) -> Option<WatcherState> {
        self.state.lock().unwrap().watchers.get(name).cloned()
    }

    pub fn watcher_names(&self) -> Vec<String> {
        self.state.lock().unwrap().watchers.keys().cloned().collect()
    }

    /// Push one telemetry message into every open stats feed.
    pub fn publish_stat(&self, message: StatsMessage) {
        self.stats_feeds
            .lock()
            .unwrap()
            .retain(|tx| tx.send(message.clone()).is_ok());
    }

    pub fn open_feed_count(&self) -> usize {
        let mut feeds = self.stats_feeds.lock().unwrap();
        feeds.retain(|tx| !tx.is_closed());
        feeds.len()
    }
}

pub struct MockConnector {
    pub daemon: Arc<MockDaemon>,
}

impl MockConnector {
    pub fn new(daemon: Arc<MockDaemon>) -> Arc<Self> {
        Arc::new(Self { daemon })
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, _endpoint: &str) -> Result<Arc<dyn Transport>, CallError> {
        self.daemon.connect_attempts.fetch_add(1, Ordering::SeqCst);
        let delay = *self.daemon.connect_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let failure = self.daemon.fail_connect.lock().unwrap().clone();
        if let Some(reason) = failure {
            return Err(CallError::Protocol(reason));
        }
        Ok(Arc::new(MockTransport {
            state: self.daemon.state.clone(),
        }))
    }

    async fn open_stats_feed(&self, _endpoint: &str) -> Result<StatsStream, CallError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.daemon.stats_feeds.lock().unwrap().push(tx);
        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }
}

struct MockTransport {
    state: Arc<Mutex<DaemonState>>,
}

fn ok(fields: Map<String, Value>) -> CommandResponse {
    CommandResponse {
        status: "ok".to_string(),
        reason: None,
        fields,
    }
}

fn error(reason: &str) -> CommandResponse {
    CommandResponse {
        status: "error".to_string(),
        reason: Some(reason.to_string()),
        fields: Map::new(),
    }
}

fn fields(pairs: &[(&str, Value)]) -> Map<String, Value> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

#[async_trait]
impl Transport for MockTransport {
    async fn call(&self, request: CommandRequest) -> Result<CommandResponse, CallError> {
        let mut state = self.state.lock().unwrap();
        state.commands.push(request.command.clone());
        let name = request
            .args
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let reply = match request.command.as_str() {
            "watchers" => {
                let watchers: Vec<Value> = state
                    .watchers
                    .iter()
                    .map(|(n, w)| json!({"name": n, "options": w.options}))
                    .collect();
                ok(fields(&[("watchers", json!(watchers))]))
            }
            "list" => match state.watchers.get(&name) {
                Some(w) => ok(fields(&[("pids", json!(w.pids))])),
                None => error(&format!("program {name} not found")),
            },
            "listsockets" => ok(fields(&[("sockets", json!(state.sockets))])),
            "globaloptions" => ok(fields(&[("options", json!({"check_delay": 5}))])),
            "add" => {
                if state.watchers.contains_key(&name) {
                    error(&format!("program {name} already exists"))
                } else {
                    state.watchers.insert(
                        name.clone(),
                        WatcherState {
                            active: false,
                            pids: Vec::new(),
                            options: Map::new(),
                        },
                    );
                    ok(Map::new())
                }
            }
            "set" => {
                let options = request
                    .args
                    .get("options")
                    .and_then(Value::as_object)
                    .cloned()
                    .unwrap_or_default();
                match state.watchers.get_mut(&name) {
                    Some(w) => {
                        w.options.extend(options);
                        ok(Map::new())
                    }
                    None => error(&format!("program {name} not found")),
                }
            }
            "incr" => {
                let pid = {
                    state.next_pid += 1;
                    state.next_pid
                };
                match state.watchers.get_mut(&name) {
                    Some(w) => {
                        w.pids.push(pid);
                        ok(fields(&[("numprocesses", json!(w.pids.len()))]))
                    }
                    None => error(&format!("program {name} not found")),
                }
            }
            "decr" => match state.watchers.get_mut(&name) {
                Some(w) => {
                    w.pids.pop();
                    ok(fields(&[("numprocesses", json!(w.pids.len()))]))
                }
                None => error(&format!("program {name} not found")),
            },
            "signal" => {
                let pid = request.args.get("pid").and_then(Value::as_u64);
                match (state.watchers.get_mut(&name), pid) {
                    (Some(w), Some(pid)) if w.pids.contains(&pid) => {
                        w.pids.retain(|p| *p != pid);
                        ok(Map::new())
                    }
                    (Some(_), Some(pid)) => error(&format!("process {pid} not found")),
                    _ => error(&format!("program {name} not found")),
                }
            }
            "status" => match state.watchers.get(&name) {
                Some(w) if w.active => ok(fields(&[("status", json!("active"))])),
                Some(_) => ok(fields(&[("status", json!("stopped"))])),
                None => error(&format!("program {name} not found")),
            },
            "start" => match state.watchers.get_mut(&name) {
                Some(w) => {
                    w.active = true;
                    ok(Map::new())
                }
                None => error(&format!("program {name} not found")),
            },
            "stop" => match state.watchers.get_mut(&name) {
                Some(w) => {
                    w.active = false;
                    ok(Map::new())
                }
                None => error(&format!("program {name} not found")),
            },
            other => error(&format!("unknown command {other}")),
        };
        Ok(reply)
    }
}
