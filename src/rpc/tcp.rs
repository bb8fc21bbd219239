//! Newline-delimited JSON transport over TCP.
//!
//! Commands share one framed stream behind a mutex, which serializes the
//! request/reply round-trips of a link. The stats feed is a second, read-only
//! connection opened against the daemon's stats endpoint.

use std::sync::Arc;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::codec::{Framed, LinesCodec};
use tracing::{debug, warn};

use super::{
    CallError, CommandRequest, CommandResponse, Connector, StatsMessage, StatsStream, Transport,
    tcp_host_port,
};

/// Connector for real daemons reachable over `tcp://host:port` endpoints.
#[derive(Debug, Default)]
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, endpoint: &str) -> Result<Arc<dyn Transport>, CallError> {
        let addr = tcp_host_port(endpoint)?;
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| CallError::ConnectFailed {
                endpoint: endpoint.to_string(),
                reason: e.to_string(),
            })?;
        debug!(endpoint, "command channel connected");
        Ok(Arc::new(TcpTransport {
            framed: Mutex::new(Framed::new(stream, LinesCodec::new())),
        }))
    }

    async fn open_stats_feed(&self, endpoint: &str) -> Result<StatsStream, CallError> {
        let addr = tcp_host_port(endpoint)?;
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| CallError::ConnectFailed {
                endpoint: endpoint.to_string(),
                reason: e.to_string(),
            })?;
        let mut framed = Framed::new(stream, LinesCodec::new());

        // Topic subscription, then the feed is read-only.
        let subscribe = json!({ "topic": "stat." }).to_string();
        framed
            .send(subscribe)
            .await
            .map_err(|e| CallError::Protocol(e.to_string()))?;
        debug!(endpoint, "stats feed subscribed");

        let messages = framed.filter_map(|line| async move {
            match line {
                Ok(line) => match serde_json::from_str::<StatsMessage>(&line) {
                    Ok(msg) => Some(msg),
                    Err(e) => {
                        warn!(error = %e, "dropping malformed stats frame");
                        None
                    }
                },
                // Read error ends the feed; the hub refcounting decides
                // whether anyone cares.
                Err(e) => {
                    warn!(error = %e, "stats feed read error");
                    None
                }
            }
        });
        Ok(Box::pin(messages))
    }
}

struct TcpTransport {
    framed: Mutex<Framed<TcpStream, LinesCodec>>,
}

#[async_trait]
impl Transport for TcpTransport {
    async fn call(&self, request: CommandRequest) -> Result<CommandResponse, CallError> {
        let line = serde_json::to_string(&request)
            .map_err(|e| CallError::Protocol(e.to_string()))?;

        let mut framed = self.framed.lock().await;
        framed
            .send(line)
            .await
            .map_err(|e| CallError::Protocol(e.to_string()))?;
        let reply = framed
            .next()
            .await
            .ok_or_else(|| CallError::Protocol("connection closed mid-call".to_string()))?
            .map_err(|e| CallError::Protocol(e.to_string()))?;

        serde_json::from_str(&reply).map_err(|e| CallError::Protocol(format!("bad reply: {e}")))
    }
}
