//! Multicast auto-discovery of daemon endpoints.
//!
//! A single task probes the configured multicast group on a fixed period and
//! listens continuously for replies. Daemons answer with a JSON object
//! carrying their command endpoint; a wildcard host is rewritten to the
//! responder's source address so the advertised endpoint is reachable from
//! here. Discovery is best-effort: silence is not an error.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Probe payload: a JSON empty string.
const PROBE: &[u8] = b"\"\"";

/// Probe cycles between full resets of the discovered set, so daemons that
/// went away eventually drop off the list.
const RESET_CYCLES: u32 = 30;

#[derive(Debug, Deserialize)]
struct DiscoveryReply {
    #[serde(default)]
    endpoint: String,
}

/// Live, deduplicated view of daemons answering multicast probes.
pub struct DiscoveryService {
    multicast_addr: SocketAddr,
    probe_interval: Duration,
    endpoints: Mutex<HashSet<String>>,
}

impl DiscoveryService {
    /// `multicast_endpoint` is a `udp://host:port` group address.
    pub fn new(multicast_endpoint: &str, probe_interval: Duration) -> Result<Arc<Self>> {
        let hostport = multicast_endpoint
            .strip_prefix("udp://")
            .ok_or_else(|| anyhow!("multicast endpoint must be udp://host:port"))?;
        let multicast_addr: SocketAddr = hostport
            .parse()
            .with_context(|| format!("parsing multicast endpoint {multicast_endpoint}"))?;
        Ok(Arc::new(Self {
            multicast_addr,
            probe_interval,
            endpoints: Mutex::new(HashSet::new()),
        }))
    }

    /// Spawn the probe/listen loop.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let service = self.clone();
        tokio::spawn(async move {
            if let Err(err) = service.run().await {
                warn!(error = %err, "discovery loop stopped");
            }
        })
    }

    async fn run(&self) -> Result<()> {
        let socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .context("binding discovery socket")?;
        socket.set_multicast_ttl_v4(255).ok();
        info!(multicast = %self.multicast_addr, "discovery probing started");

        let mut ticker = tokio::time::interval(self.probe_interval);
        let mut cycles = 0u32;
        let mut buf = [0u8; 1024];
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    cycles += 1;
                    self.start_cycle(cycles);
                    if let Err(err) = socket.send_to(PROBE, self.multicast_addr).await {
                        debug!(error = %err, "discovery probe failed");
                    }
                }
                received = socket.recv_from(&mut buf) => {
                    match received {
                        Ok((len, source)) => self.handle_reply(&buf[..len], source),
                        Err(err) => debug!(error = %err, "discovery read failed"),
                    }
                }
            }
        }
    }

    /// Begin probe cycle `cycles`: on every `RESET_CYCLES`th cycle the
    /// discovered set is cleared before re-probing, so daemons that stopped
    /// answering age out.
    fn start_cycle(&self, cycles: u32) {
        if cycles % RESET_CYCLES == 0 {
            self.endpoints.lock().expect("discovery lock poisoned").clear();
            debug!("discovered endpoint set reset");
        }
    }

    /// Parse one reply datagram and record its endpoint.
    fn handle_reply(&self, payload: &[u8], source: SocketAddr) {
        let reply: DiscoveryReply = match serde_json::from_slice(payload) {
            Ok(reply) => reply,
            Err(err) => {
                debug!(%source, error = %err, "ignoring malformed discovery reply");
                return;
            }
        };
        if reply.endpoint.is_empty() {
            return;
        }

        // A daemon bound to every interface advertises the wildcard address;
        // substitute the address it actually answered from.
        let endpoint = if reply.endpoint.starts_with("tcp://") {
            reply
                .endpoint
                .replace("0.0.0.0", &source.ip().to_string())
        } else {
            reply.endpoint
        };

        let mut endpoints = self.endpoints.lock().expect("discovery lock poisoned");
        if endpoints.insert(endpoint.clone()) {
            info!(endpoint, %source, "discovered endpoint");
        }
    }

    /// Atomic snapshot of the discovered set.
    pub fn endpoints(&self) -> Vec<String> {
        self.endpoints
            .lock()
            .expect("discovery lock poisoned")
            .iter()
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> Arc<DiscoveryService> {
        DiscoveryService::new("udp://237.219.251.97:12027", Duration::from_secs(10)).unwrap()
    }

    fn source(ip: &str) -> SocketAddr {
        format!("{ip}:9999").parse().unwrap()
    }

    #[test]
    fn test_reply_recorded_once() {
        let svc = service();
        let reply = br#"{"endpoint": "tcp://10.0.0.5:5557"}"#;
        svc.handle_reply(reply, source("10.0.0.5"));
        svc.handle_reply(reply, source("10.0.0.5"));
        assert_eq!(svc.endpoints(), vec!["tcp://10.0.0.5:5557".to_string()]);
    }

    #[test]
    fn test_wildcard_host_rewritten_to_source() {
        let svc = service();
        svc.handle_reply(br#"{"endpoint": "tcp://0.0.0.0:5557"}"#, source("10.0.0.5"));
        assert_eq!(svc.endpoints(), vec!["tcp://10.0.0.5:5557".to_string()]);
    }

    #[test]
    fn test_garbage_and_empty_replies_ignored() {
        let svc = service();
        svc.handle_reply(b"not json", source("10.0.0.5"));
        svc.handle_reply(b"{}", source("10.0.0.5"));
        svc.handle_reply(br#"{"other": 1}"#, source("10.0.0.5"));
        assert!(svc.endpoints().is_empty());
    }

    #[test]
    fn test_set_resets_on_schedule() {
        let svc = service();
        svc.handle_reply(br#"{"endpoint": "tcp://10.0.0.5:5557"}"#, source("10.0.0.5"));

        for cycle in 1..RESET_CYCLES {
            svc.start_cycle(cycle);
        }
        assert_eq!(svc.endpoints().len(), 1);

        svc.start_cycle(RESET_CYCLES);
        assert!(svc.endpoints().is_empty());

        // A daemon still answering is re-discovered on the next reply.
        svc.handle_reply(br#"{"endpoint": "tcp://10.0.0.5:5557"}"#, source("10.0.0.5"));
        assert_eq!(svc.endpoints().len(), 1);
    }

    #[test]
    fn test_rejects_bad_multicast_endpoint() {
        assert!(DiscoveryService::new("tcp://1.2.3.4:1", Duration::from_secs(1)).is_err());
        assert!(DiscoveryService::new("udp://nonsense", Duration::from_secs(1)).is_err());
    }
}
