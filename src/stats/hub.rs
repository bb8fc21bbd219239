//! Subscription hub fanning telemetry out to browser sessions.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::json;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, warn};

use crate::controller::{Controller, normalize_endpoint};

use super::types::{Delivery, GetStatsRequest, StatEvent, Subscription, endpoint_token, route_event};

struct SessionChannel {
    tx: mpsc::UnboundedSender<Delivery>,
    subscription: Subscription,
}

/// Routes every inbound [`StatEvent`] to the sessions whose subscription
/// matches it, and owns the per-stats-endpoint participant sets.
///
/// Feeds themselves live in the [`Controller`]; the hub takes and releases
/// references on them as sessions come and go.
pub struct StatsHub {
    controller: Arc<Controller>,
    /// Stats endpoint -> subscribed session ids. Entries are removed as soon
    /// as they empty: a session is subscribed iff it is present.
    participants: Mutex<HashMap<String, HashSet<String>>>,
    sessions: DashMap<String, SessionChannel>,
    events_tx: mpsc::UnboundedSender<StatEvent>,
}

impl StatsHub {
    /// Build the hub and spawn its dispatch loop.
    pub fn new(controller: Arc<Controller>) -> Arc<Self> {
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let hub = Arc::new(Self {
            controller,
            participants: Mutex::new(HashMap::new()),
            sessions: DashMap::new(),
            events_tx,
        });

        let dispatcher = hub.clone();
        tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                dispatcher.dispatch(event).await;
            }
        });
        hub
    }

    /// Register a browser session; delivered messages arrive on the returned
    /// receiver.
    pub fn register_session(&self, session_id: &str) -> mpsc::UnboundedReceiver<Delivery> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.sessions.insert(
            session_id.to_string(),
            SessionChannel {
                tx,
                subscription: Subscription::default(),
            },
        );
        info!(session_id, "stats session registered");
        rx
    }

    /// Open or replace the session's subscription.
    ///
    /// Snapshot messages (current pid / socket-fd lists for every
    /// watcher+endpoint pair) are resolved and delivered first, then the
    /// session joins the live fan-out. The new subscription replaces the old
    /// one wholesale; stats-endpoint references are diffed so an endpoint
    /// watched across the replacement keeps exactly one reference.
    pub async fn get_stats(&self, session_id: &str, request: GetStatsRequest) {
        let mut subscription = self.build_subscription(&request).await;

        // Snapshots are resolved and sent before the session becomes a live
        // participant, so a client always sees its baseline before any delta.
        let snapshots = self.resolve_snapshots(&request).await;
        {
            let Some(session) = self.sessions.get(session_id) else {
                warn!(session_id, "get_stats for unknown session");
                return;
            };
            for message in snapshots {
                let _ = session.tx.send(message);
            }
        }

        let current = subscription.stats_endpoints.clone();
        let previous = match self.sessions.get_mut(session_id) {
            Some(mut session) => {
                std::mem::swap(&mut session.subscription, &mut subscription);
                subscription
            }
            None => return,
        };

        for endpoint in current.difference(&previous.stats_endpoints) {
            self.join(session_id, endpoint).await;
        }
        for endpoint in previous.stats_endpoints.difference(&current) {
            self.leave(session_id, endpoint).await;
        }
    }

    /// Drop the session and every feed reference it holds. Purely local
    /// bookkeeping plus refcount decrements; never blocks on the network.
    pub async fn close_session(&self, session_id: &str) {
        let Some((_, channel)) = self.sessions.remove(session_id) else {
            return;
        };
        for endpoint in &channel.subscription.stats_endpoints {
            self.leave(session_id, endpoint).await;
        }
        info!(session_id, "stats session closed");
    }

    /// Fan one event out to every matching participant of its origin
    /// endpoint.
    pub async fn dispatch(&self, event: StatEvent) {
        let ids: Vec<String> = {
            let participants = self.participants.lock().await;
            match participants.get(&event.endpoint) {
                Some(ids) => ids.iter().cloned().collect(),
                None => return,
            }
        };
        for id in ids {
            if let Some(session) = self.sessions.get(&id)
                && let Some(delivery) = route_event(&session.subscription, &event)
            {
                let _ = session.tx.send(delivery);
            }
        }
    }

    async fn join(&self, session_id: &str, endpoint: &str) {
        self.participants
            .lock()
            .await
            .entry(endpoint.to_string())
            .or_default()
            .insert(session_id.to_string());
        self.controller
            .connect_stats_endpoint(endpoint, self.events_tx.clone())
            .await;
    }

    async fn leave(&self, session_id: &str, endpoint: &str) {
        let mut participants = self.participants.lock().await;
        if let Some(ids) = participants.get_mut(endpoint) {
            ids.remove(session_id);
            if ids.is_empty() {
                participants.remove(endpoint);
            }
        }
        drop(participants);
        self.controller.disconnect_stats_endpoint(endpoint).await;
    }

    /// Build the new subscription, keeping only endpoints the controller has
    /// an active connection for.
    ///
    /// Endpoints are normalized on the way in: participant sets and channel
    /// tokens must use the same key the controller tags events with, or a
    /// trailing-slash spelling would open a feed nobody routes from.
    async fn build_subscription(&self, request: &GetStatsRequest) -> Subscription {
        let mut endpoints = HashSet::new();
        for endpoint in &request.endpoints {
            let endpoint = normalize_endpoint(endpoint);
            if self.controller.get_client(&endpoint).await.is_some() {
                endpoints.insert(endpoint);
            } else {
                debug!(endpoint, "dropping unconnected endpoint from subscription");
            }
        }
        Subscription {
            watchers: request.watchers.iter().cloned().collect(),
            watchers_with_pids: request
                .watchers_with_pids
                .iter()
                .map(|(watcher, _)| watcher.clone())
                .collect(),
            endpoints,
            stats_endpoints: request
                .stats_endpoints
                .iter()
                .map(|e| normalize_endpoint(e))
                .collect(),
        }
    }

    /// Resolve the initial pid / socket-fd lists for every watcher+endpoint
    /// pair. Best-effort per pair: one dead watcher does not block the rest
    /// of the subscription.
    async fn resolve_snapshots(&self, request: &GetStatsRequest) -> Vec<Delivery> {
        let mut messages = Vec::new();
        for (watcher, endpoint) in &request.watchers_with_pids {
            let endpoint = normalize_endpoint(endpoint);
            let token = endpoint_token(&endpoint);
            if watcher == "sockets" {
                match self.controller.get_sockets(&endpoint, false).await {
                    Ok(sockets) => {
                        let fds: Vec<_> = sockets.iter().filter_map(|s| s.get("fd")).collect();
                        messages.push(Delivery {
                            channel: format!("socket-stats-fds-{token}"),
                            payload: [("fds".to_string(), json!(fds))].into_iter().collect(),
                        });
                    }
                    Err(err) => {
                        warn!(endpoint, error = %err, "socket snapshot failed");
                    }
                }
            } else {
                match self.controller.get_pids(watcher, &endpoint).await {
                    Ok(pids) => messages.push(Delivery {
                        channel: format!("stats-{watcher}-pids-{token}"),
                        payload: [("pids".to_string(), json!(pids))].into_iter().collect(),
                    }),
                    Err(err) => {
                        warn!(watcher, endpoint, error = %err, "pid snapshot failed");
                    }
                }
            }
        }
        messages
    }
}
