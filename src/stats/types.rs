//! Telemetry event shapes and the fan-out routing table.

use std::collections::HashSet;

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One telemetry event, tagged with the stats endpoint it came from.
#[derive(Debug, Clone)]
pub struct StatEvent {
    pub endpoint: String,
    pub watcher: String,
    /// `None` means the event aggregates across every pid of the watcher.
    pub pid: Option<u64>,
    pub stat: Map<String, Value>,
}

/// A routed message ready for one browser session.
///
/// `channel` follows the `stats-<watcher>[-<pid>]-<endpoint-token>` /
/// `socket-stats[-fds|-<fd>]-<endpoint-token>` addressing patterns; the
/// token is the base64 of the endpoint string.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Delivery {
    pub channel: String,
    pub payload: Map<String, Value>,
}

/// What one browser session is watching. Replaced wholesale on every
/// `get_stats` request, never merged.
#[derive(Debug, Clone, Default)]
pub struct Subscription {
    /// Watcher names followed at aggregate granularity.
    pub watchers: HashSet<String>,
    /// Watcher names followed down to individual pids.
    pub watchers_with_pids: HashSet<String>,
    /// Command endpoints the session is connected to.
    pub endpoints: HashSet<String>,
    /// Stats endpoints the session draws telemetry from.
    pub stats_endpoints: HashSet<String>,
}

/// Browser request opening (or replacing) a stats subscription.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GetStatsRequest {
    #[serde(default)]
    pub watchers: Vec<String>,
    /// `(watcher, endpoint)` pairs to follow per pid; these also get an
    /// initial pid (or socket fd) snapshot.
    #[serde(default, rename = "watchersWithPids")]
    pub watchers_with_pids: Vec<(String, String)>,
    #[serde(default)]
    pub endpoints: Vec<String>,
    #[serde(default)]
    pub stats_endpoints: Vec<String>,
}

/// Base64 token standing in for an endpoint inside channel names.
pub fn endpoint_token(endpoint: &str) -> String {
    BASE64.encode(endpoint)
}

/// The watcher name the daemon uses for its own self-monitoring feed; it is
/// always implicitly available to every subscriber.
const SELF_WATCHER: &str = "circus";

const PROC_FIELDS: [&str; 3] = ["mem", "cpu", "age"];
const SOCKET_SUMMARY_FIELDS: [&str; 2] = ["reads", "addresses"];

/// Decide whether `event` reaches a session with `sub`, and as what.
///
/// The branch order is contractual: the self-monitoring alias is resolved
/// before the aggregate/pid split, and every branch projects its own field
/// subset. Returning extra fields would be as wrong as delivering to a
/// non-matching session.
pub fn route_event(sub: &Subscription, event: &StatEvent) -> Option<Delivery> {
    let token = endpoint_token(&event.endpoint);

    if event.watcher == "sockets" {
        // Socket telemetry: fd-scoped for explicit socket subscribers,
        // summary for coarse ones.
        if sub.watchers_with_pids.contains("sockets")
            && let Some(fd) = event.stat.get("fd")
        {
            return Some(Delivery {
                channel: format!("socket-stats-{}-{token}", value_token(fd)),
                payload: event.stat.clone(),
            });
        }
        if sub.watchers.contains("sockets") && event.stat.contains_key("addresses") {
            return Some(Delivery {
                channel: format!("socket-stats-{token}"),
                payload: project(&event.stat, &SOCKET_SUMMARY_FIELDS),
            });
        }
        return None;
    }

    let available = |name: &str| {
        sub.watchers.contains(name)
            || sub.watchers_with_pids.contains(name)
            || name == SELF_WATCHER
    };
    if !available(&event.watcher) {
        return None;
    }

    // The daemon's own feed reports per-watcher lines under its own name;
    // when the named watcher is subscribed, deliver it as that watcher's
    // aggregate.
    if event.watcher == SELF_WATCHER
        && let Some(name) = event.stat.get("name").and_then(Value::as_str)
        && available(name)
    {
        return Some(Delivery {
            channel: format!("stats-{name}-{token}"),
            payload: project(&event.stat, &PROC_FIELDS),
        });
    }

    match event.pid {
        None => Some(Delivery {
            channel: format!("stats-{}-{token}", event.watcher),
            payload: project(&event.stat, &PROC_FIELDS),
        }),
        Some(pid) if sub.watchers_with_pids.contains(&event.watcher) => Some(Delivery {
            channel: format!("stats-{}-{pid}-{token}", event.watcher),
            payload: project(&event.stat, &PROC_FIELDS),
        }),
        // A pid-level event for a coarsely-subscribed watcher is dropped.
        Some(_) => None,
    }
}

fn project(stat: &Map<String, Value>, keys: &[&str]) -> Map<String, Value> {
    keys.iter()
        .filter_map(|k| stat.get(*k).map(|v| (k.to_string(), v.clone())))
        .collect()
}

fn value_token(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn stat(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    fn event(watcher: &str, pid: Option<u64>, fields: &[(&str, Value)]) -> StatEvent {
        StatEvent {
            endpoint: "tcp://127.0.0.1:5557".to_string(),
            watcher: watcher.to_string(),
            pid,
            stat: stat(fields),
        }
    }

    fn sub(watchers: &[&str], with_pids: &[&str]) -> Subscription {
        Subscription {
            watchers: watchers.iter().map(|s| s.to_string()).collect(),
            watchers_with_pids: with_pids.iter().map(|s| s.to_string()).collect(),
            ..Subscription::default()
        }
    }

    fn token() -> String {
        endpoint_token("tcp://127.0.0.1:5557")
    }

    #[test]
    fn test_aggregate_event_for_plain_watcher() {
        let ev = event(
            "sleeper",
            None,
            &[("mem", json!(1.2)), ("cpu", json!(0.3)), ("age", json!(40)), ("name", json!("x"))],
        );
        let d = route_event(&sub(&["sleeper"], &[]), &ev).unwrap();
        assert_eq!(d.channel, format!("stats-sleeper-{}", token()));
        // Only the projected fields, nothing else.
        assert_eq!(d.payload.len(), 3);
        assert!(d.payload.contains_key("mem"));
        assert!(!d.payload.contains_key("name"));
    }

    #[test]
    fn test_pid_event_needs_pid_subscription() {
        let ev = event("sleeper", Some(42), &[("mem", json!(1.0)), ("cpu", json!(0.1)), ("age", json!(5))]);

        assert!(route_event(&sub(&["sleeper"], &[]), &ev).is_none());

        let d = route_event(&sub(&[], &["sleeper"]), &ev).unwrap();
        assert_eq!(d.channel, format!("stats-sleeper-42-{}", token()));
    }

    #[test]
    fn test_unwatched_watcher_is_dropped() {
        let ev = event("other", None, &[("mem", json!(1.0))]);
        assert!(route_event(&sub(&["sleeper"], &["web"]), &ev).is_none());
    }

    #[test]
    fn test_self_feed_aliases_to_named_watcher() {
        let ev = event(
            "circus",
            Some(7),
            &[("mem", json!(2.0)), ("cpu", json!(0.5)), ("age", json!(99)), ("name", json!("sleeper"))],
        );
        let d = route_event(&sub(&["sleeper"], &[]), &ev).unwrap();
        // Aliased to the named watcher's aggregate, even though a pid is set.
        assert_eq!(d.channel, format!("stats-sleeper-{}", token()));
        assert_eq!(d.payload.len(), 3);
    }

    #[test]
    fn test_self_feed_unknown_name_falls_through() {
        let ev = event(
            "circus",
            None,
            &[("mem", json!(2.0)), ("cpu", json!(0.5)), ("age", json!(99)), ("name", json!("stranger"))],
        );
        // "circus" itself is always available, so the aggregate branch applies.
        let d = route_event(&sub(&["sleeper"], &[]), &ev).unwrap();
        assert_eq!(d.channel, format!("stats-circus-{}", token()));
    }

    #[test]
    fn test_socket_fd_event() {
        let ev = event(
            "sockets",
            None,
            &[("fd", json!(6)), ("reads", json!(10)), ("addresses", json!(["a"]))],
        );
        let d = route_event(&sub(&[], &["sockets"]), &ev).unwrap();
        assert_eq!(d.channel, format!("socket-stats-6-{}", token()));
        // fd-scoped delivery carries every socket field.
        assert_eq!(d.payload.len(), 3);
    }

    #[test]
    fn test_socket_summary_event() {
        let ev = event(
            "sockets",
            None,
            &[("reads", json!(10)), ("addresses", json!(["a"])), ("extra", json!(1))],
        );
        let d = route_event(&sub(&["sockets"], &[]), &ev).unwrap();
        assert_eq!(d.channel, format!("socket-stats-{}", token()));
        assert_eq!(d.payload.len(), 2);
        assert!(!d.payload.contains_key("extra"));
    }

    #[test]
    fn test_socket_event_without_subscription_is_dropped() {
        let ev = event("sockets", None, &[("reads", json!(10)), ("addresses", json!([]))]);
        assert!(route_event(&sub(&["sleeper"], &[]), &ev).is_none());

        // fd-subscribed but no fd field, and no coarse subscription: dropped.
        let ev = event("sockets", None, &[("reads", json!(10))]);
        assert!(route_event(&sub(&[], &["sockets"]), &ev).is_none());
    }
}
