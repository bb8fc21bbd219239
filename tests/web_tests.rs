//! Command-execution flow of the web layer.

mod common;

use std::sync::Arc;
use std::time::Duration;

use ringmaster::api::{ApiError, AppState, CommandArgs, run_command};
use ringmaster::controller::Controller;
use ringmaster::discovery::DiscoveryService;
use ringmaster::session::{Session, SessionManager};
use ringmaster::stats::StatsHub;

use common::{MockConnector, MockDaemon};

const ENDPOINT: &str = "tcp://127.0.0.1:5555";

fn app_state(daemon: &Arc<MockDaemon>) -> AppState {
    let controller = Controller::new(MockConnector::new(daemon.clone()));
    let hub = StatsHub::new(controller.clone());
    let discovery =
        DiscoveryService::new("udp://237.219.251.97:12027", Duration::from_secs(10)).unwrap();
    AppState::new(controller, hub, discovery, Arc::new(SessionManager::new()))
}

fn args_for(name: &str) -> CommandArgs {
    CommandArgs {
        endpoint: ENDPOINT.to_string(),
        name: name.to_string(),
        ..CommandArgs::default()
    }
}

#[tokio::test]
async fn successful_command_reports_and_redirects() {
    let daemon = MockDaemon::new().with_watcher("sleeper", &[101]);
    let state = app_state(&daemon);
    state.controller.connect(ENDPOINT).await.unwrap();
    let session = Session::default();

    let target = run_command(
        &state,
        &session,
        "incr_proc",
        args_for("sleeper"),
        "added one process to the sleeper pool",
        "/watcher/sleeper",
        None,
    )
    .await
    .unwrap();

    assert_eq!(target, "/watcher/sleeper");
    let messages = session.drain_messages();
    assert_eq!(messages, ["added one process to the sleeper pool"]);
    assert_eq!(daemon.watcher("sleeper").unwrap().pids.len(), 2);
}

#[tokio::test]
async fn failed_command_records_daemon_reason_and_falls_back() {
    let daemon = MockDaemon::new().with_watcher("sleeper", &[101]);
    let state = app_state(&daemon);
    state.controller.connect(ENDPOINT).await.unwrap();
    let session = Session::default();

    let target = run_command(
        &state,
        &session,
        "add_watcher",
        CommandArgs {
            endpoint: ENDPOINT.to_string(),
            name: "sleeper".to_string(),
            cmd: Some("sleep 120".to_string()),
            ..CommandArgs::default()
        },
        "added a new watcher",
        "/watcher/sleeper",
        Some("/"),
    )
    .await
    .unwrap();

    assert_eq!(target, "/");
    let messages = session.drain_messages();
    assert_eq!(messages.len(), 1);
    assert!(messages[0].starts_with("An error happened:"));
    assert!(messages[0].contains("already exists"));
}

#[tokio::test]
async fn unknown_command_is_an_error() {
    let daemon = MockDaemon::new();
    let state = app_state(&daemon);
    let session = Session::default();

    let err = run_command(&state, &session, "explode", args_for("sleeper"), "", "/", None)
        .await
        .unwrap_err();
    assert!(matches!(err, ApiError::Internal(_)));
    assert!(session.drain_messages().is_empty());
}

#[tokio::test]
async fn command_against_unconnected_endpoint_reports_failure() {
    let daemon = MockDaemon::new().with_watcher("sleeper", &[101]);
    let state = app_state(&daemon);
    let session = Session::default();

    // No connect happened: the command surface reports the missing link
    // through the message queue, not a 5xx.
    let target = run_command(
        &state,
        &session,
        "switch_status",
        args_for("sleeper"),
        "status switched",
        "/",
        None,
    )
    .await
    .unwrap();

    assert_eq!(target, "/");
    let messages = session.drain_messages();
    assert!(messages[0].contains("no active connection"));
}
