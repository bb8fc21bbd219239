//! Request handlers.
//!
//! Data endpoints answer JSON; command endpoints run a controller command
//! and redirect, recording the outcome in the session's flash messages. The
//! redirect targets are frontend routes, mirroring the original dashboard's
//! navigation.

use std::sync::Arc;

use axum::{
    Form, Json,
    extract::{Path, Query, State},
    response::Redirect,
};
use axum_extra::extract::cookie::{Cookie, CookieJar};
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::controller::{AddWatcherOptions, normalize_endpoint};
use crate::rpc::{SocketInfo, WatcherInfo};
use crate::session::Session;

use super::commands::{CommandArgs, run_command};
use super::error::{ApiError, ApiResult};
use super::state::AppState;

const SESSION_COOKIE: &str = "ringmaster_session";

/// Resolve the browser session from the cookie jar, creating one (and its
/// cookie) on first contact.
fn session(state: &AppState, jar: CookieJar) -> (CookieJar, Arc<Session>) {
    let existing = jar.get(SESSION_COOKIE).map(|c| c.value().to_string());
    let (id, session) = state.sessions.get_or_create(existing.as_deref());
    let jar = if existing.as_deref() == Some(id.as_str()) {
        jar
    } else {
        jar.add(Cookie::new(SESSION_COOKIE, id))
    };
    (jar, session)
}

/// Command endpoints carry the target endpoint as a base64 path segment,
/// the same token used in stat channel names.
fn decode_endpoint(token: &str) -> ApiResult<String> {
    let bytes = BASE64
        .decode(token)
        .map_err(|_| ApiError::bad_request("invalid endpoint token"))?;
    String::from_utf8(bytes).map_err(|_| ApiError::bad_request("invalid endpoint token"))
}

// ---- data endpoints --------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct EndpointStatus {
    pub endpoint: String,
    pub watchers: Vec<WatcherInfo>,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub connected: bool,
    pub messages: Vec<String>,
    pub endpoints: Vec<EndpointStatus>,
}

/// GET /: session overview, the flash messages plus the cached inventory of
/// every endpoint this session is connected to.
pub async fn status(
    State(state): State<AppState>,
    jar: CookieJar,
) -> (CookieJar, Json<StatusResponse>) {
    let (jar, session) = session(&state, jar);
    let mut endpoints = Vec::new();
    for endpoint in session.endpoints() {
        if let Some(client) = state.controller.get_client(&endpoint).await {
            endpoints.push(EndpointStatus {
                endpoint,
                watchers: client.watchers(),
            });
        }
    }
    let response = StatusResponse {
        connected: session.connected(),
        messages: session.drain_messages(),
        endpoints,
    };
    (jar, Json(response))
}

/// GET /discovered (and GET /connect): endpoints answering multicast probes.
pub async fn discovered(State(state): State<AppState>) -> Json<Vec<String>> {
    Json(state.discovery.endpoints())
}

#[derive(Debug, Deserialize)]
pub struct EndpointQuery {
    pub endpoint: String,
    #[serde(default)]
    pub force_reload: bool,
}

/// GET /watcher/{name}/pids?endpoint=...
pub async fn watcher_pids(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<EndpointQuery>,
) -> ApiResult<Json<Vec<u64>>> {
    Ok(Json(state.controller.get_pids(&name, &query.endpoint).await?))
}

/// GET /sockets?endpoint=...&force_reload=true
pub async fn sockets(
    State(state): State<AppState>,
    Query(query): Query<EndpointQuery>,
) -> ApiResult<Json<Vec<SocketInfo>>> {
    Ok(Json(
        state
            .controller
            .get_sockets(&query.endpoint, query.force_reload)
            .await?,
    ))
}

/// GET /globaloptions?endpoint=...
pub async fn global_options(
    State(state): State<AppState>,
    Query(query): Query<EndpointQuery>,
) -> ApiResult<Json<Map<String, Value>>> {
    Ok(Json(state.controller.get_global_options(&query.endpoint).await?))
}

// ---- connect / disconnect --------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct ConnectForm {
    pub endpoint: Option<String>,
    /// Picked from the discovered-endpoint list; wins over the free-text
    /// field when both are posted.
    pub endpoint_select: Option<String>,
}

/// POST /connect
pub async fn connect(
    State(state): State<AppState>,
    jar: CookieJar,
    Form(form): Form<ConnectForm>,
) -> ApiResult<(CookieJar, Redirect)> {
    let (jar, session) = session(&state, jar);
    let endpoint = form
        .endpoint_select
        .filter(|e| !e.is_empty())
        .or(form.endpoint)
        .filter(|e| !e.is_empty())
        .ok_or_else(|| ApiError::bad_request("missing endpoint"))?;

    match state.controller.connect(&endpoint).await {
        Ok(_) => {
            session.add_endpoint(normalize_endpoint(&endpoint));
            Ok((jar, Redirect::to("/")))
        }
        Err(err) => {
            session.push_message(format!("An error happened: {err}"));
            Ok((jar, Redirect::to("/connect")))
        }
    }
}

/// GET /disconnect: release every endpoint reference this session holds and
/// forget the session.
pub async fn disconnect(State(state): State<AppState>, jar: CookieJar) -> (CookieJar, Redirect) {
    if let Some(id) = jar.get(SESSION_COOKIE).map(|c| c.value().to_string())
        && let Some(session) = state.sessions.delete(&id)
    {
        for endpoint in session.endpoints() {
            state.controller.disconnect(&endpoint).await;
        }
    }
    (jar.remove(Cookie::from(SESSION_COOKIE)), Redirect::to("/"))
}

// ---- command endpoints -----------------------------------------------------

/// GET /{endpoint}/watcher/{name}/process/incr
pub async fn incr_proc(
    State(state): State<AppState>,
    jar: CookieJar,
    Path((endpoint, name)): Path<(String, String)>,
) -> ApiResult<(CookieJar, Redirect)> {
    let (jar, session) = session(&state, jar);
    let args = CommandArgs {
        endpoint: decode_endpoint(&endpoint)?,
        name: name.clone(),
        ..CommandArgs::default()
    };
    let target = run_command(
        &state,
        &session,
        "incr_proc",
        args,
        &format!("added one process to the {name} pool"),
        &format!("/watcher/{name}"),
        None,
    )
    .await?;
    Ok((jar, Redirect::to(&target)))
}

/// GET /{endpoint}/watcher/{name}/process/decr
pub async fn decr_proc(
    State(state): State<AppState>,
    jar: CookieJar,
    Path((endpoint, name)): Path<(String, String)>,
) -> ApiResult<(CookieJar, Redirect)> {
    let (jar, session) = session(&state, jar);
    let args = CommandArgs {
        endpoint: decode_endpoint(&endpoint)?,
        name: name.clone(),
        ..CommandArgs::default()
    };
    let target = run_command(
        &state,
        &session,
        "decr_proc",
        args,
        &format!("removed one process from the {name} pool"),
        &format!("/watcher/{name}"),
        None,
    )
    .await?;
    Ok((jar, Redirect::to(&target)))
}

/// GET /{endpoint}/watcher/{name}/process/kill/{pid}
pub async fn kill_process(
    State(state): State<AppState>,
    jar: CookieJar,
    Path((endpoint, name, pid)): Path<(String, String, u64)>,
) -> ApiResult<(CookieJar, Redirect)> {
    let (jar, session) = session(&state, jar);
    let args = CommandArgs {
        endpoint: decode_endpoint(&endpoint)?,
        name: name.clone(),
        pid: Some(pid),
        ..CommandArgs::default()
    };
    let target = run_command(
        &state,
        &session,
        "kill_process",
        args,
        &format!("process {pid} killed successfully"),
        &format!("/watcher/{name}"),
        None,
    )
    .await?;
    Ok((jar, Redirect::to(&target)))
}

/// GET /{endpoint}/watcher/{name}/switch_status
pub async fn switch_status(
    State(state): State<AppState>,
    jar: CookieJar,
    Path((endpoint, name)): Path<(String, String)>,
) -> ApiResult<(CookieJar, Redirect)> {
    let (jar, session) = session(&state, jar);
    let args = CommandArgs {
        endpoint: decode_endpoint(&endpoint)?,
        name,
        ..CommandArgs::default()
    };
    let target = run_command(&state, &session, "switch_status", args, "status switched", "/", None).await?;
    Ok((jar, Redirect::to(&target)))
}

#[derive(Debug, Deserialize)]
pub struct AddWatcherForm {
    pub name: String,
    pub cmd: String,
    pub numprocesses: Option<String>,
    pub working_dir: Option<String>,
    pub shell: Option<String>,
}

/// POST /{endpoint}/add_watcher
pub async fn add_watcher(
    State(state): State<AppState>,
    jar: CookieJar,
    Path(endpoint): Path<String>,
    Form(form): Form<AddWatcherForm>,
) -> ApiResult<(CookieJar, Redirect)> {
    let (jar, session) = session(&state, jar);
    let watcher_page = format!("/watcher/{}", form.name.to_lowercase());
    let args = CommandArgs {
        endpoint: decode_endpoint(&endpoint)?,
        name: form.name,
        cmd: Some(form.cmd),
        options: AddWatcherOptions {
            numprocesses: form.numprocesses,
            working_dir: form.working_dir,
            shell: form.shell,
        },
        ..CommandArgs::default()
    };
    let target = run_command(
        &state,
        &session,
        "add_watcher",
        args,
        "added a new watcher",
        &watcher_page,
        Some("/"),
    )
    .await?;
    Ok((jar, Redirect::to(&target)))
}
