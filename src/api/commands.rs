//! Static command registry and the shared command-execution flow.
//!
//! Web actions name the controller operation they want; names resolve
//! through a registry built once at startup, so a misspelled command is a
//! configuration error with a clear message rather than a lookup failure at
//! request time.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use tracing::debug;

use crate::controller::{AddWatcherOptions, Controller};
use crate::rpc::{CallError, CommandResponse};
use crate::session::Session;

use super::error::ApiError;
use super::state::AppState;

/// Arguments a web action hands to a controller command. Fields a given
/// command does not use stay empty.
#[derive(Debug, Clone, Default)]
pub struct CommandArgs {
    pub endpoint: String,
    pub name: String,
    pub pid: Option<u64>,
    pub cmd: Option<String>,
    pub options: AddWatcherOptions,
}

type CommandFuture<'a> = Pin<Box<dyn Future<Output = Result<CommandResponse, CallError>> + Send + 'a>>;
type CommandHandler = for<'a> fn(&'a Controller, &'a CommandArgs) -> CommandFuture<'a>;

pub struct CommandRegistry {
    handlers: HashMap<&'static str, CommandHandler>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        let mut handlers: HashMap<&'static str, CommandHandler> = HashMap::new();
        handlers.insert("incr_proc", incr_proc);
        handlers.insert("decr_proc", decr_proc);
        handlers.insert("switch_status", switch_status);
        handlers.insert("kill_process", kill_process);
        handlers.insert("add_watcher", add_watcher);
        Self { handlers }
    }

    pub fn get(&self, name: &str) -> Option<CommandHandler> {
        self.handlers.get(name).copied()
    }
}

impl Default for CommandRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn incr_proc<'a>(c: &'a Controller, a: &'a CommandArgs) -> CommandFuture<'a> {
    Box::pin(c.incr_proc(&a.name, &a.endpoint))
}

fn decr_proc<'a>(c: &'a Controller, a: &'a CommandArgs) -> CommandFuture<'a> {
    Box::pin(c.decr_proc(&a.name, &a.endpoint))
}

fn switch_status<'a>(c: &'a Controller, a: &'a CommandArgs) -> CommandFuture<'a> {
    Box::pin(c.switch_status(&a.name, &a.endpoint))
}

fn kill_process<'a>(c: &'a Controller, a: &'a CommandArgs) -> CommandFuture<'a> {
    Box::pin(async move {
        let pid = a
            .pid
            .ok_or_else(|| CallError::Protocol("missing pid".to_string()))?;
        c.kill_process(&a.name, pid, &a.endpoint).await
    })
}

fn add_watcher<'a>(c: &'a Controller, a: &'a CommandArgs) -> CommandFuture<'a> {
    Box::pin(async move {
        let cmd = a
            .cmd
            .as_deref()
            .ok_or_else(|| CallError::Protocol("missing cmd".to_string()))?;
        c.add_watcher(&a.name, &a.endpoint, cmd, a.options.clone()).await
    })
}

/// Execute a named command for a web action and decide where to send the
/// browser next.
///
/// On success the supplied message lands in the session's flash queue and
/// the success target is returned. On a remote-call failure the daemon's
/// reason is recorded instead and the fallback target is returned; registry
/// and session state stay untouched beyond the message.
pub async fn run_command(
    state: &AppState,
    session: &Session,
    command: &str,
    args: CommandArgs,
    success_message: &str,
    redirect_url: &str,
    redirect_on_error: Option<&str>,
) -> Result<String, ApiError> {
    let handler = state
        .commands
        .get(command)
        .ok_or_else(|| ApiError::internal(format!("unknown command: {command}")))?;
    let fallback = redirect_on_error.unwrap_or(redirect_url);

    debug!(command, endpoint = %args.endpoint, "running command");
    match handler(&state.controller, &args).await {
        Ok(_) => {
            session.push_message(success_message);
            Ok(redirect_url.to_string())
        }
        Err(err) => {
            session.push_message(format!("An error happened: {err}"));
            Ok(fallback.to_string())
        }
    }
}
