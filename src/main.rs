use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use ringmaster::api::{AppState, create_router};
use ringmaster::config::AppConfig;
use ringmaster::controller::Controller;
use ringmaster::discovery::DiscoveryService;
use ringmaster::rpc::TcpConnector;
use ringmaster::session::SessionManager;
use ringmaster::stats::StatsHub;

#[derive(Debug, Parser)]
#[command(author, version, about = "Web dashboard for process-supervisor daemons.")]
struct Cli {
    /// Override the config file path
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Bind address
    #[arg(long)]
    host: Option<String>,
    /// Listen port
    #[arg(short, long)]
    port: Option<u16>,
    /// Daemon endpoint to connect to at startup
    #[arg(long)]
    endpoint: Option<String>,
    /// Multicast group for daemon discovery, e.g. udp://237.219.251.97:12027
    #[arg(long)]
    multicast: Option<String>,
    /// Increase logging verbosity (stackable)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    verbose: u8,
    /// Reduce output to only errors
    #[arg(short, long)]
    quiet: bool,
}

fn main() {
    if let Err(err) = try_main() {
        let _ = writeln!(io::stderr(), "{err:?}");
        std::process::exit(1);
    }
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = AppConfig::load(cli.config.as_deref())?;
    if let Some(host) = cli.host {
        config.host = host;
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(endpoint) = cli.endpoint {
        config.endpoint = Some(endpoint);
    }
    if let Some(multicast) = cli.multicast {
        config.multicast_endpoint = multicast;
    }

    let level = if cli.quiet {
        "error"
    } else {
        match cli.verbose {
            0 => config.logging.level.as_str(),
            1 => "debug",
            _ => "trace",
        }
    };
    init_logging(level);

    serve(config)
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("ringmaster={level},tower_http={level}")));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn serve(config: AppConfig) -> Result<()> {
    let controller = Controller::new(Arc::new(TcpConnector::default()));
    let hub = StatsHub::new(controller.clone());
    let sessions = Arc::new(SessionManager::new());

    let discovery = DiscoveryService::new(
        &config.multicast_endpoint,
        Duration::from_secs(config.probe_interval_secs),
    )
    .context("invalid multicast endpoint")?;
    discovery.spawn();

    if let Some(endpoint) = &config.endpoint {
        match controller.connect(endpoint).await {
            Ok(_) => info!(endpoint = %endpoint, "connected to daemon"),
            Err(err) => warn!(endpoint = %endpoint, error = %err, "initial connect failed"),
        }
    }

    let state = AppState::new(controller, hub, discovery, sessions);
    let app = create_router(state);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(address = %addr, "dashboard listening");

    axum::serve(listener, app).await.context("server error")?;
    Ok(())
}
