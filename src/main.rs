//! proxy-detector binary
//!
//! Listens for clients, strips PROXY headers sent by whitelisted load
//! balancers and relays everything else to the upstream server.
//!
//! Signals: SIGINT/SIGTERM stop the listener, SIGHUP re-reads the whitelist.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use proxy_detector::config::Config;
use proxy_detector::gateway::{BaseInitializer, ConnectionGateway};
use proxy_detector::server::Server;
use proxy_detector::whitelist;

/// Accept direct and PROXY-protocol clients on one port
#[derive(Debug, Parser)]
#[command(name = "proxy-detector", version, about)]
struct Cli {
    /// Path to a TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen address, overrides server.bind
    #[arg(short, long)]
    bind: Option<String>,

    /// Upstream address, overrides server.upstream
    #[arg(short, long)]
    upstream: Option<String>,

    /// Whitelist rule file, overrides detector.whitelist
    #[arg(short, long)]
    whitelist: Option<PathBuf>,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, default_value = "proxy_detector=info")]
    log_level: String,

    /// Print the effective configuration as TOML and exit
    #[arg(long)]
    print_config: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| cli.log_level.as_str().into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(bind) = cli.bind {
        config.server.bind = bind;
    }
    if let Some(upstream) = cli.upstream {
        config.server.upstream = upstream;
    }
    if let Some(path) = cli.whitelist {
        config.detector.whitelist = path;
    }
    config.validate()?;

    if cli.print_config {
        print!("{}", toml::to_string_pretty(&config)?);
        return Ok(());
    }

    info!(version = env!("CARGO_PKG_VERSION"), "proxy-detector starting");

    let server = Arc::new(Server::bind(&config.server, Arc::new(BaseInitializer)).await?);

    let gateway = if config.detector.enabled {
        let policy = whitelist::load_or_initialize(&config.detector.whitelist)?;
        policy.log_posture();
        let gateway = ConnectionGateway::new(policy, config.detector.decode_options());
        server.enable_detector(&gateway);
        Some(gateway)
    } else {
        warn!("PROXY detection disabled; every connection is treated as plain");
        None
    };

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    tokio::spawn(watch_signals(
        shutdown_tx,
        gateway,
        config.detector.whitelist.clone(),
    ));

    server.run(shutdown_rx).await?;
    info!("Shutdown complete");
    Ok(())
}

/// Stop on SIGINT/SIGTERM, reload the whitelist on SIGHUP.
#[cfg(unix)]
async fn watch_signals(
    shutdown: broadcast::Sender<()>,
    gateway: Option<ConnectionGateway>,
    whitelist_path: PathBuf,
) {
    use tokio::signal::unix::{signal, SignalKind};

    let (mut hangup, mut terminate) = match (
        signal(SignalKind::hangup()),
        signal(SignalKind::terminate()),
    ) {
        (Ok(hangup), Ok(terminate)) => (hangup, terminate),
        (Err(e), _) | (_, Err(e)) => {
            error!(error = %e, "Failed to install signal handlers, only ctrl-c is handled");
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for ctrl-c");
            }
            let _ = shutdown.send(());
            return;
        }
    };

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = terminate.recv() => break,
            _ = hangup.recv() => reload(gateway.as_ref(), &whitelist_path),
        }
    }

    info!("Shutdown signal received");
    let _ = shutdown.send(());
}

#[cfg(not(unix))]
async fn watch_signals(
    shutdown: broadcast::Sender<()>,
    _gateway: Option<ConnectionGateway>,
    _whitelist_path: PathBuf,
) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for ctrl-c");
    }
    info!("Shutdown signal received");
    let _ = shutdown.send(());
}

#[cfg(unix)]
fn reload(gateway: Option<&ConnectionGateway>, path: &std::path::Path) {
    let Some(gateway) = gateway else {
        info!("Reload requested but PROXY detection is disabled");
        return;
    };
    match whitelist::load(path) {
        Ok(policy) => {
            gateway.reload(policy);
            info!(path = %path.display(), "Whitelist reloaded");
        }
        Err(e) => error!(error = %e, "Whitelist reload failed, keeping the previous whitelist"),
    }
}
