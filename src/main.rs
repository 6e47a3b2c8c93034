//! Burrow CLI - path-routing reverse proxy with reverse tunnels
//!
//! Run the proxy, keep a local service reachable through it, or send it
//! control commands.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use burrow_client::{ControlClient, TunnelClient, TunnelClientConfig};
use burrow_proto::ServerInfo;
use burrow_router::HealthMonitor;
use burrow_server::{ConfigWatcher, ProxyConfig, ProxyServer, ShutdownOutcome};
use burrow_transport::ClientTrust;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Burrow - route HTTP by path to backends and reverse tunnels
#[derive(Parser, Debug)]
#[command(name = "burrow")]
#[command(about = "Burrow - route HTTP by path to backends and reverse tunnels")]
#[command(version = env!("GIT_TAG"))]
#[command(long_version = concat!(
    env!("GIT_TAG"),
    " (",
    env!("GIT_HASH"),
    ", built ",
    env!("BUILD_TIME"),
    ")"
))]
struct Cli {
    /// Log level (trace, debug, info, warn, error); RUST_LOG overrides it
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the proxy
    #[command(long_about = r#"
Run the proxy on a single port. HTTP requests are routed by their first
path segment; tunnel and control handshakes share the same port.

EXAMPLES:
  burrow serve --config ./burrow.json --tunnel-password s3cret

ENVIRONMENT VARIABLES:
  BURROW_TUNNEL_PASSWORD   Password tunnel clients must present
  BURROW_CONTROL_PASSWORD  Password for control commands (defaults to the tunnel password)
    "#)]
    Serve {
        /// Configuration file (default: ~/burrow/config.json)
        #[arg(long, short)]
        config: Option<PathBuf>,

        #[arg(long, env = "BURROW_TUNNEL_PASSWORD", hide_env_values = true)]
        tunnel_password: String,

        #[arg(long, env = "BURROW_CONTROL_PASSWORD", hide_env_values = true)]
        control_password: Option<String>,
    },

    /// Expose a local service through a proxy
    #[command(long_about = r#"
Keep tunnel connections parked at the proxy so that requests for
/<name> reach the local target. Reconnects automatically.

EXAMPLES:
  burrow tunnel --proxy proxy.example.com:8000 --name myapp \
    --password s3cret --target 127.0.0.1:3000
    "#)]
    Tunnel {
        /// Proxy address (e.g., proxy.example.com:8000)
        #[arg(long, env = "BURROW_PROXY")]
        proxy: String,

        /// Route name; requests for /<name> arrive through the tunnel
        #[arg(long)]
        name: String,

        #[arg(long, env = "BURROW_TUNNEL_PASSWORD", hide_env_values = true)]
        password: String,

        /// Local service to forward to (e.g., 127.0.0.1:3000)
        #[arg(long)]
        target: String,

        /// Connect to the proxy over TLS
        #[arg(long)]
        tls: bool,

        /// Skip proxy certificate verification (development only)
        #[arg(long, requires = "tls")]
        insecure: bool,

        /// Tunnel connections kept parked at once
        #[arg(long, default_value = "4")]
        concurrency: usize,
    },

    /// Send a control command to a running proxy
    Ctl {
        #[arg(long, env = "BURROW_PROXY")]
        proxy: String,

        #[arg(long, env = "BURROW_CONTROL_PASSWORD", hide_env_values = true, default_value = "")]
        password: String,

        #[arg(long)]
        tls: bool,

        #[arg(long, requires = "tls")]
        insecure: bool,

        #[command(subcommand)]
        action: CtlAction,
    },
}

#[derive(Subcommand, Debug)]
enum CtlAction {
    /// Register a backend
    Add {
        #[arg(long)]
        name: String,

        /// Backend address; omit for --tunnel
        #[arg(long, default_value = "")]
        addr: String,

        /// Explicit route path (default: /<name>)
        #[arg(long)]
        path: Option<String>,

        #[arg(long)]
        tunnel: bool,

        /// Dial the backend over TLS
        #[arg(long)]
        secure: bool,

        #[arg(long)]
        website: bool,
    },

    /// Remove a backend by path, falling back to its address
    Remove {
        #[arg(long)]
        name: String,

        #[arg(long, default_value = "")]
        addr: String,

        #[arg(long)]
        path: Option<String>,
    },

    /// Stop the proxy
    Shutdown {
        /// Hard deadline for the drain, in seconds
        #[arg(long)]
        timeout: Option<u64>,
    },
}

/// Setup logging with the specified log level
fn setup_logging(log_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();
}

fn default_config_path() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Could not determine home directory")?;
    Ok(home.join("burrow").join("config.json"))
}

fn trust(tls: bool, insecure: bool) -> Option<ClientTrust> {
    match (tls, insecure) {
        (false, _) => None,
        (true, true) => {
            warn!("⚠️  Certificate verification disabled (insecure mode)");
            Some(ClientTrust::Insecure)
        }
        (true, false) => Some(ClientTrust::WebPki),
    }
}

async fn serve(
    config_path: Option<PathBuf>,
    tunnel_password: String,
    control_password: Option<String>,
) -> Result<()> {
    let config_path = match config_path {
        Some(path) => path,
        None => default_config_path()?,
    };
    let config = ProxyConfig::load(&config_path)
        .with_context(|| format!("Failed to load {}", config_path.display()))?;

    info!("Burrow {} ({}) starting", env!("GIT_TAG"), env!("GIT_HASH"));
    info!("Config: {}", config_path.display());

    let mut builder = ProxyServer::builder(config.clone()).tunnel_password(tunnel_password);
    if let Some(password) = control_password {
        builder = builder.control_password(password);
    }
    let server = builder.bind().await.context("Failed to start proxy")?;

    let registry = server.registry();
    let shutdown = server.shutdown_signal();

    let health = HealthMonitor::new(registry.clone(), config.health());
    tokio::spawn(health.run(shutdown.token()));

    let watcher = ConfigWatcher::new(&config_path, registry, shutdown.clone(), &config);
    tokio::spawn(watcher.run());

    let signals = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        info!("Received Ctrl+C, draining connections (press again to force)");
        signals.shutdown(None);

        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Received second Ctrl+C, forcing shutdown");
            signals.force();
        }
    });

    match server.run().await {
        ShutdownOutcome::Drained => {
            info!("Burrow stopped");
            Ok(())
        }
        ShutdownOutcome::Forced { remaining } => {
            error!("Burrow stopped with {} connection(s) still open", remaining);
            std::process::exit(1);
        }
    }
}

async fn tunnel(config: TunnelClientConfig) -> Result<()> {
    info!("Proxy: {}", config.proxy_addr);
    info!("Route: /{} -> {}", config.name, config.target_addr);

    let client = Arc::new(TunnelClient::new(config).context("Failed to create tunnel client")?);
    let shutdown = CancellationToken::new();
    let mut task = tokio::spawn(client.run(shutdown.clone()));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
            shutdown.cancel();
        }
        result = &mut task => {
            result.context("Tunnel task panicked")??;
            info!("Tunnel stopped");
            return Ok(());
        }
    }

    task.await.context("Tunnel task panicked")??;
    info!("Tunnel stopped");
    Ok(())
}

async fn ctl(client: ControlClient, action: CtlAction) -> Result<()> {
    match action {
        CtlAction::Add {
            name,
            addr,
            path,
            tunnel,
            secure,
            website,
        } => {
            let mut info = ServerInfo::new(name, addr)
                .with_secure(secure)
                .with_website(website);
            info.tunnel = tunnel;
            if let Some(path) = path {
                info = info.with_path(path);
            }
            client.add(info).await.context("add failed")?;
            println!("✅ Added");
        }
        CtlAction::Remove { name, addr, path } => {
            let mut info = ServerInfo::new(name, addr);
            if let Some(path) = path {
                info = info.with_path(path);
            }
            client.remove(info).await.context("remove failed")?;
            println!("✅ Removed");
        }
        CtlAction::Shutdown { timeout } => {
            client
                .shutdown(timeout.map(Duration::from_secs))
                .await
                .context("shutdown failed")?;
            println!("✅ Shutdown started");
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(&cli.log_level);

    match cli.command {
        Commands::Serve {
            config,
            tunnel_password,
            control_password,
        } => serve(config, tunnel_password, control_password).await,
        Commands::Tunnel {
            proxy,
            name,
            password,
            target,
            tls,
            insecure,
            concurrency,
        } => {
            let mut config = TunnelClientConfig::new(proxy, name, password, target)
                .with_concurrency(concurrency);
            if let Some(trust) = trust(tls, insecure) {
                config = config.with_tls(trust);
            }
            tunnel(config).await
        }
        Commands::Ctl {
            proxy,
            password,
            tls,
            insecure,
            action,
        } => {
            let client = ControlClient::new(proxy, password, trust(tls, insecure))
                .context("Failed to create control client")?;
            ctl(client, action).await
        }
    }
}
