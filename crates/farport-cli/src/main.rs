//! Farport CLI - Command-line interface for tunnel sessions

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use farport_manager::{ManagerConfig, SessionManager};

/// Farport CLI - Reach remote services through tunnel sessions
#[derive(Parser, Debug)]
#[command(name = "farport")]
#[command(about = "Reach remote services through secret-key tunnel sessions", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log verbosity (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Open sessions to one or more remote services and keep them up
    Connect {
        /// Relay host, used when no --url is given
        #[arg(short, long, env = "FARPORT_RELAY")]
        relay: String,

        /// Full relay URL override (ws://, wss://, or tcp://)
        #[arg(long, env = "FARPORT_RELAY_URL")]
        url: Option<String>,

        /// Pre-shared relay token
        #[arg(short, long, env = "FARPORT_TOKEN")]
        token: Option<String>,

        /// Service to reach, as name=secret[:local_port]; repeatable
        #[arg(long = "service", required = true)]
        services: Vec<String>,

        /// Local address session listeners bind on
        #[arg(long, default_value = "127.0.0.1")]
        bind_addr: String,

        /// Outbound HTTP proxy URL (http://[user:pass@]host:port)
        #[arg(long, env = "FARPORT_PROXY")]
        proxy: Option<String>,

        /// Verify the relay TLS certificate against trusted roots
        #[arg(long)]
        tls_verify: bool,

        /// Dial one relay connection per stream instead of multiplexing
        #[arg(long)]
        no_multiplex: bool,
    },
}

/// One `name=secret[:local_port]` service argument, parsed.
#[derive(Debug, PartialEq, Eq)]
struct ServiceSpec {
    name: String,
    secret: String,
    local_port: u16,
}

fn parse_service_spec(spec: &str) -> Result<ServiceSpec> {
    let (name, rest) = spec
        .split_once('=')
        .with_context(|| format!("Invalid service '{}': expected name=secret[:local_port]", spec))?;

    let (secret, local_port) = match rest.rsplit_once(':') {
        Some((secret, port)) => {
            let port = port
                .parse::<u16>()
                .with_context(|| format!("Invalid local port in service '{}'", spec))?;
            (secret, port)
        }
        None => (rest, 0),
    };

    if name.is_empty() || secret.is_empty() {
        anyhow::bail!(
            "Invalid service '{}': name and secret must be non-empty",
            spec
        );
    }

    Ok(ServiceSpec {
        name: name.to_string(),
        secret: secret.to_string(),
        local_port,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    // The process-wide rustls provider must exist before any TLS dial.
    let _ = rustls::crypto::ring::default_provider().install_default();

    let cli = Cli::parse();

    init_logging(&cli.log_level)?;

    match cli.command {
        Commands::Connect {
            relay,
            url,
            token,
            services,
            bind_addr,
            proxy,
            tls_verify,
            no_multiplex,
        } => {
            handle_connect(
                relay,
                url,
                token,
                services,
                bind_addr,
                proxy,
                tls_verify,
                no_multiplex,
            )
            .await
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn handle_connect(
    relay: String,
    url: Option<String>,
    token: Option<String>,
    services: Vec<String>,
    bind_addr: String,
    proxy: Option<String>,
    tls_verify: bool,
    no_multiplex: bool,
) -> Result<()> {
    let specs = services
        .iter()
        .map(|s| parse_service_spec(s))
        .collect::<Result<Vec<_>>>()?;

    let mut config = ManagerConfig::new(relay)
        .with_bind_addr(bind_addr)
        .with_tls_verify(tls_verify)
        .with_multiplex(!no_multiplex);
    if let Some(token) = token {
        config = config.with_auth_token(token);
    }
    if let Some(proxy) = proxy {
        config = config.with_proxy_url(proxy);
    }

    let (handle, mut status_rx) = SessionManager::start(config);

    // Print the status feed for as long as the manager runs
    tokio::spawn(async move {
        while let Some(event) = status_rx.recv().await {
            match &event.error {
                Some(e) => warn!("Status update: {} - {} ({})", event.instance_name, event.state, e),
                None => info!("Status update: {} - {}", event.instance_name, event.state),
            }
        }
    });

    for (i, spec) in specs.iter().enumerate() {
        handle
            .connect(
                i as u64 + 1,
                spec.name.clone(),
                spec.secret.clone(),
                spec.local_port,
                url.clone(),
            )
            .await
            .with_context(|| format!("Failed to connect service '{}'", spec.name))?;
    }

    println!();
    println!("✅ {} session(s) established!", specs.len());
    println!();
    for spec in &specs {
        match spec.local_port {
            0 => println!("  {:<24} auto-assigned port (see log)", spec.name),
            port => println!("  {:<24} local port {}", spec.name, port),
        }
    }
    println!();
    println!("Press Ctrl+C to close the tunnels.");
    println!();

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received, stopping sessions..."),
        Err(err) => error!("Error listening for shutdown signal: {}", err),
    }

    handle.stop();
    println!();
    println!("🛑 All sessions stopped.");

    Ok(())
}

fn init_logging(log_level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(log_level))
        .context("Invalid log filter")?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}
