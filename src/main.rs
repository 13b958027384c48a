//! rusty-dyndns - HTTP dynamic DNS gateway driving nsupdate.

use clap::{Parser, Subcommand};
use rusty_dyndns::config::{Config, Overrides};
use rusty_dyndns::store::open_store;
use rusty_dyndns::sweeper::Sweeper;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "rusty-dyndns")]
#[command(about = "HTTP dynamic DNS gateway driving nsupdate sessions")]
#[command(version)]
struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Run without a config file, from defaults and flags only
    #[arg(long, global = true, conflicts_with = "config")]
    no_config: bool,

    /// Nameserver to send updates to
    #[arg(long, global = true)]
    server: Option<String>,

    /// Default zone
    #[arg(long, global = true)]
    zone: Option<String>,

    /// Shared secret clients must present
    #[arg(long, global = true)]
    shared_secret: Option<String>,

    /// Path of the nsupdate executable
    #[arg(long, global = true)]
    nsupdate_binary: Option<String>,

    /// TTL of added records
    #[arg(long, global = true)]
    record_ttl: Option<u32>,

    /// HTTP listen address
    #[arg(long, global = true)]
    listen: Option<SocketAddr>,

    /// Log verbosity (0 info, 1 debug and update commands, 2 trace)
    #[arg(long = "log", global = true)]
    log_level: Option<u8>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the HTTP API (default)
    Serve,

    /// Validate configuration
    Validate,

    /// Print the effective configuration
    PrintConfig,

    /// Print an example configuration
    Example,
}

impl Cli {
    fn overrides(&self) -> Overrides {
        Overrides {
            server: self.server.clone(),
            zone: self.zone.clone(),
            shared_secret: self.shared_secret.clone(),
            nsupdate_binary: self.nsupdate_binary.clone(),
            record_ttl: self.record_ttl,
            listen: self.listen,
            log_level: self.log_level,
        }
    }
}

fn get_config_path(cli_path: Option<PathBuf>) -> PathBuf {
    if let Some(path) = cli_path {
        return path;
    }

    // Default locations
    let candidates = [
        Config::default_path().ok(),
        Some(PathBuf::from("/etc/rusty-dyndns/config.toml")),
        Some(PathBuf::from("/etc/dyndns.json")),
        Some(PathBuf::from("config.toml")),
    ];

    for candidate in candidates.into_iter().flatten() {
        if candidate.exists() {
            return candidate;
        }
    }

    // Return default even if it doesn't exist
    Config::default_path().unwrap_or_else(|_| PathBuf::from("config.toml"))
}

fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    let mut config = if cli.no_config {
        Config::default()
    } else {
        Config::load_from(&get_config_path(cli.config.clone()))?
    };
    config.apply(cli.overrides());
    Ok(config)
}

fn init_tracing(log_level: u8) {
    let level = match log_level {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Some(Commands::Example) => {
            print!("{}", Config::example().to_toml()?);
        }
        Some(Commands::PrintConfig) => {
            let config = load_config(&cli)?;
            print!("{}", config.to_toml()?);
        }
        Some(Commands::Validate) => {
            let config = load_config(&cli)?;
            cmd_validate(&config);
        }
        Some(Commands::Serve) | None => {
            let config = load_config(&cli)?;
            init_tracing(config.log_level);
            cmd_serve(config).await?;
        }
    }

    Ok(())
}

fn cmd_validate(config: &Config) {
    println!("Validating configuration...\n");

    println!("  server:      {}", config.server);
    println!("  zone:        {}", config.zone);
    println!(
        "  credentials: {}",
        if config.uses_shared_secret() {
            "shared secret"
        } else {
            "per-request TSIG secret"
        }
    );
    println!("  listen:      {}", config.listen);
    match config.expiry.record_expiry_secs {
        Some(secs) => println!("  expiry:      {}s", secs),
        None => println!("  expiry:      disabled"),
    }
    println!();

    match config.validate() {
        Ok(()) => println!("Configuration is valid."),
        Err(e) => {
            println!("FAILED - {}", e);
            std::process::exit(1);
        }
    }
}

async fn cmd_serve(config: Config) -> anyhow::Result<()> {
    config.validate()?;
    let config = Arc::new(config);

    info!(
        "Starting rusty-dyndns (server: {}, zone: {})",
        config.server, config.zone
    );

    let store = open_store(&config.expiry).await?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let sweeper = store.as_ref().map(|store| {
        let sweeper = Sweeper::new(&config, Arc::clone(store));
        tokio::spawn(sweeper.run(shutdown_rx))
    });

    let served = rusty_dyndns::server::serve(Arc::clone(&config), store, shutdown_signal()).await;

    let _ = shutdown_tx.send(true);
    if let Some(handle) = sweeper {
        if let Err(e) = handle.await {
            warn!("Expiry sweeper ended abnormally: {}", e);
        }
    }

    served?;
    info!("Shutdown complete");
    Ok(())
}

/// Resolve on SIGTERM or SIGINT.
#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let (mut sigterm, mut sigint) = match (
        signal(SignalKind::terminate()),
        signal(SignalKind::interrupt()),
    ) {
        (Ok(term), Ok(int)) => (term, int),
        (Err(e), _) | (_, Err(e)) => {
            warn!("Failed to set up signal handlers: {}, using Ctrl-C", e);
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    let received = tokio::select! {
        _ = sigterm.recv() => "SIGTERM",
        _ = sigint.recv() => "SIGINT",
    };
    info!("Received {}, shutting down", received);
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("Received Ctrl-C, shutting down");
}
