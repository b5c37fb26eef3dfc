//! turret - command-line control for a networked turret

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use turretlink::config::{self, Config};
use turretlink::network::resolve_server;
use turretlink::{AckStatus, Discovery, TurretClient};

/// turret - control a turret over the local network
#[derive(Parser)]
#[command(name = "turret")]
#[command(author = "Turretlink Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Discover and command a networked turret", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Server address (HOST or HOST:PORT); skips discovery
    #[arg(short, long, global = true)]
    server: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Broadcast for a turret server and print its command endpoint
    Discover,

    /// Rotate the turret
    Move {
        /// Base (azimuth) angle
        #[arg(short, long, allow_negative_numbers = true)]
        base: f64,

        /// Elevation angle
        #[arg(short, long, allow_negative_numbers = true)]
        elev: f64,
    },

    /// Fire the turret
    Shoot {
        /// Number of shots
        #[arg(short = 'n', long, default_value_t = 1)]
        times: i64,
    },

    /// Print the turret's current status
    Status {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Return the turret to its home pose
    Reset,

    /// Show current configuration
    Config {
        /// Generate sample configuration
        #[arg(long)]
        generate: bool,

        /// Output path for generated config
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = if let Some(config_path) = &cli.config {
        Config::load(config_path)?
    } else {
        Config::load_default().unwrap_or_default()
    };

    // Initialize logging
    let filter = if cli.verbose || config.general.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .init();

    match cli.command {
        Commands::Discover => {
            let server = Discovery::new(config.discovery.clone()).find_server().await?;
            println!("{}", server);
        }
        Commands::Move { base, elev } => {
            let mut client = open_session(&config, cli.server.as_deref()).await?;
            let result = client.move_to(base, elev).await;
            finish(&mut client).await;
            report("move", result?);
        }
        Commands::Shoot { times } => {
            let mut client = open_session(&config, cli.server.as_deref()).await?;
            let result = client.shoot(times).await;
            finish(&mut client).await;
            report("shoot", result?);
        }
        Commands::Status { json } => {
            let mut client = open_session(&config, cli.server.as_deref()).await?;
            let result = client.request_status().await;
            finish(&mut client).await;
            let status = result?;

            if json {
                let value = serde_json::json!({
                    "base_angle": status.base_angle(),
                    "elev_angle": status.elev_angle(),
                    "shots": status.shots(),
                });
                println!("{}", serde_json::to_string_pretty(&value)?);
            } else {
                println!("Base angle:      {}", status.base_angle());
                println!("Elevation angle: {}", status.elev_angle());
                println!("Shots fired:     {}", status.shots());
            }
        }
        Commands::Reset => {
            let mut client = open_session(&config, cli.server.as_deref()).await?;
            let result = client.reset().await;
            finish(&mut client).await;
            report("reset", result?);
        }
        Commands::Config { generate, output } => {
            let text = if generate {
                config::generate_sample_config()?
            } else {
                config.to_toml()?
            };

            if let Some(path) = output {
                std::fs::write(&path, &text)?;
                println!("Configuration written to: {}", path.display());
            } else {
                println!("{}", text);
            }
        }
    }

    Ok(())
}

/// Connect to the server named on the command line or in the config,
/// falling back to broadcast discovery
async fn open_session(config: &Config, server: Option<&str>) -> anyhow::Result<TurretClient> {
    let server = server.or(config.general.server.as_deref());

    let client = match server {
        Some(spec) => {
            let addr: SocketAddr = resolve_server(spec, config.session.port).await?;
            TurretClient::connect(addr, config.session.clone()).await?
        }
        None => {
            tracing::info!("No server given, discovering on the local network");
            TurretClient::discover(config.discovery.clone(), config.session.clone()).await?
        }
    };

    Ok(client)
}

/// Close the session without letting a failed shutdown hide the
/// operation's own outcome
async fn finish<S>(client: &mut TurretClient<S>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if let Err(e) = client.close().await {
        tracing::warn!("Failed to close session cleanly: {}", e);
    }
}

fn report(command: &str, status: AckStatus) {
    match status {
        AckStatus::Confirmed => println!("{} acknowledged", command),
        AckStatus::Unconfirmed(reason) => {
            println!("warning: {} sent but not acknowledged ({})", command, reason)
        }
    }
}
