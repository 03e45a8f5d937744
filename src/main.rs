//! burrow - expose local TCP services through a public edge over SSH
//!
//! `burrow remote` runs the edge: an SSH control listener plus a plain-HTTP
//! ingress routed by Host header. `burrow local` connects to an edge and
//! binds one or more named tunnels to local ports.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use russh::keys::{decode_secret_key, PrivateKey, PublicKey};
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use burrow_client::Local;
use burrow_edge::{EdgeConfig, EdgeServer};

#[derive(Parser, Debug)]
#[command(name = "burrow")]
#[command(about = "Expose local TCP services through a public edge over SSH")]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the public edge (SSH control listener + HTTP ingress)
    Remote {
        /// HTTP ingress port
        #[arg(long, default_value_t = 8080)]
        http: u16,

        /// SSH control port
        #[arg(long, default_value_t = 2022)]
        ssh: u16,

        /// Private host key (PEM/OpenSSH)
        #[arg(long)]
        key: PathBuf,

        /// Public key of the only client allowed to bind tunnels
        #[arg(long)]
        client_key: PathBuf,
    },

    /// Connect to an edge and bind named tunnels to local ports
    Local {
        /// Edge control endpoint, host:port
        #[arg(long)]
        host: String,

        /// Tunnel to bind as name:port; repeatable
        #[arg(long = "tunnel", value_parser = parse_tunnel, required = true)]
        tunnels: Vec<TunnelSpec>,

        /// Private client key (PEM/OpenSSH)
        #[arg(long)]
        key: PathBuf,

        /// Public host key of the edge
        #[arg(long)]
        host_key: PathBuf,
    },
}

#[derive(Clone, Debug)]
struct TunnelSpec {
    name: String,
    port: u16,
}

fn parse_tunnel(spec: &str) -> Result<TunnelSpec, String> {
    match spec.split_once(':') {
        Some((name, port)) if !name.is_empty() => {
            let port = port
                .parse()
                .map_err(|_| format!("invalid port in tunnel spec: {spec}"))?;
            Ok(TunnelSpec {
                name: name.to_string(),
                port,
            })
        }
        _ => Err(format!("tunnel spec must be name:port, got: {spec}")),
    }
}

fn setup_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .init();
}

fn load_private_key(path: &Path) -> Result<PrivateKey> {
    let pem = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read private key {}", path.display()))?;
    decode_secret_key(&pem, None)
        .with_context(|| format!("failed to decode private key {}", path.display()))
}

fn load_public_key(path: &Path) -> Result<PublicKey> {
    let line = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read public key {}", path.display()))?;
    PublicKey::from_openssh(line.trim())
        .with_context(|| format!("failed to decode public key {}", path.display()))
}

async fn run_remote(http: u16, ssh: u16, key: &Path, client_key: &Path) -> Result<()> {
    let host_key = load_private_key(key)?;
    let client_key = load_public_key(client_key)?;

    let edge = EdgeServer::bind(EdgeConfig {
        ssh_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, ssh)),
        http_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, http)),
        host_key,
        client_key,
    })
    .await
    .context("failed to start edge")?;

    edge.run().await;
    Ok(())
}

/// Exit codes of the `local` subcommand: 1 when the control connection
/// cannot be opened, 2 when a bind is refused.
async fn run_local(host: &str, tunnels: &[TunnelSpec], key: &Path, host_key: &Path) -> ExitCode {
    let keys = load_private_key(key).and_then(|key| Ok((key, load_public_key(host_key)?)));
    let (key, host_key) = match keys {
        Ok(keys) => keys,
        Err(error) => {
            error!("{error:#}");
            return ExitCode::from(1);
        }
    };

    let mut local = match Local::open(host, host_key, key).await {
        Ok(local) => local,
        Err(error) => {
            error!(%error, %host, "failed to open control connection");
            return ExitCode::from(1);
        }
    };

    for tunnel in tunnels {
        if let Err(error) = local.bind(&tunnel.name, tunnel.port).await {
            error!(%error, name = %tunnel.name, "failed to bind tunnel");
            return ExitCode::from(2);
        }
    }

    tokio::select! {
        _ = local.wait() => {
            info!("control connection closed");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
            let _ = local.close().await;
        }
    }
    ExitCode::SUCCESS
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    match cli.command {
        Commands::Remote {
            http,
            ssh,
            key,
            client_key,
        } => match run_remote(http, ssh, &key, &client_key).await {
            Ok(()) => ExitCode::SUCCESS,
            Err(error) => {
                error!("{error:#}");
                ExitCode::FAILURE
            }
        },
        Commands::Local {
            host,
            tunnels,
            key,
            host_key,
        } => run_local(&host, &tunnels, &key, &host_key).await,
    }
}
