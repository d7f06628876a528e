//! lanmeshd: daemon entry point for the LAN signaling mesh.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use lanmesh::{Mesh, MeshConfig};

#[derive(Debug, Parser)]
#[command(name = "lanmeshd", about = "Serverless LAN signaling mesh daemon")]
struct Args {
    /// Logical mesh name, scoping the advertised mDNS instance name.
    #[arg(long, default_value = "lanmesh")]
    service_name: String,

    /// First port (inclusive) probed for the signaling server.
    #[arg(long, default_value_t = 5000)]
    port_range_start: u16,

    /// End of the probe range (exclusive).
    #[arg(long, default_value_t = 6000)]
    port_range_end: u16,

    /// Delay before the first endpoint-set computation, in ms.
    #[arg(long, default_value_t = 1000)]
    settle_ms: u64,

    /// Override the identity file directory.
    #[arg(long)]
    config_dir: Option<PathBuf>,

    /// Join an existing mesh with this invite code, replacing the
    /// stored secret.
    #[arg(long, value_name = "INVITE_CODE")]
    join: Option<String>,

    /// Abandon the current mesh: generate a fresh secret and start a
    /// new one.
    #[arg(long)]
    reset: bool,

    /// Print the invite code and exit.
    #[arg(long)]
    show_invite: bool,
}

#[tokio::main]
async fn main() -> lanmesh::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let config = MeshConfig {
        service_name: args.service_name,
        port_range_start: args.port_range_start,
        port_range_end: args.port_range_end,
        settle_delay: Duration::from_millis(args.settle_ms),
        config_dir: args.config_dir,
    };

    let mesh = Mesh::new(config)?;

    if args.show_invite {
        println!("{}", mesh.invite_code());
        return Ok(());
    }

    if let Some(invite_code) = args.join {
        mesh.join(&invite_code).await?;
    } else if args.reset {
        let invite_code = mesh.reset().await?;
        info!("new mesh created; invite code: {invite_code}");
    } else {
        mesh.start().await?;
    }

    if let Ok(status) = mesh.status().await {
        info!(port = status.own_port, "own signaling server is up");
        info!("invite code: {}", status.secret);
    }

    // Log every endpoint-set change until shutdown.
    let mut endpoints = mesh.subscribe();
    let watcher = tokio::spawn(async move {
        while endpoints.changed().await.is_ok() {
            let urls = endpoints.borrow().clone();
            info!(count = urls.len(), ?urls, "signaling endpoints");
        }
    });

    match signal::ctrl_c().await {
        Ok(()) => info!("received Ctrl+C, shutting down"),
        Err(e) => error!("unable to listen for shutdown signal: {e}"),
    }

    watcher.abort();
    mesh.shutdown().await;
    info!("shutdown complete");
    Ok(())
}
