//! Pollcast server binary.
//!
//! # Usage
//!
//! ```bash
//! # Start with self-signed certificate (development)
//! pollcast-server --bind 0.0.0.0:4433 --open-admission
//!
//! # Start with TLS certificate (production)
//! pollcast-server --bind 0.0.0.0:4433 --cert cert.pem --key key.pem
//! ```

use clap::Parser;
use pollcast_server::{Server, ServerConfig, storage::MemoryStorage};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Pollcast live-poll server
#[derive(Parser, Debug)]
#[command(name = "pollcast-server")]
#[command(about = "Real-time room and poll broadcast server")]
#[command(version)]
struct Args {
    /// Address to bind to
    #[arg(short, long, default_value = "0.0.0.0:4433")]
    bind: String,

    /// Path to TLS certificate (PEM format)
    #[arg(short, long)]
    cert: Option<String>,

    /// Path to TLS private key (PEM format)
    #[arg(short, long)]
    key: Option<String>,

    /// Maximum concurrent connections
    #[arg(long, default_value = "10000")]
    max_connections: usize,

    /// Outbound queue capacity per connection (messages)
    #[arg(long, default_value = "256")]
    queue_capacity: usize,

    /// Admit any participant into any room (development only)
    #[arg(long)]
    open_admission: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    tracing::info!("Pollcast server starting");
    tracing::info!("Binding to {}", args.bind);

    if args.cert.is_none() || args.key.is_none() {
        tracing::warn!("No TLS certificate provided - using self-signed certificate");
        tracing::warn!("This is NOT suitable for production use!");
    }

    let storage = if args.open_admission {
        tracing::warn!("Open admission enabled - every participant is admitted to every room");
        tracing::warn!("This is NOT suitable for production use!");
        MemoryStorage::open_admission()
    } else {
        // Rooms and participants are seeded by the admission collaborator
        // (the HTTP API in a full deployment)
        MemoryStorage::new()
    };

    let config = ServerConfig {
        bind_address: args.bind,
        cert_path: args.cert,
        key_path: args.key,
        max_connections: args.max_connections,
        queue_capacity: args.queue_capacity,
        ..Default::default()
    };

    let server = Server::bind(config, storage)?;

    tracing::info!("Server listening on {}", server.local_addr()?);

    server.run().await?;

    Ok(())
}
