//! Pollcast production server.
//!
//! Runs live, timed multiple-choice polls inside rooms of connected
//! participants, broadcasting poll lifecycle events (`start_poll`,
//! `vote`, `end_poll`) to every connection in real time.
//!
//! # Architecture
//!
//! This crate provides production "glue" around [`pollcast_core`]'s pure
//! state machines:
//!
//! - [`RoomHub`]: per-room connection registry and broadcast fan-out
//! - [`PollEngine`]: poll lifecycle driver with cancellable expiry timers
//! - [`MessageRouter`]: inbound message dispatch
//! - [`Server`]: QUIC accept loop wiring it all together with
//!   [`SystemEnv`] (real time, crypto RNG) and a [`Storage`] collaborator
//!
//! Each connection runs two tasks (inbound and outbound pump) plus one
//! background timer task per Active poll; there is no global lock
//! serializing the system.

mod connection;
mod engine;
mod error;
mod hub;
mod router;
pub mod storage;
mod system_env;
mod transport;

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

pub use engine::PollEngine;
pub use error::ServerError;
pub use hub::RoomHub;
use pollcast_core::SessionConfig;
pub use router::{InboundContext, MessageRouter};
use storage::MemoryStorage;
pub use storage::Storage;
pub use system_env::SystemEnv;
pub use transport::{QuinnConnection, QuinnTransport};

use crate::connection::ConnectionSettings;

/// Default outbound queue capacity per connection (messages).
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Default maximum concurrent connections.
pub const DEFAULT_MAX_CONNECTIONS: usize = 10_000;

/// Server configuration for the production runtime.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to (e.g., "0.0.0.0:4433")
    pub bind_address: String,
    /// Path to TLS certificate (PEM format)
    pub cert_path: Option<String>,
    /// Path to TLS private key (PEM format)
    pub key_path: Option<String>,
    /// Maximum concurrent connections
    pub max_connections: usize,
    /// Outbound queue capacity per connection
    pub queue_capacity: usize,
    /// Session timeouts and heartbeat interval
    pub session: SessionConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:4433".to_string(),
            cert_path: None,
            key_path: None,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            session: SessionConfig::default(),
        }
    }
}

/// Production pollcast server.
///
/// Wraps the hub, engine, and router with Quinn QUIC transport and the
/// system environment. The engine handle doubles as the host-side
/// administrative API: the collaborator that authorizes host actions
/// calls [`PollEngine::activate`] and [`PollEngine::close`] on it.
pub struct Server {
    transport: QuinnTransport,
    hub: Arc<RoomHub>,
    engine: Arc<PollEngine<SystemEnv, MemoryStorage>>,
    router: Arc<MessageRouter<SystemEnv, MemoryStorage>>,
    storage: MemoryStorage,
    env: SystemEnv,
    config: ServerConfig,
}

impl Server {
    /// Create and bind a new server.
    pub fn bind(config: ServerConfig, storage: MemoryStorage) -> Result<Self, ServerError> {
        let env = SystemEnv::new();
        let hub = Arc::new(RoomHub::new());
        let engine = PollEngine::new(Arc::clone(&hub), storage.clone(), env.clone());
        let router = Arc::new(MessageRouter::new(Arc::clone(&engine), Arc::clone(&hub)));

        let transport = QuinnTransport::bind(
            &config.bind_address,
            config.cert_path.clone(),
            config.key_path.clone(),
        )?;

        Ok(Self { transport, hub, engine, router, storage, env, config })
    }

    /// Local address the server is bound to.
    pub fn local_addr(&self) -> Result<std::net::SocketAddr, ServerError> {
        self.transport.local_addr()
    }

    /// The poll engine (host-side administrative API).
    pub fn engine(&self) -> &Arc<PollEngine<SystemEnv, MemoryStorage>> {
        &self.engine
    }

    /// The room hub.
    pub fn hub(&self) -> &Arc<RoomHub> {
        &self.hub
    }

    /// The storage collaborator.
    pub fn storage(&self) -> &MemoryStorage {
        &self.storage
    }

    /// Run the server, accepting connections until shut down.
    pub async fn run(self) -> Result<(), ServerError> {
        tracing::info!("Server listening on {}", self.transport.local_addr()?);

        let active = Arc::new(AtomicUsize::new(0));
        let settings = ConnectionSettings {
            queue_capacity: self.config.queue_capacity,
            session: self.config.session.clone(),
        };

        loop {
            match self.transport.accept().await {
                Ok(conn) => {
                    if active.load(Ordering::SeqCst) >= self.config.max_connections {
                        tracing::warn!(
                            remote = %conn.remote_addr(),
                            "max connections exceeded; refusing"
                        );
                        conn.close(1u32.into(), b"server full");
                        continue;
                    }

                    active.fetch_add(1, Ordering::SeqCst);

                    let hub = Arc::clone(&self.hub);
                    let router = Arc::clone(&self.router);
                    let storage = self.storage.clone();
                    let env = self.env.clone();
                    let settings = settings.clone();
                    let active = Arc::clone(&active);

                    tokio::spawn(async move {
                        if let Err(e) =
                            connection::run_connection(conn, hub, router, storage, env, settings)
                                .await
                        {
                            tracing::debug!("connection error: {e}");
                        }
                        active.fetch_sub(1, Ordering::SeqCst);
                    });
                },
                Err(e) => {
                    tracing::error!("accept error: {e}");
                },
            }
        }
    }
}
