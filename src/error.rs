use std::io;

use thiserror::Error;

/// Errors surfaced by the mesh bootstrap layer.
///
/// Port, identity and bind failures are fatal to startup. Discovery
/// failures are returned by the discovery component but the
/// orchestrator logs them and keeps the mesh up without discovery.
/// Per-connection problems (bad token, malformed envelope) and
/// per-discovery-event problems are logged and contained inside their
/// components instead.
#[derive(Debug, Error)]
pub enum MeshError {
    /// Every port in the configured range was taken.
    #[error("no available port in range {start}..{end}")]
    NoPortAvailable { start: u16, end: u16 },

    /// The network secret could not be loaded or generated.
    #[error("identity store: {0}")]
    Identity(String),

    /// The signaling listener failed to bind. The allocator's probe is
    /// only advisory; this bind is the authoritative check and a loss
    /// of the probe race lands here.
    #[error("failed to bind signaling listener on port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: io::Error,
    },

    /// The mDNS daemon could not be created or a record could not be
    /// registered. The orchestrator treats this as non-fatal and runs
    /// with its own endpoint alone until the next restart.
    #[error("discovery: {0}")]
    Discovery(String),

    /// The mesh was asked for something it can only do while running.
    #[error("mesh is not running")]
    NotRunning,
}

impl From<mdns_sd::Error> for MeshError {
    fn from(e: mdns_sd::Error) -> Self {
        MeshError::Discovery(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, MeshError>;
