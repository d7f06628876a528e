//! lanmesh: a serverless LAN signaling mesh.
//!
//! Every instance runs its own authenticated WebSocket signaling
//! relay, advertises it over mDNS, browses for peers doing the same,
//! and keeps a converged, de-duplicated set of reachable signaling
//! endpoints. There is no coordinator and no leader; membership is
//! gated by a single shared secret (the invite code).

pub mod config;
pub mod discovery;
pub mod error;
pub mod identity;
pub mod mesh;
pub mod ports;
pub mod protocol;
pub mod signaling;

pub use config::MeshConfig;
pub use discovery::{Discovery, PeerEvent};
pub use error::{MeshError, Result};
pub use identity::IdentityStore;
pub use mesh::{Mesh, MeshStatus};
pub use protocol::SignalEnvelope;
pub use signaling::{ServerEvent, SignalingServer};
