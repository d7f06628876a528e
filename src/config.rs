use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for a mesh instance.
///
/// All fields have working defaults; a bare `MeshConfig::default()` is
/// enough to join the default mesh on the local network.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MeshConfig {
    /// Logical name of the mesh. Scopes the advertised mDNS instance
    /// name; instances with different service names still see each
    /// other's records but stay apart at the transport layer.
    /// Default: `"lanmesh"`.
    pub service_name: String,
    /// First port (inclusive) the allocator probes. Default: 5000.
    pub port_range_start: u16,
    /// End of the probe range (exclusive). Default: 6000.
    pub port_range_end: u16,
    /// How long to wait after startup before computing the first
    /// endpoint set, so the initial wave of mDNS responses can arrive.
    /// Default: 1 second.
    #[serde(with = "duration_millis")]
    pub settle_delay: Duration,
    /// Where to keep the identity file. Defaults to the platform
    /// config dir (`~/.config/lanmesh` on Linux).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_dir: Option<PathBuf>,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            service_name: "lanmesh".into(),
            port_range_start: 5000,
            port_range_end: 6000,
            settle_delay: Duration::from_secs(1),
            config_dir: None,
        }
    }
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
