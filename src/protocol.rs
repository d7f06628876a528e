use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Message types produced by the signaling server itself. Everything
/// else is opaque application payload and is relayed verbatim.
pub const TYPE_WELCOME: &str = "welcome";
pub const TYPE_PEER_JOINED: &str = "peer-joined";
pub const TYPE_PEER_LEFT: &str = "peer-left";
pub const TYPE_SERVER_SHUTDOWN: &str = "server-shutdown";

/// The signaling wire envelope: `{type, from?, to?, ...payload}`.
///
/// The relay never interprets the extra fields; they ride along in
/// `extra` via serde flattening. `from` is always overwritten by the
/// server with the real sender id before a message is relayed, so a
/// client cannot spoof another's identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl SignalEnvelope {
    fn server(kind: &str) -> Self {
        Self {
            kind: kind.to_string(),
            from: None,
            to: None,
            extra: Map::new(),
        }
    }

    fn with_client_id(kind: &str, client_id: &str) -> Self {
        let mut env = Self::server(kind);
        env.extra
            .insert("clientId".into(), Value::String(client_id.to_string()));
        env
    }

    /// Sent to a client right after it authenticates, carrying its
    /// server-assigned id.
    pub fn welcome(client_id: &str) -> Self {
        Self::with_client_id(TYPE_WELCOME, client_id)
    }

    pub fn peer_joined(client_id: &str) -> Self {
        Self::with_client_id(TYPE_PEER_JOINED, client_id)
    }

    pub fn peer_left(client_id: &str) -> Self {
        Self::with_client_id(TYPE_PEER_LEFT, client_id)
    }

    /// Voluntary-departure notice, broadcast before the server stops.
    pub fn server_shutdown() -> Self {
        Self::server(TYPE_SERVER_SHUTDOWN)
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}
