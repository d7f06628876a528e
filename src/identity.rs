use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::config::MeshConfig;
use crate::error::{MeshError, Result};

/// On-disk shape of the identity file.
#[derive(Debug, Serialize, Deserialize)]
struct IdentityFile {
    network_secret: String,
}

/// Persists the shared network secret that gates mesh membership.
///
/// The secret doubles as the invite code: `join` overwrites it with a
/// caller-supplied value, `reset` with a freshly generated one. No
/// other component touches the file directly.
pub struct IdentityStore {
    path: PathBuf,
    secret: Mutex<Option<String>>,
}

impl IdentityStore {
    /// Open the store for the given config. The identity file lives at
    /// `<config_dir>/identity.json`; nothing is read until `load`.
    pub fn open(config: &MeshConfig) -> Result<Self> {
        let dir = match &config.config_dir {
            Some(dir) => dir.clone(),
            None => dirs::config_dir()
                .ok_or_else(|| MeshError::Identity("no platform config directory".into()))?
                .join("lanmesh"),
        };
        Ok(Self {
            path: dir.join("identity.json"),
            secret: Mutex::new(None),
        })
    }

    /// Current secret, reading the identity file on first use. A
    /// missing or unreadable file is not an error: a new secret is
    /// generated and persisted in its place.
    pub fn load(&self) -> String {
        let mut guard = self.secret.lock().unwrap();
        if let Some(secret) = guard.as_ref() {
            return secret.clone();
        }

        let secret = match self.read_file() {
            Some(secret) => secret,
            None => {
                let secret = generate_secret();
                tracing::info!("generated new network secret");
                self.write_file(&secret);
                secret
            }
        };
        *guard = Some(secret.clone());
        secret
    }

    /// Replace the secret with a caller-supplied value (joining an
    /// existing mesh). The write is atomic; a write failure is logged
    /// and the in-memory secret still takes effect for this session.
    pub fn set(&self, secret: &str) {
        *self.secret.lock().unwrap() = Some(secret.to_string());
        self.write_file(secret);
    }

    /// Replace the secret with a freshly generated one (creating a new
    /// mesh) and return it.
    pub fn reset(&self) -> String {
        let secret = generate_secret();
        self.set(&secret);
        secret
    }

    fn read_file(&self) -> Option<String> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) => {
                tracing::debug!("identity file not readable ({e}), will generate");
                return None;
            }
        };
        match serde_json::from_str::<IdentityFile>(&content) {
            Ok(file) => Some(file.network_secret),
            Err(e) => {
                tracing::warn!("identity file corrupt ({e}), will generate");
                None
            }
        }
    }

    fn write_file(&self, secret: &str) {
        let file = IdentityFile {
            network_secret: secret.to_string(),
        };
        let json = match serde_json::to_string_pretty(&file) {
            Ok(json) => json,
            Err(e) => {
                tracing::error!("failed to serialize identity file: {e}");
                return;
            }
        };

        if let Some(parent) = self.path.parent() {
            let _ = fs::create_dir_all(parent);
        }

        // Write-then-rename so a crash mid-write leaves the old secret
        // intact rather than a truncated file.
        let tmp = self.path.with_extension("json.tmp");
        let result = fs::write(&tmp, json).and_then(|()| fs::rename(&tmp, &self.path));
        if let Err(e) = result {
            tracing::error!("failed to persist identity file: {e}");
        }
    }
}

/// 256 bits from the OS CSPRNG, hex-encoded.
pub fn generate_secret() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Process-lifetime instance identifier, used to recognize our own
/// mDNS record. Never persisted.
pub fn new_instance_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
