use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

use crate::config::MeshConfig;
use crate::discovery::{Discovery, PeerEvent};
use crate::error::{MeshError, Result};
use crate::identity::{new_instance_id, IdentityStore};
use crate::ports;
use crate::signaling::SignalingServer;

/// Snapshot of the running mesh, for consumers (UI, transport layer).
#[derive(Debug, Clone)]
pub struct MeshStatus {
    /// Converged signaling endpoints, own endpoint first.
    pub endpoints: Vec<String>,
    pub own_port: u16,
    /// The network secret, doubling as the invite code.
    pub secret: String,
}

/// Composes identity, port allocation, signaling and discovery into a
/// converged set of reachable signaling endpoints.
///
/// Startup is fail-fast and sequential through the signaling server;
/// any failure there leaves nothing half-initialized. Discovery is
/// best-effort: if it cannot be brought up the mesh still runs,
/// serving its own endpoint alone. `join` and `reset` perform a full
/// teardown and rebuild so every component re-initializes under the
/// new secret.
pub struct Mesh {
    config: MeshConfig,
    identity: IdentityStore,
    instance_id: String,
    endpoints_tx: Arc<watch::Sender<Vec<String>>>,
    runtime: Mutex<Option<MeshRuntime>>,
}

struct MeshRuntime {
    server: Arc<SignalingServer>,
    discovery: Option<Arc<Discovery>>,
    own_port: u16,
    secret: String,
    event_task: JoinHandle<()>,
}

impl Mesh {
    pub fn new(config: MeshConfig) -> Result<Self> {
        let identity = IdentityStore::open(&config)?;
        let (endpoints_tx, _) = watch::channel(Vec::new());
        Ok(Self {
            config,
            identity,
            instance_id: new_instance_id(),
            endpoints_tx: Arc::new(endpoints_tx),
            runtime: Mutex::new(None),
        })
    }

    /// Bring the mesh up: load the secret, allocate a port, start the
    /// signaling server, advertise, browse. No-op if already running.
    /// A discovery failure is logged and the mesh comes up without it.
    pub async fn start(&self) -> Result<()> {
        let mut runtime = self.runtime.lock().await;
        if runtime.is_some() {
            return Ok(());
        }

        let secret = self.identity.load();
        tracing::info!(instance_id = %self.instance_id, "starting mesh");

        let own_port =
            ports::allocate_port(self.config.port_range_start, self.config.port_range_end).await?;

        let server = Arc::new(SignalingServer::start(own_port, &secret).await?);

        let (discovery, events) = match self.bring_up_discovery(own_port) {
            Ok((discovery, events)) => (Some(discovery), Some(events)),
            Err(e) => {
                tracing::warn!("discovery unavailable, continuing without it: {e}");
                (None, None)
            }
        };

        let event_task = spawn_endpoint_task(
            Arc::clone(&self.endpoints_tx),
            own_port,
            discovery.clone(),
            events,
            self.config.settle_delay,
        );

        *runtime = Some(MeshRuntime {
            server,
            discovery,
            own_port,
            secret,
            event_task,
        });
        tracing::info!(port = own_port, "mesh is up");
        Ok(())
    }

    fn bring_up_discovery(
        &self,
        own_port: u16,
    ) -> Result<(Arc<Discovery>, mpsc::UnboundedReceiver<PeerEvent>)> {
        let discovery = Arc::new(Discovery::new(&self.instance_id)?);
        discovery.advertise(&self.config.service_name, own_port)?;
        let events = discovery.start_discovery()?;
        Ok((discovery, events))
    }

    /// Tear everything down: signaling server first (announcing the
    /// departure and closing all connections), then discovery, so we
    /// never advertise a dead endpoint. No-op if not running.
    pub async fn shutdown(&self) {
        let mut runtime = self.runtime.lock().await;
        let Some(rt) = runtime.take() else {
            return;
        };
        tracing::info!("shutting down mesh");

        rt.event_task.abort();
        rt.server.broadcast_shutdown();
        rt.server.stop();
        if let Some(discovery) = &rt.discovery {
            discovery.stop();
        }
        self.endpoints_tx.send_replace(Vec::new());
    }

    /// Adopt a caller-supplied secret and restart the whole component
    /// graph under it.
    pub async fn join(&self, secret: &str) -> Result<()> {
        tracing::info!("joining mesh with supplied invite code");
        self.identity.set(secret);
        self.shutdown().await;
        self.start().await
    }

    /// Generate a fresh secret (abandoning the current mesh) and
    /// restart under it. Returns the new invite code.
    pub async fn reset(&self) -> Result<String> {
        tracing::info!("resetting network secret");
        let secret = self.identity.reset();
        self.shutdown().await;
        self.start().await?;
        Ok(secret)
    }

    /// Current endpoints, own port and secret.
    pub async fn status(&self) -> Result<MeshStatus> {
        let runtime = self.runtime.lock().await;
        let rt = runtime.as_ref().ok_or(MeshError::NotRunning)?;
        Ok(MeshStatus {
            endpoints: self.endpoints_tx.borrow().clone(),
            own_port: rt.own_port,
            secret: rt.secret.clone(),
        })
    }

    /// Number of clients currently registered with our signaling
    /// server. Zero when the mesh is down.
    pub async fn peer_count(&self) -> usize {
        match self.runtime.lock().await.as_ref() {
            Some(rt) => rt.server.peer_count(),
            None => 0,
        }
    }

    /// The invite code peers need to join this mesh. Available whether
    /// or not the mesh is running.
    pub fn invite_code(&self) -> String {
        self.identity.load()
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Watch the endpoint set; a new value is published on every
    /// recomputation.
    pub fn subscribe(&self) -> watch::Receiver<Vec<String>> {
        self.endpoints_tx.subscribe()
    }
}

/// First computation waits out the settle delay so the initial wave of
/// mDNS responses can land; after that every peer event triggers a
/// full recompute. Without discovery the set is published once and
/// stays at the own endpoint.
fn spawn_endpoint_task(
    tx: Arc<watch::Sender<Vec<String>>>,
    own_port: u16,
    discovery: Option<Arc<Discovery>>,
    mut events: Option<mpsc::UnboundedReceiver<PeerEvent>>,
    settle: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(settle).await;
        publish_endpoints(&tx, own_port, discovery.as_deref());
        let Some(events) = events.as_mut() else {
            return;
        };
        while let Some(event) = events.recv().await {
            tracing::debug!(?event, "peers changed");
            publish_endpoints(&tx, own_port, discovery.as_deref());
        }
    })
}

fn publish_endpoints(tx: &watch::Sender<Vec<String>>, own_port: u16, discovery: Option<&Discovery>) {
    let peers = discovery.map(|d| d.discovered_peers()).unwrap_or_default();
    let endpoints = compute_endpoints(own_port, peers);
    tracing::info!(count = endpoints.len(), "endpoint set updated");
    tx.send_replace(endpoints);
}

/// The converged endpoint set: our own endpoint first, then every
/// discovered endpoint, sorted by instance id for a stable order.
/// Anything resolving to our own port is a self-advertisement artifact
/// and is dropped, as are duplicate URLs.
fn compute_endpoints(own_port: u16, mut peers: Vec<(String, String)>) -> Vec<String> {
    peers.sort_by(|a, b| a.0.cmp(&b.0));

    let mut endpoints = vec![format!("ws://localhost:{own_port}")];
    for (_, url) in peers {
        if url_port(&url) == Some(own_port) {
            continue;
        }
        if !endpoints.contains(&url) {
            endpoints.push(url);
        }
    }
    endpoints
}

fn url_port(url: &str) -> Option<u16> {
    url::Url::parse(url).ok().and_then(|u| u.port())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(id: &str, url: &str) -> (String, String) {
        (id.to_string(), url.to_string())
    }

    #[test]
    fn own_endpoint_comes_first() {
        let endpoints = compute_endpoints(5001, vec![peer("y", "ws://10.0.0.2:5002")]);
        assert_eq!(endpoints, vec!["ws://localhost:5001", "ws://10.0.0.2:5002"]);
    }

    #[test]
    fn own_port_artifacts_are_dropped() {
        // Our own record echoed back from the network must not appear
        // as a second entry for the same server.
        let endpoints = compute_endpoints(
            5001,
            vec![
                peer("self-echo", "ws://192.168.1.4:5001"),
                peer("y", "ws://192.168.1.5:5002"),
            ],
        );
        assert_eq!(endpoints, vec!["ws://localhost:5001", "ws://192.168.1.5:5002"]);
    }

    #[test]
    fn duplicate_urls_are_dropped() {
        let endpoints = compute_endpoints(
            5001,
            vec![
                peer("a", "ws://10.0.0.2:5002"),
                peer("b", "ws://10.0.0.2:5002"),
            ],
        );
        assert_eq!(endpoints.len(), 2);
    }

    #[test]
    fn order_is_stable_across_recomputation() {
        let forwards = compute_endpoints(
            5001,
            vec![peer("b", "ws://h2:5003"), peer("a", "ws://h1:5002")],
        );
        let backwards = compute_endpoints(
            5001,
            vec![peer("a", "ws://h1:5002"), peer("b", "ws://h2:5003")],
        );
        assert_eq!(forwards, backwards);
        assert_eq!(forwards, vec!["ws://localhost:5001", "ws://h1:5002", "ws://h2:5003"]);
    }

    #[test]
    fn no_peers_means_singleton_set() {
        assert_eq!(compute_endpoints(5005, vec![]), vec!["ws://localhost:5005"]);
    }

    #[test]
    fn url_port_parses_ws_urls() {
        assert_eq!(url_port("ws://10.0.0.2:5002"), Some(5002));
        assert_eq!(url_port("not a url"), None);
    }

    #[tokio::test]
    async fn own_endpoint_is_published_even_without_discovery() {
        let (tx, mut rx) = watch::channel(Vec::new());
        let task = spawn_endpoint_task(
            Arc::new(tx),
            5007,
            None,
            None,
            Duration::from_millis(10),
        );

        tokio::time::timeout(Duration::from_secs(5), rx.changed())
            .await
            .expect("endpoint set was never published")
            .unwrap();
        assert_eq!(*rx.borrow(), vec!["ws://localhost:5007".to_string()]);
        task.await.unwrap();
    }
}
