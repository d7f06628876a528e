use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;

use crate::error::{MeshError, Result};
use crate::protocol::SignalEnvelope;

/// Connection lifecycle events, for diagnostics and the orchestrator.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    ConnectionOpened { client_id: String },
    ConnectionClosed { client_id: String },
}

/// Authenticated WebSocket relay for connection-establishment
/// handshakes between peers.
///
/// The server never interprets relayed payloads. Its one authorization
/// check is the `token` query parameter on the upgrade request, which
/// must exactly match the configured network secret; anything else is
/// refused with 401 before a connection is registered.
pub struct SignalingServer {
    registry: Arc<Registry>,
    port: u16,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

struct Registry {
    secret: String,
    clients: Mutex<HashMap<String, mpsc::UnboundedSender<Message>>>,
    events: broadcast::Sender<ServerEvent>,
    stopped: AtomicBool,
}

impl SignalingServer {
    /// Bind the listener and start accepting connections. A bind
    /// failure is fatal and leaves nothing running; the caller decides
    /// whether to retry with another port.
    pub async fn start(port: u16, secret: &str) -> Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", port))
            .await
            .map_err(|source| MeshError::Bind { port, source })?;
        tracing::info!(port, "signaling server listening");

        let (events, _) = broadcast::channel(64);
        let registry = Arc::new(Registry {
            secret: secret.to_string(),
            clients: Mutex::new(HashMap::new()),
            events,
            stopped: AtomicBool::new(false),
        });

        let accept_registry = Arc::clone(&registry);
        let accept_task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, addr)) => {
                        let registry = Arc::clone(&accept_registry);
                        tokio::spawn(async move {
                            handle_connection(stream, addr, registry).await;
                        });
                    }
                    Err(e) => {
                        tracing::warn!("accept failed: {e}");
                    }
                }
            }
        });

        Ok(Self {
            registry,
            port,
            accept_task: Mutex::new(Some(accept_task)),
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn peer_count(&self) -> usize {
        self.registry.clients.lock().unwrap().len()
    }

    pub fn client_ids(&self) -> Vec<String> {
        self.registry.clients.lock().unwrap().keys().cloned().collect()
    }

    /// Subscribe to connection open/close events.
    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.registry.events.subscribe()
    }

    /// Tell every connected client we are going away, without closing
    /// anything. Callers use this right before `stop`.
    pub fn broadcast_shutdown(&self) {
        tracing::info!("broadcasting server shutdown");
        self.registry
            .broadcast(&SignalEnvelope::server_shutdown().to_json(), None);
    }

    /// Close every connection and the listener. Idempotent; repeated
    /// calls are no-ops.
    pub fn stop(&self) {
        if let Some(task) = self.accept_task.lock().unwrap().take() {
            self.registry.stopped.store(true, Ordering::SeqCst);
            task.abort();
        } else {
            return;
        }

        let mut clients = self.registry.clients.lock().unwrap();
        for (client_id, tx) in clients.drain() {
            let _ = tx.send(Message::Close(None));
            tracing::debug!(%client_id, "closed client on stop");
        }
        tracing::info!(port = self.port, "signaling server stopped");
    }
}

impl Drop for SignalingServer {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Registry {
    /// Returns false if the server stopped while this connection was
    /// mid-handshake; the caller must drop it.
    fn register(&self, client_id: &str, tx: mpsc::UnboundedSender<Message>) -> bool {
        if self.stopped.load(Ordering::SeqCst) {
            return false;
        }
        self.clients
            .lock()
            .unwrap()
            .insert(client_id.to_string(), tx);
        let _ = self.events.send(ServerEvent::ConnectionOpened {
            client_id: client_id.to_string(),
        });
        true
    }

    /// Remove a client and tell everyone left that it is gone.
    fn deregister(&self, client_id: &str) {
        let removed = self.clients.lock().unwrap().remove(client_id).is_some();
        if !removed {
            // Already gone, e.g. stop() drained the map first.
            return;
        }
        self.broadcast(&SignalEnvelope::peer_left(client_id).to_json(), None);
        let _ = self.events.send(ServerEvent::ConnectionClosed {
            client_id: client_id.to_string(),
        });
    }

    /// Send to one registered client. A missing target is dropped
    /// silently; it may have disconnected a moment ago.
    fn send_to(&self, client_id: &str, json: &str) {
        let clients = self.clients.lock().unwrap();
        match clients.get(client_id) {
            Some(tx) => {
                let _ = tx.send(Message::Text(json.to_string()));
            }
            None => tracing::debug!(target_id = %client_id, "dropping message for unknown target"),
        }
    }

    /// Send to every registered client except `exclude`.
    fn broadcast(&self, json: &str, exclude: Option<&str>) {
        let clients = self.clients.lock().unwrap();
        for (client_id, tx) in clients.iter() {
            if Some(client_id.as_str()) == exclude {
                continue;
            }
            let _ = tx.send(Message::Text(json.to_string()));
        }
    }
}

async fn handle_connection(stream: TcpStream, addr: SocketAddr, registry: Arc<Registry>) {
    let secret = registry.secret.clone();
    let auth = move |req: &Request, resp: Response| -> std::result::Result<Response, ErrorResponse> {
        if request_token_matches(req, &secret) {
            Ok(resp)
        } else {
            tracing::warn!(%addr, "rejected connection with bad or missing token");
            let mut refusal = ErrorResponse::new(Some("unauthorized".into()));
            *refusal.status_mut() = StatusCode::UNAUTHORIZED;
            Err(refusal)
        }
    };

    let ws = match tokio_tungstenite::accept_hdr_async(stream, auth).await {
        Ok(ws) => ws,
        Err(e) => {
            tracing::debug!(%addr, "websocket handshake failed: {e}");
            return;
        }
    };

    let client_id = format!("client-{}", uuid::Uuid::new_v4().simple());
    tracing::info!(%client_id, %addr, "client connected");

    let (mut sink, mut source) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    // All outbound traffic for this client goes through its queue, so
    // relays from other connections never contend on the sink.
    let writer_id = client_id.clone();
    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let closing = matches!(msg, Message::Close(_));
            if sink.send(msg).await.is_err() || closing {
                break;
            }
        }
        let _ = sink.close().await;
        tracing::trace!(client_id = %writer_id, "writer finished");
    });

    if !registry.register(&client_id, tx.clone()) {
        let _ = tx.send(Message::Close(None));
        return;
    }
    let _ = tx.send(Message::Text(SignalEnvelope::welcome(&client_id).to_json()));
    registry.broadcast(
        &SignalEnvelope::peer_joined(&client_id).to_json(),
        Some(&client_id),
    );

    while let Some(msg) = source.next().await {
        match msg {
            Ok(Message::Text(text)) => relay(&registry, &client_id, &text),
            Ok(Message::Close(_)) => break,
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) | Ok(Message::Frame(_)) => {}
            Ok(Message::Binary(_)) => {
                tracing::debug!(%client_id, "dropping non-text message");
            }
            Err(e) => {
                tracing::debug!(%client_id, "connection error: {e}");
                break;
            }
        }
    }

    tracing::info!(%client_id, "client disconnected");
    registry.deregister(&client_id);
    writer.abort();
}

/// Relay one inbound envelope. Malformed input is logged and dropped;
/// the connection stays open.
fn relay(registry: &Registry, sender_id: &str, text: &str) {
    let mut envelope: SignalEnvelope = match serde_json::from_str(text) {
        Ok(env) => env,
        Err(e) => {
            tracing::debug!(client_id = %sender_id, "dropping malformed envelope: {e}");
            return;
        }
    };

    // Stamp the true sender; whatever the client wrote is discarded.
    envelope.from = Some(sender_id.to_string());
    let json = envelope.to_json();

    match envelope.to.as_deref() {
        Some(target) => registry.send_to(target, &json),
        None => registry.broadcast(&json, Some(sender_id)),
    }
}

fn request_token_matches(req: &Request, secret: &str) -> bool {
    let Some(query) = req.uri().query() else {
        return false;
    };
    url::form_urlencoded::parse(query.as_bytes()).any(|(k, v)| k == "token" && v == secret)
}
