use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};

use local_ip_address::local_ip;
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{MeshError, Result};

pub const SERVICE_TYPE: &str = "_lanmesh._tcp.local.";
pub const PROTOCOL_VERSION: &str = "2.0";

/// Typed discovery events consumed by the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    Up { instance_id: String, url: String },
    Down { instance_id: String },
}

/// Advertises our signaling endpoint over mDNS and keeps a live view
/// of every other instance's endpoint on the LAN.
///
/// Discovery is best-effort: an `Up` may race with the peer's own
/// shutdown, in which case the stale endpoint just fails later at the
/// transport layer. The peer map always reflects the last up/down
/// event seen per instance id.
pub struct Discovery {
    daemon: ServiceDaemon,
    instance_id: String,
    registered: Mutex<Option<String>>,
    servers: Arc<Mutex<HashMap<String, String>>>,
    fullnames: Arc<Mutex<HashMap<String, String>>>,
    browse_task: Mutex<Option<JoinHandle<()>>>,
}

impl Discovery {
    pub fn new(instance_id: &str) -> Result<Self> {
        let daemon = ServiceDaemon::new()?;
        Ok(Self {
            daemon,
            instance_id: instance_id.to_string(),
            registered: Mutex::new(None),
            servers: Arc::new(Mutex::new(HashMap::new())),
            fullnames: Arc::new(Mutex::new(HashMap::new())),
            browse_task: Mutex::new(None),
        })
    }

    /// Publish our service record: instance name scoped by service name
    /// and instance id, TXT metadata carrying the instance id and
    /// protocol version. Fire-and-forget; no acknowledgement.
    pub fn advertise(&self, service_name: &str, port: u16) -> Result<()> {
        let ip = local_ip().map_err(|e| MeshError::Discovery(e.to_string()))?;
        let instance_name = format!("{}-{}", service_name, self.instance_id);
        let m_hostname = format!("{}.local.", self.instance_id);

        let system_hostname = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown".to_string());

        // Consumers must ignore TXT fields they do not know.
        let properties = [
            ("instanceId", self.instance_id.as_str()),
            ("version", PROTOCOL_VERSION),
            ("host", system_hostname.as_str()),
        ];

        let info = ServiceInfo::new(
            SERVICE_TYPE,
            &instance_name,
            &m_hostname,
            &ip.to_string(),
            port,
            &properties[..],
        )?;

        let fullname = info.get_fullname().to_string();
        self.daemon.register(info)?;
        tracing::info!(%instance_name, %ip, port, "advertising signaling endpoint");

        *self.registered.lock().unwrap() = Some(fullname);
        Ok(())
    }

    /// Begin continuous browsing. Returns the event stream; the
    /// internal peer map is kept in sync as events arrive.
    pub fn start_discovery(&self) -> Result<mpsc::UnboundedReceiver<PeerEvent>> {
        let receiver = self.daemon.browse(SERVICE_TYPE)?;
        let (tx, rx) = mpsc::unbounded_channel();

        let own_id = self.instance_id.clone();
        let servers = Arc::clone(&self.servers);
        let fullnames = Arc::clone(&self.fullnames);

        let task = tokio::spawn(async move {
            while let Ok(event) = receiver.recv_async().await {
                match event {
                    ServiceEvent::ServiceResolved(info) => {
                        let instance_id = info
                            .get_property_val_str("instanceId")
                            .map(|s| s.to_string())
                            .unwrap_or_else(|| instance_from_fullname(info.get_fullname()));

                        if instance_id == own_id {
                            tracing::trace!("ignoring own service record");
                            continue;
                        }

                        let Some(ip) = pick_address(info.get_addresses().iter().map(|a| a.to_ip_addr())) else {
                            tracing::debug!(%instance_id, "resolved record has no address");
                            continue;
                        };
                        let url = endpoint_url(ip, info.get_port());
                        tracing::info!(%instance_id, %url, "peer up");

                        fullnames
                            .lock()
                            .unwrap()
                            .insert(info.get_fullname().to_string(), instance_id.clone());
                        servers.lock().unwrap().insert(instance_id.clone(), url.clone());
                        let _ = tx.send(PeerEvent::Up { instance_id, url });
                    }
                    ServiceEvent::ServiceRemoved(_ty, fullname) => {
                        let instance_id = fullnames
                            .lock()
                            .unwrap()
                            .remove(&fullname)
                            .unwrap_or_else(|| instance_from_fullname(&fullname));

                        if servers.lock().unwrap().remove(&instance_id).is_some() {
                            tracing::info!(%instance_id, "peer down");
                            let _ = tx.send(PeerEvent::Down { instance_id });
                        }
                    }
                    _ => {}
                }
            }
        });
        *self.browse_task.lock().unwrap() = Some(task);

        Ok(rx)
    }

    /// Snapshot of currently discovered signaling endpoint URLs.
    pub fn discovered_servers(&self) -> Vec<String> {
        self.servers.lock().unwrap().values().cloned().collect()
    }

    /// Snapshot of (instance id, endpoint URL) pairs.
    pub fn discovered_peers(&self) -> Vec<(String, String)> {
        self.servers
            .lock()
            .unwrap()
            .iter()
            .map(|(id, url)| (id.clone(), url.clone()))
            .collect()
    }

    /// Stop browsing, unpublish our record, and shut the daemon down.
    /// Idempotent and safe to call even if nothing was started.
    pub fn stop(&self) {
        if let Some(task) = self.browse_task.lock().unwrap().take() {
            task.abort();
            let _ = self.daemon.stop_browse(SERVICE_TYPE);
        }
        if let Some(fullname) = self.registered.lock().unwrap().take() {
            if let Err(e) = self.daemon.unregister(&fullname) {
                tracing::warn!("failed to unregister service: {e}");
            } else {
                tracing::info!("service unpublished");
            }
        }
        let _ = self.daemon.shutdown();
        self.servers.lock().unwrap().clear();
        self.fullnames.lock().unwrap().clear();
    }
}

impl Drop for Discovery {
    fn drop(&mut self) {
        self.stop();
    }
}

/// First label of an mDNS fullname, used when a record carries no
/// `instanceId` TXT property.
fn instance_from_fullname(fullname: &str) -> String {
    fullname.split('.').next().unwrap_or(fullname).to_string()
}

/// Prefer IPv4; fall back to whatever address the record carries.
fn pick_address(addresses: impl Iterator<Item = IpAddr> + Clone) -> Option<IpAddr> {
    addresses
        .clone()
        .find(|a| a.is_ipv4())
        .or_else(|| addresses.into_iter().next())
}

fn endpoint_url(ip: IpAddr, port: u16) -> String {
    format!("ws://{}:{}", ip, port)
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;

    #[test]
    fn fullname_fallback_takes_first_label() {
        assert_eq!(
            instance_from_fullname("lanmesh-abc123._lanmesh._tcp.local."),
            "lanmesh-abc123"
        );
        assert_eq!(instance_from_fullname("bare"), "bare");
    }

    #[test]
    fn ipv4_is_preferred_over_ipv6() {
        let v6: IpAddr = "fe80::1".parse().unwrap();
        let v4: IpAddr = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 9));
        assert_eq!(pick_address([v6, v4].into_iter()), Some(v4));
        assert_eq!(pick_address([v6].into_iter()), Some(v6));
        assert_eq!(pick_address(std::iter::empty::<IpAddr>()), None);
    }

    #[test]
    fn endpoint_url_shape() {
        let ip = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5));
        assert_eq!(endpoint_url(ip, 5001), "ws://10.0.0.5:5001");
    }
}
