//! Configuration for the relay and the mesh side of a session.

use std::time::Duration;

/// Signaling relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address to bind the HTTP/WebSocket listener to
    pub bind_addr: String,
    /// Outbound signaling queue per connection; frames beyond it are dropped
    pub outbound_capacity: usize,
    /// Origin of the browser client, logged at startup
    pub client_url: Option<String>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8001".to_string(),
            outbound_capacity: 256,
            client_url: None,
        }
    }
}

impl RelayConfig {
    /// Read `SWARM_BIND_ADDR`, then `PORT`, then `CLIENT_URL`.
    ///
    /// `SWARM_BIND_ADDR` wins over `PORT` when both are set. Unparseable
    /// ports fall back to the default with a warning.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(addr) = lookup("SWARM_BIND_ADDR").filter(|a| !a.trim().is_empty()) {
            config.bind_addr = addr.trim().to_string();
        } else if let Some(port) = lookup("PORT") {
            match port.trim().parse::<u16>() {
                Ok(port) => config.bind_addr = format!("0.0.0.0:{port}"),
                Err(_) => log::warn!("Ignoring invalid PORT value {port:?}"),
            }
        }

        config.client_url = lookup("CLIENT_URL").filter(|u| !u.trim().is_empty());
        config
    }
}

/// Mesh-side tuning for a [`crate::SwarmSession`].
#[derive(Debug, Clone)]
pub struct MeshConfig {
    /// Time a link may spend between creation and `Open`
    pub handshake_timeout: Duration,
    /// Fresh handshake attempts after the first times out (initiator only)
    pub handshake_retries: u32,
    /// Per-link outbound frame queue
    pub channel_capacity: usize,
    /// Outbound signaling queue towards the relay
    pub signaling_capacity: usize,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
            handshake_retries: 1,
            channel_capacity: 256,
            signaling_capacity: 256,
        }
    }
}

/// Direct TCP transport configuration.
#[derive(Debug, Clone)]
pub struct TcpTransportConfig {
    /// Host the per-link listener binds to
    pub listen_host: String,
    /// Hosts advertised as connectivity candidates. Empty advertises
    /// `listen_host` itself.
    pub advertise_hosts: Vec<String>,
}

impl Default for TcpTransportConfig {
    fn default() -> Self {
        Self {
            listen_host: "127.0.0.1".to_string(),
            advertise_hosts: Vec::new(),
        }
    }
}
