//! Connection plan derived from a configuration document
//!
//! The plan takes the local address and key from the interface block and
//! commits to the first peer block whose `Endpoint` contains a colon.

use std::net::{IpAddr, SocketAddr};
use std::path::Path;

use serde::Serialize;

use super::parser::{parse_block, split_sections, Block};
use crate::error::ConfigError;

/// Port dialed inside the tunnel when nothing else is given
pub const DEFAULT_CONNECT_PORT: u16 = 22;

/// Everything needed to bring the tunnel up and dial through it
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionPlan {
    /// Address of our end of the virtual interface
    pub local_internal_address: IpAddr,
    /// Our private key (base64 text)
    pub local_private_key: String,

    /// Outer-network host of the committed peer
    pub remote_external_host: String,
    /// Outer-network port of the committed peer (0 if unparsable)
    pub remote_external_port: u16,
    /// Public key of the committed peer (base64 text)
    pub remote_public_key: String,
    /// Pre-shared key of the committed peer (base64 text)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preshared_key: Option<String>,
    /// Persistent keepalive interval in seconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub persistent_keepalive: Option<u16>,

    /// Address dialed inside the tunnel
    pub remote_connect_address: Option<IpAddr>,
    /// Port dialed inside the tunnel
    pub remote_connect_port: Option<u16>,
}

impl ConnectionPlan {
    /// Read and parse a configuration file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::FileNotFound {
                    path: path.display().to_string(),
                }
            } else {
                ConfigError::Io(e)
            }
        })?;
        Self::parse(&content)
    }

    /// Parse a configuration document
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let sections = split_sections(content);
        if sections.peers.is_empty() {
            return Err(ConfigError::NoPeers);
        }

        let iface = parse_block(sections.interface);

        let address = iface.get("Address").map(String::as_str).unwrap_or_default();
        let local_internal_address = parse_interface_address(address)?;

        let local_private_key = iface
            .get("PrivateKey")
            .filter(|key| !key.is_empty())
            .cloned()
            .ok_or_else(|| ConfigError::MissingField {
                field: "PrivateKey".to_string(),
            })?;

        for (index, chunk) in sections.peers.iter().enumerate() {
            let peer = parse_block(chunk);

            let Some(endpoint) = PeerEndpoint::parse(field(&peer, "Endpoint")) else {
                tracing::debug!("Skipping peer {}: Endpoint has no host:port", index + 1);
                continue;
            };

            let remote_connect_address = parse_allowed_host(field(&peer, "AllowedIPs"));
            if remote_connect_address.is_none() {
                tracing::debug!(
                    "Peer {}: AllowedIPs does not name a single host, connect address left unset",
                    index + 1
                );
            }

            return Ok(ConnectionPlan {
                local_internal_address,
                local_private_key,
                remote_external_host: endpoint.host,
                remote_external_port: endpoint.port,
                remote_public_key: field(&peer, "PublicKey").to_string(),
                preshared_key: peer.get("PresharedKey").filter(|k| !k.is_empty()).cloned(),
                persistent_keepalive: peer
                    .get("PersistentKeepalive")
                    .and_then(|v| v.parse::<u16>().ok())
                    .filter(|&secs| secs > 0),
                remote_connect_address,
                remote_connect_port: remote_connect_address.map(|_| DEFAULT_CONNECT_PORT),
            });
        }

        Err(ConfigError::NoSuitablePeer)
    }

    /// Override the connect address (first positional argument)
    pub fn override_connect_address(&mut self, host: &str) -> Result<(), ConfigError> {
        let addr = host.parse::<IpAddr>().map_err(|_| ConfigError::InvalidAddress {
            value: host.to_string(),
        })?;
        self.remote_connect_address = Some(addr);
        Ok(())
    }

    /// Override the connect port
    pub fn override_connect_port(&mut self, port: u16) {
        self.remote_connect_port = Some(port);
    }

    /// Address and port the relay dials inside the tunnel
    pub fn dial_target(&self) -> Result<SocketAddr, ConfigError> {
        let addr = self
            .remote_connect_address
            .ok_or(ConfigError::MissingConnectAddress)?;
        Ok(SocketAddr::new(
            addr,
            self.remote_connect_port.unwrap_or(DEFAULT_CONNECT_PORT),
        ))
    }
}

/// Host and port of a peer's `Endpoint`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerEndpoint {
    pub host: String,
    pub port: u16,
}

impl PeerEndpoint {
    /// Split at the last colon. No bracket handling is attempted, so
    /// `[::1]:51820` yields the host `[::1]`.
    ///
    /// Returns `None` when there is no colon. An unparsable port becomes 0
    /// instead of disqualifying the peer.
    pub fn parse(value: &str) -> Option<Self> {
        let (host, port) = value.rsplit_once(':')?;
        Some(Self {
            host: host.to_string(),
            port: parse_port(port),
        })
    }
}

/// Parse a port, yielding 0 for anything that is not a `u16`
pub fn parse_port(value: &str) -> u16 {
    value.parse().unwrap_or(0)
}

/// Strip a `/prefix` from the interface address and parse the rest
fn parse_interface_address(value: &str) -> Result<IpAddr, ConfigError> {
    let bare = value.split('/').next().unwrap_or_default();
    bare.parse().map_err(|_| ConfigError::InvalidAddress {
        value: value.to_string(),
    })
}

/// Only a literal `/32` entry names a dialable host
fn parse_allowed_host(value: &str) -> Option<IpAddr> {
    let candidate = value.split("/32").next().unwrap_or_default();
    candidate.parse().ok()
}

fn field<'a>(block: &'a Block, key: &str) -> &'a str {
    block.get(key).map(String::as_str).unwrap_or_default()
}
