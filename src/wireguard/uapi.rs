//! Textual device configuration
//!
//! The device is configured with `key=value` lines in the style of the
//! WireGuard cross-platform UAPI "set" operation. Device-level keys come
//! first; each `public_key` line opens a peer and the keys after it apply
//! to that peer. Keys are lowercase hex.

use std::net::SocketAddr;

use ipnet::IpNet;

use super::noise::KEY_LEN;
use crate::error::TunnelError;

/// Parsed configuration block
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceConfig {
    pub private_key: Option<[u8; KEY_LEN]>,
    pub listen_port: Option<u16>,
    pub replace_peers: bool,
    pub peers: Vec<PeerConfig>,
}

/// Settings for one peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerConfig {
    pub public_key: [u8; KEY_LEN],
    pub preshared_key: Option<[u8; KEY_LEN]>,
    pub endpoint: Option<SocketAddr>,
    pub persistent_keepalive_interval: Option<u16>,
    pub replace_allowed_ips: bool,
    pub allowed_ips: Vec<IpNet>,
}

impl PeerConfig {
    fn new(public_key: [u8; KEY_LEN]) -> Self {
        Self {
            public_key,
            preshared_key: None,
            endpoint: None,
            persistent_keepalive_interval: None,
            replace_allowed_ips: false,
            allowed_ips: Vec::new(),
        }
    }

    /// Fold a later configuration of the same peer into this one
    pub fn merge(&mut self, update: PeerConfig) {
        if update.preshared_key.is_some() {
            self.preshared_key = update.preshared_key;
        }
        if update.endpoint.is_some() {
            self.endpoint = update.endpoint;
        }
        if update.persistent_keepalive_interval.is_some() {
            self.persistent_keepalive_interval = update.persistent_keepalive_interval;
        }
        if update.replace_allowed_ips {
            self.allowed_ips.clear();
        }
        for net in update.allowed_ips {
            if !self.allowed_ips.contains(&net) {
                self.allowed_ips.push(net);
            }
        }
    }
}

fn invalid(message: impl Into<String>) -> TunnelError {
    TunnelError::InvalidConfiguration {
        message: message.into(),
    }
}

/// Parse a configuration block
pub fn parse(block: &str) -> Result<DeviceConfig, TunnelError> {
    let mut config = DeviceConfig::default();
    let mut peer: Option<PeerConfig> = None;

    for (line_no, line) in block.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (key, value) = line
            .split_once('=')
            .ok_or_else(|| invalid(format!("line {}: expected key=value", line_no + 1)))?;

        if key == "public_key" {
            if let Some(done) = peer.take() {
                config.peers.push(done);
            }
            peer = Some(PeerConfig::new(parse_key(key, value)?));
            continue;
        }

        match peer.as_mut() {
            None => match key {
                "private_key" => config.private_key = Some(parse_key(key, value)?),
                "listen_port" => config.listen_port = Some(parse_number(key, value)?),
                "replace_peers" => config.replace_peers = parse_true(key, value)?,
                "fwmark" => {
                    tracing::debug!("Ignoring fwmark={} (no kernel socket)", value);
                }
                _ => return Err(invalid(format!("unknown device key: {}", key))),
            },
            Some(peer) => match key {
                "preshared_key" => peer.preshared_key = Some(parse_key(key, value)?),
                "endpoint" => {
                    let endpoint = value
                        .parse::<SocketAddr>()
                        .map_err(|_| invalid(format!("invalid endpoint: {}", value)))?;
                    peer.endpoint = Some(endpoint);
                }
                "persistent_keepalive_interval" => {
                    let secs: u16 = parse_number(key, value)?;
                    peer.persistent_keepalive_interval = (secs > 0).then_some(secs);
                }
                "replace_allowed_ips" => peer.replace_allowed_ips = parse_true(key, value)?,
                "allowed_ip" => {
                    let net = value
                        .parse::<IpNet>()
                        .map_err(|_| invalid(format!("invalid allowed_ip: {}", value)))?;
                    peer.allowed_ips.push(net.trunc());
                }
                "protocol_version" => {
                    if value != "1" {
                        return Err(invalid(format!("unsupported protocol_version: {}", value)));
                    }
                }
                _ => return Err(invalid(format!("unknown peer key: {}", key))),
            },
        }
    }

    if let Some(done) = peer {
        config.peers.push(done);
    }
    Ok(config)
}

fn parse_key(key: &str, value: &str) -> Result<[u8; KEY_LEN], TunnelError> {
    let mut out = [0u8; KEY_LEN];
    hex::decode_to_slice(value, &mut out)
        .map_err(|_| invalid(format!("{} must be {} bytes of hex", key, KEY_LEN)))?;
    Ok(out)
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, TunnelError> {
    value
        .parse()
        .map_err(|_| invalid(format!("invalid {}: {}", key, value)))
}

fn parse_true(key: &str, value: &str) -> Result<bool, TunnelError> {
    match value {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(invalid(format!("invalid {}: {}", key, value))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PRIVATE_HEX: &str = "50ebed7167482c5c236f5527b272be6bd95ca98bcd4e6b4fbfe7efa8854ecf7c";
    const PUBLIC_HEX: &str = "6209018ca5c447961aac3f124ecbcc154470ff99e108b205389e6e296aeb316e";

    #[test]
    fn test_parse_block() {
        let block = format!(
            "private_key={}\npublic_key={}\nendpoint=192.0.2.1:51820\npersistent_keepalive_interval=25\nallowed_ip=0.0.0.0/0\n",
            PRIVATE_HEX,
            PUBLIC_HEX
        );
        let config = parse(&block).unwrap();

        assert_eq!(hex::encode(config.private_key.unwrap()), PRIVATE_HEX);
        assert_eq!(config.peers.len(), 1);
        let peer = &config.peers[0];
        assert_eq!(hex::encode(peer.public_key), PUBLIC_HEX);
        assert_eq!(peer.endpoint, Some("192.0.2.1:51820".parse().unwrap()));
        assert_eq!(peer.persistent_keepalive_interval, Some(25));
        assert_eq!(peer.allowed_ips, vec!["0.0.0.0/0".parse::<IpNet>().unwrap()]);
        assert_eq!(peer.preshared_key, None);
    }

    #[test]
    fn test_ipv6_endpoint_and_zero_keepalive() {
        let block = format!(
            "public_key={}\nendpoint=[2001:db8::1]:51820\npersistent_keepalive_interval=0\n",
            PUBLIC_HEX
        );
        let config = parse(&block).unwrap();
        let peer = &config.peers[0];
        assert_eq!(peer.endpoint, Some("[2001:db8::1]:51820".parse().unwrap()));
        assert_eq!(peer.persistent_keepalive_interval, None);
    }

    #[test]
    fn test_rejects_bad_hex() {
        assert!(parse("private_key=zz\n").is_err());
        // Right alphabet, wrong length
        assert!(parse("private_key=abcd\n").is_err());
    }

    #[test]
    fn test_rejects_unknown_keys() {
        assert!(matches!(
            parse("bogus=1\n"),
            Err(TunnelError::InvalidConfiguration { .. })
        ));
        let block = format!("public_key={}\nbogus=1\n", PUBLIC_HEX);
        assert!(parse(&block).is_err());
    }

    #[test]
    fn test_peer_keys_require_public_key() {
        assert!(parse("endpoint=192.0.2.1:51820\n").is_err());
    }

    #[test]
    fn test_rejects_missing_equals() {
        assert!(parse("private_key\n").is_err());
    }

    #[test]
    fn test_allowed_ip_host_bits_cleared() {
        let block = format!("public_key={}\nallowed_ip=10.1.2.3/8\n", PUBLIC_HEX);
        let config = parse(&block).unwrap();
        assert_eq!(config.peers[0].allowed_ips[0].to_string(), "10.0.0.0/8");
    }

    #[test]
    fn test_multiple_peers() {
        let block = format!(
            "replace_peers=true\npublic_key={}\npublic_key={}\n",
            PUBLIC_HEX,
            PRIVATE_HEX
        );
        let config = parse(&block).unwrap();
        assert!(config.replace_peers);
        assert_eq!(config.peers.len(), 2);
    }

    #[test]
    fn test_merge_peer() {
        let key = [1u8; 32];
        let mut peer = PeerConfig::new(key);
        peer.allowed_ips.push("10.0.0.0/8".parse().unwrap());

        let mut update = PeerConfig::new(key);
        update.endpoint = Some("192.0.2.1:1".parse().unwrap());
        update.allowed_ips.push("0.0.0.0/0".parse().unwrap());
        peer.merge(update);
        assert_eq!(peer.allowed_ips.len(), 2);
        assert!(peer.endpoint.is_some());

        let mut update = PeerConfig::new(key);
        update.replace_allowed_ips = true;
        update.allowed_ips.push("192.168.0.0/16".parse().unwrap());
        peer.merge(update);
        assert_eq!(peer.allowed_ips, vec!["192.168.0.0/16".parse::<IpNet>().unwrap()]);
    }
}
