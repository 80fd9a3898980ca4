//! Tunnel bring-up
//!
//! Turns a [`ConnectionPlan`] into a running WireGuard device attached to a
//! virtual network stack. Every step is fatal; nothing is retried.

use crate::config::keys::base64_to_hex;
use crate::config::ConnectionPlan;
use crate::error::{ConfigError, Result};
use crate::netstack::{self, NetStack};
use crate::resolver::{self, EndpointResolver};
use crate::wireguard::{Device, UdpBind};

/// Default MTU of the virtual interface
pub const DEFAULT_MTU: usize = 1420;

/// Knobs for [`bring_up`]
#[derive(Debug, Clone)]
pub struct BootstrapOptions {
    pub mtu: usize,
}

impl Default for BootstrapOptions {
    fn default() -> Self {
        Self { mtu: DEFAULT_MTU }
    }
}

/// Render the device configuration block for `plan`, with the peer at the
/// already resolved `endpoint`
pub fn render_device_config(
    plan: &ConnectionPlan,
    endpoint: &str,
) -> std::result::Result<String, ConfigError> {
    let mut block = String::new();
    block.push_str(&format!(
        "private_key={}\n",
        base64_to_hex(&plan.local_private_key, "PrivateKey")?
    ));
    block.push_str(&format!(
        "public_key={}\n",
        base64_to_hex(&plan.remote_public_key, "PublicKey")?
    ));
    if let Some(psk) = &plan.preshared_key {
        block.push_str(&format!(
            "preshared_key={}\n",
            base64_to_hex(psk, "PresharedKey")?
        ));
    }
    block.push_str(&format!("endpoint={}\n", endpoint));
    if let Some(secs) = plan.persistent_keepalive {
        block.push_str(&format!("persistent_keepalive_interval={}\n", secs));
    }
    block.push_str("allowed_ip=0.0.0.0/0\n");
    Ok(block)
}

/// Resolve the peer, create the virtual interface and bring the device up
pub async fn bring_up(
    plan: &ConnectionPlan,
    options: &BootstrapOptions,
    resolver: &dyn EndpointResolver,
) -> Result<(Device, NetStack)> {
    let endpoint = resolver::resolve_endpoint(
        resolver,
        &plan.remote_external_host,
        plan.remote_external_port,
    )
    .await?;

    let (tun, stack) = netstack::create_net_tun(&[plan.local_internal_address], options.mtu)?;
    let mut device = Device::new(tun, UdpBind::default());

    let block = render_device_config(plan, &endpoint)?;
    device.ipc_set(&block)?;
    device.up().await?;

    tracing::debug!("Tunnel up: {} via {}", plan.local_internal_address, endpoint);
    Ok((device, stack))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::IpAddr;
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::net::UdpSocket;

    use crate::error::{NetworkError, WgncError};
    use crate::wireguard::handshake::{INITIATION_LEN, MSG_INITIATION};
    use crate::wireguard::uapi;

    // Known pair: private UOvt... derives public Ygk...
    const PRIVATE_B64: &str = "UOvtcWdILFwjb1UnsnK+a9lcqYvNTmtPv+fvqIVOz3w=";
    const PUBLIC_B64: &str = "YgkBjKXER5YarD8STsvMFURw/5nhCLIFOJ5uKWrrMW4=";

    struct StaticResolver(Vec<IpAddr>);

    #[async_trait]
    impl EndpointResolver for StaticResolver {
        async fn lookup(&self, _host: &str) -> Result<Vec<IpAddr>> {
            Ok(self.0.clone())
        }
    }

    fn plan(host: &str, port: u16) -> ConnectionPlan {
        let config = format!(
            "[Interface]\nAddress = 10.0.0.2/32\nPrivateKey = {}\n\n[Peer]\nPublicKey = {}\nEndpoint = {}:{}\nAllowedIPs = 10.0.0.1/32\n",
            PRIVATE_B64, PUBLIC_B64, host, port
        );
        ConnectionPlan::parse(&config).unwrap()
    }

    #[test]
    fn test_render_minimal_block() {
        let plan = plan("vpn.example.com", 51820);
        let block = render_device_config(&plan, "198.51.100.1:51820").unwrap();

        let lines: Vec<&str> = block.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[0].starts_with("private_key=50ebed71"));
        assert!(lines[1].starts_with("public_key=6209018c"));
        assert_eq!(lines[2], "endpoint=198.51.100.1:51820");
        assert_eq!(lines[3], "allowed_ip=0.0.0.0/0");
    }

    #[test]
    fn test_rendered_block_is_accepted_by_device_parser() {
        let mut plan = plan("vpn.example.com", 51820);
        plan.preshared_key = Some(PUBLIC_B64.to_string());
        plan.persistent_keepalive = Some(25);

        let block = render_device_config(&plan, "[2001:db8::1]:51820").unwrap();
        let config = uapi::parse(&block).unwrap();

        assert_eq!(
            hex::encode(config.private_key.unwrap()),
            base64_to_hex(PRIVATE_B64, "PrivateKey").unwrap()
        );
        let peer = &config.peers[0];
        assert_eq!(peer.preshared_key, Some(peer.public_key));
        assert_eq!(peer.endpoint, Some("[2001:db8::1]:51820".parse().unwrap()));
        assert_eq!(peer.persistent_keepalive_interval, Some(25));
        assert_eq!(peer.allowed_ips[0].to_string(), "0.0.0.0/0");
    }

    #[test]
    fn test_render_rejects_bad_base64() {
        let mut plan = plan("vpn.example.com", 51820);
        plan.remote_public_key = "not base64!".to_string();
        assert!(matches!(
            render_device_config(&plan, "198.51.100.1:51820"),
            Err(ConfigError::InvalidKey { field }) if field == "PublicKey"
        ));
    }

    #[tokio::test]
    async fn test_bring_up_sends_initiation_to_resolved_endpoint() {
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = peer.local_addr().unwrap().port();
        let resolver = StaticResolver(vec!["127.0.0.1".parse().unwrap()]);

        let plan = plan("vpn.example.com", port);
        let (_device, stack) = bring_up(&plan, &BootstrapOptions::default(), &resolver)
            .await
            .unwrap();
        assert_eq!(stack.addresses(), &["10.0.0.2".parse::<IpAddr>().unwrap()]);

        let mut buf = [0u8; 256];
        let len = tokio::time::timeout(Duration::from_secs(5), peer.recv(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(len, INITIATION_LEN);
        assert_eq!(buf[0], MSG_INITIATION);
    }

    #[tokio::test]
    async fn test_bring_up_fails_when_resolution_fails() {
        let plan = plan("vpn.example.com", 51820);
        let result = bring_up(&plan, &BootstrapOptions::default(), &StaticResolver(vec![])).await;
        assert!(matches!(
            result,
            Err(WgncError::Network(NetworkError::DnsResolutionFailed { .. }))
        ));
    }

    #[tokio::test]
    async fn test_bring_up_rejects_short_key() {
        let mut plan = plan("127.0.0.1", 51820);
        // Valid base64, wrong length for a key
        plan.remote_public_key = "AAAA".to_string();
        let result = bring_up(&plan, &BootstrapOptions::default(), &StaticResolver(vec![])).await;
        assert!(matches!(result, Err(WgncError::Tunnel(_))));
    }
}
