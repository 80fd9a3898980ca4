//! WireGuard device bound to a virtual interface
//!
//! The device is configured with a textual block (see [`super::uapi`]),
//! brought up with [`Device::up`], and from then on a background task moves
//! packets between the interface and a UDP socket connected to the peer:
//!
//! - IP packets read from the interface are encrypted and sent to the peer,
//!   or queued while no session exists;
//! - datagrams from the peer are handshake responses, cookie replies or
//!   transport data, the latter decrypted and written to the interface;
//! - a timer drives handshake retransmission, rekeying, session expiry and
//!   keepalives.

use std::collections::VecDeque;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::{Duration, Instant};

use bytes::Bytes;
use ipnet::IpNet;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use super::handshake::{
    self, CookieJar, PendingHandshake, StaticKeys, MSG_COOKIE_REPLY, MSG_INITIATION,
    MSG_RESPONSE, MSG_TRANSPORT,
};
use super::session::{self, Session, REKEY_ATTEMPT_TIME, REKEY_TIMEOUT};
use super::uapi::{self, DeviceConfig, PeerConfig};
use crate::error::{NetworkError, ProtocolError, Result, TunnelError};
use crate::netstack::NetTun;

/// Buffer size for datagrams from the peer
const BUFFER_SIZE: usize = 65535;

/// How often the timer state is examined
const TIMER_TICK: Duration = Duration::from_millis(250);

/// Packets held while waiting for a session
const MAX_QUEUED_PACKETS: usize = 1024;

/// UDP socket factory for the device
#[derive(Debug, Clone, Default)]
pub struct UdpBind {
    listen_port: Option<u16>,
}

impl UdpBind {
    /// Bind to a fixed local port instead of an ephemeral one
    pub fn with_port(port: u16) -> Self {
        Self {
            listen_port: Some(port),
        }
    }

    /// Open a socket of the endpoint's address family connected to it
    async fn open(&self, endpoint: SocketAddr) -> std::result::Result<UdpSocket, NetworkError> {
        let ip: IpAddr = if endpoint.is_ipv4() {
            Ipv4Addr::UNSPECIFIED.into()
        } else {
            Ipv6Addr::UNSPECIFIED.into()
        };
        let local = SocketAddr::new(ip, self.listen_port.unwrap_or(0));

        let socket = UdpSocket::bind(local)
            .await
            .map_err(|e| NetworkError::BindFailed {
                addr: local.to_string(),
                reason: e.to_string(),
            })?;
        socket
            .connect(endpoint)
            .await
            .map_err(|e| NetworkError::ConnectFailed {
                target: endpoint.to_string(),
                reason: e.to_string(),
            })?;
        Ok(socket)
    }
}

/// A WireGuard device with at most one peer
pub struct Device {
    tun: Option<NetTun>,
    bind: UdpBind,
    config: DeviceConfig,
    task: Option<JoinHandle<()>>,
}

impl Device {
    /// Create a stopped device over `tun`; [`Device::ipc_set`] and [`Device::up`] start it
    pub fn new(tun: NetTun, bind: UdpBind) -> Self {
        Self {
            tun: Some(tun),
            bind,
            config: DeviceConfig::default(),
            task: None,
        }
    }

    /// Apply a configuration block. Settings accumulate across calls until
    /// the device is brought up.
    pub fn ipc_set(&mut self, block: &str) -> std::result::Result<(), TunnelError> {
        if self.task.is_some() {
            return Err(TunnelError::InvalidConfiguration {
                message: "device is already up".to_string(),
            });
        }

        let update = uapi::parse(block)?;

        let mut peers = if update.replace_peers {
            Vec::new()
        } else {
            self.config.peers.clone()
        };
        for peer in update.peers {
            match peers.iter_mut().find(|p| p.public_key == peer.public_key) {
                Some(existing) => existing.merge(peer),
                None => peers.push(peer),
            }
        }
        if peers.len() > 1 {
            return Err(TunnelError::InvalidConfiguration {
                message: format!("only one peer is supported, got {}", peers.len()),
            });
        }

        if update.private_key.is_some() {
            self.config.private_key = update.private_key;
        }
        if let Some(port) = update.listen_port {
            self.bind = UdpBind::with_port(port);
        }
        self.config.peers = peers;

        tracing::debug!("Device configuration applied");
        Ok(())
    }

    /// Bind the UDP socket and start the device task
    pub async fn up(&mut self) -> std::result::Result<(), TunnelError> {
        let private_key = self
            .config
            .private_key
            .ok_or_else(|| activation_failed("no private key configured"))?;
        let peer = self
            .config
            .peers
            .first()
            .cloned()
            .ok_or_else(|| activation_failed("no peer configured"))?;
        let endpoint = peer
            .endpoint
            .ok_or_else(|| activation_failed("peer has no endpoint"))?;
        let tun = self
            .tun
            .take()
            .ok_or_else(|| activation_failed("device was already brought up"))?;

        let socket = self
            .bind
            .open(endpoint)
            .await
            .map_err(|e| activation_failed(e.to_string()))?;
        let local = socket.local_addr().ok();

        let keys = StaticKeys::new(private_key, peer.public_key, peer.preshared_key);
        let task = DeviceTask::new(tun, socket, keys, peer);
        self.task = Some(tokio::spawn(task.run()));

        tracing::debug!(
            "Device up, peer endpoint {} (local {})",
            endpoint,
            local.map(|a| a.to_string()).unwrap_or_else(|| "?".to_string())
        );
        Ok(())
    }

    /// Stop the device task
    pub fn close(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            tracing::debug!("Device closed");
        }
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        self.close();
    }
}

fn activation_failed(reason: impl Into<String>) -> TunnelError {
    TunnelError::ActivationFailed {
        reason: reason.into(),
    }
}

struct DeviceTask {
    tun: NetTun,
    socket: UdpSocket,
    keys: StaticKeys,
    allowed_ips: Vec<IpNet>,
    persistent_keepalive: Option<Duration>,
    cookies: CookieJar,
    pending: Option<PendingHandshake>,
    /// Start of the current series of handshake attempts
    attempt_started: Option<Instant>,
    current: Option<Session>,
    previous: Option<Session>,
    queue: VecDeque<Bytes>,
}

impl DeviceTask {
    fn new(tun: NetTun, socket: UdpSocket, keys: StaticKeys, peer: PeerConfig) -> Self {
        Self {
            tun,
            socket,
            keys,
            allowed_ips: peer.allowed_ips,
            persistent_keepalive: peer
                .persistent_keepalive_interval
                .map(|secs| Duration::from_secs(secs as u64)),
            cookies: CookieJar::default(),
            pending: None,
            attempt_started: None,
            current: None,
            previous: None,
            queue: VecDeque::new(),
        }
    }

    async fn run(mut self) {
        let mut buf = vec![0u8; BUFFER_SIZE];
        let mut timer = interval(TIMER_TICK);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        if let Err(e) = self.begin_handshake().await {
            tracing::warn!("Failed to send handshake initiation: {}", e);
        }

        loop {
            tokio::select! {
                packet = self.tun.read() => match packet {
                    Some(packet) => {
                        if let Err(e) = self.handle_outbound(packet).await {
                            tracing::debug!("Error sending packet: {}", e);
                        }
                    }
                    None => {
                        tracing::debug!("Virtual interface closed, stopping device");
                        return;
                    }
                },

                result = self.socket.recv(&mut buf) => match result {
                    Ok(len) => {
                        if let Err(e) = self.handle_inbound(&buf[..len]).await {
                            tracing::trace!("Dropping datagram from peer: {}", e);
                        }
                    }
                    Err(e) => {
                        // ICMP unreachable surfaces here on connected sockets
                        tracing::debug!("UDP receive error: {}", e);
                    }
                },

                _ = timer.tick() => {
                    if let Err(e) = self.on_timer().await {
                        tracing::debug!("Timer error: {}", e);
                    }
                }
            }
        }
    }

    /// Session that may still be used for sending
    fn sending_session(&mut self) -> Option<&mut Session> {
        self.current.as_mut().filter(|s| !s.is_expired())
    }

    async fn handle_outbound(&mut self, packet: Bytes) -> Result<()> {
        if self.sending_session().is_none() {
            if self.queue.len() >= MAX_QUEUED_PACKETS {
                self.queue.pop_front();
            }
            self.queue.push_back(packet);
            if self.pending.is_none() {
                self.begin_handshake().await?;
            }
            return Ok(());
        }

        let session = self.sending_session().ok_or(ProtocolError::NoSession)?;
        let msg = session.encapsulate(&packet)?;
        let rekey = session.needs_rekey();
        self.send(&msg).await?;

        if rekey && self.pending.is_none() {
            tracing::debug!("Session is due for rekey");
            self.begin_handshake().await?;
        }
        Ok(())
    }

    async fn handle_inbound(&mut self, packet: &[u8]) -> Result<()> {
        match handshake::message_type(packet)? {
            MSG_RESPONSE => self.handle_response(packet).await,
            MSG_COOKIE_REPLY => {
                let pending = self.pending.as_ref().ok_or(ProtocolError::NoSession)?;
                self.cookies.consume_reply(&self.keys, pending, packet)?;
                tracing::debug!("Received cookie reply, next initiation carries MAC2");
                Ok(())
            }
            MSG_TRANSPORT => self.handle_transport(packet).await,
            MSG_INITIATION => {
                tracing::debug!("Ignoring handshake initiation from peer");
                Ok(())
            }
            msg_type => Err(ProtocolError::InvalidMessageType { msg_type }.into()),
        }
    }

    async fn handle_response(&mut self, packet: &[u8]) -> Result<()> {
        let pending = self.pending.as_ref().ok_or(ProtocolError::NoSession)?;
        let keys = pending.consume_response(&self.keys, packet)?;

        tracing::debug!(
            "Handshake complete (local index {}, remote index {})",
            keys.local_index,
            keys.remote_index
        );

        self.pending = None;
        self.attempt_started = None;
        self.previous = self.current.replace(Session::new(keys));

        if self.queue.is_empty() {
            // The responder only confirms the session once it hears from us
            self.send_keepalive().await?;
            return Ok(());
        }
        while let Some(queued) = self.queue.pop_front() {
            let Some(session) = self.sending_session() else {
                break;
            };
            let msg = session.encapsulate(&queued)?;
            self.send(&msg).await?;
        }
        Ok(())
    }

    async fn handle_transport(&mut self, msg: &[u8]) -> Result<()> {
        let index = session::receiver_index(msg).ok_or(ProtocolError::InvalidMessageLength {
            expected: session::TRANSPORT_HEADER_LEN,
            got: msg.len(),
        })?;

        let session = [self.current.as_mut(), self.previous.as_mut()]
            .into_iter()
            .flatten()
            .find(|s| s.local_index == index)
            .ok_or(ProtocolError::InvalidReceiverIndex { index })?;

        let mut packet = session.decapsulate(msg)?;
        if packet.is_empty() {
            tracing::trace!("Received keepalive");
            return Ok(());
        }

        match session::ip_packet_len(&packet) {
            Some(len) if len <= packet.len() => packet.truncate(len),
            _ => {
                tracing::debug!("Dropping malformed packet of {} bytes", packet.len());
                return Ok(());
            }
        }

        match source_address(&packet) {
            Some(source) if self.allowed_ips.iter().any(|net| net.contains(&source)) => {}
            source => {
                tracing::debug!("Dropping packet from disallowed source {:?}", source);
                return Ok(());
            }
        }

        self.tun.write(Bytes::from(packet)).await?;
        Ok(())
    }

    async fn on_timer(&mut self) -> Result<()> {
        if let Some(pending) = &self.pending {
            if pending.elapsed() >= REKEY_TIMEOUT {
                let gave_up = self
                    .attempt_started
                    .is_some_and(|started| started.elapsed() >= REKEY_ATTEMPT_TIME);
                if gave_up {
                    tracing::warn!(
                        "Handshake did not complete after {} seconds, giving up",
                        REKEY_ATTEMPT_TIME.as_secs()
                    );
                    self.pending = None;
                    self.attempt_started = None;
                    self.queue.clear();
                } else {
                    tracing::debug!("Handshake response not received, retrying");
                    self.begin_handshake().await?;
                }
            }
        }

        if self.previous.as_ref().is_some_and(Session::is_expired) {
            self.previous = None;
        }
        if self.current.as_ref().is_some_and(Session::is_expired) {
            tracing::debug!("Session expired");
            self.current = None;
        }

        let Some(session) = self.current.as_ref() else {
            return Ok(());
        };
        let rekey = session.needs_rekey() && self.pending.is_none();
        let keepalive = session.needs_keepalive()
            || self
                .persistent_keepalive
                .is_some_and(|every| session.since_last_sent() >= every);

        if rekey {
            tracing::debug!("Session is due for rekey");
            self.begin_handshake().await?;
        }
        if keepalive {
            self.send_keepalive().await?;
        }
        Ok(())
    }

    /// Send a fresh initiation, starting a new attempt series if none is
    /// running
    async fn begin_handshake(&mut self) -> Result<()> {
        let sender_index: u32 = rand::random();
        let (pending, msg) =
            PendingHandshake::initiate(&self.keys, sender_index, self.cookies.current())?;
        self.attempt_started.get_or_insert_with(Instant::now);
        self.pending = Some(pending);

        tracing::debug!("Sending handshake initiation");
        self.send(&msg).await
    }

    async fn send_keepalive(&mut self) -> Result<()> {
        let session = self.sending_session().ok_or(ProtocolError::NoSession)?;
        let msg = session.encapsulate(&[])?;
        tracing::trace!("Sending keepalive");
        self.send(&msg).await
    }

    async fn send(&self, msg: &[u8]) -> Result<()> {
        self.socket
            .send(msg)
            .await
            .map_err(|e| NetworkError::SendFailed {
                reason: e.to_string(),
            })?;
        Ok(())
    }
}

/// Source address of an IPv4 or IPv6 packet
fn source_address(packet: &[u8]) -> Option<IpAddr> {
    match packet.first()? >> 4 {
        4 => {
            let octets: [u8; 4] = packet.get(12..16)?.try_into().ok()?;
            Some(IpAddr::from(octets))
        }
        6 => {
            let octets: [u8; 16] = packet.get(8..24)?.try_into().ok()?;
            Some(IpAddr::from(octets))
        }
        _ => None,
    }
}
