//! Background task owning the smoltcp interface

use std::collections::VecDeque;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use smoltcp::iface::{Config, Interface, SocketHandle, SocketSet};
use smoltcp::phy::{DeviceCapabilities, Medium, RxToken, TxToken};
use smoltcp::socket::tcp::{Socket as TcpSocket, SocketBuffer, State};
use smoltcp::wire::{HardwareAddress, IpAddress, IpCidr, IpEndpoint};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};
use tokio::sync::{mpsc, oneshot, Notify};

use super::{Command, TcpConn, TcpListener};
use crate::error::{NetworkError, Result, TunnelError};

/// smoltcp receive and send buffer size per socket
const TCP_BUFFER_SIZE: usize = 64 * 1024;
/// Buffer of the duplex pipe handed to the application
const DUPLEX_BUFFER_SIZE: usize = 64 * 1024;
/// Largest read moved between a socket and its pipe in one step
const CHUNK_SIZE: usize = 16 * 1024;
/// Chunks in flight per direction before the pump applies backpressure
const PIPE_DEPTH: usize = 8;
/// Established connections a listener holds before accept is called
const ACCEPT_BACKLOG: usize = 16;

/// First local port handed out to dials
const EPHEMERAL_PORT_START: u16 = 49152;

/// Upper bound on how long the task sleeps without a wakeup
const MAX_IDLE: Duration = Duration::from_secs(1);

struct VirtualDevice {
    inbound: VecDeque<Bytes>,
    outbound: VecDeque<Vec<u8>>,
    mtu: usize,
}

struct VirtRxToken(Bytes);

impl RxToken for VirtRxToken {
    fn consume<R, F>(self, f: F) -> R
    where
        F: FnOnce(&[u8]) -> R,
    {
        f(&self.0)
    }
}

struct VirtTxToken<'a>(&'a mut VecDeque<Vec<u8>>);

impl<'a> TxToken for VirtTxToken<'a> {
    fn consume<R, F>(self, len: usize, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        let mut buf = vec![0u8; len];
        let r = f(&mut buf);
        self.0.push_back(buf);
        r
    }
}

impl smoltcp::phy::Device for VirtualDevice {
    type RxToken<'a> = VirtRxToken;
    type TxToken<'a> = VirtTxToken<'a>;

    fn receive(
        &mut self,
        _timestamp: smoltcp::time::Instant,
    ) -> Option<(Self::RxToken<'_>, Self::TxToken<'_>)> {
        self.inbound
            .pop_front()
            .map(|packet| (VirtRxToken(packet), VirtTxToken(&mut self.outbound)))
    }

    fn transmit(&mut self, _timestamp: smoltcp::time::Instant) -> Option<Self::TxToken<'_>> {
        Some(VirtTxToken(&mut self.outbound))
    }

    fn capabilities(&self) -> DeviceCapabilities {
        let mut caps = DeviceCapabilities::default();
        caps.medium = Medium::Ip;
        caps.max_transmission_unit = self.mtu;
        caps
    }
}

/// Channels between the stack and the two pump tasks of one connection
struct Pipes {
    /// Dropped once the peer has finished sending, which ends the stream
    /// the application reads
    to_app: Option<mpsc::Sender<Bytes>>,
    from_app: mpsc::Receiver<Bytes>,
    unsent: Option<Bytes>,
    app_finished: bool,
    fin_queued: bool,
}

struct Connection {
    handle: SocketHandle,
    local: SocketAddr,
    remote: SocketAddr,
    dial: Option<oneshot::Sender<Result<TcpConn>>>,
    pipes: Option<Pipes>,
}

struct Listener {
    port: u16,
    handle: SocketHandle,
    accepted: mpsc::Sender<TcpConn>,
}

pub(super) struct Stack {
    iface: Interface,
    device: VirtualDevice,
    sockets: SocketSet<'static>,
    addresses: Vec<IpAddr>,
    connections: Vec<Connection>,
    listeners: Vec<Listener>,
    next_port: u16,
    wake: Arc<Notify>,
}

impl Stack {
    pub(super) fn new(addresses: &[IpAddr], mtu: usize) -> Result<Self> {
        let mut device = VirtualDevice {
            inbound: VecDeque::new(),
            outbound: VecDeque::new(),
            mtu,
        };

        let mut config = Config::new(HardwareAddress::Ip);
        config.random_seed = rand::random();
        let mut iface = Interface::new(config, &mut device, smoltcp::time::Instant::now());

        let mut overflow = false;
        iface.update_ip_addrs(|addrs| {
            for addr in addresses {
                let prefix = if addr.is_ipv4() { 32 } else { 128 };
                if addrs.push(IpCidr::new(IpAddress::from(*addr), prefix)).is_err() {
                    overflow = true;
                }
            }
        });
        if overflow {
            return Err(TunnelError::InvalidConfiguration {
                message: format!("too many interface addresses: {:?}", addresses),
            }
            .into());
        }

        // The gateway is never resolved on an IP-medium interface; any
        // route simply hands the packet to the device.
        if addresses.iter().any(IpAddr::is_ipv4) {
            let _ = iface
                .routes_mut()
                .add_default_ipv4_route(Ipv4Addr::new(0, 0, 0, 1));
        }
        if addresses.iter().any(IpAddr::is_ipv6) {
            let _ = iface.routes_mut().add_default_ipv6_route(Ipv6Addr::LOCALHOST);
        }

        Ok(Self {
            iface,
            device,
            sockets: SocketSet::new(vec![]),
            addresses: addresses.to_vec(),
            connections: Vec::new(),
            listeners: Vec::new(),
            next_port: EPHEMERAL_PORT_START,
            wake: Arc::new(Notify::new()),
        })
    }

    pub(super) async fn run(
        mut self,
        mut inbound: mpsc::Receiver<Bytes>,
        outbound: mpsc::Sender<Bytes>,
        mut commands: mpsc::Receiver<Command>,
    ) {
        let mut tun_open = true;
        let mut handles_open = true;

        loop {
            while let Ok(packet) = inbound.try_recv() {
                self.device.inbound.push_back(packet);
            }

            let now = smoltcp::time::Instant::now();
            let _ = self.iface.poll(now, &mut self.device, &mut self.sockets);
            self.service_listeners();
            self.service_connections();
            let _ = self.iface.poll(now, &mut self.device, &mut self.sockets);

            while let Some(packet) = self.device.outbound.pop_front() {
                match outbound.try_send(Bytes::from(packet)) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        tracing::trace!("Device queue full, dropping outbound packet");
                    }
                    Err(TrySendError::Closed(_)) => {
                        tun_open = false;
                        self.device.outbound.clear();
                    }
                }
            }

            if !handles_open && self.connections.is_empty() && self.listeners.is_empty() {
                tracing::debug!("Virtual network stack stopped");
                return;
            }

            let delay = self
                .iface
                .poll_delay(now, &self.sockets)
                .map(|d| Duration::from_micros(d.total_micros()))
                .unwrap_or(MAX_IDLE)
                .min(MAX_IDLE);
            let wake = self.wake.clone();

            tokio::select! {
                packet = inbound.recv(), if tun_open => match packet {
                    Some(packet) => self.device.inbound.push_back(packet),
                    None => tun_open = false,
                },
                command = commands.recv(), if handles_open => match command {
                    Some(command) => self.handle_command(command),
                    None => handles_open = false,
                },
                _ = wake.notified() => {}
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Dial { target, reply } => {
                if let Err(e) = self.dial(target, reply) {
                    tracing::debug!("Dial to {} failed: {}", target, e);
                }
            }
            Command::Listen { port, reply } => {
                let _ = reply.send(self.listen(port));
            }
        }
    }

    fn local_address_for(&self, target: IpAddr) -> Option<IpAddr> {
        self.addresses
            .iter()
            .copied()
            .find(|addr| addr.is_ipv4() == target.is_ipv4())
    }

    fn allocate_port(&mut self) -> u16 {
        let port = self.next_port;
        self.next_port = self.next_port.checked_add(1).unwrap_or(EPHEMERAL_PORT_START);
        port
    }

    fn new_socket() -> TcpSocket<'static> {
        let mut socket = TcpSocket::new(
            SocketBuffer::new(vec![0u8; TCP_BUFFER_SIZE]),
            SocketBuffer::new(vec![0u8; TCP_BUFFER_SIZE]),
        );
        socket.set_nagle_enabled(false);
        socket.set_ack_delay(None);
        socket
    }

    /// Start a connection. On success the reply is sent once the handshake
    /// completes or fails; on error it has already been sent.
    fn dial(
        &mut self,
        target: SocketAddr,
        reply: oneshot::Sender<Result<TcpConn>>,
    ) -> std::result::Result<(), String> {
        let connect_failed = |reason: String| NetworkError::ConnectFailed {
            target: target.to_string(),
            reason,
        };

        let Some(local_ip) = self.local_address_for(target.ip()) else {
            let reason = "no interface address of that family".to_string();
            let _ = reply.send(Err(connect_failed(reason.clone()).into()));
            return Err(reason);
        };
        let local_port = self.allocate_port();

        let mut socket = Self::new_socket();
        if let Err(e) = socket.connect(
            self.iface.context(),
            (target.ip(), target.port()),
            (local_ip, local_port),
        ) {
            let reason = e.to_string();
            let _ = reply.send(Err(connect_failed(reason.clone()).into()));
            return Err(reason);
        }

        let handle = self.sockets.add(socket);
        self.connections.push(Connection {
            handle,
            local: SocketAddr::new(local_ip, local_port),
            remote: target,
            dial: Some(reply),
            pipes: None,
        });
        Ok(())
    }

    fn listen(&mut self, port: u16) -> Result<TcpListener> {
        if self.listeners.iter().any(|l| l.port == port) {
            return Err(NetworkError::BindFailed {
                addr: format!("*:{}", port),
                reason: "port already in use".to_string(),
            }
            .into());
        }

        let handle = self.listen_socket(port)?;
        let (accepted, incoming) = mpsc::channel(ACCEPT_BACKLOG);
        self.listeners.push(Listener {
            port,
            handle,
            accepted,
        });
        Ok(TcpListener { incoming })
    }

    fn listen_socket(&mut self, port: u16) -> Result<SocketHandle> {
        let mut socket = Self::new_socket();
        socket.listen(port).map_err(|e| NetworkError::BindFailed {
            addr: format!("*:{}", port),
            reason: e.to_string(),
        })?;
        Ok(self.sockets.add(socket))
    }

    /// Hand established sockets to their listeners and re-arm the port
    fn service_listeners(&mut self) {
        let mut index = 0;
        while index < self.listeners.len() {
            let handle = self.listeners[index].handle;

            if self.listeners[index].accepted.is_closed() {
                self.sockets.get_mut::<TcpSocket>(handle).abort();
                self.sockets.remove(handle);
                self.listeners.swap_remove(index);
                continue;
            }

            let socket = self.sockets.get_mut::<TcpSocket>(handle);
            if matches!(socket.state(), State::Listen | State::SynReceived) {
                index += 1;
                continue;
            }

            let endpoints = socket.local_endpoint().zip(socket.remote_endpoint());
            let port = self.listeners[index].port;
            match self.listen_socket(port) {
                Ok(fresh) => self.listeners[index].handle = fresh,
                Err(e) => {
                    tracing::warn!("Could not re-arm listener on port {}: {}", port, e);
                    self.listeners.swap_remove(index);
                    continue;
                }
            }

            let Some((local, remote)) = endpoints else {
                // Reset before it was established
                self.sockets.remove(handle);
                continue;
            };

            let local = to_socket_addr(local);
            let remote = to_socket_addr(remote);
            let (pipes, conn) = open_pipes(local, remote, self.wake.clone());
            if self.listeners[index].accepted.try_send(conn).is_err() {
                tracing::debug!("Accept backlog full on port {}, resetting {}", port, remote);
                self.sockets.get_mut::<TcpSocket>(handle).abort();
            }
            tracing::debug!("Accepted {} -> {}", remote, local);
            self.connections.push(Connection {
                handle,
                local,
                remote,
                dial: None,
                pipes: Some(pipes),
            });
        }
    }

    fn service_connections(&mut self) {
        let mut index = 0;
        while index < self.connections.len() {
            let keep = {
                let conn = &mut self.connections[index];
                let socket = self.sockets.get_mut::<TcpSocket>(conn.handle);
                service_connection(conn, socket, &self.wake)
            };
            if keep {
                index += 1;
            } else {
                let conn = self.connections.swap_remove(index);
                self.sockets.remove(conn.handle);
                tracing::debug!("Connection {} -> {} closed", conn.local, conn.remote);
            }
        }
    }
}

/// Move data for one connection. Returns false once the socket can be
/// dropped.
fn service_connection(conn: &mut Connection, socket: &mut TcpSocket<'static>, wake: &Arc<Notify>) -> bool {
    if let Some(reply) = conn.dial.take() {
        match socket.state() {
            State::SynSent | State::SynReceived => {
                conn.dial = Some(reply);
                return true;
            }
            State::Closed | State::TimeWait | State::Closing | State::LastAck => {
                let _ = reply.send(Err(NetworkError::ConnectFailed {
                    target: conn.remote.to_string(),
                    reason: "connection refused".to_string(),
                }
                .into()));
                return false;
            }
            _ => {
                let (pipes, tcp) = open_pipes(conn.local, conn.remote, wake.clone());
                if reply.send(Ok(tcp)).is_err() {
                    // The dialer gave up
                    socket.abort();
                    return false;
                }
                tracing::debug!("Connected {} -> {}", conn.local, conn.remote);
                conn.pipes = Some(pipes);
            }
        }
    }

    let Some(pipes) = conn.pipes.as_mut() else {
        return socket.is_open();
    };

    // Peer -> application
    while socket.can_recv() {
        let Some(to_app) = pipes.to_app.as_ref() else {
            // Nobody reads any more; keep the window open
            let _ = socket.recv(|buf| (buf.len(), ()));
            continue;
        };
        let reader_gone = match to_app.try_reserve() {
            Ok(permit) => {
                match socket.recv(|buf| {
                    let n = buf.len().min(CHUNK_SIZE);
                    (n, Bytes::copy_from_slice(&buf[..n]))
                }) {
                    Ok(chunk) => permit.send(chunk),
                    Err(_) => break,
                }
                false
            }
            Err(TrySendError::Full(())) => break,
            Err(TrySendError::Closed(())) => true,
        };
        if reader_gone {
            pipes.to_app = None;
        }
    }
    if pipes.to_app.is_some() && !socket.may_recv() && !socket.can_recv() {
        pipes.to_app = None;
    }

    // Application -> peer
    loop {
        if pipes.unsent.is_none() {
            match pipes.from_app.try_recv() {
                Ok(chunk) => pipes.unsent = Some(chunk),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    pipes.app_finished = true;
                    break;
                }
            }
        }
        if !socket.can_send() {
            break;
        }
        let Some(chunk) = pipes.unsent.as_mut() else {
            break;
        };
        match socket.send_slice(chunk) {
            Ok(sent) if sent == chunk.len() => pipes.unsent = None,
            Ok(sent) => {
                *chunk = chunk.slice(sent..);
                break;
            }
            Err(_) => {
                pipes.unsent = None;
                break;
            }
        }
    }
    if pipes.app_finished && pipes.unsent.is_none() && !pipes.fin_queued {
        socket.close();
        pipes.fin_queued = true;
    }

    // Buffered data is still delivered after the socket has closed
    if !socket.is_open() && !socket.can_recv() {
        pipes.to_app = None;
        return false;
    }
    true
}

/// Create the application-facing stream of a connection and the two tasks
/// pumping it
fn open_pipes(local: SocketAddr, remote: SocketAddr, wake: Arc<Notify>) -> (Pipes, TcpConn) {
    let (app_side, stack_side) = tokio::io::duplex(DUPLEX_BUFFER_SIZE);
    let (mut reader, mut writer) = tokio::io::split(stack_side);
    let (to_app_tx, mut to_app_rx) = mpsc::channel::<Bytes>(PIPE_DEPTH);
    let (from_app_tx, from_app_rx) = mpsc::channel::<Bytes>(PIPE_DEPTH);

    let read_wake = wake.clone();
    tokio::spawn(async move {
        let mut buf = vec![0u8; CHUNK_SIZE];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if from_app_tx.send(Bytes::copy_from_slice(&buf[..n])).await.is_err() {
                        break;
                    }
                    read_wake.notify_one();
                }
            }
        }
        drop(from_app_tx);
        read_wake.notify_one();
    });

    tokio::spawn(async move {
        while let Some(chunk) = to_app_rx.recv().await {
            if writer.write_all(&chunk).await.is_err() {
                break;
            }
            // Room for more in the pipe
            wake.notify_one();
        }
        let _ = writer.shutdown().await;
        drop(to_app_rx);
        wake.notify_one();
    });

    let pipes = Pipes {
        to_app: Some(to_app_tx),
        from_app: from_app_rx,
        unsent: None,
        app_finished: false,
        fin_queued: false,
    };
    let conn = TcpConn {
        stream: app_side,
        local_addr: local,
        peer_addr: remote,
    };
    (pipes, conn)
}

fn to_socket_addr(endpoint: IpEndpoint) -> SocketAddr {
    SocketAddr::new(IpAddr::from(endpoint.addr), endpoint.port)
}
