//! In-process TCP/IP stack bound to a packet channel
//!
//! [`create_net_tun`] returns two handles onto one smoltcp interface:
//! - [`NetTun`], the packet side, carries raw IP packets to and from the
//!   WireGuard device;
//! - [`NetStack`], the socket side, dials and accepts TCP connections.
//!
//! A background task owns the interface and its sockets. Each TCP
//! connection surfaces as a [`TcpConn`] implementing `AsyncRead` and
//! `AsyncWrite`.

mod stack;

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio::sync::{mpsc, oneshot};

use crate::error::{Result, TunnelError};

/// Depth of the packet channels between the stack and the device
const PACKET_QUEUE_DEPTH: usize = 256;

/// Depth of the stack's command channel
const COMMAND_QUEUE_DEPTH: usize = 16;

/// Create a virtual interface holding `addresses`, with the given MTU
pub fn create_net_tun(addresses: &[IpAddr], mtu: usize) -> Result<(NetTun, NetStack)> {
    if addresses.is_empty() {
        return Err(TunnelError::InvalidConfiguration {
            message: "virtual interface needs at least one address".to_string(),
        }
        .into());
    }

    let (inbound_tx, inbound_rx) = mpsc::channel(PACKET_QUEUE_DEPTH);
    let (outbound_tx, outbound_rx) = mpsc::channel(PACKET_QUEUE_DEPTH);
    let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);

    let stack = stack::Stack::new(addresses, mtu)?;
    tokio::spawn(stack.run(inbound_rx, outbound_tx, command_rx));

    tracing::debug!("Virtual interface up with {:?}, MTU {}", addresses, mtu);

    Ok((
        NetTun {
            inbound: inbound_tx,
            outbound: outbound_rx,
        },
        NetStack {
            commands: command_tx,
            addresses: addresses.to_vec(),
        },
    ))
}

/// Packet side of the virtual interface
pub struct NetTun {
    inbound: mpsc::Sender<Bytes>,
    outbound: mpsc::Receiver<Bytes>,
}

impl NetTun {
    /// Next IP packet emitted by the stack. `None` once the stack is gone.
    pub async fn read(&mut self) -> Option<Bytes> {
        self.outbound.recv().await
    }

    /// Deliver an IP packet to the stack
    pub async fn write(&self, packet: Bytes) -> std::result::Result<(), TunnelError> {
        self.inbound
            .send(packet)
            .await
            .map_err(|_| TunnelError::Closed)
    }
}

pub(crate) enum Command {
    Dial {
        target: SocketAddr,
        reply: oneshot::Sender<Result<TcpConn>>,
    },
    Listen {
        port: u16,
        reply: oneshot::Sender<Result<TcpListener>>,
    },
}

/// Socket side of the virtual interface
#[derive(Clone)]
pub struct NetStack {
    commands: mpsc::Sender<Command>,
    addresses: Vec<IpAddr>,
}

impl NetStack {
    /// Addresses assigned to the interface
    pub fn addresses(&self) -> &[IpAddr] {
        &self.addresses
    }

    /// Open a TCP connection. Resolves once the three-way handshake is
    /// done; there is no timeout.
    pub async fn dial_tcp(&self, target: SocketAddr) -> Result<TcpConn> {
        let (reply, response) = oneshot::channel();
        self.request(Command::Dial { target, reply }).await?;
        response.await.map_err(|_| TunnelError::Closed)?
    }

    /// Listen for TCP connections on `port` of every interface address
    pub async fn listen_tcp(&self, port: u16) -> Result<TcpListener> {
        let (reply, response) = oneshot::channel();
        self.request(Command::Listen { port, reply }).await?;
        response.await.map_err(|_| TunnelError::Closed)?
    }

    async fn request(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| TunnelError::Closed.into())
    }
}

/// TCP connection through the virtual interface
#[derive(Debug)]
pub struct TcpConn {
    stream: DuplexStream,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
}

impl TcpConn {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }
}

impl AsyncRead for TcpConn {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for TcpConn {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    /// Sends FIN once everything written so far has been handed to the stack
    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}

/// Listening TCP socket on the virtual interface
pub struct TcpListener {
    incoming: mpsc::Receiver<TcpConn>,
}

impl TcpListener {
    /// Wait for the next established connection
    pub async fn accept(&mut self) -> Result<TcpConn> {
        self.incoming
            .recv()
            .await
            .ok_or_else(|| TunnelError::Closed.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::NetworkError;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// Forward packets between two interfaces until either side goes away
    fn wire(mut a: NetTun, mut b: NetTun) {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    packet = a.read() => match packet {
                        Some(packet) => { let _ = b.write(packet).await; }
                        None => break,
                    },
                    packet = b.read() => match packet {
                        Some(packet) => { let _ = a.write(packet).await; }
                        None => break,
                    },
                }
            }
        });
    }

    fn pair() -> (NetStack, NetStack) {
        let (tun_a, stack_a) = create_net_tun(&["10.0.0.1".parse().unwrap()], 1420).unwrap();
        let (tun_b, stack_b) = create_net_tun(&["10.0.0.2".parse().unwrap()], 1420).unwrap();
        wire(tun_a, tun_b);
        (stack_a, stack_b)
    }

    #[tokio::test]
    async fn test_dial_accept_echo_eof() {
        let (client, server) = pair();
        let mut listener = server.listen_tcp(7000).await.unwrap();

        let echo = tokio::spawn(async move {
            let mut conn = listener.accept().await.unwrap();
            assert_eq!(conn.peer_addr().ip(), "10.0.0.1".parse::<IpAddr>().unwrap());
            let mut received = Vec::new();
            conn.read_to_end(&mut received).await.unwrap();
            conn.write_all(&received).await.unwrap();
            conn.shutdown().await.unwrap();
            received.len()
        });

        let mut conn = tokio::time::timeout(
            Duration::from_secs(10),
            client.dial_tcp("10.0.0.2:7000".parse().unwrap()),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(conn.peer_addr(), "10.0.0.2:7000".parse().unwrap());

        let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        conn.write_all(&payload).await.unwrap();
        conn.shutdown().await.unwrap();

        let mut echoed = Vec::new();
        tokio::time::timeout(Duration::from_secs(20), conn.read_to_end(&mut echoed))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(echoed, payload);
        assert_eq!(echo.await.unwrap(), payload.len());
    }

    #[tokio::test]
    async fn test_dial_refused_without_listener() {
        let (client, _server) = pair();
        let result = tokio::time::timeout(
            Duration::from_secs(10),
            client.dial_tcp("10.0.0.2:7001".parse().unwrap()),
        )
        .await
        .unwrap();
        assert!(matches!(
            result,
            Err(crate::error::WgncError::Network(NetworkError::ConnectFailed { .. }))
        ));
    }

    #[tokio::test]
    async fn test_dial_rejects_unspecified_target() {
        let (client, _server) = pair();
        let result = client.dial_tcp("0.0.0.0:22".parse().unwrap()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_requires_an_address() {
        assert!(create_net_tun(&[], 1420).is_err());
    }
}
