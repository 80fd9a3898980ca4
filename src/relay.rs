//! Byte relay between local streams and a tunnelled TCP connection
//!
//! One connection is dialled. Input is copied to it from a detached task
//! that is never awaited; the caller copies the connection to output and
//! returns when the peer closes. Whatever the detached task still holds at
//! that point is abandoned, and it never half-closes the connection.

use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::error::{NetworkError, Result, WgncError};
use crate::netstack::{NetStack, TcpConn};

/// Opens TCP connections
#[async_trait]
pub trait Dialer: Send + Sync {
    type Conn: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    async fn dial(&self, target: SocketAddr) -> Result<Self::Conn>;
}

#[async_trait]
impl Dialer for NetStack {
    type Conn = TcpConn;

    async fn dial(&self, target: SocketAddr) -> Result<TcpConn> {
        self.dial_tcp(target).await
    }
}

/// Dial `target` and relay until the connection reaches EOF. Returns the
/// number of bytes written to `output`.
pub async fn run<D, R, W>(dialer: &D, target: SocketAddr, mut input: R, mut output: W) -> Result<u64>
where
    D: Dialer + ?Sized,
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Unpin,
{
    let conn = dialer.dial(target).await.map_err(|e| match e {
        WgncError::Network(NetworkError::ConnectFailed { .. }) => e,
        other => NetworkError::ConnectFailed {
            target: target.to_string(),
            reason: other.to_string(),
        }
        .into(),
    })?;
    tracing::debug!("Connected to {}", target);

    let (mut from_peer, mut to_peer) = tokio::io::split(conn);

    // Detached: the handle is dropped, nothing waits for this copy
    tokio::spawn(async move {
        match tokio::io::copy(&mut input, &mut to_peer).await {
            Ok(n) => tracing::debug!("Input reached EOF after {} bytes", n),
            Err(e) => tracing::debug!("Input copy stopped: {}", e),
        }
    });

    let received = tokio::io::copy(&mut from_peer, &mut output).await?;
    output.flush().await?;

    tracing::debug!("Connection closed after {} bytes", received);
    Ok(received)
}
