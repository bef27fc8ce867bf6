//! UDP transport.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;

use crate::error::DhtError;
use crate::wire::MAX_DATAGRAM;

/// Nonblocking UDP socket shared between the send paths and the protocol's
/// receive loop.
#[derive(Debug, Clone)]
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
}

impl UdpTransport {
    /// Bind to `host:port`. Port 0 binds an ephemeral port; use
    /// [`local_addr`](Self::local_addr) to discover it.
    pub async fn bind(host: &str, port: u16) -> Result<Self, DhtError> {
        let socket = UdpSocket::bind((host, port)).await?;
        Ok(Self {
            socket: Arc::new(socket),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, DhtError> {
        Ok(self.socket.local_addr()?)
    }

    /// Handle for the protocol's receive loop.
    pub fn socket(&self) -> Arc<UdpSocket> {
        Arc::clone(&self.socket)
    }

    /// Send one datagram. Oversize payloads are rejected, never fragmented.
    pub async fn send_to(&self, data: &[u8], endpoint: (&str, u16)) -> Result<(), DhtError> {
        if data.len() > MAX_DATAGRAM {
            return Err(DhtError::DatagramTooLarge {
                size: data.len(),
                max: MAX_DATAGRAM,
            });
        }
        self.socket.send_to(data, endpoint).await?;
        Ok(())
    }
}
