use std::net::{SocketAddr, UdpSocket};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tracing::debug;

use crate::conduit::{map_io, Conduit, MIN_IO_TICK};
use crate::error::{Result, TransportError};

/// A UDP socket as a datagram [`Conduit`].
///
/// Each `send` emits one datagram to the configured peer; each `recv`
/// delivers one datagram from anywhere. Source filtering is deliberately
/// absent: the layer above discards traffic that does not parse as a
/// segment, and `cancel` relies on a wake datagram arriving from a
/// throwaway socket.
pub struct UdpConduit {
    socket: UdpSocket,
    peer: Mutex<SocketAddr>,
}

impl UdpConduit {
    /// Bind a socket on `local` that sends to `peer`.
    pub fn bind(local: SocketAddr, peer: SocketAddr) -> Result<Self> {
        let socket = UdpSocket::bind(local).map_err(|e| TransportError::Bind {
            target: local.to_string(),
            source: e,
        })?;
        debug!(%local, %peer, "bound udp conduit");
        Ok(Self {
            socket,
            peer: Mutex::new(peer),
        })
    }

    /// The address this socket is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.socket.local_addr().map_err(TransportError::Io)
    }

    /// Retarget outgoing datagrams, e.g. once a peer's real port is known.
    pub fn set_peer(&self, peer: SocketAddr) {
        *self.peer.lock().unwrap_or_else(PoisonError::into_inner) = peer;
    }

    pub fn peer(&self) -> SocketAddr {
        *self.peer.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Conduit for UdpConduit {
    fn send(&self, buf: &[u8], timeout: Duration) -> Result<usize> {
        self.socket
            .set_write_timeout(Some(timeout.max(MIN_IO_TICK)))?;
        self.socket.send_to(buf, self.peer()).map_err(map_io)
    }

    fn recv(&self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        self.socket
            .set_read_timeout(Some(timeout.max(MIN_IO_TICK)))?;
        let (n, _from) = self.socket.recv_from(buf).map_err(map_io)?;
        Ok(n)
    }

    fn ready(&self, timeout: Duration) -> Result<bool> {
        self.socket
            .set_read_timeout(Some(timeout.max(MIN_IO_TICK)))?;
        let mut probe = [0u8; 1];
        match self.socket.peek_from(&mut probe) {
            Ok(_) => Ok(true),
            Err(e) => match map_io(e) {
                TransportError::Timeout => Ok(false),
                other => Err(other),
            },
        }
    }

    fn cancel(&self) {
        // Wake a blocked recv with a throwaway datagram to our own port;
        // receivers discard it as foreign.
        if let Ok(local) = self.socket.local_addr() {
            if let Ok(waker) = UdpSocket::bind((local.ip(), 0)) {
                let _ = waker.send_to(b"wake", local);
            }
        }
    }

    fn kind(&self) -> &'static str {
        "udp"
    }
}
