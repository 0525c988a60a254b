//! Broadcast media carrying sealed frames between devices.

use std::future::Future;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use tokio::net::UdpSocket;
use tokio::sync::{Mutex, broadcast};

use phaser_core::envelope::LinkAddr;
use phaser_core::net::frame::MAX_FRAME_SIZE;

const ADDR_LEN: usize = 6;

#[derive(Debug)]
pub enum MediumError {
    Io(io::Error),
    /// Send refused by the medium.
    Rejected,
    Closed,
}

impl std::fmt::Display for MediumError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "medium I/O error: {e}"),
            Self::Rejected => write!(f, "send rejected"),
            Self::Closed => write!(f, "medium closed"),
        }
    }
}

impl std::error::Error for MediumError {}

impl From<io::Error> for MediumError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

/// A shared broadcast domain. Every frame sent reaches every other member;
/// delivery is best effort.
pub trait BroadcastMedium: Send + Sync + 'static {
    fn local_addr(&self) -> LinkAddr;

    fn send(&self, frame: &[u8]) -> impl Future<Output = Result<(), MediumError>> + Send;

    /// Wait for the next frame from another member.
    fn recv(&self) -> impl Future<Output = Result<(LinkAddr, Vec<u8>), MediumError>> + Send;
}

/// UDP broadcast on `base_port + channel`. Each datagram carries the
/// sender's link address ahead of the frame.
pub struct UdpMedium {
    socket: UdpSocket,
    local: LinkAddr,
    target: SocketAddr,
}

impl UdpMedium {
    pub async fn bind(
        local: LinkAddr,
        bind_ip: IpAddr,
        broadcast_ip: IpAddr,
        port: u16,
    ) -> Result<Self, MediumError> {
        let socket = UdpSocket::bind(SocketAddr::new(bind_ip, port)).await?;
        socket.set_broadcast(true)?;
        tracing::info!(%local, port, "wireless medium bound");
        Ok(Self {
            socket,
            local,
            target: SocketAddr::new(broadcast_ip, port),
        })
    }

    /// Port for a radio channel.
    pub fn channel_port(base_port: u16, channel: u8) -> u16 {
        base_port.saturating_add(u16::from(channel))
    }
}

impl BroadcastMedium for UdpMedium {
    fn local_addr(&self) -> LinkAddr {
        self.local
    }

    async fn send(&self, frame: &[u8]) -> Result<(), MediumError> {
        let mut datagram = Vec::with_capacity(ADDR_LEN + frame.len());
        datagram.extend_from_slice(&self.local.octets());
        datagram.extend_from_slice(frame);
        self.socket.send_to(&datagram, self.target).await?;
        Ok(())
    }

    async fn recv(&self) -> Result<(LinkAddr, Vec<u8>), MediumError> {
        let mut buf = [0u8; ADDR_LEN + MAX_FRAME_SIZE + 1];
        loop {
            let (len, from) = self.socket.recv_from(&mut buf).await?;
            if len < ADDR_LEN {
                tracing::debug!(%from, len, "dropping datagram without a source address");
                continue;
            }
            let mut src = [0u8; ADDR_LEN];
            src.copy_from_slice(&buf[..ADDR_LEN]);
            let src = LinkAddr(src);
            // Broadcast loops our own datagrams back.
            if src == self.local {
                continue;
            }
            return Ok((src, buf[ADDR_LEN..len].to_vec()));
        }
    }
}

/// In-process broadcast domain for tests and simulations.
#[derive(Clone)]
pub struct LoopbackHub {
    tx: broadcast::Sender<(LinkAddr, Vec<u8>)>,
}

impl LoopbackHub {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self { tx }
    }

    /// Attach a member with the given link address.
    pub fn join(&self, addr: LinkAddr) -> LoopbackMedium {
        LoopbackMedium {
            addr,
            tx: self.tx.clone(),
            rx: Mutex::new(self.tx.subscribe()),
            fail_sends: Arc::new(AtomicBool::new(false)),
            send_attempts: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl Default for LoopbackHub {
    fn default() -> Self {
        Self::new()
    }
}

pub struct LoopbackMedium {
    addr: LinkAddr,
    tx: broadcast::Sender<(LinkAddr, Vec<u8>)>,
    rx: Mutex<broadcast::Receiver<(LinkAddr, Vec<u8>)>>,
    fail_sends: Arc<AtomicBool>,
    send_attempts: Arc<AtomicUsize>,
}

impl LoopbackMedium {
    /// Handle that makes subsequent sends fail while set.
    pub fn failure_switch(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.fail_sends)
    }

    /// Counter of send attempts, failed ones included.
    pub fn attempt_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.send_attempts)
    }
}

impl BroadcastMedium for LoopbackMedium {
    fn local_addr(&self) -> LinkAddr {
        self.addr
    }

    async fn send(&self, frame: &[u8]) -> Result<(), MediumError> {
        self.send_attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(MediumError::Rejected);
        }
        // No other members is not an error on a broadcast medium.
        let _ = self.tx.send((self.addr, frame.to_vec()));
        Ok(())
    }

    async fn recv(&self) -> Result<(LinkAddr, Vec<u8>), MediumError> {
        let mut rx = self.rx.lock().await;
        loop {
            match rx.recv().await {
                Ok((src, _)) if src == self.addr => continue,
                Ok(frame) => return Ok(frame),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(dropped = n, "loopback receiver lagged");
                },
                Err(broadcast::error::RecvError::Closed) => return Err(MediumError::Closed),
            }
        }
    }
}
