//! UDP transport: source-port randomization backed by a pre-bound socket
//! pool.
//!
//! Sockets are bound to random high ports at startup and leased per query
//! with a lock-free scan over in-use flags. When every slot is busy the
//! query falls back to a fresh ephemeral socket that is closed on return;
//! pooled sockets go back to the pool. Loopback destinations bypass the
//! pool entirely.

use std::collections::HashSet;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rand::Rng;
use tokio::net::UdpSocket;
use tracing::{debug, info};

use super::socks5::{self, Socks5Config};

const RECV_BUF: usize = 4096;
const BIND_ATTEMPTS: usize = 8;

pub struct SocketPool {
    v4: Vec<PoolSlot>,
    v6: Vec<PoolSlot>,
}

struct PoolSlot {
    socket: Arc<UdpSocket>,
    busy: Arc<AtomicBool>,
}

/// A socket leased from the pool (returned on drop) or an ephemeral
/// stand-in (closed on drop).
pub struct LeasedSocket {
    socket: Arc<UdpSocket>,
    busy: Option<Arc<AtomicBool>>,
}

impl Drop for LeasedSocket {
    fn drop(&mut self) {
        if let Some(busy) = &self.busy {
            busy.store(false, Ordering::Release);
        }
    }
}

impl std::ops::Deref for LeasedSocket {
    type Target = UdpSocket;

    fn deref(&self) -> &UdpSocket {
        &self.socket
    }
}

impl SocketPool {
    pub async fn bind(size: usize, excluded_ports: &[u16]) -> SocketPool {
        let excluded: HashSet<u16> = excluded_ports.iter().copied().collect();
        let v4 = fill(IpAddr::V4(Ipv4Addr::UNSPECIFIED), size, &excluded).await;
        let v6 = fill(IpAddr::V6(Ipv6Addr::UNSPECIFIED), size, &excluded).await;
        info!(
            "UDP socket pool ready: {} IPv4 + {} IPv6 sockets",
            v4.len(),
            v6.len()
        );
        SocketPool { v4, v6 }
    }

    pub fn size(&self) -> usize {
        self.v4.len() + self.v6.len()
    }

    /// Lease a socket suitable for reaching `remote`.
    pub async fn lease(&self, remote: &SocketAddr) -> io::Result<LeasedSocket> {
        if remote.ip().is_loopback() {
            let bind_ip: IpAddr = match remote {
                SocketAddr::V4(_) => Ipv4Addr::LOCALHOST.into(),
                SocketAddr::V6(_) => Ipv6Addr::LOCALHOST.into(),
            };
            let socket = UdpSocket::bind((bind_ip, 0)).await?;
            return Ok(LeasedSocket { socket: Arc::new(socket), busy: None });
        }

        let slots = match remote {
            SocketAddr::V4(_) => &self.v4,
            SocketAddr::V6(_) => &self.v6,
        };
        if !slots.is_empty() {
            let start = rand::thread_rng().gen_range(0..slots.len());
            for i in 0..slots.len() {
                let slot = &slots[(start + i) % slots.len()];
                if slot
                    .busy
                    .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
                {
                    return Ok(LeasedSocket {
                        socket: slot.socket.clone(),
                        busy: Some(slot.busy.clone()),
                    });
                }
            }
        }

        // Pool exhausted (or the family has no slots): never wait, take a
        // throwaway ephemeral socket instead.
        let bind_ip: IpAddr = match remote {
            SocketAddr::V4(_) => Ipv4Addr::UNSPECIFIED.into(),
            SocketAddr::V6(_) => Ipv6Addr::UNSPECIFIED.into(),
        };
        let socket = UdpSocket::bind((bind_ip, 0)).await?;
        Ok(LeasedSocket { socket: Arc::new(socket), busy: None })
    }
}

async fn fill(bind_ip: IpAddr, size: usize, excluded: &HashSet<u16>) -> Vec<PoolSlot> {
    let mut slots = Vec::with_capacity(size);
    for _ in 0..size {
        match bind_random(bind_ip, excluded).await {
            Some(socket) => slots.push(PoolSlot {
                socket: Arc::new(socket),
                busy: Arc::new(AtomicBool::new(false)),
            }),
            None => {
                debug!("Stopped filling {:?} pool at {} sockets", bind_ip, slots.len());
                break;
            }
        }
    }
    slots
}

async fn bind_random(bind_ip: IpAddr, excluded: &HashSet<u16>) -> Option<UdpSocket> {
    for _ in 0..BIND_ATTEMPTS {
        let port: u16 = rand::thread_rng().gen_range(1024..=u16::MAX);
        if excluded.contains(&port) {
            continue;
        }
        if let Ok(socket) = UdpSocket::bind((bind_ip, port)).await {
            return Some(socket);
        }
    }
    None
}

/// One query/response exchange against `target`. Datagrams from other
/// sources or with a stale transaction ID are discarded; the caller
/// bounds the whole exchange with its per-attempt timeout.
pub async fn exchange(
    pool: &SocketPool,
    target: SocketAddr,
    query: &[u8],
) -> io::Result<Vec<u8>> {
    let socket = pool.lease(&target).await?;
    socket.send_to(query, target).await?;
    let mut buf = vec![0u8; RECV_BUF];
    loop {
        let (len, src) = socket.recv_from(&mut buf).await?;
        if src != target {
            continue;
        }
        if len < 2 || buf[..2] != query[..2] {
            continue;
        }
        return Ok(buf[..len].to_vec());
    }
}

/// The same exchange relayed through a SOCKS5 UDP association.
pub async fn exchange_via_proxy(
    proxy: &Socks5Config,
    host: &str,
    port: u16,
    query: &[u8],
) -> io::Result<Vec<u8>> {
    let assoc = socks5::udp_associate(proxy).await?;
    let bind_ip: IpAddr = match assoc.relay {
        SocketAddr::V4(_) => Ipv4Addr::UNSPECIFIED.into(),
        SocketAddr::V6(_) => Ipv6Addr::UNSPECIFIED.into(),
    };
    let socket = UdpSocket::bind((bind_ip, 0)).await?;
    let wrapped = socks5::encode_udp_datagram(host, port, query);
    socket.send_to(&wrapped, assoc.relay).await?;

    let mut buf = vec![0u8; RECV_BUF + 262];
    loop {
        let (len, src) = socket.recv_from(&mut buf).await?;
        if src.ip() != assoc.relay.ip() {
            continue;
        }
        let Some(payload) = socks5::decode_udp_datagram(&buf[..len]) else {
            continue;
        };
        if payload.len() < 2 || payload[..2] != query[..2] {
            continue;
        }
        return Ok(payload.to_vec());
    }
}
