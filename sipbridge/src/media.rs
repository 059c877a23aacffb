//! Media relay plane.
//!
//! A bounded pool of UDP ports hands one socket to each dialog that
//! steers media. Forwarding is blind: datagrams read on one leg are
//! written to the linked leg's socket toward that peer's last-known
//! RTP endpoint. The echo responder uses the same loop shape but
//! reflects to the sender.

use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;

use crate::session::SipSession;

/// DSCP EF, shifted into the TOS field. Media sockets are marked
/// expedited-forwarding.
pub const DSCP_EF: u32 = 46 << 2;

/// DSCP AF41 for the SIP signaling socket.
pub const DSCP_AF41: u32 = 34 << 2;

/// Largest RTP datagram the relay copies.
const RTP_MAX_SIZE: usize = 2048;

/// Binds a UDP socket with the given traffic class. Lacking the
/// privilege to set TOS only logs a warning.
pub fn bind_udp(ip: IpAddr, port: u16, tos: u32) -> std::io::Result<UdpSocket> {
    let domain = if ip.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    if let Err(err) = socket.set_tos(tos) {
        tracing::warn!(%err, tos, "could not set DSCP marking on socket");
    }
    socket.set_nonblocking(true)?;
    socket.bind(&SocketAddr::new(ip, port).into())?;
    UdpSocket::from_std(socket.into())
}

/// The bounded media port pool.
pub struct MediaPool {
    server_ip: IpAddr,
    start_port: u16,
    end_port: u16,
    used: Mutex<HashSet<u16>>,
}

impl MediaPool {
    pub fn new(server_ip: IpAddr, start_port: u16, end_port: u16) -> Self {
        MediaPool {
            server_ip,
            start_port,
            end_port,
            used: Mutex::new(HashSet::new()),
        }
    }

    /// Linearly searches the range for a free port, binds it with
    /// DSCP EF and marks it used. `None` when the pool is exhausted.
    pub fn reserve_socket(&self) -> Option<Arc<UdpSocket>> {
        let mut used = self.used.lock().expect("media pool lock");
        for port in self.start_port..=self.end_port {
            if used.contains(&port) {
                continue;
            }
            match bind_udp(self.server_ip, port, DSCP_EF) {
                Ok(socket) => {
                    used.insert(port);
                    return Some(Arc::new(socket));
                }
                Err(_) => continue,
            }
        }
        tracing::warn!(ip = %self.server_ip, "no available media ports");
        None
    }

    /// Clears the port of a released socket. Releasing a port that is
    /// already free is logged and reported.
    pub fn release_socket(&self, socket: &UdpSocket) -> bool {
        let Ok(addr) = socket.local_addr() else {
            return false;
        };
        let mut used = self.used.lock().expect("media pool lock");
        if used.remove(&addr.port()) {
            true
        } else {
            tracing::warn!(port = addr.port(), "media port already released");
            false
        }
    }

    pub fn in_use(&self) -> usize {
        self.used.lock().expect("media pool lock").len()
    }

    pub fn capacity(&self) -> usize {
        (self.end_port - self.start_port + 1) as usize
    }
}

/// Spawns the per-dialog forwarding task. The loop restarts itself on
/// I/O errors until the dialog is disposed.
pub fn spawn_forwarder(session: SipSession) {
    tokio::spawn(async move {
        let done = session.done_token();
        loop {
            tokio::select! {
                _ = done.cancelled() => return,
                result = forward_once(&session) => {
                    if let Err(err) = result {
                        tracing::warn!(call_id = %session.call_id(), %err, "media forwarder restarting");
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            }
        }
    });
}

async fn forward_once(session: &SipSession) -> std::io::Result<()> {
    let Some(socket) = session.media_socket() else {
        return Err(std::io::Error::other("no media socket"));
    };
    let mut buf = vec![0u8; RTP_MAX_SIZE];
    loop {
        let (len, _from) = socket.recv_from(&mut buf).await?;
        let Some(linked) = session.linked_session() else {
            continue;
        };
        let (Some(peer_socket), Some(dest)) = (linked.media_socket(), linked.remote_media()) else {
            continue;
        };
        let _ = peer_socket.send_to(&buf[..len], dest).await;
    }
}

/// Spawns the echo-responder loop: datagrams bounce straight back to
/// their source unless the call is held.
pub fn spawn_echo(session: SipSession) {
    tokio::spawn(async move {
        let done = session.done_token();
        loop {
            tokio::select! {
                _ = done.cancelled() => return,
                result = echo_once(&session) => {
                    if let Err(err) = result {
                        tracing::warn!(call_id = %session.call_id(), %err, "echo loop restarting");
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            }
        }
    });
}

async fn echo_once(session: &SipSession) -> std::io::Result<()> {
    let Some(socket) = session.media_socket() else {
        return Err(std::io::Error::other("no media socket"));
    };
    let mut buf = vec![0u8; RTP_MAX_SIZE];
    loop {
        let (len, from) = socket.recv_from(&mut buf).await?;
        if session.is_held() {
            continue;
        }
        let _ = socket.send_to(&buf[..len], from).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local_pool(start: u16, end: u16) -> MediaPool {
        MediaPool::new("127.0.0.1".parse().unwrap(), start, end)
    }

    #[tokio::test]
    async fn reserve_marks_and_release_clears() {
        let pool = local_pool(39100, 39101);
        let a = pool.reserve_socket().unwrap();
        let b = pool.reserve_socket().unwrap();
        assert_eq!(pool.in_use(), 2);
        assert!(pool.reserve_socket().is_none());

        let port_a = a.local_addr().unwrap().port();
        assert!(pool.release_socket(&a));
        drop(a);
        assert_eq!(pool.in_use(), 1);
        // A released port can be handed out again.
        let c = pool.reserve_socket().unwrap();
        assert_eq!(c.local_addr().unwrap().port(), port_a);
        drop(b);
    }

    #[tokio::test]
    async fn double_release_is_reported() {
        let pool = local_pool(39110, 39110);
        let socket = pool.reserve_socket().unwrap();
        assert!(pool.release_socket(&socket));
        assert!(!pool.release_socket(&socket));
    }

    #[tokio::test]
    async fn bound_socket_round_trips() {
        let pool = local_pool(39120, 39125);
        let socket = pool.reserve_socket().unwrap();
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(b"rtp", socket.local_addr().unwrap()).await.unwrap();
        let mut buf = [0u8; 16];
        let (len, from) = socket.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], b"rtp");
        assert_eq!(from, client.local_addr().unwrap());
    }
}
