//! RTPProxy control-protocol client.
//!
//! Speaks the newline-terminated, cookie-prefixed ASCII protocol over either
//! a UDP or UNIX datagram socket. Every outstanding command is correlated by
//! its cookie in a `DashMap`, the same keyed-concurrent-state idiom used
//! everywhere else in this crate (`B2buaService::calls`, the media session
//! table) — here the key is a wire-protocol cookie instead of a Call-ID.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::net::{UdpSocket, UnixDatagram};
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::config::RtpProxyControlAddr;
use crate::{Error, Result};

enum Socket {
    Udp(UdpSocket, std::net::SocketAddr),
    Unix(UnixDatagram, PathBuf),
}

impl Socket {
    async fn send(&self, data: &[u8]) -> std::io::Result<()> {
        match self {
            Socket::Udp(sock, addr) => {
                sock.send_to(data, *addr).await?;
            }
            Socket::Unix(sock, path) => {
                sock.send_to(data, path).await?;
            }
        }
        Ok(())
    }

    async fn recv(&self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Socket::Udp(sock, _) => Ok(sock.recv(buf).await?),
            Socket::Unix(sock, _) => Ok(sock.recv(buf).await?),
        }
    }
}

/// A live RTPProxy-managed media relay session's allocated address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayEndpoint {
    pub address: String,
    pub port: u16,
}

pub struct RtpProxyClient {
    socket: Arc<Socket>,
    pending: Arc<DashMap<String, oneshot::Sender<String>>>,
    cookie_counter: AtomicU64,
    timeout: Duration,
    max_retries: u32,
}

impl RtpProxyClient {
    pub async fn connect(control: &RtpProxyControlAddr, timeout_millis: u64, max_retries: u32) -> Result<Self> {
        let socket = match control {
            RtpProxyControlAddr::Udp { addr } => {
                let bind_addr: std::net::SocketAddr = if addr.is_ipv4() {
                    "0.0.0.0:0".parse().unwrap()
                } else {
                    "[::]:0".parse().unwrap()
                };
                let sock = UdpSocket::bind(bind_addr).await?;
                Socket::Udp(sock, *addr)
            }
            RtpProxyControlAddr::Unix { path } => {
                let bind_path = format!("{path}.client");
                let _ = std::fs::remove_file(&bind_path);
                let sock = UnixDatagram::bind(&bind_path)?;
                Socket::Unix(sock, PathBuf::from(path))
            }
        };

        let client = Self {
            socket: Arc::new(socket),
            pending: Arc::new(DashMap::new()),
            cookie_counter: AtomicU64::new(1),
            timeout: Duration::from_millis(timeout_millis),
            max_retries,
        };
        client.spawn_reader();
        Ok(client)
    }

    fn spawn_reader(&self) {
        let socket = self.socket.clone();
        let pending = self.pending.clone();
        tokio::spawn(async move {
            let mut buf = [0u8; 2048];
            loop {
                match socket.recv(&mut buf).await {
                    Ok(len) => {
                        let reply = String::from_utf8_lossy(&buf[..len]).trim().to_string();
                        let Some((cookie, rest)) = reply.split_once(' ') else {
                            warn!(%reply, "rtpproxy reply missing cookie");
                            continue;
                        };
                        if let Some((_, sender)) = pending.remove(cookie) {
                            let _ = sender.send(rest.to_string());
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "rtpproxy socket read error");
                        break;
                    }
                }
            }
        });
    }

    fn next_cookie(&self) -> String {
        format!("{:x}", self.cookie_counter.fetch_add(1, Ordering::SeqCst))
    }

    async fn send_command(&self, command: &str) -> Result<String> {
        let mut last_err = None;
        for attempt in 0..=self.max_retries {
            let cookie = self.next_cookie();
            let (tx, rx) = oneshot::channel();
            self.pending.insert(cookie.clone(), tx);

            let wire = format!("{cookie} {command}\n");
            if let Err(e) = self.socket.send(wire.as_bytes()).await {
                self.pending.remove(&cookie);
                last_err = Some(Error::MediaBackendUnavailable(e.to_string()));
                continue;
            }

            match timeout(self.timeout, rx).await {
                Ok(Ok(reply)) => return Ok(reply),
                Ok(Err(_)) => {
                    last_err = Some(Error::MediaBackendUnavailable("reply channel closed".into()));
                }
                Err(_) => {
                    self.pending.remove(&cookie);
                    debug!(attempt, command, "rtpproxy command timed out, retrying");
                    last_err = Some(Error::MediaBackendUnavailable(format!(
                        "no reply after {} attempts",
                        attempt + 1
                    )));
                }
            }
        }
        Err(last_err.unwrap_or_else(|| Error::MediaBackendUnavailable("unknown failure".into())))
    }

    pub async fn ping(&self) -> Result<()> {
        let reply = self.send_command("V").await?;
        if reply.is_empty() {
            return Err(Error::MediaBackendUnavailable("empty version reply".into()));
        }
        Ok(())
    }

    /// `U` — create or update a session, returning the relay endpoint
    /// allocated for this leg.
    pub async fn update(&self, call_id: &str, from_tag: &str, to_tag: Option<&str>, remote_addr: &str, remote_port: u16) -> Result<RelayEndpoint> {
        let command = match to_tag {
            Some(to_tag) => format!("U {call_id} {remote_addr} {remote_port} {from_tag} {to_tag}"),
            None => format!("U {call_id} {remote_addr} {remote_port} {from_tag}"),
        };
        let reply = self.send_command(&command).await?;
        parse_port_reply(&reply)
    }

    /// `D` — delete a session.
    pub async fn delete(&self, call_id: &str, from_tag: &str, to_tag: Option<&str>) -> Result<()> {
        let command = match to_tag {
            Some(to_tag) => format!("D {call_id} {from_tag} {to_tag}"),
            None => format!("D {call_id} {from_tag}"),
        };
        self.send_command(&command).await?;
        Ok(())
    }

    /// `I` — information/statistics for a session.
    pub async fn info(&self) -> Result<String> {
        self.send_command("I").await
    }
}

fn parse_port_reply(reply: &str) -> Result<RelayEndpoint> {
    let mut parts = reply.split_whitespace();
    let port: u16 = parts
        .next()
        .ok_or_else(|| Error::MediaSessionError("empty port reply".into()))?
        .parse()
        .map_err(|_| Error::MediaSessionError(format!("non-numeric port in reply: {reply}")))?;
    let address = parts.next().unwrap_or("0.0.0.0").to_string();
    Ok(RelayEndpoint { address, port })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_port_and_address_reply() {
        let endpoint = parse_port_reply("40000 203.0.113.9").unwrap();
        assert_eq!(endpoint.port, 40000);
        assert_eq!(endpoint.address, "203.0.113.9");
    }

    #[test]
    fn rejects_non_numeric_port() {
        assert!(parse_port_reply("notaport 1.2.3.4").is_err());
    }

    #[test]
    fn defaults_address_when_missing() {
        let endpoint = parse_port_reply("40000").unwrap();
        assert_eq!(endpoint.address, "0.0.0.0");
    }
}
