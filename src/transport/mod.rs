//! Transport layer: UDP primary, optional TCP with Content-Length framing.
//!
//! A `tokio::net` socket driven by a dedicated read loop feeding an `mpsc`
//! channel of parsed `SipMessage`s.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::codec::SipMessage;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Udp,
    Tcp,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Udp => "UDP",
            TransportKind::Tcp => "TCP",
        }
    }
}

#[derive(Debug)]
pub struct InboundMessage {
    pub message: SipMessage,
    pub peer: SocketAddr,
    pub transport: TransportKind,
}

/// Outbound delivery handle shared by every component that needs to send a
/// SIP message (transaction layer, registrar challenge responses).
#[derive(Clone)]
pub struct Transport {
    udp: Arc<UdpSocket>,
    tcp_connections: Arc<Mutex<HashMap<SocketAddr, TcpStream>>>,
    enable_tcp: bool,
}

impl Transport {
    pub async fn bind(bind_addr: SocketAddr, enable_tcp: bool) -> Result<(Self, TcpListenerHandle)> {
        let udp = UdpSocket::bind(bind_addr).await?;
        let listener = if enable_tcp {
            Some(TcpListener::bind(bind_addr).await?)
        } else {
            None
        };

        let transport = Self {
            udp: Arc::new(udp),
            tcp_connections: Arc::new(Mutex::new(HashMap::new())),
            enable_tcp,
        };

        Ok((transport.clone(), TcpListenerHandle { listener }))
    }

    /// Spawns the UDP receive loop, forwarding parsed messages on `tx`.
    /// Malformed datagrams are logged and dropped: no half-parsed message is
    /// ever handed to a caller.
    pub fn spawn_udp_reader(&self, tx: mpsc::UnboundedSender<InboundMessage>, cancel: CancellationToken) {
        let udp = self.udp.clone();
        tokio::spawn(async move {
            let mut buf = [0u8; 65536];
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    result = udp.recv_from(&mut buf) => {
                        match result {
                            Ok((len, peer)) => match SipMessage::parse(&buf[..len]) {
                                Ok(message) => {
                                    if tx.send(InboundMessage { message, peer, transport: TransportKind::Udp }).is_err() {
                                        break;
                                    }
                                }
                                Err(e) => warn!(%peer, error = %e, "dropping malformed UDP datagram"),
                            },
                            Err(e) => {
                                error!(error = %e, "UDP recv error");
                                break;
                            }
                        }
                    }
                }
            }
            debug!("UDP reader loop exited");
        });
    }

    pub fn spawn_tcp_acceptor(
        &self,
        mut listener: TcpListenerHandle,
        tx: mpsc::UnboundedSender<InboundMessage>,
        cancel: CancellationToken,
    ) {
        let Some(listener) = listener.listener.take() else {
            return;
        };
        let connections = self.tcp_connections.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    accepted = listener.accept() => {
                        let Ok((stream, peer)) = accepted else { continue };
                        let tx = tx.clone();
                        let connections = connections.clone();
                        tokio::spawn(read_tcp_connection(stream, peer, tx, connections));
                    }
                }
            }
        });
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.udp.local_addr()?)
    }

    pub async fn send(&self, message: &SipMessage, peer: SocketAddr, kind: TransportKind) -> Result<()> {
        let bytes = message.serialize();
        match kind {
            TransportKind::Udp => {
                self.udp.send_to(&bytes, peer).await?;
            }
            TransportKind::Tcp => {
                if !self.enable_tcp {
                    return Err(Error::not_supported("TCP transport is disabled"));
                }
                let mut connections = self.tcp_connections.lock().await;
                let stream = match connections.get_mut(&peer) {
                    Some(s) => s,
                    None => {
                        let s = TcpStream::connect(peer).await?;
                        connections.entry(peer).or_insert(s)
                    }
                };
                stream.write_all(&bytes).await?;
            }
        }
        Ok(())
    }
}

pub struct TcpListenerHandle {
    listener: Option<TcpListener>,
}

async fn read_tcp_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    tx: mpsc::UnboundedSender<InboundMessage>,
    connections: Arc<Mutex<HashMap<SocketAddr, TcpStream>>>,
) {
    let mut buf = BytesMut::with_capacity(8192);
    let mut read_buf = [0u8; 4096];
    loop {
        match stream.read(&mut read_buf).await {
            Ok(0) => break,
            Ok(n) => {
                buf.extend_from_slice(&read_buf[..n]);
                while let Some(frame) = try_extract_frame(&mut buf) {
                    match SipMessage::parse(&frame) {
                        Ok(message) => {
                            if tx
                                .send(InboundMessage {
                                    message,
                                    peer,
                                    transport: TransportKind::Tcp,
                                })
                                .is_err()
                            {
                                return;
                            }
                        }
                        Err(e) => warn!(%peer, error = %e, "dropping malformed TCP frame"),
                    }
                }
            }
            Err(e) => {
                warn!(%peer, error = %e, "TCP read error");
                break;
            }
        }
    }
    connections.lock().await.remove(&peer);
}

/// Extracts one complete SIP message from `buf` using the Content-Length
/// header to find the frame boundary, leaving any trailing bytes (the start
/// of the next message) in place.
fn try_extract_frame(buf: &mut BytesMut) -> Option<Vec<u8>> {
    let text = std::str::from_utf8(buf).ok()?;
    let header_end = text.find("\r\n\r\n")?;
    let headers = &text[..header_end];
    let content_length: usize = headers
        .lines()
        .find_map(|l| {
            let (name, value) = l.split_once(':')?;
            if name.trim().eq_ignore_ascii_case("Content-Length") || name.trim() == "l" {
                value.trim().parse().ok()
            } else {
                None
            }
        })
        .unwrap_or(0);

    let total_len = header_end + 4 + content_length;
    if buf.len() < total_len {
        return None;
    }
    Some(buf.split_to(total_len).to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_single_frame_by_content_length() {
        let mut buf = BytesMut::from(&b"OPTIONS sip:a SIP/2.0\r\nContent-Length: 2\r\n\r\nhiTRAILING"[..]);
        let frame = try_extract_frame(&mut buf).unwrap();
        assert!(std::str::from_utf8(&frame).unwrap().ends_with("hi"));
        assert_eq!(&buf[..], b"TRAILING");
    }

    #[test]
    fn returns_none_when_incomplete() {
        let mut buf = BytesMut::from(&b"OPTIONS sip:a SIP/2.0\r\nContent-Length: 10\r\n\r\nabc"[..]);
        assert!(try_extract_frame(&mut buf).is_none());
    }
}
