//! End-to-end tests driving the live INVITE -> 2xx -> ACK relay path over
//! real UDP sockets, plus the surrounding signalling edge cases: a down
//! media backend, a CANCEL raced against the B-leg, retransmission, and
//! mid-dialog forwarding once a call is up.

use std::net::SocketAddr;
use std::time::Duration;

use ims_b2bua::codec::{SessionDescription, SipMessage};
use ims_b2bua::config::{GatewayConfig, RtpProxyControlAddr};
use ims_b2bua::core::B2buaServer;
use ims_b2bua::registrar::compute_digest_response;

use tokio::net::UdpSocket;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(2);

fn branch() -> String {
    format!("z9hG4bK{}", uuid::Uuid::new_v4().simple())
}

async fn recv(sock: &UdpSocket) -> (SipMessage, SocketAddr) {
    let mut buf = [0u8; 65536];
    let (len, peer) = timeout(WAIT, sock.recv_from(&mut buf))
        .await
        .expect("timed out waiting for a message")
        .unwrap();
    (SipMessage::parse(&buf[..len]).unwrap(), peer)
}

async fn recv_within(sock: &UdpSocket, dur: Duration) -> Option<(SipMessage, SocketAddr)> {
    let mut buf = [0u8; 65536];
    match timeout(dur, sock.recv_from(&mut buf)).await {
        Ok(Ok((len, peer))) => Some((SipMessage::parse(&buf[..len]).unwrap(), peer)),
        _ => None,
    }
}

/// Reads responses until a final (non-1xx) one arrives, discarding any
/// automatic 100 Trying the transaction layer sent on its own.
async fn recv_final(sock: &UdpSocket) -> (SipMessage, SocketAddr) {
    loop {
        let (msg, peer) = recv(sock).await;
        if msg.status().map(|s| s >= 200).unwrap_or(true) {
            return (msg, peer);
        }
    }
}

/// Polls until the call actor's cleanup task has removed the call from the
/// table, since that happens on a separate spawned task after teardown.
async fn wait_for_call_count(server: &B2buaServer, expected: usize) {
    for _ in 0..20 {
        if server.active_call_count() == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(server.active_call_count(), expected);
}

fn extract_digest_param(header: &str, key: &str) -> String {
    header
        .split(',')
        .find_map(|part| part.trim().strip_prefix(&format!("{key}=")))
        .map(|v| v.trim_matches('"').to_string())
        .unwrap_or_else(|| panic!("missing {key} in {header}"))
}

/// Every test gets its own loopback rtpproxy stand-in and its own B2BUA
/// instance bound to an ephemeral port, so tests never share state.
async fn spawn_fake_rtpproxy() -> SocketAddr {
    let sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = sock.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = [0u8; 2048];
        let mut next_port: u16 = 40000;
        loop {
            let Ok((len, peer)) = sock.recv_from(&mut buf).await else { break };
            let line = String::from_utf8_lossy(&buf[..len]).trim().to_string();
            let Some((cookie, rest)) = line.split_once(' ') else { continue };
            let reply = if rest.starts_with('U') {
                let port = next_port;
                next_port += 2;
                format!("{cookie} {port} 127.0.0.1\n")
            } else {
                format!("{cookie} 0\n")
            };
            let _ = sock.send_to(reply.as_bytes(), peer).await;
        }
    });
    addr
}

fn test_config(rtpproxy_addr: SocketAddr) -> GatewayConfig {
    let mut config = GatewayConfig::default_config();
    config.general.advertised_host = "127.0.0.1".to_string();
    config.sip.bind_address = "127.0.0.1".parse().unwrap();
    config.sip.bind_port = 0;
    // Well above any test's round-trip time so no organic retransmission
    // interferes with the assertions below.
    config.sip.t1_millis = 5000;
    config.sip.t2_millis = 8000;
    config.rtpproxy.control = RtpProxyControlAddr::Udp { addr: rtpproxy_addr };
    config.rtpproxy.timeout_millis = 300;
    config.rtpproxy.max_retries = 1;
    config
}

async fn start_server(rtpproxy_addr: SocketAddr) -> (B2buaServer, SocketAddr) {
    let server = B2buaServer::new(test_config(rtpproxy_addr), None).await.unwrap();
    server.start().await.unwrap();
    let addr = server.local_addr().unwrap();
    (server, addr)
}

/// Registers `aor` from `client`, completing the full challenge/response
/// round trip a real UA would do.
async fn register(server_addr: SocketAddr, client: &UdpSocket, aor: &str, password: &str) {
    let call_id = format!("reg-{aor}@test");
    let contact = format!("<sip:{aor}@{}>", client.local_addr().unwrap());

    let mut first = SipMessage::new_request("REGISTER", "sip:ims.local");
    first.add_header("Via", format!("SIP/2.0/UDP {};branch={}", client.local_addr().unwrap(), branch()));
    first.add_header("Max-Forwards", "70");
    first.add_header("To", format!("<sip:{aor}@ims.local>"));
    first.add_header("From", format!("<sip:{aor}@ims.local>;tag=reg1"));
    first.add_header("Call-ID", call_id.clone());
    first.add_header("CSeq", "1 REGISTER");
    first.add_header("Contact", contact.clone());
    first.add_header("Expires", "3600");
    client.send_to(&first.serialize(), server_addr).await.unwrap();

    let (challenge, _) = recv(client).await;
    assert_eq!(challenge.status(), Some(401));
    let nonce = extract_digest_param(challenge.header("WWW-Authenticate").unwrap(), "nonce");
    let digest = compute_digest_response(aor, "ims.local", password, "REGISTER", "sip:ims.local", &nonce);

    let mut second = SipMessage::new_request("REGISTER", "sip:ims.local");
    second.add_header("Via", format!("SIP/2.0/UDP {};branch={}", client.local_addr().unwrap(), branch()));
    second.add_header("Max-Forwards", "70");
    second.add_header("To", format!("<sip:{aor}@ims.local>"));
    second.add_header("From", format!("<sip:{aor}@ims.local>;tag=reg1"));
    second.add_header("Call-ID", call_id);
    second.add_header("CSeq", "2 REGISTER");
    second.add_header("Contact", contact);
    second.add_header("Expires", "3600");
    second.add_header(
        "Authorization",
        format!("Digest username=\"{aor}\",realm=\"ims.local\",nonce=\"{nonce}\",uri=\"sip:ims.local\",response=\"{digest}\""),
    );
    client.send_to(&second.serialize(), server_addr).await.unwrap();

    let (ok, _) = recv(client).await;
    assert_eq!(ok.status(), Some(200));
}

fn sdp_offer(port: u16) -> Vec<u8> {
    format!(
        "v=0\r\no=alice 1 1 IN IP4 127.0.0.1\r\ns=-\r\nc=IN IP4 127.0.0.1\r\nt=0 0\r\nm=audio {port} RTP/AVP 0\r\n"
    )
    .into_bytes()
}

fn sdp_answer(port: u16) -> Vec<u8> {
    format!(
        "v=0\r\no=bob 2 2 IN IP4 127.0.0.1\r\ns=-\r\nc=IN IP4 127.0.0.1\r\nt=0 0\r\nm=audio {port} RTP/AVP 0\r\n"
    )
    .into_bytes()
}

struct Invite {
    message: SipMessage,
    call_id: String,
}

fn build_invite(a_sock: &UdpSocket, call_id: &str, with_sdp: bool) -> Invite {
    let mut invite = SipMessage::new_request("INVITE", "sip:1002@ims.local");
    invite.add_header("Via", format!("SIP/2.0/UDP {};branch={}", a_sock.local_addr().unwrap(), branch()));
    invite.add_header("Max-Forwards", "70");
    invite.add_header("From", "<sip:1001@ims.local>;tag=acall1");
    invite.add_header("To", "<sip:1002@ims.local>");
    invite.add_header("Call-ID", call_id.to_string());
    invite.add_header("CSeq", "1 INVITE");
    invite.add_header("Contact", format!("<sip:1001@{}>", a_sock.local_addr().unwrap()));
    if with_sdp {
        invite.add_header("Content-Type", "application/sdp");
        invite.body = sdp_offer(a_sock.local_addr().unwrap().port());
    }
    Invite { message: invite, call_id: call_id.to_string() }
}

fn ok_for(invite: &SipMessage, b_sock: &UdpSocket, body: Vec<u8>) -> SipMessage {
    let mut ok = SipMessage::new_response(200, "OK");
    ok.add_header("Via", invite.header("Via").unwrap());
    ok.add_header("Call-ID", invite.header("Call-ID").unwrap());
    ok.add_header("From", invite.header("From").unwrap());
    ok.add_header("To", format!("{};tag=btag1", invite.header("To").unwrap()));
    ok.add_header("CSeq", invite.header("CSeq").unwrap());
    ok.add_header("Contact", format!("<sip:1002@{}>", b_sock.local_addr().unwrap()));
    if !body.is_empty() {
        ok.add_header("Content-Type", "application/sdp");
    }
    ok.body = body;
    ok
}

fn ack_for(invite: &SipMessage, a_ok: &SipMessage) -> SipMessage {
    let mut ack = SipMessage::new_request("ACK", "sip:1002@ims.local");
    ack.add_header("Via", invite.header("Via").unwrap());
    ack.add_header("Call-ID", invite.header("Call-ID").unwrap());
    ack.add_header("From", invite.header("From").unwrap());
    ack.add_header("To", a_ok.header("To").unwrap());
    ack.add_header("CSeq", "1 ACK");
    ack
}

/// Drives a full INVITE -> 100 -> 200 -> ACK handshake with media on both
/// legs and returns the sockets/messages a follow-on test needs to keep
/// talking in-dialog.
async fn establish_call(
    server_addr: SocketAddr,
    a_sock: &UdpSocket,
    b_sock: &UdpSocket,
    call_id: &str,
) -> (SipMessage, SipMessage, SipMessage) {
    let invite = build_invite(a_sock, call_id, true);
    a_sock.send_to(&invite.message.serialize(), server_addr).await.unwrap();

    let (b_invite, server_peer) = recv(b_sock).await;
    assert_eq!(b_invite.method(), Some("INVITE"));

    let answer = sdp_answer(b_sock.local_addr().unwrap().port() + 1000);
    let ok = ok_for(&b_invite, b_sock, answer);
    b_sock.send_to(&ok.serialize(), server_peer).await.unwrap();

    let (a_ok, _) = recv_final(a_sock).await;
    assert_eq!(a_ok.status(), Some(200));

    let ack = ack_for(&invite.message, &a_ok);
    a_sock.send_to(&ack.serialize(), server_addr).await.unwrap();
    let (b_ack, _) = recv(b_sock).await;
    assert_eq!(b_ack.method(), Some("ACK"));

    (invite.message, b_invite, a_ok)
}

#[tokio::test]
async fn successful_call_relays_media_through_both_legs() {
    let rtpproxy_addr = spawn_fake_rtpproxy().await;
    let (server, server_addr) = start_server(rtpproxy_addr).await;

    let b_sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    register(server_addr, &b_sock, "1002", "changeme").await;

    let a_sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let a_port = a_sock.local_addr().unwrap().port();
    let invite = build_invite(&a_sock, "call-success@test", true);
    a_sock.send_to(&invite.message.serialize(), server_addr).await.unwrap();

    // B-leg receives an INVITE whose SDP points at a relay port, not A's
    // own RTP port.
    let (b_invite, server_peer) = recv(&b_sock).await;
    assert_eq!(b_invite.method(), Some("INVITE"));
    assert_eq!(b_invite.call_id().unwrap(), invite.call_id);
    let b_offer = SessionDescription::parse(&b_invite.body).unwrap();
    assert_eq!(b_offer.connection_address(), Some("127.0.0.1"));
    assert_ne!(b_offer.first_media_port(), Some(a_port));

    let b_media_port = b_sock.local_addr().unwrap().port() + 1000;
    let ok = ok_for(&b_invite, &b_sock, sdp_answer(b_media_port));
    b_sock.send_to(&ok.serialize(), server_peer).await.unwrap();

    // A receives the 200 OK with an SDP answer pointing at a (different)
    // relay port, not B's own RTP port.
    let (a_ok, _) = recv_final(&a_sock).await;
    assert_eq!(a_ok.status(), Some(200));
    let a_answer = SessionDescription::parse(&a_ok.body).unwrap();
    assert_eq!(a_answer.connection_address(), Some("127.0.0.1"));
    assert_ne!(a_answer.first_media_port(), Some(b_media_port));
    assert_ne!(a_answer.first_media_port(), b_offer.first_media_port());

    let ack = ack_for(&invite.message, &a_ok);
    a_sock.send_to(&ack.serialize(), server_addr).await.unwrap();

    // B receives a fresh, independent end-to-end ACK.
    let (b_ack, _) = recv(&b_sock).await;
    assert_eq!(b_ack.method(), Some("ACK"));
    assert_eq!(b_ack.call_id().unwrap(), invite.call_id);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn media_backend_down_returns_503_without_contacting_b_leg() {
    // Nothing is listening on this address, so every rtpproxy command fails.
    let dead_rtpproxy: SocketAddr = "127.0.0.1:1".parse().unwrap();
    let (server, server_addr) = start_server(dead_rtpproxy).await;

    let b_sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    register(server_addr, &b_sock, "1002", "changeme").await;

    let a_sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let invite = build_invite(&a_sock, "call-no-media@test", true);
    a_sock.send_to(&invite.message.serialize(), server_addr).await.unwrap();

    let (resp, _) = recv_final(&a_sock).await;
    assert_eq!(resp.status(), Some(503));

    // The B-leg INVITE must never be built or sent.
    assert!(recv_within(&b_sock, Duration::from_millis(300)).await.is_none());

    server.stop().await.unwrap();
}

#[tokio::test]
async fn cancel_before_answer_returns_487_and_acks_cancel() {
    let rtpproxy_addr = spawn_fake_rtpproxy().await;
    let (server, server_addr) = start_server(rtpproxy_addr).await;

    let b_sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    register(server_addr, &b_sock, "1002", "changeme").await;

    let a_sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let invite = build_invite(&a_sock, "call-cancel@test", false);
    a_sock.send_to(&invite.message.serialize(), server_addr).await.unwrap();

    // Wait for the INVITE to land on B, but never answer it.
    let (b_invite, server_peer) = recv(&b_sock).await;
    assert_eq!(b_invite.method(), Some("INVITE"));

    let mut cancel = SipMessage::new_request("CANCEL", "sip:1002@ims.local");
    cancel.add_header("Via", invite.message.header("Via").unwrap());
    cancel.add_header("Max-Forwards", "70");
    cancel.add_header("From", invite.message.header("From").unwrap());
    cancel.add_header("To", invite.message.header("To").unwrap());
    cancel.add_header("Call-ID", invite.call_id.clone());
    cancel.add_header("CSeq", "1 CANCEL");
    a_sock.send_to(&cancel.serialize(), server_addr).await.unwrap();

    // The CANCEL itself is answered 200, and the original INVITE is finally
    // answered 487, in either order; an automatic 100 Trying may also be
    // interleaved and is ignored.
    let mut saw_200_to_cancel = false;
    let mut saw_487_to_invite = false;
    for _ in 0..5 {
        if saw_200_to_cancel && saw_487_to_invite {
            break;
        }
        let (resp, _) = recv(&a_sock).await;
        let Some(status) = resp.status() else { continue };
        if status < 200 {
            continue;
        }
        match (status, resp.cseq().unwrap().1.as_str()) {
            (200, "CANCEL") => saw_200_to_cancel = true,
            (487, "INVITE") => saw_487_to_invite = true,
            other => panic!("unexpected response: {other:?}"),
        }
    }
    assert!(saw_200_to_cancel && saw_487_to_invite);

    // The B-leg also gets cancelled.
    let (b_cancel, _) = recv(&b_sock).await;
    assert_eq!(b_cancel.method(), Some("CANCEL"));
    let _ = server_peer;

    server.stop().await.unwrap();
}

#[tokio::test]
async fn retransmitted_invite_while_ringing_is_absorbed() {
    let rtpproxy_addr = spawn_fake_rtpproxy().await;
    let (server, server_addr) = start_server(rtpproxy_addr).await;

    let b_sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    register(server_addr, &b_sock, "1002", "changeme").await;

    let a_sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let invite = build_invite(&a_sock, "call-retransmit@test", false);
    a_sock.send_to(&invite.message.serialize(), server_addr).await.unwrap();

    let (_first, _) = recv(&b_sock).await;
    assert_eq!(server.active_call_count(), 1);

    // Same branch, resent before B has answered: the transaction layer
    // matches it to the still-open server transaction instead of spawning a
    // second call.
    a_sock.send_to(&invite.message.serialize(), server_addr).await.unwrap();
    assert!(recv_within(&b_sock, Duration::from_millis(300)).await.is_none());
    assert_eq!(server.active_call_count(), 1);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn bye_after_answer_is_forwarded_to_the_opposite_leg() {
    let rtpproxy_addr = spawn_fake_rtpproxy().await;
    let (server, server_addr) = start_server(rtpproxy_addr).await;

    let b_sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    register(server_addr, &b_sock, "1002", "changeme").await;
    let a_sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    let (a_invite, _b_invite, a_ok) = establish_call(server_addr, &a_sock, &b_sock, "call-bye@test").await;

    let mut bye = SipMessage::new_request("BYE", "sip:1002@ims.local");
    bye.add_header("Via", format!("SIP/2.0/UDP {};branch={}", a_sock.local_addr().unwrap(), branch()));
    bye.add_header("Max-Forwards", "70");
    bye.add_header("From", a_invite.header("From").unwrap());
    bye.add_header("To", a_ok.header("To").unwrap());
    bye.add_header("Call-ID", a_invite.header("Call-ID").unwrap());
    bye.add_header("CSeq", "2 BYE");
    a_sock.send_to(&bye.serialize(), server_addr).await.unwrap();

    let (resp, _) = recv(&a_sock).await;
    assert_eq!(resp.status(), Some(200));

    let (b_bye, _) = recv(&b_sock).await;
    assert_eq!(b_bye.method(), Some("BYE"));
    assert_eq!(b_bye.call_id().unwrap(), a_invite.call_id().unwrap());

    wait_for_call_count(&server, 0).await;
}

#[tokio::test]
async fn mid_dialog_info_is_forwarded_to_the_opposite_leg() {
    let rtpproxy_addr = spawn_fake_rtpproxy().await;
    let (server, server_addr) = start_server(rtpproxy_addr).await;

    let b_sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    register(server_addr, &b_sock, "1002", "changeme").await;
    let a_sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    let (a_invite, _b_invite, a_ok) = establish_call(server_addr, &a_sock, &b_sock, "call-info@test").await;

    let mut info = SipMessage::new_request("INFO", "sip:1002@ims.local");
    info.add_header("Via", format!("SIP/2.0/UDP {};branch={}", a_sock.local_addr().unwrap(), branch()));
    info.add_header("Max-Forwards", "70");
    info.add_header("From", a_invite.header("From").unwrap());
    info.add_header("To", a_ok.header("To").unwrap());
    info.add_header("Call-ID", a_invite.header("Call-ID").unwrap());
    info.add_header("CSeq", "2 INFO");
    info.add_header("Content-Type", "application/dtmf-relay");
    info.body = b"Signal=5\r\nDuration=160\r\n".to_vec();
    a_sock.send_to(&info.serialize(), server_addr).await.unwrap();

    let (b_info, server_peer) = recv(&b_sock).await;
    assert_eq!(b_info.method(), Some("INFO"));
    assert_eq!(b_info.body, info.body);

    let mut b_ok = SipMessage::new_response(200, "OK");
    b_ok.add_header("Via", b_info.header("Via").unwrap());
    b_ok.add_header("Call-ID", b_info.header("Call-ID").unwrap());
    b_ok.add_header("From", b_info.header("From").unwrap());
    b_ok.add_header("To", b_info.header("To").unwrap());
    b_ok.add_header("CSeq", b_info.header("CSeq").unwrap());
    b_sock.send_to(&b_ok.serialize(), server_peer).await.unwrap();

    let (a_resp, _) = recv(&a_sock).await;
    assert_eq!(a_resp.status(), Some(200));

    server.stop().await.unwrap();
}
