//! `B2buaServer`: the top-level orchestrator wiring transport, registrar,
//! transaction manager, and the B2BUA bridge together.
//!
//! Holds every subsystem; `start()` brings them up in dependency order and
//! `stop()` tears them down.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::codec::SipMessage;
use crate::config::{GatewayConfig, Identity};
use crate::registrar::{DigestCredentials, Registrar};
use crate::services::rtpproxy::RtpProxyClient;
use crate::services::{B2buaDeps, B2buaService, EventBus, GatewayEvent, MediaSessionManager};
use crate::transaction::TransactionManager;
use crate::transaction::timers::TimerConfig;
use crate::transport::{InboundMessage, TcpListenerHandle, Transport};
use crate::{Error, Result};

pub struct B2buaServer {
    config: Arc<GatewayConfig>,
    identity: Arc<Identity>,
    transport: Transport,
    tcp_handle: Mutex<Option<TcpListenerHandle>>,
    registrar: Arc<Registrar>,
    transactions: Arc<TransactionManager>,
    b2bua: Arc<B2buaService>,
    events: EventBus,
    cancel: CancellationToken,
}

impl B2buaServer {
    pub async fn new(config: GatewayConfig, auto_detected_ip: Option<IpAddr>) -> Result<Self> {
        let identity = Arc::new(Identity::resolve(&config, auto_detected_ip)?);
        let config = Arc::new(config);
        let cancel = CancellationToken::new();

        let bind_addr = SocketAddr::new(config.sip.bind_address, config.sip.bind_port);
        let (transport, tcp_handle) = Transport::bind(bind_addr, config.sip.enable_tcp).await?;

        let registrar = Arc::new(Registrar::new(config.registrar.clone()));

        let rtpproxy = Arc::new(
            RtpProxyClient::connect(
                &config.rtpproxy.control,
                config.rtpproxy.timeout_millis,
                config.rtpproxy.max_retries,
            )
            .await?,
        );
        let media = Arc::new(MediaSessionManager::new(rtpproxy));

        let timers = TimerConfig::new(config.sip.t1_millis, config.sip.t2_millis);
        let transactions = Arc::new(TransactionManager::new(transport.clone(), timers));

        let events = EventBus::default();

        let deps = B2buaDeps {
            config: config.clone(),
            identity: identity.clone(),
            transport: transport.clone(),
            transactions: transactions.clone(),
            registrar: registrar.clone(),
            media,
            events: events.clone(),
            timers,
        };
        let b2bua = Arc::new(B2buaService::new(deps, cancel.child_token()));

        Ok(Self {
            config,
            identity,
            transport,
            tcp_handle: Mutex::new(Some(tcp_handle)),
            registrar,
            transactions,
            b2bua,
            events,
            cancel,
        })
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.transport.local_addr()
    }

    pub fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<GatewayEvent> {
        self.events.subscribe()
    }

    /// Brings every subsystem online: starts the UDP (and optional TCP)
    /// reader loops, the registrar expiry sweep, and the top-level dispatch
    /// loop that routes inbound requests by method.
    pub async fn start(&self) -> Result<()> {
        let bind_addr = SocketAddr::new(self.config.sip.bind_address, self.config.sip.bind_port);

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<InboundMessage>();
        self.transport.spawn_udp_reader(inbound_tx.clone(), self.cancel.child_token());
        if self.config.sip.enable_tcp {
            if let Some(tcp_handle) = self.tcp_handle.lock().await.take() {
                self.transport.spawn_tcp_acceptor(tcp_handle, inbound_tx, self.cancel.child_token());
            }
        }

        self.spawn_dispatch_loop(inbound_rx);
        self.spawn_registration_sweeper();

        self.events.publish(GatewayEvent::Started);
        info!(
            advertised = %self.identity.advertised_socket_addr(),
            bind = %bind_addr,
            "B2BUA server started"
        );
        Ok(())
    }

    fn spawn_dispatch_loop(&self, mut inbound_rx: mpsc::UnboundedReceiver<InboundMessage>) {
        let transactions = self.transactions.clone();
        let registrar = self.registrar.clone();
        let identity = self.identity.clone();
        let b2bua = self.b2bua.clone();
        let events = self.events.clone();
        let cancel = self.cancel.child_token();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    inbound = inbound_rx.recv() => {
                        let Some(inbound) = inbound else { break };
                        if let Ok(true) = transactions.route_incoming(&inbound.message, inbound.peer) {
                            continue;
                        }
                        if !inbound.message.is_request() {
                            warn!(peer = %inbound.peer, "dropping orphaned response");
                            continue;
                        }
                        dispatch_new_request(inbound, &registrar, &identity, &transactions, &b2bua, &events, cancel.child_token()).await;
                    }
                }
            }
        });
    }

    fn spawn_registration_sweeper(&self) {
        let registrar = self.registrar.clone();
        let cancel = self.cancel.child_token();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(30));
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        let removed = registrar.sweep_expired();
                        if removed > 0 {
                            info!(removed, "swept expired registrations");
                        }
                    }
                }
            }
        });
    }

    /// Graceful shutdown: drains in-flight calls with BYE before the process
    /// exits, bounded by `general.shutdown_timeout_secs`.
    pub async fn stop(&self) -> Result<()> {
        info!(
            active_calls = self.b2bua.active_call_count(),
            "shutting down, draining active calls"
        );
        self.b2bua.shutdown_all().await;

        let timeout = Duration::from_secs(self.config.general.shutdown_timeout_secs as u64);
        let deadline = tokio::time::Instant::now() + timeout;
        while self.b2bua.active_call_count() > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        if self.b2bua.active_call_count() > 0 {
            warn!(
                remaining = self.b2bua.active_call_count(),
                "shutdown timeout elapsed with calls still active"
            );
        }

        self.cancel.cancel();
        self.events.publish(GatewayEvent::Stopped);
        Ok(())
    }

    pub fn active_call_count(&self) -> usize {
        self.b2bua.active_call_count()
    }

    pub fn active_transaction_count(&self) -> usize {
        self.transactions.active_count()
    }
}

async fn dispatch_new_request(
    inbound: InboundMessage,
    registrar: &Arc<Registrar>,
    identity: &Arc<Identity>,
    transactions: &Arc<TransactionManager>,
    b2bua: &Arc<B2buaService>,
    events: &EventBus,
    cancel: CancellationToken,
) {
    let method = inbound.message.method().unwrap_or("").to_string();

    if method == "REGISTER" {
        let (tu_tx, _tu_rx_unused) = mpsc::unbounded_channel();
        let key = match transactions.start_server_transaction(
            inbound.message.clone(),
            inbound.peer,
            inbound.transport,
            tu_tx,
            cancel,
        ) {
            Ok(key) => key,
            Err(e) => {
                warn!(method, error = %e, "failed to start REGISTER server transaction");
                return;
            }
        };
        let response = handle_register(&inbound.message, inbound.peer, registrar, identity, events);
        if let Some(handle) = transactions.handle(&key) {
            handle.send_final(response);
        }
        return;
    }

    match method.as_str() {
        "INVITE" => {
            let is_reinvite = inbound
                .message
                .call_id()
                .map(|id| b2bua.call_exists(id))
                .unwrap_or(false);
            if is_reinvite {
                let call_id = inbound.message.call_id().unwrap_or_default().to_string();
                reply_via_server_transaction(&inbound, transactions, cancel, |msg, peer| {
                    let b2bua = b2bua.clone();
                    let call_id = call_id.clone();
                    Box::pin(async move { b2bua.handle_reinvite(&call_id, peer, &msg).await })
                })
                .await;
            } else if let Err(e) = b2bua
                .handle_incoming_invite(inbound.message, inbound.peer, inbound.transport)
                .await
            {
                warn!(method, error = %e, "request handling failed");
            }
        }
        "BYE" => {
            let call_id = inbound.message.call_id().unwrap_or_default().to_string();
            reply_via_server_transaction(&inbound, transactions, cancel, |msg, peer| {
                let b2bua = b2bua.clone();
                let call_id = call_id.clone();
                Box::pin(async move { b2bua.handle_bye(&call_id, peer, &msg).await })
            })
            .await;
        }
        "CANCEL" => {
            let call_id = inbound.message.call_id().unwrap_or_default().to_string();
            reply_via_server_transaction(&inbound, transactions, cancel, |msg, _peer| {
                let b2bua = b2bua.clone();
                let call_id = call_id.clone();
                Box::pin(async move { b2bua.handle_cancel(&call_id, &msg).await })
            })
            .await;
        }
        "INFO" | "NOTIFY" | "MESSAGE" => {
            let call_id = inbound.message.call_id().unwrap_or_default().to_string();
            let method = method.clone();
            reply_via_server_transaction(&inbound, transactions, cancel, |msg, peer| {
                let b2bua = b2bua.clone();
                let call_id = call_id.clone();
                let method = method.clone();
                Box::pin(async move { b2bua.forward_mid_dialog(&call_id, &method, peer, &msg).await })
            })
            .await;
        }
        "ACK" => {
            if let Ok(call_id) = inbound.message.call_id() {
                b2bua.dispatch_ack_from_a(call_id);
            }
        }
        other => {
            warn!(method = other, "unhandled method");
        }
    }
}

/// Starts a server transaction for a request that isn't a fresh INVITE and
/// delivers whatever `respond` computes as its final response. Shared by
/// BYE/CANCEL/INFO/NOTIFY/MESSAGE/re-INVITE dispatch so each only supplies
/// how to get a response out of the B2BUA.
async fn reply_via_server_transaction<F>(
    inbound: &InboundMessage,
    transactions: &Arc<TransactionManager>,
    cancel: CancellationToken,
    respond: F,
) where
    F: FnOnce(SipMessage, SocketAddr) -> std::pin::Pin<Box<dyn std::future::Future<Output = SipMessage> + Send>>,
{
    let (tu_tx, _tu_rx_unused) = mpsc::unbounded_channel();
    let key = match transactions.start_server_transaction(inbound.message.clone(), inbound.peer, inbound.transport, tu_tx, cancel) {
        Ok(key) => key,
        Err(e) => {
            warn!(error = %e, "failed to start server transaction");
            return;
        }
    };
    let response = respond(inbound.message.clone(), inbound.peer).await;
    if let Some(handle) = transactions.handle(&key) {
        handle.send_final(response);
    }
}

/// Challenges a fresh REGISTER, or validates and applies one carrying
/// credentials. Always returns a complete response message; the caller is
/// responsible for delivering it through the server transaction so
/// retransmitted REGISTERs get the cached final response instead of being
/// re-processed.
fn handle_register(
    request: &SipMessage,
    peer: SocketAddr,
    registrar: &Arc<Registrar>,
    identity: &Arc<Identity>,
    events: &EventBus,
) -> SipMessage {
    match handle_register_inner(request, peer, registrar, identity, events) {
        Ok(resp) => resp,
        Err(Error::AuthRequired) => challenge_response(request, registrar),
        Err(e) => error_response(request, &e),
    }
}

fn handle_register_inner(
    request: &SipMessage,
    peer: SocketAddr,
    registrar: &Arc<Registrar>,
    identity: &Arc<Identity>,
    events: &EventBus,
) -> Result<SipMessage> {
    let aor = request
        .header("To")
        .and_then(crate::services::b2bua::extract_user_from_uri)
        .ok_or_else(|| Error::malformed("REGISTER missing To header"))?;

    let auth = request.header("Authorization").ok_or(Error::AuthRequired)?;
    let creds = DigestCredentials::parse(auth)?;
    registrar.verify(&aor, "REGISTER", request.request_uri().unwrap_or_default(), &creds)?;

    let expires: u32 = request
        .header("Expires")
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(3600);
    let raw_contact = request.header("Contact").unwrap_or_default();
    let contact = crate::nat::rewrite_contact_for_nat(raw_contact, peer, &identity.private_cidrs);

    let granted = registrar.register(&aor, &contact, expires, peer)?;
    if granted == 0 {
        events.publish(GatewayEvent::RegistrationRemoved { aor: aor.clone() });
    } else {
        events.publish(GatewayEvent::RegistrationUpdated {
            aor: aor.clone(),
            expires: granted,
        });
    }

    Ok(register_success_response(request, &contact, granted))
}

fn challenge_response(request: &SipMessage, registrar: &Arc<Registrar>) -> SipMessage {
    let nonce = registrar.issue_nonce();
    let mut resp = SipMessage::new_response(401, "Unauthorized");
    copy_dialog_headers(&mut resp, request);
    resp.add_header(
        "WWW-Authenticate",
        format!("Digest realm=\"{}\", nonce=\"{}\", algorithm=MD5", registrar.realm(), nonce),
    );
    resp
}

fn register_success_response(request: &SipMessage, contact: &str, expires: u32) -> SipMessage {
    let mut resp = SipMessage::new_response(200, "OK");
    copy_dialog_headers(&mut resp, request);
    resp.add_header("Contact", format!("<{contact}>;expires={expires}"));
    resp.add_header("Expires", expires.to_string());
    resp
}

fn error_response(request: &SipMessage, error: &Error) -> SipMessage {
    let (status, reason) = error.sip_status().unwrap_or((500, "Server Internal Error"));
    let mut resp = SipMessage::new_response(status, reason);
    copy_dialog_headers(&mut resp, request);
    resp
}

fn copy_dialog_headers(resp: &mut SipMessage, request: &SipMessage) {
    if let Ok(via) = request.top_via() {
        resp.add_header("Via", via.to_string());
    }
    resp.add_header("Call-ID", request.header("Call-ID").unwrap_or_default());
    resp.add_header("From", request.header("From").unwrap_or_default());
    let to = request.header("To").unwrap_or_default();
    if to.contains("tag=") {
        resp.add_header("To", to);
    } else {
        resp.add_header("To", format!("{to};tag={}", uuid::Uuid::new_v4().simple()));
    }
    if let Ok(cseq) = request.cseq() {
        resp.add_header("CSeq", format!("{} {}", cseq.0, cseq.1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RegistrarConfig;

    fn test_registrar() -> Arc<Registrar> {
        let mut users = std::collections::HashMap::new();
        users.insert("1001".to_string(), "secret".to_string());
        Arc::new(Registrar::new(RegistrarConfig {
            realm: "ims.local".to_string(),
            registration_max_expiry: 3600,
            nonce_lifetime_secs: 300,
            users,
        }))
    }

    fn test_identity() -> Arc<Identity> {
        let config = crate::config::GatewayConfig::default_config();
        Arc::new(Identity::resolve(&config, Some("203.0.113.1".parse().unwrap())).unwrap())
    }

    #[test]
    fn register_without_auth_header_requires_challenge() {
        let registrar = test_registrar();
        let identity = test_identity();
        let events = EventBus::new(4);
        let mut req = SipMessage::new_request("REGISTER", "sip:ims.local");
        req.add_header("To", "<sip:1001@ims.local>");
        let peer: SocketAddr = "192.168.1.5:5060".parse().unwrap();
        let response = handle_register(&req, peer, &registrar, &identity, &events);
        assert_eq!(response.status(), Some(401));
        assert!(response.header("WWW-Authenticate").unwrap().contains("Digest"));
    }

    #[test]
    fn register_with_valid_digest_succeeds() {
        let registrar = test_registrar();
        let identity = test_identity();
        let events = EventBus::new(4);
        let nonce = registrar.issue_nonce();
        let response = crate::registrar::compute_digest_response(
            "1001", "ims.local", "secret", "REGISTER", "sip:ims.local", &nonce,
        );
        let mut req = SipMessage::new_request("REGISTER", "sip:ims.local");
        req.add_header("To", "<sip:1001@ims.local>");
        req.add_header(
            "Authorization",
            format!("Digest username=\"1001\",realm=\"ims.local\",nonce=\"{nonce}\",uri=\"sip:ims.local\",response=\"{response}\""),
        );
        req.add_header("Contact", "<sip:1001@192.168.1.5:5060>");
        let peer: SocketAddr = "192.168.1.5:5060".parse().unwrap();
        let resp = handle_register(&req, peer, &registrar, &identity, &events);
        assert_eq!(resp.status(), Some(200));
        assert!(registrar.lookup("1001").is_some());
    }

    #[test]
    fn register_rewrites_contact_when_nat_detected() {
        let registrar = test_registrar();
        let identity = test_identity();
        let events = EventBus::new(4);
        let nonce = registrar.issue_nonce();
        let digest = crate::registrar::compute_digest_response(
            "1001", "ims.local", "secret", "REGISTER", "sip:ims.local", &nonce,
        );
        let mut req = SipMessage::new_request("REGISTER", "sip:ims.local");
        req.add_header("To", "<sip:1001@ims.local>");
        req.add_header(
            "Authorization",
            format!("Digest username=\"1001\",realm=\"ims.local\",nonce=\"{nonce}\",uri=\"sip:ims.local\",response=\"{digest}\""),
        );
        req.add_header("Contact", "<sip:1001@10.0.0.5:5060>");
        let peer: SocketAddr = "203.0.113.7:41002".parse().unwrap();
        let resp = handle_register(&req, peer, &registrar, &identity, &events);
        assert_eq!(resp.status(), Some(200));
        assert!(resp.header("Contact").unwrap().contains("203.0.113.7:41002"));
        let binding = registrar.lookup("1001").unwrap();
        assert_eq!(binding.observed_addr, peer);
    }
}
