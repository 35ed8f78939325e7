//! The B2BUA call bridge.
//!
//! Each call is owned by exactly one actor task consuming commands off its
//! own `mpsc` queue, so every state transition for that call is totally
//! ordered without a shared lock. `B2buaService` itself is a `DashMap` of
//! call state plus an event channel, bridging two SIP dialogs rather than
//! TDM legs.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{error, instrument, warn};

use crate::codec::{SessionDescription, SipMessage};
use crate::config::{GatewayConfig, Identity};
use crate::dialog::{DialogId, DialogLeg};
use crate::nat;
use crate::registrar::Registrar;
use crate::transaction::timers::TimerConfig;
use crate::transaction::{TransactionManager, TuEvent};
use crate::transport::{Transport, TransportKind};
use crate::{Error, Result};

use super::events::{CallDisposition, CallRecordSnapshot, EventBus, GatewayEvent};
use super::media_session::MediaSessionManager;
use super::rtpproxy::RelayEndpoint;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum B2buaCallState {
    Establishing,
    Ringing,
    Connected,
    Disconnecting,
    Terminated,
}

pub struct B2buaCall {
    pub call_id: String,
    pub from_aor: String,
    pub to_aor: String,
    pub state: B2buaCallState,
    pub a_leg: DialogLeg,
    pub b_leg: Option<DialogLeg>,
    pub started_at: Instant,
    pub answered_at: Option<Instant>,
    /// A-leg relay allocated at INVITE time by `build_b_leg_invite`, held
    /// until the B-leg answers (`finish_establishing` consumes it) or the
    /// call is abandoned beforehand.
    pub offer_relay: Option<RelayEndpoint>,
    /// Cancels the 2xx retransmission task once the A-leg ACK arrives.
    pub ack_signal: Option<oneshot::Sender<()>>,
}

enum CallCommand {
    AckFromA,
    AckTimeout,
    Cancel {
        request: SipMessage,
        reply: oneshot::Sender<SipMessage>,
    },
    Bye {
        peer: SocketAddr,
        request: SipMessage,
        reply: oneshot::Sender<SipMessage>,
    },
    MidDialog {
        method: String,
        peer: SocketAddr,
        request: SipMessage,
        reply: oneshot::Sender<SipMessage>,
    },
    ReInvite {
        peer: SocketAddr,
        request: SipMessage,
        reply: oneshot::Sender<SipMessage>,
    },
    Shutdown,
}

enum TeardownReason {
    FromA,
    FromB,
    Shutdown,
}

struct CallHandle {
    tx: mpsc::UnboundedSender<CallCommand>,
}

/// Extracts `user` out of `sip:user@host` / `sip:user@host;params`, ignoring
/// a display name if present.
pub fn extract_user_from_uri(uri: &str) -> Option<String> {
    let uri = uri.rsplit('<').next().unwrap_or(uri);
    let after_scheme = uri.strip_prefix("sip:").or_else(|| uri.strip_prefix("sips:"))?;
    let user_part = after_scheme.split('@').next()?;
    let user = user_part.split(';').next()?.trim_end_matches('>');
    if user.is_empty() {
        None
    } else {
        Some(user.to_string())
    }
}

fn build_destination_uri(domain: &str, user: &str) -> String {
    format!("sip:{user}@{domain}")
}

/// Dependencies shared by every call actor. Grouped into one struct so
/// spawning a call doesn't require threading six separate `Arc`s through
/// every function signature.
#[derive(Clone)]
pub struct B2buaDeps {
    pub config: Arc<GatewayConfig>,
    pub identity: Arc<Identity>,
    pub transport: Transport,
    pub transactions: Arc<TransactionManager>,
    pub registrar: Arc<Registrar>,
    pub media: Arc<MediaSessionManager>,
    pub events: EventBus,
    pub timers: TimerConfig,
}

pub struct B2buaService {
    deps: B2buaDeps,
    calls: Arc<DashMap<String, CallHandle>>,
    cancel: CancellationToken,
}

impl B2buaService {
    pub fn new(deps: B2buaDeps, cancel: CancellationToken) -> Self {
        Self {
            deps,
            calls: Arc::new(DashMap::new()),
            cancel,
        }
    }

    pub fn active_call_count(&self) -> usize {
        self.calls.len()
    }

    pub fn call_exists(&self, call_id: &str) -> bool {
        self.calls.contains_key(call_id)
    }

    /// Entry point for a fresh INVITE from the A-leg UAC. Routing is a
    /// single hop: the Request-URI's user part must be a currently-
    /// registered AoR.
    #[instrument(skip(self, request), fields(call_id))]
    pub async fn handle_incoming_invite(&self, request: SipMessage, peer: SocketAddr, transport_kind: TransportKind) -> Result<()> {
        let call_id = request.call_id()?.to_string();
        if self.calls.contains_key(&call_id) {
            return Err(Error::invalid_state(format!("call {call_id} already exists")));
        }

        let target_user = request
            .request_uri()
            .and_then(extract_user_from_uri)
            .ok_or_else(|| Error::malformed("INVITE request-URI has no user part"))?;

        let binding = self
            .deps
            .registrar
            .lookup(&target_user)
            .ok_or_else(|| Error::UnknownAoR(target_user.clone()))?;

        let from_aor = request
            .header("From")
            .and_then(extract_user_from_uri)
            .unwrap_or_else(|| "unknown".to_string());

        let a_local_tag = uuid::Uuid::new_v4().simple().to_string();
        let a_remote_tag = request.from_tag().unwrap_or_default();
        let a_leg = DialogLeg::new(
            DialogId::new(call_id.clone(), a_local_tag, a_remote_tag),
            request.header("Contact").unwrap_or_default().to_string(),
        );

        let call = B2buaCall {
            call_id: call_id.clone(),
            from_aor,
            to_aor: target_user.clone(),
            state: B2buaCallState::Establishing,
            a_leg,
            b_leg: None,
            started_at: Instant::now(),
            answered_at: None,
            offer_relay: None,
            ack_signal: None,
        };

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        self.calls.insert(call_id.clone(), CallHandle { tx: cmd_tx.clone() });

        self.deps.events.publish(GatewayEvent::CallStarted {
            call_id: call_id.clone(),
            from_aor: call.from_aor.clone(),
            to_aor: call.to_aor.clone(),
        });

        let deps = self.deps.clone();
        let calls = self.calls.clone();
        let cancel = self.cancel.child_token();

        tokio::spawn(async move {
            run_call_actor(call, request, peer, transport_kind, binding.observed_addr, deps, cmd_tx, cmd_rx, cancel).await;
            calls.remove(&call_id);
        });

        Ok(())
    }

    pub fn dispatch_ack_from_a(&self, call_id: &str) {
        if let Some(handle) = self.calls.get(call_id) {
            let _ = handle.tx.send(CallCommand::AckFromA);
        } else {
            warn!(call_id, "ACK for unknown call dropped");
        }
    }

    pub async fn handle_cancel(&self, call_id: &str, request: &SipMessage) -> SipMessage {
        self.send_command_with_reply(call_id, request, |request, reply| CallCommand::Cancel { request, reply })
            .await
    }

    pub async fn handle_bye(&self, call_id: &str, peer: SocketAddr, request: &SipMessage) -> SipMessage {
        self.send_command_with_reply(call_id, request, |request, reply| CallCommand::Bye { peer, request, reply })
            .await
    }

    pub async fn forward_mid_dialog(&self, call_id: &str, method: &str, peer: SocketAddr, request: &SipMessage) -> SipMessage {
        let method = method.to_string();
        self.send_command_with_reply(call_id, request, |request, reply| CallCommand::MidDialog {
            method,
            peer,
            request,
            reply,
        })
        .await
    }

    pub async fn handle_reinvite(&self, call_id: &str, peer: SocketAddr, request: &SipMessage) -> SipMessage {
        self.send_command_with_reply(call_id, request, |request, reply| CallCommand::ReInvite { peer, request, reply })
            .await
    }

    async fn send_command_with_reply(
        &self,
        call_id: &str,
        request: &SipMessage,
        build: impl FnOnce(SipMessage, oneshot::Sender<SipMessage>) -> CallCommand,
    ) -> SipMessage {
        let tx = match self.calls.get(call_id) {
            Some(handle) => handle.tx.clone(),
            None => return status_response(request, 481, "Call/Transaction Does Not Exist"),
        };
        let (reply_tx, reply_rx) = oneshot::channel();
        if tx.send(build(request.clone(), reply_tx)).is_err() {
            return status_response(request, 481, "Call/Transaction Does Not Exist");
        }
        reply_rx
            .await
            .unwrap_or_else(|_| status_response(request, 500, "Server Internal Error"))
    }

    pub async fn shutdown_all(&self) {
        let ids: Vec<String> = self.calls.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Some(handle) = self.calls.get(&id) {
                let _ = handle.tx.send(CallCommand::Shutdown);
            }
        }
    }
}

/// Drives one call's lifecycle end to end. Everything here runs on a single
/// task, so the per-call state never needs a lock.
#[instrument(skip_all, fields(call_id = %call.call_id))]
async fn run_call_actor(
    mut call: B2buaCall,
    original_invite: SipMessage,
    a_peer: SocketAddr,
    a_transport: TransportKind,
    b_target: SocketAddr,
    deps: B2buaDeps,
    cmd_tx: mpsc::UnboundedSender<CallCommand>,
    mut cmd_rx: mpsc::UnboundedReceiver<CallCommand>,
    cancel: CancellationToken,
) {
    let (tu_tx, _tu_rx_unused) = mpsc::unbounded_channel();

    let server_tx_key = match deps.transactions.start_server_transaction(
        original_invite.clone(),
        a_peer,
        a_transport,
        tu_tx,
        cancel.clone(),
    ) {
        Ok(key) => key,
        Err(e) => {
            error!(error = %e, "failed to start A-leg server transaction");
            return;
        }
    };

    let b_invite = match build_b_leg_invite(&mut call, &original_invite, &deps).await {
        Ok(req) => req,
        Err(e) => {
            send_final_to_a(&deps, &server_tx_key, &original_invite, &e);
            return;
        }
    };

    let (client_tu_tx, mut client_tu_rx) = mpsc::unbounded_channel();
    let client_tx_key = match deps.transactions.start_client_transaction(
        b_invite,
        b_target,
        TransportKind::Udp,
        client_tu_tx,
        cancel.clone(),
    ) {
        Ok(key) => key,
        Err(e) => {
            send_final_to_a(&deps, &server_tx_key, &original_invite, &e);
            return;
        }
    };

    let mut reinvite_in_progress = false;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            Some(event) = client_tu_rx.recv() => {
                match event {
                    TuEvent::Provisional(resp) => {
                        call.state = B2buaCallState::Ringing;
                        if let Some(handle) = deps.transactions.handle(&server_tx_key) {
                            handle.send_provisional(mirror_response(&resp, &original_invite, None));
                        }
                    }
                    TuEvent::Final(resp) => {
                        let status = resp.status().unwrap_or(500);
                        if status < 300 {
                            match finish_establishing(&mut call, &resp, &deps, b_target).await {
                                Ok(answer_body) => {
                                    call.state = B2buaCallState::Connected;
                                    call.answered_at = Some(Instant::now());
                                    deps.events.publish(GatewayEvent::CallAnswered { call_id: call.call_id.clone() });
                                    let final_to_a = mirror_response(&resp, &original_invite, Some(answer_body));
                                    if let Some(handle) = deps.transactions.handle(&server_tx_key) {
                                        handle.send_final(final_to_a.clone());
                                    }
                                    call.ack_signal = Some(spawn_2xx_retransmit(&deps, final_to_a, a_peer, a_transport, cmd_tx.clone()));
                                }
                                Err(e) => {
                                    error!(error = %e, "media bridging failed after B-leg answered");
                                    if let Some(handle) = deps.transactions.handle(&server_tx_key) {
                                        handle.send_final(error_response(&original_invite, &e));
                                    }
                                    abandon_pending_offer(&mut call, &deps).await;
                                    publish_end(&deps, &call, CallDisposition::Failed);
                                    break;
                                }
                            }
                        } else {
                            if let Some(handle) = deps.transactions.handle(&server_tx_key) {
                                handle.send_final(mirror_response(&resp, &original_invite, None));
                            }
                            abandon_pending_offer(&mut call, &deps).await;
                            publish_end(&deps, &call, CallDisposition::Rejected);
                            break;
                        }
                    }
                    TuEvent::Timeout | TuEvent::TransportFailure(_) => {
                        if let Some(handle) = deps.transactions.handle(&server_tx_key) {
                            handle.send_final(error_response(&original_invite, &Error::PeerTransportFailure("b-leg unreachable".into())));
                        }
                        abandon_pending_offer(&mut call, &deps).await;
                        publish_end(&deps, &call, CallDisposition::Failed);
                        break;
                    }
                    TuEvent::AckReceived(_) => {}
                }
            }
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(CallCommand::Cancel { request, reply }) => {
                        let _ = reply.send(status_response(&request, 200, "OK"));
                        // A UAS that already sent a final response must not
                        // act on a CANCEL (RFC 3261 §9.2): reply 200 to the
                        // CANCEL itself and otherwise ignore it.
                        if call.state != B2buaCallState::Connected {
                            if let Some(handle) = deps.transactions.handle(&client_tx_key) {
                                handle.cancel();
                            }
                            if let Some(handle) = deps.transactions.handle(&server_tx_key) {
                                handle.send_final(status_response(&original_invite, 487, "Request Terminated"));
                            }
                            abandon_pending_offer(&mut call, &deps).await;
                            publish_end(&deps, &call, CallDisposition::Cancelled);
                            break;
                        }
                    }
                    Some(CallCommand::Bye { peer, request, reply }) => {
                        let _ = reply.send(status_response(&request, 200, "OK"));
                        let reason = if peer == a_peer { TeardownReason::FromA } else { TeardownReason::FromB };
                        teardown(&mut call, &deps, reason, a_peer, b_target, a_transport).await;
                        break;
                    }
                    Some(CallCommand::MidDialog { method, peer, request, reply }) => {
                        let resp = forward_mid_dialog(&call, &method, &request, peer == a_peer, a_peer, b_target, a_transport, &deps, &cancel).await;
                        let _ = reply.send(resp);
                    }
                    Some(CallCommand::ReInvite { peer, request, reply }) => {
                        if reinvite_in_progress {
                            let _ = reply.send(status_response(&request, 491, "Request Pending"));
                        } else {
                            reinvite_in_progress = true;
                            let resp = forward_mid_dialog(&call, "INVITE", &request, peer == a_peer, a_peer, b_target, a_transport, &deps, &cancel).await;
                            reinvite_in_progress = false;
                            let _ = reply.send(resp);
                        }
                    }
                    Some(CallCommand::Shutdown) => {
                        teardown(&mut call, &deps, TeardownReason::Shutdown, a_peer, b_target, a_transport).await;
                        break;
                    }
                    Some(CallCommand::AckFromA) => {
                        if let Some(signal) = call.ack_signal.take() {
                            let _ = signal.send(());
                        }
                        if let Some(ack) = build_b_leg_ack(&call, &deps) {
                            let _ = deps.transport.send(&ack, b_target, TransportKind::Udp).await;
                        }
                    }
                    Some(CallCommand::AckTimeout) => {
                        warn!("timer H expired waiting for the A-leg ACK, tearing down call");
                        teardown(&mut call, &deps, TeardownReason::Shutdown, a_peer, b_target, a_transport).await;
                        break;
                    }
                    None => break,
                }
            }
        }
    }
}

async fn abandon_pending_offer(call: &mut B2buaCall, deps: &B2buaDeps) {
    if call.offer_relay.take().is_some() {
        let _ = deps.media.abandon_offer(&call.call_id, &call.a_leg.id.local_tag).await;
    }
}

/// Builds the B-leg INVITE. When the A-leg offered SDP, allocates the A-leg
/// relay sub-session at this point (RFC 3264 offer/answer: the offer is
/// relayed at INVITE time) and rewrites the offer to point at it. If the
/// media backend rejects the allocation, no B-leg INVITE is ever built or
/// sent — the caller fails the A-leg straight to a final response.
async fn build_b_leg_invite(call: &mut B2buaCall, original: &SipMessage, deps: &B2buaDeps) -> Result<SipMessage> {
    let destination_uri = build_destination_uri(&deps.identity.domain, &call.to_aor);
    let mut invite = SipMessage::new_request("INVITE", &destination_uri);
    // Reusing the A-leg Call-ID on the B-leg keeps log/CDR correlation
    // trivial across both legs.
    invite.add_header("Call-ID", call.call_id.clone());
    invite.add_header(
        "Via",
        format!(
            "SIP/2.0/UDP {};branch=z9hG4bK{}",
            deps.identity.advertised_socket_addr(),
            uuid::Uuid::new_v4().simple()
        ),
    );
    invite.add_header("Max-Forwards", deps.config.sip.max_forwards.to_string());
    invite.add_header(
        "From",
        format!("<sip:{}@{}>;tag={}", call.from_aor, deps.identity.domain, call.a_leg.id.local_tag),
    );
    invite.add_header("To", format!("<{destination_uri}>"));
    invite.add_header("CSeq", "1 INVITE".to_string());
    invite.add_header("Contact", format!("<sip:{}@{}>", call.from_aor, deps.identity.advertised_socket_addr()));

    if !original.body.is_empty() {
        let mut a_sdp = SessionDescription::parse(&original.body)?;
        let a_addr = a_sdp.connection_address().unwrap_or_default().to_string();
        let a_port = a_sdp.first_media_port().unwrap_or(0);
        let relay = deps
            .media
            .create_offer(&call.call_id, &call.a_leg.id.local_tag, &a_addr, a_port)
            .await?;
        a_sdp.rewrite_media(&deps.identity.advertised_host, &[relay.port]);
        call.offer_relay = Some(relay);
        invite.body = a_sdp.render();
        invite.add_header("Content-Type", "application/sdp");
    }

    Ok(invite)
}

/// Once the B-leg answers with an SDP answer, bridges media through
/// RTPProxy and rewrites the answer to point at the relay address before
/// it reaches the A-leg. Returns the rendered answer body for the caller to
/// embed into the A-leg's 200 OK.
async fn finish_establishing(call: &mut B2buaCall, b_response: &SipMessage, deps: &B2buaDeps, b_peer: SocketAddr) -> Result<Vec<u8>> {
    let b_tag = b_response.to_tag().unwrap_or_default();
    let offer_relay = call
        .offer_relay
        .clone()
        .ok_or_else(|| Error::invalid_state("no a-leg offer relay recorded for this call"))?;

    let mut b_sdp = SessionDescription::parse(&b_response.body)?;
    let b_addr = b_sdp.connection_address().unwrap_or_default().to_string();
    let b_port = b_sdp.first_media_port().unwrap_or(0);

    let session = deps
        .media
        .create_answer(&call.call_id, &call.a_leg.id.local_tag, &b_tag, offer_relay, &b_addr, b_port)
        .await?;
    call.offer_relay = None;

    b_sdp.rewrite_media(&deps.identity.advertised_host, &[session.b_relay.port]);

    call.a_leg.confirm();
    let raw_contact = b_response.header("Contact").unwrap_or_default();
    let contact = nat::rewrite_contact_for_nat(raw_contact, b_peer, &deps.identity.private_cidrs);
    let mut b_leg = DialogLeg::new(DialogId::new(call.call_id.clone(), call.a_leg.id.local_tag.clone(), b_tag), contact);
    b_leg.confirm();
    call.b_leg = Some(b_leg);

    Ok(b_sdp.render())
}

/// Keeps a 2xx response to an INVITE alive end-to-end (RFC 3261 §13.3.1.4):
/// the server transaction sends it once and then steps aside, so the
/// dialog layer owns retransmission with T1->T2 backoff until either the
/// A-leg ACK arrives (`ack_signal` fires) or timer H elapses, at which
/// point `CallCommand::AckTimeout` is posted back to the call actor.
fn spawn_2xx_retransmit(
    deps: &B2buaDeps,
    response: SipMessage,
    peer: SocketAddr,
    transport_kind: TransportKind,
    cmd_tx: mpsc::UnboundedSender<CallCommand>,
) -> oneshot::Sender<()> {
    let (ack_tx, mut ack_rx) = oneshot::channel();
    let transport = deps.transport.clone();
    let timers = deps.timers;
    tokio::spawn(async move {
        let mut interval = timers.t1;
        let deadline = tokio::time::sleep(timers.timer_h());
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut ack_rx => return,
                _ = &mut deadline => {
                    let _ = cmd_tx.send(CallCommand::AckTimeout);
                    return;
                }
                _ = tokio::time::sleep(interval) => {
                    if transport.send(&response, peer, transport_kind).await.is_err() {
                        return;
                    }
                    interval = timers.next_retransmit(interval);
                }
            }
        }
    });
    ack_tx
}

/// Builds a fresh end-to-end ACK for the B-leg's 2xx, per RFC 3261
/// §13.2.2.4 — this ACK is a new transaction, sent directly, never routed
/// through the INVITE client transaction that already terminated.
fn build_b_leg_ack(call: &B2buaCall, deps: &B2buaDeps) -> Option<SipMessage> {
    let b_leg = call.b_leg.as_ref()?;
    let mut ack = SipMessage::new_request("ACK", &b_leg.remote_target);
    ack.add_header("Call-ID", call.call_id.clone());
    ack.add_header(
        "Via",
        format!(
            "SIP/2.0/UDP {};branch=z9hG4bK{}",
            deps.identity.advertised_socket_addr(),
            uuid::Uuid::new_v4().simple()
        ),
    );
    ack.add_header("Max-Forwards", deps.config.sip.max_forwards.to_string());
    ack.add_header(
        "From",
        format!("<sip:{}@{}>;tag={}", call.from_aor, deps.identity.domain, call.a_leg.id.local_tag),
    );
    ack.add_header(
        "To",
        format!("<sip:{}@{}>;tag={}", call.to_aor, deps.identity.domain, b_leg.id.remote_tag),
    );
    // Reuses the B-leg INVITE's CSeq number: ACK to a 2xx is not a new
    // request in the CSeq sequence (RFC 3261 §13.2.2.4).
    ack.add_header("CSeq", "1 ACK".to_string());
    for route in &b_leg.route_set {
        ack.add_header("Route", route.clone());
    }
    Some(ack)
}

/// Forwards a mid-dialog request (BYE aside, which has its own path) to
/// whichever leg didn't originate it, and mirrors the response back.
/// Re-INVITE passthrough does not currently re-steer SDP through new relay
/// ports; see the design notes for that limitation.
#[allow(clippy::too_many_arguments)]
async fn forward_mid_dialog(
    call: &B2buaCall,
    method: &str,
    inbound: &SipMessage,
    from_a: bool,
    a_peer: SocketAddr,
    b_peer: SocketAddr,
    a_transport: TransportKind,
    deps: &B2buaDeps,
    cancel: &CancellationToken,
) -> SipMessage {
    let (leg, target_peer, target_transport, from_uri, to_uri) = if from_a {
        let Some(b_leg) = call.b_leg.as_ref() else {
            return status_response(inbound, 481, "Call/Transaction Does Not Exist");
        };
        (
            b_leg,
            b_peer,
            TransportKind::Udp,
            format!("sip:{}@{}", call.from_aor, deps.identity.domain),
            format!("sip:{}@{}", call.to_aor, deps.identity.domain),
        )
    } else {
        (
            &call.a_leg,
            a_peer,
            a_transport,
            format!("sip:{}@{}", call.to_aor, deps.identity.domain),
            format!("sip:{}@{}", call.from_aor, deps.identity.domain),
        )
    };

    let mut outbound = match leg.make_request(method, &from_uri, &to_uri) {
        Ok(req) => req,
        Err(e) => return error_response(inbound, &e),
    };
    outbound.body = inbound.body.clone();
    if let Some(ct) = inbound.header("Content-Type") {
        outbound.add_header("Content-Type", ct.to_string());
    }

    let (tu_tx, mut tu_rx) = mpsc::unbounded_channel();
    if deps
        .transactions
        .start_client_transaction(outbound, target_peer, target_transport, tu_tx, cancel.child_token())
        .is_err()
    {
        return error_response(inbound, &Error::b2bua("failed to start mid-dialog transaction"));
    }

    loop {
        match tu_rx.recv().await {
            Some(TuEvent::Final(resp)) => return mirror_response(&resp, inbound, None),
            Some(TuEvent::Provisional(_)) | Some(TuEvent::AckReceived(_)) => continue,
            Some(TuEvent::Timeout) | Some(TuEvent::TransportFailure(_)) | None => {
                return status_response(inbound, 408, "Request Timeout");
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn teardown(call: &mut B2buaCall, deps: &B2buaDeps, reason: TeardownReason, a_peer: SocketAddr, b_peer: SocketAddr, a_transport: TransportKind) {
    call.state = B2buaCallState::Disconnecting;

    if call.answered_at.is_some() {
        let notify_b = matches!(reason, TeardownReason::FromA | TeardownReason::Shutdown);
        let notify_a = matches!(reason, TeardownReason::FromB | TeardownReason::Shutdown);

        if notify_b {
            if let Some(b_leg) = call.b_leg.as_ref() {
                let from_uri = format!("sip:{}@{}", call.from_aor, deps.identity.domain);
                let to_uri = format!("sip:{}@{}", call.to_aor, deps.identity.domain);
                if let Ok(bye) = b_leg.make_request("BYE", &from_uri, &to_uri) {
                    let _ = deps.transport.send(&bye, b_peer, TransportKind::Udp).await;
                }
            }
        }
        if notify_a {
            let from_uri = format!("sip:{}@{}", call.to_aor, deps.identity.domain);
            let to_uri = format!("sip:{}@{}", call.from_aor, deps.identity.domain);
            if let Ok(bye) = call.a_leg.make_request("BYE", &from_uri, &to_uri) {
                let _ = deps.transport.send(&bye, a_peer, a_transport).await;
            }
        }
    }

    abandon_pending_offer(call, deps).await;
    let _ = deps.media.teardown(&call.call_id).await;
    call.a_leg.terminate();
    if let Some(b_leg) = call.b_leg.as_mut() {
        b_leg.terminate();
    }
    call.state = B2buaCallState::Terminated;
    let disposition = if call.answered_at.is_some() {
        CallDisposition::Answered
    } else {
        CallDisposition::NoAnswer
    };
    publish_end(deps, call, disposition);
}

/// Builds a response that only needs the dialog-identifying headers copied
/// from a request — used for plain status replies (481, 487, 491, 200 to
/// BYE/CANCEL) that don't mirror an upstream response body.
pub(crate) fn status_response(request: &SipMessage, status: u16, reason: &str) -> SipMessage {
    let mut resp = SipMessage::new_response(status, reason);
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
    resp
}

/// Mirrors an upstream response back to the peer that sent `original_request`,
/// optionally substituting the body (used to splice in the relay-rewritten
/// SDP instead of forwarding the upstream body verbatim).
fn mirror_response(upstream: &SipMessage, original_request: &SipMessage, body_override: Option<Vec<u8>>) -> SipMessage {
    let status = upstream.status().unwrap_or(500);
    let mut resp = status_response(original_request, status, reason_for(status));
    let body = body_override.unwrap_or_else(|| upstream.body.clone());
    if !body.is_empty() {
        resp.add_header("Content-Type", "application/sdp");
    }
    resp.body = body;
    resp
}

fn error_response(original_invite: &SipMessage, error: &Error) -> SipMessage {
    let (status, reason) = error.sip_status().unwrap_or((500, "Server Internal Error"));
    status_response(original_invite, status, reason)
}

fn reason_for(status: u16) -> &'static str {
    match status {
        180 => "Ringing",
        183 => "Session Progress",
        200 => "OK",
        486 => "Busy Here",
        487 => "Request Terminated",
        491 => "Request Pending",
        _ => "Unknown",
    }
}

fn send_final_to_a(deps: &B2buaDeps, server_tx_key: &crate::transaction::TransactionKey, original_invite: &SipMessage, error: &Error) {
    if let Some(handle) = deps.transactions.handle(server_tx_key) {
        handle.send_final(error_response(original_invite, error));
    }
}

fn publish_end(deps: &B2buaDeps, call: &B2buaCall, disposition: CallDisposition) {
    let setup_duration_millis = call
        .answered_at
        .map(|t| t.saturating_duration_since(call.started_at).as_millis() as u64);
    let talk_duration_secs = call.answered_at.map(|t| t.elapsed().as_secs());

    deps.events.publish(GatewayEvent::CallEnded(CallRecordSnapshot {
        call_id: call.call_id.clone(),
        from_aor: call.from_aor.clone(),
        to_aor: call.to_aor.clone(),
        disposition,
        setup_duration_millis,
        talk_duration_secs,
        ended_at_epoch_secs: CallRecordSnapshot::now_epoch_secs(),
    }));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_user_from_plain_uri() {
        assert_eq!(extract_user_from_uri("sip:1001@ims.local"), Some("1001".to_string()));
    }

    #[test]
    fn extracts_user_from_display_name_uri() {
        assert_eq!(
            extract_user_from_uri("\"Bob\" <sip:bob@biloxi.com>;tag=123"),
            Some("bob".to_string())
        );
    }

    #[test]
    fn rejects_non_sip_scheme() {
        assert_eq!(extract_user_from_uri("tel:+14155551212"), None);
    }

    #[test]
    fn builds_destination_uri() {
        assert_eq!(build_destination_uri("ims.local", "1002"), "sip:1002@ims.local");
    }

    #[test]
    fn status_response_copies_dialog_headers() {
        let mut req = SipMessage::new_request("BYE", "sip:bob@biloxi.com");
        req.add_header("Via", "SIP/2.0/UDP pc33.atlanta.com;branch=z9hG4bKbye1");
        req.add_header("Call-ID", "abc@atlanta.com");
        req.add_header("From", "<sip:alice@atlanta.com>;tag=111");
        req.add_header("To", "<sip:bob@biloxi.com>;tag=222");
        req.add_header("CSeq", "2 BYE");

        let resp = status_response(&req, 200, "OK");
        assert_eq!(resp.status(), Some(200));
        assert_eq!(resp.header("Call-ID"), Some("abc@atlanta.com"));
        assert_eq!(resp.header("To"), Some("<sip:bob@biloxi.com>;tag=222"));
        assert_eq!(resp.header("CSeq"), Some("2 BYE"));
    }

    #[test]
    fn status_response_tags_untagged_to_header() {
        let mut req = SipMessage::new_request("INVITE", "sip:bob@biloxi.com");
        req.add_header("Via", "SIP/2.0/UDP pc33.atlanta.com;branch=z9hG4bKinv1");
        req.add_header("Call-ID", "abc@atlanta.com");
        req.add_header("From", "<sip:alice@atlanta.com>;tag=111");
        req.add_header("To", "<sip:bob@biloxi.com>");
        req.add_header("CSeq", "1 INVITE");

        let resp = status_response(&req, 487, "Request Terminated");
        assert!(resp.header("To").unwrap().contains("tag="));
    }

    #[test]
    fn mirror_response_prefers_body_override() {
        let mut req = SipMessage::new_request("INVITE", "sip:bob@biloxi.com");
        req.add_header("Via", "SIP/2.0/UDP pc33.atlanta.com;branch=z9hG4bKinv2");
        req.add_header("Call-ID", "abc@atlanta.com");
        req.add_header("From", "<sip:alice@atlanta.com>;tag=111");
        req.add_header("To", "<sip:bob@biloxi.com>");
        req.add_header("CSeq", "1 INVITE");

        let mut upstream = SipMessage::new_response(200, "OK");
        upstream.body = b"upstream-body".to_vec();

        let resp = mirror_response(&upstream, &req, Some(b"rewritten-sdp".to_vec()));
        assert_eq!(resp.body, b"rewritten-sdp");
        assert_eq!(resp.header("Content-Type"), Some("application/sdp"));
    }
}
