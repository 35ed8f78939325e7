//! SIP transaction layer: server/client INVITE and non-INVITE state
//! machines, one task per active transaction.

pub mod timers;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{instrument, trace};

use crate::codec::SipMessage;
use crate::transport::{Transport, TransportKind};
use crate::{Error, Result};
use timers::TimerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Calling,
    Trying,
    Proceeding,
    Completed,
    Confirmed,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionKind {
    ClientInvite,
    ClientNonInvite,
    ServerInvite,
    ServerNonInvite,
}

impl TransactionKind {
    pub fn for_request(method: &str, is_server: bool) -> Self {
        match (method, is_server) {
            ("INVITE", true) => TransactionKind::ServerInvite,
            ("INVITE", false) => TransactionKind::ClientInvite,
            (_, true) => TransactionKind::ServerNonInvite,
            (_, false) => TransactionKind::ClientNonInvite,
        }
    }

    pub fn is_invite(&self) -> bool {
        matches!(self, TransactionKind::ClientInvite | TransactionKind::ServerInvite)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransactionKey {
    pub branch: String,
    pub method: String,
    pub is_server: bool,
}

impl TransactionKey {
    pub fn from_message(message: &SipMessage, is_server: bool) -> Result<Self> {
        let via = message.top_via()?;
        let method = match message.method() {
            Some(m) => m.to_string(),
            None => message.cseq()?.1,
        };
        Ok(Self {
            branch: via.branch,
            method,
            is_server,
        })
    }
}

/// Events delivered to the transaction user (the dialog layer or B2BUA core)
/// as the transaction progresses.
#[derive(Debug, Clone)]
pub enum TuEvent {
    Provisional(SipMessage),
    Final(SipMessage),
    Timeout,
    TransportFailure(String),
    AckReceived(SipMessage),
}

enum Command {
    Incoming { message: SipMessage, peer: SocketAddr },
    SendProvisional(SipMessage),
    SendFinal(SipMessage),
    Cancel,
}

pub struct TransactionHandle {
    tx: mpsc::UnboundedSender<Command>,
    pub kind: TransactionKind,
}

impl TransactionHandle {
    pub fn deliver(&self, message: SipMessage, peer: SocketAddr) {
        let _ = self.tx.send(Command::Incoming { message, peer });
    }

    pub fn send_provisional(&self, message: SipMessage) {
        let _ = self.tx.send(Command::SendProvisional(message));
    }

    pub fn send_final(&self, message: SipMessage) {
        let _ = self.tx.send(Command::SendFinal(message));
    }

    pub fn cancel(&self) {
        let _ = self.tx.send(Command::Cancel);
    }
}

/// Owns every active transaction, keyed per RFC 3261 §17.1.3/§17.2.3 matching
/// rules (branch + method + client/server role). Uses the same `DashMap`
/// ownership-table pattern as `B2buaService::calls`.
pub struct TransactionManager {
    transactions: Arc<DashMap<TransactionKey, TransactionHandle>>,
    transport: Transport,
    timers: TimerConfig,
}

impl TransactionManager {
    pub fn new(transport: Transport, timers: TimerConfig) -> Self {
        Self {
            transactions: Arc::new(DashMap::new()),
            transport,
            timers,
        }
    }

    /// Routes an inbound message to its existing transaction, returning
    /// `None` if none matches (caller must start a new server transaction or
    /// treat a response as orphaned).
    pub fn route_incoming(&self, message: &SipMessage, peer: SocketAddr) -> Result<bool> {
        let is_server = message.is_request();
        let mut key = TransactionKey::from_message(message, is_server)?;
        // ACK for a non-2xx response matches the INVITE transaction it acks.
        if message.method() == Some("ACK") {
            key.method = "INVITE".to_string();
        }
        if let Some(handle) = self.transactions.get(&key) {
            handle.deliver(message.clone(), peer);
            return Ok(true);
        }
        Ok(false)
    }

    #[instrument(skip(self, request, tu_tx, peer), fields(method = request.method()))]
    pub fn start_client_transaction(
        &self,
        request: SipMessage,
        peer: SocketAddr,
        transport_kind: TransportKind,
        tu_tx: mpsc::UnboundedSender<TuEvent>,
        cancel: CancellationToken,
    ) -> Result<TransactionKey> {
        let method = request
            .method()
            .ok_or_else(|| Error::malformed("client transaction requires a request"))?
            .to_string();
        let key = TransactionKey::from_message(&request, false)?;
        let kind = TransactionKind::for_request(&method, false);

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        self.transactions.insert(
            key.clone(),
            TransactionHandle {
                tx: cmd_tx,
                kind,
            },
        );

        let transport = self.transport.clone();
        let transactions = self.transactions.clone();
        let timers = self.timers;
        let key_for_task = key.clone();

        tokio::spawn(async move {
            run_client_transaction(
                kind, request, peer, transport_kind, transport, timers, cmd_rx, tu_tx, cancel,
            )
            .await;
            transactions.remove(&key_for_task);
        });

        Ok(key)
    }

    #[instrument(skip(self, request, tu_tx, peer), fields(method = request.method()))]
    pub fn start_server_transaction(
        &self,
        request: SipMessage,
        peer: SocketAddr,
        transport_kind: TransportKind,
        tu_tx: mpsc::UnboundedSender<TuEvent>,
        cancel: CancellationToken,
    ) -> Result<TransactionKey> {
        let method = request
            .method()
            .ok_or_else(|| Error::malformed("server transaction requires a request"))?
            .to_string();
        let key = TransactionKey::from_message(&request, true)?;
        let kind = TransactionKind::for_request(&method, true);

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        self.transactions.insert(
            key.clone(),
            TransactionHandle {
                tx: cmd_tx,
                kind,
            },
        );

        let transport = self.transport.clone();
        let transactions = self.transactions.clone();
        let timers = self.timers;
        let key_for_task = key.clone();

        tu_tx
            .send(TuEvent::Provisional(request.clone()))
            .ok();

        tokio::spawn(async move {
            run_server_transaction(
                kind, request, peer, transport_kind, transport, timers, cmd_rx, tu_tx, cancel,
            )
            .await;
            transactions.remove(&key_for_task);
        });

        Ok(key)
    }

    pub fn handle(&self, key: &TransactionKey) -> Option<TransactionHandle> {
        self.transactions.get(key).map(|h| TransactionHandle {
            tx: h.tx.clone(),
            kind: h.kind,
        })
    }

    pub fn active_count(&self) -> usize {
        self.transactions.len()
    }
}

async fn run_client_transaction(
    kind: TransactionKind,
    request: SipMessage,
    peer: SocketAddr,
    transport_kind: TransportKind,
    transport: Transport,
    timers: TimerConfig,
    mut cmd_rx: mpsc::UnboundedReceiver<Command>,
    tu_tx: mpsc::UnboundedSender<TuEvent>,
    cancel: CancellationToken,
) {
    let mut state = if kind.is_invite() {
        TransactionState::Calling
    } else {
        TransactionState::Trying
    };

    if let Err(e) = transport.send(&request, peer, transport_kind).await {
        let _ = tu_tx.send(TuEvent::TransportFailure(e.to_string()));
        return;
    }

    let is_reliable = transport_kind == TransportKind::Tcp;
    let mut retransmit_interval = timers.t1;
    let mut retransmit_timer = tokio::time::interval(retransmit_interval);
    retransmit_timer.tick().await; // consume the immediate first tick

    let timeout_limit = if kind.is_invite() { timers.t1 * 64 } else { timers.t1 * 64 };
    let deadline = tokio::time::sleep(timeout_limit);
    tokio::pin!(deadline);

    let completed_wait = tokio::time::sleep(Duration::from_secs(3600));
    tokio::pin!(completed_wait);
    let mut completed_wait_armed = false;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                trace!("client transaction cancelled");
                break;
            }
            _ = &mut deadline, if state == TransactionState::Calling || state == TransactionState::Trying => {
                let _ = tu_tx.send(TuEvent::Timeout);
                break;
            }
            _ = retransmit_timer.tick(), if !is_reliable && matches!(state, TransactionState::Calling | TransactionState::Trying) => {
                retransmit_interval = timers.next_retransmit(retransmit_interval);
                retransmit_timer = tokio::time::interval(retransmit_interval);
                retransmit_timer.tick().await;
                if transport.send(&request, peer, transport_kind).await.is_err() {
                    let _ = tu_tx.send(TuEvent::TransportFailure("retransmit failed".into()));
                    break;
                }
            }
            _ = &mut completed_wait, if completed_wait_armed => {
                break;
            }
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(Command::Incoming { message, .. }) => {
                        let Some(status) = message.status() else { continue };
                        if status < 200 {
                            state = TransactionState::Proceeding;
                            let _ = tu_tx.send(TuEvent::Provisional(message));
                        } else {
                            let _ = tu_tx.send(TuEvent::Final(message));
                            if kind.is_invite() && status >= 300 {
                                state = TransactionState::Completed;
                                completed_wait.as_mut().reset(tokio::time::Instant::now() + timers.timer_d());
                                completed_wait_armed = true;
                            } else if !kind.is_invite() {
                                state = TransactionState::Completed;
                                let wait = if is_reliable { Duration::ZERO } else { timers.timer_k() };
                                completed_wait.as_mut().reset(tokio::time::Instant::now() + wait);
                                completed_wait_armed = true;
                            } else {
                                break;
                            }
                        }
                    }
                    Some(Command::Cancel) => {
                        // CANCEL only applies while no final response has
                        // arrived yet (RFC 3261 §9.1); it matches the INVITE
                        // it cancels by reusing its Via branch, Call-ID,
                        // From, To and CSeq number.
                        if kind.is_invite() && matches!(state, TransactionState::Calling | TransactionState::Proceeding) {
                            let cancel_req = build_cancel(&request);
                            if transport.send(&cancel_req, peer, transport_kind).await.is_err() {
                                let _ = tu_tx.send(TuEvent::TransportFailure("cancel send failed".into()));
                            }
                        }
                    }
                    Some(_) | None => break,
                }
            }
        }
    }
}

async fn run_server_transaction(
    kind: TransactionKind,
    request: SipMessage,
    peer: SocketAddr,
    transport_kind: TransportKind,
    transport: Transport,
    timers: TimerConfig,
    mut cmd_rx: mpsc::UnboundedReceiver<Command>,
    tu_tx: mpsc::UnboundedSender<TuEvent>,
    cancel: CancellationToken,
) {
    let mut state = if kind.is_invite() {
        TransactionState::Proceeding
    } else {
        TransactionState::Trying
    };
    let mut last_final: Option<SipMessage> = None;
    let mut responded = false;

    let is_reliable = transport_kind == TransportKind::Tcp;
    let idle_wait = tokio::time::sleep(Duration::from_secs(3600));
    tokio::pin!(idle_wait);
    let mut idle_armed = false;

    // If the TU stays silent for 200ms on an INVITE, send 100 Trying so the
    // UAC stops retransmitting (RFC 3261 §17.2.1).
    let trying_timer = tokio::time::sleep(Duration::from_millis(200));
    tokio::pin!(trying_timer);
    let mut trying_armed = kind.is_invite();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = &mut idle_wait, if idle_armed => {
                break;
            }
            _ = &mut trying_timer, if trying_armed && !responded => {
                let auto_trying = build_trying(&request);
                let _ = transport.send(&auto_trying, peer, transport_kind).await;
                responded = true;
                trying_armed = false;
            }
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(Command::Incoming { message, .. }) => {
                        if message.method() == Some("ACK") {
                            let _ = tu_tx.send(TuEvent::AckReceived(message));
                            if kind == TransactionKind::ServerInvite {
                                state = TransactionState::Confirmed;
                                let wait = if is_reliable { Duration::ZERO } else { timers.timer_i() };
                                idle_wait.as_mut().reset(tokio::time::Instant::now() + wait);
                                idle_armed = true;
                            }
                            continue;
                        }
                        // Retransmitted request while we already have a final
                        // response: resend it rather than re-processing. A
                        // retransmitted INVITE after 200 OK is absorbed here,
                        // not re-dispatched to the TU.
                        if let Some(final_resp) = &last_final {
                            let _ = transport.send(final_resp, peer, transport_kind).await;
                        }
                    }
                    Some(Command::SendProvisional(resp)) => {
                        state = TransactionState::Proceeding;
                        responded = true;
                        let _ = transport.send(&resp, peer, transport_kind).await;
                    }
                    Some(Command::SendFinal(resp)) => {
                        let status = resp.status().unwrap_or(500);
                        responded = true;
                        let _ = transport.send(&resp, peer, transport_kind).await;
                        last_final = Some(resp);
                        if kind.is_invite() {
                            if status >= 300 {
                                state = TransactionState::Completed;
                                let wait = if is_reliable { Duration::ZERO } else { timers.timer_h() };
                                idle_wait.as_mut().reset(tokio::time::Instant::now() + wait);
                                idle_armed = true;
                            } else {
                                // 2xx on an INVITE server transaction is retransmitted
                                // end-to-end by the TU (dialog layer), not this
                                // transaction, per RFC 3261 §13.3.1.4.
                                break;
                            }
                        } else {
                            state = TransactionState::Completed;
                            let wait = if is_reliable { Duration::ZERO } else { timers.timer_j() };
                            idle_wait.as_mut().reset(tokio::time::Instant::now() + wait);
                            idle_armed = true;
                        }
                    }
                    Some(Command::Cancel) => break,
                    None => break,
                }
            }
        }
    }
    let _ = state;
}

/// Builds a CANCEL that RFC 3261 §9.1 requires to share the Via (and thus
/// branch), Call-ID, From, To and CSeq number of the INVITE it cancels.
fn build_cancel(invite: &SipMessage) -> SipMessage {
    let uri = invite.request_uri().unwrap_or_default();
    let mut cancel = SipMessage::new_request("CANCEL", uri);
    if let Ok(via) = invite.top_via() {
        cancel.add_header("Via", via.to_string());
    }
    cancel.add_header("Call-ID", invite.header("Call-ID").unwrap_or_default());
    cancel.add_header("From", invite.header("From").unwrap_or_default());
    cancel.add_header("To", invite.header("To").unwrap_or_default());
    if let Some(mf) = invite.header("Max-Forwards") {
        cancel.add_header("Max-Forwards", mf.to_string());
    }
    if let Ok((num, _)) = invite.cseq() {
        cancel.add_header("CSeq", format!("{num} CANCEL"));
    }
    cancel
}

/// Builds an automatic 100 Trying when the TU hasn't produced one itself.
fn build_trying(request: &SipMessage) -> SipMessage {
    let mut resp = SipMessage::new_response(100, "Trying");
    if let Ok(via) = request.top_via() {
        resp.add_header("Via", via.to_string());
    }
    resp.add_header("Call-ID", request.header("Call-ID").unwrap_or_default());
    resp.add_header("From", request.header("From").unwrap_or_default());
    resp.add_header("To", request.header("To").unwrap_or_default());
    if let Ok(cseq) = request.cseq() {
        resp.add_header("CSeq", format!("{} {}", cseq.0, cseq.1));
    }
    resp
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::SipMessage;

    fn sample_invite() -> SipMessage {
        let mut msg = SipMessage::new_request("INVITE", "sip:bob@biloxi.com");
        msg.add_header("Via", "SIP/2.0/UDP pc33.atlanta.com;branch=z9hG4bKabc123");
        msg.add_header("Call-ID", "abc@atlanta.com");
        msg.add_header("CSeq", "1 INVITE");
        msg
    }

    #[test]
    fn transaction_key_uses_branch_and_method() {
        let msg = sample_invite();
        let key = TransactionKey::from_message(&msg, true).unwrap();
        assert_eq!(key.branch, "z9hG4bKabc123");
        assert_eq!(key.method, "INVITE");
        assert!(key.is_server);
    }

    #[test]
    fn ack_matches_invite_transaction_key() {
        let mut ack = SipMessage::new_request("ACK", "sip:bob@biloxi.com");
        ack.add_header("Via", "SIP/2.0/UDP pc33.atlanta.com;branch=z9hG4bKabc123");
        let mut key = TransactionKey::from_message(&ack, true).unwrap();
        assert_eq!(key.method, "ACK");
        key.method = "INVITE".to_string();
        assert_eq!(key.method, "INVITE");
    }

    #[test]
    fn kind_classification() {
        assert_eq!(TransactionKind::for_request("INVITE", true), TransactionKind::ServerInvite);
        assert_eq!(TransactionKind::for_request("INVITE", false), TransactionKind::ClientInvite);
        assert_eq!(TransactionKind::for_request("BYE", true), TransactionKind::ServerNonInvite);
        assert!(TransactionKind::ServerInvite.is_invite());
        assert!(!TransactionKind::ServerNonInvite.is_invite());
    }
}
