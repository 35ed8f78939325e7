//! Dialog data model: the per-leg state a B2BUA call bridges.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::codec::SipMessage;
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DialogId {
    pub call_id: String,
    pub local_tag: String,
    pub remote_tag: String,
}

impl DialogId {
    pub fn new(call_id: impl Into<String>, local_tag: impl Into<String>, remote_tag: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            local_tag: local_tag.into(),
            remote_tag: remote_tag.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LegState {
    Early,
    Confirmed,
    Terminated,
}

/// One side of a bridged call. The B2BUA owns two of these per call, A and
/// B, each with its own Call-ID and tags even though they are bridged; the
/// B-leg's outbound INVITE reuses the A-leg's Call-ID so correlating
/// logs/CDRs across both legs is trivial without a side table.
#[derive(Debug, Clone)]
pub struct DialogLeg {
    pub id: DialogId,
    pub state: LegState,
    local_seq: AtomicAnchor,
    pub remote_seq: u32,
    pub remote_target: String,
    pub route_set: Vec<String>,
}

/// `AtomicU32` isn't `Clone`; this wraps it so `DialogLeg` can still derive a
/// cheap `Clone` for event-bus/log snapshots.
#[derive(Debug)]
struct AtomicAnchor(AtomicU32);

impl Clone for AtomicAnchor {
    fn clone(&self) -> Self {
        AtomicAnchor(AtomicU32::new(self.0.load(Ordering::SeqCst)))
    }
}

impl DialogLeg {
    pub fn new(id: DialogId, remote_target: String) -> Self {
        Self {
            id,
            state: LegState::Early,
            local_seq: AtomicAnchor(AtomicU32::new(0)),
            remote_seq: 0,
            remote_target,
            route_set: Vec::new(),
        }
    }

    pub fn next_local_seq(&self) -> u32 {
        self.local_seq.0.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn confirm(&mut self) {
        self.state = LegState::Confirmed;
    }

    pub fn terminate(&mut self) {
        self.state = LegState::Terminated;
    }

    pub fn update_remote_target(&mut self, response: &SipMessage) -> Result<()> {
        if let Some(contact) = response.header("Contact") {
            let target = contact.trim_start_matches('<').split('>').next().unwrap_or(contact);
            self.remote_target = target.to_string();
        }
        Ok(())
    }

    /// Builds an in-dialog request (BYE, re-INVITE, UPDATE) addressed to the
    /// remote target with the correct From/To tag ordering for this leg's
    /// role.
    pub fn make_request(&self, method: &str, from_uri: &str, to_uri: &str) -> Result<SipMessage> {
        if self.state == LegState::Terminated {
            return Err(Error::invalid_state("cannot build request on terminated dialog leg"));
        }
        let mut req = SipMessage::new_request(method, &self.remote_target);
        req.add_header("Call-ID", self.id.call_id.clone());
        req.add_header(
            "From",
            format!("<{from_uri}>;tag={}", self.id.local_tag),
        );
        req.add_header(
            "To",
            format!("<{to_uri}>;tag={}", self.id.remote_tag),
        );
        req.add_header("CSeq", format!("{} {}", self.next_local_seq(), method));
        for route in &self.route_set {
            req.add_header("Route", route.clone());
        }
        Ok(req)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_local_seq_increments() {
        let leg = DialogLeg::new(DialogId::new("cid", "local", "remote"), "sip:bob@host".to_string());
        assert_eq!(leg.next_local_seq(), 1);
        assert_eq!(leg.next_local_seq(), 2);
    }

    #[test]
    fn make_request_fails_once_terminated() {
        let mut leg = DialogLeg::new(DialogId::new("cid", "local", "remote"), "sip:bob@host".to_string());
        leg.terminate();
        assert!(leg.make_request("BYE", "sip:alice@host", "sip:bob@host").is_err());
    }

    #[test]
    fn make_request_orders_tags_by_role() {
        let leg = DialogLeg::new(DialogId::new("cid", "localtag", "remotetag"), "sip:bob@host".to_string());
        let req = leg.make_request("BYE", "sip:alice@host", "sip:bob@host").unwrap();
        assert!(req.header("From").unwrap().contains("tag=localtag"));
        assert!(req.header("To").unwrap().contains("tag=remotetag"));
    }
}
