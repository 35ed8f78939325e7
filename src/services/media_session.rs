//! Media session lifecycle manager.
//!
//! Exactly one `MediaSession` exists per bridged call: both legs' RTPProxy
//! sub-sessions are created and torn down together, keyed by the B2BUA's
//! Call-ID the same way `B2buaService::calls` keys its call table.

use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use tracing::{info, instrument, warn};

use super::rtpproxy::{RelayEndpoint, RtpProxyClient};
use crate::{Error, Result};

#[derive(Debug, Clone)]
pub struct MediaSession {
    pub call_id: String,
    pub a_tag: String,
    pub b_tag: String,
    pub a_relay: RelayEndpoint,
    pub b_relay: RelayEndpoint,
    pub established_at: Instant,
}

pub struct MediaSessionManager {
    rtpproxy: Arc<RtpProxyClient>,
    sessions: DashMap<String, MediaSession>,
}

impl MediaSessionManager {
    pub fn new(rtpproxy: Arc<RtpProxyClient>) -> Self {
        Self {
            rtpproxy,
            sessions: DashMap::new(),
        }
    }

    /// Stage 1 of offer/answer: allocates the A-leg's relay sub-session at
    /// INVITE time, before the B-leg INVITE is ever built or sent. If the
    /// media backend is down, this is the only thing that has happened, so
    /// the caller can fail the A-leg cleanly with no B-leg side effects.
    #[instrument(skip(self), fields(call_id))]
    pub async fn create_offer(&self, call_id: &str, a_tag: &str, a_sdp_addr: &str, a_sdp_port: u16) -> Result<RelayEndpoint> {
        if self.sessions.contains_key(call_id) {
            return Err(Error::invalid_state(format!(
                "media session already exists for call {call_id}"
            )));
        }
        self.rtpproxy.update(call_id, a_tag, None, a_sdp_addr, a_sdp_port).await
    }

    /// Stage 2: allocates the B-leg's relay sub-session once the B-leg
    /// answers, completing the session. If the B-leg allocation fails, the
    /// A-leg allocation from `create_offer` is rolled back so a half-open
    /// session never lingers.
    #[instrument(skip(self, a_relay), fields(call_id))]
    pub async fn create_answer(
        &self,
        call_id: &str,
        a_tag: &str,
        b_tag: &str,
        a_relay: RelayEndpoint,
        b_sdp_addr: &str,
        b_sdp_port: u16,
    ) -> Result<MediaSession> {
        let b_relay = match self
            .rtpproxy
            .update(call_id, b_tag, Some(a_tag), b_sdp_addr, b_sdp_port)
            .await
        {
            Ok(relay) => relay,
            Err(e) => {
                warn!(call_id, error = %e, "b-leg media allocation failed, rolling back a-leg");
                let _ = self.rtpproxy.delete(call_id, a_tag, None).await;
                return Err(e);
            }
        };

        let session = MediaSession {
            call_id: call_id.to_string(),
            a_tag: a_tag.to_string(),
            b_tag: b_tag.to_string(),
            a_relay,
            b_relay,
            established_at: Instant::now(),
        };
        self.sessions.insert(call_id.to_string(), session.clone());
        info!(call_id, "media session established");
        Ok(session)
    }

    /// Releases an A-leg relay allocated by `create_offer` that never
    /// reached an answer (B-leg rejected, cancelled, or timed out).
    #[instrument(skip(self))]
    pub async fn abandon_offer(&self, call_id: &str, a_tag: &str) -> Result<()> {
        self.rtpproxy.delete(call_id, a_tag, None).await
    }

    #[instrument(skip(self))]
    pub async fn teardown(&self, call_id: &str) -> Result<()> {
        let Some((_, session)) = self.sessions.remove(call_id) else {
            return Ok(());
        };
        let _ = self
            .rtpproxy
            .delete(call_id, &session.a_tag, Some(&session.b_tag))
            .await;
        info!(call_id, "media session torn down");
        Ok(())
    }

    pub fn get(&self, call_id: &str) -> Option<MediaSession> {
        self.sessions.get(call_id).map(|s| s.clone())
    }

    pub fn active_count(&self) -> usize {
        self.sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RtpProxyControlAddr;

    async fn manager_with_unreachable_backend() -> MediaSessionManager {
        let control = RtpProxyControlAddr::Udp {
            addr: "127.0.0.1:1".parse().unwrap(),
        };
        let client = RtpProxyClient::connect(&control, 50, 0).await.unwrap();
        MediaSessionManager::new(Arc::new(client))
    }

    #[tokio::test]
    async fn create_offer_fails_cleanly_when_backend_unreachable() {
        let manager = manager_with_unreachable_backend().await;
        let result = manager.create_offer("call1", "atag", "10.0.0.1", 10000).await;
        assert!(result.is_err());
        assert_eq!(manager.active_count(), 0);
    }

    #[tokio::test]
    async fn create_answer_fails_cleanly_when_backend_unreachable() {
        let manager = manager_with_unreachable_backend().await;
        let a_relay = RelayEndpoint {
            address: "10.0.0.1".to_string(),
            port: 40000,
        };
        let result = manager
            .create_answer("call1", "atag", "btag", a_relay, "10.0.0.2", 20000)
            .await;
        assert!(result.is_err());
        assert_eq!(manager.active_count(), 0);
    }

    #[tokio::test]
    async fn teardown_on_missing_session_is_a_no_op() {
        let manager = manager_with_unreachable_backend().await;
        assert!(manager.teardown("nonexistent").await.is_ok());
    }
}
