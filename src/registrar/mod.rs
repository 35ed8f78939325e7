//! Registrar and digest authentication.
//!
//! Bindings live in a `DashMap` keyed by address-of-record, the same
//! concurrent-map idiom used for every other piece of stateful service state
//! in this crate (`B2buaService::calls`, the transaction table). Authentication
//! is RFC 2617 digest, MD5 variant only — MD5-sess is not implemented.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use rand::RngCore;
use tracing::{debug, info};

use crate::config::RegistrarConfig;
use crate::{Error, Result};

#[derive(Debug, Clone)]
pub struct Binding {
    pub aor: String,
    pub contact: String,
    pub expires_at: Instant,
    pub observed_addr: SocketAddr,
}

impl Binding {
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// Parsed `Authorization: Digest ...` header parameters.
#[derive(Debug, Clone)]
pub struct DigestCredentials {
    pub username: String,
    pub realm: String,
    pub nonce: String,
    pub uri: String,
    pub response: String,
}

impl DigestCredentials {
    pub fn parse(header_value: &str) -> Result<Self> {
        let rest = header_value
            .trim()
            .strip_prefix("Digest ")
            .ok_or_else(|| Error::malformed("Authorization header is not Digest scheme"))?;

        let mut fields: HashMap<String, String> = HashMap::new();
        for part in split_digest_params(rest) {
            if let Some((k, v)) = part.split_once('=') {
                let v = v.trim().trim_matches('"').to_string();
                fields.insert(k.trim().to_string(), v);
            }
        }

        Ok(Self {
            username: fields
                .remove("username")
                .ok_or_else(|| Error::malformed("Digest missing username"))?,
            realm: fields
                .remove("realm")
                .ok_or_else(|| Error::malformed("Digest missing realm"))?,
            nonce: fields
                .remove("nonce")
                .ok_or_else(|| Error::malformed("Digest missing nonce"))?,
            uri: fields
                .remove("uri")
                .ok_or_else(|| Error::malformed("Digest missing uri"))?,
            response: fields
                .remove("response")
                .ok_or_else(|| Error::malformed("Digest missing response"))?,
        })
    }
}

/// Splits on commas that are not inside a quoted string.
fn split_digest_params(s: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    for c in s.chars() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                current.push(c);
            }
            ',' if !in_quotes => {
                parts.push(std::mem::take(&mut current));
            }
            _ => current.push(c),
        }
    }
    if !current.is_empty() {
        parts.push(current);
    }
    parts
}

pub fn compute_digest_response(
    username: &str,
    realm: &str,
    password: &str,
    method: &str,
    uri: &str,
    nonce: &str,
) -> String {
    let ha1 = format!("{:x}", md5::compute(format!("{username}:{realm}:{password}")));
    let ha2 = format!("{:x}", md5::compute(format!("{method}:{uri}")));
    format!("{:x}", md5::compute(format!("{ha1}:{nonce}:{ha2}")))
}

pub struct Registrar {
    config: RegistrarConfig,
    bindings: DashMap<String, Binding>,
    nonces: DashMap<String, Instant>,
}

impl Registrar {
    pub fn new(config: RegistrarConfig) -> Self {
        Self {
            config,
            bindings: DashMap::new(),
            nonces: DashMap::new(),
        }
    }

    /// Generates a fresh nonce for a 401 challenge, tracked so it can be
    /// checked for staleness when the client retries.
    pub fn issue_nonce(&self) -> String {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        let nonce = hex::encode(bytes);
        self.nonces.insert(nonce.clone(), Instant::now());
        nonce
    }

    pub fn realm(&self) -> &str {
        &self.config.realm
    }

    fn nonce_is_fresh(&self, nonce: &str) -> bool {
        self.nonces
            .get(nonce)
            .map(|issued| issued.elapsed() < Duration::from_secs(self.config.nonce_lifetime_secs))
            .unwrap_or(false)
    }

    /// Verifies a REGISTER's Authorization header against the configured
    /// shared secret for its AoR. Returns `Ok(())` on success, or the
    /// specific error the caller maps to a SIP status (UnknownAoR -> 404,
    /// AuthFailed -> 403, AuthRequired -> 401 for a stale/missing nonce).
    pub fn verify(&self, aor: &str, method: &str, uri: &str, creds: &DigestCredentials) -> Result<()> {
        let secret = self
            .config
            .users
            .get(aor)
            .ok_or_else(|| Error::UnknownAoR(aor.to_string()))?;

        if !self.nonce_is_fresh(&creds.nonce) {
            return Err(Error::AuthRequired);
        }

        let expected = compute_digest_response(&creds.username, &creds.realm, secret, method, uri, &creds.nonce);
        if expected != creds.response {
            return Err(Error::AuthFailed(format!("digest mismatch for {aor}")));
        }

        self.nonces.remove(&creds.nonce);
        Ok(())
    }

    /// Applies a REGISTER's bindings update. `expires == 0` removes the
    /// binding.
    pub fn register(&self, aor: &str, contact: &str, expires: u32, observed_addr: SocketAddr) -> Result<u32> {
        if expires == 0 {
            self.bindings.remove(aor);
            info!(aor, "binding removed");
            return Ok(0);
        }

        let clamped = expires.min(self.config.registration_max_expiry);
        self.bindings.insert(
            aor.to_string(),
            Binding {
                aor: aor.to_string(),
                contact: contact.to_string(),
                expires_at: Instant::now() + Duration::from_secs(clamped as u64),
                observed_addr,
            },
        );
        debug!(aor, expires = clamped, %observed_addr, "binding updated");
        Ok(clamped)
    }

    pub fn lookup(&self, aor: &str) -> Option<Binding> {
        self.bindings.get(aor).map(|b| b.clone()).filter(|b| !b.is_expired())
    }

    pub fn sweep_expired(&self) -> usize {
        let expired: Vec<String> = self
            .bindings
            .iter()
            .filter(|entry| entry.value().is_expired())
            .map(|entry| entry.key().clone())
            .collect();
        for aor in &expired {
            self.bindings.remove(aor);
        }
        expired.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_registrar() -> Registrar {
        let mut users = std::collections::HashMap::new();
        users.insert("1001".to_string(), "secret".to_string());
        Registrar::new(RegistrarConfig {
            realm: "ims.local".to_string(),
            registration_max_expiry: 3600,
            nonce_lifetime_secs: 300,
            users,
        })
    }

    #[test]
    fn accepts_correct_digest_response() {
        let registrar = test_registrar();
        let nonce = registrar.issue_nonce();
        let response = compute_digest_response("1001", "ims.local", "secret", "REGISTER", "sip:ims.local", &nonce);
        let creds = DigestCredentials {
            username: "1001".to_string(),
            realm: "ims.local".to_string(),
            nonce,
            uri: "sip:ims.local".to_string(),
            response,
        };
        assert!(registrar.verify("1001", "REGISTER", "sip:ims.local", &creds).is_ok());
    }

    #[test]
    fn rejects_wrong_password() {
        let registrar = test_registrar();
        let nonce = registrar.issue_nonce();
        let response = compute_digest_response("1001", "ims.local", "wrong", "REGISTER", "sip:ims.local", &nonce);
        let creds = DigestCredentials {
            username: "1001".to_string(),
            realm: "ims.local".to_string(),
            nonce,
            uri: "sip:ims.local".to_string(),
            response,
        };
        assert!(matches!(
            registrar.verify("1001", "REGISTER", "sip:ims.local", &creds),
            Err(Error::AuthFailed(_))
        ));
    }

    #[test]
    fn rejects_unknown_aor() {
        let registrar = test_registrar();
        let nonce = registrar.issue_nonce();
        let creds = DigestCredentials {
            username: "9999".to_string(),
            realm: "ims.local".to_string(),
            nonce,
            uri: "sip:ims.local".to_string(),
            response: "x".to_string(),
        };
        assert!(matches!(
            registrar.verify("9999", "REGISTER", "sip:ims.local", &creds),
            Err(Error::UnknownAoR(_))
        ));
    }

    #[test]
    fn expires_zero_removes_binding() {
        let registrar = test_registrar();
        let addr: SocketAddr = "192.168.1.10:5060".parse().unwrap();
        registrar.register("1001", "sip:1001@192.168.1.10:5060", 3600, addr).unwrap();
        assert!(registrar.lookup("1001").is_some());
        registrar.register("1001", "sip:1001@192.168.1.10:5060", 0, addr).unwrap();
        assert!(registrar.lookup("1001").is_none());
    }

    #[test]
    fn expiry_is_clamped_to_configured_maximum() {
        let registrar = test_registrar();
        let addr: SocketAddr = "192.168.1.10:5060".parse().unwrap();
        let granted = registrar.register("1001", "sip:1001@host", 999999, addr).unwrap();
        assert_eq!(granted, 3600);
    }
}
