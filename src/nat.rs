//! NAT detection helpers.
//!
//! Pure functions over parsed addresses: classify whether a peer's source
//! address is private, and decide whether Contact/SDP rewriting is needed.
//! No socket or message-type dependency here so the classification logic can
//! be exercised with literal fixtures.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// A parsed CIDR block. Hand-rolled rather than pulling in an `ipnetwork`
/// dependency nothing else in this crate needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cidr {
    network: IpAddr,
    prefix_len: u8,
}

impl Cidr {
    pub fn parse(s: &str) -> Option<Self> {
        let (addr_part, len_part) = s.split_once('/')?;
        let network: IpAddr = addr_part.parse().ok()?;
        let prefix_len: u8 = len_part.parse().ok()?;
        let max_len = match network {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        if prefix_len > max_len {
            return None;
        }
        Some(Self {
            network,
            prefix_len,
        })
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self.network, ip) {
            (IpAddr::V4(net), IpAddr::V4(addr)) => {
                Self::masked_v4(net, self.prefix_len) == Self::masked_v4(addr, self.prefix_len)
            }
            (IpAddr::V6(net), IpAddr::V6(addr)) => {
                Self::masked_v6(net, self.prefix_len) == Self::masked_v6(addr, self.prefix_len)
            }
            _ => false,
        }
    }

    fn masked_v4(ip: Ipv4Addr, prefix_len: u8) -> u32 {
        let bits = u32::from(ip);
        if prefix_len == 0 {
            0
        } else {
            bits & (u32::MAX << (32 - prefix_len))
        }
    }

    fn masked_v6(ip: Ipv6Addr, prefix_len: u8) -> u128 {
        let bits = u128::from(ip);
        if prefix_len == 0 {
            0
        } else {
            bits & (u128::MAX << (128 - prefix_len))
        }
    }
}

/// Decides whether `observed` (the transport-layer source address of a
/// request) differs from what the message itself claims for signalling
/// (`via_host`) or media (`sdp_conn_host`), which is the trigger for
/// Contact/Via/SDP rewriting.
pub fn nat_detected(private_cidrs: &[Cidr], claimed_host: &str, observed_ip: IpAddr) -> bool {
    let claimed_is_private = claimed_host
        .parse::<IpAddr>()
        .map(|ip| private_cidrs.iter().any(|c| c.contains(ip)))
        .unwrap_or(false);

    let observed_is_public = !private_cidrs.iter().any(|c| c.contains(observed_ip));

    claimed_is_private && observed_is_public
}

/// Rewrites a bare `Contact`-style URI (`sip:user@host[:port]`) to the
/// transport-observed peer address when the URI's own host is private but
/// the request arrived from a public source. Shared by the registrar and by
/// in-dialog call handling so both rewrite the same way.
pub fn rewrite_contact_for_nat(contact: &str, peer: std::net::SocketAddr, private_cidrs: &[Cidr]) -> String {
    let Some(user) = contact_user(contact) else {
        return contact.to_string();
    };
    let claimed_host = contact_host(contact).unwrap_or_default();
    if nat_detected(private_cidrs, claimed_host, peer.ip()) {
        format!("sip:{user}@{peer}")
    } else {
        contact.to_string()
    }
}

fn contact_user(contact: &str) -> Option<&str> {
    let uri = contact.rsplit('<').next().unwrap_or(contact);
    let after_scheme = uri.strip_prefix("sip:").or_else(|| uri.strip_prefix("sips:"))?;
    let user_part = after_scheme.split('@').next()?;
    if user_part.is_empty() {
        None
    } else {
        Some(user_part)
    }
}

fn contact_host(contact: &str) -> Option<&str> {
    let uri = contact.rsplit('<').next().unwrap_or(contact);
    let after_scheme = uri.strip_prefix("sip:").or_else(|| uri.strip_prefix("sips:"))?;
    let host_part = after_scheme.split('@').nth(1).unwrap_or(after_scheme);
    let host_port = host_part.split(|c| c == ';' || c == '>').next()?;
    host_port.split(':').next()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_v4_cidr() {
        let cidr = Cidr::parse("192.168.0.0/16").unwrap();
        assert!(cidr.contains("192.168.1.5".parse().unwrap()));
        assert!(!cidr.contains("10.0.0.1".parse().unwrap()));
    }

    #[test]
    fn rejects_malformed_cidr() {
        assert!(Cidr::parse("not-a-cidr").is_none());
        assert!(Cidr::parse("10.0.0.0/99").is_none());
    }

    #[test]
    fn detects_nat_when_private_claim_meets_public_source() {
        let cidrs = vec![Cidr::parse("10.0.0.0/8").unwrap()];
        assert!(nat_detected(&cidrs, "10.1.2.3", "203.0.113.9".parse().unwrap()));
        assert!(!nat_detected(&cidrs, "203.0.113.9", "203.0.113.9".parse().unwrap()));
        assert!(!nat_detected(&cidrs, "10.1.2.3", "10.1.2.3".parse().unwrap()));
    }

    #[test]
    fn rewrite_contact_substitutes_observed_peer_when_private() {
        let cidrs = vec![Cidr::parse("10.0.0.0/8").unwrap()];
        let peer: std::net::SocketAddr = "203.0.113.7:41002".parse().unwrap();
        let rewritten = rewrite_contact_for_nat("<sip:1001@10.0.0.5:5060>", peer, &cidrs);
        assert_eq!(rewritten, "sip:1001@203.0.113.7:41002");
    }

    #[test]
    fn rewrite_contact_leaves_public_host_untouched() {
        let cidrs = vec![Cidr::parse("10.0.0.0/8").unwrap()];
        let peer: std::net::SocketAddr = "203.0.113.7:41002".parse().unwrap();
        let original = "<sip:1001@203.0.113.9:5060>";
        assert_eq!(rewrite_contact_for_nat(original, peer, &cidrs), original);
    }
}
