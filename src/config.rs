//! Configuration and process-wide identity for the B2BUA core.
//!
//! `GatewayConfig` is the top-level, file/env-loadable configuration.
//! `Identity`, derived from it at startup, is the process-wide singleton
//! that every outbound message and SDP rewrite consults for the advertised
//! host/port and domain.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::nat::Cidr;
use crate::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub general: GeneralConfig,
    pub sip: SipConfig,
    pub rtpproxy: RtpProxyConfig,
    pub nat: NatConfig,
    pub registrar: RegistrarConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    pub node_id: String,
    pub domain: String,
    /// "AUTO" requests public-IP detection at startup; otherwise an explicit
    /// host or tunnel hostname.
    pub advertised_host: String,
    /// Port advertised in Via/Contact/Record-Route; may differ from
    /// `sip.bind_port` when fronted by a tunnel.
    pub advertised_port: u16,
    pub shutdown_timeout_secs: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SipConfig {
    pub bind_address: IpAddr,
    pub bind_port: u16,
    pub enable_tcp: bool,
    pub t1_millis: u64,
    pub t2_millis: u64,
    pub max_forwards: u8,
}

impl Default for SipConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            bind_port: 5060,
            enable_tcp: false,
            t1_millis: 500,
            t2_millis: 4000,
            max_forwards: 70,
        }
    }
}

/// The datagram address RTPProxy's control protocol is spoken over.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RtpProxyControlAddr {
    Udp { addr: SocketAddr },
    Unix { path: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RtpProxyConfig {
    pub control: RtpProxyControlAddr,
    pub timeout_millis: u64,
    pub max_retries: u32,
}

impl Default for RtpProxyConfig {
    fn default() -> Self {
        Self {
            control: RtpProxyControlAddr::Udp {
                addr: "127.0.0.1:22222".parse().unwrap(),
            },
            timeout_millis: 1000,
            max_retries: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NatConfig {
    pub private_cidrs: Vec<String>,
}

impl Default for NatConfig {
    fn default() -> Self {
        Self {
            private_cidrs: vec![
                "10.0.0.0/8".to_string(),
                "172.16.0.0/12".to_string(),
                "192.168.0.0/16".to_string(),
                "127.0.0.0/8".to_string(),
            ],
        }
    }
}

impl NatConfig {
    pub fn parsed_cidrs(&self) -> Result<Vec<Cidr>> {
        self.private_cidrs
            .iter()
            .map(|s| Cidr::parse(s).ok_or_else(|| Error::parse(format!("invalid CIDR: {s}"))))
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrarConfig {
    pub realm: String,
    pub registration_max_expiry: u32,
    pub nonce_lifetime_secs: u64,
    /// AoR (user part, not full URI) -> shared secret.
    pub users: std::collections::HashMap<String, String>,
}

impl Default for RegistrarConfig {
    fn default() -> Self {
        Self {
            realm: "ims.local".to_string(),
            registration_max_expiry: 3600,
            nonce_lifetime_secs: 300,
            users: std::collections::HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<String>,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
            format: LogFormat::Full,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Json,
    Compact,
    Full,
}

impl GatewayConfig {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: GatewayConfig =
            toml::from_str(&contents).map_err(|e| Error::parse(format!("Invalid TOML: {e}")))?;
        Ok(config)
    }

    pub fn load_from_env() -> Result<Self> {
        let settings = config::Config::builder().add_source(
            config::Environment::with_prefix("IMS_B2BUA")
                .separator("_")
                .try_parsing(true),
        );

        let config = settings.build()?;
        let gateway_config = config.try_deserialize()?;
        Ok(gateway_config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.general.advertised_port == 0 {
            return Err(Error::parse("advertised_port must be nonzero"));
        }

        if self.registrar.users.is_empty() {
            return Err(Error::parse(
                "registrar.users must contain at least one credential",
            ));
        }

        self.nat.parsed_cidrs()?;

        match &self.rtpproxy.control {
            RtpProxyControlAddr::Unix { path } if path.is_empty() => {
                return Err(Error::parse("rtpproxy.control unix path must not be empty"));
            }
            _ => {}
        }

        Ok(())
    }

    pub fn default_config() -> Self {
        let mut users = std::collections::HashMap::new();
        users.insert("1001".to_string(), "changeme".to_string());
        users.insert("1002".to_string(), "changeme".to_string());

        Self {
            general: GeneralConfig {
                node_id: "ims-b2bua-1".to_string(),
                domain: "ims.local".to_string(),
                advertised_host: "AUTO".to_string(),
                advertised_port: 5060,
                shutdown_timeout_secs: 5,
            },
            sip: SipConfig::default(),
            rtpproxy: RtpProxyConfig::default(),
            nat: NatConfig::default(),
            registrar: RegistrarConfig {
                users,
                ..RegistrarConfig::default()
            },
            logging: LoggingConfig::default(),
        }
    }
}

/// Process-wide resolved identity: the advertised host/port and domain.
///
/// Built once at startup from `GatewayConfig`; passed by `Arc` to every
/// component that needs to know how the server presents itself, rather than
/// read through an ambient global singleton.
#[derive(Debug, Clone)]
pub struct Identity {
    pub signalling_host: IpAddr,
    pub signalling_port: u16,
    pub advertised_host: String,
    pub advertised_port: u16,
    pub domain: String,
    pub private_cidrs: Vec<Cidr>,
}

impl Identity {
    pub fn resolve(config: &GatewayConfig, auto_detected_ip: Option<IpAddr>) -> Result<Self> {
        let advertised_host = if config.general.advertised_host.eq_ignore_ascii_case("AUTO") {
            let ip = auto_detected_ip
                .ok_or_else(|| Error::parse("AUTO advertised_host requested but no public IP was detected"))?;
            ip.to_string()
        } else {
            config.general.advertised_host.clone()
        };

        Ok(Self {
            signalling_host: config.sip.bind_address,
            signalling_port: config.sip.bind_port,
            advertised_host,
            advertised_port: config.general.advertised_port,
            domain: config.general.domain.clone(),
            private_cidrs: config.nat.parsed_cidrs()?,
        })
    }

    pub fn advertised_socket_addr(&self) -> String {
        format!("{}:{}", self.advertised_host, self.advertised_port)
    }

    pub fn is_private(&self, ip: IpAddr) -> bool {
        self.private_cidrs.iter().any(|c| c.contains(ip))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        let config = GatewayConfig::default_config();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_config_with_no_users() {
        let mut config = GatewayConfig::default_config();
        config.registrar.users.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn identity_resolves_explicit_host() {
        let config = GatewayConfig::default_config();
        let mut config = config;
        config.general.advertised_host = "203.0.113.10".to_string();
        let identity = Identity::resolve(&config, None).unwrap();
        assert_eq!(identity.advertised_host, "203.0.113.10");
        assert_eq!(identity.advertised_port, 5060);
    }

    #[test]
    fn identity_auto_requires_detected_ip() {
        let config = GatewayConfig::default_config();
        assert!(Identity::resolve(&config, None).is_err());
        let identity = Identity::resolve(&config, Some("198.51.100.5".parse().unwrap())).unwrap();
        assert_eq!(identity.advertised_host, "198.51.100.5");
    }

    #[test]
    fn load_from_file_round_trips_default_config() {
        let config = GatewayConfig::default_config();
        let toml_content = toml::to_string_pretty(&config).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.toml");
        std::fs::write(&path, toml_content).unwrap();

        let loaded = GatewayConfig::load_from_file(&path).unwrap();
        assert_eq!(loaded.sip.bind_port, config.sip.bind_port);
        assert_eq!(loaded.registrar.realm, config.registrar.realm);
    }
}
