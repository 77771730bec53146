//! Configuration management
//!
//! Engine-wide settings are loaded once at startup (TOML file plus
//! `VOXSIP__` environment overrides) and handed to constructors explicitly.
//! Per-tenant SIP credentials are resolved per call and live in
//! [`crate::infrastructure::protocols::sip::tenant`].

use crate::domain::shared::DomainError;
use crate::infrastructure::protocols::sip::transport::TransportProtocol;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub listen: ListenConfig,
    pub rtp: RtpConfig,
    pub sip: SipTimingConfig,
    pub logging: LoggingConfig,
    pub metrics: MetricsConfig,
}

/// Where the SIP server listens and what it advertises
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenConfig {
    /// Local bind address (sockets bind here)
    pub address: String,
    /// Public address advertised in SDP and Contact headers
    pub external_ip: String,
    pub port: u16,
    pub transport: TransportProtocol,
}

impl ListenConfig {
    /// Address advertised to peers, falling back to the bind address
    pub fn external_ip(&self) -> &str {
        if self.external_ip.is_empty() {
            &self.address
        } else {
            &self.external_ip
        }
    }

    pub fn bind_address(&self) -> &str {
        &self.address
    }

    pub fn validate(&self) -> Result<(), DomainError> {
        if self.port == 0 {
            return Err(DomainError::InvalidConfig(
                "listen port must be between 1 and 65535".into(),
            ));
        }
        let external = self.external_ip();
        if external.is_empty() || external == "0.0.0.0" || external == "::" {
            warn!(
                external_ip = %external,
                "SIP external IP is unroutable, peers will not reach RTP; set listen.external_ip"
            );
        }
        Ok(())
    }
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            address: "0.0.0.0".to_string(),
            external_ip: String::new(),
            port: 5060,
            transport: TransportProtocol::Udp,
        }
    }
}

/// RTP port range shared by every server instance
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RtpConfig {
    pub port_range_start: u16,
    pub port_range_end: u16,
    /// Stable owner id for port claims; a restart with the same id reclaims
    /// the ports a crashed run left in the shared store
    pub instance_id: Option<String>,
}

impl RtpConfig {
    pub fn validate(&self) -> Result<(), DomainError> {
        if self.port_range_start == 0 || self.port_range_end == 0 {
            return Err(DomainError::InvalidConfig("RTP port range is required".into()));
        }
        if self.instance_id.as_deref().is_some_and(|id| id.trim().is_empty()) {
            return Err(DomainError::InvalidConfig("rtp.instance_id must not be blank".into()));
        }
        if self.port_range_start >= self.port_range_end {
            return Err(DomainError::InvalidConfig(format!(
                "RTP port range start {} must be below end {}",
                self.port_range_start, self.port_range_end
            )));
        }
        Ok(())
    }
}

impl Default for RtpConfig {
    fn default() -> Self {
        Self {
            port_range_start: 10000,
            port_range_end: 20000,
            instance_id: None,
        }
    }
}

/// Transaction timers and call-level timeouts
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SipTimingConfig {
    /// RFC 3261 T1 in milliseconds
    pub t1_ms: u64,
    /// RFC 3261 T2 in milliseconds
    pub t2_ms: u64,
    /// How long an outbound INVITE waits for a final response
    pub invite_timeout_secs: u64,
    /// Bound on an application-initiated BYE
    pub bye_timeout_secs: u64,
    /// Grace period after a remote BYE before an outbound call is forced down
    pub outbound_bye_grace_secs: u64,
}

impl SipTimingConfig {
    pub fn t1(&self) -> Duration {
        Duration::from_millis(self.t1_ms)
    }

    pub fn t2(&self) -> Duration {
        Duration::from_millis(self.t2_ms)
    }

    pub fn invite_timeout(&self) -> Duration {
        Duration::from_secs(self.invite_timeout_secs)
    }

    pub fn bye_timeout(&self) -> Duration {
        Duration::from_secs(self.bye_timeout_secs)
    }

    pub fn outbound_bye_grace(&self) -> Duration {
        Duration::from_secs(self.outbound_bye_grace_secs)
    }
}

impl Default for SipTimingConfig {
    fn default() -> Self {
        Self {
            t1_ms: 500,
            t2_ms: 4000,
            invite_timeout_secs: 60,
            bye_timeout_secs: 5,
            outbound_bye_grace_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when RUST_LOG is unset
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Prometheus scrape listener, e.g. "0.0.0.0:9100"
    pub listen: Option<String>,
}

impl AppConfig {
    /// Load defaults, then an optional TOML file, then `VOXSIP__*` env vars
    pub fn load(path: Option<&Path>) -> Result<Self, config::ConfigError> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&AppConfig::default())?);

        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Toml)
                    .required(true),
            );
        }

        builder
            .add_source(
                config::Environment::with_prefix("VOXSIP")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }

    pub fn validate(&self) -> Result<(), DomainError> {
        self.listen.validate()?;
        self.rtp.validate()
    }

    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.listen.port, 5060);
        assert_eq!(config.rtp.port_range_start, 10000);
        assert_eq!(config.rtp.port_range_end, 20000);
        assert_eq!(config.sip.t1(), Duration::from_millis(500));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_external_ip_falls_back_to_bind_address() {
        let mut listen = ListenConfig {
            address: "10.1.2.3".into(),
            ..Default::default()
        };
        assert_eq!(listen.external_ip(), "10.1.2.3");

        listen.external_ip = "203.0.113.7".into();
        assert_eq!(listen.external_ip(), "203.0.113.7");
        assert_eq!(listen.bind_address(), "10.1.2.3");
    }

    #[test]
    fn test_invalid_port_range() {
        let rtp = RtpConfig {
            port_range_start: 20000,
            port_range_end: 20000,
            ..RtpConfig::default()
        };
        assert!(matches!(rtp.validate(), Err(DomainError::InvalidConfig(_))));

        let blank_owner = RtpConfig {
            instance_id: Some("  ".into()),
            ..RtpConfig::default()
        };
        assert!(blank_owner.validate().is_err());
        let named = RtpConfig {
            instance_id: Some("media-node-1".into()),
            ..RtpConfig::default()
        };
        assert!(named.validate().is_ok());
    }

    #[test]
    fn test_zero_listen_port_rejected() {
        let listen = ListenConfig {
            port: 0,
            ..Default::default()
        };
        assert!(listen.validate().is_err());
    }

    #[test]
    fn test_toml_round_trip() {
        let mut config = AppConfig::default();
        config.listen.external_ip = "198.51.100.4".into();
        let text = config.to_toml().unwrap();
        let parsed: AppConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.listen.external_ip, "198.51.100.4");
        assert_eq!(parsed.listen.transport, TransportProtocol::Udp);
    }
}
