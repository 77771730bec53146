//! Per-tenant SIP configuration
//!
//! Produced by the request middleware chain for inbound calls and supplied by
//! the caller for outbound ones. Treated as immutable once resolved.

use super::transport::TransportProtocol;
use crate::domain::shared::DomainError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SipConfig {
    #[serde(rename = "sip_server")]
    pub server: String,
    #[serde(rename = "sip_port")]
    pub port: u16,
    #[serde(rename = "sip_transport")]
    pub transport: TransportProtocol,
    #[serde(rename = "sip_username")]
    pub username: String,
    #[serde(rename = "sip_password", skip_serializing)]
    pub password: String,
    #[serde(rename = "sip_realm")]
    pub realm: String,
    #[serde(rename = "sip_domain")]
    pub domain: String,
    /// User part of the outbound From
    pub caller_id: String,
    pub rtp_port_range_start: u16,
    pub rtp_port_range_end: u16,
    pub srtp_enabled: bool,
    pub register_timeout_secs: u64,
    pub invite_timeout_secs: u64,
    pub session_timeout_secs: u64,
    pub keepalive_enabled: bool,
}

impl Default for SipConfig {
    fn default() -> Self {
        Self {
            server: String::new(),
            port: 5060,
            transport: TransportProtocol::Udp,
            username: String::new(),
            password: String::new(),
            realm: String::new(),
            domain: String::new(),
            caller_id: String::new(),
            rtp_port_range_start: 10000,
            rtp_port_range_end: 20000,
            srtp_enabled: false,
            register_timeout_secs: 30,
            invite_timeout_secs: 60,
            session_timeout_secs: 3600,
            keepalive_enabled: true,
        }
    }
}

impl SipConfig {
    /// Full validation, required before originating an authenticated call
    pub fn validate(&self) -> Result<(), DomainError> {
        if self.server.is_empty() {
            return Err(DomainError::InvalidConfig("sip_server is required".into()));
        }
        if self.port == 0 {
            return Err(DomainError::InvalidConfig(
                "sip_port must be between 1 and 65535".into(),
            ));
        }
        if self.username.is_empty() {
            return Err(DomainError::InvalidConfig("sip_username is required".into()));
        }
        if self.password.is_empty() {
            return Err(DomainError::InvalidConfig("sip_password is required".into()));
        }
        self.validate_rtp()
    }

    /// Relaxed validation for inbound calls, which only need media
    pub fn validate_rtp(&self) -> Result<(), DomainError> {
        if self.rtp_port_range_start == 0 || self.rtp_port_range_end == 0 {
            return Err(DomainError::InvalidConfig(
                "rtp_port_range must be specified".into(),
            ));
        }
        if self.rtp_port_range_start >= self.rtp_port_range_end {
            return Err(DomainError::InvalidConfig(
                "rtp_port_range_start must be less than rtp_port_range_end".into(),
            ));
        }
        if self.rtp_port_range_start < 1024 {
            return Err(DomainError::InvalidConfig(
                "rtp_port_range_start must be >= 1024".into(),
            ));
        }
        Ok(())
    }

    /// `domain`, else `server`
    pub fn sip_domain(&self) -> &str {
        if self.domain.is_empty() {
            &self.server
        } else {
            &self.domain
        }
    }

    pub fn sip_uri(&self) -> String {
        format!("sip:{}@{}:{}", self.username, self.sip_domain(), self.port)
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.server, self.port)
    }

    pub fn invite_timeout(&self) -> Duration {
        Duration::from_secs(self.invite_timeout_secs)
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }

    pub fn register_timeout(&self) -> Duration {
        Duration::from_secs(self.register_timeout_secs)
    }
}
