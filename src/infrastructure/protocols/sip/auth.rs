//! SIP Digest authentication, client side (RFC 2617 / RFC 3261 22.4)
//!
//! Answers a 401/407 challenge from a carrier or PBX. Only MD5 is
//! supported; `qop=auth` is used when the challenge offers it.

use super::message::SipError;
use rand::RngCore;
use std::collections::HashMap;
use tracing::debug;

/// Parsed `WWW-Authenticate` / `Proxy-Authenticate` value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestChallenge {
    pub realm: String,
    pub nonce: String,
    pub algorithm: Option<String>,
    pub qop: Option<String>,
    pub opaque: Option<String>,
}

impl DigestChallenge {
    pub fn parse(value: &str) -> Result<Self, SipError> {
        let params = parse_digest_params(value)?;
        let nonce = params
            .get("nonce")
            .cloned()
            .ok_or_else(|| SipError::Parse("digest challenge without nonce".to_string()))?;

        if let Some(algorithm) = params.get("algorithm") {
            if !algorithm.eq_ignore_ascii_case("md5") {
                return Err(SipError::Parse(format!(
                    "unsupported digest algorithm {}",
                    algorithm
                )));
            }
        }

        Ok(Self {
            realm: params.get("realm").cloned().unwrap_or_default(),
            nonce,
            algorithm: params.get("algorithm").cloned(),
            qop: params.get("qop").cloned(),
            opaque: params.get("opaque").cloned(),
        })
    }

    /// `auth` when the server offers it among its qop options
    fn selected_qop(&self) -> Option<&'static str> {
        self.qop
            .as_deref()?
            .split(',')
            .any(|q| q.trim().eq_ignore_ascii_case("auth"))
            .then_some("auth")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestCredentials {
    pub username: String,
    pub password: String,
    /// Overrides the challenge realm when set
    pub realm: Option<String>,
}

fn parse_digest_params(value: &str) -> Result<HashMap<String, String>, SipError> {
    let digest_str = value
        .trim()
        .strip_prefix("Digest")
        .ok_or_else(|| SipError::Parse("not a Digest challenge".to_string()))?
        .trim();

    let mut params = HashMap::new();
    let mut current = String::new();
    let mut in_quote = false;
    let mut parts = Vec::new();
    for ch in digest_str.chars() {
        match ch {
            '"' => {
                in_quote = !in_quote;
                current.push(ch);
            }
            ',' if !in_quote => parts.push(std::mem::take(&mut current)),
            _ => current.push(ch),
        }
    }
    parts.push(current);

    for part in parts {
        if let Some((key, value)) = part.trim().split_once('=') {
            params.insert(
                key.trim().to_ascii_lowercase(),
                value.trim().trim_matches('"').to_string(),
            );
        }
    }
    Ok(params)
}

fn md5_hex(input: String) -> String {
    format!("{:x}", md5::compute(input))
}

/// Digest response hash
#[allow(clippy::too_many_arguments)]
pub fn compute_response(
    username: &str,
    password: &str,
    realm: &str,
    nonce: &str,
    method: &str,
    uri: &str,
    qop: Option<&str>,
    nc: &str,
    cnonce: &str,
) -> String {
    // HA1 = MD5(username:realm:password)
    let ha1 = md5_hex(format!("{}:{}:{}", username, realm, password));
    // HA2 = MD5(method:uri)
    let ha2 = md5_hex(format!("{}:{}", method, uri));

    match qop {
        Some(qop) => md5_hex(format!(
            "{}:{}:{}:{}:{}:{}",
            ha1, nonce, nc, cnonce, qop, ha2
        )),
        None => md5_hex(format!("{}:{}:{}", ha1, nonce, ha2)),
    }
}

/// Build the `Authorization` / `Proxy-Authorization` value for a request
pub fn authorization_value(
    challenge: &DigestChallenge,
    credentials: &DigestCredentials,
    method: &str,
    uri: &str,
) -> String {
    let realm = credentials
        .realm
        .as_deref()
        .filter(|r| !r.is_empty())
        .unwrap_or(&challenge.realm);
    let qop = challenge.selected_qop();
    let nc = "00000001";

    let mut raw = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut raw);
    let cnonce = hex::encode(raw);

    let response = compute_response(
        &credentials.username,
        &credentials.password,
        realm,
        &challenge.nonce,
        method,
        uri,
        qop,
        nc,
        &cnonce,
    );
    debug!(username = %credentials.username, realm, "Answering digest challenge");

    let mut value = format!(
        "Digest username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\", response=\"{}\", algorithm=MD5",
        credentials.username, realm, challenge.nonce, uri, response
    );
    if let Some(qop) = qop {
        value.push_str(&format!(", qop={}, nc={}, cnonce=\"{}\"", qop, nc, cnonce));
    }
    if let Some(opaque) = &challenge.opaque {
        value.push_str(&format!(", opaque=\"{}\"", opaque));
    }
    value
}
