//! SIP message types and parsing
//!
//! Thin wrappers over `rsip` requests and responses. Header values are read
//! back as raw text and parsed here, so compact header names (`v`, `f`, `t`,
//! `i`, `m`, `l`, `c`) and unusual formatting from peers are handled the same
//! way as the long forms.

use crate::domain::shared::DomainError;
use crate::infrastructure::media::rtp::AllocatorError;
use bytes::Bytes;
use rsip::{Header, Headers, Request, Response, Uri};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SipError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Session closed")]
    SessionClosed,

    #[error("RTP not initialized")]
    RtpNotInitialized,

    #[error("SDP parse error: {0}")]
    SdpParse(String),

    #[error("Codec not supported: {0}")]
    CodecNotSupported(String),

    #[error("Buffer full")]
    BufferFull,

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("No RTP ports available")]
    PortExhausted,

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Rejected by remote: {code} {reason}")]
    Rejected { code: u16, reason: String },

    #[error("Authentication failed with status {code}")]
    AuthenticationFailed { code: u16 },

    #[error("Dialog sequence error: {0}")]
    DialogSequence(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{op} failed for call {call_id}: {source}")]
    Op {
        op: &'static str,
        call_id: String,
        #[source]
        source: Box<SipError>,
    },
}

impl SipError {
    /// Attach the failing operation and call for reporting on a session
    pub fn op(op: &'static str, call_id: impl Into<String>, source: SipError) -> Self {
        SipError::Op {
            op,
            call_id: call_id.into(),
            source: Box::new(source),
        }
    }
}

impl From<rsip::Error> for SipError {
    fn from(err: rsip::Error) -> Self {
        SipError::Parse(err.to_string())
    }
}

impl From<std::io::Error> for SipError {
    fn from(err: std::io::Error) -> Self {
        SipError::Transport(err.to_string())
    }
}

impl From<AllocatorError> for SipError {
    fn from(err: AllocatorError) -> Self {
        match err {
            AllocatorError::Exhausted { .. } => SipError::PortExhausted,
            other => SipError::Internal(other.to_string()),
        }
    }
}

impl From<DomainError> for SipError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::InvalidConfig(msg) | DomainError::ValidationError(msg) => {
                SipError::InvalidConfig(msg)
            }
            other => SipError::Internal(other.to_string()),
        }
    }
}

/// SIP method types
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SipMethod {
    Register,
    Invite,
    Ack,
    Cancel,
    Bye,
    Options,
    Info,
    Update,
    Prack,
    Subscribe,
    Notify,
    Refer,
    Message,
    Publish,
    /// Extension method the parser does not know
    Other(String),
}

/// Methods the underlying parser accepts on a request line
const PARSEABLE_METHODS: &[&str] = &[
    "ACK", "BYE", "CANCEL", "INFO", "INVITE", "MESSAGE", "NOTIFY", "OPTIONS", "PRACK", "PUBLISH",
    "REFER", "REGISTER", "SUBSCRIBE", "UPDATE",
];

impl SipMethod {
    pub fn as_str(&self) -> &str {
        match self {
            SipMethod::Register => "REGISTER",
            SipMethod::Invite => "INVITE",
            SipMethod::Ack => "ACK",
            SipMethod::Cancel => "CANCEL",
            SipMethod::Bye => "BYE",
            SipMethod::Options => "OPTIONS",
            SipMethod::Info => "INFO",
            SipMethod::Update => "UPDATE",
            SipMethod::Prack => "PRACK",
            SipMethod::Subscribe => "SUBSCRIBE",
            SipMethod::Notify => "NOTIFY",
            SipMethod::Refer => "REFER",
            SipMethod::Message => "MESSAGE",
            SipMethod::Publish => "PUBLISH",
            SipMethod::Other(name) => name,
        }
    }

    pub fn parse(name: &str) -> Self {
        match name.to_ascii_uppercase().as_str() {
            "REGISTER" => SipMethod::Register,
            "INVITE" => SipMethod::Invite,
            "ACK" => SipMethod::Ack,
            "CANCEL" => SipMethod::Cancel,
            "BYE" => SipMethod::Bye,
            "OPTIONS" => SipMethod::Options,
            "INFO" => SipMethod::Info,
            "UPDATE" => SipMethod::Update,
            "PRACK" => SipMethod::Prack,
            "SUBSCRIBE" => SipMethod::Subscribe,
            "NOTIFY" => SipMethod::Notify,
            "REFER" => SipMethod::Refer,
            "MESSAGE" => SipMethod::Message,
            "PUBLISH" => SipMethod::Publish,
            _ => SipMethod::Other(name.to_string()),
        }
    }

    pub fn from_rsip(method: &rsip::Method) -> Self {
        Self::parse(&method.to_string())
    }

    /// Methods this engine originates
    pub fn to_rsip(&self) -> Option<rsip::Method> {
        match self {
            SipMethod::Register => Some(rsip::Method::Register),
            SipMethod::Invite => Some(rsip::Method::Invite),
            SipMethod::Ack => Some(rsip::Method::Ack),
            SipMethod::Cancel => Some(rsip::Method::Cancel),
            SipMethod::Bye => Some(rsip::Method::Bye),
            SipMethod::Options => Some(rsip::Method::Options),
            _ => None,
        }
    }
}

impl fmt::Display for SipMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Expand compact header names (RFC 3261 7.3.3) and lowercase
pub fn canonical_header_name(name: &str) -> String {
    let name = name.trim().to_ascii_lowercase();
    let long = match name.as_str() {
        "i" => "call-id",
        "m" => "contact",
        "e" => "content-encoding",
        "l" => "content-length",
        "c" => "content-type",
        "f" => "from",
        "s" => "subject",
        "k" => "supported",
        "t" => "to",
        "v" => "via",
        _ => return name,
    };
    long.to_string()
}

/// Split a header into its canonical name and raw value
pub fn header_parts(header: &Header) -> (String, String) {
    let line = header.to_string();
    match line.split_once(':') {
        Some((name, value)) => (canonical_header_name(name), value.trim().to_string()),
        None => (String::new(), line.trim().to_string()),
    }
}

/// Read access to headers shared by requests and responses
pub trait HeaderAccess {
    fn headers(&self) -> &Headers;

    /// All values of `name`; comma-joined values are not split
    fn header_values(&self, name: &str) -> Vec<String> {
        let wanted = canonical_header_name(name);
        self.headers()
            .iter()
            .map(header_parts)
            .filter(|(n, _)| *n == wanted)
            .map(|(_, v)| v)
            .collect()
    }

    fn header(&self, name: &str) -> Option<String> {
        self.header_values(name).into_iter().next()
    }

    fn call_id(&self) -> Option<String> {
        self.header("call-id")
    }

    fn from_header(&self) -> Option<NameAddr> {
        self.header("from").and_then(|v| NameAddr::parse(&v))
    }

    fn to_header(&self) -> Option<NameAddr> {
        self.header("to").and_then(|v| NameAddr::parse(&v))
    }

    fn from_tag(&self) -> Option<String> {
        self.from_header().and_then(|h| h.tag().map(String::from))
    }

    fn to_tag(&self) -> Option<String> {
        self.to_header().and_then(|h| h.tag().map(String::from))
    }

    /// CSeq number and method
    fn cseq(&self) -> Option<(u32, SipMethod)> {
        let value = self.header("cseq")?;
        let mut parts = value.split_whitespace();
        let seq = parts.next()?.parse().ok()?;
        let method = SipMethod::parse(parts.next()?);
        Some((seq, method))
    }

    /// Every Via entry, top first, with comma-joined values split
    fn vias(&self) -> Vec<String> {
        self.header_values("via")
            .iter()
            .flat_map(|v| split_list(v))
            .collect()
    }

    fn top_via(&self) -> Option<String> {
        self.vias().into_iter().next()
    }

    /// Branch parameter of the top Via
    fn branch(&self) -> Option<String> {
        self.top_via()
            .and_then(|via| header_param(&via, "branch").flatten())
    }

    fn contact_uri(&self) -> Option<String> {
        self.header("contact")
            .and_then(|v| NameAddr::parse(&v))
            .map(|c| c.uri)
    }

    /// Record-Route entries in header order
    fn record_routes(&self) -> Vec<String> {
        self.header_values("record-route")
            .iter()
            .flat_map(|v| split_list(v))
            .collect()
    }
}

/// Split a comma-separated header list, respecting `<...>` and quotes
pub fn split_list(value: &str) -> Vec<String> {
    let mut items = Vec::new();
    let mut current = String::new();
    let mut in_angle = false;
    let mut in_quote = false;
    for ch in value.chars() {
        match ch {
            '"' => in_quote = !in_quote,
            '<' if !in_quote => in_angle = true,
            '>' if !in_quote => in_angle = false,
            ',' if !in_angle && !in_quote => {
                if !current.trim().is_empty() {
                    items.push(current.trim().to_string());
                }
                current.clear();
                continue;
            }
            _ => {}
        }
        current.push(ch);
    }
    if !current.trim().is_empty() {
        items.push(current.trim().to_string());
    }
    items
}

/// Look up a `;name=value` parameter. `Some(None)` when present without a value.
pub fn header_param(value: &str, name: &str) -> Option<Option<String>> {
    // parameters after a bracketed URI belong to the header, not the URI
    let params = match value.rfind('>') {
        Some(pos) => &value[pos + 1..],
        None => value,
    };
    params.split(';').skip(1).find_map(|param| {
        let param = param.trim();
        match param.split_once('=') {
            Some((k, v)) if k.trim().eq_ignore_ascii_case(name) => {
                Some(Some(v.trim().trim_matches('"').to_string()))
            }
            None if param.eq_ignore_ascii_case(name) => Some(None),
            _ => None,
        }
    })
}

/// `"Display" <uri>;params` as used by From, To, Contact and Route
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameAddr {
    pub display: Option<String>,
    pub uri: String,
    /// Header parameters; for bare URIs everything after the first `;`
    pub params: String,
}

impl NameAddr {
    pub fn new(display: Option<String>, uri: impl Into<String>) -> Self {
        Self {
            display,
            uri: uri.into(),
            params: String::new(),
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        if value.is_empty() {
            return None;
        }

        if let Some(open) = value.find('<') {
            let close = value[open..].find('>')? + open;
            let display = value[..open].trim().trim_matches('"').trim();
            return Some(Self {
                display: (!display.is_empty()).then(|| display.to_string()),
                uri: value[open + 1..close].trim().to_string(),
                params: value[close + 1..].trim().to_string(),
            });
        }

        let (uri, params) = match value.find(';') {
            Some(pos) => (&value[..pos], &value[pos..]),
            None => (value, ""),
        };
        Some(Self {
            display: None,
            uri: uri.trim().to_string(),
            params: params.trim().to_string(),
        })
    }

    pub fn tag(&self) -> Option<&str> {
        self.params.split(';').find_map(|p| {
            let (k, v) = p.trim().split_once('=')?;
            k.trim().eq_ignore_ascii_case("tag").then(|| v.trim())
        })
    }

    pub fn with_tag(mut self, tag: &str) -> Self {
        if self.tag().is_none() {
            self.params.push_str(&format!(";tag={}", tag));
        }
        self
    }

    /// User part of the URI, if any
    pub fn user(&self) -> Option<&str> {
        let rest = self.uri.split_once(':').map(|(_, r)| r)?;
        let (userinfo, _) = rest.split_once('@')?;
        Some(userinfo.split(':').next().unwrap_or(userinfo))
    }
}

impl fmt::Display for NameAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(display) = &self.display {
            write!(f, "\"{}\" ", display)?;
        }
        write!(f, "<{}>{}", self.uri, self.params)
    }
}

/// Host and port of a `sip:`/`sips:` URI
pub fn uri_host_port(uri: &str) -> Option<(String, Option<u16>)> {
    let rest = uri
        .strip_prefix("sips:")
        .or_else(|| uri.strip_prefix("sip:"))
        .unwrap_or(uri);
    let hostport = rest.rsplit_once('@').map(|(_, h)| h).unwrap_or(rest);
    let hostport = hostport
        .split(|c| c == ';' || c == '?' || c == '>')
        .next()
        .unwrap_or(hostport);

    if let Some(v6) = hostport.strip_prefix('[') {
        let (host, tail) = v6.split_once(']')?;
        let port = tail.strip_prefix(':').and_then(|p| p.parse().ok());
        return Some((host.to_string(), port));
    }
    match hostport.rsplit_once(':') {
        Some((host, port)) => Some((host.to_string(), port.parse().ok())),
        None => Some((hostport.to_string(), None)),
    }
}

/// SIP Request wrapper
#[derive(Debug, Clone)]
pub struct SipRequest {
    pub inner: Request,
    /// Original method token when the request line used an extension method
    extension_method: Option<String>,
}

impl SipRequest {
    pub fn new(inner: Request) -> Self {
        Self {
            inner,
            extension_method: None,
        }
    }

    pub fn parse(data: &[u8]) -> Result<Self, SipError> {
        let line_end = data
            .windows(2)
            .position(|w| w == b"\r\n")
            .unwrap_or(data.len());
        let first_line = &data[..line_end];
        let token_end = first_line
            .iter()
            .position(u8::is_ascii_whitespace)
            .unwrap_or(first_line.len());
        let token = std::str::from_utf8(&first_line[..token_end])
            .ok()
            .filter(|t| !t.is_empty() && t.bytes().all(is_token_byte))
            .ok_or_else(|| SipError::Parse("invalid request method".to_string()))?;

        if PARSEABLE_METHODS.contains(&token.to_ascii_uppercase().as_str()) {
            let request = rsip::Request::try_from(data)?;
            return Ok(Self::new(request));
        }

        // Parse an extension method as OPTIONS and remember the real token
        let mut rewritten = Vec::with_capacity(data.len());
        rewritten.extend_from_slice(b"OPTIONS");
        rewritten.extend_from_slice(&data[token_end..]);
        let request = rsip::Request::try_from(rewritten.as_slice())?;
        Ok(Self {
            inner: request,
            extension_method: Some(token.to_string()),
        })
    }

    pub fn method(&self) -> SipMethod {
        match &self.extension_method {
            Some(token) => SipMethod::Other(token.clone()),
            None => SipMethod::from_rsip(&self.inner.method),
        }
    }

    pub fn uri(&self) -> &Uri {
        &self.inner.uri
    }

    pub fn uri_string(&self) -> String {
        self.inner.uri.to_string()
    }

    pub fn body(&self) -> &[u8] {
        &self.inner.body
    }

    pub fn to_bytes(&self) -> Bytes {
        Bytes::from(self.inner.to_string())
    }
}

impl HeaderAccess for SipRequest {
    fn headers(&self) -> &Headers {
        &self.inner.headers
    }
}

/// SIP Response wrapper
#[derive(Debug, Clone)]
pub struct SipResponse {
    pub inner: Response,
}

impl SipResponse {
    pub fn new(inner: Response) -> Self {
        Self { inner }
    }

    pub fn parse(data: &[u8]) -> Result<Self, SipError> {
        let response = rsip::Response::try_from(data)?;
        Ok(Self::new(response))
    }

    pub fn status_code(&self) -> u16 {
        self.inner.status_code.clone().into()
    }

    pub fn reason(&self) -> String {
        let status = self.inner.status_code.to_string();
        status
            .split_once(' ')
            .map(|(_, reason)| reason.to_string())
            .unwrap_or_default()
    }

    pub fn is_provisional(&self) -> bool {
        self.status_code() < 200
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code())
    }

    pub fn body(&self) -> &[u8] {
        &self.inner.body
    }

    pub fn to_bytes(&self) -> Bytes {
        Bytes::from(self.inner.to_string())
    }
}

impl HeaderAccess for SipResponse {
    fn headers(&self) -> &Headers {
        &self.inner.headers
    }
}

/// SIP Message (either request or response)
#[derive(Debug, Clone)]
pub enum SipMessage {
    Request(SipRequest),
    Response(SipResponse),
}

/// RFC 3261 `token` characters
fn is_token_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b"-.!%*_+`'~".contains(&b)
}

impl SipMessage {
    pub fn parse(data: &[u8]) -> Result<Self, SipError> {
        if data.starts_with(b"SIP/") {
            return SipResponse::parse(data).map(SipMessage::Response);
        }
        SipRequest::parse(data).map(SipMessage::Request)
    }

    pub fn is_request(&self) -> bool {
        matches!(self, SipMessage::Request(_))
    }

    pub fn is_response(&self) -> bool {
        matches!(self, SipMessage::Response(_))
    }

    pub fn as_request(&self) -> Option<&SipRequest> {
        match self {
            SipMessage::Request(req) => Some(req),
            _ => None,
        }
    }

    pub fn as_response(&self) -> Option<&SipResponse> {
        match self {
            SipMessage::Response(resp) => Some(resp),
            _ => None,
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        match self {
            SipMessage::Request(req) => req.to_bytes(),
            SipMessage::Response(resp) => resp.to_bytes(),
        }
    }
}
