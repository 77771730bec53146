//! SIP message builder utilities

use super::message::{HeaderAccess, NameAddr, SipError, SipMethod, SipRequest, SipResponse};
use super::rport::stamp_received;
use rand::distributions::Alphanumeric;
use rand::Rng;
use rsip::{Header, Headers, Request, Response, StatusCode, Version};
use std::net::SocketAddr;

pub const USER_AGENT: &str = concat!("voxsip/", env!("CARGO_PKG_VERSION"));

/// New RFC 3261 branch (magic cookie prefix)
pub fn generate_branch() -> String {
    format!("z9hG4bK{}", uuid::Uuid::new_v4().simple())
}

/// Random alphanumeric tag
pub fn generate_tag(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

fn content_length(body: &[u8]) -> Header {
    Header::ContentLength(body.len().to_string().into())
}

/// Build a SIP response from a request
pub struct ResponseBuilder {
    status_code: u16,
    headers: Vec<Header>,
    body: Vec<u8>,
    to_tag: Option<String>,
    source: Option<SocketAddr>,
}

impl ResponseBuilder {
    pub fn new(status_code: u16) -> Self {
        Self {
            status_code,
            headers: Vec::new(),
            body: Vec::new(),
            to_tag: None,
            source: None,
        }
    }

    pub fn ok() -> Self {
        Self::new(200)
    }

    /// Attach an SDP body
    pub fn sdp(mut self, sdp: impl Into<String>) -> Self {
        self.body = sdp.into().into_bytes();
        self.headers
            .push(Header::ContentType("application/sdp".into()));
        self
    }

    pub fn header(mut self, header: Header) -> Self {
        self.headers.push(header);
        self
    }

    pub fn contact(self, uri: &str) -> Self {
        self.header(Header::Contact(format!("<{}>", uri).into()))
    }

    /// Tag added to To when the request had none
    pub fn to_tag(mut self, tag: impl Into<String>) -> Self {
        self.to_tag = Some(tag.into());
        self
    }

    /// Observed packet source, stamped on the top Via
    pub fn received_from(mut self, source: SocketAddr) -> Self {
        self.source = Some(source);
        self
    }

    pub fn build_for_request(self, request: &SipRequest) -> SipResponse {
        let mut headers = Vec::new();

        for (i, via) in request.vias().into_iter().enumerate() {
            let via = match (i, self.source) {
                (0, Some(source)) => stamp_received(&via, source),
                _ => via,
            };
            headers.push(Header::Via(via.into()));
        }

        if let Some(from) = request.header("from") {
            headers.push(Header::From(from.into()));
        }
        if let Some(to) = request.header("to") {
            let to = match (&self.to_tag, NameAddr::parse(&to)) {
                (Some(tag), Some(addr)) if self.status_code > 100 => addr.with_tag(tag).to_string(),
                _ => to,
            };
            headers.push(Header::To(to.into()));
        }
        if let Some(call_id) = request.call_id() {
            headers.push(Header::CallId(call_id.into()));
        }
        if let Some(cseq) = request.header("cseq") {
            headers.push(Header::CSeq(cseq.into()));
        }
        if (101..300).contains(&self.status_code) {
            for route in request.header_values("record-route") {
                headers.push(Header::RecordRoute(route.into()));
            }
        }

        headers.push(Header::UserAgent(USER_AGENT.into()));
        headers.extend(self.headers);
        headers.push(content_length(&self.body));

        SipResponse::new(Response {
            status_code: StatusCode::from(self.status_code),
            headers: Headers::from(headers),
            body: self.body,
            version: Version::V2,
        })
    }
}

/// Build a SIP request
pub struct RequestBuilder {
    method: SipMethod,
    uri: String,
    headers: Vec<Header>,
    body: Vec<u8>,
}

impl RequestBuilder {
    pub fn new(method: SipMethod, uri: impl Into<String>) -> Self {
        Self {
            method,
            uri: uri.into(),
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    /// Top Via; `;rport` is always requested
    pub fn via(mut self, transport: &str, sent_by: &str, branch: &str) -> Self {
        self.headers.push(Header::Via(
            format!("SIP/2.0/{} {};branch={};rport", transport, sent_by, branch).into(),
        ));
        self
    }

    pub fn from(mut self, from: &NameAddr) -> Self {
        self.headers.push(Header::From(from.to_string().into()));
        self
    }

    pub fn to(mut self, to: &NameAddr) -> Self {
        self.headers.push(Header::To(to.to_string().into()));
        self
    }

    pub fn call_id(mut self, call_id: &str) -> Self {
        self.headers.push(Header::CallId(call_id.into()));
        self
    }

    pub fn cseq(mut self, seq: u32) -> Self {
        self.headers
            .push(Header::CSeq(format!("{} {}", seq, self.method).into()));
        self
    }

    pub fn contact(mut self, uri: &str) -> Self {
        self.headers
            .push(Header::Contact(format!("<{}>", uri).into()));
        self
    }

    pub fn route(mut self, route: &str) -> Self {
        self.headers.push(Header::Route(route.into()));
        self
    }

    pub fn header(mut self, header: Header) -> Self {
        self.headers.push(header);
        self
    }

    pub fn sdp(mut self, sdp: impl Into<String>) -> Self {
        self.body = sdp.into().into_bytes();
        self.headers
            .push(Header::ContentType("application/sdp".into()));
        self
    }

    pub fn build(self) -> Result<SipRequest, SipError> {
        let method = self.method.to_rsip().ok_or_else(|| {
            SipError::Internal(format!("cannot originate {} requests", self.method))
        })?;
        let uri = rsip::Uri::try_from(self.uri.as_str())?;

        let mut headers = self.headers;
        headers.push(Header::MaxForwards("70".into()));
        headers.push(Header::UserAgent(USER_AGENT.into()));
        headers.push(content_length(&self.body));

        Ok(SipRequest::new(Request {
            method,
            uri,
            version: Version::V2,
            headers: Headers::from(headers),
            body: self.body,
        }))
    }
}
