//! Shared helpers: a raw UDP SIP peer and server setup

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use voxsip::config::AppConfig;
use voxsip::domain::call::CallState;
use voxsip::infrastructure::media::rtp::{MemoryPortStore, RtpPacket};
use voxsip::infrastructure::protocols::sip::message::{HeaderAccess, SipMessage, SipResponse};
use voxsip::infrastructure::protocols::sip::middleware::{resolver_fn, InviteResult};
use voxsip::{Server, Session, SipConfig};

pub const WAIT: Duration = Duration::from_secs(5);

pub fn free_port() -> u16 {
    std::net::UdpSocket::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

pub fn app_config(rtp_start: u16) -> AppConfig {
    let mut config = AppConfig::default();
    config.listen.address = "127.0.0.1".to_string();
    config.listen.port = free_port();
    config.rtp.port_range_start = rtp_start;
    config.rtp.port_range_end = rtp_start + 50;
    config
}

/// Running server that accepts every inbound call
pub async fn start_server(rtp_start: u16) -> Server {
    let resolver = resolver_fn(|_| Ok(InviteResult::allow(SipConfig::default())));
    let server = Server::new(
        app_config(rtp_start),
        Arc::new(MemoryPortStore::new()),
        Arc::new(resolver),
    )
    .await
    .unwrap();
    server.start().await.unwrap();
    server
}

pub fn audio_sdp(port: u16, payload_types: &str, direction: &str) -> String {
    let mut sdp = format!(
        "v=0\r\no=peer 1 1 IN IP4 127.0.0.1\r\ns=peer\r\nc=IN IP4 127.0.0.1\r\nt=0 0\r\nm=audio {} RTP/AVP {}\r\n",
        port, payload_types
    );
    for pt in payload_types.split_whitespace() {
        match pt {
            "0" => sdp.push_str("a=rtpmap:0 PCMU/8000\r\n"),
            "8" => sdp.push_str("a=rtpmap:8 PCMA/8000\r\n"),
            _ => {}
        }
    }
    sdp.push_str(&format!("a={}\r\n", direction));
    sdp
}

/// Build a UAC request as a peer would send it
pub struct RawRequest<'a> {
    pub method: &'a str,
    pub uri: String,
    pub via: SocketAddr,
    pub branch: String,
    pub from: String,
    pub to: String,
    pub call_id: &'a str,
    pub cseq: u32,
    pub body: Option<String>,
}

impl RawRequest<'_> {
    pub fn render(&self) -> String {
        let body = self.body.clone().unwrap_or_default();
        let mut msg = format!(
            "{method} {uri} SIP/2.0\r\n\
             Via: SIP/2.0/UDP {via};branch={branch}\r\n\
             Max-Forwards: 70\r\n\
             From: {from}\r\n\
             To: {to}\r\n\
             Call-ID: {call_id}\r\n\
             CSeq: {cseq} {method}\r\n\
             Contact: <sip:peer@{via}>\r\n",
            method = self.method,
            uri = self.uri,
            via = self.via,
            branch = self.branch,
            from = self.from,
            to = self.to,
            call_id = self.call_id,
            cseq = self.cseq,
        );
        if !body.is_empty() {
            msg.push_str("Content-Type: application/sdp\r\n");
        }
        msg.push_str(&format!("Content-Length: {}\r\n\r\n{}", body.len(), body));
        msg
    }
}

/// Value of the first `name` header in a raw message
pub fn header_value(raw: &str, name: &str) -> String {
    raw.split("\r\n")
        .find_map(|line| {
            let (key, value) = line.split_once(':')?;
            key.trim().eq_ignore_ascii_case(name).then(|| value.trim().to_string())
        })
        .unwrap_or_default()
}

pub fn branch() -> String {
    format!("z9hG4bK{}", uuid::Uuid::new_v4().simple())
}

/// Answer a request the server sent, echoing its dialog headers
pub fn reply(request: &str, code: u16, reason: &str, to_tag: Option<&str>, extra: &[String], body: &str) -> String {
    let mut out = format!("SIP/2.0 {} {}\r\n", code, reason);
    for line in request.split("\r\n").skip(1) {
        if line.is_empty() {
            break;
        }
        let name = line.split(':').next().unwrap_or_default().trim().to_ascii_lowercase();
        match name.as_str() {
            "via" | "v" | "from" | "f" | "call-id" | "i" | "cseq" => {
                out.push_str(line);
                out.push_str("\r\n");
            }
            "to" | "t" => {
                out.push_str(line);
                if let Some(tag) = to_tag.filter(|_| !line.contains("tag=")) {
                    out.push_str(&format!(";tag={}", tag));
                }
                out.push_str("\r\n");
            }
            _ => {}
        }
    }
    for header in extra {
        out.push_str(header);
        out.push_str("\r\n");
    }
    if !body.is_empty() {
        out.push_str("Content-Type: application/sdp\r\n");
    }
    out.push_str(&format!("Content-Length: {}\r\n\r\n{}", body.len(), body));
    out
}

/// Raw UDP SIP endpoint on the loopback interface
pub struct Peer {
    pub socket: UdpSocket,
    pub addr: SocketAddr,
}

impl Peer {
    pub async fn bind() -> Self {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        Self { socket, addr }
    }

    pub async fn send(&self, to: SocketAddr, msg: &str) {
        self.socket.send_to(msg.as_bytes(), to).await.unwrap();
    }

    pub async fn recv(&self) -> (String, SipMessage) {
        let mut buf = vec![0u8; 65535];
        let (n, _) = tokio::time::timeout(WAIT, self.socket.recv_from(&mut buf))
            .await
            .expect("no SIP message from server")
            .unwrap();
        let raw = String::from_utf8_lossy(&buf[..n]).into_owned();
        let message = SipMessage::parse(&buf[..n]).unwrap();
        (raw, message)
    }

    /// Next response with `code`, skipping provisionals and retransmissions
    pub async fn expect_response(&self, code: u16) -> (String, SipResponse) {
        loop {
            let (raw, message) = self.recv().await;
            if let Some(response) = message.as_response() {
                if response.status_code() == code {
                    return (raw, response.clone());
                }
            }
        }
    }

    /// Next response with `code` for the request numbered `cseq`
    pub async fn expect_response_to(&self, code: u16, cseq: u32) -> (String, SipResponse) {
        loop {
            let (raw, response) = self.expect_response(code).await;
            if response.cseq().map(|(seq, _)| seq) == Some(cseq) {
                return (raw, response);
            }
        }
    }

    /// Fail if a `method` request shows up within `window`
    pub async fn expect_no_request(&self, method: &str, window: Duration) {
        let mut buf = vec![0u8; 65535];
        let deadline = tokio::time::Instant::now() + window;
        while let Ok(received) = tokio::time::timeout_at(deadline, self.socket.recv_from(&mut buf)).await {
            let (n, _) = received.unwrap();
            if let Ok(SipMessage::Request(request)) = SipMessage::parse(&buf[..n]) {
                assert_ne!(request.method().as_str(), method, "unexpected {}", method);
            }
        }
    }

    /// Next request whose method is `method`
    pub async fn expect_request(&self, method: &str) -> String {
        loop {
            let (raw, message) = self.recv().await;
            if let Some(request) = message.as_request() {
                if request.method().as_str() == method {
                    return raw;
                }
            }
        }
    }
}

pub async fn recv_rtp(socket: &UdpSocket) -> RtpPacket {
    let mut buf = vec![0u8; 2048];
    let (n, _) = tokio::time::timeout(WAIT, socket.recv_from(&mut buf))
        .await
        .expect("no RTP from server")
        .unwrap();
    RtpPacket::parse(&buf[..n]).unwrap()
}

pub async fn wait_state(session: &Session, state: CallState) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while session.state().await != state {
        assert!(
            tokio::time::Instant::now() < deadline,
            "session stuck in {:?}, wanted {:?}",
            session.state().await,
            state
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

pub async fn wait_sessions(server: &Server, count: usize) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while server.session_count().await != count {
        assert!(tokio::time::Instant::now() < deadline, "session table never reached {}", count);
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

pub async fn eventually(mut check: impl FnMut() -> bool, what: &str) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
