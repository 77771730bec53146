//! SIP transport layer - UDP and TCP

use super::message::{SipError, SipMessage};
use bytes::{Buf, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Largest header block accepted on a stream before the connection is dropped
const MAX_STREAM_HEADER: usize = 64 * 1024;
const MAX_STREAM_BODY: usize = 64 * 1024;

/// Transport protocol type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportProtocol {
    #[default]
    Udp,
    Tcp,
    Tls,
}

impl TransportProtocol {
    /// Via transport token
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportProtocol::Udp => "UDP",
            TransportProtocol::Tcp => "TCP",
            TransportProtocol::Tls => "TLS",
        }
    }

    /// URI `transport=` value
    pub fn param(&self) -> &'static str {
        match self {
            TransportProtocol::Udp => "udp",
            TransportProtocol::Tcp => "tcp",
            TransportProtocol::Tls => "tls",
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            TransportProtocol::Udp | TransportProtocol::Tcp => 5060,
            TransportProtocol::Tls => 5061,
        }
    }

    pub fn scheme(&self) -> &'static str {
        match self {
            TransportProtocol::Tls => "sips",
            _ => "sip",
        }
    }

    pub fn is_reliable(&self) -> bool {
        !matches!(self, TransportProtocol::Udp)
    }
}

impl fmt::Display for TransportProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.param())
    }
}

impl FromStr for TransportProtocol {
    type Err = SipError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "udp" => Ok(TransportProtocol::Udp),
            "tcp" => Ok(TransportProtocol::Tcp),
            "tls" => Ok(TransportProtocol::Tls),
            other => Err(SipError::InvalidConfig(format!(
                "unsupported transport {}",
                other
            ))),
        }
    }
}

/// Incoming SIP message with source information
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub message: SipMessage,
    pub source: SocketAddr,
    pub protocol: TransportProtocol,
}

/// Outgoing SIP message with destination information
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    pub data: Bytes,
    pub destination: SocketAddr,
    pub protocol: TransportProtocol,
}

/// Transport layer trait
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    fn protocol(&self) -> TransportProtocol;

    fn local_addr(&self) -> SocketAddr;

    /// Send a message
    async fn send(&self, message: OutgoingMessage) -> Result<(), SipError>;
}

/// UDP transport implementation
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
}

impl UdpTransport {
    /// Bind and start delivering parsed messages to `tx` until `cancel` fires
    pub async fn bind(
        bind_addr: SocketAddr,
        tx: mpsc::Sender<IncomingMessage>,
        cancel: CancellationToken,
    ) -> Result<Self, SipError> {
        let socket = UdpSocket::bind(bind_addr)
            .await
            .map_err(|e| SipError::Transport(format!("Failed to bind UDP socket: {}", e)))?;
        let local_addr = socket.local_addr()?;
        info!(addr = %local_addr, "UDP transport listening");

        let socket = Arc::new(socket);
        tokio::spawn(Self::receive_loop(socket.clone(), tx, cancel));

        Ok(Self { socket, local_addr })
    }

    async fn receive_loop(
        socket: Arc<UdpSocket>,
        tx: mpsc::Sender<IncomingMessage>,
        cancel: CancellationToken,
    ) {
        let mut buf = vec![0u8; 65535];

        loop {
            let received = tokio::select! {
                _ = cancel.cancelled() => break,
                r = socket.recv_from(&mut buf) => r,
            };

            match received {
                Ok((size, source)) => {
                    let data = &buf[..size];
                    // CRLF keep-alives
                    if data.iter().all(|b| b.is_ascii_whitespace()) {
                        continue;
                    }
                    debug!("Received {} bytes from {} via UDP", size, source);

                    match SipMessage::parse(data) {
                        Ok(message) => {
                            let incoming = IncomingMessage {
                                message,
                                source,
                                protocol: TransportProtocol::Udp,
                            };
                            if tx.send(incoming).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            warn!("Failed to parse SIP message from {}: {}", source, e);
                        }
                    }
                }
                // ICMP port unreachable surfaces here on some platforms
                Err(e) => {
                    debug!("UDP receive error: {}", e);
                }
            }
        }
        debug!("UDP receive loop stopped");
    }
}

#[async_trait::async_trait]
impl Transport for UdpTransport {
    fn protocol(&self) -> TransportProtocol {
        TransportProtocol::Udp
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    async fn send(&self, message: OutgoingMessage) -> Result<(), SipError> {
        debug!(
            "Sending {} bytes to {} via UDP",
            message.data.len(),
            message.destination
        );

        self.socket
            .send_to(&message.data, message.destination)
            .await
            .map_err(|e| SipError::Transport(format!("Failed to send UDP packet: {}", e)))?;
        Ok(())
    }
}

/// Split one complete SIP message off the front of a stream buffer
///
/// Leading CRLF keep-alives are discarded. Returns `Ok(None)` until the
/// header block and the `Content-Length` body have fully arrived.
pub fn frame_message(buf: &mut BytesMut) -> Result<Option<Bytes>, SipError> {
    let leading = buf.iter().take_while(|b| **b == b'\r' || **b == b'\n').count();
    buf.advance(leading);

    let header_end = match buf.windows(4).position(|w| w == b"\r\n\r\n") {
        Some(pos) => pos + 4,
        None if buf.len() > MAX_STREAM_HEADER => {
            return Err(SipError::Parse("SIP header block too large".to_string()));
        }
        None => return Ok(None),
    };

    let headers = String::from_utf8_lossy(&buf[..header_end]);
    let content_length = headers
        .lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| {
            let name = name.trim();
            name.eq_ignore_ascii_case("content-length") || name.eq_ignore_ascii_case("l")
        })
        .map(|(_, value)| {
            value
                .trim()
                .parse::<usize>()
                .map_err(|_| SipError::Parse(format!("bad Content-Length {}", value.trim())))
        })
        .transpose()?
        .unwrap_or(0);
    if content_length > MAX_STREAM_BODY {
        return Err(SipError::Parse(format!("SIP body too large: {}", content_length)));
    }

    let total = header_end + content_length;
    if buf.len() < total {
        return Ok(None);
    }
    Ok(Some(buf.split_to(total).freeze()))
}

type ConnectionMap = Arc<Mutex<HashMap<SocketAddr, mpsc::Sender<Bytes>>>>;

/// TCP transport implementation
///
/// Connections are kept per remote address; responses to a request received
/// over TCP reuse the connection it arrived on.
pub struct TcpTransport {
    local_addr: SocketAddr,
    connections: ConnectionMap,
    tx: mpsc::Sender<IncomingMessage>,
    cancel: CancellationToken,
}

impl TcpTransport {
    pub async fn bind(
        bind_addr: SocketAddr,
        tx: mpsc::Sender<IncomingMessage>,
        cancel: CancellationToken,
    ) -> Result<Self, SipError> {
        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|e| SipError::Transport(format!("Failed to bind TCP socket: {}", e)))?;
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "TCP transport listening");

        let transport = Self {
            local_addr,
            connections: Arc::new(Mutex::new(HashMap::new())),
            tx,
            cancel,
        };
        tokio::spawn(Self::accept_loop(
            listener,
            transport.connections.clone(),
            transport.tx.clone(),
            transport.cancel.clone(),
        ));
        Ok(transport)
    }

    async fn accept_loop(
        listener: TcpListener,
        connections: ConnectionMap,
        tx: mpsc::Sender<IncomingMessage>,
        cancel: CancellationToken,
    ) {
        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => break,
                r = listener.accept() => r,
            };
            match accepted {
                Ok((stream, source)) => {
                    info!("Accepted TCP connection from {}", source);
                    Self::register(stream, source, &connections, tx.clone(), cancel.clone()).await;
                }
                Err(e) => {
                    error!("Failed to accept TCP connection: {}", e);
                }
            }
        }
    }

    /// Start reader and writer tasks for a connection
    async fn register(
        stream: TcpStream,
        peer: SocketAddr,
        connections: &ConnectionMap,
        tx: mpsc::Sender<IncomingMessage>,
        cancel: CancellationToken,
    ) -> mpsc::Sender<Bytes> {
        let (mut reader, mut writer) = stream.into_split();
        let (out_tx, mut out_rx) = mpsc::channel::<Bytes>(100);
        connections.lock().await.insert(peer, out_tx.clone());

        let writer_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                let data = tokio::select! {
                    _ = writer_cancel.cancelled() => break,
                    d = out_rx.recv() => match d {
                        Some(d) => d,
                        None => break,
                    },
                };
                if let Err(e) = writer.write_all(&data).await {
                    warn!("Failed to write to TCP connection {}: {}", peer, e);
                    break;
                }
            }
        });

        let connections = connections.clone();
        tokio::spawn(async move {
            let mut buf = BytesMut::with_capacity(8192);
            'read: loop {
                let read = tokio::select! {
                    _ = cancel.cancelled() => break,
                    r = reader.read_buf(&mut buf) => r,
                };
                match read {
                    Ok(0) => {
                        debug!("TCP connection closed by {}", peer);
                        break;
                    }
                    Ok(_) => loop {
                        match frame_message(&mut buf) {
                            Ok(Some(frame)) => match SipMessage::parse(&frame) {
                                Ok(message) => {
                                    let incoming = IncomingMessage {
                                        message,
                                        source: peer,
                                        protocol: TransportProtocol::Tcp,
                                    };
                                    if tx.send(incoming).await.is_err() {
                                        break 'read;
                                    }
                                }
                                Err(e) => warn!("Failed to parse SIP message from {}: {}", peer, e),
                            },
                            Ok(None) => break,
                            Err(e) => {
                                warn!("Dropping TCP connection {}: {}", peer, e);
                                break 'read;
                            }
                        }
                    },
                    Err(e) => {
                        warn!("Failed to read from TCP connection {}: {}", peer, e);
                        break;
                    }
                }
            }
            connections.lock().await.remove(&peer);
        });

        out_tx
    }
}

#[async_trait::async_trait]
impl Transport for TcpTransport {
    fn protocol(&self) -> TransportProtocol {
        TransportProtocol::Tcp
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    async fn send(&self, message: OutgoingMessage) -> Result<(), SipError> {
        debug!(
            "Sending {} bytes to {} via TCP",
            message.data.len(),
            message.destination
        );

        let existing = self
            .connections
            .lock()
            .await
            .get(&message.destination)
            .cloned();
        let sender = match existing {
            Some(sender) if !sender.is_closed() => sender,
            _ => {
                let stream = TcpStream::connect(message.destination).await.map_err(|e| {
                    SipError::ConnectionFailed(format!("{}: {}", message.destination, e))
                })?;
                Self::register(
                    stream,
                    message.destination,
                    &self.connections,
                    self.tx.clone(),
                    self.cancel.clone(),
                )
                .await
            }
        };

        sender
            .send(message.data)
            .await
            .map_err(|_| SipError::Transport(format!("TCP connection to {} closed", message.destination)))
    }
}

/// The transports a server listens on
pub struct TransportSet {
    udp: Arc<dyn Transport>,
    tcp: Option<Arc<dyn Transport>>,
}

impl TransportSet {
    /// UDP must bind; TCP on the same address is best effort
    pub async fn bind(
        bind_addr: SocketAddr,
        tx: mpsc::Sender<IncomingMessage>,
        cancel: CancellationToken,
    ) -> Result<Self, SipError> {
        let udp = UdpTransport::bind(bind_addr, tx.clone(), cancel.clone()).await?;
        let tcp_addr = udp.local_addr();
        let tcp = match TcpTransport::bind(tcp_addr, tx, cancel).await {
            Ok(tcp) => Some(Arc::new(tcp) as Arc<dyn Transport>),
            Err(e) => {
                warn!(addr = %tcp_addr, error = %e, "TCP transport unavailable");
                None
            }
        };
        Ok(Self {
            udp: Arc::new(udp),
            tcp,
        })
    }

    pub fn from_transports(udp: Arc<dyn Transport>, tcp: Option<Arc<dyn Transport>>) -> Self {
        Self { udp, tcp }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.udp.local_addr()
    }

    pub async fn send(
        &self,
        protocol: TransportProtocol,
        destination: SocketAddr,
        data: Bytes,
    ) -> Result<(), SipError> {
        let transport = match protocol {
            TransportProtocol::Udp => &self.udp,
            TransportProtocol::Tcp => self
                .tcp
                .as_ref()
                .ok_or_else(|| SipError::Transport("TCP transport not available".to_string()))?,
            TransportProtocol::Tls => {
                return Err(SipError::Transport("TLS transport not available".to_string()));
            }
        };
        transport
            .send(OutgoingMessage {
                data,
                destination,
                protocol,
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const OPTIONS: &[u8] = b"OPTIONS sip:bot@127.0.0.1 SIP/2.0\r\n\
        Via: SIP/2.0/TCP 127.0.0.1:5999;branch=z9hG4bKtcp1\r\n\
        From: <sip:alice@example.com>;tag=a\r\n\
        To: <sip:bot@example.com>\r\n\
        Call-ID: tcp-1\r\n\
        CSeq: 1 OPTIONS\r\n\
        Content-Length: 4\r\n\r\n\
        abcd";

    #[test]
    fn test_frame_waits_for_body() {
        let mut buf = BytesMut::from(&b"\r\n\r\n"[..]);
        buf.extend_from_slice(&OPTIONS[..OPTIONS.len() - 2]);
        assert_eq!(frame_message(&mut buf).unwrap(), None);

        buf.extend_from_slice(&OPTIONS[OPTIONS.len() - 2..]);
        buf.extend_from_slice(b"INVITE");
        let frame = frame_message(&mut buf).unwrap().unwrap();
        assert_eq!(&frame[..], OPTIONS);
        assert_eq!(&buf[..], b"INVITE");
    }

    #[test]
    fn test_frame_rejects_bad_length() {
        let mut buf = BytesMut::from(&b"BYE sip:x SIP/2.0\r\nContent-Length: nope\r\n\r\n"[..]);
        assert!(frame_message(&mut buf).is_err());
    }

    #[test]
    fn test_frame_rejects_oversized_body() {
        let mut buf = BytesMut::from(
            &b"BYE sip:x SIP/2.0\r\nContent-Length: 18446744073709551615\r\n\r\n"[..],
        );
        assert!(matches!(frame_message(&mut buf), Err(SipError::Parse(_))));

        let mut buf = BytesMut::from(&b"BYE sip:x SIP/2.0\r\nl: 70000\r\n\r\n"[..]);
        assert!(frame_message(&mut buf).is_err());
    }

    #[test]
    fn test_transport_protocol_names() {
        assert_eq!("TCP".parse::<TransportProtocol>().unwrap(), TransportProtocol::Tcp);
        assert!("ws".parse::<TransportProtocol>().is_err());
        assert_eq!(TransportProtocol::Tls.scheme(), "sips");
        assert_eq!(TransportProtocol::Udp.as_str(), "UDP");
        assert_eq!(TransportProtocol::default(), TransportProtocol::Udp);
    }

    #[tokio::test]
    async fn test_udp_transport_delivers_messages() {
        let (tx, mut rx) = mpsc::channel(10);
        let cancel = CancellationToken::new();
        let transport = UdpTransport::bind("127.0.0.1:0".parse().unwrap(), tx, cancel.clone())
            .await
            .unwrap();

        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        peer.send_to(b"\r\n\r\n", transport.local_addr()).await.unwrap();
        // garbage is dropped without stopping the receive loop
        peer.send_to(b"\xff", transport.local_addr()).await.unwrap();
        peer.send_to(b"\xc3\x28 sip:x SIP/2.0\r\n\r\n", transport.local_addr()).await.unwrap();
        peer.send_to(OPTIONS, transport.local_addr()).await.unwrap();

        let incoming = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(incoming.message.is_request());
        assert_eq!(incoming.source, peer.local_addr().unwrap());
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_tcp_transport_reuses_inbound_connection() {
        let (tx, mut rx) = mpsc::channel(10);
        let cancel = CancellationToken::new();
        let transport = TcpTransport::bind("127.0.0.1:0".parse().unwrap(), tx, cancel.clone())
            .await
            .unwrap();

        let mut client = TcpStream::connect(transport.local_addr()).await.unwrap();
        client.write_all(OPTIONS).await.unwrap();

        let incoming = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(incoming.protocol, TransportProtocol::Tcp);

        transport
            .send(OutgoingMessage {
                data: Bytes::from_static(b"hello"),
                destination: incoming.source,
                protocol: TransportProtocol::Tcp,
            })
            .await
            .unwrap();

        let mut reply = [0u8; 5];
        tokio::time::timeout(Duration::from_secs(2), client.read_exact(&mut reply))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&reply, b"hello");
        cancel.cancel();
    }
}
