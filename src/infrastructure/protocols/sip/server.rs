//! SIP user agent server
//!
//! Binds the SIP transports, routes requests by method to the handlers in
//! [`super::call_handler`], and keeps the table of live sessions. Outbound
//! calls start from [`Server::make_call`] in [`super::outbound`].

use super::builder::ResponseBuilder;
use super::call_handler;
use super::handler::{CallHandler, NoopCallHandler, SipHandler};
use super::message::{HeaderAccess, SipError, SipMessage, SipMethod};
use super::middleware::ConfigResolver;
use super::sdp::{generate_sdp, negotiated_sdp_config};
use super::session::Session;
use super::transaction::{InboundRequest, SipTimers, TransactionLayer};
use super::transport::{IncomingMessage, TransportSet};
use crate::config::{AppConfig, ListenConfig, SipTimingConfig};
use crate::infrastructure::media::codec::Codec;
use crate::infrastructure::media::rtp::{PortAllocator, PortStore, RtpHandler, RtpHandlerConfig};
use rsip::Header;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const INCOMING_QUEUE_CAPACITY: usize = 1024;

/// Server lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ServerState {
    Created = 0,
    Running = 1,
    Stopped = 2,
}

impl ServerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ServerState::Created,
            1 => ServerState::Running,
            _ => ServerState::Stopped,
        }
    }
}

/// Bracket IPv6 literals for use in URIs and Via sent-by
pub(crate) fn uri_host(ip: &str) -> String {
    match ip.parse::<IpAddr>() {
        Ok(IpAddr::V6(v6)) => format!("[{}]", v6),
        _ => ip.to_string(),
    }
}

/// State shared by the server, its method handlers and outbound call tasks
pub(crate) struct ServerContext {
    pub(crate) listen: ListenConfig,
    pub(crate) timing: SipTimingConfig,
    pub(crate) layer: Arc<TransactionLayer>,
    pub(crate) allocator: Arc<PortAllocator>,
    pub(crate) resolver: Arc<dyn ConfigResolver>,
    handler: RwLock<Arc<dyn CallHandler>>,
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    pub(crate) cancel: CancellationToken,
}

impl ServerContext {
    pub(crate) fn new(
        listen: ListenConfig,
        timing: SipTimingConfig,
        layer: Arc<TransactionLayer>,
        allocator: Arc<PortAllocator>,
        resolver: Arc<dyn ConfigResolver>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            listen,
            timing,
            layer,
            allocator,
            resolver,
            handler: RwLock::new(Arc::new(NoopCallHandler)),
            sessions: RwLock::new(HashMap::new()),
            cancel,
        }
    }

    pub(crate) fn external_ip(&self) -> &str {
        self.listen.external_ip()
    }

    /// `host:port` we put in Via headers
    pub(crate) fn sent_by(&self) -> String {
        format!(
            "{}:{}",
            uri_host(self.external_ip()),
            self.layer.local_addr().port()
        )
    }

    pub(crate) fn contact_uri(&self, user: &str) -> String {
        let transport = self.listen.transport;
        let mut uri = format!("{}:{}@{}", transport.scheme(), user, self.sent_by());
        if transport.is_reliable() {
            uri.push_str(&format!(";transport={}", transport.param()));
        }
        uri
    }

    pub(crate) async fn set_handler(&self, handler: Arc<dyn CallHandler>) {
        *self.handler.write().await = handler;
    }

    pub(crate) async fn handler(&self) -> Arc<dyn CallHandler> {
        self.handler.read().await.clone()
    }

    /// Reply to `inbound` with a response built from `builder`
    pub(crate) async fn respond(
        &self,
        inbound: &InboundRequest,
        builder: ResponseBuilder,
    ) -> Result<(), SipError> {
        let response = builder
            .received_from(inbound.source)
            .build_for_request(&inbound.request);
        self.layer.respond(inbound, &response).await
    }

    pub(crate) async fn insert_session(&self, session: Arc<Session>) {
        let previous = self
            .sessions
            .write()
            .await
            .insert(session.call_id().to_string(), session);
        if previous.is_none() {
            metrics::gauge!("voxsip_sessions_active").increment(1.0);
        }
    }

    pub(crate) async fn get_session(&self, call_id: &str) -> Option<Arc<Session>> {
        self.sessions.read().await.get(call_id).cloned()
    }

    async fn remove_session(&self, call_id: &str) -> Option<Arc<Session>> {
        let removed = self.sessions.write().await.remove(call_id);
        if removed.is_some() {
            metrics::gauge!("voxsip_sessions_active").decrement(1.0);
        }
        removed
    }

    pub(crate) async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Allocate a port and bind the call's RTP handler on the local interface
    ///
    /// The port is released again when the handler cannot be created.
    pub(crate) async fn create_rtp(
        &self,
        session: &Session,
        codec: Codec,
    ) -> Result<Arc<RtpHandler>, SipError> {
        let port = self.allocator.allocate().await?;
        session.set_rtp_port(port).await;

        let config = RtpHandlerConfig::new(self.listen.bind_address(), port).with_codec(codec);
        match RtpHandler::new(config, &session.cancellation()) {
            Ok(handler) => {
                let handler = Arc::new(handler);
                session.set_rtp_handler(handler.clone()).await;
                Ok(handler)
            }
            Err(e) => {
                if let Some(port) = session.take_rtp_port().await {
                    self.allocator.release(port).await;
                }
                Err(SipError::Internal(format!("RTP handler on port {}: {}", port, e)))
            }
        }
    }

    /// SDP answer for `session`: external IP, its RTP port, the negotiated codec only
    pub(crate) async fn session_sdp(&self, session: &Session) -> Option<String> {
        let rtp = session.rtp_handler().await?;
        let (_, port) = rtp.local_addr();
        let config = negotiated_sdp_config(self.external_ip(), port, session.codec().await);
        Some(generate_sdp(&config))
    }

    /// Local cleanup: drop from the table, free the port, end the session
    pub(crate) async fn teardown(&self, session: &Session) {
        self.remove_session(session.call_id()).await;
        self.layer.forget_ack(session.call_id()).await;
        if let Some(port) = session.take_rtp_port().await {
            self.allocator.release(port).await;
        }
        session.end().await;
    }

    /// Send a dialog-correct BYE, then clean up whatever the BYE outcome
    pub(crate) async fn end_call(&self, session: &Session) -> Result<(), SipError> {
        let result = match session.dialog().await {
            Some(dialog) if !dialog.terminated().is_cancelled() => {
                dialog.bye(self.timing.bye_timeout()).await
            }
            _ => Ok(()),
        };
        if let Err(e) = &result {
            warn!(call_id = %session.call_id(), error = %e, "BYE failed, cleaning up locally");
        }
        self.teardown(session).await;
        result.map_err(|e| SipError::op("bye", session.call_id(), e))
    }
}

/// SIP server
pub struct Server {
    ctx: Arc<ServerContext>,
    state: AtomicU8,
    incoming: Mutex<Option<mpsc::Receiver<IncomingMessage>>>,
    handlers: Arc<RwLock<HashMap<SipMethod, Arc<dyn SipHandler>>>>,
}

impl Server {
    /// Validate `config`, initialise the port allocator and bind the transports
    pub async fn new(
        config: AppConfig,
        store: Arc<dyn PortStore>,
        resolver: Arc<dyn ConfigResolver>,
    ) -> Result<Self, SipError> {
        config.validate()?;

        let mut allocator =
            PortAllocator::new(store, config.rtp.port_range_start, config.rtp.port_range_end)?;
        if let Some(id) = &config.rtp.instance_id {
            allocator = allocator.with_owner(id.clone());
        }
        let allocator = Arc::new(allocator);
        allocator.init().await?;

        let ip: IpAddr = config.listen.bind_address().parse().map_err(|_| {
            SipError::InvalidConfig(format!(
                "invalid listen address {}",
                config.listen.bind_address()
            ))
        })?;
        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::channel(INCOMING_QUEUE_CAPACITY);
        let transports =
            TransportSet::bind(SocketAddr::new(ip, config.listen.port), tx, cancel.clone()).await?;
        let layer = Arc::new(TransactionLayer::new(
            transports,
            SipTimers::from(&config.sip),
        ));

        let ctx = Arc::new(ServerContext::new(
            config.listen,
            config.sip,
            layer,
            allocator,
            resolver,
            cancel,
        ));
        let handlers = call_handler::method_handlers(&ctx);

        Ok(Self {
            ctx,
            state: AtomicU8::new(ServerState::Created as u8),
            incoming: Mutex::new(Some(rx)),
            handlers: Arc::new(RwLock::new(handlers)),
        })
    }

    pub fn state(&self) -> ServerState {
        ServerState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.ctx.layer.local_addr()
    }

    /// Lifecycle callbacks for every call
    pub async fn set_handler(&self, handler: Arc<dyn CallHandler>) {
        self.ctx.set_handler(handler).await;
    }

    /// Replace the handler for one method
    pub async fn register_handler(&self, method: SipMethod, handler: Arc<dyn SipHandler>) {
        info!(method = %method, "Registered SIP handler");
        self.handlers.write().await.insert(method, handler);
    }

    pub async fn get_session(&self, call_id: &str) -> Option<Arc<Session>> {
        self.ctx.get_session(call_id).await
    }

    pub async fn session_count(&self) -> usize {
        self.ctx.session_count().await
    }

    pub(crate) fn context(&self) -> &Arc<ServerContext> {
        &self.ctx
    }

    pub async fn start(&self) -> Result<(), SipError> {
        self.state
            .compare_exchange(
                ServerState::Created as u8,
                ServerState::Running as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .map_err(|_| SipError::InvalidConfig("server already started".to_string()))?;

        let mut rx = self
            .incoming
            .lock()
            .await
            .take()
            .ok_or_else(|| SipError::Internal("incoming queue already taken".to_string()))?;

        let ctx = self.ctx.clone();
        let handlers = self.handlers.clone();
        tokio::spawn(async move {
            loop {
                let incoming = tokio::select! {
                    _ = ctx.cancel.cancelled() => break,
                    incoming = rx.recv() => match incoming {
                        Some(incoming) => incoming,
                        None => break,
                    },
                };
                Self::process_message(&ctx, &handlers, incoming).await;
            }
            debug!("SIP dispatch loop stopped");
        });

        info!(
            local = %self.local_addr(),
            external_ip = %self.ctx.external_ip(),
            "SIP server started"
        );
        Ok(())
    }

    async fn process_message(
        ctx: &Arc<ServerContext>,
        handlers: &Arc<RwLock<HashMap<SipMethod, Arc<dyn SipHandler>>>>,
        incoming: IncomingMessage,
    ) {
        match incoming.message {
            SipMessage::Response(response) => {
                let status = response.status_code();
                if !ctx.layer.dispatch_response(response).await {
                    debug!(status, source = %incoming.source, "Response matched no transaction");
                }
            }
            SipMessage::Request(request) => {
                let inbound = InboundRequest {
                    request,
                    source: incoming.source,
                    protocol: incoming.protocol,
                };
                let ctx = ctx.clone();
                let handlers = handlers.clone();
                tokio::spawn(async move {
                    Self::process_request(ctx, handlers, inbound).await;
                });
            }
        }
    }

    async fn process_request(
        ctx: Arc<ServerContext>,
        handlers: Arc<RwLock<HashMap<SipMethod, Arc<dyn SipHandler>>>>,
        inbound: InboundRequest,
    ) {
        let method = inbound.request.method();
        if method != SipMethod::Ack && ctx.layer.check_retransmission(&inbound.request).await {
            return;
        }
        debug!(
            method = %method,
            call_id = ?inbound.request.call_id(),
            source = %inbound.source,
            "Processing SIP request"
        );

        let handler = handlers.read().await.get(&method).cloned();
        let result = match handler {
            Some(handler) => handler.handle_request(inbound.clone()).await,
            None => Self::handle_unknown(&ctx, &inbound).await,
        };

        if let Err(e) = result {
            error!(method = %method, error = %e, "SIP handler failed");
            if method != SipMethod::Ack {
                if let Err(e) = ctx.respond(&inbound, ResponseBuilder::new(500)).await {
                    warn!(error = %e, "Failed to send 500");
                }
            }
        }
    }

    /// Unsupported methods never tear down a live dialog
    async fn handle_unknown(ctx: &ServerContext, inbound: &InboundRequest) -> Result<(), SipError> {
        let in_dialog = match inbound.request.call_id() {
            Some(call_id) => ctx.get_session(&call_id).await.is_some(),
            None => false,
        };
        if in_dialog {
            debug!(method = %inbound.request.method(), "Unsupported in-dialog method accepted");
            return ctx.respond(inbound, ResponseBuilder::ok()).await;
        }
        warn!(method = %inbound.request.method(), "Unsupported SIP method");
        ctx.respond(
            inbound,
            ResponseBuilder::new(405).header(Header::Other(
                "Allow".to_string(),
                call_handler::ALLOWED_METHODS.to_string(),
            )),
        )
        .await
    }

    /// Application hangup: BYE through the dialog, then local cleanup
    pub async fn end_call(&self, session: &Arc<Session>) -> Result<(), SipError> {
        self.ctx.end_call(session).await
    }

    /// Cancel everything, end every session and return all ports
    pub async fn stop(&self) {
        if self
            .state
            .compare_exchange(
                ServerState::Running as u8,
                ServerState::Stopped as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            return;
        }
        info!("Stopping SIP server");
        self.ctx.cancel.cancel();

        let sessions: Vec<Arc<Session>> = {
            let mut table = self.ctx.sessions.write().await;
            table.drain().map(|(_, session)| session).collect()
        };
        metrics::gauge!("voxsip_sessions_active").set(0.0);
        for session in &sessions {
            if let Some(port) = session.take_rtp_port().await {
                self.ctx.allocator.release(port).await;
            }
            session.end().await;
        }
        self.ctx.allocator.release_all().await;

        info!(sessions = sessions.len(), "SIP server stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::media::rtp::MemoryPortStore;
    use crate::infrastructure::protocols::sip::handler::MockCallHandler;
    use crate::infrastructure::protocols::sip::middleware::{resolver_fn, InviteResult};
    use crate::infrastructure::protocols::sip::tenant::SipConfig;
    use std::time::Duration;

    fn app_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.listen.address = "127.0.0.1".to_string();
        config.listen.port = free_port();
        config.rtp.port_range_start = 31000;
        config.rtp.port_range_end = 31100;
        config
    }

    fn free_port() -> u16 {
        std::net::UdpSocket::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    fn resolver() -> Arc<dyn ConfigResolver> {
        Arc::new(resolver_fn(|_| Ok(InviteResult::allow(SipConfig::default()))))
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let server = Server::new(app_config(), Arc::new(MemoryPortStore::new()), resolver())
            .await
            .unwrap();
        assert_eq!(server.state(), ServerState::Created);

        server.start().await.unwrap();
        assert_eq!(server.state(), ServerState::Running);
        assert!(server.start().await.is_err());

        server.stop().await;
        assert_eq!(server.state(), ServerState::Stopped);
        assert_eq!(server.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_rejects_invalid_config() {
        let mut config = app_config();
        config.rtp.port_range_start = 31100;
        config.rtp.port_range_end = 31000;
        let result = Server::new(config, Arc::new(MemoryPortStore::new()), resolver()).await;
        assert!(matches!(result, Err(SipError::InvalidConfig(_))));

        let mut config = app_config();
        config.listen.port = 0;
        let result = Server::new(config, Arc::new(MemoryPortStore::new()), resolver()).await;
        assert!(matches!(result, Err(SipError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_contact_uri_uses_external_ip() {
        let mut config = app_config();
        config.listen.external_ip = "203.0.113.7".to_string();
        let server = Server::new(config, Arc::new(MemoryPortStore::new()), resolver())
            .await
            .unwrap();
        let port = server.local_addr().port();
        assert_eq!(
            server.context().contact_uri("voxsip"),
            format!("sip:voxsip@203.0.113.7:{}", port)
        );
    }

    fn invite(peer: SocketAddr, call_id: &str) -> String {
        let sdp = "v=0\r\no=peer 1 1 IN IP4 127.0.0.1\r\ns=-\r\nc=IN IP4 127.0.0.1\r\nt=0 0\r\nm=audio 40000 RTP/AVP 8\r\n";
        format!(
            "INVITE sip:bot@127.0.0.1 SIP/2.0\r\n\
             Via: SIP/2.0/UDP {peer};branch=z9hG4bK-{call_id}\r\n\
             From: <sip:alice@127.0.0.1>;tag=a1\r\n\
             To: <sip:bot@127.0.0.1>\r\n\
             Call-ID: {call_id}\r\n\
             CSeq: 1 INVITE\r\n\
             Contact: <sip:alice@{peer}>\r\n\
             Content-Type: application/sdp\r\n\
             Content-Length: {len}\r\n\r\n{sdp}",
            len = sdp.len(),
        )
    }

    fn cancel(peer: SocketAddr, call_id: &str) -> String {
        format!(
            "CANCEL sip:bot@127.0.0.1 SIP/2.0\r\n\
             Via: SIP/2.0/UDP {peer};branch=z9hG4bK-{call_id}\r\n\
             From: <sip:alice@127.0.0.1>;tag=a1\r\n\
             To: <sip:bot@127.0.0.1>\r\n\
             Call-ID: {call_id}\r\n\
             CSeq: 1 CANCEL\r\n\
             Content-Length: 0\r\n\r\n"
        )
    }

    async fn next_status(socket: &tokio::net::UdpSocket, wanted: u16) -> u16 {
        let mut buf = vec![0u8; 4096];
        loop {
            let (n, _) = tokio::time::timeout(Duration::from_secs(5), socket.recv_from(&mut buf))
                .await
                .unwrap()
                .unwrap();
            if let Ok(SipMessage::Response(response)) = SipMessage::parse(&buf[..n]) {
                if response.status_code() == wanted {
                    return wanted;
                }
            }
        }
    }

    #[tokio::test]
    async fn test_rejected_invite_never_reaches_handler() {
        let server = Server::new(
            app_config(),
            Arc::new(MemoryPortStore::new()),
            Arc::new(resolver_fn(|_| Ok(InviteResult::reject(403, "unknown assistant")))),
        )
        .await
        .unwrap();
        let mut handler = MockCallHandler::new();
        handler.expect_on_invite().never();
        server.set_handler(Arc::new(handler)).await;
        tokio_test::assert_ok!(server.start().await);

        let peer = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let invite = invite(peer.local_addr().unwrap(), "rejected-1");
        peer.send_to(invite.as_bytes(), server.local_addr()).await.unwrap();

        assert_eq!(next_status(&peer, 403).await, 403);
        assert_eq!(server.session_count().await, 0);
        assert_eq!(server.context().allocator.held_count().await, 0);
        server.stop().await;
    }

    #[tokio::test]
    async fn test_answered_then_cancelled() {
        let server = Server::new(app_config(), Arc::new(MemoryPortStore::new()), resolver())
            .await
            .unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut handler = MockCallHandler::new();
        let invited = tx.clone();
        handler.expect_on_invite().times(1).returning(move |session, from, _| {
            let _ = invited.send(format!("invite {} {}", session.call_id(), from));
            Ok(())
        });
        handler.expect_on_cancel().times(1).returning(move |session| {
            let _ = tx.send(format!("cancel {}", session.call_id()));
        });
        server.set_handler(Arc::new(handler)).await;
        tokio_test::assert_ok!(server.start().await);

        let peer = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = peer.local_addr().unwrap();
        peer.send_to(invite(addr, "cancel-1").as_bytes(), server.local_addr())
            .await
            .unwrap();
        next_status(&peer, 200).await;
        assert_eq!(rx.recv().await.unwrap(), "invite cancel-1 sip:alice@127.0.0.1");

        let session = server.get_session("cancel-1").await.unwrap();
        assert_eq!(session.codec().await.payload_type, 8);
        assert_eq!(server.context().allocator.held_count().await, 1);

        peer.send_to(cancel(addr, "cancel-1").as_bytes(), server.local_addr())
            .await
            .unwrap();
        assert_eq!(rx.recv().await.unwrap(), "cancel cancel-1");
        assert!(session.is_ended());
        assert_eq!(server.session_count().await, 0);
        assert_eq!(server.context().allocator.held_count().await, 0);
        server.stop().await;
    }

    #[test]
    fn test_uri_host_brackets_ipv6() {
        assert_eq!(uri_host("::1"), "[::1]");
        assert_eq!(uri_host("10.0.0.1"), "10.0.0.1");
        assert_eq!(uri_host("pbx.example.com"), "pbx.example.com");
    }
}
