//! SIP dialogs (RFC 3261 section 12)
//!
//! [`ClientDialog`] is the UAC side of an outbound call and [`ServerDialog`]
//! the UAS side of an inbound one. Sessions hold either through the
//! [`DialogHandle`] trait, so BYE and in-dialog validation do not branch on
//! call direction.

use super::auth::{authorization_value, DigestChallenge, DigestCredentials};
use super::builder::{generate_branch, RequestBuilder, ResponseBuilder};
use super::message::{uri_host_port, HeaderAccess, NameAddr, SipError, SipMethod, SipRequest, SipResponse};
use super::transaction::{ClientTransaction, InboundRequest, TransactionLayer};
use super::transport::TransportProtocol;
use crate::domain::call::CallDirection;
use async_trait::async_trait;
use rsip::Header;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[async_trait]
pub trait DialogHandle: Send + Sync {
    fn call_id(&self) -> &str;

    fn direction(&self) -> CallDirection;

    /// Check an in-dialog request from the peer before it is applied
    async fn validate_request(&self, request: &SipRequest) -> Result<(), SipError>;

    /// Send BYE and wait up to `timeout` for the final response
    async fn bye(&self, timeout: Duration) -> Result<(), SipError>;

    /// ACK for our 2xx arrived (UAS only)
    async fn read_ack(&self, _request: &SipRequest) {}

    /// Cancelled once the dialog is over from either side
    fn terminated(&self) -> CancellationToken;

    /// The peer ended the dialog
    fn terminate(&self) {
        self.terminated().cancel();
    }
}

/// Resolve the host and port of a SIP URI
pub async fn resolve_uri(uri: &str, protocol: TransportProtocol) -> Result<SocketAddr, SipError> {
    let (host, port) = uri_host_port(uri)
        .ok_or_else(|| SipError::Parse(format!("invalid SIP URI {}", uri)))?;
    let port = port.unwrap_or_else(|| protocol.default_port());
    if let Ok(ip) = host.parse::<std::net::IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }
    let resolved = tokio::net::lookup_host((host.as_str(), port))
        .await
        .map_err(|e| SipError::ConnectionFailed(format!("{}: {}", host, e)))?
        .next();
    resolved.ok_or_else(|| SipError::ConnectionFailed(format!("{} did not resolve", host)))
}

/// Where an in-dialog request goes: the first loose route, else the target
async fn next_hop(
    target: &str,
    routes: &[String],
    protocol: TransportProtocol,
) -> Result<SocketAddr, SipError> {
    match routes.first() {
        Some(route) => {
            let uri = NameAddr::parse(route)
                .map(|r| r.uri)
                .unwrap_or_else(|| route.clone());
            resolve_uri(&uri, protocol).await
        }
        None => resolve_uri(target, protocol).await,
    }
}

/// Static parameters of an outbound dialog
#[derive(Debug, Clone)]
pub struct ClientDialogConfig {
    pub call_id: String,
    pub request_uri: String,
    pub local: NameAddr,
    pub remote: NameAddr,
    pub contact: String,
    /// Via sent-by, normally the advertised address
    pub sent_by: String,
    pub destination: SocketAddr,
    pub protocol: TransportProtocol,
    pub credentials: Option<DigestCredentials>,
    pub invite_timeout: Duration,
}

struct ClientState {
    cseq: u32,
    invite: Option<SipRequest>,
    remote_tag: Option<String>,
    remote_target: Option<String>,
    route_set: Vec<String>,
    last_remote_cseq: Option<u32>,
    invite_cseq: u32,
}

/// UAC dialog for an outbound call
pub struct ClientDialog {
    layer: Arc<TransactionLayer>,
    config: ClientDialogConfig,
    state: Mutex<ClientState>,
    terminated: CancellationToken,
}

impl ClientDialog {
    pub fn new(layer: Arc<TransactionLayer>, config: ClientDialogConfig) -> Self {
        Self {
            layer,
            config,
            state: Mutex::new(ClientState {
                cseq: 1,
                invite: None,
                remote_tag: None,
                remote_target: None,
                route_set: Vec::new(),
                last_remote_cseq: None,
                invite_cseq: 1,
            }),
            terminated: CancellationToken::new(),
        }
    }

    pub fn local_uri(&self) -> &str {
        &self.config.local.uri
    }

    pub fn remote_uri(&self) -> &str {
        &self.config.remote.uri
    }

    pub fn local_tag(&self) -> Option<&str> {
        self.config.local.tag()
    }

    pub async fn remote_tag(&self) -> Option<String> {
        self.state.lock().await.remote_tag.clone()
    }

    fn remote_with_tag(&self, tag: Option<&str>) -> NameAddr {
        match tag {
            Some(tag) => self.config.remote.clone().with_tag(tag),
            None => self.config.remote.clone(),
        }
    }

    fn build_invite(&self, seq: u32, sdp: &str, auth: Option<Header>) -> Result<SipRequest, SipError> {
        let mut builder = RequestBuilder::new(SipMethod::Invite, self.config.request_uri.clone())
            .via(self.config.protocol.as_str(), &self.config.sent_by, &generate_branch())
            .from(&self.config.local)
            .to(&self.config.remote)
            .call_id(&self.config.call_id)
            .cseq(seq)
            .contact(&self.config.contact);
        if let Some(auth) = auth {
            builder = builder.header(auth);
        }
        builder.sdp(sdp).build()
    }

    /// Send the initial INVITE carrying `sdp`
    pub async fn invite(&self, sdp: &str) -> Result<ClientTransaction, SipError> {
        let invite = self.build_invite(1, sdp, None)?;
        let txn = self
            .layer
            .send_request(&invite, self.config.destination, self.config.protocol)
            .await?;
        info!(call_id = %self.config.call_id, uri = %self.config.request_uri, "INVITE sent");

        let mut state = self.state.lock().await;
        state.invite = Some(invite);
        state.invite_cseq = 1;
        Ok(txn)
    }

    /// Wait for the final answer to the INVITE
    ///
    /// Provisional responses are passed to `on_provisional`. One digest
    /// challenge is answered automatically; a second fails the call.
    pub async fn wait_answer<F, Fut>(
        &self,
        mut txn: ClientTransaction,
        mut on_provisional: F,
    ) -> Result<SipResponse, SipError>
    where
        F: FnMut(&SipResponse) -> Fut + Send,
        Fut: Future<Output = ()> + Send,
    {
        let deadline = Instant::now() + self.config.invite_timeout;
        let mut challenged = false;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let response = match txn.recv(remaining).await {
                Ok(response) => response,
                Err(SipError::Timeout(_)) => {
                    txn.close().await;
                    self.cancel_invite().await;
                    return Err(SipError::Timeout(format!(
                        "no final response to INVITE for {}",
                        self.config.call_id
                    )));
                }
                Err(e) => {
                    txn.close().await;
                    return Err(e);
                }
            };

            let code = response.status_code();
            if code < 200 {
                on_provisional(&response).await;
                continue;
            }

            txn.close().await;
            if response.is_success() {
                self.confirm(&response).await;
                return Ok(response);
            }

            self.ack_failure(&response).await;
            match code {
                401 | 407 if !challenged => {
                    challenged = true;
                    txn = self.answer_challenge(&response).await?;
                }
                401 | 407 => return Err(SipError::AuthenticationFailed { code }),
                _ => {
                    return Err(SipError::Rejected {
                        code,
                        reason: response.reason(),
                    })
                }
            }
        }
    }

    async fn answer_challenge(&self, response: &SipResponse) -> Result<ClientTransaction, SipError> {
        let code = response.status_code();
        let credentials = self
            .config
            .credentials
            .as_ref()
            .ok_or(SipError::AuthenticationFailed { code })?;
        let header_name = if code == 407 {
            "proxy-authenticate"
        } else {
            "www-authenticate"
        };
        let challenge = response
            .header(header_name)
            .and_then(|v| DigestChallenge::parse(&v).ok())
            .ok_or(SipError::AuthenticationFailed { code })?;

        let value = authorization_value(
            &challenge,
            credentials,
            SipMethod::Invite.as_str(),
            &self.config.request_uri,
        );
        let name = if code == 407 {
            "Proxy-Authorization"
        } else {
            "Authorization"
        };
        let header = Header::Other(name.to_string(), value);

        let (seq, sdp) = {
            let state = self.state.lock().await;
            let sdp = state
                .invite
                .as_ref()
                .map(|i| String::from_utf8_lossy(i.body()).into_owned())
                .unwrap_or_default();
            (state.invite_cseq + 1, sdp)
        };
        let invite = self.build_invite(seq, &sdp, Some(header))?;
        let txn = self
            .layer
            .send_request(&invite, self.config.destination, self.config.protocol)
            .await?;
        debug!(call_id = %self.config.call_id, code, "INVITE re-sent with credentials");

        let mut state = self.state.lock().await;
        state.invite = Some(invite);
        state.invite_cseq = seq;
        state.cseq = seq;
        Ok(txn)
    }

    /// ACK for a non-2xx final response: same branch as the INVITE
    async fn ack_failure(&self, response: &SipResponse) {
        let Some(invite) = self.state.lock().await.invite.clone() else {
            return;
        };
        let Some(branch) = invite.branch() else {
            return;
        };
        let Some((seq, _)) = invite.cseq() else {
            return;
        };
        let to_tag = response.to_tag();

        let ack = RequestBuilder::new(SipMethod::Ack, self.config.request_uri.clone())
            .via(self.config.protocol.as_str(), &self.config.sent_by, &branch)
            .from(&self.config.local)
            .to(&self.remote_with_tag(to_tag.as_deref()))
            .call_id(&self.config.call_id)
            .cseq(seq)
            .build();
        match ack {
            Ok(ack) => {
                if let Err(e) = self
                    .layer
                    .send_raw(self.config.protocol, self.config.destination, ack.to_bytes())
                    .await
                {
                    warn!(call_id = %self.config.call_id, error = %e, "Failed to ACK final response");
                }
            }
            Err(e) => warn!(call_id = %self.config.call_id, error = %e, "Failed to build ACK"),
        }
    }

    /// Best-effort CANCEL of an unanswered INVITE
    async fn cancel_invite(&self) {
        let Some(invite) = self.state.lock().await.invite.clone() else {
            return;
        };
        let (Some(branch), Some((seq, _))) = (invite.branch(), invite.cseq()) else {
            return;
        };

        let cancel = RequestBuilder::new(SipMethod::Cancel, self.config.request_uri.clone())
            .via(self.config.protocol.as_str(), &self.config.sent_by, &branch)
            .from(&self.config.local)
            .to(&self.config.remote)
            .call_id(&self.config.call_id)
            .cseq(seq)
            .build();
        if let Ok(cancel) = cancel {
            if let Err(e) = self
                .layer
                .send_raw(self.config.protocol, self.config.destination, cancel.to_bytes())
                .await
            {
                debug!(call_id = %self.config.call_id, error = %e, "CANCEL not sent");
            }
        }
    }

    /// Record the dialog state carried by the 2xx
    async fn confirm(&self, response: &SipResponse) {
        let mut state = self.state.lock().await;
        state.remote_tag = response.to_tag();
        state.remote_target = response.contact_uri();
        // UAC reverses the Record-Route set
        state.route_set = response.record_routes().into_iter().rev().collect();
        debug!(
            call_id = %self.config.call_id,
            remote_tag = ?state.remote_tag,
            target = ?state.remote_target,
            routes = state.route_set.len(),
            "Dialog confirmed"
        );
    }

    fn target_or_default(&self, state: &ClientState) -> String {
        state
            .remote_target
            .clone()
            .unwrap_or_else(|| self.config.request_uri.clone())
    }

    async fn in_dialog_request(
        &self,
        method: SipMethod,
        seq: u32,
    ) -> Result<(SipRequest, SocketAddr), SipError> {
        let (target, routes, remote_tag) = {
            let state = self.state.lock().await;
            (
                self.target_or_default(&state),
                state.route_set.clone(),
                state.remote_tag.clone(),
            )
        };

        let mut builder = RequestBuilder::new(method, target.clone())
            .via(self.config.protocol.as_str(), &self.config.sent_by, &generate_branch())
            .from(&self.config.local)
            .to(&self.remote_with_tag(remote_tag.as_deref()))
            .call_id(&self.config.call_id)
            .cseq(seq);
        for route in &routes {
            builder = builder.route(route);
        }
        let request = builder.build()?;

        let destination = match next_hop(&target, &routes, self.config.protocol).await {
            Ok(addr) => addr,
            Err(e) => {
                debug!(call_id = %self.config.call_id, error = %e, "Using INVITE destination for in-dialog request");
                self.config.destination
            }
        };
        Ok((request, destination))
    }

    /// ACK the 2xx and keep it for replay
    pub async fn ack(&self) -> Result<(), SipError> {
        let seq = self.state.lock().await.invite_cseq;
        let (ack, destination) = self.in_dialog_request(SipMethod::Ack, seq).await?;
        let data = ack.to_bytes();

        self.layer
            .send_raw(self.config.protocol, destination, data.clone())
            .await?;
        self.layer
            .register_ack(&self.config.call_id, data, destination, self.config.protocol)
            .await;
        info!(call_id = %self.config.call_id, dest = %destination, "ACK sent");
        Ok(())
    }
}

#[async_trait]
impl DialogHandle for ClientDialog {
    fn call_id(&self) -> &str {
        &self.config.call_id
    }

    fn direction(&self) -> CallDirection {
        CallDirection::Outbound
    }

    async fn validate_request(&self, request: &SipRequest) -> Result<(), SipError> {
        let (seq, _) = request
            .cseq()
            .ok_or_else(|| SipError::DialogSequence("missing CSeq".to_string()))?;

        let mut state = self.state.lock().await;
        if let (Some(ours), Some(theirs)) = (self.config.local.tag(), request.to_tag()) {
            if ours != theirs {
                return Err(SipError::DialogSequence("To tag does not match".to_string()));
            }
        }
        if let (Some(expected), Some(actual)) = (&state.remote_tag, request.from_tag()) {
            if *expected != actual {
                return Err(SipError::DialogSequence("From tag does not match".to_string()));
            }
        }
        if let Some(last) = state.last_remote_cseq {
            if seq <= last {
                return Err(SipError::DialogSequence(format!(
                    "CSeq {} not greater than {}",
                    seq, last
                )));
            }
        }
        state.last_remote_cseq = Some(seq);
        Ok(())
    }

    async fn bye(&self, timeout: Duration) -> Result<(), SipError> {
        let seq = {
            let mut state = self.state.lock().await;
            state.cseq += 1;
            state.cseq
        };
        let (bye, destination) = self.in_dialog_request(SipMethod::Bye, seq).await?;
        self.layer.forget_ack(&self.config.call_id).await;
        self.terminated.cancel();

        let mut txn = self
            .layer
            .send_request(&bye, destination, self.config.protocol)
            .await?;
        let result = txn.final_response(timeout).await;
        txn.close().await;

        let response = result?;
        info!(call_id = %self.config.call_id, status = response.status_code(), "BYE answered");
        if response.is_success() {
            Ok(())
        } else {
            Err(SipError::Rejected {
                code: response.status_code(),
                reason: response.reason(),
            })
        }
    }

    fn terminated(&self) -> CancellationToken {
        self.terminated.clone()
    }
}

struct ServerState {
    local_cseq: u32,
    last_remote_cseq: u32,
}

/// UAS dialog for an inbound call
pub struct ServerDialog {
    layer: Arc<TransactionLayer>,
    invite: InboundRequest,
    call_id: String,
    local_tag: String,
    contact: String,
    state: Mutex<ServerState>,
    acked: CancellationToken,
    terminated: CancellationToken,
}

impl ServerDialog {
    pub fn new(
        layer: Arc<TransactionLayer>,
        invite: InboundRequest,
        local_tag: impl Into<String>,
        contact: impl Into<String>,
    ) -> Self {
        let call_id = invite.request.call_id().unwrap_or_default();
        let remote_cseq = invite.request.cseq().map(|(seq, _)| seq).unwrap_or(0);
        Self {
            layer,
            invite,
            call_id,
            local_tag: local_tag.into(),
            contact: contact.into(),
            state: Mutex::new(ServerState {
                local_cseq: 1,
                last_remote_cseq: remote_cseq,
            }),
            acked: CancellationToken::new(),
            terminated: CancellationToken::new(),
        }
    }

    pub fn local_tag(&self) -> &str {
        &self.local_tag
    }

    pub fn invite(&self) -> &InboundRequest {
        &self.invite
    }

    /// Answer the INVITE; 2xx answers over UDP repeat until ACKed
    pub async fn respond(&self, code: u16, sdp: Option<&str>) -> Result<(), SipError> {
        let mut builder = ResponseBuilder::new(code)
            .to_tag(&self.local_tag)
            .received_from(self.invite.source);
        if (101..300).contains(&code) {
            builder = builder.contact(&self.contact);
        }
        if let Some(sdp) = sdp {
            builder = builder.sdp(sdp);
        }
        let response = builder.build_for_request(&self.invite.request);
        self.layer.respond(&self.invite, &response).await?;

        if (200..300).contains(&code) && !self.invite.protocol.is_reliable() {
            tokio::spawn(Self::retransmit_2xx(
                self.layer.clone(),
                self.invite.clone(),
                response,
                self.acked.clone(),
                self.terminated.clone(),
            ));
        }
        Ok(())
    }

    async fn retransmit_2xx(
        layer: Arc<TransactionLayer>,
        invite: InboundRequest,
        response: SipResponse,
        acked: CancellationToken,
        terminated: CancellationToken,
    ) {
        let timers = layer.timers();
        let deadline = Instant::now() + timers.transaction_timeout();
        let mut interval = timers.t1;
        loop {
            tokio::select! {
                _ = acked.cancelled() => return,
                _ = terminated.cancelled() => return,
                _ = tokio::time::sleep(interval) => {}
            }
            if Instant::now() >= deadline {
                warn!(call_id = ?invite.request.call_id(), "No ACK for 2xx");
                return;
            }
            if let Err(e) = layer.respond(&invite, &response).await {
                debug!(error = %e, "2xx retransmission failed");
            }
            interval = timers.backoff(interval, true);
        }
    }

    /// `true` once the ACK arrived, `false` on timeout
    pub async fn wait_ack(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.acked.cancelled())
            .await
            .is_ok()
    }

    pub fn is_acked(&self) -> bool {
        self.acked.is_cancelled()
    }
}

#[async_trait]
impl DialogHandle for ServerDialog {
    fn call_id(&self) -> &str {
        &self.call_id
    }

    fn direction(&self) -> CallDirection {
        CallDirection::Inbound
    }

    /// Lenient: peers that reuse CSeq values are tolerated
    async fn validate_request(&self, request: &SipRequest) -> Result<(), SipError> {
        let (seq, _) = request
            .cseq()
            .ok_or_else(|| SipError::DialogSequence("missing CSeq".to_string()))?;
        let mut state = self.state.lock().await;
        if seq < state.last_remote_cseq {
            debug!(call_id = %self.call_id, seq, last = state.last_remote_cseq, "Out-of-order in-dialog request accepted");
        }
        state.last_remote_cseq = state.last_remote_cseq.max(seq);
        Ok(())
    }

    async fn read_ack(&self, _request: &SipRequest) {
        if !self.acked.is_cancelled() {
            debug!(call_id = %self.call_id, "ACK received");
        }
        self.acked.cancel();
    }

    async fn bye(&self, timeout: Duration) -> Result<(), SipError> {
        let request = &self.invite.request;
        // their From becomes our To; their To plus our tag becomes our From
        let local = request
            .to_header()
            .ok_or_else(|| SipError::Parse("INVITE without To".to_string()))?
            .with_tag(&self.local_tag);
        let remote = request
            .from_header()
            .ok_or_else(|| SipError::Parse("INVITE without From".to_string()))?;
        let target = request
            .contact_uri()
            .unwrap_or_else(|| remote.uri.clone());

        let seq = {
            let mut state = self.state.lock().await;
            state.local_cseq += 1;
            state.local_cseq
        };

        let sent_by = self.contact_host();
        let mut builder = RequestBuilder::new(SipMethod::Bye, target)
            .via(self.invite.protocol.as_str(), &sent_by, &generate_branch())
            .from(&local)
            .to(&remote)
            .call_id(&self.call_id)
            .cseq(seq);
        // UAS keeps the Record-Route order
        for route in request.record_routes() {
            builder = builder.route(&route);
        }
        let bye = builder.build()?;
        self.terminated.cancel();

        let mut txn = self
            .layer
            .send_request(&bye, self.invite.source, self.invite.protocol)
            .await?;
        let result = txn.final_response(timeout).await;
        txn.close().await;

        let response = result?;
        info!(call_id = %self.call_id, status = response.status_code(), "BYE answered");
        if response.is_success() {
            Ok(())
        } else {
            Err(SipError::Rejected {
                code: response.status_code(),
                reason: response.reason(),
            })
        }
    }

    fn terminated(&self) -> CancellationToken {
        self.terminated.clone()
    }
}

impl ServerDialog {
    /// host:port of our Contact, used as Via sent-by
    fn contact_host(&self) -> String {
        match uri_host_port(&self.contact) {
            Some((host, Some(port))) => format!("{}:{}", host, port),
            Some((host, None)) => host,
            None => self.layer.local_addr().to_string(),
        }
    }
}
