//! SIP Transaction Layer
//!
//! A lightweight take on RFC 3261 section 17:
//! - client transactions are keyed by the top Via branch; requests sent
//!   over UDP are retransmitted (Timer A/E) until the first response
//!   arrives or 64*T1 elapses
//! - server transactions cache the last response per branch and method, so a
//!   retransmitted request is answered again instead of being re-dispatched
//! - the ACK for a 2xx lives outside any transaction; it is stored per
//!   Call-ID and replayed when the 2xx is retransmitted

use super::message::{HeaderAccess, SipError, SipMethod, SipRequest, SipResponse};
use super::transport::{TransportProtocol, TransportSet};
use crate::config::SipTimingConfig;
use bytes::Bytes;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// SIP Timers (RFC 3261 Section 17.1.1.1)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SipTimers {
    /// T1: RTT Estimate (default 500ms)
    pub t1: Duration,
    /// T2: Maximum retransmit interval for non-INVITE requests and 2xx answers
    pub t2: Duration,
}

impl SipTimers {
    /// Timer B/F/H: 64*T1
    pub fn transaction_timeout(&self) -> Duration {
        self.t1 * 64
    }

    /// Next retransmission interval
    pub fn backoff(&self, current: Duration, capped: bool) -> Duration {
        let next = current * 2;
        if capped {
            next.min(self.t2)
        } else {
            next
        }
    }
}

impl Default for SipTimers {
    fn default() -> Self {
        Self {
            t1: Duration::from_millis(500),
            t2: Duration::from_secs(4),
        }
    }
}

impl From<&SipTimingConfig> for SipTimers {
    fn from(config: &SipTimingConfig) -> Self {
        Self {
            t1: config.t1(),
            t2: config.t2(),
        }
    }
}

/// A request as it arrived, with where to answer it
#[derive(Debug, Clone)]
pub struct InboundRequest {
    pub request: SipRequest,
    pub source: SocketAddr,
    pub protocol: TransportProtocol,
}

struct ClientEntry {
    tx: mpsc::Sender<SipResponse>,
    retransmit: CancellationToken,
}

#[derive(Clone)]
struct Outbound {
    data: Bytes,
    destination: SocketAddr,
    protocol: TransportProtocol,
}

struct ServerEntry {
    last_response: Option<Outbound>,
    expires: Instant,
}

pub struct TransactionLayer {
    transports: TransportSet,
    timers: SipTimers,
    clients: Mutex<HashMap<String, ClientEntry>>,
    servers: Mutex<HashMap<(String, String), ServerEntry>>,
    acks: Mutex<HashMap<String, Outbound>>,
}

impl TransactionLayer {
    pub fn new(transports: TransportSet, timers: SipTimers) -> Self {
        Self {
            transports,
            timers,
            clients: Mutex::new(HashMap::new()),
            servers: Mutex::new(HashMap::new()),
            acks: Mutex::new(HashMap::new()),
        }
    }

    pub fn timers(&self) -> SipTimers {
        self.timers
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.transports.local_addr()
    }

    pub async fn send_raw(
        &self,
        protocol: TransportProtocol,
        destination: SocketAddr,
        data: Bytes,
    ) -> Result<(), SipError> {
        self.transports.send(protocol, destination, data).await
    }

    /// Start a client transaction for `request`
    pub async fn send_request(
        self: &Arc<Self>,
        request: &SipRequest,
        destination: SocketAddr,
        protocol: TransportProtocol,
    ) -> Result<ClientTransaction, SipError> {
        let branch = request
            .branch()
            .ok_or_else(|| SipError::Internal("request without Via branch".to_string()))?;
        let (tx, rx) = mpsc::channel(16);
        let retransmit = CancellationToken::new();
        self.clients.lock().await.insert(
            branch.clone(),
            ClientEntry {
                tx,
                retransmit: retransmit.clone(),
            },
        );

        let data = request.to_bytes();
        if let Err(e) = self.send_raw(protocol, destination, data.clone()).await {
            self.forget(&branch).await;
            return Err(e);
        }
        debug!(branch = %branch, method = %request.method(), dest = %destination, "Request sent");

        if !protocol.is_reliable() {
            let capped = request.method() != SipMethod::Invite;
            tokio::spawn(self.clone().retransmit(
                Outbound {
                    data,
                    destination,
                    protocol,
                },
                capped,
                retransmit,
            ));
        }

        Ok(ClientTransaction {
            branch,
            rx,
            layer: self.clone(),
        })
    }

    async fn retransmit(self: Arc<Self>, message: Outbound, capped: bool, stop: CancellationToken) {
        let deadline = Instant::now() + self.timers.transaction_timeout();
        let mut interval = self.timers.t1;
        loop {
            tokio::select! {
                _ = stop.cancelled() => return,
                _ = tokio::time::sleep(interval) => {}
            }
            if Instant::now() >= deadline {
                return;
            }
            if let Err(e) = self
                .send_raw(message.protocol, message.destination, message.data.clone())
                .await
            {
                warn!(error = %e, "Request retransmission failed");
            }
            interval = self.timers.backoff(interval, capped);
        }
    }

    /// Drop a client transaction and stop its retransmissions
    pub async fn forget(&self, branch: &str) {
        if let Some(entry) = self.clients.lock().await.remove(branch) {
            entry.retransmit.cancel();
        }
    }

    /// Route a response to its client transaction; `false` when nothing matched
    pub async fn dispatch_response(&self, response: SipResponse) -> bool {
        let Some(branch) = response.branch() else {
            return false;
        };

        let sender = {
            let clients = self.clients.lock().await;
            clients.get(&branch).map(|entry| {
                entry.retransmit.cancel();
                entry.tx.clone()
            })
        };

        match sender {
            Some(tx) => {
                if tx.try_send(response).is_err() {
                    debug!(branch = %branch, "Client transaction not reading; response dropped");
                }
                true
            }
            None => self.replay_ack(&response).await,
        }
    }

    /// A 2xx retransmitted after its transaction completed gets the ACK again
    async fn replay_ack(&self, response: &SipResponse) -> bool {
        let is_invite_2xx = response.is_success()
            && matches!(response.cseq(), Some((_, SipMethod::Invite)));
        if !is_invite_2xx {
            return false;
        }
        let Some(call_id) = response.call_id() else {
            return false;
        };
        let Some(ack) = self.acks.lock().await.get(&call_id).cloned() else {
            return false;
        };

        debug!(call_id = %call_id, "Replaying ACK for retransmitted 2xx");
        if let Err(e) = self.send_raw(ack.protocol, ack.destination, ack.data).await {
            warn!(call_id = %call_id, error = %e, "ACK replay failed");
        }
        true
    }

    pub async fn register_ack(
        &self,
        call_id: &str,
        data: Bytes,
        destination: SocketAddr,
        protocol: TransportProtocol,
    ) {
        self.acks.lock().await.insert(
            call_id.to_string(),
            Outbound {
                data,
                destination,
                protocol,
            },
        );
    }

    pub async fn forget_ack(&self, call_id: &str) {
        self.acks.lock().await.remove(call_id);
    }

    fn server_key(request: &SipRequest) -> Option<(String, String)> {
        request
            .branch()
            .map(|branch| (branch, request.method().as_str().to_string()))
    }

    /// Returns `true` when `request` repeats one already seen; the cached
    /// response, if any, has been re-sent
    pub async fn check_retransmission(&self, request: &SipRequest) -> bool {
        let Some(key) = Self::server_key(request) else {
            return false;
        };
        let now = Instant::now();

        let cached = {
            let mut servers = self.servers.lock().await;
            servers.retain(|_, entry| entry.expires > now);
            match servers.get(&key) {
                Some(entry) => Some(entry.last_response.clone()),
                None => {
                    servers.insert(
                        key.clone(),
                        ServerEntry {
                            last_response: None,
                            expires: now + self.timers.transaction_timeout(),
                        },
                    );
                    None
                }
            }
        };

        match cached {
            None => false,
            Some(None) => {
                debug!(branch = %key.0, method = %key.1, "Retransmission absorbed while processing");
                true
            }
            Some(Some(response)) => {
                debug!(branch = %key.0, method = %key.1, "Answering retransmission from cache");
                if let Err(e) = self
                    .send_raw(response.protocol, response.destination, response.data)
                    .await
                {
                    warn!(error = %e, "Cached response resend failed");
                }
                true
            }
        }
    }

    /// Send a response to the request source and remember it for retransmissions
    pub async fn send_response(
        &self,
        request: &SipRequest,
        response: &SipResponse,
        destination: SocketAddr,
        protocol: TransportProtocol,
    ) -> Result<(), SipError> {
        let data = response.to_bytes();
        if let Some(key) = Self::server_key(request) {
            let mut servers = self.servers.lock().await;
            let expires = Instant::now() + self.timers.transaction_timeout();
            servers.insert(
                key,
                ServerEntry {
                    last_response: Some(Outbound {
                        data: data.clone(),
                        destination,
                        protocol,
                    }),
                    expires,
                },
            );
        }
        debug!(
            status = response.status_code(),
            method = %request.method(),
            dest = %destination,
            "Response sent"
        );
        self.send_raw(protocol, destination, data).await
    }

    /// Answer an inbound request at its source
    pub async fn respond(
        &self,
        inbound: &InboundRequest,
        response: &SipResponse,
    ) -> Result<(), SipError> {
        self.send_response(&inbound.request, response, inbound.source, inbound.protocol)
            .await
    }
}

/// Responses for one outstanding request
pub struct ClientTransaction {
    branch: String,
    rx: mpsc::Receiver<SipResponse>,
    layer: Arc<TransactionLayer>,
}

impl ClientTransaction {
    pub fn branch(&self) -> &str {
        &self.branch
    }

    /// Next response, or `Timeout` once `timeout` elapses
    pub async fn recv(&mut self, timeout: Duration) -> Result<SipResponse, SipError> {
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Ok(Some(response)) => Ok(response),
            Ok(None) => Err(SipError::Internal("transaction closed".to_string())),
            Err(_) => Err(SipError::Timeout(format!("no response for {}", self.branch))),
        }
    }

    /// Next final (>= 200) response, skipping provisionals
    pub async fn final_response(&mut self, timeout: Duration) -> Result<SipResponse, SipError> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let response = self.recv(remaining).await?;
            if !response.is_provisional() {
                return Ok(response);
            }
        }
    }

    pub async fn close(self) {
        self.layer.forget(&self.branch).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::protocols::sip::builder::{RequestBuilder, ResponseBuilder};
    use crate::infrastructure::protocols::sip::message::NameAddr;
    use crate::infrastructure::protocols::sip::transport::{OutgoingMessage, Transport};
    use async_trait::async_trait;

    /// Captures everything sent
    struct Recorder {
        sent: std::sync::Mutex<Vec<Bytes>>,
    }

    #[async_trait]
    impl Transport for Recorder {
        fn protocol(&self) -> TransportProtocol {
            TransportProtocol::Udp
        }

        fn local_addr(&self) -> SocketAddr {
            SocketAddr::from(([127, 0, 0, 1], 5060))
        }

        async fn send(&self, message: OutgoingMessage) -> Result<(), SipError> {
            self.sent.lock().unwrap().push(message.data);
            Ok(())
        }
    }

    fn layer() -> (Arc<TransactionLayer>, Arc<Recorder>) {
        let recorder = Arc::new(Recorder {
            sent: std::sync::Mutex::new(Vec::new()),
        });
        let transports = TransportSet::from_transports(recorder.clone(), None);
        (
            Arc::new(TransactionLayer::new(transports, SipTimers::default())),
            recorder,
        )
    }

    fn request(method: SipMethod, branch: &str) -> SipRequest {
        RequestBuilder::new(method.clone(), "sip:bob@127.0.0.1:5070")
            .via("UDP", "127.0.0.1:5060", branch)
            .from(&NameAddr::new(None, "sip:bot@127.0.0.1").with_tag("f1"))
            .to(&NameAddr::new(None, "sip:bob@127.0.0.1"))
            .call_id("txn-1")
            .cseq(1)
            .build()
            .unwrap()
    }

    fn dest() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 5070))
    }

    #[tokio::test(start_paused = true)]
    async fn test_invite_retransmits_with_doubling_until_response() {
        let (layer, recorder) = layer();
        let invite = request(SipMethod::Invite, "z9hG4bKinv");
        let mut txn = layer
            .send_request(&invite, dest(), TransportProtocol::Udp)
            .await
            .unwrap();

        // sends at 0, 0.5, 1.5, 3.5 s
        tokio::time::sleep(Duration::from_millis(3600)).await;
        assert_eq!(recorder.sent.lock().unwrap().len(), 4);

        let ringing = ResponseBuilder::new(180).build_for_request(&invite);
        assert!(layer.dispatch_response(ringing).await);
        assert_eq!(txn.recv(Duration::from_secs(1)).await.unwrap().status_code(), 180);

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(recorder.sent.lock().unwrap().len(), 4);
        txn.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_invite_interval_caps_at_t2() {
        let (layer, recorder) = layer();
        let bye = request(SipMethod::Bye, "z9hG4bKbye");
        let mut txn = layer
            .send_request(&bye, dest(), TransportProtocol::Udp)
            .await
            .unwrap();

        // 0, .5, 1.5, 3.5, 7.5, 11.5, 15.5
        tokio::time::sleep(Duration::from_millis(15_600)).await;
        assert_eq!(recorder.sent.lock().unwrap().len(), 7);

        assert!(txn.recv(Duration::from_secs(30)).await.is_err());
        txn.close().await;
    }

    #[tokio::test]
    async fn test_server_retransmission_is_answered_from_cache() {
        let (layer, recorder) = layer();
        let options = request(SipMethod::Options, "z9hG4bKopt");

        assert!(!layer.check_retransmission(&options).await);
        // repeat before we answered: absorbed, nothing sent
        assert!(layer.check_retransmission(&options).await);
        assert!(recorder.sent.lock().unwrap().is_empty());

        let ok = ResponseBuilder::ok().build_for_request(&options);
        layer
            .send_response(&options, &ok, dest(), TransportProtocol::Udp)
            .await
            .unwrap();
        assert!(layer.check_retransmission(&options).await);

        let sent = recorder.sent.lock().unwrap();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0], sent[1]);
    }

    #[tokio::test]
    async fn test_stray_2xx_replays_ack() {
        let (layer, recorder) = layer();
        let invite = request(SipMethod::Invite, "z9hG4bKgone");
        let ok = ResponseBuilder::ok().to_tag("t").build_for_request(&invite);

        assert!(!layer.dispatch_response(ok.clone()).await);

        layer
            .register_ack("txn-1", Bytes::from_static(b"ACK"), dest(), TransportProtocol::Udp)
            .await;
        assert!(layer.dispatch_response(ok).await);
        assert_eq!(recorder.sent.lock().unwrap()[0], Bytes::from_static(b"ACK"));
    }
}
