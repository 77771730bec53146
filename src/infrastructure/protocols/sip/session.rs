//! Per-call session
//!
//! A [`Session`] ties one SIP dialog to one [`RtpHandler`]. It owns the call
//! state machine, the negotiated codec, the lifecycle queues and the
//! cancellation token every per-call task watches. [`Session::end`] is the
//! only teardown path and runs once no matter how many callers race it.

use super::dialog::DialogHandle;
use super::message::SipError;
use super::middleware::RequestExtra;
use super::tenant::SipConfig;
use crate::domain::call::{CallDirection, CallEvent, CallState, EventType};
use crate::domain::shared::DomainError;
use crate::infrastructure::media::codec::{Codec, PCMU};
use crate::infrastructure::media::rtp::{RtpHandler, RtpStats};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::Serialize;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

const EVENT_QUEUE_CAPACITY: usize = 50;
const ERROR_QUEUE_CAPACITY: usize = 10;

/// One-shot hook run by [`Session::disconnect`]
pub type DisconnectFn = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub config: SipConfig,
    pub direction: CallDirection,
    /// Generated when absent
    pub call_id: Option<String>,
    pub codec: Codec,
    pub extra: RequestExtra,
}

impl SessionConfig {
    pub fn new(config: SipConfig, direction: CallDirection) -> Self {
        Self {
            config,
            direction,
            call_id: None,
            codec: PCMU,
            extra: RequestExtra::default(),
        }
    }

    pub fn with_call_id(mut self, call_id: impl Into<String>) -> Self {
        self.call_id = Some(call_id.into());
        self
    }
}

/// Serializable snapshot of a session
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub call_id: String,
    pub local_tag: String,
    pub remote_tag: Option<String>,
    pub local_uri: String,
    pub remote_uri: String,
    pub state: CallState,
    pub direction: CallDirection,
    pub start_time: DateTime<Utc>,
    pub connected_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub local_rtp: Option<SocketAddr>,
    pub remote_rtp: Option<SocketAddr>,
    pub codec: String,
    pub sample_rate: u32,
    /// Seconds between connect and end (or now)
    pub duration_secs: i64,
}

struct SessionState {
    state: CallState,
    connected_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
    remote_tag: Option<String>,
    local_uri: String,
    remote_uri: String,
    codec: Codec,
    local_rtp: Option<SocketAddr>,
    remote_rtp: Option<SocketAddr>,
    rtp_port: Option<u16>,
}

struct Queues {
    events: Option<mpsc::Sender<CallEvent>>,
    errors: Option<mpsc::Sender<SipError>>,
}

pub struct Session {
    call_id: String,
    direction: CallDirection,
    config: SipConfig,
    local_tag: String,
    start_time: DateTime<Utc>,

    state: RwLock<SessionState>,
    extra: RwLock<RequestExtra>,
    metadata: RwLock<HashMap<String, serde_json::Value>>,

    rtp: RwLock<Option<Arc<RtpHandler>>>,
    dialog: RwLock<Option<Arc<dyn DialogHandle>>>,

    queues: Mutex<Queues>,
    queues_closed: AtomicBool,
    events_rx: Mutex<Option<mpsc::Receiver<CallEvent>>>,
    errors_rx: Mutex<Option<mpsc::Receiver<SipError>>>,

    on_disconnect: Mutex<Option<DisconnectFn>>,

    ended: AtomicBool,
    cancel: CancellationToken,
    bye_received: CancellationToken,
}

impl Session {
    /// Validate `config` for the call direction and build the session
    ///
    /// Outbound calls need full credentials; inbound ones only a media range.
    pub fn new(config: SessionConfig, parent: &CancellationToken) -> Result<Self, SipError> {
        match config.direction {
            CallDirection::Outbound => config.config.validate()?,
            CallDirection::Inbound => config.config.validate_rtp()?,
        }

        let call_id = config
            .call_id
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let local_tag: String = Uuid::new_v4().simple().to_string().chars().take(8).collect();
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let (errors_tx, errors_rx) = mpsc::channel(ERROR_QUEUE_CAPACITY);

        debug!(call_id = %call_id, direction = %config.direction, "Session created");

        Ok(Self {
            call_id,
            direction: config.direction,
            config: config.config,
            local_tag,
            start_time: Utc::now(),
            state: RwLock::new(SessionState {
                state: CallState::Initializing,
                connected_time: None,
                end_time: None,
                remote_tag: None,
                local_uri: String::new(),
                remote_uri: String::new(),
                codec: config.codec,
                local_rtp: None,
                remote_rtp: None,
                rtp_port: None,
            }),
            extra: RwLock::new(config.extra),
            metadata: RwLock::new(HashMap::new()),
            rtp: RwLock::new(None),
            dialog: RwLock::new(None),
            queues: Mutex::new(Queues {
                events: Some(events_tx),
                errors: Some(errors_tx),
            }),
            queues_closed: AtomicBool::new(false),
            events_rx: Mutex::new(Some(events_rx)),
            errors_rx: Mutex::new(Some(errors_rx)),
            on_disconnect: Mutex::new(None),
            ended: AtomicBool::new(false),
            cancel: parent.child_token(),
            bye_received: CancellationToken::new(),
        })
    }

    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    pub fn direction(&self) -> CallDirection {
        self.direction
    }

    pub fn config(&self) -> &SipConfig {
        &self.config
    }

    pub fn local_tag(&self) -> &str {
        &self.local_tag
    }

    /// Cancelled when the session ends
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn state(&self) -> CallState {
        self.state.read().await.state
    }

    /// Move along the call state graph
    ///
    /// Rejected transitions leave the state unchanged.
    pub async fn transition(&self, next: CallState) -> Result<(), DomainError> {
        let event = {
            let mut inner = self.state.write().await;
            let current = inner.state;
            if current == next && !current.is_terminal() {
                return Ok(());
            }
            if !current.can_transition_to(next) {
                warn!(call_id = %self.call_id, from = %current, to = %next, "Invalid state transition");
                return Err(DomainError::InvalidStateTransition {
                    from: current.to_string(),
                    to: next.to_string(),
                });
            }
            inner.state = next;

            let now = Utc::now();
            match next {
                CallState::Connected => {
                    inner.connected_time.get_or_insert(now);
                    Some(EventType::Connected)
                }
                CallState::Ended => {
                    inner.end_time = Some(now);
                    Some(EventType::Bye)
                }
                CallState::Failed => {
                    inner.end_time = Some(now);
                    Some(EventType::Error)
                }
                CallState::Ringing => Some(EventType::Ringing),
                _ => None,
            }
        };

        info!(call_id = %self.call_id, state = %next, "Session state changed");
        if let Some(kind) = event {
            self.emit(CallEvent::new(kind, &self.call_id)).await;
        }
        Ok(())
    }

    /// Publish a lifecycle event; dropped when the queue is full or closed
    pub async fn emit(&self, event: CallEvent) {
        if self.queues_closed.load(Ordering::SeqCst) {
            return;
        }
        let queues = self.queues.lock().await;
        if let Some(tx) = &queues.events {
            if tx.try_send(event).is_err() {
                warn!(call_id = %self.call_id, "Event queue full, event dropped");
            }
        }
    }

    /// Report an error for observers; never changes call flow
    pub async fn report_error(&self, error: SipError) {
        if self.queues_closed.load(Ordering::SeqCst) {
            return;
        }
        let queues = self.queues.lock().await;
        if let Some(tx) = &queues.errors {
            if tx.try_send(error).is_err() {
                warn!(call_id = %self.call_id, "Error queue full, error dropped");
            }
        }
    }

    /// Lifecycle events; can be taken once
    pub async fn events(&self) -> Option<mpsc::Receiver<CallEvent>> {
        self.events_rx.lock().await.take()
    }

    pub async fn errors(&self) -> Option<mpsc::Receiver<SipError>> {
        self.errors_rx.lock().await.take()
    }

    pub async fn set_metadata(&self, key: impl Into<String>, value: serde_json::Value) {
        self.metadata.write().await.insert(key.into(), value);
    }

    pub async fn metadata(&self, key: &str) -> Option<serde_json::Value> {
        self.metadata.read().await.get(key).cloned()
    }

    pub async fn extra(&self) -> RequestExtra {
        self.extra.read().await.clone()
    }

    pub async fn merge_extra(&self, extra: RequestExtra) {
        self.extra.write().await.merge(extra);
    }

    pub async fn set_uris(&self, local: impl Into<String>, remote: impl Into<String>) {
        let mut inner = self.state.write().await;
        inner.local_uri = local.into();
        inner.remote_uri = remote.into();
    }

    pub async fn set_remote_tag(&self, tag: Option<String>) {
        self.state.write().await.remote_tag = tag;
    }

    pub async fn set_rtp_handler(&self, handler: Arc<RtpHandler>) {
        let (ip, port) = handler.local_addr();
        self.state.write().await.local_rtp = Some(SocketAddr::new(ip, port));
        *self.rtp.write().await = Some(handler);
    }

    pub async fn rtp_handler(&self) -> Option<Arc<RtpHandler>> {
        self.rtp.read().await.clone()
    }

    /// Remember the allocated RTP port so it can be released later
    pub async fn set_rtp_port(&self, port: u16) {
        self.state.write().await.rtp_port = Some(port);
    }

    /// Hand out the allocated port once; later calls get `None`
    pub async fn take_rtp_port(&self) -> Option<u16> {
        self.state.write().await.rtp_port.take()
    }

    pub async fn set_dialog(&self, dialog: Arc<dyn DialogHandle>) {
        *self.dialog.write().await = Some(dialog);
    }

    pub async fn dialog(&self) -> Option<Arc<dyn DialogHandle>> {
        self.dialog.read().await.clone()
    }

    pub async fn codec(&self) -> Codec {
        self.state.read().await.codec
    }

    /// Record the negotiated codec and apply it to the media path
    pub async fn set_codec(&self, codec: Codec) {
        self.state.write().await.codec = codec;
        if let Some(rtp) = self.rtp_handler().await {
            rtp.set_codec(codec).await;
        }
    }

    pub async fn remote_rtp(&self) -> Option<SocketAddr> {
        self.state.read().await.remote_rtp
    }

    pub async fn local_rtp(&self) -> Option<SocketAddr> {
        self.state.read().await.local_rtp
    }

    /// Point media at the peer
    pub async fn set_remote_rtp(&self, ip: IpAddr, port: u16) {
        self.state.write().await.remote_rtp = Some(SocketAddr::new(ip, port));
        if let Some(rtp) = self.rtp_handler().await {
            rtp.set_remote_addr(ip, port).await;
        }
    }

    /// Decoded-by-nobody inbound payloads; can be taken once
    pub async fn audio_in(&self) -> Result<mpsc::Receiver<Bytes>, SipError> {
        let rtp = self.rtp_handler().await.ok_or(SipError::RtpNotInitialized)?;
        rtp.take_audio_in().await.ok_or(SipError::SessionClosed)
    }

    /// Outbound audio in the negotiated codec's encoding
    pub async fn audio_out(&self) -> Result<mpsc::Sender<Bytes>, SipError> {
        self.rtp_handler()
            .await
            .map(|rtp| rtp.audio_out())
            .ok_or(SipError::RtpNotInitialized)
    }

    pub async fn rtp_stats(&self) -> Option<RtpStats> {
        self.rtp_handler().await.map(|rtp| rtp.stats())
    }

    pub async fn set_on_disconnect(&self, f: DisconnectFn) {
        *self.on_disconnect.lock().await = Some(f);
    }

    /// Run the disconnect hook, at most once
    pub async fn disconnect(&self) {
        let hook = self.on_disconnect.lock().await.take();
        if let Some(hook) = hook {
            hook().await;
        }
    }

    /// The peer sent BYE; raised before teardown finishes
    pub fn notify_bye(&self) {
        self.bye_received.cancel();
    }

    pub fn is_bye_received(&self) -> bool {
        self.bye_received.is_cancelled()
    }

    pub async fn bye_received(&self) {
        self.bye_received.cancelled().await
    }

    pub fn is_ended(&self) -> bool {
        self.ended.load(Ordering::SeqCst)
    }

    /// Wait until [`Session::end`] has run
    pub async fn ended(&self) {
        self.cancel.cancelled().await
    }

    /// Tear the session down; only the first caller does any work
    pub async fn end(&self) {
        if self
            .ended
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        if let Some(rtp) = self.rtp_handler().await {
            if let Err(e) = rtp.stop().await {
                warn!(call_id = %self.call_id, error = %e, "RTP stop failed");
            }
        }
        self.cancel.cancel();

        if !self.state().await.is_terminal() {
            if let Err(e) = self.transition(CallState::Ended).await {
                debug!(call_id = %self.call_id, error = %e, "Final state not applied");
            }
        }

        self.close_queues().await;
        info!(call_id = %self.call_id, "Session ended");
    }

    async fn close_queues(&self) {
        if self.queues_closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut queues = self.queues.lock().await;
        queues.events.take();
        queues.errors.take();
    }

    pub async fn info(&self) -> SessionInfo {
        let inner = self.state.read().await;
        let duration_secs = inner
            .connected_time
            .map(|start| (inner.end_time.unwrap_or_else(Utc::now) - start).num_seconds())
            .unwrap_or(0);

        SessionInfo {
            call_id: self.call_id.clone(),
            local_tag: self.local_tag.clone(),
            remote_tag: inner.remote_tag.clone(),
            local_uri: inner.local_uri.clone(),
            remote_uri: inner.remote_uri.clone(),
            state: inner.state,
            direction: self.direction,
            start_time: self.start_time,
            connected_time: inner.connected_time,
            end_time: inner.end_time,
            local_rtp: inner.local_rtp,
            remote_rtp: inner.remote_rtp,
            codec: inner.codec.name.to_string(),
            sample_rate: inner.codec.clock_rate,
            duration_secs,
        }
    }
}
