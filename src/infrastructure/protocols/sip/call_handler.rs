//! Call handling (INVITE, ACK, BYE, CANCEL, UPDATE) and the no-op methods

use super::builder::ResponseBuilder;
use super::dialog::{DialogHandle, ServerDialog};
use super::handler::SipHandler;
use super::message::{HeaderAccess, SipError, SipMethod};
use super::middleware::SipRequestContext;
use super::sdp::{parse_sdp, SdpMediaInfo};
use super::server::ServerContext;
use super::session::{Session, SessionConfig};
use super::transaction::InboundRequest;
use crate::domain::call::{CallDirection, CallEvent, CallState, EventType};
use crate::infrastructure::media::codec::PCMU;
use async_trait::async_trait;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

pub(crate) const ALLOWED_METHODS: &str =
    "INVITE, ACK, BYE, CANCEL, UPDATE, OPTIONS, INFO, NOTIFY, MESSAGE, REGISTER";

/// Handlers for every method the server answers
pub(crate) fn method_handlers(ctx: &Arc<ServerContext>) -> HashMap<SipMethod, Arc<dyn SipHandler>> {
    let mut handlers: HashMap<SipMethod, Arc<dyn SipHandler>> = HashMap::new();
    handlers.insert(SipMethod::Invite, Arc::new(InviteHandler::new(ctx.clone())));
    handlers.insert(SipMethod::Ack, Arc::new(AckHandler::new(ctx.clone())));
    handlers.insert(SipMethod::Bye, Arc::new(ByeHandler::new(ctx.clone())));
    handlers.insert(SipMethod::Cancel, Arc::new(CancelHandler::new(ctx.clone())));
    handlers.insert(SipMethod::Update, Arc::new(UpdateHandler::new(ctx.clone())));
    for method in [
        SipMethod::Register,
        SipMethod::Options,
        SipMethod::Info,
        SipMethod::Notify,
        SipMethod::Message,
    ] {
        handlers.insert(method, Arc::new(AcceptHandler::new(ctx.clone())));
    }
    // transfer is unsupported
    handlers.insert(SipMethod::Refer, Arc::new(DeclineHandler::new(ctx.clone(), 603)));
    // 489 stops peers from retrying the subscription
    handlers.insert(SipMethod::Subscribe, Arc::new(DeclineHandler::new(ctx.clone(), 489)));
    handlers
}

/// Apply a renegotiated offer to a live call
///
/// A hold offer never moves the media target. Returns `true` when the offer
/// put the call on hold.
pub(crate) async fn apply_media_update(session: &Session, info: &SdpMediaInfo) -> bool {
    let call_id = session.call_id();
    let state = session.state().await;

    if info.is_hold() {
        info!(call_id = %call_id, direction = %info.direction, "Call on hold, keeping media target");
        if state == CallState::Connected {
            let _ = session.transition(CallState::OnHold).await;
        }
        return true;
    }

    if info.has_media_target() {
        match info.connection_ip.parse::<IpAddr>() {
            Ok(ip) => {
                let target = std::net::SocketAddr::new(ip, info.audio_port);
                if session.remote_rtp().await != Some(target) {
                    info!(call_id = %call_id, remote = %target, "Media redirected");
                    session.set_remote_rtp(ip, info.audio_port).await;
                }
            }
            Err(_) => warn!(call_id = %call_id, ip = %info.connection_ip, "Unusable connection address"),
        }
    }

    let current = session.codec().await;
    if info.preferred_codec.payload_type != current.payload_type {
        info!(call_id = %call_id, from = current.name, to = info.preferred_codec.name, "Codec changed");
        session.set_codec(info.preferred_codec).await;
    }

    if state == CallState::OnHold {
        let _ = session.transition(CallState::Connected).await;
    }
    false
}

/// 200 carrying the session's current SDP
async fn answer_with_sdp(
    ctx: &ServerContext,
    session: &Session,
    inbound: &InboundRequest,
) -> Result<(), SipError> {
    let mut builder = ResponseBuilder::ok()
        .to_tag(session.local_tag())
        .contact(&ctx.contact_uri("voxsip"));
    if let Some(sdp) = ctx.session_sdp(session).await {
        builder = builder.sdp(sdp);
    }
    ctx.respond(inbound, builder).await
}

/// Dialog check for in-dialog requests; answers 400 when it fails
async fn validate_in_dialog(
    ctx: &ServerContext,
    session: &Session,
    inbound: &InboundRequest,
) -> Result<bool, SipError> {
    let Some(dialog) = session.dialog().await else {
        return Ok(true);
    };
    match dialog.validate_request(&inbound.request).await {
        Ok(()) => Ok(true),
        Err(e) => {
            warn!(call_id = %session.call_id(), method = %inbound.request.method(), error = %e, "In-dialog request rejected");
            ctx.respond(inbound, ResponseBuilder::new(400)).await?;
            Ok(false)
        }
    }
}

/// INVITE handler: new calls and re-INVITEs
pub struct InviteHandler {
    ctx: Arc<ServerContext>,
}

impl InviteHandler {
    pub(crate) fn new(ctx: Arc<ServerContext>) -> Self {
        Self { ctx }
    }

    async fn reject(&self, inbound: &InboundRequest, code: u16) -> Result<(), SipError> {
        metrics::counter!("voxsip_calls_rejected_total", "code" => code.to_string()).increment(1);
        self.ctx
            .respond(inbound, ResponseBuilder::new(code))
            .await
    }

    async fn handle_invite(&self, inbound: InboundRequest, call_id: String) -> Result<(), SipError> {
        let ctx = &self.ctx;
        let request = &inbound.request;
        ctx.respond(&inbound, ResponseBuilder::new(100)).await?;

        let from = request
            .from_header()
            .ok_or_else(|| SipError::Parse("INVITE without From".to_string()))?;
        let to = request
            .to_header()
            .ok_or_else(|| SipError::Parse("INVITE without To".to_string()))?;
        let offer = match parse_sdp(request.body()) {
            Ok(info) => Some(info),
            Err(e) => {
                debug!(call_id = %call_id, error = %e, "No usable SDP offer, defaulting to PCMU");
                None
            }
        };

        let mut request_ctx = SipRequestContext::new(SipMethod::Invite, &call_id);
        request_ctx.request_uri = request.uri_string();
        request_ctx.from_uri = from.uri.clone();
        request_ctx.to_uri = to.uri.clone();
        request_ctx.sdp_info = offer.clone();

        let result = match ctx.resolver.resolve(&mut request_ctx).await {
            Ok(result) => result,
            Err(e) => {
                warn!(call_id = %call_id, error = %e, "Config resolution failed");
                return self.reject(&inbound, 500).await;
            }
        };
        if !result.should_allow {
            warn!(
                call_id = %call_id,
                code = result.reject_code,
                reason = %result.reject_msg,
                "INVITE rejected by middleware"
            );
            return self.reject(&inbound, result.reject_code).await;
        }
        let Some(mut config) = result.config else {
            warn!(call_id = %call_id, "Resolver returned no config");
            return self.reject(&inbound, 500).await;
        };
        if config.server.is_empty() || config.server == "0.0.0.0" {
            config.server = ctx.external_ip().to_string();
        }

        let codec = offer.as_ref().map(|o| o.preferred_codec).unwrap_or(PCMU);
        let mut session_config =
            SessionConfig::new(config, CallDirection::Inbound).with_call_id(&call_id);
        session_config.codec = codec;
        session_config.extra = result.extra;
        let session = match Session::new(session_config, &ctx.cancel) {
            Ok(session) => Arc::new(session),
            Err(e) => {
                warn!(call_id = %call_id, error = %e, "Invalid tenant config");
                return self.reject(&inbound, 500).await;
            }
        };
        session.set_uris(to.uri.clone(), from.uri.clone()).await;
        session.set_remote_tag(from.tag().map(String::from)).await;
        ctx.insert_session(session.clone()).await;

        let rtp = match ctx.create_rtp(&session, codec).await {
            Ok(rtp) => rtp,
            Err(e) => {
                let code = if matches!(e, SipError::PortExhausted) { 503 } else { 500 };
                warn!(call_id = %call_id, error = %e, code, "RTP setup failed");
                ctx.teardown(&session).await;
                return self.reject(&inbound, code).await;
            }
        };

        if let Some(offer) = offer.as_ref().filter(|o| o.has_media_target()) {
            match offer.connection_ip.parse::<IpAddr>() {
                Ok(ip) => session.set_remote_rtp(ip, offer.audio_port).await,
                Err(_) => warn!(call_id = %call_id, ip = %offer.connection_ip, "Offer address unusable"),
            }
        }

        let dialog = Arc::new(ServerDialog::new(
            ctx.layer.clone(),
            inbound.clone(),
            session.local_tag(),
            ctx.contact_uri("voxsip"),
        ));
        session.set_dialog(dialog.clone()).await;

        let answered = async {
            dialog.respond(180, None).await?;
            let _ = session.transition(CallState::Ringing).await;
            let sdp = ctx
                .session_sdp(&session)
                .await
                .ok_or(SipError::RtpNotInitialized)?;
            dialog.respond(200, Some(&sdp)).await
        }
        .await;
        if let Err(e) = answered {
            warn!(call_id = %call_id, error = %e, "Failed to answer INVITE");
            let _ = session.transition(CallState::Failed).await;
            session.report_error(e.clone()).await;
            ctx.teardown(&session).await;
            return Err(e);
        }

        rtp.start().await;
        session
            .emit(CallEvent::new(EventType::RtpStarted, &call_id).with_data(serde_json::json!({
                "local_port": rtp.local_addr().1,
                "codec": codec.name,
            })))
            .await;
        metrics::counter!("voxsip_calls_total", "direction" => "inbound").increment(1);
        info!(call_id = %call_id, from = %from.uri, codec = codec.name, "Inbound call answered");

        let weak_ctx: Weak<ServerContext> = Arc::downgrade(ctx);
        let weak_session = Arc::downgrade(&session);
        session
            .set_on_disconnect(Box::new(move || {
                Box::pin(async move {
                    if let (Some(ctx), Some(session)) = (weak_ctx.upgrade(), weak_session.upgrade()) {
                        let _ = ctx.end_call(&session).await;
                    }
                })
            }))
            .await;

        let handler = ctx.handler().await;
        tokio::spawn(async move {
            if let Err(e) = handler
                .on_invite(session.clone(), from.uri.clone(), to.uri.clone())
                .await
            {
                let error = SipError::op("on_invite", session.call_id(), SipError::Internal(e.to_string()));
                session.report_error(error.clone()).await;
                handler.on_error(session, error).await;
            }
        });
        Ok(())
    }

    /// Hold, resume, codec change or media redirect on a live call
    async fn handle_reinvite(&self, session: Arc<Session>, inbound: InboundRequest) -> Result<(), SipError> {
        let ctx = &self.ctx;
        info!(call_id = %session.call_id(), "re-INVITE received");
        if !validate_in_dialog(ctx, &session, &inbound).await? {
            return Ok(());
        }

        let body = inbound.request.body();
        if body.iter().all(u8::is_ascii_whitespace) {
            debug!(call_id = %session.call_id(), "Session refresh");
            return answer_with_sdp(ctx, &session, &inbound).await;
        }

        match parse_sdp(body) {
            Ok(info) => {
                apply_media_update(&session, &info).await;
                answer_with_sdp(ctx, &session, &inbound).await
            }
            Err(e) => {
                warn!(call_id = %session.call_id(), error = %e, "Bad re-INVITE SDP");
                ctx.respond(&inbound, ResponseBuilder::new(488)).await
            }
        }
    }
}

#[async_trait]
impl SipHandler for InviteHandler {
    async fn handle_request(&self, inbound: InboundRequest) -> Result<(), SipError> {
        let Some(call_id) = inbound.request.call_id() else {
            return self.ctx.respond(&inbound, ResponseBuilder::new(400)).await;
        };
        match self.ctx.get_session(&call_id).await {
            Some(session) => self.handle_reinvite(session, inbound).await,
            None => self.handle_invite(inbound, call_id).await,
        }
    }
}

/// ACK handler
pub struct AckHandler {
    ctx: Arc<ServerContext>,
}

impl AckHandler {
    pub(crate) fn new(ctx: Arc<ServerContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl SipHandler for AckHandler {
    async fn handle_request(&self, inbound: InboundRequest) -> Result<(), SipError> {
        let session = match inbound.request.call_id() {
            Some(call_id) => self.ctx.get_session(&call_id).await,
            None => None,
        };
        let Some(session) = session else {
            debug!(call_id = ?inbound.request.call_id(), "ACK for unknown session");
            return Ok(());
        };

        if let Some(dialog) = session.dialog().await {
            dialog.read_ack(&inbound.request).await;
        }
        if matches!(
            session.state().await,
            CallState::Initializing | CallState::Ringing
        ) {
            let _ = session.transition(CallState::Connected).await;
        }
        Ok(())
    }
}

/// BYE handler
pub struct ByeHandler {
    ctx: Arc<ServerContext>,
}

impl ByeHandler {
    pub(crate) fn new(ctx: Arc<ServerContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl SipHandler for ByeHandler {
    async fn handle_request(&self, inbound: InboundRequest) -> Result<(), SipError> {
        let ctx = &self.ctx;
        let session = match inbound.request.call_id() {
            Some(call_id) => ctx.get_session(&call_id).await,
            None => None,
        };
        let Some(session) = session else {
            debug!(call_id = ?inbound.request.call_id(), "BYE for unknown session");
            return ctx.respond(&inbound, ResponseBuilder::new(481)).await;
        };
        if !validate_in_dialog(ctx, &session, &inbound).await? {
            return Ok(());
        }
        info!(call_id = %session.call_id(), direction = %session.direction(), "BYE received");

        let dialog = session.dialog().await;
        match session.direction() {
            CallDirection::Outbound => {
                // the outbound call task sees this and owns teardown
                session.notify_bye();
                if let Some(dialog) = &dialog {
                    dialog.terminate();
                }
                ctx.respond(&inbound, ResponseBuilder::ok()).await?;
            }
            CallDirection::Inbound => {
                if let Some(dialog) = &dialog {
                    dialog.terminate();
                }
                session.notify_bye();
                ctx.respond(&inbound, ResponseBuilder::ok()).await?;
                ctx.teardown(&session).await;
            }
        }

        ctx.handler().await.on_bye(session).await;
        Ok(())
    }
}

/// CANCEL handler
pub struct CancelHandler {
    ctx: Arc<ServerContext>,
}

impl CancelHandler {
    pub(crate) fn new(ctx: Arc<ServerContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl SipHandler for CancelHandler {
    async fn handle_request(&self, inbound: InboundRequest) -> Result<(), SipError> {
        let ctx = &self.ctx;
        let session = match inbound.request.call_id() {
            Some(call_id) => ctx.get_session(&call_id).await,
            None => None,
        };
        let Some(session) = session else {
            return ctx.respond(&inbound, ResponseBuilder::new(481)).await;
        };

        info!(call_id = %session.call_id(), "CANCEL received");
        if let Some(dialog) = session.dialog().await {
            dialog.terminate();
        }
        ctx.teardown(&session).await;
        ctx.handler().await.on_cancel(session).await;
        ctx.respond(&inbound, ResponseBuilder::ok()).await
    }
}

/// UPDATE handler: media renegotiation that may carry no body
pub struct UpdateHandler {
    ctx: Arc<ServerContext>,
}

impl UpdateHandler {
    pub(crate) fn new(ctx: Arc<ServerContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl SipHandler for UpdateHandler {
    async fn handle_request(&self, inbound: InboundRequest) -> Result<(), SipError> {
        let ctx = &self.ctx;
        let session = match inbound.request.call_id() {
            Some(call_id) => ctx.get_session(&call_id).await,
            None => None,
        };
        let Some(session) = session else {
            return ctx.respond(&inbound, ResponseBuilder::ok()).await;
        };
        if !validate_in_dialog(ctx, &session, &inbound).await? {
            return Ok(());
        }

        let body = inbound.request.body();
        if !body.iter().all(u8::is_ascii_whitespace) {
            match parse_sdp(body) {
                Ok(info) => {
                    apply_media_update(&session, &info).await;
                }
                Err(e) => debug!(call_id = %session.call_id(), error = %e, "UPDATE SDP ignored"),
            }
        }
        answer_with_sdp(ctx, &session, &inbound).await
    }
}

/// Accepts a method without acting on it
pub struct AcceptHandler {
    ctx: Arc<ServerContext>,
}

impl AcceptHandler {
    pub(crate) fn new(ctx: Arc<ServerContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl SipHandler for AcceptHandler {
    async fn handle_request(&self, inbound: InboundRequest) -> Result<(), SipError> {
        debug!(method = %inbound.request.method(), "Accepted without action");
        self.ctx.respond(&inbound, ResponseBuilder::ok()).await
    }
}

/// Declines a method with a fixed status
pub struct DeclineHandler {
    ctx: Arc<ServerContext>,
    code: u16,
}

impl DeclineHandler {
    pub(crate) fn new(ctx: Arc<ServerContext>, code: u16) -> Self {
        Self { ctx, code }
    }
}

#[async_trait]
impl SipHandler for DeclineHandler {
    async fn handle_request(&self, inbound: InboundRequest) -> Result<(), SipError> {
        debug!(method = %inbound.request.method(), code = self.code, "Declined");
        self.ctx
            .respond(&inbound, ResponseBuilder::new(self.code))
            .await
    }
}
