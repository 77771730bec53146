//! Outbound calls
//!
//! [`Server::make_call`] sets up media and sends the INVITE, then hands the
//! rest of the call to a task that waits for the answer, starts RTP, ACKs,
//! and finally watches for the end of the call.
//!
//! ```text
//! allocate port -> bind RTP -> INVITE (all codecs)
//!     -> 1xx: Ringing
//!     -> 401/407: one digest retry
//!     -> 2xx: answer SDP -> negotiated codec -> RTP start -> ACK -> on_invite
//!     -> other/timeout: Failed, resources released
//! ```

use super::auth::DigestCredentials;
use super::builder::generate_tag;
use super::dialog::{resolve_uri, ClientDialog, ClientDialogConfig};
use super::message::{NameAddr, SipError, SipResponse};
use super::sdp::{default_sdp_config, generate_sdp, parse_sdp};
use super::server::{uri_host, Server, ServerContext, ServerState};
use super::session::{Session, SessionConfig};
use super::tenant::SipConfig;
use super::transaction::ClientTransaction;
use super::transport::TransportProtocol;
use crate::domain::call::{CallDirection, CallEvent, CallState, EventType};
use crate::infrastructure::media::codec::PCMU;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const FROM_TAG_LEN: usize = 16;

/// `sip(s):{to}@{server}:{port}`, or `to` itself when it already is a SIP URI
pub(crate) fn request_uri(config: &SipConfig, to: &str) -> String {
    if to.starts_with("sip:") || to.starts_with("sips:") {
        return to.to_string();
    }
    let mut uri = format!(
        "{}:{}@{}:{}",
        config.transport.scheme(),
        to,
        uri_host(&config.server),
        config.port
    );
    if config.transport != TransportProtocol::Udp {
        uri.push_str(&format!(";transport={}", config.transport.param()));
    }
    uri
}

/// From header: display = `from`, user = caller ID or username, fresh tag
pub(crate) fn local_identity(config: &SipConfig, from: &str) -> NameAddr {
    let user = if config.caller_id.is_empty() {
        &config.username
    } else {
        &config.caller_id
    };
    let display = (!from.is_empty()).then(|| from.to_string());
    NameAddr::new(
        display,
        format!("{}:{}@{}", config.transport.scheme(), user, uri_host(config.sip_domain())),
    )
    .with_tag(&generate_tag(FROM_TAG_LEN))
}

impl Server {
    /// Originate a call to `to`
    ///
    /// Returns once the INVITE is on the wire. The session is `Failed` if
    /// the call is not answered, `Connected` after the ACK.
    pub async fn make_call(
        &self,
        config: SipConfig,
        to: &str,
        from: &str,
        metadata: HashMap<String, serde_json::Value>,
    ) -> Result<Arc<Session>, SipError> {
        if self.state() != ServerState::Running {
            return Err(SipError::InvalidConfig("server is not running".to_string()));
        }
        let ctx = self.context().clone();

        let session = Arc::new(Session::new(
            SessionConfig::new(config.clone(), CallDirection::Outbound),
            &ctx.cancel,
        )?);
        for (key, value) in metadata {
            session.set_metadata(key, value).await;
        }

        if let Err(e) = ctx.create_rtp(&session, PCMU).await {
            session.end().await;
            return Err(e);
        }

        match Self::send_invite(&ctx, &session, &config, to, from).await {
            Ok((dialog, txn)) => {
                metrics::counter!("voxsip_calls_total", "direction" => "outbound").increment(1);
                tokio::spawn(run_outbound(ctx, session.clone(), dialog, txn));
                Ok(session)
            }
            Err(e) => {
                warn!(call_id = %session.call_id(), error = %e, "INVITE not sent");
                let _ = session.transition(CallState::Failed).await;
                ctx.teardown(&session).await;
                Err(e)
            }
        }
    }

    async fn send_invite(
        ctx: &Arc<ServerContext>,
        session: &Arc<Session>,
        config: &SipConfig,
        to: &str,
        from: &str,
    ) -> Result<(Arc<ClientDialog>, ClientTransaction), SipError> {
        let uri = request_uri(config, to);
        let local = local_identity(config, from);
        let remote = NameAddr::new(None, uri.clone());
        let destination = resolve_uri(&uri, config.transport).await?;
        let user = local.user().unwrap_or("voxsip").to_string();

        let credentials = DigestCredentials {
            username: config.username.clone(),
            password: config.password.clone(),
            realm: (!config.realm.is_empty()).then(|| config.realm.clone()),
        };
        let dialog = Arc::new(ClientDialog::new(
            ctx.layer.clone(),
            ClientDialogConfig {
                call_id: session.call_id().to_string(),
                request_uri: uri.clone(),
                local: local.clone(),
                remote: remote.clone(),
                contact: ctx.contact_uri(&user),
                sent_by: ctx.sent_by(),
                destination,
                protocol: config.transport,
                credentials: Some(credentials),
                invite_timeout: config.invite_timeout(),
            },
        ));

        session.set_uris(local.uri.clone(), remote.uri.clone()).await;
        session.set_dialog(dialog.clone()).await;
        ctx.insert_session(session.clone()).await;

        let rtp = session
            .rtp_handler()
            .await
            .ok_or(SipError::RtpNotInitialized)?;
        let offer = generate_sdp(&default_sdp_config(ctx.external_ip(), rtp.local_addr().1));
        let txn = dialog.invite(&offer).await?;

        info!(
            call_id = %session.call_id(),
            to = %uri,
            dest = %destination,
            transport = %config.transport,
            "Outbound call started"
        );
        Ok((dialog, txn))
    }
}

/// Drive one outbound call from INVITE to teardown
async fn run_outbound(
    ctx: Arc<ServerContext>,
    session: Arc<Session>,
    dialog: Arc<ClientDialog>,
    txn: ClientTransaction,
) {
    let call_id = session.call_id().to_string();
    let handler = ctx.handler().await;

    let ringing = session.clone();
    let answer = dialog
        .wait_answer(txn, move |response: &SipResponse| {
            let session = ringing.clone();
            let code = response.status_code();
            async move {
                if matches!(code, 180 | 183) {
                    let _ = session.transition(CallState::Ringing).await;
                }
            }
        })
        .await;

    let answer = match answer {
        Ok(answer) => answer,
        Err(e) => {
            match &e {
                SipError::AuthenticationFailed { code } => {
                    warn!(call_id = %call_id, code, reason = "auth", "Outbound call failed")
                }
                SipError::Rejected { code, reason: phrase } => {
                    warn!(call_id = %call_id, code, phrase = %phrase, reason = "rejected", "Outbound call failed")
                }
                other => warn!(call_id = %call_id, error = %other, "Outbound call failed"),
            }
            if let SipError::Rejected { code, .. } | SipError::AuthenticationFailed { code } = &e {
                metrics::counter!("voxsip_calls_rejected_total", "code" => code.to_string())
                    .increment(1);
            }
            let _ = session.transition(CallState::Failed).await;
            let error = SipError::op("invite", &call_id, e);
            session.report_error(error.clone()).await;
            handler.on_error(session.clone(), error).await;
            ctx.teardown(&session).await;
            return;
        }
    };

    if session.is_ended() || session.is_bye_received() {
        debug!(call_id = %call_id, "Call ended before it was answered");
        ctx.teardown(&session).await;
        return;
    }

    session.set_remote_tag(dialog.remote_tag().await).await;
    match parse_sdp(answer.body()) {
        Ok(info) => {
            if info.has_media_target() {
                match info.connection_ip.parse::<IpAddr>() {
                    Ok(ip) => session.set_remote_rtp(ip, info.audio_port).await,
                    Err(_) => warn!(call_id = %call_id, ip = %info.connection_ip, "Answer address unusable"),
                }
            }
            session.set_codec(info.preferred_codec).await;
        }
        Err(e) => warn!(call_id = %call_id, error = %e, "Answer without usable SDP, keeping PCMU"),
    }

    // media must be flowing before the dialog is confirmed
    let codec = session.codec().await;
    if let Some(rtp) = session.rtp_handler().await {
        rtp.start().await;
        session
            .emit(CallEvent::new(EventType::RtpStarted, &call_id).with_data(serde_json::json!({
                "local_port": rtp.local_addr().1,
                "codec": codec.name,
            })))
            .await;
    }

    if let Err(e) = dialog.ack().await {
        warn!(call_id = %call_id, error = %e, "ACK failed, abandoning call");
        let _ = session.transition(CallState::Failed).await;
        let error = SipError::op("ack", &call_id, e);
        session.report_error(error.clone()).await;
        handler.on_error(session.clone(), error).await;
        ctx.teardown(&session).await;
        return;
    }
    let _ = session.transition(CallState::Connected).await;
    info!(call_id = %call_id, codec = codec.name, "Outbound call connected");

    let info = session.info().await;
    let app_session = session.clone();
    tokio::spawn(async move {
        if let Err(e) = handler
            .on_invite(app_session.clone(), info.local_uri, info.remote_uri)
            .await
        {
            let error = SipError::op(
                "on_invite",
                app_session.call_id(),
                SipError::Internal(e.to_string()),
            );
            app_session.report_error(error.clone()).await;
            handler.on_error(app_session, error).await;
        }
    });

    watch_outbound(&ctx, &session, session.config().session_timeout()).await;
}

/// Wait for the end of the call, then release everything
///
/// A zero `max_duration` means no limit.
async fn watch_outbound(ctx: &ServerContext, session: &Session, max_duration: Duration) {
    let call_id = session.call_id();
    let limit = async {
        if max_duration.is_zero() {
            futures::future::pending::<()>().await
        } else {
            tokio::time::sleep(max_duration).await
        }
    };
    tokio::select! {
        _ = session.ended() => {}
        _ = ctx.cancel.cancelled() => {}
        _ = session.bye_received() => {
            let grace = ctx.timing.outbound_bye_grace();
            if tokio::time::timeout(grace, session.ended()).await.is_err() {
                warn!(call_id = %call_id, grace_secs = grace.as_secs(), "Session not ended after BYE, forcing teardown");
            }
        }
        _ = limit => {
            info!(call_id = %call_id, "Session timeout reached, hanging up");
            let _ = ctx.end_call(session).await;
        }
    }
    ctx.teardown(session).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ListenConfig, SipTimingConfig};
    use crate::infrastructure::media::rtp::{MemoryPortStore, PortAllocator};
    use crate::infrastructure::protocols::sip::builder::ResponseBuilder;
    use crate::infrastructure::protocols::sip::handler::MockCallHandler;
    use crate::infrastructure::protocols::sip::message::SipRequest;
    use crate::infrastructure::protocols::sip::middleware::{resolver_fn, InviteResult};
    use crate::infrastructure::protocols::sip::transaction::{SipTimers, TransactionLayer};
    use crate::infrastructure::protocols::sip::transport::{OutgoingMessage, Transport, TransportSet};
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::net::SocketAddr;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    /// Passes every message to the test except ACKs, which fail
    struct AckDroppingTransport {
        sent: mpsc::UnboundedSender<Bytes>,
    }

    #[async_trait]
    impl Transport for AckDroppingTransport {
        fn protocol(&self) -> TransportProtocol {
            TransportProtocol::Udp
        }

        fn local_addr(&self) -> SocketAddr {
            SocketAddr::from(([127, 0, 0, 1], 5060))
        }

        async fn send(&self, message: OutgoingMessage) -> Result<(), SipError> {
            if message.data.starts_with(b"ACK ") {
                return Err(SipError::Transport("send buffer full".to_string()));
            }
            let _ = self.sent.send(message.data);
            Ok(())
        }
    }

    fn tenant() -> SipConfig {
        SipConfig {
            server: "pbx.example.com".into(),
            port: 5080,
            username: "1001".into(),
            password: "secret".into(),
            ..SipConfig::default()
        }
    }

    #[test]
    fn test_request_uri() {
        assert_eq!(request_uri(&tenant(), "+15551234"), "sip:+15551234@pbx.example.com:5080");

        let tcp = SipConfig {
            transport: TransportProtocol::Tcp,
            ..tenant()
        };
        assert_eq!(
            request_uri(&tcp, "bob"),
            "sip:bob@pbx.example.com:5080;transport=tcp"
        );

        let tls = SipConfig {
            transport: TransportProtocol::Tls,
            ..tenant()
        };
        assert_eq!(
            request_uri(&tls, "bob"),
            "sips:bob@pbx.example.com:5080;transport=tls"
        );

        assert_eq!(request_uri(&tenant(), "sip:alice@10.0.0.1"), "sip:alice@10.0.0.1");
    }

    #[test]
    fn test_local_identity() {
        let from = local_identity(&tenant(), "Voice Bot");
        assert_eq!(from.display.as_deref(), Some("Voice Bot"));
        assert_eq!(from.uri, "sip:1001@pbx.example.com");
        assert_eq!(from.tag().map(str::len), Some(FROM_TAG_LEN));

        let config = SipConfig {
            caller_id: "+15550000".into(),
            domain: "tenant.example.com".into(),
            ..tenant()
        };
        let from = local_identity(&config, "");
        assert_eq!(from.display, None);
        assert_eq!(from.uri, "sip:+15550000@tenant.example.com");
        assert_ne!(
            local_identity(&config, "").tag(),
            from.tag(),
            "each call gets a fresh tag"
        );
    }

    #[tokio::test]
    async fn test_failed_ack_abandons_call() {
        let (sent_tx, mut sent) = mpsc::unbounded_channel();
        let layer = Arc::new(TransactionLayer::new(
            TransportSet::from_transports(Arc::new(AckDroppingTransport { sent: sent_tx }), None),
            SipTimers::default(),
        ));
        let allocator =
            Arc::new(PortAllocator::new(Arc::new(MemoryPortStore::new()), 33500, 33520).unwrap());
        allocator.init().await.unwrap();
        let ctx = Arc::new(ServerContext::new(
            ListenConfig {
                address: "127.0.0.1".to_string(),
                ..ListenConfig::default()
            },
            SipTimingConfig::default(),
            layer.clone(),
            allocator.clone(),
            Arc::new(resolver_fn(|_| Ok(InviteResult::allow(SipConfig::default())))),
            CancellationToken::new(),
        ));

        let (error_tx, mut errors) = mpsc::unbounded_channel();
        let mut handler = MockCallHandler::new();
        handler.expect_on_invite().never();
        handler.expect_on_error().times(1).returning(move |_, error| {
            let _ = error_tx.send(error.to_string());
        });
        ctx.set_handler(Arc::new(handler)).await;

        let config = SipConfig {
            server: "127.0.0.1".into(),
            port: 5070,
            ..tenant()
        };
        let session = Arc::new(
            Session::new(SessionConfig::new(config.clone(), CallDirection::Outbound), &ctx.cancel)
                .unwrap(),
        );
        ctx.create_rtp(&session, PCMU).await.unwrap();
        let (dialog, txn) = Server::send_invite(&ctx, &session, &config, "bob", "")
            .await
            .unwrap();
        let call = tokio::spawn(run_outbound(ctx.clone(), session.clone(), dialog, txn));

        let invite = SipRequest::parse(&sent.recv().await.unwrap()).unwrap();
        let ok = ResponseBuilder::ok()
            .to_tag("bob1")
            .contact("sip:bob@127.0.0.1:5070")
            .build_for_request(&invite);
        assert!(layer.dispatch_response(ok).await);

        tokio::time::timeout(Duration::from_secs(5), call)
            .await
            .unwrap()
            .unwrap();
        assert!(errors.recv().await.unwrap().contains("ack"));
        assert_eq!(session.state().await, CallState::Failed);
        assert!(session.is_ended());
        assert_eq!(ctx.session_count().await, 0);
        assert_eq!(allocator.held_count().await, 0);
    }
}
