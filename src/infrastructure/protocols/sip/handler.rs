//! Handler traits
//!
//! [`SipHandler`] answers one SIP method inside the server. [`CallHandler`] is
//! where the application attaches its voice pipeline; every method has a
//! no-op default so handlers implement only what they need.

use super::message::SipError;
use super::session::Session;
use super::transaction::InboundRequest;
use async_trait::async_trait;
use std::sync::Arc;

/// Per-method request handler
///
/// Handlers send their own responses. An `Err` means no final response was
/// sent and the server answers 500.
#[async_trait]
pub trait SipHandler: Send + Sync {
    async fn handle_request(&self, request: InboundRequest) -> Result<(), SipError>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CallHandler: Send + Sync {
    /// A call is established: inbound after the 200 OK, outbound after the ACK
    async fn on_invite(&self, _session: Arc<Session>, _from: String, _to: String) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_bye(&self, _session: Arc<Session>) {}

    async fn on_cancel(&self, _session: Arc<Session>) {}

    async fn on_error(&self, _session: Arc<Session>, _error: SipError) {}
}

/// Handler that ignores every event
pub struct NoopCallHandler;

impl CallHandler for NoopCallHandler {}
