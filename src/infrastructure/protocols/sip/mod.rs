//! SIP protocol implementation
//!
//! A user agent (UAC and UAS) built on RFC 3261, with `rsip` doing the
//! message parsing.
//!
//! Architecture:
//! ```text
//! ┌─────────────────────────┐
//! │   Server / Session      │
//! │ (dispatch, MakeCall)    │
//! └───────────┬─────────────┘
//!             │
//! ┌───────────▼─────────────┐
//! │    Dialog Layer         │
//! │ (ClientDialog, Server-  │
//! │  Dialog)                │
//! └───────────┬─────────────┘
//!             │
//! ┌───────────▼─────────────┐
//! │   Transaction Layer     │
//! │ (retransmission, cache) │
//! └───────────┬─────────────┘
//!             │
//! ┌───────────▼─────────────┐
//! │   Transport Layer       │
//! │      (UDP, TCP)         │
//! └─────────────────────────┘
//! ```

pub mod auth;
pub mod builder;
pub mod call_handler;
pub mod dialog;
pub mod handler;
pub mod message;
pub mod middleware;
pub mod outbound;
pub mod rport;
pub mod sdp;
pub mod server;
pub mod session;
pub mod tenant;
pub mod transaction;
pub mod transport;

pub use auth::{DigestChallenge, DigestCredentials};
pub use call_handler::{
    AckHandler, ByeHandler, CancelHandler, InviteHandler, UpdateHandler,
};
pub use dialog::{ClientDialog, DialogHandle, ServerDialog};
pub use handler::{CallHandler, NoopCallHandler, SipHandler};
pub use message::{NameAddr, SipError, SipMessage, SipMethod, SipRequest, SipResponse};
pub use middleware::{
    resolver_fn, ConfigResolver, CredentialMiddleware, InviteResult, Middleware,
    MiddlewareChain, Next, RequestExtra, SipRequestContext,
};
pub use sdp::{generate_sdp, is_hold, parse_sdp, SdpConfig, SdpDirection, SdpMediaInfo};
pub use server::{Server, ServerState};
pub use session::{Session, SessionConfig, SessionInfo};
pub use tenant::SipConfig;
pub use transaction::{InboundRequest, SipTimers, TransactionLayer};
pub use transport::{Transport, TransportProtocol};
