//! Request middleware chain
//!
//! Each middleware may enrich the [`SipRequestContext`] and either continue via
//! [`Next::run`] or short-circuit with a rejection. The final
//! [`ConfigResolver`] produces the tenant [`SipConfig`] for the call.
//!
//! ```text
//! CredentialMiddleware -> auth -> tenant lookup -> final resolver
//! ```

use super::message::SipMethod;
use super::sdp::SdpMediaInfo;
use super::tenant::SipConfig;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// Authenticated caller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub id: String,
    pub project_id: Option<String>,
}

/// Resolved business entity the call is for (assistant, tenant, ...)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantEntity {
    pub id: String,
    pub name: String,
}

/// Secret material fetched for the call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultCredential {
    pub id: String,
    #[serde(skip_serializing)]
    pub secret: String,
}

/// State resolved by the chain and copied onto the session
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestExtra {
    pub auth: Option<Principal>,
    pub tenant: Option<TenantEntity>,
    pub credential: Option<VaultCredential>,
    pub attributes: BTreeMap<String, String>,
}

impl RequestExtra {
    /// Fill unset fields from `other`; attributes already present win
    pub fn merge(&mut self, other: RequestExtra) {
        if self.auth.is_none() {
            self.auth = other.auth;
        }
        if self.tenant.is_none() {
            self.tenant = other.tenant;
        }
        if self.credential.is_none() {
            self.credential = other.credential;
        }
        for (k, v) in other.attributes {
            self.attributes.entry(k).or_insert(v);
        }
    }
}

/// What the chain sees for one inbound request
#[derive(Debug, Clone)]
pub struct SipRequestContext {
    pub method: SipMethod,
    pub call_id: String,
    pub request_uri: String,
    pub from_uri: String,
    pub to_uri: String,
    pub sdp_info: Option<SdpMediaInfo>,
    /// Password part of the URI userinfo
    pub api_key: String,
    /// User part of the URI userinfo
    pub assistant_id: String,
    pub extra: RequestExtra,
}

impl SipRequestContext {
    pub fn new(method: SipMethod, call_id: impl Into<String>) -> Self {
        Self {
            method,
            call_id: call_id.into(),
            request_uri: String::new(),
            from_uri: String::new(),
            to_uri: String::new(),
            sdp_info: None,
            api_key: String::new(),
            assistant_id: String::new(),
            extra: RequestExtra::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct InviteResult {
    pub config: Option<SipConfig>,
    pub should_allow: bool,
    pub reject_code: u16,
    pub reject_msg: String,
    pub extra: RequestExtra,
}

impl InviteResult {
    pub fn reject(code: u16, msg: impl Into<String>) -> Self {
        Self {
            config: None,
            should_allow: false,
            reject_code: code,
            reject_msg: msg.into(),
            extra: RequestExtra::default(),
        }
    }

    pub fn allow(config: SipConfig) -> Self {
        Self::allow_with_extra(config, RequestExtra::default())
    }

    pub fn allow_with_extra(config: SipConfig, extra: RequestExtra) -> Self {
        Self {
            config: Some(config),
            should_allow: true,
            reject_code: 0,
            reject_msg: String::new(),
            extra,
        }
    }
}

/// Produces the tenant config for a request
#[async_trait]
pub trait ConfigResolver: Send + Sync {
    async fn resolve(&self, ctx: &mut SipRequestContext) -> anyhow::Result<InviteResult>;
}

#[async_trait]
pub trait Middleware: Send + Sync {
    async fn handle(
        &self,
        ctx: &mut SipRequestContext,
        next: Next<'_>,
    ) -> anyhow::Result<InviteResult>;
}

/// The rest of the chain
pub struct Next<'a> {
    remaining: &'a [Arc<dyn Middleware>],
    last: &'a dyn ConfigResolver,
}

impl<'a> Next<'a> {
    pub async fn run(self, ctx: &mut SipRequestContext) -> anyhow::Result<InviteResult> {
        match self.remaining.split_first() {
            Some((first, rest)) => {
                first
                    .handle(
                        ctx,
                        Next {
                            remaining: rest,
                            last: self.last,
                        },
                    )
                    .await
            }
            None => self.last.resolve(ctx).await,
        }
    }
}

/// Middlewares run in order, then the final resolver
pub struct MiddlewareChain {
    middlewares: Vec<Arc<dyn Middleware>>,
    last: Arc<dyn ConfigResolver>,
}

impl MiddlewareChain {
    pub fn new(middlewares: Vec<Arc<dyn Middleware>>, last: Arc<dyn ConfigResolver>) -> Self {
        Self { middlewares, last }
    }
}

#[async_trait]
impl ConfigResolver for MiddlewareChain {
    async fn resolve(&self, ctx: &mut SipRequestContext) -> anyhow::Result<InviteResult> {
        Next {
            remaining: &self.middlewares,
            last: self.last.as_ref(),
        }
        .run(ctx)
        .await
    }
}

/// Closure-backed resolver
pub struct FnResolver<F>(F);

pub fn resolver_fn<F>(f: F) -> FnResolver<F>
where
    F: Fn(&SipRequestContext) -> anyhow::Result<InviteResult> + Send + Sync,
{
    FnResolver(f)
}

#[async_trait]
impl<F> ConfigResolver for FnResolver<F>
where
    F: Fn(&SipRequestContext) -> anyhow::Result<InviteResult> + Send + Sync,
{
    async fn resolve(&self, ctx: &mut SipRequestContext) -> anyhow::Result<InviteResult> {
        (self.0)(ctx)
    }
}

/// `sip:{assistantID}:{apiKey}@host` userinfo
pub fn parse_uri_credentials(uri: &str) -> Option<(String, String)> {
    let uri = uri.trim().trim_start_matches('<');
    let rest = uri
        .strip_prefix("sips:")
        .or_else(|| uri.strip_prefix("sip:"))?;
    let (userinfo, _) = rest.split_once('@')?;
    let (user, password) = userinfo.split_once(':')?;
    if user.is_empty() || password.is_empty() {
        return None;
    }
    Some((user.to_string(), password.to_string()))
}

/// Fills `assistant_id` and `api_key` from the Request-URI, else the To URI
///
/// A URI without credentials passes through untouched; later middleware
/// decides whether that is acceptable.
pub struct CredentialMiddleware;

#[async_trait]
impl Middleware for CredentialMiddleware {
    async fn handle(
        &self,
        ctx: &mut SipRequestContext,
        next: Next<'_>,
    ) -> anyhow::Result<InviteResult> {
        let parsed = parse_uri_credentials(&ctx.request_uri)
            .or_else(|| parse_uri_credentials(&ctx.to_uri));
        match parsed {
            Some((assistant_id, api_key)) => {
                ctx.assistant_id = assistant_id;
                ctx.api_key = api_key;
            }
            None => debug!(call_id = %ctx.call_id, "No credentials in SIP URI"),
        }
        next.run(ctx).await
    }
}
