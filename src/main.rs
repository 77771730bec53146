//! voxsip - SIP voice endpoint
//!
//! Answers every inbound call and echoes the caller's audio back. Intended
//! as a smoke-test endpoint; real deployments embed the library and supply
//! their own `ConfigResolver` and `CallHandler`.

use async_trait::async_trait;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use voxsip::config::AppConfig;
use voxsip::infrastructure::media::rtp::MemoryPortStore;
use voxsip::infrastructure::protocols::sip::middleware::{
    resolver_fn, CredentialMiddleware, InviteResult, MiddlewareChain,
};
use voxsip::{CallHandler, Server, Session, SipConfig, SipError};

#[derive(Parser, Debug)]
#[command(author, version, about = "SIP voice endpoint that echoes caller audio", long_about = None)]
struct Args {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Print the effective configuration and exit
    #[arg(long)]
    print_config: bool,
}

/// Loops caller audio back into the call
struct EchoHandler;

#[async_trait]
impl CallHandler for EchoHandler {
    async fn on_invite(&self, session: Arc<Session>, from: String, to: String) -> anyhow::Result<()> {
        info!(call_id = %session.call_id(), from = %from, to = %to, "Call established");
        let mut audio_in = session.audio_in().await?;
        let audio_out = session.audio_out().await?;
        tokio::spawn(async move {
            while let Some(frame) = audio_in.recv().await {
                if audio_out.send(frame).await.is_err() {
                    break;
                }
            }
        });
        Ok(())
    }

    async fn on_bye(&self, session: Arc<Session>) {
        let info = session.info().await;
        info!(call_id = %info.call_id, duration_secs = info.duration_secs, "Call ended by peer");
    }

    async fn on_cancel(&self, session: Arc<Session>) {
        info!(call_id = %session.call_id(), "Call cancelled");
    }

    async fn on_error(&self, session: Arc<Session>, error: SipError) {
        warn!(call_id = %session.call_id(), error = %error, "Call error");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = AppConfig::load(args.config.as_deref())?;

    if args.print_config {
        print!("{}", config.to_toml()?);
        return Ok(());
    }

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level)))
        .init();

    info!("Starting voxsip v{}", env!("CARGO_PKG_VERSION"));

    if let Some(listen) = &config.metrics.listen {
        let addr: std::net::SocketAddr = listen.parse()?;
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()?;
        info!(addr = %addr, "Prometheus exporter listening");
    }

    // every inbound call gets the engine's RTP range and no upstream account
    let rtp = config.rtp.clone();
    let resolver = MiddlewareChain::new(
        vec![Arc::new(CredentialMiddleware)],
        Arc::new(resolver_fn(move |ctx| {
            info!(
                call_id = %ctx.call_id,
                from = %ctx.from_uri,
                assistant_id = %ctx.assistant_id,
                "Accepting inbound call"
            );
            Ok(InviteResult::allow(SipConfig {
                rtp_port_range_start: rtp.port_range_start,
                rtp_port_range_end: rtp.port_range_end,
                ..SipConfig::default()
            }))
        })),
    );

    let server = Server::new(config.clone(), Arc::new(MemoryPortStore::new()), Arc::new(resolver)).await?;
    server.set_handler(Arc::new(EchoHandler)).await;
    server.start().await?;

    info!(
        addr = %server.local_addr(),
        transport = %config.listen.transport,
        "SIP server started"
    );

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    server.stop().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args() {
        let args = Args::try_parse_from(["voxsip", "-c", "voxsip.toml", "--print-config"]).unwrap();
        assert_eq!(args.config, Some(PathBuf::from("voxsip.toml")));
        assert!(args.print_config);

        let args = Args::try_parse_from(["voxsip"]).unwrap();
        assert!(args.config.is_none());
        assert!(!args.print_config);

        assert!(Args::try_parse_from(["voxsip", "--bogus"]).is_err());
    }
}
