use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::app_context::AppContext;
use crate::server::{build_router, ServeState};

#[derive(Args, Clone, Debug)]
pub struct ServeArgs {
    /// Address to bind (defaults to http.bind)
    #[arg(long)]
    pub bind: Option<IpAddr>,

    /// Port to listen on (defaults to http.port)
    #[arg(long)]
    pub port: Option<u16>,

    /// Launch this many registry instances before serving
    #[arg(long, default_value_t = 0)]
    pub instances: u32,
}

pub async fn cmd_serve(args: ServeArgs, ctx: Arc<AppContext>) -> Result<()> {
    let bind = match args.bind {
        Some(bind) => bind,
        None => ctx
            .config()
            .http
            .bind
            .parse()
            .with_context(|| format!("invalid http.bind {}", ctx.config().http.bind))?,
    };
    let port = args.port.unwrap_or(ctx.config().http.port);
    let addr = SocketAddr::new(bind, port);

    let warmup = Arc::clone(&ctx);
    let instances = args.instances;
    tokio::task::spawn_blocking(move || -> Result<()> {
        for _ in 0..instances {
            warmup.launch_instance(None)?;
        }
        warmup.start_health_monitor()?;
        Ok(())
    })
    .await
    .context("instance warmup panicked")??;

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind control API on {addr}"))?;
    info!(target: "cdpctl-http", %addr, "control API listening");

    let router = build_router(ServeState::new(Arc::clone(&ctx)));
    let served = axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("control API exited unexpectedly");

    let cleanup = Arc::clone(&ctx);
    if let Err(err) = tokio::task::spawn_blocking(move || cleanup.shutdown()).await {
        warn!(?err, "cleanup after serve failed");
    }
    served
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(?err, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!(target: "cdpctl-http", "shutdown requested");
}
