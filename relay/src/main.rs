//! synclog relay
//!
//! Serves the sync protocol over WebSockets so clients behind NATs can
//! share one log per identity.
//!
//! Usage:
//!   synclog-relay --port 4010 --secret <secret> [--state ./relay-state]
//!                 [--backend upstream:4020] [--backend-listen 0.0.0.0:4020]

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use synclog_relay::{
    build_router, serve_backends, ActorStorage, BackendProvider, JournalBackends,
    MemoryActorStorage, MemoryBackends, RelayConfig, RelayHost, SqliteActorStorage,
    UpstreamBackends,
};
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    let config = RelayConfig::parse();
    let log_level = if config.verbose { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .compact()
        .init();

    info!("synclog relay starting...");
    let (storage, backends): (Arc<dyn ActorStorage>, Arc<dyn BackendProvider>) = match &config.state {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("creating state directory {}", dir.display()))?;
            let storage = SqliteActorStorage::open(dir.join("actors.db"))
                .context("opening actor storage")?;
            let backends = JournalBackends::new(dir.join("journals"))
                .context("preparing journal directory")?;
            (Arc::new(storage), Arc::new(backends))
        }
        None => (
            Arc::new(MemoryActorStorage::default()),
            Arc::new(MemoryBackends::default()),
        ),
    };

    let backends: Arc<dyn BackendProvider> = match &config.backend {
        Some(addr) => {
            info!(upstream = %addr, "using upstream backend");
            Arc::new(UpstreamBackends::new(addr.clone()))
        }
        None => backends,
    };

    if let Some(addr) = &config.backend_listen {
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("binding backend listener {addr}"))?;
        let provider = backends.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_backends(listener, provider).await {
                error!("backend listener failed: {e}");
            }
        });
    }

    let host = RelayHost::new(storage, backends);
    let app = build_router(host, config.secret.as_str());
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port))
        .await
        .with_context(|| format!("binding port {}", config.port))?;

    println!("\n========================================");
    println!("  synclog Relay Running");
    println!("========================================");
    println!("  Port:   {}", config.port);
    match &config.state {
        Some(dir) => println!("  State:  {}", dir.display()),
        None => println!("  State:  in memory"),
    }
    if let Some(addr) = &config.backend {
        println!("  Upstream: {addr}");
    }
    if let Some(addr) = &config.backend_listen {
        println!("  Backends: {addr}");
    }
    println!("  Sync:   ws://YOUR_PUBLIC_IP:{}/sync", config.port);
    println!("========================================\n");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server failed")?;
    info!("relay stopped");
    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_err() {
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}
