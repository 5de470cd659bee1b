use std::net::SocketAddr;

use anyhow::Result;
use clap::Parser;

use keygate_common::{AppConfigPatch, hash_proxy_key};
use keygate_router::{health_router, proxy_router};

#[derive(Debug, Parser)]
#[command(name = "keygate", version, about = "Credential-rotating proxy for LLM upstreams")]
struct Args {
    #[arg(long, env = "HOST")]
    host: Option<String>,
    #[arg(long, env = "PORT")]
    port: Option<u16>,
    /// sqlite path DSN, mysql://, or postgres://
    #[arg(long, env = "DATABASE_DSN")]
    database_dsn: Option<String>,
    /// redis:// bus for multi-instance cache coherence; omit for embedded.
    #[arg(long, env = "BUS_DSN")]
    bus_dsn: Option<String>,
    #[arg(long, env = "APP_URL")]
    app_url: Option<String>,
    /// Proxy-route key; omitting it disables proxy auth.
    #[arg(long, env = "AUTH_KEY")]
    auth_key: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "keygate=info,keygate_core=info,keygate_store=info".into()),
        )
        .init();

    let args = Args::parse();
    let mut patch = AppConfigPatch::default();
    patch.overlay(AppConfigPatch {
        host: args.host,
        port: args.port,
        dsn: args.database_dsn,
        bus_dsn: args.bus_dsn,
        app_url: args.app_url,
        auth_key_hash: args.auth_key.as_deref().map(hash_proxy_key),
    });
    let config = patch.into_config()?;

    let runtime = keygate_core::bootstrap(config.clone()).await?;

    let app = axum::Router::new()
        .merge(proxy_router(
            runtime.engine.clone(),
            config.auth_key_hash.clone(),
        ))
        .merge(health_router());

    let bind = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&bind).await?;
    tracing::info!(%bind, "listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    runtime.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
