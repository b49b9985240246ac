use std::sync::Arc;

use clap::Parser;
use collabpad_server::config::Args;
use collabpad_server::{Hub, HubConfig};
use socket2::{Domain, Socket, Type};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| args.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let hub_config = HubConfig {
        snapshot_dir: args.snapshot_dir.clone(),
        oplog_dir: args.oplog_dir.clone(),
        snapshot_interval: args.snapshot_interval,
        heartbeat_timeout_secs: args.heartbeat_timeout,
    };
    let hub = match Hub::new(hub_config).await {
        Ok(hub) => Arc::new(hub),
        Err(e) => {
            tracing::error!("failed to initialize storage: {e}");
            std::process::exit(1);
        }
    };
    hub.spawn_watchdog();

    let addr: std::net::SocketAddr = format!("{}:{}", args.host, args.port)
        .parse()
        .unwrap_or_else(|_| panic!("invalid host/port: {}:{}", args.host, args.port));

    let listener = match bind_listener(addr, args.backlog) {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!("failed to bind {addr}: {e}");
            std::process::exit(1);
        }
    };

    info!("listening on {addr}");

    let serve_hub = Arc::clone(&hub);
    let accept_task = tokio::spawn(async move { collabpad_server::serve(serve_hub, listener).await });

    tokio::signal::ctrl_c().await.expect("failed to listen for ctrl-c");
    info!("shutting down");
    accept_task.abort();
    hub.shutdown().await;

    Ok(())
}

/// Binds a TCP listener with an explicit backlog. `tokio::net::TcpListener::bind`
/// hardcodes the backlog to 1024, so the configurable `backlog` flag requires
/// going through `socket2` directly.
fn bind_listener(addr: std::net::SocketAddr, backlog: u32) -> anyhow::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, None)?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog as i32)?;
    Ok(TcpListener::from_std(socket.into())?)
}
