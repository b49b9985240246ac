//! Server backend for a collaborative text-editing coordination service.
//!
//! Multiple clients connect over raw TCP, subscribe to shared text
//! documents, and stream edits that the server serializes, persists, and
//! fans out so every subscriber converges on the same content. See
//! [`hub::Hub`] for the router and [`connection::handle_connection`] for
//! the per-session driver.

#![forbid(unsafe_code)]

use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::error;

pub mod config;
pub mod connection;
pub mod doc;
pub mod hub;
pub mod patch;
pub mod persist;
pub mod protocol;
pub mod session;

pub use hub::{Hub, HubConfig};

/// Accepts connections on `listener` forever, spawning one
/// [`connection::handle_connection`] task per peer.
pub async fn serve(hub: Arc<Hub>, listener: TcpListener) {
    loop {
        let (stream, peer_addr) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                error!("accept failed: {e}");
                continue;
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            error!("failed to set TCP_NODELAY on {peer_addr}: {e}");
        }
        let hub = Arc::clone(&hub);
        tokio::spawn(async move {
            connection::handle_connection(hub, stream, peer_addr).await;
        });
    }
}
