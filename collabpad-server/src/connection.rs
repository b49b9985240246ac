//! Per-session reader: pulls bytes off the socket, feeds the [`Framer`], and
//! hands parsed records to the [`Hub`]. One of these runs per accepted TCP
//! connection.

use std::net::SocketAddr;
use std::sync::Arc;

use serde_json::Value;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tracing::warn;

use crate::hub::Hub;
use crate::patch::ErrorCode;
use crate::protocol::{Framer, MAX_MESSAGE_BYTES, ServerEvent};

const READ_CHUNK: usize = 8192;

/// Drives one session end to end: splits the socket, registers a [`Session`]
/// with the hub, then loops reading and dispatching until the peer
/// disconnects or a protocol error closes the session.
pub async fn handle_connection(hub: Arc<Hub>, stream: TcpStream, peer_addr: SocketAddr) {
    let (mut reader, writer) = stream.into_split();
    let session = hub.register_session(writer, peer_addr);
    let mut framer = Framer::new(MAX_MESSAGE_BYTES);
    let mut buf = [0u8; READ_CHUNK];

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break, // peer closed cleanly
            Ok(n) => n,
            Err(e) => {
                warn!(session_id = %session.id, "read error: {e}");
                break;
            }
        };

        let records = match framer.feed(&buf[..n]) {
            Ok(records) => records,
            Err(e) => {
                warn!(session_id = %session.id, "framing error: {e}");
                let _ = session.send(&ServerEvent::error(ErrorCode::BadJson, None)).await;
                break;
            }
        };

        for record in records {
            let Value::Object(message) = record else {
                let _ = session.send(&ServerEvent::error(ErrorCode::BadJson, None)).await;
                hub.unregister_session(&session).await;
                return;
            };

            // Isolate each dispatch in its own task so a panic in routing
            // can never take the whole connection (or process) down
            // silently: we still owe the client a SERVER_ERROR reply.
            let dispatch_hub = Arc::clone(&hub);
            let dispatch_session = Arc::clone(&session);
            let result = tokio::spawn(async move {
                dispatch_hub.route_message(&dispatch_session, message).await;
            })
            .await;

            if let Err(join_err) = result {
                if join_err.is_panic() {
                    let payload = join_err.into_panic();
                    let reason = payload
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| payload.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "route handler panicked".to_string());
                    warn!(session_id = %session.id, "route handler panicked: {reason}");
                    let _ = session
                        .send(&ServerEvent::error(ErrorCode::ServerError, Some(reason)))
                        .await;
                    hub.unregister_session(&session).await;
                    return;
                }
            }
        }
    }

    hub.unregister_session(&session).await;
}
