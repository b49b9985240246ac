use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, anyhow};
use collabpad_server::{Hub, HubConfig};
use serde_json::Value;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::net::TcpStream;

/// A test client speaking the raw newline-JSON wire protocol directly,
/// standing in for the client-side diffing/socket plumbing this crate
/// treats as an external collaborator.
pub struct JsonLineClient {
    stream: TcpStream,
    buffer: Vec<u8>,
}

impl JsonLineClient {
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        Ok(Self { stream, buffer: Vec::new() })
    }

    pub async fn send(&mut self, msg: &Value) {
        let mut line = msg.to_string();
        line.push('\n');
        self.stream.write_all(line.as_bytes()).await.unwrap();
    }

    /// Writes raw bytes with no JSON encoding, for exercising framing
    /// errors (malformed lines, non-object top-level values).
    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.unwrap();
    }

    /// Reads until a complete newline-terminated JSON record is available
    /// and returns it, buffering any trailing bytes for the next call.
    pub async fn recv(&mut self) -> Result<Value> {
        loop {
            if let Some(idx) = self.buffer.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = self.buffer.drain(..=idx).collect();
                return Ok(serde_json::from_slice(&line[..line.len() - 1])?);
            }
            let mut chunk = [0u8; 4096];
            let n = self.stream.read(&mut chunk).await?;
            if n == 0 {
                return Err(anyhow!("connection closed"));
            }
            self.buffer.extend_from_slice(&chunk[..n]);
        }
    }

    pub async fn recv_closed(&mut self) -> Result<()> {
        let mut chunk = [0u8; 16];
        match self.stream.read(&mut chunk).await {
            Ok(0) => Ok(()),
            Ok(_) => Err(anyhow!("expected connection close, got data")),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn hello(&mut self, name: &str) -> Value {
        self.send(&serde_json::json!({"op": "HELLO", "name": name})).await;
        self.recv().await.unwrap()
    }

    pub async fn subscribe(&mut self, doc_id: &str) -> Value {
        self.send(&serde_json::json!({"op": "SUBSCRIBE", "docId": doc_id})).await;
        self.recv().await.unwrap()
    }
}

/// A running server instance bound to an ephemeral port, backed by
/// temporary snapshot/oplog directories.
pub struct TestServer {
    pub addr: SocketAddr,
    pub hub: Arc<Hub>,
    _storage: TempDir,
}

impl TestServer {
    pub async fn start() -> Result<Self> {
        Self::start_with(50, 120).await
    }

    pub async fn start_with(snapshot_interval: u64, heartbeat_timeout_secs: u64) -> Result<Self> {
        let storage = TempDir::new()?;
        let hub = Arc::new(
            Hub::new(HubConfig {
                snapshot_dir: storage.path().join("snapshots"),
                oplog_dir: storage.path().join("oplogs"),
                snapshot_interval,
                heartbeat_timeout_secs,
            })
            .await?,
        );
        hub.spawn_watchdog();

        let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0))).await?;
        let addr = listener.local_addr()?;
        let serve_hub = Arc::clone(&hub);
        tokio::spawn(async move { collabpad_server::serve(serve_hub, listener).await });

        Ok(Self { addr, hub, _storage: storage })
    }

    pub async fn connect(&self) -> Result<JsonLineClient> {
        JsonLineClient::connect(self.addr).await
    }
}

pub fn logging() {
    tracing_subscriber::fmt().without_time().try_init().ok();
}

pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(20)).await;
}
