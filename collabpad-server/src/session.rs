//! Per-connection state: identity, subscriptions, liveness, and the
//! single-writer send path.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex as SyncMutex;

use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::Instant;

use crate::protocol::ServerEvent;

#[derive(Debug)]
pub struct SendError;

pub struct Session {
    pub id: String,
    pub peer_addr: SocketAddr,
    name: SyncMutex<String>,
    hello_received: AtomicBool,
    alive: AtomicBool,
    subscriptions: SyncMutex<HashSet<String>>,
    last_seen: SyncMutex<Instant>,
    writer: AsyncMutex<OwnedWriteHalf>,
}

impl Session {
    pub fn new(id: String, peer_addr: SocketAddr, writer: OwnedWriteHalf) -> Self {
        Self {
            id,
            peer_addr,
            name: SyncMutex::new("anon".to_string()),
            hello_received: AtomicBool::new(false),
            alive: AtomicBool::new(true),
            subscriptions: SyncMutex::new(HashSet::new()),
            last_seen: SyncMutex::new(Instant::now()),
            writer: AsyncMutex::new(writer),
        }
    }

    pub fn name(&self) -> String {
        self.name.lock().unwrap().clone()
    }

    pub fn set_name(&self, name: String) {
        *self.name.lock().unwrap() = name;
    }

    pub fn hello_received(&self) -> bool {
        self.hello_received.load(Ordering::Acquire)
    }

    pub fn set_hello_received(&self) {
        self.hello_received.store(true, Ordering::Release);
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    pub fn touch(&self) {
        *self.last_seen.lock().unwrap() = Instant::now();
    }

    pub fn idle_for(&self) -> std::time::Duration {
        self.last_seen.lock().unwrap().elapsed()
    }

    pub fn add_subscription(&self, doc_id: String) {
        self.subscriptions.lock().unwrap().insert(doc_id);
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.subscriptions.lock().unwrap().iter().cloned().collect()
    }

    /// Encodes `event` as one JSON line and writes it atomically with
    /// respect to every other concurrent sender of this session. A write
    /// error flips the session dead and is reported to the caller, which
    /// must unregister it.
    pub async fn send(&self, event: &ServerEvent) -> Result<(), SendError> {
        if !self.is_alive() {
            return Err(SendError);
        }
        let line = event.to_line().map_err(|_| SendError)?;
        let mut writer = self.writer.lock().await;
        if let Err(_) = writer.write_all(line.as_bytes()).await {
            self.alive.store(false, Ordering::Release);
            return Err(SendError);
        }
        Ok(())
    }

    /// Idempotent: shuts down and closes the socket, swallowing OS errors.
    pub async fn close(&self) {
        if !self.alive.swap(false, Ordering::AcqRel) {
            return;
        }
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }
}
