//! The router: owns the session and document tables, dispatches incoming
//! messages, drives the edit pipeline, performs broadcast, and runs the
//! stale-session watchdog.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::{Map, Value};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{Mutex as AsyncMutex, Notify};
use tracing::{info, warn};

use crate::doc::DocState;
use crate::patch::{self, ErrorCode};
use crate::persist;
use crate::protocol::ServerEvent;
use crate::session::Session;

/// Background sweep interval for the watchdog.
const WATCHDOG_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct HubConfig {
    pub snapshot_dir: PathBuf,
    pub oplog_dir: PathBuf,
    pub snapshot_interval: u64,
    /// `0` disables the idle-timeout check.
    pub heartbeat_timeout_secs: u64,
}

impl HubConfig {
    pub fn normalized(mut self) -> Self {
        if self.snapshot_interval == 0 {
            self.snapshot_interval = 1;
        }
        self
    }
}

/// Process-wide coordination state: the only object with a non-trivial
/// lifecycle. Owns every session and document and every lock guarding them.
pub struct Hub {
    config: HubConfig,
    sessions: DashMap<String, Arc<Session>>,
    docs: DashMap<String, Arc<DocState>>,
    /// Serializes the slow path of `get_or_create_doc` (cold load from
    /// persistence) without blocking lookups of already-loaded documents.
    docs_construct_lock: AsyncMutex<()>,
    shutdown: Notify,
}

impl Hub {
    pub async fn new(config: HubConfig) -> anyhow::Result<Self> {
        let config = config.normalized();
        persist::ensure_storage(&config.snapshot_dir, &config.oplog_dir).await?;
        Ok(Self {
            config,
            sessions: DashMap::new(),
            docs: DashMap::new(),
            docs_construct_lock: AsyncMutex::new(()),
            shutdown: Notify::new(),
        })
    }

    /// Spawns the background watchdog task. Runs until [`Hub::shutdown`] is
    /// called.
    pub fn spawn_watchdog(self: &Arc<Self>) {
        let hub = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(WATCHDOG_INTERVAL);
            interval.tick().await; // first tick fires immediately
            loop {
                tokio::select! {
                    _ = interval.tick() => hub.sweep_stale_sessions().await,
                    _ = hub.shutdown.notified() => break,
                }
            }
        });
    }

    async fn sweep_stale_sessions(&self) {
        let heartbeat_timeout = self.config.heartbeat_timeout_secs;
        let stale: Vec<Arc<Session>> = self
            .sessions
            .iter()
            .filter(|entry| {
                let session = entry.value();
                !session.is_alive()
                    || (heartbeat_timeout > 0 && session.idle_for() > Duration::from_secs(heartbeat_timeout))
            })
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for session in stale {
            info!(session_id = %session.id, "session timeout");
            self.unregister_session(&session).await;
        }
    }

    /// Stops the watchdog and unregisters every live session.
    pub async fn shutdown(&self) {
        self.shutdown.notify_waiters();
        let sessions: Vec<Arc<Session>> = self.sessions.iter().map(|e| Arc::clone(e.value())).collect();
        for session in sessions {
            self.unregister_session(&session).await;
        }
    }

    pub fn register_session(&self, writer: OwnedWriteHalf, peer_addr: SocketAddr) -> Arc<Session> {
        let id = format!("S-{:08x}", rand::random::<u32>());
        let session = Arc::new(Session::new(id.clone(), peer_addr, writer));
        self.sessions.insert(id, Arc::clone(&session));
        info!(session_id = %session.id, %peer_addr, "session connected");
        session
    }

    /// Idempotent: removes the session from the table, drops it from every
    /// document it subscribed to, and closes its socket.
    pub async fn unregister_session(&self, session: &Arc<Session>) {
        if self.sessions.remove(&session.id).is_none() && !session.is_alive() {
            return;
        }
        for doc_id in session.subscriptions() {
            if let Some(doc) = self.docs.get(&doc_id) {
                doc.unsubscribe(&session.id).await;
            }
        }
        session.close().await;
        info!(session_id = %session.id, "session closed");
    }

    async fn get_or_create_doc(&self, doc_id: &str) -> Arc<DocState> {
        if let Some(doc) = self.docs.get(doc_id) {
            return Arc::clone(doc.value());
        }
        let _guard = self.docs_construct_lock.lock().await;
        if let Some(doc) = self.docs.get(doc_id) {
            return Arc::clone(doc.value());
        }
        let (content, version) =
            persist::load_doc_content(doc_id, &self.config.snapshot_dir, &self.config.oplog_dir).await;
        let doc = Arc::new(DocState::new(doc_id.to_string(), content, version));
        self.docs.insert(doc_id.to_string(), Arc::clone(&doc));
        doc
    }

    async fn max_version(&self) -> u64 {
        let mut max = 0;
        for entry in self.docs.iter() {
            let v = entry.value().version().await;
            if v > max {
                max = v;
            }
        }
        max
    }

    /// Entry point: dispatches one parsed record for `session`.
    pub async fn route_message(&self, session: &Arc<Session>, message: Map<String, Value>) {
        session.touch();
        let op = message.get("op").and_then(Value::as_str).unwrap_or("").to_ascii_uppercase();
        if op.is_empty() {
            self.send_error(session, ErrorCode::InvalidOp, Some("missing op".into())).await;
            return;
        }
        match op.as_str() {
            "HELLO" => self.handle_hello(session, &message).await,
            "SUBSCRIBE" => self.handle_subscribe(session, &message).await,
            "GET_SNAPSHOT" => self.handle_get_snapshot(session, &message).await,
            "INSERT" | "DELETE" | "REPLACE" => self.handle_edit(session, &message).await,
            "PING" => self.send_safe(session, ServerEvent::Pong {}).await,
            other => self.send_error(session, ErrorCode::UnknownOp, Some(other.to_string())).await,
        }
    }

    async fn handle_hello(&self, session: &Arc<Session>, message: &Map<String, Value>) {
        let name = message
            .get("name")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .unwrap_or("anon");
        session.set_name(name.to_string());
        session.set_hello_received();
        let server_version = self.max_version().await;
        self.send_safe(session, ServerEvent::Welcome { session_id: session.id.clone(), server_version }).await;
    }

    async fn handle_subscribe(&self, session: &Arc<Session>, message: &Map<String, Value>) {
        if !session.hello_received() {
            self.send_error(session, ErrorCode::NotReady, Some("send HELLO first".into())).await;
            return;
        }
        let doc_id = match normalize_doc_id(message.get("docId")) {
            Ok(id) => id,
            Err(()) => {
                self.send_error(session, ErrorCode::InvalidDoc, Some("docId required".into())).await;
                return;
            }
        };
        let doc = self.get_or_create_doc(&doc_id).await;
        let (version, content) = doc.subscribe(&session.id).await;
        session.add_subscription(doc_id.clone());
        self.send_safe(session, ServerEvent::DocSnapshot { doc_id, version, content }).await;
    }

    async fn handle_get_snapshot(&self, session: &Arc<Session>, message: &Map<String, Value>) {
        let doc_id = match normalize_doc_id(message.get("docId")) {
            Ok(id) => id,
            Err(()) => {
                self.send_error(session, ErrorCode::InvalidDoc, Some("docId required".into())).await;
                return;
            }
        };
        let doc = self.get_or_create_doc(&doc_id).await;
        let (version, content) = doc.snapshot_payload().await;
        self.send_safe(session, ServerEvent::DocSnapshot { doc_id, version, content }).await;
    }

    async fn handle_edit(&self, session: &Arc<Session>, message: &Map<String, Value>) {
        if !session.hello_received() {
            self.send_error(session, ErrorCode::NotReady, Some("send HELLO first".into())).await;
            return;
        }
        let doc_id = match normalize_doc_id(message.get("docId")) {
            Ok(id) => id,
            Err(()) => {
                self.send_error(session, ErrorCode::InvalidDoc, Some("docId required".into())).await;
                return;
            }
        };
        let base = coerce_base(message.get("base"));
        let doc = self.get_or_create_doc(&doc_id).await;

        enum Outcome {
            Applied { version: u64, patch: patch::Patch },
            OutOfDate { server_version: u64 },
            Error(ErrorCode),
        }

        let outcome = {
            let mut guard = doc.lock().await;
            if base != guard.version() as i64 {
                Outcome::OutOfDate { server_version: guard.version() }
            } else {
                match patch::apply_operation(guard.content(), message) {
                    Err(code) => Outcome::Error(code),
                    Ok((new_content, patch)) => {
                        let new_version = guard.version() + 1;
                        match persist::append_oplog(&doc_id, new_version, &patch, &session.id, &self.config.oplog_dir).await {
                            Err(e) => {
                                warn!(doc_id = %doc_id, "oplog append failed: {e}");
                                Outcome::Error(ErrorCode::ServerError)
                            }
                            Ok(()) => {
                                guard.commit(new_content, new_version);
                                if new_version % self.config.snapshot_interval == 0 {
                                    if let Err(e) =
                                        persist::save_snapshot(&doc_id, new_version, guard.content(), &self.config.snapshot_dir).await
                                    {
                                        warn!(doc_id = %doc_id, "snapshot write failed: {e}");
                                    }
                                }
                                Outcome::Applied { version: new_version, patch }
                            }
                        }
                    }
                }
            }
        };

        match outcome {
            Outcome::OutOfDate { server_version } => {
                self.send_safe(session, ServerEvent::out_of_date(doc_id, server_version)).await;
            }
            Outcome::Error(code) => {
                self.send_error(session, code, None).await;
            }
            Outcome::Applied { version, patch } => {
                let applied = ServerEvent::Applied {
                    doc_id: doc_id.clone(),
                    version,
                    patch: patch.clone(),
                    by: session.id.clone(),
                };
                self.send_safe(session, applied).await;
                let broadcast =
                    ServerEvent::Broadcast { doc_id: doc_id.clone(), version, patch, by: session.id.clone() };
                self.broadcast(&doc, broadcast, &session.id).await;
            }
        }
    }

    /// Snapshots the subscriber set under the document's lock, then delivers
    /// outside it. A subscriber whose session is gone is dropped from the
    /// set; a live subscriber whose send fails is unregistered.
    async fn broadcast(&self, doc: &Arc<DocState>, event: ServerEvent, exclude: &str) {
        let targets = doc.subscribers().await;
        for sid in targets {
            if sid == exclude {
                continue;
            }
            let Some(session) = self.sessions.get(&sid).map(|e| Arc::clone(e.value())) else {
                doc.unsubscribe(&sid).await;
                continue;
            };
            self.send_safe(&session, event.clone()).await;
        }
    }

    async fn send_safe(&self, session: &Arc<Session>, event: ServerEvent) {
        if session.send(&event).await.is_err() {
            self.unregister_session(session).await;
        }
    }

    async fn send_error(&self, session: &Arc<Session>, code: ErrorCode, hint: Option<String>) {
        self.send_safe(session, ServerEvent::error(code, hint)).await;
    }
}

fn normalize_doc_id(value: Option<&Value>) -> Result<String, ()> {
    let doc_id = value.and_then(Value::as_str).unwrap_or("").trim().to_string();
    if doc_id.is_empty() { Err(()) } else { Ok(doc_id) }
}

/// `base` defaults to a sentinel (`-1`) that can never equal a real
/// (non-negative) version, so a missing or non-integer `base` always fails
/// admission rather than silently matching version 0.
fn coerce_base(value: Option<&Value>) -> i64 {
    match value.and_then(Value::as_i64).or_else(|| value.and_then(Value::as_f64).map(|f| f as i64)) {
        Some(n) => n,
        None => -1,
    }
}
