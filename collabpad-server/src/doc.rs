//! In-memory authoritative state for one document.

use std::collections::HashSet;

use tokio::sync::Mutex;

/// Content, version, and subscriber set for a single document, guarded by
/// one mutex. The mutex is held across the validate + mutate + append-log
/// sequence of an edit so the version bump and its oplog record are atomic
/// with respect to every other observer.
pub struct DocState {
    pub id: String,
    inner: Mutex<Inner>,
}

struct Inner {
    content: String,
    version: u64,
    subscribers: HashSet<String>,
}

impl DocState {
    pub fn new(id: String, content: String, version: u64) -> Self {
        Self { id, inner: Mutex::new(Inner { content, version, subscribers: HashSet::new() }) }
    }

    pub async fn version(&self) -> u64 {
        self.inner.lock().await.version
    }

    /// Returns the document's `(version, content)` pair, observed
    /// consistently under the lock.
    pub async fn snapshot_payload(&self) -> (u64, String) {
        let inner = self.inner.lock().await;
        (inner.version, inner.content.clone())
    }

    /// Adds `session_id` to the subscriber set and returns the snapshot
    /// payload, atomically: no broadcast issued after this call can be
    /// missed, and none issued before it can be double-delivered.
    pub async fn subscribe(&self, session_id: &str) -> (u64, String) {
        let mut inner = self.inner.lock().await;
        inner.subscribers.insert(session_id.to_string());
        (inner.version, inner.content.clone())
    }

    pub async fn unsubscribe(&self, session_id: &str) {
        self.inner.lock().await.subscribers.remove(session_id);
    }

    pub async fn subscribers(&self) -> Vec<String> {
        self.inner.lock().await.subscribers.iter().cloned().collect()
    }

    /// Runs `f` with exclusive access to `(content, version)` and commits
    /// whatever it returns. `f` itself performs no I/O; the caller commits
    /// persistence separately while still holding the returned guard's
    /// critical section (see `Hub::handle_edit`).
    pub async fn lock(&self) -> DocGuard<'_> {
        DocGuard { inner: self.inner.lock().await }
    }
}

pub struct DocGuard<'a> {
    inner: tokio::sync::MutexGuard<'a, Inner>,
}

impl DocGuard<'_> {
    pub fn content(&self) -> &str {
        &self.inner.content
    }

    pub fn version(&self) -> u64 {
        self.inner.version
    }

    pub fn commit(&mut self, content: String, version: u64) {
        self.inner.content = content;
        self.inner.version = version;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribe_returns_current_snapshot() {
        let doc = DocState::new("d".into(), "hi".into(), 2);
        let (version, content) = doc.subscribe("S-a").await;
        assert_eq!(version, 2);
        assert_eq!(content, "hi");
        assert_eq!(doc.subscribers().await, vec!["S-a".to_string()]);
    }

    #[tokio::test]
    async fn unsubscribe_removes_session() {
        let doc = DocState::new("d".into(), "".into(), 0);
        doc.subscribe("S-a").await;
        doc.subscribe("S-b").await;
        doc.unsubscribe("S-a").await;
        let mut remaining = doc.subscribers().await;
        remaining.sort();
        assert_eq!(remaining, vec!["S-b".to_string()]);
    }

    #[tokio::test]
    async fn lock_commit_bumps_version() {
        let doc = DocState::new("d".into(), "a".into(), 0);
        {
            let mut guard = doc.lock().await;
            assert_eq!(guard.content(), "a");
            guard.commit("ab".into(), 1);
        }
        assert_eq!(doc.snapshot_payload().await, (1, "ab".to_string()));
    }
}
