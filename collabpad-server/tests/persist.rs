//! Tests that document state survives a process restart via snapshot + oplog
//! recovery.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use collabpad_server::{Hub, HubConfig};
use common::*;
use serde_json::json;
use tempfile::TempDir;
use tokio::net::TcpListener;

pub mod common;

async fn spawn_on(hub: Arc<Hub>) -> Result<SocketAddr> {
    let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0))).await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move { collabpad_server::serve(hub, listener).await });
    Ok(addr)
}

#[tokio::test]
async fn crash_recovery_preserves_content_and_version() -> Result<()> {
    logging();
    let storage = TempDir::new()?;
    let config = HubConfig {
        snapshot_dir: storage.path().join("snapshots"),
        oplog_dir: storage.path().join("oplogs"),
        snapshot_interval: 2,
        heartbeat_timeout_secs: 120,
    };

    {
        let hub = Arc::new(Hub::new(config.clone()).await?);
        hub.spawn_watchdog();
        let addr = spawn_on(Arc::clone(&hub)).await?;

        let mut client = JsonLineClient::connect(addr).await?;
        client.hello("alice").await;
        client.subscribe("doc").await;

        let edits = [
            json!({"op": "INSERT", "docId": "doc", "base": 0, "pos": 0, "text": "ab"}),
            json!({"op": "INSERT", "docId": "doc", "base": 1, "pos": 2, "text": "cd"}),
            json!({"op": "DELETE", "docId": "doc", "base": 2, "pos": 0, "len": 1}),
            json!({"op": "REPLACE", "docId": "doc", "base": 3, "pos": 0, "len": 1, "text": "X"}),
        ];
        for edit in edits {
            client.send(&edit).await;
            let applied = client.recv().await?;
            assert_eq!(applied["ev"], "APPLIED");
        }
        // Snapshot fires at versions 2 and 4; the oplog holds all four entries.
    }

    let hub = Arc::new(Hub::new(config).await?);
    hub.spawn_watchdog();
    let addr = spawn_on(hub).await?;

    let mut client = JsonLineClient::connect(addr).await?;
    client.hello("alice").await;
    let snapshot = client.subscribe("doc").await;
    assert_eq!(snapshot["version"], 4);
    assert_eq!(snapshot["content"], "Xcd");
    Ok(())
}

#[tokio::test]
async fn fresh_doc_with_no_persisted_state_starts_empty() -> Result<()> {
    logging();
    let storage = TempDir::new()?;
    let config = HubConfig {
        snapshot_dir: storage.path().join("snapshots"),
        oplog_dir: storage.path().join("oplogs"),
        snapshot_interval: 50,
        heartbeat_timeout_secs: 120,
    };
    let hub = Arc::new(Hub::new(config).await?);
    hub.spawn_watchdog();
    let addr = spawn_on(hub).await?;

    let mut client = JsonLineClient::connect(addr).await?;
    client.hello("alice").await;
    let snapshot = client.subscribe("never-seen").await;
    assert_eq!(snapshot["version"], 0);
    assert_eq!(snapshot["content"], "");
    Ok(())
}
