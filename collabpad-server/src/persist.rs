//! Snapshot and oplog persistence for documents.
//!
//! Snapshot writes are crash-atomic (write to a temp file, rename over the
//! target); oplog appends are plain append-mode writes, always issued under
//! the owning document's mutex so they stay ordered with the version bump
//! they record.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{error, warn};

use crate::patch::Patch;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SnapshotFile {
    #[serde(rename = "docId")]
    doc_id: String,
    version: u64,
    content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OplogEntry {
    #[serde(rename = "docId")]
    doc_id: String,
    version: u64,
    patch: Patch,
    by: String,
    ts: f64,
}

/// Creates the snapshot and oplog directories if they don't already exist.
pub async fn ensure_storage(snapshot_dir: &Path, oplog_dir: &Path) -> anyhow::Result<()> {
    tokio::fs::create_dir_all(snapshot_dir).await?;
    tokio::fs::create_dir_all(oplog_dir).await?;
    Ok(())
}

fn snapshot_path(doc_id: &str, snapshot_dir: &Path) -> PathBuf {
    snapshot_dir.join(format!("{doc_id}.json"))
}

fn oplog_path(doc_id: &str, oplog_dir: &Path) -> PathBuf {
    oplog_dir.join(format!("{doc_id}.logl"))
}

/// Reconstructs `(content, version)` for `doc_id` from its snapshot file
/// plus any oplog entries newer than the snapshot. Never fails: a missing or
/// corrupt snapshot is treated as the empty document, and a corrupt oplog
/// stops replay at the last entry that applied cleanly.
pub async fn load_doc_content(doc_id: &str, snapshot_dir: &Path, oplog_dir: &Path) -> (String, u64) {
    let (mut content, mut version) = read_snapshot(doc_id, snapshot_dir).await;
    replay_oplog(doc_id, &mut content, &mut version, oplog_dir).await;
    (content, version)
}

async fn read_snapshot(doc_id: &str, snapshot_dir: &Path) -> (String, u64) {
    let path = snapshot_path(doc_id, snapshot_dir);
    let raw = match tokio::fs::read_to_string(&path).await {
        Ok(raw) => raw,
        Err(_) => return (String::new(), 0),
    };
    match serde_json::from_str::<SnapshotFile>(&raw) {
        Ok(snapshot) => (snapshot.content, snapshot.version),
        Err(e) => {
            warn!("snapshot load failed ({doc_id}): {e}");
            (String::new(), 0)
        }
    }
}

async fn replay_oplog(doc_id: &str, content: &mut String, version: &mut u64, oplog_dir: &Path) {
    let path = oplog_path(doc_id, oplog_dir);
    let file = match tokio::fs::File::open(&path).await {
        Ok(file) => file,
        Err(_) => return,
    };
    let mut lines = BufReader::new(file).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!("oplog read error ({doc_id}): {e}");
                break;
            }
        };
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let entry: OplogEntry = match serde_json::from_str(trimmed) {
            Ok(entry) => entry,
            Err(_) => {
                warn!("skip bad oplog line ({doc_id})");
                continue;
            }
        };
        if entry.version <= *version {
            continue;
        }
        match crate::patch::apply_patch(content, &entry.patch) {
            Ok(new_content) => {
                *content = new_content;
                *version = entry.version;
            }
            Err(code) => {
                error!("oplog patch failed ({doc_id} v{}): {code}", entry.version);
                break;
            }
        }
    }
}

/// Durably appends one patch record to `doc_id`'s oplog.
pub async fn append_oplog(doc_id: &str, version: u64, patch: &Patch, by: &str, oplog_dir: &Path) -> anyhow::Result<()> {
    let ts = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs_f64();
    let entry = OplogEntry { doc_id: doc_id.to_string(), version, patch: patch.clone(), by: by.to_string(), ts };
    let mut line = serde_json::to_string(&entry)?;
    line.push('\n');

    let path = oplog_path(doc_id, oplog_dir);
    let mut file = tokio::fs::OpenOptions::new().create(true).append(true).open(path).await?;
    file.write_all(line.as_bytes()).await?;
    Ok(())
}

/// Atomically overwrites `doc_id`'s snapshot file with `{docId, version,
/// content}`. Writes to a temp file in the same directory and renames it
/// into place so a crash mid-write never leaves a half-written snapshot.
pub async fn save_snapshot(doc_id: &str, version: u64, content: &str, snapshot_dir: &Path) -> anyhow::Result<()> {
    let doc_id = doc_id.to_string();
    let content = content.to_string();
    let snapshot_dir = snapshot_dir.to_path_buf();
    tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
        let path = snapshot_path(&doc_id, &snapshot_dir);
        let payload = SnapshotFile { doc_id: doc_id.clone(), version, content };
        let json = serde_json::to_string_pretty(&payload)?;

        let mut tmp = tempfile::Builder::new()
            .prefix(&format!(".{doc_id}."))
            .suffix(".tmp")
            .tempfile_in(&snapshot_dir)?;
        tmp.write_all(json.as_bytes())?;
        tmp.flush()?;
        tmp.persist(&path).map_err(|e| anyhow::anyhow!("atomic snapshot rename failed: {}", e.error))?;
        Ok(())
    })
    .await??;
    Ok(())
}
