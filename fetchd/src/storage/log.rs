//! Append-only record log.
//!
//! Every mutation of a durable record is appended as one JSON object per
//! line. The log is never compacted or truncated; startup replays it from
//! the beginning to rebuild the in-memory table. All appends are funneled
//! through a single dedicated writer task, which is the only ordering
//! guarantee the log provides: lines are never interleaved or torn.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};
use tracing::warn;

use crate::error::{EngineError, EngineResult};
use crate::model::{DownloadRecord, ModelKind, StorageAction};

enum WriterMessage {
    Append(String),
    Sync(oneshot::Sender<()>),
}

/// Crash-safe persistence of record mutations.
pub struct RecordLog {
    path: PathBuf,
    tx: mpsc::UnboundedSender<WriterMessage>,
}

impl RecordLog {
    /// Open the log, creating the file if it does not exist, and spawn the
    /// writer task. Fails if the path exists but is not a regular file.
    pub async fn open(path: impl Into<PathBuf>) -> EngineResult<Self> {
        let path = path.into();
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| EngineError::io(&path, e))?;

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(writer_loop(file, path.clone(), rx));

        Ok(Self { path, tx })
    }

    /// Enqueue a `Save` entry for the record.
    pub fn save(&self, record: &DownloadRecord) {
        self.append(StorageAction::Save {
            record: record.clone(),
        });
    }

    /// Enqueue a `Delete` tombstone.
    pub fn delete(&self, model: ModelKind, id: &str) {
        self.append(StorageAction::Delete {
            model,
            id: id.to_string(),
        });
    }

    /// Serialize one action and hand it to the writer task.
    ///
    /// Never blocks the caller on disk; a failed enqueue or a failed disk
    /// write is logged and otherwise swallowed, matching the best-effort
    /// contract of the storage layer.
    pub fn append(&self, action: StorageAction) {
        match serde_json::to_string(&action) {
            Ok(line) => {
                if self.tx.send(WriterMessage::Append(line)).is_err() {
                    warn!("record log writer is gone, dropping entry");
                }
            }
            Err(e) => warn!("failed to serialize storage action: {}", e),
        }
    }

    /// Wait until everything enqueued so far has reached the file and been
    /// synced to disk. Used at shutdown and by tests.
    pub async fn sync(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(WriterMessage::Sync(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
    }

    /// Replay the whole log in file order and return the surviving records
    /// of the requested kind.
    ///
    /// A malformed line is logged and skipped rather than aborting the
    /// replay; losing one record beats refusing to boot.
    pub async fn replay(&self, kind: ModelKind) -> EngineResult<HashMap<String, DownloadRecord>> {
        replay_file(&self.path, kind).await
    }
}

async fn writer_loop(
    mut file: tokio::fs::File,
    path: PathBuf,
    mut rx: mpsc::UnboundedReceiver<WriterMessage>,
) {
    while let Some(msg) = rx.recv().await {
        match msg {
            WriterMessage::Append(mut line) => {
                line.push('\n');
                if let Err(e) = file.write_all(line.as_bytes()).await {
                    warn!("failed to append to record log '{}': {}", path.display(), e);
                } else if let Err(e) = file.flush().await {
                    warn!("failed to flush record log '{}': {}", path.display(), e);
                }
            }
            WriterMessage::Sync(ack) => {
                if let Err(e) = file.sync_data().await {
                    warn!("failed to sync record log '{}': {}", path.display(), e);
                }
                let _ = ack.send(());
            }
        }
    }
}

async fn replay_file(
    path: &Path,
    kind: ModelKind,
) -> EngineResult<HashMap<String, DownloadRecord>> {
    let contents = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| EngineError::io(path, e))?;

    let mut records = HashMap::new();
    for (lineno, line) in contents.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<StorageAction>(line) {
            Ok(StorageAction::Save { record }) => {
                if kind == ModelKind::DownloadingFile {
                    records.insert(record.id.clone(), record);
                }
            }
            Ok(StorageAction::Delete { model, id }) => {
                if model == kind {
                    records.remove(&id);
                }
            }
            Err(e) => {
                warn!(
                    "skipping malformed line {} of record log '{}': {}",
                    lineno + 1,
                    path.display(),
                    e
                );
            }
        }
    }
    Ok(records)
}
