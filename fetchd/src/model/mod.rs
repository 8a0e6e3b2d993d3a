//! Durable and transient data model for download jobs.

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Current wall-clock time as epoch milliseconds.
pub(crate) fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Lifecycle status of a download record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DownloadStatus {
    Downloading,
    Paused,
    Downloaded,
    Error,
}

/// Record kinds stored in the record log.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ModelKind {
    DownloadingFile,
}

/// A durable download record.
///
/// Identity is the generated `id`; it never changes for the life of the
/// record, and neither does the owner. `committed_bytes` is the durable
/// checkpoint - the only progress value trusted after a crash. It advances
/// at checkpoint boundaries and terminal transitions only.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadRecord {
    pub id: String,
    pub name: String,
    /// Destination folder, relative to the configured download directory.
    pub path: String,
    pub url: String,
    pub owner_username: String,
    pub status: DownloadStatus,
    /// Total size announced by the remote; `-1` when unknown.
    pub total_bytes: i64,
    pub committed_bytes: u64,
    pub created_at: i64,
    pub updated_at: i64,
}

impl DownloadRecord {
    /// Create a fresh record in `Downloading` state with nothing committed.
    pub fn new(
        id: String,
        name: String,
        path: String,
        url: String,
        owner_username: String,
        total_bytes: i64,
    ) -> Self {
        let now = now_millis();
        Self {
            id,
            name,
            path,
            url,
            owner_username,
            status: DownloadStatus::Downloading,
            total_bytes,
            committed_bytes: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Copy of this record with a new status and a touched `updated_at`.
    pub fn with_status(&self, status: DownloadStatus) -> Self {
        Self {
            status,
            updated_at: now_millis(),
            ..self.clone()
        }
    }

    /// Copy of this record with an advanced durable checkpoint.
    pub fn commit_bytes(&self, status: DownloadStatus, committed_bytes: u64) -> Self {
        Self {
            status,
            committed_bytes,
            updated_at: now_millis(),
            ..self.clone()
        }
    }
}

/// One entry of the record log.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageAction {
    Save { record: DownloadRecord },
    Delete { model: ModelKind, id: String },
}

/// Inbound download request, as handed over by the protocol layer.
#[derive(Clone, Debug)]
pub struct DownloadRequest {
    pub url: String,
    pub file_name: String,
    /// Destination folder, relative to the download directory. Empty means
    /// the download directory itself.
    pub path: String,
    pub owner: String,
}

/// Read-only projection of a record plus its live transient counters.
///
/// `downloaded_bytes` reflects in-flight progress while a transfer session
/// is active and falls back to the durable checkpoint otherwise.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub id: String,
    pub name: String,
    pub status: DownloadStatus,
    pub total_bytes: i64,
    pub downloaded_bytes: u64,
    pub speed_bytes_per_ms: u64,
}

impl StatusSnapshot {
    /// Projection of a record with no active transfer.
    pub fn from_record(record: &DownloadRecord) -> Self {
        Self {
            id: record.id.clone(),
            name: record.name.clone(),
            status: record.status,
            total_bytes: record.total_bytes,
            downloaded_bytes: record.committed_bytes,
            speed_bytes_per_ms: 0,
        }
    }

    /// Projection of a record with live transfer counters merged in.
    pub fn with_live(record: &DownloadRecord, live_bytes: u64, speed_bytes_per_ms: u64) -> Self {
        Self {
            downloaded_bytes: record.committed_bytes.max(live_bytes),
            speed_bytes_per_ms,
            ..Self::from_record(record)
        }
    }
}
