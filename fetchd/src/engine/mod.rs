//! Download engine: lifecycle orchestration and the in-flight registry.
//!
//! The engine owns every moving part of a download's life: it validates and
//! resolves destinations under the configured base directory, creates the
//! destination file, spawns one request driver per transfer, keeps a
//! registry of cancellation handles so at most one session runs per record,
//! and replays unfinished jobs when the process comes back up. Blocking
//! filesystem work (file creation, deletion, directory setup) runs on the
//! blocking pool so the network tasks never stall on disk.

use std::collections::HashMap;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use futures_util::StreamExt;
use parking_lot::Mutex;
use reqwest::header::{CONTENT_LENGTH, CONTENT_RANGE, RANGE};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::model::{DownloadRecord, DownloadRequest, DownloadStatus, ModelKind, StatusSnapshot};
use crate::storage::{RecordIndex, RecordLog};
use crate::transfer::{
    ResponseMeta, SessionEvent, StartPolicy, TransferProgress, TransferSession,
};

/// Cancellation handle and live counters of one running transfer.
struct InflightTransfer {
    cancel: CancellationToken,
    progress: Arc<TransferProgress>,
}

type InflightRegistry = Arc<Mutex<HashMap<String, InflightTransfer>>>;

/// Orchestrates download jobs over a durable record store.
#[derive(Clone)]
pub struct DownloadEngine {
    config: EngineConfig,
    client: reqwest::Client,
    index: Arc<RecordIndex>,
    log: Arc<RecordLog>,
    inflight: InflightRegistry,
}

impl DownloadEngine {
    /// Initialize the engine: ensure the download directory, open and
    /// replay the record log, then kick off a resume for every record the
    /// last run left in `Downloading` state.
    pub async fn start(config: EngineConfig) -> EngineResult<Self> {
        config.validate()?;
        ensure_download_dir(config.download_dir.clone()).await?;

        let log = Arc::new(RecordLog::open(&config.log_path).await?);
        let records = log.replay(ModelKind::DownloadingFile).await?;
        let index = Arc::new(RecordIndex::from_records(records.into_values()));

        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .read_timeout(config.read_timeout)
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| EngineError::Validation(format!("failed to build http client: {e}")))?;

        let engine = Self {
            config,
            client,
            index,
            log,
            inflight: Arc::new(Mutex::new(HashMap::new())),
        };
        engine.recover_unfinished();
        Ok(engine)
    }

    /// Start a new download and resolve once the transfer is underway (the
    /// record is persisted after response headers arrive) or has failed to
    /// start.
    pub async fn download(&self, request: DownloadRequest) -> EngineResult<StatusSnapshot> {
        validate_url(&request.url)?;

        let base = self.config.download_dir.clone();
        let folder = request.path.clone();
        let file_name = request.file_name.clone();
        let dest = run_blocking(move || create_destination(&base, &folder, &file_name)).await??;

        let id = Uuid::new_v4().to_string();
        let progress = Arc::new(TransferProgress::new(0));
        let session = TransferSession::new(
            StartPolicy::Fresh {
                id: id.clone(),
                request: request.clone(),
            },
            dest,
            self.index.clone(),
            self.log.clone(),
            progress.clone(),
            self.config.map_size,
            self.config.commit_size,
        );
        self.spawn_transfer(id, request.url, 0, session, progress)
            .await
    }

    /// Resume a paused download from its durable checkpoint.
    pub async fn resume(&self, id: &str) -> EngineResult<StatusSnapshot> {
        let record = self
            .index
            .get(id)
            .ok_or_else(|| EngineError::NotFound(id.to_string()))?;
        if record.status != DownloadStatus::Paused {
            return Err(EngineError::StateConflict(format!(
                "download '{id}' must be paused to resume"
            )));
        }
        self.resume_record(record).await
    }

    /// Stop a running transfer and park the record as `Paused`.
    ///
    /// Signalling the in-flight handle is a no-op when the transfer already
    /// finished; the status transition to `Paused` belongs to the engine,
    /// never to the session.
    pub fn cancel(&self, id: &str) -> EngineResult<()> {
        if self.index.get(id).is_none() {
            return Err(EngineError::NotFound(id.to_string()));
        }
        let Some(handle) = self.inflight.lock().remove(id) else {
            // Already finished; nothing to stop.
            return Ok(());
        };
        handle.cancel.cancel();

        if let Some(current) = self.index.get(id) {
            match current.status {
                // The Downloaded arm closes the race where the stream ends
                // at the same moment: the handle was still registered, so
                // the caller's cancel wins over natural completion.
                DownloadStatus::Downloading | DownloadStatus::Downloaded => {
                    let updated = current.with_status(DownloadStatus::Paused);
                    self.index.upsert(updated.clone());
                    self.log.save(&updated);
                }
                // The session already recorded a terminal failure; keep it.
                DownloadStatus::Paused | DownloadStatus::Error => {}
            }
        }
        Ok(())
    }

    /// Delete a download: stop it if running, drop the record, tombstone it
    /// in the log, and remove the file from disk best-effort.
    pub async fn delete(&self, id: &str) -> EngineResult<()> {
        let record = self
            .index
            .get(id)
            .ok_or_else(|| EngineError::NotFound(id.to_string()))?;

        if let Some(handle) = self.inflight.lock().remove(id) {
            handle.cancel.cancel();
        }
        self.index.remove(&record);
        self.log.delete(ModelKind::DownloadingFile, id);

        let base = self.config.download_dir.clone();
        tokio::task::spawn_blocking(move || {
            match resolve_under_base(&base, &record.path, &record.name) {
                Ok(dest) => {
                    if let Err(e) = std::fs::remove_file(&dest) {
                        if e.kind() != io::ErrorKind::NotFound {
                            warn!("failed to delete file '{}': {}", dest.display(), e);
                        }
                    }
                }
                Err(e) => warn!("failed to resolve file of deleted download: {}", e),
            }
        });
        Ok(())
    }

    /// Snapshots of one owner's downloads, newest first. Pagination is the
    /// caller's concern.
    pub fn list_by_owner(&self, owner: &str) -> Vec<StatusSnapshot> {
        let mut records = self.index.owner_records(owner);
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        records.iter().map(|r| self.project(r)).collect()
    }

    /// Read API for the periodic status broadcaster: everything currently
    /// downloading, plus records touched since the last report.
    pub fn owner_report(&self, owner: &str, since_millis: i64) -> Vec<StatusSnapshot> {
        self.index
            .owner_records(owner)
            .iter()
            .filter(|r| r.status == DownloadStatus::Downloading || r.updated_at >= since_millis)
            .map(|r| self.project(r))
            .collect()
    }

    /// Snapshot of a single download.
    pub fn snapshot(&self, id: &str) -> Option<StatusSnapshot> {
        self.index.get(id).map(|r| self.project(&r))
    }

    /// Cancel every running transfer and flush the record log tail.
    pub async fn shutdown(&self) {
        let handles: Vec<InflightTransfer> = {
            let mut inflight = self.inflight.lock();
            inflight.drain().map(|(_, handle)| handle).collect()
        };
        for handle in handles {
            handle.cancel.cancel();
        }
        self.log.sync().await;
    }

    fn project(&self, record: &DownloadRecord) -> StatusSnapshot {
        match self.inflight.lock().get(&record.id) {
            Some(handle) => StatusSnapshot::with_live(
                record,
                handle.progress.live_bytes(),
                handle.progress.speed_bytes_per_ms(),
            ),
            None => StatusSnapshot::from_record(record),
        }
    }

    /// Replay recovery: every record the log still shows as `Downloading`
    /// is either resumed or marked `Error` - never left silently stale.
    fn recover_unfinished(&self) {
        for record in self.index.all_records() {
            if record.status != DownloadStatus::Downloading {
                continue;
            }
            info!("resuming unfinished download '{}' after restart", record.name);
            let engine = self.clone();
            tokio::spawn(async move {
                let id = record.id.clone();
                let name = record.name.clone();
                if let Err(e) = engine.resume_record(record).await {
                    warn!("failed to resume downloading '{}' after boot: {}", name, e);
                    // The session persists failures it reached; anything
                    // that died earlier still has to leave Downloading.
                    if let Some(current) = engine.index.get(&id) {
                        if current.status == DownloadStatus::Downloading {
                            let updated = current.with_status(DownloadStatus::Error);
                            engine.index.upsert(updated.clone());
                            engine.log.save(&updated);
                        }
                    }
                }
            });
        }
    }

    async fn resume_record(&self, record: DownloadRecord) -> EngineResult<StatusSnapshot> {
        let dest = resolve_under_base(&self.config.download_dir, &record.path, &record.name)?;
        let offset = record.committed_bytes;
        let progress = Arc::new(TransferProgress::new(offset));
        let session = TransferSession::new(
            StartPolicy::Resume {
                record: record.clone(),
            },
            dest,
            self.index.clone(),
            self.log.clone(),
            progress.clone(),
            self.config.map_size,
            self.config.commit_size,
        );
        self.spawn_transfer(record.id, record.url, offset, session, progress)
            .await
    }

    /// Register the in-flight handle, spawn the request driver, and wait
    /// for its first reply (record persisted, or startup failure).
    async fn spawn_transfer(
        &self,
        id: String,
        url: String,
        range_offset: u64,
        session: TransferSession,
        progress: Arc<TransferProgress>,
    ) -> EngineResult<StatusSnapshot> {
        let cancel = CancellationToken::new();
        let progress_handle = progress.clone();
        {
            let mut inflight = self.inflight.lock();
            if inflight.contains_key(&id) {
                return Err(EngineError::StateConflict(format!(
                    "download '{id}' is already in flight"
                )));
            }
            inflight.insert(
                id.clone(),
                InflightTransfer {
                    cancel: cancel.clone(),
                    progress,
                },
            );
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        let client = self.client.clone();
        let inflight = self.inflight.clone();
        tokio::spawn(async move {
            run_transfer(client, url, range_offset, session, cancel, reply_tx).await;
            // Deregister only our own entry: a cancel followed by a quick
            // resume may have already re-registered this id.
            let mut inflight = inflight.lock();
            if let Some(entry) = inflight.get(&id) {
                if Arc::ptr_eq(&entry.progress, &progress_handle) {
                    inflight.remove(&id);
                }
            }
        });

        reply_rx
            .await
            .unwrap_or_else(|_| Err(EngineError::StateConflict("transfer driver died".to_string())))
    }
}

/// Drive one HTTP transfer: adapt the response into session events, answer
/// the engine's first-reply channel once headers are in, and watch the
/// cancellation token between chunks.
async fn run_transfer(
    client: reqwest::Client,
    url: String,
    range_offset: u64,
    mut session: TransferSession,
    cancel: CancellationToken,
    reply: oneshot::Sender<EngineResult<StatusSnapshot>>,
) {
    let mut reply = Some(reply);

    let mut request = client.get(&url);
    if range_offset != 0 {
        request = request.header(RANGE, format!("bytes={range_offset}-"));
    }

    let response = tokio::select! {
        _ = cancel.cancelled() => {
            session.mark_aborted();
            let _ = session.feed(SessionEvent::End);
            send_reply(&mut reply, Err(EngineError::remote(&url, "cancelled before start")));
            return;
        }
        response = request.send() => response,
    };

    let response = match response {
        Ok(response) => response,
        Err(e) => {
            let err = match session.feed(SessionEvent::Fail(e.to_string())) {
                Err(err) => err,
                Ok(_) => EngineError::remote(&url, e.to_string()),
            };
            send_reply(&mut reply, Err(err));
            return;
        }
    };

    if let Err(e) = session.feed(SessionEvent::Status {
        code: response.status().as_u16(),
    }) {
        send_reply(&mut reply, Err(e));
        return;
    }

    let meta = ResponseMeta {
        content_length: response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok()),
        content_range: response
            .headers()
            .get(CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
    };
    if let Err(e) = session.feed(SessionEvent::Headers(meta)) {
        send_reply(&mut reply, Err(e));
        return;
    }
    match session.snapshot() {
        Some(snapshot) => send_reply(&mut reply, Ok(snapshot)),
        None => send_reply(
            &mut reply,
            Err(EngineError::StateConflict("no record after headers".to_string())),
        ),
    }

    let mut stream = response.bytes_stream();
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => {
                session.mark_aborted();
                break;
            }
            next = stream.next() => next,
        };
        match next {
            Some(Ok(bytes)) => {
                // Failures past this point are already persisted by the
                // session; the driver just stops.
                if session.feed(SessionEvent::Chunk(bytes)).is_err() {
                    return;
                }
            }
            Some(Err(e)) => {
                let _ = session.feed(SessionEvent::Fail(e.to_string()));
                return;
            }
            None => break,
        }
    }

    // Re-check so a cancel racing the last chunk cannot complete the record.
    if cancel.is_cancelled() {
        session.mark_aborted();
    }
    let _ = session.feed(SessionEvent::End);
}

fn send_reply(
    reply: &mut Option<oneshot::Sender<EngineResult<StatusSnapshot>>>,
    result: EngineResult<StatusSnapshot>,
) {
    if let Some(tx) = reply.take() {
        let _ = tx.send(result);
    }
}

async fn run_blocking<T, F>(f: F) -> EngineResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| EngineError::io(PathBuf::new(), io::Error::other(e)))
}

/// Accept only http(s) URLs before touching the filesystem.
fn validate_url(url: &str) -> EngineResult<()> {
    let parsed = reqwest::Url::parse(url)
        .map_err(|_| EngineError::Validation("failed to parse URL".to_string()))?;
    match parsed.scheme() {
        "http" | "https" => Ok(()),
        other => Err(EngineError::Validation(format!(
            "unsupported URL scheme '{other}'"
        ))),
    }
}

async fn ensure_download_dir(dir: PathBuf) -> EngineResult<()> {
    run_blocking(move || {
        if dir.exists() {
            if !dir.is_dir() {
                return Err(EngineError::Validation(format!(
                    "download folder '{}' is a file",
                    dir.display()
                )));
            }
            return Ok(());
        }
        std::fs::create_dir_all(&dir).map_err(|e| EngineError::io(&dir, e))
    })
    .await?
}

/// Lexically normalize a path, resolving `.` and `..` components.
fn normalized(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}

/// Resolve `<base>/<folder>/<file_name>`, rejecting anything that
/// normalizes outside the base download directory.
fn resolve_under_base(base: &Path, folder: &str, file_name: &str) -> EngineResult<PathBuf> {
    let base = normalized(base);
    let mut dest = base.clone();
    if !folder.trim().is_empty() {
        dest = dest.join(folder);
    }
    dest = normalized(&dest.join(file_name));
    if !dest.starts_with(&base) || dest == base {
        return Err(EngineError::Validation(
            "access to this folder is denied".to_string(),
        ));
    }
    Ok(dest)
}

/// Resolve the destination, create its folder if needed, and claim it by
/// creating the empty file. An existing file is a validation error.
fn create_destination(base: &Path, folder: &str, file_name: &str) -> EngineResult<PathBuf> {
    let dest = resolve_under_base(base, folder, file_name)?;

    if let Some(parent) = dest.parent() {
        if parent.exists() {
            if !parent.is_dir() {
                return Err(EngineError::Validation(
                    "specified directory is a file".to_string(),
                ));
            }
        } else {
            std::fs::create_dir_all(parent).map_err(|e| EngineError::io(parent, e))?;
        }
    }

    match std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&dest)
    {
        Ok(_) => Ok(dest),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Err(EngineError::Validation(
            "a file with this name already exists".to_string(),
        )),
        Err(e) => Err(EngineError::io(dest, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_url_accepts_http_and_https() {
        assert!(validate_url("http://example.com/f.bin").is_ok());
        assert!(validate_url("https://example.com/f.bin").is_ok());
    }

    #[test]
    fn test_validate_url_rejects_other_schemes() {
        assert!(matches!(
            validate_url("ftp://example.com/f.bin"),
            Err(EngineError::Validation(_))
        ));
        assert!(matches!(
            validate_url("not a url"),
            Err(EngineError::Validation(_))
        ));
    }

    #[test]
    fn test_resolve_plain_destination() {
        let dest = resolve_under_base(Path::new("/data/downloads"), "", "f.bin").unwrap();
        assert_eq!(dest, PathBuf::from("/data/downloads/f.bin"));
    }

    #[test]
    fn test_resolve_nested_destination() {
        let dest = resolve_under_base(Path::new("/data/downloads"), "media/tv", "f.bin").unwrap();
        assert_eq!(dest, PathBuf::from("/data/downloads/media/tv/f.bin"));
    }

    #[test]
    fn test_resolve_rejects_folder_traversal() {
        assert!(matches!(
            resolve_under_base(Path::new("/data/downloads"), "../secrets", "f.bin"),
            Err(EngineError::Validation(_))
        ));
    }

    #[test]
    fn test_resolve_rejects_file_name_traversal() {
        assert!(matches!(
            resolve_under_base(Path::new("/data/downloads"), "", "../../etc/passwd"),
            Err(EngineError::Validation(_))
        ));
    }

    #[test]
    fn test_resolve_allows_benign_dot_segments() {
        let dest =
            resolve_under_base(Path::new("/data/downloads"), "a/../b/./c", "f.bin").unwrap();
        assert_eq!(dest, PathBuf::from("/data/downloads/b/c/f.bin"));
    }
}
