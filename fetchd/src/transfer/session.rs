//! Transfer session state machine.
//!
//! One session owns one outbound HTTP transfer end to end:
//!
//! ```text
//! AwaitingStatus -> AwaitingHeaders -> Streaming -> Completed
//!                                                |-> Aborted
//!                                                |-> Failed
//! ```
//!
//! The engine's request driver feeds response events in; the session writes
//! body chunks through a [`WindowCursor`] and commits durable checkpoints
//! whenever the live byte count crosses a `commit_size` boundary, which
//! bounds checkpoint I/O independent of chunk size. A fresh download and a
//! resumed one share the machine and differ only in their [`StartPolicy`]:
//! the resume path starts at the committed offset, asks the remote for a
//! byte range, and falls back to skipping the already-committed prefix when
//! the remote ignores the range and replays the body from the start.

use std::fs::OpenOptions;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use tracing::{info, trace, warn};

use crate::error::{EngineError, EngineResult};
use crate::model::{now_millis, DownloadRecord, DownloadRequest, DownloadStatus, StatusSnapshot};
use crate::storage::{RecordIndex, RecordLog};
use crate::transfer::cursor::WindowCursor;
use crate::transfer::progress::{ThroughputMeter, TransferProgress};

/// How a session starts: a brand-new download at offset zero, or a resume
/// from the record's durable checkpoint.
#[derive(Clone, Debug)]
pub enum StartPolicy {
    Fresh {
        id: String,
        request: DownloadRequest,
    },
    Resume {
        record: DownloadRecord,
    },
}

/// Response events fed by the request driver.
#[derive(Debug)]
pub enum SessionEvent {
    Status { code: u16 },
    Headers(ResponseMeta),
    Chunk(Bytes),
    End,
    Fail(String),
}

/// The response header fields the session cares about.
#[derive(Clone, Debug, Default)]
pub struct ResponseMeta {
    pub content_length: Option<u64>,
    pub content_range: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    AwaitingStatus,
    AwaitingHeaders,
    Streaming,
    Completed,
    Aborted,
    Failed,
}

/// Whether the driver should keep feeding events.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionFlow {
    Continue,
    Finished,
}

/// True when advancing the live counter from `prev` to `next` crosses a
/// `commit_size` boundary and a durable checkpoint is due.
pub(crate) fn crossed_commit_boundary(prev: u64, next: u64, commit_size: u64) -> bool {
    prev / commit_size != next / commit_size
}

/// Parse the total size out of a `Content-Range` header: the digits after
/// the last `/`. Returns `None` for `*` or anything unparsable.
fn content_range_total(value: &str) -> Option<u64> {
    let (_, total) = value.rsplit_once('/')?;
    total.trim().parse().ok()
}

/// State machine for one download transfer.
pub struct TransferSession {
    policy: StartPolicy,
    state: SessionState,
    dest: PathBuf,
    index: Arc<RecordIndex>,
    log: Arc<RecordLog>,
    progress: Arc<TransferProgress>,
    map_size: u64,
    commit_size: u64,
    record: Option<DownloadRecord>,
    cursor: Option<WindowCursor>,
    status_code: u16,
    skip_remaining: u64,
    live_bytes: u64,
    aborted: bool,
    meter: ThroughputMeter,
}

impl TransferSession {
    pub fn new(
        policy: StartPolicy,
        dest: PathBuf,
        index: Arc<RecordIndex>,
        log: Arc<RecordLog>,
        progress: Arc<TransferProgress>,
        map_size: u64,
        commit_size: u64,
    ) -> Self {
        Self {
            policy,
            state: SessionState::AwaitingStatus,
            dest,
            index,
            log,
            progress,
            map_size,
            commit_size,
            record: None,
            cursor: None,
            status_code: 0,
            skip_remaining: 0,
            live_bytes: 0,
            aborted: false,
            meter: ThroughputMeter::default(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Mark the session aborted. Checked before every success side effect,
    /// so a cancel racing with natural completion never produces a falsely
    /// `Downloaded` record.
    pub fn mark_aborted(&mut self) {
        self.aborted = true;
    }

    /// Projection of the current record plus live counters, once a record
    /// exists.
    pub fn snapshot(&self) -> Option<StatusSnapshot> {
        self.record.as_ref().map(|record| {
            StatusSnapshot::with_live(
                record,
                self.progress.live_bytes(),
                self.progress.speed_bytes_per_ms(),
            )
        })
    }

    /// Advance the machine with one response event.
    pub fn feed(&mut self, event: SessionEvent) -> EngineResult<SessionFlow> {
        match event {
            SessionEvent::Status { code } => self.on_status(code),
            SessionEvent::Headers(meta) => self.on_headers(meta),
            SessionEvent::Chunk(bytes) => self.on_chunk(&bytes),
            SessionEvent::End => self.on_end(),
            SessionEvent::Fail(reason) => self.on_fail(reason),
        }
    }

    fn on_status(&mut self, code: u16) -> EngineResult<SessionFlow> {
        self.status_code = code;
        if (200..300).contains(&code) {
            info!(
                "start downloading '{}' to '{}'",
                self.url(),
                self.dest.display()
            );
            self.state = SessionState::AwaitingHeaders;
            return Ok(SessionFlow::Continue);
        }

        info!(
            "received {} response code from server when trying to download '{}', aborting",
            code,
            self.url()
        );
        let reason = format!("server responded with status {code}");
        match self.current_record() {
            // A resume keeps its bytes; the failure is made durable.
            Some(record) => self.persist(record.with_status(DownloadStatus::Error)),
            // A fresh download has no record yet; drop the file we created.
            None => self.remove_destination(),
        }
        self.state = SessionState::Failed;
        Err(EngineError::remote(self.url(), reason))
    }

    fn on_headers(&mut self, meta: ResponseMeta) -> EngineResult<SessionFlow> {
        let file = match OpenOptions::new().read(true).write(true).open(&self.dest) {
            Ok(file) => file,
            Err(e) => return self.startup_io_failure(e),
        };

        match self.policy.clone() {
            StartPolicy::Fresh { id, request } => {
                let total = meta.content_length.map(|v| v as i64).unwrap_or(-1);
                if total > 0 {
                    if let Err(e) = file.set_len(total as u64) {
                        return self.startup_io_failure(e);
                    }
                }
                self.cursor = Some(WindowCursor::new(file, 0, self.map_size, total));
                self.progress.set_live_bytes(0);

                let record = DownloadRecord::new(
                    id,
                    request.file_name,
                    request.path,
                    request.url,
                    request.owner,
                    total,
                );
                self.persist(record);
            }
            StartPolicy::Resume { record } => {
                let announced = if self.status_code == 206 {
                    meta.content_range.as_deref().and_then(content_range_total)
                } else {
                    meta.content_length
                };
                let announced = announced.map(|v| v as i64).unwrap_or(-1);
                let total = if announced > 0 {
                    announced
                } else {
                    record.total_bytes
                };
                if announced > 0 {
                    if let Err(e) = file.set_len(announced as u64) {
                        return self.startup_io_failure(e);
                    }
                }

                self.cursor = Some(WindowCursor::new(
                    file,
                    record.committed_bytes,
                    self.map_size,
                    total,
                ));
                self.live_bytes = record.committed_bytes;
                self.progress.set_live_bytes(record.committed_bytes);
                // 206 means the stream starts exactly at the checkpoint; a
                // 200 replays the body from the start and the committed
                // prefix has to be discarded.
                self.skip_remaining = if self.status_code == 206 {
                    0
                } else {
                    record.committed_bytes
                };

                if record.status != DownloadStatus::Downloading || record.total_bytes != total {
                    let updated = DownloadRecord {
                        status: DownloadStatus::Downloading,
                        total_bytes: total,
                        updated_at: now_millis(),
                        ..record
                    };
                    self.persist(updated);
                } else {
                    self.record = Some(record);
                }
            }
        }

        self.state = SessionState::Streaming;
        Ok(SessionFlow::Continue)
    }

    fn on_chunk(&mut self, bytes: &Bytes) -> EngineResult<SessionFlow> {
        if self.state != SessionState::Streaming {
            return Ok(SessionFlow::Continue);
        }

        let mut data: &[u8] = bytes;
        if self.skip_remaining > 0 {
            if self.skip_remaining >= data.len() as u64 {
                self.skip_remaining -= data.len() as u64;
                return Ok(SessionFlow::Continue);
            }
            data = &data[self.skip_remaining as usize..];
            self.skip_remaining = 0;
        }

        if let Some(cursor) = self.cursor.as_mut() {
            if let Err(e) = cursor.write(data) {
                warn!("failed to write to file '{}': {}", self.dest.display(), e);
                return self.fail_io(e);
            }
        }
        trace!(
            "body part received for '{}' [size = {}]",
            self.dest.display(),
            data.len()
        );

        let prev_live = self.live_bytes;
        self.live_bytes += data.len() as u64;
        self.progress.set_live_bytes(self.live_bytes);

        if crossed_commit_boundary(prev_live, self.live_bytes, self.commit_size) {
            trace!(
                "committing '{}', downloaded bytes = {}",
                self.dest.display(),
                self.live_bytes
            );
            if let Some(cursor) = self.cursor.as_ref() {
                if let Err(e) = cursor.flush() {
                    warn!("failed to flush file '{}': {}", self.dest.display(), e);
                    return self.fail_io(e);
                }
            }
            if let Some(record) = self.record.clone() {
                self.persist(record.commit_bytes(DownloadStatus::Downloading, self.live_bytes));
            }
        }

        self.meter.record(data.len() as u64, &self.progress);
        Ok(SessionFlow::Continue)
    }

    fn on_end(&mut self) -> EngineResult<SessionFlow> {
        if self.aborted {
            self.close_cursor();
            self.state = SessionState::Aborted;
            return Ok(SessionFlow::Finished);
        }

        if let Some(record) = self.record.clone() {
            let completed = record.commit_bytes(DownloadStatus::Downloaded, self.live_bytes);
            let final_len = completed.committed_bytes;
            self.persist(completed);
            if let Some(cursor) = self.cursor.take() {
                if let Err(e) = cursor.finish(final_len) {
                    warn!(
                        "failed to finalize file '{}' length: {}",
                        self.dest.display(),
                        e
                    );
                }
            }
            info!("file '{}' has been downloaded", self.dest.display());
        }
        self.state = SessionState::Completed;
        Ok(SessionFlow::Finished)
    }

    fn on_fail(&mut self, reason: String) -> EngineResult<SessionFlow> {
        self.close_cursor();
        if self.aborted {
            self.state = SessionState::Aborted;
            return Ok(SessionFlow::Finished);
        }

        warn!("failed to download '{}': {}", self.url(), reason);
        match self.current_record() {
            Some(record) => {
                self.persist(record.commit_bytes(DownloadStatus::Error, self.live_bytes.max(record.committed_bytes)));
            }
            None => self.remove_destination(),
        }
        self.state = SessionState::Failed;
        Err(EngineError::remote(self.url(), reason))
    }

    /// Open-or-presize failure before any byte streamed.
    fn startup_io_failure(&mut self, e: io::Error) -> EngineResult<SessionFlow> {
        warn!("failed to open file '{}': {}", self.dest.display(), e);
        match self.current_record() {
            Some(record) => self.persist(record.with_status(DownloadStatus::Error)),
            None => self.remove_destination(),
        }
        self.state = SessionState::Failed;
        Err(EngineError::io(self.dest.clone(), e))
    }

    fn fail_io(&mut self, e: io::Error) -> EngineResult<SessionFlow> {
        self.close_cursor();
        if let Some(record) = self.record.clone() {
            self.persist(record.commit_bytes(DownloadStatus::Error, self.live_bytes));
        }
        self.state = SessionState::Failed;
        Err(EngineError::io(self.dest.clone(), e))
    }

    /// Mirror a record mutation into the index and the log.
    fn persist(&mut self, record: DownloadRecord) {
        self.index.upsert(record.clone());
        self.log.save(&record);
        self.record = Some(record);
    }

    /// The record this transfer answers for, persisted or not yet.
    fn current_record(&self) -> Option<DownloadRecord> {
        if self.record.is_some() {
            return self.record.clone();
        }
        match &self.policy {
            StartPolicy::Resume { record } => Some(record.clone()),
            StartPolicy::Fresh { .. } => None,
        }
    }

    fn close_cursor(&mut self) {
        if let Some(cursor) = self.cursor.take() {
            if let Err(e) = cursor.close() {
                warn!("failed to close file '{}': {}", self.dest.display(), e);
            }
        }
    }

    fn remove_destination(&self) {
        if let Err(e) = std::fs::remove_file(&self.dest) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(
                    "failed to delete file '{}' after failing to download it: {}",
                    self.dest.display(),
                    e
                );
            }
        }
    }

    fn url(&self) -> &str {
        match &self.policy {
            StartPolicy::Fresh { request, .. } => &request.url,
            StartPolicy::Resume { record } => &record.url,
        }
    }
}
