//! Fetchd - resumable remote download engine
//!
//! This library provides the core of a remote download server: it accepts
//! download jobs, streams the remote content to local disk through bounded
//! memory-mapped write windows, and commits progress to an append-only
//! record log so unfinished transfers survive a process restart.
//!
//! # Architecture
//!
//! - [`storage::RecordLog`] - append-only log of record mutations, replayed
//!   sequentially on boot. A single dedicated writer task serializes all
//!   appends.
//! - [`storage::RecordIndex`] - in-memory table of download records, keyed
//!   by id and by owner, rebuilt from the log at startup.
//! - [`transfer::TransferSession`] - per-download state machine that turns
//!   HTTP response events into file writes and durable checkpoints.
//! - [`engine::DownloadEngine`] - lifecycle orchestration: create, resume,
//!   cancel and delete downloads, plus boot-time replay of unfinished jobs.
//!
//! The wire protocol, command routing and session handling that sit in
//! front of the engine are external collaborators; the engine exposes plain
//! async methods returning [`model::StatusSnapshot`] projections.

pub mod config;
pub mod engine;
pub mod error;
pub mod model;
pub mod storage;
pub mod transfer;

pub use config::EngineConfig;
pub use engine::DownloadEngine;
pub use error::{EngineError, EngineResult};
pub use model::{DownloadRecord, DownloadRequest, DownloadStatus, StatusSnapshot};
