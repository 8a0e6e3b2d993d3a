//! Durable record log and the in-memory index rebuilt from it.
//!
//! The two halves are deliberately split: [`RecordLog`] owns all disk I/O
//! and serializes appends through a single writer task, while
//! [`RecordIndex`] is a pure in-memory cache that callers keep consistent
//! by mirroring every mutation to the log.

mod index;
mod log;

pub use index::RecordIndex;
pub use log::RecordLog;
