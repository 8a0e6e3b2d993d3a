//! Configuration for the download engine.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{EngineError, EngineResult};

/// Default size of one memory-mapped write window (64 MiB).
pub const DEFAULT_MAP_SIZE: u64 = 64 * 1024 * 1024;

/// Default durable checkpoint interval in bytes (1 GiB).
pub const DEFAULT_COMMIT_SIZE: u64 = 1024 * 1024 * 1024;

/// Configuration for [`crate::engine::DownloadEngine`].
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Base directory all destinations resolve under.
    ///
    /// Created on first use if absent.
    pub download_dir: PathBuf,

    /// Path of the append-only record log.
    pub log_path: PathBuf,

    /// Size of one memory-mapped write window.
    ///
    /// Bounds memory usage per active transfer regardless of file size.
    pub map_size: u64,

    /// Byte interval between durable checkpoint commits.
    pub commit_size: u64,

    /// Maximum number of redirects to follow on the outbound request.
    pub max_redirects: usize,

    /// Timeout for individual reads from the remote stream.
    pub read_timeout: Duration,

    /// User-Agent header sent on outbound requests.
    pub user_agent: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            download_dir: PathBuf::from("./downloads"),
            log_path: PathBuf::from("./storage.log"),
            map_size: DEFAULT_MAP_SIZE,
            commit_size: DEFAULT_COMMIT_SIZE,
            max_redirects: 5,
            read_timeout: Duration::from_secs(60),
            user_agent: format!("fetchd/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl EngineConfig {
    /// Create a configuration rooted at the given download directory.
    pub fn new(download_dir: PathBuf) -> Self {
        Self {
            download_dir,
            ..Default::default()
        }
    }

    /// Set the record log path.
    pub fn with_log_path(mut self, path: PathBuf) -> Self {
        self.log_path = path;
        self
    }

    /// Set the mapped window size.
    pub fn with_map_size(mut self, map_size: u64) -> Self {
        self.map_size = map_size;
        self
    }

    /// Set the checkpoint commit interval.
    pub fn with_commit_size(mut self, commit_size: u64) -> Self {
        self.commit_size = commit_size;
        self
    }

    /// Set the redirect limit.
    pub fn with_max_redirects(mut self, max: usize) -> Self {
        self.max_redirects = max;
        self
    }

    /// Set the remote read timeout.
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub(crate) fn validate(&self) -> EngineResult<()> {
        if self.map_size == 0 {
            return Err(EngineError::Validation("map_size must be non-zero".to_string()));
        }
        if self.commit_size == 0 {
            return Err(EngineError::Validation(
                "commit_size must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.map_size, DEFAULT_MAP_SIZE);
        assert_eq!(config.commit_size, DEFAULT_COMMIT_SIZE);
        assert_eq!(config.max_redirects, 5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_methods() {
        let config = EngineConfig::new(PathBuf::from("/data/downloads"))
            .with_log_path(PathBuf::from("/data/storage.log"))
            .with_map_size(1024)
            .with_commit_size(4096);

        assert_eq!(config.download_dir, PathBuf::from("/data/downloads"));
        assert_eq!(config.log_path, PathBuf::from("/data/storage.log"));
        assert_eq!(config.map_size, 1024);
        assert_eq!(config.commit_size, 4096);
    }

    #[test]
    fn test_zero_sizes_rejected() {
        assert!(EngineConfig::default().with_map_size(0).validate().is_err());
        assert!(EngineConfig::default()
            .with_commit_size(0)
            .validate()
            .is_err());
    }
}
