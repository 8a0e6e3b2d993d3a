//! Bounded memory-mapped write windows over the destination file.
//!
//! Body chunks are written into a mapped window of at most `map_size`
//! bytes. When the current window is exhausted the cursor flushes it and
//! transparently re-maps at the next offset, so memory usage stays bounded
//! for files of arbitrary size. A single write may span several windows;
//! the cursor splits it across the boundary.

use std::fs::File;
use std::io;

use memmap2::{MmapMut, MmapOptions};

/// Mapping offsets must be page-aligned; 64 KiB covers every page size we
/// run on (4K x86, 16K/64K aarch64), so windows are aligned down to it and
/// the sub-window delta is absorbed into the initial write position.
const WINDOW_ALIGN: u64 = 64 * 1024;

/// Write cursor over the destination file.
pub struct WindowCursor {
    file: File,
    window: Option<MmapMut>,
    /// File offset of byte 0 of the current window (aligned).
    window_start: u64,
    /// Next write position within the current window.
    window_pos: usize,
    map_size: u64,
    /// Expected final file size, `-1` when unknown. Known sizes bound the
    /// last window to the remaining bytes.
    total_hint: i64,
}

impl WindowCursor {
    /// Create a cursor positioned at `start_offset`.
    ///
    /// The file must be open for both reading and writing; mapping a
    /// write window requires it.
    pub fn new(file: File, start_offset: u64, map_size: u64, total_hint: i64) -> Self {
        let window_start = start_offset - (start_offset % WINDOW_ALIGN);
        Self {
            file,
            window: None,
            window_start,
            window_pos: (start_offset - window_start) as usize,
            map_size,
            total_hint,
        }
    }

    /// Absolute file offset of the next write.
    pub fn position(&self) -> u64 {
        self.window_start + self.window_pos as u64
    }

    /// Write the chunk at the current position, re-mapping windows as they
    /// fill up. Never writes beyond the chunk even when it spans windows.
    pub fn write(&mut self, mut chunk: &[u8]) -> io::Result<()> {
        while !chunk.is_empty() {
            if self.remaining_in_window() == 0 {
                self.remap()?;
            }
            let take = chunk.len().min(self.remaining_in_window());
            let pos = self.window_pos;
            if let Some(window) = self.window.as_mut() {
                window[pos..pos + take].copy_from_slice(&chunk[..take]);
            }
            self.window_pos += take;
            chunk = &chunk[take..];
        }
        Ok(())
    }

    /// Flush the current window to disk.
    pub fn flush(&self) -> io::Result<()> {
        match &self.window {
            Some(window) => window.flush(),
            None => Ok(()),
        }
    }

    /// Flush and unmap, leaving the file length as is.
    pub fn close(mut self) -> io::Result<()> {
        if let Some(window) = self.window.take() {
            window.flush()?;
        }
        self.file.sync_data()
    }

    /// Flush, unmap, and truncate the file to `len` valid bytes, trimming
    /// any pre-sized or window-extension padding.
    pub fn finish(mut self, len: u64) -> io::Result<()> {
        if let Some(window) = self.window.take() {
            window.flush()?;
        }
        self.file.set_len(len)?;
        self.file.sync_data()
    }

    fn remaining_in_window(&self) -> usize {
        match &self.window {
            Some(window) => window.len() - self.window_pos,
            None => 0,
        }
    }

    /// Map the next window, extending the file first when the mapping
    /// would run past the current end (the kernel does not grow a file to
    /// cover a mapping on its own).
    fn remap(&mut self) -> io::Result<()> {
        if let Some(window) = self.window.take() {
            window.flush()?;
            self.window_start += self.window_pos as u64;
            self.window_pos = 0;
        }

        let position = self.window_start + self.window_pos as u64;
        let aligned_start = position - (position % WINDOW_ALIGN);
        let delta = (position - aligned_start) as usize;

        let remaining = self.total_hint - position as i64;
        let size = if remaining > 0 {
            self.map_size.min(remaining as u64)
        } else {
            self.map_size
        };
        let len = size as usize + delta;

        let required = aligned_start + len as u64;
        if self.file.metadata()?.len() < required {
            self.file.set_len(required)?;
        }

        let window = unsafe {
            MmapOptions::new()
                .offset(aligned_start)
                .len(len)
                .map_mut(&self.file)?
        };
        self.window = Some(window);
        self.window_start = aligned_start;
        self.window_pos = delta;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tempfile::tempdir;

    fn open_rw(path: &std::path::Path) -> File {
        std::fs::OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(path)
            .unwrap()
    }

    #[test]
    fn test_write_within_one_window() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("f");
        let mut cursor = WindowCursor::new(open_rw(&path), 0, 1024, 5);

        cursor.write(b"abcde").unwrap();
        cursor.finish(5).unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"abcde");
    }

    #[test]
    fn test_write_spans_multiple_windows() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("f");
        let data: Vec<u8> = (0..100u8).collect();
        // A 16-byte window forces several re-mappings for 100 bytes.
        let mut cursor = WindowCursor::new(open_rw(&path), 0, 16, data.len() as i64);

        cursor.write(&data).unwrap();
        cursor.finish(data.len() as u64).unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), data);
    }

    #[test]
    fn test_write_at_unaligned_start_offset() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, b"ab\0\0\0").unwrap();

        let mut cursor = WindowCursor::new(open_rw(&path), 2, 16, 5);
        assert_eq!(cursor.position(), 2);

        cursor.write(b"cde").unwrap();
        cursor.finish(5).unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"abcde");
    }

    #[test]
    fn test_unknown_total_grows_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("f");
        let mut cursor = WindowCursor::new(open_rw(&path), 0, 8, -1);

        cursor.write(b"0123456789").unwrap();
        // Windows extended the file in map_size steps; finish trims back.
        cursor.finish(10).unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"0123456789");
    }

    #[test]
    fn test_finish_truncates_presized_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("f");
        let file = open_rw(&path);
        file.set_len(100).unwrap();

        let mut cursor = WindowCursor::new(file, 0, 32, 100);
        cursor.write(b"abc").unwrap();
        cursor.finish(3).unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"abc");
    }

    proptest! {
        /// Any split of the payload into chunks produces the same file as
        /// one contiguous write.
        #[test]
        fn test_chunking_is_transparent(
            data in proptest::collection::vec(any::<u8>(), 0..256),
            map_size in 1u64..32,
            splits in proptest::collection::vec(1usize..16, 0..32),
        ) {
            let dir = tempdir().unwrap();
            let path = dir.path().join("f");
            let mut cursor = WindowCursor::new(open_rw(&path), 0, map_size, data.len() as i64);

            let mut offset = 0;
            let mut splits = splits.into_iter();
            while offset < data.len() {
                let step = splits.next().unwrap_or(usize::MAX).min(data.len() - offset);
                cursor.write(&data[offset..offset + step]).unwrap();
                offset += step;
            }
            cursor.finish(data.len() as u64).unwrap();

            prop_assert_eq!(std::fs::read(&path).unwrap(), data);
        }
    }
}
