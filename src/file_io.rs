//! Synchronous and asynchronous file access.
//!
//! `CacheFile` wraps a single on-disk file behind a mutex-guarded handle,
//! the same shape this codebase's other storage layer uses for its data
//! file: positional reads/writes take the lock only for the duration of the
//! syscall, and async completions are dispatched onto a small background
//! pool so callers never block the owning loop on disk latency.
//! `MappedFile` layers a `memmap2` view over the file's header region for
//! the block-file header + bitmap, which `block_files.rs` mutates in place.

use std::fs::{File as StdFile, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

use memmap2::{MmapMut, MmapOptions};
use parking_lot::Mutex;

use crate::error::{CacheError, Result};

/// Per-file I/O counters, surfaced through `Backend::get_stats`.
#[derive(Debug, Default)]
pub struct FileStats {
    pub reads: AtomicU64,
    pub writes: AtomicU64,
    pub bytes_read: AtomicU64,
    pub bytes_written: AtomicU64,
}

/// A single on-disk cache file (an `index`, `data_N`, or `f_XXXXXX` file).
pub struct CacheFile {
    path: PathBuf,
    handle: Mutex<StdFile>,
    stats: Arc<FileStats>,
}

impl CacheFile {
    pub fn open(path: impl AsRef<Path>, create: bool) -> Result<CacheFile> {
        let path = path.as_ref().to_path_buf();
        let handle = OpenOptions::new()
            .read(true)
            .write(true)
            .create(create)
            .truncate(false)
            .open(&path)?;
        Ok(CacheFile { path, handle: Mutex::new(handle), stats: Arc::new(FileStats::default()) })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> Result<u64> {
        Ok(self.handle.lock().metadata()?.len())
    }

    pub fn set_len(&self, len: u64) -> Result<()> {
        self.handle.lock().set_len(len)?;
        Ok(())
    }

    /// Reads exactly `buf.len()` bytes starting at `offset`. Short reads
    /// past end-of-file are zero-filled, matching the engine-wide rule that
    /// reading past the end of a record returns zeros rather than an error.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let mut handle = self.handle.lock();
        handle.seek(SeekFrom::Start(offset))?;
        let read = read_zero_padded(&mut *handle, buf)?;
        self.stats.reads.fetch_add(1, Ordering::Relaxed);
        self.stats.bytes_read.fetch_add(read as u64, Ordering::Relaxed);
        Ok(())
    }

    pub fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        let mut handle = self.handle.lock();
        handle.seek(SeekFrom::Start(offset))?;
        handle.write_all(buf)?;
        self.stats.writes.fetch_add(1, Ordering::Relaxed);
        self.stats.bytes_written.fetch_add(buf.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    pub fn sync_all(&self) -> Result<()> {
        self.handle.lock().sync_all()?;
        Ok(())
    }

    pub fn stats(&self) -> Arc<FileStats> {
        self.stats.clone()
    }

    /// Reads `buf.len()` bytes at `offset` on a background thread and
    /// invokes `completion` with the result once done. Used for entry data
    /// streams per the engine's suspension-point model (metadata stays
    /// synchronous through the memory-mapped view; only stream I/O pends).
    pub fn read_at_async<F>(self: &Arc<Self>, offset: u64, mut buf: Vec<u8>, completion: F)
    where
        F: FnOnce(Result<Vec<u8>>) + Send + 'static,
    {
        let this = self.clone();
        thread::spawn(move || {
            let result = this.read_at(offset, &mut buf).map(|_| buf);
            completion(result);
        });
    }

    pub fn write_at_async<F>(self: &Arc<Self>, offset: u64, buf: Vec<u8>, completion: F)
    where
        F: FnOnce(Result<usize>) + Send + 'static,
    {
        let this = self.clone();
        thread::spawn(move || {
            let len = buf.len();
            let result = this.write_at(offset, &buf).map(|_| len);
            completion(result);
        });
    }
}

fn read_zero_padded(handle: &mut StdFile, buf: &mut [u8]) -> Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        match handle.read(&mut buf[total..]) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(CacheError::Io(e)),
        }
    }
    for byte in &mut buf[total..] {
        *byte = 0;
    }
    Ok(total)
}

/// A file with a memory-mapped view over its first `len` bytes: the block
/// header + allocation bitmap for block-files, or the index header + hash
/// table for the index file.
pub struct MappedFile {
    file: Arc<CacheFile>,
    mmap: Mutex<MmapMut>,
}

impl MappedFile {
    /// Opens `path`, ensuring the underlying file is at least `len` bytes,
    /// and maps the first `len` bytes for in-place mutation.
    pub fn open(path: impl AsRef<Path>, create: bool, len: u64) -> Result<MappedFile> {
        let file = Arc::new(CacheFile::open(path, create)?);
        if file.len()? < len {
            file.set_len(len)?;
        }
        let mmap = unsafe {
            MmapOptions::new()
                .len(len as usize)
                .map_mut(&*file.handle.lock())
                .map_err(CacheError::Io)?
        };
        Ok(MappedFile { file, mmap: Mutex::new(mmap) })
    }

    pub fn file(&self) -> &Arc<CacheFile> {
        &self.file
    }

    pub fn view(&self) -> parking_lot::MutexGuard<'_, MmapMut> {
        self.mmap.lock()
    }

    pub fn flush(&self) -> Result<()> {
        self.mmap.lock().flush().map_err(CacheError::Io)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn write_then_read_round_trips() {
        let dir = tempdir().unwrap();
        let file = CacheFile::open(dir.path().join("data_0"), true).unwrap();
        file.write_at(0, b"hello world").unwrap();
        let mut buf = [0u8; 11];
        file.read_at(0, &mut buf).unwrap();
        assert_eq!(&buf, b"hello world");
    }

    #[test]
    fn read_past_end_is_zero_filled() {
        let dir = tempdir().unwrap();
        let file = CacheFile::open(dir.path().join("data_0"), true).unwrap();
        file.write_at(0, b"ab").unwrap();
        let mut buf = [0xffu8; 8];
        file.read_at(0, &mut buf).unwrap();
        assert_eq!(&buf[0..2], b"ab");
        assert_eq!(&buf[2..], &[0u8; 6]);
    }

    #[test]
    fn async_write_then_async_read_round_trips() {
        let dir = tempdir().unwrap();
        let file = Arc::new(CacheFile::open(dir.path().join("f_000001"), true).unwrap());
        let (tx, rx) = std::sync::mpsc::channel();
        file.write_at_async(0, b"payload".to_vec(), move |result| {
            tx.send(result).unwrap();
        });
        rx.recv().unwrap().unwrap();

        let (tx2, rx2) = std::sync::mpsc::channel();
        file.read_at_async(0, vec![0u8; 7], move |result| {
            tx2.send(result).unwrap();
        });
        let buf = rx2.recv().unwrap().unwrap();
        assert_eq!(&buf, b"payload");
    }

    #[test]
    fn mapped_file_mutation_is_visible_after_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data_1");
        {
            let mapped = MappedFile::open(&path, true, 4096).unwrap();
            mapped.view()[0..4].copy_from_slice(&42u32.to_le_bytes());
            mapped.flush().unwrap();
        }
        let mapped = MappedFile::open(&path, false, 4096).unwrap();
        let value = u32::from_le_bytes(mapped.view()[0..4].try_into().unwrap());
        assert_eq!(value, 42);
    }
}
