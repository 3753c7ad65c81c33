//! In-memory backend variant (no on-disk format, no crash recovery).
//!
//! Mirrors [`crate::backend::Backend`]'s public surface closely enough that
//! an embedding application can hold either one behind a
//! `Box<dyn CacheStore>` (see [`crate::backend::CacheStore`]), but every
//! entry, the LRU order, and the stats record live in ordinary heap
//! structures. There is no generation counter, no dirty-flag protocol, and
//! no block-file allocator: `this_id` is meaningless here and entries are
//! simply dropped from the map on eviction or doom.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::backend::{CacheEntry, CacheStore};
use crate::config::DEFAULT_MEMORY_ONLY_MAX_SIZE;
use crate::error::{CacheError, Result};
use crate::sparse::{ChildBacking, SparseControl};
use crate::stats::Stats;

const NUM_STREAMS: usize = 4;
const SPARSE_STREAM: usize = 2;
const CHILD_DATA_STREAM: usize = 1;
const MAX_STREAM_FRACTION: u64 = 8;

fn now_secs() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

struct MemoryEntryInner {
    key: Vec<u8>,
    streams: Mutex<[Vec<u8>; NUM_STREAMS]>,
    signature: Mutex<Option<u64>>,
    last_used: AtomicU64,
    last_modified: AtomicU64,
    doomed: AtomicBool,
}

impl MemoryEntryInner {
    fn total_size(&self) -> u64 {
        self.streams.lock().iter().map(|s| s.len() as u64).sum()
    }
}

struct MemoryBackendInner {
    entries: DashMap<Vec<u8>, Arc<MemoryEntryInner>>,
    /// Most-recently-used key at the front; approximates the disk backend's
    /// rankings list without needing a transaction log, since nothing here
    /// survives a restart.
    order: Mutex<VecDeque<Vec<u8>>>,
    num_bytes: AtomicU64,
    max_size: AtomicU64,
    stats: Arc<Stats>,
    sparse_in_flight: DashMap<Vec<u8>, ()>,
}

/// The handle returned by [`MemoryBackend::open_entry`]/`create_entry`.
pub struct MemoryEntry {
    backend: Arc<MemoryBackendInner>,
    inner: Arc<MemoryEntryInner>,
}

/// The in-memory counterpart to [`crate::backend::Backend`].
#[derive(Clone)]
pub struct MemoryBackend {
    inner: Arc<MemoryBackendInner>,
}

impl MemoryBackend {
    pub fn new(max_bytes: Option<u64>) -> MemoryBackend {
        MemoryBackend {
            inner: Arc::new(MemoryBackendInner {
                entries: DashMap::new(),
                order: Mutex::new(VecDeque::new()),
                num_bytes: AtomicU64::new(0),
                max_size: AtomicU64::new(max_bytes.unwrap_or(DEFAULT_MEMORY_ONLY_MAX_SIZE)),
                stats: Arc::new(Stats::new()),
                sparse_in_flight: DashMap::new(),
            }),
        }
    }

    pub fn get_entry_count(&self) -> i32 {
        self.inner.entries.len() as i32
    }

    pub fn get_stats(&self) -> Vec<(String, i64)> {
        let mut pairs = self.inner.stats.as_pairs();
        if let Some(first) = pairs.iter_mut().find(|(name, _)| name == "Entries") {
            first.1 = self.get_entry_count() as i64;
        }
        pairs
    }

    pub fn set_max_size(&self, max_bytes: u64) {
        self.inner.max_size.store(max_bytes, Ordering::Relaxed);
    }

    fn touch(&self, key: &[u8]) {
        let mut order = self.inner.order.lock();
        order.retain(|k| k != key);
        order.push_front(key.to_vec());
    }

    pub fn open_entry(&self, key: &[u8]) -> Result<Option<MemoryEntry>> {
        match self.inner.entries.get(key) {
            Some(inner) if !inner.doomed.load(Ordering::SeqCst) => {
                inner.last_used.store(now_secs(), Ordering::Relaxed);
                self.touch(key);
                self.inner.stats.on_open_hit();
                Ok(Some(MemoryEntry { backend: self.inner.clone(), inner: inner.clone() }))
            }
            _ => {
                self.inner.stats.on_open_miss();
                Ok(None)
            }
        }
    }

    pub fn create_entry(&self, key: &[u8]) -> Result<MemoryEntry> {
        if self.inner.entries.contains_key(key) {
            return Err(CacheError::AlreadyExists(format!("entry already exists for this key, length {}", key.len())));
        }
        let now = now_secs();
        let inner = Arc::new(MemoryEntryInner {
            key: key.to_vec(),
            streams: Mutex::new(Default::default()),
            signature: Mutex::new(None),
            last_used: AtomicU64::new(now),
            last_modified: AtomicU64::new(now),
            doomed: AtomicBool::new(false),
        });
        self.inner.entries.insert(key.to_vec(), inner.clone());
        self.touch(key);
        self.inner.stats.on_create(false);
        Ok(MemoryEntry { backend: self.inner.clone(), inner })
    }

    pub fn doom_entry(&self, key: &[u8]) -> Result<bool> {
        match self.inner.entries.remove(key) {
            Some((_, inner)) => {
                inner.doomed.store(true, Ordering::SeqCst);
                self.inner.num_bytes.fetch_sub(inner.total_size().min(u64::MAX), Ordering::Relaxed);
                self.inner.order.lock().retain(|k| k != key);
                self.inner.stats.on_doom();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn doom_all_entries(&self) -> Result<bool> {
        self.inner.stats.on_doom_all();
        self.inner.entries.clear();
        self.inner.order.lock().clear();
        self.inner.num_bytes.store(0, Ordering::Relaxed);
        Ok(true)
    }

    fn doom_matching(&self, predicate: impl Fn(u64) -> bool) -> Result<bool> {
        let matching: Vec<Vec<u8>> = self
            .inner
            .entries
            .iter()
            .filter(|entry| predicate(entry.last_used.load(Ordering::Relaxed)))
            .map(|entry| entry.key().clone())
            .collect();
        for key in matching {
            self.doom_entry(&key)?;
        }
        Ok(true)
    }

    pub fn doom_entries_between(&self, t0: u64, t1: u64) -> Result<bool> {
        self.doom_matching(|last_used| last_used >= t0 && last_used < t1)
    }

    pub fn doom_entries_since(&self, t0: u64) -> Result<bool> {
        self.doom_matching(|last_used| last_used >= t0)
    }

    /// Drops least-recently-used entries until `num_bytes` is back under
    /// `max_size`. Unlike the disk backend there is no multi-queue
    /// reuse-aware variant here: every entry lives on the same order list,
    /// since there is no dirty/open-state protocol to make demotion to a
    /// `DELETED` list meaningful without a restart to recover from.
    fn maybe_evict(&self) {
        let max_size = self.inner.max_size.load(Ordering::Relaxed);
        loop {
            if self.inner.num_bytes.load(Ordering::Relaxed) <= max_size {
                break;
            }
            let victim = self.inner.order.lock().pop_back();
            let Some(key) = victim else { break };
            if let Some((_, inner)) = self.inner.entries.remove(&key) {
                self.inner.num_bytes.fetch_sub(inner.total_size(), Ordering::Relaxed);
                self.inner.stats.on_eviction(1);
            }
        }
    }
}

impl MemoryEntry {
    pub fn get_key(&self) -> Result<Vec<u8>> {
        Ok(self.inner.key.clone())
    }

    pub fn get_last_used(&self) -> Result<u64> {
        Ok(self.inner.last_used.load(Ordering::Relaxed))
    }

    pub fn get_last_modified(&self) -> Result<u64> {
        Ok(self.inner.last_modified.load(Ordering::Relaxed))
    }

    pub fn get_data_size(&self, stream: usize) -> Result<i32> {
        Ok(self.inner.streams.lock()[stream].len() as i32)
    }

    pub fn read_data(&self, stream: usize, offset: usize, buf: &mut [u8]) -> Result<usize> {
        let streams = self.inner.streams.lock();
        let data = &streams[stream];
        if offset >= data.len() {
            return Ok(0);
        }
        let n = buf.len().min(data.len() - offset);
        buf[..n].copy_from_slice(&data[offset..offset + n]);
        Ok(n)
    }

    pub fn write_data(&self, stream: usize, offset: usize, buf: &[u8], truncate: bool) -> Result<usize> {
        let max_stream = self.backend.max_size.load(Ordering::Relaxed) / MAX_STREAM_FRACTION;
        if (offset + buf.len()) as u64 > max_stream {
            return Err(CacheError::LimitExceeded(format!(
                "stream {stream} write would exceed the per-stream cap of {max_stream} bytes"
            )));
        }
        let old_total = self.inner.total_size();
        {
            let mut streams = self.inner.streams.lock();
            let data = &mut streams[stream];
            let needed = offset + buf.len();
            if truncate {
                data.resize(needed, 0);
            } else if data.len() < needed {
                data.resize(needed, 0);
            }
            data[offset..offset + buf.len()].copy_from_slice(buf);
        }
        let new_total = self.inner.total_size();
        self.inner.last_modified.store(now_secs(), Ordering::Relaxed);
        self.inner.last_used.store(now_secs(), Ordering::Relaxed);
        self.backend.num_bytes.fetch_sub(old_total.min(u64::MAX), Ordering::Relaxed);
        self.backend.num_bytes.fetch_add(new_total, Ordering::Relaxed);
        let backend = MemoryBackend { inner: self.backend.clone() };
        backend.maybe_evict();
        Ok(buf.len())
    }

    fn sparse_guard(&self) -> Result<()> {
        if self.backend.sparse_in_flight.contains_key(&self.inner.key) {
            return Err(CacheError::Unsupported("overlapping sparse operations on the same entry".into()));
        }
        self.backend.sparse_in_flight.insert(self.inner.key.clone(), ());
        Ok(())
    }

    fn sparse_release(&self) {
        self.backend.sparse_in_flight.remove(&self.inner.key);
    }

    fn sparse_control(&self) -> Result<SparseControl> {
        let key_str = String::from_utf8_lossy(&self.inner.key).to_string();
        let mut guard = self.inner.signature.lock();
        let signature = match *guard {
            Some(sig) => sig,
            None => {
                let sig = rand::random::<u64>() | 1;
                *guard = Some(sig);
                sig
            }
        };
        Ok(SparseControl::new(key_str, signature))
    }

    pub fn read_sparse_data(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        self.sparse_guard()?;
        let result = (|| {
            let control = self.sparse_control()?;
            let mut backing = MemoryChildBacking { backend: &self.backend };
            control.read(&mut backing, offset, buf)
        })();
        self.sparse_release();
        result
    }

    pub fn write_sparse_data(&self, offset: u64, buf: &[u8]) -> Result<usize> {
        self.sparse_guard()?;
        let result = (|| {
            let control = self.sparse_control()?;
            let mut backing = MemoryChildBacking { backend: &self.backend };
            control.write(&mut backing, offset, buf)
        })();
        self.sparse_release();
        result
    }

    pub fn get_available_range(&self, offset: u64, len: u64) -> Result<(u64, u64)> {
        self.sparse_guard()?;
        let result = (|| {
            let control = self.sparse_control()?;
            let mut backing = MemoryChildBacking { backend: &self.backend };
            Ok(control.get_available_range(&mut backing, offset, len)?.unwrap_or((offset, 0)))
        })();
        self.sparse_release();
        result
    }

    pub fn doom(&self) -> Result<()> {
        self.inner.doomed.store(true, Ordering::SeqCst);
        let backend = MemoryBackend { inner: self.backend.clone() };
        backend.doom_entry(&self.inner.key)?;
        Ok(())
    }
}

/// Drives sparse child entries through `MemoryBackend::open_entry`/
/// `create_entry`, the same adapter shape as `backend::BackendChildBacking`.
struct MemoryChildBacking<'a> {
    backend: &'a Arc<MemoryBackendInner>,
}

impl MemoryChildBacking<'_> {
    fn handle(&self) -> MemoryBackend {
        MemoryBackend { inner: self.backend.clone() }
    }
}

impl ChildBacking for MemoryChildBacking<'_> {
    fn read_child(&mut self, key: &str, offset: u64, buf: &mut [u8]) -> Result<usize> {
        match self.handle().open_entry(key.as_bytes())? {
            Some(entry) => entry.read_data(CHILD_DATA_STREAM, offset as usize, buf),
            None => Ok(0),
        }
    }

    fn write_child(&mut self, key: &str, offset: u64, buf: &[u8]) -> Result<()> {
        let backend = self.handle();
        let entry = match backend.open_entry(key.as_bytes())? {
            Some(entry) => entry,
            None => backend.create_entry(key.as_bytes())?,
        };
        entry.write_data(CHILD_DATA_STREAM, offset as usize, buf, false)?;
        Ok(())
    }

    fn child_bitmap(&mut self, key: &str, signature: u64, parent_key_len: u32) -> Result<crate::format::SparseData> {
        let backend = self.handle();
        if let Some(entry) = backend.open_entry(key.as_bytes())? {
            let mut buf = [0u8; crate::format::SPARSE_DATA_SIZE];
            let n = entry.read_data(SPARSE_STREAM, 0, &mut buf)?;
            if n == crate::format::SPARSE_DATA_SIZE {
                let data = crate::format::SparseData::decode(&buf);
                if data.header.signature == signature {
                    return Ok(data);
                }
                return Err(CacheError::Unsupported("sparse child signature from a stale generation".into()));
            }
        }
        Ok(crate::format::SparseData::new(signature, parent_key_len))
    }

    fn save_child_bitmap(&mut self, key: &str, data: &crate::format::SparseData) -> Result<()> {
        let backend = self.handle();
        let entry = match backend.open_entry(key.as_bytes())? {
            Some(entry) => entry,
            None => backend.create_entry(key.as_bytes())?,
        };
        entry.write_data(SPARSE_STREAM, 0, &data.encode(), false)?;
        Ok(())
    }
}

impl CacheEntry for MemoryEntry {
    fn get_key(&self) -> Result<Vec<u8>> {
        MemoryEntry::get_key(self)
    }
    fn get_last_used(&self) -> Result<u64> {
        MemoryEntry::get_last_used(self)
    }
    fn get_last_modified(&self) -> Result<u64> {
        MemoryEntry::get_last_modified(self)
    }
    fn get_data_size(&self, stream: usize) -> Result<i32> {
        MemoryEntry::get_data_size(self, stream)
    }
    fn read_data(&self, stream: usize, offset: usize, buf: &mut [u8]) -> Result<usize> {
        MemoryEntry::read_data(self, stream, offset, buf)
    }
    fn write_data(&self, stream: usize, offset: usize, buf: &[u8], truncate: bool) -> Result<usize> {
        MemoryEntry::write_data(self, stream, offset, buf, truncate)
    }
    fn doom(&self) -> Result<()> {
        MemoryEntry::doom(self)
    }
}

impl CacheStore for MemoryBackend {
    fn get_entry_count(&self) -> i32 {
        MemoryBackend::get_entry_count(self)
    }
    fn open_entry(&self, key: &[u8]) -> Result<Option<Box<dyn CacheEntry>>> {
        Ok(MemoryBackend::open_entry(self, key)?.map(|e| Box::new(e) as Box<dyn CacheEntry>))
    }
    fn create_entry(&self, key: &[u8]) -> Result<Box<dyn CacheEntry>> {
        Ok(Box::new(MemoryBackend::create_entry(self, key)?))
    }
    fn doom_entry(&self, key: &[u8]) -> Result<bool> {
        MemoryBackend::doom_entry(self, key)
    }
    fn doom_all_entries(&self) -> Result<bool> {
        MemoryBackend::doom_all_entries(self)
    }
    fn doom_entries_between(&self, t0: u64, t1: u64) -> Result<bool> {
        MemoryBackend::doom_entries_between(self, t0, t1)
    }
    fn doom_entries_since(&self, t0: u64) -> Result<bool> {
        MemoryBackend::doom_entries_since(self, t0)
    }
    fn get_stats(&self) -> Vec<(String, i64)> {
        MemoryBackend::get_stats(self)
    }
    fn set_max_size(&self, max_bytes: u64) {
        MemoryBackend::set_max_size(self, max_bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_write_read_round_trips() {
        let backend = MemoryBackend::new(None);
        let entry = backend.create_entry(b"k1").unwrap();
        entry.write_data(0, 0, b"hello", false).unwrap();
        let mut buf = [0u8; 5];
        let read = entry.read_data(0, 0, &mut buf).unwrap();
        assert_eq!(read, 5);
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn create_fails_on_duplicate_key() {
        let backend = MemoryBackend::new(None);
        let _entry = backend.create_entry(b"dup").unwrap();
        assert!(backend.create_entry(b"dup").is_err());
    }

    #[test]
    fn doom_removes_entry_so_reopen_misses() {
        let backend = MemoryBackend::new(None);
        let entry = backend.create_entry(b"x").unwrap();
        entry.doom().unwrap();
        assert!(backend.open_entry(b"x").unwrap().is_none());
    }

    #[test]
    fn eviction_trims_entry_count_under_a_tight_budget() {
        let max_size: u64 = 2 * 1024 * 1024;
        let backend = MemoryBackend::new(Some(max_size));

        // Fill all four streams right up to the per-stream cap (max_size / 8),
        // so one full entry weighs a quarter of the budget and a third one
        // always pushes the cache over it.
        let stream_payload = vec![7u8; (max_size / 8) as usize];
        let keys: Vec<String> = (0..10).map(|i| format!("key{i}")).collect();
        for key in &keys {
            let entry = backend.create_entry(key.as_bytes()).unwrap();
            for stream in 0..4 {
                entry.write_data(stream, 0, &stream_payload, false).unwrap();
            }
        }

        assert!(
            backend.get_entry_count() <= 2,
            "expected at most 2 survivors under a budget of two full entries, got {}",
            backend.get_entry_count()
        );
        assert!(
            backend.open_entry(keys.last().unwrap().as_bytes()).unwrap().is_some(),
            "the most recently written entry should survive eviction"
        );
        assert!(
            backend.open_entry(keys[0].as_bytes()).unwrap().is_none(),
            "the oldest entry should have been evicted"
        );
    }

    #[test]
    fn sparse_round_trip_through_memory_entry() {
        let backend = MemoryBackend::new(None);
        let entry = backend.create_entry(b"sparse-key").unwrap();
        entry.write_sparse_data(0, &[9u8; 1024]).unwrap();
        let mut buf = [0u8; 1024];
        let read = entry.read_sparse_data(0, &mut buf).unwrap();
        assert_eq!(read, 1024);
        assert_eq!(buf, [9u8; 1024]);
    }
}
