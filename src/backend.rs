//! Top-level coordinator: index table, hash lookup, entry lifecycle,
//! enumeration, stats, size bookkeeping, and error recovery.
//!
//! `Backend` is the single entry point the rest of this crate's modules are
//! built to serve: it owns the `index` file's header and hash table (mapped
//! in place the same way `block_files::BlockFiles` maps its headers), the
//! block-file allocator, the rankings subsystem, the eviction policy, and
//! the persisted stats record. Every public operation in `disk_cache` is a
//! method on `Backend` or on the `Entry` handles it hands out.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::address::{Addr, FileType};
use crate::block_files::BlockFiles;
use crate::entry::{EntryRecord, ExternalFiles, NUM_STREAMS};
use crate::eviction::{Eviction, EvictionHost, EvictionPolicy};
use crate::file_io::MappedFile;
use crate::format::{EntryState, IndexHeader, FLAG_CHILD_ENTRY, FLAG_PARENT_ENTRY, INDEX_HEADER_SIZE, MIN_INDEX_TABLE_LEN};
use crate::hash::hash as hash_key;
use crate::rankings::{RankingList, Rankings};
use crate::sparse::{child_key, ChildBacking, SparseControl};
use crate::stats::{ErrorCode, Stats};
use crate::error::{CacheError, Result};

/// Default size cap for a freshly created on-disk cache (80 MB), before any
/// experiment multiplier or `SetMaxSize` override.
pub const DEFAULT_MAX_SIZE: u64 = 80 * 1024 * 1024;
/// No single stream may exceed this fraction of the overall size budget.
const MAX_STREAM_FRACTION: u64 = 8;
/// Which stream holds the `SparseControl`/`SparseData` record for both
/// parent and child sparse entries.
const SPARSE_STREAM: usize = 2;
/// Which stream a sparse child stores its actual bytes in.
const CHILD_DATA_STREAM: usize = 1;

fn now_secs() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

/// One in-memory slot for a currently-open entry: the backend's answer to
/// the original's "pointer" back-reference (see crate-level design notes;
/// never a raw address, always an arena slot the backend alone owns).
struct OpenSlot {
    record: Mutex<EntryRecord>,
    refcount: AtomicU32,
    doomed: AtomicBool,
}

/// An iterator handle for `Backend::open_next_entry`. Walks the rankings
/// lists in head-to-tail (most- to least-recently-used) order across all
/// non-deleted lists, closing each entry before advancing so a long
/// enumeration never pins more than one entry open at a time.
pub struct EnumIterator {
    list_index: usize,
    next: Option<Addr>,
    started: bool,
}

impl Default for EnumIterator {
    fn default() -> EnumIterator {
        EnumIterator { list_index: 0, next: None, started: false }
    }
}

const ENUM_LISTS: [RankingList; 3] = [RankingList::NoUse, RankingList::LowUse, RankingList::HighUse];

/// A handle to a single open cache entry. Reads, writes, dooms, and closes
/// flow through here; dropping it releases the backend's reference and, if
/// the entry was doomed and no other handle remains, frees its storage.
pub struct Entry {
    backend: Arc<BackendInner>,
    entry_addr: Addr,
    slot: Arc<OpenSlot>,
}

struct BackendInner {
    dir: PathBuf,
    index: MappedFile,
    header: Mutex<IndexHeader>,
    block_files: Arc<BlockFiles>,
    rankings: Arc<Rankings>,
    eviction: Eviction,
    stats: Arc<Stats>,
    external: Arc<ExternalFiles>,
    this_id: u32,
    max_size: AtomicU64,
    policy: EvictionPolicy,
    open_entries: DashMap<u32, Arc<OpenSlot>>,
    sparse_in_flight: DashMap<u32, ()>,
    disabled: AtomicBool,
}

/// The top-level handle to an on-disk cache directory.
#[derive(Clone)]
pub struct Backend {
    inner: Arc<BackendInner>,
}

fn table_offset(index: u32) -> u64 {
    INDEX_HEADER_SIZE as u64 + index as u64 * 4
}

impl BackendInner {
    fn table_get(&self, index: u32) -> Addr {
        let view = self.index.view();
        let off = table_offset(index) as usize;
        Addr::from_raw(u32::from_le_bytes(view[off..off + 4].try_into().unwrap()))
    }

    fn table_set(&self, index: u32, value: Addr) {
        let mut view = self.index.view();
        let off = table_offset(index) as usize;
        view[off..off + 4].copy_from_slice(&value.raw().to_le_bytes());
    }

    fn flush_header(&self, header: &IndexHeader) {
        let encoded = header.encode();
        self.index.view()[0..encoded.len()].copy_from_slice(&encoded);
    }

    fn bucket_index(&self, key: &[u8], header: &IndexHeader) -> u32 {
        hash_key(key) & (header.table_len - 1)
    }

    fn check_disabled(&self) -> Result<()> {
        if self.disabled.load(Ordering::SeqCst) {
            return Err(CacheError::CriticalError("cache is disabled after a critical error".into()));
        }
        Ok(())
    }

    /// Loads the candidate at `addr`, running the same recovery checks
    /// `OpenEntry` applies per §4.9: a failing sanity check or a dirty
    /// generation from a run other than this one is recovered locally by
    /// unlinking the entry from its bucket and freeing its storage, after
    /// which the walk is restarted from the caller.
    fn load_candidate(&self, addr: Addr) -> Result<Option<EntryRecord>> {
        let mut record = EntryRecord::open(addr, self.block_files.clone(), self.external.clone())?;
        if record.sanity_check().is_err() || record.is_dirty(self.this_id)? {
            return Ok(None);
        }
        Ok(Some(record))
    }

    /// Unlinks the entry at `addr` from bucket `bucket` (given its known
    /// predecessor, or `None` if it is the bucket head) and releases its
    /// storage. Used both by corruption recovery and by `doom_entry`.
    fn unlink_and_free(&self, header: &mut IndexHeader, bucket: u32, addr: Addr, predecessor: Option<Addr>) -> Result<()> {
        let mut record = EntryRecord::open(addr, self.block_files.clone(), self.external.clone())?;
        let next = record.next_entry().unwrap_or(0);
        match predecessor {
            Some(pred) => {
                let mut pred_record = EntryRecord::open(pred, self.block_files.clone(), self.external.clone())?;
                pred_record.set_next_entry(next)?;
                pred_record.flush()?;
            }
            None => self.table_set(bucket, Addr::from_raw(next)),
        }

        let list = self.eviction.list_for_reuse_count(record.reuse_count().unwrap_or(0));
        let rankings_addr = record.rankings_addr();
        if self.rankings.get_next(rankings_addr).unwrap_or(None).is_some()
            || header.lru.heads[list.index()] == rankings_addr.raw()
            || header.lru.tails[list.index()] == rankings_addr.raw()
        {
            let _ = self.rankings.remove(&mut header.lru, list, rankings_addr);
        }

        let size = record.total_size().unwrap_or(0);
        header.num_bytes = header.num_bytes.saturating_sub(size);
        header.num_entries = header.num_entries.saturating_sub(1);
        record.destroy()?;
        Ok(())
    }

    fn entry_size_on_disk(&self, addr: Addr) -> Result<u64> {
        let mut record = EntryRecord::open(addr, self.block_files.clone(), self.external.clone())?;
        record.total_size()
    }

    fn maybe_evict(&self, header: &mut IndexHeader) -> Result<()> {
        let max_size = self.max_size.load(Ordering::Relaxed);
        if header.num_bytes <= max_size {
            return Ok(());
        }
        let host = EvictionHostImpl { inner: self, table_len: header.table_len };
        let evicted = self.eviction.trim_cache(header, max_size, false, &host)?;
        if evicted > 0 {
            self.stats.on_eviction(evicted);
        }
        Ok(())
    }

    /// Unlinks `entry_addr` from its hash bucket (walking the chain to find
    /// the right predecessor) and frees its storage. Callers are expected
    /// to have already dealt with its rankings-list membership and
    /// `num_entries`/`num_bytes` bookkeeping; this only touches the table
    /// and the entry's own blocks, so it is safe to call while a caller
    /// elsewhere holds the header lock (see `EvictionHostImpl::doom`).
    fn unlink_from_bucket_and_destroy(&self, entry_addr: Addr, table_len: u32) -> Result<()> {
        let mut record = EntryRecord::open(entry_addr, self.block_files.clone(), self.external.clone())?;
        let key = record.key()?.to_vec();
        let bucket = hash_key(&key) & (table_len - 1);
        drop(record);

        let mut cursor = self.table_get(bucket);
        let mut predecessor = None;
        while cursor.is_initialized() {
            if cursor == entry_addr {
                match predecessor {
                    Some(pred) => {
                        let mut pred_record = EntryRecord::open(pred, self.block_files.clone(), self.external.clone())?;
                        let next = EntryRecord::open(entry_addr, self.block_files.clone(), self.external.clone())?.next_entry()?;
                        pred_record.set_next_entry(next)?;
                        pred_record.flush()?;
                    }
                    None => {
                        let next = EntryRecord::open(entry_addr, self.block_files.clone(), self.external.clone())?.next_entry()?;
                        self.table_set(bucket, Addr::from_raw(next));
                    }
                }
                let mut record = EntryRecord::open(entry_addr, self.block_files.clone(), self.external.clone())?;
                return record.destroy();
            }
            predecessor = Some(cursor);
            let mut candidate = EntryRecord::open(cursor, self.block_files.clone(), self.external.clone())?;
            cursor = Addr::from_raw(candidate.next_entry()?);
        }
        Ok(())
    }
}

/// Adapts `BackendInner` to the narrow callback surface `Eviction` needs,
/// so `eviction.rs` never has to know about entry storage or the hash table.
/// `table_len` is snapshotted once at construction time rather than read
/// through the header the caller already holds `&mut` for `trim_cache`
/// itself: the table's length never changes over a backend's lifetime.
struct EvictionHostImpl<'a> {
    inner: &'a BackendInner,
    table_len: u32,
}

impl EvictionHost for EvictionHostImpl<'_> {
    fn entry_size(&self, entry_addr: Addr) -> Result<u64> {
        self.inner.entry_size_on_disk(entry_addr)
    }

    fn doom(&self, entry_addr: Addr) -> Result<()> {
        self.inner.unlink_from_bucket_and_destroy(entry_addr, self.table_len)
    }

    fn evict_to_deleted(&self, entry_addr: Addr) -> Result<()> {
        let mut record = EntryRecord::open(entry_addr, self.inner.block_files.clone(), self.inner.external.clone())?;
        for stream in 0..NUM_STREAMS {
            let _ = record.write_data(stream, 0, &[], true);
        }
        record.set_state(EntryState::Evicted)?;
        record.flush()
    }
}

impl BackendInner {
    /// Dooms the entry at `entry_addr` unconditionally: removes it from its
    /// rankings list, unlinks it from its hash bucket, and frees its
    /// storage, provided no handle currently has it open. An open entry is
    /// marked doomed instead; its storage is released when the last handle
    /// drops.
    fn doom_entry_by_addr(&self, entry_addr: Addr) -> Result<()> {
        if let Some(slot) = self.open_entries.get(&entry_addr.raw()) {
            slot.doomed.store(true, Ordering::SeqCst);
            let mut record = slot.record.lock();
            record.set_state(EntryState::Doomed)?;
            return Ok(());
        }

        let mut header = self.header.lock();
        let table_len = header.table_len;
        let mut record = EntryRecord::open(entry_addr, self.block_files.clone(), self.external.clone())?;
        let list = self.eviction.list_for_reuse_count(record.reuse_count().unwrap_or(0));
        let rankings_addr = record.rankings_addr();
        let size = record.total_size().unwrap_or(0);
        drop(record);

        self.rankings.remove(&mut header.lru, list, rankings_addr)?;
        header.num_bytes = header.num_bytes.saturating_sub(size);
        header.num_entries = header.num_entries.saturating_sub(1);
        drop(header);

        self.unlink_from_bucket_and_destroy(entry_addr, table_len)
    }
}

impl Backend {
    /// Opens (or creates) the cache at `path`. If `force_reset` is set and
    /// open fails, the directory is renamed aside and a fresh cache takes
    /// its place; otherwise a failed open is returned as an error.
    pub fn create_backend(path: impl AsRef<Path>, force_reset: bool, max_bytes: Option<u64>) -> Result<Backend> {
        let path = path.as_ref();
        match Self::init(path, max_bytes, EvictionPolicy::ReuseAware) {
            Ok(backend) => Ok(backend),
            Err(e) if force_reset => {
                warn!(error = %e, "initial cache open failed; renaming directory aside and starting fresh");
                rename_aside(path)?;
                Self::init(path, max_bytes, EvictionPolicy::ReuseAware)
            }
            Err(e) => Err(e),
        }
    }

    /// Test-only seam for exercising the pure-LRU policy directly; the
    /// public constructor always opens with `ReuseAware` as its default.
    #[cfg(test)]
    fn create_backend_with_policy(path: impl AsRef<Path>, max_bytes: Option<u64>, policy: EvictionPolicy) -> Result<Backend> {
        Self::init(path.as_ref(), max_bytes, policy)
    }

    fn init(path: &Path, max_bytes: Option<u64>, policy: EvictionPolicy) -> Result<Backend> {
        fs::create_dir_all(path)?;
        let index_path = path.join("index");
        let existed = index_path.exists();

        let table_len = if existed {
            let file_len = fs::metadata(&index_path)?.len();
            (((file_len.saturating_sub(INDEX_HEADER_SIZE as u64)) / 4) as u32).max(MIN_INDEX_TABLE_LEN)
        } else {
            MIN_INDEX_TABLE_LEN
        };
        let index_len = INDEX_HEADER_SIZE as u64 + table_len as u64 * 4;
        let index = MappedFile::open(&index_path, !existed, index_len)?;

        let mut header = if existed {
            let decoded = IndexHeader::decode(&index.view()[0..INDEX_HEADER_SIZE]);
            if decoded.magic != crate::format::INDEX_MAGIC {
                return Err(CacheError::CriticalError("index file has the wrong magic number".into()));
            }
            if decoded.version_major() != crate::format::CURRENT_VERSION >> 16 {
                return Err(CacheError::CriticalError("index file major version mismatch".into()));
            }
            decoded
        } else {
            IndexHeader::new(table_len, now_secs())
        };

        let had_previous_crash = header.crash != 0;
        header.this_id = header.this_id.wrapping_add(1);
        header.crash = 1;
        let this_id = header.this_id;

        let block_files = Arc::new(BlockFiles::init(path, !existed)?);
        let rankings = Arc::new(Rankings::new(block_files.clone()));
        rankings.complete_transaction(&mut header.lru)?;
        let external = Arc::new(ExternalFiles::init(path)?);
        let stats = Arc::new(Stats::new());
        if had_previous_crash {
            stats.on_error(ErrorCode::PreviousCrash);
            info!("cache reopened after an unclean shutdown; dirty entries are purged lazily on first touch");
        }

        let eviction = Eviction::new(rankings.clone(), policy);
        let max_size = max_bytes.unwrap_or(DEFAULT_MAX_SIZE);

        let inner = Arc::new(BackendInner {
            dir: path.to_path_buf(),
            index,
            header: Mutex::new(header),
            block_files,
            rankings,
            eviction,
            stats,
            external,
            this_id,
            max_size: AtomicU64::new(max_size),
            policy,
            open_entries: DashMap::new(),
            sparse_in_flight: DashMap::new(),
            disabled: AtomicBool::new(false),
        });
        inner.flush_header(&inner.header.lock());

        Ok(Backend { inner })
    }

    pub fn get_entry_count(&self) -> i32 {
        self.inner.header.lock().num_entries as i32
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

    fn open_by_key(&self, key: &[u8]) -> Result<Option<(Addr, EntryRecord)>> {
        self.inner.check_disabled()?;
        loop {
            let mut header = self.inner.header.lock();
            let bucket = self.inner.bucket_index(key, &header);
            let mut cursor = self.inner.table_get(bucket);
            let mut predecessor = None;
            let mut restart = false;

            while cursor.is_initialized() {
                match self.inner.load_candidate(cursor)? {
                    None => {
                        self.inner.unlink_and_free(&mut header, bucket, cursor, predecessor)?;
                        restart = true;
                        break;
                    }
                    Some(mut candidate) => {
                        if candidate.key()? == key {
                            return Ok(Some((cursor, candidate)));
                        }
                        predecessor = Some(cursor);
                        cursor = Addr::from_raw(candidate.next_entry()?);
                    }
                }
            }
            if !restart {
                return Ok(None);
            }
        }
    }

    fn wrap_open(&self, addr: Addr, record: EntryRecord) -> Entry {
        let slot = Arc::new(OpenSlot { record: Mutex::new(record), refcount: AtomicU32::new(1), doomed: AtomicBool::new(false) });
        self.inner.open_entries.insert(addr.raw(), slot.clone());
        {
            let mut guard = slot.record.lock();
            let _ = guard.mark_open(addr.raw().max(1));
            let _ = guard.mark_dirty(self.inner.this_id);
            let _ = guard.flush();
        }
        Entry { backend: self.inner.clone(), entry_addr: addr, slot }
    }

    pub fn open_entry(&self, key: &[u8]) -> Result<Option<Entry>> {
        match self.open_by_key(key)? {
            None => {
                self.inner.stats.on_open_miss();
                Ok(None)
            }
            Some((addr, mut record)) => {
                self.inner.stats.on_open_hit();
                let reuse = record.bump_reuse_count()?;
                let list = self.inner.eviction.list_for_reuse_count(reuse);
                let mut header = self.inner.header.lock();
                let _ = self.inner.rankings.update_rank(&mut header.lru, list, record.rankings_addr(), false, now_secs());
                drop(header);
                if let Some(existing) = self.inner.open_entries.get(&addr.raw()) {
                    existing.refcount.fetch_add(1, Ordering::SeqCst);
                    return Ok(Some(Entry { backend: self.inner.clone(), entry_addr: addr, slot: existing.clone() }));
                }
                Ok(Some(self.wrap_open(addr, record)))
            }
        }
    }

    pub fn create_entry(&self, key: &[u8]) -> Result<Entry> {
        self.inner.check_disabled()?;
        if self.open_by_key(key)?.is_some() {
            return Err(CacheError::AlreadyExists(format!("entry already exists for this key, length {}", key.len())));
        }

        let mut header = self.inner.header.lock();
        let bucket = self.inner.bucket_index(key, &header);
        let hash = hash_key(key);
        let num_blocks = crate::format::EntryStore::blocks_needed_for_key(key.len());
        let entry_addr = self.inner.block_files.create_block(FileType::Block256, num_blocks.min(4) as u32, None)?;
        let rankings_addr = self.inner.block_files.create_block(FileType::Rankings, 1, None)?;

        let mut record = EntryRecord::create(entry_addr, rankings_addr, key, hash, now_secs(), self.inner.block_files.clone(), self.inner.external.clone())?;
        let old_head = self.inner.table_get(bucket);
        record.set_next_entry(old_head.raw())?;
        record.flush()?;

        // Single 32-bit store: the linearization point for the create.
        self.inner.table_set(bucket, entry_addr);

        self.inner.rankings.insert(&mut header.lru, RankingList::NoUse, rankings_addr, now_secs(), true)?;
        header.num_entries += 1;
        self.inner.flush_header(&header);
        drop(header);

        self.inner.stats.on_create(false);
        Ok(self.wrap_open(entry_addr, record))
    }

    pub fn doom_entry(&self, key: &[u8]) -> Result<bool> {
        match self.open_by_key(key)? {
            None => Ok(false),
            Some((addr, _)) => {
                self.inner.doom_entry_by_addr(addr)?;
                self.inner.stats.on_doom();
                Ok(true)
            }
        }
    }

    /// Restarts the cache files if no entries are currently open; otherwise
    /// dooms every entry one at a time via enumeration.
    pub fn doom_all_entries(&self) -> Result<bool> {
        self.inner.stats.on_doom_all();
        if self.inner.open_entries.is_empty() {
            let mut header = self.inner.header.lock();
            *header = IndexHeader::new(header.table_len, now_secs());
            header.this_id = self.inner.this_id;
            let table_len = header.table_len;
            self.inner.flush_header(&header);
            for i in 0..table_len {
                self.inner.table_set(i, Addr::default());
            }
            return Ok(true);
        }
        self.doom_entries_since(0)
    }

    pub fn doom_entries_between(&self, t0: u64, t1: u64) -> Result<bool> {
        self.doom_matching(|last_used| last_used >= t0 && last_used < t1, false)
    }

    pub fn doom_entries_since(&self, t0: u64) -> Result<bool> {
        self.doom_matching(|last_used| last_used >= t0, true)
    }

    fn doom_matching(&self, predicate: impl Fn(u64) -> bool, early_exit_on_miss: bool) -> Result<bool> {
        let mut addrs = Vec::new();
        for &list in &ENUM_LISTS {
            let head = {
                let header = self.inner.header.lock();
                header.lru.heads[list.index()]
            };
            if head == 0 {
                continue;
            }
            let mut node = Some(Addr::from_raw(head));
            while let Some(rankings_addr) = node {
                let last_used = self.inner.rankings.last_used(rankings_addr)?;
                if !predicate(last_used) {
                    if early_exit_on_miss {
                        break;
                    }
                    node = self.inner.rankings.get_next(rankings_addr)?;
                    continue;
                }
                let entry_addr = self.inner.rankings.contents(rankings_addr)?;
                addrs.push(entry_addr);
                node = self.inner.rankings.get_next(rankings_addr)?;
            }
        }
        for addr in addrs {
            self.inner.doom_entry_by_addr(addr)?;
            self.inner.stats.on_doom();
        }
        Ok(true)
    }

    /// Returns the next entry in LRU order across all non-deleted lists,
    /// most-recently-used first. `iter` is advanced in place.
    pub fn open_next_entry(&self, iter: &mut EnumIterator) -> Result<Option<Entry>> {
        loop {
            if !iter.started {
                iter.started = true;
                iter.list_index = 0;
                iter.next = self.first_head(0);
            }
            let Some(rankings_addr) = iter.next else {
                if iter.list_index + 1 >= ENUM_LISTS.len() {
                    return Ok(None);
                }
                iter.list_index += 1;
                iter.next = self.first_head(iter.list_index);
                continue;
            };
            iter.next = self.inner.rankings.get_next(rankings_addr)?;
            if iter.next.is_none() && iter.list_index + 1 < ENUM_LISTS.len() {
                // Leave list advancement to the next call so a caller that
                // stops early never skips the first node of the next list.
            }
            let entry_addr = self.inner.rankings.contents(rankings_addr)?;
            match self.inner.load_candidate(entry_addr) {
                Ok(Some(record)) => {
                    if let Some(existing) = self.inner.open_entries.get(&entry_addr.raw()) {
                        existing.refcount.fetch_add(1, Ordering::SeqCst);
                        return Ok(Some(Entry { backend: self.inner.clone(), entry_addr, slot: existing.clone() }));
                    }
                    return Ok(Some(self.wrap_open(entry_addr, record)));
                }
                Ok(None) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    fn first_head(&self, list_index: usize) -> Option<Addr> {
        let header = self.inner.header.lock();
        let head = header.lru.heads[list_index];
        if head == 0 { None } else { Some(Addr::from_raw(head)) }
    }

    pub fn end_enumeration(&self, _iter: EnumIterator) {}
}

fn rename_aside(path: &Path) -> Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("cache");
    for n in 0..1000u32 {
        let candidate = parent.join(format!("old_{name}_{n:03}"));
        if !candidate.exists() {
            fs::rename(path, &candidate)?;
            fs::create_dir_all(path)?;
            return Ok(());
        }
    }
    Err(CacheError::CriticalError("could not find a free name to rename the disabled cache directory aside".into()))
}

impl Entry {
    pub fn get_key(&self) -> Result<Vec<u8>> {
        Ok(self.slot.record.lock().key()?.to_vec())
    }

    pub fn get_last_used(&self) -> Result<u64> {
        self.slot.record.lock().last_used()
    }

    pub fn get_last_modified(&self) -> Result<u64> {
        let addr = self.slot.record.lock().rankings_addr();
        self.backend.rankings.last_used(addr)
    }

    pub fn get_data_size(&self, stream: usize) -> Result<i32> {
        self.slot.record.lock().data_size(stream)
    }

    pub fn read_data(&self, stream: usize, offset: usize, buf: &mut [u8]) -> Result<usize> {
        self.slot.record.lock().read_data(stream, offset, buf)
    }

    pub fn write_data(&self, stream: usize, offset: usize, buf: &[u8], truncate: bool) -> Result<usize> {
        let max_stream = self.backend.max_size.load(Ordering::Relaxed) / MAX_STREAM_FRACTION;
        if (offset + buf.len()) as u64 > max_stream {
            return Err(CacheError::LimitExceeded(format!(
                "stream {stream} write would exceed the per-stream cap of {max_stream} bytes"
            )));
        }
        let old_size = self.slot.record.lock().data_size(stream).unwrap_or(0).max(0) as u64;
        let written = self.slot.record.lock().write_data(stream, offset, buf, truncate)?;
        let new_size = self.slot.record.lock().data_size(stream).unwrap_or(0).max(0) as u64;
        let mut header = self.backend.header.lock();
        header.num_bytes = header.num_bytes.saturating_sub(old_size).saturating_add(new_size);
        let _ = self.backend.maybe_evict(&mut header);
        self.backend.flush_header(&header);
        Ok(written)
    }

    fn sparse_guard(&self) -> Result<()> {
        if self.backend.sparse_in_flight.contains_key(&self.entry_addr.raw()) {
            return Err(CacheError::Unsupported("overlapping sparse operations on the same entry".into()));
        }
        self.backend.sparse_in_flight.insert(self.entry_addr.raw(), ());
        Ok(())
    }

    fn sparse_release(&self) {
        self.backend.sparse_in_flight.remove(&self.entry_addr.raw());
    }

    fn sparse_control(&self) -> Result<SparseControl> {
        let key = self.get_key()?;
        let key_str = String::from_utf8_lossy(&key).to_string();
        let mut sparse_bytes = [0u8; 16];
        let existing = self.read_data(SPARSE_STREAM, 0, &mut sparse_bytes)?;
        let signature = if existing >= 8 {
            u64::from_le_bytes(sparse_bytes[0..8].try_into().unwrap())
        } else {
            let sig = rand::random::<u64>() | 1;
            self.write_data(SPARSE_STREAM, 0, &sig.to_le_bytes(), false)?;
            let mut record = self.slot.record.lock();
            *record.flags_mut()? |= FLAG_PARENT_ENTRY;
            drop(record);
            sig
        };
        Ok(SparseControl::new(key_str, signature))
    }

    pub fn read_sparse_data(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        self.sparse_guard()?;
        let result = (|| {
            let control = self.sparse_control()?;
            let mut backing = BackendChildBacking { backend: &self.backend };
            control.read(&mut backing, offset, buf)
        })();
        self.sparse_release();
        result
    }

    pub fn write_sparse_data(&self, offset: u64, buf: &[u8]) -> Result<usize> {
        self.sparse_guard()?;
        let result = (|| {
            let control = self.sparse_control()?;
            let mut backing = BackendChildBacking { backend: &self.backend };
            control.write(&mut backing, offset, buf)
        })();
        self.sparse_release();
        result
    }

    pub fn get_available_range(&self, offset: u64, len: u64) -> Result<(u64, u64)> {
        self.sparse_guard()?;
        let result = (|| {
            let control = self.sparse_control()?;
            let mut backing = BackendChildBacking { backend: &self.backend };
            Ok(control.get_available_range(&mut backing, offset, len)?.unwrap_or((offset, 0)))
        })();
        self.sparse_release();
        result
    }

    pub fn doom(&self) -> Result<()> {
        self.slot.doomed.store(true, Ordering::SeqCst);
        self.slot.record.lock().set_state(EntryState::Doomed)?;
        self.backend.stats.on_doom();
        Ok(())
    }
}

/// Drives sparse child entries through ordinary `Backend` open/create calls,
/// so `sparse.rs` stays backend-agnostic (see its module docs).
struct BackendChildBacking<'a> {
    backend: &'a Arc<BackendInner>,
}

impl BackendChildBacking<'_> {
    fn backend_handle(&self) -> Backend {
        Backend { inner: self.backend.clone() }
    }
}

impl ChildBacking for BackendChildBacking<'_> {
    fn read_child(&mut self, key: &str, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let backend = self.backend_handle();
        match backend.open_entry(key.as_bytes())? {
            Some(entry) => entry.read_data(CHILD_DATA_STREAM, offset as usize, buf),
            None => Ok(0),
        }
    }

    fn write_child(&mut self, key: &str, offset: u64, buf: &[u8]) -> Result<()> {
        let backend = self.backend_handle();
        let entry = match backend.open_entry(key.as_bytes())? {
            Some(entry) => entry,
            None => {
                let entry = backend.create_entry(key.as_bytes())?;
                let mut record = entry.slot.record.lock();
                *record.flags_mut()? |= FLAG_CHILD_ENTRY;
                drop(record);
                entry
            }
        };
        entry.write_data(CHILD_DATA_STREAM, offset as usize, buf, false)?;
        Ok(())
    }

    fn child_bitmap(&mut self, key: &str, signature: u64, parent_key_len: u32) -> Result<crate::format::SparseData> {
        let backend = self.backend_handle();
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
        let backend = self.backend_handle();
        let entry = match backend.open_entry(key.as_bytes())? {
            Some(entry) => entry,
            None => backend.create_entry(key.as_bytes())?,
        };
        entry.write_data(SPARSE_STREAM, 0, &data.encode(), false)?;
        Ok(())
    }
}

impl Drop for Entry {
    fn drop(&mut self) {
        if self.slot.refcount.fetch_sub(1, Ordering::SeqCst) != 1 {
            return;
        }
        self.backend.open_entries.remove(&self.entry_addr.raw());
        let mut record = self.slot.record.lock();
        if self.slot.doomed.load(Ordering::SeqCst) {
            let mut header = self.backend.header.lock();
            let size = record.total_size().unwrap_or(0);
            header.num_bytes = header.num_bytes.saturating_sub(size);
            header.num_entries = header.num_entries.saturating_sub(1);
            self.backend.flush_header(&header);
            drop(header);
            if let Err(e) = record.destroy() {
                warn!(error = %e, "failed to release doomed entry storage on close");
            }
        } else {
            let _ = record.clear_dirty_flag();
            let _ = record.mark_closed();
            let _ = record.flush();
        }
    }
}

/// Object-safe facade shared by the on-disk [`Backend`] and
/// [`crate::memory::MemoryBackend`] (§4.12), so an embedding application can
/// hold either behind a single `Box<dyn CacheStore>` without caring which
/// one it opened.
pub trait CacheStore {
    fn get_entry_count(&self) -> i32;
    fn open_entry(&self, key: &[u8]) -> Result<Option<Box<dyn CacheEntry>>>;
    fn create_entry(&self, key: &[u8]) -> Result<Box<dyn CacheEntry>>;
    fn doom_entry(&self, key: &[u8]) -> Result<bool>;
    fn doom_all_entries(&self) -> Result<bool>;
    fn doom_entries_between(&self, t0: u64, t1: u64) -> Result<bool>;
    fn doom_entries_since(&self, t0: u64) -> Result<bool>;
    fn get_stats(&self) -> Vec<(String, i64)>;
    fn set_max_size(&self, max_bytes: u64);
}

/// Object-safe facade shared by [`Entry`] and [`crate::memory::MemoryEntry`].
pub trait CacheEntry {
    fn get_key(&self) -> Result<Vec<u8>>;
    fn get_last_used(&self) -> Result<u64>;
    fn get_last_modified(&self) -> Result<u64>;
    fn get_data_size(&self, stream: usize) -> Result<i32>;
    fn read_data(&self, stream: usize, offset: usize, buf: &mut [u8]) -> Result<usize>;
    fn write_data(&self, stream: usize, offset: usize, buf: &[u8], truncate: bool) -> Result<usize>;
    fn doom(&self) -> Result<()>;
}

impl CacheEntry for Entry {
    fn get_key(&self) -> Result<Vec<u8>> {
        Entry::get_key(self)
    }
    fn get_last_used(&self) -> Result<u64> {
        Entry::get_last_used(self)
    }
    fn get_last_modified(&self) -> Result<u64> {
        Entry::get_last_modified(self)
    }
    fn get_data_size(&self, stream: usize) -> Result<i32> {
        Entry::get_data_size(self, stream)
    }
    fn read_data(&self, stream: usize, offset: usize, buf: &mut [u8]) -> Result<usize> {
        Entry::read_data(self, stream, offset, buf)
    }
    fn write_data(&self, stream: usize, offset: usize, buf: &[u8], truncate: bool) -> Result<usize> {
        Entry::write_data(self, stream, offset, buf, truncate)
    }
    fn doom(&self) -> Result<()> {
        Entry::doom(self)
    }
}

impl CacheStore for Backend {
    fn get_entry_count(&self) -> i32 {
        Backend::get_entry_count(self)
    }
    fn open_entry(&self, key: &[u8]) -> Result<Option<Box<dyn CacheEntry>>> {
        Ok(Backend::open_entry(self, key)?.map(|e| Box::new(e) as Box<dyn CacheEntry>))
    }
    fn create_entry(&self, key: &[u8]) -> Result<Box<dyn CacheEntry>> {
        Ok(Box::new(Backend::create_entry(self, key)?))
    }
    fn doom_entry(&self, key: &[u8]) -> Result<bool> {
        Backend::doom_entry(self, key)
    }
    fn doom_all_entries(&self) -> Result<bool> {
        Backend::doom_all_entries(self)
    }
    fn doom_entries_between(&self, t0: u64, t1: u64) -> Result<bool> {
        Backend::doom_entries_between(self, t0, t1)
    }
    fn doom_entries_since(&self, t0: u64) -> Result<bool> {
        Backend::doom_entries_since(self, t0)
    }
    fn get_stats(&self) -> Vec<(String, i64)> {
        Backend::get_stats(self)
    }
    fn set_max_size(&self, max_bytes: u64) {
        Backend::set_max_size(self, max_bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn create_write_close_reopen_round_trips_stream_zero() {
        let dir = tempdir().unwrap();
        let backend = Backend::create_backend(dir.path(), true, None).unwrap();
        {
            let entry = backend.create_entry(b"k1").unwrap();
            let payload = vec![0x41u8; 4096];
            entry.write_data(0, 0, &payload, false).unwrap();
        }
        let entry = backend.open_entry(b"k1").unwrap().unwrap();
        let mut buf = vec![0u8; 4096];
        let read = entry.read_data(0, 0, &mut buf).unwrap();
        assert_eq!(read, 4096);
        assert_eq!(buf, vec![0x41u8; 4096]);
    }

    #[test]
    fn create_fails_when_key_already_exists() {
        let dir = tempdir().unwrap();
        let backend = Backend::create_backend(dir.path(), true, None).unwrap();
        let _entry = backend.create_entry(b"dup").unwrap();
        let result = backend.create_entry(b"dup");
        assert!(result.is_err());
    }

    #[test]
    fn large_payload_escalates_to_external_file_of_exact_size() {
        let dir = tempdir().unwrap();
        let backend = Backend::create_backend(dir.path(), true, None).unwrap();
        let payload: Vec<u8> = (0..20000u32).map(|i| if i % 2 == 0 { 0xDE } else { 0xAD }).collect();
        {
            let entry = backend.create_entry(b"k2").unwrap();
            entry.write_data(0, 0, &payload, true).unwrap();
        }
        let mut found = false;
        for entry in fs::read_dir(dir.path()).unwrap() {
            let entry = entry.unwrap();
            if entry.file_name().to_string_lossy().starts_with("f_") {
                assert_eq!(entry.metadata().unwrap().len(), 20000);
                found = true;
            }
        }
        assert!(found, "expected exactly one external f_ file");
    }

    #[test]
    fn doom_then_recreate_never_returns_stale_bytes() {
        let dir = tempdir().unwrap();
        let backend = Backend::create_backend(dir.path(), true, None).unwrap();
        {
            let entry = backend.create_entry(b"x").unwrap();
            entry.write_data(0, 0, &[1u8; 100], false).unwrap();
            entry.doom().unwrap();
        }
        {
            let entry = backend.create_entry(b"x").unwrap();
            entry.write_data(0, 0, &[2u8; 200], false).unwrap();
        }
        let entry = backend.open_entry(b"x").unwrap().unwrap();
        let mut buf = vec![0u8; 200];
        let read = entry.read_data(0, 0, &mut buf).unwrap();
        assert_eq!(read, 200);
        assert_eq!(buf, vec![2u8; 200]);
    }

    #[test]
    fn eviction_trims_entry_count_under_a_tight_budget() {
        let dir = tempdir().unwrap();
        let max_size: u64 = 2 * 1024 * 1024;
        let backend = Backend::create_backend_with_policy(dir.path(), Some(max_size), EvictionPolicy::PureLru).unwrap();

        // Each entry fills all four streams right up to the per-stream cap
        // (max_size / 8), so two full entries sit exactly at the budget and
        // a third always pushes the cache over it.
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
    fn sparse_round_trip_through_entry_handle() {
        let dir = tempdir().unwrap();
        let backend = Backend::create_backend(dir.path(), true, None).unwrap();
        let entry = backend.create_entry(b"sparse-key").unwrap();
        entry.write_sparse_data(0, &[9u8; 1024]).unwrap();
        let mut buf = [0u8; 1024];
        let read = entry.read_sparse_data(0, &mut buf).unwrap();
        assert_eq!(read, 1024);
        assert_eq!(buf, [9u8; 1024]);
        let (start, len) = entry.get_available_range(0, 1024).unwrap();
        assert_eq!(start, 0);
        assert_eq!(len, 1024);
    }

    #[test]
    fn reopen_after_close_preserves_entry_count() {
        let dir = tempdir().unwrap();
        {
            let backend = Backend::create_backend(dir.path(), true, None).unwrap();
            let entry = backend.create_entry(b"persisted").unwrap();
            entry.write_data(0, 0, b"abc", false).unwrap();
        }
        let backend = Backend::create_backend(dir.path(), false, None).unwrap();
        assert_eq!(backend.get_entry_count(), 1);
        let entry = backend.open_entry(b"persisted").unwrap().unwrap();
        let mut buf = [0u8; 3];
        entry.read_data(0, 0, &mut buf).unwrap();
        assert_eq!(&buf, b"abc");
    }
}
