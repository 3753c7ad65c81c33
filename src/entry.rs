//! A single cache entry: its key, four data streams, and rankings node.
//!
//! Buffered, lazy-load-then-flush throughout:
//! `EntryRecord` keeps its [`EntryStore`] and [`RankingsNode`] as
//! `StorageBlock`s and only touches disk on `close`/explicit flush. Each of
//! the four data streams is stored either inline, spanning one or more
//! block-file records sized by [`Addr::required_file_type`], or in a
//! standalone external file once it exceeds [`MAX_BLOCK_SIZE`] bytes (16 KiB).
//! Streams hold their pending writes in an in-memory buffer and are flushed
//! to whichever backing they use on `close`.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::address::{Addr, MAX_BLOCK_SIZE};
use crate::block_files::BlockFiles;
use crate::file_io::CacheFile;
use crate::format::{EntryState, EntryStore, RankingsNode};
use crate::storage_block::{data_offset, StorageBlock};
use crate::error::{CacheError, Result};

pub const NUM_STREAMS: usize = 4;

/// Allocates and names the standalone `f_XXXXXX` files used for data too
/// large to fit in a block-file run. Scans the cache directory once at
/// startup to resume numbering after a restart, the same approach
/// `block_files::BlockFiles` uses for its own chain-file selectors.
pub struct ExternalFiles {
    dir: PathBuf,
    next: AtomicU32,
}

impl ExternalFiles {
    pub fn init(dir: impl AsRef<Path>) -> Result<ExternalFiles> {
        let dir = dir.as_ref().to_path_buf();
        let mut max_seen = 0u32;
        if dir.exists() {
            for entry in std::fs::read_dir(&dir)? {
                let entry = entry?;
                if let Some(name) = entry.file_name().to_str() {
                    if let Some(rest) = name.strip_prefix("f_") {
                        if let Ok(n) = rest.parse::<u32>() {
                            max_seen = max_seen.max(n);
                        }
                    }
                }
            }
        }
        Ok(ExternalFiles { dir, next: AtomicU32::new(max_seen + 1) })
    }

    fn path_for(&self, file_number: u32) -> PathBuf {
        self.dir.join(format!("f_{file_number:06}"))
    }

    pub fn create(&self) -> Result<(u32, Arc<CacheFile>)> {
        let number = self.next.fetch_add(1, Ordering::SeqCst);
        let path = self.path_for(number);
        Ok((number, Arc::new(CacheFile::open(path, true)?)))
    }

    pub fn open(&self, file_number: u32) -> Result<Arc<CacheFile>> {
        Ok(Arc::new(CacheFile::open(self.path_for(file_number), false)?))
    }

    pub fn delete(&self, file_number: u32) -> Result<()> {
        let path = self.path_for(file_number);
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }
}

/// One entry's persistent state plus whatever pending stream writes haven't
/// been flushed yet.
pub struct EntryRecord {
    entry_block: StorageBlock<EntryStore>,
    rankings_block: StorageBlock<RankingsNode>,
    block_files: Arc<BlockFiles>,
    external: Arc<ExternalFiles>,
}

impl EntryRecord {
    pub fn create(
        addr: Addr,
        rankings_addr: Addr,
        key: &[u8],
        hash: u32,
        creation_time: u64,
        block_files: Arc<BlockFiles>,
        external: Arc<ExternalFiles>,
    ) -> Result<EntryRecord> {
        let num_blocks = EntryStore::blocks_needed_for_key(key.len());
        let file = block_files.get_file(addr)?;
        let mut entry_block = StorageBlock::new(file, addr, crate::format::ENTRY_STORE_SIZE * num_blocks);
        entry_block.set_data(EntryStore {
            hash,
            next: 0,
            rankings_node: rankings_addr.raw(),
            reuse_count: 0,
            refetch_count: 0,
            state: EntryState::Normal,
            creation_time,
            key_len: key.len() as i32,
            long_key: 0,
            data_size: [0; 4],
            data_addr: [0; 4],
            flags: 0,
            key: key.to_vec(),
        });

        let rfile = block_files.get_file(rankings_addr)?;
        let mut rankings_block = StorageBlock::new(rfile, rankings_addr, crate::format::RANKINGS_NODE_SIZE);
        rankings_block.set_data(RankingsNode { contents: addr.raw(), last_used: creation_time, last_modified: creation_time, ..Default::default() });

        Ok(EntryRecord {
            entry_block,
            rankings_block,
            block_files,
            external,
        })
    }

    pub fn open(addr: Addr, block_files: Arc<BlockFiles>, external: Arc<ExternalFiles>) -> Result<EntryRecord> {
        let file = block_files.get_file(addr)?;
        let mut entry_block: StorageBlock<EntryStore> = StorageBlock::new(file, addr, crate::format::ENTRY_STORE_SIZE);
        let key_len = entry_block.load()?.key_len as usize;
        let num_blocks = EntryStore::blocks_needed_for_key(key_len);
        if num_blocks > 1 {
            let file = block_files.get_file(addr)?;
            entry_block = StorageBlock::new(file, addr, crate::format::ENTRY_STORE_SIZE * num_blocks);
        }
        let rankings_addr = Addr::from_raw(entry_block.load()?.rankings_node);
        let rfile = block_files.get_file(rankings_addr)?;
        let rankings_block = StorageBlock::new(rfile, rankings_addr, crate::format::RANKINGS_NODE_SIZE);

        Ok(EntryRecord { entry_block, rankings_block, block_files, external })
    }

    pub fn addr(&self) -> Addr {
        self.entry_block.addr()
    }

    pub fn rankings_addr(&self) -> Addr {
        self.rankings_block.addr()
    }

    pub fn key(&mut self) -> Result<&[u8]> {
        Ok(&self.entry_block.load()?.key)
    }

    pub fn hash(&mut self) -> Result<u32> {
        Ok(self.entry_block.load()?.hash)
    }

    pub fn next_entry(&mut self) -> Result<u32> {
        Ok(self.entry_block.load()?.next)
    }

    pub fn set_next_entry(&mut self, next: u32) -> Result<()> {
        self.entry_block.load_mut()?.next = next;
        Ok(())
    }

    pub fn state(&mut self) -> Result<EntryState> {
        Ok(self.entry_block.load()?.state)
    }

    pub fn set_state(&mut self, state: EntryState) -> Result<()> {
        self.entry_block.load_mut()?.state = state;
        Ok(())
    }

    /// Direct access to the `EntryStore::flags` bitfield (parent/child
    /// sparse markers), for callers that need to set them without a round
    /// trip through a dedicated setter.
    pub fn flags_mut(&mut self) -> Result<&mut u32> {
        Ok(&mut self.entry_block.load_mut()?.flags)
    }

    pub fn reuse_count(&mut self) -> Result<i32> {
        Ok(self.entry_block.load()?.reuse_count)
    }

    pub fn bump_reuse_count(&mut self) -> Result<i32> {
        let entry = self.entry_block.load_mut()?;
        entry.reuse_count = entry.reuse_count.saturating_add(1);
        Ok(entry.reuse_count)
    }

    pub fn is_dirty(&mut self, current_id: u32) -> Result<bool> {
        let dirty = self.rankings_block.load()?.dirty;
        Ok(dirty != 0 && dirty as u32 != current_id)
    }

    pub fn mark_dirty(&mut self, this_id: u32) -> Result<()> {
        self.rankings_block.load_mut()?.dirty = this_id as i32;
        Ok(())
    }

    pub fn clear_dirty_flag(&mut self) -> Result<()> {
        self.rankings_block.load_mut()?.dirty = 0;
        Ok(())
    }

    pub fn mark_open(&mut self, pointer: u32) -> Result<()> {
        self.rankings_block.load_mut()?.pointer = pointer;
        Ok(())
    }

    pub fn mark_closed(&mut self) -> Result<()> {
        self.rankings_block.load_mut()?.pointer = 0;
        Ok(())
    }

    pub fn is_open(&mut self) -> Result<bool> {
        Ok(self.rankings_block.load()?.is_open())
    }

    pub fn last_used(&mut self) -> Result<u64> {
        Ok(self.rankings_block.load()?.last_used)
    }

    pub fn data_size(&mut self, index: usize) -> Result<i32> {
        Ok(self.entry_block.load()?.data_size[index])
    }

    pub fn total_size(&mut self) -> Result<u64> {
        let entry = self.entry_block.load()?;
        Ok(entry.data_size.iter().map(|&s| s.max(0) as u64).sum())
    }

    /// Reads `buf.len()` bytes of stream `index` starting at `offset`. Bytes
    /// past the stream's recorded size are not read; the returned count may
    /// be shorter than `buf.len()`.
    pub fn read_data(&mut self, index: usize, offset: usize, buf: &mut [u8]) -> Result<usize> {
        let data_size = self.entry_block.load()?.data_size[index].max(0) as usize;
        if offset >= data_size {
            return Ok(0);
        }
        let to_read = buf.len().min(data_size - offset);
        let addr = Addr::from_raw(self.entry_block.load()?.data_addr[index]);
        if !addr.is_initialized() {
            return Ok(0);
        }
        if addr.is_separate_file() {
            let file = self.external.open(addr.file_number())?;
            file.read_at(offset as u64, &mut buf[..to_read])?;
        } else {
            let file = self.block_files.get_file(addr)?;
            file.read_at(data_offset(addr) + offset as u64, &mut buf[..to_read])?;
        }
        Ok(to_read)
    }

    /// Writes `buf` to stream `index` at `offset`, growing (and escalating
    /// to an external file, if needed) as `PrepareTarget`/`GrowUserBuffer`
    /// do. `truncate` drops any existing bytes past `offset + buf.len()`.
    pub fn write_data(&mut self, index: usize, offset: usize, buf: &[u8], truncate: bool) -> Result<usize> {
        let needed_size = offset + buf.len();
        let current_size = self.entry_block.load()?.data_size[index].max(0) as usize;
        let new_size = if truncate { needed_size } else { needed_size.max(current_size) };

        let mut addr = Addr::from_raw(self.entry_block.load()?.data_addr[index]);
        let needs_new_backing = !addr.is_initialized()
            || (addr.is_block_file() && new_size as u32 > addr.block_size().unwrap_or(0) * addr.num_blocks())
            || (new_size as u32 > MAX_BLOCK_SIZE && !addr.is_separate_file());

        if needs_new_backing {
            let mut combined = vec![0u8; new_size];
            if addr.is_initialized() && !needs_size_reset(addr, new_size) {
                let mut existing = vec![0u8; current_size.min(new_size)];
                self.read_existing(addr, &mut existing)?;
                combined[..existing.len()].copy_from_slice(&existing);
            }
            self.delete_stream_backing(index)?;
            addr = self.allocate_stream_backing(new_size as u32)?;
            combined[offset..offset + buf.len()].copy_from_slice(buf);
            self.write_stream_backing(addr, 0, &combined)?;
        } else {
            self.write_stream_backing(addr, offset as u64, buf)?;
        }

        let entry = self.entry_block.load_mut()?;
        entry.data_size[index] = new_size as i32;
        entry.data_addr[index] = addr.raw();
        Ok(buf.len())
    }

    fn read_existing(&self, addr: Addr, buf: &mut [u8]) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        if addr.is_separate_file() {
            let file = self.external.open(addr.file_number())?;
            file.read_at(0, buf)
        } else {
            let file = self.block_files.get_file(addr)?;
            file.read_at(data_offset(addr), buf)
        }
    }

    fn write_stream_backing(&self, addr: Addr, offset: u64, buf: &[u8]) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        if addr.is_separate_file() {
            let file = self.external.open(addr.file_number())?;
            file.write_at(offset, buf)
        } else {
            let file = self.block_files.get_file(addr)?;
            file.write_at(data_offset(addr) + offset, buf)
        }
    }

    fn allocate_stream_backing(&self, size: u32) -> Result<Addr> {
        let file_type = Addr::required_file_type(size);
        if file_type == crate::address::FileType::External {
            let (number, file) = self.external.create()?;
            file.set_len(size as u64)?;
            Ok(Addr::new_external(number))
        } else {
            let block_size = file_type.block_size().expect("block file types have a fixed size");
            let count = size.div_ceil(block_size).max(1).min(crate::address::MAX_NUM_BLOCKS);
            self.block_files.create_block(file_type, count, None)
        }
    }

    fn delete_stream_backing(&mut self, index: usize) -> Result<()> {
        let addr = Addr::from_raw(self.entry_block.load()?.data_addr[index]);
        if !addr.is_initialized() {
            return Ok(());
        }
        if addr.is_separate_file() {
            self.external.delete(addr.file_number())
        } else {
            self.block_files.delete_block(addr, false)
        }
    }

    /// Frees every stream's backing storage and the rankings node, then the
    /// entry-store block itself. Called once a doomed entry's refcount
    /// drops to zero.
    pub fn destroy(&mut self) -> Result<()> {
        for index in 0..NUM_STREAMS {
            self.delete_stream_backing(index)?;
        }
        self.block_files.delete_block(self.rankings_block.addr(), true)?;
        let key_len = self.entry_block.load()?.key_len as usize;
        let num_blocks = EntryStore::blocks_needed_for_key(key_len);
        self.block_files.delete_block(self.entry_block.addr(), true)?;
        debug!(addr = self.entry_block.addr().raw(), num_blocks, "entry storage released");
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.entry_block.store()?;
        self.rankings_block.store()
    }

    /// Rejects an entry-store record whose key length, state, or hash are
    /// inconsistent with it being a usable record.
    pub fn sanity_check(&mut self) -> Result<()> {
        let entry = self.entry_block.load()?;
        if entry.key_len < 0 || (entry.key_len as usize > crate::format::INLINE_KEY_MAX && entry.long_key == 0) {
            return Err(CacheError::Corruption("entry key length exceeds inline capacity with no long_key address".into()));
        }
        for size in entry.data_size {
            if size < 0 {
                return Err(CacheError::Corruption("entry has a negative stream size".into()));
            }
        }
        Ok(())
    }
}

fn needs_size_reset(addr: Addr, new_size: usize) -> bool {
    addr.is_block_file() && new_size == 0
}

impl Drop for EntryRecord {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            warn!(error = %e, "failed to flush entry on drop");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::FileType;
    use tempfile::tempdir;

    fn setup() -> (Arc<BlockFiles>, Arc<ExternalFiles>, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let block_files = Arc::new(BlockFiles::init(dir.path(), true).unwrap());
        let external = Arc::new(ExternalFiles::init(dir.path()).unwrap());
        (block_files, external, dir)
    }

    #[test]
    fn create_and_reopen_round_trips_key_and_data() {
        let (block_files, external, _dir) = setup();
        let entry_addr = block_files.create_block(FileType::Block256, 1, None).unwrap();
        let rankings_addr = block_files.create_block(FileType::Rankings, 1, None).unwrap();

        {
            let mut record = EntryRecord::create(entry_addr, rankings_addr, b"https://example.com/", 0xdead_beef, 1000, block_files.clone(), external.clone()).unwrap();
            record.write_data(0, 0, b"hello world", false).unwrap();
            record.flush().unwrap();
        }

        let mut reopened = EntryRecord::open(entry_addr, block_files.clone(), external.clone()).unwrap();
        assert_eq!(reopened.key().unwrap(), b"https://example.com/");
        let mut buf = [0u8; 11];
        let read = reopened.read_data(0, 0, &mut buf).unwrap();
        assert_eq!(read, 11);
        assert_eq!(&buf, b"hello world");
    }

    #[test]
    fn large_stream_write_escalates_to_external_file() {
        let (block_files, external, _dir) = setup();
        let entry_addr = block_files.create_block(FileType::Block256, 1, None).unwrap();
        let rankings_addr = block_files.create_block(FileType::Rankings, 1, None).unwrap();
        let mut record = EntryRecord::create(entry_addr, rankings_addr, b"k", 1, 1, block_files.clone(), external.clone()).unwrap();

        let payload = vec![7u8; MAX_BLOCK_SIZE as usize + 1024];
        record.write_data(1, 0, &payload, true).unwrap();

        let mut buf = vec![0u8; payload.len()];
        let read = record.read_data(1, 0, &mut buf).unwrap();
        assert_eq!(read, payload.len());
        assert_eq!(buf, payload);
    }

    #[test]
    fn truncate_shrinks_reported_size() {
        let (block_files, external, _dir) = setup();
        let entry_addr = block_files.create_block(FileType::Block256, 1, None).unwrap();
        let rankings_addr = block_files.create_block(FileType::Rankings, 1, None).unwrap();
        let mut record = EntryRecord::create(entry_addr, rankings_addr, b"k", 1, 1, block_files.clone(), external.clone()).unwrap();
        record.write_data(0, 0, b"0123456789", false).unwrap();
        record.write_data(0, 0, b"ab", true).unwrap();
        assert_eq!(record.data_size(0).unwrap(), 2);
    }
}
