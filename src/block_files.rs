//! Block-file allocator.
//!
//! Owns one `data_N` file per block-size class (`data_0` = 36-byte
//! rankings blocks, `data_1` = 256-byte entry-store blocks, `data_2` =
//! 1 KB blocks, `data_3` = 4 KB blocks) plus a chain of overflow files
//! created once a class fills up. Each file's 8 KB header and allocation
//! bitmap stay memory-mapped for the lifetime of the backend; block data
//! itself is read/written positionally through the same underlying file
//! handle, never mapped in full, so a multi-gigabyte cache doesn't require
//! a multi-gigabyte mapping.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::address::{Addr, FileType, MAX_NUM_BLOCKS};
use crate::file_io::{CacheFile, MappedFile};
use crate::format::{BlockFileHeader, BLOCK_HEADER_SIZE, MAX_BLOCKS_PER_FILE};
use crate::error::{CacheError, Result};

const BASE_FILE_COUNT: u8 = 4;

fn base_selector(file_type: FileType) -> u8 {
    match file_type {
        FileType::Rankings => 0,
        FileType::Block256 => 1,
        FileType::Block1K => 2,
        FileType::Block4K => 3,
        FileType::External => unreachable!("external addresses are not block-file addresses"),
    }
}

fn entry_size_for(file_type: FileType) -> u32 {
    file_type.block_size().expect("block file types have a fixed block size")
}

/// Buckets every free bit into `empty[]` by walking each maximal free run
/// and greedily carving it into chunks of size `min(remaining, 4)`. This
/// partitions the free bits exactly, so `sum(empty[i] * (i+1))` always
/// equals the number of clear bits, and adding the set-bit count recovers
/// `total_bits`.
fn compute_empty_counts(bitmap: &[u8], total_bits: usize) -> [u32; 4] {
    let mut empty = [0u32; 4];
    let mut run = 0usize;
    let mut flush = |run: &mut usize, empty: &mut [u32; 4]| {
        while *run > 0 {
            let chunk = (*run).min(MAX_NUM_BLOCKS as usize);
            empty[chunk - 1] += 1;
            *run -= chunk;
        }
    };
    for bit in 0..total_bits {
        let set = bitmap[bit / 8] & (1 << (bit % 8)) != 0;
        if set {
            flush(&mut run, &mut empty);
        } else {
            run += 1;
        }
    }
    flush(&mut run, &mut empty);
    empty
}

struct OpenBlockFile {
    mapped: MappedFile,
}

impl OpenBlockFile {
    fn header(&self) -> BlockFileHeader {
        BlockFileHeader::decode(&self.mapped.view())
    }

    fn with_header_mut<R>(&self, f: impl FnOnce(&mut BlockFileHeader) -> R) -> R {
        let mut header = self.header();
        let result = f(&mut header);
        header.encode_into(&mut self.mapped.view());
        result
    }

    fn bitmap_get(&self, bit: usize) -> bool {
        let view = self.mapped.view();
        let bitmap = BlockFileHeader::bitmap_range(&view);
        bitmap[bit / 8] & (1 << (bit % 8)) != 0
    }

    fn bitmap_set(&self, bit: usize, value: bool) {
        let mut view = self.mapped.view();
        let bitmap = BlockFileHeader::bitmap_range_mut(&mut view);
        if value {
            bitmap[bit / 8] |= 1 << (bit % 8);
        } else {
            bitmap[bit / 8] &= !(1 << (bit % 8));
        }
    }

    /// Recomputes `empty[]` from the bitmap so that
    /// `sum(empty[i] * (i+1)) + bits_set == max_entries` holds exactly,
    /// not just after a crash. Called after every bitmap mutation rather
    /// than incrementing or decrementing a single arity counter, since a
    /// freed or allocated block can merge with or split off from a run of
    /// a different arity.
    fn recompute_empty(&self) {
        let bitmap = {
            let view = self.mapped.view();
            BlockFileHeader::bitmap_range(&view).to_vec()
        };
        let empty = compute_empty_counts(&bitmap, MAX_BLOCKS_PER_FILE);
        self.with_header_mut(|header| header.empty = empty);
    }

    /// Finds `count` contiguous free bits at or after `hint`, wrapping once.
    fn find_free_run(&self, count: u32, hint: u32) -> Option<u32> {
        let max = MAX_BLOCKS_PER_FILE as u32;
        let count = count as usize;
        let start_points = (hint..max).chain(0..hint);
        'outer: for start in start_points {
            if start as usize + count > MAX_BLOCKS_PER_FILE {
                continue;
            }
            for i in 0..count {
                if self.bitmap_get(start as usize + i) {
                    continue 'outer;
                }
            }
            return Some(start);
        }
        None
    }
}

/// Allocator over the full family of block-files.
pub struct BlockFiles {
    dir: PathBuf,
    files: Mutex<HashMap<u8, Arc<OpenBlockFile>>>,
}

impl BlockFiles {
    pub fn init(dir: impl AsRef<Path>, create: bool) -> Result<BlockFiles> {
        let dir = dir.as_ref().to_path_buf();
        let block_files = BlockFiles { dir, files: Mutex::new(HashMap::new()) };
        for selector in 0..BASE_FILE_COUNT {
            let file_type = match selector {
                0 => FileType::Rankings,
                1 => FileType::Block256,
                2 => FileType::Block1K,
                _ => FileType::Block4K,
            };
            block_files.open_or_create(selector, file_type, create)?;
        }
        Ok(block_files)
    }

    fn file_name(&self, selector: u8) -> PathBuf {
        self.dir.join(format!("data_{selector}"))
    }

    fn open_or_create(&self, selector: u8, file_type: FileType, create: bool) -> Result<Arc<OpenBlockFile>> {
        let mut files = self.files.lock();
        if let Some(existing) = files.get(&selector) {
            return Ok(existing.clone());
        }
        let path = self.file_name(selector);
        let existed = path.exists();
        let mapped = MappedFile::open(&path, create || !existed, BLOCK_HEADER_SIZE as u64)?;
        let is_fresh = !existed;
        if is_fresh {
            let header = BlockFileHeader::new(selector as u16, entry_size_for(file_type), MAX_BLOCKS_PER_FILE as u32);
            header.encode_into(&mut mapped.view());
            mapped.flush()?;
        } else {
            Self::fix_header_if_needed(&mapped)?;
        }
        let opened = Arc::new(OpenBlockFile { mapped });
        if is_fresh {
            // The bitmap is all-zero on a brand new file; seed `empty[]` so
            // the free-space invariant holds from the very first open
            // rather than only after a crash-recovery pass.
            opened.recompute_empty();
        }
        files.insert(selector, opened.clone());
        Ok(opened)
    }

    fn fix_header_if_needed(mapped: &MappedFile) -> Result<()> {
        let header = BlockFileHeader::decode(&mapped.view());
        if header.updating == 0 {
            return Ok(());
        }
        warn!(this_file = header.this_file, "block file was mid-update at last close; recomputing allocation counts");
        let bitmap = {
            let view = mapped.view();
            BlockFileHeader::bitmap_range(&view).to_vec()
        };
        let empty = compute_empty_counts(&bitmap, MAX_BLOCKS_PER_FILE);
        let mut header = header;
        header.empty = empty;
        header.updating = 0;
        header.encode_into(&mut mapped.view());
        mapped.flush()?;
        Ok(())
    }

    fn open_existing(&self, selector: u8) -> Result<Arc<OpenBlockFile>> {
        if let Some(existing) = self.files.lock().get(&selector) {
            return Ok(existing.clone());
        }
        let path = self.file_name(selector);
        let mapped = MappedFile::open(&path, false, BLOCK_HEADER_SIZE as u64)?;
        Self::fix_header_if_needed(&mapped)?;
        let opened = Arc::new(OpenBlockFile { mapped });
        self.files.lock().insert(selector, opened.clone());
        Ok(opened)
    }

    /// Allocates `count` (1..=4) contiguous blocks of the given type,
    /// chaining to (or creating) an overflow file if the current chain has
    /// no room.
    pub fn create_block(&self, file_type: FileType, count: u32, ext_path_dir: Option<&Path>) -> Result<Addr> {
        assert!((1..=MAX_NUM_BLOCKS).contains(&count));
        let _ = ext_path_dir;
        let mut selector = base_selector(file_type);
        loop {
            let open_file = self.open_existing(selector)?;
            let hint = open_file.header().hints[(count - 1) as usize];
            if let Some(start) = open_file.find_free_run(count, hint) {
                open_file.with_header_mut(|header| {
                    header.updating = 1;
                });
                for i in 0..count {
                    open_file.bitmap_set(start as usize + i as usize, true);
                }
                open_file.recompute_empty();
                open_file.with_header_mut(|header| {
                    header.num_entries += 1;
                    header.hints[(count - 1) as usize] = start + count;
                    header.updating = 0;
                });
                debug!(file_type = ?file_type, selector, start, count, "allocated block run");
                return Ok(Addr::new_block(file_type, selector, start as u16, count));
            }
            let next = open_file.header().next_file;
            if next != 0 {
                selector = next as u8;
                continue;
            }
            let new_selector = self.allocate_chain_file(selector, file_type)?;
            selector = new_selector;
        }
    }

    fn allocate_chain_file(&self, predecessor: u8, file_type: FileType) -> Result<u8> {
        let mut next_selector = predecessor.checked_add(1).ok_or_else(|| {
            CacheError::LimitExceeded("block file chain exhausted all 255 selectors".to_string())
        })?;
        while self.file_name(next_selector).exists() {
            next_selector = next_selector.checked_add(1).ok_or_else(|| {
                CacheError::LimitExceeded("block file chain exhausted all 255 selectors".to_string())
            })?;
        }
        self.open_or_create(next_selector, file_type, true)?;
        let predecessor_file = self.open_existing(predecessor)?;
        predecessor_file.with_header_mut(|header| header.next_file = next_selector as u16);
        Ok(next_selector)
    }

    pub fn delete_block(&self, addr: Addr, deep: bool) -> Result<()> {
        let open_file = self.open_existing(addr.file_selector())?;
        let count = addr.num_blocks();
        for i in 0..count {
            open_file.bitmap_set(addr.start_block() as usize + i as usize, false);
        }
        open_file.recompute_empty();
        open_file.with_header_mut(|header| {
            header.num_entries = header.num_entries.saturating_sub(1);
        });
        if deep {
            let file = self.get_file(addr)?;
            let size = addr.block_size().unwrap_or(0) as usize * count as usize;
            let zeros = vec![0u8; size];
            let offset = crate::storage_block::data_offset(addr);
            file.write_at(offset, &zeros)?;
        }
        Ok(())
    }

    pub fn get_file(&self, addr: Addr) -> Result<Arc<CacheFile>> {
        Ok(self.open_existing(addr.file_selector())?.mapped.file().clone())
    }

    /// Reads one slot of the rankings data file's `user[]` header area,
    /// where the rankings transaction log lives (see `rankings.rs`).
    pub fn get_rankings_user(&self, slot: usize) -> Result<u32> {
        let open_file = self.open_existing(base_selector(FileType::Rankings))?;
        Ok(open_file.header().user[slot])
    }

    pub fn set_rankings_user(&self, slot: usize, value: u32) -> Result<()> {
        let open_file = self.open_existing(base_selector(FileType::Rankings))?;
        open_file.with_header_mut(|header| header.user[slot] = value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn fresh_file_satisfies_the_empty_invariant() {
        let dir = tempdir().unwrap();
        let block_files = BlockFiles::init(dir.path(), true).unwrap();
        let open_file = block_files.open_existing(base_selector(FileType::Block1K)).unwrap();
        let header = open_file.header();
        let free: u32 = header.empty.iter().enumerate().map(|(i, &n)| n * (i as u32 + 1)).sum();
        assert_eq!(free, MAX_BLOCKS_PER_FILE as u32);
    }

    #[test]
    fn empty_counters_stay_consistent_across_mixed_alloc_and_free() {
        let dir = tempdir().unwrap();
        let block_files = BlockFiles::init(dir.path(), true).unwrap();
        let a = block_files.create_block(FileType::Block1K, 1, None).unwrap();
        let _b = block_files.create_block(FileType::Block1K, 3, None).unwrap();
        let c = block_files.create_block(FileType::Block1K, 4, None).unwrap();
        block_files.delete_block(a, false).unwrap();
        block_files.delete_block(c, false).unwrap();
        let open_file = block_files.open_existing(base_selector(FileType::Block1K)).unwrap();
        let header = open_file.header();
        let free: u32 = header.empty.iter().enumerate().map(|(i, &n)| n * (i as u32 + 1)).sum();
        let bits_set = (0..MAX_BLOCKS_PER_FILE).filter(|&bit| open_file.bitmap_get(bit)).count() as u32;
        assert_eq!(free + bits_set, MAX_BLOCKS_PER_FILE as u32);
        assert_eq!(bits_set, 3);
    }

    #[test]
    fn allocate_and_free_a_block() {
        let dir = tempdir().unwrap();
        let block_files = BlockFiles::init(dir.path(), true).unwrap();
        let addr = block_files.create_block(FileType::Block256, 1, None).unwrap();
        assert!(addr.is_block_file());
        assert_eq!(addr.file_type(), Some(FileType::Block256));
        block_files.delete_block(addr, true).unwrap();
    }

    #[test]
    fn contiguous_allocations_do_not_overlap() {
        let dir = tempdir().unwrap();
        let block_files = BlockFiles::init(dir.path(), true).unwrap();
        let a = block_files.create_block(FileType::Rankings, 1, None).unwrap();
        let b = block_files.create_block(FileType::Rankings, 1, None).unwrap();
        assert_ne!(a.start_block(), b.start_block());
    }

    #[test]
    fn reopen_after_crash_recomputes_empty_counters() {
        let dir = tempdir().unwrap();
        {
            let block_files = BlockFiles::init(dir.path(), true).unwrap();
            let addr = block_files.create_block(FileType::Block1K, 1, None).unwrap();
            let open_file = block_files.open_existing(addr.file_selector()).unwrap();
            open_file.with_header_mut(|h| h.updating = 1);
        }
        let block_files = BlockFiles::init(dir.path(), false).unwrap();
        let open_file = block_files.open_existing(base_selector(FileType::Block1K)).unwrap();
        assert_eq!(open_file.header().updating, 0);
    }
}
