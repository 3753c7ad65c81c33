//! Buffered typed views over a block-file region.
//!
//! A `StorageBlock<T>` names one record by [`Addr`] and lazily loads it into
//! an in-memory `T` on first access; writes are deferred until `store` is
//! called explicitly or the block is dropped while modified. This is the
//! same buffer-then-flush shape this codebase's storage layer uses for
//! typed pages, adapted to the cache's fixed-size records instead of
//! generic 4 KB pages.

use std::sync::Arc;

use tracing::error;

use crate::address::Addr;
use crate::format::{BLOCK_HEADER_SIZE, RANKINGS_NODE_SIZE};
use crate::file_io::CacheFile;
use crate::error::Result;

/// A fixed- or address-sized on-disk record with an explicit byte codec.
pub trait Record: Sized {
    fn decode(buf: &[u8]) -> Self;
    /// Encodes into a buffer already sized to this record's on-disk length
    /// (`addr.num_blocks() * block_size`, or the fixed record size).
    fn encode_into(&self, buf: &mut [u8]);
}

impl Record for crate::format::RankingsNode {
    fn decode(buf: &[u8]) -> Self {
        crate::format::RankingsNode::decode(buf)
    }

    fn encode_into(&self, buf: &mut [u8]) {
        buf.copy_from_slice(&self.encode());
    }
}

impl Record for crate::format::EntryStore {
    fn decode(buf: &[u8]) -> Self {
        crate::format::EntryStore::decode(buf)
    }

    fn encode_into(&self, buf: &mut [u8]) {
        let encoded = self.encode(buf.len() / crate::format::ENTRY_STORE_SIZE);
        buf.copy_from_slice(&encoded);
    }
}

/// Byte offset of the data region of a block file, following its header.
pub fn data_offset(addr: Addr) -> u64 {
    BLOCK_HEADER_SIZE as u64 + addr.start_block() as u64 * addr.block_size().unwrap_or(RANKINGS_NODE_SIZE as u32) as u64
}

pub struct StorageBlock<T: Record> {
    file: Arc<CacheFile>,
    addr: Addr,
    size: usize,
    data: Option<T>,
    modified: bool,
}

impl<T: Record> StorageBlock<T> {
    pub fn new(file: Arc<CacheFile>, addr: Addr, size: usize) -> StorageBlock<T> {
        StorageBlock { file, addr, size, data: None, modified: false }
    }

    pub fn addr(&self) -> Addr {
        self.addr
    }

    pub fn load(&mut self) -> Result<&T> {
        if self.data.is_none() {
            let mut buf = vec![0u8; self.size];
            self.file.read_at(data_offset(self.addr), &mut buf)?;
            self.data = Some(T::decode(&buf));
        }
        Ok(self.data.as_ref().expect("just loaded"))
    }

    pub fn load_mut(&mut self) -> Result<&mut T> {
        self.load()?;
        self.modified = true;
        Ok(self.data.as_mut().expect("just loaded"))
    }

    /// Installs `data` directly without reading from disk, marking the
    /// block modified. Used when an in-memory owner already has the record
    /// (e.g. an `EntryImpl` sharing its just-written rankings node with an
    /// iterator observing the same address).
    pub fn set_data(&mut self, data: T) {
        self.data = Some(data);
        self.modified = true;
    }

    pub fn data(&self) -> Option<&T> {
        self.data.as_ref()
    }

    pub fn store(&mut self) -> Result<()> {
        if let Some(data) = &self.data {
            let mut buf = vec![0u8; self.size];
            data.encode_into(&mut buf);
            self.file.write_at(data_offset(self.addr), &buf)?;
            self.modified = false;
        }
        Ok(())
    }
}

impl<T: Record> Drop for StorageBlock<T> {
    fn drop(&mut self) {
        if self.modified {
            if let Err(e) = self.store() {
                error!(addr = self.addr.raw(), error = %e, "failed to flush storage block on drop");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::FileType;
    use crate::format::RankingsNode;
    use tempfile::tempdir;

    #[test]
    fn load_reads_through_to_the_backing_file() {
        let dir = tempdir().unwrap();
        let file = Arc::new(CacheFile::open(dir.path().join("data_0"), true).unwrap());
        file.set_len(BLOCK_HEADER_SIZE as u64 + RANKINGS_NODE_SIZE as u64 * 4).unwrap();

        let addr = Addr::new_block(FileType::Rankings, 0, 1, 1);
        let node = RankingsNode { last_used: 5, contents: 99, ..Default::default() };
        {
            let mut block: StorageBlock<RankingsNode> = StorageBlock::new(file.clone(), addr, RANKINGS_NODE_SIZE);
            block.set_data(node);
            block.store().unwrap();
        }
        let mut block: StorageBlock<RankingsNode> = StorageBlock::new(file.clone(), addr, RANKINGS_NODE_SIZE);
        let loaded = block.load().unwrap();
        assert_eq!(loaded.last_used, 5);
        assert_eq!(loaded.contents, 99);
    }

    #[test]
    fn drop_flushes_modified_block() {
        let dir = tempdir().unwrap();
        let file = Arc::new(CacheFile::open(dir.path().join("data_0"), true).unwrap());
        file.set_len(BLOCK_HEADER_SIZE as u64 + RANKINGS_NODE_SIZE as u64 * 4).unwrap();
        let addr = Addr::new_block(FileType::Rankings, 0, 2, 1);
        {
            let mut block: StorageBlock<RankingsNode> = StorageBlock::new(file.clone(), addr, RANKINGS_NODE_SIZE);
            block.load_mut().unwrap().contents = 7;
        }
        let mut block: StorageBlock<RankingsNode> = StorageBlock::new(file.clone(), addr, RANKINGS_NODE_SIZE);
        assert_eq!(block.load().unwrap().contents, 7);
    }
}
