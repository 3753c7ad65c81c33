//! On-disk record layouts.
//!
//! Every fixed-size record the cache persists (`IndexHeader`, `EntryStore`,
//! `RankingsNode`, `BlockFileHeader`, `SparseHeader`/`SparseData`) is encoded
//! here as an explicit little-endian byte layout rather than `#[repr(C)]` +
//! a reinterpret cast, so the in-memory struct can use normal Rust types
//! (`bool`, enums, `Vec`) while the on-disk shape stays pinned to exact byte
//! offsets regardless of target platform alignment. `EntryStore`,
//! `RankingsNode` and `BlockFileHeader` are exactly 256, 36 and 8192 bytes
//! respectively; that's an invariant checked by this module's tests, not
//! just a comment.

use crate::address::Addr;

pub const INDEX_MAGIC: u32 = 0xC103_CAC3;
pub const BLOCK_MAGIC: u32 = 0xC104_CAC3;
/// Major version 2, minor version 0. Only the major half is checked on open.
pub const CURRENT_VERSION: u32 = 0x0002_0000;
pub const MIN_INDEX_TABLE_LEN: u32 = 0x1_0000;

pub const ENTRY_STORE_SIZE: usize = 256;
pub const RANKINGS_NODE_SIZE: usize = 36;
pub const BLOCK_HEADER_SIZE: usize = 8192;
/// Bytes of [`BlockFileHeader`] occupied by fixed fields, before the bitmap.
const BLOCK_HEADER_FIXED_SIZE: usize = 80;
pub const BLOCK_HEADER_BITMAP_BYTES: usize = BLOCK_HEADER_SIZE - BLOCK_HEADER_FIXED_SIZE;
pub const MAX_BLOCKS_PER_FILE: usize = BLOCK_HEADER_BITMAP_BYTES * 8;

/// Bytes of [`EntryStore`] occupied by fixed fields, before the inline key.
const ENTRY_STORE_FIXED_SIZE: usize = 76;
pub const INLINE_KEY_CAP_PER_BLOCK: usize = ENTRY_STORE_SIZE - ENTRY_STORE_FIXED_SIZE;
pub const MAX_ENTRY_STORE_BLOCKS: usize = 4;
/// Keys up to this length are stored inline across up to
/// [`MAX_ENTRY_STORE_BLOCKS`] contiguous entry-store blocks; longer keys are
/// addressed indirectly through `EntryStore::long_key`.
pub const INLINE_KEY_MAX: usize = INLINE_KEY_CAP_PER_BLOCK + ENTRY_STORE_SIZE * (MAX_ENTRY_STORE_BLOCKS - 1);

pub const NUM_SPARSE_BITS: usize = 1024;
const SPARSE_HEADER_FIXED_SIZE: usize = 16;
pub const SPARSE_DATA_SIZE: usize = SPARSE_HEADER_FIXED_SIZE + NUM_SPARSE_BITS / 8;

/// Number of logical rankings lists in the reuse-aware eviction scheme.
pub const NUM_RANKING_LISTS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum EntryState {
    Normal = 0,
    Evicted = 1,
    Doomed = 2,
}

impl EntryState {
    fn from_i32(v: i32) -> EntryState {
        match v {
            1 => EntryState::Evicted,
            2 => EntryState::Doomed,
            _ => EntryState::Normal,
        }
    }
}

pub const FLAG_PARENT_ENTRY: u32 = 1;
pub const FLAG_CHILD_ENTRY: u32 = 1 << 1;

fn w_u32(buf: &mut [u8], off: usize, v: u32) {
    buf[off..off + 4].copy_from_slice(&v.to_le_bytes());
}
fn r_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes(buf[off..off + 4].try_into().unwrap())
}
fn w_i32(buf: &mut [u8], off: usize, v: i32) {
    buf[off..off + 4].copy_from_slice(&v.to_le_bytes());
}
fn r_i32(buf: &[u8], off: usize) -> i32 {
    i32::from_le_bytes(buf[off..off + 4].try_into().unwrap())
}
fn w_u64(buf: &mut [u8], off: usize, v: u64) {
    buf[off..off + 8].copy_from_slice(&v.to_le_bytes());
}
fn r_u64(buf: &[u8], off: usize) -> u64 {
    u64::from_le_bytes(buf[off..off + 8].try_into().unwrap())
}
fn w_u16(buf: &mut [u8], off: usize, v: u16) {
    buf[off..off + 2].copy_from_slice(&v.to_le_bytes());
}
fn r_u16(buf: &[u8], off: usize) -> u16 {
    u16::from_le_bytes(buf[off..off + 2].try_into().unwrap())
}

/// The five LRU lists' head/tail/size, embedded in [`IndexHeader`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LruData {
    pub filled: bool,
    pub sizes: [u32; NUM_RANKING_LISTS],
    pub heads: [u32; NUM_RANKING_LISTS],
    pub tails: [u32; NUM_RANKING_LISTS],
}

const LRU_DATA_SIZE: usize = 4 + 4 * NUM_RANKING_LISTS * 3;

impl LruData {
    fn encode(&self, buf: &mut [u8]) {
        w_u32(buf, 0, self.filled as u32);
        for i in 0..NUM_RANKING_LISTS {
            w_u32(buf, 4 + i * 4, self.sizes[i]);
            w_u32(buf, 4 + NUM_RANKING_LISTS * 4 + i * 4, self.heads[i]);
            w_u32(buf, 4 + NUM_RANKING_LISTS * 8 + i * 4, self.tails[i]);
        }
    }

    fn decode(buf: &[u8]) -> LruData {
        let filled = r_u32(buf, 0) != 0;
        let mut sizes = [0u32; NUM_RANKING_LISTS];
        let mut heads = [0u32; NUM_RANKING_LISTS];
        let mut tails = [0u32; NUM_RANKING_LISTS];
        for i in 0..NUM_RANKING_LISTS {
            sizes[i] = r_u32(buf, 4 + i * 4);
            heads[i] = r_u32(buf, 4 + NUM_RANKING_LISTS * 4 + i * 4);
            tails[i] = r_u32(buf, 4 + NUM_RANKING_LISTS * 8 + i * 4);
        }
        LruData { filled, sizes, heads, tails }
    }
}

/// The persistent header of the `index` file, immediately followed on disk
/// by a power-of-two table of [`Addr`] hash buckets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexHeader {
    pub magic: u32,
    pub version: u32,
    pub num_entries: u32,
    pub num_bytes: u64,
    pub last_file: u32,
    pub this_id: u32,
    pub stats_addr: u32,
    pub table_len: u32,
    pub crash: u32,
    pub experiment: u32,
    pub create_time: u64,
    pub lru: LruData,
}

pub const INDEX_HEADER_SIZE: usize = 4 + 4 + 4 + 8 + 4 + 4 + 4 + 4 + 4 + 4 + 8 + LRU_DATA_SIZE;

impl IndexHeader {
    pub fn new(table_len: u32, now: u64) -> IndexHeader {
        IndexHeader {
            magic: INDEX_MAGIC,
            version: CURRENT_VERSION,
            num_entries: 0,
            num_bytes: 0,
            last_file: 0,
            this_id: 0,
            stats_addr: 0,
            table_len,
            crash: 0,
            experiment: 0,
            create_time: now,
            lru: LruData::default(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; INDEX_HEADER_SIZE];
        w_u32(&mut buf, 0, self.magic);
        w_u32(&mut buf, 4, self.version);
        w_u32(&mut buf, 8, self.num_entries);
        w_u64(&mut buf, 12, self.num_bytes);
        w_u32(&mut buf, 20, self.last_file);
        w_u32(&mut buf, 24, self.this_id);
        w_u32(&mut buf, 28, self.stats_addr);
        w_u32(&mut buf, 32, self.table_len);
        w_u32(&mut buf, 36, self.crash);
        w_u32(&mut buf, 40, self.experiment);
        w_u64(&mut buf, 44, self.create_time);
        self.lru.encode(&mut buf[52..52 + LRU_DATA_SIZE]);
        buf
    }

    pub fn decode(buf: &[u8]) -> IndexHeader {
        IndexHeader {
            magic: r_u32(buf, 0),
            version: r_u32(buf, 4),
            num_entries: r_u32(buf, 8),
            num_bytes: r_u64(buf, 12),
            last_file: r_u32(buf, 20),
            this_id: r_u32(buf, 24),
            stats_addr: r_u32(buf, 28),
            table_len: r_u32(buf, 32),
            crash: r_u32(buf, 36),
            experiment: r_u32(buf, 40),
            create_time: r_u64(buf, 44),
            lru: LruData::decode(&buf[52..52 + LRU_DATA_SIZE]),
        }
    }

    pub fn version_major(&self) -> u32 {
        self.version >> 16
    }
}

/// A 256-byte entry-store record (possibly the first of up to
/// [`MAX_ENTRY_STORE_BLOCKS`] contiguous blocks when the key does not fit
/// in one).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryStore {
    pub hash: u32,
    pub next: u32,
    pub rankings_node: u32,
    pub reuse_count: i32,
    pub refetch_count: i32,
    pub state: EntryState,
    pub creation_time: u64,
    pub key_len: i32,
    pub long_key: u32,
    pub data_size: [i32; 4],
    pub data_addr: [u32; 4],
    pub flags: u32,
    /// Inline key bytes; valid for `key_len` bytes for non-`long_key`
    /// entries, truncated/ignored when `long_key != 0`.
    pub key: Vec<u8>,
}

impl EntryStore {
    pub fn blocks_needed_for_key(key_len: usize) -> usize {
        if key_len <= INLINE_KEY_CAP_PER_BLOCK {
            1
        } else {
            let extra = key_len - INLINE_KEY_CAP_PER_BLOCK;
            1 + extra.div_ceil(ENTRY_STORE_SIZE)
        }
    }

    /// Encodes into a buffer sized for `num_blocks` contiguous 256-byte
    /// blocks (`num_blocks * ENTRY_STORE_SIZE` bytes).
    pub fn encode(&self, num_blocks: usize) -> Vec<u8> {
        let mut buf = vec![0u8; ENTRY_STORE_SIZE * num_blocks];
        w_u32(&mut buf, 0, self.hash);
        w_u32(&mut buf, 4, self.next);
        w_u32(&mut buf, 8, self.rankings_node);
        w_i32(&mut buf, 12, self.reuse_count);
        w_i32(&mut buf, 16, self.refetch_count);
        w_i32(&mut buf, 20, self.state as i32);
        w_u64(&mut buf, 24, self.creation_time);
        w_i32(&mut buf, 32, self.key_len);
        w_u32(&mut buf, 36, self.long_key);
        for i in 0..4 {
            w_i32(&mut buf, 40 + i * 4, self.data_size[i]);
        }
        for i in 0..4 {
            w_u32(&mut buf, 56 + i * 4, self.data_addr[i]);
        }
        w_u32(&mut buf, 72, self.flags);
        let cap = buf.len() - ENTRY_STORE_FIXED_SIZE;
        let n = self.key.len().min(cap);
        buf[ENTRY_STORE_FIXED_SIZE..ENTRY_STORE_FIXED_SIZE + n].copy_from_slice(&self.key[..n]);
        buf
    }

    pub fn decode(buf: &[u8]) -> EntryStore {
        let mut data_size = [0i32; 4];
        let mut data_addr = [0u32; 4];
        for i in 0..4 {
            data_size[i] = r_i32(buf, 40 + i * 4);
            data_addr[i] = r_u32(buf, 56 + i * 4);
        }
        let key_len = r_i32(buf, 32).max(0) as usize;
        let available = buf.len() - ENTRY_STORE_FIXED_SIZE;
        let n = key_len.min(available);
        EntryStore {
            hash: r_u32(buf, 0),
            next: r_u32(buf, 4),
            rankings_node: r_u32(buf, 8),
            reuse_count: r_i32(buf, 12),
            refetch_count: r_i32(buf, 16),
            state: EntryState::from_i32(r_i32(buf, 20)),
            creation_time: r_u64(buf, 24),
            key_len: r_i32(buf, 32),
            long_key: r_u32(buf, 36),
            data_size,
            data_addr,
            flags: r_u32(buf, 72),
            key: buf[ENTRY_STORE_FIXED_SIZE..ENTRY_STORE_FIXED_SIZE + n].to_vec(),
        }
    }
}

/// The 36-byte doubly-linked-list element tracking an entry's LRU position
/// and open/dirty state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RankingsNode {
    pub last_used: u64,
    pub last_modified: u64,
    pub next: u32,
    pub prev: u32,
    pub contents: u32,
    /// Generation id this node was last written dirty under, or 0 if clean.
    pub dirty: i32,
    /// Zero when the entry is not open; non-zero (a sentinel, never a raw
    /// pointer) while it is. See the crate-level design notes on why this
    /// never carries an in-memory address.
    pub pointer: u32,
}

impl RankingsNode {
    pub fn encode(&self) -> [u8; RANKINGS_NODE_SIZE] {
        let mut buf = [0u8; RANKINGS_NODE_SIZE];
        w_u64(&mut buf, 0, self.last_used);
        w_u64(&mut buf, 8, self.last_modified);
        w_u32(&mut buf, 16, self.next);
        w_u32(&mut buf, 20, self.prev);
        w_u32(&mut buf, 24, self.contents);
        w_i32(&mut buf, 28, self.dirty);
        w_u32(&mut buf, 32, self.pointer);
        buf
    }

    pub fn decode(buf: &[u8]) -> RankingsNode {
        RankingsNode {
            last_used: r_u64(buf, 0),
            last_modified: r_u64(buf, 8),
            next: r_u32(buf, 16),
            prev: r_u32(buf, 20),
            contents: r_u32(buf, 24),
            dirty: r_i32(buf, 28),
            pointer: r_u32(buf, 32),
        }
    }

    pub fn is_open(&self) -> bool {
        self.pointer != 0
    }
}

/// The 8 KB header of a block-file, immediately followed on disk by the
/// allocation bitmap ([`BLOCK_HEADER_BITMAP_BYTES`] bytes).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockFileHeader {
    pub magic: u32,
    pub version: u32,
    pub this_file: u16,
    pub next_file: u16,
    pub entry_size: u32,
    pub num_entries: u32,
    pub max_entries: u32,
    /// `empty[i]` = free blocks available in contiguous runs of `i + 1`.
    pub empty: [u32; 4],
    /// Last known allocation position per arity, as a bitmap bit index.
    pub hints: [u32; 4],
    /// Non-zero while a bitmap mutation is in flight; used to detect a torn
    /// write across a crash.
    pub updating: u32,
    /// Opaque to `BlockFiles`; the rankings subsystem stores its single
    /// active transaction (head/tail snapshot + node address + operation)
    /// here on the rankings data file. See `rankings.rs`.
    pub user: [u32; 5],
}

impl BlockFileHeader {
    /// Builds a header with an all-zero bitmap's worth of bookkeeping.
    /// `empty` starts at `[0; 4]` here; the caller recomputes it against the
    /// actual bitmap right after this runs, since the free-run accounting
    /// depends on the bitmap contents, not just `max_entries`.
    pub fn new(this_file: u16, entry_size: u32, max_entries: u32) -> BlockFileHeader {
        BlockFileHeader {
            magic: BLOCK_MAGIC,
            version: CURRENT_VERSION,
            this_file,
            next_file: 0,
            entry_size,
            num_entries: 0,
            max_entries,
            empty: [0; 4],
            hints: [0; 4],
            updating: 0,
            user: [0; 5],
        }
    }

    pub fn encode_into(&self, buf: &mut [u8]) {
        debug_assert!(buf.len() >= BLOCK_HEADER_SIZE);
        w_u32(buf, 0, self.magic);
        w_u32(buf, 4, self.version);
        w_u16(buf, 8, self.this_file);
        w_u16(buf, 10, self.next_file);
        w_u32(buf, 12, self.entry_size);
        w_u32(buf, 16, self.num_entries);
        w_u32(buf, 20, self.max_entries);
        for i in 0..4 {
            w_u32(buf, 24 + i * 4, self.empty[i]);
        }
        for i in 0..4 {
            w_u32(buf, 40 + i * 4, self.hints[i]);
        }
        w_u32(buf, 56, self.updating);
        for i in 0..5 {
            w_u32(buf, 60 + i * 4, self.user[i]);
        }
    }

    pub fn decode(buf: &[u8]) -> BlockFileHeader {
        let mut empty = [0u32; 4];
        let mut hints = [0u32; 4];
        let mut user = [0u32; 5];
        for i in 0..4 {
            empty[i] = r_u32(buf, 24 + i * 4);
            hints[i] = r_u32(buf, 40 + i * 4);
        }
        for i in 0..5 {
            user[i] = r_u32(buf, 60 + i * 4);
        }
        BlockFileHeader {
            magic: r_u32(buf, 0),
            version: r_u32(buf, 4),
            this_file: r_u16(buf, 8),
            next_file: r_u16(buf, 10),
            entry_size: r_u32(buf, 12),
            num_entries: r_u32(buf, 16),
            max_entries: r_u32(buf, 20),
            empty,
            hints,
            updating: r_u32(buf, 56),
            user,
        }
    }

    pub fn bitmap_range(buf: &[u8]) -> &[u8] {
        &buf[BLOCK_HEADER_FIXED_SIZE..BLOCK_HEADER_SIZE]
    }

    pub fn bitmap_range_mut(buf: &mut [u8]) -> &mut [u8] {
        &mut buf[BLOCK_HEADER_FIXED_SIZE..BLOCK_HEADER_SIZE]
    }
}

/// Header shared by the parent's child-presence record and each child's
/// residency record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SparseHeader {
    pub signature: u64,
    pub magic: u32,
    pub parent_key_len: u32,
}

impl SparseHeader {
    pub fn encode(&self, buf: &mut [u8]) {
        w_u64(buf, 0, self.signature);
        w_u32(buf, 8, self.magic);
        w_u32(buf, 12, self.parent_key_len);
    }

    pub fn decode(buf: &[u8]) -> SparseHeader {
        SparseHeader {
            signature: r_u64(buf, 0),
            magic: r_u32(buf, 8),
            parent_key_len: r_u32(buf, 12),
        }
    }
}

/// A child's sparse record: header plus its fixed 1024-bit (128-byte)
/// residency bitmap, one bit per 1 KB slot of the child's 1 MB window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SparseData {
    pub header: SparseHeader,
    pub bitmap: Vec<u8>,
}

impl SparseData {
    pub fn new(signature: u64, parent_key_len: u32) -> SparseData {
        SparseData {
            header: SparseHeader { signature, magic: BLOCK_MAGIC, parent_key_len },
            bitmap: vec![0u8; NUM_SPARSE_BITS / 8],
        }
    }

    pub fn encode(&self) -> [u8; SPARSE_DATA_SIZE] {
        let mut buf = [0u8; SPARSE_DATA_SIZE];
        self.header.encode(&mut buf[0..SPARSE_HEADER_FIXED_SIZE]);
        buf[SPARSE_HEADER_FIXED_SIZE..].copy_from_slice(&self.bitmap);
        buf
    }

    pub fn decode(buf: &[u8]) -> SparseData {
        SparseData {
            header: SparseHeader::decode(&buf[0..SPARSE_HEADER_FIXED_SIZE]),
            bitmap: buf[SPARSE_HEADER_FIXED_SIZE..].to_vec(),
        }
    }

    pub fn bit(&self, i: usize) -> bool {
        self.bitmap[i / 8] & (1 << (i % 8)) != 0
    }

    pub fn set_bit(&mut self, i: usize, value: bool) {
        if value {
            self.bitmap[i / 8] |= 1 << (i % 8);
        } else {
            self.bitmap[i / 8] &= !(1 << (i % 8));
        }
    }
}

/// Address of the stats record, stored in [`IndexHeader::stats_addr`].
pub fn stats_addr(header: &IndexHeader) -> Addr {
    Addr::from_raw(header.stats_addr)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_store_is_exactly_256_bytes() {
        let store = EntryStore {
            hash: 1,
            next: 0,
            rankings_node: 2,
            reuse_count: 0,
            refetch_count: 0,
            state: EntryState::Normal,
            creation_time: 123,
            key_len: 3,
            long_key: 0,
            data_size: [0; 4],
            data_addr: [0; 4],
            flags: 0,
            key: b"abc".to_vec(),
        };
        let encoded = store.encode(1);
        assert_eq!(encoded.len(), ENTRY_STORE_SIZE);
    }

    #[test]
    fn rankings_node_is_exactly_36_bytes() {
        let node = RankingsNode::default();
        assert_eq!(node.encode().len(), RANKINGS_NODE_SIZE);
    }

    #[test]
    fn block_file_header_is_exactly_8192_bytes() {
        let header = BlockFileHeader::new(0, 256, 100);
        let mut buf = vec![0u8; BLOCK_HEADER_SIZE];
        header.encode_into(&mut buf);
        assert_eq!(buf.len(), BLOCK_HEADER_SIZE);
        assert_eq!(BlockFileHeader::decode(&buf), header);
    }

    #[test]
    fn max_blocks_matches_bitmap_capacity() {
        assert_eq!(MAX_BLOCKS_PER_FILE, (BLOCK_HEADER_SIZE - 80) * 8);
    }

    #[test]
    fn entry_store_round_trips_all_fields() {
        let store = EntryStore {
            hash: 0xdead_beef,
            next: 7,
            rankings_node: 9,
            reuse_count: 2,
            refetch_count: 1,
            state: EntryState::Doomed,
            creation_time: 99,
            key_len: 5,
            long_key: 0,
            data_size: [10, 20, 30, 40],
            data_addr: [1, 2, 3, 4],
            flags: FLAG_PARENT_ENTRY,
            key: b"hello".to_vec(),
        };
        let encoded = store.encode(1);
        let decoded = EntryStore::decode(&encoded);
        assert_eq!(decoded.hash, store.hash);
        assert_eq!(decoded.state, EntryState::Doomed);
        assert_eq!(decoded.data_size, store.data_size);
        assert_eq!(decoded.data_addr, store.data_addr);
        assert_eq!(&decoded.key[..], b"hello");
    }

    #[test]
    fn entry_store_spans_multiple_blocks_for_long_keys() {
        assert_eq!(EntryStore::blocks_needed_for_key(10), 1);
        assert_eq!(EntryStore::blocks_needed_for_key(INLINE_KEY_CAP_PER_BLOCK), 1);
        assert_eq!(EntryStore::blocks_needed_for_key(INLINE_KEY_CAP_PER_BLOCK + 1), 2);
        assert_eq!(EntryStore::blocks_needed_for_key(INLINE_KEY_MAX), MAX_ENTRY_STORE_BLOCKS);
    }

    #[test]
    fn sparse_data_bit_round_trips() {
        let mut data = SparseData::new(42, 3);
        assert!(!data.bit(5));
        data.set_bit(5, true);
        assert!(data.bit(5));
        let encoded = data.encode();
        let decoded = SparseData::decode(&encoded);
        assert!(decoded.bit(5));
        assert_eq!(decoded.header.signature, 42);
    }

    #[test]
    fn index_header_round_trips() {
        let mut header = IndexHeader::new(MIN_INDEX_TABLE_LEN, 1000);
        header.num_entries = 5;
        header.lru.heads[0] = 7;
        let encoded = header.encode();
        let decoded = IndexHeader::decode(&encoded);
        assert_eq!(decoded, header);
        assert_eq!(decoded.version_major(), 2);
    }
}
