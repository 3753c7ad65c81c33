//! Packed 32-bit storage addresses.
//!
//! Every location the cache ever refers to (a rankings node, an entry
//! store record, a block of user data, or an external file) is named by
//! one `u32`. The high bit marks the address as initialized; the next three
//! bits carry the [`FileType`]; the remaining 28 bits are either a file
//! number (external files) or a packed `(reserved, num_blocks, file
//! selector, start block)` tuple (block files). This module is a pure value
//! type: it does no I/O and touches no files.

/// The kind of storage a given [`Addr`] refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileType {
    /// A standalone `f_XXXXXX` file.
    External = 0,
    /// A 36-byte rankings-node slot in `data_0`.
    Rankings = 1,
    /// A 256-byte entry-store slot.
    Block256 = 2,
    /// A 1024-byte user-data slot.
    Block1K = 3,
    /// A 4096-byte user-data slot.
    Block4K = 4,
}

impl FileType {
    fn from_bits(bits: u32) -> Option<FileType> {
        match bits {
            0 => Some(FileType::External),
            1 => Some(FileType::Rankings),
            2 => Some(FileType::Block256),
            3 => Some(FileType::Block1K),
            4 => Some(FileType::Block4K),
            _ => None,
        }
    }

    /// The fixed block size in bytes for this file type, or `None` for
    /// `External`, whose blocks have no fixed size.
    pub fn block_size(self) -> Option<u32> {
        match self {
            FileType::External => None,
            FileType::Rankings => Some(36),
            FileType::Block256 => Some(256),
            FileType::Block1K => Some(1024),
            FileType::Block4K => Some(4096),
        }
    }
}

const KIND_INITIALIZED_MASK: u32 = 0x8000_0000;
const KIND_FILE_TYPE_MASK: u32 = 0x7000_0000;
const KIND_FILE_TYPE_OFFSET: u32 = 28;
const KIND_NUM_BLOCKS_MASK: u32 = 0x0300_0000;
const KIND_NUM_BLOCKS_OFFSET: u32 = 24;
const KIND_FILE_SELECTOR_MASK: u32 = 0x00ff_0000;
const KIND_FILE_SELECTOR_OFFSET: u32 = 16;
const KIND_START_BLOCK_MASK: u32 = 0x0000_ffff;
const KIND_FILE_NAME_MASK: u32 = 0x0fff_ffff;

/// Above this many bytes, a stream or key escalates to a standalone
/// external file instead of a block-file allocation.
pub const MAX_BLOCK_SIZE: u32 = 4096 * 4;
pub const MAX_BLOCK_FILE: u16 = 255;
pub const MAX_NUM_BLOCKS: u32 = 4;
pub const FIRST_ADDITIONAL_BLOCK_FILE: u16 = 4;

/// A packed, self-describing address. Zero is never a valid initialized
/// address; callers treat `0u32` as "no address" throughout this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Addr(u32);

impl Addr {
    /// Wraps a raw on-disk address value without validating it.
    pub fn from_raw(value: u32) -> Addr {
        Addr(value)
    }

    pub fn raw(self) -> u32 {
        self.0
    }

    pub fn is_initialized(self) -> bool {
        self.0 & KIND_INITIALIZED_MASK != 0
    }

    /// An address is a separate (external) file address when it is
    /// initialized and its file type is `External`.
    pub fn is_separate_file(self) -> bool {
        self.is_initialized() && self.file_type() == Some(FileType::External)
    }

    pub fn is_block_file(self) -> bool {
        self.is_initialized() && self.file_type() != Some(FileType::External)
    }

    pub fn file_type(self) -> Option<FileType> {
        FileType::from_bits((self.0 & KIND_FILE_TYPE_MASK) >> KIND_FILE_TYPE_OFFSET)
    }

    /// The external file number. Only meaningful when [`Addr::is_separate_file`].
    pub fn file_number(self) -> u32 {
        self.0 & KIND_FILE_NAME_MASK
    }

    /// The block-file selector (0-based file index within a size class).
    /// Only meaningful when [`Addr::is_block_file`].
    pub fn file_selector(self) -> u8 {
        ((self.0 & KIND_FILE_SELECTOR_MASK) >> KIND_FILE_SELECTOR_OFFSET) as u8
    }

    /// The first block number of this allocation within its file.
    pub fn start_block(self) -> u16 {
        (self.0 & KIND_START_BLOCK_MASK) as u16
    }

    /// The number of contiguous blocks claimed by this allocation (1..=4).
    pub fn num_blocks(self) -> u32 {
        ((self.0 & KIND_NUM_BLOCKS_MASK) >> KIND_NUM_BLOCKS_OFFSET) + 1
    }

    pub fn block_size(self) -> Option<u32> {
        self.file_type().and_then(FileType::block_size)
    }

    /// Builds a block-file address.
    pub fn new_block(file_type: FileType, file_selector: u8, start_block: u16, num_blocks: u32) -> Addr {
        assert!(file_type != FileType::External);
        assert!((1..=MAX_NUM_BLOCKS).contains(&num_blocks));
        let bits = KIND_INITIALIZED_MASK
            | ((file_type as u32) << KIND_FILE_TYPE_OFFSET)
            | ((num_blocks - 1) << KIND_NUM_BLOCKS_OFFSET)
            | ((file_selector as u32) << KIND_FILE_SELECTOR_OFFSET)
            | (start_block as u32 & KIND_START_BLOCK_MASK);
        Addr(bits)
    }

    /// Builds an external-file address.
    pub fn new_external(file_number: u32) -> Addr {
        assert!(file_number & !KIND_FILE_NAME_MASK == 0);
        Addr(KIND_INITIALIZED_MASK | file_number)
    }

    /// The smallest block-file type that can hold `size` bytes in one
    /// allocation, or [`FileType::External`] if `size` exceeds the largest
    /// block class (`4 * 4096` bytes, i.e. 4 chained 4K blocks).
    pub fn required_file_type(size: u32) -> FileType {
        if size < 1024 {
            FileType::Block256
        } else if size < 4096 {
            FileType::Block1K
        } else if size <= MAX_BLOCK_SIZE {
            FileType::Block4K
        } else {
            FileType::External
        }
    }
}

impl Default for Addr {
    /// The canonical "no address" value.
    fn default() -> Self {
        Addr(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_is_not_initialized() {
        assert!(!Addr::default().is_initialized());
    }

    #[test]
    fn block_address_round_trips_fields() {
        let addr = Addr::new_block(FileType::Block1K, 3, 500, 2);
        assert!(addr.is_initialized());
        assert!(addr.is_block_file());
        assert!(!addr.is_separate_file());
        assert_eq!(addr.file_type(), Some(FileType::Block1K));
        assert_eq!(addr.file_selector(), 3);
        assert_eq!(addr.start_block(), 500);
        assert_eq!(addr.num_blocks(), 2);
        assert_eq!(addr.block_size(), Some(1024));
    }

    #[test]
    fn external_address_round_trips_file_number() {
        let addr = Addr::new_external(0x1_0005);
        assert!(addr.is_separate_file());
        assert!(!addr.is_block_file());
        assert_eq!(addr.file_number(), 0x1_0005);
    }

    #[test]
    fn required_file_type_matches_size_bands() {
        assert_eq!(Addr::required_file_type(0), FileType::Block256);
        assert_eq!(Addr::required_file_type(1023), FileType::Block256);
        assert_eq!(Addr::required_file_type(1024), FileType::Block1K);
        assert_eq!(Addr::required_file_type(4095), FileType::Block1K);
        assert_eq!(Addr::required_file_type(4096), FileType::Block4K);
        assert_eq!(Addr::required_file_type(MAX_BLOCK_SIZE), FileType::Block4K);
        assert_eq!(Addr::required_file_type(MAX_BLOCK_SIZE + 1), FileType::External);
    }

    #[test]
    fn single_block_allocation_uses_zero_based_count() {
        let addr = Addr::new_block(FileType::Block4K, 0, 0, 1);
        assert_eq!(addr.num_blocks(), 1);
    }
}
