//! Sparse (random-access, gap-tolerant) data support.
//!
//! A sparse-capable entry never stores its payload directly; instead it is
//! split into 1 MiB windows, each backed by its own "child" entry whose key
//! is derived from the parent's key and a per-parent signature
//! (`GenerateChildKey`/`OpenChild` in the source this is grounded on). Each
//! child tracks, at 1 KiB granularity, which parts of its window have
//! actually been written, via the 1024-bit bitmap in [`SparseData`]. Reads
//! stop at the first unwritten byte: sparse reads report how much
//! contiguous data was actually available, not how much was asked for.
//!
//! This module is backend-agnostic: it drives a [`ChildBacking`]
//! implementation (typically a thin adapter over `backend.rs` and
//! `entry.rs`) rather than opening child entries itself, so it can be
//! exercised without a full running cache.

use crate::format::{SparseData, NUM_SPARSE_BITS};
use crate::error::Result;

/// Bytes covered by one child entry (1 MiB): `offset >> CHILD_SHIFT` gives
/// the child index.
pub const CHILD_SHIFT: u32 = 20;
pub const CHILD_SIZE: u64 = 1 << CHILD_SHIFT;
/// Bytes covered by a single residency bit (1 KiB): `CHILD_SIZE / NUM_SPARSE_BITS`.
pub const SLOT_SIZE: u64 = CHILD_SIZE / NUM_SPARSE_BITS as u64;

pub fn child_index(offset: u64) -> u64 {
    offset >> CHILD_SHIFT
}

pub fn child_offset(offset: u64) -> u64 {
    offset & (CHILD_SIZE - 1)
}

/// `Range_<parent-key>:<signature in hex>:<child index in hex>`.
pub fn child_key(parent_key: &str, signature: u64, index: u64) -> String {
    format!("Range_{parent_key}:{signature:016x}:{index:x}")
}

/// What `SparseControl` needs from whatever owns the actual child entries.
/// An adapter over `backend.rs`/`entry.rs` implements this; `SparseControl`
/// itself never allocates or dooms entries.
pub trait ChildBacking {
    fn read_child(&mut self, key: &str, offset: u64, buf: &mut [u8]) -> Result<usize>;
    fn write_child(&mut self, key: &str, offset: u64, buf: &[u8]) -> Result<()>;
    fn child_bitmap(&mut self, key: &str, signature: u64, parent_key_len: u32) -> Result<SparseData>;
    fn save_child_bitmap(&mut self, key: &str, data: &SparseData) -> Result<()>;
}

pub struct SparseControl {
    signature: u64,
    parent_key: String,
}

impl SparseControl {
    pub fn new(parent_key: String, signature: u64) -> SparseControl {
        SparseControl { signature, parent_key }
    }

    pub fn signature(&self) -> u64 {
        self.signature
    }

    fn key_for(&self, index: u64) -> String {
        child_key(&self.parent_key, self.signature, index)
    }

    /// Reads into `buf` starting at `offset`, stopping at the first gap in
    /// what has actually been written. Returns the number of contiguous
    /// bytes read from the start of the request, which may be less than
    /// `buf.len()` (including zero, if `offset` itself falls in a gap).
    pub fn read(&self, backing: &mut dyn ChildBacking, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let mut total = 0usize;
        let mut cursor = offset;
        let end = offset + buf.len() as u64;

        while cursor < end {
            let index = child_index(cursor);
            let key = self.key_for(index);
            let bitmap = backing.child_bitmap(&key, self.signature, self.parent_key.len() as u32)?;
            let within = child_offset(cursor);
            let child_end = ((index + 1) * CHILD_SIZE).min(end);
            let run = self.resident_run(&bitmap, within, child_end - cursor);
            if run == 0 {
                break;
            }
            let chunk = &mut buf[total..total + run as usize];
            let read = backing.read_child(&key, within, chunk)?;
            total += read;
            cursor += read as u64;
            if (read as u64) < run {
                break;
            }
        }
        Ok(total)
    }

    /// Writes `buf` at `offset`, crossing child boundaries as needed, and
    /// marks every 1 KiB slot the write touches as resident.
    pub fn write(&self, backing: &mut dyn ChildBacking, offset: u64, buf: &[u8]) -> Result<usize> {
        let mut total = 0usize;
        let mut cursor = offset;
        let end = offset + buf.len() as u64;

        while cursor < end {
            let index = child_index(cursor);
            let key = self.key_for(index);
            let within = child_offset(cursor);
            let child_end = ((index + 1) * CHILD_SIZE).min(end);
            let len = (child_end - cursor) as usize;
            let chunk = &buf[total..total + len];
            backing.write_child(&key, within, chunk)?;

            let mut bitmap = backing.child_bitmap(&key, self.signature, self.parent_key.len() as u32)?;
            self.mark_resident(&mut bitmap, within, len as u64);
            backing.save_child_bitmap(&key, &bitmap)?;

            total += len;
            cursor += len as u64;
        }
        Ok(total)
    }

    /// Implements `GetAvailableRange`: finds the first resident byte at or
    /// after `offset` within a `len`-byte window, and how long the
    /// contiguous resident run starting there is. Returns `None` if nothing
    /// in the window is resident.
    pub fn get_available_range(&self, backing: &mut dyn ChildBacking, offset: u64, len: u64) -> Result<Option<(u64, u64)>> {
        let mut cursor = offset;
        let end = offset + len;

        while cursor < end {
            let index = child_index(cursor);
            let key = self.key_for(index);
            let bitmap = backing.child_bitmap(&key, self.signature, self.parent_key.len() as u32)?;
            let within = child_offset(cursor);
            let child_end = ((index + 1) * CHILD_SIZE).min(end);
            let window = child_end - cursor;

            if let Some((start_in_child, run)) = self.first_resident_run(&bitmap, within, window) {
                let start = cursor - within + start_in_child;
                return Ok(Some((start, run)));
            }
            cursor = child_end;
        }
        Ok(None)
    }

    fn resident_run(&self, bitmap: &SparseData, start: u64, len: u64) -> u64 {
        let mut run = 0u64;
        let mut pos = start;
        let window_end = start + len;
        while pos < window_end {
            let slot = (pos / SLOT_SIZE) as usize;
            if slot >= NUM_SPARSE_BITS || !bitmap.bit(slot) {
                break;
            }
            let slot_end = ((slot as u64) + 1) * SLOT_SIZE;
            let step = slot_end.min(window_end) - pos;
            run += step;
            pos += step;
        }
        run
    }

    fn first_resident_run(&self, bitmap: &SparseData, start: u64, len: u64) -> Option<(u64, u64)> {
        let window_end = start + len;
        let mut pos = start;
        while pos < window_end {
            let slot = (pos / SLOT_SIZE) as usize;
            if slot < NUM_SPARSE_BITS && bitmap.bit(slot) {
                let run = self.resident_run(bitmap, pos, window_end - pos);
                return Some((pos, run));
            }
            pos += SLOT_SIZE - pos % SLOT_SIZE;
        }
        None
    }

    fn mark_resident(&self, bitmap: &mut SparseData, start: u64, len: u64) {
        let mut pos = start;
        let window_end = start + len;
        while pos < window_end {
            let slot = (pos / SLOT_SIZE) as usize;
            if slot < NUM_SPARSE_BITS {
                bitmap.set_bit(slot, true);
            }
            pos += SLOT_SIZE - pos % SLOT_SIZE;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[derive(Default)]
    struct MemChildBacking {
        data: HashMap<String, Vec<u8>>,
        bitmaps: HashMap<String, SparseData>,
    }

    impl ChildBacking for MemChildBacking {
        fn read_child(&mut self, key: &str, offset: u64, buf: &mut [u8]) -> Result<usize> {
            let Some(bytes) = self.data.get(key) else { return Ok(0) };
            let offset = offset as usize;
            if offset >= bytes.len() {
                return Ok(0);
            }
            let n = buf.len().min(bytes.len() - offset);
            buf[..n].copy_from_slice(&bytes[offset..offset + n]);
            Ok(n)
        }

        fn write_child(&mut self, key: &str, offset: u64, buf: &[u8]) -> Result<()> {
            let entry = self.data.entry(key.to_string()).or_default();
            let end = offset as usize + buf.len();
            if entry.len() < end {
                entry.resize(end, 0);
            }
            entry[offset as usize..end].copy_from_slice(buf);
            Ok(())
        }

        fn child_bitmap(&mut self, key: &str, signature: u64, parent_key_len: u32) -> Result<SparseData> {
            Ok(self.bitmaps.entry(key.to_string()).or_insert_with(|| SparseData::new(signature, parent_key_len)).clone())
        }

        fn save_child_bitmap(&mut self, key: &str, data: &SparseData) -> Result<()> {
            self.bitmaps.insert(key.to_string(), data.clone());
            Ok(())
        }
    }

    #[test]
    fn write_then_read_within_one_child() {
        let mut backing = MemChildBacking::default();
        let sparse = SparseControl::new("https://example.com/video".to_string(), 0xabc);

        sparse.write(&mut backing, 100, b"hello").unwrap();
        let mut buf = [0u8; 5];
        let read = sparse.read(&mut backing, 100, &mut buf).unwrap();
        assert_eq!(read, 5);
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn read_stops_at_first_gap() {
        let mut backing = MemChildBacking::default();
        let sparse = SparseControl::new("k".to_string(), 1);

        sparse.write(&mut backing, 0, b"abcd").unwrap();
        // Gap between 4 and SLOT_SIZE, so a read spanning into unwritten
        // territory past the last written slot stops there.
        let mut buf = vec![0u8; (SLOT_SIZE * 2) as usize];
        let read = sparse.read(&mut backing, 0, &mut buf).unwrap();
        assert_eq!(read as u64, SLOT_SIZE);
    }

    #[test]
    fn write_spans_multiple_children() {
        let mut backing = MemChildBacking::default();
        let sparse = SparseControl::new("k".to_string(), 7);

        let payload = vec![9u8; (CHILD_SIZE + 10) as usize];
        let offset = CHILD_SIZE - 5;
        sparse.write(&mut backing, offset, &payload).unwrap();

        let mut buf = vec![0u8; payload.len()];
        let read = sparse.read(&mut backing, offset, &mut buf).unwrap();
        assert_eq!(read, payload.len());
        assert_eq!(buf, payload);
    }

    #[test]
    fn get_available_range_finds_first_resident_run() {
        let mut backing = MemChildBacking::default();
        let sparse = SparseControl::new("k".to_string(), 1);
        sparse.write(&mut backing, SLOT_SIZE * 3, b"data").unwrap();

        let (start, len) = sparse.get_available_range(&mut backing, 0, CHILD_SIZE).unwrap().unwrap();
        assert_eq!(start, SLOT_SIZE * 3);
        assert_eq!(len, SLOT_SIZE);
    }

    #[test]
    fn child_key_format_matches_range_prefix() {
        let key = child_key("example", 0xdead, 2);
        assert!(key.starts_with("Range_example:"));
        assert!(key.ends_with(":2"));
    }
}
