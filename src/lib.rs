//! A crash-consistent, on-disk, keyed blob cache.
//!
//! `disk_cache` stores arbitrary byte blobs under byte-string keys in a
//! bounded-size directory of block files, the way a browser's HTTP cache
//! does: every entry holds up to four independently sized data streams (by
//! convention, headers/metadata in stream 0 and body bytes in stream 1),
//! plus optional sparse (random-access, gap-tolerant) storage for range
//! requests. The cache is sized, not durable-by-fsync-on-every-write:
//! writes land in memory-mapped block files and external files, and a
//! generation counter plus per-node dirty bits let [`backend::Backend::create_backend`]
//! detect and discard whatever was left open mid-write by a process that
//! never got to close cleanly.
//!
//! # Layout
//!
//! - [`address`], the packed 32-bit [`address::Addr`] every other module
//!   uses to name a location in the cache.
//! - [`file_io`], positional file I/O and the single memory-mapped `index`
//!   file view.
//! - [`format`], every on-disk record's exact byte layout.
//! - [`storage_block`], buffered, lazy-load-then-flush typed views over a
//!   block-file record.
//! - [`block_files`], the block-file allocator (`data_0`..`data_3` plus
//!   overflow chains).
//! - [`hash`], the hash function used for index bucket selection.
//! - [`rankings`], the five-list doubly-linked LRU subsystem.
//! - [`eviction`], size-triggered trimming, pure-LRU or reuse-aware.
//! - [`entry`], a single cache entry's streams, key, and lifecycle.
//! - [`sparse`], range-addressable child entries for partial-content
//!   reads and writes.
//! - [`stats`], persisted counters and size histograms.
//! - [`backend`], [`Backend`] and [`Entry`], the public handles that tie
//!   every other module together.
//!
//! # Example
//!
//! ```no_run
//! use disk_cache::Backend;
//!
//! let backend = Backend::create_backend("/tmp/my-cache", true, None)?;
//! let entry = backend.create_entry(b"https://example.com/")?;
//! entry.write_data(0, 0, b"some headers", false)?;
//! entry.write_data(1, 0, b"some body bytes", false)?;
//! # Ok::<(), disk_cache::CacheError>(())
//! ```

pub mod address;
pub mod backend;
pub mod block_files;
pub mod config;
pub mod entry;
pub mod error;
pub mod eviction;
pub mod file_io;
pub mod format;
pub mod hash;
pub mod memory;
pub mod rankings;
pub mod sparse;
pub mod stats;
pub mod storage_block;

pub use backend::{Backend, CacheEntry, CacheStore, Entry, DEFAULT_MAX_SIZE};
pub use config::{CacheConfig, EvictionPolicyKind};
pub use error::{CacheError, Result};
pub use eviction::EvictionPolicy;
pub use memory::{MemoryBackend, MemoryEntry};

/// Opens a cache per `config.memory_only`: a [`Backend`] rooted at
/// `config.data_dir`, or a [`MemoryBackend`] sized from `config.max_size`.
/// Mirrors the original `CreateBackend`'s dispatch between the disk and
/// memory-only cache variants.
pub fn open_cache(config: &CacheConfig) -> Result<Box<dyn CacheStore>> {
    if config.memory_only {
        Ok(Box::new(MemoryBackend::new(Some(config.max_size))))
    } else {
        let backend = Backend::create_backend(&config.data_dir, config.force_reset, Some(config.max_size))?;
        Ok(Box::new(backend))
    }
}
