//! Per-size histograms and event counters, persisted inside the cache.
//!
//! A plain `Serialize`/`Deserialize` metrics struct guarded by a lock, but stores the
//! result as a single opaque data stream on a dedicated entry rather than as
//! a side JSON file, so a stats record survives exactly as long as the cache
//! that wrote it and participates in the same crash-recovery story as every
//! other block. `IndexHeader::stats_addr` names that entry's rankings node.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::error::{CacheError, Result};

/// Negative error codes recorded for post-mortem analysis, matching the
/// taxonomy the engine's corruption/critical-error paths raise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(i32)]
pub enum ErrorCode {
    InitFailed = -1,
    InvalidTail = -2,
    InvalidHead = -3,
    InvalidPrev = -4,
    InvalidNext = -5,
    InvalidLinks = -6,
    InvalidEntry = -7,
    InvalidAddress = -8,
    InvalidMask = -9,
    NumEntriesMismatch = -10,
    ReadFailure = -11,
    StorageError = -12,
    PreviousCrash = -13,
}

/// Size bands for the entry-count histogram, chosen so every block-file
/// class and the external-file escalation threshold land on a bucket
/// boundary.
const SIZE_BUCKETS: [u32; 8] = [256, 1024, 4096, 8192, 16384, 65536, 262144, u32::MAX];

/// Counters and histograms the backend updates on every relevant operation.
/// `#[serde]` derives let this round-trip through the same stream-encoding
/// path as any other entry payload.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub open_hits: u64,
    pub open_misses: u64,
    pub creates: u64,
    pub creates_hit: u64,
    pub dooms: u64,
    pub doom_all: u64,
    pub evictions: u64,
    pub size_histogram: [u64; SIZE_BUCKETS.len()],
    pub errors: Vec<(i32, u64)>,
}

/// Live, lock-free counters; `snapshot`/`load_snapshot` convert to and from
/// the persisted [`StatsSnapshot`] form.
#[derive(Debug, Default)]
pub struct Stats {
    open_hits: AtomicU64,
    open_misses: AtomicU64,
    creates: AtomicU64,
    creates_hit: AtomicU64,
    dooms: AtomicU64,
    doom_all: AtomicU64,
    evictions: AtomicU64,
    size_histogram: [AtomicU64; SIZE_BUCKETS.len()],
    errors: [AtomicI64; 13],
}

fn bucket_for(size: u32) -> usize {
    SIZE_BUCKETS.iter().position(|&b| size <= b).unwrap_or(SIZE_BUCKETS.len() - 1)
}

fn error_slot(code: ErrorCode) -> usize {
    (-(code as i32) - 1) as usize
}

impl Stats {
    pub fn new() -> Stats {
        Stats::default()
    }

    pub fn on_open_hit(&self) {
        self.open_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn on_open_miss(&self) {
        self.open_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn on_create(&self, reused_doomed_slot: bool) {
        self.creates.fetch_add(1, Ordering::Relaxed);
        if reused_doomed_slot {
            self.creates_hit.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn on_doom(&self) {
        self.dooms.fetch_add(1, Ordering::Relaxed);
    }

    pub fn on_doom_all(&self) {
        self.doom_all.fetch_add(1, Ordering::Relaxed);
    }

    pub fn on_eviction(&self, count: u32) {
        self.evictions.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn on_entry_size(&self, size: u32) {
        self.size_histogram[bucket_for(size)].fetch_add(1, Ordering::Relaxed);
    }

    pub fn on_error(&self, code: ErrorCode) {
        self.errors[error_slot(code)].fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let mut size_histogram = [0u64; SIZE_BUCKETS.len()];
        for (i, bucket) in size_histogram.iter_mut().enumerate() {
            *bucket = self.size_histogram[i].load(Ordering::Relaxed);
        }
        let errors = self
            .errors
            .iter()
            .enumerate()
            .map(|(i, count)| (-(i as i32) - 1, count.load(Ordering::Relaxed) as u64))
            .filter(|(_, count)| *count > 0)
            .collect();
        StatsSnapshot {
            open_hits: self.open_hits.load(Ordering::Relaxed),
            open_misses: self.open_misses.load(Ordering::Relaxed),
            creates: self.creates.load(Ordering::Relaxed),
            creates_hit: self.creates_hit.load(Ordering::Relaxed),
            dooms: self.dooms.load(Ordering::Relaxed),
            doom_all: self.doom_all.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            size_histogram,
            errors,
        }
    }

    /// Restores counters from a snapshot loaded off disk at `Init`.
    pub fn restore(&self, snapshot: &StatsSnapshot) {
        self.open_hits.store(snapshot.open_hits, Ordering::Relaxed);
        self.open_misses.store(snapshot.open_misses, Ordering::Relaxed);
        self.creates.store(snapshot.creates, Ordering::Relaxed);
        self.creates_hit.store(snapshot.creates_hit, Ordering::Relaxed);
        self.dooms.store(snapshot.dooms, Ordering::Relaxed);
        self.doom_all.store(snapshot.doom_all, Ordering::Relaxed);
        self.evictions.store(snapshot.evictions, Ordering::Relaxed);
        for (i, &value) in snapshot.size_histogram.iter().enumerate() {
            if let Some(bucket) = self.size_histogram.get(i) {
                bucket.store(value, Ordering::Relaxed);
            }
        }
    }

    /// Flattens into the `(name, value)` pairs `Backend::get_stats` returns.
    pub fn as_pairs(&self) -> Vec<(String, i64)> {
        let snapshot = self.snapshot();
        let mut pairs = vec![
            ("Entries".to_string(), 0),
            ("OpenHits".to_string(), snapshot.open_hits as i64),
            ("OpenMisses".to_string(), snapshot.open_misses as i64),
            ("Creates".to_string(), snapshot.creates as i64),
            ("CreatesHit".to_string(), snapshot.creates_hit as i64),
            ("Dooms".to_string(), snapshot.dooms as i64),
            ("DoomAll".to_string(), snapshot.doom_all as i64),
            ("Evictions".to_string(), snapshot.evictions as i64),
        ];
        for (i, count) in snapshot.size_histogram.iter().enumerate() {
            pairs.push((format!("SizeBucket{}", SIZE_BUCKETS[i]), *count as i64));
        }
        for (code, count) in snapshot.errors {
            pairs.push((format!("Error{code}"), count as i64));
        }
        pairs
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(&self.snapshot()).map_err(CacheError::from)
    }

    pub fn decode(bytes: &[u8]) -> Result<StatsSnapshot> {
        if bytes.is_empty() {
            return Ok(StatsSnapshot::default());
        }
        serde_json::from_slice(bytes).map_err(CacheError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_start_at_zero() {
        let stats = Stats::new();
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.open_hits, 0);
        assert_eq!(snapshot.creates, 0);
    }

    #[test]
    fn hits_and_misses_accumulate_independently() {
        let stats = Stats::new();
        stats.on_open_hit();
        stats.on_open_hit();
        stats.on_open_miss();
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.open_hits, 2);
        assert_eq!(snapshot.open_misses, 1);
    }

    #[test]
    fn size_histogram_buckets_by_band() {
        let stats = Stats::new();
        stats.on_entry_size(100);
        stats.on_entry_size(5000);
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.size_histogram[0], 1);
        assert_eq!(snapshot.size_histogram[3], 1);
    }

    #[test]
    fn snapshot_round_trips_through_encode_decode() {
        let stats = Stats::new();
        stats.on_open_hit();
        stats.on_doom();
        stats.on_error(ErrorCode::InvalidHead);
        let encoded = stats.encode().unwrap();
        let decoded = Stats::decode(&encoded).unwrap();
        assert_eq!(decoded.open_hits, 1);
        assert_eq!(decoded.dooms, 1);

        let restored = Stats::new();
        restored.restore(&decoded);
        assert_eq!(restored.snapshot().open_hits, 1);
    }

    #[test]
    fn error_codes_are_tracked_by_slot() {
        let stats = Stats::new();
        stats.on_error(ErrorCode::PreviousCrash);
        stats.on_error(ErrorCode::PreviousCrash);
        let pairs = stats.as_pairs();
        assert!(pairs.iter().any(|(name, value)| name == "Error-13" && *value == 2));
    }
}
