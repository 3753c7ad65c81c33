//! The doubly-linked LRU rankings subsystem.
//!
//! `Rankings` mutates the five logical lists (`NO_USE`, `LOW_USE`,
//! `HIGH_USE`, `DELETED`, and a reserved slot) whose per-list head/tail/size
//! live in the index header's [`LruData`]. Every insert or remove first
//! records a transaction (the node's address and the operation) in the
//! rankings block-file's `user[]` header area, then performs the node
//! writes, then flushes the updated head/tail/size as one call. Per this
//! engine's durability contract (`file_io` docs), that final flush is a
//! single write no larger than one OS page, so it is atomic: a crash either
//! lands before it (the transaction log alone describes what to finish or
//! revert) or after it (the operation is already complete). `complete_transaction`
//! is run once, at backend open, to resolve whichever case actually happened.

use tracing::warn;

use crate::address::Addr;
use crate::block_files::BlockFiles;
use crate::format::{LruData, RankingsNode, NUM_RANKING_LISTS};
use crate::storage_block::StorageBlock;
use crate::error::{CacheError, Result};
use std::sync::Arc;

/// One of the five rankings lists. `Reserved` is currently unused by any
/// eviction policy but keeps `LruData`'s arrays symmetric with the original
/// five-slot layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RankingList {
    NoUse = 0,
    LowUse = 1,
    HighUse = 2,
    Deleted = 3,
    Reserved = 4,
}

impl RankingList {
    pub fn index(self) -> usize {
        self as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operation {
    Insert = 1,
    Remove = 2,
}

const USER_HEAD: usize = 0;
const USER_TAIL: usize = 1;
const USER_TRANSACTION: usize = 2;
const USER_OPERATION: usize = 3;

pub struct Rankings {
    block_files: Arc<BlockFiles>,
}

impl Rankings {
    pub fn new(block_files: Arc<BlockFiles>) -> Rankings {
        Rankings { block_files }
    }

    fn node_block(&self, addr: Addr) -> Result<StorageBlock<RankingsNode>> {
        let file = self.block_files.get_file(addr)?;
        Ok(StorageBlock::new(file, addr, crate::format::RANKINGS_NODE_SIZE))
    }

    fn write_transaction(&self, op: Operation, list: RankingList, lru: &LruData, node_addr: Addr) -> Result<()> {
        self.block_files.set_rankings_user(
            USER_HEAD,
            lru.heads[list.index()],
        )?;
        self.block_files.set_rankings_user(USER_TAIL, lru.tails[list.index()])?;
        self.block_files.set_rankings_user(USER_TRANSACTION, node_addr.raw())?;
        self.block_files.set_rankings_user(USER_OPERATION, (op as u32) | ((list.index() as u32) << 8))?;
        Ok(())
    }

    fn clear_transaction(&self) -> Result<()> {
        self.block_files.set_rankings_user(USER_TRANSACTION, 0)?;
        self.block_files.set_rankings_user(USER_OPERATION, 0)
    }

    /// Inserts `node_addr` at the head of `list`. `now` stamps `last_used`
    /// (and `last_modified` when `modified` is set).
    pub fn insert(
        &self,
        lru: &mut LruData,
        list: RankingList,
        node_addr: Addr,
        now: u64,
        modified: bool,
    ) -> Result<()> {
        self.write_transaction(Operation::Insert, list, lru, node_addr)?;

        let old_head = lru.heads[list.index()];
        if old_head != 0 {
            let mut head_block = self.node_block(Addr::from_raw(old_head))?;
            let node = head_block.load_mut()?;
            node.prev = node_addr.raw();
            head_block.store()?;
        }

        let mut block = self.node_block(node_addr)?;
        let node = block.load_mut()?;
        node.last_used = now;
        if modified {
            node.last_modified = now;
        }
        if old_head == 0 {
            node.next = node_addr.raw();
            node.prev = node_addr.raw();
        } else {
            node.next = old_head;
            node.prev = 0;
        }
        block.store()?;

        if old_head == 0 {
            lru.tails[list.index()] = node_addr.raw();
        }
        lru.heads[list.index()] = node_addr.raw();
        lru.sizes[list.index()] += 1;

        self.clear_transaction()?;
        Ok(())
    }

    /// Unlinks `node_addr` from `list`. Does not free its storage; the
    /// caller (`EntryImpl`/`Eviction`) decides what happens to the node.
    pub fn remove(&self, lru: &mut LruData, list: RankingList, node_addr: Addr) -> Result<()> {
        self.write_transaction(Operation::Remove, list, lru, node_addr)?;
        self.unlink(lru, list, node_addr)?;
        lru.sizes[list.index()] = lru.sizes[list.index()].saturating_sub(1);
        self.clear_transaction()?;
        Ok(())
    }

    fn unlink(&self, lru: &mut LruData, list: RankingList, node_addr: Addr) -> Result<()> {
        let (prev, next) = {
            let mut block = self.node_block(node_addr)?;
            let node = block.load()?;
            (node.prev, node.next)
        };

        if prev == node_addr.raw() {
            // Self-referential: was the only element.
            lru.heads[list.index()] = 0;
            lru.tails[list.index()] = 0;
        } else {
            if lru.heads[list.index()] == node_addr.raw() {
                lru.heads[list.index()] = next;
                if next != 0 {
                    let mut next_block = self.node_block(Addr::from_raw(next))?;
                    next_block.load_mut()?.prev = 0;
                    next_block.store()?;
                }
            } else if prev != 0 {
                let mut prev_block = self.node_block(Addr::from_raw(prev))?;
                prev_block.load_mut()?.next = next;
                prev_block.store()?;
            }

            if lru.tails[list.index()] == node_addr.raw() {
                lru.tails[list.index()] = prev;
                if prev != 0 {
                    let mut prev_block = self.node_block(Addr::from_raw(prev))?;
                    prev_block.load_mut()?.next = 0;
                    prev_block.store()?;
                }
            } else if next != 0 {
                let mut next_block = self.node_block(Addr::from_raw(next))?;
                next_block.load_mut()?.prev = prev;
                next_block.store()?;
            }
        }

        let mut block = self.node_block(node_addr)?;
        let node = block.load_mut()?;
        node.prev = 0;
        node.next = 0;
        block.store()?;
        Ok(())
    }

    /// Equivalent to `remove` followed by `insert` on the same list.
    pub fn update_rank(&self, lru: &mut LruData, list: RankingList, node_addr: Addr, modified: bool, now: u64) -> Result<()> {
        self.remove(lru, list, node_addr)?;
        self.insert(lru, list, node_addr, now, modified)
    }

    /// Returns the node following `node_addr` in `list`, or `None` at the
    /// tail.
    pub fn get_next(&self, node_addr: Addr) -> Result<Option<Addr>> {
        let mut block = self.node_block(node_addr)?;
        let next = block.load()?.next;
        Ok(if next == 0 || next == node_addr.raw() { None } else { Some(Addr::from_raw(next)) })
    }

    pub fn get_prev(&self, node_addr: Addr) -> Result<Option<Addr>> {
        let mut block = self.node_block(node_addr)?;
        let prev = block.load()?.prev;
        Ok(if prev == 0 || prev == node_addr.raw() { None } else { Some(Addr::from_raw(prev)) })
    }

    /// The last node in `list` (its tail), if any.
    pub fn tail(&self, lru: &LruData, list: RankingList) -> Option<Addr> {
        let tail = lru.tails[list.index()];
        if tail == 0 { None } else { Some(Addr::from_raw(tail)) }
    }

    pub fn last_used(&self, node_addr: Addr) -> Result<u64> {
        let mut block = self.node_block(node_addr)?;
        Ok(block.load()?.last_used)
    }

    pub fn is_in_use(&self, node_addr: Addr) -> Result<bool> {
        let mut block = self.node_block(node_addr)?;
        Ok(block.load()?.is_open())
    }

    pub fn contents(&self, node_addr: Addr) -> Result<Addr> {
        let mut block = self.node_block(node_addr)?;
        Ok(Addr::from_raw(block.load()?.contents))
    }

    /// Rejects structurally-invalid nodes: zero contents, zero timestamps
    /// while claimed to be list-resident, or a mismatch between being the
    /// head/tail and a non-self-referential `prev`/`next`.
    pub fn sanity_check(&self, lru: &LruData, list: RankingList, node_addr: Addr) -> Result<()> {
        let mut block = self.node_block(node_addr)?;
        let node = block.load()?;
        if node.contents == 0 {
            return Err(CacheError::Corruption("rankings node has no contents back-pointer".into()));
        }
        if node.last_used == 0 {
            return Err(CacheError::Corruption("rankings node has zero last_used while list-resident".into()));
        }
        let is_head = lru.heads[list.index()] == node_addr.raw();
        let is_tail = lru.tails[list.index()] == node_addr.raw();
        let is_only = is_head && is_tail;
        if is_only {
            if node.prev != node_addr.raw() || node.next != node_addr.raw() {
                return Err(CacheError::Corruption("single-element list node is not self-referential".into()));
            }
        } else {
            if is_head && node.prev != 0 {
                return Err(CacheError::Corruption("head node has a predecessor".into()));
            }
            if is_tail && node.next != 0 {
                return Err(CacheError::Corruption("tail node has a successor".into()));
            }
            if (node.prev == 0) != is_head {
                return Err(CacheError::Corruption("prev-zero node is not the head".into()));
            }
            if (node.next == 0) != is_tail {
                return Err(CacheError::Corruption("next-zero node is not the tail".into()));
            }
        }
        Ok(())
    }

    /// Resolves any in-flight transaction left by a prior run. Called once
    /// during backend `Init`, before any other rankings operation.
    pub fn complete_transaction(&self, lru: &mut LruData) -> Result<()> {
        let transaction = self.block_files.get_rankings_user(USER_TRANSACTION)?;
        if transaction == 0 {
            return Ok(());
        }
        let op_raw = self.block_files.get_rankings_user(USER_OPERATION)?;
        let saved_head = self.block_files.get_rankings_user(USER_HEAD)?;
        let saved_tail = self.block_files.get_rankings_user(USER_TAIL)?;
        let op = op_raw & 0xff;
        let list_index = (op_raw >> 8) as usize;
        if list_index >= NUM_RANKING_LISTS {
            warn!("rankings transaction references an out-of-range list; clearing it");
            return self.clear_transaction();
        }
        let list = match list_index {
            0 => RankingList::NoUse,
            1 => RankingList::LowUse,
            2 => RankingList::HighUse,
            3 => RankingList::Deleted,
            _ => RankingList::Reserved,
        };
        let node_addr = Addr::from_raw(transaction);

        if op == Operation::Insert as u32 {
            if lru.heads[list.index()] == node_addr.raw() {
                // The header flush (step 4) completed; nothing to finish.
            } else {
                let contents = {
                    let mut block = self.node_block(node_addr)?;
                    block.load()?.contents
                };
                if contents == 0 {
                    warn!(addr = node_addr.raw(), "reverting incomplete rankings insert");
                    lru.heads[list.index()] = saved_head;
                    lru.tails[list.index()] = saved_tail;
                } else {
                    warn!(addr = node_addr.raw(), "finishing incomplete rankings insert");
                    self.finish_insert(lru, list, node_addr, saved_head)?;
                }
            }
        } else if op == Operation::Remove as u32 {
            warn!(addr = node_addr.raw(), "re-applying possibly incomplete rankings removal");
            if lru.heads[list.index()] == node_addr.raw() || lru.tails[list.index()] == node_addr.raw() {
                let _ = self.unlink(lru, list, node_addr);
            }
        }

        self.clear_transaction()
    }

    fn finish_insert(&self, lru: &mut LruData, list: RankingList, node_addr: Addr, saved_head: u32) -> Result<()> {
        if saved_head != 0 && saved_head != node_addr.raw() {
            let mut head_block = self.node_block(Addr::from_raw(saved_head))?;
            head_block.load_mut()?.prev = node_addr.raw();
            head_block.store()?;
        }
        if saved_head == 0 {
            lru.tails[list.index()] = node_addr.raw();
        }
        lru.heads[list.index()] = node_addr.raw();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::FileType;
    use tempfile::tempdir;

    fn new_node_addr(block_files: &BlockFiles, contents: u32) -> Addr {
        let addr = block_files.create_block(FileType::Rankings, 1, None).unwrap();
        let file = block_files.get_file(addr).unwrap();
        let mut block: StorageBlock<RankingsNode> = StorageBlock::new(file, addr, crate::format::RANKINGS_NODE_SIZE);
        block.set_data(RankingsNode { contents, ..Default::default() });
        block.store().unwrap();
        addr
    }

    #[test]
    fn insert_single_node_is_self_referential() {
        let dir = tempdir().unwrap();
        let block_files = Arc::new(BlockFiles::init(dir.path(), true).unwrap());
        let rankings = Rankings::new(block_files.clone());
        let mut lru = LruData::default();
        let addr = new_node_addr(&block_files, 1);

        rankings.insert(&mut lru, RankingList::NoUse, addr, 100, true).unwrap();
        assert_eq!(lru.heads[0], addr.raw());
        assert_eq!(lru.tails[0], addr.raw());
        rankings.sanity_check(&lru, RankingList::NoUse, addr).unwrap();
    }

    #[test]
    fn insert_two_nodes_links_them_and_remove_restores_single() {
        let dir = tempdir().unwrap();
        let block_files = Arc::new(BlockFiles::init(dir.path(), true).unwrap());
        let rankings = Rankings::new(block_files.clone());
        let mut lru = LruData::default();
        let a = new_node_addr(&block_files, 1);
        let b = new_node_addr(&block_files, 2);

        rankings.insert(&mut lru, RankingList::NoUse, a, 1, true).unwrap();
        rankings.insert(&mut lru, RankingList::NoUse, b, 2, true).unwrap();
        assert_eq!(lru.heads[0], b.raw());
        assert_eq!(lru.tails[0], a.raw());
        assert_eq!(rankings.get_next(b).unwrap(), Some(a));
        assert_eq!(rankings.get_prev(a).unwrap(), Some(b));

        rankings.remove(&mut lru, RankingList::NoUse, b).unwrap();
        assert_eq!(lru.heads[0], a.raw());
        assert_eq!(lru.tails[0], a.raw());
        rankings.sanity_check(&lru, RankingList::NoUse, a).unwrap();
    }

    #[test]
    fn walk_from_head_and_tail_reach_every_node() {
        let dir = tempdir().unwrap();
        let block_files = Arc::new(BlockFiles::init(dir.path(), true).unwrap());
        let rankings = Rankings::new(block_files.clone());
        let mut lru = LruData::default();
        let addrs: Vec<Addr> = (0..5).map(|i| new_node_addr(&block_files, i + 1)).collect();
        for (i, addr) in addrs.iter().enumerate() {
            rankings.insert(&mut lru, RankingList::NoUse, *addr, i as u64 + 1, true).unwrap();
        }

        let mut forward = vec![Addr::from_raw(lru.heads[0])];
        while let Some(next) = rankings.get_next(*forward.last().unwrap()).unwrap() {
            forward.push(next);
        }
        assert_eq!(forward.len(), addrs.len());
    }
}
