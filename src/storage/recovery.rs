//! # Recovery
//!
//! Verification of the block tree of a swap file, and reclamation of the slots a crash left
//! unreachable.
//!
//! The store never writes over a block of the committed tree and writes the header last, so after
//! a crash the header describes a tree that was complete when it was written. Blocks written after
//! that header are unreachable from it and get reclaimed here. The file can still be damaged from
//! outside, so the whole tree is checked before it is trusted: page kinds, entry counts against
//! child totals, a uniform leaf depth, and no block referenced twice or not at all.

use super::page::{BlockId, BlockKind, DataPage, PointerPage};
use super::paging::{BlockHandle, BlockStore};
use super::vfs;
use crate::error::{Error, Result};
use std::collections;
use tracing::{debug, info, warn};

/// Shape of a verified tree.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TreeReport {
  /// Number of levels; a lone data block has depth 1.
  pub depth: usize,
  pub data_blocks: usize,
  pub pointer_blocks: usize,
  pub lines: u64,
  /// File slots of every assigned block in the tree.
  pub slots: collections::BTreeSet<u64>,
}

impl TreeReport {
  pub fn blocks(&self) -> usize {
    self.data_blocks + self.pointer_blocks
  }
}

/// Fetches a block the tree refers to. A reference to a block that does not exist is corruption.
pub(crate) fn fetch_child<F: vfs::File>(store: &mut BlockStore<F>, id: BlockId) -> Result<BlockHandle> {
  store.fetch(id).map_err(|e| match e {
    Error::NotFound(id) => Error::Corrupt(format!("dangling reference to block {id}")),
    other => other,
  })
}

/// Walks the whole tree and checks its structure.
///
/// # Errors
///
/// [`Error::Corrupt`] describing the first violation found, or any error of
/// [`BlockStore::fetch`].
pub fn walk<F: vfs::File>(store: &mut BlockStore<F>) -> Result<TreeReport> {
  let mut report = TreeReport::default();
  let Some(root) = store.root() else {
    if store.line_count() != 0 {
      return Err(Error::Corrupt(format!("header records {} lines but no root", store.line_count())));
    }
    return Ok(report);
  };

  let mut seen = collections::HashSet::new();
  let mut leaf_depth = None;
  let mut stack = vec![(root, 1, None::<u64>)];
  while let Some((id, depth, expected)) = stack.pop() {
    if !seen.insert(id) {
      return Err(Error::Corrupt(format!("block {id} is referenced twice")));
    }
    if let BlockId::Assigned(slot) = id {
      report.slots.insert(slot);
    }
    let handle = fetch_child(store, id)?;
    let page = store.page(&handle);
    let (kind, lines, children) = match store.kind(&handle) {
      BlockKind::Data => (BlockKind::Data, DataPage::new(page).len() as u64, Vec::new()),
      BlockKind::Pointer => {
        let page = PointerPage::new(page);
        (BlockKind::Pointer, page.total(), page.entries())
      }
      BlockKind::Free => (BlockKind::Free, 0, Vec::new()),
    };
    store.release(handle, false);

    if let Some(expected) = expected {
      if lines != expected {
        return Err(Error::Corrupt(format!("block {id} holds {lines} lines, its parent records {expected}")));
      }
    }
    match kind {
      BlockKind::Data => {
        if lines == 0 {
          return Err(Error::Corrupt(format!("data block {id} is empty")));
        }
        if *leaf_depth.get_or_insert(depth) != depth {
          return Err(Error::Corrupt(format!("data block {id} is at depth {depth}, others at {leaf_depth:?}")));
        }
        report.data_blocks += 1;
        report.lines += lines;
      }
      BlockKind::Pointer => {
        if children.is_empty() {
          return Err(Error::Corrupt(format!("pointer block {id} has no entries")));
        }
        report.pointer_blocks += 1;
        for entry in children.iter().rev() {
          stack.push((entry.child, depth + 1, Some(entry.line_count)));
        }
      }
      BlockKind::Free => return Err(Error::Corrupt(format!("tree references free-list block {id}"))),
    }
  }
  report.depth = leaf_depth.unwrap_or(0);

  if report.lines != store.line_count() {
    return Err(Error::Corrupt(format!(
      "tree holds {} lines, header records {}",
      report.lines,
      store.line_count()
    )));
  }
  let free = store.free_slots();
  if let Some(slot) = free.iter().find(|&&slot| report.slots.contains(&slot)) {
    return Err(Error::Corrupt(format!("block {slot} is both in the tree and on the free list")));
  }
  debug!(depth = report.depth, blocks = report.blocks(), lines = report.lines, "verified block tree");
  Ok(report)
}

/// Checks a freshly opened store and, if its last session crashed, reclaims unreachable slots.
///
/// Verification runs when `verify` is set and always after a crash.
pub(crate) fn check_on_open<F: vfs::File>(store: &mut BlockStore<F>, verify: bool) -> Result<Option<TreeReport>> {
  if !verify && !store.recovered() {
    return Ok(None);
  }
  let report = walk(store)?;
  if store.recovered() {
    let free: collections::BTreeSet<u64> = store.free_slots().into_iter().collect();
    let orphans: Vec<u64> =
      (1..store.slot_count()).filter(|slot| !report.slots.contains(slot) && !free.contains(slot)).collect();
    if orphans.is_empty() {
      info!(lines = report.lines, "recovered swap file after an unclean shutdown");
    } else {
      warn!(count = orphans.len(), lines = report.lines, "recovered swap file; reclaiming orphaned blocks");
      store.reclaim(orphans);
    }
  }
  Ok(Some(report))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::Config;
  use crate::error::ErrorKind;
  use crate::storage::page::{DataPageMut, Entry, PointerPageMut};
  use crate::storage::vfs::{MemoryFile, MemoryFileSystem};

  fn config() -> Config {
    Config::default().with_page_size(256).with_cache_blocks(16)
  }

  fn leaf<F: vfs::File>(store: &mut BlockStore<F>, lines: &[&[u8]]) -> BlockId {
    let handle = store.allocate(BlockKind::Data).unwrap();
    DataPageMut::new(store.page_mut(&handle)).rebuild(lines);
    let id = store.id(&handle);
    store.release(handle, true);
    id
  }

  fn pointer<F: vfs::File>(store: &mut BlockStore<F>, entries: &[Entry]) -> BlockId {
    let handle = store.allocate(BlockKind::Pointer).unwrap();
    PointerPageMut::new(store.page_mut(&handle)).set_entries(entries);
    let id = store.id(&handle);
    store.release(handle, true);
    id
  }

  /// A two-level tree with three lines.
  fn small_tree<F: vfs::File>(store: &mut BlockStore<F>) {
    let a = leaf(store, &[b"a", b"b"]);
    let b = leaf(store, &[b"c"]);
    let root = pointer(store, &[Entry { line_count: 2, child: a }, Entry { line_count: 1, child: b }]);
    store.set_root(root);
    store.set_line_count(3);
  }

  #[test]
  fn test_walk_reports_shape() {
    let mut store = BlockStore::in_memory(&config()).unwrap();
    small_tree(&mut store);
    let report = walk(&mut store).unwrap();
    assert_eq!(report.depth, 2);
    assert_eq!(report.data_blocks, 2);
    assert_eq!(report.pointer_blocks, 1);
    assert_eq!(report.lines, 3);
    // Nothing has a file slot yet.
    assert!(report.slots.is_empty());
  }

  #[test]
  fn test_walk_rejects_count_mismatch() {
    let mut store = BlockStore::in_memory(&config()).unwrap();
    let a = leaf(&mut store, &[b"a", b"b"]);
    let root = pointer(&mut store, &[Entry { line_count: 3, child: a }]);
    store.set_root(root);
    store.set_line_count(3);
    assert_eq!(walk(&mut store).unwrap_err().kind(), ErrorKind::Corrupt);
  }

  #[test]
  fn test_walk_rejects_uneven_depth_and_sharing() {
    let mut store = BlockStore::in_memory(&config()).unwrap();
    let a = leaf(&mut store, &[b"a"]);
    let b = leaf(&mut store, &[b"b"]);
    let inner = pointer(&mut store, &[Entry { line_count: 1, child: b }]);
    let root = pointer(&mut store, &[Entry { line_count: 1, child: a }, Entry { line_count: 1, child: inner }]);
    store.set_root(root);
    store.set_line_count(2);
    assert_eq!(walk(&mut store).unwrap_err().kind(), ErrorKind::Corrupt);

    let shared = pointer(&mut store, &[Entry { line_count: 1, child: a }, Entry { line_count: 1, child: a }]);
    store.set_root(shared);
    assert_eq!(walk(&mut store).unwrap_err().kind(), ErrorKind::Corrupt);
  }

  #[test]
  fn test_walk_rejects_dangling_reference() {
    let mut store = BlockStore::in_memory(&config()).unwrap();
    let root = pointer(&mut store, &[Entry { line_count: 1, child: BlockId::Assigned(40) }]);
    store.set_root(root);
    store.set_line_count(1);
    assert_eq!(walk(&mut store).unwrap_err().kind(), ErrorKind::Corrupt);
  }

  #[test]
  fn test_crash_reclaims_orphans() {
    let mut fs = MemoryFileSystem::default();
    let mut store: BlockStore<MemoryFile> = BlockStore::open_path(&mut fs, "swap", &config()).unwrap();
    small_tree(&mut store);
    store.sync().unwrap();
    // Blocks written under a header that never got committed.
    leaf(&mut store, &[b"lost"]);
    leaf(&mut store, &[b"also lost"]);
    store.sync_block(BlockId::Pending(4)).unwrap();
    store.sync_block(BlockId::Assigned(5)).unwrap();
    let slots = store.slot_count();
    drop(store);

    let mut store: BlockStore<MemoryFile> = BlockStore::open_path(&mut fs, "swap", &config()).unwrap();
    assert!(store.recovered());
    assert_eq!(store.slot_count(), slots);
    let report = check_on_open(&mut store, false).unwrap().unwrap();
    assert_eq!(report.lines, 3);
    assert_eq!(store.free_slots(), vec![4, 5]);
  }

  #[test]
  fn test_clean_open_skips_verification_when_asked() {
    let mut fs = MemoryFileSystem::default();
    let mut store: BlockStore<MemoryFile> = BlockStore::open_path(&mut fs, "swap", &config()).unwrap();
    small_tree(&mut store);
    store.close().unwrap();

    let mut store: BlockStore<MemoryFile> = BlockStore::open_path(&mut fs, "swap", &config()).unwrap();
    assert_eq!(check_on_open(&mut store, false).unwrap(), None);
    assert_eq!(check_on_open(&mut store, true).unwrap().unwrap().slots.len(), 3);
  }
}
