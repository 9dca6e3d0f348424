//! # Line index
//!
//! A line-numbered tree over the block store. Data blocks hold runs of whole lines; pointer blocks
//! hold `(line count, child)` entries, where the count is the number of lines in the child's
//! subtree. Finding line `n` walks down from the root, skipping whole children by their counts.
//!
//! The index never keeps a block borrowed across calls: it fetches blocks by id on every operation
//! and gives them back before returning, so the store is free to evict and write back whatever is
//! not in use.

use super::page::{self, BlockId, BlockKind, DataPage, DataPageMut, Entry, PointerPage, PointerPageMut};
use super::paging::{BlockHandle, BlockStore, PinnedSlice, StoreStats, SyncStats};
use super::recovery::{self, TreeReport};
use super::vfs;
use crate::config::Config;
use crate::error::{Error, Result, ResultExt};
use std::ops;
use tracing::{debug, error, info, trace, warn};

/// A pinned pointer block on the way down, and the entry the descent followed.
struct Level {
  handle: BlockHandle,
  slot: usize,
}

/// The result of a descent: every block from the root down to a data block, all pinned.
struct Path {
  levels: Vec<Level>,
  leaf: BlockHandle,
  offset: usize,
}

fn total(entries: &[Entry]) -> u64 {
  entries.iter().map(|entry| entry.line_count).sum()
}

/// Splits an overflowing run of lines into chunks that each fit in a data page.
///
/// Prefers the two-way cut that best balances both halves. When no two-way cut fits, which takes
/// a large line between two large neighbours, falls back to filling pages greedily; since every
/// line fits alone and the run is at most two pages' worth, that never takes more than three.
fn pack(lines: &[Vec<u8>], capacity: usize) -> Vec<ops::Range<usize>> {
  let costs: Vec<usize> = lines.iter().map(|line| page::line_cost(line.len())).collect();
  let sum: usize = costs.iter().sum();

  let mut best: Option<(usize, usize)> = None;
  let mut left = 0;
  for cut in 1..lines.len() {
    left += costs[cut - 1];
    let right = sum - left;
    if left <= capacity && right <= capacity {
      let imbalance = left.abs_diff(right);
      if best.map_or(true, |(smallest, _)| imbalance < smallest) {
        best = Some((imbalance, cut));
      }
    }
  }
  if let Some((_, cut)) = best {
    return vec![0..cut, cut..lines.len()];
  }

  let mut chunks = Vec::new();
  let mut start = 0;
  let mut used = 0;
  for (i, &cost) in costs.iter().enumerate() {
    if used + cost > capacity && i > start {
      chunks.push(start..i);
      start = i;
      used = 0;
    }
    used += cost;
  }
  chunks.push(start..lines.len());
  chunks
}

/// # Line index
///
/// Lines are numbered from 1. A document always has at least one line: a fresh document is a
/// single empty line, and deleting the last remaining line leaves a single empty line.
///
/// ## Implementation notes
///
/// Invariants maintained by all methods:
///
/// - All data blocks are at the same depth, and none is empty.
///
/// - Every pointer entry records exactly the number of lines in its child's subtree, and the
///   header records the number of lines in the whole tree.
///
/// - The root is never a pointer block with a single entry.
///
/// Mutations pin the whole root-to-leaf path, then allocate every block a split will need before
/// changing anything, so an allocation failure leaves the tree as it was.
///
/// Deleting can leave a data block under-full. One whose text and slots fill less than
/// `min_leaf_fill_percent` of the page is merged into an adjacent sibling when both fit in one
/// page. A pointer block left with fewer than a quarter of `max_fanout` entries is merged with a
/// sibling, or shares entries evenly with it when the two do not fit in one block.
#[derive(Debug)]
pub struct LineIndex<F: vfs::File = vfs::StandardFile> {
  store: BlockStore<F>,
  max_fanout: usize,
  min_fanout: usize,
  min_leaf_used: usize,
  max_line_len: usize,
}

impl LineIndex<vfs::StandardFile> {
  /// Opens an empty document with no backing file.
  ///
  /// # Errors
  ///
  /// Only [`Error::Config`] for an invalid configuration.
  pub fn in_memory(config: &Config) -> Result<Self> {
    Self::open(BlockStore::in_memory(config)?, config)
  }
}

impl<F: vfs::File> LineIndex<F> {
  /// Opens the document held by `store`, or starts an empty one if the store holds none.
  ///
  /// The tree of an existing file is verified when `verify_on_open` is set, and always when the
  /// file was not closed cleanly; see [`LineIndex::recovered`].
  ///
  /// # Errors
  ///
  /// [`Error::Corrupt`] if the tree fails verification.
  pub fn open(mut store: BlockStore<F>, config: &Config) -> Result<Self> {
    config.validate()?;
    let page_size = store.page_size();
    let max_fanout = config.max_fanout.unwrap_or(usize::MAX).min(page::pointer_capacity(page_size));
    let min_leaf_used = page::data_capacity(page_size) * usize::from(config.min_leaf_fill_percent) / 100;
    recovery::check_on_open(&mut store, config.verify_on_open).context("open")?;

    let mut index = LineIndex {
      store,
      max_fanout,
      min_fanout: (max_fanout / 4).max(2),
      min_leaf_used,
      max_line_len: page::max_line_len(page_size),
    };
    if index.store.root().is_none() {
      let handle = index.store.allocate(BlockKind::Data).context("open")?;
      DataPageMut::new(index.store.page_mut(&handle)).push(b"");
      let root = index.store.id(&handle);
      index.store.release(handle, true);
      index.store.set_root(root);
      index.store.set_line_count(1);
    }
    info!(
      lines = index.line_count(),
      persistent = index.store.is_persistent(),
      recovered = index.store.recovered(),
      "opened line index"
    );
    Ok(index)
  }

  /// Number of lines in the document. Never zero.
  pub fn line_count(&self) -> u64 {
    self.store.line_count()
  }

  /// Whether the backing file was not closed cleanly by its last session, so edits made after its
  /// last sync may be missing.
  pub fn recovered(&self) -> bool {
    self.store.recovered()
  }

  pub fn is_persistent(&self) -> bool {
    self.store.is_persistent()
  }

  /// Longest line, in bytes, that the document can hold.
  pub fn max_line_len(&self) -> usize {
    self.max_line_len
  }

  pub fn store(&self) -> &BlockStore<F> {
    &self.store
  }

  pub fn stats(&self) -> StoreStats {
    self.store.stats()
  }

  /// Returns line `n`. The line stays pinned in memory until the returned slice is dropped.
  ///
  /// # Errors
  ///
  /// [`Error::OutOfRange`] unless `1 <= n <= line_count()`.
  pub fn get_line(&mut self, n: u64) -> Result<PinnedSlice<'_>> {
    self.check_line(n)?;
    let Path { levels, leaf, offset } = self.descend(n - 1, false).context("get_line")?;
    self.release_levels(levels);
    let range = DataPage::new(self.store.page(&leaf)).range(offset);
    Ok(self.store.view(leaf, range))
  }

  /// Inserts `bytes` as a new line after line `after_n`; `0` inserts at the top.
  ///
  /// # Errors
  ///
  /// [`Error::OutOfRange`] unless `after_n <= line_count()`, [`Error::TooLarge`] for a line longer
  /// than [`LineIndex::max_line_len`], and block store errors, in which case nothing changed.
  pub fn insert_line(&mut self, after_n: u64, bytes: &[u8]) -> Result<()> {
    self.check_position(after_n)?;
    self.check_len(bytes.len())?;
    self.insert_at(after_n, bytes).context("insert_line")
  }

  /// Deletes line `n`.
  ///
  /// # Errors
  ///
  /// [`Error::OutOfRange`] unless `1 <= n <= line_count()`.
  pub fn delete_line(&mut self, n: u64) -> Result<()> {
    self.check_line(n)?;
    self.delete_at(n - 1).context("delete_line")
  }

  /// Replaces the content of line `n`.
  ///
  /// # Errors
  ///
  /// As [`LineIndex::insert_line`].
  pub fn replace_line(&mut self, n: u64, bytes: &[u8]) -> Result<()> {
    self.check_line(n)?;
    self.check_len(bytes.len())?;
    self.replace_at(n - 1, bytes).context("replace_line")
  }

  /// Inserts `lines` after line `after_n`, in order.
  ///
  /// All arguments are checked before anything changes. If the block store fails part-way, the
  /// lines already inserted are taken out again before the error is returned.
  ///
  /// # Errors
  ///
  /// As [`LineIndex::insert_line`].
  pub fn append_lines<L: AsRef<[u8]>>(&mut self, after_n: u64, lines: &[L]) -> Result<()> {
    self.check_position(after_n)?;
    for line in lines {
      self.check_len(line.as_ref().len())?;
    }
    for (i, line) in lines.iter().enumerate() {
      if let Err(e) = self.insert_at(after_n + i as u64, line.as_ref()) {
        self.undo_inserts(after_n, i);
        return Err(e).context("append_lines");
      }
    }
    trace!(after_n, count = lines.len(), "appended lines");
    Ok(())
  }

  /// Deletes lines `from_n` through `to_n`, inclusive.
  ///
  /// The lines are read before anything changes. If the block store fails part-way, the lines
  /// already deleted are put back before the error is returned.
  ///
  /// # Errors
  ///
  /// [`Error::OutOfRange`] unless `1 <= from_n <= to_n <= line_count()`, and block store errors.
  pub fn delete_range(&mut self, from_n: u64, to_n: u64) -> Result<()> {
    let count = self.line_count();
    if from_n == 0 || from_n > count {
      return Err(Error::OutOfRange { line: from_n, count });
    }
    if to_n < from_n || to_n > count {
      return Err(Error::OutOfRange { line: to_n, count });
    }
    let mut removed = Vec::with_capacity(usize::try_from(to_n - from_n + 1).unwrap_or(0));
    for n in from_n..=to_n {
      removed.push(self.get_line(n).context("delete_range")?.to_vec());
    }
    for done in 0..removed.len() {
      if let Err(e) = self.delete_at(from_n - 1) {
        self.undo_deletes(from_n - 1, &removed[..done]);
        return Err(e).context("delete_range");
      }
    }
    trace!(from_n, to_n, "deleted lines");
    Ok(())
  }

  /// Copies out every line of the document.
  ///
  /// # Errors
  ///
  /// Block store errors, with dangling references reported as [`Error::Corrupt`].
  pub fn lines(&mut self) -> Result<Vec<Vec<u8>>> {
    let mut lines = Vec::with_capacity(usize::try_from(self.line_count()).unwrap_or(0));
    let mut stack = vec![self.root()?];
    while let Some(id) = stack.pop() {
      let handle = recovery::fetch_child(&mut self.store, id).context("lines")?;
      let page = self.store.page(&handle);
      let kind = self.store.kind(&handle);
      match kind {
        BlockKind::Data => lines.extend(DataPage::new(page).lines().map(<[u8]>::to_vec)),
        BlockKind::Pointer => stack.extend(PointerPage::new(page).entries().iter().rev().map(|entry| entry.child)),
        BlockKind::Free => {}
      }
      self.store.release(handle, false);
      if kind == BlockKind::Free {
        return Err(Error::Corrupt(format!("tree references free-list block {id}")));
      }
    }
    Ok(lines)
  }

  /// Verifies the whole tree and reports its shape.
  ///
  /// # Errors
  ///
  /// [`Error::Corrupt`] describing the first violation found.
  pub fn check(&mut self) -> Result<TreeReport> {
    recovery::walk(&mut self.store).context("check")
  }

  /// Makes the current document durable in the backing file.
  ///
  /// # Errors
  ///
  /// [`Error::Io`] on write failure. The in-memory document is unaffected, and a later `sync`
  /// retries.
  pub fn sync(&mut self) -> Result<SyncStats> {
    self.store.sync().context("sync")
  }

  /// Syncs and closes the backing file, marking it as cleanly closed.
  ///
  /// # Errors
  ///
  /// As [`LineIndex::sync`].
  pub fn close(self) -> Result<()> {
    self.store.close().context("close")
  }

  /// Loads the whole tree into memory and drops the backing file, so that the document survives a
  /// backing file that can no longer be written. A no-op for memory-only documents.
  ///
  /// # Errors
  ///
  /// Errors reading the tree, in which case the file is kept.
  pub fn detach_file(&mut self) -> Result<()> {
    if !self.store.is_persistent() {
      return Ok(());
    }
    let mut stack = vec![self.root()?];
    // Pinning the whole tree must not write anything back.
    let budget = self.store.set_cache_budget(usize::MAX);
    let mut pinned = Vec::new();
    let mut failure = None;
    while let Some(id) = stack.pop() {
      match recovery::fetch_child(&mut self.store, id) {
        Ok(handle) => {
          if self.store.kind(&handle) == BlockKind::Pointer {
            stack.extend(PointerPage::new(self.store.page(&handle)).entries().iter().map(|entry| entry.child));
          }
          pinned.push(handle);
        }
        Err(e) => {
          failure = Some(e);
          break;
        }
      }
    }
    if failure.is_none() {
      self.store.detach_file();
    }
    for handle in pinned {
      self.store.release(handle, false);
    }
    self.store.set_cache_budget(budget);
    match failure {
      Some(e) => Err(e).context("detach_file"),
      None => Ok(()),
    }
  }

  fn root(&self) -> Result<BlockId> {
    self.store.root().ok_or_else(|| Error::Corrupt("document has no root block".into()))
  }

  fn check_line(&self, n: u64) -> Result<()> {
    let count = self.line_count();
    if n == 0 || n > count {
      return Err(Error::OutOfRange { line: n, count });
    }
    Ok(())
  }

  fn check_position(&self, after_n: u64) -> Result<()> {
    let count = self.line_count();
    if after_n > count {
      return Err(Error::OutOfRange { line: after_n, count });
    }
    Ok(())
  }

  fn check_len(&self, len: usize) -> Result<()> {
    if len > self.max_line_len {
      return Err(Error::TooLarge { len, max: self.max_line_len });
    }
    Ok(())
  }

  /// Takes out `count` lines at 0-based `pos` that a failed batch put in.
  fn undo_inserts(&mut self, pos: u64, count: usize) {
    for _ in 0..count {
      if let Err(e) = self.delete_at(pos) {
        error!(error = %e, pos, "could not roll back a partly applied insert");
        return;
      }
    }
    if count > 0 {
      debug!(pos, count, "rolled back a partly applied insert");
    }
  }

  /// Puts back lines that a failed batch deleted at 0-based `pos`.
  fn undo_deletes(&mut self, pos: u64, removed: &[Vec<u8>]) {
    for (i, line) in removed.iter().enumerate() {
      if let Err(e) = self.insert_at(pos + i as u64, line) {
        error!(error = %e, pos, "could not roll back a partly applied delete");
        return;
      }
    }
    if !removed.is_empty() {
      debug!(pos, count = removed.len(), "rolled back a partly applied delete");
    }
  }

  fn release_levels(&mut self, levels: Vec<Level>) {
    for level in levels {
      self.store.release(level.handle, false);
    }
  }

  /// Walks down to 0-based line `n`, pinning every block on the way.
  ///
  /// With `inclusive`, `n` may be one past the last line of a subtree, which selects the position
  /// an insertion at `n` goes to.
  fn descend(&mut self, mut n: u64, inclusive: bool) -> Result<Path> {
    let mut id = self.root()?;
    let mut levels: Vec<Level> = Vec::new();
    loop {
      let handle = match recovery::fetch_child(&mut self.store, id) {
        Ok(handle) => handle,
        Err(e) => {
          self.release_levels(levels);
          return Err(e);
        }
      };
      let page = self.store.page(&handle);
      let step = match self.store.kind(&handle) {
        BlockKind::Data => {
          let len = DataPage::new(page).len() as u64;
          if n < len || (inclusive && n == len) {
            Ok(None)
          } else {
            Err(format!("data block {id} has no line at {n}"))
          }
        }
        BlockKind::Pointer => {
          let page = PointerPage::new(page);
          match page.locate(n, inclusive) {
            Some((slot, prefix)) => Ok(Some((slot, prefix, page.entry(slot).child))),
            None => Err(format!("pointer block {id} covers fewer than {n} lines")),
          }
        }
        BlockKind::Free => Err(format!("tree references free-list block {id}")),
      };
      match step {
        Ok(None) => return Ok(Path { levels, leaf: handle, offset: n as usize }),
        Ok(Some((slot, prefix, child))) => {
          n -= prefix;
          levels.push(Level { handle, slot });
          id = child;
        }
        Err(reason) => {
          self.store.release(handle, false);
          self.release_levels(levels);
          return Err(Error::Corrupt(reason));
        }
      }
    }
  }

  /// Inserts a line at 0-based position `pos`.
  fn insert_at(&mut self, pos: u64, bytes: &[u8]) -> Result<()> {
    let Path { levels, leaf, offset } = self.descend(pos, true)?;
    if !DataPage::new(self.store.page(&leaf)).fits(bytes.len()) {
      return self.split_insert(levels, leaf, offset, bytes);
    }
    DataPageMut::new(self.store.page_mut(&leaf)).insert(offset, bytes);
    self.store.release(leaf, false);
    for level in levels {
      PointerPageMut::new(self.store.page_mut(&level.handle)).adjust(level.slot, 1);
      self.store.release(level.handle, false);
    }
    let count = self.line_count();
    self.store.set_line_count(count + 1);
    Ok(())
  }

  /// Inserts a line into a full data block by splitting it, then carries the new siblings up the
  /// path, splitting pointer blocks that overflow and growing a new root if needed.
  fn split_insert(&mut self, mut levels: Vec<Level>, leaf: BlockHandle, offset: usize, bytes: &[u8]) -> Result<()> {
    let capacity = page::data_capacity(self.store.page_size());
    let mut lines: Vec<Vec<u8>> = DataPage::new(self.store.page(&leaf)).lines().map(<[u8]>::to_vec).collect();
    lines.insert(offset, bytes.to_vec());
    let chunks = pack(&lines, capacity);

    // Count the pointer blocks the split will need before changing anything.
    let mut carried = chunks.len() - 1;
    let mut pointer_blocks = 0;
    for level in levels.iter().rev() {
      if carried == 0 {
        break;
      }
      let len = PointerPage::new(self.store.page(&level.handle)).len();
      if len + carried > self.max_fanout {
        pointer_blocks += 1;
        carried = 1;
      } else {
        carried = 0;
      }
    }
    let grows = carried > 0;
    pointer_blocks += usize::from(grows);

    let mut new_leaves = Vec::with_capacity(chunks.len() - 1);
    let mut new_pointers = Vec::with_capacity(pointer_blocks);
    let wanted = (0..chunks.len() - 1).map(|_| BlockKind::Data).chain((0..pointer_blocks).map(|_| BlockKind::Pointer));
    for kind in wanted {
      match self.store.allocate(kind) {
        Ok(handle) if kind == BlockKind::Data => new_leaves.push(handle),
        Ok(handle) => new_pointers.push(handle),
        Err(e) => {
          for handle in new_leaves.into_iter().chain(new_pointers) {
            self.store.free(handle);
          }
          self.store.release(leaf, false);
          self.release_levels(levels);
          warn!(error = %e, "could not allocate blocks for a split; nothing changed");
          return Err(e);
        }
      }
    }

    DataPageMut::new(self.store.page_mut(&leaf)).rebuild(&lines[chunks[0].clone()]);
    let mut carry = Vec::with_capacity(2);
    for (chunk, handle) in chunks[1..].iter().zip(new_leaves) {
      DataPageMut::new(self.store.page_mut(&handle)).rebuild(&lines[chunk.clone()]);
      carry.push(Entry { line_count: chunk.len() as u64, child: self.store.id(&handle) });
      self.store.release(handle, false);
    }
    debug!(chunks = chunks.len(), lines = lines.len(), "split data block");
    let mut child_total = chunks[0].len() as u64;
    let mut child = self.store.id(&leaf);
    self.store.release(leaf, false);

    let mut new_pointers = new_pointers.into_iter();
    while let Some(level) = levels.pop() {
      if carry.is_empty() {
        PointerPageMut::new(self.store.page_mut(&level.handle)).adjust(level.slot, 1);
      } else {
        let mut entries = PointerPage::new(self.store.page(&level.handle)).entries();
        entries[level.slot].line_count = child_total;
        let at = level.slot + 1;
        entries.splice(at..at, carry.drain(..));
        if entries.len() > self.max_fanout {
          let Some(sibling) = new_pointers.next() else { unreachable!("split planned too few pointer blocks") };
          let right = entries.split_off(entries.len() / 2);
          PointerPageMut::new(self.store.page_mut(&sibling)).set_entries(&right);
          carry.push(Entry { line_count: total(&right), child: self.store.id(&sibling) });
          self.store.release(sibling, false);
          debug!(left = entries.len(), right = right.len(), "split pointer block");
        }
        PointerPageMut::new(self.store.page_mut(&level.handle)).set_entries(&entries);
        child_total = total(&entries);
      }
      child = self.store.id(&level.handle);
      self.store.release(level.handle, false);
    }

    if !carry.is_empty() {
      let Some(root) = new_pointers.next() else { unreachable!("split planned no new root") };
      let mut entries = vec![Entry { line_count: child_total, child }];
      entries.append(&mut carry);
      PointerPageMut::new(self.store.page_mut(&root)).set_entries(&entries);
      let id = self.store.id(&root);
      self.store.release(root, false);
      self.store.set_root(id);
      debug!(fanout = entries.len(), "grew the tree by one level");
    }
    let count = self.line_count();
    self.store.set_line_count(count + 1);
    Ok(())
  }

  /// Deletes the line at 0-based position `pos`, then rebalances the path bottom-up.
  fn delete_at(&mut self, pos: u64) -> Result<()> {
    let count = self.line_count();
    let Path { mut levels, leaf, offset } = self.descend(pos, false)?;
    if count == 1 {
      DataPageMut::new(self.store.page_mut(&leaf)).replace(offset, b"");
      self.store.release(leaf, false);
      self.release_levels(levels);
      return Ok(());
    }

    DataPageMut::new(self.store.page_mut(&leaf)).remove(offset);
    for level in &levels {
      PointerPageMut::new(self.store.page_mut(&level.handle)).adjust(level.slot, -1);
    }
    self.store.set_line_count(count - 1);

    self.rebalance_leaf(levels.last(), leaf);
    while let Some(node) = levels.pop() {
      self.rebalance_pointer(levels.last(), node);
    }
    self.collapse_root();
    Ok(())
  }

  /// Replaces the line at 0-based position `pos`, in place if the new content fits. Otherwise the
  /// new line goes in after the old one, which is then deleted.
  fn replace_at(&mut self, pos: u64, bytes: &[u8]) -> Result<()> {
    let Path { levels, leaf, offset } = self.descend(pos, false)?;
    let fits = DataPage::new(self.store.page(&leaf)).fits_resized(offset, bytes.len());
    if fits {
      DataPageMut::new(self.store.page_mut(&leaf)).replace(offset, bytes);
    }
    self.store.release(leaf, false);
    self.release_levels(levels);
    if !fits {
      self.insert_at(pos + 1, bytes)?;
      if let Err(e) = self.delete_at(pos) {
        self.undo_inserts(pos + 1, 1);
        return Err(e);
      }
    }
    Ok(())
  }

  /// Picks the entry next to `parent.slot` to rebalance with, preferring the right one, and fetches
  /// its block. A sibling that cannot be read is skipped.
  fn sibling(&mut self, parent: &Level) -> Option<(usize, BlockHandle)> {
    let page = PointerPage::new(self.store.page(&parent.handle));
    let index = if parent.slot + 1 < page.len() {
      parent.slot + 1
    } else if parent.slot > 0 {
      parent.slot - 1
    } else {
      return None;
    };
    let id = page.entry(index).child;
    match recovery::fetch_child(&mut self.store, id) {
      Ok(handle) => Some((index, handle)),
      Err(e) => {
        warn!(%id, error = %e, "skipping merge with unreadable sibling");
        None
      }
    }
  }

  fn rebalance_leaf(&mut self, parent: Option<&Level>, leaf: BlockHandle) {
    let Some(parent) = parent else {
      self.store.release(leaf, false);
      return;
    };
    let (empty, used) = {
      let page = DataPage::new(self.store.page(&leaf));
      (page.is_empty(), page.used())
    };
    if empty {
      PointerPageMut::new(self.store.page_mut(&parent.handle)).remove(parent.slot);
      self.store.free(leaf);
      trace!("freed empty data block");
      return;
    }
    if used >= self.min_leaf_used {
      self.store.release(leaf, false);
      return;
    }
    let Some((index, sibling)) = self.sibling(parent) else {
      self.store.release(leaf, false);
      return;
    };
    let (left_slot, left, right) =
      if index > parent.slot { (parent.slot, leaf, sibling) } else { (index, sibling, leaf) };

    let right_page = DataPage::new(self.store.page(&right));
    if DataPage::new(self.store.page(&left)).free_space() < right_page.used() {
      self.store.release(left, false);
      self.store.release(right, false);
      return;
    }
    let moved: Vec<Vec<u8>> = right_page.lines().map(<[u8]>::to_vec).collect();
    let mut left_page = DataPageMut::new(self.store.page_mut(&left));
    for line in &moved {
      left_page.push(line);
    }
    let mut parent_page = PointerPageMut::new(self.store.page_mut(&parent.handle));
    parent_page.adjust(left_slot, moved.len() as i64);
    parent_page.remove(left_slot + 1);
    self.store.release(left, false);
    self.store.free(right);
    trace!(lines = moved.len(), "merged data blocks");
  }

  fn rebalance_pointer(&mut self, parent: Option<&Level>, node: Level) {
    let Level { handle, .. } = node;
    let Some(parent) = parent else {
      self.store.release(handle, false);
      return;
    };
    let len = PointerPage::new(self.store.page(&handle)).len();
    if len == 0 {
      PointerPageMut::new(self.store.page_mut(&parent.handle)).remove(parent.slot);
      self.store.free(handle);
      trace!("freed empty pointer block");
      return;
    }
    if len >= self.min_fanout {
      self.store.release(handle, false);
      return;
    }
    let Some((index, sibling)) = self.sibling(parent) else {
      self.store.release(handle, false);
      return;
    };
    let (left_slot, left, right) =
      if index > parent.slot { (parent.slot, handle, sibling) } else { (index, sibling, handle) };

    let mut entries = PointerPage::new(self.store.page(&left)).entries();
    entries.extend(PointerPage::new(self.store.page(&right)).entries());
    if entries.len() <= self.max_fanout {
      PointerPageMut::new(self.store.page_mut(&left)).set_entries(&entries);
      let mut parent_page = PointerPageMut::new(self.store.page_mut(&parent.handle));
      parent_page.set_line_count(left_slot, total(&entries));
      parent_page.remove(left_slot + 1);
      self.store.release(left, false);
      self.store.free(right);
      trace!(entries = entries.len(), "merged pointer blocks");
    } else {
      let moved = entries.split_off(entries.len() / 2);
      PointerPageMut::new(self.store.page_mut(&left)).set_entries(&entries);
      PointerPageMut::new(self.store.page_mut(&right)).set_entries(&moved);
      let mut parent_page = PointerPageMut::new(self.store.page_mut(&parent.handle));
      parent_page.set_line_count(left_slot, total(&entries));
      parent_page.set_line_count(left_slot + 1, total(&moved));
      self.store.release(left, false);
      self.store.release(right, false);
      trace!(left = entries.len(), right = moved.len(), "redistributed pointer entries");
    }
  }

  /// Drops root pointer blocks that have a single entry. A failure only leaves a taller tree.
  fn collapse_root(&mut self) {
    while let Some(root) = self.store.root() {
      let handle = match recovery::fetch_child(&mut self.store, root) {
        Ok(handle) => handle,
        Err(e) => {
          warn!(%root, error = %e, "could not load root block to shrink the tree");
          return;
        }
      };
      let page = PointerPage::new(self.store.page(&handle));
      if self.store.kind(&handle) != BlockKind::Pointer || page.len() != 1 {
        self.store.release(handle, false);
        return;
      }
      let child = page.entry(0).child;
      self.store.free(handle);
      self.store.set_root(child);
      debug!("shrank the tree by one level");
    }
  }
}
