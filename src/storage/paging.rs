//! # Paging
//!
//! This module provides the block store: a buffer pool manager over an optional swap file of
//! fixed-size pages.
//!
//! The store owns the page cache, tracks dirty blocks, evicts clean ones in least-recently-used
//! order, and writes dirty ones back on [`BlockStore::sync`] or under memory pressure. It knows page
//! kinds and the pointer-page layout, because promoting a pending block to a file slot means
//! rewriting every pointer entry that refers to it, but it knows nothing about lines.
//!
//! Blocks are borrowed through [`BlockHandle`]s. A handle pins its block, and a pinned block is
//! never evicted. Every handle must be given back through [`BlockStore::release`] or
//! [`BlockStore::free`].
//!
//! ## Durability
//!
//! The file always holds the tree named by the last header written, intact. A block whose slot
//! belongs to that tree is never written over: the first time it is dirtied after a header write it
//! moves to a new pending id, its parent entry (or the header root) is pointed at the new id, and
//! the old slot is released. The parent is dirtied the same way, so a change moves the whole path
//! up to the root. Blocks dirtied again before the next header write keep the slot they got, and
//! may be written back any number of times under memory pressure.
//!
//! `sync` writes data pages, then pointer pages children-first, then the free list, flushes, and
//! only then writes the header that makes the new tree reachable. Slots released since the last
//! header write are not reused until the next one.
//!
//! The header carries a marker meaning "a session has written to this file since it was last
//! closed cleanly". It is set before the first write of a session and cleared by
//! [`BlockStore::close`]; a file opened with it set reports [`BlockStore::recovered`].

use super::cache::{Cache, Frame};
use super::codec::PageCodec;
use super::page::{self, BlockId, BlockKind, Header, PointerPage, PointerPageMut};
use super::vfs;
use crate::config::Config;
use crate::error::{Error, Result};
use std::cell;
use std::collections;
use std::fmt;
use std::io;
use std::mem;
use std::ops;
use tracing::{debug, info, trace, warn};

/// A pinned reference to a resident block.
///
/// Handles are deliberately not `Clone`: each one stands for exactly one pin.
#[derive(Debug)]
#[must_use = "a handle keeps its block pinned until it is released"]
pub struct BlockHandle {
  frame: usize,
}

/// Bytes borrowed from a resident block, which stays pinned until the slice is dropped.
pub struct PinnedSlice<'a> {
  bytes: &'a [u8],
  pins: &'a cell::Cell<u32>,
}

impl ops::Deref for PinnedSlice<'_> {
  type Target = [u8];

  fn deref(&self) -> &[u8] {
    self.bytes
  }
}

impl AsRef<[u8]> for PinnedSlice<'_> {
  fn as_ref(&self) -> &[u8] {
    self.bytes
  }
}

impl Drop for PinnedSlice<'_> {
  fn drop(&mut self) {
    self.pins.set(self.pins.get().saturating_sub(1));
  }
}

impl fmt::Debug for PinnedSlice<'_> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{:?}", String::from_utf8_lossy(self.bytes))
  }
}

/// What a call to [`BlockStore::sync`] wrote.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SyncStats {
  pub blocks_written: usize,
  pub header_writes: usize,
}

impl SyncStats {
  pub fn is_noop(&self) -> bool {
    self.blocks_written == 0 && self.header_writes == 0
  }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StoreStats {
  pub resident: usize,
  pub dirty: usize,
  pub pinned: usize,
  pub hits: u64,
  pub reads: u64,
  pub writes: u64,
  pub evictions: u64,
}

/// # Block store
#[derive(Debug)]
pub struct BlockStore<F: vfs::File = vfs::StandardFile> {
  file: Option<F>,
  locked: bool,
  page_size: usize,
  cache: Cache,
  cache_blocks: usize,
  memory_limit: Option<usize>,
  /// The header as it will be written by the next sync.
  header: Header,
  /// The header as it is on disk.
  committed: Header,
  recovered: bool,
  next_token: u64,
  /// One past the highest slot in the file.
  high_water: u64,
  /// Slots free in the committed state, safe to reuse.
  free: collections::BTreeSet<u64>,
  /// Slots freed since the last header write.
  released: collections::BTreeSet<u64>,
  /// Slots handed out since the last header write. The committed tree does not use them, so their
  /// blocks are written in place.
  fresh: collections::BTreeSet<u64>,
  free_dirty: bool,
  codec: Option<Box<dyn PageCodec>>,
  stats: StoreStats,
}

impl BlockStore<vfs::StandardFile> {
  /// Opens a store with no backing file, for scratch and unnamed buffers.
  ///
  /// # Errors
  ///
  /// Only [`Error::Config`] for an invalid configuration.
  pub fn in_memory(config: &Config) -> Result<Self> {
    Self::open(None, config)
  }
}

impl<F: vfs::File> BlockStore<F> {
  /// Opens a store over `file`, or a memory-only store with `None`.
  ///
  /// An empty file starts a fresh store with the configured page size. An existing file must carry
  /// a matching magic and version; its recorded page size overrides the configured one.
  ///
  /// # Errors
  ///
  /// [`Error::Io`] when the file cannot be locked or read, [`Error::FormatMismatch`] for foreign
  /// files and [`Error::Corrupt`] for a damaged header.
  pub fn open(file: Option<F>, config: &Config) -> Result<Self> {
    Self::open_with_codec(file, config, None)
  }

  /// Opens a swap file at `path` of the given file system.
  ///
  /// # Errors
  ///
  /// As [`BlockStore::open`].
  pub fn open_path<S: vfs::FileSystem<File = F>>(fs: &mut S, path: &S::Path, config: &Config) -> Result<Self> {
    let file = fs.open(path).map_err(|e| Error::io("opening swap file", e))?;
    Self::open(Some(file), config)
  }

  /// Like [`BlockStore::open`], with a codec applied to every block page.
  ///
  /// # Errors
  ///
  /// As [`BlockStore::open`].
  pub fn open_with_codec(file: Option<F>, config: &Config, codec: Option<Box<dyn PageCodec>>) -> Result<Self> {
    config.validate()?;
    let mut store = BlockStore {
      file: None,
      locked: false,
      page_size: config.page_size,
      cache: Cache::default(),
      cache_blocks: config.cache_blocks,
      memory_limit: config.memory_limit_blocks,
      header: Header::fresh(config.page_size),
      committed: Header::fresh(config.page_size),
      recovered: false,
      next_token: 0,
      high_water: 1,
      free: collections::BTreeSet::new(),
      released: collections::BTreeSet::new(),
      fresh: collections::BTreeSet::new(),
      free_dirty: false,
      codec,
      stats: StoreStats::default(),
    };
    let Some(mut file) = file else {
      debug!(page_size = store.page_size, "opened memory-only block store");
      return Ok(store);
    };

    if config.lock_swap {
      file.try_lock().map_err(|e| Error::io("locking swap file (another session may be using it)", e))?;
      store.locked = true;
    }
    let size = file.size().map_err(|e| Error::io("reading swap file size", e))?;
    if size > 0 {
      let mut prefix = vec![0u8; page::HEADER_LEN.min(size as usize)];
      file.read(0, &mut prefix).map_err(|e| Error::io("reading swap file header", e))?;
      let header = Header::decode(&prefix)?;
      if header.page_size as usize != config.page_size {
        info!(file = header.page_size, configured = config.page_size, "using the page size recorded in the swap file");
      }
      store.page_size = header.page_size as usize;
      store.high_water = (size / header.page_size as u64).max(1);
      store.recovered = header.dirty;
      store.committed = header.clone();
      store.header = header;
    }
    store.file = Some(file);
    store.load_free_list();
    info!(
      page_size = store.page_size,
      slots = store.high_water,
      free = store.free.len(),
      recovered = store.recovered,
      "opened swap file"
    );
    Ok(store)
  }

  pub fn page_size(&self) -> usize {
    self.page_size
  }

  /// Whether the store has a backing file.
  pub fn is_persistent(&self) -> bool {
    self.file.is_some()
  }

  /// Whether the backing file was not closed cleanly by its last session.
  pub fn recovered(&self) -> bool {
    self.recovered
  }

  pub fn root(&self) -> Option<BlockId> {
    self.header.root
  }

  pub fn set_root(&mut self, root: BlockId) {
    self.header.root = Some(root);
  }

  /// The line count recorded in the header.
  pub fn line_count(&self) -> u64 {
    self.header.line_count
  }

  pub fn set_line_count(&mut self, line_count: u64) {
    self.header.line_count = line_count;
  }

  /// Returns a new, empty block of the given kind, pinned and dirty, with a pending id.
  ///
  /// # Errors
  ///
  /// [`Error::OutOfMemory`] when the memory limit is reached and nothing can be evicted, or
  /// [`Error::Io`] if writing back a dirty block to make room fails.
  pub fn allocate(&mut self, kind: BlockKind) -> Result<BlockHandle> {
    self.make_room()?;
    self.next_token += 1;
    let id = BlockId::Pending(self.next_token);
    let mut data = vec![0u8; self.page_size].into_boxed_slice();
    page::init(kind, &mut data);
    let frame = self.cache.insert(Frame::new(id, kind, data, true));
    trace!(%id, ?kind, "allocated block");
    Ok(BlockHandle { frame })
  }

  /// Returns the block with the given id, pinned, reading it from the file if it is not resident.
  ///
  /// # Errors
  ///
  /// [`Error::NotFound`] for ids that name no live block, [`Error::Corrupt`] when the page cannot be
  /// read or fails validation, and the errors of [`BlockStore::allocate`] when making room.
  pub fn fetch(&mut self, id: BlockId) -> Result<BlockHandle> {
    if let Some(frame) = self.cache.lookup(id) {
      let pins = &self.cache.frame(frame).pins;
      pins.set(pins.get() + 1);
      self.cache.touch(frame);
      self.stats.hits += 1;
      return Ok(BlockHandle { frame });
    }
    let slot = match id {
      BlockId::Assigned(slot)
        if slot > 0
          && slot < self.high_water
          && self.file.is_some()
          && !self.free.contains(&slot)
          && !self.released.contains(&slot) =>
      {
        slot
      }
      _ => return Err(Error::NotFound(id)),
    };
    self.make_room()?;
    let data = self.read_page(slot)?;
    let kind = page::validate(&data).map_err(|reason| Error::Corrupt(format!("block {slot}: {reason}")))?;
    if kind == BlockKind::Free {
      return Err(Error::Corrupt(format!("block {slot} is a free-list page")));
    }
    let frame = self.cache.insert(Frame::new(id, kind, data.into_boxed_slice(), false));
    trace!(%id, ?kind, "loaded block");
    Ok(BlockHandle { frame })
  }

  /// Unpins a block. With `mark_dirty`, the block becomes eligible for write-back.
  ///
  /// Marking a block dirty can give it a new id; see the module documentation.
  pub fn release(&mut self, handle: BlockHandle, mark_dirty: bool) {
    if mark_dirty {
      self.mark_dirty(handle.frame);
    }
    let pins = &self.cache.frame(handle.frame).pins;
    pins.set(pins.get().saturating_sub(1));
  }

  /// Drops a block for good. Its slot, if it has one, goes to the free list.
  pub fn free(&mut self, handle: BlockHandle) {
    let frame = self.cache.frame(handle.frame);
    if frame.pins.get() > 1 {
      frame.pins.set(frame.pins.get() - 1);
      warn!(id = %frame.id, "block freed while pinned elsewhere; leaking it");
      return;
    }
    let frame = self.cache.remove(handle.frame);
    if let BlockId::Assigned(slot) = frame.id {
      self.released.insert(slot);
    }
    trace!(id = %frame.id, "freed block");
  }

  pub fn id(&self, handle: &BlockHandle) -> BlockId {
    self.cache.frame(handle.frame).id
  }

  pub fn kind(&self, handle: &BlockHandle) -> BlockKind {
    self.cache.frame(handle.frame).kind
  }

  pub fn page(&self, handle: &BlockHandle) -> &[u8] {
    &self.cache.frame(handle.frame).data
  }

  /// Returns the page for in-place mutation and marks the block dirty.
  ///
  /// The first call after a header write moves a committed block to a new pending id, so callers
  /// read [`BlockStore::id`] after this, not before.
  pub fn page_mut(&mut self, handle: &BlockHandle) -> &mut [u8] {
    self.mark_dirty(handle.frame);
    &mut self.cache.frame_mut(handle.frame).data
  }

  /// Turns a handle into a borrowed byte range of its page. The pin moves to the returned slice.
  pub fn view(&self, handle: BlockHandle, range: ops::Range<usize>) -> PinnedSlice<'_> {
    let frame = self.cache.frame(handle.frame);
    PinnedSlice { bytes: &frame.data[range], pins: &frame.pins }
  }

  /// Writes every dirty, unpinned block and the header, making the current tree durable.
  ///
  /// Pending blocks are promoted to file slots first. Calling `sync` again without changes in
  /// between writes nothing. A memory-only store has nothing to sync.
  ///
  /// # Errors
  ///
  /// [`Error::Io`] when a write fails. The cache stays authoritative: blocks that were not written
  /// remain dirty, and a later `sync` retries them.
  pub fn sync(&mut self) -> Result<SyncStats> {
    let mut stats = SyncStats::default();
    if self.file.is_none() {
      return Ok(stats);
    }
    self.promote_pending();
    let order = self.write_order();
    if order.is_empty() && !self.free_dirty && self.header.same_state(&self.committed) && self.released.is_empty() {
      trace!("sync found nothing to write");
      return Ok(stats);
    }

    self.mark_session()?;
    for index in order {
      self.write_frame(index)?;
      stats.blocks_written += 1;
    }
    stats.blocks_written += self.write_free_list()?;
    self.commit_header()?;
    stats.header_writes += 1;

    // The committed tree no longer references these slots.
    if !self.released.is_empty() {
      let released = mem::take(&mut self.released);
      self.free.extend(released);
      self.free_dirty = true;
      stats.blocks_written += self.write_free_list()?;
      self.commit_header()?;
      stats.header_writes += 1;
    }

    let pinned_dirty = self.cache.iter().filter(|(_, frame)| frame.dirty).count();
    if pinned_dirty > 0 {
      debug!(count = pinned_dirty, "pinned dirty blocks left for a later sync");
    }
    debug!(blocks = stats.blocks_written, lines = self.header.line_count, "synced swap file");
    Ok(stats)
  }

  /// Writes back a single block, promoting pending blocks first if needed. The header is not
  /// written, so the block only becomes reachable on disk with the next full [`BlockStore::sync`].
  ///
  /// Returns the id the block was written under, or `None` if it was skipped: clean, pinned and
  /// non-resident blocks are.
  ///
  /// # Errors
  ///
  /// [`Error::Io`] when the write fails; the block stays dirty.
  pub fn sync_block(&mut self, id: BlockId) -> Result<Option<BlockId>> {
    let Some(index) = self.cache.lookup(id) else { return Ok(None) };
    let frame = self.cache.frame(index);
    if self.file.is_none() || !frame.dirty || frame.is_pinned() {
      return Ok(None);
    }
    self.mark_session()?;
    self.promote_pending();
    self.write_frame(index)?;
    let written = self.cache.frame(index).id;
    trace!(id = %written, "wrote block");
    Ok(Some(written))
  }

  /// Syncs everything, clears the dirty marker and releases the cache.
  ///
  /// # Errors
  ///
  /// As [`BlockStore::sync`]. The store is consumed either way; call `sync` first to be able to
  /// retry on failure.
  pub fn close(mut self) -> Result<()> {
    self.sync()?;
    if self.file.is_some() {
      if self.compact_resident() {
        self.sync()?;
      }
      self.trim_tail()?;
    }
    if self.file.is_some() && self.committed.dirty {
      let mut clean = self.committed.clone();
      clean.dirty = false;
      self.write_header(&clean)?;
      self.sync_file()?;
      self.committed = clean;
    }
    if self.locked {
      if let Some(file) = self.file.as_mut() {
        if let Err(e) = file.unlock() {
          warn!(error = %e, "failed to unlock swap file");
        }
      }
    }
    let left = self.cache.iter().filter(|(_, frame)| frame.dirty).count();
    if left > 0 && self.file.is_some() {
      warn!(count = left, "closing with pinned dirty blocks that could not be written");
    }
    self.cache.clear();
    info!(persistent = self.file.is_some(), "closed block store");
    Ok(())
  }

  pub fn stats(&self) -> StoreStats {
    let mut stats = self.stats;
    for (_, frame) in self.cache.iter() {
      stats.resident += 1;
      stats.dirty += usize::from(frame.dirty);
      stats.pinned += usize::from(frame.is_pinned());
    }
    stats
  }

  /// All slots currently on the free list, committed or not, in ascending order.
  pub fn free_slots(&self) -> Vec<u64> {
    self.free.union(&self.released).copied().collect()
  }

  /// Number of slots in the file, including the header.
  pub fn slot_count(&self) -> u64 {
    self.high_water
  }

  pub fn pin_count(&self, id: BlockId) -> Option<u32> {
    self.cache.lookup(id).map(|index| self.cache.frame(index).pins.get())
  }

  pub fn is_resident(&self, id: BlockId) -> bool {
    self.cache.lookup(id).is_some()
  }

  /// Sets the soft cache budget, returning the previous one.
  pub(crate) fn set_cache_budget(&mut self, blocks: usize) -> usize {
    mem::replace(&mut self.cache_blocks, blocks.max(1))
  }

  /// Puts slots that nothing references back on the free list.
  pub(crate) fn reclaim(&mut self, slots: impl IntoIterator<Item = u64>) {
    let before = self.free.len();
    self.free.extend(slots.into_iter().filter(|&slot| slot > 0 && slot < self.high_water));
    if self.free.len() != before {
      self.free_dirty = true;
    }
  }

  /// Drops the backing file and keeps going in memory. Blocks that are not resident are lost, so
  /// the caller pins everything it still needs beforehand.
  pub(crate) fn detach_file(&mut self) {
    for index in self.cache.indices() {
      self.cache.frame_mut(index).dirty = true;
    }
    if let Some(mut file) = self.file.take() {
      if self.locked {
        if let Err(e) = file.unlock() {
          warn!(error = %e, "failed to unlock swap file");
        }
      }
    }
    self.locked = false;
    self.free.clear();
    self.released.clear();
    self.fresh.clear();
    self.free_dirty = false;
    warn!(resident = self.cache.len(), "detached swap file; the document lives in memory only");
  }

  fn sync_file(&mut self) -> Result<()> {
    match self.file.as_mut() {
      Some(file) => file.sync().map_err(|e| Error::io("flushing swap file", e)),
      None => Ok(()),
    }
  }

  fn no_file() -> Error {
    Error::io("writing swap file", io::Error::new(io::ErrorKind::NotConnected, "store has no backing file"))
  }

  fn read_page(&mut self, slot: u64) -> Result<Vec<u8>> {
    let offset = slot * self.page_size as u64;
    let mut buf = vec![0u8; self.page_size];
    let file = self.file.as_mut().ok_or(Error::NotFound(BlockId::Assigned(slot)))?;
    file.read(offset, &mut buf).map_err(|e| Error::Corrupt(format!("reading block {slot}: {e}")))?;
    if let Some(codec) = &self.codec {
      codec.decode(slot, &mut buf);
    }
    self.stats.reads += 1;
    Ok(buf)
  }

  fn write_page(&mut self, slot: u64, mut buf: Vec<u8>) -> Result<()> {
    if let Some(codec) = &self.codec {
      codec.encode(slot, &mut buf);
    }
    let offset = slot * self.page_size as u64;
    let file = self.file.as_mut().ok_or_else(Self::no_file)?;
    file.write(offset, &buf).map_err(|e| Error::io(format!("writing block {slot}"), e))?;
    self.stats.writes += 1;
    Ok(())
  }

  fn write_header(&mut self, header: &Header) -> Result<()> {
    let mut buf = vec![0u8; self.page_size];
    header.encode(&mut buf);
    let file = self.file.as_mut().ok_or_else(Self::no_file)?;
    file.write(0, &buf).map_err(|e| Error::io("writing swap file header", e))?;
    self.stats.writes += 1;
    Ok(())
  }

  fn write_frame(&mut self, index: usize) -> Result<()> {
    let frame = self.cache.frame(index);
    let slot = match frame.id {
      BlockId::Assigned(slot) => slot,
      BlockId::Pending(_) => return Err(Error::Corrupt(format!("block {} written before promotion", frame.id))),
    };
    let data = frame.data.to_vec();
    self.write_page(slot, data)?;
    self.cache.frame_mut(index).dirty = false;
    Ok(())
  }

  /// Sets the dirty marker on disk before the first write of a session.
  fn mark_session(&mut self) -> Result<()> {
    if self.committed.dirty || self.file.is_none() {
      return Ok(());
    }
    let mut marked = self.committed.clone();
    marked.dirty = true;
    self.write_header(&marked)?;
    self.sync_file()?;
    self.committed = marked;
    debug!("marked swap file as in use");
    Ok(())
  }

  fn commit_header(&mut self) -> Result<()> {
    if let Some(BlockId::Pending(_)) = self.header.root {
      return Err(Error::Corrupt("root block has no file slot at commit".into()));
    }
    self.sync_file()?;
    let mut header = self.header.clone();
    header.dirty = true;
    self.write_header(&header)?;
    self.sync_file()?;
    self.committed = header;
    self.fresh.clear();
    Ok(())
  }

  fn take_slot(&mut self) -> u64 {
    let slot = match self.free.pop_first() {
      Some(slot) => {
        self.free_dirty = true;
        slot
      }
      None => {
        self.high_water += 1;
        self.high_water - 1
      }
    };
    self.fresh.insert(slot);
    slot
  }

  /// The resident pointer block holding an entry for `id`.
  fn parent_of(&self, id: BlockId) -> Option<usize> {
    self
      .cache
      .iter()
      .find(|(_, frame)| frame.kind == BlockKind::Pointer && PointerPage::new(&frame.data).position(id).is_some())
      .map(|(index, _)| index)
  }

  fn mark_dirty(&mut self, index: usize) {
    let frame = self.cache.frame(index);
    if frame.dirty {
      return;
    }
    if let BlockId::Assigned(slot) = frame.id {
      if self.file.is_some() && !self.fresh.contains(&slot) {
        self.relocate(index, slot);
      }
    }
    self.cache.frame_mut(index).dirty = true;
  }

  /// Moves a clean block out of committed slot `slot` to a new pending id, dirtying and fixing up
  /// its parent, or the header root.
  ///
  /// The parent of a block being changed is pinned on the way down, so it is resident. A block with
  /// no resident parent that is not the root cannot be reached from the tree being built, and keeps
  /// its slot.
  fn relocate(&mut self, index: usize, slot: u64) {
    let old = BlockId::Assigned(slot);
    let parent = self.parent_of(old);
    if parent.is_none() && self.header.root != Some(old) {
      trace!(%old, "block has no resident parent; writing it in place");
      return;
    }
    self.next_token += 1;
    let new = BlockId::Pending(self.next_token);
    self.cache.rekey(index, new);
    self.released.insert(slot);
    match parent {
      Some(parent) => {
        self.mark_dirty(parent);
        PointerPageMut::new(&mut self.cache.frame_mut(parent).data).replace_child(old, new);
      }
      None => self.header.root = Some(new),
    }
    trace!(%old, %new, "moved committed block to a new id");
  }

  /// Dirties clean resident blocks that sit above the lowest free slot, so that the next sync moves
  /// them down. Returns whether any moved.
  ///
  /// Moving a block moves its resident ancestors too, so this only runs when the free list can take
  /// every resident block without growing the file.
  fn compact_resident(&mut self) -> bool {
    let Some(&lowest) = self.free.first() else { return false };
    if self.free.len() < self.cache.len() {
      return false;
    }
    let movable: Vec<(usize, BlockId)> = self
      .cache
      .iter()
      .filter(|(_, frame)| !frame.dirty && !frame.is_pinned())
      .filter(|(_, frame)| frame.id.slot().is_some_and(|slot| slot > lowest))
      .map(|(index, frame)| (index, frame.id))
      .collect();
    let mut moved = false;
    for (index, id) in movable {
      if self.header.root == Some(id) || self.parent_of(id).is_some() {
        self.mark_dirty(index);
        moved = true;
      }
    }
    if moved {
      debug!(below = lowest, "moving resident blocks toward the start of the swap file");
    }
    moved
  }

  /// Cuts free slots off the end of the file. Runs right after a sync, when every free slot is
  /// committed free.
  fn trim_tail(&mut self) -> Result<()> {
    let before = self.high_water;
    while self.high_water > 1 && self.free.remove(&(self.high_water - 1)) {
      self.high_water -= 1;
    }
    if self.high_water == before {
      return Ok(());
    }
    self.free_dirty = true;
    self.write_free_list()?;
    self.commit_header()?;
    let size = self.high_water * self.page_size as u64;
    let file = self.file.as_mut().ok_or_else(Self::no_file)?;
    file.truncate(size).map_err(|e| Error::io("truncating swap file", e))?;
    debug!(slots = before - self.high_water, "trimmed free slots from the end of the swap file");
    Ok(())
  }

  /// Gives every pending block a file slot and rewrites the pointer entries and header root that
  /// refer to it.
  ///
  /// A pending block is always resident (it is dirty), and so is every pointer block referring to
  /// it (it was dirtied when the reference was stored), so rewriting the resident pointer pages
  /// reaches every reference.
  fn promote_pending(&mut self) {
    let mut pending: Vec<(u64, usize)> = self
      .cache
      .iter()
      .filter_map(|(index, frame)| match frame.id {
        BlockId::Pending(token) => Some((token, index)),
        BlockId::Assigned(_) => None,
      })
      .collect();
    if pending.is_empty() {
      return;
    }
    pending.sort_unstable();

    let mut promoted = collections::HashMap::with_capacity(pending.len());
    for (token, index) in pending {
      let slot = self.take_slot();
      self.cache.rekey(index, BlockId::Assigned(slot));
      promoted.insert(token, slot);
    }
    for index in self.cache.indices() {
      let frame = self.cache.frame_mut(index);
      if frame.kind == BlockKind::Pointer && PointerPageMut::new(&mut frame.data).remap(&promoted) {
        frame.dirty = true;
      }
    }
    if let Some(BlockId::Pending(token)) = self.header.root {
      if let Some(&slot) = promoted.get(&token) {
        self.header.root = Some(BlockId::Assigned(slot));
      }
    }
    debug!(count = promoted.len(), "promoted pending blocks to file slots");
  }

  /// Dirty, unpinned blocks in the order they must reach the disk: data pages, then pointer pages
  /// with every dirty child ahead of its parent.
  fn write_order(&self) -> Vec<usize> {
    let mut data = Vec::new();
    let mut pointers = collections::HashMap::new();
    for (index, frame) in self.cache.iter() {
      if !frame.dirty || frame.is_pinned() {
        continue;
      }
      match frame.kind {
        BlockKind::Data => data.push((frame.id, index)),
        BlockKind::Pointer => {
          pointers.insert(frame.id, index);
        }
        BlockKind::Free => {}
      }
    }
    data.sort_unstable();
    let mut order: Vec<usize> = data.into_iter().map(|(_, index)| index).collect();

    let mut parents: Vec<(BlockId, usize)> = pointers.iter().map(|(&id, &index)| (id, index)).collect();
    parents.sort_unstable();
    let mut done = collections::HashSet::new();
    for (_, index) in parents {
      self.children_first(index, &pointers, &mut done, &mut order);
    }
    order
  }

  fn children_first(
    &self,
    index: usize,
    dirty: &collections::HashMap<BlockId, usize>,
    done: &mut collections::HashSet<usize>,
    order: &mut Vec<usize>,
  ) {
    if !done.insert(index) {
      return;
    }
    for entry in PointerPage::new(&self.cache.frame(index).data).entries() {
      if let Some(&child) = dirty.get(&entry.child) {
        self.children_first(child, dirty, done, order);
      }
    }
    order.push(index);
  }

  /// Evicts clean blocks, writing dirty ones back first if needed, until a new block fits.
  fn make_room(&mut self) -> Result<()> {
    let target = self.cache_blocks.min(self.memory_limit.unwrap_or(usize::MAX));
    while self.cache.len() >= target {
      if let Some(index) = self.cache.least_recent(|frame| !frame.dirty && !frame.is_pinned()) {
        let frame = self.cache.remove(index);
        self.stats.evictions += 1;
        trace!(id = %frame.id, "evicted block");
        continue;
      }
      if self.file.is_none() {
        break;
      }
      let victim = self
        .cache
        .least_recent(|frame| frame.dirty && !frame.is_pinned() && frame.kind == BlockKind::Data)
        .or_else(|| self.cache.least_recent(|frame| frame.dirty && !frame.is_pinned()));
      let Some(index) = victim else { break };
      self.mark_session()?;
      self.promote_pending();
      self.write_frame(index)?;
      trace!("wrote back a dirty block under memory pressure");
    }
    if let Some(limit) = self.memory_limit {
      if self.cache.len() >= limit {
        return Err(Error::OutOfMemory(format!("{} blocks resident and none can be evicted", self.cache.len())));
      }
    }
    Ok(())
  }

  /// Writes the committed free slots as a chain of trunk pages, if they changed. Returns the
  /// number of pages written.
  fn write_free_list(&mut self) -> Result<usize> {
    if !self.free_dirty {
      return Ok(0);
    }
    let slots: Vec<u64> = self.free.iter().copied().collect();
    let mut chunks = Vec::new();
    let mut rest = &slots[..];
    while let Some((&trunk, tail)) = rest.split_first() {
      let mut buf = vec![0u8; self.page_size];
      let taken = page::encode_trunk(&mut buf, None, tail);
      chunks.push((trunk, tail[..taken].to_vec()));
      rest = &tail[taken..];
    }
    let written = chunks.len();
    for (i, (trunk, listed)) in chunks.iter().enumerate() {
      let next = chunks.get(i + 1).map(|(next, _)| *next);
      let mut buf = vec![0u8; self.page_size];
      page::encode_trunk(&mut buf, next, listed);
      self.write_page(*trunk, buf)?;
    }
    self.header.free_head = chunks.first().map(|(trunk, _)| *trunk);
    self.free_dirty = false;
    trace!(trunks = written, slots = slots.len(), "wrote free list");
    Ok(written)
  }

  /// Reads the committed free list. A broken chain only leaks the slots past the break; recovery
  /// reclaims them.
  fn load_free_list(&mut self) {
    let mut next = self.header.free_head;
    let mut seen = collections::HashSet::new();
    while let Some(trunk) = next {
      if trunk >= self.high_water || !seen.insert(trunk) {
        warn!(trunk, "free list points outside the file or loops; dropping the rest");
        self.free_dirty = true;
        break;
      }
      let listed = match self.read_page(trunk).map(|buf| page::decode_trunk(&buf)) {
        Ok(Ok((after, listed))) => {
          next = after;
          listed
        }
        Ok(Err(reason)) => {
          warn!(trunk, %reason, "stale free-list trunk; dropping the rest");
          self.free_dirty = true;
          break;
        }
        Err(e) => {
          warn!(trunk, error = %e, "unreadable free-list trunk; dropping the rest");
          self.free_dirty = true;
          break;
        }
      };
      self.free.insert(trunk);
      self.free.extend(listed.into_iter().filter(|&slot| slot > 0 && slot < self.high_water));
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::error::ErrorKind;
  use crate::storage::codec::XorCodec;
  use crate::storage::page::{DataPage, DataPageMut, Entry};
  use crate::storage::vfs::{FileSystem, MemoryFile, MemoryFileSystem};
  use rand::rngs::StdRng;
  use rand::{Rng, SeedableRng};

  fn config() -> Config {
    Config::default().with_page_size(256).with_cache_blocks(8)
  }

  fn open(fs: &mut MemoryFileSystem, config: &Config) -> BlockStore<MemoryFile> {
    BlockStore::open_path(fs, "swap", config).unwrap()
  }

  fn data_block<F: vfs::File>(store: &mut BlockStore<F>, text: &[u8]) -> BlockId {
    let handle = store.allocate(BlockKind::Data).unwrap();
    assert!(DataPageMut::new(store.page_mut(&handle)).push(text));
    let id = store.id(&handle);
    store.release(handle, true);
    id
  }

  /// Creates a data block and writes it to the file, returning the id it was written under.
  fn persisted_block(store: &mut BlockStore<MemoryFile>, text: &[u8]) -> BlockId {
    let id = data_block(store, text);
    let Some(written) = store.sync_block(id).unwrap() else { panic!("block {id} was not written") };
    written
  }

  fn only_child<F: vfs::File>(store: &mut BlockStore<F>, parent: BlockId) -> BlockId {
    let handle = store.fetch(parent).unwrap();
    let child = PointerPage::new(store.page(&handle)).entry(0).child;
    store.release(handle, false);
    child
  }

  /// A root pointer block over one data block, synced. Returns the root and the leaf.
  fn committed_tree(store: &mut BlockStore<MemoryFile>, text: &[u8]) -> (BlockId, BlockId) {
    let leaf = data_block(store, text);
    let parent = store.allocate(BlockKind::Pointer).unwrap();
    PointerPageMut::new(store.page_mut(&parent)).set_entries(&[Entry { line_count: 1, child: leaf }]);
    let parent_id = store.id(&parent);
    store.release(parent, true);
    store.set_root(parent_id);
    store.set_line_count(1);
    store.sync().unwrap();
    let root = store.root().unwrap();
    (root, only_child(store, root))
  }

  fn first_line<F: vfs::File>(store: &mut BlockStore<F>, id: BlockId) -> Vec<u8> {
    let handle = store.fetch(id).unwrap();
    let line = DataPage::new(store.page(&handle)).line(0).to_vec();
    store.release(handle, false);
    line
  }

  fn header_of(fs: &MemoryFileSystem) -> Header {
    Header::decode(&fs.snapshot("swap").unwrap()).unwrap()
  }

  #[test]
  fn test_allocate_is_pending_pinned_and_dirty() {
    let mut store = BlockStore::in_memory(&config()).unwrap();
    let handle = store.allocate(BlockKind::Data).unwrap();
    let id = store.id(&handle);
    assert!(matches!(id, BlockId::Pending(_)));
    assert_eq!(store.pin_count(id), Some(1));
    store.release(handle, false);
    assert_eq!(store.pin_count(id), Some(0));
    assert_eq!(store.stats().dirty, 1);
  }

  #[test]
  fn test_fetch_returns_single_resident_copy() {
    let mut store = BlockStore::in_memory(&config()).unwrap();
    let id = data_block(&mut store, b"shared");
    let first = store.fetch(id).unwrap();
    let second = store.fetch(id).unwrap();
    assert_eq!(store.pin_count(id), Some(2));

    DataPageMut::new(store.page_mut(&first)).replace(0, b"changed");
    assert_eq!(DataPage::new(store.page(&second)).line(0), b"changed");
    store.release(first, true);
    store.release(second, false);
    assert_eq!(store.pin_count(id), Some(0));
  }

  #[test]
  fn test_fetch_unknown_blocks() {
    let mut store = BlockStore::in_memory(&config()).unwrap();
    assert_eq!(store.fetch(BlockId::Pending(99)).unwrap_err().kind(), ErrorKind::NotFound);
    assert_eq!(store.fetch(BlockId::Assigned(5)).unwrap_err().kind(), ErrorKind::NotFound);
    assert_eq!(store.fetch(BlockId::Assigned(0)).unwrap_err().kind(), ErrorKind::NotFound);
  }

  #[test]
  fn test_sync_promotes_pending_ids_and_fixes_up_parents() {
    let mut fs = MemoryFileSystem::default();
    let mut store = open(&mut fs, &config());
    let leaf = data_block(&mut store, b"hello");
    let parent = store.allocate(BlockKind::Pointer).unwrap();
    PointerPageMut::new(store.page_mut(&parent)).set_entries(&[Entry { line_count: 1, child: leaf }]);
    let parent_id = store.id(&parent);
    store.release(parent, true);
    store.set_root(parent_id);
    store.set_line_count(1);

    let stats = store.sync().unwrap();
    assert_eq!(stats.blocks_written, 2);
    let Some(BlockId::Assigned(root_slot)) = store.root() else { panic!("root was not promoted") };

    let root = store.fetch(BlockId::Assigned(root_slot)).unwrap();
    let entry = PointerPage::new(store.page(&root)).entry(0);
    store.release(root, false);
    assert!(matches!(entry.child, BlockId::Assigned(_)));
    assert_eq!(first_line(&mut store, entry.child), b"hello");

    let header = header_of(&fs);
    assert_eq!(header.root, Some(BlockId::Assigned(root_slot)));
    assert_eq!(header.line_count, 1);
    assert!(header.dirty);
  }

  #[test]
  fn test_sync_twice_writes_nothing_the_second_time() {
    let mut fs = MemoryFileSystem::default();
    let mut store = open(&mut fs, &config());
    let id = data_block(&mut store, b"x");
    store.set_root(id);
    store.set_line_count(1);
    assert!(!store.sync().unwrap().is_noop());

    let before = fs.snapshot("swap").unwrap();
    let writes = store.stats().writes;
    assert!(store.sync().unwrap().is_noop());
    assert_eq!(store.stats().writes, writes);
    assert_eq!(fs.snapshot("swap").unwrap(), before);
  }

  #[test]
  fn test_clean_close_and_crash_marker() {
    let mut fs = MemoryFileSystem::default();
    let mut store = open(&mut fs, &config());
    let id = persisted_block(&mut store, b"kept");
    store.set_root(id);
    store.set_line_count(1);
    store.close().unwrap();
    assert!(!header_of(&fs).dirty);

    let mut store = open(&mut fs, &config());
    assert!(!store.recovered());
    assert_eq!(first_line(&mut store, id), b"kept");
    // Dirty the file, then drop the store as if the process died.
    let other = persisted_block(&mut store, b"more");
    assert_ne!(other, id);
    drop(store);
    assert!(header_of(&fs).dirty);

    let store = open(&mut fs, &config());
    assert!(store.recovered());
    store.close().unwrap();
    assert!(!header_of(&fs).dirty);
  }

  #[test]
  fn test_opening_never_writes() {
    let mut fs = MemoryFileSystem::default();
    let store = open(&mut fs, &config());
    drop(store);
    assert_eq!(fs.snapshot("swap").unwrap(), b"");
  }

  #[test]
  fn test_pinned_block_survives_pressure() {
    let mut fs = MemoryFileSystem::default();
    let mut store = open(&mut fs, &config());
    let pinned = store.allocate(BlockKind::Data).unwrap();
    DataPageMut::new(store.page_mut(&pinned)).push(b"do not evict");

    let ids: Vec<BlockId> = (0..40).map(|i| persisted_block(&mut store, format!("block {i}").as_bytes())).collect();
    let mut rng = StdRng::seed_from_u64(7);
    let mut held = Vec::new();
    for _ in 0..500 {
      let id = ids[rng.gen_range(0..ids.len())];
      let handle = store.fetch(id).unwrap();
      if rng.gen_bool(0.1) && held.len() < 3 {
        held.push(handle);
      } else {
        store.release(handle, rng.gen_bool(0.3));
      }
      if rng.gen_bool(0.05) {
        if let Some(handle) = held.pop() {
          store.release(handle, false);
        }
      }
      let pinned_id = store.id(&pinned);
      assert_eq!(store.pin_count(pinned_id), Some(1));
      for handle in &held {
        assert!(store.pin_count(store.id(handle)).unwrap() >= 1);
      }
    }
    assert!(store.stats().evictions > 0);
    assert_eq!(DataPage::new(store.page(&pinned)).line(0), b"do not evict");
    for handle in held {
      store.release(handle, false);
    }
    store.release(pinned, true);
    for (i, &id) in ids.iter().enumerate() {
      assert_eq!(first_line(&mut store, id), format!("block {i}").as_bytes());
    }
  }

  #[test]
  fn test_dirty_blocks_are_written_before_eviction() {
    let mut fs = MemoryFileSystem::default();
    let config = config().with_cache_blocks(4);
    let mut store = open(&mut fs, &config);
    let ids: Vec<BlockId> = (0..20).map(|i| persisted_block(&mut store, format!("v1 {i}").as_bytes())).collect();
    // Dirty every block again without syncing; pressure alone must save them.
    for (i, &id) in ids.iter().enumerate() {
      let handle = store.fetch(id).unwrap();
      DataPageMut::new(store.page_mut(&handle)).replace(0, format!("v2 {i}").as_bytes());
      store.release(handle, true);
    }
    assert!(store.stats().resident <= 4);
    for (i, &id) in ids.iter().enumerate() {
      assert_eq!(first_line(&mut store, id), format!("v2 {i}").as_bytes());
    }
  }

  #[test]
  fn test_failed_sync_keeps_cache_authoritative() {
    let mut fs = MemoryFileSystem::default();
    let mut store = open(&mut fs, &config());
    let id = data_block(&mut store, b"unsaved");
    store.set_root(id);
    store.set_line_count(1);

    fs.set_fail_writes("swap", true);
    let err = store.sync().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::IoFailure);
    let id = store.root().unwrap();
    assert_eq!(first_line(&mut store, id), b"unsaved");

    fs.set_fail_writes("swap", false);
    store.sync().unwrap();
    store.close().unwrap();
    let mut store = open(&mut fs, &config());
    assert_eq!(first_line(&mut store, id), b"unsaved");
  }

  #[test]
  fn test_codec_transforms_blocks_but_not_header() {
    let mut fs = MemoryFileSystem::default();
    let codec = || Some(Box::new(XorCodec::new(b"key".to_vec())) as Box<dyn PageCodec>);
    let mut store = BlockStore::open_with_codec(Some(fs.open("swap").unwrap()), &config(), codec()).unwrap();
    let id = persisted_block(&mut store, b"secret line");
    store.set_root(id);
    store.set_line_count(1);
    store.close().unwrap();

    let bytes = fs.snapshot("swap").unwrap();
    assert_eq!(&bytes[0..4], b"SWLN");
    assert!(!bytes.windows(11).any(|w| w == b"secret line"));

    let mut store = BlockStore::open_with_codec(Some(fs.open("swap").unwrap()), &config(), codec()).unwrap();
    assert_eq!(first_line(&mut store, id), b"secret line");
  }

  #[test]
  fn test_free_list_survives_reopen_and_is_reused() {
    let mut fs = MemoryFileSystem::default();
    let mut store = open(&mut fs, &config());
    let ids: Vec<BlockId> = (0..6).map(|i| persisted_block(&mut store, &[b'a' + i as u8])).collect();
    store.set_root(ids[0]);
    store.set_line_count(1);
    store.sync().unwrap();
    for &id in &ids[2..5] {
      let handle = store.fetch(id).unwrap();
      store.free(handle);
    }
    let freed: Vec<u64> = ids[2..5].iter().filter_map(|id| id.slot()).collect();
    assert_eq!(store.free_slots(), freed);
    // Freed slots are gone for reads right away.
    assert_eq!(store.fetch(ids[2]).unwrap_err().kind(), ErrorKind::NotFound);
    store.close().unwrap();

    let mut store = open(&mut fs, &config());
    assert_eq!(store.free_slots(), freed);
    let slots = store.slot_count();
    let reused = persisted_block(&mut store, b"z");
    assert!(freed.contains(&reused.slot().unwrap()));
    assert_eq!(store.slot_count(), slots);
  }

  #[test]
  fn test_sync_block_writes_one_block() {
    let mut fs = MemoryFileSystem::default();
    let mut store = open(&mut fs, &config());
    let first = data_block(&mut store, b"one");
    let second = data_block(&mut store, b"two");
    assert_eq!(store.sync_block(first).unwrap(), Some(BlockId::Assigned(1)));
    assert_eq!(store.sync_block(BlockId::Assigned(1)).unwrap(), None);
    assert_eq!(store.stats().dirty, 1);
    // Both were promoted, but only the first reached the file.
    assert!(store.is_resident(BlockId::Assigned(2)));
    assert!(!store.is_resident(second));
    assert_eq!(header_of(&fs).root, None);
  }

  #[test]
  fn test_dirtying_a_committed_block_moves_it() {
    let mut fs = MemoryFileSystem::default();
    let mut store = open(&mut fs, &config());
    let (root, leaf) = committed_tree(&mut store, b"v1");
    let committed = fs.snapshot("swap").unwrap();

    let handle = store.fetch(leaf).unwrap();
    DataPageMut::new(store.page_mut(&handle)).replace(0, b"v2");
    let moved = store.id(&handle);
    store.release(handle, false);
    assert!(matches!(moved, BlockId::Pending(_)));
    // The parent moved with it and points at the new id.
    let new_root = store.root().unwrap();
    assert!(matches!(new_root, BlockId::Pending(_)));
    assert_eq!(only_child(&mut store, new_root), moved);
    let mut old_slots = vec![root.slot().unwrap(), leaf.slot().unwrap()];
    old_slots.sort_unstable();
    assert_eq!(store.free_slots(), old_slots);

    // Writing the block back goes to a new slot and leaves the committed pages alone.
    let written = store.sync_block(moved).unwrap().unwrap();
    assert!(!old_slots.contains(&written.slot().unwrap()));
    assert_eq!(&fs.snapshot("swap").unwrap()[..committed.len()], &committed[..]);

    // A process killed now finds the committed tree.
    let mut crashed = MemoryFileSystem::default();
    crashed.install("swap", fs.snapshot("swap").unwrap());
    let mut store_after_kill = open(&mut crashed, &config());
    assert!(store_after_kill.recovered());
    assert_eq!(store_after_kill.root(), Some(root));
    assert_eq!(first_line(&mut store_after_kill, leaf), b"v1");

    store.sync().unwrap();
    store.close().unwrap();
    let mut store = open(&mut fs, &config());
    let root = store.root().unwrap();
    let leaf = only_child(&mut store, root);
    assert_eq!(first_line(&mut store, leaf), b"v2");
  }

  #[test]
  fn test_blocks_moved_since_the_last_header_are_rewritten_in_place() {
    let mut fs = MemoryFileSystem::default();
    let mut store = open(&mut fs, &config());
    let (_, leaf) = committed_tree(&mut store, b"v1");
    let handle = store.fetch(leaf).unwrap();
    DataPageMut::new(store.page_mut(&handle)).replace(0, b"v2");
    let moved = store.id(&handle);
    store.release(handle, false);
    let written = store.sync_block(moved).unwrap().unwrap();

    // No header write in between, so the block keeps its new slot.
    let handle = store.fetch(written).unwrap();
    DataPageMut::new(store.page_mut(&handle)).replace(0, b"v3");
    assert_eq!(store.id(&handle), written);
    store.release(handle, false);
    assert_eq!(store.sync_block(written).unwrap(), Some(written));
    assert_eq!(first_line(&mut store, written), b"v3");
  }

  #[test]
  fn test_close_trims_free_slots_off_the_end() {
    let mut fs = MemoryFileSystem::default();
    let mut store = open(&mut fs, &config());
    let (root, _) = committed_tree(&mut store, b"kept");
    let extra: Vec<BlockId> = (0..6).map(|i| persisted_block(&mut store, format!("extra {i}").as_bytes())).collect();
    store.sync().unwrap();
    for id in extra {
      let handle = store.fetch(id).unwrap();
      store.free(handle);
    }
    store.close().unwrap();
    // Header, root and leaf.
    assert_eq!(fs.snapshot("swap").unwrap().len(), 3 * 256);

    let mut store = open(&mut fs, &config());
    assert!(!store.recovered());
    assert!(store.free_slots().is_empty());
    assert_eq!(store.root(), Some(root));
    let leaf = only_child(&mut store, root);
    assert_eq!(first_line(&mut store, leaf), b"kept");
  }

  #[test]
  fn test_open_rejects_foreign_file() {
    let mut fs = MemoryFileSystem::default();
    fs.install("swap", b"#!/bin/sh\necho this is not a swap file\n".to_vec());
    let err = BlockStore::open_path(&mut fs, "swap", &config()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::FormatMismatch);
  }

  #[test]
  fn test_lock_excludes_second_session() {
    let mut fs = MemoryFileSystem::default();
    let store = open(&mut fs, &config());
    let err = BlockStore::open_path(&mut fs, "swap", &config()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::IoFailure);
    store.close().unwrap();
    open(&mut fs, &config()).close().unwrap();
  }

  #[test]
  fn test_memory_only_store() {
    let mut store = BlockStore::in_memory(&config()).unwrap();
    assert!(!store.is_persistent());
    for i in 0..20 {
      data_block(&mut store, format!("{i}").as_bytes());
    }
    // Nothing can be written back, so nothing is evicted.
    assert_eq!(store.stats().resident, 20);
    assert!(store.sync().unwrap().is_noop());
    store.close().unwrap();
  }

  #[test]
  fn test_memory_limit_reports_out_of_memory() {
    let config = config().with_memory_limit_blocks(Some(8));
    let mut store = BlockStore::in_memory(&config).unwrap();
    for i in 0..8 {
      data_block(&mut store, format!("{i}").as_bytes());
    }
    let err = store.allocate(BlockKind::Data).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::OutOfMemory);
    assert_eq!(store.stats().resident, 8);
  }
}
