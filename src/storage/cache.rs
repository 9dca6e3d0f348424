//! # Block cache
//!
//! Resident blocks live in an arena of frames. A frame index stays valid for as long as the frame
//! is resident, which is at least as long as it is pinned, so handles refer to frames by index and
//! survive the promotion of a pending id to a file slot.
//!
//! Recency is tracked with a logical clock: every touch stamps the frame with a fresh tick, and
//! `recency` orders frames from least to most recently used.

use super::page::{BlockId, BlockKind};
use std::cell;
use std::collections;
use std::fmt;
use std::mem;

pub(crate) struct Frame {
  pub id: BlockId,
  pub kind: BlockKind,
  pub data: Box<[u8]>,
  pub dirty: bool,
  /// Live borrows into `data`. Interior mutability lets a read guard unpin through `&self`.
  pub pins: cell::Cell<u32>,
  tick: u64,
}

impl Frame {
  pub fn new(id: BlockId, kind: BlockKind, data: Box<[u8]>, dirty: bool) -> Self {
    Frame { id, kind, data, dirty, pins: cell::Cell::new(1), tick: 0 }
  }

  pub fn is_pinned(&self) -> bool {
    self.pins.get() > 0
  }
}

impl fmt::Debug for Frame {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Frame")
      .field("id", &self.id)
      .field("kind", &self.kind)
      .field("dirty", &self.dirty)
      .field("pins", &self.pins.get())
      .finish()
  }
}

#[derive(Debug, Default)]
pub(crate) struct Cache {
  frames: Vec<Option<Frame>>,
  vacant: Vec<usize>,
  by_id: collections::HashMap<BlockId, usize>,
  recency: collections::BTreeMap<u64, usize>,
  clock: u64,
}

impl Cache {
  pub fn len(&self) -> usize {
    self.by_id.len()
  }

  pub fn lookup(&self, id: BlockId) -> Option<usize> {
    self.by_id.get(&id).copied()
  }

  /// Makes `frame` resident and returns its index.
  pub fn insert(&mut self, frame: Frame) -> usize {
    let id = frame.id;
    let index = match self.vacant.pop() {
      Some(index) => {
        self.frames[index] = Some(frame);
        index
      }
      None => {
        self.frames.push(Some(frame));
        self.frames.len() - 1
      }
    };
    self.by_id.insert(id, index);
    self.touch(index);
    index
  }

  pub fn frame(&self, index: usize) -> &Frame {
    match self.frames.get(index) {
      Some(Some(frame)) => frame,
      _ => unreachable!("frame {index} is not resident"),
    }
  }

  pub fn frame_mut(&mut self, index: usize) -> &mut Frame {
    match self.frames.get_mut(index) {
      Some(Some(frame)) => frame,
      _ => unreachable!("frame {index} is not resident"),
    }
  }

  /// Marks the frame as the most recently used.
  pub fn touch(&mut self, index: usize) {
    self.clock += 1;
    let tick = self.clock;
    let frame = self.frame_mut(index);
    let old = mem::replace(&mut frame.tick, tick);
    self.recency.remove(&old);
    self.recency.insert(tick, index);
  }

  pub fn remove(&mut self, index: usize) -> Frame {
    let frame = match self.frames.get_mut(index).and_then(Option::take) {
      Some(frame) => frame,
      None => unreachable!("frame {index} is not resident"),
    };
    self.by_id.remove(&frame.id);
    self.recency.remove(&frame.tick);
    self.vacant.push(index);
    frame
  }

  /// Changes the id a resident frame is known by.
  pub fn rekey(&mut self, index: usize, id: BlockId) {
    let frame = self.frame_mut(index);
    let old = mem::replace(&mut frame.id, id);
    self.by_id.remove(&old);
    self.by_id.insert(id, index);
  }

  /// Returns the least recently used frame satisfying `pred`.
  pub fn least_recent(&self, mut pred: impl FnMut(&Frame) -> bool) -> Option<usize> {
    self.recency.values().copied().find(|&index| pred(self.frame(index)))
  }

  pub fn iter(&self) -> impl Iterator<Item = (usize, &Frame)> {
    self.frames.iter().enumerate().filter_map(|(index, frame)| frame.as_ref().map(|frame| (index, frame)))
  }

  pub fn indices(&self) -> Vec<usize> {
    self.iter().map(|(index, _)| index).collect()
  }

  pub fn clear(&mut self) {
    *self = Cache::default();
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn frame(slot: u64) -> Frame {
    Frame::new(BlockId::Assigned(slot), BlockKind::Data, vec![0; 16].into_boxed_slice(), false)
  }

  #[test]
  fn test_least_recent_follows_touches() {
    let mut cache = Cache::default();
    let a = cache.insert(frame(1));
    let b = cache.insert(frame(2));
    let c = cache.insert(frame(3));
    assert_eq!(cache.least_recent(|_| true), Some(a));
    cache.touch(a);
    assert_eq!(cache.least_recent(|_| true), Some(b));
    assert_eq!(cache.least_recent(|f| f.id != BlockId::Assigned(2)), Some(c));
  }

  #[test]
  fn test_remove_recycles_index() {
    let mut cache = Cache::default();
    let a = cache.insert(frame(1));
    cache.insert(frame(2));
    cache.remove(a);
    assert_eq!(cache.len(), 1);
    assert_eq!(cache.lookup(BlockId::Assigned(1)), None);
    let c = cache.insert(frame(3));
    assert_eq!(c, a);
    assert_eq!(cache.indices().len(), 2);
  }

  #[test]
  fn test_rekey_keeps_index() {
    let mut cache = Cache::default();
    let index = cache.insert(Frame::new(BlockId::Pending(1), BlockKind::Pointer, vec![0; 16].into(), true));
    cache.rekey(index, BlockId::Assigned(7));
    assert_eq!(cache.lookup(BlockId::Pending(1)), None);
    assert_eq!(cache.lookup(BlockId::Assigned(7)), Some(index));
    assert_eq!(cache.frame(index).id, BlockId::Assigned(7));
  }
}
