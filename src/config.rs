//! # Configuration
//!
//! Tunables for the block store, the line index and the [`Buffer`](crate::Buffer) façade.

use crate::error::{Error, Result};

/// Smallest supported page size in bytes.
pub const MIN_PAGE_SIZE: usize = 128;

/// Largest supported page size in bytes.
pub const MAX_PAGE_SIZE: usize = 64 * 1024;

/// Smallest accepted `max_fanout`.
pub const MIN_FANOUT: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
  /// Size of every page in the backing file. Ignored when opening an existing file, whose header
  /// records the page size it was created with.
  pub page_size: usize,
  /// Number of resident blocks above which clean, unpinned blocks are evicted.
  pub cache_blocks: usize,
  /// Hard cap on resident blocks. Exceeding it with nothing evictable fails with `OutOfMemory`.
  pub memory_limit_blocks: Option<usize>,
  /// Cap on entries per pointer block, below what fits in a page.
  pub max_fanout: Option<usize>,
  /// A data block filled below this percentage tries to merge with a sibling after a delete.
  pub min_leaf_fill_percent: u8,
  /// Walk and check the whole tree when opening an existing file.
  pub verify_on_open: bool,
  /// Take an exclusive lock on the backing file while it is open.
  pub lock_swap: bool,
  /// Number of edits after which the [`Buffer`](crate::Buffer) syncs on its own.
  pub sync_interval: Option<u32>,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      page_size: 4096,
      cache_blocks: 256,
      memory_limit_blocks: None,
      max_fanout: None,
      min_leaf_fill_percent: 25,
      verify_on_open: true,
      lock_swap: true,
      sync_interval: Some(200),
    }
  }
}

impl Config {
  pub fn with_page_size(mut self, page_size: usize) -> Self {
    self.page_size = page_size;
    self
  }

  pub fn with_cache_blocks(mut self, cache_blocks: usize) -> Self {
    self.cache_blocks = cache_blocks;
    self
  }

  pub fn with_memory_limit_blocks(mut self, limit: Option<usize>) -> Self {
    self.memory_limit_blocks = limit;
    self
  }

  pub fn with_max_fanout(mut self, max_fanout: Option<usize>) -> Self {
    self.max_fanout = max_fanout;
    self
  }

  pub fn with_min_leaf_fill_percent(mut self, percent: u8) -> Self {
    self.min_leaf_fill_percent = percent;
    self
  }

  pub fn with_verify_on_open(mut self, verify: bool) -> Self {
    self.verify_on_open = verify;
    self
  }

  pub fn with_lock_swap(mut self, lock: bool) -> Self {
    self.lock_swap = lock;
    self
  }

  pub fn with_sync_interval(mut self, interval: Option<u32>) -> Self {
    self.sync_interval = interval;
    self
  }

  /// Checks that every field is within its supported range.
  ///
  /// # Errors
  ///
  /// Returns [`Error::Config`] naming the first offending field.
  pub fn validate(&self) -> Result<()> {
    validate_page_size(self.page_size)?;
    if self.cache_blocks == 0 {
      return Err(Error::Config("cache_blocks must be at least 1".into()));
    }
    if let Some(limit) = self.memory_limit_blocks {
      if limit < self.cache_blocks.min(8) {
        return Err(Error::Config(format!("memory_limit_blocks {limit} is too small to hold a tree path")));
      }
    }
    if let Some(fanout) = self.max_fanout {
      if fanout < MIN_FANOUT {
        return Err(Error::Config(format!("max_fanout must be at least {MIN_FANOUT}, got {fanout}")));
      }
    }
    if self.min_leaf_fill_percent > 50 {
      return Err(Error::Config(format!(
        "min_leaf_fill_percent must be at most 50, got {}",
        self.min_leaf_fill_percent
      )));
    }
    if self.sync_interval == Some(0) {
      return Err(Error::Config("sync_interval must be positive when set".into()));
    }
    Ok(())
  }
}

pub(crate) fn validate_page_size(page_size: usize) -> Result<()> {
  if !page_size.is_power_of_two() || !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&page_size) {
    return Err(Error::Config(format!(
      "page_size must be a power of two between {MIN_PAGE_SIZE} and {MAX_PAGE_SIZE}, got {page_size}"
    )));
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_default_is_valid() {
    Config::default().validate().unwrap();
  }

  #[test]
  fn test_page_size_bounds() {
    Config::default().with_page_size(MIN_PAGE_SIZE).validate().unwrap();
    Config::default().with_page_size(MAX_PAGE_SIZE).validate().unwrap();
    Config::default().with_page_size(64).validate().unwrap_err();
    Config::default().with_page_size(3000).validate().unwrap_err();
    Config::default().with_page_size(2 * MAX_PAGE_SIZE).validate().unwrap_err();
  }

  #[test]
  fn test_rejects_small_fanout() {
    Config::default().with_max_fanout(Some(3)).validate().unwrap_err();
    Config::default().with_max_fanout(Some(4)).validate().unwrap();
  }

  #[test]
  fn test_rejects_bad_thresholds() {
    Config::default().with_min_leaf_fill_percent(51).validate().unwrap_err();
    Config::default().with_sync_interval(Some(0)).validate().unwrap_err();
    Config::default().with_cache_blocks(0).validate().unwrap_err();
  }
}
