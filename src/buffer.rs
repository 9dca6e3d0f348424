//! # Editor buffers
//!
//! A [`Buffer`] is the face a document shows to the rest of the editor. It forwards line
//! operations to a [`LineIndex`] and decides what the user gets to see when something goes wrong:
//!
//! - I/O failures and corruption are recorded as [`Warning`]s for the editor to display. An edit
//!   that fails on I/O moves the document to memory, so editing can go on without the swap file.
//! - Line numbers out of range are bugs in the caller. They are logged and returned, never shown.
//! - Every `sync_interval` edits the buffer syncs on its own. A failed automatic sync is a
//!   warning, and the edit that triggered it still succeeds.

use crate::config::Config;
use crate::error::{Error, ErrorKind, Result};
use crate::storage::lines::LineIndex;
use crate::storage::paging::{BlockStore, PinnedSlice, SyncStats};
use crate::storage::recovery::TreeReport;
use crate::storage::vfs::{self, FileSystem, StandardFileSystem};
use std::fmt;
use std::mem;
use std::path;
use tracing::{debug, error, info, warn};

/// Something the user should be told about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Warning {
  pub kind: ErrorKind,
  pub message: String,
}

impl Warning {
  fn from_error(error: &Error) -> Self {
    Warning { kind: error.kind(), message: error.to_string() }
  }
}

impl fmt::Display for Warning {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}: {}", self.kind, self.message)
  }
}

#[derive(Debug)]
pub struct Buffer<F: vfs::File = vfs::StandardFile> {
  index: LineIndex<F>,
  sync_interval: Option<u32>,
  edits_since_sync: u32,
  warnings: Vec<Warning>,
}

impl Buffer<vfs::StandardFile> {
  /// Opens the swap file at `path`, creating it if it does not exist.
  ///
  /// # Errors
  ///
  /// [`Error::Io`] if the file cannot be opened or locked, [`Error::FormatMismatch`] if it is not a
  /// swap file, and [`Error::Corrupt`] if its tree fails verification.
  pub fn open(path: impl AsRef<path::Path>, config: &Config) -> Result<Self> {
    Self::open_with(&mut StandardFileSystem, path.as_ref(), config)
  }

  /// As [`Buffer::open`], but an unusable swap file is set aside and a fresh one started.
  ///
  /// # Errors
  ///
  /// [`Error::Io`] if the file cannot be opened, locked or moved.
  pub fn open_or_recover(path: impl AsRef<path::Path>, config: &Config) -> Result<Self> {
    Self::open_or_recover_with(&mut StandardFileSystem, path.as_ref(), config)
  }

  /// Opens an empty buffer with no swap file.
  ///
  /// # Errors
  ///
  /// Only [`Error::Config`] for an invalid configuration.
  pub fn scratch(config: &Config) -> Result<Self> {
    Ok(Self::from_index(LineIndex::in_memory(config)?, config))
  }

  /// Drops the document and deletes its swap file at `path`.
  ///
  /// # Errors
  ///
  /// As [`Buffer::discard_with`].
  pub fn discard(self, path: impl AsRef<path::Path>) -> Result<()> {
    self.discard_with(&mut StandardFileSystem, path.as_ref())
  }
}

impl<F: vfs::File> Buffer<F> {
  /// Opens the swap file at `path` in `fs`.
  ///
  /// # Errors
  ///
  /// As [`Buffer::open`].
  pub fn open_with<S: FileSystem<File = F>>(fs: &mut S, path: &S::Path, config: &Config) -> Result<Self> {
    let store = BlockStore::open_path(fs, path, config)?;
    let index = LineIndex::open(store, config)?;
    let mut buffer = Self::from_index(index, config);
    if buffer.recovered() {
      buffer.warnings.push(Warning {
        kind: ErrorKind::IoFailure,
        message: "swap file was not closed cleanly; edits after its last sync may be lost".to_string(),
      });
    }
    Ok(buffer)
  }

  /// Opens the swap file at `path` in `fs`. If the file is corrupt or not a swap file, it is renamed
  /// to a `.corrupt` sibling and an empty document is started in its place.
  ///
  /// # Errors
  ///
  /// [`Error::Io`] if the file cannot be opened, locked or moved.
  pub fn open_or_recover_with<S: FileSystem<File = F>>(fs: &mut S, path: &S::Path, config: &Config) -> Result<Self> {
    match Self::open_with(fs, path, config) {
      Err(e) if e.is_fatal() => {
        error!(error = %e, "swap file is unusable, moving it aside");
        fs.quarantine(path).map_err(|source| Error::io("moving an unusable swap file aside", source))?;
        let mut buffer = Self::open_with(fs, path, config)?;
        buffer.warnings.push(Warning {
          kind: e.kind(),
          message: format!("swap file was unusable and has been renamed with a .corrupt suffix: {e}"),
        });
        Ok(buffer)
      }
      other => other,
    }
  }

  fn from_index(index: LineIndex<F>, config: &Config) -> Self {
    Buffer { index, sync_interval: config.sync_interval, edits_since_sync: 0, warnings: Vec::new() }
  }

  pub fn line_count(&self) -> u64 {
    self.index.line_count()
  }

  /// Whether the swap file was left behind by a session that did not close it.
  pub fn recovered(&self) -> bool {
    self.index.recovered()
  }

  /// Whether edits still reach a swap file.
  pub fn is_persistent(&self) -> bool {
    self.index.is_persistent()
  }

  pub fn max_line_len(&self) -> usize {
    self.index.max_line_len()
  }

  pub fn warnings(&self) -> &[Warning] {
    &self.warnings
  }

  /// Returns and forgets the warnings recorded so far.
  pub fn take_warnings(&mut self) -> Vec<Warning> {
    mem::take(&mut self.warnings)
  }

  /// Returns line `n`; see [`LineIndex::get_line`].
  ///
  /// # Errors
  ///
  /// As [`LineIndex::get_line`].
  pub fn get_line(&mut self, n: u64) -> Result<PinnedSlice<'_>> {
    let result = self.index.get_line(n);
    if let Err(e) = &result {
      Self::report(&mut self.warnings, e);
    }
    result
  }

  /// # Errors
  ///
  /// As [`LineIndex::insert_line`].
  pub fn insert_line(&mut self, after_n: u64, bytes: &[u8]) -> Result<()> {
    let result = self.index.insert_line(after_n, bytes);
    self.after_edit(result)
  }

  /// # Errors
  ///
  /// As [`LineIndex::delete_line`].
  pub fn delete_line(&mut self, n: u64) -> Result<()> {
    let result = self.index.delete_line(n);
    self.after_edit(result)
  }

  /// # Errors
  ///
  /// As [`LineIndex::replace_line`].
  pub fn replace_line(&mut self, n: u64, bytes: &[u8]) -> Result<()> {
    let result = self.index.replace_line(n, bytes);
    self.after_edit(result)
  }

  /// # Errors
  ///
  /// As [`LineIndex::append_lines`].
  pub fn append_lines<L: AsRef<[u8]>>(&mut self, after_n: u64, lines: &[L]) -> Result<()> {
    let result = self.index.append_lines(after_n, lines);
    self.after_edit(result)
  }

  /// # Errors
  ///
  /// As [`LineIndex::delete_range`].
  pub fn delete_range(&mut self, from_n: u64, to_n: u64) -> Result<()> {
    let result = self.index.delete_range(from_n, to_n);
    self.after_edit(result)
  }

  /// Replaces the whole document with `lines`. An empty slice leaves a single empty line.
  ///
  /// # Errors
  ///
  /// [`Error::TooLarge`] if any line is too long, in which case nothing changed, and block store
  /// errors.
  pub fn set_lines<L: AsRef<[u8]>>(&mut self, lines: &[L]) -> Result<()> {
    let max = self.index.max_line_len();
    if let Some(line) = lines.iter().find(|line| line.as_ref().len() > max) {
      return Err(Error::TooLarge { len: line.as_ref().len(), max });
    }
    let result = self.replace_all(lines);
    self.after_edit(result)
  }

  /// Adds the new lines after the old ones, then deletes the old ones. Either step failing leaves
  /// the old document.
  fn replace_all<L: AsRef<[u8]>>(&mut self, lines: &[L]) -> Result<()> {
    let count = self.index.line_count();
    self.index.append_lines(count, lines)?;
    if let Err(e) = self.index.delete_range(1, count) {
      if !lines.is_empty() {
        if let Err(undo) = self.index.delete_range(count + 1, count + lines.len() as u64) {
          error!(error = %undo, "could not remove the lines of a failed set_lines");
        }
      }
      return Err(e);
    }
    Ok(())
  }

  /// Copies out every line of the document.
  ///
  /// # Errors
  ///
  /// As [`LineIndex::lines`].
  pub fn lines(&mut self) -> Result<Vec<Vec<u8>>> {
    let result = self.index.lines();
    if let Err(e) = &result {
      Self::report(&mut self.warnings, e);
    }
    result
  }

  /// Verifies the block tree; see [`LineIndex::check`].
  ///
  /// # Errors
  ///
  /// As [`LineIndex::check`].
  pub fn check(&mut self) -> Result<TreeReport> {
    self.index.check()
  }

  /// Makes the document durable now.
  ///
  /// # Errors
  ///
  /// As [`LineIndex::sync`]. The failure is recorded as a warning as well.
  pub fn sync(&mut self) -> Result<SyncStats> {
    match self.index.sync() {
      Ok(stats) => {
        self.edits_since_sync = 0;
        Ok(stats)
      }
      Err(e) => {
        Self::report(&mut self.warnings, &e);
        Err(e)
      }
    }
  }

  /// Syncs and closes the swap file.
  ///
  /// # Errors
  ///
  /// As [`LineIndex::close`].
  pub fn close(self) -> Result<()> {
    self.index.close()
  }

  /// Drops the document without syncing it and deletes the swap file at `path` in `fs`.
  ///
  /// # Errors
  ///
  /// [`Error::Io`] if the file cannot be deleted.
  pub fn discard_with<S: FileSystem<File = F>>(self, fs: &mut S, path: &S::Path) -> Result<()> {
    let Buffer { index, .. } = self;
    // Releases the lock before the file goes away.
    drop(index);
    fs.delete(path).map_err(|source| Error::io("deleting the swap file", source))?;
    debug!("swap file deleted");
    Ok(())
  }

  /// Stops using the swap file and keeps the document in memory only.
  ///
  /// # Errors
  ///
  /// Errors reading the document into memory, in which case the swap file is kept.
  pub fn fall_back_to_memory(&mut self) -> Result<()> {
    if !self.index.is_persistent() {
      return Ok(());
    }
    match self.index.detach_file() {
      Ok(()) => {
        warn!(lines = self.line_count(), "swap file abandoned, document is kept in memory");
        self.warnings.push(Warning {
          kind: ErrorKind::IoFailure,
          message: "swap file is no longer used; changes will be lost on a crash".to_string(),
        });
        Ok(())
      }
      Err(e) => {
        Self::report(&mut self.warnings, &e);
        Err(e)
      }
    }
  }

  fn after_edit(&mut self, result: Result<()>) -> Result<()> {
    match &result {
      Ok(()) => {
        self.edits_since_sync += 1;
        self.auto_sync();
      }
      Err(e) => {
        Self::report(&mut self.warnings, e);
        if e.kind() == ErrorKind::IoFailure {
          // Whatever the fallback reports has already been recorded.
          let _ = self.fall_back_to_memory();
        }
      }
    }
    result
  }

  fn auto_sync(&mut self) {
    let Some(interval) = self.sync_interval else { return };
    if self.edits_since_sync < interval || !self.index.is_persistent() {
      return;
    }
    // Failed or not, retry only after another interval.
    self.edits_since_sync = 0;
    match self.index.sync() {
      Ok(stats) => debug!(blocks = stats.blocks_written, "automatic sync"),
      Err(e) => {
        warn!(error = %e, "automatic sync failed");
        self.warnings.push(Warning::from_error(&e));
      }
    }
  }

  fn report(warnings: &mut Vec<Warning>, e: &Error) {
    match e.kind() {
      ErrorKind::OutOfRange => error!(error = %e, "line number out of range"),
      ErrorKind::IoFailure | ErrorKind::Corrupt | ErrorKind::FormatMismatch | ErrorKind::OutOfMemory => {
        warn!(error = %e, "buffer operation failed");
        warnings.push(Warning::from_error(e));
      }
      _ => info!(error = %e, "buffer operation rejected"),
    }
  }
}
