//! # Error handling
//!
//! All fallible operations return [`Result`]. Errors raised by the block store propagate through the
//! line index unchanged in kind; the line index only wraps them in [`Error::Context`] to name the
//! logical operation that failed. Use [`Error::kind`] to classify an error regardless of wrapping.

use crate::storage::page::BlockId;
use std::fmt;
use std::io;
use thiserror::Error;

/// Result type alias for swapline operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Primary error type.
#[derive(Error, Debug)]
pub enum Error {
  /// A line number outside the document. Always a caller bug, never a corruption.
  #[error("line {line} is out of range (document has {count} lines)")]
  OutOfRange { line: u64, count: u64 },

  /// A single line too long to fit in one data page.
  #[error("line of {len} bytes exceeds the maximum of {max} bytes")]
  TooLarge { len: usize, max: usize },

  #[error("I/O failure while {context}: {source}")]
  Io {
    context: String,
    #[source]
    source: io::Error,
  },

  /// The backing file is not a swap file of a format this crate understands.
  #[error("format mismatch: {0}")]
  FormatMismatch(String),

  /// A structural invariant was violated by data read back from the backing file.
  #[error("corrupt swap file: {0}")]
  Corrupt(String),

  #[error("block {0} not found")]
  NotFound(BlockId),

  #[error("out of memory: {0}")]
  OutOfMemory(String),

  #[error("invalid configuration: {0}")]
  Config(String),

  /// Names the logical operation during which the inner error happened.
  #[error("{op} failed: {source}")]
  Context {
    op: &'static str,
    #[source]
    source: Box<Error>,
  },
}

/// Coarse classification of an [`Error`], stable under [`Error::Context`] wrapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
  OutOfRange,
  TooLarge,
  IoFailure,
  FormatMismatch,
  Corrupt,
  NotFound,
  OutOfMemory,
  Config,
}

impl Error {
  pub(crate) fn io(context: impl Into<String>, source: io::Error) -> Self {
    Error::Io { context: context.into(), source }
  }

  /// Returns the kind of the innermost error.
  pub fn kind(&self) -> ErrorKind {
    match self {
      Error::OutOfRange { .. } => ErrorKind::OutOfRange,
      Error::TooLarge { .. } => ErrorKind::TooLarge,
      Error::Io { .. } => ErrorKind::IoFailure,
      Error::FormatMismatch(_) => ErrorKind::FormatMismatch,
      Error::Corrupt(_) => ErrorKind::Corrupt,
      Error::NotFound(_) => ErrorKind::NotFound,
      Error::OutOfMemory(_) => ErrorKind::OutOfMemory,
      Error::Config(_) => ErrorKind::Config,
      Error::Context { source, .. } => source.kind(),
    }
  }

  /// Whether the store that produced this error should no longer be trusted.
  pub fn is_fatal(&self) -> bool {
    matches!(self.kind(), ErrorKind::Corrupt | ErrorKind::FormatMismatch)
  }
}

impl fmt::Display for ErrorKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      ErrorKind::OutOfRange => "out of range",
      ErrorKind::TooLarge => "too large",
      ErrorKind::IoFailure => "I/O failure",
      ErrorKind::FormatMismatch => "format mismatch",
      ErrorKind::Corrupt => "corrupt",
      ErrorKind::NotFound => "not found",
      ErrorKind::OutOfMemory => "out of memory",
      ErrorKind::Config => "configuration",
    };
    f.write_str(name)
  }
}

/// Attaches the name of a logical operation to an error.
pub(crate) trait ResultExt<T> {
  fn context(self, op: &'static str) -> Result<T>;
}

impl<T> ResultExt<T> for Result<T> {
  fn context(self, op: &'static str) -> Result<T> {
    self.map_err(|source| match source {
      // Caller mistakes are reported as-is.
      Error::OutOfRange { .. } | Error::TooLarge { .. } | Error::Context { .. } => source,
      other => Error::Context { op, source: Box::new(other) },
    })
  }
}
