//! # Swapline
//!
//! A line-oriented, crash-recoverable text store for editor buffers.
//!
//! Lines live in a tree of fixed-size pages: pointer pages map line ranges to child pages and
//! data pages hold the line bytes. Pages are cached in memory and written back incrementally to a
//! swap file, so an abnormal termination loses at most the edits made after the last sync.
//!
//! The layers, bottom to top:
//!
//! - [`storage::vfs`]: the file system interface.
//! - [`storage::paging`]: the block store (page cache, eviction, write-back, free list).
//! - [`storage::lines`]: the line index (line-numbered tree over the block store).
//! - [`buffer`]: the editor-facing façade.

pub mod buffer;
pub mod config;
pub mod encoding;
pub mod error;
pub mod storage;

pub use buffer::{Buffer, Warning};
pub use config::Config;
pub use error::{Error, ErrorKind, Result};
pub use storage::lines::LineIndex;
pub use storage::paging::BlockStore;
