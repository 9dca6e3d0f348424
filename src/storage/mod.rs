//! # Storage layers
//!
//! From the bottom up: the file system interface, page layouts, the page cache, the block store,
//! and the line index built on top of it.

pub mod cache;
pub mod codec;
pub mod lines;
pub mod page;
pub mod paging;
pub mod recovery;
pub mod vfs;
