#![forbid(unsafe_code)]
//! Read-only ext2 driver core.
//!
//! The driver sits between a sector-addressed block device and
//! higher-level filesystem code. File contents live in per-inode managed
//! memory objects populated on demand: a reader locks a range of an
//! inode's frontal memory, the data servicer resolves the logical blocks
//! through the direct/indirect pointer chains (fusing physically
//! consecutive runs into single device reads), and the indirection chains
//! themselves are cached through two managed "window" objects, so a
//! deeply nested read is expressed as nested demand faults with caching
//! at every level.

mod fs;
mod geometry;
mod inode;
mod resolve;
mod service;

pub use bfs_ondisk::FileKind;
pub use fs::FileSystem;
pub use geometry::Geometry;
pub use inode::{DirEntry, Inode, InodeState, OpenFile};
