// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A block-addressable filesystem storage core.
//!
//! This crate implements the on-disk layout, allocator and indexing
//! structures of a small filesystem: a superblock with a spare-cluster
//! reservoir, a free-block tree, a root hash table, and per-root inode,
//! file and directory trees, all built on one generalized B+tree
//! ([`bmtree`]).
//!
//! Everything here talks to storage through [`block_io::BlockDevice`]; the
//! crate never opens a file or a raw device node itself. Higher layers
//! (a CLI, a FUSE bridge, an inode-id generator, path parsing) are
//! deliberately out of scope: this crate is the storage core they sit on
//! top of, not a complete filesystem driver.
//!
//! [`fs::Filesystem`] is the usual entry point: it owns a device and a
//! superblock and exposes root and block-allocation operations. Callers
//! that need finer control (e.g. running several operations against the
//! same superblock without re-flushing between each one) can work
//! directly with [`superblock::Superblock`], [`allocator`] and [`root`]
//! instead.

pub mod allocator;
pub mod block_io;
pub mod bmtree;
pub mod directory;
pub mod extent;
pub mod file;
pub mod fs;
pub mod hash;
pub mod inode;
pub mod root;
pub mod status;
pub mod superblock;
pub mod version;

pub use fs::{FormatOptions, Filesystem};
pub use status::{Error, Result};
