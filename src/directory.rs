// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Directories: a fixed-width label/inode-id pair stored in a per-directory
//! tree keyed by the xxHash64 of the label, tolerating collisions the same
//! way the root hash table does.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::allocator;
use crate::bmtree::{BmTree, TreeContext, TreeValue};
use crate::block_io::BlockDevice;
use crate::hash;
use crate::inode::Inode;
use crate::status::{ControlFlow, Error, Result};
use crate::superblock::Superblock;

pub const MAX_LABEL_LENGTH: usize = 256;
pub const MAX_COLLISIONS: usize = 32;

/// One directory entry: a label and the inode id it names. Fixed at 32
/// bytes beyond the label so the whole thing comfortably fits in a block;
/// `const_assert!` below pins the total to 512 bytes or less.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct DirEntry {
    pub label: [u8; MAX_LABEL_LENGTH],
    pub inode_id: u128,
}

static_assertions::const_assert!(std::mem::size_of::<DirEntry>() <= 512);

impl DirEntry {
    pub fn new(label: &str, inode_id: u128) -> Self {
        let mut entry = DirEntry { label: [0u8; MAX_LABEL_LENGTH], inode_id };
        entry.set_label(label);
        entry
    }

    pub fn set_label(&mut self, label: &str) {
        self.label = [0u8; MAX_LABEL_LENGTH];
        let bytes = label.as_bytes();
        let len = bytes.len().min(MAX_LABEL_LENGTH - 1);
        self.label[..len].copy_from_slice(&bytes[..len]);
    }

    pub fn label(&self) -> &str {
        let end = self.label.iter().position(|&b| b == 0).unwrap_or(self.label.len());
        std::str::from_utf8(&self.label[..end]).unwrap_or("")
    }

    pub fn hash(&self) -> u64 {
        hash::hash_label(&self.label)
    }
}

impl PartialEq for DirEntry {
    fn eq(&self, other: &Self) -> bool {
        self.label() == other.label() && self.inode_id == other.inode_id
    }
}

impl TreeValue for DirEntry {
    fn to_bytes(&self, size: usize) -> Vec<u8> {
        let mut bytes = self.as_bytes().to_vec();
        bytes.resize(size, 0);
        bytes
    }

    fn from_bytes(bytes: &[u8]) -> Self {
        DirEntry::read_from_bytes(&bytes[..std::mem::size_of::<DirEntry>()])
            .expect("leaf value slice is at least sizeof(DirEntry) bytes")
    }
}

fn label_matches(candidate: &DirEntry, label: &str) -> bool {
    candidate.label() == label
}

/// A live handle onto one directory inode's entry tree.
pub struct Directory {
    pub inode: Inode,
}

impl Directory {
    pub fn new(inode: Inode) -> Self {
        Self { inode }
    }

    fn open_entries(&self, sb: &Superblock) -> BmTree<u64, DirEntry> {
        BmTree::new(self.inode.tree_root(), sb.cluster_size(), std::mem::size_of::<DirEntry>(), 32)
    }

    fn mutate_entries<R>(
        &mut self,
        sb: &mut Superblock,
        dev: &mut dyn BlockDevice,
        f: impl FnOnce(&mut BmTree<u64, DirEntry>, &mut dyn TreeContext, &mut dyn BlockDevice) -> Result<R>,
    ) -> Result<R> {
        let mut root_addr = self.inode.tree_root();
        let mut tree = BmTree::new(root_addr, sb.cluster_size(), std::mem::size_of::<DirEntry>(), 32);
        let result = {
            let mut ctx = allocator::normal_context(sb, &mut root_addr);
            f(&mut tree, &mut ctx, dev)
        };
        self.inode.set_tree_root(root_addr);
        result
    }

    /// Allocates the entry tree for a freshly created directory inode.
    pub fn init(&mut self, sb: &mut Superblock, dev: &mut dyn BlockDevice) -> Result<()> {
        self.mutate_entries(sb, dev, |tree, ctx, dev| tree.init(dev, ctx))
    }

    /// Looks a name up, scanning at most [`MAX_COLLISIONS`] same-hash
    /// entries before giving up.
    pub fn look_up(&self, sb: &Superblock, dev: &mut dyn BlockDevice, name: &str) -> Result<DirEntry> {
        let entries = self.open_entries(sb);
        let hash = hash::hash_label(name.as_bytes());
        let candidates = entries.search_all(dev, hash, MAX_COLLISIONS)?;
        candidates.into_iter().find(|c| label_matches(c, name)).ok_or(Error::NotFound)
    }

    pub fn insert(&mut self, sb: &mut Superblock, dev: &mut dyn BlockDevice, entry: DirEntry) -> Result<()> {
        if self.look_up(sb, dev, entry.label()).is_ok() {
            return Err(Error::Exists);
        }

        let hash = entry.hash();
        self.mutate_entries(sb, dev, |tree, ctx, dev| tree.insert(dev, ctx, hash, &entry, false))
    }

    /// Replaces an existing entry's inode id in place (e.g. after a rename
    /// that keeps the same label). Never changes the tree's shape.
    pub fn update(&mut self, sb: &mut Superblock, dev: &mut dyn BlockDevice, entry: DirEntry) -> Result<()> {
        let hash = entry.hash();
        let label = entry.label().to_string();
        let mut tree = self.open_entries(sb);
        tree.update(dev, hash, &entry, |existing| existing.label() == label)
    }

    pub fn remove(&mut self, sb: &mut Superblock, dev: &mut dyn BlockDevice, name: &str) -> Result<DirEntry> {
        let hash = hash::hash_label(name.as_bytes());
        let label = name.to_string();
        self.mutate_entries(sb, dev, |tree, ctx, dev| {
            tree.remove_matching(dev, ctx, hash, |existing| existing.label() == label)
        })
    }

    pub fn count(&self, sb: &Superblock, dev: &mut dyn BlockDevice) -> Result<u64> {
        self.open_entries(sb).count_values(dev)
    }

    pub fn collect(&self, sb: &Superblock, dev: &mut dyn BlockDevice) -> Result<Vec<DirEntry>> {
        let mut out = Vec::new();
        self.open_entries(sb).walk(dev, |_, entry: &DirEntry| {
            out.push(*entry);
            Ok(ControlFlow::Continue)
        })?;
        Ok(out)
    }

    /// Tears down the entry tree, freeing every node it allocated. Entries
    /// themselves carry no further resources to release (unlike a file's
    /// data extents), so a plain no-op consumer is correct here.
    pub fn destroy(&mut self, sb: &mut Superblock, dev: &mut dyn BlockDevice) -> Result<()> {
        let mut root_addr = self.inode.tree_root();
        {
            let mut tree: BmTree<u64, DirEntry> =
                BmTree::new(root_addr, sb.cluster_size(), std::mem::size_of::<DirEntry>(), 32);
            let mut ctx = allocator::normal_context(sb, &mut root_addr);
            tree.destroy(dev, &mut ctx, |_, _| Ok(ControlFlow::Continue))?;
        }
        self.inode.set_tree_root(root_addr);
        Ok(())
    }
}
