// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Roots: independently owned namespaces sharing one allocator and one
//! free-block tree.
//!
//! The root hash table (RHT) indexes every [`RootDescriptor`] on this
//! device by the xxHash64 of its label; each descriptor in turn owns two
//! inode trees (main and alternate stream) that this module also provides
//! the allocator glue for.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::allocator::{self, RhtContext};
use crate::bmtree::{BmTree, RootSink, TreeAllocator, TreeValue};
use crate::block_io::BlockDevice;
use crate::extent::Extent;
use crate::hash;
use crate::inode::{is_main_stream, InodeRecord};
use crate::status::{ControlFlow, Error, Result};
use crate::superblock::Superblock;

pub const MAX_LABEL_LENGTH: usize = 256;
pub const MAX_COLLISIONS: usize = 32;

/// A single root's on-disk descriptor: label, tunables and the two inode
/// tree roots it owns. Fixed at 512 bytes (one disk block), 16-byte
/// aligned.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct RootDescriptor {
    pub label: [u8; MAX_LABEL_LENGTH],
    pub flags: u64,
    pub owner: u128,
    pub inode_size: u16,
    pub inode_header_size: u16,
    pub max_extent_length: u32,
    pub int_address: u64,
    pub ait_address: u64,
    reserved: [u8; 208],
}

static_assertions::const_assert_eq!(std::mem::size_of::<RootDescriptor>(), 512);

impl RootDescriptor {
    pub fn new(label: &str, inode_size: u16, inode_header_size: u16, max_extent_length: u32) -> Self {
        let mut descriptor = RootDescriptor {
            label: [0u8; MAX_LABEL_LENGTH],
            flags: 0,
            owner: 0,
            inode_size,
            inode_header_size,
            max_extent_length,
            int_address: 0,
            ait_address: 0,
            reserved: [0u8; 208],
        };
        descriptor.set_label(label);
        descriptor
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

impl PartialEq for RootDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}

impl TreeValue for RootDescriptor {
    fn to_bytes(&self, size: usize) -> Vec<u8> {
        let mut bytes = self.as_bytes().to_vec();
        bytes.resize(size, 0);
        bytes
    }

    fn from_bytes(bytes: &[u8]) -> Self {
        RootDescriptor::read_from_bytes(&bytes[..std::mem::size_of::<RootDescriptor>()])
            .expect("leaf value slice is at least sizeof(RootDescriptor) bytes")
    }
}

/// The root hash table: [`RootDescriptor`]s keyed by the xxHash64 of their
/// label, tolerating collisions the same way every other tree here does.
pub type RootHashTree = BmTree<u64, RootDescriptor>;

pub fn open_rht(sb: &Superblock) -> RootHashTree {
    BmTree::new(sb.header.rht_address, sb.cluster_size(), std::mem::size_of::<RootDescriptor>(), 32)
}

fn label_matches(candidate: &RootDescriptor, label: &str) -> bool {
    candidate.label() == label
}

pub fn find_root(sb: &Superblock, dev: &mut dyn BlockDevice, label: &str) -> Result<RootDescriptor> {
    if sb.header.rht_address == 0 {
        return Err(Error::NoRht);
    }
    let rht = open_rht(sb);
    let hash = hash::hash_label(label.as_bytes());
    let candidates = rht.search_all(dev, hash, MAX_COLLISIONS)?;
    candidates
        .into_iter()
        .find(|c| label_matches(c, label))
        .ok_or(Error::NotFound)
}

pub fn count_roots(sb: &Superblock, dev: &mut dyn BlockDevice) -> Result<u64> {
    if sb.header.rht_address == 0 {
        return Ok(0);
    }
    open_rht(sb).count_values(dev)
}

pub fn collect_roots(sb: &Superblock, dev: &mut dyn BlockDevice) -> Result<Vec<RootDescriptor>> {
    if sb.header.rht_address == 0 {
        return Ok(Vec::new());
    }
    let mut out = Vec::new();
    open_rht(sb).walk(dev, |_, descriptor: &RootDescriptor| {
        out.push(*descriptor);
        Ok(ControlFlow::Continue)
    })?;
    Ok(out)
}

/// Inserts a freshly built descriptor into the root hash table. The label
/// must not already be in use.
pub fn add_root(sb: &mut Superblock, dev: &mut dyn BlockDevice, descriptor: RootDescriptor) -> Result<()> {
    if sb.header.rht_address == 0 {
        return Err(Error::NoRht);
    }
    if find_root(sb, dev, descriptor.label()).is_ok() {
        return Err(Error::Exists);
    }

    let hash = descriptor.hash();
    let mut rht = open_rht(sb);
    let mut ctx = RhtContext::new(sb);
    rht.insert(dev, &mut ctx, hash, &descriptor, false)
}

/// Rewrites an existing descriptor's entry in place (its inode tree roots
/// after they changed). Never changes the RHT's own shape, since the entry
/// is replaced by value rather than reinserted.
pub fn update_root(sb: &mut Superblock, dev: &mut dyn BlockDevice, descriptor: &RootDescriptor) -> Result<()> {
    let mut rht = open_rht(sb);
    let hash = descriptor.hash();
    let label = descriptor.label().to_string();
    rht.update(dev, hash, descriptor, |existing| existing.label() == label)
}

pub fn remove_root(sb: &mut Superblock, dev: &mut dyn BlockDevice, label: &str) -> Result<RootDescriptor> {
    let descriptor = find_root(sb, dev, label)?;
    let hash = descriptor.hash();
    let mut rht = open_rht(sb);
    let mut ctx = RhtContext::new(sb);
    let label = label.to_string();
    rht.remove_matching(dev, &mut ctx, hash, |existing| existing.label() == label)
}

/// Which of a root's two inode trees an operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stream {
    Main,
    Alternate,
}

/// Allocates nodes for one of a root's inode trees through the general
/// allocator, writing the new root address back into the caller's
/// [`RootDescriptor`] rather than the superblock.
struct RootTreeContext<'a> {
    sb: &'a mut Superblock,
    descriptor: &'a mut RootDescriptor,
    stream: Stream,
}

impl<'a> RootTreeContext<'a> {
    fn new(sb: &'a mut Superblock, descriptor: &'a mut RootDescriptor, stream: Stream) -> Self {
        Self { sb, descriptor, stream }
    }
}

impl TreeAllocator for RootTreeContext<'_> {
    fn allocate_node(&mut self, dev: &mut dyn BlockDevice) -> Result<u64> {
        let cluster_size = self.sb.cluster_size();
        let extent = allocator::allocate_blocks(self.sb, dev, cluster_size)?;
        Ok(extent.offset)
    }

    fn free_node(&mut self, dev: &mut dyn BlockDevice, addr: u64) -> Result<()> {
        let cluster_size = self.sb.cluster_size();
        allocator::free_blocks(self.sb, dev, Extent::new(addr, cluster_size))
    }
}

impl RootSink for RootTreeContext<'_> {
    fn on_root_change(&mut self, new_root: u64) -> Result<()> {
        match self.stream {
            Stream::Main => self.descriptor.int_address = new_root,
            Stream::Alternate => self.descriptor.ait_address = new_root,
        }
        Ok(())
    }
}

/// A live handle onto one root: its descriptor plus the operations that
/// read and mutate its two inode trees.
pub struct Root {
    pub descriptor: RootDescriptor,
}

impl Root {
    pub fn new(descriptor: RootDescriptor) -> Self {
        Self { descriptor }
    }

    fn tree_for(&self, sb: &Superblock, stream: Stream) -> BmTree<u128, InodeRecord> {
        let address = match stream {
            Stream::Main => self.descriptor.int_address,
            Stream::Alternate => self.descriptor.ait_address,
        };
        BmTree::new(address, sb.cluster_size(), self.descriptor.inode_size as usize, 32)
    }

    fn stream_of(id: u128) -> Stream {
        if is_main_stream(id) {
            Stream::Main
        } else {
            Stream::Alternate
        }
    }

    /// Initializes both inode trees (called once, when a root is first
    /// created) and persists the resulting addresses into the RHT.
    pub fn init(&mut self, sb: &mut Superblock, dev: &mut dyn BlockDevice) -> Result<()> {
        for stream in [Stream::Main, Stream::Alternate] {
            let mut tree = self.tree_for(sb, stream);
            let mut ctx = RootTreeContext::new(sb, &mut self.descriptor, stream);
            tree.init(dev, &mut ctx)?;
        }
        update_root(sb, dev, &self.descriptor)
    }

    pub fn find_inode(&self, sb: &Superblock, dev: &mut dyn BlockDevice, id: u128) -> Result<InodeRecord> {
        let tree = self.tree_for(sb, Self::stream_of(id));
        tree.search(dev, id)
    }

    /// Builds a zeroed inode record sized for this root's configured
    /// `inode_size`, ready to be filled in via [`InodeHeaderBuilder`] and
    /// passed to [`Root::insert_inode`].
    ///
    /// [`InodeHeaderBuilder`]: crate::inode::InodeHeaderBuilder
    pub fn create_inode_header(&self) -> InodeRecord {
        InodeRecord::zeroed(self.descriptor.inode_size as usize)
    }

    /// Inserts `record` under `id`, routing it into the main or alternate
    /// inode stream depending on `id`'s low six bits. The alternate stream
    /// accepts any id; a caller that intends `id` to live in the main
    /// stream (every id an [`InodeIdSource`] hands out, in particular)
    /// must already satisfy `id & 0b111111 == 0`, since that's the same
    /// bit pattern this method uses to pick a stream. Use
    /// [`Root::create_inode`] to generate and validate such an id in one
    /// step instead of constructing it by hand.
    ///
    /// [`InodeIdSource`]: crate::inode::InodeIdSource
    pub fn insert_inode(
        &mut self,
        sb: &mut Superblock,
        dev: &mut dyn BlockDevice,
        id: u128,
        record: &InodeRecord,
    ) -> Result<()> {
        let stream = Self::stream_of(id);
        let mut tree = self.tree_for(sb, stream);
        {
            let mut ctx = RootTreeContext::new(sb, &mut self.descriptor, stream);
            tree.insert(dev, &mut ctx, id, record, true)?;
        }
        update_root(sb, dev, &self.descriptor)
    }

    /// Draws a fresh id from `source` and inserts `record` under it in the
    /// main stream, rejecting an id that violates the main-stream
    /// invariant before it ever reaches the tree. A conforming
    /// [`InodeIdSource`] can never trip this, but nothing in the trait
    /// itself guarantees that.
    ///
    /// [`InodeIdSource`]: crate::inode::InodeIdSource
    pub fn create_inode(
        &mut self,
        sb: &mut Superblock,
        dev: &mut dyn BlockDevice,
        source: &mut dyn crate::inode::InodeIdSource,
        record: &InodeRecord,
    ) -> Result<u128> {
        let id = source.next_main_stream_id();
        if !is_main_stream(id) {
            return Err(Error::InvalidArgument);
        }
        self.insert_inode(sb, dev, id, record)?;
        Ok(id)
    }

    /// Replaces an existing inode's record in place. Never changes a
    /// tree's shape, so it never needs to touch the RHT.
    pub fn update_inode(
        &mut self,
        sb: &mut Superblock,
        dev: &mut dyn BlockDevice,
        id: u128,
        record: &InodeRecord,
    ) -> Result<()> {
        let mut tree = self.tree_for(sb, Self::stream_of(id));
        tree.update(dev, id, record, |_| true)
    }

    pub fn remove_inode(
        &mut self,
        sb: &mut Superblock,
        dev: &mut dyn BlockDevice,
        id: u128,
    ) -> Result<InodeRecord> {
        let stream = Self::stream_of(id);
        let mut tree = self.tree_for(sb, stream);
        let removed = {
            let mut ctx = RootTreeContext::new(sb, &mut self.descriptor, stream);
            tree.remove(dev, &mut ctx, id)?
        };
        update_root(sb, dev, &self.descriptor)?;
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::FbtContext;
    use crate::block_io::MemDevice;
    use crate::inode::InodeHeader;
    use crate::superblock::Header;
    use crate::version;

    fn fresh_fs() -> (Superblock, MemDevice) {
        let sc_high_mark = 8u8;
        let header = Header {
            magic: crate::superblock::MAGIC,
            version: version::CURRENT,
            header_size: std::mem::size_of::<Header>() as u32,
            checksum: 0,
            cluster_size: 4096,
            cluster_size_exp: 12,
            sc_low_mark: sc_high_mark / 2,
            sc_high_mark,
            sc_count: 0,
            num_blocks: 16384,
            fbt_address: 0,
            rht_address: 0,
            flags: 0,
        };
        let total = std::mem::size_of::<Header>() + sc_high_mark as usize * std::mem::size_of::<Extent>();
        let mut sb = Superblock::from_bytes(header, vec![0u8; total]).unwrap();
        let mut dev = MemDevice::new(4096 * 16384);

        for i in 0..sc_high_mark {
            sb.set_spare_cluster(i as usize, Extent::new((i as u64 + 1) * 4096, 4096));
        }
        sb.header.sc_count = sc_high_mark;

        let mut fbt = allocator::open_fbt(&sb);
        let mut ctx = FbtContext::new(&mut sb);
        fbt.init(&mut dev, &mut ctx).unwrap();

        let dyn_start = (sc_high_mark as u64 + 1) * 4096;
        let remaining = 4096 * 16384 - dyn_start;
        fbt.insert(&mut dev, &mut ctx, remaining, &Extent::new(dyn_start, remaining), false).unwrap();

        let mut rht = open_rht(&sb);
        let mut rht_ctx = RhtContext::new(&mut sb);
        rht.init(&mut dev, &mut rht_ctx).unwrap();

        (sb, dev)
    }

    #[test]
    fn add_and_find_root_round_trip() {
        let (mut sb, mut dev) = fresh_fs();
        let descriptor = RootDescriptor::new(
            "system",
            128,
            std::mem::size_of::<InodeHeader>() as u16,
            16 * 4096,
        );

        add_root(&mut sb, &mut dev, descriptor).unwrap();
        let found = find_root(&sb, &mut dev, "system").unwrap();
        assert_eq!(found.label(), "system");
        assert_eq!(add_root(&mut sb, &mut dev, descriptor).unwrap_err(), Error::Exists);
    }

    #[test]
    fn root_init_and_inode_round_trip() {
        let (mut sb, mut dev) = fresh_fs();
        let descriptor = RootDescriptor::new(
            "system",
            128,
            std::mem::size_of::<InodeHeader>() as u16,
            16 * 4096,
        );
        add_root(&mut sb, &mut dev, descriptor).unwrap();
        let mut root = Root::new(find_root(&sb, &mut dev, "system").unwrap());
        root.init(&mut sb, &mut dev).unwrap();

        let mut record = InodeRecord::zeroed(root.descriptor.inode_size as usize);
        let header = InodeHeader {
            created: crate::inode::Timestamp::ZERO,
            last_modified: crate::inode::Timestamp::ZERO,
            owner: 0,
            group: 0,
            num_links: 1,
            kind: crate::inode::InodeType::Directory as u16,
            flags: 0,
            mode: 0o755,
            file_size: 0,
            checksum: 0,
        };
        record.set_header(&header);

        root.insert_inode(&mut sb, &mut dev, crate::inode::ROOT_DIR_INODE_ID, &record).unwrap();
        let found = root.find_inode(&sb, &mut dev, crate::inode::ROOT_DIR_INODE_ID).unwrap();
        assert_eq!(found.header().mode, 0o755);

        let mut updated = found.clone();
        let mut updated_header = updated.header();
        updated_header.mode = 0o700;
        updated.set_header(&updated_header);
        root.update_inode(&mut sb, &mut dev, crate::inode::ROOT_DIR_INODE_ID, &updated).unwrap();
        let found = root.find_inode(&sb, &mut dev, crate::inode::ROOT_DIR_INODE_ID).unwrap();
        assert_eq!(found.header().mode, 0o700);

        root.remove_inode(&mut sb, &mut dev, crate::inode::ROOT_DIR_INODE_ID).unwrap();
        assert_eq!(
            root.find_inode(&sb, &mut dev, crate::inode::ROOT_DIR_INODE_ID).unwrap_err(),
            Error::NotFound
        );
    }

    struct CountingIdSource(u128);

    impl crate::inode::InodeIdSource for CountingIdSource {
        fn next_main_stream_id(&mut self) -> u128 {
            self.0 += 64;
            self.0
        }
    }

    struct BadIdSource;

    impl crate::inode::InodeIdSource for BadIdSource {
        fn next_main_stream_id(&mut self) -> u128 {
            1025
        }
    }

    #[test]
    fn create_inode_generates_and_validates_main_stream_id() {
        let (mut sb, mut dev) = fresh_fs();
        let descriptor = RootDescriptor::new(
            "system",
            128,
            std::mem::size_of::<InodeHeader>() as u16,
            16 * 4096,
        );
        add_root(&mut sb, &mut dev, descriptor).unwrap();
        let mut root = Root::new(find_root(&sb, &mut dev, "system").unwrap());
        root.init(&mut sb, &mut dev).unwrap();

        let record = root.create_inode_header();
        assert_eq!(record.len(), root.descriptor.inode_size as usize);

        let mut source = CountingIdSource(crate::inode::ROOT_DIR_INODE_ID);
        let id = root.create_inode(&mut sb, &mut dev, &mut source, &record).unwrap();
        assert!(crate::inode::is_main_stream(id));
        root.find_inode(&sb, &mut dev, id).unwrap();

        let mut bad = BadIdSource;
        assert_eq!(
            root.create_inode(&mut sb, &mut dev, &mut bad, &record).unwrap_err(),
            Error::InvalidArgument
        );
    }
}
