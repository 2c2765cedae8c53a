// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Regular files: small files carry their data inline in the inode record;
//! once a file outgrows that inline tail it switches to a data-extent tree
//! (the "IET") and reads/writes go through sparse, possibly multi-extent
//! storage instead.

use crate::allocator;
use crate::block_io::{dread, dwrite, BlockDevice};
use crate::bmtree::{BmTree, TreeContext};
use crate::extent::{DataExtent, Extent};
use crate::inode::{Inode, InodeFlags};
use crate::root::Root;
use crate::status::{ControlFlow, Error, Result};
use crate::superblock::Superblock;

/// Size of the scratch buffer used to zero-fill an extent before it's
/// freed, so a single allocation serves extents of any length.
const ZERO_FILL_CHUNK: u64 = 64 * 1024;

/// Overwrites `extent` with zeroes. Used when a file's
/// [`InodeFlags::ZERO_AT_DELETION`] flag is set, so that freed blocks
/// never leak the previous owner's data to whoever the allocator hands
/// them to next.
fn zero_extent(dev: &mut dyn BlockDevice, extent: Extent) -> Result<()> {
    let zeros = vec![0u8; ZERO_FILL_CHUNK.min(extent.length.max(1)) as usize];
    let mut offset = extent.offset;
    let end = extent.end();
    while offset < end {
        let chunk = (end - offset).min(zeros.len() as u64) as usize;
        dwrite(dev, &zeros[..chunk], offset)?;
        offset += chunk as u64;
    }
    Ok(())
}

/// The size of a small file's first (and only) extent when it first
/// outgrows its inline tail. Kept deliberately small so later writes past
/// it trigger the upgrade-to-cluster path rather than wasting a whole
/// cluster on a file that barely crossed the threshold.
const BLOCK_SIZE: u64 = 512;

fn next_multiple_of(value: u64, multiple: u64) -> u64 {
    value.div_ceil(multiple) * multiple
}

fn previous_multiple_of(value: u64, multiple: u64) -> u64 {
    (value / multiple) * multiple
}

/// A regular file, addressed through its inode.
pub struct File {
    pub inode: Inode,
}

impl File {
    pub fn new(inode: Inode) -> Self {
        Self { inode }
    }

    pub fn get_size(&self) -> u64 {
        self.inode.header().file_size
    }

    fn data_capacity(&self, root: &Root) -> u64 {
        (root.descriptor.inode_size - root.descriptor.inode_header_size) as u64
    }

    fn open_iet(&self, sb: &Superblock) -> BmTree<u64, DataExtent> {
        BmTree::new(self.inode.tree_root(), sb.cluster_size(), std::mem::size_of::<DataExtent>(), 32)
    }

    /// Runs `f` against a fresh handle onto the data-extent tree, writing
    /// back whatever new root address the operation produced into the
    /// inode's in-memory record. Does not itself persist the inode; callers
    /// that need the change on disk call [`File::persist`] afterward.
    fn mutate_iet<R>(
        &mut self,
        sb: &mut Superblock,
        dev: &mut dyn BlockDevice,
        f: impl FnOnce(&mut BmTree<u64, DataExtent>, &mut dyn TreeContext, &mut dyn BlockDevice) -> Result<R>,
    ) -> Result<R> {
        let mut root_addr = self.inode.tree_root();
        let mut tree = BmTree::new(root_addr, sb.cluster_size(), std::mem::size_of::<DataExtent>(), 32);
        let result = {
            let mut ctx = allocator::normal_context(sb, &mut root_addr);
            f(&mut tree, &mut ctx, dev)
        };
        self.inode.set_tree_root(root_addr);
        result
    }

    /// Tears the data-extent tree down, freeing every node it allocated
    /// and every extent it pointed to, returning the freed extents.
    fn destroy_iet(&mut self, sb: &mut Superblock, dev: &mut dyn BlockDevice) -> Result<Vec<DataExtent>> {
        let mut collected = Vec::new();
        {
            let iet = self.open_iet(sb);
            iet.walk(dev, |_, extent: &DataExtent| {
                collected.push(*extent);
                Ok(ControlFlow::Continue)
            })?;
        }

        let mut root_addr = self.inode.tree_root();
        {
            let mut tree = BmTree::new(root_addr, sb.cluster_size(), std::mem::size_of::<DataExtent>(), 32);
            let mut ctx = allocator::normal_context(sb, &mut root_addr);
            tree.destroy(dev, &mut ctx, |_, _| Ok(ControlFlow::Continue))?;
        }
        self.inode.set_tree_root(root_addr);

        let zero_first = self.inode.header().flags().contains(InodeFlags::ZERO_AT_DELETION);
        for extent in &collected {
            if zero_first {
                zero_extent(dev, extent.as_extent())?;
            }
            allocator::free_blocks(sb, dev, extent.as_extent())?;
        }

        Ok(collected)
    }

    fn persist(&mut self, sb: &mut Superblock, dev: &mut dyn BlockDevice, root: &mut Root) -> Result<()> {
        root.update_inode(sb, dev, self.inode.id, &self.inode.record)
    }

    /// Reads up to `buf.len()` bytes starting at `offset`, returning the
    /// number of bytes actually read. Never reads past the end of the
    /// file; offsets inside holes between stored extents read back as
    /// zeroes.
    pub fn read(
        &self,
        sb: &Superblock,
        dev: &mut dyn BlockDevice,
        root: &Root,
        buf: &mut [u8],
        offset: u64,
    ) -> Result<usize> {
        let size = self.get_size();
        if offset > size {
            return Err(Error::BeyondEof);
        }

        let end = size.min(offset + buf.len() as u64);
        let true_count = (end - offset) as usize;
        if true_count == 0 {
            return Ok(0);
        }

        let data_capacity = self.data_capacity(root);
        if size <= data_capacity {
            let data = self.inode.private_data();
            let off = offset as usize;
            buf[..true_count].copy_from_slice(&data[off..off + true_count]);
            return Ok(true_count);
        }

        if self.inode.tree_root() == 0 {
            buf[..true_count].fill(0);
            return Ok(true_count);
        }

        let iet = self.open_iet(sb);
        let extent = match iet.search_first_ge(dev, offset) {
            Ok((_, extent)) => extent,
            Err(Error::NotFound) => {
                buf[..true_count].fill(0);
                return Ok(true_count);
            }
            Err(e) => return Err(e),
        };

        if offset < extent.local_start {
            let zero_count = (extent.local_start - offset).min(true_count as u64) as usize;
            buf[..zero_count].fill(0);
            return Ok(zero_count);
        }

        let local_offset = extent.relativize_local(offset);
        let read_count = (true_count as u64).min(extent.length - local_offset) as usize;
        dread(dev, &mut buf[..read_count], extent.offset + local_offset)?;
        Ok(read_count)
    }

    /// Writes `buf` starting at `offset`, growing the file first if
    /// necessary. Like [`File::read`], a single call may transfer fewer
    /// bytes than requested when the write spans more than one existing
    /// extent; callers loop until the whole buffer is consumed.
    pub fn write(
        &mut self,
        sb: &mut Superblock,
        dev: &mut dyn BlockDevice,
        root: &mut Root,
        buf: &[u8],
        offset: u64,
    ) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let count = buf.len() as u64;

        if offset + count > self.get_size() {
            self.truncate(sb, dev, root, offset + count)?;
        }

        let data_capacity = self.data_capacity(root);
        if self.get_size() <= data_capacity {
            let off = offset as usize;
            self.inode.private_data_mut()[off..off + buf.len()].copy_from_slice(buf);
            self.persist(sb, dev, root)?;
            return Ok(buf.len());
        }

        let iet = self.open_iet(sb);
        let found = iet.search_first_ge(dev, offset);
        let (offset_fits, mut candidate) = match found {
            Ok((_, extent)) => (true, Some(extent)),
            Err(Error::NotFound) => (false, None),
            Err(e) => return Err(e),
        };
        let extent_present = if offset_fits {
            true
        } else {
            match iet.get_last(dev) {
                Ok(extent) => {
                    candidate = Some(extent);
                    true
                }
                Err(Error::NotFound) => false,
                Err(e) => return Err(e),
            }
        };

        if !offset_fits && extent_present && candidate.unwrap().length == BLOCK_SIZE {
            // The file's only extent is still the small upgrade tail from
            // the small-to-big transition; grow it to a full cluster
            // before writing past it.
            let old_extent = candidate.unwrap();
            self.mutate_iet(sb, dev, |tree, ctx, dev| tree.remove(dev, ctx, old_extent.local_last()))?;

            let mut small_buf = vec![0u8; BLOCK_SIZE as usize];
            dread(dev, &mut small_buf, old_extent.offset)?;
            allocator::free_blocks(sb, dev, old_extent.as_extent())?;

            let cluster_size = sb.cluster_size();
            let new_raw_extent = allocator::allocate_blocks(sb, dev, cluster_size)?;
            let new_extent = DataExtent::new(new_raw_extent, old_extent.local_start);
            dwrite(dev, &small_buf, new_extent.offset)?;

            self.mutate_iet(sb, dev, |tree, ctx, dev| {
                tree.insert(dev, ctx, new_extent.local_last(), &new_extent, false)
            })?;
            candidate = Some(new_extent);
        }

        if let Some(extent) = candidate {
            if extent.contains_local(offset) {
                let relative_offset = extent.relativize_local(offset);
                let true_end = (offset + count).min(extent.local_end());
                let length = (true_end - offset) as usize;
                dwrite(dev, &buf[..length], extent.offset + relative_offset)?;
                return Ok(length);
            }
        }

        // The write falls in a hole before or after every existing extent:
        // carve out a new cluster-aligned extent for it.
        let cluster_size = sb.cluster_size();
        let max_extent_length = root.descriptor.max_extent_length as u64;
        let aligned_end = next_multiple_of(offset + count, cluster_size);
        let aligned_offset = previous_multiple_of(offset, cluster_size);
        let aligned_length = (aligned_end - aligned_offset).min(max_extent_length);

        let raw_new_extent = allocator::allocate_blocks(sb, dev, aligned_length)?;
        let local_offset = offset - aligned_offset;
        let new_extent = DataExtent::new(raw_new_extent, aligned_offset);
        dwrite(dev, buf, new_extent.offset + local_offset)?;

        self.mutate_iet(sb, dev, |tree, ctx, dev| {
            tree.insert(dev, ctx, new_extent.local_last(), &new_extent, false)
        })?;

        Ok(buf.len())
    }

    /// Resizes the file to exactly `new_size`, handling all four
    /// small/big transitions.
    pub fn truncate(
        &mut self,
        sb: &mut Superblock,
        dev: &mut dyn BlockDevice,
        root: &mut Root,
        new_size: u64,
    ) -> Result<()> {
        let old_size = self.get_size();
        if old_size == new_size {
            return Ok(());
        }

        let data_capacity = self.data_capacity(root);
        let old_is_big = old_size > data_capacity;
        let new_is_big = new_size > data_capacity;

        match (old_is_big, new_is_big) {
            (false, false) => self.resize_small_to_small(sb, dev, root, new_size),
            (false, true) => self.resize_small_to_big(sb, dev, root, old_size, new_size),
            (true, false) => self.resize_big_to_small(sb, dev, root, new_size),
            (true, true) => self.resize_big_to_big(sb, dev, root, old_size, new_size),
        }
    }

    fn resize_small_to_small(
        &mut self,
        sb: &mut Superblock,
        dev: &mut dyn BlockDevice,
        root: &mut Root,
        new_size: u64,
    ) -> Result<()> {
        let cap = self.data_capacity(root) as usize;
        self.inode.private_data_mut()[new_size as usize..cap].fill(0);

        let mut header = self.inode.header();
        header.file_size = new_size;
        self.inode.set_header(&header);
        self.persist(sb, dev, root)
    }

    fn resize_small_to_big(
        &mut self,
        sb: &mut Superblock,
        dev: &mut dyn BlockDevice,
        root: &mut Root,
        old_size: u64,
        new_size: u64,
    ) -> Result<()> {
        let mut buf = vec![0u8; BLOCK_SIZE as usize];
        buf[..old_size as usize].copy_from_slice(&self.inode.private_data()[..old_size as usize]);

        self.mutate_iet(sb, dev, |tree, ctx, dev| tree.init(dev, ctx))?;

        let block_extent = allocator::allocate_blocks(sb, dev, BLOCK_SIZE)?;
        dwrite(dev, &buf, block_extent.offset)?;

        let mut header = self.inode.header();
        header.file_size = new_size;
        self.inode.set_header(&header);
        // Stored before the extent is indexed: a crash here leaves a
        // reachable inode pointing at an empty, re-initialized tree,
        // rather than a tree entry no inode yet refers to.
        self.persist(sb, dev, root)?;

        let data_extent = DataExtent::new(block_extent, 0);
        self.mutate_iet(sb, dev, |tree, ctx, dev| {
            tree.insert(dev, ctx, data_extent.local_last(), &data_extent, false)
        })?;

        Ok(())
    }

    fn resize_big_to_small(
        &mut self,
        sb: &mut Superblock,
        dev: &mut dyn BlockDevice,
        root: &mut Root,
        new_size: u64,
    ) -> Result<()> {
        let mut buf = vec![0u8; new_size as usize];
        let mut copied = 0usize;
        while copied < buf.len() {
            let n = self.read(sb, dev, root, &mut buf[copied..], copied as u64)?;
            if n == 0 {
                break;
            }
            copied += n;
        }

        self.destroy_iet(sb, dev)?;

        self.inode.private_data_mut()[..new_size as usize].copy_from_slice(&buf[..new_size as usize]);
        let mut header = self.inode.header();
        header.file_size = new_size;
        self.inode.set_header(&header);
        self.persist(sb, dev, root)
    }

    fn resize_big_to_big(
        &mut self,
        sb: &mut Superblock,
        dev: &mut dyn BlockDevice,
        root: &mut Root,
        old_size: u64,
        new_size: u64,
    ) -> Result<()> {
        if new_size > old_size {
            let mut header = self.inode.header();
            header.file_size = new_size;
            self.inode.set_header(&header);
            return self.persist(sb, dev, root);
        }

        let zero_first = self.inode.header().flags().contains(InodeFlags::ZERO_AT_DELETION);
        let mut ptr = new_size;
        while ptr < old_size {
            let found = {
                let iet = self.open_iet(sb);
                iet.search_first_ge(dev, ptr)
            };
            let extent = match found {
                Ok((_, extent)) => extent,
                Err(Error::NotFound) => break,
                Err(e) => return Err(e),
            };

            if extent.local_start < new_size {
                // This extent straddles the new end of the file; its tail
                // past `new_size` is simply never read again.
                if zero_first {
                    let tail_len = extent.local_end() - new_size;
                    let tail_offset = extent.offset + extent.relativize_local(new_size);
                    zero_extent(dev, Extent::new(tail_offset, tail_len))?;
                }
                ptr = extent.local_end();
                continue;
            }

            if zero_first {
                zero_extent(dev, extent.as_extent())?;
            }
            self.mutate_iet(sb, dev, |tree, ctx, dev| tree.remove(dev, ctx, extent.local_last()))?;
            allocator::free_blocks(sb, dev, extent.as_extent())?;
            ptr = extent.local_end();
        }

        let mut header = self.inode.header();
        header.file_size = new_size;
        self.inode.set_header(&header);
        self.persist(sb, dev, root)
    }

    /// Shrinks the file to zero, freeing everything it owns.
    pub fn destroy(&mut self, sb: &mut Superblock, dev: &mut dyn BlockDevice, root: &mut Root) -> Result<()> {
        self.truncate(sb, dev, root, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block_io::MemDevice;
    use crate::extent::Extent;
    use crate::inode::{InodeHeader, InodeRecord, InodeType, Timestamp};
    use crate::root::{self, RootDescriptor};
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
            num_blocks: 65536,
            fbt_address: 0,
            rht_address: 0,
            flags: 0,
        };
        let total = std::mem::size_of::<Header>() + sc_high_mark as usize * std::mem::size_of::<Extent>();
        let mut sb = Superblock::from_bytes(header, vec![0u8; total]).unwrap();
        let mut dev = MemDevice::new(4096 * 65536);

        for i in 0..sc_high_mark {
            sb.set_spare_cluster(i as usize, Extent::new((i as u64 + 1) * 4096, 4096));
        }
        sb.header.sc_count = sc_high_mark;

        let mut fbt = allocator::open_fbt(&sb);
        let mut ctx = allocator::FbtContext::new(&mut sb);
        fbt.init(&mut dev, &mut ctx).unwrap();

        let dyn_start = (sc_high_mark as u64 + 1) * 4096;
        let remaining = 4096 * 65536 - dyn_start;
        fbt.insert(&mut dev, &mut ctx, remaining, &Extent::new(dyn_start, remaining), false).unwrap();

        let mut rht = root::open_rht(&sb);
        let mut rht_ctx = allocator::RhtContext::new(&mut sb);
        rht.init(&mut dev, &mut rht_ctx).unwrap();

        (sb, dev)
    }

    fn fresh_file(sb: &mut Superblock, dev: &mut MemDevice) -> (Root, File) {
        let inode_header_size = std::mem::size_of::<InodeHeader>() as u16;
        let descriptor = RootDescriptor::new("system", 128, inode_header_size, 16 * 4096);
        root::add_root(sb, dev, descriptor).unwrap();
        let mut r = Root::new(root::find_root(sb, dev, "system").unwrap());
        r.init(sb, dev).unwrap();

        let mut record = InodeRecord::zeroed(r.descriptor.inode_size as usize);
        let mut header = InodeHeader {
            created: Timestamp::ZERO,
            last_modified: Timestamp::ZERO,
            owner: 0,
            group: 0,
            num_links: 1,
            kind: 0,
            flags: 0,
            mode: 0o644,
            file_size: 0,
            checksum: 0,
        };
        header.set_inode_type(InodeType::File);
        record.set_header(&header);

        let id = 64u128;
        r.insert_inode(sb, dev, id, &record).unwrap();
        let record = r.find_inode(sb, dev, id).unwrap();
        let inode = Inode::new(id, inode_header_size as usize, record);
        (r, File::new(inode))
    }

    #[test]
    fn small_file_write_read_round_trip() {
        let (mut sb, mut dev) = fresh_fs();
        let (mut root, mut file) = fresh_file(&mut sb, &mut dev);

        let payload = b"hello brufs";
        file.write(&mut sb, &mut dev, &mut root, payload, 0).unwrap();
        assert_eq!(file.get_size(), payload.len() as u64);

        let mut out = vec![0u8; payload.len()];
        let n = file.read(&sb, &mut dev, &root, &mut out, 0).unwrap();
        assert_eq!(n, payload.len());
        assert_eq!(&out, payload);
    }

    #[test]
    fn growing_past_inline_tail_promotes_to_extent_tree() {
        let (mut sb, mut dev) = fresh_fs();
        let (mut root, mut file) = fresh_file(&mut sb, &mut dev);

        let payload = vec![0xabu8; 200];
        let mut written = 0;
        while written < payload.len() {
            let n = file.write(&mut sb, &mut dev, &mut root, &payload[written..], written as u64).unwrap();
            assert!(n > 0);
            written += n;
        }
        assert_eq!(file.get_size(), 200);

        let mut out = vec![0u8; 200];
        let mut read = 0;
        while read < out.len() {
            let n = file.read(&sb, &mut dev, &root, &mut out[read..], read as u64).unwrap();
            assert!(n > 0);
            read += n;
        }
        assert_eq!(out, payload);
    }

    #[test]
    fn sparse_hole_reads_back_as_zero() {
        let (mut sb, mut dev) = fresh_fs();
        let (mut root, mut file) = fresh_file(&mut sb, &mut dev);

        // Force a big file, then write far past the current end so a hole
        // opens up between the inline-tail extent and the new data.
        let tail = vec![0x11u8; 100];
        let mut written = 0;
        while written < tail.len() {
            let n = file.write(&mut sb, &mut dev, &mut root, &tail[written..], written as u64).unwrap();
            written += n;
        }

        file.write(&mut sb, &mut dev, &mut root, b"far", 10_000).unwrap();
        assert_eq!(file.get_size(), 10_003);

        let mut hole = vec![0xffu8; 64];
        let n = file.read(&sb, &mut dev, &root, &mut hole, 500).unwrap();
        assert!(n > 0);
        assert!(hole[..n].iter().all(|&b| b == 0));
    }

    #[test]
    fn truncate_big_to_small_preserves_prefix() {
        let (mut sb, mut dev) = fresh_fs();
        let (mut root, mut file) = fresh_file(&mut sb, &mut dev);

        let payload = vec![0x42u8; 200];
        let mut written = 0;
        while written < payload.len() {
            let n = file.write(&mut sb, &mut dev, &mut root, &payload[written..], written as u64).unwrap();
            written += n;
        }

        file.truncate(&mut sb, &mut dev, &mut root, 10).unwrap();
        assert_eq!(file.get_size(), 10);

        let mut out = vec![0u8; 10];
        file.read(&sb, &mut dev, &root, &mut out, 0).unwrap();
        assert_eq!(out, vec![0x42u8; 10]);
    }

    #[test]
    fn destroy_frees_extents_and_zeroes_size() {
        let (mut sb, mut dev) = fresh_fs();
        let (mut root, mut file) = fresh_file(&mut sb, &mut dev);

        let payload = vec![0x7u8; 200];
        let mut written = 0;
        while written < payload.len() {
            let n = file.write(&mut sb, &mut dev, &mut root, &payload[written..], written as u64).unwrap();
            written += n;
        }

        let before = allocator::count_free_blocks(&sb, &mut dev).unwrap().available;
        file.destroy(&mut sb, &mut dev, &mut root).unwrap();
        let after = allocator::count_free_blocks(&sb, &mut dev).unwrap().available;

        assert_eq!(file.get_size(), 0);
        assert!(after >= before);
    }
}
