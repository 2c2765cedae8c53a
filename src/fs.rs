// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! [`Filesystem`]: the top-level handle tying a [`BlockDevice`] to its
//! [`Superblock`] and exposing the operations that touch both — opening
//! and formatting, root management, and block allocation.
//!
//! Everything below this module (trees, roots, inodes, files,
//! directories) takes a `&mut Superblock` and a `&mut dyn BlockDevice` as
//! two separate parameters rather than going through `Filesystem`
//! directly, so that a caller juggling several open roots at once never
//! has to fight the borrow checker over one shared handle. `Filesystem`
//! itself is the convenient, single-owner front door most callers want.

use log::info;
use zerocopy::FromBytes;

use crate::allocator::{self, FbtContext, RhtContext};
use crate::block_io::{dread, dwrite, BlockDevice};
use crate::extent::Extent;
use crate::root::{self, Root, RootDescriptor};
use crate::status::{Error, Result};
use crate::superblock::{self, Header, Superblock};
use crate::version;

/// Size of each free-space chunk the free-block tree is seeded with on
/// format; the last chunk is whatever residual space remains.
const INITIAL_FREE_EXTENT_LENGTH: u64 = 2 * 1024 * 1024;

/// Tunables for [`Filesystem::format`]; everything else in the header is
/// derived from the device or from constants.
#[derive(Debug, Clone, Copy)]
pub struct FormatOptions {
    /// `cluster_size = 1 << cluster_size_exp`.
    pub cluster_size_exp: u8,
    /// The spare-cluster reservoir refills once it drops to this level.
    pub sc_low_mark: u8,
    /// The spare-cluster reservoir never grows past this level.
    pub sc_high_mark: u8,
}

impl Default for FormatOptions {
    /// A 4 KiB cluster with an 8/16-cluster reservoir, generous enough for
    /// the allocator to never thrash between topping up and allocating.
    fn default() -> Self {
        Self { cluster_size_exp: 12, sc_low_mark: 8, sc_high_mark: 16 }
    }
}

/// Owns a device and the filesystem's superblock, and is the usual
/// entry point for opening or formatting one.
pub struct Filesystem {
    dev: Box<dyn BlockDevice>,
    sb: Superblock,
}

impl Filesystem {
    /// Opens an already-formatted filesystem, validating its header.
    ///
    /// Reads happen in two passes, since the spare-cluster reservoir's
    /// length (and therefore the size of the first cluster) is only known
    /// once the fixed header fields have been read: a first read of just
    /// `size_of::<Header>()` bytes to learn `header_size`/`cluster_size`,
    /// then a second read of the whole first cluster.
    pub fn open(mut dev: Box<dyn BlockDevice>) -> Result<Self> {
        let probe_len = std::mem::size_of::<Header>();
        let mut probe = vec![0u8; probe_len];
        dread(dev.as_mut(), &mut probe, 0)?;

        let unchecked =
            Header::read_from_bytes(&probe).map_err(|_| Error::Misaligned)?;
        // Bounded rather than trusted outright: a corrupt `header_size`
        // shouldn't make an `open()` on garbage input allocate wildly.
        // `Header::validate` rejects the header below as `HeaderTooBig` if
        // this bound still isn't enough to hold it.
        const MAX_HEADER_SIZE: usize = 64 * 1024;
        let header_size = (unchecked.header_size as usize).clamp(probe_len, MAX_HEADER_SIZE);

        let mut header_bytes = probe;
        if header_size > header_bytes.len() {
            header_bytes.resize(header_size, 0);
            dread(dev.as_mut(), &mut header_bytes[probe_len..], probe_len as u64)?;
        }
        let header = Header::validate(&header_bytes)?;

        let mut cluster_bytes = vec![0u8; header.cluster_size as usize];
        dread(dev.as_mut(), &mut cluster_bytes, 0)?;

        let sb = Superblock::from_bytes(header, cluster_bytes)?;
        info!(
            "opened filesystem: cluster_size={} num_blocks={}",
            sb.header.cluster_size, sb.header.num_blocks
        );
        Ok(Self { dev, sb })
    }

    /// Formats `dev` as a brand-new, empty filesystem and opens it.
    ///
    /// Seeds the spare-cluster reservoir, initializes the free-block tree
    /// with the rest of the device split into [`INITIAL_FREE_EXTENT_LENGTH`]
    /// chunks, then initializes an empty root hash table. The header is
    /// flushed once at the end, after every tree is up.
    pub fn format(mut dev: Box<dyn BlockDevice>, options: FormatOptions) -> Result<Self> {
        let cluster_size = 1u32 << options.cluster_size_exp;
        let num_blocks = dev.size();

        let header = Header {
            magic: superblock::MAGIC,
            version: version::CURRENT,
            header_size: std::mem::size_of::<Header>() as u32,
            checksum: 0,
            cluster_size,
            cluster_size_exp: options.cluster_size_exp,
            sc_low_mark: options.sc_low_mark,
            sc_high_mark: options.sc_high_mark,
            sc_count: 0,
            num_blocks,
            fbt_address: 0,
            rht_address: 0,
            flags: 0,
        };

        let bytes_len = std::mem::size_of::<Header>()
            + options.sc_high_mark as usize * std::mem::size_of::<Extent>();
        let mut sb = Superblock::from_bytes(header, vec![0u8; bytes_len])?;

        for i in 0..options.sc_high_mark {
            sb.set_spare_cluster(
                i as usize,
                Extent::new((i as u64 + 1) * cluster_size as u64, cluster_size as u64),
            );
        }
        sb.header.sc_count = options.sc_high_mark;

        let dyn_start = (options.sc_high_mark as u64 + 1) * cluster_size as u64;
        if dyn_start > num_blocks {
            return Err(Error::NoSpace);
        }
        let mut remaining = num_blocks - dyn_start;

        let mut fbt = allocator::open_fbt(&sb);
        {
            let mut ctx = FbtContext::new(&mut sb);
            fbt.init(dev.as_mut(), &mut ctx)?;
        }

        let mut cursor = dyn_start;
        while remaining > INITIAL_FREE_EXTENT_LENGTH {
            let extent = Extent::new(cursor, INITIAL_FREE_EXTENT_LENGTH);
            let mut ctx = FbtContext::new(&mut sb);
            fbt.insert(dev.as_mut(), &mut ctx, extent.length, &extent, false)?;
            cursor += INITIAL_FREE_EXTENT_LENGTH;
            remaining -= INITIAL_FREE_EXTENT_LENGTH;
        }
        if remaining > 0 {
            let extent = Extent::new(cursor, remaining);
            let mut ctx = FbtContext::new(&mut sb);
            fbt.insert(dev.as_mut(), &mut ctx, extent.length, &extent, false)?;
        }

        let mut rht = root::open_rht(&sb);
        {
            let mut ctx = RhtContext::new(&mut sb);
            rht.init(dev.as_mut(), &mut ctx)?;
        }

        sb.sync_header_into_bytes();
        dwrite(dev.as_mut(), sb.bytes(), 0)?;

        info!("formatted filesystem: cluster_size={} num_blocks={}", cluster_size, num_blocks);
        Ok(Self { dev, sb })
    }

    /// Flushes the superblock's owned buffer to disk. Every mutating
    /// method on this handle already does this; exposed for callers that
    /// bypass `Filesystem` to mutate `superblock_mut()`/`device_mut()`
    /// directly and need to flush afterward.
    pub fn sync(&mut self) -> Result<()> {
        self.sb.sync_header_into_bytes();
        dwrite(self.dev.as_mut(), self.sb.bytes(), 0)
    }

    /// Borrows the superblock and device together, for operations (root,
    /// file, directory, tree) that take both as separate parameters.
    pub fn parts(&mut self) -> (&mut Superblock, &mut dyn BlockDevice) {
        (&mut self.sb, self.dev.as_mut())
    }

    pub fn superblock(&self) -> &Superblock {
        &self.sb
    }

    pub fn device_mut(&mut self) -> &mut dyn BlockDevice {
        self.dev.as_mut()
    }

    /// Reclaims the underlying device, e.g. to reopen it and confirm a
    /// formatted or mutated filesystem validates from scratch.
    pub fn into_device(self) -> Box<dyn BlockDevice> {
        self.dev
    }

    pub fn count_roots(&mut self) -> Result<u64> {
        let (sb, dev) = self.parts();
        root::count_roots(sb, dev)
    }

    pub fn collect_roots(&mut self) -> Result<Vec<RootDescriptor>> {
        let (sb, dev) = self.parts();
        root::collect_roots(sb, dev)
    }

    pub fn find_root(&mut self, label: &str) -> Result<RootDescriptor> {
        let (sb, dev) = self.parts();
        root::find_root(sb, dev, label)
    }

    /// Adds a new root descriptor and initializes its inode trees.
    pub fn create_root(&mut self, descriptor: RootDescriptor) -> Result<Root> {
        {
            let (sb, dev) = self.parts();
            root::add_root(sb, dev, descriptor)?;
        }
        let mut r = Root::new(descriptor);
        let (sb, dev) = self.parts();
        r.init(sb, dev)?;
        Ok(r)
    }

    pub fn open_root(&mut self, label: &str) -> Result<Root> {
        let descriptor = self.find_root(label)?;
        Ok(Root::new(descriptor))
    }

    pub fn update_root(&mut self, descriptor: &RootDescriptor) -> Result<()> {
        let (sb, dev) = self.parts();
        root::update_root(sb, dev, descriptor)
    }

    pub fn remove_root(&mut self, label: &str) -> Result<RootDescriptor> {
        let (sb, dev) = self.parts();
        root::remove_root(sb, dev, label)
    }

    pub fn allocate_blocks(&mut self, length: u64) -> Result<Extent> {
        let (sb, dev) = self.parts();
        allocator::allocate_blocks(sb, dev, length)
    }

    pub fn free_blocks(&mut self, extent: Extent) -> Result<()> {
        let (sb, dev) = self.parts();
        allocator::free_blocks(sb, dev, extent)
    }

    pub fn count_free_blocks(&mut self) -> Result<allocator::FreeSpaceReport> {
        let (sb, dev) = self.parts();
        allocator::count_free_blocks(sb, dev)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block_io::MemDevice;

    fn small_options() -> FormatOptions {
        FormatOptions { cluster_size_exp: 12, sc_low_mark: 2, sc_high_mark: 4 }
    }

    fn init_logging() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    #[test]
    fn format_then_open_round_trip() {
        init_logging();
        let dev: Box<dyn BlockDevice> = Box::new(MemDevice::new(4096 * 4096));
        let fs = Filesystem::format(dev, small_options()).unwrap();
        let dev = fs.into_device();

        let reopened = Filesystem::open(dev).unwrap();
        assert_eq!(reopened.superblock().header.cluster_size, 4096);
        assert_eq!(reopened.superblock().header.sc_high_mark, 4);
    }

    #[test]
    fn create_root_survives_reopen() {
        let dev: Box<dyn BlockDevice> = Box::new(MemDevice::new(4096 * 4096));
        let mut fs = Filesystem::format(dev, small_options()).unwrap();

        let descriptor = RootDescriptor::new(
            "system",
            128,
            std::mem::size_of::<crate::inode::InodeHeader>() as u16,
            16 * 4096,
        );
        fs.create_root(descriptor).unwrap();

        let mut reopened = Filesystem::open(fs.into_device()).unwrap();
        let found = reopened.find_root("system").unwrap();
        assert_eq!(found.label(), "system");
    }

    #[test]
    fn format_seeds_free_space_in_chunks() {
        let dev: Box<dyn BlockDevice> = Box::new(MemDevice::new(4096 * 4096));
        let mut fs = Filesystem::format(dev, small_options()).unwrap();

        let report = fs.count_free_blocks().unwrap();
        assert!(report.available > 0);
        assert!(report.extents >= 1);
    }

    #[test]
    fn create_root_then_find_it() {
        let dev: Box<dyn BlockDevice> = Box::new(MemDevice::new(4096 * 4096));
        let mut fs = Filesystem::format(dev, small_options()).unwrap();

        let descriptor = RootDescriptor::new(
            "system",
            128,
            std::mem::size_of::<crate::inode::InodeHeader>() as u16,
            16 * 4096,
        );
        fs.create_root(descriptor).unwrap();

        assert_eq!(fs.count_roots().unwrap(), 1);
        let found = fs.find_root("system").unwrap();
        assert_eq!(found.label(), "system");
    }

    #[test]
    fn allocate_and_free_blocks_through_filesystem() {
        let dev: Box<dyn BlockDevice> = Box::new(MemDevice::new(4096 * 4096));
        let mut fs = Filesystem::format(dev, small_options()).unwrap();

        let extent = fs.allocate_blocks(4096).unwrap();
        assert_eq!(extent.length, 4096);
        fs.free_blocks(extent).unwrap();
    }
}
