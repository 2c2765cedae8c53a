// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Free-space bookkeeping: the free-block tree (FBT) and the spare-cluster
//! reservoir that breaks its allocation recursion.
//!
//! Every tree in this filesystem except the FBT itself allocates its nodes
//! by asking the FBT for a cluster-sized extent ([`NormalContext`],
//! [`RhtContext`]). But the FBT needs clusters too, and searching the FBT
//! to satisfy the FBT's own node allocation would recurse forever. A small
//! reserved pool of pre-allocated clusters — the "spare cluster reservoir"
//! living in the superblock right after the header — breaks the cycle:
//! the FBT draws from it instead ([`FbtContext`]). Freeing a large-enough
//! extent tops the reservoir back up before whatever's left goes through
//! the normal path.

use log::warn;

use crate::bmtree::{BmTree, RootSink, TreeAllocator, TreeContext};
use crate::block_io::BlockDevice;
use crate::extent::Extent;
use crate::status::{Error, Result};
use crate::superblock::Superblock;

/// The free-block tree: extents keyed by their own length, so "find an
/// extent at least this big" is a single lower-bound search.
pub type FreeBlockTree = BmTree<u64, Extent>;

pub fn open_fbt(sb: &Superblock) -> FreeBlockTree {
    BmTree::new(sb.header.fbt_address, sb.cluster_size(), 16, 32)
}

/// Allocates the FBT's own nodes straight out of the spare-cluster
/// reservoir, never touching the FBT itself, and persists the FBT's root
/// address back into the superblock on change.
///
/// Bundled as a single [`TreeContext`] (rather than a separate allocator and
/// root sink) because both halves need exclusive access to the same
/// [`Superblock`], and a single mutating call can only hand out one such
/// borrow at a time.
pub struct FbtContext<'a> {
    sb: &'a mut Superblock,
}

impl<'a> FbtContext<'a> {
    pub fn new(sb: &'a mut Superblock) -> Self {
        Self { sb }
    }
}

impl TreeAllocator for FbtContext<'_> {
    fn allocate_node(&mut self, _dev: &mut dyn BlockDevice) -> Result<u64> {
        if self.sb.header.sc_count == 0 {
            return Err(Error::NoSpace);
        }
        self.sb.header.sc_count -= 1;
        let idx = self.sb.header.sc_count as usize;
        let spares = self.sb.spare_clusters();
        let extent = spares[idx];
        Ok(extent.offset)
    }

    fn free_node(&mut self, dev: &mut dyn BlockDevice, addr: u64) -> Result<()> {
        // A freed FBT node goes back through the general free path; it's
        // too large an extent to be worth special-casing into the
        // reservoir here, and `free_blocks` already tops the reservoir up
        // first if there's room.
        free_blocks(self.sb, dev, Extent::new(addr, self.sb.cluster_size()))
    }
}

impl RootSink for FbtContext<'_> {
    fn on_root_change(&mut self, new_root: u64) -> Result<()> {
        self.sb.header.fbt_address = new_root;
        Ok(())
    }
}

/// Allocates nodes for the root hash table via the general allocator (it
/// searches the FBT, which is safe here since the RHT is never the FBT
/// itself), persisting its root address into the same superblock it
/// allocates from. Bundled as one struct for the same reason as
/// [`FbtContext`]: allocator and sink both need the one `Superblock`.
pub struct RhtContext<'a> {
    sb: &'a mut Superblock,
}

impl<'a> RhtContext<'a> {
    pub fn new(sb: &'a mut Superblock) -> Self {
        Self { sb }
    }
}

impl TreeAllocator for RhtContext<'_> {
    fn allocate_node(&mut self, dev: &mut dyn BlockDevice) -> Result<u64> {
        let cluster_size = self.sb.cluster_size();
        let extent = allocate_blocks(self.sb, dev, cluster_size)?;
        Ok(extent.offset)
    }

    fn free_node(&mut self, dev: &mut dyn BlockDevice, addr: u64) -> Result<()> {
        let cluster_size = self.sb.cluster_size();
        free_blocks(self.sb, dev, Extent::new(addr, cluster_size))
    }
}

impl RootSink for RhtContext<'_> {
    fn on_root_change(&mut self, new_root: u64) -> Result<()> {
        self.sb.header.rht_address = new_root;
        Ok(())
    }
}

/// Allocates nodes for any other tree (an inode tree, a file's data-extent
/// tree, a directory's entry tree) via the general allocator, persisting
/// the new root address into a caller-owned `u64` slot that lives outside
/// the superblock (a field of a [`crate::root::RootDescriptor`] or an
/// inode's type-private area). Since the root slot here is never part of
/// `Superblock` itself, the two borrows never alias and can be held as two
/// plain disjoint fields.
pub struct NormalContext<'a> {
    sb: &'a mut Superblock,
    root_slot: &'a mut u64,
}

impl<'a> NormalContext<'a> {
    pub fn new(sb: &'a mut Superblock, root_slot: &'a mut u64) -> Self {
        Self { sb, root_slot }
    }
}

impl TreeAllocator for NormalContext<'_> {
    fn allocate_node(&mut self, dev: &mut dyn BlockDevice) -> Result<u64> {
        let cluster_size = self.sb.cluster_size();
        let extent = allocate_blocks(self.sb, dev, cluster_size)?;
        Ok(extent.offset)
    }

    fn free_node(&mut self, dev: &mut dyn BlockDevice, addr: u64) -> Result<()> {
        let cluster_size = self.sb.cluster_size();
        free_blocks(self.sb, dev, Extent::new(addr, cluster_size))
    }
}

impl RootSink for NormalContext<'_> {
    fn on_root_change(&mut self, new_root: u64) -> Result<()> {
        *self.root_slot = new_root;
        Ok(())
    }
}

/// Builds a general-purpose [`TreeContext`] for a tree whose root pointer
/// lives in a caller-owned slot outside the superblock.
pub fn normal_context<'a>(sb: &'a mut Superblock, root_slot: &'a mut u64) -> NormalContext<'a> {
    NormalContext::new(sb, root_slot)
}

/// Allocates exactly `length` bytes. `length` must be either 512 or a
/// multiple of the cluster size.
pub fn allocate_blocks(sb: &mut Superblock, dev: &mut dyn BlockDevice, length: u64) -> Result<Extent> {
    let cluster_size = sb.cluster_size();
    if length != 512 && length % cluster_size != 0 {
        return Err(Error::Misaligned);
    }

    let mut fbt = open_fbt(sb);
    let mut ctx = FbtContext::new(sb);
    let (_found_key, found) = fbt
        .remove_first_ge(dev, &mut ctx, length)
        .map_err(|e| if e == Error::NotFound { Error::WontFit } else { e })?;

    let target = Extent::new(found.offset, length);

    if found.length > length {
        let residual = Extent::new(found.offset + length, found.length - length);
        fbt.insert(dev, &mut ctx, residual.length, &residual, false)?;
    }

    top_up_spare_clusters(sb, dev, &mut fbt)?;
    sb.sync_header_into_bytes();

    Ok(target)
}

/// Tops the spare-cluster reservoir back up to `sc_low_mark` by pulling
/// cluster-sized pieces out of the FBT, splitting a single larger extent
/// across multiple reservoir slots as needed.
fn top_up_spare_clusters(sb: &mut Superblock, dev: &mut dyn BlockDevice, fbt: &mut FreeBlockTree) -> Result<()> {
    let cluster_size = sb.cluster_size();

    while sb.header.sc_count < sb.header.sc_low_mark {
        let found = {
            let mut ctx = FbtContext::new(sb);
            fbt.remove_first_ge(dev, &mut ctx, cluster_size)
        };

        let mut replacement = match found {
            Ok((_, extent)) => extent,
            Err(Error::NotFound) => break,
            Err(e) => return Err(e),
        };

        while replacement.length >= cluster_size && sb.header.sc_count < sb.header.sc_low_mark {
            let idx = sb.header.sc_count as usize;
            sb.set_spare_cluster(idx, Extent::new(replacement.offset, cluster_size));
            sb.header.sc_count += 1;
            replacement = Extent::new(replacement.offset + cluster_size, replacement.length - cluster_size);
        }

        if replacement.length > 0 {
            let mut ctx = FbtContext::new(sb);
            fbt.insert(dev, &mut ctx, replacement.length, &replacement, false)?;
        }
    }

    Ok(())
}

/// Allocates a single cluster directly from the spare reservoir, bypassing
/// the FBT entirely. This is what breaks the FBT's own node-splitting
/// recursion.
pub fn allocate_tree_blocks(sb: &mut Superblock) -> Result<Extent> {
    if sb.header.sc_count == 0 {
        warn!("spare cluster reservoir exhausted; FBT cannot grow");
        return Err(Error::NoSpace);
    }
    sb.header.sc_count -= 1;
    let idx = sb.header.sc_count as usize;
    let extent = sb.spare_clusters()[idx];
    sb.sync_header_into_bytes();
    Ok(extent)
}

/// Frees `extent`. If the reservoir has room and the extent is at least
/// one cluster, the first cluster-sized piece tops the reservoir up
/// directly; the remainder (if any) goes through the FBT as usual.
pub fn free_blocks(sb: &mut Superblock, dev: &mut dyn BlockDevice, extent: Extent) -> Result<()> {
    let cluster_size = sb.cluster_size();

    if sb.header.sc_count < sb.header.sc_high_mark && extent.length >= cluster_size {
        let idx = sb.header.sc_count as usize;
        sb.set_spare_cluster(idx, Extent::new(extent.offset, cluster_size));
        sb.header.sc_count += 1;
        sb.sync_header_into_bytes();

        if extent.length > cluster_size {
            let residual = Extent::new(extent.offset + cluster_size, extent.length - cluster_size);
            let mut fbt = open_fbt(sb);
            let mut ctx = FbtContext::new(sb);
            fbt.insert(dev, &mut ctx, residual.length, &residual, false)?;
        }

        return Ok(());
    }

    let mut fbt = open_fbt(sb);
    let mut ctx = FbtContext::new(sb);
    fbt.insert(dev, &mut ctx, extent.length, &extent, false)
}

/// Reports aggregate free-space figures: bytes held in reserve, bytes
/// available through the FBT, the number of distinct free extents, and
/// the space the FBT's own nodes occupy.
pub struct FreeSpaceReport {
    pub reserved: u64,
    pub available: u64,
    pub extents: u64,
    pub in_fbt: u64,
}

pub fn count_free_blocks(sb: &Superblock, dev: &mut dyn BlockDevice) -> Result<FreeSpaceReport> {
    let fbt = open_fbt(sb);
    let cluster_size = sb.cluster_size();

    let extents = fbt.count_values(dev)?;

    let mut available = 0u64;
    fbt.walk(dev, |_, ext: &Extent| {
        available += ext.length;
        Ok(crate::status::ControlFlow::Continue)
    })?;

    let in_fbt = fbt.count_nodes(dev)? * cluster_size;

    Ok(FreeSpaceReport {
        reserved: sb.header.sc_count as u64 * cluster_size,
        available,
        extents,
        in_fbt,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block_io::MemDevice;
    use crate::superblock::Header;
    use crate::version;

    fn fresh_superblock(sc_high_mark: u8) -> Superblock {
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
            num_blocks: 4096,
            fbt_address: 0,
            rht_address: 0,
            flags: 0,
        };
        let total = std::mem::size_of::<Header>() + sc_high_mark as usize * std::mem::size_of::<Extent>();
        Superblock::from_bytes(header, vec![0u8; total]).unwrap()
    }

    #[test]
    fn allocate_and_free_round_trip() {
        let mut sb = fresh_superblock(4);
        let mut dev = MemDevice::new(4096 * 4096);

        for i in 0..4u8 {
            sb.set_spare_cluster(i as usize, Extent::new((i as u64 + 1) * 4096, 4096));
        }
        sb.header.sc_count = 4;

        let mut fbt = open_fbt(&sb);
        let mut ctx = FbtContext::new(&mut sb);
        fbt.init(&mut dev, &mut ctx).unwrap();

        fbt.insert(&mut dev, &mut ctx, 1_000_000, &Extent::new(1_000_000, 1_000_000), false).unwrap();

        let extent = allocate_blocks(&mut sb, &mut dev, 4096).unwrap();
        assert_eq!(extent.length, 4096);

        free_blocks(&mut sb, &mut dev, extent).unwrap();
    }

    #[test]
    fn allocate_rejects_misaligned_length() {
        let mut sb = fresh_superblock(4);
        let mut dev = MemDevice::new(4096 * 16);
        let err = allocate_blocks(&mut sb, &mut dev, 100).unwrap_err();
        assert_eq!(err, Error::Misaligned);
    }
}
