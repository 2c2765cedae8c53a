// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Contiguous byte ranges on the backing device.

use zerocopy::{Immutable, IntoBytes, FromBytes, KnownLayout};

use crate::bmtree::TreeValue;

/// A contiguous, cluster-addressed range on the backing device.
///
/// Free extents (as stored in the free-blocks tree and the superblock's
/// spare-cluster reservoir) carry no further data; file data extents wrap
/// one of these with an additional `local_start` (see [`DataExtent`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct Extent {
    pub offset: u64,
    pub length: u64,
}

static_assertions::const_assert_eq!(std::mem::size_of::<Extent>(), 16);

impl Extent {
    pub const fn new(offset: u64, length: u64) -> Self {
        Self { offset, length }
    }

    pub fn end(&self) -> u64 {
        self.offset + self.length
    }

    /// Whether `self` and `other` share any bytes.
    pub fn overlaps(&self, other: &Extent) -> bool {
        self.offset < other.end() && other.offset < self.end()
    }
}

impl TreeValue for Extent {
    fn to_bytes(&self, size: usize) -> Vec<u8> {
        let mut bytes = self.as_bytes().to_vec();
        bytes.resize(size, 0);
        bytes
    }

    fn from_bytes(bytes: &[u8]) -> Self {
        Extent::read_from_bytes(&bytes[..std::mem::size_of::<Extent>()])
            .expect("leaf value slice is at least sizeof(Extent) bytes")
    }
}

/// An extent describing a range of a file's logical data.
///
/// Used by the per-file data-extent tree ([`crate::file::File`]); large
/// holes between extents are not stored at all and read back as zeroes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct DataExtent {
    /// The start LBA of the extent on the backing device.
    pub offset: u64,
    /// The length of the extent, in bytes.
    pub length: u64,
    /// The offset, within the file, at which this extent's data begins.
    pub local_start: u64,
}

static_assertions::const_assert_eq!(std::mem::size_of::<DataExtent>(), 24);

impl DataExtent {
    pub const fn new(extent: Extent, local_start: u64) -> Self {
        Self { offset: extent.offset, length: extent.length, local_start }
    }

    pub fn as_extent(&self) -> Extent {
        Extent::new(self.offset, self.length)
    }

    /// The file offset one past the last byte this extent covers.
    pub fn local_end(&self) -> u64 {
        self.local_start + self.length
    }

    /// The file offset of the last byte this extent covers; this is the
    /// key the extent is stored under in the data-extent tree.
    pub fn local_last(&self) -> u64 {
        self.local_end() - 1
    }

    pub fn contains_local(&self, offset: u64) -> bool {
        offset >= self.local_start && offset < self.local_end()
    }

    /// Translates a file offset within this extent into a byte offset
    /// relative to the start of the extent's on-disk data.
    pub fn relativize_local(&self, offset: u64) -> u64 {
        offset - self.local_start
    }
}

impl TreeValue for DataExtent {
    fn to_bytes(&self, size: usize) -> Vec<u8> {
        let mut bytes = self.as_bytes().to_vec();
        bytes.resize(size, 0);
        bytes
    }

    fn from_bytes(bytes: &[u8]) -> Self {
        DataExtent::read_from_bytes(&bytes[..std::mem::size_of::<DataExtent>()])
            .expect("leaf value slice is at least sizeof(DataExtent) bytes")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlap_detection() {
        let a = Extent::new(0, 10);
        let b = Extent::new(5, 10);
        let c = Extent::new(10, 10);

        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c));
    }

    #[test]
    fn data_extent_local_range() {
        let de = DataExtent::new(Extent::new(4096, 512), 1000);
        assert_eq!(de.local_end(), 1512);
        assert_eq!(de.local_last(), 1511);
        assert!(de.contains_local(1000));
        assert!(de.contains_local(1511));
        assert!(!de.contains_local(1512));
        assert_eq!(de.relativize_local(1010), 10);
    }
}
