// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The master header: the filesystem's single fixed point on disk.
//!
//! The header lives in the first cluster of the device. Immediately past
//! its fixed fields sits the spare-cluster reservoir, a flat array of
//! [`Extent`] big enough for `sc_high_mark` entries — this is why the
//! header is kept as an owned byte buffer on [`crate::fs::Filesystem`]
//! rather than a typed struct with a fixed size: the reservoir's length is
//! only known once the header itself has been read (see REDESIGN note in
//! `SPEC_FULL.md` §9 on keeping the superblock as owned, explicitly
//! re-serialized state rather than a raw global buffer).

use log::{debug, warn};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::extent::Extent;
use crate::hash;
use crate::status::{Error, Result};
use crate::version::{self, Version};

pub const MAGIC: [u8; 16] = *b"BRUTAFS\nBINARY\n";

/// Fixed-size portion of the master header, exactly as it appears at
/// offset 0 of the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct Header {
    pub magic: [u8; 16],
    pub version: Version,
    pub header_size: u32,
    pub checksum: u64,
    pub cluster_size: u32,
    pub cluster_size_exp: u8,
    pub sc_low_mark: u8,
    pub sc_high_mark: u8,
    pub sc_count: u8,
    pub num_blocks: u64,
    pub fbt_address: u64,
    pub rht_address: u64,
    pub flags: u64,
}

static_assertions::const_assert_eq!(std::mem::size_of::<Header>(), 72);

/// Byte offset of the `checksum` field within `Header`: `magic` (16) +
/// `version` (4) + `header_size` (4). Must be zeroed before hashing, both
/// when validating a loaded header and when computing a new one.
const CHECKSUM_OFFSET: usize = 16 + std::mem::size_of::<Version>() + std::mem::size_of::<u32>();
static_assertions::const_assert_eq!(CHECKSUM_OFFSET, 24);

impl Header {
    /// Validates everything about a freshly read header that doesn't
    /// require the rest of the device: magic, version, checksum, cluster
    /// geometry. Kept as a pure function, separate from I/O, per the
    /// explicit-validation note in `SPEC_FULL.md` §4.2.
    pub fn validate(full_bytes: &[u8]) -> Result<Header> {
        if full_bytes.len() < std::mem::size_of::<Header>() {
            return Err(Error::DiskTruncated);
        }

        let header = Header::read_from_bytes(&full_bytes[..std::mem::size_of::<Header>()])
            .map_err(|_| Error::Misaligned)?;

        if header.magic != MAGIC {
            return Err(Error::BadMagic);
        }

        if !header.version.is_compatible_with(version::CURRENT) {
            warn!(
                "on-disk version {} is newer than this build's {}",
                header.version,
                version::CURRENT
            );
            return Err(Error::FsFromFuture);
        }

        let header_size = header.header_size as usize;
        if header_size < std::mem::size_of::<Header>() {
            return Err(Error::HeaderTooSmall);
        }
        if header_size > full_bytes.len() {
            return Err(Error::HeaderTooBig);
        }

        let mut zeroed = full_bytes[..header_size].to_vec();
        zeroed[CHECKSUM_OFFSET..CHECKSUM_OFFSET + std::mem::size_of::<u64>()].fill(0);
        let computed = compute_checksum(&zeroed);
        if computed != header.checksum {
            return Err(Error::ChecksumMismatch);
        }

        debug!(
            "validated superblock: cluster_size={} num_blocks={} fbt={} rht={}",
            header.cluster_size, header.num_blocks, header.fbt_address, header.rht_address
        );

        Ok(header)
    }

    pub fn spare_cluster_capacity(&self) -> usize {
        self.sc_high_mark as usize
    }
}

/// The whole first cluster: the fixed header plus its trailing
/// spare-cluster reservoir, carried as one owned buffer so that every
/// mutation can be re-checksummed and flushed atomically.
#[derive(Debug, Clone)]
pub struct Superblock {
    pub header: Header,
    bytes: Vec<u8>,
}

impl Superblock {
    /// Builds a `Superblock` from a freshly read, already-validated
    /// first-cluster buffer.
    pub fn from_bytes(header: Header, bytes: Vec<u8>) -> Result<Self> {
        let needed = std::mem::size_of::<Header>()
            + header.spare_cluster_capacity() * std::mem::size_of::<Extent>();
        if bytes.len() < needed {
            return Err(Error::Misaligned);
        }
        Ok(Self { header, bytes })
    }

    fn spares_offset(&self) -> usize {
        std::mem::size_of::<Header>()
    }

    /// The spare-cluster reservoir, as currently occupied (`sc_count`
    /// entries, not `sc_high_mark`).
    pub fn spare_clusters(&self) -> Vec<Extent> {
        let off = self.spares_offset();
        (0..self.header.sc_count as usize)
            .map(|i| {
                let start = off + i * std::mem::size_of::<Extent>();
                Extent::read_from_bytes(&self.bytes[start..start + std::mem::size_of::<Extent>()])
                    .expect("fixed-size slice")
            })
            .collect()
    }

    pub fn set_spare_cluster(&mut self, index: usize, extent: Extent) {
        let off = self.spares_offset() + index * std::mem::size_of::<Extent>();
        self.bytes[off..off + std::mem::size_of::<Extent>()].copy_from_slice(extent.as_bytes());
    }

    /// Recomputes the checksum and re-serializes the fixed header fields
    /// into the owned buffer. Must be called before [`Superblock::bytes`]
    /// is flushed to disk whenever `header` has changed.
    pub fn sync_header_into_bytes(&mut self) {
        self.header.checksum = 0;
        let header_size = self.header.header_size as usize;
        self.bytes[..std::mem::size_of::<Header>()].copy_from_slice(self.header.as_bytes());
        let checksum = compute_checksum(&self.bytes[..header_size]);
        self.header.checksum = checksum;
        self.bytes[..std::mem::size_of::<Header>()].copy_from_slice(self.header.as_bytes());
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn cluster_size(&self) -> u64 {
        self.header.cluster_size as u64
    }
}

/// xxHash64 of `data` under the filesystem's fixed seed, computed with the
/// bytes at the checksum field's offset treated as zero (the caller is
/// responsible for zeroing that field in-place before calling this, or —
/// as here — passing a buffer where it already reads zero).
pub fn compute_checksum(data: &[u8]) -> u64 {
    hash::hash_bytes(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> Header {
        Header {
            magic: MAGIC,
            version: version::CURRENT,
            header_size: std::mem::size_of::<Header>() as u32,
            checksum: 0,
            cluster_size: 4096,
            cluster_size_exp: 12,
            sc_low_mark: 2,
            sc_high_mark: 4,
            sc_count: 0,
            num_blocks: 8192,
            fbt_address: 0,
            rht_address: 0,
            flags: 0,
        }
    }

    #[test]
    fn validate_rejects_bad_magic() {
        let mut header = sample_header();
        header.magic = [0u8; 16];
        let bytes = header.as_bytes().to_vec();
        assert_eq!(Header::validate(&bytes).unwrap_err(), Error::BadMagic);
    }

    #[test]
    fn validate_rejects_checksum_mismatch() {
        let mut header = sample_header();
        header.checksum = 0xdead_beef;
        let bytes = header.as_bytes().to_vec();
        assert_eq!(Header::validate(&bytes).unwrap_err(), Error::ChecksumMismatch);
    }

    #[test]
    fn validate_accepts_correct_checksum() {
        let mut header = sample_header();
        header.checksum = 0;
        let mut bytes = header.as_bytes().to_vec();
        let checksum = compute_checksum(&bytes);
        header.checksum = checksum;
        bytes = header.as_bytes().to_vec();

        let validated = Header::validate(&bytes).unwrap();
        assert_eq!(validated.cluster_size, 4096);
    }

    #[test]
    fn validate_rejects_future_major_version() {
        let mut header = sample_header();
        header.version = Version::new(version::CURRENT.major + 1, 0, 0);
        header.checksum = 0;
        let mut bytes = header.as_bytes().to_vec();
        let checksum = compute_checksum(&bytes);
        header.checksum = checksum;
        bytes = header.as_bytes().to_vec();
        assert_eq!(Header::validate(&bytes).unwrap_err(), Error::FsFromFuture);
    }

    #[test]
    fn spare_cluster_round_trip() {
        let header = sample_header();
        let total = std::mem::size_of::<Header>() + 4 * std::mem::size_of::<Extent>();
        let mut sb = Superblock::from_bytes(header, vec![0u8; total]).unwrap();
        sb.header.sc_count = 2;
        sb.set_spare_cluster(0, Extent::new(4096, 4096));
        sb.set_spare_cluster(1, Extent::new(8192, 4096));

        let spares = sb.spare_clusters();
        assert_eq!(spares, vec![Extent::new(4096, 4096), Extent::new(8192, 4096)]);
    }
}
