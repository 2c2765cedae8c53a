// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Inode records: the fixed header every file and directory carries, plus
//! the type-private area that follows it.
//!
//! A root's configured `inode_size` is only known at runtime (it is a field
//! of [`crate::root::RootDescriptor`]), so an inode record as a whole is
//! carried as an owned, variable-length byte buffer ([`InodeRecord`]) rather
//! than a fixed-size struct. [`InodeHeader`] is the fixed-width prefix every
//! record starts with; everything past `inode_header_size` bytes is private
//! to whatever uses the inode (a file's data-extent tree root, a
//! directory's entry-tree root, or a small file's inline tail).

use bitflags::bitflags;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::bmtree::TreeValue;
use crate::status::{Error, Result};

/// The inode id of each root's top-level directory. Low bits `0` mark the
/// main stream, so this also doubles as a main-stream id.
pub const ROOT_DIR_INODE_ID: u128 = 1024;

/// The low 6 bits of an inode id discriminate which of a root's two inode
/// trees a record lives in: zero selects the main stream, any other value
/// selects the alternate stream (extended attributes, forks, ...).
pub fn is_main_stream(id: u128) -> bool {
    id & 0b11_1111 == 0
}

/// A `{seconds, nanoseconds}` timestamp, exactly 12 bytes on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct Timestamp {
    pub seconds: u64,
    pub nanoseconds: u32,
}

static_assertions::const_assert_eq!(std::mem::size_of::<Timestamp>(), 12);

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp { seconds: 0, nanoseconds: 0 };

    pub fn from_unix(seconds: u64, nanoseconds: u32) -> Self {
        Self { seconds, nanoseconds }
    }

    /// The current wall-clock time, used to stamp a freshly created
    /// inode's `created`/`last_modified` fields.
    pub fn now() -> Self {
        let elapsed = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default();
        Self { seconds: elapsed.as_secs(), nanoseconds: elapsed.subsec_nanos() }
    }
}

bitflags! {
    /// Per-inode behavior flags, stored in [`InodeHeader::flags`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct InodeFlags: u16 {
        /// Never read back a hole as zeroes; every byte of the file must be
        /// backed by a real data extent.
        const NO_SPARSE = 0b0000_0001;
        /// Overwrite a deleted file's data extents with zeroes before
        /// freeing them, rather than simply releasing the extents.
        const ZERO_AT_DELETION = 0b0000_0010;
    }
}

/// What kind of entity an inode record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum InodeType {
    None = 0,
    File = 1,
    Directory = 2,
    SoftLink = 3,
}

impl TryFrom<u16> for InodeType {
    type Error = Error;

    fn try_from(value: u16) -> Result<Self> {
        match value {
            0 => Ok(InodeType::None),
            1 => Ok(InodeType::File),
            2 => Ok(InodeType::Directory),
            3 => Ok(InodeType::SoftLink),
            _ => Err(Error::WrongInodeType),
        }
    }
}

/// The fixed-width prefix of every inode record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct InodeHeader {
    pub created: Timestamp,
    pub last_modified: Timestamp,
    pub owner: u64,
    pub group: u64,
    pub num_links: u16,
    pub kind: u16,
    pub flags: u16,
    pub mode: u16,
    pub file_size: u64,
    pub checksum: u64,
}

static_assertions::const_assert_eq!(std::mem::size_of::<InodeHeader>(), 72);

impl InodeHeader {
    pub fn inode_type(&self) -> Result<InodeType> {
        InodeType::try_from(self.kind)
    }

    pub fn set_inode_type(&mut self, kind: InodeType) {
        self.kind = kind as u16;
    }

    pub fn flags(&self) -> InodeFlags {
        InodeFlags::from_bits_truncate(self.flags)
    }

    pub fn set_flags(&mut self, flags: InodeFlags) {
        self.flags = flags.bits();
    }
}

/// A variable-length inode record: an [`InodeHeader`] followed by
/// `inode_size - inode_header_size` bytes of type-private data, carried as
/// one owned buffer since `inode_size` is only known at the owning root.
#[derive(Debug, Clone)]
pub struct InodeRecord {
    bytes: Vec<u8>,
}

impl InodeRecord {
    /// A freshly zeroed record of the given total size.
    pub fn zeroed(inode_size: usize) -> Self {
        Self { bytes: vec![0u8; inode_size] }
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn header(&self) -> InodeHeader {
        InodeHeader::read_from_bytes(&self.bytes[..std::mem::size_of::<InodeHeader>()])
            .expect("inode record is at least sizeof(InodeHeader) bytes")
    }

    pub fn set_header(&mut self, header: &InodeHeader) {
        self.bytes[..std::mem::size_of::<InodeHeader>()].copy_from_slice(header.as_bytes());
    }

    pub fn private_data(&self, header_size: usize) -> &[u8] {
        &self.bytes[header_size..]
    }

    pub fn private_data_mut(&mut self, header_size: usize) -> &mut [u8] {
        &mut self.bytes[header_size..]
    }
}

impl TreeValue for InodeRecord {
    fn to_bytes(&self, size: usize) -> Vec<u8> {
        let mut bytes = self.bytes.clone();
        bytes.resize(size, 0);
        bytes
    }

    fn from_bytes(bytes: &[u8]) -> Self {
        Self { bytes: bytes.to_vec() }
    }
}

/// A live handle onto one inode: its id, the owning root's header width,
/// and its current record. Shared by [`crate::file::File`] and
/// [`crate::directory::Directory`], which each interpret the bytes past
/// the header differently.
#[derive(Debug, Clone)]
pub struct Inode {
    pub id: u128,
    pub header_size: usize,
    pub record: InodeRecord,
}

impl Inode {
    pub fn new(id: u128, header_size: usize, record: InodeRecord) -> Self {
        Self { id, header_size, record }
    }

    pub fn header(&self) -> InodeHeader {
        self.record.header()
    }

    pub fn set_header(&mut self, header: &InodeHeader) {
        self.record.set_header(header);
    }

    pub fn private_data(&self) -> &[u8] {
        self.record.private_data(self.header_size)
    }

    pub fn private_data_mut(&mut self) -> &mut [u8] {
        self.record.private_data_mut(self.header_size)
    }

    /// The first 8 bytes of the private area, interpreted as a tree root
    /// address: a file's data-extent tree or a directory's entry tree.
    pub fn tree_root(&self) -> u64 {
        u64::from_le_bytes(self.private_data()[0..8].try_into().unwrap())
    }

    pub fn set_tree_root(&mut self, addr: u64) {
        self.private_data_mut()[0..8].copy_from_slice(&addr.to_le_bytes());
    }
}

/// An in-progress description of an [`InodeHeader`], tracking which fields
/// were explicitly set so it can be merged against a parent directory's
/// defaults when a new entity is created.
#[derive(Debug, Clone, Default)]
pub struct InodeHeaderBuilder {
    created: Option<Timestamp>,
    last_modified: Option<Timestamp>,
    owner: Option<u64>,
    group: Option<u64>,
    num_links: Option<u16>,
    kind: Option<InodeType>,
    flags: Option<InodeFlags>,
    mode: Option<u16>,
    file_size: Option<u64>,
}

impl InodeHeaderBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_created(mut self, created: Timestamp) -> Self {
        self.created = Some(created);
        self
    }

    pub fn with_last_modified(mut self, last_modified: Timestamp) -> Self {
        self.last_modified = Some(last_modified);
        self
    }

    pub fn with_owner(mut self, owner: u64) -> Self {
        self.owner = Some(owner);
        self
    }

    pub fn with_group(mut self, group: u64) -> Self {
        self.group = Some(group);
        self
    }

    pub fn with_num_links(mut self, num_links: u16) -> Self {
        self.num_links = Some(num_links);
        self
    }

    pub fn with_type(mut self, kind: InodeType) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn with_flags(mut self, flags: InodeFlags) -> Self {
        self.flags = Some(flags);
        self
    }

    pub fn with_mode(mut self, mode: u16) -> Self {
        self.mode = Some(mode);
        self
    }

    pub fn with_file_size(mut self, file_size: u64) -> Self {
        self.file_size = Some(file_size);
        self
    }

    /// Produces a full header, falling back to `defaults` for every field
    /// that was never explicitly set.
    pub fn build(&self, defaults: &InodeHeader) -> InodeHeader {
        InodeHeader {
            created: self.created.unwrap_or(defaults.created),
            last_modified: self.last_modified.unwrap_or(defaults.last_modified),
            owner: self.owner.unwrap_or(defaults.owner),
            group: self.group.unwrap_or(defaults.group),
            num_links: self.num_links.unwrap_or(defaults.num_links),
            kind: self.kind.map(|k| k as u16).unwrap_or(defaults.kind),
            flags: self.flags.map(|f| f.bits()).unwrap_or(defaults.flags),
            mode: self.mode.unwrap_or(defaults.mode),
            file_size: self.file_size.unwrap_or(defaults.file_size),
            checksum: 0,
        }
    }
}

/// Generates fresh inode ids for newly created entities. A real filesystem
/// handle hands out ids from an internal counter; tests can supply a
/// deterministic stub.
pub trait InodeIdSource {
    fn next_main_stream_id(&mut self) -> u128;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn main_stream_discriminated_by_low_bits() {
        assert!(is_main_stream(0));
        assert!(is_main_stream(ROOT_DIR_INODE_ID));
        assert!(!is_main_stream(1));
        assert!(!is_main_stream(63));
        assert!(is_main_stream(128));
    }

    #[test]
    fn record_round_trips_header_and_private_data() {
        let mut record = InodeRecord::zeroed(96);
        let mut header = InodeHeader {
            created: Timestamp::from_unix(1000, 0),
            last_modified: Timestamp::from_unix(2000, 0),
            owner: 1,
            group: 1,
            num_links: 1,
            kind: 0,
            flags: 0,
            mode: 0o644,
            file_size: 0,
            checksum: 0,
        };
        header.set_inode_type(InodeType::File);
        header.set_flags(InodeFlags::ZERO_AT_DELETION);
        record.set_header(&header);

        let header_size = std::mem::size_of::<InodeHeader>();
        record.private_data_mut(header_size)[0..8].copy_from_slice(&42u64.to_le_bytes());

        let read_back = record.header();
        assert_eq!(read_back.inode_type().unwrap(), InodeType::File);
        assert_eq!(read_back.flags(), InodeFlags::ZERO_AT_DELETION);
        assert_eq!(
            u64::from_le_bytes(record.private_data(header_size)[0..8].try_into().unwrap()),
            42
        );
    }

    #[test]
    fn builder_merges_with_defaults() {
        let defaults = InodeHeader {
            created: Timestamp::ZERO,
            last_modified: Timestamp::ZERO,
            owner: 7,
            group: 7,
            num_links: 1,
            kind: InodeType::Directory as u16,
            flags: 0,
            mode: 0o755,
            file_size: 0,
            checksum: 0,
        };

        let built = InodeHeaderBuilder::new()
            .with_type(InodeType::File)
            .with_mode(0o755 & !0o111)
            .build(&defaults);

        assert_eq!(built.inode_type().unwrap(), InodeType::File);
        assert_eq!(built.mode, 0o644);
        assert_eq!(built.owner, 7);
        assert_eq!(built.group, 7);
    }
}
