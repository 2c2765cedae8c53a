// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The abstract block I/O backend the rest of the crate is built on.
//!
//! Everything above this module talks to storage exclusively through
//! [`BlockDevice`]; a real implementation might be a file, a raw device
//! node, or (for tests) [`MemDevice`]. The trait intentionally mirrors a
//! four-operation interface (`read`, `write`, `get_size`, `strstatus`)
//! rather than wrapping `std::io::{Read, Write, Seek}`, since every call
//! here is positioned (`pread`/`pwrite`-style) and short transfers are a
//! normal, retriable outcome rather than an error.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};

use crate::status::{Error, Result};

/// A block-addressable storage backend.
///
/// Implementations may transfer fewer bytes than requested (e.g. because a
/// read crosses the end of the device); callers use [`dread`]/[`dwrite`] to
/// retry until the full count is satisfied.
pub trait BlockDevice {
    /// Reads up to `buf.len()` bytes starting at `offset`, returning the
    /// number of bytes actually transferred.
    fn read(&mut self, buf: &mut [u8], offset: u64) -> Result<usize>;

    /// Writes `buf` starting at `offset`, returning the number of bytes
    /// actually transferred.
    fn write(&mut self, buf: &[u8], offset: u64) -> Result<usize>;

    /// The total addressable size of the device, in bytes.
    fn size(&self) -> u64;
}

/// Reads exactly `buf.len()` bytes at `offset`, retrying short transfers.
///
/// A read that returns `0` bytes before `buf` is full is reported as
/// [`Error::DiskTruncated`]; any error from the device propagates
/// immediately.
pub fn dread(dev: &mut dyn BlockDevice, buf: &mut [u8], offset: u64) -> Result<()> {
    let mut done = 0usize;
    while done < buf.len() {
        let n = dev.read(&mut buf[done..], offset + done as u64)?;
        if n == 0 {
            return Err(Error::DiskTruncated);
        }
        done += n;
    }
    Ok(())
}

/// Writes exactly `buf.len()` bytes at `offset`, retrying short transfers.
pub fn dwrite(dev: &mut dyn BlockDevice, buf: &[u8], offset: u64) -> Result<()> {
    let mut done = 0usize;
    while done < buf.len() {
        let n = dev.write(&buf[done..], offset + done as u64)?;
        if n == 0 {
            return Err(Error::DiskTruncated);
        }
        done += n;
    }
    Ok(())
}

/// An in-memory [`BlockDevice`], backed by a plain `Vec<u8>`.
///
/// Every `#[test]` in this crate drives the storage core through a
/// `MemDevice` rather than a real disk image.
#[cfg_attr(not(any(test, feature = "test-util")), allow(dead_code))]
pub struct MemDevice {
    data: Vec<u8>,
}

impl MemDevice {
    pub fn new(size: u64) -> Self {
        Self { data: vec![0u8; size as usize] }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }
}

impl BlockDevice for MemDevice {
    fn read(&mut self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let offset = offset as usize;
        if offset >= self.data.len() {
            return Ok(0);
        }

        let avail = &self.data[offset..];
        let n = buf.len().min(avail.len());
        buf[..n].copy_from_slice(&avail[..n]);
        Ok(n)
    }

    fn write(&mut self, buf: &[u8], offset: u64) -> Result<usize> {
        let offset = offset as usize;
        if offset >= self.data.len() {
            return Ok(0);
        }

        let avail = self.data.len() - offset;
        let n = buf.len().min(avail);
        self.data[offset..offset + n].copy_from_slice(&buf[..n]);
        Ok(n)
    }

    fn size(&self) -> u64 {
        self.data.len() as u64
    }
}

fn io_error(err: std::io::Error) -> Error {
    Error::Device(err.raw_os_error().unwrap_or(-1) as i64)
}

/// A [`BlockDevice`] backed by a real file, demonstrating that the trait
/// isn't tied to [`MemDevice`]'s in-memory storage.
///
/// Short reads past end-of-file are reported as `Ok(0)`, matching
/// `MemDevice`'s behavior; writes grow the file as needed, the way a
/// regular file does under `pwrite`.
#[cfg_attr(not(any(test, feature = "test-util")), allow(dead_code))]
pub struct FileDevice {
    file: File,
    size: u64,
}

impl FileDevice {
    pub fn open(file: File) -> Result<Self> {
        let size = file.metadata().map_err(io_error)?.len();
        Ok(Self { file, size })
    }
}

impl BlockDevice for FileDevice {
    fn read(&mut self, buf: &mut [u8], offset: u64) -> Result<usize> {
        if offset >= self.size {
            return Ok(0);
        }
        self.file.seek(SeekFrom::Start(offset)).map_err(io_error)?;
        let n = (self.size - offset).min(buf.len() as u64) as usize;
        self.file.read(&mut buf[..n]).map_err(io_error)
    }

    fn write(&mut self, buf: &[u8], offset: u64) -> Result<usize> {
        self.file.seek(SeekFrom::Start(offset)).map_err(io_error)?;
        let n = self.file.write(buf).map_err(io_error)?;
        self.size = self.size.max(offset + n as u64);
        Ok(n)
    }

    fn size(&self) -> u64 {
        self.size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_mem_device() {
        let mut dev = MemDevice::new(4096);
        dwrite(&mut dev, b"hello, brufs", 512).unwrap();

        let mut buf = [0u8; 12];
        dread(&mut dev, &mut buf, 512).unwrap();
        assert_eq!(&buf, b"hello, brufs");
    }

    #[test]
    fn read_past_end_truncates_to_zero_bytes() {
        let mut dev = MemDevice::new(16);
        let mut buf = [0xffu8; 4];
        let n = dev.read(&mut buf, 16).unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn dread_past_end_is_disk_truncated() {
        let mut dev = MemDevice::new(16);
        let mut buf = [0u8; 4];
        let err = dread(&mut dev, &mut buf, 15).unwrap_err();
        assert_eq!(err, Error::DiskTruncated);
    }

    #[test]
    fn round_trips_through_file_device() {
        let file = tempfile::tempfile().unwrap();
        file.set_len(4096).unwrap();
        let mut dev = FileDevice::open(file).unwrap();

        dwrite(&mut dev, b"hello, brufs", 512).unwrap();

        let mut buf = [0u8; 12];
        dread(&mut dev, &mut buf, 512).unwrap();
        assert_eq!(&buf, b"hello, brufs");
        assert_eq!(dev.size(), 4096);
    }

    #[test]
    fn file_device_read_past_end_truncates_to_zero_bytes() {
        let file = tempfile::tempfile().unwrap();
        file.set_len(16).unwrap();
        let mut dev = FileDevice::open(file).unwrap();

        let mut buf = [0xffu8; 4];
        let n = dev.read(&mut buf, 16).unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn file_device_write_grows_reported_size() {
        let file = tempfile::tempfile().unwrap();
        let mut dev = FileDevice::open(file).unwrap();
        assert_eq!(dev.size(), 0);

        dwrite(&mut dev, b"grown", 100).unwrap();
        assert_eq!(dev.size(), 105);
    }
}
