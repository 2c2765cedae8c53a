// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Error taxonomy shared by every layer of the storage core.
//!
//! A C ancestor of this design returns a single flat `Status` enum from
//! every call, with `OK`/`RETRY`/`STOP` sharing the same numeric space as
//! the error kinds. Rust's `Result` already gives us the OK/error split for
//! free, so only the error half is represented here; `RETRY`/`STOP` survive
//! as [`ControlFlow`], the value a per-entry callback hands back to
//! `walk`/`destroy`.

use std::fmt;

/// Every way a storage-core operation can fail.
///
/// Variant names mirror the `E_*` kinds of the on-disk format's status
/// space so that a reader who knows it can map straight across.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// An internal invariant was violated; the library should never
    /// generate this in practice.
    #[error("internal error")]
    Internal,

    #[error("invalid argument")]
    InvalidArgument,

    #[error("the disk ended before all data could be transferred")]
    DiskTruncated,

    #[error("bad magic number")]
    BadMagic,

    #[error("filesystem was created by a newer, incompatible version")]
    FsFromFuture,

    #[error("filesystem header is too big to fit in its reserved space")]
    HeaderTooBig,

    #[error("filesystem header is too small to hold all mandatory fields")]
    HeaderTooSmall,

    #[error("checksum mismatch")]
    ChecksumMismatch,

    #[error("no space left on device")]
    NoSpace,

    #[error("enough space exists in aggregate, but no single extent is large enough")]
    WontFit,

    #[error("entity not found")]
    NotFound,

    #[error("operation retried too many times")]
    TooManyRetries,

    #[error("the tree reached its maximum level")]
    AtMaxLevel,

    /// Internal to the Bm+tree: a neighbor cannot adopt the records of the
    /// node asking to merge. Callers of the tree never see this; the tree
    /// catches it and falls back to abduction.
    #[error("sibling cannot adopt node")]
    CantAdopt,

    #[error("misaligned size or address")]
    Misaligned,

    #[error("no free-block tree present")]
    NoFbt,

    #[error("no root hash tree present")]
    NoRht,

    #[error("the entity already exists")]
    Exists,

    #[error("too many hash collisions")]
    Pileup,

    #[error("offset is beyond the end of the file")]
    BeyondEof,

    #[error("a callback requested a stop that left the operation unfinished")]
    Stopped,

    #[error("operation is not valid for this inode's type")]
    WrongInodeType,

    #[error("path does not name a root")]
    NoRoot,

    /// A negative status from the block I/O adapter that this crate does
    /// not interpret itself (OS errno-equivalent, adapter-defined).
    #[error("block device error: {0}")]
    Device(i64),
}

/// The result type every fallible storage-core operation returns.
pub type Result<T> = std::result::Result<T, Error>;

/// What a `walk`/`destroy` callback asks the driving loop to do next.
///
/// This is the Rust-native replacement for a shared `OK`/`RETRY`/`STOP`
/// status space: `walk` and `destroy` are the only operations a consumer
/// can meaningfully ask to retry or stop mid-flight, so it is modeled as
/// its own small enum rather than folded into [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlFlow {
    /// Keep going.
    Continue,
    /// Re-invoke the same callback for the same item.
    Retry,
    /// Stop the walk/destroy early; not an error by itself, but callers
    /// that required completion (e.g. `destroy`) surface
    /// [`Error::Stopped`].
    Stop,
}

impl fmt::Display for ControlFlow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlFlow::Continue => write!(f, "continue"),
            ControlFlow::Retry => write!(f, "retry"),
            ControlFlow::Stop => write!(f, "stop"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_is_nonempty() {
        for e in [Error::Internal, Error::NotFound, Error::Device(-5)] {
            assert!(!e.to_string().is_empty());
        }
    }
}
