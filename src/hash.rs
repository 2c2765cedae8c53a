// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! xxHash64 with the fixed domain seed the on-disk format mandates.

/// The seed every hash in this filesystem is computed with: superblock
/// checksums, inode checksums, label hashes.
pub const SEED: u64 = 14_616_742;

/// Hashes an arbitrary byte buffer with the filesystem's fixed seed.
pub fn hash_bytes(data: &[u8]) -> u64 {
    xxhash_rust::xxh64::xxh64(data, SEED)
}

/// Hashes a label the way the on-disk format does: as a byte string cut off
/// at the first NUL or at `max_len`, whichever comes first.
///
/// Root labels and directory entry labels are both fixed-width, NUL-padded
/// byte arrays; only the meaningful prefix participates in the hash so that
/// trailing pad bytes never change a label's identity.
pub fn hash_label(label: &[u8]) -> u64 {
    let end = label.iter().position(|&b| b == 0).unwrap_or(label.len());
    hash_bytes(&label[..end.min(label.len())])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_seed_dependent_and_deterministic() {
        let a = hash_bytes(b"hello");
        let b = hash_bytes(b"hello");
        assert_eq!(a, b);

        let other_seed = xxhash_rust::xxh64::xxh64(b"hello", SEED + 1);
        assert_ne!(a, other_seed);
    }

    #[test]
    fn label_hash_ignores_nul_padding() {
        let mut padded = [0u8; 256];
        padded[..5].copy_from_slice(b"hello");

        assert_eq!(hash_label(&padded), hash_bytes(b"hello"));
    }

    #[test]
    fn label_hash_truncates_at_nul_even_without_full_padding() {
        assert_eq!(hash_label(b"hi\0garbage"), hash_bytes(b"hi"));
    }
}
