// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The on-disk layout and raw encode/decode of a single Bm+tree node.
//!
//! A node occupies exactly one cluster. Its layout, left to right:
//!
//! ```text
//! [ NodeHeader(8) | keys (cap * key_size) | values (cap * record_size) | prev(8) ]
//! ```
//!
//! `record_size` is `value_size` for a leaf (`level == 0`) and
//! `size_of::<Address>()` (8) for an internal node, so a node's *capacity*
//! (how many keys/values it can hold) differs between levels, exactly as
//! spec.md §4.4 describes. Every key type used in this crate (`u64`,
//! `u128`) has a byte size that is itself a multiple of 8, so the keys
//! region never needs inter-region padding to keep the values region
//! 8-byte aligned.

use crate::status::{Error, Result};

pub const HEADER_SIZE: usize = 8;
pub const PREV_SIZE: usize = 8;
pub const MAGIC: [u8; 2] = *b"B+";

/// The address byte width used for internal-node values.
pub const ADDRESS_SIZE: usize = 8;

/// Computes how many (key, value) slots a node of `node_size` bytes can
/// hold, given `key_size` and `record_size` (the per-slot value width).
pub fn capacity(node_size: u64, key_size: usize, record_size: usize) -> usize {
    let usable = node_size as usize - HEADER_SIZE - PREV_SIZE;
    usable / (key_size + record_size)
}

/// A single on-disk Bm+tree node, decoded into memory.
///
/// Keys and values are kept as flat byte buffers rather than `Vec<K>`/
/// `Vec<V>`, since `V`'s size is only known at runtime (the inode tree's
/// value size is the owning root's configured `inode_size`).
#[derive(Clone)]
pub struct RawNode {
    pub addr: u64,
    pub level: u8,
    pub num_values: u32,
    pub cap: usize,
    pub key_size: usize,
    pub record_size: usize,
    pub node_size: u64,
    pub keys: Vec<u8>,
    pub values: Vec<u8>,
    pub prev: u64,
}

impl RawNode {
    pub fn is_leaf(&self) -> bool {
        self.level == 0
    }

    /// Creates a brand-new, empty node of the given level.
    ///
    /// The in-memory `keys`/`values` buffers hold `cap + 1` slots, one more
    /// than the on-disk node can hold: `insert` writes the new entry before
    /// checking whether the node must split, so a node transiently holds
    /// `cap + 1` values between that write and the split that follows it.
    /// `encode` only ever serializes the first `cap` slots, so this extra
    /// slot never reaches disk.
    pub fn empty(addr: u64, level: u8, node_size: u64, key_size: usize, record_size: usize) -> Self {
        let cap = capacity(node_size, key_size, record_size);
        Self {
            addr,
            level,
            num_values: 0,
            cap,
            key_size,
            record_size,
            node_size,
            keys: vec![0u8; (cap + 1) * key_size],
            values: vec![0u8; (cap + 1) * record_size],
            prev: 0,
        }
    }

    /// Decodes a node from a raw cluster buffer.
    pub fn decode(
        addr: u64,
        buf: &[u8],
        node_size: u64,
        key_size: usize,
        leaf_value_size: usize,
    ) -> Result<Self> {
        if buf.len() < HEADER_SIZE + PREV_SIZE {
            return Err(Error::Misaligned);
        }

        if &buf[0..2] != MAGIC {
            return Err(Error::BadMagic);
        }

        let level = buf[2];
        let hdr_size = buf[3];
        if hdr_size as usize != HEADER_SIZE {
            return Err(Error::Misaligned);
        }

        let num_values = u32::from_le_bytes(buf[4..8].try_into().unwrap());

        let record_size = if level == 0 { leaf_value_size } else { ADDRESS_SIZE };
        let cap = capacity(node_size, key_size, record_size);

        let keys_start = HEADER_SIZE;
        let keys_end = keys_start + cap * key_size;
        let values_start = keys_end;
        let values_end = values_start + cap * record_size;

        if values_end + PREV_SIZE > buf.len() {
            return Err(Error::Misaligned);
        }

        // Over-allocate by one slot, same as `empty`, so a node loaded from
        // disk can transiently overflow to `cap + 1` values during insert
        // before the split check runs.
        let mut keys = vec![0u8; (cap + 1) * key_size];
        keys[..cap * key_size].copy_from_slice(&buf[keys_start..keys_end]);
        let mut values = vec![0u8; (cap + 1) * record_size];
        values[..cap * record_size].copy_from_slice(&buf[values_start..values_end]);
        let prev_start = buf.len() - PREV_SIZE;
        let prev = u64::from_le_bytes(buf[prev_start..prev_start + PREV_SIZE].try_into().unwrap());

        Ok(Self {
            addr,
            level,
            num_values,
            cap,
            key_size,
            record_size,
            node_size,
            keys,
            values,
            prev,
        })
    }

    /// Encodes the node back into a cluster-sized buffer.
    ///
    /// Only the first `cap` key/value slots are serialized: by the time a
    /// node is stored it must already satisfy `num_values <= cap` (the
    /// extra in-memory slot exists solely to let a single insert overflow
    /// before the split that immediately follows it), and the on-disk
    /// cluster never has room for more than `cap` slots in the first
    /// place.
    pub fn encode(&self) -> Vec<u8> {
        debug_assert!(self.num_values as usize <= self.cap);

        let mut buf = vec![0u8; self.node_size as usize];
        buf[0..2].copy_from_slice(&MAGIC);
        buf[2] = self.level;
        buf[3] = HEADER_SIZE as u8;
        buf[4..8].copy_from_slice(&self.num_values.to_le_bytes());

        let keys_start = HEADER_SIZE;
        let keys_end = keys_start + self.cap * self.key_size;
        buf[keys_start..keys_end].copy_from_slice(&self.keys[..self.cap * self.key_size]);

        let values_start = keys_end;
        let values_end = values_start + self.cap * self.record_size;
        buf[values_start..values_end].copy_from_slice(&self.values[..self.cap * self.record_size]);

        let prev_start = buf.len() - PREV_SIZE;
        buf[prev_start..].copy_from_slice(&self.prev.to_le_bytes());

        buf
    }

    pub fn key_bytes(&self, idx: usize) -> &[u8] {
        &self.keys[idx * self.key_size..(idx + 1) * self.key_size]
    }

    pub fn set_key_bytes(&mut self, idx: usize, bytes: &[u8]) {
        self.keys[idx * self.key_size..(idx + 1) * self.key_size].copy_from_slice(bytes);
    }

    pub fn value_bytes(&self, idx: usize) -> &[u8] {
        &self.values[idx * self.record_size..(idx + 1) * self.record_size]
    }

    pub fn set_value_bytes(&mut self, idx: usize, bytes: &[u8]) {
        self.values[idx * self.record_size..(idx + 1) * self.record_size].copy_from_slice(bytes);
    }

    /// Shifts `[from, num_values)` one slot to the right, growing
    /// `num_values` by one. Used by insertion.
    pub fn shift_right(&mut self, from: usize) {
        let n = self.num_values as usize;
        for i in (from..n).rev() {
            let kb = self.key_bytes(i).to_vec();
            self.set_key_bytes(i + 1, &kb);
            let vb = self.value_bytes(i).to_vec();
            self.set_value_bytes(i + 1, &vb);
        }
        self.num_values += 1;
    }

    /// Shifts `[from+1, num_values)` one slot to the left, shrinking
    /// `num_values` by one. Used by removal.
    pub fn shift_left(&mut self, from: usize) {
        let n = self.num_values as usize;
        for i in from..n - 1 {
            let kb = self.key_bytes(i + 1).to_vec();
            self.set_key_bytes(i, &kb);
            let vb = self.value_bytes(i + 1).to_vec();
            self.set_value_bytes(i, &vb);
        }
        self.num_values -= 1;
    }

    pub fn address_value(&self, idx: usize) -> u64 {
        debug_assert!(!self.is_leaf());
        u64::from_le_bytes(self.value_bytes(idx).try_into().unwrap())
    }

    pub fn set_address_value(&mut self, idx: usize, addr: u64) {
        debug_assert!(!self.is_leaf());
        self.set_value_bytes(idx, &addr.to_le_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_encode_decode() {
        let mut node = RawNode::empty(4096, 0, 4096, 8, 16);
        node.num_values = 2;
        node.set_key_bytes(0, &10u64.to_le_bytes());
        node.set_key_bytes(1, &20u64.to_le_bytes());
        node.set_value_bytes(0, &[1u8; 16]);
        node.set_value_bytes(1, &[2u8; 16]);
        node.prev = 2048;

        let buf = node.encode();
        let decoded = RawNode::decode(4096, &buf, 4096, 8, 16).unwrap();

        assert_eq!(decoded.num_values, 2);
        assert_eq!(decoded.prev, 2048);
        assert_eq!(decoded.key_bytes(0), &10u64.to_le_bytes());
        assert_eq!(decoded.key_bytes(1), &20u64.to_le_bytes());
        assert_eq!(decoded.value_bytes(1), &[2u8; 16]);
    }

    #[test]
    fn leaf_and_internal_capacity_differ() {
        let leaf_cap = capacity(4096, 8, 512);
        let internal_cap = capacity(4096, 8, ADDRESS_SIZE);
        assert!(internal_cap > leaf_cap);
    }
}
