// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A generalized on-disk B+tree ("Bm+tree"): the structure every indexed
//! collection in this crate (the free-block tree, the root hash table, the
//! inode store, a file's data extents, a directory's entries) is built on.
//!
//! # Design choices
//!
//! A node never keeps an in-memory back pointer to its parent. Instead the
//! descent is carried as an explicit stack of `(node, child_index)` frames
//! ([`Path`]), passed to whatever step needs ancestor context — a split or
//! a merge walks back up this stack rather than following pointers the
//! node itself would have to own.
//!
//! A [`BmTree`] handle is deliberately lightweight and disposable: it holds
//! only the root address and the per-tree constants (node size, key size,
//! value size, max level), never a borrow of the device or the owning
//! filesystem. Every mutating call takes the device, an allocator, a
//! deallocator, and an `on_root_change` callback as explicit parameters, so
//! a caller (e.g. [`crate::fs::Filesystem`]) can reconstruct a `BmTree`
//! from a persisted root address, use it once, and let the callback write
//! the (possibly new) root address back wherever it is stored. No tree ever
//! needs a live reference back to its owner.

mod node;

use std::marker::PhantomData;

use crate::block_io::{dread, dwrite, BlockDevice};
use crate::status::{ControlFlow, Error, Result};
use node::RawNode;

pub use node::ADDRESS_SIZE;

/// A fixed-width key a [`BmTree`] can be ordered by.
pub trait TreeKey: Copy + Ord {
    const SIZE: usize;
    fn to_bytes(&self) -> Vec<u8>;
    fn from_bytes(bytes: &[u8]) -> Self;
}

impl TreeKey for u64 {
    const SIZE: usize = 8;
    fn to_bytes(&self) -> Vec<u8> {
        self.to_le_bytes().to_vec()
    }
    fn from_bytes(bytes: &[u8]) -> Self {
        u64::from_le_bytes(bytes.try_into().unwrap())
    }
}

impl TreeKey for u128 {
    const SIZE: usize = 16;
    fn to_bytes(&self) -> Vec<u8> {
        self.to_le_bytes().to_vec()
    }
    fn from_bytes(bytes: &[u8]) -> Self {
        u128::from_le_bytes(bytes.try_into().unwrap())
    }
}

/// A leaf value a [`BmTree`] can store.
///
/// `SIZE` may be a compile-time constant (as for [`crate::extent::Extent`])
/// or a value chosen at runtime (the inode tree's record width is the
/// owning root's configured `inode_size`); either way the tree only ever
/// asks a value to serialize itself into a fixed-width slot.
pub trait TreeValue: Clone {
    fn to_bytes(&self, size: usize) -> Vec<u8>;
    fn from_bytes(bytes: &[u8]) -> Self;
}

/// Allocates and frees the clusters a [`BmTree`] needs for its own nodes.
///
/// Two distinct implementations exist in this crate (see
/// [`crate::allocator`]): the free-block tree is backed by the restricted
/// spare-cluster reservoir allocator so that allocating space never
/// recurses into a search of the free-block tree itself, while every other
/// tree is backed by the general allocator.
pub trait TreeAllocator {
    fn allocate_node(&mut self, dev: &mut dyn BlockDevice) -> Result<u64>;
    fn free_node(&mut self, dev: &mut dyn BlockDevice, addr: u64) -> Result<()>;
}

/// Called whenever a tree's root address changes (on first insertion, on a
/// split that grows the tree upward, or when the last value is removed).
/// Implementations persist the new address into wherever the tree's root
/// pointer actually lives (the superblock, a root descriptor, an inode).
pub trait RootSink {
    fn on_root_change(&mut self, new_root: u64) -> Result<()>;
}

impl<F: FnMut(u64) -> Result<()>> RootSink for F {
    fn on_root_change(&mut self, new_root: u64) -> Result<()> {
        self(new_root)
    }
}

/// A combined allocator and root-change sink, passed as a single `&mut dyn`
/// parameter to every mutating [`BmTree`] call.
///
/// Early drafts threaded an allocator and a root sink as two separate
/// trait-object parameters. For trees like the free-block tree, both need
/// exclusive access to the same [`crate::superblock::Superblock`] — and a
/// single call site cannot hand out two independent `&mut` borrows of it at
/// once. Bundling both concerns behind one object (one exclusive borrow,
/// used sequentially as the tree needs it) sidesteps that entirely, letting
/// a single object serve both roles.
pub trait TreeContext: TreeAllocator + RootSink {}
impl<T: TreeAllocator + RootSink> TreeContext for T {}

/// A disposable handle onto one Bm+tree instance.
///
/// Equality of keys is always `Ord`/`Eq` on `K`; callers who need a custom
/// notion of "the same logical entry" (e.g. directory entries keyed by
/// label hash, where two different labels can collide) pass an explicit
/// `equiv` closure to [`BmTree::update`] and [`BmTree::remove_matching`]
/// rather than relying on trait specialization.
pub struct BmTree<K, V> {
    pub root: u64,
    pub node_size: u64,
    pub value_size: usize,
    pub max_level: u32,
    _marker: PhantomData<(K, V)>,
}

struct PathFrame {
    node: RawNode,
    child_index: usize,
}

type Path = Vec<PathFrame>;

impl<K: TreeKey, V: TreeValue> BmTree<K, V> {
    pub fn new(root: u64, node_size: u64, value_size: usize, max_level: u32) -> Self {
        Self { root, node_size, value_size, max_level, _marker: PhantomData }
    }

    fn record_size(&self, level: u8) -> usize {
        if level == 0 {
            self.value_size
        } else {
            ADDRESS_SIZE
        }
    }

    fn load(&self, dev: &mut dyn BlockDevice, addr: u64) -> Result<RawNode> {
        let mut buf = vec![0u8; self.node_size as usize];
        dread(dev, &mut buf, addr)?;
        RawNode::decode(addr, &buf, self.node_size, K::SIZE, self.value_size)
    }

    fn store(&self, dev: &mut dyn BlockDevice, node: &RawNode) -> Result<()> {
        dwrite(dev, &node.encode(), node.addr)
    }

    /// Allocates the tree's first (empty leaf) root node.
    pub fn init(&mut self, dev: &mut dyn BlockDevice, ctx: &mut dyn TreeContext) -> Result<()> {
        let addr = ctx.allocate_node(dev)?;
        let node = RawNode::empty(addr, 0, self.node_size, K::SIZE, self.value_size);
        self.store(dev, &node)?;
        self.root = addr;
        ctx.on_root_change(addr)
    }

    /// Whether the tree has ever had a root allocated.
    pub fn is_empty_tree(&self) -> bool {
        self.root == 0
    }

    /// Descends from the root to the leaf that would contain `key`,
    /// recording the path taken. The returned path's last frame is always
    /// the leaf.
    fn descend(&self, dev: &mut dyn BlockDevice, key: K) -> Result<Path> {
        let mut path = Vec::new();
        let mut addr = self.root;

        loop {
            let node = self.load(dev, addr)?;

            if node.is_leaf() {
                let idx = lower_bound(&node, key);
                path.push(PathFrame { node, child_index: idx });
                return Ok(path);
            }

            let idx = locate(&node, key);
            let next_addr = node.address_value(idx);
            path.push(PathFrame { node, child_index: idx });
            addr = next_addr;
        }
    }

    /// Descends to the leftmost or rightmost leaf, without reference to any
    /// particular key. Used by [`BmTree::get_first`]/[`BmTree::get_last`].
    fn descend_edge(&self, dev: &mut dyn BlockDevice, leftmost: bool) -> Result<RawNode> {
        let mut addr = self.root;
        loop {
            let node = self.load(dev, addr)?;
            if node.is_leaf() {
                return Ok(node);
            }
            if node.num_values == 0 {
                return Err(Error::Internal);
            }
            let idx = if leftmost { 0 } else { node.num_values as usize - 1 };
            addr = node.address_value(idx);
        }
    }

    /// Finds the single value stored under `key`. If more than one value
    /// shares the key, the most recently inserted one is returned (the
    /// tree keeps colliding entries adjacent, with new entries placed
    /// after existing ones).
    pub fn search(&self, dev: &mut dyn BlockDevice, key: K) -> Result<V> {
        if self.is_empty_tree() {
            return Err(Error::NotFound);
        }
        let path = self.descend(dev, key)?;
        let leaf = &path.last().unwrap().node;
        let idx = path.last().unwrap().child_index;
        if idx < leaf.num_values as usize && K::from_bytes(leaf.key_bytes(idx)) == key {
            Ok(V::from_bytes(leaf.value_bytes(idx)))
        } else {
            Err(Error::NotFound)
        }
    }

    /// Finds the entry with the smallest key that is `>= min_key`, without
    /// removing it. The read-only counterpart to [`BmTree::remove_first_ge`];
    /// used by a file's data-extent tree, which is keyed by each extent's
    /// last covered byte offset, to find the extent (if any) that covers or
    /// follows a given file offset.
    pub fn search_first_ge(&self, dev: &mut dyn BlockDevice, min_key: K) -> Result<(K, V)> {
        if self.is_empty_tree() {
            return Err(Error::NotFound);
        }

        let path = self.descend(dev, min_key)?;
        let frame = path.last().unwrap();
        let idx = frame.child_index;
        if idx >= frame.node.num_values as usize {
            return Err(Error::NotFound);
        }

        let found_key = K::from_bytes(frame.node.key_bytes(idx));
        let value = V::from_bytes(frame.node.value_bytes(idx));
        Ok((found_key, value))
    }

    /// Collects up to `max` values stored under `key`, in most-recent-first
    /// order, walking backward across leaf boundaries via the `prev` chain
    /// when a run of equal keys spans more than one leaf.
    pub fn search_all(&self, dev: &mut dyn BlockDevice, key: K, max: usize) -> Result<Vec<V>> {
        let mut out = Vec::new();
        if self.is_empty_tree() || max == 0 {
            return Ok(out);
        }

        let path = self.descend(dev, key)?;
        let mut leaf = path.last().unwrap().node.clone();
        let mut idx = path.last().unwrap().child_index;

        if idx >= leaf.num_values as usize || K::from_bytes(leaf.key_bytes(idx)) != key {
            return Ok(out);
        }

        // `idx` is the leftmost match within this leaf; collisions are
        // inserted after existing equal keys, so walk right to the last
        // (most recently inserted) match before collecting backward.
        while idx + 1 < leaf.num_values as usize && K::from_bytes(leaf.key_bytes(idx + 1)) == key {
            idx += 1;
        }

        loop {
            if idx >= leaf.num_values as usize {
                break;
            }
            if K::from_bytes(leaf.key_bytes(idx)) != key {
                break;
            }
            out.push(V::from_bytes(leaf.value_bytes(idx)));
            if out.len() >= max {
                return Ok(out);
            }

            if idx == 0 {
                if leaf.prev == 0 {
                    break;
                }
                leaf = self.load(dev, leaf.prev)?;
                idx = leaf.num_values as usize;
                if idx == 0 {
                    break;
                }
                idx -= 1;
            } else {
                idx -= 1;
            }
        }

        Ok(out)
    }

    pub fn get_first(&self, dev: &mut dyn BlockDevice) -> Result<V> {
        if self.is_empty_tree() {
            return Err(Error::NotFound);
        }
        let leaf = self.descend_edge(dev, true)?;
        if leaf.num_values == 0 {
            return Err(Error::NotFound);
        }
        Ok(V::from_bytes(leaf.value_bytes(0)))
    }

    pub fn get_last(&self, dev: &mut dyn BlockDevice) -> Result<V> {
        if self.is_empty_tree() {
            return Err(Error::NotFound);
        }
        let leaf = self.descend_edge(dev, false)?;
        if leaf.num_values == 0 {
            return Err(Error::NotFound);
        }
        Ok(V::from_bytes(leaf.value_bytes(leaf.num_values as usize - 1)))
    }

    /// Inserts `value` under `key`. When `reject_duplicates` is set, an
    /// existing exact-key match is reported as [`Error::Exists`]; otherwise
    /// the new entry is placed after any existing entries with the same
    /// key.
    pub fn insert(
        &mut self,
        dev: &mut dyn BlockDevice,
        ctx: &mut dyn TreeContext,
        key: K,
        value: &V,
        reject_duplicates: bool,
    ) -> Result<()> {
        if self.is_empty_tree() {
            self.init(dev, ctx)?;
        }

        let mut path = self.descend(dev, key)?;
        let mut frame = path.pop().unwrap();

        if reject_duplicates {
            let idx = frame.child_index;
            if idx < frame.node.num_values as usize && K::from_bytes(frame.node.key_bytes(idx)) == key {
                return Err(Error::Exists);
            }
        }

        let insert_at = first_index_greater(&frame.node, key);
        insert_direct(&mut frame.node, insert_at, &key.to_bytes(), &value.to_bytes(self.value_size));

        self.rebalance_after_insert(dev, ctx, path, frame.node)
    }

    /// Propagates a split upward after an insertion, as far as necessary.
    ///
    /// `node` may transiently hold `cap + 1` values on entry (the slot the
    /// caller just inserted, before this loop's split check); it is never
    /// persisted in that state — the first thing each iteration does is
    /// either store it as-is (within capacity) or split it before storing
    /// either half.
    fn rebalance_after_insert(
        &mut self,
        dev: &mut dyn BlockDevice,
        ctx: &mut dyn TreeContext,
        mut path: Path,
        mut node: RawNode,
    ) -> Result<()> {
        loop {
            if (node.num_values as usize) <= node.cap {
                return self.store(dev, &node);
            }

            if (node.level as u32) >= self.max_level {
                return Err(Error::AtMaxLevel);
            }

            let (sibling, separator_key) = split(&mut node, ctx, dev)?;
            self.store(dev, &node)?;
            self.store(dev, &sibling)?;

            match path.pop() {
                Some(mut parent_frame) => {
                    let sep_idx = parent_frame.child_index;
                    insert_direct(
                        &mut parent_frame.node,
                        sep_idx,
                        &separator_key.to_vec(),
                        &sibling.addr.to_le_bytes(),
                    );
                    // Not stored here: the parent may itself now hold
                    // `cap + 1` values, and the top of the loop is what
                    // decides whether to store it as-is or split it first.
                    node = parent_frame.node;
                }
                None => {
                    let new_level = node.level + 1;
                    let root_addr = ctx.allocate_node(dev)?;
                    let mut new_root =
                        RawNode::empty(root_addr, new_level, self.node_size, K::SIZE, ADDRESS_SIZE);
                    new_root.set_key_bytes(0, &separator_key);
                    new_root.set_address_value(0, sibling.addr);
                    let old_root_key = node.key_bytes(node.num_values as usize - 1).to_vec();
                    new_root.set_key_bytes(1, &old_root_key);
                    new_root.set_address_value(1, node.addr);
                    new_root.num_values = 2;
                    self.store(dev, &new_root)?;

                    self.root = root_addr;
                    return ctx.on_root_change(root_addr);
                }
            }
        }
    }

    /// Replaces the value stored at the first entry matching `key` for
    /// which `equiv` returns true. This is how a caller expresses "the same
    /// logical entry" when key collisions are expected (e.g. directory
    /// entries keyed by label hash).
    pub fn update(
        &mut self,
        dev: &mut dyn BlockDevice,
        key: K,
        value: &V,
        mut equiv: impl FnMut(&V) -> bool,
    ) -> Result<()> {
        if self.is_empty_tree() {
            return Err(Error::NotFound);
        }

        let path = self.descend(dev, key)?;
        let mut leaf = path.last().unwrap().node.clone();
        let mut idx = path.last().unwrap().child_index;
        if idx >= leaf.num_values as usize || K::from_bytes(leaf.key_bytes(idx)) != key {
            return Err(Error::NotFound);
        }
        while idx + 1 < leaf.num_values as usize && K::from_bytes(leaf.key_bytes(idx + 1)) == key {
            idx += 1;
        }

        loop {
            if idx >= leaf.num_values as usize || K::from_bytes(leaf.key_bytes(idx)) != key {
                return Err(Error::NotFound);
            }
            let current = V::from_bytes(leaf.value_bytes(idx));
            if equiv(&current) {
                leaf.set_value_bytes(idx, &value.to_bytes(self.value_size));
                return self.store(dev, &leaf);
            }
            if idx == 0 {
                if leaf.prev == 0 {
                    return Err(Error::NotFound);
                }
                leaf = self.load(dev, leaf.prev)?;
                if leaf.num_values == 0 {
                    return Err(Error::NotFound);
                }
                idx = leaf.num_values as usize - 1;
            } else {
                idx -= 1;
            }
        }
    }

    /// Removes the first entry matching `key` for which `equiv` returns
    /// true, rebalancing the tree as needed. Returns the removed value.
    pub fn remove_matching(
        &mut self,
        dev: &mut dyn BlockDevice,
        ctx: &mut dyn TreeContext,
        key: K,
        mut equiv: impl FnMut(&V) -> bool,
    ) -> Result<V> {
        if self.is_empty_tree() {
            return Err(Error::NotFound);
        }

        let mut path = self.descend(dev, key)?;
        let mut frame = path.pop().unwrap();
        let mut idx = frame.child_index;
        if idx >= frame.node.num_values as usize || K::from_bytes(frame.node.key_bytes(idx)) != key {
            return Err(Error::NotFound);
        }
        while idx + 1 < frame.node.num_values as usize && K::from_bytes(frame.node.key_bytes(idx + 1)) == key {
            idx += 1;
        }

        let removed = loop {
            if idx >= frame.node.num_values as usize || K::from_bytes(frame.node.key_bytes(idx)) != key {
                return Err(Error::NotFound);
            }
            let current = V::from_bytes(frame.node.value_bytes(idx));
            if equiv(&current) {
                break current;
            }
            if idx == 0 {
                if frame.node.prev == 0 {
                    return Err(Error::NotFound);
                }
                let prev_addr = frame.node.prev;
                frame.node = self.load(dev, prev_addr)?;
                if frame.node.num_values == 0 {
                    return Err(Error::NotFound);
                }
                idx = frame.node.num_values as usize - 1;
            } else {
                idx -= 1;
            }
        };

        frame.node.shift_left(idx);
        self.store(dev, &frame.node)?;
        self.rebalance_after_remove(dev, ctx, path, frame.node)?;
        Ok(removed)
    }

    /// Removes the first entry matching `key`, regardless of value. A
    /// convenience for single-valued keys (the free-block, root-table, and
    /// inode trees never hold duplicate keys).
    pub fn remove(&mut self, dev: &mut dyn BlockDevice, ctx: &mut dyn TreeContext, key: K) -> Result<V> {
        self.remove_matching(dev, ctx, key, |_| true)
    }

    /// Removes the entry with the smallest key that is `>= min_key`,
    /// returning its key and value. Used by the allocator's best-fit
    /// search over the free-block tree, which is keyed by extent length:
    /// it needs "the smallest free extent at least this big", not an
    /// exact-length match.
    pub fn remove_first_ge(
        &mut self,
        dev: &mut dyn BlockDevice,
        ctx: &mut dyn TreeContext,
        min_key: K,
    ) -> Result<(K, V)> {
        if self.is_empty_tree() {
            return Err(Error::NotFound);
        }

        let mut path = self.descend(dev, min_key)?;
        let mut frame = path.pop().unwrap();
        let idx = frame.child_index;
        if idx >= frame.node.num_values as usize {
            return Err(Error::NotFound);
        }

        let found_key = K::from_bytes(frame.node.key_bytes(idx));
        let value = V::from_bytes(frame.node.value_bytes(idx));

        frame.node.shift_left(idx);
        self.store(dev, &frame.node)?;
        self.rebalance_after_remove(dev, ctx, path, frame.node)?;
        Ok((found_key, value))
    }

    fn rebalance_after_remove(
        &mut self,
        dev: &mut dyn BlockDevice,
        ctx: &mut dyn TreeContext,
        mut path: Path,
        mut node: RawNode,
    ) -> Result<()> {
        loop {
            let parent_frame = match path.pop() {
                Some(f) => f,
                None => {
                    // At the root. Collapse a single-child internal root.
                    if !node.is_leaf() && node.num_values == 1 {
                        let only_child = node.address_value(0);
                        ctx.free_node(dev, node.addr)?;
                        self.root = only_child;
                        return ctx.on_root_change(only_child);
                    }
                    return Ok(());
                }
            };

            let min_occupancy = node.cap / 2;
            if node.num_values as usize >= min_occupancy {
                // Still fix up the parent's separator key for the last entry,
                // since a removal may have shrunk this node's max key.
                return self.fix_parent_separator(dev, parent_frame, node);
            }

            let mut parent = parent_frame.node;
            let my_index = parent_frame.child_index;

            let left_sibling_addr =
                if my_index > 0 { Some(parent.address_value(my_index - 1)) } else { None };
            let right_sibling_addr = if my_index + 1 < parent.num_values as usize {
                Some(parent.address_value(my_index + 1))
            } else {
                None
            };

            if let Some(left_addr) = left_sibling_addr {
                let left = self.load(dev, left_addr)?;
                if left.num_values as usize + node.num_values as usize <= node.cap {
                    // Merge node into left, drop node's parent entry.
                    let merged = merge(&left, &node);
                    self.store(dev, &merged)?;
                    ctx.free_node(dev, node.addr)?;
                    remove_direct(&mut parent, my_index);
                    parent.set_key_bytes(
                        my_index - 1,
                        merged.key_bytes(merged.num_values as usize - 1),
                    );
                    self.store(dev, &parent)?;
                    node = parent;
                    continue;
                }

                // Abduct the left sibling's highest entry.
                let (donor, stolen_key, stolen_val) = abduct_highest(&left);
                self.store(dev, &donor)?;
                node.shift_right(0);
                node.set_key_bytes(0, &stolen_key);
                node.set_value_bytes(0, &stolen_val);
                self.store(dev, &node)?;
                parent.set_key_bytes(my_index - 1, donor.key_bytes(donor.num_values as usize - 1));
                self.store(dev, &parent)?;
                return self.fix_parent_separator(dev, PathFrame { node: parent, child_index: my_index }, node);
            }

            if let Some(right_addr) = right_sibling_addr {
                let right = self.load(dev, right_addr)?;
                if right.num_values as usize + node.num_values as usize <= node.cap {
                    let merged = merge(&node, &right);
                    self.store(dev, &merged)?;
                    ctx.free_node(dev, right.addr)?;
                    remove_direct(&mut parent, my_index + 1);
                    parent.set_key_bytes(my_index, merged.key_bytes(merged.num_values as usize - 1));
                    self.store(dev, &parent)?;
                    node = parent;
                    continue;
                }

                // Abduct the right sibling's lowest entry.
                let (donor, stolen_key, stolen_val) = abduct_lowest(&right);
                self.store(dev, &donor)?;
                let at = node.num_values as usize;
                node.shift_right(at);
                node.set_key_bytes(at, &stolen_key);
                node.set_value_bytes(at, &stolen_val);
                self.store(dev, &node)?;
                parent.set_key_bytes(my_index, node.key_bytes(node.num_values as usize - 1));
                self.store(dev, &parent)?;
                return self.fix_parent_separator(dev, PathFrame { node: parent, child_index: my_index }, node);
            }

            // No sibling to adopt from or merge with (only child). Leave as
            // is; the parent collapse case above handles a root with one
            // remaining child.
            return self.fix_parent_separator(dev, parent_frame, node);
        }
    }

    /// After a node's contents changed without a structural split/merge,
    /// keeps its parent's separator key (which mirrors this node's highest
    /// key) correct, propagating upward as needed.
    fn fix_parent_separator(
        &mut self,
        dev: &mut dyn BlockDevice,
        mut parent_frame: PathFrame,
        node: RawNode,
    ) -> Result<()> {
        if node.num_values == 0 {
            self.store(dev, &node)?;
            return Ok(());
        }
        let new_max = node.key_bytes(node.num_values as usize - 1).to_vec();
        let idx = parent_frame.child_index;
        if parent_frame.node.key_bytes(idx) != new_max.as_slice() {
            parent_frame.node.set_key_bytes(idx, &new_max);
            self.store(dev, &parent_frame.node)?;
        }
        self.store(dev, &node)
    }

    /// Walks every value in descending key order (following the leaf
    /// `prev` chain from the rightmost leaf), invoking `visit` for each.
    /// `visit` returning [`ControlFlow::Stop`] ends the walk early;
    /// [`ControlFlow::Retry`] re-invokes `visit` on the same value.
    pub fn walk(
        &self,
        dev: &mut dyn BlockDevice,
        mut visit: impl FnMut(K, &V) -> Result<ControlFlow>,
    ) -> Result<()> {
        if self.is_empty_tree() {
            return Ok(());
        }

        let mut leaf = self.descend_edge(dev, false)?;
        loop {
            let mut idx = leaf.num_values as usize;
            while idx > 0 {
                idx -= 1;
                let key = K::from_bytes(leaf.key_bytes(idx));
                let value = V::from_bytes(leaf.value_bytes(idx));
                loop {
                    match visit(key, &value)? {
                        ControlFlow::Continue => break,
                        ControlFlow::Retry => continue,
                        ControlFlow::Stop => return Ok(()),
                    }
                }
            }
            if leaf.prev == 0 {
                return Ok(());
            }
            leaf = self.load(dev, leaf.prev)?;
        }
    }

    /// Counts the total number of values stored in the tree. Not cached
    /// anywhere; always derived by walking.
    pub fn count_values(&self, dev: &mut dyn BlockDevice) -> Result<u64> {
        let mut count = 0u64;
        self.walk(dev, |_, _| {
            count += 1;
            Ok(ControlFlow::Continue)
        })?;
        Ok(count)
    }

    /// Counts the number of on-disk nodes making up the tree, i.e. the
    /// tree's own footprint in `node_size`-sized blocks. Used to report how
    /// much of a device's free-block tree is spent on the tree's own
    /// bookkeeping rather than on the extents it indexes.
    pub fn count_nodes(&self, dev: &mut dyn BlockDevice) -> Result<u64> {
        if self.is_empty_tree() {
            return Ok(0);
        }
        self.count_nodes_subtree(dev, self.root)
    }

    fn count_nodes_subtree(&self, dev: &mut dyn BlockDevice, addr: u64) -> Result<u64> {
        let node = self.load(dev, addr)?;
        let mut total = 1u64;
        if !node.is_leaf() {
            for i in 0..node.num_values as usize {
                total += self.count_nodes_subtree(dev, node.address_value(i))?;
            }
        }
        Ok(total)
    }

    /// Frees every node in the tree, invoking `on_leaf_value` for each
    /// leaf value first (so callers can release resources a value itself
    /// references, e.g. a file's data extents).
    pub fn destroy(
        &mut self,
        dev: &mut dyn BlockDevice,
        alloc: &mut dyn TreeAllocator,
        mut on_leaf_value: impl FnMut(K, &V) -> Result<ControlFlow>,
    ) -> Result<()> {
        if self.is_empty_tree() {
            return Ok(());
        }
        self.destroy_subtree(dev, alloc, self.root, &mut on_leaf_value)?;
        self.root = 0;
        Ok(())
    }

    fn destroy_subtree(
        &self,
        dev: &mut dyn BlockDevice,
        alloc: &mut dyn TreeAllocator,
        addr: u64,
        on_leaf_value: &mut impl FnMut(K, &V) -> Result<ControlFlow>,
    ) -> Result<()> {
        let node = self.load(dev, addr)?;
        if node.is_leaf() {
            for i in 0..node.num_values as usize {
                let key = K::from_bytes(node.key_bytes(i));
                let value = V::from_bytes(node.value_bytes(i));
                match on_leaf_value(key, &value)? {
                    ControlFlow::Stop => break,
                    _ => {}
                }
            }
        } else {
            for i in 0..node.num_values as usize {
                self.destroy_subtree(dev, alloc, node.address_value(i), on_leaf_value)?;
            }
        }
        alloc.free_node(dev, addr)
    }
}

/// The first index `i` such that `key < keys[i]`, or `num_values` if none
/// matches (i.e. `key` is at least as large as every existing key). This is
/// the insertion point that places a new entry after any existing
/// equal-keyed entries.
fn first_index_greater<K: TreeKey>(node: &RawNode, key: K) -> usize {
    let n = node.num_values as usize;
    for i in 0..n {
        if key < K::from_bytes(node.key_bytes(i)) {
            return i;
        }
    }
    n
}

/// The first index `i` such that `keys[i] >= key` (a standard lower bound),
/// or `num_values` if `key` exceeds every key in the node.
fn lower_bound<K: TreeKey>(node: &RawNode, key: K) -> usize {
    let n = node.num_values as usize;
    for i in 0..n {
        if key <= K::from_bytes(node.key_bytes(i)) {
            return i;
        }
    }
    n
}

/// Internal-node child selection: each key holds the maximum key present
/// in the corresponding child's subtree, so the child that might contain
/// `key` is the first one whose key is at least `key` — falling through to
/// the last child when `key` exceeds everything currently in the tree
/// (relevant while inserting a new maximum).
fn locate<K: TreeKey>(node: &RawNode, key: K) -> usize {
    let n = node.num_values as usize;
    if n == 0 {
        return 0;
    }
    let lb = lower_bound(node, key);
    if lb == n {
        n - 1
    } else {
        lb
    }
}

fn insert_direct(node: &mut RawNode, at: usize, key_bytes: &[u8], value_bytes: &[u8]) {
    node.shift_right(at);
    node.set_key_bytes(at, key_bytes);
    node.set_value_bytes(at, value_bytes);
}

fn remove_direct(node: &mut RawNode, at: usize) {
    node.shift_left(at);
}

/// Splits a full node in half: the new sibling takes the lower-keyed half
/// of the entries, the original node keeps the upper half. Returns the new
/// sibling and the separator key to insert into the parent (the sibling's
/// highest key).
fn split(node: &mut RawNode, ctx: &mut dyn TreeContext, dev: &mut dyn BlockDevice) -> Result<(RawNode, Vec<u8>)> {
    let n = node.num_values as usize;
    let lower_count = n / 2;
    let is_leaf = node.is_leaf();
    let old_prev = node.prev;

    let addr = ctx.allocate_node(dev)?;
    let mut sibling = RawNode::empty(addr, node.level, node.node_size, node.key_size, node.record_size);

    for i in 0..lower_count {
        sibling.set_key_bytes(i, node.key_bytes(i));
        sibling.set_value_bytes(i, node.value_bytes(i));
    }
    sibling.num_values = lower_count as u32;
    sibling.prev = old_prev;

    let separator = sibling.key_bytes(lower_count - 1).to_vec();

    for i in 0..(n - lower_count) {
        let kb = node.key_bytes(i + lower_count).to_vec();
        let vb = node.value_bytes(i + lower_count).to_vec();
        node.set_key_bytes(i, &kb);
        node.set_value_bytes(i, &vb);
    }
    node.num_values = (n - lower_count) as u32;
    node.prev = if is_leaf { sibling.addr } else { 0 };

    Ok((sibling, separator))
}

/// Merges `right`'s entries onto the end of `left`, returning the combined
/// node (stored at `left`'s address; `right`'s address is freed by the
/// caller).
fn merge(left: &RawNode, right: &RawNode) -> RawNode {
    let mut merged = left.clone();
    let base = merged.num_values as usize;
    for i in 0..right.num_values as usize {
        let at = base + i;
        merged.shift_right(at);
        merged.set_key_bytes(at, right.key_bytes(i));
        merged.set_value_bytes(at, right.value_bytes(i));
    }
    if merged.is_leaf() {
        merged.prev = right.prev;
    }
    merged
}

/// Removes and returns the highest-keyed entry from `donor`, along with the
/// updated donor node.
fn abduct_highest(donor: &RawNode) -> (RawNode, Vec<u8>, Vec<u8>) {
    let mut donor = donor.clone();
    let idx = donor.num_values as usize - 1;
    let key = donor.key_bytes(idx).to_vec();
    let value = donor.value_bytes(idx).to_vec();
    remove_direct(&mut donor, idx);
    (donor, key, value)
}

/// Removes and returns the lowest-keyed entry from `donor`, along with the
/// updated donor node.
fn abduct_lowest(donor: &RawNode) -> (RawNode, Vec<u8>, Vec<u8>) {
    let mut donor = donor.clone();
    let key = donor.key_bytes(0).to_vec();
    let value = donor.value_bytes(0).to_vec();
    remove_direct(&mut donor, 0);
    (donor, key, value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block_io::MemDevice;
    use crate::extent::Extent;

    struct BumpAllocator {
        next: u64,
        node_size: u64,
    }

    impl TreeAllocator for BumpAllocator {
        fn allocate_node(&mut self, _dev: &mut dyn BlockDevice) -> Result<u64> {
            let addr = self.next;
            self.next += self.node_size;
            Ok(addr)
        }
        fn free_node(&mut self, _dev: &mut dyn BlockDevice, _addr: u64) -> Result<()> {
            Ok(())
        }
    }

    impl RootSink for BumpAllocator {
        fn on_root_change(&mut self, _new_root: u64) -> Result<()> {
            Ok(())
        }
    }

    fn new_tree() -> (BmTree<u64, Extent>, MemDevice, BumpAllocator) {
        let node_size = 512u64;
        let dev = MemDevice::new(node_size * 4096);
        let ctx = BumpAllocator { next: node_size, node_size };
        (BmTree::new(0, node_size, 16, 12), dev, ctx)
    }

    #[test]
    fn insert_and_search_round_trip() {
        let (mut tree, mut dev, mut ctx) = new_tree();

        for i in 0..5u64 {
            tree.insert(&mut dev, &mut ctx, i, &Extent::new(i * 100, 1), true).unwrap();
        }

        for i in 0..5u64 {
            let got = tree.search(&mut dev, i).unwrap();
            assert_eq!(got, Extent::new(i * 100, 1));
        }
        assert_eq!(tree.search(&mut dev, 99).unwrap_err(), Error::NotFound);
    }

    #[test]
    fn duplicate_rejected_when_asked() {
        let (mut tree, mut dev, mut ctx) = new_tree();
        tree.insert(&mut dev, &mut ctx, 1, &Extent::new(0, 1), true).unwrap();
        let err = tree.insert(&mut dev, &mut ctx, 1, &Extent::new(0, 1), true).unwrap_err();
        assert_eq!(err, Error::Exists);
    }

    #[test]
    fn keys_spanning_a_byte_boundary_stay_correctly_ordered() {
        // Regression test: keys must be compared numerically, not as raw
        // little-endian byte slices (under which e.g. 1 sorts after 256).
        let (mut tree, mut dev, mut ctx) = new_tree();
        let keys = [1u64, 256, 65536, 2_000_000, 300, 4096, 5];
        for &k in &keys {
            tree.insert(&mut dev, &mut ctx, k, &Extent::new(k, 1), true).unwrap();
        }

        for &k in &keys {
            assert_eq!(tree.search(&mut dev, k).unwrap(), Extent::new(k, 1));
        }

        let mut seen = Vec::new();
        tree.walk(&mut dev, |k, _| {
            seen.push(k);
            Ok(ControlFlow::Continue)
        })
        .unwrap();
        let mut expected = keys.to_vec();
        expected.sort_unstable();
        expected.reverse();
        assert_eq!(seen, expected);
    }

    #[test]
    fn insertion_forces_node_splits_and_stays_searchable() {
        let (mut tree, mut dev, mut ctx) = new_tree();

        let n = 200u64;
        for i in 0..n {
            tree.insert(&mut dev, &mut ctx, i, &Extent::new(i, 1), true).unwrap();
        }

        assert_eq!(tree.count_values(&mut dev).unwrap(), n);
        for i in 0..n {
            assert_eq!(tree.search(&mut dev, i).unwrap(), Extent::new(i, 1));
        }
        assert_eq!(tree.get_first(&mut dev).unwrap(), Extent::new(0, 1));
        assert_eq!(tree.get_last(&mut dev).unwrap(), Extent::new(n - 1, 1));
    }

    #[test]
    fn remove_shrinks_tree_and_keeps_remaining_values_searchable() {
        let (mut tree, mut dev, mut ctx) = new_tree();

        let n = 150u64;
        for i in 0..n {
            tree.insert(&mut dev, &mut ctx, i, &Extent::new(i, 1), true).unwrap();
        }

        for i in (0..n).step_by(2) {
            tree.remove(&mut dev, &mut ctx, i).unwrap();
        }

        assert_eq!(tree.count_values(&mut dev).unwrap(), n / 2);
        for i in 0..n {
            let result = tree.search(&mut dev, i);
            if i % 2 == 0 {
                assert_eq!(result.unwrap_err(), Error::NotFound);
            } else {
                assert_eq!(result.unwrap(), Extent::new(i, 1));
            }
        }
    }

    #[test]
    fn walk_visits_in_descending_key_order() {
        let (mut tree, mut dev, mut ctx) = new_tree();
        for i in 0..50u64 {
            tree.insert(&mut dev, &mut ctx, i, &Extent::new(i, 1), true).unwrap();
        }

        let mut seen = Vec::new();
        tree.walk(&mut dev, |k, _| {
            seen.push(k);
            Ok(ControlFlow::Continue)
        })
        .unwrap();

        let mut expected: Vec<u64> = (0..50).collect();
        expected.reverse();
        assert_eq!(seen, expected);
    }

    #[test]
    fn walk_stop_halts_early() {
        let (mut tree, mut dev, mut ctx) = new_tree();
        for i in 0..50u64 {
            tree.insert(&mut dev, &mut ctx, i, &Extent::new(i, 1), true).unwrap();
        }

        let mut seen = 0;
        tree.walk(&mut dev, |_, _| {
            seen += 1;
            if seen == 5 {
                Ok(ControlFlow::Stop)
            } else {
                Ok(ControlFlow::Continue)
            }
        })
        .unwrap();
        assert_eq!(seen, 5);
    }
}
