// Copyright 2025 Occlite Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Ordered transactional index
//!
//! A tree of fan-out-limited leaves over byte-string keys. Leaves hold
//! key-sorted entry arrays and are chained for in-order scans; interior
//! nodes route by 8-byte key slices (a `u64` ikey prefix compared before
//! the full key, so most comparisons are one integer compare).
//!
//! # Locking
//!
//! There is no tree-wide lock. Each node carries its own payload lock and
//! a version word with INSERTING and SPLITTING bits; structural mutations
//! lock only the nodes they touch (the leaf, and on a split the parents
//! upward), so inserts into unrelated leaves proceed concurrently, the
//! same granularity the hash index gets from its per-bucket locks.
//! Descents are optimistic: one node lock at a time, each routing step
//! validated against the routing parent's version after the child is
//! locked, retrying from the root when a split moved the key range
//! mid-descent. Splits only move entries to the right, so forward chain
//! walks read the next link under the same lock as the entries; reverse
//! walks revalidate the back link and slide right past any sibling a
//! concurrent split linked in.
//!
//! # Phantom protection
//!
//! A lookup that misses, and every leaf a range scan visits, registers an
//! "internode" observation of the leaf version, which any later entry
//! insert or split invalidates at commit. A transaction's own insert
//! upgrades its prior observation of the target leaf from the pre-insert
//! to the post-insert version, so it does not abort on its own change but
//! still aborts on anyone else's.
//!
//! Record-level semantics (invalid marker, read-my-writes, deferred
//! physical removal) are identical to the unordered index.

use std::cmp::Ordering as CmpOrdering;
use std::sync::atomic::{fence, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use smallvec::SmallVec;

use crate::core::{AbortReason, Epoch, Error, Result, RowId, TableId};
use crate::index::arena::{Arena, NIL};
use crate::stm::engine::{Engine, StmObject, ThreadContext};
use crate::stm::glue::{is_phantom, observe, select_for_overwrite, select_for_update};
use crate::stm::item::{ItemKey, TxnItem, DELETE_FLAG, INSERT_FLAG};
use crate::stm::rcu::RcuSet;
use crate::stm::version::{is_invalid, unlocked, NodeVersion, VersionPolicy, COUNTER_STEP};

/// Configuration of an ordered index.
#[derive(Debug, Clone, Copy)]
pub struct OrderedIndexConfig {
    /// Maximum entries per leaf (and boundaries per interior node).
    pub fanout: usize,
    /// Version validation policy for records in this index.
    pub policy: VersionPolicy,
    /// Whether a transaction's own pending writes are visible to its later
    /// reads.
    pub read_my_writes: bool,
}

impl Default for OrderedIndexConfig {
    fn default() -> Self {
        Self {
            fanout: 15,
            policy: VersionPolicy::Nonopaque,
            read_my_writes: true,
        }
    }
}

/// 8-byte big-endian key slice, zero padded. Comparing slices first agrees
/// with lexicographic byte order, the full key breaking ties.
#[inline]
fn ikey_of(key: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    let n = key.len().min(8);
    buf[..n].copy_from_slice(&key[..n]);
    u64::from_be_bytes(buf)
}

#[inline]
fn cmp_key(a_ik: u64, a: &[u8], b_ik: u64, b: &[u8]) -> CmpOrdering {
    a_ik.cmp(&b_ik).then_with(|| a.cmp(b))
}

#[derive(Clone)]
struct LeafEntry {
    ikey: u64,
    key: Box<[u8]>,
    slot: u32,
}

struct BoundKey {
    ikey: u64,
    key: Box<[u8]>,
}

enum NodeKind {
    Leaf {
        /// Key-sorted, at most `fanout` entries outside a split.
        entries: Vec<LeafEntry>,
    },
    Interior {
        /// `children[i]` covers keys below `boundaries[i]`; the last child
        /// covers everything at or above the last boundary.
        boundaries: Vec<BoundKey>,
        children: Vec<u32>,
    },
}

struct TreeNode {
    /// Bumped on any completed structural change; the transactional
    /// interlock, read lock-free by validators and descents.
    version: NodeVersion,
    parent: AtomicU32,
    /// Leaf chain links; NIL on interior nodes.
    prev: AtomicU32,
    next: AtomicU32,
    /// Payload lock: the node's mutual exclusion. Held for the duration
    /// of the structural mutation only.
    kind: RwLock<NodeKind>,
}

/// Result of a read-path leaf lookup.
enum LeafLookup {
    Found { slot: u32 },
    Absent { leaf: u32, version: u64 },
}

/// Result of a locked-cursor insert.
enum TreeInsert {
    Found {
        slot: u32,
    },
    Inserted {
        leaf: u32,
        prev_version: u64,
        new_version: u64,
    },
}

/// Consistent per-leaf snapshot taken under the leaf's lock, for scans.
struct LeafView {
    version: u64,
    entries: Vec<LeafEntry>,
    prev: u32,
    next: u32,
}

struct Tree {
    /// Node registry: push-only, ids are stable, nodes are never freed.
    /// The registry lock is only held to resolve an id or push a node.
    nodes: RwLock<Vec<Arc<TreeNode>>>,
    root: AtomicU32,
    fanout: usize,
}

impl Tree {
    fn new(fanout: usize) -> Self {
        Self {
            nodes: RwLock::new(vec![Arc::new(TreeNode {
                version: NodeVersion::new(),
                parent: AtomicU32::new(NIL),
                prev: AtomicU32::new(NIL),
                next: AtomicU32::new(NIL),
                kind: RwLock::new(NodeKind::Leaf {
                    entries: Vec::new(),
                }),
            })]),
            root: AtomicU32::new(0),
            fanout,
        }
    }

    #[inline]
    fn node(&self, id: u32) -> Arc<TreeNode> {
        Arc::clone(&self.nodes.read()[id as usize])
    }

    fn alloc_node(&self, node: TreeNode) -> u32 {
        let mut nodes = self.nodes.write();
        let id = nodes.len() as u32;
        nodes.push(Arc::new(node));
        id
    }

    fn leaf_search(
        entries: &[LeafEntry],
        ik: u64,
        key: &[u8],
    ) -> std::result::Result<usize, usize> {
        entries.binary_search_by(|e| cmp_key(e.ikey, &e.key, ik, key))
    }

    /// Whether a node just locked is still the one the descent routed to:
    /// the routing parent's version must not have moved (a split of this
    /// node, or a re-parenting of it, bumps the parent), and a root must
    /// still be the root.
    fn link_valid(node: &TreeNode, parent: &Option<(Arc<TreeNode>, u64)>) -> bool {
        match parent {
            Some((p, pv)) => p.version.snapshot() == *pv,
            None => node.parent.load(Ordering::Acquire) == NIL,
        }
    }

    /// One optimistic descent to the leaf covering `key`, holding one node
    /// lock at a time. Returns the candidate leaf, its id, and the routing
    /// parent snapshot the caller must revalidate after locking the leaf.
    fn descend(&self, ik: u64, key: &[u8]) -> (Arc<TreeNode>, u32, Option<(Arc<TreeNode>, u64)>) {
        'retry: loop {
            let root_id = self.root.load(Ordering::Acquire);
            let mut node = self.node(root_id);
            let mut node_id = root_id;
            let mut parent: Option<(Arc<TreeNode>, u64)> = None;
            loop {
                let guard = node.kind.read();
                if !Self::link_valid(&node, &parent) {
                    continue 'retry;
                }
                let child = match &*guard {
                    NodeKind::Leaf { .. } => NIL,
                    NodeKind::Interior {
                        boundaries,
                        children,
                    } => {
                        let idx = boundaries.partition_point(|b| {
                            cmp_key(b.ikey, &b.key, ik, key) != CmpOrdering::Greater
                        });
                        children[idx]
                    }
                };
                let v = node.version.snapshot();
                drop(guard);
                if child == NIL {
                    return (node, node_id, parent);
                }
                parent = Some((Arc::clone(&node), v));
                node = self.node(child);
                node_id = child;
            }
        }
    }

    /// Read-path lookup: locate the covering leaf and search it under its
    /// lock, revalidating the route.
    fn lookup(&self, ik: u64, key: &[u8]) -> LeafLookup {
        loop {
            let (leaf, leaf_id, parent) = self.descend(ik, key);
            let guard = leaf.kind.read();
            if !Self::link_valid(&leaf, &parent) {
                continue;
            }
            let NodeKind::Leaf { entries } = &*guard else {
                unreachable!("descend returned interior node");
            };
            return match Self::leaf_search(entries, ik, key) {
                Ok(pos) => LeafLookup::Found {
                    slot: entries[pos].slot,
                },
                Err(_) => LeafLookup::Absent {
                    leaf: leaf_id,
                    version: leaf.version.snapshot(),
                },
            };
        }
    }

    /// Locate the leaf a scan should start from. A stale route can only
    /// land left of the true covering leaf (splits move entries right),
    /// which the chain walk absorbs.
    fn locate_leaf(&self, ik: u64, key: &[u8]) -> u32 {
        loop {
            let (leaf, leaf_id, parent) = self.descend(ik, key);
            let _guard = leaf.kind.read();
            if Self::link_valid(&leaf, &parent) {
                return leaf_id;
            }
        }
    }

    /// Snapshot a leaf for scanning: version, entries, and chain links,
    /// all under the leaf's lock.
    fn read_leaf(&self, id: u32) -> LeafView {
        let node = self.node(id);
        let guard = node.kind.read();
        let NodeKind::Leaf { entries } = &*guard else {
            unreachable!("leaf chain reached interior node");
        };
        LeafView {
            version: node.version.snapshot(),
            entries: entries.clone(),
            prev: node.prev.load(Ordering::Acquire),
            next: node.next.load(Ordering::Acquire),
        }
    }

    /// Locked-cursor insert: lock the covering leaf, splice the entry,
    /// split on overflow. Returns the existing slot if the key is already
    /// present.
    fn insert_entry(&self, ik: u64, key: &[u8], slot: u32) -> TreeInsert {
        loop {
            let (leaf, leaf_id, parent) = self.descend(ik, key);
            let mut guard = leaf.kind.write();
            if !Self::link_valid(&leaf, &parent) {
                continue;
            }
            let NodeKind::Leaf { entries } = &mut *guard else {
                unreachable!("descend returned interior node");
            };
            match Self::leaf_search(entries, ik, key) {
                Ok(pos) => {
                    return TreeInsert::Found {
                        slot: entries[pos].slot,
                    }
                }
                Err(pos) => {
                    let prev_version = leaf.version.lock();
                    leaf.version.mark_inserting();
                    entries.insert(
                        pos,
                        LeafEntry {
                            ikey: ik,
                            key: key.into(),
                            slot,
                        },
                    );
                    if entries.len() > self.fanout {
                        self.split_leaf(&leaf, leaf_id, entries);
                    }
                    let new_version = leaf.version.unlock();
                    return TreeInsert::Inserted {
                        leaf: leaf_id,
                        prev_version,
                        new_version,
                    };
                }
            }
        }
    }

    /// Remove an entry under its leaf's lock; the version bump invalidates
    /// observers of the leaf.
    fn remove_entry(&self, ik: u64, key: &[u8], slot: u32) -> bool {
        loop {
            let (leaf, _leaf_id, parent) = self.descend(ik, key);
            let mut guard = leaf.kind.write();
            if !Self::link_valid(&leaf, &parent) {
                continue;
            }
            let NodeKind::Leaf { entries } = &mut *guard else {
                unreachable!("descend returned interior node");
            };
            return match Self::leaf_search(entries, ik, key) {
                Ok(pos) if entries[pos].slot == slot => {
                    leaf.version.lock();
                    leaf.version.mark_inserting();
                    entries.remove(pos);
                    leaf.version.unlock();
                    true
                }
                _ => false,
            };
        }
    }

    /// Split a leaf whose lock and version lock the caller holds. The
    /// upper half moves to a fresh right sibling; the right neighbor's
    /// back link is fixed up atomically (reverse walks revalidate it).
    fn split_leaf(&self, leaf: &Arc<TreeNode>, leaf_id: u32, entries: &mut Vec<LeafEntry>) {
        leaf.version.mark_splitting();
        let mid = entries.len() / 2;
        let upper = entries.split_off(mid);
        let bound = BoundKey {
            ikey: upper[0].ikey,
            key: upper[0].key.clone(),
        };
        let old_next = leaf.next.load(Ordering::Acquire);
        let sib_id = self.alloc_node(TreeNode {
            version: NodeVersion::new(),
            // Provisional; settled under the parent's lock below.
            parent: AtomicU32::new(leaf.parent.load(Ordering::Acquire)),
            prev: AtomicU32::new(leaf_id),
            next: AtomicU32::new(old_next),
            kind: RwLock::new(NodeKind::Leaf { entries: upper }),
        });
        leaf.next.store(sib_id, Ordering::Release);
        if old_next != NIL {
            self.node(old_next).prev.store(sib_id, Ordering::Release);
        }
        self.insert_into_parent(leaf, leaf_id, bound, sib_id);
    }

    /// Insert the boundary of a freshly split node into its parent,
    /// creating a new root when the split node was the root.
    ///
    /// The caller holds the left node's lock, so once the parent's lock is
    /// held and the back link still matches, the parent cannot change
    /// under us; a mismatch means a concurrent split of the parent
    /// re-parented the left node while we waited, and the loop re-resolves.
    fn insert_into_parent(&self, left: &Arc<TreeNode>, left_id: u32, bound: BoundKey, right_id: u32) {
        loop {
            let parent_id = left.parent.load(Ordering::Acquire);
            if parent_id == NIL {
                let root_id = self.alloc_node(TreeNode {
                    version: NodeVersion::new(),
                    parent: AtomicU32::new(NIL),
                    prev: AtomicU32::new(NIL),
                    next: AtomicU32::new(NIL),
                    kind: RwLock::new(NodeKind::Interior {
                        boundaries: vec![bound],
                        children: vec![left_id, right_id],
                    }),
                });
                self.node(right_id).parent.store(root_id, Ordering::Release);
                left.parent.store(root_id, Ordering::Release);
                self.root.store(root_id, Ordering::Release);
                return;
            }
            let parent = self.node(parent_id);
            let mut guard = parent.kind.write();
            if left.parent.load(Ordering::Acquire) != parent_id {
                continue;
            }
            self.node(right_id).parent.store(parent_id, Ordering::Release);
            let NodeKind::Interior {
                boundaries,
                children,
            } = &mut *guard
            else {
                unreachable!("parent of a split node is not interior");
            };
            parent.version.lock();
            parent.version.mark_inserting();
            let pos = boundaries.partition_point(|b| {
                cmp_key(b.ikey, &b.key, bound.ikey, &bound.key) != CmpOrdering::Greater
            });
            boundaries.insert(pos, bound);
            children.insert(pos + 1, right_id);
            if boundaries.len() > self.fanout {
                self.split_interior(&parent, parent_id, boundaries, children);
            }
            parent.version.unlock();
            return;
        }
    }

    /// Split an interior node whose lock and version lock the caller
    /// holds (through `insert_into_parent`).
    fn split_interior(
        &self,
        node: &Arc<TreeNode>,
        node_id: u32,
        boundaries: &mut Vec<BoundKey>,
        children: &mut Vec<u32>,
    ) {
        node.version.mark_splitting();
        let mid = boundaries.len() / 2;
        let mut upper_b = boundaries.split_off(mid);
        let up = upper_b.remove(0);
        let upper_c = children.split_off(mid + 1);
        let moved = upper_c.clone();
        let sib_id = self.alloc_node(TreeNode {
            version: NodeVersion::new(),
            parent: AtomicU32::new(node.parent.load(Ordering::Acquire)),
            prev: AtomicU32::new(NIL),
            next: AtomicU32::new(NIL),
            kind: RwLock::new(NodeKind::Interior {
                boundaries: upper_b,
                children: upper_c,
            }),
        });
        // Re-parent the moved children. A child mid-split re-resolves its
        // parent under the parent's lock, so the store is safe.
        for c in moved {
            self.node(c).parent.store(sib_id, Ordering::Release);
        }
        self.insert_into_parent(node, node_id, up, sib_id);
    }
}

/// Ordered index with transactional point operations and range scans.
pub struct OrderedIndex<V> {
    table_id: TableId,
    config: OrderedIndexConfig,
    tree: Tree,
    arena: Arc<Arena<Box<[u8]>, V>>,
    key_gen: AtomicU64,
}

impl<V> OrderedIndex<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Create and register an ordered index with the engine.
    pub fn new(engine: &Engine, config: OrderedIndexConfig) -> Arc<Self> {
        assert!(config.fanout >= 2, "fanout must be at least 2");
        engine.attach_with(|table_id| {
            Arc::new(Self {
                table_id,
                config,
                tree: Tree::new(config.fanout),
                arena: Arc::new(Arena::new()),
                key_gen: AtomicU64::new(0),
            })
        })
    }

    /// Monotonically increasing key-id generator.
    #[inline]
    pub fn gen_key(&self) -> u64 {
        self.key_gen.fetch_add(1, Ordering::AcqRel)
    }

    /// Transactional point lookup by key.
    ///
    /// A miss registers an internode observation of the covering leaf, so
    /// a later insert of this key by anyone else aborts this transaction
    /// at commit.
    pub fn select_row(
        &self,
        ctx: &mut ThreadContext,
        key: &[u8],
        for_update: bool,
    ) -> Result<Option<(RowId, V)>> {
        ctx.require_active()?;
        let ik = ikey_of(key);
        match self.tree.lookup(ik, key) {
            LeafLookup::Found { slot } => self.select_slot(ctx, slot, for_update),
            LeafLookup::Absent { leaf, version } => {
                let item = ctx.txn.item(ItemKey::Internode {
                    table: self.table_id,
                    node: leaf,
                });
                item.observe_version(version);
                Ok(None)
            }
        }
    }

    /// Transactional lookup by row handle, for re-reading a row already
    /// located in this transaction.
    pub fn select_row_at(
        &self,
        ctx: &mut ThreadContext,
        rid: RowId,
        for_update: bool,
    ) -> Result<Option<(RowId, V)>> {
        ctx.require_active()?;
        self.select_slot(ctx, rid.0, for_update)
    }

    fn select_slot(
        &self,
        ctx: &mut ThreadContext,
        sid: u32,
        for_update: bool,
    ) -> Result<Option<(RowId, V)>> {
        let slots = self.arena.read();
        let slot = &slots[sid as usize];
        let vsnap = slot.version.snapshot();
        let item = ctx.txn.item(ItemKey::Record {
            table: self.table_id,
            slot: sid,
        });
        if is_phantom(vsnap, item) {
            return Err(Error::abort(AbortReason::Phantom));
        }
        if self.config.read_my_writes {
            if item.has_delete() {
                return Ok(None);
            }
            if item.has_write {
                let value = if item.has_insert() {
                    slot.value.clone()
                } else {
                    match item.write_ref::<V>() {
                        Some(v) => v.clone(),
                        None => slot.value.clone(),
                    }
                };
                return Ok(Some((RowId(sid), value)));
            }
        }
        if for_update {
            select_for_update(item, &slot.version, self.config.policy)?;
        } else {
            observe(item, &slot.version, self.config.policy)?;
        }
        if slot.deleted.load(Ordering::Acquire) {
            return Ok(None);
        }
        Ok(Some((RowId(sid), slot.value.clone())))
    }

    /// Stage a new value for a row previously opened with
    /// `select_row(key, true)` in the same transaction.
    pub fn update_row(&self, ctx: &mut ThreadContext, rid: RowId, new_value: V) -> Result<()> {
        ctx.require_active()?;
        let item = ctx
            .txn
            .find_item(ItemKey::Record {
                table: self.table_id,
                slot: rid.0,
            })
            .ok_or(Error::InvalidRowHandle)?;
        if !item.has_write || item.has_insert() {
            return Err(Error::InvalidRowHandle);
        }
        item.add_write(Box::new(new_value));
        Ok(())
    }

    /// Transactional insert. Splices an invalid record for an absent key;
    /// the record turns valid when the commit installs it. Between splice
    /// and install the record is visible to others only as a phantom
    /// (point reads abort, scans skip it), and the leaf-version
    /// observation catches structural movement underneath it.
    pub fn insert_row(
        &self,
        ctx: &mut ThreadContext,
        key: &[u8],
        value: V,
        overwrite: bool,
    ) -> Result<bool> {
        ctx.require_active()?;
        let ik = ikey_of(key);
        match self.tree.lookup(ik, key) {
            LeafLookup::Found { slot } => self.insert_present(ctx, slot, value, overwrite),
            LeafLookup::Absent { .. } => {
                let sid = self.arena.alloc(key.into(), value, false);
                match self.tree.insert_entry(ik, key, sid) {
                    TreeInsert::Inserted {
                        leaf,
                        prev_version,
                        new_version,
                    } => {
                        let item = ctx.txn.item(ItemKey::Record {
                            table: self.table_id,
                            slot: sid,
                        });
                        item.set_write_intent();
                        item.add_flags(INSERT_FLAG);

                        // A prior observation of this leaf must move past
                        // our own change; one that does not match the
                        // pre-insert version means the leaf changed since
                        // we looked. The abort path unlinks the record
                        // through the item created above.
                        if let Some(it) = ctx.txn.find_item(ItemKey::Internode {
                            table: self.table_id,
                            node: leaf,
                        }) {
                            if it.has_read() && !it.update_read(prev_version, new_version) {
                                return Err(Error::abort(AbortReason::NodeVersionChanged));
                            }
                        }
                        Ok(false)
                    }
                    TreeInsert::Found { slot } => {
                        // Lost the splice race to a concurrent inserter.
                        // The scratch record was never linked, so it goes
                        // straight back to the arena.
                        let value = self.arena.read()[sid as usize].value.clone();
                        self.arena.free_slot(sid);
                        self.insert_present(ctx, slot, value, overwrite)
                    }
                }
            }
        }
    }

    /// The key-already-present half of an insert.
    fn insert_present(
        &self,
        ctx: &mut ThreadContext,
        sid: u32,
        value: V,
        overwrite: bool,
    ) -> Result<bool> {
        let slots = self.arena.read();
        let slot = &slots[sid as usize];
        let vsnap = slot.version.snapshot();
        let item = ctx.txn.item(ItemKey::Record {
            table: self.table_id,
            slot: sid,
        });
        if is_phantom(vsnap, item) {
            return Err(Error::abort(AbortReason::Phantom));
        }
        if self.config.read_my_writes && item.has_delete() {
            item.clear_flags(DELETE_FLAG);
            item.clear_write();
            item.add_write(Box::new(value));
            return Ok(false);
        }
        if slot.deleted.load(Ordering::Acquire) {
            return Err(Error::abort(AbortReason::ReadValidation));
        }
        if overwrite {
            select_for_overwrite(item, &slot.version, Box::new(value), self.config.policy)?;
            if self.config.read_my_writes && item.has_insert() {
                let staged = item.write_ref::<V>().cloned();
                item.clear_write();
                item.set_write_intent();
                drop(slots);
                if let Some(v) = staged {
                    self.arena.write()[sid as usize].value = v;
                }
            }
        } else {
            observe(item, &slot.version, self.config.policy)?;
        }
        Ok(true)
    }

    /// Transactional delete. Physical removal is deferred to commit
    /// cleanup; deleting the transaction's own insert just flags the item
    /// and the commit removes both.
    pub fn delete_row(&self, ctx: &mut ThreadContext, key: &[u8]) -> Result<bool> {
        ctx.require_active()?;
        let ik = ikey_of(key);
        match self.tree.lookup(ik, key) {
            LeafLookup::Found { slot: sid } => {
                let slots = self.arena.read();
                let slot = &slots[sid as usize];
                let vsnap = slot.version.snapshot();
                let item = ctx.txn.item(ItemKey::Record {
                    table: self.table_id,
                    slot: sid,
                });
                if is_phantom(vsnap, item) {
                    return Err(Error::abort(AbortReason::Phantom));
                }
                if self.config.read_my_writes {
                    if item.has_delete() {
                        return Ok(false);
                    }
                    if is_invalid(vsnap) && item.has_insert() {
                        item.add_flags(DELETE_FLAG);
                        return Ok(true);
                    }
                }
                select_for_update(item, &slot.version, self.config.policy)?;
                fence(Ordering::SeqCst);
                if slot.deleted.load(Ordering::Acquire) {
                    return Err(Error::abort(AbortReason::ReadValidation));
                }
                item.add_flags(DELETE_FLAG);
                Ok(true)
            }
            LeafLookup::Absent { leaf, version } => {
                let item = ctx.txn.item(ItemKey::Internode {
                    table: self.table_id,
                    node: leaf,
                });
                item.observe_version(version);
                Ok(false)
            }
        }
    }

    /// Transactional range scan.
    ///
    /// Forward mode visits keys in `[begin, end)` ascending; reverse mode
    /// visits keys in `(end, begin]` descending. Each visited leaf
    /// registers an internode observation. Invalid (uncommitted) and
    /// deleted records are skipped without aborting. The callback returns
    /// whether to continue; an early stop is still a successful scan.
    ///
    /// The callback runs with no internal lock held.
    pub fn range_scan(
        &self,
        ctx: &mut ThreadContext,
        begin: &[u8],
        end: &[u8],
        reverse: bool,
        mut callback: impl FnMut(&[u8], &V) -> bool,
    ) -> Result<()> {
        ctx.require_active()?;
        let begin_ik = ikey_of(begin);
        let end_ik = ikey_of(end);
        let mut cur_id = self.tree.locate_leaf(begin_ik, begin);
        let mut view = self.tree.read_leaf(cur_id);

        loop {
            let item = ctx.txn.item(ItemKey::Internode {
                table: self.table_id,
                node: cur_id,
            });
            item.observe_version(view.version);

            let mut batch: SmallVec<[(Box<[u8]>, V); 8]> = SmallVec::new();
            let mut reached_end = false;
            {
                let slots = self.arena.read();
                let mut visit = |e: &LeafEntry| -> Result<bool> {
                    let in_lower = if reverse {
                        cmp_key(e.ikey, &e.key, begin_ik, begin) != CmpOrdering::Greater
                    } else {
                        cmp_key(e.ikey, &e.key, begin_ik, begin) != CmpOrdering::Less
                    };
                    if !in_lower {
                        // Outside the start bound; only possible in the
                        // first visited leaf.
                        return Ok(true);
                    }
                    let past_end = if reverse {
                        cmp_key(e.ikey, &e.key, end_ik, end) != CmpOrdering::Greater
                    } else {
                        cmp_key(e.ikey, &e.key, end_ik, end) != CmpOrdering::Less
                    };
                    if past_end {
                        return Ok(false);
                    }
                    let slot = &slots[e.slot as usize];
                    let vsnap = slot.version.snapshot();
                    let item = ctx.txn.item(ItemKey::Record {
                        table: self.table_id,
                        slot: e.slot,
                    });
                    if self.config.read_my_writes {
                        if item.has_delete() {
                            return Ok(true);
                        }
                        if item.has_write {
                            let value = if item.has_insert() {
                                slot.value.clone()
                            } else {
                                match item.write_ref::<V>() {
                                    Some(v) => v.clone(),
                                    None => slot.value.clone(),
                                }
                            };
                            batch.push((e.key.clone(), value));
                            return Ok(true);
                        }
                    }
                    observe(item, &slot.version, self.config.policy)?;
                    // Skip uncommitted and deleted records, but keep the
                    // observation: their state must hold at commit.
                    if is_invalid(vsnap) || slot.deleted.load(Ordering::Acquire) {
                        return Ok(true);
                    }
                    batch.push((e.key.clone(), slot.value.clone()));
                    Ok(true)
                };

                if reverse {
                    for e in view.entries.iter().rev() {
                        if !visit(e)? {
                            reached_end = true;
                            break;
                        }
                    }
                } else {
                    for e in view.entries.iter() {
                        if !visit(e)? {
                            reached_end = true;
                            break;
                        }
                    }
                }
            }

            for (k, v) in batch.iter() {
                if !callback(&k[..], v) {
                    return Ok(());
                }
            }
            if reached_end {
                return Ok(());
            }

            if reverse {
                if view.prev == NIL {
                    return Ok(());
                }
                // A concurrent split may have linked a new sibling between
                // the stale back link and this leaf; slide right until the
                // true left neighbor (whose next link points back here).
                let mut cand_id = view.prev;
                loop {
                    let cand = self.tree.read_leaf(cand_id);
                    if cand.next == cur_id || cand.next == NIL {
                        cur_id = cand_id;
                        view = cand;
                        break;
                    }
                    cand_id = cand.next;
                }
            } else {
                if view.next == NIL {
                    return Ok(());
                }
                cur_id = view.next;
                view = self.tree.read_leaf(cur_id);
            }
        }
    }

    /// Non-transactional upsert for loader-phase population.
    pub fn nontrans_put(&self, key: &[u8], value: V) {
        let ik = ikey_of(key);
        match self.tree.lookup(ik, key) {
            LeafLookup::Found { slot } => {
                self.arena.write()[slot as usize].value = value;
            }
            LeafLookup::Absent { .. } => {
                let sid = self.arena.alloc(key.into(), value, true);
                match self.tree.insert_entry(ik, key, sid) {
                    TreeInsert::Inserted { .. } => {}
                    TreeInsert::Found { slot } => {
                        let value = self.arena.read()[sid as usize].value.clone();
                        self.arena.free_slot(sid);
                        self.arena.write()[slot as usize].value = value;
                    }
                }
            }
        }
    }

    /// Non-transactional read; loader-phase only, no isolation.
    pub fn nontrans_get(&self, key: &[u8]) -> Option<V> {
        let ik = ikey_of(key);
        match self.tree.lookup(ik, key) {
            LeafLookup::Found { slot } => {
                let slots = self.arena.read();
                let s = &slots[slot as usize];
                if is_invalid(s.version.snapshot()) || s.deleted.load(Ordering::Acquire) {
                    return None;
                }
                Some(s.value.clone())
            }
            LeafLookup::Absent { .. } => None,
        }
    }
}

impl<V> StmObject for OrderedIndex<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn lock_item(&self, item: &mut TxnItem) -> bool {
        let ItemKey::Record { slot, .. } = item.key else {
            return false;
        };
        if item.locked {
            return true;
        }
        let slots = self.arena.read();
        match slots[slot as usize].version.try_lock_bounded() {
            Some(prev) => {
                item.locked = true;
                item.locked_version = Some(prev);
                true
            }
            None => false,
        }
    }

    fn check_item(&self, item: &TxnItem) -> bool {
        let Some(observed) = item.read_version else {
            return true;
        };
        match item.key {
            ItemKey::Internode { node, .. } => self.tree.node(node).version.check(observed),
            ItemKey::Record { slot, .. } => {
                let slots = self.arena.read();
                slots[slot as usize].version.check(observed, item.locked)
            }
            ItemKey::Bucket { .. } => false,
        }
    }

    fn install_item(&self, item: &mut TxnItem, commit_tid: u64) {
        let ItemKey::Record { slot, .. } = item.key else {
            return;
        };
        debug_assert!(item.locked);

        if item.has_delete() {
            let slots = self.arena.read();
            let s = &slots[slot as usize];
            s.deleted.store(true, Ordering::Release);
            fence(Ordering::SeqCst);
            let v = s.version.snapshot();
            s.version.unlock_install(unlocked(v) + COUNTER_STEP);
            item.locked = false;
            return;
        }

        if !item.has_insert() {
            if let Some(boxed) = item.write_value.take() {
                if let Ok(v) = boxed.downcast::<V>() {
                    self.arena.write()[slot as usize].value = *v;
                }
            }
        }
        self.arena.read()[slot as usize]
            .version
            .unlock_install(commit_tid);
        item.locked = false;
    }

    fn unlock_item(&self, item: &mut TxnItem) {
        if let ItemKey::Record { slot, .. } = item.key {
            if item.locked {
                self.arena.read()[slot as usize].version.unlock();
                item.locked = false;
            }
        }
    }

    fn cleanup_item(&self, item: &mut TxnItem, committed: bool, rcu: &mut RcuSet, epoch: Epoch) {
        let gone = if committed {
            item.has_delete()
        } else {
            item.has_insert()
        };
        if !gone {
            return;
        }
        let ItemKey::Record { slot, .. } = item.key else {
            return;
        };
        let (ik, key) = {
            let slots = self.arena.read();
            let key = slots[slot as usize].key.clone();
            (ikey_of(&key), key)
        };
        let removed = self.tree.remove_entry(ik, &key, slot);
        assert!(removed, "record to unlink is not in its leaf");
        let arena = Arc::clone(&self.arena);
        rcu.defer(epoch, move || arena.free_slot(slot));
    }
}
