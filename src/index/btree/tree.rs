use std::collections::HashSet;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use log::{debug, warn};
use parking_lot::{MutexGuard, RwLock};

use crate::common::types::{PageId, PagePtr, Rid, HEADER_PAGE_ID, INVALID_PAGE_ID};
use crate::concurrency::transaction::{LatchedPage, RootLatchGuard, Transaction};
use crate::index::btree::codec::{internal_capacity, leaf_capacity, IndexKey};
use crate::index::btree::error::BTreeError;
use crate::index::btree::iterator::BTreeIterator;
use crate::index::btree::page::{BTreeInternalPage, BTreeLeafPage, BTreePage, Sibling};
use crate::storage::buffer::BufferPoolManager;
use crate::storage::page::HeaderPage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TreeOp {
    Find,
    Insert,
    Delete,
}

/// Unlatch and unpin a descent chain, oldest entry first. Read latches are
/// never dirty; write latches carry the caller's dirty flag.
fn release_entries(buffer_pool: &BufferPoolManager, entries: &mut Vec<LatchedPage>, dirty: bool) {
    for entry in entries.drain(..) {
        match entry {
            LatchedPage::Root(guard) => drop(guard),
            LatchedPage::Read { page_id, guard } => {
                drop(guard);
                if let Err(e) = buffer_pool.unpin_page(page_id, false) {
                    warn!("failed to unpin page {}: {}", page_id, e);
                }
            }
            LatchedPage::Write { page_id, guard } => {
                drop(guard);
                if let Err(e) = buffer_pool.unpin_page(page_id, dirty) {
                    warn!("failed to unpin page {}: {}", page_id, e);
                }
            }
        }
    }
}

/// Holder for one operation's latch chain. With a transaction the chain
/// lives in the transaction's page set; without one it is local. Whatever
/// is still held when the holder drops is released, so early error returns
/// cannot leak latches or pins.
struct LatchChain<'a> {
    buffer_pool: &'a BufferPoolManager,
    txn_entries: Option<MutexGuard<'a, Vec<LatchedPage>>>,
    local: Vec<LatchedPage>,
    dirty_on_drop: bool,
}

impl<'a> LatchChain<'a> {
    fn new(
        buffer_pool: &'a BufferPoolManager,
        txn: Option<&'a Transaction>,
        dirty_on_drop: bool,
    ) -> Self {
        Self {
            buffer_pool,
            txn_entries: txn.map(|t| t.page_set().lock()),
            local: Vec::new(),
            dirty_on_drop,
        }
    }

    fn entries(&mut self) -> &mut Vec<LatchedPage> {
        match &mut self.txn_entries {
            Some(guard) => &mut **guard,
            None => &mut self.local,
        }
    }

    fn release(&mut self, dirty: bool) {
        let buffer_pool = self.buffer_pool;
        release_entries(buffer_pool, self.entries(), dirty);
    }
}

impl Drop for LatchChain<'_> {
    fn drop(&mut self) {
        let dirty = self.dirty_on_drop;
        self.release(dirty);
    }
}

/// Concurrent, unique-key B+-tree persisted through the buffer pool.
///
/// Internal pages route by key, leaves hold (key, rid) pairs and chain to
/// their right sibling. Readers and writers descend with latch crabbing:
/// ancestors stay latched only until the current node is safe for the
/// operation. The root page id itself is guarded by a dedicated latch,
/// held shared by reads and exclusive by writes, and every root change is
/// persisted to the header page.
pub struct BTreeIndex<K> {
    index_name: String,
    buffer_pool: Arc<BufferPoolManager>,
    root_page_id: AtomicI32,
    root_latch: Arc<RwLock<()>>,
    leaf_max_size: usize,
    internal_max_size: usize,
    _key: PhantomData<K>,
}

impl<K> BTreeIndex<K>
where
    K: IndexKey,
{
    /// Open or create the index named `index_name`, with node capacities
    /// derived from the key width. An existing root is recovered from the
    /// header page.
    pub fn new(
        index_name: impl Into<String>,
        buffer_pool: Arc<BufferPoolManager>,
    ) -> Result<Self, BTreeError> {
        let leaf_max_size = leaf_capacity::<K>() - 1;
        let internal_max_size = internal_capacity::<K>() - 1;
        Self::with_max_sizes(index_name, buffer_pool, leaf_max_size, internal_max_size)
    }

    /// Open or create the index with explicit node capacities. A node may
    /// rest at `max_size` entries; one extra slot of physical room is
    /// needed because splits happen after the overflowing insert.
    pub fn with_max_sizes(
        index_name: impl Into<String>,
        buffer_pool: Arc<BufferPoolManager>,
        leaf_max_size: usize,
        internal_max_size: usize,
    ) -> Result<Self, BTreeError> {
        let index_name = index_name.into();
        if leaf_max_size < 2 || leaf_max_size + 1 > leaf_capacity::<K>() {
            return Err(BTreeError::InvalidConfig(format!(
                "leaf max size {} not in 2..{}",
                leaf_max_size,
                leaf_capacity::<K>()
            )));
        }
        if internal_max_size < 3 || internal_max_size + 1 > internal_capacity::<K>() {
            return Err(BTreeError::InvalidConfig(format!(
                "internal max size {} not in 3..{}",
                internal_max_size,
                internal_capacity::<K>()
            )));
        }

        let header = buffer_pool.fetch_page(HEADER_PAGE_ID)?;
        let recovered = (|| -> Result<Option<PageId>, BTreeError> {
            let existing = {
                let guard = header.read();
                HeaderPage::view(&guard.data[..]).get_record(&index_name)?
            };
            if existing.is_none() {
                let mut guard = header.write();
                HeaderPage::view(&mut guard.data[..])
                    .insert_record(&index_name, INVALID_PAGE_ID)?;
            }
            Ok(existing)
        })();
        let registered = matches!(recovered, Ok(None));
        buffer_pool.unpin_page(HEADER_PAGE_ID, registered)?;
        let root_page_id = recovered?.unwrap_or(INVALID_PAGE_ID);

        Ok(Self {
            index_name,
            buffer_pool,
            root_page_id: AtomicI32::new(root_page_id),
            root_latch: Arc::new(RwLock::new(())),
            leaf_max_size,
            internal_max_size,
            _key: PhantomData,
        })
    }

    pub fn root_page_id(&self) -> PageId {
        self.root_page_id.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.root_page_id() == INVALID_PAGE_ID
    }

    /// Point lookup. Unique keys mean the result holds at most one rid.
    pub fn get_value(&self, key: &K, txn: Option<&Transaction>) -> Result<Vec<Rid>, BTreeError> {
        let root_guard = self.root_latch.read_arc();
        if self.is_empty() {
            return Ok(Vec::new());
        }

        let mut chain = LatchChain::new(&self.buffer_pool, txn, false);
        chain
            .entries()
            .push(LatchedPage::Root(RootLatchGuard::Read(root_guard)));
        self.find_leaf(key, false, TreeOp::Find, chain.entries())?;

        let result: Vec<Rid> = {
            let entries = chain.entries();
            let leaf_entry = entries
                .last()
                .ok_or(BTreeError::LatchChain("descent left no leaf"))?;
            let page = leaf_entry
                .page()
                .ok_or(BTreeError::LatchChain("leaf entry holds no page"))?;
            let leaf = BTreeLeafPage::<_, K>::view(&page.data[..]);
            leaf.lookup(key).into_iter().collect()
        };
        chain.release(false);
        Ok(result)
    }

    /// Insert a key/rid pair. Fails with `DuplicateKey` if the key exists.
    pub fn insert(&self, key: K, value: Rid, txn: Option<&Transaction>) -> Result<(), BTreeError> {
        let root_guard = self.root_latch.write_arc();
        if self.is_empty() {
            let result = self.start_new_tree(key, value);
            drop(root_guard);
            return result;
        }

        let mut chain = LatchChain::new(&self.buffer_pool, txn, true);
        chain
            .entries()
            .push(LatchedPage::Root(RootLatchGuard::Write(root_guard)));
        self.find_leaf(&key, false, TreeOp::Insert, chain.entries())?;

        let entries = chain.entries();
        let leaf_pos = entries.len() - 1;
        let (duplicate, new_size) = {
            let page = entries[leaf_pos]
                .page_mut()
                .ok_or(BTreeError::LatchChain("leaf entry not exclusive"))?;
            let mut leaf = BTreeLeafPage::<_, K>::view(&mut page.data[..]);
            if leaf.lookup(&key).is_some() {
                (true, 0)
            } else {
                (false, leaf.insert(key, value))
            }
        };

        if duplicate {
            chain.release(false);
            return Err(BTreeError::DuplicateKey);
        }
        if new_size > self.leaf_max_size {
            self.split_leaf(entries, leaf_pos)?;
        }
        chain.release(true);
        Ok(())
    }

    /// Remove a key. Removing an absent key is a no-op.
    pub fn remove(&self, key: &K, txn: Option<&Transaction>) -> Result<(), BTreeError> {
        let root_guard = self.root_latch.write_arc();
        if self.is_empty() {
            return Ok(());
        }

        let mut deleted: HashSet<PageId> = HashSet::new();
        {
            let mut chain = LatchChain::new(&self.buffer_pool, txn, true);
            chain
                .entries()
                .push(LatchedPage::Root(RootLatchGuard::Write(root_guard)));
            self.find_leaf(key, false, TreeOp::Delete, chain.entries())?;

            let entries = chain.entries();
            let leaf_pos = entries.len() - 1;
            let (found, size, min_size) = {
                let page = entries[leaf_pos]
                    .page_mut()
                    .ok_or(BTreeError::LatchChain("leaf entry not exclusive"))?;
                let mut leaf = BTreeLeafPage::<_, K>::view(&mut page.data[..]);
                match leaf.key_index(key) {
                    Some(index) if leaf.key_at(index) == *key => {
                        leaf.remove(index);
                        (true, leaf.size(), leaf.min_size())
                    }
                    _ => (false, 0, 0),
                }
            };

            if !found {
                chain.release(false);
                return Ok(());
            }
            if size < min_size {
                self.coalesce_or_redistribute(entries, leaf_pos, &mut deleted)?;
            }
            chain.release(true);
        }

        // Merged-away pages are deallocated only now, after their latches
        // and pins are gone.
        if let Some(txn) = txn {
            txn.deleted_page_set().lock().extend(deleted.iter().copied());
        }
        let doomed: Vec<PageId> = match txn {
            Some(txn) => txn.deleted_page_set().lock().drain().collect(),
            None => deleted.into_iter().collect(),
        };
        for page_id in doomed {
            // A reader that just unlatched the page may still hold its pin
            // for an instant; the page is unreachable either way.
            if let Err(e) = self.buffer_pool.delete_page(page_id) {
                warn!("deferred delete of page {} failed: {}", page_id, e);
            }
        }
        Ok(())
    }

    /// Forward iterator over the whole tree, starting at the leftmost leaf.
    pub fn iter(&self) -> Result<BTreeIterator<K>, BTreeError> {
        let root_guard = self.root_latch.read_arc();
        if self.is_empty() {
            return Ok(BTreeIterator::end(self.buffer_pool.clone()));
        }

        let mut chain = LatchChain::new(&self.buffer_pool, None, false);
        chain
            .entries()
            .push(LatchedPage::Root(RootLatchGuard::Read(root_guard)));
        self.find_leaf(&K::default(), true, TreeOp::Find, chain.entries())?;

        let Some(LatchedPage::Read { page_id, guard }) = chain.entries().pop() else {
            return Err(BTreeError::LatchChain("descent did not end on a shared leaf"));
        };
        chain.release(false);
        Ok(BTreeIterator::new(self.buffer_pool.clone(), page_id, guard, 0))
    }

    /// Forward iterator positioned at the first key >= `key`.
    pub fn iter_from(&self, key: &K) -> Result<BTreeIterator<K>, BTreeError> {
        let root_guard = self.root_latch.read_arc();
        if self.is_empty() {
            return Ok(BTreeIterator::end(self.buffer_pool.clone()));
        }

        let mut chain = LatchChain::new(&self.buffer_pool, None, false);
        chain
            .entries()
            .push(LatchedPage::Root(RootLatchGuard::Read(root_guard)));
        self.find_leaf(key, false, TreeOp::Find, chain.entries())?;

        let Some(LatchedPage::Read { page_id, guard }) = chain.entries().pop() else {
            return Err(BTreeError::LatchChain("descent did not end on a shared leaf"));
        };
        chain.release(false);

        let index = {
            let leaf = BTreeLeafPage::<_, K>::view(&guard.data[..]);
            leaf.key_index(key).unwrap_or(leaf.size())
        };
        Ok(BTreeIterator::new(
            self.buffer_pool.clone(),
            page_id,
            guard,
            index,
        ))
    }

    /// Descend to the leaf for `key` (or the leftmost leaf), latching each
    /// visited page in the mode the operation needs. Ancestors are released
    /// as soon as the current node is safe; the visited path accumulates in
    /// `entries` with the leaf last.
    fn find_leaf(
        &self,
        key: &K,
        leftmost: bool,
        op: TreeOp,
        entries: &mut Vec<LatchedPage>,
    ) -> Result<(), BTreeError> {
        let mut page_id = self.root_page_id();
        loop {
            let page = self.buffer_pool.fetch_page(page_id)?;
            let entry = match op {
                TreeOp::Find => LatchedPage::Read {
                    page_id,
                    guard: page.read_arc(),
                },
                TreeOp::Insert | TreeOp::Delete => LatchedPage::Write {
                    page_id,
                    guard: page.write_arc(),
                },
            };

            let (is_leaf, next_id, safe) = {
                let page_ref = entry
                    .page()
                    .ok_or(BTreeError::LatchChain("latched entry holds no page"))?;
                let node = BTreePage::view(&page_ref.data[..]);
                let safe = Self::is_safe(&node, op);
                if node.is_leaf() {
                    (true, INVALID_PAGE_ID, safe)
                } else {
                    let internal = BTreeInternalPage::<_, K>::view(&page_ref.data[..]);
                    let next = if leftmost {
                        internal.value_at(0)
                    } else {
                        internal.lookup(key)
                    };
                    (false, next, safe)
                }
            };

            if safe {
                release_entries(&self.buffer_pool, entries, false);
            }
            entries.push(entry);

            if is_leaf {
                return Ok(());
            }
            page_id = next_id;
        }
    }

    /// A node is safe when the operation running on it cannot propagate to
    /// its ancestors: no split on insert, no underflow on delete.
    fn is_safe(node: &BTreePage<&[u8]>, op: TreeOp) -> bool {
        match op {
            TreeOp::Find => true,
            TreeOp::Insert => node.size() < node.max_size() - 1,
            TreeOp::Delete => {
                if node.is_root() {
                    if node.is_leaf() {
                        node.size() > 1
                    } else {
                        node.size() > 2
                    }
                } else {
                    node.size() > node.min_size() + 1
                }
            }
        }
    }

    fn start_new_tree(&self, key: K, value: Rid) -> Result<(), BTreeError> {
        let (page, page_id) = self.buffer_pool.new_page()?;
        {
            let mut guard = page.write();
            let mut leaf = BTreeLeafPage::<_, K>::init(
                &mut guard.data[..],
                page_id,
                INVALID_PAGE_ID,
                self.leaf_max_size,
            );
            leaf.insert(key, value);
        }
        self.set_root_page_id(page_id)?;
        self.buffer_pool.unpin_page(page_id, true)?;
        debug!("started new tree at root {}", page_id);
        Ok(())
    }

    fn split_leaf(&self, entries: &mut Vec<LatchedPage>, leaf_pos: usize) -> Result<(), BTreeError> {
        let (new_page, new_page_id) = self.buffer_pool.new_page()?;
        let (old_page_id, separator) = {
            let mut new_guard = new_page.write();
            let page = entries[leaf_pos]
                .page_mut()
                .ok_or(BTreeError::LatchChain("leaf entry not exclusive"))?;
            let mut leaf = BTreeLeafPage::<_, K>::view(&mut page.data[..]);
            let mut sibling = BTreeLeafPage::<_, K>::init(
                &mut new_guard.data[..],
                new_page_id,
                leaf.parent_page_id(),
                self.leaf_max_size,
            );
            leaf.move_half_to(&mut sibling);
            sibling.set_next_page_id(leaf.next_page_id());
            leaf.set_next_page_id(new_page_id);
            (leaf.page_id(), sibling.key_at(0))
        };
        debug!("split leaf {} into {}", old_page_id, new_page_id);
        self.insert_into_parent(entries, leaf_pos, separator, &new_page, new_page_id)?;
        self.buffer_pool.unpin_page(new_page_id, true)?;
        Ok(())
    }

    /// Hook a freshly split-off sibling into the parent of the node at
    /// `child_pos`, growing a new root or splitting the parent as needed.
    fn insert_into_parent(
        &self,
        entries: &mut Vec<LatchedPage>,
        child_pos: usize,
        key: K,
        new_page: &PagePtr,
        new_page_id: PageId,
    ) -> Result<(), BTreeError> {
        let (old_page_id, old_parent_id) = {
            let page = entries[child_pos]
                .page()
                .ok_or(BTreeError::LatchChain("split child not held"))?;
            let node = BTreePage::view(&page.data[..]);
            (node.page_id(), node.parent_page_id())
        };

        if old_parent_id == INVALID_PAGE_ID {
            // The old node was the root; grow the tree by one level.
            let (root_page, root_page_id) = self.buffer_pool.new_page()?;
            {
                let mut guard = root_page.write();
                let mut root = BTreeInternalPage::<_, K>::init(
                    &mut guard.data[..],
                    root_page_id,
                    INVALID_PAGE_ID,
                    self.internal_max_size,
                );
                root.populate_new_root(old_page_id, key, new_page_id);
            }
            {
                let page = entries[child_pos]
                    .page_mut()
                    .ok_or(BTreeError::LatchChain("split child not exclusive"))?;
                BTreePage::view(&mut page.data[..]).set_parent_page_id(root_page_id);
            }
            {
                let mut guard = new_page.write();
                BTreePage::view(&mut guard.data[..]).set_parent_page_id(root_page_id);
            }
            self.set_root_page_id(root_page_id)?;
            self.buffer_pool.unpin_page(root_page_id, true)?;
            debug!(
                "grew new root {} over {} and {}",
                root_page_id, old_page_id, new_page_id
            );
            return Ok(());
        }

        let parent_pos = child_pos
            .checked_sub(1)
            .ok_or(BTreeError::LatchChain("split reached chain head"))?;
        if entries[parent_pos].page_id() != Some(old_parent_id) {
            return Err(BTreeError::LatchChain("parent page not on chain"));
        }

        let new_size = {
            let page = entries[parent_pos]
                .page_mut()
                .ok_or(BTreeError::LatchChain("parent entry not exclusive"))?;
            let mut parent = BTreeInternalPage::<_, K>::view(&mut page.data[..]);
            parent
                .insert_node_after(old_page_id, key, new_page_id)
                .ok_or(BTreeError::InvalidPageFormat)?
        };

        if new_size > self.internal_max_size {
            let (split_page, split_page_id) = self.buffer_pool.new_page()?;
            let (separator, moved_children) = {
                let mut split_guard = split_page.write();
                let page = entries[parent_pos]
                    .page_mut()
                    .ok_or(BTreeError::LatchChain("parent entry not exclusive"))?;
                let mut parent = BTreeInternalPage::<_, K>::view(&mut page.data[..]);
                let mut sibling = BTreeInternalPage::<_, K>::init(
                    &mut split_guard.data[..],
                    split_page_id,
                    parent.parent_page_id(),
                    self.internal_max_size,
                );
                parent.move_half_to(&mut sibling);
                (sibling.key_at(0), sibling.children_in(0..sibling.size()))
            };
            self.reparent_children(entries, &moved_children, split_page_id)?;
            debug!("split internal {} into {}", old_parent_id, split_page_id);
            self.insert_into_parent(entries, parent_pos, separator, &split_page, split_page_id)?;
            self.buffer_pool.unpin_page(split_page_id, true)?;
        }
        Ok(())
    }

    /// Resolve an underflow at `node_pos`: merge with a sibling when both
    /// fit in one page, otherwise rotate one entry over. May recurse into
    /// the parent.
    fn coalesce_or_redistribute(
        &self,
        entries: &mut Vec<LatchedPage>,
        node_pos: usize,
        deleted: &mut HashSet<PageId>,
    ) -> Result<(), BTreeError> {
        let (node_id, parent_id, is_leaf, node_size, node_max) = {
            let page = entries[node_pos]
                .page()
                .ok_or(BTreeError::LatchChain("underflowing node not held"))?;
            let node = BTreePage::view(&page.data[..]);
            (
                node.page_id(),
                node.parent_page_id(),
                node.is_leaf(),
                node.size(),
                node.max_size(),
            )
        };

        if parent_id == INVALID_PAGE_ID {
            return self.adjust_root(entries, node_pos, deleted);
        }

        let parent_pos = node_pos
            .checked_sub(1)
            .ok_or(BTreeError::LatchChain("underflow reached chain head"))?;
        if entries[parent_pos].page_id() != Some(parent_id) {
            return Err(BTreeError::LatchChain("parent page not on chain"));
        }

        let sibling_info = {
            let page = entries[parent_pos]
                .page()
                .ok_or(BTreeError::LatchChain("parent entry holds no page"))?;
            let parent = BTreeInternalPage::<_, K>::view(&page.data[..]);
            parent
                .get_sibling(node_id)
                .ok_or(BTreeError::InvalidPageFormat)?
        };

        let sibling_page = self.buffer_pool.fetch_page(sibling_info.page_id)?;
        let mut sibling_guard = sibling_page.write();
        let sibling_size = BTreePage::view(&sibling_guard.data[..]).size();

        if sibling_size + node_size < node_max {
            self.coalesce(
                entries,
                node_pos,
                parent_pos,
                &mut sibling_guard.data,
                &sibling_info,
                node_id,
                is_leaf,
                deleted,
            )?;
            drop(sibling_guard);
            self.buffer_pool.unpin_page(sibling_info.page_id, true)?;

            let (parent_size, parent_min) = {
                let page = entries[parent_pos]
                    .page()
                    .ok_or(BTreeError::LatchChain("parent entry holds no page"))?;
                let parent = BTreePage::view(&page.data[..]);
                (parent.size(), parent.min_size())
            };
            if parent_size < parent_min {
                self.coalesce_or_redistribute(entries, parent_pos, deleted)?;
            }
        } else {
            self.redistribute(
                entries,
                node_pos,
                parent_pos,
                &mut sibling_guard.data,
                &sibling_info,
                node_id,
                is_leaf,
            )?;
            drop(sibling_guard);
            self.buffer_pool.unpin_page(sibling_info.page_id, true)?;
        }
        Ok(())
    }

    /// Merge node and sibling into the left of the two and drop their
    /// separator from the parent. The emptied page is queued for deferred
    /// deletion.
    #[allow(clippy::too_many_arguments)]
    fn coalesce(
        &self,
        entries: &mut Vec<LatchedPage>,
        node_pos: usize,
        parent_pos: usize,
        sibling_data: &mut [u8],
        sibling_info: &Sibling<K>,
        node_id: PageId,
        is_leaf: bool,
        deleted: &mut HashSet<PageId>,
    ) -> Result<(), BTreeError> {
        if is_leaf {
            let page = entries[node_pos]
                .page_mut()
                .ok_or(BTreeError::LatchChain("node entry not exclusive"))?;
            let mut node = BTreeLeafPage::<_, K>::view(&mut page.data[..]);
            let mut sibling = BTreeLeafPage::<_, K>::view(&mut *sibling_data);
            if sibling_info.on_left {
                node.move_all_to(&mut sibling);
                sibling.set_next_page_id(node.next_page_id());
                deleted.insert(node_id);
            } else {
                sibling.move_all_to(&mut node);
                node.set_next_page_id(sibling.next_page_id());
                deleted.insert(sibling_info.page_id);
            }
        } else {
            let (moved_children, recipient_id) = {
                let page = entries[node_pos]
                    .page_mut()
                    .ok_or(BTreeError::LatchChain("node entry not exclusive"))?;
                let mut node = BTreeInternalPage::<_, K>::view(&mut page.data[..]);
                let mut sibling = BTreeInternalPage::<_, K>::view(&mut *sibling_data);
                if sibling_info.on_left {
                    let before = sibling.size();
                    node.move_all_to(&mut sibling, sibling_info.separator);
                    deleted.insert(node_id);
                    (sibling.children_in(before..sibling.size()), sibling_info.page_id)
                } else {
                    let before = node.size();
                    sibling.move_all_to(&mut node, sibling_info.separator);
                    deleted.insert(sibling_info.page_id);
                    (node.children_in(before..node.size()), node_id)
                }
            };
            self.reparent_children(entries, &moved_children, recipient_id)?;
        }

        debug!(
            "coalesced {} with sibling {}",
            node_id, sibling_info.page_id
        );
        let page = entries[parent_pos]
            .page_mut()
            .ok_or(BTreeError::LatchChain("parent entry not exclusive"))?;
        let mut parent = BTreeInternalPage::<_, K>::view(&mut page.data[..]);
        parent.remove(sibling_info.index);
        Ok(())
    }

    /// Rotate one entry from the sibling into the underflowing node and
    /// refresh the separator in the parent.
    #[allow(clippy::too_many_arguments)]
    fn redistribute(
        &self,
        entries: &mut Vec<LatchedPage>,
        node_pos: usize,
        parent_pos: usize,
        sibling_data: &mut [u8],
        sibling_info: &Sibling<K>,
        node_id: PageId,
        is_leaf: bool,
    ) -> Result<(), BTreeError> {
        let new_separator;
        if is_leaf {
            let page = entries[node_pos]
                .page_mut()
                .ok_or(BTreeError::LatchChain("node entry not exclusive"))?;
            let mut node = BTreeLeafPage::<_, K>::view(&mut page.data[..]);
            let mut sibling = BTreeLeafPage::<_, K>::view(&mut *sibling_data);
            if sibling_info.on_left {
                sibling.move_last_to_front_of(&mut node);
                new_separator = node.key_at(0);
            } else {
                sibling.move_first_to_end_of(&mut node);
                new_separator = sibling.key_at(0);
            }
        } else {
            let moved_child;
            {
                let page = entries[node_pos]
                    .page_mut()
                    .ok_or(BTreeError::LatchChain("node entry not exclusive"))?;
                let mut node = BTreeInternalPage::<_, K>::view(&mut page.data[..]);
                let mut sibling = BTreeInternalPage::<_, K>::view(&mut *sibling_data);
                if sibling_info.on_left {
                    new_separator = sibling.key_at(sibling.size() - 1);
                    sibling.move_last_to_front_of(&mut node, sibling_info.separator);
                    moved_child = node.value_at(0);
                } else {
                    new_separator = sibling.key_at(1);
                    sibling.move_first_to_end_of(&mut node, sibling_info.separator);
                    moved_child = node.value_at(node.size() - 1);
                }
            }
            self.reparent_children(entries, &[moved_child], node_id)?;
        }

        debug!(
            "redistributed between {} and sibling {}",
            node_id, sibling_info.page_id
        );
        let page = entries[parent_pos]
            .page_mut()
            .ok_or(BTreeError::LatchChain("parent entry not exclusive"))?;
        let mut parent = BTreeInternalPage::<_, K>::view(&mut page.data[..]);
        parent.set_key_at(sibling_info.index, new_separator);
        Ok(())
    }

    /// Shrink the tree at the root: an internal root left with one child
    /// hands the root role to that child, and an emptied leaf root empties
    /// the tree.
    fn adjust_root(
        &self,
        entries: &mut Vec<LatchedPage>,
        root_pos: usize,
        deleted: &mut HashSet<PageId>,
    ) -> Result<(), BTreeError> {
        let (root_id, is_leaf, size) = {
            let page = entries[root_pos]
                .page()
                .ok_or(BTreeError::LatchChain("root entry holds no page"))?;
            let node = BTreePage::view(&page.data[..]);
            (node.page_id(), node.is_leaf(), node.size())
        };

        if is_leaf {
            if size == 0 {
                deleted.insert(root_id);
                self.set_root_page_id(INVALID_PAGE_ID)?;
                debug!("last key removed, tree {} is empty", self.index_name);
            }
            return Ok(());
        }

        if size == 1 {
            let child_id = {
                let page = entries[root_pos]
                    .page_mut()
                    .ok_or(BTreeError::LatchChain("root entry not exclusive"))?;
                let mut root = BTreeInternalPage::<_, K>::view(&mut page.data[..]);
                root.remove_and_return_only_child()
            };
            self.reparent_children(entries, &[child_id], INVALID_PAGE_ID)?;
            deleted.insert(root_id);
            self.set_root_page_id(child_id)?;
            debug!("root {} collapsed into {}", root_id, child_id);
        }
        Ok(())
    }

    /// Point the given children at a new parent. Pages already held on the
    /// latch chain are rewritten through their existing guard; any other
    /// page is fetched and latched briefly. Re-latching a chain-held page
    /// would deadlock against our own latch, hence the chain scan.
    fn reparent_children(
        &self,
        entries: &mut Vec<LatchedPage>,
        children: &[PageId],
        new_parent: PageId,
    ) -> Result<(), BTreeError> {
        'children: for &child_id in children {
            for entry in entries.iter_mut() {
                if entry.page_id() == Some(child_id) {
                    let page = entry
                        .page_mut()
                        .ok_or(BTreeError::LatchChain("chain child not exclusive"))?;
                    BTreePage::view(&mut page.data[..]).set_parent_page_id(new_parent);
                    continue 'children;
                }
            }
            let child = self.buffer_pool.fetch_page(child_id)?;
            {
                let mut guard = child.write();
                BTreePage::view(&mut guard.data[..]).set_parent_page_id(new_parent);
            }
            self.buffer_pool.unpin_page(child_id, true)?;
        }
        Ok(())
    }

    fn set_root_page_id(&self, page_id: PageId) -> Result<(), BTreeError> {
        self.root_page_id.store(page_id, Ordering::SeqCst);
        let header = self.buffer_pool.fetch_page(HEADER_PAGE_ID)?;
        let result = (|| -> Result<(), BTreeError> {
            let mut guard = header.write();
            let mut view = HeaderPage::view(&mut guard.data[..]);
            if !view.update_record(&self.index_name, page_id)? {
                view.insert_record(&self.index_name, page_id)?;
            }
            Ok(())
        })();
        self.buffer_pool.unpin_page(HEADER_PAGE_ID, true)?;
        result
    }
}
