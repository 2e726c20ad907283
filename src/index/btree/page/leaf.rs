use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};

use byteorder::{ByteOrder, LittleEndian};

use crate::common::types::{PageId, Rid, INVALID_PAGE_ID};
use crate::index::btree::codec::{decode_rid, encode_rid, IndexKey, RID_SIZE};
use crate::index::btree::page::base::{BTreePage, IndexPageType, LEAF_HEADER_SIZE, OFFSET_NEXT_PAGE_ID};

/// Leaf node view: an ordered array of (key, rid) slots after the header,
/// plus a right-sibling link forming the leaf chain.
///
///  ---------------------------------------------------------------
/// | COMMON HEADER | NextPageId (4) | K(0) RID(0) | K(1) RID(1) ... |
///  ---------------------------------------------------------------
pub struct BTreeLeafPage<B, K> {
    base: BTreePage<B>,
    _key: PhantomData<K>,
}

impl<B, K> BTreeLeafPage<B, K>
where
    B: Deref<Target = [u8]>,
    K: IndexKey,
{
    pub fn view(buf: B) -> Self {
        let page = Self {
            base: BTreePage::view(buf),
            _key: PhantomData,
        };
        debug_assert!(page.base.is_leaf());
        page
    }

    pub fn size(&self) -> usize {
        self.base.size()
    }

    pub fn max_size(&self) -> usize {
        self.base.max_size()
    }

    pub fn min_size(&self) -> usize {
        self.base.min_size()
    }

    pub fn page_id(&self) -> PageId {
        self.base.page_id()
    }

    pub fn parent_page_id(&self) -> PageId {
        self.base.parent_page_id()
    }

    pub fn next_page_id(&self) -> PageId {
        LittleEndian::read_i32(&self.base.buf[OFFSET_NEXT_PAGE_ID..OFFSET_NEXT_PAGE_ID + 4])
    }

    pub fn key_at(&self, index: usize) -> K {
        let offset = Self::slot_offset(index);
        K::decode(&self.base.buf[offset..offset + K::ENCODED_SIZE])
    }

    pub fn value_at(&self, index: usize) -> Rid {
        let offset = Self::slot_offset(index) + K::ENCODED_SIZE;
        decode_rid(&self.base.buf[offset..offset + RID_SIZE])
    }

    /// First slot whose key is >= `key`, or None if every key is smaller.
    pub fn key_index(&self, key: &K) -> Option<usize> {
        let index = self.lower_bound(key);
        (index < self.size()).then_some(index)
    }

    /// Exact-match lookup.
    pub fn lookup(&self, key: &K) -> Option<Rid> {
        match self.key_index(key) {
            Some(index) if self.key_at(index) == *key => Some(self.value_at(index)),
            _ => None,
        }
    }

    fn lower_bound(&self, key: &K) -> usize {
        let mut lo = 0;
        let mut hi = self.size();
        while lo < hi {
            let mid = (lo + hi) / 2;
            if self.key_at(mid) < *key {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        lo
    }

    const fn slot_size() -> usize {
        K::ENCODED_SIZE + RID_SIZE
    }

    fn slot_offset(index: usize) -> usize {
        LEAF_HEADER_SIZE + index * Self::slot_size()
    }
}

impl<B, K> BTreeLeafPage<B, K>
where
    B: Deref<Target = [u8]> + DerefMut,
    K: IndexKey,
{
    /// Format a fresh page as an empty leaf.
    pub fn init(buf: B, page_id: PageId, parent_page_id: PageId, max_size: usize) -> Self {
        let mut base = BTreePage::view(buf);
        base.set_page_type(IndexPageType::Leaf);
        base.set_size(0);
        base.set_max_size(max_size);
        base.set_parent_page_id(parent_page_id);
        base.set_page_id(page_id);
        let mut leaf = Self {
            base,
            _key: PhantomData,
        };
        leaf.set_next_page_id(INVALID_PAGE_ID);
        leaf
    }

    pub fn set_next_page_id(&mut self, next_page_id: PageId) {
        LittleEndian::write_i32(
            &mut self.base.buf[OFFSET_NEXT_PAGE_ID..OFFSET_NEXT_PAGE_ID + 4],
            next_page_id,
        );
    }

    pub fn set_parent_page_id(&mut self, parent_page_id: PageId) {
        self.base.set_parent_page_id(parent_page_id);
    }

    /// Insert at the position that keeps keys ascending. The caller has
    /// already ruled out duplicates. Returns the new size.
    pub fn insert(&mut self, key: K, rid: Rid) -> usize {
        let index = self.lower_bound(&key);
        let size = self.size();
        let start = Self::slot_offset(index);
        let end = Self::slot_offset(size);
        self.base.buf.copy_within(start..end, start + Self::slot_size());
        self.write_slot(index, key, rid);
        self.base.set_size(size + 1);
        size + 1
    }

    pub fn remove(&mut self, index: usize) {
        let size = self.size();
        let start = Self::slot_offset(index + 1);
        let end = Self::slot_offset(size);
        self.base
            .buf
            .copy_within(start..end, Self::slot_offset(index));
        self.base.set_size(size - 1);
    }

    /// Move the upper half of this page's entries into an empty split
    /// sibling.
    pub fn move_half_to<B2>(&mut self, recipient: &mut BTreeLeafPage<B2, K>)
    where
        B2: Deref<Target = [u8]> + DerefMut,
    {
        let size = self.size();
        let keep = size - size / 2;
        let moved = size - keep;
        self.copy_slots_to(recipient, keep, moved, 0);
        recipient.base.set_size(moved);
        self.base.set_size(keep);
    }

    /// Append every entry onto `recipient` (its entries all compare lower).
    pub fn move_all_to<B2>(&mut self, recipient: &mut BTreeLeafPage<B2, K>)
    where
        B2: Deref<Target = [u8]> + DerefMut,
    {
        let size = self.size();
        let recipient_size = recipient.size();
        self.copy_slots_to(recipient, 0, size, recipient_size);
        recipient.base.set_size(recipient_size + size);
        self.base.set_size(0);
    }

    /// Rotate this page's first entry onto the end of `recipient` (the left
    /// neighbor).
    pub fn move_first_to_end_of<B2>(&mut self, recipient: &mut BTreeLeafPage<B2, K>)
    where
        B2: Deref<Target = [u8]> + DerefMut,
    {
        let recipient_size = recipient.size();
        self.copy_slots_to(recipient, 0, 1, recipient_size);
        recipient.base.set_size(recipient_size + 1);
        self.remove(0);
    }

    /// Rotate this page's last entry onto the front of `recipient` (the
    /// right neighbor).
    pub fn move_last_to_front_of<B2>(&mut self, recipient: &mut BTreeLeafPage<B2, K>)
    where
        B2: Deref<Target = [u8]> + DerefMut,
    {
        let size = self.size();
        let recipient_size = recipient.size();
        let start = BTreeLeafPage::<B2, K>::slot_offset(0);
        let end = BTreeLeafPage::<B2, K>::slot_offset(recipient_size);
        recipient
            .base
            .buf
            .copy_within(start..end, start + Self::slot_size());
        self.copy_slots_to(recipient, size - 1, 1, 0);
        recipient.base.set_size(recipient_size + 1);
        self.base.set_size(size - 1);
    }

    fn write_slot(&mut self, index: usize, key: K, rid: Rid) {
        let offset = Self::slot_offset(index);
        key.encode(&mut self.base.buf[offset..offset + K::ENCODED_SIZE]);
        encode_rid(
            &mut self.base.buf[offset + K::ENCODED_SIZE..offset + Self::slot_size()],
            rid,
        );
    }

    fn copy_slots_to<B2>(
        &self,
        recipient: &mut BTreeLeafPage<B2, K>,
        from: usize,
        count: usize,
        to: usize,
    ) where
        B2: Deref<Target = [u8]> + DerefMut,
    {
        let src_start = Self::slot_offset(from);
        let src_end = Self::slot_offset(from + count);
        let dst_start = Self::slot_offset(to);
        recipient.base.buf[dst_start..dst_start + (src_end - src_start)]
            .copy_from_slice(&self.base.buf[src_start..src_end]);
    }
}
