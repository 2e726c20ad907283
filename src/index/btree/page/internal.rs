use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};

use crate::common::types::PageId;
use crate::index::btree::codec::{decode_page_id, encode_page_id, IndexKey, PAGE_ID_SIZE};
use crate::index::btree::page::base::{BTreePage, IndexPageType, INTERNAL_HEADER_SIZE};

/// An adjacent sibling of a child, as seen from the parent.
#[derive(Debug, Clone, Copy)]
pub struct Sibling<K> {
    pub page_id: PageId,
    /// Separator key between the child and the sibling in this page.
    pub separator: K,
    /// Slot of that separator, for Remove/SetKeyAt.
    pub index: usize,
    /// True when the sibling sits to the child's left.
    pub on_left: bool,
}

/// Internal node view: an ordered array of (key, child page id) slots. A
/// page of size n has n children and n-1 real keys; slot 0's key is a
/// sentinel and lookups start from slot 1.
///
///  -----------------------------------------------------
/// | COMMON HEADER | K(0)* PID(0) | K(1) PID(1) | ...    |
///  -----------------------------------------------------
///                   (* slot 0's key is unused)
///
/// The move helpers only rearrange slots. Children handed to another page
/// still need their parent pointers rewritten; the tree layer does that,
/// since it knows which of them it already holds latched.
pub struct BTreeInternalPage<B, K> {
    base: BTreePage<B>,
    _key: PhantomData<K>,
}

impl<B, K> BTreeInternalPage<B, K>
where
    B: Deref<Target = [u8]>,
    K: IndexKey,
{
    pub fn view(buf: B) -> Self {
        let page = Self {
            base: BTreePage::view(buf),
            _key: PhantomData,
        };
        debug_assert!(!page.base.is_leaf());
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

    pub fn key_at(&self, index: usize) -> K {
        let offset = Self::slot_offset(index);
        K::decode(&self.base.buf[offset..offset + K::ENCODED_SIZE])
    }

    pub fn value_at(&self, index: usize) -> PageId {
        let offset = Self::slot_offset(index) + K::ENCODED_SIZE;
        decode_page_id(&self.base.buf[offset..offset + PAGE_ID_SIZE])
    }

    /// Slot holding `child`, or None.
    pub fn value_index(&self, child: PageId) -> Option<usize> {
        (0..self.size()).find(|&i| self.value_at(i) == child)
    }

    /// Child whose subtree would contain `key`: the child left of the first
    /// key greater than `key`, or the last child.
    pub fn lookup(&self, key: &K) -> PageId {
        let mut lo = 1;
        let mut hi = self.size();
        while lo < hi {
            let mid = (lo + hi) / 2;
            if self.key_at(mid) <= *key {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        self.value_at(lo - 1)
    }

    /// Adjacent sibling of `child`: the left neighbor when one exists, else
    /// the right neighbor.
    pub fn get_sibling(&self, child: PageId) -> Option<Sibling<K>> {
        let index = self.value_index(child)?;
        if index == 0 {
            if self.size() < 2 {
                return None;
            }
            Some(Sibling {
                page_id: self.value_at(1),
                separator: self.key_at(1),
                index: 1,
                on_left: false,
            })
        } else {
            Some(Sibling {
                page_id: self.value_at(index - 1),
                separator: self.key_at(index),
                index,
                on_left: true,
            })
        }
    }

    /// Child ids in `range`, for re-parenting after a move.
    pub fn children_in(&self, range: std::ops::Range<usize>) -> Vec<PageId> {
        range.map(|i| self.value_at(i)).collect()
    }

    const fn slot_size() -> usize {
        K::ENCODED_SIZE + PAGE_ID_SIZE
    }

    fn slot_offset(index: usize) -> usize {
        INTERNAL_HEADER_SIZE + index * Self::slot_size()
    }
}

impl<B, K> BTreeInternalPage<B, K>
where
    B: Deref<Target = [u8]> + DerefMut,
    K: IndexKey,
{
    /// Format a fresh page as an empty internal node.
    pub fn init(buf: B, page_id: PageId, parent_page_id: PageId, max_size: usize) -> Self {
        let mut base = BTreePage::view(buf);
        base.set_page_type(IndexPageType::Internal);
        base.set_size(0);
        base.set_max_size(max_size);
        base.set_parent_page_id(parent_page_id);
        base.set_page_id(page_id);
        Self {
            base,
            _key: PhantomData,
        }
    }

    pub fn set_key_at(&mut self, index: usize, key: K) {
        let offset = Self::slot_offset(index);
        key.encode(&mut self.base.buf[offset..offset + K::ENCODED_SIZE]);
    }

    pub fn set_parent_page_id(&mut self, parent_page_id: PageId) {
        self.base.set_parent_page_id(parent_page_id);
    }

    /// Turn an empty page into a root over two children split out of the
    /// old root.
    pub fn populate_new_root(&mut self, old_child: PageId, key: K, new_child: PageId) {
        self.write_slot(0, K::default(), old_child);
        self.write_slot(1, key, new_child);
        self.base.set_size(2);
    }

    /// Insert (key, new_child) right after the slot holding `old_child`.
    /// Returns the new size, or None if `old_child` is not present.
    pub fn insert_node_after(
        &mut self,
        old_child: PageId,
        key: K,
        new_child: PageId,
    ) -> Option<usize> {
        let index = self.value_index(old_child)?;
        let size = self.size();
        let start = Self::slot_offset(index + 1);
        let end = Self::slot_offset(size);
        self.base.buf.copy_within(start..end, start + Self::slot_size());
        self.write_slot(index + 1, key, new_child);
        self.base.set_size(size + 1);
        Some(size + 1)
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

    /// Collapse a single-child root, handing back the orphaned child.
    pub fn remove_and_return_only_child(&mut self) -> PageId {
        let child = self.value_at(0);
        self.base.set_size(0);
        child
    }

    /// Move the upper half of the slots into an empty split sibling. The
    /// first moved key lands in the recipient's sentinel slot, where the
    /// caller reads the separator to push up.
    pub fn move_half_to<B2>(&mut self, recipient: &mut BTreeInternalPage<B2, K>)
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

    /// Append every slot onto `recipient`, threading the parent separator
    /// into this page's sentinel slot so ordering is preserved.
    pub fn move_all_to<B2>(&mut self, recipient: &mut BTreeInternalPage<B2, K>, middle_key: K)
    where
        B2: Deref<Target = [u8]> + DerefMut,
    {
        self.set_key_at(0, middle_key);
        let size = self.size();
        let recipient_size = recipient.size();
        self.copy_slots_to(recipient, 0, size, recipient_size);
        recipient.base.set_size(recipient_size + size);
        self.base.set_size(0);
    }

    /// Rotate this page's first slot onto the end of `recipient` (the left
    /// neighbor). The departing child keeps `middle_key` as its separator.
    pub fn move_first_to_end_of<B2>(
        &mut self,
        recipient: &mut BTreeInternalPage<B2, K>,
        middle_key: K,
    ) where
        B2: Deref<Target = [u8]> + DerefMut,
    {
        self.set_key_at(0, middle_key);
        let recipient_size = recipient.size();
        self.copy_slots_to(recipient, 0, 1, recipient_size);
        recipient.base.set_size(recipient_size + 1);
        self.remove(0);
    }

    /// Rotate this page's last slot onto the front of `recipient` (the
    /// right neighbor). The recipient's former sentinel child shifts to
    /// slot 1 and receives `middle_key` as its separator.
    pub fn move_last_to_front_of<B2>(
        &mut self,
        recipient: &mut BTreeInternalPage<B2, K>,
        middle_key: K,
    ) where
        B2: Deref<Target = [u8]> + DerefMut,
    {
        let size = self.size();
        let recipient_size = recipient.size();
        let start = BTreeInternalPage::<B2, K>::slot_offset(0);
        let end = BTreeInternalPage::<B2, K>::slot_offset(recipient_size);
        recipient
            .base
            .buf
            .copy_within(start..end, start + Self::slot_size());
        self.copy_slots_to(recipient, size - 1, 1, 0);
        recipient.base.set_size(recipient_size + 1);
        recipient.set_key_at(1, middle_key);
        self.base.set_size(size - 1);
    }

    fn write_slot(&mut self, index: usize, key: K, child: PageId) {
        let offset = Self::slot_offset(index);
        key.encode(&mut self.base.buf[offset..offset + K::ENCODED_SIZE]);
        encode_page_id(
            &mut self.base.buf[offset + K::ENCODED_SIZE..offset + Self::slot_size()],
            child,
        );
    }

    fn copy_slots_to<B2>(
        &self,
        recipient: &mut BTreeInternalPage<B2, K>,
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::types::{INVALID_PAGE_ID, PAGE_SIZE};

    fn internal(buf: &mut [u8], page_id: PageId) -> BTreeInternalPage<&mut [u8], i64> {
        BTreeInternalPage::init(buf, page_id, INVALID_PAGE_ID, 8)
    }

    #[test]
    fn test_populate_new_root() {
        let mut buf = vec![0u8; PAGE_SIZE];
        let mut page = internal(&mut buf, 10);
        page.populate_new_root(100, 7, 200);

        assert_eq!(page.size(), 2);
        assert_eq!(page.value_at(0), 100);
        assert_eq!(page.key_at(1), 7);
        assert_eq!(page.value_at(1), 200);
    }

    #[test]
    fn test_lookup_routes_to_child() {
        let mut buf = vec![0u8; PAGE_SIZE];
        let mut page = internal(&mut buf, 10);
        page.populate_new_root(100, 10, 200);
        page.insert_node_after(200, 20, 300).unwrap();
        page.insert_node_after(300, 30, 400).unwrap();
        // children: [100 | 10 | 200 | 20 | 300 | 30 | 400]

        assert_eq!(page.lookup(&5), 100);
        assert_eq!(page.lookup(&10), 200);
        assert_eq!(page.lookup(&15), 200);
        assert_eq!(page.lookup(&25), 300);
        assert_eq!(page.lookup(&30), 400);
        assert_eq!(page.lookup(&99), 400);
    }

    #[test]
    fn test_insert_node_after_and_remove() {
        let mut buf = vec![0u8; PAGE_SIZE];
        let mut page = internal(&mut buf, 10);
        page.populate_new_root(100, 10, 200);

        assert_eq!(page.insert_node_after(100, 5, 150), Some(3));
        // children now [100 | 5 | 150 | 10 | 200]
        assert_eq!(page.value_at(1), 150);
        assert_eq!(page.key_at(2), 10);

        assert_eq!(page.insert_node_after(999, 1, 2), None);

        page.remove(1);
        assert_eq!(page.size(), 2);
        assert_eq!(page.value_at(0), 100);
        assert_eq!(page.value_at(1), 200);
        assert_eq!(page.key_at(1), 10);
    }

    #[test]
    fn test_get_sibling_prefers_left() {
        let mut buf = vec![0u8; PAGE_SIZE];
        let mut page = internal(&mut buf, 10);
        page.populate_new_root(100, 10, 200);
        page.insert_node_after(200, 20, 300).unwrap();

        let sibling = page.get_sibling(200).unwrap();
        assert!(sibling.on_left);
        assert_eq!(sibling.page_id, 100);
        assert_eq!(sibling.separator, 10);
        assert_eq!(sibling.index, 1);

        // Slot 0 has no left neighbor, so the right one is offered
        let sibling = page.get_sibling(100).unwrap();
        assert!(!sibling.on_left);
        assert_eq!(sibling.page_id, 200);
        assert_eq!(sibling.separator, 10);
        assert_eq!(sibling.index, 1);

        assert!(page.get_sibling(999).is_none());
    }

    #[test]
    fn test_remove_and_return_only_child() {
        let mut buf = vec![0u8; PAGE_SIZE];
        let mut page = internal(&mut buf, 10);
        page.populate_new_root(100, 10, 200);
        page.remove(1);

        assert_eq!(page.remove_and_return_only_child(), 100);
        assert_eq!(page.size(), 0);
    }

    #[test]
    fn test_move_half_to_exposes_separator() {
        let mut left_buf = vec![0u8; PAGE_SIZE];
        let mut right_buf = vec![0u8; PAGE_SIZE];

        let mut left = internal(&mut left_buf, 10);
        left.populate_new_root(1, 10, 2);
        left.insert_node_after(2, 20, 3).unwrap();
        left.insert_node_after(3, 30, 4).unwrap();

        let mut right: BTreeInternalPage<&mut [u8], i64> =
            BTreeInternalPage::init(&mut right_buf[..], 11, INVALID_PAGE_ID, 8);
        left.move_half_to(&mut right);

        assert_eq!(left.size(), 2);
        assert_eq!(right.size(), 2);
        // The first moved key sits in the sentinel slot as the separator
        assert_eq!(right.key_at(0), 20);
        assert_eq!(right.value_at(0), 3);
        assert_eq!(right.value_at(1), 4);
        assert_eq!(right.children_in(0..2), vec![3, 4]);
    }

    #[test]
    fn test_move_all_to_threads_separator() {
        let mut left_buf = vec![0u8; PAGE_SIZE];
        let mut right_buf = vec![0u8; PAGE_SIZE];

        let mut left = internal(&mut left_buf, 10);
        left.populate_new_root(1, 10, 2);
        let mut right: BTreeInternalPage<&mut [u8], i64> =
            BTreeInternalPage::init(&mut right_buf[..], 11, INVALID_PAGE_ID, 8);
        right.populate_new_root(4, 40, 5);

        // Separator between left and right in their parent is 30
        right.move_all_to(&mut left, 30);

        assert_eq!(right.size(), 0);
        assert_eq!(left.size(), 4);
        assert_eq!(left.value_at(2), 4);
        assert_eq!(left.key_at(2), 30);
        assert_eq!(left.key_at(3), 40);
        assert_eq!(left.value_at(3), 5);
    }

    #[test]
    fn test_move_last_to_front_of_restores_separator() {
        let mut left_buf = vec![0u8; PAGE_SIZE];
        let mut right_buf = vec![0u8; PAGE_SIZE];

        let mut left = internal(&mut left_buf, 10);
        left.populate_new_root(1, 10, 2);
        left.insert_node_after(2, 20, 3).unwrap();

        let mut right: BTreeInternalPage<&mut [u8], i64> =
            BTreeInternalPage::init(&mut right_buf[..], 11, INVALID_PAGE_ID, 8);
        right.populate_new_root(4, 40, 5);

        left.move_last_to_front_of(&mut right, 30);

        assert_eq!(left.size(), 2);
        assert_eq!(right.size(), 3);
        assert_eq!(right.value_at(0), 3);
        // The shifted former sentinel child now carries the old separator
        assert_eq!(right.key_at(1), 30);
        assert_eq!(right.value_at(1), 4);
        assert_eq!(right.key_at(2), 40);
        assert_eq!(right.value_at(2), 5);
    }

    #[test]
    fn test_move_first_to_end_of_threads_separator() {
        let mut left_buf = vec![0u8; PAGE_SIZE];
        let mut right_buf = vec![0u8; PAGE_SIZE];

        let mut left = internal(&mut left_buf, 10);
        left.populate_new_root(1, 10, 2);

        let mut right: BTreeInternalPage<&mut [u8], i64> =
            BTreeInternalPage::init(&mut right_buf[..], 11, INVALID_PAGE_ID, 8);
        right.populate_new_root(4, 40, 5);

        right.move_first_to_end_of(&mut left, 30);

        assert_eq!(left.size(), 3);
        assert_eq!(left.value_at(2), 4);
        assert_eq!(left.key_at(2), 30);
        assert_eq!(right.size(), 1);
        assert_eq!(right.value_at(0), 5);
    }
}
