use std::marker::PhantomData;
use std::sync::Arc;

use log::warn;

use crate::common::types::{PageId, PageReadGuard, Rid, INVALID_PAGE_ID};
use crate::index::btree::codec::IndexKey;
use crate::index::btree::page::BTreeLeafPage;
use crate::storage::buffer::BufferPoolManager;

struct LeafPosition {
    page_id: PageId,
    guard: PageReadGuard,
}

/// Forward iterator over the leaf chain.
///
/// Holds exactly one shared-latched, pinned leaf at a time. Stepping off a
/// leaf releases it before the next sibling is latched, and dropping the
/// iterator releases whatever it still holds, so an abandoned scan cannot
/// leak a pin or a latch.
pub struct BTreeIterator<K> {
    buffer_pool: Arc<BufferPoolManager>,
    current: Option<LeafPosition>,
    index: usize,
    _key: PhantomData<K>,
}

impl<K> BTreeIterator<K>
where
    K: IndexKey,
{
    pub(crate) fn new(
        buffer_pool: Arc<BufferPoolManager>,
        page_id: PageId,
        guard: PageReadGuard,
        index: usize,
    ) -> Self {
        Self {
            buffer_pool,
            current: Some(LeafPosition { page_id, guard }),
            index,
            _key: PhantomData,
        }
    }

    /// The exhausted iterator, for an empty tree.
    pub(crate) fn end(buffer_pool: Arc<BufferPoolManager>) -> Self {
        Self {
            buffer_pool,
            current: None,
            index: 0,
            _key: PhantomData,
        }
    }

    fn release_current(&mut self) {
        if let Some(LeafPosition { page_id, guard }) = self.current.take() {
            drop(guard);
            if let Err(e) = self.buffer_pool.unpin_page(page_id, false) {
                warn!("iterator failed to unpin leaf {}: {}", page_id, e);
            }
        }
    }
}

impl<K> Iterator for BTreeIterator<K>
where
    K: IndexKey,
{
    type Item = (K, Rid);

    fn next(&mut self) -> Option<(K, Rid)> {
        loop {
            let next_page_id = {
                let position = self.current.as_ref()?;
                let leaf = BTreeLeafPage::<_, K>::view(&position.guard.data[..]);
                if self.index < leaf.size() {
                    let item = (leaf.key_at(self.index), leaf.value_at(self.index));
                    self.index += 1;
                    return Some(item);
                }
                leaf.next_page_id()
            };

            // Fell off this leaf: release it before touching the sibling.
            self.release_current();
            if next_page_id == INVALID_PAGE_ID {
                return None;
            }

            let page = match self.buffer_pool.fetch_page(next_page_id) {
                Ok(page) => page,
                Err(e) => {
                    warn!("iterator failed to fetch leaf {}: {}", next_page_id, e);
                    return None;
                }
            };
            let guard = page.read_arc();
            self.current = Some(LeafPosition {
                page_id: next_page_id,
                guard,
            });
            self.index = 0;
        }
    }
}

impl<K> Drop for BTreeIterator<K> {
    fn drop(&mut self) {
        if let Some(LeafPosition { page_id, guard }) = self.current.take() {
            drop(guard);
            if let Err(e) = self.buffer_pool.unpin_page(page_id, false) {
                warn!("iterator failed to unpin leaf {}: {}", page_id, e);
            }
        }
    }
}
