use std::fmt::Debug;

use byteorder::{ByteOrder, LittleEndian};

use crate::common::types::{PageId, Rid, PAGE_SIZE};
use crate::index::btree::page::{INTERNAL_HEADER_SIZE, LEAF_HEADER_SIZE};

/// Size of an encoded child page id in an internal page slot.
pub const PAGE_ID_SIZE: usize = 4;

/// Size of an encoded record id in a leaf page slot.
pub const RID_SIZE: usize = 8;

/// A key type the B+-tree can store: totally ordered, copyable, and
/// encodable at a fixed width with little-endian byte order. Implemented
/// for the integer primitives; wider key types plug in the same way.
pub trait IndexKey: Ord + Copy + Default + Debug + Send + Sync + 'static {
    const ENCODED_SIZE: usize;

    fn encode(&self, buf: &mut [u8]);
    fn decode(buf: &[u8]) -> Self;
}

impl IndexKey for i32 {
    const ENCODED_SIZE: usize = 4;

    fn encode(&self, buf: &mut [u8]) {
        LittleEndian::write_i32(buf, *self);
    }

    fn decode(buf: &[u8]) -> Self {
        LittleEndian::read_i32(buf)
    }
}

impl IndexKey for i64 {
    const ENCODED_SIZE: usize = 8;

    fn encode(&self, buf: &mut [u8]) {
        LittleEndian::write_i64(buf, *self);
    }

    fn decode(buf: &[u8]) -> Self {
        LittleEndian::read_i64(buf)
    }
}

impl IndexKey for u32 {
    const ENCODED_SIZE: usize = 4;

    fn encode(&self, buf: &mut [u8]) {
        LittleEndian::write_u32(buf, *self);
    }

    fn decode(buf: &[u8]) -> Self {
        LittleEndian::read_u32(buf)
    }
}

impl IndexKey for u64 {
    const ENCODED_SIZE: usize = 8;

    fn encode(&self, buf: &mut [u8]) {
        LittleEndian::write_u64(buf, *self);
    }

    fn decode(buf: &[u8]) -> Self {
        LittleEndian::read_u64(buf)
    }
}

pub(crate) fn encode_rid(buf: &mut [u8], rid: Rid) {
    LittleEndian::write_i32(&mut buf[0..4], rid.page_id);
    LittleEndian::write_u32(&mut buf[4..8], rid.slot);
}

pub(crate) fn decode_rid(buf: &[u8]) -> Rid {
    Rid {
        page_id: LittleEndian::read_i32(&buf[0..4]),
        slot: LittleEndian::read_u32(&buf[4..8]),
    }
}

pub(crate) fn encode_page_id(buf: &mut [u8], page_id: PageId) {
    LittleEndian::write_i32(buf, page_id);
}

pub(crate) fn decode_page_id(buf: &[u8]) -> PageId {
    LittleEndian::read_i32(buf)
}

/// How many key/rid slots physically fit on a leaf page.
pub fn leaf_capacity<K: IndexKey>() -> usize {
    (PAGE_SIZE - LEAF_HEADER_SIZE) / (K::ENCODED_SIZE + RID_SIZE)
}

/// How many key/child slots physically fit on an internal page.
pub fn internal_capacity<K: IndexKey>() -> usize {
    (PAGE_SIZE - INTERNAL_HEADER_SIZE) / (K::ENCODED_SIZE + PAGE_ID_SIZE)
}
