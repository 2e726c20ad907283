mod base;
mod internal;
mod leaf;

pub use base::{
    BTreePage, IndexPageType, COMMON_HEADER_SIZE, INTERNAL_HEADER_SIZE, LEAF_HEADER_SIZE,
};
pub use internal::{BTreeInternalPage, Sibling};
pub use leaf::BTreeLeafPage;
