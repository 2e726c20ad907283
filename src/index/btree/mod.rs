pub mod codec;
pub mod error;
pub mod iterator;
pub mod page;
pub mod tree;

pub use codec::IndexKey;
pub use error::BTreeError;
pub use iterator::BTreeIterator;
pub use tree::BTreeIndex;
