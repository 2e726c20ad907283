// Export public modules
pub mod common;
pub mod concurrency;
pub mod index;
pub mod storage;

// Re-export key items for convenient access
pub use concurrency::lock_manager::LockManager;
pub use concurrency::transaction::{IsolationLevel, Transaction, TransactionState};
pub use index::btree::BTreeIndex;
pub use storage::buffer::BufferPoolError;
pub use storage::buffer::BufferPoolManager;
pub use storage::disk::DiskManager;
