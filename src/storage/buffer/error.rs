use thiserror::Error;

use crate::common::types::PageId;
use crate::storage::disk::DiskManagerError;

#[derive(Error, Debug)]
pub enum BufferPoolError {
    #[error("page {0} is not resident in the buffer pool")]
    PageNotResident(PageId),

    #[error("page {0} has no outstanding pins")]
    PinCountZero(PageId),

    #[error("page {0} is pinned")]
    PagePinned(PageId),

    #[error("buffer pool is full")]
    BufferPoolFull,

    #[error("invalid page ID: {0}")]
    InvalidPageId(PageId),

    #[error("disk manager error: {0}")]
    Disk(#[from] DiskManagerError),
}
