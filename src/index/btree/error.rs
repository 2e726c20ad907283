use thiserror::Error;

use crate::storage::buffer::BufferPoolError;
use crate::storage::page::PageError;

#[derive(Error, Debug)]
pub enum BTreeError {
    #[error("duplicate key")]
    DuplicateKey,

    #[error("index page has invalid format")]
    InvalidPageFormat,

    #[error("invalid tree configuration: {0}")]
    InvalidConfig(String),

    #[error("latch chain invariant violated: {0}")]
    LatchChain(&'static str),

    #[error("buffer pool error: {0}")]
    BufferPool(#[from] BufferPoolError),

    #[error("header page error: {0}")]
    Header(#[from] PageError),
}
