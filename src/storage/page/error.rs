use thiserror::Error;

#[derive(Error, Debug)]
pub enum PageError {
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("not enough space on the page")]
    InsufficientSpace,
}
